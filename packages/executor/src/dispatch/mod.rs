//! Job dispatch: poll, claim, route, recover.

pub mod dispatcher;
pub mod registry;

pub use dispatcher::{Dispatcher, DispatcherConfig};
pub use registry::{HandlerEntry, HandlerRegistry};
