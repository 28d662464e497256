// Datacenter control-plane job executor.
//
// Polls the coordination database for pending jobs, claims them under a
// worker lease, and drives type-specific workflow handlers against remote
// infrastructure: out-of-band server management, hypervisor fleets, and
// ZFS storage appliances. Replication and SLO handlers reschedule
// themselves through the coordinator to form a persistent control loop.

pub mod adapters;
pub mod audit;
pub mod config;
pub mod context;
pub mod coordinator;
pub mod crypto;
pub mod dispatch;
pub mod handlers;
pub mod notify;
pub mod periodic;
pub mod progress;
pub mod schedule;
pub mod session;
pub mod signing;
pub mod testing;

pub use config::Config;
pub use context::ExecutorContext;
