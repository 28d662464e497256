//! Handler registry: job type → handler function.
//!
//! Handlers are plain values (an async function plus metadata) looked up
//! by the dispatcher at claim time. Periodic handlers additionally carry
//! their reschedule interval so the dispatcher can seed them at startup.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Result};

use crate::context::ExecutorContext;
use crate::coordinator::Job;

type HandlerFuture = Pin<Box<dyn Future<Output = Result<()>> + Send>>;
type BoxedHandler = Box<dyn Fn(Job, Arc<ExecutorContext>) -> HandlerFuture + Send + Sync>;

pub struct HandlerEntry {
    handler: BoxedHandler,
    /// Reschedule interval for self-scheduling periodic handlers.
    pub periodic: Option<Duration>,
}

#[derive(Default)]
pub struct HandlerRegistry {
    handlers: HashMap<&'static str, HandlerEntry>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<F, Fut>(&mut self, job_type: &'static str, handler: F)
    where
        F: Fn(Job, Arc<ExecutorContext>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        self.insert(job_type, handler, None);
    }

    pub fn register_periodic<F, Fut>(
        &mut self,
        job_type: &'static str,
        interval: Duration,
        handler: F,
    ) where
        F: Fn(Job, Arc<ExecutorContext>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        self.insert(job_type, handler, Some(interval));
    }

    fn insert<F, Fut>(&mut self, job_type: &'static str, handler: F, periodic: Option<Duration>)
    where
        F: Fn(Job, Arc<ExecutorContext>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        let boxed: BoxedHandler = Box::new(move |job, ctx| Box::pin(handler(job, ctx)));
        self.handlers.insert(
            job_type,
            HandlerEntry {
                handler: boxed,
                periodic,
            },
        );
    }

    pub fn is_registered(&self, job_type: &str) -> bool {
        self.handlers.contains_key(job_type)
    }

    pub fn get(&self, job_type: &str) -> Option<&HandlerEntry> {
        self.handlers.get(job_type)
    }

    /// Run the handler for a job. The handler owns the job's terminal
    /// state; an `Err` here is the unexpected-programmer-error path.
    pub async fn execute(&self, job: Job, ctx: Arc<ExecutorContext>) -> Result<()> {
        let entry = self
            .handlers
            .get(job.job_type.as_str())
            .ok_or_else(|| anyhow!("no handler registered for job type {:?}", job.job_type))?;
        (entry.handler)(job, ctx).await
    }

    pub fn registered_types(&self) -> Vec<&'static str> {
        let mut types: Vec<&'static str> = self.handlers.keys().copied().collect();
        types.sort_unstable();
        types
    }

    /// The periodic job types and their intervals.
    pub fn periodic_types(&self) -> Vec<(&'static str, Duration)> {
        let mut periodic: Vec<(&'static str, Duration)> = self
            .handlers
            .iter()
            .filter_map(|(ty, entry)| entry.periodic.map(|interval| (*ty, interval)))
            .collect();
        periodic.sort_unstable_by_key(|(ty, _)| *ty);
        periodic
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_register_and_lookup() {
        let mut registry = HandlerRegistry::new();
        registry.register("power_action", |_job, _ctx| async { Ok(()) });
        registry.register_periodic(
            "rpo_monitoring",
            Duration::from_secs(300),
            |_job, _ctx| async { Ok(()) },
        );

        assert!(registry.is_registered("power_action"));
        assert!(!registry.is_registered("unknown"));
        assert_eq!(
            registry.periodic_types(),
            vec![("rpo_monitoring", Duration::from_secs(300))]
        );
        assert_eq!(
            registry.registered_types(),
            vec!["power_action", "rpo_monitoring"]
        );
    }
}
