//! The dispatch loop.
//!
//! Brings jobs from `pending` to a terminal state exactly once each,
//! despite concurrent executors and crashes:
//!
//! - **Poll** the coordinator on a fixed interval for eligible pending jobs.
//! - **Claim** each candidate with a compare-and-set keyed on
//!   `status = pending`; zero rows changed means another worker won.
//! - **Dispatch** to the registered handler on a bounded worker pool. The
//!   handler owns the terminal state; a handler that returns without one
//!   is marked failed, as is an unknown job type.
//! - **Recover** at startup: running jobs still owned by this worker id
//!   are orphans from a previous incarnation and are failed with
//!   `auto_recovered = true`.
//!
//! Coordinator outages back off with a fixed short delay; nothing is lost
//! because nothing was claimed.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use chrono::Utc;
use serde_json::json;
use tokio::sync::Semaphore;
use tracing::{debug, error, info, warn};

use super::registry::HandlerRegistry;
use crate::context::ExecutorContext;
use crate::coordinator::{Job, JobStatus};
use crate::periodic;

/// Fixed delay after a failed coordinator poll.
const POLL_ERROR_BACKOFF: Duration = Duration::from_secs(1);

#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    pub poll_interval: Duration,
    /// Candidates fetched per poll.
    pub batch_size: usize,
    /// Bounded worker pool: handlers running in parallel.
    pub worker_pool_size: usize,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(5),
            batch_size: 10,
            worker_pool_size: 4,
        }
    }
}

pub struct Dispatcher {
    ctx: Arc<ExecutorContext>,
    registry: Arc<HandlerRegistry>,
    config: DispatcherConfig,
    shutdown: Arc<AtomicBool>,
}

impl Dispatcher {
    pub fn new(ctx: Arc<ExecutorContext>, registry: Arc<HandlerRegistry>) -> Self {
        let config = DispatcherConfig {
            poll_interval: ctx.config.poll_interval,
            worker_pool_size: ctx.config.worker_pool_size,
            ..Default::default()
        };
        Self::with_config(ctx, registry, config)
    }

    pub fn with_config(
        ctx: Arc<ExecutorContext>,
        registry: Arc<HandlerRegistry>,
        config: DispatcherConfig,
    ) -> Self {
        Self {
            ctx,
            registry,
            config,
            shutdown: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn shutdown_handle(&self) -> Arc<AtomicBool> {
        self.shutdown.clone()
    }

    pub fn request_shutdown(&self) {
        self.shutdown.store(true, Ordering::SeqCst);
    }

    fn is_shutdown_requested(&self) -> bool {
        self.shutdown.load(Ordering::SeqCst)
    }

    /// Fail orphaned `running` jobs left behind by a previous incarnation
    /// of this worker. Returns how many were recovered.
    pub async fn recover_orphans(&self) -> Result<usize> {
        let orphans = self
            .ctx
            .coordinator
            .running_jobs_for_worker(self.ctx.worker_id())
            .await?;
        let count = orphans.len();
        for job in orphans {
            warn!(job_id = %job.id, job_type = %job.job_type, "recovering orphaned job");
            self.ctx
                .set_status(
                    job.id,
                    JobStatus::Failed,
                    Some(json!({
                        "error": "Executor restarted while job was running",
                        "auto_recovered": true,
                    })),
                    Some("Executor restarted while job was running"),
                )
                .await?;
        }
        Ok(count)
    }

    /// Make sure every periodic handler has a scheduled run, reaping any
    /// stale runner first. Called at startup so a fresh system goes live
    /// within one interval.
    pub async fn seed_periodics(&self) -> Result<()> {
        for (job_type, interval) in self.registry.periodic_types() {
            periodic::ensure_successor(&self.ctx, job_type, interval, None).await?;
        }
        Ok(())
    }

    /// One poll/claim/dispatch round. Spawned handler tasks are returned
    /// to the caller via the semaphore; this function does not wait for
    /// them to finish.
    async fn poll_round(&self, semaphore: &Arc<Semaphore>) -> Result<usize> {
        let jobs = self
            .ctx
            .coordinator
            .fetch_ready_jobs(Utc::now(), self.config.batch_size)
            .await?;

        if jobs.is_empty() {
            return Ok(0);
        }
        debug!(count = jobs.len(), "found eligible pending jobs");

        let mut claimed = 0;
        for job in jobs {
            if self.is_shutdown_requested() {
                break;
            }

            // Pool slot first; claiming without capacity would let a job
            // sit `running` while it waits for a worker.
            let permit = semaphore
                .clone()
                .acquire_owned()
                .await
                .expect("worker pool semaphore closed");

            match self
                .ctx
                .coordinator
                .try_claim(job.id, self.ctx.worker_id(), Utc::now())
                .await
            {
                Ok(true) => {
                    claimed += 1;
                    let ctx = self.ctx.clone();
                    let registry = self.registry.clone();
                    tokio::spawn(async move {
                        run_job(ctx, registry, job).await;
                        drop(permit);
                    });
                }
                Ok(false) => {
                    // Another worker won the race.
                    debug!(job_id = %job.id, "lost claim race");
                    drop(permit);
                }
                Err(e) => {
                    // Never fail a job for a coordinator error on the claim
                    // path; it stays pending for the next poll.
                    warn!(job_id = %job.id, error = %e, "claim attempt failed");
                    drop(permit);
                }
            }
        }
        Ok(claimed)
    }

    /// Run the dispatch loop until shutdown is requested.
    pub async fn run(self) -> Result<()> {
        info!(
            worker_id = %self.ctx.worker_id(),
            pool_size = self.config.worker_pool_size,
            poll_interval_ms = self.config.poll_interval.as_millis() as u64,
            "dispatcher starting"
        );

        let semaphore = Arc::new(Semaphore::new(self.config.worker_pool_size));

        loop {
            if self.is_shutdown_requested() {
                break;
            }

            match self.poll_round(&semaphore).await {
                Ok(0) => tokio::time::sleep(self.config.poll_interval).await,
                Ok(_) => {}
                Err(e) => {
                    error!(error = %e, "poll failed; backing off");
                    tokio::time::sleep(POLL_ERROR_BACKOFF).await;
                }
            }
        }

        // Drain: wait for in-flight handlers by taking every pool slot.
        let _ = semaphore
            .acquire_many(self.config.worker_pool_size as u32)
            .await;
        info!(worker_id = %self.ctx.worker_id(), "dispatcher stopped");
        Ok(())
    }

    /// Run until SIGINT.
    pub async fn run_until_shutdown(self) -> Result<()> {
        let shutdown = self.shutdown_handle();
        tokio::spawn(async move {
            let _ = tokio::signal::ctrl_c().await;
            info!("received shutdown signal");
            shutdown.store(true, Ordering::SeqCst);
        });
        self.run().await
    }
}

/// Execute one claimed job and enforce the terminal-state contract.
pub async fn run_job(ctx: Arc<ExecutorContext>, registry: Arc<HandlerRegistry>, job: Job) {
    let job_id = job.id;
    let job_type = job.job_type.clone();
    debug!(job_id = %job_id, job_type = %job_type, "dispatching job");

    if !registry.is_registered(&job_type) {
        let message = format!("No handler registered for job type {job_type:?}");
        error!(job_id = %job_id, job_type = %job_type, "unknown job type");
        fail_job(&ctx, job_id, &message).await;
        return;
    }

    match registry.execute(job, ctx.clone()).await {
        Ok(()) => {
            // The handler is responsible for its own terminal state.
            match ctx.coordinator.get_job(job_id).await {
                Ok(Some(current)) if !current.status.is_terminal() => {
                    warn!(job_id = %job_id, job_type = %job_type, "handler did not terminate job");
                    fail_job(&ctx, job_id, "handler did not terminate job").await;
                }
                Ok(_) => info!(job_id = %job_id, job_type = %job_type, "job finished"),
                Err(e) => {
                    warn!(job_id = %job_id, error = %e, "could not verify terminal state")
                }
            }
        }
        Err(e) => {
            // Unexpected programmer error escaped the handler boundary.
            error!(job_id = %job_id, job_type = %job_type, error = ?e, "handler error");
            fail_job(&ctx, job_id, &format!("Unexpected error: {e:#}")).await;
        }
    }
}

async fn fail_job(ctx: &ExecutorContext, job_id: uuid::Uuid, message: &str) {
    if let Err(e) = ctx
        .set_status(
            job_id,
            JobStatus::Failed,
            Some(json!({ "error": message })),
            Some(message),
        )
        .await
    {
        error!(job_id = %job_id, error = %e, "failed to mark job as failed");
    }
}
