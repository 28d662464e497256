//! Self-scheduling periodic jobs.
//!
//! The two monitoring workloads (scheduled replication sweep, SLO monitor)
//! run forever by inserting their own successor before finishing, on
//! success and on failure alike. [`ensure_successor`] gives the
//! at-least-one-runner invariant without duplicates: stale `running` rows
//! are reaped first, a live row suppresses the insert, and otherwise one
//! `pending` row is created at `now + interval`.

use std::time::Duration;

use anyhow::Result;
use chrono::Utc;
use serde_json::json;
use tracing::{info, warn};
use uuid::Uuid;

use crate::context::ExecutorContext;
use crate::coordinator::{Filter, JobStatus, NewJob};

/// Reap stale runners and schedule the next run of `job_type` unless a
/// valid `pending`/`running` row already exists. `exclude` skips the
/// caller's own row. Returns whether a successor was inserted.
pub async fn ensure_successor(
    ctx: &ExecutorContext,
    job_type: &str,
    interval: Duration,
    exclude: Option<Uuid>,
) -> Result<bool> {
    let stale_after = ctx.config.stale_running_timeout;
    let now = Utc::now();

    let existing = ctx
        .coordinator
        .jobs_of_type(job_type, &["pending", "running"])
        .await?;

    let mut has_live = false;
    for job in existing {
        if exclude == Some(job.id) {
            continue;
        }

        let stale = job.status == JobStatus::Running
            && job
                .started_at
                .map(|at| now - at > chrono::Duration::from_std(stale_after).unwrap_or_default())
                .unwrap_or(false);

        if stale {
            // Dead runner from a crashed executor; force it terminal so the
            // successor can be scheduled.
            warn!(job_id = %job.id, job_type, "recovering stale running job");
            ctx.merge_details(
                job.id,
                &json!({
                    "error": format!(
                        "Job exceeded {}s maximum runtime",
                        stale_after.as_secs()
                    ),
                    "auto_recovered": true,
                }),
            )
            .await?;
            // Keyed on `running` so only one executor wins the reap.
            ctx.coordinator
                .api()
                .patch(
                    "jobs",
                    &[Filter::eq("id", job.id), Filter::eq("status", "running")],
                    json!({
                        "status": "failed",
                        "completed_at": now,
                        "error": format!(
                            "Job exceeded {}s maximum runtime",
                            stale_after.as_secs()
                        ),
                    }),
                )
                .await?;
            continue;
        }

        has_live = true;
    }

    if has_live {
        return Ok(false);
    }

    let next_run = now + chrono::Duration::from_std(interval).unwrap_or_default();
    ctx.coordinator
        .insert_job(
            NewJob::pending(job_type)
                .scheduled_at(next_run)
                .details(json!({
                    "is_internal": true,
                    "interval_seconds": interval.as_secs(),
                    "auto_rescheduled": true,
                })),
        )
        .await?;
    info!(job_type, in_seconds = interval.as_secs(), "scheduled periodic successor");
    Ok(true)
}
