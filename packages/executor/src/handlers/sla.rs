//! SLO monitoring for protection groups: the scheduled replication sweep
//! and the RPO monitor. Both are self-scheduling periodics: each run's
//! last act, on success and on failure, is to make sure a successor
//! exists (see [`crate::periodic`]).

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use chrono::Utc;
use serde_json::json;
use uuid::Uuid;

use super::{common, replication};
use crate::context::{ExecutorContext, Workflow};
use crate::coordinator::{Job, NewJob, ProtectionGroupRecord};
use crate::periodic;
use crate::schedule::ReplicationSchedule;

/// The sweep looks for due groups every minute.
pub const SWEEP_INTERVAL: Duration = Duration::from_secs(60);
/// RPO compliance is evaluated every five minutes.
pub const MONITOR_INTERVAL: Duration = Duration::from_secs(300);

const SYNC_JOB_TYPE: &str = "run_replication_sync";

/// `scheduled_replication_check`: create one `run_replication_sync` job
/// for every enabled, unpaused group whose schedule says it is due and
/// that is not already syncing.
pub async fn scheduled_replication_check(job: Job, ctx: Arc<ExecutorContext>) -> Result<()> {
    let mut wf = Workflow::begin(&ctx, &job).await?;

    let outcome = run_sweep(&mut wf, &ctx).await;
    let terminal = match outcome {
        Ok(()) => wf.complete().await,
        Err(e) => wf.fail(&format!("{e:#}")).await,
    };

    // Reschedule even on failure so the control loop never stops.
    periodic::ensure_successor(&ctx, &job.job_type, SWEEP_INTERVAL, Some(job.id)).await?;
    terminal
}

async fn run_sweep(wf: &mut Workflow, ctx: &Arc<ExecutorContext>) -> Result<()> {
    wf.phase("sweep", 10).await?;
    let groups = ctx.coordinator.eligible_protection_groups().await?;
    let now = Utc::now();

    let mut triggered: Vec<String> = Vec::new();
    let mut skipped: Vec<serde_json::Value> = Vec::new();

    for group in &groups {
        let Some(schedule_text) = group.replication_schedule.as_deref() else {
            skipped.push(json!({ "name": group.name, "reason": "no schedule configured" }));
            continue;
        };

        // The schedule grammar is closed; an unrecognized schedule is an
        // operator-visible validation problem, never a default interval.
        let schedule = match ReplicationSchedule::parse(schedule_text) {
            Ok(schedule) => schedule,
            Err(e) => {
                skipped.push(json!({ "name": group.name, "reason": format!("unrecognized schedule: {e}") }));
                wf.env
                    .warn(format!("{}: {e} (group needs a valid schedule)", group.name));
                continue;
            }
        };

        if group.sync_in_progress.unwrap_or(false) {
            skipped.push(json!({ "name": group.name, "reason": "sync in progress" }));
            continue;
        }
        if !schedule.is_due(group.last_replication_at, now) {
            skipped.push(json!({ "name": group.name, "reason": "not due" }));
            continue;
        }
        if has_live_sync_job(ctx, group.id).await? {
            skipped.push(json!({ "name": group.name, "reason": "sync job already queued" }));
            continue;
        }

        ctx.coordinator
            .insert_job(
                NewJob::pending(SYNC_JOB_TYPE)
                    .details(json!({
                        "protection_group_id": group.id,
                        "triggered_by": "scheduled_replication_check",
                        "auto_scheduled": true,
                    }))
                    .created_by(group.created_by),
            )
            .await?;
        ctx.coordinator
            .patch_protection_group(
                group.id,
                json!({ "next_scheduled_sync": schedule.next_after(now) }),
            )
            .await?;
        triggered.push(group.name.clone());
        wf.info(&format!("Triggered scheduled sync for {}", group.name)).await;
    }

    wf.env.set("groups_checked", json!(groups.len()));
    wf.env.set("triggered_syncs", json!(triggered));
    wf.env.set("skipped", json!(skipped));
    wf.info(&format!(
        "Scheduled check complete: {} triggered, {} skipped",
        triggered.len(),
        skipped.len()
    ))
    .await;
    Ok(())
}

/// A pending/running sync job already targeting this group.
async fn has_live_sync_job(ctx: &Arc<ExecutorContext>, group_id: Uuid) -> Result<bool> {
    let jobs = ctx
        .coordinator
        .jobs_of_type(SYNC_JOB_TYPE, &["pending", "running"])
        .await?;
    Ok(jobs.iter().any(|job| {
        job.detail_str("protection_group_id") == Some(group_id.to_string().as_str())
    }))
}

/// `rpo_monitoring`: classify every group against its RPO target, keep
/// the `sla_violations` ledger deduplicated, and send one batch alert for
/// newly opened violations.
pub async fn rpo_monitoring(job: Job, ctx: Arc<ExecutorContext>) -> Result<()> {
    let mut wf = Workflow::begin(&ctx, &job).await?;

    let outcome = run_monitor(&mut wf, &ctx).await;
    let terminal = match outcome {
        Ok(()) => wf.complete().await,
        Err(e) => wf.fail(&format!("{e:#}")).await,
    };

    periodic::ensure_successor(&ctx, &job.job_type, MONITOR_INTERVAL, Some(job.id)).await?;
    terminal
}

async fn run_monitor(wf: &mut Workflow, ctx: &Arc<ExecutorContext>) -> Result<()> {
    wf.phase("evaluate", 10).await?;
    let groups = ctx.coordinator.all_protection_groups().await?;
    let now = Utc::now();

    let mut rpo_violations: Vec<serde_json::Value> = Vec::new();
    let mut test_overdue: Vec<serde_json::Value> = Vec::new();

    for group in &groups {
        let is_paused = group.paused_at.is_some();
        let current_rpo = replication::current_rpo_seconds(group.last_replication_at, now);
        let target_minutes = group.rpo_minutes.unwrap_or(60);
        let status = classify_rpo(is_paused, current_rpo, target_minutes);

        ctx.coordinator
            .patch_protection_group(
                group.id,
                json!({ "current_rpo_seconds": current_rpo, "status": status }),
            )
            .await?;

        if group.is_enabled && !is_paused && status == "not_meeting_sla" {
            let severity = if current_rpo > target_minutes * 120 {
                "critical"
            } else {
                "warning"
            };
            let violation = json!({
                "group_id": group.id,
                "group_name": group.name,
                "current_rpo_minutes": current_rpo / 60,
                "target_rpo_minutes": target_minutes,
                "severity": severity,
            });
            // Alerts cover newly-opened violations only; a breach that was
            // already on the ledger stays silent until it resolves.
            if record_violation(ctx, group.id, "rpo_breach", &violation, severity).await? {
                rpo_violations.push(violation);
            }
        } else {
            ctx.coordinator.resolve_violations(group.id, "rpo_breach").await?;
        }

        // Failover-test reminders run for every group, paused included.
        if let Some(reminder_days) = group.test_reminder_days {
            if test_is_overdue(group, reminder_days, now) {
                let violation = json!({
                    "group_id": group.id,
                    "group_name": group.name,
                    "reminder_days": reminder_days,
                    "last_test_at": group.last_test_at,
                });
                if record_violation(ctx, group.id, "test_overdue", &violation, "warning").await? {
                    test_overdue.push(violation);
                }
            } else {
                ctx.coordinator.resolve_violations(group.id, "test_overdue").await?;
            }
        }
    }

    wf.phase("notify", 80).await?;
    for (alert_type, violations) in [
        ("rpo_breach", &rpo_violations),
        ("test_overdue", &test_overdue),
    ] {
        if violations.is_empty() {
            continue;
        }
        let payload = json!({
            "notification_type": "sla_violation_alert",
            "alert_type": alert_type,
            "violations": violations,
            "summary": format!(
                "{} protection group(s) have {} issues",
                violations.len(),
                alert_type.replace('_', " ")
            ),
        });
        match ctx.notifier.send(&payload).await {
            Ok(()) => {
                for violation in violations.iter() {
                    if let Some(group_id) = violation
                        .get("group_id")
                        .and_then(|v| v.as_str())
                        .and_then(|s| Uuid::parse_str(s).ok())
                    {
                        ctx.coordinator
                            .mark_violations_notified(group_id, alert_type)
                            .await
                            .ok();
                    }
                }
                wf.info(&format!("Alert sent for {} {alert_type} violation(s)", violations.len()))
                    .await;
            }
            Err(e) => wf.env.warn(format!("could not send {alert_type} alert: {e:#}")),
        }
    }

    wf.env.set("groups_checked", json!(groups.len()));
    wf.env.set("rpo_violations", json!(rpo_violations.len()));
    wf.env.set("test_overdue", json!(test_overdue.len()));
    Ok(())
}

/// SLA status for a group: warning up to 1.5× target, breach beyond.
pub fn classify_rpo(is_paused: bool, current_rpo_seconds: i64, target_minutes: i64) -> &'static str {
    if is_paused {
        return "paused";
    }
    let target_seconds = target_minutes * 60;
    if current_rpo_seconds <= target_seconds {
        "meeting_sla"
    } else if current_rpo_seconds * 2 <= target_seconds * 3 {
        "warning"
    } else {
        "not_meeting_sla"
    }
}

fn test_is_overdue(
    group: &ProtectionGroupRecord,
    reminder_days: i64,
    now: chrono::DateTime<Utc>,
) -> bool {
    let reference = group.last_test_at.or(group.created_at);
    match reference {
        Some(reference) => (now - reference).num_days() > reminder_days,
        None => true,
    }
}

/// Open a violation row unless one of the same type is already open for
/// the group, which is the dedup invariant the monitor relies on. Returns whether
/// a new row was opened.
async fn record_violation(
    ctx: &Arc<ExecutorContext>,
    group_id: Uuid,
    violation_type: &str,
    details: &serde_json::Value,
    severity: &str,
) -> Result<bool> {
    if !ctx.coordinator.open_violations(group_id, violation_type).await?.is_empty() {
        return Ok(false);
    }
    ctx.coordinator
        .insert_violation(group_id, violation_type, severity, details.clone())
        .await?;
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coordinator::JobStatus;
    use crate::testing::{seed_running_job, test_context, TestHarness};
    use chrono::Duration as ChronoDuration;

    fn seed_group(
        harness: &TestHarness,
        name: &str,
        schedule: Option<&str>,
        last_replication_minutes_ago: Option<i64>,
        rpo_minutes: i64,
    ) -> Uuid {
        let id = Uuid::new_v4();
        let last = last_replication_minutes_ago
            .map(|minutes| Utc::now() - ChronoDuration::minutes(minutes));
        harness.coordinator.seed(
            "protection_groups",
            json!({
                "id": id,
                "name": name,
                "is_enabled": true,
                "replication_schedule": schedule,
                "last_replication_at": last,
                "rpo_minutes": rpo_minutes,
            }),
        );
        id
    }

    fn sync_jobs_for(harness: &TestHarness, group_id: Uuid) -> Vec<serde_json::Value> {
        harness
            .coordinator
            .rows("jobs")
            .into_iter()
            .filter(|row| {
                row["job_type"] == "run_replication_sync"
                    && row["details"]["protection_group_id"] == json!(group_id)
            })
            .collect()
    }

    #[tokio::test]
    async fn test_sweep_triggers_due_group_exactly_once() {
        let (ctx, harness) = test_context("w1");
        let group_id = seed_group(&harness, "crm", Some("*/15 * * * *"), Some(20), 15);

        let job = seed_running_job(&ctx, "scheduled_replication_check", json!({}), json!({})).await;
        scheduled_replication_check(job.clone(), ctx.clone()).await.unwrap();

        assert_eq!(sync_jobs_for(&harness, group_id).len(), 1);
        let done = ctx.coordinator.get_job(job.id).await.unwrap().unwrap();
        assert_eq!(done.status, JobStatus::Completed);

        // Re-running the sweep inside the same window creates no second
        // job: the first one is still pending for the group.
        let job2 = seed_running_job(&ctx, "scheduled_replication_check", json!({}), json!({})).await;
        scheduled_replication_check(job2, ctx.clone()).await.unwrap();
        assert_eq!(sync_jobs_for(&harness, group_id).len(), 1);

        // The group's next sync is on the books.
        let group = harness.coordinator.row_by_id("protection_groups", group_id).unwrap();
        assert!(group["next_scheduled_sync"].is_string());
    }

    #[tokio::test]
    async fn test_sweep_skips_not_due_and_unrecognized_schedules() {
        let (ctx, harness) = test_context("w1");
        let fresh = seed_group(&harness, "fresh", Some("*/15 * * * *"), Some(5), 15);
        let broken = seed_group(&harness, "broken", Some("whenever"), Some(500), 15);

        let job = seed_running_job(&ctx, "scheduled_replication_check", json!({}), json!({})).await;
        scheduled_replication_check(job.clone(), ctx.clone()).await.unwrap();

        assert!(sync_jobs_for(&harness, fresh).is_empty());
        assert!(sync_jobs_for(&harness, broken).is_empty());

        let done = ctx.coordinator.get_job(job.id).await.unwrap().unwrap();
        let details = done.details.unwrap();
        let reasons: Vec<String> = details["skipped"]
            .as_array()
            .unwrap()
            .iter()
            .map(|s| s["reason"].as_str().unwrap().to_string())
            .collect();
        assert!(reasons.iter().any(|r| r == "not due"));
        assert!(reasons.iter().any(|r| r.contains("unrecognized schedule")));
    }

    #[tokio::test]
    async fn test_sweep_schedules_successor_even_on_failure_path() {
        let (ctx, harness) = test_context("w1");

        let job = seed_running_job(&ctx, "scheduled_replication_check", json!({}), json!({})).await;
        scheduled_replication_check(job.clone(), ctx.clone()).await.unwrap();

        let successors: Vec<serde_json::Value> = harness
            .coordinator
            .rows("jobs")
            .into_iter()
            .filter(|row| {
                row["job_type"] == "scheduled_replication_check" && row["status"] == "pending"
            })
            .collect();
        assert_eq!(successors.len(), 1);
        assert_eq!(successors[0]["details"]["auto_rescheduled"], true);
    }

    #[tokio::test]
    async fn test_stale_running_periodic_is_reaped_before_successor() {
        let (ctx, harness) = test_context("w1");

        // A runner that died 15 minutes into a 10-minute budget.
        let stale_id = Uuid::new_v4();
        harness.coordinator.seed(
            "jobs",
            json!({
                "id": stale_id,
                "job_type": "scheduled_replication_check",
                "status": "running",
                "started_at": Utc::now() - ChronoDuration::minutes(15),
                "worker_id": "w-dead",
            }),
        );

        let job = seed_running_job(&ctx, "scheduled_replication_check", json!({}), json!({})).await;
        scheduled_replication_check(job.clone(), ctx.clone()).await.unwrap();

        // The stale row was force-failed and marked auto-recovered.
        let stale = harness.coordinator.row_by_id("jobs", stale_id).unwrap();
        assert_eq!(stale["status"], "failed");
        assert_eq!(stale["details"]["auto_recovered"], true);

        // And a pending successor exists anyway.
        let successors = harness
            .coordinator
            .rows("jobs")
            .into_iter()
            .filter(|row| {
                row["job_type"] == "scheduled_replication_check" && row["status"] == "pending"
            })
            .count();
        assert_eq!(successors, 1);
    }

    #[tokio::test]
    async fn test_monitor_dedups_violations_and_notifies_once() {
        let (ctx, harness) = test_context("w1");
        // Breaching: last replication 100 minutes ago against a 15-minute
        // target (> 1.5×).
        let group_id = seed_group(&harness, "crm", Some("*/15 * * * *"), Some(100), 15);

        let job = seed_running_job(&ctx, "rpo_monitoring", json!({}), json!({})).await;
        rpo_monitoring(job, ctx.clone()).await.unwrap();

        let open: Vec<serde_json::Value> = harness
            .coordinator
            .rows("sla_violations")
            .into_iter()
            .filter(|row| row["resolved_at"].is_null())
            .collect();
        assert_eq!(open.len(), 1);
        assert_eq!(open[0]["violation_type"], "rpo_breach");
        assert_eq!(open[0]["notification_sent"], true);
        assert_eq!(harness.notifier.sent().len(), 1);

        // Second pass over the still-breaching group: still exactly one
        // open row, and no duplicate alert for an already-notified row.
        let job2 = seed_running_job(&ctx, "rpo_monitoring", json!({}), json!({})).await;
        rpo_monitoring(job2, ctx.clone()).await.unwrap();

        let open_after: Vec<serde_json::Value> = harness
            .coordinator
            .rows("sla_violations")
            .into_iter()
            .filter(|row| row["resolved_at"].is_null())
            .collect();
        assert_eq!(open_after.len(), 1);
        assert_eq!(harness.notifier.sent().len(), 1, "no repeat alert for an open violation");

        let group = harness.coordinator.row_by_id("protection_groups", group_id).unwrap();
        assert_eq!(group["status"], "not_meeting_sla");
    }

    #[tokio::test]
    async fn test_monitor_resolves_cleared_violations() {
        let (ctx, harness) = test_context("w1");
        let group_id = seed_group(&harness, "crm", Some("*/15 * * * *"), Some(100), 15);

        let job = seed_running_job(&ctx, "rpo_monitoring", json!({}), json!({})).await;
        rpo_monitoring(job, ctx.clone()).await.unwrap();
        assert_eq!(harness.coordinator.rows("sla_violations").len(), 1);

        // Replication catches up; the next pass resolves the open row.
        harness.coordinator.patch_sync(
            "protection_groups",
            group_id,
            json!({ "last_replication_at": Utc::now() }),
        );
        let job2 = seed_running_job(&ctx, "rpo_monitoring", json!({}), json!({})).await;
        rpo_monitoring(job2, ctx.clone()).await.unwrap();

        let rows = harness.coordinator.rows("sla_violations");
        assert_eq!(rows.len(), 1);
        assert!(rows[0]["resolved_at"].is_string());

        let group = harness.coordinator.row_by_id("protection_groups", group_id).unwrap();
        assert_eq!(group["status"], "meeting_sla");
    }

    #[test]
    fn test_classify_rpo_bands() {
        assert_eq!(classify_rpo(true, 0, 15), "paused");
        assert_eq!(classify_rpo(false, 800, 15), "meeting_sla");
        assert_eq!(classify_rpo(false, 900, 15), "meeting_sla");
        assert_eq!(classify_rpo(false, 1200, 15), "warning");
        assert_eq!(classify_rpo(false, 1350, 15), "warning");
        assert_eq!(classify_rpo(false, 1351, 15), "not_meeting_sla");
    }
}
