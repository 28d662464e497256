//! End-to-end dispatch lifecycle against the in-memory coordinator:
//! claim semantics, terminal-state enforcement, crash recovery, and
//! periodic liveness.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde_json::json;
use uuid::Uuid;

use executor_core::context::Workflow;
use executor_core::coordinator::{Coordinator, CoordinatorApi, Filter, JobStatus, NewJob};
use executor_core::dispatch::{dispatcher::run_job, Dispatcher, HandlerRegistry};
use executor_core::periodic;
use executor_core::testing::{test_context, InMemoryCoordinator};

#[tokio::test]
async fn test_two_executors_claim_a_job_exactly_once() {
    // Both executors share one coordinator, as in production.
    let store = Arc::new(InMemoryCoordinator::new());
    let coordinator = Coordinator::new(store.clone() as Arc<dyn CoordinatorApi>);

    let job = coordinator
        .insert_job(NewJob::pending("power_action"))
        .await
        .unwrap();

    let mut claims = Vec::new();
    for worker in ["executor-a", "executor-b"] {
        let coordinator = coordinator.clone();
        let job_id = job.id;
        claims.push(tokio::spawn(async move {
            coordinator.try_claim(job_id, worker, Utc::now()).await.unwrap()
        }));
    }
    let results: Vec<bool> = futures::future::join_all(claims)
        .await
        .into_iter()
        .map(|r| r.unwrap())
        .collect();

    assert_eq!(
        results.iter().filter(|won| **won).count(),
        1,
        "exactly one executor wins the compare-and-set"
    );

    // started_at was set exactly once.
    let claimed = coordinator.get_job(job.id).await.unwrap().unwrap();
    assert!(claimed.started_at.is_some());
    assert_eq!(claimed.status, JobStatus::Running);
}

#[tokio::test]
async fn test_terminal_status_is_never_overwritten() {
    let (ctx, _harness) = test_context("w1");
    let job = ctx
        .coordinator
        .insert_job(NewJob::pending("power_action"))
        .await
        .unwrap();
    ctx.coordinator
        .try_claim(job.id, "w1", Utc::now())
        .await
        .unwrap();

    ctx.set_status(job.id, JobStatus::Completed, None, None)
        .await
        .unwrap();

    // A late writer (stale handler, crashed-and-restarted worker) cannot
    // move the job out of its terminal state.
    ctx.set_status(job.id, JobStatus::Failed, None, Some("late failure"))
        .await
        .unwrap();
    let current = ctx.coordinator.get_job(job.id).await.unwrap().unwrap();
    assert_eq!(current.status, JobStatus::Completed);
    assert!(current.error.is_none());
}

#[tokio::test]
async fn test_unknown_job_type_fails_with_diagnostic() {
    let (ctx, _harness) = test_context("w1");
    let registry = Arc::new(HandlerRegistry::new());

    let job = ctx
        .coordinator
        .insert_job(NewJob::pending("definitely_not_registered"))
        .await
        .unwrap();
    ctx.coordinator
        .try_claim(job.id, "w1", Utc::now())
        .await
        .unwrap();
    let claimed = ctx.coordinator.get_job(job.id).await.unwrap().unwrap();

    run_job(ctx.clone(), registry, claimed).await;

    let done = ctx.coordinator.get_job(job.id).await.unwrap().unwrap();
    assert_eq!(done.status, JobStatus::Failed);
    assert!(done
        .error
        .unwrap()
        .contains("No handler registered for job type"));
}

#[tokio::test]
async fn test_handler_that_does_not_terminate_is_failed() {
    let (ctx, _harness) = test_context("w1");
    let mut registry = HandlerRegistry::new();
    // Misbehaving handler: returns Ok without setting a terminal status.
    registry.register("noop", |_job, _ctx| async { Ok(()) });
    let registry = Arc::new(registry);

    let job = ctx.coordinator.insert_job(NewJob::pending("noop")).await.unwrap();
    ctx.coordinator
        .try_claim(job.id, "w1", Utc::now())
        .await
        .unwrap();
    let claimed = ctx.coordinator.get_job(job.id).await.unwrap().unwrap();

    run_job(ctx.clone(), registry, claimed).await;

    let done = ctx.coordinator.get_job(job.id).await.unwrap().unwrap();
    assert_eq!(done.status, JobStatus::Failed);
    assert_eq!(done.error.as_deref(), Some("handler did not terminate job"));
}

#[tokio::test]
async fn test_handler_error_becomes_unexpected_error() {
    let (ctx, _harness) = test_context("w1");
    let mut registry = HandlerRegistry::new();
    registry.register("explode", |_job, _ctx| async {
        anyhow::bail!("index out of range")
    });
    let registry = Arc::new(registry);

    let job = ctx.coordinator.insert_job(NewJob::pending("explode")).await.unwrap();
    ctx.coordinator
        .try_claim(job.id, "w1", Utc::now())
        .await
        .unwrap();
    let claimed = ctx.coordinator.get_job(job.id).await.unwrap().unwrap();

    run_job(ctx.clone(), registry, claimed).await;

    let done = ctx.coordinator.get_job(job.id).await.unwrap().unwrap();
    assert_eq!(done.status, JobStatus::Failed);
    let error = done.error.unwrap();
    assert!(error.starts_with("Unexpected error:"), "{error}");
    assert!(error.contains("index out of range"));
}

#[tokio::test]
async fn test_startup_recovers_own_orphans_only() {
    let (ctx, harness) = test_context("executor-a");
    let registry = Arc::new(HandlerRegistry::new());

    let mine = Uuid::new_v4();
    let theirs = Uuid::new_v4();
    harness.coordinator.seed(
        "jobs",
        json!({
            "id": mine,
            "job_type": "power_action",
            "status": "running",
            "worker_id": "executor-a",
            "started_at": Utc::now(),
        }),
    );
    harness.coordinator.seed(
        "jobs",
        json!({
            "id": theirs,
            "job_type": "power_action",
            "status": "running",
            "worker_id": "executor-b",
            "started_at": Utc::now(),
        }),
    );

    let dispatcher = Dispatcher::new(ctx.clone(), registry);
    let recovered = dispatcher.recover_orphans().await.unwrap();
    assert_eq!(recovered, 1);

    let row = harness.coordinator.row_by_id("jobs", mine).unwrap();
    assert_eq!(row["status"], "failed");
    assert_eq!(row["details"]["auto_recovered"], true);
    assert!(row["completed_at"].is_string());

    // The other worker's job is untouched.
    let other = harness.coordinator.row_by_id("jobs", theirs).unwrap();
    assert_eq!(other["status"], "running");
}

#[tokio::test]
async fn test_dispatcher_runs_pending_job_to_terminal() {
    let (ctx, _harness) = test_context("w1");

    let ran = Arc::new(AtomicUsize::new(0));
    let ran_probe = ran.clone();
    let mut registry = HandlerRegistry::new();
    registry.register("quick", move |job, ctx| {
        let ran = ran_probe.clone();
        async move {
            ran.fetch_add(1, Ordering::SeqCst);
            let wf = Workflow::begin(&ctx, &job).await?;
            wf.complete().await
        }
    });
    let registry = Arc::new(registry);

    let job = ctx.coordinator.insert_job(NewJob::pending("quick")).await.unwrap();

    let dispatcher = Dispatcher::new(ctx.clone(), registry);
    let shutdown = dispatcher.shutdown_handle();
    let handle = tokio::spawn(dispatcher.run());

    // Wait for the job to reach a terminal state, then stop the loop.
    let deadline = std::time::Instant::now() + Duration::from_secs(5);
    loop {
        let current = ctx.coordinator.get_job(job.id).await.unwrap().unwrap();
        if current.status.is_terminal() {
            break;
        }
        assert!(std::time::Instant::now() < deadline, "job never finished");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    shutdown.store(true, Ordering::SeqCst);
    handle.await.unwrap().unwrap();

    assert_eq!(ran.load(Ordering::SeqCst), 1);
    let done = ctx.coordinator.get_job(job.id).await.unwrap().unwrap();
    assert_eq!(done.status, JobStatus::Completed);
}

#[tokio::test]
async fn test_jobs_scheduled_in_the_future_are_not_claimed() {
    let (ctx, _harness) = test_context("w1");

    ctx.coordinator
        .insert_job(
            NewJob::pending("later").scheduled_at(Utc::now() + chrono::Duration::hours(1)),
        )
        .await
        .unwrap();
    let ready = ctx.coordinator.fetch_ready_jobs(Utc::now(), 10).await.unwrap();
    assert!(ready.is_empty());

    ctx.coordinator
        .insert_job(NewJob::pending("now").scheduled_at(Utc::now() - chrono::Duration::seconds(1)))
        .await
        .unwrap();
    let ready = ctx.coordinator.fetch_ready_jobs(Utc::now(), 10).await.unwrap();
    assert_eq!(ready.len(), 1);
    assert_eq!(ready[0].job_type, "now");
}

#[tokio::test]
async fn test_periodic_seeding_gives_liveness_without_duplicates() {
    let (ctx, harness) = test_context("w1");

    // Fresh system: no periodic rows at all.
    let inserted = periodic::ensure_successor(
        &ctx,
        "scheduled_replication_check",
        Duration::from_secs(60),
        None,
    )
    .await
    .unwrap();
    assert!(inserted);

    // Seeding again while the successor is pending inserts nothing.
    let inserted_again = periodic::ensure_successor(
        &ctx,
        "scheduled_replication_check",
        Duration::from_secs(60),
        None,
    )
    .await
    .unwrap();
    assert!(!inserted_again);

    let rows: Vec<serde_json::Value> = harness
        .coordinator
        .rows("jobs")
        .into_iter()
        .filter(|r| r["job_type"] == "scheduled_replication_check")
        .collect();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0]["status"], "pending");

    // The run is scheduled within one interval, well inside the 2x
    // liveness bound.
    let scheduled_at: chrono::DateTime<Utc> =
        serde_json::from_value(rows[0]["scheduled_at"].clone()).unwrap();
    assert!(scheduled_at <= Utc::now() + chrono::Duration::seconds(61));
}

#[tokio::test]
async fn test_stale_runner_is_reaped_then_replaced() {
    let (ctx, harness) = test_context("w1");

    let stale = Uuid::new_v4();
    harness.coordinator.seed(
        "jobs",
        json!({
            "id": stale,
            "job_type": "rpo_monitoring",
            "status": "running",
            "worker_id": "executor-dead",
            "started_at": Utc::now() - chrono::Duration::minutes(15),
        }),
    );

    let inserted = periodic::ensure_successor(
        &ctx,
        "rpo_monitoring",
        Duration::from_secs(300),
        None,
    )
    .await
    .unwrap();
    assert!(inserted, "stale runner must not block the successor");

    let row = harness.coordinator.row_by_id("jobs", stale).unwrap();
    assert_eq!(row["status"], "failed");
    assert_eq!(row["details"]["auto_recovered"], true);
}

#[tokio::test]
async fn test_claim_path_skips_rows_lost_to_another_worker() {
    let (ctx, _harness) = test_context("w1");
    let job = ctx
        .coordinator
        .insert_job(NewJob::pending("power_action"))
        .await
        .unwrap();

    // Another worker wins between fetch and claim.
    ctx.coordinator
        .api()
        .patch(
            "jobs",
            &[Filter::eq("id", job.id), Filter::eq("status", "pending")],
            json!({"status": "running", "worker_id": "other"}),
        )
        .await
        .unwrap();

    let won = ctx.coordinator.try_claim(job.id, "w1", Utc::now()).await.unwrap();
    assert!(!won);
    let current = ctx.coordinator.get_job(job.id).await.unwrap().unwrap();
    assert_eq!(current.worker_id.as_deref(), Some("other"));
}
