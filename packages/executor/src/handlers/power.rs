//! Server power control over the out-of-band controller.

use std::sync::Arc;

use anyhow::Result;
use chrono::Utc;
use redfish::ResetType;
use serde_json::json;

use super::common;
use crate::context::{ExecutorContext, Workflow};
use crate::coordinator::{Job, ServerRecord};

/// `power_action`: apply a power action to each server in the target
/// scope, reading the state back into the inventory. Any per-server
/// failure fails the job.
pub async fn power_action(job: Job, ctx: Arc<ExecutorContext>) -> Result<()> {
    let mut wf = Workflow::begin(&ctx, &job).await?;

    let action_name = job.detail_str("action").unwrap_or("On").to_string();
    let Some(action) = ResetType::parse(&action_name) else {
        return wf.fail(&format!("Unknown power action {action_name:?}")).await;
    };

    let server_ids = match common::specific_server_ids(&job) {
        Ok(ids) => ids,
        Err(e) => return wf.fail(&e.to_string()).await,
    };

    wf.phase("validate", 5).await?;
    let servers = match ctx.coordinator.servers_by_ids(&server_ids).await {
        Ok(servers) if !servers.is_empty() => servers,
        Ok(_) => return wf.fail("No servers found for target scope").await,
        Err(e) => return wf.fail(&format!("Could not load servers: {e:#}")).await,
    };

    wf.phase("execute", 10).await?;
    let total = servers.len();
    let mut success_count = 0u64;
    let mut failed_count = 0u64;

    for (index, server) in servers.iter().enumerate() {
        if wf.cancelled().await? {
            return wf.cancel().await;
        }

        wf.env.set("current_server_index", json!(index));
        wf.env.set("total_servers", json!(total));
        wf.env.set(
            "current_step",
            json!(format!(
                "Executing {action_name} on {} ({}/{})",
                server.ip_address,
                index + 1,
                total
            )),
        );
        wf.env
            .set_phase("execute", common::band_progress(10, 95, index, total));
        wf.info(&format!("Executing {action_name} on {}", server.ip_address))
            .await;

        match apply_action(&ctx, &job, action, server).await {
            Ok(new_state) => {
                success_count += 1;
                wf.env.step(
                    &server.ip_address,
                    "completed",
                    format!("power state now {new_state}"),
                );
            }
            Err(e) => {
                failed_count += 1;
                wf.env
                    .step(&server.ip_address, "failed", format!("{e:#}"));
                wf.console("ERROR", &format!("{}: {e:#}", server.ip_address))
                    .await;
            }
        }
    }

    wf.env.set("action", json!(action_name));
    wf.env.set("success_count", json!(success_count));
    wf.env.set("failed_count", json!(failed_count));
    wf.env.set("total", json!(total));
    wf.info(&format!(
        "Power action complete: {success_count} succeeded, {failed_count} failed"
    ))
    .await;

    if failed_count == 0 {
        wf.complete().await
    } else {
        wf.fail(&format!("{failed_count} of {total} servers failed"))
            .await
    }
}

/// One server: read current power state, request the reset, patch the
/// inventory row with the resulting state.
async fn apply_action(
    ctx: &Arc<ExecutorContext>,
    job: &Job,
    action: ResetType,
    server: &ServerRecord,
) -> Result<&'static str> {
    let device = common::oob_device(ctx, job.id, server).await?;

    let system = ctx.redfish.get_system(&device).await?;
    tracing::debug!(
        server = %server.ip_address,
        current = system.power_state.as_deref().unwrap_or("Unknown"),
        "read power state"
    );

    ctx.redfish.reset(&device, action).await?;

    let new_state = action.expected_power_state();
    ctx.coordinator
        .patch_server(
            server.id,
            json!({ "power_state": new_state, "last_seen_at": Utc::now() }),
        )
        .await?;
    Ok(new_state)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coordinator::JobStatus;
    use crate::testing::{encrypt_for_tests, seed_running_job, test_context};
    use uuid::Uuid;

    fn seed_server(harness: &crate::testing::TestHarness, ip: &str) -> Uuid {
        let id = Uuid::new_v4();
        harness.coordinator.seed(
            "servers",
            json!({ "id": id, "ip_address": ip, "power_state": "Off" }),
        );
        harness.coordinator.seed(
            "server_credentials",
            json!({
                "server_id": id,
                "username": "root",
                "password_encrypted": encrypt_for_tests("calvin"),
            }),
        );
        id
    }

    #[tokio::test]
    async fn test_power_on_across_a_set() {
        let (ctx, harness) = test_context("w1");
        let s1 = seed_server(&harness, "10.0.0.1");
        let s2 = seed_server(&harness, "10.0.0.2");

        let job = seed_running_job(
            &ctx,
            "power_action",
            json!({"type": "specific", "server_ids": [s1, s2]}),
            json!({"action": "On"}),
        )
        .await;

        power_action(job.clone(), ctx.clone()).await.unwrap();

        // One GET and one POST per server against the controller.
        let calls = harness.redfish.calls();
        for ip in ["10.0.0.1", "10.0.0.2"] {
            let for_ip: Vec<_> = calls.iter().filter(|c| c.address == ip).collect();
            assert_eq!(for_ip.len(), 2, "expected GET+POST for {ip}");
            assert_eq!(for_ip[0].method, "GET");
            assert_eq!(for_ip[1].method, "POST");
        }

        // Inventory rows reflect the new power state.
        for id in [s1, s2] {
            let row = harness.coordinator.row_by_id("servers", id).unwrap();
            assert_eq!(row["power_state"], "On");
        }

        let done = ctx.coordinator.get_job(job.id).await.unwrap().unwrap();
        assert_eq!(done.status, JobStatus::Completed);
        let details = done.details.unwrap();
        assert_eq!(details["success_count"], 2);
        assert_eq!(details["failed_count"], 0);
        assert_eq!(details["progress_percent"], 100);
    }

    #[tokio::test]
    async fn test_partial_failure_fails_job() {
        let (ctx, harness) = test_context("w1");
        let s1 = seed_server(&harness, "10.0.0.1");
        let s2 = seed_server(&harness, "10.0.0.2");
        harness.redfish.fail_address("10.0.0.2");

        let job = seed_running_job(
            &ctx,
            "power_action",
            json!({"type": "specific", "server_ids": [s1, s2]}),
            json!({"action": "ForceOff"}),
        )
        .await;

        power_action(job.clone(), ctx.clone()).await.unwrap();

        let done = ctx.coordinator.get_job(job.id).await.unwrap().unwrap();
        assert_eq!(done.status, JobStatus::Failed);
        let details = done.details.unwrap();
        assert_eq!(details["success_count"], 1);
        assert_eq!(details["failed_count"], 1);
        assert!(done.error.unwrap().contains("1 of 2 servers failed"));
    }

    #[tokio::test]
    async fn test_missing_scope_is_a_validation_failure() {
        let (ctx, _harness) = test_context("w1");
        let job = seed_running_job(&ctx, "power_action", json!({"type": "all"}), json!({})).await;

        power_action(job.clone(), ctx.clone()).await.unwrap();

        let done = ctx.coordinator.get_job(job.id).await.unwrap().unwrap();
        assert_eq!(done.status, JobStatus::Failed);
        assert!(done
            .error
            .unwrap()
            .contains("specific target selection"));
    }

    #[tokio::test]
    async fn test_unknown_action_rejected() {
        let (ctx, _harness) = test_context("w1");
        let job = seed_running_job(
            &ctx,
            "power_action",
            json!({"type": "specific", "server_ids": [Uuid::new_v4()]}),
            json!({"action": "Reboot"}),
        )
        .await;

        power_action(job.clone(), ctx.clone()).await.unwrap();

        let done = ctx.coordinator.get_job(job.id).await.unwrap().unwrap();
        assert_eq!(done.status, JobStatus::Failed);
        assert!(done.error.unwrap().contains("Unknown power action"));
    }
}
