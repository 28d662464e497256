//! Remote console access.

use std::sync::Arc;

use anyhow::Result;
use serde_json::json;

use super::common;
use crate::context::{ExecutorContext, Workflow};
use crate::coordinator::Job;

/// `console_launch`: verify the controller is reachable and hand the
/// operator the console URL for the requested server.
pub async fn console_launch(job: Job, ctx: Arc<ExecutorContext>) -> Result<()> {
    let mut wf = Workflow::begin(&ctx, &job).await?;

    let server_id = match common::scope_uuid(&job, "server_id") {
        Ok(id) => id,
        Err(e) => return wf.fail(&e.to_string()).await,
    };
    let server = match ctx.coordinator.server_by_id(server_id).await {
        Ok(Some(server)) => server,
        Ok(None) => return wf.fail(&format!("Server {server_id} not found")).await,
        Err(e) => return wf.fail(&format!("Could not load server: {e:#}")).await,
    };

    wf.phase("probe", 30).await?;
    let device = match common::oob_device(&ctx, job.id, &server).await {
        Ok(device) => device,
        Err(e) => return wf.fail(&e.to_string()).await,
    };
    let system = match ctx.redfish.get_system(&device).await {
        Ok(system) => system,
        Err(e) => {
            return wf
                .fail(&format!("Controller {} unreachable: {e:#}", server.ip_address))
                .await
        }
    };

    wf.phase("resolve", 80).await?;
    wf.env.set(
        "console_url",
        json!(format!("https://{}/console", server.ip_address)),
    );
    wf.env.set(
        "power_state",
        json!(system.power_state.unwrap_or_else(|| "Unknown".to_string())),
    );
    wf.info(&format!("Console ready for {}", server.ip_address)).await;
    wf.complete().await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coordinator::JobStatus;
    use crate::testing::{encrypt_for_tests, seed_running_job, test_context};
    use uuid::Uuid;

    #[tokio::test]
    async fn test_console_launch_records_url() {
        let (ctx, harness) = test_context("w1");
        let id = Uuid::new_v4();
        harness
            .coordinator
            .seed("servers", json!({"id": id, "ip_address": "10.0.0.9"}));
        harness.coordinator.seed(
            "server_credentials",
            json!({"server_id": id, "username": "root", "password_encrypted": encrypt_for_tests("pw")}),
        );
        harness.redfish.set_power_state("10.0.0.9", "On");

        let job = seed_running_job(
            &ctx,
            "console_launch",
            json!({"type": "specific", "server_id": id}),
            json!({}),
        )
        .await;
        console_launch(job.clone(), ctx.clone()).await.unwrap();

        let done = ctx.coordinator.get_job(job.id).await.unwrap().unwrap();
        assert_eq!(done.status, JobStatus::Completed);
        let details = done.details.unwrap();
        assert_eq!(details["console_url"], "https://10.0.0.9/console");
        assert_eq!(details["power_state"], "On");
    }
}
