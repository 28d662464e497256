//! Management controller network settings.

use std::sync::Arc;

use anyhow::Result;
use redfish::{Ipv4Address, ManagerNetwork};
use serde_json::json;

use super::common;
use crate::context::{ExecutorContext, Workflow};
use crate::coordinator::Job;

/// `idrac_network_read`: snapshot the management NIC settings of each
/// server into the job details.
pub async fn idrac_network_read(job: Job, ctx: Arc<ExecutorContext>) -> Result<()> {
    let mut wf = Workflow::begin(&ctx, &job).await?;

    let server_ids = match common::specific_server_ids(&job) {
        Ok(ids) => ids,
        Err(e) => return wf.fail(&e.to_string()).await,
    };
    let servers = match ctx.coordinator.servers_by_ids(&server_ids).await {
        Ok(servers) if !servers.is_empty() => servers,
        Ok(_) => return wf.fail("No servers found for target scope").await,
        Err(e) => return wf.fail(&format!("Could not load servers: {e:#}")).await,
    };

    wf.phase("read", 10).await?;
    let total = servers.len();
    let mut failed = 0usize;
    let mut settings = serde_json::Map::new();

    for (index, server) in servers.iter().enumerate() {
        if wf.cancelled().await? {
            return wf.cancel().await;
        }
        wf.env
            .set_phase("read", common::band_progress(10, 95, index, total));

        let result = async {
            let device = common::oob_device(&ctx, job.id, server).await?;
            let network = ctx.redfish.read_manager_network(&device).await?;
            anyhow::Ok(serde_json::to_value(network)?)
        }
        .await;

        match result {
            Ok(value) => {
                settings.insert(server.ip_address.clone(), value);
                wf.env.step(&server.ip_address, "completed", "settings read");
            }
            Err(e) => {
                failed += 1;
                wf.env.step(&server.ip_address, "failed", format!("{e:#}"));
            }
        }
    }

    wf.env.set("network_settings", serde_json::Value::Object(settings));
    if failed == 0 {
        wf.complete().await
    } else {
        wf.fail(&format!("{failed} of {total} servers failed")).await
    }
}

/// `idrac_network_write`: apply management NIC settings built from the
/// job details to each server. Changing the controller address can drop
/// the session; the write is fire-and-forget by design.
pub async fn idrac_network_write(job: Job, ctx: Arc<ExecutorContext>) -> Result<()> {
    let mut wf = Workflow::begin(&ctx, &job).await?;

    let settings = match build_settings(&job) {
        Ok(Some(settings)) => settings,
        Ok(None) => {
            return wf
                .fail("details must set at least one of hostname, dns_servers, ipv4")
                .await
        }
        Err(e) => return wf.fail(&e).await,
    };

    let server_ids = match common::specific_server_ids(&job) {
        Ok(ids) => ids,
        Err(e) => return wf.fail(&e.to_string()).await,
    };
    let servers = match ctx.coordinator.servers_by_ids(&server_ids).await {
        Ok(servers) if !servers.is_empty() => servers,
        Ok(_) => return wf.fail("No servers found for target scope").await,
        Err(e) => return wf.fail(&format!("Could not load servers: {e:#}")).await,
    };

    wf.phase("write", 10).await?;
    let total = servers.len();
    let mut failed = 0usize;

    for (index, server) in servers.iter().enumerate() {
        if wf.cancelled().await? {
            return wf.cancel().await;
        }
        wf.env
            .set_phase("write", common::band_progress(10, 95, index, total));

        let result = async {
            let device = common::oob_device(&ctx, job.id, server).await?;
            ctx.redfish.write_manager_network(&device, &settings).await
        }
        .await;

        match result {
            Ok(()) => wf.env.step(&server.ip_address, "completed", "settings written"),
            Err(e) => {
                failed += 1;
                wf.env.step(&server.ip_address, "failed", format!("{e:#}"));
            }
        }
    }

    if failed == 0 {
        wf.complete().await
    } else {
        wf.fail(&format!("{failed} of {total} servers failed")).await
    }
}

fn build_settings(job: &Job) -> Result<Option<ManagerNetwork>, String> {
    let details = match job.details.as_ref() {
        Some(details) => details,
        None => return Ok(None),
    };

    let mut settings = ManagerNetwork {
        host_name: details
            .get("hostname")
            .and_then(|v| v.as_str())
            .map(String::from),
        fqdn: None,
        ipv4_addresses: None,
        name_servers: None,
        mac_address: None,
    };

    if let Some(dns) = details.get("dns_servers").and_then(|v| v.as_array()) {
        let servers: Vec<String> = dns
            .iter()
            .filter_map(|v| v.as_str().map(String::from))
            .collect();
        if !servers.is_empty() {
            settings.name_servers = Some(servers);
        }
    }

    if let Some(ipv4) = details.get("ipv4").and_then(|v| v.as_object()) {
        let address = ipv4.get("address").and_then(|v| v.as_str());
        if address.is_none() {
            return Err("details.ipv4.address is missing".to_string());
        }
        settings.ipv4_addresses = Some(vec![Ipv4Address {
            address: address.map(String::from),
            subnet_mask: ipv4.get("subnet_mask").and_then(|v| v.as_str()).map(String::from),
            gateway: ipv4.get("gateway").and_then(|v| v.as_str()).map(String::from),
        }]);
    }

    if settings.host_name.is_none()
        && settings.name_servers.is_none()
        && settings.ipv4_addresses.is_none()
    {
        return Ok(None);
    }
    Ok(Some(settings))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coordinator::JobStatus;
    use crate::testing::{encrypt_for_tests, seed_running_job, test_context};
    use uuid::Uuid;

    #[tokio::test]
    async fn test_write_requires_some_setting() {
        let (ctx, _) = test_context("w1");
        let job = seed_running_job(
            &ctx,
            "idrac_network_write",
            json!({"type": "specific", "server_ids": [Uuid::new_v4()]}),
            json!({"unrelated": true}),
        )
        .await;

        idrac_network_write(job.clone(), ctx.clone()).await.unwrap();
        let done = ctx.coordinator.get_job(job.id).await.unwrap().unwrap();
        assert_eq!(done.status, JobStatus::Failed);
        assert!(done.error.unwrap().contains("at least one of"));
    }

    #[tokio::test]
    async fn test_read_collects_settings_per_server() {
        let (ctx, harness) = test_context("w1");
        let id = Uuid::new_v4();
        harness
            .coordinator
            .seed("servers", json!({"id": id, "ip_address": "10.0.0.3"}));
        harness.coordinator.seed(
            "server_credentials",
            json!({"server_id": id, "username": "root", "password_encrypted": encrypt_for_tests("pw")}),
        );

        let job = seed_running_job(
            &ctx,
            "idrac_network_read",
            json!({"type": "specific", "server_ids": [id]}),
            json!({}),
        )
        .await;
        idrac_network_read(job.clone(), ctx.clone()).await.unwrap();

        let done = ctx.coordinator.get_job(job.id).await.unwrap().unwrap();
        assert_eq!(done.status, JobStatus::Completed);
        let details = done.details.unwrap();
        assert_eq!(
            details["network_settings"]["10.0.0.3"]["HostName"],
            "mock-bmc"
        );
    }
}
