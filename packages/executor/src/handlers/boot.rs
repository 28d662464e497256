//! Boot device and BIOS configuration over the out-of-band controller.

use std::collections::BTreeMap;
use std::sync::Arc;

use anyhow::Result;
use redfish::ResetType;
use serde_json::{json, Value};

use super::common;
use crate::context::{ExecutorContext, Workflow};
use crate::coordinator::Job;

const BOOT_TARGETS: &[&str] = &["Pxe", "Cd", "Hdd", "Usb", "BiosSetup", "Utilities", "None"];

/// `boot_configuration`: stage a one-time boot override on each server,
/// optionally restarting immediately so it takes effect.
pub async fn boot_configuration(job: Job, ctx: Arc<ExecutorContext>) -> Result<()> {
    let mut wf = Workflow::begin(&ctx, &job).await?;

    let target = job.detail_str("boot_device").unwrap_or("Pxe").to_string();
    if !BOOT_TARGETS.contains(&target.as_str()) {
        return wf
            .fail(&format!(
                "Unknown boot device {target:?} (expected one of {BOOT_TARGETS:?})"
            ))
            .await;
    }
    let reboot = job.detail_bool("reboot").unwrap_or(false);

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

    wf.phase("configure", 10).await?;
    let total = servers.len();
    let mut failed = 0usize;

    for (index, server) in servers.iter().enumerate() {
        if wf.cancelled().await? {
            return wf.cancel().await;
        }
        wf.env
            .set_phase("configure", common::band_progress(10, 95, index, total));

        let result = async {
            let device = common::oob_device(&ctx, job.id, server).await?;
            ctx.redfish.set_boot_override(&device, &target).await?;
            if reboot {
                ctx.redfish.reset(&device, ResetType::ForceRestart).await?;
            }
            anyhow::Ok(())
        }
        .await;

        match result {
            Ok(()) => {
                wf.env.step(
                    &server.ip_address,
                    "completed",
                    format!("one-time boot set to {target}"),
                );
                wf.info(&format!("{}: boot override {target}", server.ip_address))
                    .await;
            }
            Err(e) => {
                failed += 1;
                wf.env.step(&server.ip_address, "failed", format!("{e:#}"));
                wf.console("ERROR", &format!("{}: {e:#}", server.ip_address))
                    .await;
            }
        }
    }

    wf.env.set("boot_device", json!(target));
    wf.env.set("reboot_requested", json!(reboot));
    if failed == 0 {
        wf.complete().await
    } else {
        wf.fail(&format!("{failed} of {total} servers failed")).await
    }
}

/// `bios_config_read`: snapshot BIOS attributes into the job details, one
/// map per server.
pub async fn bios_config_read(job: Job, ctx: Arc<ExecutorContext>) -> Result<()> {
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
    let mut attributes = serde_json::Map::new();
    let mut failed = 0usize;
    let total = servers.len();

    for (index, server) in servers.iter().enumerate() {
        if wf.cancelled().await? {
            return wf.cancel().await;
        }
        wf.env
            .set_phase("read", common::band_progress(10, 95, index, total));
        match read_bios(&ctx, &job, server).await {
            Ok(attrs) => {
                attributes.insert(server.ip_address.clone(), json!(attrs));
                wf.env
                    .step(&server.ip_address, "completed", format!("{} attributes", attrs.len()));
            }
            Err(e) => {
                failed += 1;
                wf.env.step(&server.ip_address, "failed", format!("{e:#}"));
            }
        }
    }

    wf.env.set("bios_attributes", Value::Object(attributes));
    if failed == 0 {
        wf.complete().await
    } else {
        wf.fail(&format!("{failed} of {total} servers failed")).await
    }
}

async fn read_bios(
    ctx: &Arc<ExecutorContext>,
    job: &Job,
    server: &crate::coordinator::ServerRecord,
) -> Result<BTreeMap<String, Value>> {
    let device = common::oob_device(ctx, job.id, server).await?;
    ctx.redfish.read_bios_attributes(&device).await
}

/// `bios_config_write`: stage attribute changes on each server. Staged
/// settings apply on the next reboot; `details.reboot` triggers it now.
pub async fn bios_config_write(job: Job, ctx: Arc<ExecutorContext>) -> Result<()> {
    let mut wf = Workflow::begin(&ctx, &job).await?;

    let attributes: BTreeMap<String, Value> = match job
        .details
        .as_ref()
        .and_then(|d| d.get("attributes"))
        .and_then(|v| v.as_object())
    {
        Some(map) if !map.is_empty() => map.clone().into_iter().collect(),
        _ => return wf.fail("details.attributes is missing or empty").await,
    };
    let reboot = job.detail_bool("reboot").unwrap_or(false);

    let server_ids = match common::specific_server_ids(&job) {
        Ok(ids) => ids,
        Err(e) => return wf.fail(&e.to_string()).await,
    };
    let servers = match ctx.coordinator.servers_by_ids(&server_ids).await {
        Ok(servers) if !servers.is_empty() => servers,
        Ok(_) => return wf.fail("No servers found for target scope").await,
        Err(e) => return wf.fail(&format!("Could not load servers: {e:#}")).await,
    };

    wf.phase("stage", 10).await?;
    let total = servers.len();
    let mut failed = 0usize;

    for (index, server) in servers.iter().enumerate() {
        if wf.cancelled().await? {
            return wf.cancel().await;
        }
        wf.env
            .set_phase("stage", common::band_progress(10, 95, index, total));

        let result = async {
            let device = common::oob_device(&ctx, job.id, server).await?;
            ctx.redfish
                .stage_bios_attributes(&device, attributes.clone())
                .await?;
            if reboot {
                ctx.redfish.reset(&device, ResetType::ForceRestart).await?;
            }
            anyhow::Ok(())
        }
        .await;

        match result {
            Ok(()) => wf.env.step(
                &server.ip_address,
                "completed",
                format!("{} attributes staged", attributes.len()),
            ),
            Err(e) => {
                failed += 1;
                wf.env.step(&server.ip_address, "failed", format!("{e:#}"));
            }
        }
    }

    wf.env.set("staged_attributes", json!(attributes.len()));
    if failed == 0 {
        wf.complete().await
    } else {
        wf.fail(&format!("{failed} of {total} servers failed")).await
    }
}
