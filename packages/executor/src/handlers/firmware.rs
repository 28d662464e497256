//! Firmware updates through the out-of-band controller.
//!
//! The controller applies firmware asynchronously: the package is uploaded
//! over multipart, the controller queues a job, and the handler polls that
//! job queue streaming remote progress into `details.idrac_job_queue` until
//! it reaches a terminal state or the per-server budget runs out.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde_json::json;

use super::common;
use crate::context::{ExecutorContext, Workflow};
use crate::coordinator::{Job, ServerRecord};

/// How long one controller job may take to finish applying.
const APPLY_TIMEOUT: Duration = Duration::from_secs(30 * 60);
const APPLY_POLL_INTERVAL: Duration = Duration::from_secs(10);

/// `firmware_update`: fetch the package once, then per server preflight,
/// upload, and poll the controller job queue to completion.
pub async fn firmware_update(job: Job, ctx: Arc<ExecutorContext>) -> Result<()> {
    let mut wf = Workflow::begin(&ctx, &job).await?;

    let package_url = match common::require_detail(&job, "package_url") {
        Ok(url) => url.to_string(),
        Err(e) => return wf.fail(&e.to_string()).await,
    };
    let package_name = package_url
        .rsplit('/')
        .next()
        .unwrap_or("firmware.bin")
        .to_string();

    let server_ids = match common::specific_server_ids(&job) {
        Ok(ids) => ids,
        Err(e) => return wf.fail(&e.to_string()).await,
    };
    let servers = match ctx.coordinator.servers_by_ids(&server_ids).await {
        Ok(servers) if !servers.is_empty() => servers,
        Ok(_) => return wf.fail("No servers found for target scope").await,
        Err(e) => return wf.fail(&format!("Could not load servers: {e:#}")).await,
    };

    wf.phase("fetch_package", 5).await?;
    wf.info(&format!("Fetching firmware package {package_name}")).await;
    let package = match fetch_package(&ctx, &package_url).await {
        Ok(bytes) => bytes,
        Err(e) => return wf.fail(&format!("Could not fetch package: {e:#}")).await,
    };
    wf.env.set("package_name", json!(package_name));
    wf.env.set("package_bytes", json!(package.len()));

    let total = servers.len();
    let mut failed = 0usize;

    for (index, server) in servers.iter().enumerate() {
        if wf.cancelled().await? {
            return wf.cancel().await;
        }
        wf.phase("apply", common::band_progress(10, 95, index, total))
            .await?;

        match apply_to_server(&mut wf, &ctx, &job, server, &package_name, package.clone()).await {
            Ok(()) => wf.env.step(&server.ip_address, "completed", "firmware applied"),
            Err(e) => {
                // A cancel observed inside the poll loop surfaces here.
                if wf.cancelled().await? {
                    return wf.cancel().await;
                }
                failed += 1;
                wf.env.step(&server.ip_address, "failed", format!("{e:#}"));
                wf.console("ERROR", &format!("{}: {e:#}", server.ip_address))
                    .await;
            }
        }
    }

    if failed == 0 {
        wf.complete().await
    } else {
        wf.fail(&format!("{failed} of {total} servers failed")).await
    }
}

/// Preflight, upload, then poll the controller job to a terminal state.
/// Used by the firmware handler and the combined upgrade workflows.
pub(crate) async fn apply_to_server(
    wf: &mut Workflow,
    ctx: &Arc<ExecutorContext>,
    job: &Job,
    server: &ServerRecord,
    package_name: &str,
    package: Vec<u8>,
) -> Result<()> {
    let device = common::oob_device(ctx, job.id, server).await?;

    // Preflight: the controller must answer and report its inventory.
    let inventory = ctx.redfish.firmware_inventory(&device).await?;
    wf.info(&format!(
        "{}: {} firmware components present",
        server.ip_address,
        inventory.len()
    ))
    .await;

    let controller_job_id = ctx
        .redfish
        .upload_firmware(&device, package_name, package)
        .await?;
    wf.info(&format!(
        "{}: upload accepted, controller job {controller_job_id}",
        server.ip_address
    ))
    .await;

    // Poll the controller job queue, streaming remote progress.
    let started = std::time::Instant::now();
    loop {
        if wf.cancelled().await? {
            bail!("cancelled while waiting for controller job {controller_job_id}");
        }

        let remote = ctx.redfish.controller_job(&device, &controller_job_id).await?;
        let mut queue = serde_json::Map::new();
        queue.insert(
            server.ip_address.clone(),
            json!({
                "job_id": remote.id.clone(),
                "state": remote.state.clone(),
                "percent_complete": remote.percent_complete,
                "message": remote.message.clone(),
            }),
        );
        wf.env.set("idrac_job_queue", serde_json::Value::Object(queue));
        wf.flush().await?;

        if remote.is_terminal() {
            if remote.is_success() {
                return Ok(());
            }
            bail!(
                "controller job {controller_job_id} ended {}: {}",
                remote.state.as_deref().unwrap_or("Unknown"),
                remote.message.unwrap_or_default()
            );
        }

        if started.elapsed() > APPLY_TIMEOUT {
            bail!("controller job {controller_job_id} did not finish within 30 minutes");
        }
        tokio::time::sleep(APPLY_POLL_INTERVAL).await;
    }
}

/// Download the firmware package from the media server.
async fn fetch_package(ctx: &Arc<ExecutorContext>, url: &str) -> Result<Vec<u8>> {
    let client = reqwest::Client::builder()
        .timeout(Duration::from_secs(300))
        .danger_accept_invalid_certs(!ctx.config.verify_tls)
        .build()
        .context("failed to build package fetch client")?;
    let response = client.get(url).send().await.context("package fetch failed")?;
    if !response.status().is_success() {
        bail!("package server returned {}", response.status());
    }
    Ok(response.bytes().await.context("package read failed")?.to_vec())
}
