//! Virtual media (ISO) attach and detach on the out-of-band controller.

use std::sync::Arc;

use anyhow::Result;
use serde_json::json;

use super::common;
use crate::context::{ExecutorContext, Workflow};
use crate::coordinator::Job;

/// `virtual_media_mount`: attach an ISO image on each server's virtual CD
/// slot, ejecting any image already inserted first.
pub async fn virtual_media_mount(job: Job, ctx: Arc<ExecutorContext>) -> Result<()> {
    let mut wf = Workflow::begin(&ctx, &job).await?;

    let image_url = match common::require_detail(&job, "image_url") {
        Ok(url) => url.to_string(),
        Err(e) => return wf.fail(&e.to_string()).await,
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

    wf.phase("mount", 10).await?;
    let total = servers.len();
    let mut failed = 0usize;

    for (index, server) in servers.iter().enumerate() {
        if wf.cancelled().await? {
            return wf.cancel().await;
        }
        wf.env
            .set_phase("mount", common::band_progress(10, 95, index, total));

        let result = async {
            let device = common::oob_device(&ctx, job.id, server).await?;
            let media = ctx.redfish.get_virtual_media(&device).await?;
            if media.inserted.unwrap_or(false) {
                ctx.redfish.eject_virtual_media(&device).await?;
            }
            ctx.redfish.insert_virtual_media(&device, &image_url).await?;
            anyhow::Ok(())
        }
        .await;

        match result {
            Ok(()) => {
                wf.env
                    .step(&server.ip_address, "completed", format!("mounted {image_url}"));
                wf.info(&format!("{}: media mounted", server.ip_address)).await;
            }
            Err(e) => {
                failed += 1;
                wf.env.step(&server.ip_address, "failed", format!("{e:#}"));
                wf.console("ERROR", &format!("{}: {e:#}", server.ip_address))
                    .await;
            }
        }
    }

    wf.env.set("image_url", json!(image_url));
    if failed == 0 {
        wf.complete().await
    } else {
        wf.fail(&format!("{failed} of {total} servers failed")).await
    }
}

/// `virtual_media_unmount`: eject whatever is in the virtual CD slot.
pub async fn virtual_media_unmount(job: Job, ctx: Arc<ExecutorContext>) -> Result<()> {
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

    wf.phase("unmount", 10).await?;
    let total = servers.len();
    let mut failed = 0usize;

    for (index, server) in servers.iter().enumerate() {
        if wf.cancelled().await? {
            return wf.cancel().await;
        }
        wf.env
            .set_phase("unmount", common::band_progress(10, 95, index, total));

        let result = async {
            let device = common::oob_device(&ctx, job.id, server).await?;
            ctx.redfish.eject_virtual_media(&device).await?;
            anyhow::Ok(())
        }
        .await;

        match result {
            Ok(()) => wf.env.step(&server.ip_address, "completed", "media ejected"),
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
