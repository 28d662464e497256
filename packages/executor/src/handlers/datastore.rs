//! NFS datastore management across hypervisor hosts.

use std::sync::Arc;

use anyhow::Result;
use chrono::Utc;
use serde_json::json;

use super::common;
use crate::context::{ExecutorContext, Workflow};
use crate::coordinator::Job;

/// `browse_datastore`: list files under a datastore path into the details.
pub async fn browse_datastore(job: Job, ctx: Arc<ExecutorContext>) -> Result<()> {
    let mut wf = Workflow::begin(&ctx, &job).await?;

    let vcenter_id = match common::detail_uuid(&job, "vcenter_id") {
        Ok(id) => id,
        Err(e) => return wf.fail(&e.to_string()).await,
    };
    let datastore = match common::require_detail(&job, "datastore") {
        Ok(name) => name.to_string(),
        Err(e) => return wf.fail(&e.to_string()).await,
    };
    let path = job.detail_str("path").unwrap_or("/").to_string();

    wf.phase("list", 30).await?;
    let vc = match common::vcenter_endpoint(&ctx, job.id, vcenter_id).await {
        Ok(vc) => vc,
        Err(e) => return wf.fail(&e.to_string()).await,
    };
    let files = match ctx.vsphere.list_datastore_files(&vc, &datastore, &path).await {
        Ok(files) => files,
        Err(e) => return wf.fail(&format!("Could not list {datastore}:{path}: {e:#}")).await,
    };

    wf.env.set(
        "files",
        json!(files
            .iter()
            .map(|f| json!({"path": f.path, "size": f.size}))
            .collect::<Vec<_>>()),
    );
    wf.env.set("file_count", json!(files.len()));
    wf.complete().await
}

/// `manage_datastore`: mount or unmount an NFS datastore on the selected
/// hypervisor hosts (all connected hosts when none are scoped).
pub async fn manage_datastore(job: Job, ctx: Arc<ExecutorContext>) -> Result<()> {
    let mut wf = Workflow::begin(&ctx, &job).await?;

    let action = job.detail_str("action").unwrap_or("mount").to_string();
    if action != "mount" && action != "unmount" {
        return wf
            .fail(&format!("Unknown datastore action {action:?} (mount|unmount)"))
            .await;
    }
    let vcenter_id = match common::detail_uuid(&job, "vcenter_id") {
        Ok(id) => id,
        Err(e) => return wf.fail(&e.to_string()).await,
    };
    let datastore_name = match common::require_detail(&job, "datastore_name") {
        Ok(name) => name.to_string(),
        Err(e) => return wf.fail(&e.to_string()).await,
    };

    let vc = match common::vcenter_endpoint(&ctx, job.id, vcenter_id).await {
        Ok(vc) => vc,
        Err(e) => return wf.fail(&e.to_string()).await,
    };

    wf.phase("resolve_hosts", 10).await?;
    let hosts = match ctx.vsphere.list_hosts(&vc).await {
        Ok(hosts) => hosts,
        Err(e) => return wf.fail(&format!("Could not list hosts: {e:#}")).await,
    };
    let scoped: Option<Vec<String>> = job
        .target_scope
        .as_ref()
        .and_then(|s| s.get("host_ids"))
        .and_then(|v| v.as_array())
        .map(|ids| {
            ids.iter()
                .filter_map(|v| v.as_str().map(String::from))
                .collect()
        });
    let hosts: Vec<_> = hosts
        .into_iter()
        .filter(|h| h.connected)
        .filter(|h| {
            scoped
                .as_ref()
                .map(|ids| ids.contains(&h.host_id))
                .unwrap_or(true)
        })
        .collect();
    if hosts.is_empty() {
        return wf.fail("No connected hosts match the target scope").await;
    }

    // Mount needs the export source; unmount does not.
    let (remote_host, remote_path) = if action == "mount" {
        let host = match common::require_detail(&job, "remote_host") {
            Ok(v) => v.to_string(),
            Err(e) => return wf.fail(&e.to_string()).await,
        };
        let path = match common::require_detail(&job, "remote_path") {
            Ok(v) => v.to_string(),
            Err(e) => return wf.fail(&e.to_string()).await,
        };
        (host, path)
    } else {
        (String::new(), String::new())
    };

    wf.phase(&action, 20).await?;
    let total = hosts.len();
    let mut failed = 0usize;

    for (index, host) in hosts.iter().enumerate() {
        if wf.cancelled().await? {
            return wf.cancel().await;
        }
        wf.env
            .set_phase(&action, common::band_progress(20, 95, index, total));

        let result = if action == "mount" {
            ctx.vsphere
                .mount_nfs_datastore(&vc, &host.host_id, &datastore_name, &remote_host, &remote_path)
                .await
        } else {
            ctx.vsphere
                .unmount_datastore(&vc, &host.host_id, &datastore_name)
                .await
        };

        match result {
            Ok(()) => wf.env.step(&host.name, "completed", format!("{action} ok")),
            Err(e) => {
                failed += 1;
                wf.env.step(&host.name, "failed", format!("{e:#}"));
            }
        }
    }

    wf.env.set("datastore_name", json!(datastore_name));
    wf.env.set("hosts_processed", json!(total));
    if failed == 0 {
        wf.complete().await
    } else {
        wf.fail(&format!("{failed} of {total} hosts failed")).await
    }
}

/// `scan_datastore_status`: refresh capacity and accessibility for every
/// replication target that exposes a datastore. Best-effort: individual
/// failures become warnings and the sweep completes.
pub async fn scan_datastore_status(job: Job, ctx: Arc<ExecutorContext>) -> Result<()> {
    let mut wf = Workflow::begin(&ctx, &job).await?;

    wf.phase("scan", 10).await?;
    let targets = match ctx.coordinator.all_replication_targets().await {
        Ok(targets) => targets,
        Err(e) => return wf.fail(&format!("Could not load replication targets: {e:#}")).await,
    };
    let targets: Vec<_> = targets
        .into_iter()
        .filter(|t| t.datastore_name.is_some() && t.vcenter_id.is_some())
        .collect();

    let total = targets.len();
    let mut scanned = 0usize;

    for (index, target) in targets.iter().enumerate() {
        if wf.cancelled().await? {
            return wf.cancel().await;
        }
        wf.env
            .set_phase("scan", common::band_progress(10, 95, index, total));

        let datastore = target.datastore_name.clone().unwrap_or_default();
        let result = async {
            let vc =
                common::vcenter_endpoint(&ctx, job.id, target.vcenter_id.unwrap()).await?;
            let summary = ctx.vsphere.datastore_summary(&vc, &datastore).await?;
            anyhow::Ok(summary)
        }
        .await;

        match result {
            Ok(Some(summary)) => {
                scanned += 1;
                let patch = json!({
                    "datastore_capacity_bytes": summary.capacity,
                    "datastore_free_bytes": summary.free_space,
                    "health_status": if summary.accessible { "online" } else { "inaccessible" },
                    "last_seen_at": Utc::now(),
                });
                if let Err(e) = ctx.coordinator.patch_replication_target(target.id, patch).await {
                    wf.env.warn(format!("{}: could not record status: {e:#}", target.name));
                }
                wf.env.step(&target.name, "completed", format!("datastore {datastore} scanned"));
            }
            Ok(None) => {
                wf.env.warn(format!("{}: datastore {datastore} not found", target.name));
                wf.env.step(&target.name, "failed", "datastore not found");
            }
            Err(e) => {
                wf.env.warn(format!("{}: {e:#}", target.name));
                wf.env.step(&target.name, "failed", format!("{e:#}"));
            }
        }
    }

    wf.env.set("targets_scanned", json!(scanned));
    wf.env.set("targets_total", json!(total));
    wf.complete().await
}
