//! Failover lifecycle for protection groups.
//!
//! - `test_failover`: clone the latest replicated snapshots on the
//!   destination and register throwaway VMs; fully reversible.
//! - `live_failover`: final sync, promote the destination datasets, and
//!   bring the VMs up at the destination site.
//! - `commit_failover`: accept a live failover; the source side becomes
//!   read-only.
//! - `rollback_failover`: tear down whatever a test failover created.
//!
//! Every run writes a `failover_events` row whose details carry the
//! per-VM artifacts (cloned dataset, registered VM id) that commit and
//! rollback later consume.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Result};
use chrono::Utc;
use serde_json::json;
use uuid::Uuid;

use super::common;
use crate::adapters::{SshTarget, ZfsOps};
use crate::context::{ExecutorContext, Workflow};
use crate::coordinator::{Job, ProtectionGroupRecord, ReplicationTargetRecord};

const SSH_TIMEOUT: Duration = Duration::from_secs(30);

struct FailoverSite {
    group: ProtectionGroupRecord,
    dest: ReplicationTargetRecord,
    dest_ssh: SshTarget,
    source: ReplicationTargetRecord,
    source_ssh: SshTarget,
}

async fn failover_site(ctx: &Arc<ExecutorContext>, group_id: Uuid) -> Result<FailoverSite> {
    let group = ctx
        .coordinator
        .protection_group_by_id(group_id)
        .await?
        .ok_or_else(|| anyhow!("Protection group {group_id} not found"))?;
    let pair_id = group
        .replication_pair_id
        .ok_or_else(|| anyhow!("Protection group {:?} has no replication pair", group.name))?;
    let pair = ctx
        .coordinator
        .replication_pair_by_id(pair_id)
        .await?
        .ok_or_else(|| anyhow!("Replication pair {pair_id} not found"))?;

    let source = ctx
        .coordinator
        .replication_target_by_id(pair.source_target_id)
        .await?
        .ok_or_else(|| anyhow!("source target not found"))?;
    let dest = ctx
        .coordinator
        .replication_target_by_id(pair.dest_target_id)
        .await?
        .ok_or_else(|| anyhow!("destination target not found"))?;

    let source_ssh = common::target_ssh(ctx, &source).await?;
    let dest_ssh = common::target_ssh(ctx, &dest).await?;
    Ok(FailoverSite {
        group,
        dest,
        dest_ssh,
        source,
        source_ssh,
    })
}

/// `test_failover`: bring clones of the replicated data up at the
/// destination without touching production.
pub async fn test_failover(job: Job, ctx: Arc<ExecutorContext>) -> Result<()> {
    let mut wf = Workflow::begin(&ctx, &job).await?;

    let group_id = match common::detail_uuid(&job, "protection_group_id") {
        Ok(id) => id,
        Err(e) => return wf.fail(&e.to_string()).await,
    };
    let site = match failover_site(&ctx, group_id).await {
        Ok(site) => site,
        Err(e) => return wf.fail(&format!("{e:#}")).await,
    };
    let vms = match ctx.coordinator.protected_vms(group_id).await {
        Ok(vms) if !vms.is_empty() => vms,
        Ok(_) => return wf.fail("Protection group has no protected VMs").await,
        Err(e) => return wf.fail(&format!("Could not load protected VMs: {e:#}")).await,
    };

    let event = match ctx
        .coordinator
        .insert_failover_event(group_id, "test", json!({ "vm_count": vms.len() }))
        .await
    {
        Ok(event) => event,
        Err(e) => return wf.fail(&format!("Could not record failover event: {e:#}")).await,
    };
    wf.env.set("failover_event_id", json!(event.id));

    let runner = ctx.audited_ssh(job.id, None);
    let zfs = ZfsOps::new(&runner, &site.dest_ssh);
    let dest_pool = site.dest.zfs_pool.clone().unwrap_or_else(|| "datapool".to_string());

    wf.phase("clone_snapshots", 20).await?;
    let total = vms.len();
    let mut artifacts = Vec::new();
    let mut failed = 0usize;

    for (index, vm) in vms.iter().enumerate() {
        if wf.cancelled().await? {
            finish_event(&ctx, event.id, "cancelled", &artifacts).await;
            return wf.cancel().await;
        }
        wf.env
            .set_phase("clone_snapshots", common::band_progress(20, 70, index, total));

        let dataset = format!("{dest_pool}/{}", vm.vm_name);
        let clone = format!("{dataset}-test");
        let result = async {
            let snapshots = zfs.list_snapshots(&dataset).await?;
            let latest = snapshots
                .last()
                .cloned()
                .ok_or_else(|| anyhow!("no replicated snapshot for {dataset}"))?;
            zfs.clone_snapshot(&latest, &clone).await?;
            anyhow::Ok(latest)
        }
        .await;

        match result {
            Ok(latest) => {
                artifacts.push(json!({ "vm_name": vm.vm_name, "cloned_dataset": clone, "from_snapshot": latest }));
                wf.env.step(&vm.vm_name, "completed", format!("cloned to {clone}"));
            }
            Err(e) => {
                failed += 1;
                wf.env.step(&vm.vm_name, "failed", format!("{e:#}"));
            }
        }
    }

    wf.phase("register_vms", 75).await?;
    if let Some(vcenter_id) = site.dest.vcenter_id {
        match common::vcenter_endpoint(&ctx, job.id, vcenter_id).await {
            Ok(vc) => match ctx.vsphere.list_hosts(&vc).await {
                Ok(hosts) => {
                    if let Some(host) = hosts.iter().find(|h| h.connected) {
                        for artifact in artifacts.iter_mut() {
                            let vm_name = artifact["vm_name"].as_str().unwrap_or_default().to_string();
                            let test_name = format!("{vm_name}-failover-test");
                            let path = format!(
                                "[{}] {vm_name}/{vm_name}.vmx",
                                site.dest.datastore_name.clone().unwrap_or_default()
                            );
                            match ctx.vsphere.register_vm(&vc, &host.host_id, &path, &test_name).await {
                                Ok(vm_id) => {
                                    artifact["registered_vm"] = json!(vm_id);
                                }
                                Err(e) => wf.env.warn(format!("{test_name}: register failed: {e:#}")),
                            }
                        }
                    }
                }
                Err(e) => wf.env.warn(format!("could not list destination hosts: {e:#}")),
            },
            Err(e) => wf.env.warn(format!("destination manager unavailable: {e:#}")),
        }
    }

    ctx.coordinator
        .patch_protection_group(group_id, json!({ "last_test_at": Utc::now() }))
        .await
        .ok();

    if failed == 0 {
        finish_event(&ctx, event.id, "completed", &artifacts).await;
        wf.env.set("artifacts", json!(artifacts));
        wf.complete().await
    } else {
        finish_event(&ctx, event.id, "failed", &artifacts).await;
        wf.fail(&format!("{failed} of {total} VMs failed to clone")).await
    }
}

/// `live_failover`: promote the destination copies and run production
/// there. Leaves the event awaiting an explicit commit.
pub async fn live_failover(job: Job, ctx: Arc<ExecutorContext>) -> Result<()> {
    let mut wf = Workflow::begin(&ctx, &job).await?;

    let group_id = match common::detail_uuid(&job, "protection_group_id") {
        Ok(id) => id,
        Err(e) => return wf.fail(&e.to_string()).await,
    };
    let site = match failover_site(&ctx, group_id).await {
        Ok(site) => site,
        Err(e) => return wf.fail(&format!("{e:#}")).await,
    };
    let vms = match ctx.coordinator.protected_vms(group_id).await {
        Ok(vms) if !vms.is_empty() => vms,
        Ok(_) => return wf.fail("Protection group has no protected VMs").await,
        Err(e) => return wf.fail(&format!("Could not load protected VMs: {e:#}")).await,
    };

    let event = match ctx
        .coordinator
        .insert_failover_event(group_id, "live", json!({ "vm_count": vms.len() }))
        .await
    {
        Ok(event) => event,
        Err(e) => return wf.fail(&format!("Could not record failover event: {e:#}")).await,
    };
    wf.env.set("failover_event_id", json!(event.id));

    let runner = ctx.audited_ssh(job.id, None);
    let source_zfs = ZfsOps::new(&runner, &site.source_ssh);
    let source_pool = site.source.zfs_pool.clone().unwrap_or_else(|| "datapool".to_string());
    let dest_pool = site.dest.zfs_pool.clone().unwrap_or_else(|| "datapool".to_string());

    // Final delta so the destination is as close to now as possible.
    wf.phase("final_sync", 15).await?;
    let snapshot_name = format!("failover-{}", Utc::now().format("%Y%m%d-%H%M%S"));
    let mut artifacts = Vec::new();
    let mut failed = 0usize;

    for vm in &vms {
        if wf.cancelled().await? {
            finish_event(&ctx, event.id, "cancelled", &artifacts).await;
            return wf.cancel().await;
        }
        let dataset = format!("{source_pool}/{}", vm.vm_name);
        let dest_dataset = format!("{dest_pool}/{}", vm.vm_name);
        let result = async {
            let previous = source_zfs.list_snapshots(&dataset).await?.into_iter().last();
            let previous_short = previous
                .as_deref()
                .and_then(|s| s.rsplit('@').next())
                .map(String::from);
            source_zfs.snapshot(&dataset, &snapshot_name).await?;
            source_zfs
                .send_incremental(
                    &dataset,
                    previous_short.as_deref(),
                    &snapshot_name,
                    &site.dest_ssh,
                    &dest_dataset,
                )
                .await?;
            anyhow::Ok(dest_dataset)
        }
        .await;

        match result {
            Ok(dest_dataset) => {
                artifacts.push(json!({ "vm_name": vm.vm_name, "dataset": dest_dataset }));
                wf.env.step(&vm.vm_name, "completed", "final delta sent");
            }
            Err(e) => {
                failed += 1;
                wf.env.step(&vm.vm_name, "failed", format!("final sync: {e:#}"));
            }
        }
    }
    if failed > 0 {
        finish_event(&ctx, event.id, "failed", &artifacts).await;
        return wf
            .fail(&format!("{failed} of {} VMs failed the final sync", vms.len()))
            .await;
    }

    // Promote the destination datasets.
    wf.phase("promote", 55).await?;
    let dest_zfs = ZfsOps::new(&runner, &site.dest_ssh);
    for artifact in &artifacts {
        let dataset = artifact["dataset"].as_str().unwrap_or_default();
        if let Err(e) = dest_zfs.promote(dataset).await {
            // Promotion only applies to clone-origin datasets; a received
            // dataset is already independent.
            wf.env.warn(format!("{dataset}: promote skipped: {e:#}"));
        }
    }

    // Bring the VMs up at the destination.
    wf.phase("start_vms", 75).await?;
    if let Some(vcenter_id) = site.dest.vcenter_id {
        match common::vcenter_endpoint(&ctx, job.id, vcenter_id).await {
            Ok(vc) => match ctx.vsphere.list_hosts(&vc).await {
                Ok(hosts) => {
                    if let Some(host) = hosts.iter().find(|h| h.connected) {
                        for artifact in &mut artifacts {
                            let vm_name = artifact["vm_name"].as_str().unwrap_or_default().to_string();
                            let path = format!(
                                "[{}] {vm_name}/{vm_name}.vmx",
                                site.dest.datastore_name.clone().unwrap_or_default()
                            );
                            match ctx.vsphere.register_vm(&vc, &host.host_id, &path, &vm_name).await {
                                Ok(vm_id) => {
                                    if let Err(e) = ctx.vsphere.power_on(&vc, &vm_id).await {
                                        wf.env.warn(format!("{vm_name}: power on failed: {e:#}"));
                                    }
                                    artifact["registered_vm"] = json!(vm_id);
                                }
                                Err(e) => wf.env.warn(format!("{vm_name}: register failed: {e:#}")),
                            }
                        }
                    }
                }
                Err(e) => wf.env.warn(format!("could not list destination hosts: {e:#}")),
            },
            Err(e) => wf.env.warn(format!("destination manager unavailable: {e:#}")),
        }
    }

    ctx.coordinator
        .patch_protection_group(group_id, json!({ "status": "failed_over" }))
        .await
        .ok();
    ctx.coordinator
        .patch_failover_event(
            event.id,
            json!({ "status": "awaiting_commit", "details": { "artifacts": artifacts } }),
        )
        .await
        .ok();

    wf.env.set("artifacts", json!(artifacts));
    wf.complete().await
}

/// `commit_failover`: accept a live failover. The source copies become
/// read-only so nothing diverges silently.
pub async fn commit_failover(job: Job, ctx: Arc<ExecutorContext>) -> Result<()> {
    let mut wf = Workflow::begin(&ctx, &job).await?;

    let group_id = match common::detail_uuid(&job, "protection_group_id") {
        Ok(id) => id,
        Err(e) => return wf.fail(&e.to_string()).await,
    };
    let event = match ctx
        .coordinator
        .latest_failover_event(group_id, "live", "awaiting_commit")
        .await
    {
        Ok(Some(event)) => event,
        Ok(None) => return wf.fail("No live failover is awaiting commit").await,
        Err(e) => return wf.fail(&format!("Could not load failover event: {e:#}")).await,
    };
    let site = match failover_site(&ctx, group_id).await {
        Ok(site) => site,
        Err(e) => return wf.fail(&format!("{e:#}")).await,
    };

    wf.phase("freeze_source", 40).await?;
    let source_pool = site.source.zfs_pool.clone().unwrap_or_else(|| "datapool".to_string());
    let freeze = ctx
        .run_ssh(
            job.id,
            None,
            &site.source_ssh,
            &format!("zfs set readonly=on {source_pool}"),
            SSH_TIMEOUT,
        )
        .await;
    match freeze {
        Ok(output) if output.success() => {
            wf.env.step("freeze_source", "completed", "source pool is read-only")
        }
        Ok(output) => {
            return wf
                .fail(&format!("could not freeze source: {}", output.stderr.trim()))
                .await
        }
        Err(e) => return wf.fail(&format!("could not freeze source: {e:#}")).await,
    }

    wf.phase("record", 85).await?;
    ctx.coordinator
        .patch_failover_event(
            event.id,
            json!({ "status": "committed", "completed_at": Utc::now() }),
        )
        .await
        .ok();
    ctx.coordinator
        .patch_protection_group(group_id, json!({ "status": "committed_failover" }))
        .await
        .ok();
    wf.complete().await
}

/// `rollback_failover`: undo a test failover. Powers off and deletes the
/// registered VMs, destroy the cloned datasets.
pub async fn rollback_failover(job: Job, ctx: Arc<ExecutorContext>) -> Result<()> {
    let mut wf = Workflow::begin(&ctx, &job).await?;

    let group_id = match common::detail_uuid(&job, "protection_group_id") {
        Ok(id) => id,
        Err(e) => return wf.fail(&e.to_string()).await,
    };
    let event = match ctx
        .coordinator
        .latest_failover_event(group_id, "test", "completed")
        .await
    {
        Ok(Some(event)) => event,
        Ok(None) => return wf.fail("No completed test failover to roll back").await,
        Err(e) => return wf.fail(&format!("Could not load failover event: {e:#}")).await,
    };
    let site = match failover_site(&ctx, group_id).await {
        Ok(site) => site,
        Err(e) => return wf.fail(&format!("{e:#}")).await,
    };

    let artifacts = event
        .details
        .as_ref()
        .and_then(|d| d.get("artifacts"))
        .and_then(|a| a.as_array())
        .cloned()
        .unwrap_or_default();

    // Destination VMs first, then the datasets behind them.
    wf.phase("remove_vms", 25).await?;
    if let Some(vcenter_id) = site.dest.vcenter_id {
        if let Ok(vc) = common::vcenter_endpoint(&ctx, job.id, vcenter_id).await {
            for artifact in &artifacts {
                if let Some(vm_id) = artifact.get("registered_vm").and_then(|v| v.as_str()) {
                    if let Err(e) = ctx.vsphere.power_off(&vc, vm_id).await {
                        wf.env.warn(format!("{vm_id}: power off failed: {e:#}"));
                    }
                    match ctx.vsphere.delete_vm(&vc, vm_id).await {
                        Ok(()) => wf.env.step(vm_id, "completed", "test VM removed"),
                        Err(e) => wf.env.warn(format!("{vm_id}: delete failed: {e:#}")),
                    }
                }
            }
        }
    }

    wf.phase("destroy_clones", 65).await?;
    let runner = ctx.audited_ssh(job.id, None);
    let dest_zfs = ZfsOps::new(&runner, &site.dest_ssh);
    let mut failed = 0usize;
    for artifact in &artifacts {
        if let Some(dataset) = artifact.get("cloned_dataset").and_then(|v| v.as_str()) {
            match dest_zfs.destroy_dataset(dataset).await {
                Ok(()) => wf.env.step(dataset, "completed", "clone destroyed"),
                Err(e) => {
                    failed += 1;
                    wf.env.step(dataset, "failed", format!("{e:#}"));
                }
            }
        }
    }

    ctx.coordinator
        .patch_failover_event(
            event.id,
            json!({ "status": "rolled_back", "completed_at": Utc::now() }),
        )
        .await
        .ok();

    if failed == 0 {
        wf.complete().await
    } else {
        wf.fail(&format!("{failed} clone(s) could not be destroyed")).await
    }
}

async fn finish_event(
    ctx: &Arc<ExecutorContext>,
    event_id: Uuid,
    status: &str,
    artifacts: &[serde_json::Value],
) {
    ctx.coordinator
        .patch_failover_event(
            event_id,
            json!({
                "status": status,
                "completed_at": Utc::now(),
                "details": { "artifacts": artifacts },
            }),
        )
        .await
        .ok();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coordinator::JobStatus;
    use crate::testing::{encrypt_for_tests, seed_running_job, test_context, TestHarness};

    fn seed_failover_group(harness: &TestHarness) -> Uuid {
        let source_id = Uuid::new_v4();
        let dest_id = Uuid::new_v4();
        let pair_id = Uuid::new_v4();
        let group_id = Uuid::new_v4();
        let vcenter_id = Uuid::new_v4();

        harness.coordinator.seed(
            "vcenters",
            json!({"id": vcenter_id, "host": "vc-b.test", "username": "adm", "password_encrypted": encrypt_for_tests("pw")}),
        );
        for (id, name, host, vc) in [
            (source_id, "site-a", "10.0.0.61", None),
            (dest_id, "site-b", "10.0.0.62", Some(vcenter_id)),
        ] {
            harness.coordinator.seed(
                "replication_targets",
                json!({
                    "id": id,
                    "name": name,
                    "hostname": host,
                    "ssh_username": "root",
                    "ssh_password_encrypted": encrypt_for_tests("pw"),
                    "zfs_pool": "datapool",
                    "vcenter_id": vc,
                    "datastore_name": if vc.is_some() { Some("site-b-nfs") } else { None },
                }),
            );
        }
        harness.coordinator.seed(
            "replication_pairs",
            json!({"id": pair_id, "source_target_id": source_id, "dest_target_id": dest_id}),
        );
        harness.coordinator.seed(
            "protection_groups",
            json!({
                "id": group_id,
                "name": "crm",
                "target_id": source_id,
                "replication_pair_id": pair_id,
            }),
        );
        harness.coordinator.seed(
            "protected_vms",
            json!({"id": Uuid::new_v4(), "protection_group_id": group_id, "vm_name": "web"}),
        );
        group_id
    }

    #[tokio::test]
    async fn test_test_failover_clones_and_records_event() {
        let (ctx, harness) = test_context("w1");
        let group_id = seed_failover_group(&harness);
        harness.ssh.respond(
            "zfs list -H -t snapshot",
            0,
            "datapool/web@repl-20240101-000000\n",
            "",
        );
        harness.ssh.respond("zfs clone", 0, "", "");

        let job = seed_running_job(
            &ctx,
            "test_failover",
            json!({}),
            json!({"protection_group_id": group_id}),
        )
        .await;
        test_failover(job.clone(), ctx.clone()).await.unwrap();

        let done = ctx.coordinator.get_job(job.id).await.unwrap().unwrap();
        assert_eq!(done.status, JobStatus::Completed, "{:?}", done.error);

        let events = harness.coordinator.rows("failover_events");
        assert_eq!(events.len(), 1);
        assert_eq!(events[0]["status"], "completed");
        assert_eq!(events[0]["failover_type"], "test");
        assert_eq!(
            events[0]["details"]["artifacts"][0]["cloned_dataset"],
            "datapool/web-test"
        );

        // A test VM was registered at the destination.
        assert_eq!(harness.vsphere.registered.lock().unwrap().len(), 1);

        // The group records the test.
        let group = harness.coordinator.row_by_id("protection_groups", group_id).unwrap();
        assert!(group["last_test_at"].is_string());
    }

    #[tokio::test]
    async fn test_rollback_requires_completed_test() {
        let (ctx, harness) = test_context("w1");
        let group_id = seed_failover_group(&harness);

        let job = seed_running_job(
            &ctx,
            "rollback_failover",
            json!({}),
            json!({"protection_group_id": group_id}),
        )
        .await;
        rollback_failover(job.clone(), ctx.clone()).await.unwrap();

        let done = ctx.coordinator.get_job(job.id).await.unwrap().unwrap();
        assert_eq!(done.status, JobStatus::Failed);
        assert!(done.error.unwrap().contains("No completed test failover"));
    }
}
