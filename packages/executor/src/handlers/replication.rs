//! ZFS replication: per-group sync, pair testing, pause/resume, metrics
//! collection, key exchange, and retention-config sync.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, bail, Result};
use chrono::Utc;
use serde_json::json;
use uuid::Uuid;

use super::common;
use crate::adapters::{SshTarget, ZfsOps};
use crate::context::{ExecutorContext, Workflow};
use crate::coordinator::{
    Job, ProtectionGroupRecord, ReplicationMetricsRow, ReplicationTargetRecord,
};

const SSH_TIMEOUT: Duration = Duration::from_secs(30);

struct GroupEndpoints {
    group: ProtectionGroupRecord,
    source: ReplicationTargetRecord,
    source_ssh: SshTarget,
    dest: Option<(ReplicationTargetRecord, SshTarget)>,
}

/// Resolve the group, its source target, and (when a pair is configured)
/// the destination target.
async fn group_endpoints(ctx: &Arc<ExecutorContext>, group_id: Uuid) -> Result<GroupEndpoints> {
    let group = ctx
        .coordinator
        .protection_group_by_id(group_id)
        .await?
        .ok_or_else(|| anyhow!("Protection group {group_id} not found"))?;

    let source_id = group
        .target_id
        .ok_or_else(|| anyhow!("Protection group {:?} has no replication target", group.name))?;
    let source = ctx
        .coordinator
        .replication_target_by_id(source_id)
        .await?
        .ok_or_else(|| anyhow!("Replication target {source_id} not found"))?;
    let source_ssh = common::target_ssh(ctx, &source).await?;

    let dest = match group.replication_pair_id {
        Some(pair_id) => {
            let pair = ctx
                .coordinator
                .replication_pair_by_id(pair_id)
                .await?
                .ok_or_else(|| anyhow!("Replication pair {pair_id} not found"))?;
            let dest_id = if pair.source_target_id == source.id {
                pair.dest_target_id
            } else {
                pair.source_target_id
            };
            let record = ctx
                .coordinator
                .replication_target_by_id(dest_id)
                .await?
                .ok_or_else(|| anyhow!("Replication target {dest_id} not found"))?;
            let ssh = common::target_ssh(ctx, &record).await?;
            Some((record, ssh))
        }
        None => None,
    };

    Ok(GroupEndpoints {
        group,
        source,
        source_ssh,
        dest,
    })
}

/// `run_replication_sync`: snapshot and incrementally replicate every
/// protected VM in a group, then roll the group's RPO bookkeeping.
pub async fn run_replication_sync(job: Job, ctx: Arc<ExecutorContext>) -> Result<()> {
    let mut wf = Workflow::begin(&ctx, &job).await?;

    let group_id = match common::detail_uuid(&job, "protection_group_id") {
        Ok(id) => id,
        Err(e) => return wf.fail(&e.to_string()).await,
    };

    wf.phase("load_group", 5).await?;
    let endpoints = match group_endpoints(&ctx, group_id).await {
        Ok(endpoints) => endpoints,
        Err(e) => return wf.fail(&format!("{e:#}")).await,
    };
    if endpoints.group.paused_at.is_some() {
        return wf.fail("Protection group is paused").await;
    }
    wf.env.set("group_name", json!(endpoints.group.name));

    let vms = match ctx.coordinator.protected_vms(group_id).await {
        Ok(vms) => vms,
        Err(e) => return wf.fail(&format!("Could not load protected VMs: {e:#}")).await,
    };
    if vms.is_empty() {
        wf.info("No protected VMs in group").await;
    }

    ctx.coordinator
        .patch_protection_group(group_id, json!({ "sync_in_progress": true }))
        .await
        .ok();

    let snapshot_name = format!("repl-{}", Utc::now().format("%Y%m%d-%H%M%S"));
    let runner = ctx.audited_ssh(job.id, None);
    let zfs = ZfsOps::new(&runner, &endpoints.source_ssh);
    let pool = endpoints.source.zfs_pool.clone().unwrap_or_else(|| "datapool".to_string());

    wf.phase("sync", 10).await?;
    let total = vms.len();
    let mut synced = 0u64;
    let mut total_bytes = 0u64;
    let mut errors: Vec<String> = Vec::new();

    for (index, vm) in vms.iter().enumerate() {
        if wf.cancelled().await? {
            ctx.coordinator
                .patch_protection_group(group_id, json!({ "sync_in_progress": false }))
                .await
                .ok();
            return wf.cancel().await;
        }
        wf.env
            .set_phase("sync", common::band_progress(10, 85, index, total));
        wf.info(&format!("Syncing VM {}", vm.vm_name)).await;

        ctx.coordinator
            .patch_protected_vm(vm.id, json!({ "replication_status": "syncing" }))
            .await
            .ok();

        let dataset = vm
            .dataset
            .clone()
            .unwrap_or_else(|| format!("{pool}/{}", vm.vm_name));

        let result = async {
            let previous = zfs.list_snapshots(&dataset).await?.into_iter().last();
            let previous_short = previous
                .as_deref()
                .and_then(|s| s.rsplit('@').next())
                .map(String::from);

            zfs.snapshot(&dataset, &snapshot_name).await?;

            let bytes = match &endpoints.dest {
                Some((dest_record, dest_ssh)) => {
                    let dest_pool = dest_record
                        .zfs_pool
                        .clone()
                        .unwrap_or_else(|| "datapool".to_string());
                    let dest_dataset = format!("{dest_pool}/{}", vm.vm_name);
                    zfs.send_incremental(
                        &dataset,
                        previous_short.as_deref(),
                        &snapshot_name,
                        dest_ssh,
                        &dest_dataset,
                    )
                    .await?
                }
                None => bail!("no replication pair configured for group"),
            };
            anyhow::Ok(bytes)
        }
        .await;

        match result {
            Ok(bytes) => {
                synced += 1;
                total_bytes += bytes;
                let now = Utc::now();
                ctx.coordinator
                    .patch_protected_vm(
                        vm.id,
                        json!({
                            "replication_status": "synced",
                            "last_snapshot_at": now,
                            "last_replication_at": now,
                            "status_message": serde_json::Value::Null,
                        }),
                    )
                    .await
                    .ok();
                wf.env.step(
                    &vm.vm_name,
                    "completed",
                    format!("{snapshot_name}, {bytes} bytes"),
                );
            }
            Err(e) => {
                let message = format!("{e:#}");
                errors.push(format!("{}: {message}", vm.vm_name));
                ctx.coordinator
                    .patch_protected_vm(
                        vm.id,
                        json!({ "replication_status": "error", "status_message": message }),
                    )
                    .await
                    .ok();
                wf.env.step(&vm.vm_name, "failed", message.clone());
                wf.console("ERROR", &format!("{}: {message}", vm.vm_name)).await;
            }
        }
    }

    // Roll the group's bookkeeping even on partial failure; the data that
    // did move still counts against the RPO.
    wf.phase("record", 90).await?;
    let now = Utc::now();
    ctx.coordinator
        .patch_protection_group(
            group_id,
            json!({
                "last_replication_at": now,
                "current_rpo_seconds": 0,
                "sync_in_progress": false,
                "status": if errors.is_empty() { "meeting_sla" } else { "warning" },
            }),
        )
        .await
        .ok();
    ctx.coordinator
        .insert_replication_metrics(&ReplicationMetricsRow {
            protection_group_id: group_id,
            current_rpo_seconds: 0,
            bytes_transferred: Some(total_bytes),
            throughput_mbps: None,
            vms_synced: Some(synced),
            recorded_at: now,
        })
        .await
        .ok();

    wf.env.set("vms_synced", json!(synced));
    wf.env.set("total_bytes", json!(total_bytes));
    wf.env.set("snapshot_name", json!(snapshot_name));

    if errors.is_empty() {
        wf.complete().await
    } else {
        wf.fail(&format!("{} of {total} VMs failed to sync", errors.len()))
            .await
    }
}

/// `test_replication_pair`: verify both endpoints of a pair are reachable
/// and that the source can reach the destination over SSH.
pub async fn test_replication_pair(job: Job, ctx: Arc<ExecutorContext>) -> Result<()> {
    let mut wf = Workflow::begin(&ctx, &job).await?;

    let pair_id = match common::detail_uuid(&job, "pair_id") {
        Ok(id) => id,
        Err(e) => return wf.fail(&e.to_string()).await,
    };
    let pair = match ctx.coordinator.replication_pair_by_id(pair_id).await {
        Ok(Some(pair)) => pair,
        Ok(None) => return wf.fail(&format!("Replication pair {pair_id} not found")).await,
        Err(e) => return wf.fail(&format!("Could not load pair: {e:#}")).await,
    };

    let mut failures = 0usize;
    let mut dest_host = String::new();

    wf.phase("probe_endpoints", 20).await?;
    for (label, target_id) in [
        ("source", pair.source_target_id),
        ("destination", pair.dest_target_id),
    ] {
        let result = async {
            let record = ctx
                .coordinator
                .replication_target_by_id(target_id)
                .await?
                .ok_or_else(|| anyhow!("target {target_id} not found"))?;
            let ssh = common::target_ssh(&ctx, &record).await?;
            ctx.ssh.probe(&ssh, SSH_TIMEOUT).await?;
            anyhow::Ok(record.hostname)
        }
        .await;

        match result {
            Ok(hostname) => {
                if label == "destination" {
                    dest_host = hostname.clone();
                }
                wf.env.step(label, "completed", hostname);
            }
            Err(e) => {
                failures += 1;
                wf.env.step(label, "failed", format!("{e:#}"));
            }
        }
    }

    // Source→destination trust, the path `zfs send | ssh` uses.
    if failures == 0 {
        wf.phase("probe_pair_path", 70).await?;
        let source = ctx
            .coordinator
            .replication_target_by_id(pair.source_target_id)
            .await
            .ok()
            .flatten();
        if let Some(source) = source {
            match common::target_ssh(&ctx, &source).await {
                Ok(ssh) => {
                    let output = ctx
                        .run_ssh(
                            job.id,
                            None,
                            &ssh,
                            &format!("ssh -o StrictHostKeyChecking=no -o BatchMode=yes {dest_host} true"),
                            SSH_TIMEOUT,
                        )
                        .await;
                    match output {
                        Ok(out) if out.success() => {
                            wf.env.step("pair_path", "completed", "source can reach destination")
                        }
                        Ok(out) => {
                            failures += 1;
                            wf.env.step("pair_path", "failed", out.stderr.trim().to_string());
                        }
                        Err(e) => {
                            failures += 1;
                            wf.env.step("pair_path", "failed", format!("{e:#}"));
                        }
                    }
                }
                Err(e) => {
                    failures += 1;
                    wf.env.step("pair_path", "failed", format!("{e:#}"));
                }
            }
        }
    }

    let status = if failures == 0 { "healthy" } else { "broken" };
    ctx.coordinator
        .api()
        .patch(
            "replication_pairs",
            &[crate::coordinator::Filter::eq("id", pair_id)],
            json!({ "status": status }),
        )
        .await
        .ok();

    if failures == 0 {
        wf.complete().await
    } else {
        wf.fail(&format!("{failures} pair check(s) failed")).await
    }
}

/// `pause_protection_group`: suspend scheduling and RPO accounting.
pub async fn pause_protection_group(job: Job, ctx: Arc<ExecutorContext>) -> Result<()> {
    let mut wf = Workflow::begin(&ctx, &job).await?;
    let group_id = match common::detail_uuid(&job, "protection_group_id") {
        Ok(id) => id,
        Err(e) => return wf.fail(&e.to_string()).await,
    };

    wf.phase("pause", 50).await?;
    match ctx
        .coordinator
        .patch_protection_group(
            group_id,
            json!({ "paused_at": Utc::now(), "status": "paused" }),
        )
        .await
    {
        Ok(()) => {
            wf.info("Protection group paused").await;
            wf.complete().await
        }
        Err(e) => wf.fail(&format!("Could not pause group: {e:#}")).await,
    }
}

/// `resume_protection_group`: clear the pause; the next monitor pass
/// recomputes the SLA status.
pub async fn resume_protection_group(job: Job, ctx: Arc<ExecutorContext>) -> Result<()> {
    let mut wf = Workflow::begin(&ctx, &job).await?;
    let group_id = match common::detail_uuid(&job, "protection_group_id") {
        Ok(id) => id,
        Err(e) => return wf.fail(&e.to_string()).await,
    };

    wf.phase("resume", 50).await?;
    match ctx
        .coordinator
        .patch_protection_group(
            group_id,
            json!({ "paused_at": serde_json::Value::Null, "status": "unknown" }),
        )
        .await
    {
        Ok(()) => {
            wf.info("Protection group resumed").await;
            wf.complete().await
        }
        Err(e) => wf.fail(&format!("Could not resume group: {e:#}")).await,
    }
}

/// `collect_replication_metrics`: record a point-in-time RPO sample for
/// every group. Best-effort sweep.
pub async fn collect_replication_metrics(job: Job, ctx: Arc<ExecutorContext>) -> Result<()> {
    let mut wf = Workflow::begin(&ctx, &job).await?;

    wf.phase("collect", 10).await?;
    let groups = match ctx.coordinator.all_protection_groups().await {
        Ok(groups) => groups,
        Err(e) => return wf.fail(&format!("Could not load groups: {e:#}")).await,
    };

    let now = Utc::now();
    let total = groups.len();
    let mut recorded = 0usize;

    for (index, group) in groups.iter().enumerate() {
        if wf.cancelled().await? {
            return wf.cancel().await;
        }
        wf.env
            .set_phase("collect", common::band_progress(10, 95, index, total));

        let rpo_seconds = current_rpo_seconds(group.last_replication_at, now);
        let row = ReplicationMetricsRow {
            protection_group_id: group.id,
            current_rpo_seconds: rpo_seconds,
            bytes_transferred: None,
            throughput_mbps: None,
            vms_synced: None,
            recorded_at: now,
        };
        match ctx.coordinator.insert_replication_metrics(&row).await {
            Ok(()) => {
                recorded += 1;
                ctx.coordinator
                    .patch_protection_group(group.id, json!({ "current_rpo_seconds": rpo_seconds }))
                    .await
                    .ok();
            }
            Err(e) => wf.env.warn(format!("{}: {e:#}", group.name)),
        }
    }

    wf.env.set("groups_recorded", json!(recorded));
    wf.complete().await
}

/// RPO in seconds; never-replicated groups report a sentinel far above
/// any realistic target.
pub fn current_rpo_seconds(
    last_replication_at: Option<chrono::DateTime<Utc>>,
    now: chrono::DateTime<Utc>,
) -> i64 {
    match last_replication_at {
        Some(last) => (now - last).num_seconds().max(0),
        None => 999_999,
    }
}

/// `exchange_ssh_keys`: establish source→destination trust for the
/// send/receive pipeline, generating a keypair on the source if needed.
pub async fn exchange_ssh_keys(job: Job, ctx: Arc<ExecutorContext>) -> Result<()> {
    let mut wf = Workflow::begin(&ctx, &job).await?;

    let source_id = match common::detail_uuid(&job, "source_target_id") {
        Ok(id) => id,
        Err(e) => return wf.fail(&e.to_string()).await,
    };
    let dest_id = match common::detail_uuid(&job, "dest_target_id") {
        Ok(id) => id,
        Err(e) => return wf.fail(&e.to_string()).await,
    };

    let (source, dest) = match load_pair_targets(&ctx, source_id, dest_id).await {
        Ok(pair) => pair,
        Err(e) => return wf.fail(&format!("{e:#}")).await,
    };
    let source_ssh = match common::target_ssh(&ctx, &source).await {
        Ok(t) => t,
        Err(e) => return wf.fail(&format!("{e:#}")).await,
    };
    let dest_ssh = match common::target_ssh(&ctx, &dest).await {
        Ok(t) => t,
        Err(e) => return wf.fail(&format!("{e:#}")).await,
    };

    // Reuse the source's keypair or generate one.
    wf.phase("source_key", 20).await?;
    let pub_key = {
        let read = ctx
            .run_ssh(job.id, None, &source_ssh, "cat ~/.ssh/id_ed25519.pub", SSH_TIMEOUT)
            .await;
        match read {
            Ok(output) if output.success() && !output.stdout_trimmed().is_empty() => {
                output.stdout_trimmed().to_string()
            }
            _ => {
                wf.info("Generating keypair on source").await;
                let generate = ctx
                    .run_ssh(
                        job.id,
                        None,
                        &source_ssh,
                        "ssh-keygen -t ed25519 -N '' -f ~/.ssh/id_ed25519 -q && cat ~/.ssh/id_ed25519.pub",
                        SSH_TIMEOUT,
                    )
                    .await;
                match generate {
                    Ok(output) if output.success() => output.stdout_trimmed().to_string(),
                    Ok(output) => {
                        return wf
                            .fail(&format!("keygen failed: {}", output.stderr.trim()))
                            .await
                    }
                    Err(e) => return wf.fail(&format!("keygen failed: {e:#}")).await,
                }
            }
        }
    };
    wf.env.step("source_key", "completed", "public key available");

    // Install it on the destination.
    wf.phase("install_key", 55).await?;
    if wf.cancelled().await? {
        return wf.cancel().await;
    }
    let install = ctx
        .run_ssh(
            job.id,
            None,
            &dest_ssh,
            &format!(
                "mkdir -p ~/.ssh && grep -qxF '{pub_key}' ~/.ssh/authorized_keys 2>/dev/null || echo '{pub_key}' >> ~/.ssh/authorized_keys"
            ),
            SSH_TIMEOUT,
        )
        .await;
    match install {
        Ok(output) if output.success() => {
            wf.env.step("install_key", "completed", "key authorized on destination")
        }
        Ok(output) => {
            return wf
                .fail(&format!("could not install key: {}", output.stderr.trim()))
                .await
        }
        Err(e) => return wf.fail(&format!("could not install key: {e:#}")).await,
    }

    // Prove the path works.
    wf.phase("verify_trust", 85).await?;
    let verify = ctx
        .run_ssh(
            job.id,
            None,
            &source_ssh,
            &format!(
                "ssh -o StrictHostKeyChecking=no -o BatchMode=yes {} true",
                dest.hostname
            ),
            SSH_TIMEOUT,
        )
        .await;
    match verify {
        Ok(output) if output.success() => {
            let now = Utc::now();
            ctx.coordinator
                .patch_replication_target(
                    source.id,
                    json!({ "trusts_target_id": dest.id, "last_seen_at": now }),
                )
                .await
                .ok();
            wf.env.step("verify_trust", "completed", "source reaches destination");
            wf.complete().await
        }
        Ok(output) => {
            wf.env.step("verify_trust", "failed", output.stderr.trim().to_string());
            wf.fail("key installed but source still cannot reach destination")
                .await
        }
        Err(e) => wf.fail(&format!("trust verification failed: {e:#}")).await,
    }
}

async fn load_pair_targets(
    ctx: &Arc<ExecutorContext>,
    source_id: Uuid,
    dest_id: Uuid,
) -> Result<(ReplicationTargetRecord, ReplicationTargetRecord)> {
    let source = ctx
        .coordinator
        .replication_target_by_id(source_id)
        .await?
        .ok_or_else(|| anyhow!("source target {source_id} not found"))?;
    let dest = ctx
        .coordinator
        .replication_target_by_id(dest_id)
        .await?
        .ok_or_else(|| anyhow!("destination target {dest_id} not found"))?;
    Ok((source, dest))
}

/// `sync_protection_config`: render the snapshot retention config for a
/// group and install it on the source appliance.
pub async fn sync_protection_config(job: Job, ctx: Arc<ExecutorContext>) -> Result<()> {
    let mut wf = Workflow::begin(&ctx, &job).await?;

    let group_id = match common::detail_uuid(&job, "protection_group_id") {
        Ok(id) => id,
        Err(e) => return wf.fail(&e.to_string()).await,
    };
    let endpoints = match group_endpoints(&ctx, group_id).await {
        Ok(endpoints) => endpoints,
        Err(e) => return wf.fail(&format!("{e:#}")).await,
    };

    let pool = endpoints.source.zfs_pool.clone().unwrap_or_else(|| "datapool".to_string());
    let config = render_retention_config(&endpoints.group, &pool);

    wf.phase("install_config", 40).await?;
    let install = ctx
        .run_ssh(
            job.id,
            None,
            &endpoints.source_ssh,
            &format!("mkdir -p /etc/sanoid && cat > /etc/sanoid/sanoid.conf <<'EOF'\n{config}\nEOF"),
            SSH_TIMEOUT,
        )
        .await;
    match install {
        Ok(output) if output.success() => {
            wf.env.step("install_config", "completed", "retention config installed");
            wf.env.set("config_bytes", json!(config.len()));
            wf.complete().await
        }
        Ok(output) => {
            wf.fail(&format!("config install failed: {}", output.stderr.trim()))
                .await
        }
        Err(e) => wf.fail(&format!("config install failed: {e:#}")).await,
    }
}

/// Snapshot retention stanza derived from the group's RPO target.
pub fn render_retention_config(group: &ProtectionGroupRecord, pool: &str) -> String {
    let rpo_minutes = group.rpo_minutes.unwrap_or(60).max(1);
    // Keep roughly a day of snapshots at the replication cadence.
    let frequently = (24 * 60 / rpo_minutes).clamp(4, 96);
    format!(
        "[{pool}]\n\
         use_template = production\n\
         recursive = yes\n\n\
         [template_production]\n\
         frequently = {frequently}\n\
         hourly = 48\n\
         daily = 14\n\
         monthly = 3\n\
         autosnap = yes\n\
         autoprune = yes\n"
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coordinator::JobStatus;
    use crate::testing::{encrypt_for_tests, seed_running_job, test_context, TestHarness};
    use chrono::TimeZone;

    struct Fixtures {
        group_id: Uuid,
    }

    fn seed_group(harness: &TestHarness, vm_names: &[&str]) -> Fixtures {
        let source_id = Uuid::new_v4();
        let dest_id = Uuid::new_v4();
        let pair_id = Uuid::new_v4();
        let group_id = Uuid::new_v4();

        for (id, name, host) in [
            (source_id, "site-a", "10.0.0.61"),
            (dest_id, "site-b", "10.0.0.62"),
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
                "is_enabled": true,
                "rpo_minutes": 15,
                "target_id": source_id,
                "replication_pair_id": pair_id,
            }),
        );
        for name in vm_names {
            harness.coordinator.seed(
                "protected_vms",
                json!({
                    "id": Uuid::new_v4(),
                    "protection_group_id": group_id,
                    "vm_name": name,
                }),
            );
        }
        Fixtures { group_id }
    }

    fn script_sync_commands(harness: &TestHarness) {
        harness.ssh.respond(
            "zfs list -H -t snapshot",
            0,
            "datapool/web@repl-20240101-000000\n",
            "",
        );
        harness.ssh.respond("zfs snapshot", 0, "", "");
        harness.ssh.respond("zfs send -nP", 0, "size\t4096\n", "");
        harness.ssh.respond("zfs send", 0, "", "");
    }

    #[tokio::test]
    async fn test_sync_replicates_each_vm_and_rolls_group() {
        let (ctx, harness) = test_context("w1");
        let fixtures = seed_group(&harness, &["web", "db"]);
        script_sync_commands(&harness);

        let job = seed_running_job(
            &ctx,
            "run_replication_sync",
            json!({}),
            json!({"protection_group_id": fixtures.group_id}),
        )
        .await;
        run_replication_sync(job.clone(), ctx.clone()).await.unwrap();

        let done = ctx.coordinator.get_job(job.id).await.unwrap().unwrap();
        assert_eq!(done.status, JobStatus::Completed, "{:?}", done.error);
        let details = done.details.unwrap();
        assert_eq!(details["vms_synced"], 2);
        assert_eq!(details["total_bytes"], 8192);

        // Group bookkeeping rolled forward.
        let group = harness
            .coordinator
            .row_by_id("protection_groups", fixtures.group_id)
            .unwrap();
        assert_eq!(group["current_rpo_seconds"], 0);
        assert_eq!(group["sync_in_progress"], false);
        assert_eq!(group["status"], "meeting_sla");
        assert!(group["last_replication_at"].is_string());

        // One metrics row for the sweep.
        assert_eq!(harness.coordinator.rows("replication_metrics").len(), 1);

        // The send pipeline actually targeted the destination.
        let commands = harness.ssh.commands_for("10.0.0.61");
        assert!(commands.iter().any(|c| c.contains("zfs receive")));
    }

    #[tokio::test]
    async fn test_sync_fails_when_group_paused() {
        let (ctx, harness) = test_context("w1");
        let fixtures = seed_group(&harness, &["web"]);
        harness.coordinator.patch_sync(
            "protection_groups",
            fixtures.group_id,
            json!({"paused_at": "2024-01-01T00:00:00Z"}),
        );

        let job = seed_running_job(
            &ctx,
            "run_replication_sync",
            json!({}),
            json!({"protection_group_id": fixtures.group_id}),
        )
        .await;
        run_replication_sync(job.clone(), ctx.clone()).await.unwrap();

        let done = ctx.coordinator.get_job(job.id).await.unwrap().unwrap();
        assert_eq!(done.status, JobStatus::Failed);
        assert!(done.error.unwrap().contains("paused"));
    }

    #[test]
    fn test_current_rpo_seconds() {
        let now = Utc.with_ymd_and_hms(2025, 6, 1, 12, 0, 0).unwrap();
        assert_eq!(current_rpo_seconds(None, now), 999_999);
        let last = now - chrono::Duration::minutes(20);
        assert_eq!(current_rpo_seconds(Some(last), now), 1200);
    }

    #[test]
    fn test_retention_config_scales_with_rpo() {
        let group: ProtectionGroupRecord = serde_json::from_value(json!({
            "id": Uuid::new_v4(),
            "name": "crm",
            "rpo_minutes": 15,
        }))
        .unwrap();
        let config = render_retention_config(&group, "datapool");
        assert!(config.starts_with("[datapool]"));
        assert!(config.contains("frequently = 96"));
    }
}
