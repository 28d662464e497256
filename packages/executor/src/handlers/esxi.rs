//! Hypervisor host upgrades over SSH, coordinated with the manager's
//! maintenance mode.
//!
//! The upgrade workflow per host: connect → read version → coredump
//! preflight (warn-only) → enter maintenance → apply bundle → reboot →
//! wait for reconnect → verify version → exit maintenance. Maintenance
//! exit is always attempted once maintenance was entered, even when an
//! earlier step failed.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, bail, Result};
use chrono::Utc;
use serde_json::json;

use super::{common, firmware};
use crate::adapters::{SshAuth, SshTarget};
use crate::context::{ExecutorContext, Workflow};
use crate::coordinator::{EsxiHostRecord, Job, JobStatus};

const SSH_TIMEOUT: Duration = Duration::from_secs(30);
const APPLY_TIMEOUT: Duration = Duration::from_secs(30 * 60);
const RECONNECT_TIMEOUT: Duration = Duration::from_secs(600);
const RECONNECT_POLL: Duration = Duration::from_secs(15);

async fn host_access(
    ctx: &Arc<ExecutorContext>,
    host_id: uuid::Uuid,
) -> Result<(EsxiHostRecord, SshTarget)> {
    let record = ctx
        .coordinator
        .esxi_host_by_id(host_id)
        .await?
        .ok_or_else(|| anyhow!("hypervisor host {host_id} not found"))?;
    let username = record
        .ssh_username
        .clone()
        .ok_or_else(|| anyhow!("host {} has no SSH username", record.hostname))?;
    let encrypted = record
        .ssh_password_encrypted
        .clone()
        .ok_or_else(|| anyhow!("host {} has no SSH password", record.hostname))?;
    let password = ctx.credentials.decrypt(&encrypted)?;
    let ssh = SshTarget::new(record.mgmt_ip.clone(), username, SshAuth::Password(password));
    Ok((record, ssh))
}

async fn read_version(
    ctx: &Arc<ExecutorContext>,
    job_id: uuid::Uuid,
    ssh: &SshTarget,
) -> Result<String> {
    let output = ctx.run_ssh(job_id, None, ssh, "vmware -v", SSH_TIMEOUT).await?;
    if !output.success() {
        bail!("could not read version: {}", output.stderr.trim());
    }
    Ok(output.stdout_trimmed().to_string())
}

/// `esxi_preflight_check`: connectivity, version, and coredump status for
/// each host in scope; nothing is changed.
pub async fn esxi_preflight_check(job: Job, ctx: Arc<ExecutorContext>) -> Result<()> {
    let mut wf = Workflow::begin(&ctx, &job).await?;

    let host_ids = match common::scope_id_list(&job, "host_ids") {
        Ok(ids) => ids,
        Err(e) => return wf.fail(&e.to_string()).await,
    };

    wf.phase("preflight", 10).await?;
    let total = host_ids.len();
    let mut failed = 0usize;

    for (index, host_id) in host_ids.iter().enumerate() {
        if wf.cancelled().await? {
            return wf.cancel().await;
        }
        wf.env
            .set_phase("preflight", common::band_progress(10, 95, index, total));

        let result = async {
            let (record, ssh) = host_access(&ctx, *host_id).await?;
            let version = read_version(&ctx, job.id, &ssh).await?;
            let coredump = ctx
                .run_ssh(job.id, None, &ssh, "esxcli system coredump partition get", SSH_TIMEOUT)
                .await?;
            anyhow::Ok((record, version, coredump_configured(&coredump.stdout)))
        }
        .await;

        match result {
            Ok((record, version, coredump_ok)) => {
                wf.env.step(
                    &record.hostname,
                    "completed",
                    format!("{version}; coredump {}", if coredump_ok { "configured" } else { "NOT configured" }),
                );
                if !coredump_ok {
                    wf.env
                        .warn(format!("{}: coredump partition not configured", record.hostname));
                }
            }
            Err(e) => {
                failed += 1;
                wf.env.step(&host_id.to_string(), "failed", format!("{e:#}"));
            }
        }
    }

    if failed == 0 {
        wf.complete().await
    } else {
        wf.fail(&format!("{failed} of {total} hosts failed preflight")).await
    }
}

fn coredump_configured(stdout: &str) -> bool {
    let lower = stdout.to_lowercase();
    lower.contains("active:") && !lower.contains("active: \n") && !lower.contains("not set")
}

/// `esxi_upgrade`: run the full upgrade workflow on each host in scope,
/// strictly one host at a time.
pub async fn esxi_upgrade(job: Job, ctx: Arc<ExecutorContext>) -> Result<()> {
    let mut wf = Workflow::begin(&ctx, &job).await?;

    let bundle_path = match common::require_detail(&job, "bundle_path") {
        Ok(v) => v.to_string(),
        Err(e) => return wf.fail(&e.to_string()).await,
    };
    let profile_name = match common::require_detail(&job, "profile_name") {
        Ok(v) => v.to_string(),
        Err(e) => return wf.fail(&e.to_string()).await,
    };
    let host_ids = match common::scope_id_list(&job, "host_ids") {
        Ok(ids) => ids,
        Err(e) => return wf.fail(&e.to_string()).await,
    };

    let total = host_ids.len();
    for (index, host_id) in host_ids.iter().enumerate() {
        if wf.cancelled().await? {
            return wf.cancel().await;
        }

        let (record, ssh) = match host_access(&ctx, *host_id).await {
            Ok(access) => access,
            Err(e) => return wf.fail(&e.to_string()).await,
        };
        wf.info(&format!(
            "Upgrading {} ({}/{})",
            record.hostname,
            index + 1,
            total
        ))
        .await;

        // Per-host task row so a multi-host job reports each outcome.
        let task = ctx.create_task(job.id, None, Some(record.id)).await?;
        ctx.set_task_status(task.id, JobStatus::Running, None, Some(0))
            .await?;

        if let Err(e) =
            upgrade_host(&mut wf, &ctx, &job, &record, &ssh, &bundle_path, &profile_name).await
        {
            // A cancel observed at an inner checkpoint surfaces here.
            if wf.cancelled().await? {
                ctx.set_task_status(task.id, JobStatus::Cancelled, None, None)
                    .await?;
                return wf.cancel().await;
            }
            let message = format!("{e:#}");
            ctx.set_task_status(task.id, JobStatus::Failed, Some(&message), None)
                .await?;
            wf.env.step(&record.hostname, "failed", message.clone());
            return wf
                .fail(&format!("Upgrade of {} failed: {message}", record.hostname))
                .await;
        }
        ctx.set_task_status(task.id, JobStatus::Completed, None, Some(100))
            .await?;
        wf.env.step(&record.hostname, "completed", "upgrade finished");
    }

    wf.complete().await
}

/// The single-host upgrade sequence. Reused by the combined workflows.
pub(crate) async fn upgrade_host(
    wf: &mut Workflow,
    ctx: &Arc<ExecutorContext>,
    job: &Job,
    record: &EsxiHostRecord,
    ssh: &SshTarget,
    bundle_path: &str,
    profile_name: &str,
) -> Result<()> {
    wf.phase("ssh_connect", 5).await?;
    ctx.ssh.probe(ssh, SSH_TIMEOUT).await?;

    wf.phase("read_version", 10).await?;
    let version_before = read_version(ctx, job.id, ssh).await?;
    wf.env.set("version_before", json!(version_before));
    wf.info(&format!("{}: current version {version_before}", record.hostname))
        .await;

    wf.phase("coredump_check", 15).await?;
    let coredump = ctx
        .run_ssh(job.id, None, ssh, "esxcli system coredump partition get", SSH_TIMEOUT)
        .await?;
    if !coredump_configured(&coredump.stdout) {
        wf.env
            .warn(format!("{}: coredump partition not configured", record.hostname));
    }

    if wf.cancelled().await? {
        bail!("cancelled before entering maintenance mode");
    }

    // Maintenance mode through the manager, when the host is linked to one.
    let maintenance = match (&record.vcenter_id, &record.vcenter_host_id) {
        (Some(vcenter_id), Some(vcenter_host_id)) => {
            wf.phase("enter_maintenance", 20).await?;
            let vc = common::vcenter_endpoint(ctx, job.id, *vcenter_id).await?;
            ctx.vsphere.enter_maintenance(&vc, vcenter_host_id).await?;
            Some((vc, vcenter_host_id.clone()))
        }
        _ => {
            wf.info(&format!(
                "{}: not linked to a manager, skipping maintenance mode",
                record.hostname
            ))
            .await;
            None
        }
    };

    // From here on, always attempt to exit maintenance before returning.
    let upgrade_result = run_upgrade_steps(wf, ctx, job, record, ssh, bundle_path, profile_name).await;

    if let Some((vc, vcenter_host_id)) = maintenance {
        wf.phase("exit_maintenance", 95).await?;
        if let Err(e) = ctx.vsphere.exit_maintenance(&vc, &vcenter_host_id).await {
            wf.env.warn(format!(
                "{}: could not exit maintenance mode: {e:#}",
                record.hostname
            ));
        }
    }

    upgrade_result
}

async fn run_upgrade_steps(
    wf: &mut Workflow,
    ctx: &Arc<ExecutorContext>,
    job: &Job,
    record: &EsxiHostRecord,
    ssh: &SshTarget,
    bundle_path: &str,
    profile_name: &str,
) -> Result<()> {
    wf.phase("apply_upgrade", 30).await?;
    let apply = ctx
        .run_ssh(
            job.id,
            None,
            ssh,
            &format!("esxcli software profile update -d {bundle_path} -p {profile_name}"),
            APPLY_TIMEOUT,
        )
        .await?;
    if !apply.success() {
        bail!("upgrade command failed: {}", apply.stderr.trim());
    }

    wf.phase("reboot", 55).await?;
    // The connection often drops mid-command; that still counts as initiated.
    match ctx.run_ssh(job.id, None, ssh, "reboot", SSH_TIMEOUT).await {
        Ok(output) if !output.success() => {
            bail!("reboot command failed: {}", output.stderr.trim())
        }
        _ => {}
    }

    wf.phase("wait_reconnect", 60).await?;
    wait_for_reconnect(wf, ctx, ssh).await?;

    wf.phase("verify_version", 85).await?;
    let version_after = read_version(ctx, job.id, ssh).await?;
    wf.env.set("version_after", json!(version_after.clone()));
    wf.info(&format!("{}: version now {version_after}", record.hostname))
        .await;

    ctx.coordinator
        .patch_esxi_host(
            record.id,
            json!({ "version": version_after, "status": "online" }),
        )
        .await?;
    Ok(())
}

/// Bounded reconnect poll; every iteration is a cancellation checkpoint.
async fn wait_for_reconnect(
    wf: &mut Workflow,
    ctx: &Arc<ExecutorContext>,
    ssh: &SshTarget,
) -> Result<()> {
    let started = std::time::Instant::now();
    loop {
        if wf.cancelled().await? {
            bail!("cancelled while waiting for host to reconnect");
        }
        if ctx.ssh.probe(ssh, SSH_TIMEOUT).await.is_ok() {
            return Ok(());
        }
        if started.elapsed() > RECONNECT_TIMEOUT {
            bail!("host did not reconnect within {}s", RECONNECT_TIMEOUT.as_secs());
        }
        tokio::time::sleep(RECONNECT_POLL).await;
    }
}

/// `esxi_then_firmware`: upgrade the hypervisor, then apply server
/// firmware through the out-of-band controller.
pub async fn esxi_then_firmware(job: Job, ctx: Arc<ExecutorContext>) -> Result<()> {
    combined(job, ctx, true).await
}

/// `firmware_then_esxi`: firmware first, hypervisor upgrade second.
pub async fn firmware_then_esxi(job: Job, ctx: Arc<ExecutorContext>) -> Result<()> {
    combined(job, ctx, false).await
}

async fn combined(job: Job, ctx: Arc<ExecutorContext>, esxi_first: bool) -> Result<()> {
    let mut wf = Workflow::begin(&ctx, &job).await?;

    let host_id = match common::scope_uuid(&job, "host_id") {
        Ok(id) => id,
        Err(e) => return wf.fail(&e.to_string()).await,
    };
    let server_id = match common::scope_uuid(&job, "server_id") {
        Ok(id) => id,
        Err(e) => return wf.fail(&e.to_string()).await,
    };
    let bundle_path = match common::require_detail(&job, "bundle_path") {
        Ok(v) => v.to_string(),
        Err(e) => return wf.fail(&e.to_string()).await,
    };
    let profile_name = match common::require_detail(&job, "profile_name") {
        Ok(v) => v.to_string(),
        Err(e) => return wf.fail(&e.to_string()).await,
    };
    let package_url = match common::require_detail(&job, "package_url") {
        Ok(v) => v.to_string(),
        Err(e) => return wf.fail(&e.to_string()).await,
    };

    let server = match ctx.coordinator.server_by_id(server_id).await {
        Ok(Some(server)) => server,
        Ok(None) => return wf.fail(&format!("Server {server_id} not found")).await,
        Err(e) => return wf.fail(&format!("Could not load server: {e:#}")).await,
    };
    let (record, ssh) = match host_access(&ctx, host_id).await {
        Ok(access) => access,
        Err(e) => return wf.fail(&e.to_string()).await,
    };

    let package_name = package_url.rsplit('/').next().unwrap_or("firmware.bin").to_string();
    let package = match firmware_package(&ctx, &package_url).await {
        Ok(bytes) => bytes,
        Err(e) => return wf.fail(&format!("Could not fetch package: {e:#}")).await,
    };

    let steps: [&str; 2] = if esxi_first {
        ["esxi_upgrade", "firmware_update"]
    } else {
        ["firmware_update", "esxi_upgrade"]
    };

    for step in steps {
        if wf.cancelled().await? {
            return wf.cancel().await;
        }
        let result = match step {
            "esxi_upgrade" => {
                upgrade_host(&mut wf, &ctx, &job, &record, &ssh, &bundle_path, &profile_name).await
            }
            _ => {
                firmware::apply_to_server(
                    &mut wf,
                    &ctx,
                    &job,
                    &server,
                    &package_name,
                    package.clone(),
                )
                .await
            }
        };
        match result {
            Ok(()) => wf.env.step(step, "completed", record.hostname.clone()),
            Err(e) => {
                if wf.cancelled().await? {
                    return wf.cancel().await;
                }
                wf.env.step(step, "failed", format!("{e:#}"));
                return wf.fail(&format!("{step} failed: {e:#}")).await;
            }
        }
    }

    wf.env.set("completed_at_host", json!(record.hostname));
    wf.env.set("finished", json!(Utc::now()));
    wf.complete().await
}

async fn firmware_package(ctx: &Arc<ExecutorContext>, url: &str) -> Result<Vec<u8>> {
    let client = reqwest::Client::builder()
        .timeout(Duration::from_secs(300))
        .danger_accept_invalid_certs(!ctx.config.verify_tls)
        .build()?;
    let response = client.get(url).send().await?;
    if !response.status().is_success() {
        bail!("package server returned {}", response.status());
    }
    Ok(response.bytes().await?.to_vec())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coordinator::JobStatus;
    use crate::testing::{encrypt_for_tests, seed_running_job, test_context};
    use uuid::Uuid;

    #[tokio::test]
    async fn test_upgrade_enters_and_exits_maintenance() {
        let (ctx, harness) = test_context("w1");
        let host_id = Uuid::new_v4();
        let vcenter_id = Uuid::new_v4();
        harness.coordinator.seed(
            "vcenters",
            json!({
                "id": vcenter_id,
                "host": "vc.test",
                "username": "administrator",
                "password_encrypted": encrypt_for_tests("vcpass"),
            }),
        );
        harness.coordinator.seed(
            "esxi_hosts",
            json!({
                "id": host_id,
                "vcenter_id": vcenter_id,
                "vcenter_host_id": "host-1",
                "hostname": "esxi-01",
                "mgmt_ip": "10.0.1.10",
                "ssh_username": "root",
                "ssh_password_encrypted": encrypt_for_tests("esxpass"),
            }),
        );
        harness
            .ssh
            .respond("vmware -v", 0, "VMware ESXi 8.0.3 build-24022510", "");
        harness.ssh.respond(
            "esxcli system coredump partition get",
            0,
            "Active: naa.5000\nConfigured: naa.5000",
            "",
        );
        harness
            .ssh
            .respond("esxcli software profile update", 0, "Update Result: completed", "");

        let job = seed_running_job(
            &ctx,
            "esxi_upgrade",
            json!({"type": "specific", "host_ids": [host_id]}),
            json!({
                "bundle_path": "/vmfs/volumes/ds1/ESXi-8.0U3.zip",
                "profile_name": "ESXi-8.0U3-standard",
            }),
        )
        .await;
        esxi_upgrade(job.clone(), ctx.clone()).await.unwrap();

        let done = ctx.coordinator.get_job(job.id).await.unwrap().unwrap();
        assert_eq!(done.status, JobStatus::Completed, "{:?}", done.error);

        // Maintenance mode was entered and then exited again.
        assert!(harness.vsphere.maintenance.lock().unwrap().is_empty());

        // The host row records the verified version.
        let row = harness.coordinator.row_by_id("esxi_hosts", host_id).unwrap();
        assert_eq!(row["version"], "VMware ESXi 8.0.3 build-24022510");

        // The upgrade command actually ran over SSH.
        let commands = harness.ssh.commands_for("10.0.1.10");
        assert!(commands
            .iter()
            .any(|c| c.starts_with("esxcli software profile update")));
        assert!(commands.iter().any(|c| c == "reboot"));

        // A completed per-host task row was reported.
        let tasks = harness.coordinator.rows("tasks");
        assert_eq!(tasks.len(), 1);
        assert_eq!(tasks[0]["status"], "completed");
        assert_eq!(tasks[0]["vcenter_host_id"], json!(host_id));
    }

    #[tokio::test]
    async fn test_upgrade_requires_bundle_details() {
        let (ctx, _) = test_context("w1");
        let job = seed_running_job(
            &ctx,
            "esxi_upgrade",
            json!({"type": "specific", "host_ids": [Uuid::new_v4()]}),
            json!({"profile_name": "p"}),
        )
        .await;
        esxi_upgrade(job.clone(), ctx.clone()).await.unwrap();
        let done = ctx.coordinator.get_job(job.id).await.unwrap().unwrap();
        assert_eq!(done.status, JobStatus::Failed);
        assert!(done.error.unwrap().contains("details.bundle_path"));
    }
}
