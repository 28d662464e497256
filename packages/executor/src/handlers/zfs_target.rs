//! ZFS storage appliance lifecycle: deployment from a template through
//! datastore registration, plus diagnostics, health checks, and
//! decommissioning.
//!
//! Deployment is the deepest workflow in the executor. Phases run strictly
//! in order, each one a cancellation checkpoint:
//!
//! ```text
//! clone → power_on → wait_tools → wait_ip → ssh_connect → zfs_create
//!       → nfs_setup → register_target → register_datastore → complete
//! ```
//!
//! Cleanup is a section, not an exception handler: it runs on the cancel
//! path and the error path, powers off and deletes a half-provisioned VM
//! (unless the target row was already registered), and drops any cached
//! session to the appliance.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, bail, Result};
use chrono::Utc;
use serde_json::json;

use super::common;
use crate::adapters::{CloneSpec, SshAuth, SshTarget, VcenterEndpoint, ZfsOps};
use crate::context::{ExecutorContext, Workflow};
use crate::coordinator::{Job, ZfsTemplateRecord};

const TOOLS_TIMEOUT: Duration = Duration::from_secs(300);
const IP_TIMEOUT: Duration = Duration::from_secs(300);
const WAIT_POLL: Duration = Duration::from_secs(5);
const SSH_TIMEOUT: Duration = Duration::from_secs(30);
const SSH_RETRIES: u32 = 5;

/// How a phase sequence ended short of success.
enum Flow {
    Done,
    Cancelled(&'static str),
}

struct DeployPlan {
    vc: VcenterEndpoint,
    template: ZfsTemplateRecord,
    vm_name: String,
    ssh_username: String,
    ssh_key: String,
    zfs_pool: String,
    zfs_disk_gb: u64,
    nfs_network: String,
    cpu_count: u64,
    memory_gb: u64,
    cluster: Option<String>,
    network: Option<String>,
    register_datastore: bool,
}

/// `deploy_zfs_target`: build a replication appliance from a template.
pub async fn deploy_zfs_target(job: Job, ctx: Arc<ExecutorContext>) -> Result<()> {
    let mut wf = Workflow::begin(&ctx, &job).await?;
    wf.info("Starting ZFS target deployment").await;

    let plan = match build_plan(&ctx, &job).await {
        Ok(plan) => plan,
        Err(e) => return wf.fail(&format!("{e:#}")).await,
    };
    wf.env.set("template_name", json!(plan.template.name));
    wf.env.set("vm_name", json!(plan.vm_name));
    wf.env.set("zfs_pool_name", json!(plan.zfs_pool));
    wf.flush().await?;

    match run_deploy(&mut wf, &ctx, &job, &plan).await {
        Ok(Flow::Done) => {
            if let Err(e) = ctx
                .coordinator
                .increment_template_deployments(plan.template.id)
                .await
            {
                wf.env
                    .warn(format!("could not bump template deployment count: {e:#}"));
            }
            wf.info("ZFS target deployment completed successfully").await;
            wf.complete().await
        }
        Ok(Flow::Cancelled(phase)) => {
            wf.console("WARN", &format!("cancellation observed during {phase}"))
                .await;
            cleanup(&mut wf, &ctx, &plan.vc).await;
            wf.cancel().await
        }
        Err(e) => {
            cleanup(&mut wf, &ctx, &plan.vc).await;
            wf.fail(&format!("{e:#}")).await
        }
    }
}

async fn build_plan(ctx: &Arc<ExecutorContext>, job: &Job) -> Result<DeployPlan> {
    let template_id = common::scope_uuid(job, "template_id")
        .map_err(|_| anyhow!("No template_id provided in job target_scope"))?;
    let template = ctx
        .coordinator
        .zfs_template_by_id(template_id)
        .await?
        .ok_or_else(|| anyhow!("Template {template_id} not found"))?;

    let template_name = template.name.clone().unwrap_or_else(|| template_id.to_string());
    if template.vcenter_id.is_none() {
        bail!("Template {template_name:?} is not linked to a manager");
    }
    if template.template_moref.is_none() {
        bail!("Template {template_name:?} has no template VM configured");
    }

    let vm_name = common::require_detail(job, "vm_name")?.to_string();

    let key_id = template
        .ssh_key_id
        .ok_or_else(|| anyhow!("Template {template_name:?} has no SSH key configured"))?;
    let key = ctx
        .coordinator
        .ssh_key_by_id(key_id)
        .await?
        .ok_or_else(|| anyhow!("SSH key {key_id} not found"))?;
    let ssh_key = ctx.credentials.decrypt(
        key.private_key_encrypted
            .as_deref()
            .ok_or_else(|| anyhow!("SSH key {key_id} has no private key material"))?,
    )?;

    let vc = common::vcenter_endpoint(ctx, job.id, template.vcenter_id.unwrap()).await?;

    Ok(DeployPlan {
        vc,
        vm_name,
        ssh_username: job
            .detail_str("ssh_username")
            .map(String::from)
            .or_else(|| template.default_ssh_username.clone())
            .unwrap_or_else(|| "root".to_string()),
        ssh_key,
        zfs_pool: job
            .detail_str("zfs_pool_name")
            .map(String::from)
            .or_else(|| template.default_zfs_pool.clone())
            .unwrap_or_else(|| "datapool".to_string()),
        zfs_disk_gb: job
            .detail_u64("zfs_disk_gb")
            .or(template.default_zfs_disk_gb)
            .unwrap_or(500),
        nfs_network: job
            .detail_str("nfs_network")
            .map(String::from)
            .or_else(|| template.default_nfs_network.clone())
            .unwrap_or_else(|| "10.0.0.0/8".to_string()),
        cpu_count: job.detail_u64("cpu_count").or(template.default_cpu).unwrap_or(2),
        memory_gb: job
            .detail_u64("memory_gb")
            .or(template.default_memory_gb)
            .unwrap_or(4),
        cluster: job
            .detail_str("cluster_name")
            .map(String::from)
            .or_else(|| template.default_cluster.clone()),
        network: job.detail_str("network_name").map(String::from),
        register_datastore: job.detail_bool("register_datastore").unwrap_or(true),
        template,
    })
}

async fn run_deploy(
    wf: &mut Workflow,
    ctx: &Arc<ExecutorContext>,
    job: &Job,
    plan: &DeployPlan,
) -> Result<Flow> {
    // Phase 1: clone the template.
    wf.phase("clone", 0).await?;
    if wf.cancelled().await? {
        return Ok(Flow::Cancelled("clone"));
    }
    let spec = CloneSpec {
        source: plan.template.template_moref.clone().unwrap_or_default(),
        name: plan.vm_name.clone(),
        cluster: plan.cluster.clone(),
        datastore: None,
        network: plan.network.clone(),
        cpu_count: Some(plan.cpu_count),
        memory_gb: Some(plan.memory_gb),
        data_disk_gb: if plan.template.use_template_disk.unwrap_or(false) {
            None
        } else {
            Some(plan.zfs_disk_gb)
        },
    };
    let vm_moref = ctx.vsphere.clone_template(&plan.vc, &spec).await?;
    wf.env.set("cloned_vm_moref", json!(vm_moref));
    wf.env.step("clone", "completed", format!("cloned as {vm_moref}"));
    wf.info(&format!("Cloned template to VM {vm_moref}")).await;

    // Phase 2: power on.
    wf.phase("power_on", 20).await?;
    if wf.cancelled().await? {
        return Ok(Flow::Cancelled("power_on"));
    }
    ctx.vsphere.power_on(&plan.vc, &vm_moref).await?;
    wf.env.step("power_on", "completed", "VM powered on");

    // Phase 3: wait for the guest agent.
    wf.phase("wait_tools", 25).await?;
    let started = std::time::Instant::now();
    loop {
        if wf.cancelled().await? {
            return Ok(Flow::Cancelled("wait_tools"));
        }
        if ctx.vsphere.tools_running(&plan.vc, &vm_moref).await? {
            break;
        }
        if started.elapsed() > TOOLS_TIMEOUT {
            bail!("guest agent did not come up within {}s", TOOLS_TIMEOUT.as_secs());
        }
        tokio::time::sleep(WAIT_POLL).await;
    }
    wf.env.step("wait_tools", "completed", "guest agent running");

    // Phase 4: wait for an IP address.
    wf.phase("wait_ip", 35).await?;
    let started = std::time::Instant::now();
    let detected_ip = loop {
        if wf.cancelled().await? {
            return Ok(Flow::Cancelled("wait_ip"));
        }
        if let Some(ip) = ctx.vsphere.guest_ip(&plan.vc, &vm_moref).await? {
            break ip;
        }
        if started.elapsed() > IP_TIMEOUT {
            bail!("VM did not report an IP address within {}s", IP_TIMEOUT.as_secs());
        }
        tokio::time::sleep(WAIT_POLL).await;
    };
    wf.env.set("detected_ip", json!(detected_ip));
    wf.env.step("wait_ip", "completed", detected_ip.clone());
    wf.info(&format!("VM reported IP {detected_ip}")).await;

    // Phase 5: SSH handshake, with retries while the guest finishes boot.
    wf.phase("ssh_connect", 40).await?;
    let ssh_target = SshTarget::new(
        detected_ip.clone(),
        plan.ssh_username.clone(),
        SshAuth::Key(plan.ssh_key.clone()),
    );
    let mut attempt = 0;
    loop {
        if wf.cancelled().await? {
            return Ok(Flow::Cancelled("ssh_connect"));
        }
        attempt += 1;
        match ctx.ssh.probe(&ssh_target, SSH_TIMEOUT).await {
            Ok(()) => break,
            Err(e) if attempt < SSH_RETRIES => {
                wf.console(
                    "WARN",
                    &format!("SSH attempt {attempt}/{SSH_RETRIES} failed: {e:#}"),
                )
                .await;
                tokio::time::sleep(WAIT_POLL).await;
            }
            Err(e) => bail!("SSH handshake failed after {SSH_RETRIES} attempts: {e:#}"),
        }
    }
    wf.env.step("ssh_connect", "completed", format!("connected as {}", plan.ssh_username));

    let runner = ctx.audited_ssh(job.id, None);
    let zfs = ZfsOps::new(&runner, &ssh_target);

    // Phase 6: create the pool.
    wf.phase("zfs_create", 50).await?;
    if wf.cancelled().await? {
        return Ok(Flow::Cancelled("zfs_create"));
    }
    let disk = match job.detail_str("zfs_device") {
        Some(device) => device.to_string(),
        None => zfs
            .detect_data_disk()
            .await?
            .ok_or_else(|| anyhow!("no unused data disk found for the ZFS pool"))?,
    };
    zfs.create_pool(&plan.zfs_pool, &disk).await?;
    let health = zfs.pool_health(&plan.zfs_pool).await?;
    if health != "ONLINE" {
        bail!("pool {} created but health is {health}", plan.zfs_pool);
    }
    wf.env.set("zfs_device", json!(disk));
    wf.env.step("zfs_create", "completed", format!("pool {} on {disk}", plan.zfs_pool));

    // Phase 7: NFS export.
    wf.phase("nfs_setup", 60).await?;
    if wf.cancelled().await? {
        return Ok(Flow::Cancelled("nfs_setup"));
    }
    zfs.set_sharenfs(&plan.zfs_pool, &plan.nfs_network).await?;
    let export_path = zfs.mountpoint(&plan.zfs_pool).await?;
    wf.env.set("nfs_export_path", json!(export_path));
    wf.env.step("nfs_setup", "completed", format!("exported {export_path}"));

    // Phase 8: register the target row.
    wf.phase("register_target", 75).await?;
    let target = ctx
        .coordinator
        .insert_replication_target(json!({
            "name": plan.vm_name,
            "hostname": detected_ip,
            "ssh_port": 22,
            "ssh_username": plan.ssh_username,
            "ssh_key_id": plan.template.ssh_key_id,
            "zfs_pool": plan.zfs_pool,
            "nfs_export_path": export_path,
            "status": "online",
            "health_status": "online",
            "vcenter_id": plan.template.vcenter_id,
            "deployed_job_id": job.id,
            "last_seen_at": Utc::now(),
        }))
        .await?;
    wf.env.set("replication_target_id", json!(target.id));
    wf.env.set("target_registered", json!(true));
    wf.env.step("register_target", "completed", format!("target {}", target.id));

    // Phase 9: mount the export as a datastore on every connected host.
    if plan.register_datastore {
        wf.phase("register_datastore", 85).await?;
        if wf.cancelled().await? {
            return Ok(Flow::Cancelled("register_datastore"));
        }
        let datastore_name = format!("{}-nfs", plan.vm_name);
        let hosts = ctx.vsphere.list_hosts(&plan.vc).await?;
        let mut mounted = 0usize;
        for host in hosts.iter().filter(|h| h.connected) {
            match ctx
                .vsphere
                .mount_nfs_datastore(&plan.vc, &host.host_id, &datastore_name, &detected_ip, &export_path)
                .await
            {
                Ok(()) => mounted += 1,
                Err(e) => wf.env.warn(format!("{}: datastore mount failed: {e:#}", host.name)),
            }
        }
        if mounted == 0 {
            bail!("datastore {datastore_name} could not be mounted on any host");
        }
        ctx.coordinator
            .patch_replication_target(target.id, json!({ "datastore_name": datastore_name }))
            .await?;
        wf.env.set("datastore_name", json!(datastore_name));
        wf.env.step(
            "register_datastore",
            "completed",
            format!("mounted on {mounted} host(s)"),
        );
    }

    Ok(Flow::Done)
}

/// Idempotent unwind of a partial deployment. Runs on the error path and
/// the cancel path; a registered target row means the appliance is live
/// and the VM must be kept.
async fn cleanup(wf: &mut Workflow, ctx: &Arc<ExecutorContext>, vc: &VcenterEndpoint) {
    if let Some(ip) = wf.env.get_str("detected_ip").map(String::from) {
        ctx.sessions.close(&ip).await;
    }

    let registered = wf.env.get_bool("target_registered").unwrap_or(false);
    let vm_moref = wf.env.get_str("cloned_vm_moref").map(String::from);
    if registered {
        return;
    }
    let Some(vm_moref) = vm_moref else { return };

    wf.console("WARN", &format!("cleaning up partially provisioned VM {vm_moref}"))
        .await;
    if let Err(e) = ctx.vsphere.power_off(vc, &vm_moref).await {
        wf.env.warn(format!("cleanup power-off failed: {e:#}"));
    }
    match ctx.vsphere.delete_vm(vc, &vm_moref).await {
        Ok(()) => {
            wf.env.set("cloned_vm_moref", serde_json::Value::Null);
            wf.console("INFO", &format!("deleted VM {vm_moref}")).await;
        }
        Err(e) => wf.env.warn(format!("cleanup delete failed: {e:#}")),
    }
}

/// `detect_disks`: list candidate data disks on an existing target.
pub async fn detect_disks(job: Job, ctx: Arc<ExecutorContext>) -> Result<()> {
    let mut wf = Workflow::begin(&ctx, &job).await?;

    let target = match load_target(&ctx, &job).await {
        Ok(target) => target,
        Err(e) => return wf.fail(&format!("{e:#}")).await,
    };
    let ssh_target = match common::target_ssh(&ctx, &target).await {
        Ok(t) => t,
        Err(e) => return wf.fail(&format!("{e:#}")).await,
    };

    wf.phase("detect", 30).await?;
    let runner = ctx.audited_ssh(job.id, None);
    let zfs = ZfsOps::new(&runner, &ssh_target);

    let listing = match ctx
        .run_ssh(job.id, None, &ssh_target, "lsblk -o NAME,SIZE,TYPE,MOUNTPOINT", SSH_TIMEOUT)
        .await
    {
        Ok(output) if output.success() => output.stdout,
        Ok(output) => return wf.fail(&format!("lsblk failed: {}", output.stderr.trim())).await,
        Err(e) => return wf.fail(&format!("SSH failed: {e:#}")).await,
    };
    let candidate = match zfs.detect_data_disk().await {
        Ok(candidate) => candidate,
        Err(e) => return wf.fail(&format!("disk detection failed: {e:#}")).await,
    };

    wf.env.set("disks", json!(listing));
    wf.env.set("candidate_disk", json!(candidate));
    wf.complete().await
}

/// `test_ssh_connection`: verify SSH access to a target and capture basic
/// host facts.
pub async fn test_ssh_connection(job: Job, ctx: Arc<ExecutorContext>) -> Result<()> {
    let mut wf = Workflow::begin(&ctx, &job).await?;

    let target = match load_target(&ctx, &job).await {
        Ok(target) => target,
        Err(e) => return wf.fail(&format!("{e:#}")).await,
    };
    let ssh_target = match common::target_ssh(&ctx, &target).await {
        Ok(t) => t,
        Err(e) => return wf.fail(&format!("{e:#}")).await,
    };

    wf.phase("connect", 40).await?;
    if let Err(e) = ctx.ssh.probe(&ssh_target, SSH_TIMEOUT).await {
        ctx.coordinator
            .patch_replication_target(target.id, json!({ "health_status": "unreachable" }))
            .await
            .ok();
        return wf.fail(&format!("SSH connection failed: {e:#}")).await;
    }

    wf.phase("facts", 70).await?;
    let runner = ctx.audited_ssh(job.id, None);
    let zfs = ZfsOps::new(&runner, &ssh_target);
    match zfs.hostname().await {
        Ok(hostname) => wf.env.set("remote_hostname", json!(hostname)),
        Err(e) => wf.env.warn(format!("could not read hostname: {e:#}")),
    }
    if let Ok(output) = ctx
        .run_ssh(job.id, None, &ssh_target, "uname -sr", SSH_TIMEOUT)
        .await
    {
        wf.env.set("remote_kernel", json!(output.stdout_trimmed()));
    }

    ctx.coordinator
        .patch_replication_target(
            target.id,
            json!({ "health_status": "online", "last_seen_at": Utc::now() }),
        )
        .await?;
    wf.complete().await
}

/// `check_zfs_target_health`: pool health and capacity sweep over every
/// target (or the scoped subset). Best-effort; per-target failures become
/// warnings and mark the row degraded.
pub async fn check_zfs_target_health(job: Job, ctx: Arc<ExecutorContext>) -> Result<()> {
    let mut wf = Workflow::begin(&ctx, &job).await?;

    let targets = match ctx.coordinator.all_replication_targets().await {
        Ok(all) => match common::scope_id_list(&job, "target_ids") {
            Ok(ids) => all.into_iter().filter(|t| ids.contains(&t.id)).collect(),
            Err(_) => all,
        },
        Err(e) => return wf.fail(&format!("Could not load targets: {e:#}")).await,
    };

    wf.phase("check", 10).await?;
    let total = targets.len();
    let mut healthy = 0usize;

    for (index, target) in targets.iter().enumerate() {
        if wf.cancelled().await? {
            return wf.cancel().await;
        }
        wf.env
            .set_phase("check", common::band_progress(10, 95, index, total));

        let result = async {
            let ssh_target = common::target_ssh(&ctx, target).await?;
            let runner = ctx.audited_ssh(job.id, None);
            let zfs = ZfsOps::new(&runner, &ssh_target);
            let pool = target
                .zfs_pool
                .clone()
                .ok_or_else(|| anyhow!("target has no pool configured"))?;
            let health = zfs.pool_health(&pool).await?;
            let (size, free) = zfs.pool_space(&pool).await?;
            anyhow::Ok((health, size, free))
        }
        .await;

        match result {
            Ok((health, size, free)) => {
                let status = if health == "ONLINE" { "online" } else { "degraded" };
                if status == "online" {
                    healthy += 1;
                } else {
                    wf.env.warn(format!("{}: pool health {health}", target.name));
                }
                ctx.coordinator
                    .patch_replication_target(
                        target.id,
                        json!({
                            "health_status": status,
                            "pool_size_bytes": size,
                            "pool_free_bytes": free,
                            "last_seen_at": Utc::now(),
                        }),
                    )
                    .await?;
                wf.env.step(&target.name, "completed", format!("{health}, {free} bytes free"));
            }
            Err(e) => {
                wf.env.warn(format!("{}: {e:#}", target.name));
                wf.env.step(&target.name, "failed", format!("{e:#}"));
                ctx.coordinator
                    .patch_replication_target(target.id, json!({ "health_status": "unreachable" }))
                    .await
                    .ok();
            }
        }
    }

    wf.env.set("targets_total", json!(total));
    wf.env.set("targets_healthy", json!(healthy));
    wf.complete().await
}

/// `decommission_zfs_target`: unmount the target's datastore from every
/// host and retire the inventory row.
pub async fn decommission_zfs_target(job: Job, ctx: Arc<ExecutorContext>) -> Result<()> {
    let mut wf = Workflow::begin(&ctx, &job).await?;

    let target = match load_target(&ctx, &job).await {
        Ok(target) => target,
        Err(e) => return wf.fail(&format!("{e:#}")).await,
    };

    if let (Some(datastore), Some(vcenter_id)) = (&target.datastore_name, target.vcenter_id) {
        wf.phase("unmount_datastore", 20).await?;
        match common::vcenter_endpoint(&ctx, job.id, vcenter_id).await {
            Ok(vc) => match ctx.vsphere.list_hosts(&vc).await {
                Ok(hosts) => {
                    for host in hosts.iter().filter(|h| h.connected) {
                        if wf.cancelled().await? {
                            return wf.cancel().await;
                        }
                        match ctx.vsphere.unmount_datastore(&vc, &host.host_id, datastore).await {
                            Ok(()) => wf.env.step(&host.name, "completed", "datastore unmounted"),
                            Err(e) => wf.env.warn(format!("{}: unmount failed: {e:#}", host.name)),
                        }
                    }
                }
                Err(e) => wf.env.warn(format!("could not list hosts: {e:#}")),
            },
            Err(e) => wf.env.warn(format!("manager unavailable: {e:#}")),
        }
    }

    wf.phase("retire", 80).await?;
    if job.detail_bool("delete_record").unwrap_or(false) {
        if let Err(e) = ctx.coordinator.delete_replication_target(target.id).await {
            return wf.fail(&format!("Could not delete target record: {e:#}")).await;
        }
        wf.env.step("retire", "completed", "record deleted");
    } else {
        if let Err(e) = ctx
            .coordinator
            .patch_replication_target(target.id, json!({ "status": "decommissioned" }))
            .await
        {
            return wf.fail(&format!("Could not retire target record: {e:#}")).await;
        }
        wf.env.step("retire", "completed", "status set to decommissioned");
    }
    wf.complete().await
}

async fn load_target(
    ctx: &Arc<ExecutorContext>,
    job: &Job,
) -> Result<crate::coordinator::ReplicationTargetRecord> {
    let target_id = common::scope_uuid(job, "target_id")?;
    ctx.coordinator
        .replication_target_by_id(target_id)
        .await?
        .ok_or_else(|| anyhow!("Replication target {target_id} not found"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coordinator::{JobStatus, ReplicationTargetRecord};
    use crate::testing::{encrypt_for_tests, seed_running_job, test_context, TestHarness};
    use uuid::Uuid;

    fn seed_deploy_fixtures(harness: &TestHarness) -> Uuid {
        let vcenter_id = Uuid::new_v4();
        let key_id = Uuid::new_v4();
        let template_id = Uuid::new_v4();
        harness.coordinator.seed(
            "vcenters",
            json!({"id": vcenter_id, "host": "vc.test", "username": "adm", "password_encrypted": encrypt_for_tests("pw")}),
        );
        harness.coordinator.seed(
            "ssh_keys",
            json!({"id": key_id, "private_key_encrypted": encrypt_for_tests("-----BEGIN TEST KEY-----")}),
        );
        harness.coordinator.seed(
            "zfs_target_templates",
            json!({
                "id": template_id,
                "name": "zfs-appliance",
                "vcenter_id": vcenter_id,
                "template_moref": "vm-template-1",
                "ssh_key_id": key_id,
                "default_zfs_pool": "datapool",
                "default_zfs_disk_gb": 500,
                "default_nfs_network": "10.0.0.0/8",
            }),
        );
        template_id
    }

    fn script_zfs_commands(harness: &TestHarness) {
        harness.ssh.respond("lsblk", 0, "/dev/sdb\n", "");
        harness.ssh.respond("zpool create", 0, "", "");
        harness.ssh.respond("zpool list -H -o health", 0, "ONLINE\n", "");
        harness.ssh.respond("zfs set sharenfs", 0, "", "");
        harness
            .ssh
            .respond("zfs get -H -o value mountpoint", 0, "/datapool\n", "");
    }

    #[tokio::test]
    async fn test_deploy_runs_phases_in_order() {
        let (ctx, harness) = test_context("w1");
        let template_id = seed_deploy_fixtures(&harness);
        script_zfs_commands(&harness);

        let job = seed_running_job(
            &ctx,
            "deploy_zfs_target",
            json!({"type": "specific", "template_id": template_id}),
            json!({"vm_name": "zfs-site-b"}),
        )
        .await;
        deploy_zfs_target(job.clone(), ctx.clone()).await.unwrap();

        let done = ctx.coordinator.get_job(job.id).await.unwrap().unwrap();
        assert_eq!(done.status, JobStatus::Completed, "{:?}", done.error);
        let details = done.details.unwrap();
        assert_eq!(details["current_phase"], "complete");
        assert_eq!(details["progress_percent"], 100);

        let steps: Vec<&str> = details["step_results"]
            .as_array()
            .unwrap()
            .iter()
            .map(|s| s["step"].as_str().unwrap())
            .collect();
        assert_eq!(
            steps,
            vec![
                "clone",
                "power_on",
                "wait_tools",
                "wait_ip",
                "ssh_connect",
                "zfs_create",
                "nfs_setup",
                "register_target",
                "register_datastore",
            ]
        );

        // The registered target row points back at this job.
        let targets: Vec<ReplicationTargetRecord> =
            harness.coordinator.rows_as("replication_targets");
        assert_eq!(targets.len(), 1);
        let target = &targets[0];
        assert_eq!(target.deployed_job_id, Some(job.id));
        assert_eq!(target.zfs_pool.as_deref(), Some("datapool"));
        assert_eq!(target.hostname, "10.0.0.50");
        assert_eq!(target.datastore_name.as_deref(), Some("zfs-site-b-nfs"));

        // Datastore mounted on the connected host.
        assert_eq!(harness.vsphere.mounted.lock().unwrap().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancellation_during_wait_ip_cleans_up() {
        let (ctx, harness) = test_context("w1");
        let template_id = seed_deploy_fixtures(&harness);
        harness.vsphere.never_report_ip();

        let job = seed_running_job(
            &ctx,
            "deploy_zfs_target",
            json!({"type": "specific", "template_id": template_id}),
            json!({"vm_name": "zfs-cancelled"}),
        )
        .await;

        // External mutator cancels the job while the handler polls for an
        // IP; the next checkpoint in the wait_ip loop must observe it.
        let store = harness.coordinator.clone();
        let job_id = job.id;
        harness.vsphere.set_on_ip_poll(move || {
            store.patch_sync("jobs", job_id, json!({"status": "cancelled"}));
        });

        deploy_zfs_target(job.clone(), ctx.clone()).await.unwrap();

        let done = ctx.coordinator.get_job(job.id).await.unwrap().unwrap();
        assert_eq!(done.status, JobStatus::Cancelled);

        // The half-provisioned VM was powered off and deleted.
        assert_eq!(harness.vsphere.deleted.lock().unwrap().len(), 1);

        // The console log records the cancellation for the operator.
        let details = done.details.unwrap();
        let log = details["console_log"]
            .as_array()
            .unwrap()
            .iter()
            .map(|l| l.as_str().unwrap().to_lowercase())
            .collect::<Vec<_>>()
            .join("\n");
        assert!(log.contains("cancelled by user"), "{log}");

        // No target row was registered.
        assert!(harness.coordinator.rows("replication_targets").is_empty());
    }

    #[tokio::test]
    async fn test_deploy_requires_vm_name() {
        let (ctx, harness) = test_context("w1");
        let template_id = seed_deploy_fixtures(&harness);

        let job = seed_running_job(
            &ctx,
            "deploy_zfs_target",
            json!({"type": "specific", "template_id": template_id}),
            json!({}),
        )
        .await;
        deploy_zfs_target(job.clone(), ctx.clone()).await.unwrap();

        let done = ctx.coordinator.get_job(job.id).await.unwrap().unwrap();
        assert_eq!(done.status, JobStatus::Failed);
        assert!(done.error.unwrap().contains("details.vm_name"));
    }
}
