//! Appliance template maintenance: validation and cross-datastore copies.

use std::sync::Arc;

use anyhow::Result;
use serde_json::json;

use super::common;
use crate::adapters::CloneSpec;
use crate::context::{ExecutorContext, Workflow};
use crate::coordinator::Job;

/// `validate_zfs_template`: verify a deployment template is usable before
/// anyone builds an appliance from it. Nothing is changed; each check is
/// recorded as a step result.
pub async fn validate_zfs_template(job: Job, ctx: Arc<ExecutorContext>) -> Result<()> {
    let mut wf = Workflow::begin(&ctx, &job).await?;

    let template_id = match common::scope_uuid(&job, "template_id") {
        Ok(id) => id,
        Err(e) => return wf.fail(&e.to_string()).await,
    };

    wf.phase("load_template", 10).await?;
    let template = match ctx.coordinator.zfs_template_by_id(template_id).await {
        Ok(Some(template)) => template,
        Ok(None) => return wf.fail(&format!("Template {template_id} not found")).await,
        Err(e) => return wf.fail(&format!("Could not load template: {e:#}")).await,
    };
    let template_name = template.name.clone().unwrap_or_else(|| template_id.to_string());

    let mut failures = 0usize;

    wf.phase("check_manager_link", 30).await?;
    match template.vcenter_id {
        Some(vcenter_id) => match common::vcenter_endpoint(&ctx, job.id, vcenter_id).await {
            Ok(vc) => match ctx.vsphere.list_hosts(&vc).await {
                Ok(hosts) => wf.env.step(
                    "manager_link",
                    "completed",
                    format!("manager reachable, {} hosts", hosts.len()),
                ),
                Err(e) => {
                    failures += 1;
                    wf.env.step("manager_link", "failed", format!("manager unreachable: {e:#}"));
                }
            },
            Err(e) => {
                failures += 1;
                wf.env.step("manager_link", "failed", format!("{e:#}"));
            }
        },
        None => {
            failures += 1;
            wf.env.step(
                "manager_link",
                "failed",
                format!("template {template_name:?} is not linked to a manager"),
            );
        }
    }

    wf.phase("check_source_vm", 55).await?;
    match &template.template_moref {
        Some(moref) => wf.env.step("source_vm", "completed", format!("template VM {moref}")),
        None => {
            failures += 1;
            wf.env.step(
                "source_vm",
                "failed",
                format!("template {template_name:?} has no template VM configured"),
            );
        }
    }

    wf.phase("check_ssh_key", 80).await?;
    match template.ssh_key_id {
        Some(key_id) => match ctx.coordinator.ssh_key_by_id(key_id).await {
            Ok(Some(key)) => {
                match key
                    .private_key_encrypted
                    .as_deref()
                    .map(|blob| ctx.credentials.decrypt(blob))
                {
                    Some(Ok(_)) => wf.env.step("ssh_key", "completed", "key decrypts"),
                    Some(Err(e)) => {
                        failures += 1;
                        wf.env.step("ssh_key", "failed", format!("key does not decrypt: {e:#}"));
                    }
                    None => {
                        failures += 1;
                        wf.env.step("ssh_key", "failed", "key has no private material");
                    }
                }
            }
            Ok(None) => {
                failures += 1;
                wf.env.step("ssh_key", "failed", format!("SSH key {key_id} not found"));
            }
            Err(e) => {
                failures += 1;
                wf.env.step("ssh_key", "failed", format!("{e:#}"));
            }
        },
        None => {
            failures += 1;
            wf.env.step("ssh_key", "failed", "template has no SSH key configured");
        }
    }

    wf.env.set("template_name", json!(template_name));
    wf.env.set("checks_failed", json!(failures));
    if failures == 0 {
        wf.complete().await
    } else {
        wf.fail(&format!("{failures} validation check(s) failed")).await
    }
}

/// `copy_template`: clone a template VM onto another datastore (same
/// manager), producing a placement copy for remote clusters.
pub async fn copy_template(job: Job, ctx: Arc<ExecutorContext>) -> Result<()> {
    let mut wf = Workflow::begin(&ctx, &job).await?;

    let template_id = match common::scope_uuid(&job, "template_id") {
        Ok(id) => id,
        Err(e) => return wf.fail(&e.to_string()).await,
    };
    let target_datastore = match common::require_detail(&job, "target_datastore") {
        Ok(v) => v.to_string(),
        Err(e) => return wf.fail(&e.to_string()).await,
    };

    wf.phase("load_template", 10).await?;
    let template = match ctx.coordinator.zfs_template_by_id(template_id).await {
        Ok(Some(template)) => template,
        Ok(None) => return wf.fail(&format!("Template {template_id} not found")).await,
        Err(e) => return wf.fail(&format!("Could not load template: {e:#}")).await,
    };
    let Some(vcenter_id) = template.vcenter_id else {
        return wf.fail("Template is not linked to a manager").await;
    };
    let Some(source_moref) = template.template_moref.clone() else {
        return wf.fail("Template has no template VM configured").await;
    };

    let copy_name = job
        .detail_str("copy_name")
        .map(String::from)
        .unwrap_or_else(|| {
            format!(
                "{}-{}",
                template.name.clone().unwrap_or_else(|| "template".into()),
                target_datastore
            )
        });

    wf.phase("clone", 30).await?;
    if wf.cancelled().await? {
        return wf.cancel().await;
    }
    let vc = match common::vcenter_endpoint(&ctx, job.id, vcenter_id).await {
        Ok(vc) => vc,
        Err(e) => return wf.fail(&e.to_string()).await,
    };
    let spec = CloneSpec {
        source: source_moref,
        name: copy_name.clone(),
        datastore: Some(target_datastore.clone()),
        ..Default::default()
    };
    let new_moref = match ctx.vsphere.clone_template(&vc, &spec).await {
        Ok(moref) => moref,
        Err(e) => return wf.fail(&format!("Clone failed: {e:#}")).await,
    };

    wf.phase("record", 85).await?;
    wf.env.set("copy_name", json!(copy_name));
    wf.env.set("copy_moref", json!(new_moref));
    wf.env.set("target_datastore", json!(target_datastore));
    wf.info(&format!("Template copy {copy_name} created")).await;
    wf.complete().await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coordinator::JobStatus;
    use crate::testing::{encrypt_for_tests, seed_running_job, test_context};
    use uuid::Uuid;

    #[tokio::test]
    async fn test_validate_passes_on_complete_template() {
        let (ctx, harness) = test_context("w1");
        let vcenter_id = Uuid::new_v4();
        let key_id = Uuid::new_v4();
        let template_id = Uuid::new_v4();
        harness.coordinator.seed(
            "vcenters",
            json!({"id": vcenter_id, "host": "vc.test", "username": "adm", "password_encrypted": encrypt_for_tests("pw")}),
        );
        harness.coordinator.seed(
            "ssh_keys",
            json!({"id": key_id, "private_key_encrypted": encrypt_for_tests("-----BEGIN KEY-----")}),
        );
        harness.coordinator.seed(
            "zfs_target_templates",
            json!({
                "id": template_id,
                "name": "zfs-appliance",
                "vcenter_id": vcenter_id,
                "template_moref": "vm-template-1",
                "ssh_key_id": key_id,
            }),
        );

        let job = seed_running_job(
            &ctx,
            "validate_zfs_template",
            json!({"type": "specific", "template_id": template_id}),
            json!({}),
        )
        .await;
        validate_zfs_template(job.clone(), ctx.clone()).await.unwrap();

        let done = ctx.coordinator.get_job(job.id).await.unwrap().unwrap();
        assert_eq!(done.status, JobStatus::Completed);
        assert_eq!(done.details.unwrap()["checks_failed"], 0);
    }

    #[tokio::test]
    async fn test_validate_fails_with_specific_steps() {
        let (ctx, harness) = test_context("w1");
        let template_id = Uuid::new_v4();
        harness.coordinator.seed(
            "zfs_target_templates",
            json!({"id": template_id, "name": "bare"}),
        );

        let job = seed_running_job(
            &ctx,
            "validate_zfs_template",
            json!({"type": "specific", "template_id": template_id}),
            json!({}),
        )
        .await;
        validate_zfs_template(job.clone(), ctx.clone()).await.unwrap();

        let done = ctx.coordinator.get_job(job.id).await.unwrap().unwrap();
        assert_eq!(done.status, JobStatus::Failed);
        let details = done.details.unwrap();
        assert_eq!(details["checks_failed"], 3);
    }
}
