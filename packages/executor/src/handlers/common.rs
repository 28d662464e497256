//! Shared helpers for handler input validation and credential resolution.
//!
//! Validation failures carry the exact diagnostic the operator sees on the
//! failed job, so every message names the missing field.

use std::sync::Arc;

use anyhow::{anyhow, bail, Context, Result};
use uuid::Uuid;

use crate::adapters::{Device, SshAuth, SshTarget, VcenterEndpoint};
use crate::context::ExecutorContext;
use crate::coordinator::{Job, ReplicationTargetRecord, ServerRecord};

/// The set of server ids from a `{"type": "specific", "server_ids": [...]}`
/// target scope.
pub fn specific_server_ids(job: &Job) -> Result<Vec<Uuid>> {
    scope_id_list(job, "server_ids")
}

/// A list of ids out of `target_scope`, requiring the `specific` selector.
pub fn scope_id_list(job: &Job, key: &str) -> Result<Vec<Uuid>> {
    let scope = job
        .target_scope
        .as_ref()
        .ok_or_else(|| anyhow!("job has no target_scope"))?;
    if scope.get("type").and_then(|v| v.as_str()) != Some("specific") {
        bail!("this job requires a specific target selection");
    }
    let ids = scope
        .get(key)
        .and_then(|v| v.as_array())
        .ok_or_else(|| anyhow!("target_scope.{key} is missing"))?;
    let mut parsed = Vec::with_capacity(ids.len());
    for id in ids {
        let id = id
            .as_str()
            .ok_or_else(|| anyhow!("target_scope.{key} must contain id strings"))?;
        parsed.push(Uuid::parse_str(id).with_context(|| format!("invalid id in target_scope.{key}"))?);
    }
    if parsed.is_empty() {
        bail!("target_scope.{key} is empty");
    }
    Ok(parsed)
}

/// A single id out of `target_scope`.
pub fn scope_uuid(job: &Job, key: &str) -> Result<Uuid> {
    let raw = job
        .scope_str(key)
        .ok_or_else(|| anyhow!("target_scope.{key} is missing"))?;
    Uuid::parse_str(raw).with_context(|| format!("target_scope.{key} is not a valid id"))
}

/// A required string out of `details`.
pub fn require_detail<'a>(job: &'a Job, key: &str) -> Result<&'a str> {
    job.detail_str(key)
        .ok_or_else(|| anyhow!("details.{key} is missing"))
}

/// A required id out of `details`.
pub fn detail_uuid(job: &Job, key: &str) -> Result<Uuid> {
    let raw = require_detail(job, key)?;
    Uuid::parse_str(raw).with_context(|| format!("details.{key} is not a valid id"))
}

/// Resolve the out-of-band controller endpoint for a server, decrypting
/// its stored credentials.
pub async fn oob_device(
    ctx: &Arc<ExecutorContext>,
    job_id: Uuid,
    server: &ServerRecord,
) -> Result<Device> {
    let credentials = ctx
        .coordinator
        .server_credentials(server.id)
        .await?
        .ok_or_else(|| anyhow!("no credentials stored for server {}", server.ip_address))?;
    let password = ctx
        .credentials
        .decrypt(&credentials.password_encrypted)
        .with_context(|| format!("could not decrypt credentials for {}", server.ip_address))?;
    Ok(Device {
        address: server.ip_address.clone(),
        username: credentials.username,
        password,
        server_id: Some(server.id),
        job_id: Some(job_id),
        legacy_tls: server.requires_legacy_tls.unwrap_or(false),
    })
}

/// Resolve a hypervisor manager endpoint, decrypting its password.
pub async fn vcenter_endpoint(
    ctx: &Arc<ExecutorContext>,
    job_id: Uuid,
    vcenter_id: Uuid,
) -> Result<VcenterEndpoint> {
    let record = ctx
        .coordinator
        .vcenter_by_id(vcenter_id)
        .await?
        .ok_or_else(|| anyhow!("vCenter {vcenter_id} not found"))?;
    let password = ctx
        .credentials
        .decrypt(&record.password_encrypted)
        .context("could not decrypt vCenter credentials")?;
    Ok(VcenterEndpoint {
        id: Some(record.id),
        host: record.host,
        username: record.username,
        password,
        job_id: Some(job_id),
    })
}

/// Resolve SSH access to a replication target. Key auth wins over password
/// when both are configured.
pub async fn target_ssh(
    ctx: &Arc<ExecutorContext>,
    target: &ReplicationTargetRecord,
) -> Result<SshTarget> {
    let username = target
        .ssh_username
        .clone()
        .ok_or_else(|| anyhow!("replication target {} has no SSH username", target.name))?;

    let auth = if let Some(key_id) = target.ssh_key_id {
        let key = ctx
            .coordinator
            .ssh_key_by_id(key_id)
            .await?
            .ok_or_else(|| anyhow!("SSH key {key_id} not found"))?;
        let encrypted = key
            .private_key_encrypted
            .ok_or_else(|| anyhow!("SSH key {key_id} has no private key material"))?;
        SshAuth::Key(
            ctx.credentials
                .decrypt(&encrypted)
                .context("could not decrypt SSH private key")?,
        )
    } else if let Some(encrypted) = &target.ssh_password_encrypted {
        SshAuth::Password(
            ctx.credentials
                .decrypt(encrypted)
                .context("could not decrypt SSH password")?,
        )
    } else {
        bail!(
            "replication target {} has neither an SSH key nor a password",
            target.name
        );
    };

    Ok(SshTarget::new(target.hostname.clone(), username, auth)
        .port(target.ssh_port.unwrap_or(22)))
}

/// Progress helper: scale index/total onto a phase's percentage band.
pub fn band_progress(start: u8, end: u8, index: usize, total: usize) -> u8 {
    if total == 0 {
        return end;
    }
    let span = end.saturating_sub(start) as usize;
    start + ((index * span) / total) as u8
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn job_with_scope(scope: serde_json::Value) -> Job {
        serde_json::from_value(json!({
            "id": Uuid::new_v4(),
            "job_type": "power_action",
            "target_scope": scope,
        }))
        .unwrap()
    }

    #[test]
    fn test_specific_server_ids() {
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        let job = job_with_scope(json!({"type": "specific", "server_ids": [a, b]}));
        assert_eq!(specific_server_ids(&job).unwrap(), vec![a, b]);
    }

    #[test]
    fn test_specific_server_ids_diagnostics() {
        let job = job_with_scope(json!({"type": "all"}));
        let err = specific_server_ids(&job).unwrap_err().to_string();
        assert!(err.contains("specific target selection"), "{err}");

        let job = job_with_scope(json!({"type": "specific"}));
        let err = specific_server_ids(&job).unwrap_err().to_string();
        assert!(err.contains("target_scope.server_ids is missing"), "{err}");

        let job = job_with_scope(json!({"type": "specific", "server_ids": []}));
        let err = specific_server_ids(&job).unwrap_err().to_string();
        assert!(err.contains("empty"), "{err}");
    }

    #[test]
    fn test_band_progress() {
        assert_eq!(band_progress(10, 90, 0, 4), 10);
        assert_eq!(band_progress(10, 90, 2, 4), 50);
        assert_eq!(band_progress(10, 90, 4, 4), 90);
        assert_eq!(band_progress(10, 90, 0, 0), 90);
    }
}
