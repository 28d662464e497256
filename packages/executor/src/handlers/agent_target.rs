//! Registration of agent-managed storage appliances.
//!
//! Some appliances run a management agent exposing an HTTPS API instead
//! of (or alongside) SSH. Registration verifies the agent is healthy
//! before trusting anything it reports, discovers its pools (falling back
//! to the health payload for older agents), and then creates **or
//! updates** the replication-target inventory row backed by the agent:
//! re-running the job for the same agent is a normal retry path and must
//! never leave duplicate rows. Datastore registration and protection-group
//! assignment are optional follow-ups driven by the job details.

use std::sync::Arc;

use anyhow::{bail, Context, Result};
use chrono::Utc;
use serde_json::{json, Value};
use uuid::Uuid;

use super::common;
use crate::context::{ExecutorContext, Workflow};
use crate::coordinator::{Job, NewJob, ZfsAgentRecord};
use crate::session::RemoteRequest;

/// Agent health states that allow registration to proceed.
fn health_allows_registration(status: &str) -> bool {
    matches!(status, "healthy" | "warning" | "online")
}

/// One discovered pool on the agent.
#[derive(Debug, Clone, PartialEq)]
struct PoolInfo {
    name: String,
    size_bytes: u64,
    free_bytes: u64,
    health: String,
}

impl PoolInfo {
    fn from_value(value: &Value) -> Option<Self> {
        Some(Self {
            name: value.get("name")?.as_str()?.to_string(),
            size_bytes: value.get("size_bytes").and_then(|v| v.as_u64()).unwrap_or(0),
            free_bytes: value.get("free_bytes").and_then(|v| v.as_u64()).unwrap_or(0),
            health: value
                .get("health")
                .and_then(|v| v.as_str())
                .unwrap_or("unknown")
                .to_string(),
        })
    }
}

/// Pools from the pools endpoint, or the health payload's pool summary
/// when the endpoint is missing (older agent versions).
fn discover_pools(pools_response: Option<&Value>, health: &Value) -> Vec<PoolInfo> {
    if let Some(pools) = pools_response
        .and_then(|v| v.get("pools"))
        .and_then(|v| v.as_array())
    {
        let parsed: Vec<PoolInfo> = pools.iter().filter_map(PoolInfo::from_value).collect();
        if !parsed.is_empty() {
            return parsed;
        }
    }
    let pool_status = health.get("pool_status").cloned().unwrap_or(Value::Null);
    let mut fallback = pool_status.clone();
    if fallback.get("name").and_then(|v| v.as_str()).is_none() {
        fallback = json!({ "name": "tank" });
        if let (Some(map), Some(status)) = (fallback.as_object_mut(), pool_status.as_object()) {
            for (key, value) in status {
                map.entry(key.clone()).or_insert(value.clone());
            }
        }
    }
    PoolInfo::from_value(&fallback).into_iter().collect()
}

/// `register_agent_target`: verify, discover, then upsert the replication
/// target backed by an appliance agent.
pub async fn register_agent_target(job: Job, ctx: Arc<ExecutorContext>) -> Result<()> {
    let mut wf = Workflow::begin(&ctx, &job).await?;

    let agent_id = match common::detail_uuid(&job, "agent_id") {
        Ok(id) => id,
        Err(e) => return wf.fail(&e.to_string()).await,
    };
    let target_name = match common::require_detail(&job, "target_name") {
        Ok(name) => name.to_string(),
        Err(e) => return wf.fail(&e.to_string()).await,
    };
    let datastore_name = job.detail_str("datastore_name").map(String::from);
    let vcenter_id = job.detail_str("vcenter_id").and_then(|v| Uuid::parse_str(v).ok());
    let protection_group_id = job
        .detail_str("protection_group_id")
        .and_then(|v| Uuid::parse_str(v).ok());

    wf.phase("fetch_agent", 10).await?;
    let agent = match ctx.coordinator.zfs_agent_by_id(agent_id).await {
        Ok(Some(agent)) => agent,
        Ok(None) => return wf.fail(&format!("Agent {agent_id} not found")).await,
        Err(e) => return wf.fail(&format!("Could not load agent: {e:#}")).await,
    };
    wf.info(&format!("Registering agent {} as {target_name:?}", agent.hostname))
        .await;

    // Nothing the agent reports is trusted until it answers its health
    // endpoint with an acceptable status.
    wf.phase("health_check", 20).await?;
    let health = match agent_get(&ctx, &agent, "/v1/health").await {
        Ok(health) => health,
        Err(e) => {
            return wf
                .fail(&format!("Agent {} health check failed: {e:#}", agent.hostname))
                .await
        }
    };
    let agent_status = health
        .get("status")
        .and_then(|v| v.as_str())
        .unwrap_or("unknown")
        .to_string();
    if !health_allows_registration(&agent_status) {
        return wf
            .fail(&format!("Agent not healthy: status={agent_status}"))
            .await;
    }
    let agent_version = health
        .get("version")
        .and_then(|v| v.as_str())
        .unwrap_or("unknown")
        .to_string();
    wf.env.set("agent_version", json!(agent_version));
    wf.env.step("health_check", "completed", format!("status {agent_status}"));
    wf.info(&format!("Agent healthy: version={agent_version}")).await;

    wf.phase("pool_discovery", 35).await?;
    let pools_response = match agent_get(&ctx, &agent, "/v1/pools").await {
        Ok(response) => Some(response),
        Err(e) => {
            wf.warn(&format!("Pool endpoint unavailable, using health data: {e:#}"))
                .await;
            None
        }
    };
    let pools = discover_pools(pools_response.as_ref(), &health);
    let Some(primary) = pools.first().cloned() else {
        return wf.fail("No ZFS pools discovered on agent").await;
    };
    wf.env.set("pool_name", json!(primary.name));
    wf.env.set("pool_size_bytes", json!(primary.size_bytes));
    wf.env.set("pool_free_bytes", json!(primary.free_bytes));
    wf.env.step(
        "pool_discovery",
        "completed",
        format!("{} ({}, {} bytes free)", primary.name, primary.health, primary.free_bytes),
    );

    // Older agents don't serve capabilities; that only costs a warning.
    wf.phase("capabilities_check", 45).await?;
    match agent_get(&ctx, &agent, "/v1/capabilities").await {
        Ok(capabilities) => {
            wf.env.set("capabilities", capabilities);
            wf.env.step("capabilities_check", "completed", "capabilities recorded");
        }
        Err(_) => {
            wf.warn("Capabilities endpoint not available (older agent version)")
                .await;
        }
    }

    if wf.cancelled().await? {
        return wf.cancel().await;
    }

    // Upsert keyed on the agent: a retry updates the existing row.
    wf.phase("register_target", 60).await?;
    let nfs_export_path = format!("/{}", primary.name);
    let target_data = json!({
        "name": target_name,
        "hostname": agent.hostname,
        "zfs_pool": primary.name,
        "nfs_export_path": nfs_export_path,
        "agent_id": agent.id,
        "status": "online",
        "health_status": if primary.health == "ONLINE" { "online" } else { "degraded" },
        "pool_size_bytes": primary.size_bytes,
        "pool_free_bytes": primary.free_bytes,
        "last_seen_at": Utc::now(),
    });
    let target_id = match ctx.coordinator.replication_target_by_agent(agent.id).await {
        Ok(Some(existing)) => {
            if let Err(e) = ctx
                .coordinator
                .patch_replication_target(existing.id, target_data)
                .await
            {
                return wf.fail(&format!("Could not update target row: {e:#}")).await;
            }
            wf.env.step("register_target", "completed", format!("updated target {}", existing.id));
            existing.id
        }
        Ok(None) => match ctx.coordinator.insert_replication_target(target_data).await {
            Ok(target) => {
                wf.env.step("register_target", "completed", format!("created target {}", target.id));
                target.id
            }
            Err(e) => return wf.fail(&format!("Could not create target row: {e:#}")).await,
        },
        Err(e) => return wf.fail(&format!("Could not look up existing target: {e:#}")).await,
    };
    wf.env.set("replication_target_id", json!(target_id));

    wf.phase("link_agent", 75).await?;
    match ctx
        .coordinator
        .patch_zfs_agent(
            agent.id,
            json!({ "replication_target_id": target_id, "status": "linked" }),
        )
        .await
    {
        Ok(()) => wf.env.step("link_agent", "completed", "agent linked to target"),
        Err(e) => wf.env.warn(format!("could not link agent to target: {e:#}")),
    }

    // Optional: hand the NFS mount to the datastore handler.
    if let (Some(vcenter_id), Some(datastore_name)) = (vcenter_id, &datastore_name) {
        wf.phase("register_datastore", 85).await?;
        let mount_job = NewJob::pending("manage_datastore")
            .details(json!({
                "action": "mount",
                "vcenter_id": vcenter_id,
                "datastore_name": datastore_name,
                "remote_host": agent.hostname,
                "remote_path": nfs_export_path,
                "target_id": target_id,
                "triggered_by": "register_agent_target",
            }))
            .created_by(job.created_by);
        match ctx.coordinator.insert_job(mount_job).await {
            Ok(created) => {
                wf.env.set("datastore_job_id", json!(created.id));
                wf.env.step(
                    "register_datastore",
                    "completed",
                    format!("queued datastore mount job {}", created.id),
                );
            }
            Err(e) => wf.env.warn(format!("could not queue datastore registration: {e:#}")),
        }
    }

    // Optional: point a protection group at the new target.
    if let Some(group_id) = protection_group_id {
        wf.phase("assign_protection_group", 92).await?;
        match ctx
            .coordinator
            .patch_protection_group(group_id, json!({ "target_id": target_id }))
            .await
        {
            Ok(()) => {
                wf.env.set("protection_group_assigned", json!(true));
                wf.env.step("assign_protection_group", "completed", group_id.to_string());
            }
            Err(e) => wf.env.warn(format!("protection group assignment failed: {e:#}")),
        }
    }

    wf.info("Agent target registration completed successfully").await;
    wf.complete().await
}

/// One GET against the agent API, parsed as JSON.
async fn agent_get(ctx: &Arc<ExecutorContext>, agent: &ZfsAgentRecord, path: &str) -> Result<Value> {
    let scheme = if agent.api_ssl.unwrap_or(true) { "https" } else { "http" };
    let port = agent.api_port.unwrap_or(8000);
    let url = format!("{scheme}://{}:{port}{path}", agent.hostname);
    let mut request = RemoteRequest::get(&agent.hostname, url);
    if let Some(encrypted) = &agent.api_token_encrypted {
        let token = ctx
            .credentials
            .decrypt(encrypted)
            .context("could not decrypt agent API token")?;
        request = request.bearer(token);
    }

    let response = ctx.sessions.request(request).await?;
    if !(200..300).contains(&response.status) {
        bail!("agent returned {} for {path}", response.status);
    }
    response.json()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coordinator::{JobStatus, ReplicationTargetRecord};
    use crate::testing::{seed_running_job, test_context, TestHarness};
    use std::net::SocketAddr;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    /// Minimal agent API: health, pools, and a 404 for everything else.
    async fn fake_agent(health_status: &'static str) -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            loop {
                let Ok((mut stream, _)) = listener.accept().await else {
                    break;
                };
                tokio::spawn(async move {
                    let mut buf = [0u8; 4096];
                    let mut seen = Vec::new();
                    loop {
                        match stream.read(&mut buf).await {
                            Ok(0) => return,
                            Ok(n) => {
                                seen.extend_from_slice(&buf[..n]);
                                if seen.windows(4).any(|w| w == b"\r\n\r\n") {
                                    break;
                                }
                            }
                            Err(_) => return,
                        }
                    }
                    let head = String::from_utf8_lossy(&seen);
                    let path = head
                        .split_whitespace()
                        .nth(1)
                        .unwrap_or("/")
                        .to_string();
                    let (status_line, body) = match path.as_str() {
                        "/v1/health" => (
                            "200 OK",
                            format!(
                                r#"{{"status":"{health_status}","version":"1.4.2","pool_status":{{"name":"tank","health":"ONLINE","size_bytes":1000,"free_bytes":800}}}}"#
                            ),
                        ),
                        "/v1/pools" => (
                            "200 OK",
                            r#"{"pools":[{"name":"tank","size_bytes":1000,"free_bytes":800,"health":"ONLINE"}]}"#.to_string(),
                        ),
                        _ => ("404 Not Found", r#"{"detail":"Not Found"}"#.to_string()),
                    };
                    let response = format!(
                        "HTTP/1.1 {status_line}\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
                        body.len()
                    );
                    let _ = stream.write_all(response.as_bytes()).await;
                    let _ = stream.shutdown().await;
                });
            }
        });
        addr
    }

    fn seed_agent(harness: &TestHarness, addr: SocketAddr) -> Uuid {
        let id = Uuid::new_v4();
        harness.coordinator.seed(
            "zfs_agents",
            json!({
                "id": id,
                "hostname": addr.ip().to_string(),
                "api_port": addr.port(),
                "api_ssl": false,
            }),
        );
        id
    }

    #[tokio::test]
    async fn test_registration_creates_target_and_optional_links() {
        let (ctx, harness) = test_context("w1");
        let addr = fake_agent("healthy").await;
        let agent_id = seed_agent(&harness, addr);
        let vcenter_id = Uuid::new_v4();
        let group_id = Uuid::new_v4();
        harness.coordinator.seed(
            "protection_groups",
            json!({"id": group_id, "name": "crm", "is_enabled": true}),
        );

        let job = seed_running_job(
            &ctx,
            "register_agent_target",
            json!({}),
            json!({
                "agent_id": agent_id,
                "target_name": "site-c",
                "vcenter_id": vcenter_id,
                "datastore_name": "site-c-nfs",
                "protection_group_id": group_id,
            }),
        )
        .await;
        register_agent_target(job.clone(), ctx.clone()).await.unwrap();

        let done = ctx.coordinator.get_job(job.id).await.unwrap().unwrap();
        assert_eq!(done.status, JobStatus::Completed, "{:?}", done.error);

        let targets: Vec<ReplicationTargetRecord> =
            harness.coordinator.rows_as("replication_targets");
        assert_eq!(targets.len(), 1);
        assert_eq!(targets[0].agent_id, Some(agent_id));
        assert_eq!(targets[0].zfs_pool.as_deref(), Some("tank"));
        assert_eq!(targets[0].nfs_export_path.as_deref(), Some("/tank"));

        // The agent row links back to the target.
        let agent = harness.coordinator.row_by_id("zfs_agents", agent_id).unwrap();
        assert_eq!(agent["replication_target_id"], json!(targets[0].id));
        assert_eq!(agent["status"], "linked");

        // Datastore registration was delegated to the mount handler.
        let mount_jobs: Vec<Value> = harness
            .coordinator
            .rows("jobs")
            .into_iter()
            .filter(|row| row["job_type"] == "manage_datastore")
            .collect();
        assert_eq!(mount_jobs.len(), 1);
        assert_eq!(mount_jobs[0]["status"], "pending");
        assert_eq!(mount_jobs[0]["details"]["datastore_name"], "site-c-nfs");
        assert_eq!(mount_jobs[0]["details"]["remote_path"], "/tank");

        // The protection group now points at the target.
        let group = harness.coordinator.row_by_id("protection_groups", group_id).unwrap();
        assert_eq!(group["target_id"], json!(targets[0].id));
    }

    #[tokio::test]
    async fn test_reregistration_updates_existing_row() {
        let (ctx, harness) = test_context("w1");
        let addr = fake_agent("healthy").await;
        let agent_id = seed_agent(&harness, addr);

        // A previous registration already created the target.
        let existing_id = Uuid::new_v4();
        harness.coordinator.seed(
            "replication_targets",
            json!({
                "id": existing_id,
                "name": "site-c",
                "hostname": "stale-hostname",
                "agent_id": agent_id,
                "status": "offline",
            }),
        );

        let job = seed_running_job(
            &ctx,
            "register_agent_target",
            json!({}),
            json!({"agent_id": agent_id, "target_name": "site-c"}),
        )
        .await;
        register_agent_target(job.clone(), ctx.clone()).await.unwrap();

        let done = ctx.coordinator.get_job(job.id).await.unwrap().unwrap();
        assert_eq!(done.status, JobStatus::Completed, "{:?}", done.error);

        // Still exactly one row, refreshed in place.
        let targets = harness.coordinator.rows("replication_targets");
        assert_eq!(targets.len(), 1, "re-registration must not duplicate the target");
        assert_eq!(targets[0]["id"], json!(existing_id));
        assert_eq!(targets[0]["status"], "online");
        assert_eq!(targets[0]["hostname"], addr.ip().to_string());
        assert_eq!(targets[0]["zfs_pool"], "tank");
    }

    #[tokio::test]
    async fn test_unhealthy_agent_blocks_registration() {
        let (ctx, harness) = test_context("w1");
        let addr = fake_agent("error").await;
        let agent_id = seed_agent(&harness, addr);

        let job = seed_running_job(
            &ctx,
            "register_agent_target",
            json!({}),
            json!({"agent_id": agent_id, "target_name": "site-c"}),
        )
        .await;
        register_agent_target(job.clone(), ctx.clone()).await.unwrap();

        let done = ctx.coordinator.get_job(job.id).await.unwrap().unwrap();
        assert_eq!(done.status, JobStatus::Failed);
        assert!(done.error.unwrap().contains("Agent not healthy"));
        assert!(harness.coordinator.rows("replication_targets").is_empty());
    }

    #[tokio::test]
    async fn test_missing_agent_is_a_validation_failure() {
        let (ctx, _) = test_context("w1");
        let job = seed_running_job(
            &ctx,
            "register_agent_target",
            json!({}),
            json!({"agent_id": Uuid::new_v4(), "target_name": "site-c"}),
        )
        .await;

        register_agent_target(job.clone(), ctx.clone()).await.unwrap();
        let done = ctx.coordinator.get_job(job.id).await.unwrap().unwrap();
        assert_eq!(done.status, JobStatus::Failed);
        assert!(done.error.unwrap().contains("not found"));
    }

    #[tokio::test]
    async fn test_missing_required_details() {
        let (ctx, _) = test_context("w1");

        let no_agent = seed_running_job(
            &ctx,
            "register_agent_target",
            json!({}),
            json!({"target_name": "site-c"}),
        )
        .await;
        register_agent_target(no_agent.clone(), ctx.clone()).await.unwrap();
        let done = ctx.coordinator.get_job(no_agent.id).await.unwrap().unwrap();
        assert_eq!(done.status, JobStatus::Failed);
        assert!(done.error.unwrap().contains("details.agent_id"));

        let no_name = seed_running_job(
            &ctx,
            "register_agent_target",
            json!({}),
            json!({"agent_id": Uuid::new_v4()}),
        )
        .await;
        register_agent_target(no_name.clone(), ctx.clone()).await.unwrap();
        let done = ctx.coordinator.get_job(no_name.id).await.unwrap().unwrap();
        assert_eq!(done.status, JobStatus::Failed);
        assert!(done.error.unwrap().contains("details.target_name"));
    }

    #[test]
    fn test_health_gate_states() {
        assert!(health_allows_registration("healthy"));
        assert!(health_allows_registration("warning"));
        assert!(health_allows_registration("online"));
        assert!(!health_allows_registration("error"));
        assert!(!health_allows_registration("unknown"));
    }

    #[test]
    fn test_discover_pools_prefers_pools_endpoint() {
        let health = json!({"pool_status": {"name": "fallback", "health": "ONLINE"}});
        let pools = json!({"pools": [{"name": "tank", "size_bytes": 10, "free_bytes": 5, "health": "ONLINE"}]});
        let discovered = discover_pools(Some(&pools), &health);
        assert_eq!(discovered.len(), 1);
        assert_eq!(discovered[0].name, "tank");
        assert_eq!(discovered[0].size_bytes, 10);
    }

    #[test]
    fn test_discover_pools_falls_back_to_health_payload() {
        let health = json!({"pool_status": {"name": "fallback", "health": "DEGRADED", "size_bytes": 7}});
        let discovered = discover_pools(None, &health);
        assert_eq!(discovered.len(), 1);
        assert_eq!(discovered[0].name, "fallback");
        assert_eq!(discovered[0].health, "DEGRADED");
        assert_eq!(discovered[0].size_bytes, 7);

        // No pool name anywhere: the agent default pool is assumed.
        let bare = discover_pools(None, &json!({}));
        assert_eq!(bare.len(), 1);
        assert_eq!(bare[0].name, "tank");
    }
}
