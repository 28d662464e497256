//! Typed client for the coordination database.
//!
//! The coordinator exposes uniform CRUD over its resources; this module
//! wraps that surface in typed operations behind a trait seam so handlers
//! and the dispatcher never build queries by hand. The REST implementation
//! lives in [`rest`]; tests run against the in-memory implementation in
//! [`crate::testing`].

pub mod filter;
pub mod models;
pub mod rest;

use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde_json::{json, Value};
use uuid::Uuid;

pub use filter::Filter;
pub use models::*;
pub use rest::RestCoordinator;

/// Options for a row query.
#[derive(Debug, Clone, Copy, Default)]
pub struct SelectOptions {
    /// Column projection (`select=` in the query grammar).
    pub select: Option<&'static str>,
    /// Ordering, e.g. `created_at.asc`.
    pub order: Option<&'static str>,
    /// Row limit.
    pub limit: Option<u32>,
}

/// Raw row operations against the coordinator.
///
/// Four verbs cover the whole surface; everything typed is layered on top
/// in [`Coordinator`]. `patch` and `insert` return the affected rows
/// (`Prefer: return=representation`), which is also how the claim
/// compare-and-set observes whether it won.
#[async_trait]
pub trait CoordinatorApi: Send + Sync {
    async fn select(
        &self,
        resource: &str,
        filters: &[Filter],
        opts: SelectOptions,
    ) -> Result<Vec<Value>>;

    async fn insert(&self, resource: &str, row: Value) -> Result<Value>;

    async fn patch(&self, resource: &str, filters: &[Filter], patch: Value) -> Result<Vec<Value>>;

    async fn delete(&self, resource: &str, filters: &[Filter]) -> Result<u64>;
}

fn rows<T: DeserializeOwned>(values: Vec<Value>) -> Result<Vec<T>> {
    values
        .into_iter()
        .map(|v| serde_json::from_value(v).context("row did not match expected shape"))
        .collect()
}

fn first_row<T: DeserializeOwned>(values: Vec<Value>) -> Result<Option<T>> {
    match values.into_iter().next() {
        Some(v) => Ok(Some(
            serde_json::from_value(v).context("row did not match expected shape")?,
        )),
        None => Ok(None),
    }
}

/// Typed operations over a [`CoordinatorApi`].
#[derive(Clone)]
pub struct Coordinator {
    api: Arc<dyn CoordinatorApi>,
}

impl Coordinator {
    pub fn new(api: Arc<dyn CoordinatorApi>) -> Self {
        Self { api }
    }

    /// Escape hatch for callers that need raw row access.
    pub fn api(&self) -> &Arc<dyn CoordinatorApi> {
        &self.api
    }

    // ------------------------------------------------------------------
    // Jobs
    // ------------------------------------------------------------------

    /// Pending jobs eligible to run now, oldest first.
    ///
    /// The schedule gate (`scheduled_at IS NULL OR scheduled_at <= now`) is
    /// applied after the fetch so the query stays within the coordinator's
    /// filter grammar; the page is oversized to compensate.
    pub async fn fetch_ready_jobs(&self, now: DateTime<Utc>, limit: usize) -> Result<Vec<Job>> {
        let raw = self
            .api
            .select(
                "jobs",
                &[Filter::eq("status", "pending")],
                SelectOptions {
                    order: Some("created_at.asc"),
                    limit: Some((limit * 8).max(50) as u32),
                    ..Default::default()
                },
            )
            .await?;
        let jobs: Vec<Job> = rows(raw)?;
        Ok(jobs
            .into_iter()
            .filter(|j| j.scheduled_at.map(|at| at <= now).unwrap_or(true))
            .take(limit)
            .collect())
    }

    pub async fn get_job(&self, id: Uuid) -> Result<Option<Job>> {
        let raw = self
            .api
            .select("jobs", &[Filter::eq("id", id)], SelectOptions::default())
            .await?;
        first_row(raw)
    }

    /// Compare-and-set claim: `pending → running` keyed on `status = pending`.
    /// Returns false when another worker won the race (zero rows changed).
    pub async fn try_claim(&self, job_id: Uuid, worker_id: &str, now: DateTime<Utc>) -> Result<bool> {
        let changed = self
            .api
            .patch(
                "jobs",
                &[Filter::eq("id", job_id), Filter::eq("status", "pending")],
                json!({
                    "status": "running",
                    "started_at": now,
                    "worker_id": worker_id,
                }),
            )
            .await?;
        Ok(!changed.is_empty())
    }

    pub async fn update_job(&self, job_id: Uuid, patch: Value) -> Result<()> {
        self.api
            .patch("jobs", &[Filter::eq("id", job_id)], patch)
            .await?;
        Ok(())
    }

    pub async fn insert_job(&self, new: NewJob) -> Result<Job> {
        let row = self.api.insert("jobs", serde_json::to_value(new)?).await?;
        serde_json::from_value(row).context("inserted job did not match expected shape")
    }

    /// Jobs of one type in any of the given states.
    pub async fn jobs_of_type(&self, job_type: &str, statuses: &[&str]) -> Result<Vec<Job>> {
        let raw = self
            .api
            .select(
                "jobs",
                &[
                    Filter::eq("job_type", job_type),
                    Filter::any("status", statuses.iter().copied()),
                ],
                SelectOptions::default(),
            )
            .await?;
        rows(raw)
    }

    /// Running jobs claimed by a specific worker (orphan recovery).
    pub async fn running_jobs_for_worker(&self, worker_id: &str) -> Result<Vec<Job>> {
        let raw = self
            .api
            .select(
                "jobs",
                &[
                    Filter::eq("status", "running"),
                    Filter::eq("worker_id", worker_id),
                ],
                SelectOptions::default(),
            )
            .await?;
        rows(raw)
    }

    // ------------------------------------------------------------------
    // Tasks
    // ------------------------------------------------------------------

    pub async fn insert_task(
        &self,
        job_id: Uuid,
        server_id: Option<Uuid>,
        vcenter_host_id: Option<Uuid>,
    ) -> Result<Task> {
        let row = self
            .api
            .insert(
                "tasks",
                json!({
                    "job_id": job_id,
                    "server_id": server_id,
                    "vcenter_host_id": vcenter_host_id,
                    "status": "pending",
                }),
            )
            .await?;
        serde_json::from_value(row).context("inserted task did not match expected shape")
    }

    pub async fn update_task(&self, task_id: Uuid, patch: Value) -> Result<()> {
        self.api
            .patch("tasks", &[Filter::eq("id", task_id)], patch)
            .await?;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Server inventory
    // ------------------------------------------------------------------

    pub async fn servers_by_ids(&self, ids: &[Uuid]) -> Result<Vec<ServerRecord>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let raw = self
            .api
            .select(
                "servers",
                &[Filter::any("id", ids.iter())],
                SelectOptions::default(),
            )
            .await?;
        rows(raw)
    }

    pub async fn server_by_id(&self, id: Uuid) -> Result<Option<ServerRecord>> {
        let raw = self
            .api
            .select("servers", &[Filter::eq("id", id)], SelectOptions::default())
            .await?;
        first_row(raw)
    }

    pub async fn patch_server(&self, id: Uuid, patch: Value) -> Result<()> {
        self.api
            .patch("servers", &[Filter::eq("id", id)], patch)
            .await?;
        Ok(())
    }

    pub async fn server_credentials(
        &self,
        server_id: Uuid,
    ) -> Result<Option<ServerCredentialRecord>> {
        let raw = self
            .api
            .select(
                "server_credentials",
                &[Filter::eq("server_id", server_id)],
                SelectOptions::default(),
            )
            .await?;
        first_row(raw)
    }

    // ------------------------------------------------------------------
    // Hypervisor inventory
    // ------------------------------------------------------------------

    pub async fn vcenter_by_id(&self, id: Uuid) -> Result<Option<VcenterRecord>> {
        let raw = self
            .api
            .select("vcenters", &[Filter::eq("id", id)], SelectOptions::default())
            .await?;
        first_row(raw)
    }

    pub async fn esxi_host_by_id(&self, id: Uuid) -> Result<Option<EsxiHostRecord>> {
        let raw = self
            .api
            .select(
                "esxi_hosts",
                &[Filter::eq("id", id)],
                SelectOptions::default(),
            )
            .await?;
        first_row(raw)
    }

    pub async fn esxi_hosts_by_vcenter(&self, vcenter_id: Uuid) -> Result<Vec<EsxiHostRecord>> {
        let raw = self
            .api
            .select(
                "esxi_hosts",
                &[Filter::eq("vcenter_id", vcenter_id)],
                SelectOptions::default(),
            )
            .await?;
        rows(raw)
    }

    pub async fn patch_esxi_host(&self, id: Uuid, patch: Value) -> Result<()> {
        self.api
            .patch("esxi_hosts", &[Filter::eq("id", id)], patch)
            .await?;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Templates and keys
    // ------------------------------------------------------------------

    pub async fn zfs_template_by_id(&self, id: Uuid) -> Result<Option<ZfsTemplateRecord>> {
        let raw = self
            .api
            .select(
                "zfs_target_templates",
                &[Filter::eq("id", id)],
                SelectOptions::default(),
            )
            .await?;
        first_row(raw)
    }

    /// Bump the template's deployment counter after a successful deploy.
    pub async fn increment_template_deployments(&self, id: Uuid) -> Result<()> {
        if let Some(template) = self.zfs_template_by_id(id).await? {
            let next = template.deployment_count.unwrap_or(0) + 1;
            self.api
                .patch(
                    "zfs_target_templates",
                    &[Filter::eq("id", id)],
                    json!({ "deployment_count": next }),
                )
                .await?;
        }
        Ok(())
    }

    pub async fn ssh_key_by_id(&self, id: Uuid) -> Result<Option<SshKeyRecord>> {
        let raw = self
            .api
            .select("ssh_keys", &[Filter::eq("id", id)], SelectOptions::default())
            .await?;
        first_row(raw)
    }

    pub async fn insert_ssh_key(&self, row: Value) -> Result<SshKeyRecord> {
        let inserted = self.api.insert("ssh_keys", row).await?;
        serde_json::from_value(inserted).context("inserted ssh key did not match expected shape")
    }

    // ------------------------------------------------------------------
    // Replication inventory
    // ------------------------------------------------------------------

    pub async fn replication_target_by_id(
        &self,
        id: Uuid,
    ) -> Result<Option<ReplicationTargetRecord>> {
        let raw = self
            .api
            .select(
                "replication_targets",
                &[Filter::eq("id", id)],
                SelectOptions::default(),
            )
            .await?;
        first_row(raw)
    }

    pub async fn all_replication_targets(&self) -> Result<Vec<ReplicationTargetRecord>> {
        let raw = self
            .api
            .select("replication_targets", &[], SelectOptions::default())
            .await?;
        rows(raw)
    }

    pub async fn insert_replication_target(&self, row: Value) -> Result<ReplicationTargetRecord> {
        let inserted = self.api.insert("replication_targets", row).await?;
        serde_json::from_value(inserted)
            .context("inserted replication target did not match expected shape")
    }

    pub async fn patch_replication_target(&self, id: Uuid, patch: Value) -> Result<()> {
        self.api
            .patch("replication_targets", &[Filter::eq("id", id)], patch)
            .await?;
        Ok(())
    }

    pub async fn delete_replication_target(&self, id: Uuid) -> Result<()> {
        self.api
            .delete("replication_targets", &[Filter::eq("id", id)])
            .await?;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Protection groups
    // ------------------------------------------------------------------

    /// Groups eligible for scheduled replication: enabled and not paused.
    pub async fn eligible_protection_groups(&self) -> Result<Vec<ProtectionGroupRecord>> {
        let raw = self
            .api
            .select(
                "protection_groups",
                &[Filter::eq("is_enabled", true), Filter::is_null("paused_at")],
                SelectOptions::default(),
            )
            .await?;
        rows(raw)
    }

    pub async fn all_protection_groups(&self) -> Result<Vec<ProtectionGroupRecord>> {
        let raw = self
            .api
            .select("protection_groups", &[], SelectOptions::default())
            .await?;
        rows(raw)
    }

    pub async fn protection_group_by_id(
        &self,
        id: Uuid,
    ) -> Result<Option<ProtectionGroupRecord>> {
        let raw = self
            .api
            .select(
                "protection_groups",
                &[Filter::eq("id", id)],
                SelectOptions::default(),
            )
            .await?;
        first_row(raw)
    }

    pub async fn patch_protection_group(&self, id: Uuid, mut patch: Value) -> Result<()> {
        if let Some(map) = patch.as_object_mut() {
            map.insert("updated_at".into(), json!(Utc::now()));
        }
        self.api
            .patch("protection_groups", &[Filter::eq("id", id)], patch)
            .await?;
        Ok(())
    }

    pub async fn protected_vms(&self, group_id: Uuid) -> Result<Vec<ProtectedVmRecord>> {
        let raw = self
            .api
            .select(
                "protected_vms",
                &[Filter::eq("protection_group_id", group_id)],
                SelectOptions::default(),
            )
            .await?;
        rows(raw)
    }

    pub async fn patch_protected_vm(&self, id: Uuid, patch: Value) -> Result<()> {
        self.api
            .patch("protected_vms", &[Filter::eq("id", id)], patch)
            .await?;
        Ok(())
    }

    pub async fn replication_pair_by_id(
        &self,
        id: Uuid,
    ) -> Result<Option<ReplicationPairRecord>> {
        let raw = self
            .api
            .select(
                "replication_pairs",
                &[Filter::eq("id", id)],
                SelectOptions::default(),
            )
            .await?;
        first_row(raw)
    }

    pub async fn insert_replication_metrics(&self, row: &ReplicationMetricsRow) -> Result<()> {
        self.api
            .insert("replication_metrics", serde_json::to_value(row)?)
            .await?;
        Ok(())
    }

    // ------------------------------------------------------------------
    // SLA violations
    // ------------------------------------------------------------------

    /// Unresolved violations of one type for a group.
    pub async fn open_violations(
        &self,
        group_id: Uuid,
        violation_type: &str,
    ) -> Result<Vec<SlaViolationRecord>> {
        let raw = self
            .api
            .select(
                "sla_violations",
                &[
                    Filter::eq("protection_group_id", group_id),
                    Filter::eq("violation_type", violation_type),
                    Filter::is_null("resolved_at"),
                ],
                SelectOptions::default(),
            )
            .await?;
        rows(raw)
    }

    pub async fn insert_violation(
        &self,
        group_id: Uuid,
        violation_type: &str,
        severity: &str,
        details: Value,
    ) -> Result<()> {
        self.api
            .insert(
                "sla_violations",
                json!({
                    "protection_group_id": group_id,
                    "violation_type": violation_type,
                    "severity": severity,
                    "details": details,
                    "notification_sent": false,
                }),
            )
            .await?;
        Ok(())
    }

    /// Resolve every open violation of one type for a group.
    pub async fn resolve_violations(&self, group_id: Uuid, violation_type: &str) -> Result<()> {
        self.api
            .patch(
                "sla_violations",
                &[
                    Filter::eq("protection_group_id", group_id),
                    Filter::eq("violation_type", violation_type),
                    Filter::is_null("resolved_at"),
                ],
                json!({ "resolved_at": Utc::now() }),
            )
            .await?;
        Ok(())
    }

    pub async fn mark_violations_notified(
        &self,
        group_id: Uuid,
        violation_type: &str,
    ) -> Result<()> {
        self.api
            .patch(
                "sla_violations",
                &[
                    Filter::eq("protection_group_id", group_id),
                    Filter::eq("violation_type", violation_type),
                    Filter::eq("notification_sent", false),
                ],
                json!({ "notification_sent": true }),
            )
            .await?;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Failover events
    // ------------------------------------------------------------------

    pub async fn insert_failover_event(
        &self,
        group_id: Uuid,
        failover_type: &str,
        details: Value,
    ) -> Result<FailoverEventRecord> {
        let row = self
            .api
            .insert(
                "failover_events",
                json!({
                    "protection_group_id": group_id,
                    "failover_type": failover_type,
                    "status": "in_progress",
                    "started_at": Utc::now(),
                    "details": details,
                }),
            )
            .await?;
        serde_json::from_value(row).context("inserted failover event did not match expected shape")
    }

    pub async fn patch_failover_event(&self, id: Uuid, patch: Value) -> Result<()> {
        self.api
            .patch("failover_events", &[Filter::eq("id", id)], patch)
            .await?;
        Ok(())
    }

    pub async fn latest_failover_event(
        &self,
        group_id: Uuid,
        failover_type: &str,
        status: &str,
    ) -> Result<Option<FailoverEventRecord>> {
        let raw = self
            .api
            .select(
                "failover_events",
                &[
                    Filter::eq("protection_group_id", group_id),
                    Filter::eq("failover_type", failover_type),
                    Filter::eq("status", status),
                ],
                SelectOptions {
                    order: Some("started_at.desc"),
                    limit: Some(1),
                    ..Default::default()
                },
            )
            .await?;
        first_row(raw)
    }

    // ------------------------------------------------------------------
    // Appliance agents
    // ------------------------------------------------------------------

    pub async fn zfs_agent_by_id(&self, id: Uuid) -> Result<Option<ZfsAgentRecord>> {
        let raw = self
            .api
            .select("zfs_agents", &[Filter::eq("id", id)], SelectOptions::default())
            .await?;
        first_row(raw)
    }

    /// The replication target already backed by an agent, if one exists.
    /// Re-registration updates this row instead of inserting a duplicate.
    pub async fn replication_target_by_agent(
        &self,
        agent_id: Uuid,
    ) -> Result<Option<ReplicationTargetRecord>> {
        let raw = self
            .api
            .select(
                "replication_targets",
                &[Filter::eq("agent_id", agent_id)],
                SelectOptions::default(),
            )
            .await?;
        first_row(raw)
    }

    pub async fn patch_zfs_agent(&self, id: Uuid, patch: Value) -> Result<()> {
        self.api
            .patch("zfs_agents", &[Filter::eq("id", id)], patch)
            .await?;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Observability & settings
    // ------------------------------------------------------------------

    pub async fn insert_audit(&self, row: &CommandAuditRow) -> Result<()> {
        self.api
            .insert("command_audit_log", serde_json::to_value(row)?)
            .await?;
        Ok(())
    }

    /// Fetch an encrypted application setting by key.
    pub async fn app_setting(&self, key: &str) -> Result<Option<String>> {
        let raw = self
            .api
            .select(
                "app_settings",
                &[Filter::eq("key", key)],
                SelectOptions::default(),
            )
            .await?;
        Ok(raw
            .into_iter()
            .next()
            .and_then(|row| row.get("value_encrypted").and_then(|v| v.as_str()).map(String::from)))
    }
}
