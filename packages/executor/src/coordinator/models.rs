//! Row types for the coordinator's resources.
//!
//! The coordinator is the system of record; the executor deserializes only
//! the fields it consumes and patches only the fields it owns. Unknown
//! columns pass through untouched.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

// ============================================================================
// Jobs and tasks
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    #[default]
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl JobStatus {
    /// Terminal states are never left once entered.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }
}

/// A unit of work owned by whichever executor holds its lease.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: Uuid,
    pub job_type: String,
    #[serde(default)]
    pub status: JobStatus,
    #[serde(default)]
    pub scheduled_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub worker_id: Option<String>,
    #[serde(default)]
    pub target_scope: Option<Value>,
    #[serde(default)]
    pub details: Option<Value>,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub created_by: Option<Uuid>,
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
}

impl Job {
    /// A string field out of `details`.
    pub fn detail_str(&self, key: &str) -> Option<&str> {
        self.details.as_ref()?.get(key)?.as_str()
    }

    /// A numeric field out of `details`.
    pub fn detail_u64(&self, key: &str) -> Option<u64> {
        self.details.as_ref()?.get(key)?.as_u64()
    }

    /// A boolean field out of `details`.
    pub fn detail_bool(&self, key: &str) -> Option<bool> {
        self.details.as_ref()?.get(key)?.as_bool()
    }

    /// A string field out of `target_scope`.
    pub fn scope_str(&self, key: &str) -> Option<&str> {
        self.target_scope.as_ref()?.get(key)?.as_str()
    }
}

/// Insert shape for a new job row.
#[derive(Debug, Clone, Serialize)]
pub struct NewJob {
    pub job_type: String,
    pub status: JobStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub scheduled_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub target_scope: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub created_by: Option<Uuid>,
}

impl NewJob {
    pub fn pending(job_type: impl Into<String>) -> Self {
        Self {
            job_type: job_type.into(),
            status: JobStatus::Pending,
            scheduled_at: None,
            target_scope: None,
            details: None,
            created_by: None,
        }
    }

    pub fn scheduled_at(mut self, at: DateTime<Utc>) -> Self {
        self.scheduled_at = Some(at);
        self
    }

    pub fn details(mut self, details: Value) -> Self {
        self.details = Some(details);
        self
    }

    pub fn target_scope(mut self, scope: Value) -> Self {
        self.target_scope = Some(scope);
        self
    }

    pub fn created_by(mut self, user: Option<Uuid>) -> Self {
        self.created_by = user;
        self
    }
}

/// Per-target sub-unit of a job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: Uuid,
    pub job_id: Uuid,
    #[serde(default)]
    pub server_id: Option<Uuid>,
    #[serde(default)]
    pub vcenter_host_id: Option<Uuid>,
    #[serde(default)]
    pub status: JobStatus,
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub progress: Option<u8>,
}

// ============================================================================
// Inventory
// ============================================================================

/// A managed server with an out-of-band controller.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerRecord {
    pub id: Uuid,
    #[serde(default)]
    pub hostname: Option<String>,
    pub ip_address: String,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub power_state: Option<String>,
    #[serde(default)]
    pub health_status: Option<String>,
    #[serde(default)]
    pub last_seen_at: Option<DateTime<Utc>>,
    /// Controllers with old firmware need the legacy-TLS session variant.
    #[serde(default)]
    pub requires_legacy_tls: Option<bool>,
}

/// Out-of-band credentials for a server, password encrypted at rest.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerCredentialRecord {
    pub server_id: Uuid,
    pub username: String,
    pub password_encrypted: String,
}

/// A hypervisor manager endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VcenterRecord {
    pub id: Uuid,
    pub host: String,
    pub username: String,
    pub password_encrypted: String,
}

/// A hypervisor host under a manager.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EsxiHostRecord {
    pub id: Uuid,
    #[serde(default)]
    pub vcenter_id: Option<Uuid>,
    #[serde(default)]
    pub vcenter_host_id: Option<String>,
    pub hostname: String,
    pub mgmt_ip: String,
    #[serde(default)]
    pub ssh_username: Option<String>,
    #[serde(default)]
    pub ssh_password_encrypted: Option<String>,
    #[serde(default)]
    pub version: Option<String>,
    #[serde(default)]
    pub maintenance_mode: Option<bool>,
    #[serde(default)]
    pub status: Option<String>,
}

/// A deployable storage-appliance template.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ZfsTemplateRecord {
    pub id: Uuid,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub vcenter_id: Option<Uuid>,
    #[serde(default)]
    pub template_moref: Option<String>,
    #[serde(default)]
    pub ssh_key_id: Option<Uuid>,
    #[serde(default)]
    pub default_ssh_username: Option<String>,
    #[serde(default)]
    pub default_zfs_pool: Option<String>,
    #[serde(default)]
    pub default_zfs_disk_gb: Option<u64>,
    #[serde(default)]
    pub default_nfs_network: Option<String>,
    #[serde(default)]
    pub default_cpu: Option<u64>,
    #[serde(default)]
    pub default_memory_gb: Option<u64>,
    #[serde(default)]
    pub default_cluster: Option<String>,
    #[serde(default)]
    pub use_template_disk: Option<bool>,
    #[serde(default)]
    pub deployment_count: Option<u64>,
}

/// SSH key material, private half encrypted at rest.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SshKeyRecord {
    pub id: Uuid,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub public_key: Option<String>,
    #[serde(default)]
    pub private_key_encrypted: Option<String>,
}

// ============================================================================
// Replication
// ============================================================================

/// A ZFS storage appliance acting as a replication endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplicationTargetRecord {
    pub id: Uuid,
    pub name: String,
    pub hostname: String,
    #[serde(default)]
    pub ssh_port: Option<u16>,
    #[serde(default)]
    pub ssh_username: Option<String>,
    #[serde(default)]
    pub ssh_password_encrypted: Option<String>,
    #[serde(default)]
    pub ssh_key_id: Option<Uuid>,
    #[serde(default)]
    pub zfs_pool: Option<String>,
    #[serde(default)]
    pub nfs_export_path: Option<String>,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub health_status: Option<String>,
    #[serde(default)]
    pub last_seen_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub deployed_job_id: Option<Uuid>,
    #[serde(default)]
    pub vcenter_id: Option<Uuid>,
    #[serde(default)]
    pub datastore_name: Option<String>,
    #[serde(default)]
    pub agent_id: Option<Uuid>,
}

/// A set of protected VMs sharing an RPO target and replication pair.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProtectionGroupRecord {
    pub id: Uuid,
    pub name: String,
    #[serde(default = "default_true")]
    pub is_enabled: bool,
    #[serde(default)]
    pub paused_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub replication_schedule: Option<String>,
    #[serde(default)]
    pub last_replication_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub next_scheduled_sync: Option<DateTime<Utc>>,
    #[serde(default)]
    pub rpo_minutes: Option<i64>,
    #[serde(default)]
    pub current_rpo_seconds: Option<i64>,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub sync_in_progress: Option<bool>,
    #[serde(default)]
    pub replication_pair_id: Option<Uuid>,
    #[serde(default)]
    pub target_id: Option<Uuid>,
    #[serde(default)]
    pub test_reminder_days: Option<i64>,
    #[serde(default)]
    pub last_test_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub created_by: Option<Uuid>,
}

fn default_true() -> bool {
    true
}

/// A VM inside a protection group.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProtectedVmRecord {
    pub id: Uuid,
    pub protection_group_id: Uuid,
    pub vm_name: String,
    #[serde(default)]
    pub vm_moref: Option<String>,
    #[serde(default)]
    pub dataset: Option<String>,
    #[serde(default)]
    pub replication_status: Option<String>,
    #[serde(default)]
    pub last_snapshot_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub last_replication_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub status_message: Option<String>,
}

/// Source/destination pairing between two replication targets.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplicationPairRecord {
    pub id: Uuid,
    pub source_target_id: Uuid,
    pub dest_target_id: Uuid,
    #[serde(default)]
    pub status: Option<String>,
}

/// An open or resolved SLA violation for a protection group.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SlaViolationRecord {
    pub id: Uuid,
    pub protection_group_id: Uuid,
    pub violation_type: String,
    #[serde(default)]
    pub severity: Option<String>,
    #[serde(default)]
    pub details: Option<Value>,
    #[serde(default)]
    pub notification_sent: Option<bool>,
    #[serde(default)]
    pub resolved_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
}

/// Failover lifecycle row (test, live, commit, rollback).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FailoverEventRecord {
    pub id: Uuid,
    pub protection_group_id: Uuid,
    pub failover_type: String,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub details: Option<Value>,
    #[serde(default)]
    pub error: Option<String>,
}

/// A storage appliance running the management agent (registered over its
/// HTTPS API instead of SSH).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ZfsAgentRecord {
    pub id: Uuid,
    pub hostname: String,
    #[serde(default)]
    pub api_port: Option<u16>,
    /// Agents deployed without TLS (lab/bootstrap) set this false.
    #[serde(default)]
    pub api_ssl: Option<bool>,
    #[serde(default)]
    pub api_token_encrypted: Option<String>,
    #[serde(default)]
    pub status: Option<String>,
}

// ============================================================================
// Observability
// ============================================================================

/// One row per outbound remote call, append-only.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandAuditRow {
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub job_id: Option<Uuid>,
    #[serde(default)]
    pub server_id: Option<Uuid>,
    pub method: String,
    pub endpoint: String,
    #[serde(default)]
    pub status_code: Option<u16>,
    #[serde(default)]
    pub response_time_ms: Option<u64>,
    pub success: bool,
    #[serde(default)]
    pub error_message: Option<String>,
    #[serde(default)]
    pub request_body: Option<String>,
    #[serde(default)]
    pub response_body: Option<String>,
}

/// Point-in-time replication metrics for a group.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplicationMetricsRow {
    pub protection_group_id: Uuid,
    pub current_rpo_seconds: i64,
    #[serde(default)]
    pub bytes_transferred: Option<u64>,
    #[serde(default)]
    pub throughput_mbps: Option<f64>,
    #[serde(default)]
    pub vms_synced: Option<u64>,
    pub recorded_at: DateTime<Utc>,
}
