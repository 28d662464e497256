//! Remote-call audit log.
//!
//! Every outbound remote call (HTTP to a controller or hypervisor, SSH to
//! an appliance) appends one row to the coordinator so operators can see
//! exactly what the executor did to their hardware. Audit writes are
//! best-effort: a failed insert is logged and never fails the job.

use chrono::Utc;
use tracing::warn;
use uuid::Uuid;

use crate::coordinator::{CommandAuditRow, Coordinator};

/// Bodies are truncated before leaving the process.
pub const MAX_AUDIT_BODY: usize = 2000;

/// One remote call, before truncation.
#[derive(Debug, Clone)]
pub struct AuditCall {
    pub job_id: Option<Uuid>,
    pub server_id: Option<Uuid>,
    pub method: String,
    pub endpoint: String,
    pub status_code: Option<u16>,
    pub response_time_ms: Option<u64>,
    pub success: bool,
    pub error_message: Option<String>,
    pub request_body: Option<String>,
    pub response_body: Option<String>,
}

impl AuditCall {
    pub fn new(method: impl Into<String>, endpoint: impl Into<String>) -> Self {
        Self {
            job_id: None,
            server_id: None,
            method: method.into(),
            endpoint: endpoint.into(),
            status_code: None,
            response_time_ms: None,
            success: false,
            error_message: None,
            request_body: None,
            response_body: None,
        }
    }

    pub fn job(mut self, job_id: Uuid) -> Self {
        self.job_id = Some(job_id);
        self
    }

    pub fn server(mut self, server_id: Option<Uuid>) -> Self {
        self.server_id = server_id;
        self
    }

    pub fn outcome(mut self, status_code: u16, elapsed_ms: u64) -> Self {
        self.status_code = Some(status_code);
        self.response_time_ms = Some(elapsed_ms);
        self.success = (200..300).contains(&status_code);
        self
    }

    pub fn failed(mut self, error: impl Into<String>) -> Self {
        self.success = false;
        self.error_message = Some(error.into());
        self
    }

    pub fn succeeded(mut self, elapsed_ms: u64) -> Self {
        self.success = true;
        self.response_time_ms = Some(elapsed_ms);
        self
    }

    pub fn request_body(mut self, body: impl Into<String>) -> Self {
        self.request_body = Some(body.into());
        self
    }

    pub fn response_body(mut self, body: impl Into<String>) -> Self {
        self.response_body = Some(body.into());
        self
    }
}

/// Appender for the command audit log.
#[derive(Clone)]
pub struct CommandAudit {
    coordinator: Coordinator,
}

impl CommandAudit {
    pub fn new(coordinator: Coordinator) -> Self {
        Self { coordinator }
    }

    /// Append one row. Failures are logged, never propagated.
    pub async fn record(&self, call: AuditCall) {
        let row = CommandAuditRow {
            timestamp: Utc::now(),
            job_id: call.job_id,
            server_id: call.server_id,
            method: call.method,
            endpoint: call.endpoint,
            status_code: call.status_code,
            response_time_ms: call.response_time_ms,
            success: call.success,
            error_message: call.error_message.map(|m| truncate(&m)),
            request_body: call.request_body.map(|b| truncate(&b)),
            response_body: call.response_body.map(|b| truncate(&b)),
        };
        if let Err(e) = self.coordinator.insert_audit(&row).await {
            warn!(error = %e, endpoint = %row.endpoint, "failed to append command audit row");
        }
    }
}

fn truncate(body: &str) -> String {
    match body.char_indices().nth(MAX_AUDIT_BODY) {
        Some((cut, _)) => body[..cut].to_string(),
        None => body.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_truncate_bounds_bodies() {
        let long = "y".repeat(5000);
        assert_eq!(truncate(&long).len(), MAX_AUDIT_BODY);
        assert_eq!(truncate("short"), "short");
    }

    #[test]
    fn test_outcome_classifies_success() {
        let ok = AuditCall::new("GET", "/redfish/v1/Systems").outcome(200, 12);
        assert!(ok.success);
        let accepted = AuditCall::new("POST", "/reset").outcome(204, 30);
        assert!(accepted.success);
        let denied = AuditCall::new("GET", "/redfish/v1/Systems").outcome(401, 9);
        assert!(!denied.success);
    }
}
