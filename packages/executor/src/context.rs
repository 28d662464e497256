//! Shared services handed to every handler.
//!
//! Handlers receive an explicit [`ExecutorContext`] rather than reaching
//! back into the executor: the coordinator client, the session manager,
//! the protocol adapters, the credential key, and the notifier. The
//! [`Workflow`] helper layers the common handler lifecycle on top:
//! status updates, the details envelope, console logging, phase
//! transitions, and cancellation checks.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context as _, Result};
use chrono::Utc;
use serde_json::{json, Value};
use tracing::error;
use uuid::Uuid;

use crate::adapters::{
    CommandOutput, OpenSshRunner, RedfishApi, RedfishClient, SshRunner, SshTarget, VsphereApi,
    VsphereRestClient,
};
use crate::audit::{AuditCall, CommandAudit};
use crate::config::Config;
use crate::coordinator::{
    Coordinator, CoordinatorApi, Filter, Job, JobStatus, RestCoordinator, Task,
};
use crate::crypto::CredentialKey;
use crate::notify::{EdgeNotifier, Notify, SecretSource};
use crate::progress::{merge_value, DetailsEnvelope};
use crate::session::SessionManager;

/// Everything a handler needs, read-only after startup.
pub struct ExecutorContext {
    pub config: Config,
    pub coordinator: Coordinator,
    pub sessions: Arc<SessionManager>,
    pub audit: CommandAudit,
    pub redfish: Arc<dyn RedfishApi>,
    pub vsphere: Arc<dyn VsphereApi>,
    pub ssh: Arc<dyn SshRunner>,
    pub credentials: CredentialKey,
    pub notifier: Arc<dyn Notify>,
}

impl ExecutorContext {
    /// Wire up the production context from configuration.
    pub fn production(config: Config) -> Result<Arc<Self>> {
        let api: Arc<dyn CoordinatorApi> = Arc::new(RestCoordinator::new(&config)?);
        let coordinator = Coordinator::new(api);
        let sessions = Arc::new(SessionManager::new(config.verify_tls));
        let audit = CommandAudit::new(coordinator.clone());
        let credentials = CredentialKey::from_base64(&config.credential_key)
            .context("CREDENTIAL_KEY is not a valid key")?;
        let secret = SecretSource::new(
            config.shared_secret.clone(),
            coordinator.clone(),
            credentials.clone(),
        );
        let notifier: Arc<dyn Notify> = Arc::new(EdgeNotifier::new(&config, secret)?);

        Ok(Arc::new(Self {
            redfish: Arc::new(RedfishClient::new(sessions.clone(), audit.clone())),
            vsphere: Arc::new(VsphereRestClient::new(sessions.clone(), audit.clone())),
            ssh: Arc::new(OpenSshRunner),
            coordinator,
            sessions,
            audit,
            credentials,
            notifier,
            config,
        }))
    }

    pub fn worker_id(&self) -> &str {
        &self.config.worker_id
    }

    // ------------------------------------------------------------------
    // Job helpers
    // ------------------------------------------------------------------

    /// Patch a job's status. The write is keyed on the job still being
    /// non-terminal, so a terminal state can never be overwritten: the
    /// claiming worker stays the sole effective writer after claim, and an
    /// external cancellation is never clobbered by a late update.
    pub async fn set_status(
        &self,
        job_id: Uuid,
        status: JobStatus,
        details: Option<Value>,
        error_message: Option<&str>,
    ) -> Result<()> {
        if let Some(patch) = details {
            self.merge_details(job_id, &patch).await?;
        }

        let mut patch = json!({ "status": status.as_str() });
        if status.is_terminal() {
            patch["completed_at"] = json!(Utc::now());
        }
        if let Some(message) = error_message {
            patch["error"] = json!(message);
        }
        self.coordinator
            .api()
            .patch(
                "jobs",
                &[
                    Filter::eq("id", job_id),
                    Filter::any("status", ["pending", "running"]),
                ],
                patch,
            )
            .await?;
        Ok(())
    }

    /// Read-merge-write the job's `details`. Deep merge, last-writer-wins
    /// at each leaf; neighbouring fields written by others may move
    /// between the read and the write.
    pub async fn merge_details(&self, job_id: Uuid, patch: &Value) -> Result<()> {
        let current = self
            .coordinator
            .get_job(job_id)
            .await?
            .and_then(|job| job.details)
            .unwrap_or_else(|| json!({}));
        let mut merged = current;
        merge_value(&mut merged, patch);
        self.coordinator
            .update_job(job_id, json!({ "details": merged }))
            .await
    }

    /// Point-in-time cancellation check.
    pub async fn is_cancelled(&self, job_id: Uuid) -> Result<bool> {
        Ok(self
            .coordinator
            .get_job(job_id)
            .await?
            .map(|job| job.status == JobStatus::Cancelled)
            .unwrap_or(false))
    }

    // ------------------------------------------------------------------
    // Task helpers
    // ------------------------------------------------------------------

    pub async fn create_task(
        &self,
        job_id: Uuid,
        server_id: Option<Uuid>,
        vcenter_host_id: Option<Uuid>,
    ) -> Result<Task> {
        self.coordinator
            .insert_task(job_id, server_id, vcenter_host_id)
            .await
    }

    pub async fn set_task_status(
        &self,
        task_id: Uuid,
        status: JobStatus,
        message: Option<&str>,
        progress: Option<u8>,
    ) -> Result<()> {
        let mut patch = json!({ "status": status.as_str() });
        if let Some(message) = message {
            patch["message"] = json!(message);
        }
        if let Some(progress) = progress {
            patch["progress"] = json!(progress.min(100));
        }
        self.coordinator.update_task(task_id, patch).await
    }

    // ------------------------------------------------------------------
    // Remote helpers
    // ------------------------------------------------------------------

    /// An SSH runner that audits every command under the given job.
    pub fn audited_ssh(&self, job_id: Uuid, server_id: Option<Uuid>) -> crate::adapters::AuditedSsh {
        crate::adapters::AuditedSsh::new(self.ssh.clone(), self.audit.clone(), job_id, server_id)
    }

    /// Run one SSH command with an audit row, like every other remote call.
    pub async fn run_ssh(
        &self,
        job_id: Uuid,
        server_id: Option<Uuid>,
        target: &SshTarget,
        command: &str,
        timeout: Duration,
    ) -> Result<CommandOutput> {
        let started = std::time::Instant::now();
        let mut audit = AuditCall::new("SSH", target.endpoint()).server(server_id);
        audit.job_id = Some(job_id);
        audit = audit.request_body(command.to_string());

        match self.ssh.exec(target, command, timeout).await {
            Ok(output) => {
                audit.success = output.success();
                audit.response_time_ms = Some(started.elapsed().as_millis() as u64);
                audit.status_code = Some(if output.success() { 0 } else { 1 });
                audit = audit.response_body(if output.success() {
                    output.stdout.clone()
                } else {
                    output.stderr.clone()
                });
                self.audit.record(audit).await;
                Ok(output)
            }
            Err(err) => {
                self.audit.record(audit.failed(err.to_string())).await;
                Err(err)
            }
        }
    }
}

/// Per-job workflow state: the details envelope plus the helpers every
/// multi-phase handler shares.
pub struct Workflow {
    ctx: Arc<ExecutorContext>,
    pub job_id: Uuid,
    pub env: DetailsEnvelope,
}

impl Workflow {
    /// Initialize the envelope from the job's input details, reset phase
    /// and progress, and mark the job running.
    pub async fn begin(ctx: &Arc<ExecutorContext>, job: &Job) -> Result<Self> {
        let mut env = DetailsEnvelope::from_details(job.details.as_ref());
        env.current_phase = "initializing".to_string();
        env.progress_percent = 0;
        let workflow = Self {
            ctx: ctx.clone(),
            job_id: job.id,
            env,
        };
        workflow
            .ctx
            .set_status(job.id, JobStatus::Running, Some(workflow.env.to_value()), None)
            .await?;
        Ok(workflow)
    }

    /// Write the envelope back to the job's details.
    pub async fn flush(&self) -> Result<()> {
        self.ctx.merge_details(self.job_id, &self.env.to_value()).await
    }

    /// Enter a phase: update phase and progress, log a line, flush.
    pub async fn phase(&mut self, name: &str, percent: u8) -> Result<()> {
        self.env.set_phase(name, percent);
        self.env.console("INFO", &format!("Phase: {name}"));
        self.flush().await
    }

    /// Append a console line and flush (best-effort: a failed flush is
    /// logged but does not fail the handler).
    pub async fn console(&mut self, level: &str, message: &str) {
        self.env.console(level, message);
        if let Err(e) = self.flush().await {
            error!(job_id = %self.job_id, error = %e, "failed to stream console line");
        }
    }

    pub async fn info(&mut self, message: &str) {
        self.console("INFO", message).await;
    }

    pub async fn warn(&mut self, message: &str) {
        self.console("WARN", message).await;
    }

    /// Cancellation checkpoint, called at phase boundaries and before
    /// long-running remote work.
    pub async fn cancelled(&self) -> Result<bool> {
        self.ctx.is_cancelled(self.job_id).await
    }

    /// Terminal: success. Progress reaches 100 in the `complete` phase.
    pub async fn complete(mut self) -> Result<()> {
        self.env.set_phase("complete", 100);
        self.ctx
            .set_status(self.job_id, JobStatus::Completed, Some(self.env.to_value()), None)
            .await
    }

    /// Terminal: failure, recording the phase that failed.
    pub async fn fail(mut self, message: &str) -> Result<()> {
        if self.env.failed_phase.is_none() {
            self.env.failed_phase = Some(self.env.current_phase.clone());
        }
        self.env.error = Some(message.to_string());
        self.env.console("ERROR", message);
        self.ctx
            .set_status(
                self.job_id,
                JobStatus::Failed,
                Some(self.env.to_value()),
                Some(message),
            )
            .await
    }

    /// Terminal: cooperative cancellation observed and cleanup done.
    pub async fn cancel(mut self) -> Result<()> {
        self.env.console("WARN", "Cancelled by user");
        self.ctx
            .set_status(self.job_id, JobStatus::Cancelled, Some(self.env.to_value()), None)
            .await
    }
}
