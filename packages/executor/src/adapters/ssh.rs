//! SSH execution on storage appliances and hypervisor hosts.
//!
//! The runner is a trait seam so handlers can be exercised against a mock;
//! the production implementation drives the system `ssh` binary (and
//! `sshpass` for password auth) through `tokio::process`. Key material is
//! decrypted from the coordinator, written to a 0600 temp file for the
//! lifetime of one command, and removed afterwards.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use tokio::process::Command;
use uuid::Uuid;

/// Authentication material for an SSH target.
#[derive(Clone)]
pub enum SshAuth {
    Password(String),
    /// PEM private key, already decrypted.
    Key(String),
}

impl std::fmt::Debug for SshAuth {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SshAuth::Password(_) => f.write_str("SshAuth::Password(..)"),
            SshAuth::Key(_) => f.write_str("SshAuth::Key(..)"),
        }
    }
}

/// One SSH endpoint.
#[derive(Debug, Clone)]
pub struct SshTarget {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub auth: SshAuth,
}

impl SshTarget {
    pub fn new(host: impl Into<String>, username: impl Into<String>, auth: SshAuth) -> Self {
        Self {
            host: host.into(),
            port: 22,
            username: username.into(),
            auth,
        }
    }

    pub fn port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    /// Serialization/audit key for this endpoint.
    pub fn endpoint(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Captured output of one remote command.
#[derive(Debug, Clone)]
pub struct CommandOutput {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }

    pub fn stdout_trimmed(&self) -> &str {
        self.stdout.trim()
    }
}

#[async_trait]
pub trait SshRunner: Send + Sync {
    /// Run one command on the target, bounded by `timeout`.
    async fn exec(
        &self,
        target: &SshTarget,
        command: &str,
        timeout: Duration,
    ) -> Result<CommandOutput>;

    /// Cheap connectivity/handshake check.
    async fn probe(&self, target: &SshTarget, timeout: Duration) -> Result<()> {
        let output = self.exec(target, "true", timeout).await?;
        if !output.success() {
            bail!("ssh probe failed: {}", output.stderr.trim());
        }
        Ok(())
    }
}

/// Production runner over the system `ssh` binary.
pub struct OpenSshRunner;

impl OpenSshRunner {
    fn common_args(target: &SshTarget, timeout: Duration) -> Vec<String> {
        vec![
            "-o".into(),
            "StrictHostKeyChecking=no".into(),
            "-o".into(),
            "UserKnownHostsFile=/dev/null".into(),
            "-o".into(),
            "BatchMode=no".into(),
            "-o".into(),
            format!("ConnectTimeout={}", timeout.as_secs().clamp(1, 60)),
            "-p".into(),
            target.port.to_string(),
            format!("{}@{}", target.username, target.host),
        ]
    }

    async fn run(mut command: Command, timeout: Duration) -> Result<CommandOutput> {
        command.kill_on_drop(true);
        let output = tokio::time::timeout(timeout, command.output())
            .await
            .map_err(|_| anyhow::anyhow!("ssh command timed out after {timeout:?}"))?
            .context("failed to spawn ssh")?;

        Ok(CommandOutput {
            exit_code: output.status.code().unwrap_or(-1),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }
}

#[async_trait]
impl SshRunner for OpenSshRunner {
    async fn exec(
        &self,
        target: &SshTarget,
        command_line: &str,
        timeout: Duration,
    ) -> Result<CommandOutput> {
        match &target.auth {
            SshAuth::Password(password) => {
                let mut command = Command::new("sshpass");
                command.arg("-p").arg(password).arg("ssh");
                command.args(Self::common_args(target, timeout));
                command.arg(command_line);
                Self::run(command, timeout).await
            }
            SshAuth::Key(private_key) => {
                let key_path = TempKeyFile::write(private_key).await?;
                let mut command = Command::new("ssh");
                command.arg("-i").arg(key_path.path());
                command.args(Self::common_args(target, timeout));
                command.arg(command_line);
                let result = Self::run(command, timeout).await;
                key_path.remove().await;
                result
            }
        }
    }
}

/// Runner wrapper that appends an audit row for every command, carrying
/// the job context. Composes with [`super::zfs::ZfsOps`] so storage
/// operations land in the command audit log like every other remote call.
pub struct AuditedSsh {
    inner: std::sync::Arc<dyn SshRunner>,
    audit: crate::audit::CommandAudit,
    job_id: Uuid,
    server_id: Option<Uuid>,
}

impl AuditedSsh {
    pub fn new(
        inner: std::sync::Arc<dyn SshRunner>,
        audit: crate::audit::CommandAudit,
        job_id: Uuid,
        server_id: Option<Uuid>,
    ) -> Self {
        Self {
            inner,
            audit,
            job_id,
            server_id,
        }
    }
}

#[async_trait]
impl SshRunner for AuditedSsh {
    async fn exec(
        &self,
        target: &SshTarget,
        command: &str,
        timeout: Duration,
    ) -> Result<CommandOutput> {
        use crate::audit::AuditCall;

        let started = std::time::Instant::now();
        let mut call = AuditCall::new("SSH", target.endpoint())
            .server(self.server_id)
            .request_body(command.to_string());
        call.job_id = Some(self.job_id);

        match self.inner.exec(target, command, timeout).await {
            Ok(output) => {
                call.success = output.success();
                call.status_code = Some(if output.success() { 0 } else { 1 });
                call.response_time_ms = Some(started.elapsed().as_millis() as u64);
                call = call.response_body(if output.success() {
                    output.stdout.clone()
                } else {
                    output.stderr.clone()
                });
                self.audit.record(call).await;
                Ok(output)
            }
            Err(err) => {
                self.audit.record(call.failed(err.to_string())).await;
                Err(err)
            }
        }
    }
}

/// A private key written to disk for the lifetime of one command.
struct TempKeyFile {
    path: PathBuf,
}

impl TempKeyFile {
    async fn write(private_key: &str) -> Result<Self> {
        let path = std::env::temp_dir().join(format!("executor-key-{}", Uuid::new_v4()));
        tokio::fs::write(&path, private_key)
            .await
            .context("failed to write temporary key file")?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            tokio::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o600))
                .await
                .context("failed to restrict key file permissions")?;
        }
        Ok(Self { path })
    }

    fn path(&self) -> &PathBuf {
        &self.path
    }

    async fn remove(self) {
        let _ = tokio::fs::remove_file(&self.path).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_auth_debug_hides_secrets() {
        assert_eq!(
            format!("{:?}", SshAuth::Password("pw".into())),
            "SshAuth::Password(..)"
        );
        assert_eq!(format!("{:?}", SshAuth::Key("pem".into())), "SshAuth::Key(..)");
    }

    #[test]
    fn test_endpoint_includes_port() {
        let target =
            SshTarget::new("10.0.0.9", "root", SshAuth::Password("pw".into())).port(2222);
        assert_eq!(target.endpoint(), "10.0.0.9:2222");
    }

    #[test]
    fn test_common_args_shape() {
        let target = SshTarget::new("10.0.0.9", "root", SshAuth::Password("pw".into()));
        let args = OpenSshRunner::common_args(&target, Duration::from_secs(10));
        assert!(args.contains(&"root@10.0.0.9".to_string()));
        assert!(args.contains(&"ConnectTimeout=10".to_string()));
    }

    #[tokio::test]
    async fn test_temp_key_file_round_trip() {
        let key = TempKeyFile::write("-----BEGIN KEY-----").await.unwrap();
        let path = key.path().clone();
        assert_eq!(
            tokio::fs::read_to_string(&path).await.unwrap(),
            "-----BEGIN KEY-----"
        );
        key.remove().await;
        assert!(tokio::fs::metadata(&path).await.is_err());
    }
}
