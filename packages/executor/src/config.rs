use std::time::Duration;

use anyhow::{Context, Result};
use dotenvy::dotenv;
use std::env;
use uuid::Uuid;

/// Executor configuration loaded from environment variables.
///
/// Missing mandatory variables are fatal at startup; the supervisor is
/// expected to restart the process after the environment is fixed.
#[derive(Debug, Clone)]
pub struct Config {
    /// Base URL of the coordination database REST surface.
    pub coordinator_url: String,
    /// Service bearer token for coordinator requests.
    pub service_token: String,
    /// API key header value (defaults to the service token).
    pub api_key: String,
    /// Process-wide symmetric key used to decrypt stored credentials (base64).
    pub credential_key: String,
    /// Shared secret for signing status callbacks. When absent it is fetched
    /// from the coordinator on first use and cached for the process lifetime.
    pub shared_secret: Option<String>,
    /// How often the dispatcher polls for pending jobs.
    pub poll_interval: Duration,
    /// Bounded worker pool size: maximum handlers running in parallel.
    pub worker_pool_size: usize,
    /// Running jobs older than this are treated as dead during recovery.
    pub stale_running_timeout: Duration,
    /// Identity recorded on every claim; stable across one process lifetime.
    pub worker_id: String,
    /// Verify TLS certificates on remote management endpoints. The fleet
    /// uses self-signed certificates, so this defaults to off.
    pub verify_tls: bool,
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self> {
        // Load .env file if present (development)
        let _ = dotenv();

        let service_token =
            env::var("SERVICE_TOKEN").context("SERVICE_TOKEN must be set")?;
        let api_key = env::var("API_KEY").unwrap_or_else(|_| service_token.clone());

        Ok(Self {
            coordinator_url: env::var("COORDINATOR_URL")
                .context("COORDINATOR_URL must be set")?,
            service_token,
            api_key,
            credential_key: env::var("CREDENTIAL_KEY")
                .context("CREDENTIAL_KEY must be set")?,
            shared_secret: env::var("EXECUTOR_SHARED_SECRET").ok(),
            poll_interval: Duration::from_secs(
                parse_var("POLL_INTERVAL_SECS", 5)?,
            ),
            worker_pool_size: parse_var("WORKER_POOL_SIZE", 4)? as usize,
            stale_running_timeout: Duration::from_secs(
                parse_var("STALE_RUNNING_TIMEOUT_SECS", 600)?,
            ),
            worker_id: env::var("WORKER_ID")
                .unwrap_or_else(|_| format!("executor-{}", Uuid::new_v4())),
            verify_tls: env::var("VERIFY_TLS")
                .map(|v| v == "true" || v == "1")
                .unwrap_or(false),
        })
    }
}

fn parse_var(name: &str, default: u64) -> Result<u64> {
    match env::var(name) {
        Ok(v) => v
            .parse()
            .with_context(|| format!("{name} must be a valid number")),
        Err(_) => Ok(default),
    }
}
