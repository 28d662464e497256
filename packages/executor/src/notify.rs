//! Signed notification callbacks.
//!
//! Alerts (SLA violations, failover outcomes) leave the executor through
//! the coordinator's notification edge function. The request body is
//! signed with the shared executor secret so the edge function can reject
//! unauthorized or replayed calls. The secret comes from the environment
//! when configured, otherwise it is fetched from the coordinator once and
//! cached for the process lifetime.

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use serde_json::Value;
use tokio::sync::OnceCell;
use tracing::warn;

use crate::config::Config;
use crate::coordinator::Coordinator;
use crate::crypto::CredentialKey;
use crate::signing::{self, SIGNATURE_HEADER, TIMESTAMP_HEADER};

/// Coordinator setting holding the encrypted shared secret.
const SECRET_SETTING_KEY: &str = "executor_shared_secret";

#[async_trait]
pub trait Notify: Send + Sync {
    async fn send(&self, payload: &Value) -> Result<()>;
}

/// Shared-secret source with first-use fetch and caching.
pub struct SecretSource {
    configured: Option<String>,
    coordinator: Coordinator,
    credentials: CredentialKey,
    cache: OnceCell<Option<String>>,
}

impl SecretSource {
    pub fn new(
        configured: Option<String>,
        coordinator: Coordinator,
        credentials: CredentialKey,
    ) -> Self {
        Self {
            configured,
            coordinator,
            credentials,
            cache: OnceCell::new(),
        }
    }

    /// The shared secret, or `None` when it is configured nowhere.
    pub async fn get(&self) -> Option<String> {
        if let Some(secret) = &self.configured {
            return Some(secret.clone());
        }
        self.cache
            .get_or_init(|| async {
                match self.fetch().await {
                    Ok(secret) => secret,
                    Err(e) => {
                        warn!(error = %e, "could not fetch executor shared secret; callbacks will be unsigned");
                        None
                    }
                }
            })
            .await
            .clone()
    }

    async fn fetch(&self) -> Result<Option<String>> {
        match self.coordinator.app_setting(SECRET_SETTING_KEY).await? {
            Some(encrypted) => Ok(Some(
                self.credentials
                    .decrypt(&encrypted)
                    .context("stored shared secret failed to decrypt")?,
            )),
            None => Ok(None),
        }
    }
}

/// Production notifier posting to the notification edge function.
pub struct EdgeNotifier {
    http: reqwest::Client,
    url: String,
    service_token: String,
    secret: SecretSource,
}

impl EdgeNotifier {
    pub fn new(config: &Config, secret: SecretSource) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(30))
            .danger_accept_invalid_certs(!config.verify_tls)
            .build()
            .context("failed to build notification HTTP client")?;
        Ok(Self {
            http,
            url: format!(
                "{}/functions/v1/send-notification",
                config.coordinator_url.trim_end_matches('/')
            ),
            service_token: config.service_token.clone(),
            secret,
        })
    }
}

#[async_trait]
impl Notify for EdgeNotifier {
    async fn send(&self, payload: &Value) -> Result<()> {
        let mut request = self
            .http
            .post(&self.url)
            .bearer_auth(&self.service_token)
            .json(payload);

        match self.secret.get().await {
            Some(secret) => {
                let signature = signing::sign(payload, &secret, Utc::now().timestamp());
                request = request
                    .header(SIGNATURE_HEADER, signature.signature)
                    .header(TIMESTAMP_HEADER, signature.timestamp);
            }
            None => {
                // Unsigned calls are tolerated for older edge functions.
                warn!("sending notification without signature: no shared secret available");
            }
        }

        let response = request.send().await.context("notification send failed")?;
        if !response.status().is_success() {
            let status = response.status();
            let mut body = response.text().await.unwrap_or_default();
            body.truncate(body.char_indices().nth(200).map(|(i, _)| i).unwrap_or(body.len()));
            bail!("notification endpoint returned {status}: {body}");
        }
        Ok(())
    }
}
