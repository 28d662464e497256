//! Out-of-band management adapter.
//!
//! Wraps the controller's Redfish-style resource tree behind a trait seam.
//! All traffic runs through the per-endpoint session manager, every call is
//! audited, and a modern-TLS handshake failure against old controller
//! firmware triggers a one-time fallback to the legacy-TLS session variant
//! for that address (remembered for the process lifetime).

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Result};
use async_trait::async_trait;
use reqwest::Method;
use serde_json::Value;
use tokio::sync::Mutex;
use uuid::Uuid;

use redfish::{
    paths, BiosResource, BiosSettingsRequest, BootOverrideRequest, ComputerSystem, ControllerJob,
    FirmwareComponent, InsertMediaRequest, ManagerNetwork, ResetRequest, ResetType, VirtualMedia,
};

use crate::audit::{AuditCall, CommandAudit};
use crate::session::{RemoteRequest, RemoteResponse, RequestBody, SessionManager};

/// One controller endpoint plus the audit context for calls against it.
#[derive(Debug, Clone)]
pub struct Device {
    pub address: String,
    pub username: String,
    pub password: String,
    pub server_id: Option<Uuid>,
    pub job_id: Option<Uuid>,
    /// Force the legacy-TLS variant without waiting for a handshake failure.
    pub legacy_tls: bool,
}

#[async_trait]
pub trait RedfishApi: Send + Sync {
    async fn get_system(&self, device: &Device) -> Result<ComputerSystem>;
    async fn reset(&self, device: &Device, reset: ResetType) -> Result<()>;
    async fn set_boot_override(&self, device: &Device, target: &str) -> Result<()>;
    async fn read_bios_attributes(&self, device: &Device) -> Result<BTreeMap<String, Value>>;
    async fn stage_bios_attributes(
        &self,
        device: &Device,
        attributes: BTreeMap<String, Value>,
    ) -> Result<()>;
    async fn get_virtual_media(&self, device: &Device) -> Result<VirtualMedia>;
    async fn insert_virtual_media(&self, device: &Device, image_url: &str) -> Result<()>;
    async fn eject_virtual_media(&self, device: &Device) -> Result<()>;
    async fn read_manager_network(&self, device: &Device) -> Result<ManagerNetwork>;
    async fn write_manager_network(
        &self,
        device: &Device,
        settings: &ManagerNetwork,
    ) -> Result<()>;
    async fn firmware_inventory(&self, device: &Device) -> Result<Vec<FirmwareComponent>>;
    /// Upload a firmware package; returns the controller job id tracking it.
    async fn upload_firmware(
        &self,
        device: &Device,
        file_name: &str,
        bytes: Vec<u8>,
    ) -> Result<String>;
    async fn controller_job(&self, device: &Device, job_id: &str) -> Result<ControllerJob>;
}

pub struct RedfishClient {
    sessions: Arc<SessionManager>,
    audit: CommandAudit,
    /// Addresses that already failed a modern handshake once.
    legacy_addresses: Mutex<HashSet<String>>,
}

impl RedfishClient {
    pub fn new(sessions: Arc<SessionManager>, audit: CommandAudit) -> Self {
        Self {
            sessions,
            audit,
            legacy_addresses: Mutex::new(HashSet::new()),
        }
    }

    fn build(device: &Device, method: Method, path: &str, legacy: bool) -> RemoteRequest {
        RemoteRequest::new(method, &device.address, redfish::url(&device.address, path))
            .basic_auth(&device.username, &device.password)
            .legacy_tls(legacy)
    }

    async fn wants_legacy(&self, device: &Device) -> bool {
        device.legacy_tls || self.legacy_addresses.lock().await.contains(&device.address)
    }

    /// Issue one call, falling back to legacy TLS on a fresh handshake
    /// failure. Each attempt is audited individually.
    async fn call(
        &self,
        device: &Device,
        method: Method,
        path: &str,
        body: RequestBody,
        timeout: Option<Duration>,
    ) -> Result<RemoteResponse> {
        let legacy = self.wants_legacy(device).await;
        match self
            .attempt(device, method.clone(), path, body.clone(), timeout, legacy)
            .await
        {
            Ok(response) => Ok(response),
            Err(err) if !legacy && is_tls_failure(&err) => {
                self.legacy_addresses
                    .lock()
                    .await
                    .insert(device.address.clone());
                self.attempt(device, method, path, body, timeout, true).await
            }
            Err(err) => Err(err),
        }
    }

    async fn attempt(
        &self,
        device: &Device,
        method: Method,
        path: &str,
        body: RequestBody,
        timeout: Option<Duration>,
        legacy: bool,
    ) -> Result<RemoteResponse> {
        let mut request = Self::build(device, method.clone(), path, legacy);
        let request_body = match &body {
            RequestBody::Json(v) => Some(v.to_string()),
            _ => None,
        };
        request.body = body;
        if let Some(timeout) = timeout {
            request = request.timeout(timeout);
        }

        let mut audit = AuditCall::new(method.as_str(), path).server(device.server_id);
        audit.job_id = device.job_id;
        if let Some(body) = request_body {
            audit = audit.request_body(body);
        }

        match self.sessions.request(request).await {
            Ok(response) => {
                audit = audit
                    .outcome(response.status, response.elapsed_ms)
                    .response_body(response.body.clone());
                self.audit.record(audit).await;
                Ok(response)
            }
            Err(err) => {
                self.audit.record(audit.failed(err.to_string())).await;
                Err(err)
            }
        }
    }

    async fn call_ok(
        &self,
        device: &Device,
        method: Method,
        path: &str,
        body: RequestBody,
        timeout: Option<Duration>,
    ) -> Result<RemoteResponse> {
        let response = self.call(device, method, path, body, timeout).await?;
        if !response.is_success() {
            bail!(
                "controller returned {} for {}: {}",
                response.status,
                path,
                excerpt(&response.body)
            );
        }
        Ok(response)
    }
}

fn is_tls_failure(err: &anyhow::Error) -> bool {
    let text = format!("{err:#}").to_lowercase();
    text.contains("handshake") || text.contains("tls") || text.contains("ssl")
}

fn excerpt(body: &str) -> &str {
    let end = body
        .char_indices()
        .nth(200)
        .map(|(i, _)| i)
        .unwrap_or(body.len());
    &body[..end]
}

#[async_trait]
impl RedfishApi for RedfishClient {
    async fn get_system(&self, device: &Device) -> Result<ComputerSystem> {
        self.call_ok(device, Method::GET, paths::SYSTEM, RequestBody::None, None)
            .await?
            .json()
    }

    async fn reset(&self, device: &Device, reset: ResetType) -> Result<()> {
        let body = serde_json::to_value(ResetRequest { reset_type: reset })?;
        self.call_ok(
            device,
            Method::POST,
            paths::SYSTEM_RESET,
            RequestBody::Json(body),
            None,
        )
        .await?;
        Ok(())
    }

    async fn set_boot_override(&self, device: &Device, target: &str) -> Result<()> {
        let body = serde_json::to_value(BootOverrideRequest::once(target))?;
        self.call_ok(
            device,
            Method::PATCH,
            paths::SYSTEM,
            RequestBody::Json(body),
            None,
        )
        .await?;
        Ok(())
    }

    async fn read_bios_attributes(&self, device: &Device) -> Result<BTreeMap<String, Value>> {
        let resource: BiosResource = self
            .call_ok(device, Method::GET, paths::BIOS, RequestBody::None, None)
            .await?
            .json()?;
        Ok(resource.attributes)
    }

    async fn stage_bios_attributes(
        &self,
        device: &Device,
        attributes: BTreeMap<String, Value>,
    ) -> Result<()> {
        let body = serde_json::to_value(BiosSettingsRequest { attributes })?;
        self.call_ok(
            device,
            Method::PATCH,
            paths::BIOS_SETTINGS,
            RequestBody::Json(body),
            None,
        )
        .await?;
        Ok(())
    }

    async fn get_virtual_media(&self, device: &Device) -> Result<VirtualMedia> {
        self.call_ok(
            device,
            Method::GET,
            paths::VIRTUAL_MEDIA_CD,
            RequestBody::None,
            None,
        )
        .await?
        .json()
    }

    async fn insert_virtual_media(&self, device: &Device, image_url: &str) -> Result<()> {
        let body = serde_json::to_value(InsertMediaRequest::iso(image_url))?;
        self.call_ok(
            device,
            Method::POST,
            paths::VIRTUAL_MEDIA_INSERT,
            RequestBody::Json(body),
            None,
        )
        .await?;
        Ok(())
    }

    async fn eject_virtual_media(&self, device: &Device) -> Result<()> {
        self.call_ok(
            device,
            Method::POST,
            paths::VIRTUAL_MEDIA_EJECT,
            RequestBody::Json(serde_json::json!({})),
            None,
        )
        .await?;
        Ok(())
    }

    async fn read_manager_network(&self, device: &Device) -> Result<ManagerNetwork> {
        self.call_ok(
            device,
            Method::GET,
            paths::MANAGER_NETWORK,
            RequestBody::None,
            None,
        )
        .await?
        .json()
    }

    async fn write_manager_network(
        &self,
        device: &Device,
        settings: &ManagerNetwork,
    ) -> Result<()> {
        self.call_ok(
            device,
            Method::PATCH,
            paths::MANAGER_NETWORK,
            RequestBody::Json(serde_json::to_value(settings)?),
            None,
        )
        .await?;
        Ok(())
    }

    async fn firmware_inventory(&self, device: &Device) -> Result<Vec<FirmwareComponent>> {
        #[derive(serde::Deserialize)]
        struct Collection {
            #[serde(rename = "Members", default)]
            members: Vec<FirmwareComponent>,
        }
        let collection: Collection = self
            .call_ok(
                device,
                Method::GET,
                paths::FIRMWARE_INVENTORY,
                RequestBody::None,
                None,
            )
            .await?
            .json()?;
        Ok(collection.members)
    }

    async fn upload_firmware(
        &self,
        device: &Device,
        file_name: &str,
        bytes: Vec<u8>,
    ) -> Result<String> {
        let response = self
            .call_ok(
                device,
                Method::POST,
                paths::MULTIPART_UPLOAD,
                RequestBody::Multipart {
                    field: "UpdateFile".to_string(),
                    file_name: file_name.to_string(),
                    bytes,
                },
                Some(Duration::from_secs(600)),
            )
            .await?;

        // The controller answers with the queued job in the Location header.
        match response.location.as_deref().and_then(job_id_from_location) {
            Some(job_id) => Ok(job_id),
            None => bail!("firmware upload accepted but no job id returned"),
        }
    }

    async fn controller_job(&self, device: &Device, job_id: &str) -> Result<ControllerJob> {
        self.call_ok(
            device,
            Method::GET,
            &paths::job(job_id),
            RequestBody::None,
            None,
        )
        .await?
        .json()
    }
}

fn job_id_from_location(location: &str) -> Option<String> {
    location
        .trim_end_matches('/')
        .rsplit('/')
        .next()
        .filter(|id| !id.is_empty())
        .map(String::from)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_job_id_from_location() {
        assert_eq!(
            job_id_from_location("/redfish/v1/Managers/iDRAC.Embedded.1/Jobs/JID_42"),
            Some("JID_42".to_string())
        );
        assert_eq!(job_id_from_location(""), None);
    }

    #[test]
    fn test_tls_failure_detection() {
        assert!(is_tls_failure(&anyhow::anyhow!(
            "remote request failed: error trying to connect: TLS handshake eof"
        )));
        assert!(!is_tls_failure(&anyhow::anyhow!("connection refused")));
    }
}
