//! Hypervisor manager adapter.
//!
//! Talks to the vCenter automation REST surface for the operations the
//! handlers need: template cloning, VM power and guest state, datastore
//! management across hosts, and host maintenance mode. Session tokens are
//! cached per manager and refreshed once on a 401.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use reqwest::Method;
use serde_json::{json, Value};
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::audit::{AuditCall, CommandAudit};
use crate::session::{RemoteRequest, RemoteResponse, RequestBody, SessionManager};

/// One hypervisor manager endpoint.
#[derive(Debug, Clone)]
pub struct VcenterEndpoint {
    pub id: Option<Uuid>,
    pub host: String,
    pub username: String,
    pub password: String,
    pub job_id: Option<Uuid>,
}

/// What to clone and where to put it.
#[derive(Debug, Clone, Default)]
pub struct CloneSpec {
    pub source: String,
    pub name: String,
    pub cluster: Option<String>,
    pub datastore: Option<String>,
    pub network: Option<String>,
    pub cpu_count: Option<u64>,
    pub memory_gb: Option<u64>,
    /// Extra data disk attached after the clone, in GiB.
    pub data_disk_gb: Option<u64>,
}

#[derive(Debug, Clone)]
pub struct HostSummary {
    pub host_id: String,
    pub name: String,
    pub connected: bool,
}

#[derive(Debug, Clone)]
pub struct DatastoreSummary {
    pub name: String,
    pub capacity: u64,
    pub free_space: u64,
    pub accessible: bool,
}

#[derive(Debug, Clone)]
pub struct DatastoreFile {
    pub path: String,
    pub size: u64,
}

#[async_trait]
pub trait VsphereApi: Send + Sync {
    /// Clone a template; returns the new VM identifier.
    async fn clone_template(&self, vc: &VcenterEndpoint, spec: &CloneSpec) -> Result<String>;
    async fn power_on(&self, vc: &VcenterEndpoint, vm: &str) -> Result<()>;
    async fn power_off(&self, vc: &VcenterEndpoint, vm: &str) -> Result<()>;
    async fn delete_vm(&self, vc: &VcenterEndpoint, vm: &str) -> Result<()>;
    async fn tools_running(&self, vc: &VcenterEndpoint, vm: &str) -> Result<bool>;
    async fn guest_ip(&self, vc: &VcenterEndpoint, vm: &str) -> Result<Option<String>>;
    async fn list_hosts(&self, vc: &VcenterEndpoint) -> Result<Vec<HostSummary>>;
    async fn mount_nfs_datastore(
        &self,
        vc: &VcenterEndpoint,
        host_id: &str,
        name: &str,
        remote_host: &str,
        remote_path: &str,
    ) -> Result<()>;
    async fn unmount_datastore(
        &self,
        vc: &VcenterEndpoint,
        host_id: &str,
        datastore: &str,
    ) -> Result<()>;
    async fn datastore_summary(
        &self,
        vc: &VcenterEndpoint,
        name: &str,
    ) -> Result<Option<DatastoreSummary>>;
    async fn list_datastore_files(
        &self,
        vc: &VcenterEndpoint,
        datastore: &str,
        path: &str,
    ) -> Result<Vec<DatastoreFile>>;
    async fn enter_maintenance(&self, vc: &VcenterEndpoint, host_id: &str) -> Result<()>;
    async fn exit_maintenance(&self, vc: &VcenterEndpoint, host_id: &str) -> Result<()>;
    /// Register a VM from files already on a datastore (failover path).
    async fn register_vm(
        &self,
        vc: &VcenterEndpoint,
        host_id: &str,
        datastore_path: &str,
        name: &str,
    ) -> Result<String>;
}

pub struct VsphereRestClient {
    sessions: Arc<SessionManager>,
    audit: CommandAudit,
    tokens: Mutex<HashMap<String, String>>,
}

impl VsphereRestClient {
    pub fn new(sessions: Arc<SessionManager>, audit: CommandAudit) -> Self {
        Self {
            sessions,
            audit,
            tokens: Mutex::new(HashMap::new()),
        }
    }

    async fn login(&self, vc: &VcenterEndpoint) -> Result<String> {
        let response = self
            .sessions
            .request(
                RemoteRequest::post(&vc.host, format!("https://{}/api/session", vc.host))
                    .basic_auth(&vc.username, &vc.password),
            )
            .await?;
        if !response.is_success() {
            bail!(
                "vCenter {} login failed: {}",
                vc.host,
                response.status
            );
        }
        // The session endpoint returns the token as a bare JSON string.
        let token: String = response.json().context("unexpected session token shape")?;
        self.tokens
            .lock()
            .await
            .insert(vc.host.clone(), token.clone());
        Ok(token)
    }

    async fn token(&self, vc: &VcenterEndpoint) -> Result<String> {
        if let Some(token) = self.tokens.lock().await.get(&vc.host) {
            return Ok(token.clone());
        }
        self.login(vc).await
    }

    /// One authenticated call; re-authenticates once on 401.
    async fn call(
        &self,
        vc: &VcenterEndpoint,
        method: Method,
        path: &str,
        body: Option<Value>,
    ) -> Result<RemoteResponse> {
        let mut token = self.token(vc).await?;
        for attempt in 0..2 {
            let url = format!("https://{}{}", vc.host, path);
            // The manager authenticates with its own session header.
            let mut request = RemoteRequest::new(method.clone(), &vc.host, url)
                .header("vmware-api-session-id", token.clone());
            if let Some(value) = &body {
                request = request.json(value.clone());
            }

            let mut audit = AuditCall::new(method.as_str(), path);
            audit.job_id = vc.job_id;
            if let Some(value) = &body {
                audit = audit.request_body(value.to_string());
            }

            match self.sessions.request(request).await {
                Ok(response) => {
                    audit = audit
                        .outcome(response.status, response.elapsed_ms)
                        .response_body(response.body.clone());
                    self.audit.record(audit).await;
                    if response.status == 401 && attempt == 0 {
                        token = self.login(vc).await?;
                        continue;
                    }
                    if !response.is_success() {
                        bail!(
                            "vCenter {} returned {} for {}: {}",
                            vc.host,
                            response.status,
                            path,
                            excerpt(&response.body)
                        );
                    }
                    return Ok(response);
                }
                Err(err) => {
                    self.audit.record(audit.failed(err.to_string())).await;
                    return Err(err);
                }
            }
        }
        unreachable!("second attempt either returned or bailed");
    }
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
impl VsphereApi for VsphereRestClient {
    async fn clone_template(&self, vc: &VcenterEndpoint, spec: &CloneSpec) -> Result<String> {
        let mut body = json!({
            "source": spec.source,
            "name": spec.name,
            "power_on": false,
        });
        let mut placement = serde_json::Map::new();
        if let Some(cluster) = &spec.cluster {
            placement.insert("cluster".into(), json!(cluster));
        }
        if let Some(datastore) = &spec.datastore {
            placement.insert("datastore".into(), json!(datastore));
        }
        if !placement.is_empty() {
            body["placement"] = Value::Object(placement);
        }
        let mut hardware = serde_json::Map::new();
        if let Some(cpu) = spec.cpu_count {
            hardware.insert("cpu_update".into(), json!({"num_cpus": cpu}));
        }
        if let Some(memory_gb) = spec.memory_gb {
            hardware.insert(
                "memory_update".into(),
                json!({"memory": memory_gb * 1024}),
            );
        }
        if let Some(disk_gb) = spec.data_disk_gb {
            hardware.insert(
                "disks_to_update".into(),
                json!([{ "capacity": disk_gb * 1024 * 1024 * 1024 }]),
            );
        }
        if !hardware.is_empty() {
            body["hardware_customization"] = Value::Object(hardware);
        }
        if let Some(network) = &spec.network {
            body["guest_customization_spec"] = json!({ "network": network });
        }

        let response = self
            .call(vc, Method::POST, "/api/vcenter/vm?action=clone", Some(body))
            .await?;
        let vm: String = response.json().context("clone returned no VM id")?;
        Ok(vm)
    }

    async fn power_on(&self, vc: &VcenterEndpoint, vm: &str) -> Result<()> {
        self.call(
            vc,
            Method::POST,
            &format!("/api/vcenter/vm/{vm}/power?action=start"),
            None,
        )
        .await?;
        Ok(())
    }

    async fn power_off(&self, vc: &VcenterEndpoint, vm: &str) -> Result<()> {
        self.call(
            vc,
            Method::POST,
            &format!("/api/vcenter/vm/{vm}/power?action=stop"),
            None,
        )
        .await?;
        Ok(())
    }

    async fn delete_vm(&self, vc: &VcenterEndpoint, vm: &str) -> Result<()> {
        self.call(vc, Method::DELETE, &format!("/api/vcenter/vm/{vm}"), None)
            .await?;
        Ok(())
    }

    async fn tools_running(&self, vc: &VcenterEndpoint, vm: &str) -> Result<bool> {
        let response = self
            .call(vc, Method::GET, &format!("/api/vcenter/vm/{vm}/tools"), None)
            .await?;
        let value: Value = response.json()?;
        Ok(value.get("run_state").and_then(|v| v.as_str()) == Some("RUNNING"))
    }

    async fn guest_ip(&self, vc: &VcenterEndpoint, vm: &str) -> Result<Option<String>> {
        let response = self
            .call(
                vc,
                Method::GET,
                &format!("/api/vcenter/vm/{vm}/guest/identity"),
                None,
            )
            .await?;
        let value: Value = response.json()?;
        Ok(value
            .get("ip_address")
            .and_then(|v| v.as_str())
            .filter(|ip| !ip.is_empty())
            .map(String::from))
    }

    async fn list_hosts(&self, vc: &VcenterEndpoint) -> Result<Vec<HostSummary>> {
        let response = self.call(vc, Method::GET, "/api/vcenter/host", None).await?;
        let rows: Vec<Value> = response.json()?;
        Ok(rows
            .into_iter()
            .filter_map(|row| {
                Some(HostSummary {
                    host_id: row.get("host")?.as_str()?.to_string(),
                    name: row
                        .get("name")
                        .and_then(|v| v.as_str())
                        .unwrap_or_default()
                        .to_string(),
                    connected: row.get("connection_state").and_then(|v| v.as_str())
                        == Some("CONNECTED"),
                })
            })
            .collect())
    }

    async fn mount_nfs_datastore(
        &self,
        vc: &VcenterEndpoint,
        host_id: &str,
        name: &str,
        remote_host: &str,
        remote_path: &str,
    ) -> Result<()> {
        self.call(
            vc,
            Method::POST,
            &format!("/api/vcenter/host/{host_id}/datastore"),
            Some(json!({
                "type": "NFS",
                "name": name,
                "nfs": { "remote_host": remote_host, "remote_path": remote_path },
            })),
        )
        .await?;
        Ok(())
    }

    async fn unmount_datastore(
        &self,
        vc: &VcenterEndpoint,
        host_id: &str,
        datastore: &str,
    ) -> Result<()> {
        self.call(
            vc,
            Method::DELETE,
            &format!("/api/vcenter/host/{host_id}/datastore/{datastore}"),
            None,
        )
        .await?;
        Ok(())
    }

    async fn datastore_summary(
        &self,
        vc: &VcenterEndpoint,
        name: &str,
    ) -> Result<Option<DatastoreSummary>> {
        let response = self
            .call(
                vc,
                Method::GET,
                &format!("/api/vcenter/datastore?names={name}"),
                None,
            )
            .await?;
        let rows: Vec<Value> = response.json()?;
        Ok(rows.into_iter().next().map(|row| DatastoreSummary {
            name: row
                .get("name")
                .and_then(|v| v.as_str())
                .unwrap_or(name)
                .to_string(),
            capacity: row.get("capacity").and_then(|v| v.as_u64()).unwrap_or(0),
            free_space: row.get("free_space").and_then(|v| v.as_u64()).unwrap_or(0),
            accessible: row
                .get("accessible")
                .and_then(|v| v.as_bool())
                .unwrap_or(false),
        }))
    }

    async fn list_datastore_files(
        &self,
        vc: &VcenterEndpoint,
        datastore: &str,
        path: &str,
    ) -> Result<Vec<DatastoreFile>> {
        let response = self
            .call(
                vc,
                Method::GET,
                &format!("/api/vcenter/datastore/{datastore}/files?path={path}"),
                None,
            )
            .await?;
        let rows: Vec<Value> = response.json()?;
        Ok(rows
            .into_iter()
            .filter_map(|row| {
                Some(DatastoreFile {
                    path: row.get("path")?.as_str()?.to_string(),
                    size: row.get("size").and_then(|v| v.as_u64()).unwrap_or(0),
                })
            })
            .collect())
    }

    async fn enter_maintenance(&self, vc: &VcenterEndpoint, host_id: &str) -> Result<()> {
        self.call(
            vc,
            Method::POST,
            &format!("/api/vcenter/host/{host_id}?action=enter_maintenance"),
            None,
        )
        .await?;
        Ok(())
    }

    async fn exit_maintenance(&self, vc: &VcenterEndpoint, host_id: &str) -> Result<()> {
        self.call(
            vc,
            Method::POST,
            &format!("/api/vcenter/host/{host_id}?action=exit_maintenance"),
            None,
        )
        .await?;
        Ok(())
    }

    async fn register_vm(
        &self,
        vc: &VcenterEndpoint,
        host_id: &str,
        datastore_path: &str,
        name: &str,
    ) -> Result<String> {
        let response = self
            .call(
                vc,
                Method::POST,
                "/api/vcenter/vm?action=register",
                Some(json!({
                    "datastore_path": datastore_path,
                    "name": name,
                    "placement": { "host": host_id },
                })),
            )
            .await?;
        let vm: String = response.json().context("register returned no VM id")?;
        Ok(vm)
    }
}
