//! Test doubles: an in-memory coordinator and mock protocol adapters.
//!
//! The in-memory coordinator implements the same four row verbs as the
//! REST client, including the filter grammar and return-representation
//! semantics, so claim races, dedup checks, and recovery paths can be
//! exercised without a live coordinator. Mock adapters record every call
//! and let tests script remote behavior per address.

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use chrono::Utc;
use serde_json::{json, Value};
use uuid::Uuid;

use redfish::{
    ComputerSystem, ControllerJob, FirmwareComponent, ManagerNetwork, ResetType, VirtualMedia,
};

use crate::adapters::{
    CloneSpec, CommandOutput, DatastoreFile, DatastoreSummary, Device, HostSummary, RedfishApi,
    SshRunner, SshTarget, VcenterEndpoint, VsphereApi,
};
use crate::audit::CommandAudit;
use crate::config::Config;
use crate::context::ExecutorContext;
use crate::coordinator::{Coordinator, CoordinatorApi, Filter, Job, NewJob, SelectOptions};
use crate::crypto::CredentialKey;
use crate::notify::Notify;
use crate::session::SessionManager;

// =============================================================================
// In-memory coordinator
// =============================================================================

#[derive(Default)]
pub struct InMemoryCoordinator {
    tables: Mutex<HashMap<String, Vec<Value>>>,
}

impl InMemoryCoordinator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a row directly, filling `id`/`created_at` like the real
    /// coordinator's defaults.
    pub fn seed(&self, resource: &str, mut row: Value) -> Value {
        fill_defaults(&mut row);
        let mut tables = self.tables.lock().unwrap();
        tables
            .entry(resource.to_string())
            .or_default()
            .push(row.clone());
        row
    }

    pub fn rows(&self, resource: &str) -> Vec<Value> {
        self.tables
            .lock()
            .unwrap()
            .get(resource)
            .cloned()
            .unwrap_or_default()
    }

    pub fn rows_as<T: serde::de::DeserializeOwned>(&self, resource: &str) -> Vec<T> {
        self.rows(resource)
            .into_iter()
            .filter_map(|row| serde_json::from_value(row).ok())
            .collect()
    }

    pub fn row_by_id(&self, resource: &str, id: Uuid) -> Option<Value> {
        self.rows(resource)
            .into_iter()
            .find(|row| row.get("id").and_then(|v| v.as_str()) == Some(id.to_string().as_str()))
    }

    /// Synchronous single-row patch, for simulating an external mutator
    /// (e.g. an operator cancelling a job) from inside a mock callback.
    pub fn patch_sync(&self, resource: &str, id: Uuid, patch: Value) {
        let mut tables = self.tables.lock().unwrap();
        if let Some(rows) = tables.get_mut(resource) {
            for row in rows.iter_mut() {
                if row.get("id").and_then(|v| v.as_str()) == Some(id.to_string().as_str()) {
                    if let (Some(map), Some(patch_map)) = (row.as_object_mut(), patch.as_object())
                    {
                        for (key, value) in patch_map {
                            map.insert(key.clone(), value.clone());
                        }
                    }
                }
            }
        }
    }
}

fn fill_defaults(row: &mut Value) {
    if let Some(map) = row.as_object_mut() {
        if !map.contains_key("id") {
            map.insert("id".into(), json!(Uuid::new_v4()));
        }
        if !map.contains_key("created_at") {
            map.insert("created_at".into(), json!(Utc::now()));
        }
    }
}

fn order_key(row: &Value, field: &str) -> String {
    match row.get(field) {
        Some(Value::String(s)) => s.clone(),
        Some(other) => other.to_string(),
        None => String::new(),
    }
}

#[async_trait]
impl CoordinatorApi for InMemoryCoordinator {
    async fn select(
        &self,
        resource: &str,
        filters: &[Filter],
        opts: SelectOptions,
    ) -> Result<Vec<Value>> {
        let tables = self.tables.lock().unwrap();
        let mut rows: Vec<Value> = tables
            .get(resource)
            .map(|rows| {
                rows.iter()
                    .filter(|row| filters.iter().all(|f| f.matches(row)))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();

        if let Some(order) = opts.order {
            if let Some((field, direction)) = order.rsplit_once('.') {
                rows.sort_by_key(|row| order_key(row, field));
                if direction == "desc" {
                    rows.reverse();
                }
            }
        }
        if let Some(limit) = opts.limit {
            rows.truncate(limit as usize);
        }
        Ok(rows)
    }

    async fn insert(&self, resource: &str, mut row: Value) -> Result<Value> {
        fill_defaults(&mut row);
        let mut tables = self.tables.lock().unwrap();
        tables
            .entry(resource.to_string())
            .or_default()
            .push(row.clone());
        Ok(row)
    }

    async fn patch(&self, resource: &str, filters: &[Filter], patch: Value) -> Result<Vec<Value>> {
        let patch_map = patch
            .as_object()
            .ok_or_else(|| anyhow!("patch body must be an object"))?;
        let mut tables = self.tables.lock().unwrap();
        let mut changed = Vec::new();
        if let Some(rows) = tables.get_mut(resource) {
            for row in rows.iter_mut() {
                if filters.iter().all(|f| f.matches(row)) {
                    if let Some(map) = row.as_object_mut() {
                        for (key, value) in patch_map {
                            map.insert(key.clone(), value.clone());
                        }
                    }
                    changed.push(row.clone());
                }
            }
        }
        Ok(changed)
    }

    async fn delete(&self, resource: &str, filters: &[Filter]) -> Result<u64> {
        let mut tables = self.tables.lock().unwrap();
        let Some(rows) = tables.get_mut(resource) else {
            return Ok(0);
        };
        let before = rows.len();
        rows.retain(|row| !filters.iter().all(|f| f.matches(row)));
        Ok((before - rows.len()) as u64)
    }
}

// =============================================================================
// Mock out-of-band management
// =============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RedfishCall {
    pub method: String,
    pub address: String,
    pub path: String,
}

#[derive(Default)]
pub struct MockRedfish {
    pub power_states: Mutex<HashMap<String, String>>,
    pub bios: Mutex<HashMap<String, BTreeMap<String, Value>>>,
    pub media: Mutex<HashMap<String, Option<String>>>,
    pub controller_jobs: Mutex<HashMap<String, VecDeque<ControllerJob>>>,
    pub fail_addresses: Mutex<HashSet<String>>,
    pub calls: Mutex<Vec<RedfishCall>>,
}

impl MockRedfish {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_power_state(&self, address: &str, state: &str) {
        self.power_states
            .lock()
            .unwrap()
            .insert(address.to_string(), state.to_string());
    }

    pub fn fail_address(&self, address: &str) {
        self.fail_addresses
            .lock()
            .unwrap()
            .insert(address.to_string());
    }

    /// Queue the states a controller job will report on successive polls.
    pub fn queue_controller_job(&self, job_id: &str, states: Vec<ControllerJob>) {
        self.controller_jobs
            .lock()
            .unwrap()
            .insert(job_id.to_string(), states.into());
    }

    pub fn calls(&self) -> Vec<RedfishCall> {
        self.calls.lock().unwrap().clone()
    }

    fn record(&self, method: &str, device: &Device, path: &str) -> Result<()> {
        self.calls.lock().unwrap().push(RedfishCall {
            method: method.to_string(),
            address: device.address.clone(),
            path: path.to_string(),
        });
        if self.fail_addresses.lock().unwrap().contains(&device.address) {
            bail!("controller {} unreachable", device.address);
        }
        Ok(())
    }
}

#[async_trait]
impl RedfishApi for MockRedfish {
    async fn get_system(&self, device: &Device) -> Result<ComputerSystem> {
        self.record("GET", device, redfish::paths::SYSTEM)?;
        let state = self
            .power_states
            .lock()
            .unwrap()
            .get(&device.address)
            .cloned()
            .unwrap_or_else(|| "Off".to_string());
        Ok(ComputerSystem {
            power_state: Some(state),
            model: Some("MockServer".to_string()),
            serial_number: None,
            bios_version: Some("1.0.0".to_string()),
            host_name: None,
            boot: None,
        })
    }

    async fn reset(&self, device: &Device, reset: ResetType) -> Result<()> {
        self.record("POST", device, redfish::paths::SYSTEM_RESET)?;
        self.set_power_state(&device.address, reset.expected_power_state());
        Ok(())
    }

    async fn set_boot_override(&self, device: &Device, _target: &str) -> Result<()> {
        self.record("PATCH", device, redfish::paths::SYSTEM)?;
        Ok(())
    }

    async fn read_bios_attributes(&self, device: &Device) -> Result<BTreeMap<String, Value>> {
        self.record("GET", device, redfish::paths::BIOS)?;
        Ok(self
            .bios
            .lock()
            .unwrap()
            .get(&device.address)
            .cloned()
            .unwrap_or_default())
    }

    async fn stage_bios_attributes(
        &self,
        device: &Device,
        attributes: BTreeMap<String, Value>,
    ) -> Result<()> {
        self.record("PATCH", device, redfish::paths::BIOS_SETTINGS)?;
        self.bios
            .lock()
            .unwrap()
            .entry(device.address.clone())
            .or_default()
            .extend(attributes);
        Ok(())
    }

    async fn get_virtual_media(&self, device: &Device) -> Result<VirtualMedia> {
        self.record("GET", device, redfish::paths::VIRTUAL_MEDIA_CD)?;
        let image = self
            .media
            .lock()
            .unwrap()
            .get(&device.address)
            .cloned()
            .flatten();
        Ok(VirtualMedia {
            inserted: Some(image.is_some()),
            image,
            connected_via: None,
        })
    }

    async fn insert_virtual_media(&self, device: &Device, image_url: &str) -> Result<()> {
        self.record("POST", device, redfish::paths::VIRTUAL_MEDIA_INSERT)?;
        self.media
            .lock()
            .unwrap()
            .insert(device.address.clone(), Some(image_url.to_string()));
        Ok(())
    }

    async fn eject_virtual_media(&self, device: &Device) -> Result<()> {
        self.record("POST", device, redfish::paths::VIRTUAL_MEDIA_EJECT)?;
        self.media.lock().unwrap().insert(device.address.clone(), None);
        Ok(())
    }

    async fn read_manager_network(&self, device: &Device) -> Result<ManagerNetwork> {
        self.record("GET", device, redfish::paths::MANAGER_NETWORK)?;
        Ok(ManagerNetwork {
            host_name: Some("mock-bmc".to_string()),
            fqdn: None,
            ipv4_addresses: None,
            name_servers: None,
            mac_address: Some("aa:bb:cc:dd:ee:ff".to_string()),
        })
    }

    async fn write_manager_network(
        &self,
        device: &Device,
        _settings: &ManagerNetwork,
    ) -> Result<()> {
        self.record("PATCH", device, redfish::paths::MANAGER_NETWORK)?;
        Ok(())
    }

    async fn firmware_inventory(&self, device: &Device) -> Result<Vec<FirmwareComponent>> {
        self.record("GET", device, redfish::paths::FIRMWARE_INVENTORY)?;
        Ok(vec![FirmwareComponent {
            id: Some("BIOS".to_string()),
            name: Some("BIOS".to_string()),
            version: Some("1.0.0".to_string()),
            updateable: Some(true),
        }])
    }

    async fn upload_firmware(
        &self,
        device: &Device,
        _file_name: &str,
        _bytes: Vec<u8>,
    ) -> Result<String> {
        self.record("POST", device, redfish::paths::MULTIPART_UPLOAD)?;
        Ok("JID_MOCK".to_string())
    }

    async fn controller_job(&self, device: &Device, job_id: &str) -> Result<ControllerJob> {
        self.record("GET", device, &redfish::paths::job(job_id))?;
        let mut jobs = self.controller_jobs.lock().unwrap();
        let queue = jobs.entry(job_id.to_string()).or_default();
        if queue.len() > 1 {
            Ok(queue.pop_front().unwrap())
        } else if let Some(last) = queue.front() {
            Ok(last.clone())
        } else {
            Ok(ControllerJob {
                id: job_id.to_string(),
                state: Some("Completed".to_string()),
                percent_complete: Some(100),
                message: None,
            })
        }
    }
}

// =============================================================================
// Mock hypervisor manager
// =============================================================================

#[derive(Default)]
pub struct MockVsphere {
    pub cloned: Mutex<Vec<CloneSpec>>,
    pub powered_on: Mutex<Vec<String>>,
    pub powered_off: Mutex<Vec<String>>,
    pub deleted: Mutex<Vec<String>>,
    pub registered: Mutex<Vec<String>>,
    pub mounted: Mutex<Vec<(String, String)>>,
    pub unmounted: Mutex<Vec<(String, String)>>,
    pub maintenance: Mutex<HashSet<String>>,
    pub hosts: Mutex<Vec<HostSummary>>,
    /// Polls before the guest agent reports ready.
    pub tools_after: Mutex<u32>,
    /// Polls before an IP is reported, then this address.
    pub ip_after: Mutex<(u32, Option<String>)>,
    pub fail_clone: Mutex<bool>,
    /// Invoked on every IP poll; lets tests inject external mutations
    /// mid-wait (cancellation, inventory changes).
    #[allow(clippy::type_complexity)]
    pub on_ip_poll: Mutex<Option<Box<dyn Fn() + Send + Sync>>>,
}

impl MockVsphere {
    pub fn new() -> Self {
        let mock = Self::default();
        *mock.ip_after.lock().unwrap() = (0, Some("10.0.0.50".to_string()));
        mock.hosts.lock().unwrap().push(HostSummary {
            host_id: "host-1".to_string(),
            name: "esxi-01".to_string(),
            connected: true,
        });
        mock
    }

    pub fn never_report_ip(&self) {
        *self.ip_after.lock().unwrap() = (u32::MAX, None);
    }

    pub fn set_on_ip_poll(&self, hook: impl Fn() + Send + Sync + 'static) {
        *self.on_ip_poll.lock().unwrap() = Some(Box::new(hook));
    }
}

#[async_trait]
impl VsphereApi for MockVsphere {
    async fn clone_template(&self, _vc: &VcenterEndpoint, spec: &CloneSpec) -> Result<String> {
        if *self.fail_clone.lock().unwrap() {
            bail!("clone failed: insufficient resources");
        }
        self.cloned.lock().unwrap().push(spec.clone());
        Ok(format!("vm-{}", self.cloned.lock().unwrap().len()))
    }

    async fn power_on(&self, _vc: &VcenterEndpoint, vm: &str) -> Result<()> {
        self.powered_on.lock().unwrap().push(vm.to_string());
        Ok(())
    }

    async fn power_off(&self, _vc: &VcenterEndpoint, vm: &str) -> Result<()> {
        self.powered_off.lock().unwrap().push(vm.to_string());
        Ok(())
    }

    async fn delete_vm(&self, _vc: &VcenterEndpoint, vm: &str) -> Result<()> {
        self.deleted.lock().unwrap().push(vm.to_string());
        Ok(())
    }

    async fn tools_running(&self, _vc: &VcenterEndpoint, _vm: &str) -> Result<bool> {
        let mut remaining = self.tools_after.lock().unwrap();
        if *remaining == 0 {
            Ok(true)
        } else {
            *remaining -= 1;
            Ok(false)
        }
    }

    async fn guest_ip(&self, _vc: &VcenterEndpoint, _vm: &str) -> Result<Option<String>> {
        if let Some(hook) = self.on_ip_poll.lock().unwrap().as_ref() {
            hook();
        }
        let mut state = self.ip_after.lock().unwrap();
        if state.0 == 0 {
            Ok(state.1.clone())
        } else {
            state.0 = state.0.saturating_sub(1);
            Ok(None)
        }
    }

    async fn list_hosts(&self, _vc: &VcenterEndpoint) -> Result<Vec<HostSummary>> {
        Ok(self.hosts.lock().unwrap().clone())
    }

    async fn mount_nfs_datastore(
        &self,
        _vc: &VcenterEndpoint,
        host_id: &str,
        name: &str,
        _remote_host: &str,
        _remote_path: &str,
    ) -> Result<()> {
        self.mounted
            .lock()
            .unwrap()
            .push((host_id.to_string(), name.to_string()));
        Ok(())
    }

    async fn unmount_datastore(
        &self,
        _vc: &VcenterEndpoint,
        host_id: &str,
        datastore: &str,
    ) -> Result<()> {
        self.unmounted
            .lock()
            .unwrap()
            .push((host_id.to_string(), datastore.to_string()));
        Ok(())
    }

    async fn datastore_summary(
        &self,
        _vc: &VcenterEndpoint,
        name: &str,
    ) -> Result<Option<DatastoreSummary>> {
        Ok(Some(DatastoreSummary {
            name: name.to_string(),
            capacity: 1 << 40,
            free_space: 1 << 39,
            accessible: true,
        }))
    }

    async fn list_datastore_files(
        &self,
        _vc: &VcenterEndpoint,
        _datastore: &str,
        path: &str,
    ) -> Result<Vec<DatastoreFile>> {
        Ok(vec![DatastoreFile {
            path: format!("{path}/disk.vmdk"),
            size: 1024,
        }])
    }

    async fn enter_maintenance(&self, _vc: &VcenterEndpoint, host_id: &str) -> Result<()> {
        self.maintenance.lock().unwrap().insert(host_id.to_string());
        Ok(())
    }

    async fn exit_maintenance(&self, _vc: &VcenterEndpoint, host_id: &str) -> Result<()> {
        self.maintenance.lock().unwrap().remove(host_id);
        Ok(())
    }

    async fn register_vm(
        &self,
        _vc: &VcenterEndpoint,
        _host_id: &str,
        _datastore_path: &str,
        name: &str,
    ) -> Result<String> {
        self.registered.lock().unwrap().push(name.to_string());
        Ok(format!("vm-registered-{name}"))
    }
}

// =============================================================================
// Mock SSH
// =============================================================================

pub struct MockSsh {
    /// `(command prefix, scripted output)`, first match wins.
    pub responses: Mutex<Vec<(String, CommandOutput)>>,
    pub executed: Mutex<Vec<(String, String)>>,
    pub fail_hosts: Mutex<HashSet<String>>,
}

impl Default for MockSsh {
    fn default() -> Self {
        Self::new()
    }
}

impl MockSsh {
    pub fn new() -> Self {
        Self {
            responses: Mutex::new(Vec::new()),
            executed: Mutex::new(Vec::new()),
            fail_hosts: Mutex::new(HashSet::new()),
        }
    }

    pub fn respond(&self, prefix: &str, exit_code: i32, stdout: &str, stderr: &str) {
        self.responses.lock().unwrap().push((
            prefix.to_string(),
            CommandOutput {
                exit_code,
                stdout: stdout.to_string(),
                stderr: stderr.to_string(),
            },
        ));
    }

    pub fn fail_host(&self, host: &str) {
        self.fail_hosts.lock().unwrap().insert(host.to_string());
    }

    pub fn executed(&self) -> Vec<(String, String)> {
        self.executed.lock().unwrap().clone()
    }

    pub fn commands_for(&self, host: &str) -> Vec<String> {
        self.executed()
            .into_iter()
            .filter(|(h, _)| h == host)
            .map(|(_, cmd)| cmd)
            .collect()
    }
}

#[async_trait]
impl SshRunner for MockSsh {
    async fn exec(
        &self,
        target: &SshTarget,
        command: &str,
        _timeout: Duration,
    ) -> Result<CommandOutput> {
        self.executed
            .lock()
            .unwrap()
            .push((target.host.clone(), command.to_string()));
        if self.fail_hosts.lock().unwrap().contains(&target.host) {
            bail!("ssh: connect to host {} port 22: Connection refused", target.host);
        }
        let responses = self.responses.lock().unwrap();
        for (prefix, output) in responses.iter() {
            if command.starts_with(prefix.as_str()) {
                return Ok(output.clone());
            }
        }
        Ok(CommandOutput {
            exit_code: 0,
            stdout: String::new(),
            stderr: String::new(),
        })
    }
}

// =============================================================================
// Spy notifier
// =============================================================================

#[derive(Default)]
pub struct SpyNotifier {
    pub sent: Mutex<Vec<Value>>,
}

impl SpyNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn sent(&self) -> Vec<Value> {
        self.sent.lock().unwrap().clone()
    }
}

#[async_trait]
impl Notify for SpyNotifier {
    async fn send(&self, payload: &Value) -> Result<()> {
        self.sent.lock().unwrap().push(payload.clone());
        Ok(())
    }
}

// =============================================================================
// Test context
// =============================================================================

/// Handles to every mock inside a test context.
pub struct TestHarness {
    pub coordinator: Arc<InMemoryCoordinator>,
    pub redfish: Arc<MockRedfish>,
    pub vsphere: Arc<MockVsphere>,
    pub ssh: Arc<MockSsh>,
    pub notifier: Arc<SpyNotifier>,
}

pub fn test_credential_key() -> CredentialKey {
    CredentialKey::from_base64(&BASE64.encode([0x42u8; 32])).expect("static key is valid")
}

pub fn test_config(worker_id: &str) -> Config {
    Config {
        coordinator_url: "http://coordinator.test".to_string(),
        service_token: "test-token".to_string(),
        api_key: "test-key".to_string(),
        credential_key: BASE64.encode([0x42u8; 32]),
        shared_secret: Some("test-shared-secret".to_string()),
        poll_interval: Duration::from_millis(20),
        worker_pool_size: 4,
        stale_running_timeout: Duration::from_secs(600),
        worker_id: worker_id.to_string(),
        verify_tls: false,
    }
}

/// Build an [`ExecutorContext`] wired entirely to in-memory doubles.
pub fn test_context(worker_id: &str) -> (Arc<ExecutorContext>, TestHarness) {
    let store = Arc::new(InMemoryCoordinator::new());
    let coordinator = Coordinator::new(store.clone() as Arc<dyn CoordinatorApi>);
    let redfish = Arc::new(MockRedfish::new());
    let vsphere = Arc::new(MockVsphere::new());
    let ssh = Arc::new(MockSsh::new());
    let notifier = Arc::new(SpyNotifier::new());

    let ctx = Arc::new(ExecutorContext {
        config: test_config(worker_id),
        audit: CommandAudit::new(coordinator.clone()),
        coordinator,
        sessions: Arc::new(SessionManager::new(false)),
        redfish: redfish.clone() as Arc<dyn RedfishApi>,
        vsphere: vsphere.clone() as Arc<dyn VsphereApi>,
        ssh: ssh.clone() as Arc<dyn SshRunner>,
        credentials: test_credential_key(),
        notifier: notifier.clone() as Arc<dyn Notify>,
    });

    (
        ctx,
        TestHarness {
            coordinator: store,
            redfish,
            vsphere,
            ssh,
            notifier,
        },
    )
}

/// Insert a pending job and return it as claimed-and-running, the state a
/// handler sees when the dispatcher invokes it.
pub async fn seed_running_job(
    ctx: &Arc<ExecutorContext>,
    job_type: &str,
    target_scope: Value,
    details: Value,
) -> Job {
    let job = ctx
        .coordinator
        .insert_job(
            NewJob::pending(job_type)
                .target_scope(target_scope)
                .details(details),
        )
        .await
        .expect("insert job");
    ctx.coordinator
        .try_claim(job.id, ctx.worker_id(), Utc::now())
        .await
        .expect("claim job");
    ctx.coordinator
        .get_job(job.id)
        .await
        .expect("reload job")
        .expect("job exists")
}

/// Encrypt a plaintext with the test credential key.
pub fn encrypt_for_tests(plaintext: &str) -> String {
    test_credential_key()
        .encrypt(plaintext, &[9u8; 12])
        .expect("encrypt")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coordinator::JobStatus;

    #[tokio::test]
    async fn test_in_memory_claim_is_compare_and_set() {
        let store = Arc::new(InMemoryCoordinator::new());
        let coordinator = Coordinator::new(store.clone() as Arc<dyn CoordinatorApi>);
        let job = coordinator
            .insert_job(NewJob::pending("power_action"))
            .await
            .unwrap();

        let first = coordinator
            .try_claim(job.id, "worker-a", Utc::now())
            .await
            .unwrap();
        let second = coordinator
            .try_claim(job.id, "worker-b", Utc::now())
            .await
            .unwrap();

        assert!(first);
        assert!(!second, "second claim must observe zero rows changed");

        let claimed = coordinator.get_job(job.id).await.unwrap().unwrap();
        assert_eq!(claimed.status, JobStatus::Running);
        assert_eq!(claimed.worker_id.as_deref(), Some("worker-a"));
        assert!(claimed.started_at.is_some());
    }

    #[tokio::test]
    async fn test_select_order_and_limit() {
        let store = InMemoryCoordinator::new();
        store.seed("jobs", json!({"job_type": "a", "created_at": "2024-01-02T00:00:00Z"}));
        store.seed("jobs", json!({"job_type": "b", "created_at": "2024-01-01T00:00:00Z"}));
        store.seed("jobs", json!({"job_type": "c", "created_at": "2024-01-03T00:00:00Z"}));

        let rows = store
            .select(
                "jobs",
                &[],
                SelectOptions {
                    order: Some("created_at.asc"),
                    limit: Some(2),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        let types: Vec<&str> = rows
            .iter()
            .map(|r| r.get("job_type").unwrap().as_str().unwrap())
            .collect();
        assert_eq!(types, vec!["b", "a"]);
    }

    #[tokio::test]
    async fn test_delete_counts_rows() {
        let store = InMemoryCoordinator::new();
        store.seed("servers", json!({"name": "a", "zone": "1"}));
        store.seed("servers", json!({"name": "b", "zone": "1"}));
        store.seed("servers", json!({"name": "c", "zone": "2"}));

        let removed = store
            .delete("servers", &[Filter::eq("zone", "1")])
            .await
            .unwrap();
        assert_eq!(removed, 2);
        assert_eq!(store.rows("servers").len(), 1);
    }
}
