//! Request payloads and response models for the management controller API.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Reset types accepted by the `ComputerSystem.Reset` action.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ResetType {
    On,
    ForceOff,
    GracefulShutdown,
    GracefulRestart,
    ForceRestart,
    PowerCycle,
    Nmi,
}

impl ResetType {
    /// Parse the operator-facing action string.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "On" => Some(Self::On),
            "ForceOff" => Some(Self::ForceOff),
            "GracefulShutdown" => Some(Self::GracefulShutdown),
            "GracefulRestart" => Some(Self::GracefulRestart),
            "ForceRestart" => Some(Self::ForceRestart),
            "PowerCycle" => Some(Self::PowerCycle),
            "Nmi" => Some(Self::Nmi),
            _ => None,
        }
    }

    /// The power state the system settles into after the action completes.
    pub fn expected_power_state(&self) -> &'static str {
        match self {
            Self::On | Self::ForceRestart | Self::GracefulRestart | Self::PowerCycle => "On",
            Self::ForceOff | Self::GracefulShutdown => "Off",
            Self::Nmi => "On",
        }
    }
}

/// Body for the `ComputerSystem.Reset` action.
#[derive(Debug, Clone, Serialize)]
pub struct ResetRequest {
    #[serde(rename = "ResetType")]
    pub reset_type: ResetType,
}

/// The subset of the computer system resource the executor reads.
#[derive(Debug, Clone, Deserialize)]
pub struct ComputerSystem {
    #[serde(rename = "PowerState")]
    pub power_state: Option<String>,
    #[serde(rename = "Model")]
    pub model: Option<String>,
    #[serde(rename = "SerialNumber")]
    pub serial_number: Option<String>,
    #[serde(rename = "BiosVersion")]
    pub bios_version: Option<String>,
    #[serde(rename = "HostName")]
    pub host_name: Option<String>,
    #[serde(rename = "Boot")]
    pub boot: Option<BootSettings>,
}

/// Boot override state on the system resource.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BootSettings {
    #[serde(rename = "BootSourceOverrideTarget", skip_serializing_if = "Option::is_none")]
    pub override_target: Option<String>,
    #[serde(rename = "BootSourceOverrideEnabled", skip_serializing_if = "Option::is_none")]
    pub override_enabled: Option<String>,
    #[serde(rename = "BootSourceOverrideMode", skip_serializing_if = "Option::is_none")]
    pub override_mode: Option<String>,
}

/// PATCH body that stages a one-time boot override.
#[derive(Debug, Clone, Serialize)]
pub struct BootOverrideRequest {
    #[serde(rename = "Boot")]
    pub boot: BootSettings,
}

impl BootOverrideRequest {
    /// One-time boot from the given target (`Pxe`, `Cd`, `Hdd`, ...).
    pub fn once(target: &str) -> Self {
        Self {
            boot: BootSettings {
                override_target: Some(target.to_string()),
                override_enabled: Some("Once".to_string()),
                override_mode: None,
            },
        }
    }
}

/// BIOS resource: attribute name → value.
#[derive(Debug, Clone, Deserialize)]
pub struct BiosResource {
    #[serde(rename = "Attributes", default)]
    pub attributes: BTreeMap<String, Value>,
}

/// PATCH body staging BIOS attribute changes.
#[derive(Debug, Clone, Serialize)]
pub struct BiosSettingsRequest {
    #[serde(rename = "Attributes")]
    pub attributes: BTreeMap<String, Value>,
}

/// Body for `VirtualMedia.InsertMedia`.
#[derive(Debug, Clone, Serialize)]
pub struct InsertMediaRequest {
    #[serde(rename = "Image")]
    pub image: String,
    #[serde(rename = "Inserted")]
    pub inserted: bool,
    #[serde(rename = "WriteProtected")]
    pub write_protected: bool,
}

impl InsertMediaRequest {
    pub fn iso(image_url: &str) -> Self {
        Self {
            image: image_url.to_string(),
            inserted: true,
            write_protected: true,
        }
    }
}

/// Virtual media device state.
#[derive(Debug, Clone, Deserialize)]
pub struct VirtualMedia {
    #[serde(rename = "Inserted")]
    pub inserted: Option<bool>,
    #[serde(rename = "Image")]
    pub image: Option<String>,
    #[serde(rename = "ConnectedVia")]
    pub connected_via: Option<String>,
}

/// Management NIC settings (read and write share this shape).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ManagerNetwork {
    #[serde(rename = "HostName", skip_serializing_if = "Option::is_none")]
    pub host_name: Option<String>,
    #[serde(rename = "FQDN", skip_serializing_if = "Option::is_none")]
    pub fqdn: Option<String>,
    #[serde(rename = "IPv4Addresses", skip_serializing_if = "Option::is_none")]
    pub ipv4_addresses: Option<Vec<Ipv4Address>>,
    #[serde(rename = "NameServers", skip_serializing_if = "Option::is_none")]
    pub name_servers: Option<Vec<String>>,
    #[serde(rename = "MACAddress", skip_serializing_if = "Option::is_none")]
    pub mac_address: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Ipv4Address {
    #[serde(rename = "Address", skip_serializing_if = "Option::is_none")]
    pub address: Option<String>,
    #[serde(rename = "SubnetMask", skip_serializing_if = "Option::is_none")]
    pub subnet_mask: Option<String>,
    #[serde(rename = "Gateway", skip_serializing_if = "Option::is_none")]
    pub gateway: Option<String>,
}

/// One entry in the firmware inventory collection.
#[derive(Debug, Clone, Deserialize)]
pub struct FirmwareComponent {
    #[serde(rename = "Id")]
    pub id: Option<String>,
    #[serde(rename = "Name")]
    pub name: Option<String>,
    #[serde(rename = "Version")]
    pub version: Option<String>,
    #[serde(rename = "Updateable")]
    pub updateable: Option<bool>,
}

/// A job on the controller job queue (firmware apply, config apply).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ControllerJob {
    #[serde(rename = "Id")]
    pub id: String,
    #[serde(rename = "JobState")]
    pub state: Option<String>,
    #[serde(rename = "PercentComplete")]
    pub percent_complete: Option<u8>,
    #[serde(rename = "Message")]
    pub message: Option<String>,
}

impl ControllerJob {
    /// Terminal job states on the controller queue.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self.state.as_deref(),
            Some("Completed") | Some("Failed") | Some("CompletedWithErrors")
        )
    }

    pub fn is_success(&self) -> bool {
        matches!(self.state.as_deref(), Some("Completed"))
    }
}
