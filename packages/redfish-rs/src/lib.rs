//! Typed Redfish resource paths and payloads for out-of-band server
//! management controllers.
//!
//! This crate is transport-free: it knows the resource tree, the request
//! payloads, and the response shapes, while the caller supplies the HTTP
//! session (the executor routes everything through its per-endpoint session
//! manager). Paths target the embedded-controller layout used by the fleet's
//! management firmware.

pub mod models;

pub use models::*;

/// Well-known resource paths on the management controller.
pub mod paths {
    /// The primary computer system resource.
    pub const SYSTEM: &str = "/redfish/v1/Systems/System.Embedded.1";

    /// Reset (power) action on the system resource.
    pub const SYSTEM_RESET: &str =
        "/redfish/v1/Systems/System.Embedded.1/Actions/ComputerSystem.Reset";

    /// BIOS attribute registry for the system.
    pub const BIOS: &str = "/redfish/v1/Systems/System.Embedded.1/Bios";

    /// Pending BIOS settings (applied on next reboot).
    pub const BIOS_SETTINGS: &str = "/redfish/v1/Systems/System.Embedded.1/Bios/Settings";

    /// The management controller itself.
    pub const MANAGER: &str = "/redfish/v1/Managers/iDRAC.Embedded.1";

    /// Management controller network protocol settings.
    pub const MANAGER_NETWORK: &str =
        "/redfish/v1/Managers/iDRAC.Embedded.1/EthernetInterfaces/NIC.1";

    /// Virtual media device for ISO attach (CD slot).
    pub const VIRTUAL_MEDIA_CD: &str =
        "/redfish/v1/Managers/iDRAC.Embedded.1/VirtualMedia/CD";

    /// Insert action on the CD virtual media device.
    pub const VIRTUAL_MEDIA_INSERT: &str =
        "/redfish/v1/Managers/iDRAC.Embedded.1/VirtualMedia/CD/Actions/VirtualMedia.InsertMedia";

    /// Eject action on the CD virtual media device.
    pub const VIRTUAL_MEDIA_EJECT: &str =
        "/redfish/v1/Managers/iDRAC.Embedded.1/VirtualMedia/CD/Actions/VirtualMedia.EjectMedia";

    /// Firmware inventory collection.
    pub const FIRMWARE_INVENTORY: &str = "/redfish/v1/UpdateService/FirmwareInventory";

    /// Multipart firmware upload endpoint.
    pub const MULTIPART_UPLOAD: &str = "/redfish/v1/UpdateService/MultipartUpload";

    /// Controller job queue (firmware/config jobs).
    pub const JOB_QUEUE: &str = "/redfish/v1/Managers/iDRAC.Embedded.1/Jobs";

    /// A single controller job.
    pub fn job(job_id: &str) -> String {
        format!("{JOB_QUEUE}/{job_id}")
    }
}

/// Build the full HTTPS URL for a resource path on a controller address.
pub fn url(address: &str, path: &str) -> String {
    format!("https://{address}{path}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_url_joins_address_and_path() {
        assert_eq!(
            url("10.0.0.5", paths::SYSTEM),
            "https://10.0.0.5/redfish/v1/Systems/System.Embedded.1"
        );
    }

    #[test]
    fn test_job_path() {
        assert_eq!(
            paths::job("JID_123"),
            "/redfish/v1/Managers/iDRAC.Embedded.1/Jobs/JID_123"
        );
    }
}
