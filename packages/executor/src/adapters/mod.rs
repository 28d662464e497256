//! Protocol adapters the workflow handlers drive remote infrastructure
//! through. Each adapter is a trait seam with a production implementation
//! here and a mock in [`crate::testing`].

pub mod redfish;
pub mod ssh;
pub mod vsphere;
pub mod zfs;

pub use redfish::{Device, RedfishApi, RedfishClient};
pub use ssh::{AuditedSsh, CommandOutput, OpenSshRunner, SshAuth, SshRunner, SshTarget};
pub use vsphere::{
    CloneSpec, DatastoreFile, DatastoreSummary, HostSummary, VcenterEndpoint, VsphereApi,
    VsphereRestClient,
};
pub use zfs::ZfsOps;
