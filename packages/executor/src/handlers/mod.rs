//! The workflow handlers, one module per handler family, and the registry
//! that maps every job type to its handler.

pub mod agent_target;
pub mod boot;
pub mod common;
pub mod console;
pub mod datastore;
pub mod esxi;
pub mod failover;
pub mod firmware;
pub mod network;
pub mod power;
pub mod replication;
pub mod sla;
pub mod template;
pub mod virtual_media;
pub mod zfs_target;

use crate::dispatch::HandlerRegistry;

/// Build the full handler registry. Adding a handler means adding a line
/// here; the dispatcher fails jobs of unregistered types.
pub fn build_registry() -> HandlerRegistry {
    let mut registry = HandlerRegistry::new();

    // Power and boot control
    registry.register("power_action", power::power_action);
    registry.register("boot_configuration", boot::boot_configuration);
    registry.register("bios_config_read", boot::bios_config_read);
    registry.register("bios_config_write", boot::bios_config_write);

    // Media and console
    registry.register("virtual_media_mount", virtual_media::virtual_media_mount);
    registry.register("virtual_media_unmount", virtual_media::virtual_media_unmount);
    registry.register("console_launch", console::console_launch);

    // Controller network and firmware
    registry.register("idrac_network_read", network::idrac_network_read);
    registry.register("idrac_network_write", network::idrac_network_write);
    registry.register("firmware_update", firmware::firmware_update);

    // Hypervisor fleet
    registry.register("esxi_preflight_check", esxi::esxi_preflight_check);
    registry.register("esxi_upgrade", esxi::esxi_upgrade);
    registry.register("esxi_then_firmware", esxi::esxi_then_firmware);
    registry.register("firmware_then_esxi", esxi::firmware_then_esxi);
    registry.register("browse_datastore", datastore::browse_datastore);
    registry.register("manage_datastore", datastore::manage_datastore);
    registry.register("scan_datastore_status", datastore::scan_datastore_status);

    // Storage appliance lifecycle
    registry.register("validate_zfs_template", template::validate_zfs_template);
    registry.register("copy_template", template::copy_template);
    registry.register("deploy_zfs_target", zfs_target::deploy_zfs_target);
    registry.register("detect_disks", zfs_target::detect_disks);
    registry.register("test_ssh_connection", zfs_target::test_ssh_connection);
    registry.register("check_zfs_target_health", zfs_target::check_zfs_target_health);
    registry.register("decommission_zfs_target", zfs_target::decommission_zfs_target);
    registry.register("register_agent_target", agent_target::register_agent_target);

    // Replication
    registry.register("run_replication_sync", replication::run_replication_sync);
    registry.register("test_replication_pair", replication::test_replication_pair);
    registry.register("pause_protection_group", replication::pause_protection_group);
    registry.register("resume_protection_group", replication::resume_protection_group);
    registry.register(
        "collect_replication_metrics",
        replication::collect_replication_metrics,
    );
    registry.register("exchange_ssh_keys", replication::exchange_ssh_keys);
    registry.register("sync_protection_config", replication::sync_protection_config);

    // Failover
    registry.register("test_failover", failover::test_failover);
    registry.register("live_failover", failover::live_failover);
    registry.register("commit_failover", failover::commit_failover);
    registry.register("rollback_failover", failover::rollback_failover);

    // Self-scheduling periodics
    registry.register_periodic(
        "scheduled_replication_check",
        sla::SWEEP_INTERVAL,
        sla::scheduled_replication_check,
    );
    registry.register_periodic("rpo_monitoring", sla::MONITOR_INTERVAL, sla::rpo_monitoring);

    registry
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_registry_covers_all_job_types() {
        let registry = build_registry();
        for job_type in [
            "power_action",
            "deploy_zfs_target",
            "run_replication_sync",
            "scheduled_replication_check",
            "rpo_monitoring",
            "esxi_upgrade",
            "live_failover",
        ] {
            assert!(registry.is_registered(job_type), "{job_type} missing");
        }
        assert_eq!(registry.registered_types().len(), 38);
        assert_eq!(registry.periodic_types().len(), 2);
    }
}
