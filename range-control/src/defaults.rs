use std::time::Duration;

pub const RANGE_CONTROL_VERSION: &str = env!("CARGO_PKG_VERSION");

// Paths
pub const CYBER_RANGE_DIR: &str = "/var/lib/cyris/cyber_range";
pub const LOG_DIR: &str = "/var/log/cyris";
pub const LOG_FILENAME: &str = "cyris.log";
pub const RANGES_METADATA_FILENAME: &str = "ranges_metadata.json";

// Per-range on-disk layout
pub const CREATION_LOG_FILENAME: &str = "creation.log";
pub const DETAILED_LOG_FILENAME: &str = "detailed.log";
pub const STATUS_FILENAME: &str = "status";
pub const DISKS_DIR_NAME: &str = "disks";

// Hypervisor connection URIs, selected by `--network-mode`
pub const LIBVIRT_SYSTEM_URI: &str = "qemu:///system";
pub const LIBVIRT_SESSION_URI: &str = "qemu:///session";

// All realized resources carry this prefix so teardown can match by name
// even after orchestrator state is lost.
pub const RESOURCE_NAME_PREFIX: &str = "cyris";

pub const DEFAULT_GUEST_INTERFACE: &str = "eth0";

// Network name -> CIDR defaults; overridable from the settings file.
pub const NETWORK_CIDR_DEFAULTS: [(&str, &str); 4] = [
    ("office", "192.168.100.0/24"),
    ("servers", "192.168.200.0/24"),
    ("dmz", "192.168.50.0/24"),
    ("management", "192.168.122.0/24"),
];
pub const NETWORK_CIDR_FALLBACK: &str = "192.168.150.0/24";
pub const MANAGEMENT_NETWORK_CIDR: &str = "192.168.122.0/24";

// Concurrency knobs
pub const DEFAULT_MAX_WORKERS: usize = 8;
pub const DEFAULT_BUILD_PERMITS: usize = 2;

// Timeouts
pub const DEFAULT_COMMAND_TIMEOUT: Duration = Duration::from_secs(300);
pub const IMAGE_BUILD_TIMEOUT: Duration = Duration::from_secs(600);
pub const IMAGE_CUSTOMIZE_TIMEOUT: Duration = Duration::from_secs(120);
pub const IMAGE_DISTRIBUTE_TIMEOUT: Duration = Duration::from_secs(300);
pub const DOMAIN_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(30);
pub const IP_DISCOVERY_TIMEOUT: Duration = Duration::from_secs(120);
pub const SSH_PROBE_TIMEOUT: Duration = Duration::from_secs(3);
pub const TASK_TIMEOUT: Duration = Duration::from_secs(300);

// Caches
pub const IP_CACHE_TTL: Duration = Duration::from_secs(300);
pub const DOMAIN_XML_CACHE_TTL: Duration = Duration::from_secs(30);
pub const STATUS_CACHE_TTL: Duration = Duration::from_secs(10);

pub const SSH_PORT: u16 = 22;

/// Name of the libvirt network realized for `network_name` inside a range.
pub fn range_network_name(range_id: &str, network_name: &str) -> String {
    format!("{RESOURCE_NAME_PREFIX}-{range_id}-{network_name}")
}

/// Name of the libvirt domain realized for `guest_id` inside a range.
pub fn range_domain_name(range_id: &str, guest_id: &str) -> String {
    format!("{RESOURCE_NAME_PREFIX}-{guest_id}-{range_id}")
}

/// Prefix shared by every resource of a range, used for teardown matching.
pub fn range_resource_prefix(range_id: &str) -> String {
    format!("{RESOURCE_NAME_PREFIX}-{range_id}-")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_realized_names_carry_prefix_and_range() {
        assert_eq!(range_network_name("123", "office"), "cyris-123-office");
        assert_eq!(range_domain_name("123", "desktop"), "cyris-desktop-123");
        assert!(range_network_name("123", "office").starts_with(&range_resource_prefix("123")));
    }
}
