//! Multi-method guest IP discovery.
//!
//! A freshly started guest can take a while to show up in any single
//! source, so discovery walks a prioritized chain of methods, each with a
//! confidence score. The first method returning any address wins and the
//! result is cached per domain with a TTL.

pub mod parsers;

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use serde::Serialize;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::command::{CommandExecutor, CommandSpec};
use crate::defaults;
use crate::hypervisor::{Hypervisor, NetworkInterface};
use crate::operation::OperationTracker;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DiscoveryMethod {
    RangeTopology,
    LibvirtNative,
    LibvirtDhcp,
    VirshDomifaddr,
    ArpTable,
    DhcpLeases,
    MacComputed,
}

impl DiscoveryMethod {
    pub fn confidence(&self) -> f64 {
        match self {
            DiscoveryMethod::RangeTopology => 1.0,
            DiscoveryMethod::LibvirtNative => 1.0,
            DiscoveryMethod::LibvirtDhcp => 0.9,
            DiscoveryMethod::VirshDomifaddr => 0.7,
            DiscoveryMethod::ArpTable => 0.8,
            DiscoveryMethod::DhcpLeases => 0.6,
            DiscoveryMethod::MacComputed => 0.2,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            DiscoveryMethod::RangeTopology => "range_topology",
            DiscoveryMethod::LibvirtNative => "libvirt_native",
            DiscoveryMethod::LibvirtDhcp => "libvirt_dhcp",
            DiscoveryMethod::VirshDomifaddr => "virsh_domifaddr",
            DiscoveryMethod::ArpTable => "arp_table",
            DiscoveryMethod::DhcpLeases => "dhcp_leases",
            DiscoveryMethod::MacComputed => "mac_computed",
        }
    }

    pub fn chain() -> [DiscoveryMethod; 7] {
        [
            DiscoveryMethod::RangeTopology,
            DiscoveryMethod::LibvirtNative,
            DiscoveryMethod::LibvirtDhcp,
            DiscoveryMethod::VirshDomifaddr,
            DiscoveryMethod::ArpTable,
            DiscoveryMethod::DhcpLeases,
            DiscoveryMethod::MacComputed,
        ]
    }
}

/// Discovery outcome for one domain.
#[derive(Debug, Clone, Serialize)]
pub struct VmIpInfo {
    pub domain_name: String,
    pub ip_addresses: Vec<String>,
    pub mac_addresses: Vec<String>,
    pub interfaces: Vec<NetworkInterface>,
    pub discovery_method: &'static str,
    pub confidence: f64,
    #[serde(skip)]
    pub elapsed: Duration,
}

impl VmIpInfo {
    pub fn primary_ip(&self) -> Option<&str> {
        self.ip_addresses
            .iter()
            .find(|ip| ip.contains('.'))
            .map(String::as_str)
    }
}

#[derive(Error, Debug)]
pub enum IpDiscoveryError {
    #[error("no IP address found for `{domain}` after trying: {tried}")]
    Exhausted { domain: String, tried: String },
}

/// Source of topology-assigned addresses, implemented by the metadata
/// store.
pub trait TopologyIpSource: Send + Sync {
    fn assigned_ip(&self, range_id: &str, guest_id: &str) -> Option<String>;
}

/// Identifies the guest being discovered. Range and guest ids enable the
/// topology lookup; without them the chain starts at the hypervisor.
#[derive(Debug, Clone, Default)]
pub struct DiscoveryRequest {
    pub domain_name: String,
    pub range_id: Option<String>,
    pub guest_id: Option<String>,
    pub force_refresh: bool,
}

struct CachedIpInfo {
    info: VmIpInfo,
    cached_at: Instant,
    validation_count: u32,
}

pub struct IpDiscovery {
    hypervisor: Arc<dyn Hypervisor>,
    executor: Arc<CommandExecutor>,
    topology_source: Option<Arc<dyn TopologyIpSource>>,
    lease_dirs: Vec<PathBuf>,
    cache_ttl: Duration,
    cache: Mutex<HashMap<String, CachedIpInfo>>,
}

impl IpDiscovery {
    pub fn new(hypervisor: Arc<dyn Hypervisor>, executor: Arc<CommandExecutor>) -> Self {
        Self {
            hypervisor,
            executor,
            topology_source: None,
            lease_dirs: vec![
                PathBuf::from("/var/lib/libvirt/dnsmasq"),
                PathBuf::from("/var/lib/dhcp"),
            ],
            cache_ttl: defaults::IP_CACHE_TTL,
            cache: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_topology_source(mut self, source: Arc<dyn TopologyIpSource>) -> Self {
        self.topology_source = Some(source);
        self
    }

    pub fn with_lease_dirs(mut self, dirs: Vec<PathBuf>) -> Self {
        self.lease_dirs = dirs;
        self
    }

    pub fn with_cache_ttl(mut self, ttl: Duration) -> Self {
        self.cache_ttl = ttl;
        self
    }

    /// Walks the method chain and returns the first hit.
    pub fn discover(
        &self,
        tracker: &OperationTracker,
        request: &DiscoveryRequest,
    ) -> Result<VmIpInfo, IpDiscoveryError> {
        if !request.force_refresh {
            if let Some(cached) = self.cached(&request.domain_name) {
                debug!(domain = %request.domain_name, "IP served from cache");
                return Ok(cached);
            }
        }

        let started_at = Instant::now();
        let mut tried = Vec::new();
        for method in DiscoveryMethod::chain() {
            let found = match method {
                DiscoveryMethod::RangeTopology => self.via_topology(request),
                DiscoveryMethod::LibvirtNative => self.via_native(&request.domain_name),
                DiscoveryMethod::LibvirtDhcp => self.via_libvirt_dhcp(&request.domain_name),
                DiscoveryMethod::VirshDomifaddr => {
                    self.via_domifaddr(tracker, &request.domain_name)
                }
                DiscoveryMethod::ArpTable => self.via_arp(tracker, &request.domain_name),
                DiscoveryMethod::DhcpLeases => self.via_lease_files(&request.domain_name),
                DiscoveryMethod::MacComputed => self.via_mac_computed(&request.domain_name),
            };
            tried.push(method.name());

            if let Some(mut info) = found {
                info.discovery_method = method.name();
                info.confidence = method.confidence();
                info.elapsed = started_at.elapsed();
                info!(
                    domain = %request.domain_name,
                    method = method.name(),
                    ips = ?info.ip_addresses,
                    "IP discovered"
                );
                self.insert_cache(info.clone());
                return Ok(info);
            }
        }

        warn!(domain = %request.domain_name, "IP discovery exhausted all methods");
        Err(IpDiscoveryError::Exhausted {
            domain: request.domain_name.clone(),
            tried: tried.join(", "),
        })
    }

    /// Blocks until discovery succeeds or `timeout` elapses.
    pub fn wait_for_ip(
        &self,
        tracker: &OperationTracker,
        request: &DiscoveryRequest,
        timeout: Duration,
        poll_interval: Duration,
    ) -> Result<VmIpInfo, IpDiscoveryError> {
        let deadline = Instant::now() + timeout;
        loop {
            match self.discover(tracker, request) {
                Ok(info) => return Ok(info),
                Err(err) if Instant::now() >= deadline => return Err(err),
                Err(_) => std::thread::sleep(poll_interval),
            }
        }
    }

    fn cached(&self, domain_name: &str) -> Option<VmIpInfo> {
        let mut cache = self.cache.lock().expect("ip cache lock");
        let entry = cache.get_mut(domain_name)?;
        if entry.cached_at.elapsed() > self.cache_ttl {
            cache.remove(domain_name);
            return None;
        }
        entry.validation_count += 1;
        Some(entry.info.clone())
    }

    fn insert_cache(&self, info: VmIpInfo) {
        self.cache.lock().expect("ip cache lock").insert(
            info.domain_name.clone(),
            CachedIpInfo {
                info,
                cached_at: Instant::now(),
                validation_count: 0,
            },
        );
    }

    fn empty_info(&self, domain_name: &str) -> VmIpInfo {
        VmIpInfo {
            domain_name: domain_name.to_string(),
            ip_addresses: Vec::new(),
            mac_addresses: Vec::new(),
            interfaces: Vec::new(),
            discovery_method: "",
            confidence: 0.0,
            elapsed: Duration::ZERO,
        }
    }

    fn via_topology(&self, request: &DiscoveryRequest) -> Option<VmIpInfo> {
        let source = self.topology_source.as_ref()?;
        let range_id = request.range_id.as_deref()?;
        let guest_id = request.guest_id.as_deref()?;
        let ip = source.assigned_ip(range_id, guest_id)?;

        let mut info = self.empty_info(&request.domain_name);
        info.ip_addresses = vec![ip];
        Some(info)
    }

    fn via_native(&self, domain_name: &str) -> Option<VmIpInfo> {
        let interfaces = self.hypervisor.get_domain_interfaces(domain_name).ok()?;
        let ips: Vec<String> = interfaces
            .iter()
            .flat_map(|iface| iface.ips.iter().cloned())
            .filter(|ip| parsers::is_routable_ipv4(ip))
            .collect();
        if ips.is_empty() {
            return None;
        }

        let mut info = self.empty_info(domain_name);
        info.mac_addresses = interfaces.iter().map(|iface| iface.mac.clone()).collect();
        info.interfaces = interfaces;
        info.ip_addresses = ips;
        Some(info)
    }

    /// Enumerates the connection's networks and matches their DHCP leases
    /// against the domain's MACs, all through the native lease API.
    fn via_libvirt_dhcp(&self, domain_name: &str) -> Option<VmIpInfo> {
        let macs = self.domain_macs(domain_name)?;
        let networks = self.hypervisor.list_networks(true).ok()?;

        let mut ips = Vec::new();
        for network in networks {
            // Not every network runs a DHCP service; skip the ones that
            // refuse the query.
            let Ok(leases) = self.hypervisor.list_network_dhcp_leases(&network) else {
                continue;
            };
            ips.extend(
                leases
                    .into_iter()
                    .filter(|lease| macs.contains(&lease.mac))
                    .map(|lease| lease.ip)
                    .filter(|ip| parsers::is_routable_ipv4(ip)),
            );
        }
        if ips.is_empty() {
            return None;
        }

        let mut info = self.empty_info(domain_name);
        info.mac_addresses = macs;
        info.ip_addresses = ips;
        Some(info)
    }

    fn via_domifaddr(&self, tracker: &OperationTracker, domain_name: &str) -> Option<VmIpInfo> {
        let result = self
            .executor
            .execute(
                tracker,
                &CommandSpec::new("virsh")
                    .args(["--connect", self.hypervisor.uri(), "domifaddr", domain_name])
                    .timeout(Duration::from_secs(30))
                    .context("Discover guest IP via virsh"),
            )
            .ok()?;
        if !result.success {
            return None;
        }

        let parsed = parsers::parse_domifaddr(&result.stdout);
        if parsed.is_empty() {
            return None;
        }

        let mut info = self.empty_info(domain_name);
        for entry in parsed {
            info.mac_addresses.push(entry.mac.clone());
            info.ip_addresses.push(entry.ip.clone());
            info.interfaces.push(NetworkInterface {
                name: entry.interface,
                mac: entry.mac,
                ips: vec![entry.ip],
            });
        }
        Some(info)
    }

    fn via_arp(&self, tracker: &OperationTracker, domain_name: &str) -> Option<VmIpInfo> {
        let macs = self.domain_macs(domain_name)?;
        let result = self
            .executor
            .execute(
                tracker,
                &CommandSpec::new("arp")
                    .arg("-a")
                    .timeout(Duration::from_secs(10))
                    .context("Discover guest IP via ARP table"),
            )
            .ok()?;
        if !result.success {
            return None;
        }

        let leases = parsers::parse_arp_output(&result.stdout);
        self.match_leases(domain_name, &macs, &leases)
    }

    /// Parses the common on-disk lease sources: classic dnsmasq `.leases`
    /// text files and libvirt's per-bridge `.status` JSON files.
    fn via_lease_files(&self, domain_name: &str) -> Option<VmIpInfo> {
        let macs = self.domain_macs(domain_name)?;
        for dir in &self.lease_dirs {
            let entries = std::fs::read_dir(dir).ok();
            for entry in entries.into_iter().flatten().flatten() {
                let path = entry.path();
                let leases = match path.extension().and_then(|ext| ext.to_str()) {
                    Some("leases") => std::fs::read_to_string(&path)
                        .map(|content| parsers::parse_dnsmasq_leases(&content))
                        .unwrap_or_default(),
                    Some("status") => std::fs::read_to_string(&path)
                        .map(|content| parsers::parse_dnsmasq_status(&content))
                        .unwrap_or_default(),
                    _ => continue,
                };
                if let Some(info) = self.match_leases(domain_name, &macs, &leases) {
                    return Some(info);
                }
            }
        }
        None
    }

    /// Last resort: derive the host offset from the MAC's low-order byte
    /// inside the default libvirt network. Only a heuristic, hence the low
    /// confidence.
    fn via_mac_computed(&self, domain_name: &str) -> Option<VmIpInfo> {
        let macs = self.domain_macs(domain_name)?;
        let mac = macs.first()?;
        let low_byte = u8::from_str_radix(mac.rsplit(':').next()?, 16).ok()?;
        let host_offset = u32::from(low_byte) % 200 + 50;

        let network: ipnet::Ipv4Net = defaults::MANAGEMENT_NETWORK_CIDR
            .parse()
            .expect("default management CIDR should parse");
        let ip = network.hosts().nth(host_offset as usize)?;

        let mut info = self.empty_info(domain_name);
        info.mac_addresses = macs.clone();
        info.ip_addresses = vec![ip.to_string()];
        Some(info)
    }

    fn match_leases(
        &self,
        domain_name: &str,
        macs: &[String],
        leases: &[parsers::LeaseEntry],
    ) -> Option<VmIpInfo> {
        let ips: Vec<String> = leases
            .iter()
            .filter(|lease| macs.contains(&lease.mac))
            .map(|lease| lease.ip.clone())
            .filter(|ip| parsers::is_routable_ipv4(ip))
            .collect();
        if ips.is_empty() {
            return None;
        }

        let mut info = self.empty_info(domain_name);
        info.mac_addresses = macs.to_vec();
        info.ip_addresses = ips;
        Some(info)
    }

    fn domain_macs(&self, domain_name: &str) -> Option<Vec<String>> {
        let macs = self.hypervisor.get_domain_macs(domain_name).ok()?;
        if macs.is_empty() {
            None
        } else {
            Some(macs)
        }
    }
}

////////////////////////////////////////////////////////////////////////////////////
// TESTS
////////////////////////////////////////////////////////////////////////////////////
#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::executor::testing::FakeRunner;
    use crate::hypervisor::client::mock::MockHypervisor;
    use crate::hypervisor::HypervisorError;
    use assert_matches::assert_matches;

    const MAC: &str = "52:54:00:2b:26:06";

    fn discovery_with(
        hypervisor: MockHypervisor,
        runner: FakeRunner,
        lease_dir: Option<PathBuf>,
    ) -> IpDiscovery {
        let executor = Arc::new(CommandExecutor::new(Arc::new(runner)));
        let mut discovery = IpDiscovery::new(Arc::new(hypervisor), executor);
        if let Some(dir) = lease_dir {
            discovery = discovery.with_lease_dirs(vec![dir]);
        } else {
            discovery = discovery.with_lease_dirs(Vec::new());
        }
        discovery
    }

    fn not_found(name: &str) -> HypervisorError {
        HypervisorError::DomainNotFound(name.to_string())
    }

    #[test]
    fn test_native_interfaces_win_with_full_confidence() {
        let mut hypervisor = MockHypervisor::new();
        hypervisor.expect_get_domain_interfaces().returning(|_| {
            Ok(vec![NetworkInterface {
                name: "vnet0".to_string(),
                mac: MAC.to_string(),
                ips: vec!["192.168.100.42".to_string()],
            }])
        });

        let discovery = discovery_with(hypervisor, FakeRunner::default(), None);
        let tracker = OperationTracker::new("test");
        let info = discovery
            .discover(
                &tracker,
                &DiscoveryRequest {
                    domain_name: "cyris-desktop-77".to_string(),
                    ..Default::default()
                },
            )
            .unwrap();

        assert_eq!(info.discovery_method, "libvirt_native");
        assert_eq!(info.confidence, 1.0);
        assert_eq!(info.ip_addresses, vec!["192.168.100.42"]);
    }

    #[test]
    fn test_network_leases_answer_through_the_native_api() {
        use crate::hypervisor::DhcpLease;

        let mut hypervisor = MockHypervisor::new();
        hypervisor
            .expect_get_domain_interfaces()
            .returning(|_| Ok(Vec::new()));
        hypervisor
            .expect_get_domain_macs()
            .returning(|_| Ok(vec![MAC.to_string()]));
        hypervisor
            .expect_list_networks()
            .withf(|active_only| *active_only)
            .returning(|_| Ok(vec!["cyris-77-office".to_string(), "default".to_string()]));
        hypervisor
            .expect_list_network_dhcp_leases()
            .withf(|network| network == "cyris-77-office")
            .returning(|network| {
                Ok(vec![DhcpLease {
                    network: network.to_string(),
                    mac: MAC.to_string(),
                    ip: "192.168.100.63".to_string(),
                }])
            });
        hypervisor
            .expect_list_network_dhcp_leases()
            .withf(|network| network == "default")
            .returning(|network| {
                Ok(vec![DhcpLease {
                    network: network.to_string(),
                    mac: "52:54:00:ff:ff:ff".to_string(),
                    ip: "192.168.122.9".to_string(),
                }])
            });

        // No lease directory: the answer must come from the hypervisor,
        // not the filesystem.
        let discovery = discovery_with(hypervisor, FakeRunner::default(), None);
        let tracker = OperationTracker::new("test");

        let info = discovery
            .discover(
                &tracker,
                &DiscoveryRequest {
                    domain_name: "cyris-desktop-77".to_string(),
                    ..Default::default()
                },
            )
            .unwrap();

        assert_eq!(info.discovery_method, "libvirt_dhcp");
        assert_eq!(info.confidence, 0.9);
        assert_eq!(info.ip_addresses, vec!["192.168.100.63"]);
    }

    #[test]
    fn test_empty_interface_addresses_fall_back_to_lease_file() {
        // Scenario: interfaceAddresses is empty but the MAC appears in a
        // DHCP leases file.
        let tempdir = tempfile::tempdir().unwrap();
        std::fs::write(
            tempdir.path().join("default.leases"),
            format!("1700000000 {MAC} 192.168.122.63 desktop *\n"),
        )
        .unwrap();

        let mut hypervisor = MockHypervisor::new();
        hypervisor
            .expect_get_domain_interfaces()
            .returning(|_| Ok(Vec::new()));
        hypervisor
            .expect_get_domain_macs()
            .returning(|_| Ok(vec![MAC.to_string()]));
        // No networks hold a native lease for this MAC.
        hypervisor.expect_list_networks().returning(|_| Ok(Vec::new()));
        hypervisor.expect_uri().return_const("qemu:///system".to_string());

        // virsh domifaddr returns nothing either.
        let runner = FakeRunner::default().respond("domifaddr", 0, "");

        let discovery = discovery_with(hypervisor, runner, Some(tempdir.path().to_path_buf()));
        let tracker = OperationTracker::new("test");
        let info = discovery
            .discover(
                &tracker,
                &DiscoveryRequest {
                    domain_name: "cyris-desktop-77".to_string(),
                    ..Default::default()
                },
            )
            .unwrap();

        assert_eq!(info.ip_addresses, vec!["192.168.122.63"]);
        assert_eq!(info.discovery_method, "dhcp_leases");
        assert!(info.confidence >= 0.6);
    }

    #[test]
    fn test_status_files_surface_through_the_file_path() {
        let tempdir = tempfile::tempdir().unwrap();
        std::fs::write(
            tempdir.path().join("virbr0.status"),
            format!(
                r#"[{{"ip-address": "192.168.122.63", "mac-address": "{MAC}", "hostname": "desktop", "expiry-time": 1700000000}}]"#
            ),
        )
        .unwrap();

        let mut hypervisor = MockHypervisor::new();
        hypervisor
            .expect_get_domain_interfaces()
            .returning(|_| Ok(Vec::new()));
        hypervisor
            .expect_get_domain_macs()
            .returning(|_| Ok(vec![MAC.to_string()]));
        hypervisor.expect_list_networks().returning(|_| Ok(Vec::new()));
        hypervisor.expect_uri().return_const("qemu:///system".to_string());

        let runner = FakeRunner::default().respond("domifaddr", 0, "");
        let discovery = discovery_with(hypervisor, runner, Some(tempdir.path().to_path_buf()));
        let tracker = OperationTracker::new("test");

        let info = discovery
            .discover(
                &tracker,
                &DiscoveryRequest {
                    domain_name: "cyris-desktop-77".to_string(),
                    ..Default::default()
                },
            )
            .unwrap();

        assert_eq!(info.discovery_method, "dhcp_leases");
        assert!(info.confidence >= 0.6);
        assert_eq!(info.ip_addresses, vec!["192.168.122.63"]);
    }

    #[test]
    fn test_topology_assignment_takes_priority() {
        struct FixedSource;
        impl TopologyIpSource for FixedSource {
            fn assigned_ip(&self, range_id: &str, guest_id: &str) -> Option<String> {
                (range_id == "77" && guest_id == "desktop")
                    .then(|| "192.168.100.77".to_string())
            }
        }

        let hypervisor = MockHypervisor::new();
        let discovery = discovery_with(hypervisor, FakeRunner::default(), None)
            .with_topology_source(Arc::new(FixedSource));
        let tracker = OperationTracker::new("test");

        let info = discovery
            .discover(
                &tracker,
                &DiscoveryRequest {
                    domain_name: "cyris-desktop-77".to_string(),
                    range_id: Some("77".to_string()),
                    guest_id: Some("desktop".to_string()),
                    force_refresh: false,
                },
            )
            .unwrap();

        assert_eq!(info.discovery_method, "range_topology");
        assert_eq!(info.ip_addresses, vec!["192.168.100.77"]);
    }

    #[test]
    fn test_all_methods_exhausted_is_an_error() {
        let mut hypervisor = MockHypervisor::new();
        hypervisor
            .expect_get_domain_interfaces()
            .returning(|name| Err(not_found(name)));
        hypervisor
            .expect_get_domain_macs()
            .returning(|name| Err(not_found(name)));
        hypervisor.expect_uri().return_const("qemu:///system".to_string());

        let runner = FakeRunner::default().respond("domifaddr", 1, "");
        let discovery = discovery_with(hypervisor, runner, None);
        let tracker = OperationTracker::new("test");

        let err = discovery
            .discover(
                &tracker,
                &DiscoveryRequest {
                    domain_name: "cyris-ghost-77".to_string(),
                    ..Default::default()
                },
            )
            .unwrap_err();
        assert_matches!(err, IpDiscoveryError::Exhausted { .. });
    }

    #[test]
    fn test_results_are_cached_until_forced() {
        let mut hypervisor = MockHypervisor::new();
        // Only one hypervisor round-trip despite two discover calls.
        hypervisor
            .expect_get_domain_interfaces()
            .times(2)
            .returning(|_| {
                Ok(vec![NetworkInterface {
                    name: "vnet0".to_string(),
                    mac: MAC.to_string(),
                    ips: vec!["192.168.100.42".to_string()],
                }])
            });

        let discovery = discovery_with(hypervisor, FakeRunner::default(), None);
        let tracker = OperationTracker::new("test");
        let request = DiscoveryRequest {
            domain_name: "cyris-desktop-77".to_string(),
            ..Default::default()
        };

        discovery.discover(&tracker, &request).unwrap();
        discovery.discover(&tracker, &request).unwrap();

        let forced = DiscoveryRequest {
            force_refresh: true,
            ..request
        };
        discovery.discover(&tracker, &forced).unwrap();
    }

    #[test]
    fn test_mac_computed_is_deterministic_last_resort() {
        let mut hypervisor = MockHypervisor::new();
        hypervisor
            .expect_get_domain_interfaces()
            .returning(|name| Err(not_found(name)));
        hypervisor
            .expect_get_domain_macs()
            .returning(|_| Ok(vec![MAC.to_string()]));
        hypervisor.expect_list_networks().returning(|_| Ok(Vec::new()));
        hypervisor.expect_uri().return_const("qemu:///system".to_string());

        let runner = FakeRunner::default()
            .respond("domifaddr", 1, "")
            .respond("arp -a", 0, "");
        let discovery = discovery_with(hypervisor, runner, None);
        let tracker = OperationTracker::new("test");

        let info = discovery
            .discover(
                &tracker,
                &DiscoveryRequest {
                    domain_name: "cyris-desktop-77".to_string(),
                    force_refresh: true,
                    ..Default::default()
                },
            )
            .unwrap();

        assert_eq!(info.discovery_method, "mac_computed");
        assert_eq!(info.confidence, 0.2);
        // 0x06 % 200 + 50 = 56 -> hosts().nth(56) of 192.168.122.0/24
        assert_eq!(info.ip_addresses, vec!["192.168.122.57"]);
    }
}
