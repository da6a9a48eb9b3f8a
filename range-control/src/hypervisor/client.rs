//! Typed client over the hypervisor's native API.
//!
//! The [Hypervisor] trait is the seam between the orchestrator and libvirt:
//! the real implementation talks to the native API through the connection
//! pool, tests use a mock, and a future cloud provider would implement the
//! same trait. No command strings leak through this interface.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};
use virt::connect::Connect;
use virt::domain::Domain;
use virt::network::Network;

use crate::defaults;
use crate::hypervisor::domain::{
    DhcpLease, DomainOpResult, DomainState, DomainStateInfo, NetworkInterface,
};
use crate::hypervisor::error::HypervisorError;
use crate::hypervisor::pool::ConnectionPool;
use crate::hypervisor::xml::{parse_disk_source, parse_mac_addresses};

const SHUTDOWN_POLL_INTERVAL: Duration = Duration::from_millis(500);

pub trait Hypervisor: Send + Sync {
    fn uri(&self) -> &str;

    fn define_domain(&self, xml: &str, start: bool) -> Result<DomainOpResult, HypervisorError>;
    fn start_domain(&self, name: &str) -> Result<DomainOpResult, HypervisorError>;
    fn stop_domain(
        &self,
        name: &str,
        force: bool,
        timeout: Duration,
    ) -> Result<DomainOpResult, HypervisorError>;
    fn destroy_domain(
        &self,
        name: &str,
        undefine: bool,
        remove_storage: bool,
    ) -> Result<DomainOpResult, HypervisorError>;
    fn reboot_domain(&self, name: &str) -> Result<DomainOpResult, HypervisorError>;
    fn list_domains(&self, active_only: bool) -> Result<Vec<String>, HypervisorError>;
    fn domain_exists(&self, name: &str) -> Result<bool, HypervisorError>;
    fn get_domain_state(&self, name: &str) -> Result<DomainStateInfo, HypervisorError>;
    fn get_domain_xml(&self, name: &str) -> Result<String, HypervisorError>;
    /// Interface addresses as reported by the DHCP-lease source.
    fn get_domain_interfaces(&self, name: &str)
        -> Result<Vec<NetworkInterface>, HypervisorError>;

    fn create_network(&self, xml: &str, start: bool) -> Result<DomainOpResult, HypervisorError>;
    fn list_networks(&self, active_only: bool) -> Result<Vec<String>, HypervisorError>;
    fn network_exists(&self, name: &str) -> Result<bool, HypervisorError>;
    fn destroy_network(&self, name: &str, undefine: bool)
        -> Result<DomainOpResult, HypervisorError>;
    /// Current DHCP leases of one hypervisor-managed network.
    fn list_network_dhcp_leases(&self, network: &str)
        -> Result<Vec<DhcpLease>, HypervisorError>;

    /// MAC addresses of a domain, from its XML definition. Works for
    /// shutoff domains where the lease source has nothing.
    fn get_domain_macs(&self, name: &str) -> Result<Vec<String>, HypervisorError> {
        Ok(parse_mac_addresses(&self.get_domain_xml(name)?))
    }

    /// Backing disk path of a domain's first disk, from its XML
    /// definition.
    fn get_domain_disk(&self, name: &str) -> Result<Option<String>, HypervisorError> {
        Ok(parse_disk_source(&self.get_domain_xml(name)?))
    }
}

pub struct LibvirtClient {
    pool: ConnectionPool,
    xml_cache: Mutex<HashMap<String, (Instant, String)>>,
}

impl LibvirtClient {
    pub fn new(uri: impl Into<String>) -> Self {
        Self {
            pool: ConnectionPool::new(uri),
            xml_cache: Mutex::new(HashMap::new()),
        }
    }

    fn lookup_domain(conn: &Connect, name: &str) -> Result<Domain, HypervisorError> {
        Domain::lookup_by_name(conn, name)
            .map_err(|_| HypervisorError::DomainNotFound(name.to_string()))
    }

    fn invalidate_xml(&self, name: &str) {
        self.xml_cache
            .lock()
            .expect("xml cache lock should not be poisoned")
            .remove(name);
    }

    fn domain_name_from_xml(xml: &str) -> Result<String, HypervisorError> {
        xml.split("<name>")
            .nth(1)
            .and_then(|rest| rest.split("</name>").next())
            .map(str::to_string)
            .ok_or_else(|| HypervisorError::InvalidXml("missing <name> element".to_string()))
    }
}

impl Hypervisor for LibvirtClient {
    fn uri(&self) -> &str {
        self.pool.uri()
    }

    fn define_domain(&self, xml: &str, start: bool) -> Result<DomainOpResult, HypervisorError> {
        let name = Self::domain_name_from_xml(xml)?;
        let started_at = Instant::now();
        self.pool.with_connection(|conn| {
            let domain = Domain::define_xml(conn, xml)
                .map_err(|source| HypervisorError::api(format!("define domain `{name}`"), source))?;
            if start {
                domain.create().map_err(|source| {
                    HypervisorError::api(format!("start domain `{name}`"), source)
                })?;
            }
            info!(domain = %name, started = start, "domain defined");
            Ok(DomainOpResult::succeeded(
                &name,
                "define",
                if start { "defined and started" } else { "defined" },
                started_at.elapsed(),
            ))
        })
    }

    fn start_domain(&self, name: &str) -> Result<DomainOpResult, HypervisorError> {
        let started_at = Instant::now();
        self.pool.with_connection(|conn| {
            let domain = Self::lookup_domain(conn, name)?;
            if domain.is_active().unwrap_or(false) {
                return Ok(DomainOpResult::succeeded(
                    name,
                    "start",
                    "already running",
                    started_at.elapsed(),
                ));
            }
            domain
                .create()
                .map_err(|source| HypervisorError::api(format!("start domain `{name}`"), source))?;
            Ok(DomainOpResult::succeeded(
                name,
                "start",
                "started",
                started_at.elapsed(),
            ))
        })
    }

    fn stop_domain(
        &self,
        name: &str,
        force: bool,
        timeout: Duration,
    ) -> Result<DomainOpResult, HypervisorError> {
        let started_at = Instant::now();
        self.pool.with_connection(|conn| {
            let domain = Self::lookup_domain(conn, name)?;
            if !domain.is_active().unwrap_or(false) {
                return Ok(DomainOpResult::succeeded(
                    name,
                    "stop",
                    "already shut off",
                    started_at.elapsed(),
                ));
            }

            // Graceful first; the guest may need a while to settle.
            if let Err(err) = domain.shutdown() {
                debug!(domain = name, %err, "graceful shutdown request failed");
            }
            let deadline = Instant::now() + timeout;
            while Instant::now() < deadline {
                match domain.get_state() {
                    Ok((state, _)) if DomainState::from_libvirt(state) == DomainState::Shutoff => {
                        return Ok(DomainOpResult::succeeded(
                            name,
                            "stop",
                            "shut down gracefully",
                            started_at.elapsed(),
                        ));
                    }
                    _ => std::thread::sleep(SHUTDOWN_POLL_INTERVAL),
                }
            }

            if force {
                domain.destroy().map_err(|source| {
                    HypervisorError::api(format!("force stop domain `{name}`"), source)
                })?;
                Ok(DomainOpResult::succeeded(
                    name,
                    "stop",
                    "forced off after shutdown timeout",
                    started_at.elapsed(),
                ))
            } else {
                Err(HypervisorError::ShutdownTimeout {
                    domain: name.to_string(),
                    seconds: timeout.as_secs(),
                })
            }
        })
    }

    fn destroy_domain(
        &self,
        name: &str,
        undefine: bool,
        remove_storage: bool,
    ) -> Result<DomainOpResult, HypervisorError> {
        let started_at = Instant::now();
        let result = self.pool.with_connection(|conn| {
            let domain = match Self::lookup_domain(conn, name) {
                Ok(domain) => domain,
                Err(_) => {
                    return Ok(DomainOpResult::succeeded(
                        name,
                        "destroy",
                        "domain not present",
                        started_at.elapsed(),
                    ));
                }
            };

            // Snapshot the XML before undefine so storage can still be
            // located afterwards.
            let xml = domain.get_xml_desc(0).ok();

            if domain.is_active().unwrap_or(false) {
                domain.destroy().map_err(|source| {
                    HypervisorError::api(format!("destroy domain `{name}`"), source)
                })?;
            }
            if undefine {
                domain.undefine().map_err(|source| {
                    HypervisorError::api(format!("undefine domain `{name}`"), source)
                })?;
            }
            if remove_storage {
                if let Some(disk) = xml.as_deref().and_then(parse_disk_source) {
                    if let Err(err) = std::fs::remove_file(&disk) {
                        warn!(domain = name, disk, %err, "failed to remove domain storage");
                    }
                }
            }
            info!(domain = name, undefine, remove_storage, "domain destroyed");
            Ok(DomainOpResult::succeeded(
                name,
                "destroy",
                "destroyed",
                started_at.elapsed(),
            ))
        });
        self.invalidate_xml(name);
        result
    }

    fn reboot_domain(&self, name: &str) -> Result<DomainOpResult, HypervisorError> {
        let started_at = Instant::now();
        self.pool.with_connection(|conn| {
            let domain = Self::lookup_domain(conn, name)?;
            domain
                .reboot(virt::sys::VIR_DOMAIN_REBOOT_DEFAULT)
                .map_err(|source| HypervisorError::api(format!("reboot domain `{name}`"), source))?;
            Ok(DomainOpResult::succeeded(
                name,
                "reboot",
                "reboot requested",
                started_at.elapsed(),
            ))
        })
    }

    fn list_domains(&self, active_only: bool) -> Result<Vec<String>, HypervisorError> {
        let flags = if active_only {
            virt::sys::VIR_CONNECT_LIST_DOMAINS_ACTIVE
        } else {
            virt::sys::VIR_CONNECT_LIST_DOMAINS_ACTIVE
                | virt::sys::VIR_CONNECT_LIST_DOMAINS_INACTIVE
        };
        self.pool.with_connection(|conn| {
            let domains = conn
                .list_all_domains(flags)
                .map_err(|source| HypervisorError::api("list domains", source))?;
            let mut names = Vec::with_capacity(domains.len());
            for domain in domains {
                names.push(
                    domain
                        .get_name()
                        .map_err(|source| HypervisorError::api("get domain name", source))?,
                );
            }
            Ok(names)
        })
    }

    fn domain_exists(&self, name: &str) -> Result<bool, HypervisorError> {
        self.pool
            .with_connection(|conn| Ok(Domain::lookup_by_name(conn, name).is_ok()))
    }

    fn get_domain_state(&self, name: &str) -> Result<DomainStateInfo, HypervisorError> {
        self.pool.with_connection(|conn| {
            let domain = Self::lookup_domain(conn, name)?;
            let (state, _) = domain
                .get_state()
                .map_err(|source| HypervisorError::api(format!("get state of `{name}`"), source))?;
            let state = DomainState::from_libvirt(state);
            let info = domain
                .get_info()
                .map_err(|source| HypervisorError::api(format!("get info of `{name}`"), source))?;
            let uuid = domain
                .get_uuid_string()
                .map_err(|source| HypervisorError::api(format!("get uuid of `{name}`"), source))?;
            let interfaces = if state.is_active() {
                domain
                    .interface_addresses(virt::sys::VIR_DOMAIN_INTERFACE_ADDRESSES_SRC_LEASE, 0)
                    .map(|ifaces| {
                        ifaces
                            .iter()
                            .map(|iface| NetworkInterface {
                                name: iface.name.clone(),
                                mac: iface.hwaddr.to_lowercase(),
                                ips: iface.addrs.iter().map(|addr| addr.addr.clone()).collect(),
                            })
                            .collect()
                    })
                    .unwrap_or_default()
            } else {
                Vec::new()
            };

            Ok(DomainStateInfo {
                name: name.to_string(),
                state,
                uuid,
                id: domain.get_id(),
                max_memory_kib: info.max_mem,
                memory_kib: info.memory,
                vcpus: info.nr_virt_cpu,
                cpu_time_ns: info.cpu_time,
                interfaces,
            })
        })
    }

    fn get_domain_xml(&self, name: &str) -> Result<String, HypervisorError> {
        {
            let cache = self
                .xml_cache
                .lock()
                .expect("xml cache lock should not be poisoned");
            if let Some((cached_at, xml)) = cache.get(name) {
                if cached_at.elapsed() < defaults::DOMAIN_XML_CACHE_TTL {
                    return Ok(xml.clone());
                }
            }
        }

        let xml = self.pool.with_connection(|conn| {
            let domain = Self::lookup_domain(conn, name)?;
            domain
                .get_xml_desc(0)
                .map_err(|source| HypervisorError::api(format!("get xml of `{name}`"), source))
        })?;

        self.xml_cache
            .lock()
            .expect("xml cache lock should not be poisoned")
            .insert(name.to_string(), (Instant::now(), xml.clone()));
        Ok(xml)
    }

    fn get_domain_interfaces(
        &self,
        name: &str,
    ) -> Result<Vec<NetworkInterface>, HypervisorError> {
        self.pool.with_connection(|conn| {
            let domain = Self::lookup_domain(conn, name)?;
            let ifaces = domain
                .interface_addresses(virt::sys::VIR_DOMAIN_INTERFACE_ADDRESSES_SRC_LEASE, 0)
                .map_err(|source| {
                    HypervisorError::api(format!("interface addresses of `{name}`"), source)
                })?;
            Ok(ifaces
                .iter()
                .map(|iface| NetworkInterface {
                    name: iface.name.clone(),
                    mac: iface.hwaddr.to_lowercase(),
                    ips: iface.addrs.iter().map(|addr| addr.addr.clone()).collect(),
                })
                .collect())
        })
    }

    fn create_network(&self, xml: &str, start: bool) -> Result<DomainOpResult, HypervisorError> {
        let name = Self::domain_name_from_xml(xml)?;
        let started_at = Instant::now();
        self.pool.with_connection(|conn| {
            // Adopt an existing network instead of failing, so re-runs and
            // shared management networks work.
            if let Ok(network) = Network::lookup_by_name(conn, &name) {
                if start && !network.is_active().unwrap_or(false) {
                    network.create().map_err(|source| {
                        HypervisorError::api(format!("start network `{name}`"), source)
                    })?;
                }
                return Ok(DomainOpResult::succeeded(
                    &name,
                    "create_network",
                    "adopted existing network",
                    started_at.elapsed(),
                ));
            }

            let network = Network::define_xml(conn, xml)
                .map_err(|source| HypervisorError::api(format!("define network `{name}`"), source))?;
            if start {
                network.create().map_err(|source| {
                    HypervisorError::api(format!("start network `{name}`"), source)
                })?;
            }
            if let Err(err) = network.set_autostart(true) {
                debug!(network = %name, %err, "could not set network autostart");
            }
            info!(network = %name, "network created");
            Ok(DomainOpResult::succeeded(
                &name,
                "create_network",
                "created",
                started_at.elapsed(),
            ))
        })
    }

    fn list_networks(&self, active_only: bool) -> Result<Vec<String>, HypervisorError> {
        let flags = if active_only {
            virt::sys::VIR_CONNECT_LIST_NETWORKS_ACTIVE
        } else {
            virt::sys::VIR_CONNECT_LIST_NETWORKS_ACTIVE
                | virt::sys::VIR_CONNECT_LIST_NETWORKS_INACTIVE
        };
        self.pool.with_connection(|conn| {
            let networks = conn
                .list_all_networks(flags)
                .map_err(|source| HypervisorError::api("list networks", source))?;
            let mut names = Vec::with_capacity(networks.len());
            for network in networks {
                names.push(
                    network
                        .get_name()
                        .map_err(|source| HypervisorError::api("get network name", source))?,
                );
            }
            Ok(names)
        })
    }

    fn network_exists(&self, name: &str) -> Result<bool, HypervisorError> {
        self.pool
            .with_connection(|conn| Ok(Network::lookup_by_name(conn, name).is_ok()))
    }

    fn list_network_dhcp_leases(
        &self,
        network: &str,
    ) -> Result<Vec<DhcpLease>, HypervisorError> {
        self.pool.with_connection(|conn| {
            let net = Network::lookup_by_name(conn, network)
                .map_err(|_| HypervisorError::NetworkNotFound(network.to_string()))?;
            let leases = net.get_dhcp_leases(None).map_err(|source| {
                HypervisorError::api(format!("dhcp leases of `{network}`"), source)
            })?;
            Ok(leases
                .iter()
                .map(|lease| DhcpLease {
                    network: network.to_string(),
                    mac: lease.mac.to_lowercase(),
                    ip: lease.ipaddr.clone(),
                })
                .collect())
        })
    }

    fn destroy_network(
        &self,
        name: &str,
        undefine: bool,
    ) -> Result<DomainOpResult, HypervisorError> {
        let started_at = Instant::now();
        self.pool.with_connection(|conn| {
            let network = match Network::lookup_by_name(conn, name) {
                Ok(network) => network,
                Err(_) => {
                    return Ok(DomainOpResult::succeeded(
                        name,
                        "destroy_network",
                        "network not present",
                        started_at.elapsed(),
                    ));
                }
            };
            if network.is_active().unwrap_or(false) {
                network.destroy().map_err(|source| {
                    HypervisorError::api(format!("destroy network `{name}`"), source)
                })?;
            }
            if undefine {
                network.undefine().map_err(|source| {
                    HypervisorError::api(format!("undefine network `{name}`"), source)
                })?;
            }
            info!(network = name, "network destroyed");
            Ok(DomainOpResult::succeeded(
                name,
                "destroy_network",
                "destroyed",
                started_at.elapsed(),
            ))
        })
    }
}
