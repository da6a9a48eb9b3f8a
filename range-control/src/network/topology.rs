//! Per-range network topology.
//!
//! Resolves symbolic network names to CIDRs, realizes them as libvirt
//! networks named `cyris-<range_id>-<network>`, walks memberships and
//! assigns every guest a deterministic address: the same
//! `(range_id, guest_id)` pair resolves to the same IP on every run with
//! the same inputs.

use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::sync::Arc;

use ipnet::Ipv4Net;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{info, warn};

use crate::config::description::{GuestConfig, NetworkSpec, TopologySpec};
use crate::defaults;
use crate::hypervisor::xml::NetworkXmlBuilder;
use crate::hypervisor::Hypervisor;
use crate::network::bridge::{BridgeError, BridgeManager};
use crate::operation::{OperationTracker, OperationType};

/// How realized networks attach guests to the world.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NetworkMode {
    /// NAT networks managed entirely by the hypervisor.
    #[default]
    User,
    /// Host bridges created by us, libvirt networks attach to them.
    Bridge,
}

#[derive(Error, Debug)]
pub enum TopologyError {
    #[error("network `{0}` resolves to an invalid CIDR")]
    InvalidCidr(String),

    #[error("networks `{a}` ({a_cidr}) and `{b}` ({b_cidr}) overlap")]
    OverlappingCidrs {
        a: String,
        a_cidr: String,
        b: String,
        b_cidr: String,
    },

    #[error("guest `{guest_id}` declares static IP `{ip}` which is not a valid IPv4 address")]
    InvalidStaticIp { guest_id: String, ip: String },

    #[error(transparent)]
    Hypervisor(#[from] crate::hypervisor::HypervisorError),

    #[error(transparent)]
    Bridge(#[from] BridgeError),
}

/// One realized network inside a range.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RangeNetwork {
    pub name: String,
    pub full_name: String,
    pub cidr: String,
    pub gateway: String,
    pub members: Vec<(String, String)>,
}

/// Everything the orchestrator needs after topology installation.
#[derive(Debug, Clone, Default)]
pub struct TopologyOutcome {
    pub networks: HashMap<String, RangeNetwork>,
    pub ip_assignments: HashMap<String, String>,
}

pub struct TopologyManager {
    hypervisor: Arc<dyn Hypervisor>,
    bridges: Arc<BridgeManager>,
    cidr_table: HashMap<String, String>,
    mode: NetworkMode,
}

impl TopologyManager {
    pub fn new(hypervisor: Arc<dyn Hypervisor>, bridges: Arc<BridgeManager>) -> Self {
        let cidr_table = defaults::NETWORK_CIDR_DEFAULTS
            .iter()
            .map(|(name, cidr)| ((*name).to_string(), (*cidr).to_string()))
            .collect();
        Self {
            hypervisor,
            bridges,
            cidr_table,
            mode: NetworkMode::User,
        }
    }

    /// Overlays the settings file's name→CIDR table on the defaults.
    pub fn with_cidr_overrides(mut self, overrides: &HashMap<String, String>) -> Self {
        for (name, cidr) in overrides {
            self.cidr_table.insert(name.clone(), cidr.clone());
        }
        self
    }

    pub fn with_mode(mut self, mode: NetworkMode) -> Self {
        self.mode = mode;
        self
    }

    /// CIDR for a symbolic network name, falling back to the shared
    /// default block for unknown names.
    pub fn resolve_cidr(&self, network_name: &str) -> Result<Ipv4Net, TopologyError> {
        let cidr = self
            .cidr_table
            .get(network_name)
            .map(String::as_str)
            .unwrap_or(defaults::NETWORK_CIDR_FALLBACK);
        cidr.parse()
            .map_err(|_| TopologyError::InvalidCidr(network_name.to_string()))
    }

    /// Creates all declared networks and computes guest addresses. Every
    /// realized network registers a rollback hook that destroys it again.
    pub fn create_topology(
        &self,
        tracker: &OperationTracker,
        range_id: &str,
        topology: &TopologySpec,
        guests: &[GuestConfig],
    ) -> Result<TopologyOutcome, TopologyError> {
        let mut outcome = TopologyOutcome::default();

        for network_spec in &topology.networks {
            let network = self.realize_network(tracker, range_id, network_spec)?;
            outcome.networks.insert(network.name.clone(), network);
        }
        self.check_overlaps(&outcome)?;

        self.assign_ips(guests, &mut outcome)?;
        info!(
            range_id,
            networks = outcome.networks.len(),
            guests = outcome.ip_assignments.len(),
            "topology installed"
        );
        Ok(outcome)
    }

    /// Assigns addresses without touching the hypervisor; used by dry runs
    /// and validation.
    pub fn plan_topology(
        &self,
        range_id: &str,
        topology: &TopologySpec,
        guests: &[GuestConfig],
    ) -> Result<TopologyOutcome, TopologyError> {
        let mut outcome = TopologyOutcome::default();
        for network_spec in &topology.networks {
            let cidr = self.resolve_cidr(&network_spec.name)?;
            outcome.networks.insert(
                network_spec.name.clone(),
                self.network_record(range_id, network_spec, cidr),
            );
        }
        self.check_overlaps(&outcome)?;
        self.assign_ips(guests, &mut outcome)?;
        Ok(outcome)
    }

    /// Stops and undefines every network whose name carries the range
    /// prefix. Safe to call repeatedly.
    pub fn destroy_topology(
        &self,
        tracker: &OperationTracker,
        range_id: &str,
    ) -> Result<usize, TopologyError> {
        let prefix = defaults::range_resource_prefix(range_id);
        let mut destroyed = 0;
        for network_name in self.hypervisor.list_networks(false)? {
            if !network_name.starts_with(&prefix) {
                continue;
            }
            let operation_id = tracker.start_operation(
                OperationType::NetworkSetup,
                format!("Destroy network {network_name}"),
                None,
            );
            match self.hypervisor.destroy_network(&network_name, true) {
                Ok(_) => {
                    destroyed += 1;
                    tracker.complete_operation(&operation_id, None).ok();
                }
                Err(err) => {
                    warn!(network = %network_name, %err, "network teardown failed");
                    tracker.fail_operation(&operation_id, err.to_string()).ok();
                }
            }
        }
        Ok(destroyed)
    }

    fn network_record(
        &self,
        range_id: &str,
        spec: &NetworkSpec,
        cidr: Ipv4Net,
    ) -> RangeNetwork {
        let gateway = spec
            .gateway
            .clone()
            .unwrap_or_else(|| {
                cidr.hosts()
                    .next()
                    .unwrap_or_else(|| cidr.addr())
                    .to_string()
            });
        RangeNetwork {
            name: spec.name.clone(),
            full_name: defaults::range_network_name(range_id, &spec.name),
            cidr: cidr.to_string(),
            gateway,
            members: spec
                .member_list()
                .iter()
                .map(|member| parse_member(member))
                .collect(),
        }
    }

    fn realize_network(
        &self,
        tracker: &OperationTracker,
        range_id: &str,
        spec: &NetworkSpec,
    ) -> Result<RangeNetwork, TopologyError> {
        let cidr = self.resolve_cidr(&spec.name)?;
        let record = self.network_record(range_id, spec, cidr);
        let full_name = record.full_name.clone();

        let operation_id = tracker.start_operation(
            OperationType::NetworkSetup,
            format!("Create network {full_name}"),
            Some(Box::new({
                let hypervisor = Arc::clone(&self.hypervisor);
                let full_name = full_name.clone();
                move || {
                    hypervisor
                        .destroy_network(&full_name, true)
                        .map(|_| ())
                        .map_err(|err| err.to_string())
                }
            })),
        );

        let result = match self.mode {
            NetworkMode::User => {
                let xml = NetworkXmlBuilder::new(&full_name, cidr).build();
                self.hypervisor.create_network(&xml, true)
            }
            NetworkMode::Bridge => {
                let bridge = bridge_device_name(range_id, &spec.name);
                self.bridges
                    .ensure_bridge(tracker, &bridge, Some(cidr))
                    .map_err(TopologyError::Bridge)
                    .and_then(|()| {
                        let xml = NetworkXmlBuilder::new(&full_name, cidr)
                            .host_bridge(&bridge)
                            .build();
                        self.hypervisor.create_network(&xml, true).map_err(Into::into)
                    })
                    .map_err(|err| {
                        tracker.fail_operation(&operation_id, err.to_string()).ok();
                        err
                    })?;
                tracker.complete_operation(&operation_id, None).ok();
                return Ok(record);
            }
        };

        match result {
            Ok(_) => {
                tracker.complete_operation(&operation_id, None).ok();
                Ok(record)
            }
            Err(err) => {
                tracker.fail_operation(&operation_id, err.to_string()).ok();
                Err(err.into())
            }
        }
    }

    fn check_overlaps(&self, outcome: &TopologyOutcome) -> Result<(), TopologyError> {
        let networks: Vec<(&String, Ipv4Net)> = outcome
            .networks
            .iter()
            .filter_map(|(name, network)| {
                network.cidr.parse::<Ipv4Net>().ok().map(|cidr| (name, cidr))
            })
            .collect();
        for (i, (a_name, a_cidr)) in networks.iter().enumerate() {
            for (b_name, b_cidr) in networks.iter().skip(i + 1) {
                if a_cidr.contains(&b_cidr.addr()) || b_cidr.contains(&a_cidr.addr()) {
                    return Err(TopologyError::OverlappingCidrs {
                        a: (*a_name).clone(),
                        a_cidr: a_cidr.to_string(),
                        b: (*b_name).clone(),
                        b_cidr: b_cidr.to_string(),
                    });
                }
            }
        }
        Ok(())
    }

    fn assign_ips(
        &self,
        guests: &[GuestConfig],
        outcome: &mut TopologyOutcome,
    ) -> Result<(), TopologyError> {
        for guest in guests {
            // Declared static address wins.
            if let Some(ip) = &guest.ip_addr {
                if ip.parse::<Ipv4Addr>().is_err() {
                    return Err(TopologyError::InvalidStaticIp {
                        guest_id: guest.guest_id.clone(),
                        ip: ip.clone(),
                    });
                }
                outcome
                    .ip_assignments
                    .insert(guest.guest_id.clone(), ip.clone());
                continue;
            }

            let membership = outcome.networks.values().find(|network| {
                network
                    .members
                    .iter()
                    .any(|(guest_id, _)| guest_id == &guest.guest_id)
            });

            let ip = match membership {
                Some(network) => {
                    let cidr: Ipv4Net = network
                        .cidr
                        .parse()
                        .map_err(|_| TopologyError::InvalidCidr(network.name.clone()))?;
                    member_ip(&guest.guest_id, cidr)
                }
                None => fallback_ip(&guest.guest_id),
            };
            outcome.ip_assignments.insert(guest.guest_id.clone(), ip);
        }
        Ok(())
    }
}

/// `guest_id.iface` → (guest_id, iface); a bare guest id gets the default
/// interface.
fn parse_member(member: &str) -> (String, String) {
    match member.split_once('.') {
        Some((guest_id, iface)) => (guest_id.to_string(), iface.to_string()),
        None => (
            member.to_string(),
            defaults::DEFAULT_GUEST_INTERFACE.to_string(),
        ),
    }
}

/// Host offset inside a member network: stable hash of the guest id into
/// the band [10, usable-10), keeping the low band for gateways and static
/// addresses.
fn member_ip(guest_id: &str, cidr: Ipv4Net) -> String {
    let hosts: Vec<Ipv4Addr> = cidr.hosts().collect();
    let usable = hosts.len() as u64;
    let offset = crate::utils::hash::fnv1a_64(guest_id) % usable.saturating_sub(20).max(1) + 10;
    hosts
        .get(offset as usize)
        .or_else(|| hosts.last())
        .map(Ipv4Addr::to_string)
        .unwrap_or_else(|| cidr.addr().to_string())
}

/// Guests outside any declared network land in the management network.
fn fallback_ip(guest_id: &str) -> String {
    let cidr: Ipv4Net = defaults::MANAGEMENT_NETWORK_CIDR
        .parse()
        .expect("management CIDR should parse");
    let offset = crate::utils::hash::fnv1a_64(guest_id) % 200 + 50;
    cidr.hosts()
        .nth(offset as usize)
        .map(|ip| ip.to_string())
        .unwrap_or_else(|| cidr.addr().to_string())
}

/// Kernel device name for a range bridge, bounded by IFNAMSIZ.
fn bridge_device_name(range_id: &str, network_name: &str) -> String {
    let mut name = format!("cr{range_id}{network_name}");
    name.truncate(15);
    name
}
