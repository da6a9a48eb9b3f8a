//! Libvirt XML generation for domains and NAT networks.
//!
//! The builders emit the minimal XML libvirt needs; everything else is left
//! to hypervisor defaults so the documents stay readable in `virsh dumpxml`.

use std::net::Ipv4Addr;
use std::path::Path;

use ipnet::Ipv4Net;

use crate::utils::hash::fnv1a_64;

const BRIDGE_NAME_MAX: usize = 15; // kernel IFNAMSIZ minus NUL

/// One guest NIC attached to a named libvirt network.
#[derive(Debug, Clone)]
pub struct InterfaceSpec {
    pub network: String,
    pub mac: String,
}

/// Deterministic locally-administered MAC in the QEMU/KVM OUI. The same
/// (domain, index) pair yields the same MAC on every run.
pub fn generate_mac(domain_name: &str, index: usize) -> String {
    let hash = fnv1a_64(&format!("{domain_name}#{index}"));
    format!(
        "52:54:00:{:02x}:{:02x}:{:02x}",
        (hash >> 16) & 0xff,
        (hash >> 8) & 0xff,
        hash & 0xff
    )
}

pub struct DomainXmlBuilder {
    name: String,
    vcpus: u32,
    memory_mib: u64,
    disk_path: String,
    interfaces: Vec<InterfaceSpec>,
}

impl DomainXmlBuilder {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            vcpus: 1,
            memory_mib: 1024,
            disk_path: String::new(),
            interfaces: Vec::new(),
        }
    }

    pub fn vcpus(mut self, vcpus: u32) -> Self {
        self.vcpus = vcpus;
        self
    }

    pub fn memory_mib(mut self, memory_mib: u64) -> Self {
        self.memory_mib = memory_mib;
        self
    }

    pub fn disk(mut self, path: &Path) -> Self {
        self.disk_path = path.display().to_string();
        self
    }

    pub fn interface(mut self, network: impl Into<String>) -> Self {
        let index = self.interfaces.len();
        let mac = generate_mac(&self.name, index);
        self.interfaces.push(InterfaceSpec {
            network: network.into(),
            mac,
        });
        self
    }

    pub fn build(self) -> String {
        let mut devices = String::new();
        devices.push_str(&format!(
            "    <disk type='file' device='disk'>\n      <driver name='qemu' type='qcow2'/>\n      <source file='{}'/>\n      <target dev='vda' bus='virtio'/>\n    </disk>\n",
            self.disk_path
        ));
        for iface in &self.interfaces {
            devices.push_str(&format!(
                "    <interface type='network'>\n      <mac address='{}'/>\n      <source network='{}'/>\n      <model type='virtio'/>\n    </interface>\n",
                iface.mac, iface.network
            ));
        }
        devices.push_str("    <console type='pty'/>\n");
        devices.push_str("    <graphics type='vnc' port='-1' autoport='yes' listen='127.0.0.1'/>\n");

        format!(
            "<domain type='kvm'>\n  <name>{name}</name>\n  <memory unit='MiB'>{memory}</memory>\n  <vcpu placement='static'>{vcpus}</vcpu>\n  <os>\n    <type arch='x86_64' machine='q35'>hvm</type>\n    <boot dev='hd'/>\n  </os>\n  <features>\n    <acpi/>\n    <apic/>\n  </features>\n  <cpu mode='host-passthrough'/>\n  <clock offset='utc'/>\n  <on_poweroff>destroy</on_poweroff>\n  <on_reboot>restart</on_reboot>\n  <on_crash>destroy</on_crash>\n  <devices>\n{devices}  </devices>\n</domain>\n",
            name = self.name,
            memory = self.memory_mib,
            vcpus = self.vcpus,
            devices = devices,
        )
    }
}

pub struct NetworkXmlBuilder {
    name: String,
    bridge: Option<String>,
    cidr: Ipv4Net,
    host_bridge: bool,
}

impl NetworkXmlBuilder {
    pub fn new(name: impl Into<String>, cidr: Ipv4Net) -> Self {
        Self {
            name: name.into(),
            bridge: None,
            cidr,
            host_bridge: false,
        }
    }

    pub fn bridge(mut self, bridge: impl Into<String>) -> Self {
        self.bridge = Some(bridge.into());
        self
    }

    /// Attach to a pre-existing host bridge instead of building a NAT
    /// network. No gateway or DHCP is emitted; addressing is the host's
    /// concern.
    pub fn host_bridge(mut self, bridge: impl Into<String>) -> Self {
        self.bridge = Some(bridge.into());
        self.host_bridge = true;
        self
    }

    /// First usable host address, used as the network gateway.
    pub fn gateway(&self) -> Ipv4Addr {
        self.cidr
            .hosts()
            .next()
            .unwrap_or_else(|| self.cidr.addr())
    }

    /// DHCP range spanning the middle of the network, leaving the low and
    /// high host bands free for static assignments.
    pub fn dhcp_range(&self) -> (Ipv4Addr, Ipv4Addr) {
        let hosts: Vec<Ipv4Addr> = self.cidr.hosts().collect();
        if hosts.len() > 20 {
            (hosts[10], hosts[hosts.len() - 10])
        } else {
            (hosts[1], hosts[hosts.len() - 2])
        }
    }

    fn bridge_name(&self) -> String {
        let mut bridge = self
            .bridge
            .clone()
            .unwrap_or_else(|| format!("br-{}", self.name));
        bridge.truncate(BRIDGE_NAME_MAX);
        bridge
    }

    pub fn build(self) -> String {
        let bridge = self.bridge_name();
        if self.host_bridge {
            return format!(
                "<network>\n  <name>{name}</name>\n  <forward mode='bridge'/>\n  <bridge name='{bridge}'/>\n</network>\n",
                name = self.name,
            );
        }

        let gateway = self.gateway();
        let netmask = self.cidr.netmask();
        let (dhcp_start, dhcp_end) = self.dhcp_range();

        format!(
            "<network>\n  <name>{name}</name>\n  <bridge name='{bridge}' stp='on' delay='0'/>\n  <forward mode='nat'/>\n  <ip address='{gateway}' netmask='{netmask}'>\n    <dhcp>\n      <range start='{dhcp_start}' end='{dhcp_end}'/>\n    </dhcp>\n  </ip>\n</network>\n",
            name = self.name,
        )
    }
}

/// Pulls every `<mac address='…'/>` out of a domain XML document.
pub fn parse_mac_addresses(domain_xml: &str) -> Vec<String> {
    let regex = regex::Regex::new(r"<mac address='([0-9a-fA-F:]{17})'/>")
        .expect("mac regex should be valid");
    regex
        .captures_iter(domain_xml)
        .map(|captures| captures[1].to_lowercase())
        .collect()
}

/// Pulls the first `<source file='…'/>` disk path out of a domain XML
/// document.
pub fn parse_disk_source(domain_xml: &str) -> Option<String> {
    let regex =
        regex::Regex::new(r"<source file='([^']+)'/>").expect("disk regex should be valid");
    regex
        .captures(domain_xml)
        .map(|captures| captures[1].to_string())
}
