use std::fmt::{self, Display, Formatter};
use std::time::Duration;

use serde::Serialize;

/// Domain lifecycle state as reported by the hypervisor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum DomainState {
    Running,
    Blocked,
    Paused,
    Shutdown,
    Shutoff,
    Crashed,
    Suspended,
    Unknown,
}

impl DomainState {
    pub fn from_libvirt(state: u32) -> Self {
        match state {
            virt::sys::VIR_DOMAIN_RUNNING => DomainState::Running,
            virt::sys::VIR_DOMAIN_BLOCKED => DomainState::Blocked,
            virt::sys::VIR_DOMAIN_PAUSED => DomainState::Paused,
            virt::sys::VIR_DOMAIN_SHUTDOWN => DomainState::Shutdown,
            virt::sys::VIR_DOMAIN_SHUTOFF => DomainState::Shutoff,
            virt::sys::VIR_DOMAIN_CRASHED => DomainState::Crashed,
            virt::sys::VIR_DOMAIN_PMSUSPENDED => DomainState::Suspended,
            _ => DomainState::Unknown,
        }
    }

    pub fn is_active(&self) -> bool {
        matches!(
            self,
            DomainState::Running | DomainState::Blocked | DomainState::Paused
        )
    }
}

impl Display for DomainState {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        let name = match self {
            DomainState::Running => "running",
            DomainState::Blocked => "blocked",
            DomainState::Paused => "paused",
            DomainState::Shutdown => "shutdown",
            DomainState::Shutoff => "shutoff",
            DomainState::Crashed => "crashed",
            DomainState::Suspended => "suspended",
            DomainState::Unknown => "unknown",
        };
        write!(f, "{name}")
    }
}

/// State snapshot of a domain.
#[derive(Debug, Clone, Serialize)]
pub struct DomainStateInfo {
    pub name: String,
    pub state: DomainState,
    pub uuid: String,
    pub id: Option<u32>,
    pub max_memory_kib: u64,
    pub memory_kib: u64,
    pub vcpus: u32,
    pub cpu_time_ns: u64,
    pub interfaces: Vec<NetworkInterface>,
}

/// One guest network interface with its discovered addresses.
#[derive(Debug, Clone, Serialize)]
pub struct NetworkInterface {
    pub name: String,
    pub mac: String,
    pub ips: Vec<String>,
}

/// One DHCP lease held by a hypervisor-managed network.
#[derive(Debug, Clone, Serialize)]
pub struct DhcpLease {
    pub network: String,
    pub mac: String,
    pub ip: String,
}

/// Uniform result for every hypervisor mutation, recorded in the tracker.
#[derive(Debug, Clone, Serialize)]
pub struct DomainOpResult {
    pub success: bool,
    pub domain_name: String,
    pub operation: String,
    pub message: String,
    #[serde(skip)]
    pub execution_time: Duration,
    pub error_details: Option<String>,
}

impl DomainOpResult {
    pub fn succeeded(
        domain_name: impl Into<String>,
        operation: impl Into<String>,
        message: impl Into<String>,
        execution_time: Duration,
    ) -> Self {
        Self {
            success: true,
            domain_name: domain_name.into(),
            operation: operation.into(),
            message: message.into(),
            execution_time,
            error_details: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_mapping() {
        assert_eq!(
            DomainState::from_libvirt(virt::sys::VIR_DOMAIN_RUNNING),
            DomainState::Running
        );
        assert_eq!(
            DomainState::from_libvirt(virt::sys::VIR_DOMAIN_SHUTOFF),
            DomainState::Shutoff
        );
        assert_eq!(DomainState::from_libvirt(9999), DomainState::Unknown);
    }

    #[test]
    fn test_activity() {
        assert!(DomainState::Running.is_active());
        assert!(DomainState::Paused.is_active());
        assert!(!DomainState::Shutoff.is_active());
        assert!(!DomainState::Crashed.is_active());
    }
}
