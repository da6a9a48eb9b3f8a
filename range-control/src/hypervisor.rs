pub mod client;
pub mod domain;
pub mod error;
pub mod pool;
pub mod xml;

pub use client::{Hypervisor, LibvirtClient};
pub use domain::{DhcpLease, DomainOpResult, DomainState, DomainStateInfo, NetworkInterface};
pub use error::HypervisorError;
