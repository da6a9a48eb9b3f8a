use thiserror::Error;

use crate::command::executor::CommandError;
use crate::config::description::DescriptionError;
use crate::config::settings::SettingsError;
use crate::discovery::IpDiscoveryError;
use crate::hypervisor::HypervisorError;
use crate::image::ImageError;
use crate::network::firewall::FirewallError;
use crate::network::policy::PolicyError;
use crate::network::topology::TopologyError;
use crate::range::entity::InvalidTransition;
use crate::range::store::StoreError;
use crate::tasks::executor::TaskError;

/// Top-level error for range operations. Component errors convert in so
/// orchestration code can use `?` throughout.
#[derive(Error, Debug)]
pub enum RangeError {
    #[error(transparent)]
    Description(#[from] DescriptionError),

    #[error(transparent)]
    Settings(#[from] SettingsError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Transition(#[from] InvalidTransition),

    #[error(transparent)]
    Topology(#[from] TopologyError),

    #[error("network policy is invalid:\n{}", format_policy_errors(.0))]
    Policy(Vec<PolicyError>),

    #[error(transparent)]
    Firewall(#[from] FirewallError),

    #[error(transparent)]
    Image(#[from] ImageError),

    #[error("guest `{guest_id}` disk build failed: {message}")]
    Build { guest_id: String, message: String },

    #[error(transparent)]
    Hypervisor(#[from] HypervisorError),

    #[error(transparent)]
    Discovery(#[from] IpDiscoveryError),

    #[error(transparent)]
    Task(#[from] TaskError),

    #[error(transparent)]
    Command(#[from] CommandError),

    #[error("range `{0}` not found")]
    NotFound(String),

    #[error("range `{0}` is not destroyed; pass --force to destroy and remove it")]
    RemovalRefused(String),

    #[error("invalid range id: {0}")]
    InvalidId(#[from] crate::range::id::RangeIdError),

    #[error("filesystem error: {0}")]
    Io(#[from] std::io::Error),

    #[error("operation cancelled")]
    Cancelled,
}

fn format_policy_errors(errors: &[PolicyError]) -> String {
    errors
        .iter()
        .map(|error| format!("  {error}"))
        .collect::<Vec<_>>()
        .join("\n")
}

impl RangeError {
    /// Short operator hint printed under the failure verdict.
    pub fn hint(&self) -> Option<String> {
        match self {
            RangeError::NotFound(range_id) => {
                Some(format!("run `cyris list --all` to see known ranges; `{range_id}` is not one of them"))
            }
            RangeError::RemovalRefused(range_id) => {
                Some(format!("run `cyris destroy {range_id}` first, or `cyris rm {range_id} --force`"))
            }
            RangeError::Image(ImageError::ToolMissing(tool)) => {
                Some(format!("install `{tool}` (libguestfs-tools) and retry"))
            }
            RangeError::Policy(_) | RangeError::Description(_) => {
                Some("fix the description file and rerun; nothing was created".to_string())
            }
            _ => None,
        }
    }
}
