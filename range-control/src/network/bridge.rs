//! Host bridge management for bridge-mode networking.
//!
//! Bridge creation is serialized through an internal lock: creating many
//! bridges concurrently races inside the kernel on older hosts, and the
//! operations are cheap enough that a queue costs nothing.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use ipnet::Ipv4Net;
use thiserror::Error;
use tracing::{debug, info};

use crate::command::{CommandError, CommandExecutor, CommandSpec};
use crate::operation::OperationTracker;

const IP_COMMAND_TIMEOUT: Duration = Duration::from_secs(15);

#[derive(Error, Debug)]
pub enum BridgeError {
    #[error("failed to create bridge `{bridge}`: {detail}")]
    Create { bridge: String, detail: String },

    #[error("failed to delete bridge `{bridge}`: {detail}")]
    Delete { bridge: String, detail: String },

    #[error(transparent)]
    Command(#[from] CommandError),
}

pub struct BridgeManager {
    executor: Arc<CommandExecutor>,
    creation_lock: Mutex<()>,
}

impl BridgeManager {
    pub fn new(executor: Arc<CommandExecutor>) -> Self {
        Self {
            executor,
            creation_lock: Mutex::new(()),
        }
    }

    pub fn bridge_exists(
        &self,
        tracker: &OperationTracker,
        bridge: &str,
    ) -> Result<bool, BridgeError> {
        let result = self.executor.execute(
            tracker,
            &CommandSpec::new("ip")
                .args(["link", "show", bridge])
                .timeout(IP_COMMAND_TIMEOUT),
        )?;
        Ok(result.success)
    }

    /// Creates the bridge, assigns the gateway address and brings the link
    /// up. Idempotent: an existing bridge is left untouched.
    pub fn ensure_bridge(
        &self,
        tracker: &OperationTracker,
        bridge: &str,
        gateway: Option<Ipv4Net>,
    ) -> Result<(), BridgeError> {
        let _guard = self
            .creation_lock
            .lock()
            .expect("bridge lock should not be poisoned");

        if self.bridge_exists(tracker, bridge)? {
            debug!(bridge, "bridge already present");
            return Ok(());
        }

        let create = self.executor.execute(
            tracker,
            &CommandSpec::new("ip")
                .args(["link", "add", "name", bridge, "type", "bridge"])
                .timeout(IP_COMMAND_TIMEOUT)
                .context("Create range bridge"),
        )?;
        if !create.success {
            return Err(BridgeError::Create {
                bridge: bridge.to_string(),
                detail: create.stderr,
            });
        }

        if let Some(gateway) = gateway {
            let addr = format!(
                "{}/{}",
                gateway.hosts().next().unwrap_or_else(|| gateway.addr()),
                gateway.prefix_len()
            );
            let assign = self.executor.execute(
                tracker,
                &CommandSpec::new("ip")
                    .args(["addr", "add", &addr, "dev", bridge])
                    .timeout(IP_COMMAND_TIMEOUT),
            )?;
            if !assign.success {
                return Err(BridgeError::Create {
                    bridge: bridge.to_string(),
                    detail: assign.stderr,
                });
            }
        }

        let up = self.executor.execute(
            tracker,
            &CommandSpec::new("ip")
                .args(["link", "set", bridge, "up"])
                .timeout(IP_COMMAND_TIMEOUT),
        )?;
        if !up.success {
            return Err(BridgeError::Create {
                bridge: bridge.to_string(),
                detail: up.stderr,
            });
        }

        info!(bridge, "bridge created");
        Ok(())
    }

    /// Deletes the bridge; missing bridges are a no-op.
    pub fn delete_bridge(
        &self,
        tracker: &OperationTracker,
        bridge: &str,
    ) -> Result<(), BridgeError> {
        let _guard = self
            .creation_lock
            .lock()
            .expect("bridge lock should not be poisoned");

        if !self.bridge_exists(tracker, bridge)? {
            return Ok(());
        }

        let delete = self.executor.execute(
            tracker,
            &CommandSpec::new("ip")
                .args(["link", "delete", bridge, "type", "bridge"])
                .timeout(IP_COMMAND_TIMEOUT)
                .context("Delete range bridge"),
        )?;
        if delete.success {
            info!(bridge, "bridge deleted");
            Ok(())
        } else {
            Err(BridgeError::Delete {
                bridge: bridge.to_string(),
                detail: delete.stderr,
            })
        }
    }
}
