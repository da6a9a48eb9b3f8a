//! Sudo credential handling.
//!
//! Some host tools (iptables, bridge setup, parts of the image toolkit)
//! require root. Two credential sources sit behind one interface: the
//! sudo timestamp cache, and an interactive prompt which is only attempted
//! when stdin is a real terminal. With neither available the operation is
//! refused instead of hanging on a hidden password prompt.

use std::io::IsTerminal;
use std::time::Duration;

use tracing::{debug, info};

use crate::command::executor::{CommandError, CommandExecutor, CommandSpec};
use crate::operation::OperationTracker;

const SUDO_CHECK_TIMEOUT: Duration = Duration::from_secs(5);
const SUDO_PROMPT_TIMEOUT: Duration = Duration::from_secs(120);

/// Answers whether an interactive prompt may be attempted. Split out so
/// tests do not depend on the test harness's stdin.
pub trait TerminalProbe: Send + Sync {
    fn stdin_is_terminal(&self) -> bool;
}

pub struct StdinProbe;

impl TerminalProbe for StdinProbe {
    fn stdin_is_terminal(&self) -> bool {
        std::io::stdin().is_terminal()
    }
}

pub struct SudoManager<P = StdinProbe> {
    probe: P,
}

impl Default for SudoManager<StdinProbe> {
    fn default() -> Self {
        Self { probe: StdinProbe }
    }
}

impl<P: TerminalProbe> SudoManager<P> {
    pub fn with_probe(probe: P) -> Self {
        Self { probe }
    }

    /// True when the sudo timestamp cache still grants passwordless access.
    pub fn has_cached_access(
        &self,
        executor: &CommandExecutor,
        tracker: &OperationTracker,
    ) -> bool {
        executor
            .execute(
                tracker,
                &CommandSpec::new("sudo")
                    .args(["-n", "true"])
                    .timeout(SUDO_CHECK_TIMEOUT)
                    .context("Check sudo credential cache"),
            )
            .map(|result| result.success)
            .unwrap_or(false)
    }

    /// Ensures sudo access for `reason`, priming the timestamp cache
    /// interactively when allowed. Commands then run with `sudo -n` so no
    /// later invocation can stall on a prompt.
    pub fn ensure_access(
        &self,
        executor: &CommandExecutor,
        tracker: &OperationTracker,
        reason: &str,
    ) -> Result<(), CommandError> {
        if self.has_cached_access(executor, tracker) {
            debug!("sudo credential cache is warm");
            return Ok(());
        }

        if !self.probe.stdin_is_terminal() {
            return Err(CommandError::NonInteractive(reason.to_string()));
        }

        info!(reason, "requesting sudo access");
        let result = executor.execute_interactive(
            tracker,
            &CommandSpec::new("sudo")
                .arg("-v")
                .timeout(SUDO_PROMPT_TIMEOUT)
                .context("Prime sudo credentials"),
        )?;
        if result.success {
            Ok(())
        } else {
            Err(CommandError::NonInteractive(reason.to_string()))
        }
    }

    /// Wraps a command spec so it runs under non-interactive sudo.
    pub fn wrap(&self, spec: CommandSpec) -> CommandSpec {
        let mut wrapped = CommandSpec::new("sudo").arg("-n");
        for part in spec.command_line().split_whitespace() {
            wrapped = wrapped.arg(part.trim_matches('\''));
        }
        if let Some(context) = spec.log_context() {
            wrapped = wrapped.context(context.to_string());
        }
        wrapped
    }
}
