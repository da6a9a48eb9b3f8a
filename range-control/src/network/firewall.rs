//! Host firewall management.
//!
//! All rules live in dedicated chains linked from the main ones, so nothing
//! here touches rules the host had before. Every installed rule carries a
//! `cyris:<range_id>` comment; removal matches on that tag via
//! `iptables-save`, which keeps teardown safe even if the orchestrator lost
//! its in-memory state.

use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use thiserror::Error;
use tracing::{debug, info, warn};

use crate::command::sudo::SudoManager;
use crate::command::{CommandError, CommandExecutor, CommandSpec};
use crate::network::policy::{CompiledRule, NetworkPolicy};
use crate::operation::OperationTracker;
use crate::utils::time;

const IPTABLES_TIMEOUT: Duration = Duration::from_secs(30);

pub const CHAIN_INPUT: &str = "CYRIS_INPUT";
pub const CHAIN_OUTPUT: &str = "CYRIS_OUTPUT";
pub const CHAIN_FORWARD: &str = "CYRIS_FORWARD";
pub const CHAIN_ISOLATION: &str = "CYRIS_ISOLATION";

const MANAGED_CHAINS: [&str; 4] = [CHAIN_INPUT, CHAIN_OUTPUT, CHAIN_FORWARD, CHAIN_ISOLATION];
const CHAIN_LINKS: [(&str, &str); 3] = [
    ("INPUT", CHAIN_INPUT),
    ("OUTPUT", CHAIN_OUTPUT),
    ("FORWARD", CHAIN_FORWARD),
];

#[derive(Error, Debug)]
pub enum FirewallError {
    #[error("firewall initialization failed: {0}")]
    Init(String),

    #[error("failed to apply rule `{rule}`: {detail}")]
    Apply { rule: String, detail: String },

    #[error("failed to remove rules for range `{range_id}`: {detail}")]
    Remove { range_id: String, detail: String },

    #[error("policy `{0}` has no compiled rules; compile before applying")]
    NotCompiled(String),

    #[error(transparent)]
    Command(#[from] CommandError),
}

pub struct FirewallManager {
    executor: Arc<CommandExecutor>,
    backup_dir: PathBuf,
    use_sudo: bool,
    sudo: SudoManager,
    // One mutator at a time; iptables has no transactional interface.
    mutation_lock: Mutex<()>,
}

impl FirewallManager {
    pub fn new(executor: Arc<CommandExecutor>, backup_dir: PathBuf) -> Self {
        Self {
            executor,
            backup_dir,
            use_sudo: false,
            sudo: SudoManager::default(),
            mutation_lock: Mutex::new(()),
        }
    }

    pub fn with_sudo(mut self, use_sudo: bool) -> Self {
        self.use_sudo = use_sudo;
        self
    }

    fn iptables(&self, args: &[String]) -> CommandSpec {
        let spec = if self.use_sudo {
            CommandSpec::new("sudo")
                .arg("-n")
                .arg("iptables")
                .args(args.iter().cloned())
        } else {
            CommandSpec::new("iptables").args(args.iter().cloned())
        };
        spec.timeout(IPTABLES_TIMEOUT)
    }

    fn run(
        &self,
        tracker: &OperationTracker,
        args: Vec<String>,
    ) -> Result<crate::command::CommandResult, CommandError> {
        self.executor.execute(tracker, &self.iptables(&args))
    }

    /// Creates the managed chains and links them from the main chains.
    /// Idempotent; a backup of the pre-existing rule state is taken first.
    pub fn initialize(&self, tracker: &OperationTracker) -> Result<(), FirewallError> {
        let _guard = self.lock();
        if self.use_sudo {
            self.sudo
                .ensure_access(&self.executor, tracker, "manage host firewall chains")?;
        }
        self.backup(tracker);

        for chain in MANAGED_CHAINS {
            let exists = self.run(tracker, str_args(["-t", "filter", "-L", chain]))?;
            if !exists.success {
                let created = self.run(tracker, str_args(["-t", "filter", "-N", chain]))?;
                if !created.success {
                    return Err(FirewallError::Init(format!(
                        "could not create chain {chain}: {}",
                        created.stderr
                    )));
                }
                info!(chain, "created firewall chain");
            }
        }

        for (main, custom) in CHAIN_LINKS {
            let listing = self.run(tracker, str_args(["-t", "filter", "-L", main, "-n"]))?;
            if !listing.stdout.contains(custom) {
                let linked =
                    self.run(tracker, str_args(["-t", "filter", "-A", main, "-j", custom]))?;
                if !linked.success {
                    return Err(FirewallError::Init(format!(
                        "could not link {custom} from {main}: {}",
                        linked.stderr
                    )));
                }
            }
        }

        debug!("firewall chains ready");
        Ok(())
    }

    /// Installs a compiled policy. Re-applying the same policy first removes
    /// the range's rules, so the observable state is identical either way.
    pub fn apply_policy(
        &self,
        tracker: &OperationTracker,
        policy: &mut NetworkPolicy,
    ) -> Result<(), FirewallError> {
        if policy.compiled_rules.is_empty() {
            return Err(FirewallError::NotCompiled(policy.policy_id.clone()));
        }

        let _guard = self.lock();
        self.remove_tagged_rules(tracker, &policy.range_id)?;

        for rule in &policy.compiled_rules {
            let args = Self::rule_args(rule, &policy.range_id);
            let applied = self.run(tracker, args)?;
            if !applied.success {
                return Err(FirewallError::Apply {
                    rule: rule.to_string(),
                    detail: applied.stderr,
                });
            }
        }

        policy.applied = true;
        info!(
            policy_id = %policy.policy_id,
            rules = policy.compiled_rules.len(),
            "network policy applied"
        );
        Ok(())
    }

    /// Removes every rule tagged with `range_id`. Removing rules for an
    /// unknown range is a no-op.
    pub fn remove_range_rules(
        &self,
        tracker: &OperationTracker,
        range_id: &str,
    ) -> Result<usize, FirewallError> {
        let _guard = self.lock();
        self.remove_tagged_rules(tracker, range_id)
    }

    /// Flushes and deletes every managed chain, restoring the chains the
    /// host had before initialization.
    pub fn cleanup(&self, tracker: &OperationTracker) -> Result<(), FirewallError> {
        let _guard = self.lock();

        for chain in MANAGED_CHAINS {
            self.run(tracker, str_args(["-t", "filter", "-F", chain])).ok();
            for (main, custom) in CHAIN_LINKS {
                if custom == chain {
                    self.run(tracker, str_args(["-t", "filter", "-D", main, "-j", custom]))
                        .ok();
                }
            }
            self.run(tracker, str_args(["-t", "filter", "-X", chain])).ok();
        }
        info!("firewall chains removed");
        Ok(())
    }

    fn remove_tagged_rules(
        &self,
        tracker: &OperationTracker,
        range_id: &str,
    ) -> Result<usize, FirewallError> {
        let save_spec = if self.use_sudo {
            CommandSpec::new("sudo").args(["-n", "iptables-save", "-t", "filter"])
        } else {
            CommandSpec::new("iptables-save").args(["-t", "filter"])
        };
        let save_spec = save_spec.timeout(IPTABLES_TIMEOUT);
        let saved = self.executor.execute(tracker, &save_spec)?;
        if !saved.success {
            return Err(FirewallError::Remove {
                range_id: range_id.to_string(),
                detail: saved.stderr,
            });
        }

        // iptables-save quotes comment values, so the closing quote is the
        // boundary that keeps range `1` from matching range `10`.
        let tag = format!("\"cyris:{range_id}\"");
        let mut removed = 0;
        for line in saved.stdout.lines() {
            let Some(rest) = line.strip_prefix("-A ") else {
                continue;
            };
            let in_managed_chain = MANAGED_CHAINS
                .iter()
                .any(|chain| rest.starts_with(chain));
            if !in_managed_chain || !line.contains(&tag) {
                continue;
            }

            let mut args = vec!["-t".to_string(), "filter".to_string(), "-D".to_string()];
            args.extend(split_saved_rule(rest));
            let deleted = self.run(tracker, args)?;
            if deleted.success {
                removed += 1;
            } else {
                warn!(range_id, rule = rest, "failed to delete tagged rule");
            }
        }

        if removed > 0 {
            info!(range_id, removed, "removed tagged firewall rules");
        }
        Ok(removed)
    }

    /// iptables argument vector for one compiled rule, tagged with the
    /// owning range.
    fn rule_args(rule: &CompiledRule, range_id: &str) -> Vec<String> {
        let mut args = str_args(["-t", "filter", "-A", CHAIN_FORWARD]);
        if let Some(src) = &rule.src {
            args.extend(str_args(["-s", src]));
        }
        if let Some(dst) = &rule.dst {
            args.extend(str_args(["-d", dst]));
        }
        if let Some(protocol) = &rule.protocol {
            args.extend(str_args(["-p", &protocol.to_string()]));
        }
        if let Some(dport) = &rule.dport {
            let rendered = if dport.is_single() {
                dport.start.to_string()
            } else {
                format!("{}:{}", dport.start, dport.end)
            };
            args.extend(str_args(["--dport", &rendered]));
        }
        match rule.sports.len() {
            0 => {}
            1 => {
                let sport = &rule.sports[0];
                let rendered = if sport.is_single() {
                    sport.start.to_string()
                } else {
                    format!("{}:{}", sport.start, sport.end)
                };
                args.extend(str_args(["--sport", &rendered]));
            }
            _ => {
                let rendered: Vec<String> = rule
                    .sports
                    .iter()
                    .map(|sport| {
                        if sport.is_single() {
                            sport.start.to_string()
                        } else {
                            format!("{}:{}", sport.start, sport.end)
                        }
                    })
                    .collect();
                args.extend(str_args(["-m", "multiport", "--sports", &rendered.join(",")]));
            }
        }
        args.extend(str_args(["-m", "state", "--state", &rule.states.to_uppercase()]));
        args.extend(str_args([
            "-m",
            "comment",
            "--comment",
            &format!("cyris:{range_id}"),
        ]));
        args.extend(str_args(["-j", &rule.action.to_string()]));
        args
    }

    fn backup(&self, tracker: &OperationTracker) {
        let save_spec = if self.use_sudo {
            CommandSpec::new("sudo").args(["-n", "iptables-save"])
        } else {
            CommandSpec::new("iptables-save")
        };
        let save_spec = save_spec
            .timeout(IPTABLES_TIMEOUT)
            .context("Backup firewall state");

        match self.executor.execute(tracker, &save_spec) {
            Ok(result) if result.success => {
                if std::fs::create_dir_all(&self.backup_dir).is_ok() {
                    let path = self.backup_dir.join(format!(
                        "iptables_backup_{}.txt",
                        time::now().format("%Y%m%d_%H%M%S")
                    ));
                    if let Err(err) = std::fs::write(&path, result.stdout) {
                        warn!(path = %path.display(), %err, "could not write firewall backup");
                    }
                }
            }
            _ => warn!("iptables-save failed, continuing without backup"),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, ()> {
        self.mutation_lock
            .lock()
            .expect("firewall lock should not be poisoned")
    }
}

fn str_args<const N: usize>(args: [&str; N]) -> Vec<String> {
    args.into_iter().map(str::to_string).collect()
}

/// Splits one `iptables-save` rule body back into argv form, honoring the
/// double quotes iptables-save puts around comments.
fn split_saved_rule(rule: &str) -> Vec<String> {
    let mut args = Vec::new();
    let mut current = String::new();
    let mut in_quotes = false;
    for ch in rule.chars() {
        match ch {
            '"' => in_quotes = !in_quotes,
            ' ' if !in_quotes => {
                if !current.is_empty() {
                    args.push(std::mem::take(&mut current));
                }
            }
            _ => current.push(ch),
        }
    }
    if !current.is_empty() {
        args.push(current);
    }
    args
}
