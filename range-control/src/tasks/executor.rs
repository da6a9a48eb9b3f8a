//! Post-boot task execution over SSH.
//!
//! Build-time account tasks belong to the image builder; everything that
//! reaches this executor runs against a booted, reachable guest. One task
//! failure does not abort the guest's remaining tasks; the orchestrator
//! aggregates the report and decides based on the strictness setting.

use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tracing::{info, warn};

use crate::command::{CommandExecutor, CommandResult, CommandSpec};
use crate::defaults;
use crate::operation::{OperationTracker, OperationType};
use crate::tasks::kinds::TaskKind;
use crate::utils::net::probe_tcp;

const SSH_OPTIONS: [&str; 4] = [
    "-o",
    "StrictHostKeyChecking=no",
    "-o",
    "ConnectTimeout=10",
];
const OUTPUT_CAP: usize = 64 * 1024;

#[derive(Error, Debug)]
pub enum TaskError {
    #[error("guest `{guest_id}` at {ip} is not reachable over SSH")]
    Unreachable { guest_id: String, ip: String },

    #[error("{failed} of {total} tasks failed for guest `{guest_id}`")]
    StrictFailure {
        guest_id: String,
        failed: usize,
        total: usize,
    },
}

/// Where and how to reach one guest.
#[derive(Debug, Clone)]
pub struct TaskTarget {
    pub guest_id: String,
    pub ip: String,
    pub ssh_user: String,
    pub windows: bool,
}

#[derive(Debug, Clone)]
pub struct TaskOutcome {
    pub kind: String,
    pub success: bool,
    pub detail: String,
}

/// Aggregated per-guest task results.
#[derive(Debug, Clone, Default)]
pub struct TaskReport {
    pub guest_id: String,
    pub outcomes: Vec<TaskOutcome>,
}

impl TaskReport {
    pub fn failed_count(&self) -> usize {
        self.outcomes.iter().filter(|o| !o.success).count()
    }

    pub fn all_successful(&self) -> bool {
        self.failed_count() == 0
    }
}

pub struct TaskExecutor {
    executor: Arc<CommandExecutor>,
    strict: bool,
}

impl TaskExecutor {
    pub fn new(executor: Arc<CommandExecutor>) -> Self {
        Self {
            executor,
            strict: false,
        }
    }

    pub fn with_strict(mut self, strict: bool) -> Self {
        self.strict = strict;
        self
    }

    /// Blocks until the guest answers on port 22 or the timeout elapses.
    pub fn wait_until_reachable(&self, target: &TaskTarget, timeout: Duration) -> bool {
        let deadline = std::time::Instant::now() + timeout;
        loop {
            if probe_tcp(&target.ip, defaults::SSH_PORT, defaults::SSH_PROBE_TIMEOUT) {
                return true;
            }
            if std::time::Instant::now() >= deadline {
                return false;
            }
            std::thread::sleep(Duration::from_secs(2));
        }
    }

    /// Runs the given tasks in declaration order. The caller decides which
    /// tasks reach this executor: on the kvm-auto path account tasks were
    /// already applied to the disk and are filtered out, on the kvm path
    /// they run here over SSH.
    pub fn execute_tasks(
        &self,
        tracker: &OperationTracker,
        target: &TaskTarget,
        tasks: &[TaskKind],
    ) -> Result<TaskReport, TaskError> {
        let mut report = TaskReport {
            guest_id: target.guest_id.clone(),
            ..Default::default()
        };

        for task in tasks {
            let outcome = self.execute_one(tracker, target, task);
            if !outcome.success {
                warn!(
                    guest = %target.guest_id,
                    kind = %outcome.kind,
                    detail = %outcome.detail,
                    "task failed"
                );
            }
            report.outcomes.push(outcome);
        }

        info!(
            guest = %target.guest_id,
            total = report.outcomes.len(),
            failed = report.failed_count(),
            "task execution finished"
        );

        if self.strict && !report.all_successful() {
            return Err(TaskError::StrictFailure {
                guest_id: target.guest_id.clone(),
                failed: report.failed_count(),
                total: report.outcomes.len(),
            });
        }
        Ok(report)
    }

    fn execute_one(
        &self,
        tracker: &OperationTracker,
        target: &TaskTarget,
        task: &TaskKind,
    ) -> TaskOutcome {
        let operation_type = match task {
            TaskKind::AddAccount { .. } | TaskKind::ModifyAccount { .. } => {
                OperationType::UserCreate
            }
            TaskKind::CopyContent { .. } => OperationType::FileCopy,
            _ => OperationType::TaskExecute,
        };
        let operation_id = tracker.start_operation(
            operation_type,
            format!("Task {} on guest {}", task.kind_name(), target.guest_id),
            None,
        );

        let result = match task {
            TaskKind::AddAccount { account, passwd } => {
                self.account_add(tracker, target, account, passwd)
            }
            TaskKind::ModifyAccount {
                account,
                new_passwd,
                new_account,
            } => self.account_modify(tracker, target, account, new_passwd, new_account),
            TaskKind::InstallPackage {
                package_manager,
                name,
                version,
            } => self.install_package(tracker, target, package_manager, name, version),
            TaskKind::CopyContent { src, dst } => self.copy_content(tracker, target, src, dst),
            TaskKind::ExecuteProgram {
                program,
                interpreter,
                args,
            } => self.execute_program(tracker, target, program, interpreter, args),
            TaskKind::EmulateAttack {
                attack_type,
                target_account,
                attempt_number,
            } => self.emulate_attack(tracker, target, attack_type, target_account, attempt_number),
            TaskKind::EmulateMalware { name, mode } => {
                self.emulate_malware(tracker, target, name, mode)
            }
            TaskKind::FirewallRules { rule_file } => {
                self.apply_firewall_rules(tracker, target, rule_file)
            }
            TaskKind::Unknown { kind } => {
                let detail = format!("unknown task kind `{kind}`");
                tracker.fail_operation(&operation_id, &detail).ok();
                return TaskOutcome {
                    kind: kind.clone(),
                    success: false,
                    detail,
                };
            }
        };

        let outcome = match result {
            Ok(result) if result.success => {
                tracker.complete_operation(&operation_id, None).ok();
                TaskOutcome {
                    kind: task.kind_name().to_string(),
                    success: true,
                    detail: String::new(),
                }
            }
            Ok(result) => {
                let detail = if result.stderr.is_empty() {
                    format!("exit code {}", result.exit_code)
                } else {
                    result.stderr.trim().to_string()
                };
                tracker.fail_operation(&operation_id, &detail).ok();
                TaskOutcome {
                    kind: task.kind_name().to_string(),
                    success: false,
                    detail,
                }
            }
            Err(err) => {
                let detail = err.to_string();
                tracker.fail_operation(&operation_id, &detail).ok();
                TaskOutcome {
                    kind: task.kind_name().to_string(),
                    success: false,
                    detail,
                }
            }
        };
        outcome
    }

    fn ssh_spec(&self, target: &TaskTarget, remote_command: &str) -> CommandSpec {
        CommandSpec::new("ssh")
            .args(SSH_OPTIONS)
            .arg(format!("{}@{}", target.ssh_user, target.ip))
            .arg(remote_command)
            .timeout(defaults::TASK_TIMEOUT)
            .capture_limit(OUTPUT_CAP)
    }

    fn ssh(
        &self,
        tracker: &OperationTracker,
        target: &TaskTarget,
        remote_command: &str,
        context: &str,
    ) -> Result<CommandResult, crate::command::CommandError> {
        self.executor
            .execute(tracker, &self.ssh_spec(target, remote_command).context(context))
    }

    fn account_add(
        &self,
        tracker: &OperationTracker,
        target: &TaskTarget,
        account: &str,
        passwd: &str,
    ) -> Result<CommandResult, crate::command::CommandError> {
        let remote = if target.windows {
            format!("net user {account} {passwd} /ADD && net localgroup Users {account} /ADD")
        } else {
            format!("useradd -m {account} && echo '{account}:{passwd}' | chpasswd")
        };
        self.ssh(tracker, target, &remote, "Add guest account")
    }

    fn account_modify(
        &self,
        tracker: &OperationTracker,
        target: &TaskTarget,
        account: &str,
        new_passwd: &Option<String>,
        new_account: &Option<String>,
    ) -> Result<CommandResult, crate::command::CommandError> {
        let mut parts = Vec::new();
        if let Some(new_account) = new_account {
            if target.windows {
                parts.push(format!("wmic useraccount where name='{account}' rename {new_account}"));
            } else {
                parts.push(format!("usermod -l {new_account} {account}"));
            }
        }
        let effective = new_account.as_deref().unwrap_or(account);
        if let Some(new_passwd) = new_passwd {
            if target.windows {
                parts.push(format!("net user {effective} {new_passwd}"));
            } else {
                parts.push(format!("echo '{effective}:{new_passwd}' | chpasswd"));
            }
        }
        let remote = parts.join(" && ");
        self.ssh(tracker, target, &remote, "Modify guest account")
    }

    /// One retry on transient failures; package mirrors flake.
    fn install_package(
        &self,
        tracker: &OperationTracker,
        target: &TaskTarget,
        package_manager: &str,
        name: &str,
        version: &Option<String>,
    ) -> Result<CommandResult, crate::command::CommandError> {
        let package = match version {
            Some(version) => format!("{name}={version}"),
            None => name.to_string(),
        };
        let remote = format!("{package_manager} install -y {package}");
        self.executor.execute_with_retry(
            tracker,
            &self
                .ssh_spec(target, &remote)
                .context("Install guest package"),
            2,
            Duration::from_secs(5),
            |_| true,
        )
    }

    /// scp then verify arrival with a checksum round-trip.
    fn copy_content(
        &self,
        tracker: &OperationTracker,
        target: &TaskTarget,
        src: &str,
        dst: &str,
    ) -> Result<CommandResult, crate::command::CommandError> {
        let copied = self.executor.execute(
            tracker,
            &CommandSpec::new("scp")
                .args(SSH_OPTIONS)
                .arg(src)
                .arg(format!("{}@{}:{}", target.ssh_user, target.ip, dst))
                .timeout(defaults::TASK_TIMEOUT)
                .context("Copy content to guest"),
        )?;
        if !copied.success {
            return Ok(copied);
        }

        let local = self.executor.execute(
            tracker,
            &CommandSpec::new("sha256sum")
                .arg(src)
                .timeout(Duration::from_secs(60)),
        )?;
        let remote = self.ssh(
            tracker,
            target,
            &format!("sha256sum {dst}"),
            "Verify copied content",
        )?;

        let local_sum = local.stdout.split_whitespace().next().unwrap_or("");
        let remote_sum = remote.stdout.split_whitespace().next().unwrap_or("-");
        if local.success && remote.success && local_sum == remote_sum {
            Ok(copied)
        } else {
            Ok(CommandResult::new(
                copied.command,
                1,
                String::new(),
                format!("checksum mismatch after copy: `{local_sum}` != `{remote_sum}`"),
                copied.execution_time,
            ))
        }
    }

    fn execute_program(
        &self,
        tracker: &OperationTracker,
        target: &TaskTarget,
        program: &str,
        interpreter: &Option<String>,
        args: &Option<String>,
    ) -> Result<CommandResult, crate::command::CommandError> {
        let mut remote = match interpreter {
            Some(interpreter) => format!("{interpreter} {program}"),
            None => program.to_string(),
        };
        if let Some(args) = args {
            remote.push(' ');
            remote.push_str(args);
        }
        self.ssh(tracker, target, &remote, "Execute guest program")
    }

    /// Attack emulation runs from the host against the guest through a
    /// named helper on the operator's PATH.
    fn emulate_attack(
        &self,
        tracker: &OperationTracker,
        target: &TaskTarget,
        attack_type: &str,
        target_account: &Option<String>,
        attempt_number: &Option<u32>,
    ) -> Result<CommandResult, crate::command::CommandError> {
        let mut spec = CommandSpec::new(format!("cyris-emulate-{attack_type}"))
            .arg(&target.ip)
            .timeout(defaults::TASK_TIMEOUT)
            .context("Emulate attack");
        if let Some(account) = target_account {
            spec = spec.arg(account);
        }
        if let Some(attempts) = attempt_number {
            spec = spec.arg(attempts.to_string());
        }
        self.executor.execute(tracker, &spec)
    }

    fn emulate_malware(
        &self,
        tracker: &OperationTracker,
        target: &TaskTarget,
        name: &str,
        mode: &Option<String>,
    ) -> Result<CommandResult, crate::command::CommandError> {
        let mut spec = CommandSpec::new("cyris-emulate-malware")
            .arg(&target.ip)
            .arg(name)
            .timeout(defaults::TASK_TIMEOUT)
            .context("Emulate malware");
        if let Some(mode) = mode {
            spec = spec.arg(mode);
        }
        self.executor.execute(tracker, &spec)
    }

    /// Stages the rule file on the guest and loads it atomically.
    fn apply_firewall_rules(
        &self,
        tracker: &OperationTracker,
        target: &TaskTarget,
        rule_file: &str,
    ) -> Result<CommandResult, crate::command::CommandError> {
        let staged = "/tmp/cyris-guest-rules.v4";
        let copied = self.executor.execute(
            tracker,
            &CommandSpec::new("scp")
                .args(SSH_OPTIONS)
                .arg(rule_file)
                .arg(format!("{}@{}:{staged}", target.ssh_user, target.ip))
                .timeout(defaults::TASK_TIMEOUT)
                .context("Stage guest firewall rules"),
        )?;
        if !copied.success {
            return Ok(copied);
        }
        self.ssh(
            tracker,
            target,
            &format!("iptables-restore < {staged}"),
            "Apply guest firewall rules",
        )
    }
}
