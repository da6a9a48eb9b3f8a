//! Per-range ledger of atomic operations.
//!
//! Every external effect performed while driving a range (hypervisor calls,
//! shell commands, SSH tasks) is recorded here with a terminal
//! success/failure verdict and an optional rollback hook. The orchestrator
//! walks the ledger newest-first to undo partial work.

use std::fmt::{self, Display, Formatter};
use std::fs::OpenOptions;
use std::io::Write;
use std::path::PathBuf;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, error, warn};

use crate::utils::time;

pub type OperationId = String;

pub type RollbackFn = Box<dyn FnOnce() -> Result<(), String> + Send>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationType {
    VmCreate,
    VmDestroy,
    VmStart,
    VmStop,
    SshExecute,
    NetworkSetup,
    TaskExecute,
    FileCopy,
    UserCreate,
    ParallelOperation,
    CommandExecute,
    SystemOperation,
}

impl Display for OperationType {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        let name = match self {
            OperationType::VmCreate => "vm_create",
            OperationType::VmDestroy => "vm_destroy",
            OperationType::VmStart => "vm_start",
            OperationType::VmStop => "vm_stop",
            OperationType::SshExecute => "ssh_execute",
            OperationType::NetworkSetup => "network_setup",
            OperationType::TaskExecute => "task_execute",
            OperationType::FileCopy => "file_copy",
            OperationType::UserCreate => "user_create",
            OperationType::ParallelOperation => "parallel_operation",
            OperationType::CommandExecute => "command_execute",
            OperationType::SystemOperation => "system_operation",
        };
        write!(f, "{name}")
    }
}

#[derive(Error, Debug, PartialEq)]
pub enum TrackerError {
    #[error("operation `{0}` not found")]
    NotFound(OperationId),

    #[error("operation `{0}` already reached a terminal state")]
    AlreadyTerminal(OperationId),
}

/// Snapshot of one ledger entry. Rollback hooks are not part of the
/// snapshot; they stay inside the tracker.
#[derive(Debug, Clone, Serialize)]
pub struct AtomicOperation {
    pub operation_id: OperationId,
    pub operation_type: OperationType,
    pub description: String,
    pub success: bool,
    pub terminal: bool,
    pub error_message: Option<String>,
    pub result: Option<serde_json::Value>,
    pub command: Option<String>,
    pub exit_code: Option<i32>,
    pub output: Option<String>,
    pub timestamp: DateTime<Utc>,
    pub audit_trail: Vec<String>,
}

impl AtomicOperation {
    /// Legacy-style exit code: 0 for success, the recorded code (or 1)
    /// otherwise.
    pub fn legacy_exit_code(&self) -> i32 {
        if self.success {
            self.exit_code.unwrap_or(0)
        } else {
            self.exit_code.unwrap_or(1)
        }
    }
}

struct Entry {
    record: AtomicOperation,
    rollback: Option<RollbackFn>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum CreationStatus {
    #[serde(rename = "SUCCESS")]
    Success,
    #[serde(rename = "FAILURE")]
    Failure,
}

impl Display for CreationStatus {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            CreationStatus::Success => write!(f, "SUCCESS"),
            CreationStatus::Failure => write!(f, "FAILURE"),
        }
    }
}

/// Aggregate verdict over the whole ledger.
#[derive(Debug, Clone, Serialize)]
pub struct ComprehensiveStatus {
    pub overall_success: bool,
    pub fail_count: usize,
    pub total_operations: usize,
    pub successful_operations: usize,
    pub failed_operations: usize,
    pub response_list: Vec<i32>,
    pub creation_status: CreationStatus,
}

struct TrackerState {
    operations: Vec<Entry>,
    counter: u64,
    comprehensive_log_file: Option<PathBuf>,
}

/// Ledger of atomic operations for a single range.
///
/// One tracker exists per create/destroy request and is passed down as a
/// handle; nothing here is process-global.
pub struct OperationTracker {
    scope: String,
    state: Mutex<TrackerState>,
}

impl OperationTracker {
    pub fn new(scope: impl Into<String>) -> Self {
        Self {
            scope: scope.into(),
            state: Mutex::new(TrackerState {
                operations: Vec::new(),
                counter: 0,
                comprehensive_log_file: None,
            }),
        }
    }

    /// The range id this ledger belongs to.
    pub fn scope(&self) -> &str {
        &self.scope
    }

    pub fn start_operation(
        &self,
        operation_type: OperationType,
        description: impl Into<String>,
        rollback: Option<RollbackFn>,
    ) -> OperationId {
        let mut state = self.lock();
        state.counter += 1;
        let operation_id = format!("{}_{}", operation_type, state.counter);

        let record = AtomicOperation {
            operation_id: operation_id.clone(),
            operation_type,
            description: description.into(),
            success: false,
            terminal: false,
            error_message: None,
            result: None,
            command: None,
            exit_code: None,
            output: None,
            timestamp: time::now(),
            audit_trail: Vec::new(),
        };
        debug!(scope = %self.scope, operation_id, "operation started");
        state.operations.push(Entry {
            record,
            rollback,
        });
        operation_id
    }

    pub fn complete_operation(
        &self,
        operation_id: &str,
        result: Option<serde_json::Value>,
    ) -> Result<(), TrackerError> {
        self.finish(operation_id, |record| {
            record.success = true;
            record.result = result;
            record
                .audit_trail
                .push(audit_line("operation completed successfully"));
        })
    }

    pub fn fail_operation(
        &self,
        operation_id: &str,
        error_message: impl Into<String>,
    ) -> Result<(), TrackerError> {
        let error_message = error_message.into();
        self.finish(operation_id, |record| {
            record.success = false;
            record
                .audit_trail
                .push(audit_line(&format!("operation failed: {error_message}")));
            record.error_message = Some(error_message);
        })
    }

    /// Attaches the executed command line and its outcome to an operation.
    /// Used by the command executor to mirror every invocation.
    pub fn record_command(
        &self,
        operation_id: &str,
        command: &str,
        exit_code: Option<i32>,
        output: Option<&str>,
        log_context: Option<&str>,
    ) {
        let mut state = self.lock();
        if let Some(context) = log_context {
            Self::append_log(&state.comprehensive_log_file, &format!("\n-- {context}:"));
            Self::append_log(&state.comprehensive_log_file, command);
            Self::append_log(&state.comprehensive_log_file, "");
        }
        if let Some(entry) = state
            .operations
            .iter_mut()
            .find(|entry| entry.record.operation_id == operation_id)
        {
            entry.record.command = Some(command.to_string());
            entry.record.exit_code = exit_code;
            entry.record.output = output.map(str::to_string);
            entry
                .record
                .audit_trail
                .push(audit_line(&format!("command set: {command}")));
        }
    }

    pub fn is_all_successful(&self) -> bool {
        self.lock()
            .operations
            .iter()
            .all(|entry| entry.record.success)
    }

    pub fn get_failed_operations(&self) -> Vec<AtomicOperation> {
        self.lock()
            .operations
            .iter()
            .filter(|entry| !entry.record.success)
            .map(|entry| entry.record.clone())
            .collect()
    }

    pub fn get_successful_operations(&self) -> Vec<AtomicOperation> {
        self.lock()
            .operations
            .iter()
            .filter(|entry| entry.record.success)
            .map(|entry| entry.record.clone())
            .collect()
    }

    pub fn get_operations(&self) -> Vec<AtomicOperation> {
        self.lock()
            .operations
            .iter()
            .map(|entry| entry.record.clone())
            .collect()
    }

    /// Rolls back every operation with a hook, newest first. Hook errors are
    /// logged and never propagated so one failing rollback cannot block the
    /// rest. Returns the number of successful rollbacks.
    pub fn rollback_all_operations(&self) -> usize {
        let hooks = self.take_rollbacks(|_| true);
        self.run_rollbacks(hooks)
    }

    /// Rolls back failed operations only, newest first.
    pub fn rollback_failed_operations(&self) -> usize {
        let hooks = self.take_rollbacks(|record| !record.success);
        self.run_rollbacks(hooks)
    }

    pub fn clear(&self) {
        let mut state = self.lock();
        state.operations.clear();
        state.counter = 0;
    }

    pub fn get_summary_report(&self) -> String {
        let state = self.lock();
        let total = state.operations.len();
        let successful = state
            .operations
            .iter()
            .filter(|entry| entry.record.success)
            .count();
        let failed = total - successful;

        let mut report = String::from("Operation Summary:\n");
        report.push_str(&format!("  Total operations: {total}\n"));
        report.push_str(&format!("  Successful: {successful}\n"));
        report.push_str(&format!("  Failed: {failed}\n"));

        if failed > 0 {
            report.push_str("\nFailed Operations:\n");
            for entry in state.operations.iter().filter(|e| !e.record.success) {
                report.push_str(&format!(
                    "  - {}: {}\n",
                    entry.record.description,
                    entry
                        .record
                        .error_message
                        .as_deref()
                        .unwrap_or("no terminal verdict recorded")
                ));
            }
        }
        report
    }

    pub fn get_comprehensive_status(&self) -> ComprehensiveStatus {
        let state = self.lock();
        let total = state.operations.len();
        let successful = state
            .operations
            .iter()
            .filter(|entry| entry.record.success)
            .count();
        let failed = total - successful;
        let response_list = state
            .operations
            .iter()
            .map(|entry| entry.record.legacy_exit_code())
            .collect();

        ComprehensiveStatus {
            overall_success: failed == 0,
            fail_count: failed,
            total_operations: total,
            successful_operations: successful,
            failed_operations: failed,
            response_list,
            creation_status: if failed == 0 {
                CreationStatus::Success
            } else {
                CreationStatus::Failure
            },
        }
    }

    pub fn set_comprehensive_log_file(&self, log_file: PathBuf) {
        self.lock().comprehensive_log_file = Some(log_file);
    }

    /// Appends one line to the comprehensive log, if configured.
    pub fn log_line(&self, line: &str) {
        let state = self.lock();
        Self::append_log(&state.comprehensive_log_file, line);
    }

    fn finish<F>(&self, operation_id: &str, apply: F) -> Result<(), TrackerError>
    where
        F: FnOnce(&mut AtomicOperation),
    {
        let mut state = self.lock();
        let entry = state
            .operations
            .iter_mut()
            .find(|entry| entry.record.operation_id == operation_id)
            .ok_or_else(|| TrackerError::NotFound(operation_id.to_string()))?;
        if entry.record.terminal {
            return Err(TrackerError::AlreadyTerminal(operation_id.to_string()));
        }
        apply(&mut entry.record);
        entry.record.terminal = true;
        entry.record.timestamp = time::now();
        Ok(())
    }

    fn take_rollbacks<P>(&self, predicate: P) -> Vec<(OperationId, RollbackFn)>
    where
        P: Fn(&AtomicOperation) -> bool,
    {
        let mut state = self.lock();
        let mut hooks = Vec::new();
        // Newest-first (LIFO) so teardown mirrors creation order.
        for entry in state.operations.iter_mut().rev() {
            if predicate(&entry.record) {
                if let Some(hook) = entry.rollback.take() {
                    hooks.push((entry.record.operation_id.clone(), hook));
                }
            }
        }
        hooks
    }

    fn run_rollbacks(&self, hooks: Vec<(OperationId, RollbackFn)>) -> usize {
        let mut rolled_back = 0;
        for (operation_id, hook) in hooks {
            match hook() {
                Ok(()) => {
                    debug!(scope = %self.scope, operation_id, "rollback succeeded");
                    rolled_back += 1;
                }
                Err(err) => {
                    error!(scope = %self.scope, operation_id, %err, "rollback failed");
                }
            }
        }
        rolled_back
    }

    fn append_log(log_file: &Option<PathBuf>, line: &str) {
        let Some(path) = log_file else { return };
        let result = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .and_then(|mut file| writeln!(file, "{line}"));
        if let Err(err) = result {
            warn!(path = %path.display(), %err, "failed to write comprehensive log");
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, TrackerState> {
        self.state
            .lock()
            .expect("tracker lock should not be poisoned")
    }
}

fn audit_line(entry: &str) -> String {
    format!("[{}] {entry}", time::now().format("%H:%M:%S"))
}
