use chrono::{DateTime, Utc};
use serde::Serialize;
use std::time::Duration;

use crate::operation::OperationId;
use crate::utils::time;

/// Outcome of one external process invocation.
#[derive(Debug, Clone, Serialize)]
pub struct CommandResult {
    pub command: String,
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
    #[serde(skip)]
    pub execution_time: Duration,
    pub operation_id: Option<OperationId>,
    pub success: bool,
    pub timestamp: DateTime<Utc>,
}

impl CommandResult {
    pub fn new(
        command: String,
        exit_code: i32,
        stdout: String,
        stderr: String,
        execution_time: Duration,
    ) -> Self {
        Self {
            command,
            exit_code,
            stdout,
            stderr,
            execution_time,
            operation_id: None,
            success: exit_code == 0,
            timestamp: time::now(),
        }
    }

    pub fn with_operation_id(mut self, operation_id: OperationId) -> Self {
        self.operation_id = Some(operation_id);
        self
    }
}
