//! Process spawning substrate.
//!
//! Everything the system runs on the host (image toolkit, iptables, ssh,
//! scp, virsh fallbacks) goes through one executor so that every invocation
//! is safety-checked, bounded by a timeout and mirrored into the operation
//! tracker.

use std::io::{BufRead, BufReader};
use std::path::PathBuf;
use std::process::{Child, Command, Stdio};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crossbeam::channel::{unbounded, RecvTimeoutError};
use thiserror::Error;
use tracing::{debug, warn};

use crate::command::result::CommandResult;
use crate::command::safety::{SafetyError, SafetyValidator};
use crate::defaults;
use crate::operation::{OperationTracker, OperationType};
use crate::utils::cancel::CancelFlag;
use crate::utils::retry::retry_with_backoff;
use crate::utils::threads::spawn_named_thread;

const KILL_GRACE_PERIOD: Duration = Duration::from_secs(5);
const WAIT_POLL_INTERVAL: Duration = Duration::from_millis(50);
const DEFAULT_CAPTURE_LIMIT: usize = 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputStream {
    Stdout,
    Stderr,
}

#[derive(Debug, Clone)]
pub struct OutputLine {
    pub stream: OutputStream,
    pub line: String,
}

pub type OutputSink = Box<dyn FnMut(OutputLine) + Send>;

#[derive(Debug, Clone)]
pub struct CommandSpec {
    program: String,
    args: Vec<String>,
    timeout: Duration,
    cwd: Option<PathBuf>,
    envs: Vec<(String, String)>,
    log_context: Option<String>,
    capture_limit: usize,
}

impl CommandSpec {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            timeout: defaults::DEFAULT_COMMAND_TIMEOUT,
            cwd: None,
            envs: Vec::new(),
            log_context: None,
            capture_limit: DEFAULT_CAPTURE_LIMIT,
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn cwd(mut self, cwd: impl Into<PathBuf>) -> Self {
        self.cwd = Some(cwd.into());
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.envs.push((key.into(), value.into()));
        self
    }

    /// Context header echoed into the comprehensive log before the command.
    pub fn context(mut self, context: impl Into<String>) -> Self {
        self.log_context = Some(context.into());
        self
    }

    /// Caps how many captured bytes are kept per stream.
    pub fn capture_limit(mut self, limit: usize) -> Self {
        self.capture_limit = limit;
        self
    }

    pub fn log_context(&self) -> Option<&str> {
        self.log_context.as_deref()
    }

    /// Single-line rendering used for logging and safety validation.
    pub fn command_line(&self) -> String {
        let mut line = self.program.clone();
        for arg in &self.args {
            line.push(' ');
            if arg.contains(char::is_whitespace) {
                line.push('\'');
                line.push_str(arg);
                line.push('\'');
            } else {
                line.push_str(arg);
            }
        }
        line
    }
}

#[derive(Error, Debug)]
pub enum CommandError {
    #[error("failed to spawn `{command}`: {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },

    #[error("command `{command}` timed out after {seconds}s")]
    Timeout { command: String, seconds: u64 },

    #[error(transparent)]
    Refused(#[from] SafetyError),

    #[error("could not attach to `{0}` pipe")]
    Pipe(String),

    #[error("sudo required but no credential is available in non-interactive mode: {0}")]
    NonInteractive(String),

    #[error("cancelled before executing `{0}`")]
    Cancelled(String),
}

/// Seam over actual process spawning so components can be tested without
/// touching the host.
pub trait CommandRunner: Send + Sync {
    /// Runs to completion capturing both streams.
    fn run(&self, spec: &CommandSpec) -> Result<CommandResult, CommandError>;

    /// Runs with line-buffered output handed to `sink` as it arrives, in
    /// addition to being captured.
    fn run_streaming(
        &self,
        spec: &CommandSpec,
        sink: OutputSink,
    ) -> Result<CommandResult, CommandError>;

    /// Runs attached to the caller's terminal. Used for tools that need a
    /// real TTY, e.g. priming sudo credentials.
    fn run_interactive(&self, spec: &CommandSpec) -> Result<CommandResult, CommandError>;
}

#[derive(Default)]
pub struct SystemCommandRunner;

impl CommandRunner for SystemCommandRunner {
    fn run(&self, spec: &CommandSpec) -> Result<CommandResult, CommandError> {
        self.run_piped(spec, None)
    }

    fn run_streaming(
        &self,
        spec: &CommandSpec,
        sink: OutputSink,
    ) -> Result<CommandResult, CommandError> {
        self.run_piped(spec, Some(sink))
    }

    fn run_interactive(&self, spec: &CommandSpec) -> Result<CommandResult, CommandError> {
        let command_line = spec.command_line();
        let start = Instant::now();
        let mut child = Self::build_command(spec)
            .stdin(Stdio::inherit())
            .stdout(Stdio::inherit())
            .stderr(Stdio::inherit())
            .spawn()
            .map_err(|source| CommandError::Spawn {
                command: command_line.clone(),
                source,
            })?;

        let status = Self::wait_with_deadline(&mut child, spec.timeout).ok_or_else(|| {
            Self::terminate(&mut child, &command_line);
            CommandError::Timeout {
                command: command_line.clone(),
                seconds: spec.timeout.as_secs(),
            }
        })?;

        Ok(CommandResult::new(
            command_line,
            status_code(status),
            String::new(),
            String::new(),
            start.elapsed(),
        ))
    }
}

impl SystemCommandRunner {
    fn build_command(spec: &CommandSpec) -> Command {
        let mut command = Command::new(&spec.program);
        command.args(&spec.args);
        for (key, value) in &spec.envs {
            command.env(key, value);
        }
        if let Some(cwd) = &spec.cwd {
            command.current_dir(cwd);
        }
        command
    }

    fn run_piped(
        &self,
        spec: &CommandSpec,
        mut sink: Option<OutputSink>,
    ) -> Result<CommandResult, CommandError> {
        let command_line = spec.command_line();
        debug!(command = %command_line, "spawning");
        let start = Instant::now();

        let mut child = Self::build_command(spec)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|source| CommandError::Spawn {
                command: command_line.clone(),
                source,
            })?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| CommandError::Pipe("stdout".to_string()))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| CommandError::Pipe("stderr".to_string()))?;

        let (line_tx, line_rx) = unbounded::<OutputLine>();
        let stderr_tx = line_tx.clone();
        spawn_named_thread("cmd-stdout-reader", move || {
            for line in BufReader::new(stdout).lines().map_while(Result::ok) {
                if line_tx
                    .send(OutputLine {
                        stream: OutputStream::Stdout,
                        line,
                    })
                    .is_err()
                {
                    break;
                }
            }
        });
        spawn_named_thread("cmd-stderr-reader", move || {
            for line in BufReader::new(stderr).lines().map_while(Result::ok) {
                if stderr_tx
                    .send(OutputLine {
                        stream: OutputStream::Stderr,
                        line,
                    })
                    .is_err()
                {
                    break;
                }
            }
        });

        let deadline = start + spec.timeout;
        let mut captured_stdout = String::new();
        let mut captured_stderr = String::new();
        let mut exit_status = None;

        loop {
            while let Ok(output) = line_rx.try_recv() {
                Self::capture(
                    &output,
                    &mut captured_stdout,
                    &mut captured_stderr,
                    spec.capture_limit,
                );
                if let Some(sink) = sink.as_mut() {
                    sink(output);
                }
            }

            match child.try_wait() {
                Ok(Some(status)) => {
                    exit_status = Some(status);
                    break;
                }
                Ok(None) => {}
                Err(err) => {
                    warn!(command = %command_line, %err, "wait failed");
                    break;
                }
            }

            if Instant::now() >= deadline {
                Self::terminate(&mut child, &command_line);
                return Err(CommandError::Timeout {
                    command: command_line,
                    seconds: spec.timeout.as_secs(),
                });
            }

            // Park on the channel so reader threads can make progress.
            match line_rx.recv_timeout(WAIT_POLL_INTERVAL) {
                Ok(output) => {
                    Self::capture(
                        &output,
                        &mut captured_stdout,
                        &mut captured_stderr,
                        spec.capture_limit,
                    );
                    if let Some(sink) = sink.as_mut() {
                        sink(output);
                    }
                }
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => {
                    // Both readers are done; the child is about to exit.
                }
            }
        }

        // Drain whatever the readers still had buffered.
        while let Ok(output) = line_rx.recv_timeout(WAIT_POLL_INTERVAL) {
            Self::capture(
                &output,
                &mut captured_stdout,
                &mut captured_stderr,
                spec.capture_limit,
            );
            if let Some(sink) = sink.as_mut() {
                sink(output);
            }
        }

        let exit_code = exit_status.map(status_code).unwrap_or(-1);
        Ok(CommandResult::new(
            command_line,
            exit_code,
            captured_stdout,
            captured_stderr,
            start.elapsed(),
        ))
    }

    fn capture(output: &OutputLine, stdout: &mut String, stderr: &mut String, limit: usize) {
        let target = match output.stream {
            OutputStream::Stdout => stdout,
            OutputStream::Stderr => stderr,
        };
        if target.len() < limit {
            target.push_str(&output.line);
            target.push('\n');
        }
    }

    fn wait_with_deadline(child: &mut Child, timeout: Duration) -> Option<std::process::ExitStatus> {
        let deadline = Instant::now() + timeout;
        while Instant::now() < deadline {
            match child.try_wait() {
                Ok(Some(status)) => return Some(status),
                Ok(None) => std::thread::sleep(WAIT_POLL_INTERVAL),
                Err(_) => return None,
            }
        }
        None
    }

    /// SIGTERM first, SIGKILL after the grace period.
    fn terminate(child: &mut Child, command_line: &str) {
        use nix::sys::signal::{kill, Signal};
        use nix::unistd::Pid;

        let pid = Pid::from_raw(child.id() as i32);
        if let Err(err) = kill(pid, Signal::SIGTERM) {
            warn!(command = %command_line, %err, "SIGTERM failed, killing");
        }
        if Self::wait_with_deadline(child, KILL_GRACE_PERIOD).is_none() {
            if let Err(err) = child.kill() {
                warn!(command = %command_line, %err, "SIGKILL failed");
            }
            let _ = child.wait();
        }
    }
}

fn status_code(status: std::process::ExitStatus) -> i32 {
    // A None code means the child died from a signal.
    status.code().unwrap_or(-1)
}

/// Batch execution outcome.
pub struct BatchOutcome {
    pub results: Vec<CommandResult>,
    pub stopped_early: bool,
}

/// High-level executor: safety validation, tracker mirroring, retries and
/// batches over a [CommandRunner].
pub struct CommandExecutor {
    runner: Arc<dyn CommandRunner>,
    safety: SafetyValidator,
    cancel: CancelFlag,
}

impl CommandExecutor {
    pub fn new(runner: Arc<dyn CommandRunner>) -> Self {
        Self {
            runner,
            safety: SafetyValidator::new(),
            cancel: CancelFlag::new(),
        }
    }

    pub fn with_cancel_flag(mut self, cancel: CancelFlag) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn execute(
        &self,
        tracker: &OperationTracker,
        spec: &CommandSpec,
    ) -> Result<CommandResult, CommandError> {
        self.dispatch(tracker, spec, |runner, spec| runner.run(spec))
    }

    pub fn execute_streaming(
        &self,
        tracker: &OperationTracker,
        spec: &CommandSpec,
        sink: OutputSink,
    ) -> Result<CommandResult, CommandError> {
        let mut sink = Some(sink);
        self.dispatch(tracker, spec, move |runner, spec| {
            runner.run_streaming(spec, sink.take().expect("sink is consumed exactly once"))
        })
    }

    pub fn execute_interactive(
        &self,
        tracker: &OperationTracker,
        spec: &CommandSpec,
    ) -> Result<CommandResult, CommandError> {
        self.dispatch(tracker, spec, |runner, spec| runner.run_interactive(spec))
    }

    /// Retries failed commands (non-zero exit or timeout) with exponential
    /// backoff. `is_retryable` classifies failed results; timeouts are
    /// always considered retryable.
    pub fn execute_with_retry<C>(
        &self,
        tracker: &OperationTracker,
        spec: &CommandSpec,
        max_attempts: usize,
        initial_interval: Duration,
        is_retryable: C,
    ) -> Result<CommandResult, CommandError>
    where
        C: Fn(&CommandResult) -> bool,
    {
        #[allow(clippy::large_enum_variant)]
        enum Attempt {
            Unsuccessful(CommandResult),
            Error(CommandError),
        }

        let outcome = retry_with_backoff(
            max_attempts,
            initial_interval,
            |failure: &Attempt| match failure {
                Attempt::Unsuccessful(result) => is_retryable(result),
                Attempt::Error(CommandError::Timeout { .. }) => true,
                Attempt::Error(_) => false,
            },
            || match self.execute(tracker, spec) {
                Ok(result) if result.success => Ok(result),
                Ok(result) => Err(Attempt::Unsuccessful(result)),
                Err(err) => Err(Attempt::Error(err)),
            },
        );

        match outcome {
            Ok(result) => Ok(result),
            Err(Attempt::Unsuccessful(result)) => Ok(result),
            Err(Attempt::Error(err)) => Err(err),
        }
    }

    /// Runs a sequence of commands, optionally stopping at the first
    /// failure.
    pub fn execute_batch(
        &self,
        tracker: &OperationTracker,
        specs: &[CommandSpec],
        stop_on_failure: bool,
    ) -> BatchOutcome {
        let mut results = Vec::with_capacity(specs.len());
        for spec in specs {
            match self.execute(tracker, spec) {
                Ok(result) => {
                    let failed = !result.success;
                    results.push(result);
                    if failed && stop_on_failure {
                        return BatchOutcome {
                            results,
                            stopped_early: true,
                        };
                    }
                }
                Err(err) => {
                    warn!(%err, "batch command errored");
                    if stop_on_failure {
                        return BatchOutcome {
                            results,
                            stopped_early: true,
                        };
                    }
                }
            }
        }
        BatchOutcome {
            results,
            stopped_early: false,
        }
    }

    fn dispatch<F>(
        &self,
        tracker: &OperationTracker,
        spec: &CommandSpec,
        run: F,
    ) -> Result<CommandResult, CommandError>
    where
        F: FnOnce(&dyn CommandRunner, &CommandSpec) -> Result<CommandResult, CommandError>,
    {
        let command_line = spec.command_line();
        if self.cancel.is_cancelled() {
            return Err(CommandError::Cancelled(command_line));
        }

        let operation_id = tracker.start_operation(
            OperationType::CommandExecute,
            format!("Execute command: {command_line}"),
            None,
        );

        if let Err(refusal) = self.safety.validate(&command_line) {
            tracker
                .fail_operation(&operation_id, refusal.to_string())
                .ok();
            return Err(refusal.into());
        }

        match run(self.runner.as_ref(), spec) {
            Ok(result) => {
                tracker.record_command(
                    &operation_id,
                    &command_line,
                    Some(result.exit_code),
                    Some(if result.success {
                        &result.stdout
                    } else {
                        &result.stderr
                    }),
                    spec.log_context(),
                );
                if result.success {
                    tracker.complete_operation(&operation_id, None).ok();
                } else {
                    tracker
                        .fail_operation(
                            &operation_id,
                            format!("command failed with exit code {}", result.exit_code),
                        )
                        .ok();
                }
                Ok(result.with_operation_id(operation_id))
            }
            Err(err) => {
                tracker.record_command(
                    &operation_id,
                    &command_line,
                    None,
                    None,
                    spec.log_context(),
                );
                tracker.fail_operation(&operation_id, err.to_string()).ok();
                Err(err)
            }
        }
    }
}

////////////////////////////////////////////////////////////////////////////////////
// Test doubles
////////////////////////////////////////////////////////////////////////////////////
#[cfg(test)]
pub mod testing {
    use super::*;
    use std::sync::Mutex;

    /// Scripted runner: commands matching a substring return the canned
    /// exit code/stdout; everything else succeeds with empty output. All
    /// executed command lines are recorded for assertions.
    #[derive(Default)]
    pub struct FakeRunner {
        responses: Mutex<Vec<(String, i32, String)>>,
        recorded: Mutex<Vec<String>>,
    }

    impl FakeRunner {
        pub fn respond(self, needle: impl Into<String>, exit_code: i32, stdout: impl Into<String>) -> Self {
            self.responses
                .lock()
                .unwrap()
                .push((needle.into(), exit_code, stdout.into()));
            self
        }

        pub fn recorded(&self) -> Vec<String> {
            self.recorded.lock().unwrap().clone()
        }

        fn result_for(&self, command_line: &str) -> CommandResult {
            self.recorded
                .lock()
                .unwrap()
                .push(command_line.to_string());
            let responses = self.responses.lock().unwrap();
            for (needle, exit_code, stdout) in responses.iter() {
                if command_line.contains(needle.as_str()) {
                    return CommandResult::new(
                        command_line.to_string(),
                        *exit_code,
                        stdout.clone(),
                        if *exit_code == 0 {
                            String::new()
                        } else {
                            "scripted failure".to_string()
                        },
                        Duration::ZERO,
                    );
                }
            }
            CommandResult::new(
                command_line.to_string(),
                0,
                String::new(),
                String::new(),
                Duration::ZERO,
            )
        }
    }

    impl CommandRunner for FakeRunner {
        fn run(&self, spec: &CommandSpec) -> Result<CommandResult, CommandError> {
            Ok(self.result_for(&spec.command_line()))
        }

        fn run_streaming(
            &self,
            spec: &CommandSpec,
            mut sink: OutputSink,
        ) -> Result<CommandResult, CommandError> {
            let result = self.result_for(&spec.command_line());
            for line in result.stdout.lines() {
                sink(OutputLine {
                    stream: OutputStream::Stdout,
                    line: line.to_string(),
                });
            }
            Ok(result)
        }

        fn run_interactive(&self, spec: &CommandSpec) -> Result<CommandResult, CommandError> {
            Ok(self.result_for(&spec.command_line()))
        }
    }
}

////////////////////////////////////////////////////////////////////////////////////
// TESTS
////////////////////////////////////////////////////////////////////////////////////
#[cfg(test)]
mod tests {
    use super::testing::FakeRunner;
    use super::*;
    use assert_matches::assert_matches;
    use std::sync::Mutex;

    fn executor(runner: FakeRunner) -> (CommandExecutor, OperationTracker) {
        (
            CommandExecutor::new(Arc::new(runner)),
            OperationTracker::new("test"),
        )
    }

    #[test]
    fn test_successful_command_lands_in_tracker() {
        let (executor, tracker) = executor(FakeRunner::default().respond("virsh list", 0, "ok"));

        let result = executor
            .execute(&tracker, &CommandSpec::new("virsh").arg("list"))
            .unwrap();

        assert!(result.success);
        assert!(result.operation_id.is_some());
        assert!(tracker.is_all_successful());
        let ops = tracker.get_operations();
        assert_eq!(ops.len(), 1);
        assert_eq!(ops[0].command.as_deref(), Some("virsh list"));
    }

    #[test]
    fn test_failed_command_is_a_failed_operation() {
        let (executor, tracker) =
            executor(FakeRunner::default().respond("virt-builder", 1, ""));

        let result = executor
            .execute(&tracker, &CommandSpec::new("virt-builder").arg("nope"))
            .unwrap();

        assert!(!result.success);
        assert_eq!(tracker.get_failed_operations().len(), 1);
    }

    #[test]
    fn test_destructive_command_is_refused_and_recorded() {
        let (executor, tracker) = executor(FakeRunner::default());

        let err = executor
            .execute(&tracker, &CommandSpec::new("rm").args(["-rf", "/"]))
            .unwrap_err();

        assert_matches!(err, CommandError::Refused(_));
        assert_eq!(tracker.get_failed_operations().len(), 1);
    }

    #[test]
    fn test_cancelled_flag_short_circuits() {
        let cancel = CancelFlag::new();
        let executor =
            CommandExecutor::new(Arc::new(FakeRunner::default())).with_cancel_flag(cancel.clone());
        let tracker = OperationTracker::new("test");

        cancel.cancel();
        let err = executor
            .execute(&tracker, &CommandSpec::new("virsh").arg("list"))
            .unwrap_err();
        assert_matches!(err, CommandError::Cancelled(_));
    }

    #[test]
    fn test_retry_succeeds_after_transient_failures() {
        // FakeRunner matches first response entry; emulate transient
        // failure by counting attempts through the recorded log.
        struct Flaky {
            attempts: Mutex<usize>,
        }
        impl CommandRunner for Flaky {
            fn run(&self, spec: &CommandSpec) -> Result<CommandResult, CommandError> {
                let mut attempts = self.attempts.lock().unwrap();
                *attempts += 1;
                let exit_code = if *attempts < 3 { 1 } else { 0 };
                Ok(CommandResult::new(
                    spec.command_line(),
                    exit_code,
                    String::new(),
                    String::new(),
                    Duration::ZERO,
                ))
            }
            fn run_streaming(
                &self,
                spec: &CommandSpec,
                _sink: OutputSink,
            ) -> Result<CommandResult, CommandError> {
                self.run(spec)
            }
            fn run_interactive(&self, spec: &CommandSpec) -> Result<CommandResult, CommandError> {
                self.run(spec)
            }
        }

        let executor = CommandExecutor::new(Arc::new(Flaky {
            attempts: Mutex::new(0),
        }));
        let tracker = OperationTracker::new("test");

        let result = executor
            .execute_with_retry(
                &tracker,
                &CommandSpec::new("apt-get").args(["install", "-y", "wireshark"]),
                3,
                Duration::from_millis(1),
                |_| true,
            )
            .unwrap();

        assert!(result.success);
        // Two failed attempts plus the final success were all tracked.
        assert_eq!(tracker.get_operations().len(), 3);
    }

    #[test]
    fn test_batch_stops_on_failure_when_asked() {
        let (executor, tracker) = executor(FakeRunner::default().respond("step-two", 1, ""));
        let specs = vec![
            CommandSpec::new("echo").arg("step-one"),
            CommandSpec::new("echo").arg("step-two"),
            CommandSpec::new("echo").arg("step-three"),
        ];

        let outcome = executor.execute_batch(&tracker, &specs, true);
        assert!(outcome.stopped_early);
        assert_eq!(outcome.results.len(), 2);

        let outcome = executor.execute_batch(&tracker, &specs, false);
        assert!(!outcome.stopped_early);
        assert_eq!(outcome.results.len(), 3);
    }

    #[test]
    fn test_streaming_sink_receives_lines() {
        let (executor, tracker) =
            executor(FakeRunner::default().respond("build", 0, "line one\nline two"));
        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen_clone = Arc::clone(&seen);

        executor
            .execute_streaming(
                &tracker,
                &CommandSpec::new("virt-builder").arg("build"),
                Box::new(move |output| {
                    seen_clone.lock().unwrap().push(output.line);
                }),
            )
            .unwrap();

        assert_eq!(*seen.lock().unwrap(), vec!["line one", "line two"]);
    }

    #[test]
    fn test_real_runner_captures_output() {
        let runner = SystemCommandRunner;
        let result = runner
            .run(&CommandSpec::new("echo").arg("hello range"))
            .unwrap();
        assert!(result.success);
        assert_eq!(result.stdout.trim(), "hello range");
    }

    #[test]
    fn test_real_runner_times_out() {
        let runner = SystemCommandRunner;
        let err = runner
            .run(
                &CommandSpec::new("sleep")
                    .arg("5")
                    .timeout(Duration::from_millis(100)),
            )
            .unwrap_err();
        assert_matches!(err, CommandError::Timeout { .. });
    }
}
