//! Task identity and execution state.
//!
//! A Task is the logical unit of work known to the Task Management service;
//! a TaskExecution is one supervised run of it.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Status of a Task Execution, as reported to the service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ExecutionStatus {
    /// Attached to an execution that was started manually at the service
    ManuallyStarted,
    /// Actively executing
    Running,
    /// Child exited with code 0 and no retries remain
    Succeeded,
    /// Child failed on every allowed attempt
    Failed,
    /// Killed by the supervisor after the process timeout expired
    TerminatedAfterTimeOut,
    /// The service marked the execution done while the child was running
    MarkedDone,
    /// A stop was requested (server or OS signal) and is in progress
    Stopping,
    /// The child was reaped after a stop request
    Stopped,
    /// The child exited after the service marked the execution done
    ExitedAfterMarkedDone,
    /// The supervisor gave up without a definite outcome
    Abandoned,
}

impl ExecutionStatus {
    /// Whether this status ends the execution.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ExecutionStatus::Succeeded
                | ExecutionStatus::Failed
                | ExecutionStatus::TerminatedAfterTimeOut
                | ExecutionStatus::Stopped
                | ExecutionStatus::ExitedAfterMarkedDone
                | ExecutionStatus::Abandoned
        )
    }

    /// Whether this execution may transition to `to`.
    pub fn can_transition_to(&self, to: ExecutionStatus) -> bool {
        use ExecutionStatus::*;
        match (self, to) {
            (ManuallyStarted, Running) => true,
            (Running, Succeeded | Failed | TerminatedAfterTimeOut) => true,
            (Running, Stopping | MarkedDone) => true,
            // Registration failures surface before RUNNING
            (ManuallyStarted, Failed | Abandoned) => true,
            (Stopping, Stopped) => true,
            (MarkedDone, ExitedAfterMarkedDone) => true,
            // A stop request can interrupt any non-terminal state
            (ManuallyStarted | MarkedDone, Stopping) => true,
            (from, to) if *from == to => true,
            (from, _) if from.is_terminal() => false,
            _ => false,
        }
    }
}

impl std::fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Display matches the wire form
        let s = serde_json::to_string(self).map_err(|_| std::fmt::Error)?;
        write!(f, "{}", s.trim_matches('"'))
    }
}

/// The logical Task this invocation runs. Immutable after registration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TaskIdentity {
    /// Task name (this or the UUID must be set in online mode)
    pub name: Option<String>,
    /// Task UUID, if already known to the service
    pub uuid: Option<String>,
    /// Numeric version of the Task's source code
    pub version_number: Option<i64>,
    /// Human readable version
    pub version_text: Option<String>,
    /// Version signature, such as a commit hash
    pub version_signature: Option<String>,
    /// Additional metadata about this Task instance
    pub instance_metadata: Option<HashMap<String, Value>>,
    /// The Task runs indefinitely
    pub is_service: bool,
    /// The service only records history, it does not schedule or manage
    pub is_passive: bool,
    /// Maximum concurrent executions allowed for this Task
    pub max_concurrency: Option<i64>,
    /// Execution schedule reported to the service
    pub schedule: Option<String>,
    /// Create the Task at the service if it is not known there
    pub auto_create: bool,
    /// Run Environment name used when auto-creating
    pub run_environment_name: Option<String>,
    /// Run Environment UUID used when auto-creating
    pub run_environment_uuid: Option<String>,
    /// Additional properties of the auto-created Task
    pub auto_create_props: Option<Value>,
    /// Execution that built this Task's source code
    pub build_task_execution_uuid: Option<String>,
    /// Execution that deployed this Task
    pub deployment_task_execution_uuid: Option<String>,
}

impl TaskIdentity {
    /// Human-readable label for log and status lines.
    pub fn label(&self) -> &str {
        self.name
            .as_deref()
            .or(self.uuid.as_deref())
            .unwrap_or("[unnamed]")
    }

    /// A service with a positive concurrency cap gets tighter heartbeat and
    /// conflict-retry defaults.
    pub fn is_concurrency_limited_service(&self) -> bool {
        self.is_service && self.max_concurrency.map(|m| m > 0).unwrap_or(false)
    }
}

/// Counters merged from status updates and reported with heartbeats.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusCounters {
    pub success_count: Option<i64>,
    pub error_count: Option<i64>,
    pub skipped_count: Option<i64>,
    pub expected_count: Option<i64>,
}

impl StatusCounters {
    /// Merge an incoming counter snapshot. Counters are monotone, so each
    /// field keeps the maximum of the two values.
    pub fn merge_max(&mut self, other: &StatusCounters) {
        fn max_opt(a: Option<i64>, b: Option<i64>) -> Option<i64> {
            match (a, b) {
                (Some(x), Some(y)) => Some(x.max(y)),
                (x, None) => x,
                (None, y) => y,
            }
        }
        self.success_count = max_opt(self.success_count, other.success_count);
        self.error_count = max_opt(self.error_count, other.error_count);
        self.skipped_count = max_opt(self.skipped_count, other.skipped_count);
        self.expected_count = max_opt(self.expected_count, other.expected_count);
    }

    pub fn is_empty(&self) -> bool {
        self.success_count.is_none()
            && self.error_count.is_none()
            && self.skipped_count.is_none()
            && self.expected_count.is_none()
    }
}

/// One supervised run of a Task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskExecution {
    /// Execution UUID, possibly assigned by the server at registration
    pub uuid: Option<String>,
    /// Current status
    pub status: ExecutionStatus,
    /// When the first attempt started
    pub started_at: Option<DateTime<Utc>>,
    /// When the execution finished
    pub finished_at: Option<DateTime<Utc>>,
    /// Exit code of the last child attempt
    pub exit_code: Option<i32>,
    /// Process id of the current child
    pub pid: Option<u32>,
    /// Hostname of the machine running the supervisor
    pub hostname: Option<String>,
    /// When the last heartbeat was sent to the service
    pub last_heartbeat_at: Option<DateTime<Utc>>,
    /// When the wrapped application last reported its own heartbeat
    pub last_app_heartbeat_at: Option<DateTime<Utc>>,
    /// Counters merged from status updates
    pub counters: StatusCounters,
    /// Most recent status message from the wrapped application
    pub last_status_message: Option<String>,
    /// Number of failed attempts so far
    pub failed_attempts: u32,
    /// Number of timed-out attempts so far
    pub timed_out_attempts: u32,
    /// Input value passed to the child
    pub input_value: Option<Value>,
    /// Result value read back after a successful run
    pub result_value: Option<Value>,
}

impl Default for TaskExecution {
    fn default() -> Self {
        Self {
            uuid: None,
            status: ExecutionStatus::Running,
            started_at: None,
            finished_at: None,
            exit_code: None,
            pid: None,
            hostname: None,
            last_heartbeat_at: None,
            last_app_heartbeat_at: None,
            counters: StatusCounters::default(),
            last_status_message: None,
            failed_attempts: 0,
            timed_out_attempts: 0,
            input_value: None,
            result_value: None,
        }
    }
}
