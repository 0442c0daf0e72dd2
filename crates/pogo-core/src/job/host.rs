//! Per-host state machine and records

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::JobId;

/// Host execution state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HostState {
    /// Waiting for sequence predecessors
    Waiting,

    /// Eligible to run, not yet admitted by the scheduler
    Ready,

    /// Dispatched to a worker
    Running,

    /// Worker reported exit 0
    Finished,

    /// Non-zero exit, timeout, cancellation, or worker loss
    Failed,

    /// Predecessor failed and the namespace policy skips dependents
    Skipped,

    /// No reachable transition can ever run this host
    Deadlocked,
}

impl Default for HostState {
    fn default() -> Self {
        HostState::Waiting
    }
}

impl fmt::Display for HostState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HostState::Waiting => write!(f, "waiting"),
            HostState::Ready => write!(f, "ready"),
            HostState::Running => write!(f, "running"),
            HostState::Finished => write!(f, "finished"),
            HostState::Failed => write!(f, "failed"),
            HostState::Skipped => write!(f, "skipped"),
            HostState::Deadlocked => write!(f, "deadlocked"),
        }
    }
}

impl HostState {
    /// Check if state is terminal (won't change without an explicit retry)
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            HostState::Finished | HostState::Failed | HostState::Skipped | HostState::Deadlocked
        )
    }

    /// Check if state counts as a terminal failure for sequencing
    pub fn is_terminal_failure(&self) -> bool {
        matches!(
            self,
            HostState::Failed | HostState::Skipped | HostState::Deadlocked
        )
    }

    /// Check if state can be reset to waiting by `retry`
    pub fn is_retryable(&self) -> bool {
        self.is_terminal_failure()
    }

    /// Check whether a forward transition is legal
    ///
    /// Terminal states admit no transitions here; `retry` is the only reset
    /// path and goes through [`HostRecord::reset_for_retry`].
    pub fn can_transition_to(&self, new_state: HostState) -> bool {
        use HostState::*;

        match (self, new_state) {
            (Waiting, Ready) => true,
            (Waiting, Deadlocked) => true,
            // A halted job drives hosts that never ran straight to failed
            (Waiting, Failed) => true,
            (Ready, Running) => true,
            (Ready, Skipped) => true,
            (Ready, Failed) => true,
            (Running, Finished) => true,
            (Running, Failed) => true,
            _ => false,
        }
    }
}

/// Why a host ended up failed
pub mod failure {
    pub const TIMEOUT: &str = "timeout";
    pub const JOB_TIMEOUT: &str = "job_timeout";
    pub const WORKER_LOST: &str = "worker_lost";
    pub const CANCELLED: &str = "cancelled";
    pub const ABANDONED: &str = "abandoned";
}

/// Final outcome of one dispatch attempt, as seen by the controller
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskOutcome {
    /// Worker returned a result
    Completed {
        exit_code: i32,
        message: Option<String>,
        duration_ms: Option<u64>,
    },

    /// Worker session dropped past the reconnect grace window
    WorkerLost,

    /// Per-host timer expired
    Timeout,

    /// Whole-job timer expired
    JobTimeout,

    /// Cancelled by halt before the worker reported
    Cancelled,

    /// Worker never answered the cancel within the safety window
    Abandoned,
}

impl TaskOutcome {
    /// The host state this outcome lands in
    pub fn final_state(&self) -> HostState {
        match self {
            TaskOutcome::Completed { exit_code: 0, .. } => HostState::Finished,
            _ => HostState::Failed,
        }
    }

    /// Exit code to record, if the worker reported one
    pub fn exit_code(&self) -> Option<i32> {
        match self {
            TaskOutcome::Completed { exit_code, .. } => Some(*exit_code),
            _ => None,
        }
    }

    /// Message to record on the host
    pub fn message(&self) -> Option<String> {
        match self {
            TaskOutcome::Completed { message, .. } => message.clone(),
            TaskOutcome::WorkerLost => Some(failure::WORKER_LOST.to_string()),
            TaskOutcome::Timeout => Some(failure::TIMEOUT.to_string()),
            TaskOutcome::JobTimeout => Some(failure::JOB_TIMEOUT.to_string()),
            TaskOutcome::Cancelled => Some(failure::CANCELLED.to_string()),
            TaskOutcome::Abandoned => Some(failure::ABANDONED.to_string()),
        }
    }
}

/// Persistent record for one host of one job
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HostRecord {
    /// Owning job
    pub jobid: JobId,

    /// Hostname
    pub hostname: String,

    /// Current state
    #[serde(default)]
    pub state: HostState,

    /// Worker that handled the last attempt, if any
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub worker: Option<String>,

    /// Exit code from the last attempt
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,

    /// Failure reason or worker message from the last attempt
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,

    /// When the host entered running
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_ts: Option<i64>,

    /// When the host reached a terminal state
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_ts: Option<i64>,
}

impl HostRecord {
    /// Create a fresh waiting record
    pub fn new(jobid: JobId, hostname: impl Into<String>) -> Self {
        Self {
            jobid,
            hostname: hostname.into(),
            state: HostState::Waiting,
            worker: None,
            exit_code: None,
            message: None,
            start_ts: None,
            end_ts: None,
        }
    }

    /// Apply a forward transition, updating timestamps
    pub fn transition(&mut self, new_state: HostState) -> bool {
        if !self.state.can_transition_to(new_state) {
            return false;
        }
        let now = chrono::Utc::now().timestamp();
        if new_state == HostState::Running {
            self.start_ts = Some(now);
        }
        if new_state.is_terminal() {
            // end_ts >= start_ts when both are set
            self.end_ts = Some(self.start_ts.map_or(now, |s| now.max(s)));
        }
        self.state = new_state;
        true
    }

    /// Mark running on a worker
    pub fn mark_running(&mut self, worker: impl Into<String>) -> bool {
        if !self.transition(HostState::Running) {
            return false;
        }
        self.worker = Some(worker.into());
        true
    }

    /// Record a task outcome
    pub fn record_outcome(&mut self, outcome: &TaskOutcome) -> bool {
        let target = outcome.final_state();
        if !self.transition(target) {
            return false;
        }
        self.exit_code = outcome.exit_code();
        self.message = outcome.message();
        true
    }

    /// Reset a failed/skipped/deadlocked host back to waiting for `retry`
    pub fn reset_for_retry(&mut self) -> bool {
        if !self.state.is_retryable() {
            return false;
        }
        self.state = HostState::Waiting;
        self.worker = None;
        self.exit_code = None;
        self.message = None;
        self.start_ts = None;
        self.end_ts = None;
        true
    }
}
