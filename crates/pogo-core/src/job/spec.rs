//! Job specification, job state machine, and persisted records

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::namespace::Cap;
use crate::{Error, JobId, Result};

/// Default per-host timeout in seconds
pub const DEFAULT_TIMEOUT_SECS: u64 = 300;

fn default_timeout() -> u64 {
    DEFAULT_TIMEOUT_SECS
}

/// User-submitted job specification
///
/// The password is held in memory only: it is skipped on serialization so
/// the record persisted to the coordination store never contains it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobSpec {
    /// Submitting user
    pub user: String,

    /// Account the command runs as on the remote host
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub run_as: Option<String>,

    /// Command line to execute
    pub command: String,

    /// Original target expression
    pub target: String,

    /// Namespace supplying hosts, tags, and constraints
    pub namespace: String,

    /// Per-host timeout (seconds)
    #[serde(default = "default_timeout")]
    pub timeout: u64,

    /// Whole-job wall-clock timeout (seconds)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub job_timeout: Option<u64>,

    /// Job-wide concurrency cap
    #[serde(default)]
    pub concurrent: Cap,

    /// Secret delivered to workers, never persisted or logged
    #[serde(default, skip_serializing)]
    pub password: Option<String>,
}

impl JobSpec {
    /// Validate the spec before a job is created
    pub fn validate(&self) -> Result<()> {
        if self.user.is_empty() {
            return Err(Error::invalid_spec("user must not be empty"));
        }
        if self.command.is_empty() {
            return Err(Error::invalid_spec("command must not be empty"));
        }
        if self.target.is_empty() {
            return Err(Error::invalid_spec("target must not be empty"));
        }
        if self.namespace.is_empty() {
            return Err(Error::invalid_spec("namespace must not be empty"));
        }
        if self.timeout == 0 {
            return Err(Error::invalid_spec("timeout must be >= 1 second"));
        }
        if let Some(job_timeout) = self.job_timeout {
            if job_timeout == 0 {
                return Err(Error::invalid_spec("job_timeout must be >= 1 second"));
            }
        }
        self.concurrent.validate().map_err(Error::invalid_spec)?;
        Ok(())
    }
}

/// Job lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    /// Target expansion in progress
    Gathering,

    /// Created, before the first scheduling tick
    Pending,

    /// At least one host is non-terminal
    Running,

    /// Stopped by user action, timeout, or failure; no new dispatches
    Halted,

    /// Every host terminal and the job was not halted
    Finished,
}

impl Default for JobState {
    fn default() -> Self {
        JobState::Gathering
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JobState::Gathering => write!(f, "gathering"),
            JobState::Pending => write!(f, "pending"),
            JobState::Running => write!(f, "running"),
            JobState::Halted => write!(f, "halted"),
            JobState::Finished => write!(f, "finished"),
        }
    }
}

impl JobState {
    /// Check if state is terminal
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobState::Halted | JobState::Finished)
    }

    /// Check whether a transition is legal
    pub fn can_transition_to(&self, new_state: JobState) -> bool {
        use JobState::*;

        match (self, new_state) {
            (Gathering, Pending) => true,
            (Gathering, Halted) => true,
            (Pending, Running) => true,
            (Pending, Halted) => true,
            (Running, Halted) => true,
            (Running, Finished) => true,
            _ => false,
        }
    }
}

/// Why a job halted
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HaltReason {
    /// A user issued halt
    UserHalt,

    /// The whole-job timer expired
    Timeout,

    /// The dispatcher gave up on the job
    Failed,
}

impl fmt::Display for HaltReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HaltReason::UserHalt => write!(f, "user_halt"),
            HaltReason::Timeout => write!(f, "timeout"),
            HaltReason::Failed => write!(f, "failed"),
        }
    }
}

/// State document persisted at `/pogo/jobs/<jobid>/state`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobStateRecord {
    /// Current state
    pub state: JobState,

    /// Halt cause, set when state is halted
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub halt_reason: Option<HaltReason>,

    /// Aggregate exit status, set at termination (0 = every host finished)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exit_status: Option<i32>,

    /// When the job started
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_ts: Option<i64>,

    /// Last update timestamp
    pub updated_ts: i64,
}

impl JobStateRecord {
    /// Fresh record in gathering
    pub fn new() -> Self {
        Self {
            state: JobState::Gathering,
            halt_reason: None,
            exit_status: None,
            start_ts: None,
            updated_ts: chrono::Utc::now().timestamp(),
        }
    }

    /// Apply a transition; terminal states are never re-entered or left
    pub fn transition(&mut self, new_state: JobState) -> bool {
        if !self.state.can_transition_to(new_state) {
            return false;
        }
        let now = chrono::Utc::now().timestamp();
        if new_state == JobState::Running && self.start_ts.is_none() {
            self.start_ts = Some(now);
        }
        self.state = new_state;
        self.updated_ts = now;
        true
    }

    /// Halt with a recorded reason
    pub fn halt(&mut self, reason: HaltReason) -> bool {
        if !self.transition(JobState::Halted) {
            return false;
        }
        self.halt_reason = Some(reason);
        true
    }

    /// Human-readable state, with the halt cause when halted
    pub fn display_state(&self) -> String {
        match (self.state, self.halt_reason) {
            (JobState::Halted, Some(reason)) => format!("halted({})", reason),
            (state, _) => state.to_string(),
        }
    }
}

impl Default for JobStateRecord {
    fn default() -> Self {
        Self::new()
    }
}

/// Combined spec + state summary returned by `jobinfo` and `listjobs`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobRecord {
    /// Job identifier
    pub jobid: JobId,

    /// Flattened spec (password never present)
    #[serde(flatten)]
    pub spec: JobSpec,

    /// Flattened state document
    #[serde(flatten)]
    pub state: JobStateRecord,
}

impl JobRecord {
    /// Combine the persisted spec and state documents
    pub fn new(jobid: JobId, spec: JobSpec, state: JobStateRecord) -> Self {
        Self { jobid, spec, state }
    }
}
