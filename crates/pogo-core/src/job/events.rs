//! Job controller event queue
//!
//! Everything that happens to a job arrives as an event on its queue and is
//! processed in strict FIFO order by the controller task. Timers and worker
//! callbacks enqueue events rather than mutating state directly.

use crate::job::{HaltReason, TaskOutcome};
use crate::worker::ReqId;

/// One event on a job's queue
#[derive(Debug, Clone)]
pub enum JobEvent {
    /// Begin scheduling (idempotent once past pending)
    Start,

    /// Re-evaluate readiness and admission
    Tick,

    /// Stop the job
    Halt { reason: HaltReason },

    /// Reset failed/skipped/deadlocked hosts back to waiting
    Retry { hosts: Vec<String> },

    /// Worker accepted a dispatch
    TaskAccepted { hostname: String, req_id: ReqId },

    /// Worker reported progress
    TaskProgress {
        hostname: String,
        req_id: ReqId,
        output_url: Option<String>,
    },

    /// A dispatch attempt reached an outcome
    TaskFinished {
        hostname: String,
        req_id: ReqId,
        outcome: TaskOutcome,
    },

    /// Per-host timer expired
    HostTimeout { hostname: String, req_id: ReqId },

    /// Safety timer after a cancel; the worker never answered
    AbandonDeadline { hostname: String, req_id: ReqId },

    /// Whole-job timer expired
    JobTimeout,
}
