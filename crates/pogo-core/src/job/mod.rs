//! Jobs: specs, state machines, and the controller
//!
//! A job is a command fanned out over the hosts its target expression
//! expands to. The job and each of its hosts run strictly acyclic state
//! machines persisted in the coordination store; the controller drives them
//! from an event queue.

pub mod controller;
pub mod events;
pub mod host;
pub mod spec;

pub use controller::{ControllerContext, HostCounts, JobController, JobHandle};
pub use events::JobEvent;
pub use host::{failure, HostRecord, HostState, TaskOutcome};
pub use spec::{
    HaltReason, JobRecord, JobSpec, JobState, JobStateRecord, DEFAULT_TIMEOUT_SECS,
};
