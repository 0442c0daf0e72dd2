pub mod config;
pub mod dispatcher;
pub mod error;
pub mod job;
pub mod jobid;
pub mod namespace;
pub mod scheduler;
pub mod store;
pub mod target;
pub mod worker;

// Re-export commonly used types
pub use config::{Config, StoreBackend};
pub use dispatcher::{Dispatcher, DispatcherStats, JobInfo, JobStatusPage, ListFilters, PING_RESPONSE};
pub use error::{Error, Result};
pub use job::{
    HaltReason, HostCounts, HostRecord, HostState, JobEvent, JobRecord, JobSpec, JobState,
    JobStateRecord, TaskOutcome,
};
pub use jobid::JobId;
pub use namespace::{Cap, ConstraintRule, Namespace, PredecessorFailurePolicy, TagSelector};
pub use scheduler::{plan_tick, TickContext, TickPlan};
pub use store::{CoordinationStore, MemoryStore, RedisStore, RetryingStore, StoreError};
pub use target::{expand, TargetError};
pub use worker::{SecretVault, TaskSink, WorkerPool};

/// Current version of pogo
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version_available() {
        assert!(!VERSION.is_empty());
    }

    #[test]
    fn test_error_creation() {
        let err = Error::invalid_spec("bad target");
        assert_eq!(err.status_code(), 400);
        assert_eq!(err.kind(), "InvalidSpec");
    }
}
