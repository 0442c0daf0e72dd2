//! Coordination store abstraction
//!
//! The store is a hierarchical, watchable KV service: atomic create/set/
//! delete with versions, sequential and ephemeral nodes, one-shot watches,
//! and sessions that own ephemerals. It is the single source of truth for
//! job and host state and provides cross-dispatcher mutual exclusion.
//!
//! Two backends ship here: [`MemoryStore`] (tests and single-node use) and
//! [`RedisStore`] (production). [`RetryingStore`] wraps either with the
//! backoff/replay policy, and the typed views in [`views`] give the rest of
//! the core a record-level API with CAS semantics.

pub mod memory;
pub mod paths;
pub mod redis;
pub mod retry;
pub mod views;

pub use self::memory::MemoryStore;
pub use self::redis::{RedisConfig, RedisStore};
pub use self::retry::{RetryPolicy, RetryingStore, WatchHub};
pub use self::views::{HostView, JobView, NamespaceView, MAX_CAS_ATTEMPTS};

use async_trait::async_trait;
use tokio::sync::oneshot;

/// Store result type alias
pub type StoreResult<T> = Result<T, StoreError>;

/// Node version number
pub type Version = u64;

/// Sentinel version matching any current version (unconditional set/delete)
pub const ANY_VERSION: Version = u64::MAX;

/// Store-specific error types
#[derive(Debug, Clone, thiserror::Error)]
pub enum StoreError {
    #[error("store unavailable: {0}")]
    Unavailable(String),

    #[error("version conflict on {path}: expected {expected}, actual {actual}")]
    Conflict {
        path: String,
        expected: Version,
        actual: Version,
    },

    #[error("node not found: {0}")]
    NotFound(String),

    #[error("node already exists: {0}")]
    AlreadyExists(String),

    #[error("session expired: {0}")]
    SessionExpired(String),

    #[error("serialization error: {0}")]
    Serialization(String),
}

impl From<StoreError> for crate::Error {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::Unavailable(msg) => crate::Error::StoreUnavailable(msg),
            StoreError::Conflict { path, .. } => crate::Error::CasConflict(path),
            StoreError::SessionExpired(msg) => crate::Error::StoreUnavailable(msg),
            other => crate::Error::Internal(other.to_string()),
        }
    }
}

/// Node creation flags
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CreateFlags {
    /// Append a monotonic zero-padded counter (scoped to the parent) to the path
    pub sequential: bool,

    /// Tie the node to the creating session; it evaporates on session loss
    pub ephemeral: bool,
}

impl CreateFlags {
    /// Plain durable node
    pub const NONE: CreateFlags = CreateFlags {
        sequential: false,
        ephemeral: false,
    };

    /// Sequential durable node
    pub const SEQUENTIAL: CreateFlags = CreateFlags {
        sequential: true,
        ephemeral: false,
    };

    /// Ephemeral node
    pub const EPHEMERAL: CreateFlags = CreateFlags {
        sequential: false,
        ephemeral: true,
    };

    /// Sequential ephemeral node (lock records)
    pub const SEQUENTIAL_EPHEMERAL: CreateFlags = CreateFlags {
        sequential: true,
        ephemeral: true,
    };
}

/// What a watch waits for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WatchKind {
    /// Node data changed or node deleted
    Data,

    /// Direct child created or deleted
    Children,

    /// Node created, changed, or deleted
    Exists,
}

/// Notification delivered by a fired watch
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatchEvent {
    /// Path the watch was armed on
    pub path: String,

    /// Kind of watch that fired
    pub kind: WatchKind,
}

/// One-shot watch handle
///
/// Dropping the handle cancels the watch; the backend prunes the dead
/// registration on the next event for the path.
pub struct Watch {
    rx: oneshot::Receiver<WatchEvent>,
}

impl Watch {
    /// Wrap a receiver
    pub fn new(rx: oneshot::Receiver<WatchEvent>) -> Self {
        Self { rx }
    }

    /// Wait for the notification; `None` when the backend went away
    pub async fn wait(self) -> Option<WatchEvent> {
        self.rx.await.ok()
    }
}

/// Contract required from the coordination store
#[async_trait]
pub trait CoordinationStore: Send + Sync {
    /// Create a node; returns the actual path (with the sequential suffix)
    async fn create(&self, path: &str, data: &[u8], flags: CreateFlags) -> StoreResult<String>;

    /// Read a node's data and version
    async fn get(&self, path: &str) -> StoreResult<(Vec<u8>, Version)>;

    /// Compare-and-set a node's data; returns the new version
    async fn set(&self, path: &str, data: &[u8], expected: Version) -> StoreResult<Version>;

    /// Compare-and-delete a node
    async fn delete(&self, path: &str, expected: Version) -> StoreResult<()>;

    /// Names of direct children, sorted
    async fn children(&self, path: &str) -> StoreResult<Vec<String>>;

    /// Arm a one-shot watch
    async fn watch(&self, path: &str, kind: WatchKind) -> StoreResult<Watch>;

    /// Identifier of this store session; ephemerals die with it
    fn session_id(&self) -> &str;
}

/// Split a path into parent and leaf name
pub(crate) fn split_path(path: &str) -> (&str, &str) {
    match path.rfind('/') {
        Some(idx) => (&path[..idx], &path[idx + 1..]),
        None => ("", path),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_split_path() {
        assert_eq!(split_path("/pogo/jobs/p0000000001"), ("/pogo/jobs", "p0000000001"));
        assert_eq!(split_path("plain"), ("", "plain"));
    }

    #[test]
    fn test_flags() {
        assert!(CreateFlags::SEQUENTIAL_EPHEMERAL.sequential);
        assert!(CreateFlags::SEQUENTIAL_EPHEMERAL.ephemeral);
        assert!(!CreateFlags::NONE.sequential);
    }
}
