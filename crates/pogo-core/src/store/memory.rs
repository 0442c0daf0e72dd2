//! In-memory coordination store
//!
//! Implements the full store contract in process memory: versioned nodes,
//! per-parent sequential counters, ephemerals tied to session handles, and
//! one-shot watches. Used by tests and single-node deployments; crash/
//! failover behavior is simulated by expiring a session.

use super::{
    split_path, CoordinationStore, CreateFlags, StoreError, StoreResult, Version, Watch,
    WatchEvent, WatchKind,
};
use async_trait::async_trait;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::{Arc, Mutex};
use tokio::sync::oneshot;
use uuid::Uuid;

struct Node {
    data: Vec<u8>,
    version: Version,
    ephemeral_owner: Option<String>,
}

struct WatchEntry {
    path: String,
    kind: WatchKind,
    tx: oneshot::Sender<WatchEvent>,
}

#[derive(Default)]
struct Shared {
    nodes: BTreeMap<String, Node>,
    counters: HashMap<String, u64>,
    watches: Vec<WatchEntry>,
}

/// Process-local store; clones share state, sessions are per-handle
#[derive(Clone)]
pub struct MemoryStore {
    shared: Arc<Mutex<Shared>>,
    session: String,
}

impl MemoryStore {
    /// Create an empty store with a fresh session
    pub fn new() -> Self {
        Self {
            shared: Arc::new(Mutex::new(Shared::default())),
            session: format!("mem-{}", Uuid::new_v4()),
        }
    }

    /// A handle onto the same tree with its own session
    pub fn fork_session(&self) -> Self {
        Self {
            shared: self.shared.clone(),
            session: format!("mem-{}", Uuid::new_v4()),
        }
    }

    /// Drop every ephemeral a session owns, as a real store would on expiry
    pub fn expire_session(&self, session: &str) {
        let mut shared = self.shared.lock().unwrap();
        let doomed: Vec<String> = shared
            .nodes
            .iter()
            .filter(|(_, node)| node.ephemeral_owner.as_deref() == Some(session))
            .map(|(path, _)| path.clone())
            .collect();
        for path in doomed {
            shared.nodes.remove(&path);
            fire(&mut shared, &path, Change::Deleted);
        }
    }

    /// Snapshot of every node's data, for store-scan assertions in tests
    pub fn dump(&self) -> Vec<(String, Vec<u8>)> {
        let shared = self.shared.lock().unwrap();
        shared
            .nodes
            .iter()
            .map(|(path, node)| (path.clone(), node.data.clone()))
            .collect()
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

enum Change {
    Created,
    Data,
    Deleted,
}

/// Fire and prune watches affected by a change at `path`
fn fire(shared: &mut Shared, path: &str, change: Change) {
    let (parent, _) = split_path(path);
    let watches = std::mem::take(&mut shared.watches);
    let mut kept = Vec::with_capacity(watches.len());

    for entry in watches {
        let hit = match (&change, entry.kind) {
            (Change::Created, WatchKind::Exists) => entry.path == path,
            (Change::Created, WatchKind::Children) => entry.path == parent,
            (Change::Data, WatchKind::Data) => entry.path == path,
            (Change::Data, WatchKind::Exists) => entry.path == path,
            (Change::Deleted, WatchKind::Data) => entry.path == path,
            (Change::Deleted, WatchKind::Exists) => entry.path == path,
            (Change::Deleted, WatchKind::Children) => entry.path == parent,
            _ => false,
        };
        if hit {
            // Receiver may be gone; either way the one-shot is spent
            let _ = entry.tx.send(WatchEvent {
                path: entry.path,
                kind: entry.kind,
            });
        } else if !entry.tx.is_closed() {
            kept.push(entry);
        }
    }

    shared.watches = kept;
}

#[async_trait]
impl CoordinationStore for MemoryStore {
    async fn create(&self, path: &str, data: &[u8], flags: CreateFlags) -> StoreResult<String> {
        let mut shared = self.shared.lock().unwrap();

        let actual = if flags.sequential {
            let counter = shared.counters.entry(path.to_string()).or_insert(0);
            *counter += 1;
            format!("{}{:010}", path, counter)
        } else {
            path.to_string()
        };

        if shared.nodes.contains_key(&actual) {
            return Err(StoreError::AlreadyExists(actual));
        }

        shared.nodes.insert(
            actual.clone(),
            Node {
                data: data.to_vec(),
                version: 0,
                ephemeral_owner: flags.ephemeral.then(|| self.session.clone()),
            },
        );
        fire(&mut shared, &actual, Change::Created);

        Ok(actual)
    }

    async fn get(&self, path: &str) -> StoreResult<(Vec<u8>, Version)> {
        let shared = self.shared.lock().unwrap();
        let node = shared
            .nodes
            .get(path)
            .ok_or_else(|| StoreError::NotFound(path.to_string()))?;
        Ok((node.data.clone(), node.version))
    }

    async fn set(&self, path: &str, data: &[u8], expected: Version) -> StoreResult<Version> {
        let mut shared = self.shared.lock().unwrap();
        let node = shared
            .nodes
            .get_mut(path)
            .ok_or_else(|| StoreError::NotFound(path.to_string()))?;
        if expected != super::ANY_VERSION && expected != node.version {
            return Err(StoreError::Conflict {
                path: path.to_string(),
                expected,
                actual: node.version,
            });
        }
        node.data = data.to_vec();
        node.version += 1;
        let new_version = node.version;
        fire(&mut shared, path, Change::Data);
        Ok(new_version)
    }

    async fn delete(&self, path: &str, expected: Version) -> StoreResult<()> {
        let mut shared = self.shared.lock().unwrap();
        let node = shared
            .nodes
            .get(path)
            .ok_or_else(|| StoreError::NotFound(path.to_string()))?;
        if expected != super::ANY_VERSION && expected != node.version {
            return Err(StoreError::Conflict {
                path: path.to_string(),
                expected,
                actual: node.version,
            });
        }
        shared.nodes.remove(path);
        fire(&mut shared, path, Change::Deleted);
        Ok(())
    }

    async fn children(&self, path: &str) -> StoreResult<Vec<String>> {
        let shared = self.shared.lock().unwrap();
        let prefix = format!("{}/", path);
        let mut names: BTreeSet<String> = BTreeSet::new();
        for node_path in shared.nodes.keys() {
            if let Some(rest) = node_path.strip_prefix(&prefix) {
                if let Some(name) = rest.split('/').next() {
                    if !name.is_empty() {
                        names.insert(name.to_string());
                    }
                }
            }
        }
        Ok(names.into_iter().collect())
    }

    async fn watch(&self, path: &str, kind: WatchKind) -> StoreResult<Watch> {
        let (tx, rx) = oneshot::channel();
        let mut shared = self.shared.lock().unwrap();
        shared.watches.push(WatchEntry {
            path: path.to_string(),
            kind,
            tx,
        });
        Ok(Watch::new(rx))
    }

    fn session_id(&self) -> &str {
        &self.session
    }
}
