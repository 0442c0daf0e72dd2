//! Redis-backed coordination store
//!
//! Production backend for the store contract. Node data and versions live in
//! hashes, children in sets, sequential counters in plain counters. Every
//! mutation runs as a Lua script so version checks are atomic, and publishes
//! a change event that a router task fans out to armed watches. Sessions are
//! TTL keys refreshed by a heartbeat task; a sweeper deletes the ephemerals
//! of sessions whose TTL lapsed, which is what makes locks evaporate when a
//! dispatcher crashes.

use super::{
    split_path, CoordinationStore, CreateFlags, StoreError, StoreResult, Version, Watch,
    WatchEvent, WatchKind,
};
use async_trait::async_trait;
use futures::StreamExt;
use redis::aio::ConnectionManager;
use redis::{Client, Script};
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::oneshot;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Redis connection configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RedisConfig {
    /// Redis URL
    #[serde(default = "default_url")]
    pub url: String,

    /// Session TTL in milliseconds; ephemerals outlive heartbeats this long
    #[serde(default = "default_session_timeout_ms")]
    pub session_timeout_ms: u64,
}

fn default_url() -> String {
    "redis://127.0.0.1:6379".to_string()
}

fn default_session_timeout_ms() -> u64 {
    30_000
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            url: default_url(),
            session_timeout_ms: default_session_timeout_ms(),
        }
    }
}

const EVENTS_CHANNEL: &str = "pogo:events";

/// Change notification published on every mutation
#[derive(Debug, Clone, Serialize, Deserialize)]
struct ChangeEvent {
    path: String,
    change: String,
}

const CHANGE_CREATED: &str = "created";
const CHANGE_DATA: &str = "data";
const CHANGE_DELETED: &str = "deleted";

// KEYS[1]=node, KEYS[2]=parent kids set; ARGV[1]=data, ARGV[2]=owner, ARGV[3]=name
const CREATE_SCRIPT: &str = r#"
if redis.call('EXISTS', KEYS[1]) == 1 then
  return 0
end
redis.call('HSET', KEYS[1], 'data', ARGV[1], 'version', 0, 'owner', ARGV[2])
redis.call('SADD', KEYS[2], ARGV[3])
return 1
"#;

// KEYS[1]=node; ARGV[1]=data, ARGV[2]=expected version or 'any'
// Returns {1, new_version} on success, {0, actual} on conflict, {-1, 0} when missing
const SET_SCRIPT: &str = r#"
if redis.call('EXISTS', KEYS[1]) == 0 then
  return {-1, 0}
end
local v = tonumber(redis.call('HGET', KEYS[1], 'version'))
if ARGV[2] ~= 'any' and tonumber(ARGV[2]) ~= v then
  return {0, v}
end
redis.call('HSET', KEYS[1], 'data', ARGV[1], 'version', v + 1)
return {1, v + 1}
"#;

// KEYS[1]=node, KEYS[2]=parent kids set; ARGV[1]=expected version or 'any', ARGV[2]=name
const DELETE_SCRIPT: &str = r#"
if redis.call('EXISTS', KEYS[1]) == 0 then
  return {-1, 0}
end
local v = tonumber(redis.call('HGET', KEYS[1], 'version'))
if ARGV[1] ~= 'any' and tonumber(ARGV[1]) ~= v then
  return {0, v}
end
redis.call('DEL', KEYS[1])
redis.call('SREM', KEYS[2], ARGV[2])
return {1, v}
"#;

struct WatchEntry {
    path: String,
    kind: WatchKind,
    tx: oneshot::Sender<WatchEvent>,
}

type WatchRegistry = Arc<Mutex<Vec<WatchEntry>>>;

/// Redis-backed store session
#[derive(Clone)]
pub struct RedisStore {
    client: Client,
    conn: ConnectionManager,
    config: Arc<RedisConfig>,
    session: String,
    watches: WatchRegistry,
}

impl RedisStore {
    /// Connect, register a session, and start the heartbeat/watch tasks
    pub async fn connect(config: RedisConfig) -> StoreResult<Self> {
        let client = Client::open(&config.url[..])
            .map_err(|e| StoreError::Unavailable(e.to_string()))?;
        let conn = ConnectionManager::new(client.clone())
            .await
            .map_err(|e| StoreError::Unavailable(e.to_string()))?;

        let store = Self {
            client,
            conn,
            config: Arc::new(config),
            session: format!("redis-{}", Uuid::new_v4()),
            watches: Arc::new(Mutex::new(Vec::new())),
        };

        store.register_session().await?;
        store.spawn_heartbeat();
        store.spawn_event_router();

        info!(
            "redis store connected: url={}, session={}",
            store.config.url, store.session
        );

        Ok(store)
    }

    fn node_key(path: &str) -> String {
        format!("pogo:node:{}", path)
    }

    fn kids_key(path: &str) -> String {
        format!("pogo:kids:{}", path)
    }

    fn seq_key(prefix: &str) -> String {
        format!("pogo:seq:{}", prefix)
    }

    fn session_key(session: &str) -> String {
        format!("pogo:session:{}", session)
    }

    fn eph_key(session: &str) -> String {
        format!("pogo:eph:{}", session)
    }

    async fn register_session(&self) -> StoreResult<()> {
        let mut conn = self.conn.clone();
        redis::pipe()
            .cmd("SET")
            .arg(Self::session_key(&self.session))
            .arg("1")
            .arg("PX")
            .arg(self.config.session_timeout_ms)
            .ignore()
            .cmd("SADD")
            .arg("pogo:sessions")
            .arg(&self.session)
            .ignore()
            .query_async::<()>(&mut conn)
            .await
            .map_err(unavailable)
    }

    /// Refresh the session TTL and sweep sessions that lost theirs
    fn spawn_heartbeat(&self) {
        let store = self.clone();
        let interval = Duration::from_millis((store.config.session_timeout_ms / 3).max(1000));
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(interval).await;
                let mut conn = store.conn.clone();
                let refreshed: Result<i64, _> = redis::cmd("PEXPIRE")
                    .arg(Self::session_key(&store.session))
                    .arg(store.config.session_timeout_ms)
                    .query_async(&mut conn)
                    .await;
                match refreshed {
                    Ok(1) => {}
                    Ok(_) => {
                        // TTL already lapsed; the sweeper may have taken our
                        // ephemerals, so re-register and carry on
                        warn!("redis session lapsed, re-registering: session={}", store.session);
                        let _ = store.register_session().await;
                    }
                    Err(e) => warn!("redis heartbeat failed: {}", e),
                }
                if let Err(e) = store.sweep_expired_sessions().await {
                    warn!("session sweep failed: {}", e);
                }
            }
        });
    }

    /// Delete the ephemerals of sessions whose TTL key is gone
    async fn sweep_expired_sessions(&self) -> StoreResult<()> {
        let mut conn = self.conn.clone();
        let sessions: Vec<String> = redis::cmd("SMEMBERS")
            .arg("pogo:sessions")
            .query_async(&mut conn)
            .await
            .map_err(unavailable)?;

        for session in sessions {
            let alive: i64 = redis::cmd("EXISTS")
                .arg(Self::session_key(&session))
                .query_async(&mut conn)
                .await
                .map_err(unavailable)?;
            if alive == 1 {
                continue;
            }

            let ephemerals: Vec<String> = redis::cmd("SMEMBERS")
                .arg(Self::eph_key(&session))
                .query_async(&mut conn)
                .await
                .map_err(unavailable)?;
            for path in &ephemerals {
                debug!("sweeping ephemeral of dead session {}: {}", session, path);
                if let Err(e) = self.delete(path, super::ANY_VERSION).await {
                    if !matches!(e, StoreError::NotFound(_)) {
                        warn!("failed to sweep {}: {}", path, e);
                    }
                }
            }

            redis::pipe()
                .cmd("DEL")
                .arg(Self::eph_key(&session))
                .ignore()
                .cmd("SREM")
                .arg("pogo:sessions")
                .arg(&session)
                .ignore()
                .query_async::<()>(&mut conn)
                .await
                .map_err(unavailable)?;
        }

        Ok(())
    }

    /// Route published change events to armed watches
    fn spawn_event_router(&self) {
        let client = self.client.clone();
        let watches = self.watches.clone();
        tokio::spawn(async move {
            loop {
                let pubsub = match client.get_async_pubsub().await {
                    Ok(mut pubsub) => match pubsub.subscribe(EVENTS_CHANNEL).await {
                        Ok(()) => pubsub,
                        Err(e) => {
                            error!("event channel subscribe failed: {}", e);
                            tokio::time::sleep(Duration::from_secs(1)).await;
                            continue;
                        }
                    },
                    Err(e) => {
                        error!("event router connection failed: {}", e);
                        tokio::time::sleep(Duration::from_secs(1)).await;
                        continue;
                    }
                };

                let mut stream = pubsub.into_on_message();
                while let Some(msg) = stream.next().await {
                    let payload: Vec<u8> = match msg.get_payload() {
                        Ok(payload) => payload,
                        Err(_) => continue,
                    };
                    if let Ok(event) = serde_json::from_slice::<ChangeEvent>(&payload) {
                        fire(&watches, &event.path, &event.change);
                    }
                }

                warn!("event router stream ended, reconnecting");
            }
        });
    }

    async fn publish(&self, path: &str, change: &str) {
        let event = ChangeEvent {
            path: path.to_string(),
            change: change.to_string(),
        };
        let payload = match serde_json::to_vec(&event) {
            Ok(payload) => payload,
            Err(_) => return,
        };
        let mut conn = self.conn.clone();
        let result: Result<i64, _> = redis::cmd("PUBLISH")
            .arg(EVENTS_CHANNEL)
            .arg(payload)
            .query_async(&mut conn)
            .await;
        if let Err(e) = result {
            warn!("event publish failed for {}: {}", path, e);
        }
    }

    /// Register every ancestor in its parent's child set, so virtual
    /// directories (lock tag dirs) enumerate without explicit nodes
    async fn register_ancestors(&self, path: &str) -> StoreResult<()> {
        let mut conn = self.conn.clone();
        let mut current = path;
        loop {
            let (parent, name) = split_path(current);
            if parent.is_empty() || name.is_empty() {
                break;
            }
            let _: i64 = redis::cmd("SADD")
                .arg(Self::kids_key(parent))
                .arg(name)
                .query_async(&mut conn)
                .await
                .map_err(unavailable)?;
            current = parent;
        }
        Ok(())
    }

    fn expected_arg(expected: Version) -> String {
        if expected == super::ANY_VERSION {
            "any".to_string()
        } else {
            expected.to_string()
        }
    }
}

fn unavailable(e: redis::RedisError) -> StoreError {
    StoreError::Unavailable(e.to_string())
}

/// Fire and prune watches affected by a change, mirroring the memory backend
fn fire(watches: &WatchRegistry, path: &str, change: &str) {
    let (parent, _) = split_path(path);
    let entries = std::mem::take(&mut *watches.lock().unwrap());
    let mut kept = Vec::with_capacity(entries.len());

    for entry in entries {
        let hit = match (change, entry.kind) {
            (CHANGE_CREATED, WatchKind::Exists) => entry.path == path,
            (CHANGE_CREATED, WatchKind::Children) => entry.path == parent,
            (CHANGE_DATA, WatchKind::Data) => entry.path == path,
            (CHANGE_DATA, WatchKind::Exists) => entry.path == path,
            (CHANGE_DELETED, WatchKind::Data) => entry.path == path,
            (CHANGE_DELETED, WatchKind::Exists) => entry.path == path,
            (CHANGE_DELETED, WatchKind::Children) => entry.path == parent,
            _ => false,
        };
        if hit {
            let _ = entry.tx.send(WatchEvent {
                path: entry.path,
                kind: entry.kind,
            });
        } else if !entry.tx.is_closed() {
            kept.push(entry);
        }
    }

    *watches.lock().unwrap() = kept;
}

#[async_trait]
impl CoordinationStore for RedisStore {
    async fn create(&self, path: &str, data: &[u8], flags: CreateFlags) -> StoreResult<String> {
        let mut conn = self.conn.clone();

        let actual = if flags.sequential {
            let seq: u64 = redis::cmd("INCR")
                .arg(Self::seq_key(path))
                .query_async(&mut conn)
                .await
                .map_err(unavailable)?;
            format!("{}{:010}", path, seq)
        } else {
            path.to_string()
        };

        let (parent, name) = split_path(&actual);
        let owner = if flags.ephemeral { &self.session[..] } else { "" };

        let created: i64 = Script::new(CREATE_SCRIPT)
            .key(Self::node_key(&actual))
            .key(Self::kids_key(parent))
            .arg(data)
            .arg(owner)
            .arg(name)
            .invoke_async(&mut conn)
            .await
            .map_err(unavailable)?;
        if created == 0 {
            return Err(StoreError::AlreadyExists(actual));
        }

        self.register_ancestors(&actual).await?;

        if flags.ephemeral {
            let _: i64 = redis::cmd("SADD")
                .arg(Self::eph_key(&self.session))
                .arg(&actual)
                .query_async(&mut conn)
                .await
                .map_err(unavailable)?;
        }

        self.publish(&actual, CHANGE_CREATED).await;
        Ok(actual)
    }

    async fn get(&self, path: &str) -> StoreResult<(Vec<u8>, Version)> {
        let mut conn = self.conn.clone();
        let (data, version): (Option<Vec<u8>>, Option<u64>) = redis::cmd("HMGET")
            .arg(Self::node_key(path))
            .arg("data")
            .arg("version")
            .query_async(&mut conn)
            .await
            .map_err(unavailable)?;
        match (data, version) {
            (Some(data), Some(version)) => Ok((data, version)),
            _ => Err(StoreError::NotFound(path.to_string())),
        }
    }

    async fn set(&self, path: &str, data: &[u8], expected: Version) -> StoreResult<Version> {
        let mut conn = self.conn.clone();
        let (code, version): (i64, u64) = Script::new(SET_SCRIPT)
            .key(Self::node_key(path))
            .arg(data)
            .arg(Self::expected_arg(expected))
            .invoke_async(&mut conn)
            .await
            .map_err(unavailable)?;
        match code {
            1 => {
                self.publish(path, CHANGE_DATA).await;
                Ok(version)
            }
            0 => Err(StoreError::Conflict {
                path: path.to_string(),
                expected,
                actual: version,
            }),
            _ => Err(StoreError::NotFound(path.to_string())),
        }
    }

    async fn delete(&self, path: &str, expected: Version) -> StoreResult<()> {
        let mut conn = self.conn.clone();
        let (parent, name) = split_path(path);
        let (code, version): (i64, u64) = Script::new(DELETE_SCRIPT)
            .key(Self::node_key(path))
            .key(Self::kids_key(parent))
            .arg(Self::expected_arg(expected))
            .arg(name)
            .invoke_async(&mut conn)
            .await
            .map_err(unavailable)?;
        match code {
            1 => {
                self.publish(path, CHANGE_DELETED).await;
                Ok(())
            }
            0 => Err(StoreError::Conflict {
                path: path.to_string(),
                expected,
                actual: version,
            }),
            _ => Err(StoreError::NotFound(path.to_string())),
        }
    }

    async fn children(&self, path: &str) -> StoreResult<Vec<String>> {
        let mut conn = self.conn.clone();
        let mut names: Vec<String> = redis::cmd("SMEMBERS")
            .arg(Self::kids_key(path))
            .query_async(&mut conn)
            .await
            .map_err(unavailable)?;
        names.sort_unstable();
        Ok(names)
    }

    async fn watch(&self, path: &str, kind: WatchKind) -> StoreResult<Watch> {
        let (tx, rx) = oneshot::channel();
        self.watches.lock().unwrap().push(WatchEntry {
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

#[cfg(test)]
mod tests {
    use super::*;

    // Behavior against a live Redis is covered by the memory backend's
    // contract tests; these only exercise the pure pieces.

    #[test]
    fn test_key_layout() {
        assert_eq!(RedisStore::node_key("/pogo/jobs"), "pogo:node:/pogo/jobs");
        assert_eq!(RedisStore::kids_key("/pogo/jobs"), "pogo:kids:/pogo/jobs");
    }

    #[test]
    fn test_expected_arg() {
        assert_eq!(RedisStore::expected_arg(3), "3");
        assert_eq!(RedisStore::expected_arg(crate::store::ANY_VERSION), "any");
    }

    #[test]
    fn test_change_event_shape() {
        let event = ChangeEvent {
            path: "/a".into(),
            change: CHANGE_DATA.into(),
        };
        let json = serde_json::to_string(&event).unwrap();
        assert_eq!(json, r#"{"path":"/a","change":"data"}"#);
    }
}
