//! Retry/backoff wrapper for the coordination store
//!
//! Transient unavailability is retried with exponential backoff (base
//! 100 ms, cap 5 s, jitter) for up to the replay window; version conflicts
//! and logical errors pass straight through for the caller to re-decide.
//! [`WatchHub`] collapses duplicate watch rearms onto one underlying watch
//! per `(path, kind)`.

use super::{
    CoordinationStore, CreateFlags, StoreError, StoreResult, Version, Watch, WatchEvent, WatchKind,
};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::broadcast;
use tracing::{debug, warn};

/// Exponential backoff policy for transient store errors
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Initial delay
    pub base: Duration,

    /// Maximum delay
    pub cap: Duration,

    /// Jitter factor (0.0 - 1.0) to randomize delays
    pub jitter: f64,

    /// How long operations are replayed before giving up
    pub replay_window: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base: Duration::from_millis(100),
            cap: Duration::from_secs(5),
            jitter: 0.1,
            replay_window: Duration::from_secs(300),
        }
    }
}

impl RetryPolicy {
    /// Delay before the given attempt (0-indexed)
    pub fn delay(&self, attempt: u32) -> Duration {
        let exp = self.base.as_secs_f64() * 2f64.powi(attempt.min(30) as i32);
        let capped = exp.min(self.cap.as_secs_f64());

        let jitter = if self.jitter > 0.0 {
            use rand::Rng;
            let range = capped * self.jitter;
            rand::thread_rng().gen_range(-range..=range)
        } else {
            0.0
        };

        Duration::from_secs_f64((capped + jitter).max(0.0))
    }
}

/// Store wrapper that retries transient errors
pub struct RetryingStore<S> {
    inner: S,
    policy: RetryPolicy,
}

impl<S: CoordinationStore> RetryingStore<S> {
    /// Wrap a store with the default policy
    pub fn new(inner: S) -> Self {
        Self {
            inner,
            policy: RetryPolicy::default(),
        }
    }

    /// Wrap with a custom policy
    pub fn with_policy(inner: S, policy: RetryPolicy) -> Self {
        Self { inner, policy }
    }

    /// Access the wrapped store
    pub fn inner(&self) -> &S {
        &self.inner
    }

    async fn run<T, F, Fut>(&self, what: &str, mut op: F) -> StoreResult<T>
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = StoreResult<T>>,
    {
        let started = Instant::now();
        let mut attempt: u32 = 0;

        loop {
            match op().await {
                Err(StoreError::Unavailable(msg)) => {
                    if started.elapsed() >= self.policy.replay_window {
                        warn!(
                            "store operation abandoned after replay window: op={}, error={}",
                            what, msg
                        );
                        return Err(StoreError::Unavailable(msg));
                    }
                    let delay = self.policy.delay(attempt);
                    debug!(
                        "store unavailable, retrying: op={}, attempt={}, delay={:?}",
                        what, attempt, delay
                    );
                    attempt += 1;
                    tokio::time::sleep(delay).await;
                }
                other => return other,
            }
        }
    }
}

#[async_trait]
impl<S: CoordinationStore> CoordinationStore for RetryingStore<S> {
    async fn create(&self, path: &str, data: &[u8], flags: CreateFlags) -> StoreResult<String> {
        // Sequential creates are not replayed blindly: a retry after an
        // ambiguous failure could allocate two nodes
        if flags.sequential {
            return self.inner.create(path, data, flags).await;
        }
        self.run("create", || self.inner.create(path, data, flags))
            .await
    }

    async fn get(&self, path: &str) -> StoreResult<(Vec<u8>, Version)> {
        self.run("get", || self.inner.get(path)).await
    }

    async fn set(&self, path: &str, data: &[u8], expected: Version) -> StoreResult<Version> {
        self.run("set", || self.inner.set(path, data, expected))
            .await
    }

    async fn delete(&self, path: &str, expected: Version) -> StoreResult<()> {
        self.run("delete", || self.inner.delete(path, expected))
            .await
    }

    async fn children(&self, path: &str) -> StoreResult<Vec<String>> {
        self.run("children", || self.inner.children(path)).await
    }

    async fn watch(&self, path: &str, kind: WatchKind) -> StoreResult<Watch> {
        self.run("watch", || self.inner.watch(path, kind)).await
    }

    fn session_id(&self) -> &str {
        self.inner.session_id()
    }
}

/// Collapses duplicate watch rearms onto one underlying store watch
pub struct WatchHub {
    store: Arc<dyn CoordinationStore>,
    active: Arc<Mutex<HashMap<(String, WatchKind), broadcast::Sender<WatchEvent>>>>,
}

impl WatchHub {
    /// Create a hub over a store
    pub fn new(store: Arc<dyn CoordinationStore>) -> Self {
        Self {
            store,
            active: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Subscribe to the next event for `(path, kind)`
    ///
    /// Concurrent subscribers for the same key share a single underlying
    /// watch; a dropped receiver leaves nothing armed beyond that one.
    pub async fn subscribe(
        &self,
        path: &str,
        kind: WatchKind,
    ) -> StoreResult<broadcast::Receiver<WatchEvent>> {
        let key = (path.to_string(), kind);

        if let Some(tx) = self.active.lock().unwrap().get(&key) {
            return Ok(tx.subscribe());
        }

        let watch = self.store.watch(path, kind).await?;
        let (tx, rx) = broadcast::channel(1);

        self.active.lock().unwrap().insert(key.clone(), tx.clone());

        let active = self.active.clone();
        tokio::spawn(async move {
            if let Some(event) = watch.wait().await {
                let _ = tx.send(event);
            }
            active.lock().unwrap().remove(&key);
        });

        Ok(rx)
    }
}
