//! Worker connection pool
//!
//! Maintains one persistent session per configured worker address, with
//! reconnection and a grace window during which a returning worker resumes
//! its in-flight tasks. Dispatch selection picks the least-loaded worker
//! (lowest in_flight/capacity ratio, least-recently-used tiebreak). Task
//! outcomes flow back to the dispatcher as [`TaskEvent`]s; the pool never
//! touches job state itself.

use crate::job::TaskOutcome;
use crate::worker::connection::{self, WorkerFramed};
use crate::worker::protocol::{Message, ReqId, PROTOCOL_VERSION};
use crate::worker::secrets::SecretVault;
use crate::config::WorkersConfig;
use crate::{Error, JobId, Result};
use async_trait::async_trait;
use dashmap::DashMap;
use futures::{SinkExt, StreamExt};
use std::collections::HashSet;
use std::sync::atomic::{AtomicI64, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// One task handed to the pool for execution
#[derive(Debug, Clone)]
pub struct DispatchTask {
    pub jobid: JobId,
    pub hostname: String,
    pub command: String,
    pub run_as: Option<String>,
    pub timeout: u64,
    pub password_ref: Option<String>,
}

/// Worker-originated events routed back to job controllers
#[derive(Debug, Clone)]
pub enum TaskEvent {
    /// Worker accepted the task
    Accepted {
        jobid: JobId,
        hostname: String,
        req_id: ReqId,
    },

    /// Progress report, possibly with an output location
    Progress {
        jobid: JobId,
        hostname: String,
        req_id: ReqId,
        output_url: Option<String>,
    },

    /// Terminal outcome for the dispatch attempt
    Finished {
        jobid: JobId,
        hostname: String,
        req_id: ReqId,
        outcome: TaskOutcome,
    },
}

/// Proof of a dispatched task
#[derive(Debug, Clone)]
pub struct DispatchReceipt {
    pub req_id: ReqId,
    pub worker: String,
}

/// Where job controllers send work
///
/// The pool is the production implementation; tests drive controllers with a
/// loopback sink.
#[async_trait]
pub trait TaskSink: Send + Sync {
    /// Dispatch a task; returns the request id and chosen worker
    async fn dispatch(&self, task: DispatchTask) -> Result<DispatchReceipt>;

    /// Ask the worker to stop a task, best effort
    async fn cancel(&self, req_id: ReqId);

    /// Stop tracking a request the controller has given up on
    async fn abandon(&self, req_id: ReqId);
}

struct Pending {
    jobid: JobId,
    hostname: String,
    worker_id: String,
    password_ref: Option<String>,
}

/// Connection state and accounting for one worker
struct Worker {
    id: String,
    address: String,
    capacity: AtomicUsize,
    in_flight: Mutex<HashSet<ReqId>>,
    last_seen: AtomicI64,
    last_used: AtomicI64,
    generation: AtomicU64,
    sender: Mutex<Option<mpsc::UnboundedSender<Message>>>,
}

impl Worker {
    fn new(id: &str, address: &str) -> Self {
        Self {
            id: id.to_string(),
            address: address.to_string(),
            capacity: AtomicUsize::new(1),
            in_flight: Mutex::new(HashSet::new()),
            last_seen: AtomicI64::new(chrono::Utc::now().timestamp()),
            last_used: AtomicI64::new(0),
            generation: AtomicU64::new(0),
            sender: Mutex::new(None),
        }
    }

    fn touch(&self) {
        self.last_seen
            .store(chrono::Utc::now().timestamp(), Ordering::Relaxed);
    }

    fn connected(&self) -> bool {
        self.sender.lock().unwrap().is_some()
    }

    fn in_flight_count(&self) -> usize {
        self.in_flight.lock().unwrap().len()
    }

    fn send(&self, message: Message) -> bool {
        match &*self.sender.lock().unwrap() {
            Some(tx) => tx.send(message).is_ok(),
            None => false,
        }
    }
}

/// Statistics for one worker
#[derive(Debug, Clone, serde::Serialize)]
pub struct WorkerStats {
    pub id: String,
    pub address: String,
    pub connected: bool,
    pub capacity: usize,
    pub in_flight: usize,
    pub last_seen: i64,
}

/// Pool-wide statistics
#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct PoolStats {
    pub workers_idle: usize,
    pub workers_busy: usize,
    pub workers: Vec<WorkerStats>,
}

/// The worker connection pool
pub struct WorkerPool {
    config: WorkersConfig,
    tls: Option<Arc<rustls::ClientConfig>>,
    vault: Arc<SecretVault>,
    workers: DashMap<String, Arc<Worker>>,
    pending: DashMap<ReqId, Pending>,
    next_req_id: AtomicU64,
    events_tx: mpsc::UnboundedSender<TaskEvent>,
}

impl WorkerPool {
    /// Build the pool and its event stream; call [`start`] to connect
    pub fn new(
        config: WorkersConfig,
        vault: Arc<SecretVault>,
    ) -> Result<(Arc<Self>, mpsc::UnboundedReceiver<TaskEvent>)> {
        let tls = if config.tls.enabled {
            Some(connection::build_tls_config(&config.tls)?)
        } else {
            None
        };

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let pool = Arc::new(Self {
            config,
            tls,
            vault,
            workers: DashMap::new(),
            pending: DashMap::new(),
            next_req_id: AtomicU64::new(1),
            events_tx,
        });

        Ok((pool, events_rx))
    }

    /// Spawn the connection maintainers for every configured address
    pub fn start(self: &Arc<Self>) {
        for address in self.config.addresses.clone() {
            let pool = self.clone();
            tokio::spawn(async move {
                pool.maintain_connection(address).await;
            });
        }
    }

    async fn maintain_connection(self: Arc<Self>, address: String) {
        let mut attempt: u32 = 0;
        loop {
            match connection::connect(&address, self.tls.clone()).await {
                Ok(framed) => {
                    attempt = 0;
                    if let Err(e) = self.clone().run_session(&address, framed).await {
                        warn!("worker session ended: address={}, error={}", address, e);
                    }
                }
                Err(e) => {
                    debug!("worker connect failed: address={}, error={}", address, e);
                }
            }

            // Capped exponential backoff before the next attempt
            let delay = Duration::from_millis(500u64.saturating_mul(1 << attempt.min(6)));
            attempt = attempt.saturating_add(1);
            tokio::time::sleep(delay.min(Duration::from_secs(30))).await;
        }
    }

    async fn run_session(self: Arc<Self>, address: &str, framed: WorkerFramed) -> Result<()> {
        let (mut sink, mut stream) = framed.split();

        // The worker speaks first
        let hello = tokio::time::timeout(Duration::from_secs(10), stream.next())
            .await
            .map_err(|_| Error::WorkerLost(format!("{}: no hello", address)))?
            .ok_or_else(|| Error::WorkerLost(format!("{}: closed before hello", address)))?
            .map_err(|e| Error::WorkerLost(format!("{}: {}", address, e)))?;

        let (worker_id, capacity) = match hello {
            Message::Hello {
                id,
                capacity,
                version,
            } => {
                if version != PROTOCOL_VERSION {
                    warn!(
                        "worker protocol mismatch: id={}, theirs={}, ours={}",
                        id, version, PROTOCOL_VERSION
                    );
                }
                (id, capacity.unwrap_or(1).max(1) as usize)
            }
            other => {
                return Err(Error::WorkerLost(format!(
                    "{}: expected hello, got {:?}",
                    address, other
                )));
            }
        };

        let worker = self
            .workers
            .entry(worker_id.clone())
            .or_insert_with(|| Arc::new(Worker::new(&worker_id, address)))
            .clone();
        worker.capacity.store(capacity, Ordering::Relaxed);
        worker.generation.fetch_add(1, Ordering::SeqCst);
        worker.touch();

        let resumed = worker.in_flight_count();
        if resumed > 0 {
            info!(
                "worker reconnected within grace: id={}, in_flight={}",
                worker_id, resumed
            );
        } else {
            info!("worker connected: id={}, capacity={}", worker_id, capacity);
        }

        let (tx, mut rx) = mpsc::unbounded_channel::<Message>();
        *worker.sender.lock().unwrap() = Some(tx);

        // Writer half: queued messages plus periodic pings
        let ping_interval = Duration::from_secs(self.config.ping_interval_secs.max(1));
        let writer = tokio::spawn(async move {
            let mut ping_seq: u64 = 0;
            let mut ticker = tokio::time::interval(ping_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    queued = rx.recv() => {
                        match queued {
                            Some(message) => {
                                if sink.send(message).await.is_err() {
                                    break;
                                }
                            }
                            None => break,
                        }
                    }
                    _ = ticker.tick() => {
                        ping_seq += 1;
                        if sink.send(Message::Ping { seq: ping_seq }).await.is_err() {
                            break;
                        }
                    }
                }
            }
        });

        // Reader half: route worker messages
        let read_result = loop {
            match stream.next().await {
                Some(Ok(message)) => self.handle_message(&worker, message),
                Some(Err(e)) => break Err(Error::WorkerLost(format!("{}: {}", address, e))),
                None => break Ok(()),
            }
        };

        // Disconnected: enter grace, then fail what never came back
        *worker.sender.lock().unwrap() = None;
        writer.abort();

        let generation = worker.generation.load(Ordering::SeqCst);
        let grace = Duration::from_secs(self.config.reconnect_grace_secs);
        let pool = self.clone();
        let grace_worker = worker.clone();
        tokio::spawn(async move {
            tokio::time::sleep(grace).await;
            let still_gone = !grace_worker.connected()
                && grace_worker.generation.load(Ordering::SeqCst) == generation;
            if still_gone {
                pool.fail_in_flight(&grace_worker);
            }
        });

        read_result
    }

    fn handle_message(&self, worker: &Arc<Worker>, message: Message) {
        worker.touch();
        match message {
            Message::Ack { req_id } => {
                if let Some(pending) = self.pending.get(&req_id) {
                    let _ = self.events_tx.send(TaskEvent::Accepted {
                        jobid: pending.jobid,
                        hostname: pending.hostname.clone(),
                        req_id,
                    });
                }
            }
            Message::Update {
                req_id,
                output_url,
                ..
            } => {
                if let Some(pending) = self.pending.get(&req_id) {
                    let _ = self.events_tx.send(TaskEvent::Progress {
                        jobid: pending.jobid,
                        hostname: pending.hostname.clone(),
                        req_id,
                        output_url,
                    });
                }
            }
            Message::Result {
                req_id,
                exit_code,
                message,
                duration_ms,
            } => {
                let Some((_, pending)) = self.pending.remove(&req_id) else {
                    debug!("result for unknown request: req_id={}", req_id);
                    return;
                };
                worker.in_flight.lock().unwrap().remove(&req_id);
                if let Some(reference) = &pending.password_ref {
                    // The secret is spent whether or not the worker fetched it
                    drop(self.vault.take(reference));
                }
                let _ = self.events_tx.send(TaskEvent::Finished {
                    jobid: pending.jobid,
                    hostname: pending.hostname.clone(),
                    req_id,
                    outcome: TaskOutcome::Completed {
                        exit_code,
                        message,
                        duration_ms,
                    },
                });
            }
            Message::FetchSecret { req_id } => {
                let secret = self
                    .pending
                    .get(&req_id)
                    .and_then(|pending| pending.password_ref.clone())
                    .and_then(|reference| self.vault.take(&reference));
                let reply = Message::Secret {
                    req_id,
                    secret: secret.as_ref().and_then(|s| s.as_str().map(String::from)),
                };
                worker.send(reply);
            }
            Message::Ping { seq } => {
                worker.send(Message::Pong { seq });
            }
            Message::Pong { .. } => {}
            other => {
                warn!("unexpected message from worker {}: {:?}", worker.id, other);
            }
        }
    }

    /// Fail every task still attributed to a worker that never came back
    fn fail_in_flight(&self, worker: &Arc<Worker>) {
        let orphaned: Vec<ReqId> = worker.in_flight.lock().unwrap().drain().collect();
        if orphaned.is_empty() {
            return;
        }
        warn!(
            "worker lost past grace: id={}, failing {} tasks",
            worker.id,
            orphaned.len()
        );
        for req_id in orphaned {
            if let Some((_, pending)) = self.pending.remove(&req_id) {
                let _ = self.events_tx.send(TaskEvent::Finished {
                    jobid: pending.jobid,
                    hostname: pending.hostname,
                    req_id,
                    outcome: TaskOutcome::WorkerLost,
                });
            }
        }
    }

    /// Pick the least-loaded connected worker with spare capacity
    fn select_worker(&self) -> Option<Arc<Worker>> {
        let mut best: Option<(Arc<Worker>, usize, usize, i64)> = None;
        for entry in self.workers.iter() {
            let worker = entry.value();
            if !worker.connected() {
                continue;
            }
            let capacity = worker.capacity.load(Ordering::Relaxed).max(1);
            let in_flight = worker.in_flight_count();
            if in_flight >= capacity {
                continue;
            }
            let last_used = worker.last_used.load(Ordering::Relaxed);
            let better = match &best {
                None => true,
                Some((_, best_in_flight, best_capacity, best_last_used)) => {
                    // Compare in_flight/capacity without floats, then LRU
                    let lhs = in_flight * best_capacity;
                    let rhs = best_in_flight * capacity;
                    lhs < rhs || (lhs == rhs && last_used < *best_last_used)
                }
            };
            if better {
                best = Some((worker.clone(), in_flight, capacity, last_used));
            }
        }
        best.map(|(worker, _, _, _)| worker)
    }

    /// Pool statistics for `stats()`
    pub fn stats(&self) -> PoolStats {
        let mut stats = PoolStats::default();
        for entry in self.workers.iter() {
            let worker = entry.value();
            let connected = worker.connected();
            let in_flight = worker.in_flight_count();
            if connected {
                if in_flight == 0 {
                    stats.workers_idle += 1;
                } else {
                    stats.workers_busy += 1;
                }
            }
            stats.workers.push(WorkerStats {
                id: worker.id.clone(),
                address: worker.address.clone(),
                connected,
                capacity: worker.capacity.load(Ordering::Relaxed),
                in_flight,
                last_seen: worker.last_seen.load(Ordering::Relaxed),
            });
        }
        stats.workers.sort_by(|a, b| a.id.cmp(&b.id));
        stats
    }
}

#[async_trait]
impl TaskSink for WorkerPool {
    async fn dispatch(&self, task: DispatchTask) -> Result<DispatchReceipt> {
        let worker = self
            .select_worker()
            .ok_or_else(|| Error::dispatch_rejected("no worker available"))?;

        let req_id = self.next_req_id.fetch_add(1, Ordering::SeqCst);
        worker.in_flight.lock().unwrap().insert(req_id);
        worker
            .last_used
            .store(chrono::Utc::now().timestamp(), Ordering::Relaxed);
        self.pending.insert(
            req_id,
            Pending {
                jobid: task.jobid,
                hostname: task.hostname.clone(),
                worker_id: worker.id.clone(),
                password_ref: task.password_ref.clone(),
            },
        );

        let message = Message::Dispatch {
            req_id,
            jobid: task.jobid,
            hostname: task.hostname.clone(),
            command: task.command,
            run_as: task.run_as,
            timeout: task.timeout,
            password_ref: task.password_ref,
        };

        if !worker.send(message) {
            worker.in_flight.lock().unwrap().remove(&req_id);
            self.pending.remove(&req_id);
            return Err(Error::dispatch_rejected(format!(
                "worker {} went away",
                worker.id
            )));
        }

        debug!(
            "dispatched: req_id={}, jobid={}, hostname={}, worker={}",
            req_id, task.jobid, task.hostname, worker.id
        );

        Ok(DispatchReceipt {
            req_id,
            worker: worker.id.clone(),
        })
    }

    async fn cancel(&self, req_id: ReqId) {
        let worker_id = match self.pending.get(&req_id) {
            Some(pending) => pending.worker_id.clone(),
            None => return,
        };
        if let Some(worker) = self.workers.get(&worker_id) {
            worker.send(Message::Cancel { req_id });
        }
    }

    async fn abandon(&self, req_id: ReqId) {
        if let Some((_, pending)) = self.pending.remove(&req_id) {
            if let Some(worker) = self.workers.get(&pending.worker_id) {
                worker.in_flight.lock().unwrap().remove(&req_id);
            }
            if let Some(reference) = pending.password_ref {
                drop(self.vault.take(&reference));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pool() -> Arc<WorkerPool> {
        let (pool, _events) =
            WorkerPool::new(WorkersConfig::default(), Arc::new(SecretVault::new())).unwrap();
        pool
    }

    fn connected_worker(pool: &WorkerPool, id: &str, capacity: usize) -> Arc<Worker> {
        let worker = Arc::new(Worker::new(id, "test:0"));
        worker.capacity.store(capacity, Ordering::Relaxed);
        let (tx, rx) = mpsc::unbounded_channel();
        std::mem::forget(rx);
        *worker.sender.lock().unwrap() = Some(tx);
        pool.workers.insert(id.to_string(), worker.clone());
        worker
    }

    #[tokio::test]
    async fn test_dispatch_with_no_workers_is_rejected() {
        let pool = pool();
        let err = pool
            .dispatch(DispatchTask {
                jobid: JobId::from_seq(1),
                hostname: "web1".into(),
                command: "uptime".into(),
                run_as: None,
                timeout: 30,
                password_ref: None,
            })
            .await
            .unwrap_err();
        assert!(matches!(err, Error::DispatchRejected(_)));
    }

    #[tokio::test]
    async fn test_selection_prefers_least_loaded() {
        let pool = pool();
        let busy = connected_worker(&pool, "busy", 2);
        busy.in_flight.lock().unwrap().insert(99);
        connected_worker(&pool, "idle", 1);

        let selected = pool.select_worker().unwrap();
        assert_eq!(selected.id, "idle");
    }

    #[tokio::test]
    async fn test_selection_skips_full_workers() {
        let pool = pool();
        let full = connected_worker(&pool, "full", 1);
        full.in_flight.lock().unwrap().insert(1);
        assert!(pool.select_worker().is_none());
    }

    #[tokio::test]
    async fn test_selection_lru_tiebreak() {
        let pool = pool();
        let old = connected_worker(&pool, "old", 1);
        let recent = connected_worker(&pool, "recent", 1);
        old.last_used.store(100, Ordering::Relaxed);
        recent.last_used.store(200, Ordering::Relaxed);

        let selected = pool.select_worker().unwrap();
        assert_eq!(selected.id, "old");
    }

    #[tokio::test]
    async fn test_in_flight_bounded_by_capacity() {
        let pool = pool();
        connected_worker(&pool, "w", 2);

        let task = DispatchTask {
            jobid: JobId::from_seq(1),
            hostname: "h".into(),
            command: "c".into(),
            run_as: None,
            timeout: 30,
            password_ref: None,
        };
        pool.dispatch(task.clone()).await.unwrap();
        pool.dispatch(task.clone()).await.unwrap();
        assert!(pool.dispatch(task).await.is_err());

        let stats = pool.stats();
        assert_eq!(stats.workers_busy, 1);
        assert_eq!(stats.workers[0].in_flight, 2);
    }

    #[tokio::test]
    async fn test_worker_lost_fails_in_flight_once() {
        let (pool, mut events) =
            WorkerPool::new(WorkersConfig::default(), Arc::new(SecretVault::new())).unwrap();
        let worker = connected_worker(&pool, "w", 1);
        let receipt = pool
            .dispatch(DispatchTask {
                jobid: JobId::from_seq(1),
                hostname: "h".into(),
                command: "c".into(),
                run_as: None,
                timeout: 30,
                password_ref: None,
            })
            .await
            .unwrap();
        assert_eq!(receipt.worker, "w");

        *worker.sender.lock().unwrap() = None;
        pool.fail_in_flight(&worker);

        match events.recv().await.unwrap() {
            TaskEvent::Finished {
                req_id: failed,
                outcome,
                ..
            } => {
                assert_eq!(failed, receipt.req_id);
                assert_eq!(outcome, TaskOutcome::WorkerLost);
            }
            other => panic!("unexpected event: {:?}", other),
        }

        // A second sweep finds nothing
        pool.fail_in_flight(&worker);
        assert!(events.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_empty_fleet_stats() {
        let pool = pool();
        let stats = pool.stats();
        assert_eq!(stats.workers_idle, 0);
        assert_eq!(stats.workers_busy, 0);
    }
}
