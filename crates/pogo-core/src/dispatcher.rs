//! Dispatcher process core
//!
//! Binds the coordination store session, the worker pool, and the job
//! controllers. All front-end operations land here and translate to store
//! reads or controller events; worker task events route back to the owning
//! controller. There is no global state: everything hangs off an explicitly
//! constructed `Dispatcher`.

use crate::config::{Config, StoreBackend};
use crate::job::{
    HaltReason, HostCounts, HostRecord, JobController, JobEvent, JobHandle, JobRecord, JobSpec,
    JobState, JobStateRecord,
};
use crate::namespace::Namespace;
use crate::store::{
    paths, CoordinationStore, CreateFlags, HostView, JobView, MemoryStore, NamespaceView,
    RedisStore, RetryingStore, WatchHub, WatchKind,
};
use crate::worker::{PoolStats, SecretVault, TaskEvent, TaskSink, WorkerPool};
use crate::{target, Error, JobId, Result};
use dashmap::DashMap;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{info, warn};
use uuid::Uuid;

/// The `ping` answer
pub const PING_RESPONSE: u32 = 0xDEAD_BEEF;

/// Filters for `listjobs`; all present filters are ANDed
#[derive(Debug, Clone, Default)]
pub struct ListFilters {
    pub user: Option<String>,
    pub state: Option<JobState>,
    pub target: Option<String>,
    pub offset: Option<usize>,
    pub limit: Option<usize>,
    pub page: Option<usize>,
}

/// `jobinfo` response: the record plus host tallies
#[derive(Debug, Clone, Serialize)]
pub struct JobInfo {
    #[serde(flatten)]
    pub record: JobRecord,
    pub hosts: HostCounts,
}

/// One page of `jobstatus`
#[derive(Debug, Clone, Serialize)]
pub struct JobStatusPage {
    pub state: JobStateRecord,
    pub hosts: Vec<HostRecord>,
    pub total: usize,
    pub offset: usize,
}

/// `stats` response
#[derive(Debug, Clone, Serialize)]
pub struct DispatcherStats {
    pub hostname: String,
    pub workers_idle: usize,
    pub workers_busy: usize,
    pub per_job_counts: HashMap<String, HostCounts>,
}

/// Dispatcher instance
pub struct Dispatcher {
    id: String,
    config: Config,
    store: Arc<dyn CoordinationStore>,
    jobs: JobView<dyn CoordinationStore>,
    hosts: HostView<dyn CoordinationStore>,
    ns_view: NamespaceView<dyn CoordinationStore>,
    ns_cache: Arc<DashMap<String, Arc<Namespace>>>,
    watch_hub: Arc<WatchHub>,
    ns_gates: DashMap<String, Arc<tokio::sync::Mutex<()>>>,
    controllers: DashMap<JobId, JobHandle>,
    sink: Arc<dyn TaskSink>,
    pool: Option<Arc<WorkerPool>>,
    vault: Arc<SecretVault>,
}

impl Dispatcher {
    /// Construct against the configured store backend and a live worker pool
    pub async fn new(config: Config) -> Result<Arc<Self>> {
        let store: Arc<dyn CoordinationStore> = match config.store.backend {
            StoreBackend::Memory => Arc::new(RetryingStore::new(MemoryStore::new())),
            StoreBackend::Redis => {
                let redis = RedisStore::connect(config.store.redis.clone()).await?;
                Arc::new(RetryingStore::new(redis))
            }
        };

        let vault = Arc::new(SecretVault::new());
        let (pool, events) = WorkerPool::new(config.workers.clone(), vault.clone())?;
        pool.start();

        let dispatcher = Self::assemble(config, store, pool.clone(), Some(pool), vault).await?;
        dispatcher.clone().spawn_event_router(events);
        dispatcher.resume_jobs().await?;
        Ok(dispatcher)
    }

    /// Construct with explicit store and sink; used by tests and embeddings
    pub async fn with_parts(
        config: Config,
        store: Arc<dyn CoordinationStore>,
        sink: Arc<dyn TaskSink>,
    ) -> Result<Arc<Self>> {
        let vault = Arc::new(SecretVault::new());
        Self::assemble(config, store, sink, None, vault).await
    }

    async fn assemble(
        config: Config,
        store: Arc<dyn CoordinationStore>,
        sink: Arc<dyn TaskSink>,
        pool: Option<Arc<WorkerPool>>,
        vault: Arc<SecretVault>,
    ) -> Result<Arc<Self>> {
        let id = format!("dispatcher-{}", Uuid::new_v4());

        let dispatcher = Arc::new(Self {
            id: id.clone(),
            config,
            jobs: JobView::new(store.clone()),
            hosts: HostView::new(store.clone()),
            ns_view: NamespaceView::new(store.clone()),
            ns_cache: Arc::new(DashMap::new()),
            watch_hub: Arc::new(WatchHub::new(store.clone())),
            ns_gates: DashMap::new(),
            controllers: DashMap::new(),
            sink,
            pool,
            vault,
            store,
        });

        // Liveness record dies with the store session
        let liveness = serde_json::json!({ "id": id, "started": chrono::Utc::now().timestamp() });
        dispatcher
            .store
            .create(
                &paths::dispatcher(&id),
                &serde_json::to_vec(&liveness)?,
                CreateFlags::EPHEMERAL,
            )
            .await
            .map_err(Error::from)?;

        info!("dispatcher registered: id={}", id);
        Ok(dispatcher)
    }

    /// Route worker task events to their owning controllers
    fn spawn_event_router(self: Arc<Self>, mut events: mpsc::UnboundedReceiver<TaskEvent>) {
        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                let (jobid, job_event) = match event {
                    TaskEvent::Accepted {
                        jobid,
                        hostname,
                        req_id,
                    } => (jobid, JobEvent::TaskAccepted { hostname, req_id }),
                    TaskEvent::Progress {
                        jobid,
                        hostname,
                        req_id,
                        output_url,
                    } => (
                        jobid,
                        JobEvent::TaskProgress {
                            hostname,
                            req_id,
                            output_url,
                        },
                    ),
                    TaskEvent::Finished {
                        jobid,
                        hostname,
                        req_id,
                        outcome,
                    } => (
                        jobid,
                        JobEvent::TaskFinished {
                            hostname,
                            req_id,
                            outcome,
                        },
                    ),
                };
                match self.controllers.get(&jobid) {
                    Some(handle) => {
                        if !handle.send(job_event) {
                            warn!("job {} controller gone, event dropped", jobid);
                        }
                    }
                    None => warn!("task event for unknown job {}", jobid),
                }
            }
        });
    }

    /// Rebuild controllers for every non-terminal job after a restart
    async fn resume_jobs(self: &Arc<Self>) -> Result<()> {
        for jobid in self.jobs.list().await? {
            let (state, _) = self.jobs.read_state(jobid).await?;
            if state.state.is_terminal() {
                continue;
            }
            let doc = self.jobs.read_doc(jobid).await?;
            let ns = match self.load_namespace(&doc.spec.namespace).await {
                Ok(ns) => ns,
                Err(e) => {
                    warn!("job {} not resumed, namespace missing: {}", jobid, e);
                    continue;
                }
            };
            info!("resuming job {} in state {}", jobid, state.display_state());
            let handle = self.spawn_controller(jobid, doc.spec, doc.hosts, (*ns).clone());
            handle.send(JobEvent::Start);
            self.controllers.insert(jobid, handle);
        }
        Ok(())
    }

    fn spawn_controller(
        &self,
        jobid: JobId,
        spec: JobSpec,
        order: Vec<String>,
        ns: Namespace,
    ) -> JobHandle {
        let gate = self
            .ns_gates
            .entry(spec.namespace.clone())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone();
        JobController::spawn(
            jobid,
            spec,
            order,
            ns,
            crate::job::ControllerContext {
                store: self.store.clone(),
                sink: self.sink.clone(),
                vault: self.vault.clone(),
                ns_gate: gate,
                abandon_factor: self.config.dispatch.abandon_factor,
            },
        )
    }

    async fn load_namespace(&self, name: &str) -> Result<Arc<Namespace>> {
        if let Some(ns) = self.ns_cache.get(name) {
            return Ok(ns.clone());
        }
        let ns = Arc::new(self.ns_view.read(name).await?);
        self.ns_cache.insert(name.to_string(), ns.clone());
        self.watch_namespace(name);
        Ok(ns)
    }

    /// Drop the cached namespace when its config node changes
    ///
    /// The hub collapses repeated arms onto one store watch per namespace;
    /// the next cache miss re-reads and re-arms.
    fn watch_namespace(&self, name: &str) {
        let hub = self.watch_hub.clone();
        let cache = self.ns_cache.clone();
        let name = name.to_string();
        tokio::spawn(async move {
            let path = paths::ns_config(&name);
            match hub.subscribe(&path, WatchKind::Data).await {
                Ok(mut events) => {
                    if events.recv().await.is_ok() {
                        info!("namespace {} changed in store, cache dropped", name);
                        cache.remove(&name);
                    }
                }
                Err(e) => warn!("namespace watch failed for {}: {}", name, e),
            }
        });
    }

    /// Create and start a job
    pub async fn run_job(&self, mut spec: JobSpec) -> Result<JobId> {
        if spec.timeout == 0 {
            spec.timeout = self.config.dispatch.default_timeout_secs;
        }
        spec.validate()?;

        let ns = self.load_namespace(&spec.namespace).await?;
        let order = target::expand(&spec.target, &ns)?;

        let jobid = self.jobs.create(&spec, &order).await?;
        self.hosts.seed(jobid, &order).await?;

        info!(
            "job {} created: user={}, target={}, hosts={}, namespace={}",
            jobid,
            spec.user,
            spec.target,
            order.len(),
            spec.namespace
        );

        let handle = self.spawn_controller(jobid, spec, order, (*ns).clone());
        handle.send(JobEvent::Start);
        self.controllers.insert(jobid, handle);

        Ok(jobid)
    }

    /// Static spec plus current state summary
    pub async fn jobinfo(&self, jobid: JobId) -> Result<JobInfo> {
        let doc = self.jobs.read_doc(jobid).await?;
        let (state, _) = self.jobs.read_state(jobid).await?;
        let records = self.hosts.read_many(jobid, &doc.hosts).await?;
        let counts = HostCounts::tally(records.iter().map(|r| &r.state));
        Ok(JobInfo {
            record: JobRecord::new(jobid, doc.spec, state),
            hosts: counts,
        })
    }

    /// Paginated host records for one job
    pub async fn jobstatus(
        &self,
        jobid: JobId,
        offset: usize,
        limit: usize,
    ) -> Result<JobStatusPage> {
        let doc = self.jobs.read_doc(jobid).await?;
        let (state, _) = self.jobs.read_state(jobid).await?;
        let total = doc.hosts.len();
        let page: Vec<String> = doc
            .hosts
            .into_iter()
            .skip(offset)
            .take(limit.max(1))
            .collect();
        let hosts = self.hosts.read_many(jobid, &page).await?;
        Ok(JobStatusPage {
            state,
            hosts,
            total,
            offset,
        })
    }

    /// Jobs newest-first, filtered and paginated
    pub async fn listjobs(&self, filters: ListFilters) -> Result<Vec<JobRecord>> {
        let limit = filters.limit.unwrap_or(50).max(1);
        let skip = filters.offset.unwrap_or(0) + filters.page.unwrap_or(0) * limit;

        let mut records = Vec::new();
        for jobid in self.jobs.list().await? {
            let doc = self.jobs.read_doc(jobid).await?;
            let (state, _) = self.jobs.read_state(jobid).await?;

            if let Some(user) = &filters.user {
                if doc.spec.user != *user {
                    continue;
                }
            }
            if let Some(wanted) = filters.state {
                if state.state != wanted {
                    continue;
                }
            }
            if let Some(target) = &filters.target {
                if doc.spec.target != *target {
                    continue;
                }
            }

            records.push(JobRecord::new(jobid, doc.spec, state));
            if records.len() >= skip + limit {
                break;
            }
        }

        Ok(records.into_iter().skip(skip).take(limit).collect())
    }

    /// Halt a job; terminal jobs are left as they are
    pub async fn halt(&self, jobid: JobId, reason: Option<String>) -> Result<JobStateRecord> {
        let (state, _) = self.jobs.read_state(jobid).await?;
        if state.state.is_terminal() {
            return Ok(state);
        }

        if let Some(reason) = &reason {
            info!("halt requested: jobid={}, reason={}", jobid, reason);
        }

        match self.controllers.get(&jobid) {
            Some(handle) if !handle.is_terminated() => {
                handle.send(JobEvent::Halt {
                    reason: HaltReason::UserHalt,
                });
            }
            _ => {
                // No live controller: halt the record directly; there are no
                // dispatches to cancel from this process
                self.jobs
                    .update_state(jobid, |s| s.halt(HaltReason::UserHalt))
                    .await?;
            }
        }

        let (state, _) = self.jobs.read_state(jobid).await?;
        Ok(state)
    }

    /// Requeue failed/skipped/deadlocked hosts
    pub async fn retry(&self, jobid: JobId, hostnames: Vec<String>) -> Result<()> {
        let (state, _) = self.jobs.read_state(jobid).await?;
        if state.state == JobState::Finished {
            return Err(Error::invalid_spec(format!(
                "job {} is finished; nothing to retry",
                jobid
            )));
        }

        match self.controllers.get(&jobid) {
            Some(handle) if !handle.is_terminated() => {
                handle.send(JobEvent::Retry { hosts: hostnames });
            }
            _ => {
                for hostname in &hostnames {
                    self.hosts
                        .update(jobid, hostname, |host| host.reset_for_retry())
                        .await?;
                }
            }
        }

        Ok(())
    }

    /// Load or replace a namespace document
    pub async fn loadconf(&self, namespace: &str, yaml: &str) -> Result<()> {
        // Validate before anything touches the store
        let parsed = Namespace::from_yaml(namespace, yaml)?;
        self.ns_view.write_config(namespace, yaml).await?;
        self.ns_cache.insert(namespace.to_string(), Arc::new(parsed));
        self.watch_namespace(namespace);
        info!("namespace {} loaded", namespace);
        Ok(())
    }

    /// Liveness probe
    pub fn ping(&self) -> u32 {
        PING_RESPONSE
    }

    /// Dispatcher statistics
    pub async fn stats(&self) -> Result<DispatcherStats> {
        let pool_stats = self
            .pool
            .as_ref()
            .map(|pool| pool.stats())
            .unwrap_or_else(PoolStats::default);

        let mut per_job_counts = HashMap::new();
        let active: Vec<JobId> = self
            .controllers
            .iter()
            .filter(|entry| !entry.value().is_terminated())
            .map(|entry| *entry.key())
            .collect();
        for jobid in active {
            let doc = self.jobs.read_doc(jobid).await?;
            let records = self.hosts.read_many(jobid, &doc.hosts).await?;
            per_job_counts.insert(
                jobid.to_string(),
                HostCounts::tally(records.iter().map(|r| &r.state)),
            );
        }

        Ok(DispatcherStats {
            hostname: hostname::get()
                .map(|h| h.to_string_lossy().into_owned())
                .unwrap_or_else(|_| "unknown".to_string()),
            workers_idle: pool_stats.workers_idle,
            workers_busy: pool_stats.workers_busy,
            per_job_counts,
        })
    }

    /// This dispatcher's liveness id
    pub fn id(&self) -> &str {
        &self.id
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::namespace::Cap;
    use crate::worker::pool::{DispatchReceipt, DispatchTask};
    use crate::worker::ReqId;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::sync::Mutex as StdMutex;
    use std::time::Duration;

    struct NullSink {
        next: AtomicU64,
        dispatched: StdMutex<Vec<(ReqId, DispatchTask)>>,
    }

    impl NullSink {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                next: AtomicU64::new(1),
                dispatched: StdMutex::new(Vec::new()),
            })
        }
    }

    #[async_trait]
    impl TaskSink for NullSink {
        async fn dispatch(&self, task: DispatchTask) -> Result<DispatchReceipt> {
            let req_id = self.next.fetch_add(1, Ordering::SeqCst);
            self.dispatched.lock().unwrap().push((req_id, task));
            Ok(DispatchReceipt {
                req_id,
                worker: "null".to_string(),
            })
        }

        async fn cancel(&self, _req_id: ReqId) {}

        async fn abandon(&self, _req_id: ReqId) {}
    }

    const NS: &str = "hosts: {a1: [app], a2: [app], a3: [app]}\n";

    async fn dispatcher() -> (Arc<Dispatcher>, Arc<NullSink>) {
        let store = Arc::new(MemoryStore::new());
        let sink = NullSink::new();
        let d = Dispatcher::with_parts(Config::default(), store, sink.clone())
            .await
            .unwrap();
        d.loadconf("example", NS).await.unwrap();
        (d, sink)
    }

    fn spec(target: &str) -> JobSpec {
        JobSpec {
            user: "test".into(),
            run_as: None,
            command: "uptime".into(),
            target: target.into(),
            namespace: "example".into(),
            timeout: 30,
            job_timeout: None,
            concurrent: Cap::Count(1),
            password: None,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_first_jobid_format() {
        let (d, _) = dispatcher().await;
        let jobid = d.run_job(spec("a1")).await.unwrap();
        assert_eq!(jobid.to_string(), "p0000000001");
    }

    #[tokio::test(start_paused = true)]
    async fn test_invalid_specs_create_no_job() {
        let (d, _) = dispatcher().await;

        let err = d.run_job(spec("%nope")).await.unwrap_err();
        assert!(matches!(err, Error::UnknownTag(_)));

        let mut bad_ns = spec("a1");
        bad_ns.namespace = "missing".into();
        let err = d.run_job(bad_ns).await.unwrap_err();
        assert!(matches!(err, Error::UnknownNamespace(_)));

        let mut empty = spec("a1");
        empty.command.clear();
        assert!(matches!(
            d.run_job(empty).await.unwrap_err(),
            Error::InvalidSpec(_)
        ));

        assert!(d.listjobs(ListFilters::default()).await.unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_ping() {
        let (d, _) = dispatcher().await;
        assert_eq!(d.ping(), 0xDEADBEEF);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stats_with_empty_fleet() {
        let (d, _) = dispatcher().await;
        let stats = d.stats().await.unwrap();
        assert_eq!(stats.workers_idle, 0);
        assert_eq!(stats.workers_busy, 0);
        assert!(!stats.hostname.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_listjobs_newest_first_and_filters() {
        let (d, _) = dispatcher().await;
        let first = d.run_job(spec("a1")).await.unwrap();
        let mut other = spec("a2");
        other.user = "alice".into();
        let second = d.run_job(other).await.unwrap();

        let all = d.listjobs(ListFilters::default()).await.unwrap();
        assert_eq!(all.len(), 2);
        assert_eq!(all[0].jobid, second);
        assert_eq!(all[1].jobid, first);

        let alice = d
            .listjobs(ListFilters {
                user: Some("alice".into()),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(alice.len(), 1);
        assert_eq!(alice[0].jobid, second);

        let paged = d
            .listjobs(ListFilters {
                limit: Some(1),
                page: Some(1),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(paged.len(), 1);
        assert_eq!(paged[0].jobid, first);
    }

    #[tokio::test(start_paused = true)]
    async fn test_jobinfo_and_status_pages() {
        let (d, sink) = dispatcher().await;
        let jobid = d.run_job(spec("a[1-3]")).await.unwrap();

        // Allow the controller's first tick to run
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(sink.dispatched.lock().unwrap().len(), 1);

        let info = d.jobinfo(jobid).await.unwrap();
        assert_eq!(info.record.spec.target, "a[1-3]");
        assert_eq!(info.hosts.running, 1);

        let page = d.jobstatus(jobid, 1, 1).await.unwrap();
        assert_eq!(page.total, 3);
        assert_eq!(page.hosts.len(), 1);
        assert_eq!(page.hosts[0].hostname, "a2");
    }

    #[tokio::test(start_paused = true)]
    async fn test_halt_surfaces_in_state() {
        let (d, _) = dispatcher().await;
        let jobid = d.run_job(spec("a[1-3]")).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        d.halt(jobid, Some("operator request".into())).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        let info = d.jobinfo(jobid).await.unwrap();
        assert_eq!(info.record.state.state, JobState::Halted);
        assert_eq!(info.record.state.halt_reason, Some(HaltReason::UserHalt));
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_finished_job_rejected() {
        let (d, sink) = dispatcher().await;
        let jobid = d.run_job(spec("a1")).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        let (req_id, task) = sink.dispatched.lock().unwrap()[0].clone();
        d.controllers.get(&jobid).unwrap().send(JobEvent::TaskFinished {
            hostname: task.hostname,
            req_id,
            outcome: crate::job::TaskOutcome::Completed {
                exit_code: 0,
                message: None,
                duration_ms: None,
            },
        });
        tokio::time::sleep(Duration::from_millis(50)).await;

        let err = d.retry(jobid, vec!["a1".into()]).await.unwrap_err();
        assert!(matches!(err, Error::InvalidSpec(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_liveness_record_registered() {
        let store = Arc::new(MemoryStore::new());
        let sink = NullSink::new();
        let d = Dispatcher::with_parts(Config::default(), store.clone(), sink)
            .await
            .unwrap();
        let registered = store.children(paths::DISPATCHERS).await.unwrap();
        assert_eq!(registered, vec![d.id().to_string()]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_namespace_cache_invalidated_on_store_change() {
        let store = Arc::new(MemoryStore::new());
        let sink = NullSink::new();
        let d = Dispatcher::with_parts(Config::default(), store.clone(), sink)
            .await
            .unwrap();
        d.loadconf("example", "hosts: {a1: [app]}\n").await.unwrap();
        d.run_job(spec("a1")).await.unwrap();

        // Another dispatcher rewrites the namespace behind our back
        let other = NamespaceView::new(store.clone() as Arc<dyn CoordinationStore>);
        other
            .write_config("example", "hosts: {b1: [app]}\n")
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        // The stale cache entry was dropped; the new host resolves
        let jobid = d.run_job(spec("b1")).await.unwrap();
        assert_eq!(jobid.seq(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_jobids_strictly_increase() {
        let (d, _) = dispatcher().await;
        let mut previous = 0;
        for _ in 0..5 {
            let jobid = d.run_job(spec("a1")).await.unwrap();
            assert!(jobid.seq() > previous);
            previous = jobid.seq();
        }
    }
}
