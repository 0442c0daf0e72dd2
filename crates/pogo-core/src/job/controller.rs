//! Job controller
//!
//! One controller task owns one job's lifecycle. Every input (user actions,
//! worker results, timer expiries) arrives as a [`JobEvent`] on the job's
//! queue and is processed in strict FIFO order. State lives in the
//! coordination store; the controller's in-memory maps are a cache
//! reconstructable from it, so a dispatcher restart rebuilds controllers
//! with no job loss.

use crate::job::{
    failure, HaltReason, HostState, JobEvent, JobSpec, JobState, JobStateRecord, TaskOutcome,
};
use crate::namespace::Namespace;
use crate::scheduler::{plan_tick, TickContext};
use crate::store::{CoordinationStore, HostView, JobView, NamespaceView};
use crate::worker::{DispatchTask, ReqId, SecretVault, TaskSink};
use crate::{JobId, Result};
use serde::Serialize;
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Host tallies by state, for `jobinfo` and `stats`
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct HostCounts {
    pub waiting: usize,
    pub ready: usize,
    pub running: usize,
    pub finished: usize,
    pub failed: usize,
    pub skipped: usize,
    pub deadlocked: usize,
}

impl HostCounts {
    /// Tally an iterator of host states
    pub fn tally<'a>(states: impl Iterator<Item = &'a HostState>) -> Self {
        let mut counts = HostCounts::default();
        for state in states {
            match state {
                HostState::Waiting => counts.waiting += 1,
                HostState::Ready => counts.ready += 1,
                HostState::Running => counts.running += 1,
                HostState::Finished => counts.finished += 1,
                HostState::Failed => counts.failed += 1,
                HostState::Skipped => counts.skipped += 1,
                HostState::Deadlocked => counts.deadlocked += 1,
            }
        }
        counts
    }
}

/// Shared collaborators handed to every controller
#[derive(Clone)]
pub struct ControllerContext {
    /// Coordination store session
    pub store: Arc<dyn CoordinationStore>,

    /// Where dispatches go
    pub sink: Arc<dyn TaskSink>,

    /// Password vault
    pub vault: Arc<SecretVault>,

    /// Serializes scheduler ticks across jobs of one namespace
    pub ns_gate: Arc<tokio::sync::Mutex<()>>,

    /// Multiplier on the per-host timeout for the abandon safety timer
    pub abandon_factor: u32,
}

/// Sender side of a running controller
pub struct JobHandle {
    /// The job
    pub jobid: JobId,

    tx: mpsc::UnboundedSender<JobEvent>,
    join: JoinHandle<()>,
}

impl JobHandle {
    /// Enqueue an event; false when the controller already stopped
    pub fn send(&self, event: JobEvent) -> bool {
        self.tx.send(event).is_ok()
    }

    /// Check whether the controller task has exited
    pub fn is_terminated(&self) -> bool {
        self.join.is_finished()
    }
}

/// The controller behind a [`JobHandle`]
pub struct JobController {
    jobid: JobId,
    spec: JobSpec,
    order: Vec<String>,
    ns: Namespace,

    jobs: JobView<dyn CoordinationStore>,
    hosts: HostView<dyn CoordinationStore>,
    namespaces: NamespaceView<dyn CoordinationStore>,
    sink: Arc<dyn TaskSink>,
    vault: Arc<SecretVault>,
    ns_gate: Arc<tokio::sync::Mutex<()>>,
    abandon_factor: u32,

    tx: mpsc::UnboundedSender<JobEvent>,

    // In-memory mirrors of store state
    state: JobStateRecord,
    states: HashMap<String, HostState>,
    attempts: HashMap<String, ReqId>,
    held_locks: HashMap<String, Vec<String>>,
    host_timers: HashMap<String, JoinHandle<()>>,
    job_timer: Option<JoinHandle<()>>,
    done: bool,
}

impl JobController {
    /// Spawn the controller task for a job already persisted to the store
    pub fn spawn(
        jobid: JobId,
        spec: JobSpec,
        order: Vec<String>,
        ns: Namespace,
        ctx: ControllerContext,
    ) -> JobHandle {
        let (tx, rx) = mpsc::unbounded_channel();

        let controller = JobController {
            jobid,
            spec,
            order,
            ns,
            jobs: JobView::new(ctx.store.clone()),
            hosts: HostView::new(ctx.store.clone()),
            namespaces: NamespaceView::new(ctx.store.clone()),
            sink: ctx.sink,
            vault: ctx.vault,
            ns_gate: ctx.ns_gate,
            abandon_factor: ctx.abandon_factor.max(1),
            tx: tx.clone(),
            state: JobStateRecord::new(),
            states: HashMap::new(),
            attempts: HashMap::new(),
            held_locks: HashMap::new(),
            host_timers: HashMap::new(),
            job_timer: None,
            done: false,
        };

        let join = tokio::spawn(controller.run(rx));

        JobHandle { jobid, tx, join }
    }

    async fn run(mut self, mut rx: mpsc::UnboundedReceiver<JobEvent>) {
        if let Err(e) = self.load().await {
            warn!("job {} failed to load: {}", self.jobid, e);
            return;
        }

        while let Some(event) = rx.recv().await {
            if let Err(e) = self.handle(event).await {
                warn!("job {} event handling failed: {}", self.jobid, e);
            }
            if self.done {
                break;
            }
        }

        for (_, timer) in self.host_timers.drain() {
            timer.abort();
        }
        if let Some(timer) = self.job_timer.take() {
            timer.abort();
        }
        self.vault.purge_job(self.jobid);

        info!(
            "job {} controller stopped: state={}",
            self.jobid,
            self.state.display_state()
        );
    }

    /// Rebuild the in-memory mirrors from the store
    async fn load(&mut self) -> Result<()> {
        let (state, _) = self.jobs.read_state(self.jobid).await?;
        self.state = state;

        let records = self.hosts.read_many(self.jobid, &self.order).await?;
        self.states = records
            .into_iter()
            .map(|record| (record.hostname.clone(), record.state))
            .collect();

        Ok(())
    }

    async fn handle(&mut self, event: JobEvent) -> Result<()> {
        match event {
            JobEvent::Start => self.start().await,
            JobEvent::Tick => self.tick().await,
            JobEvent::Halt { reason } => self.halt(reason).await,
            JobEvent::Retry { hosts } => self.retry(hosts).await,
            JobEvent::TaskAccepted { hostname, req_id } => {
                debug!(
                    "job {} task accepted: hostname={}, req_id={}",
                    self.jobid, hostname, req_id
                );
                Ok(())
            }
            JobEvent::TaskProgress {
                hostname, req_id, ..
            } => {
                debug!(
                    "job {} progress: hostname={}, req_id={}",
                    self.jobid, hostname, req_id
                );
                Ok(())
            }
            JobEvent::TaskFinished {
                hostname,
                req_id,
                outcome,
            } => {
                self.settle_host(&hostname, outcome, Some(req_id)).await?;
                self.tick().await
            }
            JobEvent::HostTimeout { hostname, req_id } => {
                self.host_timeout(&hostname, req_id).await
            }
            JobEvent::AbandonDeadline { hostname, req_id } => {
                self.abandon_deadline(&hostname, req_id).await
            }
            JobEvent::JobTimeout => self.halt(HaltReason::Timeout).await,
        }
    }

    async fn start(&mut self) -> Result<()> {
        if self.state.state.is_terminal() {
            return Ok(());
        }

        let (state, _) = self
            .jobs
            .update_state(self.jobid, |s| s.transition(JobState::Pending))
            .await?;
        self.state = state;

        // After a dispatcher restart a host can be recorded running with no
        // live dispatch behind it; its worker session died with the old session
        let stranded: Vec<String> = self
            .states
            .iter()
            .filter(|(host, state)| {
                **state == HostState::Running && !self.attempts.contains_key(*host)
            })
            .map(|(host, _)| host.clone())
            .collect();
        for host in stranded {
            self.settle_host(&host, TaskOutcome::WorkerLost, None).await?;
        }

        if self.job_timer.is_none() {
            if let Some(job_timeout) = self.spec.job_timeout {
                let tx = self.tx.clone();
                self.job_timer = Some(tokio::spawn(async move {
                    tokio::time::sleep(Duration::from_secs(job_timeout)).await;
                    let _ = tx.send(JobEvent::JobTimeout);
                }));
            }
        }

        self.tick().await
    }

    /// One scheduling pass: readiness, admission, dispatch
    async fn tick(&mut self) -> Result<()> {
        if self.state.state.is_terminal() {
            return self.check_completion().await;
        }

        if self.state.state == JobState::Pending {
            let (state, _) = self
                .jobs
                .update_state(self.jobid, |s| s.transition(JobState::Running))
                .await?;
            self.state = state;
        }

        let gate = self.ns_gate.clone();
        let _guard = gate.lock().await;

        let lock_counts = match self.namespaces.lock_counts(&self.spec.namespace).await {
            Ok(counts) => counts,
            Err(crate::Error::StoreUnavailable(msg)) => {
                // The scheduler pauses; the job is not failed
                warn!("job {} tick deferred, store unavailable: {}", self.jobid, msg);
                return Ok(());
            }
            Err(e) => return Err(e),
        };

        let job_cap = self.spec.concurrent.resolve(self.order.len()).max(1);
        let plan = plan_tick(&TickContext {
            ns: &self.ns,
            order: &self.order,
            states: &self.states,
            job_cap,
            lock_counts: &lock_counts,
        });

        if plan.is_noop() {
            drop(_guard);
            return self.check_completion().await;
        }

        for hostname in &plan.skip {
            let (record, _) = self
                .hosts
                .update(self.jobid, hostname, |host| {
                    if host.state == HostState::Waiting {
                        host.transition(HostState::Ready);
                    }
                    if host.transition(HostState::Skipped) {
                        host.message = Some("predecessor failed".to_string());
                        true
                    } else {
                        false
                    }
                })
                .await?;
            self.states.insert(hostname.clone(), record.state);
        }

        for hostname in &plan.deadlock {
            let (record, _) = self
                .hosts
                .update(self.jobid, hostname, |host| {
                    if host.transition(HostState::Deadlocked) {
                        host.message = Some("predecessors can never finish".to_string());
                        true
                    } else {
                        false
                    }
                })
                .await?;
            self.states.insert(hostname.clone(), record.state);
            info!("job {} host {} deadlocked", self.jobid, hostname);
        }

        let admitted: BTreeSet<&String> = plan.admit.iter().collect();
        for hostname in &plan.promote {
            if admitted.contains(hostname) {
                continue;
            }
            let (record, _) = self
                .hosts
                .update(self.jobid, hostname, |host| {
                    host.transition(HostState::Ready)
                })
                .await?;
            self.states.insert(hostname.clone(), record.state);
        }

        for hostname in &plan.admit {
            self.launch_host(hostname).await?;
        }

        drop(_guard);
        self.check_completion().await
    }

    /// Take locks, dispatch, and mark one host running
    async fn launch_host(&mut self, hostname: &str) -> Result<()> {
        // Lock every capped slot the host consumes before dispatching; a
        // stale lock-count read is caught here by the store, not by us
        let mut labels: BTreeSet<String> = BTreeSet::new();
        for rule in self.ns.rules_for(hostname) {
            if rule.max_parallel.is_some() {
                labels.insert(rule.applies_to.label().to_string());
            }
        }

        let mut lock_paths = Vec::with_capacity(labels.len());
        for label in &labels {
            match self
                .namespaces
                .create_lock(&self.spec.namespace, label, self.jobid, hostname)
                .await
            {
                Ok(path) => lock_paths.push(path),
                Err(e) => {
                    for path in &lock_paths {
                        let _ = self.namespaces.release_lock(path).await;
                    }
                    return Err(e);
                }
            }
        }

        let password_ref = self
            .spec
            .password
            .as_ref()
            .map(|password| self.vault.register(self.jobid, password));

        let task = DispatchTask {
            jobid: self.jobid,
            hostname: hostname.to_string(),
            command: self.spec.command.clone(),
            run_as: self.spec.run_as.clone(),
            timeout: self.spec.timeout,
            password_ref: password_ref.clone(),
        };

        let receipt = match self.sink.dispatch(task).await {
            Ok(receipt) => receipt,
            Err(e) => {
                // No worker: give the slots back and leave the host ready
                for path in &lock_paths {
                    let _ = self.namespaces.release_lock(path).await;
                }
                if let Some(reference) = &password_ref {
                    drop(self.vault.take(reference));
                }
                let (record, _) = self
                    .hosts
                    .update(self.jobid, hostname, |host| {
                        host.transition(HostState::Ready)
                    })
                    .await?;
                self.states.insert(hostname.to_string(), record.state);
                debug!("job {} dispatch deferred for {}: {}", self.jobid, hostname, e);
                return Ok(());
            }
        };

        let worker = receipt.worker.clone();
        let (record, _) = self
            .hosts
            .update(self.jobid, hostname, |host| {
                if host.state == HostState::Waiting {
                    host.transition(HostState::Ready);
                }
                host.mark_running(worker.clone())
            })
            .await?;
        self.states.insert(hostname.to_string(), record.state);
        self.attempts.insert(hostname.to_string(), receipt.req_id);
        self.held_locks.insert(hostname.to_string(), lock_paths);
        self.arm_host_timer(hostname, receipt.req_id);

        info!(
            "job {} dispatched {} to {} (req_id={})",
            self.jobid, hostname, receipt.worker, receipt.req_id
        );

        Ok(())
    }

    fn arm_host_timer(&mut self, hostname: &str, req_id: ReqId) {
        let tx = self.tx.clone();
        let host = hostname.to_string();
        let timeout = Duration::from_secs(self.spec.timeout);
        let timer = tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            let _ = tx.send(JobEvent::HostTimeout {
                hostname: host,
                req_id,
            });
        });
        if let Some(old) = self.host_timers.insert(hostname.to_string(), timer) {
            old.abort();
        }
    }

    fn arm_abandon_timer(&self, hostname: &str, req_id: ReqId) {
        let tx = self.tx.clone();
        let host = hostname.to_string();
        let deadline = Duration::from_secs(self.spec.timeout * self.abandon_factor as u64);
        tokio::spawn(async move {
            tokio::time::sleep(deadline).await;
            let _ = tx.send(JobEvent::AbandonDeadline {
                hostname: host,
                req_id,
            });
        });
    }

    /// Record a terminal outcome for one dispatch attempt
    ///
    /// `req_id` guards against stale events: a late result for a superseded
    /// attempt is dropped, so a host gets exactly one terminal record per
    /// attempt.
    async fn settle_host(
        &mut self,
        hostname: &str,
        outcome: TaskOutcome,
        req_id: Option<ReqId>,
    ) -> Result<()> {
        if let Some(req_id) = req_id {
            if self.attempts.get(hostname) != Some(&req_id) {
                debug!(
                    "job {} stale outcome for {} (req_id={}), ignored",
                    self.jobid, hostname, req_id
                );
                return Ok(());
            }
        }

        if let Some(timer) = self.host_timers.remove(hostname) {
            timer.abort();
        }

        let (record, wrote) = self
            .hosts
            .update(self.jobid, hostname, |host| host.record_outcome(&outcome))
            .await?;
        if wrote {
            info!(
                "job {} host {} -> {}{}",
                self.jobid,
                hostname,
                record.state,
                record
                    .message
                    .as_deref()
                    .map(|m| format!(" ({})", m))
                    .unwrap_or_default()
            );
        }

        self.states.insert(hostname.to_string(), record.state);
        self.attempts.remove(hostname);
        if let Some(locks) = self.held_locks.remove(hostname) {
            for path in locks {
                let _ = self.namespaces.release_lock(&path).await;
            }
        }

        Ok(())
    }

    async fn host_timeout(&mut self, hostname: &str, req_id: ReqId) -> Result<()> {
        if self.attempts.get(hostname) != Some(&req_id)
            || self.states.get(hostname) != Some(&HostState::Running)
        {
            return Ok(());
        }

        self.sink.cancel(req_id).await;
        self.settle_host(hostname, TaskOutcome::Timeout, Some(req_id))
            .await?;

        // The worker may never answer the cancel; reclaim its slot later
        let sink = self.sink.clone();
        let deadline = Duration::from_secs(self.spec.timeout * self.abandon_factor as u64);
        tokio::spawn(async move {
            tokio::time::sleep(deadline).await;
            sink.abandon(req_id).await;
        });

        self.tick().await
    }

    async fn abandon_deadline(&mut self, hostname: &str, req_id: ReqId) -> Result<()> {
        if self.attempts.get(hostname) != Some(&req_id)
            || self.states.get(hostname) != Some(&HostState::Running)
        {
            return Ok(());
        }

        self.settle_host(hostname, TaskOutcome::Abandoned, Some(req_id))
            .await?;
        self.sink.abandon(req_id).await;
        self.check_completion().await
    }

    async fn halt(&mut self, reason: HaltReason) -> Result<()> {
        let (state, wrote) = self
            .jobs
            .update_state(self.jobid, |s| s.halt(reason))
            .await?;
        self.state = state;
        if !wrote {
            return Ok(());
        }

        info!("job {} halted: reason={}", self.jobid, reason);

        if let Some(timer) = self.job_timer.take() {
            timer.abort();
        }

        let idle_message = match reason {
            HaltReason::Timeout => failure::JOB_TIMEOUT,
            _ => failure::CANCELLED,
        };

        for hostname in self.order.clone() {
            let state = self.states.get(&hostname).copied().unwrap_or_default();
            match state {
                HostState::Running => {
                    let req_id = match self.attempts.get(&hostname) {
                        Some(req_id) => *req_id,
                        None => continue,
                    };
                    // The cancellation path owns the host now; the per-host
                    // timer must not race it
                    if let Some(timer) = self.host_timers.remove(&hostname) {
                        timer.abort();
                    }
                    self.sink.cancel(req_id).await;
                    if reason == HaltReason::Timeout {
                        // Whole-job expiry records running hosts immediately
                        self.settle_host(&hostname, TaskOutcome::JobTimeout, Some(req_id))
                            .await?;
                        let sink = self.sink.clone();
                        let deadline =
                            Duration::from_secs(self.spec.timeout * self.abandon_factor as u64);
                        tokio::spawn(async move {
                            tokio::time::sleep(deadline).await;
                            sink.abandon(req_id).await;
                        });
                    } else {
                        // Wait for the worker's cancelled result, bounded by
                        // the abandon safety timer
                        self.arm_abandon_timer(&hostname, req_id);
                    }
                }
                state if !state.is_terminal() => {
                    let (record, _) = self
                        .hosts
                        .update(self.jobid, &hostname, |host| {
                            if host.transition(HostState::Failed) {
                                host.message = Some(idle_message.to_string());
                                true
                            } else {
                                false
                            }
                        })
                        .await?;
                    self.states.insert(hostname.clone(), record.state);
                }
                _ => {}
            }
        }

        self.check_completion().await
    }

    async fn retry(&mut self, hosts: Vec<String>) -> Result<()> {
        if self.state.state == JobState::Finished {
            warn!("job {} retry ignored: job is finished", self.jobid);
            return Ok(());
        }

        for hostname in hosts {
            if !self.states.contains_key(&hostname) {
                warn!("job {} retry of unknown host {}", self.jobid, hostname);
                continue;
            }
            let (record, wrote) = self
                .hosts
                .update(self.jobid, &hostname, |host| host.reset_for_retry())
                .await?;
            if wrote {
                info!("job {} host {} requeued", self.jobid, hostname);
                self.states.insert(hostname.clone(), record.state);
            }
        }

        self.tick().await
    }

    /// Drive the job to its own terminal state once every host is terminal
    async fn check_completion(&mut self) -> Result<()> {
        let all_terminal = self.states.values().all(|state| state.is_terminal());
        if !all_terminal {
            return Ok(());
        }

        let all_finished = self.states.values().all(|s| *s == HostState::Finished);
        let exit_status = if all_finished { 0 } else { 1 };

        let (state, _) = self
            .jobs
            .update_state(self.jobid, |s| {
                let mut wrote = false;
                if s.state == JobState::Running && s.transition(JobState::Finished) {
                    wrote = true;
                }
                if s.state.is_terminal() && s.exit_status.is_none() {
                    s.exit_status = Some(exit_status);
                    wrote = true;
                }
                wrote
            })
            .await?;
        self.state = state;

        if self.state.state.is_terminal() && self.attempts.is_empty() {
            self.vault.purge_job(self.jobid);
            self.done = true;
        }

        Ok(())
    }

    /// Host tallies for the stats surface
    pub fn host_counts(&self) -> HostCounts {
        HostCounts::tally(self.states.values())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::namespace::Cap;
    use crate::store::{paths, MemoryStore};
    use crate::worker::pool::DispatchReceipt;
    use crate::{target, Error};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
    use std::sync::Mutex as StdMutex;

    struct MockSink {
        accept: AtomicBool,
        next: AtomicU64,
        dispatched: StdMutex<Vec<(ReqId, DispatchTask)>>,
        cancelled: StdMutex<Vec<ReqId>>,
    }

    impl MockSink {
        fn new(accept: bool) -> Arc<Self> {
            Arc::new(Self {
                accept: AtomicBool::new(accept),
                next: AtomicU64::new(1),
                dispatched: StdMutex::new(Vec::new()),
                cancelled: StdMutex::new(Vec::new()),
            })
        }

        fn dispatched(&self) -> Vec<(ReqId, DispatchTask)> {
            self.dispatched.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl TaskSink for MockSink {
        async fn dispatch(&self, task: DispatchTask) -> Result<DispatchReceipt> {
            if !self.accept.load(Ordering::SeqCst) {
                return Err(Error::dispatch_rejected("no worker available"));
            }
            let req_id = self.next.fetch_add(1, Ordering::SeqCst);
            self.dispatched.lock().unwrap().push((req_id, task));
            Ok(DispatchReceipt {
                req_id,
                worker: "mock-worker".to_string(),
            })
        }

        async fn cancel(&self, req_id: ReqId) {
            self.cancelled.lock().unwrap().push(req_id);
        }

        async fn abandon(&self, _req_id: ReqId) {}
    }

    struct Harness {
        store: Arc<MemoryStore>,
        sink: Arc<MockSink>,
        vault: Arc<SecretVault>,
        jobid: JobId,
        order: Vec<String>,
        handle: JobHandle,
    }

    async fn setup(spec: JobSpec, ns_yaml: &str, accept: bool) -> Harness {
        let store = Arc::new(MemoryStore::new());
        let sink = MockSink::new(accept);
        let vault = Arc::new(SecretVault::new());

        let namespaces = NamespaceView::new(store.clone() as Arc<dyn CoordinationStore>);
        namespaces
            .write_config(&spec.namespace, ns_yaml)
            .await
            .unwrap();
        let ns = namespaces.read(&spec.namespace).await.unwrap();

        let order = target::expand(&spec.target, &ns).unwrap();

        let jobs = JobView::new(store.clone() as Arc<dyn CoordinationStore>);
        let jobid = jobs.create(&spec, &order).await.unwrap();
        HostView::new(store.clone() as Arc<dyn CoordinationStore>)
            .seed(jobid, &order)
            .await
            .unwrap();

        let handle = JobController::spawn(
            jobid,
            spec,
            order.clone(),
            ns,
            ControllerContext {
                store: store.clone(),
                sink: sink.clone(),
                vault: vault.clone(),
                ns_gate: Arc::new(tokio::sync::Mutex::new(())),
                abandon_factor: 2,
            },
        );

        Harness {
            store,
            sink,
            vault,
            jobid,
            order,
            handle,
        }
    }

    fn spec(target: &str, concurrent: Cap) -> JobSpec {
        JobSpec {
            user: "test".into(),
            run_as: None,
            command: "echo job1".into(),
            target: target.into(),
            namespace: "example".into(),
            timeout: 30,
            job_timeout: None,
            concurrent,
            password: None,
        }
    }

    async fn job_state(h: &Harness) -> JobStateRecord {
        let jobs = JobView::new(h.store.clone() as Arc<dyn CoordinationStore>);
        jobs.read_state(h.jobid).await.unwrap().0
    }

    async fn host_state(h: &Harness, hostname: &str) -> HostState {
        let hosts = HostView::new(h.store.clone() as Arc<dyn CoordinationStore>);
        hosts.read(h.jobid, hostname).await.unwrap().0.state
    }

    async fn eventually<F, Fut>(mut check: F)
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = bool>,
    {
        for _ in 0..100 {
            if check().await {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("condition never reached");
    }

    const FLAT_NS: &str = "hosts: {a1: [app], a2: [app], a3: [app]}\n";

    #[tokio::test(start_paused = true)]
    async fn test_happy_path_to_finished() {
        let h = setup(spec("a[1-3]", Cap::Count(2)), FLAT_NS, true).await;
        h.handle.send(JobEvent::Start);

        // Job cap 2: exactly two dispatches at first
        eventually(|| async { h.sink.dispatched().len() == 2 }).await;
        assert_eq!(job_state(&h).await.state, JobState::Running);

        for (req_id, task) in h.sink.dispatched() {
            h.handle.send(JobEvent::TaskFinished {
                hostname: task.hostname,
                req_id,
                outcome: TaskOutcome::Completed {
                    exit_code: 0,
                    message: None,
                    duration_ms: Some(10),
                },
            });
        }

        eventually(|| async { h.sink.dispatched().len() == 3 }).await;
        let (req_id, task) = h.sink.dispatched()[2].clone();
        h.handle.send(JobEvent::TaskFinished {
            hostname: task.hostname,
            req_id,
            outcome: TaskOutcome::Completed {
                exit_code: 0,
                message: None,
                duration_ms: Some(10),
            },
        });

        eventually(|| async { job_state(&h).await.state == JobState::Finished }).await;
        let state = job_state(&h).await;
        assert_eq!(state.exit_status, Some(0));
        for host in &h.order {
            assert_eq!(host_state(&h, host).await, HostState::Finished);
        }
        eventually(|| async { h.handle.is_terminated() }).await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_nonzero_exit_finishes_with_failure() {
        let h = setup(spec("a1", Cap::Count(1)), FLAT_NS, true).await;
        h.handle.send(JobEvent::Start);
        eventually(|| async { h.sink.dispatched().len() == 1 }).await;

        let (req_id, task) = h.sink.dispatched()[0].clone();
        h.handle.send(JobEvent::TaskFinished {
            hostname: task.hostname,
            req_id,
            outcome: TaskOutcome::Completed {
                exit_code: 3,
                message: Some("exit 3".into()),
                duration_ms: None,
            },
        });

        eventually(|| async { job_state(&h).await.state == JobState::Finished }).await;
        assert_eq!(job_state(&h).await.exit_status, Some(1));
        assert_eq!(host_state(&h, "a1").await, HostState::Failed);
    }

    // With no workers and a 3s job timeout, the job halts and every host is
    // recorded failed(job_timeout)
    #[tokio::test(start_paused = true)]
    async fn test_job_timeout_with_no_workers() {
        let ns = "hosts: {foo1.example.com: [], foo2.example.com: [], foo3.example.com: [],
  foo4.example.com: [], foo5.example.com: [], foo6.example.com: [], foo7.example.com: [],
  foo8.example.com: [], foo9.example.com: [], foo10.example.com: []}\n";
        let mut s = spec("foo[1-10].example.com", Cap::Count(1));
        s.timeout = 3;
        s.job_timeout = Some(3);
        let h = setup(s, ns, false).await;
        h.handle.send(JobEvent::Start);

        eventually(|| async { job_state(&h).await.state == JobState::Running }).await;

        tokio::time::sleep(Duration::from_millis(3500)).await;

        eventually(|| async { job_state(&h).await.state == JobState::Halted }).await;
        let state = job_state(&h).await;
        assert_eq!(state.halt_reason, Some(HaltReason::Timeout));
        assert_eq!(state.display_state(), "halted(timeout)");

        let hosts = HostView::new(h.store.clone() as Arc<dyn CoordinationStore>);
        for hostname in &h.order {
            let (record, _) = hosts.read(h.jobid, hostname).await.unwrap();
            assert_eq!(record.state, HostState::Failed);
            assert_eq!(record.message.as_deref(), Some(failure::JOB_TIMEOUT));
        }
    }

    // Namespace cap db=1 with job concurrency 4: never two db hosts running
    #[tokio::test(start_paused = true)]
    async fn test_tag_cap_serializes_db_hosts() {
        let ns = r#"
hosts:
  db1: [db]
  db2: [db]
  db3: [db]
  db4: [db]
constraints:
  - applies_to: "%db"
    max_parallel: 1
"#;
        let h = setup(spec("%db", Cap::Count(4)), ns, true).await;
        h.handle.send(JobEvent::Start);

        let mut completed = 0;
        while completed < 4 {
            eventually(|| async { h.sink.dispatched().len() == completed + 1 }).await;
            // The cap admits one at a time even with job budget for four
            assert_eq!(h.sink.dispatched().len(), completed + 1);

            let (req_id, task) = h.sink.dispatched()[completed].clone();
            h.handle.send(JobEvent::TaskFinished {
                hostname: task.hostname,
                req_id,
                outcome: TaskOutcome::Completed {
                    exit_code: 0,
                    message: None,
                    duration_ms: None,
                },
            });
            completed += 1;
        }

        eventually(|| async { job_state(&h).await.state == JobState::Finished }).await;
        assert_eq!(job_state(&h).await.exit_status, Some(0));
    }

    #[tokio::test(start_paused = true)]
    async fn test_sequence_and_deadlock_detection() {
        let ns = r#"
hosts:
  db1: [db]
  web1: [web]
  web2: [web]
constraints:
  - applies_to: "%web"
    sequence_before: ["%db"]
"#;
        let h = setup(spec("db1,web[1-2]", Cap::Count(3)), ns, true).await;
        h.handle.send(JobEvent::Start);

        // Only the predecessor dispatches first
        eventually(|| async { h.sink.dispatched().len() == 1 }).await;
        assert_eq!(h.sink.dispatched()[0].1.hostname, "db1");

        // Its failure deadlocks both dependents within one tick
        let (req_id, _) = h.sink.dispatched()[0].clone();
        h.handle.send(JobEvent::TaskFinished {
            hostname: "db1".into(),
            req_id,
            outcome: TaskOutcome::Completed {
                exit_code: 1,
                message: None,
                duration_ms: None,
            },
        });

        eventually(|| async { host_state(&h, "web1").await == HostState::Deadlocked }).await;
        assert_eq!(host_state(&h, "web2").await, HostState::Deadlocked);
        eventually(|| async { job_state(&h).await.state == JobState::Finished }).await;
        assert_eq!(job_state(&h).await.exit_status, Some(1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_after_host_timeout() {
        let mut s = spec("a1", Cap::Count(1));
        s.timeout = 5;
        let h = setup(s, FLAT_NS, true).await;
        h.handle.send(JobEvent::Start);
        eventually(|| async { h.sink.dispatched().len() == 1 }).await;

        // Let the per-host timer fire; the dispatch is cancelled and the
        // host fails with a timeout marker
        tokio::time::sleep(Duration::from_millis(5500)).await;
        eventually(|| async { host_state(&h, "a1").await == HostState::Failed }).await;
        assert!(!h.sink.cancelled.lock().unwrap().is_empty());

        let hosts = HostView::new(h.store.clone() as Arc<dyn CoordinationStore>);
        let (record, _) = hosts.read(h.jobid, "a1").await.unwrap();
        assert_eq!(record.message.as_deref(), Some(failure::TIMEOUT));

        // Retry requeues and the second attempt succeeds
        h.handle.send(JobEvent::Retry {
            hosts: vec!["a1".into()],
        });
        eventually(|| async { h.sink.dispatched().len() == 2 }).await;
        let (req_id, task) = h.sink.dispatched()[1].clone();
        h.handle.send(JobEvent::TaskFinished {
            hostname: task.hostname,
            req_id,
            outcome: TaskOutcome::Completed {
                exit_code: 0,
                message: None,
                duration_ms: None,
            },
        });

        eventually(|| async { job_state(&h).await.state == JobState::Finished }).await;
        assert_eq!(host_state(&h, "a1").await, HostState::Finished);
    }

    #[tokio::test(start_paused = true)]
    async fn test_halt_cancels_and_abandons_silent_worker() {
        let mut s = spec("a[1-2]", Cap::Count(1));
        s.timeout = 10;
        let h = setup(s, FLAT_NS, true).await;
        h.handle.send(JobEvent::Start);
        eventually(|| async { h.sink.dispatched().len() == 1 }).await;

        h.handle.send(JobEvent::Halt {
            reason: HaltReason::UserHalt,
        });

        // The idle host fails immediately; the running one gets a cancel
        eventually(|| async { host_state(&h, "a2").await == HostState::Failed }).await;
        eventually(|| async { !h.sink.cancelled.lock().unwrap().is_empty() }).await;
        assert_eq!(host_state(&h, "a1").await, HostState::Running);

        // The worker never answers; the 2x safety timer abandons the host
        tokio::time::sleep(Duration::from_millis(20_500)).await;
        eventually(|| async { host_state(&h, "a1").await == HostState::Failed }).await;

        let hosts = HostView::new(h.store.clone() as Arc<dyn CoordinationStore>);
        let (record, _) = hosts.read(h.jobid, "a1").await.unwrap();
        assert_eq!(record.message.as_deref(), Some(failure::ABANDONED));

        let state = job_state(&h).await;
        assert_eq!(state.state, JobState::Halted);
        assert_eq!(state.halt_reason, Some(HaltReason::UserHalt));
        eventually(|| async { h.handle.is_terminated() }).await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_worker_lost_releases_lock_and_records_once() {
        let ns = r#"
hosts:
  db1: [db]
constraints:
  - applies_to: "%db"
    max_parallel: 1
"#;
        let h = setup(spec("db1", Cap::Count(1)), ns, true).await;
        h.handle.send(JobEvent::Start);
        eventually(|| async { h.sink.dispatched().len() == 1 }).await;

        let namespaces = NamespaceView::new(h.store.clone() as Arc<dyn CoordinationStore>);
        assert_eq!(
            namespaces.lock_counts("example").await.unwrap().get("db"),
            Some(&1)
        );

        let (req_id, _) = h.sink.dispatched()[0].clone();
        h.handle.send(JobEvent::TaskFinished {
            hostname: "db1".into(),
            req_id,
            outcome: TaskOutcome::WorkerLost,
        });
        // A straggling duplicate must not double-record
        h.handle.send(JobEvent::TaskFinished {
            hostname: "db1".into(),
            req_id,
            outcome: TaskOutcome::Completed {
                exit_code: 0,
                message: None,
                duration_ms: None,
            },
        });

        eventually(|| async { job_state(&h).await.state == JobState::Finished }).await;
        let hosts = HostView::new(h.store.clone() as Arc<dyn CoordinationStore>);
        let (record, _) = hosts.read(h.jobid, "db1").await.unwrap();
        assert_eq!(record.state, HostState::Failed);
        assert_eq!(record.message.as_deref(), Some(failure::WORKER_LOST));

        // The slot is free again
        assert!(namespaces.lock_counts("example").await.unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_password_purged_and_never_stored() {
        let mut s = spec("a1", Cap::Count(1));
        s.password = Some("hunter2".into());
        let h = setup(s, FLAT_NS, true).await;
        h.handle.send(JobEvent::Start);
        eventually(|| async { h.sink.dispatched().len() == 1 }).await;

        // The dispatch carries a reference, not the password
        let (req_id, task) = h.sink.dispatched()[0].clone();
        let reference = task.password_ref.clone().unwrap();
        assert_ne!(reference, "hunter2");

        h.handle.send(JobEvent::TaskFinished {
            hostname: task.hostname,
            req_id,
            outcome: TaskOutcome::Completed {
                exit_code: 0,
                message: None,
                duration_ms: None,
            },
        });
        eventually(|| async { job_state(&h).await.state == JobState::Finished }).await;
        eventually(|| async { h.handle.is_terminated() }).await;

        // Vault drained, and no store byte sequence equals the password
        assert!(h.vault.is_empty());
        for (_, data) in h.store.dump() {
            let text = String::from_utf8_lossy(&data);
            assert!(!text.contains("hunter2"));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_lock_paths_layout() {
        let ns = r#"
hosts:
  db1: [db]
constraints:
  - applies_to: "%db"
    max_parallel: 1
"#;
        let h = setup(spec("db1", Cap::Count(1)), ns, true).await;
        h.handle.send(JobEvent::Start);
        eventually(|| async { h.sink.dispatched().len() == 1 }).await;

        let held = h
            .store
            .children(&paths::ns_lock_dir("example", "db"))
            .await
            .unwrap();
        assert_eq!(held.len(), 1);
    }
}
