//! Typed, per-path views over the coordination store
//!
//! The rest of the core reads and writes records, not bytes: `JobView`,
//! `HostView`, and `NamespaceView` wrap the store with serde and CAS
//! semantics. Every mutation is an expected-version set; on conflict the
//! caller's closure re-decides against the fresh record, up to
//! [`MAX_CAS_ATTEMPTS`] before surfacing an internal error.

use super::{paths, CoordinationStore, CreateFlags, StoreError, Version};
use crate::job::{HostRecord, JobSpec, JobStateRecord};
use crate::namespace::Namespace;
use crate::{Error, JobId, Result};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;

/// CAS attempts before a conflict is declared unrecoverable
pub const MAX_CAS_ATTEMPTS: u32 = 10;

/// Read-modify-write a JSON record with CAS
///
/// The closure returns `false` to abort without writing. Returns the final
/// record and whether a write happened.
pub async fn update_json<S, T, F>(store: &S, path: &str, mut mutate: F) -> Result<(T, bool)>
where
    S: CoordinationStore + ?Sized,
    T: Serialize + DeserializeOwned,
    F: FnMut(&mut T) -> bool,
{
    for _ in 0..MAX_CAS_ATTEMPTS {
        let (data, version) = store.get(path).await.map_err(Error::from)?;
        let mut value: T = serde_json::from_slice(&data)?;
        if !mutate(&mut value) {
            return Ok((value, false));
        }
        let updated = serde_json::to_vec(&value)?;
        match store.set(path, &updated, version).await {
            Ok(_) => return Ok((value, true)),
            Err(StoreError::Conflict { .. }) => continue,
            Err(e) => return Err(e.into()),
        }
    }
    Err(Error::internal(format!(
        "CAS attempts exhausted on {}",
        path
    )))
}

/// Job document persisted at `/pogo/jobs/<jobid>`
///
/// Carries the spec (password skipped by its serde attributes) plus the
/// expanded host order, which the scheduler needs for fair admission.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobDoc {
    /// The submitted spec, sans password
    #[serde(flatten)]
    pub spec: JobSpec,

    /// Hosts in expansion order
    pub hosts: Vec<String>,
}

/// Typed view over job nodes
pub struct JobView<S: ?Sized> {
    store: Arc<S>,
}

impl<S: CoordinationStore + ?Sized> JobView<S> {
    /// Create a view
    pub fn new(store: Arc<S>) -> Self {
        Self { store }
    }

    /// Allocate a jobid and persist the job document and initial state
    pub async fn create(&self, spec: &JobSpec, hosts: &[String]) -> Result<JobId> {
        let doc = JobDoc {
            spec: spec.clone(),
            hosts: hosts.to_vec(),
        };
        let data = serde_json::to_vec(&doc)?;
        let path = self
            .store
            .create(paths::JOB_SEQ, &data, CreateFlags::SEQUENTIAL)
            .await
            .map_err(Error::from)?;
        let jobid = JobId::from_path(&path)?;

        let state = JobStateRecord::new();
        self.store
            .create(
                &paths::job_state(jobid),
                &serde_json::to_vec(&state)?,
                CreateFlags::NONE,
            )
            .await
            .map_err(Error::from)?;

        Ok(jobid)
    }

    /// Read the job document
    pub async fn read_doc(&self, jobid: JobId) -> Result<JobDoc> {
        let (data, _) = self
            .store
            .get(&paths::job(jobid))
            .await
            .map_err(|e| not_found_as_no_such_job(e, jobid))?;
        Ok(serde_json::from_slice(&data)?)
    }

    /// Read the job state document
    pub async fn read_state(&self, jobid: JobId) -> Result<(JobStateRecord, Version)> {
        let (data, version) = self
            .store
            .get(&paths::job_state(jobid))
            .await
            .map_err(|e| not_found_as_no_such_job(e, jobid))?;
        Ok((serde_json::from_slice(&data)?, version))
    }

    /// CAS-update the job state document
    ///
    /// Returns the final record and whether a write happened.
    pub async fn update_state<F>(&self, jobid: JobId, mutate: F) -> Result<(JobStateRecord, bool)>
    where
        F: FnMut(&mut JobStateRecord) -> bool,
    {
        update_json(&*self.store, &paths::job_state(jobid), mutate).await
    }

    /// All jobids, newest first
    pub async fn list(&self) -> Result<Vec<JobId>> {
        let names = self
            .store
            .children(paths::JOBS)
            .await
            .map_err(Error::from)?;
        let mut ids: Vec<JobId> = names
            .iter()
            .filter_map(|name| name.parse::<JobId>().ok())
            .collect();
        ids.sort_unstable_by(|a, b| b.cmp(a));
        Ok(ids)
    }
}

fn not_found_as_no_such_job(err: StoreError, jobid: JobId) -> Error {
    match err {
        StoreError::NotFound(_) => Error::invalid_spec(format!("no such job: {}", jobid)),
        other => other.into(),
    }
}

/// Typed view over host records
pub struct HostView<S: ?Sized> {
    store: Arc<S>,
}

impl<S: CoordinationStore + ?Sized> HostView<S> {
    /// Create a view
    pub fn new(store: Arc<S>) -> Self {
        Self { store }
    }

    /// Seed every host of a new job as waiting
    pub async fn seed(&self, jobid: JobId, hosts: &[String]) -> Result<()> {
        for hostname in hosts {
            let record = HostRecord::new(jobid, hostname.clone());
            self.store
                .create(
                    &paths::host(jobid, hostname),
                    &serde_json::to_vec(&record)?,
                    CreateFlags::NONE,
                )
                .await
                .map_err(Error::from)?;
        }
        Ok(())
    }

    /// Read one host record
    pub async fn read(&self, jobid: JobId, hostname: &str) -> Result<(HostRecord, Version)> {
        let (data, version) = self
            .store
            .get(&paths::host(jobid, hostname))
            .await
            .map_err(Error::from)?;
        Ok((serde_json::from_slice(&data)?, version))
    }

    /// CAS-update one host record
    ///
    /// The closure returns `false` to leave the record untouched (e.g. when
    /// the host is already terminal). Returns the final record and whether a
    /// write happened.
    pub async fn update<F>(&self, jobid: JobId, hostname: &str, mutate: F) -> Result<(HostRecord, bool)>
    where
        F: FnMut(&mut HostRecord) -> bool,
    {
        update_json(&*self.store, &paths::host(jobid, hostname), mutate).await
    }

    /// Read records for the given hosts, preserving the given order
    pub async fn read_many(&self, jobid: JobId, order: &[String]) -> Result<Vec<HostRecord>> {
        let mut records = Vec::with_capacity(order.len());
        for hostname in order {
            let (record, _) = self.read(jobid, hostname).await?;
            records.push(record);
        }
        Ok(records)
    }
}

/// Record stored in a lock node
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LockRecord {
    /// Job holding the slot
    pub jobid: JobId,

    /// Host consuming the slot
    pub hostname: String,
}

/// Typed view over namespace config and lock nodes
pub struct NamespaceView<S: ?Sized> {
    store: Arc<S>,
}

impl<S: CoordinationStore + ?Sized> NamespaceView<S> {
    /// Create a view
    pub fn new(store: Arc<S>) -> Self {
        Self { store }
    }

    /// Write (create or replace) a namespace YAML document
    pub async fn write_config(&self, namespace: &str, yaml: &str) -> Result<()> {
        let path = paths::ns_config(namespace);
        match self
            .store
            .create(&path, yaml.as_bytes(), CreateFlags::NONE)
            .await
        {
            Ok(_) => Ok(()),
            Err(StoreError::AlreadyExists(_)) => {
                self.store
                    .set(&path, yaml.as_bytes(), super::ANY_VERSION)
                    .await
                    .map_err(Error::from)?;
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Read and parse a namespace
    pub async fn read(&self, namespace: &str) -> Result<Namespace> {
        let (data, _) = self
            .store
            .get(&paths::ns_config(namespace))
            .await
            .map_err(|e| match e {
                StoreError::NotFound(_) => Error::unknown_namespace(namespace),
                other => other.into(),
            })?;
        let doc = String::from_utf8(data)
            .map_err(|e| Error::internal(format!("namespace {} is not UTF-8: {}", namespace, e)))?;
        Namespace::from_yaml(namespace, &doc)
    }

    /// Register an ephemeral lock for a slot the host consumes
    pub async fn create_lock(
        &self,
        namespace: &str,
        label: &str,
        jobid: JobId,
        hostname: &str,
    ) -> Result<String> {
        let record = LockRecord {
            jobid,
            hostname: hostname.to_string(),
        };
        let path = self
            .store
            .create(
                &paths::ns_lock_prefix(namespace, label),
                &serde_json::to_vec(&record)?,
                CreateFlags::SEQUENTIAL_EPHEMERAL,
            )
            .await
            .map_err(Error::from)?;
        Ok(path)
    }

    /// Release a held lock; already-gone locks are fine
    pub async fn release_lock(&self, path: &str) -> Result<()> {
        match self.store.delete(path, super::ANY_VERSION).await {
            Ok(()) | Err(StoreError::NotFound(_)) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Held lock counts per selector label, across all jobs
    pub async fn lock_counts(&self, namespace: &str) -> Result<HashMap<String, usize>> {
        let mut counts = HashMap::new();
        let labels = match self.store.children(&paths::ns_locks(namespace)).await {
            Ok(labels) => labels,
            Err(StoreError::NotFound(_)) => return Ok(counts),
            Err(e) => return Err(e.into()),
        };
        for label in labels {
            let held = self
                .store
                .children(&paths::ns_lock_dir(namespace, &label))
                .await
                .map_err(Error::from)?
                .len();
            if held > 0 {
                counts.insert(label, held);
            }
        }
        Ok(counts)
    }
}
