//! One-shot secret delivery
//!
//! Job passwords live only in dispatcher RAM. A dispatch carries an opaque
//! reference; the worker redeems it over the same TLS session with
//! `fetch_secret`, and the vault honors each reference exactly once. Bytes
//! are overwritten with zeros before they are released, and a job's
//! remaining references are purged once every dispatch has consumed them or
//! the job terminates.

use crate::JobId;
use std::collections::HashMap;
use std::sync::Mutex;
use uuid::Uuid;

/// A secret that zeroes its bytes on drop
pub struct Secret(Vec<u8>);

impl Secret {
    /// Expose the bytes as UTF-8 for the wire message
    pub fn as_str(&self) -> Option<&str> {
        std::str::from_utf8(&self.0).ok()
    }
}

impl Drop for Secret {
    fn drop(&mut self) {
        for byte in self.0.iter_mut() {
            *byte = 0;
        }
    }
}

struct Entry {
    jobid: JobId,
    bytes: Vec<u8>,
}

/// In-RAM store of per-dispatch secret references
#[derive(Default)]
pub struct SecretVault {
    entries: Mutex<HashMap<String, Entry>>,
}

impl SecretVault {
    /// Create an empty vault
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a secret for one dispatch; returns the opaque reference
    pub fn register(&self, jobid: JobId, secret: &str) -> String {
        let reference = format!("ref-{}", Uuid::new_v4());
        self.entries.lock().unwrap().insert(
            reference.clone(),
            Entry {
                jobid,
                bytes: secret.as_bytes().to_vec(),
            },
        );
        reference
    }

    /// Redeem a reference; the first caller gets the secret, later ones get nothing
    pub fn take(&self, reference: &str) -> Option<Secret> {
        self.entries
            .lock()
            .unwrap()
            .remove(reference)
            .map(|entry| Secret(entry.bytes))
    }

    /// Drop (and zero) every outstanding reference for a job
    pub fn purge_job(&self, jobid: JobId) -> usize {
        let mut entries = self.entries.lock().unwrap();
        let doomed: Vec<String> = entries
            .iter()
            .filter(|(_, entry)| entry.jobid == jobid)
            .map(|(reference, _)| reference.clone())
            .collect();
        for reference in &doomed {
            if let Some(entry) = entries.remove(reference) {
                drop(Secret(entry.bytes));
            }
        }
        doomed.len()
    }

    /// Outstanding references, for stats and tests
    pub fn len(&self) -> usize {
        self.entries.lock().unwrap().len()
    }

    /// Check whether the vault is empty
    pub fn is_empty(&self) -> bool {
        self.entries.lock().unwrap().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_take_is_one_shot() {
        let vault = SecretVault::new();
        let reference = vault.register(JobId::from_seq(1), "hunter2");

        let secret = vault.take(&reference).unwrap();
        assert_eq!(secret.as_str(), Some("hunter2"));

        assert!(vault.take(&reference).is_none());
    }

    #[test]
    fn test_purge_job_clears_only_that_job() {
        let vault = SecretVault::new();
        vault.register(JobId::from_seq(1), "a");
        vault.register(JobId::from_seq(1), "b");
        let keep = vault.register(JobId::from_seq(2), "c");

        assert_eq!(vault.purge_job(JobId::from_seq(1)), 2);
        assert_eq!(vault.len(), 1);
        assert!(vault.take(&keep).is_some());
    }

    #[test]
    fn test_references_are_unique() {
        let vault = SecretVault::new();
        let a = vault.register(JobId::from_seq(1), "x");
        let b = vault.register(JobId::from_seq(1), "x");
        assert_ne!(a, b);
    }
}
