//! Job identifiers
//!
//! A jobid is the letter `p` followed by a 10-digit zero-padded sequence
//! number. The number comes from a sequential create against the
//! coordination store, so jobids are unique and strictly increasing.

use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Opaque job identifier, ordered by its underlying sequence number
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct JobId(u64);

impl JobId {
    /// Create from a raw sequence number
    pub fn from_seq(seq: u64) -> Self {
        JobId(seq)
    }

    /// Get the underlying sequence number
    pub fn seq(&self) -> u64 {
        self.0
    }

    /// Parse a jobid from a store path ending in `p<seq>`
    pub fn from_path(path: &str) -> Result<Self> {
        let name = path.rsplit('/').next().unwrap_or(path);
        name.parse()
    }

    /// Resolve a user-supplied jobid string, including aliases
    pub fn resolve(input: &str) -> Result<Self> {
        if input == "last" {
            // TODO: resolving "last" needs the caller's most recent job, and
            // the RPC surface does not carry user identity.
            return Err(Error::not_implemented("jobid alias \"last\""));
        }
        input.parse()
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "p{:010}", self.0)
    }
}

impl FromStr for JobId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let digits = s
            .strip_prefix('p')
            .ok_or_else(|| Error::invalid_spec(format!("malformed jobid: {}", s)))?;
        if digits.is_empty() || !digits.chars().all(|c| c.is_ascii_digit()) {
            return Err(Error::invalid_spec(format!("malformed jobid: {}", s)));
        }
        let seq = digits
            .parse::<u64>()
            .map_err(|e| Error::invalid_spec(format!("malformed jobid {}: {}", s, e)))?;
        Ok(JobId(seq))
    }
}

impl TryFrom<String> for JobId {
    type Error = Error;

    fn try_from(s: String) -> Result<Self> {
        s.parse()
    }
}

impl From<JobId> for String {
    fn from(id: JobId) -> String {
        id.to_string()
    }
}
