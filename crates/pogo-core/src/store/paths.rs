//! Store path layout
//!
//! ```text
//! /pogo/jobs/p0000000001           → job document (spec + host order, sans password)
//! /pogo/jobs/p0000000001/state     → current job state
//! /pogo/jobs/p0000000001/hosts/<h> → host record
//! /pogo/ns/<ns>/config             → namespace yaml
//! /pogo/ns/<ns>/locks/<tag>/<seq>  → ephemeral lock (created by scheduler)
//! /pogo/dispatchers/<id>           → ephemeral liveness record
//! ```

use crate::JobId;

/// Root of everything pogo writes
pub const ROOT: &str = "/pogo";

/// Parent of all job nodes
pub const JOBS: &str = "/pogo/jobs";

/// Sequential-create prefix for jobid allocation
pub const JOB_SEQ: &str = "/pogo/jobs/p";

/// Parent of all namespace nodes
pub const NAMESPACES: &str = "/pogo/ns";

/// Parent of dispatcher liveness records
pub const DISPATCHERS: &str = "/pogo/dispatchers";

/// Job document node
pub fn job(jobid: JobId) -> String {
    format!("{}/{}", JOBS, jobid)
}

/// Job state node
pub fn job_state(jobid: JobId) -> String {
    format!("{}/{}/state", JOBS, jobid)
}

/// Parent of a job's host records
pub fn job_hosts(jobid: JobId) -> String {
    format!("{}/{}/hosts", JOBS, jobid)
}

/// One host record
pub fn host(jobid: JobId, hostname: &str) -> String {
    format!("{}/{}/hosts/{}", JOBS, jobid, hostname)
}

/// Namespace config node
pub fn ns_config(namespace: &str) -> String {
    format!("{}/{}/config", NAMESPACES, namespace)
}

/// Parent of a namespace's lock records
pub fn ns_locks(namespace: &str) -> String {
    format!("{}/{}/locks", NAMESPACES, namespace)
}

/// Lock directory for one selector label
pub fn ns_lock_dir(namespace: &str, label: &str) -> String {
    format!("{}/{}/locks/{}", NAMESPACES, namespace, label)
}

/// Sequential-create prefix for lock records under a label
pub fn ns_lock_prefix(namespace: &str, label: &str) -> String {
    format!("{}/{}/locks/{}/", NAMESPACES, namespace, label)
}

/// Dispatcher liveness node
pub fn dispatcher(id: &str) -> String {
    format!("{}/{}", DISPATCHERS, id)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_layout() {
        let id = JobId::from_seq(1);
        assert_eq!(job(id), "/pogo/jobs/p0000000001");
        assert_eq!(job_state(id), "/pogo/jobs/p0000000001/state");
        assert_eq!(host(id, "web1"), "/pogo/jobs/p0000000001/hosts/web1");
        assert_eq!(ns_config("example"), "/pogo/ns/example/config");
        assert_eq!(ns_lock_dir("example", "db"), "/pogo/ns/example/locks/db");
    }
}
