//! Constraint scheduler
//!
//! The decision function for one tick: given a job's host states, the
//! namespace constraints, and the lock counts currently held across all jobs
//! in the namespace, compute which hosts become ready, which may be admitted
//! to run, and which are skipped or deadlocked. The planner is pure; the job
//! controller applies the plan against the coordination store, where lock
//! creation reconfirms every admission.

use std::collections::HashMap;

use crate::job::HostState;
use crate::namespace::{Namespace, PredecessorFailurePolicy, TagSelector};

/// Inputs for one scheduler tick
pub struct TickContext<'a> {
    /// Namespace snapshot
    pub ns: &'a Namespace,

    /// Job hosts in expansion order
    pub order: &'a [String],

    /// Current state per host
    pub states: &'a HashMap<String, HostState>,

    /// Resolved job-wide concurrency cap
    pub job_cap: usize,

    /// Held locks per selector label, across all jobs in the namespace
    pub lock_counts: &'a HashMap<String, usize>,
}

/// What one tick decided
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct TickPlan {
    /// Waiting hosts whose predecessors are all satisfied
    pub promote: Vec<String>,

    /// Ready hosts admitted to run, in expansion order
    pub admit: Vec<String>,

    /// Hosts skipped because a predecessor failed and policy says skip
    pub skip: Vec<String>,

    /// Hosts that can never run
    pub deadlock: Vec<String>,
}

impl TickPlan {
    /// Check whether the tick changes nothing
    pub fn is_noop(&self) -> bool {
        self.promote.is_empty()
            && self.admit.is_empty()
            && self.skip.is_empty()
            && self.deadlock.is_empty()
    }
}

/// Compute the plan for one tick
pub fn plan_tick(ctx: &TickContext) -> TickPlan {
    let mut plan = TickPlan::default();

    // Effective states for this tick, updated as hosts are promoted
    let mut effective: HashMap<&str, HostState> = ctx
        .order
        .iter()
        .map(|h| (h.as_str(), ctx.states.get(h).copied().unwrap_or_default()))
        .collect();

    // Readiness pass: evaluate sequence predecessors for waiting hosts
    for host in ctx.order {
        if effective.get(host.as_str()) != Some(&HostState::Waiting) {
            continue;
        }
        match predecessor_status(ctx, host) {
            PredecessorStatus::Satisfied => {
                plan.promote.push(host.clone());
                effective.insert(host.as_str(), HostState::Ready);
            }
            PredecessorStatus::Pending => {}
            PredecessorStatus::Failed => match ctx.ns.on_predecessor_failure {
                PredecessorFailurePolicy::Skip => {
                    plan.skip.push(host.clone());
                    effective.insert(host.as_str(), HostState::Skipped);
                }
                PredecessorFailurePolicy::Deadlock => {
                    plan.deadlock.push(host.clone());
                    effective.insert(host.as_str(), HostState::Deadlocked);
                }
                // Proceed is handled inside predecessor_status
                PredecessorFailurePolicy::Proceed => unreachable!(),
            },
        }
    }

    // Admission pass: fill the job budget in expansion order
    let running = effective
        .values()
        .filter(|s| **s == HostState::Running)
        .count();
    let mut budget = ctx.job_cap.saturating_sub(running);
    let mut tick_counts: HashMap<&str, usize> = HashMap::new();

    for host in ctx.order {
        if budget == 0 {
            break;
        }
        if effective.get(host.as_str()) != Some(&HostState::Ready) {
            continue;
        }
        if !caps_allow(ctx, host, &tick_counts) {
            continue;
        }
        for rule in ctx.ns.rules_for(host) {
            if rule.max_parallel.is_some() {
                *tick_counts.entry(rule.applies_to.label()).or_insert(0) += 1;
            }
        }
        plan.admit.push(host.clone());
        budget -= 1;
    }

    plan
}

enum PredecessorStatus {
    /// Every predecessor is satisfied; the host may become ready
    Satisfied,

    /// Some predecessor is still in flight
    Pending,

    /// A predecessor is in terminal failure and the policy is not proceed
    Failed,
}

/// Evaluate the sequence predecessors of one waiting host
///
/// Predecessors are the job's own hosts matching a `sequence_before`
/// selector of any rule that applies to the host.
fn predecessor_status(ctx: &TickContext, host: &str) -> PredecessorStatus {
    let proceed = ctx.ns.on_predecessor_failure == PredecessorFailurePolicy::Proceed;
    let mut pending = false;

    for rule in ctx.ns.rules_for(host) {
        for selector in &rule.sequence_before {
            for pred in predecessors(ctx, host, selector) {
                let state = ctx.states.get(pred).copied().unwrap_or_default();
                match state {
                    HostState::Finished => {}
                    s if s.is_terminal_failure() => {
                        if !proceed {
                            return PredecessorStatus::Failed;
                        }
                    }
                    _ => pending = true,
                }
            }
        }
    }

    if pending {
        PredecessorStatus::Pending
    } else {
        PredecessorStatus::Satisfied
    }
}

/// The job's hosts matching a predecessor selector, excluding the host itself
fn predecessors<'a>(
    ctx: &'a TickContext,
    host: &'a str,
    selector: &'a TagSelector,
) -> impl Iterator<Item = &'a str> {
    ctx.order
        .iter()
        .map(|h| h.as_str())
        .filter(move |h| *h != host && ctx.ns.selector_matches(selector, h))
}

/// Check every max_parallel cap that applies to the host
fn caps_allow(ctx: &TickContext, host: &str, tick_counts: &HashMap<&str, usize>) -> bool {
    for rule in ctx.ns.rules_for(host) {
        let cap = match &rule.max_parallel {
            Some(cap) => cap,
            None => continue,
        };
        let label = rule.applies_to.label();
        let limit = cap.resolve(ctx.ns.selector_population(&rule.applies_to));
        let held = ctx.lock_counts.get(label).copied().unwrap_or(0)
            + tick_counts.get(label).copied().unwrap_or(0);
        if held >= limit {
            return false;
        }
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::namespace::Namespace;

    fn ns(doc: &str) -> Namespace {
        Namespace::from_yaml("test", doc).unwrap()
    }

    fn states(pairs: &[(&str, HostState)]) -> HashMap<String, HostState> {
        pairs.iter().map(|(h, s)| (h.to_string(), *s)).collect()
    }

    fn order(hosts: &[&str]) -> Vec<String> {
        hosts.iter().map(|h| h.to_string()).collect()
    }

    const DB_CAP: &str = r#"
hosts:
  db1: [db]
  db2: [db]
  db3: [db]
  db4: [db]
constraints:
  - applies_to: "%db"
    max_parallel: 1
"#;

    #[test]
    fn test_job_cap_limits_admission() {
        let ns = ns("hosts: {a: [x], b: [x], c: [x]}\n");
        let order = order(&["a", "b", "c"]);
        let states = states(&[
            ("a", HostState::Waiting),
            ("b", HostState::Waiting),
            ("c", HostState::Waiting),
        ]);
        let locks = HashMap::new();
        let plan = plan_tick(&TickContext {
            ns: &ns,
            order: &order,
            states: &states,
            job_cap: 2,
            lock_counts: &locks,
        });
        assert_eq!(plan.promote, vec!["a", "b", "c"]);
        // Fairness: admitted in expansion order
        assert_eq!(plan.admit, vec!["a", "b"]);
    }

    #[test]
    fn test_running_hosts_consume_budget() {
        let ns = ns("hosts: {a: [x], b: [x]}\n");
        let order = order(&["a", "b"]);
        let states = states(&[("a", HostState::Running), ("b", HostState::Ready)]);
        let locks = HashMap::new();
        let plan = plan_tick(&TickContext {
            ns: &ns,
            order: &order,
            states: &states,
            job_cap: 1,
            lock_counts: &locks,
        });
        assert!(plan.admit.is_empty());
    }

    #[test]
    fn test_tag_cap_across_jobs() {
        let ns = ns(DB_CAP);
        let order = order(&["db1", "db2"]);
        let states = states(&[("db1", HostState::Ready), ("db2", HostState::Ready)]);

        // Another job already holds the db slot
        let locks = HashMap::from([("db".to_string(), 1)]);
        let plan = plan_tick(&TickContext {
            ns: &ns,
            order: &order,
            states: &states,
            job_cap: 4,
            lock_counts: &locks,
        });
        assert!(plan.admit.is_empty());

        // Slot free: exactly one db host admitted even with budget for more
        let locks = HashMap::new();
        let plan = plan_tick(&TickContext {
            ns: &ns,
            order: &order,
            states: &states,
            job_cap: 4,
            lock_counts: &locks,
        });
        assert_eq!(plan.admit, vec!["db1"]);
    }

    #[test]
    fn test_sequence_gates_readiness() {
        let ns = ns(r#"
hosts:
  db1: [db]
  web1: [web]
constraints:
  - applies_to: "%web"
    sequence_before: ["%db"]
"#);
        let order = order(&["db1", "web1"]);

        let waiting = states(&[("db1", HostState::Running), ("web1", HostState::Waiting)]);
        let locks = HashMap::new();
        let plan = plan_tick(&TickContext {
            ns: &ns,
            order: &order,
            states: &waiting,
            job_cap: 10,
            lock_counts: &locks,
        });
        assert!(!plan.promote.contains(&"web1".to_string()));

        let done = states(&[("db1", HostState::Finished), ("web1", HostState::Waiting)]);
        let plan = plan_tick(&TickContext {
            ns: &ns,
            order: &order,
            states: &done,
            job_cap: 10,
            lock_counts: &locks,
        });
        assert_eq!(plan.promote, vec!["web1"]);
        assert_eq!(plan.admit, vec!["web1"]);
    }

    #[test]
    fn test_predecessor_failure_deadlocks_by_default() {
        let ns = ns(r#"
hosts:
  db1: [db]
  web1: [web]
constraints:
  - applies_to: "%web"
    sequence_before: ["%db"]
"#);
        let order = order(&["db1", "web1"]);
        let states = states(&[("db1", HostState::Failed), ("web1", HostState::Waiting)]);
        let locks = HashMap::new();
        let plan = plan_tick(&TickContext {
            ns: &ns,
            order: &order,
            states: &states,
            job_cap: 10,
            lock_counts: &locks,
        });
        assert_eq!(plan.deadlock, vec!["web1"]);
        assert!(plan.admit.is_empty());
    }

    #[test]
    fn test_predecessor_failure_skip_policy() {
        let ns = ns(r#"
hosts:
  db1: [db]
  web1: [web]
constraints:
  - applies_to: "%web"
    sequence_before: ["%db"]
on_predecessor_failure: skip
"#);
        let order = order(&["db1", "web1"]);
        let states = states(&[("db1", HostState::Failed), ("web1", HostState::Waiting)]);
        let locks = HashMap::new();
        let plan = plan_tick(&TickContext {
            ns: &ns,
            order: &order,
            states: &states,
            job_cap: 10,
            lock_counts: &locks,
        });
        assert_eq!(plan.skip, vec!["web1"]);
    }

    #[test]
    fn test_predecessor_failure_proceed_policy() {
        let ns = ns(r#"
hosts:
  db1: [db]
  web1: [web]
constraints:
  - applies_to: "%web"
    sequence_before: ["%db"]
on_predecessor_failure: proceed
"#);
        let order = order(&["db1", "web1"]);
        let states = states(&[("db1", HostState::Failed), ("web1", HostState::Waiting)]);
        let locks = HashMap::new();
        let plan = plan_tick(&TickContext {
            ns: &ns,
            order: &order,
            states: &states,
            job_cap: 10,
            lock_counts: &locks,
        });
        assert_eq!(plan.promote, vec!["web1"]);
        assert_eq!(plan.admit, vec!["web1"]);
    }

    #[test]
    fn test_noop_tick_when_nothing_admissible() {
        let ns = ns(DB_CAP);
        let order = order(&["db1"]);
        let states = states(&[("db1", HostState::Ready)]);
        let locks = HashMap::from([("db".to_string(), 1)]);
        let plan = plan_tick(&TickContext {
            ns: &ns,
            order: &order,
            states: &states,
            job_cap: 1,
            lock_counts: &locks,
        });
        assert!(plan.is_noop());
    }

    #[test]
    fn test_cap_never_exceeded_under_fuzzed_schedules() {
        use rand::rngs::StdRng;
        use rand::{Rng, SeedableRng};

        let ns = ns(DB_CAP);
        let order = order(&["db1", "db2", "db3", "db4"]);
        let mut rng = StdRng::seed_from_u64(7);

        for _ in 0..200 {
            let mut states = HashMap::new();
            let mut locks: HashMap<String, usize> = HashMap::new();
            let mut running = 0usize;
            for host in &order {
                let state = match rng.gen_range(0..4) {
                    0 => HostState::Waiting,
                    1 => HostState::Ready,
                    // The cap admits one db host at a time, so a reachable
                    // schedule never has two running
                    2 if running == 0 => {
                        running += 1;
                        HostState::Running
                    }
                    2 => HostState::Ready,
                    _ => HostState::Finished,
                };
                states.insert(host.clone(), state);
            }
            // Locks mirror running hosts, as the store would
            if running > 0 {
                locks.insert("db".to_string(), running);
            }

            let plan = plan_tick(&TickContext {
                ns: &ns,
                order: &order,
                states: &states,
                job_cap: 4,
                lock_counts: &locks,
            });
            // db cap is 1 across all jobs: nothing admitted while a db host runs
            assert!(running + plan.admit.len() <= 1, "cap exceeded: {:?}", plan);
        }
    }
}
