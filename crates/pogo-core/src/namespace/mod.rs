//! Namespace model
//!
//! A namespace is the host-to-tags catalog plus the constraint rules shared by
//! every job that targets it. The in-memory model is a cache rehydrated from
//! the coordination store on demand; the YAML document in the store is the
//! source of truth.

pub mod constraint;

pub use constraint::{Cap, ConstraintRule, TagSelector};

use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// What happens to a host whose sequence predecessor failed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PredecessorFailurePolicy {
    /// Mark the dependent host skipped
    Skip,

    /// Mark the dependent host deadlocked
    #[default]
    Deadlock,

    /// Run the dependent host anyway once predecessors are terminal
    Proceed,
}

/// In-memory view of one namespace
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Namespace {
    /// Namespace name
    #[serde(skip)]
    pub name: String,

    /// Host to tag-set mapping
    #[serde(default)]
    pub hosts: BTreeMap<String, BTreeSet<String>>,

    /// Constraint rules, in document order
    #[serde(default)]
    pub constraints: Vec<ConstraintRule>,

    /// Policy for hosts whose predecessors failed
    #[serde(default)]
    pub on_predecessor_failure: PredecessorFailurePolicy,
}

impl Namespace {
    /// Create an empty namespace
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            hosts: BTreeMap::new(),
            constraints: Vec::new(),
            on_predecessor_failure: PredecessorFailurePolicy::default(),
        }
    }

    /// Parse a namespace document from YAML
    pub fn from_yaml(name: impl Into<String>, doc: &str) -> Result<Self> {
        let mut ns: Namespace = serde_yaml::from_str(doc)?;
        ns.name = name.into();
        ns.validate()?;
        Ok(ns)
    }

    /// Serialize back to YAML for persistence
    pub fn to_yaml(&self) -> Result<String> {
        serde_yaml::to_string(self).map_err(Error::from)
    }

    /// Validate hosts and constraint rules
    pub fn validate(&self) -> Result<()> {
        for (host, _) in &self.hosts {
            if host.is_empty() {
                return Err(Error::invalid_spec("namespace contains an empty hostname"));
            }
        }
        for rule in &self.constraints {
            rule.validate().map_err(Error::invalid_spec)?;
        }
        Ok(())
    }

    /// All tags defined across hosts
    pub fn tags(&self) -> BTreeSet<String> {
        self.hosts.values().flatten().cloned().collect()
    }

    /// Check whether any host carries the tag
    pub fn has_tag(&self, tag: &str) -> bool {
        self.hosts.values().any(|tags| tags.contains(tag))
    }

    /// Hosts carrying a tag, in sorted order
    pub fn hosts_with_tag(&self, tag: &str) -> Vec<String> {
        self.hosts
            .iter()
            .filter(|(_, tags)| tags.contains(tag))
            .map(|(host, _)| host.clone())
            .collect()
    }

    /// Tags for one host
    pub fn host_tags(&self, hostname: &str) -> Option<&BTreeSet<String>> {
        self.hosts.get(hostname)
    }

    /// Check whether a selector matches a host of this namespace
    pub fn selector_matches(&self, selector: &TagSelector, hostname: &str) -> bool {
        let tags = self.hosts.get(hostname).unwrap_or(&EMPTY_TAGS);
        selector.matches(hostname, tags)
    }

    /// Constraint rules whose `applies_to` matches the host
    pub fn rules_for(&self, hostname: &str) -> Vec<&ConstraintRule> {
        self.constraints
            .iter()
            .filter(|rule| self.selector_matches(&rule.applies_to, hostname))
            .collect()
    }

    /// Number of hosts a selector can ever match, for percentage caps
    pub fn selector_population(&self, selector: &TagSelector) -> usize {
        match selector {
            TagSelector::Tag(tag) => self.hosts_with_tag(tag).len(),
            TagSelector::Host(_) => 1,
        }
    }
}

lazy_static::lazy_static! {
    static ref EMPTY_TAGS: BTreeSet<String> = BTreeSet::new();
}

#[cfg(test)]
mod tests {
    use super::*;

    const EXAMPLE: &str = r#"
hosts:
  db1.example.com: [db, prod]
  db2.example.com: [db, prod]
  web1.example.com: [web, prod]
  web2.example.com: [web]
constraints:
  - applies_to: "%db"
    max_parallel: 1
  - applies_to: "%web"
    sequence_before: ["%db"]
"#;

    #[test]
    fn test_from_yaml() {
        let ns = Namespace::from_yaml("example", EXAMPLE).unwrap();
        assert_eq!(ns.name, "example");
        assert_eq!(ns.hosts.len(), 4);
        assert_eq!(ns.constraints.len(), 2);
        assert_eq!(
            ns.on_predecessor_failure,
            PredecessorFailurePolicy::Deadlock
        );
    }

    #[test]
    fn test_hosts_with_tag_sorted() {
        let ns = Namespace::from_yaml("example", EXAMPLE).unwrap();
        assert_eq!(
            ns.hosts_with_tag("db"),
            vec!["db1.example.com".to_string(), "db2.example.com".to_string()]
        );
        assert!(ns.hosts_with_tag("missing").is_empty());
    }

    #[test]
    fn test_rules_for_host() {
        let ns = Namespace::from_yaml("example", EXAMPLE).unwrap();
        let rules = ns.rules_for("web1.example.com");
        assert_eq!(rules.len(), 1);
        assert_eq!(rules[0].sequence_before.len(), 1);

        assert!(ns.rules_for("unknown.example.com").is_empty());
    }

    #[test]
    fn test_policy_parse() {
        let doc = "hosts: {a: [x]}\non_predecessor_failure: skip\n";
        let ns = Namespace::from_yaml("n", doc).unwrap();
        assert_eq!(ns.on_predecessor_failure, PredecessorFailurePolicy::Skip);
    }

    #[test]
    fn test_bad_constraint_rejected() {
        let doc = r#"
hosts:
  a: [x]
constraints:
  - applies_to: "%x"
    max_parallel: 0
"#;
        assert!(Namespace::from_yaml("n", doc).is_err());
    }
}
