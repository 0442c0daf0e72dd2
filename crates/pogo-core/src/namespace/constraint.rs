//! Constraint rules and tag selectors

use serde::de::{self, Visitor};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::collections::BTreeSet;
use std::fmt;

/// Selector used by constraints and targets to pick hosts
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum TagSelector {
    /// All hosts carrying a tag (`%db`)
    Tag(String),

    /// A single host by name
    Host(String),
}

impl TagSelector {
    /// Parse from the `%tag` / hostname notation
    pub fn parse(s: &str) -> Self {
        match s.strip_prefix('%') {
            Some(tag) => TagSelector::Tag(tag.to_string()),
            None => TagSelector::Host(s.to_string()),
        }
    }

    /// Check whether a host with the given tags matches
    pub fn matches(&self, hostname: &str, tags: &BTreeSet<String>) -> bool {
        match self {
            TagSelector::Tag(tag) => tags.contains(tag),
            TagSelector::Host(host) => hostname == host,
        }
    }

    /// Key used for lock paths and cap accounting
    pub fn label(&self) -> &str {
        match self {
            TagSelector::Tag(tag) => tag,
            TagSelector::Host(host) => host,
        }
    }
}

impl fmt::Display for TagSelector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TagSelector::Tag(tag) => write!(f, "%{}", tag),
            TagSelector::Host(host) => write!(f, "{}", host),
        }
    }
}

impl TryFrom<String> for TagSelector {
    type Error = String;

    fn try_from(s: String) -> Result<Self, String> {
        if s.is_empty() || s == "%" {
            return Err("empty selector".to_string());
        }
        Ok(TagSelector::parse(&s))
    }
}

impl From<TagSelector> for String {
    fn from(sel: TagSelector) -> String {
        sel.to_string()
    }
}

/// Concurrency cap: an absolute count or a percentage of the eligible set
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Cap {
    /// Absolute number of simultaneous hosts
    Count(u32),

    /// Percentage of the eligible host count, rounded down, minimum 1
    Percent(u8),
}

impl Cap {
    /// Resolve against the size of the eligible set
    pub fn resolve(&self, total: usize) -> usize {
        match self {
            Cap::Count(n) => *n as usize,
            Cap::Percent(p) => ((total * *p as usize) / 100).max(1),
        }
    }

    /// Validate the cap is usable
    pub fn validate(&self) -> Result<(), String> {
        match self {
            Cap::Count(0) => Err("cap must be >= 1".to_string()),
            Cap::Percent(0) => Err("percentage cap must be >= 1%".to_string()),
            Cap::Percent(p) if *p > 100 => Err(format!("percentage cap {}% > 100%", p)),
            _ => Ok(()),
        }
    }
}

impl Default for Cap {
    fn default() -> Self {
        Cap::Count(1)
    }
}

impl fmt::Display for Cap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Cap::Count(n) => write!(f, "{}", n),
            Cap::Percent(p) => write!(f, "{}%", p),
        }
    }
}

impl Serialize for Cap {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Cap::Count(n) => serializer.serialize_u32(*n),
            Cap::Percent(p) => serializer.serialize_str(&format!("{}%", p)),
        }
    }
}

impl<'de> Deserialize<'de> for Cap {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct CapVisitor;

        impl<'de> Visitor<'de> for CapVisitor {
            type Value = Cap;

            fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
                f.write_str("an integer count or a percentage string like \"25%\"")
            }

            fn visit_u64<E: de::Error>(self, v: u64) -> Result<Cap, E> {
                if v == 0 || v > u32::MAX as u64 {
                    return Err(E::custom(format!("cap out of range: {}", v)));
                }
                Ok(Cap::Count(v as u32))
            }

            fn visit_i64<E: de::Error>(self, v: i64) -> Result<Cap, E> {
                if v <= 0 {
                    return Err(E::custom(format!("cap must be >= 1, got {}", v)));
                }
                self.visit_u64(v as u64)
            }

            fn visit_str<E: de::Error>(self, v: &str) -> Result<Cap, E> {
                if let Some(pct) = v.strip_suffix('%') {
                    let p: u8 = pct
                        .trim()
                        .parse()
                        .map_err(|_| E::custom(format!("bad percentage: {}", v)))?;
                    Ok(Cap::Percent(p))
                } else {
                    let n: u32 = v
                        .trim()
                        .parse()
                        .map_err(|_| E::custom(format!("bad cap: {}", v)))?;
                    Ok(Cap::Count(n))
                }
            }
        }

        deserializer.deserialize_any(CapVisitor)
    }
}

/// One namespace constraint rule
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConstraintRule {
    /// Hosts this rule applies to
    pub applies_to: TagSelector,

    /// Cap on simultaneous running hosts matching `applies_to`, across all jobs
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_parallel: Option<Cap>,

    /// Selectors whose hosts must finish before ours may start
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub sequence_before: Vec<TagSelector>,
}

impl ConstraintRule {
    /// Validate the rule is internally consistent
    pub fn validate(&self) -> Result<(), String> {
        if let Some(cap) = &self.max_parallel {
            cap.validate()
                .map_err(|e| format!("constraint on {}: {}", self.applies_to, e))?;
        }
        if self.sequence_before.contains(&self.applies_to) {
            return Err(format!("constraint on {} sequences after itself", self.applies_to));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tags(list: &[&str]) -> BTreeSet<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_selector_parse() {
        assert_eq!(TagSelector::parse("%db"), TagSelector::Tag("db".into()));
        assert_eq!(
            TagSelector::parse("web1.example.com"),
            TagSelector::Host("web1.example.com".into())
        );
    }

    #[test]
    fn test_selector_matches() {
        let sel = TagSelector::Tag("db".into());
        assert!(sel.matches("db1", &tags(&["db", "prod"])));
        assert!(!sel.matches("web1", &tags(&["web"])));

        let host_sel = TagSelector::Host("web1".into());
        assert!(host_sel.matches("web1", &tags(&[])));
        assert!(!host_sel.matches("web2", &tags(&[])));
    }

    #[test]
    fn test_cap_resolve() {
        assert_eq!(Cap::Count(3).resolve(100), 3);
        assert_eq!(Cap::Percent(25).resolve(8), 2);
        // Percentage never resolves below one slot
        assert_eq!(Cap::Percent(10).resolve(3), 1);
    }

    #[test]
    fn test_cap_serde() {
        let count: Cap = serde_json::from_str("4").unwrap();
        assert_eq!(count, Cap::Count(4));

        let pct: Cap = serde_json::from_str("\"25%\"").unwrap();
        assert_eq!(pct, Cap::Percent(25));

        assert!(serde_json::from_str::<Cap>("0").is_err());
    }

    #[test]
    fn test_rule_validation() {
        let rule = ConstraintRule {
            applies_to: TagSelector::Tag("db".into()),
            max_parallel: Some(Cap::Count(1)),
            sequence_before: vec![TagSelector::Tag("db".into())],
        };
        assert!(rule.validate().is_err());
    }
}
