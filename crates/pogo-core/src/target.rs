//! Target expression expansion
//!
//! Expands a target expression against a namespace snapshot into a concrete
//! ordered host list. The grammar is fixed: bracket ranges
//! (`foo[1-10].example.com`), comma alternation inside brackets
//! (`foo[1,3,5]`), tag references (`%tag`), and set difference
//! (`expr - expr`). Expansion is pure: the same expression and namespace
//! snapshot always produce the same ordered, de-duplicated list.

use crate::namespace::Namespace;
use lazy_static::lazy_static;
use regex::Regex;
use std::collections::HashSet;

lazy_static! {
    static ref RANGE_RE: Regex = Regex::new(r"^(\d+)-(\d+)$").unwrap();
}

/// Target expansion result type alias
pub type TargetResult<T> = Result<T, TargetError>;

/// Target-expansion failures
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TargetError {
    #[error("unknown tag: %{0}")]
    UnknownTag(String),

    #[error("unparseable range: {0}")]
    UnparseableRange(String),

    #[error("target expression expands to no hosts: {0}")]
    EmptyExpansion(String),
}

impl From<TargetError> for crate::Error {
    fn from(err: TargetError) -> Self {
        match err {
            TargetError::UnknownTag(tag) => crate::Error::UnknownTag(tag),
            other => crate::Error::InvalidSpec(other.to_string()),
        }
    }
}

/// Expand a target expression against a namespace snapshot
///
/// Returns hostnames in deterministic order with duplicates removed,
/// preserving first occurrence.
pub fn expand(expr: &str, ns: &Namespace) -> TargetResult<Vec<String>> {
    let mut included: Vec<String> = Vec::new();
    let mut excluded: HashSet<String> = HashSet::new();
    let mut seen: HashSet<String> = HashSet::new();

    let mut subtracting = false;
    for token in expr.split_whitespace() {
        if token == "-" {
            if subtracting {
                return Err(TargetError::UnparseableRange(expr.to_string()));
            }
            subtracting = true;
            continue;
        }

        for atom in split_atoms(token)? {
            let hosts = expand_atom(&atom, ns)?;
            if subtracting {
                excluded.extend(hosts);
            } else {
                for host in hosts {
                    if seen.insert(host.clone()) {
                        included.push(host);
                    }
                }
            }
        }
        if subtracting {
            subtracting = false;
        }
    }

    // A trailing difference operator has no right-hand side
    if subtracting {
        return Err(TargetError::UnparseableRange(expr.to_string()));
    }

    let result: Vec<String> = included
        .into_iter()
        .filter(|h| !excluded.contains(h))
        .collect();

    if result.is_empty() {
        return Err(TargetError::EmptyExpansion(expr.to_string()));
    }

    Ok(result)
}

/// Split a token on commas at bracket depth zero
fn split_atoms(token: &str) -> TargetResult<Vec<String>> {
    let mut atoms = Vec::new();
    let mut current = String::new();
    let mut depth: i32 = 0;

    for c in token.chars() {
        match c {
            '[' => {
                depth += 1;
                current.push(c);
            }
            ']' => {
                depth -= 1;
                if depth < 0 {
                    return Err(TargetError::UnparseableRange(token.to_string()));
                }
                current.push(c);
            }
            ',' if depth == 0 => {
                if !current.is_empty() {
                    atoms.push(std::mem::take(&mut current));
                }
            }
            _ => current.push(c),
        }
    }

    if depth != 0 {
        return Err(TargetError::UnparseableRange(token.to_string()));
    }
    if !current.is_empty() {
        atoms.push(current);
    }

    Ok(atoms)
}

/// Expand one atom: a tag reference or a hostname pattern
fn expand_atom(atom: &str, ns: &Namespace) -> TargetResult<Vec<String>> {
    if let Some(tag) = atom.strip_prefix('%') {
        if !ns.has_tag(tag) {
            return Err(TargetError::UnknownTag(tag.to_string()));
        }
        return Ok(ns.hosts_with_tag(tag));
    }
    expand_brackets(atom)
}

/// Expand bracket groups left-to-right as a cross product
fn expand_brackets(pattern: &str) -> TargetResult<Vec<String>> {
    let open = match pattern.find('[') {
        Some(idx) => idx,
        None => return Ok(vec![pattern.to_string()]),
    };
    let close = pattern[open..]
        .find(']')
        .map(|idx| open + idx)
        .ok_or_else(|| TargetError::UnparseableRange(pattern.to_string()))?;

    let prefix = &pattern[..open];
    let group = &pattern[open + 1..close];
    let rest = &pattern[close + 1..];

    if group.is_empty() {
        return Err(TargetError::UnparseableRange(pattern.to_string()));
    }

    let mut expanded = Vec::new();
    for item in group.split(',') {
        expanded.extend(expand_group_item(item, pattern)?);
    }

    let tails = expand_brackets(rest)?;
    let mut hosts = Vec::with_capacity(expanded.len() * tails.len());
    for item in &expanded {
        for tail in &tails {
            hosts.push(format!("{}{}{}", prefix, item, tail));
        }
    }

    Ok(hosts)
}

/// Expand one bracket item: either a literal or an inclusive integer range
fn expand_group_item(item: &str, pattern: &str) -> TargetResult<Vec<String>> {
    if let Some(caps) = RANGE_RE.captures(item) {
        let lo_str = &caps[1];
        let hi_str = &caps[2];
        let lo: u64 = lo_str
            .parse()
            .map_err(|_| TargetError::UnparseableRange(pattern.to_string()))?;
        let hi: u64 = hi_str
            .parse()
            .map_err(|_| TargetError::UnparseableRange(pattern.to_string()))?;
        if hi < lo {
            return Err(TargetError::UnparseableRange(pattern.to_string()));
        }
        // The lower bound sets the zero-pad width: [01-10] pads, [1-10] does not
        let width = lo_str.len();
        return Ok((lo..=hi).map(|n| format!("{:0width$}", n)).collect());
    }

    if item.contains('-') {
        return Err(TargetError::UnparseableRange(pattern.to_string()));
    }
    if item.is_empty() {
        return Err(TargetError::UnparseableRange(pattern.to_string()));
    }

    Ok(vec![item.to_string()])
}
