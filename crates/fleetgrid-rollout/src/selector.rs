//! Target filter evaluation.
//!
//! A filter is a `;`-separated list of terms that must all match. A term
//! is either `attribute.<key>==<value>` or a comma-separated list of
//! controller-id glob patterns, of which any may match:
//!
//! ```text
//! edge-*,gw-01;attribute.hw==rev2
//! ```

use fleetgrid_state::{StateStore, Target};
use regex::Regex;

use crate::error::{RolloutError, RolloutResult};

/// Resolves a filter to the controller ids of matching targets.
pub trait TargetSelector: Send + Sync {
    fn select(&self, tenant: &str, filter: &str) -> RolloutResult<Vec<String>>;
}

/// A controller-id glob compiled to an anchored regex.
#[derive(Debug, Clone)]
struct IdPattern {
    glob: String,
    regex: Regex,
}

impl IdPattern {
    /// `*` matches any run of characters, everything else matches itself.
    fn compile(glob: &str) -> Result<Self, regex::Error> {
        let body = glob
            .split('*')
            .map(regex::escape)
            .collect::<Vec<_>>()
            .join(".*");
        Ok(Self {
            glob: glob.to_string(),
            regex: Regex::new(&format!("^{body}$"))?,
        })
    }

    fn is_match(&self, controller_id: &str) -> bool {
        self.regex.is_match(controller_id)
    }
}

impl PartialEq for IdPattern {
    fn eq(&self, other: &Self) -> bool {
        self.glob == other.glob
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Term {
    Ids(Vec<IdPattern>),
    Attribute { key: String, value: String },
}

impl Term {
    fn matches(&self, target: &Target) -> bool {
        match self {
            Term::Ids(patterns) => patterns.iter().any(|p| p.is_match(&target.controller_id)),
            Term::Attribute { key, value } => target.attributes.get(key) == Some(value),
        }
    }
}

fn parse_filter(filter: &str) -> RolloutResult<Vec<Term>> {
    let invalid = |reason: String| RolloutError::InvalidFilter {
        filter: filter.to_string(),
        reason,
    };
    if filter.trim().is_empty() {
        return Err(invalid("empty filter".to_string()));
    }

    filter
        .split(';')
        .map(str::trim)
        .map(|term| {
            if term.is_empty() {
                return Err(invalid("empty term".to_string()));
            }
            if let Some(rest) = term.strip_prefix("attribute.") {
                let (key, value) = rest
                    .split_once("==")
                    .ok_or_else(|| invalid(format!("expected attribute.<key>==<value> in '{term}'")))?;
                let key = key.trim();
                if key.is_empty() {
                    return Err(invalid(format!("missing attribute key in '{term}'")));
                }
                return Ok(Term::Attribute {
                    key: key.to_string(),
                    value: value.trim().to_string(),
                });
            }
            let patterns = term
                .split(',')
                .map(str::trim)
                .filter(|p| !p.is_empty())
                .map(|p| IdPattern::compile(p).map_err(|e| invalid(format!("bad pattern '{p}': {e}"))))
                .collect::<RolloutResult<Vec<_>>>()?;
            if patterns.is_empty() {
                return Err(invalid(format!("no patterns in '{term}'")));
            }
            Ok(Term::Ids(patterns))
        })
        .collect()
}

/// Evaluates filters against the targets in the state store.
#[derive(Clone)]
pub struct StoreTargetSelector {
    store: StateStore,
}

impl StoreTargetSelector {
    pub fn new(store: StateStore) -> Self {
        Self { store }
    }
}

impl TargetSelector for StoreTargetSelector {
    fn select(&self, tenant: &str, filter: &str) -> RolloutResult<Vec<String>> {
        let terms = parse_filter(filter)?;
        let mut ids: Vec<String> = self
            .store
            .list_targets(tenant)?
            .into_iter()
            .filter(|t| terms.iter().all(|term| term.matches(t)))
            .map(|t| t.controller_id)
            .collect();
        ids.sort();
        Ok(ids)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn glob_match(glob: &str, text: &str) -> bool {
        IdPattern::compile(glob).unwrap().is_match(text)
    }

    #[test]
    fn glob_patterns() {
        assert!(glob_match("*", "anything"));
        assert!(glob_match("*", ""));
        assert!(glob_match("edge-*", "edge-01"));
        assert!(!glob_match("edge-*", "gw-01"));
        assert!(glob_match("*-01", "edge-01"));
        assert!(!glob_match("*-01", "edge-02"));
        assert!(glob_match("edge-01", "edge-01"));
        assert!(!glob_match("edge-01", "edge-011"));
        assert!(glob_match("e*-*1", "edge-01"));
        assert!(!glob_match("ab*ba", "aba"));
    }

    #[test]
    fn regex_metacharacters_are_literal() {
        assert!(glob_match("gw.01", "gw.01"));
        assert!(!glob_match("gw.01", "gwx01"));
        assert!(glob_match("rack[1]-*", "rack[1]-a"));
        assert!(!glob_match("rack[1]-*", "rack1-a"));
        assert!(glob_match("a+b", "a+b"));
    }

    #[test]
    fn filter_parsing() {
        let terms = parse_filter("edge-*, gw-01 ;attribute.hw==rev2").unwrap();
        assert_eq!(
            terms,
            vec![
                Term::Ids(vec![
                    IdPattern::compile("edge-*").unwrap(),
                    IdPattern::compile("gw-01").unwrap(),
                ]),
                Term::Attribute {
                    key: "hw".to_string(),
                    value: "rev2".to_string(),
                },
            ]
        );
        assert!(parse_filter("").is_err());
        assert!(parse_filter("edge-*;;gw").is_err());
        assert!(parse_filter("attribute.hw").is_err());
        assert!(parse_filter("attribute.==x").is_err());
    }

    #[test]
    fn selects_matching_targets_of_tenant() {
        let store = StateStore::open_in_memory().unwrap();
        let now = Utc::now();
        for (tenant, id, hw) in [
            ("acme", "edge-02", "rev2"),
            ("acme", "edge-01", "rev1"),
            ("acme", "gw-01", "rev2"),
            ("other", "edge-03", "rev2"),
        ] {
            let mut target = Target::new(tenant, id, "test", now);
            target.attributes.insert("hw".to_string(), hw.to_string());
            store.put_target(&target).unwrap();
        }

        let selector = StoreTargetSelector::new(store);
        assert_eq!(
            selector.select("acme", "edge-*").unwrap(),
            vec!["edge-01", "edge-02"]
        );
        assert_eq!(
            selector.select("acme", "*;attribute.hw==rev2").unwrap(),
            vec!["edge-02", "gw-01"]
        );
        assert!(selector.select("acme", "nope-*").unwrap().is_empty());
    }
}
