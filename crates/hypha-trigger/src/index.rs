//! Namespace index over triggers.
//!
//! Each trigger is reachable by exactly one route per pattern: literal
//! patterns land in the exact-match bucket, patterns containing `*` in the
//! pattern bucket, and triggers with no namespaces under the catch-all
//! `*` pattern. Lookup unions both buckets and dedups by id.

use std::collections::{HashMap, HashSet};

use crate::types::Trigger;

/// `*` matches any substring; everything else is literal.
pub fn wildcard_match(pattern: &str, text: &str) -> bool {
    if !pattern.contains('*') {
        return pattern == text;
    }
    let mut parts = pattern.split('*');
    let first = parts.next().unwrap_or("");
    if !text.starts_with(first) {
        return false;
    }
    let mut pos = first.len();
    let mut segments: Vec<&str> = parts.collect();
    let last = segments.pop().unwrap_or("");

    for segment in segments {
        if segment.is_empty() {
            continue;
        }
        match text[pos..].find(segment) {
            Some(offset) => pos += offset + segment.len(),
            None => return false,
        }
    }

    if last.is_empty() {
        return true;
    }
    text.len() >= pos + last.len() && text.ends_with(last)
}

/// The index. Mutations go through a single writer (the store's watch
/// task); reads take the store's shared lock.
#[derive(Default)]
pub struct NamespaceIndex {
    exact: HashMap<String, Vec<String>>,
    patterns: HashMap<String, Vec<String>>,
    by_id: HashMap<String, Trigger>,
}

impl NamespaceIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, trigger: Trigger) {
        let id = trigger.id.clone();
        if trigger.namespaces.is_empty() {
            self.patterns.entry("*".to_string()).or_default().push(id.clone());
        } else {
            for pattern in &trigger.namespaces {
                let bucket = if pattern.contains('*') {
                    self.patterns.entry(pattern.clone())
                } else {
                    self.exact.entry(pattern.clone())
                };
                bucket.or_default().push(id.clone());
            }
        }
        self.by_id.insert(id, trigger);
    }

    pub fn remove(&mut self, id: &str) {
        if self.by_id.remove(id).is_none() {
            return;
        }
        self.exact.retain(|_, ids| {
            ids.retain(|existing| existing != id);
            !ids.is_empty()
        });
        self.patterns.retain(|_, ids| {
            ids.retain(|existing| existing != id);
            !ids.is_empty()
        });
    }

    /// All triggers whose namespace selection covers `namespace`,
    /// deduplicated by id.
    pub fn lookup(&self, namespace: &str) -> Vec<Trigger> {
        let mut ids: Vec<&String> = Vec::new();
        if let Some(exact) = self.exact.get(namespace) {
            ids.extend(exact);
        }
        for (pattern, pattern_ids) in &self.patterns {
            if pattern == "*" || wildcard_match(pattern, namespace) {
                ids.extend(pattern_ids);
            }
        }

        let mut seen = HashSet::new();
        ids.into_iter()
            .filter(|id| seen.insert(id.as_str()))
            .filter_map(|id| self.by_id.get(id).cloned())
            .collect()
    }

    pub fn get(&self, id: &str) -> Option<&Trigger> {
        self.by_id.get(id)
    }

    pub fn all(&self) -> Vec<Trigger> {
        self.by_id.values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.by_id.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_id.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn trigger(id: &str, namespaces: &[&str]) -> Trigger {
        Trigger {
            id: id.to_string(),
            name: id.to_string(),
            namespaces: namespaces.iter().map(|s| s.to_string()).collect(),
            object_type: String::new(),
            event_type: String::new(),
            criteria: String::new(),
            description: String::new(),
            enabled: true,
            action: "fn".to_string(),
        }
    }

    #[test]
    fn test_wildcard_match() {
        assert!(wildcard_match("*", "anything"));
        assert!(wildcard_match("prod", "prod"));
        assert!(!wildcard_match("prod", "production"));
        assert!(wildcard_match("prod-*", "prod-eu"));
        assert!(wildcard_match("*-eu", "prod-eu"));
        assert!(wildcard_match("prod-*-a", "prod-eu-a"));
        assert!(!wildcard_match("prod-*-a", "prod-eu-b"));
        assert!(wildcard_match("*prod*", "preprod-x"));
    }

    #[test]
    fn test_exact_and_pattern_routes_are_disjoint() {
        let mut index = NamespaceIndex::new();
        index.add(trigger("literal", &["prod"]));
        index.add(trigger("wild", &["prod-*"]));
        index.add(trigger("everywhere", &[]));

        let prod = index.lookup("prod");
        let ids: Vec<&str> = prod.iter().map(|t| t.id.as_str()).collect();
        assert!(ids.contains(&"literal"));
        assert!(ids.contains(&"everywhere"));
        assert!(!ids.contains(&"wild"));

        let prod_eu = index.lookup("prod-eu");
        let ids: Vec<&str> = prod_eu.iter().map(|t| t.id.as_str()).collect();
        assert!(ids.contains(&"wild"));
        assert!(ids.contains(&"everywhere"));
        assert!(!ids.contains(&"literal"));
    }

    #[test]
    fn test_lookup_dedups_by_id() {
        let mut index = NamespaceIndex::new();
        // both a literal and a pattern route cover "prod"
        index.add(trigger("both", &["prod", "pro*"]));
        let results = index.lookup("prod");
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].id, "both");
    }

    #[test]
    fn test_remove_clears_every_bucket() {
        let mut index = NamespaceIndex::new();
        index.add(trigger("t", &["prod", "staging-*"]));
        assert_eq!(index.len(), 1);

        index.remove("t");
        assert!(index.is_empty());
        assert!(index.lookup("prod").is_empty());
        assert!(index.lookup("staging-eu").is_empty());
    }

    #[test]
    fn test_update_replaces_routes() {
        let mut index = NamespaceIndex::new();
        index.add(trigger("t", &["prod"]));
        index.remove("t");
        index.add(trigger("t", &["dev"]));

        assert!(index.lookup("prod").is_empty());
        assert_eq!(index.lookup("dev").len(), 1);
    }
}
