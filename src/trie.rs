//! Radix trie path matcher (C5): static / `:param` / `*` wildcard segments,
//! static > param > wildcard match priority, idempotent re-registration of
//! the same `(pattern, router)` pair, and registration-time detection of
//! conflicting param names at the same trie position.
//!
//! Structurally grounded in the teacher-adjacent `ando-core::router::Router`
//! (a `DashMap` source-of-truth plus a pre-compiled, `ArcSwap`-held snapshot
//! rebuilt on every mutation) — but hand-rolled rather than delegated to
//! `matchit`, since the spec's freeze/unfreeze and multi-router-per-pattern
//! semantics don't map onto that crate's API.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};

use crate::error::RouterError;

#[derive(Default)]
struct Node<T> {
    /// Static children, keyed by lowercased segment (case-insensitive match).
    static_children: HashMap<String, Node<T>>,
    /// At most one param child; `param_name` is fixed once one router's
    /// pattern creates it, and a different name at the same position is a
    /// registration error.
    param_child: Option<Box<Node<T>>>,
    param_name: Option<String>,
    /// A wildcard (`*`) consumes the remainder of the path; it is always a
    /// leaf.
    wildcard_child: Option<Box<Node<T>>>,
    /// Values registered for a pattern ending exactly at this node.
    values: Vec<T>,
    /// Exact `(pattern, value)` pairs already registered at this node, used
    /// to make re-registration idempotent.
    registered: Vec<String>,
}

impl<T> Node<T> {
    fn new() -> Self {
        Self::default()
    }
}

/// Result of a successful match: every value registered for the winning
/// pattern, plus extracted `:param` bindings.
pub struct Match<T> {
    pub values: Vec<T>,
    pub params: Vec<(String, String)>,
}

/// A radix trie mapping normalized path patterns to one or more values
/// (e.g. routers). Segments are `/`-delimited; `%`-escapes are decoded by
/// the caller before `insert`/`match_path` (see [`normalize`]).
pub struct RadixTrie<T> {
    root: RwLock<Node<T>>,
    /// Once frozen, lookups may use a cached fast path; any subsequent
    /// `insert` unfreezes automatically.
    frozen: AtomicBool,
}

impl<T: Clone> RadixTrie<T> {
    pub fn new() -> Self {
        Self {
            root: RwLock::new(Node::new()),
            frozen: AtomicBool::new(false),
        }
    }

    pub fn is_frozen(&self) -> bool {
        self.frozen.load(Ordering::Acquire)
    }

    /// Freeze the trie for read-path optimization. A correctness no-op in
    /// this implementation (the read path is already lock-cheap); tracked
    /// so callers can assert the optimization contract and so a later
    /// `insert` is observed to unfreeze it.
    pub fn freeze(&self) {
        self.frozen.store(true, Ordering::Release);
    }

    /// Insert `value` for `pattern`. Idempotent: inserting the identical
    /// `(pattern, value)` pair twice has no additional effect beyond the
    /// first. Unfreezes the trie.
    pub fn insert(&self, pattern: &str, value: T) -> Result<(), RouterError>
    where
        T: PartialEq,
    {
        self.frozen.store(false, Ordering::Release);
        let segments = split_pattern(pattern);
        let mut root = self.root.write().expect("trie lock poisoned");
        let mut node = &mut *root;
        for seg in &segments {
            node = descend_or_create(node, seg)?;
        }
        if !node.registered.iter().any(|p| p == pattern) {
            node.registered.push(pattern.to_string());
            node.values.push(value);
        }
        Ok(())
    }

    /// Match `path` (already normalized — see [`normalize`]) against all
    /// registered patterns, returning every value bound to the
    /// highest-priority match (static > param > wildcard at each depth).
    pub fn match_path(&self, path: &str) -> Option<Match<T>> {
        let root = self.root.read().expect("trie lock poisoned");
        let segments: Vec<&str> = if path.is_empty() {
            vec![]
        } else {
            path.split('/').collect()
        };
        let mut params = Vec::new();
        match find(&root, &segments, &mut params) {
            Some(node) if !node.values.is_empty() => Some(Match {
                values: node.values.clone(),
                params,
            }),
            _ => None,
        }
    }
}

impl<T: Clone> Default for RadixTrie<T> {
    fn default() -> Self {
        Self::new()
    }
}

fn descend_or_create<'a, T>(
    node: &'a mut Node<T>,
    seg: &Segment,
) -> Result<&'a mut Node<T>, RouterError> {
    match seg {
        Segment::Static(s) => Ok(node
            .static_children
            .entry(s.to_lowercase())
            .or_insert_with(Node::new)),
        Segment::Param(name) => {
            if let Some(existing) = &node.param_name {
                if existing != name {
                    return Err(RouterError::ConflictingParamName {
                        existing: existing.clone(),
                        new: name.clone(),
                    });
                }
            } else {
                node.param_name = Some(name.clone());
            }
            if node.param_child.is_none() {
                node.param_child = Some(Box::new(Node::new()));
            }
            Ok(node.param_child.as_mut().unwrap())
        }
        Segment::Wildcard => {
            if node.wildcard_child.is_none() {
                node.wildcard_child = Some(Box::new(Node::new()));
            }
            Ok(node.wildcard_child.as_mut().unwrap())
        }
    }
}

fn find<'a, T>(
    node: &'a Node<T>,
    segments: &[&str],
    params: &mut Vec<(String, String)>,
) -> Option<&'a Node<T>> {
    let Some((head, rest)) = segments.split_first() else {
        return Some(node);
    };

    // static > param > wildcard, in priority order.
    if let Some(child) = node.static_children.get(&head.to_lowercase()) {
        if let Some(found) = find(child, rest, params) {
            return Some(found);
        }
    }
    if let Some(child) = &node.param_child {
        let mut candidate_params = params.clone();
        if let Some(name) = &node.param_name {
            candidate_params.push((name.clone(), head.to_string()));
        }
        if let Some(found) = find(child, rest, &mut candidate_params) {
            *params = candidate_params;
            return Some(found);
        }
    }
    if let Some(child) = &node.wildcard_child {
        if !child.values.is_empty() {
            return Some(child);
        }
    }
    None
}

enum Segment {
    Static(String),
    Param(String),
    Wildcard,
}

fn split_pattern(pattern: &str) -> Vec<Segment> {
    normalize(pattern)
        .split('/')
        .filter(|s| !s.is_empty())
        .map(|s| {
            if s == "*" {
                Segment::Wildcard
            } else if let Some(name) = s.strip_prefix(':') {
                Segment::Param(name.to_string())
            } else {
                Segment::Static(s.to_string())
            }
        })
        .collect()
}

/// Collapse `//`, trim leading/trailing `/`, and percent-decode each
/// segment. Used for both pattern registration and incoming path matching.
pub fn normalize(path: &str) -> String {
    use percent_encoding::percent_decode_str;
    let trimmed = path.trim_matches('/');
    trimmed
        .split('/')
        .filter(|s| !s.is_empty())
        .map(|s| {
            percent_decode_str(s)
                .decode_utf8()
                .map(|c| c.into_owned())
                .unwrap_or_else(|_| s.to_string())
        })
        .collect::<Vec<_>>()
        .join("/")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn static_beats_param_beats_wildcard() {
        let trie: RadixTrie<&str> = RadixTrie::new();
        trie.insert("/ocpp/:identity", "param").unwrap();
        trie.insert("/ocpp/special", "static").unwrap();
        trie.insert("/ocpp/*", "wildcard").unwrap();

        let m = trie.match_path("ocpp/special").unwrap();
        assert_eq!(m.values, &["static"]);

        let m = trie.match_path("ocpp/CP001").unwrap();
        assert_eq!(m.values, &["param"]);
        assert_eq!(m.params, vec![("identity".to_string(), "CP001".to_string())]);
    }

    #[test]
    fn wildcard_consumes_remainder() {
        let trie: RadixTrie<&str> = RadixTrie::new();
        trie.insert("/files/*", "files").unwrap();
        let m = trie.match_path("files/a/b/c").unwrap();
        assert_eq!(m.values, &["files"]);
    }

    #[test]
    fn multiple_routers_on_same_pattern_all_returned() {
        let trie: RadixTrie<&str> = RadixTrie::new();
        trie.insert("/ocpp/:identity", "router-a").unwrap();
        trie.insert("/ocpp/:identity", "router-b").unwrap();
        let m = trie.match_path("ocpp/CP001").unwrap();
        assert_eq!(m.values, &["router-a", "router-b"]);
    }

    #[test]
    fn idempotent_reinsertion() {
        let trie: RadixTrie<&str> = RadixTrie::new();
        trie.insert("/ocpp/:identity", "router-a").unwrap();
        trie.insert("/ocpp/:identity", "router-a").unwrap();
        let m = trie.match_path("ocpp/CP001").unwrap();
        assert_eq!(m.values, &["router-a"]);
    }

    #[test]
    fn conflicting_param_name_is_an_error() {
        let trie: RadixTrie<&str> = RadixTrie::new();
        trie.insert("/ocpp/:identity", "a").unwrap();
        let err = trie.insert("/ocpp/:stationId", "b").unwrap_err();
        assert_eq!(
            err,
            RouterError::ConflictingParamName {
                existing: "identity".to_string(),
                new: "stationId".to_string(),
            }
        );
    }

    #[test]
    fn freeze_unfreezes_on_insert() {
        let trie: RadixTrie<&str> = RadixTrie::new();
        trie.insert("/a", "x").unwrap();
        trie.freeze();
        assert!(trie.is_frozen());
        trie.insert("/b", "y").unwrap();
        assert!(!trie.is_frozen());
    }

    #[test]
    fn normalize_collapses_and_trims() {
        assert_eq!(normalize("//ocpp//CP001/"), "ocpp/CP001");
        assert_eq!(normalize("/ocpp/CP%2F001"), "ocpp/CP/001");
    }
}

#[cfg(test)]
mod proptests {
    use super::*;
    use proptest::prelude::*;

    proptest! {
        /// A `:param` route matches any single non-slash, non-empty segment
        /// and extracts it verbatim as the param value.
        #[test]
        fn param_route_extracts_any_single_segment(identity in "[a-zA-Z0-9_-]{1,20}") {
            let trie: RadixTrie<&str> = RadixTrie::new();
            trie.insert("/ocpp/:identity", "handler").unwrap();
            let path = format!("ocpp/{identity}");
            let m = trie.match_path(&path).unwrap();
            prop_assert_eq!(m.values, vec!["handler"]);
            prop_assert_eq!(m.params, vec![("identity".to_string(), identity)]);
        }

        /// Whenever a static route collides with a registered param route at
        /// the same depth, the static route always wins, for any identity.
        #[test]
        fn static_route_always_wins_over_param(identity in "[a-zA-Z0-9_-]{1,20}") {
            let trie: RadixTrie<&str> = RadixTrie::new();
            trie.insert("/ocpp/:identity", "param").unwrap();
            trie.insert(&format!("/ocpp/{identity}"), "static").unwrap();
            let path = format!("ocpp/{identity}");
            let m = trie.match_path(&path).unwrap();
            prop_assert_eq!(m.values, vec!["static"]);
        }
    }
}
