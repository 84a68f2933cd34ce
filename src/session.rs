//! Per-identity session bag and the server-wide LRU cache holding them
//! (spec §3 "Session", §4.10 "Session LRU").

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use serde_json::Value;

use crate::lru::LruMap;

/// A mutable key-value bag associated with an identity. Survives reconnects
/// of the same identity because it is keyed in the server's [`SessionStore`]
/// rather than owned by the connection.
#[derive(Default)]
pub struct Session {
    values: Mutex<HashMap<String, Value>>,
}

impl Session {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn get(&self, key: &str) -> Option<Value> {
        self.values.lock().expect("session lock poisoned").get(key).cloned()
    }

    pub fn set(&self, key: impl Into<String>, value: Value) {
        self.values
            .lock()
            .expect("session lock poisoned")
            .insert(key.into(), value);
    }

    pub fn clear(&self) {
        self.values.lock().expect("session lock poisoned").clear();
    }
}

/// Server-wide, LRU-evicted map of `identity -> Session`, bounded by
/// `maxSessions` (default 50 000). Acts as the durability layer across
/// brief disconnects: a reconnecting identity finds its old session bag
/// still present as long as it hasn't been evicted.
pub struct SessionStore {
    inner: Mutex<LruMap<String, Arc<Session>>>,
}

impl SessionStore {
    pub fn new(max_sessions: usize) -> Self {
        Self {
            inner: Mutex::new(LruMap::new(max_sessions.max(1))),
        }
    }

    /// Fetch the existing session for `identity`, or create and register a
    /// fresh one. Promotes to most-recently-used either way.
    pub fn get_or_create(&self, identity: &str) -> Arc<Session> {
        let mut inner = self.inner.lock().expect("session store lock poisoned");
        if let Some(existing) = inner.get(&identity.to_string()) {
            return existing.clone();
        }
        let session = Session::new();
        inner.set(identity.to_string(), session.clone());
        session
    }

    pub fn len(&self) -> usize {
        self.inner.lock().expect("session store lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn remove(&self, identity: &str) {
        self.inner
            .lock()
            .expect("session store lock poisoned")
            .remove(&identity.to_string());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn session_persists_across_get_or_create_calls() {
        let store = SessionStore::new(2);
        let s1 = store.get_or_create("CP001");
        s1.set("marker", Value::String("preserved".to_string()));
        let s2 = store.get_or_create("CP001");
        assert_eq!(
            s2.get("marker"),
            Some(Value::String("preserved".to_string()))
        );
    }

    #[test]
    fn store_respects_max_sessions() {
        let store = SessionStore::new(1);
        store.get_or_create("a");
        store.get_or_create("b");
        assert_eq!(store.len(), 1);
    }
}
