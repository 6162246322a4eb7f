//! Time-bounded token store.
//!
//! Used for the OAuth-style state tokens in the installation-linking flow.
//! Injected into the handlers that need it rather than held as hidden
//! module state, so multiple instances and tests can each carry their own.

use std::collections::HashMap;
use std::hash::Hash;
use std::time::Duration;

use tokio::sync::RwLock;
use tokio::time::Instant;

pub struct TtlCache<K, V> {
    entries: RwLock<HashMap<K, (V, Instant)>>,
    ttl: Duration,
}

impl<K: Eq + Hash + Clone, V: Clone> TtlCache<K, V> {
    pub fn new(ttl: Duration) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            ttl,
        }
    }

    pub async fn insert(&self, key: K, value: V) {
        let mut entries = self.entries.write().await;
        entries.insert(key, (value, Instant::now() + self.ttl));
    }

    /// Remove and return the value for a key, if present and not expired.
    /// One-shot by design: a state token must not be redeemable twice.
    pub async fn take(&self, key: &K) -> Option<V> {
        let mut entries = self.entries.write().await;
        match entries.remove(key) {
            Some((value, expires_at)) if Instant::now() < expires_at => Some(value),
            _ => None,
        }
    }

    /// Drop expired entries. Called opportunistically from the insert path
    /// owner; correctness never depends on it.
    pub async fn prune_expired(&self) {
        let now = Instant::now();
        let mut entries = self.entries.write().await;
        entries.retain(|_, (_, expires_at)| *expires_at > now);
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }
}
