//! Process-local TTL cache.
//!
//! Entries expire lazily on read and are swept periodically by
//! [`TtlCache::purge_expired`]. Contents are advisory: every cached value can
//! be recomputed from the database, and nothing is shared between instances.

use dashmap::DashMap;
use glob::Pattern;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

#[derive(Debug, Clone)]
struct Entry<V> {
    value: V,
    expires_at: Instant,
}

#[derive(Debug)]
pub struct TtlCache<V> {
    entries: DashMap<String, Entry<V>>,
    default_ttl: Duration,
}

impl<V: Clone> TtlCache<V> {
    pub fn new(default_ttl: Duration) -> Self {
        Self {
            entries: DashMap::new(),
            default_ttl,
        }
    }

    pub fn get(&self, key: &str) -> Option<V> {
        let now = Instant::now();
        if let Some(entry) = self.entries.get(key) {
            if entry.expires_at > now {
                return Some(entry.value.clone());
            }
        } else {
            return None;
        }
        // Expired: drop it, unless a writer replaced it meanwhile.
        self.entries.remove_if(key, |_, e| e.expires_at <= now);
        None
    }

    pub fn set(&self, key: impl Into<String>, value: V) {
        self.set_with_ttl(key, value, self.default_ttl);
    }

    pub fn set_with_ttl(&self, key: impl Into<String>, value: V, ttl: Duration) {
        self.entries.insert(
            key.into(),
            Entry {
                value,
                expires_at: Instant::now() + ttl,
            },
        );
    }

    pub fn delete(&self, key: &str) -> bool {
        self.entries.remove(key).is_some()
    }

    /// Remove every key matching a glob (`companies:*`, `board:?`). Returns the
    /// number of entries removed. An invalid pattern removes nothing.
    pub fn delete_pattern(&self, pattern: &str) -> usize {
        let pattern = match Pattern::new(pattern) {
            Ok(p) => p,
            Err(err) => {
                warn!(pattern, ?err, "invalid cache key pattern");
                return 0;
            }
        };
        let before = self.entries.len();
        self.entries.retain(|k, _| !pattern.matches(k));
        let removed = before.saturating_sub(self.entries.len());
        debug!(pattern = pattern.as_str(), removed, "cache pattern delete");
        removed
    }

    pub fn clear(&self) {
        self.entries.clear();
    }

    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let before = self.entries.len();
        self.entries.retain(|_, e| e.expires_at > now);
        before.saturating_sub(self.entries.len())
    }

    /// Number of stored entries, expired ones included until purged.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
