use std::{collections::HashMap, hash::Hash, time::Duration};

use tokio::time::Instant;

#[derive(Clone, Debug)]
pub struct CacheEntry<V> {
    pub value: V,
    pub written_at: Instant,
    pub dirty: bool,
    /// Bumped on every local write; a batch only marks the entry clean if the
    /// version it persisted is still current.
    pub version: u64,
}

/// TTL cache with dirty tracking. Not synchronised; the owner wraps it in a lock.
#[derive(Debug)]
pub struct Cache<K, V> {
    ttl: Duration,
    entries: HashMap<K, CacheEntry<V>>,
    next_version: u64,
}

impl<K: Eq + Hash + Clone, V: Clone> Cache<K, V> {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            entries: HashMap::new(),
            next_version: 0,
        }
    }

    /// Fresh or dirty value. A dirty entry is never stale: it is newer than the store.
    pub fn get(&self, key: &K) -> Option<V> {
        self.get_at(key, Instant::now())
    }

    pub fn get_at(&self, key: &K, now: Instant) -> Option<V> {
        let e = self.entries.get(key)?;
        if e.dirty || now.saturating_duration_since(e.written_at) < self.ttl {
            Some(e.value.clone())
        } else {
            None
        }
    }

    pub fn entry(&self, key: &K) -> Option<&CacheEntry<V>> {
        self.entries.get(key)
    }

    /// Value as loaded from or committed to the store.
    pub fn put_clean(&mut self, key: K, value: V) -> u64 {
        self.put(key, value, false)
    }

    /// Locally modified value awaiting a batch; returns its version.
    pub fn put_dirty(&mut self, key: K, value: V) -> u64 {
        self.put(key, value, true)
    }

    fn put(&mut self, key: K, value: V, dirty: bool) -> u64 {
        self.next_version += 1;
        let version = self.next_version;
        self.entries.insert(
            key,
            CacheEntry {
                value,
                written_at: Instant::now(),
                dirty,
                version,
            },
        );
        version
    }

    /// Returns whether the entry was marked clean.
    pub fn mark_clean(&mut self, key: &K, version: u64) -> bool {
        match self.entries.get_mut(key) {
            Some(e) if e.version == version => {
                e.dirty = false;
                true
            }
            _ => false,
        }
    }

    pub fn dirty(&self) -> Vec<(K, V, u64)> {
        self.entries
            .iter()
            .filter(|(_, e)| e.dirty)
            .map(|(k, e)| (k.clone(), e.value.clone(), e.version))
            .collect()
    }

    /// Keys whose entry is older than the TTL, dirty or not.
    pub fn expired(&self, now: Instant) -> Vec<K> {
        self.entries
            .iter()
            .filter(|(_, e)| now.saturating_duration_since(e.written_at) >= self.ttl)
            .map(|(k, _)| k.clone())
            .collect()
    }

    /// Drop `key` if it is clean. Returns whether it was removed.
    pub fn evict_clean(&mut self, key: &K) -> bool {
        match self.entries.get(key) {
            Some(e) if !e.dirty => {
                self.entries.remove(key);
                true
            }
            _ => false,
        }
    }

    pub fn remove(&mut self, key: &K) -> Option<CacheEntry<V>> {
        self.entries.remove(key)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
