//! Process-lifetime key/value registries with lazy expiry.
//!
//! Registries are owned by one executor and injected where needed; there is
//! no global instance. Nothing is persisted.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use tokio::time::Instant;

use crate::gateway::FileRef;

struct Entry<V> {
    value: V,
    expires_at: Option<Instant>,
}

impl<V> Entry<V> {
    fn is_live(&self, now: Instant) -> bool {
        self.expires_at.map_or(true, |t| now < t)
    }
}

/// Thread-safe map from key to value with optional per-entry TTL.
pub struct Registry<V> {
    entries: Mutex<HashMap<String, Entry<V>>>,
}

impl<V> Default for Registry<V> {
    fn default() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
        }
    }
}

impl<V: Clone> Registry<V> {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, Entry<V>>> {
        // A poisoned map is still structurally valid.
        self.entries.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Get a live value. Expired entries are removed on the way out.
    pub fn get(&self, key: &str) -> Option<V> {
        let mut entries = self.lock();
        let now = Instant::now();
        match entries.get(key) {
            Some(entry) if entry.is_live(now) => Some(entry.value.clone()),
            Some(_) => {
                entries.remove(key);
                None
            }
            None => None,
        }
    }

    /// Insert a value. `ttl = None` keeps it for the registry's lifetime.
    pub fn insert(&self, key: impl Into<String>, value: V, ttl: Option<Duration>) {
        let expires_at = ttl.and_then(|ttl| Instant::now().checked_add(ttl));
        self.lock().insert(key.into(), Entry { value, expires_at });
    }

    /// Remove a key, returning its value if it was still live.
    pub fn evict(&self, key: &str) -> Option<V> {
        let entry = self.lock().remove(key)?;
        entry.is_live(Instant::now()).then_some(entry.value)
    }

    pub fn clear(&self) {
        self.lock().clear();
    }

    /// Number of stored entries, including expired ones not yet read.
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Cache identity key to provider cache name.
pub type CacheRegistry = Registry<String>;

/// `(path, mime)` key to uploaded file reference.
pub type FileRegistry = Registry<FileRef>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn insert_get_evict() {
        let registry: CacheRegistry = Registry::new();
        registry.insert("k", "cachedContents/1".to_string(), None);
        assert_eq!(registry.get("k").as_deref(), Some("cachedContents/1"));
        assert_eq!(registry.evict("k").as_deref(), Some("cachedContents/1"));
        assert!(registry.get("k").is_none());
        assert!(registry.is_empty());
    }

    #[test]
    fn expired_entries_are_dropped_on_read() {
        let registry: CacheRegistry = Registry::new();
        registry.insert("k", "v".to_string(), Some(Duration::ZERO));
        assert_eq!(registry.len(), 1);
        assert!(registry.get("k").is_none());
        assert_eq!(registry.len(), 0);
    }

    #[test]
    fn clear_empties_registry() {
        let registry: FileRegistry = Registry::new();
        registry.insert("a", FileRef::new("files/a"), None);
        registry.insert("b", FileRef::new("files/b"), None);
        registry.clear();
        assert!(registry.is_empty());
    }
}
