//! A per-key lock table: a short-lived `RwLock`-guarded map handing out a
//! long-lived `Mutex` per entry, so callers serialize on the *entry*, not on
//! the map itself. Used by both the cache controller and the directory slice
//! to realize "one active transaction per line" without serializing unrelated
//! lines behind a single lock.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};

/// Maps `u64` keys (line-aligned addresses) to `Arc<Mutex<V>>` entries,
/// creating entries lazily on first access.
pub struct LineTable<V> {
    entries: RwLock<HashMap<u64, Arc<Mutex<V>>>>,
}

impl<V: Default> LineTable<V> {
    pub fn new() -> Self {
        LineTable {
            entries: RwLock::new(HashMap::new()),
        }
    }

    /// Returns the entry for `key`, creating it with `V::default()` if this
    /// is the first touch. The map lock is only held long enough to look up
    /// or insert the `Arc`; the returned handle is locked independently.
    pub fn get_or_create(&self, key: u64) -> Arc<Mutex<V>> {
        if let Some(entry) = self.entries.read().get(&key) {
            return entry.clone();
        }
        let mut guard = self.entries.write();
        guard
            .entry(key)
            .or_insert_with(|| Arc::new(Mutex::new(V::default())))
            .clone()
    }

    /// Returns the entry for `key` only if it has already been touched.
    pub fn get(&self, key: u64) -> Option<Arc<Mutex<V>>> {
        self.entries.read().get(&key).cloned()
    }

    /// Snapshot of all currently-materialized keys, for diagnostics.
    pub fn keys(&self) -> Vec<u64> {
        self.entries.read().keys().copied().collect()
    }
}

impl<V: Default> Default for LineTable<V> {
    fn default() -> Self {
        Self::new()
    }
}
