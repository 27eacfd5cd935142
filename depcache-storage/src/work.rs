//! In-memory store for derived work results.
//!
//! Work results are arbitrary typed values (an import map, parsed package
//! metadata) keyed by a caller-chosen string. They are held as
//! `Arc<dyn Any + Send + Sync>` together with the tags recorded while they
//! were computed; the engine downcasts on read.

use std::any::Any;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use depcache_core::Tag;

/// Type-erased work value.
pub type WorkValue = Arc<dyn Any + Send + Sync>;

/// A stored work result and the dependencies it was computed from.
#[derive(Clone)]
pub struct WorkEntry {
    pub value: WorkValue,
    pub tags: Vec<Tag>,
}

impl std::fmt::Debug for WorkEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkEntry")
            .field("tags", &self.tags)
            .finish_non_exhaustive()
    }
}

/// Key-value table of work results. Cheap to share behind an `Arc`.
#[derive(Debug, Default)]
pub struct WorkStore {
    entries: Mutex<HashMap<String, WorkEntry>>,
}

impl WorkStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn entries(&self) -> MutexGuard<'_, HashMap<String, WorkEntry>> {
        self.entries
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn get(&self, key: &str) -> Option<WorkEntry> {
        self.entries().get(key).cloned()
    }

    pub fn insert(&self, key: impl Into<String>, entry: WorkEntry) {
        self.entries().insert(key.into(), entry);
    }

    /// Remove the entry for `key`. Returns whether one existed.
    pub fn remove(&self, key: &str) -> bool {
        self.entries().remove(key).is_some()
    }

    /// Remove every entry. Returns how many were removed.
    pub fn clear(&self) -> u64 {
        let mut entries = self.entries();
        let removed = entries.len() as u64;
        entries.clear();
        removed
    }

    pub fn len(&self) -> usize {
        self.entries().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
