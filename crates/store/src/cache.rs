//! Per-resource cache entry store.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{PoisonError, RwLock};
use std::time::Duration;

use chrono::{DateTime, Utc};
use quarry_core::{QuarryError, Result, Value};
use rustc_hash::FxHashMap;
use tokio::sync::watch;

/// Status of one computed field.
#[derive(Debug, Clone, PartialEq)]
pub struct CacheEntry {
    pub data: Value,
    /// `false` means known stale; the field must be recomputed.
    pub valid: bool,
    pub error: Option<QuarryError>,
    pub timestamp: DateTime<Utc>,
    /// Assigned by the store on write; unique and increasing per resource.
    pub generation: u64,
}

impl CacheEntry {
    pub fn value(data: Value) -> Self {
        Self { data, valid: true, error: None, timestamp: Utc::now(), generation: 0 }
    }

    pub fn error(err: QuarryError) -> Self {
        Self { data: Value::Null, valid: true, error: Some(err), timestamp: Utc::now(), generation: 0 }
    }

    pub fn from_result(res: Result<Value>) -> Self {
        match res { Ok(v) => Self::value(v), Err(e) => Self::error(e) }
    }

    pub fn into_result(self) -> Result<Value> {
        match self.error { Some(e) => Err(e), None => Ok(self.data) }
    }

    pub fn age(&self) -> Duration { (Utc::now() - self.timestamp).to_std().unwrap_or_default() }

    /// Same observable outcome, ignoring bookkeeping.
    pub fn same_outcome(&self, other: &CacheEntry) -> bool {
        self.valid && other.valid && self.data == other.data && self.error == other.error
    }
}

/// Field name to [`CacheEntry`] map owned by one resource instance.
///
/// Every write bumps a generation counter and publishes it on a watch
/// channel, which is what readiness waiters subscribe to.
pub struct FieldCache {
    entries: RwLock<FxHashMap<String, CacheEntry>>,
    generation: AtomicU64,
    changed: watch::Sender<u64>,
}

impl Default for FieldCache {
    fn default() -> Self { Self::new() }
}

impl FieldCache {
    pub fn new() -> Self {
        let (changed, _rx) = watch::channel(0u64);
        Self { entries: RwLock::new(FxHashMap::default()), generation: AtomicU64::new(0), changed }
    }

    pub fn load(&self, field: &str) -> Option<CacheEntry> {
        self.entries.read().unwrap_or_else(PoisonError::into_inner).get(field).cloned()
    }

    /// Overwrite the entry for `field`; returns the generation assigned to it.
    pub fn store(&self, field: &str, mut entry: CacheEntry) -> u64 {
        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        let generation = self.next_generation();
        entry.generation = generation;
        entries.insert(field.to_string(), entry);
        drop(entries);
        self.changed.send_replace(generation);
        generation
    }

    /// Store only if the outcome differs from the current valid entry.
    /// Returns the new generation, or `None` when the write was suppressed.
    pub fn store_if_changed(&self, field: &str, mut entry: CacheEntry) -> Option<u64> {
        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        if entries.get(field).is_some_and(|old| old.same_outcome(&entry)) {
            return None;
        }
        let generation = self.next_generation();
        entry.generation = generation;
        entries.insert(field.to_string(), entry);
        drop(entries);
        self.changed.send_replace(generation);
        Some(generation)
    }

    /// Like [`store_if_changed`](Self::store_if_changed), but a stale entry
    /// with the same outcome is revalidated in place and keeps its generation.
    /// Waiters are still woken so they see it valid again.
    pub fn revalidate_or_store(&self, field: &str, mut entry: CacheEntry) -> Option<u64> {
        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        if let Some(old) = entries.get_mut(field) {
            if old.data == entry.data && old.error == entry.error {
                let wake = !old.valid;
                old.valid = true;
                let generation = old.generation;
                drop(entries);
                if wake {
                    self.changed.send_replace(generation);
                }
                return None;
            }
        }
        let generation = self.next_generation();
        entry.generation = generation;
        entries.insert(field.to_string(), entry);
        drop(entries);
        self.changed.send_replace(generation);
        Some(generation)
    }

    /// Store unless a valid entry already exists (opportunistic sibling caching).
    pub fn prime(&self, field: &str, mut entry: CacheEntry) -> bool {
        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        if entries.get(field).is_some_and(|e| e.valid) {
            return false;
        }
        let generation = self.next_generation();
        entry.generation = generation;
        entries.insert(field.to_string(), entry);
        drop(entries);
        self.changed.send_replace(generation);
        true
    }

    pub fn delete(&self, field: &str) -> Option<CacheEntry> {
        self.entries.write().unwrap_or_else(PoisonError::into_inner).remove(field)
    }

    /// Mark an entry stale so the next read starts a new generation.
    pub fn invalidate(&self, field: &str) -> bool {
        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        match entries.get_mut(field) {
            Some(e) if e.valid => { e.valid = false; true }
            _ => false,
        }
    }

    /// Invalidate every entry except the ones named in `keep`.
    pub fn invalidate_all_except(&self, keep: &[&str]) -> usize {
        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        let mut n = 0;
        for (field, e) in entries.iter_mut() {
            if e.valid && !keep.contains(&field.as_str()) { e.valid = false; n += 1; }
        }
        n
    }

    pub fn len(&self) -> usize { self.entries.read().unwrap_or_else(PoisonError::into_inner).len() }
    pub fn is_empty(&self) -> bool { self.len() == 0 }

    pub fn fields(&self) -> Vec<String> {
        let mut out: Vec<String> = self.entries.read().unwrap_or_else(PoisonError::into_inner).keys().cloned().collect();
        out.sort_unstable();
        out
    }

    /// Receiver that observes every write to this cache.
    pub fn subscribe(&self) -> watch::Receiver<u64> { self.changed.subscribe() }

    fn next_generation(&self) -> u64 { self.generation.fetch_add(1, Ordering::Relaxed) + 1 }
}
