//! Bridge between external change sources and watched fields.

use std::sync::{Arc, Mutex, PoisonError};

use quarry_core::{QuarryError, Result, Value};
use rustc_hash::FxHashMap;
use tracing::debug;

use crate::cache::CacheEntry;
use crate::resource::FieldUid;

/// One observation from a change source.
#[derive(Debug, Clone, PartialEq)]
pub enum Change {
    Value(Value),
    /// The watched object does not exist (yet).
    Missing(String),
    Failed(QuarryError),
}

impl Change {
    pub fn into_entry(self) -> CacheEntry {
        match self {
            Change::Value(v) => CacheEntry::value(v),
            Change::Missing(what) => CacheEntry::error(QuarryError::NotFound(what)),
            Change::Failed(err) => CacheEntry::error(err),
        }
    }
}

pub type ChangeSink = Arc<dyn Fn(Change) + Send + Sync>;

/// A source of change events keyed by string (a path, a collection name, ...).
///
/// Implementations deliver the current state once right after subscribing
/// and again after every change.
pub trait ChangeSource: Send + Sync {
    fn subscribe(&self, key: &str, sink: ChangeSink) -> Result<Subscription>;
}

/// Live registration with a change source; dropping it releases the registration.
pub struct Subscription {
    release: Option<Box<dyn FnOnce() + Send>>,
}

impl Subscription {
    pub fn new(release: impl FnOnce() + Send + 'static) -> Self { Self { release: Some(Box::new(release)) } }

    pub fn noop() -> Self { Self { release: None } }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(release) = self.release.take() {
            release();
        }
    }
}

/// Where a watched field gets its values from.
pub struct WatchTarget {
    pub source: Arc<dyn ChangeSource>,
    pub key: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchState {
    /// Subscribed, no event seen yet.
    Pending,
    Active,
}

struct Slot {
    state: WatchState,
    subscription: Option<Subscription>,
}

/// Tracks one subscription per watched field.
#[derive(Default)]
pub struct WatchBridge {
    slots: Mutex<FxHashMap<FieldUid, Slot>>,
}

impl WatchBridge {
    pub fn new() -> Self { Self::default() }

    pub fn state(&self, field: &FieldUid) -> Option<WatchState> {
        self.slots.lock().unwrap_or_else(PoisonError::into_inner).get(field).map(|s| s.state)
    }

    /// Subscribe `field` unless it already is. `subscribe` runs without the
    /// bridge lock held, so sources may deliver synchronously.
    ///
    /// Returns `true` when a new subscription was made.
    pub fn ensure<F>(&self, field: &FieldUid, subscribe: F) -> Result<bool>
    where
        F: FnOnce() -> Result<Subscription>,
    {
        {
            let mut slots = self.slots.lock().unwrap_or_else(PoisonError::into_inner);
            if slots.contains_key(field) {
                return Ok(false);
            }
            slots.insert(field.clone(), Slot { state: WatchState::Pending, subscription: None });
        }
        match subscribe() {
            Ok(sub) => {
                let mut slots = self.slots.lock().unwrap_or_else(PoisonError::into_inner);
                match slots.get_mut(field) {
                    Some(slot) => slot.subscription = Some(sub),
                    // released while subscribing; `sub` drops here
                    None => debug!(field = %field, "watch released during subscribe"),
                }
                Ok(true)
            }
            Err(err) => {
                self.slots.lock().unwrap_or_else(PoisonError::into_inner).remove(field);
                Err(err)
            }
        }
    }

    pub fn mark_active(&self, field: &FieldUid) {
        if let Some(slot) = self.slots.lock().unwrap_or_else(PoisonError::into_inner).get_mut(field) {
            slot.state = WatchState::Active;
        }
    }

    /// Drop the subscription for `field`, if any.
    pub fn release(&self, field: &FieldUid) -> bool {
        let slot = self.slots.lock().unwrap_or_else(PoisonError::into_inner).remove(field);
        // the release callback runs outside the bridge lock
        let released = slot.is_some();
        drop(slot);
        released
    }

    /// Release every subscription belonging to one resource.
    pub fn release_resource(&self, resource: &quarry_core::ResourceId) -> usize {
        let removed: Vec<Slot> = {
            let mut slots = self.slots.lock().unwrap_or_else(PoisonError::into_inner);
            let keys: Vec<FieldUid> = slots.keys().filter(|k| &k.resource == resource).cloned().collect();
            keys.iter().filter_map(|k| slots.remove(k)).collect()
        };
        removed.len()
    }

    pub fn len(&self) -> usize { self.slots.lock().unwrap_or_else(PoisonError::into_inner).len() }
    pub fn is_empty(&self) -> bool { self.len() == 0 }
}

struct ChannelEntry {
    last: Option<Change>,
    sinks: FxHashMap<u64, ChangeSink>,
}

#[derive(Default)]
struct ChannelInner {
    next_id: u64,
    keys: FxHashMap<String, ChannelEntry>,
}

/// In-process change source: producers `publish`, watched fields receive.
///
/// The last change per key is remembered and replayed to new subscribers.
#[derive(Clone, Default)]
pub struct ChannelSource {
    inner: Arc<Mutex<ChannelInner>>,
}

impl ChannelSource {
    pub fn new() -> Self { Self::default() }

    pub fn publish(&self, key: &str, change: Change) -> usize {
        let sinks: Vec<ChangeSink> = {
            let mut inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
            let entry = inner
                .keys
                .entry(key.to_string())
                .or_insert_with(|| ChannelEntry { last: None, sinks: FxHashMap::default() });
            entry.last = Some(change.clone());
            entry.sinks.values().cloned().collect()
        };
        for sink in &sinks {
            sink(change.clone());
        }
        sinks.len()
    }

    pub fn subscriber_count(&self, key: &str) -> usize {
        let inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        inner.keys.get(key).map(|e| e.sinks.len()).unwrap_or(0)
    }
}

impl ChangeSource for ChannelSource {
    fn subscribe(&self, key: &str, sink: ChangeSink) -> Result<Subscription> {
        let (id, last) = {
            let mut inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
            inner.next_id += 1;
            let id = inner.next_id;
            let entry = inner
                .keys
                .entry(key.to_string())
                .or_insert_with(|| ChannelEntry { last: None, sinks: FxHashMap::default() });
            entry.sinks.insert(id, Arc::clone(&sink));
            (id, entry.last.clone())
        };
        if let Some(change) = last {
            sink(change);
        }
        let inner = Arc::clone(&self.inner);
        let key = key.to_string();
        Ok(Subscription::new(move || {
            let mut inner = inner.lock().unwrap_or_else(PoisonError::into_inner);
            if let Some(entry) = inner.keys.get_mut(&key) {
                entry.sinks.remove(&id);
            }
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use quarry_core::ResourceId;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn channel_replays_last_change_and_releases_on_drop() {
        let src = ChannelSource::new();
        src.publish("/etc/motd", Change::Value("hello".into()));
        let seen = Arc::new(Mutex::new(Vec::new()));
        let s = seen.clone();
        let sub = src
            .subscribe("/etc/motd", Arc::new(move |c| s.lock().unwrap().push(c)))
            .unwrap();
        src.publish("/etc/motd", Change::Missing("gone".into()));
        assert_eq!(seen.lock().unwrap().len(), 2);
        assert_eq!(src.subscriber_count("/etc/motd"), 1);
        drop(sub);
        assert_eq!(src.subscriber_count("/etc/motd"), 0);
        assert_eq!(src.publish("/etc/motd", Change::Value("x".into())), 0);
    }

    #[test]
    fn ensure_subscribes_once_and_cleans_up_failures() {
        let bridge = WatchBridge::new();
        let uid = FieldUid { resource: ResourceId::new("file", "/tmp/a"), field: "content".into() };
        let released = Arc::new(AtomicUsize::new(0));
        let r = released.clone();
        assert!(bridge.ensure(&uid, || Ok(Subscription::new(move || { r.fetch_add(1, Ordering::SeqCst); }))).unwrap());
        assert!(!bridge.ensure(&uid, || Ok(Subscription::noop())).unwrap());
        assert_eq!(bridge.state(&uid), Some(WatchState::Pending));
        bridge.mark_active(&uid);
        assert_eq!(bridge.state(&uid), Some(WatchState::Active));
        assert!(bridge.release(&uid));
        assert_eq!(released.load(Ordering::SeqCst), 1);

        assert!(bridge.ensure(&uid, || Err(QuarryError::io("inotify limit"))).is_err());
        assert!(bridge.state(&uid).is_none());
    }
}
