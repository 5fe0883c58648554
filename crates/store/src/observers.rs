//! Observer hub: watchers subscribe to field uids and get called on trigger.

use std::sync::{Arc, Mutex, PoisonError};

use rustc_hash::{FxHashMap, FxHashSet};
use tracing::trace;

use crate::resource::FieldUid;

pub type ObserverFn = Arc<dyn Fn() + Send + Sync>;
type UnwatchHook = Box<dyn FnOnce() + Send>;

#[derive(Default)]
struct Inner {
    by_field: FxHashMap<FieldUid, FxHashMap<String, ObserverFn>>,
    by_watcher: FxHashMap<String, FxHashSet<FieldUid>>,
    on_unwatch: FxHashMap<FieldUid, UnwatchHook>,
}

#[derive(Default)]
pub struct Observers {
    inner: Mutex<Inner>,
}

impl Observers {
    pub fn new() -> Self { Self::default() }

    /// Register `watcher` on `field`.
    ///
    /// Returns `(is_initial, exists)`: whether this is the first watcher of the
    /// field, and whether this watcher was already registered (its callback
    /// is replaced).
    pub fn watch(&self, field: &FieldUid, watcher: &str, cb: ObserverFn) -> (bool, bool) {
        let mut inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        let watchers = inner.by_field.entry(field.clone()).or_default();
        let is_initial = watchers.is_empty();
        let exists = watchers.insert(watcher.to_string(), cb).is_some();
        inner.by_watcher.entry(watcher.to_string()).or_default().insert(field.clone());
        trace!(field = %field, watcher, is_initial, exists, "observers watch");
        (is_initial, exists)
    }

    /// Call every watcher of `field`. Returns how many were called.
    pub fn trigger(&self, field: &FieldUid) -> usize {
        // callbacks run without the lock so they may re-enter the hub
        let callbacks: Vec<ObserverFn> = {
            let inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
            inner.by_field.get(field).map(|w| w.values().cloned().collect()).unwrap_or_default()
        };
        for cb in &callbacks {
            cb();
        }
        callbacks.len()
    }

    /// Run `hook` once the last watcher leaves `field`. A field has at most
    /// one hook; a later registration replaces the earlier one.
    pub fn on_unwatch(&self, field: &FieldUid, hook: impl FnOnce() + Send + 'static) {
        let mut inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        inner.on_unwatch.insert(field.clone(), Box::new(hook));
    }

    pub fn has_unwatch_hook(&self, field: &FieldUid) -> bool {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner).on_unwatch.contains_key(field)
    }

    pub fn unwatch(&self, field: &FieldUid, watcher: &str) {
        let hooks = {
            let mut inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
            if let Some(fields) = inner.by_watcher.get_mut(watcher) {
                fields.remove(field);
                if fields.is_empty() {
                    inner.by_watcher.remove(watcher);
                }
            }
            Self::detach(&mut inner, field, watcher)
        };
        for hook in hooks {
            hook();
        }
    }

    /// Drop every registration of `watcher`.
    pub fn unwatch_all(&self, watcher: &str) {
        let hooks = {
            let mut inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
            let fields = inner.by_watcher.remove(watcher).unwrap_or_default();
            let mut hooks = Vec::new();
            for field in fields {
                hooks.extend(Self::detach(&mut inner, &field, watcher));
            }
            hooks
        };
        for hook in hooks {
            hook();
        }
    }

    pub fn watcher_count(&self, field: &FieldUid) -> usize {
        let inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        inner.by_field.get(field).map(|w| w.len()).unwrap_or(0)
    }

    /// Forget a field entirely, without running its unwatch hooks.
    pub(crate) fn forget(&self, field: &FieldUid) {
        let mut inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(watchers) = inner.by_field.remove(field) {
            for watcher in watchers.keys() {
                if let Some(fields) = inner.by_watcher.get_mut(watcher) {
                    fields.remove(field);
                }
            }
        }
        inner.on_unwatch.remove(field);
    }

    fn detach(inner: &mut Inner, field: &FieldUid, watcher: &str) -> Option<UnwatchHook> {
        let watchers = inner.by_field.get_mut(field)?;
        if watchers.remove(watcher).is_none() || !watchers.is_empty() {
            return None;
        }
        inner.by_field.remove(field);
        inner.on_unwatch.remove(field)
    }
}
