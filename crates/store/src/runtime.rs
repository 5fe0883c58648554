//! The resource runtime: find-or-construct, lazy field computation and watches.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock, Weak};
use std::time::Instant;

use metrics::{counter, histogram};
use quarry_core::{AmbientIdentity, Args, QuarryError, ResourceId, Result, Value};
use rustc_hash::FxHashMap;
use tracing::{debug, trace, warn};

use crate::cache::CacheEntry;
use crate::config::RuntimeConfig;
use crate::observers::{ObserverFn, Observers};
use crate::resource::Resource;
use crate::schema::{FieldClass, FieldKind, InitOutcome, Internal, Registry, ResourceSchema, WatchFn};
use crate::watch::{Change, ChangeSink, WatchBridge};

/// Delivered by [`Runtime::watch_and_update`] for the current and every later value.
pub type UpdateFn = Arc<dyn Fn(Result<Value>) + Send + Sync>;

struct Inner {
    registry: Registry,
    config: RuntimeConfig,
    ambient: Option<AmbientIdentity>,
    resources: RwLock<FxHashMap<ResourceId, Arc<Resource>>>,
    observers: Observers,
    watches: WatchBridge,
}

/// A resolved listing field: its members plus the generation of the listing.
#[derive(Debug, Clone)]
pub struct Collection {
    pub items: Vec<Arc<Resource>>,
    pub generation: u64,
}

/// Cheap to clone; all clones share one registry of canonical instances.
#[derive(Clone)]
pub struct Runtime {
    inner: Arc<Inner>,
}

impl Runtime {
    pub fn new(registry: Registry, config: RuntimeConfig) -> Self { Self::for_target(registry, config, None) }

    /// Runtime scanning one asset, whose identity is used when a keyed
    /// resource is requested without any key.
    pub fn for_target(registry: Registry, config: RuntimeConfig, ambient: Option<AmbientIdentity>) -> Self {
        Self {
            inner: Arc::new(Inner {
                registry,
                config,
                ambient,
                resources: RwLock::new(FxHashMap::default()),
                observers: Observers::new(),
                watches: WatchBridge::new(),
            }),
        }
    }

    pub fn registry(&self) -> &Registry { &self.inner.registry }
    pub fn config(&self) -> &RuntimeConfig { &self.inner.config }
    pub fn ambient(&self) -> Option<&AmbientIdentity> { self.inner.ambient.as_ref() }
    pub fn observers(&self) -> &Observers { &self.inner.observers }
    pub fn watches(&self) -> &WatchBridge { &self.inner.watches }

    fn downgrade(&self) -> Weak<Inner> { Arc::downgrade(&self.inner) }

    fn upgrade(weak: &Weak<Inner>) -> Option<Self> { weak.upgrade().map(|inner| Self { inner }) }

    pub async fn create_resource(&self, type_name: &str, args: Args) -> Result<Arc<Resource>> {
        self.create_resource_with(type_name, args, None).await
    }

    /// Find or construct the canonical instance of `type_name` for `args`.
    ///
    /// `internal` is attached before the instance becomes visible to other
    /// callers; an already existing instance keeps its payload.
    pub async fn create_resource_with(&self, type_name: &str, args: Args, internal: Option<Internal>) -> Result<Arc<Resource>> {
        let schema = self.inner.registry.schema(type_name)?;
        let args = match schema.init_fn() {
            Some(init) => match init(self.clone(), args).await? {
                InitOutcome::Existing(res) => return Ok(res),
                InitOutcome::Construct(args) => args,
            },
            None => args,
        };
        let id = ResourceId::new(schema.name.clone(), schema.identity_of(&args)?);
        if let Some(existing) = self.get_resource(&id) {
            if let Some(internal) = internal {
                existing.attach_internal(internal);
            }
            return Ok(existing);
        }
        Ok(self.insert(&schema, id, args, internal))
    }

    /// Find or construct the instance for a complete set of constructor args.
    /// An existing instance built from different args is refreshed with the
    /// new args and payload. Init hooks do not run.
    ///
    /// Returns the instance and whether it was refreshed.
    pub fn upsert_resource(&self, type_name: &str, args: Args, internal: Option<Internal>) -> Result<(Arc<Resource>, bool)> {
        let schema = self.inner.registry.schema(type_name)?;
        let id = ResourceId::new(schema.name.clone(), schema.identity_of(&args)?);
        let res = match self.get_resource(&id) {
            Some(existing) => existing,
            None => self.insert(&schema, id, args.clone(), internal.clone()),
        };
        if res.args() == args {
            if let Some(internal) = internal {
                res.attach_internal(internal);
            }
            return Ok((res, false));
        }
        counter!("resources_refreshed_total", 1, "resource" => schema.name.clone());
        self.refresh_resource(&res, args, internal)?;
        Ok((res, true))
    }

    /// Publish a new instance unless another caller won the race for `id`.
    fn insert(&self, schema: &ResourceSchema, id: ResourceId, args: Args, internal: Option<Internal>) -> Arc<Resource> {
        let fresh = Arc::new(Resource::new(id.clone(), args.clone()));
        seed_args(schema, &fresh, &args);
        if let Some(internal) = internal {
            fresh.attach_internal(internal);
        }

        let mut resources = self.inner.resources.write().unwrap_or_else(PoisonError::into_inner);
        let canonical = Arc::clone(resources.entry(id).or_insert_with(|| Arc::clone(&fresh)));
        drop(resources);
        if Arc::ptr_eq(&canonical, &fresh) {
            counter!("resources_created_total", 1, "resource" => schema.name.clone());
            debug!(resource = %canonical.id(), "resource created");
        }
        canonical
    }

    pub fn get_resource(&self, id: &ResourceId) -> Option<Arc<Resource>> {
        self.inner.resources.read().unwrap_or_else(PoisonError::into_inner).get(id).cloned()
    }

    /// Look up a nested resource reference held in a field value.
    pub fn resolve(&self, id: &ResourceId) -> Result<Arc<Resource>> {
        self.get_resource(id).ok_or_else(|| QuarryError::not_found(id))
    }

    pub fn resources(&self) -> Vec<Arc<Resource>> {
        let resources = self.inner.resources.read().unwrap_or_else(PoisonError::into_inner);
        let mut out: Vec<Arc<Resource>> = resources.values().cloned().collect();
        out.sort_by(|a, b| a.id().cmp(b.id()));
        out
    }

    /// Forget an instance and release its watches. Holders of the `Arc` keep a
    /// detached copy.
    pub fn unregister(&self, id: &ResourceId) -> bool {
        let removed = self.inner.resources.write().unwrap_or_else(PoisonError::into_inner).remove(id);
        let Some(res) = removed else { return false };
        let released = self.inner.watches.release_resource(id);
        if let Ok(schema) = self.inner.registry.schema(&id.type_name) {
            for field in schema.field_names() {
                self.inner.observers.forget(&res.field_uid(field));
            }
        }
        debug!(resource = %id, released, "resource unregistered");
        true
    }

    /// Value of `field`, computing it if needed. Watched fields are awaited
    /// until their source reports, bounded by `ready_wait`.
    pub async fn field(&self, res: &Arc<Resource>, field: &str) -> Result<Value> {
        let schema = self.inner.registry.schema(res.type_name())?;
        match schema.field_kind(field)?.clone() {
            FieldKind::Watched(target) => self.await_watched(res, field, &target).await,
            kind => self.compute(res, field, &kind).await,
        }
    }

    /// Like [`field`](Self::field) but a watched field that has not reported
    /// yet yields `NotReady` instead of waiting.
    pub async fn try_field(&self, res: &Arc<Resource>, field: &str) -> Result<Value> {
        let schema = self.inner.registry.schema(res.type_name())?;
        match schema.field_kind(field)?.clone() {
            FieldKind::Watched(target) => self.try_watched(res, field, &target),
            kind => self.compute(res, field, &kind).await,
        }
    }

    /// Members of a listing field on `parent`.
    pub async fn collection(&self, parent: &Arc<Resource>, field: &str) -> Result<Collection> {
        let listing = self.field(parent, field).await?;
        let generation = parent.cache().load(field).map(|e| e.generation).unwrap_or(0);
        let Value::Array(members) = listing else {
            return Err(QuarryError::Internal(format!("{}.{field} is not a list", parent.id())));
        };
        let mut items = Vec::with_capacity(members.len());
        for member in &members {
            match member.as_resource().and_then(|id| self.get_resource(id)) {
                Some(res) => items.push(res),
                None => debug!(parent = %parent.id(), field, ?member, "listing member is not a live resource"),
            }
        }
        Ok(Collection { items, generation })
    }

    /// Mark a field stale; the next read recomputes it.
    pub fn invalidate(&self, res: &Resource, field: &str) -> bool {
        let stale = res.cache().invalidate(field);
        trace!(resource = %res.id(), field, stale, "invalidate");
        stale
    }

    /// Invalidate and recompute a field, notifying its observers.
    pub async fn refresh_field(&self, res: &Arc<Resource>, field: &str) -> Result<Value> {
        self.invalidate(res, field);
        self.try_field(res, field).await
    }

    /// Replace the args and payload of a live instance after its vendor object
    /// changed. Arg fields are re-seeded, everything else goes stale.
    pub fn refresh_resource(&self, res: &Arc<Resource>, args: Args, internal: Option<Internal>) -> Result<()> {
        let schema = self.inner.registry.schema(res.type_name())?;
        if let Some(internal) = internal {
            res.replace_internal(internal);
        }
        let seeded: Vec<&str> = args.keys().map(String::as_str).filter(|k| schema.has_field(k)).collect();
        for key in &seeded {
            if let Some(v) = args.get(*key) {
                if res.cache().store_if_changed(key, CacheEntry::value(v.clone())).is_some() {
                    self.inner.observers.trigger(&res.field_uid(key));
                }
            }
        }
        let stale = res.cache().invalidate_all_except(&seeded);
        res.drop_indexes();
        res.replace_args(args);
        debug!(resource = %res.id(), stale, "resource refreshed");
        Ok(())
    }

    /// Notify observers of `field`, computing it first if it never was.
    pub async fn trigger(&self, res: &Arc<Resource>, field: &str) -> Result<()> {
        match res.cache().load(field) {
            Some(e) if e.valid => {
                self.inner.observers.trigger(&res.field_uid(field));
                Ok(())
            }
            Some(_) => Err(QuarryError::NotReady),
            None => match self.try_field(res, field).await {
                Err(e) if !e.is_cacheable() => Err(e),
                _ => Ok(()),
            },
        }
    }

    /// Deliver the current and every future value of `field` to `callback`
    /// until `watcher` unwatches. Each stored generation is delivered once.
    pub async fn watch_and_update(&self, res: &Arc<Resource>, field: &str, watcher: &str, callback: UpdateFn) -> Result<()> {
        let schema = self.inner.registry.schema(res.type_name())?;
        schema.field_kind(field)?;
        let uid = res.field_uid(field);

        let weak_res = Arc::downgrade(res);
        let field_name = field.to_string();
        let delivered = Arc::new(AtomicU64::new(0));
        let process: ObserverFn = Arc::new(move || {
            let Some(res) = weak_res.upgrade() else { return };
            let Some(entry) = res.cache().load(&field_name) else { return };
            if !entry.valid || delivered.swap(entry.generation, Ordering::SeqCst) == entry.generation {
                return;
            }
            callback(entry.into_result());
        });

        let (is_initial, exists) = self.inner.observers.watch(&uid, watcher, Arc::clone(&process));
        trace!(field = %uid, watcher, is_initial, exists, "watch and update");
        if exists {
            return Ok(());
        }
        match self.try_field(res, field).await {
            Err(e) if e.is_not_ready() => Ok(()),
            Err(e) if !e.is_cacheable() => {
                self.inner.observers.unwatch(&uid, watcher);
                Err(e)
            }
            _ => {
                process();
                Ok(())
            }
        }
    }

    pub fn unwatch(&self, res: &Resource, field: &str, watcher: &str) {
        self.inner.observers.unwatch(&res.field_uid(field), watcher);
    }

    /// Drop every registration of `watcher`.
    pub fn unregister_watcher(&self, watcher: &str) { self.inner.observers.unwatch_all(watcher); }

    fn cached(&self, res: &Resource, field: &str, class: FieldClass) -> Option<Result<Value>> {
        let entry = res.cache().load(field)?;
        if !self.is_fresh(&entry, class) {
            return None;
        }
        counter!("field_cache_hits_total", 1);
        Some(entry.into_result())
    }

    fn is_fresh(&self, entry: &CacheEntry, class: FieldClass) -> bool {
        if !entry.valid {
            return false;
        }
        match &entry.error {
            Some(err) => match self.inner.config.error_ttl(class, err) {
                Some(ttl) => entry.age() < ttl,
                None => true,
            },
            None => true,
        }
    }

    async fn compute(&self, res: &Arc<Resource>, field: &str, kind: &FieldKind) -> Result<Value> {
        let class = kind.class();
        if let Some(hit) = self.cached(res, field, class) {
            return hit;
        }
        let compute = match kind {
            FieldKind::Computed { compute, .. } => Arc::clone(compute),
            // not supplied at construction
            FieldKind::Arg => return Ok(Value::Null),
            FieldKind::Watched(_) => return Err(QuarryError::Internal(format!("{field} is watched"))),
        };

        let lock = res.field_lock(field);
        let _guard = lock.lock().await;
        if let Some(hit) = self.cached(res, field, class) {
            return hit;
        }

        let timeout = self.inner.config.compute_timeout;
        let started = Instant::now();
        let outcome = match tokio::time::timeout(timeout, compute(self.clone(), Arc::clone(res))).await {
            Ok(outcome) => outcome,
            Err(_) => {
                warn!(resource = %res.id(), field, timeout_ms = timeout.as_millis() as u64, "field computation timed out");
                Err(QuarryError::Timeout { field: field.to_string(), after_ms: timeout.as_millis() as u64 })
            }
        };
        let ms = started.elapsed().as_secs_f64() * 1000.0;
        counter!("field_compute_total", 1, "resource" => res.type_name().to_string());
        histogram!("field_compute_ms", ms);

        match &outcome {
            Err(err) if !err.is_cacheable() => {
                debug!(resource = %res.id(), field, error = %err, "field error not cached");
            }
            _ => {
                let generation = res.cache().store(field, CacheEntry::from_result(outcome.clone()));
                trace!(resource = %res.id(), field, generation, ok = outcome.is_ok(), took_ms = ms, "field computed");
                self.inner.observers.trigger(&res.field_uid(field));
            }
        }
        outcome
    }

    fn try_watched(&self, res: &Arc<Resource>, field: &str, target: &WatchFn) -> Result<Value> {
        if let Some(hit) = self.cached_watched(res, field) {
            return hit;
        }
        self.start_watch(res, field, target)?;
        self.cached_watched(res, field).unwrap_or(Err(QuarryError::NotReady))
    }

    /// A watched entry with a live subscription never expires; the source keeps
    /// it current. Without one (subscribing failed) the transient TTL applies.
    fn cached_watched(&self, res: &Resource, field: &str) -> Option<Result<Value>> {
        let entry = res.cache().load(field)?;
        let subscribed = self.inner.watches.state(&res.field_uid(field)).is_some();
        if !entry.valid || (!subscribed && !self.is_fresh(&entry, FieldClass::Transient)) {
            return None;
        }
        counter!("field_cache_hits_total", 1);
        Some(entry.into_result())
    }

    async fn await_watched(&self, res: &Arc<Resource>, field: &str, target: &WatchFn) -> Result<Value> {
        // subscribe before the first check so no write is missed
        let mut changed = res.cache().subscribe();
        let wait = self.inner.config.ready_wait;
        let waited = tokio::time::timeout(wait, async {
            loop {
                match self.try_watched(res, field, target) {
                    Err(e) if e.is_not_ready() => {}
                    other => return other,
                }
                if changed.changed().await.is_err() {
                    return Err(QuarryError::NotReady);
                }
            }
        })
        .await;
        waited.unwrap_or_else(|_| Err(QuarryError::Timeout { field: field.to_string(), after_ms: wait.as_millis() as u64 }))
    }

    fn start_watch(&self, res: &Arc<Resource>, field: &str, target: &WatchFn) -> Result<()> {
        let uid = res.field_uid(field);
        if res.cache().load(field).is_some() {
            // stale or expired: resubscribe so the source replays its current state.
            // The old entry stays so an unchanged replay is not a new generation.
            self.inner.watches.release(&uid);
        }

        let weak_rt = self.downgrade();
        let weak_res = Arc::downgrade(res);
        let field_name = field.to_string();
        let subscribed = self.inner.watches.ensure(&uid, || {
            let watch_target = target(self, res)?;
            let sink: ChangeSink = Arc::new(move |change: Change| {
                if let (Some(rt), Some(res)) = (Runtime::upgrade(&weak_rt), weak_res.upgrade()) {
                    rt.apply_change(&res, &field_name, change);
                }
            });
            debug!(resource = %res.id(), field, key = %watch_target.key, "watching");
            watch_target.source.subscribe(&watch_target.key, sink)
        });

        match subscribed {
            Ok(true) => {
                // replaces the hook of an earlier subscription
                let weak_rt = self.downgrade();
                let weak_res = Arc::downgrade(res);
                let field_name = field.to_string();
                self.inner.observers.on_unwatch(&uid, move || {
                    if let (Some(rt), Some(res)) = (Runtime::upgrade(&weak_rt), weak_res.upgrade()) {
                        rt.inner.watches.release(&res.field_uid(&field_name));
                        res.cache().delete(&field_name);
                        debug!(resource = %res.id(), field = %field_name, "unwatched");
                    }
                });
                Ok(())
            }
            Ok(false) => Ok(()),
            Err(err) if err.is_cacheable() => {
                // subscribing failed: keep the failure as the field's value
                if res.cache().revalidate_or_store(field, CacheEntry::error(err)).is_some() {
                    self.inner.observers.trigger(&uid);
                }
                Ok(())
            }
            Err(err) => Err(err),
        }
    }

    fn apply_change(&self, res: &Arc<Resource>, field: &str, change: Change) {
        let uid = res.field_uid(field);
        counter!("watch_events_total", 1);
        self.inner.watches.mark_active(&uid);
        match res.cache().revalidate_or_store(field, change.into_entry()) {
            Some(generation) => {
                debug!(resource = %res.id(), field, generation, "watched field changed");
                self.inner.observers.trigger(&uid);
            }
            None => {
                counter!("watch_suppressed_total", 1);
                trace!(resource = %res.id(), field, "watched field unchanged");
            }
        }
    }
}

fn seed_args(schema: &ResourceSchema, res: &Resource, args: &Args) {
    for (key, value) in args {
        if schema.has_field(key) {
            res.cache().store(key, CacheEntry::value(value.clone()));
        }
    }
}
