//! Resource instances: identity, args, field cache, vendor payload and indexes.

use std::any::Any;
use std::fmt;
use std::sync::{Arc, Mutex, PoisonError, RwLock};

use arc_swap::ArcSwapOption;
use quarry_core::{Args, QuarryError, ResourceId, Result, Value};
use rustc_hash::FxHashMap;

use crate::cache::FieldCache;
use crate::index::CollectionIndex;
use crate::schema::Internal;

/// Observer key of one field on one resource instance.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FieldUid {
    pub resource: ResourceId,
    pub field: String,
}

impl fmt::Display for FieldUid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { write!(f, "{}.{}", self.resource, self.field) }
}

pub struct Resource {
    id: ResourceId,
    args: RwLock<Args>,
    cache: FieldCache,
    internal: RwLock<Option<Internal>>,
    field_locks: Mutex<FxHashMap<String, Arc<tokio::sync::Mutex<()>>>>,
    indexes: Mutex<FxHashMap<String, Arc<ArcSwapOption<CollectionIndex>>>>,
}

impl fmt::Debug for Resource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Resource").field("id", &self.id).field("fields", &self.cache.fields()).finish()
    }
}

impl Resource {
    pub fn new(id: ResourceId, args: Args) -> Self {
        Self {
            id,
            args: RwLock::new(args),
            cache: FieldCache::new(),
            internal: RwLock::new(None),
            field_locks: Mutex::new(FxHashMap::default()),
            indexes: Mutex::new(FxHashMap::default()),
        }
    }

    pub fn id(&self) -> &ResourceId { &self.id }
    pub fn type_name(&self) -> &str { &self.id.type_name }
    pub fn cache(&self) -> &FieldCache { &self.cache }

    pub fn field_uid(&self, field: &str) -> FieldUid { FieldUid { resource: self.id.clone(), field: field.to_string() } }

    pub fn args(&self) -> Args { self.args.read().unwrap_or_else(PoisonError::into_inner).clone() }

    pub fn arg(&self, key: &str) -> Option<Value> {
        self.args.read().unwrap_or_else(PoisonError::into_inner).get(key).cloned()
    }

    pub(crate) fn replace_args(&self, args: Args) { *self.args.write().unwrap_or_else(PoisonError::into_inner) = args; }

    /// Attach the vendor payload. The first attach wins; later ones return `false`.
    pub fn attach_internal(&self, internal: Internal) -> bool {
        let mut slot = self.internal.write().unwrap_or_else(PoisonError::into_inner);
        if slot.is_some() {
            return false;
        }
        *slot = Some(internal);
        true
    }

    pub(crate) fn replace_internal(&self, internal: Internal) {
        *self.internal.write().unwrap_or_else(PoisonError::into_inner) = Some(internal);
    }

    pub fn internal_any(&self) -> Option<Internal> { self.internal.read().unwrap_or_else(PoisonError::into_inner).clone() }

    /// Typed view of the vendor payload.
    pub fn internal<T: Any + Send + Sync>(&self) -> Option<Arc<T>> {
        self.internal_any().and_then(|any| any.downcast::<T>().ok())
    }

    /// Like [`internal`](Self::internal) but a missing payload is an error.
    pub fn require_internal<T: Any + Send + Sync>(&self) -> Result<Arc<T>> {
        self.internal::<T>()
            .ok_or_else(|| QuarryError::Internal(format!("{} has no {} payload", self.id, std::any::type_name::<T>())))
    }

    pub(crate) fn field_lock(&self, field: &str) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self.field_locks.lock().unwrap_or_else(PoisonError::into_inner);
        Arc::clone(locks.entry(field.to_string()).or_default())
    }

    /// Index named `name`, rebuilt by `build` unless the current one was
    /// built from listing `generation`. A failed build leaves the old index in place.
    pub fn collection_index<F>(&self, name: &str, generation: u64, build: F) -> Result<Arc<CollectionIndex>>
    where
        F: FnOnce() -> Result<CollectionIndex>,
    {
        let slot = {
            let mut indexes = self.indexes.lock().unwrap_or_else(PoisonError::into_inner);
            Arc::clone(indexes.entry(name.to_string()).or_insert_with(|| Arc::new(ArcSwapOption::empty())))
        };
        if let Some(current) = slot.load_full() {
            if current.generation() == generation {
                return Ok(current);
            }
        }
        let next = Arc::new(build()?);
        slot.store(Some(Arc::clone(&next)));
        Ok(next)
    }

    pub fn drop_indexes(&self) { self.indexes.lock().unwrap_or_else(PoisonError::into_inner).clear(); }
}
