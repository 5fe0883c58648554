//! Resource type schemas and the type registry.

use std::any::Any;
use std::future::Future;
use std::marker::PhantomData;
use std::sync::Arc;

use futures::future::BoxFuture;
use futures::FutureExt;
use quarry_core::{Args, QuarryError, Result, Value};
use rustc_hash::FxHashMap;
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::resource::Resource;
use crate::runtime::Runtime;
use crate::watch::WatchTarget;

pub type Internal = Arc<dyn Any + Send + Sync>;
pub type ComputeFn = Arc<dyn Fn(Runtime, Arc<Resource>) -> BoxFuture<'static, Result<Value>> + Send + Sync>;
pub type WatchFn = Arc<dyn Fn(&Runtime, &Arc<Resource>) -> Result<WatchTarget> + Send + Sync>;
pub type InitFn = Arc<dyn Fn(Runtime, Args) -> BoxFuture<'static, Result<InitOutcome>> + Send + Sync>;
pub type IdentityFn = Arc<dyn Fn(&Args) -> Result<String> + Send + Sync>;

/// Error lifetime class of a computed field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldClass {
    /// Derived from data that only changes on invalidation.
    Static,
    /// Backed by a live call whose failures are worth retrying.
    Transient,
}

#[derive(Clone)]
pub enum FieldKind {
    /// Only ever seeded from constructor args.
    Arg,
    Computed { class: FieldClass, compute: ComputeFn },
    /// Kept current by a change source.
    Watched(WatchFn),
}

impl FieldKind {
    pub fn class(&self) -> FieldClass {
        match self {
            FieldKind::Computed { class, .. } => *class,
            FieldKind::Arg => FieldClass::Static,
            FieldKind::Watched(_) => FieldClass::Transient,
        }
    }
}

/// Result of a type's `init` hook.
pub enum InitOutcome {
    /// Build a new instance from these (possibly rewritten) args.
    Construct(Args),
    /// Hand back an instance that already exists.
    Existing(Arc<Resource>),
}

/// Converts an internal payload to bytes and back, for archiving.
pub trait InternalCodec: Send + Sync {
    fn encode(&self, internal: &(dyn Any + Send + Sync)) -> Result<Vec<u8>>;
    fn decode(&self, bytes: &[u8]) -> Result<Internal>;
}

/// JSON codec for any serde payload type.
pub struct JsonCodec<T>(PhantomData<fn() -> T>);

impl<T> JsonCodec<T> {
    pub fn new() -> Self { Self(PhantomData) }
}

impl<T> Default for JsonCodec<T> {
    fn default() -> Self { Self::new() }
}

impl<T> InternalCodec for JsonCodec<T>
where
    T: Serialize + DeserializeOwned + Send + Sync + 'static,
{
    fn encode(&self, internal: &(dyn Any + Send + Sync)) -> Result<Vec<u8>> {
        let typed = internal
            .downcast_ref::<T>()
            .ok_or_else(|| QuarryError::Internal(format!("payload is not a {}", std::any::type_name::<T>())))?;
        Ok(serde_json::to_vec(typed)?)
    }

    fn decode(&self, bytes: &[u8]) -> Result<Internal> {
        let typed: T = serde_json::from_slice(bytes)?;
        Ok(Arc::new(typed))
    }
}

/// Declaration of one resource type.
#[derive(Clone)]
pub struct ResourceSchema {
    pub name: String,
    fields: FxHashMap<String, FieldKind>,
    init: Option<InitFn>,
    identity: IdentityFn,
    codec: Option<Arc<dyn InternalCodec>>,
}

impl ResourceSchema {
    /// A type whose identity is the `id` arg, or the empty id for singletons.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            fields: FxHashMap::default(),
            init: None,
            identity: Arc::new(|args: &Args| Ok(quarry_core::arg_str(args, "id")?.unwrap_or_default().to_string())),
            codec: None,
        }
    }

    pub fn arg_field(mut self, name: &str) -> Self {
        self.fields.insert(name.to_string(), FieldKind::Arg);
        self
    }

    pub fn field<F, Fut>(mut self, name: &str, class: FieldClass, compute: F) -> Self
    where
        F: Fn(Runtime, Arc<Resource>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value>> + Send + 'static,
    {
        let compute: ComputeFn = Arc::new(move |rt, res| compute(rt, res).boxed());
        self.fields.insert(name.to_string(), FieldKind::Computed { class, compute });
        self
    }

    pub fn watched<F>(mut self, name: &str, target: F) -> Self
    where
        F: Fn(&Runtime, &Arc<Resource>) -> Result<WatchTarget> + Send + Sync + 'static,
    {
        self.fields.insert(name.to_string(), FieldKind::Watched(Arc::new(target)));
        self
    }

    pub fn init<F, Fut>(mut self, init: F) -> Self
    where
        F: Fn(Runtime, Args) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<InitOutcome>> + Send + 'static,
    {
        self.init = Some(Arc::new(move |rt, args| init(rt, args).boxed()));
        self
    }

    pub fn identity<F>(mut self, identity: F) -> Self
    where
        F: Fn(&Args) -> Result<String> + Send + Sync + 'static,
    {
        self.identity = Arc::new(identity);
        self
    }

    pub fn codec(mut self, codec: impl InternalCodec + 'static) -> Self {
        self.codec = Some(Arc::new(codec));
        self
    }

    pub fn field_kind(&self, field: &str) -> Result<&FieldKind> {
        self.fields
            .get(field)
            .ok_or_else(|| QuarryError::UnknownField { resource: self.name.clone(), field: field.to_string() })
    }

    pub fn has_field(&self, field: &str) -> bool { self.fields.contains_key(field) }

    pub fn field_names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.fields.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    pub fn init_fn(&self) -> Option<&InitFn> { self.init.as_ref() }
    pub fn identity_of(&self, args: &Args) -> Result<String> { (self.identity)(args) }
    pub fn internal_codec(&self) -> Option<&Arc<dyn InternalCodec>> { self.codec.as_ref() }
}

/// Type name → schema, with aliases.
#[derive(Clone, Default)]
pub struct Registry {
    schemas: FxHashMap<String, Arc<ResourceSchema>>,
    aliases: FxHashMap<String, String>,
}

impl Registry {
    pub fn new() -> Self { Self::default() }

    pub fn register(&mut self, schema: ResourceSchema) -> &mut Self {
        self.schemas.insert(schema.name.clone(), Arc::new(schema));
        self
    }

    pub fn alias(&mut self, alias: &str, target: &str) -> &mut Self {
        self.aliases.insert(alias.to_string(), target.to_string());
        self
    }

    /// Resolve a type name through any chain of aliases.
    pub fn schema(&self, name: &str) -> Result<Arc<ResourceSchema>> {
        let mut current = name;
        for _ in 0..=self.aliases.len() {
            if let Some(schema) = self.schemas.get(current) {
                return Ok(Arc::clone(schema));
            }
            match self.aliases.get(current) {
                Some(next) => current = next,
                None => break,
            }
        }
        Err(QuarryError::UnknownResource(name.to_string()))
    }

    pub fn type_names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.schemas.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }
}
