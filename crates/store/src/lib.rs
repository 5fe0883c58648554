//! Quarry store: the resource runtime.
//!
//! One canonical [`Resource`] per identity, each with its own [`FieldCache`].
//! Fields are computed lazily and at most once per generation; watched
//! fields are kept current by a [`ChangeSource`] through the [`WatchBridge`].

#![forbid(unsafe_code)]

pub mod cache;
pub mod config;
pub mod index;
pub mod observers;
pub mod resolve;
pub mod resource;
pub mod runtime;
pub mod schema;
pub mod watch;

pub use cache::{CacheEntry, FieldCache};
pub use config::{AmbiguityPolicy, RuntimeConfig};
pub use index::{CollectionIndex, IndexKey};
pub use observers::{ObserverFn, Observers};
pub use resolve::{identity_keys, resolve_identity, resolve_reference, resolve_references, Lookup};
pub use resource::{FieldUid, Resource};
pub use runtime::{Collection, Runtime, UpdateFn};
pub use schema::{
    FieldClass, FieldKind, InitOutcome, Internal, InternalCodec, JsonCodec, Registry, ResourceSchema,
};
pub use watch::{Change, ChangeSink, ChangeSource, ChannelSource, Subscription, WatchBridge, WatchState, WatchTarget};

/// Build a list value of resource references.
pub fn resource_list<'a>(items: impl IntoIterator<Item = &'a std::sync::Arc<Resource>>) -> quarry_core::Value {
    quarry_core::Value::Array(items.into_iter().map(|r| quarry_core::Value::Resource(r.id().clone())).collect())
}
