//! Identity resolution for keyed resources and bounded cross-resource lookups.

use std::sync::Arc;

use quarry_core::{arg_nonempty, arg_str, Args, QuarryError, Result};
use tracing::debug;

use crate::config::AmbiguityPolicy;
use crate::index::{CollectionIndex, IndexKey};
use crate::resource::Resource;
use crate::runtime::Runtime;
use crate::schema::InitOutcome;

/// Where the candidates of a keyed resource type are listed.
#[derive(Debug, Clone, Copy)]
pub struct Lookup<'a> {
    /// Type of the singleton owning the listing, e.g. `k8s`.
    pub root: &'a str,
    /// Listing field on the root, e.g. `pods`.
    pub listing: &'a str,
    pub namespaced: bool,
}

impl<'a> Lookup<'a> {
    pub const fn namespaced(root: &'a str, listing: &'a str) -> Self { Self { root, listing, namespaced: true } }
    pub const fn cluster(root: &'a str, listing: &'a str) -> Self { Self { root, listing, namespaced: false } }

    /// Args beyond this count mean the caller already has the full object.
    pub fn pass_through_above(&self) -> usize { if self.namespaced { 2 } else { 1 } }

    fn index_name(&self) -> String { format!("{}:identity", self.listing) }
}

/// Keys under which an instance can be found by [`resolve_identity`].
pub fn identity_keys(res: &Resource, namespaced: bool) -> Vec<IndexKey> {
    let mut keys = vec![IndexKey::Id(res.id().id.clone())];
    let name = res.arg("name").and_then(|v| v.as_str().map(str::to_string));
    if let Some(name) = name {
        if namespaced {
            let namespace = res.arg("namespace").and_then(|v| v.as_str().map(str::to_string)).unwrap_or_default();
            keys.push(IndexKey::NamespacedName { namespace, name });
        } else {
            keys.push(IndexKey::Name(name));
        }
    }
    keys
}

/// `init` hook body for keyed resources: find the canonical instance in the
/// root's listing, or pass the args through when they already describe one.
///
/// The key is `id`, else `name` (+`namespace`), else the runtime's ambient
/// identity. Matching is exact.
pub async fn resolve_identity(rt: &Runtime, lookup: &Lookup<'_>, args: Args) -> Result<InitOutcome> {
    if args.len() > lookup.pass_through_above() {
        return Ok(InitOutcome::Construct(args));
    }
    let key = lookup_key(rt, lookup, &args)?;

    let root = rt.create_resource(lookup.root, Args::new()).await?;
    let listing = rt.collection(&root, lookup.listing).await?;
    let index = root.collection_index(&lookup.index_name(), listing.generation, || {
        Ok(CollectionIndex::build(listing.generation, &listing.items, |r| identity_keys(r, lookup.namespaced)))
    })?;
    let found = match rt.config().ambiguity {
        AmbiguityPolicy::FirstMatch => index.first(&key),
        AmbiguityPolicy::Reject => index.unique(&key)?,
    };
    match found {
        Some(res) => Ok(InitOutcome::Existing(res)),
        None => {
            debug!(listing = lookup.listing, ?key, "no matching resource");
            Err(QuarryError::not_found(format!("{} with {}", lookup.listing, describe(&key))))
        }
    }
}

fn lookup_key(rt: &Runtime, lookup: &Lookup<'_>, args: &Args) -> Result<IndexKey> {
    if let Some(id) = arg_nonempty(args, "id")? {
        return Ok(IndexKey::Id(id.to_string()));
    }
    let (name, namespace) = match arg_nonempty(args, "name")? {
        Some(name) => (name.to_string(), arg_str(args, "namespace")?.unwrap_or_default().to_string()),
        None => match rt.ambient() {
            Some(amb) => (amb.name.clone(), amb.namespace.clone()),
            None => return Err(QuarryError::misconfigured("cannot use resource without specifying id or name[/namespace]")),
        },
    };
    Ok(if lookup.namespaced { IndexKey::NamespacedName { namespace, name } } else { IndexKey::Name(name) })
}

fn describe(key: &IndexKey) -> String {
    match key {
        IndexKey::Id(id) => format!("id '{id}'"),
        IndexKey::Name(name) => format!("name '{name}'"),
        IndexKey::NamespacedName { namespace, name } => format!("name '{namespace}/{name}'"),
        IndexKey::Field(field, value) => format!("{field} '{value}'"),
    }
}

/// One bounded lookup through `owner`'s listing field. A listing that is not
/// found degrades to `None`.
pub async fn resolve_reference<F>(
    rt: &Runtime,
    owner: &Arc<Resource>,
    listing: &str,
    index: &str,
    key: &IndexKey,
    keys: F,
) -> Result<Option<Arc<Resource>>>
where
    F: Fn(&Resource) -> Vec<IndexKey> + Send,
{
    let matches = resolve_references(rt, owner, listing, index, key, keys).await?;
    match rt.config().ambiguity {
        AmbiguityPolicy::Reject if matches.len() > 1 => {
            Err(QuarryError::Ambiguous(format!("{} {listing} match {}", matches.len(), describe(key))))
        }
        _ => Ok(matches.into_iter().next()),
    }
}

/// Every member of `owner`'s listing matching `key`, in listing order.
pub async fn resolve_references<F>(
    rt: &Runtime,
    owner: &Arc<Resource>,
    listing: &str,
    index: &str,
    key: &IndexKey,
    keys: F,
) -> Result<Vec<Arc<Resource>>>
where
    F: Fn(&Resource) -> Vec<IndexKey> + Send,
{
    let collection = match rt.collection(owner, listing).await {
        Ok(c) => c,
        Err(e) if e.is_not_found() => return Ok(Vec::new()),
        Err(e) => return Err(e),
    };
    let index = owner.collection_index(index, collection.generation, || {
        Ok(CollectionIndex::build(collection.generation, &collection.items, keys))
    })?;
    Ok(index.get_all(key).to_vec())
}
