//! Typed lookup indexes over a collection listing.

use std::sync::Arc;

use quarry_core::{QuarryError, Result};
use rustc_hash::FxHashMap;
use smallvec::SmallVec;

use crate::resource::Resource;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum IndexKey {
    Id(String),
    Name(String),
    NamespacedName { namespace: String, name: String },
    /// Any other equality key, e.g. `("secretName", "tls-cert")`.
    Field(String, String),
}

impl IndexKey {
    pub fn namespaced(namespace: &str, name: &str) -> Self {
        IndexKey::NamespacedName { namespace: namespace.to_string(), name: name.to_string() }
    }
}

/// Key → resources, built in one pass from a listing and never mutated after.
///
/// The index is stamped with the generation of the listing it came from;
/// owners rebuild it when the listing generation moves on.
#[derive(Default)]
pub struct CollectionIndex {
    generation: u64,
    entries: FxHashMap<IndexKey, SmallVec<[Arc<Resource>; 1]>>,
}

impl CollectionIndex {
    pub fn build<F>(generation: u64, items: &[Arc<Resource>], keys: F) -> Self
    where
        F: Fn(&Resource) -> Vec<IndexKey>,
    {
        let mut entries: FxHashMap<IndexKey, SmallVec<[Arc<Resource>; 1]>> = FxHashMap::default();
        for item in items {
            for key in keys(item) {
                entries.entry(key).or_default().push(Arc::clone(item));
            }
        }
        Self { generation, entries }
    }

    /// Like [`build`](Self::build) but the key function may fail; a failure
    /// yields no index at all.
    pub fn try_build<F>(generation: u64, items: &[Arc<Resource>], keys: F) -> Result<Self>
    where
        F: Fn(&Resource) -> Result<Vec<IndexKey>>,
    {
        let mut entries: FxHashMap<IndexKey, SmallVec<[Arc<Resource>; 1]>> = FxHashMap::default();
        for item in items {
            for key in keys(item)? {
                entries.entry(key).or_default().push(Arc::clone(item));
            }
        }
        Ok(Self { generation, entries })
    }

    pub fn generation(&self) -> u64 { self.generation }
    pub fn len(&self) -> usize { self.entries.len() }
    pub fn is_empty(&self) -> bool { self.entries.is_empty() }

    /// All matches in listing order.
    pub fn get_all(&self, key: &IndexKey) -> &[Arc<Resource>] {
        self.entries.get(key).map(|v| v.as_slice()).unwrap_or(&[])
    }

    pub fn first(&self, key: &IndexKey) -> Option<Arc<Resource>> { self.get_all(key).first().cloned() }

    /// At most one match; more than one is `Ambiguous`.
    pub fn unique(&self, key: &IndexKey) -> Result<Option<Arc<Resource>>> {
        match self.get_all(key) {
            [] => Ok(None),
            [one] => Ok(Some(Arc::clone(one))),
            many => Err(QuarryError::Ambiguous(format!("{} candidates for {key:?}", many.len()))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use quarry_core::{Args, ResourceId};

    fn res(name: &str, id: &str) -> Arc<Resource> {
        let args = Args::from([("name".to_string(), name.into())]);
        Arc::new(Resource::new(ResourceId::new("kernel.module", id), args))
    }

    fn name_of(r: &Resource) -> String { r.arg("name").and_then(|v| v.as_str().map(str::to_string)).unwrap_or_default() }

    #[test]
    fn unique_detects_duplicates_and_first_keeps_order() {
        let items = vec![res("ext4", "1"), res("xfs", "2"), res("xfs", "3")];
        let idx = CollectionIndex::build(7, &items, |r| vec![IndexKey::Name(name_of(r))]);
        assert_eq!(idx.generation(), 7);
        assert_eq!(idx.unique(&IndexKey::Name("ext4".into())).unwrap().unwrap().id().id, "1");
        assert!(matches!(idx.unique(&IndexKey::Name("xfs".into())), Err(QuarryError::Ambiguous(_))));
        assert_eq!(idx.first(&IndexKey::Name("xfs".into())).unwrap().id().id, "2");
        assert!(idx.unique(&IndexKey::Name("btrfs".into())).unwrap().is_none());
    }

    #[test]
    fn try_build_is_all_or_nothing() {
        let items = vec![res("a", "1"), res("", "2")];
        let built = CollectionIndex::try_build(1, &items, |r| {
            let n = name_of(r);
            if n.is_empty() { Err(QuarryError::Internal("unnamed".into())) } else { Ok(vec![IndexKey::Name(n)]) }
        });
        assert!(built.is_err());
    }
}
