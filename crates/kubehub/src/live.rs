//! Keep resources of a live cluster current from kube watch events.

use std::collections::HashSet;
use std::sync::Arc;

use anyhow::Result;
use futures::TryStreamExt;
use kube::runtime::watcher::{self, Event};
use metrics::counter;
use quarry_core::{Args, ResourceId};
use quarry_store::Runtime;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::cluster::refresh_children;
use crate::objects::{materialize, meta_str};
use crate::source::{raw_object, LiveSource};
use crate::{obj_id, K8sKind, ROOT};

/// One watch observation, already converted to raw JSON.
#[derive(Debug, Clone)]
pub enum LiveEvent {
    Applied(serde_json::Value),
    Deleted(serde_json::Value),
    /// The watch re-listed: the full current set of objects of the kind.
    Restarted(Vec<serde_json::Value>),
}

fn object_id(kind: K8sKind, raw: &serde_json::Value) -> ResourceId {
    ResourceId::new(kind.type_name(), obj_id(kind.kind(), meta_str(raw, "namespace"), meta_str(raw, "name")))
}

/// Bring one object's instance up to date; returns whether it was known.
async fn apply_object(rt: &Runtime, kind: K8sKind, raw: &serde_json::Value) -> quarry_core::Result<(ResourceId, bool)> {
    let id = object_id(kind, raw);
    let known = rt.get_resource(&id).is_some();
    let (args, internal) = materialize(kind, raw)?;
    let (res, refreshed) = rt.upsert_resource(kind.type_name(), args, Some(internal))?;
    if refreshed {
        refresh_children(rt, &res, kind).await;
    }
    Ok((res.id().clone(), known))
}

/// Apply one event. Known objects are refreshed in place together with the
/// nested resources built from them. Membership changes invalidate the root
/// listing so the next read re-lists.
pub async fn apply_event(rt: &Runtime, kind: K8sKind, event: LiveEvent) -> quarry_core::Result<()> {
    counter!("watch_events_total", 1, "source" => "k8s", "kind" => kind.kind());
    let root = rt.create_resource(ROOT, Args::new()).await?;
    match event {
        LiveEvent::Applied(raw) => {
            let (_, known) = apply_object(rt, kind, &raw).await?;
            if !known {
                rt.invalidate(&root, kind.plural());
            }
        }
        LiveEvent::Deleted(raw) => {
            rt.unregister(&object_id(kind, &raw));
            rt.invalidate(&root, kind.plural());
        }
        LiveEvent::Restarted(objects) => {
            let mut listed = HashSet::with_capacity(objects.len());
            for raw in &objects {
                listed.insert(apply_object(rt, kind, raw).await?.0);
            }
            let gone: Vec<ResourceId> = rt
                .resources()
                .into_iter()
                .filter(|r| r.type_name() == kind.type_name() && !listed.contains(r.id()))
                .map(|r| r.id().clone())
                .collect();
            for id in &gone {
                rt.unregister(id);
            }
            debug!(kind = kind.kind(), listed = listed.len(), dropped = gone.len(), "watch restart applied");
            rt.invalidate(&root, kind.plural());
        }
    }
    Ok(())
}

/// Watch one kind until the stream ends.
pub async fn watch_kind(rt: Runtime, source: Arc<LiveSource>, kind: K8sKind) -> Result<()> {
    let stream = watcher::watcher(source.api(kind), watcher::Config::default());
    futures::pin_mut!(stream);
    info!(kind = kind.kind(), "live invalidation started");
    while let Some(ev) = stream.try_next().await? {
        let event = match ev {
            Event::Applied(o) => LiveEvent::Applied(raw_object(kind, &o)?),
            Event::Deleted(o) => LiveEvent::Deleted(raw_object(kind, &o)?),
            Event::Restarted(list) => {
                debug!(kind = kind.kind(), count = list.len(), "watch restart");
                LiveEvent::Restarted(list.iter().map(|o| raw_object(kind, o)).collect::<Result<Vec<_>>>()?)
            }
        };
        if let Err(err) = apply_event(&rt, kind, event).await {
            warn!(kind = kind.kind(), error = %err, "applying watch event failed");
        }
    }
    warn!(kind = kind.kind(), "watcher stream ended");
    Ok(())
}

/// One watcher task per kind.
pub fn spawn_live_invalidation(rt: Runtime, source: Arc<LiveSource>, kinds: &[K8sKind]) -> Vec<JoinHandle<()>> {
    kinds
        .iter()
        .map(|&kind| {
            let rt = rt.clone();
            let source = Arc::clone(&source);
            tokio::spawn(async move {
                if let Err(err) = watch_kind(rt, source, kind).await {
                    warn!(kind = kind.kind(), error = %err, "live invalidation stopped");
                }
            })
        })
        .collect()
}
