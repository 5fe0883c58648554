//! The `k8s` root with its listings, plus nodes, namespaces and deployments.

use std::sync::Arc;

use anyhow::Context;
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::{Namespace, Node};
use metrics::histogram;
use quarry_core::{Result, Value};
use quarry_store::{FieldClass, JsonCodec, Resource, ResourceSchema, Runtime};
use tracing::{debug, warn};

use crate::objects::{materialize, to_value};
use crate::source::K8sSource;
use crate::{object_schema, pod, K8sKind, ROOT};

pub(crate) fn root_schema(source: Arc<dyn K8sSource>) -> ResourceSchema {
    let describe = source.describe();
    let mut schema = ResourceSchema::new(ROOT).field("source", FieldClass::Static, move |_, _| {
        let describe = describe.clone();
        async move { Ok(Value::from(describe)) }
    });
    for kind in K8sKind::ALL {
        let source = Arc::clone(&source);
        schema = schema.field(kind.plural(), FieldClass::Transient, move |rt, _| list_kind(rt, Arc::clone(&source), kind));
    }
    schema
}

/// List `kind` and materialise one canonical resource per object. Objects
/// that changed since they were last seen refresh their instance.
async fn list_kind(rt: Runtime, source: Arc<dyn K8sSource>, kind: K8sKind) -> Result<Value> {
    let started = std::time::Instant::now();
    let raws = source.list(kind).await.with_context(|| format!("{}: listing {}", source.describe(), kind.plural()))?;
    let mut out = Vec::with_capacity(raws.len());
    for raw in &raws {
        let (args, internal) = materialize(kind, raw)?;
        let (res, refreshed) = rt.upsert_resource(kind.type_name(), args, Some(internal))?;
        if refreshed {
            refresh_children(&rt, &res, kind).await;
        }
        out.push(Value::Resource(res.id().clone()));
    }
    histogram!("k8s_list_ms", started.elapsed().as_secs_f64() * 1000.0, "kind" => kind.kind());
    debug!(kind = kind.kind(), count = out.len(), "listed");
    Ok(Value::Array(out))
}

/// Recompute the child listings of a refreshed object that were read before,
/// so nested instances pick up the new object.
pub(crate) async fn refresh_children(rt: &Runtime, res: &Arc<Resource>, kind: K8sKind) {
    for field in kind.child_fields() {
        if res.cache().load(field).is_none() {
            continue;
        }
        if let Err(err) = rt.field(res, field).await {
            warn!(resource = %res.id(), field, error = %err, "refreshing nested resources failed");
        }
    }
}

pub(crate) fn node_schema() -> ResourceSchema {
    object_schema(K8sKind::Node).codec(JsonCodec::<Node>::new()).field("nodeInfo", FieldClass::Static, |_, res| async move {
        let node = res.require_internal::<Node>()?;
        Ok(node.status.as_ref().and_then(|s| s.node_info.as_ref()).map(to_value).unwrap_or_default())
    })
}

pub(crate) fn namespace_schema() -> ResourceSchema {
    object_schema(K8sKind::Namespace).codec(JsonCodec::<Namespace>::new()).field("phase", FieldClass::Static, |_, res| async move {
        let ns = res.require_internal::<Namespace>()?;
        Ok(ns.status.as_ref().and_then(|s| s.phase.clone()).map(Value::from).unwrap_or_default())
    })
}

pub(crate) fn deployment_schema() -> ResourceSchema {
    object_schema(K8sKind::Deployment)
        .codec(JsonCodec::<Deployment>::new())
        .arg_field("replicas")
        .field("containers", FieldClass::Static, |rt, res| pod::containers(rt, res, K8sKind::Deployment, false))
        .field("initContainers", FieldClass::Static, |rt, res| pod::containers(rt, res, K8sKind::Deployment, true))
}
