//! Raw kube objects → resource args and typed payloads.

use std::collections::BTreeMap;
use std::sync::Arc;

use anyhow::Context;
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::{Namespace, Node, Pod, PodSpec, Secret};
use k8s_openapi::api::networking::v1::Ingress;
use quarry_core::{Args, Result, Value};
use quarry_store::Internal;
use serde::de::DeserializeOwned;

use crate::{obj_id, K8sKind};

pub(crate) fn meta_str<'a>(raw: &'a serde_json::Value, key: &str) -> &'a str {
    raw.get("metadata").and_then(|m| m.get(key)).and_then(|v| v.as_str()).unwrap_or_default()
}

pub(crate) fn strip_managed_fields(v: &mut serde_json::Value) {
    if let Some(meta) = v.get_mut("metadata") {
        if let Some(obj) = meta.as_object_mut() {
            obj.remove("managedFields");
        }
    }
}

fn string_map(raw: &serde_json::Value, key: &str) -> Value {
    let map: BTreeMap<String, Value> = raw
        .get("metadata")
        .and_then(|m| m.get(key))
        .and_then(|v| v.as_object())
        .map(|o| o.iter().map(|(k, v)| (k.clone(), Value::from(v.as_str().unwrap_or_default()))).collect())
        .unwrap_or_default();
    Value::Map(map)
}

fn created(raw: &serde_json::Value) -> Value {
    chrono::DateTime::parse_from_rfc3339(meta_str(raw, "creationTimestamp"))
        .map(|dt| Value::Time(dt.timestamp()))
        .unwrap_or(Value::Null)
}

fn typed<T: DeserializeOwned>(kind: K8sKind, raw: &serde_json::Value) -> Result<T> {
    let name = meta_str(raw, "name");
    let parsed = serde_json::from_value(raw.clone()).with_context(|| format!("decoding {} '{name}'", kind.kind()))?;
    Ok(parsed)
}

pub(crate) fn to_value<T: serde::Serialize>(v: &T) -> Value {
    serde_json::to_value(v).map(Value::from_json).unwrap_or(Value::Null)
}

/// Args shared by every kube resource type.
pub fn base_args(kind: K8sKind, raw: &serde_json::Value) -> Args {
    let name = meta_str(raw, "name");
    let namespace = meta_str(raw, "namespace");
    let mut args = Args::new();
    args.insert("id".into(), obj_id(kind.kind(), namespace, name).into());
    args.insert("uid".into(), meta_str(raw, "uid").into());
    args.insert("resourceVersion".into(), meta_str(raw, "resourceVersion").into());
    args.insert("name".into(), name.into());
    if kind.namespaced() {
        args.insert("namespace".into(), namespace.into());
    }
    args.insert("kind".into(), kind.kind().into());
    args.insert("apiVersion".into(), kind.api_version().into());
    args.insert("created".into(), created(raw));
    args.insert("labels".into(), string_map(raw, "labels"));
    args.insert("annotations".into(), string_map(raw, "annotations"));
    args.insert("manifest".into(), Value::from_json(raw.clone()));
    args
}

/// Constructor args plus the typed payload for one listed object.
pub fn materialize(kind: K8sKind, raw: &serde_json::Value) -> Result<(Args, Internal)> {
    let mut args = base_args(kind, raw);
    let internal: Internal = match kind {
        K8sKind::Pod => {
            let pod: Pod = typed(kind, raw)?;
            args.insert("podSpec".into(), pod.spec.as_ref().map(to_value).unwrap_or(Value::Null));
            Arc::new(pod)
        }
        K8sKind::Deployment => {
            let deployment: Deployment = typed(kind, raw)?;
            let replicas = deployment.spec.as_ref().and_then(|s| s.replicas).unwrap_or(1);
            args.insert("replicas".into(), Value::Int(i64::from(replicas)));
            Arc::new(deployment)
        }
        K8sKind::Secret => {
            let secret: Secret = typed(kind, raw)?;
            args.insert("type".into(), secret.type_.clone().unwrap_or_else(|| "Opaque".into()).into());
            Arc::new(secret)
        }
        K8sKind::Node => Arc::new(typed::<Node>(kind, raw)?),
        K8sKind::Namespace => Arc::new(typed::<Namespace>(kind, raw)?),
        K8sKind::Ingress => Arc::new(typed::<Ingress>(kind, raw)?),
    };
    Ok((args, internal))
}

/// Pod spec of a workload payload: the pod's own spec, or a deployment's template.
pub(crate) fn pod_spec(kind: K8sKind, internal: &Internal) -> Option<PodSpec> {
    match kind {
        K8sKind::Pod => internal.downcast_ref::<Pod>().and_then(|p| p.spec.clone()),
        K8sKind::Deployment => internal
            .downcast_ref::<Deployment>()
            .and_then(|d| d.spec.as_ref())
            .and_then(|s| s.template.spec.clone()),
        _ => None,
    }
}
