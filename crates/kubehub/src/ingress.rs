//! Ingresses with their rules and TLS entries.

use std::collections::BTreeMap;
use std::sync::Arc;

use k8s_openapi::api::networking::v1::Ingress;
use quarry_core::{Args, QuarryError, Result, Value};
use quarry_store::{identity_keys, resolve_reference, FieldClass, IndexKey, JsonCodec, Resource, ResourceSchema, Runtime};
use tracing::debug;

use crate::objects::to_value;
use crate::{object_schema, K8sKind, ROOT};

pub(crate) fn ingress_schema() -> ResourceSchema {
    object_schema(K8sKind::Ingress)
        .codec(JsonCodec::<Ingress>::new())
        .field("rules", FieldClass::Static, rules)
        .field("tls", FieldClass::Static, tls)
}

pub(crate) fn rule_schema() -> ResourceSchema {
    ResourceSchema::new("k8s.ingressrule").arg_field("id").arg_field("host").arg_field("httpPaths")
}

pub(crate) fn tls_schema() -> ResourceSchema {
    ResourceSchema::new("k8s.ingresstls").arg_field("id").arg_field("hosts").arg_field("certificates").arg_field("secret")
}

async fn rules(rt: Runtime, res: Arc<Resource>) -> Result<Value> {
    let ingress = res.require_internal::<Ingress>()?;
    let rules = ingress.spec.as_ref().and_then(|s| s.rules.clone()).unwrap_or_default();
    let mut out = Vec::with_capacity(rules.len());
    for (i, rule) in rules.iter().enumerate() {
        let paths: Vec<Value> = rule
            .http
            .as_ref()
            .map(|h| h.paths.iter().map(to_value).collect())
            .unwrap_or_default();
        let args = Args::from([
            ("id".to_string(), Value::from(format!("{}-rule{i}", res.id().id))),
            ("host".to_string(), Value::from(rule.host.clone().unwrap_or_default())),
            ("httpPaths".to_string(), Value::Array(paths)),
        ]);
        let (created, _) = rt.upsert_resource("k8s.ingressrule", args, None)?;
        out.push(Value::Resource(created.id().clone()));
    }
    Ok(Value::Array(out))
}

/// TLS entries whose secret exists in the ingress namespace and carries
/// certificates. Missing or certificate-less secrets are skipped.
async fn tls(rt: Runtime, res: Arc<Resource>) -> Result<Value> {
    let ingress = res.require_internal::<Ingress>()?;
    let entries = ingress.spec.as_ref().and_then(|s| s.tls.clone()).unwrap_or_default();
    if entries.is_empty() {
        return Ok(Value::Array(Vec::new()));
    }
    let namespace = ingress.metadata.namespace.clone().unwrap_or_default();
    let root = rt.create_resource(ROOT, Args::new()).await?;

    let mut out = Vec::new();
    for (i, entry) in entries.iter().enumerate() {
        let Some(secret_name) = entry.secret_name.as_deref().filter(|s| !s.is_empty()) else { continue };
        let key = IndexKey::namespaced(&namespace, secret_name);
        let listing = K8sKind::Secret.plural();
        let found = resolve_reference(&rt, &root, listing, "secrets:identity", &key, |r| identity_keys(r, true)).await?;
        let Some(secret) = found else {
            debug!(ingress = %res.id(), secret = secret_name, "tls secret not found");
            continue;
        };
        let certificates = rt
            .field(&secret, "certificates")
            .await
            .map_err(|e| QuarryError::io(format!("error getting certificate data from Secret: {e}")))?;
        if certificates.as_array().map_or(true, <[Value]>::is_empty) {
            continue;
        }
        let hosts = Value::from(entry.hosts.clone().unwrap_or_default());
        let args: Args = BTreeMap::from([
            ("id".to_string(), Value::from(format!("{}-tls{i}", res.id().id))),
            ("hosts".to_string(), hosts),
            ("certificates".to_string(), certificates),
            ("secret".to_string(), Value::Resource(secret.id().clone())),
        ]);
        let (created, _) = rt.upsert_resource("k8s.ingresstls", args, None)?;
        out.push(Value::Resource(created.id().clone()));
    }
    Ok(Value::Array(out))
}
