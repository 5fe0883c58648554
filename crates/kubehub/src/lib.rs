//! Quarry kubehub: Kubernetes resources for the quarry runtime.
//!
//! Objects come from a [`K8sSource`] (static manifests or a live cluster)
//! and are listed through the singleton `k8s` resource. Keyed types
//! (`k8s.pod`, `k8s.node`, ...) resolve their identity through those listings.

#![forbid(unsafe_code)]

use std::sync::Arc;

use quarry_core::{arg_nonempty, arg_str, Args, QuarryError, Result};
use quarry_store::{resolve_identity, Lookup, Registry, ResourceSchema};

mod cluster;
mod ingress;
pub mod live;
pub mod objects;
mod pod;
mod secret;
pub mod source;

pub use live::{apply_event, spawn_live_invalidation, LiveEvent};
pub use source::{K8sSource, LiveSource, ManifestSource};

/// Type name of the root resource owning every listing.
pub const ROOT: &str = "k8s";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum K8sKind {
    Pod,
    Node,
    Secret,
    Ingress,
    Deployment,
    Namespace,
}

impl K8sKind {
    pub const ALL: [K8sKind; 6] =
        [K8sKind::Pod, K8sKind::Node, K8sKind::Secret, K8sKind::Ingress, K8sKind::Deployment, K8sKind::Namespace];

    pub fn kind(self) -> &'static str {
        match self {
            K8sKind::Pod => "Pod",
            K8sKind::Node => "Node",
            K8sKind::Secret => "Secret",
            K8sKind::Ingress => "Ingress",
            K8sKind::Deployment => "Deployment",
            K8sKind::Namespace => "Namespace",
        }
    }

    pub fn from_kind(kind: &str) -> Option<Self> { Self::ALL.into_iter().find(|k| k.kind() == kind) }

    pub fn group(self) -> &'static str {
        match self {
            K8sKind::Ingress => "networking.k8s.io",
            K8sKind::Deployment => "apps",
            _ => "",
        }
    }

    pub fn version(self) -> &'static str { "v1" }

    pub fn api_version(self) -> String {
        if self.group().is_empty() { self.version().to_string() } else { format!("{}/{}", self.group(), self.version()) }
    }

    /// Also the name of the listing field on the root.
    pub fn plural(self) -> &'static str {
        match self {
            K8sKind::Pod => "pods",
            K8sKind::Node => "nodes",
            K8sKind::Secret => "secrets",
            K8sKind::Ingress => "ingresses",
            K8sKind::Deployment => "deployments",
            K8sKind::Namespace => "namespaces",
        }
    }

    pub fn namespaced(self) -> bool { !matches!(self, K8sKind::Node | K8sKind::Namespace) }

    pub fn type_name(self) -> &'static str {
        match self {
            K8sKind::Pod => "k8s.pod",
            K8sKind::Node => "k8s.node",
            K8sKind::Secret => "k8s.secret",
            K8sKind::Ingress => "k8s.ingress",
            K8sKind::Deployment => "k8s.deployment",
            K8sKind::Namespace => "k8s.namespace",
        }
    }

    /// Fields listing resources built from this kind's object.
    pub fn child_fields(self) -> &'static [&'static str] {
        match self {
            K8sKind::Pod | K8sKind::Deployment => &["containers", "initContainers"],
            K8sKind::Ingress => &["rules", "tls"],
            _ => &[],
        }
    }

    pub(crate) fn lookup(self) -> Lookup<'static> {
        if self.namespaced() { Lookup::namespaced(ROOT, self.plural()) } else { Lookup::cluster(ROOT, self.plural()) }
    }
}

/// `kind:namespace:name` with the kind lowercased.
pub fn obj_id(kind: &str, namespace: &str, name: &str) -> String {
    format!("{}:{}:{}", kind.to_lowercase(), namespace, name)
}

fn identity_from_args(kind: K8sKind, args: &Args) -> Result<String> {
    if let Some(id) = arg_nonempty(args, "id")? {
        return Ok(id.to_string());
    }
    match arg_nonempty(args, "name")? {
        Some(name) => Ok(obj_id(kind.kind(), arg_str(args, "namespace")?.unwrap_or_default(), name)),
        None => Err(QuarryError::misconfigured(format!("{} needs an id or a name", kind.type_name()))),
    }
}

/// Schema shared by every listed kube object type.
pub(crate) fn object_schema(kind: K8sKind) -> ResourceSchema {
    let mut schema = ResourceSchema::new(kind.type_name()).identity(move |args| identity_from_args(kind, args));
    for field in ["id", "uid", "resourceVersion", "name", "kind", "apiVersion", "created", "labels", "annotations", "manifest"] {
        schema = schema.arg_field(field);
    }
    if kind.namespaced() {
        schema = schema.arg_field("namespace");
    }
    let lookup = kind.lookup();
    schema.init(move |rt, args| async move { resolve_identity(&rt, &lookup, args).await })
}

/// Register every kube resource type, listing objects from `source`.
pub fn register(registry: &mut Registry, source: Arc<dyn K8sSource>) {
    registry.register(cluster::root_schema(source));
    registry.register(cluster::node_schema());
    registry.register(cluster::namespace_schema());
    registry.register(cluster::deployment_schema());
    registry.register(pod::pod_schema());
    registry.register(pod::container_schema("k8s.container", false));
    registry.register(pod::container_schema("k8s.initContainer", true));
    registry.register(secret::secret_schema());
    registry.register(ingress::ingress_schema());
    registry.register(ingress::rule_schema());
    registry.register(ingress::tls_schema());
    for kind in K8sKind::ALL {
        registry.alias(&kind.kind().to_lowercase(), kind.type_name());
    }
    registry.alias("k8s.initcontainer", "k8s.initContainer");
}

#[cfg(test)]
mod tests {
    use super::*;
    use quarry_core::Value;

    #[test]
    fn obj_id_lowercases_kind() {
        assert_eq!(obj_id("Pod", "default", "mondoo"), "pod:default:mondoo");
        assert_eq!(obj_id("Node", "", "worker-1"), "node::worker-1");
    }

    #[test]
    fn identity_prefers_id_then_name() {
        let by_name = Args::from([("name".to_string(), Value::from("x")), ("namespace".to_string(), Value::from("ns"))]);
        assert_eq!(identity_from_args(K8sKind::Secret, &by_name).unwrap(), "secret:ns:x");
        let mut by_id = by_name.clone();
        by_id.insert("id".into(), Value::from("custom"));
        assert_eq!(identity_from_args(K8sKind::Secret, &by_id).unwrap(), "custom");
        assert!(identity_from_args(K8sKind::Secret, &Args::new()).is_err());
    }

    #[test]
    fn kinds_round_trip_and_know_their_group() {
        for kind in K8sKind::ALL {
            assert_eq!(K8sKind::from_kind(kind.kind()), Some(kind));
        }
        assert_eq!(K8sKind::Ingress.api_version(), "networking.k8s.io/v1");
        assert_eq!(K8sKind::Pod.api_version(), "v1");
    }
}
