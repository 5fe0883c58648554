//! Pods and their containers.

use std::sync::Arc;

use k8s_openapi::api::core::v1::{Container, Pod};
use quarry_core::{Args, QuarryError, Result, Value};
use quarry_store::{identity_keys, resolve_reference, FieldClass, IndexKey, JsonCodec, Resource, ResourceSchema, Runtime};

use crate::objects::{pod_spec, to_value};
use crate::{object_schema, K8sKind, ROOT};

pub(crate) fn pod_schema() -> ResourceSchema {
    object_schema(K8sKind::Pod)
        .codec(JsonCodec::<Pod>::new())
        .arg_field("podSpec")
        .field("containers", FieldClass::Static, |rt, res| containers(rt, res, K8sKind::Pod, false))
        .field("initContainers", FieldClass::Static, |rt, res| containers(rt, res, K8sKind::Pod, true))
        .field("node", FieldClass::Static, node_of)
}

pub(crate) fn container_schema(type_name: &str, init: bool) -> ResourceSchema {
    let mut schema = ResourceSchema::new(type_name).identity(|args| {
        quarry_core::arg_nonempty(args, "uid")?
            .map(str::to_string)
            .ok_or_else(|| QuarryError::misconfigured("container needs a uid"))
    });
    let mut fields = vec![
        "uid", "name", "imageName", "image", "command", "args", "resources", "volumeMounts", "volumeDevices",
        "imagePullPolicy", "securityContext", "workingDir", "tty",
    ];
    if !init {
        fields.extend(["livenessProbe", "readinessProbe"]);
    }
    for field in fields {
        schema = schema.arg_field(field);
    }
    schema
}

fn container_args(owner_id: &str, c: &Container, init: bool) -> Args {
    let strings = |v: &Option<Vec<String>>| Value::from(v.clone().unwrap_or_default());
    let mut args = Args::new();
    // container names are unique within their owner
    args.insert("uid".into(), format!("{owner_id}/{}", c.name).into());
    args.insert("name".into(), c.name.clone().into());
    let image = c.image.clone().unwrap_or_default();
    args.insert("imageName".into(), image.clone().into());
    args.insert("image".into(), image.into());
    args.insert("command".into(), strings(&c.command));
    args.insert("args".into(), strings(&c.args));
    args.insert("resources".into(), c.resources.as_ref().map(to_value).unwrap_or_default());
    args.insert("volumeMounts".into(), c.volume_mounts.as_ref().map(to_value).unwrap_or_else(|| Value::Array(vec![])));
    args.insert("volumeDevices".into(), c.volume_devices.as_ref().map(to_value).unwrap_or_else(|| Value::Array(vec![])));
    args.insert("imagePullPolicy".into(), c.image_pull_policy.clone().unwrap_or_default().into());
    args.insert("securityContext".into(), c.security_context.as_ref().map(to_value).unwrap_or_default());
    args.insert("workingDir".into(), c.working_dir.clone().unwrap_or_default().into());
    args.insert("tty".into(), c.tty.unwrap_or(false).into());
    if !init {
        args.insert("livenessProbe".into(), c.liveness_probe.as_ref().map(to_value).unwrap_or_default());
        args.insert("readinessProbe".into(), c.readiness_probe.as_ref().map(to_value).unwrap_or_default());
    }
    args
}

/// Containers (or init containers) of a workload's pod spec. A container
/// seen before under the same owner is refreshed from the current spec.
pub(crate) async fn containers(rt: Runtime, res: Arc<Resource>, kind: K8sKind, init: bool) -> Result<Value> {
    let internal = res
        .internal_any()
        .ok_or_else(|| QuarryError::Internal(format!("{} was created without its object", res.id())))?;
    let Some(spec) = pod_spec(kind, &internal) else { return Ok(Value::Array(Vec::new())) };
    let list = if init { spec.init_containers.unwrap_or_default() } else { spec.containers };
    let type_name = if init { "k8s.initContainer" } else { "k8s.container" };

    let mut out = Vec::with_capacity(list.len());
    for c in &list {
        let (container, _) = rt.upsert_resource(type_name, container_args(&res.id().id, c, init), None)?;
        out.push(Value::Resource(container.id().clone()));
    }
    Ok(Value::Array(out))
}

/// The node the pod is scheduled on, looked up by name in the node listing.
async fn node_of(rt: Runtime, res: Arc<Resource>) -> Result<Value> {
    let spec = rt.field(&res, "podSpec").await?;
    let Some(node_name) = spec.get("nodeName").and_then(Value::as_str).filter(|n| !n.is_empty()) else {
        return Ok(Value::Null);
    };
    let root = rt.create_resource(ROOT, Args::new()).await?;
    let key = IndexKey::Name(node_name.to_string());
    let node = resolve_reference(&rt, &root, K8sKind::Node.plural(), "nodes:identity", &key, |r| identity_keys(r, false)).await?;
    Ok(node.map(|n| Value::Resource(n.id().clone())).unwrap_or_default())
}
