//! Where kube objects come from: static manifests or a live cluster.

use std::path::Path;

use anyhow::{Context, Result};
use async_trait::async_trait;
use kube::api::{Api, ListParams};
use kube::core::{ApiResource, DynamicObject, GroupVersionKind};
use kube::Client;
use serde::Deserialize;
use tracing::{debug, info};

use crate::objects::{meta_str, strip_managed_fields};
use crate::K8sKind;

/// Lists raw kube objects (JSON with `kind`, `apiVersion`, `metadata`).
#[async_trait]
pub trait K8sSource: Send + Sync {
    async fn list(&self, kind: K8sKind) -> Result<Vec<serde_json::Value>>;

    /// Point lookup; by default a filtered listing.
    async fn get(&self, kind: K8sKind, namespace: &str, name: &str) -> Result<Option<serde_json::Value>> {
        let all = self.list(kind).await?;
        Ok(all.into_iter().find(|o| meta_str(o, "name") == name && meta_str(o, "namespace") == namespace))
    }

    /// Human label for logs (`manifest:<path>`, `cluster`).
    fn describe(&self) -> String;
}

/// Objects parsed once from multi-document YAML (offline scanning).
pub struct ManifestSource {
    origin: String,
    objects: Vec<serde_json::Value>,
}

impl ManifestSource {
    /// No objects at all; schemas stay usable for archived resources.
    pub fn empty(origin: &str) -> Self { Self { origin: origin.to_string(), objects: Vec::new() } }

    /// Parse multi-document YAML. `List` documents are flattened; namespaced
    /// objects without a namespace land in `default`.
    pub fn from_yaml(origin: &str, text: &str) -> Result<Self> {
        let mut objects = Vec::new();
        for (i, doc) in serde_yaml::Deserializer::from_str(text).enumerate() {
            let value = serde_json::Value::deserialize(doc).with_context(|| format!("{origin}: document {i}"))?;
            if value.is_null() {
                continue;
            }
            let is_list = value.get("kind").and_then(|k| k.as_str()).is_some_and(|k| k == "List" || k.ends_with("List"));
            if is_list {
                let items = value.get("items").and_then(|i| i.as_array()).cloned().unwrap_or_default();
                objects.extend(items);
            } else {
                objects.push(value);
            }
        }
        for obj in &mut objects {
            default_namespace(obj);
        }
        debug!(origin, count = objects.len(), "manifest parsed");
        Ok(Self { origin: origin.to_string(), objects })
    }

    /// Read a manifest file, or every `*.yaml`/`*.yml` file in a directory.
    pub fn from_path(path: &Path) -> Result<Self> {
        let origin = path.display().to_string();
        if !path.is_dir() {
            let text = std::fs::read_to_string(path).with_context(|| format!("reading {origin}"))?;
            return Self::from_yaml(&origin, &text);
        }
        let mut files: Vec<_> = std::fs::read_dir(path)
            .with_context(|| format!("reading {origin}"))?
            .filter_map(|e| e.ok().map(|e| e.path()))
            .filter(|p| p.extension().is_some_and(|x| x == "yaml" || x == "yml"))
            .collect();
        files.sort();
        let mut objects = Vec::new();
        for file in files {
            let text = std::fs::read_to_string(&file).with_context(|| format!("reading {}", file.display()))?;
            objects.extend(Self::from_yaml(&file.display().to_string(), &text)?.objects);
        }
        Ok(Self { origin, objects })
    }

    pub fn len(&self) -> usize { self.objects.len() }
    pub fn is_empty(&self) -> bool { self.objects.is_empty() }
}

fn default_namespace(obj: &mut serde_json::Value) {
    let namespaced = obj
        .get("kind")
        .and_then(|k| k.as_str())
        .and_then(K8sKind::from_kind)
        .is_some_and(K8sKind::namespaced);
    if !namespaced || !meta_str(obj, "namespace").is_empty() {
        return;
    }
    if let Some(meta) = obj.get_mut("metadata").and_then(|m| m.as_object_mut()) {
        meta.insert("namespace".into(), serde_json::Value::String("default".into()));
    }
}

#[async_trait]
impl K8sSource for ManifestSource {
    async fn list(&self, kind: K8sKind) -> Result<Vec<serde_json::Value>> {
        Ok(self
            .objects
            .iter()
            .filter(|o| o.get("kind").and_then(|k| k.as_str()) == Some(kind.kind()))
            .cloned()
            .collect())
    }

    fn describe(&self) -> String { format!("manifest:{}", self.origin) }
}

/// Objects listed from the cluster of the current kubeconfig context.
pub struct LiveSource {
    client: Client,
    namespace: Option<String>,
}

impl LiveSource {
    pub fn new(client: Client, namespace: Option<String>) -> Self { Self { client, namespace } }

    pub async fn try_default(namespace: Option<String>) -> Result<Self> {
        let client = Client::try_default().await.context("creating kube client")?;
        info!(ns = ?namespace, "connected to cluster");
        Ok(Self::new(client, namespace))
    }

    pub fn client(&self) -> &Client { &self.client }

    pub(crate) fn api(&self, kind: K8sKind) -> Api<DynamicObject> {
        let gvk = GroupVersionKind::gvk(kind.group(), kind.version(), kind.kind());
        let ar = ApiResource::from_gvk_with_plural(&gvk, kind.plural());
        match (&self.namespace, kind.namespaced()) {
            (Some(ns), true) => Api::namespaced_with(self.client.clone(), ns, &ar),
            _ => Api::all_with(self.client.clone(), &ar),
        }
    }
}

/// JSON of a listed object with `kind`/`apiVersion` filled in (list items omit them).
pub(crate) fn raw_object(kind: K8sKind, obj: &DynamicObject) -> Result<serde_json::Value> {
    let mut raw = serde_json::to_value(obj).context("serializing DynamicObject")?;
    strip_managed_fields(&mut raw);
    if let Some(o) = raw.as_object_mut() {
        o.insert("kind".into(), serde_json::Value::String(kind.kind().into()));
        o.insert("apiVersion".into(), serde_json::Value::String(kind.api_version()));
    }
    Ok(raw)
}

#[async_trait]
impl K8sSource for LiveSource {
    async fn list(&self, kind: K8sKind) -> Result<Vec<serde_json::Value>> {
        let list = self
            .api(kind)
            .list(&ListParams::default())
            .await
            .with_context(|| format!("listing {}", kind.plural()))?;
        list.items.iter().map(|o| raw_object(kind, o)).collect()
    }

    async fn get(&self, kind: K8sKind, namespace: &str, name: &str) -> Result<Option<serde_json::Value>> {
        let gvk = GroupVersionKind::gvk(kind.group(), kind.version(), kind.kind());
        let ar = ApiResource::from_gvk_with_plural(&gvk, kind.plural());
        let api: Api<DynamicObject> = if kind.namespaced() {
            Api::namespaced_with(self.client.clone(), namespace, &ar)
        } else {
            Api::all_with(self.client.clone(), &ar)
        };
        let found = api.get_opt(name).await.with_context(|| format!("getting {} {namespace}/{name}", kind.kind()))?;
        found.as_ref().map(|o| raw_object(kind, o)).transpose()
    }

    fn describe(&self) -> String {
        match &self.namespace {
            Some(ns) => format!("cluster (namespace {ns})"),
            None => "cluster".to_string(),
        }
    }
}
