#![forbid(unsafe_code)]

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use quarry_core::{AmbientIdentity, Args, Value};
use quarry_kubehub::{apply_event, register, K8sKind, K8sSource, LiveEvent, ManifestSource, ROOT};
use quarry_store::{Registry, Resource, Runtime, RuntimeConfig};

const CLUSTER: &str = r#"
apiVersion: v1
kind: Pod
metadata:
  name: mondoo
  namespace: default
  uid: 5e6b7c2a-0000-0000-0000-000000000001
spec:
  nodeName: worker-1
  initContainers:
    - name: init-config
      image: busybox:1.36
  containers:
    - name: client
      image: mondoo/client:latest
      command: ["mondoo", "serve"]
      securityContext:
        privileged: true
---
apiVersion: v1
kind: Node
metadata:
  name: worker-1
status:
  nodeInfo:
    kubeletVersion: v1.29.2
---
apiVersion: v1
kind: Secret
type: kubernetes.io/tls
metadata:
  name: web-cert
  namespace: web
data:
  tls.crt: LS0tLS1CRUdJTiBDRVJUSUZJQ0FURS0tLS0tCk1JSUJzekNDQVZtZ0F3SUJBZ0lVCi0tLS0tRU5EIENFUlRJRklDQVRFLS0tLS0K
  tls.key: ""
---
apiVersion: networking.k8s.io/v1
kind: Ingress
metadata:
  name: shop
  namespace: web
spec:
  tls:
    - hosts: ["shop.example.com"]
      secretName: missing-cert
  rules:
    - host: shop.example.com
      http:
        paths:
          - path: /
            pathType: Prefix
            backend:
              service:
                name: shop
                port:
                  number: 80
---
apiVersion: networking.k8s.io/v1
kind: Ingress
metadata:
  name: blog
  namespace: web
spec:
  tls:
    - hosts: ["blog.example.com"]
      secretName: web-cert
"#;

fn runtime(ambient: Option<AmbientIdentity>) -> Runtime {
    let source = ManifestSource::from_yaml("cluster.yaml", CLUSTER).unwrap();
    let mut registry = Registry::new();
    register(&mut registry, Arc::new(source));
    Runtime::for_target(registry, RuntimeConfig::default(), ambient)
}

fn named(name: &str, namespace: &str) -> Args {
    Args::from([("name".to_string(), Value::from(name)), ("namespace".to_string(), Value::from(namespace))])
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn pod_by_name_has_containers_and_is_canonical() {
    let rt = runtime(None);
    let pod = rt.create_resource("k8s.pod", named("mondoo", "default")).await.unwrap();
    assert_eq!(pod.id().id, "pod:default:mondoo");

    let spec = rt.field(&pod, "podSpec").await.unwrap();
    assert!(!spec.get("containers").and_then(Value::as_array).unwrap().is_empty());

    let containers = rt.field(&pod, "containers").await.unwrap();
    let first = containers.as_array().unwrap()[0].as_resource().unwrap().clone();
    let client = rt.resolve(&first).unwrap();
    assert_eq!(rt.field(&client, "name").await.unwrap(), Value::from("client"));
    assert_eq!(rt.field(&client, "uid").await.unwrap(), Value::from("pod:default:mondoo/client"));
    assert_eq!(rt.field(&client, "command").await.unwrap(), Value::from(vec!["mondoo", "serve"]));

    let init = rt.field(&pod, "initContainers").await.unwrap();
    assert_eq!(init.as_array().unwrap().len(), 1);

    let again = rt.create_resource("pod", named("mondoo", "default")).await.unwrap();
    assert!(Arc::ptr_eq(&pod, &again));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn pod_resolves_node_and_ambient_identity() {
    let ambient = AmbientIdentity::from_platform_id("//platformid/k8s/uid/1/namespace/default/pods/name/mondoo");
    let rt = runtime(ambient);
    let pod = rt.create_resource("k8s.pod", Args::new()).await.unwrap();
    assert_eq!(pod.id().id, "pod:default:mondoo");

    let node = rt.field(&pod, "node").await.unwrap();
    let node = rt.resolve(node.as_resource().unwrap()).unwrap();
    assert_eq!(node.id().id, "node::worker-1");
    let info = rt.field(&node, "nodeInfo").await.unwrap();
    assert_eq!(info.get("kubeletVersion"), Some(&Value::from("v1.29.2")));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn unknown_pod_is_not_found() {
    let rt = runtime(None);
    let err = rt.create_resource("k8s.pod", named("mondoo", "kube-system")).await.unwrap_err();
    assert!(err.is_not_found(), "{err}");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn ingress_with_missing_tls_secret_has_empty_tls() {
    let rt = runtime(None);
    let shop = rt.create_resource("k8s.ingress", named("shop", "web")).await.unwrap();
    assert_eq!(rt.field(&shop, "tls").await.unwrap(), Value::Array(vec![]));

    let rules = rt.field(&shop, "rules").await.unwrap();
    let rule = rt.resolve(rules.as_array().unwrap()[0].as_resource().unwrap()).unwrap();
    assert_eq!(rt.field(&rule, "host").await.unwrap(), Value::from("shop.example.com"));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn ingress_tls_carries_secret_certificates() {
    let rt = runtime(None);
    let blog = rt.create_resource("k8s.ingress", named("blog", "web")).await.unwrap();
    let tls = rt.field(&blog, "tls").await.unwrap();
    let entries = tls.as_array().unwrap();
    assert_eq!(entries.len(), 1);
    let entry = rt.resolve(entries[0].as_resource().unwrap()).unwrap();
    let certs = rt.field(&entry, "certificates").await.unwrap();
    assert_eq!(certs.as_array().unwrap().len(), 1);
    assert!(certs.as_array().unwrap()[0].as_str().unwrap().starts_with("-----BEGIN CERTIFICATE-----"));
    assert_eq!(rt.field(&entry, "hosts").await.unwrap(), Value::from(vec!["blog.example.com"]));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn live_events_refresh_and_drop_resources() {
    let rt = runtime(None);
    let pod = rt.create_resource("k8s.pod", named("mondoo", "default")).await.unwrap();
    assert_eq!(rt.field(&pod, "labels").await.unwrap(), Value::Map(Default::default()));
    rt.field(&pod, "containers").await.unwrap();

    let updated = serde_json::json!({
        "apiVersion": "v1", "kind": "Pod",
        "metadata": {"name": "mondoo", "namespace": "default", "labels": {"tier": "agent"}},
        "spec": {"containers": [{"name": "client"}, {"name": "sidecar"}]}
    });
    apply_event(&rt, K8sKind::Pod, LiveEvent::Applied(updated.clone())).await.unwrap();
    assert_eq!(rt.field(&pod, "labels").await.unwrap().get("tier"), Some(&Value::from("agent")));
    assert_eq!(rt.field(&pod, "containers").await.unwrap().as_array().unwrap().len(), 2);

    apply_event(&rt, K8sKind::Pod, LiveEvent::Deleted(updated)).await.unwrap();
    assert!(rt.get_resource(pod.id()).is_none());
    // the listing was invalidated, so the pod is listed again from the source
    let relisted = rt.create_resource("k8s.pod", named("mondoo", "default")).await.unwrap();
    assert!(!Arc::ptr_eq(&pod, &relisted));
}

/// Objects that tests can replace between listings.
#[derive(Default)]
struct Swappable {
    pods: Mutex<Vec<serde_json::Value>>,
}

impl Swappable {
    fn set(&self, pods: Vec<serde_json::Value>) { *self.pods.lock().unwrap() = pods; }
}

#[async_trait]
impl K8sSource for Swappable {
    async fn list(&self, kind: K8sKind) -> anyhow::Result<Vec<serde_json::Value>> {
        Ok(if kind == K8sKind::Pod { self.pods.lock().unwrap().clone() } else { Vec::new() })
    }

    fn describe(&self) -> String { "swappable".into() }
}

fn pod_json(name: &str, version: &str, image: &str) -> serde_json::Value {
    serde_json::json!({
        "apiVersion": "v1", "kind": "Pod",
        "metadata": {"name": name, "namespace": "default", "resourceVersion": version},
        "spec": {"containers": [{"name": "client", "image": image}]}
    })
}

fn swappable_runtime(pods: Vec<serde_json::Value>) -> (Runtime, Arc<Swappable>) {
    let source = Arc::new(Swappable::default());
    source.set(pods);
    let mut registry = Registry::new();
    register(&mut registry, source.clone());
    (Runtime::new(registry, RuntimeConfig::default()), source)
}

async fn first_container(rt: &Runtime, pod: &Arc<Resource>) -> Arc<Resource> {
    let containers = rt.field(pod, "containers").await.unwrap();
    rt.resolve(containers.as_array().unwrap()[0].as_resource().unwrap()).unwrap()
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn applied_pod_refreshes_its_containers() {
    let rt = runtime(None);
    let pod = rt.create_resource("k8s.pod", named("mondoo", "default")).await.unwrap();
    let client = first_container(&rt, &pod).await;
    assert_eq!(rt.field(&client, "image").await.unwrap(), Value::from("mondoo/client:latest"));

    let updated = serde_json::json!({
        "apiVersion": "v1", "kind": "Pod",
        "metadata": {"name": "mondoo", "namespace": "default", "resourceVersion": "2"},
        "spec": {"containers": [{"name": "client", "image": "mondoo/client:v2", "command": ["mondoo"]}]}
    });
    apply_event(&rt, K8sKind::Pod, LiveEvent::Applied(updated)).await.unwrap();

    let spec = rt.field(&pod, "podSpec").await.unwrap();
    assert_eq!(spec.get("containers").and_then(Value::as_array).unwrap()[0].get("image"), Some(&Value::from("mondoo/client:v2")));
    // the instance held from before sees the new spec without re-reading the pod
    assert_eq!(rt.field(&client, "image").await.unwrap(), Value::from("mondoo/client:v2"));
    assert_eq!(rt.field(&client, "command").await.unwrap(), Value::from(vec!["mondoo"]));
    assert!(Arc::ptr_eq(&client, &first_container(&rt, &pod).await));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn applied_ingress_refreshes_its_tls_entries() {
    let rt = runtime(None);
    let blog = rt.create_resource("k8s.ingress", named("blog", "web")).await.unwrap();
    let tls = rt.field(&blog, "tls").await.unwrap();
    let entry = rt.resolve(tls.as_array().unwrap()[0].as_resource().unwrap()).unwrap();
    assert_eq!(rt.field(&entry, "hosts").await.unwrap(), Value::from(vec!["blog.example.com"]));

    let updated = serde_json::json!({
        "apiVersion": "networking.k8s.io/v1", "kind": "Ingress",
        "metadata": {"name": "blog", "namespace": "web", "resourceVersion": "7"},
        "spec": {"tls": [{"hosts": ["blog.example.com", "www.blog.example.com"], "secretName": "web-cert"}]}
    });
    apply_event(&rt, K8sKind::Ingress, LiveEvent::Applied(updated)).await.unwrap();
    assert_eq!(
        rt.field(&entry, "hosts").await.unwrap(),
        Value::from(vec!["blog.example.com", "www.blog.example.com"])
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn relisting_refreshes_objects_changed_meanwhile() {
    let (rt, source) = swappable_runtime(vec![pod_json("mondoo", "1", "client:v1")]);
    let pod = rt.create_resource("k8s.pod", named("mondoo", "default")).await.unwrap();
    let client = first_container(&rt, &pod).await;
    assert_eq!(rt.field(&client, "image").await.unwrap(), Value::from("client:v1"));

    source.set(vec![pod_json("mondoo", "2", "client:v2")]);
    let root = rt.create_resource(ROOT, Args::new()).await.unwrap();
    rt.refresh_field(&root, "pods").await.unwrap();

    let again = rt.create_resource("k8s.pod", named("mondoo", "default")).await.unwrap();
    assert!(Arc::ptr_eq(&pod, &again));
    assert_eq!(rt.field(&pod, "resourceVersion").await.unwrap(), Value::from("2"));
    assert_eq!(rt.field(&client, "image").await.unwrap(), Value::from("client:v2"));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn restart_applies_the_new_listing() {
    let (rt, source) = swappable_runtime(vec![pod_json("mondoo", "1", "client:v1"), pod_json("cron", "1", "cron:v1")]);
    let pod = rt.create_resource("k8s.pod", named("mondoo", "default")).await.unwrap();
    let cron = rt.create_resource("k8s.pod", named("cron", "default")).await.unwrap();
    let client = first_container(&rt, &pod).await;

    source.set(vec![pod_json("mondoo", "2", "client:v2")]);
    let listed = source.list(K8sKind::Pod).await.unwrap();
    apply_event(&rt, K8sKind::Pod, LiveEvent::Restarted(listed)).await.unwrap();

    let spec = rt.field(&pod, "podSpec").await.unwrap();
    assert_eq!(spec.get("containers").and_then(Value::as_array).unwrap()[0].get("image"), Some(&Value::from("client:v2")));
    assert_eq!(rt.field(&client, "image").await.unwrap(), Value::from("client:v2"));
    assert!(rt.get_resource(cron.id()).is_none());
    assert!(rt.create_resource("k8s.pod", named("cron", "default")).await.unwrap_err().is_not_found());
}
