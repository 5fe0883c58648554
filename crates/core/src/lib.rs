//! Quarry core types: field values, resource identities, constructor args and errors.

#![forbid(unsafe_code)]

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

pub mod error;

pub use error::{QuarryError, Result};

/// Identity of one resource instance: its type plus the derived identity key
/// (an id, `kind:namespace:name`, a path, ...).
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ResourceId {
    pub type_name: String,
    pub id: String,
}

impl ResourceId {
    pub fn new(type_name: impl Into<String>, id: impl Into<String>) -> Self {
        Self { type_name: type_name.into(), id: id.into() }
    }

    /// Stable cache key, also used for the persisted archive.
    pub fn cache_key(&self) -> String { format!("{}\x00{}", self.type_name, self.id) }

    pub fn from_cache_key(key: &str) -> Option<Self> {
        let (type_name, id) = key.split_once('\x00')?;
        Some(Self::new(type_name, id))
    }
}

impl fmt::Display for ResourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.id.is_empty() { write!(f, "{}", self.type_name) } else { write!(f, "{} id = {}", self.type_name, self.id) }
    }
}

/// A computed field value.
///
/// Nested resources are held by identity and resolved through the runtime,
/// so values never own other resource instances.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum Value {
    #[default]
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    String(String),
    /// Seconds since the unix epoch.
    Time(i64),
    Array(Vec<Value>),
    Map(BTreeMap<String, Value>),
    Resource(ResourceId),
}

impl Value {
    pub fn is_null(&self) -> bool { matches!(self, Value::Null) }

    pub fn as_str(&self) -> Option<&str> {
        match self { Value::String(s) => Some(s), _ => None }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self { Value::Bool(b) => Some(*b), _ => None }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self { Value::Int(i) => Some(*i), _ => None }
    }

    pub fn as_array(&self) -> Option<&[Value]> {
        match self { Value::Array(v) => Some(v), _ => None }
    }

    pub fn as_map(&self) -> Option<&BTreeMap<String, Value>> {
        match self { Value::Map(m) => Some(m), _ => None }
    }

    pub fn as_resource(&self) -> Option<&ResourceId> {
        match self { Value::Resource(r) => Some(r), _ => None }
    }

    /// Lookup of a key in a map value; `None` for non-maps.
    pub fn get(&self, key: &str) -> Option<&Value> { self.as_map().and_then(|m| m.get(key)) }

    /// Convert a vendor JSON document into a dict-shaped value.
    pub fn from_json(v: serde_json::Value) -> Self {
        match v {
            serde_json::Value::Null => Value::Null,
            serde_json::Value::Bool(b) => Value::Bool(b),
            serde_json::Value::Number(n) => match n.as_i64() {
                Some(i) => Value::Int(i),
                None => Value::Float(n.as_f64().unwrap_or_default()),
            },
            serde_json::Value::String(s) => Value::String(s),
            serde_json::Value::Array(a) => Value::Array(a.into_iter().map(Value::from_json).collect()),
            serde_json::Value::Object(o) => Value::Map(o.into_iter().map(|(k, v)| (k, Value::from_json(v))).collect()),
        }
    }

    /// Plain JSON rendering (resources render as their identity).
    pub fn to_json(&self) -> serde_json::Value {
        match self {
            Value::Null => serde_json::Value::Null,
            Value::Bool(b) => serde_json::Value::Bool(*b),
            Value::Int(i) => serde_json::Value::from(*i),
            Value::Float(f) => serde_json::Value::from(*f),
            Value::String(s) => serde_json::Value::String(s.clone()),
            Value::Time(t) => serde_json::Value::from(*t),
            Value::Array(a) => serde_json::Value::Array(a.iter().map(Value::to_json).collect()),
            Value::Map(m) => serde_json::Value::Object(m.iter().map(|(k, v)| (k.clone(), v.to_json())).collect()),
            Value::Resource(r) => serde_json::Value::String(r.to_string()),
        }
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self { Value::String(s.to_string()) }
}
impl From<String> for Value {
    fn from(s: String) -> Self { Value::String(s) }
}
impl From<bool> for Value {
    fn from(b: bool) -> Self { Value::Bool(b) }
}
impl From<i64> for Value {
    fn from(i: i64) -> Self { Value::Int(i) }
}
impl From<ResourceId> for Value {
    fn from(r: ResourceId) -> Self { Value::Resource(r) }
}
impl<T: Into<Value>> From<Vec<T>> for Value {
    fn from(v: Vec<T>) -> Self { Value::Array(v.into_iter().map(Into::into).collect()) }
}

/// Named constructor arguments.
pub type Args = BTreeMap<String, Value>;

/// Read an optional string argument. Any other type is an argument error.
pub fn arg_str<'a>(args: &'a Args, key: &str) -> Result<Option<&'a str>> {
    match args.get(key) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(s)) => Ok(Some(s.as_str())),
        Some(other) => Err(QuarryError::misconfigured(format!("argument '{key}' must be a string, got {other:?}"))),
    }
}

/// Like [`arg_str`], treating the empty string as absent.
pub fn arg_nonempty<'a>(args: &'a Args, key: &str) -> Result<Option<&'a str>> {
    Ok(arg_str(args, key)?.filter(|s| !s.is_empty()))
}

/// Identity of the asset currently being scanned, used when a resource is
/// requested without any lookup argument ("the pod this scan targets").
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct AmbientIdentity {
    pub name: String,
    pub namespace: String,
}

impl AmbientIdentity {
    /// Parse a `/`-separated platform identifier. The last segment is the name
    /// and the fourth segment from the end, when present, the namespace.
    pub fn from_platform_id(platform_id: &str) -> Option<Self> {
        let parts: Vec<&str> = platform_id.split('/').collect();
        let name = parts.last().copied().unwrap_or_default();
        if name.is_empty() { return None; }
        let namespace = if parts.len() >= 4 { parts[parts.len() - 4] } else { "" };
        Some(Self { name: name.to_string(), namespace: namespace.to_string() })
    }
}

pub mod prelude {
    pub use super::{arg_nonempty, arg_str, AmbientIdentity, Args, QuarryError, ResourceId, Result, Value};
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn platform_id_yields_name_and_namespace() {
        let id = "//platformid.api.mondoo.app/runtime/k8s/uid/1234/namespace/default/pods/name/mondoo";
        let amb = AmbientIdentity::from_platform_id(id).unwrap();
        assert_eq!(amb.name, "mondoo");
        assert_eq!(amb.namespace, "default");

        let short = AmbientIdentity::from_platform_id("nodes/worker-1").unwrap();
        assert_eq!(short.name, "worker-1");
        assert_eq!(short.namespace, "");

        assert!(AmbientIdentity::from_platform_id("trailing/").is_none());
    }

    #[test]
    fn arg_str_rejects_wrong_types() {
        let args = Args::from([("name".to_string(), Value::from("x")), ("id".to_string(), Value::Int(3))]);
        assert_eq!(arg_str(&args, "name").unwrap(), Some("x"));
        assert_eq!(arg_str(&args, "missing").unwrap(), None);
        assert!(matches!(arg_str(&args, "id"), Err(QuarryError::MisconfiguredArguments(_))));
    }

    #[test]
    fn json_conversion_keeps_shape() {
        let json = serde_json::json!({"containers": [{"name": "app", "ports": [80]}], "nodeName": "n1"});
        let v = Value::from_json(json.clone());
        assert_eq!(v.get("nodeName").and_then(Value::as_str), Some("n1"));
        assert_eq!(v.get("containers").and_then(Value::as_array).map(|a| a.len()), Some(1));
        assert_eq!(v.to_json(), json);
    }

    #[test]
    fn cache_key_round_trips() {
        let rid = ResourceId::new("k8s.pod", "pod:default:mondoo");
        assert_eq!(ResourceId::from_cache_key(&rid.cache_key()), Some(rid));
    }
}
