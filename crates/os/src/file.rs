//! The `file` resource.

use std::collections::BTreeMap;
use std::io::ErrorKind;
use std::path::Path;
use std::sync::Arc;

use quarry_core::{arg_nonempty, Args, QuarryError, Result, Value};
use quarry_store::{
    CacheEntry, Change, ChangeSink, ChangeSource, FieldClass, Resource, ResourceSchema, Runtime, Subscription, WatchTarget,
};

use crate::fswatch::FsChangeSource;

fn path_of(res: &Resource) -> Result<String> {
    match res.arg("path") {
        Some(Value::String(p)) if !p.is_empty() => Ok(p),
        _ => Err(QuarryError::misconfigured("file needs a path")),
    }
}

pub(crate) fn file_schema(fs: Arc<FsChangeSource>) -> ResourceSchema {
    ResourceSchema::new("file")
        .identity(|args: &Args| {
            arg_nonempty(args, "path")?
                .map(str::to_string)
                .ok_or_else(|| QuarryError::misconfigured("file needs a path"))
        })
        .arg_field("path")
        .field("basename", FieldClass::Static, |_, res| async move {
            let path = path_of(&res)?;
            Ok(Value::from(Path::new(&path).file_name().map(|n| n.to_string_lossy().into_owned()).unwrap_or_default()))
        })
        .field("dirname", FieldClass::Static, |_, res| async move {
            let path = path_of(&res)?;
            Ok(Value::from(Path::new(&path).parent().map(|p| p.to_string_lossy().into_owned()).unwrap_or_default()))
        })
        .field("exists", FieldClass::Transient, |_, res| async move {
            let path = path_of(&res)?;
            match tokio::fs::metadata(&path).await {
                Ok(_) => Ok(Value::Bool(true)),
                Err(e) if e.kind() == ErrorKind::NotFound => Ok(Value::Bool(false)),
                Err(e) => Err(QuarryError::io(format!("stat '{path}': {e}"))),
            }
        })
        .watched("empty", {
            let source = Arc::new(EmptinessSource(Arc::clone(&fs)));
            move |_, res| Ok(WatchTarget { source: source.clone(), key: path_of(res)? })
        })
        .watched("content", move |_, res| {
            Ok(WatchTarget { source: fs.clone(), key: path_of(res)? })
        })
        .field("size", FieldClass::Transient, |rt, res| stat_field(rt, res, "size"))
        .field("permissions", FieldClass::Transient, |rt, res| stat_field(rt, res, "permissions"))
}

/// `empty` follows the same notifications as `content`.
struct EmptinessSource(Arc<FsChangeSource>);

impl ChangeSource for EmptinessSource {
    fn subscribe(&self, key: &str, sink: ChangeSink) -> Result<Subscription> {
        self.0.subscribe(
            key,
            Arc::new(move |change: Change| {
                sink(match change {
                    Change::Value(v) => Change::Value(Value::Bool(v.as_str().is_some_and(str::is_empty))),
                    other => other,
                })
            }),
        )
    }
}

/// One `stat` answers both `size` and `permissions`; the sibling is primed.
async fn stat_field(_rt: Runtime, res: Arc<Resource>, field: &'static str) -> Result<Value> {
    let path = path_of(&res)?;
    let meta = match tokio::fs::metadata(&path).await {
        Ok(meta) => meta,
        Err(e) if e.kind() == ErrorKind::NotFound => {
            return Err(QuarryError::not_found(format!("file '{path}' does not exist")))
        }
        Err(e) => return Err(QuarryError::io(format!("stat '{path}': {e}"))),
    };
    let size = Value::Int(i64::try_from(meta.len()).unwrap_or(i64::MAX));
    let permissions = permissions_value(&meta);
    let (own, sibling, sibling_value) = match field {
        "size" => (size, "permissions", permissions),
        _ => (permissions, "size", size),
    };
    res.cache().prime(sibling, CacheEntry::value(sibling_value));
    Ok(own)
}

#[cfg(unix)]
fn permissions_value(meta: &std::fs::Metadata) -> Value {
    use std::os::unix::fs::PermissionsExt;
    let mode = meta.permissions().mode();
    let bit = |shift: u32| Value::Bool(mode & (1 << shift) != 0);
    let mut m = BTreeMap::new();
    m.insert("mode".to_string(), Value::Int(i64::from(mode & 0o7777)));
    m.insert("user_readable".to_string(), bit(8));
    m.insert("user_writeable".to_string(), bit(7));
    m.insert("user_executable".to_string(), bit(6));
    m.insert("group_readable".to_string(), bit(5));
    m.insert("group_writeable".to_string(), bit(4));
    m.insert("group_executable".to_string(), bit(3));
    m.insert("other_readable".to_string(), bit(2));
    m.insert("other_writeable".to_string(), bit(1));
    m.insert("other_executable".to_string(), bit(0));
    m.insert("isFile".to_string(), Value::Bool(meta.is_file()));
    m.insert("isDirectory".to_string(), Value::Bool(meta.is_dir()));
    Value::Map(m)
}

#[cfg(not(unix))]
fn permissions_value(meta: &std::fs::Metadata) -> Value {
    let mut m = BTreeMap::new();
    m.insert("readonly".to_string(), Value::Bool(meta.permissions().readonly()));
    m.insert("isFile".to_string(), Value::Bool(meta.is_file()));
    m.insert("isDirectory".to_string(), Value::Bool(meta.is_dir()));
    Value::Map(m)
}
