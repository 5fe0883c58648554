#![forbid(unsafe_code)]

use std::sync::{Arc, Mutex};
use std::time::Duration;

use quarry_core::{Args, Value};
use quarry_os::{register, StaticKernel};
use quarry_store::{Registry, Runtime, RuntimeConfig};

fn runtime() -> Runtime {
    let mut registry = Registry::new();
    register(&mut registry, Arc::new(StaticKernel::default()));
    Runtime::new(registry, RuntimeConfig::default())
}

fn file_args(path: &std::path::Path) -> Args {
    Args::from([("path".to_string(), Value::from(path.to_string_lossy().into_owned()))])
}

async fn eventually<F: Fn() -> bool>(check: F) -> bool {
    for _ in 0..100 {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    false
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn content_follows_writes_on_disk() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("motd");
    std::fs::write(&path, "V1").unwrap();

    let rt = runtime();
    let file = rt.create_resource("file", file_args(&path)).await.unwrap();
    assert_eq!(rt.field(&file, "content").await.unwrap(), Value::from("V1"));
    assert_eq!(rt.field(&file, "empty").await.unwrap(), Value::Bool(false));

    let seen = Arc::new(Mutex::new(Vec::new()));
    let s = seen.clone();
    rt.watch_and_update(&file, "content", "query-1", Arc::new(move |v| s.lock().unwrap().push(v))).await.unwrap();
    assert_eq!(seen.lock().unwrap().as_slice(), &[Ok(Value::from("V1"))]);

    std::fs::write(&path, "V2").unwrap();
    let s = seen.clone();
    assert!(eventually(move || s.lock().unwrap().last() == Some(&Ok(Value::from("V2")))).await);
    assert_eq!(rt.try_field(&file, "content").await.unwrap(), Value::from("V2"));

    std::fs::remove_file(&path).unwrap();
    let s = seen.clone();
    assert!(eventually(move || s.lock().unwrap().last().is_some_and(|v| v.as_ref().is_err_and(|e| e.is_not_found()))).await);
    rt.unwatch(&file, "content", "query-1");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn missing_file_reports_not_found_and_does_not_exist() {
    let dir = tempfile::tempdir().unwrap();
    let rt = runtime();
    let file = rt.create_resource("file", file_args(&dir.path().join("absent"))).await.unwrap();
    assert_eq!(rt.field(&file, "exists").await.unwrap(), Value::Bool(false));
    assert!(rt.field(&file, "content").await.unwrap_err().is_not_found());
    assert!(rt.field(&file, "size").await.unwrap_err().is_not_found());
    assert_eq!(rt.field(&file, "basename").await.unwrap(), Value::from("absent"));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn one_stat_answers_size_and_permissions() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("hosts");
    std::fs::write(&path, "127.0.0.1 localhost\n").unwrap();

    let rt = runtime();
    let file = rt.create_resource("file", file_args(&path)).await.unwrap();
    assert!(file.cache().load("permissions").is_none());
    assert_eq!(rt.field(&file, "size").await.unwrap(), Value::Int(20));
    let primed = file.cache().load("permissions").expect("permissions primed by size");
    assert_eq!(primed.data.get("isFile"), Some(&Value::Bool(true)));
    assert_eq!(rt.field(&file, "permissions").await.unwrap(), primed.data);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn file_needs_a_path() {
    let rt = runtime();
    let err = rt.create_resource("file", Args::new()).await.unwrap_err();
    assert!(err.to_string().contains("needs a path"), "{err}");
}
