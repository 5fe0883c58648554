#![forbid(unsafe_code)]

use std::sync::{Arc, Mutex};
use std::time::Duration;

use quarry_core::{Args, QuarryError, Value};
use quarry_store::{Change, ChannelSource, Registry, ResourceSchema, Runtime, RuntimeConfig, WatchState, WatchTarget};

fn feed_registry(source: ChannelSource) -> Registry {
    let mut reg = Registry::new();
    reg.register(ResourceSchema::new("feed").arg_field("id").watched("content", move |_, res| {
        let key = res.id().id.clone();
        Ok(WatchTarget { source: Arc::new(source.clone()), key })
    }));
    reg
}

fn feed_args(id: &str) -> Args { Args::from([("id".to_string(), Value::from(id))]) }

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn watched_field_follows_source_and_notifies_once_per_change() {
    let source = ChannelSource::new();
    let rt = Runtime::new(feed_registry(source.clone()), RuntimeConfig::default());
    let feed = rt.create_resource("feed", feed_args("motd")).await.unwrap();

    // nothing published yet
    assert_eq!(rt.try_field(&feed, "content").await, Err(QuarryError::NotReady));
    assert_eq!(rt.watches().state(&feed.field_uid("content")), Some(WatchState::Pending));

    let seen = Arc::new(Mutex::new(Vec::new()));
    let s = seen.clone();
    rt.watch_and_update(&feed, "content", "query-1", Arc::new(move |v| s.lock().unwrap().push(v))).await.unwrap();
    assert!(seen.lock().unwrap().is_empty());

    source.publish("motd", Change::Value("V1".into()));
    source.publish("motd", Change::Value("V1".into()));
    source.publish("motd", Change::Value("V2".into()));
    assert_eq!(rt.watches().state(&feed.field_uid("content")), Some(WatchState::Active));
    assert_eq!(rt.try_field(&feed, "content").await.unwrap(), Value::from("V2"));
    assert_eq!(seen.lock().unwrap().as_slice(), &[Ok(Value::from("V1")), Ok(Value::from("V2"))]);

    source.publish("motd", Change::Missing("file 'motd' does not exist".into()));
    assert!(rt.try_field(&feed, "content").await.unwrap_err().is_not_found());
    assert_eq!(seen.lock().unwrap().len(), 3);

    // last watcher leaving releases the subscription and drops the entry
    rt.unwatch(&feed, "content", "query-1");
    assert_eq!(source.subscriber_count("motd"), 0);
    assert!(feed.cache().load("content").is_none());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn field_awaits_first_report() {
    let source = ChannelSource::new();
    let rt = Runtime::new(feed_registry(source.clone()), RuntimeConfig::default());
    let feed = rt.create_resource("feed", feed_args("hosts")).await.unwrap();

    let publisher = source.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(30)).await;
        publisher.publish("hosts", Change::Value("127.0.0.1 localhost".into()));
    });
    let value = rt.field(&feed, "content").await.unwrap();
    assert_eq!(value, Value::from("127.0.0.1 localhost"));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn readiness_wait_is_bounded() {
    let cfg = RuntimeConfig { ready_wait: Duration::from_millis(40), ..RuntimeConfig::default() };
    let rt = Runtime::new(feed_registry(ChannelSource::new()), cfg);
    let feed = rt.create_resource("feed", feed_args("never")).await.unwrap();
    let err = rt.field(&feed, "content").await.unwrap_err();
    assert!(matches!(err, QuarryError::Timeout { .. }));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn unregister_releases_watches() {
    let source = ChannelSource::new();
    let rt = Runtime::new(feed_registry(source.clone()), RuntimeConfig::default());
    let feed = rt.create_resource("feed", feed_args("issue")).await.unwrap();
    source.publish("issue", Change::Value("Ubuntu".into()));
    assert_eq!(rt.field(&feed, "content").await.unwrap(), Value::from("Ubuntu"));
    assert_eq!(source.subscriber_count("issue"), 1);

    assert!(rt.unregister(feed.id()));
    assert_eq!(source.subscriber_count("issue"), 0);
    assert!(rt.get_resource(feed.id()).is_none());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn watched_error_is_not_redelivered_after_error_ttl() {
    let source = ChannelSource::new();
    let cfg = RuntimeConfig { transient_error_ttl: Some(Duration::from_millis(50)), ..RuntimeConfig::default() };
    let rt = Runtime::new(feed_registry(source.clone()), cfg);
    let feed = rt.create_resource("feed", feed_args("gone")).await.unwrap();
    source.publish("gone", Change::Missing("gone".into()));

    let seen = Arc::new(Mutex::new(Vec::new()));
    let s = seen.clone();
    rt.watch_and_update(&feed, "content", "query-1", Arc::new(move |v| s.lock().unwrap().push(v))).await.unwrap();
    tokio::time::sleep(Duration::from_millis(120)).await;
    assert!(rt.try_field(&feed, "content").await.unwrap_err().is_not_found());
    assert_eq!(seen.lock().unwrap().len(), 1);
    assert_eq!(source.subscriber_count("gone"), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn refreshing_a_watched_field_notifies_only_on_change() {
    let source = ChannelSource::new();
    let rt = Runtime::new(feed_registry(source.clone()), RuntimeConfig::default());
    let feed = rt.create_resource("feed", feed_args("motd")).await.unwrap();
    source.publish("motd", Change::Value("V1".into()));

    let seen = Arc::new(Mutex::new(Vec::new()));
    let s = seen.clone();
    rt.watch_and_update(&feed, "content", "query-1", Arc::new(move |v| s.lock().unwrap().push(v))).await.unwrap();
    let generation = feed.cache().load("content").unwrap().generation;

    for _ in 0..3 {
        assert_eq!(rt.refresh_field(&feed, "content").await.unwrap(), Value::from("V1"));
    }
    assert_eq!(feed.cache().load("content").unwrap().generation, generation);
    assert_eq!(seen.lock().unwrap().len(), 1);
    assert_eq!(source.subscriber_count("motd"), 1);

    // one hook per watch: leaving releases the resubscribed source
    rt.unwatch(&feed, "content", "query-1");
    assert_eq!(source.subscriber_count("motd"), 0);
    assert!(!rt.observers().has_unwatch_hook(&feed.field_uid("content")));
}
