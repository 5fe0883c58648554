use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{ArgAction, Parser, Subcommand, ValueEnum};
use quarry_core::{AmbientIdentity, Args, Value};
use quarry_kubehub::{K8sKind, K8sSource, LiveSource, ManifestSource};
use quarry_os::ProcKernel;
use quarry_persist::SqliteArchive;
use quarry_store::{Registry, Resource, Runtime, RuntimeConfig};
use tokio::signal;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "quarryctl", version, about = "Query resource fields from manifests, a live cluster or this host")]
struct Cli {
    /// Output format
    #[arg(short = 'o', long = "output", value_enum, global = true, default_value_t = Output::Human)]
    output: Output,

    /// Kubernetes manifest file or directory to scan offline
    #[arg(long = "manifest", global = true, env = "QUARRY_MANIFEST")]
    manifest: Option<PathBuf>,

    /// Scan the cluster of the current kubeconfig context
    #[arg(long = "live", global = true, action = ArgAction::SetTrue)]
    live: bool,

    /// Restrict live listings to one namespace
    #[arg(long = "ns", global = true)]
    namespace: Option<String>,

    /// Platform id of the scanned asset, used when a lookup names nothing
    #[arg(long = "target", global = true, env = "QUARRY_TARGET")]
    target: Option<String>,

    /// Log filter, in `tracing` env-filter syntax; logs go to stderr
    #[arg(long = "log", global = true, env = "QUARRY_LOG", default_value = "info")]
    log: String,

    /// Serve Prometheus metrics on this address while the command runs
    #[arg(long = "metrics-addr", global = true, env = "QUARRY_METRICS_ADDR")]
    metrics_addr: Option<SocketAddr>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum Output { Human, Json }

#[derive(Subcommand, Debug)]
enum Commands {
    /// Create a resource and print some of its fields
    Get {
        /// Resource type, e.g. "k8s.pod", "kernel.module"
        type_name: String,
        /// Constructor argument: `key=text` or `key:=json`
        #[arg(long = "arg", value_parser = parse_arg)]
        args: Vec<(String, Value)>,
        /// Field to print (repeatable)
        #[arg(long = "field", required = true)]
        fields: Vec<String>,
        /// Keep printing the first field as it changes
        #[arg(long = "follow", action = ArgAction::SetTrue)]
        follow: bool,
    },
    /// Print a field of a file
    File {
        path: PathBuf,
        #[arg(long = "field", default_value = "content")]
        field: String,
        /// Keep printing the field as the file changes
        #[arg(long = "follow", action = ArgAction::SetTrue)]
        follow: bool,
    },
    /// List registered resource types
    Types,
    /// Save or restore a resource archive
    Archive {
        /// SQLite file (default: ~/.quarry/quarry.db)
        #[arg(long = "db", env = "QUARRY_DB_PATH")]
        db: Option<String>,
        #[command(subcommand)]
        action: ArchiveAction,
    },
}

#[derive(Subcommand, Debug, Clone, Copy)]
enum ArchiveAction {
    /// List every kube kind from the source and archive the result
    Save,
    /// Rebuild archived resources and print their identities
    Restore,
}

fn parse_arg(raw: &str) -> Result<(String, Value), String> {
    if let Some((key, json)) = raw.split_once(":=") {
        let v: serde_json::Value = serde_json::from_str(json).map_err(|e| format!("argument '{key}': {e}"))?;
        return Ok((key.to_string(), Value::from_json(v)));
    }
    match raw.split_once('=') {
        Some((key, text)) if !key.is_empty() => Ok((key.to_string(), Value::from(text))),
        _ => Err(format!("expected key=value, got '{raw}'")),
    }
}

fn init_tracing(filter: &str) {
    let filter = EnvFilter::from_str(filter).unwrap_or_else(|e| {
        eprintln!("invalid log filter '{filter}': {e}; using info");
        EnvFilter::new("info")
    });
    tracing_subscriber::fmt().with_env_filter(filter).with_target(true).with_writer(std::io::stderr).init();
}

fn init_metrics(addr: Option<SocketAddr>) {
    let Some(addr) = addr else { return };
    match metrics_exporter_prometheus::PrometheusBuilder::new().with_http_listener(addr).install() {
        Ok(()) => info!(%addr, "Prometheus metrics exporter listening"),
        Err(e) => warn!(%addr, error = %e, "failed to install metrics exporter"),
    }
}

struct Session {
    rt: Runtime,
    live: Option<Arc<LiveSource>>,
}

async fn open_session(cli: &Cli) -> Result<Session> {
    let live = if cli.live { Some(Arc::new(LiveSource::try_default(cli.namespace.clone()).await?)) } else { None };
    let source: Arc<dyn K8sSource> = match (&live, &cli.manifest) {
        (Some(live), _) => Arc::clone(live) as Arc<dyn K8sSource>,
        (None, Some(path)) => Arc::new(ManifestSource::from_path(path)?),
        (None, None) => Arc::new(ManifestSource::empty("none")),
    };
    info!(source = %source.describe(), "k8s source");

    let mut registry = Registry::new();
    quarry_kubehub::register(&mut registry, source);
    quarry_os::register(&mut registry, Arc::new(ProcKernel::default()));
    let ambient = cli.target.as_deref().and_then(AmbientIdentity::from_platform_id);
    let rt = Runtime::for_target(registry, RuntimeConfig::from_env(), ambient);
    Ok(Session { rt, live })
}

fn render_human(value: &Value) -> String {
    match value {
        Value::Null => "null".to_string(),
        Value::String(s) => s.clone(),
        Value::Resource(id) => id.to_string(),
        Value::Array(items) if items.iter().all(|v| matches!(v, Value::Resource(_))) => {
            let ids: Vec<String> = items.iter().map(render_human).collect();
            format!("[{}]", ids.join(", "))
        }
        other => other.to_json().to_string(),
    }
}

fn print_fields(output: Output, res: &Resource, results: Vec<(String, quarry_core::Result<Value>)>) -> Result<()> {
    match output {
        Output::Human => {
            println!("{}", res.id());
            for (field, result) in results {
                match result {
                    Ok(v) => println!("  {field}: {}", render_human(&v)),
                    Err(e) => println!("  {field}: error: {e}"),
                }
            }
        }
        Output::Json => {
            let fields: serde_json::Map<String, serde_json::Value> = results
                .into_iter()
                .map(|(field, result)| {
                    let v = match result {
                        Ok(v) => v.to_json(),
                        Err(e) => serde_json::json!({ "error": e.to_string() }),
                    };
                    (field, v)
                })
                .collect();
            let doc = serde_json::json!({ "resource": res.id().to_string(), "fields": fields });
            println!("{}", serde_json::to_string_pretty(&doc)?);
        }
    }
    Ok(())
}

/// Print every value of `field` until Ctrl-C.
async fn follow(session: &Session, res: &Arc<Resource>, field: &str, output: Output) -> Result<()> {
    let tasks = match &session.live {
        Some(live) => quarry_kubehub::spawn_live_invalidation(session.rt.clone(), Arc::clone(live), &K8sKind::ALL),
        None => Vec::new(),
    };
    let label = field.to_string();
    session
        .rt
        .watch_and_update(
            res,
            field,
            "quarryctl",
            Arc::new(move |update: quarry_core::Result<Value>| match (output, update) {
                (Output::Human, Ok(v)) => println!("{label}: {}", render_human(&v)),
                (Output::Human, Err(e)) => println!("{label}: error: {e}"),
                (Output::Json, Ok(v)) => println!("{}", serde_json::json!({ "field": label, "value": v.to_json() })),
                (Output::Json, Err(e)) => println!("{}", serde_json::json!({ "field": label, "error": e.to_string() })),
            }),
        )
        .await?;
    signal::ctrl_c().await.context("waiting for Ctrl-C")?;
    info!("Ctrl-C received; stopping");
    session.rt.unregister_watcher("quarryctl");
    for task in tasks {
        task.abort();
    }
    Ok(())
}

async fn get_fields(session: &Session, res: &Arc<Resource>, fields: &[String]) -> Vec<(String, quarry_core::Result<Value>)> {
    let mut results = Vec::with_capacity(fields.len());
    for field in fields {
        results.push((field.clone(), session.rt.field(res, field).await));
    }
    results
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(&cli.log);
    init_metrics(cli.metrics_addr);

    match &cli.command {
        Commands::Get { type_name, args, fields, follow: keep } => {
            let session = open_session(&cli).await?;
            let args: Args = args.iter().cloned().collect();
            info!(resource = %type_name, args = args.len(), "get invoked");
            let res = session.rt.create_resource(type_name, args).await?;
            if *keep {
                follow(&session, &res, &fields[0], cli.output).await?;
            } else {
                let results = get_fields(&session, &res, fields).await;
                print_fields(cli.output, &res, results)?;
            }
        }
        Commands::File { path, field, follow: keep } => {
            let session = open_session(&cli).await?;
            let path = if path.is_absolute() { path.clone() } else { std::env::current_dir()?.join(path) };
            let args = Args::from([("path".to_string(), Value::from(path.to_string_lossy().into_owned()))]);
            let res = session.rt.create_resource("file", args).await?;
            if *keep {
                follow(&session, &res, field, cli.output).await?;
            } else {
                let results = get_fields(&session, &res, std::slice::from_ref(field)).await;
                print_fields(cli.output, &res, results)?;
            }
        }
        Commands::Types => {
            let session = open_session(&cli).await?;
            let mut names = session.rt.registry().type_names();
            names.sort_unstable();
            match cli.output {
                Output::Human => names.iter().for_each(|n| println!("{n}")),
                Output::Json => println!("{}", serde_json::to_string_pretty(&names)?),
            }
        }
        Commands::Archive { db, action } => {
            let session = open_session(&cli).await?;
            let archive = match db {
                Some(path) => SqliteArchive::open(path)?,
                None => SqliteArchive::open_default()?,
            };
            match action {
                ArchiveAction::Save => {
                    let root = session.rt.create_resource(quarry_kubehub::ROOT, Args::new()).await?;
                    for kind in K8sKind::ALL {
                        if let Err(e) = session.rt.field(&root, kind.plural()).await {
                            warn!(kind = kind.kind(), error = %e, "listing failed; not archived");
                        }
                    }
                    let count = quarry_persist::save(&session.rt, &archive)?;
                    println!("archived {count} resources");
                }
                ArchiveAction::Restore => {
                    let count = quarry_persist::restore(&session.rt, &archive).await?;
                    match cli.output {
                        Output::Human => {
                            for res in session.rt.resources() {
                                println!("{}", res.id());
                            }
                            println!("restored {count} resources");
                        }
                        Output::Json => {
                            let ids: Vec<String> = session.rt.resources().iter().map(|r| r.id().to_string()).collect();
                            println!("{}", serde_json::to_string_pretty(&ids)?);
                        }
                    }
                }
            }
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_text_and_json_args() {
        assert_eq!(parse_arg("name=mondoo").unwrap(), ("name".to_string(), Value::from("mondoo")));
        assert_eq!(parse_arg("size:=42").unwrap(), ("size".to_string(), Value::Int(42)));
        assert_eq!(parse_arg("path=/a=b").unwrap(), ("path".to_string(), Value::from("/a=b")));
        assert!(parse_arg("novalue").is_err());
        assert!(parse_arg("=x").is_err());
    }

    #[test]
    fn metrics_address_is_a_global_flag() {
        let cli = Cli::try_parse_from(["quarryctl", "types", "--metrics-addr", "127.0.0.1:9184", "--log", "quarry_store=debug"]).unwrap();
        assert_eq!(cli.metrics_addr, Some("127.0.0.1:9184".parse().unwrap()));
        assert_eq!(cli.log, "quarry_store=debug");
        assert!(Cli::try_parse_from(["quarryctl", "types", "--metrics-addr", "localhost"]).is_err());
    }

    #[test]
    fn human_rendering_lists_resources_by_identity() {
        let list = Value::Array(vec![Value::Resource(quarry_core::ResourceId::new("k8s.container", "pod:default:mondoo/client"))]);
        assert_eq!(render_human(&list), "[k8s.container id = pod:default:mondoo/client]");
        assert_eq!(render_human(&Value::Int(3)), "3");
    }
}
