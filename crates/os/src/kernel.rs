//! `kernel` and `kernel.module` resources.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use async_trait::async_trait;
use quarry_core::{arg_nonempty, Args, QuarryError, Result, Value};
use quarry_store::{resource_list, CollectionIndex, FieldClass, IndexKey, InitOutcome, ResourceSchema, Runtime};
use tracing::debug;

pub const KERNEL: &str = "kernel";
pub const MODULE: &str = "kernel.module";

/// One line of the loaded module table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModuleEntry {
    pub name: String,
    pub size: i64,
}

/// Where kernel facts come from.
#[async_trait]
pub trait KernelSource: Send + Sync {
    async fn modules(&self) -> anyhow::Result<Vec<ModuleEntry>>;
    async fn release(&self) -> anyhow::Result<String>;
}

/// Reads `/proc` below a configurable root.
#[derive(Debug, Clone)]
pub struct ProcKernel {
    root: PathBuf,
}

impl Default for ProcKernel {
    fn default() -> Self { Self { root: PathBuf::from("/") } }
}

impl ProcKernel {
    pub fn with_root(root: impl Into<PathBuf>) -> Self { Self { root: root.into() } }
}

#[async_trait]
impl KernelSource for ProcKernel {
    async fn modules(&self) -> anyhow::Result<Vec<ModuleEntry>> {
        let path = self.root.join("proc/modules");
        let text = tokio::fs::read_to_string(&path).await.with_context(|| format!("reading {}", path.display()))?;
        Ok(parse_modules(&text))
    }

    async fn release(&self) -> anyhow::Result<String> {
        let path = self.root.join("proc/sys/kernel/osrelease");
        let text = tokio::fs::read_to_string(&path).await.with_context(|| format!("reading {}", path.display()))?;
        Ok(text.trim().to_string())
    }
}

/// Fixed facts, for offline targets and tests.
#[derive(Debug, Clone, Default)]
pub struct StaticKernel {
    pub modules: Vec<ModuleEntry>,
    pub release: String,
}

#[async_trait]
impl KernelSource for StaticKernel {
    async fn modules(&self) -> anyhow::Result<Vec<ModuleEntry>> { Ok(self.modules.clone()) }
    async fn release(&self) -> anyhow::Result<String> { Ok(self.release.clone()) }
}

/// Parse `/proc/modules`: `name size refcount deps state address`.
/// Lines without a numeric size are skipped.
pub fn parse_modules(text: &str) -> Vec<ModuleEntry> {
    text.lines()
        .filter_map(|line| {
            let mut cols = line.split_whitespace();
            let name = cols.next()?;
            let size = cols.next()?.parse().ok()?;
            Some(ModuleEntry { name: name.to_string(), size })
        })
        .collect()
}

pub(crate) fn kernel_schema(source: Arc<dyn KernelSource>) -> ResourceSchema {
    let release_source = Arc::clone(&source);
    ResourceSchema::new(KERNEL)
        .field("modules", FieldClass::Transient, move |rt, _| {
            let source = Arc::clone(&source);
            async move {
                let entries = source.modules().await?;
                let mut items = Vec::with_capacity(entries.len());
                for entry in entries {
                    let args = Args::from([
                        ("name".to_string(), Value::from(entry.name)),
                        ("size".to_string(), Value::Int(entry.size)),
                        ("loaded".to_string(), Value::Bool(true)),
                    ]);
                    items.push(rt.create_resource(MODULE, args).await?);
                }
                debug!(count = items.len(), "kernel modules listed");
                Ok(resource_list(&items))
            }
        })
        .field("info", FieldClass::Transient, move |_, _| {
            let source = Arc::clone(&release_source);
            async move {
                let release = source.release().await?;
                Ok(Value::Map(BTreeMap::from([("release".to_string(), Value::from(release))])))
            }
        })
}

pub(crate) fn module_schema() -> ResourceSchema {
    ResourceSchema::new(MODULE)
        .identity(|args: &Args| {
            arg_nonempty(args, "name")?
                .map(str::to_string)
                .ok_or_else(|| QuarryError::misconfigured("kernel.module needs a name"))
        })
        .arg_field("name")
        .arg_field("size")
        .arg_field("loaded")
        .init(|rt, args| lookup_module(rt, args))
}

/// A name-only request is looked up in the loaded module table. Several
/// entries with one name are ambiguous whatever the runtime policy; an absent
/// module is a fresh unloaded instance.
async fn lookup_module(rt: Runtime, args: Args) -> Result<InitOutcome> {
    if args.len() > 1 {
        return Ok(InitOutcome::Construct(args));
    }
    let Some(name) = arg_nonempty(&args, "name")?.map(str::to_string) else {
        return Err(QuarryError::misconfigured("kernel.module needs a name"));
    };
    let kernel = rt.create_resource(KERNEL, Args::new()).await?;
    let listing = rt.collection(&kernel, "modules").await?;
    let index = kernel.collection_index("modules:byName", listing.generation, || {
        Ok(CollectionIndex::build(listing.generation, &listing.items, |m| {
            m.arg("name").and_then(|v| v.as_str().map(|n| vec![IndexKey::Name(n.to_string())])).unwrap_or_default()
        }))
    })?;
    match index.unique(&IndexKey::Name(name.clone()))? {
        Some(module) => Ok(InitOutcome::Existing(module)),
        None => {
            debug!(module = %name, "module not loaded");
            Ok(InitOutcome::Construct(Args::from([
                ("name".to_string(), Value::from(name)),
                ("size".to_string(), Value::Int(0)),
                ("loaded".to_string(), Value::Bool(false)),
            ])))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_proc_modules() {
        let text = "ext4 737280 1 mbcache,jbd2, Live 0xffffffffc0a1c000\n\
                    mbcache 16384 1 ext4, Live 0xffffffffc0a14000\n\
                    garbage\n";
        let mods = parse_modules(text);
        assert_eq!(mods, vec![
            ModuleEntry { name: "ext4".into(), size: 737280 },
            ModuleEntry { name: "mbcache".into(), size: 16384 },
        ]);
    }

    #[tokio::test]
    async fn proc_kernel_reads_below_root() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("proc/sys/kernel")).unwrap();
        std::fs::write(dir.path().join("proc/modules"), "loop 40960 0 - Live 0x0\n").unwrap();
        std::fs::write(dir.path().join("proc/sys/kernel/osrelease"), "6.8.0-45-generic\n").unwrap();
        let kernel = ProcKernel::with_root(dir.path());
        assert_eq!(kernel.modules().await.unwrap()[0].name, "loop");
        assert_eq!(kernel.release().await.unwrap(), "6.8.0-45-generic");
    }
}
