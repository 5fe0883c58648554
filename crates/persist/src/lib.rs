//! Quarry resource archive: a SQLite snapshot of live resources.
//!
//! Each row keeps a resource's constructor args as tagged JSON and, when its
//! type declares an [`InternalCodec`](quarry_store::InternalCodec), its
//! encoded internal payload. Restoring rebuilds the canonical instances without
//! touching the original source.

#![forbid(unsafe_code)]

use std::sync::{Mutex, PoisonError};

use anyhow::{Context, Result};
use metrics::{counter, histogram};
use quarry_core::{Args, ResourceId};
use quarry_store::Runtime;
use tracing::{debug, info, warn};

/// One archived resource.
#[derive(Debug, Clone, PartialEq)]
pub struct ArchivedResource {
    pub id: ResourceId,
    pub args: Args,
    pub internal: Option<Vec<u8>>,
}

pub trait Archive {
    fn put(&self, rec: &ArchivedResource) -> Result<()>;
    fn list(&self) -> Result<Vec<ArchivedResource>>;
}

/// SQLite-backed archive. Synchronous; callers are not latency sensitive.
pub struct SqliteArchive {
    db: Mutex<rusqlite::Connection>,
}

impl SqliteArchive {
    pub fn open_default() -> Result<Self> {
        let path = std::env::var("QUARRY_DB_PATH").unwrap_or_else(|_| default_db_path());
        Self::open(&path)
    }

    pub fn open(path: &str) -> Result<Self> {
        let started = std::time::Instant::now();
        let db = rusqlite::Connection::open(path).with_context(|| format!("opening sqlite db at {path}"))?;
        db.pragma_update(None, "journal_mode", "WAL").ok();
        db.pragma_update(None, "synchronous", "NORMAL").ok();
        db.execute(
            "CREATE TABLE IF NOT EXISTS resources (
                cache_key TEXT PRIMARY KEY,
                name      TEXT NOT NULL,
                res_id    TEXT NOT NULL,
                args      TEXT NOT NULL,
                internal  BLOB
            )",
            [],
        )
        .context("creating resources table")?;
        histogram!("archive_open_ms", started.elapsed().as_secs_f64() * 1000.0);
        Ok(Self { db: Mutex::new(db) })
    }

    /// Cache keys of every archived resource, sorted.
    pub fn keys(&self) -> Result<Vec<String>> {
        let db = self.db.lock().unwrap_or_else(PoisonError::into_inner);
        let mut stmt = db.prepare("SELECT cache_key FROM resources ORDER BY cache_key")?;
        let keys = stmt.query_map([], |row| row.get(0))?.collect::<rusqlite::Result<Vec<String>>>()?;
        Ok(keys)
    }
}

impl Archive for SqliteArchive {
    fn put(&self, rec: &ArchivedResource) -> Result<()> {
        let started = std::time::Instant::now();
        let args = args_to_json(&rec.args)?;
        let db = self.db.lock().unwrap_or_else(PoisonError::into_inner);
        db.execute(
            "INSERT INTO resources(cache_key, name, res_id, args, internal) VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT(cache_key) DO UPDATE SET args = excluded.args, internal = excluded.internal",
            (rec.id.cache_key(), &rec.id.type_name, &rec.id.id, args, rec.internal.as_deref()),
        )
        .with_context(|| format!("archiving {}", rec.id))?;
        histogram!("archive_put_ms", started.elapsed().as_secs_f64() * 1000.0);
        counter!("archive_put_total", 1u64);
        Ok(())
    }

    fn list(&self) -> Result<Vec<ArchivedResource>> {
        let db = self.db.lock().unwrap_or_else(PoisonError::into_inner);
        let mut stmt = db.prepare("SELECT name, res_id, args, internal FROM resources ORDER BY cache_key")?;
        let mut rows = stmt.query([])?;
        let mut out = Vec::new();
        while let Some(row) = rows.next()? {
            let name: String = row.get(0)?;
            let res_id: String = row.get(1)?;
            let args: String = row.get(2)?;
            let internal: Option<Vec<u8>> = row.get(3)?;
            out.push(ArchivedResource { id: ResourceId::new(name, res_id), args: args_from_json(&args)?, internal });
        }
        Ok(out)
    }
}

fn args_to_json(args: &Args) -> Result<String> { Ok(serde_json::to_string(args)?) }

fn args_from_json(text: &str) -> Result<Args> { serde_json::from_str(text).context("decoding archived args") }

/// Write every live resource of `rt` to `archive`. Returns the row count.
pub fn save(rt: &Runtime, archive: &dyn Archive) -> Result<usize> {
    let mut saved = 0;
    for res in rt.resources() {
        let schema = rt.registry().schema(res.type_name())?;
        let internal = match (schema.internal_codec(), res.internal_any()) {
            (Some(codec), Some(payload)) => Some(codec.encode(&*payload)?),
            _ => None,
        };
        archive.put(&ArchivedResource { id: res.id().clone(), args: res.args(), internal })?;
        saved += 1;
    }
    info!(count = saved, "resources archived");
    Ok(saved)
}

/// Rebuild archived resources in `rt`. Rows of unknown types are skipped.
pub async fn restore(rt: &Runtime, archive: &dyn Archive) -> Result<usize> {
    let mut restored = 0;
    for rec in archive.list()? {
        let schema = match rt.registry().schema(&rec.id.type_name) {
            Ok(schema) => schema,
            Err(err) => {
                warn!(resource = %rec.id, error = %err, "skipping archived resource");
                continue;
            }
        };
        let internal = match (schema.internal_codec(), rec.internal.as_deref()) {
            (Some(codec), Some(bytes)) => Some(codec.decode(bytes)?),
            _ => None,
        };
        let res = rt.create_resource_with(&rec.id.type_name, rec.args, internal).await?;
        if res.id() != &rec.id {
            warn!(archived = %rec.id, restored = %res.id(), "restored under a different identity");
        }
        debug!(resource = %res.id(), "resource restored");
        restored += 1;
    }
    info!(count = restored, "resources restored");
    Ok(restored)
}

fn default_db_path() -> String {
    if let Some(home) = std::env::var_os("HOME") {
        let mut p = std::path::PathBuf::from(home);
        p.push(".quarry");
        let _ = std::fs::create_dir_all(&p);
        p.push("quarry.db");
        return p.to_string_lossy().to_string();
    }
    "quarry.db".to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use quarry_core::Value;

    #[test]
    fn put_replaces_rows_by_identity() {
        let dir = tempfile::tempdir().unwrap();
        let archive = SqliteArchive::open(dir.path().join("a.db").to_str().unwrap()).unwrap();
        let id = ResourceId::new("file", "/etc/hosts");
        let mut rec = ArchivedResource {
            id: id.clone(),
            args: Args::from([("path".to_string(), Value::from("/etc/hosts"))]),
            internal: None,
        };
        archive.put(&rec).unwrap();
        rec.internal = Some(b"{}".to_vec());
        archive.put(&rec).unwrap();

        let rows = archive.list().unwrap();
        assert_eq!(rows, vec![rec]);
        assert_eq!(archive.keys().unwrap(), vec![id.cache_key()]);
    }
}
