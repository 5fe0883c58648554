//! Filesystem change source backed by `notify`.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};

use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use quarry_core::{QuarryError, Result, Value};
use quarry_store::{Change, ChangeSink, ChangeSource, Subscription};
use tracing::{debug, trace, warn};

/// Watches single files. Each subscription watches the file's parent
/// directory so that creation and removal are seen too.
#[derive(Debug, Default, Clone)]
pub struct FsChangeSource;

impl FsChangeSource {
    pub fn new() -> Self { Self }
}

/// Current content of `path` as a change.
pub fn read_change(path: &Path) -> Change {
    match std::fs::read(path) {
        Ok(bytes) => Change::Value(Value::String(String::from_utf8_lossy(&bytes).into_owned())),
        Err(e) if e.kind() == ErrorKind::NotFound => Change::Missing(format!("file '{}' does not exist", path.display())),
        Err(e) => Change::Failed(QuarryError::io(format!("reading '{}': {e}", path.display()))),
    }
}

fn touches(event: &Event, path: &Path) -> bool {
    if matches!(event.kind, EventKind::Access(_)) {
        return false;
    }
    event.paths.is_empty() || event.paths.iter().any(|p| p == path)
}

impl ChangeSource for FsChangeSource {
    fn subscribe(&self, key: &str, sink: ChangeSink) -> Result<Subscription> {
        let path = PathBuf::from(key);
        let Some(parent) = path.parent().filter(|p| p.is_dir()).map(Path::to_path_buf) else {
            debug!(path = %path.display(), "parent directory missing; not watching");
            sink(read_change(&path));
            return Ok(Subscription::noop());
        };

        // events carry canonical absolute paths
        let parent = parent.canonicalize().unwrap_or(parent);
        let target = match path.file_name() {
            Some(name) => parent.join(name),
            None => path.clone(),
        };
        // one read-and-deliver at a time, so the last delivery is the newest read
        let gate = Arc::new(Mutex::new(()));
        let deliver = {
            let gate = Arc::clone(&gate);
            let target = target.clone();
            move || {
                let _turn = gate.lock().unwrap_or_else(PoisonError::into_inner);
                sink(read_change(&target));
            }
        };
        let on_event = deliver.clone();
        let mut watcher: RecommendedWatcher = notify::recommended_watcher(move |res: notify::Result<Event>| match res {
            Ok(event) if touches(&event, &target) => {
                trace!(path = %target.display(), kind = ?event.kind, "file event");
                on_event();
            }
            Ok(_) => {}
            Err(err) => warn!(path = %target.display(), error = %err, "file watch error"),
        })
        .map_err(|e| QuarryError::io(format!("creating file watcher: {e}")))?;
        watcher
            .watch(&parent, RecursiveMode::NonRecursive)
            .map_err(|e| QuarryError::io(format!("watching '{}': {e}", parent.display())))?;
        debug!(path = %path.display(), "file watch started");

        // read only once the watch is live so no write falls in between
        deliver();

        Ok(Subscription::new(move || {
            debug!(path = %path.display(), "file watch released");
            drop(watcher);
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn read_change_maps_missing_files() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("motd");
        assert!(matches!(read_change(&path), Change::Missing(msg) if msg.contains("does not exist")));
        std::fs::write(&path, "welcome").unwrap();
        assert_eq!(read_change(&path), Change::Value(Value::from("welcome")));
    }

    #[test]
    fn write_right_after_first_read_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("motd");
        std::fs::write(&path, "V1").unwrap();

        let seen = Arc::new(Mutex::new(Vec::new()));
        let s = seen.clone();
        let writer_path = path.clone();
        let _sub = FsChangeSource::new()
            .subscribe(
                path.to_str().unwrap(),
                Arc::new(move |change| {
                    let mut seen = s.lock().unwrap();
                    if seen.is_empty() {
                        std::fs::write(&writer_path, "V2").unwrap();
                    }
                    seen.push(change);
                }),
            )
            .unwrap();

        assert_eq!(seen.lock().unwrap()[0], Change::Value(Value::from("V1")));
        let deadline = std::time::Instant::now() + std::time::Duration::from_secs(5);
        while seen.lock().unwrap().last() != Some(&Change::Value(Value::from("V2"))) {
            assert!(std::time::Instant::now() < deadline, "second write never reported: {:?}", seen.lock().unwrap());
            std::thread::sleep(std::time::Duration::from_millis(20));
        }
    }
}
