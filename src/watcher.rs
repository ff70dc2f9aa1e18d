//! Filesystem watcher: debounced create/modify/delete events on `.db`
//! files, spec.md §4.4.
//!
//! Uses `notify` for native OS events and a hand-rolled per-path debounce
//! map (spec.md §9: "a map of cancellation handles keyed by path with a
//! single dispatcher task") rather than a debouncing wrapper crate, since
//! the fleet's edge cases (file vanished before the debounce fires) need
//! direct control over the cancel-and-reschedule step.

use crate::registry::ConnectionRegistry;
use log::{info, warn};
use notify::{Event, RecommendedWatcher, RecursiveMode, Watcher};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::task::JoinHandle;

type DebounceMap = Arc<Mutex<HashMap<PathBuf, JoinHandle<()>>>>;

/// Owns the OS watch handle and the debounce dispatcher task. Dropping
/// this stops watching; the dispatcher task holds its own `Arc` clones so
/// it keeps running until the channel closes.
pub struct FleetWatcher {
    _watcher: RecommendedWatcher,
    debounced: DebounceMap,
}

impl FleetWatcher {
    /// Start watching `registry.root()` recursively and spawn the single
    /// dispatcher task that debounces and applies events.
    pub fn start(registry: Arc<ConnectionRegistry>, debounce: Duration) -> notify::Result<Self> {
        let (tx, rx) = tokio::sync::mpsc::unbounded_channel();
        let mut watcher = notify::recommended_watcher(move |res: notify::Result<Event>| {
            if let Ok(event) = res {
                let _ = tx.send(event);
            }
        })?;
        watcher.watch(registry.root(), RecursiveMode::Recursive)?;

        let debounced: DebounceMap = Arc::new(Mutex::new(HashMap::new()));
        spawn_dispatcher(rx, registry, debounced.clone(), debounce);

        Ok(Self {
            _watcher: watcher,
            debounced,
        })
    }

    /// Number of paths currently awaiting their debounce window, exposed
    /// for tests.
    pub fn pending_count(&self) -> usize {
        self.debounced.lock().map(|m| m.len()).unwrap_or(0)
    }
}

fn spawn_dispatcher(
    mut rx: UnboundedReceiver<Event>,
    registry: Arc<ConnectionRegistry>,
    debounced: DebounceMap,
    debounce: Duration,
) {
    tokio::spawn(async move {
        while let Some(event) = rx.recv().await {
            for path in event.paths {
                if !is_db_path(&registry, &path) {
                    continue;
                }
                schedule_debounced(path, &registry, &debounced, debounce);
            }
        }
    });
}

fn schedule_debounced(
    path: PathBuf,
    registry: &Arc<ConnectionRegistry>,
    debounced: &DebounceMap,
    debounce: Duration,
) {
    let registry = registry.clone();
    let debounced_for_task = debounced.clone();
    let path_for_task = path.clone();
    let handle = tokio::spawn(async move {
        tokio::time::sleep(debounce).await;
        apply_event(&path_for_task, &registry).await;
        if let Ok(mut map) = debounced_for_task.lock() {
            map.remove(&path_for_task);
        }
    });

    if let Ok(mut map) = debounced.lock() {
        if let Some(previous) = map.insert(path, handle) {
            previous.abort();
        }
    }
}

async fn apply_event(path: &Path, registry: &Arc<ConnectionRegistry>) {
    let Some((group, lib)) = group_and_lib(registry.root(), path) else {
        return;
    };

    if path.exists() {
        let _ = registry.close(&group, &lib);
        match registry.open(&group, &lib) {
            Ok(()) => info!("reloaded db group={group} lib={lib}"),
            Err(e) => warn!("failed to reopen db group={group} lib={lib}: {e}"),
        }
    } else {
        let _ = registry.close(&group, &lib);
        info!("db removed group={group} lib={lib}");
    }

    if let Err(e) = registry.refresh_union_cache(&group) {
        warn!("failed to refresh union cache for group={group}: {e}");
    }
}

fn is_db_path(registry: &ConnectionRegistry, path: &Path) -> bool {
    group_and_lib(registry.root(), path).is_some()
}

/// A path qualifies only if it is exactly `<root>/<group>/<lib>.db`.
fn group_and_lib(root: &Path, path: &Path) -> Option<(String, String)> {
    let relative = path.strip_prefix(root).ok()?;
    let mut components = relative.components();
    let group = components.next()?.as_os_str().to_str()?.to_string();
    let file = components.next()?.as_os_str().to_str()?.to_string();
    if components.next().is_some() {
        return None;
    }
    if path.extension().and_then(|e| e.to_str()) != Some("db") {
        return None;
    }
    let lib = file.strip_suffix(".db")?.to_string();
    Some((group, lib))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn group_and_lib_accepts_depth_one_db_files() {
        let root = Path::new("/fleet");
        let path = Path::new("/fleet/bizA/db1.db");
        assert_eq!(
            group_and_lib(root, path),
            Some(("bizA".to_string(), "db1".to_string()))
        );
    }

    #[test]
    fn group_and_lib_rejects_nested_or_non_db_paths() {
        let root = Path::new("/fleet");
        assert_eq!(group_and_lib(root, Path::new("/fleet/bizA/schema_cache.json")), None);
        assert_eq!(group_and_lib(root, Path::new("/fleet/bizA/nested/db1.db")), None);
        assert_eq!(group_and_lib(root, Path::new("/fleet/db1.db")), None);
    }
}
