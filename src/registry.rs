//! Connection Registry: fleet of open SQLite connections keyed by
//! (group, lib), spec.md §4.3 and the locking discipline of §5.

use crate::errors::{AppError, AppResult};
use crate::schema::{load_or_rescan, probe_schema, PhysicalSchema, UnionSchema};
use log::{debug, info};
use rusqlite::Connection;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};

struct OpenDb {
    conn: Connection,
    schema: PhysicalSchema,
}

struct GroupState {
    libs: BTreeMap<String, OpenDb>,
}

/// `group -> lib -> connection`, guarded by a single read-write lock per
/// spec.md §5: openers/closers take the write half, query issuers the
/// read half.
pub struct ConnectionRegistry {
    root: PathBuf,
    groups: RwLock<BTreeMap<String, GroupState>>,
}

/// A read-only snapshot of one group's open connections, taken under the
/// read lock and safe to fan a query out across without holding the lock.
pub struct GroupSnapshot {
    pub libs: Vec<String>,
}

impl ConnectionRegistry {
    pub fn new(root: impl Into<PathBuf>) -> Arc<Self> {
        Arc::new(Self {
            root: root.into(),
            groups: RwLock::new(BTreeMap::new()),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Open (or reopen) `<root>/<group>/<lib>.db`, installing it under
    /// `groups[group][lib]`. Rejects any path not shaped like that.
    pub fn open(&self, group: &str, lib: &str) -> AppResult<()> {
        let path = self.db_path(group, lib);
        let conn = Connection::open(&path)?;
        conn.busy_timeout(std::time::Duration::from_millis(5000))?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "foreign_keys", "ON")?;
        // Liveness ping.
        conn.execute_batch("SELECT 1")?;

        let schema = probe_schema(&conn)?;
        let mut groups = self.groups.write().map_err(|_| AppError::internal("registry lock poisoned"))?;
        let entry = groups.entry(group.to_string()).or_insert_with(|| GroupState {
            libs: BTreeMap::new(),
        });
        entry.libs.insert(lib.to_string(), OpenDb { conn, schema });
        info!("opened connection group={group} lib={lib}");
        Ok(())
    }

    /// Remove `lib` from `group`; if the group becomes empty, drop the
    /// group entry entirely (its union-cache entry is dropped by the
    /// caller, which owns the cache file lifecycle).
    pub fn close(&self, group: &str, lib: &str) -> AppResult<()> {
        let mut groups = self.groups.write().map_err(|_| AppError::internal("registry lock poisoned"))?;
        if let Some(state) = groups.get_mut(group) {
            state.libs.remove(lib);
            info!("closed connection group={group} lib={lib}");
            if state.libs.is_empty() {
                groups.remove(group);
                debug!("group {group} has no open libs, dropped");
            }
        }
        Ok(())
    }

    /// Names of every lib currently open in `group`, in ascending order.
    pub fn snapshot(&self, group: &str) -> AppResult<GroupSnapshot> {
        let groups = self.groups.read().map_err(|_| AppError::internal("registry lock poisoned"))?;
        let libs = groups
            .get(group)
            .map(|s| s.libs.keys().cloned().collect())
            .unwrap_or_default();
        Ok(GroupSnapshot { libs })
    }

    /// Run `f` with the raw connection for `(group, lib)`, holding the
    /// registry's read lock only long enough to look it up; the closure
    /// itself runs against a connection that cannot be closed out from
    /// under it because the read lock is held for the whole call.
    pub fn with_connection<T>(
        &self,
        group: &str,
        lib: &str,
        f: impl FnOnce(&Connection) -> AppResult<T>,
    ) -> AppResult<T> {
        let groups = self.groups.read().map_err(|_| AppError::internal("registry lock poisoned"))?;
        let state = groups.get(group).ok_or_else(|| AppError::Unavailable {
            group: group.to_string(),
            lib: lib.to_string(),
            reason: "group not open".to_string(),
        })?;
        let db = state.libs.get(lib).ok_or_else(|| AppError::Unavailable {
            group: group.to_string(),
            lib: lib.to_string(),
            reason: "lib not open".to_string(),
        })?;
        f(&db.conn)
    }

    /// Whether `lib`'s physical schema contains `table`.
    pub fn has_table(&self, group: &str, lib: &str, table: &str) -> bool {
        self.groups
            .read()
            .ok()
            .and_then(|groups| {
                groups
                    .get(group)
                    .and_then(|s| s.libs.get(lib))
                    .map(|db| db.schema.tables.contains_key(table))
            })
            .unwrap_or(false)
    }

    /// Recompute (or load) the union schema for `group` and persist it.
    pub fn refresh_union_cache(&self, group: &str) -> AppResult<UnionSchema> {
        let physical = {
            let groups = self.groups.read().map_err(|_| AppError::internal("registry lock poisoned"))?;
            groups
                .get(group)
                .map(|s| {
                    s.libs
                        .iter()
                        .map(|(lib, db)| (lib.clone(), db.schema.clone()))
                        .collect::<BTreeMap<_, _>>()
                })
                .unwrap_or_default()
        };
        let group_dir = self.root.join(group);
        std::fs::create_dir_all(&group_dir)?;
        let union = UnionSchema::compute(&physical);
        union.persist(&group_dir)?;
        Ok(union)
    }

    /// Load the cached union schema, falling back to a rescan of currently
    /// open connections on any read/parse error.
    pub fn union_schema(&self, group: &str) -> AppResult<UnionSchema> {
        let physical = {
            let groups = self.groups.read().map_err(|_| AppError::internal("registry lock poisoned"))?;
            groups
                .get(group)
                .map(|s| {
                    s.libs
                        .iter()
                        .map(|(lib, db)| (lib.clone(), db.schema.clone()))
                        .collect::<BTreeMap<_, _>>()
                })
                .unwrap_or_default()
        };
        let group_dir = self.root.join(group);
        load_or_rescan(&group_dir, &physical)
    }

    fn db_path(&self, group: &str, lib: &str) -> PathBuf {
        self.root.join(group).join(format!("{lib}.db"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry_with_db(group: &str, lib: &str) -> (Arc<ConnectionRegistry>, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join(group)).unwrap();
        let db_path = dir.path().join(group).join(format!("{lib}.db"));
        let conn = Connection::open(&db_path).unwrap();
        conn.execute_batch("CREATE TABLE t (id INTEGER PRIMARY KEY, name TEXT);")
            .unwrap();
        drop(conn);
        let registry = ConnectionRegistry::new(dir.path());
        (registry, dir)
    }

    #[test]
    fn open_installs_under_group_and_lib() {
        let (registry, _dir) = registry_with_db("bizA", "db1");
        registry.open("bizA", "db1").unwrap();
        let snap = registry.snapshot("bizA").unwrap();
        assert_eq!(snap.libs, vec!["db1".to_string()]);
        assert!(registry.has_table("bizA", "db1", "t"));
    }

    #[test]
    fn close_drops_empty_group() {
        let (registry, _dir) = registry_with_db("bizA", "db1");
        registry.open("bizA", "db1").unwrap();
        registry.close("bizA", "db1").unwrap();
        let snap = registry.snapshot("bizA").unwrap();
        assert!(snap.libs.is_empty());
    }

    #[test]
    fn with_connection_errors_on_unopened_lib() {
        let (registry, _dir) = registry_with_db("bizA", "db1");
        let err = registry
            .with_connection("bizA", "db1", |_| Ok(()))
            .unwrap_err();
        assert!(matches!(err, AppError::Unavailable { .. }));
    }

    #[test]
    fn union_schema_falls_back_to_rescan_when_cache_absent() {
        let (registry, _dir) = registry_with_db("bizA", "db1");
        registry.open("bizA", "db1").unwrap();
        let union = registry.union_schema("bizA").unwrap();
        assert_eq!(union.tables["t"], vec!["id".to_string(), "name".to_string()]);
    }
}
