//! In-memory admin stores and temp-directory fleets for tests.
//!
//! Schema bootstrap is out of scope for the shipped crate (spec.md §1 names
//! it as an external collaborator's responsibility), so the
//! `CREATE TABLE IF NOT EXISTS` statements live only here, not in
//! `admin::store`.

use crate::admin::AdminStore;
use crate::errors::AppResult;
use crate::registry::ConnectionRegistry;
use rusqlite::Connection;
use std::sync::Arc;

/// Create every admin-store table spec.md §6 names, for a fresh in-memory
/// or on-disk `AdminStore`.
pub fn bootstrap_admin_schema(store: &AdminStore) -> AppResult<()> {
    store.with_raw_connection(|conn| {
        conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS biz_overall_settings (
                biz_name TEXT PRIMARY KEY,
                is_publicly_searchable INTEGER NOT NULL DEFAULT 0,
                default_query_table TEXT
            );
            CREATE TABLE IF NOT EXISTS biz_searchable_tables (
                biz_name TEXT NOT NULL,
                table_name TEXT NOT NULL,
                is_searchable INTEGER NOT NULL DEFAULT 1,
                allow_create INTEGER NOT NULL DEFAULT 0,
                allow_update INTEGER NOT NULL DEFAULT 0,
                allow_delete INTEGER NOT NULL DEFAULT 0,
                PRIMARY KEY (biz_name, table_name),
                FOREIGN KEY (biz_name) REFERENCES biz_overall_settings(biz_name) ON DELETE CASCADE
            );
            CREATE TABLE IF NOT EXISTS biz_table_field_settings (
                biz_name TEXT NOT NULL,
                table_name TEXT NOT NULL,
                field_name TEXT NOT NULL,
                is_searchable INTEGER NOT NULL DEFAULT 0,
                is_returnable INTEGER NOT NULL DEFAULT 0,
                data_type TEXT NOT NULL DEFAULT 'string',
                PRIMARY KEY (biz_name, table_name, field_name)
            );
            CREATE TABLE IF NOT EXISTS biz_view_definitions (
                biz_name TEXT NOT NULL,
                table_name TEXT NOT NULL,
                view_name TEXT NOT NULL,
                view_config_json TEXT NOT NULL,
                is_default INTEGER NOT NULL DEFAULT 0,
                PRIMARY KEY (biz_name, table_name, view_name)
            );
            CREATE TABLE IF NOT EXISTS global_settings (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL,
                description TEXT,
                updated_at TEXT
            );
            INSERT OR IGNORE INTO global_settings (key, value, description)
                VALUES ('ip_rate_limit_per_minute', '60', 'default per-IP requests/minute');
            INSERT OR IGNORE INTO global_settings (key, value, description)
                VALUES ('ip_burst_size', '20', 'default per-IP burst');
            CREATE TABLE IF NOT EXISTS biz_ratelimit_settings (
                biz_name TEXT PRIMARY KEY,
                rate_limit_per_second REAL NOT NULL,
                burst_size INTEGER NOT NULL
            );
            CREATE TABLE IF NOT EXISTS installed_plugins (
                plugin_id TEXT NOT NULL,
                version TEXT NOT NULL,
                install_path TEXT NOT NULL,
                installed_at TEXT NOT NULL,
                PRIMARY KEY (plugin_id, version)
            );
            CREATE TABLE IF NOT EXISTS plugin_instances (
                instance_id TEXT PRIMARY KEY,
                display_name TEXT NOT NULL,
                plugin_id TEXT NOT NULL,
                version TEXT NOT NULL,
                biz_name TEXT NOT NULL UNIQUE,
                port INTEGER NOT NULL UNIQUE,
                status TEXT NOT NULL,
                enabled INTEGER NOT NULL DEFAULT 1,
                created_at TEXT NOT NULL,
                last_started_at TEXT
            );
            CREATE TABLE IF NOT EXISTS _user (
                id INTEGER PRIMARY KEY,
                username TEXT UNIQUE NOT NULL,
                password_hash TEXT NOT NULL,
                role TEXT NOT NULL,
                rate_limit_per_second REAL,
                burst_size INTEGER
            );
            ",
        )?;
        Ok(())
    })
}

/// A temp-directory fleet with `group/lib.db` files already populated
/// with the given table/rows, ready to be opened through a
/// `ConnectionRegistry`.
pub struct TempFleet {
    pub dir: tempfile::TempDir,
}

impl TempFleet {
    pub fn new() -> Self {
        Self {
            dir: tempfile::tempdir().expect("tempdir"),
        }
    }

    /// Create `<group>/<lib>.db` and run `setup_sql` against it.
    pub fn create_db(&self, group: &str, lib: &str, setup_sql: &str) {
        let group_dir = self.dir.path().join(group);
        std::fs::create_dir_all(&group_dir).unwrap();
        let conn = Connection::open(group_dir.join(format!("{lib}.db"))).unwrap();
        conn.execute_batch(setup_sql).unwrap();
    }

    pub fn registry(&self) -> Arc<ConnectionRegistry> {
        ConnectionRegistry::new(self.dir.path())
    }
}

impl Default for TempFleet {
    fn default() -> Self {
        Self::new()
    }
}
