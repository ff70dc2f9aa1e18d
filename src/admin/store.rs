//! Admin store queries against the tables of spec.md §6.
//!
//! Schema bootstrap itself is out of scope (an external collaborator's
//! responsibility per spec.md §1); this module only reads and writes rows
//! in tables it assumes already exist. Test fixtures create them with
//! `CREATE TABLE IF NOT EXISTS` for in-process testing only.

use super::models::{
    BizQueryConfig, DataType, FieldSetting, GroupSettings, RateLimitSetting, TableConfig,
    UserRateLimitOverride, ViewConfig, ViewType,
};
use crate::errors::AppResult;
use log::warn;
use rusqlite::{params, Connection, OptionalExtension};
use std::collections::HashMap;
use std::sync::Mutex;

/// Thin synchronous wrapper around the admin database connection. One
/// connection guarded by a mutex is enough: the admin store is small and
/// every call is a handful of indexed lookups, unlike the fleet's
/// per-database connections which are genuinely fanned out in parallel.
pub struct AdminStore {
    conn: Mutex<Connection>,
}

impl AdminStore {
    pub fn open(path: &str) -> AppResult<Self> {
        let conn = Connection::open(path)?;
        conn.pragma_update(None, "foreign_keys", "ON")?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    pub fn open_in_memory() -> AppResult<Self> {
        let conn = Connection::open_in_memory()?;
        conn.pragma_update(None, "foreign_keys", "ON")?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Escape hatch for test fixtures that need to run arbitrary DDL
    /// (schema bootstrap) against the underlying connection.
    #[doc(hidden)]
    pub fn with_raw_connection<T>(&self, f: impl FnOnce(&Connection) -> AppResult<T>) -> AppResult<T> {
        f(&self.lock())
    }

    /// Loader contract, spec.md §4.5: a missing group returns `Ok(None)`,
    /// not an error. Per-table/per-field subquery failures are logged and
    /// omitted rather than failing the whole load.
    pub fn load_group_config(&self, group: &str) -> AppResult<Option<BizQueryConfig>> {
        let conn = self.lock();
        let Some(settings) = Self::group_settings(&conn, group)? else {
            return Ok(None);
        };
        let tables = Self::table_configs(&conn, group).unwrap_or_else(|e| {
            warn!("failed loading table configs for group={group}: {e}");
            HashMap::new()
        });
        let views = Self::views(&conn, group).unwrap_or_else(|e| {
            warn!("failed loading views for group={group}: {e}");
            Vec::new()
        });
        let rate_limit = Self::group_rate_limit(&conn, group).unwrap_or_else(|e| {
            warn!("failed loading rate limit for group={group}: {e}");
            None
        });
        Ok(Some(BizQueryConfig {
            group: settings,
            tables,
            views,
            rate_limit,
        }))
    }

    pub fn list_groups(&self) -> AppResult<Vec<String>> {
        let conn = self.lock();
        let mut stmt = conn.prepare("SELECT biz_name FROM biz_overall_settings ORDER BY biz_name")?;
        let rows = stmt
            .query_map([], |row| row.get::<_, String>(0))?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    pub fn set_publicity(&self, group: &str, is_publicly_searchable: bool) -> AppResult<()> {
        let conn = self.lock();
        conn.execute(
            "INSERT INTO biz_overall_settings (biz_name, is_publicly_searchable, default_query_table)
             VALUES (?1, ?2, NULL)
             ON CONFLICT(biz_name) DO UPDATE SET is_publicly_searchable = ?2",
            params![group, is_publicly_searchable],
        )?;
        Ok(())
    }

    pub fn set_default_table(&self, group: &str, table: Option<&str>) -> AppResult<()> {
        let conn = self.lock();
        conn.execute(
            "INSERT INTO biz_overall_settings (biz_name, is_publicly_searchable, default_query_table)
             VALUES (?1, 0, ?2)
             ON CONFLICT(biz_name) DO UPDATE SET default_query_table = ?2",
            params![group, table],
        )?;
        Ok(())
    }

    /// Replace every searchable-table row for `group` in one transaction;
    /// commits only after every insert succeeds, spec.md §4.5.
    pub fn replace_searchable_tables(&self, group: &str, tables: &[TableConfig]) -> AppResult<()> {
        let mut conn = self.lock();
        let tx = conn.transaction()?;
        tx.execute(
            "DELETE FROM biz_searchable_tables WHERE biz_name = ?1",
            params![group],
        )?;
        for t in tables {
            tx.execute(
                "INSERT INTO biz_searchable_tables
                    (biz_name, table_name, is_searchable, allow_create, allow_update, allow_delete)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    group,
                    t.table_name,
                    t.is_searchable,
                    t.allow_create,
                    t.allow_update,
                    t.allow_delete
                ],
            )?;
        }
        tx.commit()?;
        Ok(())
    }

    pub fn set_write_permissions(
        &self,
        group: &str,
        table: &str,
        allow_create: bool,
        allow_update: bool,
        allow_delete: bool,
    ) -> AppResult<()> {
        let conn = self.lock();
        conn.execute(
            "UPDATE biz_searchable_tables
             SET allow_create = ?3, allow_update = ?4, allow_delete = ?5
             WHERE biz_name = ?1 AND table_name = ?2",
            params![group, table, allow_create, allow_update, allow_delete],
        )?;
        Ok(())
    }

    /// Replace every field setting for `(group, table)` in one transaction.
    pub fn replace_field_settings(
        &self,
        group: &str,
        table: &str,
        fields: &[FieldSetting],
    ) -> AppResult<()> {
        let mut conn = self.lock();
        let tx = conn.transaction()?;
        tx.execute(
            "DELETE FROM biz_table_field_settings WHERE biz_name = ?1 AND table_name = ?2",
            params![group, table],
        )?;
        for f in fields {
            tx.execute(
                "INSERT INTO biz_table_field_settings
                    (biz_name, table_name, field_name, is_searchable, is_returnable, data_type)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    group,
                    table,
                    f.field_name,
                    f.is_searchable,
                    f.is_returnable,
                    data_type_str(f.data_type)
                ],
            )?;
        }
        tx.commit()?;
        Ok(())
    }

    pub fn upsert_view(&self, group: &str, table: &str, view: &ViewConfig) -> AppResult<()> {
        let conn = self.lock();
        let binding_json = serde_json::to_string(&view.binding)?;
        conn.execute(
            "INSERT INTO biz_view_definitions
                (biz_name, table_name, view_name, view_config_json, is_default)
             VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT(biz_name, table_name, view_name)
             DO UPDATE SET view_config_json = ?4, is_default = ?5",
            params![group, table, view.view_name, binding_json, view.is_default],
        )?;
        Ok(())
    }

    pub fn delete_view(&self, group: &str, table: &str, view_name: &str) -> AppResult<()> {
        let conn = self.lock();
        conn.execute(
            "DELETE FROM biz_view_definitions WHERE biz_name = ?1 AND table_name = ?2 AND view_name = ?3",
            params![group, table, view_name],
        )?;
        Ok(())
    }

    pub fn set_group_rate_limit(&self, group: &str, setting: RateLimitSetting) -> AppResult<()> {
        let conn = self.lock();
        conn.execute(
            "INSERT INTO biz_ratelimit_settings (biz_name, rate_limit_per_second, burst_size)
             VALUES (?1, ?2, ?3)
             ON CONFLICT(biz_name) DO UPDATE SET rate_limit_per_second = ?2, burst_size = ?3",
            params![group, setting.rate_per_second, setting.burst],
        )?;
        Ok(())
    }

    pub fn global_rate_limit(&self) -> AppResult<RateLimitSetting> {
        let conn = self.lock();
        let per_minute: f64 = global_setting_f64(&conn, "ip_rate_limit_per_minute", 60.0)?;
        let burst: u32 = global_setting_f64(&conn, "ip_burst_size", 20.0)? as u32;
        Ok(RateLimitSetting {
            rate_per_second: per_minute / 60.0,
            burst,
        })
    }

    pub fn user_rate_limit_override(&self, user_id: i64) -> AppResult<UserRateLimitOverride> {
        let conn = self.lock();
        conn.query_row(
            "SELECT rate_limit_per_second, burst_size FROM _user WHERE id = ?1",
            params![user_id],
            |row| {
                Ok(UserRateLimitOverride {
                    rate_per_second: row.get(0)?,
                    burst: row.get(1)?,
                })
            },
        )
        .optional()
        .map(|o| o.unwrap_or_default())
        .map_err(Into::into)
    }

    pub fn set_user_rate_limit(&self, user_id: i64, over: UserRateLimitOverride) -> AppResult<()> {
        let conn = self.lock();
        conn.execute(
            "UPDATE _user SET rate_limit_per_second = ?2, burst_size = ?3 WHERE id = ?1",
            params![user_id, over.rate_per_second, over.burst],
        )?;
        Ok(())
    }

    /// Upsert an `installed_plugins` row after a successful extract.
    pub fn record_plugin_install(&self, plugin_id: &str, version: &str, install_path: &str) -> AppResult<()> {
        let conn = self.lock();
        conn.execute(
            "INSERT INTO installed_plugins (plugin_id, version, install_path, installed_at)
             VALUES (?1, ?2, ?3, datetime('now'))
             ON CONFLICT(plugin_id, version) DO UPDATE SET install_path = ?3, installed_at = datetime('now')",
            params![plugin_id, version, install_path],
        )?;
        Ok(())
    }

    pub fn install_path(&self, plugin_id: &str, version: &str) -> AppResult<Option<String>> {
        let conn = self.lock();
        conn.query_row(
            "SELECT install_path FROM installed_plugins WHERE plugin_id = ?1 AND version = ?2",
            params![plugin_id, version],
            |row| row.get(0),
        )
        .optional()
        .map_err(Into::into)
    }

    /// Insert a new `STOPPED` instance row. Rejects a duplicate `biz_name`
    /// via the table's own UNIQUE constraint (surfaced as a `Database`
    /// error by the `From<rusqlite::Error>` impl).
    pub fn create_plugin_instance(&self, instance: &super::models::PluginInstanceRow) -> AppResult<()> {
        let conn = self.lock();
        conn.execute(
            "INSERT INTO plugin_instances
                (instance_id, display_name, plugin_id, version, biz_name, port, status, enabled, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, 'STOPPED', 1, datetime('now'))",
            params![
                instance.instance_id,
                instance.display_name,
                instance.plugin_id,
                instance.version,
                instance.biz_name,
                instance.port,
            ],
        )?;
        Ok(())
    }

    pub fn set_instance_status(&self, instance_id: &str, status: &str) -> AppResult<()> {
        let conn = self.lock();
        let touched_started_at = status == "RUNNING";
        if touched_started_at {
            conn.execute(
                "UPDATE plugin_instances SET status = ?2, last_started_at = datetime('now') WHERE instance_id = ?1",
                params![instance_id, status],
            )?;
        } else {
            conn.execute(
                "UPDATE plugin_instances SET status = ?2 WHERE instance_id = ?1",
                params![instance_id, status],
            )?;
        }
        Ok(())
    }

    pub fn get_instance(&self, instance_id: &str) -> AppResult<Option<super::models::PluginInstanceRow>> {
        let conn = self.lock();
        conn.query_row(
            "SELECT instance_id, display_name, plugin_id, version, biz_name, port
             FROM plugin_instances WHERE instance_id = ?1",
            params![instance_id],
            |row| {
                Ok(super::models::PluginInstanceRow {
                    instance_id: row.get(0)?,
                    display_name: row.get(1)?,
                    plugin_id: row.get(2)?,
                    version: row.get(3)?,
                    biz_name: row.get(4)?,
                    port: row.get::<_, i64>(5)? as u16,
                })
            },
        )
        .optional()
        .map_err(Into::into)
    }

    pub fn instance_status(&self, instance_id: &str) -> AppResult<Option<String>> {
        let conn = self.lock();
        conn.query_row(
            "SELECT status FROM plugin_instances WHERE instance_id = ?1",
            params![instance_id],
            |row| row.get(0),
        )
        .optional()
        .map_err(Into::into)
    }

    /// Delete an instance row; caller (the supervisor) is responsible for
    /// enforcing the STOPPED-only deletion rule before calling this.
    pub fn delete_instance(&self, instance_id: &str) -> AppResult<()> {
        let conn = self.lock();
        conn.execute(
            "DELETE FROM plugin_instances WHERE instance_id = ?1",
            params![instance_id],
        )?;
        Ok(())
    }

    fn group_settings(conn: &Connection, group: &str) -> AppResult<Option<GroupSettings>> {
        conn.query_row(
            "SELECT is_publicly_searchable, default_query_table FROM biz_overall_settings WHERE biz_name = ?1",
            params![group],
            |row| {
                Ok(GroupSettings {
                    is_publicly_searchable: row.get(0)?,
                    default_query_table: row.get(1)?,
                })
            },
        )
        .optional()
        .map_err(Into::into)
    }

    fn table_configs(conn: &Connection, group: &str) -> AppResult<HashMap<String, TableConfig>> {
        let mut stmt = conn.prepare(
            "SELECT table_name, is_searchable, allow_create, allow_update, allow_delete
             FROM biz_searchable_tables WHERE biz_name = ?1",
        )?;
        let mut tables = HashMap::new();
        let rows = stmt.query_map(params![group], |row| {
            Ok(TableConfig {
                table_name: row.get(0)?,
                is_searchable: row.get(1)?,
                allow_create: row.get(2)?,
                allow_update: row.get(3)?,
                allow_delete: row.get(4)?,
                fields: HashMap::new(),
            })
        })?;
        for table in rows {
            let mut table = table?;
            table.fields = Self::field_settings(conn, group, &table.table_name)?;
            tables.insert(table.table_name.clone(), table);
        }
        Ok(tables)
    }

    fn field_settings(
        conn: &Connection,
        group: &str,
        table: &str,
    ) -> AppResult<HashMap<String, FieldSetting>> {
        let mut stmt = conn.prepare(
            "SELECT field_name, is_searchable, is_returnable, data_type
             FROM biz_table_field_settings WHERE biz_name = ?1 AND table_name = ?2",
        )?;
        let rows = stmt.query_map(params![group, table], |row| {
            let data_type: Option<String> = row.get(3)?;
            Ok(FieldSetting {
                field_name: row.get(0)?,
                is_searchable: row.get(1)?,
                is_returnable: row.get(2)?,
                data_type: parse_data_type(data_type.as_deref()),
            })
        })?;
        let mut fields = HashMap::new();
        for f in rows {
            let f = f?;
            fields.insert(f.field_name.clone(), f);
        }
        Ok(fields)
    }

    fn views(conn: &Connection, group: &str) -> AppResult<Vec<ViewConfig>> {
        let mut stmt = conn.prepare(
            "SELECT view_name, view_config_json, is_default
             FROM biz_view_definitions WHERE biz_name = ?1",
        )?;
        let rows = stmt.query_map(params![group], |row| {
            let view_name: String = row.get(0)?;
            let json: String = row.get(1)?;
            let is_default: bool = row.get(2)?;
            Ok((view_name, json, is_default))
        })?;
        let mut views = Vec::new();
        for row in rows {
            let (view_name, json, is_default) = row?;
            let parsed: serde_json::Value = match serde_json::from_str(&json) {
                Ok(v) => v,
                Err(e) => {
                    warn!("failed to parse view config for {group}/{view_name}: {e}");
                    continue;
                }
            };
            let view_type = parsed
                .get("view_type")
                .and_then(|v| v.as_str())
                .and_then(parse_view_type)
                .unwrap_or(ViewType::Table);
            let display_name = parsed
                .get("display_name")
                .and_then(|v| v.as_str())
                .unwrap_or(&view_name)
                .to_string();
            views.push(ViewConfig {
                view_name,
                view_type,
                display_name,
                is_default,
                binding: parsed.get("binding").cloned().unwrap_or(serde_json::Value::Null),
            });
        }
        Ok(views)
    }

    fn group_rate_limit(conn: &Connection, group: &str) -> AppResult<Option<RateLimitSetting>> {
        conn.query_row(
            "SELECT rate_limit_per_second, burst_size FROM biz_ratelimit_settings WHERE biz_name = ?1",
            params![group],
            |row| {
                Ok(RateLimitSetting {
                    rate_per_second: row.get(0)?,
                    burst: row.get(1)?,
                })
            },
        )
        .optional()
        .map_err(Into::into)
    }
}

fn global_setting_f64(conn: &Connection, key: &str, default: f64) -> AppResult<f64> {
    let value: Option<String> = conn
        .query_row(
            "SELECT value FROM global_settings WHERE key = ?1",
            params![key],
            |row| row.get(0),
        )
        .optional()?;
    Ok(value.and_then(|v| v.parse().ok()).unwrap_or(default))
}

fn data_type_str(dt: DataType) -> &'static str {
    match dt {
        DataType::String => "string",
        DataType::Number => "number",
        DataType::Date => "date",
        DataType::Boolean => "boolean",
    }
}

fn parse_data_type(value: Option<&str>) -> DataType {
    match value {
        Some("number") => DataType::Number,
        Some("date") => DataType::Date,
        Some("boolean") => DataType::Boolean,
        _ => DataType::String,
    }
}

fn parse_view_type(value: &str) -> Option<ViewType> {
    match value {
        "cards" => Some(ViewType::Cards),
        "table" => Some(ViewType::Table),
        "list" => Some(ViewType::List),
        "kanban" => Some(ViewType::Kanban),
        "calendar" => Some(ViewType::Calendar),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_fixtures::bootstrap_admin_schema;

    fn store() -> AdminStore {
        let store = AdminStore::open_in_memory().unwrap();
        bootstrap_admin_schema(&store).unwrap();
        store
    }

    #[test]
    fn missing_group_returns_none_not_error() {
        let store = store();
        assert!(store.load_group_config("missing").unwrap().is_none());
    }

    #[test]
    fn round_trips_group_settings_and_tables() {
        let store = store();
        store.set_publicity("bizA", true).unwrap();
        store.set_default_table("bizA", Some("t")).unwrap();
        let table = TableConfig {
            table_name: "t".to_string(),
            is_searchable: true,
            allow_create: true,
            allow_update: false,
            allow_delete: false,
            fields: HashMap::new(),
        };
        store.replace_searchable_tables("bizA", &[table]).unwrap();
        let field = FieldSetting {
            field_name: "name".to_string(),
            is_searchable: true,
            is_returnable: true,
            data_type: DataType::String,
        };
        store.replace_field_settings("bizA", "t", &[field]).unwrap();

        let cfg = store.load_group_config("bizA").unwrap().unwrap();
        assert!(cfg.group.is_publicly_searchable);
        assert_eq!(cfg.group.default_query_table.as_deref(), Some("t"));
        let t = cfg.table("t").unwrap();
        assert!(t.allow_create);
        assert!(t.is_field_returnable("name"));
    }

    #[test]
    fn global_rate_limit_falls_back_to_documented_defaults() {
        let store = store();
        let limit = store.global_rate_limit().unwrap();
        assert_eq!(limit.burst, 20);
        assert!((limit.rate_per_second - 1.0).abs() < 1e-9);
    }
}
