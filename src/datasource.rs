//! Data source capability trait, spec.md §9's "interface over
//! inheritance" note: the Query/Mutate Engines operate over
//! `Arc<dyn DataSource>` so a plugin instance and a physical `.db` file
//! are interchangeable fan-out targets.

use crate::errors::AppResult;
use crate::models::{Filter, MutateOperation, MutatePayload, Row};
use crate::registry::ConnectionRegistry;
use crate::schema::PhysicalSchema;
use crate::sql::SqlBuilder;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};

/// Shared registry of out-of-process (plugin) data sources, keyed by
/// business group name. Passed by value into the Plugin Supervisor and
/// the engines rather than having either hold a back-reference to the
/// other, per spec.md §9's note on breaking the cyclic reference.
pub type DataSourceRegistry = Arc<RwLock<HashMap<String, Arc<dyn DataSource>>>>;

pub fn new_data_source_registry() -> DataSourceRegistry {
    Arc::new(RwLock::new(HashMap::new()))
}

/// The capability set every fan-out target exposes, regardless of whether
/// it is backed by a physical SQLite file or an out-of-process plugin.
#[async_trait]
pub trait DataSource: Send + Sync {
    /// Identifier used as the `__lib` marker on rows this source returns.
    fn name(&self) -> &str;

    fn type_name(&self) -> &'static str;

    async fn count(&self, table: &str, filters: &[Filter]) -> AppResult<i64>;

    async fn query(
        &self,
        table: &str,
        filters: &[Filter],
        fields: &[String],
        page: i64,
        size: i64,
    ) -> AppResult<Vec<Row>>;

    async fn mutate(&self, op: MutateOperation, payload: &MutatePayload) -> AppResult<i64>;

    async fn get_schema(&self) -> AppResult<PhysicalSchema>;

    async fn health_check(&self) -> AppResult<()>;

    async fn close(&self) -> AppResult<()>;
}

/// `DataSource` over one physical `(group, lib)` SQLite connection held by
/// the Connection Registry. `rusqlite` is synchronous, so every call hops
/// to `spawn_blocking`.
pub struct SqliteManager {
    registry: Arc<ConnectionRegistry>,
    group: String,
    lib: String,
}

impl SqliteManager {
    pub fn new(registry: Arc<ConnectionRegistry>, group: impl Into<String>, lib: impl Into<String>) -> Self {
        Self {
            registry,
            group: group.into(),
            lib: lib.into(),
        }
    }
}

#[async_trait]
impl DataSource for SqliteManager {
    fn name(&self) -> &str {
        &self.lib
    }

    fn type_name(&self) -> &'static str {
        "sqlite"
    }

    async fn count(&self, table: &str, filters: &[Filter]) -> AppResult<i64> {
        let assembled = SqlBuilder::count(table, filters)?;
        let registry = self.registry.clone();
        let group = self.group.clone();
        let lib = self.lib.clone();
        tokio::task::spawn_blocking(move || {
            registry.with_connection(&group, &lib, |conn| {
                let mut stmt = conn.prepare(&assembled.sql)?;
                let count: i64 = stmt.query_row(rusqlite::params_from_iter(assembled.args.iter()), |row| row.get(0))?;
                Ok(count)
            })
        })
        .await
        .map_err(|e| crate::errors::AppError::internal(format!("count task join error: {e}")))?
    }

    async fn query(
        &self,
        table: &str,
        filters: &[Filter],
        fields: &[String],
        page: i64,
        size: i64,
    ) -> AppResult<Vec<Row>> {
        let assembled = SqlBuilder::select(table, fields, filters, page, size)?;
        let registry = self.registry.clone();
        let group = self.group.clone();
        let lib = self.lib.clone();
        let lib_marker = self.lib.clone();
        tokio::task::spawn_blocking(move || {
            registry.with_connection(&group, &lib, |conn| {
                let mut stmt = conn.prepare(&assembled.sql)?;
                let column_names: Vec<String> = stmt.column_names().iter().map(|s| s.to_string()).collect();
                let rows = stmt.query_map(rusqlite::params_from_iter(assembled.args.iter()), |row| {
                    let mut out = Row::new();
                    for (i, col) in column_names.iter().enumerate() {
                        let value = sql_value_to_json(row.get_ref(i)?);
                        out.insert(col.clone(), value);
                    }
                    out.insert(
                        crate::models::LIB_MARKER.to_string(),
                        serde_json::Value::String(lib_marker.clone()),
                    );
                    Ok(out)
                })?;
                rows.collect::<Result<Vec<_>, _>>().map_err(Into::into)
            })
        })
        .await
        .map_err(|e| crate::errors::AppError::internal(format!("query task join error: {e}")))?
    }

    async fn mutate(&self, op: MutateOperation, payload: &MutatePayload) -> AppResult<i64> {
        let assembled = match op {
            MutateOperation::Create => {
                let data = payload.data.clone().ok_or_else(|| {
                    crate::errors::AppError::invalid_argument("data", "create requires data")
                })?;
                SqlBuilder::insert(&payload.table_name, &data)?
            }
            MutateOperation::Update => {
                let data = payload.data.clone().ok_or_else(|| {
                    crate::errors::AppError::invalid_argument("data", "update requires data")
                })?;
                SqlBuilder::update(&payload.table_name, &data, &payload.filters)?
            }
            MutateOperation::Delete => SqlBuilder::delete(&payload.table_name, &payload.filters)?,
        };
        let registry = self.registry.clone();
        let group = self.group.clone();
        let lib = self.lib.clone();
        tokio::task::spawn_blocking(move || {
            registry.with_connection(&group, &lib, |conn| {
                let affected = conn.execute(&assembled.sql, rusqlite::params_from_iter(assembled.args.iter()))?;
                Ok(affected as i64)
            })
        })
        .await
        .map_err(|e| crate::errors::AppError::internal(format!("mutate task join error: {e}")))?
    }

    async fn get_schema(&self) -> AppResult<PhysicalSchema> {
        let registry = self.registry.clone();
        let group = self.group.clone();
        let lib = self.lib.clone();
        tokio::task::spawn_blocking(move || {
            registry.with_connection(&group, &lib, |conn| crate::schema::probe_schema(conn))
        })
        .await
        .map_err(|e| crate::errors::AppError::internal(format!("schema task join error: {e}")))?
    }

    async fn health_check(&self) -> AppResult<()> {
        let registry = self.registry.clone();
        let group = self.group.clone();
        let lib = self.lib.clone();
        tokio::task::spawn_blocking(move || {
            registry.with_connection(&group, &lib, |conn| {
                conn.execute_batch("SELECT 1")?;
                Ok(())
            })
        })
        .await
        .map_err(|e| crate::errors::AppError::internal(format!("health task join error: {e}")))?
    }

    async fn close(&self) -> AppResult<()> {
        self.registry.close(&self.group, &self.lib)
    }
}

fn sql_value_to_json(value: rusqlite::types::ValueRef<'_>) -> serde_json::Value {
    use rusqlite::types::ValueRef;
    match value {
        ValueRef::Null => serde_json::Value::Null,
        ValueRef::Integer(i) => serde_json::Value::from(i),
        ValueRef::Real(f) => serde_json::Value::from(f),
        ValueRef::Text(t) => serde_json::Value::String(String::from_utf8_lossy(t).to_string()),
        // Byte arrays are coerced to strings, per spec.md §4.6 step 7.
        ValueRef::Blob(b) => serde_json::Value::String(String::from_utf8_lossy(b).to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry_with_rows() -> (Arc<ConnectionRegistry>, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("bizA")).unwrap();
        let conn = rusqlite::Connection::open(dir.path().join("bizA").join("db1.db")).unwrap();
        conn.execute_batch(
            "CREATE TABLE t (id INTEGER PRIMARY KEY, name TEXT);
             INSERT INTO t (name) VALUES ('alice'), ('bob');",
        )
        .unwrap();
        drop(conn);
        let registry = ConnectionRegistry::new(dir.path());
        registry.open("bizA", "db1").unwrap();
        (registry, dir)
    }

    #[tokio::test]
    async fn query_injects_lib_marker() {
        let (registry, _dir) = registry_with_rows();
        let source = SqliteManager::new(registry, "bizA", "db1");
        let fields = vec!["id".to_string(), "name".to_string()];
        let rows = source.query("t", &[], &fields, 1, 10).await.unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(
            rows[0].get(crate::models::LIB_MARKER).and_then(|v| v.as_str()),
            Some("db1")
        );
    }

    #[tokio::test]
    async fn count_matches_row_count() {
        let (registry, _dir) = registry_with_rows();
        let source = SqliteManager::new(registry, "bizA", "db1");
        let filters = vec![crate::models::Filter {
            field: "name".to_string(),
            value: serde_json::Value::String("alice".to_string()),
            fuzzy: false,
            logic: None,
        }];
        let count = source.count("t", &filters).await.unwrap();
        assert_eq!(count, 1);
    }
}
