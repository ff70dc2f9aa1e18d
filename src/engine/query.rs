//! Query Engine, spec.md §4.6 and the concurrency model of §5.

use crate::admin::AdminConfigService;
use crate::datasource::{DataSource, DataSourceRegistry, SqliteManager};
use crate::errors::{AppError, AppResult};
use crate::models::{CallerRole, QueryData, QueryRequest, QueryResponse, Row};
use crate::registry::ConnectionRegistry;
use log::warn;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;

const ENGINE_TYPE: &str = "query-gateway";

pub struct QueryEngine {
    admin: Arc<AdminConfigService>,
    registry: Arc<ConnectionRegistry>,
    plugins: DataSourceRegistry,
    max_page_size: i64,
}

impl QueryEngine {
    pub fn new(
        admin: Arc<AdminConfigService>,
        registry: Arc<ConnectionRegistry>,
        plugins: DataSourceRegistry,
        max_page_size: i64,
    ) -> Self {
        Self {
            admin,
            registry,
            plugins,
            max_page_size,
        }
    }

    pub async fn execute(&self, req: QueryRequest, caller: CallerRole) -> AppResult<QueryResponse> {
        let config = self
            .admin
            .get_group_config(&req.group)?
            .ok_or_else(|| AppError::BizNotFound {
                group: req.group.clone(),
            })?;

        if !config.group.is_publicly_searchable && !caller.is_admin() {
            return Err(AppError::permission_denied(
                "permission denied or not queryable",
            ));
        }

        let table = req
            .table
            .clone()
            .or_else(|| config.group.default_query_table.clone())
            .ok_or_else(|| AppError::invalid_argument("table", "no table specified and no default configured"))?;

        let table_config = config
            .table(&table)
            .filter(|t| t.is_searchable)
            .ok_or_else(|| AppError::permission_denied("permission denied or not queryable"))?;

        crate::sql::validate_filters(&req.filters)?;
        for f in &req.filters {
            if !table_config.is_field_searchable(&f.field) {
                return Err(AppError::invalid_argument(
                    "filters",
                    format!("field '{}' is not searchable", f.field),
                ));
            }
        }

        let requested_fields = req.fields_to_return.clone().unwrap_or_else(|| table_config.returnable_fields());
        let mut select_fields: Vec<String> = requested_fields
            .into_iter()
            .filter(|f| table_config.is_field_returnable(f))
            .collect();
        select_fields.sort();
        select_fields.dedup();
        if select_fields.is_empty() {
            return Err(AppError::invalid_argument(
                "fields_to_return",
                "no returnable fields selected",
            ));
        }

        let page = match req.page {
            Some(p) if p >= 1 => p,
            _ => 1,
        };
        let size = clamp_size(req.size, self.max_page_size);

        let sources = self.sources_for_group(&req.group, &table)?;

        let token = CancellationToken::new();
        let total = Arc::new(AtomicI64::new(0));
        let (tx, mut rx) = mpsc::unbounded_channel::<Row>();

        let count_handle = {
            let sources = sources.clone();
            let table = table.clone();
            let filters = req.filters.clone();
            let total = total.clone();
            let token = token.clone();
            tokio::spawn(async move {
                for source in &sources {
                    if token.is_cancelled() {
                        break;
                    }
                    match source.count(&table, &filters).await {
                        Ok(c) => {
                            total.fetch_add(c, Ordering::Relaxed);
                        }
                        Err(e) => {
                            warn!("count failed on source {}: {e}", source.name());
                        }
                    }
                }
            })
        };

        let concurrency = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(4);
        let semaphore = Arc::new(Semaphore::new(concurrency));
        let data_handle = {
            let sources = sources.clone();
            let table = table.clone();
            let filters = req.filters.clone();
            let fields = select_fields.clone();
            let token = token.clone();
            let tx = tx.clone();
            tokio::spawn(async move {
                let mut joins = Vec::with_capacity(sources.len());
                for source in sources {
                    let permit = semaphore.clone().acquire_owned().await.expect("semaphore not closed");
                    let table = table.clone();
                    let filters = filters.clone();
                    let fields = fields.clone();
                    let token = token.clone();
                    let tx = tx.clone();
                    joins.push(tokio::spawn(async move {
                        let _permit = permit;
                        if token.is_cancelled() {
                            return Ok(());
                        }
                        match source.query(&table, &filters, &fields, page, size).await {
                            Ok(rows) => {
                                for row in rows {
                                    if tx.send(row).is_err() {
                                        break;
                                    }
                                }
                                Ok(())
                            }
                            Err(e) => {
                                token.cancel();
                                Err(e)
                            }
                        }
                    }));
                }
                let mut first_error: Option<AppError> = None;
                for j in joins {
                    match j.await {
                        Ok(Ok(())) => {}
                        Ok(Err(e)) => {
                            first_error.get_or_insert(e);
                        }
                        Err(e) => {
                            first_error.get_or_insert(AppError::internal(format!("data task join error: {e}")));
                        }
                    }
                }
                drop(tx);
                first_error
            })
        };
        drop(tx);

        let mut items = Vec::new();
        while let Some(row) = rx.recv().await {
            items.push(row);
        }

        count_handle.await.map_err(|e| AppError::internal(format!("count task join error: {e}")))?;
        let data_error = data_handle
            .await
            .map_err(|e| AppError::internal(format!("data task join error: {e}")))?;

        if let Some(err) = data_error {
            return Err(AppError::Partial {
                message: err.to_string(),
                rows: items,
                total: total.load(Ordering::Relaxed),
            });
        }

        Ok(QueryResponse {
            data: QueryData {
                items,
                total: total.load(Ordering::Relaxed),
            },
            source: ENGINE_TYPE.to_string(),
        })
    }

    /// Databases whose physical schema lacks `table` are skipped entirely
    /// rather than dispatched and left to fail with a SQLite "no such
    /// table" error, per spec.md §3 and §4.6 step 7. Plugin sources are
    /// always included: their schema isn't known through the connection
    /// registry, so the plugin itself is responsible for reporting an
    /// empty result for a table it doesn't recognize.
    fn sources_for_group(&self, group: &str, table: &str) -> AppResult<Vec<Arc<dyn DataSource>>> {
        let snapshot = self.registry.snapshot(group)?;
        let mut sources: Vec<Arc<dyn DataSource>> = snapshot
            .libs
            .into_iter()
            .filter(|lib| self.registry.has_table(group, lib, table))
            .map(|lib| Arc::new(SqliteManager::new(self.registry.clone(), group, lib)) as Arc<dyn DataSource>)
            .collect();
        if let Ok(plugins) = self.plugins.read() {
            if let Some(plugin) = plugins.get(group) {
                sources.push(plugin.clone());
            }
        }
        Ok(sources)
    }
}

/// Non-numeric/absent size defaults to 50; anything over the configured
/// cap is clamped down and logged, per spec.md §4.6 edge cases.
fn clamp_size(size: Option<i64>, max: i64) -> i64 {
    match size {
        None => 50,
        Some(s) if s < 1 => 50,
        Some(s) if s > max => {
            warn!("requested page size {s} exceeds cap {max}, clamping");
            max
        }
        Some(s) => s,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::admin::models::TableConfig;
    use crate::admin::store::AdminStore;
    use crate::admin::AdminConfigService;
    use crate::datasource::new_data_source_registry;
    use crate::models::CallerRole;
    use crate::test_fixtures::bootstrap_admin_schema;
    use std::collections::HashMap;
    use std::time::Duration;

    fn setup(dir: &tempfile::TempDir) -> QueryEngine {
        let store = AdminStore::open_in_memory().unwrap();
        bootstrap_admin_schema(&store).unwrap();
        store.set_publicity("bizA", true).unwrap();
        let table = TableConfig {
            table_name: "t".to_string(),
            is_searchable: true,
            allow_create: false,
            allow_update: false,
            allow_delete: false,
            fields: HashMap::new(),
        };
        store.replace_searchable_tables("bizA", &[table]).unwrap();
        let field = crate::admin::models::FieldSetting {
            field_name: "name".to_string(),
            is_searchable: true,
            is_returnable: true,
            data_type: crate::admin::models::DataType::String,
        };
        store.replace_field_settings("bizA", "t", &[field]).unwrap();
        let admin = Arc::new(AdminConfigService::new(Arc::new(store), 100, Duration::from_secs(60)));

        let registry = ConnectionRegistry::new(dir.path());
        let group_dir = dir.path().join("bizA");
        std::fs::create_dir_all(&group_dir).unwrap();

        let conn = rusqlite::Connection::open(group_dir.join("db1.db")).unwrap();
        conn.execute_batch("CREATE TABLE t (id INTEGER PRIMARY KEY, name TEXT); INSERT INTO t (name) VALUES ('alice');")
            .unwrap();
        drop(conn);
        registry.open("bizA", "db1").unwrap();

        // db2 has no `t` table at all, modelling a heterogeneous fleet.
        let conn = rusqlite::Connection::open(group_dir.join("db2.db")).unwrap();
        conn.execute_batch("CREATE TABLE other (id INTEGER PRIMARY KEY);").unwrap();
        drop(conn);
        registry.open("bizA", "db2").unwrap();

        QueryEngine::new(admin, registry, new_data_source_registry(), 2000)
    }

    #[tokio::test]
    async fn skips_databases_missing_the_requested_table() {
        let dir = tempfile::tempdir().unwrap();
        let engine = setup(&dir);

        let req = QueryRequest {
            group: "bizA".to_string(),
            table: Some("t".to_string()),
            filters: Vec::new(),
            fields_to_return: None,
            page: None,
            size: None,
        };
        let resp = engine.execute(req, CallerRole::Standard).await.unwrap();
        assert_eq!(resp.data.total, 1);
        assert_eq!(resp.data.items.len(), 1);
    }
}
