//! Mutate Engine, spec.md §4.7: sequential, fail-fast broadcast with no
//! cross-database rollback.

use crate::admin::AdminConfigService;
use crate::datasource::{DataSource, DataSourceRegistry, SqliteManager};
use crate::errors::{AppError, AppResult};
use crate::models::{MutateOperation, MutateRequest, MutateResponse, MutateResult};
use crate::registry::ConnectionRegistry;
use std::sync::Arc;

const ENGINE_TYPE: &str = "query-gateway";

pub struct MutateEngine {
    admin: Arc<AdminConfigService>,
    registry: Arc<ConnectionRegistry>,
    plugins: DataSourceRegistry,
}

impl MutateEngine {
    pub fn new(admin: Arc<AdminConfigService>, registry: Arc<ConnectionRegistry>, plugins: DataSourceRegistry) -> Self {
        Self {
            admin,
            registry,
            plugins,
        }
    }

    pub async fn execute(&self, req: MutateRequest) -> AppResult<MutateResponse> {
        let config = self
            .admin
            .get_group_config(&req.group)?
            .ok_or_else(|| AppError::BizNotFound {
                group: req.group.clone(),
            })?;

        let table_config = config
            .table(&req.payload.table_name)
            .ok_or_else(|| AppError::TableNotFound {
                group: req.group.clone(),
                table: req.payload.table_name.clone(),
            })?;

        let allowed = match req.operation {
            MutateOperation::Create => table_config.allow_create,
            MutateOperation::Update => table_config.allow_update,
            MutateOperation::Delete => table_config.allow_delete,
        };
        if !allowed {
            return Err(AppError::permission_denied(format!(
                "{:?} not permitted on {}/{}",
                req.operation, req.group, req.payload.table_name
            )));
        }

        let sources = self.sources_for_group(&req.group)?;

        let mut rows_affected: i64 = 0;
        for source in &sources {
            match source.mutate(req.operation, &req.payload).await {
                Ok(n) => rows_affected += n,
                Err(e) => {
                    return Err(AppError::MutateAborted {
                        lib: source.name().to_string(),
                        reason: e.to_string(),
                    });
                }
            }
        }

        Ok(MutateResponse {
            data: MutateResult {
                success: true,
                rows_affected,
                message: format!("applied to {} database(s)", sources.len()),
            },
            source: ENGINE_TYPE.to_string(),
        })
    }

    fn sources_for_group(&self, group: &str) -> AppResult<Vec<Arc<dyn DataSource>>> {
        let snapshot = self.registry.snapshot(group)?;
        let mut sources: Vec<Arc<dyn DataSource>> = snapshot
            .libs
            .into_iter()
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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::admin::models::TableConfig;
    use crate::admin::store::AdminStore;
    use crate::datasource::new_data_source_registry;
    use crate::models::MutatePayload;
    use crate::test_fixtures::bootstrap_admin_schema;
    use std::collections::HashMap;
    use std::time::Duration;

    fn setup(dir: &tempfile::TempDir) -> (MutateEngine, Arc<ConnectionRegistry>) {
        let store = AdminStore::open_in_memory().unwrap();
        bootstrap_admin_schema(&store).unwrap();
        store.set_publicity("bizA", true).unwrap();
        let table = TableConfig {
            table_name: "t".to_string(),
            is_searchable: true,
            allow_create: true,
            allow_update: false,
            allow_delete: false,
            fields: HashMap::new(),
        };
        store.replace_searchable_tables("bizA", &[table]).unwrap();
        let admin = Arc::new(crate::admin::AdminConfigService::new(Arc::new(store), 100, Duration::from_secs(60)));

        let registry = ConnectionRegistry::new(dir.path());
        for lib in ["db1", "db2"] {
            let group_dir = dir.path().join("bizA");
            std::fs::create_dir_all(&group_dir).unwrap();
            let conn = rusqlite::Connection::open(group_dir.join(format!("{lib}.db"))).unwrap();
            if lib == "db2" {
                conn.execute_batch(
                    "CREATE TABLE t (id INTEGER PRIMARY KEY, data TEXT UNIQUE);
                     INSERT INTO t (data) VALUES ('unique_value');",
                )
                .unwrap();
            } else {
                conn.execute_batch("CREATE TABLE t (id INTEGER PRIMARY KEY, data TEXT UNIQUE);").unwrap();
            }
            drop(conn);
            registry.open("bizA", lib).unwrap();
        }

        let engine = MutateEngine::new(admin, registry.clone(), new_data_source_registry());
        (engine, registry)
    }

    #[tokio::test]
    async fn fail_fast_names_the_failing_db() {
        let dir = tempfile::tempdir().unwrap();
        let (engine, _registry) = setup(&dir);

        let mut data = HashMap::new();
        data.insert("data".to_string(), serde_json::Value::String("unique_value".to_string()));
        let req = MutateRequest {
            group: "bizA".to_string(),
            operation: MutateOperation::Create,
            payload: MutatePayload {
                table_name: "t".to_string(),
                data: Some(data),
                filters: Vec::new(),
            },
        };

        let err = engine.execute(req).await.unwrap_err();
        assert!(err.to_string().contains("operation on db 'db2' aborted"));
    }
}
