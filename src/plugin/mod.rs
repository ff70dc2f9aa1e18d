//! Plugin Supervisor, spec.md §4.9: install, instance lifecycle, and
//! health monitoring for out-of-process plugins.

pub mod grpc_adapter;
pub mod install;
pub mod manifest;
pub mod process;

use self::manifest::{PluginManifest, PluginVersion, RepositoryDocument};
use crate::admin::models::PluginInstanceRow;
use crate::admin::store::AdminStore;
use crate::datasource::{DataSource, DataSourceRegistry};
use crate::errors::{AppError, AppResult};
use log::{info, warn};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{oneshot, Mutex as AsyncMutex};

const CONNECT_RETRY_ATTEMPTS: u32 = 5;
const CONNECT_RETRY_INTERVAL: Duration = Duration::from_secs(2);
const HEALTH_CHECK_TIMEOUT: Duration = Duration::from_secs(5);

/// A running plugin instance, tracked so `stop` can signal its watcher
/// task to kill the process and the health loop can locate it by
/// `biz_name`. The `Child` itself lives in the watcher task spawned by
/// `start`, not here: it must stay owned by whoever calls `wait()` on it.
struct RunningInstance {
    biz_name: String,
    kill_tx: oneshot::Sender<()>,
}

/// Owns the fleet of out-of-process plugins: their installed artifacts,
/// their running processes, and their published `DataSource` adapters.
/// Shares `store` with `AdminConfigService` (one connection to the admin
/// database) and `registry` with the Query/Mutate Engines, rather than
/// holding a back-reference to either, per spec.md §9.
pub struct PluginSupervisor {
    store: Arc<AdminStore>,
    registry: DataSourceRegistry,
    install_dir: PathBuf,
    repositories: Vec<String>,
    running: Arc<AsyncMutex<HashMap<String, RunningInstance>>>,
    manifests: AsyncMutex<HashMap<(String, String), PluginVersion>>,
}

impl PluginSupervisor {
    pub fn new(
        store: Arc<AdminStore>,
        registry: DataSourceRegistry,
        install_dir: impl Into<PathBuf>,
        repositories: Vec<String>,
    ) -> Self {
        Self {
            store,
            registry,
            install_dir: install_dir.into(),
            repositories,
            running: Arc::new(AsyncMutex::new(HashMap::new())),
            manifests: AsyncMutex::new(HashMap::new()),
        }
    }

    /// Fetch and flatten every configured repository's plugin catalog.
    /// An unreadable or malformed repository aborts the whole fetch: a
    /// partial catalog is worse than a clear install-time error.
    pub async fn fetch_catalog(&self) -> AppResult<Vec<PluginManifest>> {
        let mut all = Vec::new();
        for repo_url in &self.repositories {
            let bytes = if let Some(path) = repo_url.strip_prefix("file://") {
                tokio::fs::read(path).await?
            } else if repo_url.starts_with("http://") || repo_url.starts_with("https://") {
                reqwest::get(repo_url).await?.bytes().await?.to_vec()
            } else {
                warn!("skipping plugin repository with unsupported scheme: {repo_url}");
                continue;
            };
            let doc: RepositoryDocument = serde_json::from_slice(&bytes)?;
            all.extend(doc.plugins);
        }
        Ok(all)
    }

    fn find_version(catalog: &[PluginManifest], plugin_id: &str, version: &str) -> AppResult<PluginVersion> {
        catalog
            .iter()
            .find(|m| m.plugin_id == plugin_id)
            .and_then(|m| m.version(version))
            .cloned()
            .ok_or_else(|| AppError::RecordNotFound {
                entity: "plugin".to_string(),
                field: "plugin_id@version".to_string(),
                value: format!("{plugin_id}@{version}"),
            })
    }

    /// Download, checksum-verify, and extract one plugin version, then
    /// record it installed.
    pub async fn install(&self, plugin_id: &str, version: &str) -> AppResult<PathBuf> {
        let catalog = self.fetch_catalog().await?;
        let plugin_version = Self::find_version(&catalog, plugin_id, version)?;

        let bytes = install::download(&plugin_version.source).await?;
        install::verify_checksum(&bytes, &plugin_version.source)?;
        let path = install::extract(&bytes, &self.install_dir, plugin_id, version)?;

        self.store
            .record_plugin_install(plugin_id, version, &path.to_string_lossy())?;
        self.manifests
            .lock()
            .await
            .insert((plugin_id.to_string(), version.to_string()), plugin_version);
        info!("installed plugin {plugin_id}@{version} at {}", path.display());
        Ok(path)
    }

    /// Register a new `STOPPED` instance bound to `biz_name`. A duplicate
    /// `biz_name` is rejected by the `plugin_instances` table's own
    /// UNIQUE constraint and surfaces as a `Database` error.
    pub async fn create_instance(
        &self,
        display_name: &str,
        plugin_id: &str,
        version: &str,
        biz_name: &str,
    ) -> AppResult<String> {
        let port = process::allocate_port().await?;
        let instance_id = uuid::Uuid::new_v4().to_string();
        let row = PluginInstanceRow {
            instance_id: instance_id.clone(),
            display_name: display_name.to_string(),
            plugin_id: plugin_id.to_string(),
            version: version.to_string(),
            biz_name: biz_name.to_string(),
            port,
        };
        self.store.create_plugin_instance(&row)?;
        info!("registered plugin instance {instance_id} for biz_name={biz_name}");
        Ok(instance_id)
    }

    async fn execution_spec(&self, plugin_id: &str, version: &str) -> AppResult<PluginVersion> {
        if let Some(v) = self.manifests.lock().await.get(&(plugin_id.to_string(), version.to_string())) {
            return Ok(v.clone());
        }
        let catalog = self.fetch_catalog().await?;
        let v = Self::find_version(&catalog, plugin_id, version)?;
        self.manifests
            .lock()
            .await
            .insert((plugin_id.to_string(), version.to_string()), v.clone());
        Ok(v)
    }

    /// Spawn the instance's process, wait for its gRPC endpoint to come
    /// up, and publish it into the shared data source registry under its
    /// `biz_name`. Spec.md §4.9's `STOPPED -> RUNNING` transition; on
    /// failure the instance is left `ERROR` rather than `RUNNING`.
    pub async fn start(&self, instance_id: &str) -> AppResult<()> {
        let row = self
            .store
            .get_instance(instance_id)?
            .ok_or_else(|| AppError::RecordNotFound {
                entity: "plugin_instance".to_string(),
                field: "instance_id".to_string(),
                value: instance_id.to_string(),
            })?;

        let exec = self.execution_spec(&row.plugin_id, &row.version).await?;
        let install_path = self
            .store
            .install_path(&row.plugin_id, &row.version)?
            .ok_or_else(|| AppError::Plugin {
                operation: "start".to_string(),
                reason: format!("plugin {}@{} is not installed", row.plugin_id, row.version),
            })?;
        let instance_dir = PathBuf::from(&install_path);
        let args = manifest::expand_args(
            &exec.execution.args,
            row.port,
            &row.biz_name,
            &row.display_name,
            &instance_dir.to_string_lossy(),
        );

        let mut child = process::spawn(&exec.execution.entrypoint, &args, &instance_dir)?;

        let adapter = match process::connect_with_retry(
            row.port,
            &row.biz_name,
            CONNECT_RETRY_ATTEMPTS,
            CONNECT_RETRY_INTERVAL,
        )
        .await
        {
            Ok(adapter) => adapter,
            Err(e) => {
                self.store.set_instance_status(instance_id, "ERROR")?;
                let _ = child.kill().await;
                return Err(e);
            }
        };

        self.registry
            .write()
            .map_err(|_| AppError::internal("data source registry poisoned"))?
            .insert(row.biz_name.clone(), Arc::new(adapter));
        self.store.set_instance_status(instance_id, "RUNNING")?;

        let (kill_tx, kill_rx) = oneshot::channel();
        self.running.lock().await.insert(
            instance_id.to_string(),
            RunningInstance {
                biz_name: row.biz_name.clone(),
                kill_tx,
            },
        );
        spawn_exit_watcher(
            instance_id.to_string(),
            row.biz_name.clone(),
            child,
            kill_rx,
            self.running.clone(),
            self.registry.clone(),
            self.store.clone(),
        );

        info!(
            "started plugin instance {instance_id} ({}@{}) on biz_name={}",
            row.plugin_id, row.version, row.biz_name
        );
        Ok(())
    }

    /// Signal the process's watcher task to kill it, remove it from the
    /// shared data source registry, and mark the instance `STOPPED`.
    /// Idempotent when already stopped.
    pub async fn stop(&self, instance_id: &str) -> AppResult<()> {
        if let Some(running) = self.running.lock().await.remove(instance_id) {
            let _ = running.kill_tx.send(());
            self.registry
                .write()
                .map_err(|_| AppError::internal("data source registry poisoned"))?
                .remove(&running.biz_name);
        }
        self.store.set_instance_status(instance_id, "STOPPED")?;
        Ok(())
    }

    /// Delete an instance. Permitted only from `STOPPED`, spec.md §4.9.
    pub async fn delete_instance(&self, instance_id: &str) -> AppResult<()> {
        let status = self
            .store
            .instance_status(instance_id)?
            .ok_or_else(|| AppError::RecordNotFound {
                entity: "plugin_instance".to_string(),
                field: "instance_id".to_string(),
                value: instance_id.to_string(),
            })?;
        if status != "STOPPED" {
            return Err(AppError::permission_denied(format!(
                "instance {instance_id} must be STOPPED before deletion (currently {status})"
            )));
        }
        self.store.delete_instance(instance_id)
    }

    /// Health-check every published plugin adapter with a bounded
    /// timeout; a failing or timed-out check marks the instance `ERROR`
    /// and stops it, meant to be driven by a periodic ticker in the
    /// embedding application.
    pub async fn run_health_checks(&self) {
        let snapshot: Vec<(String, Arc<dyn DataSource>)> = {
            let registry = match self.registry.read() {
                Ok(g) => g,
                Err(_) => return,
            };
            registry.iter().map(|(k, v)| (k.clone(), v.clone())).collect()
        };

        for (biz_name, source) in snapshot {
            let result = tokio::time::timeout(HEALTH_CHECK_TIMEOUT, source.health_check()).await;
            let healthy = matches!(result, Ok(Ok(())));
            if healthy {
                continue;
            }
            warn!("plugin for biz_name={biz_name} failed health check, stopping");
            if let Some(instance_id) = self.instance_id_for_biz(&biz_name).await {
                let _ = self.store.set_instance_status(&instance_id, "ERROR");
                let _ = self.stop(&instance_id).await;
            }
        }
    }

    async fn instance_id_for_biz(&self, biz_name: &str) -> Option<String> {
        let running = self.running.lock().await;
        running
            .iter()
            .find(|(_, r)| r.biz_name == biz_name)
            .map(|(id, _)| id.clone())
    }
}

/// Block on the child's exit, reacting if it dies on its own rather than
/// through `stop`, per spec.md §4.9: "block on `Wait()` for the process,
/// and on exit call Stop to clean up". Races against `kill_rx`, which
/// `stop` fires to request a deliberate kill instead.
fn spawn_exit_watcher(
    instance_id: String,
    biz_name: String,
    mut child: tokio::process::Child,
    kill_rx: oneshot::Receiver<()>,
    running: Arc<AsyncMutex<HashMap<String, RunningInstance>>>,
    registry: DataSourceRegistry,
    store: Arc<AdminStore>,
) {
    tokio::spawn(async move {
        tokio::select! {
            status = child.wait() => {
                // `running` no longer holding this instance means `stop`
                // already won the race and is handling cleanup itself.
                if running.lock().await.remove(&instance_id).is_none() {
                    return;
                }
                match status {
                    Ok(exit) => warn!("plugin instance {instance_id} (biz_name={biz_name}) exited unexpectedly: {exit}"),
                    Err(e) => warn!("plugin instance {instance_id} (biz_name={biz_name}) wait failed: {e}"),
                }
                if let Ok(mut reg) = registry.write() {
                    reg.remove(&biz_name);
                }
                let _ = store.set_instance_status(&instance_id, "ERROR");
            }
            _ = kill_rx => {
                let _ = child.kill().await;
            }
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::datasource::new_data_source_registry;
    use crate::test_fixtures::bootstrap_admin_schema;

    fn supervisor() -> PluginSupervisor {
        let store = AdminStore::open_in_memory().unwrap();
        bootstrap_admin_schema(&store).unwrap();
        PluginSupervisor::new(Arc::new(store), new_data_source_registry(), "/tmp/plugins", Vec::new())
    }

    #[tokio::test]
    async fn install_fails_cleanly_with_no_repositories_configured() {
        let sup = supervisor();
        let err = sup.install("demo", "1.0.0").await.unwrap_err();
        assert!(matches!(err, AppError::RecordNotFound { .. }));
    }

    #[tokio::test]
    async fn create_instance_rejects_duplicate_biz_name() {
        let sup = supervisor();
        sup.create_instance("First", "demo", "1.0.0", "bizA").await.unwrap();
        let err = sup
            .create_instance("Second", "demo", "1.0.0", "bizA")
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::Database { .. }));
    }

    #[tokio::test]
    async fn delete_instance_rejects_non_stopped() {
        let sup = supervisor();
        let instance_id = sup.create_instance("First", "demo", "1.0.0", "bizA").await.unwrap();
        sup.store.set_instance_status(&instance_id, "RUNNING").unwrap();
        let err = sup.delete_instance(&instance_id).await.unwrap_err();
        assert!(matches!(err, AppError::PermissionDenied { .. }));
    }

    #[tokio::test]
    async fn delete_instance_succeeds_from_stopped() {
        let sup = supervisor();
        let instance_id = sup.create_instance("First", "demo", "1.0.0", "bizA").await.unwrap();
        sup.delete_instance(&instance_id).await.unwrap();
        assert!(sup.store.instance_status(&instance_id).unwrap().is_none());
    }
}
