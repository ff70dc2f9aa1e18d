//! Plugin process lifecycle primitives: port allocation, spawn, and
//! bounded-retry gRPC bring-up, spec.md §4.9.

use crate::errors::{AppError, AppResult};
use crate::plugin::grpc_adapter::GrpcPluginAdapter;
use log::{info, warn};
use std::path::Path;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::process::{Child, Command};

/// Bind an ephemeral port and immediately close it, per spec.md §4.9's
/// "allocate a free TCP port by binding ephemeral and closing".
pub async fn allocate_port() -> AppResult<u16> {
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let port = listener.local_addr()?.port();
    drop(listener);
    Ok(port)
}

/// Spawn `entrypoint` with `args` in `instance_dir`, inheriting stdio so
/// plugin logs surface through the embedding process's own terminal.
pub fn spawn(entrypoint: &str, args: &[String], instance_dir: &Path) -> AppResult<Child> {
    std::fs::create_dir_all(instance_dir)?;
    let child = Command::new(entrypoint)
        .args(args)
        .current_dir(instance_dir)
        .kill_on_drop(true)
        .spawn()
        .map_err(|e| AppError::Plugin {
            operation: "spawn".to_string(),
            reason: e.to_string(),
        })?;
    info!("spawned plugin process entrypoint={entrypoint} dir={}", instance_dir.display());
    Ok(child)
}

/// Attempt to connect to the freshly spawned plugin's gRPC endpoint,
/// retrying `attempts` times `interval` apart before giving up.
pub async fn connect_with_retry(
    port: u16,
    biz_name: &str,
    attempts: u32,
    interval: Duration,
) -> AppResult<GrpcPluginAdapter> {
    let endpoint = format!("http://127.0.0.1:{port}");
    let mut last_err = None;
    for attempt in 1..=attempts {
        match GrpcPluginAdapter::connect(endpoint.clone(), biz_name).await {
            Ok(adapter) => return Ok(adapter),
            Err(e) => {
                warn!("gRPC connect attempt {attempt}/{attempts} to {endpoint} failed: {e}");
                last_err = Some(e);
                tokio::time::sleep(interval).await;
            }
        }
    }
    Err(last_err.unwrap_or_else(|| AppError::Plugin {
        operation: "grpc_connect".to_string(),
        reason: "no attempts made".to_string(),
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn allocate_port_returns_a_usable_port() {
        let port = allocate_port().await.unwrap();
        assert!(port > 0);
    }
}
