//! Startup configuration.
//!
//! Every tunable here is read once at process start and threaded through
//! constructors explicitly — no global mutable state.

use std::path::PathBuf;
use std::time::Duration;

/// Immutable configuration handed to every top-level component constructor.
#[derive(Debug, Clone)]
pub struct StartupConfig {
    /// Root directory containing one subdirectory per business group.
    pub fleet_root: PathBuf,
    /// `rusqlite` connection path (or `:memory:`) for the admin store.
    pub admin_db_path: String,
    /// Directory plugin artifacts are unzipped into.
    pub plugin_install_dir: PathBuf,
    /// JSON repository documents (HTTP or `file://`) listing plugin manifests.
    pub plugin_repositories: Vec<String>,
    /// Debounce window for filesystem watcher events.
    pub watch_debounce: Duration,
    /// Idle eviction window for per-IP rate limiter state.
    pub ratelimit_idle_evict: Duration,
    /// Admin config cache TTL.
    pub admin_cache_ttl: Duration,
    /// Admin config cache bounded entry count.
    pub admin_cache_capacity: u64,
    /// Default global IP rate limit (requests/minute) before `global_settings` loads.
    pub default_ip_rate_per_minute: u32,
    /// Default global IP burst size.
    pub default_ip_burst: u32,
    /// Maximum page size the query engine will honor.
    pub max_page_size: i64,
}

impl StartupConfig {
    /// Load from environment variables, falling back to documented defaults.
    pub fn from_env() -> Self {
        Self {
            fleet_root: std::env::var("GATEWAY_FLEET_ROOT")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("./fleet")),
            admin_db_path: std::env::var("GATEWAY_ADMIN_DB")
                .unwrap_or_else(|_| "./gateway_admin.db".to_string()),
            plugin_install_dir: std::env::var("GATEWAY_PLUGIN_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("./plugins")),
            plugin_repositories: std::env::var("GATEWAY_PLUGIN_REPOS")
                .map(|s| s.split(',').map(|s| s.trim().to_string()).collect())
                .unwrap_or_default(),
            watch_debounce: Duration::from_secs(2),
            ratelimit_idle_evict: Duration::from_secs(15 * 60),
            admin_cache_ttl: Duration::from_secs(60),
            admin_cache_capacity: 1024,
            default_ip_rate_per_minute: 60,
            default_ip_burst: 20,
            max_page_size: 2000,
        }
    }

    /// Build a config rooted at a given directory, used by tests and by
    /// any embedder that already knows its fleet root.
    pub fn with_fleet_root(fleet_root: impl Into<PathBuf>) -> Self {
        Self {
            fleet_root: fleet_root.into(),
            ..Self::from_env()
        }
    }
}

impl Default for StartupConfig {
    fn default() -> Self {
        Self::from_env()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_documented() {
        let cfg = StartupConfig::default();
        assert_eq!(cfg.max_page_size, 2000);
        assert_eq!(cfg.default_ip_rate_per_minute, 60);
        assert_eq!(cfg.default_ip_burst, 20);
    }
}
