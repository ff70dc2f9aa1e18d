//! Admin Configuration Service, spec.md §4.5: authoritative source for
//! publicity, searchable tables, field-level flags, views, and rate
//! limits, cached with an LRU+TTL layer.

pub mod cache;
pub mod models;
pub mod store;

use self::cache::ConfigCache;
use self::models::{
    BizQueryConfig, FieldSetting, RateLimitSetting, TableConfig, UserRateLimitOverride, ViewConfig,
};
pub use self::store::AdminStore;
use crate::errors::AppResult;
use std::sync::Arc;
use std::time::Duration;

/// Facade combining the cache and the store behind the loader contract of
/// spec.md §4.5: a missing group is `Ok(None)`, never an error. The store
/// is `Arc`-shared so the Plugin Supervisor can hold the same admin
/// connection for its own catalog/instance tables without a second
/// connection to the same file.
pub struct AdminConfigService {
    store: Arc<AdminStore>,
    cache: ConfigCache,
}

impl AdminConfigService {
    pub fn new(store: Arc<AdminStore>, capacity: u64, ttl: Duration) -> Self {
        Self {
            store,
            cache: ConfigCache::new(capacity, ttl),
        }
    }

    pub fn store(&self) -> Arc<AdminStore> {
        self.store.clone()
    }

    pub fn get_group_config(&self, group: &str) -> AppResult<Option<BizQueryConfig>> {
        if let Some(cached) = self.cache.get(group) {
            return Ok(Some(cached));
        }
        let loaded = self.store.load_group_config(group)?;
        if let Some(cfg) = &loaded {
            self.cache.put(group, cfg.clone());
        }
        Ok(loaded)
    }

    pub fn list_groups(&self) -> AppResult<Vec<String>> {
        self.store.list_groups()
    }

    pub fn set_publicity(&self, group: &str, is_publicly_searchable: bool) -> AppResult<()> {
        self.store.set_publicity(group, is_publicly_searchable)?;
        self.cache.invalidate(group);
        Ok(())
    }

    pub fn set_default_table(&self, group: &str, table: Option<&str>) -> AppResult<()> {
        self.store.set_default_table(group, table)?;
        self.cache.invalidate(group);
        Ok(())
    }

    pub fn replace_searchable_tables(&self, group: &str, tables: &[TableConfig]) -> AppResult<()> {
        self.store.replace_searchable_tables(group, tables)?;
        self.cache.invalidate(group);
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
        self.store
            .set_write_permissions(group, table, allow_create, allow_update, allow_delete)?;
        self.cache.invalidate(group);
        Ok(())
    }

    pub fn replace_field_settings(
        &self,
        group: &str,
        table: &str,
        fields: &[FieldSetting],
    ) -> AppResult<()> {
        self.store.replace_field_settings(group, table, fields)?;
        self.cache.invalidate(group);
        Ok(())
    }

    pub fn upsert_view(&self, group: &str, table: &str, view: &ViewConfig) -> AppResult<()> {
        self.store.upsert_view(group, table, view)?;
        self.cache.invalidate(group);
        Ok(())
    }

    pub fn delete_view(&self, group: &str, table: &str, view_name: &str) -> AppResult<()> {
        self.store.delete_view(group, table, view_name)?;
        self.cache.invalidate(group);
        Ok(())
    }

    pub fn set_group_rate_limit(&self, group: &str, setting: RateLimitSetting) -> AppResult<()> {
        self.store.set_group_rate_limit(group, setting)?;
        self.cache.invalidate(group);
        Ok(())
    }

    pub fn global_rate_limit(&self) -> AppResult<RateLimitSetting> {
        self.store.global_rate_limit()
    }

    pub fn user_rate_limit_override(&self, user_id: i64) -> AppResult<UserRateLimitOverride> {
        self.store.user_rate_limit_override(user_id)
    }

    pub fn set_user_rate_limit(&self, user_id: i64, over: UserRateLimitOverride) -> AppResult<()> {
        self.store.set_user_rate_limit(user_id, over)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_fixtures::bootstrap_admin_schema;

    fn service() -> AdminConfigService {
        let store = AdminStore::open_in_memory().unwrap();
        bootstrap_admin_schema(&store).unwrap();
        AdminConfigService::new(Arc::new(store), 100, Duration::from_secs(60))
    }

    #[test]
    fn missing_group_is_none_not_error() {
        let svc = service();
        assert!(svc.get_group_config("ghost").unwrap().is_none());
    }

    #[test]
    fn write_invalidates_cache_so_next_read_reflects_it() {
        let svc = service();
        svc.set_publicity("bizA", false).unwrap();
        let cfg = svc.get_group_config("bizA").unwrap().unwrap();
        assert!(!cfg.group.is_publicly_searchable);

        svc.set_publicity("bizA", true).unwrap();
        let cfg = svc.get_group_config("bizA").unwrap().unwrap();
        assert!(cfg.group.is_publicly_searchable);
    }
}
