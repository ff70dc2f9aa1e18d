//! Per-group union schema cache, spec.md §3 and §4.2.

use super::PhysicalSchema;
use crate::errors::AppResult;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;

/// `<group>/schema_cache.json` shape, spec.md §6.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct UnionSchema {
    pub updated_at: DateTime<Utc>,
    /// table -> union of column names across every open lib.
    pub tables: BTreeMap<String, Vec<String>>,
    /// lib -> that lib's physical table/column map, for per-db detail.
    pub libs: BTreeMap<String, BTreeMap<String, Vec<String>>>,
}

const CACHE_FILE: &str = "schema_cache.json";

impl UnionSchema {
    /// Compute the union across every currently-open lib's physical schema.
    /// Closed or missing files are simply absent from `physical`, so the
    /// result only ever reflects currently-open state.
    pub fn compute(physical: &BTreeMap<String, PhysicalSchema>) -> Self {
        let mut tables: BTreeMap<String, BTreeSet<String>> = BTreeMap::new();
        let mut libs = BTreeMap::new();
        for (lib, schema) in physical {
            libs.insert(lib.clone(), schema.tables.clone());
            for (table, columns) in &schema.tables {
                tables
                    .entry(table.clone())
                    .or_default()
                    .extend(columns.iter().cloned());
            }
        }
        let tables = tables
            .into_iter()
            .map(|(table, cols)| (table, cols.into_iter().collect()))
            .collect();
        Self {
            updated_at: Utc::now(),
            tables,
            libs,
        }
    }

    /// Persist to `<group_dir>/schema_cache.json` via write-temp-then-rename
    /// so readers never observe a partially written file.
    pub fn persist(&self, group_dir: &Path) -> AppResult<()> {
        let target = group_dir.join(CACHE_FILE);
        let tmp = group_dir.join(format!("{CACHE_FILE}.tmp"));
        let json = serde_json::to_vec_pretty(self)?;
        std::fs::write(&tmp, json)?;
        std::fs::rename(&tmp, &target)?;
        Ok(())
    }

    fn read(group_dir: &Path) -> AppResult<Self> {
        let bytes = std::fs::read(group_dir.join(CACHE_FILE))?;
        let schema = serde_json::from_slice(&bytes)?;
        Ok(schema)
    }
}

/// Load the persisted cache if present and well-formed; on any read or
/// parse error, fall back to a full rescan from `physical` and write the
/// rescanned result back, per spec.md §4.2's fallback rule.
pub fn load_or_rescan(
    group_dir: &Path,
    physical: &BTreeMap<String, PhysicalSchema>,
) -> AppResult<UnionSchema> {
    match UnionSchema::read(group_dir) {
        Ok(cached) => Ok(cached),
        Err(_) => {
            let rescanned = UnionSchema::compute(physical);
            rescanned.persist(group_dir)?;
            Ok(rescanned)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn schema(tables: &[(&str, &[&str])]) -> PhysicalSchema {
        let mut map = BTreeMap::new();
        for (table, cols) in tables {
            map.insert(
                table.to_string(),
                cols.iter().map(|c| c.to_string()).collect(),
            );
        }
        PhysicalSchema {
            tables: map,
            default_table: None,
        }
    }

    #[test]
    fn compute_unions_columns_across_libs() {
        let mut physical = BTreeMap::new();
        physical.insert("db1".to_string(), schema(&[("t", &["id", "a"])]));
        physical.insert("db2".to_string(), schema(&[("t", &["id", "b"])]));
        let union = UnionSchema::compute(&physical);
        assert_eq!(union.tables["t"], vec!["a", "b", "id"]);
        assert_eq!(union.libs.len(), 2);
    }

    #[test]
    fn persist_then_read_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let mut physical = BTreeMap::new();
        physical.insert("db1".to_string(), schema(&[("t", &["id"])]));
        let union = UnionSchema::compute(&physical);
        union.persist(dir.path()).unwrap();
        let reread = UnionSchema::read(dir.path()).unwrap();
        assert_eq!(reread.tables, union.tables);
    }

    #[test]
    fn missing_cache_file_triggers_rescan() {
        let dir = tempfile::tempdir().unwrap();
        let mut physical = BTreeMap::new();
        physical.insert("db1".to_string(), schema(&[("t", &["id"])]));
        let union = load_or_rescan(dir.path(), &physical).unwrap();
        assert_eq!(union.tables["t"], vec!["id"]);
        assert!(dir.path().join("schema_cache.json").exists());
    }

    #[test]
    fn malformed_cache_file_triggers_rescan() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("schema_cache.json"), b"not json").unwrap();
        let physical = BTreeMap::new();
        let union = load_or_rescan(dir.path(), &physical).unwrap();
        assert!(union.tables.is_empty());
    }
}
