//! Per-connection physical schema discovery, spec.md §4.2.

use super::is_reserved_table;
use crate::errors::AppResult;
use rusqlite::Connection;
use std::collections::BTreeMap;

/// Tables and columns physically present in one open database, plus the
/// auto-detected default table.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct PhysicalSchema {
    /// table name -> sorted column names.
    pub tables: BTreeMap<String, Vec<String>>,
    /// First user table in ascending name order, if any.
    pub default_table: Option<String>,
}

/// Enumerate user tables and their columns on an open connection.
///
/// Excludes `sqlite_%` system tables and the gateway's own
/// `schema_version` marker table.
pub fn probe_schema(conn: &Connection) -> AppResult<PhysicalSchema> {
    let mut stmt = conn.prepare(
        "SELECT name FROM sqlite_master WHERE type='table' ORDER BY name ASC",
    )?;
    let names: Vec<String> = stmt
        .query_map([], |row| row.get::<_, String>(0))?
        .collect::<Result<_, _>>()?;

    let mut tables = BTreeMap::new();
    for name in names {
        if is_reserved_table(&name) {
            continue;
        }
        let mut columns = table_columns(conn, &name)?;
        columns.sort();
        tables.insert(name, columns);
    }

    let default_table = tables.keys().next().cloned();
    Ok(PhysicalSchema {
        tables,
        default_table,
    })
}

fn table_columns(conn: &Connection, table: &str) -> AppResult<Vec<String>> {
    // `table_info` is a pragma table-valued function; the table name cannot
    // be bound as a parameter, so it goes through identifier quoting instead.
    let quoted = crate::sql::quote_identifier(table);
    let sql = format!("SELECT name FROM pragma_table_info({quoted})");
    let mut stmt = conn.prepare(&sql)?;
    let columns = stmt
        .query_map([], |row| row.get::<_, String>(0))?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(columns)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn setup() -> Connection {
        let conn = Connection::open_in_memory().unwrap();
        conn.execute_batch(
            "CREATE TABLE zeta (id INTEGER PRIMARY KEY, name TEXT);
             CREATE TABLE alpha (id INTEGER PRIMARY KEY, val TEXT);
             CREATE TABLE schema_version (version INTEGER);",
        )
        .unwrap();
        conn
    }

    #[test]
    fn excludes_reserved_and_marker_tables() {
        let conn = setup();
        let schema = probe_schema(&conn).unwrap();
        assert_eq!(schema.tables.len(), 2);
        assert!(!schema.tables.contains_key("schema_version"));
        assert!(schema.tables.keys().all(|t| !t.starts_with("sqlite_")));
    }

    #[test]
    fn default_table_is_first_in_ascending_order() {
        let conn = setup();
        let schema = probe_schema(&conn).unwrap();
        assert_eq!(schema.default_table.as_deref(), Some("alpha"));
    }

    #[test]
    fn columns_are_sorted() {
        let conn = setup();
        let schema = probe_schema(&conn).unwrap();
        assert_eq!(schema.tables["alpha"], vec!["id".to_string(), "val".to_string()]);
    }

    #[test]
    fn empty_database_has_no_default_table() {
        let conn = Connection::open_in_memory().unwrap();
        let schema = probe_schema(&conn).unwrap();
        assert!(schema.default_table.is_none());
        assert!(schema.tables.is_empty());
    }
}
