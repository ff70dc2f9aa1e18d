//! Select/Count/Insert/Update/Delete assembly, spec.md §4.1.

use super::{like_escape, quote_identifier};
use crate::errors::{AppError, AppResult};
use crate::models::Filter;
use rusqlite::types::Value as SqlValue;
use serde_json::Value as JsonValue;
use std::collections::HashMap;

const DEFAULT_PAGE: i64 = 1;
const DEFAULT_SIZE: i64 = 50;
const MAX_SIZE: i64 = 2000;

/// A fully assembled statement: SQL text plus its positional bind values,
/// in the order the `?` placeholders appear.
#[derive(Debug, Clone, PartialEq)]
pub struct Assembled {
    pub sql: String,
    pub args: Vec<SqlValue>,
}

/// Stateless SQL assembler. Holds no connection or configuration; every
/// method takes exactly the structured parameters it needs.
pub struct SqlBuilder;

impl SqlBuilder {
    /// `SELECT "f1","f2",… FROM "table" [WHERE …] LIMIT ? OFFSET ?`.
    pub fn select(
        table: &str,
        fields: &[String],
        filters: &[Filter],
        page: i64,
        size: i64,
    ) -> AppResult<Assembled> {
        if fields.is_empty() {
            return Err(AppError::invalid_argument("fields", "select list must not be empty"));
        }
        let (page, size) = Self::clamp_page_size(page, size);
        let select_list = fields
            .iter()
            .map(|f| quote_identifier(f))
            .collect::<Vec<_>>()
            .join(",");
        let (where_sql, mut args) = Self::build_where(filters)?;
        let mut sql = format!("SELECT {select_list} FROM {}", quote_identifier(table));
        if !where_sql.is_empty() {
            sql.push_str(" WHERE ");
            sql.push_str(&where_sql);
        }
        sql.push_str(" LIMIT ? OFFSET ?");
        let offset = (page - 1) * size;
        args.push(SqlValue::Integer(size));
        args.push(SqlValue::Integer(offset));
        Ok(Assembled { sql, args })
    }

    /// `SELECT COUNT(*) FROM "table" [WHERE …]` — identical WHERE clause
    /// generation to `select`, no LIMIT/OFFSET.
    pub fn count(table: &str, filters: &[Filter]) -> AppResult<Assembled> {
        let (where_sql, args) = Self::build_where(filters)?;
        let mut sql = format!("SELECT COUNT(*) FROM {}", quote_identifier(table));
        if !where_sql.is_empty() {
            sql.push_str(" WHERE ");
            sql.push_str(&where_sql);
        }
        Ok(Assembled { sql, args })
    }

    /// `INSERT INTO "table" ("c1","c2") VALUES (?,?)` with columns in
    /// lexicographic sort order so output is deterministic regardless of
    /// the caller's map iteration order.
    pub fn insert(table: &str, data: &HashMap<String, JsonValue>) -> AppResult<Assembled> {
        if data.is_empty() {
            return Err(AppError::invalid_argument("data", "insert data must not be empty"));
        }
        let mut keys: Vec<&String> = data.keys().collect();
        keys.sort();
        let columns = keys
            .iter()
            .map(|k| quote_identifier(k))
            .collect::<Vec<_>>()
            .join(",");
        let placeholders = keys.iter().map(|_| "?").collect::<Vec<_>>().join(",");
        let args = keys
            .iter()
            .map(|k| json_to_sql(&data[*k]))
            .collect::<Vec<_>>();
        let sql = format!(
            "INSERT INTO {} ({columns}) VALUES ({placeholders})",
            quote_identifier(table)
        );
        Ok(Assembled { sql, args })
    }

    /// `UPDATE "table" SET "c1"=?,"c2"=? WHERE …` — same sorted key
    /// ordering as `insert`; empty data and empty filters are both
    /// rejected (an unconditional UPDATE is as dangerous as an
    /// unconditional DELETE).
    pub fn update(
        table: &str,
        data: &HashMap<String, JsonValue>,
        filters: &[Filter],
    ) -> AppResult<Assembled> {
        if data.is_empty() {
            return Err(AppError::invalid_argument("data", "update data must not be empty"));
        }
        if filters.is_empty() {
            return Err(AppError::invalid_argument("filters", "update requires at least one filter"));
        }
        let mut keys: Vec<&String> = data.keys().collect();
        keys.sort();
        let set_clause = keys
            .iter()
            .map(|k| format!("{}=?", quote_identifier(k)))
            .collect::<Vec<_>>()
            .join(",");
        let mut args: Vec<SqlValue> = keys.iter().map(|k| json_to_sql(&data[*k])).collect();
        let (where_sql, where_args) = Self::build_where(filters)?;
        args.extend(where_args);
        let sql = format!(
            "UPDATE {} SET {set_clause} WHERE {where_sql}",
            quote_identifier(table)
        );
        Ok(Assembled { sql, args })
    }

    /// `DELETE FROM "table" WHERE …` — rejects an empty filter list per
    /// spec.md §3's "no unconditional DELETE" invariant.
    pub fn delete(table: &str, filters: &[Filter]) -> AppResult<Assembled> {
        if filters.is_empty() {
            return Err(AppError::EmptyDeleteFilters);
        }
        let (where_sql, args) = Self::build_where(filters)?;
        let sql = format!(
            "DELETE FROM {} WHERE {where_sql}",
            quote_identifier(table)
        );
        Ok(Assembled { sql, args })
    }

    fn clamp_page_size(page: i64, size: i64) -> (i64, i64) {
        let page = if page < 1 { DEFAULT_PAGE } else { page };
        let size = if size < 1 {
            DEFAULT_SIZE
        } else if size > MAX_SIZE {
            MAX_SIZE
        } else {
            size
        };
        (page, size)
    }

    fn build_where(filters: &[Filter]) -> AppResult<(String, Vec<SqlValue>)> {
        if filters.is_empty() {
            return Ok((String::new(), Vec::new()));
        }
        let mut clause = String::new();
        let mut args = Vec::with_capacity(filters.len());
        for (i, f) in filters.iter().enumerate() {
            if f.fuzzy {
                clause.push_str(&format!("{} LIKE ?", quote_identifier(&f.field)));
                let s = json_as_str(&f.value);
                args.push(SqlValue::Text(like_escape(&s)));
            } else {
                clause.push_str(&format!("{} = ?", quote_identifier(&f.field)));
                args.push(json_to_sql(&f.value));
            }
            if i < filters.len() - 1 {
                let logic = f.logic.ok_or_else(|| AppError::InvalidLogicToken {
                    token: "<missing>".to_string(),
                })?;
                clause.push(' ');
                clause.push_str(logic.as_sql());
                clause.push(' ');
            }
        }
        Ok((clause, args))
    }
}

fn json_as_str(value: &JsonValue) -> String {
    match value {
        JsonValue::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn json_to_sql(value: &JsonValue) -> SqlValue {
    match value {
        JsonValue::Null => SqlValue::Null,
        JsonValue::Bool(b) => SqlValue::Integer(if *b { 1 } else { 0 }),
        JsonValue::Number(n) => {
            if let Some(i) = n.as_i64() {
                SqlValue::Integer(i)
            } else if let Some(f) = n.as_f64() {
                SqlValue::Real(f)
            } else {
                SqlValue::Null
            }
        }
        JsonValue::String(s) => SqlValue::Text(s.clone()),
        other => SqlValue::Text(other.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Logic;

    fn f(field: &str, value: JsonValue, fuzzy: bool, logic: Option<Logic>) -> Filter {
        Filter {
            field: field.to_string(),
            value,
            fuzzy,
            logic,
        }
    }

    #[test]
    fn select_quotes_identifiers_and_binds_params() {
        let filters = vec![f("name", JsonValue::String("alice".into()), false, None)];
        let fields = vec!["id".to_string(), "name".to_string()];
        let assembled = SqlBuilder::select("users", &fields, &filters, 1, 10).unwrap();
        assert_eq!(
            assembled.sql,
            "SELECT \"id\",\"name\" FROM \"users\" WHERE \"name\" = ? LIMIT ? OFFSET ?"
        );
        assert_eq!(
            assembled.args,
            vec![
                SqlValue::Text("alice".into()),
                SqlValue::Integer(10),
                SqlValue::Integer(0)
            ]
        );
    }

    #[test]
    fn quote_identifier_doubles_internal_quotes() {
        assert_eq!(quote_identifier("a\"b"), "\"a\"\"b\"");
    }

    #[test]
    fn fuzzy_escapes_in_order_then_wraps() {
        // S4: {field:"name", value:"50%_off", fuzzy:true} -> arg "%50\%\_off%"
        let filters = vec![f("name", JsonValue::String("50%_off".into()), true, None)];
        let (where_sql, args) = SqlBuilder::build_where(&filters).unwrap();
        assert_eq!(where_sql, "\"name\" LIKE ?");
        assert_eq!(args, vec![SqlValue::Text("%50\\%\\_off%".into())]);
    }

    #[test]
    fn logic_joins_consecutive_filters_with_preceding_token() {
        let filters = vec![
            f("a", JsonValue::from(1), false, Some(Logic::And)),
            f("b", JsonValue::from(2), false, None),
        ];
        let (where_sql, _) = SqlBuilder::build_where(&filters).unwrap();
        assert_eq!(where_sql, "\"a\" = ? AND \"b\" = ?");
    }

    #[test]
    fn insert_orders_columns_lexicographically() {
        let mut data = HashMap::new();
        data.insert("zeta".to_string(), JsonValue::from(1));
        data.insert("alpha".to_string(), JsonValue::from(2));
        let assembled = SqlBuilder::insert("t", &data).unwrap();
        assert_eq!(
            assembled.sql,
            "INSERT INTO \"t\" (\"alpha\",\"zeta\") VALUES (?,?)"
        );
        assert_eq!(
            assembled.args,
            vec![SqlValue::Integer(2), SqlValue::Integer(1)]
        );
    }

    #[test]
    fn update_rejects_empty_filters() {
        let mut data = HashMap::new();
        data.insert("a".to_string(), JsonValue::from(1));
        let err = SqlBuilder::update("t", &data, &[]).unwrap_err();
        assert!(matches!(err, AppError::InvalidArgument { .. }));
    }

    #[test]
    fn delete_rejects_empty_filters() {
        let err = SqlBuilder::delete("t", &[]).unwrap_err();
        assert!(matches!(err, AppError::EmptyDeleteFilters));
    }

    #[test]
    fn page_and_size_clamp() {
        let fields = vec!["id".to_string()];
        let assembled = SqlBuilder::select("t", &fields, &[], 0, 999_999).unwrap();
        assert!(assembled.args.contains(&SqlValue::Integer(2000)));
    }
}
