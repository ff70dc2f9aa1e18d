//! Stateless SQL assembly for the query and mutate pipelines.
//!
//! Every table/column name handed to `rusqlite` passes through
//! [`quote_identifier`] first; every user-supplied value is bound as a `?`
//! parameter, never interpolated. This is the single chokepoint the rest of
//! the crate routes through to keep that invariant in one place.

mod builder;

pub use builder::{Assembled, SqlBuilder};

use crate::errors::{AppError, AppResult};
use crate::models::{Filter, Logic};

/// Wrap an identifier in double quotes, doubling any internal quote.
///
/// `users` -> `"users"`; `a"b` -> `"a""b"`.
pub fn quote_identifier(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

/// Escape `\`, `%`, `_` (in that order) and wrap the result in `%…%` for a
/// `LIKE` predicate. Order matters: escaping `%`/`_` before `\` would
/// double-escape the backslashes the first pass introduces.
pub fn like_escape(value: &str) -> String {
    let escaped = value
        .replace('\\', "\\\\")
        .replace('%', "\\%")
        .replace('_', "\\_");
    format!("%{}%", escaped)
}

/// Validate that every filter's `logic` (when present on a non-terminal
/// filter) parses to `AND`/`OR`. `Filter.logic` is already typed as
/// `Option<Logic>`, so this mainly exists for the token-string entry point
/// used by callers deserializing raw JSON logic tokens.
pub fn parse_logic_token(token: &str) -> AppResult<Logic> {
    Logic::parse(token).ok_or_else(|| AppError::InvalidLogicToken {
        token: token.to_string(),
    })
}

pub(crate) fn validate_filters(filters: &[Filter]) -> AppResult<()> {
    for f in filters {
        if f.field.trim().is_empty() {
            return Err(AppError::invalid_argument("field", "filter field must not be empty"));
        }
    }
    Ok(())
}
