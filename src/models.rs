//! Shared request/response data model for the query and mutate pipelines.
//!
//! Plain `serde`-derived structs; the HTTP/JSON transport around them is
//! the embedding application's job.

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::collections::HashMap;

/// A single data row returned by the fan-out query, annotated with the
/// originating database via the reserved `__lib` key.
pub type Row = HashMap<String, JsonValue>;

/// The `__lib` marker key injected into every returned row.
pub const LIB_MARKER: &str = "__lib";

/// Join token between consecutive filters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Logic {
    And,
    Or,
}

impl Logic {
    pub fn as_sql(&self) -> &'static str {
        match self {
            Logic::And => "AND",
            Logic::Or => "OR",
        }
    }

    pub fn parse(token: &str) -> Option<Self> {
        match token.to_ascii_uppercase().as_str() {
            "AND" => Some(Logic::And),
            "OR" => Some(Logic::Or),
            _ => None,
        }
    }
}

/// A single WHERE-clause predicate. `logic` joins this filter to the
/// *next* one in the list and is ignored on the final filter.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Filter {
    pub field: String,
    pub value: JsonValue,
    #[serde(default)]
    pub fuzzy: bool,
    #[serde(default)]
    pub logic: Option<Logic>,
}

/// Caller identity as resolved by the embedding application's auth layer.
/// The gateway trusts this value; it does not itself validate credentials.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CallerRole {
    Admin,
    Standard,
}

impl CallerRole {
    pub fn is_admin(&self) -> bool {
        matches!(self, CallerRole::Admin)
    }
}

/// Query pipeline input, spec.md §6.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryRequest {
    pub group: String,
    #[serde(default)]
    pub table: Option<String>,
    #[serde(default)]
    pub filters: Vec<Filter>,
    #[serde(default)]
    pub fields_to_return: Option<Vec<String>>,
    #[serde(default)]
    pub page: Option<i64>,
    #[serde(default)]
    pub size: Option<i64>,
}

/// Query pipeline output payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryData {
    pub items: Vec<Row>,
    pub total: i64,
}

/// Envelope returned by the query pipeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryResponse {
    pub data: QueryData,
    pub source: String,
}

/// Mutation kind, spec.md §4.7.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MutateOperation {
    Create,
    Update,
    Delete,
}

/// Mutation payload, spec.md §6.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MutatePayload {
    pub table_name: String,
    #[serde(default)]
    pub data: Option<HashMap<String, JsonValue>>,
    #[serde(default)]
    pub filters: Vec<Filter>,
}

/// Mutation pipeline input.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MutateRequest {
    pub group: String,
    pub operation: MutateOperation,
    pub payload: MutatePayload,
}

/// Mutation pipeline output payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MutateResult {
    pub success: bool,
    pub rows_affected: i64,
    pub message: String,
}

/// Envelope returned by the mutate pipeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MutateResponse {
    pub data: MutateResult,
    pub source: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn logic_parses_case_insensitively() {
        assert_eq!(Logic::parse("and"), Some(Logic::And));
        assert_eq!(Logic::parse("OR"), Some(Logic::Or));
        assert_eq!(Logic::parse("xor"), None);
    }

    #[test]
    fn mutate_operation_serializes_lowercase() {
        let json = serde_json::to_string(&MutateOperation::Create).unwrap();
        assert_eq!(json, "\"create\"");
    }
}
