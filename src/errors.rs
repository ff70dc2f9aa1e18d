//! Centralized error handling for the query gateway.
//!
//! One `thiserror`-derived enum covering every failure category,
//! serializable for transport to an embedding HTTP layer, with
//! `category()` and `http_status()` as the single source of truth for the
//! error envelope codes.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Crate-wide result type.
pub type AppResult<T> = Result<T, AppError>;

/// Gateway-wide error enum covering fleet, config, query, mutate, rate
/// limiter, and plugin supervisor failures.
#[derive(Error, Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "details")]
pub enum AppError {
    // Not found
    #[error("business group not found: {group}")]
    BizNotFound { group: String },

    #[error("table not found: {group}/{table}")]
    TableNotFound { group: String, table: String },

    #[error("record not found: {entity} with {field} = {value}")]
    RecordNotFound {
        entity: String,
        field: String,
        value: String,
    },

    // Permission
    #[error("permission denied or not queryable: {reason}")]
    PermissionDenied { reason: String },

    // Invalid argument
    #[error("invalid argument: {field} - {message}")]
    InvalidArgument { field: String, message: String },

    #[error("unknown logic token: {token}")]
    InvalidLogicToken { token: String },

    #[error("field not returnable: {field}")]
    FieldNotReturnable { field: String },

    #[error("delete rejected: filters must not be empty")]
    EmptyDeleteFilters,

    // Unavailable
    #[error("database unavailable: {group}/{lib} - {reason}")]
    Unavailable {
        group: String,
        lib: String,
        reason: String,
    },

    // Partial / fan-out
    #[error("operation on db '{lib}' aborted: {reason} (earlier databases may have already applied this change)")]
    MutateAborted { lib: String, reason: String },

    #[error("partial result: {message}")]
    Partial {
        message: String,
        rows: Vec<crate::models::Row>,
        total: i64,
    },

    // Rate limiting
    #[error("rate limit exceeded: {scope}")]
    RateLimited { scope: String },

    #[error("account locked: too many failed attempts, retry after {retry_after_secs}s")]
    LoginLocked { retry_after_secs: i64 },

    // Plugin supervisor
    #[error("plugin error: {operation} - {reason}")]
    Plugin { operation: String, reason: String },

    #[error("checksum mismatch for {artifact}: expected {expected}, got {actual}")]
    ChecksumMismatch {
        artifact: String,
        expected: String,
        actual: String,
    },

    #[error("unsafe archive entry escapes install root: {entry}")]
    ZipSlip { entry: String },

    // Generic
    #[error("database operation failed: {message}")]
    Database { message: String },

    #[error("internal error: {message}")]
    Internal { message: String },

    #[error("configuration error: {key} - {reason}")]
    Configuration { key: String, reason: String },
}

impl AppError {
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    pub fn invalid_argument(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self::InvalidArgument {
            field: field.into(),
            message: message.into(),
        }
    }

    pub fn permission_denied(reason: impl Into<String>) -> Self {
        Self::PermissionDenied {
            reason: reason.into(),
        }
    }

    /// Error category for logging and metrics.
    pub fn category(&self) -> &'static str {
        match self {
            Self::BizNotFound { .. } | Self::TableNotFound { .. } | Self::RecordNotFound { .. } => {
                "not_found"
            }
            Self::PermissionDenied { .. } => "permission",
            Self::InvalidArgument { .. }
            | Self::InvalidLogicToken { .. }
            | Self::FieldNotReturnable { .. }
            | Self::EmptyDeleteFilters => "invalid_argument",
            Self::Unavailable { .. } => "unavailable",
            Self::MutateAborted { .. } | Self::Partial { .. } => "partial",
            Self::RateLimited { .. } | Self::LoginLocked { .. } => "rate_limited",
            Self::Plugin { .. } | Self::ChecksumMismatch { .. } | Self::ZipSlip { .. } => "plugin",
            Self::Database { .. } | Self::Configuration { .. } | Self::Internal { .. } => "internal",
        }
    }

    /// HTTP status code the embedding layer should surface for this error.
    pub fn http_status(&self) -> u16 {
        match self {
            Self::BizNotFound { .. } | Self::TableNotFound { .. } | Self::RecordNotFound { .. } => 404,
            Self::PermissionDenied { .. } => 403,
            Self::InvalidArgument { .. }
            | Self::InvalidLogicToken { .. }
            | Self::FieldNotReturnable { .. }
            | Self::EmptyDeleteFilters => 400,
            Self::RateLimited { .. } | Self::LoginLocked { .. } => 429,
            _ => 500,
        }
    }
}

impl From<rusqlite::Error> for AppError {
    fn from(err: rusqlite::Error) -> Self {
        Self::Database {
            message: err.to_string(),
        }
    }
}

impl From<std::io::Error> for AppError {
    fn from(err: std::io::Error) -> Self {
        Self::Internal {
            message: format!("io error: {}", err),
        }
    }
}

impl From<serde_json::Error> for AppError {
    fn from(err: serde_json::Error) -> Self {
        Self::Internal {
            message: format!("json error: {}", err),
        }
    }
}

impl From<notify::Error> for AppError {
    fn from(err: notify::Error) -> Self {
        Self::Internal {
            message: format!("filesystem watch error: {}", err),
        }
    }
}

impl From<reqwest::Error> for AppError {
    fn from(err: reqwest::Error) -> Self {
        Self::Plugin {
            operation: "download".to_string(),
            reason: err.to_string(),
        }
    }
}

impl From<tonic::Status> for AppError {
    fn from(status: tonic::Status) -> Self {
        Self::Plugin {
            operation: "grpc".to_string(),
            reason: status.message().to_string(),
        }
    }
}

impl From<tonic::transport::Error> for AppError {
    fn from(err: tonic::transport::Error) -> Self {
        Self::Plugin {
            operation: "grpc_connect".to_string(),
            reason: err.to_string(),
        }
    }
}

impl From<zip::result::ZipError> for AppError {
    fn from(err: zip::result::ZipError) -> Self {
        Self::Plugin {
            operation: "unzip".to_string(),
            reason: err.to_string(),
        }
    }
}

impl From<anyhow::Error> for AppError {
    fn from(err: anyhow::Error) -> Self {
        Self::Internal {
            message: err.to_string(),
        }
    }
}

impl From<AppError> for String {
    fn from(err: AppError) -> Self {
        err.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn categories_match_families() {
        assert_eq!(
            AppError::BizNotFound { group: "a".into() }.category(),
            "not_found"
        );
        assert_eq!(AppError::permission_denied("x").category(), "permission");
        assert_eq!(AppError::EmptyDeleteFilters.category(), "invalid_argument");
    }

    #[test]
    fn http_status_codes() {
        assert_eq!(
            AppError::BizNotFound { group: "a".into() }.http_status(),
            404
        );
        assert_eq!(AppError::permission_denied("x").http_status(), 403);
        assert_eq!(AppError::EmptyDeleteFilters.http_status(), 400);
        assert_eq!(AppError::internal("x").http_status(), 500);
    }

    #[test]
    fn mutate_aborted_names_the_failing_db() {
        let err = AppError::MutateAborted {
            lib: "db2".into(),
            reason: "UNIQUE constraint failed".into(),
        };
        assert!(err.to_string().contains("operation on db 'db2' aborted"));
    }
}
