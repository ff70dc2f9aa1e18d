//! Physical and union schema discovery, spec.md §4.2 and §3.

mod probe;
mod union;

pub use probe::{probe_schema, PhysicalSchema};
pub use union::{load_or_rescan, UnionSchema};

/// Tables beginning with this prefix are SQLite's own internal objects and
/// are never treated as user tables.
pub const SQLITE_RESERVED_PREFIX: &str = "sqlite_";

/// The gateway's own migration-tracking table, excluded from discovered
/// user tables the same way `sqlite_%` names are.
pub const SCHEMA_VERSION_TABLE: &str = "schema_version";

pub(crate) fn is_reserved_table(name: &str) -> bool {
    name.starts_with(SQLITE_RESERVED_PREFIX) || name == SCHEMA_VERSION_TABLE
}
