//! Admin configuration entities, spec.md §3 and §6.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Per-group publicity and default-table settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct GroupSettings {
    pub is_publicly_searchable: bool,
    pub default_query_table: Option<String>,
}

/// A returnable/searchable field's data type. `String` is the default when
/// the admin store doesn't name one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DataType {
    String,
    Number,
    Date,
    Boolean,
}

impl Default for DataType {
    fn default() -> Self {
        DataType::String
    }
}

/// Field-level searchable/returnable flags, spec.md §3.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FieldSetting {
    pub field_name: String,
    pub is_searchable: bool,
    pub is_returnable: bool,
    #[serde(default)]
    pub data_type: DataType,
}

/// One table's configuration within a group: searchability plus write
/// permissions. `allow_create/update/delete` live on `biz_searchable_tables`
/// and are authoritative (see DESIGN.md's Open Question resolution).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TableConfig {
    pub table_name: String,
    pub is_searchable: bool,
    pub allow_create: bool,
    pub allow_update: bool,
    pub allow_delete: bool,
    pub fields: HashMap<String, FieldSetting>,
}

impl TableConfig {
    pub fn field(&self, name: &str) -> Option<&FieldSetting> {
        self.fields.get(name)
    }

    pub fn is_field_searchable(&self, name: &str) -> bool {
        self.field(name).map(|f| f.is_searchable).unwrap_or(false)
    }

    pub fn is_field_returnable(&self, name: &str) -> bool {
        self.field(name).map(|f| f.is_returnable).unwrap_or(false)
    }

    pub fn returnable_fields(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .fields
            .values()
            .filter(|f| f.is_returnable)
            .map(|f| f.field_name.clone())
            .collect();
        names.sort();
        names
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ViewType {
    Cards,
    Table,
    List,
    Kanban,
    Calendar,
}

/// A saved presentation binding between table fields and a UI layout.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ViewConfig {
    pub view_name: String,
    pub view_type: ViewType,
    pub display_name: String,
    pub is_default: bool,
    pub binding: serde_json::Value,
}

/// Rate/burst pair shared by the global, per-user, and per-group limiter
/// settings.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct RateLimitSetting {
    pub rate_per_second: f64,
    pub burst: u32,
}

/// Per-user override; `None` fields inherit the default setting.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq)]
pub struct UserRateLimitOverride {
    pub rate_per_second: Option<f64>,
    pub burst: Option<u32>,
}

/// The full per-group aggregate the admin cache stores, spec.md §4.5.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BizQueryConfig {
    pub group: GroupSettings,
    pub tables: HashMap<String, TableConfig>,
    pub views: Vec<ViewConfig>,
    pub rate_limit: Option<RateLimitSetting>,
}

impl BizQueryConfig {
    pub fn table(&self, name: &str) -> Option<&TableConfig> {
        self.tables.get(name)
    }
}

/// A `plugin_instances` row as created by `CreateInstance`, spec.md §4.9
/// and §6.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PluginInstanceRow {
    pub instance_id: String,
    pub display_name: String,
    pub plugin_id: String,
    pub version: String,
    pub biz_name: String,
    pub port: u16,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn returnable_fields_are_sorted() {
        let mut fields = HashMap::new();
        fields.insert(
            "zeta".to_string(),
            FieldSetting {
                field_name: "zeta".to_string(),
                is_searchable: true,
                is_returnable: true,
                data_type: DataType::String,
            },
        );
        fields.insert(
            "alpha".to_string(),
            FieldSetting {
                field_name: "alpha".to_string(),
                is_searchable: true,
                is_returnable: true,
                data_type: DataType::String,
            },
        );
        let table = TableConfig {
            table_name: "t".to_string(),
            is_searchable: true,
            allow_create: false,
            allow_update: false,
            allow_delete: false,
            fields,
        };
        assert_eq!(table.returnable_fields(), vec!["alpha", "zeta"]);
    }
}
