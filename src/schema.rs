//! Per-project schema catalog and key graph.
//!
//! The catalog describes every table and field (types, descriptions, sample
//! values, uniqueness). The key graph carries declared primary/foreign keys
//! and is used only for join-path discovery.

use crate::error::Result;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Declared numeric range of a field, when known.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ValueRange {
    pub min: f64,
    pub max: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct FieldInfo {
    #[serde(default)]
    pub field_data_type: String,
    #[serde(default)]
    pub field_description: String,
    #[serde(default)]
    pub field_sample_values: Vec<String>,
    #[serde(default)]
    pub field_uniqueness_percent: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub field_value_range: Option<ValueRange>,
}

impl FieldInfo {
    pub fn is_numeric(&self) -> bool {
        let dtype = self.field_data_type.to_lowercase();
        dtype.contains("int") || dtype.contains("float") || dtype.contains("real")
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct TableInfo {
    #[serde(default)]
    pub table_description: String,
    /// Field name -> metadata. BTreeMap keeps "first declared field"
    /// deterministic across runs.
    #[serde(default)]
    pub fields: BTreeMap<String, FieldInfo>,
}

/// Table name -> table metadata. Immutable per project version.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct SchemaCatalog {
    #[serde(flatten)]
    pub tables: BTreeMap<String, TableInfo>,
}

impl SchemaCatalog {
    pub fn from_json(bytes: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(bytes)?)
    }

    pub fn table(&self, name: &str) -> Option<&TableInfo> {
        self.tables.get(name)
    }

    pub fn field(&self, table: &str, field: &str) -> Option<&FieldInfo> {
        self.tables.get(table).and_then(|t| t.fields.get(field))
    }

    pub fn has_field(&self, table: &str, field: &str) -> bool {
        self.field(table, field).is_some()
    }

    /// Human-readable summary used to answer questions about the database.
    /// Shows up to ten fields per table.
    pub fn summary(&self) -> String {
        let mut sections = Vec::new();
        for (table_name, table) in &self.tables {
            let mut lines = vec![format!("Table: {}", table_name)];
            if !table.table_description.is_empty() {
                lines.push(format!("  {}", table.table_description));
            }
            for (field_name, info) in table.fields.iter().take(10) {
                let desc: String = info.field_description.chars().take(100).collect();
                lines.push(format!(
                    "  - {} ({}): {}",
                    field_name, info.field_data_type, desc
                ));
            }
            if table.fields.len() > 10 {
                lines.push(format!("  ... and {} more fields", table.fields.len() - 10));
            }
            sections.push(lines.join("\n"));
        }
        format!("Available Tables and Fields:\n{}", sections.join("\n"))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct TableKeys {
    #[serde(default)]
    pub pk: Option<String>,
    /// Foreign-key field -> referenced table.
    #[serde(default)]
    pub fks: BTreeMap<String, String>,
}

/// Declared key relationships per table. A table absent from the graph has
/// no declared relationships.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct KeyGraph {
    #[serde(flatten)]
    pub tables: BTreeMap<String, TableKeys>,
}

impl KeyGraph {
    pub fn from_json(bytes: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(bytes)?)
    }

    pub fn declared_pk(&self, table: &str) -> Option<&str> {
        self.tables
            .get(table)
            .and_then(|keys| keys.pk.as_deref())
            .filter(|pk| !pk.is_empty())
    }

    pub fn foreign_keys(&self, table: &str) -> Option<&BTreeMap<String, String>> {
        self.tables.get(table).map(|keys| &keys.fks)
    }
}

/// Resolve the primary key of a table.
///
/// Order: declared pk in the key graph, then the common naming patterns
/// ({table}_id, id, {table}id and uppercase variants) against the catalog,
/// then the first declared field, then the literal "id". Never returns an
/// empty string.
pub fn resolve_primary_key(table: &str, catalog: &SchemaCatalog, keys: &KeyGraph) -> String {
    if let Some(pk) = keys.declared_pk(table) {
        return pk.to_string();
    }

    if let Some(info) = catalog.table(table) {
        let patterns = [
            format!("{}_id", table),
            "id".to_string(),
            format!("{}id", table),
            format!("{}_ID", table),
            "ID".to_string(),
        ];
        for pattern in &patterns {
            if info.fields.contains_key(pattern) {
                return pattern.clone();
            }
        }
        if let Some(first_field) = info.fields.keys().next() {
            tracing::warn!(table, field = %first_field, "no standard pk found, using first field");
            return first_field.clone();
        }
    }

    tracing::warn!(table, "could not determine primary key, defaulting to 'id'");
    "id".to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn catalog_with(table: &str, fields: &[&str]) -> SchemaCatalog {
        let mut info = TableInfo::default();
        for field in fields {
            info.fields.insert(field.to_string(), FieldInfo::default());
        }
        let mut catalog = SchemaCatalog::default();
        catalog.tables.insert(table.to_string(), info);
        catalog
    }

    #[test]
    fn test_sample_values_are_text() {
        // Sample values are collected as CAST(... AS TEXT) strings and
        // joined straight into description prompts.
        let info = FieldInfo {
            field_data_type: "text".to_string(),
            field_sample_values: vec!["Female".to_string(), "Male".to_string()],
            ..Default::default()
        };
        assert_eq!(info.field_sample_values.join(", "), "Female, Male");

        let bytes = serde_json::to_vec(&info).unwrap();
        let back: FieldInfo = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(back.field_sample_values, info.field_sample_values);
    }

    #[test]
    fn test_pk_prefers_declared() {
        let catalog = catalog_with("patient", &["uid", "patient_id"]);
        let mut keys = KeyGraph::default();
        keys.tables.insert(
            "patient".to_string(),
            TableKeys {
                pk: Some("uid".to_string()),
                fks: BTreeMap::new(),
            },
        );
        assert_eq!(resolve_primary_key("patient", &catalog, &keys), "uid");
    }

    #[test]
    fn test_pk_pattern_fallback() {
        let catalog = catalog_with("patient", &["name", "patient_id"]);
        let keys = KeyGraph::default();
        assert_eq!(resolve_primary_key("patient", &catalog, &keys), "patient_id");
    }

    #[test]
    fn test_pk_first_field_fallback() {
        let catalog = catalog_with("visit", &["admitted_at", "ward"]);
        let keys = KeyGraph::default();
        // BTreeMap order: admitted_at sorts first.
        assert_eq!(resolve_primary_key("visit", &catalog, &keys), "admitted_at");
    }

    #[test]
    fn test_pk_never_empty() {
        let catalog = SchemaCatalog::default();
        let keys = KeyGraph::default();
        assert_eq!(resolve_primary_key("unknown", &catalog, &keys), "id");
    }

    #[test]
    fn test_empty_declared_pk_is_ignored() {
        let catalog = catalog_with("labs", &["labs_id", "value"]);
        let mut keys = KeyGraph::default();
        keys.tables.insert(
            "labs".to_string(),
            TableKeys {
                pk: Some(String::new()),
                fks: BTreeMap::new(),
            },
        );
        assert_eq!(resolve_primary_key("labs", &catalog, &keys), "labs_id");
    }
}
