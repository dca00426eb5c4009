//! Table/column model shared by drivers and the structure diff

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;

use strata_core::{MigrationError, MigrationResult};

/// Tables of a database keyed by name
///
/// Loaded from YAML for the expected side:
///
/// ```yaml
/// tables:
///   users:
///     columns:
///       - { name: id, type: integer, nullable: false }
///       - { name: email, type: character varying }
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchemaSnapshot {
    #[serde(default)]
    pub tables: BTreeMap<String, TableSchema>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableSchema {
    #[serde(default)]
    pub columns: Vec<ColumnSchema>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnSchema {
    pub name: String,
    #[serde(rename = "type")]
    pub data_type: String,
    #[serde(default = "default_nullable")]
    pub nullable: bool,
}

fn default_nullable() -> bool {
    true
}

impl ColumnSchema {
    pub fn new(name: impl Into<String>, data_type: impl Into<String>, nullable: bool) -> Self {
        Self {
            name: name.into(),
            data_type: data_type.into(),
            nullable,
        }
    }

    /// Types compare case-insensitively with collapsed whitespace
    pub fn same_type(&self, other: &ColumnSchema) -> bool {
        normalize(&self.data_type) == normalize(&other.data_type)
    }
}

impl TableSchema {
    pub fn column(&self, name: &str) -> Option<&ColumnSchema> {
        self.columns.iter().find(|c| c.name == name)
    }
}

impl SchemaSnapshot {
    pub fn from_yaml(content: &str) -> MigrationResult<Self> {
        serde_yaml::from_str(content).map_err(|e| {
            MigrationError::configuration(format!("invalid schema definition: {}", e))
        })
    }

    pub fn from_file(path: impl AsRef<Path>) -> MigrationResult<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            MigrationError::configuration(format!(
                "cannot read schema file {}: {}",
                path.display(),
                e
            ))
        })?;
        Self::from_yaml(&content)
    }

    /// Append a column, creating the table on first use
    pub fn push_column(&mut self, table: &str, column: ColumnSchema) {
        self.tables
            .entry(table.to_string())
            .or_default()
            .columns
            .push(column);
    }

    pub fn with_table<I>(mut self, table: &str, columns: I) -> Self
    where
        I: IntoIterator<Item = ColumnSchema>,
    {
        let entry = self.tables.entry(table.to_string()).or_default();
        entry.columns.extend(columns);
        self
    }
}

/// Lowercase and collapse runs of whitespace
pub(crate) fn normalize(text: &str) -> String {
    text.split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_schema_from_yaml() {
        let schema = SchemaSnapshot::from_yaml(
            r#"
tables:
  users:
    columns:
      - { name: id, type: integer, nullable: false }
      - { name: email, type: character varying }
  tags: {}
"#,
        )
        .unwrap();

        let users = &schema.tables["users"];
        assert_eq!(users.columns.len(), 2);
        assert!(!users.column("id").unwrap().nullable);
        assert!(users.column("email").unwrap().nullable);
        assert!(schema.tables["tags"].columns.is_empty());
    }

    #[test]
    fn test_type_comparison_is_normalized() {
        let a = ColumnSchema::new("x", "Character  Varying", true);
        let b = ColumnSchema::new("x", "character varying", false);
        assert!(a.same_type(&b));
    }

    #[test]
    fn test_invalid_yaml_is_a_configuration_error() {
        let err = SchemaSnapshot::from_yaml("tables: [1, 2").unwrap_err();
        assert!(err.is_configuration());
    }
}
