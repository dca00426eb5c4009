//! Schema diff generation
//!
//! Generators compare the live database against an expected definition and
//! produce the SQL of a corrective migration. They are only used when
//! authoring migrations, never while applying them.

pub mod schema;

use async_trait::async_trait;
use std::collections::HashSet;
use std::path::Path;

use strata_core::{MigrationError, MigrationResult};

use crate::drivers::{Dialect, Driver};

pub use schema::{ColumnSchema, SchemaSnapshot, TableSchema};

/// Produces the body of a new migration, or `None` when nothing drifted
#[async_trait]
pub trait DiffGenerator: Send + Sync {
    async fn generate(&self, driver: &mut dyn Driver) -> MigrationResult<Option<String>>;
}

/// Diff of tables and columns against a YAML schema definition
#[derive(Debug, Clone)]
pub struct StructureDiffGenerator {
    expected: SchemaSnapshot,
    ignored: HashSet<String>,
    records_table: String,
}

impl StructureDiffGenerator {
    pub fn new(expected: SchemaSnapshot) -> Self {
        Self {
            expected,
            ignored: HashSet::new(),
            records_table: "migrations".to_string(),
        }
    }

    pub fn from_file(path: impl AsRef<Path>) -> MigrationResult<Self> {
        Ok(Self::new(SchemaSnapshot::from_file(path)?))
    }

    /// Table holding execution records; it is never reported as extra
    pub fn with_records_table(mut self, table: impl Into<String>) -> Self {
        self.records_table = table.into();
        self
    }

    /// Queries never to emit, one per line; blank lines and `--` comments
    /// are skipped
    pub fn with_ignored_queries(mut self, content: &str) -> Self {
        self.ignored.extend(
            content
                .lines()
                .map(str::trim)
                .filter(|line| !line.is_empty() && !line.starts_with("--"))
                .map(normalize_query),
        );
        self
    }

    pub fn with_ignored_queries_file(self, path: impl AsRef<Path>) -> MigrationResult<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            MigrationError::configuration(format!(
                "cannot read ignored queries file {}: {}",
                path.display(),
                e
            ))
        })?;
        Ok(self.with_ignored_queries(&content))
    }

    /// Statements turning `live` into the expected schema
    pub fn diff(&self, live: &SchemaSnapshot, dialect: Dialect) -> Vec<String> {
        let q = |name: &str| dialect.quote_identifier(name);
        let mut statements = Vec::new();

        for (name, expected) in &self.expected.tables {
            let Some(current) = live.tables.get(name) else {
                let columns: Vec<String> = expected
                    .columns
                    .iter()
                    .map(|c| format!("    {}", column_definition(c, dialect)))
                    .collect();
                statements.push(format!("CREATE TABLE {} (\n{}\n)", q(name), columns.join(",\n")));
                continue;
            };

            for column in &expected.columns {
                match current.column(&column.name) {
                    None => statements.push(format!(
                        "ALTER TABLE {} ADD COLUMN {}",
                        q(name),
                        column_definition(column, dialect)
                    )),
                    Some(existing) => {
                        statements.extend(alter_column(name, existing, column, dialect));
                    }
                }
            }

            for column in &current.columns {
                if expected.column(&column.name).is_none() {
                    statements.push(format!(
                        "ALTER TABLE {} DROP COLUMN {}",
                        q(name),
                        q(&column.name)
                    ));
                }
            }
        }

        for name in live.tables.keys() {
            if name != &self.records_table && !self.expected.tables.contains_key(name) {
                statements.push(format!("DROP TABLE {}", q(name)));
            }
        }

        statements
            .into_iter()
            .filter(|statement| !self.ignored.contains(&normalize_query(statement)))
            .collect()
    }
}

#[async_trait]
impl DiffGenerator for StructureDiffGenerator {
    async fn generate(&self, driver: &mut dyn Driver) -> MigrationResult<Option<String>> {
        let live = driver.describe_schema().await?;
        let statements = self.diff(&live, driver.dialect());
        tracing::debug!(statements = statements.len(), "Computed structure diff");

        if statements.is_empty() {
            return Ok(None);
        }
        let mut body = statements.join(";\n\n");
        body.push_str(";\n");
        Ok(Some(body))
    }
}

fn column_definition(column: &ColumnSchema, dialect: Dialect) -> String {
    format!(
        "{} {}{}",
        dialect.quote_identifier(&column.name),
        column.data_type,
        if column.nullable { "" } else { " NOT NULL" }
    )
}

fn alter_column(table: &str, current: &ColumnSchema, expected: &ColumnSchema, dialect: Dialect) -> Vec<String> {
    let type_changed = !current.same_type(expected);
    let null_changed = current.nullable != expected.nullable;
    if !type_changed && !null_changed {
        return Vec::new();
    }

    let table = dialect.quote_identifier(table);
    let column = dialect.quote_identifier(&expected.name);
    match dialect {
        Dialect::MySql => vec![format!(
            "ALTER TABLE {} MODIFY COLUMN {}",
            table,
            column_definition(expected, dialect)
        )],
        Dialect::Postgres | Dialect::Generic => {
            let mut statements = Vec::new();
            if type_changed {
                statements.push(format!(
                    "ALTER TABLE {} ALTER COLUMN {} TYPE {}",
                    table, column, expected.data_type
                ));
            }
            if null_changed {
                statements.push(format!(
                    "ALTER TABLE {} ALTER COLUMN {} {} NOT NULL",
                    table,
                    column,
                    if expected.nullable { "DROP" } else { "SET" }
                ));
            }
            statements
        }
    }
}

fn normalize_query(query: &str) -> String {
    schema::normalize(query.trim().trim_end_matches(';'))
}
