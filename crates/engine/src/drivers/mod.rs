//! Database drivers
//!
//! A driver owns the single connection of a run. It executes migration
//! statements and persists the execution records.

pub mod memory;
pub mod mysql;
pub mod postgres;

use async_trait::async_trait;

use strata_core::{DriverKind, MigrationError, MigrationResult, MigrationsConfig};

use crate::definitions::ExecutionRecord;
use crate::diff::SchemaSnapshot;

pub use memory::MemoryDriver;
pub use mysql::MySqlDriver;
pub use postgres::PgDriver;

/// SQL flavour, used to split statements and render generated SQL
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dialect {
    Postgres,
    MySql,
    Generic,
}

impl Dialect {
    pub fn quote_identifier(&self, identifier: &str) -> String {
        match self {
            Dialect::MySql => format!("`{}`", identifier.replace('`', "``")),
            Dialect::Postgres | Dialect::Generic => {
                format!("\"{}\"", identifier.replace('"', "\"\""))
            }
        }
    }
}

/// Connection to the target database
#[async_trait]
pub trait Driver: Send {
    /// Create the record table when it does not exist
    async fn setup(&mut self) -> MigrationResult<()>;

    /// Take the cross-process run lock
    async fn lock(&mut self) -> MigrationResult<()>;

    async fn unlock(&mut self) -> MigrationResult<()>;

    /// Drop everything in the database, the record table included
    async fn empty_database(&mut self) -> MigrationResult<()>;

    /// Execute a single statement, returning the affected row count
    async fn execute(&mut self, statement: &str) -> MigrationResult<u64>;

    /// Every record, ready or not, in insertion order
    async fn applied_migrations(&mut self) -> MigrationResult<Vec<ExecutionRecord>>;

    async fn is_applied(&mut self, group: &str, version: &str) -> MigrationResult<bool> {
        Ok(self
            .applied_migrations()
            .await?
            .iter()
            .any(|r| r.ready && r.group == group && r.version == version))
    }

    /// Persist the record of a migration about to run (`ready = false`)
    async fn record_started(&mut self, record: &ExecutionRecord) -> MigrationResult<()>;

    async fn mark_applied(&mut self, group: &str, version: &str) -> MigrationResult<()>;

    async fn begin_transaction(&mut self) -> MigrationResult<()>;

    async fn commit(&mut self) -> MigrationResult<()>;

    async fn rollback(&mut self) -> MigrationResult<()>;

    /// Whether schema changes can be rolled back
    fn supports_transactions(&self) -> bool;

    /// Live tables and columns, used by the structure diff
    async fn describe_schema(&mut self) -> MigrationResult<SchemaSnapshot>;

    fn dialect(&self) -> Dialect;
}

pub(crate) fn sqlx_error(context: &str, error: sqlx::Error) -> MigrationError {
    match error {
        sqlx::Error::Database(db) => MigrationError::driver(format!("{}: {}", context, db.message())),
        other => MigrationError::driver(format!("{}: {}", context, other)),
    }
}

/// Open the driver selected by the settings
pub async fn connect(config: &MigrationsConfig) -> MigrationResult<Box<dyn Driver>> {
    let url = config.database_url()?;
    tracing::debug!(driver = %config.driver, table = %config.table, "Connecting to database");

    let driver: Box<dyn Driver> = match config.driver {
        DriverKind::PgSql => Box::new(PgDriver::connect(url, &config.table).await?),
        DriverKind::MySql => Box::new(MySqlDriver::connect(url, &config.table).await?),
    };
    Ok(driver)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_identifier_quoting() {
        assert_eq!(Dialect::Postgres.quote_identifier("group"), "\"group\"");
        assert_eq!(Dialect::Postgres.quote_identifier("a\"b"), "\"a\"\"b\"");
        assert_eq!(Dialect::MySql.quote_identifier("group"), "`group`");
    }

    #[tokio::test]
    async fn test_default_is_applied_requires_ready_record() {
        let mut driver = MemoryDriver::new();
        driver.setup().await.unwrap();
        let record = ExecutionRecord {
            group: "structures".into(),
            version: "001".into(),
            file: "001_a.sql".into(),
            checksum: String::new(),
            executed_at: chrono::Utc::now(),
            ready: false,
        };
        driver.record_started(&record).await.unwrap();
        assert!(!driver.is_applied("structures", "001").await.unwrap());

        driver.mark_applied("structures", "001").await.unwrap();
        assert!(driver.is_applied("structures", "001").await.unwrap());
        assert!(!driver.is_applied("basic-data", "001").await.unwrap());
    }
}
