//! MySQL driver over a single `sqlx` connection
//!
//! MySQL commits DDL implicitly, so the driver reports no transaction
//! support and the runner relies on the record's `ready` flag instead.

use async_trait::async_trait;
use chrono::{NaiveDateTime, TimeZone, Utc};
use sqlx::{Connection, Executor, MySqlConnection, Row};

use strata_core::{MigrationError, MigrationResult};

use super::{sqlx_error, Dialect, Driver};
use crate::definitions::ExecutionRecord;
use crate::diff::{ColumnSchema, SchemaSnapshot};

/// Seconds to wait for the run lock
const LOCK_TIMEOUT_SECS: i32 = 60;

pub struct MySqlDriver {
    connection: MySqlConnection,
    table: String,
}

impl MySqlDriver {
    pub async fn connect(database_url: &str, table: &str) -> MigrationResult<Self> {
        let connection = MySqlConnection::connect(database_url)
            .await
            .map_err(|e| sqlx_error("Failed to connect to database", e))?;
        Ok(Self::from_connection(connection, table))
    }

    pub fn from_connection(connection: MySqlConnection, table: &str) -> Self {
        Self {
            connection,
            table: table.to_string(),
        }
    }

    fn table(&self) -> String {
        Dialect::MySql.quote_identifier(&self.table)
    }

    fn lock_key(&self) -> String {
        format!("strata:{}", self.table)
    }

    async fn run(&mut self, sql: &str, context: &str) -> MigrationResult<()> {
        self.connection
            .execute(sql)
            .await
            .map_err(|e| sqlx_error(context, e))?;
        Ok(())
    }
}

/// The failed DROP is what gets reported; a failed restore is only logged
fn keep_drop_error(error: MigrationError, restored: MigrationResult<()>) -> MigrationError {
    if let Err(restore_error) = restored {
        tracing::warn!(error = %restore_error, "Foreign key checks left disabled on this connection");
    }
    error
}

#[async_trait]
impl Driver for MySqlDriver {
    async fn setup(&mut self) -> MigrationResult<()> {
        let sql = format!(
            "CREATE TABLE IF NOT EXISTS {} (
                id INT UNSIGNED NOT NULL AUTO_INCREMENT PRIMARY KEY,
                `group` VARCHAR(100) NOT NULL,
                version VARCHAR(100) NOT NULL,
                file VARCHAR(255) NOT NULL,
                checksum CHAR(64) NOT NULL,
                executed_at DATETIME NOT NULL,
                ready TINYINT(1) NOT NULL DEFAULT 0,
                UNIQUE KEY uniq_group_version (`group`, version)
            ) ENGINE=InnoDB",
            self.table()
        );
        self.run(&sql, "Failed to create migrations table").await
    }

    async fn lock(&mut self) -> MigrationResult<()> {
        let acquired: Option<i64> = sqlx::query_scalar("SELECT GET_LOCK(?, ?)")
            .bind(self.lock_key())
            .bind(LOCK_TIMEOUT_SECS)
            .fetch_one(&mut self.connection)
            .await
            .map_err(|e| sqlx_error("Failed to acquire migration lock", e))?;

        match acquired {
            Some(1) => Ok(()),
            _ => Err(MigrationError::driver(format!(
                "migration lock '{}' not acquired within {}s",
                self.lock_key(),
                LOCK_TIMEOUT_SECS
            ))),
        }
    }

    async fn unlock(&mut self) -> MigrationResult<()> {
        sqlx::query("SELECT RELEASE_LOCK(?)")
            .bind(self.lock_key())
            .execute(&mut self.connection)
            .await
            .map_err(|e| sqlx_error("Failed to release migration lock", e))?;
        Ok(())
    }

    async fn empty_database(&mut self) -> MigrationResult<()> {
        let rows = sqlx::query(
            "SELECT CAST(TABLE_NAME AS CHAR) AS name, CAST(TABLE_TYPE AS CHAR) AS kind \
             FROM information_schema.TABLES WHERE TABLE_SCHEMA = DATABASE()",
        )
        .fetch_all(&mut self.connection)
        .await
        .map_err(|e| sqlx_error("Failed to list tables", e))?;

        let mut objects = Vec::with_capacity(rows.len());
        for row in &rows {
            let name: String = row
                .try_get("name")
                .map_err(|e| sqlx_error("Malformed table row", e))?;
            let kind: String = row
                .try_get("kind")
                .map_err(|e| sqlx_error("Malformed table row", e))?;
            objects.push((name, kind == "VIEW"));
        }

        self.run("SET FOREIGN_KEY_CHECKS = 0", "Failed to disable foreign key checks")
            .await?;
        for (name, is_view) in objects {
            let sql = format!(
                "DROP {} {}",
                if is_view { "VIEW" } else { "TABLE" },
                Dialect::MySql.quote_identifier(&name)
            );
            if let Err(e) = self.run(&sql, "Failed to empty database").await {
                let restored = self
                    .run("SET FOREIGN_KEY_CHECKS = 1", "Failed to re-enable foreign key checks")
                    .await;
                return Err(keep_drop_error(e, restored));
            }
        }
        self.run("SET FOREIGN_KEY_CHECKS = 1", "Failed to enable foreign key checks")
            .await
    }

    async fn execute(&mut self, statement: &str) -> MigrationResult<u64> {
        let result = self
            .connection
            .execute(statement)
            .await
            .map_err(|e| sqlx_error("Statement failed", e))?;
        Ok(result.rows_affected())
    }

    async fn applied_migrations(&mut self) -> MigrationResult<Vec<ExecutionRecord>> {
        let sql = format!(
            "SELECT `group`, version, file, checksum, executed_at, ready FROM {} ORDER BY id",
            self.table()
        );
        let rows = sqlx::query(&sql)
            .fetch_all(&mut self.connection)
            .await
            .map_err(|e| sqlx_error("Failed to read applied migrations", e))?;

        rows.iter()
            .map(|row| {
                let executed_at: NaiveDateTime = row.try_get("executed_at")?;
                Ok(ExecutionRecord {
                    group: row.try_get("group")?,
                    version: row.try_get("version")?,
                    file: row.try_get("file")?,
                    checksum: row.try_get("checksum")?,
                    executed_at: Utc.from_utc_datetime(&executed_at),
                    ready: row.try_get("ready")?,
                })
            })
            .collect::<Result<Vec<_>, sqlx::Error>>()
            .map_err(|e| sqlx_error("Malformed migration record", e))
    }

    async fn record_started(&mut self, record: &ExecutionRecord) -> MigrationResult<()> {
        let sql = format!(
            "INSERT INTO {} (`group`, version, file, checksum, executed_at, ready) VALUES (?, ?, ?, ?, ?, ?)",
            self.table()
        );
        sqlx::query(&sql)
            .bind(&record.group)
            .bind(&record.version)
            .bind(&record.file)
            .bind(&record.checksum)
            .bind(record.executed_at.naive_utc())
            .bind(record.ready)
            .execute(&mut self.connection)
            .await
            .map_err(|e| sqlx_error("Failed to record migration", e))?;
        Ok(())
    }

    async fn mark_applied(&mut self, group: &str, version: &str) -> MigrationResult<()> {
        let sql = format!(
            "UPDATE {} SET ready = 1 WHERE `group` = ? AND version = ?",
            self.table()
        );
        sqlx::query(&sql)
            .bind(group)
            .bind(version)
            .execute(&mut self.connection)
            .await
            .map_err(|e| sqlx_error("Failed to mark migration as applied", e))?;
        Ok(())
    }

    async fn begin_transaction(&mut self) -> MigrationResult<()> {
        self.run("START TRANSACTION", "Failed to start transaction").await
    }

    async fn commit(&mut self) -> MigrationResult<()> {
        self.run("COMMIT", "Failed to commit migration").await
    }

    async fn rollback(&mut self) -> MigrationResult<()> {
        self.run("ROLLBACK", "Failed to roll back migration").await
    }

    fn supports_transactions(&self) -> bool {
        false
    }

    async fn describe_schema(&mut self) -> MigrationResult<SchemaSnapshot> {
        let rows = sqlx::query(
            "SELECT CAST(TABLE_NAME AS CHAR) AS table_name, CAST(COLUMN_NAME AS CHAR) AS column_name, \
             CAST(COLUMN_TYPE AS CHAR) AS data_type, IS_NULLABLE = 'YES' AS nullable \
             FROM information_schema.COLUMNS \
             WHERE TABLE_SCHEMA = DATABASE() \
             ORDER BY TABLE_NAME, ORDINAL_POSITION",
        )
        .fetch_all(&mut self.connection)
        .await
        .map_err(|e| sqlx_error("Failed to describe schema", e))?;

        let mut snapshot = SchemaSnapshot::default();
        for row in &rows {
            let read = || -> Result<(String, ColumnSchema), sqlx::Error> {
                let nullable: i64 = row.try_get("nullable")?;
                Ok((
                    row.try_get("table_name")?,
                    ColumnSchema::new(
                        row.try_get::<String, _>("column_name")?,
                        row.try_get::<String, _>("data_type")?,
                        nullable != 0,
                    ),
                ))
            };
            let (table, column) = read().map_err(|e| sqlx_error("Malformed schema row", e))?;
            snapshot.push_column(&table, column);
        }
        Ok(snapshot)
    }

    fn dialect(&self) -> Dialect {
        Dialect::MySql
    }
}
