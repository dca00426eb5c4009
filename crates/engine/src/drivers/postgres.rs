//! PostgreSQL driver over a single `sqlx` connection

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{Connection, Executor, PgConnection, Row};

use strata_core::MigrationResult;

use super::{sqlx_error, Dialect, Driver};
use crate::definitions::ExecutionRecord;
use crate::diff::{ColumnSchema, SchemaSnapshot};

/// PostgreSQL runs DDL inside transactions, so a failed migration leaves
/// no trace at all.
pub struct PgDriver {
    connection: PgConnection,
    table: String,
    schema: String,
}

impl PgDriver {
    pub async fn connect(database_url: &str, table: &str) -> MigrationResult<Self> {
        let connection = PgConnection::connect(database_url)
            .await
            .map_err(|e| sqlx_error("Failed to connect to database", e))?;
        Ok(Self::from_connection(connection, table))
    }

    pub fn from_connection(connection: PgConnection, table: &str) -> Self {
        Self {
            connection,
            table: table.to_string(),
            schema: "public".to_string(),
        }
    }

    /// Schema emptied on reset and described by the diff generator
    pub fn with_schema(mut self, schema: impl Into<String>) -> Self {
        self.schema = schema.into();
        self
    }

    fn table(&self) -> String {
        Dialect::Postgres.quote_identifier(&self.table)
    }

    fn lock_key(&self) -> String {
        format!("strata:{}", self.table)
    }
}

#[async_trait]
impl Driver for PgDriver {
    async fn setup(&mut self) -> MigrationResult<()> {
        let sql = format!(
            r#"CREATE TABLE IF NOT EXISTS {} (
                id SERIAL PRIMARY KEY,
                "group" VARCHAR(100) NOT NULL,
                version VARCHAR(100) NOT NULL,
                file VARCHAR(255) NOT NULL,
                checksum CHAR(64) NOT NULL,
                executed_at TIMESTAMPTZ NOT NULL,
                ready BOOLEAN NOT NULL DEFAULT FALSE,
                UNIQUE ("group", version)
            )"#,
            self.table()
        );
        self.connection
            .execute(sql.as_str())
            .await
            .map_err(|e| sqlx_error("Failed to create migrations table", e))?;
        Ok(())
    }

    async fn lock(&mut self) -> MigrationResult<()> {
        sqlx::query("SELECT pg_advisory_lock(hashtext($1))")
            .bind(self.lock_key())
            .execute(&mut self.connection)
            .await
            .map_err(|e| sqlx_error("Failed to acquire migration lock", e))?;
        Ok(())
    }

    async fn unlock(&mut self) -> MigrationResult<()> {
        sqlx::query("SELECT pg_advisory_unlock(hashtext($1))")
            .bind(self.lock_key())
            .execute(&mut self.connection)
            .await
            .map_err(|e| sqlx_error("Failed to release migration lock", e))?;
        Ok(())
    }

    async fn empty_database(&mut self) -> MigrationResult<()> {
        let schema = Dialect::Postgres.quote_identifier(&self.schema);
        let sql = format!("DROP SCHEMA {0} CASCADE; CREATE SCHEMA {0}", schema);
        self.connection
            .execute(sql.as_str())
            .await
            .map_err(|e| sqlx_error("Failed to empty database", e))?;
        Ok(())
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
            r#"SELECT "group", version, file, checksum, executed_at, ready FROM {} ORDER BY id"#,
            self.table()
        );
        let rows = sqlx::query(&sql)
            .fetch_all(&mut self.connection)
            .await
            .map_err(|e| sqlx_error("Failed to read applied migrations", e))?;

        rows.iter()
            .map(|row| {
                Ok(ExecutionRecord {
                    group: row.try_get("group")?,
                    version: row.try_get("version")?,
                    file: row.try_get("file")?,
                    checksum: row.try_get("checksum")?,
                    executed_at: row.try_get::<DateTime<Utc>, _>("executed_at")?,
                    ready: row.try_get("ready")?,
                })
            })
            .collect::<Result<Vec<_>, sqlx::Error>>()
            .map_err(|e| sqlx_error("Malformed migration record", e))
    }

    async fn is_applied(&mut self, group: &str, version: &str) -> MigrationResult<bool> {
        let sql = format!(
            r#"SELECT EXISTS (SELECT 1 FROM {} WHERE "group" = $1 AND version = $2 AND ready)"#,
            self.table()
        );
        sqlx::query_scalar::<_, bool>(&sql)
            .bind(group)
            .bind(version)
            .fetch_one(&mut self.connection)
            .await
            .map_err(|e| sqlx_error("Failed to query migration record", e))
    }

    async fn record_started(&mut self, record: &ExecutionRecord) -> MigrationResult<()> {
        let sql = format!(
            r#"INSERT INTO {} ("group", version, file, checksum, executed_at, ready) VALUES ($1, $2, $3, $4, $5, $6)"#,
            self.table()
        );
        sqlx::query(&sql)
            .bind(&record.group)
            .bind(&record.version)
            .bind(&record.file)
            .bind(&record.checksum)
            .bind(record.executed_at)
            .bind(record.ready)
            .execute(&mut self.connection)
            .await
            .map_err(|e| sqlx_error("Failed to record migration", e))?;
        Ok(())
    }

    async fn mark_applied(&mut self, group: &str, version: &str) -> MigrationResult<()> {
        let sql = format!(
            r#"UPDATE {} SET ready = TRUE WHERE "group" = $1 AND version = $2"#,
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
        self.connection
            .execute("BEGIN")
            .await
            .map_err(|e| sqlx_error("Failed to start transaction", e))?;
        Ok(())
    }

    async fn commit(&mut self) -> MigrationResult<()> {
        self.connection
            .execute("COMMIT")
            .await
            .map_err(|e| sqlx_error("Failed to commit migration", e))?;
        Ok(())
    }

    async fn rollback(&mut self) -> MigrationResult<()> {
        self.connection
            .execute("ROLLBACK")
            .await
            .map_err(|e| sqlx_error("Failed to roll back migration", e))?;
        Ok(())
    }

    fn supports_transactions(&self) -> bool {
        true
    }

    async fn describe_schema(&mut self) -> MigrationResult<SchemaSnapshot> {
        let rows = sqlx::query(
            "SELECT table_name::text AS table_name, column_name::text AS column_name, \
             data_type::text AS data_type, is_nullable::text = 'YES' AS nullable \
             FROM information_schema.columns \
             WHERE table_schema = $1 \
             ORDER BY table_name, ordinal_position",
        )
        .bind(&self.schema)
        .fetch_all(&mut self.connection)
        .await
        .map_err(|e| sqlx_error("Failed to describe schema", e))?;

        let mut snapshot = SchemaSnapshot::default();
        for row in &rows {
            let read = || -> Result<(String, ColumnSchema), sqlx::Error> {
                Ok((
                    row.try_get("table_name")?,
                    ColumnSchema::new(
                        row.try_get::<String, _>("column_name")?,
                        row.try_get::<String, _>("data_type")?,
                        row.try_get("nullable")?,
                    ),
                ))
            };
            let (table, column) = read().map_err(|e| sqlx_error("Malformed schema row", e))?;
            snapshot.push_column(&table, column);
        }
        Ok(snapshot)
    }

    fn dialect(&self) -> Dialect {
        Dialect::Postgres
    }
}
