//! Extension handlers
//!
//! A migration file is executed by the handler registered for its extension.
//! Handlers are a closed set of variants looked up once per file.

pub mod script;
pub mod sql;

use std::collections::BTreeMap;
use std::time::Duration;

use strata_core::{MigrationError, MigrationResult};

use crate::definitions::Migration;
use crate::drivers::Driver;

pub use script::ScriptHandler;
pub use sql::{split_statements, SqlHandler};

/// Execution strategy for one kind of migration file
#[derive(Debug, Clone)]
pub enum Handler {
    Sql(SqlHandler),
    Script(ScriptHandler),
}

impl Handler {
    /// Execute the migration, returning the number of statements run
    pub async fn handle(&self, migration: &Migration, driver: &mut dyn Driver) -> MigrationResult<usize> {
        match self {
            Handler::Sql(handler) => handler.handle(migration, driver).await,
            Handler::Script(handler) => handler.handle(migration).await,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Handler::Sql(_) => "sql",
            Handler::Script(_) => "script",
        }
    }
}

impl From<SqlHandler> for Handler {
    fn from(handler: SqlHandler) -> Self {
        Handler::Sql(handler)
    }
}

impl From<ScriptHandler> for Handler {
    fn from(handler: ScriptHandler) -> Self {
        Handler::Script(handler)
    }
}

/// Map from file extension (without the leading dot) to its handler
#[derive(Debug, Clone, Default)]
pub struct ExtensionRegistry {
    handlers: BTreeMap<String, Handler>,
}

impl ExtensionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with `sql` statements and `sh` scripts
    pub fn with_defaults(script_params: BTreeMap<String, String>, timeout: Option<Duration>) -> Self {
        Self::new().with("sql", SqlHandler::new()).with(
            "sh",
            ScriptHandler::new(script_params)
                .with_interpreter("sh")
                .with_timeout(timeout),
        )
    }

    /// Register a handler, replacing any previous one for the extension
    pub fn register(&mut self, extension: impl Into<String>, handler: impl Into<Handler>) {
        let extension = extension.into();
        let extension = extension.trim_start_matches('.').to_string();
        self.handlers.insert(extension, handler.into());
    }

    pub fn with(mut self, extension: impl Into<String>, handler: impl Into<Handler>) -> Self {
        self.register(extension, handler);
        self
    }

    pub fn get(&self, extension: &str) -> Option<&Handler> {
        self.handlers.get(extension)
    }

    /// Longest registered extension that `filename` ends with, so that
    /// `001_x.pg.sql` prefers `pg.sql` over `sql`
    pub fn match_extension(&self, filename: &str) -> Option<&str> {
        self.handlers
            .keys()
            .filter(|extension| {
                filename.len() > extension.len() + 1
                    && filename.ends_with(extension.as_str())
                    && filename.as_bytes()[filename.len() - extension.len() - 1] == b'.'
            })
            .max_by_key(|extension| extension.len())
            .map(String::as_str)
    }

    pub fn extensions(&self) -> Vec<&str> {
        self.handlers.keys().map(String::as_str).collect()
    }

    /// Dispatch a migration to the handler of its extension
    pub async fn handle(&self, migration: &Migration, driver: &mut dyn Driver) -> MigrationResult<usize> {
        let handler = self.get(&migration.extension).ok_or_else(|| {
            MigrationError::configuration(format!(
                "no extension handler registered for '{}' ({}/{})",
                migration.extension, migration.group, migration.filename
            ))
        })?;
        handler.handle(migration, driver).await
    }
}
