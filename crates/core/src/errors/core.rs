use thiserror::Error;

use crate::config::ConfigError;

/// Result type alias for migration operations
pub type MigrationResult<T> = Result<T, MigrationError>;

/// Error type for the strata migration engine
///
/// Variants carry enough context (group, file, statement) to diagnose a
/// failure without re-running with extra logging.
#[derive(Debug, Error)]
pub enum MigrationError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Settings error: {0}")]
    Settings(#[from] ConfigError),

    #[error("Configuration error: {message}")]
    Configuration { message: String },

    #[error("Cyclic dependency between groups: {}", cycle.join(" -> "))]
    CyclicDependency { cycle: Vec<String> },

    #[error("Malformed migration name '{file}' in group '{group}': expected a version prefix such as 20240115103000_name")]
    MalformedMigrationName { group: String, file: String },

    #[error("{}", format_handler_error(group, file, *statement, message))]
    HandlerExecution {
        group: String,
        file: String,
        statement: Option<usize>,
        message: String,
    },

    #[error("Driver error: {message}")]
    Driver { message: String },

    #[error("Previously executed migration '{group}/{file}' did not complete; fix the database manually and remove or complete its record")]
    IncompleteMigration { group: String, file: String },

    #[error("Previously executed migration '{group}/{file}' is missing from the group directory")]
    MissingMigration { group: String, file: String },

    #[error("Previously executed migration '{group}/{file}' has been changed since it was applied")]
    ChecksumMismatch { group: String, file: String },

    #[error("New migration '{group}/{file}' must follow after the latest executed migration '{latest}'")]
    LateMigration {
        group: String,
        file: String,
        latest: String,
    },

    #[error("Diff generation failed for group '{group}': {message}")]
    DiffGeneration { group: String, message: String },
}

fn format_handler_error(group: &str, file: &str, statement: Option<usize>, message: &str) -> String {
    match statement {
        Some(index) => format!(
            "Migration '{}/{}' failed at statement #{}: {}",
            group, file, index, message
        ),
        None => format!("Migration '{}/{}' failed: {}", group, file, message),
    }
}

impl MigrationError {
    /// Create a new configuration error
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }

    /// Create a new driver error
    pub fn driver(message: impl Into<String>) -> Self {
        Self::Driver {
            message: message.into(),
        }
    }

    /// Create a handler error for a migration file
    pub fn handler(
        group: impl Into<String>,
        file: impl Into<String>,
        statement: Option<usize>,
        message: impl Into<String>,
    ) -> Self {
        Self::HandlerExecution {
            group: group.into(),
            file: file.into(),
            statement,
            message: message.into(),
        }
    }

    /// Check if the error is detected before any migration executes
    pub fn is_configuration(&self) -> bool {
        matches!(
            self,
            Self::Settings(_)
                | Self::Configuration { .. }
                | Self::CyclicDependency { .. }
                | Self::MalformedMigrationName { .. }
                | Self::IncompleteMigration { .. }
                | Self::MissingMigration { .. }
                | Self::ChecksumMismatch { .. }
                | Self::LateMigration { .. }
        )
    }

    /// Check if the error was raised while executing a migration
    pub fn is_execution(&self) -> bool {
        matches!(self, Self::HandlerExecution { .. })
    }
}
