//! Shared foundation of the strata migration engine: the error taxonomy,
//! the settings file and logging setup.

pub mod config;
pub mod errors;
pub mod logging;

pub use config::{
    ConfigError, ConfigSource, DisabledDependencyPolicy, DriverKind, FailurePolicy, GroupConfig,
    LateMigrationPolicy, MigrationsConfig,
};
pub use errors::{MigrationError, MigrationResult};
pub use logging::{init_logging, LogFormat, LoggingConfig};

/// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
