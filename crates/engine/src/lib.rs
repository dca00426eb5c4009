//! strata engine
//!
//! Grouped SQL and script migrations. Groups declare dependencies on each
//! other and are applied in dependency order; within a group migrations run
//! in version order and each one exactly once.
//!
//! ```no_run
//! use strata_core::MigrationsConfig;
//! use strata_engine::{connect, Configuration, RunMode, Runner};
//!
//! # async fn example() -> strata_core::MigrationResult<()> {
//! let settings = MigrationsConfig::load("strata.yaml")?;
//! let driver = connect(&settings).await?;
//! let mut runner = Runner::new(driver, Configuration::from_settings(&settings)?);
//! runner.run(RunMode::Continue).await?.into_result()?;
//! # Ok(())
//! # }
//! ```

pub mod configuration;
pub mod definitions;
pub mod diff;
pub mod discovery;
pub mod drivers;
pub mod handlers;
pub mod resolver;
pub mod runner;

pub use configuration::{Configuration, RunOptions};
pub use definitions::{
    AppliedMigration, ExecutionRecord, Group, GroupStatus, Migration, MigrationState,
    MigrationStatus, RunMode, RunReport, SkipReason, SkippedGroup,
};
pub use diff::{DiffGenerator, SchemaSnapshot, StructureDiffGenerator};
pub use discovery::discover;
pub use drivers::{connect, Dialect, Driver, MemoryDriver, MySqlDriver, PgDriver};
pub use handlers::{ExtensionRegistry, Handler, ScriptHandler, SqlHandler};
pub use resolver::{resolve, DependencyGraph, ExecutionPlan};
pub use runner::Runner;

pub use strata_core::{MigrationError, MigrationResult};
