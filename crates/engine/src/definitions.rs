//! Migration Definitions - Core types shared across the engine
//!
//! Groups, discovered migration files, persisted execution records and the
//! report of a run.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

use strata_core::{GroupConfig, MigrationError};

use crate::diff::DiffGenerator;

/// A named directory of migrations with dependencies on other groups
#[derive(Clone)]
pub struct Group {
    /// Unique name, e.g. `structures`
    pub name: String,
    /// Disabled groups are never executed but may still be depended upon
    pub enabled: bool,
    pub directory: PathBuf,
    /// Names of groups that must be applied first
    pub dependencies: Vec<String>,
    /// Generator used when authoring new migrations for this group
    pub generator: Option<Arc<dyn DiffGenerator>>,
}

impl Group {
    pub fn new(name: impl Into<String>, directory: impl Into<PathBuf>) -> Self {
        Self {
            name: name.into(),
            enabled: true,
            directory: directory.into(),
            dependencies: Vec::new(),
            generator: None,
        }
    }

    pub fn with_dependencies<I, S>(mut self, dependencies: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.dependencies = dependencies.into_iter().map(Into::into).collect();
        self
    }

    pub fn enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    pub fn with_generator(mut self, generator: Arc<dyn DiffGenerator>) -> Self {
        self.generator = Some(generator);
        self
    }
}

impl fmt::Debug for Group {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Group")
            .field("name", &self.name)
            .field("enabled", &self.enabled)
            .field("directory", &self.directory)
            .field("dependencies", &self.dependencies)
            .field("generator", &self.generator.is_some())
            .finish()
    }
}

impl From<GroupConfig> for Group {
    fn from(config: GroupConfig) -> Self {
        Group::new(config.name, config.directory)
            .with_dependencies(config.dependencies)
            .enabled(config.enabled)
    }
}

/// A migration file discovered in a group directory
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Migration {
    pub group: String,
    /// Sortable prefix of the filename, e.g. `20240115103000`
    pub version: String,
    /// Remainder of the filename after the version
    pub label: String,
    pub filename: String,
    /// Registered extension the file matched, e.g. `sql`
    pub extension: String,
    pub path: PathBuf,
    /// SHA-256 of the file content, hex encoded
    pub checksum: String,
}

/// Execution state persisted by a driver for one `(group, version)`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionRecord {
    pub group: String,
    pub version: String,
    pub file: String,
    pub checksum: String,
    pub executed_at: DateTime<Utc>,
    /// False while the migration runs; a false record after a run marks a failure
    pub ready: bool,
}

impl ExecutionRecord {
    /// Record written right before a migration starts executing
    pub fn started(migration: &Migration) -> Self {
        Self {
            group: migration.group.clone(),
            version: migration.version.clone(),
            file: migration.filename.clone(),
            checksum: migration.checksum.clone(),
            executed_at: Utc::now(),
            ready: false,
        }
    }
}

/// How a run treats the existing database
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RunMode {
    /// Apply pending migrations only
    #[default]
    Continue,
    /// Empty the database and apply every migration from scratch
    Reset,
}

/// A migration applied during a run
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppliedMigration {
    pub group: String,
    pub version: String,
    pub file: String,
    /// Statements executed (1 for scripts)
    pub statements: usize,
    pub duration_ms: u128,
}

/// Why a group did not run
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SkipReason {
    Disabled,
    DisabledDependency(String),
    FailedDependency(String),
    /// An earlier group failed and the run halted
    Halted,
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SkipReason::Disabled => write!(f, "group is disabled"),
            SkipReason::DisabledDependency(dep) => write!(f, "depends on disabled group '{}'", dep),
            SkipReason::FailedDependency(dep) => write!(f, "depends on failed group '{}'", dep),
            SkipReason::Halted => write!(f, "run halted after an earlier failure"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SkippedGroup {
    pub name: String,
    pub reason: SkipReason,
}

/// Result of running migrations
#[derive(Debug, Default)]
pub struct RunReport {
    pub applied: Vec<AppliedMigration>,
    pub skipped_groups: Vec<SkippedGroup>,
    /// Execution failures; at most one per group
    pub failures: Vec<MigrationError>,
    pub execution_time_ms: u128,
}

impl RunReport {
    pub fn applied_count(&self) -> usize {
        self.applied.len()
    }

    pub fn is_success(&self) -> bool {
        self.failures.is_empty()
    }

    /// Versions applied in a group, in execution order
    pub fn applied_in(&self, group: &str) -> Vec<&str> {
        self.applied
            .iter()
            .filter(|m| m.group == group)
            .map(|m| m.version.as_str())
            .collect()
    }

    /// Turn the first failure into an error
    pub fn into_result(mut self) -> Result<Self, MigrationError> {
        if self.failures.is_empty() {
            Ok(self)
        } else {
            Err(self.failures.remove(0))
        }
    }
}

/// State of one migration as reported by `status`
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MigrationState {
    Pending,
    Applied { executed_at: DateTime<Utc> },
    /// Started but never marked ready
    Incomplete { executed_at: DateTime<Utc> },
    /// Recorded as executed but the file is gone
    Missing,
}

impl fmt::Display for MigrationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MigrationState::Pending => write!(f, "pending"),
            MigrationState::Applied { executed_at } => {
                write!(f, "applied {}", executed_at.format("%Y-%m-%d %H:%M:%S"))
            }
            MigrationState::Incomplete { executed_at } => {
                write!(f, "INCOMPLETE since {}", executed_at.format("%Y-%m-%d %H:%M:%S"))
            }
            MigrationState::Missing => write!(f, "file missing"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MigrationStatus {
    pub version: String,
    pub file: String,
    pub state: MigrationState,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GroupStatus {
    pub name: String,
    pub enabled: bool,
    pub migrations: Vec<MigrationStatus>,
}

impl GroupStatus {
    pub fn pending_count(&self) -> usize {
        self.migrations
            .iter()
            .filter(|m| m.state == MigrationState::Pending)
            .count()
    }
}
