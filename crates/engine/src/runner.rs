//! Migration Runner - Applies pending migrations group by group
//!
//! A run resolves the group order, discovers every file up front, validates
//! the existing execution records and only then starts executing. Each
//! migration runs under the record's `ready` flag, inside a transaction when
//! the driver has them.

use chrono::Utc;
use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::time::Instant;

use strata_core::{FailurePolicy, LateMigrationPolicy, MigrationError, MigrationResult};

use crate::configuration::Configuration;
use crate::definitions::{
    AppliedMigration, ExecutionRecord, GroupStatus, Migration, MigrationState, MigrationStatus,
    RunMode, RunReport, SkipReason, SkippedGroup,
};
use crate::discovery::discover;
use crate::drivers::Driver;
use crate::resolver::{resolve, DependencyGraph, ExecutionPlan};

/// Migrations of one group that still have to run
#[derive(Debug)]
struct GroupWork {
    index: usize,
    pending: Vec<Migration>,
}

/// Orchestrates a migration run over one driver
pub struct Runner {
    driver: Box<dyn Driver>,
    configuration: Configuration,
}

impl Runner {
    pub fn new(driver: Box<dyn Driver>, configuration: Configuration) -> Self {
        Self {
            driver,
            configuration,
        }
    }

    /// Apply every pending migration
    ///
    /// Configuration problems and driver failures are returned as `Err`
    /// before or instead of a report. A migration that fails while executing
    /// ends up in [`RunReport::failures`].
    pub async fn run(&mut self, mode: RunMode) -> MigrationResult<RunReport> {
        let start_time = Instant::now();
        let options = self.configuration.options;

        let plan = resolve(&self.configuration.groups, options.on_disabled_dependency)?;
        tracing::info!(order = ?plan.names(), mode = ?mode, "Resolved migration order");

        let mut discovered = Vec::with_capacity(plan.order.len());
        for &index in &plan.order {
            let group = &self.configuration.groups[index];
            discovered.push((index, discover(group, &self.configuration.handlers)?));
        }

        self.driver.lock().await?;
        let result = self.run_locked(mode, &plan, discovered).await;
        let unlocked = self.driver.unlock().await;

        let mut report = result?;
        unlocked?;

        report.execution_time_ms = start_time.elapsed().as_millis();
        tracing::info!(
            applied = report.applied_count(),
            failures = report.failures.len(),
            skipped = report.skipped_groups.len(),
            execution_time_ms = report.execution_time_ms as u64,
            "Migration run finished"
        );
        Ok(report)
    }

    async fn run_locked(
        &mut self,
        mode: RunMode,
        plan: &ExecutionPlan,
        discovered: Vec<(usize, Vec<Migration>)>,
    ) -> MigrationResult<RunReport> {
        if mode == RunMode::Reset {
            tracing::warn!("Emptying database before running all migrations");
            self.driver.empty_database().await?;
        }
        self.driver.setup().await?;

        let records = self.driver.applied_migrations().await?;
        let work = self.preflight(&records, discovered)?;

        let mut report = RunReport {
            skipped_groups: plan.skipped.clone(),
            ..RunReport::default()
        };
        for skipped in &plan.skipped {
            tracing::warn!(group = %skipped.name, reason = %skipped.reason, "Skipping group");
        }

        let mut failed: Vec<usize> = Vec::new();
        let mut halted = false;

        for GroupWork { index, pending } in work {
            let name = self.configuration.groups[index].name.clone();

            let reason = if halted {
                Some(SkipReason::Halted)
            } else {
                failed
                    .iter()
                    .find(|&&f| plan.graph.dependents_closure(f).contains(&index))
                    .map(|&f| SkipReason::FailedDependency(plan.graph.name(f).to_string()))
            };
            if let Some(reason) = reason {
                tracing::warn!(group = %name, reason = %reason, "Skipping group");
                report.skipped_groups.push(SkippedGroup { name, reason });
                continue;
            }

            if pending.is_empty() {
                tracing::debug!(group = %name, "No pending migrations");
                continue;
            }
            tracing::info!(group = %name, pending = pending.len(), "Applying group");

            for migration in &pending {
                match self.apply(migration).await {
                    Ok(applied) => report.applied.push(applied),
                    Err(e) if e.is_execution() => {
                        tracing::error!(
                            group = %migration.group,
                            version = %migration.version,
                            file = %migration.filename,
                            error = %e,
                            "Migration failed"
                        );
                        report.failures.push(e);
                        failed.push(index);
                        if self.configuration.options.on_failure == FailurePolicy::Halt {
                            halted = true;
                        }
                        break;
                    }
                    Err(e) => return Err(e),
                }
            }
        }

        Ok(report)
    }

    /// Check the records against the files and work out what is pending
    fn preflight(
        &self,
        records: &[ExecutionRecord],
        discovered: Vec<(usize, Vec<Migration>)>,
    ) -> MigrationResult<Vec<GroupWork>> {
        let mut by_group: HashMap<&str, Vec<&ExecutionRecord>> = HashMap::new();
        for record in records {
            by_group.entry(record.group.as_str()).or_default().push(record);
        }

        let mut work = Vec::with_capacity(discovered.len());
        for (index, migrations) in discovered {
            let group = &self.configuration.groups[index];
            let records = by_group.remove(group.name.as_str()).unwrap_or_default();

            if let Some(record) = records.iter().find(|r| !r.ready) {
                return Err(MigrationError::IncompleteMigration {
                    group: record.group.clone(),
                    file: record.file.clone(),
                });
            }

            let files: HashMap<&str, &Migration> =
                migrations.iter().map(|m| (m.version.as_str(), m)).collect();
            for record in &records {
                match files.get(record.version.as_str()) {
                    None => {
                        return Err(MigrationError::MissingMigration {
                            group: record.group.clone(),
                            file: record.file.clone(),
                        })
                    }
                    Some(migration) if migration.checksum != record.checksum => {
                        return Err(MigrationError::ChecksumMismatch {
                            group: record.group.clone(),
                            file: migration.filename.clone(),
                        })
                    }
                    Some(_) => {}
                }
            }

            let applied: HashSet<&str> = records.iter().map(|r| r.version.as_str()).collect();
            let latest = records.iter().map(|r| r.version.as_str()).max();
            let pending: Vec<Migration> = migrations
                .iter()
                .filter(|m| !applied.contains(m.version.as_str()))
                .cloned()
                .collect();

            if let Some(latest) = latest {
                if let Some(late) = pending.iter().find(|m| m.version.as_str() < latest) {
                    match self.configuration.options.late_migrations {
                        LateMigrationPolicy::Reject => {
                            return Err(MigrationError::LateMigration {
                                group: late.group.clone(),
                                file: late.filename.clone(),
                                latest: latest.to_string(),
                            });
                        }
                        LateMigrationPolicy::Apply => {
                            tracing::warn!(
                                group = %late.group,
                                file = %late.filename,
                                latest = %latest,
                                "Applying migration older than the latest applied one"
                            );
                        }
                    }
                }
            }

            work.push(GroupWork { index, pending });
        }

        Ok(work)
    }

    /// Run one migration under its execution record
    async fn apply(&mut self, migration: &Migration) -> MigrationResult<AppliedMigration> {
        let started = Instant::now();
        let transactional = self.driver.supports_transactions();

        if transactional {
            self.driver.begin_transaction().await?;
        }

        let outcome = self.execute(migration).await;

        match outcome {
            Ok(statements) => {
                if transactional {
                    self.driver.commit().await?;
                }
                let duration_ms = started.elapsed().as_millis();
                tracing::info!(
                    group = %migration.group,
                    version = %migration.version,
                    file = %migration.filename,
                    statements,
                    duration_ms = duration_ms as u64,
                    "Applied migration"
                );
                Ok(AppliedMigration {
                    group: migration.group.clone(),
                    version: migration.version.clone(),
                    file: migration.filename.clone(),
                    statements,
                    duration_ms,
                })
            }
            Err(e) => {
                if transactional {
                    if let Err(rollback) = self.driver.rollback().await {
                        tracing::error!(error = %rollback, "Rollback failed");
                    }
                }
                Err(e)
            }
        }
    }

    async fn execute(&mut self, migration: &Migration) -> MigrationResult<usize> {
        self.driver
            .record_started(&ExecutionRecord::started(migration))
            .await?;
        let statements = self
            .configuration
            .handlers
            .handle(migration, self.driver.as_mut())
            .await?;
        self.driver
            .mark_applied(&migration.group, &migration.version)
            .await?;
        Ok(statements)
    }

    /// State of every migration of the enabled groups, in dependency order
    pub async fn status(&mut self) -> MigrationResult<Vec<GroupStatus>> {
        let graph = DependencyGraph::build(&self.configuration.groups)?;
        let order = graph.topological_order()?;

        self.driver.setup().await?;
        let records = self.driver.applied_migrations().await?;

        let mut statuses = Vec::new();
        for index in order {
            let group = &self.configuration.groups[index];
            if !group.enabled {
                continue;
            }

            let migrations = discover(group, &self.configuration.handlers)?;
            let mut group_records: HashMap<&str, &ExecutionRecord> = records
                .iter()
                .filter(|r| r.group == group.name)
                .map(|r| (r.version.as_str(), r))
                .collect();

            let mut entries: Vec<MigrationStatus> = migrations
                .iter()
                .map(|m| {
                    let state = match group_records.remove(m.version.as_str()) {
                        Some(r) if r.ready => MigrationState::Applied {
                            executed_at: r.executed_at,
                        },
                        Some(r) => MigrationState::Incomplete {
                            executed_at: r.executed_at,
                        },
                        None => MigrationState::Pending,
                    };
                    MigrationStatus {
                        version: m.version.clone(),
                        file: m.filename.clone(),
                        state,
                    }
                })
                .collect();

            entries.extend(group_records.into_values().map(|r| MigrationStatus {
                version: r.version.clone(),
                file: r.file.clone(),
                state: MigrationState::Missing,
            }));
            entries.sort_by(|a, b| a.version.cmp(&b.version));

            statuses.push(GroupStatus {
                name: group.name.clone(),
                enabled: group.enabled,
                migrations: entries,
            });
        }

        Ok(statuses)
    }

    /// Write a new migration file into a group's directory
    ///
    /// Groups with a diff generator get its output as the body; when there is
    /// nothing to change no file is written and `None` is returned.
    pub async fn create(&mut self, group: &str, label: &str) -> MigrationResult<Option<PathBuf>> {
        let target = self
            .configuration
            .group(group)
            .ok_or_else(|| MigrationError::configuration(format!("unknown group '{}'", group)))?;

        if label.is_empty()
            || !label
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
            || label.starts_with(|c: char| c.is_ascii_digit())
        {
            return Err(MigrationError::configuration(format!(
                "invalid migration label '{}': use letters, digits, '_' or '-', not starting with a digit",
                label
            )));
        }

        let now = Utc::now();
        let body = match &target.generator {
            Some(generator) => {
                let generator = generator.clone();
                let generated = generator
                    .generate(self.driver.as_mut())
                    .await
                    .map_err(|e| match e {
                        e @ MigrationError::DiffGeneration { .. } => e,
                        other => MigrationError::DiffGeneration {
                            group: group.to_string(),
                            message: other.to_string(),
                        },
                    })?;
                match generated {
                    Some(body) => body,
                    None => {
                        tracing::info!(group, "Schema matches the expected definition; nothing to create");
                        return Ok(None);
                    }
                }
            }
            None => format!(
                "-- {} ({})\n-- Created {}\n\n",
                label,
                group,
                now.format("%Y-%m-%d %H:%M:%S")
            ),
        };

        let directory = &target.directory;
        std::fs::create_dir_all(directory)?;
        let path = directory.join(format!("{}_{}.sql", now.format("%Y%m%d%H%M%S"), label));
        if path.exists() {
            return Err(MigrationError::configuration(format!(
                "migration file already exists: {}",
                path.display()
            )));
        }
        std::fs::write(&path, body)?;

        tracing::info!(group, path = %path.display(), "Created migration");
        Ok(Some(path))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::definitions::Group;
    use crate::drivers::MemoryDriver;
    use crate::handlers::ExtensionRegistry;
    use std::fs;
    use tempfile::TempDir;

    fn configuration(dir: &TempDir) -> Configuration {
        Configuration::new(
            vec![Group::new("structures", dir.path().join("structures"))],
            ExtensionRegistry::with_defaults(Default::default(), None),
        )
    }

    #[tokio::test]
    async fn test_lock_released_after_error() {
        let dir = TempDir::new().unwrap();
        let structures = dir.path().join("structures");
        fs::create_dir(&structures).unwrap();
        fs::write(structures.join("001_a.sql"), "CREATE TABLE a (id INT);").unwrap();

        let driver = MemoryDriver::new();
        driver.insert_record(ExecutionRecord {
            group: "structures".into(),
            version: "000".into(),
            file: "000_gone.sql".into(),
            checksum: String::new(),
            executed_at: Utc::now(),
            ready: true,
        });

        let mut runner = Runner::new(Box::new(driver.clone()), configuration(&dir));
        let err = runner.run(RunMode::Continue).await.unwrap_err();
        assert!(matches!(err, MigrationError::MissingMigration { .. }));
        assert!(!driver.is_locked());
        assert!(!driver.has_table("a"));
    }

    #[tokio::test]
    async fn test_create_writes_template() {
        let dir = TempDir::new().unwrap();
        let mut runner = Runner::new(Box::new(MemoryDriver::new()), configuration(&dir));

        let path = runner.create("structures", "add_users").await.unwrap().unwrap();
        let name = path.file_name().unwrap().to_str().unwrap().to_string();
        assert!(name.ends_with("_add_users.sql"));
        assert_eq!(name.len(), "20240101000000_add_users.sql".len());
        assert!(fs::read_to_string(&path).unwrap().starts_with("-- add_users (structures)"));
    }

    #[tokio::test]
    async fn test_create_rejects_bad_input() {
        let dir = TempDir::new().unwrap();
        let mut runner = Runner::new(Box::new(MemoryDriver::new()), configuration(&dir));

        assert!(runner.create("nope", "x").await.unwrap_err().is_configuration());
        assert!(runner.create("structures", "bad label").await.is_err());
        assert!(runner.create("structures", "1st").await.is_err());
    }
}
