use anyhow::{bail, Context, Result};
use std::fmt::Write as _;
use std::path::Path;

use strata_core::MigrationsConfig;
use strata_engine::{
    connect, Configuration, Driver, GroupStatus, MemoryDriver, MigrationState, RunMode, RunReport,
    Runner,
};

fn load(config_path: &Path) -> Result<(MigrationsConfig, Configuration)> {
    let settings = MigrationsConfig::load(config_path)
        .with_context(|| format!("Failed to load settings from {}", config_path.display()))?;
    let mut sources: Vec<_> = settings.config_sources().into_iter().collect();
    sources.sort_by(|a, b| a.0.cmp(&b.0));
    for (setting, source) in sources {
        tracing::debug!(setting = %setting, source = %source, "Settings value");
    }
    let configuration = Configuration::from_settings(&settings)?;
    Ok((settings, configuration))
}

async fn runner(config_path: &Path) -> Result<Runner> {
    let (settings, configuration) = load(config_path)?;
    let driver = connect(&settings).await?;
    Ok(Runner::new(driver, configuration))
}

pub async fn run(config_path: &Path) -> Result<()> {
    execute(config_path, RunMode::Continue).await
}

pub async fn reset(config_path: &Path, force: bool) -> Result<()> {
    if !force {
        bail!("reset drops every table in the database; pass --force to confirm");
    }
    execute(config_path, RunMode::Reset).await
}

async fn execute(config_path: &Path, mode: RunMode) -> Result<()> {
    let mut runner = runner(config_path).await?;
    let report = runner.run(mode).await?;

    print!("{}", render_report(&report));
    report.into_result()?;
    Ok(())
}

pub async fn status(config_path: &Path) -> Result<()> {
    let mut runner = runner(config_path).await?;
    let statuses = runner.status().await?;
    print!("{}", render_status(&statuses));
    Ok(())
}

pub async fn create(config_path: &Path, group: &str, label: &str) -> Result<()> {
    let (settings, configuration) = load(config_path)?;

    // Only generated migrations need to look at the database
    let needs_database = configuration
        .group(group)
        .map_or(false, |g| g.generator.is_some());
    let driver: Box<dyn Driver> = if needs_database {
        connect(&settings).await?
    } else {
        Box::new(MemoryDriver::new())
    };

    let mut runner = Runner::new(driver, configuration);
    match runner.create(group, label).await? {
        Some(path) => println!("Created migration: {}", path.display()),
        None => println!("Database schema is up to date, no migration created"),
    }
    Ok(())
}

fn render_report(report: &RunReport) -> String {
    let mut out = String::new();

    if report.applied.is_empty() && report.failures.is_empty() {
        out.push_str("Nothing to migrate\n");
    }
    for applied in &report.applied {
        let _ = writeln!(
            out,
            "  applied  {}/{} ({} statement{}, {} ms)",
            applied.group,
            applied.file,
            applied.statements,
            if applied.statements == 1 { "" } else { "s" },
            applied.duration_ms
        );
    }
    for skipped in &report.skipped_groups {
        let _ = writeln!(out, "  skipped  {}: {}", skipped.name, skipped.reason);
    }
    for failure in &report.failures {
        let _ = writeln!(out, "  FAILED   {}", failure);
    }

    let _ = writeln!(
        out,
        "{} migration(s) applied in {} ms",
        report.applied_count(),
        report.execution_time_ms
    );
    out
}

fn render_status(statuses: &[GroupStatus]) -> String {
    let mut out = String::new();
    let width = statuses
        .iter()
        .flat_map(|g| g.migrations.iter())
        .map(|m| m.file.len())
        .max()
        .unwrap_or(0);

    for group in statuses {
        let _ = writeln!(out, "{} ({} pending)", group.name, group.pending_count());
        if group.migrations.is_empty() {
            out.push_str("  no migrations\n");
        }
        for migration in &group.migrations {
            let marker = match migration.state {
                MigrationState::Applied { .. } => "✓",
                MigrationState::Pending => "⏳",
                MigrationState::Incomplete { .. } | MigrationState::Missing => "✗",
            };
            let _ = writeln!(
                out,
                "  {} {:<width$}  {}",
                marker,
                migration.file,
                migration.state,
                width = width
            );
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use strata_engine::{AppliedMigration, MigrationStatus, SkipReason, SkippedGroup};

    #[test]
    fn test_render_empty_report() {
        let report = RunReport::default();
        assert_eq!(
            render_report(&report),
            "Nothing to migrate\n0 migration(s) applied in 0 ms\n"
        );
    }

    #[test]
    fn test_render_report_lists_applied_and_skipped() {
        let report = RunReport {
            applied: vec![AppliedMigration {
                group: "structures".into(),
                version: "001".into(),
                file: "001_users.sql".into(),
                statements: 2,
                duration_ms: 5,
            }],
            skipped_groups: vec![SkippedGroup {
                name: "dummy-data".into(),
                reason: SkipReason::Disabled,
            }],
            failures: Vec::new(),
            execution_time_ms: 7,
        };

        let out = render_report(&report);
        assert!(out.contains("applied  structures/001_users.sql (2 statements, 5 ms)"));
        assert!(out.contains("skipped  dummy-data: group is disabled"));
        assert!(out.ends_with("1 migration(s) applied in 7 ms\n"));
    }

    #[test]
    fn test_render_status() {
        let statuses = vec![GroupStatus {
            name: "structures".into(),
            enabled: true,
            migrations: vec![
                MigrationStatus {
                    version: "001".into(),
                    file: "001_users.sql".into(),
                    state: MigrationState::Missing,
                },
                MigrationStatus {
                    version: "002".into(),
                    file: "002_posts.sql".into(),
                    state: MigrationState::Pending,
                },
            ],
        }];

        let out = render_status(&statuses);
        assert!(out.starts_with("structures (1 pending)\n"));
        assert!(out.contains("✗ 001_users.sql  file missing"));
        assert!(out.contains("⏳ 002_posts.sql  pending"));
    }

    #[tokio::test]
    async fn test_reset_requires_force() {
        let err = reset(Path::new("does-not-matter.yaml"), false).await.unwrap_err();
        assert!(err.to_string().contains("--force"));
    }

    /// Hides the database URL variables for the duration of a test
    struct ClearedUrlVars(Vec<(&'static str, Option<String>)>);

    impl ClearedUrlVars {
        fn new() -> Self {
            let saved = ["STRATA_DATABASE_URL", "DATABASE_URL"]
                .into_iter()
                .map(|name| {
                    let value = std::env::var(name).ok();
                    std::env::remove_var(name);
                    (name, value)
                })
                .collect();
            Self(saved)
        }
    }

    impl Drop for ClearedUrlVars {
        fn drop(&mut self) {
            for (name, value) in &self.0 {
                if let Some(value) = value {
                    std::env::set_var(name, value);
                }
            }
        }
    }

    #[tokio::test]
    #[serial_test::serial]
    async fn test_create_template_without_database() {
        let _vars = ClearedUrlVars::new();
        let dir = tempfile::TempDir::new().unwrap();
        let settings = dir.path().join("strata.yaml");
        std::fs::write(&settings, "dir: migrations\n").unwrap();

        create(&settings, "basic-data", "seed_roles").await.unwrap();

        let created: Vec<_> = std::fs::read_dir(dir.path().join("migrations/basic-data"))
            .unwrap()
            .map(|e| e.unwrap().file_name().into_string().unwrap())
            .collect();
        assert_eq!(created.len(), 1);
        assert!(created[0].ends_with("_seed_roles.sql"));
    }
}
