//! Engine configuration - groups, handlers and run policies
//!
//! Built once from the settings file (or assembled in code) and read-only
//! afterwards.

use std::sync::Arc;
use std::time::Duration;

use strata_core::{
    DisabledDependencyPolicy, FailurePolicy, LateMigrationPolicy, MigrationError, MigrationResult,
    MigrationsConfig,
};

use crate::definitions::Group;
use crate::diff::StructureDiffGenerator;
use crate::handlers::ExtensionRegistry;

/// Group that receives the structure diff generator
pub const STRUCTURES_GROUP: &str = "structures";

/// Policies applied by the runner
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RunOptions {
    pub on_disabled_dependency: DisabledDependencyPolicy,
    pub late_migrations: LateMigrationPolicy,
    pub on_failure: FailurePolicy,
}

#[derive(Debug, Clone)]
pub struct Configuration {
    pub groups: Vec<Group>,
    pub handlers: ExtensionRegistry,
    pub options: RunOptions,
}

impl Configuration {
    pub fn new(groups: Vec<Group>, handlers: ExtensionRegistry) -> Self {
        Self {
            groups,
            handlers,
            options: RunOptions::default(),
        }
    }

    pub fn with_options(mut self, options: RunOptions) -> Self {
        self.options = options;
        self
    }

    pub fn group(&self, name: &str) -> Option<&Group> {
        self.groups.iter().find(|g| g.name == name)
    }

    /// Build the engine configuration from validated settings
    pub fn from_settings(settings: &MigrationsConfig) -> MigrationResult<Self> {
        let mut groups: Vec<Group> = settings
            .effective_groups()
            .into_iter()
            .map(Group::from)
            .collect();

        if settings.diff_generator {
            let schema = settings.schema.as_ref().ok_or_else(|| {
                MigrationError::configuration("diff_generator requires the `schema` setting")
            })?;
            let mut generator =
                StructureDiffGenerator::from_file(schema)?.with_records_table(settings.table.as_str());
            if let Some(ignored) = &settings.ignored_queries_file {
                generator = generator.with_ignored_queries_file(ignored)?;
            }

            let structures = groups
                .iter_mut()
                .find(|g| g.name == STRUCTURES_GROUP)
                .ok_or_else(|| {
                    MigrationError::configuration(format!(
                        "diff_generator needs a '{}' group",
                        STRUCTURES_GROUP
                    ))
                })?;
            structures.generator = Some(Arc::new(generator));
        }

        let mut params = settings.script_params.clone();
        if let Ok(url) = settings.database_url() {
            params
                .entry("STRATA_DATABASE_URL".to_string())
                .or_insert_with(|| url.to_string());
        }
        let handlers = ExtensionRegistry::with_defaults(
            params,
            settings.script_timeout_secs.map(Duration::from_secs),
        );

        let options = RunOptions {
            on_disabled_dependency: settings.on_disabled_dependency,
            late_migrations: settings.late_migrations,
            on_failure: settings.on_failure,
        };

        tracing::debug!(
            groups = groups.len(),
            extensions = ?handlers.extensions(),
            "Built migration configuration"
        );

        Ok(Self {
            groups,
            handlers,
            options,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handlers::Handler;
    use std::fs;
    use tempfile::TempDir;

    #[test]
    fn test_default_groups_from_settings() {
        let settings = MigrationsConfig::new("db/migrations");
        let configuration = Configuration::from_settings(&settings).unwrap();

        let names: Vec<_> = configuration.groups.iter().map(|g| g.name.as_str()).collect();
        assert_eq!(names, vec!["structures", "basic-data", "dummy-data"]);
        assert!(!configuration.group("dummy-data").unwrap().enabled);
        assert_eq!(
            configuration.group("basic-data").unwrap().dependencies,
            vec!["structures".to_string()]
        );
        assert_eq!(configuration.handlers.extensions(), vec!["sh", "sql"]);
        assert_eq!(configuration.options, RunOptions::default());
    }

    #[test]
    fn test_script_handler_receives_database_url() {
        let mut settings = MigrationsConfig::new("db/migrations");
        settings.database_url = Some("postgres://localhost/app".into());
        settings.script_params.insert("APP_ENV".into(), "test".into());

        let configuration = Configuration::from_settings(&settings).unwrap();
        match configuration.handlers.get("sh") {
            Some(Handler::Script(handler)) => {
                assert_eq!(handler.params()["APP_ENV"], "test");
                assert_eq!(handler.params()["STRATA_DATABASE_URL"], "postgres://localhost/app");
            }
            other => panic!("unexpected handler {:?}", other),
        }
    }

    #[test]
    fn test_diff_generator_attached_to_structures() {
        let dir = TempDir::new().unwrap();
        let schema = dir.path().join("schema.yaml");
        fs::write(&schema, "tables: {}\n").unwrap();

        let mut settings = MigrationsConfig::new(dir.path());
        settings.diff_generator = true;
        settings.schema = Some(schema);

        let configuration = Configuration::from_settings(&settings).unwrap();
        assert!(configuration.group("structures").unwrap().generator.is_some());
        assert!(configuration.group("basic-data").unwrap().generator.is_none());
    }

    #[test]
    fn test_missing_schema_file_is_a_configuration_error() {
        let dir = TempDir::new().unwrap();
        let mut settings = MigrationsConfig::new(dir.path());
        settings.diff_generator = true;
        settings.schema = Some(dir.path().join("missing.yaml"));

        let err = Configuration::from_settings(&settings).unwrap_err();
        assert!(err.is_configuration());
    }
}
