use crate::config::{
    ConfigError, ConfigSource, ConfigValidator, DatabaseUrlValidator, GroupNameValidator,
    IdentifierValidator,
};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::env;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

/// Environment variables consulted for the database URL, in priority order
pub const DATABASE_URL_VARS: [&str; 2] = ["STRATA_DATABASE_URL", "DATABASE_URL"];

/// Database engine the migrations target
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum DriverKind {
    #[default]
    #[serde(rename = "pgsql", alias = "postgres")]
    PgSql,
    #[serde(rename = "mysql")]
    MySql,
}

impl fmt::Display for DriverKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DriverKind::PgSql => write!(f, "pgsql"),
            DriverKind::MySql => write!(f, "mysql"),
        }
    }
}

/// What happens to an enabled group that depends on a disabled one
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DisabledDependencyPolicy {
    /// Reject the configuration before anything runs
    #[default]
    Fail,
    /// Exclude the dependent group (and its own dependents) from the run
    Skip,
}

/// What happens to a new migration that sorts before the latest applied one
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum LateMigrationPolicy {
    #[default]
    Reject,
    Apply,
}

/// How a failed migration affects the groups that come after it
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FailurePolicy {
    /// Stop processing every remaining group
    #[default]
    Halt,
    /// Skip groups depending on the failed one, keep applying independent groups
    SkipDependents,
}

/// One migration group as written in the settings file
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct GroupConfig {
    pub name: String,
    pub directory: PathBuf,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub dependencies: Vec<String>,
}

impl GroupConfig {
    pub fn new(name: impl Into<String>, directory: impl Into<PathBuf>) -> Self {
        Self {
            name: name.into(),
            directory: directory.into(),
            enabled: true,
            dependencies: Vec::new(),
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
}

/// Settings for a migration run, usually loaded from `strata.yaml`
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MigrationsConfig {
    /// Base directory of the default `structures`/`basic-data`/`dummy-data` groups
    #[serde(default = "default_dir")]
    pub dir: PathBuf,
    #[serde(default)]
    pub driver: DriverKind,
    #[serde(default)]
    pub database_url: Option<String>,
    /// Table holding the execution records
    #[serde(default = "default_table")]
    pub table: String,
    #[serde(default)]
    pub with_dummy_data: bool,
    /// Attach a structure diff generator to the `structures` group
    #[serde(default)]
    pub diff_generator: bool,
    /// Expected schema consumed by the diff generator
    #[serde(default)]
    pub schema: Option<PathBuf>,
    #[serde(default)]
    pub ignored_queries_file: Option<PathBuf>,
    /// Passed to script migrations as environment variables
    #[serde(default)]
    pub script_params: BTreeMap<String, String>,
    #[serde(default)]
    pub script_timeout_secs: Option<u64>,
    #[serde(default)]
    pub on_disabled_dependency: DisabledDependencyPolicy,
    #[serde(default)]
    pub late_migrations: LateMigrationPolicy,
    #[serde(default)]
    pub on_failure: FailurePolicy,
    /// Explicit groups; when absent the default trio is derived from `dir`
    #[serde(default)]
    pub groups: Option<Vec<GroupConfig>>,

    #[serde(skip)]
    origin: Option<PathBuf>,
    #[serde(skip)]
    database_url_source: Option<ConfigSource>,
}

fn default_true() -> bool {
    true
}

fn default_dir() -> PathBuf {
    PathBuf::from("migrations")
}

fn default_table() -> String {
    "migrations".to_string()
}

impl Default for MigrationsConfig {
    fn default() -> Self {
        Self {
            dir: default_dir(),
            driver: DriverKind::default(),
            database_url: None,
            table: default_table(),
            with_dummy_data: false,
            diff_generator: false,
            schema: None,
            ignored_queries_file: None,
            script_params: BTreeMap::new(),
            script_timeout_secs: None,
            on_disabled_dependency: DisabledDependencyPolicy::default(),
            late_migrations: LateMigrationPolicy::default(),
            on_failure: FailurePolicy::default(),
            groups: None,
            origin: None,
            database_url_source: None,
        }
    }
}

impl MigrationsConfig {
    /// Create settings rooted at the given migrations directory
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            ..Self::default()
        }
    }

    /// Parse settings from YAML without touching the environment
    pub fn from_yaml(content: &str) -> Result<Self, ConfigError> {
        let mut config: MigrationsConfig = serde_yaml::from_str(content)?;
        if config.database_url.is_some() {
            config.database_url_source = Some(ConfigSource::Programmatic);
        }
        Ok(config)
    }

    /// Load settings from a file, resolve relative paths against its
    /// directory, apply environment overrides and validate
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        Self::load_with_env(path, |name| env::var(name).ok())
    }

    /// [`MigrationsConfig::load`] with the environment read through `lookup`
    pub fn load_with_env<F>(path: impl AsRef<Path>, lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let path = path.as_ref();
        let content = fs::read_to_string(path).map_err(|e| ConfigError::FileSystemError {
            message: format!("cannot read settings file {}: {}", path.display(), e),
        })?;

        let mut config = Self::from_yaml(&content)?;
        if config.database_url.is_some() {
            config.database_url_source = Some(ConfigSource::File(path.display().to_string()));
        }

        let base = path.parent().unwrap_or_else(|| Path::new("."));
        config.resolve_paths(base);
        config.origin = Some(path.to_path_buf());
        config.apply_env(lookup);
        config.validate()?;

        tracing::debug!(
            settings = %path.display(),
            driver = %config.driver,
            groups = config.effective_groups().len(),
            "Loaded migration settings"
        );
        Ok(config)
    }

    /// Override values from the environment as seen through `lookup`
    pub fn apply_env<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        for var in DATABASE_URL_VARS {
            if let Some(url) = lookup(var).filter(|v| !v.is_empty()) {
                self.database_url = Some(url);
                self.database_url_source = Some(ConfigSource::EnvVar(var.to_string()));
                return;
            }
        }
    }

    /// Make every relative path absolute against `base`
    pub fn resolve_paths(&mut self, base: &Path) {
        let resolve = |p: &mut PathBuf| {
            if p.is_relative() {
                *p = base.join(&*p);
            }
        };

        resolve(&mut self.dir);
        if let Some(schema) = self.schema.as_mut() {
            resolve(schema);
        }
        if let Some(ignored) = self.ignored_queries_file.as_mut() {
            resolve(ignored);
        }
        if let Some(groups) = self.groups.as_mut() {
            for group in groups {
                resolve(&mut group.directory);
            }
        }
    }

    /// Groups to configure, in declaration order
    pub fn effective_groups(&self) -> Vec<GroupConfig> {
        match &self.groups {
            Some(groups) => groups.clone(),
            None => self.default_groups(),
        }
    }

    /// The conventional structures / basic-data / dummy-data layout
    pub fn default_groups(&self) -> Vec<GroupConfig> {
        vec![
            GroupConfig::new("structures", self.dir.join("structures")),
            GroupConfig::new("basic-data", self.dir.join("basic-data"))
                .with_dependencies(["structures"]),
            GroupConfig::new("dummy-data", self.dir.join("dummy-data"))
                .with_dependencies(["structures", "basic-data"])
                .enabled(self.with_dummy_data),
        ]
    }

    /// Database URL, required by the real drivers
    pub fn database_url(&self) -> Result<&str, ConfigError> {
        self.database_url.as_deref().ok_or_else(|| {
            ConfigError::missing_required(
                "database_url",
                format!(
                    "Set it in the settings file or through {}",
                    DATABASE_URL_VARS.join(" / ")
                ),
            )
        })
    }

    /// Settings file this configuration was loaded from
    pub fn origin(&self) -> Option<&Path> {
        self.origin.as_deref()
    }

    /// Validate the settings
    pub fn validate(&self) -> Result<(), ConfigError> {
        IdentifierValidator { field: "table" }.validate(self.table.as_str())?;

        if let Some(url) = &self.database_url {
            DatabaseUrlValidator::for_driver(&self.driver.to_string()).validate(url.as_str())?;
        }

        if self.diff_generator && self.schema.is_none() {
            return Err(ConfigError::missing_required(
                "schema",
                "diff_generator requires the expected schema file",
            ));
        }

        if self.script_timeout_secs == Some(0) {
            return Err(ConfigError::invalid_value(
                "script_timeout_secs",
                "0",
                "a positive number of seconds",
            ));
        }

        if let Some(groups) = &self.groups {
            if groups.is_empty() {
                return Err(ConfigError::validation_failed(
                    "groups must list at least one group when present",
                ));
            }
        }

        let mut seen = HashSet::new();
        for group in self.effective_groups() {
            GroupNameValidator.validate(group.name.as_str())?;
            if !seen.insert(group.name.clone()) {
                return Err(ConfigError::validation_failed(format!(
                    "group '{}' is declared more than once",
                    group.name
                )));
            }
            if group.directory.as_os_str().is_empty() {
                return Err(ConfigError::missing_required(
                    format!("groups.{}.directory", group.name),
                    "every group needs a directory",
                ));
            }
        }

        Ok(())
    }

    /// Source of each externally provided value, for diagnostics
    pub fn config_sources(&self) -> HashMap<String, ConfigSource> {
        let mut sources = HashMap::new();
        let file_or = |default: &str| match &self.origin {
            Some(path) => ConfigSource::File(path.display().to_string()),
            None => ConfigSource::Default(default.to_string()),
        };

        sources.insert(
            "database_url".to_string(),
            self.database_url_source
                .clone()
                .unwrap_or_else(|| ConfigSource::Default("unset".to_string())),
        );
        sources.insert(
            "groups".to_string(),
            if self.groups.is_some() {
                file_or("explicit")
            } else {
                ConfigSource::Default("structures, basic-data, dummy-data".to_string())
            },
        );
        sources.insert("driver".to_string(), file_or("pgsql"));
        sources.insert("table".to_string(), file_or("migrations"));

        sources
    }
}
