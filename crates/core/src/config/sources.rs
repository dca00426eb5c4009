/// Where a settings value came from, logged at debug level by the `strata` commands
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigSource {
    /// Value loaded from environment variable
    EnvVar(String),
    /// Default value used
    Default(String),
    /// Value loaded from the settings file
    File(String),
    /// Value provided programmatically
    Programmatic,
}

impl ConfigSource {
    /// Get source description
    pub fn description(&self) -> String {
        match self {
            ConfigSource::EnvVar(var) => format!("environment variable {}", var),
            ConfigSource::Default(value) => format!("default ({})", value),
            ConfigSource::File(path) => format!("settings file {}", path),
            ConfigSource::Programmatic => "set programmatically".to_string(),
        }
    }
}

impl std::fmt::Display for ConfigSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.description())
    }
}
