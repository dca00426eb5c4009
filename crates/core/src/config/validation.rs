use thiserror::Error;

/// Configuration error type
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Missing required field: {field}. {hint}")]
    MissingRequired { field: String, hint: String },

    #[error("Invalid value for field '{field}': '{value}'. Expected: {expected}")]
    InvalidValue {
        field: String,
        value: String,
        expected: String,
    },

    #[error("Configuration validation failed: {message}")]
    ValidationFailed { message: String },

    #[error("File system error: {message}")]
    FileSystemError { message: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

impl ConfigError {
    /// Create a missing required field error
    pub fn missing_required(field: impl Into<String>, hint: impl Into<String>) -> Self {
        Self::MissingRequired {
            field: field.into(),
            hint: hint.into(),
        }
    }

    /// Create an invalid value error
    pub fn invalid_value(
        field: impl Into<String>,
        value: impl Into<String>,
        expected: impl Into<String>,
    ) -> Self {
        Self::InvalidValue {
            field: field.into(),
            value: value.into(),
            expected: expected.into(),
        }
    }

    /// Create a validation failed error
    pub fn validation_failed(message: impl Into<String>) -> Self {
        Self::ValidationFailed {
            message: message.into(),
        }
    }
}

/// Trait for validating configuration values
pub trait ConfigValidator<T: ?Sized> {
    /// Validate a configuration value
    fn validate(&self, value: &T) -> Result<(), ConfigError>;
}

/// Database URL validator
pub struct DatabaseUrlValidator {
    pub schemes: Vec<String>,
}

impl DatabaseUrlValidator {
    /// Accept only the schemes understood by the given driver
    pub fn for_driver(driver: &str) -> Self {
        let schemes: &[&str] = match driver {
            "mysql" => &["mysql", "mariadb"],
            _ => &["postgres", "postgresql"],
        };
        Self {
            schemes: schemes.iter().map(|s| s.to_string()).collect(),
        }
    }
}

impl ConfigValidator<str> for DatabaseUrlValidator {
    fn validate(&self, value: &str) -> Result<(), ConfigError> {
        if value.is_empty() {
            return Err(ConfigError::invalid_value(
                "database_url",
                value,
                "non-empty URL",
            ));
        }

        let has_valid_scheme = self
            .schemes
            .iter()
            .any(|scheme| value.starts_with(&format!("{}://", scheme)));

        if !has_valid_scheme {
            return Err(ConfigError::invalid_value(
                "database_url",
                value,
                format!("URL with scheme: {}", self.schemes.join(", ")),
            ));
        }

        Ok(())
    }
}

/// Validates group names: lowercase words joined by dashes, e.g. `basic-data`
pub struct GroupNameValidator;

impl ConfigValidator<str> for GroupNameValidator {
    fn validate(&self, value: &str) -> Result<(), ConfigError> {
        let valid = !value.is_empty()
            && value.len() <= 100
            && !value.starts_with('-')
            && !value.ends_with('-')
            && value
                .chars()
                .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-' || c == '_');

        if !valid {
            return Err(ConfigError::invalid_value(
                "groups.name",
                value,
                "lowercase letters, digits, '-' or '_' (at most 100 characters)",
            ));
        }
        Ok(())
    }
}

/// Validates SQL identifiers used for the record table
pub struct IdentifierValidator {
    pub field: &'static str,
}

impl ConfigValidator<str> for IdentifierValidator {
    fn validate(&self, value: &str) -> Result<(), ConfigError> {
        let mut chars = value.chars();
        let valid = match chars.next() {
            Some(first) => {
                (first.is_ascii_alphabetic() || first == '_')
                    && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
                    && value.len() <= 63
            }
            None => false,
        };

        if !valid {
            return Err(ConfigError::invalid_value(
                self.field,
                value,
                "an unquoted SQL identifier (letters, digits, '_', at most 63 characters)",
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_database_url_validator() {
        let validator = DatabaseUrlValidator::for_driver("pgsql");

        assert!(validator.validate("postgres://localhost/app").is_ok());
        assert!(validator.validate("postgresql://u:p@db:5432/app").is_ok());
        assert!(validator.validate("mysql://localhost/app").is_err());
        assert!(validator.validate("").is_err());

        let validator = DatabaseUrlValidator::for_driver("mysql");
        assert!(validator.validate("mysql://root@localhost/app").is_ok());
    }

    #[test]
    fn test_group_name_validator() {
        assert!(GroupNameValidator.validate("basic-data").is_ok());
        assert!(GroupNameValidator.validate("structures").is_ok());
        assert!(GroupNameValidator.validate("Basic Data").is_err());
        assert!(GroupNameValidator.validate("-data").is_err());
        assert!(GroupNameValidator.validate("").is_err());
    }

    #[test]
    fn test_identifier_validator() {
        let validator = IdentifierValidator { field: "table" };
        assert!(validator.validate("migrations").is_ok());
        assert!(validator.validate("_strata_log").is_ok());
        assert!(validator.validate("1migrations").is_err());
        assert!(validator.validate("bad;name").is_err());
    }
}
