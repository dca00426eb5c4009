//! Script extension handler
//!
//! Runs a migration as an external program. The program talks to the
//! database on its own; it receives the configured parameters (typically the
//! database URL) through its environment.

use std::collections::BTreeMap;
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;

use strata_core::{MigrationError, MigrationResult};

use crate::definitions::Migration;

/// Executes script migrations such as `.sh` files
#[derive(Debug, Clone, Default)]
pub struct ScriptHandler {
    /// Program the file is passed to; `None` executes the file itself
    interpreter: Option<String>,
    params: BTreeMap<String, String>,
    timeout: Option<Duration>,
}

impl ScriptHandler {
    /// Execute migration files directly (they must be executable)
    pub fn new(params: BTreeMap<String, String>) -> Self {
        Self {
            interpreter: None,
            params,
            timeout: None,
        }
    }

    /// Run migration files through an interpreter, e.g. `sh` or `python3`
    pub fn with_interpreter(mut self, interpreter: impl Into<String>) -> Self {
        self.interpreter = Some(interpreter.into());
        self
    }

    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn params(&self) -> &BTreeMap<String, String> {
        &self.params
    }

    /// Run the script and wait for it; a non-zero exit status is a failure
    pub async fn handle(&self, migration: &Migration) -> MigrationResult<usize> {
        let fail = |message: String| {
            MigrationError::handler(&migration.group, &migration.filename, None, message)
        };

        let path = tokio::fs::canonicalize(&migration.path)
            .await
            .map_err(|e| fail(format!("cannot resolve script path: {}", e)))?;

        let mut command = match &self.interpreter {
            Some(interpreter) => {
                let mut command = Command::new(interpreter);
                command.arg(&path);
                command
            }
            None => Command::new(&path),
        };

        command
            .envs(&self.params)
            .env("STRATA_GROUP", &migration.group)
            .env("STRATA_VERSION", &migration.version)
            .env("STRATA_FILE", &path)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = path.parent() {
            command.current_dir(dir);
        }

        tracing::debug!(
            group = %migration.group,
            file = %migration.filename,
            interpreter = ?self.interpreter,
            "Running script migration"
        );

        let output = match self.timeout {
            Some(limit) => tokio::time::timeout(limit, command.output())
                .await
                .map_err(|_| fail(format!("timed out after {:?}", limit)))?,
            None => command.output().await,
        }
        .map_err(|e| fail(format!("could not start script: {}", e)))?;

        for line in String::from_utf8_lossy(&output.stdout).lines() {
            tracing::info!(group = %migration.group, file = %migration.filename, "{}", line);
        }

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let stderr = stderr.trim();
            let status = match output.status.code() {
                Some(code) => format!("exit code {}", code),
                None => "termination by signal".to_string(),
            };
            return Err(fail(if stderr.is_empty() {
                format!("script failed with {}", status)
            } else {
                format!("script failed with {}: {}", status, stderr)
            }));
        }

        Ok(1)
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    fn migration(dir: &TempDir, name: &str, body: &str) -> Migration {
        let path = dir.path().join(name);
        fs::write(&path, body).unwrap();
        Migration {
            group: "basic-data".into(),
            version: "001".into(),
            label: "seed".into(),
            filename: name.into(),
            extension: "sh".into(),
            path,
            checksum: String::new(),
        }
    }

    #[tokio::test]
    async fn test_script_receives_parameters() {
        let dir = TempDir::new().unwrap();
        let out = dir.path().join("out.txt");
        let m = migration(
            &dir,
            "001_seed.sh",
            &format!(
                "echo \"$APP_ENV $STRATA_GROUP $STRATA_VERSION\" > {}",
                out.display()
            ),
        );

        let mut params = BTreeMap::new();
        params.insert("APP_ENV".to_string(), "test".to_string());
        let handler = ScriptHandler::new(params).with_interpreter("sh");

        assert_eq!(handler.handle(&m).await.unwrap(), 1);
        assert_eq!(fs::read_to_string(out).unwrap().trim(), "test basic-data 001");
    }

    #[tokio::test]
    async fn test_failing_script_reports_stderr() {
        let dir = TempDir::new().unwrap();
        let m = migration(&dir, "001_seed.sh", "echo 'no such table' >&2\nexit 3\n");
        let handler = ScriptHandler::default().with_interpreter("sh");

        match handler.handle(&m).await.unwrap_err() {
            MigrationError::HandlerExecution {
                group,
                file,
                statement,
                message,
            } => {
                assert_eq!(group, "basic-data");
                assert_eq!(file, "001_seed.sh");
                assert_eq!(statement, None);
                assert_eq!(message, "script failed with exit code 3: no such table");
            }
            other => panic!("unexpected error {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_script_timeout() {
        let dir = TempDir::new().unwrap();
        let m = migration(&dir, "001_slow.sh", "sleep 5\n");
        let handler = ScriptHandler::default()
            .with_interpreter("sh")
            .with_timeout(Some(Duration::from_millis(100)));

        let err = handler.handle(&m).await.unwrap_err();
        assert!(err.to_string().contains("timed out"));
    }
}
