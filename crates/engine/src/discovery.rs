//! Migration discovery - reads a group directory into ordered migrations
//!
//! The directory is re-read on every call; nothing is cached between runs.

use once_cell::sync::Lazy;
use regex::Regex;
use sha2::{Digest, Sha256};
use std::fs;

use strata_core::{MigrationError, MigrationResult};

use crate::definitions::{Group, Migration};
use crate::handlers::ExtensionRegistry;

/// `<version>[-_<label>]`, version being digit runs joined by `-` or `_`
static VERSION_PATTERN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^(?P<version>\d+(?:[-_]\d+)*)(?:[-_](?P<label>\D.*))?$")
        .expect("version pattern is valid")
});

/// Split a filename stem (extension already removed) into version and label
pub fn parse_version(stem: &str) -> Option<(String, String)> {
    let captures = VERSION_PATTERN.captures(stem)?;
    let version = captures.name("version")?.as_str().to_string();
    let label = captures
        .name("label")
        .map(|m| m.as_str().to_string())
        .unwrap_or_default();
    Some((version, label))
}

/// SHA-256 of migration content, hex encoded
pub fn checksum(content: &[u8]) -> String {
    hex::encode(Sha256::digest(content))
}

/// List the migrations of a group in version order
///
/// Every regular, non-hidden file must match a registered extension and carry
/// a version prefix. A group whose directory does not exist has no migrations.
pub fn discover(group: &Group, registry: &ExtensionRegistry) -> MigrationResult<Vec<Migration>> {
    let directory = &group.directory;
    if !directory.exists() {
        tracing::debug!(group = %group.name, directory = %directory.display(), "Group directory does not exist");
        return Ok(Vec::new());
    }
    if !directory.is_dir() {
        return Err(MigrationError::configuration(format!(
            "directory of group '{}' is not a directory: {}",
            group.name,
            directory.display()
        )));
    }

    let mut migrations = Vec::new();
    for entry in fs::read_dir(directory)? {
        let entry = entry?;
        if !entry.file_type()?.is_file() {
            continue;
        }

        let file_name = entry.file_name();
        let Some(filename) = file_name.to_str() else {
            return Err(MigrationError::MalformedMigrationName {
                group: group.name.clone(),
                file: file_name.to_string_lossy().into_owned(),
            });
        };
        if filename.starts_with('.') {
            continue;
        }

        let extension = registry.match_extension(filename).ok_or_else(|| {
            MigrationError::configuration(format!(
                "no extension handler for '{}/{}' (registered: {})",
                group.name,
                filename,
                registry.extensions().join(", ")
            ))
        })?;

        let stem = &filename[..filename.len() - extension.len() - 1];
        let (version, label) =
            parse_version(stem).ok_or_else(|| MigrationError::MalformedMigrationName {
                group: group.name.clone(),
                file: filename.to_string(),
            })?;

        let path = entry.path();
        let content = fs::read(&path)?;

        migrations.push(Migration {
            group: group.name.clone(),
            version,
            label,
            filename: filename.to_string(),
            extension: extension.to_string(),
            path,
            checksum: checksum(&content),
        });
    }

    migrations.sort_by(|a, b| {
        a.version
            .cmp(&b.version)
            .then_with(|| a.filename.cmp(&b.filename))
    });

    if let Some(pair) = migrations.windows(2).find(|w| w[0].version == w[1].version) {
        return Err(MigrationError::configuration(format!(
            "migrations '{}' and '{}' in group '{}' share version {}",
            pair[0].filename, pair[1].filename, group.name, pair[0].version
        )));
    }

    tracing::debug!(group = %group.name, count = migrations.len(), "Discovered migrations");
    Ok(migrations)
}
