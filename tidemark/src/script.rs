//! Discovery of `V<version>__<description>.sql` migration scripts.
//!
//! Versions are compared as strings. `V10` sorts before `V9`, so keep version
//! tokens zero-padded to a common width (`V009`, `V010`).

use crate::error::Error;
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};

/// A migration script read from disk. Immutable once constructed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MigrationScript {
    /// Version token from the file name, without the leading `V`.
    pub version: String,
    /// Description part of the file name, with underscores turned into spaces.
    pub description: String,
    /// Bare file name, e.g. `V1__create_users.sql`.
    pub script_name: String,
    pub path: PathBuf,
    pub sql: String,
    /// Hex SHA-256 of `sql`.
    pub checksum: String,
}

impl MigrationScript {
    /// Build a script from a file name and its contents.
    /// Returns `None` if the file name does not follow the naming convention.
    pub fn from_parts(path: impl Into<PathBuf>, sql: String) -> Option<Self> {
        let path = path.into();
        let script_name = path.file_name()?.to_str()?.to_string();
        let (version, description) = parse_file_name(&script_name)?;
        Some(Self {
            version: version.to_string(),
            description: description.replace('_', " "),
            checksum: checksum(&sql),
            script_name,
            path,
            sql,
        })
    }
}

/// Opaque integrity fingerprint of a script's text.
pub fn checksum(sql: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(sql.as_bytes());
    format!("{:x}", hasher.finalize())
}

/// Extract the version token from a script file name.
///
/// ```
/// assert_eq!(tidemark::extract_version("V1__init.sql").as_deref(), Some("1"));
/// assert_eq!(tidemark::extract_version("README.md"), None);
/// ```
pub fn extract_version(file_name: &str) -> Option<String> {
    parse_file_name(file_name).map(|(version, _)| version.to_string())
}

// Matches `V\d+__.*\.sql`.
fn parse_file_name(file_name: &str) -> Option<(&str, &str)> {
    let stem = file_name.strip_prefix('V')?.strip_suffix(".sql")?;
    let (version, description) = stem.split_once("__")?;
    if version.is_empty() || !version.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    Some((version, description))
}

/// Enumerates migration scripts from a directory.
#[derive(Debug, Clone)]
pub struct ScriptRepository {
    location: PathBuf,
}

impl ScriptRepository {
    pub fn new(location: impl Into<PathBuf>) -> Self {
        Self {
            location: location.into(),
        }
    }

    pub fn location(&self) -> &Path {
        &self.location
    }

    /// Read every script in the directory, ordered by ascending version.
    ///
    /// Entries that don't match the naming convention are skipped. Two scripts
    /// sharing a version is a configuration error.
    pub fn list(&self) -> Result<Vec<MigrationScript>, Error> {
        if !self.location.is_dir() {
            return Err(Error::NotFound(self.location.clone()));
        }
        let entries = std::fs::read_dir(&self.location).map_err(|source| Error::ScriptRead {
            path: self.location.clone(),
            source,
        })?;

        let mut scripts = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|source| Error::ScriptRead {
                path: self.location.clone(),
                source,
            })?;
            let path = entry.path();
            let Some(file_name) = path.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            if parse_file_name(file_name).is_none() || !path.is_file() {
                tracing::trace!(path = %path.display(), "Ignoring non-migration entry");
                continue;
            }
            let sql = std::fs::read_to_string(&path).map_err(|source| Error::ScriptRead {
                path: path.clone(),
                source,
            })?;
            if let Some(script) = MigrationScript::from_parts(path, sql) {
                scripts.push(script);
            }
        }

        scripts.sort_by(|a, b| a.version.cmp(&b.version));

        for pair in scripts.windows(2) {
            if pair[0].version == pair[1].version {
                return Err(Error::Configuration(format!(
                    "Duplicate migration version found: {} ({} and {})",
                    pair[0].version, pair[0].script_name, pair[1].script_name
                )));
            }
        }

        let widths = scripts
            .iter()
            .map(|s| s.version.len())
            .collect::<std::collections::BTreeSet<_>>();
        if widths.len() > 1 {
            tracing::warn!(
                location = %self.location.display(),
                widths = ?widths,
                "Migration versions have different widths; ordering is lexicographic, zero-pad them"
            );
        }

        tracing::debug!(
            location = %self.location.display(),
            count = scripts.len(),
            "Discovered migration scripts"
        );
        Ok(scripts)
    }
}
