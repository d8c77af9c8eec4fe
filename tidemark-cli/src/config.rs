//! `tidemark.toml` loading.
//!
//! ```toml
//! database_url = "sqlite://app.db"
//! migrations = "db/migrations"
//! ledger_table = "tidemark_history"
//!
//! [lock]
//! timeout_secs = 30
//! poll_interval_ms = 500
//! max_recoveries = 3
//! ```
//!
//! Precedence: command-line flags, then environment, then the file, then defaults.

use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tidemark::RetryPolicy;

pub const DEFAULT_CONFIG_FILE: &str = "tidemark.toml";
pub const MIGRATIONS_ENV: &str = "TIDEMARK_MIGRATIONS";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read {}: {source}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid config in {}: {source}", path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
    #[error(
        "no database URL; pass --database-url, set ${env}, or add database_url to the config file"
    )]
    MissingDatabaseUrl { env: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    pub database_url: Option<String>,
    /// Environment variable consulted for the database URL.
    pub database_url_env: String,
    pub migrations: PathBuf,
    pub ledger_table: Option<String>,
    pub lock: LockConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            database_url: None,
            database_url_env: "DATABASE_URL".to_string(),
            migrations: PathBuf::from("migrations"),
            ledger_table: None,
            lock: LockConfig::default(),
        }
    }
}

/// Lock waiting. Leaving every field unset keeps the backend's own default
/// (fail fast on SQLite, bounded wait on PostgreSQL).
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct LockConfig {
    pub fail_fast: bool,
    pub timeout_secs: Option<u64>,
    pub poll_interval_ms: Option<u64>,
    pub max_recoveries: Option<u32>,
    pub sqlite_lock_table: Option<String>,
    pub advisory_lock_id: Option<i64>,
}

impl LockConfig {
    pub fn retry_policy(&self) -> Option<RetryPolicy> {
        if self.fail_fast {
            return Some(RetryPolicy::fail_fast());
        }
        if self.timeout_secs.is_none()
            && self.poll_interval_ms.is_none()
            && self.max_recoveries.is_none()
        {
            return None;
        }
        let policy = RetryPolicy::bounded(
            self.timeout_secs
                .map(Duration::from_secs)
                .unwrap_or(RetryPolicy::DEFAULT_TIMEOUT),
            self.poll_interval_ms
                .map(Duration::from_millis)
                .unwrap_or(RetryPolicy::DEFAULT_POLL_INTERVAL),
        );
        Some(match self.max_recoveries {
            Some(max) => policy.with_max_recoveries(max),
            None => policy,
        })
    }
}

impl Config {
    /// Read `path`. A missing file is only an error when `required`.
    pub fn load(path: &Path, required: bool) -> Result<Self, ConfigError> {
        let text = match std::fs::read_to_string(path) {
            Ok(text) => text,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound && !required => {
                tracing::debug!(path = %path.display(), "No config file, using defaults");
                return Ok(Self::default());
            }
            Err(source) => {
                return Err(ConfigError::Read {
                    path: path.to_path_buf(),
                    source,
                })
            }
        };
        Self::parse(&text).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn parse(text: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(text)
    }

    /// Overlay values from the environment, looked up through `var`.
    pub fn apply_env(&mut self, var: impl Fn(&str) -> Option<String>) {
        if let Some(url) = var(&self.database_url_env) {
            self.database_url = Some(url);
        }
        if let Some(dir) = var(MIGRATIONS_ENV) {
            self.migrations = PathBuf::from(dir);
        }
    }

    pub fn database_url(&self) -> Result<&str, ConfigError> {
        self.database_url
            .as_deref()
            .ok_or_else(|| ConfigError::MissingDatabaseUrl {
                env: self.database_url_env.clone(),
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn defaults_without_file() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::load(&dir.path().join("tidemark.toml"), false).unwrap();
        assert_eq!(config, Config::default());
        assert_eq!(config.migrations, PathBuf::from("migrations"));
        assert!(config.lock.retry_policy().is_none());
    }

    #[test]
    fn explicit_missing_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = Config::load(&dir.path().join("custom.toml"), true).unwrap_err();
        assert!(matches!(err, ConfigError::Read { .. }));
    }

    #[test]
    fn parses_full_file() {
        let config = Config::parse(
            r#"
            database_url = "sqlite://app.db"
            database_url_env = "APP_DB"
            migrations = "db/migrations"
            ledger_table = "schema_history"

            [lock]
            timeout_secs = 10
            poll_interval_ms = 250
            max_recoveries = 1
            advisory_lock_id = 99
            "#,
        )
        .unwrap();
        assert_eq!(config.database_url().unwrap(), "sqlite://app.db");
        assert_eq!(config.migrations, PathBuf::from("db/migrations"));
        assert_eq!(config.ledger_table.as_deref(), Some("schema_history"));
        assert_eq!(config.lock.advisory_lock_id, Some(99));
        assert_eq!(
            config.lock.retry_policy(),
            Some(
                RetryPolicy::bounded(Duration::from_secs(10), Duration::from_millis(250))
                    .with_max_recoveries(1)
            )
        );
    }

    #[test]
    fn unknown_keys_are_rejected() {
        assert!(Config::parse("databse_url = \"x\"").is_err());
    }

    #[test]
    fn fail_fast_wins() {
        let lock = LockConfig {
            fail_fast: true,
            timeout_secs: Some(5),
            ..Default::default()
        };
        assert_eq!(lock.retry_policy(), Some(RetryPolicy::fail_fast()));
    }

    #[test]
    fn environment_overrides_file() {
        let mut config = Config::parse(
            r#"
            database_url = "sqlite://file.db"
            database_url_env = "APP_DB"
            "#,
        )
        .unwrap();
        let env: HashMap<&str, &str> = [
            ("APP_DB", "postgres://localhost/app"),
            ("DATABASE_URL", "ignored"),
            (MIGRATIONS_ENV, "sql"),
        ]
        .into_iter()
        .collect();
        config.apply_env(|name| env.get(name).map(|v| v.to_string()));

        assert_eq!(config.database_url().unwrap(), "postgres://localhost/app");
        assert_eq!(config.migrations, PathBuf::from("sql"));
    }

    #[test]
    fn missing_url_names_the_variable() {
        let err = Config::default().database_url().unwrap_err();
        assert!(err.to_string().contains("$DATABASE_URL"));
    }
}
