//! The history ledger: one row per version ever applied, never deleted.
//!
//! Rollbacks flip `reverted` instead of removing rows, and re-applying a reverted
//! version upserts its existing row. All ledger SQL lives in [StatementTable] so
//! the orchestrator never touches query text.

use crate::error::Error;
use crate::script::MigrationScript;
use chrono::NaiveDateTime;
use serde::Serialize;
use std::collections::HashMap;
use std::time::Duration;

pub const DEFAULT_LEDGER_TABLE_NAME: &str = "tidemark_history";

/// A row of the history ledger.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HistoryRecord {
    pub version: String,
    pub description: String,
    pub script_name: String,
    pub checksum: String,
    pub execution_time_ms: i64,
    pub success: bool,
    pub reverted: bool,
    /// UTC.
    pub applied_at: NaiveDateTime,
}

impl HistoryRecord {
    pub fn is_active(&self) -> bool {
        !self.reverted
    }
}

/// Values written by [Ledger::record_application].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewRecord<'a> {
    pub version: &'a str,
    pub description: &'a str,
    pub script_name: &'a str,
    pub checksum: &'a str,
    pub execution_time_ms: i64,
    pub success: bool,
    pub applied_at: NaiveDateTime,
}

impl<'a> NewRecord<'a> {
    pub fn from_script(
        script: &'a MigrationScript,
        elapsed: Duration,
        applied_at: NaiveDateTime,
    ) -> Self {
        Self {
            version: &script.version,
            description: &script.description,
            script_name: &script.script_name,
            checksum: &script.checksum,
            execution_time_ms: i64::try_from(elapsed.as_millis()).unwrap_or(i64::MAX),
            success: true,
            applied_at,
        }
    }
}

/// Which active rows a rollback marks as reverted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RevertFilter {
    /// `version > X`, compared as strings.
    VersionAbove(String),
    /// `applied_at > T`.
    AppliedAfter(NaiveDateTime),
    /// `version in S`.
    Versions(Vec<String>),
}

/// Persistent record of every migration attempt.
pub trait Ledger {
    /// Create the ledger table if it does not exist.
    fn ensure_schema(&mut self) -> Result<(), Error>;

    /// Whether `version` has an active (non-reverted) record.
    fn is_active(&mut self, version: &str) -> Result<bool, Error>;

    /// Highest active version, if any.
    fn current_version(&mut self) -> Result<Option<String>, Error>;

    /// Active records ordered by `applied_at`.
    fn list_active(&mut self) -> Result<Vec<HistoryRecord>, Error>;

    /// Every record, reverted ones included, ordered by `applied_at`.
    fn list_history(&mut self) -> Result<Vec<HistoryRecord>, Error>;

    /// Insert or refresh the row for a version and clear its `reverted` flag.
    fn record_application(&mut self, record: &NewRecord<'_>) -> Result<(), Error>;

    /// Mark matching active rows reverted, returning how many changed.
    fn mark_reverted(&mut self, filter: &RevertFilter) -> Result<u64, Error>;

    /// The `n` highest active versions, highest first.
    fn recent_active(&mut self, n: u32) -> Result<Vec<String>, Error>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dialect {
    Sqlite,
    Postgres,
}

/// Ledger statements, by what they are for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Statement {
    CreateLedger,
    UpsertRecord,
    IsActive,
    CurrentVersion,
    SelectActive,
    SelectHistory,
    SelectRecentActive,
    MarkRevertedAboveVersion,
    MarkRevertedAfterDate,
    MarkRevertedVersion,
}

impl Statement {
    pub const ALL: [Statement; 10] = [
        Statement::CreateLedger,
        Statement::UpsertRecord,
        Statement::IsActive,
        Statement::CurrentVersion,
        Statement::SelectActive,
        Statement::SelectHistory,
        Statement::SelectRecentActive,
        Statement::MarkRevertedAboveVersion,
        Statement::MarkRevertedAfterDate,
        Statement::MarkRevertedVersion,
    ];
}

/// Column order shared by every select that returns whole records.
pub(crate) const RECORD_COLUMNS: &str =
    "version, description, script_name, checksum, execution_time_ms, success, reverted, applied_at";

/// Rendered SQL for every [Statement] against one ledger table.
#[derive(Debug, Clone)]
pub struct StatementTable {
    dialect: Dialect,
    table: String,
    templates: HashMap<Statement, String>,
}

impl StatementTable {
    pub fn new(dialect: Dialect, table: impl Into<String>) -> Self {
        let table = table.into();
        let templates = Statement::ALL
            .iter()
            .map(|&statement| (statement, render(dialect, &table, statement)))
            .collect();
        Self {
            dialect,
            table,
            templates,
        }
    }

    pub fn dialect(&self) -> Dialect {
        self.dialect
    }

    pub fn table(&self) -> &str {
        &self.table
    }

    pub fn sql(&self, statement: Statement) -> &str {
        &self.templates[&statement]
    }
}

fn render(dialect: Dialect, t: &str, statement: Statement) -> String {
    let (yes, no) = match dialect {
        Dialect::Sqlite => ("1", "0"),
        Dialect::Postgres => ("TRUE", "FALSE"),
    };
    // Placeholders: sqlite takes ?N, postgres $N.
    let p = |n: u8| match dialect {
        Dialect::Sqlite => format!("?{n}"),
        Dialect::Postgres => format!("${n}"),
    };
    match statement {
        Statement::CreateLedger => match dialect {
            Dialect::Sqlite => format!(
                "CREATE TABLE IF NOT EXISTS {t} (
                    version TEXT NOT NULL PRIMARY KEY,
                    description TEXT NOT NULL,
                    script_name TEXT NOT NULL,
                    checksum TEXT NOT NULL,
                    execution_time_ms INTEGER NOT NULL,
                    success INTEGER NOT NULL,
                    reverted INTEGER NOT NULL DEFAULT 0,
                    applied_at TEXT NOT NULL
                )"
            ),
            Dialect::Postgres => format!(
                "CREATE TABLE IF NOT EXISTS {t} (
                    version VARCHAR(50) COLLATE \"C\" NOT NULL PRIMARY KEY,
                    description VARCHAR(255) NOT NULL,
                    script_name VARCHAR(255) NOT NULL,
                    checksum VARCHAR(64) NOT NULL,
                    execution_time_ms BIGINT NOT NULL,
                    success BOOLEAN NOT NULL,
                    reverted BOOLEAN NOT NULL DEFAULT FALSE,
                    applied_at TIMESTAMP NOT NULL DEFAULT CURRENT_TIMESTAMP
                )"
            ),
        },
        Statement::UpsertRecord => format!(
            "INSERT INTO {t} ({RECORD_COLUMNS})
             VALUES ({}, {}, {}, {}, {}, {}, {no}, {})
             ON CONFLICT (version) DO UPDATE SET
                description = excluded.description,
                script_name = excluded.script_name,
                checksum = excluded.checksum,
                execution_time_ms = excluded.execution_time_ms,
                success = excluded.success,
                reverted = {no},
                applied_at = CASE WHEN {t}.reverted = {yes}
                    THEN excluded.applied_at ELSE {t}.applied_at END",
            p(1),
            p(2),
            p(3),
            p(4),
            p(5),
            p(6),
            p(7)
        ),
        Statement::IsActive => format!(
            "SELECT EXISTS (SELECT 1 FROM {t} WHERE version = {} AND reverted = {no})",
            p(1)
        ),
        Statement::CurrentVersion => {
            format!("SELECT MAX(version) FROM {t} WHERE reverted = {no}")
        }
        Statement::SelectActive => format!(
            "SELECT {RECORD_COLUMNS} FROM {t} WHERE reverted = {no} ORDER BY applied_at, version"
        ),
        Statement::SelectHistory => {
            format!("SELECT {RECORD_COLUMNS} FROM {t} ORDER BY applied_at, version")
        }
        Statement::SelectRecentActive => format!(
            "SELECT version FROM {t} WHERE reverted = {no} ORDER BY version DESC LIMIT {}",
            p(1)
        ),
        Statement::MarkRevertedAboveVersion => format!(
            "UPDATE {t} SET reverted = {yes} WHERE version > {} AND reverted = {no}",
            p(1)
        ),
        Statement::MarkRevertedAfterDate => format!(
            "UPDATE {t} SET reverted = {yes} WHERE applied_at > {} AND reverted = {no}",
            p(1)
        ),
        Statement::MarkRevertedVersion => format!(
            "UPDATE {t} SET reverted = {yes} WHERE version = {} AND reverted = {no}",
            p(1)
        ),
    }
}
