//! # SQLite backend
//!
//! Uses [`rusqlite`](https://crates.io/crates/rusqlite). SQLite has no session
//! advisory locks, so mutual exclusion is a single-row lock table
//! (`locked`, `locked_by`, `locked_at`) next to the ledger. A lock row left behind
//! by a crashed process stays set until [LockPrimitive::force_clear] is called,
//! either by an operator or by a [RetryPolicy](crate::RetryPolicy) timeout.
//!
//! SQLite fully supports transactional DDL, so a failed run leaves both schema and
//! ledger exactly as they were.
//!
//! ## Example
//!
//! ```no_run
//! use tidemark::sqlite::SqliteBackend;
//! use tidemark::Migrator;
//!
//! let mut db = SqliteBackend::open("app.db")?;
//! let report = Migrator::new("migrations").migrate(&mut db)?;
//! println!("applied {:?}", report.applied);
//! # Ok::<(), tidemark::Error>(())
//! ```

use crate::backend::Backend;
use crate::error::Error;
use crate::ledger::{
    Dialect, HistoryRecord, Ledger, NewRecord, RevertFilter, Statement, StatementTable,
    DEFAULT_LEDGER_TABLE_NAME,
};
use crate::lock::{LockPrimitive, RetryPolicy};
use chrono::{NaiveDateTime, Utc};
use rusqlite::types::Type;
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::path::Path;
use std::time::Duration;

pub const DEFAULT_LOCK_TABLE_NAME: &str = "tidemark_lock";

/// Fixed-width so stored timestamps compare correctly as text.
const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.6f";

// Re-export so callers don't need a direct rusqlite dependency to build a backend.
pub use rusqlite::Connection as SqliteConnection;

/// A caller-owned SQLite connection the migrator can drive.
pub struct SqliteBackend {
    conn: Connection,
    statements: StatementTable,
    lock_table: String,
    held_by: Option<String>,
}

impl std::fmt::Debug for SqliteBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqliteBackend")
            .field("ledger_table", &self.statements.table())
            .field("lock_table", &self.lock_table)
            .field("held_by", &self.held_by)
            .finish()
    }
}

impl SqliteBackend {
    pub const DEFAULT_BUSY_TIMEOUT: Duration = Duration::from_secs(30);

    pub fn new(conn: Connection) -> Self {
        Self {
            conn,
            statements: StatementTable::new(Dialect::Sqlite, DEFAULT_LEDGER_TABLE_NAME),
            lock_table: DEFAULT_LOCK_TABLE_NAME.to_string(),
            held_by: None,
        }
    }

    /// Open a database file. Concurrent writers wait up to
    /// [DEFAULT_BUSY_TIMEOUT](Self::DEFAULT_BUSY_TIMEOUT) instead of failing immediately.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, Error> {
        let conn = Connection::open(path)?;
        conn.busy_timeout(Self::DEFAULT_BUSY_TIMEOUT)?;
        Ok(Self::new(conn))
    }

    pub fn open_in_memory() -> Result<Self, Error> {
        Ok(Self::new(Connection::open_in_memory()?))
    }

    /// Set a custom name for the ledger table. Defaults to "tidemark_history".
    pub fn with_ledger_table_name(mut self, name: impl Into<String>) -> Self {
        self.statements = StatementTable::new(Dialect::Sqlite, name);
        self
    }

    /// Set a custom name for the lock table. Defaults to "tidemark_lock".
    pub fn with_lock_table_name(mut self, name: impl Into<String>) -> Self {
        self.lock_table = name.into();
        self
    }

    pub fn with_busy_timeout(self, timeout: Duration) -> Result<Self, Error> {
        self.conn.busy_timeout(timeout)?;
        Ok(self)
    }

    pub fn ledger_table_name(&self) -> &str {
        self.statements.table()
    }

    pub fn lock_table_name(&self) -> &str {
        &self.lock_table
    }

    pub fn connection(&self) -> &Connection {
        &self.conn
    }

    pub fn into_inner(self) -> Connection {
        self.conn
    }

    fn ensure_lock_table(&self) -> Result<(), Error> {
        self.conn.execute_batch(&format!(
            "CREATE TABLE IF NOT EXISTS {lock} (
                id INTEGER PRIMARY KEY CHECK (id = 1),
                locked INTEGER NOT NULL DEFAULT 0,
                locked_by TEXT,
                locked_at TEXT
            );
            INSERT OR IGNORE INTO {lock} (id, locked) VALUES (1, 0);",
            lock = self.lock_table
        ))?;
        Ok(())
    }

    fn table_exists(&self, name: &str) -> Result<bool, Error> {
        let exists = self.conn.query_row(
            "SELECT EXISTS (SELECT 1 FROM sqlite_master WHERE type = 'table' AND name = ?1)",
            [name],
            |row| row.get(0),
        )?;
        Ok(exists)
    }

    fn query_records(&self, statement: Statement) -> Result<Vec<HistoryRecord>, Error> {
        let mut stmt = self.conn.prepare(self.statements.sql(statement))?;
        let records = stmt
            .query_map([], read_record)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(records)
    }
}

pub(crate) fn format_timestamp(at: &NaiveDateTime) -> String {
    at.format(TIMESTAMP_FORMAT).to_string()
}

fn parse_timestamp(idx: usize, raw: &str) -> rusqlite::Result<NaiveDateTime> {
    NaiveDateTime::parse_from_str(raw, "%Y-%m-%d %H:%M:%S%.f")
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

fn read_record(row: &Row<'_>) -> rusqlite::Result<HistoryRecord> {
    let applied_at: String = row.get(7)?;
    Ok(HistoryRecord {
        version: row.get(0)?,
        description: row.get(1)?,
        script_name: row.get(2)?,
        checksum: row.get(3)?,
        execution_time_ms: row.get(4)?,
        success: row.get(5)?,
        reverted: row.get(6)?,
        applied_at: parse_timestamp(7, &applied_at)?,
    })
}

fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

impl LockPrimitive for SqliteBackend {
    fn try_acquire(&mut self, owner: &str) -> Result<bool, Error> {
        if self.held_by.is_some() {
            return Ok(true);
        }
        self.ensure_lock_table()?;
        let changed = self.conn.execute(
            &format!(
                "UPDATE {} SET locked = 1, locked_by = ?1, locked_at = ?2 \
                 WHERE id = 1 AND locked = 0",
                self.lock_table
            ),
            params![owner, format_timestamp(&Utc::now().naive_utc())],
        )?;
        if changed == 1 {
            self.held_by = Some(owner.to_string());
            return Ok(true);
        }
        let holder: Option<(Option<String>, Option<String>)> = self
            .conn
            .query_row(
                &format!("SELECT locked_by, locked_at FROM {} WHERE id = 1", self.lock_table),
                [],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;
        if let Some((locked_by, locked_at)) = holder {
            tracing::debug!(?locked_by, ?locked_at, "Lock row is held");
        }
        Ok(false)
    }

    fn release(&mut self) -> Result<(), Error> {
        // An open transaction would swallow the unlock when the connection closes.
        if !self.conn.is_autocommit() {
            self.conn.execute_batch("ROLLBACK")?;
        }
        let Some(owner) = self.held_by.take() else {
            return Ok(());
        };
        self.conn.execute(
            &format!(
                "UPDATE {} SET locked = 0, locked_by = NULL, locked_at = NULL \
                 WHERE id = 1 AND locked_by = ?1",
                self.lock_table
            ),
            [&owner],
        )?;
        Ok(())
    }

    fn force_clear(&mut self) -> Result<(), Error> {
        if !self.table_exists(&self.lock_table)? {
            return Ok(());
        }
        let holder: Option<(Option<String>, Option<String>)> = self
            .conn
            .query_row(
                &format!("SELECT locked_by, locked_at FROM {} WHERE id = 1", self.lock_table),
                [],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;
        tracing::warn!(
            lock_table = %self.lock_table,
            holder = ?holder,
            "Forcibly clearing migration lock row"
        );
        self.conn.execute(
            &format!(
                "UPDATE {} SET locked = 0, locked_by = NULL, locked_at = NULL WHERE id = 1",
                self.lock_table
            ),
            [],
        )?;
        self.held_by = None;
        Ok(())
    }

    fn is_locked(&mut self) -> Result<bool, Error> {
        if !self.table_exists(&self.lock_table)? {
            return Ok(false);
        }
        let locked: Option<bool> = self
            .conn
            .query_row(
                &format!("SELECT locked FROM {} WHERE id = 1", self.lock_table),
                [],
                |row| row.get(0),
            )
            .optional()?;
        Ok(locked.unwrap_or(false))
    }
}

impl Ledger for SqliteBackend {
    fn ensure_schema(&mut self) -> Result<(), Error> {
        self.conn
            .execute_batch(self.statements.sql(Statement::CreateLedger))?;
        tracing::debug!(table = %self.statements.table(), "Ledger table verified");
        Ok(())
    }

    fn is_active(&mut self, version: &str) -> Result<bool, Error> {
        let active = self
            .conn
            .query_row(self.statements.sql(Statement::IsActive), [version], |row| {
                row.get(0)
            })?;
        Ok(active)
    }

    fn current_version(&mut self) -> Result<Option<String>, Error> {
        let version = self.conn.query_row(
            self.statements.sql(Statement::CurrentVersion),
            [],
            |row| row.get(0),
        )?;
        Ok(version)
    }

    fn list_active(&mut self) -> Result<Vec<HistoryRecord>, Error> {
        self.query_records(Statement::SelectActive)
    }

    fn list_history(&mut self) -> Result<Vec<HistoryRecord>, Error> {
        self.query_records(Statement::SelectHistory)
    }

    fn record_application(&mut self, record: &NewRecord<'_>) -> Result<(), Error> {
        self.conn.execute(
            self.statements.sql(Statement::UpsertRecord),
            params![
                record.version,
                record.description,
                record.script_name,
                record.checksum,
                record.execution_time_ms,
                record.success,
                format_timestamp(&record.applied_at),
            ],
        )?;
        Ok(())
    }

    fn mark_reverted(&mut self, filter: &RevertFilter) -> Result<u64, Error> {
        let changed = match filter {
            RevertFilter::VersionAbove(version) => self.conn.execute(
                self.statements.sql(Statement::MarkRevertedAboveVersion),
                [version],
            )?,
            RevertFilter::AppliedAfter(at) => self.conn.execute(
                self.statements.sql(Statement::MarkRevertedAfterDate),
                [format_timestamp(at)],
            )?,
            RevertFilter::Versions(versions) => {
                let mut stmt = self
                    .conn
                    .prepare(self.statements.sql(Statement::MarkRevertedVersion))?;
                let mut changed = 0;
                for version in versions {
                    changed += stmt.execute([version])?;
                }
                changed
            }
        };
        Ok(changed as u64)
    }

    fn recent_active(&mut self, n: u32) -> Result<Vec<String>, Error> {
        let mut stmt = self
            .conn
            .prepare(self.statements.sql(Statement::SelectRecentActive))?;
        let versions = stmt
            .query_map([i64::from(n)], |row| row.get(0))?
            .collect::<Result<Vec<String>, _>>()?;
        Ok(versions)
    }
}

impl Backend for SqliteBackend {
    fn begin(&mut self) -> Result<(), Error> {
        // Take the write lock up front so a concurrent writer waits on the busy
        // timeout instead of failing to upgrade mid-transaction.
        self.conn.execute_batch("BEGIN IMMEDIATE")?;
        Ok(())
    }

    fn commit(&mut self) -> Result<(), Error> {
        self.conn.execute_batch("COMMIT")?;
        Ok(())
    }

    fn rollback(&mut self) -> Result<(), Error> {
        if !self.conn.is_autocommit() {
            self.conn.execute_batch("ROLLBACK")?;
        }
        Ok(())
    }

    fn execute_script(&mut self, sql: &str) -> Result<(), Error> {
        self.conn.execute_batch(sql)?;
        Ok(())
    }

    fn wipe_schema(&mut self) -> Result<usize, Error> {
        let objects = {
            let mut stmt = self.conn.prepare(
                "SELECT type, name FROM sqlite_master
                 WHERE type IN ('view', 'trigger', 'table')
                   AND name NOT LIKE 'sqlite_%'
                   AND lower(name) NOT IN (lower(?1), lower(?2))
                 ORDER BY CASE type WHEN 'view' THEN 0 WHEN 'trigger' THEN 1 ELSE 2 END, name",
            )?;
            let rows = stmt
                .query_map([self.statements.table(), self.lock_table.as_str()], |row| {
                    Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
                })?
                .collect::<Result<Vec<_>, _>>()?;
            rows
        };

        // Parent tables may go before their children; check references at commit instead.
        self.conn.execute_batch("PRAGMA defer_foreign_keys = ON")?;
        for (kind, name) in &objects {
            tracing::debug!(kind = %kind, name = %name, "Dropping schema object");
            self.conn.execute_batch(&format!(
                "DROP {} IF EXISTS {}",
                kind.to_uppercase(),
                quote_ident(name)
            ))?;
        }
        tracing::info!(dropped = objects.len(), "Wiped schema objects outside the ledger");
        Ok(objects.len())
    }

    /// A taken lock row aborts the run. Stale rows need an explicit force-unlock.
    fn default_retry_policy(&self) -> RetryPolicy {
        RetryPolicy::fail_fast()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record<'a>(version: &'a str, at: NaiveDateTime) -> NewRecord<'a> {
        NewRecord {
            version,
            description: "d",
            script_name: "V__d.sql",
            checksum: "c",
            execution_time_ms: 1,
            success: true,
            applied_at: at,
        }
    }

    fn at(day: u32) -> NaiveDateTime {
        chrono::NaiveDate::from_ymd_opt(2024, 11, day)
            .unwrap()
            .and_hms_micro_opt(12, 30, 0, 250)
            .unwrap()
    }

    #[test]
    fn timestamps_round_trip_through_text() {
        let mut db = SqliteBackend::open_in_memory().unwrap();
        db.ensure_schema().unwrap();
        db.record_application(&record("1", at(3))).unwrap();
        let rows = db.list_history().unwrap();
        assert_eq!(rows[0].applied_at, at(3));
        assert_eq!(format_timestamp(&at(3)), "2024-11-03 12:30:00.000250");
    }

    #[test]
    fn ensure_schema_is_idempotent() {
        let mut db = SqliteBackend::open_in_memory().unwrap();
        db.ensure_schema().unwrap();
        db.ensure_schema().unwrap();
        assert_eq!(db.current_version().unwrap(), None);
        assert!(db.list_active().unwrap().is_empty());
    }

    #[test]
    fn upsert_keeps_a_single_row_per_version() {
        let mut db = SqliteBackend::open_in_memory().unwrap();
        db.ensure_schema().unwrap();
        db.record_application(&record("1", at(1))).unwrap();
        db.record_application(&record("1", at(2))).unwrap();

        let rows = db.list_history().unwrap();
        assert_eq!(rows.len(), 1);
        // Still active, so the original timestamp is kept.
        assert_eq!(rows[0].applied_at, at(1));
    }

    #[test]
    fn reapplying_a_reverted_version_reactivates_it() {
        let mut db = SqliteBackend::open_in_memory().unwrap();
        db.ensure_schema().unwrap();
        db.record_application(&record("1", at(1))).unwrap();
        db.record_application(&record("2", at(1))).unwrap();
        assert_eq!(
            db.mark_reverted(&RevertFilter::VersionAbove("1".into())).unwrap(),
            1
        );
        assert!(!db.is_active("2").unwrap());
        assert_eq!(db.current_version().unwrap().as_deref(), Some("1"));

        db.record_application(&record("2", at(5))).unwrap();
        let rows = db.list_history().unwrap();
        assert_eq!(rows.len(), 2);
        let two = rows.iter().find(|r| r.version == "2").unwrap();
        assert!(two.is_active());
        assert_eq!(two.applied_at, at(5));
    }

    #[test]
    fn mark_reverted_filters() {
        let mut db = SqliteBackend::open_in_memory().unwrap();
        db.ensure_schema().unwrap();
        for (v, d) in [("1", 1), ("2", 2), ("3", 3), ("4", 4)] {
            db.record_application(&record(v, at(d))).unwrap();
        }

        assert_eq!(
            db.mark_reverted(&RevertFilter::AppliedAfter(at(3))).unwrap(),
            1
        );
        assert_eq!(
            db.mark_reverted(&RevertFilter::Versions(vec!["1".into(), "4".into()]))
                .unwrap(),
            1
        );
        let active: Vec<_> = db
            .list_active()
            .unwrap()
            .into_iter()
            .map(|r| r.version)
            .collect();
        assert_eq!(active, vec!["2", "3"]);
    }

    #[test]
    fn recent_active_is_highest_first() {
        let mut db = SqliteBackend::open_in_memory().unwrap();
        db.ensure_schema().unwrap();
        for v in ["01", "02", "03"] {
            db.record_application(&record(v, at(1))).unwrap();
        }
        assert_eq!(db.recent_active(2).unwrap(), vec!["03", "02"]);
        assert_eq!(db.recent_active(10).unwrap().len(), 3);
    }

    #[test]
    fn lock_row_excludes_second_holder() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("lock.db");
        let mut a = SqliteBackend::open(&path).unwrap();
        let mut b = SqliteBackend::open(&path).unwrap();

        assert!(!a.is_locked().unwrap());
        assert!(a.try_acquire("deploy-a").unwrap());
        assert!(b.is_locked().unwrap());
        assert!(!b.try_acquire("deploy-b").unwrap());

        // Only the holder's release clears the row.
        b.release().unwrap();
        assert!(b.is_locked().unwrap());

        a.release().unwrap();
        assert!(!b.is_locked().unwrap());
        assert!(b.try_acquire("deploy-b").unwrap());
    }

    #[test]
    fn force_clear_releases_a_stale_row() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("stale.db");
        {
            let mut crashed = SqliteBackend::open(&path).unwrap();
            assert!(crashed.try_acquire("crashed").unwrap());
        }
        let mut db = SqliteBackend::open(&path).unwrap();
        assert!(db.is_locked().unwrap());
        db.force_clear().unwrap();
        assert!(!db.is_locked().unwrap());
        assert!(db.try_acquire("recovered").unwrap());
    }

    #[test]
    fn wipe_keeps_bookkeeping_tables() {
        let mut db = SqliteBackend::open_in_memory().unwrap();
        db.ensure_schema().unwrap();
        assert!(db.try_acquire("me").unwrap());
        db.execute_script(
            "CREATE TABLE users (id INTEGER PRIMARY KEY, name TEXT);
             CREATE TABLE posts (id INTEGER PRIMARY KEY, user_id INTEGER REFERENCES users(id));
             CREATE INDEX idx_posts_user ON posts(user_id);
             CREATE VIEW user_names AS SELECT name FROM users;
             CREATE TRIGGER users_ai AFTER INSERT ON users BEGIN SELECT 1; END;",
        )
        .unwrap();

        db.begin().unwrap();
        let dropped = db.wipe_schema().unwrap();
        db.commit().unwrap();
        assert_eq!(dropped, 4);

        let mut names: Vec<String> = db
            .connection()
            .prepare("SELECT name FROM sqlite_master WHERE type = 'table' ORDER BY name")
            .unwrap()
            .query_map([], |row| row.get(0))
            .unwrap()
            .collect::<Result<_, _>>()
            .unwrap();
        names.sort();
        assert_eq!(names, vec!["tidemark_history", "tidemark_lock"]);
    }

    #[test]
    fn custom_table_names() {
        let mut db = SqliteBackend::open_in_memory()
            .unwrap()
            .with_ledger_table_name("migration_history")
            .with_lock_table_name("migration_lock");
        db.ensure_schema().unwrap();
        assert!(db.try_acquire("me").unwrap());
        assert!(db.table_exists("migration_history").unwrap());
        assert!(db.table_exists("migration_lock").unwrap());
        assert_eq!(db.ledger_table_name(), "migration_history");
    }

    #[test]
    fn release_rolls_back_an_open_transaction() {
        let mut db = SqliteBackend::open_in_memory().unwrap();
        assert!(db.try_acquire("me").unwrap());
        db.begin().unwrap();
        db.execute_script("CREATE TABLE scratch (id INTEGER)").unwrap();
        db.release().unwrap();
        assert!(db.connection().is_autocommit());
        assert!(!db.table_exists("scratch").unwrap());
        assert!(!db.is_locked().unwrap());
    }
}
