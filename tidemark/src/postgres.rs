//! # PostgreSQL backend
//!
//! Uses the synchronous [`postgres`](https://crates.io/crates/postgres) client.
//! Mutual exclusion is a session-level advisory lock keyed by a fixed 64-bit id,
//! so a crashed process releases it as soon as its connection goes away. A lock
//! held by a session that is alive but wedged is cleared by terminating that
//! session once the [RetryPolicy](crate::RetryPolicy) timeout passes.
//!
//! PostgreSQL supports transactional DDL, so a failed run leaves both schema and
//! ledger exactly as they were.
//!
//! ## Example
//!
//! ```no_run
//! use tidemark::postgres::PostgresBackend;
//! use tidemark::Migrator;
//!
//! let mut db = PostgresBackend::connect("postgres://app@localhost/app")?;
//! Migrator::new("migrations").migrate(&mut db)?;
//! # Ok::<(), tidemark::Error>(())
//! ```

use crate::backend::Backend;
use crate::error::Error;
use crate::ledger::{
    Dialect, HistoryRecord, Ledger, NewRecord, RevertFilter, Statement, StatementTable,
    DEFAULT_LEDGER_TABLE_NAME,
};
use crate::lock::LockPrimitive;
use postgres::{Client, NoTls, Row};

pub const DEFAULT_ADVISORY_LOCK_ID: i64 = 7_362_411;

// Matches the pg_locks row of a single-key (bigint) advisory lock in this database.
const ADVISORY_LOCK_MATCH: &str = "locktype = 'advisory' AND objsubid = 1 \
     AND ((classid::bigint << 32) | objid::bigint) = $1 \
     AND database = (SELECT oid FROM pg_database WHERE datname = current_database())";

/// A caller-owned PostgreSQL session the migrator can drive.
pub struct PostgresBackend {
    client: Client,
    statements: StatementTable,
    lock_id: i64,
    holds_lock: bool,
    in_transaction: bool,
}

impl std::fmt::Debug for PostgresBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PostgresBackend")
            .field("ledger_table", &self.statements.table())
            .field("lock_id", &self.lock_id)
            .field("holds_lock", &self.holds_lock)
            .field("in_transaction", &self.in_transaction)
            .finish()
    }
}

impl PostgresBackend {
    pub fn new(client: Client) -> Self {
        Self {
            client,
            statements: StatementTable::new(Dialect::Postgres, DEFAULT_LEDGER_TABLE_NAME),
            lock_id: DEFAULT_ADVISORY_LOCK_ID,
            holds_lock: false,
            in_transaction: false,
        }
    }

    /// Connect without TLS.
    pub fn connect(url: &str) -> Result<Self, Error> {
        Ok(Self::new(Client::connect(url, NoTls)?))
    }

    /// Set a custom name for the ledger table. Defaults to "tidemark_history".
    pub fn with_ledger_table_name(mut self, name: impl Into<String>) -> Self {
        self.statements = StatementTable::new(Dialect::Postgres, name);
        self
    }

    /// Use a different advisory lock key. Every process migrating the same
    /// database must agree on it.
    pub fn with_advisory_lock_id(mut self, lock_id: i64) -> Self {
        self.lock_id = lock_id;
        self
    }

    pub fn ledger_table_name(&self) -> &str {
        self.statements.table()
    }

    pub fn advisory_lock_id(&self) -> i64 {
        self.lock_id
    }

    pub fn client(&mut self) -> &mut Client {
        &mut self.client
    }

    pub fn into_inner(self) -> Client {
        self.client
    }

    fn query_records(&mut self, statement: Statement) -> Result<Vec<HistoryRecord>, Error> {
        let rows = self.client.query(self.statements.sql(statement), &[])?;
        rows.iter().map(read_record).collect()
    }

    /// Unquoted identifiers are folded to lower case by the server.
    fn ledger_relname(&self) -> String {
        self.statements.table().to_lowercase()
    }
}

fn read_record(row: &Row) -> Result<HistoryRecord, Error> {
    Ok(HistoryRecord {
        version: row.try_get(0)?,
        description: row.try_get(1)?,
        script_name: row.try_get(2)?,
        checksum: row.try_get(3)?,
        execution_time_ms: row.try_get(4)?,
        success: row.try_get(5)?,
        reverted: row.try_get(6)?,
        applied_at: row.try_get(7)?,
    })
}

fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

impl LockPrimitive for PostgresBackend {
    fn try_acquire(&mut self, owner: &str) -> Result<bool, Error> {
        // Advisory locks are re-entrant per session; don't stack a second hold.
        if self.holds_lock {
            return Ok(true);
        }
        let acquired: bool = self
            .client
            .query_one("SELECT pg_try_advisory_lock($1)", &[&self.lock_id])?
            .try_get(0)?;
        if acquired {
            tracing::debug!(owner, lock_id = self.lock_id, "Advisory lock taken");
            self.holds_lock = true;
        }
        Ok(acquired)
    }

    fn release(&mut self) -> Result<(), Error> {
        if self.in_transaction {
            self.client.batch_execute("ROLLBACK")?;
            self.in_transaction = false;
        }
        if !self.holds_lock {
            return Ok(());
        }
        self.holds_lock = false;
        let released: bool = self
            .client
            .query_one("SELECT pg_advisory_unlock($1)", &[&self.lock_id])?
            .try_get(0)?;
        if !released {
            tracing::warn!(lock_id = self.lock_id, "Advisory lock was not held by this session");
        }
        Ok(())
    }

    fn force_clear(&mut self) -> Result<(), Error> {
        let terminated = self.client.query(
            &format!(
                "SELECT pid, pg_terminate_backend(pid) FROM pg_locks \
                 WHERE {ADVISORY_LOCK_MATCH} AND granted AND pid <> pg_backend_pid()"
            ),
            &[&self.lock_id],
        )?;
        let pids: Vec<i32> = terminated
            .iter()
            .map(|row| row.try_get(0))
            .collect::<Result<_, _>>()?;
        tracing::warn!(
            lock_id = self.lock_id,
            terminated = ?pids,
            "Forcibly clearing advisory lock by terminating its holders"
        );
        self.client.batch_execute("SELECT pg_advisory_unlock_all()")?;
        self.holds_lock = false;
        Ok(())
    }

    fn is_locked(&mut self) -> Result<bool, Error> {
        let locked: bool = self
            .client
            .query_one(
                &format!(
                    "SELECT EXISTS (SELECT 1 FROM pg_locks WHERE {ADVISORY_LOCK_MATCH} AND granted)"
                ),
                &[&self.lock_id],
            )?
            .try_get(0)?;
        Ok(locked)
    }
}

impl Ledger for PostgresBackend {
    fn ensure_schema(&mut self) -> Result<(), Error> {
        self.client
            .batch_execute(self.statements.sql(Statement::CreateLedger))?;
        tracing::debug!(table = %self.statements.table(), "Ledger table verified");
        Ok(())
    }

    fn is_active(&mut self, version: &str) -> Result<bool, Error> {
        let row = self
            .client
            .query_one(self.statements.sql(Statement::IsActive), &[&version])?;
        Ok(row.try_get(0)?)
    }

    fn current_version(&mut self) -> Result<Option<String>, Error> {
        let row = self
            .client
            .query_one(self.statements.sql(Statement::CurrentVersion), &[])?;
        Ok(row.try_get(0)?)
    }

    fn list_active(&mut self) -> Result<Vec<HistoryRecord>, Error> {
        self.query_records(Statement::SelectActive)
    }

    fn list_history(&mut self) -> Result<Vec<HistoryRecord>, Error> {
        self.query_records(Statement::SelectHistory)
    }

    fn record_application(&mut self, record: &NewRecord<'_>) -> Result<(), Error> {
        self.client.execute(
            self.statements.sql(Statement::UpsertRecord),
            &[
                &record.version,
                &record.description,
                &record.script_name,
                &record.checksum,
                &record.execution_time_ms,
                &record.success,
                &record.applied_at,
            ],
        )?;
        Ok(())
    }

    fn mark_reverted(&mut self, filter: &RevertFilter) -> Result<u64, Error> {
        let changed = match filter {
            RevertFilter::VersionAbove(version) => self.client.execute(
                self.statements.sql(Statement::MarkRevertedAboveVersion),
                &[version],
            )?,
            RevertFilter::AppliedAfter(at) => self.client.execute(
                self.statements.sql(Statement::MarkRevertedAfterDate),
                &[at],
            )?,
            RevertFilter::Versions(versions) => {
                let stmt = self
                    .client
                    .prepare(self.statements.sql(Statement::MarkRevertedVersion))?;
                let mut changed = 0;
                for version in versions {
                    changed += self.client.execute(&stmt, &[version])?;
                }
                changed
            }
        };
        Ok(changed)
    }

    fn recent_active(&mut self, n: u32) -> Result<Vec<String>, Error> {
        let rows = self.client.query(
            self.statements.sql(Statement::SelectRecentActive),
            &[&i64::from(n)],
        )?;
        rows.iter()
            .map(|row| row.try_get(0).map_err(Error::from))
            .collect()
    }
}

impl Backend for PostgresBackend {
    fn begin(&mut self) -> Result<(), Error> {
        self.client.batch_execute("BEGIN")?;
        self.in_transaction = true;
        Ok(())
    }

    fn commit(&mut self) -> Result<(), Error> {
        self.client.batch_execute("COMMIT")?;
        self.in_transaction = false;
        Ok(())
    }

    fn rollback(&mut self) -> Result<(), Error> {
        if self.in_transaction {
            self.in_transaction = false;
            self.client.batch_execute("ROLLBACK")?;
        }
        Ok(())
    }

    fn execute_script(&mut self, sql: &str) -> Result<(), Error> {
        self.client.batch_execute(sql)?;
        Ok(())
    }

    /// Drops every relation, routine and user-defined type in `current_schema()`
    /// except the ledger table. Objects owned by extensions are left alone.
    fn wipe_schema(&mut self) -> Result<usize, Error> {
        let ledger = self.ledger_relname();
        let mut drops: Vec<String> = Vec::new();

        let relations = self.client.query(
            "SELECT c.relname, c.relkind::text FROM pg_class c
             JOIN pg_namespace n ON n.oid = c.relnamespace
             WHERE n.nspname = current_schema()
               AND c.relkind IN ('r', 'p', 'v', 'm', 'S', 'f')
               AND c.relname <> $1
               AND NOT EXISTS (
                   SELECT 1 FROM pg_depend d
                   WHERE d.objid = c.oid AND d.deptype IN ('e', 'a', 'i')
               )
             ORDER BY c.relkind DESC, c.relname",
            &[&ledger],
        )?;
        for row in &relations {
            let name: String = row.try_get(0)?;
            let kind: String = row.try_get(1)?;
            let keyword = match kind.as_str() {
                "v" => "VIEW",
                "m" => "MATERIALIZED VIEW",
                "S" => "SEQUENCE",
                "f" => "FOREIGN TABLE",
                _ => "TABLE",
            };
            drops.push(format!("DROP {keyword} IF EXISTS {} CASCADE", quote_ident(&name)));
        }

        let routines = self.client.query(
            "SELECT p.oid::regprocedure::text FROM pg_proc p
             JOIN pg_namespace n ON n.oid = p.pronamespace
             WHERE n.nspname = current_schema()
               AND p.prokind IN ('f', 'p')
               AND NOT EXISTS (
                   SELECT 1 FROM pg_depend d WHERE d.objid = p.oid AND d.deptype = 'e'
               )",
            &[],
        )?;
        for row in &routines {
            let signature: String = row.try_get(0)?;
            drops.push(format!("DROP ROUTINE IF EXISTS {signature} CASCADE"));
        }

        let types = self.client.query(
            "SELECT t.typname, t.typtype::text FROM pg_type t
             JOIN pg_namespace n ON n.oid = t.typnamespace
             WHERE n.nspname = current_schema()
               AND t.typtype IN ('e', 'd')
               AND NOT EXISTS (
                   SELECT 1 FROM pg_depend d WHERE d.objid = t.oid AND d.deptype = 'e'
               )",
            &[],
        )?;
        for row in &types {
            let name: String = row.try_get(0)?;
            let kind: String = row.try_get(1)?;
            let keyword = if kind == "d" { "DOMAIN" } else { "TYPE" };
            drops.push(format!("DROP {keyword} IF EXISTS {} CASCADE", quote_ident(&name)));
        }

        for statement in &drops {
            tracing::debug!(statement = %statement, "Dropping schema object");
            self.client.batch_execute(statement)?;
        }
        tracing::info!(dropped = drops.len(), "Wiped schema objects outside the ledger");
        Ok(drops.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_postgres::{fresh_postgres_db, url_with_db};
    use crate::{Migrator, RetryPolicy, RollbackOutcome};
    use std::fs;
    use std::path::Path;
    use std::time::Duration;

    fn write_scripts(dir: &Path) {
        fs::write(
            dir.join("V1__create_users.sql"),
            "CREATE TABLE users (id SERIAL PRIMARY KEY, name TEXT NOT NULL);",
        )
        .unwrap();
        fs::write(
            dir.join("V2__add_email.sql"),
            "ALTER TABLE users ADD COLUMN email TEXT;
             CREATE TYPE mood AS ENUM ('happy', 'sad');",
        )
        .unwrap();
        fs::write(
            dir.join("V3__create_view.sql"),
            "CREATE VIEW user_emails AS SELECT email FROM users;
             CREATE FUNCTION one() RETURNS integer AS 'SELECT 1' LANGUAGE SQL;",
        )
        .unwrap();
    }

    fn column_exists(db: &mut PostgresBackend, table: &str, column: &str) -> bool {
        db.client()
            .query_one(
                "SELECT EXISTS (SELECT 1 FROM information_schema.columns
                 WHERE table_name = $1 AND column_name = $2)",
                &[&table, &column],
            )
            .unwrap()
            .get(0)
    }

    #[test]
    fn migrate_and_skip_on_rerun() {
        let dir = tempfile::tempdir().unwrap();
        write_scripts(dir.path());
        let (url, _) = fresh_postgres_db();
        let mut db = PostgresBackend::connect(&url).unwrap();
        let migrator = Migrator::new(dir.path());

        let first = migrator.migrate(&mut db).unwrap();
        assert_eq!(first.applied, vec!["1", "2", "3"]);
        let second = migrator.migrate(&mut db).unwrap();
        assert!(second.applied.is_empty());
        assert_eq!(second.skipped, vec!["1", "2", "3"]);

        let info = migrator.info(&mut db).unwrap();
        assert_eq!(info.current_version.as_deref(), Some("3"));
        assert_eq!(info.active.len(), 3);
        assert!(!db.is_locked().unwrap());
    }

    #[test]
    fn rollback_to_tag_rebuilds_schema() {
        let dir = tempfile::tempdir().unwrap();
        write_scripts(dir.path());
        let (url, _) = fresh_postgres_db();
        let mut db = PostgresBackend::connect(&url).unwrap();
        let migrator = Migrator::new(dir.path());
        migrator.migrate(&mut db).unwrap();

        let report = migrator.rollback_to_tag(&mut db, "1").unwrap();
        assert_eq!(report.outcome, RollbackOutcome::RolledBack);
        assert_eq!(report.replayed, vec!["1"]);
        assert_eq!(report.reverted, 2);
        assert!(column_exists(&mut db, "users", "name"));
        assert!(!column_exists(&mut db, "users", "email"));

        let history = migrator.history(&mut db).unwrap();
        let reverted: Vec<_> = history
            .iter()
            .filter(|r| r.reverted)
            .map(|r| r.version.as_str())
            .collect();
        assert_eq!(reverted, vec!["2", "3"]);

        // Round trip back to head.
        let again = migrator.migrate(&mut db).unwrap();
        assert_eq!(again.applied, vec!["2", "3"]);
        assert!(column_exists(&mut db, "users", "email"));
    }

    #[test]
    fn rollback_count_and_dates() {
        let dir = tempfile::tempdir().unwrap();
        write_scripts(dir.path());
        let (url, _) = fresh_postgres_db();
        let mut db = PostgresBackend::connect(&url).unwrap();
        let migrator = Migrator::new(dir.path());
        migrator.migrate(&mut db).unwrap();

        let future = migrator.rollback_to_date(&mut db, "2100-01-01").unwrap();
        assert_eq!(future.reverted, 0);
        assert_eq!(future.replayed, vec!["1", "2", "3"]);

        let count = migrator.rollback_count(&mut db, 1).unwrap();
        assert_eq!(count.reverted, 1);
        assert_eq!(migrator.info(&mut db).unwrap().active.len(), 2);

        let past = migrator.rollback_to_date(&mut db, "2000-01-01 00:00:00").unwrap();
        assert_eq!(past.reverted, 2);
        assert!(migrator.info(&mut db).unwrap().active.is_empty());
    }

    #[test]
    fn failed_script_rolls_back_everything() {
        let dir = tempfile::tempdir().unwrap();
        write_scripts(dir.path());
        fs::write(dir.path().join("V4__broken.sql"), "CREATE TABLE oops (;").unwrap();
        let (url, _) = fresh_postgres_db();
        let mut db = PostgresBackend::connect(&url).unwrap();
        let migrator = Migrator::new(dir.path());

        let err = migrator.migrate(&mut db).unwrap_err();
        assert!(matches!(err, Error::ScriptExecution { ref version, .. } if version == "4"));
        assert!(!db.is_locked().unwrap());

        let info = migrator.info(&mut db).unwrap();
        assert!(info.active.is_empty());
        assert!(!column_exists(&mut db, "users", "name"));
    }

    #[test]
    fn advisory_lock_excludes_other_sessions() {
        let (url, db_name) = fresh_postgres_db();
        let mut holder = PostgresBackend::connect(&url).unwrap();
        let mut other = PostgresBackend::connect(&url_with_db(&db_name)).unwrap();

        assert!(holder.try_acquire("holder").unwrap());
        assert!(other.is_locked().unwrap());
        assert!(!other.try_acquire("other").unwrap());

        let dir = tempfile::tempdir().unwrap();
        write_scripts(dir.path());
        let err = Migrator::new(dir.path())
            .with_retry_policy(RetryPolicy::fail_fast())
            .migrate(&mut other)
            .unwrap_err();
        assert!(matches!(err, Error::LockContention(_)));

        holder.release().unwrap();
        assert!(!other.is_locked().unwrap());
        assert!(other.try_acquire("other").unwrap());
    }

    #[test]
    fn stale_holder_is_terminated_after_timeout() {
        let (url, _) = fresh_postgres_db();
        let mut wedged = PostgresBackend::connect(&url).unwrap();
        assert!(wedged.try_acquire("wedged").unwrap());

        let dir = tempfile::tempdir().unwrap();
        write_scripts(dir.path());
        let mut db = PostgresBackend::connect(&url).unwrap();
        let report = Migrator::new(dir.path())
            .with_retry_policy(RetryPolicy::bounded(
                Duration::from_millis(200),
                Duration::from_millis(50),
            ))
            .migrate(&mut db)
            .unwrap();
        assert_eq!(report.applied.len(), 3);
        // The wedged session was killed.
        assert!(wedged.is_locked().is_err());
    }

    #[test]
    fn custom_ledger_table_and_lock_id() {
        let dir = tempfile::tempdir().unwrap();
        write_scripts(dir.path());
        let (url, _) = fresh_postgres_db();
        let mut db = PostgresBackend::connect(&url)
            .unwrap()
            .with_ledger_table_name("schema_history")
            .with_advisory_lock_id(42);
        Migrator::new(dir.path()).migrate(&mut db).unwrap();

        let count: i64 = db
            .client()
            .query_one("SELECT COUNT(*) FROM schema_history", &[])
            .unwrap()
            .get(0);
        assert_eq!(count, 3);
        assert_eq!(db.advisory_lock_id(), 42);
    }
}
