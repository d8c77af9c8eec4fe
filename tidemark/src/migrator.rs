//! The migration orchestrator.
//!
//! Every operation runs the same skeleton: acquire the lock, open one transaction,
//! do the work, commit (or roll back on error), then release the lock. Rollbacks
//! don't run inverse scripts. They drop every schema object outside the ledger and
//! replay the scripts that should remain, then flag the rest as reverted.

use crate::backend::Backend;
use crate::error::Error;
use crate::executor;
use crate::ledger::{HistoryRecord, RevertFilter};
use crate::lock::{Clock, InterruptFlag, LockGuard, LockOutcome, RetryPolicy, SystemClock};
use crate::script::{MigrationScript, ScriptRepository};
use chrono::{NaiveDate, NaiveDateTime, NaiveTime};
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::time::Duration;

/// Where an operation is in its lifecycle. Emitted at trace level.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Idle,
    Locked,
    HistoryEnsured,
    Applying,
    Committed,
    Unlocked,
    Aborted,
}

/// Result of [Migrator::migrate].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MigrationReport {
    /// Versions applied by this run, in order.
    pub applied: Vec<String>,
    /// Versions that were already active.
    pub skipped: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RollbackOutcome {
    RolledBack,
    /// Nothing matched; schema and ledger were left alone.
    NoOp,
}

/// Result of the rollback operations.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RollbackReport {
    pub outcome: RollbackOutcome,
    /// Versions re-applied after the wipe, in order.
    pub replayed: Vec<String>,
    /// Ledger rows newly flagged as reverted.
    pub reverted: u64,
    /// Schema objects dropped by the wipe.
    pub dropped_objects: usize,
}

impl RollbackReport {
    fn no_op() -> Self {
        Self {
            outcome: RollbackOutcome::NoOp,
            replayed: Vec::new(),
            reverted: 0,
            dropped_objects: 0,
        }
    }
}

/// Snapshot returned by [Migrator::info].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LedgerInfo {
    pub current_version: Option<String>,
    pub active: Vec<HistoryRecord>,
}

type StartHook = Box<dyn Fn(&str, &str) + Send + Sync>;
type CompleteHook = Box<dyn Fn(&str, &str, Duration) + Send + Sync>;
type ErrorHook = Box<dyn Fn(&str, &str, &Error) + Send + Sync>;

/// Applies and rolls back the scripts in one directory against a caller-owned [Backend].
pub struct Migrator {
    repository: ScriptRepository,
    retry_policy: Option<RetryPolicy>,
    owner: String,
    clock: Box<dyn Clock + Send + Sync>,
    interrupt: InterruptFlag,
    on_migration_start: Option<StartHook>,
    on_migration_complete: Option<CompleteHook>,
    on_migration_skipped: Option<StartHook>,
    on_migration_error: Option<ErrorHook>,
}

// Manual Debug impl since hooks can't be printed
impl std::fmt::Debug for Migrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Migrator")
            .field("repository", &self.repository)
            .field("retry_policy", &self.retry_policy)
            .field("owner", &self.owner)
            .field("on_migration_start", &self.on_migration_start.is_some())
            .field(
                "on_migration_complete",
                &self.on_migration_complete.is_some(),
            )
            .field("on_migration_skipped", &self.on_migration_skipped.is_some())
            .field("on_migration_error", &self.on_migration_error.is_some())
            .finish()
    }
}

impl Migrator {
    /// Create a migrator for the scripts in `location`.
    /// The directory isn't read until an operation runs.
    pub fn new(location: impl Into<PathBuf>) -> Self {
        Self {
            repository: ScriptRepository::new(location),
            retry_policy: None,
            owner: default_owner(),
            clock: Box::new(SystemClock),
            interrupt: Arc::new(AtomicBool::new(false)),
            on_migration_start: None,
            on_migration_complete: None,
            on_migration_skipped: None,
            on_migration_error: None,
        }
    }

    /// Override the backend's default lock retry policy.
    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry_policy = Some(policy);
        self
    }

    /// Name recorded as the lock holder. Defaults to `tidemark-<pid>`.
    pub fn with_owner(mut self, owner: impl Into<String>) -> Self {
        self.owner = owner.into();
        self
    }

    pub fn with_clock(mut self, clock: impl Clock + Send + Sync + 'static) -> Self {
        self.clock = Box::new(clock);
        self
    }

    /// Share an interrupt flag, e.g. one set from a signal handler.
    pub fn with_interrupt_flag(mut self, flag: InterruptFlag) -> Self {
        self.interrupt = flag;
        self
    }

    /// Raising this flag aborts a pending lock wait with [Error::LockInterrupted].
    pub fn interrupt_flag(&self) -> InterruptFlag {
        Arc::clone(&self.interrupt)
    }

    /// Called with the version and script name before a script runs.
    pub fn on_migration_start<F>(mut self, callback: F) -> Self
    where
        F: Fn(&str, &str) + Send + Sync + 'static,
    {
        self.on_migration_start = Some(Box::new(callback));
        self
    }

    /// Called with the version, script name and duration after a script is applied and recorded.
    pub fn on_migration_complete<F>(mut self, callback: F) -> Self
    where
        F: Fn(&str, &str, Duration) + Send + Sync + 'static,
    {
        self.on_migration_complete = Some(Box::new(callback));
        self
    }

    /// Called for scripts `migrate` skips because they are already active.
    pub fn on_migration_skipped<F>(mut self, callback: F) -> Self
    where
        F: Fn(&str, &str) + Send + Sync + 'static,
    {
        self.on_migration_skipped = Some(Box::new(callback));
        self
    }

    pub fn on_migration_error<F>(mut self, callback: F) -> Self
    where
        F: Fn(&str, &str, &Error) + Send + Sync + 'static,
    {
        self.on_migration_error = Some(Box::new(callback));
        self
    }

    pub fn repository(&self) -> &ScriptRepository {
        &self.repository
    }

    /// Apply every script that has no active ledger record, in version order.
    ///
    /// All scripts run in one transaction. If any fails, nothing from this run is kept.
    pub fn migrate<B>(&self, db: &mut B) -> Result<MigrationReport, Error>
    where
        B: Backend + ?Sized,
    {
        let scripts = self.repository.list()?;
        self.run_locked(db, "migrate", |db, phase| {
            db.ensure_schema()?;
            advance(phase, Phase::HistoryEnsured);

            let recorded: HashMap<String, HistoryRecord> = db
                .list_active()?
                .into_iter()
                .map(|record| (record.version.clone(), record))
                .collect();

            let mut report = MigrationReport {
                applied: Vec::new(),
                skipped: Vec::new(),
            };
            for script in &scripts {
                if db.is_active(&script.version)? {
                    if let Some(record) = recorded.get(&script.version) {
                        if record.checksum != script.checksum {
                            tracing::warn!(
                                version = %script.version,
                                script = %script.script_name,
                                "Applied migration script has changed since it was recorded"
                            );
                        }
                    }
                    tracing::debug!(
                        version = %script.version,
                        "Skipping migration (already applied)"
                    );
                    if let Some(ref callback) = self.on_migration_skipped {
                        callback(&script.version, &script.script_name);
                    }
                    report.skipped.push(script.version.clone());
                    continue;
                }
                advance(phase, Phase::Applying);
                self.apply_one(db, script)?;
                report.applied.push(script.version.clone());
            }

            if report.applied.is_empty() {
                tracing::info!("Database is up to date");
            } else {
                tracing::info!(applied = report.applied.len(), "Migrations applied");
            }
            Ok(report)
        })
    }

    /// Rebuild the schema as of version `tag`.
    ///
    /// Drops every object outside the ledger, replays scripts with version `<= tag`
    /// and marks active rows above `tag` as reverted. `tag` must be a run of ASCII
    /// digits and is compared as a string, so it needs the same zero-padding as the
    /// script versions.
    pub fn rollback_to_tag<B>(&self, db: &mut B, tag: &str) -> Result<RollbackReport, Error>
    where
        B: Backend + ?Sized,
    {
        validate_tag(tag)?;
        let scripts = self.repository.list()?;
        self.run_locked(db, "rollback_to_tag", |db, phase| {
            db.ensure_schema()?;
            let keep: Vec<String> = db
                .list_active()?
                .into_iter()
                .map(|record| record.version)
                .filter(|version| version.as_str() <= tag)
                .collect();
            require_scripts(&scripts, &keep)?;

            let dropped_objects = db.wipe_schema()?;
            advance(phase, Phase::HistoryEnsured);

            let replayed =
                self.replay(db, &scripts, |script| script.version.as_str() <= tag, phase)?;
            let reverted = db.mark_reverted(&RevertFilter::VersionAbove(tag.to_string()))?;
            tracing::info!(tag, reverted, "Rolled back to tag");
            Ok(RollbackReport {
                outcome: RollbackOutcome::RolledBack,
                replayed,
                reverted,
                dropped_objects,
            })
        })
    }

    /// Rebuild the schema as of `date`, given as `yyyy-MM-dd` or `yyyy-MM-dd HH:mm:ss` in UTC.
    ///
    /// A malformed date fails with [Error::InvalidArgument] before the database is touched.
    pub fn rollback_to_date<B>(&self, db: &mut B, date: &str) -> Result<RollbackReport, Error>
    where
        B: Backend + ?Sized,
    {
        let target = parse_rollback_date(date)?;
        self.rollback_to_datetime(db, target)
    }

    /// Replays versions applied at or before `target` and marks later ones reverted.
    pub fn rollback_to_datetime<B>(
        &self,
        db: &mut B,
        target: NaiveDateTime,
    ) -> Result<RollbackReport, Error>
    where
        B: Backend + ?Sized,
    {
        let scripts = self.repository.list()?;
        self.run_locked(db, "rollback_to_date", |db, phase| {
            db.ensure_schema()?;
            let keep: HashSet<String> = db
                .list_active()?
                .into_iter()
                .filter(|record| record.applied_at <= target)
                .map(|record| record.version)
                .collect();
            require_scripts(&scripts, &keep)?;

            let dropped_objects = db.wipe_schema()?;
            advance(phase, Phase::HistoryEnsured);

            let replayed = self.replay(db, &scripts, |s| keep.contains(&s.version), phase)?;
            let reverted = db.mark_reverted(&RevertFilter::AppliedAfter(target))?;
            tracing::info!(rollback_to = %target, reverted, "Rolled back to date");
            Ok(RollbackReport {
                outcome: RollbackOutcome::RolledBack,
                replayed,
                reverted,
                dropped_objects,
            })
        })
    }

    /// Roll back the `n` highest active versions.
    ///
    /// With no active versions this is a no-op and the schema is left alone.
    pub fn rollback_count<B>(&self, db: &mut B, n: u32) -> Result<RollbackReport, Error>
    where
        B: Backend + ?Sized,
    {
        if n == 0 {
            return Err(Error::InvalidArgument(
                "rollback count must be at least 1".to_string(),
            ));
        }
        let scripts = self.repository.list()?;
        self.run_locked(db, "rollback_count", |db, phase| {
            db.ensure_schema()?;
            advance(phase, Phase::HistoryEnsured);

            let selected = db.recent_active(n)?;
            if selected.is_empty() {
                tracing::info!("No active migrations to roll back");
                return Ok(RollbackReport::no_op());
            }
            let keep: HashSet<String> = db
                .list_active()?
                .into_iter()
                .map(|record| record.version)
                .filter(|version| !selected.contains(version))
                .collect();
            require_scripts(&scripts, &keep)?;

            let dropped_objects = db.wipe_schema()?;
            let replayed = self.replay(db, &scripts, |s| keep.contains(&s.version), phase)?;
            let reverted = db.mark_reverted(&RevertFilter::Versions(selected))?;
            tracing::info!(requested = n, reverted, "Rolled back most recent migrations");
            Ok(RollbackReport {
                outcome: RollbackOutcome::RolledBack,
                replayed,
                reverted,
                dropped_objects,
            })
        })
    }

    /// Current version and active records, read under the lock.
    pub fn info<B>(&self, db: &mut B) -> Result<LedgerInfo, Error>
    where
        B: Backend + ?Sized,
    {
        self.run_locked(db, "info", |db, phase| {
            db.ensure_schema()?;
            advance(phase, Phase::HistoryEnsured);
            Ok(LedgerInfo {
                current_version: db.current_version()?,
                active: db.list_active()?,
            })
        })
    }

    /// Every ledger row, reverted ones included.
    pub fn history<B>(&self, db: &mut B) -> Result<Vec<HistoryRecord>, Error>
    where
        B: Backend + ?Sized,
    {
        self.run_locked(db, "history", |db, phase| {
            db.ensure_schema()?;
            advance(phase, Phase::HistoryEnsured);
            db.list_history()
        })
    }

    /// Whether any process holds the migration lock. Does not wait.
    pub fn is_locked<B>(&self, db: &mut B) -> Result<bool, Error>
    where
        B: Backend + ?Sized,
    {
        db.is_locked()
    }

    /// Clear the migration lock regardless of holder.
    pub fn force_unlock<B>(&self, db: &mut B) -> Result<(), Error>
    where
        B: Backend + ?Sized,
    {
        tracing::warn!(owner = %self.owner, "Force-unlocking migrations");
        db.force_clear()
    }

    fn run_locked<B, T, F>(&self, db: &mut B, operation: &'static str, body: F) -> Result<T, Error>
    where
        B: Backend + ?Sized,
        F: FnOnce(&mut B, &mut Phase) -> Result<T, Error>,
    {
        let _span = tracing::info_span!("tidemark", operation, owner = %self.owner).entered();
        let mut phase = Phase::Idle;
        tracing::trace!(?phase);

        let policy = self
            .retry_policy
            .unwrap_or_else(|| db.default_retry_policy());
        let mut guard = LockGuard::acquire(
            db,
            &policy,
            &self.owner,
            self.clock.as_ref(),
            &self.interrupt,
        )?;
        if let LockOutcome::TimedOutAndRecovered { recoveries } = guard.outcome() {
            tracing::warn!(recoveries, "Proceeding after clearing a stale migration lock");
        }
        advance(&mut phase, Phase::Locked);

        match in_transaction(&mut *guard, |db| body(db, &mut phase)) {
            Ok(value) => {
                advance(&mut phase, Phase::Committed);
                guard.release()?;
                advance(&mut phase, Phase::Unlocked);
                Ok(value)
            }
            Err(error) => {
                tracing::error!(error = %error, ?phase, "Migration operation failed, rolled back");
                advance(&mut phase, Phase::Aborted);
                if let Err(release_error) = guard.release() {
                    tracing::error!(error = %release_error, "Failed to release migration lock");
                }
                Err(error)
            }
        }
    }

    fn replay<B, F>(
        &self,
        db: &mut B,
        scripts: &[MigrationScript],
        keep: F,
        phase: &mut Phase,
    ) -> Result<Vec<String>, Error>
    where
        B: Backend + ?Sized,
        F: Fn(&MigrationScript) -> bool,
    {
        let mut replayed = Vec::new();
        for script in scripts.iter().filter(|script| keep(script)) {
            advance(phase, Phase::Applying);
            self.apply_one(db, script)?;
            replayed.push(script.version.clone());
        }
        Ok(replayed)
    }

    fn apply_one<B>(&self, db: &mut B, script: &MigrationScript) -> Result<(), Error>
    where
        B: Backend + ?Sized,
    {
        let _span = tracing::info_span!(
            "migration_up",
            version = %script.version,
            script = %script.script_name
        )
        .entered();
        tracing::info!("Starting migration");

        if let Some(ref callback) = self.on_migration_start {
            callback(&script.version, &script.script_name);
        }

        match executor::apply(db, script, self.clock.as_ref()) {
            Ok(duration) => {
                tracing::info!(
                    duration_ms = duration.as_millis() as u64,
                    "Migration completed successfully"
                );
                if let Some(ref callback) = self.on_migration_complete {
                    callback(&script.version, &script.script_name, duration);
                }
                Ok(())
            }
            Err(error) => {
                tracing::error!(error = %error, "Migration failed");
                if let Some(ref callback) = self.on_migration_error {
                    callback(&script.version, &script.script_name, &error);
                }
                Err(error)
            }
        }
    }
}

fn advance(phase: &mut Phase, next: Phase) {
    if *phase != next {
        tracing::trace!(from = ?*phase, to = ?next, "phase");
        *phase = next;
    }
}

fn in_transaction<B, T, F>(db: &mut B, body: F) -> Result<T, Error>
where
    B: Backend + ?Sized,
    F: FnOnce(&mut B) -> Result<T, Error>,
{
    db.begin()?;
    let result = body(db).and_then(|value| db.commit().map(|()| value));
    if result.is_err() {
        if let Err(rollback_error) = db.rollback() {
            tracing::error!(error = %rollback_error, "Failed to roll back transaction");
        }
    }
    result
}

/// Fails unless every version in `keep` has a script to replay.
fn require_scripts<'a, I>(scripts: &[MigrationScript], keep: I) -> Result<(), Error>
where
    I: IntoIterator<Item = &'a String>,
{
    let mut missing: Vec<&str> = keep
        .into_iter()
        .filter(|version| !scripts.iter().any(|script| &script.version == *version))
        .map(String::as_str)
        .collect();
    if missing.is_empty() {
        return Ok(());
    }
    missing.sort_unstable();
    tracing::error!(?missing, "Active versions have no script on disk");
    Err(Error::Configuration(format!(
        "cannot roll back: no script on disk for active version(s) {}",
        missing.join(", ")
    )))
}

fn default_owner() -> String {
    format!("tidemark-{}", std::process::id())
}

fn validate_tag(tag: &str) -> Result<(), Error> {
    if tag.is_empty() || !tag.bytes().all(|b| b.is_ascii_digit()) {
        return Err(Error::InvalidArgument(format!(
            "rollback tag must be a version number, got '{tag}'"
        )));
    }
    Ok(())
}

/// Parse `yyyy-MM-dd HH:mm:ss` or `yyyy-MM-dd` (midnight).
pub fn parse_rollback_date(input: &str) -> Result<NaiveDateTime, Error> {
    let input = input.trim();
    if let Ok(at) = NaiveDateTime::parse_from_str(input, "%Y-%m-%d %H:%M:%S") {
        return Ok(at);
    }
    NaiveDate::parse_from_str(input, "%Y-%m-%d")
        .map(|date| date.and_time(NaiveTime::MIN))
        .map_err(|_| {
            Error::InvalidArgument(format!(
                "expected a date as yyyy-MM-dd or yyyy-MM-dd HH:mm:ss, got '{input}'"
            ))
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_both_date_forms() {
        let midnight = parse_rollback_date("2024-11-20").unwrap();
        assert_eq!(midnight.to_string(), "2024-11-20 00:00:00");
        let exact = parse_rollback_date(" 2024-11-20 13:45:07 ").unwrap();
        assert_eq!(exact.to_string(), "2024-11-20 13:45:07");
    }

    #[test]
    fn rejects_malformed_dates() {
        for input in ["not-a-date", "2024-13-01", "20/11/2024", "2024-11-20T10:00:00", ""] {
            assert!(
                matches!(parse_rollback_date(input), Err(Error::InvalidArgument(_))),
                "{input}"
            );
        }
    }

    #[test]
    fn tags_must_be_numeric() {
        assert!(validate_tag("1").is_ok());
        assert!(validate_tag("0003").is_ok());
        for tag in ["", "v1", "1.0", " 1"] {
            assert!(matches!(validate_tag(tag), Err(Error::InvalidArgument(_))), "{tag:?}");
        }
    }

    #[test]
    fn debug_hides_hooks() {
        let migrator = Migrator::new("migrations").on_migration_start(|_, _| {});
        let debug = format!("{migrator:?}");
        assert!(debug.contains("on_migration_start: true"));
        assert!(debug.contains("on_migration_error: false"));
    }

    #[test]
    fn interrupt_flag_is_shared() {
        let flag: InterruptFlag = Arc::new(AtomicBool::new(false));
        let migrator = Migrator::new("migrations").with_interrupt_flag(Arc::clone(&flag));
        assert!(Arc::ptr_eq(&flag, &migrator.interrupt_flag()));
    }
}
