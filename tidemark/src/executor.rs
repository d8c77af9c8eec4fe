//! Runs a single script and records it as one unit of work.

use crate::backend::Backend;
use crate::error::Error;
use crate::ledger::NewRecord;
use crate::lock::Clock;
use crate::script::MigrationScript;
use std::time::Duration;

/// Execute `script` and upsert its ledger row.
///
/// If the statements fail nothing is recorded and the error is returned as
/// [Error::ScriptExecution]. Failures writing the ledger row surface as plain
/// backend errors.
pub(crate) fn apply<B>(
    db: &mut B,
    script: &MigrationScript,
    clock: &dyn Clock,
) -> Result<Duration, Error>
where
    B: Backend + ?Sized,
{
    let started = clock.now();
    db.execute_script(&script.sql)
        .map_err(|source| Error::ScriptExecution {
            version: script.version.clone(),
            script_name: script.script_name.clone(),
            source: Box::new(source),
        })?;
    let elapsed = clock.now().duration_since(started);

    db.record_application(&NewRecord::from_script(script, elapsed, clock.now_utc()))?;
    Ok(elapsed)
}

#[cfg(all(test, feature = "sqlite"))]
mod tests {
    use super::*;
    use crate::ledger::Ledger;
    use crate::lock::tests::FakeClock;
    use crate::sqlite::SqliteBackend;

    fn script(name: &str, sql: &str) -> MigrationScript {
        MigrationScript::from_parts(name, sql.to_string()).unwrap()
    }

    #[test]
    fn records_successful_script() {
        let mut db = SqliteBackend::open_in_memory().unwrap();
        db.ensure_schema().unwrap();
        let clock = FakeClock::new();

        apply(&mut db, &script("V1__t.sql", "CREATE TABLE t (id INTEGER);"), &clock).unwrap();

        let rows = db.list_active().unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].version, "1");
        assert_eq!(rows[0].checksum, crate::checksum("CREATE TABLE t (id INTEGER);"));
        assert!(rows[0].success);
    }

    #[test]
    fn failed_script_writes_nothing() {
        let mut db = SqliteBackend::open_in_memory().unwrap();
        db.ensure_schema().unwrap();
        let clock = FakeClock::new();

        let err = apply(&mut db, &script("V2__bad.sql", "CREATE TABLE (;"), &clock).unwrap_err();
        assert!(matches!(err, Error::ScriptExecution { ref version, .. } if version == "2"));
        assert!(std::error::Error::source(&err).is_some());
        assert!(db.list_history().unwrap().is_empty());
    }
}
