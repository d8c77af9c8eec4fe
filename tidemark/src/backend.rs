use crate::error::Error;
use crate::ledger::Ledger;
use crate::lock::{LockPrimitive, RetryPolicy};

/// A database connection the migrator can drive.
///
/// The caller owns the handle and passes it to each [Migrator](crate::Migrator)
/// operation. Transactions are explicit so the lock can be held across the whole
/// transaction and released after it ends.
pub trait Backend: LockPrimitive + Ledger {
    fn begin(&mut self) -> Result<(), Error>;

    fn commit(&mut self) -> Result<(), Error>;

    fn rollback(&mut self) -> Result<(), Error>;

    /// Run the raw text of a migration script, which may hold several statements.
    fn execute_script(&mut self, sql: &str) -> Result<(), Error>;

    /// Drop every schema object except the ledger and lock bookkeeping.
    /// Returns how many objects were dropped.
    fn wipe_schema(&mut self) -> Result<usize, Error>;

    /// Lock retry behaviour used when the migrator is not given one.
    fn default_retry_policy(&self) -> RetryPolicy {
        RetryPolicy::default()
    }
}
