#![cfg_attr(docsrs, feature(doc_cfg))]
//! `tidemark` applies and rolls back versioned SQL migration scripts, keeping a
//! ledger of every version ever applied.
//!
//! Core concepts:
//! - Scripts are plain SQL files named `V<version>__<description>.sql`, applied in
//!   ascending version order. Versions compare as strings, so zero-pad them.
//! - Each operation takes a database-level lock first, so concurrent deploys never
//!   migrate the same database at once.
//! - Each operation runs in a single transaction. A failing script leaves the schema
//!   and the ledger as they were.
//! - Ledger rows are never deleted. Rollbacks flag rows as reverted and re-applying
//!   a version reactivates its row.
//!
//! # Rollbacks wipe the schema
//!
//! There are no down-scripts. [Migrator::rollback_to_tag], [Migrator::rollback_to_date]
//! and [Migrator::rollback_count] drop **every** table, view, trigger and sequence other
//! than the ledger, then replay the scripts that should remain. Any data not
//! recreated by those scripts is lost. Point tidemark at a database (or schema)
//! that it owns.
//!
//! # Example
//!
//! ```no_run
//! # #[cfg(feature = "sqlite")]
//! # fn main() -> Result<(), tidemark::Error> {
//! use tidemark::sqlite::SqliteBackend;
//! use tidemark::Migrator;
//!
//! let mut db = SqliteBackend::open("app.db")?;
//! let migrator = Migrator::new("migrations")
//!     .on_migration_complete(|version, script, duration| {
//!         println!("applied {version} ({script}) in {duration:?}");
//!     });
//!
//! migrator.migrate(&mut db)?;
//! migrator.rollback_to_tag(&mut db, "2")?;
//! let info = migrator.info(&mut db)?;
//! println!("now at {:?}", info.current_version);
//! # Ok(())
//! # }
//! # #[cfg(not(feature = "sqlite"))]
//! # fn main() {}
//! ```
//!
//! # Database support
//!
//! - [`SQLite`](sqlite) - available with the `sqlite` feature flag (default). Locks
//!   through a single-row lock table and fails fast on contention.
//! - [`PostgreSQL`](postgres) - available with the `postgres` feature flag. Locks
//!   through a session advisory lock, waiting and recovering stale holders.

mod backend;
pub use backend::Backend;

mod error;
pub use error::Error;

mod executor;

pub mod ledger;
pub use ledger::{HistoryRecord, Ledger, RevertFilter};

pub mod lock;
pub use lock::{Clock, InterruptFlag, LockOutcome, LockPrimitive, RetryPolicy, SystemClock};

mod migrator;
pub use migrator::{
    parse_rollback_date, LedgerInfo, MigrationReport, Migrator, Phase, RollbackOutcome,
    RollbackReport,
};

pub mod report;

mod script;
pub use script::{checksum, extract_version, MigrationScript, ScriptRepository};

#[cfg(feature = "sqlite")]
#[cfg_attr(docsrs, doc(cfg(feature = "sqlite")))]
pub mod sqlite;

#[cfg(feature = "postgres")]
#[cfg_attr(docsrs, doc(cfg(feature = "postgres")))]
pub mod postgres;

#[cfg(all(test, feature = "postgres"))]
pub(crate) mod test_postgres;
