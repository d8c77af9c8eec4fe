//! `tidemark` command-line front end.
//!
//! Opens the database named by the config (or `--database-url`), runs one
//! operation and exits non-zero on failure.

mod config;

use std::path::{Path, PathBuf};
use std::process::ExitCode;

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use tidemark::{
    report, Backend, HistoryRecord, LedgerInfo, Migrator, RollbackOutcome, RollbackReport,
};
use tracing_subscriber::EnvFilter;

use crate::config::{Config, DEFAULT_CONFIG_FILE};

#[derive(Parser)]
#[command(name = "tidemark", version, about = "Versioned SQL migrations")]
struct Cli {
    /// Config file. Missing is fine unless given explicitly.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Database URL, e.g. sqlite://app.db or postgres://user@host/db
    #[arg(long, global = true)]
    database_url: Option<String>,

    /// Directory holding V<version>__<description>.sql scripts
    #[arg(long, global = true)]
    migrations: Option<PathBuf>,

    /// More logging (-v debug, -vv trace). RUST_LOG takes precedence.
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
enum Command {
    /// Apply every pending migration
    Migrate,
    /// Rebuild the schema as of a version, reverting later ones
    Rollback {
        /// Version to keep, e.g. 3 (same zero-padding as the script names)
        tag: String,
    },
    /// Rebuild the schema as of a UTC date (yyyy-MM-dd or "yyyy-MM-dd HH:mm:ss")
    RollbackToDate { date: String },
    /// Revert the N most recent migrations
    RollbackCount { count: u32 },
    /// Show the current version and active migrations
    Info,
    /// Write the ledger as CSV
    ReportCsv {
        #[arg(long, default_value = "reports")]
        output: PathBuf,
    },
    /// Write the ledger as JSON
    ReportJson {
        #[arg(long, default_value = "reports")]
        output: PathBuf,
    },
    /// Report whether the migration lock is held
    Status,
    /// Clear a migration lock left by a crashed process
    ForceUnlock,
}

fn init_tracing(verbose: u8) {
    let default = match verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn load_config(cli: &Cli) -> anyhow::Result<Config> {
    let (path, required) = match &cli.config {
        Some(path) => (path.clone(), true),
        None => (PathBuf::from(DEFAULT_CONFIG_FILE), false),
    };
    let mut config = Config::load(&path, required)?;
    config.apply_env(|name| std::env::var(name).ok());
    if let Some(url) = &cli.database_url {
        config.database_url = Some(url.clone());
    }
    if let Some(dir) = &cli.migrations {
        config.migrations = dir.clone();
    }
    Ok(config)
}

fn build_migrator(config: &Config) -> Migrator {
    let migrator = Migrator::new(&config.migrations);
    match config.lock.retry_policy() {
        Some(policy) => migrator.with_retry_policy(policy),
        None => migrator,
    }
}

/// Opens the backend for `url` and runs `command` against it.
fn dispatch(config: &Config, command: &Command) -> anyhow::Result<()> {
    let url = config.database_url()?;
    let migrator = build_migrator(config);

    if let Some(path) = sqlite_path(url) {
        #[cfg(feature = "sqlite")]
        {
            let mut db = tidemark::sqlite::SqliteBackend::open(path)
                .with_context(|| format!("failed to open SQLite database {path}"))?;
            if let Some(table) = &config.ledger_table {
                db = db.with_ledger_table_name(table);
            }
            if let Some(table) = &config.lock.sqlite_lock_table {
                db = db.with_lock_table_name(table);
            }
            return execute(&migrator, &mut db, command);
        }
        #[cfg(not(feature = "sqlite"))]
        bail!("SQLite support not compiled in (enable the `sqlite` feature) for {path}");
    }

    if url.starts_with("postgres://") || url.starts_with("postgresql://") {
        #[cfg(feature = "postgres")]
        {
            let mut db = tidemark::postgres::PostgresBackend::connect(url)
                .context("failed to connect to PostgreSQL")?;
            if let Some(table) = &config.ledger_table {
                db = db.with_ledger_table_name(table);
            }
            if let Some(id) = config.lock.advisory_lock_id {
                db = db.with_advisory_lock_id(id);
            }
            return execute(&migrator, &mut db, command);
        }
        #[cfg(not(feature = "postgres"))]
        bail!("PostgreSQL support not compiled in (enable the `postgres` feature)");
    }

    bail!("unsupported database URL '{url}'; expected sqlite://<path> or postgres://...")
}

/// `sqlite://app.db`, `sqlite:app.db` or `sqlite::memory:`.
fn sqlite_path(url: &str) -> Option<&str> {
    url.strip_prefix("sqlite://")
        .or_else(|| url.strip_prefix("sqlite:"))
        .filter(|path| !path.is_empty())
}

fn execute<B: Backend>(migrator: &Migrator, db: &mut B, command: &Command) -> anyhow::Result<()> {
    match command {
        Command::Migrate => {
            let report = migrator.migrate(db)?;
            if report.applied.is_empty() {
                println!(
                    "Database is up to date ({} already applied)",
                    report.skipped.len()
                );
            } else {
                println!(
                    "Applied {} migration(s): {}",
                    report.applied.len(),
                    report.applied.join(", ")
                );
            }
        }
        Command::Rollback { tag } => {
            print_rollback(&migrator.rollback_to_tag(db, tag)?);
        }
        Command::RollbackToDate { date } => {
            print_rollback(&migrator.rollback_to_date(db, date)?);
        }
        Command::RollbackCount { count } => {
            print_rollback(&migrator.rollback_count(db, *count)?);
        }
        Command::Info => print_info(&migrator.info(db)?),
        Command::ReportCsv { output } => {
            let rows = migrator.history(db)?;
            let path = write_report(output, report::CSV_FILE_NAME, &report::to_csv(&rows)?)?;
            println!("Wrote {} row(s) to {}", rows.len(), path.display());
        }
        Command::ReportJson { output } => {
            let rows = migrator.history(db)?;
            let path = write_report(output, report::JSON_FILE_NAME, &report::to_json(&rows)?)?;
            println!("Wrote {} row(s) to {}", rows.len(), path.display());
        }
        Command::Status => {
            if migrator.is_locked(db)? {
                println!("Migration lock is held");
            } else {
                println!("Migration lock is free");
            }
        }
        Command::ForceUnlock => {
            migrator.force_unlock(db)?;
            println!("Migration lock cleared");
        }
    }
    Ok(())
}

fn print_rollback(report: &RollbackReport) {
    match report.outcome {
        RollbackOutcome::NoOp => println!("Nothing to roll back"),
        RollbackOutcome::RolledBack => println!(
            "Dropped {} object(s), replayed {} migration(s), reverted {}",
            report.dropped_objects,
            report.replayed.len(),
            report.reverted
        ),
    }
}

fn print_info(info: &LedgerInfo) {
    match &info.current_version {
        Some(version) => println!("Current version: {version}"),
        None => println!("No migrations applied"),
    }
    for record in &info.active {
        print_record(record);
    }
}

fn print_record(record: &HistoryRecord) {
    println!(
        "  {:<8} {:<40} {}  ({} ms)",
        record.version, record.description, record.applied_at, record.execution_time_ms
    );
}

fn write_report(dir: &Path, file_name: &str, contents: &str) -> anyhow::Result<PathBuf> {
    std::fs::create_dir_all(dir)
        .with_context(|| format!("failed to create report directory {}", dir.display()))?;
    let path = dir.join(file_name);
    std::fs::write(&path, contents).with_context(|| format!("failed to write {}", path.display()))?;
    Ok(path)
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let result = load_config(&cli).and_then(|config| dispatch(&config, &cli.command));
    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(error) => {
            tracing::error!(command = ?cli.command, "{error:#}");
            eprintln!("error: {error:#}");
            ExitCode::FAILURE
        }
    }
}
