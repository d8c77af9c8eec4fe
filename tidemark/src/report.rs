//! Tabular renderings of ledger rows for operators.

use crate::ledger::HistoryRecord;
use serde::Serialize;

pub const CSV_FILE_NAME: &str = "migration_report.csv";
pub const JSON_FILE_NAME: &str = "migration_report.json";

#[derive(Serialize)]
struct CsvRow<'a> {
    version: &'a str,
    description: &'a str,
    success: bool,
    reverted: bool,
    applied_at: String,
}

/// One line per record under the header `version,description,success,reverted,applied_at`.
pub fn to_csv(records: &[HistoryRecord]) -> Result<String, csv::Error> {
    let mut writer = csv::Writer::from_writer(Vec::new());
    for record in records {
        writer.serialize(CsvRow {
            version: &record.version,
            description: &record.description,
            success: record.success,
            reverted: record.reverted,
            applied_at: record.applied_at.format("%Y-%m-%d %H:%M:%S").to_string(),
        })?;
    }
    if records.is_empty() {
        writer.write_record(["version", "description", "success", "reverted", "applied_at"])?;
    }
    let bytes = writer
        .into_inner()
        .map_err(|e| csv::Error::from(e.into_error()))?;
    Ok(String::from_utf8_lossy(&bytes).into_owned())
}

/// Pretty-printed JSON array of full records.
pub fn to_json(records: &[HistoryRecord]) -> Result<String, serde_json::Error> {
    serde_json::to_string_pretty(records)
}
