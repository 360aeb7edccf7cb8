//! Status report parser
//!
//! Reads `binlog_status.txt` back into per-operation entries for display.
//! Columns are whitespace separated: binlog, starttime, stoptime,
//! startpos, stoppos, inserts, updates, deletes, database, table.

use serde::Serialize;
use std::path::Path;

use crate::error::Result;

/// One non-zero operation count of a report line
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ReportEntry {
    pub id: u64,
    /// `INSERT`, `UPDATE` or `DELETE`
    pub operation: String,
    pub database: String,
    pub table: String,
    pub records: u64,
    /// Start time of the window, `YYYY-MM-DD HH:MM:SS`
    pub timestamp: String,
}

const MIN_COLUMNS: usize = 10;

fn is_header(line: &str) -> bool {
    line.contains("binlog") && line.contains("starttime")
}

/// Parse report content; malformed lines are skipped
pub fn parse_report_str(content: &str) -> Vec<ReportEntry> {
    let mut entries = Vec::new();
    let mut next_id = 1u64;

    for (lineno, line) in content.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() || is_header(line) {
            continue;
        }

        let cols: Vec<&str> = line.split_whitespace().collect();
        if cols.len() < MIN_COLUMNS {
            tracing::debug!(line = lineno + 1, "Skipping short report line");
            continue;
        }

        // Unparsable counts read as zero and are dropped below
        let count = |idx: usize| cols[idx].parse::<u64>().unwrap_or(0);
        let timestamp = cols[1].replacen('_', " ", 1);

        for (operation, records) in [
            ("INSERT", count(5)),
            ("UPDATE", count(6)),
            ("DELETE", count(7)),
        ] {
            if records == 0 {
                continue;
            }
            entries.push(ReportEntry {
                id: next_id,
                operation: operation.to_string(),
                database: cols[8].to_string(),
                table: cols[9].to_string(),
                records,
                timestamp: timestamp.clone(),
            });
            next_id += 1;
        }
    }

    entries
}

/// Parse a report file
pub fn parse_report(path: &Path) -> Result<Vec<ReportEntry>> {
    let content = std::fs::read_to_string(path)?;
    let entries = parse_report_str(&content);
    tracing::debug!("Parsed {} report entries from {}", entries.len(), path.display());
    Ok(entries)
}
