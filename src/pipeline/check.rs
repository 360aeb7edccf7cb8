//! Event validity and rotation check
//!
//! Decides per event whether the classifier processes it, skips it, stops
//! the job, or switches to a new binlog file.

use crate::binlog::{compare_file_names, BinlogEvent, Position, RawEvent, TableMapEvent};
use crate::catalog::parse_ddl;
use crate::config::{JobConfig, BINLOG_START_POS};
use crate::error::Result;

use super::record::OperationKind;

/// Verdict of an [`EventCheck`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CheckOutcome {
    Process,
    Skip,
    Stop,
    /// The stream moved to a new file; the event itself is not processed
    Rotated(String),
}

/// Per-event validity/rotation check
pub trait EventCheck: Send {
    fn check(&mut self, raw: &RawEvent, event: &BinlogEvent, current_file: &str) -> CheckOutcome;

    /// Verdict for an event whose body failed to decode, judged on its
    /// header and, for row events, the mapped table
    fn check_undecoded(
        &mut self,
        raw: &RawEvent,
        rows: Option<(OperationKind, &TableMapEvent)>,
        current_file: &str,
    ) -> CheckOutcome;
}

/// Position, datetime, operation and database/table filters of a job
#[derive(Debug, Clone, Default)]
pub struct FilterCheck {
    start: Option<Position>,
    stop: Option<Position>,
    start_ts: Option<u32>,
    stop_ts: Option<u32>,
    /// Row operations to keep, empty keeps all
    ops: Vec<OperationKind>,
    databases: Vec<String>,
    tables: Vec<String>,
}

impl FilterCheck {
    pub fn from_job(job: &JobConfig) -> Result<Self> {
        let start = job.start_file.as_ref().map(|file| {
            Position::new(file.clone(), job.start_position.unwrap_or(BINLOG_START_POS))
        });
        let stop = job
            .stop_file
            .as_ref()
            .map(|file| Position::new(file.clone(), job.stop_position.unwrap_or(u32::MAX)));

        // DDL-only jobs select no rows, so the row operation filter is moot
        let ops = if job.include_ddl {
            Vec::new()
        } else {
            job.sql_types()
        };

        Ok(Self {
            start,
            stop,
            start_ts: job.start_timestamp()?,
            stop_ts: job.stop_timestamp()?,
            ops,
            databases: job.databases.clone(),
            tables: job.tables.clone(),
        })
    }

    fn database_included(&self, database: &str) -> bool {
        self.databases.is_empty() || self.databases.iter().any(|d| d == database)
    }

    fn table_included(&self, database: &str, table: &str) -> bool {
        if self.tables.is_empty() || table.is_empty() {
            return true;
        }
        self.tables.iter().any(|t| {
            t == table
                || t.split_once('.')
                    .map(|(db, tb)| db == database && tb == table)
                    .unwrap_or(false)
        })
    }

    fn included(&self, database: &str, table: &str) -> bool {
        self.database_included(database) && self.table_included(database, table)
    }

    fn check_position(&self, raw: &RawEvent, current_file: &str) -> Option<CheckOutcome> {
        let header = &raw.header;
        if header.is_artificial() || header.log_pos == 0 {
            return None;
        }

        let at = Position::new(current_file, header.start_pos());
        if let Some(start) = &self.start {
            if at < *start {
                return Some(CheckOutcome::Skip);
            }
        }
        if let Some(stop) = &self.stop {
            if at >= *stop {
                tracing::info!("Reached stop position {}", stop);
                return Some(CheckOutcome::Stop);
            }
        }
        None
    }

    fn check_datetime(&self, raw: &RawEvent) -> Option<CheckOutcome> {
        let ts = raw.header.timestamp;
        if ts == 0 {
            return None;
        }
        if self.start_ts.is_some_and(|start| ts < start) {
            return Some(CheckOutcome::Skip);
        }
        if let Some(stop) = self.stop_ts.filter(|&stop| ts >= stop) {
            tracing::info!("Reached stop datetime (event timestamp {} >= {})", ts, stop);
            return Some(CheckOutcome::Stop);
        }
        None
    }

    fn check_rows(&self, kind: OperationKind, database: &str, table: &str) -> CheckOutcome {
        if !self.ops.is_empty() && !self.ops.contains(&kind) {
            return CheckOutcome::Skip;
        }
        if !self.included(database, table) {
            return CheckOutcome::Skip;
        }
        CheckOutcome::Process
    }
}

impl EventCheck for FilterCheck {
    fn check(&mut self, raw: &RawEvent, event: &BinlogEvent, current_file: &str) -> CheckOutcome {
        if let BinlogEvent::Rotate { next_file, .. } = event {
            if let Some(stop) = &self.stop {
                if compare_file_names(next_file, &stop.file).is_gt() {
                    tracing::info!("Rotated past stop file {}", stop.file);
                    return CheckOutcome::Stop;
                }
            }
            return CheckOutcome::Rotated(next_file.clone());
        }

        if let Some(outcome) = self.check_position(raw, current_file) {
            return outcome;
        }
        if let Some(outcome) = self.check_datetime(raw) {
            return outcome;
        }

        match event {
            BinlogEvent::Rows(rows) => {
                self.check_rows(OperationKind::from(rows.kind), &rows.table.schema, &rows.table.table)
            }
            BinlogEvent::Query { database, query } => match parse_ddl(query, database) {
                Some(ddl) if !self.included(&ddl.database, &ddl.table) => CheckOutcome::Skip,
                _ => CheckOutcome::Process,
            },
            BinlogEvent::Xid { .. } => CheckOutcome::Process,
            BinlogEvent::FormatDescription(_)
            | BinlogEvent::TableMap(_)
            | BinlogEvent::Heartbeat
            | BinlogEvent::Gtid { .. }
            | BinlogEvent::RowsQuery { .. }
            | BinlogEvent::Stop
            | BinlogEvent::Unknown { .. }
            | BinlogEvent::Rotate { .. } => CheckOutcome::Skip,
        }
    }

    fn check_undecoded(
        &mut self,
        raw: &RawEvent,
        rows: Option<(OperationKind, &TableMapEvent)>,
        current_file: &str,
    ) -> CheckOutcome {
        if let Some(outcome) = self.check_position(raw, current_file) {
            return outcome;
        }
        if let Some(outcome) = self.check_datetime(raw) {
            return outcome;
        }
        match rows {
            Some((kind, table)) => self.check_rows(kind, &table.schema, &table.table),
            None => CheckOutcome::Process,
        }
    }
}
