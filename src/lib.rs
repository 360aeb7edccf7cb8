//! Binlens - MySQL Binlog Change-Data-Capture Analyzer
//!
//! Attaches to a MySQL-compatible server as a replica (or replays local
//! binlog files), classifies every replication event and turns the stream
//! into forward SQL, rollback SQL and per-table change statistics.
//!
//! # Architecture
//!
//! A single classifier task pulls events, tracks transaction boundaries and
//! fans records out over bounded channels to a pool of SQL generation
//! workers and a statistics aggregator. An ordered reporter re-sorts the
//! workers' output by event index before writing it.
//!
//! # Features
//!
//! - Native replication client (handshake, checksum negotiation, binlog dump)
//! - Start file search by datetime over the server's binary logs
//! - Row image decoding with textual temporal and decimal values
//! - Forward and rollback SQL, DDL pass-through
//! - Windowed per-table statistics, DDL log and big/long transaction report
//! - Cooperative cancellation

pub mod binlog;
pub mod catalog;
pub mod config;
pub mod error;
pub mod locator;
pub mod pipeline;
pub mod report;
pub mod tuning;

pub use config::BinlensConfig;
pub use error::{Error, Result};

/// Re-export commonly used types
pub mod prelude {
    pub use crate::binlog::{BinlogEvent, EventSource, Position, RawEvent};
    pub use crate::catalog::{Catalog, SchemaResolver, TableSchema};
    pub use crate::config::{BinlensConfig, JobConfig, WorkType};
    pub use crate::error::{Error, Result};
    pub use crate::pipeline::{ChangeRecord, Job, JobSummary, OperationKind, StopHandle};
    pub use crate::report::{parse_report, ReportEntry};
}
