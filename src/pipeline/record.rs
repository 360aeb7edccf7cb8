//! Pipeline records
//!
//! The normalized change record handed to SQL workers, the statistics
//! record handed to the aggregator, and the transaction tracker that
//! stamps both.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

use crate::binlog::{Position, RowsEvent, RowsKind};
use crate::catalog::TableSchema;

/// Operation kind of a classified event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OperationKind {
    Ddl,
    Insert,
    Update,
    Delete,
    /// BEGIN / COMMIT / ROLLBACK / XID
    Transaction,
    /// Any other statement carried by a QUERY event
    Statement,
}

impl OperationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            OperationKind::Ddl => "ddl",
            OperationKind::Insert => "insert",
            OperationKind::Update => "update",
            OperationKind::Delete => "delete",
            OperationKind::Transaction => "transaction",
            OperationKind::Statement => "statement",
        }
    }

    /// Row mutation kinds
    pub fn is_row_mutation(&self) -> bool {
        matches!(
            self,
            OperationKind::Insert | OperationKind::Update | OperationKind::Delete
        )
    }

    /// Kinds carried as statement text
    pub fn is_statement(&self) -> bool {
        !self.is_row_mutation()
    }
}

impl From<RowsKind> for OperationKind {
    fn from(kind: RowsKind) -> Self {
        match kind {
            RowsKind::Write => OperationKind::Insert,
            RowsKind::Update => OperationKind::Update,
            RowsKind::Delete => OperationKind::Delete,
        }
    }
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Transaction status as seen at the current event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TrxStatus {
    #[default]
    None,
    Begin,
    Process,
    Commit,
    Rollback,
}

/// Transaction boundary tracker
///
/// Advisory only: every transition is accepted, so a COMMIT without a
/// preceding BEGIN simply sets the status.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TransactionState {
    /// Number of BEGINs seen so far
    pub index: u64,
    pub status: TrxStatus,
}

impl TransactionState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Observe statement text; returns the row count the statement stands for
    pub fn observe_statement(&mut self, sql: &str) -> usize {
        let lower = sql.trim().to_lowercase();
        match lower.as_str() {
            "begin" => {
                self.index += 1;
                self.status = TrxStatus::Begin;
                0
            }
            "commit" => {
                self.status = TrxStatus::Commit;
                0
            }
            "rollback" => {
                self.status = TrxStatus::Rollback;
                0
            }
            "" => 0,
            _ => {
                self.status = TrxStatus::Process;
                1
            }
        }
    }

    pub fn observe_rows(&mut self) {
        self.status = TrxStatus::Process;
    }
}

/// A classified event selected for SQL generation
#[derive(Debug, Clone)]
pub struct ChangeRecord {
    /// 1-based, gap-free among selected records
    pub event_idx: u64,
    /// File and end offset of the event
    pub position: Position,
    pub start_pos: u32,
    /// Offset of the TABLE_MAP covering a rows event
    pub table_map_pos: u32,
    pub timestamp: u32,
    pub kind: OperationKind,
    pub database: String,
    pub table: String,
    pub trx_index: u64,
    pub trx_status: TrxStatus,
    pub row_count: usize,
    /// Statement text for DDL and other query events
    pub query: Option<String>,
    /// Decoded rows for row mutations
    pub rows: Option<Arc<RowsEvent>>,
    pub schema: Option<Arc<TableSchema>>,
}

impl ChangeRecord {
    /// Position where rendering starts: the TABLE_MAP for rows, else the event
    pub fn span_start(&self) -> u32 {
        if self.kind.is_row_mutation() {
            self.table_map_pos
        } else {
            self.start_pos
        }
    }
}

/// Per-event statistics, produced for every classified event
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StatRecord {
    pub timestamp: u32,
    pub file: String,
    pub start_pos: u32,
    pub stop_pos: u32,
    pub database: String,
    pub table: String,
    /// Statement text for query events, empty for row events
    pub query: String,
    pub row_count: usize,
    pub kind: OperationKind,
}
