//! Event classifier and transaction tracker
//!
//! The single producer of the pipeline. Pulls events from an
//! [`EventSource`], decodes and classifies them, tracks transaction
//! boundaries and publishes selected records to the SQL workers and every
//! classified event to the statistics aggregator.

use std::sync::Arc;
use tokio::sync::mpsc;

use super::check::{CheckOutcome, EventCheck};
use super::record::{ChangeRecord, OperationKind, StatRecord, TransactionState};
use super::JobContext;
use crate::binlog::event::event_type;
use crate::binlog::{BinlogEvent, EventDecoder, EventSource, Position, RawEvent, RowsEvent};
use crate::catalog::{parse_ddl, SchemaResolver};
use crate::error::{Error, Result};

/// What the classifier saw before it ended
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ClassifierSummary {
    pub events_read: u64,
    pub events_skipped: u64,
    pub decode_failures: u64,
    /// Records handed to the SQL workers
    pub records_selected: u64,
    pub stats_published: u64,
    pub transactions: u64,
    /// End of the last event processed
    pub last_position: Position,
    pub stopped_by_user: bool,
}

/// The classified shape of one event
struct Classified {
    kind: OperationKind,
    database: String,
    table: String,
    query: Option<String>,
    rows: Option<Arc<RowsEvent>>,
}

fn classify(event: &BinlogEvent) -> Option<Classified> {
    match event {
        BinlogEvent::Query { database, query } => {
            let lower = query.trim().to_lowercase();
            let (kind, database, table) = if matches!(lower.as_str(), "begin" | "commit" | "rollback")
            {
                (OperationKind::Transaction, database.clone(), String::new())
            } else if let Some(ddl) = parse_ddl(query, database) {
                (OperationKind::Ddl, ddl.database, ddl.table)
            } else {
                (OperationKind::Statement, database.clone(), String::new())
            };

            Some(Classified {
                kind,
                database,
                table,
                query: Some(query.clone()),
                rows: None,
            })
        }
        // InnoDB transactions end with XID instead of a COMMIT query
        BinlogEvent::Xid { .. } => Some(Classified {
            kind: OperationKind::Transaction,
            database: String::new(),
            table: String::new(),
            query: Some("COMMIT".to_string()),
            rows: None,
        }),
        BinlogEvent::Rows(rows) => Some(Classified {
            kind: OperationKind::from(rows.kind),
            database: rows.table.schema.clone(),
            table: rows.table.table.clone(),
            query: None,
            rows: Some(rows.clone()),
        }),
        _ => None,
    }
}

/// Single-producer classification loop
pub struct Classifier<S, C> {
    ctx: Arc<JobContext>,
    source: S,
    check: C,
    schemas: Arc<dyn SchemaResolver>,
    decoder: EventDecoder,
    trx: TransactionState,
    current_file: String,
    table_map_pos: u32,
    next_idx: u64,
    sql_tx: Option<mpsc::Sender<ChangeRecord>>,
    stat_tx: mpsc::Sender<StatRecord>,
}

impl<S: EventSource, C: EventCheck> Classifier<S, C> {
    /// `sql_tx` is `None` for statistics-only jobs
    pub fn new(
        ctx: Arc<JobContext>,
        source: S,
        check: C,
        schemas: Arc<dyn SchemaResolver>,
        start_file: impl Into<String>,
        sql_tx: Option<mpsc::Sender<ChangeRecord>>,
        stat_tx: mpsc::Sender<StatRecord>,
    ) -> Self {
        Self {
            ctx,
            source,
            check,
            schemas,
            decoder: EventDecoder::new(),
            trx: TransactionState::new(),
            current_file: start_file.into(),
            table_map_pos: 0,
            next_idx: 0,
            sql_tx,
            stat_tx,
        }
    }

    /// Run until the stream drains, the idle deadline expires, a stop
    /// bound is reached or a stop is requested
    ///
    /// Consumes the classifier so both channels close when it returns.
    pub async fn run(mut self) -> Result<ClassifierSummary> {
        let mut summary = ClassifierSummary::default();
        let deadline = if self.ctx.job.output_to_screen {
            None
        } else {
            Some(self.ctx.job.idle_timeout())
        };

        tracing::info!("Start analysing binlog events from {}", self.current_file);

        loop {
            if self.ctx.is_stopped() {
                tracing::info!("Stop requested, ending analysis");
                summary.stopped_by_user = true;
                break;
            }

            let pulled = tokio::select! {
                pulled = self.source.next_event(deadline) => pulled,
                _ = self.ctx.stopped() => Err(Error::Cancelled),
            };

            let raw = match pulled {
                Ok(Some(raw)) => raw,
                Ok(None) => {
                    tracing::info!("Binlog stream ended");
                    break;
                }
                Err(Error::Timeout) => {
                    tracing::info!(
                        "No binlog event within {:?}, analysis finished",
                        deadline.unwrap_or_default()
                    );
                    break;
                }
                Err(Error::Cancelled) => {
                    tracing::info!("Stop requested while waiting for events");
                    summary.stopped_by_user = true;
                    break;
                }
                Err(e) => {
                    tracing::error!("Failed to get binlog event: {}", e);
                    return Err(e);
                }
            };
            summary.events_read += 1;

            if raw.header.event_type == event_type::TABLE_MAP_EVENT {
                self.table_map_pos = raw.header.start_pos();
            }

            let event = match self.decoder.decode(&raw) {
                Ok(event) => event,
                Err(e) => {
                    summary.decode_failures += 1;
                    match self.undecoded(&raw) {
                        CheckOutcome::Stop => break,
                        CheckOutcome::Skip | CheckOutcome::Rotated(_) => {
                            tracing::warn!(
                                "Skipping undecodable event at {}: {}",
                                Position::new(self.current_file.clone(), raw.header.log_pos),
                                e
                            );
                            summary.events_skipped += 1;
                            continue;
                        }
                        CheckOutcome::Process => {
                            tracing::error!(
                                "Failed to decode selected event at {}: {}",
                                Position::new(self.current_file.clone(), raw.header.log_pos),
                                e
                            );
                            return Err(e);
                        }
                    }
                }
            };

            match self.check.check(&raw, &event, &self.current_file) {
                CheckOutcome::Process => {}
                CheckOutcome::Skip => {
                    summary.events_skipped += 1;
                    continue;
                }
                CheckOutcome::Stop => break,
                CheckOutcome::Rotated(file) => {
                    if file != self.current_file {
                        tracing::info!("Rotated to binlog file {}", file);
                    }
                    self.current_file = file;
                    continue;
                }
            }

            let Some(classified) = classify(&event) else {
                summary.events_skipped += 1;
                continue;
            };

            self.handle(&raw, classified, &mut summary).await?;
            summary.last_position = Position::new(self.current_file.clone(), raw.header.log_pos);
        }

        tracing::info!(
            events = summary.events_read,
            selected = summary.records_selected,
            "Finished analysing binlog events up to {}",
            summary.last_position
        );
        Ok(summary)
    }

    /// Whether an event that failed to decode would have been processed
    ///
    /// Bookkeeping events and row events on an unmapped table id (a start
    /// position inside a transaction) can be skipped.
    fn undecoded(&mut self, raw: &RawEvent) -> CheckOutcome {
        let code = raw.header.event_type;
        if !event_type::is_change_event(code) {
            return CheckOutcome::Skip;
        }

        if event_type::rows_kind(code).is_some() {
            let Some((kind, table)) = self.decoder.rows_target(raw) else {
                return CheckOutcome::Skip;
            };
            return self.check.check_undecoded(
                raw,
                Some((OperationKind::from(kind), table.as_ref())),
                &self.current_file,
            );
        }

        self.check.check_undecoded(raw, None, &self.current_file)
    }

    async fn handle(
        &mut self,
        raw: &RawEvent,
        classified: Classified,
        summary: &mut ClassifierSummary,
    ) -> Result<()> {
        let header = &raw.header;

        let row_count = match (&classified.rows, &classified.query) {
            (Some(rows), _) => {
                self.trx.observe_rows();
                rows.row_count()
            }
            (None, Some(query)) => {
                let before = self.trx.index;
                let count = self.trx.observe_statement(query);
                if self.trx.index != before {
                    summary.transactions += 1;
                }
                count
            }
            (None, None) => 0,
        };

        if let Some(sql_tx) = &self.sql_tx {
            let job = &self.ctx.job;
            let mut schema = None;
            let selected = match classified.kind {
                OperationKind::Ddl => job.include_ddl,
                kind if kind.is_row_mutation() && !job.include_ddl => {
                    let resolved = self
                        .schemas
                        .resolve(&classified.database, &classified.table)
                        .await?;
                    let Some(resolved) = resolved else {
                        let err = Error::SchemaNotFound {
                            table: format!("`{}`.`{}`", classified.database, classified.table),
                            position: Position::new(self.current_file.clone(), header.log_pos)
                                .to_string(),
                        };
                        tracing::error!("{}", err);
                        return Err(err);
                    };
                    schema = Some(resolved);
                    true
                }
                _ => false,
            };

            if selected {
                self.next_idx += 1;
                let record = ChangeRecord {
                    event_idx: self.next_idx,
                    position: Position::new(self.current_file.clone(), header.log_pos),
                    start_pos: header.start_pos(),
                    table_map_pos: self.table_map_pos,
                    timestamp: header.timestamp,
                    kind: classified.kind,
                    database: classified.database.clone(),
                    table: classified.table.clone(),
                    trx_index: self.trx.index,
                    trx_status: self.trx.status,
                    row_count,
                    query: classified.query.clone(),
                    rows: classified.rows.clone(),
                    schema,
                };

                tracing::debug!(
                    event_idx = record.event_idx,
                    kind = %record.kind,
                    "Selected {}.{} at {}",
                    record.database,
                    record.table,
                    record.position
                );

                sql_tx
                    .send(record)
                    .await
                    .map_err(|_| Error::ChannelClosed("SQL generation workers".into()))?;
                summary.records_selected += 1;
            }
        }

        let start_pos = if classified.kind.is_row_mutation() {
            self.table_map_pos
        } else {
            header.start_pos()
        };

        let stat = StatRecord {
            timestamp: header.timestamp,
            file: self.current_file.clone(),
            start_pos,
            stop_pos: header.log_pos,
            database: classified.database,
            table: classified.table,
            query: classified.query.unwrap_or_default(),
            row_count,
            kind: classified.kind,
        };

        self.stat_tx
            .send(stat)
            .await
            .map_err(|_| Error::ChannelClosed("statistics aggregator".into()))?;
        summary.stats_published += 1;

        Ok(())
    }
}
