//! SQL generation workers
//!
//! Turns change records into forward and rollback SQL. Workers share one
//! receiver and finish in arbitrary order; the reporter restores event
//! order from `event_idx`.

use chrono::{Local, TimeZone};
use std::fmt::Write as _;
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};

use super::record::{ChangeRecord, OperationKind};
use crate::binlog::{ColumnValue, RowsEvent};
use crate::catalog::TableSchema;
use crate::error::{Error, Result};

/// Rendered SQL for one change record
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RenderedSql {
    pub event_idx: u64,
    /// Position/time comment printed before the statements
    pub header: Option<String>,
    pub forward: Vec<String>,
    /// Statements undoing `forward`, already in undo order
    pub rollback: Vec<String>,
}

impl RenderedSql {
    /// Placeholder keeping the event index sequence gap-free
    pub fn empty(event_idx: u64) -> Self {
        Self {
            event_idx,
            ..Self::default()
        }
    }
}

/// Renders one change record; stateless and shared by all workers
pub trait SqlRenderer: Send + Sync {
    fn render(&self, record: &ChangeRecord) -> Result<RenderedSql>;
}

/// Default renderer producing MySQL statements
#[derive(Debug, Clone)]
pub struct StatementRenderer {
    extra_info: bool,
}

impl StatementRenderer {
    pub fn new(extra_info: bool) -> Self {
        Self { extra_info }
    }

    fn header(&self, record: &ChangeRecord) -> Option<String> {
        if !self.extra_info {
            return None;
        }
        Some(format!(
            "# datetime={} database={} table={} binlog={} startpos={} stoppos={}",
            format_timestamp(record.timestamp),
            record.database,
            record.table,
            record.position.file,
            record.span_start(),
            record.position.pos
        ))
    }

    fn render_rows(
        &self,
        rows: &RowsEvent,
        schema: &TableSchema,
        kind: OperationKind,
    ) -> Result<(Vec<String>, Vec<String>)> {
        let table = Table::new(rows, schema);
        let mut forward = Vec::with_capacity(rows.row_count());
        let mut rollback = Vec::with_capacity(rows.row_count());

        match kind {
            OperationKind::Insert => {
                for row in &rows.rows {
                    forward.push(table.insert(row));
                    rollback.push(table.delete(row));
                }
            }
            OperationKind::Delete => {
                for row in &rows.rows {
                    forward.push(table.delete(row));
                    rollback.push(table.insert(row));
                }
            }
            OperationKind::Update => {
                for (before, after) in rows.update_pairs() {
                    forward.push(table.update(after, before));
                    rollback.push(table.update(before, after));
                }
            }
            other => {
                return Err(Error::Render(format!("{} is not a row mutation", other)));
            }
        }

        rollback.reverse();
        Ok((forward, rollback))
    }
}

impl SqlRenderer for StatementRenderer {
    fn render(&self, record: &ChangeRecord) -> Result<RenderedSql> {
        let (forward, rollback) = match record.kind {
            OperationKind::Ddl | OperationKind::Statement => {
                let query = record.query.as_deref().unwrap_or_default().trim();
                let statement = format!("{};", query.trim_end_matches(';'));
                // DDL cannot be undone; it passes through unchanged
                (vec![statement.clone()], vec![statement])
            }
            kind if kind.is_row_mutation() => {
                let rows = record.rows.as_ref().ok_or_else(|| {
                    Error::Render(format!("record {} carries no rows", record.event_idx))
                })?;
                let schema = record.schema.as_ref().ok_or_else(|| {
                    Error::Render(format!("record {} carries no table schema", record.event_idx))
                })?;
                self.render_rows(rows, schema, kind)?
            }
            _ => (Vec::new(), Vec::new()),
        };

        Ok(RenderedSql {
            event_idx: record.event_idx,
            header: self.header(record),
            forward,
            rollback,
        })
    }
}

/// Column naming and typing for one rows event
struct Table<'a> {
    name: String,
    columns: Vec<String>,
    col_types: &'a [u8],
    unsigned: Vec<bool>,
    key: Vec<usize>,
}

impl<'a> Table<'a> {
    fn new(rows: &'a RowsEvent, schema: &TableSchema) -> Self {
        let count = rows.column_count;
        // Columns beyond the known schema keep positional names
        let columns = (0..count)
            .map(|idx| match schema.column(idx) {
                Some(col) => quote_ident(&col.name),
                None => format!("`@{}`", idx + 1),
            })
            .collect();
        let unsigned = (0..count)
            .map(|idx| schema.column(idx).map(|c| c.unsigned).unwrap_or(false))
            .collect();

        Self {
            name: format!(
                "{}.{}",
                quote_ident(&rows.table.schema),
                quote_ident(&rows.table.table)
            ),
            columns,
            col_types: &rows.table.column_types,
            unsigned,
            key: schema
                .primary_key_positions()
                .into_iter()
                .filter(|&idx| idx < count)
                .collect(),
        }
    }

    fn literal(&self, idx: usize, value: &ColumnValue) -> String {
        let col_type = self.col_types.get(idx).copied().unwrap_or_default();
        match value {
            ColumnValue::Null => "NULL".to_string(),
            ColumnValue::Int(v) if self.unsigned[idx] => value
                .as_unsigned(col_type)
                .map(|u| u.to_string())
                .unwrap_or_else(|| v.to_string()),
            ColumnValue::Int(v) => v.to_string(),
            // SQL has no NaN or infinity literal
            ColumnValue::Float(v) if !v.is_finite() => "NULL".to_string(),
            ColumnValue::Double(v) if !v.is_finite() => "NULL".to_string(),
            ColumnValue::Float(v) => v.to_string(),
            ColumnValue::Double(v) => v.to_string(),
            ColumnValue::Decimal(v) => v.clone(),
            ColumnValue::Temporal(v) => format!("'{}'", v),
            ColumnValue::Bytes(b) => match std::str::from_utf8(b) {
                Ok(s) => quote_string(s),
                Err(_) => hex_literal(b),
            },
            ColumnValue::Json(b) => hex_literal(b),
            ColumnValue::Enum(v) => v.to_string(),
            ColumnValue::Set(v) | ColumnValue::Bit(v) => v.to_string(),
        }
    }

    fn where_clause(&self, row: &[Option<ColumnValue>]) -> String {
        let key_present =
            !self.key.is_empty() && self.key.iter().all(|&idx| matches!(row.get(idx), Some(Some(_))));

        let conditions: Vec<String> = present(row)
            .filter(|(idx, _)| !key_present || self.key.contains(idx))
            .map(|(idx, value)| match self.literal(idx, value).as_str() {
                "NULL" => format!("{} IS NULL", self.columns[idx]),
                literal => format!("{}={}", self.columns[idx], literal),
            })
            .collect();

        if conditions.is_empty() {
            return String::new();
        }
        format!(" WHERE {}", conditions.join(" AND "))
    }

    fn insert(&self, row: &[Option<ColumnValue>]) -> String {
        let mut names = Vec::new();
        let mut values = Vec::new();
        for (idx, value) in present(row) {
            names.push(self.columns[idx].as_str());
            values.push(self.literal(idx, value));
        }
        format!(
            "INSERT INTO {}({}) VALUES ({});",
            self.name,
            names.join(","),
            values.join(",")
        )
    }

    fn delete(&self, row: &[Option<ColumnValue>]) -> String {
        format!("DELETE FROM {}{} LIMIT 1;", self.name, self.where_clause(row))
    }

    /// UPDATE setting `set` where `matching` identifies the row
    fn update(&self, set: &[Option<ColumnValue>], matching: &[Option<ColumnValue>]) -> String {
        let assignments: Vec<String> = present(set)
            .map(|(idx, value)| format!("{}={}", self.columns[idx], self.literal(idx, value)))
            .collect();
        format!(
            "UPDATE {} SET {}{} LIMIT 1;",
            self.name,
            assignments.join(","),
            self.where_clause(matching)
        )
    }
}

/// Present (index, value) pairs of an image
fn present(row: &[Option<ColumnValue>]) -> impl Iterator<Item = (usize, &ColumnValue)> {
    row.iter()
        .enumerate()
        .filter_map(|(idx, v)| v.as_ref().map(|v| (idx, v)))
}

fn quote_ident(name: &str) -> String {
    format!("`{}`", name.replace('`', "``"))
}

fn quote_string(s: &str) -> String {
    let mut out = String::with_capacity(s.len() + 2);
    out.push('\'');
    for c in s.chars() {
        match c {
            '\'' => out.push_str("\\'"),
            '\\' => out.push_str("\\\\"),
            '\0' => out.push_str("\\0"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\x1a' => out.push_str("\\Z"),
            c => out.push(c),
        }
    }
    out.push('\'');
    out
}

fn hex_literal(bytes: &[u8]) -> String {
    if bytes.is_empty() {
        return "''".to_string();
    }
    let mut out = String::with_capacity(2 + bytes.len() * 2);
    out.push_str("0x");
    for b in bytes {
        let _ = write!(out, "{:02X}", b);
    }
    out
}

/// Binlog timestamp in local time, `YYYY-MM-DD_HH:MM:SS`
pub fn format_timestamp(ts: u32) -> String {
    Local
        .timestamp_opt(ts as i64, 0)
        .single()
        .map(|t| t.format("%Y-%m-%d_%H:%M:%S").to_string())
        .unwrap_or_else(|| ts.to_string())
}

/// Worker loop: render records until the channel closes
///
/// A record that fails to render still produces an empty [`RenderedSql`]
/// so the reporter's ordering never stalls on a missing index.
pub async fn run_worker(
    id: usize,
    records: Arc<Mutex<mpsc::Receiver<ChangeRecord>>>,
    output: mpsc::Sender<RenderedSql>,
    renderer: Arc<dyn SqlRenderer>,
) -> Result<u64> {
    tracing::debug!("SQL worker {} started", id);
    let mut rendered = 0u64;

    loop {
        let record = { records.lock().await.recv().await };
        let Some(record) = record else {
            break;
        };

        let sql = match renderer.render(&record) {
            Ok(sql) => sql,
            Err(e) => {
                tracing::warn!(
                    "Worker {} failed to render event {} at {}: {}",
                    id,
                    record.event_idx,
                    record.position,
                    e
                );
                RenderedSql::empty(record.event_idx)
            }
        };

        output
            .send(sql)
            .await
            .map_err(|_| Error::ChannelClosed("SQL reporter".into()))?;
        rendered += 1;
    }

    tracing::debug!("SQL worker {} finished after {} records", id, rendered);
    Ok(rendered)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::binlog::rows::column_type as ct;
    use crate::binlog::{Position, RowsKind, TableMapEvent};
    use crate::catalog::ColumnSchema;
    use crate::pipeline::record::TrxStatus;

    fn schema(with_key: bool) -> Arc<TableSchema> {
        let column = |name: &str, data_type: &str, unsigned| ColumnSchema {
            name: name.into(),
            data_type: data_type.into(),
            nullable: true,
            unsigned,
        };
        Arc::new(TableSchema {
            database: "shop".into(),
            name: "orders".into(),
            columns: vec![
                column("id", "tinyint", true),
                column("note", "varchar", false),
                column("placed_at", "datetime", false),
            ],
            primary_key: if with_key { vec!["id".into()] } else { Vec::new() },
        })
    }

    fn record(kind: RowsKind, rows: Vec<Vec<Option<ColumnValue>>>, with_key: bool) -> ChangeRecord {
        let table = Arc::new(TableMapEvent {
            table_id: 42,
            schema: "shop".into(),
            table: "orders".into(),
            column_types: vec![ct::TINY, ct::VARCHAR, ct::DATETIME2],
            column_meta: vec![0, 255, 0],
            null_bitmap: vec![0xFF],
        });
        let rows = RowsEvent {
            kind,
            table_id: 42,
            table,
            flags: 0,
            column_count: 3,
            rows,
        };

        ChangeRecord {
            event_idx: 3,
            position: Position::new("mysql-bin.000004", 900),
            start_pos: 850,
            table_map_pos: 800,
            timestamp: 0,
            kind: OperationKind::from(kind),
            database: "shop".into(),
            table: "orders".into(),
            trx_index: 1,
            trx_status: TrxStatus::Process,
            row_count: 1,
            query: None,
            rows: Some(Arc::new(rows)),
            schema: Some(schema(with_key)),
        }
    }

    fn row(id: i64, note: &str) -> Vec<Option<ColumnValue>> {
        vec![
            Some(ColumnValue::Int(id)),
            Some(ColumnValue::Bytes(note.as_bytes().to_vec())),
            Some(ColumnValue::Temporal("2026-01-21 16:59:10".into())),
        ]
    }

    #[test]
    fn test_insert_and_rollback() {
        let renderer = StatementRenderer::new(false);
        let sql = renderer
            .render(&record(RowsKind::Write, vec![row(-1, "it's")], true))
            .unwrap();

        assert_eq!(sql.event_idx, 3);
        assert!(sql.header.is_none());
        assert_eq!(
            sql.forward,
            vec!["INSERT INTO `shop`.`orders`(`id`,`note`,`placed_at`) VALUES (255,'it\\'s','2026-01-21 16:59:10');"]
        );
        assert_eq!(
            sql.rollback,
            vec!["DELETE FROM `shop`.`orders` WHERE `id`=255 LIMIT 1;"]
        );
    }

    #[test]
    fn test_update_uses_before_image() {
        let renderer = StatementRenderer::new(true);
        let sql = renderer
            .render(&record(RowsKind::Update, vec![row(1, "old"), row(1, "new")], true))
            .unwrap();

        assert!(sql.header.unwrap().contains("binlog=mysql-bin.000004 startpos=800 stoppos=900"));
        assert_eq!(
            sql.forward,
            vec!["UPDATE `shop`.`orders` SET `id`=1,`note`='new',`placed_at`='2026-01-21 16:59:10' WHERE `id`=1 LIMIT 1;"]
        );
        assert_eq!(
            sql.rollback,
            vec!["UPDATE `shop`.`orders` SET `id`=1,`note`='old',`placed_at`='2026-01-21 16:59:10' WHERE `id`=1 LIMIT 1;"]
        );
    }

    #[test]
    fn test_delete_without_key_matches_all_columns() {
        let renderer = StatementRenderer::new(false);
        let mut image = row(2, "gone");
        image[1] = Some(ColumnValue::Null);
        let sql = renderer
            .render(&record(RowsKind::Delete, vec![image, row(3, "x")], false))
            .unwrap();

        assert_eq!(
            sql.forward[0],
            "DELETE FROM `shop`.`orders` WHERE `id`=2 AND `note` IS NULL AND `placed_at`='2026-01-21 16:59:10' LIMIT 1;"
        );
        // Undo order is reversed
        assert!(sql.rollback[0].contains("VALUES (3,'x'"));
        assert!(sql.rollback[1].contains("VALUES (2,NULL"));
    }

    #[test]
    fn test_non_finite_floats_render_as_null() {
        let renderer = StatementRenderer::new(false);
        let mut image = row(2, "gone");
        image[2] = Some(ColumnValue::Double(f64::NAN));
        let sql = renderer
            .render(&record(RowsKind::Delete, vec![image], false))
            .unwrap();

        assert_eq!(
            sql.forward[0],
            "DELETE FROM `shop`.`orders` WHERE `id`=2 AND `note`='gone' AND `placed_at` IS NULL LIMIT 1;"
        );
        assert!(sql.rollback[0].ends_with("VALUES (2,'gone',NULL);"));

        let mut image = row(4, "big");
        image[2] = Some(ColumnValue::Float(f32::INFINITY));
        let sql = renderer
            .render(&record(RowsKind::Write, vec![image], true))
            .unwrap();
        assert!(sql.forward[0].ends_with("VALUES (4,'big',NULL);"));
    }

    #[test]
    fn test_ddl_passes_through() {
        let mut rec = record(RowsKind::Write, Vec::new(), true);
        rec.kind = OperationKind::Ddl;
        rec.rows = None;
        rec.query = Some("ALTER TABLE orders ADD COLUMN note2 TEXT;".into());

        let sql = StatementRenderer::new(false).render(&rec).unwrap();
        assert_eq!(sql.forward, vec!["ALTER TABLE orders ADD COLUMN note2 TEXT;"]);
        assert_eq!(sql.rollback, sql.forward);
    }

    #[test]
    fn test_literals() {
        assert_eq!(quote_string("a\\b\n"), "'a\\\\b\\n'");
        assert_eq!(hex_literal(&[0xDE, 0xAD]), "0xDEAD");
        assert_eq!(quote_ident("we`ird"), "`we``ird`");
    }

    #[tokio::test]
    async fn test_workers_drain_after_close() {
        let (tx, rx) = mpsc::channel(16);
        let (out_tx, mut out_rx) = mpsc::channel(16);
        let rx = Arc::new(Mutex::new(rx));
        let renderer: Arc<dyn SqlRenderer> = Arc::new(StatementRenderer::new(false));

        for idx in 1..=5 {
            let mut rec = record(RowsKind::Write, vec![row(idx, "n")], true);
            rec.event_idx = idx as u64;
            tx.send(rec).await.unwrap();
        }
        // Missing rows: rendering fails but the index still comes through
        let mut broken = record(RowsKind::Write, Vec::new(), true);
        broken.event_idx = 6;
        broken.rows = None;
        tx.send(broken).await.unwrap();
        drop(tx);

        let workers: Vec<_> = (1..=3)
            .map(|id| tokio::spawn(run_worker(id, rx.clone(), out_tx.clone(), renderer.clone())))
            .collect();
        drop(out_tx);

        let mut total = 0;
        for worker in workers {
            total += worker.await.unwrap().unwrap();
        }
        assert_eq!(total, 6);

        let mut seen = Vec::new();
        while let Some(sql) = out_rx.recv().await {
            seen.push(sql.event_idx);
        }
        seen.sort();
        assert_eq!(seen, vec![1, 2, 3, 4, 5, 6]);
    }
}
