//! Statistics aggregator
//!
//! Single consumer of [`StatRecord`]s. Counts row changes per table in
//! fixed windows of binlog time, logs DDL statements, and reports big or
//! long-running transactions.

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use tokio::fs::File;
use tokio::io::{AsyncWriteExt, BufWriter};
use tokio::sync::mpsc;

use super::record::{OperationKind, StatRecord};
use super::worker::format_timestamp;
use crate::config::JobConfig;
use crate::error::Result;

pub const STATUS_FILE: &str = "binlog_status.txt";
pub const DDL_FILE: &str = "ddl_info.txt";
pub const BIG_LONG_TRX_FILE: &str = "biglong_trx.txt";

/// Totals over the whole job
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StatsSummary {
    pub records: u64,
    pub inserts: u64,
    pub updates: u64,
    pub deletes: u64,
    pub ddl: u64,
    pub transactions: u64,
    pub big_long_transactions: u64,
}

#[derive(Debug, Clone)]
struct TableStats {
    file: String,
    start_ts: u32,
    stop_ts: u32,
    start_pos: u32,
    stop_pos: u32,
    inserts: u64,
    updates: u64,
    deletes: u64,
}

#[derive(Debug, Clone)]
struct OpenTransaction {
    file: String,
    start_ts: u32,
    stop_ts: u32,
    start_pos: u32,
    stop_pos: u32,
    rows: usize,
    tables: BTreeSet<String>,
}

/// Per-window, per-table counters and transaction tracking
pub struct StatsAggregator {
    interval: u32,
    big_trx_rows: usize,
    long_trx_secs: u32,
    status: BufWriter<File>,
    ddl: BufWriter<File>,
    trx: BufWriter<File>,
    window_start: Option<u32>,
    window_file: String,
    tables: BTreeMap<(String, String), TableStats>,
    open_trx: Option<OpenTransaction>,
    summary: StatsSummary,
}

async fn create(dir: &Path, name: &str, header: &str) -> Result<BufWriter<File>> {
    let path: PathBuf = dir.join(name);
    let mut file = BufWriter::new(File::create(&path).await?);
    file.write_all(header.trim_end().as_bytes()).await?;
    file.write_all(b"\n").await?;
    Ok(file)
}

fn status_line(cols: [&str; 10]) -> String {
    format!(
        "{:<20} {:<20} {:<20} {:<10} {:<10} {:<8} {:<8} {:<8} {:<15} {:<20}",
        cols[0], cols[1], cols[2], cols[3], cols[4], cols[5], cols[6], cols[7], cols[8], cols[9]
    )
}

impl StatsAggregator {
    /// Create the report files in the job's output directory
    pub async fn create(job: &JobConfig) -> Result<Self> {
        let dir = &job.output_dir;
        let status = create(
            dir,
            STATUS_FILE,
            &status_line([
                "binlog", "starttime", "stoptime", "startpos", "stoppos", "inserts", "updates",
                "deletes", "database", "table",
            ]),
        )
        .await?;
        let ddl = create(
            dir,
            DDL_FILE,
            &format!("{:<20} {:<20} {:<10} {:<10} {}", "datetime", "binlog", "startpos", "stoppos", "sql"),
        )
        .await?;
        let trx = create(
            dir,
            BIG_LONG_TRX_FILE,
            &format!(
                "{:<20} {:<20} {:<20} {:<10} {:<10} {:<8} {:<10} {}",
                "binlog", "starttime", "stoptime", "startpos", "stoppos", "rows", "duration", "tables"
            ),
        )
        .await?;

        Ok(Self {
            interval: job.print_interval_secs.max(1),
            big_trx_rows: job.big_trx_row_limit,
            long_trx_secs: job.long_trx_seconds,
            status,
            ddl,
            trx,
            window_start: None,
            window_file: String::new(),
            tables: BTreeMap::new(),
            open_trx: None,
            summary: StatsSummary::default(),
        })
    }

    pub async fn run(mut self, mut rx: mpsc::Receiver<StatRecord>) -> Result<StatsSummary> {
        while let Some(record) = rx.recv().await {
            self.observe(record).await?;
        }

        self.flush_window().await?;
        self.status.flush().await?;
        self.ddl.flush().await?;
        self.trx.flush().await?;

        tracing::info!(
            records = self.summary.records,
            inserts = self.summary.inserts,
            updates = self.summary.updates,
            deletes = self.summary.deletes,
            "Finished binlog statistics"
        );
        Ok(self.summary)
    }

    async fn observe(&mut self, record: StatRecord) -> Result<()> {
        self.summary.records += 1;
        self.advance_window(&record).await?;

        match record.kind {
            OperationKind::Insert | OperationKind::Update | OperationKind::Delete => {
                self.count_rows(&record);
            }
            OperationKind::Ddl => self.log_ddl(&record).await?,
            OperationKind::Transaction => self.track_transaction(&record).await?,
            OperationKind::Statement => {}
        }
        Ok(())
    }

    /// Close the current window when binlog time passes its end or the file changes
    async fn advance_window(&mut self, record: &StatRecord) -> Result<()> {
        if record.timestamp == 0 {
            return Ok(());
        }
        match self.window_start {
            Some(start)
                if record.timestamp < start.saturating_add(self.interval)
                    && record.file == self.window_file => {}
            _ => {
                self.flush_window().await?;
                self.window_start = Some(record.timestamp);
                self.window_file = record.file.clone();
            }
        }
        Ok(())
    }

    async fn flush_window(&mut self) -> Result<()> {
        for ((database, table), stats) in std::mem::take(&mut self.tables) {
            let line = status_line([
                &stats.file,
                &format_timestamp(stats.start_ts),
                &format_timestamp(stats.stop_ts),
                &stats.start_pos.to_string(),
                &stats.stop_pos.to_string(),
                &stats.inserts.to_string(),
                &stats.updates.to_string(),
                &stats.deletes.to_string(),
                &database,
                &table,
            ]);
            self.status.write_all(line.trim_end().as_bytes()).await?;
            self.status.write_all(b"\n").await?;
        }
        Ok(())
    }

    fn count_rows(&mut self, record: &StatRecord) {
        let rows = record.row_count as u64;
        let stats = self
            .tables
            .entry((record.database.clone(), record.table.clone()))
            .or_insert_with(|| TableStats {
                file: record.file.clone(),
                start_ts: record.timestamp,
                stop_ts: record.timestamp,
                start_pos: record.start_pos,
                stop_pos: record.stop_pos,
                inserts: 0,
                updates: 0,
                deletes: 0,
            });
        stats.stop_ts = record.timestamp;
        stats.stop_pos = record.stop_pos;

        match record.kind {
            OperationKind::Insert => {
                stats.inserts += rows;
                self.summary.inserts += rows;
            }
            OperationKind::Update => {
                stats.updates += rows;
                self.summary.updates += rows;
            }
            _ => {
                stats.deletes += rows;
                self.summary.deletes += rows;
            }
        }

        if let Some(trx) = self.open_trx.as_mut() {
            trx.rows += record.row_count;
            trx.tables.insert(format!("{}.{}", record.database, record.table));
            trx.stop_ts = record.timestamp;
            trx.stop_pos = record.stop_pos;
        }
    }

    async fn log_ddl(&mut self, record: &StatRecord) -> Result<()> {
        self.summary.ddl += 1;
        let sql = record.query.split_whitespace().collect::<Vec<_>>().join(" ");
        let line = format!(
            "{:<20} {:<20} {:<10} {:<10} {}\n",
            format_timestamp(record.timestamp),
            record.file,
            record.start_pos,
            record.stop_pos,
            sql
        );
        self.ddl.write_all(line.as_bytes()).await?;
        Ok(())
    }

    async fn track_transaction(&mut self, record: &StatRecord) -> Result<()> {
        match record.query.trim().to_lowercase().as_str() {
            "begin" => {
                self.summary.transactions += 1;
                self.open_trx = Some(OpenTransaction {
                    file: record.file.clone(),
                    start_ts: record.timestamp,
                    stop_ts: record.timestamp,
                    start_pos: record.start_pos,
                    stop_pos: record.stop_pos,
                    rows: 0,
                    tables: BTreeSet::new(),
                });
            }
            "commit" | "rollback" => {
                let Some(mut trx) = self.open_trx.take() else {
                    return Ok(());
                };
                trx.stop_ts = record.timestamp;
                trx.stop_pos = record.stop_pos;
                self.report_transaction(&trx).await?;
            }
            _ => {}
        }
        Ok(())
    }

    async fn report_transaction(&mut self, trx: &OpenTransaction) -> Result<()> {
        let duration = trx.stop_ts.saturating_sub(trx.start_ts);
        if trx.rows < self.big_trx_rows && duration < self.long_trx_secs {
            return Ok(());
        }

        self.summary.big_long_transactions += 1;
        tracing::debug!(
            rows = trx.rows,
            duration = duration,
            "Big or long transaction in {} at {}",
            trx.file,
            trx.start_pos
        );

        let tables: Vec<&str> = trx.tables.iter().map(String::as_str).collect();
        let line = format!(
            "{:<20} {:<20} {:<20} {:<10} {:<10} {:<8} {:<10} [{}]\n",
            trx.file,
            format_timestamp(trx.start_ts),
            format_timestamp(trx.stop_ts),
            trx.start_pos,
            trx.stop_pos,
            trx.rows,
            duration,
            tables.join(" ")
        );
        self.trx.write_all(line.as_bytes()).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::report::parse_report_str;

    const TS: u32 = 1_768_986_000;

    fn stat(ts: u32, kind: OperationKind, table: &str, rows: usize, query: &str) -> StatRecord {
        StatRecord {
            timestamp: ts,
            file: "mysql-bin.000001".into(),
            start_pos: 100,
            stop_pos: 200,
            database: "shop".into(),
            table: table.into(),
            query: query.into(),
            row_count: rows,
            kind,
        }
    }

    async fn aggregate(job: &JobConfig, records: Vec<StatRecord>) -> StatsSummary {
        let aggregator = StatsAggregator::create(job).await.unwrap();
        let (tx, rx) = mpsc::channel(16);
        let handle = tokio::spawn(aggregator.run(rx));
        for record in records {
            tx.send(record).await.unwrap();
        }
        drop(tx);
        handle.await.unwrap().unwrap()
    }

    fn job(dir: &Path) -> JobConfig {
        JobConfig {
            threads: 1,
            output_dir: dir.to_path_buf(),
            big_trx_row_limit: 3,
            ..JobConfig::default()
        }
    }

    #[tokio::test]
    async fn test_counts_per_window_and_table() {
        let dir = tempfile::tempdir().unwrap();
        let summary = aggregate(
            &job(dir.path()),
            vec![
                stat(TS, OperationKind::Insert, "orders", 2, ""),
                stat(TS + 5, OperationKind::Update, "orders", 1, ""),
                stat(TS + 6, OperationKind::Delete, "items", 4, ""),
                // next 30 s window
                stat(TS + 40, OperationKind::Insert, "orders", 1, ""),
            ],
        )
        .await;

        assert_eq!(summary.inserts, 3);
        assert_eq!(summary.deletes, 4);

        let content = std::fs::read_to_string(dir.path().join(STATUS_FILE)).unwrap();
        assert_eq!(content.lines().count(), 4);
        assert!(content.starts_with("binlog"));

        let entries = parse_report_str(&content);
        let ops: Vec<(&str, &str, u64)> = entries
            .iter()
            .map(|e| (e.operation.as_str(), e.table.as_str(), e.records))
            .collect();
        assert_eq!(
            ops,
            vec![
                ("DELETE", "items", 4),
                ("INSERT", "orders", 2),
                ("UPDATE", "orders", 1),
                ("INSERT", "orders", 1),
            ]
        );
    }

    #[tokio::test]
    async fn test_ddl_and_big_transactions() {
        let dir = tempfile::tempdir().unwrap();
        let summary = aggregate(
            &job(dir.path()),
            vec![
                stat(TS, OperationKind::Ddl, "orders", 1, "ALTER TABLE orders\n  ADD note TEXT"),
                stat(TS, OperationKind::Transaction, "", 0, "BEGIN"),
                stat(TS, OperationKind::Insert, "orders", 5, ""),
                stat(TS + 1, OperationKind::Transaction, "", 0, "COMMIT"),
                stat(TS + 2, OperationKind::Transaction, "", 0, "BEGIN"),
                stat(TS + 2, OperationKind::Insert, "orders", 1, ""),
                stat(TS + 2, OperationKind::Transaction, "", 0, "COMMIT"),
            ],
        )
        .await;

        assert_eq!(summary.ddl, 1);
        assert_eq!(summary.transactions, 2);
        assert_eq!(summary.big_long_transactions, 1);

        let ddl = std::fs::read_to_string(dir.path().join(DDL_FILE)).unwrap();
        assert!(ddl.contains("ALTER TABLE orders ADD note TEXT"));

        let trx = std::fs::read_to_string(dir.path().join(BIG_LONG_TRX_FILE)).unwrap();
        assert_eq!(trx.lines().count(), 2);
        assert!(trx.contains("[shop.orders]"));
    }
}
