//! SQL reporter
//!
//! Single consumer of rendered SQL. Restores event order with a reorder
//! buffer keyed by `event_idx` and writes forward SQL as it becomes
//! contiguous, or rollback SQL in reverse event order once the stream ends.

use std::collections::BTreeMap;
use std::path::PathBuf;
use tokio::fs::File;
use tokio::io::{AsyncWrite, AsyncWriteExt, BufWriter};
use tokio::sync::mpsc;

use super::worker::RenderedSql;
use crate::config::{JobConfig, WorkType};
use crate::error::Result;

/// Events between progress log lines
const PROGRESS_EVERY: u64 = 1000;

/// TIMESTAMP literals are rendered in UTC
pub const SESSION_PREAMBLE: &str = "SET time_zone = '+00:00';";

pub const FORWARD_FILE: &str = "forward.sql";
pub const ROLLBACK_FILE: &str = "rollback.sql";

/// What the reporter wrote
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReportSummary {
    pub events: u64,
    pub statements: u64,
    /// `None` when printing to the screen
    pub output: Option<PathBuf>,
}

type Output = Box<dyn AsyncWrite + Unpin + Send>;

/// Ordered SQL writer
#[derive(Debug, Clone)]
pub struct Reporter {
    work_type: WorkType,
    to_screen: bool,
    output_dir: PathBuf,
}

impl Reporter {
    pub fn new(job: &JobConfig) -> Self {
        Self {
            work_type: job.work_type,
            to_screen: job.output_to_screen,
            output_dir: job.output_dir.clone(),
        }
    }

    /// File the SQL goes to, `None` for screen output
    pub fn output_path(&self) -> Option<PathBuf> {
        if self.to_screen {
            return None;
        }
        let name = match self.work_type {
            WorkType::Rollback => ROLLBACK_FILE,
            _ => FORWARD_FILE,
        };
        Some(self.output_dir.join(name))
    }

    async fn open(&self) -> Result<Output> {
        match self.output_path() {
            Some(path) => {
                tracing::info!("Writing SQL to {}", path.display());
                Ok(Box::new(BufWriter::new(File::create(&path).await?)))
            }
            None => Ok(Box::new(tokio::io::stdout())),
        }
    }

    pub async fn run(self, mut rx: mpsc::Receiver<RenderedSql>) -> Result<ReportSummary> {
        let mut out = self.open().await?;
        out.write_all(SESSION_PREAMBLE.as_bytes()).await?;
        out.write_all(b"\n").await?;
        let mut summary = ReportSummary {
            output: self.output_path(),
            ..ReportSummary::default()
        };

        let mut pending: BTreeMap<u64, RenderedSql> = BTreeMap::new();
        let mut next_idx = 1u64;
        let mut undo: Vec<RenderedSql> = Vec::new();

        while let Some(sql) = rx.recv().await {
            pending.insert(sql.event_idx, sql);

            while let Some(sql) = pending.remove(&next_idx) {
                next_idx += 1;
                self.emit(&mut out, sql, &mut undo, &mut summary).await?;
            }
        }

        if !pending.is_empty() {
            tracing::warn!(
                "{} rendered events never became contiguous after index {}",
                pending.len(),
                next_idx
            );
            for (_, sql) in std::mem::take(&mut pending) {
                self.emit(&mut out, sql, &mut undo, &mut summary).await?;
            }
        }

        for sql in undo.iter().rev() {
            summary.statements += write_block(&mut out, sql.header.as_deref(), &sql.rollback).await?;
        }

        out.flush().await?;
        tracing::info!(
            events = summary.events,
            statements = summary.statements,
            "Finished writing SQL"
        );
        Ok(summary)
    }

    async fn emit(
        &self,
        out: &mut Output,
        sql: RenderedSql,
        undo: &mut Vec<RenderedSql>,
        summary: &mut ReportSummary,
    ) -> Result<()> {
        summary.events += 1;
        if summary.events % PROGRESS_EVERY == 0 {
            tracing::info!("Generated SQL for {} events (at event {})", summary.events, sql.event_idx);
        }

        match self.work_type {
            WorkType::Rollback => undo.push(sql),
            _ => {
                summary.statements +=
                    write_block(out, sql.header.as_deref(), &sql.forward).await?;
            }
        }
        Ok(())
    }
}

async fn write_block(out: &mut Output, header: Option<&str>, statements: &[String]) -> Result<u64> {
    if statements.is_empty() {
        return Ok(0);
    }
    if let Some(header) = header {
        out.write_all(header.as_bytes()).await?;
        out.write_all(b"\n").await?;
    }
    for statement in statements {
        out.write_all(statement.as_bytes()).await?;
        out.write_all(b"\n").await?;
    }
    Ok(statements.len() as u64)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rendered(idx: u64) -> RenderedSql {
        RenderedSql {
            event_idx: idx,
            header: Some(format!("# event {}", idx)),
            forward: vec![format!("INSERT INTO t VALUES ({});", idx)],
            rollback: vec![format!("DELETE FROM t WHERE id={} LIMIT 1;", idx)],
        }
    }

    fn job(dir: &std::path::Path, work_type: WorkType) -> JobConfig {
        JobConfig {
            work_type,
            threads: 1,
            output_dir: dir.to_path_buf(),
            ..JobConfig::default()
        }
    }

    async fn feed(reporter: Reporter, order: &[u64]) -> ReportSummary {
        let (tx, rx) = mpsc::channel(16);
        let handle = tokio::spawn(reporter.run(rx));
        for &idx in order {
            tx.send(rendered(idx)).await.unwrap();
        }
        drop(tx);
        handle.await.unwrap().unwrap()
    }

    #[tokio::test]
    async fn test_forward_sql_in_event_order() {
        let dir = tempfile::tempdir().unwrap();
        let summary = feed(Reporter::new(&job(dir.path(), WorkType::ToSql)), &[3, 1, 2, 4]).await;
        assert_eq!(summary.events, 4);
        assert_eq!(summary.statements, 4);

        let content = std::fs::read_to_string(dir.path().join(FORWARD_FILE)).unwrap();
        let inserts: Vec<&str> = content.lines().filter(|l| l.starts_with("INSERT")).collect();
        assert_eq!(
            inserts,
            vec![
                "INSERT INTO t VALUES (1);",
                "INSERT INTO t VALUES (2);",
                "INSERT INTO t VALUES (3);",
                "INSERT INTO t VALUES (4);",
            ]
        );
        assert!(content.starts_with(&format!("{}\n# event 1\n", SESSION_PREAMBLE)));
    }

    #[tokio::test]
    async fn test_rollback_sql_in_reverse_order() {
        let dir = tempfile::tempdir().unwrap();
        feed(Reporter::new(&job(dir.path(), WorkType::Rollback)), &[2, 1, 3]).await;

        let content = std::fs::read_to_string(dir.path().join(ROLLBACK_FILE)).unwrap();
        let deletes: Vec<&str> = content.lines().filter(|l| l.starts_with("DELETE")).collect();
        assert_eq!(
            deletes,
            vec![
                "DELETE FROM t WHERE id=3 LIMIT 1;",
                "DELETE FROM t WHERE id=2 LIMIT 1;",
                "DELETE FROM t WHERE id=1 LIMIT 1;",
            ]
        );
        assert!(!dir.path().join(FORWARD_FILE).exists());
    }

    #[tokio::test]
    async fn test_outputs_pin_session_time_zone() {
        for work_type in [WorkType::ToSql, WorkType::Rollback] {
            let dir = tempfile::tempdir().unwrap();
            let reporter = Reporter::new(&job(dir.path(), work_type));
            let path = reporter.output_path().unwrap();
            feed(reporter, &[1]).await;

            let content = std::fs::read_to_string(path).unwrap();
            assert_eq!(content.lines().next(), Some("SET time_zone = '+00:00';"));
        }
    }

    #[tokio::test]
    async fn test_empty_placeholder_keeps_order_moving() {
        let dir = tempfile::tempdir().unwrap();
        let reporter = Reporter::new(&job(dir.path(), WorkType::ToSql));
        let (tx, rx) = mpsc::channel(16);
        let handle = tokio::spawn(reporter.run(rx));
        tx.send(rendered(2)).await.unwrap();
        tx.send(RenderedSql::empty(1)).await.unwrap();
        drop(tx);

        let summary = handle.await.unwrap().unwrap();
        assert_eq!(summary.events, 2);
        assert_eq!(summary.statements, 1);
    }
}
