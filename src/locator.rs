//! Stream position locator
//!
//! Picks the binlog file a job starts from: the newest file that began at
//! or before the requested start datetime. File start times are probed by
//! opening a short-lived replication session per candidate.

use async_trait::async_trait;
use rand::Rng;
use std::time::Duration;

use crate::binlog::{EventSource, Position, ReplicationStream};
use crate::catalog::Catalog;
use crate::config::{BinlensConfig, DatabaseConfig, BINLOG_START_POS};
use crate::error::{Error, Result};

/// Range of the throwaway server ids used by probes
const PROBE_SERVER_IDS: std::ops::Range<u32> = 2000..12000;

/// Reports the approximate start time of a binlog file
#[async_trait]
pub trait StartTimeProbe: Send + Sync {
    /// Timestamp of the first event in `file` carrying one
    async fn start_time(&self, file: &str) -> Result<u32>;
}

/// Probe that opens a replication session at offset 4 of the file
pub struct ReplicationProbe {
    database: DatabaseConfig,
    timeout: Duration,
}

impl ReplicationProbe {
    pub fn new(database: DatabaseConfig, timeout: Duration) -> Self {
        Self { database, timeout }
    }

    async fn first_timestamp(&self, file: &str) -> Result<u32> {
        let server_id = rand::thread_rng().gen_range(PROBE_SERVER_IDS);
        let start = Position::new(file, BINLOG_START_POS);
        let mut stream = ReplicationStream::connect(&self.database, server_id, &start, false).await?;

        // The dump opens with an artificial ROTATE that has no timestamp
        loop {
            match stream.next_event(None).await? {
                Some(event) if event.header.timestamp != 0 => return Ok(event.header.timestamp),
                Some(_) => continue,
                None => {
                    return Err(Error::Protocol(format!(
                        "binlog {} ended before any timestamped event",
                        file
                    )))
                }
            }
        }
    }
}

#[async_trait]
impl StartTimeProbe for ReplicationProbe {
    async fn start_time(&self, file: &str) -> Result<u32> {
        tokio::time::timeout(self.timeout, self.first_timestamp(file))
            .await
            .map_err(|_| Error::Timeout)?
    }
}

/// Binary search for the rightmost file whose start time is at or before `target`
///
/// A file whose probe times out is treated as starting after the target,
/// which can only move the result to an earlier file; the datetime filter
/// skips the extra events. Any other probe failure means the file cannot be
/// opened and ends the search.
pub async fn locate_start_file(
    files: &[String],
    target: u32,
    probe: &dyn StartTimeProbe,
) -> Result<String> {
    match files {
        [] => return Err(Error::NoBinaryLogs),
        [only] => return Ok(only.clone()),
        _ => {}
    }

    let (mut lo, mut hi) = (0usize, files.len());
    let mut result = 0usize;

    while lo < hi {
        let mid = lo + (hi - lo) / 2;
        match probe.start_time(&files[mid]).await {
            Ok(started) if started <= target => {
                tracing::debug!(file = %files[mid], started, target, "Binlog starts before target");
                result = mid;
                lo = mid + 1;
            }
            Ok(started) => {
                tracing::debug!(file = %files[mid], started, target, "Binlog starts after target");
                hi = mid;
            }
            Err(Error::Timeout) => {
                tracing::warn!("Timed out reading start time of {}", files[mid]);
                hi = mid;
            }
            Err(e) => {
                tracing::error!("Failed to open binlog {}: {}", files[mid], e);
                return Err(e);
            }
        }
    }

    Ok(files[result].clone())
}

/// Start position of a replication job
///
/// An explicit start file wins. Otherwise the server's binlog list is
/// searched for the start datetime, or the oldest file is used.
pub async fn resolve_start(config: &BinlensConfig, catalog: &Catalog) -> Result<Position> {
    let job = &config.job;
    if let Some(file) = &job.start_file {
        let pos = job.start_position.unwrap_or(BINLOG_START_POS);
        tracing::info!("Starting from configured position ({}, {})", file, pos);
        return Ok(Position::new(file.clone(), pos));
    }

    let files = catalog.binlog_files().await.map_err(|e| {
        tracing::error!("Failed to list binary logs: {}", e);
        e
    })?;

    let file = match job.start_timestamp()? {
        Some(target) => {
            let probe = ReplicationProbe::new(config.database.clone(), job.probe_timeout());
            locate_start_file(&files, target, &probe).await?
        }
        None => files
            .first()
            .cloned()
            .ok_or(Error::NoBinaryLogs)?,
    };

    tracing::info!("Starting from binlog file {}", file);
    Ok(Position::new(file, BINLOG_START_POS))
}
