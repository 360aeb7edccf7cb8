//! Local binlog file reader
//!
//! Replays binlog files from disk through the same framing as the
//! replication stream. Each file is announced with an artificial ROTATE,
//! the way the server does at the start of a dump.

use async_trait::async_trait;
use bytes::{BufMut, Bytes, BytesMut};
use std::collections::VecDeque;
use std::io::SeekFrom;
use std::path::PathBuf;
use std::time::Duration;
use tokio::fs::File;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncSeekExt, BufReader};

use super::event::{
    event_type, EventFramer, EventHeader, RawEvent, EVENT_HEADER_LEN, LOG_EVENT_ARTIFICIAL_F,
};
use super::EventSource;
use crate::config::BINLOG_START_POS;
use crate::error::{Error, Result};

/// Magic header at the start of every binlog file
pub const BINLOG_MAGIC: [u8; 4] = [0xFE, b'b', b'i', b'n'];

struct OpenFile {
    reader: BufReader<File>,
    /// Offset to jump to once FORMAT_DESCRIPTION has been read
    seek_to: Option<u32>,
}

/// Event source over local binlog files, oldest first
pub struct BinlogFileReader {
    pending: VecDeque<PathBuf>,
    current: Option<OpenFile>,
    start_pos: u32,
    framer: EventFramer,
}

impl BinlogFileReader {
    /// Read `files` in order, starting the first one at `start_pos`
    pub fn new(files: Vec<PathBuf>, start_pos: u32, verify_checksum: bool) -> Self {
        Self {
            pending: files.into(),
            current: None,
            start_pos,
            framer: EventFramer::new(verify_checksum),
        }
    }

    /// Base name of a binlog path
    pub fn file_name(path: &std::path::Path) -> String {
        path.file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| path.to_string_lossy().to_string())
    }

    async fn open_next(&mut self) -> Result<Option<RawEvent>> {
        let Some(path) = self.pending.pop_front() else {
            return Ok(None);
        };

        let mut reader = BufReader::new(File::open(&path).await?);
        let mut magic = [0u8; 4];
        reader.read_exact(&mut magic).await?;
        if magic != BINLOG_MAGIC {
            return Err(Error::Decode(format!(
                "{} is not a binlog file",
                path.display()
            )));
        }

        // Only the first file honours the configured start position
        let start = std::mem::replace(&mut self.start_pos, BINLOG_START_POS);
        let name = Self::file_name(&path);
        tracing::info!("Reading binlog file {} from position {}", path.display(), start);

        self.current = Some(OpenFile {
            reader,
            seek_to: (start > BINLOG_START_POS).then_some(start),
        });

        Ok(Some(artificial_rotate(&name, start)))
    }

    async fn read_from_current(&mut self) -> Result<Option<RawEvent>> {
        let Some(file) = self.current.as_mut() else {
            return Ok(None);
        };

        if file.reader.fill_buf().await?.is_empty() {
            self.current = None;
            return Ok(None);
        }

        let mut header = [0u8; EVENT_HEADER_LEN];
        file.reader.read_exact(&mut header).await?;
        let parsed = EventHeader::parse(&header)?;
        let size = parsed.event_size as usize;
        if size < EVENT_HEADER_LEN {
            return Err(Error::Decode(format!(
                "invalid event size {} before position {}",
                size, parsed.log_pos
            )));
        }

        let mut buf = BytesMut::with_capacity(size);
        buf.put_slice(&header);
        buf.resize(size, 0);
        file.reader.read_exact(&mut buf[EVENT_HEADER_LEN..]).await?;

        let event = self.framer.frame(buf.freeze())?;

        if event.header.event_type == event_type::FORMAT_DESCRIPTION_EVENT {
            if let Some(pos) = file.seek_to.take() {
                file.reader.seek(SeekFrom::Start(pos as u64)).await?;
            }
        }

        Ok(Some(event))
    }
}

/// Rotate event announcing `file` at `pos`, flagged as server-generated
fn artificial_rotate(file: &str, pos: u32) -> RawEvent {
    let mut body = BytesMut::with_capacity(8 + file.len());
    body.put_u64_le(pos as u64);
    body.put_slice(file.as_bytes());

    RawEvent {
        header: EventHeader {
            timestamp: 0,
            event_type: event_type::ROTATE_EVENT,
            server_id: 0,
            event_size: (EVENT_HEADER_LEN + body.len()) as u32,
            log_pos: 0,
            flags: LOG_EVENT_ARTIFICIAL_F,
        },
        body: Bytes::from(body),
    }
}

#[async_trait]
impl EventSource for BinlogFileReader {
    async fn next_event(&mut self, _deadline: Option<Duration>) -> Result<Option<RawEvent>> {
        loop {
            if self.current.is_some() {
                if let Some(event) = self.read_from_current().await? {
                    return Ok(Some(event));
                }
                continue;
            }

            return self.open_next().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::binlog::event::{BinlogEvent, EventDecoder};
    use crate::binlog::testutil::EventBuilder;

    fn write_binlog(dir: &std::path::Path, name: &str, events: &[Bytes]) -> PathBuf {
        let path = dir.join(name);
        let mut data = BINLOG_MAGIC.to_vec();
        for event in events {
            data.extend_from_slice(event);
        }
        std::fs::write(&path, data).unwrap();
        path
    }

    #[tokio::test]
    async fn test_reads_files_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let b = EventBuilder::new(1_700_000_000, 0).with_checksum();

        let fde = b.at(1_700_000_000, 124).format_description("8.0.36");
        let first = write_binlog(
            dir.path(),
            "mysql-bin.000001",
            &[fde.clone(), b.at(1_700_000_001, 200).query("shop", "BEGIN")],
        );
        let second = write_binlog(
            dir.path(),
            "mysql-bin.000002",
            &[fde, b.at(1_700_000_002, 200).xid(5)],
        );

        let mut reader = BinlogFileReader::new(vec![first, second], BINLOG_START_POS, true);
        let mut decoder = EventDecoder::new();
        let mut seen = Vec::new();
        while let Some(raw) = reader.next_event(None).await.unwrap() {
            seen.push(decoder.decode(&raw).unwrap());
        }

        assert_eq!(seen.len(), 6);
        assert!(matches!(&seen[0], BinlogEvent::Rotate { next_file, .. } if next_file == "mysql-bin.000001"));
        assert!(matches!(&seen[1], BinlogEvent::FormatDescription(_)));
        assert!(matches!(&seen[2], BinlogEvent::Query { query, .. } if query == "BEGIN"));
        assert!(matches!(&seen[3], BinlogEvent::Rotate { next_file, .. } if next_file == "mysql-bin.000002"));
        assert!(matches!(&seen[5], BinlogEvent::Xid { xid: 5 }));
    }

    #[tokio::test]
    async fn test_start_position_skips_events() {
        let dir = tempfile::tempdir().unwrap();
        let b = EventBuilder::new(1_700_000_000, 0);

        let fde = b.format_description("8.0.36");
        let q1 = b.query("shop", "BEGIN");
        let xid = b.xid(9);
        let skip_to = (4 + fde.len() + q1.len()) as u32;
        let path = write_binlog(dir.path(), "binlog.000010", &[fde, q1, xid]);

        let mut reader = BinlogFileReader::new(vec![path], skip_to, false);
        let mut decoder = EventDecoder::new();
        let mut seen = Vec::new();
        while let Some(raw) = reader.next_event(None).await.unwrap() {
            seen.push(decoder.decode(&raw).unwrap());
        }

        assert_eq!(seen.len(), 3);
        assert!(matches!(&seen[2], BinlogEvent::Xid { xid: 9 }));
    }

    #[tokio::test]
    async fn test_rejects_non_binlog() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("notes.txt");
        std::fs::write(&path, b"hello world").unwrap();

        let mut reader = BinlogFileReader::new(vec![path], BINLOG_START_POS, true);
        assert!(matches!(reader.next_event(None).await, Err(Error::Decode(_))));
    }
}
