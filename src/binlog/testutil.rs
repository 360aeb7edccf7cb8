//! Builders for binlog event bytes and an in-memory event source

use async_trait::async_trait;
use bytes::Bytes;
use std::collections::VecDeque;
use std::time::Duration;

use super::event::{event_type, EventFramer, RawEvent, EVENT_HEADER_LEN};
use super::packet::write_lenenc_int;
use super::rows::{column_type as ct, ColumnValue};
use super::EventSource;
use crate::error::{Error, Result};

/// Builds complete events (header, body and optional CRC32)
#[derive(Debug, Clone, Copy)]
pub struct EventBuilder {
    timestamp: u32,
    log_pos: u32,
    server_id: u32,
    flags: u16,
    checksum: bool,
}

impl EventBuilder {
    pub fn new(timestamp: u32, log_pos: u32) -> Self {
        Self {
            timestamp,
            log_pos,
            server_id: 1,
            flags: 0,
            checksum: false,
        }
    }

    pub fn with_checksum(mut self) -> Self {
        self.checksum = true;
        self
    }

    pub fn artificial(mut self) -> Self {
        self.flags |= super::event::LOG_EVENT_ARTIFICIAL_F;
        self
    }

    pub fn at(mut self, timestamp: u32, log_pos: u32) -> Self {
        self.timestamp = timestamp;
        self.log_pos = log_pos;
        self
    }

    pub fn build(&self, type_code: u8, body: &[u8]) -> Bytes {
        let checksummed = self.checksum && type_code != event_type::HEARTBEAT_LOG_EVENT;
        let size = EVENT_HEADER_LEN + body.len() + if checksummed { 4 } else { 0 };

        let mut buf = Vec::with_capacity(size);
        buf.extend_from_slice(&self.timestamp.to_le_bytes());
        buf.push(type_code);
        buf.extend_from_slice(&self.server_id.to_le_bytes());
        buf.extend_from_slice(&(size as u32).to_le_bytes());
        buf.extend_from_slice(&self.log_pos.to_le_bytes());
        buf.extend_from_slice(&self.flags.to_le_bytes());
        buf.extend_from_slice(body);
        if checksummed {
            let crc = crc32fast::hash(&buf);
            buf.extend_from_slice(&crc.to_le_bytes());
        }
        Bytes::from(buf)
    }

    pub fn format_description(&self, server_version: &str) -> Bytes {
        let mut body = Vec::new();
        body.extend_from_slice(&4u16.to_le_bytes());
        let mut version = [0u8; 50];
        version[..server_version.len()].copy_from_slice(server_version.as_bytes());
        body.extend_from_slice(&version);
        body.extend_from_slice(&self.timestamp.to_le_bytes());
        body.push(EVENT_HEADER_LEN as u8);
        body.extend_from_slice(&[0u8; 38]);

        if self.checksum {
            // build() appends the CRC
            body.push(1);
            return self.build(event_type::FORMAT_DESCRIPTION_EVENT, &body);
        }
        body.push(0);
        body.extend_from_slice(&[0u8; 4]);
        self.build(event_type::FORMAT_DESCRIPTION_EVENT, &body)
    }

    pub fn query(&self, database: &str, query: &str) -> Bytes {
        let mut body = Vec::new();
        body.extend_from_slice(&7u32.to_le_bytes());
        body.extend_from_slice(&0u32.to_le_bytes());
        body.push(database.len() as u8);
        body.extend_from_slice(&0u16.to_le_bytes());
        body.extend_from_slice(&0u16.to_le_bytes());
        body.extend_from_slice(database.as_bytes());
        body.push(0);
        body.extend_from_slice(query.as_bytes());
        self.build(event_type::QUERY_EVENT, &body)
    }

    pub fn xid(&self, xid: u64) -> Bytes {
        self.build(event_type::XID_EVENT, &xid.to_le_bytes())
    }

    pub fn rotate(&self, next_file: &str, position: u64) -> Bytes {
        let mut body = position.to_le_bytes().to_vec();
        body.extend_from_slice(next_file.as_bytes());
        self.build(event_type::ROTATE_EVENT, &body)
    }

    pub fn heartbeat(&self) -> Bytes {
        self.build(event_type::HEARTBEAT_LOG_EVENT, b"mysql-bin.000001")
    }

    pub fn table_map(&self, table_id: u64, schema: &str, table: &str, columns: &[(u8, u16)]) -> Bytes {
        self.build(
            event_type::TABLE_MAP_EVENT,
            &table_map_body(table_id, schema, table, columns),
        )
    }

    pub fn write_rows(&self, table_id: u64, types: &[u8], rows: &[Vec<Option<ColumnValue>>]) -> Bytes {
        self.build(event_type::WRITE_ROWS_EVENT, &rows_body(table_id, types, rows, false))
    }

    pub fn delete_rows(&self, table_id: u64, types: &[u8], rows: &[Vec<Option<ColumnValue>>]) -> Bytes {
        self.build(event_type::DELETE_ROWS_EVENT, &rows_body(table_id, types, rows, false))
    }

    /// `rows` holds before/after images interleaved
    pub fn update_rows(&self, table_id: u64, types: &[u8], rows: &[Vec<Option<ColumnValue>>]) -> Bytes {
        self.build(event_type::UPDATE_ROWS_EVENT, &rows_body(table_id, types, rows, true))
    }
}

/// TABLE_MAP body; every column is nullable
pub fn table_map_body(table_id: u64, schema: &str, table: &str, columns: &[(u8, u16)]) -> Vec<u8> {
    let mut body = Vec::new();
    body.extend_from_slice(&table_id.to_le_bytes()[..6]);
    body.extend_from_slice(&1u16.to_le_bytes());
    body.push(schema.len() as u8);
    body.extend_from_slice(schema.as_bytes());
    body.push(0);
    body.push(table.len() as u8);
    body.extend_from_slice(table.as_bytes());
    body.push(0);

    write_lenenc_int(&mut body, columns.len() as u64);
    body.extend(columns.iter().map(|(t, _)| *t));

    let mut meta = Vec::new();
    for &(t, m) in columns {
        match t {
            ct::FLOAT | ct::DOUBLE | ct::BLOB | ct::GEOMETRY | ct::JSON | ct::TIME2
            | ct::DATETIME2 | ct::TIMESTAMP2 => meta.push(m as u8),
            ct::VARCHAR | ct::VAR_STRING | ct::BIT => meta.extend_from_slice(&m.to_le_bytes()),
            ct::NEWDECIMAL | ct::STRING | ct::ENUM | ct::SET => {
                meta.extend_from_slice(&m.to_be_bytes())
            }
            _ => {}
        }
    }
    write_lenenc_int(&mut body, meta.len() as u64);
    body.extend_from_slice(&meta);
    body.extend(std::iter::repeat(0xFF).take(columns.len().div_ceil(8)));
    body
}

/// Rows v2 body. Presence bitmaps come from the first row (and the second
/// one for updates); `None` slots are left out of the image.
pub fn rows_body(
    table_id: u64,
    types: &[u8],
    rows: &[Vec<Option<ColumnValue>>],
    update: bool,
) -> Vec<u8> {
    let mut body = Vec::new();
    body.extend_from_slice(&table_id.to_le_bytes()[..6]);
    body.extend_from_slice(&0u16.to_le_bytes());
    body.extend_from_slice(&2u16.to_le_bytes());
    write_lenenc_int(&mut body, types.len() as u64);

    let present = |row: Option<&Vec<Option<ColumnValue>>>| -> Vec<u8> {
        let mut bitmap = vec![0u8; types.len().div_ceil(8)];
        for idx in 0..types.len() {
            let is_present = row.map(|r| r[idx].is_some()).unwrap_or(true);
            if is_present {
                bitmap[idx / 8] |= 1 << (idx % 8);
            }
        }
        bitmap
    };

    body.extend_from_slice(&present(rows.first()));
    if update {
        body.extend_from_slice(&present(rows.get(1)));
    }

    for row in rows {
        let values: Vec<(usize, &ColumnValue)> = row
            .iter()
            .enumerate()
            .filter_map(|(i, v)| v.as_ref().map(|v| (i, v)))
            .collect();

        let mut nulls = vec![0u8; values.len().div_ceil(8)];
        for (slot, (_, value)) in values.iter().enumerate() {
            if value.is_null() {
                nulls[slot / 8] |= 1 << (slot % 8);
            }
        }
        body.extend_from_slice(&nulls);

        for (idx, value) in values {
            encode_value(&mut body, types[idx], value);
        }
    }

    body
}

fn encode_value(buf: &mut Vec<u8>, col_type: u8, value: &ColumnValue) {
    match (col_type, value) {
        (_, ColumnValue::Null) => {}
        (ct::TINY, ColumnValue::Int(v)) => buf.push(*v as u8),
        (ct::SHORT, ColumnValue::Int(v)) => buf.extend_from_slice(&(*v as i16).to_le_bytes()),
        (ct::INT24, ColumnValue::Int(v)) => buf.extend_from_slice(&(*v as i32).to_le_bytes()[..3]),
        (ct::LONG, ColumnValue::Int(v)) => buf.extend_from_slice(&(*v as i32).to_le_bytes()),
        (ct::LONGLONG, ColumnValue::Int(v)) => buf.extend_from_slice(&v.to_le_bytes()),
        (ct::DOUBLE, ColumnValue::Double(v)) => buf.extend_from_slice(&v.to_le_bytes()),
        (ct::VARCHAR | ct::STRING, ColumnValue::Bytes(b)) => {
            buf.push(b.len() as u8);
            buf.extend_from_slice(b);
        }
        other => panic!("unsupported test value {:?}", other),
    }
}

/// Event source over a fixed list of events
///
/// Once drained it reports `Timeout` (idle server) or end of stream.
pub struct MemorySource {
    events: VecDeque<Result<RawEvent>>,
    end_of_stream: bool,
}

impl MemorySource {
    /// Frame `events` through a non-verifying framer
    pub fn new(events: Vec<Bytes>) -> Self {
        let mut framer = EventFramer::new(false);
        Self {
            events: events.into_iter().map(|e| framer.frame(e)).collect(),
            end_of_stream: false,
        }
    }

    pub fn ending_with_eof(mut self) -> Self {
        self.end_of_stream = true;
        self
    }

    pub fn push_error(&mut self, error: Error) {
        self.events.push_back(Err(error));
    }
}

#[async_trait]
impl EventSource for MemorySource {
    async fn next_event(&mut self, _deadline: Option<Duration>) -> Result<Option<RawEvent>> {
        match self.events.pop_front() {
            Some(event) => event.map(Some),
            None if self.end_of_stream => Ok(None),
            None => Err(Error::Timeout),
        }
    }
}
