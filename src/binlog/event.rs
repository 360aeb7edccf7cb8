//! Binlog Event Types
//!
//! Event framing (header, checksum) and decoding of the event bodies a
//! binlog analyser cares about.

use bytes::Bytes;
use std::collections::HashMap;
use std::sync::Arc;

use super::rows::{parse_rows, parse_table_map, RowsEvent, RowsKind, TableMapEvent};
use crate::error::{Error, Result};

/// Size of a v4 event header
pub const EVENT_HEADER_LEN: usize = 19;

/// Size of a CRC32 event checksum
pub const CHECKSUM_LEN: usize = 4;

/// Event was generated by the server, not read from the binlog
pub const LOG_EVENT_ARTIFICIAL_F: u16 = 0x20;

/// Binlog event type codes (MariaDB/MySQL)
pub mod event_type {
    use super::RowsKind;

    pub const QUERY_EVENT: u8 = 2;
    pub const STOP_EVENT: u8 = 3;
    pub const ROTATE_EVENT: u8 = 4;
    pub const FORMAT_DESCRIPTION_EVENT: u8 = 15;
    pub const XID_EVENT: u8 = 16;
    pub const TABLE_MAP_EVENT: u8 = 19;
    pub const WRITE_ROWS_EVENT_V1: u8 = 23;
    pub const UPDATE_ROWS_EVENT_V1: u8 = 24;
    pub const DELETE_ROWS_EVENT_V1: u8 = 25;
    pub const HEARTBEAT_LOG_EVENT: u8 = 27;
    pub const ROWS_QUERY_LOG_EVENT: u8 = 29;
    pub const WRITE_ROWS_EVENT: u8 = 30;
    pub const UPDATE_ROWS_EVENT: u8 = 31;
    pub const DELETE_ROWS_EVENT: u8 = 32;
    pub const GTID_LOG_EVENT: u8 = 33;
    pub const ANONYMOUS_GTID_LOG_EVENT: u8 = 34;

    // MariaDB specific
    pub const MARIADB_ANNOTATE_ROWS_EVENT: u8 = 160;
    pub const MARIADB_GTID_EVENT: u8 = 162;

    /// Row kind and v2 layout of a rows event type
    pub fn rows_kind(code: u8) -> Option<(RowsKind, bool)> {
        match code {
            WRITE_ROWS_EVENT_V1 => Some((RowsKind::Write, false)),
            UPDATE_ROWS_EVENT_V1 => Some((RowsKind::Update, false)),
            DELETE_ROWS_EVENT_V1 => Some((RowsKind::Delete, false)),
            WRITE_ROWS_EVENT => Some((RowsKind::Write, true)),
            UPDATE_ROWS_EVENT => Some((RowsKind::Update, true)),
            DELETE_ROWS_EVENT => Some((RowsKind::Delete, true)),
            _ => None,
        }
    }

    /// Events the classifier turns into change or transaction records
    pub fn is_change_event(code: u8) -> bool {
        matches!(code, QUERY_EVENT | XID_EVENT) || rows_kind(code).is_some()
    }
}

/// v4 event header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EventHeader {
    pub timestamp: u32,
    pub event_type: u8,
    pub server_id: u32,
    pub event_size: u32,
    /// Offset of the next event in the current file
    pub log_pos: u32,
    pub flags: u16,
}

impl EventHeader {
    pub fn parse(data: &[u8]) -> Result<Self> {
        if data.len() < EVENT_HEADER_LEN {
            return Err(Error::Decode(format!(
                "event too short: {} bytes",
                data.len()
            )));
        }

        let u32_at = |i: usize| u32::from_le_bytes([data[i], data[i + 1], data[i + 2], data[i + 3]]);

        Ok(Self {
            timestamp: u32_at(0),
            event_type: data[4],
            server_id: u32_at(5),
            event_size: u32_at(9),
            log_pos: u32_at(13),
            flags: u16::from_le_bytes([data[17], data[18]]),
        })
    }

    /// Offset of this event in the current file
    pub fn start_pos(&self) -> u32 {
        self.log_pos.saturating_sub(self.event_size)
    }

    pub fn is_artificial(&self) -> bool {
        self.flags & LOG_EVENT_ARTIFICIAL_F != 0
    }
}

/// A framed event: header plus body with any checksum removed
///
/// FORMAT_DESCRIPTION bodies are kept whole so the checksum algorithm
/// byte stays at a fixed offset from the end.
#[derive(Debug, Clone, PartialEq)]
pub struct RawEvent {
    pub header: EventHeader,
    pub body: Bytes,
}

/// Checksum algorithm announced by FORMAT_DESCRIPTION
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ChecksumAlg {
    #[default]
    Off,
    Crc32,
}

/// Splits raw event bytes into header and body, tracking the checksum state
#[derive(Debug, Default)]
pub struct EventFramer {
    checksum: ChecksumAlg,
    verify: bool,
}

impl EventFramer {
    pub fn new(verify: bool) -> Self {
        Self {
            checksum: ChecksumAlg::Off,
            verify,
        }
    }

    pub fn checksum(&self) -> ChecksumAlg {
        self.checksum
    }

    pub fn frame(&mut self, data: Bytes) -> Result<RawEvent> {
        let header = EventHeader::parse(&data)?;
        let size = header.event_size as usize;
        if size < EVENT_HEADER_LEN || data.len() < size {
            return Err(Error::Decode(format!(
                "event size {} does not match {} bytes received",
                size,
                data.len()
            )));
        }
        let data = data.slice(..size);

        if header.event_type == event_type::FORMAT_DESCRIPTION_EVENT {
            let fde = parse_format_description(&data[EVENT_HEADER_LEN..])?;
            self.checksum = fde.checksum;
            if fde.checksum == ChecksumAlg::Crc32 {
                self.check_crc(&header, &data)?;
            }
            return Ok(RawEvent {
                header,
                body: data.slice(EVENT_HEADER_LEN..),
            });
        }

        let checksummed = self.checksum == ChecksumAlg::Crc32
            && header.event_type != event_type::HEARTBEAT_LOG_EVENT
            && data.len() >= EVENT_HEADER_LEN + CHECKSUM_LEN;

        if !checksummed {
            return Ok(RawEvent {
                header,
                body: data.slice(EVENT_HEADER_LEN..),
            });
        }

        if header.event_type == event_type::ROTATE_EVENT && header.is_artificial() {
            // Fake rotates are sometimes sent without a checksum
            if !crc_matches(&data) {
                return Ok(RawEvent {
                    header,
                    body: data.slice(EVENT_HEADER_LEN..),
                });
            }
        } else if self.verify {
            self.check_crc(&header, &data)?;
        }

        Ok(RawEvent {
            header,
            body: data.slice(EVENT_HEADER_LEN..size - CHECKSUM_LEN),
        })
    }

    fn check_crc(&self, header: &EventHeader, data: &[u8]) -> Result<()> {
        if self.verify && !crc_matches(data) {
            return Err(Error::ChecksumMismatch {
                log_pos: header.log_pos,
            });
        }
        Ok(())
    }
}

fn crc_matches(data: &[u8]) -> bool {
    if data.len() < CHECKSUM_LEN {
        return false;
    }
    let (content, trailer) = data.split_at(data.len() - CHECKSUM_LEN);
    let expected = u32::from_le_bytes([trailer[0], trailer[1], trailer[2], trailer[3]]);
    crc32fast::hash(content) == expected
}

/// Decoded FORMAT_DESCRIPTION body
#[derive(Debug, Clone, PartialEq)]
pub struct FormatDescription {
    pub binlog_version: u16,
    pub server_version: String,
    pub checksum: ChecksumAlg,
}

/// Parse a FORMAT_DESCRIPTION body (trailing checksum included)
pub fn parse_format_description(body: &[u8]) -> Result<FormatDescription> {
    // binlog_version(2) + server_version(50) + create_timestamp(4) + header_length(1)
    if body.len() < 57 {
        return Err(Error::Decode("format description event too short".into()));
    }

    let binlog_version = u16::from_le_bytes([body[0], body[1]]);
    let server_version = String::from_utf8_lossy(&body[2..52])
        .trim_end_matches('\0')
        .to_string();

    let checksum = if version_has_checksum(&server_version) && body.len() >= 57 + 5 {
        match body[body.len() - 5] {
            1 => ChecksumAlg::Crc32,
            _ => ChecksumAlg::Off,
        }
    } else {
        ChecksumAlg::Off
    };

    Ok(FormatDescription {
        binlog_version,
        server_version,
        checksum,
    })
}

/// Servers from 5.6.1 on append the checksum algorithm to FORMAT_DESCRIPTION
fn version_has_checksum(version: &str) -> bool {
    let mut parts = version.split(|c: char| !c.is_ascii_digit());
    let mut next = || parts.next().and_then(|p| p.parse::<u32>().ok()).unwrap_or(0);
    let (major, minor, patch) = (next(), next(), next());

    if version.contains("MariaDB") {
        return (major, minor) >= (5, 3);
    }
    (major, minor, patch) >= (5, 6, 1)
}

/// Binlog events we care about
#[derive(Debug, Clone)]
pub enum BinlogEvent {
    /// Query event - raw SQL (DDL, BEGIN, statement-based DML)
    Query { database: String, query: String },
    /// Table map event - binds table_id to database.table
    TableMap(Arc<TableMapEvent>),
    /// Write/update/delete rows
    Rows(Arc<RowsEvent>),
    /// Rotate event - binlog file changed
    Rotate { next_file: String, position: u64 },
    /// Format description event
    FormatDescription(FormatDescription),
    /// XID event - transaction commit
    Xid { xid: u64 },
    /// GTID of the next transaction
    Gtid { gtid: String },
    /// Original statement of the following row events
    RowsQuery { query: String },
    Heartbeat,
    Stop,
    /// Unknown/unhandled event
    Unknown { type_code: u8 },
}

/// Decodes framed events, keeping the table map cache
#[derive(Debug, Default)]
pub struct EventDecoder {
    tables: HashMap<u64, Arc<TableMapEvent>>,
}

impl EventDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn table(&self, table_id: u64) -> Option<&Arc<TableMapEvent>> {
        self.tables.get(&table_id)
    }

    /// Row kind and mapped table of a rows event, read without decoding its rows
    pub fn rows_target(&self, event: &RawEvent) -> Option<(RowsKind, Arc<TableMapEvent>)> {
        let (kind, _) = event_type::rows_kind(event.header.event_type)?;
        let table_id = rows_table_id(&event.body)?;
        self.tables.get(&table_id).map(|table| (kind, table.clone()))
    }

    pub fn decode(&mut self, event: &RawEvent) -> Result<BinlogEvent> {
        let body = &event.body[..];

        if let Some((kind, v2)) = event_type::rows_kind(event.header.event_type) {
            return self.parse_rows(kind, v2, body);
        }

        match event.header.event_type {
            event_type::QUERY_EVENT => parse_query_event(body),
            event_type::TABLE_MAP_EVENT => {
                let table = Arc::new(parse_table_map(body)?);
                self.tables.insert(table.table_id, table.clone());
                Ok(BinlogEvent::TableMap(table))
            }
            event_type::ROTATE_EVENT => parse_rotate_event(body),
            event_type::FORMAT_DESCRIPTION_EVENT => {
                // A new file starts a new table id space
                self.tables.clear();
                Ok(BinlogEvent::FormatDescription(parse_format_description(body)?))
            }
            event_type::XID_EVENT => parse_xid_event(body),
            event_type::GTID_LOG_EVENT | event_type::ANONYMOUS_GTID_LOG_EVENT => {
                parse_mysql_gtid_event(body)
            }
            event_type::MARIADB_GTID_EVENT => {
                parse_mariadb_gtid_event(event.header.server_id, body)
            }
            event_type::ROWS_QUERY_LOG_EVENT => Ok(BinlogEvent::RowsQuery {
                // First byte is a truncated length, ignored by the server too
                query: String::from_utf8_lossy(body.get(1..).unwrap_or_default()).to_string(),
            }),
            event_type::MARIADB_ANNOTATE_ROWS_EVENT => Ok(BinlogEvent::RowsQuery {
                query: String::from_utf8_lossy(body).to_string(),
            }),
            event_type::HEARTBEAT_LOG_EVENT => Ok(BinlogEvent::Heartbeat),
            event_type::STOP_EVENT => Ok(BinlogEvent::Stop),
            type_code => Ok(BinlogEvent::Unknown { type_code }),
        }
    }

    fn parse_rows(&self, kind: RowsKind, v2: bool, body: &[u8]) -> Result<BinlogEvent> {
        let table_id =
            rows_table_id(body).ok_or_else(|| Error::Decode("rows event too short".into()))?;
        let table = self.tables.get(&table_id).cloned().ok_or_else(|| {
            Error::Decode(format!("rows event references unknown table id {}", table_id))
        })?;

        Ok(BinlogEvent::Rows(Arc::new(parse_rows(kind, v2, body, table)?)))
    }
}

/// 6-byte table id leading a rows event post-header
fn rows_table_id(body: &[u8]) -> Option<u64> {
    let id = body.get(..8)?;
    Some(u64::from_le_bytes([id[0], id[1], id[2], id[3], id[4], id[5], 0, 0]))
}

fn parse_query_event(data: &[u8]) -> Result<BinlogEvent> {
    // Post-header: thread_id(4) execution_time(4) schema_length(1)
    // error_code(2) status_vars_length(2)
    if data.len() < 13 {
        return Err(Error::Decode("query event too short".into()));
    }

    let schema_length = data[8] as usize;
    let status_vars_length = u16::from_le_bytes([data[11], data[12]]) as usize;

    let schema_start = 13 + status_vars_length;
    if data.len() < schema_start + schema_length + 1 {
        return Err(Error::Decode("query event truncated".into()));
    }

    let database = String::from_utf8_lossy(&data[schema_start..schema_start + schema_length]).to_string();
    let query = String::from_utf8_lossy(&data[schema_start + schema_length + 1..]).to_string();

    Ok(BinlogEvent::Query { database, query })
}

fn parse_rotate_event(data: &[u8]) -> Result<BinlogEvent> {
    if data.len() < 8 {
        return Err(Error::Decode("rotate event too short".into()));
    }

    let mut pos = [0u8; 8];
    pos.copy_from_slice(&data[..8]);
    let next_file = String::from_utf8_lossy(&data[8..])
        .trim_end_matches('\0')
        .to_string();

    Ok(BinlogEvent::Rotate {
        next_file,
        position: u64::from_le_bytes(pos),
    })
}

fn parse_xid_event(data: &[u8]) -> Result<BinlogEvent> {
    if data.len() < 8 {
        return Err(Error::Decode("XID event too short".into()));
    }

    let mut xid = [0u8; 8];
    xid.copy_from_slice(&data[..8]);
    Ok(BinlogEvent::Xid {
        xid: u64::from_le_bytes(xid),
    })
}

fn parse_mysql_gtid_event(data: &[u8]) -> Result<BinlogEvent> {
    // flags(1) sid(16) gno(8)
    if data.len() < 25 {
        return Err(Error::Decode("GTID event too short".into()));
    }

    let sid = &data[1..17];
    let hex: String = sid.iter().map(|b| format!("{:02x}", b)).collect();
    let mut gno = [0u8; 8];
    gno.copy_from_slice(&data[17..25]);

    Ok(BinlogEvent::Gtid {
        gtid: format!(
            "{}-{}-{}-{}-{}:{}",
            &hex[0..8],
            &hex[8..12],
            &hex[12..16],
            &hex[16..20],
            &hex[20..32],
            u64::from_le_bytes(gno)
        ),
    })
}

fn parse_mariadb_gtid_event(server_id: u32, data: &[u8]) -> Result<BinlogEvent> {
    if data.len() < 12 {
        return Err(Error::Decode("GTID event too short".into()));
    }

    let mut seq = [0u8; 8];
    seq.copy_from_slice(&data[..8]);
    let domain_id = u32::from_le_bytes([data[8], data[9], data[10], data[11]]);

    Ok(BinlogEvent::Gtid {
        gtid: format!("{}-{}-{}", domain_id, server_id, u64::from_le_bytes(seq)),
    })
}
