//! Row event decoding
//!
//! Decodes TABLE_MAP and WRITE/UPDATE/DELETE_ROWS bodies into typed
//! column values. Temporal and decimal columns are rendered to their
//! textual MySQL form here so downstream consumers never deal with the
//! packed binary layouts.

use byteorder::{BigEndian, LittleEndian, ReadBytesExt};
use chrono::DateTime;
use std::io::{Cursor, Read};
use std::sync::Arc;

use super::packet::read_lenenc_int;
use crate::error::{Error, Result};

/// Column type codes as they appear in TABLE_MAP events
#[allow(dead_code)]
pub mod column_type {
    pub const DECIMAL: u8 = 0;
    pub const TINY: u8 = 1;
    pub const SHORT: u8 = 2;
    pub const LONG: u8 = 3;
    pub const FLOAT: u8 = 4;
    pub const DOUBLE: u8 = 5;
    pub const NULL: u8 = 6;
    pub const TIMESTAMP: u8 = 7;
    pub const LONGLONG: u8 = 8;
    pub const INT24: u8 = 9;
    pub const DATE: u8 = 10;
    pub const TIME: u8 = 11;
    pub const DATETIME: u8 = 12;
    pub const YEAR: u8 = 13;
    pub const NEWDATE: u8 = 14;
    pub const VARCHAR: u8 = 15;
    pub const BIT: u8 = 16;
    pub const TIMESTAMP2: u8 = 17;
    pub const DATETIME2: u8 = 18;
    pub const TIME2: u8 = 19;
    pub const JSON: u8 = 245;
    pub const NEWDECIMAL: u8 = 246;
    pub const ENUM: u8 = 247;
    pub const SET: u8 = 248;
    pub const TINY_BLOB: u8 = 249;
    pub const MEDIUM_BLOB: u8 = 250;
    pub const LONG_BLOB: u8 = 251;
    pub const BLOB: u8 = 252;
    pub const VAR_STRING: u8 = 253;
    pub const STRING: u8 = 254;
    pub const GEOMETRY: u8 = 255;
}

use column_type as ct;

const DIG_PER_DEC: usize = 9;
const DIG2BYTES: [usize; 10] = [0, 1, 1, 2, 2, 3, 3, 4, 4, 4];

const DATETIMEF_INT_OFS: i64 = 0x80_0000_0000;
const TIMEF_INT_OFS: i64 = 0x80_0000;
const TIMEF_OFS: i64 = 0x8000_0000_0000;

const ZERO_DATETIME: &str = "0000-00-00 00:00:00";

/// A decoded column value
#[derive(Debug, Clone, PartialEq)]
pub enum ColumnValue {
    Null,
    /// Integer types, sign-extended from their storage width
    Int(i64),
    Float(f32),
    Double(f64),
    /// DECIMAL in its textual form, e.g. `-1234.56`
    Decimal(String),
    /// DATE/TIME/DATETIME/TIMESTAMP/YEAR in their textual form
    Temporal(String),
    /// CHAR/VARCHAR/BINARY/BLOB/GEOMETRY payloads
    Bytes(Vec<u8>),
    /// Binary JSON document, undecoded
    Json(Vec<u8>),
    /// 1-based ENUM index
    Enum(u16),
    /// SET member bitmask
    Set(u64),
    Bit(u64),
}

impl ColumnValue {
    pub fn is_null(&self) -> bool {
        matches!(self, ColumnValue::Null)
    }

    /// Reinterpret an integer as unsigned using the storage width of `col_type`
    pub fn as_unsigned(&self, col_type: u8) -> Option<u64> {
        let ColumnValue::Int(v) = self else {
            return None;
        };
        let bits = match col_type {
            ct::TINY => 8,
            ct::SHORT => 16,
            ct::INT24 => 24,
            ct::LONG => 32,
            _ => 64,
        };
        if bits == 64 {
            Some(*v as u64)
        } else {
            Some((*v as u64) & ((1u64 << bits) - 1))
        }
    }
}

/// A TABLE_MAP event: binds a table id to a table and its column layout
#[derive(Debug, Clone, PartialEq)]
pub struct TableMapEvent {
    pub table_id: u64,
    pub schema: String,
    pub table: String,
    pub column_types: Vec<u8>,
    pub column_meta: Vec<u16>,
    pub null_bitmap: Vec<u8>,
}

impl TableMapEvent {
    pub fn column_count(&self) -> usize {
        self.column_types.len()
    }

    /// `` `db`.`table` ``
    pub fn qualified_name(&self) -> String {
        format!("`{}`.`{}`", self.schema, self.table)
    }

    pub fn is_nullable(&self, idx: usize) -> bool {
        is_bit_set(&self.null_bitmap, idx)
    }
}

/// Kind of row mutation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RowsKind {
    Write,
    Update,
    Delete,
}

/// A decoded rows event
///
/// Each row is one image with one slot per table column. `None` marks a
/// column absent from the image, `Some(ColumnValue::Null)` a SQL NULL.
/// Update events store before/after images interleaved.
#[derive(Debug, Clone)]
pub struct RowsEvent {
    pub kind: RowsKind,
    pub table_id: u64,
    pub table: Arc<TableMapEvent>,
    pub flags: u16,
    pub column_count: usize,
    pub rows: Vec<Vec<Option<ColumnValue>>>,
}

impl RowsEvent {
    /// Number of affected rows (update pairs count once)
    pub fn row_count(&self) -> usize {
        match self.kind {
            RowsKind::Update => self.rows.len() / 2,
            _ => self.rows.len(),
        }
    }

    /// (before, after) image pairs of an update event
    pub fn update_pairs(
        &self,
    ) -> impl Iterator<Item = (&Vec<Option<ColumnValue>>, &Vec<Option<ColumnValue>>)> {
        self.rows.chunks_exact(2).map(|pair| (&pair[0], &pair[1]))
    }
}

fn truncated(e: std::io::Error) -> Error {
    Error::Decode(format!("event body truncated: {}", e))
}

fn read_bytes(cursor: &mut Cursor<&[u8]>, len: usize) -> Result<Vec<u8>> {
    let remaining = cursor
        .get_ref()
        .len()
        .saturating_sub(cursor.position() as usize);
    if len > remaining {
        return Err(Error::Decode(format!(
            "event body truncated: need {} bytes, {} left",
            len, remaining
        )));
    }
    let mut buf = vec![0u8; len];
    cursor.read_exact(&mut buf).map_err(truncated)?;
    Ok(buf)
}

fn read_packed(cursor: &mut Cursor<&[u8]>) -> Result<u64> {
    let pos = cursor.position() as usize;
    let data = cursor.get_ref();
    let (value, used) = read_lenenc_int(data.get(pos..).unwrap_or_default())
        .ok_or_else(|| Error::Decode("invalid packed integer".into()))?;
    cursor.set_position((pos + used) as u64);
    Ok(value)
}

fn is_bit_set(bitmap: &[u8], idx: usize) -> bool {
    bitmap
        .get(idx / 8)
        .map(|b| b & (1 << (idx % 8)) != 0)
        .unwrap_or(false)
}

fn count_set_bits(bitmap: &[u8], len: usize) -> usize {
    (0..len).filter(|&i| is_bit_set(bitmap, i)).count()
}

/// Parse a TABLE_MAP event body
pub fn parse_table_map(body: &[u8]) -> Result<TableMapEvent> {
    let mut cursor = Cursor::new(body);

    let table_id = cursor.read_u48::<LittleEndian>().map_err(truncated)?;
    let _flags = cursor.read_u16::<LittleEndian>().map_err(truncated)?;

    let schema_len = cursor.read_u8().map_err(truncated)? as usize;
    let schema = String::from_utf8_lossy(&read_bytes(&mut cursor, schema_len)?).to_string();
    cursor.read_u8().map_err(truncated)?;

    let table_len = cursor.read_u8().map_err(truncated)? as usize;
    let table = String::from_utf8_lossy(&read_bytes(&mut cursor, table_len)?).to_string();
    cursor.read_u8().map_err(truncated)?;

    let column_count = read_packed(&mut cursor)? as usize;
    let column_types = read_bytes(&mut cursor, column_count)?;

    let meta_len = read_packed(&mut cursor)? as usize;
    let meta_block = read_bytes(&mut cursor, meta_len)?;
    let column_meta = parse_column_meta(&column_types, &meta_block)?;

    let null_bitmap = read_bytes(&mut cursor, column_count.div_ceil(8))?;

    Ok(TableMapEvent {
        table_id,
        schema,
        table,
        column_types,
        column_meta,
        null_bitmap,
    })
}

fn parse_column_meta(types: &[u8], block: &[u8]) -> Result<Vec<u16>> {
    let mut meta = Vec::with_capacity(types.len());
    let mut pos = 0usize;

    let byte_at = |i: usize| -> Result<u16> {
        block
            .get(i)
            .map(|b| *b as u16)
            .ok_or_else(|| Error::Decode("column metadata truncated".into()))
    };

    for &t in types {
        let value = match t {
            ct::FLOAT
            | ct::DOUBLE
            | ct::TINY_BLOB
            | ct::MEDIUM_BLOB
            | ct::LONG_BLOB
            | ct::BLOB
            | ct::GEOMETRY
            | ct::JSON
            | ct::TIME2
            | ct::DATETIME2
            | ct::TIMESTAMP2 => {
                let v = byte_at(pos)?;
                pos += 1;
                v
            }
            ct::VARCHAR | ct::VAR_STRING | ct::BIT => {
                let v = byte_at(pos)? | (byte_at(pos + 1)? << 8);
                pos += 2;
                v
            }
            ct::NEWDECIMAL | ct::STRING | ct::ENUM | ct::SET => {
                let v = (byte_at(pos)? << 8) | byte_at(pos + 1)?;
                pos += 2;
                v
            }
            _ => 0,
        };
        meta.push(value);
    }

    Ok(meta)
}

/// Parse a rows event body against its table map
pub fn parse_rows(
    kind: RowsKind,
    v2: bool,
    body: &[u8],
    table: Arc<TableMapEvent>,
) -> Result<RowsEvent> {
    let mut cursor = Cursor::new(body);

    let table_id = cursor.read_u48::<LittleEndian>().map_err(truncated)?;
    let flags = cursor.read_u16::<LittleEndian>().map_err(truncated)?;

    if v2 {
        // Extra data length includes its own two bytes
        let extra_len = cursor.read_u16::<LittleEndian>().map_err(truncated)? as usize;
        read_bytes(&mut cursor, extra_len.saturating_sub(2))?;
    }

    let column_count = read_packed(&mut cursor)? as usize;
    if column_count > table.column_count() {
        return Err(Error::Decode(format!(
            "rows event for {} has {} columns, table map has {}",
            table.qualified_name(),
            column_count,
            table.column_count()
        )));
    }

    let bitmap_len = column_count.div_ceil(8);
    let present = read_bytes(&mut cursor, bitmap_len)?;
    let present_after = if kind == RowsKind::Update {
        read_bytes(&mut cursor, bitmap_len)?
    } else {
        present.clone()
    };

    let mut rows = Vec::new();
    while (cursor.position() as usize) < body.len() {
        rows.push(read_image(&mut cursor, &table, column_count, &present)?);
        if kind == RowsKind::Update {
            rows.push(read_image(&mut cursor, &table, column_count, &present_after)?);
        }
    }

    Ok(RowsEvent {
        kind,
        table_id,
        table,
        flags,
        column_count,
        rows,
    })
}

fn read_image(
    cursor: &mut Cursor<&[u8]>,
    table: &TableMapEvent,
    column_count: usize,
    present: &[u8],
) -> Result<Vec<Option<ColumnValue>>> {
    let present_count = count_set_bits(present, column_count);
    let nulls = read_bytes(cursor, present_count.div_ceil(8))?;

    let mut row = Vec::with_capacity(column_count);
    let mut slot = 0usize;
    for idx in 0..column_count {
        if !is_bit_set(present, idx) {
            row.push(None);
            continue;
        }

        let value = if is_bit_set(&nulls, slot) {
            ColumnValue::Null
        } else {
            decode_value(cursor, table.column_types[idx], table.column_meta[idx])?
        };
        slot += 1;
        row.push(Some(value));
    }

    Ok(row)
}

/// Decode one column value of type `col_type` with metadata `meta`
pub fn decode_value(cursor: &mut Cursor<&[u8]>, col_type: u8, meta: u16) -> Result<ColumnValue> {
    let value = match col_type {
        ct::NULL => ColumnValue::Null,
        ct::TINY => ColumnValue::Int(cursor.read_i8().map_err(truncated)? as i64),
        ct::SHORT => ColumnValue::Int(cursor.read_i16::<LittleEndian>().map_err(truncated)? as i64),
        ct::INT24 => ColumnValue::Int(cursor.read_i24::<LittleEndian>().map_err(truncated)? as i64),
        ct::LONG => ColumnValue::Int(cursor.read_i32::<LittleEndian>().map_err(truncated)? as i64),
        ct::LONGLONG => ColumnValue::Int(cursor.read_i64::<LittleEndian>().map_err(truncated)?),
        ct::FLOAT => ColumnValue::Float(cursor.read_f32::<LittleEndian>().map_err(truncated)?),
        ct::DOUBLE => ColumnValue::Double(cursor.read_f64::<LittleEndian>().map_err(truncated)?),

        ct::NEWDECIMAL => {
            let precision = (meta >> 8) as usize;
            let scale = (meta & 0xFF) as usize;
            let size = decimal_bin_size(precision, scale);
            let raw = read_bytes(cursor, size)?;
            ColumnValue::Decimal(decode_decimal(&raw, precision, scale)?)
        }

        ct::BIT => {
            let nbits = ((meta >> 8) * 8 + (meta & 0xFF)) as usize;
            let raw = read_bytes(cursor, nbits.div_ceil(8))?;
            ColumnValue::Bit(be_uint(&raw))
        }

        ct::TIMESTAMP => {
            let secs = cursor.read_u32::<LittleEndian>().map_err(truncated)?;
            ColumnValue::Temporal(format_unix(secs, 0, 0)?)
        }
        ct::TIMESTAMP2 => {
            let secs = cursor.read_u32::<BigEndian>().map_err(truncated)?;
            let fsp = meta as u32;
            let frac = read_fraction(cursor, fsp)?;
            ColumnValue::Temporal(format_unix(secs, frac, fsp)?)
        }
        ct::DATETIME => {
            let v = cursor.read_u64::<LittleEndian>().map_err(truncated)?;
            ColumnValue::Temporal(format_datetime_v1(v))
        }
        ct::DATETIME2 => {
            let fsp = meta as u32;
            let packed = cursor.read_uint::<BigEndian>(5).map_err(truncated)? as i64;
            let frac = read_fraction(cursor, fsp)?;
            ColumnValue::Temporal(format_datetime2(packed - DATETIMEF_INT_OFS, frac, fsp))
        }
        ct::TIME => {
            let v = cursor.read_i24::<LittleEndian>().map_err(truncated)?;
            ColumnValue::Temporal(format_time_v1(v))
        }
        ct::TIME2 => ColumnValue::Temporal(decode_time2(cursor, meta as u32)?),
        ct::DATE | ct::NEWDATE => {
            let v = cursor.read_u24::<LittleEndian>().map_err(truncated)?;
            ColumnValue::Temporal(format_date(v))
        }
        ct::YEAR => {
            let v = cursor.read_u8().map_err(truncated)?;
            let year = if v == 0 { 0 } else { 1900 + v as u32 };
            ColumnValue::Temporal(format!("{:04}", year))
        }

        ct::VARCHAR | ct::VAR_STRING => ColumnValue::Bytes(read_short_string(cursor, meta as usize)?),
        ct::STRING => decode_string(cursor, meta)?,
        ct::ENUM => decode_enum(cursor, (meta & 0xFF) as usize)?,
        ct::SET => decode_set(cursor, (meta & 0xFF) as usize)?,

        ct::TINY_BLOB | ct::MEDIUM_BLOB | ct::LONG_BLOB | ct::BLOB | ct::GEOMETRY => {
            ColumnValue::Bytes(read_blob(cursor, meta as usize)?)
        }
        ct::JSON => ColumnValue::Json(read_blob(cursor, meta as usize)?),

        other => {
            return Err(Error::Decode(format!("unsupported column type {}", other)));
        }
    };

    Ok(value)
}

fn be_uint(bytes: &[u8]) -> u64 {
    bytes.iter().fold(0u64, |acc, b| (acc << 8) | *b as u64)
}

fn le_uint(bytes: &[u8]) -> u64 {
    bytes.iter().rev().fold(0u64, |acc, b| (acc << 8) | *b as u64)
}

fn read_short_string(cursor: &mut Cursor<&[u8]>, max_len: usize) -> Result<Vec<u8>> {
    let len = if max_len < 256 {
        cursor.read_u8().map_err(truncated)? as usize
    } else {
        cursor.read_u16::<LittleEndian>().map_err(truncated)? as usize
    };
    read_bytes(cursor, len)
}

fn read_blob(cursor: &mut Cursor<&[u8]>, len_bytes: usize) -> Result<Vec<u8>> {
    if !(1..=4).contains(&len_bytes) {
        return Err(Error::Decode(format!("invalid blob length width {}", len_bytes)));
    }
    let len = cursor.read_uint::<LittleEndian>(len_bytes).map_err(truncated)? as usize;
    read_bytes(cursor, len)
}

fn decode_string(cursor: &mut Cursor<&[u8]>, meta: u16) -> Result<ColumnValue> {
    let (real_type, length) = if meta >= 256 {
        let b0 = (meta >> 8) as u8;
        let b1 = (meta & 0xFF) as usize;
        if b0 & 0x30 != 0x30 {
            (b0 | 0x30, b1 | ((((b0 & 0x30) ^ 0x30) as usize) << 4))
        } else {
            (b0, b1)
        }
    } else {
        (ct::STRING, meta as usize)
    };

    match real_type {
        ct::ENUM => decode_enum(cursor, length),
        ct::SET => decode_set(cursor, length),
        _ => Ok(ColumnValue::Bytes(read_short_string(cursor, length)?)),
    }
}

fn decode_enum(cursor: &mut Cursor<&[u8]>, width: usize) -> Result<ColumnValue> {
    match width {
        1 => Ok(ColumnValue::Enum(cursor.read_u8().map_err(truncated)? as u16)),
        2 => Ok(ColumnValue::Enum(cursor.read_u16::<LittleEndian>().map_err(truncated)?)),
        other => Err(Error::Decode(format!("invalid enum width {}", other))),
    }
}

fn decode_set(cursor: &mut Cursor<&[u8]>, width: usize) -> Result<ColumnValue> {
    if width > 8 {
        return Err(Error::Decode(format!("invalid set width {}", width)));
    }
    Ok(ColumnValue::Set(le_uint(&read_bytes(cursor, width)?)))
}

/// Fractional seconds of `fsp` digits, scaled to microseconds
fn read_fraction(cursor: &mut Cursor<&[u8]>, fsp: u32) -> Result<u32> {
    let value = match fsp.div_ceil(2) {
        0 => 0,
        1 => cursor.read_u8().map_err(truncated)? as u32 * 10_000,
        2 => cursor.read_u16::<BigEndian>().map_err(truncated)? as u32 * 100,
        3 => cursor.read_u24::<BigEndian>().map_err(truncated)?,
        n => return Err(Error::Decode(format!("invalid fractional width {}", n))),
    };
    Ok(value)
}

/// `.ffffff` truncated to `fsp` digits, empty when `fsp` is 0
fn fraction_suffix(micros: u32, fsp: u32) -> String {
    if fsp == 0 {
        return String::new();
    }
    let fsp = fsp.min(6);
    format!(
        ".{:0width$}",
        micros / 10u32.pow(6 - fsp),
        width = fsp as usize
    )
}

fn format_unix(secs: u32, micros: u32, fsp: u32) -> Result<String> {
    if secs == 0 {
        return Ok(format!("{}{}", ZERO_DATETIME, fraction_suffix(0, fsp)));
    }
    let dt = DateTime::from_timestamp(secs as i64, 0)
        .ok_or_else(|| Error::Decode(format!("timestamp {} out of range", secs)))?;
    Ok(format!(
        "{}{}",
        dt.format("%Y-%m-%d %H:%M:%S"),
        fraction_suffix(micros, fsp)
    ))
}

fn format_datetime_v1(v: u64) -> String {
    if v == 0 {
        return ZERO_DATETIME.to_string();
    }
    let date = v / 1_000_000;
    let time = v % 1_000_000;
    format!(
        "{:04}-{:02}-{:02} {:02}:{:02}:{:02}",
        date / 10_000,
        (date % 10_000) / 100,
        date % 100,
        time / 10_000,
        (time % 10_000) / 100,
        time % 100
    )
}

fn format_datetime2(v: i64, micros: u32, fsp: u32) -> String {
    let v = v.unsigned_abs();
    let ymd = v >> 17;
    let ym = ymd >> 5;
    let hms = v % (1 << 17);

    format!(
        "{:04}-{:02}-{:02} {:02}:{:02}:{:02}{}",
        ym / 13,
        ym % 13,
        ymd % 32,
        hms >> 12,
        (hms >> 6) % 64,
        hms % 64,
        fraction_suffix(micros, fsp)
    )
}

fn format_time_v1(v: i32) -> String {
    let sign = if v < 0 { "-" } else { "" };
    let v = v.unsigned_abs();
    format!(
        "{}{:02}:{:02}:{:02}",
        sign,
        v / 10_000,
        (v % 10_000) / 100,
        v % 100
    )
}

fn format_date(v: u32) -> String {
    format!("{:04}-{:02}-{:02}", v >> 9, (v >> 5) % 16, v % 32)
}

fn decode_time2(cursor: &mut Cursor<&[u8]>, fsp: u32) -> Result<String> {
    let packed = match fsp {
        1 | 2 => {
            let mut int_part = cursor.read_u24::<BigEndian>().map_err(truncated)? as i64 - TIMEF_INT_OFS;
            let mut frac = cursor.read_u8().map_err(truncated)? as i64;
            if int_part < 0 && frac != 0 {
                int_part += 1;
                frac -= 0x100;
            }
            (int_part << 24) + frac * 10_000
        }
        3 | 4 => {
            let mut int_part = cursor.read_u24::<BigEndian>().map_err(truncated)? as i64 - TIMEF_INT_OFS;
            let mut frac = cursor.read_u16::<BigEndian>().map_err(truncated)? as i64;
            if int_part < 0 && frac != 0 {
                int_part += 1;
                frac -= 0x10000;
            }
            (int_part << 24) + frac * 100
        }
        5 | 6 => cursor.read_u48::<BigEndian>().map_err(truncated)? as i64 - TIMEF_OFS,
        _ => {
            let int_part = cursor.read_u24::<BigEndian>().map_err(truncated)? as i64 - TIMEF_INT_OFS;
            int_part << 24
        }
    };

    let sign = if packed < 0 { "-" } else { "" };
    let packed = packed.unsigned_abs();
    let hms = packed >> 24;
    let micros = (packed % (1 << 24)) as u32;

    Ok(format!(
        "{}{:02}:{:02}:{:02}{}",
        sign,
        (hms >> 12) % (1 << 10),
        (hms >> 6) % (1 << 6),
        hms % (1 << 6),
        fraction_suffix(micros, fsp)
    ))
}

/// Storage size of a DECIMAL(precision, scale)
pub fn decimal_bin_size(precision: usize, scale: usize) -> usize {
    let int_digits = precision.saturating_sub(scale);
    (int_digits / DIG_PER_DEC) * 4
        + DIG2BYTES[int_digits % DIG_PER_DEC]
        + (scale / DIG_PER_DEC) * 4
        + DIG2BYTES[scale % DIG_PER_DEC]
}

/// Decode a packed DECIMAL into its textual form
pub fn decode_decimal(raw: &[u8], precision: usize, scale: usize) -> Result<String> {
    let size = decimal_bin_size(precision, scale);
    if raw.len() < size || size == 0 {
        return Err(Error::Decode(format!(
            "decimal({},{}) needs {} bytes, got {}",
            precision,
            scale,
            size,
            raw.len()
        )));
    }

    let mut buf = raw[..size].to_vec();
    let negative = buf[0] & 0x80 == 0;
    buf[0] ^= 0x80;
    if negative {
        buf.iter_mut().for_each(|b| *b = !*b);
    }

    let int_digits = precision.saturating_sub(scale);
    let int_lead = int_digits % DIG_PER_DEC;
    let frac_tail = scale % DIG_PER_DEC;

    let mut pos = 0usize;
    let mut take = |n: usize| -> u64 {
        let v = be_uint(&buf[pos..pos + n]);
        pos += n;
        v
    };

    let mut int_part = String::new();
    if DIG2BYTES[int_lead] > 0 {
        int_part.push_str(&take(DIG2BYTES[int_lead]).to_string());
    }
    for _ in 0..int_digits / DIG_PER_DEC {
        int_part.push_str(&format!("{:09}", take(4)));
    }
    let int_part = int_part.trim_start_matches('0');
    let int_part = if int_part.is_empty() { "0" } else { int_part };

    let mut frac_part = String::new();
    for _ in 0..scale / DIG_PER_DEC {
        frac_part.push_str(&format!("{:09}", take(4)));
    }
    if DIG2BYTES[frac_tail] > 0 {
        frac_part.push_str(&format!(
            "{:0width$}",
            take(DIG2BYTES[frac_tail]),
            width = frac_tail
        ));
    }

    let mut out = String::with_capacity(precision + 2);
    if negative {
        out.push('-');
    }
    out.push_str(int_part);
    if scale > 0 {
        out.push('.');
        out.push_str(&frac_part);
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::binlog::testutil::{rows_body, table_map_body};

    fn decode(col_type: u8, meta: u16, data: &[u8]) -> ColumnValue {
        let mut cursor = Cursor::new(data);
        decode_value(&mut cursor, col_type, meta).unwrap()
    }

    #[test]
    fn test_decimal() {
        assert_eq!(
            decode_decimal(&[0x80, 0x00, 0x04, 0xD2, 0x38], 10, 2).unwrap(),
            "1234.56"
        );
        assert_eq!(
            decode_decimal(&[0x7F, 0xFF, 0xFB, 0x2D, 0xC7], 10, 2).unwrap(),
            "-1234.56"
        );
        // decimal(5,0) = 7
        assert_eq!(decode_decimal(&[0x80, 0x00, 0x07], 5, 0).unwrap(), "7");
        assert_eq!(decimal_bin_size(10, 2), 5);
        assert_eq!(decimal_bin_size(20, 10), 10);
    }

    #[test]
    fn test_decimal_zero_integer_part() {
        // decimal(4,2) = 0.05
        assert_eq!(decode_decimal(&[0x80, 0x05], 4, 2).unwrap(), "0.05");
    }

    #[test]
    fn test_integers() {
        assert_eq!(decode(ct::TINY, 0, &[0xFF]), ColumnValue::Int(-1));
        assert_eq!(ColumnValue::Int(-1).as_unsigned(ct::TINY), Some(255));
        assert_eq!(decode(ct::LONG, 0, &42i32.to_le_bytes()), ColumnValue::Int(42));
        assert_eq!(decode(ct::INT24, 0, &[0xFF, 0xFF, 0xFF]), ColumnValue::Int(-1));
        assert_eq!(
            ColumnValue::Int(-1).as_unsigned(ct::LONGLONG),
            Some(u64::MAX)
        );
    }

    #[test]
    fn test_datetime2() {
        // 2024-03-15 10:20:30, fsp 0
        let ym = 2024u64 * 13 + 3;
        let ymd = (ym << 5) | 15;
        let hms = (10u64 << 12) | (20 << 6) | 30;
        let packed = ((ymd << 17) | hms) + DATETIMEF_INT_OFS as u64;
        let bytes = &packed.to_be_bytes()[3..];
        assert_eq!(
            decode(ct::DATETIME2, 0, bytes),
            ColumnValue::Temporal("2024-03-15 10:20:30".into())
        );

        // Same value with fsp 3 and .123
        let mut with_frac = bytes.to_vec();
        with_frac.extend_from_slice(&1230u16.to_be_bytes());
        assert_eq!(
            decode(ct::DATETIME2, 3, &with_frac),
            ColumnValue::Temporal("2024-03-15 10:20:30.123".into())
        );
    }

    #[test]
    fn test_timestamp2_is_utc() {
        assert_eq!(
            decode(ct::TIMESTAMP2, 0, &86_400u32.to_be_bytes()),
            ColumnValue::Temporal("1970-01-02 00:00:00".into())
        );
        assert_eq!(
            decode(ct::TIMESTAMP2, 0, &[0, 0, 0, 0]),
            ColumnValue::Temporal(ZERO_DATETIME.into())
        );
    }

    #[test]
    fn test_date_and_time() {
        let v: u32 = (2023 << 9) | (12 << 5) | 31;
        assert_eq!(
            decode(ct::DATE, 0, &v.to_le_bytes()[..3]),
            ColumnValue::Temporal("2023-12-31".into())
        );

        let hms = (13i64 << 12) | (5 << 6) | 9;
        let packed = ((hms << 24) + TIMEF_OFS) as u64;
        // TIME2(0) stores only the integer part
        let int_part = ((hms + TIMEF_INT_OFS) as u32).to_be_bytes();
        assert_eq!(
            decode(ct::TIME2, 0, &int_part[1..]),
            ColumnValue::Temporal("13:05:09".into())
        );
        assert_eq!(
            decode(ct::TIME2, 6, &packed.to_be_bytes()[2..]),
            ColumnValue::Temporal("13:05:09.000000".into())
        );
        assert_eq!(decode(ct::YEAR, 0, &[124]), ColumnValue::Temporal("2024".into()));
    }

    #[test]
    fn test_string_real_type() {
        // CHAR(10): real type STRING, length 10
        let meta = ((ct::STRING as u16) << 8) | 10;
        assert_eq!(
            decode(ct::STRING, meta, &[3, b'a', b'b', b'c']),
            ColumnValue::Bytes(b"abc".to_vec())
        );

        // ENUM packed as STRING with 1-byte storage
        let meta = ((ct::ENUM as u16) << 8) | 1;
        assert_eq!(decode(ct::STRING, meta, &[2]), ColumnValue::Enum(2));

        let meta = ((ct::SET as u16) << 8) | 1;
        assert_eq!(decode(ct::STRING, meta, &[0b101]), ColumnValue::Set(5));
    }

    #[test]
    fn test_varchar_and_blob() {
        assert_eq!(
            decode(ct::VARCHAR, 300, &[2, 0, b'h', b'i']),
            ColumnValue::Bytes(b"hi".to_vec())
        );
        assert_eq!(
            decode(ct::BLOB, 2, &[3, 0, 1, 2, 3]),
            ColumnValue::Bytes(vec![1, 2, 3])
        );
        // BIT(10): meta = (1 << 8) | 2
        assert_eq!(decode(ct::BIT, (1 << 8) | 2, &[0x02, 0x01]), ColumnValue::Bit(0x201));
    }

    #[test]
    fn test_truncated_value() {
        let mut cursor = Cursor::new(&[0x01u8][..]);
        assert!(matches!(
            decode_value(&mut cursor, ct::LONG, 0),
            Err(Error::Decode(_))
        ));
    }

    #[test]
    fn test_table_map_and_rows() {
        let body = table_map_body(77, "shop", "orders", &[(ct::LONG, 0), (ct::VARCHAR, 64)]);
        let table = Arc::new(parse_table_map(&body).unwrap());
        assert_eq!(table.table_id, 77);
        assert_eq!(table.qualified_name(), "`shop`.`orders`");
        assert_eq!(table.column_meta, vec![0, 64]);
        assert!(table.is_nullable(1));

        let row_a = vec![Some(ColumnValue::Int(1)), Some(ColumnValue::Bytes(b"x".to_vec()))];
        let row_b = vec![Some(ColumnValue::Int(2)), Some(ColumnValue::Null)];
        let columns = [ct::LONG, ct::VARCHAR];
        let body = rows_body(77, &columns, &[row_a.clone(), row_b.clone()], true);

        let rows = parse_rows(RowsKind::Update, true, &body, table.clone()).unwrap();
        assert_eq!(rows.row_count(), 1);
        let (before, after) = rows.update_pairs().next().unwrap();
        assert_eq!(before, &row_a);
        assert_eq!(after, &row_b);

        let body = rows_body(77, &columns, &[row_a, row_b], false);
        let rows = parse_rows(RowsKind::Write, true, &body, table).unwrap();
        assert_eq!(rows.row_count(), 2);
        assert_eq!(rows.rows[1][1], Some(ColumnValue::Null));
    }
}
