//! MySQL Wire Protocol Packets
//!
//! Framing for the client side of the MySQL protocol: packet codec,
//! length-encoded values and the handful of server responses a
//! replication client has to understand.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::error::{Error, Result};

/// Largest payload carried by a single physical packet
pub const MAX_PAYLOAD_LEN: usize = 0xFF_FFFF;

/// Packet header bytes
pub const OK_HEADER: u8 = 0x00;
pub const AUTH_MORE_DATA_HEADER: u8 = 0x01;
pub const LOCAL_INFILE_HEADER: u8 = 0xFB;
pub const EOF_HEADER: u8 = 0xFE;
pub const ERR_HEADER: u8 = 0xFF;

/// Commands
pub const COM_QUERY: u8 = 0x03;
pub const COM_BINLOG_DUMP: u8 = 0x12;
pub const COM_REGISTER_SLAVE: u8 = 0x15;

/// A logical MySQL packet (multi-packet payloads are already joined)
#[derive(Debug, Clone, PartialEq)]
pub struct Packet {
    pub sequence_id: u8,
    pub payload: Bytes,
}

impl Packet {
    pub fn new(sequence_id: u8, payload: impl Into<Bytes>) -> Self {
        Self {
            sequence_id,
            payload: payload.into(),
        }
    }

    /// First payload byte
    pub fn header(&self) -> Option<u8> {
        self.payload.first().copied()
    }

    pub fn is_ok(&self) -> bool {
        self.header() == Some(OK_HEADER)
    }

    pub fn is_err(&self) -> bool {
        self.header() == Some(ERR_HEADER)
    }

    /// EOF packets are short; a 0xFE row can only start a large payload
    pub fn is_eof(&self) -> bool {
        self.header() == Some(EOF_HEADER) && self.payload.len() < 9
    }

    /// Convert an ERR packet into an error
    pub fn to_error(&self) -> Error {
        let (code, message) = parse_err_payload(&self.payload);
        Error::Server { code, message }
    }
}

/// Split an ERR payload into (code, message)
pub fn parse_err_payload(payload: &[u8]) -> (u16, String) {
    if payload.len() < 3 {
        return (0, "malformed error packet".to_string());
    }

    let code = u16::from_le_bytes([payload[1], payload[2]]);
    let mut rest = &payload[3..];
    // Skip the '#' marker and the 5-byte SQL state
    if rest.first() == Some(&b'#') && rest.len() >= 6 {
        rest = &rest[6..];
    }

    (code, String::from_utf8_lossy(rest).to_string())
}

/// Codec for MySQL packets over a byte stream
#[derive(Debug, Default)]
pub struct PacketCodec {
    /// Partial payload of a multi-packet message
    partial: BytesMut,
}

impl PacketCodec {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Decoder for PacketCodec {
    type Item = Packet;
    type Error = Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Packet>> {
        loop {
            if src.len() < 4 {
                return Ok(None);
            }

            let len = (src[0] as usize) | ((src[1] as usize) << 8) | ((src[2] as usize) << 16);
            if src.len() < 4 + len {
                src.reserve(4 + len - src.len());
                return Ok(None);
            }

            let sequence_id = src[3];
            src.advance(4);
            let chunk = src.split_to(len);
            self.partial.extend_from_slice(&chunk);

            // A full-size chunk is continued by the next physical packet
            if len == MAX_PAYLOAD_LEN {
                continue;
            }

            let payload = std::mem::take(&mut self.partial).freeze();
            return Ok(Some(Packet {
                sequence_id,
                payload,
            }));
        }
    }
}

impl Encoder<Packet> for PacketCodec {
    type Error = Error;

    fn encode(&mut self, item: Packet, dst: &mut BytesMut) -> Result<()> {
        let mut sequence_id = item.sequence_id;
        let mut payload = item.payload;

        loop {
            let len = payload.len().min(MAX_PAYLOAD_LEN);
            dst.reserve(4 + len);
            dst.put_uint_le(len as u64, 3);
            dst.put_u8(sequence_id);
            dst.put_slice(&payload[..len]);
            payload.advance(len);
            sequence_id = sequence_id.wrapping_add(1);

            // A payload of exactly N * MAX_PAYLOAD_LEN ends with an empty packet
            if len < MAX_PAYLOAD_LEN {
                return Ok(());
            }
        }
    }
}

/// Read a length-encoded integer, returning (value, bytes consumed)
pub fn read_lenenc_int(data: &[u8]) -> Option<(u64, usize)> {
    let first = *data.first()?;

    match first {
        0..=250 => Some((first as u64, 1)),
        0xFC if data.len() >= 3 => Some((u16::from_le_bytes([data[1], data[2]]) as u64, 3)),
        0xFD if data.len() >= 4 => {
            Some((u32::from_le_bytes([data[1], data[2], data[3], 0]) as u64, 4))
        }
        0xFE if data.len() >= 9 => {
            let mut buf = [0u8; 8];
            buf.copy_from_slice(&data[1..9]);
            Some((u64::from_le_bytes(buf), 9))
        }
        _ => None,
    }
}

/// Read a length-encoded string; `None` inside the tuple is SQL NULL (0xFB)
pub fn read_lenenc_string(data: &[u8]) -> Option<(Option<String>, usize)> {
    if data.first() == Some(&LOCAL_INFILE_HEADER) {
        return Some((None, 1));
    }

    let (len, header_size) = read_lenenc_int(data)?;
    let len = len as usize;
    if data.len() < header_size + len {
        return None;
    }

    let value = String::from_utf8_lossy(&data[header_size..header_size + len]).to_string();
    Some((Some(value), header_size + len))
}

/// Write a length-encoded integer
pub fn write_lenenc_int(buf: &mut Vec<u8>, value: u64) {
    if value < 251 {
        buf.push(value as u8);
    } else if value < 65536 {
        buf.push(0xFC);
        buf.extend_from_slice(&(value as u16).to_le_bytes());
    } else if value < 16_777_216 {
        buf.push(0xFD);
        buf.extend_from_slice(&(value as u32).to_le_bytes()[..3]);
    } else {
        buf.push(0xFE);
        buf.extend_from_slice(&value.to_le_bytes());
    }
}

/// Read a NUL-terminated string, returning (string, bytes consumed including NUL)
pub fn read_null_terminated(data: &[u8]) -> Option<(String, usize)> {
    let end = data.iter().position(|&b| b == 0)?;
    Some((String::from_utf8_lossy(&data[..end]).to_string(), end + 1))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_single_packet() {
        let mut codec = PacketCodec::new();
        let mut buf = BytesMut::from(&[0x03, 0x00, 0x00, 0x01, 0xAA, 0xBB, 0xCC, 0x01][..]);

        let packet = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(packet.sequence_id, 1);
        assert_eq!(&packet.payload[..], &[0xAA, 0xBB, 0xCC]);
        // Trailing partial header stays buffered
        assert!(codec.decode(&mut buf).unwrap().is_none());
        assert_eq!(buf.len(), 1);
    }

    #[test]
    fn test_decode_waits_for_full_body() {
        let mut codec = PacketCodec::new();
        let mut buf = BytesMut::from(&[0x05, 0x00, 0x00, 0x00, 0x01, 0x02][..]);
        assert!(codec.decode(&mut buf).unwrap().is_none());

        buf.extend_from_slice(&[0x03, 0x04, 0x05]);
        let packet = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(packet.payload.len(), 5);
    }

    #[test]
    fn test_multi_packet_payload_is_joined() {
        let payload = vec![7u8; MAX_PAYLOAD_LEN + 10];
        let mut codec = PacketCodec::new();
        let mut buf = BytesMut::new();
        codec.encode(Packet::new(0, payload.clone()), &mut buf).unwrap();
        assert_eq!(buf.len(), 4 + MAX_PAYLOAD_LEN + 4 + 10);

        let packet = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(packet.payload.len(), payload.len());
        assert_eq!(packet.sequence_id, 1);
        assert!(buf.is_empty());
    }

    #[test]
    fn test_lenenc_int() {
        for value in [0u64, 250, 251, 65535, 65536, 16_777_215, 16_777_216, u64::MAX] {
            let mut buf = Vec::new();
            write_lenenc_int(&mut buf, value);
            let (decoded, used) = read_lenenc_int(&buf).unwrap();
            assert_eq!(decoded, value);
            assert_eq!(used, buf.len());
        }
    }

    #[test]
    fn test_err_payload() {
        let mut payload = vec![ERR_HEADER];
        payload.extend_from_slice(&1236u16.to_le_bytes());
        payload.extend_from_slice(b"#HY000Could not find first log file name");
        let packet = Packet::new(1, payload);
        assert!(packet.is_err());

        match packet.to_error() {
            Error::Server { code, message } => {
                assert_eq!(code, 1236);
                assert_eq!(message, "Could not find first log file name");
            }
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[test]
    fn test_lenenc_string_null() {
        let (value, used) = read_lenenc_string(&[0xFB]).unwrap();
        assert!(value.is_none());
        assert_eq!(used, 1);

        let (value, used) = read_lenenc_string(&[0x03, b'a', b'b', b'c']).unwrap();
        assert_eq!(value.as_deref(), Some("abc"));
        assert_eq!(used, 4);
    }
}
