//! Binlog Client
//!
//! Connects to MySQL/MariaDB as a replica and streams binlog events.

use async_trait::async_trait;
use bytes::{BufMut, Bytes, BytesMut};
use futures::{SinkExt, StreamExt};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio_util::codec::Framed;

use super::event::{event_type, EventFramer, RawEvent};
use super::packet::{
    read_lenenc_int, read_lenenc_string, read_null_terminated, Packet, PacketCodec,
    AUTH_MORE_DATA_HEADER, COM_BINLOG_DUMP, COM_QUERY, COM_REGISTER_SLAVE, EOF_HEADER,
    ERR_HEADER, OK_HEADER,
};
use super::{EventSource, Position};
use crate::config::DatabaseConfig;
use crate::error::{Error, Result};

/// Capability flags sent in the handshake response
mod capability {
    pub const CLIENT_LONG_PASSWORD: u32 = 0x0000_0001;
    pub const CLIENT_LONG_FLAG: u32 = 0x0000_0004;
    pub const CLIENT_PROTOCOL_41: u32 = 0x0000_0200;
    pub const CLIENT_TRANSACTIONS: u32 = 0x0000_2000;
    pub const CLIENT_SECURE_CONNECTION: u32 = 0x0000_8000;
    pub const CLIENT_PLUGIN_AUTH: u32 = 0x0008_0000;
}

const NATIVE_PASSWORD_PLUGIN: &str = "mysql_native_password";
const CACHING_SHA2_PLUGIN: &str = "caching_sha2_password";

/// caching_sha2_password AUTH_MORE_DATA markers
const FAST_AUTH_OK: u8 = 0x03;
const PERFORM_FULL_AUTH: u8 = 0x04;
const REQUEST_PUBLIC_KEY: u8 = 0x02;

/// utf8mb4_general_ci
const CHARSET_UTF8MB4: u8 = 45;

const MAX_PACKET_SIZE: u32 = 16 * 1024 * 1024;

/// Keepalive interval requested from the server
const HEARTBEAT_PERIOD: Duration = Duration::from_secs(30);

/// Initial handshake (protocol v10)
#[derive(Debug, Clone)]
struct Handshake {
    server_version: String,
    connection_id: u32,
    scramble: Vec<u8>,
    auth_plugin: String,
}

impl Handshake {
    fn parse(data: &[u8]) -> Result<Self> {
        let malformed = || Error::Protocol("malformed handshake packet".into());

        if data.first() != Some(&10) {
            return Err(Error::Protocol(format!(
                "unsupported handshake protocol version {:?}",
                data.first()
            )));
        }

        let (server_version, used) = read_null_terminated(&data[1..]).ok_or_else(malformed)?;
        let mut pos = 1 + used;

        let fixed = data.get(pos..pos + 4 + 8 + 1 + 2).ok_or_else(malformed)?;
        let connection_id = u32::from_le_bytes([fixed[0], fixed[1], fixed[2], fixed[3]]);
        let mut scramble = fixed[4..12].to_vec();
        let cap_lower = u16::from_le_bytes([fixed[13], fixed[14]]) as u32;
        pos += 15;

        let mut capabilities = cap_lower;
        let mut auth_plugin = NATIVE_PASSWORD_PLUGIN.to_string();

        // charset(1) status(2) cap_upper(2) auth_data_len(1) reserved(10)
        if let Some(ext) = data.get(pos..pos + 16) {
            capabilities |= (u16::from_le_bytes([ext[3], ext[4]]) as u32) << 16;
            let auth_data_len = ext[5] as usize;
            pos += 16;

            let part2_len = auth_data_len.saturating_sub(8).max(13);
            if let Some(part2) = data.get(pos..pos + part2_len) {
                // The last byte of part 2 is a NUL filler
                let end = part2.iter().position(|&b| b == 0).unwrap_or(part2.len());
                scramble.extend_from_slice(&part2[..end]);
                pos += part2_len;
            }

            if capabilities & capability::CLIENT_PLUGIN_AUTH != 0 {
                if let Some((name, _)) = data.get(pos..).and_then(read_null_terminated) {
                    auth_plugin = name;
                } else if let Some(rest) = data.get(pos..) {
                    auth_plugin = String::from_utf8_lossy(rest).to_string();
                }
            }
        }

        Ok(Self {
            server_version,
            connection_id,
            scramble,
            auth_plugin,
        })
    }
}

/// Replication session: an authenticated connection running COM_BINLOG_DUMP
pub struct ReplicationStream {
    conn: Framed<TcpStream, PacketCodec>,
    framer: EventFramer,
    server_version: String,
    address: String,
}

impl ReplicationStream {
    /// Connect, authenticate, register as a replica and start dumping at `start`
    pub async fn connect(
        db: &DatabaseConfig,
        server_id: u32,
        start: &Position,
        verify_checksum: bool,
    ) -> Result<Self> {
        let address = db.address();
        tracing::info!(
            "Starting binlog client, connecting to {} as server_id {}",
            address,
            server_id
        );

        let tcp = tokio::time::timeout(db.connect_timeout(), TcpStream::connect(&address))
            .await
            .map_err(|_| Error::Handshake {
                address: address.clone(),
                reason: "connection timed out".into(),
            })?
            .map_err(|e| Error::Handshake {
                address: address.clone(),
                reason: e.to_string(),
            })?;
        tcp.set_nodelay(true)?;

        let mut conn = Framed::new(tcp, PacketCodec::new());
        let greeting = conn.next().await.ok_or_else(|| Error::Handshake {
            address: address.clone(),
            reason: "server closed the connection before the handshake".into(),
        })??;

        if greeting.is_err() {
            return Err(Error::Handshake {
                address,
                reason: greeting.to_error().to_string(),
            });
        }

        let handshake = Handshake::parse(&greeting.payload)?;
        tracing::debug!(
            server_version = %handshake.server_version,
            connection_id = handshake.connection_id,
            plugin = %handshake.auth_plugin,
            "Received handshake"
        );

        let mut stream = Self {
            conn,
            framer: EventFramer::new(verify_checksum),
            server_version: handshake.server_version.clone(),
            address,
        };

        stream.authenticate(db, &handshake, greeting.sequence_id).await?;
        stream.prepare_session().await?;
        stream.register_slave(server_id).await?;
        stream.send_binlog_dump(server_id, start).await?;

        Ok(stream)
    }

    pub fn server_version(&self) -> &str {
        &self.server_version
    }

    pub fn is_mariadb(&self) -> bool {
        self.server_version.contains("MariaDB")
    }

    async fn read_packet(&mut self) -> Result<Packet> {
        match self.conn.next().await {
            Some(packet) => packet,
            None => Err(Error::Protocol(format!(
                "connection to {} closed by server",
                self.address
            ))),
        }
    }

    async fn write_packet(&mut self, sequence_id: u8, payload: impl Into<Bytes>) -> Result<()> {
        self.conn.send(Packet::new(sequence_id, payload)).await
    }

    async fn authenticate(
        &mut self,
        db: &DatabaseConfig,
        handshake: &Handshake,
        greeting_seq: u8,
    ) -> Result<()> {
        let capabilities = capability::CLIENT_LONG_PASSWORD
            | capability::CLIENT_LONG_FLAG
            | capability::CLIENT_PROTOCOL_41
            | capability::CLIENT_TRANSACTIONS
            | capability::CLIENT_SECURE_CONNECTION
            | capability::CLIENT_PLUGIN_AUTH;

        // Unknown plugins get a native answer; the server switches us if needed
        let mut plugin = match handshake.auth_plugin.as_str() {
            CACHING_SHA2_PLUGIN => CACHING_SHA2_PLUGIN,
            _ => NATIVE_PASSWORD_PLUGIN,
        };
        let mut scramble = handshake.scramble.clone();
        let auth = auth_response(plugin, &db.password, &scramble)?;

        let mut response = BytesMut::with_capacity(128);
        response.put_u32_le(capabilities);
        response.put_u32_le(MAX_PACKET_SIZE);
        response.put_u8(CHARSET_UTF8MB4);
        response.put_slice(&[0u8; 23]);
        response.put_slice(db.user.as_bytes());
        response.put_u8(0);
        response.put_u8(auth.len() as u8);
        response.put_slice(&auth);
        response.put_slice(plugin.as_bytes());
        response.put_u8(0);

        self.write_packet(greeting_seq.wrapping_add(1), response.freeze())
            .await?;

        loop {
            let packet = self.read_packet().await?;
            let next_seq = packet.sequence_id.wrapping_add(1);
            match packet.header() {
                Some(OK_HEADER) => {
                    tracing::debug!(plugin, "Authentication successful");
                    return Ok(());
                }
                Some(ERR_HEADER) => {
                    return Err(self.handshake_error(packet.to_error().to_string()));
                }
                Some(EOF_HEADER) => {
                    // Auth switch request: plugin name, then fresh scramble
                    let (name, used) = read_null_terminated(&packet.payload[1..])
                        .unwrap_or_else(|| (String::new(), packet.payload.len() - 1));
                    plugin = match name.as_str() {
                        NATIVE_PASSWORD_PLUGIN => NATIVE_PASSWORD_PLUGIN,
                        CACHING_SHA2_PLUGIN => CACHING_SHA2_PLUGIN,
                        _ => {
                            return Err(self.handshake_error(format!(
                                "unsupported authentication plugin '{}'",
                                name
                            )))
                        }
                    };
                    tracing::debug!(plugin, "Server switched authentication plugin");

                    let data = &packet.payload[(1 + used).min(packet.payload.len())..];
                    scramble = data.strip_suffix(&[0]).unwrap_or(data).to_vec();
                    let auth = auth_response(plugin, &db.password, &scramble)?;
                    self.write_packet(next_seq, auth).await?;
                }
                Some(AUTH_MORE_DATA_HEADER) if plugin == CACHING_SHA2_PLUGIN => {
                    match packet.payload.get(1) {
                        // An OK packet follows
                        Some(&FAST_AUTH_OK) => {}
                        Some(&PERFORM_FULL_AUTH) => {
                            tracing::debug!("Full authentication required, requesting public key");
                            self.write_packet(next_seq, vec![REQUEST_PUBLIC_KEY])
                                .await?;
                        }
                        _ => {
                            let pem = String::from_utf8_lossy(&packet.payload[1..]);
                            let encrypted = encrypt_password(&db.password, &scramble, &pem)
                                .map_err(|reason| self.handshake_error(reason))?;
                            self.write_packet(next_seq, encrypted).await?;
                        }
                    }
                }
                other => {
                    return Err(self.handshake_error(format!(
                        "unexpected authentication response {:?}",
                        other
                    )));
                }
            }
        }
    }

    fn handshake_error(&self, reason: String) -> Error {
        Error::Handshake {
            address: self.address.clone(),
            reason,
        }
    }

    /// Run a text query and collect its rows
    pub async fn query(&mut self, sql: &str) -> Result<Vec<Vec<Option<String>>>> {
        let mut payload = BytesMut::with_capacity(sql.len() + 1);
        payload.put_u8(COM_QUERY);
        payload.put_slice(sql.as_bytes());
        self.write_packet(0, payload.freeze()).await?;

        let first = self.read_packet().await?;
        match first.header() {
            Some(OK_HEADER) => return Ok(Vec::new()),
            Some(ERR_HEADER) => return Err(first.to_error()),
            _ => {}
        }

        let (columns, _) = read_lenenc_int(&first.payload)
            .ok_or_else(|| Error::Protocol("invalid result set header".into()))?;

        for _ in 0..columns {
            self.read_packet().await?;
        }
        let eof = self.read_packet().await?;
        if !eof.is_eof() {
            return Err(Error::Protocol("missing EOF after column definitions".into()));
        }

        let mut rows = Vec::new();
        loop {
            let packet = self.read_packet().await?;
            if packet.is_eof() {
                break;
            }
            if packet.is_err() {
                return Err(packet.to_error());
            }

            let mut row = Vec::with_capacity(columns as usize);
            let mut pos = 0usize;
            for _ in 0..columns {
                let (value, used) = read_lenenc_string(&packet.payload[pos..])
                    .ok_or_else(|| Error::Protocol("truncated result row".into()))?;
                row.push(value);
                pos += used;
            }
            rows.push(row);
        }

        Ok(rows)
    }

    /// Session variables a replica sets before dumping
    async fn prepare_session(&mut self) -> Result<()> {
        let checksum = self
            .query("SHOW GLOBAL VARIABLES LIKE 'BINLOG_CHECKSUM'")
            .await?
            .into_iter()
            .next()
            .and_then(|row| row.into_iter().nth(1).flatten())
            .unwrap_or_default();

        if !checksum.is_empty() {
            tracing::debug!(checksum = %checksum, "Acknowledging binlog checksum");
            self.query("SET @master_binlog_checksum = @@global.binlog_checksum")
                .await?;
        }

        let period_ns = HEARTBEAT_PERIOD.as_nanos();
        self.query(&format!("SET @master_heartbeat_period = {}", period_ns))
            .await?;

        if self.is_mariadb() {
            // Start position is beyond the ignorable events
            self.query("SET @mariadb_slave_capability = 4").await?;
        }

        Ok(())
    }

    async fn register_slave(&mut self, server_id: u32) -> Result<()> {
        let mut payload = BytesMut::with_capacity(18);
        payload.put_u8(COM_REGISTER_SLAVE);
        payload.put_u32_le(server_id);
        // Empty hostname, user, password
        payload.put_u8(0);
        payload.put_u8(0);
        payload.put_u8(0);
        payload.put_u16_le(0); // port
        payload.put_u32_le(0); // replication rank
        payload.put_u32_le(0); // master_id

        self.write_packet(0, payload.freeze()).await?;

        let response = self.read_packet().await?;
        if response.is_err() {
            return Err(response.to_error());
        }

        tracing::debug!("Registered as replica with server_id {}", server_id);
        Ok(())
    }

    async fn send_binlog_dump(&mut self, server_id: u32, start: &Position) -> Result<()> {
        let mut payload = BytesMut::with_capacity(11 + start.file.len());
        payload.put_u8(COM_BINLOG_DUMP);
        payload.put_u32_le(start.pos);
        payload.put_u16_le(0); // flags
        payload.put_u32_le(server_id);
        payload.put_slice(start.file.as_bytes());

        self.write_packet(0, payload.freeze()).await?;

        tracing::debug!("Sent COM_BINLOG_DUMP for {}", start);
        Ok(())
    }

    async fn read_event(&mut self) -> Result<Option<RawEvent>> {
        loop {
            let packet = self.read_packet().await?;
            match packet.header() {
                Some(OK_HEADER) => {
                    let event = self.framer.frame(packet.payload.slice(1..))?;
                    // Heartbeats only keep the session alive
                    if event.header.event_type == event_type::HEARTBEAT_LOG_EVENT {
                        tracing::trace!("Heartbeat from {}", self.address);
                        continue;
                    }
                    return Ok(Some(event));
                }
                Some(EOF_HEADER) if packet.is_eof() => {
                    tracing::info!("Received EOF from binlog stream");
                    return Ok(None);
                }
                Some(ERR_HEADER) => return Err(packet.to_error()),
                other => {
                    return Err(Error::Protocol(format!(
                        "unexpected binlog packet header {:?}",
                        other
                    )));
                }
            }
        }
    }
}

#[async_trait]
impl EventSource for ReplicationStream {
    async fn next_event(&mut self, deadline: Option<Duration>) -> Result<Option<RawEvent>> {
        match deadline {
            Some(deadline) => tokio::time::timeout(deadline, self.read_event())
                .await
                .map_err(|_| Error::Timeout)?,
            None => self.read_event().await,
        }
    }
}

/// mysql_native_password: SHA1(password) XOR SHA1(scramble + SHA1(SHA1(password)))
fn scramble_password(password: &str, scramble: &[u8]) -> Vec<u8> {
    use sha1::{Digest, Sha1};

    if password.is_empty() {
        return Vec::new();
    }

    let mut hasher = Sha1::new();
    hasher.update(password.as_bytes());
    let stage1 = hasher.finalize_reset();

    hasher.update(stage1);
    let stage2 = hasher.finalize_reset();

    hasher.update(scramble);
    hasher.update(stage2);
    let stage3 = hasher.finalize();

    stage1.iter().zip(stage3.iter()).map(|(a, b)| a ^ b).collect()
}

/// caching_sha2_password: SHA256(password) XOR SHA256(SHA256(SHA256(password)) + scramble)
fn scramble_sha256_password(password: &str, scramble: &[u8]) -> Vec<u8> {
    use sha2::{Digest, Sha256};

    if password.is_empty() {
        return Vec::new();
    }

    let mut hasher = Sha256::new();
    hasher.update(password.as_bytes());
    let stage1 = hasher.finalize_reset();

    hasher.update(stage1);
    let stage2 = hasher.finalize_reset();

    hasher.update(stage2);
    hasher.update(scramble);
    let stage3 = hasher.finalize();

    stage1.iter().zip(stage3.iter()).map(|(a, b)| a ^ b).collect()
}

fn auth_response(plugin: &str, password: &str, scramble: &[u8]) -> Result<Vec<u8>> {
    match plugin {
        NATIVE_PASSWORD_PLUGIN => Ok(scramble_password(password, scramble)),
        CACHING_SHA2_PLUGIN => Ok(scramble_sha256_password(password, scramble)),
        other => Err(Error::Protocol(format!(
            "unsupported authentication plugin '{}'",
            other
        ))),
    }
}

/// NUL-terminated password XORed with the repeating scramble
fn xor_password(password: &str, scramble: &[u8]) -> Vec<u8> {
    let mut plain = password.as_bytes().to_vec();
    plain.push(0);
    if scramble.is_empty() {
        return plain;
    }
    for (i, byte) in plain.iter_mut().enumerate() {
        *byte ^= scramble[i % scramble.len()];
    }
    plain
}

/// Full caching_sha2_password exchange over a plain connection: RSA-OAEP with the server key
fn encrypt_password(
    password: &str,
    scramble: &[u8],
    public_key_pem: &str,
) -> std::result::Result<Vec<u8>, String> {
    use rsa::pkcs8::DecodePublicKey;
    use rsa::{Oaep, RsaPublicKey};

    let key = RsaPublicKey::from_public_key_pem(public_key_pem.trim_end_matches('\0'))
        .map_err(|e| format!("invalid server public key: {}", e))?;

    key.encrypt(
        &mut rand::thread_rng(),
        Oaep::new::<sha1::Sha1>(),
        &xor_password(password, scramble),
    )
    .map_err(|e| format!("failed to encrypt password: {}", e))
}
