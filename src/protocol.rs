//! MySQL Wire Protocol Implementation
//!
//! Packet framing, handshake messages and the OK/ERR/EOF packets shared by
//! the client-facing listener and the backend client. Result sets are never
//! decoded here; they are relayed packet by packet.

use byteorder::{ByteOrder, LittleEndian};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::error::{Error, Result};

/// Largest payload a single packet can carry
pub const MAX_PAYLOAD_LEN: usize = 0xFF_FFFF;

/// Auth plugin implemented by [`crate::auth::auth_hash`]
pub const NATIVE_PASSWORD_PLUGIN: &str = "mysql_native_password";

/// Version string announced to clients
pub const SERVER_VERSION: &str = "5.7.99-sqlmux";

// Capability flags
pub const CLIENT_LONG_PASSWORD: u32 = 0x0000_0001;
pub const CLIENT_FOUND_ROWS: u32 = 0x0000_0002;
pub const CLIENT_LONG_FLAG: u32 = 0x0000_0004;
pub const CLIENT_CONNECT_WITH_DB: u32 = 0x0000_0008;
pub const CLIENT_PROTOCOL_41: u32 = 0x0000_0200;
pub const CLIENT_TRANSACTIONS: u32 = 0x0000_2000;
pub const CLIENT_SECURE_CONNECTION: u32 = 0x0000_8000;
pub const CLIENT_MULTI_RESULTS: u32 = 0x0002_0000;
pub const CLIENT_PLUGIN_AUTH: u32 = 0x0008_0000;
pub const CLIENT_PLUGIN_AUTH_LENENC_CLIENT_DATA: u32 = 0x0020_0000;

/// Capabilities offered to clients and requested from backends.
/// CLIENT_DEPRECATE_EOF stays off so both sides frame result sets with EOF packets.
pub const PROXY_CAPABILITIES: u32 = CLIENT_LONG_PASSWORD
    | CLIENT_FOUND_ROWS
    | CLIENT_LONG_FLAG
    | CLIENT_CONNECT_WITH_DB
    | CLIENT_PROTOCOL_41
    | CLIENT_TRANSACTIONS
    | CLIENT_SECURE_CONNECTION
    | CLIENT_MULTI_RESULTS
    | CLIENT_PLUGIN_AUTH;

// Server status flags
pub const SERVER_STATUS_IN_TRANS: u16 = 0x0001;
pub const SERVER_STATUS_AUTOCOMMIT: u16 = 0x0002;
pub const SERVER_MORE_RESULTS_EXISTS: u16 = 0x0008;

/// Command byte of a client packet
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Command {
    /// COM_QUIT (0x01)
    Quit,
    /// COM_INIT_DB (0x02)
    InitDb,
    /// COM_QUERY (0x03)
    Query,
    /// COM_FIELD_LIST (0x04)
    FieldList,
    /// COM_PING (0x0e)
    Ping,
    /// Anything else
    Unknown(u8),
}

impl From<u8> for Command {
    fn from(cmd: u8) -> Self {
        match cmd {
            0x01 => Command::Quit,
            0x02 => Command::InitDb,
            0x03 => Command::Query,
            0x04 => Command::FieldList,
            0x0e => Command::Ping,
            _ => Command::Unknown(cmd),
        }
    }
}

impl Command {
    /// Wire byte of the command
    pub fn byte(self) -> u8 {
        match self {
            Command::Quit => 0x01,
            Command::InitDb => 0x02,
            Command::Query => 0x03,
            Command::FieldList => 0x04,
            Command::Ping => 0x0e,
            Command::Unknown(b) => b,
        }
    }
}

/// MySQL packet
#[derive(Debug, Clone, PartialEq)]
pub struct MySqlPacket {
    pub sequence_id: u8,
    pub payload: Bytes,
}

impl MySqlPacket {
    /// Create a new packet
    pub fn new(sequence_id: u8, payload: impl Into<Bytes>) -> Self {
        Self {
            sequence_id,
            payload: payload.into(),
        }
    }

    /// Get command type (first byte of payload for command packets)
    pub fn command(&self) -> Option<Command> {
        self.payload.first().map(|&b| Command::from(b))
    }

    /// Argument bytes following the command byte
    pub fn argument(&self) -> &[u8] {
        self.payload.get(1..).unwrap_or(&[])
    }

    /// Query text of a COM_QUERY packet
    pub fn query_string(&self) -> Option<String> {
        match self.command()? {
            Command::Query => String::from_utf8(self.argument().to_vec()).ok(),
            _ => None,
        }
    }

    pub fn is_ok(&self) -> bool {
        self.payload.first() == Some(&0x00)
    }

    pub fn is_err(&self) -> bool {
        self.payload.first() == Some(&0xff)
    }

    /// EOF packets start with 0xfe and are shorter than 9 bytes
    pub fn is_eof(&self) -> bool {
        self.payload.first() == Some(&0xfe) && self.payload.len() < 9
    }
}

/// Frames MySQL packets: 3-byte little-endian length, 1-byte sequence id, payload
#[derive(Debug, Default, Clone, Copy)]
pub struct PacketCodec;

impl Decoder for PacketCodec {
    type Item = MySqlPacket;
    type Error = Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<MySqlPacket>> {
        if src.len() < 4 {
            return Ok(None);
        }

        let length = LittleEndian::read_u24(&src[..3]) as usize;
        let total_len = 4 + length;
        if src.len() < total_len {
            src.reserve(total_len - src.len());
            return Ok(None);
        }

        let sequence_id = src[3];
        src.advance(4);
        let payload = src.split_to(length).freeze();
        Ok(Some(MySqlPacket { sequence_id, payload }))
    }
}

impl Encoder<MySqlPacket> for PacketCodec {
    type Error = Error;

    fn encode(&mut self, packet: MySqlPacket, dst: &mut BytesMut) -> Result<()> {
        if packet.payload.len() > MAX_PAYLOAD_LEN {
            return Err(Error::Protocol(format!(
                "payload of {} bytes exceeds a single packet",
                packet.payload.len()
            )));
        }
        dst.reserve(4 + packet.payload.len());
        dst.put_uint_le(packet.payload.len() as u64, 3);
        dst.put_u8(packet.sequence_id);
        dst.extend_from_slice(&packet.payload);
        Ok(())
    }
}

/// Cursor over a packet payload
pub struct PayloadReader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> PayloadReader<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    pub fn remaining(&self) -> usize {
        self.buf.len().saturating_sub(self.pos)
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        if self.remaining() < n {
            return Err(Error::Protocol(format!(
                "truncated packet: wanted {} bytes at offset {}",
                n, self.pos
            )));
        }
        let slice = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    pub fn skip(&mut self, n: usize) -> Result<()> {
        self.take(n).map(|_| ())
    }

    pub fn u8(&mut self) -> Result<u8> {
        Ok(self.take(1)?[0])
    }

    pub fn u16(&mut self) -> Result<u16> {
        Ok(LittleEndian::read_u16(self.take(2)?))
    }

    pub fn u32(&mut self) -> Result<u32> {
        Ok(LittleEndian::read_u32(self.take(4)?))
    }

    pub fn bytes(&mut self, n: usize) -> Result<&'a [u8]> {
        self.take(n)
    }

    /// Length-encoded integer
    pub fn lenenc_int(&mut self) -> Result<u64> {
        match self.u8()? {
            n @ 0..=0xfa => Ok(n as u64),
            0xfc => Ok(LittleEndian::read_u16(self.take(2)?) as u64),
            0xfd => Ok(LittleEndian::read_u24(self.take(3)?) as u64),
            0xfe => Ok(LittleEndian::read_u64(self.take(8)?)),
            b => Err(Error::Protocol(format!("invalid length-encoded integer prefix 0x{:02x}", b))),
        }
    }

    /// NUL-terminated string; a missing terminator consumes the rest
    pub fn null_str(&mut self) -> Result<String> {
        let rest = &self.buf[self.pos.min(self.buf.len())..];
        let end = rest.iter().position(|&b| b == 0).unwrap_or(rest.len());
        let s = String::from_utf8(rest[..end].to_vec())
            .map_err(|_| Error::Protocol("string is not valid UTF-8".into()))?;
        self.pos += (end + 1).min(rest.len());
        Ok(s)
    }

    pub fn rest(&mut self) -> &'a [u8] {
        let rest = &self.buf[self.pos.min(self.buf.len())..];
        self.pos = self.buf.len();
        rest
    }
}

/// Write a length-encoded integer
pub fn write_lenenc_int(buf: &mut BytesMut, value: u64) {
    if value < 251 {
        buf.put_u8(value as u8);
    } else if value < 65536 {
        buf.put_u8(0xfc);
        buf.put_u16_le(value as u16);
    } else if value < 16777216 {
        buf.put_u8(0xfd);
        buf.put_uint_le(value, 3);
    } else {
        buf.put_u8(0xfe);
        buf.put_u64_le(value);
    }
}

/// Build an OK packet
pub fn ok_packet(sequence_id: u8, affected_rows: u64, last_insert_id: u64, status: u16) -> MySqlPacket {
    let mut payload = BytesMut::with_capacity(16);
    payload.put_u8(0x00);
    write_lenenc_int(&mut payload, affected_rows);
    write_lenenc_int(&mut payload, last_insert_id);
    payload.put_u16_le(status);
    payload.put_u16_le(0); // warnings
    MySqlPacket::new(sequence_id, payload.freeze())
}

/// Build an error packet
pub fn error_packet(sequence_id: u8, error_code: u16, sql_state: &str, message: &str) -> MySqlPacket {
    let mut payload = BytesMut::with_capacity(9 + message.len());
    payload.put_u8(0xff);
    payload.put_u16_le(error_code);
    payload.put_u8(b'#');
    payload.extend_from_slice(sql_state.as_bytes());
    payload.extend_from_slice(message.as_bytes());
    MySqlPacket::new(sequence_id, payload.freeze())
}

/// Build the error packet reported to a client for a crate error
pub fn error_packet_for(sequence_id: u8, err: &Error) -> MySqlPacket {
    let message = match err {
        Error::Backend { message, .. } => message.clone(),
        other => other.to_string(),
    };
    error_packet(sequence_id, err.mysql_code(), err.sql_state(), &message)
}

/// Parsed OK packet
#[derive(Debug, Clone, PartialEq)]
pub struct OkPacket {
    pub affected_rows: u64,
    pub last_insert_id: u64,
    pub status: u16,
    pub warnings: u16,
}

impl OkPacket {
    pub fn parse(payload: &[u8]) -> Result<Self> {
        let mut r = PayloadReader::new(payload);
        if r.u8()? != 0x00 {
            return Err(Error::Protocol("not an OK packet".into()));
        }
        let affected_rows = r.lenenc_int()?;
        let last_insert_id = r.lenenc_int()?;
        let status = if r.remaining() >= 2 { r.u16()? } else { 0 };
        let warnings = if r.remaining() >= 2 { r.u16()? } else { 0 };
        Ok(Self {
            affected_rows,
            last_insert_id,
            status,
            warnings,
        })
    }
}

/// Status flags carried by an EOF packet
pub fn eof_status(payload: &[u8]) -> Result<u16> {
    let mut r = PayloadReader::new(payload);
    r.skip(1)?;
    if r.remaining() < 4 {
        return Ok(0);
    }
    let _warnings = r.u16()?;
    r.u16()
}

/// Decode an ERR packet into a backend error
pub fn parse_error_packet(payload: &[u8]) -> Error {
    let mut r = PayloadReader::new(payload);
    let parsed = (|| -> Result<Error> {
        r.skip(1)?;
        let code = r.u16()?;
        let mut state = "HY000".to_string();
        if r.remaining() >= 6 && payload.get(3) == Some(&b'#') {
            r.skip(1)?;
            state = String::from_utf8_lossy(r.bytes(5)?).into_owned();
        }
        let message = String::from_utf8_lossy(r.rest()).into_owned();
        Ok(Error::Backend { code, state, message })
    })();
    parsed.unwrap_or_else(|e| e)
}

/// Initial handshake (protocol v10), sent server -> client
#[derive(Debug, Clone, PartialEq)]
pub struct HandshakeV10 {
    pub server_version: String,
    pub connection_id: u32,
    /// Scramble sent to the client; 20 bytes for mysql_native_password
    pub salt: Vec<u8>,
    pub capabilities: u32,
    pub charset: u8,
    pub status: u16,
    pub auth_plugin: Option<String>,
}

impl HandshakeV10 {
    /// Greeting the proxy sends to a newly connected client
    pub fn for_client(connection_id: u32, salt: &[u8], charset: u8) -> Self {
        Self {
            server_version: SERVER_VERSION.to_string(),
            connection_id,
            salt: salt.to_vec(),
            capabilities: PROXY_CAPABILITIES,
            charset,
            status: SERVER_STATUS_AUTOCOMMIT,
            auth_plugin: Some(NATIVE_PASSWORD_PLUGIN.to_string()),
        }
    }

    pub fn encode(&self) -> MySqlPacket {
        let mut payload = BytesMut::with_capacity(128);
        payload.put_u8(10);
        payload.extend_from_slice(self.server_version.as_bytes());
        payload.put_u8(0);
        payload.put_u32_le(self.connection_id);

        let (part1, part2) = self.salt.split_at(self.salt.len().min(8));
        payload.extend_from_slice(part1);
        payload.put_u8(0); // filler

        payload.put_u16_le((self.capabilities & 0xffff) as u16);
        payload.put_u8(self.charset);
        payload.put_u16_le(self.status);
        payload.put_u16_le((self.capabilities >> 16) as u16);
        payload.put_u8((self.salt.len() + 1) as u8);
        payload.extend_from_slice(&[0u8; 10]);
        payload.extend_from_slice(part2);
        payload.put_u8(0);

        if let Some(plugin) = &self.auth_plugin {
            payload.extend_from_slice(plugin.as_bytes());
            payload.put_u8(0);
        }
        MySqlPacket::new(0, payload.freeze())
    }

    pub fn parse(payload: &[u8]) -> Result<Self> {
        let mut r = PayloadReader::new(payload);
        match r.u8()? {
            10 => {}
            0xff => return Err(parse_error_packet(payload)),
            v => return Err(Error::Protocol(format!("unsupported protocol version {}", v))),
        }
        let server_version = r.null_str()?;
        let connection_id = r.u32()?;
        let mut salt = r.bytes(8)?.to_vec();
        r.skip(1)?;
        let mut capabilities = r.u16()? as u32;

        let mut charset = 0;
        let mut status = 0;
        let mut auth_plugin = None;
        if r.remaining() > 0 {
            charset = r.u8()?;
            status = r.u16()?;
            capabilities |= (r.u16()? as u32) << 16;
            let auth_data_len = r.u8()? as usize;
            r.skip(10)?;
            if capabilities & CLIENT_SECURE_CONNECTION != 0 {
                let part2_len = auth_data_len.saturating_sub(8).max(13);
                let part2 = r.bytes(part2_len.min(r.remaining()))?;
                // Trailing NUL is not part of the scramble
                let part2 = part2.strip_suffix(&[0]).unwrap_or(part2);
                salt.extend_from_slice(part2);
            }
            if capabilities & CLIENT_PLUGIN_AUTH != 0 && r.remaining() > 0 {
                auth_plugin = Some(r.null_str()?);
            }
        }

        Ok(Self {
            server_version,
            connection_id,
            salt,
            capabilities,
            charset,
            status,
            auth_plugin,
        })
    }
}

/// Handshake response (HandshakeResponse41), sent client -> server
#[derive(Debug, Clone, PartialEq)]
pub struct HandshakeResponse {
    pub capabilities: u32,
    pub max_packet_size: u32,
    pub charset: u8,
    pub username: String,
    pub auth_response: Vec<u8>,
    pub database: Option<String>,
    pub auth_plugin: Option<String>,
}

impl HandshakeResponse {
    pub fn parse(payload: &[u8]) -> Result<Self> {
        let mut r = PayloadReader::new(payload);
        let capabilities = r.u32()?;
        if capabilities & CLIENT_PROTOCOL_41 == 0 {
            return Err(Error::Protocol("pre-4.1 clients are not supported".into()));
        }
        let max_packet_size = r.u32()?;
        let charset = r.u8()?;
        r.skip(23)?;
        let username = r.null_str()?;

        let auth_response = if capabilities & CLIENT_PLUGIN_AUTH_LENENC_CLIENT_DATA != 0 {
            let len = r.lenenc_int()? as usize;
            r.bytes(len)?.to_vec()
        } else if capabilities & CLIENT_SECURE_CONNECTION != 0 {
            let len = r.u8()? as usize;
            r.bytes(len)?.to_vec()
        } else {
            r.null_str()?.into_bytes()
        };

        let database = if capabilities & CLIENT_CONNECT_WITH_DB != 0 && r.remaining() > 0 {
            Some(r.null_str()?).filter(|db| !db.is_empty())
        } else {
            None
        };

        let auth_plugin = if capabilities & CLIENT_PLUGIN_AUTH != 0 && r.remaining() > 0 {
            Some(r.null_str()?)
        } else {
            None
        };

        Ok(Self {
            capabilities,
            max_packet_size,
            charset,
            username,
            auth_response,
            database,
            auth_plugin,
        })
    }

    pub fn encode(&self, sequence_id: u8) -> MySqlPacket {
        let mut capabilities = self.capabilities | CLIENT_PROTOCOL_41 | CLIENT_SECURE_CONNECTION;
        if self.database.is_some() {
            capabilities |= CLIENT_CONNECT_WITH_DB;
        } else {
            capabilities &= !CLIENT_CONNECT_WITH_DB;
        }
        if self.auth_plugin.is_some() {
            capabilities |= CLIENT_PLUGIN_AUTH;
        } else {
            capabilities &= !CLIENT_PLUGIN_AUTH;
        }
        capabilities &= !CLIENT_PLUGIN_AUTH_LENENC_CLIENT_DATA;

        let mut payload = BytesMut::with_capacity(64 + self.username.len());
        payload.put_u32_le(capabilities);
        payload.put_u32_le(self.max_packet_size);
        payload.put_u8(self.charset);
        payload.extend_from_slice(&[0u8; 23]);
        payload.extend_from_slice(self.username.as_bytes());
        payload.put_u8(0);
        payload.put_u8(self.auth_response.len() as u8);
        payload.extend_from_slice(&self.auth_response);
        if let Some(db) = &self.database {
            payload.extend_from_slice(db.as_bytes());
            payload.put_u8(0);
        }
        if let Some(plugin) = &self.auth_plugin {
            payload.extend_from_slice(plugin.as_bytes());
            payload.put_u8(0);
        }
        MySqlPacket::new(sequence_id, payload.freeze())
    }
}

/// Ask the client to redo authentication with another plugin and salt
pub fn auth_switch_request(sequence_id: u8, plugin: &str, salt: &[u8]) -> MySqlPacket {
    let mut payload = BytesMut::with_capacity(2 + plugin.len() + salt.len());
    payload.put_u8(0xfe);
    payload.extend_from_slice(plugin.as_bytes());
    payload.put_u8(0);
    payload.extend_from_slice(salt);
    payload.put_u8(0);
    MySqlPacket::new(sequence_id, payload.freeze())
}

/// Parse an auth switch request into (plugin name, salt)
pub fn parse_auth_switch(payload: &[u8]) -> Result<(String, Vec<u8>)> {
    let mut r = PayloadReader::new(payload);
    if r.u8()? != 0xfe {
        return Err(Error::Protocol("not an auth switch request".into()));
    }
    let plugin = r.null_str()?;
    let salt = r.rest();
    let salt = salt.strip_suffix(&[0]).unwrap_or(salt);
    Ok((plugin, salt.to_vec()))
}

/// Collation id announced for a charset name
pub fn collation_id(charset: &str) -> Option<u8> {
    match charset.to_ascii_lowercase().as_str() {
        "big5" => Some(1),
        "latin1" => Some(8),
        "ascii" => Some(11),
        "gbk" => Some(28),
        "utf8" | "utf8mb3" => Some(33),
        "utf8mb4" => Some(45),
        "binary" => Some(63),
        _ => None,
    }
}

/// Charset name of a collation id (default collations only)
pub fn charset_name(collation: u8) -> Option<&'static str> {
    match collation {
        1 => Some("big5"),
        8 => Some("latin1"),
        11 => Some("ascii"),
        28 => Some("gbk"),
        33 => Some("utf8"),
        // 255 is utf8mb4_0900_ai_ci, the MySQL 8 client default. Later 0900
        // collations do not fit the one-byte handshake field.
        45 | 46 | 224..=247 | 255 => Some("utf8mb4"),
        63 => Some("binary"),
        _ => None,
    }
}

/// Check if a query is a write operation
pub fn is_write_query(query: &str) -> bool {
    const WRITE_PREFIXES: &[&str] = &[
        // DDL
        "CREATE", "ALTER", "DROP", "RENAME", "TRUNCATE",
        // DML
        "INSERT", "UPDATE", "DELETE", "REPLACE", "LOAD", "CALL",
        // Permissions
        "GRANT", "REVOKE",
        // Locks and transactions
        "LOCK", "UNLOCK", "START", "BEGIN", "COMMIT", "ROLLBACK", "SAVEPOINT",
        // Maintenance
        "ANALYZE", "OPTIMIZE", "REPAIR", "FLUSH",
    ];
    let upper = strip_leading_comments(query).to_uppercase();
    WRITE_PREFIXES.iter().any(|p| upper.starts_with(p))
}

/// Strip leading SQL comments from a query
pub fn strip_leading_comments(query: &str) -> &str {
    let mut s = query.trim();
    loop {
        if s.starts_with("/*") {
            if let Some(end) = s.find("*/") {
                s = s[end + 2..].trim_start();
                continue;
            }
        }
        if s.starts_with("--") || s.starts_with('#') {
            if let Some(end) = s.find('\n') {
                s = s[end + 1..].trim_start();
                continue;
            }
        }
        break;
    }
    s
}

/// Schema named by a `USE db` statement
pub fn parse_use_statement(query: &str) -> Option<String> {
    let s = strip_leading_comments(query);
    if !s.get(..3)?.eq_ignore_ascii_case("USE") {
        return None;
    }
    let rest = s.get(3..)?;
    if !rest.starts_with(|c: char| c.is_whitespace() || c == '`') {
        return None;
    }
    let name = rest.trim().trim_end_matches(';').trim().trim_matches('`');
    if name.is_empty() {
        None
    } else {
        Some(name.to_string())
    }
}

/// Charset named by a `SET NAMES cs` statement
pub fn parse_set_names(query: &str) -> Option<String> {
    let s = strip_leading_comments(query);
    let upper = s.to_uppercase();
    let rest = if upper.starts_with("SET NAMES ") {
        s.get(10..)?
    } else if upper.starts_with("SET CHARACTER SET ") {
        s.get(18..)?
    } else {
        return None;
    };
    let name = rest
        .split_whitespace()
        .next()?
        .trim_end_matches(';')
        .trim_matches(|c| c == '\'' || c == '"' || c == '`');
    if name.is_empty() {
        None
    } else {
        Some(name.to_ascii_lowercase())
    }
}
