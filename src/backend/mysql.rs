//! MySQL Backend Client
//!
//! Dials a MySQL/MariaDB server, authenticates with mysql_native_password
//! and speaks the text protocol over a framed TCP stream.

use std::time::Duration;

use async_trait::async_trait;
use bytes::{BufMut, Bytes, BytesMut};
use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_util::codec::Framed;

use super::{BackendConnection, Connector, DialTarget, DiscardSink, PacketSink};
use crate::auth::auth_hash;
use crate::error::{Error, Result};
use crate::protocol::{
    self, collation_id, eof_status, parse_auth_switch, parse_error_packet, Command, HandshakeResponse,
    HandshakeV10, MySqlPacket, OkPacket, PacketCodec, PayloadReader, MAX_PAYLOAD_LEN,
    NATIVE_PASSWORD_PLUGIN, PROXY_CAPABILITIES, SERVER_MORE_RESULTS_EXISTS, SERVER_STATUS_AUTOCOMMIT,
    SERVER_STATUS_IN_TRANS,
};

/// Collation used when the configured charset is unknown (utf8_general_ci)
const FALLBACK_COLLATION: u8 = 33;

/// Dials [`MySqlConnection`]s
#[derive(Debug, Default, Clone)]
pub struct MySqlConnector;

impl MySqlConnector {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Connector for MySqlConnector {
    type Conn = MySqlConnection;

    async fn connect(&self, target: &DialTarget) -> Result<MySqlConnection> {
        match timeout(target.connect_timeout, MySqlConnection::establish(target)).await {
            Ok(result) => result,
            Err(_) => Err(Error::ConnectionTimeout(target.address.clone())),
        }
    }
}

/// One authenticated connection to a backend node
pub struct MySqlConnection {
    framed: Framed<TcpStream, PacketCodec>,
    address: String,
    connection_id: u32,
    server_version: String,
    /// Status flags from the most recent OK or EOF packet
    status: u16,
    charset: String,
    schema: String,
    io_timeout: Duration,
    last_error: Option<Error>,
    closed: bool,
}

impl MySqlConnection {
    async fn establish(target: &DialTarget) -> Result<Self> {
        tracing::debug!(address = %target.address, user = %target.user, "Dialing backend");

        let stream = TcpStream::connect(&target.address)
            .await
            .map_err(|e| Error::ConnectionFailed {
                address: target.address.clone(),
                reason: e.to_string(),
            })?;
        stream.set_nodelay(true)?;

        let mut conn = Self {
            framed: Framed::new(stream, PacketCodec),
            address: target.address.clone(),
            connection_id: 0,
            server_version: String::new(),
            status: SERVER_STATUS_AUTOCOMMIT,
            charset: target.charset.clone(),
            schema: target.schema.clone(),
            io_timeout: target.io_timeout,
            last_error: None,
            closed: false,
        };
        conn.handshake(target).await?;

        tracing::debug!(
            address = %conn.address,
            connection_id = conn.connection_id,
            version = %conn.server_version,
            "Backend connection established"
        );
        Ok(conn)
    }

    async fn handshake(&mut self, target: &DialTarget) -> Result<()> {
        let greeting = self.read_packet().await?;
        let handshake = HandshakeV10::parse(&greeting.payload)?;
        self.connection_id = handshake.connection_id;
        self.server_version = handshake.server_version.clone();

        if let Some(plugin) = &handshake.auth_plugin {
            if plugin != NATIVE_PASSWORD_PLUGIN {
                tracing::debug!(address = %self.address, plugin = %plugin, "Server prefers another auth plugin");
            }
        }

        let response = HandshakeResponse {
            capabilities: (PROXY_CAPABILITIES & handshake.capabilities) | protocol::CLIENT_PROTOCOL_41,
            max_packet_size: MAX_PAYLOAD_LEN as u32,
            charset: collation_id(&target.charset).unwrap_or(FALLBACK_COLLATION),
            username: target.user.clone(),
            auth_response: auth_hash(&handshake.salt, target.password.as_bytes()),
            database: Some(target.schema.clone()).filter(|db| !db.is_empty()),
            auth_plugin: Some(NATIVE_PASSWORD_PLUGIN.to_string()),
        };
        let mut seq = greeting.sequence_id.wrapping_add(1);
        self.write_packet(response.encode(seq)).await?;

        loop {
            let reply = self.read_packet().await?;
            seq = reply.sequence_id.wrapping_add(1);
            match reply.payload.first() {
                Some(0x00) => {
                    self.status = OkPacket::parse(&reply.payload)?.status;
                    return Ok(());
                }
                Some(0xff) => return Err(parse_error_packet(&reply.payload)),
                Some(0xfe) => {
                    let (plugin, salt) = parse_auth_switch(&reply.payload)?;
                    if plugin != NATIVE_PASSWORD_PLUGIN {
                        return Err(Error::Protocol(format!(
                            "backend {} requested unsupported auth plugin {}",
                            self.address, plugin
                        )));
                    }
                    let scramble = auth_hash(&salt, target.password.as_bytes());
                    self.write_packet(MySqlPacket::new(seq, scramble)).await?;
                }
                _ => {
                    return Err(Error::Protocol(format!(
                        "unexpected packet during authentication with {}",
                        self.address
                    )))
                }
            }
        }
    }

    /// Server-assigned thread id
    pub fn connection_id(&self) -> u32 {
        self.connection_id
    }

    pub fn server_version(&self) -> &str {
        &self.server_version
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    /// Status flags from the most recent OK or EOF packet
    pub fn status_flags(&self) -> u16 {
        self.status
    }

    /// Receive one packet, bounded by the I/O timeout
    pub async fn read_packet(&mut self) -> Result<MySqlPacket> {
        let result = match timeout(self.io_timeout, self.framed.next()).await {
            Ok(Some(packet)) => packet,
            Ok(None) => Err(Error::Network(format!("backend {} closed the connection", self.address))),
            Err(_) => Err(Error::ConnectionTimeout(self.address.clone())),
        };
        self.track(result)
    }

    /// Send one packet, bounded by the I/O timeout
    pub async fn write_packet(&mut self, packet: MySqlPacket) -> Result<()> {
        let result = match timeout(self.io_timeout, self.framed.send(packet)).await {
            Ok(sent) => sent,
            Err(_) => Err(Error::ConnectionTimeout(self.address.clone())),
        };
        self.track(result)
    }

    /// Remember connection-level faults so the pool will not reuse this connection
    fn track<T>(&mut self, result: Result<T>) -> Result<T> {
        if let Err(e) = &result {
            if e.is_transient() && self.last_error.is_none() {
                self.last_error = Some(Error::Network(e.to_string()));
            }
        }
        result
    }

    async fn write_command(&mut self, command: Command, argument: &[u8]) -> Result<()> {
        let mut payload = BytesMut::with_capacity(1 + argument.len());
        payload.put_u8(command.byte());
        payload.extend_from_slice(argument);
        self.write_packet(MySqlPacket::new(0, payload.freeze())).await
    }

    /// Read the reply to a command that returns no rows
    async fn read_ok(&mut self) -> Result<()> {
        let reply = self.read_packet().await?;
        if reply.is_err() {
            return Err(parse_error_packet(&reply.payload));
        }
        if reply.is_ok() {
            self.status = self.track(OkPacket::parse(&reply.payload))?.status;
            return Ok(());
        }
        // A result set where none was expected; drain it to keep the stream in sync
        self.read_result_set(reply.payload, &mut DiscardSink).await
    }

    /// Pass one response packet on. A sink that fails leaves the backend
    /// stream half-read, so the failure taints this connection.
    async fn forward(&mut self, sink: &mut dyn PacketSink, payload: Bytes) -> Result<()> {
        let delivered = sink.deliver(payload).await;
        self.track(delivered)
    }

    /// Read a result set starting from its column-count packet
    async fn read_result_set(&mut self, column_count: Bytes, sink: &mut dyn PacketSink) -> Result<()> {
        let columns = self.track(PayloadReader::new(&column_count).lenenc_int())?;
        tracing::trace!(address = %self.address, columns, "Reading result set");
        self.forward(sink, column_count).await?;

        // Column definitions up to EOF
        loop {
            let packet = self.read_packet().await?;
            let eof = packet.is_eof();
            self.forward(sink, packet.payload).await?;
            if eof {
                break;
            }
        }

        // Rows up to EOF or ERR
        loop {
            let packet = self.read_packet().await?;
            if packet.is_eof() {
                self.status = self.track(eof_status(&packet.payload))?;
                return self.forward(sink, packet.payload).await;
            }
            if packet.is_err() {
                // An ERR ends the whole response, including any pending result sets
                self.status &= !SERVER_MORE_RESULTS_EXISTS;
                return self.forward(sink, packet.payload).await;
            }
            self.forward(sink, packet.payload).await?;
        }
    }

    /// Read the column definitions that answer COM_FIELD_LIST
    async fn read_field_list(&mut self, sink: &mut dyn PacketSink) -> Result<()> {
        loop {
            let packet = self.read_packet().await?;
            let done = packet.is_eof() || packet.is_err();
            if packet.is_eof() {
                self.status = self.track(eof_status(&packet.payload))?;
            }
            self.forward(sink, packet.payload).await?;
            if done {
                return Ok(());
            }
        }
    }

    fn note_statement(&mut self, query: &str) {
        if let Some(charset) = protocol::parse_set_names(query) {
            self.charset = charset;
        } else if let Some(schema) = protocol::parse_use_statement(query) {
            self.schema = schema;
        }
    }
}

#[async_trait]
impl BackendConnection for MySqlConnection {
    async fn ping(&mut self) -> Result<()> {
        self.write_command(Command::Ping, &[]).await?;
        self.read_ok().await
    }

    async fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        if self.last_error.is_none() {
            let _ = self.write_command(Command::Quit, &[]).await;
        }
        let _ = SinkExt::<MySqlPacket>::close(&mut self.framed).await;
        tracing::trace!(address = %self.address, connection_id = self.connection_id, "Backend connection closed");
    }

    fn is_in_transaction(&self) -> bool {
        self.status & SERVER_STATUS_IN_TRANS != 0
    }

    async fn rollback(&mut self) -> Result<()> {
        self.execute_admin("ROLLBACK").await
    }

    fn is_autocommit(&self) -> bool {
        self.status & SERVER_STATUS_AUTOCOMMIT != 0
    }

    async fn set_charset(&mut self, charset: &str) -> Result<()> {
        if collation_id(charset).is_none() {
            return Err(Error::Config(format!("unsupported charset {}", charset)));
        }
        self.execute_admin(&format!("SET NAMES {}", charset)).await?;
        self.charset = charset.to_string();
        Ok(())
    }

    fn charset(&self) -> &str {
        &self.charset
    }

    fn schema(&self) -> &str {
        &self.schema
    }

    async fn select_schema(&mut self, schema: &str) -> Result<()> {
        self.write_command(Command::InitDb, schema.as_bytes()).await?;
        self.read_ok().await?;
        self.schema = schema.to_string();
        Ok(())
    }

    async fn execute_admin(&mut self, sql: &str) -> Result<()> {
        tracing::trace!(address = %self.address, sql, "Administrative statement");
        self.write_command(Command::Query, sql.as_bytes()).await?;
        self.read_ok().await
    }

    async fn relay_command(&mut self, command: Bytes, sink: &mut dyn PacketSink) -> Result<()> {
        let kind = command.first().map(|&b| Command::from(b));
        self.write_packet(MySqlPacket::new(0, command.clone())).await?;

        if kind == Some(Command::FieldList) {
            return self.read_field_list(sink).await;
        }

        let mut succeeded = false;
        loop {
            let first = self.read_packet().await?;
            if first.is_err() {
                self.status &= !SERVER_MORE_RESULTS_EXISTS;
                self.forward(sink, first.payload).await?;
                break;
            }
            if first.is_ok() {
                self.status = self.track(OkPacket::parse(&first.payload))?.status;
                self.forward(sink, first.payload).await?;
                succeeded = true;
            } else if first.payload.first() == Some(&0xfb) {
                self.track::<()>(Err(Error::Protocol("LOCAL INFILE is not supported".into())))?;
            } else {
                self.read_result_set(first.payload, sink).await?;
                succeeded = true;
            }
            if self.status & SERVER_MORE_RESULTS_EXISTS == 0 {
                break;
            }
        }

        if succeeded && kind == Some(Command::Query) {
            if let Ok(query) = std::str::from_utf8(&command[1..]) {
                self.note_statement(query);
            }
        }
        Ok(())
    }

    fn last_error(&self) -> Option<&Error> {
        self.last_error.as_ref()
    }

    fn take_error(&mut self) -> Option<Error> {
        self.last_error.take()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{ok_packet, write_lenenc_int};
    use tokio::net::TcpListener;

    const PASSWORD: &str = "backend-secret";

    fn eof(seq: u8, status: u16) -> MySqlPacket {
        let mut payload = BytesMut::new();
        payload.put_u8(0xfe);
        payload.put_u16_le(0);
        payload.put_u16_le(status);
        MySqlPacket::new(seq, payload.freeze())
    }

    /// Minimal server: authenticates one client and answers a few statements
    async fn fake_server() -> (String, tokio::task::JoinHandle<Vec<String>>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();

        let handle = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut framed = Framed::new(stream, PacketCodec);
            let salt = crate::auth::generate_salt();
            framed.send(HandshakeV10::for_client(42, &salt, 33).encode()).await.unwrap();

            let response = framed.next().await.unwrap().unwrap();
            let parsed = HandshakeResponse::parse(&response.payload).unwrap();
            if parsed.auth_response != auth_hash(&salt, PASSWORD.as_bytes()) {
                framed
                    .send(protocol::error_packet(2, 1045, "28000", "Access denied"))
                    .await
                    .unwrap();
                return Vec::new();
            }
            framed.send(ok_packet(2, 0, 0, SERVER_STATUS_AUTOCOMMIT)).await.unwrap();

            let mut seen = Vec::new();
            let mut status = SERVER_STATUS_AUTOCOMMIT;
            while let Some(Ok(packet)) = framed.next().await {
                match packet.command() {
                    Some(Command::Quit) | None => {
                        seen.push("QUIT".to_string());
                        break;
                    }
                    Some(Command::Ping) => {
                        seen.push("PING".to_string());
                        framed.send(ok_packet(1, 0, 0, status)).await.unwrap();
                    }
                    Some(Command::Query) => {
                        let sql = packet.query_string().unwrap();
                        seen.push(sql.clone());
                        match sql.as_str() {
                            "BEGIN" => {
                                status |= SERVER_STATUS_IN_TRANS;
                                framed.send(ok_packet(1, 0, 0, status)).await.unwrap();
                            }
                            "ROLLBACK" => {
                                status &= !SERVER_STATUS_IN_TRANS;
                                framed.send(ok_packet(1, 0, 0, status)).await.unwrap();
                            }
                            "SELECT 1" => {
                                let mut count = BytesMut::new();
                                write_lenenc_int(&mut count, 1);
                                framed.send(MySqlPacket::new(1, count.freeze())).await.unwrap();
                                framed
                                    .send(MySqlPacket::new(2, Bytes::from_static(b"\x03def\x00\x00\x00\x011")))
                                    .await
                                    .unwrap();
                                framed.send(eof(3, status)).await.unwrap();
                                framed.send(MySqlPacket::new(4, Bytes::from_static(b"\x011"))).await.unwrap();
                                framed.send(eof(5, status)).await.unwrap();
                            }
                            "CALL p" => {
                                // Two result sets; the second one fails mid-rows
                                let more = status | SERVER_MORE_RESULTS_EXISTS;
                                framed.send(MySqlPacket::new(1, Bytes::from_static(b"\x01"))).await.unwrap();
                                framed
                                    .send(MySqlPacket::new(2, Bytes::from_static(b"\x03def\x00\x00\x00\x011")))
                                    .await
                                    .unwrap();
                                framed.send(eof(3, more)).await.unwrap();
                                framed.send(MySqlPacket::new(4, Bytes::from_static(b"\x011"))).await.unwrap();
                                framed.send(eof(5, more)).await.unwrap();
                                framed.send(MySqlPacket::new(6, Bytes::from_static(b"\x01"))).await.unwrap();
                                framed
                                    .send(MySqlPacket::new(7, Bytes::from_static(b"\x03def\x00\x00\x00\x011")))
                                    .await
                                    .unwrap();
                                framed.send(eof(8, more)).await.unwrap();
                                framed.send(MySqlPacket::new(9, Bytes::from_static(b"\x011"))).await.unwrap();
                                framed
                                    .send(protocol::error_packet(10, 1317, "70100", "Query execution was interrupted"))
                                    .await
                                    .unwrap();
                            }
                            "BROKEN" => {
                                // Truncated length-encoded column count
                                framed.send(MySqlPacket::new(1, Bytes::from_static(b"\xfc\x01"))).await.unwrap();
                            }
                            _ => {
                                framed
                                    .send(protocol::error_packet(1, 1064, "42000", "syntax error"))
                                    .await
                                    .unwrap();
                            }
                        }
                    }
                    Some(_) => {
                        framed.send(ok_packet(1, 0, 0, status)).await.unwrap();
                    }
                }
            }
            seen
        });

        (addr, handle)
    }

    fn target(address: &str, password: &str) -> DialTarget {
        DialTarget {
            address: address.to_string(),
            user: "proxy".into(),
            password: password.into(),
            schema: String::new(),
            charset: "utf8".into(),
            connect_timeout: Duration::from_secs(5),
            io_timeout: Duration::from_secs(5),
        }
    }

    #[tokio::test]
    async fn test_connect_query_and_transaction_state() {
        let (addr, server) = fake_server().await;
        let mut conn = MySqlConnector::new().connect(&target(&addr, PASSWORD)).await.unwrap();
        assert_eq!(conn.connection_id(), 42);
        assert!(conn.is_autocommit());
        assert!(!conn.is_in_transaction());

        conn.ping().await.unwrap();

        let mut packets = Vec::new();
        conn.relay_command(Bytes::from_static(b"\x03SELECT 1"), &mut packets).await.unwrap();
        assert_eq!(packets.len(), 5);
        assert_eq!(packets[3].as_ref(), b"\x011");

        conn.relay_command(Bytes::from_static(b"\x03BEGIN"), &mut DiscardSink).await.unwrap();
        assert!(conn.is_in_transaction());

        conn.rollback().await.unwrap();
        assert!(!conn.is_in_transaction());

        let mut packets = Vec::new();
        conn.relay_command(Bytes::from_static(b"\x03SELEKT"), &mut packets).await.unwrap();
        assert_eq!(packets.len(), 1);
        assert_eq!(packets[0][0], 0xff);
        assert!(conn.last_error().is_none());

        conn.close().await;
        let seen = server.await.unwrap();
        assert_eq!(seen, vec!["PING", "SELECT 1", "BEGIN", "ROLLBACK", "SELEKT", "QUIT"]);
    }

    #[tokio::test]
    async fn test_error_inside_multi_result_ends_response() {
        let (addr, _server) = fake_server().await;
        let mut conn = MySqlConnector::new().connect(&target(&addr, PASSWORD)).await.unwrap();

        let mut packets = Vec::new();
        conn.relay_command(Bytes::from_static(b"\x03CALL p"), &mut packets).await.unwrap();
        assert_eq!(packets.len(), 10);
        assert_eq!(packets[9][0], 0xff);
        assert_eq!(conn.status_flags() & SERVER_MORE_RESULTS_EXISTS, 0);
        assert!(conn.last_error().is_none());

        // Stream still in sync
        let mut packets = Vec::new();
        conn.relay_command(Bytes::from_static(b"\x03SELECT 1"), &mut packets).await.unwrap();
        assert_eq!(packets.len(), 5);
    }

    #[tokio::test]
    async fn test_malformed_response_taints_connection() {
        let (addr, _server) = fake_server().await;
        let mut conn = MySqlConnector::new().connect(&target(&addr, PASSWORD)).await.unwrap();

        let result = conn.relay_command(Bytes::from_static(b"\x03BROKEN"), &mut Vec::<Bytes>::new()).await;
        assert!(matches!(result, Err(Error::Protocol(_))));
        assert!(conn.last_error().is_some());
    }

    struct ClosedClient;

    #[async_trait]
    impl PacketSink for ClosedClient {
        async fn deliver(&mut self, _payload: Bytes) -> Result<()> {
            Err(Error::Network("client went away".into()))
        }
    }

    #[tokio::test]
    async fn test_failed_delivery_taints_connection() {
        let (addr, _server) = fake_server().await;
        let mut conn = MySqlConnector::new().connect(&target(&addr, PASSWORD)).await.unwrap();

        let result = conn.relay_command(Bytes::from_static(b"\x03SELECT 1"), &mut ClosedClient).await;
        assert!(result.is_err());
        assert!(conn.last_error().is_some());
    }

    #[tokio::test]
    async fn test_connect_with_bad_password() {
        let (addr, _server) = fake_server().await;
        match MySqlConnector::new().connect(&target(&addr, "wrong")).await {
            Err(Error::Backend { code, .. }) => assert_eq!(code, 1045),
            Err(e) => panic!("unexpected error {}", e),
            Ok(_) => panic!("connected with a bad password"),
        }
    }

    #[tokio::test]
    async fn test_connect_refused() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        drop(listener);

        let err = MySqlConnector::new().connect(&target(&addr, PASSWORD)).await.err().unwrap();
        assert!(err.is_transient());
    }
}
