//! Client Sessions
//!
//! One session per client connection: handshake and authentication, then a
//! command loop that borrows a backend connection lazily and hands it back
//! as soon as no transaction is open on it.

use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::time::timeout;
use tokio_util::codec::Framed;

use crate::auth::{generate_salt, ClientIdentity, SessionAuthenticator};
use crate::backend::{BackendConnection, Connector, PacketSink, PooledConn};
use crate::config::{GlobalConfig, ProxyConfig};
use crate::error::{Error, Result, ER_UNKNOWN_COM_ERROR};
use crate::protocol::{
    self, auth_switch_request, charset_name, collation_id, error_packet, error_packet_for, ok_packet,
    Command, HandshakeResponse, HandshakeV10, MySqlPacket, PacketCodec, NATIVE_PASSWORD_PLUGIN,
    SERVER_STATUS_AUTOCOMMIT, SERVER_STATUS_IN_TRANS,
};
use crate::router::ClusterRouter;

type ClientStream<S> = Framed<S, PacketCodec>;

enum Flow {
    Continue,
    Quit,
}

/// State of one client connection
pub struct Session<C: Connector> {
    id: u32,
    router: Arc<ClusterRouter<C>>,
    identity: ClientIdentity,
    authenticator: Option<SessionAuthenticator>,
    /// Cluster serving the authenticated user
    cluster: String,
    /// Charset negotiated in the handshake
    charset: String,
    client_timeout: Duration,
    /// Backend connection held across commands while a transaction is open
    backend: Option<PooledConn<C>>,
}

impl<C: Connector> Session<C> {
    pub fn new(id: u32, peer: IpAddr, router: Arc<ClusterRouter<C>>) -> Self {
        Self {
            id,
            router,
            identity: ClientIdentity::new(peer, generate_salt()),
            authenticator: None,
            cluster: String::new(),
            charset: String::new(),
            client_timeout: GlobalConfig::default().client_timeout(),
            backend: None,
        }
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    /// Authenticated identity (user empty until the handshake response arrives)
    pub fn identity(&self) -> &ClientIdentity {
        &self.identity
    }

    /// Whether a backend connection is currently checked out
    pub fn holds_backend(&self) -> bool {
        self.backend.is_some()
    }

    /// Serve the client until it quits, disconnects or idles out
    pub async fn run<S>(mut self, stream: S) -> Result<()>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send,
    {
        let mut framed = Framed::new(stream, PacketCodec);
        let snapshot = self.router.config().snapshot().await;
        self.client_timeout = snapshot.global.client_timeout();

        if !self.handshake(&mut framed, snapshot).await? {
            return Ok(());
        }

        let result = self.command_loop(&mut framed).await;
        self.release_backend().await;
        tracing::debug!(session = self.id, user = %self.identity.user, "Session closed");
        result
    }

    async fn next_packet<S>(&self, framed: &mut ClientStream<S>) -> Result<Option<MySqlPacket>>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send,
    {
        match timeout(self.client_timeout, framed.next()).await {
            Ok(Some(packet)) => packet.map(Some),
            Ok(None) => Ok(None),
            Err(_) => {
                tracing::info!(session = self.id, user = %self.identity.user, "Client idle timeout");
                Ok(None)
            }
        }
    }

    /// Greeting, credentials check and OK/ERR reply. Returns whether the client is logged in.
    async fn handshake<S>(&mut self, framed: &mut ClientStream<S>, snapshot: Arc<ProxyConfig>) -> Result<bool>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send,
    {
        let default_charset = snapshot.global.default_charset.clone();
        let charset_id = collation_id(&default_charset).unwrap_or(33);
        framed
            .send(HandshakeV10::for_client(self.id, &self.identity.salt, charset_id).encode())
            .await?;

        let packet = match self.next_packet(framed).await? {
            Some(p) => p,
            None => return Ok(false),
        };
        let mut seq = packet.sequence_id.wrapping_add(1);
        let response = match HandshakeResponse::parse(&packet.payload) {
            Ok(r) => r,
            Err(e) => {
                framed.send(error_packet_for(seq, &e)).await?;
                return Err(e);
            }
        };
        self.identity.user = response.username.clone();

        let mut candidate = response.auth_response.clone();
        if response.auth_plugin.as_deref().is_some_and(|p| p != NATIVE_PASSWORD_PLUGIN) {
            tracing::debug!(session = self.id, plugin = ?response.auth_plugin, "Switching client to native password auth");
            framed
                .send(auth_switch_request(seq, NATIVE_PASSWORD_PLUGIN, &self.identity.salt))
                .await?;
            let reply = match self.next_packet(framed).await? {
                Some(p) => p,
                None => return Ok(false),
            };
            seq = reply.sequence_id.wrapping_add(1);
            candidate = reply.payload.to_vec();
        }

        self.charset = charset_name(response.charset)
            .map(str::to_string)
            .unwrap_or(default_charset);

        let authenticator = SessionAuthenticator::new(Arc::clone(&snapshot));
        let verdict = match authenticator.check_host(&self.identity) {
            Err(e) => Err(e),
            Ok(()) => match &response.database {
                Some(db) => authenticator.check_auth_with_db(&mut self.identity, &candidate, db),
                None => authenticator.check_auth(&mut self.identity, &candidate),
            },
        };

        if let Err(e) = verdict {
            tracing::warn!(
                session = self.id,
                user = %self.identity.user,
                host = %self.identity.host,
                "Authentication failed: {}",
                e
            );
            framed.send(error_packet_for(seq, &e)).await?;
            return Ok(false);
        }

        self.cluster = snapshot
            .user(&self.identity.user)
            .map(|u| u.cluster_name.clone())
            .unwrap_or_default();
        self.authenticator = Some(authenticator);

        tracing::info!(
            session = self.id,
            user = %self.identity.user,
            host = %self.identity.host,
            schema = ?self.identity.schema,
            cluster = %self.cluster,
            "Client authenticated"
        );
        framed.send(ok_packet(seq, 0, 0, SERVER_STATUS_AUTOCOMMIT)).await?;
        Ok(true)
    }

    async fn command_loop<S>(&mut self, framed: &mut ClientStream<S>) -> Result<()>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send,
    {
        while let Some(packet) = self.next_packet(framed).await? {
            if let Flow::Quit = self.dispatch(framed, packet).await? {
                break;
            }
        }
        Ok(())
    }

    async fn dispatch<S>(&mut self, framed: &mut ClientStream<S>, packet: MySqlPacket) -> Result<Flow>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send,
    {
        let command = match packet.command() {
            Some(c) => c,
            None => return Ok(Flow::Continue),
        };

        match command {
            Command::Quit => return Ok(Flow::Quit),
            Command::Ping => {
                framed.send(ok_packet(1, 0, 0, self.status_flags())).await?;
            }
            Command::InitDb => {
                let schema = String::from_utf8_lossy(packet.argument()).trim().to_string();
                self.change_schema(framed, &schema).await?;
            }
            Command::Query => {
                let query = String::from_utf8_lossy(packet.argument()).into_owned();
                if let Some(schema) = protocol::parse_use_statement(&query) {
                    self.change_schema(framed, &schema).await?;
                } else {
                    let for_write = protocol::is_write_query(&query);
                    self.relay(framed, packet, for_write).await?;
                }
            }
            Command::FieldList => {
                self.relay(framed, packet, false).await?;
            }
            Command::Unknown(byte) => {
                tracing::debug!(session = self.id, command = byte, "Unsupported command");
                framed
                    .send(error_packet(1, ER_UNKNOWN_COM_ERROR, "08S01", "Unknown command"))
                    .await?;
            }
        }
        Ok(Flow::Continue)
    }

    /// Status flags for locally answered commands
    fn status_flags(&self) -> u16 {
        match self.backend.as_ref().and_then(|b| b.get()) {
            Some(conn) => {
                let mut status = 0;
                if conn.is_in_transaction() {
                    status |= SERVER_STATUS_IN_TRANS;
                }
                if conn.is_autocommit() {
                    status |= SERVER_STATUS_AUTOCOMMIT;
                }
                status
            }
            None => SERVER_STATUS_AUTOCOMMIT,
        }
    }

    async fn change_schema<S>(&mut self, framed: &mut ClientStream<S>, schema: &str) -> Result<()>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send,
    {
        let switched = match &self.authenticator {
            Some(auth) => auth.use_schema(&mut self.identity, schema),
            None => Err(Error::NoDatabase),
        };
        if let Err(e) = switched {
            framed.send(error_packet_for(1, &e)).await?;
            return Ok(());
        }

        if let Some(conn) = self.backend.as_mut().and_then(|b| b.get_mut()) {
            if let Err(e) = conn.select_schema(schema).await {
                framed.send(error_packet_for(1, &e)).await?;
                return Ok(());
            }
        }

        tracing::debug!(session = self.id, schema, "Schema changed");
        framed.send(ok_packet(1, 0, 0, self.status_flags())).await?;
        Ok(())
    }

    /// Borrow a backend connection if none is held and align it with the session
    async fn ensure_backend(&mut self, for_write: bool) -> Result<&mut C::Conn> {
        if self.backend.is_none() {
            let pool = self.router.resolve(&self.cluster, for_write).await?;
            self.backend = Some(pool.get_conn().await?);
        }

        let conn = self
            .backend
            .as_mut()
            .and_then(|b| b.get_mut())
            .ok_or_else(|| Error::Network("backend connection already released".into()))?;

        if let Some(schema) = self.identity.schema.as_deref() {
            if !schema.is_empty() && conn.schema() != schema {
                conn.select_schema(schema).await?;
            }
        }
        if !self.charset.is_empty() && conn.charset() != self.charset {
            conn.set_charset(&self.charset).await?;
        }
        Ok(conn)
    }

    async fn relay<S>(&mut self, framed: &mut ClientStream<S>, packet: MySqlPacket, for_write: bool) -> Result<()>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send,
    {
        let mut sink = ClientSink::new(framed);
        let outcome = match self.ensure_backend(for_write).await {
            Ok(conn) => conn.relay_command(packet.payload, &mut sink).await,
            Err(e) => Err(e),
        };

        let mut keep = false;
        if let Some(conn) = self.backend.as_ref().and_then(|b| b.get()) {
            if conn.last_error().is_none() {
                // Follow SET NAMES so later borrows are aligned to the client's choice
                if outcome.is_ok() && !conn.charset().is_empty() && conn.charset() != self.charset {
                    tracing::debug!(session = self.id, charset = conn.charset(), "Client charset changed");
                    self.charset = conn.charset().to_string();
                }
                keep = conn.is_in_transaction() || !conn.is_autocommit();
            }
        }
        if !keep {
            self.release_backend().await;
        }

        match outcome {
            Ok(()) => sink.finish().await,
            Err(e) => {
                tracing::warn!(session = self.id, cluster = %self.cluster, "Backend request failed: {}", e);
                if sink.has_written() {
                    // The client already holds part of a response; no way to resync it
                    return Err(e);
                }
                sink.reply_error(&e).await
            }
        }
    }

    async fn release_backend(&mut self) {
        if let Some(mut pooled) = self.backend.take() {
            pooled.release().await;
        }
    }
}

/// Writes relayed response packets to the client, numbered from 1.
///
/// The latest packet is held back until [`ClientSink::finish`], so the
/// backend connection can go back to its pool before the client sees the end
/// of the response. Earlier packets are fed as they arrive and the codec
/// flushes once its write buffer fills.
struct ClientSink<'a, S> {
    framed: &'a mut ClientStream<S>,
    sequence_id: u8,
    held: Option<Bytes>,
    written: bool,
}

impl<'a, S> ClientSink<'a, S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    fn new(framed: &'a mut ClientStream<S>) -> Self {
        Self {
            framed,
            sequence_id: 0,
            held: None,
            written: false,
        }
    }

    fn has_written(&self) -> bool {
        self.written
    }

    async fn write(&mut self, payload: Bytes) -> Result<()> {
        self.sequence_id = self.sequence_id.wrapping_add(1);
        self.written = true;
        self.framed.feed(MySqlPacket::new(self.sequence_id, payload)).await
    }

    async fn finish(&mut self) -> Result<()> {
        if let Some(last) = self.held.take() {
            self.write(last).await?;
        }
        self.framed.flush().await
    }

    /// Answer with an ERR packet instead of the (unsent) response
    async fn reply_error(&mut self, err: &Error) -> Result<()> {
        self.held = None;
        self.framed.send(error_packet_for(1, err)).await
    }
}

#[async_trait]
impl<S> PacketSink for ClientSink<'_, S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    async fn deliver(&mut self, payload: Bytes) -> Result<()> {
        if let Some(previous) = self.held.replace(payload) {
            self.write(previous).await?;
        }
        Ok(())
    }
}
