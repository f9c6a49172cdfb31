//! Backend Connections
//!
//! The pool only depends on the [`BackendConnection`] capability contract;
//! the wire protocol lives behind a [`Connector`] so it can be swapped.

mod mysql;
mod pool;

#[cfg(test)]
pub(crate) mod mock;

pub use mysql::{MySqlConnection, MySqlConnector};
pub use pool::{ConnectionPool, PoolStats, PooledConn};

use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;

use crate::config::{GlobalConfig, NodeConfig};
use crate::error::{Error, Result};

/// Everything needed to dial one physical node
#[derive(Debug, Clone, PartialEq)]
pub struct DialTarget {
    /// host:port
    pub address: String,
    pub user: String,
    pub password: String,
    /// Schema selected at connect time (may be empty)
    pub schema: String,
    /// Charset requested at connect time
    pub charset: String,
    /// Bound on TCP connect plus handshake
    pub connect_timeout: Duration,
    /// Bound on every later read or write
    pub io_timeout: Duration,
}

impl DialTarget {
    pub fn from_node(node: &NodeConfig, global: &GlobalConfig) -> Self {
        Self {
            address: node.addr(),
            user: node.username.clone(),
            password: node.password.clone(),
            schema: node.db_name.clone(),
            charset: global.default_charset.clone(),
            connect_timeout: node.connect_timeout(),
            io_timeout: global.server_timeout(),
        }
    }
}

/// A live, stateful connection to one node
#[async_trait]
pub trait BackendConnection: Send + Sync + 'static {
    /// Health check round trip
    async fn ping(&mut self) -> Result<()>;

    /// Close the connection; it must not be used afterwards
    async fn close(&mut self);

    /// Whether the server reports an open transaction
    fn is_in_transaction(&self) -> bool;

    /// Roll back the open transaction
    async fn rollback(&mut self) -> Result<()>;

    /// Whether the server reports autocommit enabled
    fn is_autocommit(&self) -> bool;

    /// Switch the connection charset
    async fn set_charset(&mut self, charset: &str) -> Result<()>;

    /// Active connection charset
    fn charset(&self) -> &str;

    /// Active schema
    fn schema(&self) -> &str;

    /// Switch the active schema
    async fn select_schema(&mut self, schema: &str) -> Result<()>;

    /// Run an administrative statement that returns no rows
    async fn execute_admin(&mut self, sql: &str) -> Result<()>;

    /// Forward one client command and hand each response packet payload to
    /// `sink` as it arrives. Backend ERR responses are delivered as packets,
    /// not returned as errors.
    async fn relay_command(&mut self, command: Bytes, sink: &mut dyn PacketSink) -> Result<()>;

    /// Last transport-level fault; a connection with one must not be reused
    fn last_error(&self) -> Option<&Error>;

    /// Take the last transport-level fault
    fn take_error(&mut self) -> Option<Error>;
}

/// Receives the packets of a relayed response in order
#[async_trait]
pub trait PacketSink: Send {
    async fn deliver(&mut self, payload: Bytes) -> Result<()>;
}

#[async_trait]
impl PacketSink for Vec<Bytes> {
    async fn deliver(&mut self, payload: Bytes) -> Result<()> {
        self.push(payload);
        Ok(())
    }
}

/// Drops every packet; used to drain responses nobody asked for
pub struct DiscardSink;

#[async_trait]
impl PacketSink for DiscardSink {
    async fn deliver(&mut self, _payload: Bytes) -> Result<()> {
        Ok(())
    }
}

/// Dials backend connections
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    type Conn: BackendConnection;

    async fn connect(&self, target: &DialTarget) -> Result<Self::Conn>;
}
