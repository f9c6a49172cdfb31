//! sqlmux - MySQL Protocol Proxy
//!
//! Applications connect to sqlmux as if it were a MySQL server. Each client
//! is authenticated against the configured users and its statements are
//! relayed to the master of the user's cluster over pooled backend
//! connections.
//!
//! # Architecture
//!
//! - [`backend`]: per-node connection pools with sharded idle queues; a
//!   connection is reset (rollback, autocommit, charset) before reuse
//! - [`router`]: maps a cluster and write intent to a node pool
//! - [`auth`]: mysql_native_password verification and schema grants
//! - [`proxy`]: client listener and per-connection sessions
//! - [`reload`]: configuration snapshots with polling hot reload
//! - [`api`]: management HTTP API

pub mod api;
pub mod auth;
pub mod backend;
pub mod config;
pub mod error;
pub mod protocol;
pub mod proxy;
pub mod reload;
pub mod router;
pub mod tuning;

pub use config::ProxyConfig;
pub use error::{Error, Result};

/// Re-export commonly used types
pub mod prelude {
    pub use crate::auth::{auth_hash, ClientIdentity, SessionAuthenticator};
    pub use crate::backend::{BackendConnection, ConnectionPool, Connector, MySqlConnector, PacketSink, PooledConn};
    pub use crate::config::ProxyConfig;
    pub use crate::error::{Error, Result};
    pub use crate::proxy::{ProxyServer, Session};
    pub use crate::reload::ConfigStore;
    pub use crate::router::ClusterRouter;
}
