//! MySQL Protocol Proxy
//!
//! Speaks the MySQL server side of the wire protocol to applications and
//! relays their statements to pooled backend connections.

mod server;
mod session;

pub use server::ProxyServer;
pub use session::Session;
