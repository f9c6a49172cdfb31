//! MySQL Proxy Server
//!
//! Accepts client connections and runs one [`Session`] task per client.
//! The number of concurrent sessions is capped by `global.max_connections`;
//! clients above the cap are turned away with error 1040.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use futures::SinkExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{watch, Semaphore};
use tokio_util::codec::Framed;

use super::session::Session;
use crate::backend::Connector;
use crate::error::{Error, Result};
use crate::protocol::{error_packet_for, PacketCodec};
use crate::router::ClusterRouter;

/// Client-facing listener
pub struct ProxyServer<C: Connector> {
    router: Arc<ClusterRouter<C>>,
    sessions: Arc<Semaphore>,
    max_sessions: usize,
    next_id: AtomicU32,
}

impl<C: Connector> ProxyServer<C> {
    pub fn new(router: Arc<ClusterRouter<C>>, max_sessions: usize) -> Self {
        Self {
            router,
            sessions: Arc::new(Semaphore::new(max_sessions)),
            max_sessions,
            next_id: AtomicU32::new(1),
        }
    }

    /// Sessions currently running
    pub fn active_sessions(&self) -> usize {
        self.max_sessions - self.sessions.available_permits()
    }

    pub fn max_sessions(&self) -> usize {
        self.max_sessions
    }

    /// Bind `address` and serve until `shutdown` flips to true
    pub async fn start(self: Arc<Self>, address: &str, shutdown: watch::Receiver<bool>) -> Result<()> {
        let listener = TcpListener::bind(address).await?;
        tracing::info!("MySQL proxy listening on {}", address);
        self.serve(listener, shutdown).await
    }

    /// Accept loop over an already bound listener
    pub async fn serve(self: Arc<Self>, listener: TcpListener, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        loop {
            let (socket, addr) = tokio::select! {
                accepted = listener.accept() => accepted?,
                _ = shutdown.changed() => {
                    tracing::info!("Proxy listener stopping");
                    return Ok(());
                }
            };
            let _ = socket.set_nodelay(true);

            let permit = match Arc::clone(&self.sessions).try_acquire_owned() {
                Ok(permit) => permit,
                Err(_) => {
                    tracing::warn!(
                        client = %addr,
                        max = self.max_sessions,
                        "Rejecting client: too many connections"
                    );
                    tokio::spawn(reject(socket));
                    continue;
                }
            };

            let id = self.next_id.fetch_add(1, Ordering::Relaxed);
            tracing::debug!(session = id, client = %addr, "New MySQL client connection");
            let router = Arc::clone(&self.router);
            tokio::spawn(async move {
                let _permit = permit;
                if let Err(e) = handle_connection(id, socket, addr, router).await {
                    tracing::error!(session = id, client = %addr, "Proxy connection error: {}", e);
                }
            });
        }
    }
}

async fn handle_connection<C: Connector>(
    id: u32,
    socket: TcpStream,
    addr: SocketAddr,
    router: Arc<ClusterRouter<C>>,
) -> Result<()> {
    Session::new(id, addr.ip(), router).run(socket).await
}

/// Answer the greeting slot with ER_CON_COUNT_ERROR and hang up
async fn reject(socket: TcpStream) {
    let mut framed = Framed::new(socket, PacketCodec);
    let _ = framed.send(error_packet_for(0, &Error::TooManyConnections)).await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::mock::MockConnector;
    use crate::config::tests::SAMPLE;
    use crate::config::ProxyConfig;
    use crate::error::ER_CON_COUNT_ERROR;
    use crate::protocol::{parse_error_packet, HandshakeV10};
    use crate::reload::ConfigStore;
    use futures::StreamExt;

    #[tokio::test]
    async fn test_session_cap_rejects_with_1040() {
        let store = Arc::new(ConfigStore::new(ProxyConfig::from_str(SAMPLE).unwrap()));
        let router = Arc::new(ClusterRouter::new(store, Arc::new(MockConnector::new()), 1));
        let server = Arc::new(ProxyServer::new(router, 1));

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (stop_tx, stop_rx) = watch::channel(false);
        let handle = tokio::spawn(Arc::clone(&server).serve(listener, stop_rx));

        let mut first = Framed::new(TcpStream::connect(addr).await.unwrap(), PacketCodec);
        let greeting = first.next().await.unwrap().unwrap();
        assert!(HandshakeV10::parse(&greeting.payload).is_ok());
        assert_eq!(server.active_sessions(), 1);

        let mut second = Framed::new(TcpStream::connect(addr).await.unwrap(), PacketCodec);
        let reply = second.next().await.unwrap().unwrap();
        assert_eq!(parse_error_packet(&reply.payload).mysql_code(), ER_CON_COUNT_ERROR);

        stop_tx.send(true).unwrap();
        handle.await.unwrap().unwrap();
    }
}
