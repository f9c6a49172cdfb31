//! Connection Pool
//!
//! One pool per physical node. Idle connections are spread over several
//! shards, each behind its own lock, so concurrent borrowers rarely contend.
//! A borrow never waits for a connection to come back: an empty shard means
//! a fresh dial.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicI64, AtomicUsize, Ordering};
use std::sync::Arc;

use rand::Rng;
use serde::Serialize;
use tokio::sync::Mutex;

use super::{BackendConnection, Connector, DialTarget};
use crate::error::{Error, Result};

/// Connection pool for one node
pub struct ConnectionPool<C: Connector> {
    connector: Arc<C>,
    target: DialTarget,
    /// Charset every reused connection is reset to
    default_charset: String,
    /// Idle queues; oldest entry at the front
    shards: Vec<Mutex<VecDeque<C::Conn>>>,
    /// Idle cap per shard (0 disables idle pooling)
    max_idle_conns: AtomicUsize,
    /// Dialed and not yet closed. Signed because `close` forgets checked-out connections.
    live: AtomicI64,
    /// Soft limit reported by stats and logged when exceeded
    max_conns: usize,
}

/// Point-in-time view of a pool
#[derive(Debug, Clone, Serialize)]
pub struct PoolStats {
    pub address: String,
    pub schema: String,
    pub live: i64,
    pub idle: usize,
    pub shards: usize,
    pub max_idle_per_shard: usize,
    pub max_connections: usize,
}

impl<C: Connector> ConnectionPool<C> {
    /// Create an empty pool
    pub fn new(
        connector: Arc<C>,
        target: DialTarget,
        shard_count: usize,
        max_idle_conns: usize,
        max_conns: usize,
    ) -> Self {
        let shard_count = shard_count.max(1);
        let default_charset = target.charset.clone();
        Self {
            connector,
            target,
            default_charset,
            shards: (0..shard_count).map(|_| Mutex::new(VecDeque::new())).collect(),
            max_idle_conns: AtomicUsize::new(max_idle_conns),
            live: AtomicI64::new(0),
            max_conns,
        }
    }

    /// Node address
    pub fn addr(&self) -> &str {
        &self.target.address
    }

    /// Dial target of this pool
    pub fn target(&self) -> &DialTarget {
        &self.target
    }

    pub fn shard_count(&self) -> usize {
        self.shards.len()
    }

    pub fn max_idle_conns(&self) -> usize {
        self.max_idle_conns.load(Ordering::Relaxed)
    }

    pub fn set_max_idle_conns(&self, num: usize) {
        self.max_idle_conns.store(num, Ordering::Relaxed);
    }

    /// Connections dialed and not yet closed, idle or checked out
    pub fn live_count(&self) -> i64 {
        self.live.load(Ordering::SeqCst)
    }

    /// Connections currently sitting in idle queues
    pub async fn idle_count(&self) -> usize {
        let mut total = 0;
        for shard in &self.shards {
            total += shard.lock().await.len();
        }
        total
    }

    /// Idle length of each shard
    pub async fn shard_lengths(&self) -> Vec<usize> {
        let mut lengths = Vec::with_capacity(self.shards.len());
        for shard in &self.shards {
            lengths.push(shard.lock().await.len());
        }
        lengths
    }

    pub async fn stats(&self) -> PoolStats {
        PoolStats {
            address: self.target.address.clone(),
            schema: self.target.schema.clone(),
            live: self.live_count(),
            idle: self.idle_count().await,
            shards: self.shards.len(),
            max_idle_per_shard: self.max_idle_conns(),
            max_connections: self.max_conns,
        }
    }

    fn pick_shard(&self) -> usize {
        rand::thread_rng().gen_range(0..self.shards.len())
    }

    async fn new_conn(&self) -> Result<C::Conn> {
        let conn = self.connector.connect(&self.target).await?;
        let live = self.live.fetch_add(1, Ordering::SeqCst) + 1;
        if self.max_conns > 0 && live > self.max_conns as i64 {
            tracing::warn!(
                address = %self.target.address,
                live,
                max = self.max_conns,
                "Backend connections above configured maximum"
            );
        }
        Ok(conn)
    }

    /// Close a connection and drop it from the live count
    async fn discard(&self, mut conn: C::Conn) {
        self.live.fetch_sub(1, Ordering::SeqCst);
        conn.close().await;
    }

    /// Reset a reused connection to a clean state: no open transaction,
    /// autocommit on, default charset.
    async fn try_reuse(&self, conn: &mut C::Conn) -> Result<()> {
        conn.ping().await?;

        if conn.is_in_transaction() {
            conn.rollback().await?;
        }

        if !conn.is_autocommit() {
            conn.execute_admin("SET autocommit = 1").await?;
        }

        if conn.charset() != self.default_charset {
            conn.set_charset(&self.default_charset).await?;
        }

        Ok(())
    }

    /// Borrow a connection: a sanitized idle one if available, otherwise a fresh dial
    pub async fn pop_conn(&self) -> Result<C::Conn> {
        let idx = self.pick_shard();
        let candidate = self.shards[idx].lock().await.pop_front();

        if let Some(mut conn) = candidate {
            match self.try_reuse(&mut conn).await {
                Ok(()) => return Ok(conn),
                Err(e) => {
                    tracing::debug!(address = %self.target.address, "Discarding stale idle connection: {}", e);
                    self.discard(conn).await;
                }
            }
        }

        self.new_conn().await
    }

    /// Return a borrowed connection. A connection with an error is closed,
    /// otherwise it joins a random shard, evicting that shard's oldest entry
    /// when the shard is full.
    pub async fn push_conn(&self, conn: C::Conn, last_err: Option<&Error>) {
        if let Some(err) = last_err {
            tracing::debug!(address = %self.target.address, "Closing tainted connection: {}", err);
            self.discard(conn).await;
            return;
        }

        let max_idle = self.max_idle_conns();
        if max_idle == 0 {
            self.discard(conn).await;
            return;
        }

        let idx = self.pick_shard();
        let evicted = {
            let mut shard = self.shards[idx].lock().await;
            let mut evicted = Vec::new();
            while shard.len() >= max_idle {
                match shard.pop_front() {
                    Some(old) => evicted.push(old),
                    None => break,
                }
            }
            shard.push_back(conn);
            evicted
        };

        for old in evicted {
            self.discard(old).await;
        }
    }

    /// Borrow a connection wrapped for single release
    pub async fn get_conn(self: &Arc<Self>) -> Result<PooledConn<C>> {
        let conn = self.pop_conn().await?;
        Ok(PooledConn {
            conn: Some(conn),
            pool: Arc::clone(self),
        })
    }

    /// Borrow, ping and return one connection
    pub async fn ping(&self) -> Result<()> {
        let mut conn = self.pop_conn().await?;
        let result = conn.ping().await;
        self.push_conn(conn, result.as_ref().err()).await;
        result
    }

    /// Dial until at least `count` connections are idle. Returns how many were added.
    pub async fn prefill(&self, count: usize) -> Result<usize> {
        let mut added = 0;
        while self.idle_count().await < count.min(self.max_idle_conns() * self.shards.len()) {
            let conn = self.new_conn().await?;
            self.push_conn(conn, None).await;
            added += 1;
            if added >= count {
                break;
            }
        }
        Ok(added)
    }

    /// Close every idle connection and reset the live count to zero.
    ///
    /// Connections checked out at this moment are not tracked afterwards:
    /// returning them later drives the count below zero.
    pub async fn close(&self) {
        for shard in &self.shards {
            let drained: Vec<C::Conn> = {
                let mut shard = shard.lock().await;
                std::iter::from_fn(|| shard.pop_back()).collect()
            };
            for mut conn in drained {
                conn.close().await;
            }
        }
        self.live.store(0, Ordering::SeqCst);
    }

    /// Account for a connection that vanished without being closed
    fn forget(&self) {
        self.live.fetch_sub(1, Ordering::SeqCst);
    }
}

/// A borrowed connection, returned to its pool at most once
pub struct PooledConn<C: Connector> {
    conn: Option<C::Conn>,
    pool: Arc<ConnectionPool<C>>,
}

impl<C: Connector> PooledConn<C> {
    /// The wrapped connection, unless already released
    pub fn get_mut(&mut self) -> Option<&mut C::Conn> {
        self.conn.as_mut()
    }

    pub fn get(&self) -> Option<&C::Conn> {
        self.conn.as_ref()
    }

    pub fn is_released(&self) -> bool {
        self.conn.is_none()
    }

    /// Pool the connection came from
    pub fn pool(&self) -> &Arc<ConnectionPool<C>> {
        &self.pool
    }

    /// Return the connection with its last error. Later calls do nothing.
    pub async fn release(&mut self) {
        if let Some(mut conn) = self.conn.take() {
            let err = conn.take_error();
            self.pool.push_conn(conn, err.as_ref()).await;
        }
    }
}

impl<C: Connector> Drop for PooledConn<C> {
    fn drop(&mut self) {
        let conn = match self.conn.take() {
            Some(c) => c,
            None => return,
        };
        // State of an abandoned borrow is unknown, so it is never pooled again
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                let pool = Arc::clone(&self.pool);
                handle.spawn(async move {
                    let err = Error::Network("connection dropped without release".into());
                    pool.push_conn(conn, Some(&err)).await;
                });
            }
            Err(_) => {
                self.pool.forget();
                drop(conn);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::mock::{MockConnector, MockConn};
    use std::time::Duration;

    fn pool(connector: &Arc<MockConnector>, shards: usize, max_idle: usize) -> Arc<ConnectionPool<MockConnector>> {
        let target = DialTarget {
            address: "10.0.0.1:3306".into(),
            user: "proxy".into(),
            password: "pw".into(),
            schema: "orders".into(),
            charset: "utf8".into(),
            connect_timeout: Duration::from_secs(1),
            io_timeout: Duration::from_secs(1),
        };
        Arc::new(ConnectionPool::new(Arc::clone(connector), target, shards, max_idle, 100))
    }

    #[tokio::test]
    async fn test_pop_on_empty_pool_dials() {
        let connector = Arc::new(MockConnector::new());
        let pool = pool(&connector, 1, 2);
        assert_eq!(pool.live_count(), 0);

        let conn = pool.pop_conn().await.unwrap();
        assert_eq!(pool.live_count(), 1);
        assert_eq!(connector.dials(), 1);
        assert!(!conn.is_closed());
    }

    #[tokio::test]
    async fn test_full_shard_evicts_oldest() {
        let connector = Arc::new(MockConnector::new());
        let pool = pool(&connector, 1, 2);

        let c1 = pool.pop_conn().await.unwrap();
        let c2 = pool.pop_conn().await.unwrap();
        let c3 = pool.pop_conn().await.unwrap();
        let (id1, id2, id3) = (c1.id, c2.id, c3.id);
        let c1_closed = c1.closed_flag();
        assert_eq!(pool.live_count(), 3);

        pool.push_conn(c1, None).await;
        pool.push_conn(c2, None).await;
        pool.push_conn(c3, None).await;

        assert!(c1_closed.load(Ordering::SeqCst));
        assert_eq!(pool.live_count(), 2);
        assert_eq!(pool.idle_count().await, 2);

        let a = pool.pop_conn().await.unwrap();
        let b = pool.pop_conn().await.unwrap();
        assert_eq!((a.id, b.id), (id2, id3));
        assert_ne!(a.id, id1);
        assert_eq!(connector.dials(), 3);
    }

    #[tokio::test]
    async fn test_tainted_push_closes() {
        let connector = Arc::new(MockConnector::new());
        let pool = pool(&connector, 2, 4);

        let conn = pool.pop_conn().await.unwrap();
        let id = conn.id;
        let closed = conn.closed_flag();
        let err = Error::Network("broken pipe".into());
        pool.push_conn(conn, Some(&err)).await;

        assert!(closed.load(Ordering::SeqCst));
        assert_eq!(pool.live_count(), 0);
        assert_eq!(pool.idle_count().await, 0);

        for _ in 0..8 {
            let c = pool.pop_conn().await.unwrap();
            assert_ne!(c.id, id);
            pool.push_conn(c, None).await;
        }
    }

    #[tokio::test]
    async fn test_idle_pooling_disabled() {
        let connector = Arc::new(MockConnector::new());
        let pool = pool(&connector, 1, 0);

        let conn = pool.pop_conn().await.unwrap();
        let closed = conn.closed_flag();
        pool.push_conn(conn, None).await;
        assert!(closed.load(Ordering::SeqCst));
        assert_eq!(pool.live_count(), 0);
        assert_eq!(pool.idle_count().await, 0);
    }

    #[tokio::test]
    async fn test_reuse_sanitizes_connection() {
        let connector = Arc::new(MockConnector::new());
        let pool = pool(&connector, 1, 2);

        let mut conn: MockConn = pool.pop_conn().await.unwrap();
        conn.in_transaction = true;
        conn.autocommit = false;
        conn.charset = "latin1".into();
        let id = conn.id;
        pool.push_conn(conn, None).await;

        let conn = pool.pop_conn().await.unwrap();
        assert_eq!(conn.id, id);
        assert!(!conn.is_in_transaction());
        assert!(conn.is_autocommit());
        assert_eq!(conn.charset(), "utf8");
        assert_eq!(conn.rollbacks, 1);
        assert_eq!(conn.admin_statements, vec!["SET autocommit = 1".to_string()]);
    }

    #[tokio::test]
    async fn test_failed_sanitation_discards_and_redials() {
        let connector = Arc::new(MockConnector::new());
        let pool = pool(&connector, 1, 2);

        let mut conn = pool.pop_conn().await.unwrap();
        conn.in_transaction = true;
        conn.fail_rollback = true;
        let closed = conn.closed_flag();
        let id = conn.id;
        pool.push_conn(conn, None).await;

        let fresh = pool.pop_conn().await.unwrap();
        assert_ne!(fresh.id, id);
        assert!(closed.load(Ordering::SeqCst));
        assert_eq!(pool.live_count(), 1);
    }

    #[tokio::test]
    async fn test_failed_autocommit_reset_discards_and_redials() {
        let connector = Arc::new(MockConnector::new());
        let pool = pool(&connector, 1, 2);

        let mut conn = pool.pop_conn().await.unwrap();
        conn.autocommit = false;
        conn.fail_admin = true;
        let closed = conn.closed_flag();
        let id = conn.id;
        pool.push_conn(conn, None).await;

        let fresh = pool.pop_conn().await.unwrap();
        assert_ne!(fresh.id, id);
        assert!(fresh.autocommit);
        assert!(closed.load(Ordering::SeqCst));
        assert_eq!(pool.live_count(), 1);
        assert_eq!(connector.dials(), 2);
    }

    #[tokio::test]
    async fn test_failed_charset_reset_discards_and_redials() {
        let connector = Arc::new(MockConnector::new());
        let pool = pool(&connector, 1, 2);

        let mut conn = pool.pop_conn().await.unwrap();
        conn.charset = "latin1".into();
        conn.fail_set_charset = true;
        let closed = conn.closed_flag();
        let id = conn.id;
        pool.push_conn(conn, None).await;

        let fresh = pool.pop_conn().await.unwrap();
        assert_ne!(fresh.id, id);
        assert_eq!(fresh.charset, pool.target().charset);
        assert!(closed.load(Ordering::SeqCst));
        assert_eq!(pool.live_count(), 1);
        assert_eq!(connector.dials(), 2);
    }

    #[tokio::test]
    async fn test_failed_ping_discards() {
        let connector = Arc::new(MockConnector::new());
        let pool = pool(&connector, 1, 2);

        let mut conn = pool.pop_conn().await.unwrap();
        conn.fail_ping = true;
        let id = conn.id;
        pool.push_conn(conn, None).await;

        let fresh = pool.pop_conn().await.unwrap();
        assert_ne!(fresh.id, id);
        assert_eq!(pool.live_count(), 1);
    }

    #[tokio::test]
    async fn test_dial_failure_leaves_count() {
        let connector = Arc::new(MockConnector::new());
        connector.fail_dials(true);
        let pool = pool(&connector, 1, 2);

        assert!(pool.pop_conn().await.is_err());
        assert_eq!(pool.live_count(), 0);
    }

    #[tokio::test]
    async fn test_close_drains_all_shards() {
        let connector = Arc::new(MockConnector::new());
        let pool = pool(&connector, 4, 12);

        let mut conns = Vec::new();
        for _ in 0..12 {
            conns.push(pool.pop_conn().await.unwrap());
        }
        let checked_out = conns.pop().unwrap();
        let flags: Vec<_> = conns.iter().map(|c| c.closed_flag()).collect();
        for c in conns {
            pool.push_conn(c, None).await;
        }
        assert_eq!(pool.live_count(), 12);

        pool.close().await;
        assert_eq!(pool.live_count(), 0);
        assert_eq!(pool.idle_count().await, 0);
        assert_eq!(flags.iter().filter(|f| f.load(Ordering::SeqCst)).count(), 11);

        // The borrowed connection was not accounted for by close
        pool.push_conn(checked_out, Some(&Error::ShuttingDown)).await;
        assert_eq!(pool.live_count(), -1);
    }

    #[tokio::test]
    async fn test_ping_through_pool() {
        let connector = Arc::new(MockConnector::new());
        let pool = pool(&connector, 1, 2);
        pool.ping().await.unwrap();
        assert_eq!(pool.live_count(), 1);
        assert_eq!(pool.idle_count().await, 1);
    }

    #[tokio::test]
    async fn test_release_is_idempotent() {
        let connector = Arc::new(MockConnector::new());
        let pool = pool(&connector, 1, 2);

        let mut pooled = pool.get_conn().await.unwrap();
        pooled.release().await;
        pooled.release().await;
        assert!(pooled.is_released());
        assert_eq!(pool.idle_count().await, 1);
        assert_eq!(pool.live_count(), 1);
    }

    #[tokio::test]
    async fn test_release_forwards_last_error() {
        let connector = Arc::new(MockConnector::new());
        let pool = pool(&connector, 1, 2);

        let mut pooled = pool.get_conn().await.unwrap();
        pooled.get_mut().unwrap().error = Some(Error::Network("reset".into()));
        pooled.release().await;
        assert_eq!(pool.idle_count().await, 0);
        assert_eq!(pool.live_count(), 0);
    }

    #[tokio::test]
    async fn test_dropped_borrow_is_discarded() {
        let connector = Arc::new(MockConnector::new());
        let pool = pool(&connector, 1, 2);

        let pooled = pool.get_conn().await.unwrap();
        let closed = pooled.get().unwrap().closed_flag();
        drop(pooled);

        for _ in 0..50 {
            if closed.load(Ordering::SeqCst) {
                break;
            }
            tokio::task::yield_now().await;
        }
        assert!(closed.load(Ordering::SeqCst));
        assert_eq!(pool.live_count(), 0);
    }

    #[tokio::test]
    async fn test_prefill() {
        let connector = Arc::new(MockConnector::new());
        let pool = pool(&connector, 1, 4);
        assert_eq!(pool.prefill(3).await.unwrap(), 3);
        assert_eq!(pool.idle_count().await, 3);
        assert_eq!(pool.live_count(), 3);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_live_count_under_concurrency() {
        let connector = Arc::new(MockConnector::new());
        let pool = pool(&connector, 4, 3);

        let mut tasks = Vec::new();
        for worker in 0..16 {
            let pool = Arc::clone(&pool);
            tasks.push(tokio::spawn(async move {
                for round in 0..50 {
                    let conn = pool.pop_conn().await.unwrap();
                    tokio::task::yield_now().await;
                    if (worker + round) % 7 == 0 {
                        let err = Error::Network("simulated".into());
                        pool.push_conn(conn, Some(&err)).await;
                    } else {
                        pool.push_conn(conn, None).await;
                    }
                }
            }));
        }
        for t in tasks {
            t.await.unwrap();
        }

        assert_eq!(pool.live_count(), connector.open_connections() as i64);
        assert_eq!(pool.idle_count().await as i64, pool.live_count());
        assert!(pool.shard_lengths().await.iter().all(|&len| len <= 3));
    }
}
