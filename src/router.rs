//! Cluster Routing
//!
//! Maps a cluster name and write intent to the connection pool of a node.
//! Pools are created on first use and shared across configuration reloads.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use serde::Serialize;
use tokio::sync::RwLock;

use crate::backend::{ConnectionPool, Connector, DialTarget, PoolStats};
use crate::config::{GlobalConfig, NodeConfig, ProxyConfig};
use crate::error::{Error, Result};
use crate::reload::ConfigStore;

/// Routes sessions to node pools
pub struct ClusterRouter<C: Connector> {
    config: Arc<ConfigStore>,
    connector: Arc<C>,
    /// Pools keyed by `user@host:port/db`
    pools: RwLock<HashMap<String, Arc<ConnectionPool<C>>>>,
    shard_count: usize,
    writes_routed: AtomicU64,
    reads_routed: AtomicU64,
}

/// Routing summary of one cluster
#[derive(Debug, Clone, Serialize)]
pub struct ClusterStats {
    pub name: String,
    pub master: Option<String>,
    pub slaves: Vec<String>,
}

/// Router-wide counters
#[derive(Debug, Clone, Serialize)]
pub struct RouterStats {
    pub pools: usize,
    pub writes_routed: u64,
    pub reads_routed: u64,
}

impl<C: Connector> ClusterRouter<C> {
    pub fn new(config: Arc<ConfigStore>, connector: Arc<C>, shard_count: usize) -> Self {
        Self {
            config,
            connector,
            pools: RwLock::new(HashMap::new()),
            shard_count: shard_count.max(1),
            writes_routed: AtomicU64::new(0),
            reads_routed: AtomicU64::new(0),
        }
    }

    pub fn config(&self) -> &Arc<ConfigStore> {
        &self.config
    }

    /// Pool serving `cluster` for the given intent.
    ///
    /// Reads are sent to the master as well; replica selection plugs in here.
    pub async fn resolve(&self, cluster: &str, for_write: bool) -> Result<Arc<ConnectionPool<C>>> {
        let snapshot = self.config.snapshot().await;
        let cluster_config = snapshot
            .clusters
            .get(cluster)
            .ok_or_else(|| Error::ClusterNotFound(cluster.to_string()))?;
        let master = cluster_config
            .master
            .as_ref()
            .ok_or_else(|| Error::NoMaster(cluster.to_string()))?;

        if for_write {
            self.writes_routed.fetch_add(1, Ordering::Relaxed);
        } else {
            self.reads_routed.fetch_add(1, Ordering::Relaxed);
        }

        Ok(self.pool_for(master, &snapshot.global).await)
    }

    /// Get or create the pool for a node
    async fn pool_for(&self, node: &NodeConfig, global: &GlobalConfig) -> Arc<ConnectionPool<C>> {
        let key = node.key();
        let target = DialTarget::from_node(node, global);

        if let Some(pool) = self.pools.read().await.get(&key) {
            if pool.target() == &target {
                pool.set_max_idle_conns(node.max_connection_pool_size);
                return Arc::clone(pool);
            }
        }

        let mut pools = self.pools.write().await;
        if let Some(pool) = pools.get(&key) {
            if pool.target() == &target {
                return Arc::clone(pool);
            }
        }

        tracing::info!(
            node = %key,
            shards = self.shard_count,
            max_idle = node.max_connection_pool_size,
            "Creating connection pool"
        );
        let pool = Arc::new(ConnectionPool::new(
            Arc::clone(&self.connector),
            target,
            self.shard_count,
            node.max_connection_pool_size,
            node.max_connections,
        ));
        // Same key with different settings (password, timeouts) replaces the pool
        if let Some(old) = pools.insert(key, Arc::clone(&pool)) {
            tokio::spawn(async move { old.close().await });
        }
        pool
    }

    /// Close pools whose node is absent from `snapshot`. Returns how many were closed.
    pub async fn prune(&self, snapshot: &ProxyConfig) -> usize {
        let wanted: HashSet<String> = snapshot.all_nodes().map(|n| n.key()).collect();
        let removed: Vec<(String, Arc<ConnectionPool<C>>)> = {
            let mut pools = self.pools.write().await;
            let stale: Vec<String> = pools.keys().filter(|k| !wanted.contains(*k)).cloned().collect();
            stale
                .into_iter()
                .filter_map(|k| pools.remove(&k).map(|p| (k, p)))
                .collect()
        };

        for (key, pool) in &removed {
            tracing::info!(node = %key, "Closing pool for removed node");
            pool.close().await;
        }
        removed.len()
    }

    /// Prune pools after every published configuration
    pub fn spawn_pruner(self: Arc<Self>) -> tokio::task::JoinHandle<()> {
        let mut updates = self.config.subscribe();
        tokio::spawn(async move {
            while updates.changed().await.is_ok() {
                let snapshot = self.config.snapshot().await;
                let closed = self.prune(&snapshot).await;
                tracing::debug!(generation = *updates.borrow(), closed, "Pools reconciled with configuration");
            }
        })
    }

    /// (node key, pool) pairs
    pub async fn pools(&self) -> Vec<(String, Arc<ConnectionPool<C>>)> {
        let pools = self.pools.read().await;
        let mut list: Vec<_> = pools.iter().map(|(k, p)| (k.clone(), Arc::clone(p))).collect();
        list.sort_by(|a, b| a.0.cmp(&b.0));
        list
    }

    pub async fn pool_stats(&self) -> Vec<PoolStats> {
        let mut stats = Vec::new();
        for (_, pool) in self.pools().await {
            stats.push(pool.stats().await);
        }
        stats
    }

    /// Create pools for every master and dial `min_connections` of the users mapped to it
    pub async fn warm_up(&self) {
        let snapshot = self.config.snapshot().await;
        for (name, cluster) in &snapshot.clusters {
            let master = match &cluster.master {
                Some(m) => m,
                None => continue,
            };
            let wanted = snapshot
                .users
                .values()
                .filter(|u| &u.cluster_name == name)
                .map(|u| u.min_connections)
                .max()
                .unwrap_or(0);
            let pool = self.pool_for(master, &snapshot.global).await;
            if wanted == 0 {
                continue;
            }
            match pool.prefill(wanted).await {
                Ok(added) => tracing::info!(cluster = %name, node = %pool.addr(), added, "Pool prefilled"),
                Err(e) => tracing::warn!(cluster = %name, node = %pool.addr(), "Pool prefill failed: {}", e),
            }
        }
    }

    /// Ping every pool; returns (node key, error message if any)
    pub async fn ping_all(&self) -> Vec<(String, Option<String>)> {
        let mut results = Vec::new();
        for (key, pool) in self.pools().await {
            let outcome = pool.ping().await.err().map(|e| e.to_string());
            if let Some(err) = &outcome {
                tracing::warn!(node = %key, "Pool ping failed: {}", err);
            }
            results.push((key, outcome));
        }
        results
    }

    pub async fn cluster_stats(&self) -> Vec<ClusterStats> {
        let snapshot = self.config.snapshot().await;
        let mut clusters: Vec<ClusterStats> = snapshot
            .clusters
            .iter()
            .map(|(name, c)| ClusterStats {
                name: name.clone(),
                master: c.master.as_ref().map(|m| m.addr()),
                slaves: c.slaves.iter().map(|s| s.addr()).collect(),
            })
            .collect();
        clusters.sort_by(|a, b| a.name.cmp(&b.name));
        clusters
    }

    pub async fn stats(&self) -> RouterStats {
        RouterStats {
            pools: self.pools.read().await.len(),
            writes_routed: self.writes_routed.load(Ordering::Relaxed),
            reads_routed: self.reads_routed.load(Ordering::Relaxed),
        }
    }

    /// Close every pool (shutdown)
    pub async fn close_all(&self) {
        let pools: Vec<_> = self.pools.write().await.drain().collect();
        for (key, pool) in pools {
            tracing::debug!(node = %key, "Closing pool");
            pool.close().await;
        }
    }
}
