//! Configuration Snapshots and Hot Reload
//!
//! Holds the active [`ProxyConfig`] as an `Arc` snapshot. Readers clone the
//! `Arc` and never observe a half-applied document; the reload task parses
//! and validates a replacement off to the side and swaps it in only when it
//! is valid. A failed reload keeps the previous snapshot.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::SystemTime;
use tokio::sync::{watch, Mutex, RwLock};
use tokio::task::JoinHandle;

use crate::config::ProxyConfig;
use crate::error::{Error, Result};

/// Owner of the active configuration snapshot
pub struct ConfigStore {
    /// Backing file, if any
    path: Option<PathBuf>,
    /// Active snapshot
    current: RwLock<Arc<ProxyConfig>>,
    /// Modification time of the file the active snapshot came from
    last_modified: Mutex<Option<SystemTime>>,
    /// Number of successful swaps since startup
    generation: AtomicU64,
    /// Notifies subscribers of each new generation
    notify: watch::Sender<u64>,
}

impl ConfigStore {
    /// Create a store around an already-validated document
    pub fn new(config: ProxyConfig) -> Self {
        let (notify, _) = watch::channel(0);
        Self {
            path: None,
            current: RwLock::new(Arc::new(config)),
            last_modified: Mutex::new(None),
            generation: AtomicU64::new(0),
            notify,
        }
    }

    /// Load the initial snapshot from a file. Any error here is fatal to startup.
    pub fn load(path: &Path) -> Result<Self> {
        let modified = std::fs::metadata(path)?.modified()?;
        let config = ProxyConfig::from_file(path)?;
        let (notify, _) = watch::channel(0);
        Ok(Self {
            path: Some(path.to_path_buf()),
            current: RwLock::new(Arc::new(config)),
            last_modified: Mutex::new(Some(modified)),
            generation: AtomicU64::new(0),
            notify,
        })
    }

    /// Path of the backing file
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Current snapshot
    pub async fn snapshot(&self) -> Arc<ProxyConfig> {
        Arc::clone(&*self.current.read().await)
    }

    /// Number of successful reloads
    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::Relaxed)
    }

    /// Receive the generation number after every successful swap
    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.notify.subscribe()
    }

    /// Validate and publish a replacement document
    pub async fn publish(&self, config: ProxyConfig) -> Result<()> {
        config.validate()?;
        *self.current.write().await = Arc::new(config);
        let generation = self.generation.fetch_add(1, Ordering::Relaxed) + 1;
        self.notify.send_replace(generation);
        Ok(())
    }

    /// Re-read the backing file if it changed since the last successful load.
    ///
    /// Returns `Ok(true)` when a new snapshot was published. On error the
    /// previous snapshot stays active and the file is retried next time.
    pub async fn check_for_update(&self) -> Result<bool> {
        let path = match &self.path {
            Some(p) => p,
            None => return Ok(false),
        };

        let modified = tokio::fs::metadata(path).await?.modified()?;
        let mut last_modified = self.last_modified.lock().await;
        if let Some(last) = *last_modified {
            if modified <= last {
                return Ok(false);
            }
        }

        tracing::info!(path = %path.display(), "Configuration file changed, reloading");
        let content = tokio::fs::read_to_string(path).await?;
        let config = ProxyConfig::from_str(&content)?;
        self.publish(config).await?;
        *last_modified = Some(modified);
        Ok(true)
    }

    /// Reload the backing file unconditionally
    pub async fn force_reload(&self) -> Result<()> {
        let path = self
            .path
            .as_ref()
            .ok_or_else(|| Error::Config("no configuration file to reload".into()))?;
        let modified = tokio::fs::metadata(path).await?.modified()?;
        let content = tokio::fs::read_to_string(path).await?;
        self.publish(ProxyConfig::from_str(&content)?).await?;
        *self.last_modified.lock().await = Some(modified);
        Ok(())
    }

    /// Spawn the polling reload task if the active snapshot enables autoload
    pub async fn spawn_watcher(self: Arc<Self>) -> Option<JoinHandle<()>> {
        let global = self.snapshot().await.global.clone();
        if !global.conf_autoload || self.path.is_none() {
            tracing::info!("Configuration autoload disabled");
            return None;
        }

        let interval = global.reload_interval();
        tracing::info!(interval_secs = interval.as_secs(), "Watching configuration file");

        Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            // First tick completes immediately
            ticker.tick().await;
            loop {
                ticker.tick().await;
                tracing::debug!("Checking configuration for changes");
                match self.check_for_update().await {
                    Ok(true) => tracing::info!(
                        generation = self.generation(),
                        "New configuration loaded"
                    ),
                    Ok(false) => {}
                    Err(e) => tracing::warn!("Configuration reload rejected, keeping previous: {}", e),
                }
            }
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::tests::SAMPLE;
    use std::time::Duration;
    use tempfile::tempdir;

    fn bump_mtime(path: &Path, secs: u64) {
        let file = std::fs::File::options().write(true).open(path).unwrap();
        file.set_modified(SystemTime::now() + Duration::from_secs(secs))
            .unwrap();
    }

    #[tokio::test]
    async fn test_unchanged_file_is_not_reloaded() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("sqlmux.toml");
        std::fs::write(&path, SAMPLE).unwrap();

        let store = ConfigStore::load(&path).unwrap();
        assert!(!store.check_for_update().await.unwrap());
        assert_eq!(store.generation(), 0);
    }

    #[tokio::test]
    async fn test_invalid_reload_keeps_previous_snapshot() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("sqlmux.toml");
        std::fs::write(&path, SAMPLE).unwrap();
        let store = ConfigStore::load(&path).unwrap();

        // Structurally valid TOML, but the user points at a missing cluster
        let broken = SAMPLE.replace("cluster_name = \"orders\"", "cluster_name = \"gone\"");
        std::fs::write(&path, broken).unwrap();
        bump_mtime(&path, 10);

        assert!(store.check_for_update().await.is_err());
        let snapshot = store.snapshot().await;
        assert_eq!(snapshot.user("app").unwrap().cluster_name, "orders");
        assert_eq!(store.generation(), 0);
    }

    #[tokio::test]
    async fn test_valid_reload_swaps_snapshot() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("sqlmux.toml");
        std::fs::write(&path, SAMPLE).unwrap();
        let store = ConfigStore::load(&path).unwrap();
        let mut updates = store.subscribe();
        let before = store.snapshot().await;

        std::fs::write(&path, SAMPLE.replace("10.0.0.1", "10.0.0.9")).unwrap();
        bump_mtime(&path, 10);

        assert!(store.check_for_update().await.unwrap());
        assert_eq!(store.snapshot().await.master_of("orders").unwrap().host, "10.0.0.9");
        // Holders of the old snapshot keep seeing it
        assert_eq!(before.master_of("orders").unwrap().host, "10.0.0.1");
        assert!(updates.has_changed().unwrap());
        assert_eq!(*updates.borrow_and_update(), 1);
    }

    #[tokio::test]
    async fn test_publish_validates() {
        let store = ConfigStore::new(ProxyConfig::from_str(SAMPLE).unwrap());
        let mut empty = (*store.snapshot().await).clone();
        empty.users.clear();
        assert!(store.publish(empty).await.is_err());
        assert_eq!(store.snapshot().await.users.len(), 1);
    }
}
