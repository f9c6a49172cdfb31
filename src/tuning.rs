//! Host sizing
//!
//! Detects hardware capabilities used to size the connection pools.

use std::sync::OnceLock;
use sysinfo::System;

static CPU_CORES: OnceLock<usize> = OnceLock::new();

/// Detect the number of available CPU cores (cached after first call)
pub fn detect_cpu_cores() -> usize {
    *CPU_CORES.get_or_init(|| {
        let mut sys = System::new();
        sys.refresh_cpu();
        let cores = sys.cpus().len().max(1);
        tracing::debug!(cores, "Detected CPU cores");
        cores
    })
}

/// Number of idle-queue shards per connection pool.
///
/// One shard per core spreads borrowers across independent locks.
pub fn pool_shard_count() -> usize {
    detect_cpu_cores()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_detection_returns_positive_values() {
        assert!(detect_cpu_cores() >= 1);
        assert_eq!(pool_shard_count(), detect_cpu_cores());
    }
}
