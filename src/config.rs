//! Log engine configuration
//!
//! The engine consumes these settings but never loads them itself; the
//! broker's config layer deserializes a [`LogConfig`] and hands it over.

use crate::error::{Error, Result};
use crate::frame::MAX_COMMAND_LINE_SIZE;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Read windows are mapped at multiples of this granularity
pub const WINDOW_ALIGN: u64 = 64 * 1024;

/// How segment writes are made durable
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncPolicy {
    /// Never fsync, the OS page cache owns durability
    None,
    /// Fsync after every write
    Every,
    /// Fsync every file touched since the last flush once per interval,
    /// plus a forced flush when writers go idle
    Debounced {
        /// Length of the flush window in milliseconds
        interval_ms: u64,
    },
}

impl Default for SyncPolicy {
    fn default() -> Self {
        SyncPolicy::Debounced { interval_ms: 1000 }
    }
}

/// Configuration for segment writers and readers
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// Soft cap of a segment in bytes, checked after each write
    pub max_segment_size: u64,
    /// Maximum number of records returned by one reader call
    pub read_batch_size: usize,
    /// Keep-alive timeout of a blocked reader in milliseconds
    pub wait_timeout_ms: u64,
    /// Fsync policy of the writers
    pub sync_policy: SyncPolicy,
    /// Size of one mmap read window in bytes
    pub mmap_window: u64,
    /// Segments older than this many days are eligible for deletion
    pub retention_days: u32,
    /// Log every N-th wakeup, 0 disables sampled logging
    pub log_sample: u64,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            max_segment_size: 64 * 1024 * 1024, // 64MB
            read_batch_size: 1,
            wait_timeout_ms: 5000,
            sync_policy: SyncPolicy::default(),
            mmap_window: 512 * 1024,
            retention_days: 7,
            log_sample: 0,
        }
    }
}

impl LogConfig {
    /// Keep-alive timeout as a duration
    pub fn wait_timeout(&self) -> Duration {
        Duration::from_millis(self.wait_timeout_ms)
    }

    /// Retention window as a duration
    pub fn retention(&self) -> Duration {
        Duration::from_secs(u64::from(self.retention_days) * 24 * 60 * 60)
    }

    /// Check that the settings can drive a writer and its readers
    pub fn validate(&self) -> Result<()> {
        if self.max_segment_size == 0 {
            return Err(Error::Config("max_segment_size must be positive".into()));
        }
        if self.read_batch_size == 0 {
            return Err(Error::Config("read_batch_size must be positive".into()));
        }
        if self.wait_timeout_ms == 0 {
            return Err(Error::Config("wait_timeout_ms must be positive".into()));
        }
        if self.mmap_window == 0 || self.mmap_window % WINDOW_ALIGN != 0 {
            return Err(Error::Config(format!(
                "mmap_window must be a positive multiple of {}",
                WINDOW_ALIGN
            )));
        }
        // a command line may straddle at most one window boundary
        if self.mmap_window < (MAX_COMMAND_LINE_SIZE + 4) as u64 {
            return Err(Error::Config(format!(
                "mmap_window must hold a full command line ({} bytes)",
                MAX_COMMAND_LINE_SIZE + 4
            )));
        }
        if let SyncPolicy::Debounced { interval_ms: 0 } = self.sync_policy {
            return Err(Error::Config("debounce interval must be positive".into()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_is_valid() {
        let config = LogConfig::default();
        config.validate().unwrap();
        assert_eq!(config.wait_timeout(), Duration::from_secs(5));
        assert_eq!(config.retention(), Duration::from_secs(7 * 86400));
    }

    #[test]
    fn test_rejects_bad_window() {
        let config = LogConfig {
            mmap_window: 1000,
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(Error::Config(_))));

        let config = LogConfig {
            mmap_window: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_rejects_zero_values() {
        for config in [
            LogConfig { max_segment_size: 0, ..Default::default() },
            LogConfig { read_batch_size: 0, ..Default::default() },
            LogConfig { wait_timeout_ms: 0, ..Default::default() },
            LogConfig {
                sync_policy: SyncPolicy::Debounced { interval_ms: 0 },
                ..Default::default()
            },
        ] {
            assert!(config.validate().is_err(), "{:?}", config);
        }
    }

    #[test]
    fn test_deserialize_partial() {
        let config: LogConfig = serde_json::from_str(
            r#"{"max_segment_size": 4096, "sync_policy": {"debounced": {"interval_ms": 250}}}"#,
        )
        .unwrap();
        assert_eq!(config.max_segment_size, 4096);
        assert_eq!(config.sync_policy, SyncPolicy::Debounced { interval_ms: 250 });
        assert_eq!(config.read_batch_size, 1);

        let config: LogConfig = serde_json::from_str(r#"{"sync_policy": "every"}"#).unwrap();
        assert_eq!(config.sync_policy, SyncPolicy::Every);
    }
}
