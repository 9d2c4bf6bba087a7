//! Caching and archive policies for north connectors.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::core::error::{GatewayError, Result};

/// Batching, retry, and backpressure rules for one north cache.
#[derive(Debug, Clone)]
pub struct CachingPolicy {
    /// Scan mode whose ticks trigger flushes.
    pub scan_mode_id: String,

    /// Wait after a failed delivery before the next attempt.
    pub retry_interval: Duration,

    /// Carried on entries for operator visibility; delivery retries
    /// until success or eviction regardless of this value.
    pub retry_count: u32,

    /// Maximum values handed to the driver in one call.
    pub group_count: usize,

    /// Maximum values drained from the queue in one flush cycle. Also
    /// the queue depth that triggers an immediate flush.
    pub max_send_count: usize,

    /// Flush as soon as a file is enqueued instead of waiting for the
    /// next tick.
    pub send_file_immediately: bool,

    /// Cache size bound in bytes; 0 means unbounded.
    pub max_size: u64,
}

/// Caching policy as it appears in configuration.
///
/// # Example TOML
/// ```toml
/// [north.caching]
/// scan_mode_id = "every10s"
/// group_count = 500
/// max_size = 104857600
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CachingPolicyParamsConfig {
    /// Scan mode driving the flush cadence.
    pub scan_mode_id: String,

    /// Delay before retrying a failed delivery (milliseconds).
    #[serde(default = "default_retry_interval_ms")]
    pub retry_interval_ms: u64,

    /// Unused bound kept for configuration compatibility.
    #[serde(default)]
    pub retry_count: u32,

    /// Values per driver call.
    #[serde(default = "default_group_count")]
    pub group_count: usize,

    /// Values drained per flush cycle.
    #[serde(default = "default_max_send_count")]
    pub max_send_count: usize,

    /// Deliver files as soon as they arrive.
    #[serde(default)]
    pub send_file_immediately: bool,

    /// Cache size bound in bytes; 0 means unbounded.
    #[serde(default)]
    pub max_size: u64,
}

fn default_retry_interval_ms() -> u64 {
    5000
}

fn default_group_count() -> usize {
    1000
}

fn default_max_send_count() -> usize {
    10000
}

impl CachingPolicyParamsConfig {
    /// Config with defaults for everything except the flush scan mode.
    pub fn for_scan_mode(scan_mode_id: impl Into<String>) -> Self {
        Self {
            scan_mode_id: scan_mode_id.into(),
            retry_interval_ms: default_retry_interval_ms(),
            retry_count: 0,
            group_count: default_group_count(),
            max_send_count: default_max_send_count(),
            send_file_immediately: false,
            max_size: 0,
        }
    }

    /// Validate and convert to a runtime policy.
    pub fn to_policy(&self) -> Result<CachingPolicy> {
        if self.group_count == 0 {
            return Err(GatewayError::Config(
                "group_count must be at least 1".to_string(),
            ));
        }
        if self.max_send_count == 0 {
            return Err(GatewayError::Config(
                "max_send_count must be at least 1".to_string(),
            ));
        }
        if self.retry_count > 0 {
            tracing::warn!(
                "retry_count = {} is ignored; delivery retries until success or eviction",
                self.retry_count
            );
        }
        Ok(CachingPolicy {
            scan_mode_id: self.scan_mode_id.clone(),
            retry_interval: Duration::from_millis(self.retry_interval_ms),
            retry_count: self.retry_count,
            group_count: self.group_count,
            max_send_count: self.max_send_count,
            send_file_immediately: self.send_file_immediately,
            max_size: self.max_size,
        })
    }
}

/// What happens to files after successful delivery.
#[derive(Debug, Clone)]
pub struct ArchivePolicy {
    /// Keep sent files in an archive folder instead of deleting them.
    pub enabled: bool,

    /// How long archived files are kept; zero keeps them forever.
    pub retention: Duration,
}

impl ArchivePolicy {
    /// Archiving off; sent files are deleted.
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            retention: Duration::ZERO,
        }
    }
}

/// Archive policy as it appears in configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArchiveParamsConfig {
    /// Keep sent files.
    #[serde(default)]
    pub enabled: bool,

    /// Retention in hours; 0 keeps archived files forever.
    #[serde(default = "default_retention_duration_h")]
    pub retention_duration_h: u64,
}

fn default_retention_duration_h() -> u64 {
    72
}

impl Default for ArchiveParamsConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            retention_duration_h: default_retention_duration_h(),
        }
    }
}

impl ArchiveParamsConfig {
    /// Convert to a runtime policy.
    pub fn to_policy(&self) -> ArchivePolicy {
        ArchivePolicy {
            enabled: self.enabled,
            retention: Duration::from_secs(self.retention_duration_h * 3600),
        }
    }
}
