//! Scan modes, items, and history query settings.
//!
//! A scan mode is a named schedule (fixed interval or cron expression).
//! South connectors bind items to scan modes; north caches use a scan mode
//! as their flush cadence. Schedules are validated at construction, never
//! at tick time.

use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::core::error::{GatewayError, Result};

/// Minimum allowed interval between ticks.
///
/// Sub-second polling is a configuration mistake for this kind of
/// gateway; intervals below this are clamped with a warning.
pub const MIN_INTERVAL: Duration = Duration::from_secs(1);

/// When a scan mode fires.
#[derive(Debug, Clone)]
pub enum Schedule {
    /// Fixed interval between ticks.
    Interval(Duration),

    /// Cron expression (seconds-resolution, e.g. `"0 */10 * * * *"`).
    Cron(Box<cron::Schedule>),
}

impl Schedule {
    /// Create an interval schedule, clamping to [`MIN_INTERVAL`].
    pub fn interval(interval: Duration) -> Self {
        if interval < MIN_INTERVAL {
            tracing::warn!(
                "Scan interval {:?} below minimum, clamping to {:?}",
                interval,
                MIN_INTERVAL
            );
            Self::Interval(MIN_INTERVAL)
        } else {
            Self::Interval(interval)
        }
    }

    /// Create a cron schedule, validating the expression.
    pub fn cron(expression: &str) -> Result<Self> {
        let schedule = cron::Schedule::from_str(expression).map_err(|e| {
            GatewayError::Config(format!("invalid cron expression '{}': {}", expression, e))
        })?;
        Ok(Self::Cron(Box::new(schedule)))
    }

    /// Next firing instant strictly after `after`.
    ///
    /// Returns `None` only for cron expressions with no future
    /// occurrence.
    pub fn next_after(&self, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
        match self {
            Self::Interval(interval) => {
                let delta = chrono::Duration::from_std(*interval).ok()?;
                Some(after + delta)
            }
            Self::Cron(schedule) => schedule.after(&after).next(),
        }
    }
}

impl std::fmt::Display for Schedule {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Interval(d) => write!(f, "every {:?}", d),
            Self::Cron(s) => write!(f, "cron {}", s),
        }
    }
}

/// A named schedule driving south acquisition and north flushes.
#[derive(Debug, Clone)]
pub struct ScanMode {
    /// Unique scan mode identifier, referenced by items and caching
    /// policies.
    pub id: String,

    /// When this scan mode ticks.
    pub schedule: Schedule,
}

impl ScanMode {
    /// Create a scan mode.
    pub fn new(id: impl Into<String>, schedule: Schedule) -> Self {
        Self {
            id: id.into(),
            schedule,
        }
    }
}

/// One addressable data point or query of a south connector.
///
/// The `settings` blob is opaque to the core; only the driver that owns
/// the item interprets it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Item {
    /// Item identifier, unique within its connector.
    pub id: String,

    /// Human-readable name; defaults to the id.
    #[serde(default)]
    pub name: Option<String>,

    /// The single scan mode this item is bound to.
    pub scan_mode_id: String,

    /// Driver-specific settings.
    #[serde(default)]
    pub settings: serde_json::Value,

    /// Disabled items are ignored by the scheduler.
    #[serde(default = "default_item_enabled")]
    pub enabled: bool,
}

fn default_item_enabled() -> bool {
    true
}

impl Item {
    /// Create an enabled item with empty settings.
    pub fn new(id: impl Into<String>, scan_mode_id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: None,
            scan_mode_id: scan_mode_id.into(),
            settings: serde_json::Value::Null,
            enabled: true,
        }
    }

    /// Attach driver-specific settings.
    #[must_use]
    pub fn with_settings(mut self, settings: serde_json::Value) -> Self {
        self.settings = settings;
        self
    }

    /// Set a display name.
    #[must_use]
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }
}

// ============================================================================
// History settings
// ============================================================================

/// Settings governing history-mode acquisition for one south connector.
#[derive(Debug, Clone)]
pub struct HistorySettings {
    /// How far behind the persisted watermark each window starts, to
    /// re-read the boundary region (milliseconds).
    pub overlap_ms: u64,

    /// Maximum width of one sub-interval query (seconds).
    pub max_read_interval_s: u64,

    /// Fixed lag behind "now" to tolerate source clock skew and
    /// late-arriving data (milliseconds).
    pub read_delay_ms: u64,

    /// Deadline for one history query (seconds).
    pub read_timeout_s: u64,

    /// Track one watermark per item instead of one per scan mode.
    pub max_instant_per_item: bool,

    /// Explicit backfill start for the very first query. When unset, the
    /// first tick initializes the watermark to `now - read_delay` and
    /// acquisition proceeds forward only.
    pub start_instant: Option<DateTime<Utc>>,
}

impl HistorySettings {
    /// Overlap as a chrono duration.
    pub fn overlap(&self) -> chrono::Duration {
        chrono::Duration::milliseconds(self.overlap_ms as i64)
    }

    /// Sub-interval width as a chrono duration.
    pub fn max_read_interval(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.max_read_interval_s as i64)
    }

    /// Read delay as a chrono duration.
    pub fn read_delay(&self) -> chrono::Duration {
        chrono::Duration::milliseconds(self.read_delay_ms as i64)
    }

    /// Query deadline as a std duration.
    pub fn read_timeout(&self) -> Duration {
        Duration::from_secs(self.read_timeout_s)
    }
}

/// History settings as they appear in configuration.
///
/// # Example TOML
/// ```toml
/// [south.history]
/// max_read_interval_s = 3600
/// read_delay_ms = 200
/// max_instant_per_item = true
/// ```
#[derive(Debug, Clone, Deserialize)]
pub struct HistorySettingsConfig {
    /// Window overlap in milliseconds.
    #[serde(default)]
    pub overlap_ms: u64,

    /// Maximum sub-interval width in seconds.
    #[serde(default = "default_max_read_interval_s")]
    pub max_read_interval_s: u64,

    /// Lag behind "now" in milliseconds.
    #[serde(default = "default_read_delay_ms")]
    pub read_delay_ms: u64,

    /// Per-query deadline in seconds.
    #[serde(default = "default_read_timeout_s")]
    pub read_timeout_s: u64,

    /// Per-item watermarks.
    #[serde(default)]
    pub max_instant_per_item: bool,

    /// Explicit backfill start (RFC 3339).
    #[serde(default)]
    pub start_instant: Option<DateTime<Utc>>,
}

fn default_max_read_interval_s() -> u64 {
    3600
}

fn default_read_delay_ms() -> u64 {
    200
}

fn default_read_timeout_s() -> u64 {
    30
}

impl Default for HistorySettingsConfig {
    fn default() -> Self {
        Self {
            overlap_ms: 0,
            max_read_interval_s: default_max_read_interval_s(),
            read_delay_ms: default_read_delay_ms(),
            read_timeout_s: default_read_timeout_s(),
            max_instant_per_item: false,
            start_instant: None,
        }
    }
}

impl HistorySettingsConfig {
    /// Validate and convert to runtime settings.
    pub fn to_settings(&self) -> Result<HistorySettings> {
        if self.max_read_interval_s == 0 {
            return Err(GatewayError::Config(
                "max_read_interval_s must be at least 1".to_string(),
            ));
        }
        if self.read_timeout_s == 0 {
            return Err(GatewayError::Config(
                "read_timeout_s must be at least 1".to_string(),
            ));
        }
        Ok(HistorySettings {
            overlap_ms: self.overlap_ms,
            max_read_interval_s: self.max_read_interval_s,
            read_delay_ms: self.read_delay_ms,
            read_timeout_s: self.read_timeout_s,
            max_instant_per_item: self.max_instant_per_item,
            start_instant: self.start_instant,
        })
    }
}

/// Composite key addressing one persisted watermark.
///
/// A proper struct, not a runtime-built string: scan mode ids and item
/// ids may contain any separator a naive join would pick.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct HistoryKey {
    /// Owning scan mode.
    pub scan_mode_id: String,

    /// Owning item, when watermarks are tracked per item.
    pub item_id: Option<String>,
}

impl HistoryKey {
    /// Key for a shared per-scan-mode watermark.
    pub fn for_scan_mode(scan_mode_id: impl Into<String>) -> Self {
        Self {
            scan_mode_id: scan_mode_id.into(),
            item_id: None,
        }
    }

    /// Key for a per-item watermark.
    pub fn for_item(scan_mode_id: impl Into<String>, item_id: impl Into<String>) -> Self {
        Self {
            scan_mode_id: scan_mode_id.into(),
            item_id: Some(item_id.into()),
        }
    }
}

impl std::fmt::Display for HistoryKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.item_id {
            Some(item) => write!(f, "{}/{}", self.scan_mode_id, item),
            None => write!(f, "{}", self.scan_mode_id),
        }
    }
}
