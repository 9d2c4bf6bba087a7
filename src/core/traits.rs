//! Driver traits and the ingest seam between south and north.
//!
//! ```text
//! SouthDriver ──values/files──▶ Ingestor (cache engine) ──▶ NorthDriver
//! ```
//!
//! Drivers are plain async state machines: the runtime owns connection
//! supervision, scheduling, and retries; a driver only has to know how
//! to talk to its device or destination.

use std::path::Path;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::core::data::{Value, ValueBatch};
use crate::core::error::{GatewayError, Result};
use crate::core::scan::Item;

/// Connection state of a connector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    /// Not connected; no acquisition or delivery happens.
    #[default]
    Disconnected,

    /// Connection attempt (or retry wait) in progress.
    Connecting,

    /// Connected and operating.
    Connected,
}

impl ConnectionState {
    /// Whether data may flow in this state.
    pub const fn is_connected(&self) -> bool {
        matches!(self, Self::Connected)
    }
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
        };
        write!(f, "{}", s)
    }
}

/// Result of one history query over one time window.
#[derive(Debug, Clone, Default)]
pub struct HistoryPage {
    /// Values retrieved for the window, in no particular order.
    pub values: ValueBatch,

    /// Largest source timestamp the driver knows it has fully covered,
    /// when the source reports one out of band. Most drivers leave this
    /// unset and the caller falls back to the max value timestamp.
    pub max_instant_retrieved: Option<DateTime<Utc>>,
}

impl HistoryPage {
    /// Page containing only values.
    pub fn from_values(values: ValueBatch) -> Self {
        Self {
            values,
            max_instant_retrieved: None,
        }
    }

    /// The instant the watermark may advance to, if any.
    ///
    /// An empty page yields `None`: the window is not considered covered
    /// and will be re-queried.
    pub fn observed_max(&self) -> Option<DateTime<Utc>> {
        self.max_instant_retrieved.or_else(|| self.values.max_timestamp())
    }
}

/// A device-side data source.
///
/// Implementations keep whatever session state they need across calls;
/// the runtime serializes access so `&mut self` methods never race.
/// `test_connection` deliberately takes `&self`: it must not disturb the
/// operational session.
#[async_trait]
pub trait SouthDriver: Send + Sync {
    /// Static driver name used in configuration and logs.
    fn driver_name(&self) -> &'static str;

    /// Establish the session with the device.
    ///
    /// Called repeatedly by the supervisor until it succeeds; one failed
    /// attempt should return promptly rather than retry internally.
    async fn connect(&mut self) -> Result<()>;

    /// Tear down the session. Must succeed on an already-closed session.
    async fn disconnect(&mut self) -> Result<()>;

    /// Probe reachability without touching the operational session.
    async fn test_connection(&self) -> Result<()>;

    /// Read the current value of each item.
    async fn read_points(&mut self, items: &[Item]) -> Result<ValueBatch>;

    /// Whether [`SouthDriver::history_query`] is implemented.
    fn supports_history(&self) -> bool {
        false
    }

    /// Retrieve values with source timestamps in `[start, end)`.
    async fn history_query(
        &mut self,
        items: &[Item],
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<HistoryPage> {
        let _ = (items, start, end);
        Err(GatewayError::Unsupported(format!(
            "driver '{}' does not support history queries",
            self.driver_name()
        )))
    }
}

impl std::fmt::Debug for dyn SouthDriver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SouthDriver")
            .field("driver_name", &self.driver_name())
            .finish()
    }
}

/// A destination for values and files.
///
/// Delivery methods return `Ok(())` only once the payload is accepted by
/// the destination; the cache treats any error as "entry stays queued".
#[async_trait]
pub trait NorthDriver: Send + Sync {
    /// Static driver name used in configuration and logs.
    fn driver_name(&self) -> &'static str;

    /// Establish the session with the destination.
    async fn connect(&mut self) -> Result<()>;

    /// Tear down the session. Must succeed on an already-closed session.
    async fn disconnect(&mut self) -> Result<()>;

    /// Probe reachability without touching the operational session.
    async fn test_connection(&self) -> Result<()>;

    /// Deliver a batch of values.
    async fn handle_values(&mut self, values: &[Value]) -> Result<()>;

    /// Deliver one staged file.
    async fn handle_file(&mut self, path: &Path) -> Result<()>;
}

impl std::fmt::Debug for dyn NorthDriver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NorthDriver")
            .field("driver_name", &self.driver_name())
            .finish()
    }
}

/// Where south connectors hand data off.
///
/// The cache engine implements this; tests substitute their own. Both
/// methods are durable: once they return `Ok`, the payload survives a
/// process restart.
#[async_trait]
pub trait Ingestor: Send + Sync {
    /// Enqueue a batch of values for delivery.
    async fn ingest_values(&self, values: ValueBatch) -> Result<()>;

    /// Stage and enqueue a file for delivery.
    async fn ingest_file(&self, path: &Path) -> Result<()>;
}
