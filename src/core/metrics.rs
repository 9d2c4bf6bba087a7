//! Per-connector counters and metrics change events.
//!
//! Every connector owns a [`ConnectorMetrics`]; the gateway aggregates
//! them in a [`MetricsHub`]. Counters are mutated under one mutex so a
//! snapshot is always internally consistent, and every mutation emits a
//! [`MetricsEvent`] on a broadcast channel for live observers.

use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;
use tokio::sync::broadcast;

use crate::core::traits::ConnectionState;

/// Broadcast buffer for metrics events. Slow observers lag and skip.
const EVENT_BUFFER_SIZE: usize = 64;

/// Point-in-time view of one connector's counters.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MetricsSnapshot {
    /// Current connection state.
    pub connection_state: ConnectionState,

    /// Values read from the source since `since`.
    pub values_retrieved: u64,

    /// Files picked up from the source since `since`.
    pub files_retrieved: u64,

    /// Values delivered to the destination since `since`.
    pub values_sent: u64,

    /// Files delivered to the destination since `since`.
    pub files_sent: u64,

    /// Failed delivery attempts since `since`.
    pub send_errors: u64,

    /// Failed read attempts since `since`.
    pub read_errors: u64,

    /// Entries dropped by size-bound eviction since `since`.
    pub evictions: u64,

    /// Bytes currently held in the durable cache.
    pub cache_size_bytes: u64,

    /// Entries currently queued in the durable cache.
    pub queued_entries: u64,

    /// Most recent error message, if any.
    pub last_error: Option<String>,

    /// Instant the counters were last zeroed.
    pub since: DateTime<Utc>,
}

impl MetricsSnapshot {
    fn empty(since: DateTime<Utc>) -> Self {
        Self {
            connection_state: ConnectionState::Disconnected,
            values_retrieved: 0,
            files_retrieved: 0,
            values_sent: 0,
            files_sent: 0,
            send_errors: 0,
            read_errors: 0,
            evictions: 0,
            cache_size_bytes: 0,
            queued_entries: 0,
            last_error: None,
            since,
        }
    }
}

/// One metrics change, tagged with the connector that produced it.
#[derive(Debug, Clone, Serialize)]
pub struct MetricsEvent {
    /// Connector the snapshot belongs to.
    pub connector_id: String,

    /// State after the change.
    pub snapshot: MetricsSnapshot,
}

/// Counters for one connector.
pub struct ConnectorMetrics {
    connector_id: String,
    inner: Mutex<MetricsSnapshot>,
    events: broadcast::Sender<MetricsEvent>,
}

impl ConnectorMetrics {
    /// Create zeroed counters for a connector.
    pub fn new(connector_id: impl Into<String>) -> Self {
        let (events, _) = broadcast::channel(EVENT_BUFFER_SIZE);
        Self {
            connector_id: connector_id.into(),
            inner: Mutex::new(MetricsSnapshot::empty(Utc::now())),
            events,
        }
    }

    /// Connector these counters belong to.
    pub fn connector_id(&self) -> &str {
        &self.connector_id
    }

    /// Consistent copy of the current counters.
    pub fn snapshot(&self) -> MetricsSnapshot {
        self.inner
            .lock()
            .map(|m| m.clone())
            .unwrap_or_else(|_| MetricsSnapshot::empty(Utc::now()))
    }

    /// Snapshot plus a live event stream, with no gap between them.
    pub fn subscribe(&self) -> (MetricsSnapshot, broadcast::Receiver<MetricsEvent>) {
        if let Ok(m) = self.inner.lock() {
            // Subscribing under the lock means the receiver sees exactly
            // the events after this snapshot.
            (m.clone(), self.events.subscribe())
        } else {
            (MetricsSnapshot::empty(Utc::now()), self.events.subscribe())
        }
    }

    /// Zero the counters, keeping connection state and cache usage.
    ///
    /// Returns the snapshot taken immediately before zeroing, so callers
    /// can reset periodically without losing counts to the gap.
    pub fn reset(&self) -> MetricsSnapshot {
        if let Ok(mut m) = self.inner.lock() {
            let before = m.clone();
            let state = m.connection_state;
            let cache_size_bytes = m.cache_size_bytes;
            let queued_entries = m.queued_entries;
            *m = MetricsSnapshot::empty(Utc::now());
            m.connection_state = state;
            m.cache_size_bytes = cache_size_bytes;
            m.queued_entries = queued_entries;
            self.emit(&m);
            before
        } else {
            MetricsSnapshot::empty(Utc::now())
        }
    }

    /// Record values read from the source.
    pub fn record_values_retrieved(&self, count: u64) {
        if let Ok(mut m) = self.inner.lock() {
            m.values_retrieved += count;
            self.emit(&m);
        }
    }

    /// Record a file picked up from the source.
    pub fn record_file_retrieved(&self) {
        if let Ok(mut m) = self.inner.lock() {
            m.files_retrieved += 1;
            self.emit(&m);
        }
    }

    /// Record values delivered to the destination.
    pub fn record_values_sent(&self, count: u64) {
        if let Ok(mut m) = self.inner.lock() {
            m.values_sent += count;
            self.emit(&m);
        }
    }

    /// Record a file delivered to the destination.
    pub fn record_file_sent(&self) {
        if let Ok(mut m) = self.inner.lock() {
            m.files_sent += 1;
            self.emit(&m);
        }
    }

    /// Record a failed delivery attempt.
    pub fn record_send_error(&self, message: impl Into<String>) {
        if let Ok(mut m) = self.inner.lock() {
            m.send_errors += 1;
            m.last_error = Some(message.into());
            self.emit(&m);
        }
    }

    /// Record a failed read attempt.
    pub fn record_read_error(&self, message: impl Into<String>) {
        if let Ok(mut m) = self.inner.lock() {
            m.read_errors += 1;
            m.last_error = Some(message.into());
            self.emit(&m);
        }
    }

    /// Record one entry dropped by eviction.
    pub fn record_eviction(&self) {
        if let Ok(mut m) = self.inner.lock() {
            m.evictions += 1;
            self.emit(&m);
        }
    }

    /// Track a connection state change.
    pub fn set_connection_state(&self, state: ConnectionState) {
        if let Ok(mut m) = self.inner.lock() {
            if m.connection_state != state {
                m.connection_state = state;
                self.emit(&m);
            }
        }
    }

    /// Track current cache occupancy.
    pub fn set_cache_usage(&self, size_bytes: u64, entries: u64) {
        if let Ok(mut m) = self.inner.lock() {
            m.cache_size_bytes = size_bytes;
            m.queued_entries = entries;
            self.emit(&m);
        }
    }

    fn emit(&self, snapshot: &MetricsSnapshot) {
        // Send errors just mean nobody is listening.
        let _ = self.events.send(MetricsEvent {
            connector_id: self.connector_id.clone(),
            snapshot: snapshot.clone(),
        });
    }
}

impl std::fmt::Debug for ConnectorMetrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectorMetrics")
            .field("connector_id", &self.connector_id)
            .field("snapshot", &self.snapshot())
            .finish()
    }
}

/// Registry of every connector's metrics.
#[derive(Debug, Default)]
pub struct MetricsHub {
    connectors: DashMap<String, Arc<ConnectorMetrics>>,
}

impl MetricsHub {
    /// Create an empty hub.
    pub fn new() -> Self {
        Self::default()
    }

    /// Get or create the metrics for a connector.
    pub fn register(&self, connector_id: &str) -> Arc<ConnectorMetrics> {
        self.connectors
            .entry(connector_id.to_string())
            .or_insert_with(|| Arc::new(ConnectorMetrics::new(connector_id)))
            .clone()
    }

    /// Look up a connector's metrics.
    pub fn get(&self, connector_id: &str) -> Option<Arc<ConnectorMetrics>> {
        self.connectors.get(connector_id).map(|m| m.clone())
    }

    /// Snapshot every connector, sorted by id.
    pub fn snapshot_all(&self) -> Vec<MetricsEvent> {
        let mut all: Vec<MetricsEvent> = self
            .connectors
            .iter()
            .map(|entry| MetricsEvent {
                connector_id: entry.key().clone(),
                snapshot: entry.value().snapshot(),
            })
            .collect();
        all.sort_by(|a, b| a.connector_id.cmp(&b.connector_id));
        all
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // ========== counter tests ==========

    #[test]
    fn test_counters_accumulate() {
        let metrics = ConnectorMetrics::new("north1");
        metrics.record_values_sent(10);
        metrics.record_values_sent(5);
        metrics.record_file_sent();
        metrics.record_send_error("broker unreachable");

        let snap = metrics.snapshot();
        assert_eq!(snap.values_sent, 15);
        assert_eq!(snap.files_sent, 1);
        assert_eq!(snap.send_errors, 1);
        assert_eq!(snap.last_error.as_deref(), Some("broker unreachable"));
    }

    #[test]
    fn test_reset_keeps_state_and_usage() {
        let metrics = ConnectorMetrics::new("north1");
        metrics.set_connection_state(ConnectionState::Connected);
        metrics.set_cache_usage(4096, 3);
        metrics.record_values_sent(7);

        let before = metrics.reset();
        assert_eq!(before.values_sent, 7);

        let snap = metrics.snapshot();
        assert_eq!(snap.values_sent, 0);
        assert_eq!(snap.connection_state, ConnectionState::Connected);
        assert_eq!(snap.cache_size_bytes, 4096);
        assert_eq!(snap.queued_entries, 3);
        assert!(snap.since >= before.since);
    }

    #[test]
    fn test_subscribe_snapshot_then_events() {
        let metrics = ConnectorMetrics::new("south1");
        metrics.record_values_retrieved(2);

        let (snap, mut rx) = metrics.subscribe();
        assert_eq!(snap.values_retrieved, 2);
        assert!(rx.try_recv().is_err());

        metrics.record_values_retrieved(3);
        let event = rx.try_recv().unwrap();
        assert_eq!(event.connector_id, "south1");
        assert_eq!(event.snapshot.values_retrieved, 5);
    }

    #[test]
    fn test_state_change_emits_once() {
        let metrics = ConnectorMetrics::new("south1");
        let (_, mut rx) = metrics.subscribe();

        metrics.set_connection_state(ConnectionState::Connected);
        metrics.set_connection_state(ConnectionState::Connected);

        assert!(rx.try_recv().is_ok());
        assert!(rx.try_recv().is_err());
    }

    // ========== hub tests ==========

    #[test]
    fn test_hub_register_is_idempotent() {
        let hub = MetricsHub::new();
        let a = hub.register("c1");
        a.record_values_sent(1);
        let b = hub.register("c1");
        assert_eq!(b.snapshot().values_sent, 1);
        assert!(hub.get("missing").is_none());
    }

    #[test]
    fn test_hub_snapshot_all_sorted() {
        let hub = MetricsHub::new();
        hub.register("zeta");
        hub.register("alpha");
        let all = hub.snapshot_all();
        assert_eq!(all.len(), 2);
        assert_eq!(all[0].connector_id, "alpha");
        assert_eq!(all[1].connector_id, "zeta");
    }
}
