//! South connector runtime: one driver, its items, and the tasks that
//! poll them on scan-mode ticks.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;

use crate::core::error::{GatewayError, Result};
use crate::core::metrics::{ConnectorMetrics, MetricsSnapshot};
use crate::core::scan::{HistorySettings, Item};
use crate::core::traits::{ConnectionState, Ingestor, SouthDriver};
use crate::lifecycle::ConnectionSupervisor;
use crate::scan::history::HistoryRunner;
use crate::scan::scheduler::{ScanScheduler, Tick};
use crate::store::QueueStore;

/// Drives one south driver from scan-mode ticks.
///
/// Every tick of a mode triggers either a live poll of that mode's items
/// or, when history settings are present, a windowed history pass. Ticks
/// for one mode are handled strictly one at a time; a pass that outlasts
/// its interval coalesces the missed ticks into a single catch-up.
pub struct SouthConnector {
    connector_id: String,
    driver: Arc<Mutex<Box<dyn SouthDriver>>>,
    items_by_mode: HashMap<String, Vec<Item>>,
    history: Option<HistorySettings>,
    ingestor: Arc<dyn Ingestor>,
    store: Arc<dyn QueueStore>,
    metrics: Arc<ConnectorMetrics>,
    supervisor: ConnectionSupervisor,
    tasks: std::sync::Mutex<Vec<JoinHandle<()>>>,
}

impl SouthConnector {
    /// Assemble a connector; disabled items are dropped here.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        connector_id: impl Into<String>,
        driver: Box<dyn SouthDriver>,
        items: Vec<Item>,
        history: Option<HistorySettings>,
        ingestor: Arc<dyn Ingestor>,
        store: Arc<dyn QueueStore>,
        metrics: Arc<ConnectorMetrics>,
        retry_interval: Duration,
    ) -> Self {
        let connector_id = connector_id.into();
        let mut items_by_mode: HashMap<String, Vec<Item>> = HashMap::new();
        for item in items {
            if !item.enabled {
                tracing::debug!(
                    "Connector '{}' skipping disabled item '{}'",
                    connector_id,
                    item.id
                );
                continue;
            }
            items_by_mode
                .entry(item.scan_mode_id.clone())
                .or_default()
                .push(item);
        }
        let supervisor =
            ConnectionSupervisor::new(connector_id.clone(), metrics.clone(), retry_interval);
        Self {
            connector_id,
            driver: Arc::new(Mutex::new(driver)),
            items_by_mode,
            history,
            ingestor,
            store,
            metrics,
            supervisor,
            tasks: std::sync::Mutex::new(Vec::new()),
        }
    }

    pub fn connector_id(&self) -> &str {
        &self.connector_id
    }

    pub fn state(&self) -> ConnectionState {
        self.supervisor.state()
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        self.metrics.snapshot()
    }

    /// Probe the device without touching the polling session.
    pub async fn test_connection(&self) -> Result<()> {
        self.driver.lock().await.test_connection().await
    }

    /// Begin connecting and subscribe every referenced scan mode.
    ///
    /// Fails without side effects if an item references a scan mode the
    /// scheduler does not know, or if history is configured on a driver
    /// that cannot serve it.
    pub async fn start(self: &Arc<Self>, scheduler: &ScanScheduler) -> Result<()> {
        let mut subscriptions: Vec<(String, watch::Receiver<Tick>)> = Vec::new();
        for mode_id in self.items_by_mode.keys() {
            match scheduler.subscribe(mode_id) {
                Some(rx) => subscriptions.push((mode_id.clone(), rx)),
                None => {
                    return Err(GatewayError::Config(format!(
                        "unknown scan mode '{}' referenced by connector '{}'",
                        mode_id, self.connector_id
                    )));
                }
            }
        }
        if self.history.is_some() && !self.driver.lock().await.supports_history() {
            return Err(GatewayError::Config(format!(
                "connector '{}' configures history but its driver does not support it",
                self.connector_id
            )));
        }

        let mut tasks = self
            .tasks
            .lock()
            .unwrap_or_else(|e| e.into_inner());

        let this = self.clone();
        tasks.push(tokio::spawn(async move {
            let driver = this.driver.clone();
            let _ = this
                .supervisor
                .establish(move || {
                    let driver = driver.clone();
                    async move { driver.lock().await.connect().await }
                })
                .await;
        }));

        for (mode_id, mut rx) in subscriptions {
            let this = self.clone();
            tasks.push(tokio::spawn(async move {
                let cancel = this.supervisor.token();
                loop {
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        changed = rx.changed() => {
                            if changed.is_err() {
                                break;
                            }
                            this.handle_tick(&mode_id).await;
                        }
                    }
                }
            }));
        }
        Ok(())
    }

    /// Stop polling and close the device session. Idempotent.
    pub async fn disconnect(&self) -> Result<()> {
        if self.supervisor.is_cancelled() {
            return Ok(());
        }
        self.supervisor.cancel();
        let handles: Vec<JoinHandle<()>> = {
            let mut tasks = self.tasks.lock().unwrap_or_else(|e| e.into_inner());
            tasks.drain(..).collect()
        };
        for handle in handles {
            let _ = handle.await;
        }
        if let Err(e) = self.driver.lock().await.disconnect().await {
            tracing::warn!(
                "Connector '{}' driver disconnect failed: {}",
                self.connector_id,
                e
            );
        }
        self.supervisor.set_state(ConnectionState::Disconnected);
        tracing::info!("Connector '{}' stopped", self.connector_id);
        Ok(())
    }

    async fn handle_tick(&self, scan_mode_id: &str) {
        if !self.supervisor.state().is_connected() {
            tracing::debug!(
                "Connector '{}' skipping tick of '{}' while {}",
                self.connector_id,
                scan_mode_id,
                self.supervisor.state()
            );
            return;
        }
        let items = match self.items_by_mode.get(scan_mode_id) {
            Some(items) => items,
            None => return,
        };

        let result = match &self.history {
            Some(settings) => {
                let runner = HistoryRunner::new(
                    self.connector_id.clone(),
                    scan_mode_id.to_string(),
                    settings.clone(),
                    self.store.clone(),
                    self.metrics.clone(),
                );
                runner
                    .run(&self.driver, items, &self.ingestor, &self.supervisor)
                    .await
            }
            None => self.poll_items(items).await,
        };

        match result {
            Ok(()) => {}
            // Shutdown mid-pass is not an acquisition fault.
            Err(GatewayError::Disconnected) => {}
            Err(e) => {
                self.metrics.record_read_error(e.to_string());
                tracing::error!(
                    "Connector '{}' acquisition on '{}' failed: {}",
                    self.connector_id,
                    scan_mode_id,
                    e
                );
            }
        }
    }

    async fn poll_items(&self, items: &[Item]) -> Result<()> {
        let batch = {
            let driver = self.driver.clone();
            let items = items.to_vec();
            self.supervisor
                .guard(async move { driver.lock().await.read_points(&items).await })
                .await?
        };
        if batch.is_empty() {
            return Ok(());
        }
        self.metrics.record_values_retrieved(batch.len() as u64);
        self.ingestor.ingest_values(batch).await
    }
}

impl std::fmt::Debug for SouthConnector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SouthConnector")
            .field("connector_id", &self.connector_id)
            .field("state", &self.state())
            .field("modes", &self.items_by_mode.keys().collect::<Vec<_>>())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::data::{Value, ValueBatch};
    use crate::core::scan::{HistoryKey, HistorySettingsConfig, ScanMode, Schedule};
    use crate::core::traits::HistoryPage;
    use crate::store::MemoryStore;
    use async_trait::async_trait;
    use chrono::{DateTime, TimeZone, Utc};
    use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

    struct PollSouth {
        connect_fail: Arc<AtomicBool>,
        read_calls: Arc<AtomicU32>,
        disconnect_calls: Arc<AtomicU32>,
    }

    #[async_trait]
    impl SouthDriver for PollSouth {
        fn driver_name(&self) -> &'static str {
            "poll"
        }

        async fn connect(&mut self) -> Result<()> {
            if self.connect_fail.load(Ordering::SeqCst) {
                return Err(GatewayError::Connection("refused".to_string()));
            }
            Ok(())
        }

        async fn disconnect(&mut self) -> Result<()> {
            self.disconnect_calls.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn test_connection(&self) -> Result<()> {
            Ok(())
        }

        async fn read_points(&mut self, items: &[Item]) -> Result<ValueBatch> {
            let n = self.read_calls.fetch_add(1, Ordering::SeqCst);
            let mut batch = ValueBatch::new();
            for item in items {
                batch.add(Value::new(&item.id, Utc::now(), f64::from(n)));
            }
            Ok(batch)
        }
    }

    struct HistSouth {
        pages: Arc<std::sync::Mutex<Vec<HistoryPage>>>,
        calls: Arc<std::sync::Mutex<Vec<(DateTime<Utc>, DateTime<Utc>)>>>,
    }

    #[async_trait]
    impl SouthDriver for HistSouth {
        fn driver_name(&self) -> &'static str {
            "hist"
        }

        async fn connect(&mut self) -> Result<()> {
            Ok(())
        }

        async fn disconnect(&mut self) -> Result<()> {
            Ok(())
        }

        async fn test_connection(&self) -> Result<()> {
            Ok(())
        }

        async fn read_points(&mut self, _items: &[Item]) -> Result<ValueBatch> {
            Ok(ValueBatch::new())
        }

        fn supports_history(&self) -> bool {
            true
        }

        async fn history_query(
            &mut self,
            _items: &[Item],
            start: DateTime<Utc>,
            end: DateTime<Utc>,
        ) -> Result<HistoryPage> {
            self.calls.lock().unwrap().push((start, end));
            let mut pages = self.pages.lock().unwrap();
            if pages.is_empty() {
                Ok(HistoryPage::default())
            } else {
                Ok(pages.remove(0))
            }
        }
    }

    struct CollectingIngestor {
        batches: std::sync::Mutex<Vec<Vec<Value>>>,
    }

    #[async_trait]
    impl Ingestor for CollectingIngestor {
        async fn ingest_values(&self, values: ValueBatch) -> Result<()> {
            self.batches.lock().unwrap().push(values.into_vec());
            Ok(())
        }

        async fn ingest_file(&self, _path: &std::path::Path) -> Result<()> {
            Ok(())
        }
    }

    async fn scheduler_with_mode(id: &str, interval: Duration) -> ScanScheduler {
        let scheduler = ScanScheduler::new();
        scheduler
            .register(ScanMode::new(id, Schedule::interval(interval)))
            .unwrap();
        scheduler
    }

    fn connector(
        driver: Box<dyn SouthDriver>,
        items: Vec<Item>,
        history: Option<HistorySettings>,
        store: Arc<MemoryStore>,
    ) -> (Arc<SouthConnector>, Arc<CollectingIngestor>) {
        let ingestor = Arc::new(CollectingIngestor {
            batches: std::sync::Mutex::new(Vec::new()),
        });
        let connector = Arc::new(SouthConnector::new(
            "s1",
            driver,
            items,
            history,
            ingestor.clone() as Arc<dyn Ingestor>,
            store as Arc<dyn QueueStore>,
            Arc::new(ConnectorMetrics::new("s1")),
            Duration::from_millis(100),
        ));
        (connector, ingestor)
    }

    // ========== polling tests ==========

    #[tokio::test(start_paused = true)]
    async fn test_tick_polls_items_and_ingests() {
        let read_calls = Arc::new(AtomicU32::new(0));
        let driver = Box::new(PollSouth {
            connect_fail: Arc::new(AtomicBool::new(false)),
            read_calls: read_calls.clone(),
            disconnect_calls: Arc::new(AtomicU32::new(0)),
        });
        let scheduler = scheduler_with_mode("fast", Duration::from_secs(10)).await;
        let (connector, ingestor) = connector(
            driver,
            vec![Item::new("p1", "fast"), Item::new("p2", "fast")],
            None,
            Arc::new(MemoryStore::new()),
        );

        connector.start(&scheduler).await.unwrap();
        tokio::time::sleep(Duration::from_millis(10_100)).await;

        assert_eq!(read_calls.load(Ordering::SeqCst), 1);
        let batches = ingestor.batches.lock().unwrap();
        assert_eq!(batches.len(), 1);
        assert_eq!(batches[0].len(), 2);
        drop(batches);

        connector.disconnect().await.unwrap();
        scheduler.shutdown(Duration::from_secs(1)).await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_tick_skipped_while_disconnected() {
        let read_calls = Arc::new(AtomicU32::new(0));
        let driver = Box::new(PollSouth {
            connect_fail: Arc::new(AtomicBool::new(true)),
            read_calls: read_calls.clone(),
            disconnect_calls: Arc::new(AtomicU32::new(0)),
        });
        let scheduler = scheduler_with_mode("fast", Duration::from_secs(10)).await;
        let (connector, ingestor) = connector(
            driver,
            vec![Item::new("p1", "fast")],
            None,
            Arc::new(MemoryStore::new()),
        );

        connector.start(&scheduler).await.unwrap();
        tokio::time::sleep(Duration::from_millis(10_100)).await;

        assert_eq!(read_calls.load(Ordering::SeqCst), 0);
        assert!(ingestor.batches.lock().unwrap().is_empty());
        assert_eq!(connector.state(), ConnectionState::Connecting);

        connector.disconnect().await.unwrap();
        scheduler.shutdown(Duration::from_secs(1)).await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_disconnect_is_idempotent() {
        let disconnect_calls = Arc::new(AtomicU32::new(0));
        let driver = Box::new(PollSouth {
            connect_fail: Arc::new(AtomicBool::new(false)),
            read_calls: Arc::new(AtomicU32::new(0)),
            disconnect_calls: disconnect_calls.clone(),
        });
        let scheduler = scheduler_with_mode("fast", Duration::from_secs(10)).await;
        let (connector, _) = connector(
            driver,
            vec![Item::new("p1", "fast")],
            None,
            Arc::new(MemoryStore::new()),
        );

        connector.start(&scheduler).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(connector.state(), ConnectionState::Connected);

        connector.disconnect().await.unwrap();
        connector.disconnect().await.unwrap();
        assert_eq!(disconnect_calls.load(Ordering::SeqCst), 1);
        assert_eq!(connector.state(), ConnectionState::Disconnected);
        scheduler.shutdown(Duration::from_secs(1)).await;
    }

    #[tokio::test]
    async fn test_unknown_scan_mode_is_rejected() {
        let driver = Box::new(PollSouth {
            connect_fail: Arc::new(AtomicBool::new(false)),
            read_calls: Arc::new(AtomicU32::new(0)),
            disconnect_calls: Arc::new(AtomicU32::new(0)),
        });
        let scheduler = scheduler_with_mode("fast", Duration::from_secs(10)).await;
        let (connector, _) = connector(
            driver,
            vec![Item::new("p1", "nope")],
            None,
            Arc::new(MemoryStore::new()),
        );

        let err = connector.start(&scheduler).await.unwrap_err();
        assert!(err.to_string().contains("unknown scan mode 'nope'"));
        scheduler.shutdown(Duration::from_secs(1)).await;
    }

    #[tokio::test]
    async fn test_history_requires_capable_driver() {
        let driver = Box::new(PollSouth {
            connect_fail: Arc::new(AtomicBool::new(false)),
            read_calls: Arc::new(AtomicU32::new(0)),
            disconnect_calls: Arc::new(AtomicU32::new(0)),
        });
        let scheduler = scheduler_with_mode("fast", Duration::from_secs(10)).await;
        let settings = HistorySettingsConfig::default().to_settings().unwrap();
        let (connector, _) = connector(
            driver,
            vec![Item::new("p1", "fast")],
            Some(settings),
            Arc::new(MemoryStore::new()),
        );

        let err = connector.start(&scheduler).await.unwrap_err();
        assert!(err.to_string().contains("does not support"));
        scheduler.shutdown(Duration::from_secs(1)).await;
    }

    // ========== history tests ==========

    #[tokio::test(start_paused = true)]
    async fn test_history_tick_queries_from_start_instant() {
        let origin = Utc.with_ymd_and_hms(2020, 1, 1, 0, 0, 0).unwrap();
        let observed = Utc.with_ymd_and_hms(2020, 6, 1, 0, 0, 0).unwrap();
        let calls = Arc::new(std::sync::Mutex::new(Vec::new()));
        let driver = Box::new(HistSouth {
            pages: Arc::new(std::sync::Mutex::new(vec![HistoryPage::from_values(
                ValueBatch::from_values(vec![Value::new("p1", observed, 1.0)]),
            )])),
            calls: calls.clone(),
        });

        let mut config = HistorySettingsConfig::default();
        // One giant window so the whole backlog is a single query.
        config.max_read_interval_s = 320_000_000;
        config.start_instant = Some(origin);
        let settings = config.to_settings().unwrap();

        let scheduler = scheduler_with_mode("fast", Duration::from_secs(10)).await;
        let store = Arc::new(MemoryStore::new());
        let (connector, ingestor) = connector(
            driver,
            vec![Item::new("p1", "fast")],
            Some(settings),
            store.clone(),
        );

        connector.start(&scheduler).await.unwrap();
        tokio::time::sleep(Duration::from_millis(10_100)).await;

        {
            let calls = calls.lock().unwrap();
            assert_eq!(calls.len(), 1);
            assert_eq!(calls[0].0, origin);
        }
        assert_eq!(ingestor.batches.lock().unwrap().len(), 1);

        let key = HistoryKey::for_scan_mode("fast");
        assert_eq!(store.read_watermark(&key).await.unwrap(), Some(observed));

        connector.disconnect().await.unwrap();
        scheduler.shutdown(Duration::from_secs(1)).await;
    }
}
