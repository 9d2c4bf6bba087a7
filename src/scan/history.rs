//! Windowed, resumable history acquisition.
//!
//! Each tick turns the persisted watermark into a query window
//! `[watermark - overlap, now - read_delay]`, splits it into
//! sub-intervals of at most `max_read_interval`, and queries them
//! strictly in order. The watermark only ever advances to the largest
//! instant actually observed, and is persisted before the next
//! sub-interval is queried, so a crash or failure mid-backlog resumes
//! exactly where coverage stopped.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::Mutex;

use crate::core::error::{GatewayError, Result};
use crate::core::metrics::ConnectorMetrics;
use crate::core::scan::{HistoryKey, HistorySettings, Item};
use crate::core::traits::{Ingestor, SouthDriver};
use crate::lifecycle::ConnectionSupervisor;
use crate::store::QueueStore;

/// Split `[start, end)` into consecutive sub-intervals of at most `max`.
pub(crate) fn split_window(
    start: DateTime<Utc>,
    end: DateTime<Utc>,
    max: chrono::Duration,
) -> Vec<(DateTime<Utc>, DateTime<Utc>)> {
    let mut windows = Vec::new();
    let mut cursor = start;
    while cursor < end {
        let next = (cursor + max).min(end);
        windows.push((cursor, next));
        cursor = next;
    }
    windows
}

/// Executes history acquisition for one scan mode of one connector.
pub struct HistoryRunner {
    connector_id: String,
    scan_mode_id: String,
    settings: HistorySettings,
    store: Arc<dyn QueueStore>,
    metrics: Arc<ConnectorMetrics>,
}

impl HistoryRunner {
    /// Create a runner bound to one scan mode.
    pub fn new(
        connector_id: impl Into<String>,
        scan_mode_id: impl Into<String>,
        settings: HistorySettings,
        store: Arc<dyn QueueStore>,
        metrics: Arc<ConnectorMetrics>,
    ) -> Self {
        Self {
            connector_id: connector_id.into(),
            scan_mode_id: scan_mode_id.into(),
            settings,
            store,
            metrics,
        }
    }

    /// Acquire everything between the watermark(s) and now.
    pub async fn run(
        &self,
        driver: &Arc<Mutex<Box<dyn SouthDriver>>>,
        items: &[Item],
        ingestor: &Arc<dyn Ingestor>,
        supervisor: &ConnectionSupervisor,
    ) -> Result<()> {
        self.run_at(Utc::now(), driver, items, ingestor, supervisor)
            .await
    }

    /// [`HistoryRunner::run`] with an explicit "now", the testable seam.
    pub(crate) async fn run_at(
        &self,
        now: DateTime<Utc>,
        driver: &Arc<Mutex<Box<dyn SouthDriver>>>,
        items: &[Item],
        ingestor: &Arc<dyn Ingestor>,
        supervisor: &ConnectionSupervisor,
    ) -> Result<()> {
        if self.settings.max_instant_per_item {
            for item in items {
                let key = HistoryKey::for_item(&self.scan_mode_id, &item.id);
                let run = self
                    .run_window(now, driver, std::slice::from_ref(item), &key, ingestor, supervisor)
                    .await;
                match run {
                    Ok(()) => {}
                    // Shutdown and storage faults stop the whole pass.
                    Err(e) if matches!(e, GatewayError::Disconnected) || e.is_storage() => {
                        return Err(e);
                    }
                    Err(e) => {
                        self.metrics.record_read_error(e.to_string());
                        tracing::error!(
                            "Connector '{}' history for item '{}' failed: {}",
                            self.connector_id,
                            item.id,
                            e
                        );
                    }
                }
            }
            Ok(())
        } else {
            let key = HistoryKey::for_scan_mode(&self.scan_mode_id);
            self.run_window(now, driver, items, &key, ingestor, supervisor)
                .await
        }
    }

    async fn run_window(
        &self,
        now: DateTime<Utc>,
        driver: &Arc<Mutex<Box<dyn SouthDriver>>>,
        items: &[Item],
        key: &HistoryKey,
        ingestor: &Arc<dyn Ingestor>,
        supervisor: &ConnectionSupervisor,
    ) -> Result<()> {
        let end = now - self.settings.read_delay();
        let last = match self.store.read_watermark(key).await? {
            Some(instant) => instant,
            None => {
                // First run: without an explicit backfill start the
                // watermark begins at the live edge.
                let initial = self.settings.start_instant.unwrap_or(end);
                self.store.write_watermark(key, initial).await?;
                tracing::info!(
                    "Connector '{}' initialized watermark {} to {}",
                    self.connector_id,
                    key,
                    initial
                );
                initial
            }
        };

        let start = last - self.settings.overlap();
        if start >= end {
            return Ok(());
        }

        let mut watermark = last;
        for (window_start, window_end) in
            split_window(start, end, self.settings.max_read_interval())
        {
            let page = {
                let driver = driver.clone();
                let items = items.to_vec();
                let timeout = self.settings.read_timeout();
                supervisor
                    .guard(async move {
                        match tokio::time::timeout(timeout, async move {
                            driver
                                .lock()
                                .await
                                .history_query(&items, window_start, window_end)
                                .await
                        })
                        .await
                        {
                            Ok(result) => result,
                            Err(_) => Err(GatewayError::Timeout(format!(
                                "history query {} - {} exceeded {:?}",
                                window_start, window_end, timeout
                            ))),
                        }
                    })
                    .await?
            };

            let observed = page.observed_max();
            let count = page.values.len() as u64;
            if count > 0 {
                self.metrics.record_values_retrieved(count);
                // Data is made durable before the watermark moves; a
                // crash between the two re-reads rather than losing.
                ingestor.ingest_values(page.values).await?;
            }
            tracing::debug!(
                "Connector '{}' history {} [{} - {}] returned {} value(s)",
                self.connector_id,
                key,
                window_start,
                window_end,
                count
            );

            if let Some(instant) = observed {
                if instant > watermark {
                    self.store.write_watermark(key, instant).await?;
                    watermark = instant;
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::data::{Value, ValueBatch};
    use crate::core::scan::HistorySettingsConfig;
    use crate::core::traits::HistoryPage;
    use crate::store::MemoryStore;
    use async_trait::async_trait;
    use chrono::TimeZone;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::time::Duration;

    fn ts(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(secs, 0).unwrap()
    }

    fn t(h: u32, m: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2020, 1, 1, h, m, 0).unwrap()
    }

    #[derive(Clone)]
    enum Step {
        Page(Vec<Value>, Option<DateTime<Utc>>),
        Fail,
        Hang,
    }

    struct ScriptedSouth {
        script: Arc<std::sync::Mutex<VecDeque<Step>>>,
        calls: Arc<std::sync::Mutex<Vec<(DateTime<Utc>, DateTime<Utc>, Vec<String>)>>>,
    }

    impl ScriptedSouth {
        fn new(steps: Vec<Step>) -> Self {
            Self {
                script: Arc::new(std::sync::Mutex::new(steps.into_iter().collect())),
                calls: Arc::new(std::sync::Mutex::new(Vec::new())),
            }
        }
    }

    #[async_trait]
    impl SouthDriver for ScriptedSouth {
        fn driver_name(&self) -> &'static str {
            "scripted"
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
            items: &[Item],
            start: DateTime<Utc>,
            end: DateTime<Utc>,
        ) -> Result<HistoryPage> {
            self.calls.lock().unwrap().push((
                start,
                end,
                items.iter().map(|i| i.id.clone()).collect(),
            ));
            let step = self.script.lock().unwrap().pop_front();
            match step {
                Some(Step::Page(values, max)) => Ok(HistoryPage {
                    values: ValueBatch::from_values(values),
                    max_instant_retrieved: max,
                }),
                Some(Step::Fail) => Err(GatewayError::Driver("scripted failure".to_string())),
                Some(Step::Hang) => {
                    tokio::time::sleep(Duration::from_secs(86_400)).await;
                    Ok(HistoryPage::default())
                }
                None => Ok(HistoryPage::default()),
            }
        }
    }

    struct RecordingIngestor {
        batches: std::sync::Mutex<Vec<Vec<Value>>>,
        fail: AtomicBool,
    }

    impl RecordingIngestor {
        fn new() -> Self {
            Self {
                batches: std::sync::Mutex::new(Vec::new()),
                fail: AtomicBool::new(false),
            }
        }
    }

    #[async_trait]
    impl Ingestor for RecordingIngestor {
        async fn ingest_values(&self, values: ValueBatch) -> Result<()> {
            if self.fail.load(Ordering::SeqCst) {
                return Err(GatewayError::Store(crate::store::StoreError::Corrupt(
                    "simulated".to_string(),
                )));
            }
            self.batches.lock().unwrap().push(values.into_vec());
            Ok(())
        }

        async fn ingest_file(&self, _path: &std::path::Path) -> Result<()> {
            Ok(())
        }
    }

    struct Rig {
        runner: HistoryRunner,
        driver: Arc<Mutex<Box<dyn SouthDriver>>>,
        calls: Arc<std::sync::Mutex<Vec<(DateTime<Utc>, DateTime<Utc>, Vec<String>)>>>,
        ingestor: Arc<RecordingIngestor>,
        store: Arc<MemoryStore>,
        supervisor: ConnectionSupervisor,
    }

    fn rig(settings: HistorySettings, steps: Vec<Step>) -> Rig {
        let south = ScriptedSouth::new(steps);
        let calls = south.calls.clone();
        let store = Arc::new(MemoryStore::new());
        let metrics = Arc::new(ConnectorMetrics::new("s1"));
        Rig {
            runner: HistoryRunner::new(
                "s1",
                "hourly",
                settings,
                store.clone() as Arc<dyn QueueStore>,
                metrics.clone(),
            ),
            driver: Arc::new(Mutex::new(Box::new(south))),
            calls,
            ingestor: Arc::new(RecordingIngestor::new()),
            store,
            supervisor: ConnectionSupervisor::new("s1", metrics, Duration::from_millis(50)),
        }
    }

    fn settings() -> HistorySettings {
        HistorySettingsConfig::default().to_settings().unwrap()
    }

    fn items() -> Vec<Item> {
        vec![Item::new("pump1", "hourly")]
    }

    async fn run(rig: &Rig, now: DateTime<Utc>, items: &[Item]) -> Result<()> {
        let ingestor = rig.ingestor.clone() as Arc<dyn Ingestor>;
        rig.runner
            .run_at(now, &rig.driver, items, &ingestor, &rig.supervisor)
            .await
    }

    // ========== windowing tests ==========

    #[test]
    fn test_split_two_hours_into_hour_windows() {
        let windows = split_window(t(0, 0), t(2, 0), chrono::Duration::seconds(3600));
        assert_eq!(windows, vec![(t(0, 0), t(1, 0)), (t(1, 0), t(2, 0))]);
    }

    #[test]
    fn test_split_uneven_remainder() {
        let windows = split_window(t(0, 0), t(2, 30), chrono::Duration::seconds(3600));
        assert_eq!(windows.len(), 3);
        assert_eq!(windows[2], (t(2, 0), t(2, 30)));
    }

    #[test]
    fn test_split_small_window_is_single() {
        let windows = split_window(t(0, 0), t(0, 10), chrono::Duration::seconds(3600));
        assert_eq!(windows, vec![(t(0, 0), t(0, 10))]);
    }

    // ========== runner tests ==========

    #[tokio::test]
    async fn test_backlog_queried_in_hour_steps() {
        let mut s = settings();
        s.read_delay_ms = 0;
        let rig = rig(
            s,
            vec![
                Step::Page(vec![Value::new("pump1", t(0, 50), 1.0)], None),
                Step::Page(vec![Value::new("pump1", t(1, 50), 2.0)], None),
            ],
        );
        let key = HistoryKey::for_scan_mode("hourly");
        rig.store.write_watermark(&key, t(0, 0)).await.unwrap();

        run(&rig, t(2, 0), &items()).await.unwrap();

        let calls = rig.calls.lock().unwrap();
        assert_eq!(calls.len(), 2);
        assert_eq!((calls[0].0, calls[0].1), (t(0, 0), t(1, 0)));
        assert_eq!((calls[1].0, calls[1].1), (t(1, 0), t(2, 0)));

        // Watermark tracks the observed maximum, not the window end.
        let wm = rig.store.read_watermark(&key).await.unwrap();
        assert_eq!(wm, Some(t(1, 50)));
        assert_eq!(rig.ingestor.batches.lock().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_failed_subinterval_preserves_prior_watermark() {
        let mut s = settings();
        s.read_delay_ms = 0;
        let rig = rig(
            s,
            vec![
                Step::Page(vec![Value::new("pump1", t(0, 40), 1.0)], None),
                Step::Fail,
                Step::Page(vec![Value::new("pump1", t(2, 40), 3.0)], None),
            ],
        );
        let key = HistoryKey::for_scan_mode("hourly");
        rig.store.write_watermark(&key, t(0, 0)).await.unwrap();

        let result = run(&rig, t(3, 0), &items()).await;
        assert!(result.is_err());

        // Only the first window ran to completion; the third was never
        // queried.
        assert_eq!(rig.calls.lock().unwrap().len(), 2);
        let wm = rig.store.read_watermark(&key).await.unwrap();
        assert_eq!(wm, Some(t(0, 40)));
    }

    #[tokio::test]
    async fn test_empty_page_does_not_advance() {
        let mut s = settings();
        s.read_delay_ms = 0;
        let rig = rig(s, vec![Step::Page(vec![], None)]);
        let key = HistoryKey::for_scan_mode("hourly");
        rig.store.write_watermark(&key, t(1, 30)).await.unwrap();

        run(&rig, t(2, 0), &items()).await.unwrap();

        let wm = rig.store.read_watermark(&key).await.unwrap();
        assert_eq!(wm, Some(t(1, 30)));
        assert!(rig.ingestor.batches.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_driver_reported_max_wins_over_values() {
        let mut s = settings();
        s.read_delay_ms = 0;
        let rig = rig(
            s,
            vec![Step::Page(
                vec![Value::new("pump1", t(1, 10), 1.0)],
                Some(t(1, 45)),
            )],
        );
        let key = HistoryKey::for_scan_mode("hourly");
        rig.store.write_watermark(&key, t(1, 0)).await.unwrap();

        run(&rig, t(2, 0), &items()).await.unwrap();
        let wm = rig.store.read_watermark(&key).await.unwrap();
        assert_eq!(wm, Some(t(1, 45)));
    }

    #[tokio::test]
    async fn test_first_run_initializes_to_live_edge() {
        let mut s = settings();
        s.read_delay_ms = 0;
        let rig = rig(s, vec![]);
        let key = HistoryKey::for_scan_mode("hourly");

        run(&rig, t(2, 0), &items()).await.unwrap();

        // No backfill start configured: nothing queried, watermark
        // pinned to now.
        assert!(rig.calls.lock().unwrap().is_empty());
        let wm = rig.store.read_watermark(&key).await.unwrap();
        assert_eq!(wm, Some(t(2, 0)));
    }

    #[tokio::test]
    async fn test_start_instant_backfills_from_configured_origin() {
        let mut s = settings();
        s.read_delay_ms = 0;
        s.start_instant = Some(t(1, 0));
        let rig = rig(s, vec![Step::Page(vec![], None)]);

        run(&rig, t(2, 0), &items()).await.unwrap();

        let calls = rig.calls.lock().unwrap();
        assert_eq!(calls.len(), 1);
        assert_eq!((calls[0].0, calls[0].1), (t(1, 0), t(2, 0)));
    }

    #[tokio::test]
    async fn test_overlap_rewinds_window_start() {
        let mut s = settings();
        s.read_delay_ms = 0;
        s.overlap_ms = 600_000;
        let rig = rig(s, vec![Step::Page(vec![], None)]);
        let key = HistoryKey::for_scan_mode("hourly");
        rig.store.write_watermark(&key, t(1, 30)).await.unwrap();

        run(&rig, t(2, 0), &items()).await.unwrap();

        let calls = rig.calls.lock().unwrap();
        assert_eq!(calls[0].0, t(1, 20));
    }

    #[tokio::test]
    async fn test_read_delay_lags_behind_now() {
        let mut s = settings();
        s.read_delay_ms = 60_000;
        let rig = rig(s, vec![Step::Page(vec![], None)]);
        let key = HistoryKey::for_scan_mode("hourly");
        rig.store.write_watermark(&key, t(1, 0)).await.unwrap();

        run(&rig, t(2, 0), &items()).await.unwrap();

        let calls = rig.calls.lock().unwrap();
        assert_eq!(calls[0].1, t(1, 59));
    }

    #[tokio::test(start_paused = true)]
    async fn test_query_timeout_surfaces_without_corrupting_state() {
        let mut s = settings();
        s.read_delay_ms = 0;
        s.read_timeout_s = 1;
        let rig = rig(s, vec![Step::Hang]);
        let key = HistoryKey::for_scan_mode("hourly");
        rig.store.write_watermark(&key, t(1, 0)).await.unwrap();

        let result = run(&rig, t(2, 0), &items()).await;
        assert!(matches!(result, Err(GatewayError::Timeout(_))));

        let wm = rig.store.read_watermark(&key).await.unwrap();
        assert_eq!(wm, Some(t(1, 0)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_disconnect_discards_inflight_query() {
        let mut s = settings();
        s.read_delay_ms = 0;
        let rig = rig(s, vec![Step::Hang]);
        let key = HistoryKey::for_scan_mode("hourly");
        rig.store.write_watermark(&key, t(1, 0)).await.unwrap();

        let cancel = rig.supervisor.token();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            cancel.cancel();
        });

        let result = run(&rig, t(2, 0), &items()).await;
        assert!(matches!(result, Err(GatewayError::Disconnected)));
        let wm = rig.store.read_watermark(&key).await.unwrap();
        assert_eq!(wm, Some(t(1, 0)));
    }

    #[tokio::test]
    async fn test_ingest_fault_stops_before_watermark_moves() {
        let mut s = settings();
        s.read_delay_ms = 0;
        let rig = rig(
            s,
            vec![Step::Page(vec![Value::new("pump1", t(1, 30), 1.0)], None)],
        );
        rig.ingestor.fail.store(true, Ordering::SeqCst);
        let key = HistoryKey::for_scan_mode("hourly");
        rig.store.write_watermark(&key, t(1, 0)).await.unwrap();

        let result = run(&rig, t(2, 0), &items()).await;
        assert!(result.is_err());
        let wm = rig.store.read_watermark(&key).await.unwrap();
        assert_eq!(wm, Some(t(1, 0)));
    }

    #[tokio::test]
    async fn test_per_item_watermarks_are_independent() {
        let mut s = settings();
        s.read_delay_ms = 0;
        s.max_instant_per_item = true;
        let rig = rig(
            s,
            vec![
                Step::Page(vec![Value::new("pump1", t(1, 20), 1.0)], None),
                Step::Fail,
            ],
        );
        let pump1 = HistoryKey::for_item("hourly", "pump1");
        let pump2 = HistoryKey::for_item("hourly", "pump2");
        rig.store.write_watermark(&pump1, t(1, 0)).await.unwrap();
        rig.store.write_watermark(&pump2, t(1, 0)).await.unwrap();

        let both = vec![Item::new("pump1", "hourly"), Item::new("pump2", "hourly")];
        // One item failing does not abort the others.
        run(&rig, t(2, 0), &both).await.unwrap();

        let calls = rig.calls.lock().unwrap();
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[0].2, vec!["pump1"]);
        assert_eq!(calls[1].2, vec!["pump2"]);

        assert_eq!(
            rig.store.read_watermark(&pump1).await.unwrap(),
            Some(t(1, 20))
        );
        assert_eq!(
            rig.store.read_watermark(&pump2).await.unwrap(),
            Some(t(1, 0))
        );
    }

    #[tokio::test]
    async fn test_values_never_newer_than_watermark_lost() {
        // A window whose data lands mid-window: the next run resumes
        // from the observed max, re-covering the tail of the window.
        let mut s = settings();
        s.read_delay_ms = 0;
        let rig = rig(
            s,
            vec![
                Step::Page(vec![Value::new("pump1", ts(1800), 1.0)], None),
                Step::Page(vec![], None),
            ],
        );
        let key = HistoryKey::for_scan_mode("hourly");
        rig.store.write_watermark(&key, ts(0)).await.unwrap();

        run(&rig, ts(3600), &items()).await.unwrap();
        assert_eq!(rig.store.read_watermark(&key).await.unwrap(), Some(ts(1800)));

        run(&rig, ts(4000), &items()).await.unwrap();
        let calls = rig.calls.lock().unwrap();
        assert_eq!(calls[1].0, ts(1800));
        assert_eq!(calls[1].1, ts(4000));
    }
}
