//! Store-and-forward delivery engine for one north connector.
//!
//! Producers hand values and files to the engine through [`Ingestor`];
//! both are persisted to the durable queue before the call returns. A
//! single flusher task drains the queue to the north driver in strict
//! sequence order, batching values by `group_count`, bounding each cycle
//! by `max_send_count`, and retrying failed entries in place until they
//! succeed or size-bound eviction drops them.
//!
//! Flushes are triggered by the configured scan-mode tick, by the queue
//! reaching `max_send_count` values, by a file arriving when
//! `send_file_immediately` is set, and once on connect to drain backlog
//! accumulated while offline.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::{broadcast, watch, Mutex, Notify};
use tokio::task::JoinHandle;

use crate::cache::archive::Archiver;
use crate::cache::policy::{ArchivePolicy, CachingPolicy};
use crate::core::data::{CacheEntry, EntryPayload, FileReference, Value, ValueBatch};
use crate::core::error::{GatewayError, Result};
use crate::core::metrics::{ConnectorMetrics, MetricsEvent, MetricsSnapshot};
use crate::core::traits::{ConnectionState, Ingestor, NorthDriver};
use crate::lifecycle::ConnectionSupervisor;
use crate::scan::scheduler::Tick;
use crate::store::QueueStore;

/// Entries decoded per trip to the store while draining.
const PENDING_PAGE: usize = 256;

/// Durable cache plus delivery loop for one north connector.
pub struct CacheEngine {
    connector_id: String,
    policy: CachingPolicy,
    driver: Arc<Mutex<Box<dyn NorthDriver>>>,
    store: Arc<dyn QueueStore>,
    archiver: Arc<Archiver>,
    metrics: Arc<ConnectorMetrics>,
    supervisor: ConnectionSupervisor,
    flush_notify: Notify,
    files_dir: PathBuf,
    queued_values: AtomicU64,
    queued_files: AtomicU64,
    tasks: std::sync::Mutex<Vec<JoinHandle<()>>>,
}

impl CacheEngine {
    /// Create an engine. No tasks run until [`CacheEngine::start`].
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        connector_id: impl Into<String>,
        policy: CachingPolicy,
        archive: ArchivePolicy,
        driver: Box<dyn NorthDriver>,
        store: Arc<dyn QueueStore>,
        metrics: Arc<ConnectorMetrics>,
        cache_dir: &Path,
        retry_interval: Duration,
    ) -> Self {
        let connector_id = connector_id.into();
        let supervisor =
            ConnectionSupervisor::new(connector_id.clone(), metrics.clone(), retry_interval);
        let archiver = Arc::new(Archiver::new(connector_id.clone(), archive, cache_dir));
        Self {
            files_dir: cache_dir.join("files"),
            connector_id,
            policy,
            driver: Arc::new(Mutex::new(driver)),
            store,
            archiver,
            metrics,
            supervisor,
            flush_notify: Notify::new(),
            queued_values: AtomicU64::new(0),
            queued_files: AtomicU64::new(0),
            tasks: std::sync::Mutex::new(Vec::new()),
        }
    }

    /// Connector this engine serves.
    pub fn connector_id(&self) -> &str {
        &self.connector_id
    }

    /// Scan mode whose ticks drive periodic flushing.
    pub fn scan_mode_id(&self) -> &str {
        &self.policy.scan_mode_id
    }

    /// Current connection state.
    pub fn state(&self) -> ConnectionState {
        self.supervisor.state()
    }

    /// Current metrics.
    pub fn snapshot(&self) -> MetricsSnapshot {
        self.metrics.snapshot()
    }

    /// Metrics snapshot plus live updates.
    pub fn subscribe_metrics(&self) -> (MetricsSnapshot, broadcast::Receiver<MetricsEvent>) {
        self.metrics.subscribe()
    }

    /// Zero the counters without touching queue contents.
    pub fn reset_metrics(&self) -> MetricsSnapshot {
        self.metrics.reset()
    }

    /// Probe the destination without touching the delivery session.
    pub async fn test_connection(&self) -> Result<()> {
        self.driver.lock().await.test_connection().await
    }

    /// Spawn the connect, flusher, and retention tasks.
    ///
    /// `tick_rx` carries the scan-mode cadence; `None` leaves only the
    /// queue-depth and file triggers active. Call once.
    pub async fn start(self: &Arc<Self>, tick_rx: Option<watch::Receiver<Tick>>) -> Result<()> {
        tokio::fs::create_dir_all(&self.files_dir).await?;
        self.restore_counters().await?;

        let mut tasks = Vec::with_capacity(3);

        let engine = self.clone();
        tasks.push(tokio::spawn(async move {
            let driver = engine.driver.clone();
            let connected = engine
                .supervisor
                .establish(|| {
                    let driver = driver.clone();
                    async move { driver.lock().await.connect().await }
                })
                .await;
            if connected.is_ok() {
                // Drain whatever queued up while offline.
                engine.flush_notify.notify_one();
            }
        }));

        let engine = self.clone();
        tasks.push(tokio::spawn(async move {
            engine.run_flusher(tick_rx).await;
        }));

        tasks.push(self.archiver.spawn_sweeper(self.supervisor.token()));

        if let Ok(mut held) = self.tasks.lock() {
            held.extend(tasks);
        }
        Ok(())
    }

    /// Stop tasks and disconnect the driver. Idempotent.
    pub async fn stop(&self) -> Result<()> {
        if self.supervisor.is_cancelled() {
            return Ok(());
        }
        tracing::info!("Connector '{}' stopping", self.connector_id);
        self.supervisor.cancel();

        let handles: Vec<JoinHandle<()>> = self
            .tasks
            .lock()
            .map(|mut held| held.drain(..).collect())
            .unwrap_or_default();
        for handle in handles {
            let _ = handle.await;
        }

        // Teardown runs whatever state the session is in.
        if let Err(e) = self.driver.lock().await.disconnect().await {
            tracing::warn!(
                "Connector '{}' driver disconnect failed: {}",
                self.connector_id,
                e
            );
        }
        self.supervisor.set_state(ConnectionState::Disconnected);
        Ok(())
    }

    async fn restore_counters(&self) -> Result<()> {
        let entries = self.store.pending(usize::MAX).await?;
        let mut values = 0u64;
        let mut files = 0u64;
        for entry in &entries {
            if entry.is_file() {
                files += 1;
            } else {
                values += entry.value_count() as u64;
            }
        }
        self.queued_values.store(values, Ordering::SeqCst);
        self.queued_files.store(files, Ordering::SeqCst);
        self.update_usage();
        if !entries.is_empty() {
            tracing::info!(
                "Connector '{}' restored {} queued entries ({} values, {} files)",
                self.connector_id,
                entries.len(),
                values,
                files
            );
        }
        Ok(())
    }

    async fn run_flusher(self: Arc<Self>, mut tick_rx: Option<watch::Receiver<Tick>>) {
        let cancel = self.supervisor.token();
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = self.flush_notify.notified() => {}
                alive = wait_tick(&mut tick_rx) => {
                    if !alive {
                        // Scheduler gone; depth and file triggers remain.
                        tick_rx = None;
                        continue;
                    }
                }
            }
            self.drain().await;
        }
    }

    /// Run flush cycles until the queue is below every trigger threshold
    /// or no further progress is possible.
    async fn drain(&self) {
        let cancel = self.supervisor.token();
        loop {
            match self.flush_cycle().await {
                Ok(progress) => {
                    if progress && self.should_flush_again() {
                        continue;
                    }
                    return;
                }
                Err(GatewayError::Disconnected) => return,
                Err(e) => {
                    self.metrics.record_send_error(e.to_string());
                    tracing::error!(
                        "Connector '{}' flush failed: {}, retrying in {:?}",
                        self.connector_id,
                        e,
                        self.policy.retry_interval
                    );
                    tokio::select! {
                        _ = cancel.cancelled() => return,
                        _ = tokio::time::sleep(self.policy.retry_interval) => {}
                    }
                }
            }
        }
    }

    fn should_flush_again(&self) -> bool {
        self.queued_values.load(Ordering::SeqCst) >= self.policy.max_send_count as u64
            || (self.policy.send_file_immediately
                && self.queued_files.load(Ordering::SeqCst) > 0)
    }

    /// One bounded pass over the queue in sequence order.
    ///
    /// Returns whether anything was delivered. Stops early when the
    /// value budget runs out; never skips past an undelivered entry.
    async fn flush_cycle(&self) -> Result<bool> {
        if !self.supervisor.state().is_connected() {
            return Ok(false);
        }
        let mut progress = false;
        let mut value_budget = self.policy.max_send_count;
        'queue: loop {
            let entries = self.store.pending(PENDING_PAGE).await?;
            if entries.is_empty() {
                break;
            }
            for entry in entries {
                match &entry.payload {
                    EntryPayload::File { file } => {
                        self.send_file(&entry, file).await?;
                        progress = true;
                    }
                    EntryPayload::Values { values } => {
                        if value_budget == 0 {
                            break 'queue;
                        }
                        let complete = self.send_values(&entry, values, &mut value_budget).await?;
                        progress = true;
                        if !complete {
                            break 'queue;
                        }
                    }
                }
            }
        }
        Ok(progress)
    }

    async fn send_file(&self, entry: &CacheEntry, file: &FileReference) -> Result<()> {
        let driver = self.driver.clone();
        let path = file.path.clone();
        let result = self
            .supervisor
            .guard(async move { driver.lock().await.handle_file(&path).await })
            .await;
        if let Err(e) = result {
            self.note_send_failure(entry, &e).await;
            return Err(e);
        }

        let removed = self.store.remove(entry.sequence).await?;
        if removed {
            self.queued_files.fetch_sub(1, Ordering::SeqCst);
            self.metrics.record_file_sent();
        }
        if let Err(e) = self.archiver.finalize(file).await {
            tracing::warn!(
                "Connector '{}' failed to archive {:?}: {}",
                self.connector_id,
                file.path,
                e
            );
        }
        self.update_usage();
        Ok(())
    }

    /// Deliver as much of a values entry as the budget allows.
    ///
    /// A fully delivered entry is removed; a partially delivered one is
    /// rewritten in place with only the unsent tail, keeping its
    /// sequence so later entries cannot overtake it.
    async fn send_values(
        &self,
        entry: &CacheEntry,
        values: &[Value],
        budget: &mut usize,
    ) -> Result<bool> {
        let take = values.len().min(*budget);
        let (head, tail) = values.split_at(take);

        for chunk in head.chunks(self.policy.group_count) {
            let driver = self.driver.clone();
            let owned: Vec<Value> = chunk.to_vec();
            let result = self
                .supervisor
                .guard(async move { driver.lock().await.handle_values(&owned).await })
                .await;
            if let Err(e) = result {
                self.note_send_failure(entry, &e).await;
                return Err(e);
            }
            *budget -= chunk.len();
            self.metrics.record_values_sent(chunk.len() as u64);
        }

        if tail.is_empty() {
            let removed = self.store.remove(entry.sequence).await?;
            if removed {
                self.queued_values
                    .fetch_sub(values.len() as u64, Ordering::SeqCst);
            }
            self.update_usage();
            Ok(true)
        } else {
            let mut remainder = entry.clone();
            remainder.payload = EntryPayload::Values {
                values: tail.to_vec(),
            };
            self.store.replace(&remainder).await?;
            self.queued_values
                .fetch_sub(head.len() as u64, Ordering::SeqCst);
            self.update_usage();
            Ok(false)
        }
    }

    async fn note_send_failure(&self, entry: &CacheEntry, error: &GatewayError) {
        // Cancellation is shutdown, not a delivery failure.
        if matches!(error, GatewayError::Disconnected) {
            return;
        }
        tracing::error!(
            "Connector '{}' failed to deliver entry {}: {}",
            self.connector_id,
            entry.sequence,
            error
        );
        let mut bumped = entry.clone();
        bumped.retry_count += 1;
        if let Err(e) = self.store.replace(&bumped).await {
            tracing::warn!(
                "Connector '{}' could not record retry for entry {}: {}",
                self.connector_id,
                entry.sequence,
                e
            );
        }
    }

    /// Drop oldest entries until the cache fits `max_size` again.
    async fn enforce_max_size(&self) {
        if self.policy.max_size == 0 {
            return;
        }
        while self.store.total_size() > self.policy.max_size {
            match self.store.evict_oldest().await {
                Ok(Some(entry)) => {
                    tracing::warn!(
                        "Connector '{}' cache exceeds {} bytes, dropping entry {} enqueued at {} (data loss)",
                        self.connector_id,
                        self.policy.max_size,
                        entry.sequence,
                        entry.enqueued_at
                    );
                    self.metrics.record_eviction();
                    match &entry.payload {
                        EntryPayload::Values { values } => {
                            self.queued_values
                                .fetch_sub(values.len() as u64, Ordering::SeqCst);
                        }
                        EntryPayload::File { file } => {
                            self.queued_files.fetch_sub(1, Ordering::SeqCst);
                            match tokio::fs::remove_file(&file.path).await {
                                Ok(()) => {}
                                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                                Err(e) => tracing::warn!(
                                    "Failed to delete dropped file {:?}: {}",
                                    file.path,
                                    e
                                ),
                            }
                        }
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    tracing::error!("Connector '{}' eviction failed: {}", self.connector_id, e);
                    break;
                }
            }
        }
    }

    fn update_usage(&self) {
        self.metrics
            .set_cache_usage(self.store.total_size(), self.store.entry_count());
    }
}

async fn wait_tick(rx: &mut Option<watch::Receiver<Tick>>) -> bool {
    match rx.as_mut() {
        Some(rx) => rx.changed().await.is_ok(),
        None => std::future::pending().await,
    }
}

#[async_trait]
impl Ingestor for CacheEngine {
    async fn ingest_values(&self, values: ValueBatch) -> Result<()> {
        if values.is_empty() {
            return Ok(());
        }
        let count = values.len() as u64;
        let entry = self
            .store
            .append(EntryPayload::Values {
                values: values.into_vec(),
            })
            .await?;
        tracing::debug!(
            "Connector '{}' queued {} value(s) as entry {}",
            self.connector_id,
            count,
            entry.sequence
        );
        self.queued_values.fetch_add(count, Ordering::SeqCst);
        self.enforce_max_size().await;
        self.update_usage();
        if self.queued_values.load(Ordering::SeqCst) >= self.policy.max_send_count as u64 {
            self.flush_notify.notify_one();
        }
        Ok(())
    }

    async fn ingest_file(&self, path: &Path) -> Result<()> {
        tokio::fs::create_dir_all(&self.files_dir).await?;
        let suffix = format!("-{}", Utc::now().timestamp_millis());
        let staged_name = FileReference::staged_file_name(path, &suffix);
        let staged_path = self.files_dir.join(&staged_name);
        tokio::fs::copy(path, &staged_path).await?;

        let file = FileReference::new(staged_path, suffix);
        let entry = self.store.append(EntryPayload::File { file }).await?;
        tracing::debug!(
            "Connector '{}' staged file '{}' as entry {}",
            self.connector_id,
            staged_name,
            entry.sequence
        );
        self.queued_files.fetch_add(1, Ordering::SeqCst);
        self.enforce_max_size().await;
        self.update_usage();
        if self.policy.send_file_immediately {
            self.flush_notify.notify_one();
        }
        Ok(())
    }
}

impl std::fmt::Debug for CacheEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheEngine")
            .field("connector_id", &self.connector_id)
            .field("state", &self.state())
            .field("queued_entries", &self.store.entry_count())
            .finish()
    }
}
