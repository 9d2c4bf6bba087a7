//! Scan-mode tick generation.
//!
//! One task per scan mode publishes ticks on a watch channel. A watch
//! channel keeps only the latest tick, so a subscriber that is still
//! busy when the next tick fires simply sees one coalesced tick when it
//! comes back, never a backlog.

use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::core::error::{GatewayError, Result};
use crate::core::scan::ScanMode;

/// One scan-mode firing.
#[derive(Debug, Clone, Copy)]
pub struct Tick {
    /// Tick counter within this scan mode, starting at 1.
    pub sequence: u64,

    /// When the tick fired.
    pub fired_at: DateTime<Utc>,
}

impl Tick {
    /// Placeholder value a watch channel starts with; never delivered
    /// through `changed()`.
    pub fn initial() -> Self {
        Self {
            sequence: 0,
            fired_at: Utc::now(),
        }
    }

    /// Tick with the given sequence, fired now.
    pub fn new(sequence: u64) -> Self {
        Self {
            sequence,
            fired_at: Utc::now(),
        }
    }
}

struct ModeHandle {
    tick_tx: watch::Sender<Tick>,
    task: JoinHandle<()>,
}

/// Registry of scan modes and their tick tasks.
#[derive(Default)]
pub struct ScanScheduler {
    modes: DashMap<String, ModeHandle>,
    cancel: CancellationToken,
}

impl ScanScheduler {
    /// Create an empty scheduler.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a scan mode and start its tick task.
    pub fn register(&self, mode: ScanMode) -> Result<()> {
        use dashmap::mapref::entry::Entry;

        match self.modes.entry(mode.id.clone()) {
            Entry::Occupied(_) => Err(GatewayError::Config(format!(
                "duplicate scan mode '{}'",
                mode.id
            ))),
            Entry::Vacant(slot) => {
                let (tick_tx, _) = watch::channel(Tick::initial());
                let task = tokio::spawn(run_mode(
                    mode,
                    tick_tx.clone(),
                    self.cancel.child_token(),
                ));
                slot.insert(ModeHandle { tick_tx, task });
                Ok(())
            }
        }
    }

    /// Whether a scan mode is registered.
    pub fn contains(&self, scan_mode_id: &str) -> bool {
        self.modes.contains_key(scan_mode_id)
    }

    /// Subscribe to a scan mode's ticks.
    pub fn subscribe(&self, scan_mode_id: &str) -> Option<watch::Receiver<Tick>> {
        self.modes
            .get(scan_mode_id)
            .map(|handle| handle.tick_tx.subscribe())
    }

    /// Ids of all registered scan modes.
    pub fn scan_mode_ids(&self) -> Vec<String> {
        self.modes.iter().map(|e| e.key().clone()).collect()
    }

    /// Stop all tick tasks, waiting up to `timeout` for each.
    pub async fn shutdown(&self, timeout: Duration) {
        self.cancel.cancel();
        let ids = self.scan_mode_ids();
        for id in ids {
            if let Some((_, handle)) = self.modes.remove(&id) {
                if tokio::time::timeout(timeout, handle.task).await.is_err() {
                    tracing::warn!("Scan mode '{}' did not stop within {:?}", id, timeout);
                }
            }
        }
    }
}

impl std::fmt::Debug for ScanScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScanScheduler")
            .field("scan_modes", &self.scan_mode_ids())
            .finish()
    }
}

async fn run_mode(mode: ScanMode, tick_tx: watch::Sender<Tick>, cancel: CancellationToken) {
    tracing::info!("Scan mode '{}' started ({})", mode.id, mode.schedule);
    let mut sequence = 0u64;
    loop {
        // Recomputing from the current instant after each firing keeps a
        // slow consumer from accumulating missed ticks.
        let now = Utc::now();
        let next = match mode.schedule.next_after(now) {
            Some(next) => next,
            None => {
                tracing::warn!("Scan mode '{}' has no future firing, stopping", mode.id);
                break;
            }
        };
        let delay = (next - now).to_std().unwrap_or(Duration::ZERO);

        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = tokio::time::sleep(delay) => {}
        }

        sequence += 1;
        tick_tx.send_replace(Tick::new(sequence));
        tracing::debug!("Scan mode '{}' tick {}", mode.id, sequence);
    }
    tracing::info!("Scan mode '{}' stopped", mode.id);
}
