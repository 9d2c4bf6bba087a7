//! In-memory queue store for tests and ephemeral gateways.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::core::data::{CacheEntry, EntryPayload};
use crate::core::scan::HistoryKey;
use crate::store::traits::{encoded_size, QueueStore, StoreError};

#[derive(Default)]
struct Inner {
    entries: BTreeMap<u64, CacheEntry>,
    watermarks: HashMap<HistoryKey, DateTime<Utc>>,
}

/// Queue store with no durability.
///
/// Same contract as the sled store minus crash survival. Nothing here
/// can fail, but the methods keep the `Result` shape of the trait.
pub struct MemoryStore {
    inner: Mutex<Inner>,
    next_sequence: AtomicU64,
    total_size: AtomicU64,
}

impl MemoryStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
            next_sequence: AtomicU64::new(1),
            total_size: AtomicU64::new(0),
        }
    }

    fn locked(&self) -> std::sync::MutexGuard<'_, Inner> {
        // Nothing panics while holding this lock.
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl QueueStore for MemoryStore {
    async fn append(&self, payload: EntryPayload) -> Result<CacheEntry, StoreError> {
        let size_bytes = encoded_size(&payload)?;
        let sequence = self.next_sequence.fetch_add(1, Ordering::SeqCst);
        let entry = CacheEntry {
            sequence,
            enqueued_at: Utc::now(),
            retry_count: 0,
            size_bytes,
            payload,
        };
        self.locked().entries.insert(sequence, entry.clone());
        self.total_size.fetch_add(size_bytes, Ordering::SeqCst);
        Ok(entry)
    }

    async fn pending(&self, limit: usize) -> Result<Vec<CacheEntry>, StoreError> {
        Ok(self.locked().entries.values().take(limit).cloned().collect())
    }

    async fn remove(&self, sequence: u64) -> Result<bool, StoreError> {
        match self.locked().entries.remove(&sequence) {
            Some(entry) => {
                self.total_size.fetch_sub(entry.size_bytes, Ordering::SeqCst);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn replace(&self, entry: &CacheEntry) -> Result<CacheEntry, StoreError> {
        let size_bytes = encoded_size(&entry.payload)?;
        let updated = CacheEntry {
            size_bytes,
            ..entry.clone()
        };
        let previous = self
            .locked()
            .entries
            .insert(updated.sequence, updated.clone());
        if let Some(old) = previous {
            self.total_size.fetch_sub(old.size_bytes, Ordering::SeqCst);
        }
        self.total_size.fetch_add(size_bytes, Ordering::SeqCst);
        Ok(updated)
    }

    async fn evict_oldest(&self) -> Result<Option<CacheEntry>, StoreError> {
        let mut inner = self.locked();
        match inner.entries.keys().next().copied() {
            Some(sequence) => {
                let entry = inner.entries.remove(&sequence);
                if let Some(e) = &entry {
                    self.total_size.fetch_sub(e.size_bytes, Ordering::SeqCst);
                }
                Ok(entry)
            }
            None => Ok(None),
        }
    }

    fn total_size(&self) -> u64 {
        self.total_size.load(Ordering::SeqCst)
    }

    fn entry_count(&self) -> u64 {
        self.locked().entries.len() as u64
    }

    async fn read_watermark(&self, key: &HistoryKey) -> Result<Option<DateTime<Utc>>, StoreError> {
        Ok(self.locked().watermarks.get(key).copied())
    }

    async fn write_watermark(
        &self,
        key: &HistoryKey,
        instant: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        self.locked().watermarks.insert(key.clone(), instant);
        Ok(())
    }
}

impl std::fmt::Debug for MemoryStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryStore")
            .field("entry_count", &self.entry_count())
            .field("total_size", &self.total_size())
            .finish()
    }
}
