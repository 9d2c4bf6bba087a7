//! Embedded sled-backed queue store.
//!
//! One database per connector, two trees:
//!
//! * `entries` keyed by big-endian sequence number, so sled's key order
//!   is FIFO order and survives restarts.
//! * `watermarks` keyed by serialized [`HistoryKey`].
//!
//! Appends and watermark writes are flushed before returning; removals
//! are not, since redelivering an already-sent entry after a crash is
//! within at-least-once semantics.

use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::core::data::{CacheEntry, EntryPayload};
use crate::core::scan::HistoryKey;
use crate::store::traits::{encoded_size, QueueStore, StoreError};

const TREE_ENTRIES: &str = "entries";
const TREE_WATERMARKS: &str = "watermarks";

/// Cache given to sled itself, not the queue size bound.
const SLED_CACHE_CAPACITY: u64 = 64 * 1024 * 1024;

/// Durable queue store for one connector.
pub struct SledStore {
    db: sled::Db,
    entries: sled::Tree,
    watermarks: sled::Tree,
    next_sequence: AtomicU64,
    total_size: AtomicU64,
    entry_count: AtomicU64,
}

impl SledStore {
    /// Open (or create) the store at `path`.
    ///
    /// Scans existing entries to restore the sequence counter and
    /// occupancy totals; a queue that cannot be decoded fails the open
    /// rather than silently dropping data.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let db = sled::Config::new()
            .path(path.as_ref())
            .cache_capacity(SLED_CACHE_CAPACITY)
            .open()?;
        let entries = db.open_tree(TREE_ENTRIES)?;
        let watermarks = db.open_tree(TREE_WATERMARKS)?;

        let mut max_sequence = 0u64;
        let mut total_size = 0u64;
        let mut entry_count = 0u64;
        for item in entries.iter() {
            let (key, value) = item?;
            let sequence = decode_sequence(&key)?;
            let entry: CacheEntry = serde_json::from_slice(&value).map_err(|e| {
                StoreError::Corrupt(format!("entry {} is not decodable: {}", sequence, e))
            })?;
            max_sequence = max_sequence.max(sequence);
            total_size += entry.size_bytes;
            entry_count += 1;
        }

        Ok(Self {
            db,
            entries,
            watermarks,
            next_sequence: AtomicU64::new(max_sequence + 1),
            total_size: AtomicU64::new(total_size),
            entry_count: AtomicU64::new(entry_count),
        })
    }
}

fn decode_sequence(key: &[u8]) -> Result<u64, StoreError> {
    let bytes: [u8; 8] = key
        .try_into()
        .map_err(|_| StoreError::Corrupt(format!("entry key of {} bytes", key.len())))?;
    Ok(u64::from_be_bytes(bytes))
}

fn decode_entry(value: &[u8]) -> Result<CacheEntry, StoreError> {
    Ok(serde_json::from_slice(value)?)
}

fn watermark_key(key: &HistoryKey) -> Result<Vec<u8>, StoreError> {
    Ok(serde_json::to_vec(key)?)
}

#[async_trait]
impl QueueStore for SledStore {
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
        let bytes = serde_json::to_vec(&entry)?;
        self.entries.insert(sequence.to_be_bytes(), bytes)?;
        self.db.flush_async().await?;
        self.total_size.fetch_add(size_bytes, Ordering::SeqCst);
        self.entry_count.fetch_add(1, Ordering::SeqCst);
        Ok(entry)
    }

    async fn pending(&self, limit: usize) -> Result<Vec<CacheEntry>, StoreError> {
        let mut out = Vec::with_capacity(limit.min(64));
        for item in self.entries.iter().take(limit) {
            let (_, value) = item?;
            out.push(decode_entry(&value)?);
        }
        Ok(out)
    }

    async fn remove(&self, sequence: u64) -> Result<bool, StoreError> {
        match self.entries.remove(sequence.to_be_bytes())? {
            Some(value) => {
                let entry = decode_entry(&value)?;
                self.total_size.fetch_sub(entry.size_bytes, Ordering::SeqCst);
                self.entry_count.fetch_sub(1, Ordering::SeqCst);
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
        let bytes = serde_json::to_vec(&updated)?;
        let previous = self.entries.insert(updated.sequence.to_be_bytes(), bytes)?;
        self.db.flush_async().await?;

        match previous {
            Some(value) => {
                let old = decode_entry(&value)?;
                self.total_size.fetch_sub(old.size_bytes, Ordering::SeqCst);
            }
            None => {
                self.entry_count.fetch_add(1, Ordering::SeqCst);
            }
        }
        self.total_size.fetch_add(size_bytes, Ordering::SeqCst);
        Ok(updated)
    }

    async fn evict_oldest(&self) -> Result<Option<CacheEntry>, StoreError> {
        match self.entries.pop_min()? {
            Some((_, value)) => {
                let entry = decode_entry(&value)?;
                self.total_size.fetch_sub(entry.size_bytes, Ordering::SeqCst);
                self.entry_count.fetch_sub(1, Ordering::SeqCst);
                Ok(Some(entry))
            }
            None => Ok(None),
        }
    }

    fn total_size(&self) -> u64 {
        self.total_size.load(Ordering::SeqCst)
    }

    fn entry_count(&self) -> u64 {
        self.entry_count.load(Ordering::SeqCst)
    }

    async fn read_watermark(&self, key: &HistoryKey) -> Result<Option<DateTime<Utc>>, StoreError> {
        match self.watermarks.get(watermark_key(key)?)? {
            Some(value) => Ok(Some(serde_json::from_slice(&value)?)),
            None => Ok(None),
        }
    }

    async fn write_watermark(
        &self,
        key: &HistoryKey,
        instant: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let value = serde_json::to_vec(&instant)?;
        self.watermarks.insert(watermark_key(key)?, value)?;
        self.db.flush_async().await?;
        Ok(())
    }
}

impl std::fmt::Debug for SledStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SledStore")
            .field("entry_count", &self.entry_count())
            .field("total_size", &self.total_size())
            .finish()
    }
}
