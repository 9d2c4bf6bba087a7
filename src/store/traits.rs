//! QueueStore trait and store errors.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::core::data::{CacheEntry, EntryPayload};
use crate::core::scan::HistoryKey;

/// Errors from the storage layer.
///
/// Kept separate from [`crate::core::GatewayError`] because storage
/// faults follow a different rule than delivery faults: they are
/// surfaced to the producer immediately and never retried by the cache.
#[derive(Error, Debug)]
pub enum StoreError {
    /// Underlying database error.
    #[error("database error: {0}")]
    Db(#[from] sled::Error),

    /// Filesystem error.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Entry could not be encoded or decoded.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Stored bytes that no known schema explains.
    #[error("corrupt store: {0}")]
    Corrupt(String),
}

/// Serialized size of a payload, the unit the size bound is enforced in.
pub fn encoded_size(payload: &EntryPayload) -> Result<u64, StoreError> {
    Ok(serde_json::to_vec(payload)?.len() as u64)
}

/// Trait for durable FIFO queue backends.
///
/// This trait abstracts the cache storage, allowing the delivery engine
/// to work against an embedded database in production and an in-memory
/// map in tests. Sequence numbers are assigned by the store, increase
/// monotonically, and are never reused, so FIFO order survives restarts.
#[async_trait]
pub trait QueueStore: Send + Sync {
    /// Append a payload, assigning the next sequence number.
    ///
    /// The entry is durable once this returns.
    async fn append(&self, payload: EntryPayload) -> Result<CacheEntry, StoreError>;

    /// Up to `limit` queued entries in sequence order, oldest first.
    async fn pending(&self, limit: usize) -> Result<Vec<CacheEntry>, StoreError>;

    /// Remove a delivered entry.
    ///
    /// Returns whether the entry was still present. Eviction can race a
    /// completed delivery; the boolean lets the caller keep occupancy
    /// counters exact.
    async fn remove(&self, sequence: u64) -> Result<bool, StoreError>;

    /// Overwrite an entry in place, keeping its sequence number.
    ///
    /// Used for retry accounting and for requeueing the unsent tail of a
    /// partially delivered batch. Returns the entry with its recomputed
    /// size.
    async fn replace(&self, entry: &CacheEntry) -> Result<CacheEntry, StoreError>;

    /// Remove and return the oldest entry, if any.
    async fn evict_oldest(&self) -> Result<Option<CacheEntry>, StoreError>;

    /// Total serialized bytes currently queued.
    fn total_size(&self) -> u64;

    /// Number of entries currently queued.
    fn entry_count(&self) -> u64;

    /// Read a history watermark.
    async fn read_watermark(&self, key: &HistoryKey) -> Result<Option<DateTime<Utc>>, StoreError>;

    /// Persist a history watermark.
    ///
    /// Durable once this returns; the history runner relies on that
    /// before it moves into the next window.
    async fn write_watermark(&self, key: &HistoryKey, instant: DateTime<Utc>)
        -> Result<(), StoreError>;
}
