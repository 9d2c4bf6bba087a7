//! Core data model: values, file references, and cache entries.
//!
//! Everything that flows through the gateway is one of two shapes:
//!
//! - [`Value`]: a timestamped sample for one point, produced by a south
//!   driver and consumed by a north driver.
//! - [`FileReference`]: a file staged into the cache directory, delivered
//!   as-is to a north driver.
//!
//! Both are wrapped into [`CacheEntry`] records by the durable queue, which
//! assigns the monotonic sequence id that defines delivery order.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::core::quality::Quality;

/// Scalar payload of a value.
///
/// Untagged to keep the serialized form natural:
/// `25.5`, `42`, `true`, `"RUNNING"`, `null`.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Scalar {
    /// Boolean state (breaker position, alarm flag).
    Bool(bool),

    /// Integer reading (counter, raw register).
    Integer(i64),

    /// Floating point reading (measurement).
    Float(f64),

    /// Text reading (status string, enumeration label).
    String(String),

    /// No value (placeholder for failed or missing reads).
    #[default]
    Null,
}

impl Scalar {
    /// Try to get the scalar as f64.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Self::Float(v) => Some(*v),
            Self::Integer(v) => Some(*v as f64),
            Self::Bool(v) => Some(if *v { 1.0 } else { 0.0 }),
            _ => None,
        }
    }

    /// Try to get the scalar as i64.
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Self::Integer(v) => Some(*v),
            Self::Bool(v) => Some(i64::from(*v)),
            _ => None,
        }
    }

    /// Try to get the scalar as bool.
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Self::Bool(v) => Some(*v),
            _ => None,
        }
    }

    /// Try to get the scalar as a string slice.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::String(v) => Some(v),
            _ => None,
        }
    }

    /// Check if this is the null scalar.
    #[inline]
    pub const fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }
}

impl From<f64> for Scalar {
    fn from(v: f64) -> Self {
        Self::Float(v)
    }
}

impl From<f32> for Scalar {
    fn from(v: f32) -> Self {
        Self::Float(f64::from(v))
    }
}

impl From<i64> for Scalar {
    fn from(v: i64) -> Self {
        Self::Integer(v)
    }
}

impl From<i32> for Scalar {
    fn from(v: i32) -> Self {
        Self::Integer(i64::from(v))
    }
}

impl From<u16> for Scalar {
    fn from(v: u16) -> Self {
        Self::Integer(i64::from(v))
    }
}

impl From<bool> for Scalar {
    fn from(v: bool) -> Self {
        Self::Bool(v)
    }
}

impl From<String> for Scalar {
    fn from(v: String) -> Self {
        Self::String(v)
    }
}

impl From<&str> for Scalar {
    fn from(v: &str) -> Self {
        Self::String(v.to_string())
    }
}

/// Payload carried by a [`Value`]: the scalar plus optional quality.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValuePayload {
    /// The sampled scalar.
    pub value: Scalar,

    /// Source-reported quality, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub quality: Option<Quality>,
}

/// A single timestamped sample for one point.
///
/// Immutable once created: a `Value` is produced by a south driver,
/// owned by the cache from enqueue to delivery, and removed after a
/// successful north send (or dropped by eviction).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Value {
    /// Identifier of the point this sample belongs to.
    pub point_id: String,

    /// Sample instant (serialized as ISO-8601 UTC).
    pub timestamp: DateTime<Utc>,

    /// Scalar payload plus optional quality.
    pub data: ValuePayload,
}

impl Value {
    /// Create a value without quality information.
    pub fn new(
        point_id: impl Into<String>,
        timestamp: DateTime<Utc>,
        value: impl Into<Scalar>,
    ) -> Self {
        Self {
            point_id: point_id.into(),
            timestamp,
            data: ValuePayload {
                value: value.into(),
                quality: None,
            },
        }
    }

    /// Attach a quality code.
    #[must_use]
    pub fn with_quality(mut self, quality: Quality) -> Self {
        self.data.quality = Some(quality);
        self
    }
}

/// A batch of values, in acquisition order.
///
/// This is the unit of ingestion: values enqueued together form one group
/// and are delivered together, subject only to the batching rules of the
/// caching policy.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ValueBatch {
    values: Vec<Value>,
}

impl ValueBatch {
    /// Create an empty batch.
    pub fn new() -> Self {
        Self { values: Vec::new() }
    }

    /// Create an empty batch with pre-allocated capacity.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            values: Vec::with_capacity(capacity),
        }
    }

    /// Create a batch from a vector of values.
    pub fn from_values(values: Vec<Value>) -> Self {
        Self { values }
    }

    /// Append a value.
    pub fn add(&mut self, value: Value) {
        self.values.push(value);
    }

    /// Number of values in the batch.
    pub fn len(&self) -> usize {
        self.values.len()
    }

    /// Check if the batch is empty.
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Merge another batch into this one, preserving order.
    pub fn merge(&mut self, other: ValueBatch) {
        self.values.extend(other.values);
    }

    /// Iterate over values.
    pub fn iter(&self) -> std::slice::Iter<'_, Value> {
        self.values.iter()
    }

    /// Latest sample instant in the batch, if any.
    ///
    /// The history engine advances watermarks to what was actually
    /// observed, never to the window end; this is where "observed"
    /// comes from when a driver does not report it explicitly.
    pub fn max_timestamp(&self) -> Option<DateTime<Utc>> {
        self.values.iter().map(|v| v.timestamp).max()
    }

    /// Consume the batch and return the underlying vector.
    pub fn into_vec(self) -> Vec<Value> {
        self.values
    }

    /// View the underlying slice.
    pub fn as_slice(&self) -> &[Value] {
        &self.values
    }
}

impl IntoIterator for ValueBatch {
    type Item = Value;
    type IntoIter = std::vec::IntoIter<Value>;

    fn into_iter(self) -> Self::IntoIter {
        self.values.into_iter()
    }
}

impl<'a> IntoIterator for &'a ValueBatch {
    type Item = &'a Value;
    type IntoIter = std::slice::Iter<'a, Value>;

    fn into_iter(self) -> Self::IntoIter {
        self.values.iter()
    }
}

impl FromIterator<Value> for ValueBatch {
    fn from_iter<T: IntoIterator<Item = Value>>(iter: T) -> Self {
        Self {
            values: iter.into_iter().collect(),
        }
    }
}

/// A file staged into the cache, waiting for delivery.
///
/// On staging, the original file stem gets a millisecond-timestamp suffix
/// so repeated drops of the same filename never collide in the cache
/// directory. The suffix is recorded so consumers can reconstruct the
/// original name when they need it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileReference {
    /// Location of the staged copy inside the cache directory.
    pub path: PathBuf,

    /// Suffix that was inserted before the extension when staging
    /// (e.g. `"-1631274400000"`).
    pub original_timestamp_suffix: String,
}

impl FileReference {
    /// Create a reference to an already staged file.
    pub fn new(path: impl Into<PathBuf>, original_timestamp_suffix: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            original_timestamp_suffix: original_timestamp_suffix.into(),
        }
    }

    /// Build the staged filename for `source` using `suffix`.
    ///
    /// `data.csv` with suffix `-1631274400000` becomes
    /// `data-1631274400000.csv`.
    pub fn staged_file_name(source: &Path, suffix: &str) -> String {
        let stem = source
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| "file".to_string());
        match source.extension() {
            Some(ext) => format!("{}{}.{}", stem, suffix, ext.to_string_lossy()),
            None => format!("{}{}", stem, suffix),
        }
    }

    /// File name as staged (and as delivered).
    pub fn file_name(&self) -> Option<&str> {
        self.path.file_name().and_then(|n| n.to_str())
    }

    /// Original file name with the timestamp suffix stripped.
    pub fn original_file_name(&self) -> Option<String> {
        let name = self.file_name()?;
        if self.original_timestamp_suffix.is_empty() {
            return Some(name.to_string());
        }
        Some(name.replacen(&self.original_timestamp_suffix, "", 1))
    }
}

// ============================================================================
// Cache entries
// ============================================================================

/// What a cache entry carries: a group of values or one staged file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum EntryPayload {
    /// A group of values enqueued together.
    Values { values: Vec<Value> },

    /// One staged file.
    File { file: FileReference },
}

impl EntryPayload {
    /// Number of values carried (0 for files).
    pub fn value_count(&self) -> usize {
        match self {
            Self::Values { values } => values.len(),
            Self::File { .. } => 0,
        }
    }

    /// Check if this payload is a file.
    pub const fn is_file(&self) -> bool {
        matches!(self, Self::File { .. })
    }
}

/// One record in the durable delivery queue.
///
/// The sequence id is assigned by the store, increases monotonically
/// (including across restarts) and defines FIFO delivery order. A failed
/// entry is retried in place: its sequence id never changes, so a retry
/// can never overtake older pending entries.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry {
    /// Monotonic sequence id; delivery order.
    pub sequence: u64,

    /// When the entry was appended to the queue.
    pub enqueued_at: DateTime<Utc>,

    /// Number of failed delivery attempts so far.
    pub retry_count: u32,

    /// Serialized payload size in bytes, used for `max_size` accounting.
    pub size_bytes: u64,

    /// The data itself.
    pub payload: EntryPayload,
}

impl CacheEntry {
    /// Number of values carried (0 for files).
    pub fn value_count(&self) -> usize {
        self.payload.value_count()
    }

    /// Check if this entry carries a file.
    pub const fn is_file(&self) -> bool {
        self.payload.is_file()
    }
}
