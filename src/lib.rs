//! # Industrial Data Gateway (datagw)
//!
//! A store-and-forward gateway runtime for industrial data: south
//! connectors acquire timestamped values and files from devices, a
//! durable cache absorbs destination outages, and north connectors
//! deliver in acquisition order.
//!
//! ## Features
//!
//! - **Durable store-and-forward**: every value and file is persisted
//!   before delivery and survives restarts; delivery is at-least-once,
//!   in first-in-first-out order
//! - **Scan modes**: interval or cron schedules shared between
//!   acquisition polling and delivery flushing
//! - **Resumable history**: windowed backlog queries with persisted
//!   watermarks that only advance to what was actually observed
//! - **Bounded caches**: size-capped queues with oldest-first eviction
//!   and optional archiving of delivered files
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use datagw::gateway::{Gateway, GatewayConfig};
//!
//! let config = GatewayConfig::load(Path::new("config.toml")).await?;
//! let gateway = Gateway::from_config(config)?;
//!
//! gateway.start().await?;
//! tokio::signal::ctrl_c().await?;
//! gateway.stop().await;
//! ```
//!
//! ## Built-in Drivers
//!
//! | Driver | Side | Purpose |
//! |--------|------|---------|
//! | `simulator` | south | Deterministic signal source with history support |
//! | `folder` | north | JSON Lines and file drop into a local directory |
//!
//! Custom drivers implement [`core::traits::SouthDriver`] or
//! [`core::traits::NorthDriver`] and plug into the same runtime.

pub mod cache;
pub mod core;
pub mod drivers;
pub mod gateway;
pub mod lifecycle;
pub mod scan;
pub mod store;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::core::{
        data::*,
        error::{GatewayError, Result},
        quality::*,
        scan::*,
        traits::*,
    };
    pub use crate::store::{MemoryStore, QueueStore, SledStore};
}

// Re-export core types at crate root for convenience
pub use crate::core::data::{CacheEntry, EntryPayload, FileReference, Scalar, Value, ValueBatch};
pub use crate::core::error::{GatewayError, Result};
pub use crate::core::quality::Quality;
pub use crate::core::traits::{ConnectionState, Ingestor, NorthDriver, SouthDriver};

// Re-export the assembled runtime
pub use crate::gateway::{Gateway, GatewayConfig};
