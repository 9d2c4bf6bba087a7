//! Durable queue storage for the store-and-forward cache.
//!
//! The delivery engine talks to the [`QueueStore`] trait; production
//! gateways use [`SledStore`], tests mostly use [`MemoryStore`].

pub mod memory;
pub mod sled;
pub mod traits;

pub use memory::MemoryStore;
pub use sled::SledStore;
pub use traits::{encoded_size, QueueStore, StoreError};
