//! Store-and-forward cache between acquisition and delivery.

pub mod archive;
pub mod engine;
pub mod policy;

pub use archive::Archiver;
pub use engine::CacheEngine;
pub use policy::{ArchiveParamsConfig, ArchivePolicy, CachingPolicy, CachingPolicyParamsConfig};
