//! Core abstractions shared by every part of the gateway.
//!
//! This module provides the data model, driver traits, scheduling types,
//! and error type that the rest of the crate builds on.

pub mod data;
pub mod error;
pub mod metadata;
pub mod metrics;
pub mod quality;
pub mod scan;
pub mod traits;

pub use data::*;
pub use error::{GatewayError, Result};
pub use metrics::{ConnectorMetrics, MetricsEvent, MetricsHub, MetricsSnapshot};
pub use quality::*;
pub use scan::*;
pub use traits::*;
