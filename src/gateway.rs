//! Gateway assembly: configuration, driver factory, and runtime wiring.

pub mod config;
pub mod factory;
pub mod runtime;

pub use config::{GatewayConfig, NorthConnectorConfig, ScanModeDef, SouthConnectorConfig};
pub use runtime::{Gateway, IngestRouter};
