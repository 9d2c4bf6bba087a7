//! Driver metadata and the global driver registry.
//!
//! Drivers describe themselves so the CLI can list what is available and
//! emit example configuration without instantiating anything.

use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Parameter type for configuration options.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ParameterType {
    String,
    Integer,
    Boolean,
    Float,
    Object,
    Array,
}

/// Metadata for a single configuration parameter.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParameterMetadata {
    /// Internal parameter name (used in config).
    pub name: &'static str,
    /// Human-readable display name.
    pub display_name: &'static str,
    /// Description of the parameter.
    pub description: &'static str,
    /// Whether this parameter is required.
    pub required: bool,
    /// Default value if not specified.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub default_value: Option<Value>,
    /// Type of the parameter.
    pub param_type: ParameterType,
}

impl ParameterMetadata {
    /// Create a new required parameter.
    pub const fn required(
        name: &'static str,
        display_name: &'static str,
        description: &'static str,
        param_type: ParameterType,
    ) -> Self {
        Self {
            name,
            display_name,
            description,
            required: true,
            default_value: None,
            param_type,
        }
    }

    /// Create a new optional parameter with a default value.
    pub fn optional(
        name: &'static str,
        display_name: &'static str,
        description: &'static str,
        param_type: ParameterType,
        default_value: Value,
    ) -> Self {
        Self {
            name,
            display_name,
            description,
            required: false,
            default_value: Some(default_value),
            param_type,
        }
    }
}

/// Which side of the gateway a driver serves.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DriverKind {
    /// Device-side data source.
    South,
    /// Destination-side data sink.
    North,
}

impl std::fmt::Display for DriverKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::South => write!(f, "south"),
            Self::North => write!(f, "north"),
        }
    }
}

/// Metadata for a driver implementation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DriverMetadata {
    /// Internal driver name (used in config).
    pub name: &'static str,
    /// Human-readable display name.
    pub display_name: &'static str,
    /// Description of the driver.
    pub description: &'static str,
    /// Which side of the gateway this driver serves.
    pub kind: DriverKind,
    /// Whether the driver can answer history queries.
    pub supports_history: bool,
    /// Example `parameters` block as JSON.
    pub example_config: Value,
    /// Available configuration parameters.
    pub parameters: Vec<ParameterMetadata>,
}

/// Registry of all available drivers.
pub struct DriverRegistry {
    drivers: Vec<DriverMetadata>,
}

impl DriverRegistry {
    /// Create a new empty registry.
    pub fn new() -> Self {
        Self {
            drivers: Vec::new(),
        }
    }

    /// Register a driver.
    pub fn register(&mut self, driver: DriverMetadata) {
        self.drivers.push(driver);
    }

    /// Get all registered drivers.
    pub fn drivers(&self) -> &[DriverMetadata] {
        &self.drivers
    }

    /// Get a driver by name and side.
    pub fn get(&self, name: &str, kind: DriverKind) -> Option<&DriverMetadata> {
        self.drivers
            .iter()
            .find(|d| d.kind == kind && d.name.eq_ignore_ascii_case(name))
    }

    /// All device-side drivers.
    pub fn south_drivers(&self) -> impl Iterator<Item = &DriverMetadata> {
        self.drivers.iter().filter(|d| d.kind == DriverKind::South)
    }

    /// All destination-side drivers.
    pub fn north_drivers(&self) -> impl Iterator<Item = &DriverMetadata> {
        self.drivers.iter().filter(|d| d.kind == DriverKind::North)
    }
}

impl Default for DriverRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Trait for types that can provide their own metadata.
pub trait HasMetadata {
    /// Get the metadata for this type.
    fn metadata() -> DriverMetadata;
}

/// Build the global driver registry.
fn build_registry() -> DriverRegistry {
    use crate::drivers::folder::FolderNorth;
    use crate::drivers::simulator::SimulatorSouth;

    let mut registry = DriverRegistry::new();
    registry.register(SimulatorSouth::metadata());
    registry.register(FolderNorth::metadata());
    registry
}

/// Global driver registry instance.
static DRIVER_REGISTRY: Lazy<DriverRegistry> = Lazy::new(build_registry);

/// Get the global driver registry.
pub fn get_driver_registry() -> &'static DriverRegistry {
    &DRIVER_REGISTRY
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_registry_has_both_sides() {
        let registry = get_driver_registry();
        assert!(registry.south_drivers().count() >= 1);
        assert!(registry.north_drivers().count() >= 1);
    }

    #[test]
    fn test_get_is_kind_scoped() {
        let registry = get_driver_registry();
        assert!(registry.get("simulator", DriverKind::South).is_some());
        assert!(registry.get("SIMULATOR", DriverKind::South).is_some());
        assert!(registry.get("simulator", DriverKind::North).is_none());
    }
}
