//! Connector driver factory.
//!
//! Resolves the `driver` name of a connector config into a boxed driver,
//! parsing the opaque `parameters` block with the driver's own config
//! type.

use crate::core::error::{GatewayError, Result};
use crate::core::traits::{NorthDriver, SouthDriver};
use crate::drivers::folder::{FolderNorth, FolderParamsConfig};
use crate::drivers::simulator::{SimulatorParamsConfig, SimulatorSouth};

use super::config::{NorthConnectorConfig, SouthConnectorConfig};

/// Create a south driver from configuration.
pub fn create_south(config: &SouthConnectorConfig) -> Result<Box<dyn SouthDriver>> {
    let driver = &config.driver;

    // Use eq_ignore_ascii_case to avoid String allocation from to_lowercase()
    if driver.eq_ignore_ascii_case("simulator") {
        return create_simulator(config);
    }

    Err(GatewayError::Config(format!(
        "unsupported south driver '{}' for connector '{}'",
        driver, config.id
    )))
}

/// Create a north driver from configuration.
pub fn create_north(config: &NorthConnectorConfig) -> Result<Box<dyn NorthDriver>> {
    let driver = &config.driver;

    if driver.eq_ignore_ascii_case("folder") {
        return create_folder(config);
    }

    Err(GatewayError::Config(format!(
        "unsupported north driver '{}' for connector '{}'",
        driver, config.id
    )))
}

// ============================================================================
// Driver-specific creators
// ============================================================================

fn create_simulator(config: &SouthConnectorConfig) -> Result<Box<dyn SouthDriver>> {
    // Parameters are entirely optional for the simulator.
    let params: SimulatorParamsConfig = if config.parameters.is_null() {
        SimulatorParamsConfig::default()
    } else {
        serde_json::from_value(config.parameters.clone())
            .map_err(|e| GatewayError::Config(format!("invalid simulator parameters: {}", e)))?
    };

    Ok(Box::new(SimulatorSouth::new(params.to_config()?)))
}

fn create_folder(config: &NorthConnectorConfig) -> Result<Box<dyn NorthDriver>> {
    let params: FolderParamsConfig = serde_json::from_value(config.parameters.clone())
        .map_err(|e| GatewayError::Config(format!("invalid folder parameters: {}", e)))?;

    Ok(Box::new(FolderNorth::new(params.to_config()?)))
}
