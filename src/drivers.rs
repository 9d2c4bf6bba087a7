//! Built-in south and north drivers.

pub mod folder;
pub mod simulator;

pub use folder::{FolderConfig, FolderNorth, FolderParamsConfig};
pub use simulator::{SimulatorConfig, SimulatorParamsConfig, SimulatorSouth};
