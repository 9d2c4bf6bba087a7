//! Folder north driver: delivers into a local directory.
//!
//! Values are appended to a JSON Lines file, one value per line; files
//! are copied in under their staged name. Useful as a demo sink and as
//! a drop folder for downstream pickup processes.
//!
//! # Example JSON
//! ```json
//! {
//!     "name": "drop_folder",
//!     "output_dir": "/var/lib/datagw/out",
//!     "values_file": "values.jsonl"
//! }
//! ```

use std::path::{Path, PathBuf};

use serde::Deserialize;
use tokio::io::AsyncWriteExt;

use crate::core::data::Value;
use crate::core::error::{GatewayError, Result};
use crate::core::metadata::{
    DriverKind, DriverMetadata, HasMetadata, ParameterMetadata, ParameterType,
};
use crate::core::traits::NorthDriver;
use async_trait::async_trait;

/// Folder driver configuration.
#[derive(Debug, Clone)]
pub struct FolderConfig {
    /// Driver instance name used in logs.
    pub name: String,

    /// Directory everything is delivered into.
    pub output_dir: PathBuf,

    /// Name of the JSON Lines file values are appended to.
    pub values_file: String,
}

impl FolderConfig {
    /// Create a configuration delivering into `output_dir`.
    pub fn new(output_dir: impl Into<PathBuf>) -> Self {
        Self {
            name: "folder".to_string(),
            output_dir: output_dir.into(),
            values_file: "values.jsonl".to_string(),
        }
    }
}

// ============================================================================
// Strongly-typed parameter config for JSON deserialization
// ============================================================================

/// Folder parameters configuration (deserialized from `parameters`).
#[derive(Debug, Clone, Deserialize)]
pub struct FolderParamsConfig {
    /// Driver instance name.
    #[serde(default = "default_folder_name")]
    pub name: String,

    /// Directory everything is delivered into.
    pub output_dir: String,

    /// Name of the JSON Lines file values are appended to.
    #[serde(default = "default_values_file")]
    pub values_file: String,
}

fn default_folder_name() -> String {
    "folder".to_string()
}

fn default_values_file() -> String {
    "values.jsonl".to_string()
}

impl FolderParamsConfig {
    /// Convert to FolderConfig.
    pub fn to_config(&self) -> Result<FolderConfig> {
        if self.output_dir.is_empty() {
            return Err(GatewayError::Config(
                "output_dir must not be empty".to_string(),
            ));
        }
        Ok(FolderConfig {
            name: self.name.clone(),
            output_dir: PathBuf::from(&self.output_dir),
            values_file: self.values_file.clone(),
        })
    }
}

/// Directory sink.
pub struct FolderNorth {
    config: FolderConfig,
    connected: bool,
}

impl FolderNorth {
    /// Create a disconnected folder driver.
    pub fn new(config: FolderConfig) -> Self {
        Self {
            config,
            connected: false,
        }
    }

    fn ensure_connected(&self) -> Result<()> {
        if self.connected {
            Ok(())
        } else {
            Err(GatewayError::NotConnected)
        }
    }

    fn values_path(&self) -> PathBuf {
        self.config.output_dir.join(&self.config.values_file)
    }
}

#[async_trait]
impl NorthDriver for FolderNorth {
    fn driver_name(&self) -> &'static str {
        "folder"
    }

    async fn connect(&mut self) -> Result<()> {
        tokio::fs::create_dir_all(&self.config.output_dir).await?;
        self.connected = true;
        tracing::info!(
            "Folder '{}' delivering into {}",
            self.config.name,
            self.config.output_dir.display()
        );
        Ok(())
    }

    async fn disconnect(&mut self) -> Result<()> {
        self.connected = false;
        Ok(())
    }

    async fn test_connection(&self) -> Result<()> {
        tokio::fs::create_dir_all(&self.config.output_dir).await?;
        Ok(())
    }

    async fn handle_values(&mut self, values: &[Value]) -> Result<()> {
        self.ensure_connected()?;

        let mut lines = Vec::with_capacity(values.len() * 64);
        for value in values {
            serde_json::to_writer(&mut lines, value)
                .map_err(|e| GatewayError::Driver(format!("value serialization failed: {}", e)))?;
            lines.push(b'\n');
        }

        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.values_path())
            .await?;
        file.write_all(&lines).await?;
        file.flush().await?;
        Ok(())
    }

    async fn handle_file(&mut self, path: &Path) -> Result<()> {
        self.ensure_connected()?;
        let file_name = path
            .file_name()
            .ok_or_else(|| GatewayError::Driver(format!("no file name in {}", path.display())))?;
        let target = self.config.output_dir.join(file_name);
        tokio::fs::copy(path, &target).await?;
        Ok(())
    }
}

impl HasMetadata for FolderNorth {
    fn metadata() -> DriverMetadata {
        DriverMetadata {
            name: "folder",
            display_name: "Folder",
            description: "Delivers values as JSON Lines and files as copies into a local directory.",
            kind: DriverKind::North,
            supports_history: false,
            example_config: serde_json::json!({
                "name": "drop_folder",
                "output_dir": "/var/lib/datagw/out",
                "values_file": "values.jsonl"
            }),
            parameters: vec![
                ParameterMetadata::required(
                    "output_dir",
                    "Output Directory",
                    "Directory everything is delivered into",
                    ParameterType::String,
                ),
                ParameterMetadata::optional(
                    "name",
                    "Name",
                    "Driver instance name used in logs",
                    ParameterType::String,
                    serde_json::json!("folder"),
                ),
                ParameterMetadata::optional(
                    "values_file",
                    "Values File",
                    "Name of the JSON Lines file values are appended to",
                    ParameterType::String,
                    serde_json::json!("values.jsonl"),
                ),
            ],
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use tempfile::TempDir;

    fn value(id: &str, v: f64) -> Value {
        Value::new(id, Utc.timestamp_opt(1_000, 0).unwrap(), v)
    }

    async fn connected(dir: &TempDir) -> FolderNorth {
        let mut north = FolderNorth::new(FolderConfig::new(dir.path().join("out")));
        north.connect().await.unwrap();
        north
    }

    #[tokio::test]
    async fn test_connect_creates_output_dir() {
        let dir = TempDir::new().unwrap();
        let north = connected(&dir).await;
        assert!(north.config.output_dir.is_dir());
    }

    #[tokio::test]
    async fn test_values_append_as_json_lines() {
        let dir = TempDir::new().unwrap();
        let mut north = connected(&dir).await;

        north
            .handle_values(&[value("p1", 1.0), value("p2", 2.0)])
            .await
            .unwrap();
        north.handle_values(&[value("p3", 3.0)]).await.unwrap();

        let text = std::fs::read_to_string(north.values_path()).unwrap();
        let parsed: Vec<Value> = text
            .lines()
            .map(|line| serde_json::from_str(line).unwrap())
            .collect();
        assert_eq!(parsed.len(), 3);
        assert_eq!(parsed[0].point_id, "p1");
        assert_eq!(parsed[2].point_id, "p3");
    }

    #[tokio::test]
    async fn test_delivery_requires_connection() {
        let dir = TempDir::new().unwrap();
        let mut north = FolderNorth::new(FolderConfig::new(dir.path().join("out")));
        let err = north.handle_values(&[value("p1", 1.0)]).await;
        assert!(matches!(err, Err(GatewayError::NotConnected)));
    }

    #[tokio::test]
    async fn test_file_copied_under_staged_name() {
        let dir = TempDir::new().unwrap();
        let mut north = connected(&dir).await;

        let staged = dir.path().join("report-1700000000000.csv");
        std::fs::write(&staged, "a,b\n1,2\n").unwrap();

        north.handle_file(&staged).await.unwrap();

        let target = north.config.output_dir.join("report-1700000000000.csv");
        assert_eq!(std::fs::read_to_string(target).unwrap(), "a,b\n1,2\n");
        // The staged source is the cache's to clean up, not ours.
        assert!(staged.exists());
    }

    #[test]
    fn test_params_config_requires_output_dir() {
        let missing: std::result::Result<FolderParamsConfig, _> =
            serde_json::from_value(serde_json::json!({}));
        assert!(missing.is_err());

        let empty: FolderParamsConfig =
            serde_json::from_value(serde_json::json!({"output_dir": ""})).unwrap();
        assert!(empty.to_config().is_err());
    }
}
