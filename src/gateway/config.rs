//! Gateway configuration, loaded from TOML.
//!
//! One file describes the whole gateway: the shared scan modes, the
//! south connectors that acquire data, and the north connectors that
//! deliver it. Driver-specific `parameters` blocks stay opaque here and
//! are interpreted by the factory.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::cache::{ArchiveParamsConfig, CachingPolicyParamsConfig};
use crate::core::error::{GatewayError, Result};
use crate::core::scan::{HistorySettingsConfig, Item, ScanMode, Schedule};

/// Top-level gateway configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct GatewayConfig {
    /// Gateway-wide settings.
    #[serde(default)]
    pub gateway: GatewaySection,

    /// Shared scan modes, referenced by id from both sides.
    #[serde(default)]
    pub scan_modes: Vec<ScanModeDef>,

    /// Device-side connectors.
    #[serde(default)]
    pub south: Vec<SouthConnectorConfig>,

    /// Destination-side connectors.
    #[serde(default)]
    pub north: Vec<NorthConnectorConfig>,
}

/// The `[gateway]` section.
#[derive(Debug, Clone, Deserialize)]
pub struct GatewaySection {
    /// Gateway instance name used in logs.
    #[serde(default = "default_gateway_name")]
    pub name: String,

    /// Root directory for queues, staged files, and archives.
    #[serde(default = "default_cache_dir")]
    pub cache_dir: PathBuf,

    /// How long shutdown waits for tasks before giving up.
    #[serde(default = "default_shutdown_timeout_ms")]
    pub shutdown_timeout_ms: u64,
}

fn default_gateway_name() -> String {
    "datagw".to_string()
}

fn default_cache_dir() -> PathBuf {
    PathBuf::from("cache")
}

fn default_shutdown_timeout_ms() -> u64 {
    5_000
}

impl Default for GatewaySection {
    fn default() -> Self {
        Self {
            name: default_gateway_name(),
            cache_dir: default_cache_dir(),
            shutdown_timeout_ms: default_shutdown_timeout_ms(),
        }
    }
}

impl GatewaySection {
    /// Shutdown grace period as a [`Duration`].
    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_millis(self.shutdown_timeout_ms)
    }
}

/// One `[[scan_modes]]` entry. Exactly one of `interval_ms` or `cron`
/// must be set.
#[derive(Debug, Clone, Deserialize)]
pub struct ScanModeDef {
    /// Scan mode id, unique within the gateway.
    pub id: String,

    /// Fixed firing interval in milliseconds.
    #[serde(default)]
    pub interval_ms: Option<u64>,

    /// Cron expression (seconds-resolution, UTC).
    #[serde(default)]
    pub cron: Option<String>,
}

impl ScanModeDef {
    /// Build the runtime scan mode.
    pub fn to_scan_mode(&self) -> Result<ScanMode> {
        let schedule = match (self.interval_ms, &self.cron) {
            (Some(ms), None) => Schedule::interval(Duration::from_millis(ms)),
            (None, Some(expr)) => Schedule::cron(expr)?,
            _ => {
                return Err(GatewayError::Config(format!(
                    "scan mode '{}' must set exactly one of interval_ms or cron",
                    self.id
                )));
            }
        };
        Ok(ScanMode::new(&self.id, schedule))
    }
}

/// One `[[south]]` connector.
#[derive(Debug, Clone, Deserialize)]
pub struct SouthConnectorConfig {
    /// Connector id, unique within the gateway.
    pub id: String,

    /// Display name; defaults to the id.
    #[serde(default)]
    pub name: Option<String>,

    /// South driver name, resolved by the factory.
    pub driver: String,

    /// Disabled connectors are skipped entirely.
    #[serde(default = "default_enabled")]
    pub enabled: bool,

    /// Delay between reconnect attempts, in milliseconds.
    #[serde(default = "default_retry_interval_ms")]
    pub retry_interval_ms: u64,

    /// When present, ticks run windowed history queries instead of polls.
    #[serde(default)]
    pub history: Option<HistorySettingsConfig>,

    /// Driver-specific parameters, passed through verbatim.
    #[serde(default)]
    pub parameters: serde_json::Value,

    /// Items this connector acquires.
    #[serde(default)]
    pub items: Vec<Item>,
}

impl SouthConnectorConfig {
    /// Reconnect delay as a [`Duration`].
    pub fn retry_interval(&self) -> Duration {
        Duration::from_millis(self.retry_interval_ms)
    }
}

/// One `[[north]]` connector.
#[derive(Debug, Clone, Deserialize)]
pub struct NorthConnectorConfig {
    /// Connector id, unique within the gateway.
    pub id: String,

    /// Display name; defaults to the id.
    #[serde(default)]
    pub name: Option<String>,

    /// North driver name, resolved by the factory.
    pub driver: String,

    /// Disabled connectors are skipped entirely.
    #[serde(default = "default_enabled")]
    pub enabled: bool,

    /// Delay between reconnect attempts, in milliseconds.
    #[serde(default = "default_retry_interval_ms")]
    pub retry_interval_ms: u64,

    /// Store-and-forward behavior of this connector's cache.
    pub caching: CachingPolicyParamsConfig,

    /// What happens to staged files after delivery.
    #[serde(default)]
    pub archive: ArchiveParamsConfig,

    /// Driver-specific parameters, passed through verbatim.
    #[serde(default)]
    pub parameters: serde_json::Value,
}

impl NorthConnectorConfig {
    /// Reconnect delay as a [`Duration`].
    pub fn retry_interval(&self) -> Duration {
        Duration::from_millis(self.retry_interval_ms)
    }
}

fn default_enabled() -> bool {
    true
}

fn default_retry_interval_ms() -> u64 {
    5_000
}

impl GatewayConfig {
    /// Parse and validate a TOML document.
    pub fn from_toml_str(input: &str) -> Result<Self> {
        let config: Self = toml::from_str(input)
            .map_err(|e| GatewayError::Config(format!("invalid configuration: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Load and validate a TOML file.
    pub async fn load(path: &Path) -> Result<Self> {
        let input = tokio::fs::read_to_string(path).await.map_err(|e| {
            GatewayError::Config(format!("cannot read {}: {}", path.display(), e))
        })?;
        Self::from_toml_str(&input)
    }

    /// Check cross-references and uniqueness.
    ///
    /// Driver names and parameters are not checked here; the factory
    /// reports those when connectors are built.
    pub fn validate(&self) -> Result<()> {
        let mut mode_ids = std::collections::HashSet::new();
        for def in &self.scan_modes {
            def.to_scan_mode()?;
            if !mode_ids.insert(def.id.as_str()) {
                return Err(GatewayError::Config(format!(
                    "duplicate scan mode id '{}'",
                    def.id
                )));
            }
        }

        let mut connector_ids = std::collections::HashSet::new();
        for south in &self.south {
            if !connector_ids.insert(south.id.as_str()) {
                return Err(GatewayError::Config(format!(
                    "duplicate connector id '{}'",
                    south.id
                )));
            }
            let mut item_ids = std::collections::HashSet::new();
            for item in &south.items {
                if !item_ids.insert(item.id.as_str()) {
                    return Err(GatewayError::Config(format!(
                        "duplicate item id '{}' in connector '{}'",
                        item.id, south.id
                    )));
                }
                if item.enabled && !mode_ids.contains(item.scan_mode_id.as_str()) {
                    return Err(GatewayError::Config(format!(
                        "item '{}' of connector '{}' references unknown scan mode '{}'",
                        item.id, south.id, item.scan_mode_id
                    )));
                }
            }
            if let Some(history) = &south.history {
                history.to_settings()?;
            }
        }

        for north in &self.north {
            if !connector_ids.insert(north.id.as_str()) {
                return Err(GatewayError::Config(format!(
                    "duplicate connector id '{}'",
                    north.id
                )));
            }
            north.caching.to_policy()?;
            if !mode_ids.contains(north.caching.scan_mode_id.as_str()) {
                return Err(GatewayError::Config(format!(
                    "connector '{}' references unknown scan mode '{}'",
                    north.id, north.caching.scan_mode_id
                )));
            }
        }
        Ok(())
    }

    /// A complete, runnable example configuration.
    pub fn example_toml() -> &'static str {
        EXAMPLE_CONFIG
    }
}

const EXAMPLE_CONFIG: &str = r#"# Example gateway configuration.
#
# A simulated source feeds a folder sink through the durable cache.

[gateway]
name = "demo"
cache_dir = "cache"
shutdown_timeout_ms = 5000

[[scan_modes]]
id = "fast"
interval_ms = 10000

[[scan_modes]]
id = "hourly"
cron = "0 0 * * * *"

[[south]]
id = "sim1"
name = "Plant simulator"
driver = "simulator"
parameters = { name = "plant_sim", sample_interval_ms = 10000, amplitude = 100.0 }

[[south.items]]
id = "pump1"
scan_mode_id = "fast"

[[south.items]]
id = "pump2"
scan_mode_id = "fast"
settings = { amplitude = 10.0, offset = 50.0 }

[[north]]
id = "drop1"
name = "Drop folder"
driver = "folder"
parameters = { output_dir = "out" }

[north.caching]
scan_mode_id = "fast"
group_count = 1000
max_send_count = 10000
max_size = 104857600

[north.archive]
enabled = false
"#;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_example_config_parses() {
        let config = GatewayConfig::from_toml_str(GatewayConfig::example_toml()).unwrap();
        assert_eq!(config.gateway.name, "demo");
        assert_eq!(config.scan_modes.len(), 2);
        assert_eq!(config.south.len(), 1);
        assert_eq!(config.north.len(), 1);

        let south = &config.south[0];
        assert!(south.enabled);
        assert_eq!(south.items.len(), 2);
        assert_eq!(south.items[1].settings["offset"], 50.0);

        let north = &config.north[0];
        assert_eq!(north.caching.scan_mode_id, "fast");
        assert_eq!(north.parameters["output_dir"], "out");
    }

    #[test]
    fn test_minimal_config() {
        let config = GatewayConfig::from_toml_str("").unwrap();
        assert_eq!(config.gateway.name, "datagw");
        assert_eq!(config.gateway.cache_dir, PathBuf::from("cache"));
        assert!(config.south.is_empty());
    }

    #[test]
    fn test_scan_mode_needs_exactly_one_schedule() {
        let both = GatewayConfig::from_toml_str(
            r#"
            [[scan_modes]]
            id = "fast"
            interval_ms = 1000
            cron = "* * * * * *"
            "#,
        );
        assert!(both.is_err());

        let neither = GatewayConfig::from_toml_str(
            r#"
            [[scan_modes]]
            id = "fast"
            "#,
        );
        assert!(neither.is_err());
    }

    #[test]
    fn test_duplicate_ids_rejected() {
        let dup_mode = GatewayConfig::from_toml_str(
            r#"
            [[scan_modes]]
            id = "fast"
            interval_ms = 1000

            [[scan_modes]]
            id = "fast"
            interval_ms = 2000
            "#,
        );
        assert!(dup_mode.unwrap_err().to_string().contains("duplicate"));

        let dup_connector = GatewayConfig::from_toml_str(
            r#"
            [[scan_modes]]
            id = "fast"
            interval_ms = 1000

            [[south]]
            id = "c1"
            driver = "simulator"

            [[north]]
            id = "c1"
            driver = "folder"
            caching = { scan_mode_id = "fast" }
            "#,
        );
        assert!(dup_connector.unwrap_err().to_string().contains("duplicate"));
    }

    #[test]
    fn test_unknown_scan_mode_reference_rejected() {
        let err = GatewayConfig::from_toml_str(
            r#"
            [[scan_modes]]
            id = "fast"
            interval_ms = 1000

            [[north]]
            id = "n1"
            driver = "folder"
            caching = { scan_mode_id = "nope" }
            "#,
        )
        .unwrap_err();
        assert!(err.to_string().contains("unknown scan mode 'nope'"));

        let err = GatewayConfig::from_toml_str(
            r#"
            [[scan_modes]]
            id = "fast"
            interval_ms = 1000

            [[south]]
            id = "s1"
            driver = "simulator"
            [[south.items]]
            id = "p1"
            scan_mode_id = "nope"
            "#,
        )
        .unwrap_err();
        assert!(err.to_string().contains("unknown scan mode 'nope'"));
    }

    #[test]
    fn test_disabled_item_may_reference_anything() {
        let config = GatewayConfig::from_toml_str(
            r#"
            [[south]]
            id = "s1"
            driver = "simulator"
            [[south.items]]
            id = "p1"
            scan_mode_id = "gone"
            enabled = false
            "#,
        )
        .unwrap();
        assert!(!config.south[0].items[0].enabled);
    }

    #[test]
    fn test_history_section_parses() {
        let config = GatewayConfig::from_toml_str(
            r#"
            [[scan_modes]]
            id = "hourly"
            cron = "0 0 * * * *"

            [[south]]
            id = "s1"
            driver = "simulator"
            [south.history]
            overlap_ms = 1000
            max_read_interval_s = 7200
            start_instant = "2024-01-01T00:00:00Z"
            [[south.items]]
            id = "p1"
            scan_mode_id = "hourly"
            "#,
        )
        .unwrap();
        let history = config.south[0].history.as_ref().unwrap();
        assert_eq!(history.overlap_ms, 1000);
        assert!(history.start_instant.is_some());
    }
}
