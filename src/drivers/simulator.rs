//! Simulated south driver for demos and tests.
//!
//! The signal is a pure function of the sample instant and the item id,
//! so a history query over `[start, end)` reproduces exactly the values
//! a live poll would have captured at those instants. No state survives
//! a reconnect because none is needed.
//!
//! # Example JSON
//! ```json
//! {
//!     "name": "plant_sim",
//!     "sample_interval_ms": 10000,
//!     "amplitude": 100.0
//! }
//! ```

use chrono::{DateTime, TimeZone, Utc};
use serde::Deserialize;

use crate::core::data::{Value, ValueBatch};
use crate::core::error::{GatewayError, Result};
use crate::core::metadata::{
    DriverKind, DriverMetadata, HasMetadata, ParameterMetadata, ParameterType,
};
use crate::core::scan::Item;
use crate::core::traits::{HistoryPage, SouthDriver};
use async_trait::async_trait;

/// Hard cap on values generated by one history query. Queries over
/// windows with more sample instants are truncated and report the last
/// emitted instant so the caller resumes from there.
const MAX_HISTORY_SAMPLES: usize = 10_000;

/// One signal cycle per hour.
const CYCLE_SECONDS: f64 = 3600.0;

/// Simulator configuration.
#[derive(Debug, Clone)]
pub struct SimulatorConfig {
    /// Driver instance name used in logs.
    pub name: String,

    /// Spacing of the simulated sample grid, in milliseconds.
    pub sample_interval_ms: u64,

    /// Peak amplitude of the generated signal.
    pub amplitude: f64,
}

impl Default for SimulatorConfig {
    fn default() -> Self {
        Self {
            name: "simulator".to_string(),
            sample_interval_ms: 10_000,
            amplitude: 100.0,
        }
    }
}

impl SimulatorConfig {
    /// Create a configuration with the default signal shape.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }
}

// ============================================================================
// Strongly-typed parameter config for JSON deserialization
// ============================================================================

/// Simulator parameters configuration (deserialized from `parameters`).
#[derive(Debug, Clone, Deserialize)]
pub struct SimulatorParamsConfig {
    /// Driver instance name.
    #[serde(default = "default_sim_name")]
    pub name: String,

    /// Spacing of the simulated sample grid, in milliseconds.
    #[serde(default = "default_sample_interval_ms")]
    pub sample_interval_ms: u64,

    /// Peak amplitude of the generated signal.
    #[serde(default = "default_amplitude")]
    pub amplitude: f64,
}

fn default_sim_name() -> String {
    "simulator".to_string()
}

fn default_sample_interval_ms() -> u64 {
    10_000
}

fn default_amplitude() -> f64 {
    100.0
}

impl Default for SimulatorParamsConfig {
    fn default() -> Self {
        Self {
            name: default_sim_name(),
            sample_interval_ms: default_sample_interval_ms(),
            amplitude: default_amplitude(),
        }
    }
}

impl SimulatorParamsConfig {
    /// Convert to SimulatorConfig.
    pub fn to_config(&self) -> Result<SimulatorConfig> {
        if self.sample_interval_ms == 0 {
            return Err(GatewayError::Config(
                "sample_interval_ms must be at least 1".to_string(),
            ));
        }
        Ok(SimulatorConfig {
            name: self.name.clone(),
            sample_interval_ms: self.sample_interval_ms,
            amplitude: self.amplitude,
        })
    }
}

/// Per-item overrides, read from the item `settings` blob.
#[derive(Debug, Clone, Default, Deserialize)]
struct SimItemSettings {
    /// Overrides the driver-level amplitude for this item.
    #[serde(default)]
    amplitude: Option<f64>,

    /// Constant added to every sample of this item.
    #[serde(default)]
    offset: f64,
}

impl SimItemSettings {
    fn for_item(item: &Item) -> Self {
        if item.settings.is_null() {
            return Self::default();
        }
        serde_json::from_value(item.settings.clone()).unwrap_or_else(|e| {
            tracing::warn!(
                "Item '{}' has invalid simulator settings ({}), using defaults",
                item.id,
                e
            );
            Self::default()
        })
    }
}

/// Deterministic sine-wave source.
pub struct SimulatorSouth {
    config: SimulatorConfig,
    connected: bool,
}

impl SimulatorSouth {
    /// Create a disconnected simulator.
    pub fn new(config: SimulatorConfig) -> Self {
        Self {
            config,
            connected: false,
        }
    }

    /// Phase offset derived from the item id, so co-located items do not
    /// produce identical traces.
    fn phase(item_id: &str) -> f64 {
        let hash = item_id
            .bytes()
            .fold(0u64, |h, b| h.wrapping_mul(31).wrapping_add(u64::from(b)));
        (hash % 1_000) as f64 / 1_000.0 * std::f64::consts::TAU
    }

    fn sample(&self, item: &Item, settings: &SimItemSettings, at: DateTime<Utc>) -> Value {
        let t = at.timestamp_millis() as f64 / 1_000.0;
        let amplitude = settings.amplitude.unwrap_or(self.config.amplitude);
        let angle = t / CYCLE_SECONDS * std::f64::consts::TAU + Self::phase(&item.id);
        Value::new(&item.id, at, settings.offset + amplitude * angle.sin())
    }

    fn ensure_connected(&self) -> Result<()> {
        if self.connected {
            Ok(())
        } else {
            Err(GatewayError::NotConnected)
        }
    }
}

#[async_trait]
impl SouthDriver for SimulatorSouth {
    fn driver_name(&self) -> &'static str {
        "simulator"
    }

    async fn connect(&mut self) -> Result<()> {
        self.connected = true;
        tracing::info!("Simulator '{}' connected", self.config.name);
        Ok(())
    }

    async fn disconnect(&mut self) -> Result<()> {
        self.connected = false;
        Ok(())
    }

    async fn test_connection(&self) -> Result<()> {
        Ok(())
    }

    async fn read_points(&mut self, items: &[Item]) -> Result<ValueBatch> {
        self.ensure_connected()?;
        let now = Utc::now();
        let mut batch = ValueBatch::with_capacity(items.len());
        for item in items {
            let settings = SimItemSettings::for_item(item);
            batch.add(self.sample(item, &settings, now));
        }
        Ok(batch)
    }

    fn supports_history(&self) -> bool {
        true
    }

    async fn history_query(
        &mut self,
        items: &[Item],
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<HistoryPage> {
        self.ensure_connected()?;

        let interval = self.config.sample_interval_ms as i64;
        let start_ms = start.timestamp_millis();
        let end_ms = end.timestamp_millis();

        // First grid instant at or after `start`.
        let mut t_ms = start_ms.div_euclid(interval) * interval;
        if t_ms < start_ms {
            t_ms += interval;
        }

        let settings: Vec<SimItemSettings> =
            items.iter().map(SimItemSettings::for_item).collect();

        let mut page = HistoryPage::default();
        while t_ms < end_ms {
            let at = match Utc.timestamp_millis_opt(t_ms).single() {
                Some(at) => at,
                None => break,
            };
            for (item, settings) in items.iter().zip(&settings) {
                page.values.add(self.sample(item, settings, at));
            }
            if page.values.len() >= MAX_HISTORY_SAMPLES {
                // Truncated: report coverage so the caller resumes here.
                page.max_instant_retrieved = Some(at);
                break;
            }
            t_ms += interval;
        }
        Ok(page)
    }
}

impl HasMetadata for SimulatorSouth {
    fn metadata() -> DriverMetadata {
        DriverMetadata {
            name: "simulator",
            display_name: "Simulator",
            description: "Deterministic sine-wave source for demos and tests. Supports history queries over any past window.",
            kind: DriverKind::South,
            supports_history: true,
            example_config: serde_json::json!({
                "name": "plant_sim",
                "sample_interval_ms": 10000,
                "amplitude": 100.0
            }),
            parameters: vec![
                ParameterMetadata::optional(
                    "name",
                    "Name",
                    "Driver instance name used in logs",
                    ParameterType::String,
                    serde_json::json!("simulator"),
                ),
                ParameterMetadata::optional(
                    "sample_interval_ms",
                    "Sample Interval (ms)",
                    "Spacing of the simulated sample grid",
                    ParameterType::Integer,
                    serde_json::json!(10000),
                ),
                ParameterMetadata::optional(
                    "amplitude",
                    "Amplitude",
                    "Peak amplitude of the generated signal",
                    ParameterType::Float,
                    serde_json::json!(100.0),
                ),
            ],
        }
    }
}
