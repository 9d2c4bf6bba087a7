//! Gateway assembly: wires configuration into running connectors.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::cache::CacheEngine;
use crate::core::data::ValueBatch;
use crate::core::error::{GatewayError, Result};
use crate::core::metrics::{MetricsEvent, MetricsHub};
use crate::core::traits::Ingestor;
use crate::gateway::config::GatewayConfig;
use crate::gateway::factory;
use crate::scan::{ScanScheduler, SouthConnector};
use crate::store::SledStore;

/// Fans one south connector's output out to every north cache.
///
/// Each north connector owns an independent durable queue, so one slow
/// or broken destination never holds the others back. A failing enqueue
/// aborts the fan-out; the south side reports it as a read fault and the
/// tick is retried by the next firing.
pub struct IngestRouter {
    targets: Vec<Arc<dyn Ingestor>>,
}

impl IngestRouter {
    /// Route to the given targets.
    pub fn new(targets: Vec<Arc<dyn Ingestor>>) -> Self {
        Self { targets }
    }
}

#[async_trait]
impl Ingestor for IngestRouter {
    async fn ingest_values(&self, values: ValueBatch) -> Result<()> {
        if let [single] = self.targets.as_slice() {
            return single.ingest_values(values).await;
        }
        for target in &self.targets {
            target.ingest_values(values.clone()).await?;
        }
        Ok(())
    }

    async fn ingest_file(&self, path: &Path) -> Result<()> {
        for target in &self.targets {
            target.ingest_file(path).await?;
        }
        Ok(())
    }
}

/// A fully assembled gateway.
///
/// Owns the scheduler, every connector, and the metrics hub. Built from
/// a validated [`GatewayConfig`], started once, stopped once (stop is
/// idempotent).
pub struct Gateway {
    name: String,
    scheduler: ScanScheduler,
    hub: Arc<MetricsHub>,
    souths: Vec<Arc<SouthConnector>>,
    norths: Vec<Arc<CacheEngine>>,
    shutdown_timeout: Duration,
}

impl Gateway {
    /// Build every enabled connector described by `config`.
    ///
    /// Opens the durable queues, so the caller needs the cache directory
    /// to be writable. Must run inside a tokio runtime; scan modes spawn
    /// their timer tasks on registration.
    pub fn from_config(config: GatewayConfig) -> Result<Self> {
        config.validate()?;

        let scheduler = ScanScheduler::new();
        for def in &config.scan_modes {
            scheduler.register(def.to_scan_mode()?)?;
        }

        let hub = Arc::new(MetricsHub::new());
        let cache_dir = &config.gateway.cache_dir;

        let mut norths = Vec::new();
        for nc in &config.north {
            if !nc.enabled {
                tracing::info!("Connector '{}' disabled, skipping", nc.id);
                continue;
            }
            let driver = factory::create_north(nc)?;
            let policy = nc.caching.to_policy()?;
            let archive = nc.archive.to_policy();
            let connector_dir = cache_dir.join("north").join(&nc.id);
            let store = Arc::new(SledStore::open(connector_dir.join("queue"))?);
            let metrics = hub.register(&nc.id);
            norths.push(Arc::new(CacheEngine::new(
                nc.id.clone(),
                policy,
                archive,
                driver,
                store,
                metrics,
                &connector_dir,
                nc.retry_interval(),
            )));
            tracing::info!(
                "Connector '{}' ready ({} -> {})",
                nc.id,
                nc.driver,
                nc.name.as_deref().unwrap_or(&nc.id)
            );
        }

        let router: Arc<dyn Ingestor> = Arc::new(IngestRouter::new(
            norths
                .iter()
                .map(|engine| engine.clone() as Arc<dyn Ingestor>)
                .collect(),
        ));
        if norths.is_empty() && config.south.iter().any(|s| s.enabled) {
            tracing::warn!("No enabled north connectors; acquired data will be discarded");
        }

        let mut souths = Vec::new();
        for sc in &config.south {
            if !sc.enabled {
                tracing::info!("Connector '{}' disabled, skipping", sc.id);
                continue;
            }
            let driver = factory::create_south(sc)?;
            let history = sc
                .history
                .as_ref()
                .map(|h| h.to_settings())
                .transpose()?;
            let store = Arc::new(SledStore::open(
                cache_dir.join("south").join(&sc.id).join("state"),
            )?);
            let metrics = hub.register(&sc.id);
            souths.push(Arc::new(SouthConnector::new(
                sc.id.clone(),
                driver,
                sc.items.clone(),
                history,
                router.clone(),
                store,
                metrics,
                sc.retry_interval(),
            )));
            tracing::info!(
                "Connector '{}' ready ({}, {} item(s))",
                sc.id,
                sc.driver,
                sc.items.iter().filter(|i| i.enabled).count()
            );
        }

        Ok(Self {
            name: config.gateway.name.clone(),
            scheduler,
            hub,
            souths,
            norths,
            shutdown_timeout: config.gateway.shutdown_timeout(),
        })
    }

    /// Gateway instance name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The metrics hub covering every connector.
    pub fn hub(&self) -> Arc<MetricsHub> {
        self.hub.clone()
    }

    /// Snapshot every connector's metrics, sorted by connector id.
    pub fn status(&self) -> Vec<MetricsEvent> {
        self.hub.snapshot_all()
    }

    /// Start delivery first, then acquisition.
    ///
    /// North connectors come up before south connectors so a backlog
    /// drain target exists from the first acquired value. Any failure
    /// rolls back to a fully stopped gateway.
    pub async fn start(&self) -> Result<()> {
        let result = self.start_inner().await;
        if let Err(e) = &result {
            tracing::error!("Gateway '{}' failed to start: {}", self.name, e);
            self.stop().await;
        }
        result
    }

    async fn start_inner(&self) -> Result<()> {
        for engine in &self.norths {
            let tick_rx = self
                .scheduler
                .subscribe(engine.scan_mode_id())
                .ok_or_else(|| {
                    GatewayError::Config(format!(
                        "unknown scan mode '{}' referenced by connector '{}'",
                        engine.scan_mode_id(),
                        engine.connector_id()
                    ))
                })?;
            engine.start(Some(tick_rx)).await?;
        }
        for south in &self.souths {
            south.start(&self.scheduler).await?;
        }
        tracing::info!(
            "Gateway '{}' started: {} south, {} north, {} scan mode(s)",
            self.name,
            self.souths.len(),
            self.norths.len(),
            self.scheduler.scan_mode_ids().len()
        );
        Ok(())
    }

    /// Stop acquisition first, then delivery, then the scheduler.
    pub async fn stop(&self) {
        for south in &self.souths {
            if let Err(e) = south.disconnect().await {
                tracing::warn!("Connector '{}' stop failed: {}", south.connector_id(), e);
            }
        }
        for engine in &self.norths {
            if let Err(e) = engine.stop().await {
                tracing::warn!("Connector '{}' stop failed: {}", engine.connector_id(), e);
            }
        }
        self.scheduler.shutdown(self.shutdown_timeout).await;
        tracing::info!("Gateway '{}' stopped", self.name);
    }
}

impl std::fmt::Debug for Gateway {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Gateway")
            .field("name", &self.name)
            .field("souths", &self.souths.len())
            .field("norths", &self.norths.len())
            .finish()
    }
}
