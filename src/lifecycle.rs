//! Connection supervision shared by south and north connectors.
//!
//! A [`ConnectionSupervisor`] owns one connector's lifecycle: the
//! tri-state connection flag, the retry-until-connected loop, and the
//! cancellation token that aborts both the retry loop and any in-flight
//! driver call the moment the connector is asked to disconnect.
//!
//! A supervisor is single-use. Once cancelled it stays cancelled;
//! reconfiguring a connector means building a new one.

use std::future::Future;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::core::error::{GatewayError, Result};
use crate::core::metrics::ConnectorMetrics;
use crate::core::traits::ConnectionState;

/// Lifecycle state machine for one connector.
pub struct ConnectionSupervisor {
    connector_id: String,
    state: Arc<RwLock<ConnectionState>>,
    metrics: Arc<ConnectorMetrics>,
    cancel: CancellationToken,
    retry_interval: Duration,
}

impl ConnectionSupervisor {
    /// Create a supervisor in the disconnected state.
    pub fn new(
        connector_id: impl Into<String>,
        metrics: Arc<ConnectorMetrics>,
        retry_interval: Duration,
    ) -> Self {
        Self {
            connector_id: connector_id.into(),
            state: Arc::new(RwLock::new(ConnectionState::Disconnected)),
            metrics,
            cancel: CancellationToken::new(),
            retry_interval,
        }
    }

    /// Current connection state.
    pub fn state(&self) -> ConnectionState {
        self.state
            .read()
            .map(|s| *s)
            .unwrap_or(ConnectionState::Disconnected)
    }

    /// Record a state transition.
    pub fn set_state(&self, state: ConnectionState) {
        let previous = self.state();
        if previous == state {
            return;
        }
        if let Ok(mut s) = self.state.write() {
            *s = state;
        }
        tracing::info!(
            "Connector '{}' state: {} -> {}",
            self.connector_id,
            previous,
            state
        );
        self.metrics.set_connection_state(state);
    }

    /// Token cancelled when the connector is disconnecting.
    pub fn token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Begin shutdown. Idempotent.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Whether shutdown has begun.
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Retry `attempt` until it succeeds or the supervisor is cancelled.
    ///
    /// Holds the state in `Connecting` across retries and moves it to
    /// `Connected` on success. Cancellation resolves with
    /// [`GatewayError::Disconnected`].
    pub async fn establish<F, Fut>(&self, mut attempt: F) -> Result<()>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<()>>,
    {
        loop {
            if self.is_cancelled() {
                return Err(GatewayError::Disconnected);
            }
            self.set_state(ConnectionState::Connecting);

            match attempt().await {
                Ok(()) => {
                    self.set_state(ConnectionState::Connected);
                    return Ok(());
                }
                Err(e) => {
                    tracing::warn!(
                        "Connector '{}' connect failed: {}, retrying in {:?}",
                        self.connector_id,
                        e,
                        self.retry_interval
                    );
                    tokio::select! {
                        _ = tokio::time::sleep(self.retry_interval) => {}
                        _ = self.cancel.cancelled() => {
                            return Err(GatewayError::Disconnected);
                        }
                    }
                }
            }
        }
    }

    /// Race a driver call against cancellation.
    ///
    /// On cancellation the call's partial progress is discarded and the
    /// caller gets [`GatewayError::Disconnected`] instead of waiting for
    /// the call to finish on its own.
    pub async fn guard<T, Fut>(&self, fut: Fut) -> Result<T>
    where
        Fut: Future<Output = Result<T>>,
    {
        tokio::select! {
            result = fut => result,
            _ = self.cancel.cancelled() => Err(GatewayError::Disconnected),
        }
    }
}

impl std::fmt::Debug for ConnectionSupervisor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionSupervisor")
            .field("connector_id", &self.connector_id)
            .field("state", &self.state())
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn supervisor(retry_ms: u64) -> ConnectionSupervisor {
        ConnectionSupervisor::new(
            "test",
            Arc::new(ConnectorMetrics::new("test")),
            Duration::from_millis(retry_ms),
        )
    }

    #[tokio::test]
    async fn test_establish_succeeds_first_try() {
        let sup = supervisor(10);
        sup.establish(|| async { Ok(()) }).await.unwrap();
        assert_eq!(sup.state(), ConnectionState::Connected);
    }

    #[tokio::test(start_paused = true)]
    async fn test_establish_retries_until_success() {
        let sup = supervisor(1_000);
        let attempts = Arc::new(AtomicU32::new(0));

        let counter = attempts.clone();
        sup.establish(move || {
            let counter = counter.clone();
            async move {
                if counter.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(GatewayError::Connection("refused".to_string()))
                } else {
                    Ok(())
                }
            }
        })
        .await
        .unwrap();

        assert_eq!(attempts.load(Ordering::SeqCst), 3);
        assert_eq!(sup.state(), ConnectionState::Connected);
    }

    #[tokio::test(start_paused = true)]
    async fn test_establish_stops_on_cancel() {
        let sup = Arc::new(supervisor(60_000));

        let handle = {
            let sup = sup.clone();
            tokio::spawn(async move {
                sup.establish(|| async {
                    Err(GatewayError::Connection("refused".to_string()))
                })
                .await
            })
        };

        // Let the first attempt fail and enter the retry sleep.
        tokio::time::sleep(Duration::from_millis(10)).await;
        sup.cancel();

        let result = handle.await.unwrap();
        assert!(matches!(result, Err(GatewayError::Disconnected)));
    }

    #[tokio::test]
    async fn test_guard_passes_result_through() {
        let sup = supervisor(10);
        let value = sup.guard(async { Ok(42) }).await.unwrap();
        assert_eq!(value, 42);
    }

    #[tokio::test(start_paused = true)]
    async fn test_guard_resolves_on_cancel() {
        let sup = supervisor(10);
        sup.cancel();
        let result: Result<u32> = sup
            .guard(async {
                tokio::time::sleep(Duration::from_secs(3600)).await;
                Ok(1)
            })
            .await;
        assert!(matches!(result, Err(GatewayError::Disconnected)));
    }

    #[tokio::test]
    async fn test_set_state_dedupes() {
        let metrics = Arc::new(ConnectorMetrics::new("dedupe"));
        let sup = ConnectionSupervisor::new("dedupe", metrics.clone(), Duration::from_millis(10));
        let (_, mut rx) = metrics.subscribe();

        sup.set_state(ConnectionState::Connecting);
        sup.set_state(ConnectionState::Connecting);
        assert!(rx.try_recv().is_ok());
        assert!(rx.try_recv().is_err());
    }
}
