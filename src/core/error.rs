//! Gateway error types.

use thiserror::Error;

use crate::store::StoreError;

/// Errors produced by the gateway runtime.
#[derive(Debug, Error)]
pub enum GatewayError {
    /// Invalid or missing configuration.
    #[error("configuration error: {0}")]
    Config(String),

    /// Failed to establish or maintain a connection.
    #[error("connection error: {0}")]
    Connection(String),

    /// Operation requires an established connection.
    #[error("not connected")]
    NotConnected,

    /// The connector was disconnected while the operation was in flight.
    ///
    /// Pending work must resolve with this error rather than hang; any
    /// partial progress of the interrupted operation is discarded.
    #[error("disconnected")]
    Disconnected,

    /// An awaited operation exceeded its deadline.
    #[error("timeout: {0}")]
    Timeout(String),

    /// A south or north driver reported a fault.
    #[error("driver error: {0}")]
    Driver(String),

    /// The driver does not implement the requested capability.
    #[error("unsupported capability: {0}")]
    Unsupported(String),

    /// Durable storage fault. Fatal for the affected entry; never retried.
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    /// Filesystem fault while staging or archiving files.
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    /// Internal invariant violation.
    #[error("internal error: {0}")]
    Internal(String),
}

impl GatewayError {
    /// Check if the error denotes a durable-storage fault.
    ///
    /// Storage faults are reported to the operator instead of being
    /// absorbed into the retry policy.
    pub const fn is_storage(&self) -> bool {
        matches!(self, Self::Store(_))
    }
}

/// Convenient result type used throughout the gateway.
pub type Result<T> = std::result::Result<T, GatewayError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = GatewayError::Config("missing scan mode".to_string());
        assert_eq!(err.to_string(), "configuration error: missing scan mode");

        assert_eq!(GatewayError::Disconnected.to_string(), "disconnected");
        assert_eq!(GatewayError::NotConnected.to_string(), "not connected");
    }

    #[test]
    fn test_store_error_classification() {
        let err = GatewayError::Store(StoreError::Corrupt("bad entry".to_string()));
        assert!(err.is_storage());
        assert!(!GatewayError::Disconnected.is_storage());
    }
}
