//! Error types for the NATS adapter.
//!
//! Kept separate from [`DeliveryError`] so async-nats details stay in this
//! crate; every variant maps onto the control plane's classification.

use courier_core::DeliveryError;
use thiserror::Error;

/// Top-level error type for the nats-transport crate.
#[derive(Debug, Error)]
pub enum NatsError {
    /// NATS connection or transport-level failure.
    #[error("transport error: {0}")]
    Transport(String),

    /// Operation timed out waiting for a reply.
    #[error("timeout: {0}")]
    Timeout(String),

    /// The client is not connected.
    #[error("not connected: {0}")]
    NotConnected(String),

    /// Codec error during serialization or deserialization.
    #[error("codec error: {0}")]
    Codec(String),

    /// Configuration error (e.g. missing credentials for the security mode).
    #[error("configuration error: {0}")]
    Config(String),

    /// The broker answered with an error status.
    #[error("broker rejected {0}")]
    Rejected(String),
}

impl NatsError {
    /// Returns true if this error indicates a transient failure that may
    /// succeed on retry.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            NatsError::Transport(_)
                | NatsError::Timeout(_)
                | NatsError::NotConnected(_)
                | NatsError::Rejected(_)
        )
    }
}

impl From<NatsError> for DeliveryError {
    fn from(err: NatsError) -> Self {
        match err {
            NatsError::Transport(msg) => DeliveryError::Transport(msg),
            NatsError::Timeout(msg) => DeliveryError::Timeout(msg),
            NatsError::NotConnected(msg) => DeliveryError::NotConnected(msg),
            NatsError::Codec(msg) => DeliveryError::Codec(msg),
            NatsError::Config(msg) => DeliveryError::Config(msg),
            rejected @ NatsError::Rejected(_) => DeliveryError::Transport(rejected.to_string()),
        }
    }
}

impl From<serde_json::Error> for NatsError {
    fn from(err: serde_json::Error) -> Self {
        NatsError::Codec(err.to_string())
    }
}

/// Shorthand result alias for NATS operations.
pub type NatsResult<T> = Result<T, NatsError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_classification() {
        assert!(NatsError::Transport("conn reset".into()).is_retryable());
        assert!(NatsError::Timeout("deadline".into()).is_retryable());
        assert!(NatsError::NotConnected("no conn".into()).is_retryable());
        assert!(NatsError::Rejected("publish".into()).is_retryable());
        assert!(!NatsError::Codec("bad json".into()).is_retryable());
        assert!(!NatsError::Config("missing server".into()).is_retryable());
    }

    #[test]
    fn test_retryable_survives_conversion() {
        let errors = [
            NatsError::Transport("a".into()),
            NatsError::Timeout("b".into()),
            NatsError::NotConnected("c".into()),
            NatsError::Codec("d".into()),
            NatsError::Config("e".into()),
            NatsError::Rejected("seen".into()),
        ];
        for err in errors {
            let retryable = err.is_retryable();
            let delivery = DeliveryError::from(err);
            assert_eq!(delivery.is_retryable(), retryable, "{delivery}");
        }
    }

    #[test]
    fn test_rejected_display() {
        let err = DeliveryError::from(NatsError::Rejected("unseen query".into()));
        assert!(err.to_string().contains("broker rejected unseen query"));
    }
}
