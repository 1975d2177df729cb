//! Error types for the delivery control plane.
//!
//! Variants are grouped by how the control plane reacts to them: transient
//! transport failures are retried, configuration errors fail fast back to the
//! caller, and handler/lifecycle failures are absorbed and logged where they
//! happen.

use thiserror::Error;

/// Top-level error type for delivery operations.
#[derive(Debug, Error)]
pub enum DeliveryError {
    /// Transport send/subscribe/query failure.
    #[error("transport error: {0}")]
    Transport(String),

    /// Operation timed out waiting for the transport or broker.
    #[error("timeout: {0}")]
    Timeout(String),

    /// The transport has no live connection.
    #[error("not connected: {0}")]
    NotConnected(String),

    /// Invalid publish arguments (missing payload, empty event name, ...).
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// No listener is registered for the channel.
    #[error("no listener registered for channel '{0}'")]
    UnknownChannel(String),

    /// Payload could not be encoded or decoded.
    #[error("codec error: {0}")]
    Codec(String),

    /// Invalid configuration.
    #[error("configuration error: {0}")]
    Config(String),

    /// An application handler failed while processing a message.
    #[error("handler error: {0}")]
    Handler(String),

    /// An application lifecycle hook or connection refresh failed.
    #[error("lifecycle hook error: {0}")]
    Lifecycle(String),

    /// A retry loop was interrupted by shutdown.
    #[error("interrupted: {0}")]
    Interrupted(String),
}

impl DeliveryError {
    /// Returns true for transient failures that the retry executor keeps
    /// retrying (transport, timeout, not connected).
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            DeliveryError::Transport(_) | DeliveryError::Timeout(_) | DeliveryError::NotConnected(_)
        )
    }

    /// Returns true for errors that are surfaced synchronously to the caller
    /// when raised before anything is sent.
    pub fn is_configuration(&self) -> bool {
        matches!(
            self,
            DeliveryError::InvalidArgument(_)
                | DeliveryError::UnknownChannel(_)
                | DeliveryError::Codec(_)
                | DeliveryError::Config(_)
        )
    }

    /// Returns true if a retry loop was interrupted.
    pub fn is_interrupted(&self) -> bool {
        matches!(self, DeliveryError::Interrupted(_))
    }
}

impl From<serde_json::Error> for DeliveryError {
    fn from(err: serde_json::Error) -> Self {
        DeliveryError::Codec(err.to_string())
    }
}

/// Shorthand result alias for delivery operations.
pub type DeliveryResult<T> = Result<T, DeliveryError>;

/// Render a caught panic payload as text.
pub(crate) fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(msg) = payload.downcast_ref::<&'static str>() {
        (*msg).to_string()
    } else if let Some(msg) = payload.downcast_ref::<String>() {
        msg.clone()
    } else {
        "unknown panic".to_string()
    }
}
