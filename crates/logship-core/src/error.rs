//! Error types for the logship core library.
//!
//! Uses hierarchical domain-specific errors following the thiserror pattern.

use thiserror::Error;

use crate::model::{ConfigId, MessageId};

/// Result type alias for logship operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Top-level error type for logship.
#[derive(Error, Debug)]
pub enum Error {
    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Message store error
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    /// Broker-related error
    #[error("Broker error: {0}")]
    Broker(#[from] BrokerError),

    /// Transformation expression error
    #[error("Transform error: {0}")]
    Transform(#[from] TransformError),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Operation was interrupted by cancellation
    #[error("Cancelled")]
    Cancelled,
}

/// Message store errors.
#[derive(Error, Debug)]
pub enum StoreError {
    /// The bounded ingest channel is full; the producer must slow down or drop.
    #[error("Ingest channel full: backpressure engaged")]
    BackpressureFull,

    /// No source configuration stored under the given id.
    #[error("Source configuration not found: {0}")]
    ConfigNotFound(ConfigId),

    /// A state transition was requested for a message that is absent or not
    /// in the expected state. Logged and ignored by callers.
    #[error("Message {uid} not in state {expected}")]
    WrongState {
        /// Message the transition was requested for
        uid: MessageId,
        /// State the transition required
        expected: &'static str,
    },

    /// Transient storage failure; retried internally before escalation.
    #[error("Transient storage failure: {0}")]
    Transient(String),

    /// Non-recoverable storage failure. The store emits on `errors()` and
    /// stops serving.
    #[error("Fatal storage failure: {0}")]
    Fatal(String),

    /// The store writer has shut down and no longer accepts operations.
    #[error("Store is closed")]
    Closed,
}

/// Broker sink errors.
#[derive(Error, Debug)]
pub enum BrokerError {
    /// Failed to reach the broker
    #[error("Connection failed to {brokers}: {message}")]
    ConnectionFailed {
        /// Bootstrap servers the connection targeted
        brokers: String,
        /// Client library error text
        message: String,
    },

    /// The producer send queue is full
    #[error("Producer queue full")]
    QueueFull,

    /// A produce request failed
    #[error("Delivery failed for topic {topic}: {kind}")]
    Delivery {
        /// Topic the request targeted
        topic: String,
        /// Failure classification
        kind: BrokerErrorKind,
    },

    /// The sink input channel is closed
    #[error("Broker sink closed")]
    SinkClosed,
}

/// Classification of broker delivery failures.
///
/// Fatal kinds tear the forwarding session down so the supervisor can rebuild
/// the connection; every other kind results in a nack and redelivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BrokerErrorKind {
    /// SASL/SSL authentication failed
    AuthFailure,
    /// The topic exists but the client is not authorized for it
    TopicAuthFailure,
    /// The broker rejected the producer configuration
    InvalidConfig,
    /// Queue full, request timeout, leader election, transport hiccup
    Transient,
    /// Anything the client library did not classify
    Unknown,
}

impl BrokerErrorKind {
    /// Whether this failure should terminate the forwarding session.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            BrokerErrorKind::AuthFailure
                | BrokerErrorKind::TopicAuthFailure
                | BrokerErrorKind::InvalidConfig
        )
    }
}

impl std::fmt::Display for BrokerErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            BrokerErrorKind::AuthFailure => "authentication failure",
            BrokerErrorKind::TopicAuthFailure => "topic authorization failure",
            BrokerErrorKind::InvalidConfig => "invalid configuration",
            BrokerErrorKind::Transient => "transient failure",
            BrokerErrorKind::Unknown => "unknown failure",
        };
        f.write_str(s)
    }
}

/// Transformation expression errors.
#[derive(Error, Debug)]
pub enum TransformError {
    /// The expression source is structurally invalid. Raised at config load,
    /// never per message.
    #[error("Parse error in {what} at offset {offset}: {message}")]
    Parse {
        /// Which expression failed (filter, topic, partition)
        what: &'static str,
        /// Byte offset of the failure in the source text
        offset: usize,
        /// Parser diagnostic
        message: String,
    },

    /// Evaluation failed for one record (unknown field, type mismatch).
    #[error("Evaluation error: {0}")]
    Eval(String),
}

// Conversion implementations for external error types

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Serialization(err.to_string())
    }
}

impl From<toml::de::Error> for Error {
    fn from(err: toml::de::Error) -> Self {
        Error::Config(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = Error::Config("invalid value".into());
        assert_eq!(err.to_string(), "Configuration error: invalid value");

        let broker_err = BrokerError::ConnectionFailed {
            brokers: "localhost:9092".into(),
            message: "connection refused".into(),
        };
        let err: Error = broker_err.into();
        assert!(err.to_string().contains("Connection failed"));
    }

    #[test]
    fn test_backpressure_error() {
        let err = StoreError::BackpressureFull;
        assert!(err.to_string().contains("backpressure"));
    }

    #[test]
    fn test_fatal_broker_kinds() {
        assert!(BrokerErrorKind::AuthFailure.is_fatal());
        assert!(BrokerErrorKind::TopicAuthFailure.is_fatal());
        assert!(BrokerErrorKind::InvalidConfig.is_fatal());
        assert!(!BrokerErrorKind::Transient.is_fatal());
        assert!(!BrokerErrorKind::Unknown.is_fatal());
    }
}
