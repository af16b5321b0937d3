//! Consumer error types and error categorization
//!
//! A worker that loses its subscription moves to `Failed` and retries after a
//! backoff, whatever the cause. [`ConsumerError::is_connection_error`] only
//! picks the log line: connection-level errors (broker unreachable, channel
//! closed, ack rejected) are logged as a reconnect, anything else as an
//! unexpected failure. Errors while storing a delivery never reach the retry
//! loop; they are logged and the delivery is still acknowledged.

use std::path::PathBuf;
use thiserror::Error;

/// Errors raised by the consumer core
#[derive(Error, Debug)]
pub enum ConsumerError {
    /// Error reported by the AMQP client
    #[error("AMQP error: {0}")]
    Amqp(#[from] lapin::Error),

    /// Broker could not be reached or refused the operation
    #[error("Broker unavailable: {0}")]
    Unavailable(String),

    /// The broker ended the consumer stream
    #[error("Subscription closed by broker")]
    SubscriptionClosed,

    /// Acknowledging a delivery failed; the channel is no longer usable
    #[error("Failed to acknowledge delivery {delivery_tag}: {message}")]
    Ack { delivery_tag: u64, message: String },

    /// The broker negatively confirmed a publish
    #[error("Publish to exchange '{exchange}' with routing key '{routing_key}' was not confirmed")]
    PublishNotConfirmed {
        exchange: String,
        routing_key: String,
    },

    /// Shared consumer state lock was poisoned by a panicking holder
    #[error("Consumer state is unavailable: lock poisoned")]
    StatePoisoned,

    /// Caller supplied an unusable argument
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl ConsumerError {
    /// Whether this error means the broker connection or channel is gone.
    ///
    /// Workers log these as a reconnect rather than an unexpected failure.
    pub fn is_connection_error(&self) -> bool {
        matches!(
            self,
            ConsumerError::Amqp(_)
                | ConsumerError::Unavailable(_)
                | ConsumerError::SubscriptionClosed
                | ConsumerError::Ack { .. }
        )
    }
}

/// Errors raised while reading or writing snapshot artifacts
#[derive(Error, Debug)]
pub enum PersistenceError {
    /// Filesystem failure on a snapshot artifact
    #[error("I/O error on {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Snapshot contents could not be encoded or decoded
    #[error("Snapshot encoding error: {0}")]
    Encoding(#[from] serde_json::Error),

    /// Backend refused the operation
    #[error("Snapshot backend unavailable: {0}")]
    Unavailable(String),
}

impl PersistenceError {
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        PersistenceError::Io {
            path: path.into(),
            source,
        }
    }
}
