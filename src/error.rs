//! Error types and result handling for kafka-courier.
//!
//! This module defines the main error type [`Error`] and a convenience
//! [`Result`] type alias used throughout the crate.
//!
//! [`Error`] is `Clone`: a single broker failure resolves every record of a
//! batch, and each record's delivery future receives its own copy.
//!
//! # Example
//!
//! ```rust
//! use kafka_courier::{Error, Result};
//!
//! fn connect_to_broker() -> Result<()> {
//!     // Simulating a transport failure
//!     Err(Error::Transport("connection refused".to_string()))
//! }
//!
//! match connect_to_broker() {
//!     Ok(()) => println!("Connected"),
//!     Err(e) if e.is_retryable() => eprintln!("Retryable error: {}", e),
//!     Err(e) => eprintln!("Fatal error: {}", e),
//! }
//! ```

use rdkafka::error::KafkaError;
use thiserror::Error;

/// The main error type for kafka-courier operations.
///
/// The variants double as the delivery failure taxonomy: every record's
/// [`DeliveryResult`](crate::kafka::DeliveryResult) carries one of them.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// Configuration error, from an invalid file or environment override.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Error surfaced by the librdkafka-backed transport.
    #[error("Kafka error: {0}")]
    Kafka(#[from] KafkaError),

    /// JSON serialization error when encoding payloads.
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// I/O error, typically from reading the configuration file.
    #[error("IO error: {0}")]
    Io(String),

    /// Network-level failure talking to a broker. Retried with backoff.
    #[error("Transport error: {0}")]
    Transport(String),

    /// SASL handshake or re-authentication was rejected.
    #[error("Authentication error: {0}")]
    Authentication(String),

    /// TLS handshake failure.
    #[error("TLS error: {0}")]
    Tls(String),

    /// The reconnect budget for an endpoint was exhausted.
    #[error("Connection to {endpoint} unavailable after {attempts} attempts")]
    ConnectionUnavailable {
        /// Broker endpoint that could not be reached
        endpoint: String,
        /// Number of connection attempts made
        attempts: u32,
    },

    /// The broker we sent to no longer leads the partition.
    #[error("Broker is not the leader for {topic}/{partition}")]
    NotLeaderForPartition {
        /// Topic name
        topic: String,
        /// Partition id
        partition: i32,
    },

    /// Topic or partition missing from cluster metadata.
    #[error("Unknown topic or partition: {topic}/{partition}")]
    UnknownTopicOrPartition {
        /// Topic name
        topic: String,
        /// Partition id, `-1` when the whole topic is unknown
        partition: i32,
    },

    /// A record (or batch) exceeds the configured size budget.
    #[error("Message too large: {size} bytes exceeds limit of {max} bytes")]
    MessageTooLarge {
        /// Size of the rejected record in bytes
        size: usize,
        /// Configured limit in bytes
        max: usize,
    },

    /// The broker asked us to back off.
    #[error("Throttled by broker for {throttle_ms}ms")]
    Throttled {
        /// Requested throttle time in milliseconds
        throttle_ms: u64,
    },

    /// The client was closed before or while the operation ran.
    #[error("Client closed")]
    ClientClosed,

    /// Operation timeout.
    #[error("Timeout error: {message}")]
    TimedOut {
        /// Description of what timed out
        message: String,
    },

    /// Unexpected or malformed broker response.
    #[error("Protocol error: {0}")]
    Protocol(String),
}

impl Error {
    /// Whether retrying the same operation may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::Transport(_)
                | Error::NotLeaderForPartition { .. }
                | Error::UnknownTopicOrPartition { .. }
                | Error::Throttled { .. }
                | Error::TimedOut { .. }
        )
    }

    /// Whether the error poisons the whole client, not just one batch.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Error::Authentication(_) | Error::Tls(_) | Error::ClientClosed
        )
    }

    pub(crate) fn timed_out(message: impl Into<String>) -> Self {
        Error::TimedOut {
            message: message.into(),
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Error::Io(e.to_string())
    }
}

impl From<config::ConfigError> for Error {
    fn from(e: config::ConfigError) -> Self {
        Error::Config(e.to_string())
    }
}

/// A convenient Result type alias for kafka-courier operations.
///
/// This is equivalent to `std::result::Result<T, kafka_courier::Error>`.
pub type Result<T> = std::result::Result<T, Error>;
