//! Seam between the producer core and whatever speaks the Kafka wire
//! protocol.
//!
//! The core never frames requests itself. It hands a sealed batch to a
//! [`Session`] and interprets the outcome: success, leader changed,
//! throttled or fatal. [`RdKafkaTransport`](super::RdKafkaTransport)
//! is the production implementation and [`MockTransport`](super::MockTransport)
//! an in-memory cluster for tests.

use super::record::{Record, TopicPartition};
use crate::config::SecuritySettings;
use crate::{Error, Result};
use async_trait::async_trait;
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

/// A broker address.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Endpoint {
    pub host: String,
    pub port: u16,
}

impl Endpoint {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

impl FromStr for Endpoint {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let (host, port) = s
            .trim()
            .rsplit_once(':')
            .ok_or_else(|| Error::Config(format!("broker address '{}' is missing a port", s)))?;

        if host.is_empty() {
            return Err(Error::Config(format!("broker address '{}' is missing a host", s)));
        }

        let port = port
            .parse::<u16>()
            .map_err(|e| Error::Config(format!("invalid port in broker address '{}': {}", s, e)))?;

        Ok(Endpoint::new(host, port))
    }
}

/// One sealed batch on its way to a partition leader.
#[derive(Debug, Clone)]
pub struct ProduceRequest {
    pub topic_partition: TopicPartition,
    /// Sequence assigned when the batch was sealed.
    pub sequence: u64,
    pub records: Vec<Record>,
    /// Acknowledgement level (`"0"`, `"1"` or `"all"`).
    pub acks: String,
    pub timeout: Duration,
}

impl ProduceRequest {
    pub fn size(&self) -> usize {
        self.records.iter().map(Record::size).sum()
    }
}

/// Broker acknowledgement for a whole batch. Record `i` of the batch was
/// written at `base_offset + i` unless `record_offsets` says otherwise.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProduceResponse {
    pub base_offset: i64,
    /// Set when the topic uses log-append time.
    pub log_append_time_ms: Option<i64>,
    /// Per-record offsets, for transports that may split one batch over
    /// several broker requests.
    pub record_offsets: Option<Vec<i64>>,
}

impl ProduceResponse {
    pub fn new(base_offset: i64) -> Self {
        Self {
            base_offset,
            log_append_time_ms: None,
            record_offsets: None,
        }
    }

    /// Offset of record `index` of the batch.
    pub fn offset_of(&self, index: usize) -> i64 {
        self.record_offsets
            .as_ref()
            .and_then(|offsets| offsets.get(index).copied())
            .unwrap_or(self.base_offset + index as i64)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartitionMetadata {
    pub id: i32,
    /// Broker id of the current leader, `None` while an election runs.
    pub leader: Option<i32>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct TopicMetadata {
    pub partitions: Vec<PartitionMetadata>,
}

/// Result of one metadata round-trip.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ClusterMetadata {
    pub brokers: HashMap<i32, Endpoint>,
    pub topics: HashMap<String, TopicMetadata>,
}

/// Opens authenticated sessions to brokers.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Connects and runs the TLS and SASL handshakes `security` asks for.
    ///
    /// Fails with [`Error::Authentication`], [`Error::Tls`] or
    /// [`Error::Transport`].
    async fn connect(
        &self,
        endpoint: &Endpoint,
        security: &SecuritySettings,
    ) -> Result<Box<dyn Session>>;
}

/// A live connection to one broker. Owned by one worker at a time.
#[async_trait]
pub trait Session: Send {
    fn endpoint(&self) -> &Endpoint;

    async fn produce(&mut self, request: &ProduceRequest) -> Result<ProduceResponse>;

    /// Fetches metadata for `topics`; an empty slice asks for every topic.
    async fn metadata(&mut self, topics: &[String]) -> Result<ClusterMetadata>;

    /// Re-runs SASL authentication on an established session.
    async fn reauthenticate(&mut self) -> Result<()> {
        Ok(())
    }
}
