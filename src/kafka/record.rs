use crate::Result;
use bytes::Bytes;
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt;

/// A `(topic, partition)` pair.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TopicPartition {
    pub topic: String,
    pub partition: i32,
}

impl TopicPartition {
    pub fn new(topic: impl Into<String>, partition: i32) -> Self {
        Self {
            topic: topic.into(),
            partition,
        }
    }
}

impl fmt::Display for TopicPartition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.topic, self.partition)
    }
}

/// A record to publish. Built with [`Record::new`] and the `with_*` methods;
/// it is moved into the producer on send and never changed afterwards.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
    pub topic: String,
    pub key: Option<Bytes>,
    pub partition: Option<i32>,
    pub payload: Bytes,
    pub headers: BTreeMap<String, Bytes>,
    /// Creation time in milliseconds since the Unix epoch.
    pub timestamp_ms: i64,
}

impl Record {
    pub fn new(topic: impl Into<String>, payload: impl Into<Bytes>) -> Self {
        Self {
            topic: topic.into(),
            key: None,
            partition: None,
            payload: payload.into(),
            headers: BTreeMap::new(),
            timestamp_ms: chrono::Utc::now().timestamp_millis(),
        }
    }

    /// Builds a record whose payload is `value` encoded as compact JSON.
    pub fn json<T: Serialize>(topic: impl Into<String>, value: &T) -> Result<Self> {
        let payload = serde_json::to_vec(value)?;
        Ok(Self::new(topic, payload))
    }

    pub fn with_key(mut self, key: impl Into<Bytes>) -> Self {
        self.key = Some(key.into());
        self
    }

    pub fn with_partition(mut self, partition: i32) -> Self {
        self.partition = Some(partition);
        self
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<Bytes>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    pub fn with_timestamp_ms(mut self, timestamp_ms: i64) -> Self {
        self.timestamp_ms = timestamp_ms;
        self
    }

    /// Bytes this record counts against a batch budget: payload, key and
    /// header names and values.
    pub fn size(&self) -> usize {
        let headers: usize = self
            .headers
            .iter()
            .map(|(name, value)| name.len() + value.len())
            .sum();
        self.payload.len() + self.key.as_ref().map_or(0, |k| k.len()) + headers
    }
}

/// Where a record landed once the broker acknowledged it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordMetadata {
    pub topic: String,
    pub partition: i32,
    pub offset: i64,
    /// Broker (log-append) or create timestamp in milliseconds.
    pub timestamp_ms: i64,
}

/// Outcome reported for every record, exactly once.
pub type DeliveryResult = std::result::Result<RecordMetadata, crate::Error>;

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_size_counts_key_payload_and_headers() {
        let record = Record::new("events", "hello")
            .with_key("k1")
            .with_header("trace", "abc");

        assert_eq!(record.size(), 5 + 2 + 5 + 3);
    }

    #[test]
    fn test_json_record() {
        let record = Record::json("events", &json!({"id": 1, "name": "test"})).unwrap();
        let parsed: serde_json::Value = serde_json::from_slice(&record.payload).unwrap();

        assert_eq!(parsed["id"], 1);
        assert_eq!(parsed["name"], "test");
        assert!(record.key.is_none());
        assert!(record.timestamp_ms > 0);
    }

    #[test]
    fn test_topic_partition_display() {
        assert_eq!(TopicPartition::new("events", 3).to_string(), "events/3");
    }
}
