//! [`Transport`] backed by librdkafka through the `rdkafka` crate.
//!
//! librdkafka owns the wire protocol, TLS and SASL. Its own batching and
//! retries are switched off (`linger.ms=0`, `retries=0`) so the batches the
//! accumulator seals are the ones that go out, and retry decisions stay
//! with the producer.

use super::record::TopicPartition;
use super::transport::{
    ClusterMetadata, Endpoint, PartitionMetadata, ProduceRequest, ProduceResponse, Session,
    TopicMetadata, Transport,
};
use crate::config::{ProducerConfig, SecuritySettings};
use crate::{Error, Result};
use async_trait::async_trait;
use rdkafka::error::KafkaError;
use rdkafka::message::{Header, OwnedHeaders};
use rdkafka::metadata::Metadata;
use rdkafka::producer::{FutureProducer, FutureRecord, Producer};
use rdkafka::types::RDKafkaErrorCode;
use rdkafka::ClientConfig;
use std::collections::HashMap;
use std::time::Duration;
use tracing::{debug, instrument};

pub struct RdKafkaTransport {
    acks: String,
    request_timeout: Duration,
    max_in_flight: usize,
}

impl RdKafkaTransport {
    pub fn new(config: &ProducerConfig) -> Self {
        Self {
            acks: config.acks.clone(),
            request_timeout: config.request_timeout(),
            max_in_flight: config.effective_max_in_flight(),
        }
    }

    fn client_config(&self, endpoint: &Endpoint, security: &SecuritySettings) -> ClientConfig {
        let mut config = ClientConfig::new();
        config
            .set("bootstrap.servers", endpoint.to_string())
            .set("security.protocol", security.protocol.as_str())
            .set("acks", &self.acks)
            .set("linger.ms", "0")
            .set("retries", "0")
            .set("enable.idempotence", "false")
            .set(
                "max.in.flight.requests.per.connection",
                self.max_in_flight.to_string(),
            )
            .set(
                "message.timeout.ms",
                self.request_timeout.as_millis().to_string(),
            );

        if let Some(mechanism) = security.mechanism {
            config.set("sasl.mechanism", mechanism.as_str());
        }
        if let Some(username) = &security.username {
            config.set("sasl.username", username);
        }
        if let Some(password) = &security.password {
            config.set("sasl.password", password);
        }
        config
    }
}

#[async_trait]
impl Transport for RdKafkaTransport {
    #[instrument(skip(self, security), fields(endpoint = %endpoint))]
    async fn connect(
        &self,
        endpoint: &Endpoint,
        security: &SecuritySettings,
    ) -> Result<Box<dyn Session>> {
        let producer: FutureProducer = self
            .client_config(endpoint, security)
            .create()
            .map_err(classify)?;

        // Client creation is lazy; a metadata request forces the TLS and
        // SASL handshakes so credential problems surface here.
        fetch_metadata(producer.clone(), Vec::new(), self.request_timeout).await?;
        debug!("librdkafka session established");

        Ok(Box::new(RdKafkaSession {
            endpoint: endpoint.clone(),
            producer,
            request_timeout: self.request_timeout,
        }))
    }
}

struct RdKafkaSession {
    endpoint: Endpoint,
    producer: FutureProducer,
    request_timeout: Duration,
}

#[async_trait]
impl Session for RdKafkaSession {
    fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    async fn produce(&mut self, request: &ProduceRequest) -> Result<ProduceResponse> {
        let tp = &request.topic_partition;
        let mut deliveries = Vec::with_capacity(request.records.len());

        // Enqueue synchronously so librdkafka sees the records in batch order
        for record in &request.records {
            let mut headers = OwnedHeaders::new();
            for (name, value) in &record.headers {
                headers = headers.insert(Header {
                    key: name.as_str(),
                    value: Some(&value[..]),
                });
            }

            let mut future_record: FutureRecord<'_, [u8], [u8]> = FutureRecord::to(&tp.topic)
                .partition(tp.partition)
                .payload(&record.payload[..])
                .timestamp(record.timestamp_ms)
                .headers(headers);
            if let Some(key) = &record.key {
                future_record = future_record.key(&key[..]);
            }

            let delivery = self
                .producer
                .send_result(future_record)
                .map_err(|(e, _)| for_partition(classify(e), request))?;
            deliveries.push(delivery);
        }

        let mut offsets = Vec::with_capacity(deliveries.len());
        for delivery in futures::future::join_all(deliveries).await {
            match delivery {
                Ok(Ok((_, offset))) => offsets.push(offset),
                Ok(Err((e, _))) => return Err(for_partition(classify(e), request)),
                Err(_) => {
                    return Err(Error::Transport(format!(
                        "delivery to {} cancelled",
                        self.endpoint
                    )))
                }
            }
        }

        produce_response(offsets, tp)
    }

    async fn metadata(&mut self, topics: &[String]) -> Result<ClusterMetadata> {
        fetch_metadata(self.producer.clone(), topics.to_vec(), self.request_timeout).await
    }

    async fn reauthenticate(&mut self) -> Result<()> {
        // librdkafka re-authenticates on its own when the broker asks for it
        // (KIP-368); a metadata round-trip confirms the session still works.
        fetch_metadata(self.producer.clone(), Vec::new(), self.request_timeout).await?;
        Ok(())
    }
}

/// Blocking librdkafka metadata call, run off the async workers. An empty
/// `topics` asks for every topic.
async fn fetch_metadata(
    producer: FutureProducer,
    topics: Vec<String>,
    timeout: Duration,
) -> Result<ClusterMetadata> {
    tokio::task::spawn_blocking(move || -> Result<ClusterMetadata> {
        let topic = match topics.as_slice() {
            [single] => Some(single.as_str()),
            _ => None,
        };
        let metadata = producer
            .client()
            .fetch_metadata(topic, timeout)
            .map_err(classify)?;
        Ok(convert_metadata(&metadata, &topics))
    })
    .await
    .map_err(|e| Error::Transport(format!("metadata task failed: {}", e)))?
}

fn convert_metadata(metadata: &Metadata, wanted: &[String]) -> ClusterMetadata {
    let brokers = metadata
        .brokers()
        .iter()
        .filter_map(|broker| {
            let port = u16::try_from(broker.port()).ok()?;
            Some((broker.id(), Endpoint::new(broker.host(), port)))
        })
        .collect();

    let topics: HashMap<String, TopicMetadata> = metadata
        .topics()
        .iter()
        .filter(|topic| wanted.is_empty() || wanted.iter().any(|w| w == topic.name()))
        // librdkafka reports unknown topics with an error and no partitions
        .filter(|topic| topic.error().is_none())
        .map(|topic| {
            let partitions = topic
                .partitions()
                .iter()
                .map(|p| PartitionMetadata {
                    id: p.id(),
                    leader: (p.leader() >= 0).then_some(p.leader()),
                })
                .collect();
            (topic.name().to_string(), TopicMetadata { partitions })
        })
        .collect();

    ClusterMetadata { brokers, topics }
}

/// Fills in the partition and size details librdkafka errors don't carry.
/// librdkafka may split one batch over several broker requests, so offsets
/// are only contiguous when every record landed in the same one.
fn produce_response(offsets: Vec<i64>, tp: &TopicPartition) -> Result<ProduceResponse> {
    let base_offset = *offsets
        .first()
        .ok_or_else(|| Error::Protocol(format!("empty produce request for {}", tp)))?;
    let contiguous = offsets
        .iter()
        .enumerate()
        .all(|(i, offset)| *offset == base_offset + i as i64);

    Ok(ProduceResponse {
        record_offsets: (!contiguous).then_some(offsets),
        ..ProduceResponse::new(base_offset)
    })
}

fn for_partition(error: Error, request: &ProduceRequest) -> Error {
    let tp = &request.topic_partition;
    match error {
        Error::NotLeaderForPartition { .. } => Error::NotLeaderForPartition {
            topic: tp.topic.clone(),
            partition: tp.partition,
        },
        Error::UnknownTopicOrPartition { .. } => Error::UnknownTopicOrPartition {
            topic: tp.topic.clone(),
            partition: tp.partition,
        },
        Error::MessageTooLarge { max, .. } => Error::MessageTooLarge {
            size: request.size(),
            max,
        },
        other => other,
    }
}

/// Maps a librdkafka error onto the producer's error taxonomy.
pub fn classify(error: KafkaError) -> Error {
    let Some(code) = error.rdkafka_error_code() else {
        return Error::Kafka(error);
    };

    match code {
        RDKafkaErrorCode::NotLeaderForPartition | RDKafkaErrorCode::LeaderNotAvailable => {
            Error::NotLeaderForPartition {
                topic: String::new(),
                partition: -1,
            }
        }
        RDKafkaErrorCode::UnknownTopicOrPartition
        | RDKafkaErrorCode::UnknownPartition
        | RDKafkaErrorCode::UnknownTopic => Error::UnknownTopicOrPartition {
            topic: String::new(),
            partition: -1,
        },
        RDKafkaErrorCode::MessageSizeTooLarge => Error::MessageTooLarge { size: 0, max: 0 },
        RDKafkaErrorCode::Authentication | RDKafkaErrorCode::SaslAuthenticationFailed => {
            Error::Authentication(error.to_string())
        }
        RDKafkaErrorCode::SSL => Error::Tls(error.to_string()),
        RDKafkaErrorCode::BrokerTransportFailure
        | RDKafkaErrorCode::AllBrokersDown
        | RDKafkaErrorCode::NetworkException
        | RDKafkaErrorCode::RequestTimedOut
        | RDKafkaErrorCode::MessageTimedOut => Error::Transport(error.to_string()),
        RDKafkaErrorCode::ThrottlingQuotaExceeded => Error::Throttled { throttle_ms: 0 },
        _ => Error::Kafka(error),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{SaslMechanism, SecurityProtocol};

    #[test]
    fn test_produce_response_offsets() {
        let tp = TopicPartition::new("events", 0);

        let response = produce_response(vec![7, 8, 9], &tp).unwrap();
        assert_eq!(response, ProduceResponse::new(7));

        // Another producer wrote between two requests of the same batch
        let response = produce_response(vec![7, 8, 12], &tp).unwrap();
        assert_eq!(response.base_offset, 7);
        assert_eq!(response.offset_of(2), 12);

        let err = produce_response(Vec::new(), &tp).unwrap_err();
        assert!(matches!(err, Error::Protocol(_)));
    }

    #[test]
    fn test_classify_broker_errors() {
        let err = classify(KafkaError::MessageProduction(RDKafkaErrorCode::NotLeaderForPartition));
        assert!(matches!(err, Error::NotLeaderForPartition { .. }));

        let err = classify(KafkaError::MessageProduction(RDKafkaErrorCode::MessageSizeTooLarge));
        assert!(matches!(err, Error::MessageTooLarge { .. }));

        let err = classify(KafkaError::MessageProduction(RDKafkaErrorCode::AllBrokersDown));
        assert!(matches!(err, Error::Transport(_)));

        let err = classify(KafkaError::MessageProduction(
            RDKafkaErrorCode::SaslAuthenticationFailed,
        ));
        assert!(err.is_fatal());

        let err = classify(KafkaError::MessageProduction(RDKafkaErrorCode::InvalidRecord));
        assert!(matches!(err, Error::Kafka(_)));
    }

    #[test]
    fn test_client_config_carries_security_settings() {
        let transport = RdKafkaTransport::new(&ProducerConfig::default());
        let security = SecuritySettings {
            protocol: SecurityProtocol::SaslSsl,
            mechanism: Some(SaslMechanism::ScramSha512),
            username: Some("svc".to_string()),
            password: Some("secret".to_string()),
        };

        let config = transport.client_config(&Endpoint::new("broker-1", 9093), &security);

        assert_eq!(config.get("bootstrap.servers"), Some("broker-1:9093"));
        assert_eq!(config.get("security.protocol"), Some("sasl_ssl"));
        assert_eq!(config.get("sasl.mechanism"), Some("SCRAM-SHA-512"));
        assert_eq!(config.get("sasl.username"), Some("svc"));
        assert_eq!(config.get("acks"), Some("all"));
        assert_eq!(config.get("max.in.flight.requests.per.connection"), Some("1"));
    }
}
