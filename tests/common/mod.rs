#![allow(dead_code)]

use kafka_courier::config::{Config, ProducerConfig, SaslMechanism, SecurityProtocol};
use kafka_courier::kafka::MockTransport;
use kafka_courier::ProducerClient;
use std::env;
use std::sync::Arc;

pub const TOPIC: &str = "events";

/// Two brokers; partitions of `events` alternate between them
/// (0 and 2 on broker-0, 1 and 3 on broker-1).
pub fn two_broker_cluster() -> MockTransport {
    MockTransport::new()
        .with_broker(0, "broker-0:9092")
        .with_broker(1, "broker-1:9092")
        .with_topic(TOPIC, 4)
}

pub fn get_test_config(producer: ProducerConfig) -> Config {
    Config {
        brokers: vec!["broker-0:9092".to_string(), "broker-1:9092".to_string()],
        topic: TOPIC.to_string(),
        security_protocol: SecurityProtocol::Plaintext,
        sasl_mechanism: None,
        sasl_username: None,
        sasl_password: None,
        producer,
    }
}

pub fn sasl_config(username: &str, password: &str) -> Config {
    Config {
        security_protocol: SecurityProtocol::SaslPlaintext,
        sasl_mechanism: Some(SaslMechanism::ScramSha256),
        sasl_username: Some(username.to_string()),
        sasl_password: Some(password.to_string()),
        ..get_test_config(ProducerConfig::default())
    }
}

pub fn tls_config(producer: ProducerConfig) -> Config {
    Config {
        security_protocol: SecurityProtocol::Ssl,
        ..get_test_config(producer)
    }
}

pub async fn open_producer(mock: &MockTransport, producer: ProducerConfig) -> ProducerClient {
    ProducerClient::open(get_test_config(producer), Arc::new(mock.clone()))
        .await
        .expect("Failed to open producer")
}

/// Configuration for tests against a real broker, from `TEST_KAFKA_*`
/// environment variables.
pub fn get_kafka_test_config() -> Config {
    Config {
        brokers: env::var("TEST_KAFKA_BROKERS")
            .unwrap_or_else(|_| "localhost:9092".to_string())
            .split(',')
            .map(|s| s.trim().to_string())
            .collect(),
        topic: env::var("TEST_KAFKA_TOPIC")
            .unwrap_or_else(|_| format!("kafka_courier_test_{}", std::process::id())),
        security_protocol: SecurityProtocol::Plaintext,
        sasl_mechanism: None,
        sasl_username: None,
        sasl_password: None,
        producer: ProducerConfig {
            linger_ms: 5,
            ..Default::default()
        },
    }
}

pub fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter("kafka_courier=debug")
        .try_init()
        .ok();
}
