//! In-memory Kafka cluster implementing [`Transport`].
//!
//! Brokers, partition leadership and per-partition logs live behind one
//! lock; offsets are assigned on append exactly like a broker log would.
//! Faults are scripted per call so retry, reconnect and failover paths can
//! be driven deterministically.
//!
//! # Example
//!
//! ```rust
//! use kafka_courier::kafka::MockTransport;
//!
//! let mock = MockTransport::new()
//!     .with_broker(0, "broker-0:9092")
//!     .with_broker(1, "broker-1:9092")
//!     .with_topic("events", 4);
//!
//! // Partition 1 moves to broker 0; stale leaders get NotLeaderForPartition
//! mock.set_leader("events", 1, 0);
//! assert_eq!(mock.leader_of("events", 1), Some(0));
//! ```

use super::record::Record;
use super::transport::{
    ClusterMetadata, Endpoint, PartitionMetadata, ProduceRequest, ProduceResponse, Session,
    TopicMetadata, Transport,
};
use crate::config::SecuritySettings;
use crate::{Error, Result};
use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

#[derive(Default)]
struct MockPartition {
    leader: i32,
    log: Vec<Record>,
}

#[derive(Default)]
struct MockCluster {
    brokers: BTreeMap<i32, Endpoint>,
    topics: HashMap<String, Vec<MockPartition>>,
    unreachable: HashSet<Endpoint>,
    connect_faults: VecDeque<Error>,
    produce_faults: VecDeque<Error>,
    credentials: Option<(String, String)>,
    tls_failure: Option<String>,
    max_message_bytes: Option<usize>,
    latency: Duration,
    connects: usize,
    metadata_requests: usize,
    produce_requests: usize,
    reauthentications: usize,
}

/// Shared handle to an in-memory cluster. Clones observe the same state.
#[derive(Clone, Default)]
pub struct MockTransport {
    cluster: Arc<Mutex<MockCluster>>,
}

impl MockTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// One broker (`broker-0:9092`, id 0) leading every partition of `topic`.
    pub fn single_broker(topic: &str, partitions: usize) -> Self {
        Self::new()
            .with_broker(0, "broker-0:9092")
            .with_topic(topic, partitions)
    }

    /// # Panics
    ///
    /// Panics if `address` is not `host:port`.
    pub fn with_broker(self, id: i32, address: &str) -> Self {
        let endpoint: Endpoint = address.parse().expect("mock broker address");
        self.lock().brokers.insert(id, endpoint);
        self
    }

    /// Adds a topic whose leaders are spread round-robin over the brokers
    /// registered so far.
    pub fn with_topic(self, topic: &str, partitions: usize) -> Self {
        {
            let mut cluster = self.lock();
            let ids: Vec<i32> = cluster.brokers.keys().copied().collect();
            let partitions = (0..partitions)
                .map(|p| MockPartition {
                    leader: if ids.is_empty() { 0 } else { ids[p % ids.len()] },
                    log: Vec::new(),
                })
                .collect();
            cluster.topics.insert(topic.to_string(), partitions);
        }
        self
    }

    pub fn set_leader(&self, topic: &str, partition: i32, broker: i32) {
        let mut cluster = self.lock();
        if let Some(p) = cluster
            .topics
            .get_mut(topic)
            .and_then(|parts| parts.get_mut(partition as usize))
        {
            p.leader = broker;
        }
    }

    pub fn leader_of(&self, topic: &str, partition: i32) -> Option<i32> {
        let cluster = self.lock();
        cluster
            .topics
            .get(topic)
            .and_then(|parts| parts.get(partition as usize))
            .map(|p| p.leader)
    }

    pub fn set_unreachable(&self, address: &str, unreachable: bool) {
        let Ok(endpoint) = address.parse::<Endpoint>() else {
            return;
        };
        let mut cluster = self.lock();
        if unreachable {
            cluster.unreachable.insert(endpoint);
        } else {
            cluster.unreachable.remove(&endpoint);
        }
    }

    pub fn fail_next_connects(&self, count: usize, error: Error) {
        let mut cluster = self.lock();
        for _ in 0..count {
            cluster.connect_faults.push_back(error.clone());
        }
    }

    pub fn fail_next_produce(&self, error: Error) {
        self.lock().produce_faults.push_back(error);
    }

    /// Requires SASL with these credentials on every connect.
    pub fn require_credentials(&self, username: &str, password: &str) {
        self.lock().credentials = Some((username.to_string(), password.to_string()));
    }

    /// Fails every TLS handshake from now on, e.g. an expired broker
    /// certificate. Plaintext connects are unaffected.
    pub fn reject_tls(&self, reason: &str) {
        self.lock().tls_failure = Some(reason.to_string());
    }

    pub fn set_max_message_bytes(&self, max: usize) {
        self.lock().max_message_bytes = Some(max);
    }

    /// Delay applied to every produce and metadata request.
    pub fn set_latency(&self, latency: Duration) {
        self.lock().latency = latency;
    }

    pub fn log(&self, topic: &str, partition: i32) -> Vec<Record> {
        let cluster = self.lock();
        cluster
            .topics
            .get(topic)
            .and_then(|parts| parts.get(partition as usize))
            .map(|p| p.log.clone())
            .unwrap_or_default()
    }

    pub fn connect_count(&self) -> usize {
        self.lock().connects
    }

    pub fn metadata_requests(&self) -> usize {
        self.lock().metadata_requests
    }

    pub fn produce_requests(&self) -> usize {
        self.lock().produce_requests
    }

    pub fn reauthentications(&self) -> usize {
        self.lock().reauthentications
    }

    fn lock(&self) -> MutexGuard<'_, MockCluster> {
        self.cluster.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn latency(&self) -> Duration {
        self.lock().latency
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn connect(
        &self,
        endpoint: &Endpoint,
        security: &SecuritySettings,
    ) -> Result<Box<dyn Session>> {
        let mut cluster = self.lock();
        cluster.connects += 1;

        if let Some(fault) = cluster.connect_faults.pop_front() {
            return Err(fault);
        }

        if cluster.unreachable.contains(endpoint) {
            return Err(Error::Transport(format!("connection refused by {}", endpoint)));
        }

        let broker_id = cluster
            .brokers
            .iter()
            .find(|(_, e)| *e == endpoint)
            .map(|(id, _)| *id)
            .ok_or_else(|| Error::Transport(format!("no broker listening on {}", endpoint)))?;

        if let Some(reason) = &cluster.tls_failure {
            if security.protocol.uses_tls() {
                return Err(Error::Tls(format!("handshake with {} failed: {}", endpoint, reason)));
            }
        }

        if let Some((username, password)) = &cluster.credentials {
            if !security.protocol.uses_sasl() || security.mechanism.is_none() {
                return Err(Error::Authentication(
                    "broker requires SASL authentication".to_string(),
                ));
            }
            if security.username.as_deref() != Some(username.as_str())
                || security.password.as_deref() != Some(password.as_str())
            {
                return Err(Error::Authentication(format!(
                    "invalid credentials for user {:?}",
                    security.username
                )));
            }
        }

        Ok(Box::new(MockSession {
            endpoint: endpoint.clone(),
            broker_id,
            transport: self.clone(),
        }))
    }
}

struct MockSession {
    endpoint: Endpoint,
    broker_id: i32,
    transport: MockTransport,
}

#[async_trait]
impl Session for MockSession {
    fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    async fn produce(&mut self, request: &ProduceRequest) -> Result<ProduceResponse> {
        let latency = self.transport.latency();
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }

        let mut cluster = self.transport.lock();
        cluster.produce_requests += 1;

        if let Some(fault) = cluster.produce_faults.pop_front() {
            return Err(fault);
        }

        if cluster.unreachable.contains(&self.endpoint) {
            return Err(Error::Transport(format!("connection to {} reset", self.endpoint)));
        }

        let size = request.size();
        if let Some(max) = cluster.max_message_bytes {
            if size > max {
                return Err(Error::MessageTooLarge { size, max });
            }
        }

        let tp = &request.topic_partition;
        let partition = cluster
            .topics
            .get_mut(&tp.topic)
            .and_then(|parts| parts.get_mut(tp.partition as usize))
            .ok_or_else(|| Error::UnknownTopicOrPartition {
                topic: tp.topic.clone(),
                partition: tp.partition,
            })?;

        if partition.leader != self.broker_id {
            return Err(Error::NotLeaderForPartition {
                topic: tp.topic.clone(),
                partition: tp.partition,
            });
        }

        let base_offset = partition.log.len() as i64;
        partition.log.extend(request.records.iter().cloned());

        Ok(ProduceResponse::new(base_offset))
    }

    async fn metadata(&mut self, topics: &[String]) -> Result<ClusterMetadata> {
        let latency = self.transport.latency();
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }

        let mut cluster = self.transport.lock();
        cluster.metadata_requests += 1;

        if cluster.unreachable.contains(&self.endpoint) {
            return Err(Error::Transport(format!("connection to {} reset", self.endpoint)));
        }

        let wanted = |name: &String| topics.is_empty() || topics.contains(name);
        let topics = cluster
            .topics
            .iter()
            .filter(|(name, _)| wanted(name))
            .map(|(name, parts)| {
                let partitions = parts
                    .iter()
                    .enumerate()
                    .map(|(id, p)| PartitionMetadata {
                        id: id as i32,
                        leader: Some(p.leader),
                    })
                    .collect();
                (name.clone(), TopicMetadata { partitions })
            })
            .collect();

        Ok(ClusterMetadata {
            brokers: cluster.brokers.iter().map(|(id, e)| (*id, e.clone())).collect(),
            topics,
        })
    }

    async fn reauthenticate(&mut self) -> Result<()> {
        self.transport.lock().reauthentications += 1;
        Ok(())
    }
}
