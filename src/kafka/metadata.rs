use super::connection::ConnectionManager;
use super::record::TopicPartition;
use super::transport::{ClusterMetadata, Endpoint};
use crate::{Error, Result};
use futures::future::{BoxFuture, FutureExt, Shared};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

#[derive(Debug, Clone)]
struct PartitionLeader {
    id: i32,
    leader: Option<Endpoint>,
}

#[derive(Debug, Clone)]
struct TopicEntry {
    partitions: Vec<PartitionLeader>,
    fetched_at: Instant,
}

/// Immutable view of what we know about the cluster. Replaced wholesale,
/// never edited in place.
#[derive(Debug, Clone, Default)]
struct Snapshot {
    topics: HashMap<String, TopicEntry>,
}

type RefreshFuture = Shared<BoxFuture<'static, Result<()>>>;

struct Inner {
    connections: Arc<ConnectionManager>,
    ttl: Duration,
    snapshot: RwLock<Arc<Snapshot>>,
    /// Refresh currently running for a topic, tagged with its id.
    inflight: Mutex<HashMap<String, (u64, RefreshFuture)>>,
    next_refresh_id: AtomicU64,
}

/// TTL cache of partition leadership with coalesced refreshes.
#[derive(Clone)]
pub struct MetadataCache {
    inner: Arc<Inner>,
}

impl MetadataCache {
    pub fn new(connections: Arc<ConnectionManager>, ttl: Duration) -> Self {
        Self {
            inner: Arc::new(Inner {
                connections,
                ttl,
                snapshot: RwLock::new(Arc::new(Snapshot::default())),
                inflight: Mutex::new(HashMap::new()),
                next_refresh_id: AtomicU64::new(0),
            }),
        }
    }

    /// Current leader of `topic`/`partition`, refreshing first when the
    /// cached entry is missing or older than the TTL.
    pub async fn leader_for(&self, topic: &str, partition: i32) -> Result<Endpoint> {
        let entry = self.fresh_or_refresh(topic).await?;

        let leader = entry
            .partitions
            .iter()
            .find(|p| p.id == partition)
            .ok_or_else(|| Error::UnknownTopicOrPartition {
                topic: topic.to_string(),
                partition,
            })?;

        match &leader.leader {
            Some(endpoint) => Ok(endpoint.clone()),
            None => {
                // Election in progress; force a refresh next time
                self.invalidate(topic);
                Err(Error::NotLeaderForPartition {
                    topic: topic.to_string(),
                    partition,
                })
            }
        }
    }

    /// Partition count of `topic`.
    ///
    /// A stale entry is still answered from the cache (partition counts
    /// only grow) while a refresh runs in the background; only a topic never
    /// seen before waits for the round-trip.
    pub async fn partition_count(&self, topic: &str) -> Result<u32> {
        if let Some(entry) = self.snapshot().topics.get(topic) {
            if entry.fetched_at.elapsed() >= self.inner.ttl {
                let cache = self.clone();
                let topics = vec![topic.to_string()];
                tokio::spawn(async move {
                    if let Err(e) = cache.refresh(&topics).await {
                        warn!("Background metadata refresh failed: {}", e);
                    }
                });
            }
            return Ok(entry.partitions.len() as u32);
        }

        let entry = self.fresh_or_refresh(topic).await?;
        Ok(entry.partitions.len() as u32)
    }

    /// One metadata round-trip for `topics`, atomically replacing their
    /// cached entries. Topics already being refreshed by another caller are
    /// not fetched again; this call waits on that request instead.
    pub async fn refresh(&self, topics: &[String]) -> Result<()> {
        let mut waits: Vec<(u64, RefreshFuture)> = Vec::new();

        {
            let mut inflight = self.lock_inflight();
            let mut missing: Vec<String> = Vec::new();

            for topic in topics {
                match inflight.get(topic) {
                    Some((id, fut)) => {
                        if !waits.iter().any(|(w, _)| w == id) {
                            waits.push((*id, fut.clone()));
                        }
                    }
                    None => {
                        if !missing.contains(topic) {
                            missing.push(topic.clone());
                        }
                    }
                }
            }

            if !missing.is_empty() {
                let id = self.inner.next_refresh_id.fetch_add(1, Ordering::Relaxed);
                let inner = Arc::clone(&self.inner);
                let fetch = missing.clone();
                let fut = async move {
                    let result = inner.fetch_and_replace(&fetch).await;
                    let mut inflight = inner.inflight.lock().unwrap_or_else(PoisonError::into_inner);
                    for topic in &fetch {
                        if matches!(inflight.get(topic), Some((owner, _)) if *owner == id) {
                            inflight.remove(topic);
                        }
                    }
                    result
                }
                .boxed()
                .shared();

                for topic in missing {
                    inflight.insert(topic, (id, fut.clone()));
                }
                waits.push((id, fut));
            } else {
                debug!(?topics, "Joining in-flight metadata refresh");
            }
        }

        for (_, fut) in waits {
            fut.await?;
        }
        Ok(())
    }

    /// Drops the cached entry for `topic`; the next lookup goes to the broker.
    pub fn invalidate(&self, topic: &str) {
        let mut snapshot = self.inner.snapshot.write().unwrap_or_else(PoisonError::into_inner);
        if snapshot.topics.contains_key(topic) {
            let mut next = Snapshot::clone(&snapshot);
            next.topics.remove(topic);
            *snapshot = Arc::new(next);
            debug!(topic, "Invalidated cached metadata");
        }
    }

    /// Partitions whose cached leader is `endpoint`.
    pub fn topics_led_by(&self, endpoint: &Endpoint) -> Vec<TopicPartition> {
        let snapshot = self.snapshot();
        let mut led: Vec<TopicPartition> = snapshot
            .topics
            .iter()
            .flat_map(|(topic, entry)| {
                entry
                    .partitions
                    .iter()
                    .filter(|p| p.leader.as_ref() == Some(endpoint))
                    .map(move |p| TopicPartition::new(topic.clone(), p.id))
            })
            .collect();
        led.sort();
        led
    }

    async fn fresh_or_refresh(&self, topic: &str) -> Result<TopicEntry> {
        if let Some(entry) = self.fresh_entry(topic) {
            return Ok(entry);
        }

        self.refresh(&[topic.to_string()]).await?;

        self.fresh_entry(topic)
            .ok_or_else(|| Error::UnknownTopicOrPartition {
                topic: topic.to_string(),
                partition: -1,
            })
    }

    fn fresh_entry(&self, topic: &str) -> Option<TopicEntry> {
        self.snapshot()
            .topics
            .get(topic)
            .filter(|entry| entry.fetched_at.elapsed() < self.inner.ttl)
            .cloned()
    }

    fn snapshot(&self) -> Arc<Snapshot> {
        let snapshot = self.inner.snapshot.read().unwrap_or_else(PoisonError::into_inner);
        Arc::clone(&snapshot)
    }

    fn lock_inflight(&self) -> std::sync::MutexGuard<'_, HashMap<String, (u64, RefreshFuture)>> {
        self.inner.inflight.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Inner {
    async fn fetch_and_replace(&self, topics: &[String]) -> Result<()> {
        let metadata = self.connections.fetch_metadata(topics).await?;
        self.replace(topics, &metadata);
        Ok(())
    }

    fn replace(&self, topics: &[String], metadata: &ClusterMetadata) {
        let now = Instant::now();
        let mut snapshot = self.snapshot.write().unwrap_or_else(PoisonError::into_inner);
        let mut next = Snapshot::clone(&snapshot);

        for topic in topics {
            match metadata.topics.get(topic) {
                Some(topic_metadata) => {
                    let mut partitions: Vec<PartitionLeader> = topic_metadata
                        .partitions
                        .iter()
                        .map(|p| PartitionLeader {
                            id: p.id,
                            leader: p.leader.and_then(|id| metadata.brokers.get(&id).cloned()),
                        })
                        .collect();
                    partitions.sort_by_key(|p| p.id);

                    info!(
                        topic = %topic,
                        partitions = partitions.len(),
                        "Refreshed topic metadata"
                    );
                    next.topics.insert(
                        topic.clone(),
                        TopicEntry {
                            partitions,
                            fetched_at: now,
                        },
                    );
                }
                None => {
                    warn!(topic = %topic, "Topic not present in cluster metadata");
                    next.topics.remove(topic);
                }
            }
        }

        *snapshot = Arc::new(next);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ProducerConfig, SecuritySettings};
    use crate::kafka::mock::MockTransport;

    const TTL: Duration = Duration::from_secs(300);

    fn cache_for(mock: &MockTransport) -> MetadataCache {
        let connections = Arc::new(ConnectionManager::new(
            Arc::new(mock.clone()),
            SecuritySettings::default(),
            vec!["broker-0:9092".parse().unwrap()],
            &ProducerConfig::default(),
        ));
        MetadataCache::new(connections, TTL)
    }

    fn two_broker_cluster() -> MockTransport {
        MockTransport::new()
            .with_broker(0, "broker-0:9092")
            .with_broker(1, "broker-1:9092")
            .with_topic("events", 4)
            .with_topic("audit", 1)
            .with_topic("orders", 2)
    }

    #[tokio::test(start_paused = true)]
    async fn test_leader_lookup_is_cached() {
        let mock = two_broker_cluster();
        let cache = cache_for(&mock);

        let leader = cache.leader_for("events", 1).await.unwrap();
        assert_eq!(leader.to_string(), "broker-1:9092");
        let leader = cache.leader_for("events", 2).await.unwrap();
        assert_eq!(leader.to_string(), "broker-0:9092");

        assert_eq!(mock.metadata_requests(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_entries_expire_after_ttl() {
        let mock = two_broker_cluster();
        let cache = cache_for(&mock);

        cache.leader_for("events", 0).await.unwrap();
        tokio::time::advance(TTL + Duration::from_secs(1)).await;
        cache.leader_for("events", 0).await.unwrap();

        assert_eq!(mock.metadata_requests(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_stale_lookups_share_one_refresh() {
        let mock = two_broker_cluster();
        mock.set_latency(Duration::from_millis(20));
        let cache = cache_for(&mock);

        cache.leader_for("events", 0).await.unwrap();
        assert_eq!(mock.metadata_requests(), 1);

        tokio::time::advance(TTL + Duration::from_secs(1)).await;
        let (a, b) = tokio::join!(cache.leader_for("events", 0), cache.leader_for("events", 3));

        assert!(a.is_ok());
        assert!(b.is_ok());
        assert_eq!(mock.metadata_requests(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_overlapping_refreshes_fetch_each_topic_once() {
        let mock = two_broker_cluster();
        mock.set_latency(Duration::from_millis(20));
        let cache = cache_for(&mock);

        let first = vec!["events".to_string(), "audit".to_string()];
        let second = vec!["audit".to_string(), "orders".to_string()];
        let (a, b) = tokio::join!(cache.refresh(&first), cache.refresh(&second));
        a.unwrap();
        b.unwrap();

        // One request for events+audit, one for orders only
        assert_eq!(mock.metadata_requests(), 2);
        assert_eq!(cache.partition_count("orders").await.unwrap(), 2);
        assert_eq!(mock.metadata_requests(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_invalidate_picks_up_new_leader() {
        let mock = two_broker_cluster();
        let cache = cache_for(&mock);

        assert_eq!(cache.leader_for("events", 0).await.unwrap().to_string(), "broker-0:9092");
        mock.set_leader("events", 0, 1);

        // Still cached
        assert_eq!(cache.leader_for("events", 0).await.unwrap().to_string(), "broker-0:9092");

        cache.invalidate("events");
        assert_eq!(cache.leader_for("events", 0).await.unwrap().to_string(), "broker-1:9092");
        assert_eq!(mock.metadata_requests(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unknown_topic_and_partition() {
        let mock = two_broker_cluster();
        let cache = cache_for(&mock);

        let err = cache.leader_for("missing", 0).await.unwrap_err();
        assert_eq!(
            err,
            Error::UnknownTopicOrPartition {
                topic: "missing".to_string(),
                partition: -1
            }
        );

        let err = cache.leader_for("audit", 7).await.unwrap_err();
        assert_eq!(
            err,
            Error::UnknownTopicOrPartition {
                topic: "audit".to_string(),
                partition: 7
            }
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_topics_led_by() {
        let mock = two_broker_cluster();
        let cache = cache_for(&mock);
        cache.refresh(&["events".to_string()]).await.unwrap();

        let led = cache.topics_led_by(&"broker-1:9092".parse().unwrap());
        assert_eq!(
            led,
            vec![TopicPartition::new("events", 1), TopicPartition::new("events", 3)]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_stale_partition_count_served_from_cache() {
        let mock = two_broker_cluster();
        let cache = cache_for(&mock);

        assert_eq!(cache.partition_count("events").await.unwrap(), 4);
        tokio::time::advance(TTL + Duration::from_secs(1)).await;
        assert_eq!(cache.partition_count("events").await.unwrap(), 4);
    }
}
