use super::accumulator::{Batch, BatchAccumulator};
use super::connection::{Backoff, ConnectionManager};
use super::librdkafka::RdKafkaTransport;
use super::metadata::MetadataCache;
use super::partitioner::Partitioner;
use super::record::{Record, TopicPartition};
use super::tracker::{DeliveryFuture, DeliveryTracker};
use super::transport::{Endpoint, ProduceRequest, ProduceResponse, Transport};
use crate::config::{Config, ProducerConfig};
use crate::{Error, Result};
use serde::Serialize;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::{mpsc, watch, Notify, OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, instrument, warn};

/// A batch handed from the dispatcher to a worker. Its completions are
/// already registered with the tracker under `sequence`.
struct Job {
    topic_partition: TopicPartition,
    sequence: u64,
    records: Vec<Record>,
}

#[derive(Default)]
struct Counters {
    records_sent: AtomicU64,
    batches_sent: AtomicU64,
    retries: AtomicU64,
}

/// Point-in-time producer statistics.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProducerStats {
    pub records_sent: u64,
    pub records_delivered: u64,
    pub records_failed: u64,
    pub batches_sent: u64,
    pub retries: u64,
    pub pending: usize,
    pub buffer_available: usize,
}

struct ProducerInner {
    config: ProducerConfig,
    connections: Arc<ConnectionManager>,
    metadata: MetadataCache,
    accumulator: BatchAccumulator,
    tracker: DeliveryTracker,
    partitioner: Partitioner,
    memory: Arc<Semaphore>,
    backoff: Backoff,
    /// Wakes the dispatcher when a batch is sealed or a slot frees up.
    ready: Notify,
    shutdown: watch::Sender<bool>,
    closed: AtomicBool,
    fatal: Mutex<Option<Error>>,
    tasks: Mutex<Option<Vec<JoinHandle<()>>>>,
    counters: Counters,
}

/// Asynchronous, batching Kafka producer.
///
/// Cheap to clone; all clones share one set of background tasks. Call
/// [`close`](Self::close) when done, otherwise the background tasks keep
/// running until the runtime shuts down.
///
/// # Example
///
/// ```rust,no_run
/// use kafka_courier::kafka::Record;
/// use kafka_courier::{Config, ProducerClient};
///
/// # async fn run() -> kafka_courier::Result<()> {
/// let config = Config::from_file("config.json")?;
/// let producer = ProducerClient::connect(config).await?;
///
/// let delivery = producer.send(Record::new("events", "hello")).await?;
/// let metadata = delivery.await?;
/// println!("written at {}/{}", metadata.partition, metadata.offset);
///
/// producer.close().await
/// # }
/// ```
#[derive(Clone)]
pub struct ProducerClient {
    inner: Arc<ProducerInner>,
}

impl ProducerClient {
    /// Connects through librdkafka.
    pub async fn connect(config: Config) -> Result<Self> {
        let transport = Arc::new(RdKafkaTransport::new(&config.producer));
        Self::open(config, transport).await
    }

    /// Builds a producer on top of `transport` and starts its dispatcher and
    /// I/O workers.
    ///
    /// Metadata for the configured topic is fetched eagerly; authentication
    /// and TLS failures surface here.
    pub async fn open(config: Config, transport: Arc<dyn Transport>) -> Result<Self> {
        config.validate()?;

        let producer_config = config.producer.clone();
        let connections = Arc::new(ConnectionManager::new(
            transport,
            config.security(),
            config.bootstrap_endpoints()?,
            &producer_config,
        ));
        let metadata = MetadataCache::new(Arc::clone(&connections), producer_config.metadata_ttl());

        match metadata.refresh(&[config.topic.clone()]).await {
            Ok(()) => {}
            Err(e) if e.is_fatal() => {
                error!("Failed to connect to Kafka: {}", e);
                connections.close();
                return Err(e);
            }
            Err(e) => warn!(topic = %config.topic, "Initial metadata fetch failed: {}", e),
        }

        let (shutdown, _) = watch::channel(false);
        let inner = Arc::new(ProducerInner {
            accumulator: BatchAccumulator::from_config(&producer_config),
            tracker: DeliveryTracker::new(producer_config.enable_ordering),
            partitioner: Partitioner::new(),
            memory: Arc::new(Semaphore::new(producer_config.buffer_memory)),
            backoff: Backoff::from_config(&producer_config),
            ready: Notify::new(),
            shutdown,
            closed: AtomicBool::new(false),
            fatal: Mutex::new(None),
            tasks: Mutex::new(None),
            counters: Counters::default(),
            config: producer_config,
            connections,
            metadata,
        });

        let workers = inner.config.io_workers.max(1);
        let (tx, rx) = mpsc::channel::<Job>(workers * 2);
        let rx = Arc::new(tokio::sync::Mutex::new(rx));

        let mut tasks = Vec::with_capacity(workers + 1);
        tasks.push(tokio::spawn(run_dispatcher(Arc::clone(&inner), tx)));
        for id in 0..workers {
            tasks.push(tokio::spawn(run_worker(Arc::clone(&inner), id, Arc::clone(&rx))));
        }
        *inner.tasks.lock().unwrap_or_else(PoisonError::into_inner) = Some(tasks);

        info!(
            brokers = ?config.brokers,
            topic = %config.topic,
            protocol = config.security_protocol.as_str(),
            workers,
            "Kafka producer started"
        );
        Ok(Self { inner })
    }

    /// Queues `record` and returns a future for its delivery report.
    ///
    /// Only waits when the buffer-memory budget is exhausted (and, for a
    /// topic never seen before, for its first metadata lookup).
    pub async fn send(&self, record: Record) -> Result<DeliveryFuture> {
        let inner = &self.inner;
        if inner.closed.load(Ordering::Acquire) {
            return Err(Error::ClientClosed);
        }

        let size = record.size();
        let max = inner.accumulator.batch_size();
        if size > max {
            return Err(Error::MessageTooLarge { size, max });
        }

        let permit = inner.reserve(size).await?;

        let partition = match record.partition {
            Some(partition) => partition,
            None => {
                let count = inner.metadata.partition_count(&record.topic).await?;
                inner
                    .partitioner
                    .partition(&record.topic, record.key.as_deref(), count)
            }
        };
        let tp = TopicPartition::new(record.topic.clone(), partition);

        let (completion, delivery) = inner.tracker.completion(record.timestamp_ms, Some(permit));
        let outcome = inner.accumulator.append(&tp, record, completion)?;
        inner.counters.records_sent.fetch_add(1, Ordering::Relaxed);

        if let Some(generation) = outcome.new_batch {
            spawn_linger_timer(&self.inner, tp, generation);
        }
        if outcome.batch_ready {
            inner.ready.notify_one();
        }

        Ok(delivery)
    }

    /// Serializes `value` as JSON and sends it.
    pub async fn send_json<T: Serialize>(
        &self,
        topic: &str,
        key: Option<&str>,
        value: &T,
    ) -> Result<DeliveryFuture> {
        let mut record = Record::json(topic, value)?;
        if let Some(key) = key {
            record = record.with_key(key.to_string());
        }
        self.send(record).await
    }

    /// Seals every open batch and waits until every record sent before this
    /// call has its delivery report. Records sent concurrently by other
    /// tasks are not waited for.
    #[instrument(skip(self))]
    pub async fn flush(&self, timeout: Duration) -> Result<()> {
        if let Some(e) = self.inner.fatal_error() {
            return Err(e);
        }

        let watermark = self.inner.tracker.watermark();
        let sealed = self.inner.accumulator.seal_all();
        self.inner.ready.notify_one();
        debug!(sealed, watermark, pending = self.inner.tracker.pending(), "Flushing");

        self.inner.tracker.wait_resolved(watermark, timeout).await
    }

    /// [`close_with_timeout`](Self::close_with_timeout) with the configured
    /// flush timeout.
    pub async fn close(&self) -> Result<()> {
        let timeout = self.inner.config.flush_timeout();
        self.close_with_timeout(timeout).await
    }

    /// Flushes, stops the background tasks and drops every session.
    ///
    /// Records still pending after `timeout` fail with
    /// [`Error::TimedOut`], which is also what this returns. After a fatal
    /// error the fatal error is returned instead.
    #[instrument(skip(self))]
    pub async fn close_with_timeout(&self, timeout: Duration) -> Result<()> {
        let inner = &self.inner;
        inner.closed.store(true, Ordering::Release);

        let Some(tasks) = inner.tasks.lock().unwrap_or_else(PoisonError::into_inner).take() else {
            // Already closed by another clone
            return inner.fatal_error().map_or(Ok(()), Err);
        };

        info!(pending = inner.tracker.pending(), "Closing Kafka producer");
        inner.accumulator.close();

        // The accumulator refuses new records now, so waiting for idle
        // covers every record ever sent
        let flushed = match inner.fatal_error() {
            Some(e) => Err(e),
            None => {
                inner.accumulator.seal_all();
                inner.ready.notify_one();
                inner.tracker.wait_idle(timeout).await
            }
        };

        inner.shutdown.send_replace(true);
        for task in &tasks {
            task.abort();
        }
        for task in tasks {
            let _ = task.await;
        }

        let leftover = Error::timed_out(format!("record not delivered within {:?} of close", timeout));
        let mut failed: usize = inner
            .accumulator
            .abort_all()
            .into_iter()
            .map(|batch| batch.fail(&leftover))
            .sum();
        failed += inner.tracker.fail_all(leftover);
        inner.connections.close();

        if failed > 0 {
            warn!(failed, "Records failed at close");
        }
        info!("Kafka producer closed");

        match inner.fatal_error() {
            Some(e) => Err(e),
            None => flushed,
        }
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    pub fn stats(&self) -> ProducerStats {
        let inner = &self.inner;
        ProducerStats {
            records_sent: inner.counters.records_sent.load(Ordering::Relaxed),
            records_delivered: inner.tracker.delivered(),
            records_failed: inner.tracker.failed(),
            batches_sent: inner.counters.batches_sent.load(Ordering::Relaxed),
            retries: inner.counters.retries.load(Ordering::Relaxed),
            pending: inner.tracker.pending(),
            buffer_available: inner.memory.available_permits(),
        }
    }
}

impl ProducerInner {
    /// Takes `size` bytes of buffer budget, waiting while the buffer is full.
    async fn reserve(&self, size: usize) -> Result<OwnedSemaphorePermit> {
        let permits = u32::try_from(size).map_err(|_| Error::MessageTooLarge {
            size,
            max: u32::MAX as usize,
        })?;

        if self.memory.available_permits() < size {
            debug!(
                size,
                available = self.memory.available_permits(),
                "Buffer full, waiting for deliveries"
            );
        }

        let mut shutdown = self.shutdown.subscribe();
        if *shutdown.borrow_and_update() {
            return Err(Error::ClientClosed);
        }

        tokio::select! {
            permit = Arc::clone(&self.memory).acquire_many_owned(permits) => {
                permit.map_err(|_| Error::ClientClosed)
            }
            _ = shutdown.changed() => Err(Error::ClientClosed),
        }
    }

    async fn transmit(&self, job: Job) {
        let tp = job.topic_partition.clone();
        let sequence = job.sequence;
        let request = ProduceRequest {
            topic_partition: job.topic_partition,
            sequence,
            records: job.records,
            acks: self.config.acks.clone(),
            timeout: self.config.request_timeout(),
        };

        let outcome = self.send_with_retries(&request).await;
        self.counters.batches_sent.fetch_add(1, Ordering::Relaxed);

        match &outcome {
            Ok(response) => debug!(
                topic_partition = %tp,
                sequence,
                records = request.records.len(),
                base_offset = response.base_offset,
                "Batch acknowledged"
            ),
            Err(e) => warn!(
                topic_partition = %tp,
                sequence,
                records = request.records.len(),
                "Batch failed: {}",
                e
            ),
        }

        let failure = outcome.as_ref().err().cloned();
        self.tracker.resolve(&tp, sequence, outcome);
        self.accumulator.complete(&tp);

        match failure {
            Some(e @ Error::ConnectionUnavailable { .. }) => self.fail_queued_for(&e, &tp),
            Some(e) if e.is_fatal() && e != Error::ClientClosed => self.poison(e),
            _ => {}
        }

        self.ready.notify_one();
    }

    async fn send_with_retries(&self, request: &ProduceRequest) -> Result<ProduceResponse> {
        let tp = &request.topic_partition;
        let mut attempt = 0u32;

        loop {
            let result = match self.metadata.leader_for(&tp.topic, tp.partition).await {
                Ok(leader) => self.connections.send(&leader, request).await,
                Err(e) => Err(e),
            };

            let delay = match result {
                Ok(response) => return Ok(response),
                Err(e @ (Error::NotLeaderForPartition { .. } | Error::UnknownTopicOrPartition { .. }))
                    if attempt < self.config.retries =>
                {
                    self.metadata.invalidate(&tp.topic);
                    let delay = self.backoff.delay(attempt);
                    warn!(
                        topic_partition = %tp,
                        attempt = attempt + 1,
                        delay_ms = delay.as_millis() as u64,
                        "Leadership changed, refreshing metadata: {}",
                        e
                    );
                    delay
                }
                Err(Error::Throttled { throttle_ms }) if attempt < self.config.retries => {
                    let delay = Duration::from_millis(throttle_ms).max(self.backoff.delay(attempt));
                    warn!(
                        topic_partition = %tp,
                        attempt = attempt + 1,
                        delay_ms = delay.as_millis() as u64,
                        "Throttled by broker"
                    );
                    delay
                }
                Err(e) => return Err(e),
            };

            attempt += 1;
            self.counters.retries.fetch_add(1, Ordering::Relaxed);
            self.sleep(delay).await?;
        }
    }

    /// Fails the sealed batches of every partition led by an endpoint that
    /// ran out of reconnect attempts.
    fn fail_queued_for(&self, error: &Error, failed_tp: &TopicPartition) {
        let Error::ConnectionUnavailable { endpoint, .. } = error else {
            return;
        };

        let mut partitions = match endpoint.parse::<Endpoint>() {
            Ok(endpoint) => self.metadata.topics_led_by(&endpoint),
            Err(_) => Vec::new(),
        };
        if !partitions.contains(failed_tp) {
            partitions.push(failed_tp.clone());
        }

        let mut failed = 0;
        for batch in self.accumulator.take_sealed(&partitions) {
            failed += batch.len();
            self.fail_in_order(batch, error);
        }

        for topic in partitions.iter().map(|tp| tp.topic.as_str()) {
            self.metadata.invalidate(topic);
        }

        if failed > 0 {
            error!(endpoint = %endpoint, failed, "Failed queued records for unreachable broker");
        }
    }

    /// Resolves a batch that never went out, keeping per-partition order.
    fn fail_in_order(&self, batch: Batch, error: &Error) {
        let tp = batch.topic_partition().clone();
        let sequence = batch.sequence();
        let (_, completions) = batch.into_parts();
        self.tracker.track(&tp, sequence, completions);
        self.tracker.resolve(&tp, sequence, Err(error.clone()));
    }

    /// Closes the producer after an authentication or TLS failure. Every
    /// pending record fails with `error`.
    fn poison(&self, error: Error) {
        {
            let mut fatal = self.fatal.lock().unwrap_or_else(PoisonError::into_inner);
            if fatal.is_some() {
                return;
            }
            *fatal = Some(error.clone());
        }

        error!("Fatal producer error, closing: {}", error);
        self.closed.store(true, Ordering::Release);
        self.shutdown.send_replace(true);

        for batch in self.accumulator.abort_all() {
            batch.fail(&error);
        }
        self.tracker.fail_all(error);
        self.connections.close();
    }

    fn fatal_error(&self) -> Option<Error> {
        self.fatal.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    async fn sleep(&self, delay: Duration) -> Result<()> {
        let mut shutdown = self.shutdown.subscribe();
        if *shutdown.borrow_and_update() {
            return Err(Error::ClientClosed);
        }
        tokio::select! {
            _ = tokio::time::sleep(delay) => Ok(()),
            _ = shutdown.changed() => Err(Error::ClientClosed),
        }
    }
}

/// Seals the batch of `generation` once the linger time has passed.
fn spawn_linger_timer(inner: &Arc<ProducerInner>, tp: TopicPartition, generation: u64) {
    let inner = Arc::clone(inner);
    let mut shutdown = inner.shutdown.subscribe();

    tokio::spawn(async move {
        tokio::select! {
            _ = tokio::time::sleep(inner.accumulator.linger()) => {
                if inner.accumulator.seal_expired(&tp, generation) {
                    debug!(topic_partition = %tp, generation, "Linger expired");
                    inner.ready.notify_one();
                }
            }
            _ = shutdown.changed() => {}
        }
    });
}

async fn run_dispatcher(inner: Arc<ProducerInner>, tx: mpsc::Sender<Job>) {
    let mut shutdown = inner.shutdown.subscribe();
    debug!("Dispatcher started");

    loop {
        if *shutdown.borrow_and_update() {
            break;
        }

        for batch in inner.accumulator.drain_ready() {
            let topic_partition = batch.topic_partition().clone();
            let sequence = batch.sequence();
            debug!(
                topic_partition = %topic_partition,
                sequence,
                records = batch.len(),
                bytes = batch.size_bytes(),
                age_ms = batch.age().as_millis() as u64,
                "Dispatching batch"
            );

            let (records, completions) = batch.into_parts();
            inner.tracker.track(&topic_partition, sequence, completions);

            let job = Job {
                topic_partition,
                sequence,
                records,
            };
            if tx.send(job).await.is_err() {
                return;
            }
        }

        tokio::select! {
            _ = inner.ready.notified() => {}
            _ = shutdown.changed() => {}
        }
    }

    debug!("Dispatcher stopped");
}

async fn run_worker(
    inner: Arc<ProducerInner>,
    id: usize,
    jobs: Arc<tokio::sync::Mutex<mpsc::Receiver<Job>>>,
) {
    debug!(worker = id, "I/O worker started");

    loop {
        let job = { jobs.lock().await.recv().await };
        match job {
            Some(job) => inner.transmit(job).await,
            None => break,
        }
    }

    debug!(worker = id, "I/O worker stopped");
}
