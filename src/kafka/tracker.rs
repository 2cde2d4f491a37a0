//! Per-record delivery bookkeeping.
//!
//! Every record handed to `send` gets a [`Completion`] (kept with the record
//! inside its batch) and a [`DeliveryFuture`] (returned to the caller). The
//! completion fires exactly once: with the broker's answer, with the error
//! that failed its batch, or with [`Error::ClientClosed`] if it is dropped
//! unresolved.

use super::accumulator::BatchState;
use super::record::{DeliveryResult, RecordMetadata, TopicPartition};
use super::transport::ProduceResponse;
use crate::{Error, Result};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::sync::{oneshot, watch, OwnedSemaphorePermit};
use tracing::{debug, warn};

/// Resolves one record's [`DeliveryFuture`].
///
/// Holds the record's share of the buffer-memory budget until resolved.
pub struct Completion {
    tx: Option<oneshot::Sender<DeliveryResult>>,
    permit: Option<OwnedSemaphorePermit>,
    timestamp_ms: i64,
    id: u64,
    outstanding: Arc<watch::Sender<Outstanding>>,
}

impl Completion {
    pub fn complete(mut self, result: DeliveryResult) {
        if let Some(tx) = self.tx.take() {
            // Caller may have dropped the future; nothing to report then
            let _ = tx.send(result);
        }
    }
}

impl Drop for Completion {
    fn drop(&mut self) {
        if let Some(tx) = self.tx.take() {
            let _ = tx.send(Err(Error::ClientClosed));
        }
        drop(self.permit.take());
        let id = self.id;
        self.outstanding.send_modify(|outstanding| {
            outstanding.ids.remove(&id);
        });
    }
}

/// Resolves to the record's [`DeliveryResult`].
#[must_use = "dropping a DeliveryFuture discards the delivery report"]
pub struct DeliveryFuture {
    rx: oneshot::Receiver<DeliveryResult>,
}

impl Future for DeliveryFuture {
    type Output = DeliveryResult;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.rx)
            .poll(cx)
            .map(|received| received.unwrap_or(Err(Error::ClientClosed)))
    }
}

/// Ids of unresolved records. Ids are handed out in `send` order.
#[derive(Debug, Default)]
struct Outstanding {
    next_id: u64,
    ids: BTreeSet<u64>,
}

impl Outstanding {
    fn resolved_below(&self, watermark: u64) -> bool {
        self.ids.first().map_or(true, |oldest| *oldest >= watermark)
    }
}

struct TrackedBatch {
    completions: Vec<Completion>,
    outcome: Option<Result<ProduceResponse>>,
}

/// Maps in-flight batches to their records' completions.
pub struct DeliveryTracker {
    ordered: bool,
    batches: Mutex<HashMap<TopicPartition, BTreeMap<u64, TrackedBatch>>>,
    outstanding: Arc<watch::Sender<Outstanding>>,
    delivered: AtomicU64,
    failed: AtomicU64,
}

impl DeliveryTracker {
    /// With `ordered`, outcomes of a partition are released in sequence
    /// order even if the broker answers out of order.
    pub fn new(ordered: bool) -> Self {
        let (outstanding, _) = watch::channel(Outstanding::default());
        Self {
            ordered,
            batches: Mutex::new(HashMap::new()),
            outstanding: Arc::new(outstanding),
            delivered: AtomicU64::new(0),
            failed: AtomicU64::new(0),
        }
    }

    /// Creates the completion/future pair for one record. The record counts
    /// as pending until the completion resolves or is dropped.
    pub fn completion(
        &self,
        timestamp_ms: i64,
        permit: Option<OwnedSemaphorePermit>,
    ) -> (Completion, DeliveryFuture) {
        let (tx, rx) = oneshot::channel();
        let mut id = 0;
        self.outstanding.send_modify(|outstanding| {
            id = outstanding.next_id;
            outstanding.next_id += 1;
            outstanding.ids.insert(id);
        });
        (
            Completion {
                tx: Some(tx),
                permit,
                timestamp_ms,
                id,
                outstanding: Arc::clone(&self.outstanding),
            },
            DeliveryFuture { rx },
        )
    }

    pub fn track(&self, tp: &TopicPartition, sequence: u64, completions: Vec<Completion>) {
        let mut batches = self.lock();
        let queue = batches.entry(tp.clone()).or_default();
        if queue.contains_key(&sequence) {
            warn!(
                topic_partition = %tp,
                sequence,
                "Protocol anomaly: batch sequence tracked twice"
            );
        }
        queue.insert(
            sequence,
            TrackedBatch {
                completions,
                outcome: None,
            },
        );
    }

    /// Records the broker's outcome for a tracked batch and completes its
    /// records.
    ///
    /// Returns the batch's final state, or `None` for a sequence that is not
    /// tracked (late or duplicate response).
    pub fn resolve(
        &self,
        tp: &TopicPartition,
        sequence: u64,
        outcome: Result<ProduceResponse>,
    ) -> Option<BatchState> {
        let state = match &outcome {
            Ok(_) => BatchState::Acked,
            Err(_) => BatchState::Failed,
        };

        let released = {
            let mut batches = self.lock();
            let Some(queue) = batches.get_mut(tp) else {
                warn!(topic_partition = %tp, sequence, "Protocol anomaly: response for untracked batch");
                return None;
            };

            match queue.get_mut(&sequence) {
                Some(batch) if batch.outcome.is_none() => batch.outcome = Some(outcome),
                Some(_) => {
                    warn!(topic_partition = %tp, sequence, "Protocol anomaly: duplicate response");
                    return None;
                }
                None => {
                    warn!(topic_partition = %tp, sequence, "Protocol anomaly: response for untracked batch");
                    return None;
                }
            }

            let mut released = Vec::new();
            if self.ordered {
                while let Some(first) = queue.first_entry() {
                    if first.get().outcome.is_none() {
                        break;
                    }
                    released.push(first.remove());
                }
                if released.is_empty() {
                    debug!(
                        topic_partition = %tp,
                        sequence,
                        "Holding outcome until earlier batches resolve"
                    );
                }
            } else if let Some(batch) = queue.remove(&sequence) {
                released.push(batch);
            }

            if queue.is_empty() {
                batches.remove(tp);
            }
            released
        };

        for batch in released {
            let outcome = batch.outcome.unwrap_or(Err(Error::ClientClosed));
            self.release(tp, batch.completions, outcome);
        }
        Some(state)
    }

    /// Completes every tracked record. Batches that already have an outcome
    /// get it; the rest fail with `error`. Returns the number of records
    /// failed with `error`.
    pub fn fail_all(&self, error: Error) -> usize {
        let drained: Vec<(TopicPartition, BTreeMap<u64, TrackedBatch>)> =
            self.lock().drain().collect();

        let mut failed = 0;
        for (tp, queue) in drained {
            for (_, batch) in queue {
                match batch.outcome {
                    Some(outcome) => self.release(&tp, batch.completions, outcome),
                    None => {
                        failed += batch.completions.len();
                        self.release(&tp, batch.completions, Err(error.clone()));
                    }
                }
            }
        }
        failed
    }

    /// Records created and not yet resolved, tracked or not.
    pub fn pending(&self) -> usize {
        self.outstanding.borrow().ids.len()
    }

    /// Id the next record will get. Every record created so far has a
    /// lower id.
    pub fn watermark(&self) -> u64 {
        self.outstanding.borrow().next_id
    }

    /// Waits until every record created before `watermark` has resolved.
    /// Records created later are not waited for.
    pub async fn wait_resolved(&self, watermark: u64, timeout: Duration) -> Result<()> {
        let mut rx = self.outstanding.subscribe();
        let waited = tokio::time::timeout(
            timeout,
            rx.wait_for(|outstanding| outstanding.resolved_below(watermark)),
        )
        .await
        .map(|_| ());

        match waited {
            Ok(()) => Ok(()),
            Err(_) => {
                let remaining = self.outstanding.borrow().ids.range(..watermark).count();
                Err(Error::timed_out(format!(
                    "{} records still pending after {:?}",
                    remaining, timeout
                )))
            }
        }
    }

    /// Waits until no record is pending.
    pub async fn wait_idle(&self, timeout: Duration) -> Result<()> {
        self.wait_resolved(u64::MAX, timeout).await
    }

    pub fn delivered(&self) -> u64 {
        self.delivered.load(Ordering::Relaxed)
    }

    pub fn failed(&self) -> u64 {
        self.failed.load(Ordering::Relaxed)
    }

    /// Completes a batch's records with their offsets from `outcome`.
    fn release(
        &self,
        tp: &TopicPartition,
        completions: Vec<Completion>,
        outcome: Result<ProduceResponse>,
    ) {
        let count = completions.len() as u64;
        match outcome {
            Ok(response) => {
                for (i, completion) in completions.into_iter().enumerate() {
                    let metadata = RecordMetadata {
                        topic: tp.topic.clone(),
                        partition: tp.partition,
                        offset: response.offset_of(i),
                        timestamp_ms: response
                            .log_append_time_ms
                            .unwrap_or(completion.timestamp_ms),
                    };
                    completion.complete(Ok(metadata));
                }
                self.delivered.fetch_add(count, Ordering::Relaxed);
            }
            Err(e) => {
                for completion in completions {
                    completion.complete(Err(e.clone()));
                }
                self.failed.fetch_add(count, Ordering::Relaxed);
            }
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<TopicPartition, BTreeMap<u64, TrackedBatch>>> {
        self.batches.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::FutureExt;
    use std::sync::Arc;
    use tokio::sync::Semaphore;

    fn ack(base_offset: i64) -> Result<ProduceResponse> {
        Ok(ProduceResponse::new(base_offset))
    }

    fn batch(tracker: &DeliveryTracker, n: usize) -> (Vec<Completion>, Vec<DeliveryFuture>) {
        (0..n).map(|i| tracker.completion(1_000 + i as i64, None)).unzip()
    }

    #[tokio::test]
    async fn test_resolve_assigns_consecutive_offsets() {
        let tracker = DeliveryTracker::new(false);
        let tp = TopicPartition::new("events", 2);
        let (completions, futures) = batch(&tracker, 3);

        tracker.track(&tp, 0, completions);
        assert_eq!(tracker.pending(), 3);
        assert_eq!(tracker.resolve(&tp, 0, ack(40)), Some(BatchState::Acked));

        for (i, future) in futures.into_iter().enumerate() {
            let metadata = future.await.unwrap();
            assert_eq!(metadata.partition, 2);
            assert_eq!(metadata.offset, 40 + i as i64);
            assert_eq!(metadata.timestamp_ms, 1_000 + i as i64);
        }
        assert_eq!(tracker.pending(), 0);
        assert_eq!(tracker.delivered(), 3);
    }

    #[tokio::test]
    async fn test_log_append_time_overrides_create_time() {
        let tracker = DeliveryTracker::new(false);
        let tp = TopicPartition::new("events", 0);
        let (completions, mut futures) = batch(&tracker, 1);

        tracker.track(&tp, 0, completions);
        tracker.resolve(
            &tp,
            0,
            Ok(ProduceResponse {
                log_append_time_ms: Some(99),
                ..ProduceResponse::new(0)
            }),
        );

        assert_eq!(futures.remove(0).await.unwrap().timestamp_ms, 99);
    }

    #[tokio::test]
    async fn test_split_batch_reports_each_record_offset() {
        let tracker = DeliveryTracker::new(false);
        let tp = TopicPartition::new("events", 0);
        let (completions, futures) = batch(&tracker, 3);

        tracker.track(&tp, 0, completions);
        tracker.resolve(
            &tp,
            0,
            Ok(ProduceResponse {
                record_offsets: Some(vec![10, 11, 25]),
                ..ProduceResponse::new(10)
            }),
        );

        let mut offsets = Vec::new();
        for future in futures {
            offsets.push(future.await.unwrap().offset);
        }
        assert_eq!(offsets, vec![10, 11, 25]);
    }

    #[tokio::test]
    async fn test_failure_reaches_every_record() {
        let tracker = DeliveryTracker::new(false);
        let tp = TopicPartition::new("events", 0);
        let (completions, futures) = batch(&tracker, 2);

        tracker.track(&tp, 0, completions);
        let err = Error::MessageTooLarge { size: 10, max: 5 };
        assert_eq!(tracker.resolve(&tp, 0, Err(err.clone())), Some(BatchState::Failed));

        for future in futures {
            assert_eq!(future.await.unwrap_err(), err);
        }
        assert_eq!(tracker.failed(), 2);
    }

    #[tokio::test]
    async fn test_ordered_resolution_waits_for_earlier_batches() {
        let tracker = DeliveryTracker::new(true);
        let tp = TopicPartition::new("events", 0);
        let (first, mut first_futures) = batch(&tracker, 1);
        let (second, mut second_futures) = batch(&tracker, 1);

        tracker.track(&tp, 0, first);
        tracker.track(&tp, 1, second);

        tracker.resolve(&tp, 1, ack(1));
        let mut second_future = second_futures.remove(0);
        assert!((&mut second_future).now_or_never().is_none());

        tracker.resolve(&tp, 0, ack(0));
        assert_eq!(first_futures.remove(0).await.unwrap().offset, 0);
        assert_eq!(second_future.await.unwrap().offset, 1);
    }

    #[tokio::test]
    async fn test_unordered_resolution_releases_immediately() {
        let tracker = DeliveryTracker::new(false);
        let tp = TopicPartition::new("events", 0);
        let (first, _first_futures) = batch(&tracker, 1);
        let (second, mut second_futures) = batch(&tracker, 1);

        tracker.track(&tp, 0, first);
        tracker.track(&tp, 1, second);
        tracker.resolve(&tp, 1, ack(7));

        assert_eq!(second_futures.remove(0).await.unwrap().offset, 7);
    }

    #[tokio::test]
    async fn test_unknown_and_duplicate_sequences_are_ignored() {
        let tracker = DeliveryTracker::new(false);
        let tp = TopicPartition::new("events", 0);
        let (completions, _futures) = batch(&tracker, 1);

        assert_eq!(tracker.resolve(&tp, 0, ack(0)), None);

        tracker.track(&tp, 5, completions);
        assert_eq!(tracker.resolve(&tp, 4, ack(0)), None);
        assert_eq!(tracker.resolve(&tp, 5, ack(0)), Some(BatchState::Acked));
        assert_eq!(tracker.resolve(&tp, 5, ack(0)), None);
        assert_eq!(tracker.delivered(), 1);
    }

    #[tokio::test]
    async fn test_fail_all() {
        let tracker = DeliveryTracker::new(true);
        let tp = TopicPartition::new("events", 0);
        let (first, mut first_futures) = batch(&tracker, 2);
        let (second, mut second_futures) = batch(&tracker, 1);

        tracker.track(&tp, 0, first);
        tracker.track(&tp, 1, second);
        // Held back behind sequence 0
        tracker.resolve(&tp, 1, ack(10));

        let failed = tracker.fail_all(Error::timed_out("closing"));
        assert_eq!(failed, 2);
        assert!(matches!(
            first_futures.remove(0).await,
            Err(Error::TimedOut { .. })
        ));
        assert_eq!(second_futures.remove(0).await.unwrap().offset, 10);
        assert_eq!(tracker.pending(), 0);
    }

    #[tokio::test]
    async fn test_dropped_completion_reports_client_closed() {
        let tracker = DeliveryTracker::new(false);
        let (completion, future) = tracker.completion(0, None);

        drop(completion);
        assert_eq!(future.await.unwrap_err(), Error::ClientClosed);
        assert_eq!(tracker.pending(), 0);
    }

    #[tokio::test]
    async fn test_completion_releases_buffer_permit() {
        let tracker = DeliveryTracker::new(false);
        let memory = Arc::new(Semaphore::new(100));
        let permit = Arc::clone(&memory).acquire_many_owned(60).await.unwrap();

        let (completion, _future) = tracker.completion(0, Some(permit));
        assert_eq!(memory.available_permits(), 40);

        completion.complete(Err(Error::ClientClosed));
        assert_eq!(memory.available_permits(), 100);
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_idle() {
        let tracker = Arc::new(DeliveryTracker::new(false));
        assert!(tracker.wait_idle(Duration::from_millis(10)).await.is_ok());

        let (completion, _future) = tracker.completion(0, None);
        let err = tracker.wait_idle(Duration::from_millis(10)).await.unwrap_err();
        assert!(matches!(err, Error::TimedOut { .. }));

        let waiter = {
            let tracker = Arc::clone(&tracker);
            tokio::spawn(async move { tracker.wait_idle(Duration::from_secs(5)).await })
        };
        tokio::task::yield_now().await;
        completion.complete(Err(Error::ClientClosed));
        assert!(waiter.await.unwrap().is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_resolved_ignores_later_records() {
        let tracker = DeliveryTracker::new(false);
        let (earlier, _earlier_future) = tracker.completion(0, None);
        let watermark = tracker.watermark();
        let (_later, _later_future) = tracker.completion(0, None);

        let err = tracker
            .wait_resolved(watermark, Duration::from_millis(10))
            .await
            .unwrap_err();
        assert_eq!(err, Error::timed_out("1 records still pending after 10ms"));

        earlier.complete(Err(Error::ClientClosed));
        assert!(tracker
            .wait_resolved(watermark, Duration::from_millis(10))
            .await
            .is_ok());
        assert_eq!(tracker.pending(), 1);
        assert!(tracker.wait_idle(Duration::from_millis(10)).await.is_err());
    }
}
