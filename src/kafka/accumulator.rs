//! Per-partition batching of outgoing records.
//!
//! Each partition has at most one open batch accepting records, a FIFO of
//! sealed batches waiting for a worker, and a count of batches in flight.
//! A batch is sealed when its byte or record budget is reached, when its
//! linger timer fires, or on flush; once sealed it is never modified.

use super::record::{Record, TopicPartition};
use super::tracker::Completion;
use crate::config::ProducerConfig;
use crate::{Error, Result};
use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::time::Instant;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BatchState {
    Open,
    Sealed,
    InFlight,
    Acked,
    Failed,
}

/// Records bound for one partition, sent in a single produce request.
pub struct Batch {
    topic_partition: TopicPartition,
    generation: u64,
    sequence: u64,
    state: BatchState,
    records: Vec<Record>,
    completions: Vec<Completion>,
    size_bytes: usize,
    created_at: Instant,
    sealed_at: Option<Instant>,
}

impl Batch {
    fn open(topic_partition: TopicPartition, generation: u64) -> Self {
        Self {
            topic_partition,
            generation,
            sequence: 0,
            state: BatchState::Open,
            records: Vec::new(),
            completions: Vec::new(),
            size_bytes: 0,
            created_at: Instant::now(),
            sealed_at: None,
        }
    }

    fn push(&mut self, record: Record, completion: Completion) {
        self.size_bytes += record.size();
        self.records.push(record);
        self.completions.push(completion);
    }

    fn seal(&mut self, sequence: u64) {
        self.sequence = sequence;
        self.state = BatchState::Sealed;
        self.sealed_at = Some(Instant::now());
    }

    pub fn topic_partition(&self) -> &TopicPartition {
        &self.topic_partition
    }

    /// Per-partition sequence, assigned on seal.
    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    pub fn state(&self) -> BatchState {
        self.state
    }

    pub fn records(&self) -> &[Record] {
        &self.records
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn size_bytes(&self) -> usize {
        self.size_bytes
    }

    /// Time since the first record arrived.
    pub fn age(&self) -> Duration {
        self.created_at.elapsed()
    }

    pub fn into_parts(self) -> (Vec<Record>, Vec<Completion>) {
        (self.records, self.completions)
    }

    /// Completes every record of the batch with `error`. Returns the number
    /// of records failed.
    pub fn fail(self, error: &Error) -> usize {
        let count = self.completions.len();
        for completion in self.completions {
            completion.complete(Err(error.clone()));
        }
        count
    }
}

#[derive(Default)]
struct PartitionState {
    open: Option<Batch>,
    sealed: VecDeque<Batch>,
    in_flight: usize,
    next_sequence: u64,
}

impl PartitionState {
    fn seal_open(&mut self) -> bool {
        match self.open.take() {
            Some(mut batch) => {
                batch.seal(self.next_sequence);
                self.next_sequence += 1;
                debug!(
                    topic_partition = %batch.topic_partition,
                    sequence = batch.sequence,
                    records = batch.records.len(),
                    bytes = batch.size_bytes,
                    "Sealed batch"
                );
                self.sealed.push_back(batch);
                true
            }
            None => false,
        }
    }
}

/// What [`BatchAccumulator::append`] did with a record.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AppendOutcome {
    /// The record joined a batch that was already open.
    pub fit_in_open_batch: bool,
    /// At least one batch was sealed and can be drained.
    pub batch_ready: bool,
    /// Generation of a newly opened batch that needs a linger timer.
    pub new_batch: Option<u64>,
}

pub struct BatchAccumulator {
    batch_size: usize,
    max_batch_records: Option<usize>,
    max_in_flight: usize,
    linger: Duration,
    partitions: Mutex<BTreeMap<TopicPartition, PartitionState>>,
    next_generation: AtomicU64,
    closed: AtomicBool,
}

impl BatchAccumulator {
    pub fn new(
        batch_size: usize,
        max_batch_records: Option<usize>,
        max_in_flight: usize,
        linger: Duration,
    ) -> Self {
        Self {
            batch_size,
            max_batch_records,
            max_in_flight: max_in_flight.max(1),
            linger,
            partitions: Mutex::new(BTreeMap::new()),
            next_generation: AtomicU64::new(0),
            closed: AtomicBool::new(false),
        }
    }

    pub fn from_config(config: &ProducerConfig) -> Self {
        Self::new(
            config.batch_size,
            config.max_batch_records,
            config.effective_max_in_flight(),
            config.linger(),
        )
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    pub fn linger(&self) -> Duration {
        self.linger
    }

    /// Adds a record to the open batch of `tp`.
    ///
    /// A record that would overflow the open batch seals it and starts a new
    /// one. A record larger than the whole byte budget is rejected with
    /// [`Error::MessageTooLarge`] before anything is buffered.
    pub fn append(
        &self,
        tp: &TopicPartition,
        record: Record,
        completion: Completion,
    ) -> Result<AppendOutcome> {
        let size = record.size();
        if size > self.batch_size {
            return Err(Error::MessageTooLarge {
                size,
                max: self.batch_size,
            });
        }

        let mut partitions = self.lock();
        if self.closed.load(Ordering::Acquire) {
            return Err(Error::ClientClosed);
        }

        let state = partitions.entry(tp.clone()).or_default();
        let mut outcome = AppendOutcome::default();

        if let Some(open) = &state.open {
            if open.size_bytes + size > self.batch_size {
                state.seal_open();
                outcome.batch_ready = true;
            } else {
                outcome.fit_in_open_batch = true;
            }
        }

        let open = state.open.get_or_insert_with(|| {
            let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);
            outcome.new_batch = Some(generation);
            Batch::open(tp.clone(), generation)
        });
        open.push(record, completion);

        let full = open.size_bytes >= self.batch_size
            || self
                .max_batch_records
                .is_some_and(|max| open.records.len() >= max);

        if full || self.linger.is_zero() {
            state.seal_open();
            outcome.batch_ready = true;
            outcome.new_batch = None;
        }

        Ok(outcome)
    }

    /// Seals the open batch of `tp` if it is still the batch of
    /// `generation`. Called when that batch's linger timer fires.
    pub fn seal_expired(&self, tp: &TopicPartition, generation: u64) -> bool {
        let mut partitions = self.lock();
        match partitions.get_mut(tp) {
            Some(state) if state.open.as_ref().is_some_and(|b| b.generation == generation) => {
                state.seal_open()
            }
            _ => false,
        }
    }

    /// Seals every open batch. Returns how many were sealed.
    pub fn seal_all(&self) -> usize {
        self.lock()
            .values_mut()
            .map(|state| state.seal_open())
            .filter(|sealed| *sealed)
            .count()
    }

    /// Takes the oldest sealed batch whose partition has room in its
    /// in-flight window, and marks it in flight.
    pub fn drain(&self) -> Option<Batch> {
        let mut partitions = self.lock();

        let (tp, _) = partitions
            .iter()
            .filter(|(_, state)| state.in_flight < self.max_in_flight)
            .filter_map(|(tp, state)| {
                state
                    .sealed
                    .front()
                    .and_then(|batch| batch.sealed_at)
                    .map(|sealed_at| (tp, sealed_at))
            })
            .min_by_key(|(_, sealed_at)| *sealed_at)?;
        let tp = tp.clone();

        let state = partitions.get_mut(&tp)?;
        let mut batch = state.sealed.pop_front()?;
        batch.state = BatchState::InFlight;
        state.in_flight += 1;
        Some(batch)
    }

    /// Drains every batch that is currently sendable.
    pub fn drain_ready(&self) -> Vec<Batch> {
        std::iter::from_fn(|| self.drain()).collect()
    }

    /// Releases the in-flight slot of a batch of `tp` once it resolved.
    pub fn complete(&self, tp: &TopicPartition) {
        if let Some(state) = self.lock().get_mut(tp) {
            state.in_flight = state.in_flight.saturating_sub(1);
        }
    }

    /// Removes the sealed, not yet sent batches of the given partitions.
    pub fn take_sealed(&self, tps: &[TopicPartition]) -> Vec<Batch> {
        let mut partitions = self.lock();
        let mut taken = Vec::new();
        for tp in tps {
            if let Some(state) = partitions.get_mut(tp) {
                taken.extend(state.sealed.drain(..));
            }
        }
        taken
    }

    /// Rejects further appends.
    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Closes the accumulator and returns every batch not yet in flight,
    /// open ones included.
    pub fn abort_all(&self) -> Vec<Batch> {
        let mut partitions = self.lock();
        self.close();

        let mut aborted = Vec::new();
        for state in partitions.values_mut() {
            aborted.extend(state.sealed.drain(..));
            aborted.extend(state.open.take());
        }
        aborted
    }

    /// Batches sealed and waiting to be drained, over all partitions.
    pub fn sealed_count(&self) -> usize {
        self.lock().values().map(|state| state.sealed.len()).sum()
    }

    pub fn in_flight(&self, tp: &TopicPartition) -> usize {
        self.lock().get(tp).map_or(0, |state| state.in_flight)
    }

    fn lock(&self) -> MutexGuard<'_, BTreeMap<TopicPartition, PartitionState>> {
        self.partitions.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
