//! Per host/category accumulator: streams samples into per-kind chunks, cuts time ranges on a
//! randomized deadline and queues the resulting batches for the chunk writer.
//!
//! A [`HostAccumulator`] never points at the writer's internals and the writer never points at
//! accumulators. Each queued batch travels with an [`Acknowledger`] holding only the
//! accumulator's [`PendingQueue`], which is the one piece of state both sides share.

use crate::chunk::ChunkAccumulator;
use crate::error::Result;
use crate::store::TimeRangeIdSequence;
use crate::telemetry::{timeline_metrics, TimelineEvent, TimelineEventListener};
use crate::times::encode_times;
use crate::types::{
    AccumulatorKey, CategoryId, ChunkSet, EncodedChunk, HostId, HostSampleBatch, PendingBatch,
    SampleKindId, SampleValue, TimeRange, TimeRangeId, Timestamp,
};

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

/// Source of the random offset added to a window's first timestamp to get its cut deadline.
pub trait DeadlineJitter: std::fmt::Debug + Send + Sync + 'static {
    /// Returns an offset in `0..max_ms` (or 0 when `max_ms` is 0).
    fn jitter(&self, max_ms: u64) -> u64;
}

/// Seedable uniform jitter. Accumulators share one instance.
#[derive(Debug)]
pub struct RandomJitter {
    rng: Mutex<StdRng>,
}

impl RandomJitter {
    pub fn from_entropy() -> Self {
        RandomJitter {
            rng: Mutex::new(StdRng::from_entropy()),
        }
    }

    pub fn seeded(seed: u64) -> Self {
        RandomJitter {
            rng: Mutex::new(StdRng::seed_from_u64(seed)),
        }
    }
}

impl DeadlineJitter for RandomJitter {
    fn jitter(&self, max_ms: u64) -> u64 {
        if max_ms == 0 {
            return 0;
        }
        match self.rng.lock() {
            Ok(mut rng) => rng.gen_range(0..max_ms),
            // A poisoned RNG still yields a usable (if unstaggered) deadline.
            Err(poisoned) => poisoned.into_inner().gen_range(0..max_ms),
        }
    }
}

/// Constant jitter, for deterministic chunk boundaries.
#[derive(Debug, Clone, Copy)]
pub struct FixedJitter(pub u64);

impl DeadlineJitter for FixedJitter {
    fn jitter(&self, _max_ms: u64) -> u64 {
        self.0
    }
}

/// Receives batches cut by accumulators. Implemented by the chunk writer.
pub trait BatchSink: std::fmt::Debug + Send + Sync + 'static {
    fn submit(&self, batch: QueuedBatch) -> Result<()>;
}

/// A batch on its way to the store, together with the handle that acknowledges it.
#[derive(Debug, Clone)]
pub struct QueuedBatch {
    pub batch: Arc<PendingBatch>,
    pub ack: Acknowledger,
}

/// Acknowledges one batch back to the queue of the accumulator that produced it.
#[derive(Debug, Clone)]
pub struct Acknowledger {
    queue: Arc<PendingQueue>,
    sequence_id: u64,
}

impl Acknowledger {
    pub fn sequence_id(&self) -> u64 {
        self.sequence_id
    }

    pub fn key(&self) -> AccumulatorKey {
        self.queue.key
    }

    /// Marks the batch consumed. Returns `false` on a sequence mismatch.
    pub fn acknowledge(&self) -> Result<bool> {
        self.queue.mark_batch_consumed(self.sequence_id)
    }
}

/// FIFO of batches that were cut but not yet acknowledged as durable.
#[derive(Debug)]
pub struct PendingQueue {
    key: AccumulatorKey,
    batches: Mutex<VecDeque<Arc<PendingBatch>>>,
    ack_mismatches: AtomicU64,
    events: Arc<dyn TimelineEventListener>,
}

impl PendingQueue {
    fn new(key: AccumulatorKey, events: Arc<dyn TimelineEventListener>) -> Self {
        PendingQueue {
            key,
            batches: Mutex::new(VecDeque::new()),
            ack_mismatches: AtomicU64::new(0),
            events,
        }
    }

    fn push(&self, batch: Arc<PendingBatch>) -> Result<()> {
        self.batches.lock()?.push_back(batch);
        Ok(())
    }

    /// Removes the oldest batch iff its sequence id matches.
    ///
    /// A mismatch is reported and counted but otherwise ignored: the queue keeps operating.
    pub fn mark_batch_consumed(&self, sequence_id: u64) -> Result<bool> {
        let mut batches = self.batches.lock()?;
        let head = batches.front().map(|b| b.sequence_id);
        if head == Some(sequence_id) {
            batches.pop_front();
            return Ok(true);
        }
        drop(batches);
        self.ack_mismatches.fetch_add(1, Ordering::Relaxed);
        self.events.on_event(TimelineEvent::AckSequenceMismatch {
            host_id: self.key.0,
            category_id: self.key.1,
            expected: head,
            received: sequence_id,
        });
        Ok(false)
    }

    fn snapshot(&self) -> Result<Vec<Arc<PendingBatch>>> {
        Ok(self.batches.lock()?.iter().cloned().collect())
    }

    fn len(&self) -> Result<usize> {
        Ok(self.batches.lock()?.len())
    }

    fn earliest_start(&self) -> Result<Option<Timestamp>> {
        Ok(self
            .batches
            .lock()?
            .front()
            .map(|b| b.chunk_set.time_range.start_time))
    }
}

/// Everything an accumulator needs from its surroundings.
#[derive(Debug, Clone)]
pub struct AccumulatorContext {
    pub chunk_length_ms: u64,
    pub jitter: Arc<dyn DeadlineJitter>,
    pub sink: Arc<dyn BatchSink>,
    pub time_range_ids: TimeRangeIdSequence,
    pub events: Arc<dyn TimelineEventListener>,
}

#[derive(Debug)]
struct WindowState {
    /// Per-kind accumulators. Empty ones are dormant: they did not report in this window.
    chunks: BTreeMap<SampleKindId, ChunkAccumulator>,
    times: Vec<Timestamp>,
    time_range_id: Option<TimeRangeId>,
    deadline: Option<Timestamp>,
    /// Last accepted timestamp, kept across cuts.
    end_time: Option<Timestamp>,
    next_sequence_id: u64,
}

/// Accumulates the samples of one (host, category).
#[derive(Debug)]
pub struct HostAccumulator {
    host_id: HostId,
    category_id: CategoryId,
    state: Mutex<WindowState>,
    pending: Arc<PendingQueue>,
    rejected_samples: AtomicU64,
    ctx: AccumulatorContext,
}

impl HostAccumulator {
    pub fn new(host_id: HostId, category_id: CategoryId, ctx: AccumulatorContext) -> Self {
        HostAccumulator {
            host_id,
            category_id,
            state: Mutex::new(WindowState {
                chunks: BTreeMap::new(),
                times: Vec::new(),
                time_range_id: None,
                deadline: None,
                end_time: None,
                next_sequence_id: 1,
            }),
            pending: Arc::new(PendingQueue::new((host_id, category_id), ctx.events.clone())),
            rejected_samples: AtomicU64::new(0),
            ctx,
        }
    }

    pub fn host_id(&self) -> HostId {
        self.host_id
    }

    pub fn category_id(&self) -> CategoryId {
        self.category_id
    }

    pub fn key(&self) -> AccumulatorKey {
        (self.host_id, self.category_id)
    }

    /// Adds one batch of samples. Returns `Ok(false)` if the batch was rejected for a timestamp
    /// that is not after the last accepted one; the accumulator is left untouched in that case.
    pub fn add_samples(&self, batch: &HostSampleBatch) -> Result<bool> {
        let timestamp = batch.timestamp;
        let mut state = self.state.lock()?;

        if let Some(end_time) = state.end_time {
            if timestamp <= end_time {
                self.rejected_samples.fetch_add(1, Ordering::Relaxed);
                timeline_metrics::record_sample_rejected();
                self.ctx.events.on_event(TimelineEvent::SampleRejected {
                    host_id: self.host_id,
                    category_id: self.category_id,
                    timestamp,
                    end_time,
                });
                return Ok(false);
            }
        }

        // A failed hand-off leaves the cut batch queued here; the sample is still accepted.
        let mut cut = Ok(None);
        match state.deadline {
            Some(deadline) if timestamp > deadline => {
                cut = self.extract_locked(&mut state);
                state.deadline = Some(self.next_deadline(timestamp));
            }
            Some(_) => {}
            None => state.deadline = Some(self.next_deadline(timestamp)),
        }

        if state.times.is_empty() {
            state.time_range_id = Some(self.ctx.time_range_ids.next_id());
        }
        let window_count = state.times.len() as u32;
        let host_id = self.host_id;

        for sample in batch.samples() {
            let chunk = state
                .chunks
                .entry(sample.sample_kind_id)
                .or_insert_with(|| ChunkAccumulator::new(host_id, sample.sample_kind_id));
            if chunk.is_empty() {
                chunk.add_placeholders(window_count);
            }
            chunk.add_sample(sample.value);
        }
        for (kind, chunk) in state.chunks.iter_mut() {
            if !chunk.is_empty() && !batch.samples.contains_key(kind) {
                chunk.add_sample(SampleValue::Null);
            }
        }

        state.times.push(timestamp);
        state.end_time = Some(timestamp);
        cut.map(|_| true)
    }

    fn next_deadline(&self, from: Timestamp) -> Timestamp {
        from.saturating_add(self.ctx.jitter.jitter(self.ctx.chunk_length_ms))
    }

    /// Cuts the open window into a pending batch and hands it to the writer.
    ///
    /// Returns the sequence id of the queued batch, or `None` if the window was empty.
    pub fn extract_and_queue_chunks(&self) -> Result<Option<u64>> {
        let mut state = self.state.lock()?;
        self.extract_locked(&mut state)
    }

    fn extract_locked(&self, state: &mut WindowState) -> Result<Option<u64>> {
        let (Some(&start_time), Some(&end_time)) = (state.times.first(), state.times.last()) else {
            return Ok(None);
        };
        let id = match state.time_range_id.take() {
            Some(id) => id,
            None => self.ctx.time_range_ids.next_id(),
        };
        let time_range = TimeRange {
            id,
            host_id: self.host_id,
            category_id: self.category_id,
            start_time,
            end_time,
            encoded_times: encode_times(&state.times)?,
            sample_count: state.times.len() as u32,
            aggregation_level: 0,
            valid: true,
        };
        let chunks: Vec<EncodedChunk> = state
            .chunks
            .values_mut()
            .filter(|c| !c.is_empty())
            .map(|c| c.extract_and_reset(id))
            .collect();
        state.times.clear();

        let sequence_id = state.next_sequence_id;
        state.next_sequence_id += 1;

        let batch = Arc::new(PendingBatch {
            sequence_id,
            chunk_set: ChunkSet { time_range, chunks },
        });
        self.pending.push(batch.clone())?;
        self.ctx.events.on_event(TimelineEvent::ChunksQueued {
            host_id: self.host_id,
            category_id: self.category_id,
            sequence_id,
            time_range_id: id,
            chunk_count: batch.chunk_count(),
            sample_count: batch.chunk_set.time_range.sample_count,
        });
        self.ctx.sink.submit(QueuedBatch {
            batch,
            ack: Acknowledger {
                queue: self.pending.clone(),
                sequence_id,
            },
        })?;
        Ok(Some(sequence_id))
    }

    /// Removes the oldest queued batch iff `sequence_id` matches it.
    pub fn mark_batch_consumed(&self, sequence_id: u64) -> Result<bool> {
        self.pending.mark_batch_consumed(sequence_id)
    }

    /// Deep copies of every chunk not yet known to be durable: queued batches first, then the
    /// open window. Filters by kind and by time-range overlap.
    pub fn in_memory_chunks(
        &self,
        kinds: Option<&[SampleKindId]>,
        start: Option<Timestamp>,
        end: Option<Timestamp>,
    ) -> Result<Vec<ChunkSet>> {
        let state = self.state.lock()?;
        let wanted = |kind: SampleKindId| kinds.map_or(true, |k| k.contains(&kind));

        let mut out = Vec::new();
        for batch in self.pending.snapshot()? {
            let range = &batch.chunk_set.time_range;
            if !range.overlaps(start, end) {
                continue;
            }
            out.push(ChunkSet {
                time_range: range.clone(),
                chunks: batch
                    .chunk_set
                    .chunks
                    .iter()
                    .filter(|c| wanted(c.sample_kind_id))
                    .cloned()
                    .collect(),
            });
        }

        if let (Some(&first), Some(&last)) = (state.times.first(), state.times.last()) {
            let id = state.time_range_id.unwrap_or_default();
            let time_range = TimeRange {
                id,
                host_id: self.host_id,
                category_id: self.category_id,
                start_time: first,
                end_time: last,
                encoded_times: encode_times(&state.times)?,
                sample_count: state.times.len() as u32,
                aggregation_level: 0,
                valid: false,
            };
            if time_range.overlaps(start, end) {
                let chunks = state
                    .chunks
                    .values()
                    .filter(|c| !c.is_empty() && wanted(c.sample_kind_id()))
                    .map(|c| c.snapshot(id))
                    .collect();
                out.push(ChunkSet { time_range, chunks });
            }
        }
        Ok(out)
    }

    /// Verifies that every active kind holds exactly one sample per window timestamp.
    pub fn check_sample_counts(&self) -> Result<bool> {
        let state = self.state.lock()?;
        let expected = state.times.len() as u32;
        Ok(state
            .chunks
            .values()
            .filter(|c| !c.is_empty())
            .all(|c| c.sample_count() == expected))
    }

    /// Oldest timestamp whose samples are not yet durable, if any.
    pub fn earliest_unpersisted_time(&self) -> Result<Option<Timestamp>> {
        let state = self.state.lock()?;
        let queued = self.pending.earliest_start()?;
        let open = state.times.first().copied();
        Ok(match (queued, open) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        })
    }

    pub fn rejected_samples(&self) -> u64 {
        self.rejected_samples.load(Ordering::Relaxed)
    }

    pub fn ack_mismatches(&self) -> u64 {
        self.pending.ack_mismatches.load(Ordering::Relaxed)
    }

    pub fn pending_batch_count(&self) -> Result<usize> {
        self.pending.len()
    }

    /// Number of timestamps in the open window.
    pub fn open_sample_count(&self) -> Result<usize> {
        Ok(self.state.lock()?.times.len())
    }

    /// Last accepted timestamp.
    pub fn end_time(&self) -> Result<Option<Timestamp>> {
        Ok(self.state.lock()?.end_time)
    }
}
