//! Periodic compaction of consecutive persisted time ranges into larger ones.
//!
//! One pass walks the aggregation levels bottom-up. At each level the valid ranges of every
//! (host, category) are merged in runs of N into a single range one level up. A merge is
//! inserted invisible, then swapped in atomically, then (optionally) its sources are deleted, so
//! readers always see exactly one valid range per span.

use crate::encoding::{count_samples, encode_null_run};
use crate::error::{Result, TimelineError};
use crate::store::TimelineStore;
use crate::telemetry::{timeline_metrics, TimelineEvent, TimelineEventListener};
use crate::times::{combine_times, count_times};
use crate::types::{ChunkSet, EncodedChunk, SampleKindId, TimeRange, TimeRangeId};

use rayon::prelude::*;
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{mpsc, Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

#[derive(Debug, Clone)]
pub struct AggregatorConfig {
    pub interval: Duration,
    /// Ranges merged per aggregate, indexed by level; the last entry applies to higher levels.
    pub chunks_to_aggregate: Vec<usize>,
    /// Number of levels processed per pass, starting at level 0.
    pub max_aggregation_level: u8,
    /// Physically delete source ranges once their aggregate is visible.
    pub delete_aggregated_chunks: bool,
}

impl Default for AggregatorConfig {
    fn default() -> Self {
        AggregatorConfig {
            interval: Duration::from_secs(60 * 60),
            chunks_to_aggregate: vec![12],
            max_aggregation_level: 1,
            delete_aggregated_chunks: true,
        }
    }
}

/// Totals since start.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AggregationStats {
    pub passes: u64,
    pub ranges_considered: u64,
    pub ranges_combined: u64,
    pub aggregates_created: u64,
    pub bytes_created: u64,
    pub failures: u64,
}

/// Outcome of one pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PassSummary {
    pub ranges_considered: u64,
    pub ranges_combined: u64,
    pub aggregates_created: u64,
    pub bytes_created: u64,
    pub failures: u64,
}

#[derive(Debug)]
enum AggregationCmd {
    Maybe,
    Force {
        ack: mpsc::Sender<Result<Option<PassSummary>>>,
    },
    Shutdown,
}

#[derive(Debug)]
struct AggregatorShared {
    store: Arc<dyn TimelineStore>,
    config: AggregatorConfig,
    is_aggregating: AtomicBool,
    passes: AtomicU64,
    ranges_considered: AtomicU64,
    ranges_combined: AtomicU64,
    aggregates_created: AtomicU64,
    bytes_created: AtomicU64,
    failures: AtomicU64,
    events: Arc<dyn TimelineEventListener>,
}

/// Clears the in-progress flag however the pass ends.
struct PassGuard<'a>(&'a AtomicBool);

impl Drop for PassGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

impl AggregatorShared {
    /// Runs one pass. Returns `None` if another pass is already running.
    fn run_pass(&self) -> Result<Option<PassSummary>> {
        if self
            .is_aggregating
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            self.events.on_event(TimelineEvent::AggregationAlreadyRunning);
            return Ok(None);
        }
        let _guard = PassGuard(&self.is_aggregating);

        let started = Instant::now();
        self.events.on_event(TimelineEvent::AggregationStarted);
        let mut summary = PassSummary::default();
        for level in 0..self.config.max_aggregation_level {
            self.aggregate_level(level, &mut summary)?;
        }

        self.passes.fetch_add(1, Ordering::Relaxed);
        self.ranges_considered
            .fetch_add(summary.ranges_considered, Ordering::Relaxed);
        self.ranges_combined
            .fetch_add(summary.ranges_combined, Ordering::Relaxed);
        self.aggregates_created
            .fetch_add(summary.aggregates_created, Ordering::Relaxed);
        self.bytes_created
            .fetch_add(summary.bytes_created, Ordering::Relaxed);
        self.failures.fetch_add(summary.failures, Ordering::Relaxed);
        timeline_metrics::record_aggregates_created(summary.aggregates_created);
        self.events.on_event(TimelineEvent::AggregationFinished {
            created: summary.aggregates_created,
            duration: started.elapsed(),
        });
        Ok(Some(summary))
    }

    fn ranges_per_aggregate(&self, level: u8) -> usize {
        let table = &self.config.chunks_to_aggregate;
        match table.len() {
            0 => 0,
            len => table[(level as usize).min(len - 1)],
        }
    }

    fn aggregate_level(&self, level: u8, summary: &mut PassSummary) -> Result<()> {
        let n = self.ranges_per_aggregate(level);
        let candidates = self.store.aggregation_candidates(level)?;
        let considered = candidates.len() as u64;
        summary.ranges_considered += considered;

        let mut combined = 0u64;
        let mut created = 0u64;
        if n >= 2 {
            let units: Vec<(TimeRangeId, &[ChunkSet])> = group_by_key(&candidates)
                .into_iter()
                .flat_map(|group| group.chunks_exact(n))
                .map(|unit| (self.store.next_time_range_id(), unit))
                .collect();

            let merged: Vec<Result<ChunkSet>> = units
                .par_iter()
                .map(|(id, sources)| merge_ranges(*id, level + 1, sources))
                .collect();

            for ((_, sources), merged) in units.iter().zip(merged) {
                match merged.and_then(|set| self.install(set, sources)) {
                    Ok(bytes) => {
                        combined += sources.len() as u64;
                        created += 1;
                        summary.bytes_created += bytes;
                    }
                    Err(e) => {
                        summary.failures += 1;
                        if let TimelineError::CorruptEncoding {
                            host_id: Some(host_id),
                            sample_kind_id: Some(sample_kind_id),
                            time_range_id: Some(time_range_id),
                            ..
                        } = &e
                        {
                            self.events.on_event(TimelineEvent::CorruptChunkSkipped {
                                host_id: *host_id,
                                sample_kind_id: *sample_kind_id,
                                time_range_id: *time_range_id,
                                error: e.to_string(),
                            });
                        }
                        let first = &sources[0].time_range;
                        self.events.on_event(TimelineEvent::AggregationFailed {
                            host_id: first.host_id,
                            category_id: first.category_id,
                            level,
                            error: e.to_string(),
                        });
                    }
                }
            }
        }

        summary.ranges_combined += combined;
        summary.aggregates_created += created;
        self.events.on_event(TimelineEvent::AggregationLevelFinished {
            level,
            considered,
            combined,
            created,
        });
        Ok(())
    }

    /// Insert invisible, swap visibility, then drop the sources. Returns the bytes written.
    fn install(&self, set: ChunkSet, sources: &[ChunkSet]) -> Result<u64> {
        let bytes = set.time_range.encoded_times.len() as u64
            + set
                .chunks
                .iter()
                .map(|c| c.encoded_samples.len() as u64)
                .sum::<u64>();
        let new_id = set.time_range.id;
        let old_ids: Vec<TimeRangeId> = sources.iter().map(|s| s.time_range.id).collect();

        self.store.insert_invalid_range(set)?;
        self.store.swap_validity(new_id, &old_ids)?;
        if self.config.delete_aggregated_chunks {
            self.store.delete_ranges(&old_ids)?;
        }
        Ok(bytes)
    }

    fn stats(&self) -> AggregationStats {
        AggregationStats {
            passes: self.passes.load(Ordering::Relaxed),
            ranges_considered: self.ranges_considered.load(Ordering::Relaxed),
            ranges_combined: self.ranges_combined.load(Ordering::Relaxed),
            aggregates_created: self.aggregates_created.load(Ordering::Relaxed),
            bytes_created: self.bytes_created.load(Ordering::Relaxed),
            failures: self.failures.load(Ordering::Relaxed),
        }
    }
}

/// Splits candidates (already ordered by host, category, start) into per-(host, category) runs.
fn group_by_key(candidates: &[ChunkSet]) -> Vec<&[ChunkSet]> {
    let mut groups = Vec::new();
    let mut start = 0;
    for i in 1..=candidates.len() {
        let boundary = i == candidates.len() || {
            let (a, b) = (&candidates[i - 1].time_range, &candidates[i].time_range);
            (a.host_id, a.category_id) != (b.host_id, b.category_id)
        };
        if boundary {
            groups.push(&candidates[start..i]);
            start = i;
        }
    }
    groups
}

/// Builds the aggregate of `sources` (time-ordered, same host and category) as an invalid range.
///
/// Kinds missing from a source are padded with a null run of that source's length so every
/// merged chunk stays aligned with the merged timeline.
pub fn merge_ranges(id: TimeRangeId, level: u8, sources: &[ChunkSet]) -> Result<ChunkSet> {
    let (Some(first), Some(last)) = (sources.first(), sources.last()) else {
        return Err(TimelineError::Internal("nothing to aggregate".to_string()));
    };
    let host_id = first.time_range.host_id;
    let category_id = first.time_range.category_id;

    let encoded_times =
        combine_times(sources.iter().map(|s| s.time_range.encoded_times.as_slice()))?;
    let sample_count: u32 = sources.iter().map(|s| s.time_range.sample_count).sum();
    if count_times(&encoded_times)? != sample_count {
        return Err(TimelineError::corrupt(format!(
            "merged timeline of range {} does not match its sample count {}",
            id, sample_count
        )));
    }

    let kinds: BTreeSet<SampleKindId> = sources
        .iter()
        .flat_map(|s| s.chunks.iter().map(|c| c.sample_kind_id))
        .collect();

    let mut chunks = Vec::with_capacity(kinds.len());
    for kind in kinds {
        let mut encoded = Vec::new();
        for source in sources {
            let range = &source.time_range;
            match source.chunk_for(kind) {
                Some(chunk) => {
                    let actual = count_samples(&chunk.encoded_samples).map_err(|e| {
                        TimelineError::CorruptEncoding {
                            details: e.to_string(),
                            host_id: Some(host_id),
                            sample_kind_id: Some(kind),
                            time_range_id: Some(range.id),
                        }
                    })?;
                    if actual != range.sample_count {
                        return Err(TimelineError::CorruptEncoding {
                            details: format!(
                                "chunk holds {} samples, its range {}",
                                actual, range.sample_count
                            ),
                            host_id: Some(host_id),
                            sample_kind_id: Some(kind),
                            time_range_id: Some(range.id),
                        });
                    }
                    encoded.extend_from_slice(&chunk.encoded_samples);
                }
                None => encode_null_run(&mut encoded, range.sample_count),
            }
        }
        chunks.push(EncodedChunk {
            host_id,
            sample_kind_id: kind,
            time_range_id: id,
            encoded_samples: encoded,
            sample_count,
        });
    }

    Ok(ChunkSet {
        time_range: TimeRange {
            id,
            host_id,
            category_id,
            start_time: first.time_range.start_time,
            end_time: last.time_range.end_time,
            encoded_times,
            sample_count,
            aggregation_level: level,
            valid: false,
        },
        chunks,
    })
}

/// Runs aggregation passes on a timer in its own thread, or on demand.
#[derive(Debug)]
pub struct Aggregator {
    shared: Arc<AggregatorShared>,
    cmd_tx: Mutex<Option<mpsc::Sender<AggregationCmd>>>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl Aggregator {
    fn shared(
        store: Arc<dyn TimelineStore>,
        config: AggregatorConfig,
        events: Arc<dyn TimelineEventListener>,
    ) -> Arc<AggregatorShared> {
        Arc::new(AggregatorShared {
            store,
            config,
            is_aggregating: AtomicBool::new(false),
            passes: AtomicU64::new(0),
            ranges_considered: AtomicU64::new(0),
            ranges_combined: AtomicU64::new(0),
            aggregates_created: AtomicU64::new(0),
            bytes_created: AtomicU64::new(0),
            failures: AtomicU64::new(0),
            events,
        })
    }

    /// An aggregator without a timer thread; passes run only through [`Aggregator::run_now`].
    pub fn manual(
        store: Arc<dyn TimelineStore>,
        config: AggregatorConfig,
        events: Arc<dyn TimelineEventListener>,
    ) -> Self {
        Aggregator {
            shared: Self::shared(store, config, events),
            cmd_tx: Mutex::new(None),
            thread: Mutex::new(None),
        }
    }

    /// Starts the timer thread; the first pass runs after one interval.
    pub fn start(
        store: Arc<dyn TimelineStore>,
        config: AggregatorConfig,
        events: Arc<dyn TimelineEventListener>,
    ) -> Result<Self> {
        let shared = Self::shared(store, config, events);
        let (tx, rx) = mpsc::channel();
        let shared_clone = Arc::clone(&shared);
        let handle = thread::Builder::new()
            .name("timelines-aggregator".to_string())
            .spawn(move || aggregation_loop(rx, shared_clone))
            .map_err(|e| TimelineError::BackgroundTaskError(e.to_string()))?;
        Ok(Aggregator {
            shared,
            cmd_tx: Mutex::new(Some(tx)),
            thread: Mutex::new(Some(handle)),
        })
    }

    /// Runs a pass now and waits for it. `None` means a pass was already in progress.
    pub fn run_now(&self) -> Result<Option<PassSummary>> {
        let tx = self.cmd_tx.lock()?.clone();
        let Some(tx) = tx else {
            return self.shared.run_pass();
        };
        let (ack_tx, ack_rx) = mpsc::channel();
        tx.send(AggregationCmd::Force { ack: ack_tx }).map_err(|e| {
            TimelineError::BackgroundTaskError(format!("Failed to request aggregation: {}", e))
        })?;
        ack_rx.recv().map_err(|e| {
            TimelineError::BackgroundTaskError(format!("Failed to receive aggregation ack: {}", e))
        })?
    }

    /// Asks the timer thread for an early pass without waiting.
    pub fn nudge(&self) {
        if let Ok(guard) = self.cmd_tx.lock() {
            if let Some(tx) = guard.as_ref() {
                let _ = tx.send(AggregationCmd::Maybe);
            }
        }
    }

    pub fn is_aggregating(&self) -> bool {
        self.shared.is_aggregating.load(Ordering::SeqCst)
    }

    pub fn stats(&self) -> AggregationStats {
        self.shared.stats()
    }

    /// Stops the timer thread, waiting for a running pass to finish.
    pub fn shutdown(&self) -> Result<()> {
        if let Some(tx) = self.cmd_tx.lock()?.take() {
            let _ = tx.send(AggregationCmd::Shutdown);
        }
        if let Some(handle) = self.thread.lock()?.take() {
            handle.join().map_err(|_| {
                TimelineError::BackgroundTaskError("aggregator thread panicked".to_string())
            })?;
        }
        Ok(())
    }
}

impl Drop for Aggregator {
    fn drop(&mut self) {
        let _ = self.shutdown();
    }
}

fn aggregation_loop(rx: mpsc::Receiver<AggregationCmd>, shared: Arc<AggregatorShared>) {
    loop {
        match rx.recv_timeout(shared.config.interval) {
            Ok(AggregationCmd::Shutdown) | Err(mpsc::RecvTimeoutError::Disconnected) => break,
            Ok(AggregationCmd::Force { ack }) => {
                let _ = ack.send(shared.run_pass());
            }
            Ok(AggregationCmd::Maybe) | Err(mpsc::RecvTimeoutError::Timeout) => {
                if let Err(e) = shared.run_pass() {
                    shared.events.on_event(TimelineEvent::AggregationFailed {
                        host_id: 0,
                        category_id: 0,
                        level: 0,
                        error: e.to_string(),
                    });
                }
            }
        }
    }
}
