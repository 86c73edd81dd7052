//! Ingest entry point: resolution, backing-log durability, routing, replay and shutdown.

use crate::accumulator::{AccumulatorContext, HostAccumulator};
use crate::error::{Result, TimelineError};
use crate::persistence::BackingLog;
use crate::resolver::IdResolver;
use crate::store::TimelineStore;
use crate::telemetry::{timeline_metrics, TimelineEvent, TimelineEventListener};
use crate::types::{
    AccumulatorKey, ChunkSet, Event, HostId, HostSampleBatch, SampleKindId, Timestamp,
};
use crate::writer::ChunkWriter;

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};

/// What [`EventHandler::shutdown`] does with data that is not yet durable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ShutdownMode {
    /// Cut and persist every open window, then discard the backing log.
    #[default]
    Flush,
    /// Persist only what is already queued, save per-accumulator replay watermarks and keep the
    /// backing log for the next start.
    SaveStartTimes,
}

/// Point-in-time handler counters.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HandlerStats {
    pub events_handled: u64,
    pub events_discarded: u64,
    pub events_rejected_after_shutdown: u64,
    pub samples_rejected: u64,
    pub replayed_batches: u64,
    pub accumulators: usize,
}

/// Timing knobs for draining the writer.
#[derive(Debug, Clone, Copy)]
pub struct DrainSettings {
    pub grace_period: Duration,
    pub poll_interval: Duration,
}

#[derive(Debug)]
pub struct EventHandler {
    resolver: Arc<dyn IdResolver>,
    store: Arc<dyn TimelineStore>,
    writer: Arc<ChunkWriter>,
    log: Mutex<Box<dyn BackingLog>>,
    accumulators: DashMap<AccumulatorKey, Arc<HostAccumulator>>,
    ctx: AccumulatorContext,
    /// Read side: one event's log append plus accumulator update. Write side: rotate + cut all.
    commit_gate: RwLock<()>,
    shutting_down: AtomicBool,
    drain: DrainSettings,
    events_handled: AtomicU64,
    events_discarded: AtomicU64,
    events_rejected_after_shutdown: AtomicU64,
    replayed_batches: AtomicU64,
    events: Arc<dyn TimelineEventListener>,
}

impl EventHandler {
    pub fn new(
        resolver: Arc<dyn IdResolver>,
        store: Arc<dyn TimelineStore>,
        writer: Arc<ChunkWriter>,
        log: Box<dyn BackingLog>,
        ctx: AccumulatorContext,
        drain: DrainSettings,
    ) -> Self {
        let events = ctx.events.clone();
        EventHandler {
            resolver,
            store,
            writer,
            log: Mutex::new(log),
            accumulators: DashMap::new(),
            ctx,
            commit_gate: RwLock::new(()),
            shutting_down: AtomicBool::new(false),
            drain,
            events_handled: AtomicU64::new(0),
            events_discarded: AtomicU64::new(0),
            events_rejected_after_shutdown: AtomicU64::new(0),
            replayed_batches: AtomicU64::new(0),
            events,
        }
    }

    /// Accepts one event.
    ///
    /// Returns `Ok(false)` when the event was dropped: unresolvable, empty, received after
    /// shutdown, or rejected by its accumulator for a non-increasing timestamp.
    pub fn handle(&self, event: Event) -> Result<bool> {
        if self.shutting_down.load(Ordering::SeqCst) {
            self.reject_after_shutdown();
            return Ok(false);
        }

        let batch = match self.resolve(&event) {
            Ok(batch) => batch,
            Err(e) => {
                self.discard(e.to_string());
                return Ok(false);
            }
        };

        let _gate = self.commit_gate.read()?;
        // Shutdown may have cut every window while this call waited on the gate.
        if self.shutting_down.load(Ordering::SeqCst) {
            self.reject_after_shutdown();
            return Ok(false);
        }
        self.log.lock()?.append(&batch)?;
        let accepted = self.route(&batch)?;
        if accepted {
            self.events_handled.fetch_add(1, Ordering::Relaxed);
            timeline_metrics::record_event_handled();
        }
        Ok(accepted)
    }

    fn resolve(&self, event: &Event) -> Result<HostSampleBatch> {
        if event.samples.is_empty() {
            return Err(TimelineError::Resolution(format!(
                "event for {}/{} carries no samples",
                event.host, event.category
            )));
        }
        let host_id = self.resolver.resolve_host(&event.host)?;
        let category_id = self.resolver.resolve_category(&event.category)?;
        let mut samples = BTreeMap::new();
        for (name, value) in &event.samples {
            let kind = self
                .resolver
                .resolve_sample_kind(host_id, category_id, name)?;
            samples.insert(kind, *value);
        }
        Ok(HostSampleBatch {
            host_id,
            category_id,
            timestamp: event.timestamp,
            samples,
        })
    }

    fn reject_after_shutdown(&self) {
        self.events_rejected_after_shutdown
            .fetch_add(1, Ordering::Relaxed);
        self.events.on_event(TimelineEvent::EventRejectedAfterShutdown);
    }

    fn discard(&self, reason: String) {
        self.events_discarded.fetch_add(1, Ordering::Relaxed);
        timeline_metrics::record_event_discarded();
        self.events.on_event(TimelineEvent::EventDiscarded { reason });
    }

    fn accumulator(&self, key: AccumulatorKey) -> Arc<HostAccumulator> {
        // Clone the Arc out so the map shard is released before the accumulator is touched.
        self.accumulators
            .entry(key)
            .or_insert_with(|| Arc::new(HostAccumulator::new(key.0, key.1, self.ctx.clone())))
            .value()
            .clone()
    }

    fn route(&self, batch: &HostSampleBatch) -> Result<bool> {
        self.accumulator(batch.key()).add_samples(batch)
    }

    fn snapshot_accumulators(&self) -> Vec<Arc<HostAccumulator>> {
        self.accumulators.iter().map(|e| e.value().clone()).collect()
    }

    /// Rebuilds in-memory state from the backing log. Returns the number of replayed batches.
    ///
    /// Records older than a saved fast-shutdown watermark are skipped; keys without a watermark
    /// use the smallest one. Records at or before the end of a range the store already holds
    /// for their key are skipped too, since a crash can leave the log un-rotated after the
    /// writer committed. Watermarks are deleted afterwards.
    pub fn replay(&self) -> Result<u64> {
        self.events.on_event(TimelineEvent::ReplayStarted);
        let watermarks = self.store.last_start_times()?;
        let floor = watermarks.values().min().copied();

        let _gate = self.commit_gate.write()?;
        let mut records = Vec::new();
        self.log.lock()?.read_all(&mut |batch| records.push(batch))?;
        let persisted = self.persisted_ends(&records)?;

        let mut replayed = 0u64;
        let mut skipped = 0u64;
        for batch in records {
            let threshold = watermarks.get(&batch.key()).copied().or(floor);
            if threshold.is_some_and(|w| batch.timestamp < w) {
                skipped += 1;
                continue;
            }
            if persisted
                .get(&batch.key())
                .is_some_and(|end| batch.timestamp <= *end)
            {
                skipped += 1;
                continue;
            }
            if self.route(&batch)? {
                replayed += 1;
            } else {
                skipped += 1;
            }
        }
        drop(_gate);

        if !watermarks.is_empty() {
            self.store.delete_last_start_times()?;
        }
        self.replayed_batches.fetch_add(replayed, Ordering::Relaxed);
        self.events
            .on_event(TimelineEvent::ReplayFinished { replayed, skipped });
        Ok(replayed)
    }

    /// Latest persisted range end per key, for the hosts that appear in `records`.
    fn persisted_ends(
        &self,
        records: &[HostSampleBatch],
    ) -> Result<BTreeMap<AccumulatorKey, Timestamp>> {
        let hosts: BTreeSet<HostId> = records.iter().map(|b| b.host_id).collect();
        let mut ends = BTreeMap::new();
        for host_id in hosts {
            for set in self.store.ranges_for_host(host_id, None, None)? {
                let range = &set.time_range;
                let end = ends
                    .entry((range.host_id, range.category_id))
                    .or_insert(range.end_time);
                *end = (*end).max(range.end_time);
            }
        }
        Ok(ends)
    }

    /// Cuts every open window and waits (bounded) for the writer to persist it.
    ///
    /// The backing log is rotated under the same exclusive gate, so the sealed segments hold
    /// exactly the events that were cut. They are deleted only once the writer has drained;
    /// otherwise they stay for replay. Returns whether the drain completed.
    pub fn force_flush(&self, shutdown: bool) -> Result<bool> {
        let sealed = {
            let _gate = self.commit_gate.write()?;
            let sealed = self.log.lock()?.rotate()?;
            for acc in self.snapshot_accumulators() {
                acc.extract_and_queue_chunks()?;
            }
            sealed
        };

        if shutdown {
            self.writer.initiate_shutdown();
        }
        // Failures are reported by the writer and retried while waiting.
        let _ = self.writer.force_write();
        let drained = self.wait_for_drain();
        if drained {
            if let Err(e) = self.log.lock()?.discard_rotated(&sealed) {
                self.events.on_event(TimelineEvent::BackingLogDiscardFailed {
                    error: e.to_string(),
                });
            }
        }
        Ok(drained)
    }

    fn wait_for_drain(&self) -> bool {
        let started = Instant::now();
        let drained = self
            .writer
            .wait_drained(self.drain.grace_period, self.drain.poll_interval);
        if !drained {
            self.events.on_event(TimelineEvent::DrainTimedOut {
                pending_batches: self.writer.stats().pending_batches,
                waited: started.elapsed(),
            });
        }
        drained
    }

    /// Stops accepting events and leaves the collector in a restartable state. Idempotent.
    pub fn shutdown(&self, mode: ShutdownMode) -> Result<()> {
        if self
            .shutting_down
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Ok(());
        }

        let result = match mode {
            ShutdownMode::Flush => self.shutdown_flush(),
            ShutdownMode::SaveStartTimes => self.shutdown_save_start_times(),
        };
        let writer_result = self.writer.shutdown();
        result.and(writer_result)
    }

    fn shutdown_flush(&self) -> Result<()> {
        if self.force_flush(true)? {
            let _gate = self.commit_gate.write()?;
            if let Err(e) = self.log.lock()?.discard() {
                self.events.on_event(TimelineEvent::BackingLogDiscardFailed {
                    error: e.to_string(),
                });
            }
        }
        Ok(())
    }

    fn shutdown_save_start_times(&self) -> Result<()> {
        self.writer.initiate_shutdown();
        let _ = self.writer.force_write();
        self.wait_for_drain();

        let _gate = self.commit_gate.write()?;
        let mut watermarks = BTreeMap::new();
        for acc in self.snapshot_accumulators() {
            let earliest = match acc.earliest_unpersisted_time()? {
                Some(t) => t,
                // Everything durable: only later events need replaying.
                None => match acc.end_time()? {
                    Some(end) => end.saturating_add(1),
                    None => continue,
                },
            };
            watermarks.insert(acc.key(), earliest);
        }
        if !watermarks.is_empty() {
            self.store.set_last_start_times(&watermarks)?;
        }
        Ok(())
    }

    /// Deep copies of not-yet-durable chunks of `host_id`, across all its categories.
    pub fn get_in_memory_chunks(
        &self,
        host_id: HostId,
        kinds: Option<&[SampleKindId]>,
        start: Option<Timestamp>,
        end: Option<Timestamp>,
    ) -> Result<Vec<ChunkSet>> {
        let mut accs: Vec<Arc<HostAccumulator>> = self
            .accumulators
            .iter()
            .filter(|e| e.key().0 == host_id)
            .map(|e| e.value().clone())
            .collect();
        accs.sort_by_key(|a| a.category_id());

        let mut out = Vec::new();
        for acc in accs {
            out.extend(acc.in_memory_chunks(kinds, start, end)?);
        }
        Ok(out)
    }

    pub fn accumulator_for(&self, key: AccumulatorKey) -> Option<Arc<HostAccumulator>> {
        self.accumulators.get(&key).map(|e| e.value().clone())
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::SeqCst)
    }

    pub fn writer(&self) -> &Arc<ChunkWriter> {
        &self.writer
    }

    pub fn stats(&self) -> HandlerStats {
        let accs = self.snapshot_accumulators();
        HandlerStats {
            events_handled: self.events_handled.load(Ordering::Relaxed),
            events_discarded: self.events_discarded.load(Ordering::Relaxed),
            events_rejected_after_shutdown: self
                .events_rejected_after_shutdown
                .load(Ordering::Relaxed),
            samples_rejected: accs.iter().map(|a| a.rejected_samples()).sum(),
            replayed_batches: self.replayed_batches.load(Ordering::Relaxed),
            accumulators: accs.len(),
        }
    }

    /// Sum of out-of-order acknowledgements seen by all accumulators.
    pub fn ack_mismatches(&self) -> u64 {
        self.accumulators
            .iter()
            .map(|e| e.value().ack_mismatches())
            .sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::accumulator::FixedJitter;
    use crate::encoding::decode_chunk;
    use crate::persistence::MemoryBackingLog;
    use crate::resolver::InMemoryIdResolver;
    use crate::store::CatalogStore;
    use crate::telemetry::noop_event_listener;
    use crate::types::SampleValue;
    use crate::writer::WriterConfig;

    fn handler(store: Arc<CatalogStore>) -> EventHandler {
        let writer = Arc::new(
            ChunkWriter::start(
                store.clone(),
                WriterConfig {
                    background: false,
                    ..WriterConfig::default()
                },
                noop_event_listener(),
            )
            .unwrap(),
        );
        let ctx = AccumulatorContext {
            chunk_length_ms: 1_000_000,
            jitter: Arc::new(FixedJitter(999_999)),
            sink: writer.clone(),
            time_range_ids: store.time_range_ids(),
            events: noop_event_listener(),
        };
        EventHandler::new(
            Arc::new(InMemoryIdResolver::new()),
            store,
            writer,
            Box::new(MemoryBackingLog::new()),
            ctx,
            DrainSettings {
                grace_period: Duration::from_secs(2),
                poll_interval: Duration::from_millis(5),
            },
        )
    }

    #[test]
    fn test_unresolvable_and_empty_events_are_discarded() {
        let h = handler(Arc::new(CatalogStore::in_memory()));
        assert!(!h.handle(Event::new("web", "cpu", 1)).unwrap());
        assert!(!h.handle(Event::new("", "cpu", 1).with_sample("user", 1i64)).unwrap());
        assert!(h.handle(Event::new("web", "cpu", 1).with_sample("user", 1i64)).unwrap());
        let stats = h.stats();
        assert_eq!(stats.events_discarded, 2);
        assert_eq!(stats.events_handled, 1);
    }

    #[test]
    fn test_categories_get_separate_accumulators() {
        let h = handler(Arc::new(CatalogStore::in_memory()));
        h.handle(Event::new("web", "cpu", 1).with_sample("user", 1i64)).unwrap();
        h.handle(Event::new("web", "mem", 1).with_sample("used", 2i64)).unwrap();
        h.handle(Event::new("db", "cpu", 1).with_sample("user", 3i64)).unwrap();
        assert_eq!(h.stats().accumulators, 3);

        let web = h.get_in_memory_chunks(1, None, None, None).unwrap();
        assert_eq!(web.len(), 2, "one open window per category");
        assert_eq!(decode_chunk(&web[0].chunks[0]).unwrap(), vec![SampleValue::Int(1)]);
    }

    #[test]
    fn test_force_flush_persists_open_windows() {
        let store = Arc::new(CatalogStore::in_memory());
        let h = handler(store.clone());
        for t in 0..5u64 {
            h.handle(Event::new("web", "cpu", t).with_sample("user", t as i64)).unwrap();
        }
        assert!(h.force_flush(false).unwrap());
        let persisted = store.ranges_for_host(1, None, None).unwrap();
        assert_eq!(persisted.len(), 1);
        assert_eq!(persisted[0].time_range.sample_count, 5);
        assert!(h.get_in_memory_chunks(1, None, None, None).unwrap().is_empty());
    }

    #[test]
    fn test_events_after_shutdown_are_rejected() {
        let h = handler(Arc::new(CatalogStore::in_memory()));
        h.handle(Event::new("web", "cpu", 1).with_sample("user", 1i64)).unwrap();
        h.shutdown(ShutdownMode::Flush).unwrap();
        h.shutdown(ShutdownMode::Flush).unwrap();
        assert!(!h.handle(Event::new("web", "cpu", 2).with_sample("user", 1i64)).unwrap());
        assert_eq!(h.stats().events_rejected_after_shutdown, 1);
    }

    #[test]
    fn test_event_waiting_on_the_gate_during_shutdown_is_rejected() {
        let store = Arc::new(CatalogStore::in_memory());
        let h = Arc::new(handler(store.clone()));
        h.handle(Event::new("web", "cpu", 1).with_sample("user", 1i64)).unwrap();

        let gate = h.commit_gate.write().unwrap();
        let late = {
            let h = h.clone();
            std::thread::spawn(move || {
                h.handle(Event::new("web", "cpu", 2).with_sample("user", 2i64))
                    .unwrap()
            })
        };
        std::thread::sleep(Duration::from_millis(50));
        h.shutting_down.store(true, Ordering::SeqCst);
        drop(gate);

        assert!(!late.join().unwrap());
        assert_eq!(h.stats().events_rejected_after_shutdown, 1);
        assert_eq!(h.stats().events_handled, 1);
        let open = h.get_in_memory_chunks(1, None, None, None).unwrap();
        assert_eq!(open[0].time_range.sample_count, 1);
    }

    #[test]
    fn test_save_start_times_records_watermarks() {
        let store = Arc::new(CatalogStore::in_memory());
        let h = handler(store.clone());
        h.handle(Event::new("web", "cpu", 100).with_sample("user", 1i64)).unwrap();
        h.handle(Event::new("web", "cpu", 200).with_sample("user", 1i64)).unwrap();
        h.shutdown(ShutdownMode::SaveStartTimes).unwrap();

        let marks = store.last_start_times().unwrap();
        assert_eq!(marks.get(&(1, 1)), Some(&100));
        assert!(store.ranges_for_host(1, None, None).unwrap().is_empty());
    }
}
