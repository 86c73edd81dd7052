//! Collector wiring: configuration, component startup, periodic commit, health and shutdown.

use crate::accumulator::{AccumulatorContext, DeadlineJitter, RandomJitter};
use crate::aggregator::{AggregationStats, Aggregator, AggregatorConfig, PassSummary};
use crate::error::{Result, TimelineError};
use crate::handler::{DrainSettings, EventHandler, HandlerStats, ShutdownMode};
use crate::persistence::{BackingLog, FileBackingLog, MemoryBackingLog};
use crate::resolver::{IdResolver, InMemoryIdResolver};
use crate::store::{CatalogStore, TimelineStore};
use crate::telemetry::{noop_event_listener, TimelineEvent, TimelineEventListener};
use crate::types::{ChunkSet, Event, HostId, SampleKindId, Timestamp};
use crate::writer::{ChunkWriter, WriterConfig, WriterStats};

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc, Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

/// Configuration options for the [`Collector`].
#[derive(Debug, Clone)]
pub struct CollectorConfig {
    /// Directory for the backing log (`blog/`) and the persisted catalog (`catalog/`).
    pub data_dir: PathBuf,
    /// Upper bound of the random cut deadline after a window's first sample.
    pub chunk_length: Duration,
    /// Persist from a writer thread; otherwise every cut is written synchronously.
    pub background_writes: bool,
    /// Pending chunk count that triggers a background write.
    pub write_batch_size: usize,
    /// Longest a cut batch waits for a background write.
    pub max_write_delay: Duration,
    /// How often the writer thread checks its thresholds.
    pub write_check_interval: Duration,
    /// Run aggregation passes on a timer.
    pub aggregation_enabled: bool,
    pub aggregation_interval: Duration,
    /// Ranges merged per aggregate, indexed by level.
    pub chunks_to_aggregate: Vec<usize>,
    pub max_aggregation_level: u8,
    pub delete_aggregated_chunks: bool,
    pub shutdown_mode: ShutdownMode,
    /// Bound on waiting for the writer to drain during flush and shutdown.
    pub shutdown_grace_period: Duration,
    pub drain_poll_interval: Duration,
    /// Run a committer thread that cuts and persists every open window periodically.
    pub periodic_commit: bool,
    /// Committer period. `None` uses `chunk_length`.
    pub commit_interval: Option<Duration>,
    /// Keep the catalog in `data_dir`; otherwise it lives in memory only.
    pub persist_catalog: bool,
    /// Seed for cut-deadline jitter. `None` seeds from entropy.
    pub deadline_seed: Option<u64>,
    /// Replaces the random jitter entirely (deterministic chunk boundaries).
    pub deadline_jitter: Option<Arc<dyn DeadlineJitter>>,
    /// Structured event hook for observability (no-op by default).
    pub event_listener: Arc<dyn TimelineEventListener>,
}

impl Default for CollectorConfig {
    fn default() -> Self {
        CollectorConfig {
            data_dir: PathBuf::from("./data"),
            chunk_length: Duration::from_secs(10 * 60),
            background_writes: true,
            write_batch_size: 1000,
            max_write_delay: Duration::from_secs(30),
            write_check_interval: Duration::from_secs(1),
            aggregation_enabled: true,
            aggregation_interval: Duration::from_secs(60 * 60),
            chunks_to_aggregate: vec![12],
            max_aggregation_level: 1,
            delete_aggregated_chunks: true,
            shutdown_mode: ShutdownMode::Flush,
            shutdown_grace_period: Duration::from_secs(30),
            drain_poll_interval: Duration::from_millis(50),
            periodic_commit: true,
            commit_interval: None,
            persist_catalog: true,
            deadline_seed: None,
            deadline_jitter: None,
            event_listener: noop_event_listener(),
        }
    }
}

impl CollectorConfig {
    /// Rejects settings the components cannot run with.
    pub fn validate(&self) -> Result<()> {
        let invalid = |msg: &str| Err(TimelineError::ConfigError(msg.to_string()));
        if self.chunk_length.is_zero() {
            return invalid("chunk_length must be > 0");
        }
        if self.write_batch_size == 0 {
            return invalid("write_batch_size must be > 0");
        }
        if self.write_check_interval.is_zero() {
            return invalid("write_check_interval must be > 0");
        }
        if self.drain_poll_interval.is_zero() {
            return invalid("drain_poll_interval must be > 0");
        }
        if self.aggregation_enabled && self.aggregation_interval.is_zero() {
            return invalid("aggregation_interval must be > 0");
        }
        if self.chunks_to_aggregate.iter().any(|&n| n < 2) {
            return invalid("chunks_to_aggregate entries must be >= 2");
        }
        if self.commit_interval.is_some_and(|d| d.is_zero()) {
            return invalid("commit_interval must be > 0");
        }
        Ok(())
    }

    /// The committer period, if the committer runs.
    pub fn effective_commit_interval(&self) -> Option<Duration> {
        self.periodic_commit
            .then(|| self.commit_interval.unwrap_or(self.chunk_length))
    }

    fn writer_config(&self) -> WriterConfig {
        WriterConfig {
            background: self.background_writes,
            batch_size: self.write_batch_size,
            max_delay: self.max_write_delay,
            check_interval: self.write_check_interval,
        }
    }

    fn aggregator_config(&self) -> AggregatorConfig {
        AggregatorConfig {
            interval: self.aggregation_interval,
            chunks_to_aggregate: self.chunks_to_aggregate.clone(),
            max_aggregation_level: self.max_aggregation_level,
            delete_aggregated_chunks: self.delete_aggregated_chunks,
        }
    }
}

/// Counters of every component at one point in time.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CollectorStats {
    pub handler: HandlerStats,
    pub writer: WriterStats,
    pub aggregation: AggregationStats,
    pub ack_mismatches: u64,
}

/// Liveness summary for health checks and dashboards.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Health {
    /// Replay finished and events are being accepted.
    pub ready: bool,
    pub shutting_down: bool,
    pub writer_last_error: Option<String>,
    pub pending_batches: usize,
    pub ack_mismatches: u64,
    pub aggregating: bool,
}

/// The ingestion and compaction core, fully wired.
///
/// Call [`Collector::replay`] once after opening to rebuild state that was not yet durable,
/// then feed events through [`Collector::handle`].
#[derive(Debug)]
pub struct Collector {
    config: CollectorConfig,
    store: Arc<dyn TimelineStore>,
    handler: Arc<EventHandler>,
    writer: Arc<ChunkWriter>,
    aggregator: Aggregator,
    committer: Mutex<Option<(mpsc::Sender<()>, JoinHandle<()>)>>,
    ready: AtomicBool,
    shut_down: AtomicBool,
}

impl Collector {
    /// Opens the file-backed collector under `config.data_dir`.
    pub fn open(config: CollectorConfig) -> Result<Self> {
        config.validate()?;
        let events = config.event_listener.clone();
        let store: Arc<dyn TimelineStore> = if config.persist_catalog {
            let store = CatalogStore::open(config.data_dir.join("catalog"))?
                .with_event_listener(events.clone());
            store.purge_orphans()?;
            Arc::new(store)
        } else {
            Arc::new(CatalogStore::in_memory().with_event_listener(events))
        };
        let log = FileBackingLog::open(config.data_dir.join("blog"))?;
        Self::with_parts(
            config,
            store,
            Arc::new(InMemoryIdResolver::new()),
            Box::new(log),
        )
    }

    /// A collector that keeps everything in memory.
    pub fn in_memory(mut config: CollectorConfig) -> Result<Self> {
        config.persist_catalog = false;
        let store = Arc::new(
            CatalogStore::in_memory().with_event_listener(config.event_listener.clone()),
        );
        Self::with_parts(
            config,
            store,
            Arc::new(InMemoryIdResolver::new()),
            Box::new(MemoryBackingLog::new()),
        )
    }

    /// Wires the collector from caller-supplied collaborators.
    pub fn with_parts(
        config: CollectorConfig,
        store: Arc<dyn TimelineStore>,
        resolver: Arc<dyn IdResolver>,
        log: Box<dyn BackingLog>,
    ) -> Result<Self> {
        config.validate()?;
        let events = config.event_listener.clone();

        let writer = Arc::new(ChunkWriter::start(
            store.clone(),
            config.writer_config(),
            events.clone(),
        )?);

        let jitter: Arc<dyn DeadlineJitter> = match (&config.deadline_jitter, config.deadline_seed)
        {
            (Some(jitter), _) => jitter.clone(),
            (None, Some(seed)) => Arc::new(RandomJitter::seeded(seed)),
            (None, None) => Arc::new(RandomJitter::from_entropy()),
        };
        let ctx = AccumulatorContext {
            chunk_length_ms: config.chunk_length.as_millis() as u64,
            jitter,
            sink: writer.clone(),
            time_range_ids: store.time_range_ids(),
            events: events.clone(),
        };
        let handler = Arc::new(EventHandler::new(
            resolver,
            store.clone(),
            writer.clone(),
            log,
            ctx,
            DrainSettings {
                grace_period: config.shutdown_grace_period,
                poll_interval: config.drain_poll_interval,
            },
        ));

        let aggregator = if config.aggregation_enabled {
            Aggregator::start(store.clone(), config.aggregator_config(), events.clone())?
        } else {
            Aggregator::manual(store.clone(), config.aggregator_config(), events.clone())
        };

        let committer = match config.effective_commit_interval() {
            Some(interval) => Some(spawn_committer(handler.clone(), interval, events)?),
            None => None,
        };

        Ok(Collector {
            config,
            store,
            handler,
            writer,
            aggregator,
            committer: Mutex::new(committer),
            ready: AtomicBool::new(false),
            shut_down: AtomicBool::new(false),
        })
    }

    /// Replays the backing log and marks the collector ready. Returns the replayed batch count.
    pub fn replay(&self) -> Result<u64> {
        let replayed = self.handler.replay()?;
        self.ready.store(true, Ordering::SeqCst);
        Ok(replayed)
    }

    /// See [`EventHandler::handle`].
    pub fn handle(&self, event: Event) -> Result<bool> {
        self.handler.handle(event)
    }

    pub fn get_in_memory_chunks(
        &self,
        host_id: HostId,
        kinds: Option<&[SampleKindId]>,
        start: Option<Timestamp>,
        end: Option<Timestamp>,
    ) -> Result<Vec<ChunkSet>> {
        self.handler.get_in_memory_chunks(host_id, kinds, start, end)
    }

    /// Cuts and persists every open window. Returns whether the writer drained in time.
    pub fn force_flush(&self) -> Result<bool> {
        self.handler.force_flush(false)
    }

    /// Runs an aggregation pass now. `None` means one was already running.
    pub fn aggregate_now(&self) -> Result<Option<PassSummary>> {
        self.aggregator.run_now()
    }

    pub fn handler(&self) -> &Arc<EventHandler> {
        &self.handler
    }

    pub fn store(&self) -> &Arc<dyn TimelineStore> {
        &self.store
    }

    pub fn config(&self) -> &CollectorConfig {
        &self.config
    }

    pub fn stats(&self) -> CollectorStats {
        CollectorStats {
            handler: self.handler.stats(),
            writer: self.writer.stats(),
            aggregation: self.aggregator.stats(),
            ack_mismatches: self.handler.ack_mismatches(),
        }
    }

    pub fn health(&self) -> Health {
        let writer = self.writer.stats();
        Health {
            ready: self.ready.load(Ordering::SeqCst) && !self.handler.is_shutting_down(),
            shutting_down: self.handler.is_shutting_down(),
            writer_last_error: writer.last_error,
            pending_batches: writer.pending_batches,
            ack_mismatches: self.handler.ack_mismatches(),
            aggregating: self.aggregator.is_aggregating(),
        }
    }

    /// Stops the committer and aggregator, then shuts the handler down in the configured mode.
    /// Idempotent.
    pub fn shutdown(&self) -> Result<()> {
        if self.shut_down.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.stop_committer()?;
        let aggregator_result = self.aggregator.shutdown();
        self.handler.shutdown(self.config.shutdown_mode)?;
        aggregator_result
    }

    fn stop_committer(&self) -> Result<()> {
        if let Some((tx, handle)) = self.committer.lock()?.take() {
            let _ = tx.send(());
            handle.join().map_err(|_| {
                TimelineError::BackgroundTaskError("committer thread panicked".to_string())
            })?;
        }
        Ok(())
    }
}

/// Stops background threads only; open windows stay in the backing log for replay.
impl Drop for Collector {
    fn drop(&mut self) {
        let _ = self.stop_committer();
        let _ = self.aggregator.shutdown();
    }
}

fn spawn_committer(
    handler: Arc<EventHandler>,
    interval: Duration,
    events: Arc<dyn TimelineEventListener>,
) -> Result<(mpsc::Sender<()>, JoinHandle<()>)> {
    let (tx, rx) = mpsc::channel::<()>();
    let handle = thread::Builder::new()
        .name("timelines-committer".to_string())
        .spawn(move || loop {
            match rx.recv_timeout(interval) {
                Err(mpsc::RecvTimeoutError::Timeout) => {
                    if handler.is_shutting_down() {
                        break;
                    }
                    match handler.force_flush(false) {
                        Ok(true) => {}
                        Ok(false) => events.on_event(TimelineEvent::CommitFailed {
                            error: "writer did not drain in time".to_string(),
                        }),
                        Err(e) => events.on_event(TimelineEvent::CommitFailed {
                            error: e.to_string(),
                        }),
                    }
                }
                Ok(()) | Err(mpsc::RecvTimeoutError::Disconnected) => break,
            }
        })
        .map_err(|e| TimelineError::BackgroundTaskError(e.to_string()))?;
    Ok((tx, handle))
}
