use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

#[cfg(feature = "prometheus")]
use std::sync::atomic::{AtomicBool, Ordering};
#[cfg(feature = "prometheus")]
use std::sync::Mutex;
#[cfg(feature = "prometheus")]
use std::thread::JoinHandle;

use crate::types::{CategoryId, HostId, SampleKindId, TimeRangeId, Timestamp};

/// Structured, in-process event hook for observability.
///
/// The collector core is a library and never prints. Callers provide an implementation that
/// forwards these events to `tracing`, metrics, or custom sinks. [`TracingEventListener`] is the
/// ready-made `tracing` forwarder the daemon installs.
pub trait TimelineEventListener: std::fmt::Debug + Send + Sync + 'static {
    fn on_event(&self, event: TimelineEvent);
}

/// Structured events emitted by the collector core.
#[derive(Debug, Clone)]
pub enum TimelineEvent {
    SampleRejected {
        host_id: HostId,
        category_id: CategoryId,
        timestamp: Timestamp,
        end_time: Timestamp,
    },
    EventDiscarded { reason: String },
    EventRejectedAfterShutdown,
    AckSequenceMismatch {
        host_id: HostId,
        category_id: CategoryId,
        expected: Option<u64>,
        received: u64,
    },
    ChunksQueued {
        host_id: HostId,
        category_id: CategoryId,
        sequence_id: u64,
        time_range_id: TimeRangeId,
        chunk_count: usize,
        sample_count: u32,
    },

    WriterThreadStarted,
    WriterThreadStopping,
    WriterThreadPanicked,
    WritesPerformed { batches: usize, chunks: usize, duration: Duration },
    WriteFailed { batches: usize, error: String },
    DrainTimedOut { pending_batches: usize, waited: Duration },

    ReplayStarted,
    ReplayFinished { replayed: u64, skipped: u64 },
    BackingLogDiscardFailed { error: String },
    CommitFailed { error: String },
    CorruptChunkSkipped {
        host_id: HostId,
        sample_kind_id: SampleKindId,
        time_range_id: TimeRangeId,
        error: String,
    },

    AggregationStarted,
    AggregationAlreadyRunning,
    AggregationLevelFinished {
        level: u8,
        considered: u64,
        combined: u64,
        created: u64,
    },
    AggregationFailed {
        host_id: HostId,
        category_id: CategoryId,
        level: u8,
        error: String,
    },
    AggregationFinished { created: u64, duration: Duration },
    OrphanRangesPurged { count: usize },

    CatalogPersistFailed { path: PathBuf, error: String },
}

#[derive(Debug)]
pub struct NoopEventListener;

impl TimelineEventListener for NoopEventListener {
    #[inline]
    fn on_event(&self, _event: TimelineEvent) {}
}

pub fn noop_event_listener() -> Arc<dyn TimelineEventListener> {
    Arc::new(NoopEventListener)
}

/// Forwards every event to `tracing`, picking the level by severity.
#[derive(Debug, Default)]
pub struct TracingEventListener;

impl TimelineEventListener for TracingEventListener {
    fn on_event(&self, event: TimelineEvent) {
        use TimelineEvent::*;
        match event {
            SampleRejected { host_id, category_id, timestamp, end_time } => tracing::debug!(
                host_id,
                category_id,
                timestamp,
                end_time,
                "rejected non-increasing sample timestamp"
            ),
            EventDiscarded { reason } => tracing::debug!(%reason, "discarded event"),
            EventRejectedAfterShutdown => tracing::debug!("dropped event received after shutdown"),
            AckSequenceMismatch { host_id, category_id, expected, received } => tracing::error!(
                host_id,
                category_id,
                ?expected,
                received,
                "batch acknowledged out of order"
            ),
            ChunksQueued {
                host_id,
                category_id,
                sequence_id,
                time_range_id,
                chunk_count,
                sample_count,
            } => tracing::trace!(
                host_id,
                category_id,
                sequence_id,
                time_range_id,
                chunk_count,
                sample_count,
                "queued chunks"
            ),
            WriterThreadStarted => tracing::info!("chunk writer thread started"),
            WriterThreadStopping => tracing::info!("chunk writer thread stopping"),
            WriterThreadPanicked => tracing::error!("chunk writer thread panicked"),
            WritesPerformed { batches, chunks, duration } => tracing::debug!(
                batches,
                chunks,
                elapsed_ms = duration.as_millis() as u64,
                "persisted pending batches"
            ),
            WriteFailed { batches, error } => {
                tracing::error!(batches, %error, "persisting pending batches failed")
            }
            DrainTimedOut { pending_batches, waited } => tracing::warn!(
                pending_batches,
                waited_ms = waited.as_millis() as u64,
                "chunk writer did not drain before the grace period"
            ),
            ReplayStarted => tracing::info!("replaying backing log"),
            ReplayFinished { replayed, skipped } => {
                tracing::info!(replayed, skipped, "backing log replay finished")
            }
            BackingLogDiscardFailed { error } => {
                tracing::warn!(%error, "failed to discard backing log")
            }
            CommitFailed { error } => tracing::warn!(%error, "periodic commit failed"),
            CorruptChunkSkipped {
                host_id,
                sample_kind_id,
                time_range_id,
                error,
            } => tracing::warn!(
                host_id,
                sample_kind_id,
                time_range_id,
                %error,
                "skipped corrupt chunk"
            ),
            AggregationStarted => tracing::info!("aggregation pass started"),
            AggregationAlreadyRunning => tracing::info!("aggregation already running, skipping"),
            AggregationLevelFinished { level, considered, combined, created } => tracing::info!(
                level,
                considered,
                combined,
                created,
                "aggregation level finished"
            ),
            AggregationFailed { host_id, category_id, level, error } => tracing::error!(
                host_id,
                category_id,
                level,
                %error,
                "aggregating time ranges failed"
            ),
            AggregationFinished { created, duration } => tracing::info!(
                created,
                elapsed_ms = duration.as_millis() as u64,
                "aggregation pass finished"
            ),
            OrphanRangesPurged { count } => tracing::info!(count, "purged orphaned time ranges"),
            CatalogPersistFailed { path, error } => {
                tracing::error!(path = %path.display(), %error, "persisting catalog failed")
            }
        }
    }
}

/// Metrics instrumentation and in-process scraping.
///
/// Emitting metrics is a no-op until a recorder is installed, so the library can call these
/// unconditionally.
pub mod timeline_metrics {
    use super::*;

    use ::metrics::{describe_counter, describe_histogram, Unit};

    #[cfg(feature = "prometheus")]
    use metrics_exporter_prometheus::{BuildError, PrometheusBuilder, PrometheusHandle};

    // Counters are exposed as `<name>_total` by the Prometheus exporter.

    pub const EVENTS_HANDLED: &str = "timelines_events_handled";
    pub const EVENTS_DISCARDED: &str = "timelines_events_discarded";
    pub const SAMPLES_REJECTED: &str = "timelines_samples_rejected";
    pub const BATCHES_WRITTEN: &str = "timelines_batches_written";
    pub const CHUNKS_WRITTEN: &str = "timelines_chunks_written";
    pub const WRITE_FAILURES: &str = "timelines_write_failures";
    pub const WRITE_DURATION_SECONDS: &str = "timelines_write_duration_seconds";
    pub const AGGREGATES_CREATED: &str = "timelines_aggregates_created";

    /// Handle to the in-process Prometheus recorder.
    ///
    /// This does **not** start an HTTP server. Call [`InProcessPrometheus::render`] to scrape.
    #[cfg(feature = "prometheus")]
    #[derive(Debug)]
    pub struct InProcessPrometheus {
        handle: PrometheusHandle,
        stop: Arc<AtomicBool>,
        upkeep_thread: Mutex<Option<JoinHandle<()>>>,
    }

    #[cfg(feature = "prometheus")]
    impl InProcessPrometheus {
        /// Installs a global Prometheus recorder (once per process) and starts an upkeep thread.
        pub fn install(upkeep_interval: Duration) -> Result<Self, MetricsInitError> {
            describe_all();

            let handle = PrometheusBuilder::new()
                .install_recorder()
                .map_err(MetricsInitError::from_build_error)?;

            let stop = Arc::new(AtomicBool::new(false));
            let stop_clone = stop.clone();
            let handle_clone = handle.clone();
            let upkeep_thread = std::thread::Builder::new()
                .name("timelines-metrics-upkeep".to_string())
                .spawn(move || {
                    while !stop_clone.load(Ordering::Relaxed) {
                        std::thread::sleep(upkeep_interval);
                        handle_clone.run_upkeep();
                    }
                })
                .map_err(|e| MetricsInitError::ThreadSpawn(e.to_string()))?;

            Ok(Self {
                handle,
                stop,
                upkeep_thread: Mutex::new(Some(upkeep_thread)),
            })
        }

        /// Renders the current metrics in the Prometheus text exposition format.
        pub fn render(&self) -> String {
            self.handle.render()
        }
    }

    #[cfg(feature = "prometheus")]
    impl Drop for InProcessPrometheus {
        fn drop(&mut self) {
            self.stop.store(true, Ordering::Relaxed);
            if let Ok(mut guard) = self.upkeep_thread.lock() {
                if let Some(t) = guard.take() {
                    let _ = t.join();
                }
            }
        }
    }

    #[cfg(feature = "prometheus")]
    #[derive(Debug, thiserror::Error)]
    pub enum MetricsInitError {
        #[error("metrics recorder already installed")]
        AlreadyInstalled,
        #[error("failed to install prometheus recorder: {0}")]
        Install(String),
        #[error("failed to spawn upkeep thread: {0}")]
        ThreadSpawn(String),
    }

    #[cfg(feature = "prometheus")]
    impl MetricsInitError {
        fn from_build_error(e: BuildError) -> Self {
            match e {
                BuildError::FailedToSetGlobalRecorder(_) => MetricsInitError::AlreadyInstalled,
                other => MetricsInitError::Install(other.to_string()),
            }
        }
    }

    #[inline]
    pub fn record_event_handled() {
        ::metrics::counter!(EVENTS_HANDLED).increment(1);
    }

    #[inline]
    pub fn record_event_discarded() {
        ::metrics::counter!(EVENTS_DISCARDED).increment(1);
    }

    #[inline]
    pub fn record_sample_rejected() {
        ::metrics::counter!(SAMPLES_REJECTED).increment(1);
    }

    #[inline]
    pub fn record_write(duration: Duration, batches: u64, chunks: u64) {
        ::metrics::histogram!(WRITE_DURATION_SECONDS).record(duration.as_secs_f64());
        if batches > 0 {
            ::metrics::counter!(BATCHES_WRITTEN).increment(batches);
        }
        if chunks > 0 {
            ::metrics::counter!(CHUNKS_WRITTEN).increment(chunks);
        }
    }

    #[inline]
    pub fn record_write_failure() {
        ::metrics::counter!(WRITE_FAILURES).increment(1);
    }

    #[inline]
    pub fn record_aggregates_created(count: u64) {
        if count > 0 {
            ::metrics::counter!(AGGREGATES_CREATED).increment(count);
        }
    }

    #[cfg_attr(not(feature = "prometheus"), allow(dead_code))]
    fn describe_all() {
        describe_counter!(
            EVENTS_HANDLED,
            Unit::Count,
            "Events accepted by EventHandler::handle and routed to an accumulator."
        );
        describe_counter!(
            EVENTS_DISCARDED,
            Unit::Count,
            "Events dropped because identifiers could not be resolved or the payload was empty."
        );
        describe_counter!(
            SAMPLES_REJECTED,
            Unit::Count,
            "Sample batches rejected for a non-increasing timestamp."
        );
        describe_counter!(
            BATCHES_WRITTEN,
            Unit::Count,
            "Pending batches persisted to the timeline store."
        );
        describe_counter!(
            CHUNKS_WRITTEN,
            Unit::Count,
            "Encoded chunks persisted to the timeline store."
        );
        describe_counter!(
            WRITE_FAILURES,
            Unit::Count,
            "Failed bulk persist attempts (batches stay queued for retry)."
        );
        describe_counter!(
            AGGREGATES_CREATED,
            Unit::Count,
            "Aggregated time ranges created by the aggregator."
        );
        describe_histogram!(
            WRITE_DURATION_SECONDS,
            Unit::Seconds,
            "Duration of one bulk persist call."
        );
    }
}
