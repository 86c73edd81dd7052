//! Batched persistence of cut chunks: a background thread, or synchronous writes on the caller.

use crate::accumulator::{BatchSink, QueuedBatch};
use crate::error::{Result, TimelineError};
use crate::store::TimelineStore;
use crate::telemetry::{timeline_metrics, TimelineEvent, TimelineEventListener};
use crate::types::ChunkSet;

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{mpsc, Arc, Mutex, TryLockError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

/// Commands sent to the writer thread.
enum WriterCommand {
    ForceWrite { ack: mpsc::Sender<Result<()>> },
    Shutdown,
}

/// Writer tuning, usually derived from `CollectorConfig`.
#[derive(Debug, Clone)]
pub struct WriterConfig {
    /// Persist from a dedicated thread instead of the submitting thread.
    pub background: bool,
    /// Pending chunk count that triggers a write.
    pub batch_size: usize,
    /// Longest time a batch may wait before a write is due.
    pub max_delay: Duration,
    /// How often the writer thread checks whether a write is due.
    pub check_interval: Duration,
}

impl Default for WriterConfig {
    fn default() -> Self {
        WriterConfig {
            background: true,
            batch_size: 1000,
            max_delay: Duration::from_secs(30),
            check_interval: Duration::from_secs(1),
        }
    }
}

/// Point-in-time writer counters.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WriterStats {
    pub batches_added: u64,
    pub batches_written: u64,
    pub chunks_written: u64,
    pub batches_acknowledged: u64,
    pub foreground_writes: u64,
    pub write_failures: u64,
    pub pending_batches: usize,
    pub pending_chunks: usize,
    pub last_error: Option<String>,
}

#[derive(Debug)]
struct WriterShared {
    store: Arc<dyn TimelineStore>,
    config: WriterConfig,
    pending: Mutex<Vec<QueuedBatch>>,
    pending_chunks: AtomicUsize,
    /// Held for the whole swap/persist/acknowledge sequence.
    write_lock: Mutex<()>,
    doing_writes: AtomicBool,
    draining: AtomicBool,
    last_write: Mutex<Instant>,
    last_error: Mutex<Option<String>>,
    batches_added: AtomicU64,
    batches_written: AtomicU64,
    chunks_written: AtomicU64,
    batches_acknowledged: AtomicU64,
    foreground_writes: AtomicU64,
    write_failures: AtomicU64,
    events: Arc<dyn TimelineEventListener>,
}

impl WriterShared {
    /// Writes every pending batch if a write is due (or `force` is set).
    ///
    /// With `wait` unset an in-progress write makes this a no-op. Returns the number of batches
    /// persisted.
    fn maybe_perform_writes(&self, force: bool, wait: bool) -> Result<usize> {
        let _guard = if wait {
            self.write_lock.lock()?
        } else {
            match self.write_lock.try_lock() {
                Ok(guard) => guard,
                Err(TryLockError::WouldBlock) => return Ok(0),
                Err(TryLockError::Poisoned(e)) => return Err(e.into()),
            }
        };
        self.doing_writes.store(true, Ordering::SeqCst);
        let result = self.perform_writes_locked(force);
        self.doing_writes.store(false, Ordering::SeqCst);
        result
    }

    fn perform_writes_locked(&self, force: bool) -> Result<usize> {
        let due = force
            || self.draining.load(Ordering::SeqCst)
            || self.pending_chunks.load(Ordering::SeqCst) >= self.config.batch_size
            || self.last_write.lock()?.elapsed() >= self.config.max_delay;
        if !due {
            return Ok(0);
        }

        let batches = std::mem::take(&mut *self.pending.lock()?);
        if batches.is_empty() {
            *self.last_write.lock()? = Instant::now();
            return Ok(0);
        }

        let sets: Vec<ChunkSet> = batches.iter().map(|q| q.batch.chunk_set.clone()).collect();
        let chunks: usize = sets.iter().map(|s| s.chunks.len()).sum();
        let started = Instant::now();

        if let Err(e) = self.store.insert_batches(&sets) {
            let count = batches.len();
            {
                // Failed batches go back ahead of anything submitted meanwhile.
                let mut pending = self.pending.lock()?;
                let newer = std::mem::replace(&mut *pending, batches);
                pending.extend(newer);
            }
            self.write_failures.fetch_add(1, Ordering::Relaxed);
            *self.last_error.lock()? = Some(e.to_string());
            timeline_metrics::record_write_failure();
            self.events.on_event(TimelineEvent::WriteFailed {
                batches: count,
                error: e.to_string(),
            });
            return Err(e);
        }

        let duration = started.elapsed();
        self.pending_chunks.fetch_sub(chunks, Ordering::SeqCst);
        self.batches_written
            .fetch_add(batches.len() as u64, Ordering::Relaxed);
        self.chunks_written
            .fetch_add(chunks as u64, Ordering::Relaxed);
        for queued in &batches {
            if queued.ack.acknowledge()? {
                self.batches_acknowledged.fetch_add(1, Ordering::Relaxed);
            }
        }
        *self.last_write.lock()? = Instant::now();
        *self.last_error.lock()? = None;

        timeline_metrics::record_write(duration, batches.len() as u64, chunks as u64);
        self.events.on_event(TimelineEvent::WritesPerformed {
            batches: batches.len(),
            chunks,
            duration,
        });
        Ok(batches.len())
    }

    fn is_drained(&self) -> bool {
        let empty = self.pending.lock().map(|p| p.is_empty()).unwrap_or(false);
        empty && !self.doing_writes.load(Ordering::SeqCst)
    }
}

/// Collects pending batches from accumulators and persists them in bulk.
///
/// In background mode a dedicated thread writes once enough chunks are pending or the oldest
/// write is overdue. In foreground mode (or once the thread is stopped) each submission is
/// persisted on the submitting thread.
#[derive(Debug)]
pub struct ChunkWriter {
    shared: Arc<WriterShared>,
    cmd_tx: Mutex<Option<mpsc::Sender<WriterCommand>>>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl ChunkWriter {
    /// Creates the writer and, in background mode, spawns its thread.
    pub fn start(
        store: Arc<dyn TimelineStore>,
        config: WriterConfig,
        events: Arc<dyn TimelineEventListener>,
    ) -> Result<Self> {
        let shared = Arc::new(WriterShared {
            store,
            config: config.clone(),
            pending: Mutex::new(Vec::new()),
            pending_chunks: AtomicUsize::new(0),
            write_lock: Mutex::new(()),
            doing_writes: AtomicBool::new(false),
            draining: AtomicBool::new(false),
            last_write: Mutex::new(Instant::now()),
            last_error: Mutex::new(None),
            batches_added: AtomicU64::new(0),
            batches_written: AtomicU64::new(0),
            chunks_written: AtomicU64::new(0),
            batches_acknowledged: AtomicU64::new(0),
            foreground_writes: AtomicU64::new(0),
            write_failures: AtomicU64::new(0),
            events,
        });

        if !config.background {
            return Ok(ChunkWriter {
                shared,
                cmd_tx: Mutex::new(None),
                thread: Mutex::new(None),
            });
        }

        let (cmd_tx, cmd_rx) = mpsc::channel::<WriterCommand>();
        let shared_clone = Arc::clone(&shared);
        let thread = thread::Builder::new()
            .name("timelines-writer".to_string())
            .spawn(move || {
                let shared = shared_clone;
                shared.events.on_event(TimelineEvent::WriterThreadStarted);
                loop {
                    match cmd_rx.recv_timeout(shared.config.check_interval) {
                        Ok(WriterCommand::ForceWrite { ack }) => {
                            let res = shared.maybe_perform_writes(true, true).map(|_| ());
                            let _ = ack.send(res);
                        }
                        // Failures are already reported; the batches stay queued for the next tick.
                        Err(mpsc::RecvTimeoutError::Timeout) => {
                            let _ = shared.maybe_perform_writes(false, false);
                        }
                        Ok(WriterCommand::Shutdown) => {
                            let _ = shared.maybe_perform_writes(true, true);
                            shared.events.on_event(TimelineEvent::WriterThreadStopping);
                            break;
                        }
                        Err(mpsc::RecvTimeoutError::Disconnected) => {
                            shared.events.on_event(TimelineEvent::WriterThreadStopping);
                            break;
                        }
                    }
                }
            })
            .map_err(|e| TimelineError::BackgroundTaskError(e.to_string()))?;

        Ok(ChunkWriter {
            shared,
            cmd_tx: Mutex::new(Some(cmd_tx)),
            thread: Mutex::new(Some(thread)),
        })
    }

    fn sender(&self) -> Result<Option<mpsc::Sender<WriterCommand>>> {
        Ok(self.cmd_tx.lock()?.clone())
    }

    /// Persists everything pending now and waits for the outcome.
    pub fn force_write(&self) -> Result<()> {
        let Some(tx) = self.sender()? else {
            return self.shared.maybe_perform_writes(true, true).map(|_| ());
        };
        let (ack_tx, ack_rx) = mpsc::channel();
        if tx.send(WriterCommand::ForceWrite { ack: ack_tx }).is_err() {
            return self.shared.maybe_perform_writes(true, true).map(|_| ());
        }
        ack_rx
            .recv()
            .map_err(|e| TimelineError::BackgroundTaskError(format!("writer ack failed: {}", e)))?
    }

    /// From now on every tick writes whatever is pending, regardless of thresholds.
    pub fn initiate_shutdown(&self) {
        self.shared.draining.store(true, Ordering::SeqCst);
    }

    /// True when nothing is pending and no write is in progress.
    pub fn is_drained(&self) -> bool {
        self.shared.is_drained()
    }

    /// Polls [`Self::is_drained`] until it holds or `grace` elapses. Returns whether it drained.
    pub fn wait_drained(&self, grace: Duration, poll: Duration) -> bool {
        let started = Instant::now();
        loop {
            if self.is_drained() {
                return true;
            }
            if started.elapsed() >= grace {
                return false;
            }
            // Without a thread nobody else retries failed batches.
            if self.sender().ok().flatten().is_none() {
                let _ = self.shared.maybe_perform_writes(true, false);
            }
            thread::sleep(poll);
        }
    }

    /// Stops the writer thread after a final write. Later submissions are written synchronously.
    pub fn shutdown(&self) -> Result<()> {
        self.initiate_shutdown();
        let tx = self.cmd_tx.lock()?.take();
        if let Some(tx) = tx {
            let _ = tx.send(WriterCommand::Shutdown);
        }
        let handle = self.thread.lock()?.take();
        if let Some(handle) = handle {
            if handle.join().is_err() {
                self.shared.events.on_event(TimelineEvent::WriterThreadPanicked);
                return Err(TimelineError::BackgroundTaskError(
                    "writer thread panicked".to_string(),
                ));
            }
        }
        Ok(())
    }

    pub fn last_error(&self) -> Option<String> {
        self.shared.last_error.lock().ok().and_then(|e| e.clone())
    }

    pub fn stats(&self) -> WriterStats {
        let s = &self.shared;
        let pending_batches = s.pending.lock().map(|p| p.len()).unwrap_or(0);
        WriterStats {
            batches_added: s.batches_added.load(Ordering::Relaxed),
            batches_written: s.batches_written.load(Ordering::Relaxed),
            chunks_written: s.chunks_written.load(Ordering::Relaxed),
            batches_acknowledged: s.batches_acknowledged.load(Ordering::Relaxed),
            foreground_writes: s.foreground_writes.load(Ordering::Relaxed),
            write_failures: s.write_failures.load(Ordering::Relaxed),
            pending_batches,
            pending_chunks: s.pending_chunks.load(Ordering::SeqCst),
            last_error: self.last_error(),
        }
    }
}

impl BatchSink for ChunkWriter {
    /// Queues a batch. Without a running writer thread the batch (and any earlier failures) is
    /// persisted before returning, and a persist error is returned with the batch left queued.
    fn submit(&self, batch: QueuedBatch) -> Result<()> {
        let chunks = batch.batch.chunk_count();
        self.shared.pending.lock()?.push(batch);
        self.shared.pending_chunks.fetch_add(chunks, Ordering::SeqCst);
        self.shared.batches_added.fetch_add(1, Ordering::Relaxed);

        if self.sender()?.is_none() {
            self.shared.foreground_writes.fetch_add(1, Ordering::Relaxed);
            self.shared.maybe_perform_writes(true, true)?;
        }
        Ok(())
    }
}

impl Drop for ChunkWriter {
    fn drop(&mut self) {
        let _ = self.shutdown();
    }
}
