// Watch queue: coalesces raw filesystem events and delivers prioritized
// batches to a single async consumer.
//
// Two layers, so the timing logic stays testable with explicit clocks:
// `CoalescingQueue` is the synchronous core (per-path coalescing window,
// default 100ms, range 50–500ms; last event kind wins). `WatchQueue` wraps
// it with the async delivery loop and guarantees batches never overlap:
// the consumer future for batch N completes before batch N+1 is delivered.

use std::collections::HashMap;
use std::future::Future;
use std::path::PathBuf;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::{Duration, Instant};

use tokio::sync::{broadcast, Mutex as TokioMutex};
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

use folio_common::types::{FileStats, FsEventKind};

/// Default coalescing window.
const DEFAULT_BATCH_DELAY_MS: u64 = 100;
/// Minimum allowed coalescing window.
const MIN_BATCH_DELAY_MS: u64 = 50;
/// Maximum allowed coalescing window.
const MAX_BATCH_DELAY_MS: u64 = 500;
/// How often the delivery loop checks for ready batches.
const DEFAULT_POLL_INTERVAL_MS: u64 = 25;

/// Configuration for the watch queue.
#[derive(Debug, Clone)]
pub struct WatchQueueOptions {
    /// Coalescing window: events for the same path within this window are
    /// merged into one delivered record.
    pub batch_delay: Duration,
    /// Poll interval of the delivery loop.
    pub poll_interval: Duration,
}

impl Default for WatchQueueOptions {
    fn default() -> Self {
        Self {
            batch_delay: Duration::from_millis(DEFAULT_BATCH_DELAY_MS),
            poll_interval: Duration::from_millis(DEFAULT_POLL_INTERVAL_MS),
        }
    }
}

impl WatchQueueOptions {
    /// Create options with the given coalescing window in milliseconds,
    /// clamped to [50, 500].
    pub fn with_batch_delay_ms(ms: u64) -> Self {
        let clamped = ms.clamp(MIN_BATCH_DELAY_MS, MAX_BATCH_DELAY_MS);
        Self { batch_delay: Duration::from_millis(clamped), ..Self::default() }
    }
}

/// A coalesced event record as delivered to the batch consumer.
#[derive(Debug, Clone, PartialEq)]
pub struct QueuedEvent {
    pub path: PathBuf,
    /// Final event kind for this path (last raw event wins).
    pub kind: FsEventKind,
    /// Stat block of the most recent raw event that carried one.
    pub stats: Option<FileStats>,
    /// Critical events (deletion of the active document) sort first in a
    /// delivered batch. Sticky: once a path is critical it stays critical.
    pub is_critical: bool,
    /// Number of raw events coalesced into this record.
    pub coalesced: u32,
}

/// Per-kind accounting of raw, undelivered events.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EventTypeCounts {
    pub change: u32,
    pub add: u32,
    pub unlink: u32,
}

impl EventTypeCounts {
    fn bump(&mut self, kind: FsEventKind) {
        match kind {
            FsEventKind::Change => self.change += 1,
            FsEventKind::Add => self.add += 1,
            FsEventKind::Unlink => self.unlink += 1,
            // Watcher errors never enter the queue.
            FsEventKind::Error => {}
        }
    }

    fn add_counts(&mut self, other: EventTypeCounts) {
        self.change += other.change;
        self.add += other.add;
        self.unlink += other.unlink;
    }
}

/// Snapshot of what is queued and not yet delivered.
///
/// Counts reflect raw enqueued events, so three rapid `change` events for
/// one path report `change: 3` even though delivery coalesces them into a
/// single record.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueStats {
    pub pending_events: u32,
    pub events_by_type: EventTypeCounts,
}

/// Pending per-path state inside the coalescing window.
struct PendingEvent {
    kind: FsEventKind,
    stats: Option<FileStats>,
    is_critical: bool,
    coalesced: u32,
    counts: EventTypeCounts,
    last_seen: Instant,
    /// Enqueue order of the first raw event for this path; ties in the
    /// priority sort preserve this order.
    seq: u64,
}

/// Synchronous coalescing core.
///
/// Call `push()` for each incoming event, then `drain_ready()` periodically
/// to collect events whose coalescing window has elapsed. Drained batches
/// are sorted critical-first with stable enqueue order.
pub struct CoalescingQueue {
    window: Duration,
    pending: HashMap<PathBuf, PendingEvent>,
    next_seq: u64,
}

impl CoalescingQueue {
    pub fn new(window: Duration) -> Self {
        Self { window, pending: HashMap::new(), next_seq: 0 }
    }

    /// Record a raw filesystem event. An event for a path that is already
    /// pending coalesces into it: the later kind wins, the window timer
    /// resets, criticality is sticky, and raw counts accumulate.
    pub fn push(
        &mut self,
        path: PathBuf,
        kind: FsEventKind,
        stats: Option<FileStats>,
        is_critical: bool,
    ) {
        self.push_at(path, kind, stats, is_critical, Instant::now());
    }

    /// Like `push` but with a specific timestamp (for testing).
    fn push_at(
        &mut self,
        path: PathBuf,
        kind: FsEventKind,
        stats: Option<FileStats>,
        is_critical: bool,
        now: Instant,
    ) {
        if kind == FsEventKind::Error {
            trace!(path = %path.display(), "error events are not queued");
            return;
        }

        match self.pending.get_mut(&path) {
            Some(entry) => {
                entry.kind = kind;
                if stats.is_some() {
                    entry.stats = stats;
                }
                entry.is_critical |= is_critical;
                entry.coalesced += 1;
                entry.counts.bump(kind);
                entry.last_seen = now;
            }
            None => {
                let seq = self.next_seq;
                self.next_seq += 1;
                let mut counts = EventTypeCounts::default();
                counts.bump(kind);
                self.pending.insert(
                    path,
                    PendingEvent { kind, stats, is_critical, coalesced: 1, counts, last_seen: now, seq },
                );
            }
        }
    }

    /// Drain all events whose coalescing window has elapsed, sorted
    /// critical-first (ties preserve enqueue order).
    pub fn drain_ready(&mut self) -> Vec<QueuedEvent> {
        self.drain_ready_at(Instant::now())
    }

    /// Like `drain_ready` but with a specific timestamp (for testing).
    fn drain_ready_at(&mut self, now: Instant) -> Vec<QueuedEvent> {
        let window = self.window;
        let ready: Vec<PathBuf> = self
            .pending
            .iter()
            .filter(|(_, p)| now.duration_since(p.last_seen) >= window)
            .map(|(path, _)| path.clone())
            .collect();
        self.take_paths(ready)
    }

    /// Drain everything regardless of the window (flush/shutdown path).
    pub fn drain_all(&mut self) -> Vec<QueuedEvent> {
        let paths: Vec<PathBuf> = self.pending.keys().cloned().collect();
        self.take_paths(paths)
    }

    fn take_paths(&mut self, paths: Vec<PathBuf>) -> Vec<QueuedEvent> {
        let mut taken: Vec<(u64, QueuedEvent)> = paths
            .into_iter()
            .filter_map(|path| {
                self.pending.remove(&path).map(|p| {
                    (
                        p.seq,
                        QueuedEvent {
                            path,
                            kind: p.kind,
                            stats: p.stats,
                            is_critical: p.is_critical,
                            coalesced: p.coalesced,
                        },
                    )
                })
            })
            .collect();
        taken.sort_by_key(|(seq, event)| (!event.is_critical, *seq));
        taken.into_iter().map(|(_, event)| event).collect()
    }

    /// Raw-event accounting for everything still queued.
    pub fn stats(&self) -> QueueStats {
        let mut stats = QueueStats::default();
        for entry in self.pending.values() {
            stats.pending_events += entry.coalesced;
            stats.events_by_type.add_counts(entry.counts);
        }
        stats
    }

    /// Number of coalesced (per-path) records still pending.
    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    /// Time at which the earliest pending record becomes ready, or None.
    pub fn next_deadline(&self) -> Option<Instant> {
        self.pending.values().map(|p| p.last_seen + self.window).min()
    }

    pub fn clear(&mut self) {
        self.pending.clear();
    }
}

/// Future returned by a batch consumer.
pub type BatchFuture = Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send>>;

/// Consumer of delivered event batches.
///
/// The queue awaits the returned future to completion before delivering the
/// next batch; a single `WatchQueue` never runs two consumer calls
/// concurrently.
pub trait BatchConsumer: Send + Sync {
    fn on_batch(&self, batch: Vec<QueuedEvent>) -> BatchFuture;
}

impl<F> BatchConsumer for F
where
    F: Fn(Vec<QueuedEvent>) -> BatchFuture + Send + Sync,
{
    fn on_batch(&self, batch: Vec<QueuedEvent>) -> BatchFuture {
        (self)(batch)
    }
}

struct QueueShared {
    state: StdMutex<CoalescingQueue>,
    /// Serialization point: held across every consumer call.
    delivery: TokioMutex<()>,
    consumer: StdMutex<Option<Arc<dyn BatchConsumer>>>,
    running: AtomicBool,
}

/// Async watch queue: owns the delivery loop over a `CoalescingQueue`.
///
/// Lifecycle is `initialize` → `enqueue_event`/`flush` → `shutdown`. After
/// shutdown, `enqueue_event` is a no-op until `initialize` is called again.
/// Explicitly constructed and owned by the coordinator — there is no
/// process-wide singleton.
pub struct WatchQueue {
    shared: Arc<QueueShared>,
    options: WatchQueueOptions,
    worker: StdMutex<Option<JoinHandle<()>>>,
    shutdown_tx: StdMutex<Option<broadcast::Sender<()>>>,
}

impl WatchQueue {
    pub fn new(options: WatchQueueOptions) -> Self {
        let state = CoalescingQueue::new(options.batch_delay);
        Self {
            shared: Arc::new(QueueShared {
                state: StdMutex::new(state),
                delivery: TokioMutex::new(()),
                consumer: StdMutex::new(None),
                running: AtomicBool::new(false),
            }),
            options,
            worker: StdMutex::new(None),
            shutdown_tx: StdMutex::new(None),
        }
    }

    /// Register the batch consumer and start the delivery loop.
    ///
    /// Must run inside a tokio runtime. Calling `initialize` while already
    /// running is ignored; `shutdown` first to swap consumers.
    pub fn initialize(&self, consumer: Arc<dyn BatchConsumer>) {
        if self.shared.running.swap(true, Ordering::SeqCst) {
            warn!("watch queue already initialized; ignoring");
            return;
        }
        *self.shared.consumer.lock().expect("watch queue consumer lock poisoned") = Some(consumer);

        let (tx, mut rx) = broadcast::channel(1);
        let shared = self.shared.clone();
        let poll_interval = self.options.poll_interval;

        let handle = tokio::spawn(async move {
            debug!("watch queue delivery loop started");
            loop {
                tokio::select! {
                    biased;

                    _ = rx.recv() => {
                        debug!("watch queue delivery loop shutting down");
                        break;
                    }

                    _ = tokio::time::sleep(poll_interval) => {
                        // Check for batches whose window has closed.
                    }
                }

                let batch = {
                    shared.state.lock().expect("watch queue state lock poisoned").drain_ready()
                };
                if !batch.is_empty() {
                    deliver(&shared, batch).await;
                }
            }
        });

        *self.worker.lock().expect("watch queue worker lock poisoned") = Some(handle);
        *self.shutdown_tx.lock().expect("watch queue shutdown lock poisoned") = Some(tx);
    }

    /// Append a raw filesystem event. No-op when the queue is not running.
    ///
    /// `is_critical` is set by the caller when the path is the currently
    /// active document and the event is a deletion.
    pub fn enqueue_event(
        &self,
        path: impl Into<PathBuf>,
        kind: FsEventKind,
        stats: Option<FileStats>,
        is_critical: bool,
    ) {
        if !self.shared.running.load(Ordering::SeqCst) {
            debug!("watch queue not running; dropping event");
            return;
        }
        self.shared
            .state
            .lock()
            .expect("watch queue state lock poisoned")
            .push(path.into(), kind, stats, is_critical);
    }

    /// Accounting of what is queued and not yet delivered.
    pub fn queue_stats(&self) -> QueueStats {
        self.shared.state.lock().expect("watch queue state lock poisoned").stats()
    }

    /// Force immediate delivery of everything queued, bypassing the
    /// coalescing window. Returns once the consumer has finished the batch.
    pub async fn flush(&self) {
        let batch =
            { self.shared.state.lock().expect("watch queue state lock poisoned").drain_all() };
        if !batch.is_empty() {
            deliver(&self.shared, batch).await;
        }
    }

    /// Stop the delivery loop and clear all queued state.
    pub async fn shutdown(&self) {
        self.shared.running.store(false, Ordering::SeqCst);
        let tx = self.shutdown_tx.lock().expect("watch queue shutdown lock poisoned").take();
        if let Some(tx) = tx {
            let _ = tx.send(());
        }
        let handle = self.worker.lock().expect("watch queue worker lock poisoned").take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
        self.shared.state.lock().expect("watch queue state lock poisoned").clear();
        *self.shared.consumer.lock().expect("watch queue consumer lock poisoned") = None;
    }
}

/// Deliver one batch under the serialization guard.
///
/// A consumer rejection is logged and the batch is dropped — at-most-once
/// delivery; reconciliation passes are idempotent, so a duplicate run after
/// the next event is harmless while a retry loop is not.
async fn deliver(shared: &Arc<QueueShared>, batch: Vec<QueuedEvent>) {
    let consumer =
        { shared.consumer.lock().expect("watch queue consumer lock poisoned").clone() };
    let Some(consumer) = consumer else {
        warn!(batch_size = batch.len(), "no batch consumer registered; dropping batch");
        return;
    };

    let _guard = shared.delivery.lock().await;
    let batch_size = batch.len();
    if let Err(error) = consumer.on_batch(batch).await {
        warn!(batch_size, error = %error, "batch consumer failed; batch not retried");
    }
}
