// Reconciliation coordinator: watch queue → change detection → diff →
// conflict handling, exposed through the store-facing surface
// (`handle_file_change`, `get_pending_changes`, `dismiss_change`,
// `update_settings`).
//
// The coordinator owns the only mutable state in the engine: the pending
// external-change list and the per-path baseline snapshots. Everything it
// hands downstream is a value; the host performs its own pub/sub fan-out
// from the emitted `ReconcileEvent`s.

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex as StdMutex};

use anyhow::Result;
use chrono::Utc;
use tokio::sync::mpsc;
use tracing::{debug, info, trace, warn};
use uuid::Uuid;

use folio_common::types::{
    ChangeSummary, Conflict, ConflictSeverity, DocumentDiff, DocumentSnapshot, ExternalChange,
    FsEventKind, ResolutionStrategy, SecurityInfo, UnsavedChanges,
};

use crate::config::ReconcileSettings;
use crate::conflict::{apply_conflict_resolutions, detect_conflicts};
use crate::detect::{detect_changes, detect_snapshot_unavailable};
use crate::diff::create_document_diff;
use crate::snapshot::SnapshotProvider;
use crate::watcher::queue::{BatchFuture, QueuedEvent, QueueStats, WatchQueue, WatchQueueOptions};
use crate::watcher::WatchEvent;

/// Capacity of the outbound event channel.
const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Events emitted for the store/UI layer.
#[derive(Debug, Clone)]
pub enum ReconcileEvent {
    /// An external change was detected and no unsaved edit collides with it.
    ChangesDetected { path: PathBuf, summary: ChangeSummary, diff: DocumentDiff },
    /// Conflicts require a strategy decision from the user.
    ConflictsFound { path: PathBuf, diff: DocumentDiff, conflicts: Vec<Conflict> },
    /// Conflicts were auto-resolved; the merged edit set is ready to commit.
    Merged {
        path: PathBuf,
        strategy: ResolutionStrategy,
        resolved: bool,
        merged: UnsavedChanges,
    },
    /// The OS watcher reported an error for this path; informational only.
    WatcherError { path: PathBuf },
}

/// Read access to the editor-owned unsaved edit model.
///
/// Called once per reconciliation pass; the returned value is treated as an
/// immutable snapshot. Committing a merged result back is the editor's job,
/// driven by the `Merged` event.
pub trait EditSession: Send + Sync {
    fn unsaved_changes(&self, path: &Path) -> UnsavedChanges;
}

struct CoordinatorState {
    pending: Vec<ExternalChange>,
    baselines: HashMap<PathBuf, DocumentSnapshot>,
    settings: ReconcileSettings,
    active_document: Option<PathBuf>,
}

struct Inner {
    provider: Arc<dyn SnapshotProvider>,
    session: Arc<dyn EditSession>,
    state: StdMutex<CoordinatorState>,
    events_tx: mpsc::Sender<ReconcileEvent>,
}

/// The engine's orchestration layer. One instance per editor window/store;
/// lifecycle is `start` → `handle_file_change`… → `shutdown`.
pub struct Reconciler {
    inner: Arc<Inner>,
    queue: WatchQueue,
}

impl Reconciler {
    /// Build a reconciler around the given snapshot provider and edit
    /// session. Returns the receiver for store-facing events.
    pub fn new(
        provider: Arc<dyn SnapshotProvider>,
        session: Arc<dyn EditSession>,
        settings: ReconcileSettings,
    ) -> (Self, mpsc::Receiver<ReconcileEvent>) {
        let (events_tx, events_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let queue = WatchQueue::new(WatchQueueOptions::with_batch_delay_ms(
            settings.batch_delay_ms,
        ));
        let inner = Arc::new(Inner {
            provider,
            session,
            state: StdMutex::new(CoordinatorState {
                pending: Vec::new(),
                baselines: HashMap::new(),
                settings,
                active_document: None,
            }),
            events_tx,
        });
        (Self { inner, queue }, events_rx)
    }

    /// Start the watch queue's delivery loop. Must run inside a tokio
    /// runtime.
    pub fn start(&self) {
        let inner = self.inner.clone();
        let consumer = move |batch: Vec<QueuedEvent>| -> BatchFuture {
            let inner = inner.clone();
            Box::pin(async move {
                process_batch(&inner, batch).await;
                Ok(())
            })
        };
        self.queue.initialize(Arc::new(consumer));
        info!("reconciler started");
    }

    /// Record an external change and feed it into the pipeline.
    ///
    /// Watcher errors are surfaced as a non-actionable pending change and an
    /// event; they never enter the queue. Deletion of the active document is
    /// marked critical so it sorts first within its batch.
    pub fn handle_file_change(&self, event: WatchEvent) {
        let record = ExternalChange {
            id: Uuid::new_v4(),
            path: event.path.clone(),
            kind: event.kind,
            timestamp: Utc::now(),
            dismissed: false,
        };

        let is_critical = {
            let mut state = self.lock_state();
            state.pending.push(record);
            state.active_document.as_deref() == Some(event.path.as_path())
                && event.kind == FsEventKind::Unlink
        };

        if event.kind == FsEventKind::Error {
            warn!(path = %event.path.display(), "watcher reported an error");
            if self
                .inner
                .events_tx
                .try_send(ReconcileEvent::WatcherError { path: event.path })
                .is_err()
            {
                debug!("event channel full or closed; watcher error not delivered");
            }
            return;
        }

        self.queue.enqueue_event(event.path, event.kind, event.stats, is_critical);
    }

    /// Non-dismissed changes, most recent per path, newest first.
    pub fn get_pending_changes(&self) -> Vec<ExternalChange> {
        let state = self.lock_state();
        let mut latest: BTreeMap<PathBuf, ExternalChange> = BTreeMap::new();
        for change in state.pending.iter().filter(|c| !c.dismissed) {
            match latest.get(&change.path) {
                Some(existing) if existing.timestamp >= change.timestamp => {}
                _ => {
                    latest.insert(change.path.clone(), change.clone());
                }
            }
        }
        let mut result: Vec<ExternalChange> = latest.into_values().collect();
        result.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
        result
    }

    /// Mark one pending change dismissed. Queued events are unaffected.
    /// Returns false when the id is unknown.
    pub fn dismiss_change(&self, id: Uuid) -> bool {
        let mut state = self.lock_state();
        match state.pending.iter_mut().find(|c| c.id == id) {
            Some(change) => {
                change.dismissed = true;
                true
            }
            None => false,
        }
    }

    /// Replace the settings consulted by future reconciliation passes.
    /// The queue's coalescing window is fixed at construction.
    pub fn update_settings(&self, settings: ReconcileSettings) {
        self.lock_state().settings = settings;
    }

    /// Set (or clear) the active document used for criticality marking.
    pub fn set_active_document(&self, path: Option<PathBuf>) {
        self.lock_state().active_document = path;
    }

    /// Take a baseline snapshot of a document being opened. Subsequent
    /// events for the path are diffed against the most recent baseline.
    pub fn track_document(&self, path: &Path) -> Result<()> {
        let snapshot = self.inner.provider.snapshot(path)?;
        self.lock_state().baselines.insert(path.to_path_buf(), snapshot);
        debug!(path = %path.display(), "document baseline recorded");
        Ok(())
    }

    /// Forget a document's baseline (document closed).
    pub fn untrack_document(&self, path: &Path) {
        self.lock_state().baselines.remove(path);
    }

    /// Current accounting of queued, undelivered events.
    pub fn queue_stats(&self) -> QueueStats {
        self.queue.queue_stats()
    }

    /// Force immediate delivery of everything queued (deterministic tests,
    /// shutdown draining).
    pub async fn flush(&self) {
        self.queue.flush().await;
    }

    /// Drain and stop. After shutdown, incoming events are dropped until
    /// `start` is called again.
    pub async fn shutdown(&self) {
        self.queue.flush().await;
        self.queue.shutdown().await;
        info!("reconciler stopped");
    }

    fn lock_state(&self) -> std::sync::MutexGuard<'_, CoordinatorState> {
        self.inner.state.lock().expect("coordinator state lock poisoned")
    }
}

/// One reconciliation pass per delivered record, in batch order.
async fn process_batch(inner: &Arc<Inner>, batch: Vec<QueuedEvent>) {
    for event in batch {
        process_event(inner, event).await;
    }
}

async fn process_event(inner: &Arc<Inner>, event: QueuedEvent) {
    let path = event.path.clone();
    let baseline = {
        let state = inner.state.lock().expect("coordinator state lock poisoned");
        state.baselines.get(&path).cloned()
    };

    let Some(old) = baseline else {
        // First sighting of this path: prime the baseline so the next
        // event has something to diff against.
        match inner.provider.snapshot(&path) {
            Ok(snapshot) => {
                let mut state = inner.state.lock().expect("coordinator state lock poisoned");
                state.baselines.insert(path.clone(), snapshot);
                debug!(path = %path.display(), "baseline primed from first event");
            }
            Err(error) => {
                debug!(path = %path.display(), error = %error, "no baseline and unreadable");
            }
        }
        return;
    };

    // Take the new snapshot. A deleted or unreadable document is the
    // maximal change: every page reported removed, full reload required.
    let (summary, new_snapshot) = match event.kind {
        FsEventKind::Unlink => (detect_snapshot_unavailable(&old), empty_snapshot()),
        _ => match inner.provider.snapshot(&path) {
            Ok(new_snapshot) => match detect_changes(&old, &new_snapshot) {
                Ok(summary) => (summary, new_snapshot),
                Err(error) => {
                    // Could not determine what changed — fall back to the
                    // full-reload recommendation.
                    warn!(path = %path.display(), error = %error, "snapshot comparison failed");
                    (detect_snapshot_unavailable(&old), empty_snapshot())
                }
            },
            Err(error) => {
                warn!(path = %path.display(), error = %error, "snapshot unavailable");
                (detect_snapshot_unavailable(&old), empty_snapshot())
            }
        },
    };

    if !summary.has_changes {
        // False touch: re-saved with identical content. Stay idle.
        trace!(path = %path.display(), "no observable change");
        return;
    }

    let diff = match create_document_diff(&old, &new_snapshot, &summary) {
        Ok(diff) => diff,
        Err(error) => {
            warn!(path = %path.display(), error = %error, "diff construction failed");
            return;
        }
    };

    let unsaved = inner.session.unsaved_changes(&path);
    let conflicts = if unsaved.is_empty() {
        Vec::new()
    } else {
        detect_conflicts(&unsaved, &summary, &diff)
    };

    let (auto_reload, strategy) = {
        let mut state = inner.state.lock().expect("coordinator state lock poisoned");
        state.baselines.insert(path.clone(), new_snapshot);
        (state.settings.auto_reload, state.settings.default_strategy)
    };

    debug!(
        path = %path.display(),
        total = summary.total_changes,
        conflicts = conflicts.len(),
        full_reload = summary.requires_full_reload,
        "external change reconciled"
    );

    let outbound = if conflicts.is_empty() {
        ReconcileEvent::ChangesDetected { path, summary, diff }
    } else if auto_reload
        && conflicts.iter().all(|c| c.severity != ConflictSeverity::Critical)
    {
        // Safe to auto-apply: no critical conflict means no strategy can
        // silently destroy an edit whose target page is gone.
        let resolution = apply_conflict_resolutions(&unsaved, &conflicts, strategy);
        ReconcileEvent::Merged {
            path,
            strategy,
            resolved: resolution.resolved,
            merged: resolution.merged,
        }
    } else {
        ReconcileEvent::ConflictsFound { path, diff, conflicts }
    };

    if inner.events_tx.send(outbound).await.is_err() {
        debug!("event channel closed; dropping reconcile event");
    }
}

/// Zero-page snapshot standing in for a document that no longer exists.
fn empty_snapshot() -> DocumentSnapshot {
    DocumentSnapshot {
        page_count: 0,
        page_hashes: Vec::new(),
        page_rotations: Vec::new(),
        page_sizes: Vec::new(),
        annotation_counts: Vec::new(),
        form_field_count: 0,
        has_attachments: false,
        bookmark_count: 0,
        security: SecurityInfo::default(),
        metadata: BTreeMap::new(),
        created_at: Utc::now(),
    }
}
