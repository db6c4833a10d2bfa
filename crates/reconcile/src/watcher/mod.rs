// OS file watcher adapter: raw notify events for watched documents.
//
// The editor registers the paths of open documents; events are filtered to
// those paths and forwarded as `WatchEvent`s. Downstream stages (the watch
// queue, the coordinator) consume these.

pub mod queue;

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex as StdMutex};

use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Utc};
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::mpsc;
use tracing::{debug, error, trace, warn};

use folio_common::types::{FileStats, FsEventKind};

/// A raw filesystem event for a watched document.
#[derive(Debug, Clone, PartialEq)]
pub struct WatchEvent {
    pub path: PathBuf,
    pub kind: FsEventKind,
    pub stats: Option<FileStats>,
}

/// Capacity for the internal event channel.
const EVENT_CHANNEL_CAPACITY: usize = 512;

/// Watches individual document files using the OS-native backend
/// (fsevents on macOS, inotify on Linux).
///
/// Each document's parent directory is watched non-recursively and events
/// are filtered down to registered paths — watching the directory rather
/// than the file survives atomic save-by-rename, which replaces the inode.
pub struct DocumentWatcher {
    watcher: RecommendedWatcher,
    registered: Arc<StdMutex<HashSet<PathBuf>>>,
    /// Refcount of registered documents per watched parent directory.
    watched_dirs: HashMap<PathBuf, usize>,
}

impl DocumentWatcher {
    /// Start the watcher. Returns the handle and a receiver for raw events.
    /// No paths are watched until `watch()` is called.
    pub fn start() -> Result<(Self, mpsc::Receiver<WatchEvent>)> {
        let (tx, rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let registered: Arc<StdMutex<HashSet<PathBuf>>> = Arc::new(StdMutex::new(HashSet::new()));

        let registered_for_filter = registered.clone();
        let watcher = notify::recommended_watcher(move |res: notify::Result<Event>| {
            let events = match res {
                Ok(event) => {
                    let registered =
                        registered_for_filter.lock().expect("watcher registry lock poisoned");
                    translate_event(&event, &registered)
                }
                Err(e) => {
                    error!(error = %e, "file watcher error");
                    // Surfaced to the coordinator as a non-actionable event.
                    let path = e.paths.first().cloned().unwrap_or_default();
                    vec![WatchEvent { path, kind: FsEventKind::Error, stats: None }]
                }
            };
            for event in events {
                if tx.blocking_send(event).is_err() {
                    // Receiver dropped — watcher will be cleaned up.
                    debug!("event channel closed, stopping event dispatch");
                    return;
                }
            }
        })
        .context("failed to create file watcher")?;

        Ok((Self { watcher, registered, watched_dirs: HashMap::new() }, rx))
    }

    /// Register a document path for watching.
    pub fn watch(&mut self, path: &Path) -> Result<()> {
        let path = path
            .canonicalize()
            .with_context(|| format!("failed to canonicalize watch path: {}", path.display()))?;
        let parent = path
            .parent()
            .ok_or_else(|| anyhow!("watch path has no parent directory: {}", path.display()))?
            .to_path_buf();

        let count = self.watched_dirs.entry(parent.clone()).or_insert(0);
        if *count == 0 {
            self.watcher
                .watch(&parent, RecursiveMode::NonRecursive)
                .with_context(|| format!("failed to watch directory: {}", parent.display()))?;
        }
        *count += 1;

        self.registered.lock().expect("watcher registry lock poisoned").insert(path.clone());
        debug!(path = %path.display(), "document watch registered");
        Ok(())
    }

    /// Remove a document path from watching. Unwatches the parent directory
    /// once no registered document remains in it.
    pub fn unwatch(&mut self, path: &Path) -> Result<()> {
        let path = match path.canonicalize() {
            Ok(p) => p,
            // Already deleted — fall back to the given path for bookkeeping.
            Err(_) => path.to_path_buf(),
        };
        let removed =
            self.registered.lock().expect("watcher registry lock poisoned").remove(&path);
        if !removed {
            warn!(path = %path.display(), "unwatch of unregistered path");
            return Ok(());
        }

        if let Some(parent) = path.parent() {
            if let Some(count) = self.watched_dirs.get_mut(parent) {
                *count -= 1;
                if *count == 0 {
                    self.watched_dirs.remove(parent);
                    self.watcher
                        .unwatch(parent)
                        .with_context(|| format!("failed to unwatch: {}", parent.display()))?;
                }
            }
        }
        Ok(())
    }
}

/// Best-effort stat block for a path; None when the file is gone.
pub fn file_stats(path: &Path) -> Option<FileStats> {
    let meta = std::fs::metadata(path).ok()?;
    Some(FileStats {
        size: meta.len(),
        created: meta.created().ok().map(DateTime::<Utc>::from),
        modified: meta.modified().ok().map(DateTime::<Utc>::from),
        accessed: meta.accessed().ok().map(DateTime::<Utc>::from),
        is_file: meta.is_file(),
        is_directory: meta.is_dir(),
    })
}

/// Translate a `notify::Event` into zero or more `WatchEvent`s for
/// registered document paths.
fn translate_event(event: &Event, registered: &HashSet<PathBuf>) -> Vec<WatchEvent> {
    let kind = match &event.kind {
        EventKind::Create(_) => FsEventKind::Add,
        EventKind::Modify(modify_kind) => {
            use notify::event::ModifyKind;
            match modify_kind {
                // Data or content change — the important one.
                ModifyKind::Data(_) => FsEventKind::Change,
                // Renames: atomic saves surface as a name change on the target.
                ModifyKind::Name(_) => FsEventKind::Change,
                // Metadata-only changes (permissions, timestamps) — skip.
                ModifyKind::Metadata(_) => {
                    trace!("skipping metadata-only modify event");
                    return Vec::new();
                }
                _ => FsEventKind::Change,
            }
        }
        EventKind::Remove(_) => FsEventKind::Unlink,
        // Access, Other, Any — not actionable for document tracking.
        _ => {
            trace!(kind = ?event.kind, "skipping non-content event");
            return Vec::new();
        }
    };

    event
        .paths
        .iter()
        .filter(|p| registered.contains(p.as_path()))
        .map(|p| {
            let stats = match kind {
                FsEventKind::Add | FsEventKind::Change => file_stats(p),
                _ => None,
            };
            WatchEvent { path: p.clone(), kind, stats }
        })
        .collect()
}
