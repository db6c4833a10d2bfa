// Change detection between two document snapshots.
//
// Compares structural fingerprints and produces a severity-classified
// `ChangeSummary`: no false negatives on structural change, minimal false
// positives on cosmetic change. All functions here are pure and
// synchronous; malformed snapshots fail fast.

use std::collections::BTreeSet;

use chrono::Utc;
use folio_common::error::SnapshotError;
use folio_common::types::{
    ChangeEntry, ChangeKind, ChangeSeverity, ChangeSummary, DocumentSnapshot,
};

/// Compare two snapshots and summarize every observable delta.
///
/// Emits nothing for equal values, so a file re-saved with identical
/// content (the common "false touch") produces `has_changes = false`.
pub fn detect_changes(
    old: &DocumentSnapshot,
    new: &DocumentSnapshot,
) -> Result<ChangeSummary, SnapshotError> {
    old.validate()?;
    new.validate()?;

    let mut changes: Vec<ChangeEntry> = Vec::new();

    // Structural: page count delta, or reorder at equal counts. Per-page
    // comparisons are skipped once indexing has shifted — the change is
    // already classified as full-reload and pairwise hashes would only
    // produce alignment noise.
    if new.page_count > old.page_count {
        let added = added_page_numbers(old, new);
        changes.push(entry(
            ChangeKind::PagesAdded,
            format!("{} page(s) added", added.len()),
            added,
        ));
    } else if new.page_count < old.page_count {
        let removed = removed_page_numbers(old, new);
        changes.push(entry(
            ChangeKind::PagesRemoved,
            format!("{} page(s) removed", removed.len()),
            removed,
        ));
    } else if old.page_hashes != new.page_hashes && is_confident_reorder(old, new) {
        let moved = differing_pages(&old.page_hashes, &new.page_hashes);
        changes.push(entry(
            ChangeKind::PagesReordered,
            format!("{} page(s) reordered", moved.len()),
            moved,
        ));
    } else {
        per_page_changes(old, new, &mut changes);
    }

    document_wide_changes(old, new, &mut changes);

    Ok(summarize(changes))
}

/// Maximal change for a snapshot that can no longer be taken (file deleted
/// or unreadable): every page reported removed, full reload required.
pub fn detect_snapshot_unavailable(old: &DocumentSnapshot) -> ChangeSummary {
    let pages: Vec<u32> = (1..=old.page_count).collect();
    let changes = vec![entry(
        ChangeKind::PagesRemoved,
        "document is no longer readable".to_string(),
        pages,
    )];
    summarize(changes)
}

fn entry(kind: ChangeKind, description: String, page_numbers: Vec<u32>) -> ChangeEntry {
    ChangeEntry { kind, description, severity: kind.base_severity(), page_numbers }
}

/// Page-by-page comparison at equal page counts: content hash, rotation,
/// and size fold into one `page-content-changed` entry per page;
/// annotation-count drift gets its own per-page entry with the escalation
/// policy applied.
fn per_page_changes(old: &DocumentSnapshot, new: &DocumentSnapshot, changes: &mut Vec<ChangeEntry>) {
    for i in 0..old.page_count as usize {
        let page = (i + 1) as u32;
        let mut aspects: Vec<&str> = Vec::new();
        if old.page_hashes[i] != new.page_hashes[i] {
            aspects.push("content");
        }
        if old.page_rotations[i] != new.page_rotations[i] {
            aspects.push("rotation");
        }
        if old.page_sizes[i] != new.page_sizes[i] {
            aspects.push("size");
        }
        if !aspects.is_empty() {
            changes.push(entry(
                ChangeKind::PageContentChanged,
                format!("page {page} {} changed", aspects.join("/")),
                vec![page],
            ));
        }

        let (old_count, new_count) = (old.annotation_counts[i], new.annotation_counts[i]);
        if old_count != new_count {
            // Escalate when annotations appear on a previously clean page;
            // count drift on an already-annotated page stays minor.
            let severity = if old_count == 0 && new_count > 0 {
                ChangeSeverity::Moderate
            } else {
                ChangeSeverity::Minor
            };
            changes.push(ChangeEntry {
                kind: ChangeKind::AnnotationsChanged,
                description: format!(
                    "page {page} annotation count changed from {old_count} to {new_count}"
                ),
                severity,
                page_numbers: vec![page],
            });
        }
    }
}

/// Document-wide fields: compared regardless of structural changes.
fn document_wide_changes(
    old: &DocumentSnapshot,
    new: &DocumentSnapshot,
    changes: &mut Vec<ChangeEntry>,
) {
    if old.form_field_count != new.form_field_count {
        changes.push(entry(
            ChangeKind::FormFieldsChanged,
            format!(
                "form field count changed from {} to {}",
                old.form_field_count, new.form_field_count
            ),
            Vec::new(),
        ));
    }

    if old.has_attachments != new.has_attachments {
        let description = if new.has_attachments {
            "attachments added".to_string()
        } else {
            "attachments removed".to_string()
        };
        changes.push(entry(ChangeKind::AttachmentsChanged, description, Vec::new()));
    }

    if old.bookmark_count != new.bookmark_count {
        changes.push(entry(
            ChangeKind::BookmarksChanged,
            format!(
                "bookmark count changed from {} to {}",
                old.bookmark_count, new.bookmark_count
            ),
            Vec::new(),
        ));
    }

    if old.security != new.security {
        changes.push(entry(
            ChangeKind::SecurityChanged,
            "document security settings changed".to_string(),
            Vec::new(),
        ));
    }

    if old.metadata != new.metadata {
        let keys = changed_metadata_keys(old, new);
        changes.push(entry(
            ChangeKind::MetadataChanged,
            format!("metadata changed: {}", keys.join(", ")),
            Vec::new(),
        ));
    }
}

fn changed_metadata_keys(old: &DocumentSnapshot, new: &DocumentSnapshot) -> Vec<String> {
    let mut keys: BTreeSet<&String> = BTreeSet::new();
    for (key, value) in &old.metadata {
        if new.metadata.get(key) != Some(value) {
            keys.insert(key);
        }
    }
    for key in new.metadata.keys() {
        if !old.metadata.contains_key(key) {
            keys.insert(key);
        }
    }
    keys.into_iter().cloned().collect()
}

/// Accumulate counters and flags; the additivity invariant holds by
/// construction.
fn summarize(changes: Vec<ChangeEntry>) -> ChangeSummary {
    let mut major = 0u32;
    let mut moderate = 0u32;
    let mut minor = 0u32;
    let mut affected: BTreeSet<u32> = BTreeSet::new();

    for change in &changes {
        match change.severity {
            ChangeSeverity::Major => major += 1,
            ChangeSeverity::Moderate => moderate += 1,
            ChangeSeverity::Minor => minor += 1,
        }
        affected.extend(change.page_numbers.iter().copied());
    }

    let requires_full_reload = changes.iter().any(|c| c.kind.is_structural());
    ChangeSummary {
        has_changes: !changes.is_empty(),
        total_changes: changes.len() as u32,
        major_changes: major,
        moderate_changes: moderate,
        minor_changes: minor,
        affected_pages: affected,
        requires_full_reload,
        change_timestamp: Utc::now(),
        changes,
    }
}

/// New page numbers (1-based, final-document indexing) for an added-pages
/// delta. Pages are assumed inserted where the hash sequences diverge; if
/// no confident alignment exists, they are assumed appended at the end.
fn added_page_numbers(old: &DocumentSnapshot, new: &DocumentSnapshot) -> Vec<u32> {
    let delta = (new.page_count - old.page_count) as usize;
    let divergence =
        (0..old.page_count as usize).find(|&i| old.page_hashes[i] != new.page_hashes[i]);

    match divergence {
        // Old sequence is a prefix of the new one: appended at end.
        None => ((old.page_count + 1)..=new.page_count).collect(),
        Some(i) => {
            // Insertion of `delta` pages at position i iff the tails align.
            if new.page_hashes[i + delta..] == old.page_hashes[i..] {
                ((i as u32 + 1)..=(i + delta) as u32).collect()
            } else {
                ((old.page_count + 1)..=new.page_count).collect()
            }
        }
    }
}

/// Old page numbers (1-based) for a removed-pages delta; mirror image of
/// `added_page_numbers`.
fn removed_page_numbers(old: &DocumentSnapshot, new: &DocumentSnapshot) -> Vec<u32> {
    let delta = (old.page_count - new.page_count) as usize;
    let divergence =
        (0..new.page_count as usize).find(|&i| old.page_hashes[i] != new.page_hashes[i]);

    match divergence {
        None => ((new.page_count + 1)..=old.page_count).collect(),
        Some(i) => {
            if old.page_hashes[i + delta..] == new.page_hashes[i..] {
                ((i as u32 + 1)..=(i + delta) as u32).collect()
            } else {
                ((new.page_count + 1)..=old.page_count).collect()
            }
        }
    }
}

/// Conservative reorder detection: equal page counts, equal hash
/// multisets, and no duplicate hashes in the old sequence. Duplicates
/// (e.g. two blank pages) make alignment ambiguous, so those fall back to
/// per-page content changes.
fn is_confident_reorder(old: &DocumentSnapshot, new: &DocumentSnapshot) -> bool {
    let mut old_sorted = old.page_hashes.clone();
    let mut new_sorted = new.page_hashes.clone();
    old_sorted.sort_unstable();
    new_sorted.sort_unstable();

    let has_duplicates = old_sorted.windows(2).any(|w| w[0] == w[1]);
    old_sorted == new_sorted && !has_duplicates
}

fn differing_pages(old_hashes: &[String], new_hashes: &[String]) -> Vec<u32> {
    old_hashes
        .iter()
        .zip(new_hashes)
        .enumerate()
        .filter(|(_, (a, b))| a != b)
        .map(|(i, _)| (i + 1) as u32)
        .collect()
}
