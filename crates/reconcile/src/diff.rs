// Document diff construction: re-expresses a `ChangeSummary` at page
// granularity for conflict detection and UI preview rendering.
//
// Classification is the detector's exclusive job — this module never
// re-derives severities or change kinds, it only expands recorded deltas
// into page-addressable detail and precise metadata value pairs.

use std::collections::{BTreeMap, BTreeSet};

use folio_common::error::SnapshotError;
use folio_common::types::{
    ChangeKind, ChangeSummary, DocumentDiff, DocumentSnapshot, MetadataChange, PageChange,
    PageChangeKind,
};

/// Expand a summary plus the two underlying snapshots into a
/// `DocumentDiff`.
pub fn create_document_diff(
    old: &DocumentSnapshot,
    new: &DocumentSnapshot,
    summary: &ChangeSummary,
) -> Result<DocumentDiff, SnapshotError> {
    old.validate()?;
    new.validate()?;

    let mut pages_added: Vec<u32> = Vec::new();
    let mut pages_removed: Vec<u32> = Vec::new();
    let mut page_kinds: BTreeMap<u32, BTreeSet<PageChangeKind>> = BTreeMap::new();

    for change in &summary.changes {
        match change.kind {
            ChangeKind::PagesAdded => pages_added.extend(change.page_numbers.iter().copied()),
            ChangeKind::PagesRemoved => pages_removed.extend(change.page_numbers.iter().copied()),
            ChangeKind::PageContentChanged => {
                for &page in &change.page_numbers {
                    page_kinds
                        .entry(page)
                        .or_default()
                        .extend(page_aspects(old, new, page));
                }
            }
            ChangeKind::AnnotationsChanged => {
                for &page in &change.page_numbers {
                    page_kinds.entry(page).or_default().insert(PageChangeKind::Annotations);
                }
            }
            // Reorders and document-wide kinds have no per-page expansion;
            // reorders are covered by `structural_changes`.
            _ => {}
        }
    }

    let metadata_changes =
        if summary.changes.iter().any(|c| c.kind == ChangeKind::MetadataChanged) {
            metadata_value_pairs(old, new)
        } else {
            Vec::new()
        };

    let mut affected: BTreeSet<u32> = page_kinds.keys().copied().collect();
    affected.extend(pages_added.iter().copied());
    affected.extend(pages_removed.iter().copied());

    let page_changes: Vec<PageChange> = page_kinds
        .into_iter()
        .map(|(page_number, change_kinds)| PageChange {
            page_number,
            has_changes: !change_kinds.is_empty(),
            change_kinds,
        })
        .collect();

    Ok(DocumentDiff {
        summary: summary.clone(),
        pages_added,
        pages_removed,
        page_changes,
        metadata_changes,
        structural_changes: summary.requires_full_reload,
        total_affected_pages: affected.len() as u32,
    })
}

/// Which aspects of one page differ between the snapshots. The page number
/// is 1-based; out-of-range indices yield nothing (defensive — the
/// detector only records in-range pages).
fn page_aspects(
    old: &DocumentSnapshot,
    new: &DocumentSnapshot,
    page: u32,
) -> BTreeSet<PageChangeKind> {
    let mut kinds = BTreeSet::new();
    if page == 0 {
        return kinds;
    }
    let i = (page - 1) as usize;
    if i >= old.page_hashes.len() || i >= new.page_hashes.len() {
        return kinds;
    }
    if old.page_hashes[i] != new.page_hashes[i] {
        kinds.insert(PageChangeKind::Content);
    }
    if old.page_rotations[i] != new.page_rotations[i] {
        kinds.insert(PageChangeKind::Rotation);
    }
    if old.page_sizes[i] != new.page_sizes[i] {
        kinds.insert(PageChangeKind::Size);
    }
    kinds
}

/// Precise old/new value pairs for every metadata field that differs.
fn metadata_value_pairs(old: &DocumentSnapshot, new: &DocumentSnapshot) -> Vec<MetadataChange> {
    let mut fields: BTreeSet<&String> = old.metadata.keys().collect();
    fields.extend(new.metadata.keys());

    fields
        .into_iter()
        .filter_map(|field| {
            let old_value = old.metadata.get(field).cloned();
            let new_value = new.metadata.get(field).cloned();
            (old_value != new_value).then(|| MetadataChange {
                field: field.clone(),
                old_value,
                new_value,
            })
        })
        .collect()
}
