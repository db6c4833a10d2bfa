// Conflict detection and resolution between external document changes and
// the user's unsaved in-memory edits.
//
// Every page-anchored local edit is resolved against the diff: a removed
// target page is a critical conflict (the edit has nowhere to land), a
// content- or rotation-changed page is a medium conflict (anchor
// coordinates may no longer match the visuals), and a global structural
// change degrades every remaining edit to a medium conflict because page
// numbers no longer address the same pages. Resolution policies are pure,
// deterministic transforms — nothing here prompts or persists.

use std::collections::BTreeSet;

use uuid::Uuid;

use folio_common::types::{
    ChangeSummary, Conflict, ConflictKind, ConflictSeverity, DocumentDiff, PageChangeKind,
    ResolutionStrategy, UnsavedChanges,
};

/// Result of applying a resolution strategy.
#[derive(Debug, Clone, PartialEq)]
pub struct Resolution {
    /// False only for `manual-review`, which resolves nothing by design.
    pub resolved: bool,
    pub merged: UnsavedChanges,
}

/// How a local edit's target page fared in the external change.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PageFate {
    Removed,
    Changed,
    Reordered,
}

/// Cross-reference the user's unsaved edits against a diff and report every
/// collision, most dangerous classification first per edit.
pub fn detect_conflicts(
    unsaved: &UnsavedChanges,
    summary: &ChangeSummary,
    diff: &DocumentDiff,
) -> Vec<Conflict> {
    let removed: BTreeSet<u32> = diff.pages_removed.iter().copied().collect();
    let changed: BTreeSet<u32> = diff
        .page_changes
        .iter()
        .filter(|p| {
            p.change_kinds.contains(&PageChangeKind::Content)
                || p.change_kinds.contains(&PageChangeKind::Rotation)
        })
        .map(|p| p.page_number)
        .collect();

    let fate = |page: u32| -> Option<PageFate> {
        if removed.contains(&page) {
            Some(PageFate::Removed)
        } else if changed.contains(&page) {
            Some(PageFate::Changed)
        } else if summary.requires_full_reload {
            // Reorders and other global structural changes invalidate
            // page-number anchoring even for pages with no recorded delta.
            Some(PageFate::Reordered)
        } else {
            None
        }
    };

    let mut conflicts: Vec<Conflict> = Vec::new();

    for annotation in &unsaved.annotations {
        if let Some(fate) = fate(annotation.page_number) {
            conflicts.push(conflict_for(
                fate,
                ConflictKind::AnnotationOnRemovedPage,
                ConflictKind::AnnotationOnChangedPage,
                annotation.page_number,
                format!("annotation {}", annotation.id),
            ));
        }
    }

    for edit in &unsaved.text_edits {
        if let Some(fate) = fate(edit.page_number) {
            conflicts.push(conflict_for(
                fate,
                ConflictKind::TextEditOnRemovedPage,
                ConflictKind::TextEditOnChangedPage,
                edit.page_number,
                format!("text edit {}", edit.id),
            ));
        }
    }

    for signature in &unsaved.signatures {
        if let Some(fate) = fate(signature.page_number) {
            conflicts.push(conflict_for(
                fate,
                ConflictKind::SignatureOnRemovedPage,
                ConflictKind::SignatureOnChangedPage,
                signature.page_number,
                format!("signature {}", signature.id),
            ));
        }
    }

    for (&page, &degrees) in &unsaved.page_rotations {
        if let Some(fate) = fate(page) {
            conflicts.push(conflict_for(
                fate,
                ConflictKind::RotationOnRemovedPage,
                ConflictKind::RotationOnChangedPage,
                page,
                format!("pending {degrees}° rotation"),
            ));
        }
    }

    // Externally changed metadata while form values are pending locally:
    // contextually related, no data at structural risk.
    if !diff.metadata_changes.is_empty() && !unsaved.form_values.is_empty() {
        let fields: Vec<&str> =
            diff.metadata_changes.iter().map(|m| m.field.as_str()).collect();
        conflicts.push(Conflict {
            id: Uuid::new_v4(),
            kind: ConflictKind::MetadataOverlap,
            page_number: None,
            description: format!(
                "document metadata ({}) changed while form values are pending",
                fields.join(", ")
            ),
            severity: ConflictSeverity::Low,
            recommended_strategy: ResolutionStrategy::KeepLocal,
        });
    }

    conflicts
}

fn conflict_for(
    fate: PageFate,
    removed_kind: ConflictKind,
    changed_kind: ConflictKind,
    page: u32,
    subject: String,
) -> Conflict {
    let (kind, severity, recommended, what) = match fate {
        PageFate::Removed => (
            removed_kind,
            ConflictSeverity::Critical,
            ResolutionStrategy::ManualReview,
            "was removed",
        ),
        PageFate::Changed => (
            changed_kind,
            ConflictSeverity::Medium,
            ResolutionStrategy::MergePreferLocal,
            "changed",
        ),
        PageFate::Reordered => (
            ConflictKind::StructuralReorder,
            ConflictSeverity::Medium,
            ResolutionStrategy::MergePreferLocal,
            "may have moved",
        ),
    };
    Conflict {
        id: Uuid::new_v4(),
        kind,
        page_number: Some(page),
        description: format!("{subject} targets page {page}, which {what}"),
        severity,
        recommended_strategy: recommended,
    }
}

/// Stamp every conflict with one caller-supplied strategy. Pure — the
/// input slice is untouched.
pub fn auto_resolve_conflicts(
    conflicts: &[Conflict],
    strategy: ResolutionStrategy,
) -> Vec<Conflict> {
    conflicts
        .iter()
        .map(|conflict| Conflict { recommended_strategy: strategy, ..conflict.clone() })
        .collect()
}

/// Apply a resolution strategy to the unsaved edit set.
///
/// Deterministic and idempotent: the same three inputs always produce the
/// same merged result, and nothing is mutated in place.
pub fn apply_conflict_resolutions(
    unsaved: &UnsavedChanges,
    conflicts: &[Conflict],
    strategy: ResolutionStrategy,
) -> Resolution {
    match strategy {
        ResolutionStrategy::KeepLocal => {
            Resolution { resolved: true, merged: unsaved.clone() }
        }
        // External wins wholesale: the local edit set is abandoned, not
        // just the conflicted entries.
        ResolutionStrategy::KeepExternal => {
            Resolution { resolved: true, merged: UnsavedChanges::default() }
        }
        ResolutionStrategy::MergePreferLocal => {
            let doomed = pages_with_kind(conflicts, is_removed_page_kind);
            Resolution { resolved: true, merged: drop_page_edits(unsaved, &doomed) }
        }
        ResolutionStrategy::MergePreferExternal => {
            let mut doomed = pages_with_kind(conflicts, is_removed_page_kind);
            doomed.extend(pages_with_kind(conflicts, is_changed_page_kind));
            Resolution { resolved: true, merged: drop_page_edits(unsaved, &doomed) }
        }
        ResolutionStrategy::ManualReview => {
            Resolution { resolved: false, merged: unsaved.clone() }
        }
    }
}

fn is_removed_page_kind(kind: ConflictKind) -> bool {
    matches!(
        kind,
        ConflictKind::AnnotationOnRemovedPage
            | ConflictKind::TextEditOnRemovedPage
            | ConflictKind::SignatureOnRemovedPage
            | ConflictKind::RotationOnRemovedPage
    )
}

fn is_changed_page_kind(kind: ConflictKind) -> bool {
    matches!(
        kind,
        ConflictKind::AnnotationOnChangedPage
            | ConflictKind::TextEditOnChangedPage
            | ConflictKind::SignatureOnChangedPage
            | ConflictKind::RotationOnChangedPage
    )
}

fn pages_with_kind(conflicts: &[Conflict], pred: fn(ConflictKind) -> bool) -> BTreeSet<u32> {
    conflicts
        .iter()
        .filter(|c| pred(c.kind))
        .filter_map(|c| c.page_number)
        .collect()
}

/// New edit set with every page-anchored edit on the given pages dropped.
/// Form values are not page-anchored and always survive here.
fn drop_page_edits(unsaved: &UnsavedChanges, pages: &BTreeSet<u32>) -> UnsavedChanges {
    let mut merged = unsaved.clone();
    merged.annotations.retain(|a| !pages.contains(&a.page_number));
    merged.text_edits.retain(|t| !pages.contains(&t.page_number));
    merged.signatures.retain(|s| !pages.contains(&s.page_number));
    merged.page_rotations.retain(|page, _| !pages.contains(page));
    merged
}

#[cfg(test)]
mod tests {
    use chrono::Utc;
    use folio_common::types::{
        AnnotationEdit, DocumentSnapshot, PageSize, SecurityInfo, SignatureEdit, TextEdit,
    };

    use crate::detect::detect_changes;
    use crate::diff::create_document_diff;

    use super::*;

    fn snapshot_with_hashes(hashes: &[&str]) -> DocumentSnapshot {
        let n = hashes.len();
        DocumentSnapshot {
            page_count: n as u32,
            page_hashes: hashes.iter().map(|h| h.to_string()).collect(),
            page_rotations: vec![0; n],
            page_sizes: vec![PageSize { width: 612.0, height: 792.0 }; n],
            annotation_counts: vec![0; n],
            form_field_count: 0,
            has_attachments: false,
            bookmark_count: 0,
            security: SecurityInfo::default(),
            metadata: std::collections::BTreeMap::new(),
            created_at: Utc::now(),
        }
    }

    fn annotation(id: &str, page: u32) -> AnnotationEdit {
        AnnotationEdit {
            id: id.to_string(),
            page_number: page,
            kind: "highlight".to_string(),
            data: serde_json::json!({"rect": [10, 10, 120, 30]}),
            is_new: true,
            is_modified: false,
            is_deleted: false,
        }
    }

    fn pipeline(
        old: &DocumentSnapshot,
        new: &DocumentSnapshot,
    ) -> (ChangeSummary, DocumentDiff) {
        let summary = detect_changes(old, new).unwrap();
        let diff = create_document_diff(old, new, &summary).unwrap();
        (summary, diff)
    }

    // ── Example scenario: annotation on a content-changed page ─────

    #[test]
    fn annotation_on_changed_page_is_single_medium_conflict() {
        let old = snapshot_with_hashes(&["h1", "h2", "h3", "h4", "h5"]);
        let mut new = old.clone();
        new.page_hashes[1] = "h2-modified".to_string();
        let (summary, diff) = pipeline(&old, &new);

        let unsaved =
            UnsavedChanges { annotations: vec![annotation("a1", 2)], ..Default::default() };
        let conflicts = detect_conflicts(&unsaved, &summary, &diff);

        assert_eq!(conflicts.len(), 1);
        assert_eq!(conflicts[0].kind, ConflictKind::AnnotationOnChangedPage);
        assert_eq!(conflicts[0].severity, ConflictSeverity::Medium);
        assert_eq!(conflicts[0].page_number, Some(2));
        assert_eq!(conflicts[0].recommended_strategy, ResolutionStrategy::MergePreferLocal);

        // merge-prefer-local keeps the annotation.
        let local =
            apply_conflict_resolutions(&unsaved, &conflicts, ResolutionStrategy::MergePreferLocal);
        assert!(local.resolved);
        assert_eq!(local.merged.annotations.len(), 1);

        // merge-prefer-external drops it.
        let external = apply_conflict_resolutions(
            &unsaved,
            &conflicts,
            ResolutionStrategy::MergePreferExternal,
        );
        assert!(external.resolved);
        assert!(external.merged.annotations.is_empty());
    }

    // ── Example scenario: annotation on a removed page ─────────────

    #[test]
    fn annotation_on_removed_page_is_critical_and_dropped_by_merges() {
        let old = snapshot_with_hashes(&["h1", "h2", "h3", "h4", "h5"]);
        let new = snapshot_with_hashes(&["h1", "h2", "h4", "h5"]);
        let (summary, diff) = pipeline(&old, &new);

        let unsaved =
            UnsavedChanges { annotations: vec![annotation("a1", 3)], ..Default::default() };
        let conflicts = detect_conflicts(&unsaved, &summary, &diff);

        let critical = conflicts
            .iter()
            .find(|c| c.kind == ConflictKind::AnnotationOnRemovedPage)
            .expect("expected a removed-page conflict");
        assert_eq!(critical.severity, ConflictSeverity::Critical);
        assert_eq!(critical.recommended_strategy, ResolutionStrategy::ManualReview);

        // Dropped under every merge policy except keep-local.
        for strategy in [
            ResolutionStrategy::KeepExternal,
            ResolutionStrategy::MergePreferLocal,
            ResolutionStrategy::MergePreferExternal,
        ] {
            let resolution = apply_conflict_resolutions(&unsaved, &conflicts, strategy);
            assert!(resolution.merged.annotations.is_empty(), "strategy {strategy} kept it");
        }

        let kept =
            apply_conflict_resolutions(&unsaved, &conflicts, ResolutionStrategy::KeepLocal);
        assert_eq!(kept.merged.annotations.len(), 1);
    }

    // ── Global structural fallback ─────────────────────────────────

    #[test]
    fn reorder_conflicts_edits_on_untouched_pages() {
        let old = snapshot_with_hashes(&["h1", "h2", "h3"]);
        let new = snapshot_with_hashes(&["h2", "h1", "h3"]);
        let (summary, diff) = pipeline(&old, &new);
        assert!(summary.requires_full_reload);

        // Page 3 kept its position and hash, but anchoring is still void.
        let unsaved =
            UnsavedChanges { annotations: vec![annotation("a1", 3)], ..Default::default() };
        let conflicts = detect_conflicts(&unsaved, &summary, &diff);

        assert_eq!(conflicts.len(), 1);
        assert_eq!(conflicts[0].kind, ConflictKind::StructuralReorder);
        assert_eq!(conflicts[0].severity, ConflictSeverity::Medium);

        // The page still exists, so merge-prefer-local keeps the edit.
        let local =
            apply_conflict_resolutions(&unsaved, &conflicts, ResolutionStrategy::MergePreferLocal);
        assert_eq!(local.merged.annotations.len(), 1);
        // Reorder conflicts are not changed-page conflicts either: the edit
        // survives merge-prefer-external on an untouched page.
        let external = apply_conflict_resolutions(
            &unsaved,
            &conflicts,
            ResolutionStrategy::MergePreferExternal,
        );
        assert_eq!(external.merged.annotations.len(), 1);
    }

    // ── Per-edit-kind conflicts ────────────────────────────────────

    #[test]
    fn text_signature_and_rotation_edits_conflict_by_kind() {
        let old = snapshot_with_hashes(&["h1", "h2", "h3"]);
        let new = snapshot_with_hashes(&["h1", "h3"]);
        let (summary, diff) = pipeline(&old, &new);
        assert_eq!(diff.pages_removed, vec![2]);

        let mut unsaved = UnsavedChanges {
            text_edits: vec![TextEdit {
                id: "t1".into(),
                page_number: 2,
                content: "revised".into(),
            }],
            signatures: vec![SignatureEdit { id: "s1".into(), page_number: 2 }],
            ..Default::default()
        };
        unsaved.page_rotations.insert(2, 90);

        let conflicts = detect_conflicts(&unsaved, &summary, &diff);
        let kinds: Vec<ConflictKind> = conflicts.iter().map(|c| c.kind).collect();
        assert!(kinds.contains(&ConflictKind::TextEditOnRemovedPage));
        assert!(kinds.contains(&ConflictKind::SignatureOnRemovedPage));
        assert!(kinds.contains(&ConflictKind::RotationOnRemovedPage));
        assert!(conflicts.iter().all(|c| c.severity == ConflictSeverity::Critical));

        let merged =
            apply_conflict_resolutions(&unsaved, &conflicts, ResolutionStrategy::MergePreferLocal)
                .merged;
        assert!(merged.text_edits.is_empty());
        assert!(merged.signatures.is_empty());
        assert!(merged.page_rotations.is_empty());
    }

    #[test]
    fn metadata_overlap_is_low_severity() {
        let mut old = snapshot_with_hashes(&["h1"]);
        old.metadata.insert("title".into(), "Draft".into());
        let mut new = old.clone();
        new.metadata.insert("title".into(), "Final".into());
        let (summary, diff) = pipeline(&old, &new);

        let mut unsaved = UnsavedChanges::default();
        unsaved.form_values.insert("applicant".into(), "Ada".into());

        let conflicts = detect_conflicts(&unsaved, &summary, &diff);
        assert_eq!(conflicts.len(), 1);
        assert_eq!(conflicts[0].kind, ConflictKind::MetadataOverlap);
        assert_eq!(conflicts[0].severity, ConflictSeverity::Low);
        assert_eq!(conflicts[0].page_number, None);
        assert_eq!(conflicts[0].recommended_strategy, ResolutionStrategy::KeepLocal);
    }

    #[test]
    fn edits_on_untouched_pages_produce_no_conflicts() {
        let old = snapshot_with_hashes(&["h1", "h2", "h3"]);
        let mut new = old.clone();
        new.page_hashes[0] = "h1-modified".to_string();
        let (summary, diff) = pipeline(&old, &new);

        let unsaved =
            UnsavedChanges { annotations: vec![annotation("a1", 3)], ..Default::default() };
        assert!(detect_conflicts(&unsaved, &summary, &diff).is_empty());
    }

    // ── auto_resolve_conflicts ─────────────────────────────────────

    #[test]
    fn auto_resolve_stamps_without_mutating_input() {
        let old = snapshot_with_hashes(&["h1", "h2"]);
        let new = snapshot_with_hashes(&["h1"]);
        let (summary, diff) = pipeline(&old, &new);
        let unsaved =
            UnsavedChanges { annotations: vec![annotation("a1", 2)], ..Default::default() };

        let conflicts = detect_conflicts(&unsaved, &summary, &diff);
        assert_eq!(conflicts[0].recommended_strategy, ResolutionStrategy::ManualReview);

        let stamped = auto_resolve_conflicts(&conflicts, ResolutionStrategy::KeepExternal);
        assert!(stamped
            .iter()
            .all(|c| c.recommended_strategy == ResolutionStrategy::KeepExternal));
        // Original is untouched.
        assert_eq!(conflicts[0].recommended_strategy, ResolutionStrategy::ManualReview);
        // Identity is preserved so callers can correlate.
        assert_eq!(stamped[0].id, conflicts[0].id);
    }

    // ── Policy properties ──────────────────────────────────────────

    #[test]
    fn keep_local_returns_input_unchanged() {
        let old = snapshot_with_hashes(&["h1", "h2"]);
        let new = snapshot_with_hashes(&["h1"]);
        let (summary, diff) = pipeline(&old, &new);
        let mut unsaved =
            UnsavedChanges { annotations: vec![annotation("a1", 2)], ..Default::default() };
        unsaved.form_values.insert("field".into(), "value".into());

        let conflicts = detect_conflicts(&unsaved, &summary, &diff);
        let resolution =
            apply_conflict_resolutions(&unsaved, &conflicts, ResolutionStrategy::KeepLocal);
        assert!(resolution.resolved);
        assert_eq!(resolution.merged, unsaved);
    }

    #[test]
    fn keep_external_abandons_everything() {
        let old = snapshot_with_hashes(&["h1", "h2"]);
        let mut new = old.clone();
        new.page_hashes[0] = "h1-modified".to_string();
        let (summary, diff) = pipeline(&old, &new);

        // One conflicted annotation, one unconflicted, plus form values.
        let mut unsaved = UnsavedChanges {
            annotations: vec![annotation("a1", 1), annotation("a2", 2)],
            ..Default::default()
        };
        unsaved.form_values.insert("field".into(), "value".into());

        let conflicts = detect_conflicts(&unsaved, &summary, &diff);
        let resolution =
            apply_conflict_resolutions(&unsaved, &conflicts, ResolutionStrategy::KeepExternal);
        assert!(resolution.resolved);
        assert!(resolution.merged.is_empty());
    }

    #[test]
    fn manual_review_resolves_nothing_and_drops_nothing() {
        let old = snapshot_with_hashes(&["h1", "h2"]);
        let new = snapshot_with_hashes(&["h1"]);
        let (summary, diff) = pipeline(&old, &new);
        let unsaved =
            UnsavedChanges { annotations: vec![annotation("a1", 2)], ..Default::default() };

        let conflicts = detect_conflicts(&unsaved, &summary, &diff);
        let resolution =
            apply_conflict_resolutions(&unsaved, &conflicts, ResolutionStrategy::ManualReview);
        assert!(!resolution.resolved);
        assert_eq!(resolution.merged, unsaved);
    }

    #[test]
    fn resolution_is_idempotent() {
        let old = snapshot_with_hashes(&["h1", "h2", "h3"]);
        let new = snapshot_with_hashes(&["h1-modified", "h3"]);
        let (summary, diff) = pipeline(&old, &new);
        let mut unsaved = UnsavedChanges {
            annotations: vec![annotation("a1", 1), annotation("a2", 2), annotation("a3", 3)],
            ..Default::default()
        };
        unsaved.page_rotations.insert(2, 180);

        let conflicts = detect_conflicts(&unsaved, &summary, &diff);
        for strategy in [
            ResolutionStrategy::KeepLocal,
            ResolutionStrategy::KeepExternal,
            ResolutionStrategy::MergePreferLocal,
            ResolutionStrategy::MergePreferExternal,
            ResolutionStrategy::ManualReview,
        ] {
            let first = apply_conflict_resolutions(&unsaved, &conflicts, strategy);
            let second = apply_conflict_resolutions(&unsaved, &conflicts, strategy);
            assert_eq!(first, second, "strategy {strategy} is not deterministic");
        }
    }
}
