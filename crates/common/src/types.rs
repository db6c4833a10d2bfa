// Core domain types shared across all Folio crates.

use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{SnapshotError, StrategyParseError};

// ── Snapshots ──────────────────────────────────────────────────────

/// Width and height of a page in points.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct PageSize {
    pub width: f64,
    pub height: f64,
}

/// Encryption and permission state of a document.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct SecurityInfo {
    pub encrypted: bool,
    /// Hash over the document's permission flags, when available.
    pub permissions_hash: Option<String>,
}

/// A cheap structural fingerprint of a document at a point in time.
///
/// Snapshots carry counts, hashes, and sizes — never content. A new one is
/// taken on every reload/check and compared against the previous to decide
/// whether the on-disk document materially changed. Immutable once created.
///
/// Invariant: every per-page sequence has length equal to `page_count`.
/// `validate()` checks this; the pipeline stages call it before diffing.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DocumentSnapshot {
    pub page_count: u32,
    /// Per-page content hashes (hex SHA-256), in page order.
    pub page_hashes: Vec<String>,
    /// Per-page rotation in degrees.
    pub page_rotations: Vec<i32>,
    pub page_sizes: Vec<PageSize>,
    /// Per-page annotation counts.
    pub annotation_counts: Vec<u32>,
    pub form_field_count: u32,
    pub has_attachments: bool,
    pub bookmark_count: u32,
    pub security: SecurityInfo,
    /// Document info dictionary (title, author, ...).
    pub metadata: BTreeMap<String, String>,
    pub created_at: DateTime<Utc>,
}

impl DocumentSnapshot {
    /// Check the per-page sequence length invariant.
    pub fn validate(&self) -> Result<(), SnapshotError> {
        let expected = self.page_count as usize;
        for (field, actual) in [
            ("page_hashes", self.page_hashes.len()),
            ("page_rotations", self.page_rotations.len()),
            ("page_sizes", self.page_sizes.len()),
            ("annotation_counts", self.annotation_counts.len()),
        ] {
            if actual != expected {
                return Err(SnapshotError::LengthMismatch { field, expected, actual });
            }
        }
        Ok(())
    }
}

// ── Change classification ──────────────────────────────────────────

/// How disruptive a detected change is to the editor's working copy.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum ChangeSeverity {
    Minor,
    Moderate,
    Major,
}

/// The closed set of change kinds a snapshot comparison can produce.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord)]
#[serde(rename_all = "kebab-case")]
pub enum ChangeKind {
    PagesAdded,
    PagesRemoved,
    PagesReordered,
    PageContentChanged,
    AnnotationsChanged,
    FormFieldsChanged,
    MetadataChanged,
    AttachmentsChanged,
    BookmarksChanged,
    SecurityChanged,
}

impl ChangeKind {
    /// Fixed severity class for this kind.
    ///
    /// `AnnotationsChanged` starts Minor here; the detector escalates it to
    /// Moderate when annotations appear on a previously clean page.
    pub fn base_severity(self) -> ChangeSeverity {
        match self {
            Self::PagesAdded | Self::PagesRemoved | Self::PagesReordered | Self::SecurityChanged => {
                ChangeSeverity::Major
            }
            Self::PageContentChanged | Self::FormFieldsChanged | Self::AttachmentsChanged => {
                ChangeSeverity::Moderate
            }
            Self::AnnotationsChanged | Self::MetadataChanged | Self::BookmarksChanged => {
                ChangeSeverity::Minor
            }
        }
    }

    /// True for changes that invalidate page-number-based addressing.
    pub fn is_structural(self) -> bool {
        matches!(
            self,
            Self::PagesAdded | Self::PagesRemoved | Self::PagesReordered | Self::SecurityChanged
        )
    }
}

/// One observed delta between two snapshots.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ChangeEntry {
    pub kind: ChangeKind,
    pub description: String,
    pub severity: ChangeSeverity,
    /// 1-based page numbers this change touches. Empty for document-wide
    /// changes (metadata, security, form fields).
    #[serde(default)]
    pub page_numbers: Vec<u32>,
}

/// Severity-classified summary of everything that changed between two
/// snapshots.
///
/// Invariant: `major_changes + moderate_changes + minor_changes ==
/// total_changes == changes.len()`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ChangeSummary {
    pub has_changes: bool,
    pub changes: Vec<ChangeEntry>,
    pub total_changes: u32,
    pub major_changes: u32,
    pub moderate_changes: u32,
    pub minor_changes: u32,
    /// 1-based page numbers touched by any change.
    pub affected_pages: BTreeSet<u32>,
    /// True iff any structural change (pages added/removed/reordered,
    /// security) is present.
    pub requires_full_reload: bool,
    pub change_timestamp: DateTime<Utc>,
}

impl ChangeSummary {
    /// Summary for two identical snapshots: nothing changed.
    pub fn no_changes() -> Self {
        Self {
            has_changes: false,
            changes: Vec::new(),
            total_changes: 0,
            major_changes: 0,
            moderate_changes: 0,
            minor_changes: 0,
            affected_pages: BTreeSet::new(),
            requires_full_reload: false,
            change_timestamp: Utc::now(),
        }
    }
}

// ── Page-addressable diff ──────────────────────────────────────────

/// Which aspects of a single page changed.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord)]
#[serde(rename_all = "kebab-case")]
pub enum PageChangeKind {
    Content,
    Rotation,
    Size,
    Annotations,
}

/// Per-page change record within a `DocumentDiff`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PageChange {
    /// 1-based page number in the old document's indexing.
    pub page_number: u32,
    pub has_changes: bool,
    pub change_kinds: BTreeSet<PageChangeKind>,
}

/// Old/new value pair for one metadata field.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct MetadataChange {
    pub field: String,
    pub old_value: Option<String>,
    pub new_value: Option<String>,
}

/// Page-addressable expansion of a `ChangeSummary`, suitable for conflict
/// detection and UI preview rendering.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DocumentDiff {
    pub summary: ChangeSummary,
    /// New page numbers, 1-based, in final-document indexing.
    pub pages_added: Vec<u32>,
    /// Old page numbers, 1-based.
    pub pages_removed: Vec<u32>,
    pub page_changes: Vec<PageChange>,
    pub metadata_changes: Vec<MetadataChange>,
    /// Mirrors `summary.requires_full_reload`.
    pub structural_changes: bool,
    /// Union of all pages in `page_changes`, `pages_added`, and
    /// `pages_removed` — no double counting.
    pub total_affected_pages: u32,
}

// ── Unsaved local edits ────────────────────────────────────────────

/// An unsaved annotation edit held in the editor's memory.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AnnotationEdit {
    pub id: String,
    /// 1-based page the annotation is anchored to.
    pub page_number: u32,
    /// Annotation tool kind (highlight, ink, note, ...), editor-defined.
    pub kind: String,
    /// Tool-specific payload, opaque to the reconciliation engine.
    pub data: serde_json::Value,
    pub is_new: bool,
    pub is_modified: bool,
    pub is_deleted: bool,
}

/// An unsaved text edit.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TextEdit {
    pub id: String,
    pub page_number: u32,
    pub content: String,
}

/// An unsaved signature placement.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SignatureEdit {
    pub id: String,
    pub page_number: u32,
}

/// The user's in-memory edit set, owned by the editor.
///
/// Passed by value into the conflict handler and treated as an immutable
/// snapshot for the duration of one reconciliation pass. Every transform
/// returns a new value; nothing here is mutated in place.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct UnsavedChanges {
    pub annotations: Vec<AnnotationEdit>,
    pub text_edits: Vec<TextEdit>,
    /// Form field name → pending value.
    pub form_values: BTreeMap<String, String>,
    pub signatures: Vec<SignatureEdit>,
    /// 1-based page number → pending rotation in degrees.
    pub page_rotations: BTreeMap<u32, i32>,
}

impl UnsavedChanges {
    pub fn is_empty(&self) -> bool {
        self.annotations.is_empty()
            && self.text_edits.is_empty()
            && self.form_values.is_empty()
            && self.signatures.is_empty()
            && self.page_rotations.is_empty()
    }
}

// ── Conflicts ──────────────────────────────────────────────────────

/// How dangerous a conflict is to the user's unsaved data.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum ConflictSeverity {
    Low,
    Medium,
    Critical,
}

/// The closed set of conflict kinds between an external change and a local
/// edit.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum ConflictKind {
    AnnotationOnChangedPage,
    AnnotationOnRemovedPage,
    TextEditOnChangedPage,
    TextEditOnRemovedPage,
    SignatureOnChangedPage,
    SignatureOnRemovedPage,
    RotationOnChangedPage,
    RotationOnRemovedPage,
    /// A global reorder invalidated page-number anchoring for this edit.
    StructuralReorder,
    /// External metadata change overlapping locally touched document state.
    MetadataOverlap,
}

/// Named policy for reconciling conflicts into a single merged edit set.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum ResolutionStrategy {
    /// Every local edit survives regardless of the external change.
    KeepLocal,
    /// The local in-memory edit set is abandoned wholesale in favor of the
    /// on-disk document.
    KeepExternal,
    /// Local edits survive unless their target page was removed.
    MergePreferLocal,
    /// Local edits on any changed page (removed or content-changed) are
    /// dropped; edits on untouched pages survive.
    MergePreferExternal,
    /// Recommendation only: a human must pick a strategy. Applying it
    /// resolves nothing and drops nothing.
    ManualReview,
}

impl ResolutionStrategy {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::KeepLocal => "keep-local",
            Self::KeepExternal => "keep-external",
            Self::MergePreferLocal => "merge-prefer-local",
            Self::MergePreferExternal => "merge-prefer-external",
            Self::ManualReview => "manual-review",
        }
    }
}

impl FromStr for ResolutionStrategy {
    type Err = StrategyParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "keep-local" => Ok(Self::KeepLocal),
            "keep-external" => Ok(Self::KeepExternal),
            "merge-prefer-local" => Ok(Self::MergePreferLocal),
            "merge-prefer-external" => Ok(Self::MergePreferExternal),
            "manual-review" => Ok(Self::ManualReview),
            other => Err(StrategyParseError(other.to_string())),
        }
    }
}

impl std::fmt::Display for ResolutionStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A detected collision between an external change and one unsaved local
/// edit.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Conflict {
    pub id: Uuid,
    pub kind: ConflictKind,
    /// 1-based page of the local edit, when page-anchored.
    pub page_number: Option<u32>,
    pub description: String,
    pub severity: ConflictSeverity,
    pub recommended_strategy: ResolutionStrategy,
}

// ── External change records (store-facing) ─────────────────────────

/// Raw filesystem event kinds forwarded from the OS watcher.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum FsEventKind {
    /// File content was modified.
    Change,
    /// File was created or first detected.
    Add,
    /// File was deleted.
    Unlink,
    /// The watcher itself reported an error for this path.
    Error,
}

/// Stat block supplied by the OS watcher alongside an event, when known.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct FileStats {
    pub size: u64,
    pub created: Option<DateTime<Utc>>,
    pub modified: Option<DateTime<Utc>>,
    pub accessed: Option<DateTime<Utc>>,
    pub is_file: bool,
    pub is_directory: bool,
}

/// A pending external change as surfaced to the store/UI layer.
///
/// Created by the coordinator on receipt of a watch event; mutated only to
/// flip `dismissed`; pruned by the UI layer, never by the engine.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ExternalChange {
    pub id: Uuid,
    pub path: PathBuf,
    pub kind: FsEventKind,
    pub timestamp: DateTime<Utc>,
    pub dismissed: bool,
}
