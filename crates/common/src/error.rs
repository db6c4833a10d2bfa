// Error taxonomy shared across the Folio workspace.

use thiserror::Error;

/// A snapshot violated its own structural invariants.
///
/// All per-page sequences in a `DocumentSnapshot` must have length equal to
/// `page_count`. A mismatch means the snapshot was assembled incorrectly by
/// the caller, so the pure pipeline stages fail fast instead of producing a
/// wrong diff.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum SnapshotError {
    #[error("snapshot field `{field}` has length {actual}, expected {expected} (page_count)")]
    LengthMismatch { field: &'static str, expected: usize, actual: usize },
}

/// An unknown resolution strategy name was supplied.
///
/// Strategy names form a closed set; an unrecognized string indicates a
/// coordinator bug, not a runtime condition.
#[derive(Debug, Error, PartialEq, Eq)]
#[error("unknown resolution strategy: {0}")]
pub struct StrategyParseError(pub String);
