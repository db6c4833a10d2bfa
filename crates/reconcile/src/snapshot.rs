// Page content hashing and the snapshot seam.
//
// Snapshots are structural fingerprints taken by the hosting editor's
// document backend; the engine only compares them. `SnapshotProvider`
// abstracts the backend so the pipeline is testable without a real
// document parser.

use std::path::Path;

use anyhow::Result;
use sha2::{Digest, Sha256};

use folio_common::types::DocumentSnapshot;

/// Hex-encoded SHA-256 hash of page content.
pub type PageHash = String;

/// Compute the SHA-256 hash of the given bytes, returned as a lowercase hex string.
///
/// Used by snapshot producers to fingerprint per-page content streams.
pub fn sha256_hex(content: &[u8]) -> PageHash {
    let digest = Sha256::digest(content);
    hex_encode(&digest)
}

/// Produces a structural snapshot of the document at a path.
///
/// Implemented by the editor's document backend. An `Err` means the file is
/// gone or unreadable; the coordinator treats that as a maximal
/// pages-removed change, not a hard failure.
pub trait SnapshotProvider: Send + Sync {
    fn snapshot(&self, path: &Path) -> Result<DocumentSnapshot>;
}

fn hex_encode(bytes: &[u8]) -> String {
    let mut s = String::with_capacity(bytes.len() * 2);
    for &b in bytes {
        s.push_str(&format!("{b:02x}"));
    }
    s
}
