//! Stable fingerprints for review inputs.
//!
//! The fingerprint keys the review cache: identical hunk content sent
//! to the same model must hash to the same value across processes, so
//! the hash covers the canonical hunk text rather than any in-memory
//! representation.

use sha2::{Digest, Sha256};

use crate::diff::DiffHunk;

/// Compute the cache fingerprint for a set of hunks reviewed by a
/// given model.
///
/// Hunks are hashed in input order with NUL separators so that
/// concatenation cannot alias across boundaries.
pub fn fingerprint(model: &str, hunks: &[DiffHunk]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(model.as_bytes());
    hasher.update([0u8]);
    for hunk in hunks {
        hasher.update(hunk.canonical_text().as_bytes());
        hasher.update([0u8]);
    }
    hex::encode(hasher.finalize())
}
