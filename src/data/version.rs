//! Version values for change detection.
//!
//! Versions are cheap fingerprints used to decide whether a cached result is
//! still valid. Equal inputs always produce equal versions; different inputs
//! produce different versions unless a hash collision occurs, so versions
//! must only be used where the risk of acting on a stale resource is
//! acceptable.

use std::hash::{Hash, Hasher};
use std::path::Path;

/// A version fingerprint.
pub type Version = u64;

/// Returns a version for a string.
#[must_use]
pub fn version_for_str(data: &str) -> Version {
    let mut hasher = std::collections::hash_map::DefaultHasher::new();
    data.hash(&mut hasher);
    hasher.finish()
}

/// Returns a version for a file path.
///
/// The version is derived from the path together with the file's
/// modification time and length, so it changes when the file changes. A file
/// that cannot be stat-ed gets a version distinct from any existing file;
/// the error kind is folded in so that a missing file and an unreadable file
/// differ.
///
/// Content changes that leave both mtime and length untouched are not
/// detected.
#[must_use]
pub fn version_for_file(path: &Path) -> Version {
    let mut hasher = std::collections::hash_map::DefaultHasher::new();
    path.hash(&mut hasher);
    match std::fs::metadata(path) {
        Ok(metadata) => {
            metadata.modified().ok().hash(&mut hasher);
            metadata.len().hash(&mut hasher);
        }
        Err(err) => {
            // Hash a marker so that "no file" differs from an empty file.
            "stat-error".hash(&mut hasher);
            err.kind().to_string().hash(&mut hasher);
        }
    }
    hasher.finish()
}

/// Aggregates several versions into one.
///
/// The aggregate is stable: unchanged component versions produce an
/// unchanged aggregate. The aggregate depends on component order.
#[must_use]
pub fn aggregate_version<I: IntoIterator<Item = Version>>(versions: I) -> Version {
    let mut hasher = std::collections::hash_map::DefaultHasher::new();
    for version in versions {
        version.hash(&mut hasher);
    }
    hasher.finish()
}
