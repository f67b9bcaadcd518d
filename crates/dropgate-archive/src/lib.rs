//! Bounded, safe archive handling.
//!
//! [`inspector`] enumerates archive entries without extracting and enforces
//! the policy limits; [`extractor`] expands accepted archives into a fresh
//! scratch directory, recursing into nested archives up to a depth bound.
//! All APIs here are synchronous; callers run them on a blocking thread.

pub mod extractor;
pub mod inspector;

use std::path::Path;

pub use extractor::{Expansion, SafeExtractor};
pub use inspector::inspect;

/// Supported archive container formats.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArchiveKind {
    Zip,
    Tar { gzipped: bool },
}

impl ArchiveKind {
    /// Detect the container format from the filename. Returns `None` for
    /// anything the extractor does not understand.
    pub fn detect(path: &Path) -> Option<Self> {
        let name = path.file_name()?.to_str()?.to_lowercase();
        if name.ends_with(".zip") {
            Some(ArchiveKind::Zip)
        } else if name.ends_with(".tar.gz") || name.ends_with(".tgz") {
            Some(ArchiveKind::Tar { gzipped: true })
        } else if name.ends_with(".tar") {
            Some(ArchiveKind::Tar { gzipped: false })
        } else {
            None
        }
    }
}
