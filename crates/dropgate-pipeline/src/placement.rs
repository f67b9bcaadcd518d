//! Final placement of a clean, classified file into the organized tree.

use std::path::{Path, PathBuf};

use dropgate_core::error::IntakeError;
use dropgate_core::models::{Category, ContentDigest, Destination};

use crate::classifier::Classifier;

/// Compute the destination for a classified file. The filename is prefixed
/// with the digest's short hex so distinct content with the same original
/// name never collides inside one category folder.
pub fn destination_for(
    organized_root: &Path,
    category: Category,
    source: &Path,
    digest: &ContentDigest,
) -> Destination {
    let basename = source
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("unnamed");
    let dir = organized_root.join(Classifier::relative_dir(&category));
    let absolute_path = dir.join(format!("{}_{}", digest.short_prefix(), basename));
    Destination {
        category,
        absolute_path,
    }
}

/// Move `source` to its destination, creating category directories on the
/// way. Falls back to copy-then-delete for cross-device moves.
///
/// If the destination already exists it necessarily holds the same content
/// (the name embeds the digest prefix and dedup ran first), so the source
/// is simply removed.
pub fn place(source: &Path, destination: &Destination) -> Result<PathBuf, IntakeError> {
    let dest = &destination.absolute_path;
    if let Some(parent) = dest.parent() {
        std::fs::create_dir_all(parent).map_err(|e| IntakeError::io(parent, e))?;
    }

    if dest.exists() {
        tracing::debug!(dest = %dest.display(), "Destination already present, dropping source");
        std::fs::remove_file(source).map_err(|e| IntakeError::io(source, e))?;
        return Ok(dest.clone());
    }

    match std::fs::rename(source, dest) {
        Ok(()) => {}
        Err(rename_err) => {
            tracing::debug!(
                source = %source.display(),
                error = %rename_err,
                "Rename failed, falling back to copy"
            );
            std::fs::copy(source, dest).map_err(|e| IntakeError::io(dest, e))?;
            std::fs::remove_file(source).map_err(|e| IntakeError::io(source, e))?;
        }
    }
    Ok(dest.clone())
}
