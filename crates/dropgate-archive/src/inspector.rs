//! Archive inspection: enumerate entries and enforce policy limits before a
//! single byte is written to disk.
//!
//! Rejection checks run in a fixed order: path traversal, then entry count,
//! then cumulative uncompressed size, then compression ratio. Decoder-level
//! corruption surfaces as [`IntakeError::CorruptArchive`], distinct from the
//! policy rejections.

use std::fs::File;
use std::io::BufReader;
use std::path::{Component, Path, PathBuf};

use dropgate_core::config::ExtractionLimits;
use dropgate_core::error::IntakeError;
use dropgate_core::models::{ArchiveManifest, ManifestEntry};

use crate::ArchiveKind;

/// Inspect an archive and validate it against the limits.
pub fn inspect(path: &Path, limits: &ExtractionLimits) -> Result<ArchiveManifest, IntakeError> {
    let kind = ArchiveKind::detect(path).ok_or_else(|| {
        IntakeError::CorruptArchive(format!("unsupported archive: {}", path.display()))
    })?;

    let entries = match kind {
        ArchiveKind::Zip => list_zip(path)?,
        ArchiveKind::Tar { gzipped } => list_tar(path, gzipped)?,
    };

    let mut total_uncompressed: u64 = 0;
    let mut max_entry_ratio: u64 = 0;

    for entry in &entries {
        total_uncompressed = total_uncompressed.saturating_add(entry.uncompressed_size);
        if entry.compressed_size > 0 {
            max_entry_ratio = max_entry_ratio.max(entry.uncompressed_size / entry.compressed_size);
        }
    }

    if entries.len() > limits.max_entry_count {
        return Err(IntakeError::TooManyEntries {
            count: entries.len(),
            max: limits.max_entry_count,
        });
    }

    if total_uncompressed > limits.max_total_uncompressed {
        return Err(IntakeError::ExtractionTooLarge {
            total: total_uncompressed,
            max: limits.max_total_uncompressed,
        });
    }

    for entry in &entries {
        if entry.compressed_size > 0 {
            let ratio = entry.uncompressed_size / entry.compressed_size;
            if ratio > limits.max_compression_ratio {
                return Err(IntakeError::SuspiciousCompressionRatio {
                    entry: entry.relative_path.display().to_string(),
                    ratio,
                    max: limits.max_compression_ratio,
                });
            }
        }
    }

    // Tar members carry no per-entry compressed size; for gzipped tars the
    // whole-archive ratio is the bomb signal instead.
    if matches!(kind, ArchiveKind::Tar { gzipped: true }) {
        let archive_size = std::fs::metadata(path)
            .map_err(|e| IntakeError::io(path, e))?
            .len()
            .max(1);
        let ratio = total_uncompressed / archive_size;
        if ratio > limits.max_compression_ratio {
            return Err(IntakeError::SuspiciousCompressionRatio {
                entry: path.display().to_string(),
                ratio,
                max: limits.max_compression_ratio,
            });
        }
        max_entry_ratio = max_entry_ratio.max(ratio);
    }

    tracing::debug!(
        path = %path.display(),
        entry_count = entries.len(),
        total_uncompressed = total_uncompressed,
        max_entry_ratio = max_entry_ratio,
        "Archive manifest accepted"
    );

    Ok(ArchiveManifest {
        entry_count: entries.len(),
        total_uncompressed,
        max_entry_ratio,
        entries,
    })
}

/// Normalize an entry path and prove it stays inside the extraction root.
/// Absolute paths, drive prefixes, and any `..` component are traversal.
pub(crate) fn safe_relative_path(raw: &Path) -> Result<PathBuf, IntakeError> {
    let mut out = PathBuf::new();
    for component in raw.components() {
        match component {
            Component::Normal(part) => out.push(part),
            Component::CurDir => {}
            Component::ParentDir | Component::RootDir | Component::Prefix(_) => {
                return Err(IntakeError::PathTraversal {
                    entry: raw.display().to_string(),
                });
            }
        }
    }
    if out.as_os_str().is_empty() {
        return Err(IntakeError::PathTraversal {
            entry: raw.display().to_string(),
        });
    }
    Ok(out)
}

fn list_zip(path: &Path) -> Result<Vec<ManifestEntry>, IntakeError> {
    let file = File::open(path).map_err(|e| IntakeError::io(path, e))?;
    let mut archive = zip::ZipArchive::new(file)
        .map_err(|e| IntakeError::CorruptArchive(format!("{}: {}", path.display(), e)))?;

    let mut entries = Vec::new();
    for i in 0..archive.len() {
        let entry = archive
            .by_index(i)
            .map_err(|e| IntakeError::CorruptArchive(format!("{}: {}", path.display(), e)))?;

        // Traversal is checked per entry, before any aggregate limit.
        let relative_path = match entry.enclosed_name() {
            Some(p) => safe_relative_path(&p.to_path_buf())?,
            None => {
                return Err(IntakeError::PathTraversal {
                    entry: entry.name().to_string(),
                });
            }
        };

        if entry.is_dir() {
            continue;
        }

        entries.push(ManifestEntry {
            relative_path,
            compressed_size: entry.compressed_size(),
            uncompressed_size: entry.size(),
        });
    }
    Ok(entries)
}

fn list_tar(path: &Path, gzipped: bool) -> Result<Vec<ManifestEntry>, IntakeError> {
    let file = File::open(path).map_err(|e| IntakeError::io(path, e))?;
    let reader: Box<dyn std::io::Read> = if gzipped {
        Box::new(flate2::read::GzDecoder::new(BufReader::new(file)))
    } else {
        Box::new(BufReader::new(file))
    };
    let mut archive = tar::Archive::new(reader);

    let mut entries = Vec::new();
    let iter = archive
        .entries()
        .map_err(|e| IntakeError::CorruptArchive(format!("{}: {}", path.display(), e)))?;
    for entry in iter {
        let entry = entry
            .map_err(|e| IntakeError::CorruptArchive(format!("{}: {}", path.display(), e)))?;

        let raw_path = entry
            .path()
            .map_err(|e| IntakeError::CorruptArchive(format!("{}: {}", path.display(), e)))?
            .into_owned();
        let relative_path = safe_relative_path(&raw_path)?;

        let header = entry.header();
        if !header.entry_type().is_file() {
            // Directories are implied by file paths; symlinks and specials
            // are never materialized.
            continue;
        }

        entries.push(ManifestEntry {
            relative_path,
            compressed_size: 0,
            uncompressed_size: header.size().unwrap_or(0),
        });
    }
    Ok(entries)
}
