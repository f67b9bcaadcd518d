//! Safe extraction of validated archives.
//!
//! Extraction always targets a freshly created, unpredictable scratch
//! directory so no two intakes ever share an extraction path. Nested
//! archives are expanded with an explicit depth-counted worklist; exceeding
//! the depth bound aborts the whole expansion rather than truncating it.

use std::fs::File;
use std::io::{BufReader, Read, Write};
use std::path::{Path, PathBuf};

use tempfile::TempDir;

use dropgate_core::config::ExtractionLimits;
use dropgate_core::error::IntakeError;

use crate::inspector::{inspect, safe_relative_path};
use crate::ArchiveKind;

/// Result of fully expanding an archive, including all nested levels.
///
/// `files` are the non-archive members, all living under `scratch`. The
/// scratch directory (and everything in it) is removed when the expansion is
/// dropped, so callers must move the members out before then.
#[derive(Debug)]
pub struct Expansion {
    scratch: TempDir,
    pub files: Vec<PathBuf>,
}

impl Expansion {
    pub fn scratch_path(&self) -> &Path {
        self.scratch.path()
    }
}

/// Extractor enforcing the configured limits across a whole expansion.
#[derive(Clone)]
pub struct SafeExtractor {
    limits: ExtractionLimits,
    scratch_root: PathBuf,
}

impl SafeExtractor {
    pub fn new(limits: ExtractionLimits, scratch_root: impl Into<PathBuf>) -> Self {
        Self {
            limits,
            scratch_root: scratch_root.into(),
        }
    }

    /// Expand an archive and every nested archive inside it, up to the depth
    /// bound. Any rejection discards the scratch area entirely; no partial
    /// result is ever returned.
    pub fn expand(&self, archive: &Path) -> Result<Expansion, IntakeError> {
        std::fs::create_dir_all(&self.scratch_root)
            .map_err(|e| IntakeError::io(&self.scratch_root, e))?;
        let scratch = tempfile::Builder::new()
            .prefix("intake_")
            .tempdir_in(&self.scratch_root)
            .map_err(|e| IntakeError::io(&self.scratch_root, e))?;

        // Aggregate budget shared across every nesting level, so a nest of
        // small archives cannot multiply past the configured ceilings.
        let mut budget = Budget {
            remaining_bytes: self.limits.max_total_uncompressed,
            remaining_entries: self.limits.max_entry_count,
        };

        let mut files = Vec::new();
        let mut worklist: Vec<(PathBuf, u32)> = vec![(archive.to_path_buf(), 1)];
        let mut extraction_seq = 0u32;

        while let Some((current, depth)) = worklist.pop() {
            if depth > self.limits.max_nesting_depth {
                return Err(IntakeError::NestingTooDeep {
                    max: self.limits.max_nesting_depth,
                });
            }

            let manifest = inspect(&current, &self.limits)?;
            tracing::debug!(
                archive = %current.display(),
                depth = depth,
                entries = manifest.entry_count,
                "Extracting archive level"
            );

            extraction_seq += 1;
            let dest = scratch.path().join(format!("level{}", extraction_seq));
            std::fs::create_dir_all(&dest).map_err(|e| IntakeError::io(&dest, e))?;

            let kind = ArchiveKind::detect(&current).ok_or_else(|| {
                IntakeError::CorruptArchive(format!("unsupported archive: {}", current.display()))
            })?;
            let extracted = match kind {
                ArchiveKind::Zip => extract_zip(&current, &dest, &mut budget)?,
                ArchiveKind::Tar { gzipped } => {
                    extract_tar(&current, &dest, gzipped, &mut budget)?
                }
            };

            for path in extracted {
                if ArchiveKind::detect(&path).is_some() {
                    worklist.push((path, depth + 1));
                } else {
                    files.push(path);
                }
            }
        }

        tracing::info!(
            archive = %archive.display(),
            member_count = files.len(),
            scratch = %scratch.path().display(),
            "Archive fully expanded"
        );

        Ok(Expansion { scratch, files })
    }
}

/// Running byte/entry budget enforced while writing, independent of what the
/// manifests claimed.
struct Budget {
    remaining_bytes: u64,
    remaining_entries: usize,
}

impl Budget {
    fn take_entry(&mut self, max: usize) -> Result<(), IntakeError> {
        if self.remaining_entries == 0 {
            return Err(IntakeError::TooManyEntries {
                count: max + 1,
                max,
            });
        }
        self.remaining_entries -= 1;
        Ok(())
    }
}

/// Copy from `reader` into a new file at `dest`, stopping as soon as the
/// budget would be exceeded. Guards against entries whose real inflated size
/// disagrees with their declared size.
fn write_bounded<R: Read>(
    reader: &mut R,
    dest: &Path,
    budget: &mut Budget,
    max_total: u64,
) -> Result<u64, IntakeError> {
    if let Some(parent) = dest.parent() {
        std::fs::create_dir_all(parent).map_err(|e| IntakeError::io(parent, e))?;
    }
    let mut out = File::create(dest).map_err(|e| IntakeError::io(dest, e))?;

    let mut limited = reader.take(budget.remaining_bytes.saturating_add(1));
    let mut written: u64 = 0;
    let mut buf = [0u8; 16 * 1024];
    loop {
        let n = limited
            .read(&mut buf)
            .map_err(|e| IntakeError::CorruptArchive(format!("{}: {}", dest.display(), e)))?;
        if n == 0 {
            break;
        }
        written += n as u64;
        if written > budget.remaining_bytes {
            return Err(IntakeError::ExtractionTooLarge {
                total: max_total + 1,
                max: max_total,
            });
        }
        out.write_all(&buf[..n]).map_err(|e| IntakeError::io(dest, e))?;
    }
    budget.remaining_bytes -= written;
    Ok(written)
}

fn extract_zip(
    archive_path: &Path,
    dest_root: &Path,
    budget: &mut Budget,
) -> Result<Vec<PathBuf>, IntakeError> {
    let file = File::open(archive_path).map_err(|e| IntakeError::io(archive_path, e))?;
    let mut archive = zip::ZipArchive::new(file)
        .map_err(|e| IntakeError::CorruptArchive(format!("{}: {}", archive_path.display(), e)))?;

    let max_total = budget.remaining_bytes;
    let max_entries = budget.remaining_entries;
    let mut out = Vec::new();

    for i in 0..archive.len() {
        let mut entry = archive.by_index(i).map_err(|e| {
            IntakeError::CorruptArchive(format!("{}: {}", archive_path.display(), e))
        })?;

        let relative = match entry.enclosed_name() {
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

        budget.take_entry(max_entries)?;
        let dest = dest_root.join(relative);
        write_bounded(&mut entry, &dest, budget, max_total)?;
        out.push(dest);
    }
    Ok(out)
}

fn extract_tar(
    archive_path: &Path,
    dest_root: &Path,
    gzipped: bool,
    budget: &mut Budget,
) -> Result<Vec<PathBuf>, IntakeError> {
    let file = File::open(archive_path).map_err(|e| IntakeError::io(archive_path, e))?;
    let reader: Box<dyn Read> = if gzipped {
        Box::new(flate2::read::GzDecoder::new(BufReader::new(file)))
    } else {
        Box::new(BufReader::new(file))
    };
    let mut archive = tar::Archive::new(reader);

    let max_total = budget.remaining_bytes;
    let max_entries = budget.remaining_entries;
    let mut out = Vec::new();

    let iter = archive.entries().map_err(|e| {
        IntakeError::CorruptArchive(format!("{}: {}", archive_path.display(), e))
    })?;
    for entry in iter {
        let mut entry = entry.map_err(|e| {
            IntakeError::CorruptArchive(format!("{}: {}", archive_path.display(), e))
        })?;

        let raw_path = entry
            .path()
            .map_err(|e| {
                IntakeError::CorruptArchive(format!("{}: {}", archive_path.display(), e))
            })?
            .into_owned();
        let relative = safe_relative_path(&raw_path)?;

        let entry_type = entry.header().entry_type();
        if !entry_type.is_file() {
            if entry_type.is_symlink() || entry_type.is_hard_link() {
                tracing::warn!(
                    archive = %archive_path.display(),
                    entry = %raw_path.display(),
                    "Skipping link entry"
                );
            }
            continue;
        }

        budget.take_entry(max_entries)?;
        let dest = dest_root.join(relative);
        write_bounded(&mut entry, &dest, budget, max_total)?;
        out.push(dest);
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use zip::write::FileOptions;

    fn limits() -> ExtractionLimits {
        ExtractionLimits {
            max_entry_count: 100,
            max_total_uncompressed: 10 * 1024 * 1024,
            max_compression_ratio: 1000,
            max_nesting_depth: 3,
        }
    }

    fn zip_bytes(files: &[(&str, &[u8])]) -> Vec<u8> {
        let mut buffer = Vec::new();
        {
            let mut writer = zip::ZipWriter::new(std::io::Cursor::new(&mut buffer));
            let options =
                FileOptions::default().compression_method(zip::CompressionMethod::Deflated);
            for (name, data) in files {
                writer.start_file(*name, options).unwrap();
                writer.write_all(data).unwrap();
            }
            writer.finish().unwrap();
        }
        buffer
    }

    /// Build a zip nested inside `levels` wrapper zips. Level 1 means the
    /// payload file sits directly inside the returned archive.
    fn nested_zip(levels: u32, payload: &[u8]) -> Vec<u8> {
        let mut current = zip_bytes(&[("payload.txt", payload)]);
        for level in 1..levels {
            let name = format!("nest{}.zip", level);
            current = zip_bytes(&[(name.as_str(), current.as_slice())]);
        }
        current
    }

    #[test]
    fn expands_flat_zip_into_scratch() {
        let dir = tempfile::tempdir().unwrap();
        let archive = dir.path().join("flat.zip");
        std::fs::write(&archive, zip_bytes(&[("a.txt", b"one"), ("d/b.txt", b"two")])).unwrap();

        let extractor = SafeExtractor::new(limits(), dir.path().join("scratch"));
        let expansion = extractor.expand(&archive).unwrap();

        assert_eq!(expansion.files.len(), 2);
        for f in &expansion.files {
            assert!(f.starts_with(expansion.scratch_path()));
            assert!(f.exists());
        }
    }

    #[test]
    fn scratch_removed_on_drop() {
        let dir = tempfile::tempdir().unwrap();
        let archive = dir.path().join("flat.zip");
        std::fs::write(&archive, zip_bytes(&[("a.txt", b"x")])).unwrap();

        let extractor = SafeExtractor::new(limits(), dir.path().join("scratch"));
        let expansion = extractor.expand(&archive).unwrap();
        let scratch = expansion.scratch_path().to_path_buf();
        assert!(scratch.exists());
        drop(expansion);
        assert!(!scratch.exists());
    }

    #[test]
    fn two_expansions_use_distinct_scratch_dirs() {
        let dir = tempfile::tempdir().unwrap();
        let archive = dir.path().join("flat.zip");
        std::fs::write(&archive, zip_bytes(&[("a.txt", b"x")])).unwrap();

        let extractor = SafeExtractor::new(limits(), dir.path().join("scratch"));
        let first = extractor.expand(&archive).unwrap();
        let second = extractor.expand(&archive).unwrap();
        assert_ne!(first.scratch_path(), second.scratch_path());
    }

    #[test]
    fn nested_archives_expand_within_depth() {
        let dir = tempfile::tempdir().unwrap();
        let archive = dir.path().join("nested.zip");
        std::fs::write(&archive, nested_zip(3, b"deep payload")).unwrap();

        let extractor = SafeExtractor::new(limits(), dir.path().join("scratch"));
        let expansion = extractor.expand(&archive).unwrap();
        assert_eq!(expansion.files.len(), 1);
        let content = std::fs::read(&expansion.files[0]).unwrap();
        assert_eq!(content, b"deep payload");
    }

    #[test]
    fn nesting_beyond_depth_rejects_whole_expansion() {
        let dir = tempfile::tempdir().unwrap();
        let archive = dir.path().join("nested5.zip");
        std::fs::write(&archive, nested_zip(5, b"too deep")).unwrap();

        let extractor = SafeExtractor::new(limits(), dir.path().join("scratch"));
        let err = extractor.expand(&archive).unwrap_err();
        assert!(matches!(err, IntakeError::NestingTooDeep { max: 3 }));

        // Nothing may survive a rejected expansion.
        let scratch_root = dir.path().join("scratch");
        let leftovers: Vec<_> = std::fs::read_dir(&scratch_root)
            .map(|rd| rd.filter_map(|e| e.ok()).collect())
            .unwrap_or_default();
        assert!(leftovers.is_empty());
    }

    #[test]
    fn traversal_entry_aborts_before_any_write() {
        let dir = tempfile::tempdir().unwrap();
        let archive = dir.path().join("evil.zip");
        std::fs::write(
            &archive,
            zip_bytes(&[("ok.txt", b"fine"), ("../../escape.sh", b"#!/bin/sh")]),
        )
        .unwrap();

        let extractor = SafeExtractor::new(limits(), dir.path().join("scratch"));
        let err = extractor.expand(&archive).unwrap_err();
        assert!(matches!(err, IntakeError::PathTraversal { .. }));
        assert!(!dir.path().join("escape.sh").exists());
    }

    #[test]
    fn aggregate_budget_spans_nested_levels() {
        let dir = tempfile::tempdir().unwrap();
        // Two inner zips, each with entries; entry budget of 3 cannot cover
        // the 2 payload files plus the 2 archive entries consumed on the way.
        let inner_a = zip_bytes(&[("a1.txt", b"a"), ("a2.txt", b"a")]);
        let inner_b = zip_bytes(&[("b1.txt", b"b"), ("b2.txt", b"b")]);
        let outer = zip_bytes(&[("a.zip", inner_a.as_slice()), ("b.zip", inner_b.as_slice())]);
        let archive = dir.path().join("outer.zip");
        std::fs::write(&archive, outer).unwrap();

        let mut tight = limits();
        tight.max_entry_count = 3;
        let extractor = SafeExtractor::new(tight, dir.path().join("scratch"));
        let err = extractor.expand(&archive).unwrap_err();
        assert!(matches!(err, IntakeError::TooManyEntries { .. }));
    }
}
