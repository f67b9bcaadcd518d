//! Content-digest deduplication index.
//!
//! Shared by all workers; `resolve` is an atomic check-and-set so exactly
//! one candidate wins `Keep` for a given digest. The index may be seeded
//! from a persisted digest map at startup; the seed is advisory and new
//! events stay correct without it.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use dropgate_core::models::ContentDigest;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolution {
    /// First occurrence; the candidate owns this digest's canonical location.
    Keep,
    /// Content already organized at `existing`; delete the candidate.
    Duplicate { existing: PathBuf },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct IndexedFile {
    path: PathBuf,
    size_bytes: u64,
}

#[derive(Default)]
pub struct DedupIndex {
    inner: Mutex<HashMap<ContentDigest, IndexedFile>>,
}

impl DedupIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Atomically claim a digest or report the first-seen location.
    ///
    /// A digest match with a length mismatch is treated as distinct content;
    /// nothing is ever deleted on a suspected collision.
    pub fn resolve(&self, digest: ContentDigest, size_bytes: u64, candidate: &Path) -> Resolution {
        let mut map = self.inner.lock().expect("dedup index lock poisoned");
        match map.get(&digest) {
            Some(existing) if existing.size_bytes == size_bytes => Resolution::Duplicate {
                existing: existing.path.clone(),
            },
            Some(existing) => {
                tracing::warn!(
                    digest = %digest,
                    existing_size = existing.size_bytes,
                    candidate_size = size_bytes,
                    candidate = %candidate.display(),
                    "Digest match with differing byte length, keeping both"
                );
                Resolution::Keep
            }
            None => {
                map.insert(
                    digest,
                    IndexedFile {
                        path: candidate.to_path_buf(),
                        size_bytes,
                    },
                );
                Resolution::Keep
            }
        }
    }

    /// Drop a claim, but only if it still points at `claimed`. Rolls back a
    /// registration whose placement never completed, so the digest can be
    /// claimed again by a retry or a later submission.
    pub fn forget(&self, digest: &ContentDigest, claimed: &Path) {
        let mut map = self.inner.lock().expect("dedup index lock poisoned");
        if map.get(digest).is_some_and(|e| e.path == claimed) {
            map.remove(digest);
        }
    }

    /// Point a digest at a new canonical location, replacing whatever entry
    /// was there. Used when the recorded location no longer exists on disk.
    pub fn repoint(&self, digest: ContentDigest, size_bytes: u64, path: &Path) {
        self.inner
            .lock()
            .expect("dedup index lock poisoned")
            .insert(
                digest,
                IndexedFile {
                    path: path.to_path_buf(),
                    size_bytes,
                },
            );
    }

    pub fn len(&self) -> usize {
        self.inner.lock().expect("dedup index lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Seed the index from a persisted digest map. Unknown or malformed
    /// entries are skipped; existing in-memory entries win.
    pub fn load_seed(&self, path: &Path) -> Result<usize> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read dedup seed {}", path.display()))?;
        let parsed: HashMap<String, IndexedFile> =
            serde_json::from_str(&raw).context("failed to parse dedup seed")?;

        let mut map = self.inner.lock().expect("dedup index lock poisoned");
        let mut loaded = 0;
        for (hex_digest, entry) in parsed {
            let Some(digest) = ContentDigest::from_hex(&hex_digest) else {
                tracing::warn!(digest = %hex_digest, "Skipping malformed seed digest");
                continue;
            };
            map.entry(digest).or_insert(entry);
            loaded += 1;
        }
        tracing::info!(count = loaded, seed = %path.display(), "Dedup index seeded");
        Ok(loaded)
    }

    /// Persist the current digest map for the next start.
    pub fn save_seed(&self, path: &Path) -> Result<()> {
        let map = self.inner.lock().expect("dedup index lock poisoned");
        let serializable: HashMap<String, &IndexedFile> =
            map.iter().map(|(d, e)| (d.to_string(), e)).collect();
        let json = serde_json::to_string_pretty(&serializable)?;
        drop(map);

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }
        std::fs::write(path, json)
            .with_context(|| format!("failed to write dedup seed {}", path.display()))?;
        Ok(())
    }
}
