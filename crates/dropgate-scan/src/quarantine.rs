//! Quarantine store: isolates flagged files, preserving provenance.
//!
//! Files are moved, never deleted. The destination name carries a timestamp
//! so repeated quarantines of same-named files cannot collide.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::Utc;

use dropgate_core::models::{QuarantineEntry, QuarantineReason};

#[derive(Clone)]
pub struct QuarantineStore {
    root: PathBuf,
}

impl QuarantineStore {
    pub async fn new(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        tokio::fs::create_dir_all(&root)
            .await
            .with_context(|| format!("failed to create quarantine dir {}", root.display()))?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let _ = tokio::fs::set_permissions(&root, std::fs::Permissions::from_mode(0o700)).await;
        }

        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Move a file into quarantine. Rename first; cross-device moves fall
    /// back to copy-then-delete.
    pub async fn isolate(
        &self,
        source: &Path,
        reason: QuarantineReason,
    ) -> Result<QuarantineEntry> {
        let filename = source
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| "unnamed".to_string());

        let ts = Utc::now().format("%Y%m%dT%H%M%S%.3f");
        let dest = self.root.join(format!("{}_{}_{}", ts, reason.label(), filename));

        match tokio::fs::rename(source, &dest).await {
            Ok(()) => {}
            Err(rename_err) => {
                tracing::warn!(
                    error = %rename_err,
                    from = %source.display(),
                    "Rename into quarantine failed, falling back to copy"
                );
                tokio::fs::copy(source, &dest)
                    .await
                    .with_context(|| format!("failed to copy {} to quarantine", source.display()))?;
                if let Err(e) = tokio::fs::remove_file(source).await {
                    tracing::warn!(
                        error = %e,
                        path = %source.display(),
                        "Failed to remove quarantined source after copy"
                    );
                }
            }
        }

        tracing::warn!(
            from = %source.display(),
            to = %dest.display(),
            reason = %reason,
            "File quarantined"
        );

        Ok(QuarantineEntry {
            original_path: source.to_path_buf(),
            quarantined_path: dest,
            reason,
            moved_at: Utc::now(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn isolate_moves_file_and_records_provenance() {
        let dir = tempfile::tempdir().unwrap();
        let source = dir.path().join("bad.bin");
        tokio::fs::write(&source, b"payload").await.unwrap();

        let store = QuarantineStore::new(dir.path().join("quarantine"))
            .await
            .unwrap();
        let entry = store
            .isolate(&source, QuarantineReason::Virus("Test-Sig".into()))
            .await
            .unwrap();

        assert!(!source.exists());
        assert!(entry.quarantined_path.exists());
        assert_eq!(entry.original_path, source);
        assert!(entry
            .quarantined_path
            .file_name()
            .unwrap()
            .to_string_lossy()
            .contains("virus"));
        let moved = tokio::fs::read(&entry.quarantined_path).await.unwrap();
        assert_eq!(moved, b"payload");
    }

    #[tokio::test]
    async fn same_name_quarantined_twice_does_not_collide() {
        let dir = tempfile::tempdir().unwrap();
        let store = QuarantineStore::new(dir.path().join("quarantine"))
            .await
            .unwrap();

        let mut dests = Vec::new();
        for _ in 0..2 {
            let source = dir.path().join("dupe.bin");
            tokio::fs::write(&source, b"x").await.unwrap();
            let entry = store
                .isolate(&source, QuarantineReason::ScanError("timeout".into()))
                .await
                .unwrap();
            dests.push(entry.quarantined_path);
            // Timestamps carry millisecond precision.
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        }
        assert_ne!(dests[0], dests[1]);
        assert!(dests.iter().all(|d| d.exists()));
    }
}
