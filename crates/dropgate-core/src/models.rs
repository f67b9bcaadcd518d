//! Domain models for the intake pipeline.
//!
//! An *intake* is one file's journey from a raw filesystem notification to a
//! terminal state: placed in the organized tree, quarantined, removed as a
//! duplicate, or discarded because the source vanished. The types here are
//! shared between the scan gateway, the archive layer, and the coordinator.

use std::fmt;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Kind of raw filesystem notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    Created,
    Modified,
}

/// A raw filesystem change notification, as delivered by the watcher.
///
/// Events are ephemeral: the coordinator coalesces duplicates for the same
/// path and drops events whose source no longer exists.
#[derive(Debug, Clone)]
pub struct FileEvent {
    pub path: PathBuf,
    pub observed_at: DateTime<Utc>,
    pub kind: EventKind,
}

impl FileEvent {
    pub fn new(path: impl Into<PathBuf>, kind: EventKind) -> Self {
        Self {
            path: path.into(),
            observed_at: Utc::now(),
            kind,
        }
    }
}

/// SHA-256 content digest used as the deduplication key.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ContentDigest(pub [u8; 32]);

impl ContentDigest {
    /// First 8 hex characters, used as a collision-avoiding filename prefix.
    pub fn short_prefix(&self) -> String {
        hex::encode(&self.0[..4])
    }

    /// Parse from the 64-char hex rendering produced by `Display`.
    pub fn from_hex(s: &str) -> Option<Self> {
        let bytes = hex::decode(s).ok()?;
        let arr: [u8; 32] = bytes.try_into().ok()?;
        Some(ContentDigest(arr))
    }
}

impl fmt::Display for ContentDigest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

impl fmt::Debug for ContentDigest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ContentDigest({})", self)
    }
}

/// Verdict from the malware scan gateway.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScanVerdict {
    Pending,
    Clean,
    Infected(String),
    ScanError(String),
}

/// Why a file was moved to quarantine. The reason codes are deliberately
/// distinct because the operator's recovery action differs for each.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QuarantineReason {
    /// Scanner reported an infection (virus name attached).
    Virus(String),
    /// The file could not be scanned; fail closed.
    ScanError(String),
    /// Archive violated an extraction policy (traversal, bomb, depth, ...).
    PolicyViolation(String),
    /// Archive or file is corrupt but not known to be malicious.
    Corrupt(String),
}

impl QuarantineReason {
    pub fn label(&self) -> &'static str {
        match self {
            QuarantineReason::Virus(_) => "virus",
            QuarantineReason::ScanError(_) => "scan_error",
            QuarantineReason::PolicyViolation(_) => "policy_violation",
            QuarantineReason::Corrupt(_) => "corrupt",
        }
    }
}

impl fmt::Display for QuarantineReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            QuarantineReason::Virus(name) => write!(f, "virus: {}", name),
            QuarantineReason::ScanError(msg) => write!(f, "scan error: {}", msg),
            QuarantineReason::PolicyViolation(msg) => write!(f, "policy violation: {}", msg),
            QuarantineReason::Corrupt(msg) => write!(f, "corrupt input: {}", msg),
        }
    }
}

/// Record of a file moved into the quarantine area. Write-once.
#[derive(Debug, Clone)]
pub struct QuarantineEntry {
    pub original_path: PathBuf,
    pub quarantined_path: PathBuf,
    pub reason: QuarantineReason,
    pub moved_at: DateTime<Utc>,
}

/// Routing category decided by the classifier.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Category {
    Photos,
    ContentGroup(String),
    SenderDate { sender: String, date: String },
}

/// Final routing decision for a clean file. Computed once per intake and
/// never mutated afterwards.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Destination {
    pub category: Category,
    pub absolute_path: PathBuf,
}

/// One entry of an inspected archive.
#[derive(Debug, Clone)]
pub struct ManifestEntry {
    pub relative_path: PathBuf,
    /// Zero when the container does not track per-entry compressed sizes
    /// (plain or gzipped tar).
    pub compressed_size: u64,
    pub uncompressed_size: u64,
}

/// Result of inspecting an archive without extracting it.
#[derive(Debug, Clone)]
pub struct ArchiveManifest {
    pub entry_count: usize,
    pub total_uncompressed: u64,
    /// Largest per-entry uncompressed/compressed ratio observed, where known.
    pub max_entry_ratio: u64,
    pub entries: Vec<ManifestEntry>,
}

/// State carried through one pipeline run. Owned exclusively by the
/// coordinator for the duration of that run.
#[derive(Debug)]
pub struct IntakeRecord {
    pub source_path: PathBuf,
    pub size_bytes: u64,
    pub content_digest: Option<ContentDigest>,
    pub verdict: ScanVerdict,
    /// Back-reference to the archive this file was extracted from, if any.
    pub extraction_origin: Option<PathBuf>,
    pub attempt_count: u32,
}

impl IntakeRecord {
    pub fn new(source_path: impl Into<PathBuf>, size_bytes: u64) -> Self {
        Self {
            source_path: source_path.into(),
            size_bytes,
            content_digest: None,
            verdict: ScanVerdict::Pending,
            extraction_origin: None,
            attempt_count: 0,
        }
    }

    pub fn extracted_from(mut self, origin: impl Into<PathBuf>) -> Self {
        self.extraction_origin = Some(origin.into());
        self
    }
}

/// The single terminal state every intake reaches.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TerminalOutcome {
    /// Placed into the organized tree at this path.
    Placed(PathBuf),
    /// Content already present; the candidate was deleted.
    DuplicateRemoved { existing: PathBuf },
    /// Moved to quarantine.
    Quarantined(QuarantineReason),
    /// Archive fully expanded; members were dispatched as their own intakes.
    Expanded { member_count: usize },
    /// Source vanished before or during processing. Expected under racing
    /// notifications, not an error.
    DiscardedStale,
    /// The path was already terminally processed; this event was a no-op.
    AlreadyProcessed,
    /// Temp/partial-download extension, skipped by policy.
    Ignored,
    /// Non-policy failure after retries were exhausted.
    Failed(String),
}

impl TerminalOutcome {
    pub fn label(&self) -> &'static str {
        match self {
            TerminalOutcome::Placed(_) => "placed",
            TerminalOutcome::DuplicateRemoved { .. } => "duplicate_removed",
            TerminalOutcome::Quarantined(_) => "quarantined",
            TerminalOutcome::Expanded { .. } => "expanded",
            TerminalOutcome::DiscardedStale => "discarded_stale",
            TerminalOutcome::AlreadyProcessed => "already_processed",
            TerminalOutcome::Ignored => "ignored",
            TerminalOutcome::Failed(_) => "failed",
        }
    }
}

/// Lowercased extension of a path, if any.
pub fn extension_of(path: &Path) -> Option<String> {
    path.extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_lowercase())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn digest_renders_as_hex() {
        let d = ContentDigest([0xab; 32]);
        assert_eq!(d.to_string().len(), 64);
        assert!(d.to_string().starts_with("abab"));
        assert_eq!(d.short_prefix(), "abababab");
    }

    #[test]
    fn quarantine_reason_labels_are_distinct() {
        let reasons = [
            QuarantineReason::Virus("x".into()),
            QuarantineReason::ScanError("x".into()),
            QuarantineReason::PolicyViolation("x".into()),
            QuarantineReason::Corrupt("x".into()),
        ];
        let labels: std::collections::HashSet<_> =
            reasons.iter().map(|r| r.label()).collect();
        assert_eq!(labels.len(), reasons.len());
    }

    #[test]
    fn extension_is_lowercased() {
        assert_eq!(extension_of(Path::new("a/b/PHOTO.JPG")), Some("jpg".into()));
        assert_eq!(extension_of(Path::new("noext")), None);
    }
}
