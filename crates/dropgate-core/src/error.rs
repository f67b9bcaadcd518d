//! Error taxonomy for the intake pipeline.
//!
//! Errors carry their retry semantics: [`IntakeError::is_transient`] is the
//! single source of truth the coordinator's retry loop consults. Policy
//! violations and scan failures are never transient; they route straight to
//! quarantine.

use std::io;

use crate::models::QuarantineReason;

#[derive(Debug, thiserror::Error)]
pub enum IntakeError {
    #[error("I/O error at {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: io::Error,
    },

    #[error("transient failure: {0}")]
    Transient(String),

    #[error("archive entry escapes extraction root: {entry}")]
    PathTraversal { entry: String },

    #[error("archive has {count} entries, limit is {max}")]
    TooManyEntries { count: usize, max: usize },

    #[error("archive expands to {total} bytes, limit is {max}")]
    ExtractionTooLarge { total: u64, max: u64 },

    #[error("entry {entry} has compression ratio {ratio}, limit is {max}")]
    SuspiciousCompressionRatio {
        entry: String,
        ratio: u64,
        max: u64,
    },

    #[error("archive nesting exceeds maximum depth {max}")]
    NestingTooDeep { max: u32 },

    #[error("corrupt archive: {0}")]
    CorruptArchive(String),

    #[error("scan failed: {0}")]
    ScanFailed(String),

    #[error("file infected: {0}")]
    Infected(String),

    #[error("internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

impl IntakeError {
    /// Whether the retry loop may attempt this operation again.
    ///
    /// I/O errors are transient only when consistent with a race against a
    /// concurrent writer (permission denied, interrupted, busy); everything
    /// else is terminal for this intake.
    pub fn is_transient(&self) -> bool {
        match self {
            IntakeError::Transient(_) => true,
            IntakeError::Io { source, .. } => is_transient_io(source),
            _ => false,
        }
    }

    /// The quarantine reason this error maps to, if it is a quarantining
    /// error rather than a retryable or fatal one.
    pub fn quarantine_reason(&self) -> Option<QuarantineReason> {
        match self {
            IntakeError::PathTraversal { .. }
            | IntakeError::TooManyEntries { .. }
            | IntakeError::ExtractionTooLarge { .. }
            | IntakeError::SuspiciousCompressionRatio { .. }
            | IntakeError::NestingTooDeep { .. } => {
                Some(QuarantineReason::PolicyViolation(self.to_string()))
            }
            IntakeError::CorruptArchive(msg) => Some(QuarantineReason::Corrupt(msg.clone())),
            IntakeError::ScanFailed(msg) => Some(QuarantineReason::ScanError(msg.clone())),
            IntakeError::Infected(name) => Some(QuarantineReason::Virus(name.clone())),
            _ => None,
        }
    }

    pub fn io(path: &std::path::Path, source: io::Error) -> Self {
        IntakeError::Io {
            path: path.display().to_string(),
            source,
        }
    }
}

fn is_transient_io(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::PermissionDenied
            | io::ErrorKind::Interrupted
            | io::ErrorKind::WouldBlock
            | io::ErrorKind::TimedOut
    )
}
