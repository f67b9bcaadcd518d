//! Dropgate core library
//!
//! Shared domain models, error taxonomy, configuration, and content hashing
//! used by every Dropgate component.

pub mod config;
pub mod error;
pub mod hashing;
pub mod models;

pub use config::{ExtractionLimits, IntakeConfig, KeywordGroup, ScanBackend};
pub use error::IntakeError;
pub use hashing::digest_file;
pub use models::{
    ArchiveManifest, Category, ContentDigest, Destination, EventKind, FileEvent, IntakeRecord,
    ManifestEntry, QuarantineEntry, QuarantineReason, ScanVerdict, TerminalOutcome,
};
