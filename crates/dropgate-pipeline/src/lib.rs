//! Intake pipeline: event coordination, deduplication, classification, and
//! placement into the organized tree.

pub mod classifier;
pub mod coordinator;
pub mod dedup;
pub mod placement;

pub use classifier::Classifier;
pub use coordinator::Coordinator;
pub use dedup::{DedupIndex, Resolution};
