//! Malware scan gateway and quarantine store.

pub mod clamav;
pub mod quarantine;

pub use clamav::{ScanGateway, Scanner};
pub use quarantine::QuarantineStore;
