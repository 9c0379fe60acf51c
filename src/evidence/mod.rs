//! Evidence gathering: content-addressed cache, replay lineage, redaction.

pub mod record;
pub mod redaction;
pub mod runner;

pub use record::*;
pub use runner::{EvidenceRunner, ReplayDiff, ReplayOutcome};
