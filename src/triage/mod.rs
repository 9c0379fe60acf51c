//! Classification and report collaborators.
//!
//! The worker treats both as opaque traits; the shipped implementations are
//! an HTTP classifier and a deterministic bundle report generator.

pub mod classifier;
pub mod report;

pub use classifier::{
    CLASSIFICATION_SCHEMA, Classification, Classifier, DraftReply, HttpClassifier, Scope,
    SuggestedTool, TimeWindowHint,
};
pub use report::{BundleReportGenerator, ReportGenerator};
