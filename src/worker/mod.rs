//! Worker orchestration: claim, classify, gather evidence, report.

pub mod time_window;
pub mod worker;

pub use time_window::{QueryWindow, derive_query_window};
pub use worker::TriageWorker;
