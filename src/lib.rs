//! Intake triage — durable queue, worker orchestration, evidence cache.

pub mod api;
pub mod config;
pub mod error;
pub mod evidence;
pub mod queue;
pub mod store;
pub mod tools;
pub mod triage;
pub mod util;
pub mod worker;
