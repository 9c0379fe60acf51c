//! HTTP surface: enqueue, evidence replay, export, health.

pub mod routes;

pub use routes::{ApiState, api_routes};
