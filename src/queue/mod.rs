//! Durable queue data model.

pub mod model;

pub use model::*;
