//! Evidence tools: trait, allowlisted registry, built-in implementations.

pub mod builtin;
pub mod registry;
pub mod tool;

pub use registry::ToolRegistry;
pub use tool::{EVIDENCE_BUNDLE_SCHEMA, EvidenceTool};
