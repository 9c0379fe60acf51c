//! Error types for the triage core.

use std::time::Duration;

/// Top-level error type for the service.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Tool error: {0}")]
    Tool(#[from] ToolError),

    #[error("Classification error: {0}")]
    Classify(#[from] ClassifyError),

    #[error("Report error: {0}")]
    Report(#[from] ReportError),
}

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(String),

    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    #[error("Failed to parse configuration: {0}")]
    ParseError(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Storage-layer faults. Propagated to callers unmodified, never retried
/// inside the store.
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("Connection error: {0}")]
    Pool(String),

    #[error("Query failed: {0}")]
    Query(String),

    #[error("Entity not found: {entity} with id {id}")]
    NotFound { entity: String, id: String },

    #[error("Constraint violation: {0}")]
    Constraint(String),

    #[error("Migration failed: {0}")]
    Migration(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

/// Tool registry and execution errors.
///
/// The worker matches on these per tool: a single tool's failure degrades
/// the evidence set for one item, it never fails the item.
#[derive(Debug, thiserror::Error)]
pub enum ToolError {
    #[error("Tool not allowlisted: {name}")]
    UnknownTool { name: String },

    #[error("Schema violation in {stage} for tool {name}: {detail}")]
    SchemaViolation {
        name: String,
        /// "params" (caller error) or "result" (registry-level bug).
        stage: &'static str,
        detail: String,
    },

    #[error("Tool {name} execution failed: {reason}")]
    Execution { name: String, reason: String },

    #[error("Tool {name} timed out after {timeout:?}")]
    Timeout { name: String, timeout: Duration },
}

/// Classifier collaborator errors.
#[derive(Debug, thiserror::Error)]
pub enum ClassifyError {
    /// The classifier returned a payload that does not conform to the
    /// classification schema. Non-retryable: the same input fails the same
    /// way, so the worker dead-letters the item immediately.
    #[error("Classification payload failed schema validation: {0}")]
    SchemaInvalid(String),

    #[error("Classifier request failed: {0}")]
    RequestFailed(String),

    #[error("Classifier timed out after {0:?}")]
    Timeout(Duration),
}

impl ClassifyError {
    /// Whether retrying this failure against the same input can succeed.
    pub fn is_retryable(&self) -> bool {
        !matches!(self, ClassifyError::SchemaInvalid(_))
    }
}

/// Report collaborator errors.
#[derive(Debug, thiserror::Error)]
pub enum ReportError {
    #[error("Report generation failed: {0}")]
    Failed(String),
}

/// Result type alias for the service.
pub type Result<T> = std::result::Result<T, Error>;
