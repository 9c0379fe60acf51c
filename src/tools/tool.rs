//! Evidence tool trait and the shared result schema.

use std::sync::LazyLock;

use async_trait::async_trait;
use serde_json::{Value, json};

use crate::error::ToolError;

/// One evidence-gathering capability.
///
/// Tools are pure with respect to the queue: they read external sources and
/// return an evidence bundle, never touching queue state. Every result must
/// conform to [`EVIDENCE_BUNDLE_SCHEMA`]; the registry enforces this.
#[async_trait]
pub trait EvidenceTool: Send + Sync {
    fn name(&self) -> &'static str;

    /// JSON schema the caller's params are validated against before `run`.
    fn params_schema(&self) -> Value;

    async fn run(&self, params: &Value) -> Result<Value, ToolError>;
}

/// Result schema shared by every tool regardless of domain.
///
/// Tools may add fields (log evidence adds `observed_incident`,
/// `decision`, ...) but the core envelope is fixed so that downstream report
/// generation can treat bundles uniformly.
pub static EVIDENCE_BUNDLE_SCHEMA: LazyLock<Value> = LazyLock::new(|| {
    json!({
        "type": "object",
        "required": ["source", "time_window", "summary_counts", "events"],
        "properties": {
            "source": {"type": "string"},
            "time_window": {
                "type": "object",
                "required": ["start", "end"],
                "properties": {
                    "start": {"type": "string"},
                    "end": {"type": "string"}
                }
            },
            "tenant": {"type": ["string", "null"]},
            "summary_counts": {
                "type": "object",
                "required": ["sent", "bounced", "deferred", "delivered"],
                "properties": {
                    "sent": {"type": "integer"},
                    "bounced": {"type": "integer"},
                    "deferred": {"type": "integer"},
                    "delivered": {"type": "integer"}
                }
            },
            "events": {
                "type": "array",
                "items": {
                    "type": "object",
                    "required": ["ts", "type", "id", "detail"],
                    "properties": {
                        "ts": {"type": "string"},
                        "type": {"type": "string"},
                        "id": {"type": "string"},
                        "message_id": {"type": ["string", "null"]},
                        "detail": {"type": "string"}
                    }
                }
            },
            "metadata": {"type": "object"}
        }
    })
});
