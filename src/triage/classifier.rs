//! Classification payload and the classifier collaborator contract.

use std::sync::LazyLock;
use std::time::Duration;

use async_trait::async_trait;
use jsonschema::JSONSchema;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tracing::debug;

use crate::error::ClassifyError;

/// Time hints the classifier extracted from the message, possibly partial.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TimeWindowHint {
    #[serde(default)]
    pub start: Option<String>,
    #[serde(default)]
    pub end: Option<String>,
    #[serde(default)]
    pub confidence: Option<f64>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Scope {
    #[serde(default)]
    pub recipient_domains: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SuggestedTool {
    pub tool_name: String,
    #[serde(default)]
    pub params: Value,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DraftReply {
    #[serde(default)]
    pub subject: String,
    #[serde(default)]
    pub body: String,
}

/// Validated classifier output.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Classification {
    pub case_type: String,
    #[serde(default)]
    pub severity: Option<String>,
    #[serde(default)]
    pub time_window: Option<TimeWindowHint>,
    #[serde(default)]
    pub scope: Scope,
    #[serde(default)]
    pub suggested_tools: Vec<SuggestedTool>,
    #[serde(default)]
    pub draft_reply: Option<DraftReply>,
    #[serde(default)]
    pub symptoms: Vec<String>,
}

/// Schema the classifier payload must satisfy. A violation is the
/// non-retryable failure class: the same input fails the same way.
pub static CLASSIFICATION_SCHEMA: LazyLock<Value> = LazyLock::new(|| {
    json!({
        "type": "object",
        "required": ["case_type"],
        "properties": {
            "case_type": {"type": "string", "minLength": 1},
            "severity": {"type": ["string", "null"]},
            "time_window": {
                "type": ["object", "null"],
                "properties": {
                    "start": {"type": ["string", "null"]},
                    "end": {"type": ["string", "null"]},
                    "confidence": {"type": ["number", "null"]}
                }
            },
            "scope": {
                "type": "object",
                "properties": {
                    "recipient_domains": {"type": "array", "items": {"type": "string"}}
                }
            },
            "suggested_tools": {
                "type": "array",
                "items": {
                    "type": "object",
                    "required": ["tool_name"],
                    "properties": {
                        "tool_name": {"type": "string"},
                        "params": {"type": "object"}
                    }
                }
            },
            "draft_reply": {
                "type": ["object", "null"],
                "properties": {
                    "subject": {"type": "string"},
                    "body": {"type": "string"}
                }
            },
            "symptoms": {"type": "array", "items": {"type": "string"}}
        }
    })
});

/// Validate a raw payload and deserialize it into a [`Classification`].
pub fn parse_classification(payload: &Value) -> Result<Classification, ClassifyError> {
    static COMPILED: LazyLock<Option<JSONSchema>> =
        LazyLock::new(|| JSONSchema::compile(&CLASSIFICATION_SCHEMA).ok());
    let schema = COMPILED
        .as_ref()
        .ok_or_else(|| ClassifyError::SchemaInvalid("classification schema failed to compile".to_string()))?;
    if let Err(errors) = schema.validate(payload) {
        let detail = errors
            .map(|e| e.to_string())
            .collect::<Vec<_>>()
            .join("; ");
        return Err(ClassifyError::SchemaInvalid(detail));
    }
    serde_json::from_value(payload.clone()).map_err(|e| ClassifyError::SchemaInvalid(e.to_string()))
}

/// Classifier collaborator: produce a classification from redacted text and
/// tenant metadata.
#[async_trait]
pub trait Classifier: Send + Sync {
    async fn classify(
        &self,
        text: &str,
        metadata: &Value,
    ) -> Result<Classification, ClassifyError>;
}

/// HTTP-backed classifier: POSTs `{text, metadata}` to a configured endpoint
/// and validates the response against [`CLASSIFICATION_SCHEMA`].
pub struct HttpClassifier {
    client: reqwest::Client,
    endpoint: String,
    timeout: Duration,
}

impl HttpClassifier {
    pub fn new(endpoint: String, timeout: Duration) -> Result<Self, ClassifyError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| ClassifyError::RequestFailed(e.to_string()))?;
        Ok(Self {
            client,
            endpoint,
            timeout,
        })
    }
}

#[async_trait]
impl Classifier for HttpClassifier {
    async fn classify(
        &self,
        text: &str,
        metadata: &Value,
    ) -> Result<Classification, ClassifyError> {
        debug!(endpoint = %self.endpoint, "requesting classification");
        let response = self
            .client
            .post(&self.endpoint)
            .json(&json!({"text": text, "metadata": metadata}))
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    ClassifyError::Timeout(self.timeout)
                } else {
                    ClassifyError::RequestFailed(e.to_string())
                }
            })?;
        if !response.status().is_success() {
            return Err(ClassifyError::RequestFailed(format!(
                "classifier returned {}",
                response.status()
            )));
        }
        let payload: Value = response
            .json()
            .await
            .map_err(|e| ClassifyError::RequestFailed(e.to_string()))?;
        parse_classification(&payload)
    }
}
