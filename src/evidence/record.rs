//! Evidence record model.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Declared sensitivity tier of an evidence record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RedactionLevel {
    /// Customer-safe; the external summary may be shown outside.
    External,
    /// Operator-only; raw params/results stay internal.
    Internal,
}

impl RedactionLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            RedactionLevel::External => "external",
            RedactionLevel::Internal => "internal",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "external" => RedactionLevel::External,
            _ => RedactionLevel::Internal,
        }
    }
}

/// Outcome of one tool invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EvidenceStatus {
    Ok,
    Error,
}

impl EvidenceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            EvidenceStatus::Ok => "ok",
            EvidenceStatus::Error => "error",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "error" => EvidenceStatus::Error,
            _ => EvidenceStatus::Ok,
        }
    }
}

/// One persisted tool invocation.
///
/// Records are append-only: a replay creates a new record pointing back via
/// `replays_evidence_id`, never mutating the original.
#[derive(Debug, Clone)]
pub struct EvidenceRecord {
    pub evidence_id: String,
    pub intake_id: String,
    pub tool_name: String,
    /// Canonical JSON of the normalized parameters.
    pub params_json: String,
    /// SHA-256 of `params_json`.
    pub params_hash: String,
    /// Coarse (hour) window used for cache bucketing; full timestamp for
    /// records excluded from the cache (forced replays).
    pub time_bucket: String,
    /// Unredacted tool result, operator-only.
    pub result_json_internal: String,
    /// SHA-256 over canonical params + result.
    pub result_hash: String,
    /// Redacted, customer-safe summary.
    pub summary_external: String,
    /// Unredacted summary, operator-only.
    pub summary_internal: String,
    pub redaction_level: RedactionLevel,
    pub status: EvidenceStatus,
    pub error_message: Option<String>,
    /// Back-reference forming the replay lineage chain.
    pub replays_evidence_id: Option<String>,
    /// Derived at lookup time, not a stored column.
    pub cache_hit: bool,
    pub ran_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}
