//! Queue item types and the typed update allowlist.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::util::sha256_hex;

/// Lifecycle state of a queue item.
///
/// `Triaged` and `DeadLetter` are terminal. A row moves `Queued ->
/// Processing` only through an atomic claim.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueueStatus {
    Queued,
    Processing,
    Triaged,
    DeadLetter,
}

impl QueueStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            QueueStatus::Queued => "queued",
            QueueStatus::Processing => "processing",
            QueueStatus::Triaged => "triaged",
            QueueStatus::DeadLetter => "dead_letter",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "processing" => QueueStatus::Processing,
            "triaged" => QueueStatus::Triaged,
            "dead_letter" => QueueStatus::DeadLetter,
            _ => QueueStatus::Queued,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, QueueStatus::Triaged | QueueStatus::DeadLetter)
    }
}

/// One inbound support message awaiting (or past) triage.
#[derive(Debug, Clone)]
pub struct QueueItem {
    pub id: i64,
    pub case_id: String,
    pub idempotency_key: Option<String>,
    pub retry_count: u32,
    pub available_at: DateTime<Utc>,
    pub status: QueueStatus,
    pub conversation_id: Option<String>,
    pub tenant: String,
    pub payload: String,
    pub redacted_payload: Option<String>,
    pub classification_json: Option<String>,
    pub evidence_sources_run: Vec<String>,
    pub final_report_json: Option<String>,
    pub response_metadata: Option<String>,
    pub processor_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

/// Payload accepted by `enqueue`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EnqueueRequest {
    /// Raw message text.
    pub text: String,
    /// Tenant or end-user handle the message arrived from.
    #[serde(default)]
    pub tenant: String,
    #[serde(default)]
    pub case_id: Option<String>,
    #[serde(default)]
    pub conversation_id: Option<String>,
    /// Caller-supplied key; derived from (tenant, text, day bucket) when
    /// absent.
    #[serde(default)]
    pub idempotency_key: Option<String>,
}

/// Derive the idempotency key for a message: tenant + first 200 chars of
/// the trimmed text + UTC day bucket, SHA-256 hashed. Equivalent input
/// re-submitted on the same day maps to the same work item.
pub fn compute_idempotency_key(tenant: &str, text: &str, created_at: DateTime<Utc>) -> String {
    let trimmed = text.trim();
    let head: String = trimmed.chars().take(200).collect();
    let bucket = created_at.format("%Y-%m-%d");
    sha256_hex(&format!("{tenant}|{head}|{bucket}"))
}

/// Fields a worker may merge into a row alongside a status change.
///
/// This struct *is* the update allowlist: there is no way to widen the
/// schema through `update_status`.
#[derive(Debug, Clone, Default)]
pub struct QueueUpdate {
    pub idempotency_key: Option<String>,
    pub retry_count: Option<u32>,
    pub available_at: Option<DateTime<Utc>>,
    pub conversation_id: Option<String>,
    pub redacted_payload: Option<String>,
    pub classification_json: Option<String>,
    pub evidence_sources_run: Option<Vec<String>>,
    pub final_report_json: Option<String>,
    pub response_metadata: Option<String>,
    pub processor_id: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn idempotency_key_is_stable_within_a_day() {
        let at = crate::util::parse_datetime("2025-05-01T10:00:00Z");
        let later = crate::util::parse_datetime("2025-05-01T23:59:59Z");
        let a = compute_idempotency_key("tenant-a", "hello", at);
        let b = compute_idempotency_key("tenant-a", "  hello  ", later);
        assert_eq!(a, b);
    }

    #[test]
    fn idempotency_key_varies_by_tenant_text_and_day() {
        let at = crate::util::parse_datetime("2025-05-01T10:00:00Z");
        let next_day = crate::util::parse_datetime("2025-05-02T10:00:00Z");
        let base = compute_idempotency_key("tenant-a", "hello", at);
        assert_ne!(base, compute_idempotency_key("tenant-b", "hello", at));
        assert_ne!(base, compute_idempotency_key("tenant-a", "goodbye", at));
        assert_ne!(base, compute_idempotency_key("tenant-a", "hello", next_day));
    }

    #[test]
    fn status_round_trip() {
        for status in [
            QueueStatus::Queued,
            QueueStatus::Processing,
            QueueStatus::Triaged,
            QueueStatus::DeadLetter,
        ] {
            assert_eq!(QueueStatus::parse(status.as_str()), status);
        }
        assert!(QueueStatus::Triaged.is_terminal());
        assert!(QueueStatus::DeadLetter.is_terminal());
        assert!(!QueueStatus::Processing.is_terminal());
    }
}
