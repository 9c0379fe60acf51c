//! Evidence runner: content-addressed caching and replay lineage around the
//! tool registry.
//!
//! The cache key is `(tool_name, sha256(canonical params), hour bucket)`:
//! the same query this hour hits cache, the same query tomorrow does not.
//! Racing writers converge through the store's unique index; the loser
//! re-reads the winner. Replay always appends a new record pointing back via
//! `replays_evidence_id`, even when the underlying result came from cache.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde_json::Value;
use tracing::{debug, info};
use uuid::Uuid;

use crate::config::TriageConfig;
use crate::error::{Error, StorageError};
use crate::evidence::record::{EvidenceRecord, EvidenceStatus, RedactionLevel};
use crate::evidence::redaction::redact;
use crate::store::Store;
use crate::tools::ToolRegistry;
use crate::util::{canonical_json, sha256_hex, to_rfc3339};

/// Cached records stay live for one bucket span.
const EVIDENCE_TTL: Duration = Duration::from_secs(3600);

/// Diff between a replayed record and its predecessor.
#[derive(Debug, Clone)]
pub struct ReplayDiff {
    pub previous_checked_at: DateTime<Utc>,
    pub new_checked_at: DateTime<Utc>,
    pub hash_changed: bool,
    /// Present when the observed service/incident status flipped.
    pub status_change: Option<(Option<String>, Option<String>)>,
}

#[derive(Debug, Clone)]
pub struct ReplayOutcome {
    pub record: EvidenceRecord,
    pub result: Value,
    pub diff: ReplayDiff,
}

pub struct EvidenceRunner {
    store: Arc<dyn Store>,
    registry: Arc<ToolRegistry>,
    tool_timeout: Duration,
}

impl EvidenceRunner {
    pub fn new(store: Arc<dyn Store>, registry: Arc<ToolRegistry>, config: &TriageConfig) -> Self {
        Self {
            store,
            registry,
            tool_timeout: config.tool_timeout,
        }
    }

    /// Invoke a tool with caching and persistence. Returns the (possibly
    /// cached) record plus the parsed result.
    pub async fn run_with_evidence(
        &self,
        intake_id: &str,
        tool_name: &str,
        params: &Value,
        redaction_level: RedactionLevel,
        allow_cache: bool,
    ) -> Result<(EvidenceRecord, Value), Error> {
        self.run_inner(intake_id, tool_name, params, redaction_level, allow_cache, None)
            .await
    }

    async fn run_inner(
        &self,
        intake_id: &str,
        tool_name: &str,
        params: &Value,
        redaction_level: RedactionLevel,
        allow_cache: bool,
        replays_evidence_id: Option<String>,
    ) -> Result<(EvidenceRecord, Value), Error> {
        let params_json = canonical_json(params);
        let params_hash = sha256_hex(&params_json);
        let now = Utc::now();
        // Hour-coarse bucket when cacheable; a full timestamp otherwise so
        // forced replays never collide in the cache index.
        let time_bucket = if allow_cache {
            now.format("%Y-%m-%dT%H").to_string()
        } else {
            to_rfc3339(now)
        };

        if allow_cache {
            if let Some(mut cached) = self
                .store
                .find_cached_evidence(tool_name, &params_hash, &time_bucket)
                .await?
            {
                debug!(tool = %tool_name, evidence_id = %cached.evidence_id, "evidence cache hit");
                cached.cache_hit = true;
                let result: Value =
                    serde_json::from_str(&cached.result_json_internal).unwrap_or(Value::Null);
                return Ok((cached, result));
            }
        }

        let (result, status, error_message) = match self
            .registry
            .run_tool(tool_name, params, self.tool_timeout)
            .await
        {
            Ok(result) => (result, EvidenceStatus::Ok, None),
            Err(e) => (Value::Object(Default::default()), EvidenceStatus::Error, Some(e.to_string())),
        };

        let summary_internal = summary_for_tool(tool_name, &result);
        let summary_external = redact(&summary_internal);
        let result_json = canonical_json(&result);
        let result_hash = sha256_hex(&format!("{params_json}{result_json}"));

        let record = EvidenceRecord {
            evidence_id: Uuid::new_v4().to_string(),
            intake_id: intake_id.to_string(),
            tool_name: tool_name.to_string(),
            params_json,
            params_hash,
            time_bucket,
            result_json_internal: result_json,
            result_hash,
            summary_external,
            summary_internal,
            redaction_level,
            status,
            error_message,
            replays_evidence_id,
            cache_hit: false,
            ran_at: now,
            expires_at: now + chrono::Duration::from_std(EVIDENCE_TTL).unwrap_or_default(),
        };

        let stored = self.store.insert_evidence(&record).await?;
        if stored.cache_hit {
            // Lost the insert race; serve the winner's result.
            let result: Value =
                serde_json::from_str(&stored.result_json_internal).unwrap_or(Value::Null);
            return Ok((stored, result));
        }
        Ok((stored, result))
    }

    /// Re-invoke the tool behind an existing record. `force` bypasses the
    /// cache. The outcome is always a new record with `replays_evidence_id`
    /// set, preserving the lineage chain even on a cache hit.
    pub async fn replay(&self, evidence_id: &str, force: bool) -> Result<ReplayOutcome, Error> {
        let existing = self
            .store
            .get_evidence(evidence_id)
            .await?
            .ok_or_else(|| StorageError::NotFound {
                entity: "evidence record".to_string(),
                id: evidence_id.to_string(),
            })?;
        let params: Value =
            serde_json::from_str(&existing.params_json).unwrap_or(Value::Null);

        let (mut record, result) = self
            .run_inner(
                &existing.intake_id,
                &existing.tool_name,
                &params,
                existing.redaction_level,
                !force,
                Some(evidence_id.to_string()),
            )
            .await?;

        if record.cache_hit {
            // The cache handed back an existing record; append a fresh
            // lineage entry so the replay is visible in the chain.
            let now = Utc::now();
            let lineage = EvidenceRecord {
                evidence_id: Uuid::new_v4().to_string(),
                time_bucket: to_rfc3339(now),
                replays_evidence_id: Some(evidence_id.to_string()),
                cache_hit: false,
                ran_at: now,
                expires_at: now + chrono::Duration::from_std(EVIDENCE_TTL).unwrap_or_default(),
                ..record.clone()
            };
            record = self.store.insert_evidence(&lineage).await?;
        }

        let previous_status = extract_status(&existing.result_json_internal);
        let new_status = result
            .get("metadata")
            .and_then(|m| m.get("status"))
            .and_then(Value::as_str)
            .map(str::to_string);
        let diff = ReplayDiff {
            previous_checked_at: existing.ran_at,
            new_checked_at: record.ran_at,
            hash_changed: record.result_hash != existing.result_hash,
            status_change: if previous_status != new_status {
                Some((previous_status, new_status))
            } else {
                None
            },
        };
        info!(
            original = %evidence_id,
            replay = %record.evidence_id,
            hash_changed = diff.hash_changed,
            "evidence replayed"
        );
        Ok(ReplayOutcome {
            record,
            result,
            diff,
        })
    }
}

fn extract_status(result_json: &str) -> Option<String> {
    let value: Value = serde_json::from_str(result_json).ok()?;
    value
        .get("metadata")?
        .get("status")?
        .as_str()
        .map(str::to_string)
}

/// Customer-safe summary line for the tools that carry one; other tools
/// return an empty summary and rely on their events.
fn summary_for_tool(tool_name: &str, result: &Value) -> String {
    match tool_name {
        "log_evidence" => summarize_log_evidence(result),
        "service_status" => summarize_service_status(result),
        _ => String::new(),
    }
}

fn summarize_log_evidence(result: &Value) -> String {
    let query_type = result
        .get("metadata")
        .and_then(|m| m.get("query_type"))
        .and_then(Value::as_str)
        .unwrap_or("errors");
    let observed = result
        .get("observed_incident")
        .and_then(Value::as_bool)
        .unwrap_or(false);
    let decision = result
        .get("decision")
        .and_then(Value::as_str)
        .unwrap_or_default();
    let window = result
        .get("incident_window")
        .or_else(|| result.get("time_window"));
    let start = window
        .and_then(|w| w.get("start"))
        .and_then(Value::as_str)
        .unwrap_or_default();
    let end = window
        .and_then(|w| w.get("end"))
        .and_then(Value::as_str)
        .unwrap_or_default();
    let count = |field: &str| -> i64 {
        result
            .get("summary_counts")
            .and_then(|c| c.get(field))
            .and_then(Value::as_i64)
            .unwrap_or(0)
    };
    let phrase = match decision {
        "corroborated" => "observed error patterns",
        "inconclusive" => "saw some anomalies",
        "not_observed" => "did not observe anomalies",
        _ => "checked logs",
    };
    if observed {
        format!(
            "{phrase} between {start} and {end} (errors={}, timeouts={}, availability_gaps={})",
            count("errors"),
            count("timeouts"),
            count("availability_gaps")
        )
    } else {
        format!(
            "{phrase} in the checked window {start} to {end} (errors={}, timeouts={})",
            count("errors"),
            count("timeouts")
        )
    }
}

fn summarize_service_status(result: &Value) -> String {
    let metadata = result.get("metadata").cloned().unwrap_or_default();
    let service_id = metadata
        .get("service_id")
        .and_then(Value::as_str)
        .unwrap_or("unknown");
    let status = metadata
        .get("status")
        .and_then(Value::as_str)
        .unwrap_or("unknown");
    let mut parts = vec![format!("{service_id} status={status}")];
    if let Some(code) = metadata.get("http_status").and_then(Value::as_u64) {
        parts.push(format!("http={code}"));
    }
    if let Some(latency) = metadata.get("latency_ms").and_then(Value::as_u64) {
        parts.push(format!("latency_ms={latency}"));
    }
    if let Some(notes) = metadata.get("notes").and_then(Value::as_array) {
        if !notes.is_empty() {
            let joined: Vec<&str> = notes.iter().filter_map(Value::as_str).collect();
            parts.push(format!("notes={}", joined.join("/")));
        }
    }
    parts.join("; ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ToolError;
    use crate::store::LibSqlStore;
    use crate::tools::tool::EvidenceTool;
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingTool {
        runs: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl EvidenceTool for CountingTool {
        fn name(&self) -> &'static str {
            "counting"
        }

        fn params_schema(&self) -> Value {
            json!({"type": "object"})
        }

        async fn run(&self, _params: &Value) -> Result<Value, ToolError> {
            let n = self.runs.fetch_add(1, Ordering::SeqCst) + 1;
            Ok(json!({
                "source": "app_events",
                "time_window": {"start": "2025-05-01T00:00:00Z", "end": "2025-05-01T01:00:00Z"},
                "summary_counts": {"sent": 0, "bounced": 0, "deferred": 0, "delivered": 0},
                "metadata": {"status": "up", "run": n},
                "events": []
            }))
        }
    }

    struct FailingTool;

    #[async_trait]
    impl EvidenceTool for FailingTool {
        fn name(&self) -> &'static str {
            "failing"
        }

        fn params_schema(&self) -> Value {
            json!({"type": "object"})
        }

        async fn run(&self, _params: &Value) -> Result<Value, ToolError> {
            Err(ToolError::Execution {
                name: "failing".to_string(),
                reason: "upstream unavailable".to_string(),
            })
        }
    }

    async fn runner() -> (EvidenceRunner, Arc<AtomicUsize>) {
        let store = Arc::new(LibSqlStore::new_memory().await.unwrap());
        let runs = Arc::new(AtomicUsize::new(0));
        let mut registry = ToolRegistry::new().unwrap();
        registry
            .register(Arc::new(CountingTool { runs: runs.clone() }))
            .unwrap();
        registry.register(Arc::new(FailingTool)).unwrap();
        let runner = EvidenceRunner::new(
            store,
            Arc::new(registry),
            &TriageConfig::default(),
        );
        (runner, runs)
    }

    #[tokio::test]
    async fn identical_calls_converge_on_one_record() {
        let (runner, runs) = runner().await;
        let params = json!({"tenant": "acme"});
        let (first, _) = runner
            .run_with_evidence("case-1", "counting", &params, RedactionLevel::Internal, true)
            .await
            .unwrap();
        let (second, _) = runner
            .run_with_evidence("case-1", "counting", &params, RedactionLevel::Internal, true)
            .await
            .unwrap();
        assert_eq!(first.evidence_id, second.evidence_id);
        assert!(!first.cache_hit);
        assert!(second.cache_hit);
        assert_eq!(runs.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn different_params_are_different_cache_keys() {
        let (runner, runs) = runner().await;
        runner
            .run_with_evidence(
                "case-1",
                "counting",
                &json!({"tenant": "acme"}),
                RedactionLevel::Internal,
                true,
            )
            .await
            .unwrap();
        runner
            .run_with_evidence(
                "case-1",
                "counting",
                &json!({"tenant": "globex"}),
                RedactionLevel::Internal,
                true,
            )
            .await
            .unwrap();
        assert_eq!(runs.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn forced_replay_appends_a_new_record_with_lineage() {
        let (runner, runs) = runner().await;
        let params = json!({"tenant": "acme"});
        let (original, _) = runner
            .run_with_evidence("case-1", "counting", &params, RedactionLevel::Internal, true)
            .await
            .unwrap();

        let outcome = runner.replay(&original.evidence_id, true).await.unwrap();
        assert_ne!(outcome.record.evidence_id, original.evidence_id);
        assert_eq!(
            outcome.record.replays_evidence_id.as_deref(),
            Some(original.evidence_id.as_str())
        );
        assert_eq!(runs.load(Ordering::SeqCst), 2);
        // Run counter is embedded in the result, so the hash moves.
        assert!(outcome.diff.hash_changed);
    }

    #[tokio::test]
    async fn cached_replay_still_appends_a_lineage_record() {
        let (runner, runs) = runner().await;
        let params = json!({"tenant": "acme"});
        let (original, _) = runner
            .run_with_evidence("case-1", "counting", &params, RedactionLevel::Internal, true)
            .await
            .unwrap();

        let outcome = runner.replay(&original.evidence_id, false).await.unwrap();
        assert_ne!(outcome.record.evidence_id, original.evidence_id);
        assert_eq!(
            outcome.record.replays_evidence_id.as_deref(),
            Some(original.evidence_id.as_str())
        );
        // Tool not re-run: the result came from cache.
        assert_eq!(runs.load(Ordering::SeqCst), 1);
        assert!(!outcome.diff.hash_changed);
    }

    #[tokio::test]
    async fn tool_failure_is_recorded_as_an_error_record() {
        let (runner, _) = runner().await;
        let (record, _) = runner
            .run_with_evidence(
                "case-1",
                "failing",
                &json!({}),
                RedactionLevel::Internal,
                true,
            )
            .await
            .unwrap();
        assert_eq!(record.status, EvidenceStatus::Error);
        assert!(
            record
                .error_message
                .as_deref()
                .unwrap()
                .contains("upstream unavailable")
        );
    }

    #[tokio::test]
    async fn replay_of_missing_evidence_is_not_found() {
        let (runner, _) = runner().await;
        let err = runner.replay("missing-id", false).await.unwrap_err();
        assert!(matches!(
            err,
            Error::Storage(StorageError::NotFound { .. })
        ));
    }
}
