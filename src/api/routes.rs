//! REST endpoints for intake submission, evidence replay, and export.
//!
//! Every replay attempt is written to the audit log before the response is
//! sent, including the blocked ones; the rate limiter counts those same
//! audit rows, so blocked attempts burn quota too.

use std::sync::Arc;
use std::time::Duration;

use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use serde_json::{Value, json};
use tower_http::cors::CorsLayer;
use tracing::{info, warn};

use crate::config::TriageConfig;
use crate::error::{Error, StorageError};
use crate::evidence::{EvidenceRecord, EvidenceRunner, RedactionLevel, ReplayDiff};
use crate::queue::EnqueueRequest;
use crate::store::{ReplayAttempt, Store};
use crate::util::{sha256_hex, to_rfc3339};

const EXPORT_LIMIT: usize = 50;
const REPLAY_KEY_WINDOW: Duration = Duration::from_secs(60);
const REPLAY_EVIDENCE_WINDOW: Duration = Duration::from_secs(3600);

/// Shared state for the API routes.
#[derive(Clone)]
pub struct ApiState {
    pub store: Arc<dyn Store>,
    pub runner: Arc<EvidenceRunner>,
    pub config: Arc<TriageConfig>,
    /// Key accepted on every endpoint.
    pub api_key: SecretString,
    /// Key additionally allowed to force replays. Unset disables forcing.
    pub admin_key: Option<SecretString>,
}

enum Caller {
    Standard { key_hash: String },
    Elevated { key_hash: String },
}

impl Caller {
    fn key_hash(&self) -> &str {
        match self {
            Caller::Standard { key_hash } | Caller::Elevated { key_hash } => key_hash,
        }
    }
}

impl ApiState {
    fn authenticate(&self, headers: &HeaderMap) -> Option<Caller> {
        let presented = headers.get("x-api-key")?.to_str().ok()?;
        let key_hash = sha256_hex(presented);
        if self
            .admin_key
            .as_ref()
            .is_some_and(|k| k.expose_secret() == presented)
        {
            return Some(Caller::Elevated { key_hash });
        }
        if self.api_key.expose_secret() == presented {
            return Some(Caller::Standard { key_hash });
        }
        None
    }
}

fn unauthorized() -> (StatusCode, Json<Value>) {
    (
        StatusCode::UNAUTHORIZED,
        Json(json!({"error": "missing or invalid api key"})),
    )
}

fn internal_error(e: impl std::fmt::Display) -> (StatusCode, Json<Value>) {
    warn!(error = %e, "request failed");
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(json!({"error": e.to_string()})),
    )
}

/// POST /enqueue
///
/// Idempotent insert: resubmitting the same message on the same day returns
/// the existing item with `created: false`.
async fn enqueue(
    State(state): State<ApiState>,
    headers: HeaderMap,
    Json(request): Json<EnqueueRequest>,
) -> impl IntoResponse {
    if state.authenticate(&headers).is_none() {
        return unauthorized().into_response();
    }
    if request.text.trim().is_empty() {
        return (
            StatusCode::UNPROCESSABLE_ENTITY,
            Json(json!({"error": "text must not be empty"})),
        )
            .into_response();
    }
    match state.store.enqueue(&request).await {
        Ok((id, created)) => {
            info!(id, created, tenant = %request.tenant, "enqueue accepted");
            let code = if created {
                StatusCode::CREATED
            } else {
                StatusCode::OK
            };
            (code, Json(json!({"id": id, "created": created}))).into_response()
        }
        Err(e) => internal_error(e).into_response(),
    }
}

#[derive(Deserialize)]
struct ReplayQuery {
    #[serde(default)]
    force: bool,
}

fn diff_json(diff: &ReplayDiff) -> Value {
    json!({
        "previous_checked_at": to_rfc3339(diff.previous_checked_at),
        "new_checked_at": to_rfc3339(diff.new_checked_at),
        "hash_changed": diff.hash_changed,
        "status_change": diff
            .status_change
            .as_ref()
            .map(|(from, to)| json!({"from": from, "to": to})),
    })
}

/// POST /evidence/{id}/replay?force=
///
/// Rate limits are enforced from the audit log itself: per key per minute
/// and per evidence id per hour. `force=true` bypasses the cache and
/// requires the elevated key.
async fn replay_evidence(
    State(state): State<ApiState>,
    headers: HeaderMap,
    Path(evidence_id): Path<String>,
    Query(query): Query<ReplayQuery>,
) -> impl IntoResponse {
    let Some(caller) = state.authenticate(&headers) else {
        return unauthorized().into_response();
    };
    let key_hash = caller.key_hash().to_string();
    let remote_ip = headers
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .map(|v| v.split(',').next().unwrap_or(v).trim().to_string());
    let user_agent = headers
        .get("user-agent")
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);

    let audit = |result: &str, reason: &str, new_evidence_id: Option<String>| ReplayAttempt {
        api_key_hash: key_hash.clone(),
        evidence_id: evidence_id.clone(),
        new_evidence_id,
        result: result.to_string(),
        reason: reason.to_string(),
        remote_ip: remote_ip.clone(),
        user_agent: user_agent.clone(),
    };

    if query.force && !matches!(caller, Caller::Elevated { .. }) {
        if let Err(e) = state
            .store
            .log_replay_attempt(&audit("forbidden", "force requires elevated key", None))
            .await
        {
            return internal_error(e).into_response();
        }
        return (
            StatusCode::FORBIDDEN,
            Json(json!({"error": "force requires elevated key"})),
        )
            .into_response();
    }

    let by_key = match state
        .store
        .count_replays_for_key(&key_hash, REPLAY_KEY_WINDOW)
        .await
    {
        Ok(n) => n,
        Err(e) => return internal_error(e).into_response(),
    };
    if by_key >= state.config.replay_per_key_per_minute {
        warn!(evidence_id = %evidence_id, attempts = by_key, "replay rate limited by key");
        if let Err(e) = state
            .store
            .log_replay_attempt(&audit("rate_limited", "per-key rate limit exceeded", None))
            .await
        {
            return internal_error(e).into_response();
        }
        return (
            StatusCode::TOO_MANY_REQUESTS,
            Json(json!({"error": "rate_limited"})),
        )
            .into_response();
    }

    let by_evidence = match state
        .store
        .count_replays_for_evidence(&evidence_id, REPLAY_EVIDENCE_WINDOW)
        .await
    {
        Ok(n) => n,
        Err(e) => return internal_error(e).into_response(),
    };
    if by_evidence >= state.config.replay_per_evidence_per_hour {
        warn!(evidence_id = %evidence_id, attempts = by_evidence, "replay capped for evidence id");
        if let Err(e) = state
            .store
            .log_replay_attempt(&audit("evidence_cap", "per-evidence replay cap exceeded", None))
            .await
        {
            return internal_error(e).into_response();
        }
        return (
            StatusCode::TOO_MANY_REQUESTS,
            Json(json!({"error": "evidence_cap"})),
        )
            .into_response();
    }

    match state.runner.replay(&evidence_id, query.force).await {
        Ok(outcome) => {
            // A replay that cannot be audited must not succeed: the audit
            // rows are the rate-limiter state.
            if let Err(e) = state
                .store
                .log_replay_attempt(&audit(
                    "ok",
                    if query.force { "forced" } else { "replayed" },
                    Some(outcome.record.evidence_id.clone()),
                ))
                .await
            {
                return internal_error(e).into_response();
            }
            info!(
                evidence_id = %evidence_id,
                new_evidence_id = %outcome.record.evidence_id,
                force = query.force,
                "evidence replayed"
            );
            Json(json!({
                "evidence_id": outcome.record.evidence_id,
                "replays_evidence_id": outcome.record.replays_evidence_id,
                "cache_hit": outcome.record.cache_hit,
                "status": outcome.record.status.as_str(),
                "diff": diff_json(&outcome.diff),
            }))
            .into_response()
        }
        Err(Error::Storage(StorageError::NotFound { .. })) => {
            if let Err(e) = state
                .store
                .log_replay_attempt(&audit("error", "evidence not found", None))
                .await
            {
                return internal_error(e).into_response();
            }
            (
                StatusCode::NOT_FOUND,
                Json(json!({"error": "evidence not found"})),
            )
                .into_response()
        }
        Err(e) => {
            if let Err(audit_err) = state
                .store
                .log_replay_attempt(&audit("error", &e.to_string(), None))
                .await
            {
                return internal_error(audit_err).into_response();
            }
            internal_error(e).into_response()
        }
    }
}

#[derive(Deserialize)]
struct ExportQuery {
    #[serde(default)]
    mode: Option<String>,
}

fn export_entry(record: &EvidenceRecord, level: RedactionLevel) -> Value {
    let mut entry = serde_json::Map::new();
    entry.insert("evidence_id".into(), json!(record.evidence_id));
    entry.insert("tool_name".into(), json!(record.tool_name));
    entry.insert("status".into(), json!(record.status.as_str()));
    entry.insert("summary".into(), json!(record.summary_external));
    entry.insert("ran_at".into(), json!(to_rfc3339(record.ran_at)));
    entry.insert(
        "replays_evidence_id".into(),
        json!(record.replays_evidence_id),
    );
    if level == RedactionLevel::Internal {
        entry.insert("summary_internal".into(), json!(record.summary_internal));
        entry.insert("params_hash".into(), json!(record.params_hash));
        entry.insert("result_hash".into(), json!(record.result_hash));
        entry.insert("time_bucket".into(), json!(record.time_bucket));
        entry.insert("error_message".into(), json!(record.error_message));
        entry.insert("expires_at".into(), json!(to_rfc3339(record.expires_at)));
    }
    Value::Object(entry)
}

/// GET /intakes/{id}/export?mode=external|internal
///
/// External mode serves only the redacted summaries; internal mode adds
/// operator-only detail (unredacted summaries, params/result hashes).
async fn export_intake(
    State(state): State<ApiState>,
    headers: HeaderMap,
    Path(intake_id): Path<String>,
    Query(query): Query<ExportQuery>,
) -> impl IntoResponse {
    if state.authenticate(&headers).is_none() {
        return unauthorized().into_response();
    }
    let level = RedactionLevel::parse(query.mode.as_deref().unwrap_or("external"));
    match state
        .store
        .list_evidence_for_intake(&intake_id, EXPORT_LIMIT)
        .await
    {
        Ok(records) => {
            let evidence: Vec<Value> = records.iter().map(|r| export_entry(r, level)).collect();
            Json(json!({
                "intake_id": intake_id,
                "mode": level.as_str(),
                "evidence": evidence,
            }))
            .into_response()
        }
        Err(e) => internal_error(e).into_response(),
    }
}

/// GET /healthz
async fn healthz(State(state): State<ApiState>) -> impl IntoResponse {
    match state.store.ping().await {
        Ok(()) => Json(json!({"status": "ok"})).into_response(),
        Err(e) => (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({"status": "unavailable", "error": e.to_string()})),
        )
            .into_response(),
    }
}

/// Build the REST routes.
pub fn api_routes(state: ApiState) -> Router {
    Router::new()
        .route("/enqueue", post(enqueue))
        .route("/evidence/{id}/replay", post(replay_evidence))
        .route("/intakes/{id}/export", get(export_intake))
        .route("/healthz", get(healthz))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::evidence::record::EvidenceStatus;
    use chrono::Utc;

    fn record() -> EvidenceRecord {
        EvidenceRecord {
            evidence_id: "ev-1".to_string(),
            intake_id: "case-1".to_string(),
            tool_name: "service_status".to_string(),
            params_json: "{\"service_id\":\"api\"}".to_string(),
            params_hash: "p-hash".to_string(),
            time_bucket: "2025-05-01T10".to_string(),
            result_json_internal: "{}".to_string(),
            result_hash: "r-hash".to_string(),
            summary_external: "svc-api status=up".to_string(),
            summary_internal: "svc-api status=up host=api.corp token=Bearer abc".to_string(),
            redaction_level: RedactionLevel::Internal,
            status: EvidenceStatus::Ok,
            error_message: None,
            replays_evidence_id: None,
            cache_hit: false,
            ran_at: Utc::now(),
            expires_at: Utc::now(),
        }
    }

    #[test]
    fn external_export_omits_operator_fields() {
        let entry = export_entry(&record(), RedactionLevel::External);
        assert_eq!(entry["summary"], "svc-api status=up");
        assert!(entry.get("summary_internal").is_none());
        assert!(entry.get("params_hash").is_none());
        assert!(entry.get("result_hash").is_none());
    }

    #[test]
    fn internal_export_includes_hashes() {
        let entry = export_entry(&record(), RedactionLevel::Internal);
        assert_eq!(entry["params_hash"], "p-hash");
        assert_eq!(entry["result_hash"], "r-hash");
        assert!(entry["summary_internal"]
            .as_str()
            .unwrap()
            .contains("api.corp"));
    }

    #[tokio::test]
    async fn elevated_key_is_recognized() {
        use crate::store::LibSqlStore;
        use crate::tools::ToolRegistry;

        let store: Arc<dyn Store> = Arc::new(LibSqlStore::new_memory().await.unwrap());
        let registry = Arc::new(ToolRegistry::new().unwrap());
        let runner = Arc::new(EvidenceRunner::new(
            store.clone(),
            registry,
            &TriageConfig::default(),
        ));
        let state = ApiState {
            store,
            runner,
            config: Arc::new(TriageConfig::default()),
            api_key: SecretString::from("standard"),
            admin_key: Some(SecretString::from("elevated")),
        };
        let mut headers = HeaderMap::new();
        headers.insert("x-api-key", "elevated".parse().unwrap());
        assert!(matches!(
            state.authenticate(&headers),
            Some(Caller::Elevated { .. })
        ));
        headers.insert("x-api-key", "standard".parse().unwrap());
        assert!(matches!(
            state.authenticate(&headers),
            Some(Caller::Standard { .. })
        ));
        headers.insert("x-api-key", "wrong".parse().unwrap());
        assert!(state.authenticate(&headers).is_none());
    }

    #[tokio::test]
    async fn router_serves_healthz_and_guards_enqueue() {
        use axum::body::Body;
        use axum::http::Request;
        use tower::ServiceExt;

        use crate::store::LibSqlStore;
        use crate::tools::ToolRegistry;

        let store: Arc<dyn Store> = Arc::new(LibSqlStore::new_memory().await.unwrap());
        let registry = Arc::new(ToolRegistry::new().unwrap());
        let runner = Arc::new(EvidenceRunner::new(
            store.clone(),
            registry,
            &TriageConfig::default(),
        ));
        let app = api_routes(ApiState {
            store,
            runner,
            config: Arc::new(TriageConfig::default()),
            api_key: SecretString::from("k"),
            admin_key: None,
        });

        let response = app
            .clone()
            .oneshot(
                Request::builder()
                    .uri("/healthz")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let response = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/enqueue")
                    .header("content-type", "application/json")
                    .body(Body::from(r#"{"text":"hi","tenant":"acme"}"#))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }
}
