//! libSQL backend — async `Store` trait implementation.
//!
//! Supports local file and in-memory databases. All multi-writer races are
//! settled inside single SQL statements (claim) or by unique indexes plus
//! re-read (enqueue, evidence insert), so no explicit transactions are held
//! across awaits.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use libsql::{Connection, Database as LibSqlDatabase, Value};
use tracing::{debug, info};
use uuid::Uuid;

use crate::error::StorageError;
use crate::evidence::{EvidenceRecord, EvidenceStatus, RedactionLevel};
use crate::queue::{
    EnqueueRequest, QueueItem, QueueStatus, QueueUpdate, compute_idempotency_key,
};
use crate::store::migrations;
use crate::store::traits::{BreakerState, ReplayAttempt, Store};
use crate::util::{now_rfc3339, parse_datetime, to_rfc3339};

/// libSQL store backend.
///
/// Holds a single connection reused for all operations.
/// `libsql::Connection` is `Send + Sync` and safe for concurrent async use.
pub struct LibSqlStore {
    #[allow(dead_code)]
    db: Arc<LibSqlDatabase>,
    conn: Connection,
}

impl LibSqlStore {
    /// Open (or create) a local database file and run migrations.
    pub async fn new_local(path: &Path) -> Result<Self, StorageError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| StorageError::Pool(format!("Failed to create data directory: {e}")))?;
        }

        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(|e| StorageError::Pool(format!("Failed to open libSQL database: {e}")))?;
        let conn = db
            .connect()
            .map_err(|e| StorageError::Pool(format!("Failed to create connection: {e}")))?;

        let store = Self {
            db: Arc::new(db),
            conn,
        };
        store.run_migrations().await?;
        info!(path = %path.display(), "Database opened");
        Ok(store)
    }

    /// Create an in-memory database (for tests).
    pub async fn new_memory() -> Result<Self, StorageError> {
        let db = libsql::Builder::new_local(":memory:")
            .build()
            .await
            .map_err(|e| StorageError::Pool(format!("Failed to create in-memory database: {e}")))?;
        let conn = db
            .connect()
            .map_err(|e| StorageError::Pool(format!("Failed to create connection: {e}")))?;

        let store = Self {
            db: Arc::new(db),
            conn,
        };
        store.run_migrations().await?;
        Ok(store)
    }

    fn conn(&self) -> &Connection {
        &self.conn
    }

    async fn find_queued_by_key(&self, key: &str) -> Result<Option<i64>, StorageError> {
        let mut rows = self
            .conn()
            .query(
                "SELECT id FROM queue
                 WHERE idempotency_key = ?1 AND status != 'dead_letter'
                 ORDER BY created_at DESC, id DESC LIMIT 1",
                libsql::params![key],
            )
            .await
            .map_err(query_err)?;
        match rows.next().await.map_err(query_err)? {
            Some(row) => Ok(Some(row.get(0).map_err(query_err)?)),
            None => Ok(None),
        }
    }
}

// ── Helper functions ────────────────────────────────────────────────

fn query_err(e: libsql::Error) -> StorageError {
    StorageError::Query(e.to_string())
}

fn opt_text(v: &Option<String>) -> Value {
    match v {
        Some(s) => Value::Text(s.clone()),
        None => Value::Null,
    }
}

fn parse_optional_datetime(s: Option<String>) -> Option<DateTime<Utc>> {
    s.map(|s| parse_datetime(&s))
}

/// Column order shared by every queue SELECT and RETURNING clause.
const QUEUE_COLUMNS: &str = "id, case_id, idempotency_key, retry_count, available_at, status, \
     conversation_id, tenant, payload, redacted_payload, classification_json, \
     evidence_sources_run, final_report_json, response_metadata, processor_id, \
     created_at, started_at, finished_at";

fn row_to_item(row: &libsql::Row) -> Result<QueueItem, libsql::Error> {
    let retry_count: i64 = row.get(3)?;
    let available_str: String = row.get(4)?;
    let status_str: String = row.get(5)?;
    let sources_str: Option<String> = row.get::<String>(11).ok();
    let created_str: String = row.get(15)?;

    Ok(QueueItem {
        id: row.get(0)?,
        case_id: row.get(1)?,
        idempotency_key: row.get::<String>(2).ok(),
        retry_count: retry_count.max(0) as u32,
        available_at: parse_datetime(&available_str),
        status: QueueStatus::parse(&status_str),
        conversation_id: row.get::<String>(6).ok(),
        tenant: row.get(7)?,
        payload: row.get(8)?,
        redacted_payload: row.get::<String>(9).ok(),
        classification_json: row.get::<String>(10).ok(),
        evidence_sources_run: sources_str
            .and_then(|s| serde_json::from_str(&s).ok())
            .unwrap_or_default(),
        final_report_json: row.get::<String>(12).ok(),
        response_metadata: row.get::<String>(13).ok(),
        processor_id: row.get::<String>(14).ok(),
        created_at: parse_datetime(&created_str),
        started_at: parse_optional_datetime(row.get::<String>(16).ok()),
        finished_at: parse_optional_datetime(row.get::<String>(17).ok()),
    })
}

/// Column order shared by every evidence SELECT.
const EVIDENCE_COLUMNS: &str = "evidence_id, intake_id, tool_name, params_json, params_hash, \
     time_bucket, result_json_internal, result_hash, summary_external, summary_internal, \
     redaction_level, status, error_message, replays_evidence_id, ran_at, expires_at";

fn row_to_evidence(row: &libsql::Row) -> Result<EvidenceRecord, libsql::Error> {
    let redaction_str: String = row.get(10)?;
    let status_str: String = row.get(11)?;
    let ran_str: String = row.get(14)?;
    let expires_str: String = row.get(15)?;

    Ok(EvidenceRecord {
        evidence_id: row.get(0)?,
        intake_id: row.get(1)?,
        tool_name: row.get(2)?,
        params_json: row.get(3)?,
        params_hash: row.get(4)?,
        time_bucket: row.get(5)?,
        result_json_internal: row.get(6)?,
        result_hash: row.get(7)?,
        summary_external: row.get(8)?,
        summary_internal: row.get(9)?,
        redaction_level: RedactionLevel::parse(&redaction_str),
        status: EvidenceStatus::parse(&status_str),
        error_message: row.get::<String>(12).ok(),
        replays_evidence_id: row.get::<String>(13).ok(),
        cache_hit: false,
        ran_at: parse_datetime(&ran_str),
        expires_at: parse_datetime(&expires_str),
    })
}

fn cutoff_for(window: Duration) -> DateTime<Utc> {
    Utc::now() - chrono::Duration::seconds(window.as_secs() as i64)
}

#[async_trait]
impl Store for LibSqlStore {
    async fn run_migrations(&self) -> Result<(), StorageError> {
        migrations::run_migrations(self.conn()).await
    }

    async fn ping(&self) -> Result<(), StorageError> {
        let mut rows = self
            .conn()
            .query("SELECT 1", ())
            .await
            .map_err(query_err)?;
        rows.next().await.map_err(query_err)?;
        Ok(())
    }

    async fn enqueue(&self, request: &EnqueueRequest) -> Result<(i64, bool), StorageError> {
        let now = Utc::now();
        let key = request
            .idempotency_key
            .clone()
            .unwrap_or_else(|| compute_idempotency_key(&request.tenant, &request.text, now));

        if let Some(id) = self.find_queued_by_key(&key).await? {
            debug!(id, "enqueue deduplicated against existing item");
            return Ok((id, false));
        }

        let case_id = request
            .case_id
            .clone()
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        let now_str = to_rfc3339(now);

        let params: Vec<Value> = vec![
            Value::Text(case_id),
            Value::Text(key.clone()),
            Value::Text(now_str.clone()),
            opt_text(&request.conversation_id),
            Value::Text(request.tenant.clone()),
            Value::Text(request.text.clone()),
            Value::Text(now_str),
        ];
        let affected = self
            .conn()
            .execute(
                "INSERT OR IGNORE INTO queue
                     (case_id, idempotency_key, retry_count, available_at, status,
                      conversation_id, tenant, payload, created_at)
                 VALUES (?1, ?2, 0, ?3, 'queued', ?4, ?5, ?6, ?7)",
                params,
            )
            .await
            .map_err(query_err)?;

        if affected == 0 {
            // A concurrent writer landed the same key between our read and
            // insert; the unique index swallowed ours. Serve theirs.
            return match self.find_queued_by_key(&key).await? {
                Some(id) => Ok((id, false)),
                None => Err(StorageError::Constraint(format!(
                    "enqueue lost insert race but no row found for key {key}"
                ))),
            };
        }
        Ok((self.conn().last_insert_rowid(), true))
    }

    async fn claim(&self, processor_id: &str) -> Result<Option<QueueItem>, StorageError> {
        let now_str = now_rfc3339();
        let sql = format!(
            "UPDATE queue SET status = 'processing', processor_id = ?1, started_at = ?2
             WHERE id = (
                 SELECT id FROM queue
                 WHERE status = 'queued' AND available_at <= ?2
                 ORDER BY created_at ASC, id ASC
                 LIMIT 1
             )
             RETURNING {QUEUE_COLUMNS}"
        );
        let mut rows = self
            .conn()
            .query(&sql, libsql::params![processor_id, now_str])
            .await
            .map_err(query_err)?;
        match rows.next().await.map_err(query_err)? {
            Some(row) => {
                let item = row_to_item(&row).map_err(query_err)?;
                debug!(id = item.id, processor_id, "claimed queue item");
                Ok(Some(item))
            }
            None => Ok(None),
        }
    }

    async fn update_status(
        &self,
        id: i64,
        status: QueueStatus,
        update: QueueUpdate,
    ) -> Result<(), StorageError> {
        let mut sets: Vec<&'static str> = vec!["status"];
        let mut values: Vec<Value> = vec![Value::Text(status.as_str().to_string())];

        if let Some(key) = update.idempotency_key {
            sets.push("idempotency_key");
            values.push(Value::Text(key));
        }
        if let Some(retry) = update.retry_count {
            sets.push("retry_count");
            values.push(Value::Integer(retry as i64));
        }
        if let Some(at) = update.available_at {
            sets.push("available_at");
            values.push(Value::Text(to_rfc3339(at)));
        }
        if let Some(cid) = update.conversation_id {
            sets.push("conversation_id");
            values.push(Value::Text(cid));
        }
        if let Some(p) = update.redacted_payload {
            sets.push("redacted_payload");
            values.push(Value::Text(p));
        }
        if let Some(c) = update.classification_json {
            sets.push("classification_json");
            values.push(Value::Text(c));
        }
        if let Some(sources) = update.evidence_sources_run {
            sets.push("evidence_sources_run");
            let json = serde_json::to_string(&sources)
                .map_err(|e| StorageError::Serialization(e.to_string()))?;
            values.push(Value::Text(json));
        }
        if let Some(r) = update.final_report_json {
            sets.push("final_report_json");
            values.push(Value::Text(r));
        }
        if let Some(m) = update.response_metadata {
            sets.push("response_metadata");
            values.push(Value::Text(m));
        }
        if let Some(p) = update.processor_id {
            sets.push("processor_id");
            values.push(Value::Text(p));
        }
        if let Some(at) = update.started_at {
            sets.push("started_at");
            values.push(Value::Text(to_rfc3339(at)));
        }
        if let Some(at) = update.finished_at {
            sets.push("finished_at");
            values.push(Value::Text(to_rfc3339(at)));
        }

        let assignments: Vec<String> = sets
            .iter()
            .enumerate()
            .map(|(i, col)| format!("{col} = ?{}", i + 1))
            .collect();
        let sql = format!(
            "UPDATE queue SET {} WHERE id = ?{}",
            assignments.join(", "),
            sets.len() + 1
        );
        values.push(Value::Integer(id));

        let affected = self
            .conn()
            .execute(&sql, values)
            .await
            .map_err(query_err)?;
        if affected == 0 {
            return Err(StorageError::NotFound {
                entity: "queue item".into(),
                id: id.to_string(),
            });
        }
        Ok(())
    }

    async fn get_item(&self, id: i64) -> Result<Option<QueueItem>, StorageError> {
        let sql = format!("SELECT {QUEUE_COLUMNS} FROM queue WHERE id = ?1");
        let mut rows = self
            .conn()
            .query(&sql, libsql::params![id])
            .await
            .map_err(query_err)?;
        match rows.next().await.map_err(query_err)? {
            Some(row) => Ok(Some(row_to_item(&row).map_err(query_err)?)),
            None => Ok(None),
        }
    }

    async fn insert_evidence(
        &self,
        record: &EvidenceRecord,
    ) -> Result<EvidenceRecord, StorageError> {
        let params: Vec<Value> = vec![
            Value::Text(record.evidence_id.clone()),
            Value::Text(record.intake_id.clone()),
            Value::Text(record.tool_name.clone()),
            Value::Text(record.params_json.clone()),
            Value::Text(record.params_hash.clone()),
            Value::Text(record.time_bucket.clone()),
            Value::Text(record.result_json_internal.clone()),
            Value::Text(record.result_hash.clone()),
            Value::Text(record.summary_external.clone()),
            Value::Text(record.summary_internal.clone()),
            Value::Text(record.redaction_level.as_str().to_string()),
            Value::Text(record.status.as_str().to_string()),
            opt_text(&record.error_message),
            opt_text(&record.replays_evidence_id),
            Value::Text(to_rfc3339(record.ran_at)),
            Value::Text(to_rfc3339(record.expires_at)),
        ];
        let affected = self
            .conn()
            .execute(
                "INSERT OR IGNORE INTO evidence_runs
                     (evidence_id, intake_id, tool_name, params_json, params_hash,
                      time_bucket, result_json_internal, result_hash, summary_external,
                      summary_internal, redaction_level, status, error_message,
                      replays_evidence_id, ran_at, expires_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16)",
                params,
            )
            .await
            .map_err(query_err)?;

        if affected > 0 {
            return Ok(record.clone());
        }
        // Lost the cache-key race: another writer owns this
        // (tool_name, params_hash, time_bucket) slot. Re-read the winner.
        match self
            .find_cached_evidence(&record.tool_name, &record.params_hash, &record.time_bucket)
            .await?
        {
            Some(mut winner) => {
                winner.cache_hit = true;
                Ok(winner)
            }
            None => Err(StorageError::Constraint(format!(
                "evidence insert ignored but no cached row found for {} {}",
                record.tool_name, record.params_hash
            ))),
        }
    }

    async fn find_cached_evidence(
        &self,
        tool_name: &str,
        params_hash: &str,
        time_bucket: &str,
    ) -> Result<Option<EvidenceRecord>, StorageError> {
        let sql = format!(
            "SELECT {EVIDENCE_COLUMNS} FROM evidence_runs
             WHERE tool_name = ?1 AND params_hash = ?2 AND time_bucket = ?3
               AND expires_at > ?4"
        );
        let mut rows = self
            .conn()
            .query(
                &sql,
                libsql::params![tool_name, params_hash, time_bucket, now_rfc3339()],
            )
            .await
            .map_err(query_err)?;
        match rows.next().await.map_err(query_err)? {
            Some(row) => Ok(Some(row_to_evidence(&row).map_err(query_err)?)),
            None => Ok(None),
        }
    }

    async fn get_evidence(
        &self,
        evidence_id: &str,
    ) -> Result<Option<EvidenceRecord>, StorageError> {
        let sql = format!("SELECT {EVIDENCE_COLUMNS} FROM evidence_runs WHERE evidence_id = ?1");
        let mut rows = self
            .conn()
            .query(&sql, libsql::params![evidence_id])
            .await
            .map_err(query_err)?;
        match rows.next().await.map_err(query_err)? {
            Some(row) => Ok(Some(row_to_evidence(&row).map_err(query_err)?)),
            None => Ok(None),
        }
    }

    async fn list_evidence_for_intake(
        &self,
        intake_id: &str,
        limit: usize,
    ) -> Result<Vec<EvidenceRecord>, StorageError> {
        let sql = format!(
            "SELECT {EVIDENCE_COLUMNS} FROM evidence_runs
             WHERE intake_id = ?1
             ORDER BY ran_at DESC, evidence_id DESC
             LIMIT ?2"
        );
        let mut rows = self
            .conn()
            .query(&sql, libsql::params![intake_id, limit as i64])
            .await
            .map_err(query_err)?;
        let mut out = Vec::new();
        while let Some(row) = rows.next().await.map_err(query_err)? {
            out.push(row_to_evidence(&row).map_err(query_err)?);
        }
        Ok(out)
    }

    async fn get_breaker(
        &self,
        service_id: &str,
        scope: &str,
    ) -> Result<Option<BreakerState>, StorageError> {
        let mut rows = self
            .conn()
            .query(
                "SELECT consecutive_failures, opened_at, cooldown_until, last_error_kind
                 FROM service_breakers WHERE service_id = ?1 AND scope = ?2",
                libsql::params![service_id, scope],
            )
            .await
            .map_err(query_err)?;
        match rows.next().await.map_err(query_err)? {
            Some(row) => {
                let failures: i64 = row.get(0).map_err(query_err)?;
                Ok(Some(BreakerState {
                    service_id: service_id.to_string(),
                    scope: scope.to_string(),
                    consecutive_failures: failures.max(0) as u32,
                    opened_at: parse_optional_datetime(row.get::<String>(1).ok()),
                    cooldown_until: parse_optional_datetime(row.get::<String>(2).ok()),
                    last_error_kind: row.get::<String>(3).ok(),
                }))
            }
            None => Ok(None),
        }
    }

    async fn bump_breaker_failure(
        &self,
        service_id: &str,
        scope: &str,
        threshold: u32,
        cooldown: Duration,
        error_kind: &str,
    ) -> Result<(), StorageError> {
        let current = self
            .get_breaker(service_id, scope)
            .await?
            .map(|b| b.consecutive_failures)
            .unwrap_or(0);
        let next = current.saturating_add(1);
        let now = Utc::now();
        let (opened_at, cooldown_until) = if next >= threshold {
            let until = now + chrono::Duration::seconds(cooldown.as_secs() as i64);
            (Value::Text(to_rfc3339(now)), Value::Text(to_rfc3339(until)))
        } else {
            (Value::Null, Value::Null)
        };

        let params: Vec<Value> = vec![
            Value::Text(service_id.to_string()),
            Value::Text(scope.to_string()),
            Value::Integer(next as i64),
            opened_at,
            cooldown_until,
            Value::Text(error_kind.to_string()),
            Value::Text(to_rfc3339(now)),
        ];
        self.conn()
            .execute(
                "INSERT INTO service_breakers
                     (service_id, scope, consecutive_failures, opened_at,
                      cooldown_until, last_error_kind, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
                 ON CONFLICT(service_id, scope) DO UPDATE SET
                     consecutive_failures = excluded.consecutive_failures,
                     opened_at = excluded.opened_at,
                     cooldown_until = excluded.cooldown_until,
                     last_error_kind = excluded.last_error_kind,
                     updated_at = excluded.updated_at",
                params,
            )
            .await
            .map_err(query_err)?;
        Ok(())
    }

    async fn reset_breaker(&self, service_id: &str, scope: &str) -> Result<(), StorageError> {
        self.conn()
            .execute(
                "UPDATE service_breakers
                 SET consecutive_failures = 0, opened_at = NULL,
                     cooldown_until = NULL, updated_at = ?3
                 WHERE service_id = ?1 AND scope = ?2",
                libsql::params![service_id, scope, now_rfc3339()],
            )
            .await
            .map_err(query_err)?;
        Ok(())
    }

    async fn log_replay_attempt(&self, attempt: &ReplayAttempt) -> Result<(), StorageError> {
        let params: Vec<Value> = vec![
            Value::Text(attempt.api_key_hash.clone()),
            Value::Text(attempt.evidence_id.clone()),
            opt_text(&attempt.new_evidence_id),
            Value::Text(attempt.result.clone()),
            Value::Text(attempt.reason.clone()),
            opt_text(&attempt.remote_ip),
            opt_text(&attempt.user_agent),
            Value::Text(now_rfc3339()),
        ];
        self.conn()
            .execute(
                "INSERT INTO replay_audit
                     (api_key_hash, evidence_id, new_evidence_id, result, reason,
                      remote_ip, user_agent, attempted_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                params,
            )
            .await
            .map_err(query_err)?;
        Ok(())
    }

    async fn count_replays_for_key(
        &self,
        api_key_hash: &str,
        window: Duration,
    ) -> Result<u32, StorageError> {
        let mut rows = self
            .conn()
            .query(
                "SELECT COUNT(*) FROM replay_audit
                 WHERE api_key_hash = ?1 AND attempted_at >= ?2",
                libsql::params![api_key_hash, to_rfc3339(cutoff_for(window))],
            )
            .await
            .map_err(query_err)?;
        let count: i64 = match rows.next().await.map_err(query_err)? {
            Some(row) => row.get(0).map_err(query_err)?,
            None => 0,
        };
        Ok(count.max(0) as u32)
    }

    async fn count_replays_for_evidence(
        &self,
        evidence_id: &str,
        window: Duration,
    ) -> Result<u32, StorageError> {
        let mut rows = self
            .conn()
            .query(
                "SELECT COUNT(*) FROM replay_audit
                 WHERE evidence_id = ?1 AND attempted_at >= ?2",
                libsql::params![evidence_id, to_rfc3339(cutoff_for(window))],
            )
            .await
            .map_err(query_err)?;
        let count: i64 = match rows.next().await.map_err(query_err)? {
            Some(row) => row.get(0).map_err(query_err)?,
            None => 0,
        };
        Ok(count.max(0) as u32)
    }
}
