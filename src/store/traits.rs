//! Unified `Store` trait — single async interface for all persistence.
//!
//! The queue, the evidence cache, the breaker table, and the replay audit
//! log are the only shared mutable state in the system; every mutation goes
//! through the atomic operations here.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::StorageError;
use crate::evidence::EvidenceRecord;
use crate::queue::{EnqueueRequest, QueueItem, QueueStatus, QueueUpdate};

/// Persisted circuit-breaker state, per (service_id, scope).
#[derive(Debug, Clone)]
pub struct BreakerState {
    pub service_id: String,
    pub scope: String,
    pub consecutive_failures: u32,
    pub opened_at: Option<DateTime<Utc>>,
    pub cooldown_until: Option<DateTime<Utc>>,
    pub last_error_kind: Option<String>,
}

impl BreakerState {
    /// Whether the breaker is currently short-circuiting checks.
    pub fn is_open(&self, now: DateTime<Utc>) -> bool {
        self.cooldown_until.is_some_and(|until| until > now)
    }
}

/// One replay attempt, allowed or blocked. Doubles as rate-limiter state.
#[derive(Debug, Clone)]
pub struct ReplayAttempt {
    pub api_key_hash: String,
    pub evidence_id: String,
    pub new_evidence_id: Option<String>,
    /// "ok", "rate_limited", "evidence_cap", "forbidden", or "error".
    pub result: String,
    pub reason: String,
    pub remote_ip: Option<String>,
    pub user_agent: Option<String>,
}

/// Backend-agnostic store covering the queue, evidence runs, breakers, and
/// the replay audit log.
#[async_trait]
pub trait Store: Send + Sync {
    /// Run all pending schema migrations.
    async fn run_migrations(&self) -> Result<(), StorageError>;

    /// Liveness probe for health checks.
    async fn ping(&self) -> Result<(), StorageError>;

    // ── Queue ───────────────────────────────────────────────────────

    /// Idempotent insert. If a non-dead-lettered row with the same
    /// idempotency key exists, returns `(existing_id, false)`; otherwise
    /// inserts with `status = queued`, `retry_count = 0` and returns
    /// `(new_id, true)`.
    async fn enqueue(&self, request: &EnqueueRequest) -> Result<(i64, bool), StorageError>;

    /// Atomically claim the oldest queued row whose `available_at` has
    /// passed, flipping it to `processing`. Returns `None` when nothing is
    /// eligible; never hands the same row to two callers.
    async fn claim(&self, processor_id: &str) -> Result<Option<QueueItem>, StorageError>;

    /// Merge the given fields and status under a single write. The typed
    /// `QueueUpdate` struct is the field allowlist.
    async fn update_status(
        &self,
        id: i64,
        status: QueueStatus,
        update: QueueUpdate,
    ) -> Result<(), StorageError>;

    /// Fetch one queue item by id.
    async fn get_item(&self, id: i64) -> Result<Option<QueueItem>, StorageError>;

    // ── Evidence ────────────────────────────────────────────────────

    /// Append an evidence record. When another writer already landed a
    /// record for the same `(tool_name, params_hash, time_bucket)` cache
    /// key, the insert is discarded and the winner is returned with
    /// `cache_hit = true`; callers must use the returned record.
    async fn insert_evidence(
        &self,
        record: &EvidenceRecord,
    ) -> Result<EvidenceRecord, StorageError>;

    /// Look up a live cached record for a cache key.
    async fn find_cached_evidence(
        &self,
        tool_name: &str,
        params_hash: &str,
        time_bucket: &str,
    ) -> Result<Option<EvidenceRecord>, StorageError>;

    /// Fetch one evidence record by id.
    async fn get_evidence(&self, evidence_id: &str)
        -> Result<Option<EvidenceRecord>, StorageError>;

    /// Most recent evidence records for an intake, newest first.
    async fn list_evidence_for_intake(
        &self,
        intake_id: &str,
        limit: usize,
    ) -> Result<Vec<EvidenceRecord>, StorageError>;

    // ── Circuit breakers ────────────────────────────────────────────

    async fn get_breaker(
        &self,
        service_id: &str,
        scope: &str,
    ) -> Result<Option<BreakerState>, StorageError>;

    /// Increment the failure counter; once it reaches `threshold`, open the
    /// breaker for `cooldown`. Last-writer-wins under concurrent probers.
    async fn bump_breaker_failure(
        &self,
        service_id: &str,
        scope: &str,
        threshold: u32,
        cooldown: Duration,
        error_kind: &str,
    ) -> Result<(), StorageError>;

    /// Reset the failure counter and clear any cooldown.
    async fn reset_breaker(&self, service_id: &str, scope: &str) -> Result<(), StorageError>;

    // ── Replay audit ────────────────────────────────────────────────

    /// Record a replay attempt, including blocked ones.
    async fn log_replay_attempt(&self, attempt: &ReplayAttempt) -> Result<(), StorageError>;

    /// Attempts by an API key within the trailing window.
    async fn count_replays_for_key(
        &self,
        api_key_hash: &str,
        window: Duration,
    ) -> Result<u32, StorageError>;

    /// Attempts against one evidence id within the trailing window.
    async fn count_replays_for_evidence(
        &self,
        evidence_id: &str,
        window: Duration,
    ) -> Result<u32, StorageError>;
}
