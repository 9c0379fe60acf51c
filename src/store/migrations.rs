//! Versioned schema migrations.
//!
//! Each migration runs at most once; applied versions are tracked in the
//! `_migrations` table. Migrations are append-only: never edit a shipped
//! entry, add a new version instead.

use libsql::Connection;

use crate::error::StorageError;

pub struct Migration {
    pub version: i64,
    pub name: &'static str,
    pub sql: &'static str,
}

pub static MIGRATIONS: &[Migration] = &[
    Migration {
        version: 1,
        name: "create_queue",
        sql: r#"
            CREATE TABLE IF NOT EXISTS queue (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                case_id TEXT NOT NULL,
                idempotency_key TEXT,
                retry_count INTEGER NOT NULL DEFAULT 0,
                available_at TEXT NOT NULL,
                status TEXT NOT NULL DEFAULT 'queued',
                conversation_id TEXT,
                tenant TEXT NOT NULL DEFAULT 'default',
                payload TEXT NOT NULL,
                redacted_payload TEXT,
                classification_json TEXT,
                evidence_sources_run TEXT,
                final_report_json TEXT,
                response_metadata TEXT,
                processor_id TEXT,
                created_at TEXT NOT NULL,
                started_at TEXT,
                finished_at TEXT
            );
            CREATE INDEX IF NOT EXISTS idx_queue_claim
                ON queue(status, available_at, created_at);
            CREATE UNIQUE INDEX IF NOT EXISTS idx_queue_idempotency
                ON queue(idempotency_key)
                WHERE idempotency_key IS NOT NULL AND status != 'dead_letter';
        "#,
    },
    Migration {
        version: 2,
        name: "create_evidence_runs",
        sql: r#"
            CREATE TABLE IF NOT EXISTS evidence_runs (
                evidence_id TEXT PRIMARY KEY,
                intake_id TEXT NOT NULL,
                tool_name TEXT NOT NULL,
                params_json TEXT NOT NULL,
                params_hash TEXT NOT NULL,
                time_bucket TEXT NOT NULL,
                result_json_internal TEXT NOT NULL,
                result_hash TEXT NOT NULL,
                summary_external TEXT NOT NULL,
                summary_internal TEXT NOT NULL,
                redaction_level TEXT NOT NULL DEFAULT 'internal',
                status TEXT NOT NULL DEFAULT 'ok',
                error_message TEXT,
                replays_evidence_id TEXT,
                ran_at TEXT NOT NULL,
                expires_at TEXT NOT NULL
            );
            CREATE UNIQUE INDEX IF NOT EXISTS idx_evidence_cache_key
                ON evidence_runs(tool_name, params_hash, time_bucket);
            CREATE INDEX IF NOT EXISTS idx_evidence_intake
                ON evidence_runs(intake_id, ran_at);
        "#,
    },
    Migration {
        version: 3,
        name: "create_service_breakers",
        sql: r#"
            CREATE TABLE IF NOT EXISTS service_breakers (
                service_id TEXT NOT NULL,
                scope TEXT NOT NULL,
                consecutive_failures INTEGER NOT NULL DEFAULT 0,
                opened_at TEXT,
                cooldown_until TEXT,
                last_error_kind TEXT,
                updated_at TEXT NOT NULL,
                PRIMARY KEY (service_id, scope)
            );
        "#,
    },
    Migration {
        version: 4,
        name: "create_replay_audit",
        sql: r#"
            CREATE TABLE IF NOT EXISTS replay_audit (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                api_key_hash TEXT NOT NULL,
                evidence_id TEXT NOT NULL,
                new_evidence_id TEXT,
                result TEXT NOT NULL,
                reason TEXT NOT NULL,
                remote_ip TEXT,
                user_agent TEXT,
                attempted_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_replay_audit_key
                ON replay_audit(api_key_hash, attempted_at);
            CREATE INDEX IF NOT EXISTS idx_replay_audit_evidence
                ON replay_audit(evidence_id, attempted_at);
        "#,
    },
];

/// Apply all migrations newer than the recorded schema version.
pub async fn run_migrations(conn: &Connection) -> Result<(), StorageError> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS _migrations (
            version INTEGER PRIMARY KEY,
            name TEXT NOT NULL,
            applied_at TEXT NOT NULL
        );",
    )
    .await
    .map_err(|e| StorageError::Migration(e.to_string()))?;

    let mut rows = conn
        .query("SELECT COALESCE(MAX(version), 0) FROM _migrations", ())
        .await
        .map_err(|e| StorageError::Migration(e.to_string()))?;
    let current: i64 = match rows
        .next()
        .await
        .map_err(|e| StorageError::Migration(e.to_string()))?
    {
        Some(row) => row
            .get(0)
            .map_err(|e| StorageError::Migration(e.to_string()))?,
        None => 0,
    };

    for migration in MIGRATIONS.iter().filter(|m| m.version > current) {
        tracing::info!(
            version = migration.version,
            name = migration.name,
            "applying migration"
        );
        conn.execute_batch(migration.sql)
            .await
            .map_err(|e| StorageError::Migration(format!("{}: {e}", migration.name)))?;
        conn.execute(
            "INSERT INTO _migrations (version, name, applied_at) VALUES (?1, ?2, ?3)",
            libsql::params![
                migration.version,
                migration.name,
                crate::util::now_rfc3339()
            ],
        )
        .await
        .map_err(|e| StorageError::Migration(e.to_string()))?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn versions_are_strictly_increasing() {
        for pair in MIGRATIONS.windows(2) {
            assert!(pair[0].version < pair[1].version);
        }
    }

    #[tokio::test]
    async fn migrations_are_idempotent() {
        let db = libsql::Builder::new_local(":memory:").build().await.unwrap();
        let conn = db.connect().unwrap();
        run_migrations(&conn).await.unwrap();
        run_migrations(&conn).await.unwrap();

        let mut rows = conn
            .query("SELECT COUNT(*) FROM _migrations", ())
            .await
            .unwrap();
        let row = rows.next().await.unwrap().unwrap();
        let count: i64 = row.get(0).unwrap();
        assert_eq!(count, MIGRATIONS.len() as i64);
    }
}
