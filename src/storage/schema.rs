//! SQLite schema for the control plane's persistent stores (§6 "Model
//! storage layout").
//!
//! Follows the host crate's versioned-migration idiom: a `schema_version`
//! table gates `apply_vN_schema` functions so `initialize_schema` is
//! idempotent and safe to call on every boot.

use rusqlite::Connection;

use crate::error::Result;

pub const SCHEMA_VERSION: i64 = 1;

/// Create the schema if it does not already exist, and record the schema
/// version. Safe to call repeatedly.
pub fn initialize_schema(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "PRAGMA journal_mode=WAL;
         PRAGMA foreign_keys=ON;",
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS schema_version (version INTEGER NOT NULL)",
        [],
    )?;

    let current_version = get_schema_version(conn)?;
    if current_version < 1 {
        apply_v1_schema(conn)?;
        conn.execute("INSERT INTO schema_version (version) VALUES (1)", [])?;
    }

    Ok(())
}

fn apply_v1_schema(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS models (
            model_id TEXT PRIMARY KEY,
            name TEXT NOT NULL,
            kind TEXT NOT NULL,
            provider TEXT NOT NULL,
            use_case TEXT NOT NULL,
            version TEXT NOT NULL,
            status TEXT NOT NULL,
            config_json TEXT NOT NULL,
            metrics_json TEXT NOT NULL,
            resources_json TEXT NOT NULL,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_models_use_case ON models(use_case);

        -- Enforces §3's 'at most one current Model per use_case' invariant
        -- at the storage layer as a defense in depth alongside the
        -- transactional promotion in registry::store.
        CREATE UNIQUE INDEX IF NOT EXISTS idx_models_one_current_per_use_case
            ON models(use_case) WHERE status = 'current';

        CREATE TABLE IF NOT EXISTS inference_logs (
            log_id TEXT PRIMARY KEY,
            model_id TEXT NOT NULL,
            use_case TEXT NOT NULL,
            prompt TEXT NOT NULL,
            context_json TEXT NOT NULL,
            output TEXT NOT NULL,
            feedback_json TEXT,
            corrected_output TEXT,
            metrics_json TEXT NOT NULL,
            created_at TEXT NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_logs_model_created
            ON inference_logs(model_id, created_at);
        CREATE INDEX IF NOT EXISTS idx_logs_use_case_created
            ON inference_logs(use_case, created_at);

        CREATE TABLE IF NOT EXISTS deployments (
            deployment_id TEXT PRIMARY KEY,
            model_id TEXT NOT NULL,
            strategy TEXT NOT NULL,
            status TEXT NOT NULL,
            traffic_percentage REAL NOT NULL,
            start_time TEXT NOT NULL,
            complete_time TEXT,
            rollback_reason TEXT
        );

        CREATE INDEX IF NOT EXISTS idx_deployments_model ON deployments(model_id);

        CREATE TABLE IF NOT EXISTS snapshots (
            snapshot_id TEXT PRIMARY KEY,
            model_id TEXT NOT NULL,
            config_json TEXT NOT NULL,
            metrics_json TEXT NOT NULL,
            traffic_percentage REAL NOT NULL,
            artifact_location TEXT,
            created_at TEXT NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_snapshots_model_created
            ON snapshots(model_id, created_at);

        CREATE TABLE IF NOT EXISTS guardrails_violations (
            violation_id TEXT PRIMARY KEY,
            model_id TEXT NOT NULL,
            category TEXT NOT NULL,
            severity TEXT NOT NULL,
            details_json TEXT NOT NULL,
            output_sample TEXT NOT NULL,
            intervention TEXT NOT NULL,
            created_at TEXT NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_violations_model ON guardrails_violations(model_id);

        CREATE TABLE IF NOT EXISTS finetune_jobs (
            job_id TEXT PRIMARY KEY,
            base_model_id TEXT NOT NULL,
            use_case TEXT NOT NULL,
            remote_handle TEXT,
            hyperparameters_json TEXT NOT NULL,
            dataset_train_ref TEXT,
            dataset_validation_ref TEXT,
            status TEXT NOT NULL,
            validation_success_rate REAL,
            created_at TEXT NOT NULL
        );",
    )?;
    Ok(())
}

pub fn get_schema_version(conn: &Connection) -> Result<i64> {
    let version: Option<i64> = conn
        .query_row("SELECT MAX(version) FROM schema_version", [], |row| {
            row.get(0)
        })
        .unwrap_or(None);
    Ok(version.unwrap_or(0))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn initializes_cleanly_from_scratch() {
        let conn = Connection::open_in_memory().unwrap();
        initialize_schema(&conn).unwrap();
        assert_eq!(get_schema_version(&conn).unwrap(), 1);
    }

    #[test]
    fn is_idempotent() {
        let conn = Connection::open_in_memory().unwrap();
        initialize_schema(&conn).unwrap();
        initialize_schema(&conn).unwrap();
        assert_eq!(get_schema_version(&conn).unwrap(), 1);
    }

    #[test]
    fn unique_index_rejects_second_current_model() {
        let conn = Connection::open_in_memory().unwrap();
        initialize_schema(&conn).unwrap();
        let insert = |id: &str| {
            conn.execute(
                "INSERT INTO models (model_id, name, kind, provider, use_case, version, status, config_json, metrics_json, resources_json, created_at, updated_at)
                 VALUES (?1, 'n', 'hosted', 'p', 'foundation_layer', 'v1', 'current', '{}', '{}', '{}', '2024-01-01T00:00:00Z', '2024-01-01T00:00:00Z')",
                [id],
            )
        };
        insert("m1").unwrap();
        assert!(insert("m2").is_err());
    }
}
