//! Persistence for [`crate::types::Snapshot`] records.

use chrono::Utc;
use rusqlite::{params, Row};

use crate::error::Result;
use crate::storage::Db;
use crate::types::Snapshot;

fn row_to_snapshot(row: &Row<'_>) -> rusqlite::Result<Snapshot> {
    let config_json: String = row.get("config_json")?;
    let metrics_json: String = row.get("metrics_json")?;
    let created_at: String = row.get("created_at")?;

    Ok(Snapshot {
        snapshot_id: row.get("snapshot_id")?,
        model_id: row.get("model_id")?,
        config: serde_json::from_str(&config_json).unwrap_or(serde_json::json!({})),
        metrics: serde_json::from_str(&metrics_json).unwrap_or(serde_json::json!({})),
        traffic_percentage: row.get("traffic_percentage")?,
        artifact_location: row.get("artifact_location")?,
        created_at: chrono::DateTime::parse_from_rfc3339(&created_at)
            .map(|dt| dt.with_timezone(&Utc))
            .unwrap_or_else(|_| Utc::now()),
    })
}

#[derive(Clone)]
pub struct SnapshotStore {
    db: Db,
}

impl SnapshotStore {
    pub fn new(db: Db) -> Self {
        Self { db }
    }

    #[allow(clippy::too_many_arguments)]
    pub fn save(
        &self,
        model_id: &str,
        config: serde_json::Value,
        metrics: serde_json::Value,
        traffic_percentage: f64,
        artifact_location: Option<&str>,
    ) -> Result<String> {
        let snapshot_id = uuid::Uuid::new_v4().to_string();
        let now = Utc::now().to_rfc3339();

        self.db.with_conn(|conn| {
            conn.execute(
                "INSERT INTO snapshots (snapshot_id, model_id, config_json, metrics_json, traffic_percentage, artifact_location, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    snapshot_id,
                    model_id,
                    config.to_string(),
                    metrics.to_string(),
                    traffic_percentage,
                    artifact_location,
                    now,
                ],
            )
        })?;

        Ok(snapshot_id)
    }

    pub fn get(&self, snapshot_id: &str) -> Result<Option<Snapshot>> {
        self.db.with_conn(|conn| {
            conn.query_row(
                "SELECT * FROM snapshots WHERE snapshot_id = ?1",
                params![snapshot_id],
                row_to_snapshot,
            )
            .map(Some)
            .or_else(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => Ok(None),
                other => Err(other),
            })
        })
    }

    pub fn latest_for_model(&self, model_id: &str) -> Result<Option<Snapshot>> {
        self.db.with_conn(|conn| {
            conn.query_row(
                "SELECT * FROM snapshots WHERE model_id = ?1 ORDER BY created_at DESC LIMIT 1",
                params![model_id],
                row_to_snapshot,
            )
            .map(Some)
            .or_else(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => Ok(None),
                other => Err(other),
            })
        })
    }
}
