//! Persistence for [`crate::types::Deployment`] records.

use chrono::Utc;
use rusqlite::{params, Row};

use crate::error::Result;
use crate::storage::Db;
use crate::types::{Deployment, DeploymentStatus, DeploymentStrategy};

fn strategy_str(strategy: DeploymentStrategy) -> &'static str {
    strategy.as_str()
}

fn parse_strategy(s: &str) -> DeploymentStrategy {
    match s {
        "canary" => DeploymentStrategy::Canary,
        "all_at_once" => DeploymentStrategy::AllAtOnce,
        "rollback" => DeploymentStrategy::Rollback,
        _ => DeploymentStrategy::BlueGreen,
    }
}

fn status_str(status: DeploymentStatus) -> &'static str {
    status.as_str()
}

fn parse_status(s: &str) -> DeploymentStatus {
    match s {
        "completed" => DeploymentStatus::Completed,
        "failed" => DeploymentStatus::Failed,
        "rolled_back" => DeploymentStatus::RolledBack,
        _ => DeploymentStatus::InProgress,
    }
}

fn row_to_deployment(row: &Row<'_>) -> rusqlite::Result<Deployment> {
    let strategy: String = row.get("strategy")?;
    let status: String = row.get("status")?;
    let start_time: String = row.get("start_time")?;
    let complete_time: Option<String> = row.get("complete_time")?;

    Ok(Deployment {
        deployment_id: row.get("deployment_id")?,
        model_id: row.get("model_id")?,
        strategy: parse_strategy(&strategy),
        status: parse_status(&status),
        traffic_percentage: row.get("traffic_percentage")?,
        start_time: chrono::DateTime::parse_from_rfc3339(&start_time)
            .map(|dt| dt.with_timezone(&Utc))
            .unwrap_or_else(|_| Utc::now()),
        complete_time: complete_time.and_then(|s| {
            chrono::DateTime::parse_from_rfc3339(&s)
                .map(|dt| dt.with_timezone(&Utc))
                .ok()
        }),
        rollback_reason: row.get("rollback_reason")?,
    })
}

#[derive(Clone)]
pub struct DeploymentStore {
    db: Db,
}

impl DeploymentStore {
    pub fn new(db: Db) -> Self {
        Self { db }
    }

    pub fn create(&self, model_id: &str, strategy: DeploymentStrategy) -> Result<String> {
        let deployment_id = uuid::Uuid::new_v4().to_string();
        let now = Utc::now().to_rfc3339();

        self.db.with_conn(|conn| {
            conn.execute(
                "INSERT INTO deployments (deployment_id, model_id, strategy, status, traffic_percentage, start_time, complete_time, rollback_reason)
                 VALUES (?1, ?2, ?3, 'in_progress', 0.0, ?4, NULL, NULL)",
                params![deployment_id, model_id, strategy_str(strategy), now],
            )
        })?;

        Ok(deployment_id)
    }

    pub fn update_traffic(&self, deployment_id: &str, traffic_percentage: f64) -> Result<()> {
        self.db.with_conn(|conn| {
            conn.execute(
                "UPDATE deployments SET traffic_percentage = ?1 WHERE deployment_id = ?2",
                params![traffic_percentage, deployment_id],
            )
        })?;
        Ok(())
    }

    pub fn mark_completed(&self, deployment_id: &str) -> Result<()> {
        let now = Utc::now().to_rfc3339();
        self.db.with_conn(|conn| {
            conn.execute(
                "UPDATE deployments SET status = 'completed', traffic_percentage = 100.0, complete_time = ?1 WHERE deployment_id = ?2",
                params![now, deployment_id],
            )
        })?;
        Ok(())
    }

    pub fn mark_rolled_back(&self, deployment_id: &str, reason: &str) -> Result<()> {
        let now = Utc::now().to_rfc3339();
        self.db.with_conn(|conn| {
            conn.execute(
                "UPDATE deployments SET status = 'rolled_back', complete_time = ?1, rollback_reason = ?2 WHERE deployment_id = ?3",
                params![now, reason, deployment_id],
            )
        })?;
        Ok(())
    }

    /// Writes an already-completed `rollback`-strategy Deployment record
    /// (§4.7: "writes a synthetic Deployment record of type `rollback`
    /// with the captured traffic percentage"). The restore itself has
    /// already happened by the time this is called, so the record is
    /// inserted directly as `completed` rather than `in_progress`.
    pub fn record_rollback(&self, model_id: &str, traffic_percentage: f64, reason: &str) -> Result<String> {
        let deployment_id = uuid::Uuid::new_v4().to_string();
        let now = Utc::now().to_rfc3339();

        self.db.with_conn(|conn| {
            conn.execute(
                "INSERT INTO deployments (deployment_id, model_id, strategy, status, traffic_percentage, start_time, complete_time, rollback_reason)
                 VALUES (?1, ?2, 'rollback', 'completed', ?3, ?4, ?4, ?5)",
                params![deployment_id, model_id, traffic_percentage, now, reason],
            )
        })?;

        Ok(deployment_id)
    }

    pub fn get(&self, deployment_id: &str) -> Result<Option<Deployment>> {
        self.db.with_conn(|conn| {
            conn.query_row(
                "SELECT * FROM deployments WHERE deployment_id = ?1",
                params![deployment_id],
                row_to_deployment,
            )
            .map(Some)
            .or_else(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => Ok(None),
                other => Err(other),
            })
        })
    }
}
