//! SQLite-backed implementation of the Registry Store contract (§4.1).

use chrono::{DateTime, Utc};
use rusqlite::{params, Row};

use crate::error::{Error, Result};
use crate::storage::Db;
use crate::types::{shallow_merge, ConfigValue, Model, ModelKind, ModelStatus};

fn parse_datetime(s: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| Error::internal(format!("bad timestamp '{s}': {e}")))
}

fn parse_kind(s: &str) -> ModelKind {
    match s {
        "self_served" => ModelKind::SelfServed,
        _ => ModelKind::Hosted,
    }
}

fn kind_str(kind: ModelKind) -> &'static str {
    match kind {
        ModelKind::Hosted => "hosted",
        ModelKind::SelfServed => "self_served",
    }
}

fn row_to_model(row: &Row<'_>) -> rusqlite::Result<Model> {
    let config_json: String = row.get("config_json")?;
    let metrics_json: String = row.get("metrics_json")?;
    let resources_json: String = row.get("resources_json")?;
    let status_str: String = row.get("status")?;
    let kind_str: String = row.get("kind")?;
    let created_at: String = row.get("created_at")?;
    let updated_at: String = row.get("updated_at")?;

    Ok(Model {
        model_id: row.get("model_id")?,
        name: row.get("name")?,
        kind: parse_kind(&kind_str),
        provider: row.get("provider")?,
        use_case: row.get("use_case")?,
        version: row.get("version")?,
        status: ModelStatus::parse(&status_str).unwrap_or(ModelStatus::Failed),
        config: serde_json::from_str(&config_json).unwrap_or(serde_json::json!({})),
        metrics: serde_json::from_str(&metrics_json).unwrap_or(serde_json::json!({})),
        resources: serde_json::from_str(&resources_json).unwrap_or(serde_json::json!({})),
        created_at: parse_datetime(&created_at).unwrap_or_else(|_| Utc::now()),
        updated_at: parse_datetime(&updated_at).unwrap_or_else(|_| Utc::now()),
    })
}

/// The Model Registry (C1). Owns all `Model` records exclusively (§3
/// "Ownership").
#[derive(Clone)]
pub struct RegistryStore {
    db: Db,
}

impl RegistryStore {
    pub fn new(db: Db) -> Self {
        Self { db }
    }

    /// `register(...)` — creates a record in `candidate` (§4.1).
    #[allow(clippy::too_many_arguments)]
    pub fn register(
        &self,
        name: &str,
        kind: ModelKind,
        provider: &str,
        use_case: &str,
        version: &str,
        config: ConfigValue,
        metrics: Option<ConfigValue>,
        resources: Option<ConfigValue>,
    ) -> Result<String> {
        let model_id = Model::new_id();
        let now = Utc::now().to_rfc3339();
        let metrics = metrics.unwrap_or_else(|| serde_json::json!({}));
        let resources = resources.unwrap_or_else(|| serde_json::json!({}));

        self.db.with_conn(|conn| {
            conn.execute(
                "INSERT INTO models (model_id, name, kind, provider, use_case, version, status, config_json, metrics_json, resources_json, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, 'candidate', ?7, ?8, ?9, ?10, ?10)",
                params![
                    model_id,
                    name,
                    kind_str(kind),
                    provider,
                    use_case,
                    version,
                    config.to_string(),
                    metrics.to_string(),
                    resources.to_string(),
                    now,
                ],
            )
        })?;

        tracing::info!(model_id = %model_id, use_case, "model registered as candidate");
        Ok(model_id)
    }

    /// `get(model_id) → Model?`
    pub fn get(&self, model_id: &str) -> Result<Option<Model>> {
        self.db.with_conn(|conn| {
            conn.query_row(
                "SELECT * FROM models WHERE model_id = ?1",
                params![model_id],
                row_to_model,
            )
            .map(Some)
            .or_else(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => Ok(None),
                other => Err(other),
            })
        })
    }

    /// `get_current(use_case) → Model?`. Reads always observe a
    /// self-consistent record thanks to the partial unique index on
    /// `status='current'` (§4.1).
    pub fn get_current(&self, use_case: &str) -> Result<Option<Model>> {
        self.db.with_conn(|conn| {
            conn.query_row(
                "SELECT * FROM models WHERE use_case = ?1 AND status = 'current'",
                params![use_case],
                row_to_model,
            )
            .map(Some)
            .or_else(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => Ok(None),
                other => Err(other),
            })
        })
    }

    /// `list_candidates(use_case) → [Model]`.
    pub fn list_candidates(&self, use_case: &str) -> Result<Vec<Model>> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT * FROM models WHERE use_case = ?1 AND status = 'candidate' ORDER BY created_at DESC",
            )?;
            let rows = stmt.query_map(params![use_case], row_to_model)?;
            rows.collect()
        })
    }

    /// `update_status(model_id, new_status)` (§4.1). Promoting to `current`
    /// atomically demotes the use_case's prior `current` model to
    /// `deprecated` inside one transaction, satisfying the §3/§8 uniqueness
    /// invariant; a concurrent promotion attempt for a different model in
    /// the same use_case surfaces as `Conflict` via the storage-level
    /// unique index.
    pub fn update_status(&self, model_id: &str, new_status: ModelStatus) -> Result<()> {
        let now = Utc::now().to_rfc3339();

        self.db.with_transaction(|tx| {
            let use_case: String = tx
                .query_row(
                    "SELECT use_case FROM models WHERE model_id = ?1",
                    params![model_id],
                    |row| row.get(0),
                )
                .map_err(|e| match e {
                    rusqlite::Error::QueryReturnedNoRows => {
                        Error::not_found(format!("model {model_id}"))
                    }
                    other => Error::from(other),
                })?;

            if new_status == ModelStatus::Current {
                tx.execute(
                    "UPDATE models SET status = 'deprecated', updated_at = ?1
                     WHERE use_case = ?2 AND status = 'current' AND model_id != ?3",
                    params![now, use_case, model_id],
                )
                .map_err(Error::from)?;
            }

            let changed = tx
                .execute(
                    "UPDATE models SET status = ?1, updated_at = ?2 WHERE model_id = ?3",
                    params![new_status.as_str(), now, model_id],
                )
                .map_err(|e| match e {
                    rusqlite::Error::SqliteFailure(err, _)
                        if err.code == rusqlite::ErrorCode::ConstraintViolation =>
                    {
                        Error::conflict(format!(
                            "use_case {use_case} already has a current model"
                        ))
                    }
                    other => Error::from(other),
                })?;

            if changed == 0 {
                return Err(Error::not_found(format!("model {model_id}")));
            }

            tracing::info!(model_id, status = new_status.as_str(), "model status updated");
            Ok(())
        })
    }

    /// Optimistic-concurrency promotion: the caller asserts which model
    /// (if any) it believes is currently `current` for the use_case,
    /// captured at decision time. Promotion proceeds only if that belief
    /// still holds when the transaction runs; otherwise it returns
    /// `Conflict` rather than blindly overwriting a promotion that raced
    /// in ahead of it. This is how two concurrent promotion attempts for
    /// the same use_case (§8 scenario 6) resolve to exactly one winner:
    /// both observe the same prior state, only one's assumption survives
    /// to commit.
    pub fn promote_with_expected_current(
        &self,
        model_id: &str,
        expected_current: Option<&str>,
    ) -> Result<()> {
        let now = Utc::now().to_rfc3339();

        self.db.with_transaction(|tx| {
            let use_case: String = tx
                .query_row(
                    "SELECT use_case FROM models WHERE model_id = ?1",
                    params![model_id],
                    |row| row.get(0),
                )
                .map_err(|e| match e {
                    rusqlite::Error::QueryReturnedNoRows => {
                        Error::not_found(format!("model {model_id}"))
                    }
                    other => Error::from(other),
                })?;

            let actual_current: Option<String> = tx
                .query_row(
                    "SELECT model_id FROM models WHERE use_case = ?1 AND status = 'current'",
                    params![use_case],
                    |row| row.get(0),
                )
                .map(Some)
                .or_else(|e| match e {
                    rusqlite::Error::QueryReturnedNoRows => Ok(None),
                    other => Err(other),
                })
                .map_err(Error::from)?;

            if actual_current.as_deref() != expected_current {
                return Err(Error::conflict(format!(
                    "use_case {use_case} current model changed concurrently"
                )));
            }

            if let Some(prior) = &actual_current {
                if prior != model_id {
                    tx.execute(
                        "UPDATE models SET status = 'deprecated', updated_at = ?1 WHERE model_id = ?2",
                        params![now, prior],
                    )
                    .map_err(Error::from)?;
                }
            }

            tx.execute(
                "UPDATE models SET status = 'current', updated_at = ?1 WHERE model_id = ?2",
                params![now, model_id],
            )
            .map_err(Error::from)?;

            tracing::info!(model_id, use_case, "model promoted to current (CAS)");
            Ok(())
        })
    }

    /// `update_performance(model_id, metrics)` — last-writer-wins, metrics
    /// are advisory (§4.1).
    pub fn update_performance(&self, model_id: &str, metrics: ConfigValue) -> Result<()> {
        let now = Utc::now().to_rfc3339();
        let changed = self.db.with_conn(|conn| {
            conn.execute(
                "UPDATE models SET metrics_json = ?1, updated_at = ?2 WHERE model_id = ?3",
                params![metrics.to_string(), now, model_id],
            )
        })?;
        if changed == 0 {
            return Err(Error::not_found(format!("model {model_id}")));
        }
        Ok(())
    }

    /// `update_config(model_id, patch)` — shallow merge over existing
    /// configuration (§4.1).
    pub fn update_config(&self, model_id: &str, patch: ConfigValue) -> Result<()> {
        let now = Utc::now().to_rfc3339();
        self.db.with_transaction(|tx| {
            let existing: String = tx
                .query_row(
                    "SELECT config_json FROM models WHERE model_id = ?1",
                    params![model_id],
                    |row| row.get(0),
                )
                .map_err(|e| match e {
                    rusqlite::Error::QueryReturnedNoRows => {
                        Error::not_found(format!("model {model_id}"))
                    }
                    other => Error::from(other),
                })?;

            let mut merged: ConfigValue =
                serde_json::from_str(&existing).unwrap_or(serde_json::json!({}));
            shallow_merge(&mut merged, &patch);

            tx.execute(
                "UPDATE models SET config_json = ?1, updated_at = ?2 WHERE model_id = ?3",
                params![merged.to_string(), now, model_id],
            )
            .map_err(Error::from)?;
            Ok(())
        })
    }
}
