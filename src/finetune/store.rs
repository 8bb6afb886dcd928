//! Persistence for [`crate::types::FineTuneJob`] records.

use chrono::Utc;
use rusqlite::{params, Row};

use crate::error::Result;
use crate::storage::Db;
use crate::types::{FineTuneJob, FineTuneMethod, FineTuneStatus, Hyperparameters};

fn method_str(method: FineTuneMethod) -> &'static str {
    match method {
        FineTuneMethod::Lora => "lora",
        FineTuneMethod::Full => "full",
    }
}

fn parse_method(s: &str) -> FineTuneMethod {
    match s {
        "full" => FineTuneMethod::Full,
        _ => FineTuneMethod::Lora,
    }
}

fn status_str(status: FineTuneStatus) -> &'static str {
    match status {
        FineTuneStatus::Preparing => "preparing",
        FineTuneStatus::Training => "training",
        FineTuneStatus::Validating => "validating",
        FineTuneStatus::Promoted => "promoted",
        FineTuneStatus::Failed => "failed",
    }
}

fn parse_status(s: &str) -> FineTuneStatus {
    match s {
        "training" => FineTuneStatus::Training,
        "validating" => FineTuneStatus::Validating,
        "promoted" => FineTuneStatus::Promoted,
        "failed" => FineTuneStatus::Failed,
        _ => FineTuneStatus::Preparing,
    }
}

#[derive(serde::Serialize, serde::Deserialize)]
struct HyperparametersRow {
    method: String,
    learning_rate: f64,
    epochs: u32,
    batch_size: u32,
    gradient_accumulation: Option<u32>,
    max_seq_len: Option<u32>,
    lora_rank: Option<u32>,
    lora_alpha: Option<u32>,
    target_modules: Option<Vec<String>>,
    instance_type: String,
}

fn hyperparameters_to_json(h: &Hyperparameters) -> String {
    let row = HyperparametersRow {
        method: method_str(h.method).to_string(),
        learning_rate: h.learning_rate,
        epochs: h.epochs,
        batch_size: h.batch_size,
        gradient_accumulation: h.gradient_accumulation,
        max_seq_len: h.max_seq_len,
        lora_rank: h.lora_rank,
        lora_alpha: h.lora_alpha,
        target_modules: h.target_modules.clone(),
        instance_type: h.instance_type.clone(),
    };
    serde_json::to_string(&row).unwrap_or_default()
}

fn hyperparameters_from_json(raw: &str) -> Hyperparameters {
    let row: HyperparametersRow = serde_json::from_str(raw).unwrap_or(HyperparametersRow {
        method: "lora".into(),
        learning_rate: 2e-4,
        epochs: 3,
        batch_size: 4,
        gradient_accumulation: None,
        max_seq_len: None,
        lora_rank: None,
        lora_alpha: None,
        target_modules: None,
        instance_type: "small".into(),
    });
    Hyperparameters {
        method: parse_method(&row.method),
        learning_rate: row.learning_rate,
        epochs: row.epochs,
        batch_size: row.batch_size,
        gradient_accumulation: row.gradient_accumulation,
        max_seq_len: row.max_seq_len,
        lora_rank: row.lora_rank,
        lora_alpha: row.lora_alpha,
        target_modules: row.target_modules,
        instance_type: row.instance_type,
    }
}

fn row_to_job(row: &Row<'_>) -> rusqlite::Result<FineTuneJob> {
    let hyperparameters_json: String = row.get("hyperparameters_json")?;
    let status: String = row.get("status")?;
    let created_at: String = row.get("created_at")?;

    Ok(FineTuneJob {
        job_id: row.get("job_id")?,
        base_model_id: row.get("base_model_id")?,
        use_case: row.get("use_case")?,
        remote_handle: row.get("remote_handle")?,
        hyperparameters: hyperparameters_from_json(&hyperparameters_json),
        dataset_train_ref: row.get("dataset_train_ref")?,
        dataset_validation_ref: row.get("dataset_validation_ref")?,
        status: parse_status(&status),
        validation_success_rate: row.get("validation_success_rate")?,
        created_at: chrono::DateTime::parse_from_rfc3339(&created_at)
            .map(|dt| dt.with_timezone(&Utc))
            .unwrap_or_else(|_| Utc::now()),
    })
}

#[derive(Clone)]
pub struct FineTuneJobStore {
    db: Db,
}

impl FineTuneJobStore {
    pub fn new(db: Db) -> Self {
        Self { db }
    }

    pub fn create(
        &self,
        base_model_id: &str,
        use_case: &str,
        hyperparameters: &Hyperparameters,
    ) -> Result<String> {
        let job_id = uuid::Uuid::new_v4().to_string();
        let now = Utc::now().to_rfc3339();

        self.db.with_conn(|conn| {
            conn.execute(
                "INSERT INTO finetune_jobs (job_id, base_model_id, use_case, remote_handle, hyperparameters_json, dataset_train_ref, dataset_validation_ref, status, validation_success_rate, created_at)
                 VALUES (?1, ?2, ?3, NULL, ?4, NULL, NULL, 'preparing', NULL, ?5)",
                params![job_id, base_model_id, use_case, hyperparameters_to_json(hyperparameters), now],
            )
        })?;

        Ok(job_id)
    }

    pub fn set_dataset_refs(&self, job_id: &str, train_ref: &str, validation_ref: &str) -> Result<()> {
        self.db.with_conn(|conn| {
            conn.execute(
                "UPDATE finetune_jobs SET dataset_train_ref = ?1, dataset_validation_ref = ?2 WHERE job_id = ?3",
                params![train_ref, validation_ref, job_id],
            )
        })?;
        Ok(())
    }

    pub fn set_remote_handle(&self, job_id: &str, remote_handle: &str) -> Result<()> {
        self.db.with_conn(|conn| {
            conn.execute(
                "UPDATE finetune_jobs SET remote_handle = ?1 WHERE job_id = ?2",
                params![remote_handle, job_id],
            )
        })?;
        Ok(())
    }

    pub fn update_status(&self, job_id: &str, status: FineTuneStatus) -> Result<()> {
        self.db.with_conn(|conn| {
            conn.execute(
                "UPDATE finetune_jobs SET status = ?1 WHERE job_id = ?2",
                params![status_str(status), job_id],
            )
        })?;
        Ok(())
    }

    pub fn set_hyperparameters(&self, job_id: &str, hyperparameters: &Hyperparameters) -> Result<()> {
        self.db.with_conn(|conn| {
            conn.execute(
                "UPDATE finetune_jobs SET hyperparameters_json = ?1 WHERE job_id = ?2",
                params![hyperparameters_to_json(hyperparameters), job_id],
            )
        })?;
        Ok(())
    }

    pub fn record_validation(&self, job_id: &str, success_rate: f64, status: FineTuneStatus) -> Result<()> {
        self.db.with_conn(|conn| {
            conn.execute(
                "UPDATE finetune_jobs SET validation_success_rate = ?1, status = ?2 WHERE job_id = ?3",
                params![success_rate, status_str(status), job_id],
            )
        })?;
        Ok(())
    }

    pub fn get(&self, job_id: &str) -> Result<Option<FineTuneJob>> {
        self.db.with_conn(|conn| {
            conn.query_row(
                "SELECT * FROM finetune_jobs WHERE job_id = ?1",
                params![job_id],
                row_to_job,
            )
            .map(Some)
            .or_else(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => Ok(None),
                other => Err(other),
            })
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::Db;

    fn sample_hyperparameters() -> Hyperparameters {
        Hyperparameters {
            method: FineTuneMethod::Lora,
            learning_rate: 2e-4,
            epochs: 3,
            batch_size: 4,
            gradient_accumulation: Some(4),
            max_seq_len: Some(2048),
            lora_rank: Some(64),
            lora_alpha: Some(32),
            target_modules: Some(vec!["q_proj".into(), "v_proj".into()]),
            instance_type: "mid".into(),
        }
    }

    #[test]
    fn create_then_get_round_trips_hyperparameters() {
        let store = FineTuneJobStore::new(Db::in_memory().unwrap());
        let job_id = store.create("base-1", "dialogue", &sample_hyperparameters()).unwrap();
        let job = store.get(&job_id).unwrap().unwrap();
        assert_eq!(job.status, FineTuneStatus::Preparing);
        assert_eq!(job.hyperparameters.lora_rank, Some(64));
        assert_eq!(job.hyperparameters.target_modules.unwrap().len(), 2);
    }

    #[test]
    fn record_validation_updates_success_rate_and_status() {
        let store = FineTuneJobStore::new(Db::in_memory().unwrap());
        let job_id = store.create("base-1", "dialogue", &sample_hyperparameters()).unwrap();
        store.record_validation(&job_id, 0.85, FineTuneStatus::Promoted).unwrap();
        let job = store.get(&job_id).unwrap().unwrap();
        assert_eq!(job.validation_success_rate, Some(0.85));
        assert_eq!(job.status, FineTuneStatus::Promoted);
    }
}
