//! Fine-Tuning Orchestrator (C9, §4.9): builds a training dataset from
//! historical logs plus seed examples, submits a job to the training
//! backend, registers the result as a candidate model, and validates it
//! before promotion is left to the Deployment Manager.

use std::sync::Arc;

use chrono::Duration;

use crate::error::{Error, Result};
use crate::historylog::HistoricalLogStore;
use crate::llm::LlmClient;
use crate::registry::RegistryStore;
use crate::types::{
    FineTuneMethod, FineTuneStatus, Hyperparameters, ModelKind, ModelStatus,
};

use super::dataset::{self, ChatTemplate, TrainingExample};
use super::object_store::{ObjectStore, TrainingBackend, TrainingJobSpec};
use super::store::FineTuneJobStore;

const DEFAULT_LOG_WINDOW_DAYS: i64 = 30;
const MAX_COLLECTED_LOGS: u32 = 10_000;
const MAX_VALIDATION_PROMPTS: usize = 10;
const VALIDATION_PASS_RATE: f64 = 0.80;

fn detect_instance_type(base_model_name: &str) -> &'static str {
    let lower = base_model_name.to_lowercase();
    if lower.contains("70b") {
        "gpu.heavy"
    } else if lower.contains("13b") {
        "gpu.mid"
    } else {
        "gpu.small"
    }
}

fn lora_hyperparameters(instance_type: &str) -> Hyperparameters {
    Hyperparameters {
        method: FineTuneMethod::Lora,
        learning_rate: 2e-4,
        epochs: 3,
        batch_size: 4,
        gradient_accumulation: Some(4),
        max_seq_len: Some(2048),
        lora_rank: Some(64),
        lora_alpha: Some(32),
        target_modules: Some(vec![
            "q_proj".into(),
            "k_proj".into(),
            "v_proj".into(),
            "o_proj".into(),
            "gate_proj".into(),
            "up_proj".into(),
            "down_proj".into(),
        ]),
        instance_type: instance_type.to_string(),
    }
}

fn full_hyperparameters(instance_type: &str) -> Hyperparameters {
    Hyperparameters {
        method: FineTuneMethod::Full,
        learning_rate: 1e-5,
        epochs: 3,
        batch_size: 2,
        gradient_accumulation: None,
        max_seq_len: None,
        lora_rank: None,
        lora_alpha: None,
        target_modules: None,
        instance_type: instance_type.to_string(),
    }
}

/// §4.9 step 11: adjustments applied to hyperparameters on a failed
/// validation, before the single permitted retry.
fn adjusted_for_retry(mut hyperparameters: Hyperparameters) -> Hyperparameters {
    hyperparameters.learning_rate *= 0.5;
    hyperparameters.batch_size = (hyperparameters.batch_size / 2).max(1);
    hyperparameters.epochs += 1;
    hyperparameters
}

/// The Fine-Tuning Orchestrator (C9).
pub struct FineTuneOrchestrator {
    registry: RegistryStore,
    logs: HistoricalLogStore,
    jobs: FineTuneJobStore,
    llm: Arc<LlmClient>,
    object_store: Arc<dyn ObjectStore>,
    training_backend: Arc<dyn TrainingBackend>,
    bucket: String,
}

impl FineTuneOrchestrator {
    pub fn new(
        registry: RegistryStore,
        logs: HistoricalLogStore,
        jobs: FineTuneJobStore,
        llm: Arc<LlmClient>,
        object_store: Arc<dyn ObjectStore>,
        training_backend: Arc<dyn TrainingBackend>,
        bucket: impl Into<String>,
    ) -> Self {
        Self {
            registry,
            logs,
            jobs,
            llm,
            object_store,
            training_backend,
            bucket: bucket.into(),
        }
    }

    fn build_dataset(
        &self,
        base_model_id: &str,
        use_case: &str,
        log_window: Duration,
        seed_examples: Vec<TrainingExample>,
    ) -> Result<Vec<TrainingExample>> {
        let range = crate::historylog::TimeRange::last(log_window);
        let logs = self.logs.query(
            Some(base_model_id),
            Some(use_case),
            Some(&range),
            MAX_COLLECTED_LOGS,
        )?;

        let examples: Vec<TrainingExample> = logs.iter().map(dataset::transform).collect();
        let filtered = dataset::filter_by_quality(examples);
        Ok(dataset::merge_and_dedupe(filtered, seed_examples))
    }

    async fn upload_dataset(
        &self,
        job_id: &str,
        train: &[TrainingExample],
        validation: &[TrainingExample],
        template: ChatTemplate,
    ) -> Result<(String, String)> {
        let timestamp = chrono::Utc::now().format("%Y%m%dT%H%M%SZ");
        let prefix = format!("finetune/{job_id}/{timestamp}");

        let train_key = format!("{prefix}/train.jsonl");
        let validation_key = format!("{prefix}/validation.jsonl");

        let train_ref = self
            .object_store
            .put(&train_key, dataset::to_jsonl(train, template).as_bytes())
            .await?;
        let validation_ref = self
            .object_store
            .put(&validation_key, dataset::to_jsonl(validation, template).as_bytes())
            .await?;

        Ok((train_ref, validation_ref))
    }

    /// Runs the validation prompts against the new model and returns the
    /// observed success rate (§4.9 step 10). A "successful" call is one
    /// the LLM Client reports as `success: true` and not a fallback.
    async fn validate(&self, use_case: &str, validation: &[TrainingExample]) -> Result<f64> {
        let prompts: Vec<&TrainingExample> = validation.iter().take(MAX_VALIDATION_PROMPTS).collect();
        if prompts.is_empty() {
            return Ok(0.0);
        }

        let mut successful = 0usize;
        for example in &prompts {
            let request = crate::llm::GenerateRequest::new(use_case, example.input.clone()).without_cache();
            let response = self.llm.generate(request).await?;
            if response.success && !response.fallback {
                successful += 1;
            }
        }

        Ok(successful as f64 / prompts.len() as f64)
    }

    async fn run_attempt(
        &self,
        job_id: &str,
        base_model_id: &str,
        use_case: &str,
        hyperparameters: Hyperparameters,
        train: &[TrainingExample],
        validation: &[TrainingExample],
        template: ChatTemplate,
    ) -> Result<f64> {
        self.jobs.set_hyperparameters(job_id, &hyperparameters)?;
        self.jobs.update_status(job_id, FineTuneStatus::Training)?;

        let (train_ref, validation_ref) = self.upload_dataset(job_id, train, validation, template).await?;
        self.jobs.set_dataset_refs(job_id, &train_ref, &validation_ref)?;

        let remote_handle = self
            .training_backend
            .submit(TrainingJobSpec {
                base_model_id: base_model_id.to_string(),
                train_ref,
                validation_ref,
                hyperparameters,
            })
            .await?;
        self.jobs.set_remote_handle(job_id, &remote_handle)?;

        self.jobs.update_status(job_id, FineTuneStatus::Validating)?;
        self.validate(use_case, validation).await
    }

    /// `fine_tune(base_model_id, use_case, log_window?, seed_examples?) →
    /// FineTuneJob` (§4.9).
    pub async fn fine_tune(
        &self,
        base_model_id: &str,
        use_case: &str,
        log_window: Option<Duration>,
        seed_examples: Option<Vec<TrainingExample>>,
    ) -> Result<crate::types::FineTuneJob> {
        let base_model = self
            .registry
            .get(base_model_id)?
            .ok_or_else(|| Error::not_found(format!("model {base_model_id}")))?;

        let window = log_window.unwrap_or_else(|| Duration::days(DEFAULT_LOG_WINDOW_DAYS));
        let examples = self.build_dataset(
            base_model_id,
            use_case,
            window,
            seed_examples.unwrap_or_default(),
        )?;

        let instance_type = detect_instance_type(&base_model.name);
        let supports_lora = base_model.kind == ModelKind::SelfServed;
        let mut hyperparameters = if supports_lora {
            lora_hyperparameters(instance_type)
        } else {
            full_hyperparameters(instance_type)
        };

        let job_id = self.jobs.create(base_model_id, use_case, &hyperparameters)?;
        let seed = dataset::seed_from_job_id(&job_id);
        let (train, validation) = dataset::split(examples, seed);
        let template = ChatTemplate::detect(&base_model.name);

        let candidate_id = self.registry.register(
            &format!("{}-ft-{}", base_model.name, &job_id[..8]),
            base_model.kind,
            &base_model.provider,
            use_case,
            &format!("{}-ft", base_model.version),
            serde_json::json!({"fine_tune_job_id": job_id}),
            None,
            None,
        )?;

        let mut success_rate = self
            .run_attempt(
                &job_id,
                base_model_id,
                use_case,
                hyperparameters.clone(),
                &train,
                &validation,
                template,
            )
            .await?;

        if success_rate < VALIDATION_PASS_RATE {
            tracing::warn!(job_id = %job_id, success_rate, "fine-tune validation failed, retrying once");
            hyperparameters = adjusted_for_retry(hyperparameters);
            success_rate = self
                .run_attempt(&job_id, base_model_id, use_case, hyperparameters, &train, &validation, template)
                .await?;
        }

        let final_status = if success_rate >= VALIDATION_PASS_RATE {
            self.registry.update_status(&candidate_id, ModelStatus::Candidate)?;
            FineTuneStatus::Promoted
        } else {
            self.registry.update_status(&candidate_id, ModelStatus::Failed)?;
            FineTuneStatus::Failed
        };

        self.jobs.record_validation(&job_id, success_rate, final_status)?;
        self.jobs
            .get(&job_id)?
            .ok_or_else(|| Error::internal(format!("fine-tune job {job_id} vanished after recording")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::{CircuitBreakerConfig, CircuitBreakerRegistry, CostBenefitRouter, FallbackTemplates, ResponseCache};
    use crate::storage::Db;
    use crate::types::ModelKind;

    fn orchestrator(db: Db) -> (FineTuneOrchestrator, RegistryStore, HistoricalLogStore) {
        let registry = RegistryStore::new(db.clone());
        let logs = HistoricalLogStore::new(db.clone());
        let jobs = FineTuneJobStore::new(db.clone());
        let router = CostBenefitRouter::new(registry.clone(), logs.clone());
        let cache = ResponseCache::new(3600);
        let breakers = Arc::new(CircuitBreakerRegistry::new(CircuitBreakerConfig::default()));
        let llm = Arc::new(LlmClient::new(
            registry.clone(),
            logs.clone(),
            router,
            cache,
            breakers,
            FallbackTemplates::default(),
        ));
        let object_store: Arc<dyn ObjectStore> =
            Arc::new(super::super::object_store::InMemoryObjectStore::new("bucket"));
        let training_backend: Arc<dyn TrainingBackend> =
            Arc::new(super::super::object_store::NullTrainingBackend);
        let orchestrator = FineTuneOrchestrator::new(
            registry.clone(),
            logs.clone(),
            jobs,
            llm,
            object_store,
            training_backend,
            "bucket",
        );
        (orchestrator, registry, logs)
    }

    #[tokio::test]
    async fn fine_tune_with_no_logs_yields_failed_job() {
        let (orchestrator, registry, _logs) = orchestrator(Db::in_memory().unwrap());
        let base_model_id = registry
            .register(
                "self-served-7b",
                ModelKind::SelfServed,
                "internal",
                "dialogue",
                "v1",
                serde_json::json!({}),
                None,
                None,
            )
            .unwrap();

        let job = orchestrator
            .fine_tune(&base_model_id, "dialogue", None, None)
            .await
            .unwrap();

        // No logs and no seed examples ⇒ empty validation set ⇒ 0.0 success rate.
        assert_eq!(job.status, FineTuneStatus::Failed);
        assert_eq!(job.validation_success_rate, Some(0.0));
    }

    #[tokio::test]
    async fn hosted_closed_api_base_model_uses_full_fine_tune() {
        let (orchestrator, registry, _logs) = orchestrator(Db::in_memory().unwrap());
        let base_model_id = registry
            .register(
                "hosted-provider-model",
                ModelKind::Hosted,
                "anthropic",
                "dialogue",
                "v1",
                serde_json::json!({}),
                None,
                None,
            )
            .unwrap();

        let job = orchestrator
            .fine_tune(&base_model_id, "dialogue", None, None)
            .await
            .unwrap();
        assert_eq!(job.hyperparameters.method, FineTuneMethod::Full);
    }

    #[test]
    fn instance_type_scales_with_model_name() {
        assert_eq!(detect_instance_type("llama-70b-chat"), "gpu.heavy");
        assert_eq!(detect_instance_type("llama-13b-chat"), "gpu.mid");
        assert_eq!(detect_instance_type("llama-7b-chat"), "gpu.small");
    }
}
