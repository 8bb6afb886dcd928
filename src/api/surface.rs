//! Public API surface (C11, §4.11/§6): thin request/reply bindings over
//! C1-C10 for game services. Holds no business logic of its own beyond
//! admin-key gating and the operation table's request/response shapes.

use std::sync::Arc;

use chrono::Duration;
use serde::{Deserialize, Serialize};

use crate::config::Config;
use crate::deployment::DeploymentManager;
use crate::error::{Error, Result};
use crate::finetune::{FineTuneOrchestrator, TrainingExample};
use crate::guardrails::{DefaultInterventionHandler, GuardrailsMonitor, MonitoringResult};
use crate::historylog::HistoricalLogStore;
use crate::llm::{GenerateRequest, GenerateResponse, LlmClient};
use crate::registry::RegistryStore;
use crate::rollback::RollbackManager;
use crate::types::{DeploymentStrategy, FineTuneStatus, Model, ModelKind, ModelStatus};

/// A hand-authored seed example for fine-tuning (§6 "Fine-tune" request
/// field `seed?`). Treated as already-correct output, quality 1.0.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SeedExample {
    pub input: String,
    pub output: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct RegisterModelResponse {
    pub model_id: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct CheckForBetterResponse {
    pub better_found: bool,
    pub better_model_id: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct DeployResponse {
    pub success: bool,
    pub deployment_id: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct RollbackResponse {
    pub success: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct FineTuneResponse {
    pub job_id: String,
    pub status: FineTuneStatus,
}

#[derive(Debug, Clone, Serialize)]
pub struct ServiceStatusResponse {
    pub llm_services: Vec<String>,
    pub service_health: String,
    pub performance_metrics: ServicePerformanceSnapshot,
}

#[derive(Debug, Clone, Serialize, Default)]
pub struct ServicePerformanceSnapshot {
    pub cache_hit_rate: f64,
    pub cache_total_requests: u64,
}

fn parse_strategy(raw: &str) -> Result<DeploymentStrategy> {
    match raw {
        "blue_green" => Ok(DeploymentStrategy::BlueGreen),
        "canary" => Ok(DeploymentStrategy::Canary),
        "all_at_once" => Ok(DeploymentStrategy::AllAtOnce),
        other => Err(Error::invalid_argument(format!("unknown deployment strategy {other}"))),
    }
}

/// The Public API surface (C11). Wraps C1-C10 with the §6 request/reply
/// shapes and the admin-key gate described there.
pub struct ControlPlane {
    registry: RegistryStore,
    logs: HistoricalLogStore,
    guardrails: GuardrailsMonitor,
    llm: Arc<LlmClient>,
    rollback: Arc<RollbackManager>,
    deployment: Arc<DeploymentManager>,
    finetune: Arc<FineTuneOrchestrator>,
    config: Config,
}

impl ControlPlane {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        registry: RegistryStore,
        logs: HistoricalLogStore,
        guardrails: GuardrailsMonitor,
        llm: Arc<LlmClient>,
        rollback: Arc<RollbackManager>,
        deployment: Arc<DeploymentManager>,
        finetune: Arc<FineTuneOrchestrator>,
        config: Config,
    ) -> Self {
        Self {
            registry,
            logs,
            guardrails,
            llm,
            rollback,
            deployment,
            finetune,
            config,
        }
    }

    /// Same rollback/mark-needs-review wiring the Meta-Management Loop uses
    /// for its own `monitor_and_intervene` calls, built fresh per call since
    /// it only closes over cheap `Arc`/clone handles.
    fn default_handler(&self) -> DefaultInterventionHandler {
        let rollback = self.rollback.clone();
        let registry = self.registry.clone();
        DefaultInterventionHandler {
            rollback: Arc::new(move |model_id: &str| {
                let rollback = rollback.clone();
                let model_id = model_id.to_string();
                Box::pin(async move {
                    rollback.rollback(&model_id, None)?;
                    Ok(())
                })
            }),
            mark_needs_review: Arc::new(move |model_id: &str| {
                let registry = registry.clone();
                let model_id = model_id.to_string();
                Box::pin(async move {
                    registry.update_status(&model_id, ModelStatus::NeedsReview)?;
                    registry.update_config(&model_id, serde_json::json!({"block_outputs": true}))?;
                    Ok(())
                })
            }),
        }
    }

    /// §6 "Admin authentication": empty allowlist ⇒ `unavailable` for every
    /// admin route; a key absent from a populated allowlist ⇒
    /// `invalid_argument` (the crate's `Error` has no distinct unauthorized
    /// variant, so a rejected credential is modeled as a malformed
    /// request — never retried).
    fn require_admin(&self, admin_key: &str) -> Result<()> {
        if self.config.admin_keys.is_empty() {
            return Err(Error::unavailable("admin routes disabled: no admin keys configured"));
        }
        if !self.config.is_admin_key_allowed(admin_key) {
            return Err(Error::invalid_argument("invalid admin key"));
        }
        Ok(())
    }

    /// `Generate` (§6). No admin gate — this is the game-service hot path.
    pub async fn generate(&self, request: GenerateRequest) -> Result<GenerateResponse> {
        self.llm.generate(request).await
    }

    /// `Register model` (§6).
    #[allow(clippy::too_many_arguments)]
    pub fn register_model(
        &self,
        admin_key: &str,
        name: &str,
        kind: ModelKind,
        provider: &str,
        use_case: &str,
        version: &str,
        config: serde_json::Value,
        metrics: Option<serde_json::Value>,
        resources: Option<serde_json::Value>,
    ) -> Result<RegisterModelResponse> {
        self.require_admin(admin_key)?;
        let model_id = self
            .registry
            .register(name, kind, provider, use_case, version, config, metrics, resources)?;
        Ok(RegisterModelResponse { model_id })
    }

    /// `Get current` (§6).
    pub fn get_current(&self, use_case: &str) -> Result<Option<Model>> {
        self.registry.get_current(use_case)
    }

    /// `List candidates` (§6).
    pub fn list_candidates(&self, use_case: &str) -> Result<Vec<Model>> {
        self.registry.list_candidates(use_case)
    }

    /// `Check-for-better` (§6). A direct existence check over registered
    /// candidates rather than a full Cost-Benefit Router scoring pass —
    /// the request shape carries no task context or priority for the
    /// router to score against, so this reports whether *any* non-current
    /// candidate exists for the use_case.
    pub fn check_for_better(&self, use_case: &str, current_model_id: &str) -> Result<CheckForBetterResponse> {
        let better = self
            .registry
            .list_candidates(use_case)?
            .into_iter()
            .find(|m| m.model_id != current_model_id);
        Ok(CheckForBetterResponse {
            better_found: better.is_some(),
            better_model_id: better.map(|m| m.model_id),
        })
    }

    /// `Deploy` (§6).
    pub async fn deploy(
        &self,
        admin_key: &str,
        new_model_id: &str,
        current_model_id: &str,
        strategy: &str,
    ) -> Result<DeployResponse> {
        self.require_admin(admin_key)?;
        let strategy = parse_strategy(strategy)?;
        let success = self
            .deployment
            .deploy(new_model_id, current_model_id, strategy, crate::deployment::never_cancel())
            .await?;
        Ok(DeployResponse {
            success,
            deployment_id: new_model_id.to_string(),
        })
    }

    /// `Rollback` (§6). `reason` is accepted for the request shape but the
    /// Rollback Manager derives its own verification-failure reasoning;
    /// it is only used for the log line here.
    pub fn rollback(
        &self,
        admin_key: &str,
        model_id: &str,
        snapshot_id: Option<&str>,
        reason: Option<&str>,
    ) -> Result<RollbackResponse> {
        self.require_admin(admin_key)?;
        if let Some(reason) = reason {
            tracing::info!(model_id, reason, "rollback requested via API");
        }
        let success = self.rollback.rollback(model_id, snapshot_id)?;
        Ok(RollbackResponse { success })
    }

    /// `Fine-tune` (§6).
    pub async fn fine_tune(
        &self,
        admin_key: &str,
        base_model_id: &str,
        use_case: &str,
        log_window_days: Option<i64>,
        seed: Option<Vec<SeedExample>>,
    ) -> Result<FineTuneResponse> {
        self.require_admin(admin_key)?;
        let window = log_window_days.map(Duration::days);
        let seed_examples = seed.map(|examples| {
            examples
                .into_iter()
                .map(|s| TrainingExample {
                    input: s.input,
                    output: s.output,
                    quality: 1.0,
                })
                .collect()
        });
        let job = self
            .finetune
            .fine_tune(base_model_id, use_case, window, seed_examples)
            .await?;
        Ok(FineTuneResponse {
            job_id: job.job_id,
            status: job.status,
        })
    }

    /// `Monitor outputs` (§6). Not admin-gated — a critical violation here
    /// rolls `model_id` back and marks it `needs_review` the same way the
    /// Meta-Management Loop's own monitoring pass does (§8 scenario 4).
    pub async fn monitor_outputs(&self, model_id: &str, outputs: &[String]) -> Result<MonitoringResult> {
        self.guardrails
            .monitor_and_intervene(model_id, outputs, &self.default_handler())
            .await
    }

    /// `Service status` (§6).
    pub fn service_status(&self) -> ServiceStatusResponse {
        ServiceStatusResponse {
            llm_services: vec!["llm-client".to_string()],
            service_health: "ok".to_string(),
            performance_metrics: ServicePerformanceSnapshot::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::deployment::DeploymentStore;
    use crate::finetune::{FineTuneJobStore, InMemoryObjectStore, NullTrainingBackend};
    use crate::guardrails::{KeywordModerator, ViolationStore};
    use crate::llm::{CircuitBreakerConfig, CircuitBreakerRegistry, CostBenefitRouter, FallbackTemplates, ResponseCache};
    use crate::rollback::SnapshotStore;
    use crate::storage::Db;

    fn control_plane(config: Config) -> ControlPlane {
        let db = Db::in_memory().unwrap();
        let registry = RegistryStore::new(db.clone());
        let logs = HistoricalLogStore::new(db.clone());
        let guardrails = GuardrailsMonitor::new(
            Arc::new(KeywordModerator),
            Arc::new(KeywordModerator),
            ViolationStore::new(db.clone()),
        );
        let router = CostBenefitRouter::new(registry.clone(), logs.clone());
        let cache = ResponseCache::new(config.cache_ttl_sec as i64);
        let breakers = Arc::new(CircuitBreakerRegistry::new(CircuitBreakerConfig {
            failure_threshold: config.circuit_failure_threshold,
            timeout_sec: config.circuit_timeout_sec as i64,
        }));
        let llm = Arc::new(LlmClient::new(
            registry.clone(),
            logs.clone(),
            router,
            cache,
            breakers,
            FallbackTemplates::default(),
        ));
        let rollback = Arc::new(RollbackManager::new(
            registry.clone(),
            SnapshotStore::new(db.clone()),
            DeploymentStore::new(db.clone()),
        ));
        let deployment = Arc::new(DeploymentManager::new(
            registry.clone(),
            logs.clone(),
            RollbackManager::new(registry.clone(), SnapshotStore::new(db.clone()), DeploymentStore::new(db.clone())),
            DeploymentStore::new(db.clone()),
        ));
        let finetune = Arc::new(FineTuneOrchestrator::new(
            registry.clone(),
            logs.clone(),
            FineTuneJobStore::new(db.clone()),
            llm.clone(),
            Arc::new(InMemoryObjectStore::new("bucket")),
            Arc::new(NullTrainingBackend),
            "bucket",
        ));
        ControlPlane::new(registry, logs, guardrails, llm, rollback, deployment, finetune, config)
    }

    #[test]
    fn admin_route_rejected_when_allowlist_empty() {
        let plane = control_plane(Config::default());
        let err = plane
            .register_model(
                "any-key",
                "m1",
                ModelKind::Hosted,
                "p",
                "dialogue",
                "v1",
                serde_json::json!({}),
                None,
                None,
            )
            .unwrap_err();
        assert!(matches!(err, Error::Unavailable(_)));
    }

    #[test]
    fn admin_route_rejected_with_wrong_key() {
        let mut config = Config::default();
        config.admin_keys = vec!["secret".to_string()];
        let plane = control_plane(config);
        let err = plane
            .register_model(
                "wrong",
                "m1",
                ModelKind::Hosted,
                "p",
                "dialogue",
                "v1",
                serde_json::json!({}),
                None,
                None,
            )
            .unwrap_err();
        assert!(matches!(err, Error::InvalidArgument(_)));
    }

    #[test]
    fn admin_route_succeeds_with_correct_key() {
        let mut config = Config::default();
        config.admin_keys = vec!["secret".to_string()];
        let plane = control_plane(config);
        let response = plane
            .register_model(
                "secret",
                "m1",
                ModelKind::Hosted,
                "p",
                "dialogue",
                "v1",
                serde_json::json!({}),
                None,
                None,
            )
            .unwrap();
        assert!(plane.registry.get(&response.model_id).unwrap().is_some());
    }

    #[tokio::test]
    async fn monitor_outputs_rolls_back_model_on_critical_violation() {
        let plane = control_plane(Config::default());
        let model_id = plane
            .registry
            .register("m1", ModelKind::Hosted, "p", "dialogue", "v1", serde_json::json!({"endpoint": "http://good"}), None, None)
            .unwrap();
        plane.registry.update_status(&model_id, crate::types::ModelStatus::Current).unwrap();
        plane.rollback.snapshot(&model_id).unwrap();
        plane.registry.update_config(&model_id, serde_json::json!({"endpoint": "http://broken"})).unwrap();

        let result = plane
            .monitor_outputs(&model_id, &["kill yourself".to_string()])
            .await
            .unwrap();
        assert!(!result.compliant);

        let restored = plane.registry.get(&model_id).unwrap().unwrap();
        assert_eq!(restored.config["endpoint"], "http://good");
    }

    #[test]
    fn check_for_better_finds_non_current_candidate() {
        let mut config = Config::default();
        config.admin_keys = vec!["secret".to_string()];
        let plane = control_plane(config);
        let current = plane
            .register_model("secret", "m1", ModelKind::Hosted, "p", "dialogue", "v1", serde_json::json!({}), None, None)
            .unwrap()
            .model_id;
        let candidate = plane
            .register_model("secret", "m2", ModelKind::Hosted, "p", "dialogue", "v1", serde_json::json!({}), None, None)
            .unwrap()
            .model_id;

        let response = plane.check_for_better("dialogue", &current).unwrap();
        assert!(response.better_found);
        assert_eq!(response.better_model_id, Some(candidate));
    }
}
