//! Meta-Management Loop (C10, §4.10): the continuous discover / aggregate
//! / monitor / decide / implement cycle driving C1, C7, and C8.

use std::sync::Arc;
use std::time::Duration as StdDuration;

use chrono::Duration as ChronoDuration;
use tokio::sync::watch;

use crate::deployment::DeploymentManager;
use crate::error::Result;
use crate::guardrails::{DefaultInterventionHandler, GuardrailsMonitor};
use crate::historylog::{Aggregate, HistoricalLogStore};
use crate::registry::RegistryStore;
use crate::rollback::RollbackManager;
use crate::types::{DeploymentStrategy, ModelStatus};

use super::discovery::ModelDiscovery;

const METRICS_WINDOW_MINUTES: i64 = 60;
const RECOVERY_SLEEP_SECS: u64 = 60;
const SAMPLE_OUTPUT_LIMIT: u32 = 20;

/// One action the loop decided to take this cycle (§4.10 step 4).
#[derive(Debug, Clone)]
pub enum Decision {
    Rollback { model_id: String, reason: String },
    AdjustParameters { model_id: String, reason: String },
    DeployModel {
        use_case: String,
        new_model_id: String,
        current_model_id: String,
    },
}

/// Default "performance degradation" rule (Design Notes §9): identical to
/// the Deployment Manager's `detect_issues` rule, since the source names
/// no broader signal. Injectable so callers can extend it.
pub fn default_degradation_rule(aggregate: &Aggregate) -> bool {
    aggregate.total > 0 && (aggregate.error_rate() > 0.10 || aggregate.p95_latency_ms > 5000.0)
}

/// The Meta-Management Loop (C10).
pub struct MetaLoop {
    registry: RegistryStore,
    logs: HistoricalLogStore,
    guardrails: GuardrailsMonitor,
    rollback: Arc<RollbackManager>,
    deployment: Arc<DeploymentManager>,
    discovery: Arc<dyn ModelDiscovery>,
    use_cases: Vec<String>,
    check_interval: StdDuration,
    degradation_rule: Arc<dyn Fn(&Aggregate) -> bool + Send + Sync>,
}

impl MetaLoop {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        registry: RegistryStore,
        logs: HistoricalLogStore,
        guardrails: GuardrailsMonitor,
        rollback: Arc<RollbackManager>,
        deployment: Arc<DeploymentManager>,
        discovery: Arc<dyn ModelDiscovery>,
        use_cases: Vec<String>,
        check_interval_sec: u64,
    ) -> Self {
        Self {
            registry,
            logs,
            guardrails,
            rollback,
            deployment,
            discovery,
            use_cases,
            check_interval: StdDuration::from_secs(check_interval_sec),
            degradation_rule: Arc::new(default_degradation_rule),
        }
    }

    pub fn with_degradation_rule(
        mut self,
        rule: impl Fn(&Aggregate) -> bool + Send + Sync + 'static,
    ) -> Self {
        self.degradation_rule = Arc::new(rule);
        self
    }

    /// §4.10 step 1: poll discovery for each managed use_case and register
    /// anything new as a `candidate`.
    async fn discover_candidates(&self, use_case: &str) -> Result<Vec<Decision>> {
        let discovered = self.discovery.discover(use_case).await?;
        for model in &discovered {
            self.registry.register(
                &model.name,
                model.kind,
                &model.provider,
                use_case,
                &model.version,
                model.config.clone(),
                None,
                None,
            )?;
        }
        Ok(Vec::new())
    }

    /// §4.10 steps 2-4 for a single `use_case`'s current model.
    async fn evaluate_current_model(&self, use_case: &str) -> Result<Vec<Decision>> {
        let mut decisions = Vec::new();

        let current = match self.registry.get_current(use_case)? {
            Some(model) => model,
            None => return Ok(decisions),
        };

        let aggregate = self
            .logs
            .aggregate(&current.model_id, ChronoDuration::minutes(METRICS_WINDOW_MINUTES))?;

        let range = crate::historylog::TimeRange::last(ChronoDuration::minutes(METRICS_WINDOW_MINUTES));
        let recent_logs = self.logs.query(Some(&current.model_id), None, Some(&range), SAMPLE_OUTPUT_LIMIT)?;
        let outputs: Vec<String> = recent_logs.iter().map(|l| l.generated_output.clone()).collect();

        if !outputs.is_empty() {
            // `monitor_and_intervene`'s handler already performs the
            // rollback itself on a critical violation (§4.3); recording a
            // `Decision::Rollback` here too would implement the same
            // rollback twice for nothing.
            self.guardrails
                .monitor_and_intervene(&current.model_id, &outputs, &self.default_handler())
                .await?;
        }

        if (self.degradation_rule)(&aggregate) {
            decisions.push(Decision::AdjustParameters {
                model_id: current.model_id.clone(),
                reason: format!(
                    "error_rate={:.3} p95_latency_ms={:.0}",
                    aggregate.error_rate(),
                    aggregate.p95_latency_ms
                ),
            });
        }

        for candidate in self.registry.list_candidates(use_case)? {
            if candidate.model_id != current.model_id {
                decisions.push(Decision::DeployModel {
                    use_case: use_case.to_string(),
                    new_model_id: candidate.model_id,
                    current_model_id: current.model_id.clone(),
                });
                break;
            }
        }

        Ok(decisions)
    }

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

    /// Implements one decision by calling into C1/C7/C8 (§4.10 step 5).
    async fn implement(&self, decision: Decision) -> Result<()> {
        match decision {
            Decision::Rollback { model_id, reason } => {
                tracing::warn!(model_id, reason, "meta-loop triggered rollback");
                self.rollback.rollback(&model_id, None)?;
            }
            Decision::AdjustParameters { model_id, reason } => {
                tracing::info!(model_id, reason, "meta-loop adjusting parameters");
                let model = self.registry.get(&model_id)?;
                if let Some(model) = model {
                    let current_temp = model
                        .config
                        .get("temperature")
                        .and_then(|v| v.as_f64())
                        .unwrap_or(0.7);
                    let adjusted = (current_temp * 0.9).max(0.1);
                    self.registry
                        .update_config(&model_id, serde_json::json!({"temperature": adjusted}))?;
                }
            }
            Decision::DeployModel {
                use_case: _,
                new_model_id,
                current_model_id,
            } => {
                tracing::info!(new_model_id, current_model_id, "meta-loop deploying candidate");
                self.deployment
                    .deploy(
                        &new_model_id,
                        &current_model_id,
                        DeploymentStrategy::Canary,
                        crate::deployment::never_cancel(),
                    )
                    .await?;
            }
        }
        Ok(())
    }

    /// Runs a single cycle: discover, aggregate, monitor, decide,
    /// implement. Rollback decisions are implemented before deployments
    /// per the "critical guardrails before deployments" ordering rule.
    pub async fn run_once(&self) -> Result<Vec<Decision>> {
        let mut decisions = Vec::new();
        for use_case in &self.use_cases {
            decisions.extend(self.discover_candidates(use_case).await?);
            decisions.extend(self.evaluate_current_model(use_case).await?);
        }

        decisions.sort_by_key(|d| !matches!(d, Decision::Rollback { .. }));

        for decision in decisions.clone() {
            self.implement(decision).await?;
        }

        Ok(decisions)
    }

    /// Runs forever at `check_interval`, until `shutdown` fires. On an
    /// exception in a cycle, sleeps `RECOVERY_SLEEP_SECS` and continues
    /// (§4.10 step 6) rather than terminating the loop.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        tracing::info!("meta-loop shutting down");
                        return;
                    }
                }
                result = self.run_once() => {
                    match result {
                        Ok(decisions) => {
                            if !decisions.is_empty() {
                                tracing::info!(count = decisions.len(), "meta-loop cycle applied decisions");
                            }
                            tokio::time::sleep(self.check_interval).await;
                        }
                        Err(e) => {
                            tracing::error!(error = %e, "meta-loop cycle failed, recovering");
                            tokio::time::sleep(StdDuration::from_secs(RECOVERY_SLEEP_SECS)).await;
                        }
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::deployment::DeploymentStore;
    use crate::guardrails::{KeywordModerator, ViolationStore};
    use crate::historylog::Aggregate;
    use crate::rollback::SnapshotStore;
    use crate::storage::Db;
    use crate::types::{InferenceMetrics, ModelKind};

    fn fixture() -> (MetaLoop, RegistryStore, HistoricalLogStore) {
        let db = Db::in_memory().unwrap();
        let registry = RegistryStore::new(db.clone());
        let logs = HistoricalLogStore::new(db.clone());
        let guardrails = GuardrailsMonitor::new(
            Arc::new(KeywordModerator),
            Arc::new(KeywordModerator),
            ViolationStore::new(db.clone()),
        );
        let rollback = Arc::new(RollbackManager::new(
            registry.clone(),
            SnapshotStore::new(db.clone()),
            DeploymentStore::new(db.clone()),
        ));
        let deployment = Arc::new(
            DeploymentManager::new(
                registry.clone(),
                logs.clone(),
                RollbackManager::new(registry.clone(), SnapshotStore::new(db.clone()), DeploymentStore::new(db.clone())),
                DeploymentStore::new(db.clone()),
            )
            .with_observe_scale(0.0),
        );
        let meta = MetaLoop::new(
            registry.clone(),
            logs.clone(),
            guardrails,
            rollback,
            deployment,
            Arc::new(super::super::discovery::NullDiscovery),
            vec!["dialogue".to_string()],
            3600,
        );
        (meta, registry, logs)
    }

    #[tokio::test]
    async fn no_current_model_yields_no_decisions() {
        let (meta, _registry, _logs) = fixture();
        let decisions = meta.run_once().await.unwrap();
        assert!(decisions.is_empty());
    }

    #[tokio::test]
    async fn degraded_current_model_produces_adjust_decision() {
        let (meta, registry, logs) = fixture();
        let model_id = registry
            .register("m1", ModelKind::Hosted, "p", "dialogue", "v1", serde_json::json!({"temperature": 0.7}), None, None)
            .unwrap();
        registry.update_status(&model_id, ModelStatus::Current).unwrap();

        for _ in 0..10 {
            logs.log(
                &model_id,
                "dialogue",
                "p",
                serde_json::json!({}),
                "just a plain line",
                InferenceMetrics { error: Some("boom".into()), ..Default::default() },
                None,
                None,
            )
            .unwrap();
        }

        let decisions = meta.run_once().await.unwrap();
        assert!(decisions
            .iter()
            .any(|d| matches!(d, Decision::AdjustParameters { model_id: m, .. } if m == &model_id)));

        let updated = registry.get(&model_id).unwrap().unwrap();
        assert!(updated.config["temperature"].as_f64().unwrap() < 0.7);
    }

    #[test]
    fn default_degradation_rule_ignores_empty_window() {
        assert!(!default_degradation_rule(&Aggregate::default()));
    }
}
