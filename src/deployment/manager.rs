//! Deployment Manager (C8, §4.8): rolls a new model into production
//! traffic by strategy-defined steps, watching for regressions between
//! steps and rolling back automatically if one appears.
//!
//! The step loop follows the same "check an exit condition, run one step,
//! record it" shape the host crate's fallback-aware execution loop uses,
//! adapted here to real wall-clock observation windows between traffic
//! shifts instead of synchronous callback steps.

use std::time::Duration as StdDuration;

use chrono::Duration as ChronoDuration;
use tokio::sync::watch;

use crate::error::{Error, Result};
use crate::historylog::HistoricalLogStore;
use crate::registry::RegistryStore;
use crate::rollback::RollbackManager;
use crate::types::{DeploymentStrategy, ModelStatus};

use super::store::DeploymentStore;

/// Error rate above which a rollout step is considered regressed (§4.8).
const ERROR_RATE_THRESHOLD: f64 = 0.10;
/// Latency above which a rollout step is considered regressed (§4.8). We
/// use the window's p95 as the "avg_latency" proxy since the aggregate
/// only tracks percentiles, not a mean.
const LATENCY_THRESHOLD_MS: f64 = 5000.0;
const DETECTION_WINDOW_MINUTES: i64 = 30;

struct Step {
    traffic_percentage: f64,
    observe_seconds: u64,
}

fn schedule_for(strategy: DeploymentStrategy) -> Vec<Step> {
    match strategy {
        DeploymentStrategy::BlueGreen => [10.0, 25.0, 50.0, 75.0, 100.0]
            .into_iter()
            .map(|pct| Step {
                traffic_percentage: pct,
                observe_seconds: 300,
            })
            .collect(),
        DeploymentStrategy::Canary => {
            let mut steps = vec![Step {
                traffic_percentage: 5.0,
                observe_seconds: 900,
            }];
            steps.extend([25.0, 50.0, 100.0].into_iter().map(|pct| Step {
                traffic_percentage: pct,
                observe_seconds: 300,
            }));
            steps
        }
        DeploymentStrategy::AllAtOnce => vec![Step {
            traffic_percentage: 100.0,
            observe_seconds: 60,
        }],
        // `Rollback` is a record-only strategy the Rollback Manager writes
        // after the fact; `deploy()` never receives it.
        DeploymentStrategy::Rollback => Vec::new(),
    }
}

/// The Deployment Manager (C8).
pub struct DeploymentManager {
    registry: RegistryStore,
    logs: HistoricalLogStore,
    rollback: RollbackManager,
    deployments: DeploymentStore,
    /// Multiplies every step's observe duration; production uses `1.0`,
    /// tests shrink the real schedule to keep runs fast.
    observe_scale: f64,
}

impl DeploymentManager {
    pub fn new(
        registry: RegistryStore,
        logs: HistoricalLogStore,
        rollback: RollbackManager,
        deployments: DeploymentStore,
    ) -> Self {
        Self {
            registry,
            logs,
            rollback,
            deployments,
            observe_scale: 1.0,
        }
    }

    pub fn with_observe_scale(mut self, scale: f64) -> Self {
        self.observe_scale = scale;
        self
    }

    fn detect_issues(&self, model_id: &str) -> Result<Option<String>> {
        let aggregate = self
            .logs
            .aggregate(model_id, ChronoDuration::minutes(DETECTION_WINDOW_MINUTES))?;
        if aggregate.total == 0 {
            return Ok(None);
        }
        if aggregate.error_rate() > ERROR_RATE_THRESHOLD {
            return Ok(Some(format!(
                "error_rate {:.3} exceeded threshold {ERROR_RATE_THRESHOLD}",
                aggregate.error_rate()
            )));
        }
        if aggregate.p95_latency_ms > LATENCY_THRESHOLD_MS {
            return Ok(Some(format!(
                "p95 latency {:.0}ms exceeded threshold {LATENCY_THRESHOLD_MS}ms",
                aggregate.p95_latency_ms
            )));
        }
        Ok(None)
    }

    /// Reverts traffic to `current_model_id`, marks `new_model_id` failed,
    /// restores the pre-deployment snapshot, and marks the Deployment
    /// record `rolled_back` with `reason`. Shared by the regression path
    /// and the cancellation path — both leave the rollout in the same
    /// terminal state.
    fn rollback_in_progress(
        &self,
        deployment_id: &str,
        new_model_id: &str,
        current_model_id: &str,
        snapshot_id: &str,
        reason: &str,
    ) -> Result<()> {
        self.registry
            .update_config(new_model_id, serde_json::json!({"traffic_percentage": 0.0}))?;
        self.registry
            .update_config(current_model_id, serde_json::json!({"traffic_percentage": 100.0}))?;
        self.registry.update_status(new_model_id, ModelStatus::Failed)?;
        self.rollback.rollback(current_model_id, Some(snapshot_id))?;
        self.deployments.mark_rolled_back(deployment_id, reason)?;
        Ok(())
    }

    /// `deploy(new_model_id, current_model_id, strategy) → success` (§4.8).
    /// `cancel` is watched between every step's observation sleep (§5:
    /// "deployment observation sleeps are cancellable"); tripping it rolls
    /// the in-progress deployment back and marks it `rolled_back` with
    /// `reason="cancelled"`. Pass a receiver over a channel that's never
    /// sent to if the caller has no cancellation source.
    pub async fn deploy(
        &self,
        new_model_id: &str,
        current_model_id: &str,
        strategy: DeploymentStrategy,
        mut cancel: watch::Receiver<bool>,
    ) -> Result<bool> {
        self.registry
            .get(new_model_id)?
            .ok_or_else(|| Error::not_found(format!("model {new_model_id}")))?;
        self.registry
            .get(current_model_id)?
            .ok_or_else(|| Error::not_found(format!("model {current_model_id}")))?;

        let deployment_id = self.deployments.create(new_model_id, strategy)?;
        let snapshot_id = self.rollback.snapshot(current_model_id)?;
        self.registry.update_status(new_model_id, ModelStatus::Testing)?;

        for step in schedule_for(strategy) {
            self.registry.update_config(
                new_model_id,
                serde_json::json!({"traffic_percentage": step.traffic_percentage}),
            )?;
            self.registry.update_config(
                current_model_id,
                serde_json::json!({"traffic_percentage": 100.0 - step.traffic_percentage}),
            )?;
            self.deployments
                .update_traffic(&deployment_id, step.traffic_percentage)?;

            let wait_seconds = (step.observe_seconds as f64 * self.observe_scale).max(0.0);
            tokio::select! {
                _ = tokio::time::sleep(StdDuration::from_secs_f64(wait_seconds)) => {}
                _ = cancel.changed() => {
                    if *cancel.borrow() {
                        tracing::warn!(new_model_id, "deployment cancelled, rolling back");
                        self.rollback_in_progress(
                            &deployment_id,
                            new_model_id,
                            current_model_id,
                            &snapshot_id,
                            "cancelled",
                        )?;
                        return Ok(false);
                    }
                }
            }

            if let Some(reason) = self.detect_issues(new_model_id)? {
                tracing::warn!(new_model_id, reason = %reason, "rollout regressed, rolling back");
                self.rollback_in_progress(
                    &deployment_id,
                    new_model_id,
                    current_model_id,
                    &snapshot_id,
                    &reason,
                )?;
                return Ok(false);
            }
        }

        self.registry
            .promote_with_expected_current(new_model_id, Some(current_model_id))?;
        self.deployments.mark_completed(&deployment_id)?;
        tracing::info!(new_model_id, current_model_id, "deployment completed");
        Ok(true)
    }
}

/// A receiver over a channel nothing ever sends on, for callers with no
/// cancellation source of their own.
pub fn never_cancel() -> watch::Receiver<bool> {
    watch::channel(false).1
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::Db;
    use crate::types::{InferenceMetrics, ModelKind};

    fn manager_with_scale(scale: f64) -> (DeploymentManager, RegistryStore, HistoricalLogStore) {
        let db = Db::in_memory().unwrap();
        let registry = RegistryStore::new(db.clone());
        let logs = HistoricalLogStore::new(db.clone());
        let rollback = RollbackManager::new(
            registry.clone(),
            crate::rollback::SnapshotStore::new(db.clone()),
            DeploymentStore::new(db.clone()),
        );
        let deployments = DeploymentStore::new(db);
        let manager = DeploymentManager::new(registry.clone(), logs.clone(), rollback, deployments)
            .with_observe_scale(scale);
        (manager, registry, logs)
    }

    fn manager() -> (DeploymentManager, RegistryStore, HistoricalLogStore) {
        manager_with_scale(0.0)
    }

    #[tokio::test]
    async fn all_at_once_succeeds_with_healthy_metrics() {
        let (manager, registry, _logs) = manager();
        let current = registry
            .register("old", ModelKind::Hosted, "p", "dialogue", "v1", serde_json::json!({"traffic_percentage": 100}), None, None)
            .unwrap();
        registry.update_status(&current, ModelStatus::Current).unwrap();
        let new_model = registry
            .register("new", ModelKind::Hosted, "p", "dialogue", "v2", serde_json::json!({}), None, None)
            .unwrap();

        let success = manager
            .deploy(&new_model, &current, DeploymentStrategy::AllAtOnce, never_cancel())
            .await
            .unwrap();
        assert!(success);
        assert_eq!(registry.get_current("dialogue").unwrap().unwrap().model_id, new_model);
    }

    #[tokio::test]
    async fn canary_rolls_back_on_high_error_rate() {
        let (manager, registry, logs) = manager();
        let current = registry
            .register("old", ModelKind::Hosted, "p", "dialogue", "v1", serde_json::json!({"traffic_percentage": 100}), None, None)
            .unwrap();
        registry.update_status(&current, ModelStatus::Current).unwrap();
        let new_model = registry
            .register("new", ModelKind::Hosted, "p", "dialogue", "v2", serde_json::json!({}), None, None)
            .unwrap();

        for i in 0..10 {
            let error = if i < 5 { Some("boom".to_string()) } else { None };
            logs.log(
                &new_model,
                "dialogue",
                "p",
                serde_json::json!({}),
                "o",
                InferenceMetrics {
                    error,
                    ..Default::default()
                },
                None,
                None,
            )
            .unwrap();
        }

        let success = manager
            .deploy(&new_model, &current, DeploymentStrategy::Canary, never_cancel())
            .await
            .unwrap();
        assert!(!success);
        assert_eq!(
            registry.get(&new_model).unwrap().unwrap().status,
            ModelStatus::Failed
        );
        assert_eq!(registry.get_current("dialogue").unwrap().unwrap().model_id, current);
    }

    #[tokio::test]
    async fn cancellation_mid_observation_rolls_back() {
        // Full-scale schedule so the first step's observation sleep is
        // genuinely long (real seconds); the cancel signal, which needs no
        // time to propagate, wins the race deterministically.
        let (manager, registry, _logs) = manager_with_scale(1.0);
        let current = registry
            .register("old", ModelKind::Hosted, "p", "dialogue", "v1", serde_json::json!({"traffic_percentage": 100}), None, None)
            .unwrap();
        registry.update_status(&current, ModelStatus::Current).unwrap();
        let new_model = registry
            .register("new", ModelKind::Hosted, "p", "dialogue", "v2", serde_json::json!({}), None, None)
            .unwrap();

        let (cancel_tx, cancel_rx) = watch::channel(false);
        let handle = tokio::spawn(async move {
            manager
                .deploy(&new_model, &current, DeploymentStrategy::Canary, cancel_rx)
                .await
        });

        tokio::task::yield_now().await;
        cancel_tx.send(true).unwrap();

        let success = handle.await.unwrap().unwrap();
        assert!(!success);
        assert_eq!(registry.get(&new_model).unwrap().unwrap().status, ModelStatus::Failed);
        assert_eq!(registry.get_current("dialogue").unwrap().unwrap().model_id, current);
    }
}
