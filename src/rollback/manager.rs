//! Rollback Manager (C7, §4.7): captures a model's restorable state and
//! restores it on demand. Verifies the restore by rereading the model;
//! never retries or re-triggers a rollback on its own failure.

use crate::deployment::DeploymentStore;
use crate::error::{Error, Result};
use crate::registry::RegistryStore;
use crate::types::{ConfigValue, ModelStatus};

use super::store::SnapshotStore;

fn config_matches(actual: &ConfigValue, expected: &ConfigValue) -> bool {
    match (actual, expected) {
        (serde_json::Value::Object(actual_map), serde_json::Value::Object(expected_map)) => {
            expected_map.iter().all(|(k, v)| actual_map.get(k) == Some(v))
        }
        _ => actual == expected,
    }
}

/// The Rollback Manager (C7). Owns [`crate::types::Snapshot`] persistence
/// and reads/writes [`crate::types::Model`] through the registry it's
/// given — it never mutates storage directly.
pub struct RollbackManager {
    registry: RegistryStore,
    snapshots: SnapshotStore,
    deployments: DeploymentStore,
}

impl RollbackManager {
    pub fn new(registry: RegistryStore, snapshots: SnapshotStore, deployments: DeploymentStore) -> Self {
        Self {
            registry,
            snapshots,
            deployments,
        }
    }

    /// `snapshot(model_id) → snapshot_id` (§4.7). Captures the model's
    /// current config, metrics, and traffic share as a restorable point.
    pub fn snapshot(&self, model_id: &str) -> Result<String> {
        let model = self
            .registry
            .get(model_id)?
            .ok_or_else(|| Error::not_found(format!("model {model_id}")))?;

        let traffic_percentage = model
            .config
            .get("traffic_percentage")
            .and_then(|v| v.as_f64())
            .unwrap_or(100.0);
        let artifact_location = model
            .config
            .get("adapter_ref")
            .and_then(|v| v.as_str());

        let snapshot_id = self.snapshots.save(
            model_id,
            model.config.clone(),
            model.metrics.clone(),
            traffic_percentage,
            artifact_location,
        )?;

        tracing::info!(model_id, snapshot_id = %snapshot_id, "captured rollback snapshot");
        Ok(snapshot_id)
    }

    /// `rollback(model_id, snapshot_id?) → success` (§4.7). Without an
    /// explicit `snapshot_id`, restores the model's most recent snapshot.
    /// A verification re-read confirms the restore landed; on mismatch
    /// this reports `Ok(false)` rather than retrying — a failed rollback
    /// must surface as a fact for a human or the Meta-Management Loop to
    /// act on, not spiral into another rollback attempt.
    pub fn rollback(&self, model_id: &str, snapshot_id: Option<&str>) -> Result<bool> {
        self.registry
            .get(model_id)?
            .ok_or_else(|| Error::not_found(format!("model {model_id}")))?;

        let snapshot = match snapshot_id {
            Some(id) => self
                .snapshots
                .get(id)?
                .ok_or_else(|| Error::not_found(format!("snapshot {id}")))?,
            None => self
                .snapshots
                .latest_for_model(model_id)?
                .ok_or_else(|| Error::not_found(format!("no snapshot recorded for model {model_id}")))?,
        };

        if snapshot.model_id != model_id {
            return Err(Error::invalid_argument(format!(
                "snapshot {} does not belong to model {model_id}",
                snapshot.snapshot_id
            )));
        }

        self.registry.update_config(model_id, snapshot.config.clone())?;
        self.registry
            .update_performance(model_id, snapshot.metrics.clone())?;

        let reread = self
            .registry
            .get(model_id)?
            .ok_or_else(|| Error::internal(format!("model {model_id} vanished mid-rollback")))?;

        if !config_matches(&reread.config, &snapshot.config) {
            tracing::error!(
                model_id,
                snapshot_id = %snapshot.snapshot_id,
                "rollback verification failed; leaving model as-is"
            );
            return Ok(false);
        }

        // §4.7: a verified restore re-marks the model `current` and writes
        // a synthetic `rollback` Deployment record carrying the restored
        // traffic percentage.
        self.registry.update_status(model_id, ModelStatus::Current)?;
        self.deployments.record_rollback(
            model_id,
            snapshot.traffic_percentage,
            &format!("restored snapshot {}", snapshot.snapshot_id),
        )?;

        tracing::info!(model_id, snapshot_id = %snapshot.snapshot_id, "model rolled back");
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::Db;
    use crate::types::ModelKind;

    fn manager() -> (RollbackManager, RegistryStore) {
        let db = Db::in_memory().unwrap();
        let registry = RegistryStore::new(db.clone());
        let snapshots = SnapshotStore::new(db.clone());
        let deployments = DeploymentStore::new(db);
        (RollbackManager::new(registry.clone(), snapshots, deployments), registry)
    }

    #[test]
    fn snapshot_then_rollback_restores_prior_config() {
        let (manager, registry) = manager();
        let model_id = registry
            .register(
                "m1",
                ModelKind::Hosted,
                "p",
                "dialogue",
                "v1",
                serde_json::json!({"endpoint": "http://good", "traffic_percentage": 100}),
                None,
                None,
            )
            .unwrap();

        let snapshot_id = manager.snapshot(&model_id).unwrap();

        registry
            .update_config(&model_id, serde_json::json!({"endpoint": "http://broken"}))
            .unwrap();
        assert_eq!(
            registry.get(&model_id).unwrap().unwrap().config["endpoint"],
            "http://broken"
        );

        let restored = manager.rollback(&model_id, Some(&snapshot_id)).unwrap();
        assert!(restored);
        assert_eq!(
            registry.get(&model_id).unwrap().unwrap().config["endpoint"],
            "http://good"
        );
    }

    #[test]
    fn rollback_re_promotes_a_demoted_model_to_current() {
        // §8: "every Rollback that returns success=true leaves the target
        // model with status='current'" — even when the model was never
        // demoted from `current` in the deployment auto-rollback path.
        let (manager, registry) = manager();
        let model_id = registry
            .register("m1", ModelKind::Hosted, "p", "dialogue", "v1", serde_json::json!({}), None, None)
            .unwrap();
        registry.update_status(&model_id, ModelStatus::Current).unwrap();
        let snapshot_id = manager.snapshot(&model_id).unwrap();
        registry.update_status(&model_id, ModelStatus::NeedsReview).unwrap();

        let restored = manager.rollback(&model_id, Some(&snapshot_id)).unwrap();
        assert!(restored);
        assert_eq!(registry.get(&model_id).unwrap().unwrap().status, ModelStatus::Current);
    }

    #[test]
    fn rollback_without_explicit_snapshot_uses_latest() {
        let (manager, registry) = manager();
        let model_id = registry
            .register("m1", ModelKind::Hosted, "p", "dialogue", "v1", serde_json::json!({"endpoint": "v1"}), None, None)
            .unwrap();
        manager.snapshot(&model_id).unwrap();
        registry
            .update_config(&model_id, serde_json::json!({"endpoint": "v2"}))
            .unwrap();

        assert!(manager.rollback(&model_id, None).unwrap());
        assert_eq!(registry.get(&model_id).unwrap().unwrap().config["endpoint"], "v1");
    }

    #[test]
    fn rollback_with_unknown_model_is_not_found() {
        let (manager, _registry) = manager();
        let err = manager.rollback("missing", None).unwrap_err();
        assert!(matches!(err, Error::NotFound(_)));
    }

    #[test]
    fn rollback_with_no_snapshot_is_not_found() {
        let (manager, registry) = manager();
        let model_id = registry
            .register("m1", ModelKind::Hosted, "p", "dialogue", "v1", serde_json::json!({}), None, None)
            .unwrap();
        let err = manager.rollback(&model_id, None).unwrap_err();
        assert!(matches!(err, Error::NotFound(_)));
    }
}
