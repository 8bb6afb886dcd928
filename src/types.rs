//! Shared domain types (§3): the entities every component reads or writes.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A tagged-value document used at persistence/wire boundaries for
/// configuration, metrics, and request context (Design Notes §9: "dynamic
/// JSON ... represent as a tagged-value document type at the boundary").
///
/// Components that need a closed view over part of the document pull typed
/// accessors off it (see [`ModelConfig`] below) rather than matching on the
/// whole shape.
pub type ConfigValue = serde_json::Value;

/// Shallow-merges `patch` into `base`, used by `update_config`'s
/// shallow-merge semantics (§4.1).
pub fn shallow_merge(base: &mut serde_json::Value, patch: &serde_json::Value) {
    match (base, patch) {
        (serde_json::Value::Object(base_map), serde_json::Value::Object(patch_map)) => {
            for (k, v) in patch_map {
                base_map.insert(k.clone(), v.clone());
            }
        }
        (base_slot, patch_value) => {
            *base_slot = patch_value.clone();
        }
    }
}

/// Convenience accessors over a model's configuration document.
pub trait ModelConfigView {
    fn endpoint(&self) -> Option<&str>;
    fn traffic_percentage(&self) -> Option<f64>;
    fn block_outputs(&self) -> bool;
    fn adapter_ref(&self) -> Option<&str>;
    fn lora_rank(&self) -> Option<u32>;
}

impl ModelConfigView for ConfigValue {
    fn endpoint(&self) -> Option<&str> {
        self.get("endpoint").and_then(|v| v.as_str())
    }

    fn traffic_percentage(&self) -> Option<f64> {
        self.get("traffic_percentage").and_then(|v| v.as_f64())
    }

    fn block_outputs(&self) -> bool {
        self.get("block_outputs")
            .and_then(|v| v.as_bool())
            .unwrap_or(false)
    }

    fn adapter_ref(&self) -> Option<&str> {
        self.get("adapter_ref").and_then(|v| v.as_str())
    }

    fn lora_rank(&self) -> Option<u32> {
        self.get("lora_rank").and_then(|v| v.as_u64()).map(|v| v as u32)
    }
}

/// Model kind: whether inference runs on a hosted third-party API or on
/// infrastructure this control plane operates directly.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModelKind {
    Hosted,
    SelfServed,
}

/// Model lifecycle status (§3 "Lifecycles").
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModelStatus {
    Candidate,
    Testing,
    Current,
    Deprecated,
    NeedsReview,
    Failed,
}

impl ModelStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ModelStatus::Candidate => "candidate",
            ModelStatus::Testing => "testing",
            ModelStatus::Current => "current",
            ModelStatus::Deprecated => "deprecated",
            ModelStatus::NeedsReview => "needs_review",
            ModelStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "candidate" => Some(Self::Candidate),
            "testing" => Some(Self::Testing),
            "current" => Some(Self::Current),
            "deprecated" => Some(Self::Deprecated),
            "needs_review" => Some(Self::NeedsReview),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }
}

/// The authoritative catalog entry for one model (§3 "Model").
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Model {
    pub model_id: String,
    pub name: String,
    pub kind: ModelKind,
    pub provider: String,
    pub use_case: String,
    pub version: String,
    pub status: ModelStatus,
    pub config: ConfigValue,
    pub metrics: ConfigValue,
    pub resources: ConfigValue,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Model {
    /// Generate a fresh model id, matching the host crate's preference for
    /// UUIDv4 entity identifiers.
    pub fn new_id() -> String {
        Uuid::new_v4().to_string()
    }
}

/// Performance metrics attached to an [`InferenceLog`] (§3 "InferenceLog").
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct InferenceMetrics {
    pub latency_ms: Option<u64>,
    pub tokens_in: Option<u32>,
    pub tokens_out: Option<u32>,
    pub temperature: Option<f64>,
    pub max_tokens: Option<u32>,
    pub error: Option<String>,
    pub fallback_used: bool,
    /// Free-form quality signals (accuracy, coherence, relevance, user_rating, ...)
    /// consumed by the §4.2 quality-averaging rule.
    #[serde(default)]
    pub quality_signals: HashMap<String, f64>,
}

/// One realized inference request (§3 "InferenceLog"). Append-only.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InferenceLog {
    pub log_id: String,
    pub model_id: String,
    pub use_case: String,
    pub prompt: String,
    pub context: ConfigValue,
    pub generated_output: String,
    pub feedback: Option<String>,
    pub corrected_output: Option<String>,
    pub metrics: InferenceMetrics,
    pub created_at: DateTime<Utc>,
}

/// Rollout strategy for the Deployment Manager (§4.8).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeploymentStrategy {
    BlueGreen,
    Canary,
    AllAtOnce,
    /// Synthetic strategy used only for the Deployment record the Rollback
    /// Manager writes on a successful restore (§4.7) — never passed to
    /// `DeploymentManager::deploy`.
    Rollback,
}

impl DeploymentStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeploymentStrategy::BlueGreen => "blue_green",
            DeploymentStrategy::Canary => "canary",
            DeploymentStrategy::AllAtOnce => "all_at_once",
            DeploymentStrategy::Rollback => "rollback",
        }
    }
}

/// Deployment lifecycle status (§3 "Deployment").
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeploymentStatus {
    InProgress,
    Completed,
    Failed,
    RolledBack,
}

impl DeploymentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeploymentStatus::InProgress => "in_progress",
            DeploymentStatus::Completed => "completed",
            DeploymentStatus::Failed => "failed",
            DeploymentStatus::RolledBack => "rolled_back",
        }
    }
}

/// One rollout record (§3 "Deployment").
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Deployment {
    pub deployment_id: String,
    pub model_id: String,
    pub strategy: DeploymentStrategy,
    pub status: DeploymentStatus,
    pub traffic_percentage: f64,
    pub start_time: DateTime<Utc>,
    pub complete_time: Option<DateTime<Utc>>,
    pub rollback_reason: Option<String>,
}

/// Immutable captured model + traffic state used as a rollback target
/// (§3 "Snapshot").
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Snapshot {
    pub snapshot_id: String,
    pub model_id: String,
    pub config: ConfigValue,
    pub metrics: ConfigValue,
    pub traffic_percentage: f64,
    pub artifact_location: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Guardrails violation category (§3 "GuardrailsViolation").
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ViolationCategory {
    Safety,
    Addiction,
    HarmfulContent,
    Bias,
}

/// Guardrails violation severity (§4.3).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

/// One persisted guardrails finding (§3 "GuardrailsViolation").
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GuardrailsViolation {
    pub violation_id: String,
    pub model_id: String,
    pub category: ViolationCategory,
    pub severity: Severity,
    pub details: ConfigValue,
    pub output_sample: String,
    pub intervention: String,
    pub created_at: DateTime<Utc>,
}

/// Fine-tune job lifecycle status (§3 "FineTuneJob").
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FineTuneStatus {
    Preparing,
    Training,
    Validating,
    Promoted,
    Failed,
}

/// LoRA or full fine-tune hyperparameters (§4.9 step 8).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Hyperparameters {
    pub method: FineTuneMethod,
    pub learning_rate: f64,
    pub epochs: u32,
    pub batch_size: u32,
    pub gradient_accumulation: Option<u32>,
    pub max_seq_len: Option<u32>,
    pub lora_rank: Option<u32>,
    pub lora_alpha: Option<u32>,
    pub target_modules: Option<Vec<String>>,
    pub instance_type: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FineTuneMethod {
    Lora,
    Full,
}

/// One fine-tuning job (§3 "FineTuneJob").
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FineTuneJob {
    pub job_id: String,
    pub base_model_id: String,
    pub use_case: String,
    pub remote_handle: Option<String>,
    pub hyperparameters: Hyperparameters,
    pub dataset_train_ref: Option<String>,
    pub dataset_validation_ref: Option<String>,
    pub status: FineTuneStatus,
    pub validation_success_rate: Option<f64>,
    pub created_at: DateTime<Utc>,
}

/// A selection made by the Cost-Benefit Router (§3 "RouterDecision",
/// ephemeral — never persisted).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouterDecision {
    pub model_id: String,
    pub model_name: String,
    pub priority: Priority,
    pub rationale: String,
    pub is_fallback: bool,
}

/// Router selection priority (§4.4).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    Cost,
    Balanced,
    Quality,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_round_trips_through_str() {
        for status in [
            ModelStatus::Candidate,
            ModelStatus::Testing,
            ModelStatus::Current,
            ModelStatus::Deprecated,
            ModelStatus::NeedsReview,
            ModelStatus::Failed,
        ] {
            assert_eq!(ModelStatus::parse(status.as_str()), Some(status));
        }
    }

    #[test]
    fn shallow_merge_overwrites_only_named_keys() {
        let mut base = serde_json::json!({"endpoint": "http://a", "traffic_percentage": 10});
        let patch = serde_json::json!({"traffic_percentage": 25});
        shallow_merge(&mut base, &patch);
        assert_eq!(base["endpoint"], "http://a");
        assert_eq!(base["traffic_percentage"], 25);
    }

    #[test]
    fn config_view_reads_typed_fields() {
        let config = serde_json::json!({
            "endpoint": "http://ep/generate",
            "traffic_percentage": 50.0,
            "block_outputs": true,
            "lora_rank": 64,
        });
        assert_eq!(config.endpoint(), Some("http://ep/generate"));
        assert_eq!(config.traffic_percentage(), Some(50.0));
        assert!(config.block_outputs());
        assert_eq!(config.lora_rank(), Some(64));
    }
}
