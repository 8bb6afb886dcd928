//! Interface to the object-storage and training-cluster systems the
//! Fine-Tuning Orchestrator submits work to. Both are out-of-scope
//! external collaborators (§1) — these traits are the seam; production
//! wiring plugs in whatever S3-compatible client and training-cluster API
//! the deployment actually uses.

use async_trait::async_trait;

use crate::error::Result;

/// Uploads dataset blobs and returns the location they were written to.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    async fn put(&self, key: &str, body: &[u8]) -> Result<String>;
}

/// Submits and observes remote training jobs.
#[async_trait]
pub trait TrainingBackend: Send + Sync {
    async fn submit(&self, spec: TrainingJobSpec) -> Result<String>;
}

#[derive(Debug, Clone)]
pub struct TrainingJobSpec {
    pub base_model_id: String,
    pub train_ref: String,
    pub validation_ref: String,
    pub hyperparameters: crate::types::Hyperparameters,
}

/// In-process stand-in used where no real object store is wired up
/// (tests, local development). Writes are retained only for inspection.
#[derive(Default)]
pub struct InMemoryObjectStore {
    bucket: String,
}

impl InMemoryObjectStore {
    pub fn new(bucket: impl Into<String>) -> Self {
        Self { bucket: bucket.into() }
    }
}

#[async_trait]
impl ObjectStore for InMemoryObjectStore {
    async fn put(&self, key: &str, _body: &[u8]) -> Result<String> {
        Ok(format!("{}/{}", self.bucket, key))
    }
}

/// In-process stand-in training backend: accepts the job immediately and
/// hands back a synthetic remote handle. Tests that need a specific
/// validation outcome drive it through the orchestrator's `LlmClient`
/// instead of this backend.
#[derive(Default)]
pub struct NullTrainingBackend;

#[async_trait]
impl TrainingBackend for NullTrainingBackend {
    async fn submit(&self, spec: TrainingJobSpec) -> Result<String> {
        Ok(format!("train-job-{}", spec.base_model_id))
    }
}
