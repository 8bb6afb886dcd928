//! Fine-Tuning Orchestrator (C9).

mod dataset;
mod object_store;
mod orchestrator;
mod store;

pub use dataset::{ChatTemplate, TrainingExample};
pub use object_store::{InMemoryObjectStore, NullTrainingBackend, ObjectStore, TrainingBackend, TrainingJobSpec};
pub use orchestrator::FineTuneOrchestrator;
pub use store::FineTuneJobStore;
