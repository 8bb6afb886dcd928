//! Historical Log Store (C2, §4.2): append-only inference log, windowed
//! aggregation, and the training-example mapping rule used by the
//! Fine-Tuning Orchestrator.

mod store;

pub use store::{compute_quality, Aggregate, HistoricalLogStore, TimeRange};
