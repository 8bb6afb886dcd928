//! Public API surface (C11).

mod surface;

pub use surface::{
    CheckForBetterResponse, ControlPlane, DeployResponse, FineTuneResponse,
    RegisterModelResponse, RollbackResponse, SeedExample, ServicePerformanceSnapshot,
    ServiceStatusResponse,
};
