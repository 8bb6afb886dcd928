//! LLM Client subsystem: request/response types (C5 wire contract), the
//! per-backend circuit breaker, the Cost-Benefit Router (C4), the
//! Response Cache (C6), and the client that ties them together (C5).

mod cache;
mod circuit;
mod client;
mod router;
mod types;

pub use cache::{CacheMetrics, ResponseCache};
pub use circuit::{Admission, BreakerPhase, CircuitBreakerConfig, CircuitBreakerRegistry};
pub use client::LlmClient;
pub use router::CostBenefitRouter;
pub use types::{
    BackendCallRequest, BackendCallResponse, FallbackTemplates, GenerateRequest, GenerateResponse,
};
