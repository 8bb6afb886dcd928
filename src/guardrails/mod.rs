//! Guardrails Monitor (C3, §4.3): output-level safety/engagement/harmful-
//! content scoring with tiered, caller-applied intervention.

mod moderator;
mod monitor;
mod store;

pub use moderator::{ContentModerator, ExternalModerator, KeywordModerator, ModerationOutcome};
pub use monitor::{
    CategoryScores, DefaultInterventionHandler, GuardrailsMonitor, InterventionHandler,
    MonitoringResult, Violation,
};
pub use store::ViolationStore;
