//! Meta-Management Loop (C10).

mod discovery;
#[path = "loop_.rs"]
mod meta_loop;

pub use discovery::{DiscoveredModel, ModelDiscovery, NullDiscovery};
pub use meta_loop::{default_degradation_rule, Decision, MetaLoop};
