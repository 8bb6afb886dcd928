//! Interface to the external hosted/self-served model scanners the
//! Meta-Management Loop polls for potentially-better candidates (§4.10
//! step 1). Out of scope as an implementation (§1); this trait is the
//! seam production wiring plugs a real scanner into.

use async_trait::async_trait;

use crate::error::Result;
use crate::types::{ConfigValue, ModelKind};

/// One externally-discovered candidate model, not yet registered.
#[derive(Debug, Clone)]
pub struct DiscoveredModel {
    pub name: String,
    pub kind: ModelKind,
    pub provider: String,
    pub version: String,
    pub config: ConfigValue,
}

#[async_trait]
pub trait ModelDiscovery: Send + Sync {
    async fn discover(&self, use_case: &str) -> Result<Vec<DiscoveredModel>>;
}

/// Default discovery backend: finds nothing. Production wiring replaces
/// this with a real hosted/self-served scanner.
#[derive(Default)]
pub struct NullDiscovery;

#[async_trait]
impl ModelDiscovery for NullDiscovery {
    async fn discover(&self, _use_case: &str) -> Result<Vec<DiscoveredModel>> {
        Ok(Vec::new())
    }
}
