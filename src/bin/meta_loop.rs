//! Meta-Management Loop binary entry point (§10.1): installs the process
//! tracing subscriber and drives [`control_plane::meta::MetaLoop`] until
//! ctrl-c.

use std::sync::Arc;

use control_plane::config::Config;
use control_plane::deployment::{DeploymentManager, DeploymentStore};
use control_plane::error::Result;
use control_plane::finetune::{FineTuneJobStore, FineTuneOrchestrator, InMemoryObjectStore, NullTrainingBackend};
use control_plane::guardrails::{ExternalModerator, GuardrailsMonitor, KeywordModerator, ViolationStore};
use control_plane::historylog::HistoricalLogStore;
use control_plane::llm::{CircuitBreakerConfig, CircuitBreakerRegistry, CostBenefitRouter, FallbackTemplates, LlmClient, ResponseCache};
use control_plane::meta::{MetaLoop, NullDiscovery};
use control_plane::registry::RegistryStore;
use control_plane::rollback::{RollbackManager, SnapshotStore};
use control_plane::storage::Db;

/// Use cases the meta-loop manages. In production this would come from a
/// discovery/config service rather than a literal; the control plane's
/// external interfaces don't yet define one (§9 open question).
const MANAGED_USE_CASES: &[&str] = &["foundation", "story_generation", "dialogue"];

fn build_safety_moderator(config: &Config) -> Arc<dyn control_plane::guardrails::ContentModerator> {
    match (&config.moderation_provider, &config.moderation_api_key) {
        (Some(endpoint), Some(key)) => Arc::new(ExternalModerator::new(endpoint.clone(), key.clone())),
        _ => Arc::new(KeywordModerator),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .json()
        .init();

    let config = Config::from_env()?;
    tracing::info!(check_interval_sec = config.check_interval_sec, "starting meta-management loop");

    let db = Db::open(&config.db_name)?;
    let registry = RegistryStore::new(db.clone());
    let logs = HistoricalLogStore::new(db.clone());

    let guardrails = GuardrailsMonitor::new(
        build_safety_moderator(&config),
        build_safety_moderator(&config),
        ViolationStore::new(db.clone()),
    );

    let router = CostBenefitRouter::new(registry.clone(), logs.clone());
    let cache = ResponseCache::new(config.cache_ttl_sec as i64);
    let breakers = Arc::new(CircuitBreakerRegistry::new(CircuitBreakerConfig {
        failure_threshold: config.circuit_failure_threshold,
        timeout_sec: config.circuit_timeout_sec as i64,
    }));
    let llm = Arc::new(LlmClient::new(
        registry.clone(),
        logs.clone(),
        router,
        cache,
        breakers,
        FallbackTemplates::default(),
    ));

    let rollback = Arc::new(RollbackManager::new(
        registry.clone(),
        SnapshotStore::new(db.clone()),
        DeploymentStore::new(db.clone()),
    ));
    let deployment = Arc::new(DeploymentManager::new(
        registry.clone(),
        logs.clone(),
        RollbackManager::new(registry.clone(), SnapshotStore::new(db.clone()), DeploymentStore::new(db.clone())),
        DeploymentStore::new(db.clone()),
    ));
    let _finetune = Arc::new(FineTuneOrchestrator::new(
        registry.clone(),
        logs.clone(),
        FineTuneJobStore::new(db.clone()),
        llm.clone(),
        Arc::new(InMemoryObjectStore::new("control-plane-artifacts")),
        Arc::new(NullTrainingBackend),
        "control-plane-artifacts",
    ));

    let meta_loop = MetaLoop::new(
        registry,
        logs,
        guardrails,
        rollback,
        deployment,
        Arc::new(NullDiscovery),
        MANAGED_USE_CASES.iter().map(|s| s.to_string()).collect(),
        config.check_interval_sec,
    );

    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    tokio::spawn(async move {
        let _ = tokio::signal::ctrl_c().await;
        tracing::info!("ctrl-c received, signaling meta-loop shutdown");
        let _ = shutdown_tx.send(true);
    });

    meta_loop.run(shutdown_rx).await;
    Ok(())
}
