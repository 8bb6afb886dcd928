//! Cost-Benefit Router (C4, §4.4): per-request model selection given task,
//! context, and priority.

use chrono::Duration;

use crate::error::{Error, Result};
use crate::historylog::HistoricalLogStore;
use crate::registry::RegistryStore;
use crate::types::{ConfigValue, Model, ModelKind, Priority, RouterDecision};

const COST_BASELINE_USD_PER_1K: f64 = 0.001;
const AGGREGATE_WINDOW_MINUTES: i64 = 60;

/// Normalized scoring weights for the four axes (§4.4).
#[derive(Debug, Clone, Copy)]
struct Weights {
    performance: f64,
    cost: f64,
    latency: f64,
    quality: f64,
}

impl Weights {
    const DEFAULT: Weights = Weights {
        performance: 0.3,
        cost: 0.2,
        latency: 0.2,
        quality: 0.3,
    };

    fn normalized(self) -> Self {
        let total = self.performance + self.cost + self.latency + self.quality;
        if total <= 0.0 {
            return Self::DEFAULT;
        }
        Self {
            performance: self.performance / total,
            cost: self.cost / total,
            latency: self.latency / total,
            quality: self.quality / total,
        }
    }

    /// Shift weights per use_case flavor (§4.4): story-oriented shifts
    /// toward quality/performance, dialogue toward latency/quality,
    /// decision/reasoning toward performance/quality.
    fn for_use_case(use_case: &str) -> Self {
        let lowered = use_case.to_lowercase();
        let base = if lowered.contains("story") || lowered.contains("narrative") {
            Weights {
                performance: 0.35,
                cost: 0.15,
                latency: 0.15,
                quality: 0.35,
            }
        } else if lowered.contains("dialogue") || lowered.contains("interaction") {
            Weights {
                performance: 0.2,
                cost: 0.15,
                latency: 0.35,
                quality: 0.3,
            }
        } else if lowered.contains("decision") || lowered.contains("reasoning") || lowered.contains("coordination") {
            Weights {
                performance: 0.4,
                cost: 0.15,
                latency: 0.15,
                quality: 0.3,
            }
        } else {
            Self::DEFAULT
        };
        base.normalized()
    }

    /// Further shift weights by the caller's stated priority.
    fn with_priority(mut self, priority: Priority) -> Self {
        match priority {
            Priority::Cost => self.cost += 0.2,
            Priority::Quality => self.quality += 0.2,
            Priority::Balanced => {}
        }
        self.normalized()
    }
}

fn performance_score(model: &Model, logs: &HistoricalLogStore) -> f64 {
    let benchmark = model
        .metrics
        .get("benchmark_score")
        .and_then(|v| v.as_f64())
        .unwrap_or(0.5);

    let aggregate = logs
        .aggregate(&model.model_id, Duration::minutes(AGGREGATE_WINDOW_MINUTES))
        .ok();

    match aggregate {
        Some(agg) if agg.total > 0 => (benchmark + agg.avg_quality) / 2.0,
        _ => benchmark,
    }
}

fn cost_efficiency_score(model: &Model) -> f64 {
    if model.kind == ModelKind::SelfServed {
        return 1.0;
    }
    let price_per_1k = model
        .config
        .get("price_per_1k_tokens")
        .and_then(|v| v.as_f64())
        .unwrap_or(COST_BASELINE_USD_PER_1K);
    (1.0 - price_per_1k / COST_BASELINE_USD_PER_1K).max(0.0)
}

fn latency_score(model: &Model, logs: &HistoricalLogStore) -> f64 {
    let p50 = logs
        .aggregate(&model.model_id, Duration::minutes(AGGREGATE_WINDOW_MINUTES))
        .map(|agg| agg.p50_latency_ms)
        .unwrap_or(0.0);

    if p50 <= 0.0 {
        0.6 // no data yet: assume the <500ms bucket rather than rewarding silence
    } else if p50 < 100.0 {
        1.0
    } else if p50 < 200.0 {
        0.8
    } else if p50 < 500.0 {
        0.6
    } else if p50 < 1000.0 {
        0.4
    } else {
        0.2
    }
}

fn quality_score(model: &Model) -> f64 {
    let field = |name: &str| model.metrics.get(name).and_then(|v| v.as_f64());
    let values: Vec<f64> = ["coherence", "relevance", "creativity"]
        .iter()
        .filter_map(|name| field(name))
        .collect();
    if values.is_empty() {
        0.5
    } else {
        values.iter().sum::<f64>() / values.len() as f64
    }
}

fn score_model(model: &Model, weights: Weights, logs: &HistoricalLogStore) -> f64 {
    weights.performance * performance_score(model, logs)
        + weights.cost * cost_efficiency_score(model)
        + weights.latency * latency_score(model, logs)
        + weights.quality * quality_score(model)
}

/// The Cost-Benefit Router (C4).
pub struct CostBenefitRouter {
    registry: RegistryStore,
    logs: HistoricalLogStore,
}

impl CostBenefitRouter {
    pub fn new(registry: RegistryStore, logs: HistoricalLogStore) -> Self {
        Self { registry, logs }
    }

    /// `select(task_type, context, priority) → RouterDecision` (§4.4).
    /// `task_type` is treated as the use_case it maps to 1:1 (the
    /// request-time `layer` is the use_case's request-time analogue, per
    /// the glossary).
    pub fn select(
        &self,
        task_type: &str,
        _context: &ConfigValue,
        priority: Priority,
    ) -> Result<RouterDecision> {
        let current = self.registry.get_current(task_type)?;
        let candidates = self.registry.list_candidates(task_type)?;

        if current.is_none() && candidates.is_empty() {
            return Ok(RouterDecision {
                model_id: String::new(),
                model_name: String::new(),
                priority,
                rationale: format!("no registry entry for use_case {task_type}"),
                is_fallback: true,
            });
        }

        let weights = Weights::for_use_case(task_type).with_priority(priority);

        let current_score = current
            .as_ref()
            .map(|m| score_model(m, weights, &self.logs));

        let best_candidate = candidates
            .iter()
            .map(|m| (m, score_model(m, weights, &self.logs)))
            .max_by(|a, b| a.1.partial_cmp(&b.1).unwrap_or(std::cmp::Ordering::Equal));

        match (best_candidate, &current, current_score) {
            (Some((candidate, candidate_score)), Some(current_model), Some(current_score))
                if candidate_score > current_score =>
            {
                Ok(RouterDecision {
                    model_id: candidate.model_id.clone(),
                    model_name: candidate.name.clone(),
                    priority,
                    rationale: format!(
                        "candidate {} outscored current {} ({:.3} > {:.3})",
                        candidate.model_id, current_model.model_id, candidate_score, current_score
                    ),
                    is_fallback: false,
                })
            }
            (_, Some(current_model), _) => Ok(RouterDecision {
                model_id: current_model.model_id.clone(),
                model_name: current_model.name.clone(),
                priority,
                rationale: "no candidate strictly outscored current".to_string(),
                is_fallback: false,
            }),
            (Some((candidate, _)), None, _) => Ok(RouterDecision {
                model_id: candidate.model_id.clone(),
                model_name: candidate.name.clone(),
                priority,
                rationale: "no current model; best candidate selected".to_string(),
                is_fallback: false,
            }),
            (None, None, _) => Err(Error::not_found(format!(
                "no routable model for use_case {task_type}"
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::Db;

    fn router() -> (CostBenefitRouter, RegistryStore) {
        let db = Db::in_memory().unwrap();
        let registry = RegistryStore::new(db.clone());
        let logs = HistoricalLogStore::new(db);
        (CostBenefitRouter::new(registry.clone(), logs), registry)
    }

    #[test]
    fn fallback_sentinel_when_use_case_unknown() {
        let (router, _registry) = router();
        let decision = router
            .select("nonexistent_use_case", &serde_json::json!({}), Priority::Balanced)
            .unwrap();
        assert!(decision.is_fallback);
    }

    #[test]
    fn keeps_current_when_no_candidate_scores_higher() {
        let (router, registry) = router();
        let m1 = registry
            .register(
                "m1",
                ModelKind::Hosted,
                "p",
                "foundation_layer",
                "v1",
                serde_json::json!({"price_per_1k_tokens": 0.0005}),
                Some(serde_json::json!({"benchmark_score": 0.9, "coherence": 0.9, "relevance": 0.9, "creativity": 0.9})),
                None,
            )
            .unwrap();
        registry.update_status(&m1, crate::types::ModelStatus::Current).unwrap();

        let decision = router
            .select("foundation_layer", &serde_json::json!({}), Priority::Balanced)
            .unwrap();
        assert_eq!(decision.model_id, m1);
        assert!(!decision.is_fallback);
    }

    #[test]
    fn selects_best_candidate_when_no_current() {
        let (router, registry) = router();
        let weak = registry
            .register("weak", ModelKind::Hosted, "p", "dialogue", "v1", serde_json::json!({}), Some(serde_json::json!({"benchmark_score": 0.2})), None)
            .unwrap();
        let strong = registry
            .register(
                "strong",
                ModelKind::SelfServed,
                "p",
                "dialogue",
                "v1",
                serde_json::json!({}),
                Some(serde_json::json!({"benchmark_score": 0.95, "coherence": 0.9, "relevance": 0.9, "creativity": 0.9})),
                None,
            )
            .unwrap();
        let _ = weak;

        let decision = router
            .select("dialogue", &serde_json::json!({}), Priority::Quality)
            .unwrap();
        assert_eq!(decision.model_id, strong);
    }
}
