//! SQLite-backed implementation of the Historical Log Store contract (§4.2).

use chrono::{DateTime, Duration, Utc};
use rusqlite::{params, Row};

use crate::error::Result;
use crate::storage::Db;
use crate::types::{InferenceLog, InferenceMetrics};

fn parse_datetime(s: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}

fn row_to_log(row: &Row<'_>) -> rusqlite::Result<InferenceLog> {
    let context_json: String = row.get("context_json")?;
    let feedback_json: Option<String> = row.get("feedback_json")?;
    let metrics_json: String = row.get("metrics_json")?;
    let created_at: String = row.get("created_at")?;

    Ok(InferenceLog {
        log_id: row.get("log_id")?,
        model_id: row.get("model_id")?,
        use_case: row.get("use_case")?,
        prompt: row.get("prompt")?,
        context: serde_json::from_str(&context_json).unwrap_or(serde_json::json!({})),
        generated_output: row.get("output")?,
        feedback: feedback_json,
        corrected_output: row.get("corrected_output")?,
        metrics: serde_json::from_str(&metrics_json).unwrap_or_default(),
        created_at: parse_datetime(&created_at),
    })
}

/// An inclusive/exclusive time window `[since, until)` for `query`.
#[derive(Debug, Clone)]
pub struct TimeRange {
    pub since: DateTime<Utc>,
    pub until: DateTime<Utc>,
}

impl TimeRange {
    pub fn last(duration: Duration) -> Self {
        let until = Utc::now();
        Self {
            since: until - duration,
            until,
        }
    }
}

/// Result of `aggregate` (§4.2).
#[derive(Debug, Clone, Default)]
pub struct Aggregate {
    pub total: u64,
    pub errors: u64,
    pub p50_latency_ms: f64,
    pub p95_latency_ms: f64,
    pub avg_quality: f64,
}

impl Aggregate {
    pub fn error_rate(&self) -> f64 {
        if self.total == 0 {
            0.0
        } else {
            self.errors as f64 / self.total as f64
        }
    }
}

/// §4.2's quality-averaging rule, shared with the Fine-Tuning Orchestrator
/// (§4.9 step 2): `corrected_output` present ⇒ 1.0; else a weighted blend
/// of whatever quality signals are present, defaulting each missing signal
/// to 0.5.
pub fn compute_quality(log: &InferenceLog) -> f64 {
    if log.corrected_output.is_some() {
        return 1.0;
    }

    let signal = |name: &str| *log.metrics.quality_signals.get(name).unwrap_or(&0.5);
    let accuracy = signal("accuracy");
    let coherence = signal("coherence");
    let relevance = signal("relevance");
    let user_rating = signal("user_rating");

    0.3 * accuracy + 0.3 * coherence + 0.2 * relevance + 0.2 * user_rating
}

fn percentile(mut values: Vec<u64>, pct: f64) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    values.sort_unstable();
    let rank = (pct * (values.len() as f64 - 1.0)).round() as usize;
    values[rank.min(values.len() - 1)] as f64
}

/// The Historical Log Store (C2). Owns all `InferenceLog` records
/// exclusively (§3 "Ownership").
#[derive(Clone)]
pub struct HistoricalLogStore {
    db: Db,
}

impl HistoricalLogStore {
    pub fn new(db: Db) -> Self {
        Self { db }
    }

    /// `log(...)` (§4.2). Write failures are the caller's responsibility to
    /// swallow on the inference hot path (§7 propagation policy); this
    /// method itself just reports them.
    #[allow(clippy::too_many_arguments)]
    pub fn log(
        &self,
        model_id: &str,
        use_case: &str,
        prompt: &str,
        context: serde_json::Value,
        output: &str,
        metrics: InferenceMetrics,
        feedback: Option<String>,
        corrected_output: Option<String>,
    ) -> Result<String> {
        let log_id = uuid::Uuid::new_v4().to_string();
        let now = Utc::now().to_rfc3339();

        self.db.with_conn(|conn| {
            conn.execute(
                "INSERT INTO inference_logs (log_id, model_id, use_case, prompt, context_json, output, feedback_json, corrected_output, metrics_json, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
                params![
                    log_id,
                    model_id,
                    use_case,
                    prompt,
                    context.to_string(),
                    output,
                    feedback,
                    corrected_output,
                    serde_json::to_string(&metrics).unwrap_or_else(|_| "{}".to_string()),
                    now,
                ],
            )
        })?;

        Ok(log_id)
    }

    /// `query(model_id?, use_case?, time_range?, limit) → [InferenceLog]`,
    /// newest-first (§4.2).
    pub fn query(
        &self,
        model_id: Option<&str>,
        use_case: Option<&str>,
        time_range: Option<&TimeRange>,
        limit: u32,
    ) -> Result<Vec<InferenceLog>> {
        self.db.with_conn(|conn| {
            let mut sql = String::from("SELECT * FROM inference_logs WHERE 1=1");
            let mut boxed_params: Vec<Box<dyn rusqlite::ToSql>> = Vec::new();

            if let Some(model_id) = model_id {
                sql.push_str(" AND model_id = ?");
                boxed_params.push(Box::new(model_id.to_string()));
            }
            if let Some(use_case) = use_case {
                sql.push_str(" AND use_case = ?");
                boxed_params.push(Box::new(use_case.to_string()));
            }
            if let Some(range) = time_range {
                sql.push_str(" AND created_at >= ? AND created_at < ?");
                boxed_params.push(Box::new(range.since.to_rfc3339()));
                boxed_params.push(Box::new(range.until.to_rfc3339()));
            }
            sql.push_str(" ORDER BY created_at DESC LIMIT ?");
            boxed_params.push(Box::new(limit));

            let mut stmt = conn.prepare(&sql)?;
            let param_refs: Vec<&dyn rusqlite::ToSql> =
                boxed_params.iter().map(|p| p.as_ref()).collect();
            let rows = stmt.query_map(param_refs.as_slice(), row_to_log)?;
            rows.collect()
        })
    }

    /// `aggregate(model_id, window) → {total, errors, p50/p95 latency,
    /// avg_quality}` — a thin helper over `query` (§4.2).
    pub fn aggregate(&self, model_id: &str, window: Duration) -> Result<Aggregate> {
        let range = TimeRange::last(window);
        let logs = self.query(Some(model_id), None, Some(&range), 100_000)?;

        if logs.is_empty() {
            return Ok(Aggregate::default());
        }

        let total = logs.len() as u64;
        let errors = logs.iter().filter(|l| l.metrics.error.is_some()).count() as u64;
        let latencies: Vec<u64> = logs.iter().filter_map(|l| l.metrics.latency_ms).collect();
        let avg_quality =
            logs.iter().map(compute_quality).sum::<f64>() / logs.len() as f64;

        Ok(Aggregate {
            total,
            errors,
            p50_latency_ms: percentile(latencies.clone(), 0.50),
            p95_latency_ms: percentile(latencies, 0.95),
            avg_quality,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> HistoricalLogStore {
        HistoricalLogStore::new(Db::in_memory().unwrap())
    }

    fn metrics(latency_ms: u64, error: Option<&str>) -> InferenceMetrics {
        InferenceMetrics {
            latency_ms: Some(latency_ms),
            error: error.map(|s| s.to_string()),
            ..Default::default()
        }
    }

    #[test]
    fn log_then_query_returns_newest_first() {
        let store = store();
        store
            .log("m1", "foundation_layer", "p1", serde_json::json!({}), "o1", metrics(10, None), None, None)
            .unwrap();
        store
            .log("m1", "foundation_layer", "p2", serde_json::json!({}), "o2", metrics(20, None), None, None)
            .unwrap();

        let logs = store.query(Some("m1"), None, None, 10).unwrap();
        assert_eq!(logs.len(), 2);
        assert_eq!(logs[0].prompt, "p2");
        assert_eq!(logs[1].prompt, "p1");
    }

    #[test]
    fn aggregate_computes_error_rate_and_percentiles() {
        let store = store();
        for i in 0..10 {
            let error = if i < 2 { Some("boom") } else { None };
            store
                .log("m1", "foundation_layer", "p", serde_json::json!({}), "o", metrics(100 + i * 10, error), None, None)
                .unwrap();
        }

        let agg = store.aggregate("m1", Duration::minutes(30)).unwrap();
        assert_eq!(agg.total, 10);
        assert_eq!(agg.errors, 2);
        assert!((agg.error_rate() - 0.2).abs() < 1e-9);
    }

    #[test]
    fn aggregate_with_zero_events_is_not_an_issue() {
        let store = store();
        let agg = store.aggregate("unknown", Duration::minutes(30)).unwrap();
        assert_eq!(agg.total, 0);
        assert_eq!(agg.errors, 0);
    }

    #[test]
    fn corrected_output_always_scores_quality_one() {
        let log = InferenceLog {
            log_id: "l1".into(),
            model_id: "m1".into(),
            use_case: "story_generation".into(),
            prompt: "p".into(),
            context: serde_json::json!({}),
            generated_output: "o".into(),
            feedback: None,
            corrected_output: Some("fixed".into()),
            metrics: InferenceMetrics::default(),
            created_at: Utc::now(),
        };
        assert_eq!(compute_quality(&log), 1.0);
    }

    #[test]
    fn missing_signals_default_to_half() {
        let log = InferenceLog {
            log_id: "l1".into(),
            model_id: "m1".into(),
            use_case: "story_generation".into(),
            prompt: "p".into(),
            context: serde_json::json!({}),
            generated_output: "o".into(),
            feedback: None,
            corrected_output: None,
            metrics: InferenceMetrics::default(),
            created_at: Utc::now(),
        };
        assert_eq!(compute_quality(&log), 0.5);
    }
}
