//! Persistence for [`crate::types::GuardrailsViolation`] records.

use chrono::Utc;
use rusqlite::{params, Row};

use super::monitor::Violation;
use crate::error::Result;
use crate::storage::Db;
use crate::types::{GuardrailsViolation, Severity, ViolationCategory};

fn category_str(category: ViolationCategory) -> &'static str {
    match category {
        ViolationCategory::Safety => "safety",
        ViolationCategory::Addiction => "addiction",
        ViolationCategory::HarmfulContent => "harmful_content",
        ViolationCategory::Bias => "bias",
    }
}

fn parse_category(s: &str) -> ViolationCategory {
    match s {
        "addiction" => ViolationCategory::Addiction,
        "harmful_content" => ViolationCategory::HarmfulContent,
        "bias" => ViolationCategory::Bias,
        _ => ViolationCategory::Safety,
    }
}

fn severity_str(severity: Severity) -> &'static str {
    match severity {
        Severity::Low => "low",
        Severity::Medium => "medium",
        Severity::High => "high",
        Severity::Critical => "critical",
    }
}

fn parse_severity(s: &str) -> Severity {
    match s {
        "medium" => Severity::Medium,
        "high" => Severity::High,
        "critical" => Severity::Critical,
        _ => Severity::Low,
    }
}

fn row_to_violation(row: &Row<'_>) -> rusqlite::Result<GuardrailsViolation> {
    let category: String = row.get("category")?;
    let severity: String = row.get("severity")?;
    let details_json: String = row.get("details_json")?;
    let created_at: String = row.get("created_at")?;

    Ok(GuardrailsViolation {
        violation_id: row.get("violation_id")?,
        model_id: row.get("model_id")?,
        category: parse_category(&category),
        severity: parse_severity(&severity),
        details: serde_json::from_str(&details_json).unwrap_or(serde_json::json!({})),
        output_sample: row.get("output_sample")?,
        intervention: row.get("intervention")?,
        created_at: chrono::DateTime::parse_from_rfc3339(&created_at)
            .map(|dt| dt.with_timezone(&Utc))
            .unwrap_or_else(|_| Utc::now()),
    })
}

/// Persists scored [`Violation`]s alongside their intervention decision.
#[derive(Clone)]
pub struct ViolationStore {
    db: Db,
}

impl ViolationStore {
    pub fn new(db: Db) -> Self {
        Self { db }
    }

    pub fn record(&self, model_id: &str, violation: &Violation, intervention: &str) -> Result<String> {
        let violation_id = uuid::Uuid::new_v4().to_string();
        let now = Utc::now().to_rfc3339();

        self.db.with_conn(|conn| {
            conn.execute(
                "INSERT INTO guardrails_violations (violation_id, model_id, category, severity, details_json, output_sample, intervention, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                params![
                    violation_id,
                    model_id,
                    category_str(violation.category),
                    severity_str(violation.severity),
                    serde_json::json!({"details": violation.details}).to_string(),
                    violation.output_sample,
                    intervention,
                    now,
                ],
            )
        })?;

        Ok(violation_id)
    }

    pub fn list_for_model(&self, model_id: &str) -> Result<Vec<GuardrailsViolation>> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT * FROM guardrails_violations WHERE model_id = ?1 ORDER BY created_at DESC",
            )?;
            let rows = stmt.query_map(params![model_id], row_to_violation)?;
            rows.collect()
        })
    }
}
