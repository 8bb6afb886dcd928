//! Pluggable moderation backend (Design Notes §9: "keep the moderation
//! backend pluggable behind a `ContentModerator` interface; tests replace
//! it with a deterministic stub").

use async_trait::async_trait;
use std::sync::OnceLock;

use crate::error::Result;
use crate::types::Severity;

/// Outcome of a single moderation pass over one output.
#[derive(Debug, Clone, Default)]
pub struct ModerationOutcome {
    /// Whether any category was flagged.
    pub flagged: bool,
    /// The highest category score observed, in `[0, 1]`.
    pub max_score: f64,
    /// Bucketed severity of `max_score` (§4.3 point 1's bucket table).
    pub severity: Option<Severity>,
    /// Free-form detail, e.g. which category/keyword matched.
    pub details: String,
}

/// Buckets a raw moderation score into a severity per §4.3:
/// `{critical > 0.9, high > 0.7, medium > 0.5}`.
pub fn bucket_severity(score: f64) -> Option<Severity> {
    if score > 0.9 {
        Some(Severity::Critical)
    } else if score > 0.7 {
        Some(Severity::High)
    } else if score > 0.5 {
        Some(Severity::Medium)
    } else {
        None
    }
}

/// A moderation backend. Implementations may call an external moderation
/// API (safety pass, harmful-content pass) or fall back to keyword
/// matching when no external service is configured.
#[async_trait]
pub trait ContentModerator: Send + Sync {
    async fn moderate(&self, text: &str) -> Result<ModerationOutcome>;
}

struct KeywordTable {
    critical: Vec<&'static str>,
    high: Vec<&'static str>,
    medium: Vec<&'static str>,
}

fn keyword_table() -> &'static KeywordTable {
    static TABLE: OnceLock<KeywordTable> = OnceLock::new();
    TABLE.get_or_init(|| KeywordTable {
        critical: vec!["kill yourself", "suicide instructions", "how to make a bomb"],
        high: vec!["self harm", "i want to die", "hurt myself"],
        medium: vec!["hate", "violent", "weapon"],
    })
}

/// Always-available fallback moderator used when no external moderation
/// service is configured, or when one is configured but unreachable
/// (§4.3: "Keyword fallback when moderation is unavailable, using a fixed
/// severity table").
#[derive(Default)]
pub struct KeywordModerator;

#[async_trait]
impl ContentModerator for KeywordModerator {
    async fn moderate(&self, text: &str) -> Result<ModerationOutcome> {
        let lowered = text.to_lowercase();
        let table = keyword_table();

        for phrase in &table.critical {
            if lowered.contains(phrase) {
                return Ok(ModerationOutcome {
                    flagged: true,
                    max_score: 0.95,
                    severity: Some(Severity::Critical),
                    details: format!("matched critical keyword '{phrase}'"),
                });
            }
        }
        for phrase in &table.high {
            if lowered.contains(phrase) {
                return Ok(ModerationOutcome {
                    flagged: true,
                    max_score: 0.75,
                    severity: Some(Severity::High),
                    details: format!("matched high-severity keyword '{phrase}'"),
                });
            }
        }
        for phrase in &table.medium {
            if lowered.contains(phrase) {
                return Ok(ModerationOutcome {
                    flagged: true,
                    max_score: 0.55,
                    severity: Some(Severity::Medium),
                    details: format!("matched medium-severity keyword '{phrase}'"),
                });
            }
        }

        Ok(ModerationOutcome {
            flagged: false,
            max_score: 0.0,
            severity: None,
            details: String::new(),
        })
    }
}

/// Moderator backed by an external HTTP moderation service
/// (`MODERATION_PROVIDER` / `MODERATION_API_KEY`, §6). Falls back to the
/// keyword table on transport failure rather than surfacing an error, since
/// guardrails failures must be treated as "cannot attest compliant", not as
/// a hard outage (§4.3 concurrency note).
pub struct ExternalModerator {
    endpoint: String,
    api_key: String,
    client: reqwest::Client,
    fallback: KeywordModerator,
}

impl ExternalModerator {
    pub fn new(endpoint: impl Into<String>, api_key: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            api_key: api_key.into(),
            client: reqwest::Client::new(),
            fallback: KeywordModerator,
        }
    }
}

#[async_trait]
impl ContentModerator for ExternalModerator {
    async fn moderate(&self, text: &str) -> Result<ModerationOutcome> {
        let response = self
            .client
            .post(&self.endpoint)
            .bearer_auth(&self.api_key)
            .json(&serde_json::json!({"input": text}))
            .send()
            .await;

        let response = match response {
            Ok(r) if r.status().is_success() => r,
            _ => {
                tracing::warn!("external moderation unavailable, using keyword fallback");
                return self.fallback.moderate(text).await;
            }
        };

        #[derive(serde::Deserialize)]
        struct ModerationResponse {
            flagged: bool,
            #[serde(default)]
            max_category_score: f64,
        }

        match response.json::<ModerationResponse>().await {
            Ok(body) => Ok(ModerationOutcome {
                flagged: body.flagged,
                max_score: body.max_category_score,
                severity: bucket_severity(body.max_category_score),
                details: "external moderation".to_string(),
            }),
            Err(_) => self.fallback.moderate(text).await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn keyword_moderator_flags_critical_phrase() {
        let moderator = KeywordModerator;
        let outcome = moderator.moderate("just kill yourself already").await.unwrap();
        assert!(outcome.flagged);
        assert_eq!(outcome.severity, Some(Severity::Critical));
    }

    #[tokio::test]
    async fn keyword_moderator_passes_benign_text() {
        let moderator = KeywordModerator;
        let outcome = moderator.moderate("the weather is nice today").await.unwrap();
        assert!(!outcome.flagged);
        assert_eq!(outcome.severity, None);
    }

    #[test]
    fn severity_bucket_boundaries() {
        assert_eq!(bucket_severity(0.9), None);
        assert_eq!(bucket_severity(0.91), Some(Severity::Critical));
        assert_eq!(bucket_severity(0.7), None);
        assert_eq!(bucket_severity(0.71), Some(Severity::High));
        assert_eq!(bucket_severity(0.5), None);
        assert_eq!(bucket_severity(0.51), Some(Severity::Medium));
    }
}
