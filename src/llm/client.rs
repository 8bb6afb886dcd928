//! LLM Client (C5, §4.5): issues backend calls on behalf of `generate`,
//! applying circuit breaking, bounded retries, caching, and durable
//! logging of every attempt (successful or not).

use std::sync::Arc;
use std::time::{Duration as StdDuration, Instant};

use reqwest::Client;

use crate::error::{Error, Result};
use crate::historylog::HistoricalLogStore;
use crate::registry::RegistryStore;
use crate::types::{InferenceMetrics, ModelConfigView, Priority};

use super::cache::ResponseCache;
use super::circuit::{Admission, CircuitBreakerRegistry};
use super::router::CostBenefitRouter;
use super::types::{
    BackendCallRequest, BackendCallResponse, FallbackTemplates, GenerateRequest, GenerateResponse,
};

const MAX_RETRIES: u32 = 3;
const BASE_BACKOFF_MS: u64 = 200;
const REQUEST_TIMEOUT_SECS: u64 = 30;

fn is_retryable(error: &Error) -> bool {
    matches!(error, Error::Unavailable(_) | Error::Transport(_))
}

/// The LLM Client (C5): the single place that turns a `GenerateRequest`
/// into a backend call, mediated by the router, cache, and per-backend
/// circuit breaker.
pub struct LlmClient {
    http: Client,
    registry: RegistryStore,
    logs: HistoricalLogStore,
    router: CostBenefitRouter,
    cache: ResponseCache,
    breakers: Arc<CircuitBreakerRegistry>,
    fallbacks: FallbackTemplates,
}

impl LlmClient {
    pub fn new(
        registry: RegistryStore,
        logs: HistoricalLogStore,
        router: CostBenefitRouter,
        cache: ResponseCache,
        breakers: Arc<CircuitBreakerRegistry>,
        fallbacks: FallbackTemplates,
    ) -> Self {
        let http = Client::builder()
            .timeout(StdDuration::from_secs(REQUEST_TIMEOUT_SECS))
            .build()
            .expect("failed to build HTTP client");
        Self {
            http,
            registry,
            logs,
            router,
            cache,
            breakers,
            fallbacks,
        }
    }

    /// `generate(layer, prompt, context, max_tokens, temperature) →
    /// GenerateResponse` (§4.5, §6). Always attempts a historylog write,
    /// with write failures swallowed so a storage hiccup never surfaces to
    /// the caller on the hot path (§7).
    pub async fn generate(&self, request: GenerateRequest) -> Result<GenerateResponse> {
        let decision = self
            .router
            .select(&request.layer, &request.context, Priority::Balanced)?;
        if decision.is_fallback {
            return Ok(self.fallback_response(&request, "", &decision.rationale));
        }

        let model = match self.registry.get(&decision.model_id)? {
            Some(model) => model,
            None => {
                return Ok(self.fallback_response(
                    &request,
                    &decision.model_id,
                    "routed model no longer exists",
                ))
            }
        };

        let backend = model.config.endpoint().unwrap_or_default().to_string();
        if backend.is_empty() {
            return Ok(self.fallback_response(
                &request,
                &model.model_id,
                "model has no endpoint configured",
            ));
        }

        if self.breakers.admit(&backend) == Admission::Rejected {
            tracing::warn!(backend = %backend, model_id = %model.model_id, "circuit open, serving fallback");
            self.log_attempt(&model.model_id, &request, None, None, Some("circuit_open"), true);
            return Ok(self.fallback_response(&request, &model.model_id, "circuit open"));
        }

        let call = BackendCallRequest {
            prompt: request.prompt.clone(),
            context: request.context.clone(),
            max_tokens: request.max_tokens,
            temperature: request.temperature,
        };

        // Single-flight: concurrent identical fingerprints collapse onto
        // one retry loop instead of each issuing their own backend calls.
        let compute = || self.call_with_retries(&model.model_id, &backend, &call);
        let result = if request.use_cache {
            self.cache.get_or_compute(&request, compute).await
        } else {
            compute().await
        };

        match result {
            Ok(response) => {
                self.log_attempt(
                    &model.model_id,
                    &request,
                    Some(response.latency_ms),
                    Some(&response.text),
                    None,
                    false,
                );
                Ok(response)
            }
            Err(e) => {
                let error_text = e.to_string();
                self.log_attempt(&model.model_id, &request, None, None, Some(&error_text), true);
                Ok(self.fallback_response(&request, &model.model_id, &error_text))
            }
        }
    }

    /// Bounded-retry loop over a single backend with exponential backoff
    /// between attempts (§4.5 step 4). Returns `Err` only once every
    /// attempt is exhausted.
    async fn call_with_retries(
        &self,
        model_id: &str,
        backend: &str,
        call: &BackendCallRequest,
    ) -> Result<GenerateResponse> {
        let mut last_error: Option<Error> = None;
        for attempt in 0..=MAX_RETRIES {
            let started = Instant::now();
            match self.call_backend(backend, call).await {
                Ok(backend_response) => {
                    self.breakers.record_success(backend);
                    let latency_ms = started.elapsed().as_millis() as u64;
                    return Ok(GenerateResponse {
                        success: true,
                        text: backend_response.text,
                        tokens_used: backend_response.tokens_used,
                        model_id: model_id.to_string(),
                        latency_ms,
                        service: backend.to_string(),
                        cached: false,
                        error: None,
                        fallback: false,
                    });
                }
                Err(e) => {
                    self.breakers.record_failure(backend);
                    let retryable = is_retryable(&e);
                    tracing::warn!(backend, attempt, error = %e, retryable, "backend call failed");
                    let keep_trying = retryable && attempt < MAX_RETRIES;
                    last_error = Some(e);
                    if !keep_trying {
                        break;
                    }
                    let delay_ms = BASE_BACKOFF_MS * 2u64.pow(attempt);
                    tokio::time::sleep(StdDuration::from_millis(delay_ms)).await;
                }
            }
        }
        Err(last_error.unwrap_or_else(|| Error::internal("exhausted retries")))
    }

    /// Any non-2xx status is treated as retryable (§4.5 step 4: a backend
    /// call is retried "on any non-200 response"), not just 5xx/429.
    async fn call_backend(
        &self,
        backend: &str,
        call: &BackendCallRequest,
    ) -> Result<BackendCallResponse> {
        let response = self.http.post(backend).json(call).send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(Error::unavailable(format!("backend returned {status}")));
        }
        Ok(response.json::<BackendCallResponse>().await?)
    }

    fn fallback_response(
        &self,
        request: &GenerateRequest,
        model_id: &str,
        reason: &str,
    ) -> GenerateResponse {
        GenerateResponse {
            success: false,
            text: self.fallbacks.get(&request.layer).to_string(),
            tokens_used: 0,
            model_id: model_id.to_string(),
            latency_ms: 0,
            service: "fallback".to_string(),
            cached: false,
            error: Some(reason.to_string()),
            fallback: true,
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn log_attempt(
        &self,
        model_id: &str,
        request: &GenerateRequest,
        latency_ms: Option<u64>,
        output: Option<&str>,
        error: Option<&str>,
        fallback_used: bool,
    ) {
        let metrics = InferenceMetrics {
            latency_ms,
            tokens_in: None,
            tokens_out: None,
            temperature: Some(request.temperature),
            max_tokens: Some(request.max_tokens),
            error: error.map(|s| s.to_string()),
            fallback_used,
            quality_signals: Default::default(),
        };
        let result = self.logs.log(
            model_id,
            &request.layer,
            &request.prompt,
            request.context.clone(),
            output.unwrap_or(""),
            metrics,
            None,
            None,
        );
        if let Err(e) = result {
            tracing::error!(error = %e, "failed to persist inference log");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::Db;
    use crate::types::ModelKind;

    fn client() -> LlmClient {
        let db = Db::in_memory().unwrap();
        let registry = RegistryStore::new(db.clone());
        let logs = HistoricalLogStore::new(db);
        let router = CostBenefitRouter::new(registry.clone(), logs.clone());
        let cache = ResponseCache::new(3600);
        let breakers = Arc::new(CircuitBreakerRegistry::new(Default::default()));
        LlmClient::new(registry, logs, router, cache, breakers, FallbackTemplates::default())
    }

    #[tokio::test]
    async fn unknown_use_case_returns_fallback_without_calling_backend() {
        let client = client();
        let request = GenerateRequest::new("never_registered_layer", "hello");
        let response = client.generate(request).await.unwrap();
        assert!(response.fallback);
        assert!(!response.success);
    }

    #[tokio::test]
    async fn missing_endpoint_returns_fallback_and_still_logs() {
        let client = client();
        let model_id = client
            .registry
            .register(
                "m1",
                ModelKind::Hosted,
                "p",
                "foundation_layer",
                "v1",
                serde_json::json!({}),
                None,
                None,
            )
            .unwrap();
        client
            .registry
            .update_status(&model_id, crate::types::ModelStatus::Current)
            .unwrap();

        let response = client
            .generate(GenerateRequest::new("foundation_layer", "hello"))
            .await
            .unwrap();
        assert!(response.fallback);

        let logged = client.logs.query(Some(&model_id), None, None, 10).unwrap();
        assert_eq!(logged.len(), 1);
        assert_eq!(logged[0].metrics.fallback_used, true);
    }
}
