//! Response Cache (C6, §4.6): fingerprints `(layer, prompt, context)`,
//! serves hits within TTL, and collapses concurrent misses for the same
//! fingerprint into a single backend call (single-flight).

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Duration, Utc};
use sha2::{Digest, Sha256};
use tokio::sync::{Mutex, Notify, RwLock};

use crate::error::Result;

use super::types::{GenerateRequest, GenerateResponse};

/// Text beyond this length is truncated before being cached (§4.6:
/// "post-process on miss — truncate, strip oversized metadata").
const MAX_CACHED_TEXT_LEN: usize = 8192;

fn fingerprint(request: &GenerateRequest) -> String {
    let mut hasher = Sha256::new();
    hasher.update(request.layer.as_bytes());
    hasher.update(b"\0");
    hasher.update(request.prompt.as_bytes());
    hasher.update(b"\0");
    hasher.update(normalize_context(&request.context).as_bytes());
    format!("{:x}", hasher.finalize())
}

/// Canonical (key-sorted) rendering of the context document so semantically
/// identical contexts serialized in a different key order still fingerprint
/// the same.
fn normalize_context(context: &serde_json::Value) -> String {
    match context {
        serde_json::Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            let mut out = String::from("{");
            for key in keys {
                out.push_str(key);
                out.push(':');
                out.push_str(&normalize_context(&map[key]));
                out.push(',');
            }
            out.push('}');
            out
        }
        other => other.to_string(),
    }
}

#[derive(Clone)]
struct CachedEntry {
    response: GenerateResponse,
    created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default)]
struct MetricsInner {
    total: u64,
    hits: u64,
    misses: u64,
    latency_sum_ms: u64,
    latency_min_ms: Option<u64>,
    latency_max_ms: Option<u64>,
}

/// Point-in-time cache metrics (§4.6: "expose hit_rate and latency stats").
#[derive(Debug, Clone, Copy)]
pub struct CacheMetrics {
    pub total: u64,
    pub hits: u64,
    pub misses: u64,
    pub hit_rate: f64,
    pub avg_latency_ms: f64,
    pub min_latency_ms: u64,
    pub max_latency_ms: u64,
}

/// The Response Cache (C6).
#[derive(Clone)]
pub struct ResponseCache {
    entries: Arc<RwLock<HashMap<String, CachedEntry>>>,
    in_flight: Arc<Mutex<HashMap<String, Arc<Notify>>>>,
    metrics: Arc<Mutex<MetricsInner>>,
    ttl: Duration,
}

impl ResponseCache {
    pub fn new(ttl_sec: i64) -> Self {
        Self {
            entries: Arc::new(RwLock::new(HashMap::new())),
            in_flight: Arc::new(Mutex::new(HashMap::new())),
            metrics: Arc::new(Mutex::new(MetricsInner::default())),
            ttl: Duration::seconds(ttl_sec.max(0)),
        }
    }

    /// Serve a cache hit if one exists and has not expired; does not
    /// record a miss when absent (callers combine this with
    /// [`ResponseCache::get_or_compute`] or `put` as fits their flow).
    pub async fn get(&self, request: &GenerateRequest) -> Option<GenerateResponse> {
        let key = fingerprint(request);
        let entries = self.entries.read().await;
        let entry = entries.get(&key)?;
        if Utc::now() - entry.created_at > self.ttl {
            return None;
        }
        let mut response = entry.response.clone();
        response.cached = true;
        Some(response)
    }

    pub async fn put(&self, request: &GenerateRequest, mut response: GenerateResponse) {
        if response.text.len() > MAX_CACHED_TEXT_LEN {
            response.text.truncate(MAX_CACHED_TEXT_LEN);
        }
        response.cached = false;
        let key = fingerprint(request);
        let mut entries = self.entries.write().await;
        entries.insert(
            key,
            CachedEntry {
                response,
                created_at: Utc::now(),
            },
        );
    }

    /// Single-flight lookup-or-compute: concurrent callers fingerprinting
    /// to the same key collapse onto one backend call. The first caller to
    /// observe a miss becomes the leader and runs `compute`; everyone else
    /// waits on its result instead of issuing their own request.
    pub async fn get_or_compute<F, Fut>(
        &self,
        request: &GenerateRequest,
        compute: F,
    ) -> Result<GenerateResponse>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<GenerateResponse>>,
    {
        if let Some(hit) = self.get(request).await {
            self.record(true, None).await;
            return Ok(hit);
        }

        let key = fingerprint(request);
        let (is_leader, notify) = {
            let mut in_flight = self.in_flight.lock().await;
            match in_flight.get(&key) {
                Some(existing) => (false, existing.clone()),
                None => {
                    let notify = Arc::new(Notify::new());
                    in_flight.insert(key.clone(), notify.clone());
                    (true, notify)
                }
            }
        };

        if !is_leader {
            notify.notified().await;
            if let Some(hit) = self.get(request).await {
                self.record(true, None).await;
                return Ok(hit);
            }
            // Leader's attempt failed or raced out; fall through and take
            // over as our own leader rather than failing the caller.
        }

        let started = Instant::now();
        let result = compute().await;
        let latency_ms = started.elapsed().as_millis() as u64;
        self.record(false, Some(latency_ms)).await;

        {
            let mut in_flight = self.in_flight.lock().await;
            in_flight.remove(&key);
        }
        notify.notify_waiters();

        let response = result?;
        self.put(request, response.clone()).await;
        Ok(response)
    }

    async fn record(&self, hit: bool, latency_ms: Option<u64>) {
        let mut metrics = self.metrics.lock().await;
        metrics.total += 1;
        if hit {
            metrics.hits += 1;
        } else {
            metrics.misses += 1;
        }
        if let Some(latency_ms) = latency_ms {
            metrics.latency_sum_ms += latency_ms;
            metrics.latency_min_ms = Some(
                metrics
                    .latency_min_ms
                    .map_or(latency_ms, |min| min.min(latency_ms)),
            );
            metrics.latency_max_ms = Some(
                metrics
                    .latency_max_ms
                    .map_or(latency_ms, |max| max.max(latency_ms)),
            );
        }
    }

    pub async fn metrics(&self) -> CacheMetrics {
        let metrics = self.metrics.lock().await;
        let hit_rate = if metrics.total == 0 {
            0.0
        } else {
            metrics.hits as f64 / metrics.total as f64
        };
        let avg_latency_ms = if metrics.misses == 0 {
            0.0
        } else {
            metrics.latency_sum_ms as f64 / metrics.misses as f64
        };
        CacheMetrics {
            total: metrics.total,
            hits: metrics.hits,
            misses: metrics.misses,
            hit_rate,
            avg_latency_ms,
            min_latency_ms: metrics.latency_min_ms.unwrap_or(0),
            max_latency_ms: metrics.latency_max_ms.unwrap_or(0),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn response(text: &str) -> GenerateResponse {
        GenerateResponse {
            success: true,
            text: text.to_string(),
            tokens_used: 10,
            model_id: "m1".to_string(),
            latency_ms: 5,
            service: "http://backend".to_string(),
            cached: false,
            error: None,
            fallback: false,
        }
    }

    #[tokio::test]
    async fn put_then_get_returns_cached_flag_true() {
        let cache = ResponseCache::new(3600);
        let request = GenerateRequest::new("dialogue", "hi");
        cache.put(&request, response("hello")).await;

        let hit = cache.get(&request).await.unwrap();
        assert!(hit.cached);
        assert_eq!(hit.text, "hello");
    }

    #[tokio::test]
    async fn context_key_order_does_not_affect_fingerprint() {
        let cache = ResponseCache::new(3600);
        let r1 = GenerateRequest::new("dialogue", "hi")
            .with_context(serde_json::json!({"a": 1, "b": 2}));
        let r2 = GenerateRequest::new("dialogue", "hi")
            .with_context(serde_json::json!({"b": 2, "a": 1}));
        cache.put(&r1, response("hello")).await;
        assert!(cache.get(&r2).await.is_some());
    }

    #[tokio::test]
    async fn expired_entry_is_not_served() {
        let cache = ResponseCache::new(0);
        let request = GenerateRequest::new("dialogue", "hi");
        cache.put(&request, response("hello")).await;
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        assert!(cache.get(&request).await.is_none());
    }

    #[tokio::test]
    async fn concurrent_misses_collapse_into_one_compute_call() {
        let cache = Arc::new(ResponseCache::new(3600));
        let calls = Arc::new(AtomicU32::new(0));
        let request = GenerateRequest::new("dialogue", "same prompt");

        let mut handles = Vec::new();
        for _ in 0..8 {
            let cache = cache.clone();
            let calls = calls.clone();
            let request = request.clone();
            handles.push(tokio::spawn(async move {
                cache
                    .get_or_compute(&request, || async move {
                        calls.fetch_add(1, Ordering::SeqCst);
                        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
                        Ok(response("computed"))
                    })
                    .await
            }));
        }

        for handle in handles {
            handle.await.unwrap().unwrap();
        }

        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn metrics_track_hits_and_misses() {
        let cache = ResponseCache::new(3600);
        let request = GenerateRequest::new("dialogue", "hi");
        cache
            .get_or_compute(&request, || async { Ok(response("hello")) })
            .await
            .unwrap();
        cache
            .get_or_compute(&request, || async { Ok(response("hello")) })
            .await
            .unwrap();

        let metrics = cache.metrics().await;
        assert_eq!(metrics.misses, 1);
        assert_eq!(metrics.hits, 1);
        assert!((metrics.hit_rate - 0.5).abs() < 1e-9);
    }
}
