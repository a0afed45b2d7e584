use moka::future::Cache;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tracing::{debug, warn};

use super::backend::{SamplingBackend, SamplingRequest, SamplingResponse};
use super::circuit_breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitSnapshot};
use crate::error::GateError;

#[derive(Debug, Clone)]
pub struct AiManagerConfig {
    pub cache_ttl: Duration,
    pub cache_capacity: u64,
    pub max_concurrent: usize,
    pub breaker: CircuitBreakerConfig,
}

impl Default for AiManagerConfig {
    fn default() -> Self {
        AiManagerConfig {
            cache_ttl: Duration::from_secs(300),
            cache_capacity: 1000,
            max_concurrent: 10,
            breaker: CircuitBreakerConfig::default(),
        }
    }
}

struct BackendSlot {
    backend: Arc<dyn SamplingBackend>,
    breaker: CircuitBreaker,
}

#[derive(Debug, Clone, Serialize)]
pub struct BackendHealth {
    pub name: String,
    pub model: Option<String>,
    pub healthy: bool,
    pub circuit: CircuitSnapshot,
}

#[derive(Debug, Clone, Serialize)]
pub struct AiHealth {
    pub healthy: bool,
    pub backends: Vec<BackendHealth>,
    pub cached_responses: u64,
    pub upstream_calls: u64,
}

/// Fans review requests out across remote sampling backends.
///
/// Backends are tried in order: the first is primary, the rest are fallbacks
/// reached only on transient failures. Each backend sits behind its own
/// circuit breaker. Responses are cached for `cache_ttl`, and concurrent
/// requests with the same cache key share one upstream call.
pub struct AiManager {
    slots: Vec<BackendSlot>,
    cache: Cache<String, SamplingResponse>,
    limiter: Semaphore,
    upstream_calls: AtomicU64,
}

impl AiManager {
    pub fn new(backends: Vec<Arc<dyn SamplingBackend>>, config: AiManagerConfig) -> Self {
        let slots = backends
            .into_iter()
            .map(|backend| BackendSlot {
                breaker: CircuitBreaker::new(backend.name(), config.breaker),
                backend,
            })
            .collect();

        let cache = Cache::builder()
            .time_to_live(config.cache_ttl)
            .max_capacity(config.cache_capacity)
            .build();

        AiManager {
            slots,
            cache,
            limiter: Semaphore::new(config.max_concurrent.max(1)),
            upstream_calls: AtomicU64::new(0),
        }
    }

    pub fn backend_count(&self) -> usize {
        self.slots.len()
    }

    /// Name of the primary backend, if any.
    pub fn primary(&self) -> Option<&str> {
        self.slots.first().map(|s| s.backend.name())
    }

    pub fn upstream_calls(&self) -> u64 {
        self.upstream_calls.load(Ordering::Relaxed)
    }

    pub async fn sample(&self, request: &SamplingRequest) -> Result<SamplingResponse, GateError> {
        if self.slots.is_empty() {
            return Err(GateError::AiServiceUnavailable(
                "no sampling backends configured".to_string(),
            ));
        }

        self.cache
            .try_get_with(request.cache_key.clone(), self.sample_uncached(request))
            .await
            .map_err(|e| (*e).clone())
    }

    async fn sample_uncached(&self, request: &SamplingRequest) -> Result<SamplingResponse, GateError> {
        let _permit = self
            .limiter
            .acquire()
            .await
            .map_err(|_| GateError::Internal("sampling limiter closed".to_string()))?;

        let mut failures = Vec::new();

        for slot in &self.slots {
            self.upstream_calls.fetch_add(1, Ordering::Relaxed);
            match slot.breaker.call(|| slot.backend.sample(request)).await {
                Ok(response) => {
                    debug!(backend = slot.backend.name(), "sampling succeeded");
                    return Ok(response);
                }
                Err(e) if e.is_transient() => {
                    warn!(backend = slot.backend.name(), error = %e, "sampling backend failed, trying next");
                    failures.push(format!("{}: {}", slot.backend.name(), e));
                }
                Err(e) => return Err(e),
            }
        }

        Err(GateError::AiServiceUnavailable(format!(
            "all sampling backends failed ({})",
            failures.join("; ")
        )))
    }

    pub async fn health_check(&self) -> AiHealth {
        let mut backends = Vec::with_capacity(self.slots.len());
        for slot in &self.slots {
            backends.push(BackendHealth {
                name: slot.backend.name().to_string(),
                model: slot.backend.model().map(str::to_string),
                healthy: slot.backend.health_check().await,
                circuit: slot.breaker.snapshot(),
            });
        }

        AiHealth {
            healthy: backends.iter().any(|b| b.healthy),
            backends,
            cached_responses: self.cache.entry_count(),
            upstream_calls: self.upstream_calls(),
        }
    }

    pub fn clear_cache(&self) {
        self.cache.invalidate_all();
    }
}
