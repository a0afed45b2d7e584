use moka::future::Cache;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tracing::{debug, info, warn};

use super::{
    CliProvider, InferenceDecision, InferenceProvider, InferenceRequest, ProviderInfo,
    SamplingProvider, StubProvider,
};
use crate::ai::{AiManager, SamplingBackend};
use crate::config::{ProviderKind, Settings};
use crate::error::GateError;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct InferenceStats {
    pub hits: u64,
    pub misses: u64,
    /// Provider attempts actually made
    pub upstream_calls: u64,
    pub cached_entries: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct ProviderHealth {
    #[serde(flatten)]
    pub info: ProviderInfo,
    pub healthy: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct InferenceHealth {
    pub healthy: bool,
    pub providers: Vec<ProviderHealth>,
    pub stats: InferenceStats,
}

/// Escalates `sample` decisions across an ordered list of providers.
///
/// The first provider to answer wins. Every attempt has its own timeout, a
/// global semaphore bounds in-flight work, and answers are cached by the
/// request's cache key. Concurrent requests with the same key wait on a
/// single upstream evaluation.
pub struct InferenceStrategyManager {
    providers: Vec<Arc<dyn InferenceProvider>>,
    attempt_timeout: Duration,
    limiter: Semaphore,
    cache: Cache<String, InferenceDecision>,
    hits: AtomicU64,
    misses: AtomicU64,
    upstream_calls: AtomicU64,
}

impl InferenceStrategyManager {
    pub fn builder() -> InferenceStrategyManagerBuilder {
        InferenceStrategyManagerBuilder::default()
    }

    pub fn has_providers(&self) -> bool {
        !self.providers.is_empty()
    }

    pub fn provider_names(&self) -> Vec<&str> {
        self.providers.iter().map(|p| p.name()).collect()
    }

    pub async fn evaluate(&self, request: &InferenceRequest) -> Result<InferenceDecision, GateError> {
        if self.providers.is_empty() {
            return Err(GateError::AiServiceUnavailable(
                "no inference providers configured".to_string(),
            ));
        }

        let mut computed = false;
        let result = self
            .cache
            .try_get_with(request.cache_key.clone(), async {
                computed = true;
                self.evaluate_uncached(request).await
            })
            .await
            .map_err(|e| (*e).clone());

        if computed {
            self.misses.fetch_add(1, Ordering::Relaxed);
        } else {
            self.hits.fetch_add(1, Ordering::Relaxed);
            debug!(rule_id = %request.rule_id, "inference cache hit");
        }
        result
    }

    async fn evaluate_uncached(&self, request: &InferenceRequest) -> Result<InferenceDecision, GateError> {
        let _permit = self
            .limiter
            .acquire()
            .await
            .map_err(|_| GateError::Internal("inference limiter closed".to_string()))?;

        let mut failures = Vec::with_capacity(self.providers.len());

        for provider in &self.providers {
            self.upstream_calls.fetch_add(1, Ordering::Relaxed);

            let outcome = tokio::time::timeout(self.attempt_timeout, provider.evaluate(request))
                .await
                .unwrap_or_else(|_| {
                    Err(GateError::AiServiceTimeout(self.attempt_timeout.as_millis() as u64))
                });

            match outcome {
                Ok(decision) => {
                    debug!(
                        provider = provider.name(),
                        decision = %decision.decision,
                        confidence = decision.confidence,
                        "inference succeeded"
                    );
                    return Ok(decision);
                }
                Err(e) => {
                    warn!(provider = provider.name(), error = %e, "inference provider failed");
                    failures.push(format!("{}: {}", provider.name(), e));
                }
            }
        }

        Err(GateError::AiServiceUnavailable(format!(
            "all inference providers failed ({})",
            failures.join("; ")
        )))
    }

    pub async fn health_check(&self) -> InferenceHealth {
        let mut providers = Vec::with_capacity(self.providers.len());
        for provider in &self.providers {
            providers.push(ProviderHealth {
                info: provider.provider_info(),
                healthy: provider.health_check().await,
            });
        }

        InferenceHealth {
            healthy: providers.iter().any(|p| p.healthy),
            providers,
            stats: self.cache_stats(),
        }
    }

    pub fn cache_stats(&self) -> InferenceStats {
        InferenceStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            upstream_calls: self.upstream_calls.load(Ordering::Relaxed),
            cached_entries: self.cache.entry_count(),
        }
    }

    /// Drop cached answers and reset the hit/miss counters.
    pub fn clear_cache(&self) {
        self.cache.invalidate_all();
        self.hits.store(0, Ordering::Relaxed);
        self.misses.store(0, Ordering::Relaxed);
    }
}

pub struct InferenceStrategyManagerBuilder {
    providers: Vec<Arc<dyn InferenceProvider>>,
    attempt_timeout: Duration,
    max_concurrent: usize,
    cache_ttl: Duration,
    cache_capacity: u64,
}

impl Default for InferenceStrategyManagerBuilder {
    fn default() -> Self {
        InferenceStrategyManagerBuilder {
            providers: Vec::new(),
            attempt_timeout: Duration::from_secs(30),
            max_concurrent: 10,
            cache_ttl: Duration::from_secs(300),
            cache_capacity: 1000,
        }
    }
}

impl InferenceStrategyManagerBuilder {
    pub fn provider(mut self, provider: Arc<dyn InferenceProvider>) -> Self {
        self.providers.push(provider);
        self
    }

    pub fn attempt_timeout(mut self, timeout: Duration) -> Self {
        self.attempt_timeout = timeout;
        self
    }

    pub fn max_concurrent(mut self, n: usize) -> Self {
        self.max_concurrent = n;
        self
    }

    pub fn cache_ttl(mut self, ttl: Duration) -> Self {
        self.cache_ttl = ttl;
        self
    }

    pub fn cache_capacity(mut self, capacity: u64) -> Self {
        self.cache_capacity = capacity;
        self
    }

    pub fn build(self) -> InferenceStrategyManager {
        InferenceStrategyManager {
            providers: self.providers,
            attempt_timeout: self.attempt_timeout,
            limiter: Semaphore::new(self.max_concurrent.max(1)),
            cache: Cache::builder()
                .time_to_live(self.cache_ttl)
                .max_capacity(self.cache_capacity)
                .build(),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            upstream_calls: AtomicU64::new(0),
        }
    }
}

/// Build the manager described by `settings.inference`.
///
/// Returns `None` when inference is disabled or no provider is enabled.
/// Every `sampling` provider shares one [`AiManager`] over `sampling_backends`.
pub fn build_manager(
    settings: &Settings,
    sampling_backends: Vec<Arc<dyn SamplingBackend>>,
) -> Result<Option<InferenceStrategyManager>, GateError> {
    let inference = &settings.inference;
    if !inference.enabled {
        info!("inference disabled, sample rules will deny");
        return Ok(None);
    }

    let mut builder = InferenceStrategyManager::builder()
        .attempt_timeout(inference.attempt_timeout())
        .max_concurrent(inference.max_concurrent)
        .cache_ttl(inference.cache_ttl())
        .cache_capacity(inference.cache_capacity);

    let mut ai_manager: Option<Arc<AiManager>> = None;
    let mut count = 0;

    for entry in inference.providers.iter().filter(|p| p.enabled) {
        let provider: Arc<dyn InferenceProvider> = match entry.kind {
            ProviderKind::Cli => Arc::new(CliProvider::new(entry.cli_config())?),
            ProviderKind::Sampling => {
                let manager = ai_manager
                    .get_or_insert_with(|| {
                        Arc::new(AiManager::new(
                            sampling_backends.clone(),
                            (&settings.sampling).into(),
                        ))
                    })
                    .clone();
                Arc::new(SamplingProvider::new(entry.name.clone(), manager))
            }
            ProviderKind::Stub => Arc::new(StubProvider::new(entry.name.clone())),
        };
        info!(provider = %entry.name, kind = ?entry.kind, "inference provider registered");
        builder = builder.provider(provider);
        count += 1;
    }

    if count == 0 {
        info!("no inference providers enabled, sample rules will deny");
        return Ok(None);
    }
    Ok(Some(builder.build()))
}
