use async_trait::async_trait;
use std::sync::Arc;

use super::{InferenceDecision, InferenceProvider, InferenceRequest, ProviderInfo};
use crate::ai::{AiManager, SamplingRequest};
use crate::error::GateError;

/// Provider backed by the remote sampling service.
///
/// Caching, breakers and primary/fallback chaining live in [`AiManager`].
pub struct SamplingProvider {
    name: String,
    manager: Arc<AiManager>,
}

impl SamplingProvider {
    pub fn new(name: impl Into<String>, manager: Arc<AiManager>) -> Self {
        SamplingProvider {
            name: name.into(),
            manager,
        }
    }

    pub fn manager(&self) -> &Arc<AiManager> {
        &self.manager
    }
}

#[async_trait]
impl InferenceProvider for SamplingProvider {
    fn name(&self) -> &str {
        &self.name
    }

    async fn evaluate(&self, request: &InferenceRequest) -> Result<InferenceDecision, GateError> {
        let response = self
            .manager
            .sample(&SamplingRequest {
                prompt: request.prompt.clone(),
                cache_key: request.cache_key.clone(),
            })
            .await?;

        // Report the backend that actually answered
        Ok(InferenceDecision::new(
            response.decision,
            response.reasoning,
            response.confidence,
            response.backend,
        )
        .with_model(response.model)
        .with_risk_factors(response.risk_factors))
    }

    async fn health_check(&self) -> bool {
        self.manager.health_check().await.healthy
    }

    fn provider_info(&self) -> ProviderInfo {
        ProviderInfo {
            name: self.name.clone(),
            kind: "sampling",
            model: self.manager.primary().map(str::to_string),
            implemented: true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ai::{AiManagerConfig, SamplingBackend, SamplingResponse};
    use crate::domain::Verdict;
    use smallvec::smallvec;

    struct FixedBackend;

    #[async_trait]
    impl SamplingBackend for FixedBackend {
        fn name(&self) -> &str {
            "remote-a"
        }

        async fn sample(&self, _request: &SamplingRequest) -> Result<SamplingResponse, GateError> {
            Ok(SamplingResponse {
                decision: Verdict::Deny,
                reasoning: "posts secrets".into(),
                confidence: 1.4,
                backend: "remote-a".into(),
                model: Some("m".into()),
                risk_factors: smallvec!["exfiltration".to_string()],
            })
        }

        async fn health_check(&self) -> bool {
            true
        }
    }

    #[tokio::test]
    async fn test_maps_sampling_response() {
        let backend: Arc<dyn SamplingBackend> = Arc::new(FixedBackend);
        let manager = Arc::new(AiManager::new(vec![backend], AiManagerConfig::default()));
        let provider = SamplingProvider::new("sampling", manager);

        let request = InferenceRequest {
            prompt: "p".into(),
            cache_key: "k".into(),
            rule_id: "r".into(),
            tool_name: "curl".into(),
            sampling_guidance: None,
        };
        let d = provider.evaluate(&request).await.unwrap();

        assert_eq!(d.decision, Verdict::Deny);
        assert_eq!(d.provider, "remote-a");
        assert_eq!(d.model.as_deref(), Some("m"));
        assert_eq!(d.confidence, 1.0);
        assert_eq!(d.risk_factors.as_slice(), ["exfiltration"]);
        assert!(provider.health_check().await);
        assert_eq!(provider.provider_info().kind, "sampling");
    }
}
