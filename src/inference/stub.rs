use async_trait::async_trait;

use super::{InferenceDecision, InferenceProvider, InferenceRequest, ProviderInfo};
use crate::error::GateError;

/// Placeholder for a provider that is configured but not built yet.
///
/// Always unhealthy; every evaluation fails with `NotImplemented` so the
/// strategy manager moves on to the next provider.
pub struct StubProvider {
    name: String,
}

impl StubProvider {
    pub fn new(name: impl Into<String>) -> Self {
        StubProvider { name: name.into() }
    }
}

#[async_trait]
impl InferenceProvider for StubProvider {
    fn name(&self) -> &str {
        &self.name
    }

    async fn evaluate(&self, _request: &InferenceRequest) -> Result<InferenceDecision, GateError> {
        Err(GateError::NotImplemented(self.name.clone()))
    }

    async fn health_check(&self) -> bool {
        false
    }

    fn provider_info(&self) -> ProviderInfo {
        ProviderInfo {
            name: self.name.clone(),
            kind: "stub",
            model: None,
            implemented: false,
        }
    }
}
