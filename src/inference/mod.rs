//! AI-backed review of requests that a `sample` rule escalates.

pub mod cli;
pub mod parse;
pub mod sampling;
pub mod strategy;
pub mod stub;

pub use cli::{CliProvider, CliProviderConfig};
pub use sampling::SamplingProvider;
pub use strategy::{
    build_manager, InferenceHealth, InferenceStats, InferenceStrategyManager,
    InferenceStrategyManagerBuilder, ProviderHealth,
};
pub use stub::StubProvider;

use async_trait::async_trait;
use serde::Serialize;
use smallvec::SmallVec;

use crate::domain::{clamp_confidence, Verdict};
use crate::error::GateError;

/// One escalated request, already rendered into a prompt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InferenceRequest {
    pub prompt: String,
    /// Stable key over tool name, parameters and rule id.
    pub cache_key: String,
    pub rule_id: String,
    pub tool_name: String,
    pub sampling_guidance: Option<String>,
}

/// A reviewer's verdict. Confidence is clamped into [0, 1] on construction.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct InferenceDecision {
    pub decision: Verdict,
    pub reasoning: String,
    pub confidence: f64,
    pub provider: String,
    pub model: Option<String>,
    pub risk_factors: SmallVec<[String; 4]>,
}

impl InferenceDecision {
    pub fn new(decision: Verdict, reasoning: impl Into<String>, confidence: f64, provider: impl Into<String>) -> Self {
        InferenceDecision {
            decision,
            reasoning: reasoning.into(),
            confidence: clamp_confidence(confidence),
            provider: provider.into(),
            model: None,
            risk_factors: SmallVec::new(),
        }
    }

    pub fn with_model(mut self, model: Option<String>) -> Self {
        self.model = model;
        self
    }

    pub fn with_risk_factors<I, S>(mut self, factors: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.risk_factors = factors.into_iter().map(Into::into).collect();
        self
    }
}

/// Static description of a provider, reported by health checks.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProviderInfo {
    pub name: String,
    pub kind: &'static str,
    pub model: Option<String>,
    pub implemented: bool,
}

/// Capability surface shared by every reviewer backend.
#[async_trait]
pub trait InferenceProvider: Send + Sync {
    fn name(&self) -> &str;

    async fn evaluate(&self, request: &InferenceRequest) -> Result<InferenceDecision, GateError>;

    async fn health_check(&self) -> bool;

    fn provider_info(&self) -> ProviderInfo;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_confidence_clamped() {
        let d = InferenceDecision::new(Verdict::Allow, "fine", 1.7, "p");
        assert_eq!(d.confidence, 1.0);

        let d = InferenceDecision::new(Verdict::Deny, "bad", -0.2, "p");
        assert_eq!(d.confidence, 0.0);
    }

    #[test]
    fn test_builders() {
        let d = InferenceDecision::new(Verdict::Deny, "exfil", 0.9, "cli")
            .with_model(Some("m1".into()))
            .with_risk_factors(["network", "secrets"]);

        assert_eq!(d.model.as_deref(), Some("m1"));
        assert_eq!(d.risk_factors.as_slice(), ["network", "secrets"]);
    }
}
