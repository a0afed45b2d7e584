use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use smallvec::SmallVec;

use crate::domain::Verdict;
use crate::error::GateError;

/// One review question sent to a remote sampling backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SamplingRequest {
    pub prompt: String,
    /// Responses are cached and deduplicated under this key.
    pub cache_key: String,
}

/// Answer from a remote sampling backend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SamplingResponse {
    pub decision: Verdict,
    pub reasoning: String,
    pub confidence: f64,
    /// Name of the backend that produced this answer.
    pub backend: String,
    pub model: Option<String>,
    #[serde(default)]
    pub risk_factors: SmallVec<[String; 4]>,
}

/// A remote reviewer reachable through the sampling service.
#[async_trait]
pub trait SamplingBackend: Send + Sync {
    fn name(&self) -> &str;

    fn model(&self) -> Option<&str> {
        None
    }

    async fn sample(&self, request: &SamplingRequest) -> Result<SamplingResponse, GateError>;

    async fn health_check(&self) -> bool;
}
