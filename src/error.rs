use thiserror::Error;

/// Errors raised inside the decision engine.
///
/// Every variant carries only owned strings so errors can be cloned out of
/// shared caches and fanned out to concurrent waiters.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum GateError {
    /// Malformed rule file, pattern or settings.
    #[error("invalid configuration: {0}")]
    InvalidConfiguration(String),

    /// Unexpected fault while evaluating a predicate.
    #[error("rule evaluation failed for {rule_id}: {message}")]
    RuleEvaluationFailed { rule_id: String, message: String },

    /// Review backend is down or refused the call.
    #[error("AI service unavailable: {0}")]
    AiServiceUnavailable(String),

    /// Review backend did not answer in time.
    #[error("AI service timed out after {0}ms")]
    AiServiceTimeout(u64),

    /// Circuit breaker is refusing calls to a backend.
    #[error("circuit breaker open for {0}")]
    CircuitBreakerOpen(String),

    /// Review backend answered with something we could not interpret.
    #[error("invalid AI response: {0}")]
    InvalidAiResponse(String),

    /// Provider slot exists but has no implementation.
    #[error("provider not implemented: {0}")]
    NotImplemented(String),

    /// Request could not be decoded.
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// Internal logic error.
    #[error("internal error: {0}")]
    Internal(String),
}

impl GateError {
    /// Transient infrastructure failures that a fallback provider or a later
    /// retry may recover from.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            GateError::AiServiceUnavailable(_)
                | GateError::AiServiceTimeout(_)
                | GateError::CircuitBreakerOpen(_)
        )
    }

    /// Short machine-readable label, used in logs and metrics.
    pub fn kind(&self) -> &'static str {
        match self {
            GateError::InvalidConfiguration(_) => "invalid_configuration",
            GateError::RuleEvaluationFailed { .. } => "rule_evaluation_failed",
            GateError::AiServiceUnavailable(_) => "ai_service_unavailable",
            GateError::AiServiceTimeout(_) => "ai_service_timeout",
            GateError::CircuitBreakerOpen(_) => "circuit_breaker_open",
            GateError::InvalidAiResponse(_) => "invalid_ai_response",
            GateError::NotImplemented(_) => "not_implemented",
            GateError::InvalidRequest(_) => "invalid_request",
            GateError::Internal(_) => "internal",
        }
    }

    pub(crate) fn config(msg: impl Into<String>) -> Self {
        GateError::InvalidConfiguration(msg.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_classification() {
        assert!(GateError::AiServiceUnavailable("down".into()).is_transient());
        assert!(GateError::AiServiceTimeout(500).is_transient());
        assert!(GateError::CircuitBreakerOpen("primary".into()).is_transient());

        assert!(!GateError::InvalidConfiguration("bad".into()).is_transient());
        assert!(!GateError::InvalidAiResponse("garbage".into()).is_transient());
        assert!(!GateError::Internal("oops".into()).is_transient());
    }

    #[test]
    fn test_error_display() {
        let err = GateError::RuleEvaluationFailed {
            rule_id: "deny_rm".to_string(),
            message: "boom".to_string(),
        };
        assert_eq!(err.to_string(), "rule evaluation failed for deny_rm: boom");
        assert_eq!(err.kind(), "rule_evaluation_failed");
    }
}
