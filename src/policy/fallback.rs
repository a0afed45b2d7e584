use crate::domain::Decision;
use crate::error::GateError;

/// Decision for failures that escape the engine entirely.
///
/// Transient infrastructure failures fail open with low confidence.
/// Configuration and logic failures fail closed with high confidence.
/// The engine's own paths never reach this: `evaluate` always returns a
/// concrete decision.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ErrorPolicy {
    pub transient_confidence: f64,
    pub circuit_open_confidence: f64,
    pub configuration_confidence: f64,
    pub logic_confidence: f64,
}

impl Default for ErrorPolicy {
    fn default() -> Self {
        ErrorPolicy {
            transient_confidence: 0.3,
            circuit_open_confidence: 0.2,
            configuration_confidence: 0.9,
            logic_confidence: 0.8,
        }
    }
}

impl ErrorPolicy {
    pub fn fails_open(&self, error: &GateError) -> bool {
        error.is_transient()
    }

    pub fn decision_for(&self, error: &GateError) -> Decision {
        match error {
            GateError::AiServiceUnavailable(_) | GateError::AiServiceTimeout(_) => {
                Decision::allow(format!("Transient failure, allowing: {}", error), self.transient_confidence)
                    .with_risk_factors(["fail_open", error.kind()])
            }
            GateError::CircuitBreakerOpen(_) => {
                Decision::allow(format!("Review backend paused, allowing: {}", error), self.circuit_open_confidence)
                    .with_risk_factors(["fail_open", error.kind()])
            }
            GateError::InvalidConfiguration(_) | GateError::NotImplemented(_) => {
                Decision::deny(format!("Configuration error, denying: {}", error), self.configuration_confidence)
                    .with_risk_factors(["fail_closed", error.kind()])
            }
            GateError::RuleEvaluationFailed { .. }
            | GateError::InvalidAiResponse(_)
            | GateError::InvalidRequest(_)
            | GateError::Internal(_) => {
                Decision::deny(format!("Internal error, denying: {}", error), self.logic_confidence)
                    .with_risk_factors(["fail_closed", error.kind()])
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::Verdict;

    #[test]
    fn test_transient_failures_fail_open() {
        let policy = ErrorPolicy::default();

        let d = policy.decision_for(&GateError::AiServiceUnavailable("503".into()));
        assert_eq!(d.action, Verdict::Allow);
        assert_eq!(d.confidence, 0.3);

        let d = policy.decision_for(&GateError::AiServiceTimeout(1000));
        assert_eq!(d.action, Verdict::Allow);

        let d = policy.decision_for(&GateError::CircuitBreakerOpen("primary".into()));
        assert_eq!(d.action, Verdict::Allow);
        assert_eq!(d.confidence, 0.2);
        assert_eq!(d.risk_factors[0], "fail_open");
    }

    #[test]
    fn test_logic_failures_fail_closed() {
        let policy = ErrorPolicy::default();

        let d = policy.decision_for(&GateError::InvalidConfiguration("bad".into()));
        assert_eq!(d.action, Verdict::Deny);
        assert_eq!(d.confidence, 0.9);

        for error in [
            GateError::Internal("bug".into()),
            GateError::InvalidRequest("not json".into()),
            GateError::InvalidAiResponse("junk".into()),
            GateError::RuleEvaluationFailed { rule_id: "r".into(), message: "m".into() },
        ] {
            let d = policy.decision_for(&error);
            assert_eq!(d.action, Verdict::Deny, "{:?}", error);
            assert_eq!(d.confidence, 0.8);
            assert!(!policy.fails_open(&error));
        }
    }

    #[test]
    fn test_custom_confidences_are_clamped() {
        let policy = ErrorPolicy { transient_confidence: 3.0, ..Default::default() };
        let d = policy.decision_for(&GateError::AiServiceTimeout(1));
        assert_eq!(d.confidence, 1.0);
    }
}
