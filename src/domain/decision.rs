use serde::{Deserialize, Serialize};
use smallvec::SmallVec;
use std::fmt;
use std::time::Duration;

/// Final outcome handed back to the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Verdict {
    /// The tool call may run
    Allow,
    /// The tool call must not run
    Deny,
}

impl Verdict {
    /// Returns true if this verdict lets the tool call run.
    #[inline]
    pub fn is_allowed(&self) -> bool {
        *self == Verdict::Allow
    }

    /// Parse a reviewer's answer. Accepts a few common synonyms.
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().as_str() {
            "allow" | "allowed" | "approve" | "approved" => Some(Verdict::Allow),
            "deny" | "denied" | "block" | "blocked" | "reject" | "rejected" => {
                Some(Verdict::Deny)
            }
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Verdict::Allow => "allow",
            Verdict::Deny => "deny",
        }
    }
}

impl fmt::Display for Verdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Clamp a confidence value into `[0, 1]`. NaN collapses to zero.
#[inline]
pub fn clamp_confidence(value: f64) -> f64 {
    if value.is_nan() {
        0.0
    } else {
        value.clamp(0.0, 1.0)
    }
}

/// Auditable verdict for one tool request.
///
/// Built fresh per call. Confidence is clamped on every constructor and
/// builder so it always lies in `[0, 1]`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Decision {
    /// The verdict
    pub action: Verdict,

    /// Human-readable explanation
    pub reason: String,

    /// How sure the engine is, in `[0, 1]`
    pub confidence: f64,

    /// Rule that produced the decision (None when nothing matched)
    pub rule_id: Option<String>,

    /// Review provider consulted, if any
    pub ai_provider: Option<String>,

    /// Review model consulted, if known
    pub ai_model: Option<String>,

    /// Risk factors reported by the reviewer
    #[serde(default)]
    pub risk_factors: SmallVec<[String; 4]>,

    /// Wall-clock time spent deciding
    pub processing_time_ms: u64,
}

impl Decision {
    pub fn new(action: Verdict, reason: impl Into<String>, confidence: f64) -> Self {
        Decision {
            action,
            reason: reason.into(),
            confidence: clamp_confidence(confidence),
            rule_id: None,
            ai_provider: None,
            ai_model: None,
            risk_factors: SmallVec::new(),
            processing_time_ms: 0,
        }
    }

    /// Create an allowing decision.
    pub fn allow(reason: impl Into<String>, confidence: f64) -> Self {
        Decision::new(Verdict::Allow, reason, confidence)
    }

    /// Create a denying decision.
    pub fn deny(reason: impl Into<String>, confidence: f64) -> Self {
        Decision::new(Verdict::Deny, reason, confidence)
    }

    /// Attach the rule that produced this decision.
    pub fn with_rule(mut self, rule_id: impl Into<String>) -> Self {
        self.rule_id = Some(rule_id.into());
        self
    }

    /// Attach the reviewer that produced this decision.
    pub fn with_ai(mut self, provider: impl Into<String>, model: Option<String>) -> Self {
        self.ai_provider = Some(provider.into());
        self.ai_model = model;
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

    pub fn with_processing_time(mut self, elapsed: Duration) -> Self {
        self.processing_time_ms = u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX);
        self
    }

    #[inline]
    pub fn is_allowed(&self) -> bool {
        self.action.is_allowed()
    }
}
