use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

use crate::pattern::Predicate;

/// What a rule does when its conditions match.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RuleAction {
    /// Let the tool call run
    Allow,
    /// Block the tool call
    Deny,
    /// Defer to an AI-backed reviewer
    Sample,
}

impl fmt::Display for RuleAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RuleAction::Allow => write!(f, "allow"),
            RuleAction::Deny => write!(f, "deny"),
            RuleAction::Sample => write!(f, "sample"),
        }
    }
}

/// Rule file as written on disk.
///
/// ```yaml
/// rules:
///   - id: deny_rm
///     priority: 1
///     conditions:
///       tool_name: ["rm"]
///     action: deny
///     reason: "rm is never allowed"
/// ```
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RuleFile {
    /// Rule definitions, in any order
    #[serde(default)]
    pub rules: Vec<RuleDef>,
}

/// Definition of a single rule, before its conditions are compiled.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuleDef {
    /// Unique rule identifier
    pub id: String,

    /// Ascending: lower numbers are evaluated first
    #[serde(default)]
    pub priority: i64,

    /// Disabled rules never match
    #[serde(default = "default_enabled")]
    pub enabled: bool,

    /// Predicate tree in its open-ended file form
    #[serde(default = "empty_conditions")]
    pub conditions: Value,

    /// Action to take when the rule matches
    pub action: RuleAction,

    /// Explanation reported with the decision
    #[serde(default)]
    pub reason: String,

    /// Extra instructions for the reviewer on sample rules
    #[serde(default)]
    pub sampling_guidance: Option<String>,
}

fn default_enabled() -> bool {
    true
}

fn empty_conditions() -> Value {
    Value::Object(serde_json::Map::new())
}

/// A compiled, validated rule. Immutable once built.
#[derive(Debug, Clone)]
pub struct SecurityRule {
    pub id: String,
    pub priority: i64,
    pub conditions: Predicate,
    pub action: RuleAction,
    pub reason: String,
    pub sampling_guidance: Option<String>,
    pub enabled: bool,
}

impl SecurityRule {
    /// Build an enabled rule from an already-parsed predicate.
    pub fn new(
        id: impl Into<String>,
        priority: i64,
        conditions: Predicate,
        action: RuleAction,
        reason: impl Into<String>,
    ) -> Self {
        SecurityRule {
            id: id.into(),
            priority,
            conditions,
            action,
            reason: reason.into(),
            sampling_guidance: None,
            enabled: true,
        }
    }

    pub fn with_guidance(mut self, guidance: impl Into<String>) -> Self {
        self.sampling_guidance = Some(guidance.into());
        self
    }

    pub fn disabled(mut self) -> Self {
        self.enabled = false;
        self
    }
}
