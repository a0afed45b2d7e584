pub mod ai;
pub mod config;
pub mod domain;
pub mod error;
pub mod inference;
pub mod observability;
pub mod pattern;
pub mod policy;

pub use config::{Config, Settings};
pub use domain::{Decision, RuleAction, SecurityRule, ToolRequest, Verdict};
pub use error::GateError;
pub use pattern::PatternEngine;
pub use policy::{ConfigWatcher, SecurityPolicyEngine};
