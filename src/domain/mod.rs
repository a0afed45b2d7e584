pub mod decision;
pub mod policy;
pub mod request;

pub use decision::{clamp_confidence, Decision, Verdict};
pub use policy::{RuleAction, RuleDef, RuleFile, SecurityRule};
pub use request::{RequestId, ToolRequest};
