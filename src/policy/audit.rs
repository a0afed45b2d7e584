use tracing::info;

use crate::domain::{Decision, ToolRequest};

/// Receives every decision made through
/// [`SecurityPolicyEngine::evaluate_and_audit`](super::SecurityPolicyEngine::evaluate_and_audit).
pub trait AuditSink: Send + Sync {
    fn record(&self, request: &ToolRequest, decision: &Decision, matched_rules: &[String]);
}

/// Writes one structured event per decision under the `gatekeep::audit` target.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingAuditSink;

impl AuditSink for TracingAuditSink {
    fn record(&self, request: &ToolRequest, decision: &Decision, matched_rules: &[String]) {
        info!(
            target: "gatekeep::audit",
            request_id = %request.id.as_str(),
            tool_name = %request.tool_name,
            session_id = request.session_id.as_deref().unwrap_or(""),
            agent_id = request.agent_id.as_deref().unwrap_or(""),
            action = %decision.action,
            confidence = decision.confidence,
            rule_id = decision.rule_id.as_deref().unwrap_or(""),
            ai_provider = decision.ai_provider.as_deref().unwrap_or(""),
            matched_rules = ?matched_rules,
            processing_time_ms = decision.processing_time_ms,
            reason = %decision.reason,
            "decision"
        );
    }
}
