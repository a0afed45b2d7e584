use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::json;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use super::audit::AuditSink;
use super::loader::{sort_rules, validate_rules, RuleLoader};
use super::prompt::{DefaultPromptBuilder, PromptBuilder};
use crate::domain::{Decision, RuleAction, SecurityRule, ToolRequest};
use crate::error::GateError;
use crate::inference::{InferenceHealth, InferenceRequest, InferenceStrategyManager};
use crate::observability::{MetricsRegistry, MetricsSnapshot, TimingGuard};
use crate::pattern::{MatchContext, PatternCacheStats, PatternEngine};

pub const NO_MATCH_REASON: &str = "No security rules matched";
pub const NO_PROVIDERS_REASON: &str = "Rule requires inference but no providers configured";
pub const AI_FAILED_REASON: &str = "AI evaluation failed";
pub const SCAN_FAILED_REASON: &str = "Rule evaluation failed";

const NO_MATCH_CONFIDENCE: f64 = 0.5;
const NO_PROVIDERS_CONFIDENCE: f64 = 0.6;
const AI_FAILED_CONFIDENCE: f64 = 0.5;
const SCAN_FAILED_CONFIDENCE: f64 = 0.8;

/// One immutable, priority-sorted rule set.
#[derive(Debug)]
pub struct RuleSnapshot {
    rules: Vec<Arc<SecurityRule>>,
    by_id: HashMap<String, Arc<SecurityRule>>,
    /// Increments on every publish, starting at 1
    pub version: u64,
    pub loaded_at: DateTime<Utc>,
    pub source: Option<PathBuf>,
}

impl RuleSnapshot {
    fn new(mut rules: Vec<SecurityRule>, version: u64, source: Option<PathBuf>) -> Self {
        sort_rules(&mut rules);
        let rules: Vec<Arc<SecurityRule>> = rules.into_iter().map(Arc::new).collect();
        let by_id = rules.iter().map(|r| (r.id.clone(), r.clone())).collect();

        RuleSnapshot {
            rules,
            by_id,
            version,
            loaded_at: Utc::now(),
            source,
        }
    }

    pub fn rules(&self) -> &[Arc<SecurityRule>] {
        &self.rules
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    pub fn get(&self, id: &str) -> Option<&Arc<SecurityRule>> {
        self.by_id.get(id)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct EngineHealth {
    pub status: &'static str,
    pub rules_count: usize,
    pub rules_version: u64,
    pub rules_loaded_at: DateTime<Utc>,
    pub pattern_cache: PatternCacheStats,
    pub inference: Option<InferenceHealth>,
    pub metrics: MetricsSnapshot,
}

/// Stable cache key for a sample rule: sha256 over the canonical JSON of
/// tool name, parameters and rule id.
pub fn cache_key(request: &ToolRequest, rule_id: &str) -> String {
    let material = json!({
        "tool_name": request.tool_name,
        "parameters": request.parameters,
        "rule_id": rule_id,
    });
    let canonical = serde_jcs::to_vec(&material)
        .or_else(|_| serde_json::to_vec(&material))
        .unwrap_or_default();

    hex::encode(Sha256::digest(&canonical))
}

/// Decides whether a tool request may run.
///
/// Rules are scanned in ascending priority against the current snapshot;
/// the first enabled match decides. `sample` rules escalate to the inference
/// manager. Reloads build and validate a new snapshot off to the side and
/// publish it with a single swap, so in-flight evaluations always see a
/// complete rule set.
pub struct SecurityPolicyEngine {
    patterns: PatternEngine,
    inference: Option<Arc<InferenceStrategyManager>>,
    prompts: Arc<dyn PromptBuilder>,
    audit: Option<Arc<dyn AuditSink>>,
    metrics: Arc<MetricsRegistry>,
    loader: Option<RuleLoader>,
    current: watch::Sender<Arc<RuleSnapshot>>,
    /// Snapshot replaced by the last publish, kept for rollback
    previous: Mutex<Option<Arc<RuleSnapshot>>>,
    reload_lock: Mutex<()>,
    next_version: AtomicU64,
}

impl SecurityPolicyEngine {
    pub fn builder() -> SecurityPolicyEngineBuilder {
        SecurityPolicyEngineBuilder::default()
    }

    /// Evaluate a request. Never fails: every error path yields a decision.
    pub async fn evaluate(&self, request: &ToolRequest) -> Decision {
        self.evaluate_inner(request).await.0
    }

    /// Evaluate and report the outcome to the configured audit sink.
    pub async fn evaluate_and_audit(&self, request: &ToolRequest) -> Decision {
        let (decision, matched) = self.evaluate_inner(request).await;
        if let Some(audit) = &self.audit {
            audit.record(request, &decision, &matched);
        }
        decision
    }

    async fn evaluate_inner(&self, request: &ToolRequest) -> (Decision, Vec<String>) {
        let started = Instant::now();
        let _timing = TimingGuard::new(&self.metrics);
        let snapshot = self.snapshot();

        let decision = match self.scan(&snapshot, request) {
            Err(e) => {
                self.metrics.record_scan_fault();
                warn!(tool = %request.tool_name, error = %e, "rule scan failed, denying");
                Decision::deny(SCAN_FAILED_REASON, SCAN_FAILED_CONFIDENCE)
            }
            Ok(None) => Decision::allow(NO_MATCH_REASON, NO_MATCH_CONFIDENCE),
            Ok(Some(rule)) => {
                self.metrics.record_rule_match();
                debug!(rule_id = %rule.id, action = %rule.action, tool = %request.tool_name, "rule matched");
                self.apply(request, &rule).await
            }
        };

        let decision = decision.with_processing_time(started.elapsed());
        self.metrics.record_decision(&decision);

        let matched = decision.rule_id.iter().cloned().collect();
        (decision, matched)
    }

    /// First enabled rule whose conditions match.
    ///
    /// A rule whose predicate errors or panics is skipped. A panic outside
    /// a predicate is reported as an error.
    fn scan(
        &self,
        snapshot: &RuleSnapshot,
        request: &ToolRequest,
    ) -> Result<Option<Arc<SecurityRule>>, GateError> {
        let ctx = MatchContext::new(request);

        catch_unwind(AssertUnwindSafe(|| {
            for rule in snapshot.rules.iter().filter(|r| r.enabled) {
                let outcome = catch_unwind(AssertUnwindSafe(|| rule.conditions.evaluate(&self.patterns, &ctx)))
                    .unwrap_or_else(|_| Err(GateError::Internal("predicate panicked".to_string())));
                match outcome {
                    Ok(true) => return Some(rule.clone()),
                    Ok(false) => {}
                    Err(e) => {
                        self.metrics.record_rule_error();
                        let e = GateError::RuleEvaluationFailed {
                            rule_id: rule.id.clone(),
                            message: e.to_string(),
                        };
                        warn!(error = %e, "skipping rule");
                    }
                }
            }
            None
        }))
        .map_err(|_| GateError::Internal("rule scan panicked".to_string()))
    }

    async fn apply(&self, request: &ToolRequest, rule: &SecurityRule) -> Decision {
        match rule.action {
            RuleAction::Allow => Decision::allow(rule_reason(rule), 1.0).with_rule(&rule.id),
            RuleAction::Deny => Decision::deny(rule_reason(rule), 1.0).with_rule(&rule.id),
            RuleAction::Sample => self.sample(request, rule).await.with_rule(&rule.id),
        }
    }

    async fn sample(&self, request: &ToolRequest, rule: &SecurityRule) -> Decision {
        let Some(manager) = self.inference.as_ref().filter(|m| m.has_providers()) else {
            warn!(rule_id = %rule.id, "sample rule matched but inference is not configured");
            return Decision::deny(NO_PROVIDERS_REASON, NO_PROVIDERS_CONFIDENCE);
        };

        let prompt = match catch_unwind(AssertUnwindSafe(|| self.prompts.build_evaluation_prompt(request, rule))) {
            Ok(prompt) => prompt,
            Err(_) => {
                self.metrics.record_escalation(false);
                warn!(rule_id = %rule.id, "prompt construction panicked, denying");
                return Decision::deny(AI_FAILED_REASON, AI_FAILED_CONFIDENCE);
            }
        };

        let inference_request = InferenceRequest {
            prompt,
            cache_key: cache_key(request, &rule.id),
            rule_id: rule.id.clone(),
            tool_name: request.tool_name.clone(),
            sampling_guidance: rule.sampling_guidance.clone(),
        };

        match manager.evaluate(&inference_request).await {
            Ok(review) => {
                self.metrics.record_escalation(true);
                let reason = if review.reasoning.is_empty() {
                    rule_reason(rule)
                } else {
                    review.reasoning
                };
                Decision::new(review.decision, reason, review.confidence)
                    .with_ai(review.provider, review.model)
                    .with_risk_factors(review.risk_factors)
            }
            Err(e) => {
                self.metrics.record_escalation(false);
                warn!(rule_id = %rule.id, error = %e, "AI evaluation failed, denying");
                Decision::deny(AI_FAILED_REASON, AI_FAILED_CONFIDENCE)
            }
        }
    }

    /// Reload rules from the configured file.
    ///
    /// The candidate is parsed and fully validated before it is published.
    /// On failure the live rule set is left untouched and a configuration
    /// error is returned.
    pub fn reload(&self) -> Result<usize, GateError> {
        let _guard = self.reload_lock.lock();
        self.metrics.record_reload_attempt();

        let Some(loader) = self.loader.as_ref() else {
            let e = GateError::config("no rules file configured");
            self.metrics.record_reload_failure(&e.to_string());
            return Err(e);
        };

        let path = loader.path();
        match loader.load(&self.patterns) {
            Ok(rules) => {
                let count = rules.len();
                let version = self.publish(rules, Some(path.to_path_buf()));
                self.metrics.record_reload_success();
                info!(path = %path.display(), rules = count, version, "rules reloaded");
                Ok(count)
            }
            Err(e) => {
                let e = GateError::from(e);
                self.metrics.record_reload_failure(&e.to_string());
                warn!(
                    path = %path.display(),
                    error = %e,
                    live_version = self.current.borrow().version,
                    "rule reload failed, keeping current rules"
                );
                Err(e)
            }
        }
    }

    /// Publish rules built in code. Validated like a file reload.
    pub fn replace_rules(&self, rules: Vec<SecurityRule>) -> Result<usize, GateError> {
        let _guard = self.reload_lock.lock();
        validate_rules(&rules, &self.patterns)?;

        let count = rules.len();
        let version = self.publish(rules, None);
        info!(rules = count, version, "rules replaced");
        Ok(count)
    }

    /// Re-publish the rule set that the last reload replaced.
    pub fn rollback(&self) -> Result<usize, GateError> {
        let _guard = self.reload_lock.lock();
        let mut previous = self.previous.lock();

        let restored = previous
            .take()
            .ok_or_else(|| GateError::config("no previous rule set to roll back to"))?;
        let count = restored.len();
        let version = restored.version;

        *previous = Some(self.current.send_replace(restored));
        info!(rules = count, version, "rolled back to previous rule set");
        Ok(count)
    }

    fn publish(&self, rules: Vec<SecurityRule>, source: Option<PathBuf>) -> u64 {
        let version = self.next_version.fetch_add(1, Ordering::Relaxed);
        let snapshot = Arc::new(RuleSnapshot::new(rules, version, source));
        let replaced = self.current.send_replace(snapshot);
        *self.previous.lock() = Some(replaced);
        version
    }

    /// Current rule snapshot. Cheap: clones an `Arc`.
    pub fn snapshot(&self) -> Arc<RuleSnapshot> {
        self.current.borrow().clone()
    }

    /// Receiver that observes every published snapshot.
    pub fn subscribe(&self) -> watch::Receiver<Arc<RuleSnapshot>> {
        self.current.subscribe()
    }

    pub fn get_rules_count(&self) -> usize {
        self.current.borrow().len()
    }

    pub fn get_rule_by_id(&self, id: &str) -> Option<Arc<SecurityRule>> {
        self.current.borrow().get(id).cloned()
    }

    pub fn rules_path(&self) -> Option<&Path> {
        self.loader.as_ref().map(RuleLoader::path)
    }

    pub fn metrics(&self) -> &Arc<MetricsRegistry> {
        &self.metrics
    }

    pub fn inference(&self) -> Option<&Arc<InferenceStrategyManager>> {
        self.inference.as_ref()
    }

    pub async fn health_check(&self) -> EngineHealth {
        let snapshot = self.snapshot();
        let inference = match &self.inference {
            Some(manager) => Some(manager.health_check().await),
            None => None,
        };

        let status = match &inference {
            Some(health) if !health.healthy => "degraded",
            _ => "healthy",
        };

        EngineHealth {
            status,
            rules_count: snapshot.len(),
            rules_version: snapshot.version,
            rules_loaded_at: snapshot.loaded_at,
            pattern_cache: self.patterns.cache_stats(),
            inference,
            metrics: self.metrics.snapshot(),
        }
    }
}

fn rule_reason(rule: &SecurityRule) -> String {
    if rule.reason.is_empty() {
        format!("Matched rule {}", rule.id)
    } else {
        rule.reason.clone()
    }
}

pub struct SecurityPolicyEngineBuilder {
    patterns: Option<PatternEngine>,
    inference: Option<Arc<InferenceStrategyManager>>,
    prompts: Arc<dyn PromptBuilder>,
    audit: Option<Arc<dyn AuditSink>>,
    metrics: Arc<MetricsRegistry>,
    rules_path: Option<PathBuf>,
    rules: Vec<SecurityRule>,
}

impl Default for SecurityPolicyEngineBuilder {
    fn default() -> Self {
        SecurityPolicyEngineBuilder {
            patterns: None,
            inference: None,
            prompts: Arc::new(DefaultPromptBuilder::default()),
            audit: None,
            metrics: Arc::new(MetricsRegistry::new()),
            rules_path: None,
            rules: Vec::new(),
        }
    }
}

impl SecurityPolicyEngineBuilder {
    pub fn pattern_engine(mut self, patterns: PatternEngine) -> Self {
        self.patterns = Some(patterns);
        self
    }

    pub fn inference(mut self, manager: Arc<InferenceStrategyManager>) -> Self {
        self.inference = Some(manager);
        self
    }

    pub fn prompt_builder(mut self, prompts: Arc<dyn PromptBuilder>) -> Self {
        self.prompts = prompts;
        self
    }

    pub fn audit_sink(mut self, audit: Arc<dyn AuditSink>) -> Self {
        self.audit = Some(audit);
        self
    }

    pub fn metrics(mut self, metrics: Arc<MetricsRegistry>) -> Self {
        self.metrics = metrics;
        self
    }

    /// File read by `build` and by every `reload`.
    pub fn rules_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.rules_path = Some(path.into());
        self
    }

    /// Initial rules when no file is configured.
    pub fn rules(mut self, rules: Vec<SecurityRule>) -> Self {
        self.rules = rules;
        self
    }

    /// Build the engine. Fails if the initial rules do not load or validate.
    pub fn build(self) -> Result<SecurityPolicyEngine, GateError> {
        let patterns = self.patterns.unwrap_or_else(PatternEngine::shared);

        let loader = self.rules_path.map(RuleLoader::new);
        let rules = match &loader {
            Some(loader) => loader.load(&patterns)?,
            None => {
                validate_rules(&self.rules, &patterns)?;
                self.rules
            }
        };

        let source = loader.as_ref().map(|l| l.path().to_path_buf());
        let initial = Arc::new(RuleSnapshot::new(rules, 1, source));
        info!(rules = initial.len(), "security policy engine ready");
        let (current, _) = watch::channel(initial);

        Ok(SecurityPolicyEngine {
            patterns,
            inference: self.inference,
            prompts: self.prompts,
            audit: self.audit,
            metrics: self.metrics,
            loader,
            current,
            previous: Mutex::new(None),
            reload_lock: Mutex::new(()),
            next_version: AtomicU64::new(2),
        })
    }
}
