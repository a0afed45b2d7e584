use parking_lot::Mutex;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use crate::domain::Decision;

/// In-process counters for the decision engine.
#[derive(Debug, Default)]
pub struct MetricsRegistry {
    /// Total decisions returned
    pub decisions_total: AtomicU64,

    /// Decisions by action
    pub decisions_allow: AtomicU64,
    pub decisions_deny: AtomicU64,

    /// Decision latency buckets
    pub latency_under_1ms: AtomicU64,
    pub latency_1_10ms: AtomicU64,
    pub latency_10_100ms: AtomicU64,
    pub latency_100ms_1s: AtomicU64,
    pub latency_over_1s: AtomicU64,

    /// Rule scan outcomes
    pub rule_matches_total: AtomicU64,
    pub rule_errors_total: AtomicU64,
    pub scan_faults_total: AtomicU64,

    /// Escalations to AI review
    pub ai_escalations_total: AtomicU64,
    pub ai_failures_total: AtomicU64,

    /// Rule reloads
    pub reload_attempts_total: AtomicU64,
    pub reload_successes_total: AtomicU64,
    pub reload_failures_total: AtomicU64,
    last_reload_error: Mutex<Option<String>>,
}

/// Serializable copy of the counters for health reports.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MetricsSnapshot {
    pub decisions_total: u64,
    pub decisions_allow: u64,
    pub decisions_deny: u64,
    pub rule_matches_total: u64,
    pub rule_errors_total: u64,
    pub scan_faults_total: u64,
    pub ai_escalations_total: u64,
    pub ai_failures_total: u64,
    pub reload_attempts_total: u64,
    pub reload_successes_total: u64,
    pub reload_failures_total: u64,
    pub reload_success_rate: f64,
    pub last_reload_error: Option<String>,
}

impl MetricsRegistry {
    pub fn new() -> Self {
        MetricsRegistry::default()
    }

    /// Record a decision outcome.
    pub fn record_decision(&self, decision: &Decision) {
        self.decisions_total.fetch_add(1, Ordering::Relaxed);
        if decision.is_allowed() {
            self.decisions_allow.fetch_add(1, Ordering::Relaxed);
        } else {
            self.decisions_deny.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Record decision latency.
    pub fn record_latency(&self, start: Instant) {
        let micros = start.elapsed().as_micros() as u64;

        let bucket = if micros < 1_000 {
            &self.latency_under_1ms
        } else if micros < 10_000 {
            &self.latency_1_10ms
        } else if micros < 100_000 {
            &self.latency_10_100ms
        } else if micros < 1_000_000 {
            &self.latency_100ms_1s
        } else {
            &self.latency_over_1s
        };
        bucket.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_rule_match(&self) {
        self.rule_matches_total.fetch_add(1, Ordering::Relaxed);
    }

    /// A single rule's predicate failed and the rule was skipped.
    pub fn record_rule_error(&self) {
        self.rule_errors_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_scan_fault(&self) {
        self.scan_faults_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_escalation(&self, success: bool) {
        self.ai_escalations_total.fetch_add(1, Ordering::Relaxed);
        if !success {
            self.ai_failures_total.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn record_reload_attempt(&self) {
        self.reload_attempts_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_reload_success(&self) {
        self.reload_successes_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_reload_failure(&self, error: &str) {
        self.reload_failures_total.fetch_add(1, Ordering::Relaxed);
        *self.last_reload_error.lock() = Some(error.to_string());
    }

    /// Fraction of reload attempts that succeeded; 1.0 before any attempt.
    pub fn reload_success_rate(&self) -> f64 {
        let attempts = self.reload_attempts_total.load(Ordering::Relaxed);
        if attempts == 0 {
            return 1.0;
        }
        self.reload_successes_total.load(Ordering::Relaxed) as f64 / attempts as f64
    }

    pub fn last_reload_error(&self) -> Option<String> {
        self.last_reload_error.lock().clone()
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            decisions_total: self.decisions_total.load(Ordering::Relaxed),
            decisions_allow: self.decisions_allow.load(Ordering::Relaxed),
            decisions_deny: self.decisions_deny.load(Ordering::Relaxed),
            rule_matches_total: self.rule_matches_total.load(Ordering::Relaxed),
            rule_errors_total: self.rule_errors_total.load(Ordering::Relaxed),
            scan_faults_total: self.scan_faults_total.load(Ordering::Relaxed),
            ai_escalations_total: self.ai_escalations_total.load(Ordering::Relaxed),
            ai_failures_total: self.ai_failures_total.load(Ordering::Relaxed),
            reload_attempts_total: self.reload_attempts_total.load(Ordering::Relaxed),
            reload_successes_total: self.reload_successes_total.load(Ordering::Relaxed),
            reload_failures_total: self.reload_failures_total.load(Ordering::Relaxed),
            reload_success_rate: self.reload_success_rate(),
            last_reload_error: self.last_reload_error(),
        }
    }
}

/// Guard for timing operations.
pub struct TimingGuard<'a> {
    registry: &'a MetricsRegistry,
    start: Instant,
}

impl<'a> TimingGuard<'a> {
    pub fn new(registry: &'a MetricsRegistry) -> Self {
        TimingGuard {
            registry,
            start: Instant::now(),
        }
    }
}

impl<'a> Drop for TimingGuard<'a> {
    fn drop(&mut self) {
        self.registry.record_latency(self.start);
    }
}
