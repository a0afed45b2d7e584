pub mod cache;
pub mod glob;
pub mod predicate;

pub use cache::{CacheStats, PatternCache, PatternCacheStats, DEFAULT_CACHE_CAPACITY};
pub use predicate::{Comparator, MatchContext, Predicate, Target, Threshold, TimeWindow};

use jsonpath_lib::Compiled;
use regex::{Regex, RegexBuilder};
use serde_json::Value;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, OnceLock};
use tracing::debug;

use crate::error::GateError;

/// Longest regex or JSONPath accepted.
pub const MAX_PATTERN_LEN: usize = 1000;

/// Compiled-program size cap for a single regex.
const REGEX_SIZE_LIMIT: usize = 1 << 20;

static SHARED_CACHE: OnceLock<Arc<PatternCache>> = OnceLock::new();

/// Matches one predicate against one value.
///
/// Stateless apart from the compiled-pattern cache. The public `match_*`
/// methods never fail: malformed input simply does not match.
#[derive(Clone)]
pub struct PatternEngine {
    cache: Arc<PatternCache>,
}

impl PatternEngine {
    /// Create an engine backed by the given cache.
    pub fn new(cache: Arc<PatternCache>) -> Self {
        PatternEngine { cache }
    }

    /// Engine backed by the process-wide cache.
    pub fn shared() -> Self {
        let cache = SHARED_CACHE.get_or_init(|| Arc::new(PatternCache::default()));
        PatternEngine::new(cache.clone())
    }

    pub fn cache(&self) -> &Arc<PatternCache> {
        &self.cache
    }

    pub fn cache_stats(&self) -> PatternCacheStats {
        self.cache.stats()
    }

    /// Exact, case-sensitive comparison.
    #[inline]
    pub fn match_string(&self, expected: &str, value: &str) -> bool {
        expected == value
    }

    /// Case-insensitive regex search.
    pub fn match_regex(&self, pattern: &str, value: &str) -> bool {
        self.try_regex(pattern, value).unwrap_or(false)
    }

    /// Glob match; never touches the filesystem.
    #[inline]
    pub fn match_glob(&self, pattern: &str, value: &str) -> bool {
        glob::glob_match(pattern, value)
    }

    /// True if the query selects anything, or, with a threshold, if the first
    /// numeric match satisfies it.
    pub fn match_jsonpath(&self, query: &str, document: &Value, threshold: Option<&Threshold>) -> bool {
        self.try_jsonpath(query, document, threshold).unwrap_or(false)
    }

    /// Dispatch a pattern config against `value`.
    ///
    /// A bare string is an exact match; `{type: ...}` selects the dialect.
    /// Malformed configs do not match.
    pub fn match_pattern(&self, config: &Value, value: &Value, context: &MatchContext<'_>) -> bool {
        match Predicate::from_pattern(config, Target::Parameters) {
            Ok(predicate) => predicate
                .evaluate_bound(self, context, value)
                .unwrap_or(false),
            Err(e) => {
                debug!(error = %e, "pattern config rejected");
                false
            }
        }
    }

    /// Evaluate a rule `conditions` object (and/or trees plus the tool_name,
    /// parameters, cwd, cwd_pattern and time_range shapes).
    pub fn match_composite(&self, conditions: &Value, context: &MatchContext<'_>) -> bool {
        match Predicate::from_conditions(conditions) {
            Ok(predicate) => predicate.evaluate(self, context).unwrap_or(false),
            Err(e) => {
                debug!(error = %e, "conditions rejected");
                false
            }
        }
    }

    /// Dry-compile a pattern config. Used at load time only.
    pub fn validate_pattern(&self, config: &Value) -> Result<(), GateError> {
        let predicate = Predicate::from_pattern(config, Target::Parameters)?;
        self.validate_predicate(&predicate)
    }

    /// Parse and dry-compile a rule `conditions` object.
    pub fn compile_conditions(&self, conditions: &Value) -> Result<Predicate, GateError> {
        let predicate = Predicate::from_conditions(conditions)?;
        self.validate_predicate(&predicate)?;
        Ok(predicate)
    }

    /// Compile every regex, glob and JSONPath in the tree.
    pub fn validate_predicate(&self, predicate: &Predicate) -> Result<(), GateError> {
        let mut first_error = None;

        predicate.walk(&mut |node| {
            if first_error.is_some() {
                return;
            }
            let checked = match node {
                Predicate::RegexMatch { pattern, .. } => self.compile_regex(pattern).map(|_| ()),
                Predicate::GlobMatch { pattern, .. } => glob::validate_glob(pattern)
                    .map_err(|e| GateError::config(format!("invalid glob '{}': {}", pattern, e))),
                Predicate::JsonPathQuery { query, .. } => self.compile_jsonpath(query).map(|_| ()),
                _ => Ok(()),
            };
            if let Err(e) = checked {
                first_error = Some(e);
            }
        });

        first_error.map_or(Ok(()), Err)
    }

    pub(crate) fn try_regex(&self, pattern: &str, value: &str) -> Result<bool, GateError> {
        let regex = self.compile_regex(pattern)?;
        Ok(regex.is_match(value))
    }

    pub(crate) fn try_jsonpath(
        &self,
        query: &str,
        document: &Value,
        threshold: Option<&Threshold>,
    ) -> Result<bool, GateError> {
        let compiled = self.compile_jsonpath(query)?;
        // jsonpath_lib asserts on some queries that compile, e.g. a zero slice step
        let matches = catch_unwind(AssertUnwindSafe(|| compiled.select(document)))
            .map_err(|_| GateError::config(format!("jsonpath '{}' aborted during evaluation", query)))?
            .map_err(|e| GateError::config(format!("jsonpath '{}' failed: {:?}", query, e)))?;

        match threshold {
            None => Ok(!matches.is_empty()),
            Some(threshold) => Ok(matches
                .iter()
                .find_map(|v| v.as_f64())
                .is_some_and(|n| threshold.comparator.compare(n, threshold.value))),
        }
    }

    fn compile_regex(&self, pattern: &str) -> Result<Arc<Regex>, GateError> {
        if pattern.len() > MAX_PATTERN_LEN {
            return Err(GateError::config(format!(
                "regex longer than {} characters",
                MAX_PATTERN_LEN
            )));
        }

        self.cache.regex(pattern, || {
            RegexBuilder::new(pattern)
                .case_insensitive(true)
                .size_limit(REGEX_SIZE_LIMIT)
                .build()
                .map_err(|e| GateError::config(format!("invalid regex '{}': {}", pattern, e)))
        })
    }

    fn compile_jsonpath(&self, query: &str) -> Result<Arc<Compiled>, GateError> {
        if query.len() > MAX_PATTERN_LEN {
            return Err(GateError::config(format!(
                "jsonpath longer than {} characters",
                MAX_PATTERN_LEN
            )));
        }

        self.cache.jsonpath(query, || {
            Compiled::compile(query)
                .map_err(|e| GateError::config(format!("invalid jsonpath '{}': {}", query, e)))
        })
    }
}

impl Default for PatternEngine {
    fn default() -> Self {
        PatternEngine::shared()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::ToolRequest;
    use serde_json::json;

    fn engine() -> PatternEngine {
        PatternEngine::new(Arc::new(PatternCache::new(16)))
    }

    #[test]
    fn test_match_string_is_exact() {
        let e = engine();
        assert!(e.match_string("rm", "rm"));
        assert!(!e.match_string("rm", "RM"));
        assert!(!e.match_string("rm", "rm "));
    }

    #[test]
    fn test_match_regex() {
        let e = engine();
        assert!(e.match_regex(r"rm\s+-rf", "sudo RM -rf /"));
        assert!(!e.match_regex(r"^ls$", "ls -la"));
    }

    #[test]
    fn test_match_regex_rejects_bad_input() {
        let e = engine();
        assert!(!e.match_regex("[unclosed", "anything"));
        assert!(!e.match_regex(&"a".repeat(MAX_PATTERN_LEN + 1), "aaaa"));
    }

    #[test]
    fn test_regex_cache_reuse() {
        let e = engine();
        e.match_regex("^git", "git status");
        e.match_regex("^git", "git push");

        let stats = e.cache().stats().regex;
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.hits, 1);
    }

    #[test]
    fn test_match_jsonpath() {
        let e = engine();
        let doc = json!({"headers": {"auth": "x"}, "retries": 7, "items": ["a", 3]});

        assert!(e.match_jsonpath("$.headers.auth", &doc, None));
        assert!(!e.match_jsonpath("$.headers.cookie", &doc, None));

        let over_five = Threshold { comparator: Comparator::Gt, value: 5.0 };
        let at_most_five = Threshold { comparator: Comparator::Lte, value: 5.0 };
        assert!(e.match_jsonpath("$.retries", &doc, Some(&over_five)));
        assert!(!e.match_jsonpath("$.retries", &doc, Some(&at_most_five)));

        // First numeric match is used, strings are skipped
        let eq_three = Threshold { comparator: Comparator::Eq, value: 3.0 };
        assert!(e.match_jsonpath("$.items[*]", &doc, Some(&eq_three)));

        // No numeric match never satisfies a threshold
        assert!(!e.match_jsonpath("$.headers.auth", &doc, Some(&over_five)));
    }

    #[test]
    fn test_match_jsonpath_malformed_query() {
        let e = engine();
        assert!(!e.match_jsonpath("$[[[", &json!({}), None));
    }

    #[test]
    fn test_match_jsonpath_zero_step_slice_does_not_match() {
        let e = engine();
        let doc = json!({"a": [1, 2, 3]});

        assert!(e.validate_pattern(&json!({"type": "jsonpath", "query": "$.a[::0]"})).is_ok());
        assert!(!e.match_jsonpath("$.a[::0]", &doc, None));
        assert!(matches!(
            e.try_jsonpath("$.a[::0]", &doc, None),
            Err(GateError::InvalidConfiguration(_))
        ));

        // The engine stays usable afterwards
        assert!(e.match_jsonpath("$.a[0]", &doc, None));
    }

    #[test]
    fn test_match_pattern_dispatch() {
        let e = engine();
        let request = ToolRequest::new("x");
        let ctx = MatchContext::new(&request);

        assert!(e.match_pattern(&json!("exact"), &json!("exact"), &ctx));
        assert!(e.match_pattern(&json!({"type": "glob", "pattern": "*.rs"}), &json!("lib.rs"), &ctx));
        assert!(e.match_pattern(&json!({"type": "regex", "pattern": "^AB"}), &json!("abc"), &ctx));
        assert!(e.match_pattern(
            &json!({"type": "jsonpath", "query": "$.size", "threshold": 10, "comparator": "gte"}),
            &json!({"size": 10}),
            &ctx
        ));
        assert!(e.match_pattern(&json!(["a", "b"]), &json!("b"), &ctx));
        assert!(e.match_pattern(
            &json!({"type": "and", "patterns": [{"type": "glob", "pattern": "/tmp/*"}, {"type": "regex", "pattern": "\\.sh$"}]}),
            &json!("/tmp/run.sh"),
            &ctx
        ));
    }

    #[test]
    fn test_match_pattern_malformed_config_is_false() {
        let e = engine();
        let request = ToolRequest::new("x");
        let ctx = MatchContext::new(&request);

        assert!(!e.match_pattern(&json!(42), &json!("42"), &ctx));
        assert!(!e.match_pattern(&json!({"pattern": "x"}), &json!("x"), &ctx));
        assert!(!e.match_pattern(&json!({"type": "regex", "pattern": "("}), &json!("("), &ctx));
        assert!(!e.match_pattern(&json!({"type": "nope"}), &json!("x"), &ctx));
    }

    #[test]
    fn test_match_composite() {
        let e = engine();
        let request = ToolRequest::new("bash").with_parameter("command", "rm -rf /");
        let ctx = MatchContext::new(&request);

        assert!(e.match_composite(
            &json!({"tool_name": "bash", "parameters": {"command": {"type": "regex", "pattern": "rm\\s+-rf"}}}),
            &ctx
        ));
        assert!(!e.match_composite(&json!({"or": [{"tool_name": "python"}, {"cwd": "/"}]}), &ctx));
        assert!(!e.match_composite(&json!({"bogus": true}), &ctx));
    }

    #[test]
    fn test_validate_pattern() {
        let e = engine();

        assert!(e.validate_pattern(&json!("literal")).is_ok());
        assert!(e.validate_pattern(&json!({"type": "regex", "pattern": "^a+$"})).is_ok());
        assert!(e.validate_pattern(&json!({"type": "glob", "pattern": "/etc/**"})).is_ok());
        assert!(e.validate_pattern(&json!({"type": "jsonpath", "query": "$.a[0]"})).is_ok());

        assert!(matches!(
            e.validate_pattern(&json!({"type": "regex", "pattern": "(a"})),
            Err(GateError::InvalidConfiguration(_))
        ));
        assert!(e.validate_pattern(&json!({"type": "glob", "pattern": "[a"})).is_err());
        assert!(e.validate_pattern(&json!({"type": "jsonpath", "query": "$[[["})).is_err());
    }

    #[test]
    fn test_compile_conditions_checks_nested_patterns() {
        let e = engine();
        let bad = json!({"or": [{"tool_name": "ok"}, {"parameters": {"p": {"type": "regex", "pattern": "(("}}}]});
        assert!(e.compile_conditions(&bad).is_err());

        let good = json!({"or": [{"tool_name": "ok"}, {"parameters": {"p": {"type": "regex", "pattern": "x"}}}]});
        assert!(e.compile_conditions(&good).is_ok());
    }

    #[test]
    fn test_shared_engines_share_cache() {
        let a = PatternEngine::shared();
        let b = PatternEngine::shared();
        assert!(Arc::ptr_eq(a.cache(), b.cache()));
    }
}
