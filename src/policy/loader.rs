use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;

use crate::domain::{RuleDef, RuleFile, SecurityRule};
use crate::error::GateError;
use crate::pattern::PatternEngine;

/// Errors that can occur while loading a rule file.
#[derive(Error, Debug)]
pub enum PolicyError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("YAML parsing error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("Validation error: {0}")]
    Validation(String),
}

impl From<PolicyError> for GateError {
    fn from(e: PolicyError) -> Self {
        GateError::InvalidConfiguration(e.to_string())
    }
}

/// Load, compile and validate a rule file.
///
/// The returned rules are sorted by ascending priority; ties keep file order.
pub fn load_rules(path: impl AsRef<Path>, engine: &PatternEngine) -> Result<Vec<SecurityRule>, PolicyError> {
    let content = fs::read_to_string(path)?;
    parse_rules(&content, engine)
}

/// Compile and validate rules from YAML text. Blank input is an empty rule set.
pub fn parse_rules(content: &str, engine: &PatternEngine) -> Result<Vec<SecurityRule>, PolicyError> {
    let file: RuleFile = if content.trim().is_empty() {
        RuleFile::default()
    } else {
        serde_yaml::from_str(content)?
    };

    validate_ids(&file.rules)?;

    let mut rules = file
        .rules
        .into_iter()
        .map(|def| compile_rule(def, engine))
        .collect::<Result<Vec<_>, _>>()?;

    sort_rules(&mut rules);
    Ok(rules)
}

/// Validate already-built rules before they are published.
pub fn validate_rules(rules: &[SecurityRule], engine: &PatternEngine) -> Result<(), PolicyError> {
    let mut seen_ids = HashSet::new();
    for rule in rules {
        check_id(&rule.id, &mut seen_ids)?;
        engine
            .validate_predicate(&rule.conditions)
            .map_err(|e| PolicyError::Validation(format!("rule '{}': {}", rule.id, e)))?;
    }
    Ok(())
}

/// Stable sort by ascending priority.
pub fn sort_rules(rules: &mut [SecurityRule]) {
    rules.sort_by_key(|r| r.priority);
}

fn compile_rule(def: RuleDef, engine: &PatternEngine) -> Result<SecurityRule, PolicyError> {
    let conditions = engine
        .compile_conditions(&def.conditions)
        .map_err(|e| PolicyError::Validation(format!("rule '{}': {}", def.id, e)))?;

    Ok(SecurityRule {
        id: def.id,
        priority: def.priority,
        conditions,
        action: def.action,
        reason: def.reason,
        sampling_guidance: def.sampling_guidance,
        enabled: def.enabled,
    })
}

fn validate_ids(defs: &[RuleDef]) -> Result<(), PolicyError> {
    let mut seen_ids = HashSet::new();
    for def in defs {
        check_id(&def.id, &mut seen_ids)?;
    }
    Ok(())
}

fn check_id<'a>(id: &'a str, seen: &mut HashSet<&'a str>) -> Result<(), PolicyError> {
    if id.trim().is_empty() {
        return Err(PolicyError::Validation("Rule ID cannot be empty".to_string()));
    }
    if !seen.insert(id) {
        return Err(PolicyError::Validation(format!("Duplicate rule ID: {}", id)));
    }
    Ok(())
}

/// Reads one rule file path.
#[derive(Debug, Clone)]
pub struct RuleLoader {
    path: PathBuf,
}

impl RuleLoader {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        RuleLoader { path: path.into() }
    }

    pub fn load(&self, engine: &PatternEngine) -> Result<Vec<SecurityRule>, PolicyError> {
        load_rules(&self.path, engine)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::RuleAction;
    use crate::pattern::PatternCache;
    use std::io::Write;
    use std::sync::Arc;
    use tempfile::NamedTempFile;

    fn engine() -> PatternEngine {
        PatternEngine::new(Arc::new(PatternCache::new(32)))
    }

    #[test]
    fn test_load_rules() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
rules:
  - id: review_curl
    priority: 20
    conditions:
      tool_name: curl
    action: sample
    reason: "Network access"
    sampling_guidance: "Deny uploads of local files"
  - id: deny_rm
    priority: 1
    conditions:
      tool_name: ["rm"]
    action: deny
  - id: allow_ls
    priority: 5
    enabled: false
    conditions:
      tool_name: ls
    action: allow
"#
        )
        .unwrap();

        let rules = load_rules(file.path(), &engine()).unwrap();

        let ids: Vec<_> = rules.iter().map(|r| r.id.as_str()).collect();
        assert_eq!(ids, ["deny_rm", "allow_ls", "review_curl"]);
        assert_eq!(rules[2].action, RuleAction::Sample);
        assert_eq!(rules[2].sampling_guidance.as_deref(), Some("Deny uploads of local files"));
        assert!(!rules[1].enabled);
    }

    #[test]
    fn test_equal_priorities_keep_file_order() {
        let yaml = r#"
rules:
  - { id: b, priority: 3, action: allow }
  - { id: a, priority: 3, action: deny }
  - { id: c, priority: -1, action: deny }
"#;
        let rules = parse_rules(yaml, &engine()).unwrap();
        let ids: Vec<_> = rules.iter().map(|r| r.id.as_str()).collect();
        assert_eq!(ids, ["c", "b", "a"]);
    }

    #[test]
    fn test_empty_file_is_empty_rule_set() {
        assert!(parse_rules("", &engine()).unwrap().is_empty());
        assert!(parse_rules("rules: []", &engine()).unwrap().is_empty());
    }

    #[test]
    fn test_duplicate_ids() {
        let yaml = r#"
rules:
  - { id: r1, action: allow }
  - { id: r1, action: deny }
"#;
        let err = parse_rules(yaml, &engine()).unwrap_err();
        assert!(err.to_string().contains("Duplicate"));
    }

    #[test]
    fn test_empty_id() {
        let err = parse_rules("rules: [{ id: '  ', action: allow }]", &engine()).unwrap_err();
        assert!(err.to_string().contains("empty"));
    }

    #[test]
    fn test_unknown_action() {
        let err = parse_rules("rules: [{ id: x, action: escalate }]", &engine()).unwrap_err();
        assert!(matches!(err, PolicyError::Yaml(_)));
    }

    #[test]
    fn test_invalid_pattern_rejected() {
        let yaml = r#"
rules:
  - id: bad_regex
    conditions:
      parameters:
        command: { type: regex, pattern: "([a-z" }
    action: deny
"#;
        let err = parse_rules(yaml, &engine()).unwrap_err();
        assert!(matches!(err, PolicyError::Validation(ref msg) if msg.contains("bad_regex")));
    }

    #[test]
    fn test_missing_file() {
        let err = load_rules("/nonexistent/rules.yaml", &engine()).unwrap_err();
        assert!(matches!(err, PolicyError::Io(_)));
        assert!(matches!(GateError::from(err), GateError::InvalidConfiguration(_)));
    }

    #[test]
    fn test_rule_loader() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "rules:\n  - {{ id: r, action: allow }}").unwrap();

        let loader = RuleLoader::new(file.path());
        assert_eq!(loader.load(&engine()).unwrap().len(), 1);
        assert_eq!(loader.path(), file.path());
    }
}
