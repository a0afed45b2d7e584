use async_trait::async_trait;
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;
use tracing::{debug, warn};

use super::parse::parse_review;
use super::{InferenceDecision, InferenceProvider, InferenceRequest, ProviderInfo};
use crate::error::GateError;

pub const DEFAULT_COMMAND: &str = "claude";
pub const DEFAULT_MAX_PROMPT_LEN: usize = 50_000;
const MAX_STDERR_IN_ERROR: usize = 500;
const HEALTH_CHECK_TIMEOUT: Duration = Duration::from_secs(5);

const MAX_MODEL_LEN: usize = 128;

/// Reject model identifiers that could be read as flags or carry shell syntax.
///
/// Accepted: `[A-Za-z0-9][A-Za-z0-9._:/-]*`, at most 128 characters.
pub fn validate_model(model: &str) -> Result<(), GateError> {
    let mut chars = model.chars();
    let well_formed = model.len() <= MAX_MODEL_LEN
        && chars.next().is_some_and(|c| c.is_ascii_alphanumeric())
        && chars.all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | ':' | '/' | '-'));

    if well_formed {
        Ok(())
    } else {
        Err(GateError::config(format!("invalid model identifier '{}'", model)))
    }
}

/// Strip control characters (keeping newline and tab) and cap the length.
pub fn sanitize_prompt(prompt: &str, max_len: usize) -> String {
    prompt
        .chars()
        .filter(|c| !c.is_control() || *c == '\n' || *c == '\t')
        .take(max_len)
        .collect()
}

#[derive(Debug, Clone)]
pub struct CliProviderConfig {
    pub name: String,
    pub command: String,
    /// Argument template. `{prompt}` and `{model}` are substituted per call.
    pub args: Vec<String>,
    pub model: Option<String>,
    pub timeout: Duration,
    pub max_retries: u32,
    pub retry_backoff: Duration,
    pub max_prompt_len: usize,
}

impl Default for CliProviderConfig {
    fn default() -> Self {
        CliProviderConfig {
            name: "cli".to_string(),
            command: DEFAULT_COMMAND.to_string(),
            args: ["-p", "{prompt}", "--output-format", "json"]
                .into_iter()
                .map(str::to_string)
                .collect(),
            model: None,
            timeout: Duration::from_secs(60),
            max_retries: 2,
            retry_backoff: Duration::from_millis(500),
            max_prompt_len: DEFAULT_MAX_PROMPT_LEN,
        }
    }
}

/// Reviewer run as a non-interactive child process.
///
/// The prompt is handed over as a single argv element; no shell is involved.
pub struct CliProvider {
    config: CliProviderConfig,
}

impl CliProvider {
    pub fn new(config: CliProviderConfig) -> Result<Self, GateError> {
        if config.command.trim().is_empty() {
            return Err(GateError::config(format!("provider '{}' has an empty command", config.name)));
        }
        if let Some(model) = &config.model {
            validate_model(model)?;
        }
        Ok(CliProvider { config })
    }

    pub fn config(&self) -> &CliProviderConfig {
        &self.config
    }

    /// Expand the argument template. A model with no `{model}` slot is
    /// passed as `--model <id>`.
    pub fn build_args(&self, prompt: &str) -> Vec<String> {
        let model = self.config.model.as_deref().unwrap_or("");
        let mut args: Vec<String> = self
            .config
            .args
            .iter()
            .map(|arg| arg.replace("{prompt}", prompt).replace("{model}", model))
            .collect();

        let has_model_slot = self.config.args.iter().any(|a| a.contains("{model}"));
        if !has_model_slot && !model.is_empty() {
            args.push("--model".to_string());
            args.push(model.to_string());
        }
        args
    }

    async fn run_once(&self, args: &[String]) -> Result<InferenceDecision, GateError> {
        let child = Command::new(&self.config.command)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                GateError::AiServiceUnavailable(format!("failed to start '{}': {}", self.config.command, e))
            })?;

        let output = tokio::time::timeout(self.config.timeout, child.wait_with_output())
            .await
            .map_err(|_| GateError::AiServiceTimeout(self.config.timeout.as_millis() as u64))?
            .map_err(|e| GateError::AiServiceUnavailable(format!("reviewer process failed: {}", e)))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let stderr: String = stderr.trim().chars().take(MAX_STDERR_IN_ERROR).collect();
            return Err(GateError::AiServiceUnavailable(format!(
                "'{}' exited with {}: {}",
                self.config.command, output.status, stderr
            )));
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        let decision = parse_review(&stdout, &self.config.name)?;
        let model = self.config.model.clone().or_else(|| decision.model.clone());
        Ok(decision.with_model(model))
    }
}

#[async_trait]
impl InferenceProvider for CliProvider {
    fn name(&self) -> &str {
        &self.config.name
    }

    async fn evaluate(&self, request: &InferenceRequest) -> Result<InferenceDecision, GateError> {
        let prompt = sanitize_prompt(&request.prompt, self.config.max_prompt_len);
        let args = self.build_args(&prompt);
        let attempts = self.config.max_retries + 1;

        let mut attempt = 1;
        loop {
            match self.run_once(&args).await {
                Ok(decision) => {
                    debug!(provider = %self.config.name, attempt, "reviewer answered");
                    return Ok(decision);
                }
                Err(e) if e.is_transient() && attempt < attempts => {
                    warn!(provider = %self.config.name, attempt, error = %e, "reviewer call failed, retrying");
                    tokio::time::sleep(self.config.retry_backoff * attempt).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn health_check(&self) -> bool {
        let check = Command::new(&self.config.command)
            .arg("--version")
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .status();

        matches!(
            tokio::time::timeout(HEALTH_CHECK_TIMEOUT, check).await,
            Ok(Ok(status)) if status.success()
        )
    }

    fn provider_info(&self) -> ProviderInfo {
        ProviderInfo {
            name: self.config.name.clone(),
            kind: "cli",
            model: self.config.model.clone(),
            implemented: true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::Verdict;

    fn request(prompt: &str) -> InferenceRequest {
        InferenceRequest {
            prompt: prompt.to_string(),
            cache_key: "k".into(),
            rule_id: "r".into(),
            tool_name: "bash".into(),
            sampling_guidance: None,
        }
    }

    fn provider(command: &str, args: &[&str]) -> CliProvider {
        CliProvider::new(CliProviderConfig {
            name: "test-cli".into(),
            command: command.into(),
            args: args.iter().map(|s| s.to_string()).collect(),
            timeout: Duration::from_secs(5),
            max_retries: 0,
            retry_backoff: Duration::from_millis(10),
            ..Default::default()
        })
        .unwrap()
    }

    #[test]
    fn test_validate_model() {
        assert!(validate_model("claude-3-5-sonnet").is_ok());
        assert!(validate_model("org/model:v1.2").is_ok());
        assert!(validate_model("--help").is_err());
        assert!(validate_model("m; rm -rf /").is_err());
        assert!(validate_model("$(whoami)").is_err());
        assert!(validate_model("").is_err());
        assert!(validate_model(&"a".repeat(129)).is_err());
    }

    #[test]
    fn test_new_rejects_bad_model() {
        let result = CliProvider::new(CliProviderConfig {
            model: Some("x`id`".into()),
            ..Default::default()
        });
        assert!(matches!(result, Err(GateError::InvalidConfiguration(_))));
    }

    #[test]
    fn test_sanitize_prompt() {
        assert_eq!(sanitize_prompt("ls\u{1b}[31m -la\0", 100), "ls[31m -la");
        assert_eq!(sanitize_prompt("a\nb\tc", 100), "a\nb\tc");
        assert_eq!(sanitize_prompt("abcdef", 3), "abc");
    }

    #[test]
    fn test_build_args() {
        let p = CliProvider::new(CliProviderConfig {
            model: Some("m1".into()),
            ..Default::default()
        })
        .unwrap();
        assert_eq!(
            p.build_args("hi"),
            ["-p", "hi", "--output-format", "json", "--model", "m1"]
        );

        let p = CliProvider::new(CliProviderConfig {
            args: vec!["run".into(), "--model={model}".into(), "{prompt}".into()],
            model: Some("m2".into()),
            ..Default::default()
        })
        .unwrap();
        assert_eq!(p.build_args("hi"), ["run", "--model=m2", "hi"]);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_json_output() {
        let p = provider("echo", &[r#"{"decision":"allow","reasoning":"read only","confidence":0.8}"#]);

        let d = p.evaluate(&request("ls")).await.unwrap();
        assert_eq!(d.decision, Verdict::Allow);
        assert_eq!(d.confidence, 0.8);
        assert_eq!(d.provider, "test-cli");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_free_text_output_includes_prompt_argument() {
        let p = provider(
            "printf",
            &["%s\\n", "DECISION: DENY", "CONFIDENCE: 0.75", "REASON: {prompt}"],
        );

        let d = p.evaluate(&request("rm -rf build; echo pwned")).await.unwrap();
        assert_eq!(d.decision, Verdict::Deny);
        assert_eq!(d.confidence, 0.75);
        // Shell metacharacters arrive verbatim, nothing was executed
        assert_eq!(d.reasoning, "rm -rf build; echo pwned");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_timeout() {
        let p = CliProvider::new(CliProviderConfig {
            command: "sleep".into(),
            args: vec!["5".into()],
            timeout: Duration::from_millis(100),
            max_retries: 0,
            ..Default::default()
        })
        .unwrap();

        assert_eq!(p.evaluate(&request("x")).await, Err(GateError::AiServiceTimeout(100)));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_non_zero_exit_is_unavailable() {
        let p = CliProvider::new(CliProviderConfig {
            command: "false".into(),
            args: Vec::new(),
            max_retries: 1,
            retry_backoff: Duration::from_millis(5),
            ..Default::default()
        })
        .unwrap();

        assert!(matches!(
            p.evaluate(&request("x")).await,
            Err(GateError::AiServiceUnavailable(_))
        ));
    }

    #[tokio::test]
    async fn test_missing_binary() {
        let p = provider("gatekeep-no-such-reviewer-binary", &[]);

        assert!(matches!(
            p.evaluate(&request("x")).await,
            Err(GateError::AiServiceUnavailable(_))
        ));
        assert!(!p.health_check().await);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_unparseable_output() {
        let p = provider("echo", &["no idea"]);
        assert!(matches!(
            p.evaluate(&request("x")).await,
            Err(GateError::InvalidAiResponse(_))
        ));
    }

    #[test]
    fn test_provider_info() {
        let p = provider("echo", &[]);
        let info = p.provider_info();
        assert_eq!(info.kind, "cli");
        assert!(info.implemented);
    }
}
