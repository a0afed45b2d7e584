use std::path::{Path, PathBuf};
use std::time::Duration;

use clap::Parser;
use serde::Deserialize;

use crate::ai::{AiManagerConfig, CircuitBreakerConfig};
use crate::error::GateError;
use crate::inference::CliProviderConfig;

/// Command-line configuration for the gatekeep binary.
#[derive(Debug, Clone, Parser)]
#[command(name = "gatekeep")]
#[command(about = "Security policy decision engine for agent tool requests")]
pub struct Config {
    /// Path to the security rules YAML file
    #[arg(long, default_value = "rules.yaml", env = "GATEKEEP_RULES_PATH")]
    pub rules_path: PathBuf,

    /// Optional settings file (TOML or YAML)
    #[arg(long, env = "GATEKEEP_SETTINGS_PATH")]
    pub settings_path: Option<PathBuf>,

    /// Quiet period before a changed rules file is reloaded, in milliseconds.
    /// Overrides the settings file when given.
    #[arg(long, env = "GATEKEEP_RELOAD_DEBOUNCE_MS")]
    pub reload_debounce_ms: Option<u64>,

    /// Disable watching the rules file
    #[arg(long, default_value = "false", env = "GATEKEEP_NO_WATCH")]
    pub no_watch: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info", env = "RUST_LOG")]
    pub log_level: String,

    /// Emit logs as JSON lines
    #[arg(long, default_value = "false", env = "GATEKEEP_LOG_JSON")]
    pub log_json: bool,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            rules_path: PathBuf::from("rules.yaml"),
            settings_path: None,
            reload_debounce_ms: None,
            no_watch: false,
            log_level: "info".to_string(),
            log_json: false,
        }
    }
}

/// Layered engine settings: defaults, then an optional file, then
/// `GATEKEEP__`-prefixed environment variables (`GATEKEEP__INFERENCE__ENABLED=true`).
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Compiled patterns kept per dialect
    pub pattern_cache_capacity: usize,
    pub reload_debounce_ms: u64,
    pub inference: InferenceSettings,
    pub sampling: SamplingSettings,
}

impl Default for Settings {
    fn default() -> Self {
        Settings {
            pattern_cache_capacity: 1000,
            reload_debounce_ms: 500,
            inference: InferenceSettings::default(),
            sampling: SamplingSettings::default(),
        }
    }
}

impl Settings {
    pub fn load(path: Option<&Path>) -> Result<Self, GateError> {
        let mut builder = ::config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(::config::File::from(path).required(true));
        }
        builder = builder.add_source(
            ::config::Environment::with_prefix("GATEKEEP")
                .separator("__")
                .try_parsing(true),
        );

        builder
            .build()
            .and_then(|c| c.try_deserialize::<Settings>())
            .map_err(|e| GateError::config(format!("settings: {}", e)))
    }

    pub fn reload_debounce(&self) -> Duration {
        Duration::from_millis(self.reload_debounce_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct InferenceSettings {
    pub enabled: bool,
    /// Budget for one provider attempt before moving to the next
    pub attempt_timeout_ms: u64,
    pub max_concurrent: usize,
    pub cache_ttl_secs: u64,
    pub cache_capacity: u64,
    pub providers: Vec<ProviderSettings>,
}

impl Default for InferenceSettings {
    fn default() -> Self {
        InferenceSettings {
            enabled: true,
            attempt_timeout_ms: 30_000,
            max_concurrent: 10,
            cache_ttl_secs: 300,
            cache_capacity: 1000,
            providers: Vec::new(),
        }
    }
}

impl InferenceSettings {
    pub fn attempt_timeout(&self) -> Duration {
        Duration::from_millis(self.attempt_timeout_ms)
    }

    pub fn cache_ttl(&self) -> Duration {
        Duration::from_secs(self.cache_ttl_secs)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderKind {
    Cli,
    Sampling,
    Stub,
}

/// One entry in `inference.providers`, tried in list order.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ProviderSettings {
    pub kind: ProviderKind,
    pub name: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub command: Option<String>,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub args: Option<Vec<String>>,
    #[serde(default)]
    pub timeout_ms: Option<u64>,
    #[serde(default)]
    pub max_retries: Option<u32>,
}

fn default_true() -> bool {
    true
}

impl ProviderSettings {
    /// CLI provider config with unset fields taken from the defaults.
    pub fn cli_config(&self) -> CliProviderConfig {
        let defaults = CliProviderConfig::default();
        CliProviderConfig {
            name: self.name.clone(),
            command: self.command.clone().unwrap_or(defaults.command),
            args: self.args.clone().unwrap_or(defaults.args),
            model: self.model.clone(),
            timeout: self
                .timeout_ms
                .map(Duration::from_millis)
                .unwrap_or(defaults.timeout),
            max_retries: self.max_retries.unwrap_or(defaults.max_retries),
            ..defaults
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct SamplingSettings {
    pub cache_ttl_secs: u64,
    pub cache_capacity: u64,
    pub max_concurrent: usize,
    pub breaker: BreakerSettings,
}

impl Default for SamplingSettings {
    fn default() -> Self {
        SamplingSettings {
            cache_ttl_secs: 300,
            cache_capacity: 1000,
            max_concurrent: 10,
            breaker: BreakerSettings::default(),
        }
    }
}

impl From<&SamplingSettings> for AiManagerConfig {
    fn from(s: &SamplingSettings) -> Self {
        AiManagerConfig {
            cache_ttl: Duration::from_secs(s.cache_ttl_secs),
            cache_capacity: s.cache_capacity,
            max_concurrent: s.max_concurrent,
            breaker: CircuitBreakerConfig::from(&s.breaker),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct BreakerSettings {
    pub failure_threshold: u32,
    pub recovery_timeout_ms: u64,
    pub call_timeout_ms: u64,
}

impl Default for BreakerSettings {
    fn default() -> Self {
        BreakerSettings {
            failure_threshold: 5,
            recovery_timeout_ms: 30_000,
            call_timeout_ms: 30_000,
        }
    }
}

impl From<&BreakerSettings> for CircuitBreakerConfig {
    fn from(b: &BreakerSettings) -> Self {
        CircuitBreakerConfig {
            failure_threshold: b.failure_threshold.max(1),
            recovery_timeout: Duration::from_millis(b.recovery_timeout_ms),
            call_timeout: Duration::from_millis(b.call_timeout_ms),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_default_config() {
        let config = Config::default();

        assert_eq!(config.rules_path, PathBuf::from("rules.yaml"));
        assert!(!config.log_json);
        assert!(config.reload_debounce_ms.is_none());
    }

    #[test]
    fn test_default_settings() {
        let settings = Settings::default();

        assert_eq!(settings.pattern_cache_capacity, 1000);
        assert_eq!(settings.reload_debounce(), Duration::from_millis(500));
        assert!(settings.inference.enabled);
        assert!(settings.inference.providers.is_empty());
        assert_eq!(settings.sampling.breaker.failure_threshold, 5);
    }

    #[test]
    fn test_load_yaml_settings() {
        let mut file = tempfile::Builder::new().suffix(".yaml").tempfile().unwrap();
        writeln!(
            file,
            r#"
reload_debounce_ms: 250
inference:
  attempt_timeout_ms: 2000
  providers:
    - kind: cli
      name: reviewer
      model: sonnet
      timeout_ms: 1500
    - kind: stub
      name: later
      enabled: false
sampling:
  breaker:
    failure_threshold: 2
"#
        )
        .unwrap();

        let settings = Settings::load(Some(file.path())).unwrap();

        assert_eq!(settings.reload_debounce_ms, 250);
        assert_eq!(settings.pattern_cache_capacity, 1000);
        assert_eq!(settings.inference.attempt_timeout(), Duration::from_secs(2));
        assert_eq!(settings.inference.providers.len(), 2);
        assert_eq!(settings.inference.providers[0].kind, ProviderKind::Cli);
        assert!(!settings.inference.providers[1].enabled);
        assert_eq!(settings.sampling.breaker.failure_threshold, 2);
        assert_eq!(settings.sampling.breaker.call_timeout_ms, 30_000);

        let cli = settings.inference.providers[0].cli_config();
        assert_eq!(cli.name, "reviewer");
        assert_eq!(cli.command, "claude");
        assert_eq!(cli.model.as_deref(), Some("sonnet"));
        assert_eq!(cli.timeout, Duration::from_millis(1500));
    }

    #[test]
    fn test_missing_settings_file_is_error() {
        let result = Settings::load(Some(Path::new("/nonexistent/gatekeep.toml")));
        assert!(matches!(result, Err(GateError::InvalidConfiguration(_))));
    }

    #[test]
    fn test_breaker_conversion() {
        let breaker = CircuitBreakerConfig::from(&BreakerSettings {
            failure_threshold: 0,
            recovery_timeout_ms: 100,
            call_timeout_ms: 50,
        });

        assert_eq!(breaker.failure_threshold, 1);
        assert_eq!(breaker.recovery_timeout, Duration::from_millis(100));
        assert_eq!(breaker.call_timeout, Duration::from_millis(50));
    }
}
