pub mod audit;
pub mod engine;
pub mod fallback;
pub mod hot_reload;
pub mod loader;
pub mod prompt;

pub use audit::{AuditSink, TracingAuditSink};
pub use engine::{cache_key, EngineHealth, RuleSnapshot, SecurityPolicyEngine, SecurityPolicyEngineBuilder};
pub use fallback::ErrorPolicy;
pub use hot_reload::{ConfigWatcher, ReloadTarget, WatcherHealth, DEFAULT_POLL_INTERVAL};
pub use loader::{load_rules, parse_rules, PolicyError, RuleLoader};
pub use prompt::{DefaultPromptBuilder, PromptBuilder};
