use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

/// Unique request identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RequestId(pub String);

impl RequestId {
    pub fn new() -> Self {
        RequestId(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for RequestId {
    fn default() -> Self {
        RequestId::new()
    }
}

/// A proposed agent action submitted for approval before execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolRequest {
    /// Unique request identifier
    #[serde(default)]
    pub id: RequestId,

    /// Tool the agent wants to run (e.g. "bash", "write_file")
    pub tool_name: String,

    /// Tool arguments, arbitrary structured values
    #[serde(default)]
    pub parameters: Map<String, Value>,

    /// Session the request belongs to
    #[serde(default)]
    pub session_id: Option<String>,

    /// Agent that issued the request
    #[serde(default)]
    pub agent_id: Option<String>,

    /// Working directory of the agent
    #[serde(default)]
    pub cwd: Option<String>,

    /// When the request was created
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
}

impl ToolRequest {
    /// Create a request for `tool_name` with no parameters.
    pub fn new(tool_name: impl Into<String>) -> Self {
        ToolRequest {
            id: RequestId::new(),
            tool_name: tool_name.into(),
            parameters: Map::new(),
            session_id: None,
            agent_id: None,
            cwd: None,
            created_at: Utc::now(),
        }
    }

    pub fn with_parameter(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.parameters.insert(name.into(), value.into());
        self
    }

    pub fn with_cwd(mut self, cwd: impl Into<String>) -> Self {
        self.cwd = Some(cwd.into());
        self
    }

    pub fn with_session(mut self, session_id: impl Into<String>, agent_id: impl Into<String>) -> Self {
        self.session_id = Some(session_id.into());
        self.agent_id = Some(agent_id.into());
        self
    }

    /// Look up a single parameter.
    pub fn parameter(&self, name: &str) -> Option<&Value> {
        self.parameters.get(name)
    }
}
