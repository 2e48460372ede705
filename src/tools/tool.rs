//! The `Tool` trait and its output type.

use std::time::Duration;

use async_trait::async_trait;

pub use crate::error::ToolError;

/// Default per-call timeout.
pub const DEFAULT_TOOL_TIMEOUT: Duration = Duration::from_secs(30);

/// What a tool call produced.
#[derive(Debug, Clone, PartialEq)]
pub struct ToolOutput {
    pub result: String,
    pub duration: Duration,
}

impl ToolOutput {
    pub fn text(result: impl Into<String>, duration: Duration) -> Self {
        Self {
            result: result.into(),
            duration,
        }
    }
}

/// A capability an agent can call by name.
#[async_trait]
pub trait Tool: Send + Sync {
    fn name(&self) -> &str;

    fn description(&self) -> &str;

    async fn execute(&self, params: serde_json::Value) -> Result<ToolOutput, ToolError>;

    /// How long a call may run before the runtime abandons it.
    fn execution_timeout(&self) -> Duration {
        DEFAULT_TOOL_TIMEOUT
    }
}

/// Extract a required string parameter.
pub fn require_str<'a>(
    tool: &str,
    params: &'a serde_json::Value,
    key: &str,
) -> Result<&'a str, ToolError> {
    params
        .get(key)
        .and_then(serde_json::Value::as_str)
        .ok_or_else(|| ToolError::InvalidParameters {
            name: tool.to_string(),
            reason: format!("missing string parameter '{key}'"),
        })
}
