//! `json`: validates and pretty-prints JSON.

use async_trait::async_trait;

use crate::tools::tool::{Tool, ToolError, ToolOutput};

pub struct JsonTool;

#[async_trait]
impl Tool for JsonTool {
    fn name(&self) -> &str {
        "json"
    }

    fn description(&self) -> &str {
        "Validate and pretty-print a JSON value"
    }

    async fn execute(&self, params: serde_json::Value) -> Result<ToolOutput, ToolError> {
        let start = std::time::Instant::now();
        let value = params
            .get("value")
            .or_else(|| params.get("text"))
            .ok_or_else(|| ToolError::InvalidParameters {
                name: self.name().to_string(),
                reason: "missing parameter 'value'".to_string(),
            })?;

        let parsed = match value {
            serde_json::Value::String(raw) => {
                serde_json::from_str(raw).map_err(|e| ToolError::ExecutionFailed {
                    name: self.name().to_string(),
                    reason: format!("invalid JSON: {e}"),
                })?
            }
            other => other.clone(),
        };

        let pretty =
            serde_json::to_string_pretty(&parsed).map_err(|e| ToolError::ExecutionFailed {
                name: self.name().to_string(),
                reason: e.to_string(),
            })?;
        Ok(ToolOutput::text(pretty, start.elapsed()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn pretty_prints_embedded_json() {
        let out = JsonTool
            .execute(serde_json::json!({"value": "{\"a\":1}"}))
            .await
            .unwrap();
        assert_eq!(out.result, "{\n  \"a\": 1\n}");
    }

    #[tokio::test]
    async fn accepts_structured_values() {
        let out = JsonTool
            .execute(serde_json::json!({"value": [1, 2]}))
            .await
            .unwrap();
        assert_eq!(out.result, "[\n  1,\n  2\n]");
    }

    #[tokio::test]
    async fn invalid_json_fails() {
        let err = JsonTool
            .execute(serde_json::json!({"text": "{oops"}))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("invalid JSON"));
    }
}
