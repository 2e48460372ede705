//! `time`: current UTC time.

use async_trait::async_trait;
use chrono::Utc;

use crate::tools::tool::{Tool, ToolError, ToolOutput};

/// Format used when the caller gives none.
const DEFAULT_FORMAT: &str = "%Y-%m-%d %H:%M:%S UTC";

pub struct TimeTool;

#[async_trait]
impl Tool for TimeTool {
    fn name(&self) -> &str {
        "time"
    }

    fn description(&self) -> &str {
        "Current UTC time, optionally with a strftime format"
    }

    async fn execute(&self, params: serde_json::Value) -> Result<ToolOutput, ToolError> {
        let start = std::time::Instant::now();
        let format = params
            .get("format")
            .and_then(serde_json::Value::as_str)
            .or_else(|| params.get("text").and_then(serde_json::Value::as_str))
            .filter(|f| !f.trim().is_empty())
            .unwrap_or(DEFAULT_FORMAT);

        let mut rendered = String::new();
        // An invalid format surfaces as a fmt error instead of a panic.
        if std::fmt::Write::write_fmt(&mut rendered, format_args!("{}", Utc::now().format(format)))
            .is_err()
        {
            return Err(ToolError::InvalidParameters {
                name: self.name().to_string(),
                reason: format!("invalid time format '{format}'"),
            });
        }
        Ok(ToolOutput::text(rendered, start.elapsed()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn default_format_mentions_utc() {
        let out = TimeTool.execute(serde_json::json!({})).await.unwrap();
        assert!(out.result.ends_with(" UTC"));
    }

    #[tokio::test]
    async fn custom_format() {
        let out = TimeTool
            .execute(serde_json::json!({"format": "%Y"}))
            .await
            .unwrap();
        assert_eq!(out.result.len(), 4);
    }

    #[tokio::test]
    async fn bad_format_is_rejected() {
        let err = TimeTool
            .execute(serde_json::json!({"format": "%Q"}))
            .await
            .unwrap_err();
        assert!(matches!(err, ToolError::InvalidParameters { .. }));
    }
}
