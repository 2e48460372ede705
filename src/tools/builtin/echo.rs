//! `echo`: returns its input text.

use async_trait::async_trait;

use crate::tools::tool::{Tool, ToolError, ToolOutput, require_str};

pub struct EchoTool;

#[async_trait]
impl Tool for EchoTool {
    fn name(&self) -> &str {
        "echo"
    }

    fn description(&self) -> &str {
        "Echo the given text back"
    }

    async fn execute(&self, params: serde_json::Value) -> Result<ToolOutput, ToolError> {
        let start = std::time::Instant::now();
        let text = require_str(self.name(), &params, "text")?;
        Ok(ToolOutput::text(text, start.elapsed()))
    }
}
