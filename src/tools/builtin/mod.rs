//! Built-in tools available to every agent.

pub mod echo;
pub mod json;
pub mod time;

use std::sync::Arc;

pub use echo::EchoTool;
pub use json::JsonTool;
pub use time::TimeTool;

use crate::tools::ToolRegistry;

/// Register the built-in tools. They are protected from shadowing.
pub async fn register_builtin_tools(registry: &ToolRegistry) {
    registry.register_builtin(Arc::new(EchoTool)).await;
    registry.register_builtin(Arc::new(TimeTool)).await;
    registry.register_builtin(Arc::new(JsonTool)).await;
}
