//! Tool registry shared by every agent of a runtime.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use tokio::sync::RwLock;
use tracing::{debug, warn};

use crate::tools::tool::{Tool, ToolError};

#[derive(Default)]
struct Entries {
    tools: HashMap<String, Arc<dyn Tool>>,
    /// Names registered at startup; later registrations may not replace them.
    builtin: HashSet<String>,
}

/// Tools by name.
#[derive(Default)]
pub struct ToolRegistry {
    entries: RwLock<Entries>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a built-in tool. Later registrations cannot replace it.
    pub async fn register_builtin(&self, tool: Arc<dyn Tool>) {
        let name = tool.name().to_string();
        let mut entries = self.entries.write().await;
        entries.builtin.insert(name.clone());
        entries.tools.insert(name.clone(), tool);
        debug!(tool = %name, "Built-in tool registered");
    }

    /// Register or replace a tool. Built-in tools cannot be replaced.
    pub async fn register(&self, tool: Arc<dyn Tool>) -> Result<(), ToolError> {
        let name = tool.name().to_string();
        let mut entries = self.entries.write().await;
        if entries.builtin.contains(&name) {
            warn!(tool = %name, "Rejected registration shadowing a built-in tool");
            return Err(ToolError::Protected { name });
        }
        entries.tools.insert(name.clone(), tool);
        debug!(tool = %name, "Tool registered");
        Ok(())
    }

    pub async fn get(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.entries.read().await.tools.get(name).cloned()
    }

    pub async fn has(&self, name: &str) -> bool {
        self.entries.read().await.tools.contains_key(name)
    }

    /// Tool names, sorted.
    pub async fn list(&self) -> Vec<String> {
        let mut names: Vec<String> = self.entries.read().await.tools.keys().cloned().collect();
        names.sort();
        names
    }

    /// `/name — description` per tool, sorted by name.
    pub async fn describe(&self) -> Vec<String> {
        let entries = self.entries.read().await;
        let mut lines: Vec<String> = entries
            .tools
            .values()
            .map(|tool| format!("/{} — {}", tool.name(), tool.description()))
            .collect();
        lines.sort();
        lines
    }
}
