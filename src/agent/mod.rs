//! Agent module: the runtime that drives call nodes.
//!
//! An [`Agent`] streams its work through an [`AgentContext`]: log lines,
//! reasoning and output land on the agent's own node, tool calls and
//! delegations become nested nodes. The renderers only ever see the nodes.

pub mod command;
pub mod runtime;

pub use command::{Command, CommandAgent, CommandParser};
pub use runtime::{AgentContext, Runtime, RuntimeConfig};

use async_trait::async_trait;

use crate::error::AgentError;

/// A unit of work that can run as a node in the execution tree.
#[async_trait]
pub trait Agent: Send + Sync {
    /// Display name of the agent's node.
    fn name(&self) -> &str;

    /// Run to completion. Output streamed through `ctx` becomes the node's
    /// output; returning `Err` fails this agent only.
    async fn run(&self, ctx: AgentContext, input: String) -> Result<(), AgentError>;
}

/// Collapse a tool output string into a single-line preview for display.
pub fn truncate_for_preview(output: &str, max_chars: usize) -> String {
    let collapsed: String = output
        .chars()
        .take(max_chars + 50)
        .map(|c| if c == '\n' { ' ' } else { c })
        .collect::<String>()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ");
    // char_indices gives us byte offsets at char boundaries, so the slice is always valid UTF-8.
    if collapsed.chars().count() > max_chars {
        let byte_offset = collapsed
            .char_indices()
            .nth(max_chars)
            .map(|(i, _)| i)
            .unwrap_or(collapsed.len());
        format!("{}...", &collapsed[..byte_offset])
    } else {
        collapsed
    }
}

#[cfg(test)]
mod tests {
    use super::truncate_for_preview;

    #[test]
    fn test_truncate_short_input() {
        assert_eq!(truncate_for_preview("hello", 10), "hello");
    }

    #[test]
    fn test_truncate_empty_input() {
        assert_eq!(truncate_for_preview("", 10), "");
    }

    #[test]
    fn test_truncate_over_limit() {
        assert_eq!(truncate_for_preview("hello world, this is long", 10), "hello worl...");
    }

    #[test]
    fn test_truncate_collapses_newlines() {
        assert_eq!(truncate_for_preview("line1\nline2\nline3", 100), "line1 line2 line3");
    }

    #[test]
    fn test_truncate_multibyte_utf8() {
        let input = "😀😁😂🤣😃😄😅😆😉😊";
        assert_eq!(truncate_for_preview(input, 5), "😀😁😂🤣😃...");
    }
}
