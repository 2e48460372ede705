//! The built-in command agent.
//!
//! Requests are read line by line: `/tool args` calls a tool, `>> text`
//! delegates to a nested command agent, anything else is echoed back.

use std::sync::{Arc, LazyLock};

use async_trait::async_trait;
use regex::Regex;
use serde_json::Value;

use super::{Agent, AgentContext};
use crate::error::AgentError;

static SLASH_COMMAND: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^/([a-z][a-z0-9_]*)(?:\s+(.*))?$").expect("command regex is valid")
});

/// One parsed request line.
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    /// Empty or whitespace-only line.
    Blank,
    /// `/help`: list the available tools.
    Help,
    /// `/think text`: record reasoning.
    Think(String),
    /// `/fail reason`: fail the running agent.
    Fail(String),
    /// `/name args`: call a tool.
    Tool { name: String, params: Value },
    /// `>> text`: hand `text` to a nested agent.
    Delegate(String),
    /// Plain text, echoed to the output.
    Text(String),
}

/// Parses request lines into commands.
pub struct CommandParser;

impl CommandParser {
    pub fn parse(line: &str) -> Command {
        let trimmed = line.trim();
        if trimmed.is_empty() {
            return Command::Blank;
        }
        parse_delegate(trimmed)
            .or_else(|| parse_slash(trimmed))
            .unwrap_or_else(|| Command::Text(trimmed.to_string()))
    }
}

fn parse_delegate(trimmed: &str) -> Option<Command> {
    let rest = trimmed.strip_prefix(">>")?.trim();
    Some(Command::Delegate(rest.to_string()))
}

fn parse_slash(trimmed: &str) -> Option<Command> {
    let caps = SLASH_COMMAND.captures(trimmed)?;
    let name = caps.get(1)?.as_str();
    let args = caps.get(2).map(|m| m.as_str().trim()).unwrap_or("");
    Some(match name {
        "help" => Command::Help,
        "think" => Command::Think(args.to_string()),
        "fail" => Command::Fail(args.to_string()),
        _ => Command::Tool {
            name: name.to_string(),
            params: tool_params(args),
        },
    })
}

/// Tool arguments: a JSON object if they parse as one, otherwise the raw
/// text under `text`.
fn tool_params(args: &str) -> Value {
    if args.is_empty() {
        return Value::Object(Default::default());
    }
    match serde_json::from_str::<Value>(args) {
        Ok(value @ Value::Object(_)) => value,
        _ => serde_json::json!({ "text": args }),
    }
}

/// Root agent that executes a request as a script of commands.
pub struct CommandAgent {
    name: String,
}

impl CommandAgent {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }
}

impl Default for CommandAgent {
    fn default() -> Self {
        Self::new("assistant")
    }
}

#[async_trait]
impl Agent for CommandAgent {
    fn name(&self) -> &str {
        &self.name
    }

    async fn run(&self, ctx: AgentContext, input: String) -> Result<(), AgentError> {
        let mut wrote = false;
        let mut emit = |ctx: &AgentContext, text: &str| {
            if text.is_empty() {
                return;
            }
            if wrote {
                ctx.output("\n");
            }
            ctx.output(text);
            wrote = true;
        };

        for line in input.lines() {
            match CommandParser::parse(line) {
                Command::Blank => {}
                Command::Help => {
                    let mut lines = vec!["Available commands:".to_string()];
                    lines.extend(ctx.tools().describe().await);
                    lines.push(">> text — delegate to a helper".to_string());
                    emit(&ctx, &lines.join("\n"));
                }
                Command::Think(text) => {
                    ctx.think(text);
                    ctx.think_end();
                }
                Command::Fail(reason) => {
                    return Err(AgentError::Failed {
                        name: self.name.clone(),
                        reason: if reason.is_empty() {
                            "asked to fail".to_string()
                        } else {
                            reason
                        },
                    });
                }
                Command::Tool { name, params } => {
                    // Tool failures are already visible on the tool's node.
                    if let Ok(result) = ctx.call_tool(&name, params).await {
                        emit(&ctx, result.trim_end());
                    }
                }
                Command::Delegate(text) => {
                    ctx.log(format!("Delegating: {}", super::truncate_for_preview(&text, 60)));
                    if let Ok(result) = ctx.delegate(Arc::new(CommandAgent::new("helper")), &text).await {
                        emit(&ctx, result.trim_end());
                    }
                }
                Command::Text(text) => emit(&ctx, &text),
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use uuid::Uuid;

    use super::*;
    use crate::agent::{Runtime, RuntimeConfig};
    use crate::node::{CallNode, Step};
    use crate::tools::{ToolRegistry, register_builtin_tools};

    #[test]
    fn parses_each_command_form() {
        assert_eq!(CommandParser::parse("   "), Command::Blank);
        assert_eq!(CommandParser::parse("/help"), Command::Help);
        assert_eq!(CommandParser::parse("/think  hmm "), Command::Think("hmm".into()));
        assert_eq!(CommandParser::parse("/fail"), Command::Fail(String::new()));
        assert_eq!(CommandParser::parse(">> look it up"), Command::Delegate("look it up".into()));
        assert_eq!(CommandParser::parse("hello there"), Command::Text("hello there".into()));
        // Not a command: uppercase and paths fall through to text.
        assert_eq!(CommandParser::parse("/Echo hi"), Command::Text("/Echo hi".into()));
        assert_eq!(CommandParser::parse("/usr/bin"), Command::Text("/usr/bin".into()));
    }

    #[test]
    fn tool_args_prefer_json_objects() {
        assert_eq!(
            CommandParser::parse(r#"/json {"value": [1, 2]}"#),
            Command::Tool {
                name: "json".into(),
                params: serde_json::json!({"value": [1, 2]}),
            }
        );
        assert_eq!(
            CommandParser::parse("/echo [1, 2]"),
            Command::Tool {
                name: "echo".into(),
                params: serde_json::json!({"text": "[1, 2]"}),
            }
        );
        assert_eq!(
            CommandParser::parse("/time"),
            Command::Tool {
                name: "time".into(),
                params: serde_json::json!({}),
            }
        );
    }

    async fn run(input: &str) -> (Result<String, AgentError>, Arc<CallNode>) {
        let tools = Arc::new(ToolRegistry::new());
        register_builtin_tools(&tools).await;
        let runtime = Runtime::new(tools, RuntimeConfig::default());
        let root = CallNode::agent("assistant", input);
        let result = runtime
            .run_root(
                Uuid::new_v4(),
                Arc::new(CommandAgent::default()),
                Arc::clone(&root),
                input.to_string(),
            )
            .await;
        (result, root)
    }

    #[tokio::test]
    async fn echoes_text_and_tool_results() {
        let (result, root) = run("first\n/echo second\n\nthird").await;
        assert_eq!(result.unwrap(), "first\nsecond\nthird");
        assert_eq!(root.children().len(), 1);
    }

    #[tokio::test]
    async fn delegation_nests_a_helper() {
        let (result, root) = run(">> /echo deep").await;
        assert_eq!(result.unwrap(), "deep");

        let steps = root.snapshot().steps;
        assert!(matches!(&steps[0], Step::Log(l) if l == "Delegating: /echo deep"));
        let helper = &root.children()[0];
        assert_eq!(helper.name(), "helper");
        assert_eq!(helper.children()[0].name(), "echo");
    }

    #[tokio::test]
    async fn unknown_tool_does_not_fail_the_agent() {
        let (result, root) = run("/nope\nstill here").await;
        assert_eq!(result.unwrap(), "still here");
        assert!(root.children()[0].output_ended());
    }

    #[tokio::test]
    async fn fail_command_fails_the_root() {
        let (result, root) = run("partial\n/fail out of ideas").await;
        let err = result.unwrap_err();
        assert!(err.to_string().contains("out of ideas"));
        assert!(!root.output_ended());
    }

    #[tokio::test]
    async fn think_records_reasoning() {
        let (_, root) = run("/think let me see\ndone").await;
        let reasoning = root.snapshot().reasoning.unwrap();
        assert_eq!(reasoning.text, "let me see");
        assert!(reasoning.duration.is_some());
    }

    #[tokio::test]
    async fn help_lists_tools() {
        let (result, _) = run("/help").await;
        let out = result.unwrap();
        assert!(out.starts_with("Available commands:"));
        assert!(out.contains("/echo — "));
    }
}
