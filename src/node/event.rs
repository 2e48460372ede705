//! Execution events: append-only facts about agent and tool calls.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::agent::truncate_for_preview;

/// Maximum characters of tool input/output carried on an event.
pub const MAX_EVENT_PAYLOAD_CHARS: usize = 500;

/// Something that happened while a job was executing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ExecutionEvent {
    AgentStarted {
        job_id: Uuid,
        timestamp: DateTime<Utc>,
        agent: String,
    },
    AgentCompleted {
        job_id: Uuid,
        timestamp: DateTime<Utc>,
        agent: String,
        duration_ms: u64,
        success: bool,
    },
    ToolCalled {
        job_id: Uuid,
        timestamp: DateTime<Utc>,
        tool: String,
        input: String,
    },
    ToolCompleted {
        job_id: Uuid,
        timestamp: DateTime<Utc>,
        tool: String,
        duration_ms: u64,
        success: bool,
        output: String,
    },
    Error {
        job_id: Uuid,
        timestamp: DateTime<Utc>,
        source: String,
        message: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        stack: Option<String>,
    },
}

impl ExecutionEvent {
    pub fn agent_started(job_id: Uuid, agent: &str) -> Self {
        Self::AgentStarted {
            job_id,
            timestamp: Utc::now(),
            agent: agent.to_string(),
        }
    }

    pub fn agent_completed(job_id: Uuid, agent: &str, duration: Duration, success: bool) -> Self {
        Self::AgentCompleted {
            job_id,
            timestamp: Utc::now(),
            agent: agent.to_string(),
            duration_ms: duration.as_millis() as u64,
            success,
        }
    }

    pub fn tool_called(job_id: Uuid, tool: &str, input: &str) -> Self {
        Self::ToolCalled {
            job_id,
            timestamp: Utc::now(),
            tool: tool.to_string(),
            input: truncate_for_preview(input, MAX_EVENT_PAYLOAD_CHARS),
        }
    }

    pub fn tool_completed(
        job_id: Uuid,
        tool: &str,
        duration: Duration,
        success: bool,
        output: &str,
    ) -> Self {
        Self::ToolCompleted {
            job_id,
            timestamp: Utc::now(),
            tool: tool.to_string(),
            duration_ms: duration.as_millis() as u64,
            success,
            output: truncate_for_preview(output, MAX_EVENT_PAYLOAD_CHARS),
        }
    }

    /// Build an error event from any error, keeping the source chain as the
    /// stack.
    pub fn error(job_id: Uuid, source: &str, err: &(dyn std::error::Error + 'static)) -> Self {
        let mut chain = Vec::new();
        let mut cause = err.source();
        while let Some(inner) = cause {
            chain.push(inner.to_string());
            cause = inner.source();
        }
        Self::Error {
            job_id,
            timestamp: Utc::now(),
            source: source.to_string(),
            message: err.to_string(),
            stack: (!chain.is_empty()).then(|| chain.join("\n")),
        }
    }

    pub fn job_id(&self) -> Uuid {
        match self {
            Self::AgentStarted { job_id, .. }
            | Self::AgentCompleted { job_id, .. }
            | Self::ToolCalled { job_id, .. }
            | Self::ToolCompleted { job_id, .. }
            | Self::Error { job_id, .. } => *job_id,
        }
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        match self {
            Self::AgentStarted { timestamp, .. }
            | Self::AgentCompleted { timestamp, .. }
            | Self::ToolCalled { timestamp, .. }
            | Self::ToolCompleted { timestamp, .. }
            | Self::Error { timestamp, .. } => *timestamp,
        }
    }

    /// The visible log step this event contributes to a node, if any.
    pub fn log_line(&self) -> Option<String> {
        match self {
            Self::Error {
                source, message, ..
            } => Some(format!("⚠ {source}: {}", first_line(message))),
            Self::ToolCompleted {
                tool,
                duration_ms,
                success: false,
                ..
            } => Some(format!("✗ {tool} failed after {}", format_millis(*duration_ms))),
            Self::AgentStarted { .. }
            | Self::AgentCompleted { .. }
            | Self::ToolCalled { .. }
            | Self::ToolCompleted { .. } => None,
        }
    }
}

fn first_line(text: &str) -> &str {
    text.lines().next().unwrap_or("").trim()
}

fn format_millis(ms: u64) -> String {
    if ms < 1000 {
        format!("{ms}ms")
    } else {
        format!("{:.1}s", ms as f64 / 1000.0)
    }
}
