//! Agent runtime: runs agents against call nodes.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};
use uuid::Uuid;

use super::Agent;
use crate::error::{AgentError, ToolError};
use crate::node::{CallNode, ExecutionEvent};
use crate::tools::{DEFAULT_TOOL_TIMEOUT, ToolRegistry};

/// Runtime limits.
#[derive(Debug, Clone, Copy)]
pub struct RuntimeConfig {
    /// Upper bound for a single tool call; a tool's own timeout may be
    /// shorter.
    pub tool_timeout: Duration,
    /// Deepest allowed delegation chain below the root agent.
    pub max_depth: usize,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            tool_timeout: DEFAULT_TOOL_TIMEOUT,
            max_depth: 4,
        }
    }
}

/// Shared state for every agent run.
pub struct Runtime {
    tools: Arc<ToolRegistry>,
    config: RuntimeConfig,
}

impl Runtime {
    pub fn new(tools: Arc<ToolRegistry>, config: RuntimeConfig) -> Arc<Self> {
        Arc::new(Self { tools, config })
    }

    pub fn tools(&self) -> &ToolRegistry {
        &self.tools
    }

    pub fn config(&self) -> RuntimeConfig {
        self.config
    }

    /// Run the root agent of a job on `root`.
    ///
    /// On success the root's output is ended and returned. On failure the
    /// output is left open and the error is returned to the caller, which
    /// owns the job-level failure.
    pub async fn run_root(
        self: &Arc<Self>,
        job_id: Uuid,
        agent: Arc<dyn Agent>,
        root: Arc<CallNode>,
        input: String,
    ) -> Result<String, AgentError> {
        let ctx = AgentContext {
            job_id,
            node: Arc::clone(&root),
            runtime: Arc::clone(self),
            depth: 0,
        };
        info!(%job_id, agent = %agent.name(), "Running root agent");
        drive(&ctx, agent.as_ref(), input).await?;
        root.end_output();
        Ok(root.output())
    }
}

/// Run `agent` on the context's node, bracketing it with lifecycle events.
async fn drive(ctx: &AgentContext, agent: &dyn Agent, input: String) -> Result<(), AgentError> {
    let start = Instant::now();
    ctx.record(&ExecutionEvent::agent_started(ctx.job_id, agent.name()));
    let result = agent.run(ctx.clone(), input).await;
    ctx.record(&ExecutionEvent::agent_completed(
        ctx.job_id,
        agent.name(),
        start.elapsed(),
        result.is_ok(),
    ));
    result
}

/// Handle through which a running agent reports progress and spawns
/// nested calls. Cheap to clone.
#[derive(Clone)]
pub struct AgentContext {
    job_id: Uuid,
    node: Arc<CallNode>,
    runtime: Arc<Runtime>,
    depth: usize,
}

impl AgentContext {
    pub fn job_id(&self) -> Uuid {
        self.job_id
    }

    /// The node this agent writes to.
    pub fn node(&self) -> &Arc<CallNode> {
        &self.node
    }

    pub fn depth(&self) -> usize {
        self.depth
    }

    pub fn tools(&self) -> &ToolRegistry {
        self.runtime.tools()
    }

    pub fn log(&self, line: impl Into<String>) {
        self.node.log(line);
    }

    /// Open the reasoning block explicitly. `think` opens it on demand.
    pub fn think_start(&self) -> bool {
        self.node.reasoning_start()
    }

    pub fn think(&self, delta: impl Into<String>) {
        self.node.reasoning_delta(delta);
    }

    pub fn think_end(&self) {
        self.node.reasoning_end();
    }

    pub fn output(&self, delta: impl Into<String>) {
        self.node.output_delta(delta);
    }

    /// Fold an execution event into this agent's node.
    pub fn record(&self, event: &ExecutionEvent) {
        self.node.apply(event);
    }

    /// Call a tool as a nested node.
    ///
    /// Failures are recorded on the tool's node and returned; they do not
    /// fail the calling agent unless it propagates them.
    pub async fn call_tool(&self, name: &str, params: serde_json::Value) -> Result<String, ToolError> {
        let input = params.to_string();
        let child = CallNode::tool(name, input.clone());
        self.node.announce_call(Arc::clone(&child));
        child.apply(&ExecutionEvent::tool_called(self.job_id, name, &input));

        let start = Instant::now();
        let result = match self.runtime.tools.get(name).await {
            None => Err(ToolError::NotFound {
                name: name.to_string(),
            }),
            Some(tool) => {
                let timeout = tool.execution_timeout().min(self.runtime.config.tool_timeout);
                match tokio::time::timeout(timeout, tool.execute(params)).await {
                    Ok(result) => result,
                    Err(_) => Err(ToolError::Timeout {
                        name: name.to_string(),
                        timeout,
                    }),
                }
            }
        };
        let elapsed = start.elapsed();

        match &result {
            Ok(output) => {
                child.output_delta(output.result.as_str());
                child.apply(&ExecutionEvent::tool_completed(
                    self.job_id,
                    name,
                    elapsed,
                    true,
                    &output.result,
                ));
            }
            Err(e) => {
                warn!(job_id = %self.job_id, tool = %name, error = %e, "Tool call failed");
                child.apply(&ExecutionEvent::error(self.job_id, name, e));
                child.apply(&ExecutionEvent::tool_completed(self.job_id, name, elapsed, false, ""));
            }
        }
        child.end_output();
        result.map(|output| output.result)
    }

    /// Run another agent as a nested node and return its output.
    ///
    /// The nested node's output always ends, so the tree can resolve even
    /// when the delegate fails; the failure is recorded on the nested node.
    pub async fn delegate(&self, agent: Arc<dyn Agent>, input: &str) -> Result<String, AgentError> {
        let depth = self.depth + 1;
        let max = self.runtime.config.max_depth;
        if depth > max {
            let err = AgentError::DepthExceeded { depth, max };
            self.record(&ExecutionEvent::error(self.job_id, agent.name(), &err));
            return Err(err);
        }

        let child = CallNode::agent(agent.name(), input);
        self.node.announce_call(Arc::clone(&child));
        let ctx = AgentContext {
            job_id: self.job_id,
            node: Arc::clone(&child),
            runtime: Arc::clone(&self.runtime),
            depth,
        };
        debug!(job_id = %self.job_id, agent = %agent.name(), depth, "Delegating");

        let result = drive(&ctx, agent.as_ref(), input.to_string()).await;
        if let Err(e) = &result {
            child.apply(&ExecutionEvent::error(self.job_id, agent.name(), e));
        }
        child.end_output();
        result.map(|()| child.output())
    }
}
