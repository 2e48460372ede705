//! Call nodes: the live state of one executing agent or tool call.
//!
//! A node accumulates what has been observed so far (output text, log lines,
//! nested calls, reasoning) and publishes every change on its topics. Each
//! emission mutates state and notifies subscribers before returning, and
//! emissions on one node are serialized, so subscribers see events in
//! emission order.

pub mod event;

use std::sync::{Arc, Mutex, OnceLock, Weak};
use std::time::{Duration, Instant};

use tracing::{debug, warn};
use uuid::Uuid;

use crate::bus::{Topic, lock};
pub use event::ExecutionEvent;

/// Which kind of unit a node represents. Fixed at construction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeKind {
    Agent,
    Tool,
}

/// One entry in a node's step list, in emission order.
#[derive(Clone)]
pub enum Step {
    Log(String),
    Call(Arc<CallNode>),
}

/// Reasoning block state of an agent node.
#[derive(Debug, Clone, PartialEq)]
pub struct Reasoning {
    pub text: String,
    /// Set once the reasoning stream has ended.
    pub duration: Option<Duration>,
}

/// Serializes parent assignment across all nodes so two concurrent
/// announcements cannot close a loop between them.
static LINK: Mutex<()> = Mutex::new(());

/// Back-reference from a child to the node that announced it.
struct ParentLink {
    id: Uuid,
    node: Weak<CallNode>,
}

/// Topics every node exposes.
pub struct NodeStreams {
    pub log: Topic<String>,
    pub output_delta: Topic<String>,
    pub output_end: Topic<()>,
}

/// Topics only agent nodes expose.
pub struct AgentStreams {
    pub reasoning_start: Topic<()>,
    pub reasoning_delta: Topic<String>,
    pub reasoning_end: Topic<Duration>,
    pub nested_call: Topic<Arc<CallNode>>,
}

enum NodeBody {
    Agent(AgentStreams),
    Tool,
}

#[derive(Default)]
struct NodeState {
    output: String,
    output_ended: bool,
    steps: Vec<Step>,
    reasoning: Option<Reasoning>,
    reasoning_started_at: Option<Instant>,
}

/// Point-in-time copy of a node's observable state.
#[derive(Clone)]
pub struct NodeSnapshot {
    pub output: String,
    pub output_ended: bool,
    pub steps: Vec<Step>,
    pub reasoning: Option<Reasoning>,
}

/// The live state of one executing unit.
pub struct CallNode {
    id: Uuid,
    name: String,
    input: String,
    /// This node, for handing out parent links.
    this: Weak<CallNode>,
    parent: OnceLock<ParentLink>,
    body: NodeBody,
    streams: NodeStreams,
    state: Mutex<NodeState>,
    /// Serializes mutate-then-publish so subscribers see emission order.
    emit: Mutex<()>,
    summary: tokio::sync::OnceCell<String>,
}

impl CallNode {
    /// Create an agent node.
    pub fn agent(name: impl Into<String>, input: impl Into<String>) -> Arc<Self> {
        Self::build(
            name.into(),
            input.into(),
            NodeBody::Agent(AgentStreams {
                reasoning_start: Topic::new(),
                reasoning_delta: Topic::new(),
                reasoning_end: Topic::new(),
                nested_call: Topic::new(),
            }),
        )
    }

    /// Create a tool node.
    pub fn tool(name: impl Into<String>, input: impl Into<String>) -> Arc<Self> {
        Self::build(name.into(), input.into(), NodeBody::Tool)
    }

    fn build(name: String, input: String, body: NodeBody) -> Arc<Self> {
        Arc::new_cyclic(|this| Self {
            id: Uuid::new_v4(),
            name,
            input,
            this: this.clone(),
            parent: OnceLock::new(),
            body,
            streams: NodeStreams {
                log: Topic::new(),
                output_delta: Topic::new(),
                output_end: Topic::new(),
            },
            state: Mutex::new(NodeState::default()),
            emit: Mutex::new(()),
            summary: tokio::sync::OnceCell::new(),
        })
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn input(&self) -> &str {
        &self.input
    }

    pub fn kind(&self) -> NodeKind {
        match self.body {
            NodeBody::Agent(_) => NodeKind::Agent,
            NodeBody::Tool => NodeKind::Tool,
        }
    }

    /// Id of the node that announced this one, if any.
    pub fn parent_id(&self) -> Option<Uuid> {
        self.parent.get().map(|link| link.id)
    }

    /// Whether `id` is this node or one of the nodes above it.
    fn is_self_or_ancestor(&self, id: Uuid) -> bool {
        if self.id == id {
            return true;
        }
        let mut next = self.parent.get().and_then(|link| link.node.upgrade());
        while let Some(node) = next {
            if node.id == id {
                return true;
            }
            next = node.parent.get().and_then(|link| link.node.upgrade());
        }
        false
    }

    pub fn streams(&self) -> &NodeStreams {
        &self.streams
    }

    /// Agent-only topics; `None` for tool nodes.
    pub fn agent_streams(&self) -> Option<&AgentStreams> {
        match &self.body {
            NodeBody::Agent(streams) => Some(streams),
            NodeBody::Tool => None,
        }
    }

    pub fn snapshot(&self) -> NodeSnapshot {
        let state = lock(&self.state);
        NodeSnapshot {
            output: state.output.clone(),
            output_ended: state.output_ended,
            steps: state.steps.clone(),
            reasoning: state.reasoning.clone(),
        }
    }

    pub fn output(&self) -> String {
        lock(&self.state).output.clone()
    }

    pub fn output_ended(&self) -> bool {
        lock(&self.state).output_ended
    }

    /// Nested calls announced so far, in emission order.
    pub fn children(&self) -> Vec<Arc<CallNode>> {
        lock(&self.state)
            .steps
            .iter()
            .filter_map(|step| match step {
                Step::Call(child) => Some(Arc::clone(child)),
                Step::Log(_) => None,
            })
            .collect()
    }

    /// Total live subscriptions across this node's topics.
    pub fn subscriber_count(&self) -> usize {
        let common = self.streams.log.subscriber_count()
            + self.streams.output_delta.subscriber_count()
            + self.streams.output_end.subscriber_count();
        match &self.body {
            NodeBody::Agent(agent) => {
                common
                    + agent.reasoning_start.subscriber_count()
                    + agent.reasoning_delta.subscriber_count()
                    + agent.reasoning_end.subscriber_count()
                    + agent.nested_call.subscriber_count()
            }
            NodeBody::Tool => common,
        }
    }

    // ── Emission ────────────────────────────────────────────────────

    /// Append a log line as a visible step.
    pub fn log(&self, line: impl Into<String>) {
        let line = line.into();
        let _emit = lock(&self.emit);
        lock(&self.state).steps.push(Step::Log(line.clone()));
        self.streams.log.publish(&line);
    }

    /// Append output text. Ignored once the output has ended.
    pub fn output_delta(&self, delta: impl Into<String>) {
        let delta = delta.into();
        let _emit = lock(&self.emit);
        {
            let mut state = lock(&self.state);
            if state.output_ended {
                debug!(node = %self.name, "Dropping output delta after end");
                return;
            }
            state.output.push_str(&delta);
        }
        self.streams.output_delta.publish(&delta);
    }

    /// Mark the output stream as ended. Idempotent.
    pub fn end_output(&self) {
        let _emit = lock(&self.emit);
        {
            let mut state = lock(&self.state);
            if state.output_ended {
                return;
            }
            state.output_ended = true;
        }
        self.streams.output_end.publish(&());
    }

    /// Open the reasoning block. Returns `false` on tool nodes or if
    /// reasoning already started.
    pub fn reasoning_start(&self) -> bool {
        let Some(agent) = self.agent_streams() else {
            debug!(node = %self.name, "Tool nodes have no reasoning stream");
            return false;
        };
        let _emit = lock(&self.emit);
        {
            let mut state = lock(&self.state);
            if state.reasoning.is_some() {
                return false;
            }
            state.reasoning = Some(Reasoning {
                text: String::new(),
                duration: None,
            });
            state.reasoning_started_at = Some(Instant::now());
        }
        agent.reasoning_start.publish(&());
        true
    }

    /// Append reasoning text, opening the block if needed.
    pub fn reasoning_delta(&self, delta: impl Into<String>) {
        let Some(agent) = self.agent_streams() else {
            debug!(node = %self.name, "Tool nodes have no reasoning stream");
            return;
        };
        self.reasoning_start();
        let delta = delta.into();
        let _emit = lock(&self.emit);
        {
            let mut state = lock(&self.state);
            match state.reasoning.as_mut() {
                Some(reasoning) if reasoning.duration.is_none() => reasoning.text.push_str(&delta),
                _ => {
                    debug!(node = %self.name, "Dropping reasoning delta after end");
                    return;
                }
            }
        }
        agent.reasoning_delta.publish(&delta);
    }

    /// Close the reasoning block, recording how long it lasted.
    pub fn reasoning_end(&self) {
        let Some(agent) = self.agent_streams() else {
            return;
        };
        let _emit = lock(&self.emit);
        let duration = {
            let mut state = lock(&self.state);
            let elapsed = state
                .reasoning_started_at
                .map(|at| at.elapsed())
                .unwrap_or_default();
            match state.reasoning.as_mut() {
                Some(reasoning) if reasoning.duration.is_none() => {
                    reasoning.duration = Some(elapsed);
                    elapsed
                }
                _ => return,
            }
        };
        agent.reasoning_end.publish(&duration);
    }

    /// Announce a nested call. The child must be new: a node has at most
    /// one parent, and neither this node nor any of its ancestors can
    /// become its child.
    pub fn announce_call(&self, child: Arc<CallNode>) -> bool {
        let Some(agent) = self.agent_streams() else {
            warn!(node = %self.name, child = %child.name, "Tool nodes cannot announce nested calls");
            return false;
        };
        {
            let _link = lock(&LINK);
            if self.is_self_or_ancestor(child.id) {
                warn!(node = %self.name, child = %child.name, "Rejected nested call: would form a cycle");
                return false;
            }
            let link = ParentLink {
                id: self.id,
                node: self.this.clone(),
            };
            if child.parent.set(link).is_err() {
                warn!(node = %self.name, child = %child.name, "Rejected nested call: already has a parent");
                return false;
            }
        }
        let _emit = lock(&self.emit);
        lock(&self.state).steps.push(Step::Call(Arc::clone(&child)));
        agent.nested_call.publish(&child);
        true
    }

    /// Fold an execution event into the node. Only events with a visible
    /// effect change state; the event itself is not kept.
    pub fn apply(&self, event: &ExecutionEvent) {
        debug!(node = %self.name, event = ?event, "Applying execution event");
        if let Some(line) = event.log_line() {
            self.log(line);
        }
    }

    // ── Summary ─────────────────────────────────────────────────────

    /// The node's summary, if one has been produced.
    pub fn summary(&self) -> Option<&str> {
        self.summary.get().map(String::as_str)
    }

    /// Produce the summary once; concurrent callers share the same result.
    pub async fn summary_or_init<F, Fut>(&self, init: F) -> &str
    where
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = String>,
    {
        self.summary.get_or_init(init).await
    }
}

impl std::fmt::Debug for CallNode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CallNode")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("kind", &self.kind())
            .finish()
    }
}

impl std::fmt::Debug for Step {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Step::Log(line) => f.debug_tuple("Log").field(line).finish(),
            Step::Call(node) => f.debug_tuple("Call").field(&node.name).finish(),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    #[test]
    fn kind_is_fixed_by_constructor() {
        assert_eq!(CallNode::agent("a", "").kind(), NodeKind::Agent);
        assert_eq!(CallNode::tool("t", "").kind(), NodeKind::Tool);
        assert!(CallNode::tool("t", "").agent_streams().is_none());
    }

    #[test]
    fn output_accumulates_until_end() {
        let node = CallNode::tool("Lookup", "{}");
        node.output_delta("4");
        node.output_delta("2");
        node.end_output();
        node.output_delta("!");
        assert_eq!(node.output(), "42");
        assert!(node.output_ended());
    }

    #[test]
    fn subscribers_notified_before_emit_returns() {
        let node = CallNode::agent("root", "");
        let seen = Arc::new(Mutex::new(String::new()));
        let _sub = {
            let seen = Arc::clone(&seen);
            node.streams()
                .output_delta
                .subscribe(move |d: &String| seen.lock().unwrap().push_str(d))
        };
        node.output_delta("hello");
        assert_eq!(*seen.lock().unwrap(), "hello");
    }

    #[test]
    fn end_output_publishes_once() {
        let node = CallNode::agent("root", "");
        let ends = Arc::new(AtomicUsize::new(0));
        let _sub = {
            let ends = Arc::clone(&ends);
            node.streams().output_end.subscribe(move |_| {
                ends.fetch_add(1, Ordering::SeqCst);
            })
        };
        node.end_output();
        node.end_output();
        assert_eq!(ends.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn child_has_exactly_one_parent() {
        let a = CallNode::agent("a", "");
        let b = CallNode::agent("b", "");
        let child = CallNode::tool("t", "");

        assert!(a.announce_call(Arc::clone(&child)));
        assert!(!b.announce_call(Arc::clone(&child)));
        assert_eq!(child.parent_id(), Some(a.id()));
        assert_eq!(a.children().len(), 1);
        assert!(b.children().is_empty());
    }

    #[test]
    fn node_cannot_parent_itself() {
        let a = CallNode::agent("a", "");
        assert!(!a.announce_call(Arc::clone(&a)));
    }

    #[test]
    fn ancestors_cannot_become_children() {
        let root = CallNode::agent("root", "");
        let mid = CallNode::agent("mid", "");
        let leaf = CallNode::agent("leaf", "");
        assert!(root.announce_call(Arc::clone(&mid)));
        assert!(mid.announce_call(Arc::clone(&leaf)));

        assert!(!mid.announce_call(Arc::clone(&root)));
        assert!(!leaf.announce_call(Arc::clone(&root)));
        assert!(!leaf.announce_call(Arc::clone(&mid)));
        assert_eq!(root.parent_id(), None);
        assert!(leaf.children().is_empty());
    }

    #[test]
    fn tool_nodes_reject_agent_operations() {
        let tool = CallNode::tool("t", "");
        assert!(!tool.reasoning_start());
        assert!(!tool.announce_call(CallNode::tool("u", "")));
        assert!(tool.snapshot().reasoning.is_none());
    }

    #[test]
    fn reasoning_records_duration() {
        let node = CallNode::agent("a", "");
        node.reasoning_delta("hmm");
        node.reasoning_end();
        node.reasoning_delta("late");
        let reasoning = node.snapshot().reasoning.unwrap();
        assert_eq!(reasoning.text, "hmm");
        assert!(reasoning.duration.is_some());
    }

    #[test]
    fn steps_keep_emission_order() {
        let node = CallNode::agent("a", "");
        node.log("one");
        node.announce_call(CallNode::tool("t", ""));
        node.log("two");
        let steps = node.snapshot().steps;
        assert!(matches!(&steps[0], Step::Log(l) if l == "one"));
        assert!(matches!(&steps[1], Step::Call(c) if c.name() == "t"));
        assert!(matches!(&steps[2], Step::Log(l) if l == "two"));
    }

    #[test]
    fn error_event_applies_as_log_step() {
        let node = CallNode::tool("Lookup", "{}");
        let err = std::io::Error::other("boom");
        node.apply(&ExecutionEvent::error(Uuid::nil(), "Lookup", &err));
        node.apply(&ExecutionEvent::agent_started(Uuid::nil(), "x"));
        let steps = node.snapshot().steps;
        assert_eq!(steps.len(), 1);
        assert!(matches!(&steps[0], Step::Log(l) if l == "⚠ Lookup: boom"));
    }

    #[tokio::test]
    async fn summary_is_computed_once() {
        let node = CallNode::tool("t", "");
        let calls = Arc::new(AtomicUsize::new(0));
        for _ in 0..3 {
            let calls = Arc::clone(&calls);
            let summary = node
                .summary_or_init(|| async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    "done".to_string()
                })
                .await;
            assert_eq!(summary, "done");
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(node.summary(), Some("done"));
    }
}
