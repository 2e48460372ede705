//! Tree reconciler: mounts views over call nodes and gates resolution.
//!
//! Views live in an arena addressed by [`ViewId`]. Mounting a node
//! subscribes to its streams; the subscriptions are owned by the view and
//! released when the session is dropped. A non-root node asks for its
//! summary once its output has ended and every known child has resolved;
//! the check reruns both on output end and whenever a child resolves.
//! The root skips the summary and hands its raw output to the finish
//! signal.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, Weak};

use tracing::{debug, warn};
use uuid::Uuid;

use super::serialize::{NodeFrame, StepFrame, TreeSnapshot, serialize};
use super::{FinishHandle, FrameSink, RenderRequest};
use crate::bus::{Subscription, lock};
use crate::llm::Summarizer;
use crate::node::{CallNode, Step};

/// Summary used when a node produced neither a summary nor output.
const EMPTY_SUMMARY: &str = "(no output)";

/// Stable index of a view within one session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ViewId(usize);

struct View {
    node: Arc<CallNode>,
    parent: Option<ViewId>,
    depth: usize,
    children: Vec<ViewId>,
    summarizing: bool,
    summary: Option<String>,
    resolved: bool,
    _subscriptions: Vec<Subscription>,
}

#[derive(Default)]
struct TreeState {
    views: Vec<View>,
    index: HashMap<Uuid, ViewId>,
    closed: bool,
}

/// Context threaded down to every view of a session.
struct RenderContext {
    job_id: Uuid,
    summarizer: Arc<dyn Summarizer>,
    finish: FinishHandle,
    runtime: tokio::runtime::Handle,
}

/// Follow-up work collected under the state lock and run after it is
/// released.
enum Action {
    Summarize(ViewId, Arc<CallNode>),
    Finish(String),
}

struct SessionInner {
    ctx: RenderContext,
    sink: FrameSink,
    state: Mutex<TreeState>,
    /// Held across snapshot + push so frames reach the sink in order.
    render_lock: Mutex<()>,
}

/// One live rendering session over a tree of call nodes.
pub struct Session {
    inner: Arc<SessionInner>,
}

impl Session {
    /// Mount the request's root and push the first frame.
    ///
    /// Must be called from within a tokio runtime; summaries are requested
    /// on background tasks.
    pub fn start(request: &RenderRequest, finish: FinishHandle, sink: FrameSink) -> Self {
        let inner = Arc::new(SessionInner {
            ctx: RenderContext {
                job_id: request.job_id,
                summarizer: Arc::clone(&request.summarizer),
                finish,
                runtime: tokio::runtime::Handle::current(),
            },
            sink,
            state: Mutex::new(TreeState::default()),
            render_lock: Mutex::new(()),
        });

        let actions = {
            let mut state = lock(&inner.state);
            let root = inner.mount(&mut state, Arc::clone(&request.root), None);
            let mut actions = Vec::new();
            inner.reconcile_subtree(&mut state, root, &mut actions);
            actions
        };
        debug!(job_id = %request.job_id, root = %request.root.name(), "Render session started");
        inner.rerender();
        inner.run(actions);

        Self { inner }
    }

    /// Whether the node with `node_id` has resolved in this session.
    pub fn is_resolved(&self, node_id: Uuid) -> bool {
        let state = lock(&self.inner.state);
        state
            .index
            .get(&node_id)
            .is_some_and(|id| state.views[id.0].resolved)
    }

    /// Parent of a mounted node, as seen by this session.
    pub fn parent_of(&self, node_id: Uuid) -> Option<Uuid> {
        let state = lock(&self.inner.state);
        let view = &state.views[state.index.get(&node_id)?.0];
        view.parent.map(|p| state.views[p.0].node.id())
    }

    /// Number of mounted views.
    pub fn len(&self) -> usize {
        lock(&self.inner.state).views.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

}

impl Drop for Session {
    fn drop(&mut self) {
        let views = {
            let mut state = lock(&self.inner.state);
            state.closed = true;
            state.index.clear();
            std::mem::take(&mut state.views)
        };
        // Subscriptions are released here, outside the state lock.
        drop(views);
        debug!(job_id = %self.inner.ctx.job_id, "Render session torn down");
    }
}

impl SessionInner {
    /// Mount `node` (and any children it already announced) under `parent`.
    /// Mounting an already-mounted node returns its existing view.
    fn mount(
        self: &Arc<Self>,
        state: &mut TreeState,
        node: Arc<CallNode>,
        parent: Option<ViewId>,
    ) -> ViewId {
        if let Some(&existing) = state.index.get(&node.id()) {
            return existing;
        }

        let id = ViewId(state.views.len());
        let depth = parent.map_or(0, |p| state.views[p.0].depth + 1);
        let subscriptions = self.subscribe(&node, id);
        state.views.push(View {
            node: Arc::clone(&node),
            parent,
            depth,
            children: Vec::new(),
            summarizing: false,
            summary: None,
            resolved: false,
            _subscriptions: subscriptions,
        });
        state.index.insert(node.id(), id);
        if let Some(parent) = parent {
            state.views[parent.0].children.push(id);
        }
        debug!(node = %node.name(), depth, "Mounted view");

        for child in node.children() {
            self.mount(state, child, Some(id));
        }
        id
    }

    fn subscribe(self: &Arc<Self>, node: &Arc<CallNode>, id: ViewId) -> Vec<Subscription> {
        let streams = node.streams();
        let mut subs = vec![
            streams.log.subscribe(self.on_change()),
            streams.output_delta.subscribe(self.on_change()),
            streams.output_end.subscribe({
                let weak = Arc::downgrade(self);
                move |_: &()| {
                    if let Some(inner) = weak.upgrade() {
                        inner.on_output_end(id);
                    }
                }
            }),
        ];

        if let Some(agent) = node.agent_streams() {
            subs.push(agent.reasoning_start.subscribe(self.on_change()));
            subs.push(agent.reasoning_delta.subscribe(self.on_change()));
            subs.push(agent.reasoning_end.subscribe(self.on_change()));
            subs.push(agent.nested_call.subscribe({
                let weak = Arc::downgrade(self);
                move |child: &Arc<CallNode>| {
                    if let Some(inner) = weak.upgrade() {
                        inner.on_nested_call(id, Arc::clone(child));
                    }
                }
            }));
        }
        subs
    }

    /// Callback that only re-renders.
    fn on_change<T: 'static>(self: &Arc<Self>) -> impl Fn(&T) + Send + Sync + 'static {
        let weak: Weak<Self> = Arc::downgrade(self);
        move |_: &T| {
            if let Some(inner) = weak.upgrade() {
                inner.rerender();
            }
        }
    }

    fn on_output_end(self: &Arc<Self>, id: ViewId) {
        let actions = {
            let mut state = lock(&self.state);
            if state.closed {
                return;
            }
            let mut actions = Vec::new();
            self.reconcile(&mut state, id, &mut actions);
            actions
        };
        self.rerender();
        self.run(actions);
    }

    fn on_nested_call(self: &Arc<Self>, parent: ViewId, child: Arc<CallNode>) {
        let actions = {
            let mut state = lock(&self.state);
            if state.closed {
                return;
            }
            let child_id = self.mount(&mut state, child, Some(parent));
            let mut actions = Vec::new();
            // The child may already be complete if it ran before being
            // announced.
            self.reconcile_subtree(&mut state, child_id, &mut actions);
            actions
        };
        self.rerender();
        self.run(actions);
    }

    fn on_summary(self: &Arc<Self>, id: ViewId, summary: String) {
        let actions = {
            let mut state = lock(&self.state);
            if state.closed {
                return;
            }
            let view = &mut state.views[id.0];
            view.summary = Some(summary);
            view.resolved = true;
            debug!(node = %view.node.name(), "View resolved");

            let mut actions = Vec::new();
            if let Some(parent) = state.views[id.0].parent {
                self.reconcile(&mut state, parent, &mut actions);
            }
            actions
        };
        self.rerender();
        self.run(actions);
    }

    /// Check descendants first, then `id` itself.
    fn reconcile_subtree(&self, state: &mut TreeState, id: ViewId, actions: &mut Vec<Action>) {
        let children = state.views[id.0].children.clone();
        for child in children {
            self.reconcile_subtree(state, child, actions);
        }
        self.reconcile(state, id, actions);
    }

    /// Run the resolution gate for one view.
    fn reconcile(&self, state: &mut TreeState, id: ViewId, actions: &mut Vec<Action>) {
        let view = &state.views[id.0];
        if view.resolved || view.summarizing || !view.node.output_ended() {
            return;
        }
        if !view.children.iter().all(|c| state.views[c.0].resolved) {
            return;
        }

        let node = Arc::clone(&view.node);
        let is_root = view.parent.is_none();
        let view = &mut state.views[id.0];
        if is_root {
            view.resolved = true;
            debug!(job_id = %self.ctx.job_id, "Root resolved");
            actions.push(Action::Finish(node.output()));
        } else {
            view.summarizing = true;
            actions.push(Action::Summarize(id, node));
        }
    }

    fn run(self: &Arc<Self>, actions: Vec<Action>) {
        for action in actions {
            match action {
                Action::Summarize(id, node) => {
                    let weak = Arc::downgrade(self);
                    let summarizer = Arc::clone(&self.ctx.summarizer);
                    self.ctx.runtime.spawn(async move {
                        let summary = node
                            .summary_or_init(|| summarize_node(summarizer, Arc::clone(&node)))
                            .await
                            .to_string();
                        if let Some(inner) = weak.upgrade() {
                            inner.on_summary(id, summary);
                        }
                    });
                }
                Action::Finish(output) => {
                    self.ctx.finish.finish(output);
                }
            }
        }
    }

    /// Serialize the current tree and push it to the sink.
    fn rerender(&self) {
        let _render = lock(&self.render_lock);
        let lines = {
            let state = lock(&self.state);
            if state.closed || state.views.is_empty() {
                return;
            }
            serialize(&state.snapshot())
        };
        (self.sink)(lines);
    }
}

impl TreeState {
    fn snapshot(&self) -> TreeSnapshot {
        TreeSnapshot {
            root: self.frame(ViewId(0)),
        }
    }

    fn frame(&self, id: ViewId) -> NodeFrame {
        let view = &self.views[id.0];
        let snap = view.node.snapshot();
        let steps = snap
            .steps
            .into_iter()
            .filter_map(|step| match step {
                Step::Log(line) => Some(StepFrame::Log(line)),
                // Only descend along this session's view edges, so a node
                // reachable twice is drawn once.
                Step::Call(child) => self
                    .index
                    .get(&child.id())
                    .filter(|child_id| self.views[child_id.0].parent == Some(id))
                    .map(|&child_id| StepFrame::Call(self.frame(child_id))),
            })
            .collect();

        NodeFrame {
            name: view.node.name().to_string(),
            kind: view.node.kind(),
            reasoning: snap.reasoning,
            steps,
            output: snap.output,
            summary: if view.parent.is_some() && view.resolved {
                view.summary.clone()
            } else {
                None
            },
        }
    }
}

/// Ask the collaborator for a summary, falling back to the raw output.
async fn summarize_node(summarizer: Arc<dyn Summarizer>, node: Arc<CallNode>) -> String {
    let output = node.output();
    match summarizer
        .summarize(node.name(), node.input(), &output)
        .await
    {
        Ok(summary) if !summary.trim().is_empty() => summary.trim().to_string(),
        Ok(_) => {
            debug!(node = %node.name(), "Empty summary; using raw output");
            fallback_summary(&output)
        }
        Err(e) => {
            warn!(node = %node.name(), error = %e, "Summarization failed; using raw output");
            fallback_summary(&output)
        }
    }
}

fn fallback_summary(output: &str) -> String {
    let trimmed = output.trim();
    if trimmed.is_empty() {
        EMPTY_SUMMARY.to_string()
    } else {
        trimmed.to_string()
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use async_trait::async_trait;
    use tokio::sync::Notify;

    use super::*;
    use crate::error::LlmError;
    use crate::render::FinishSignal;

    /// Summarizer that answers from a fixed table, optionally waiting for a
    /// per-node release.
    struct TableSummarizer {
        gates: HashMap<String, Arc<Notify>>,
        fail: bool,
    }

    impl TableSummarizer {
        fn immediate() -> Arc<Self> {
            Arc::new(Self {
                gates: HashMap::new(),
                fail: false,
            })
        }
    }

    #[async_trait]
    impl Summarizer for TableSummarizer {
        async fn summarize(&self, name: &str, _input: &str, output: &str) -> Result<String, LlmError> {
            if let Some(gate) = self.gates.get(name) {
                gate.notified().await;
            }
            if self.fail {
                return Err(LlmError::RequestFailed {
                    provider: "table".into(),
                    reason: "down".into(),
                });
            }
            Ok(format!("{name} said {output}"))
        }

        async fn summarize_error(&self, error: &str) -> Result<String, LlmError> {
            Ok(error.to_string())
        }
    }

    struct Harness {
        session: Session,
        frames: Arc<Mutex<Vec<Vec<String>>>>,
        signal: Option<FinishSignal>,
    }

    fn start(root: &Arc<CallNode>, summarizer: Arc<dyn Summarizer>) -> Harness {
        let frames = Arc::new(Mutex::new(Vec::new()));
        let sink: FrameSink = {
            let frames = Arc::clone(&frames);
            Arc::new(move |lines: Vec<String>| frames.lock().unwrap().push(lines))
        };
        let signal = FinishSignal::new(Uuid::nil());
        let request = RenderRequest::new(Uuid::nil(), Arc::clone(root), summarizer);
        let session = Session::start(&request, signal.handle(), sink);
        Harness {
            session,
            frames,
            signal: Some(signal),
        }
    }

    impl Harness {
        fn last_frame(&self) -> Vec<String> {
            self.frames.lock().unwrap().last().cloned().unwrap_or_default()
        }

        async fn finished(&mut self) -> String {
            let signal = self.signal.take().unwrap();
            tokio::time::timeout(Duration::from_secs(2), signal.wait())
                .await
                .expect("session did not finish")
                .unwrap()
        }
    }

    async fn settle() {
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test]
    async fn root_without_children_finishes_with_raw_output() {
        let root = CallNode::agent("assistant", "hi");
        let mut h = start(&root, TableSummarizer::immediate());

        root.output_delta("hello there");
        root.end_output();

        assert_eq!(h.finished().await, "hello there");
        assert!(h.session.is_resolved(root.id()));
        assert_eq!(h.last_frame(), vec!["hello there"]);
    }

    #[tokio::test]
    async fn collapse_after_summary_arrives() {
        let root = CallNode::agent("assistant", "");
        let mut h = start(&root, TableSummarizer::immediate());

        let lookup = CallNode::tool("Lookup", r#"{"q":"x"}"#);
        root.announce_call(Arc::clone(&lookup));
        lookup.output_delta("42");
        assert_eq!(h.last_frame(), vec!["└ Lookup", "    └ 42"]);

        lookup.end_output();
        root.end_output();
        h.finished().await;

        assert_eq!(h.last_frame(), vec!["└ Lookup: _Lookup said 42_"]);
    }

    #[tokio::test]
    async fn parent_waits_for_every_child() {
        let mut gates = HashMap::new();
        let gate_one = Arc::new(Notify::new());
        let gate_two = Arc::new(Notify::new());
        gates.insert("one".to_string(), Arc::clone(&gate_one));
        gates.insert("two".to_string(), Arc::clone(&gate_two));
        let summarizer = Arc::new(TableSummarizer { gates, fail: false });

        let root = CallNode::agent("assistant", "");
        let mut h = start(&root, summarizer);

        let parent = CallNode::agent("parent", "");
        root.announce_call(Arc::clone(&parent));
        let one = CallNode::tool("one", "");
        let two = CallNode::tool("two", "");
        parent.announce_call(Arc::clone(&one));
        parent.announce_call(Arc::clone(&two));

        // Parent's own output ends first.
        parent.end_output();
        one.end_output();
        two.end_output();
        root.end_output();
        settle().await;
        assert!(!h.session.is_resolved(parent.id()));

        gate_one.notify_one();
        settle().await;
        assert!(h.session.is_resolved(one.id()));
        assert!(!h.session.is_resolved(parent.id()));

        gate_two.notify_one();
        h.finished().await;
        assert!(h.session.is_resolved(two.id()));
        assert!(h.session.is_resolved(parent.id()));
    }

    #[tokio::test]
    async fn child_announced_after_parent_output_ended_is_awaited() {
        let root = CallNode::agent("assistant", "");
        let mut h = start(&root, TableSummarizer::immediate());

        let parent = CallNode::agent("parent", "");
        root.announce_call(Arc::clone(&parent));
        let first = CallNode::tool("first", "");
        parent.announce_call(Arc::clone(&first));
        parent.output_delta("partial");
        parent.end_output();

        // Announced while `first` still holds the parent open.
        let late = CallNode::tool("late", "");
        parent.announce_call(Arc::clone(&late));
        first.end_output();
        root.end_output();
        settle().await;
        assert!(h.session.is_resolved(first.id()));
        assert!(!h.session.is_resolved(parent.id()));
        assert!(!h.session.is_resolved(root.id()));

        late.end_output();
        h.finished().await;
        assert!(h.session.is_resolved(late.id()));
        assert!(h.session.is_resolved(parent.id()));
    }

    #[tokio::test]
    async fn root_output_is_not_summarized() {
        let root = CallNode::agent("assistant", "");
        let mut h = start(&root, TableSummarizer::immediate());
        root.output_delta("final answer");
        root.end_output();
        assert_eq!(h.finished().await, "final answer");
        assert!(root.summary().is_none());
    }

    #[tokio::test]
    async fn summarization_failure_falls_back_to_output() {
        let summarizer = Arc::new(TableSummarizer {
            gates: HashMap::new(),
            fail: true,
        });
        let root = CallNode::agent("assistant", "");
        let mut h = start(&root, summarizer);

        let tool = CallNode::tool("Lookup", "");
        root.announce_call(Arc::clone(&tool));
        tool.output_delta("raw result");
        tool.end_output();
        root.end_output();
        h.finished().await;

        assert_eq!(h.last_frame(), vec!["└ Lookup: _raw result_"]);
    }

    #[tokio::test]
    async fn empty_output_and_failed_summary_still_resolve() {
        let summarizer = Arc::new(TableSummarizer {
            gates: HashMap::new(),
            fail: true,
        });
        let root = CallNode::agent("assistant", "");
        let mut h = start(&root, summarizer);

        let tool = CallNode::tool("Silent", "");
        root.announce_call(Arc::clone(&tool));
        tool.end_output();
        root.end_output();
        h.finished().await;

        assert_eq!(h.last_frame(), vec!["└ Silent: _(no output)_"]);
    }

    #[tokio::test]
    async fn mounting_a_prebuilt_tree_picks_up_existing_state() {
        let root = CallNode::agent("assistant", "");
        let child = CallNode::tool("done-early", "");
        root.announce_call(Arc::clone(&child));
        child.output_delta("ok");
        child.end_output();
        root.output_delta("answer");
        root.end_output();

        let mut h = start(&root, TableSummarizer::immediate());
        assert_eq!(h.finished().await, "answer");
        assert_eq!(h.session.len(), 2);
        assert_eq!(h.session.parent_of(child.id()), Some(root.id()));
    }

    #[tokio::test]
    async fn announcing_an_ancestor_leaves_the_tree_intact() {
        let root = CallNode::agent("assistant", "");
        let mut h = start(&root, TableSummarizer::immediate());
        let child = CallNode::agent("child", "");
        root.announce_call(Arc::clone(&child));

        assert!(!child.announce_call(Arc::clone(&root)));
        child.output_delta("fine");
        assert_eq!(h.last_frame(), vec!["└ child", "    └ fine"]);

        child.end_output();
        root.end_output();
        h.finished().await;
        assert_eq!(h.session.len(), 2);
        assert_eq!(h.session.parent_of(root.id()), None);
    }

    #[tokio::test]
    async fn resolution_is_monotonic() {
        let root = CallNode::agent("assistant", "");
        let mut h = start(&root, TableSummarizer::immediate());
        let tool = CallNode::tool("t", "");
        root.announce_call(Arc::clone(&tool));
        tool.end_output();
        root.end_output();
        h.finished().await;

        tool.output_delta("ignored");
        root.log("after the fact");
        tool.end_output();
        assert!(h.session.is_resolved(tool.id()));
        assert!(h.session.is_resolved(root.id()));
    }

    #[tokio::test]
    async fn dropping_the_session_releases_every_subscription() {
        let root = CallNode::agent("assistant", "");
        let child = CallNode::agent("child", "");
        let grandchild = CallNode::tool("grandchild", "");
        let h = start(&root, TableSummarizer::immediate());
        root.announce_call(Arc::clone(&child));
        child.announce_call(Arc::clone(&grandchild));

        assert!(root.subscriber_count() > 0);
        assert!(grandchild.subscriber_count() > 0);
        drop(h);
        assert_eq!(root.subscriber_count(), 0);
        assert_eq!(child.subscriber_count(), 0);
        assert_eq!(grandchild.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn failing_tool_logs_but_parent_resolves() {
        let root = CallNode::agent("assistant", "");
        let mut h = start(&root, TableSummarizer::immediate());
        let tool = CallNode::tool("Flaky", "");
        root.announce_call(Arc::clone(&tool));
        let err = std::io::Error::other("connection reset");
        tool.apply(&crate::node::ExecutionEvent::error(Uuid::nil(), "Flaky", &err));
        assert_eq!(h.last_frame(), vec!["└ Flaky", "    └ ⚠ Flaky: connection reset"]);

        tool.end_output();
        root.output_delta("done anyway");
        root.end_output();
        assert_eq!(h.finished().await, "done anyway");
    }
}
