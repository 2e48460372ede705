//! Multi-target dispatcher.

use std::sync::Arc;

use async_trait::async_trait;
use futures::future::join_all;
use tracing::{debug, warn};

use super::{FrameSink, RenderRequest, Renderer, run_session};
use crate::error::RenderError;

/// Renders one request into every target concurrently.
///
/// Targets share the request's nodes, so a node's summary is computed once
/// no matter how many targets mount it.
pub struct MultiRenderer {
    targets: Vec<Arc<dyn Renderer>>,
}

impl MultiRenderer {
    pub fn new(targets: Vec<Arc<dyn Renderer>>) -> Self {
        Self { targets }
    }

    pub fn len(&self) -> usize {
        self.targets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.targets.is_empty()
    }
}

#[async_trait]
impl Renderer for MultiRenderer {
    fn name(&self) -> &str {
        "multi"
    }

    /// Resolves once every target has resolved. With no targets, a headless
    /// session still drives the tree to resolution.
    async fn render(&self, request: RenderRequest) -> Result<(), RenderError> {
        if self.targets.is_empty() {
            let sink: FrameSink = Arc::new(|_: Vec<String>| {});
            run_session(request, sink).await?;
            return Ok(());
        }

        debug!(job_id = %request.job_id, targets = self.targets.len(), "Dispatching render");
        let results = join_all(
            self.targets
                .iter()
                .map(|target| target.render(request.clone())),
        )
        .await;

        let mut errors: Vec<RenderError> = results
            .into_iter()
            .zip(&self.targets)
            .filter_map(|(result, target)| {
                result
                    .inspect_err(|e| warn!(target_name = %target.name(), error = %e, "Render target failed"))
                    .err()
            })
            .collect();

        match errors.len() {
            0 => Ok(()),
            1 => Err(errors.remove(0)),
            _ => Err(RenderError::Multiple(errors)),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use uuid::Uuid;

    use super::*;
    use crate::error::LlmError;
    use crate::llm::Summarizer;
    use crate::node::CallNode;

    struct CountingSummarizer(AtomicUsize);

    #[async_trait]
    impl Summarizer for CountingSummarizer {
        async fn summarize(&self, name: &str, _input: &str, _output: &str) -> Result<String, LlmError> {
            self.0.fetch_add(1, Ordering::SeqCst);
            Ok(format!("{name} ok"))
        }

        async fn summarize_error(&self, error: &str) -> Result<String, LlmError> {
            Ok(error.to_string())
        }
    }

    /// Records its frames, then optionally fails after finishing.
    struct Recording {
        name: &'static str,
        frames: Arc<Mutex<Vec<Vec<String>>>>,
        fail: bool,
    }

    impl Recording {
        fn new(name: &'static str, fail: bool) -> Arc<Self> {
            Arc::new(Self {
                name,
                frames: Arc::new(Mutex::new(Vec::new())),
                fail,
            })
        }
    }

    #[async_trait]
    impl Renderer for Recording {
        fn name(&self) -> &str {
            self.name
        }

        async fn render(&self, request: RenderRequest) -> Result<(), RenderError> {
            let frames = Arc::clone(&self.frames);
            run_session(request, Arc::new(move |l: Vec<String>| frames.lock().unwrap().push(l))).await?;
            if self.fail {
                return Err(RenderError::Target {
                    target: self.name.into(),
                    reason: "boom".into(),
                });
            }
            Ok(())
        }
    }

    fn request(root: &Arc<CallNode>, summarizer: Arc<dyn Summarizer>) -> RenderRequest {
        RenderRequest::new(Uuid::nil(), Arc::clone(root), summarizer)
    }

    async fn drive(root: &Arc<CallNode>) {
        tokio::task::yield_now().await;
        let tool = CallNode::tool("Lookup", "");
        root.announce_call(Arc::clone(&tool));
        tool.output_delta("42");
        tool.end_output();
        root.output_delta("answer");
        root.end_output();
    }

    #[tokio::test]
    async fn every_target_sees_the_same_final_frame_and_summary_runs_once() {
        let summarizer = Arc::new(CountingSummarizer(AtomicUsize::new(0)));
        let a = Recording::new("a", false);
        let b = Recording::new("b", false);
        let multi = MultiRenderer::new(vec![a.clone() as Arc<dyn Renderer>, b.clone()]);
        let root = CallNode::agent("assistant", "");

        let req = request(&root, summarizer.clone());
        let task = tokio::spawn(async move { multi.render(req).await });
        drive(&root).await;
        task.await.unwrap().unwrap();

        let expected = vec!["└ Lookup: _Lookup ok_".to_string(), "answer".to_string()];
        assert_eq!(a.frames.lock().unwrap().last(), Some(&expected));
        assert_eq!(b.frames.lock().unwrap().last(), Some(&expected));
        assert_eq!(summarizer.0.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn single_failure_is_returned_as_is() {
        let summarizer = Arc::new(CountingSummarizer(AtomicUsize::new(0)));
        let multi = MultiRenderer::new(vec![
            Recording::new("ok", false) as Arc<dyn Renderer>,
            Recording::new("bad", true),
        ]);
        let root = CallNode::agent("assistant", "");
        let req = request(&root, summarizer);
        let task = tokio::spawn(async move { multi.render(req).await });
        drive(&root).await;

        match task.await.unwrap() {
            Err(RenderError::Target { target, .. }) => assert_eq!(target, "bad"),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn several_failures_are_aggregated() {
        let summarizer = Arc::new(CountingSummarizer(AtomicUsize::new(0)));
        let multi = MultiRenderer::new(vec![
            Recording::new("x", true) as Arc<dyn Renderer>,
            Recording::new("y", true),
        ]);
        let root = CallNode::agent("assistant", "");
        let req = request(&root, summarizer);
        let task = tokio::spawn(async move { multi.render(req).await });
        drive(&root).await;

        match task.await.unwrap() {
            Err(RenderError::Multiple(errors)) => assert_eq!(errors.len(), 2),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn no_targets_still_resolves() {
        let summarizer = Arc::new(CountingSummarizer(AtomicUsize::new(0)));
        let multi = MultiRenderer::new(Vec::new());
        let root = CallNode::agent("assistant", "");
        let req = request(&root, summarizer);
        let task = tokio::spawn(async move { multi.render(req).await });
        drive(&root).await;
        task.await.unwrap().unwrap();
    }
}
