//! The job handler: runs the root agent while rendering its tree.

use std::pin::pin;
use std::sync::Arc;

use anyhow::Context;
use async_trait::async_trait;
use tracing::{debug, info};

use crate::agent::{Agent, Runtime};
use crate::channels::ChannelManager;
use crate::llm::Summarizer;
use crate::node::CallNode;
use crate::queue::{Job, JobContext, JobHandler, JobStatus};
use crate::render::{MultiRenderer, RenderRequest, Renderer};

/// Runs each job's request through the root agent and renders the
/// resulting tree to the job's channel and to every observer.
pub struct RenderJobHandler {
    agent: Arc<dyn Agent>,
    runtime: Arc<Runtime>,
    summarizer: Arc<dyn Summarizer>,
    channels: Arc<ChannelManager>,
    /// Targets that see every job regardless of origin.
    observers: Vec<Arc<dyn Renderer>>,
}

impl RenderJobHandler {
    pub fn new(
        agent: Arc<dyn Agent>,
        runtime: Arc<Runtime>,
        summarizer: Arc<dyn Summarizer>,
        channels: Arc<ChannelManager>,
    ) -> Self {
        Self {
            agent,
            runtime,
            summarizer,
            channels,
            observers: Vec::new(),
        }
    }

    pub fn with_observer(mut self, observer: Arc<dyn Renderer>) -> Self {
        self.observers.push(observer);
        self
    }

    /// The origin's live target first, then every observer it does not
    /// already cover.
    fn targets(&self, job: &Job) -> (Vec<Arc<dyn Renderer>>, bool) {
        let live = self.channels.renderer_for(&job.origin);
        let has_live = live.is_some();
        let mut targets: Vec<Arc<dyn Renderer>> = live.into_iter().collect();
        for observer in &self.observers {
            if targets.iter().any(|t| t.name() == observer.name()) {
                continue;
            }
            targets.push(Arc::clone(observer));
        }
        (targets, has_live)
    }
}

#[async_trait]
impl JobHandler for RenderJobHandler {
    async fn handle(&self, job: &Job, ctx: &JobContext) -> anyhow::Result<()> {
        let root = CallNode::agent(self.agent.name(), job.request.as_str());
        let (targets, has_live) = self.targets(job);
        debug!(job_id = %job.id, targets = targets.len(), has_live, "Rendering job");

        let renderer = MultiRenderer::new(targets);
        let request = RenderRequest::new(job.id, Arc::clone(&root), Arc::clone(&self.summarizer));
        let mut render = pin!(renderer.render(request));
        let mut run = pin!(self.runtime.run_root(
            job.id,
            Arc::clone(&self.agent),
            Arc::clone(&root),
            job.request.clone(),
        ));

        // The render only finishes once the root has ended, which never
        // happens when the agent fails; in that case the render is dropped.
        let output = tokio::select! {
            result = &mut run => {
                let output = result.context("agent failed")?;
                ctx.advance(JobStatus::Summarizing)?;
                render.await.context("rendering failed")?;
                output
            }
            rendered = &mut render => {
                rendered.context("rendering failed")?;
                let output = run.await.context("agent failed")?;
                ctx.advance(JobStatus::Summarizing)?;
                output
            }
        };

        if !has_live {
            self.channels
                .respond(&job.origin, &output)
                .await
                .context("delivering result")?;
        }
        info!(job_id = %job.id, chars = output.len(), "Job output delivered");
        Ok(())
    }
}
