//! Live rendering of execution trees.
//!
//! A [`Renderer`] owns one target. Its `render` call mounts a
//! [`session::Session`] over the request's root node, pushes a freshly
//! serialized frame to the target on every observed change, and resolves
//! only when the session fires its [`FinishHandle`].

pub mod broadcast;
pub mod chat;
pub mod console;
pub mod multi;
pub mod serialize;
pub mod session;

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::oneshot;
use tracing::warn;
use uuid::Uuid;

use crate::bus::lock;
use crate::error::RenderError;
use crate::llm::Summarizer;
use crate::node::CallNode;

pub use broadcast::{BroadcastRenderer, Frame};
pub use chat::{ChatLimits, ChatRenderer, ChatTransport, MessageRef};
pub use console::ConsoleRenderer;
pub use multi::MultiRenderer;
pub use session::Session;

/// Receives every serialized frame, synchronously, in order.
pub type FrameSink = Arc<dyn Fn(Vec<String>) + Send + Sync>;

/// What to render: one job's root node and the collaborator that turns
/// finished nodes into summaries.
#[derive(Clone)]
pub struct RenderRequest {
    pub job_id: Uuid,
    pub root: Arc<CallNode>,
    pub summarizer: Arc<dyn Summarizer>,
}

impl RenderRequest {
    pub fn new(job_id: Uuid, root: Arc<CallNode>, summarizer: Arc<dyn Summarizer>) -> Self {
        Self {
            job_id,
            root,
            summarizer,
        }
    }
}

/// A rendering target.
#[async_trait]
pub trait Renderer: Send + Sync {
    /// Target name, used in logs and errors.
    fn name(&self) -> &str;

    /// Render until the tree's root resolves.
    async fn render(&self, request: RenderRequest) -> Result<(), RenderError>;
}

/// Single-resolution completion signal owned by one render call.
pub struct FinishSignal {
    job_id: Uuid,
    rx: oneshot::Receiver<String>,
    handle: FinishHandle,
}

/// Capability to complete a render call, handed down into the session.
#[derive(Clone)]
pub struct FinishHandle {
    job_id: Uuid,
    tx: Arc<Mutex<Option<oneshot::Sender<String>>>>,
}

impl FinishSignal {
    pub fn new(job_id: Uuid) -> Self {
        let (tx, rx) = oneshot::channel();
        Self {
            job_id,
            rx,
            handle: FinishHandle {
                job_id,
                tx: Arc::new(Mutex::new(Some(tx))),
            },
        }
    }

    pub fn handle(&self) -> FinishHandle {
        self.handle.clone()
    }

    /// Wait for the first `finish` call and return the root output it
    /// carried.
    pub async fn wait(self) -> Result<String, RenderError> {
        let job_id = self.job_id;
        drop(self.handle);
        self.rx.await.map_err(|_| RenderError::Abandoned { job_id })
    }
}

impl FinishHandle {
    /// Complete the render. Only the first call has an effect; later calls
    /// are logged and return `false`.
    pub fn finish(&self, output: String) -> bool {
        match lock(&self.tx).take() {
            Some(tx) => {
                let _ = tx.send(output);
                true
            }
            None => {
                warn!(job_id = %self.job_id, "Finish signal invoked more than once; ignoring");
                false
            }
        }
    }

    pub fn is_finished(&self) -> bool {
        lock(&self.tx).is_none()
    }
}

/// Mount a session that feeds `sink`, wait for it to finish, then tear it
/// down. Returns the root's raw output.
pub async fn run_session(request: RenderRequest, sink: FrameSink) -> Result<String, RenderError> {
    let signal = FinishSignal::new(request.job_id);
    let session = Session::start(&request, signal.handle(), sink);
    let output = signal.wait().await;
    drop(session);
    output
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn finish_resolves_once() {
        let signal = FinishSignal::new(Uuid::nil());
        let handle = signal.handle();

        assert!(handle.finish("first".into()));
        assert!(!handle.finish("second".into()));
        assert!(handle.is_finished());
        assert_eq!(signal.wait().await.unwrap(), "first");
    }

    #[tokio::test]
    async fn dropped_handles_abandon_the_render() {
        let signal = FinishSignal::new(Uuid::nil());
        assert!(matches!(
            signal.wait().await,
            Err(RenderError::Abandoned { .. })
        ));
    }

    #[tokio::test]
    async fn finish_after_wait_dropped_is_still_a_no_op() {
        let signal = FinishSignal::new(Uuid::nil());
        let handle = signal.handle();
        drop(signal);
        assert!(handle.finish("late".into()));
        assert!(!handle.finish("later".into()));
    }
}
