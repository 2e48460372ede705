//! Web channel: jobs submitted over HTTP or WebSocket, progress streamed
//! to every WebSocket observer.
//!
//! `start()` returns a stream backed by an mpsc receiver that the HTTP/WS
//! handlers feed through [`WebSubmitter::submit`]. All rendering goes through
//! one shared [`BroadcastRenderer`]; final messages and failures are
//! published on it as `done` frames.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{Mutex, mpsc};
use tokio_stream::wrappers::UnboundedReceiverStream;
use tracing::debug;
use uuid::Uuid;

use crate::channels::{Channel, IncomingMessage, MessageStream};
use crate::error::ChannelError;
use crate::queue::Origin;
use crate::render::{BroadcastRenderer, Frame, Renderer};

/// User id for requests that do not name one.
pub const ANONYMOUS_USER: &str = "web-user";

/// A channel fed by the HTTP/WS server.
pub struct WebChannel {
    incoming_tx: mpsc::UnboundedSender<IncomingMessage>,
    /// Receiver side of the incoming channel: consumed once in `start()`.
    incoming_rx: Mutex<Option<mpsc::UnboundedReceiver<IncomingMessage>>>,
    broadcast: BroadcastRenderer,
}

impl WebChannel {
    pub fn new(broadcast: BroadcastRenderer) -> Self {
        let (incoming_tx, incoming_rx) = mpsc::unbounded_channel();
        Self {
            incoming_tx,
            incoming_rx: Mutex::new(Some(incoming_rx)),
            broadcast,
        }
    }

    /// Cheap handle the server keeps for submitting requests.
    pub fn submitter(&self) -> WebSubmitter {
        WebSubmitter {
            tx: self.incoming_tx.clone(),
        }
    }

    pub fn broadcast(&self) -> &BroadcastRenderer {
        &self.broadcast
    }

    fn publish_final(&self, origin: &Origin, text: &str, error: Option<String>) {
        let Some(job_id) = job_id(origin) else {
            debug!(user = %origin.user_id, "Web delivery without a job id");
            return;
        };
        self.broadcast.publish(Frame {
            job_id,
            lines: text.lines().map(str::to_string).collect(),
            done: true,
            error,
        });
    }
}

/// Submits requests to a [`WebChannel`].
#[derive(Clone)]
pub struct WebSubmitter {
    tx: mpsc::UnboundedSender<IncomingMessage>,
}

impl WebSubmitter {
    /// Submit a request. The returned id is the job id its frames will
    /// carry.
    pub fn submit(&self, text: &str, user: Option<&str>) -> Result<Uuid, ChannelError> {
        let text = text.trim();
        if text.is_empty() {
            return Err(ChannelError::InvalidMessage("empty request".into()));
        }
        let msg = IncomingMessage::new("web", user.unwrap_or(ANONYMOUS_USER), text);
        let id = msg.id;
        self.tx.send(msg).map_err(|_| ChannelError::SendFailed {
            name: "web".into(),
            reason: "web channel is not running".into(),
        })?;
        Ok(id)
    }
}

#[async_trait]
impl Channel for WebChannel {
    fn name(&self) -> &str {
        "web"
    }

    async fn start(&self) -> Result<MessageStream, ChannelError> {
        let rx = self
            .incoming_rx
            .lock()
            .await
            .take()
            .ok_or_else(|| ChannelError::StartupFailed {
                name: "web".to_string(),
                reason: "start() already called".to_string(),
            })?;

        Ok(Box::pin(UnboundedReceiverStream::new(rx)))
    }

    async fn respond(&self, origin: &Origin, text: &str) -> Result<(), ChannelError> {
        self.publish_final(origin, text, None);
        Ok(())
    }

    async fn report_failure(&self, origin: &Origin, message: &str) -> Result<(), ChannelError> {
        self.publish_final(origin, message, Some(message.to_string()));
        Ok(())
    }

    fn renderer(&self, _origin: &Origin) -> Option<Arc<dyn Renderer>> {
        Some(Arc::new(self.broadcast.clone()))
    }

    async fn health_check(&self) -> Result<(), ChannelError> {
        Ok(())
    }
}

/// Web jobs reuse the request message id as the job id.
fn job_id(origin: &Origin) -> Option<Uuid> {
    origin.request_id.as_deref().and_then(|id| Uuid::parse_str(id).ok())
}

#[cfg(test)]
mod tests {
    use futures::StreamExt;

    use super::*;
    use crate::queue::Job;

    #[tokio::test]
    async fn submitted_requests_become_jobs_with_the_returned_id() {
        let channel = WebChannel::new(BroadcastRenderer::new());
        let mut stream = channel.start().await.unwrap();

        let id = channel.submitter().submit("  /time ", Some("ada")).unwrap();
        let msg = stream.next().await.unwrap();
        assert_eq!(msg.content, "/time");
        assert_eq!(msg.user_id, "ada");
        assert_eq!(Job::from_message(&msg).id, id);
    }

    #[tokio::test]
    async fn start_can_only_be_called_once() {
        let channel = WebChannel::new(BroadcastRenderer::new());
        let _stream = channel.start().await.unwrap();
        assert!(matches!(
            channel.start().await,
            Err(ChannelError::StartupFailed { .. })
        ));
    }

    #[test]
    fn empty_requests_are_rejected() {
        let channel = WebChannel::new(BroadcastRenderer::new());
        assert!(matches!(
            channel.submitter().submit("  ", None),
            Err(ChannelError::InvalidMessage(_))
        ));
    }

    #[tokio::test]
    async fn failures_publish_a_done_frame_with_the_error() {
        let broadcast = BroadcastRenderer::new();
        let mut frames = broadcast.subscribe();
        let channel = WebChannel::new(broadcast);

        let msg = IncomingMessage::new("web", ANONYMOUS_USER, "x");
        channel
            .report_failure(&msg.origin(), "Sorry, that failed")
            .await
            .unwrap();

        let frame = frames.recv().await.unwrap();
        assert_eq!(frame.job_id, msg.id);
        assert!(frame.done);
        assert_eq!(frame.lines, vec!["Sorry, that failed"]);
        assert_eq!(frame.error.as_deref(), Some("Sorry, that failed"));
    }
}
