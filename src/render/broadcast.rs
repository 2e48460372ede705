//! Broadcast renderer: fans frames out to WebSocket observers.

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::debug;
use uuid::Uuid;

use super::{FrameSink, RenderRequest, Renderer, run_session};
use crate::error::RenderError;

/// Default broadcast channel capacity.
const DEFAULT_BROADCAST_CAPACITY: usize = 256;

/// One serialized frame of one job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Frame {
    pub job_id: Uuid,
    pub lines: Vec<String>,
    /// Set on the last frame of a job.
    pub done: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Renders every job into a shared broadcast channel. Cheap to clone.
#[derive(Clone)]
pub struct BroadcastRenderer {
    tx: broadcast::Sender<Frame>,
}

impl BroadcastRenderer {
    pub fn new() -> Self {
        let (tx, _rx) = broadcast::channel(DEFAULT_BROADCAST_CAPACITY);
        Self { tx }
    }

    /// Subscribe to frames. Each WS client calls this.
    pub fn subscribe(&self) -> broadcast::Receiver<Frame> {
        self.tx.subscribe()
    }

    /// Publish a frame outside of a render, e.g. a job's final answer or
    /// failure message.
    pub fn publish(&self, frame: Frame) {
        // Ok if no observers are connected.
        let _ = self.tx.send(frame);
    }

    pub fn observer_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for BroadcastRenderer {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Renderer for BroadcastRenderer {
    fn name(&self) -> &str {
        "broadcast"
    }

    async fn render(&self, request: RenderRequest) -> Result<(), RenderError> {
        let job_id = request.job_id;
        let last = Arc::new(std::sync::Mutex::new(Vec::new()));
        let sink: FrameSink = {
            let tx = self.tx.clone();
            let last = Arc::clone(&last);
            Arc::new(move |lines: Vec<String>| {
                *crate::bus::lock(&last) = lines.clone();
                let _ = tx.send(Frame {
                    job_id,
                    lines,
                    done: false,
                    error: None,
                });
            })
        };

        run_session(request, sink).await?;

        let lines = std::mem::take(&mut *crate::bus::lock(&last));
        debug!(%job_id, observers = self.observer_count(), "Broadcast render finished");
        self.publish(Frame {
            job_id,
            lines,
            done: true,
            error: None,
        });
        Ok(())
    }
}
