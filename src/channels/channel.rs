//! The `Channel` trait and the messages that flow through it.

use std::pin::Pin;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::Stream;
use uuid::Uuid;

use crate::error::ChannelError;
use crate::queue::Origin;
use crate::render::Renderer;

/// A request received from a channel.
#[derive(Debug, Clone)]
pub struct IncomingMessage {
    pub id: Uuid,
    /// Name of the channel it arrived on.
    pub channel: String,
    pub user_id: String,
    pub user_name: Option<String>,
    pub content: String,
    pub received_at: DateTime<Utc>,
    /// Channel-specific routing data.
    pub metadata: serde_json::Value,
}

impl IncomingMessage {
    pub fn new(channel: &str, user_id: &str, content: &str) -> Self {
        Self {
            id: Uuid::new_v4(),
            channel: channel.to_string(),
            user_id: user_id.to_string(),
            user_name: None,
            content: content.to_string(),
            received_at: Utc::now(),
            metadata: serde_json::Value::Null,
        }
    }

    pub fn with_metadata(mut self, metadata: serde_json::Value) -> Self {
        self.metadata = metadata;
        self
    }

    pub fn with_user_name(mut self, name: &str) -> Self {
        self.user_name = Some(name.to_string());
        self
    }

    /// Addressing information for replies to this message.
    pub fn origin(&self) -> Origin {
        let request_id = self
            .metadata
            .get("message_id")
            .and_then(|v| match v {
                serde_json::Value::String(s) => Some(s.clone()),
                serde_json::Value::Number(n) => Some(n.to_string()),
                _ => None,
            })
            .or_else(|| Some(self.id.to_string()));
        Origin {
            channel: self.channel.clone(),
            user_id: self.user_id.clone(),
            user_name: self.user_name.clone(),
            request_id,
            metadata: self.metadata.clone(),
        }
    }
}

/// Stream of incoming messages from a channel.
pub type MessageStream = Pin<Box<dyn Stream<Item = IncomingMessage> + Send>>;

/// A place requests come from and results go back to.
#[async_trait]
pub trait Channel: Send + Sync {
    fn name(&self) -> &str;

    /// Start receiving requests.
    async fn start(&self) -> Result<MessageStream, ChannelError>;

    /// Deliver a final message (a result or a failure) to `origin`.
    async fn respond(&self, origin: &Origin, text: &str) -> Result<(), ChannelError>;

    /// Deliver a job failure message. Defaults to a plain response.
    async fn report_failure(&self, origin: &Origin, message: &str) -> Result<(), ChannelError> {
        self.respond(origin, message).await
    }

    /// The live render target for jobs that came from `origin`, if this
    /// channel can show progress while a job runs.
    fn renderer(&self, _origin: &Origin) -> Option<Arc<dyn Renderer>> {
        None
    }

    async fn health_check(&self) -> Result<(), ChannelError>;

    async fn shutdown(&self) -> Result<(), ChannelError> {
        Ok(())
    }
}
