//! Channel manager: owns the channels and routes deliveries by name.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use futures::stream::select_all;
use tracing::{info, warn};

use crate::channels::{Channel, MessageStream};
use crate::error::ChannelError;
use crate::queue::{JobReporter, Origin};
use crate::render::Renderer;

/// Holds every configured channel.
pub struct ChannelManager {
    channels: HashMap<String, Box<dyn Channel>>,
}

impl ChannelManager {
    pub fn new() -> Self {
        Self {
            channels: HashMap::new(),
        }
    }

    /// Add a channel. A channel with the same name is replaced.
    pub fn add(&mut self, channel: Box<dyn Channel>) {
        let name = channel.name().to_string();
        if self.channels.insert(name.clone(), channel).is_some() {
            warn!(channel = %name, "Replaced an existing channel");
        }
    }

    /// Channel names, sorted.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.channels.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn get(&self, name: &str) -> Option<&dyn Channel> {
        self.channels.get(name).map(|c| c.as_ref())
    }

    /// Start every channel and merge their incoming streams.
    ///
    /// A channel that fails to start is logged and skipped; if none start
    /// the error is returned.
    pub async fn start_all(&self) -> Result<MessageStream, ChannelError> {
        let mut streams = Vec::new();
        for (name, channel) in &self.channels {
            match channel.start().await {
                Ok(stream) => {
                    info!(channel = %name, "Channel started");
                    streams.push(stream);
                }
                Err(e) => warn!(channel = %name, error = %e, "Channel failed to start"),
            }
        }
        if streams.is_empty() {
            return Err(ChannelError::StartupFailed {
                name: "all".to_string(),
                reason: "no channel could be started".to_string(),
            });
        }
        Ok(Box::pin(select_all(streams)))
    }

    /// Deliver `text` to the channel `origin` came from.
    pub async fn respond(&self, origin: &Origin, text: &str) -> Result<(), ChannelError> {
        self.channels
            .get(&origin.channel)
            .ok_or_else(|| ChannelError::UnknownChannel(origin.channel.clone()))?
            .respond(origin, text)
            .await
    }

    /// The live render target of the channel `origin` came from.
    pub fn renderer_for(&self, origin: &Origin) -> Option<Arc<dyn Renderer>> {
        self.channels.get(&origin.channel)?.renderer(origin)
    }

    /// Health of every channel, sorted by name.
    pub async fn health(&self) -> Vec<(String, Result<(), ChannelError>)> {
        let mut results = Vec::with_capacity(self.channels.len());
        for name in self.names() {
            if let Some(channel) = self.channels.get(&name) {
                results.push((name, channel.health_check().await));
            }
        }
        results
    }

    pub async fn shutdown_all(&self) {
        for (name, channel) in &self.channels {
            if let Err(e) = channel.shutdown().await {
                warn!(channel = %name, error = %e, "Channel shutdown failed");
            }
        }
    }
}

impl Default for ChannelManager {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl JobReporter for ChannelManager {
    async fn report_failure(&self, origin: &Origin, message: &str) -> Result<(), ChannelError> {
        self.channels
            .get(&origin.channel)
            .ok_or_else(|| ChannelError::UnknownChannel(origin.channel.clone()))?
            .report_failure(origin, message)
            .await
    }
}
