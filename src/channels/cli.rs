//! CLI channel: stdin requests, live tree on the terminal.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio_stream::StreamExt;
use tokio_stream::wrappers::LinesStream;
use tracing::error;

use crate::channels::{Channel, IncomingMessage, MessageStream};
use crate::error::ChannelError;
use crate::queue::Origin;
use crate::render::{ConsoleRenderer, Renderer};

const LOCAL_USER: &str = "local-user";

/// Reads one request per stdin line.
pub struct CliChannel {
    /// Live target for CLI jobs; `None` prints only final results.
    console: Option<Arc<ConsoleRenderer>>,
}

impl CliChannel {
    /// Redraws the execution tree while jobs run.
    pub fn new() -> Self {
        Self {
            console: Some(Arc::new(ConsoleRenderer::stdout())),
        }
    }

    /// Prints only final results.
    pub fn plain() -> Self {
        Self { console: None }
    }
}

impl Default for CliChannel {
    fn default() -> Self {
        Self::new()
    }
}

/// The request typed on one line. `;;` separates commands.
fn request_from_line(line: &str) -> Option<String> {
    let line = line.trim();
    (!line.is_empty()).then(|| line.replace(";;", "\n"))
}

fn prompt() {
    eprint!("> ");
}

#[async_trait]
impl Channel for CliChannel {
    fn name(&self) -> &str {
        "cli"
    }

    async fn start(&self) -> Result<MessageStream, ChannelError> {
        prompt();
        let lines = LinesStream::new(BufReader::new(tokio::io::stdin()).lines());
        let requests = lines
            .map_while(|line| match line {
                Ok(line) => Some(line),
                Err(e) => {
                    error!(error = %e, "Failed to read stdin");
                    None
                }
            })
            .filter_map(|line| match request_from_line(&line) {
                Some(request) => Some(IncomingMessage::new("cli", LOCAL_USER, &request)),
                None => {
                    prompt();
                    None
                }
            });
        Ok(Box::pin(requests))
    }

    async fn respond(&self, _origin: &Origin, text: &str) -> Result<(), ChannelError> {
        println!("\n{text}\n");
        prompt();
        Ok(())
    }

    fn renderer(&self, _origin: &Origin) -> Option<Arc<dyn Renderer>> {
        self.console
            .as_ref()
            .map(|console| Arc::clone(console) as Arc<dyn Renderer>)
    }

    async fn health_check(&self) -> Result<(), ChannelError> {
        Ok(())
    }
}
