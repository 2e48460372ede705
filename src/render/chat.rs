//! Chat renderer: keeps a thread of chat messages in step with the tree.
//!
//! Frames are coalesced through a watch channel and drained by a pump task,
//! so a burst of deltas costs at most one API round per send interval.
//! For each chunk of the current frame the pump edits the message it sent
//! for that position, skips it if unchanged, or sends a new reply to the
//! previous chunk. Messages left over from a longer frame are deleted.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::watch;
use tokio::time::{Instant, sleep_until};
use tracing::{debug, warn};

use super::{FrameSink, RenderRequest, Renderer, run_session};
use crate::error::{ChannelError, RenderError};
use crate::markup::{Chunk, chunk_for_channel};

/// Platform handle of a sent message.
pub type MessageRef = i64;

/// Minimal message API the chat renderer drives.
#[async_trait]
pub trait ChatTransport: Send + Sync {
    fn name(&self) -> &str;

    /// Send a new message, optionally as a reply.
    async fn send(&self, chunk: &Chunk, reply_to: Option<MessageRef>) -> Result<MessageRef, ChannelError>;

    /// Replace the text of a message sent earlier.
    async fn edit(&self, message: MessageRef, chunk: &Chunk) -> Result<(), ChannelError>;

    async fn delete(&self, message: MessageRef) -> Result<(), ChannelError>;
}

/// Platform limits the pump must respect.
#[derive(Debug, Clone, Copy)]
pub struct ChatLimits {
    /// Maximum characters per message, after markup conversion.
    pub max_len: usize,
    /// Minimum delay between two API calls.
    pub min_interval: Duration,
}

impl Default for ChatLimits {
    fn default() -> Self {
        Self {
            max_len: 4096,
            min_interval: Duration::from_secs(1),
        }
    }
}

/// Renders one job into one chat conversation.
pub struct ChatRenderer {
    transport: Arc<dyn ChatTransport>,
    /// The message that requested the job; the first chunk replies to it.
    reply_to: Option<MessageRef>,
    limits: ChatLimits,
}

#[derive(Clone, Default)]
struct PendingFrame {
    lines: Vec<String>,
    done: bool,
}

/// Messages sent so far, one per chunk position.
struct Thread {
    transport: Arc<dyn ChatTransport>,
    reply_to: Option<MessageRef>,
    limits: ChatLimits,
    sent: Vec<(MessageRef, Chunk)>,
    next_call: Instant,
}

impl ChatRenderer {
    pub fn new(transport: Arc<dyn ChatTransport>, reply_to: Option<MessageRef>, limits: ChatLimits) -> Self {
        Self {
            transport,
            reply_to,
            limits,
        }
    }
}

#[async_trait]
impl Renderer for ChatRenderer {
    fn name(&self) -> &str {
        self.transport.name()
    }

    async fn render(&self, request: RenderRequest) -> Result<(), RenderError> {
        let job_id = request.job_id;
        let (tx, rx) = watch::channel(PendingFrame::default());
        let tx = Arc::new(tx);

        let thread = Thread {
            transport: Arc::clone(&self.transport),
            reply_to: self.reply_to,
            limits: self.limits,
            sent: Vec::new(),
            next_call: Instant::now(),
        };
        let pump = tokio::spawn(thread.pump(rx));

        let sink: FrameSink = {
            let tx = Arc::clone(&tx);
            Arc::new(move |lines: Vec<String>| {
                tx.send_modify(|frame| frame.lines = lines);
            })
        };
        let rendered = run_session(request, sink).await;
        tx.send_modify(|frame| frame.done = true);

        let pumped = pump.await.map_err(|e| RenderError::Target {
            target: self.transport.name().to_string(),
            reason: format!("pump task failed: {e}"),
        })?;
        rendered?;
        pumped.map_err(|e| {
            warn!(%job_id, transport = %self.transport.name(), error = %e, "Final chat frame not delivered");
            RenderError::Channel(e)
        })
    }
}

impl Thread {
    /// Drain frames until the done frame has been delivered. Only the
    /// final delivery's error is returned; earlier ones are retried by the
    /// next frame.
    async fn pump(mut self, mut rx: watch::Receiver<PendingFrame>) -> Result<(), ChannelError> {
        loop {
            if rx.changed().await.is_err() {
                return Ok(());
            }
            sleep_until(self.next_call).await;
            let frame = rx.borrow_and_update().clone();
            let result = self.sync(&frame.lines).await;
            if frame.done {
                return result;
            }
            if let Err(e) = result {
                warn!(transport = %self.transport.name(), error = %e, "Chat update failed; will retry on next frame");
            }
        }
    }

    /// Bring the sent messages in line with `lines`.
    async fn sync(&mut self, lines: &[String]) -> Result<(), ChannelError> {
        let text = lines.join("\n");
        let chunks = chunk_for_channel(&text, self.limits.max_len);
        if chunks.is_empty() && self.sent.is_empty() {
            return Ok(());
        }

        for (i, chunk) in chunks.iter().enumerate() {
            match self.sent.get(i) {
                Some((_, previous)) if previous == chunk => {}
                Some(&(message, _)) => {
                    self.throttle().await;
                    self.transport.edit(message, chunk).await?;
                    self.sent[i].1 = chunk.clone();
                }
                None => {
                    let reply_to = match i {
                        0 => self.reply_to,
                        _ => Some(self.sent[i - 1].0),
                    };
                    self.throttle().await;
                    let message = self.transport.send(chunk, reply_to).await?;
                    debug!(transport = %self.transport.name(), message, chunk = i, "Sent chat chunk");
                    self.sent.push((message, chunk.clone()));
                }
            }
        }

        while self.sent.len() > chunks.len().max(1) {
            let Some((message, _)) = self.sent.pop() else {
                break;
            };
            self.throttle().await;
            self.transport.delete(message).await?;
        }
        Ok(())
    }

    async fn throttle(&mut self) {
        sleep_until(self.next_call).await;
        self.next_call = Instant::now() + self.limits.min_interval;
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicI64, Ordering};

    use uuid::Uuid;

    use super::*;
    use crate::llm::PreviewSummarizer;
    use crate::node::CallNode;

    #[derive(Debug, Clone, PartialEq)]
    enum Call {
        Send { id: MessageRef, text: String, reply_to: Option<MessageRef> },
        Edit { id: MessageRef, text: String },
        Delete { id: MessageRef },
    }

    #[derive(Default)]
    struct RecordingTransport {
        calls: Mutex<Vec<(Instant, Call)>>,
        next_id: AtomicI64,
        fail_edits: bool,
    }

    impl RecordingTransport {
        fn calls(&self) -> Vec<Call> {
            self.calls.lock().unwrap().iter().map(|(_, c)| c.clone()).collect()
        }

        fn record(&self, call: Call) {
            self.calls.lock().unwrap().push((Instant::now(), call));
        }
    }

    #[async_trait]
    impl ChatTransport for RecordingTransport {
        fn name(&self) -> &str {
            "fake"
        }

        async fn send(&self, chunk: &Chunk, reply_to: Option<MessageRef>) -> Result<MessageRef, ChannelError> {
            let id = self.next_id.fetch_add(1, Ordering::SeqCst) + 100;
            self.record(Call::Send {
                id,
                text: chunk.plain.clone(),
                reply_to,
            });
            Ok(id)
        }

        async fn edit(&self, message: MessageRef, chunk: &Chunk) -> Result<(), ChannelError> {
            if self.fail_edits {
                return Err(ChannelError::EditFailed {
                    name: "fake".into(),
                    reason: "nope".into(),
                });
            }
            self.record(Call::Edit {
                id: message,
                text: chunk.plain.clone(),
            });
            Ok(())
        }

        async fn delete(&self, message: MessageRef) -> Result<(), ChannelError> {
            self.record(Call::Delete { id: message });
            Ok(())
        }
    }

    fn limits(max_len: usize) -> ChatLimits {
        ChatLimits {
            max_len,
            min_interval: Duration::from_millis(20),
        }
    }

    fn thread(transport: &Arc<RecordingTransport>, max_len: usize) -> Thread {
        Thread {
            transport: Arc::clone(transport) as Arc<dyn ChatTransport>,
            reply_to: Some(7),
            limits: limits(max_len),
            sent: Vec::new(),
            next_call: Instant::now(),
        }
    }

    fn lines(text: &str) -> Vec<String> {
        text.lines().map(str::to_string).collect()
    }

    #[tokio::test(start_paused = true)]
    async fn nothing_is_sent_before_content() {
        let transport = Arc::new(RecordingTransport::default());
        let mut thread = thread(&transport, 4096);
        thread.sync(&[]).await.unwrap();
        thread.sync(&["   ".into()]).await.unwrap();
        assert!(transport.calls().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn first_frame_sends_then_edits_in_place() {
        let transport = Arc::new(RecordingTransport::default());
        let mut thread = thread(&transport, 4096);

        thread.sync(&lines("└ Lookup")).await.unwrap();
        thread.sync(&lines("└ Lookup")).await.unwrap();
        thread.sync(&lines("└ Lookup: _done_")).await.unwrap();

        assert_eq!(
            transport.calls(),
            vec![
                Call::Send {
                    id: 100,
                    text: "└ Lookup".into(),
                    reply_to: Some(7)
                },
                Call::Edit {
                    id: 100,
                    text: "└ Lookup: _done_".into()
                },
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn overflow_is_chained_by_reply_and_shrink_deletes_surplus() {
        let transport = Arc::new(RecordingTransport::default());
        let mut thread = thread(&transport, 64);

        let long = format!("{}\n{}", "a".repeat(60), "b".repeat(60));
        thread.sync(&lines(&long)).await.unwrap();
        thread.sync(&lines("short")).await.unwrap();

        assert_eq!(
            transport.calls(),
            vec![
                Call::Send {
                    id: 100,
                    text: "a".repeat(60),
                    reply_to: Some(7)
                },
                Call::Send {
                    id: 101,
                    text: "b".repeat(60),
                    reply_to: Some(100)
                },
                Call::Edit {
                    id: 100,
                    text: "short".into()
                },
                Call::Delete { id: 101 },
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn api_calls_respect_min_interval() {
        let transport = Arc::new(RecordingTransport::default());
        let mut thread = thread(&transport, 64);
        let long = (0..4).map(|_| "x".repeat(60)).collect::<Vec<_>>().join("\n");
        thread.sync(&lines(&long)).await.unwrap();

        let stamps: Vec<Instant> = transport.calls.lock().unwrap().iter().map(|(t, _)| *t).collect();
        assert_eq!(stamps.len(), 4);
        for pair in stamps.windows(2) {
            assert!(pair[1] - pair[0] >= Duration::from_millis(20));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn render_flushes_final_frame() {
        let transport = Arc::new(RecordingTransport::default());
        let renderer = ChatRenderer::new(
            Arc::clone(&transport) as Arc<dyn ChatTransport>,
            None,
            limits(4096),
        );
        let root = CallNode::agent("assistant", "");
        let request = RenderRequest::new(Uuid::nil(), Arc::clone(&root), Arc::new(PreviewSummarizer));

        let task = tokio::spawn(async move { renderer.render(request).await });
        tokio::task::yield_now().await;
        root.output_delta("Hel");
        root.output_delta("lo");
        root.end_output();
        task.await.unwrap().unwrap();

        let calls = transport.calls();
        let last_text = match calls.last() {
            Some(Call::Send { text, .. }) | Some(Call::Edit { text, .. }) => text.clone(),
            other => panic!("unexpected last call {other:?}"),
        };
        assert_eq!(last_text, "Hello");
    }

    #[tokio::test(start_paused = true)]
    async fn failed_final_edit_is_reported() {
        let transport = Arc::new(RecordingTransport {
            fail_edits: true,
            ..Default::default()
        });
        let mut thread = thread(&transport, 4096);
        thread.sync(&lines("first")).await.unwrap();
        assert!(thread.sync(&lines("second")).await.is_err());
    }
}
