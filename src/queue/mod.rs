//! Single-concurrency job queue.
//!
//! Jobs are handled strictly in enqueue order, one at a time. A failing or
//! panicking handler fails only its own job: the failure is turned into a
//! user-facing message, delivered once to the job's origin, and the queue
//! moves on.

pub mod job;

pub use job::{DEFAULT_HISTORY, Job, JobContext, JobRecord, JobRegistry, JobStatus, Origin};

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use futures::StreamExt;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::agent::truncate_for_preview;
use crate::bus::lock;
use crate::channels::MessageStream;
use crate::error::{ChannelError, ConfigError, JobError};
use crate::llm::{PreviewSummarizer, Summarizer};

/// Longest error excerpt used in the fallback failure message.
const FALLBACK_ERROR_CHARS: usize = 200;

/// Does the work for one job.
#[async_trait]
pub trait JobHandler: Send + Sync {
    async fn handle(&self, job: &Job, ctx: &JobContext) -> anyhow::Result<()>;
}

/// Delivers job failures to the place the job came from.
#[async_trait]
pub trait JobReporter: Send + Sync {
    async fn report_failure(&self, origin: &Origin, message: &str) -> Result<(), ChannelError>;
}

/// Reporter used when none is configured: failures only reach the log.
struct LogReporter;

#[async_trait]
impl JobReporter for LogReporter {
    async fn report_failure(&self, origin: &Origin, message: &str) -> Result<(), ChannelError> {
        warn!(channel = %origin.channel, user = %origin.user_id, "Job failed: {}", message);
        Ok(())
    }
}

/// Builder for [`JobQueue`].
#[derive(Default)]
pub struct JobQueueBuilder {
    handler: Option<Arc<dyn JobHandler>>,
    reporter: Option<Arc<dyn JobReporter>>,
    summarizer: Option<Arc<dyn Summarizer>>,
    history: Option<usize>,
}

impl JobQueueBuilder {
    pub fn handler(mut self, handler: Arc<dyn JobHandler>) -> Self {
        self.handler = Some(handler);
        self
    }

    pub fn reporter(mut self, reporter: Arc<dyn JobReporter>) -> Self {
        self.reporter = Some(reporter);
        self
    }

    pub fn summarizer(mut self, summarizer: Arc<dyn Summarizer>) -> Self {
        self.summarizer = Some(summarizer);
        self
    }

    /// How many job records to keep for inspection.
    pub fn history(mut self, history: usize) -> Self {
        self.history = Some(history);
        self
    }

    /// Build the queue. A queue without a handler would drop every job, so
    /// that is a configuration error.
    pub fn build(self) -> Result<Arc<JobQueue>, ConfigError> {
        let handler = self.handler.ok_or_else(|| ConfigError::MissingRequired {
            key: "job handler".to_string(),
            hint: "Register one with JobQueue::builder().handler(..)".to_string(),
        })?;
        let (idle, _) = watch::channel(true);
        Ok(Arc::new(JobQueue {
            handler,
            reporter: self.reporter.unwrap_or_else(|| Arc::new(LogReporter)),
            summarizer: self
                .summarizer
                .unwrap_or_else(|| Arc::new(PreviewSummarizer)),
            state: Mutex::new(QueueState::default()),
            records: Arc::new(JobRegistry::new(self.history.unwrap_or(DEFAULT_HISTORY))),
            idle,
        }))
    }
}

/// The backlog and the processing marker: the queue's only critical
/// section.
#[derive(Default)]
struct QueueState {
    backlog: VecDeque<Job>,
    processing: Option<Uuid>,
}

/// FIFO job queue with at most one job in flight.
pub struct JobQueue {
    handler: Arc<dyn JobHandler>,
    reporter: Arc<dyn JobReporter>,
    summarizer: Arc<dyn Summarizer>,
    state: Mutex<QueueState>,
    records: Arc<JobRegistry>,
    idle: watch::Sender<bool>,
}

impl JobQueue {
    pub fn builder() -> JobQueueBuilder {
        JobQueueBuilder::default()
    }

    /// Append a job to the backlog and start it if nothing is running.
    ///
    /// Never blocks and never rejects. Must be called from within a tokio
    /// runtime.
    pub fn enqueue(self: &Arc<Self>, job: Job) -> Uuid {
        let id = job.id;
        self.records.insert(JobRecord::new(&job));
        {
            let mut state = lock(&self.state);
            state.backlog.push_back(job);
            self.idle.send_replace(false);
        }
        info!(job_id = %id, "Job enqueued");
        self.process_next();
        id
    }

    /// Enqueue every incoming message until the stream ends.
    pub async fn admit(self: &Arc<Self>, mut messages: MessageStream) {
        while let Some(msg) = messages.next().await {
            debug!(channel = %msg.channel, user = %msg.user_id, "Message received");
            self.enqueue(Job::from_message(&msg));
        }
        info!("Incoming message stream ended");
    }

    /// Start the oldest job unless one is already processing.
    fn process_next(self: &Arc<Self>) {
        let job = {
            let mut state = lock(&self.state);
            if state.processing.is_some() {
                return;
            }
            let Some(job) = state.backlog.pop_front() else {
                self.idle.send_replace(true);
                return;
            };
            state.processing = Some(job.id);
            job
        };

        let queue = Arc::clone(self);
        tokio::spawn(async move {
            queue.run(job).await;
            lock(&queue.state).processing = None;
            queue.process_next();
        });
    }

    async fn run(&self, job: Job) {
        let id = job.id;
        if let Err(e) = self.records.transition(id, JobStatus::Running, None) {
            warn!(job_id = %id, error = %e, "Unexpected job status");
        }
        info!(job_id = %id, channel = %job.origin.channel, "Job started");

        let ctx = JobContext::new(id, Arc::clone(&self.records));
        // The handler runs in its own task so a panic surfaces as a
        // JoinError instead of tearing down the queue.
        let handler = Arc::clone(&self.handler);
        let task_job = job.clone();
        let task_ctx = ctx.clone();
        let outcome = tokio::spawn(async move { handler.handle(&task_job, &task_ctx).await }).await;

        let failure = match outcome {
            Ok(Ok(())) => None,
            Ok(Err(e)) => Some(JobError::Failed {
                id,
                reason: format!("{e:#}"),
            }),
            Err(join) => Some(JobError::Panicked {
                id,
                reason: panic_reason(join),
            }),
        };

        match failure {
            None => {
                if ctx.status() == Some(JobStatus::Running) {
                    self.advance(id, JobStatus::Summarizing, None);
                }
                self.advance(id, JobStatus::Succeeded, None);
                info!(job_id = %id, "Job succeeded");
            }
            Some(err) => {
                error!(job_id = %id, error = %err, "Job failed");
                let message = self.failure_message(&err).await;
                if let Err(e) = self.reporter.report_failure(&job.origin, &message).await {
                    warn!(job_id = %id, error = %e, "Failed to deliver job failure");
                }
                self.advance(id, JobStatus::Failed, Some(err.to_string()));
            }
        }
    }

    fn advance(&self, id: Uuid, status: JobStatus, error: Option<String>) {
        if let Err(e) = self.records.transition(id, status, error) {
            warn!(job_id = %id, error = %e, "Unexpected job status");
        }
    }

    /// The user-facing failure text. Falls back to an apology quoting the
    /// first line of the error when summarization fails.
    async fn failure_message(&self, err: &JobError) -> String {
        let text = match err {
            JobError::Failed { reason, .. } => reason.clone(),
            JobError::Panicked { .. } => "the request crashed unexpectedly".to_string(),
            other => other.to_string(),
        };
        match self.summarizer.summarize_error(&text).await {
            Ok(message) if !message.trim().is_empty() => message,
            Ok(_) => fallback_message(&text),
            Err(e) => {
                warn!(error = %e, "Error summarization failed, using fallback");
                fallback_message(&text)
            }
        }
    }

    /// Resolve once the backlog is empty and nothing is processing.
    pub async fn wait_idle(&self) {
        let mut idle = self.idle.subscribe();
        // The sender lives in self, so the channel cannot close here.
        let _ = idle.wait_for(|idle| *idle).await;
    }

    /// Number of jobs waiting behind the one in flight.
    pub fn pending(&self) -> usize {
        lock(&self.state).backlog.len()
    }

    /// The job currently being handled, if any.
    pub fn processing(&self) -> Option<Uuid> {
        lock(&self.state).processing
    }

    pub fn status(&self, id: Uuid) -> Option<JobStatus> {
        self.records.status(id)
    }

    /// Recent jobs, oldest first.
    pub fn records(&self) -> Vec<JobRecord> {
        self.records.list()
    }
}

fn fallback_message(error: &str) -> String {
    let first = error.lines().next().unwrap_or("").trim();
    format!(
        "Sorry, something went wrong: {}",
        truncate_for_preview(first, FALLBACK_ERROR_CHARS)
    )
}

fn panic_reason(join: tokio::task::JoinError) -> String {
    if !join.is_panic() {
        return join.to_string();
    }
    let payload = join.into_panic();
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;
    use crate::error::LlmError;

    struct Recording {
        seen: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl JobHandler for Recording {
        async fn handle(&self, job: &Job, _ctx: &JobContext) -> anyhow::Result<()> {
            tokio::task::yield_now().await;
            lock(&self.seen).push(job.request.clone());
            match job.request.as_str() {
                "fail" => anyhow::bail!("handler rejected\nat some/file.rs:10"),
                "panic" => panic!("handler exploded"),
                _ => Ok(()),
            }
        }
    }

    #[derive(Default)]
    struct Reports {
        messages: Mutex<Vec<(String, String)>>,
    }

    #[async_trait]
    impl JobReporter for Reports {
        async fn report_failure(&self, origin: &Origin, message: &str) -> Result<(), ChannelError> {
            lock(&self.messages).push((origin.user_id.clone(), message.to_string()));
            Ok(())
        }
    }

    struct BrokenSummarizer(AtomicUsize);

    #[async_trait]
    impl Summarizer for BrokenSummarizer {
        async fn summarize(&self, _: &str, _: &str, _: &str) -> Result<String, LlmError> {
            unreachable!("queue only summarizes errors")
        }
        async fn summarize_error(&self, _: &str) -> Result<String, LlmError> {
            self.0.fetch_add(1, Ordering::SeqCst);
            Err(LlmError::EmptySummary {
                provider: "test".into(),
            })
        }
    }

    fn job(request: &str, user: &str) -> Job {
        Job::new(request, Origin::new("test", user))
    }

    #[test]
    fn missing_handler_fails_fast() {
        let result = JobQueue::builder().build();
        assert!(matches!(result, Err(ConfigError::MissingRequired { .. })));
    }

    #[tokio::test]
    async fn jobs_run_in_order() {
        let handler = Arc::new(Recording {
            seen: Mutex::new(Vec::new()),
        });
        let queue = JobQueue::builder().handler(handler.clone()).build().unwrap();

        let ids: Vec<Uuid> = ["a", "b", "c"]
            .iter()
            .map(|r| queue.enqueue(job(r, "u")))
            .collect();
        queue.wait_idle().await;

        assert_eq!(*lock(&handler.seen), vec!["a", "b", "c"]);
        for id in ids {
            assert_eq!(queue.status(id), Some(JobStatus::Succeeded));
        }
        assert_eq!(queue.pending(), 0);
        assert_eq!(queue.processing(), None);
    }

    #[tokio::test]
    async fn failure_is_reported_once_and_queue_moves_on() {
        let handler = Arc::new(Recording {
            seen: Mutex::new(Vec::new()),
        });
        let reports = Arc::new(Reports::default());
        let queue = JobQueue::builder()
            .handler(handler.clone())
            .reporter(reports.clone())
            .build()
            .unwrap();

        let failed = queue.enqueue(job("fail", "alice"));
        let next = queue.enqueue(job("after", "bob"));
        queue.wait_idle().await;

        let messages = lock(&reports.messages).clone();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].0, "alice");
        assert!(messages[0].1.contains("handler rejected"));
        assert!(!messages[0].1.contains("some/file.rs"));

        assert_eq!(queue.status(failed), Some(JobStatus::Failed));
        assert_eq!(queue.status(next), Some(JobStatus::Succeeded));
        assert_eq!(*lock(&handler.seen), vec!["fail", "after"]);
    }

    #[tokio::test]
    async fn panicking_handler_fails_only_its_job() {
        let handler = Arc::new(Recording {
            seen: Mutex::new(Vec::new()),
        });
        let reports = Arc::new(Reports::default());
        let queue = JobQueue::builder()
            .handler(handler)
            .reporter(reports.clone())
            .build()
            .unwrap();

        let panicked = queue.enqueue(job("panic", "u"));
        let next = queue.enqueue(job("fine", "u"));
        queue.wait_idle().await;

        assert_eq!(queue.status(panicked), Some(JobStatus::Failed));
        assert_eq!(queue.status(next), Some(JobStatus::Succeeded));
        let record = queue.records().into_iter().find(|r| r.id == panicked).unwrap();
        assert!(record.error.unwrap().contains("handler exploded"));
        assert_eq!(lock(&reports.messages).len(), 1);
    }

    #[tokio::test]
    async fn broken_summarizer_falls_back_to_first_error_line() {
        let handler = Arc::new(Recording {
            seen: Mutex::new(Vec::new()),
        });
        let reports = Arc::new(Reports::default());
        let summarizer = Arc::new(BrokenSummarizer(AtomicUsize::new(0)));
        let queue = JobQueue::builder()
            .handler(handler)
            .reporter(reports.clone())
            .summarizer(summarizer.clone())
            .build()
            .unwrap();

        queue.enqueue(job("fail", "u"));
        queue.wait_idle().await;

        assert_eq!(summarizer.0.load(Ordering::SeqCst), 1);
        let messages = lock(&reports.messages).clone();
        assert_eq!(messages.len(), 1);
        assert!(messages[0].1.starts_with("Sorry, something went wrong: "));
        assert!(!messages[0].1.contains('\n'));
    }

    #[tokio::test]
    async fn idle_queue_resolves_immediately() {
        let handler = Arc::new(Recording {
            seen: Mutex::new(Vec::new()),
        });
        let queue = JobQueue::builder().handler(handler).build().unwrap();
        queue.wait_idle().await;
        assert!(queue.records().is_empty());
    }

    #[tokio::test]
    async fn admitted_messages_become_jobs() {
        use crate::channels::IncomingMessage;

        let handler = Arc::new(Recording {
            seen: Mutex::new(Vec::new()),
        });
        let queue = JobQueue::builder().handler(handler.clone()).build().unwrap();
        let messages = vec![
            IncomingMessage::new("test", "u", "one"),
            IncomingMessage::new("test", "u", "two"),
        ];
        let first = messages[0].id;

        queue.admit(Box::pin(futures::stream::iter(messages))).await;
        queue.wait_idle().await;

        assert_eq!(*lock(&handler.seen), vec!["one", "two"]);
        assert_eq!(queue.status(first), Some(JobStatus::Succeeded));
    }
}
