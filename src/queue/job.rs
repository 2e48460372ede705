//! Jobs, their status machine, and the record of recent jobs.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;
use uuid::Uuid;

use crate::bus::lock;
use crate::channels::IncomingMessage;
use crate::error::JobError;

/// How many finished jobs the registry remembers.
pub const DEFAULT_HISTORY: usize = 100;

/// Where a job came from, and therefore where its result goes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Origin {
    /// Channel name (`cli`, `telegram`, `web`).
    pub channel: String,
    pub user_id: String,
    pub user_name: Option<String>,
    /// Channel-specific id of the request message, if it has one.
    pub request_id: Option<String>,
    /// Channel-specific routing data (chat id, message id, ...).
    pub metadata: serde_json::Value,
}

impl Origin {
    pub fn new(channel: impl Into<String>, user_id: impl Into<String>) -> Self {
        Self {
            channel: channel.into(),
            user_id: user_id.into(),
            user_name: None,
            request_id: None,
            metadata: serde_json::Value::Null,
        }
    }
}

/// One request waiting for, or under, processing.
#[derive(Debug, Clone)]
pub struct Job {
    pub id: Uuid,
    pub request: String,
    pub origin: Origin,
    pub created_at: DateTime<Utc>,
}

impl Job {
    pub fn new(request: impl Into<String>, origin: Origin) -> Self {
        Self {
            id: Uuid::new_v4(),
            request: request.into(),
            origin,
            created_at: Utc::now(),
        }
    }

    /// A job for an incoming message. The job takes the message's id, so
    /// channels can hand it out before the job is enqueued.
    pub fn from_message(message: &IncomingMessage) -> Self {
        Self {
            id: message.id,
            request: message.content.clone(),
            origin: message.origin(),
            created_at: message.received_at,
        }
    }
}

/// Status of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Waiting in the backlog.
    Enqueued,
    /// Handler invoked.
    Running,
    /// Handler produced its result; summaries and final delivery pending.
    Summarizing,
    Succeeded,
    Failed,
}

impl JobStatus {
    /// Check if this status allows transitioning to another status.
    pub fn can_transition_to(&self, target: JobStatus) -> bool {
        use JobStatus::*;

        matches!(
            (self, target),
            (Enqueued, Running)
                | (Running, Summarizing)
                | (Running, Failed)
                | (Summarizing, Succeeded)
                | (Summarizing, Failed)
        )
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed)
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Enqueued => "enqueued",
            Self::Running => "running",
            Self::Summarizing => "summarizing",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
        };
        write!(f, "{s}")
    }
}

/// What the queue remembers about a job.
#[derive(Debug, Clone, Serialize)]
pub struct JobRecord {
    pub id: Uuid,
    pub channel: String,
    pub user_id: String,
    pub status: JobStatus,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl JobRecord {
    pub fn new(job: &Job) -> Self {
        Self {
            id: job.id,
            channel: job.origin.channel.clone(),
            user_id: job.origin.user_id.clone(),
            status: JobStatus::Enqueued,
            created_at: job.created_at,
            started_at: None,
            finished_at: None,
            error: None,
        }
    }
}

/// Bounded record of recent jobs, oldest first.
pub struct JobRegistry {
    records: Mutex<VecDeque<JobRecord>>,
    capacity: usize,
}

impl JobRegistry {
    pub fn new(capacity: usize) -> Self {
        Self {
            records: Mutex::new(VecDeque::new()),
            capacity: capacity.max(1),
        }
    }

    /// Insert a record. When full, the oldest finished record is evicted
    /// first; live jobs are only evicted if nothing has finished.
    pub fn insert(&self, record: JobRecord) {
        let mut records = lock(&self.records);
        if records.len() >= self.capacity {
            let victim = records
                .iter()
                .position(|r| r.status.is_terminal())
                .unwrap_or(0);
            records.remove(victim);
        }
        records.push_back(record);
    }

    /// Move a job to `status`, stamping the matching timestamp.
    pub fn transition(
        &self,
        id: Uuid,
        status: JobStatus,
        error: Option<String>,
    ) -> Result<(), JobError> {
        let mut records = lock(&self.records);
        let Some(record) = records.iter_mut().find(|r| r.id == id) else {
            debug!(job_id = %id, "Transition for a job that is no longer recorded");
            return Ok(());
        };
        if !record.status.can_transition_to(status) {
            return Err(JobError::InvalidTransition {
                id,
                state: record.status.to_string(),
                target: status.to_string(),
            });
        }
        record.status = status;
        match status {
            JobStatus::Running => record.started_at = Some(Utc::now()),
            JobStatus::Succeeded | JobStatus::Failed => record.finished_at = Some(Utc::now()),
            JobStatus::Enqueued | JobStatus::Summarizing => {}
        }
        if error.is_some() {
            record.error = error;
        }
        Ok(())
    }

    pub fn get(&self, id: Uuid) -> Option<JobRecord> {
        lock(&self.records).iter().find(|r| r.id == id).cloned()
    }

    pub fn status(&self, id: Uuid) -> Option<JobStatus> {
        lock(&self.records).iter().find(|r| r.id == id).map(|r| r.status)
    }

    /// All records, oldest first.
    pub fn list(&self) -> Vec<JobRecord> {
        lock(&self.records).iter().cloned().collect()
    }

    pub fn len(&self) -> usize {
        lock(&self.records).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for JobRegistry {
    fn default() -> Self {
        Self::new(DEFAULT_HISTORY)
    }
}

/// Handle given to a job handler for reporting progress.
#[derive(Clone)]
pub struct JobContext {
    job_id: Uuid,
    registry: Arc<JobRegistry>,
}

impl JobContext {
    pub fn new(job_id: Uuid, registry: Arc<JobRegistry>) -> Self {
        Self { job_id, registry }
    }

    pub fn job_id(&self) -> Uuid {
        self.job_id
    }

    pub fn status(&self) -> Option<JobStatus> {
        self.registry.status(self.job_id)
    }

    /// Advance the job's status. Only forward transitions are accepted.
    pub fn advance(&self, status: JobStatus) -> Result<(), JobError> {
        self.registry.transition(self.job_id, status, None)
    }
}
