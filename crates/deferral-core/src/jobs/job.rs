//! Job identity, state and the per-job record

use crate::deferred::{CancelHandle, Deferred};
use crate::error::Error;
use crate::jobs::config::JobOptions;
use crate::jobs::retry::RetryHistory;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

/// Unique job identifier, minted monotonically as `job-N`
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct JobId(String);

impl JobId {
    pub(crate) fn mint(n: u64) -> Self {
        JobId(format!("job-{n}"))
    }

    /// The identifier as a string slice
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for JobId {
    fn from(s: &str) -> Self {
        JobId(s.to_string())
    }
}

impl From<String> for JobId {
    fn from(s: String) -> Self {
        JobId(s)
    }
}

/// Job execution state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum JobState {
    /// Waiting in the queue (or for a retry slot)
    Pending,

    /// Currently executing
    Running,

    /// Finished successfully
    Completed,

    /// Exhausted its attempts
    Failed,

    /// Canceled before completion
    Canceled,
}

impl Default for JobState {
    fn default() -> Self {
        JobState::Pending
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JobState::Pending => write!(f, "pending"),
            JobState::Running => write!(f, "running"),
            JobState::Completed => write!(f, "completed"),
            JobState::Failed => write!(f, "failed"),
            JobState::Canceled => write!(f, "canceled"),
        }
    }
}

impl JobState {
    /// Check if the state is terminal (won't change)
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobState::Completed | JobState::Failed | JobState::Canceled
        )
    }

    /// Check if the job is still in flight
    pub fn is_active(&self) -> bool {
        matches!(self, JobState::Pending | JobState::Running)
    }
}

/// A unit of work: a nullary producer of a deferred value. Called once
/// per attempt.
pub type JobTask = Box<dyn FnMut() -> Deferred<Value>>;

/// Introspectable per-job state. The task closure and live deferred
/// value are held separately in the scheduler's runtime record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    /// Unique job ID
    pub id: JobId,

    /// Execution state
    pub state: JobState,

    /// Options the job was admitted with
    pub options: JobOptions,

    /// Attempts made so far (incremented at launch)
    pub attempts: u32,

    /// Last reported progress, clamped into [0, 100]
    pub progress: f64,

    /// Wall-clock admission stamp
    pub created_at: DateTime<Utc>,

    /// Run-loop time when the current/last attempt started
    pub started_at: Option<u64>,

    /// Run-loop time when the job reached a terminal state
    pub ended_at: Option<u64>,

    /// Result value once completed
    pub result: Option<Value>,

    /// Error once failed or canceled
    pub error: Option<Error>,

    /// One entry per failed attempt that was retried
    pub retry_history: RetryHistory,
}

impl Job {
    /// Create a pending job
    pub fn new(id: JobId, options: JobOptions) -> Self {
        Self {
            id,
            state: JobState::default(),
            options,
            attempts: 0,
            progress: 0.0,
            created_at: Utc::now(),
            started_at: None,
            ended_at: None,
            result: None,
            error: None,
            retry_history: RetryHistory::new(),
        }
    }

    /// Mark as started for a new attempt
    pub fn mark_started(&mut self, now_ms: u64) {
        self.state = JobState::Running;
        self.started_at = Some(now_ms);
        self.attempts += 1;
    }

    /// Mark as completed with a result
    pub fn mark_completed(&mut self, now_ms: u64, result: Value) {
        self.state = JobState::Completed;
        self.ended_at = Some(now_ms);
        self.progress = 100.0;
        self.result = Some(result);
    }

    /// Mark as failed with the terminal error
    pub fn mark_failed(&mut self, now_ms: u64, error: Error) {
        self.state = JobState::Failed;
        self.ended_at = Some(now_ms);
        self.error = Some(error);
    }

    /// Mark as canceled
    pub fn mark_canceled(&mut self, now_ms: u64, error: Error) {
        self.state = JobState::Canceled;
        self.ended_at = Some(now_ms);
        self.error = Some(error);
    }

    /// Reset to pending for the next attempt, clearing the error
    pub fn revert_for_retry(&mut self) {
        self.state = JobState::Pending;
        self.error = None;
        self.progress = 0.0;
        self.started_at = None;
        self.ended_at = None;
    }

    /// Attempts left before the retry budget runs out
    pub fn retries_remaining(&self) -> u32 {
        self.options.retries.saturating_sub(self.retry_history.count())
    }

    /// Duration of the last attempt, when both stamps exist
    pub fn duration_ms(&self) -> Option<u64> {
        match (self.started_at, self.ended_at) {
            (Some(started), Some(ended)) => Some(ended.saturating_sub(started)),
            _ => None,
        }
    }
}

/// Runtime record: the introspectable job plus everything needed to
/// actually run it
pub(crate) struct JobEntry {
    pub job: Job,
    pub task: JobTask,
    pub live: Option<Deferred<Value>>,
    pub cancel: Option<CancelHandle<Value>>,
}

impl JobEntry {
    pub fn new(job: Job, task: JobTask) -> Self {
        Self {
            job,
            task,
            live: None,
            cancel: None,
        }
    }
}
