//! Error taxonomy shared by deferred values and the job scheduler
//!
//! Rejection reasons travel through deferred values by value, so every
//! variant is cloneable and comparable. The scheduler-facing variants
//! carry enough context (`job_id`, `timeout_ms`) to route failures
//! without re-reading scheduler state.

use crate::jobs::JobId;
use serde::{Deserialize, Serialize};

/// Result type alias used throughout the crate
pub type Result<T> = std::result::Result<T, Error>;

/// Failure kinds surfaced by deferred values and the job scheduler
#[derive(Debug, Clone, PartialEq, thiserror::Error, Serialize, Deserialize)]
pub enum Error {
    /// Cooperative cancellation of a deferred value
    #[error("canceled: {0}")]
    Canceled(String),

    /// A timeout decorator expired before its source settled
    #[error("timed out: {0}")]
    Timeout(String),

    /// Every input rejected; the reasons are kept in input order
    #[error("all deferred values rejected ({} reasons)", reason_count(.0))]
    Aggregate(Vec<Error>),

    /// Scheduler misuse (unknown job, invalid configuration, ...)
    #[error("scheduler error: {0}")]
    Scheduler(String),

    /// Admission refused because the pending queue is full
    #[error("queue capacity exceeded (max {max_queue_size})")]
    CapacityExceeded { max_queue_size: usize },

    /// A job ran past its configured timeout; never retried
    #[error("job {job_id} timed out after {timeout_ms}ms")]
    JobTimeout { job_id: JobId, timeout_ms: u64 },

    /// A job was canceled at the scheduler level
    #[error("job {job_id} canceled")]
    JobCanceled { job_id: JobId },

    /// A deferred value was resolved with itself
    #[error("a deferred value cannot be resolved with itself")]
    SelfResolution,

    /// An accessor was used in a state that does not permit it
    #[error("invalid state: {0}")]
    InvalidState(String),

    /// Generic computation failure or user-supplied rejection payload
    #[error("{0}")]
    Message(String),
}

fn reason_count(reasons: &[Error]) -> usize {
    reasons.len()
}

impl Error {
    /// Generic rejection payload
    pub fn message(msg: impl Into<String>) -> Self {
        Error::Message(msg.into())
    }

    /// Cancellation with a human-readable cause
    pub fn canceled(msg: impl Into<String>) -> Self {
        Error::Canceled(msg.into())
    }

    /// Timeout with a human-readable cause
    pub fn timeout(msg: impl Into<String>) -> Self {
        Error::Timeout(msg.into())
    }

    /// True for both deferred-level and scheduler-level cancellation
    pub fn is_cancellation(&self) -> bool {
        matches!(self, Error::Canceled(_) | Error::JobCanceled { .. })
    }

    /// True for both deferred-level and scheduler-level timeouts
    pub fn is_timeout(&self) -> bool {
        matches!(self, Error::Timeout(_) | Error::JobTimeout { .. })
    }

    /// True only for the scheduler-level job timeout
    pub fn is_job_timeout(&self) -> bool {
        matches!(self, Error::JobTimeout { .. })
    }
}
