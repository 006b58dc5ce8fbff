//! Scheduler and per-job configuration

use crate::error::{Error, Result};
use crate::jobs::retry::Backoff;
use serde::{Deserialize, Serialize};

/// Scheduler-wide configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Jobs allowed to run at once
    pub concurrency: usize,

    /// Pending-queue admission cap; `None` means unbounded
    pub max_queue_size: Option<usize>,

    /// Start pumping as soon as jobs are added
    pub auto_start: bool,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            concurrency: 1,
            max_queue_size: None,
            auto_start: true,
        }
    }
}

impl SchedulerConfig {
    /// Default configuration
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the concurrency cap
    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency;
        self
    }

    /// Bound the pending queue
    pub fn with_max_queue_size(mut self, max_queue_size: usize) -> Self {
        self.max_queue_size = Some(max_queue_size);
        self
    }

    /// Control whether admissions pump immediately
    pub fn with_auto_start(mut self, auto_start: bool) -> Self {
        self.auto_start = auto_start;
        self
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if self.concurrency == 0 {
            return Err(Error::Scheduler("concurrency must be at least 1".into()));
        }
        if self.max_queue_size == Some(0) {
            return Err(Error::Scheduler("max_queue_size must be at least 1".into()));
        }
        Ok(())
    }
}

/// Per-job options supplied at admission
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobOptions {
    /// Per-attempt timeout in milliseconds; 0 disables it
    pub timeout_ms: u64,

    /// Retries allowed after the first failed attempt
    pub retries: u32,

    /// Base delay before a retry is re-queued
    pub retry_delay_ms: u64,

    /// Admission priority; higher runs first
    pub priority: i64,

    /// Delay policy applied between attempts
    pub backoff: Backoff,
}

impl Default for JobOptions {
    fn default() -> Self {
        Self {
            timeout_ms: 0,
            retries: 0,
            retry_delay_ms: 0,
            priority: 0,
            backoff: Backoff::default(),
        }
    }
}

impl JobOptions {
    /// Defaults: no timeout, no retries, priority 0
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the per-attempt timeout
    pub fn with_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.timeout_ms = timeout_ms;
        self
    }

    /// Set the retry budget
    pub fn with_retries(mut self, retries: u32) -> Self {
        self.retries = retries;
        self
    }

    /// Set the base retry delay
    pub fn with_retry_delay_ms(mut self, retry_delay_ms: u64) -> Self {
        self.retry_delay_ms = retry_delay_ms;
        self
    }

    /// Set the admission priority
    pub fn with_priority(mut self, priority: i64) -> Self {
        self.priority = priority;
        self
    }

    /// Set the backoff policy
    pub fn with_backoff(mut self, backoff: Backoff) -> Self {
        self.backoff = backoff;
        self
    }
}
