//! Retry backoff policies and per-job retry history

use crate::error::Error;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Delay policy applied between failed attempts
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Backoff {
    /// Use the job's configured retry delay verbatim
    Fixed,

    /// Exponential backoff, ignoring the configured retry delay
    Exponential(ExponentialBackoff),
}

impl Default for Backoff {
    fn default() -> Self {
        Backoff::Fixed
    }
}

impl Backoff {
    /// Delay before re-queueing after the given (1-indexed) attempt
    pub fn delay_for(&self, attempt: u32, base_delay_ms: u64) -> u64 {
        match self {
            Backoff::Fixed => base_delay_ms,
            Backoff::Exponential(backoff) => backoff.delay_ms(attempt),
        }
    }
}

/// Exponential backoff configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExponentialBackoff {
    /// Delay after the first failed attempt
    pub initial_delay_ms: u64,

    /// Cap applied to the computed delay
    pub max_delay_ms: u64,

    /// Multiplier (usually 2.0)
    pub multiplier: f64,

    /// Jitter factor (0.0 - 1.0) to randomize delays
    pub jitter: f64,
}

impl Default for ExponentialBackoff {
    fn default() -> Self {
        Self {
            initial_delay_ms: 1_000,
            max_delay_ms: 3_600_000,
            multiplier: 2.0,
            jitter: 0.1,
        }
    }
}

impl ExponentialBackoff {
    /// Create a new backoff curve
    pub fn new(initial_delay_ms: u64, max_delay_ms: u64, multiplier: f64) -> Self {
        Self {
            initial_delay_ms,
            max_delay_ms,
            multiplier,
            jitter: 0.1,
        }
    }

    /// Set the jitter factor
    pub fn with_jitter(mut self, jitter: f64) -> Self {
        self.jitter = jitter.clamp(0.0, 1.0);
        self
    }

    /// Delay for the given (1-indexed) attempt
    pub fn delay_ms(&self, attempt: u32) -> u64 {
        let exponent = attempt.saturating_sub(1) as f64;
        let delay = self.initial_delay_ms as f64 * self.multiplier.powf(exponent);
        let delay = delay.min(self.max_delay_ms as f64);

        let jittered = if self.jitter > 0.0 {
            use rand::Rng;
            let range = delay * self.jitter;
            let offset = rand::thread_rng().gen_range(-range..=range);
            (delay + offset).max(0.0)
        } else {
            delay
        };

        jittered as u64
    }
}

/// One failed attempt that was retried
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryAttempt {
    /// Attempt number (1-indexed)
    pub attempt: u32,

    /// The error that failed the attempt
    pub error: Error,

    /// Delay applied before the next attempt
    pub delay_ms: u64,

    /// Wall-clock stamp of the failure
    pub attempted_at: DateTime<Utc>,
}

impl RetryAttempt {
    /// Record a failed attempt
    pub fn new(attempt: u32, error: Error, delay_ms: u64) -> Self {
        Self {
            attempt,
            error,
            delay_ms,
            attempted_at: Utc::now(),
        }
    }
}

/// Retry history for a job
#[derive(Debug, Default, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryHistory {
    /// All retried attempts, oldest first
    pub attempts: Vec<RetryAttempt>,
}

impl RetryHistory {
    /// Create empty history
    pub fn new() -> Self {
        Self::default()
    }

    /// Append an attempt
    pub fn record(&mut self, attempt: RetryAttempt) {
        self.attempts.push(attempt);
    }

    /// Number of retried attempts
    pub fn count(&self) -> u32 {
        self.attempts.len() as u32
    }

    /// Total delay spent between attempts
    pub fn total_delay_ms(&self) -> u64 {
        self.attempts.iter().map(|a| a.delay_ms).sum()
    }

    /// The most recent error
    pub fn last_error(&self) -> Option<&Error> {
        self.attempts.last().map(|a| &a.error)
    }
}
