//! Cooperative run loop: microtask queue and virtual-clock timers
//!
//! Everything in this crate executes on a single logical task runner.
//! Handler dispatch and timer callbacks are queued here and drained by
//! the owning [`Context`](crate::Context); between callbacks no borrow
//! of the loop is held, so callbacks are free to schedule more work.
//!
//! The clock is virtual: `run_until_idle` advances it straight to the
//! next due timer instead of sleeping, which keeps timer-driven tests
//! deterministic.

use crate::config::Thunk;
use crate::error::Error;
use std::collections::VecDeque;
use std::panic::Location;

/// Identifier of a one-shot timer, used to cancel it
pub type TimerId = u64;

/// A rejection that settled with no registered interest
#[derive(Debug, Clone)]
pub struct UnhandledRejection {
    /// Where the rejected deferred value was created
    pub created_at: &'static Location<'static>,

    /// The rejection reason
    pub error: Error,
}

struct TimerEntry {
    id: TimerId,
    fire_at: u64,
    seq: u64,
    callback: Thunk,
}

/// Single-threaded run loop state
pub struct EventLoop {
    microtasks: VecDeque<Thunk>,
    timers: Vec<TimerEntry>,
    now_ms: u64,
    next_timer_id: TimerId,
    next_seq: u64,
    unhandled: Vec<UnhandledRejection>,
}

impl Default for EventLoop {
    fn default() -> Self {
        Self::new()
    }
}

impl EventLoop {
    /// Create an empty loop with the clock at zero
    pub fn new() -> Self {
        Self {
            microtasks: VecDeque::new(),
            timers: Vec::new(),
            now_ms: 0,
            next_timer_id: 1,
            next_seq: 0,
            unhandled: Vec::new(),
        }
    }

    /// Current virtual time in milliseconds
    pub fn now_ms(&self) -> u64 {
        self.now_ms
    }

    /// Queue a microtask
    pub fn enqueue_microtask(&mut self, task: Thunk) {
        self.microtasks.push_back(task);
    }

    /// Schedule a one-shot timer `delay_ms` from now
    pub fn schedule_timer(&mut self, delay_ms: u64, callback: Thunk) -> TimerId {
        let id = self.next_timer_id;
        self.next_timer_id += 1;
        let seq = self.next_seq;
        self.next_seq += 1;

        self.timers.push(TimerEntry {
            id,
            fire_at: self.now_ms + delay_ms,
            seq,
            callback,
        });

        id
    }

    /// Cancel a timer; returns false when it already fired or never existed
    pub fn cancel_timer(&mut self, id: TimerId) -> bool {
        let before = self.timers.len();
        self.timers.retain(|t| t.id != id);
        self.timers.len() != before
    }

    /// True while any microtask or timer is queued
    pub fn has_pending_work(&self) -> bool {
        !self.microtasks.is_empty() || !self.timers.is_empty()
    }

    /// Pop the next microtask, if any
    pub(crate) fn take_microtask(&mut self) -> Option<Thunk> {
        self.microtasks.pop_front()
    }

    /// Remove the next due timer (earliest `fire_at`, then scheduling
    /// order) and advance the clock to its due time. With a `limit`,
    /// timers due past it are left in place.
    pub(crate) fn take_next_timer(&mut self, limit: Option<u64>) -> Option<Thunk> {
        let idx = self
            .timers
            .iter()
            .enumerate()
            .min_by_key(|(_, t)| (t.fire_at, t.seq))
            .map(|(i, _)| i)?;

        if let Some(limit) = limit {
            if self.timers[idx].fire_at > limit {
                return None;
            }
        }

        let entry = self.timers.remove(idx);
        self.now_ms = self.now_ms.max(entry.fire_at);
        Some(entry.callback)
    }

    /// Move the clock forward without firing anything
    pub(crate) fn advance_clock_to(&mut self, target_ms: u64) {
        self.now_ms = self.now_ms.max(target_ms);
    }

    /// Record a rejection nothing registered interest in
    pub(crate) fn report_unhandled(&mut self, rejection: UnhandledRejection) {
        tracing::warn!(
            "unhandled rejection: error={}, created_at={}",
            rejection.error,
            rejection.created_at
        );
        self.unhandled.push(rejection);
    }

    /// Drain the unhandled-rejection ledger
    pub fn take_unhandled(&mut self) -> Vec<UnhandledRejection> {
        std::mem::take(&mut self.unhandled)
    }
}
