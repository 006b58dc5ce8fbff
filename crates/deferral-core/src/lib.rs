//! deferral-core: deferred values and a job scheduler on a
//! cooperative, single-threaded run loop
//!
//! Two tightly coupled subsystems:
//!
//! - [`Deferred`] — a value-or-error container that settles exactly
//!   once, chains transformations, adopts thenables, and adds
//!   timeouts, cooperative cancellation, progress notifications,
//!   observable state and settlement hooks on top of the classical
//!   contract.
//! - [`JobScheduler`] — a priority queue of tasks executed under a
//!   concurrency cap, with per-job timeouts, retries with backoff,
//!   progress propagation, cancellation, an idle signal and
//!   aggregated statistics.
//!
//! Everything runs on a [`Context`]'s run loop: a microtask queue plus
//! virtual-clock timers, driven explicitly with
//! [`run_until_idle`](Context::run_until_idle). Handler dispatch is
//! always deferred through the configured [`TickPolicy`], so callbacks
//! never observe a half-settled value.
//!
//! ```
//! use deferral_core::Context;
//!
//! let ctx = Context::new();
//! let doubled = ctx.resolved(21).map(|v| v * 2);
//! ctx.run_until_idle();
//! assert_eq!(doubled.value().unwrap(), 42);
//! ```

pub mod config;
pub mod context;
pub mod deferred;
pub mod error;
pub mod event_loop;
pub mod jobs;

// Re-export commonly used types
pub use config::{Config, Thunk, TickPolicy};
pub use context::Context;
pub use deferred::{
    CancelHandle, ChainLink, Deferred, DeferredState, Resolution, ScopeHandle, Settlement, Settler,
    Thenable,
};
pub use error::{Error, Result};
pub use event_loop::{EventLoop, TimerId, UnhandledRejection};
pub use jobs::{
    Backoff, ExponentialBackoff, Job, JobId, JobOptions, JobScheduler, JobState, RetryAttempt,
    RetryHistory, SchedulerConfig, SchedulerStats, SchedulerStatus,
};

/// Current version of deferral
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
