//! Bounded-concurrency job scheduler over the cooperative run loop
//!
//! Jobs are admitted into a priority-ordered pending queue and pumped
//! into execution while the running set is below the concurrency cap.
//! Each launched job runs behind a cancellable mirror (so scheduler
//! cancellation is cooperative) and, when configured, a job-timeout
//! decorator. Completion routing always re-pumps at the tail, which
//! keeps the pump re-entrancy safe.
//!
//! Jobs are retained in the `jobs` map for the scheduler's lifetime so
//! they stay introspectable; long-lived schedulers processing many
//! jobs accumulate records accordingly.

use crate::context::Context;
use crate::deferred::{panic_message, Deferred, Resolution, Settlement, Settler};
use crate::error::{Error, Result};
use crate::jobs::config::{JobOptions, SchedulerConfig};
use crate::jobs::job::{Job, JobEntry, JobId, JobState};
use crate::jobs::retry::RetryAttempt;
use crate::jobs::stats::{SchedulerStats, SchedulerStatus};
use serde_json::Value;
use std::cell::RefCell;
use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::rc::Rc;
use tracing::{debug, info, warn};

struct SchedulerInner {
    config: SchedulerConfig,
    is_running: bool,
    next_id: u64,
    /// Queued job ids, kept sorted by priority descending
    pending: Vec<JobId>,
    running: Vec<JobId>,
    jobs: HashMap<JobId, JobEntry>,
    /// Ledger of successfully completed job ids
    completed: Vec<JobId>,
    stats: SchedulerStats,
    /// Lazily armed idle signal; cleared on resolution
    idle: Option<(Deferred<()>, Settler<()>)>,
    pump_scheduled: bool,
    /// Jobs sitting out a retry delay: in neither `pending` nor
    /// `running`, but not yet settled either
    retry_waiting: usize,
}

enum Disposition {
    Canceled,
    Retry { delay_ms: u64 },
    Failed,
}

/// Priority job scheduler with a concurrency cap, retries and an idle
/// signal
pub struct JobScheduler {
    inner: Rc<RefCell<SchedulerInner>>,
    ctx: Context,
}

impl Clone for JobScheduler {
    fn clone(&self) -> Self {
        Self {
            inner: Rc::clone(&self.inner),
            ctx: self.ctx.clone(),
        }
    }
}

impl JobScheduler {
    /// Create a scheduler on the given context
    pub fn new(ctx: &Context, config: SchedulerConfig) -> Result<Self> {
        config.validate()?;
        info!(
            "creating job scheduler: concurrency={}, auto_start={}",
            config.concurrency, config.auto_start
        );

        let is_running = config.auto_start;
        Ok(Self {
            inner: Rc::new(RefCell::new(SchedulerInner {
                is_running,
                config,
                next_id: 0,
                pending: Vec::new(),
                running: Vec::new(),
                jobs: HashMap::new(),
                completed: Vec::new(),
                stats: SchedulerStats::default(),
                idle: None,
                pump_scheduled: false,
                retry_waiting: 0,
            })),
            ctx: ctx.clone(),
        })
    }

    /// Admit a job; fails when the pending queue is at capacity
    pub fn add(
        &self,
        task: impl FnMut() -> Deferred<Value> + 'static,
        options: JobOptions,
    ) -> Result<JobId> {
        let (id, should_pump) = {
            let mut inner = self.inner.borrow_mut();
            if let Some(max) = inner.config.max_queue_size {
                if inner.pending.len() >= max {
                    return Err(Error::CapacityExceeded {
                        max_queue_size: max,
                    });
                }
            }

            inner.next_id += 1;
            let id = JobId::mint(inner.next_id);
            let job = Job::new(id.clone(), options);
            debug!(
                "job admitted: id={}, priority={}, retries={}",
                id, job.options.priority, job.options.retries
            );

            inner.jobs.insert(id.clone(), JobEntry::new(job, Box::new(task)));
            inner.pending.push(id.clone());
            Self::sort_pending(&mut inner);
            inner.stats.total_jobs += 1;
            (id, inner.is_running)
        };

        if should_pump {
            self.schedule_pump();
        }
        Ok(id)
    }

    /// Fluent admission: like [`add`](JobScheduler::add) but returns
    /// the scheduler for chaining. Purely an enqueue aid — chained
    /// jobs still run by priority under the concurrency cap.
    pub fn chain(
        &self,
        task: impl FnMut() -> Deferred<Value> + 'static,
        options: JobOptions,
    ) -> Result<&Self> {
        self.add(task, options)?;
        Ok(self)
    }

    /// Resume pumping after [`stop`](JobScheduler::stop)
    pub fn start(&self) {
        {
            let mut inner = self.inner.borrow_mut();
            if inner.is_running {
                return;
            }
            inner.is_running = true;
        }
        info!("scheduler started");
        self.schedule_pump();
    }

    /// Stop pumping and cancel all known work. Later admissions still
    /// enqueue; they run once [`start`](JobScheduler::start) is called.
    pub fn stop(&self) {
        self.inner.borrow_mut().is_running = false;
        info!("scheduler stopping, canceling known work");
        self.cancel_all();
    }

    /// Cancel one job wherever it currently is; true when the
    /// cancellation took effect
    pub fn cancel_job(&self, id: &JobId) -> bool {
        let now = self.ctx.now_ms();
        let handle = {
            let mut inner = self.inner.borrow_mut();
            let Some(state) = inner.jobs.get(id).map(|entry| entry.job.state) else {
                return false;
            };
            match state {
                JobState::Pending => {
                    inner.pending.retain(|queued| queued != id);
                    let Some(entry) = inner.jobs.get_mut(id) else {
                        return false;
                    };
                    entry.job.mark_canceled(now, Error::JobCanceled { job_id: id.clone() });
                    inner.stats.canceled_jobs += 1;
                    None
                }
                JobState::Running => {
                    let Some(handle) = inner.jobs.get_mut(id).and_then(|entry| entry.cancel.clone())
                    else {
                        return false;
                    };
                    Some(handle)
                }
                _ => return false,
            }
        };

        match handle {
            None => {
                info!("job canceled while pending: id={}", id);
                self.check_idle();
                true
            }
            Some(handle) => {
                info!("canceling running job: id={}", id);
                // Routing already holds a rejection handler, so the
                // cancellation never reaches the unhandled ledger; it
                // moves the job out of `running` and re-checks idle.
                handle.cancel_with(Error::JobCanceled { job_id: id.clone() })
            }
        }
    }

    /// Cancel every pending, running and retry-waiting job; returns
    /// the ids whose cancellation took effect
    pub fn cancel_all(&self) -> Vec<JobId> {
        let targets: Vec<JobId> = {
            let inner = self.inner.borrow();
            let mut targets = inner.pending.clone();
            targets.extend(inner.running.iter().cloned());

            let mut waiting: Vec<JobId> = inner
                .jobs
                .iter()
                .filter(|(id, entry)| {
                    entry.job.state == JobState::Pending && !targets.contains(id)
                })
                .map(|(id, _)| id.clone())
                .collect();
            waiting.sort_by(|a, b| a.as_str().cmp(b.as_str()));
            targets.extend(waiting);
            targets
        };

        let mut canceled = Vec::new();
        for id in targets {
            if self.cancel_job(&id) {
                canceled.push(id);
            }
        }
        self.check_idle();
        canceled
    }

    /// Snapshot of a job's introspectable state
    pub fn get_job(&self, id: &JobId) -> Option<Job> {
        self.inner.borrow().jobs.get(id).map(|entry| entry.job.clone())
    }

    /// Point-in-time scheduler snapshot
    pub fn get_status(&self) -> SchedulerStatus {
        let inner = self.inner.borrow();
        SchedulerStatus {
            is_running: inner.is_running,
            pending: inner.pending.clone(),
            running: inner.running.clone(),
            completed: inner.completed.len(),
            stats: inner.stats.clone(),
        }
    }

    /// A deferred view of one job: terminal jobs yield their recorded
    /// outcome, running jobs yield the live deferred value, anything
    /// else is a scheduler error
    pub fn wait_for_job(&self, id: &JobId) -> Result<Deferred<Value>> {
        let inner = self.inner.borrow();
        let Some(entry) = inner.jobs.get(id) else {
            return Err(Error::Scheduler(format!("job not found or not running: {id}")));
        };
        match entry.job.state {
            JobState::Completed => {
                let value = entry.job.result.clone().unwrap_or(Value::Null);
                Ok(self.ctx.resolved(value))
            }
            JobState::Failed | JobState::Canceled => {
                let error = entry.job.error.clone().unwrap_or_else(|| {
                    Error::Scheduler(format!("job {id} ended without error detail"))
                });
                Ok(self.ctx.rejected(error))
            }
            JobState::Running => entry.live.clone().ok_or_else(|| {
                Error::Scheduler(format!("job not found or not running: {id}"))
            }),
            JobState::Pending => {
                Err(Error::Scheduler(format!("job not found or not running: {id}")))
            }
        }
    }

    /// A signal that fulfills once nothing is pending, running or
    /// waiting on a retry. Calls before resolution share one signal;
    /// the slot clears afterwards so a later call arms a fresh one.
    pub fn on_idle(&self) -> Deferred<()> {
        let dv = {
            let mut inner = self.inner.borrow_mut();
            if let Some((dv, _)) = &inner.idle {
                return dv.clone();
            }
            let (dv, settler) = self.ctx.pending::<()>();
            inner.idle = Some((dv.clone(), settler));
            dv
        };
        // Armed before any further pump can observe it; if the system
        // is already idle this resolves immediately.
        self.check_idle();
        dv
    }

    fn sort_pending(inner: &mut SchedulerInner) {
        let SchedulerInner { pending, jobs, .. } = inner;
        pending.sort_by(|a, b| {
            let pa = jobs.get(a).map(|e| e.job.options.priority).unwrap_or_default();
            let pb = jobs.get(b).map(|e| e.job.options.priority).unwrap_or_default();
            pb.cmp(&pa)
        });
    }

    /// Coalesced pump trigger: admissions within one synchronous
    /// region are prioritized together before anything launches
    fn schedule_pump(&self) {
        {
            let mut inner = self.inner.borrow_mut();
            if inner.pump_scheduled {
                return;
            }
            inner.pump_scheduled = true;
        }
        let this = self.clone();
        self.ctx.schedule(Box::new(move || {
            this.inner.borrow_mut().pump_scheduled = false;
            this.pump();
        }));
    }

    fn pump(&self) {
        loop {
            let next = {
                let mut inner = self.inner.borrow_mut();
                if !inner.is_running
                    || inner.pending.is_empty()
                    || inner.running.len() >= inner.config.concurrency
                {
                    None
                } else {
                    let id = inner.pending.remove(0);
                    inner.running.push(id.clone());
                    Some(id)
                }
            };
            match next {
                Some(id) => self.launch(id),
                None => break,
            }
        }
        self.check_idle();
    }

    fn launch(&self, id: JobId) {
        let timeout_ms = {
            let mut inner = self.inner.borrow_mut();
            let Some(entry) = inner.jobs.get_mut(&id) else {
                warn!("launch skipped, job record missing: id={}", id);
                inner.running.retain(|running| running != &id);
                return;
            };
            entry.job.mark_started(self.ctx.now_ms());
            info!(
                "launching job: id={}, attempt={}, priority={}",
                id, entry.job.attempts, entry.job.options.priority
            );
            entry.job.options.timeout_ms
        };

        // Run the task with the scheduler borrow released; it may
        // talk back to the scheduler synchronously.
        let task_dv = {
            let mut task = {
                let mut inner = self.inner.borrow_mut();
                let Some(entry) = inner.jobs.get_mut(&id) else {
                    return;
                };
                let ctx = self.ctx.clone();
                std::mem::replace(
                    &mut entry.task,
                    Box::new(move || ctx.rejected(Error::Scheduler("job task unavailable".into()))),
                )
            };
            let produced = catch_unwind(AssertUnwindSafe(|| task()));
            {
                let mut inner = self.inner.borrow_mut();
                if let Some(entry) = inner.jobs.get_mut(&id) {
                    entry.task = task;
                }
            }
            match produced {
                Ok(dv) => dv,
                Err(payload) => self.ctx.rejected(Error::message(format!(
                    "job task panicked: {}",
                    panic_message(payload.as_ref())
                ))),
            }
        };

        // Cancellable mirror: scheduler cancellation rejects it while
        // the task's own deferred value keeps running cooperatively.
        // Progress flows through it into the job record.
        let (outer, cancel) = {
            let this = self.clone();
            let job_id = id.clone();
            self.ctx.cancellable::<Value, _>(move |settler| {
                let progress_settler = settler.clone();
                task_dv.progress(move |value| {
                    if let Some(pct) = value.as_f64() {
                        this.update_progress(&job_id, pct);
                    }
                    progress_settler.progress(value.clone());
                });
                task_dv.on_settle(move |settlement| match settlement {
                    Settlement::Fulfilled(value) => settler.resolve_quiet(value.clone()),
                    Settlement::Rejected(error) => settler.reject_quiet(error.clone()),
                });
            })
        };

        let live = if timeout_ms > 0 {
            outer.timeout_with(
                timeout_ms,
                Error::JobTimeout {
                    job_id: id.clone(),
                    timeout_ms,
                },
            )
        } else {
            outer
        };

        // Completion routing re-pumps at the tail.
        let this = self.clone();
        let fulfilled_id = id.clone();
        let that = self.clone();
        let failed_id = id.clone();
        live.then_catch(
            move |value| {
                this.route_fulfilled(&fulfilled_id, value);
                Resolution::Value(())
            },
            move |error| {
                that.route_failed(&failed_id, error);
                Resolution::Value(())
            },
        );

        let mut inner = self.inner.borrow_mut();
        if let Some(entry) = inner.jobs.get_mut(&id) {
            entry.live = Some(live);
            entry.cancel = Some(cancel);
        }
    }

    fn update_progress(&self, id: &JobId, pct: f64) {
        let mut inner = self.inner.borrow_mut();
        if let Some(entry) = inner.jobs.get_mut(id) {
            entry.job.progress = pct.clamp(0.0, 100.0);
        }
    }

    fn route_fulfilled(&self, id: &JobId, value: Value) {
        let now = self.ctx.now_ms();
        {
            let mut inner = self.inner.borrow_mut();
            inner.running.retain(|running| running != id);
            let duration = {
                let Some(entry) = inner.jobs.get_mut(id) else {
                    return;
                };
                if entry.job.state.is_terminal() {
                    return;
                }
                entry.job.mark_completed(now, value);
                entry.live = None;
                entry.cancel = None;
                entry.job.duration_ms().unwrap_or(0)
            };
            inner.completed.push(id.clone());
            inner.stats.record_completion(duration);
            info!("job completed: id={}, duration_ms={}", id, duration);
        }
        self.pump();
    }

    fn route_failed(&self, id: &JobId, error: Error) {
        let now = self.ctx.now_ms();
        let disposition = {
            let mut inner = self.inner.borrow_mut();
            inner.running.retain(|running| running != id);
            let disposition = {
                let Some(entry) = inner.jobs.get_mut(id) else {
                    return;
                };
                if entry.job.state.is_terminal() {
                    return;
                }
                entry.live = None;
                entry.cancel = None;

                if error.is_cancellation() {
                    entry.job.mark_canceled(now, error.clone());
                    Disposition::Canceled
                } else if entry.job.attempts <= entry.job.options.retries
                    && !error.is_job_timeout()
                {
                    let attempt = entry.job.attempts;
                    let delay_ms = entry
                        .job
                        .options
                        .backoff
                        .delay_for(attempt, entry.job.options.retry_delay_ms);
                    entry
                        .job
                        .retry_history
                        .record(RetryAttempt::new(attempt, error.clone(), delay_ms));
                    entry.job.revert_for_retry();
                    Disposition::Retry { delay_ms }
                } else {
                    entry.job.mark_failed(now, error.clone());
                    Disposition::Failed
                }
            };
            match &disposition {
                Disposition::Canceled => inner.stats.canceled_jobs += 1,
                Disposition::Retry { .. } => inner.retry_waiting += 1,
                Disposition::Failed => inner.stats.failed_jobs += 1,
            }
            disposition
        };

        match disposition {
            Disposition::Retry { delay_ms } => {
                warn!(
                    "job failed, retrying: id={}, error={}, delay_ms={}",
                    id, error, delay_ms
                );
                let this = self.clone();
                let id = id.clone();
                self.ctx.set_timer(delay_ms, move || this.requeue(id));
            }
            Disposition::Canceled => info!("job canceled: id={}", id),
            Disposition::Failed => warn!("job failed permanently: id={}, error={}", id, error),
        }
        self.pump();
    }

    fn requeue(&self, id: JobId) {
        {
            let mut inner = self.inner.borrow_mut();
            inner.retry_waiting = inner.retry_waiting.saturating_sub(1);
            let eligible = inner
                .jobs
                .get(&id)
                .map(|entry| entry.job.state == JobState::Pending)
                .unwrap_or(false);
            if eligible {
                inner.pending.push(id.clone());
                Self::sort_pending(&mut inner);
                debug!("job re-queued after retry delay: id={}", id);
            }
        }
        self.pump();
    }

    fn check_idle(&self) {
        let settler = {
            let mut inner = self.inner.borrow_mut();
            if inner.running.is_empty() && inner.pending.is_empty() && inner.retry_waiting == 0 {
                inner.idle.take().map(|(_, settler)| settler)
            } else {
                None
            }
        };
        if let Some(settler) = settler {
            debug!("scheduler idle");
            settler.resolve_quiet(());
        }
    }
}
