//! Execution context: configuration plus the run loop it drives
//!
//! A [`Context`] is a cheap-clone handle shared by every deferred value
//! and scheduler created from it. Constructors on
//! [`Deferred`](crate::Deferred) use the thread-local current context,
//! so simple callers never touch this type; anything that needs a
//! custom tick policy or an isolated clock creates its own.

use crate::config::{Config, Thunk, TickPolicy};
use crate::event_loop::{EventLoop, TimerId, UnhandledRejection};
use std::cell::RefCell;
use std::rc::Rc;

thread_local! {
    static CURRENT: RefCell<Option<Context>> = const { RefCell::new(None) };
}

/// Shared handle over a [`Config`] and its [`EventLoop`]
#[derive(Clone)]
pub struct Context {
    config: Rc<Config>,
    event_loop: Rc<RefCell<EventLoop>>,
}

impl Default for Context {
    fn default() -> Self {
        Self::new()
    }
}

impl Context {
    /// Fresh context with the default configuration
    pub fn new() -> Self {
        Self::with_config(Config::default())
    }

    /// Fresh context with an explicit configuration
    pub fn with_config(config: Config) -> Self {
        Self {
            config: Rc::new(config),
            event_loop: Rc::new(RefCell::new(EventLoop::new())),
        }
    }

    /// The thread-local current context, created on first use
    pub fn current() -> Context {
        CURRENT.with(|slot| {
            slot.borrow_mut()
                .get_or_insert_with(Context::new)
                .clone()
        })
    }

    /// Replace the thread-local current context, returning the previous one
    pub fn set_current(ctx: &Context) -> Option<Context> {
        CURRENT.with(|slot| slot.borrow_mut().replace(ctx.clone()))
    }

    /// Active configuration
    pub fn config(&self) -> &Config {
        &self.config
    }

    pub(crate) fn strict(&self) -> bool {
        self.config.strict
    }

    /// Defer a step out of the current synchronous region according to
    /// the configured tick policy
    pub fn schedule(&self, step: Thunk) {
        match &self.config.tick {
            TickPolicy::Microtask => self.event_loop.borrow_mut().enqueue_microtask(step),
            TickPolicy::Macrotask => {
                self.event_loop.borrow_mut().schedule_timer(0, step);
            }
            TickPolicy::Custom(dispatch) => dispatch(step),
        }
    }

    /// Arm a one-shot timer on the loop's virtual clock
    pub fn set_timer(&self, delay_ms: u64, callback: impl FnOnce() + 'static) -> TimerId {
        self.event_loop
            .borrow_mut()
            .schedule_timer(delay_ms, Box::new(callback))
    }

    /// Cancel a timer; returns false when it already fired
    pub fn cancel_timer(&self, id: TimerId) -> bool {
        self.event_loop.borrow_mut().cancel_timer(id)
    }

    /// Current virtual time in milliseconds
    pub fn now_ms(&self) -> u64 {
        self.event_loop.borrow().now_ms()
    }

    /// True while the loop holds queued microtasks or timers
    pub fn has_pending_work(&self) -> bool {
        self.event_loop.borrow().has_pending_work()
    }

    /// Drain one round of microtasks (including any they enqueue)
    /// without touching the clock
    pub fn tick(&self) {
        loop {
            let task = self.event_loop.borrow_mut().take_microtask();
            match task {
                Some(task) => task(),
                None => break,
            }
        }
    }

    /// Drive the loop until no microtask or timer remains, advancing
    /// the virtual clock to each due timer in turn
    pub fn run_until_idle(&self) {
        loop {
            self.tick();
            let timer = self.event_loop.borrow_mut().take_next_timer(None);
            match timer {
                Some(callback) => callback(),
                None => break,
            }
        }
    }

    /// Drive the loop for `ms` of virtual time; timers due later stay
    /// queued and the clock ends exactly `ms` ahead
    pub fn run_for(&self, ms: u64) {
        let deadline = self.now_ms() + ms;
        loop {
            self.tick();
            let timer = self.event_loop.borrow_mut().take_next_timer(Some(deadline));
            match timer {
                Some(callback) => callback(),
                None => break,
            }
        }
        self.event_loop.borrow_mut().advance_clock_to(deadline);
    }

    /// Drain the unhandled-rejection ledger
    pub fn take_unhandled(&self) -> Vec<UnhandledRejection> {
        self.event_loop.borrow_mut().take_unhandled()
    }

    pub(crate) fn report_unhandled(&self, rejection: UnhandledRejection) {
        self.event_loop.borrow_mut().report_unhandled(rejection);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;

    #[test]
    fn test_microtask_policy_runs_before_timers() {
        let ctx = Context::new();
        let order = Rc::new(RefCell::new(Vec::new()));

        let o = order.clone();
        ctx.set_timer(0, move || o.borrow_mut().push("timer"));
        let o = order.clone();
        ctx.schedule(Box::new(move || o.borrow_mut().push("micro")));

        ctx.run_until_idle();
        assert_eq!(*order.borrow(), vec!["micro", "timer"]);
    }

    #[test]
    fn test_macrotask_policy_defers_behind_queued_timers() {
        let ctx = Context::with_config(Config::new().with_tick(TickPolicy::Macrotask));
        let order = Rc::new(RefCell::new(Vec::new()));

        let o = order.clone();
        ctx.set_timer(0, move || o.borrow_mut().push("timer"));
        let o = order.clone();
        ctx.schedule(Box::new(move || o.borrow_mut().push("step")));

        ctx.run_until_idle();
        assert_eq!(*order.borrow(), vec!["timer", "step"]);
    }

    #[test]
    fn test_custom_policy_receives_steps() {
        let captured = Rc::new(RefCell::new(0u32));
        let captured_clone = captured.clone();
        let config = Config::new().with_tick(TickPolicy::Custom(Rc::new(move |step| {
            *captured_clone.borrow_mut() += 1;
            step();
        })));

        let ctx = Context::with_config(config);
        ctx.schedule(Box::new(|| {}));
        ctx.schedule(Box::new(|| {}));
        assert_eq!(*captured.borrow(), 2);
    }

    #[test]
    fn test_run_for_leaves_later_timers_queued() {
        let ctx = Context::new();
        let fired = Rc::new(RefCell::new(Vec::new()));

        let f = fired.clone();
        ctx.set_timer(10, move || f.borrow_mut().push("early"));
        let f = fired.clone();
        ctx.set_timer(100, move || f.borrow_mut().push("late"));

        ctx.run_for(50);
        assert_eq!(*fired.borrow(), vec!["early"]);
        assert_eq!(ctx.now_ms(), 50);
        assert!(ctx.has_pending_work());

        ctx.run_until_idle();
        assert_eq!(*fired.borrow(), vec!["early", "late"]);
    }

    #[test]
    fn test_current_context_is_stable_per_thread() {
        let a = Context::current();
        let b = Context::current();
        assert!(Rc::ptr_eq(&a.event_loop, &b.event_loop));

        let fresh = Context::new();
        Context::set_current(&fresh);
        let c = Context::current();
        assert!(Rc::ptr_eq(&c.event_loop, &fresh.event_loop));
    }
}
