//! Deferred values: single-assignment containers for eventual outcomes
//!
//! A [`Deferred`] settles exactly once, from `Pending` to either
//! `Fulfilled` or `Rejected`. Handlers registered through
//! [`then`](Deferred::then)/[`catch`](Deferred::catch) are always
//! dispatched through the context's tick policy, so a handler never
//! observes a half-settled source even when it is registered after
//! settlement. Settle hooks run synchronously at the settling site,
//! ahead of any chained continuation.
//!
//! Progress values emitted while pending are buffered and replayed to
//! subscribers; emissions after settlement are dropped.

mod combinators;
mod resolution;
mod scope;
mod timeout;

pub use resolution::{ChainLink, Resolution, Thenable};
pub use scope::ScopeHandle;

use crate::context::Context;
use crate::error::{Error, Result};
use crate::event_loop::UnhandledRejection;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::cell::RefCell;
use std::collections::VecDeque;
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe, Location};
use std::rc::Rc;

/// Progress values buffered for replay while pending; the oldest are
/// dropped past this point
const MAX_PROGRESS_BUFFER: usize = 1024;

/// Lifecycle phase of a deferred value
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DeferredState {
    /// Not yet settled
    Pending,

    /// Settled with a value
    Fulfilled,

    /// Settled with a rejection reason
    Rejected,
}

impl fmt::Display for DeferredState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeferredState::Pending => write!(f, "pending"),
            DeferredState::Fulfilled => write!(f, "fulfilled"),
            DeferredState::Rejected => write!(f, "rejected"),
        }
    }
}

/// A terminal outcome: the value or the rejection reason
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Settlement<T> {
    /// Fulfilled with a value
    Fulfilled(T),

    /// Rejected with a reason
    Rejected(Error),
}

impl<T> Settlement<T> {
    /// The state this settlement puts the deferred value in
    pub fn state(&self) -> DeferredState {
        match self {
            Settlement::Fulfilled(_) => DeferredState::Fulfilled,
            Settlement::Rejected(_) => DeferredState::Rejected,
        }
    }

    /// True for the fulfillment arm
    pub fn is_fulfilled(&self) -> bool {
        matches!(self, Settlement::Fulfilled(_))
    }

    /// The value, when fulfilled
    pub fn value(&self) -> Option<&T> {
        match self {
            Settlement::Fulfilled(value) => Some(value),
            Settlement::Rejected(_) => None,
        }
    }

    /// The reason, when rejected
    pub fn error(&self) -> Option<&Error> {
        match self {
            Settlement::Fulfilled(_) => None,
            Settlement::Rejected(error) => Some(error),
        }
    }
}

type FulfillFn<T> = Box<dyn FnOnce(T)>;
type RejectFn = Box<dyn FnOnce(Error)>;
type SettleHook<T> = Box<dyn FnOnce(&Settlement<T>)>;
type ProgressFn = Box<dyn FnMut(&Value)>;

struct Reaction<T> {
    on_fulfilled: Option<FulfillFn<T>>,
    on_rejected: Option<RejectFn>,
}

struct DvNode<T> {
    /// Sticky guard, set on the first settlement attempt — including
    /// thenable adoption that has not delivered yet
    settled: bool,
    outcome: Option<Settlement<T>>,
    reactions: VecDeque<Reaction<T>>,
    settle_hooks: VecDeque<SettleHook<T>>,
    progress_buf: Vec<Value>,
    progress_subs: Vec<ProgressFn>,
    progress_overflow_warned: bool,
    cancelable: bool,
    handled: bool,
    created_at: &'static Location<'static>,
    rejected_at: Option<&'static Location<'static>>,
}

/// Single-assignment container for an eventually known value or
/// rejection
pub struct Deferred<T> {
    node: Rc<RefCell<DvNode<T>>>,
    ctx: Context,
}

impl<T> Clone for Deferred<T> {
    fn clone(&self) -> Self {
        Self {
            node: Rc::clone(&self.node),
            ctx: self.ctx.clone(),
        }
    }
}

impl<T> fmt::Debug for Deferred<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let node = self.node.borrow();
        let state = match &node.outcome {
            None => DeferredState::Pending,
            Some(settlement) => settlement.state(),
        };
        f.debug_struct("Deferred")
            .field("state", &state)
            .field("created_at", &node.created_at.to_string())
            .finish()
    }
}

/// Settlement handle passed to executors: resolve, reject and emit
/// progress on the paired [`Deferred`]
pub struct Settler<T> {
    dv: Deferred<T>,
}

impl<T> Clone for Settler<T> {
    fn clone(&self) -> Self {
        Self { dv: self.dv.clone() }
    }
}

/// Cancellation handle returned by the cancellable constructor
pub struct CancelHandle<T> {
    dv: Deferred<T>,
}

impl<T> Clone for CancelHandle<T> {
    fn clone(&self) -> Self {
        Self { dv: self.dv.clone() }
    }
}

impl<T: Clone + 'static> CancelHandle<T> {
    /// Cancel with the default reason; true when the rejection landed
    #[track_caller]
    pub fn cancel(&self) -> bool {
        self.dv.cancel()
    }

    /// Cancel with an explicit reason
    #[track_caller]
    pub fn cancel_with(&self, reason: Error) -> bool {
        self.dv.cancel_with(reason)
    }

    /// The governed deferred value
    pub fn deferred(&self) -> Deferred<T> {
        self.dv.clone()
    }
}

impl Context {
    /// A pending deferred value and its settlement handle
    #[track_caller]
    pub fn pending<T: Clone + 'static>(&self) -> (Deferred<T>, Settler<T>) {
        let node = DvNode {
            settled: false,
            outcome: None,
            reactions: VecDeque::new(),
            settle_hooks: VecDeque::new(),
            progress_buf: Vec::new(),
            progress_subs: Vec::new(),
            progress_overflow_warned: false,
            cancelable: false,
            handled: false,
            created_at: Location::caller(),
            rejected_at: None,
        };
        let dv = Deferred {
            node: Rc::new(RefCell::new(node)),
            ctx: self.clone(),
        };
        let settler = Settler { dv: dv.clone() };
        (dv, settler)
    }

    /// Run `executor` synchronously against a fresh deferred value; a
    /// panic inside it is routed to rejection
    #[track_caller]
    pub fn deferred<T, F>(&self, executor: F) -> Deferred<T>
    where
        T: Clone + 'static,
        F: FnOnce(Settler<T>),
    {
        let (dv, settler) = self.pending();
        run_executor(settler, executor);
        dv
    }

    /// Like [`deferred`](Context::deferred), but the value is flagged
    /// cancelable and a [`CancelHandle`] is returned alongside it
    #[track_caller]
    pub fn cancellable<T, F>(&self, executor: F) -> (Deferred<T>, CancelHandle<T>)
    where
        T: Clone + 'static,
        F: FnOnce(Settler<T>),
    {
        let (dv, settler) = self.pending();
        dv.node.borrow_mut().cancelable = true;
        run_executor(settler, executor);
        let handle = CancelHandle { dv: dv.clone() };
        (dv, handle)
    }
}

fn run_executor<T, F>(settler: Settler<T>, executor: F)
where
    T: Clone + 'static,
    F: FnOnce(Settler<T>),
{
    let handle = settler.clone();
    if let Err(payload) = catch_unwind(AssertUnwindSafe(move || executor(handle))) {
        let message = format!("executor panicked: {}", panic_message(payload.as_ref()));
        settler.dv.settle_internal(Resolution::Failed(Error::message(message)));
    }
}

impl<T: Clone + 'static> Deferred<T> {
    /// Construct against the thread-local current context
    #[track_caller]
    pub fn new(executor: impl FnOnce(Settler<T>)) -> Self {
        Context::current().deferred(executor)
    }

    /// A pending value and its settlement handle, on the current context
    #[track_caller]
    pub fn pending() -> (Deferred<T>, Settler<T>) {
        Context::current().pending()
    }

    /// Cancellable constructor on the current context
    #[track_caller]
    pub fn cancellable(executor: impl FnOnce(Settler<T>)) -> (Deferred<T>, CancelHandle<T>) {
        Context::current().cancellable(executor)
    }

    /// The context this value dispatches on
    pub fn context(&self) -> &Context {
        &self.ctx
    }

    /// Current lifecycle phase
    pub fn state(&self) -> DeferredState {
        match &self.node.borrow().outcome {
            None => DeferredState::Pending,
            Some(settlement) => settlement.state(),
        }
    }

    /// The fulfillment value; an error in any other state
    pub fn value(&self) -> Result<T> {
        match &self.node.borrow().outcome {
            Some(Settlement::Fulfilled(value)) => Ok(value.clone()),
            Some(Settlement::Rejected(_)) => Err(Error::InvalidState(
                "value read on a rejected deferred value".into(),
            )),
            None => Err(Error::InvalidState(
                "value read on a pending deferred value".into(),
            )),
        }
    }

    /// The rejection reason; an error in any other state. Reading the
    /// reason counts as observing the rejection.
    pub fn reason(&self) -> Result<Error> {
        let mut node = self.node.borrow_mut();
        match &node.outcome {
            Some(Settlement::Rejected(error)) => {
                let error = error.clone();
                node.handled = true;
                Ok(error)
            }
            Some(Settlement::Fulfilled(_)) => Err(Error::InvalidState(
                "reason read on a fulfilled deferred value".into(),
            )),
            None => Err(Error::InvalidState(
                "reason read on a pending deferred value".into(),
            )),
        }
    }

    /// The settlement, if any
    pub fn settlement(&self) -> Option<Settlement<T>> {
        self.node.borrow().outcome.clone()
    }

    /// True when created through the cancellable constructor
    pub fn is_cancelable(&self) -> bool {
        self.node.borrow().cancelable
    }

    /// Creation site, plus the rejection site once rejected
    pub fn trace(&self) -> String {
        let node = self.node.borrow();
        match node.rejected_at {
            Some(site) => format!("created at {}\nrejected at {}", node.created_at, site),
            None => format!("created at {}", node.created_at),
        }
    }

    /// Suppress unhandled-rejection reporting for this value
    pub fn mark_handled(&self) {
        self.node.borrow_mut().handled = true;
    }

    /// Chain a fulfillment handler; rejections pass through unchanged
    #[track_caller]
    pub fn then<U, F>(&self, on_fulfilled: F) -> Deferred<U>
    where
        U: Clone + 'static,
        F: FnOnce(T) -> Resolution<U> + 'static,
    {
        let (target, _settler) = self.ctx.pending::<U>();
        let t = target.clone();
        let on_f: FulfillFn<T> = Box::new(move |value| run_handler(&t, move || on_fulfilled(value)));
        let t = target.clone();
        let on_r: RejectFn = Box::new(move |error| t.reject_internal(error));
        self.register(Some(on_f), Some(on_r));
        target
    }

    /// Chain a rejection handler; values pass through unchanged
    #[track_caller]
    pub fn catch<F>(&self, on_rejected: F) -> Deferred<T>
    where
        F: FnOnce(Error) -> Resolution<T> + 'static,
    {
        let (target, _settler) = self.ctx.pending::<T>();
        let t = target.clone();
        let on_f: FulfillFn<T> = Box::new(move |value| t.fulfill_internal(value));
        let t = target.clone();
        let on_r: RejectFn = Box::new(move |error| run_handler(&t, move || on_rejected(error)));
        self.register(Some(on_f), Some(on_r));
        target
    }

    /// Chain both arms at once
    #[track_caller]
    pub fn then_catch<U, F, R>(&self, on_fulfilled: F, on_rejected: R) -> Deferred<U>
    where
        U: Clone + 'static,
        F: FnOnce(T) -> Resolution<U> + 'static,
        R: FnOnce(Error) -> Resolution<U> + 'static,
    {
        let (target, _settler) = self.ctx.pending::<U>();
        let t = target.clone();
        let on_f: FulfillFn<T> = Box::new(move |value| run_handler(&t, move || on_fulfilled(value)));
        let t = target.clone();
        let on_r: RejectFn = Box::new(move |error| run_handler(&t, move || on_rejected(error)));
        self.register(Some(on_f), Some(on_r));
        target
    }

    /// Plain value mapping, sugar over [`then`](Deferred::then)
    #[track_caller]
    pub fn map<U, F>(&self, f: F) -> Deferred<U>
    where
        U: Clone + 'static,
        F: FnOnce(T) -> U + 'static,
    {
        self.then(move |value| Resolution::Value(f(value)))
    }

    /// Run `f` on either outcome, await anything it returns, then
    /// re-emit the original outcome; a failure from `f` replaces it
    #[track_caller]
    pub fn finally<R, F>(&self, f: F) -> Deferred<T>
    where
        R: Into<Resolution<()>>,
        F: FnOnce() -> R + 'static,
    {
        let (target, _settler) = self.ctx.pending::<T>();
        let t = target.clone();
        let ctx = self.ctx.clone();
        self.subscribe(move |settlement| {
            let settlement = settlement.clone();
            let (cleanup, _cs) = ctx.pending::<()>();
            match catch_unwind(AssertUnwindSafe(move || f().into())) {
                Ok(resolution) => cleanup.settle_internal(resolution),
                Err(payload) => cleanup.reject_internal(Error::message(format!(
                    "cleanup panicked: {}",
                    panic_message(payload.as_ref())
                ))),
            }
            cleanup.subscribe(move |cleanup_outcome| match cleanup_outcome {
                Settlement::Fulfilled(_) => match settlement {
                    Settlement::Fulfilled(value) => t.fulfill_internal(value),
                    Settlement::Rejected(error) => t.reject_internal(error),
                },
                Settlement::Rejected(error) => t.reject_internal(error.clone()),
            });
        });
        target
    }

    /// Register a settlement hook: synchronous at settlement, before
    /// any chained continuation; synchronous immediately when already
    /// settled. Panics inside hooks are logged and swallowed.
    pub fn on_settle(&self, hook: impl FnOnce(&Settlement<T>) + 'static) -> Deferred<T> {
        let mut node = self.node.borrow_mut();
        node.handled = true;
        if let Some(settlement) = node.outcome.clone() {
            drop(node);
            run_hook(Box::new(hook), &settlement);
        } else {
            node.settle_hooks.push_back(Box::new(hook));
        }
        self.clone()
    }

    /// Subscribe to progress emissions; everything already buffered is
    /// replayed synchronously. Registration after settlement delivers
    /// nothing. Panics inside subscribers are logged and swallowed.
    pub fn progress(&self, subscriber: impl FnMut(&Value) + 'static) -> Deferred<T> {
        let mut subscriber = Box::new(subscriber) as ProgressFn;
        let buffered = {
            let node = self.node.borrow();
            if node.outcome.is_some() {
                None
            } else {
                Some(node.progress_buf.clone())
            }
        };
        let Some(buffered) = buffered else {
            return self.clone();
        };
        for value in &buffered {
            run_progress(&mut subscriber, value);
        }
        let mut node = self.node.borrow_mut();
        if node.outcome.is_none() {
            node.progress_subs.push(subscriber);
        }
        self.clone()
    }

    /// Cancel with the default reason; see [`cancel_with`](Deferred::cancel_with)
    #[track_caller]
    pub fn cancel(&self) -> bool {
        self.cancel_with(Error::canceled("deferred value canceled"))
    }

    /// Reject with a cancellation reason iff this value is cancelable
    /// and still pending; returns false (no side effect) otherwise
    #[track_caller]
    pub fn cancel_with(&self, reason: Error) -> bool {
        {
            let mut node = self.node.borrow_mut();
            if !node.cancelable || node.settled {
                return false;
            }
            node.settled = true;
        }
        self.apply_resolution(Resolution::Failed(reason));
        true
    }

    /// Register one settlement continuation covering both arms,
    /// dispatched through the tick policy
    pub(crate) fn subscribe(&self, f: impl FnOnce(&Settlement<T>) + 'static) {
        let cell = Rc::new(RefCell::new(Some(f)));
        let c = cell.clone();
        let on_f: FulfillFn<T> = Box::new(move |value| {
            if let Some(f) = c.borrow_mut().take() {
                f(&Settlement::Fulfilled(value));
            }
        });
        let on_r: RejectFn = Box::new(move |error| {
            if let Some(f) = cell.borrow_mut().take() {
                f(&Settlement::Rejected(error));
            }
        });
        self.register(Some(on_f), Some(on_r));
    }

    fn register(&self, on_fulfilled: Option<FulfillFn<T>>, on_rejected: Option<RejectFn>) {
        let mut node = self.node.borrow_mut();
        node.handled = true;
        match node.outcome.clone() {
            None => node.reactions.push_back(Reaction {
                on_fulfilled,
                on_rejected,
            }),
            Some(Settlement::Fulfilled(value)) => {
                drop(node);
                if let Some(f) = on_fulfilled {
                    self.ctx.schedule(Box::new(move || f(value)));
                }
            }
            Some(Settlement::Rejected(error)) => {
                drop(node);
                if let Some(f) = on_rejected {
                    self.ctx.schedule(Box::new(move || f(error)));
                }
            }
        }
    }

    /// Settlement attempt from a [`Settler`]: conflicts follow the
    /// configured double-settle policy
    #[track_caller]
    fn external_settle(&self, resolution: Resolution<T>) {
        {
            let mut node = self.node.borrow_mut();
            if node.settled {
                drop(node);
                self.settle_conflict();
                return;
            }
            node.settled = true;
        }
        self.apply_resolution(resolution);
    }

    fn settle_conflict(&self) {
        if self.ctx.strict() {
            panic!(
                "deferred value settled twice (created at {})",
                self.node.borrow().created_at
            );
        }
        tracing::warn!(
            "ignoring settle on an already-settled deferred value: created_at={}",
            self.node.borrow().created_at
        );
    }

    /// Quiet settlement attempt: silently dropped once settled
    #[track_caller]
    pub(crate) fn settle_internal(&self, resolution: Resolution<T>) {
        {
            let mut node = self.node.borrow_mut();
            if node.settled {
                return;
            }
            node.settled = true;
        }
        self.apply_resolution(resolution);
    }

    /// The resolution procedure, past the sticky guard
    #[track_caller]
    pub(crate) fn apply_resolution(&self, resolution: Resolution<T>) {
        match resolution {
            Resolution::Value(value) => self.fulfill_internal(value),
            Resolution::Failed(error) => self.reject_internal(error),
            Resolution::Deferred(other) => {
                if Rc::ptr_eq(&self.node, &other.node) {
                    self.reject_internal(Error::SelfResolution);
                } else {
                    self.adopt(Box::new(other));
                }
            }
            Resolution::Chain(thenable) => self.adopt(thenable),
        }
    }

    fn adopt(&self, thenable: Box<dyn Thenable<T>>) {
        let link = ChainLink::new(self.clone());
        let delivery = link.clone();
        let outcome = catch_unwind(AssertUnwindSafe(move || thenable.chain(delivery)));
        if let Err(payload) = outcome {
            if !link.delivered() {
                link.fail(Error::message(format!(
                    "thenable panicked: {}",
                    panic_message(payload.as_ref())
                )));
            }
        }
    }

    #[track_caller]
    pub(crate) fn fulfill_internal(&self, value: T) {
        self.complete(Settlement::Fulfilled(value));
    }

    #[track_caller]
    pub(crate) fn reject_internal(&self, error: Error) {
        self.complete(Settlement::Rejected(error));
    }

    #[track_caller]
    fn complete(&self, settlement: Settlement<T>) {
        let site = Location::caller();
        let (hooks, reactions) = {
            let mut node = self.node.borrow_mut();
            if node.outcome.is_some() {
                return;
            }
            node.settled = true;
            if let Settlement::Rejected(_) = &settlement {
                node.rejected_at = Some(site);
            }
            node.outcome = Some(settlement.clone());
            node.progress_buf.clear();
            node.progress_subs.clear();
            (
                std::mem::take(&mut node.settle_hooks),
                std::mem::take(&mut node.reactions),
            )
        };

        for hook in hooks {
            run_hook(hook, &settlement);
        }

        match &settlement {
            Settlement::Fulfilled(value) => {
                for reaction in reactions {
                    if let Some(f) = reaction.on_fulfilled {
                        let value = value.clone();
                        self.ctx.schedule(Box::new(move || f(value)));
                    }
                }
            }
            Settlement::Rejected(error) => {
                for reaction in reactions {
                    if let Some(f) = reaction.on_rejected {
                        let error = error.clone();
                        self.ctx.schedule(Box::new(move || f(error)));
                    }
                }
                self.watch_unhandled();
            }
        }
    }

    /// After the settling turn, report the rejection if nothing has
    /// registered interest by then
    fn watch_unhandled(&self) {
        let node = self.node.clone();
        let ctx = self.ctx.clone();
        self.ctx.schedule(Box::new(move || {
            let mut n = node.borrow_mut();
            if n.handled {
                return;
            }
            n.handled = true;
            if let Some(Settlement::Rejected(error)) = &n.outcome {
                let rejection = UnhandledRejection {
                    created_at: n.created_at,
                    error: error.clone(),
                };
                drop(n);
                ctx.report_unhandled(rejection);
            }
        }));
    }

    /// Emit a progress value: buffered and fanned out while pending,
    /// silently dropped after settlement
    pub(crate) fn emit_progress(&self, value: Value) {
        let mut subs = {
            let mut node = self.node.borrow_mut();
            if node.settled {
                return;
            }
            if node.progress_buf.len() >= MAX_PROGRESS_BUFFER {
                if !node.progress_overflow_warned {
                    node.progress_overflow_warned = true;
                    tracing::warn!(
                        "progress buffer full, dropping oldest values: cap={}",
                        MAX_PROGRESS_BUFFER
                    );
                }
                node.progress_buf.remove(0);
            }
            node.progress_buf.push(value.clone());
            std::mem::take(&mut node.progress_subs)
        };

        for sub in subs.iter_mut() {
            run_progress(sub, &value);
        }

        let mut node = self.node.borrow_mut();
        if node.outcome.is_none() {
            let added = std::mem::take(&mut node.progress_subs);
            subs.extend(added);
            node.progress_subs = subs;
        }
    }
}

impl<T: Clone + 'static> Settler<T> {
    /// Fulfill with a plain value
    #[track_caller]
    pub fn resolve(&self, value: T) {
        self.dv.external_settle(Resolution::Value(value));
    }

    /// Run the full resolution procedure: values fulfill, deferred
    /// values and thenables are adopted
    #[track_caller]
    pub fn resolve_with(&self, resolution: Resolution<T>) {
        self.dv.external_settle(resolution);
    }

    /// Reject with a reason
    #[track_caller]
    pub fn reject(&self, error: Error) {
        self.dv.external_settle(Resolution::Failed(error));
    }

    /// Emit a progress value; dropped once settled
    pub fn progress(&self, value: Value) {
        self.dv.emit_progress(value);
    }

    /// True once a settlement attempt has been made
    pub fn is_settled(&self) -> bool {
        self.dv.node.borrow().settled
    }

    /// The paired deferred value
    pub fn deferred(&self) -> Deferred<T> {
        self.dv.clone()
    }

    #[track_caller]
    pub(crate) fn resolve_quiet(&self, value: T) {
        self.dv.settle_internal(Resolution::Value(value));
    }

    #[track_caller]
    pub(crate) fn reject_quiet(&self, error: Error) {
        self.dv.settle_internal(Resolution::Failed(error));
    }
}

impl<T: Clone + 'static> Thenable<T> for Deferred<T> {
    fn chain(self: Box<Self>, link: ChainLink<T>) {
        self.subscribe(move |settlement| match settlement {
            Settlement::Fulfilled(value) => link.fulfill(Resolution::Value(value.clone())),
            Settlement::Rejected(error) => link.fail(error.clone()),
        });
    }
}

fn run_handler<U: Clone + 'static>(target: &Deferred<U>, f: impl FnOnce() -> Resolution<U>) {
    match catch_unwind(AssertUnwindSafe(f)) {
        Ok(resolution) => target.settle_internal(resolution),
        Err(payload) => target.reject_internal(Error::message(format!(
            "handler panicked: {}",
            panic_message(payload.as_ref())
        ))),
    }
}

fn run_hook<T>(hook: SettleHook<T>, settlement: &Settlement<T>) {
    if let Err(payload) = catch_unwind(AssertUnwindSafe(move || hook(settlement))) {
        tracing::warn!("settle hook panicked: {}", panic_message(payload.as_ref()));
    }
}

fn run_progress(subscriber: &mut ProgressFn, value: &Value) {
    if let Err(payload) = catch_unwind(AssertUnwindSafe(move || subscriber(value))) {
        tracing::warn!(
            "progress subscriber panicked: {}",
            panic_message(payload.as_ref())
        );
    }
}

pub(crate) fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::cell::Cell;

    #[test]
    fn test_executor_runs_synchronously() {
        let ctx = Context::new();
        let ran = Rc::new(Cell::new(false));
        let r = ran.clone();
        let dv: Deferred<i32> = ctx.deferred(move |_settler| r.set(true));
        assert!(ran.get());
        assert_eq!(dv.state(), DeferredState::Pending);
    }

    #[test]
    fn test_resolve_settles_once() {
        let ctx = Context::new();
        let (dv, settler) = ctx.pending::<i32>();
        settler.resolve(1);
        settler.resolve_quiet(2);
        assert_eq!(dv.value().unwrap(), 1);
        assert_eq!(dv.state(), DeferredState::Fulfilled);
    }

    #[test]
    fn test_reject_after_resolve_is_dropped() {
        let ctx = Context::new();
        let (dv, settler) = ctx.pending::<i32>();
        settler.resolve(7);
        settler.reject_quiet(Error::message("late"));
        assert_eq!(dv.state(), DeferredState::Fulfilled);
        assert_eq!(dv.value().unwrap(), 7);
    }

    #[test]
    #[should_panic(expected = "settled twice")]
    fn test_strict_double_settle_panics() {
        let ctx = Context::with_config(crate::Config::new().with_strict(true));
        let (_dv, settler) = ctx.pending::<i32>();
        settler.resolve(1);
        settler.resolve(2);
    }

    #[test]
    fn test_executor_panic_rejects() {
        let ctx = Context::new();
        let dv: Deferred<i32> = ctx.deferred(|_settler| panic!("exploded"));
        match dv.reason().unwrap() {
            Error::Message(message) => assert!(message.contains("exploded")),
            other => panic!("unexpected reason: {other:?}"),
        }
    }

    #[test]
    fn test_handler_dispatch_is_asynchronous() {
        let ctx = Context::new();
        let dv = ctx.resolved(1);
        let seen = Rc::new(Cell::new(false));
        let s = seen.clone();
        dv.map(move |v| {
            s.set(true);
            v
        });
        assert!(!seen.get());
        ctx.run_until_idle();
        assert!(seen.get());
    }

    #[test]
    fn test_handlers_run_in_registration_order() {
        let ctx = Context::new();
        let (dv, settler) = ctx.pending::<i32>();
        let order = Rc::new(RefCell::new(Vec::new()));

        for label in ["first", "second", "third"] {
            let order = order.clone();
            dv.map(move |v| {
                order.borrow_mut().push(label);
                v
            });
        }
        settler.resolve(0);
        ctx.run_until_idle();
        assert_eq!(*order.borrow(), vec!["first", "second", "third"]);
    }

    #[test]
    fn test_then_chains_transformed_value() {
        let ctx = Context::new();
        let (dv, settler) = ctx.pending::<i32>();
        let chained = dv.map(|v| v + 1).map(|v| v * 10);
        settler.resolve(4);
        ctx.run_until_idle();
        assert_eq!(chained.value().unwrap(), 50);
    }

    #[test]
    fn test_then_can_return_a_deferred() {
        let ctx = Context::new();
        let (inner, inner_settler) = ctx.pending::<i32>();
        let chained = ctx.resolved(1).then(move |_| Resolution::Deferred(inner));
        ctx.run_until_idle();
        assert_eq!(chained.state(), DeferredState::Pending);

        inner_settler.resolve(99);
        ctx.run_until_idle();
        assert_eq!(chained.value().unwrap(), 99);
    }

    #[test]
    fn test_rejection_passes_through_then() {
        let ctx = Context::new();
        let dv: Deferred<i32> = ctx.rejected(Error::message("boom"));
        let chained = dv.map(|v| v + 1);
        ctx.run_until_idle();
        assert_eq!(chained.reason().unwrap(), Error::message("boom"));
    }

    #[test]
    fn test_value_passes_through_catch() {
        let ctx = Context::new();
        let dv = ctx.resolved(5);
        let chained = dv.catch(|_| Resolution::Value(0));
        ctx.run_until_idle();
        assert_eq!(chained.value().unwrap(), 5);
    }

    #[test]
    fn test_catch_recovers() {
        let ctx = Context::new();
        let dv: Deferred<i32> = ctx.rejected(Error::message("boom"));
        let chained = dv.catch(|_| Resolution::Value(42));
        ctx.run_until_idle();
        assert_eq!(chained.value().unwrap(), 42);
    }

    #[test]
    fn test_handler_panic_rejects_chained_value() {
        let ctx = Context::new();
        let chained: Deferred<i32> = ctx.resolved(1).then(|_| -> Resolution<i32> {
            panic!("handler blew up");
        });
        ctx.run_until_idle();
        match chained.reason().unwrap() {
            Error::Message(message) => assert!(message.contains("handler blew up")),
            other => panic!("unexpected reason: {other:?}"),
        }
    }

    #[test]
    fn test_self_resolution_rejects_with_type_error() {
        let ctx = Context::new();
        let (dv, settler) = ctx.pending::<i32>();
        settler.resolve_with(Resolution::Deferred(dv.clone()));
        assert_eq!(dv.reason().unwrap(), Error::SelfResolution);
    }

    #[test]
    fn test_finally_runs_on_both_outcomes_and_reemits() {
        let ctx = Context::new();
        let count = Rc::new(Cell::new(0u32));

        let c = count.clone();
        let ok = ctx.resolved(3).finally(move || c.set(c.get() + 1));
        let c = count.clone();
        let err: Deferred<i32> = ctx
            .rejected::<i32>(Error::message("nope"))
            .finally(move || c.set(c.get() + 1));

        ctx.run_until_idle();
        assert_eq!(count.get(), 2);
        assert_eq!(ok.value().unwrap(), 3);
        assert_eq!(err.reason().unwrap(), Error::message("nope"));
    }

    #[test]
    fn test_finally_awaits_returned_deferred() {
        let ctx = Context::new();
        let (gate, gate_settler) = ctx.pending::<()>();
        let chained = ctx.resolved(8).finally(move || gate);

        ctx.run_until_idle();
        assert_eq!(chained.state(), DeferredState::Pending);

        gate_settler.resolve(());
        ctx.run_until_idle();
        assert_eq!(chained.value().unwrap(), 8);
    }

    #[test]
    fn test_on_settle_fires_before_continuations() {
        let ctx = Context::new();
        let (dv, settler) = ctx.pending::<i32>();
        let order = Rc::new(RefCell::new(Vec::new()));

        let o = order.clone();
        dv.map(move |v| {
            o.borrow_mut().push("continuation");
            v
        });
        let o = order.clone();
        dv.on_settle(move |_| o.borrow_mut().push("hook"));

        settler.resolve(1);
        ctx.run_until_idle();
        assert_eq!(*order.borrow(), vec!["hook", "continuation"]);
    }

    #[test]
    fn test_on_settle_after_settlement_is_synchronous() {
        let ctx = Context::new();
        let dv = ctx.resolved(2);
        let seen = Rc::new(RefCell::new(None));
        let s = seen.clone();
        dv.on_settle(move |settlement| *s.borrow_mut() = settlement.value().copied());
        assert_eq!(*seen.borrow(), Some(2));
    }

    #[test]
    fn test_hook_panic_is_swallowed() {
        let ctx = Context::new();
        let (dv, settler) = ctx.pending::<i32>();
        dv.on_settle(|_| panic!("hook panic"));
        settler.resolve(1);
        assert_eq!(dv.value().unwrap(), 1);
    }

    #[test]
    fn test_progress_replays_buffer_in_order() {
        let ctx = Context::new();
        let (dv, settler) = ctx.pending::<i32>();
        settler.progress(json!(1));
        settler.progress(json!(2));

        let seen = Rc::new(RefCell::new(Vec::new()));
        let s = seen.clone();
        dv.progress(move |value| s.borrow_mut().push(value.clone()));
        assert_eq!(*seen.borrow(), vec![json!(1), json!(2)]);

        settler.progress(json!(3));
        assert_eq!(*seen.borrow(), vec![json!(1), json!(2), json!(3)]);
    }

    #[test]
    fn test_progress_after_settlement_is_dropped() {
        let ctx = Context::new();
        let (dv, settler) = ctx.pending::<i32>();
        let seen = Rc::new(RefCell::new(Vec::new()));
        let s = seen.clone();
        dv.progress(move |value| s.borrow_mut().push(value.clone()));

        settler.resolve(1);
        settler.progress(json!("late"));
        assert!(seen.borrow().is_empty());

        // Subscribers registered after settlement receive nothing.
        let late = Rc::new(RefCell::new(Vec::new()));
        let l = late.clone();
        dv.progress(move |value| l.borrow_mut().push(value.clone()));
        assert!(late.borrow().is_empty());
    }

    #[test]
    fn test_progress_subscriber_panic_is_swallowed() {
        let ctx = Context::new();
        let (dv, settler) = ctx.pending::<i32>();
        dv.progress(|_| panic!("subscriber panic"));
        settler.progress(json!(1));
        settler.resolve(2);
        assert_eq!(dv.value().unwrap(), 2);
    }

    #[test]
    fn test_cancel_requires_cancelable_flag() {
        let ctx = Context::new();
        let (dv, _settler) = ctx.pending::<i32>();
        assert!(!dv.cancel());
        assert_eq!(dv.state(), DeferredState::Pending);
    }

    #[test]
    fn test_cancellable_rejects_while_pending() {
        let ctx = Context::new();
        let (dv, handle) = ctx.cancellable::<i32, _>(|_settler| {});
        assert!(dv.is_cancelable());
        assert!(handle.cancel());
        assert!(dv.reason().unwrap().is_cancellation());
        assert!(!handle.cancel());
    }

    #[test]
    fn test_cancel_after_settlement_is_a_no_op() {
        let ctx = Context::new();
        let (dv, handle) = ctx.cancellable::<i32, _>(|settler| settler.resolve(1));
        assert!(!handle.cancel());
        assert_eq!(dv.value().unwrap(), 1);
    }

    #[test]
    fn test_accessors_enforce_state() {
        let ctx = Context::new();
        let (dv, settler) = ctx.pending::<i32>();
        assert!(matches!(dv.value(), Err(Error::InvalidState(_))));
        assert!(matches!(dv.reason(), Err(Error::InvalidState(_))));

        settler.resolve(1);
        assert!(dv.value().is_ok());
        assert!(matches!(dv.reason(), Err(Error::InvalidState(_))));
    }

    #[test]
    fn test_trace_includes_rejection_site() {
        let ctx = Context::new();
        let (dv, settler) = ctx.pending::<i32>();
        assert!(dv.trace().starts_with("created at"));
        assert!(!dv.trace().contains("rejected at"));

        settler.reject(Error::message("x"));
        let _ = dv.reason();
        assert!(dv.trace().contains("rejected at"));
    }

    #[test]
    fn test_malformed_thenable_delivers_once() {
        struct Misbehaving;
        impl Thenable<i32> for Misbehaving {
            fn chain(self: Box<Self>, link: ChainLink<i32>) {
                link.fulfill(Resolution::Value(1));
                link.fulfill(Resolution::Value(2));
                link.fail(Error::message("too late"));
            }
        }

        let ctx = Context::new();
        let (dv, settler) = ctx.pending::<i32>();
        settler.resolve_with(Resolution::Chain(Box::new(Misbehaving)));
        ctx.run_until_idle();
        assert_eq!(dv.value().unwrap(), 1);
    }

    #[test]
    fn test_thenable_panic_rejects_unless_delivered() {
        struct PanicsAfterDelivery;
        impl Thenable<i32> for PanicsAfterDelivery {
            fn chain(self: Box<Self>, link: ChainLink<i32>) {
                link.fulfill(Resolution::Value(5));
                panic!("after delivery");
            }
        }
        struct PanicsBeforeDelivery;
        impl Thenable<i32> for PanicsBeforeDelivery {
            fn chain(self: Box<Self>, _link: ChainLink<i32>) {
                panic!("before delivery");
            }
        }

        let ctx = Context::new();
        let (delivered, settler) = ctx.pending::<i32>();
        settler.resolve_with(Resolution::Chain(Box::new(PanicsAfterDelivery)));
        ctx.run_until_idle();
        assert_eq!(delivered.value().unwrap(), 5);

        let (broken, settler) = ctx.pending::<i32>();
        settler.resolve_with(Resolution::Chain(Box::new(PanicsBeforeDelivery)));
        ctx.run_until_idle();
        match broken.reason().unwrap() {
            Error::Message(message) => assert!(message.contains("before delivery")),
            other => panic!("unexpected reason: {other:?}"),
        }
    }

    #[test]
    fn test_adopting_a_deferred_is_exclusive_of_later_settles() {
        let ctx = Context::new();
        let (inner, inner_settler) = ctx.pending::<i32>();
        let (dv, settler) = ctx.pending::<i32>();

        settler.resolve_with(Resolution::Deferred(inner));
        // The sticky guard is set: direct settles are now conflicts.
        settler.resolve_quiet(123);
        assert_eq!(dv.state(), DeferredState::Pending);

        inner_settler.resolve(9);
        ctx.run_until_idle();
        assert_eq!(dv.value().unwrap(), 9);
    }

    #[test]
    fn test_unhandled_rejection_is_reported_once() {
        let ctx = Context::new();
        let (_dv, settler) = ctx.pending::<i32>();
        settler.reject(Error::message("nobody listening"));
        ctx.run_until_idle();

        let unhandled = ctx.take_unhandled();
        assert_eq!(unhandled.len(), 1);
        assert_eq!(unhandled[0].error, Error::message("nobody listening"));
        assert!(ctx.take_unhandled().is_empty());
    }

    #[test]
    fn test_mark_handled_suppresses_reporting() {
        let ctx = Context::new();
        let (dv, settler) = ctx.pending::<i32>();
        dv.mark_handled();
        settler.reject(Error::message("quiet"));
        ctx.run_until_idle();
        assert!(ctx.take_unhandled().is_empty());
    }

    #[test]
    fn test_catch_registration_suppresses_reporting() {
        let ctx = Context::new();
        let dv: Deferred<i32> = ctx.rejected(Error::message("caught"));
        let recovered = dv.catch(|_| Resolution::Value(0));
        ctx.run_until_idle();
        assert!(ctx.take_unhandled().is_empty());
        assert_eq!(recovered.value().unwrap(), 0);
    }
}
