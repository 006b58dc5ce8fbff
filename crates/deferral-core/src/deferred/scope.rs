//! Structured scopes: a cooperative sub-region of related work
//!
//! A scope runs a task that registers children through its handle.
//! The first child rejection fails the whole scope and cancels the
//! still-pending cancelable siblings; otherwise the scope waits for
//! every child to settle before fulfilling with the task's own value.

use crate::context::Context;
use crate::deferred::{panic_message, Deferred, Resolution, Settlement};
use crate::error::Error;
use std::cell::RefCell;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::rc::Rc;

struct ScopeState {
    /// Adds are only valid while the task body runs
    open: bool,
    failed: bool,
    monitors: Vec<Deferred<()>>,
    cancels: Vec<Box<dyn Fn(Error) -> bool>>,
    /// Rejects the scope result if it is still pending
    fail: Rc<dyn Fn(Error)>,
}

/// Handle passed to a scope task for registering children
#[derive(Clone)]
pub struct ScopeHandle {
    inner: Rc<RefCell<ScopeState>>,
    ctx: Context,
}

impl ScopeHandle {
    /// Register `work` as a child of the scope and return it. After
    /// the task body has returned (or the scope has failed) this
    /// yields an immediately rejected value instead.
    #[track_caller]
    pub fn add<U: Clone + 'static>(&self, work: Deferred<U>) -> Deferred<U> {
        let mut state = self.inner.borrow_mut();
        if !state.open {
            return self
                .ctx
                .rejected(Error::InvalidState("scope task already completed".into()));
        }

        let (monitor, monitor_settler) = self.ctx.pending::<()>();
        let inner = self.inner.clone();
        work.subscribe(move |settlement| {
            if let Settlement::Rejected(error) = settlement {
                fail_scope(&inner, error.clone());
            }
            monitor_settler.resolve_quiet(());
        });

        state.monitors.push(monitor);
        let child = work.clone();
        state
            .cancels
            .push(Box::new(move |reason| child.cancel_with(reason)));
        work
    }

    /// Evaluate a thunk to work and register it; a panic in the thunk
    /// becomes a rejected child
    #[track_caller]
    pub fn add_with<U, F>(&self, thunk: F) -> Deferred<U>
    where
        U: Clone + 'static,
        F: FnOnce() -> Deferred<U>,
    {
        if !self.inner.borrow().open {
            return self
                .ctx
                .rejected(Error::InvalidState("scope task already completed".into()));
        }
        let work = match catch_unwind(AssertUnwindSafe(thunk)) {
            Ok(work) => work,
            Err(payload) => self.ctx.rejected(Error::message(format!(
                "scope thunk panicked: {}",
                panic_message(payload.as_ref())
            ))),
        };
        self.add(work)
    }
}

fn fail_scope(inner: &Rc<RefCell<ScopeState>>, error: Error) {
    let (fail, cancels) = {
        let mut state = inner.borrow_mut();
        if state.failed {
            return;
        }
        state.failed = true;
        state.open = false;
        (state.fail.clone(), std::mem::take(&mut state.cancels))
    };

    tracing::debug!("scope failed, canceling children: error={}", error);
    fail(error);
    for cancel in cancels {
        cancel(Error::canceled("scope canceled"));
    }
}

impl Context {
    /// Run `task` inside a fresh scope; see the module docs for the
    /// settlement rules
    #[track_caller]
    pub fn scope<T, R, F>(&self, task: F) -> Deferred<T>
    where
        T: Clone + 'static,
        R: Into<Resolution<T>>,
        F: FnOnce(ScopeHandle) -> R,
    {
        let (dv, settler) = self.pending::<T>();
        let fail: Rc<dyn Fn(Error)> = {
            let settler = settler.clone();
            Rc::new(move |error| settler.reject_quiet(error))
        };
        let state = Rc::new(RefCell::new(ScopeState {
            open: true,
            failed: false,
            monitors: Vec::new(),
            cancels: Vec::new(),
            fail,
        }));
        let handle = ScopeHandle {
            inner: state.clone(),
            ctx: self.clone(),
        };

        let task_result = catch_unwind(AssertUnwindSafe(move || task(handle).into()));
        state.borrow_mut().open = false;

        let task_dv: Deferred<T> = match task_result {
            Ok(resolution) => self.resolve(resolution),
            Err(payload) => self.rejected(Error::message(format!(
                "scope task panicked: {}",
                panic_message(payload.as_ref())
            ))),
        };

        let monitors = state.borrow().monitors.clone();
        let quiescent = self.all_settled(monitors);

        task_dv.subscribe(move |settlement| match settlement {
            Settlement::Rejected(error) => fail_scope(&state, error.clone()),
            Settlement::Fulfilled(value) => {
                let value = value.clone();
                let state = state.clone();
                let settler = settler.clone();
                quiescent.subscribe(move |_| {
                    if !state.borrow().failed {
                        settler.resolve_quiet(value);
                    }
                });
            }
        });

        dv
    }
}

impl<T: Clone + 'static> Deferred<T> {
    /// [`Context::scope`] on the current context
    #[track_caller]
    pub fn scope<R, F>(task: F) -> Deferred<T>
    where
        R: Into<Resolution<T>>,
        F: FnOnce(ScopeHandle) -> R,
    {
        Context::current().scope(task)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::deferred::DeferredState;

    #[test]
    fn test_scope_waits_for_children_then_takes_task_value() {
        let ctx = Context::new();
        let (child, child_settler) = ctx.pending::<i32>();

        let scope = ctx.scope(move |s| {
            s.add(child);
            Resolution::Value("done")
        });

        ctx.run_until_idle();
        assert_eq!(scope.state(), DeferredState::Pending);

        child_settler.resolve(1);
        ctx.run_until_idle();
        assert_eq!(scope.value().unwrap(), "done");
    }

    #[test]
    fn test_first_child_rejection_fails_scope_and_cancels_siblings() {
        let ctx = Context::new();
        let (long_a, _keep_a) = ctx.cancellable::<i32, _>(|_| {});
        let (long_c, _keep_c) = ctx.cancellable::<i32, _>(|_| {});
        let failing_b: Deferred<i32> = ctx.rejected(Error::message("b failed"));

        let a = long_a.clone();
        let c = long_c.clone();
        let scope: Deferred<()> = ctx.scope(move |s| {
            s.add(a);
            s.add(failing_b);
            s.add(c);
        });

        ctx.run_until_idle();
        assert_eq!(scope.reason().unwrap(), Error::message("b failed"));
        assert!(long_a.reason().unwrap().is_cancellation());
        assert!(long_c.reason().unwrap().is_cancellation());
    }

    #[test]
    fn test_non_cancelable_children_are_left_running() {
        let ctx = Context::new();
        let (survivor, survivor_settler) = ctx.pending::<i32>();
        let failing: Deferred<i32> = ctx.rejected(Error::message("sibling failure"));

        let s2 = survivor.clone();
        let scope: Deferred<()> = ctx.scope(move |s| {
            s.add(s2);
            s.add(failing);
        });

        ctx.run_until_idle();
        assert_eq!(scope.reason().unwrap(), Error::message("sibling failure"));
        assert_eq!(survivor.state(), DeferredState::Pending);

        survivor_settler.resolve(5);
        assert_eq!(survivor.value().unwrap(), 5);
    }

    #[test]
    fn test_task_panic_fails_scope_and_cancels_children() {
        let ctx = Context::new();
        let (child, _keep) = ctx.cancellable::<i32, _>(|_| {});

        let c = child.clone();
        let scope: Deferred<()> = ctx.scope(move |s| -> Resolution<()> {
            s.add(c);
            panic!("task exploded");
        });

        ctx.run_until_idle();
        match scope.reason().unwrap() {
            Error::Message(message) => assert!(message.contains("task exploded")),
            other => panic!("unexpected reason: {other:?}"),
        }
        assert!(child.reason().unwrap().is_cancellation());
    }

    #[test]
    fn test_task_returning_rejected_deferred_fails_scope() {
        let ctx = Context::new();
        let rejected: Deferred<i32> = ctx.rejected(Error::message("task result bad"));
        let scope: Deferred<i32> = ctx.scope(move |_s| Resolution::Deferred(rejected));
        ctx.run_until_idle();
        assert_eq!(scope.reason().unwrap(), Error::message("task result bad"));
    }

    #[test]
    fn test_add_after_task_returned_is_rejected() {
        let ctx = Context::new();
        let escaped: Rc<RefCell<Option<ScopeHandle>>> = Rc::new(RefCell::new(None));

        let e = escaped.clone();
        let scope: Deferred<()> = ctx.scope(move |s| {
            *e.borrow_mut() = Some(s);
        });
        ctx.run_until_idle();
        assert_eq!(scope.state(), DeferredState::Fulfilled);

        let handle = escaped.borrow().clone().unwrap();
        let late = handle.add(ctx.resolved(1));
        assert_eq!(
            late.reason().unwrap(),
            Error::InvalidState("scope task already completed".into())
        );
    }

    #[test]
    fn test_add_with_evaluates_thunks() {
        let ctx = Context::current();
        let scope = ctx.scope(|s| {
            let child = s.add_with(|| Deferred::resolved(21));
            child.map(|v| v * 2)
        });
        ctx.run_until_idle();
        assert_eq!(scope.value().unwrap(), 42);
    }
}
