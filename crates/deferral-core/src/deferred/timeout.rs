//! Timeout decorator: a mirror that rejects when its timer wins
//!
//! The decorator never cancels its source; it only stops waiting.
//! Settlement of the source disarms the timer, and progress from the
//! source flows through to the mirror while both are pending.

use crate::deferred::{Deferred, Settlement};
use crate::error::Error;
use crate::event_loop::TimerId;
use std::cell::Cell;
use std::rc::Rc;

impl<T: Clone + 'static> Deferred<T> {
    /// Mirror this value, rejecting with a generic timeout reason if
    /// the source has not settled within `ms` of virtual time
    #[track_caller]
    pub fn timeout(&self, ms: u64) -> Deferred<T> {
        self.timeout_with(ms, Error::timeout(format!("timed out after {ms}ms")))
    }

    /// Mirror this value, rejecting with `reason` on expiry
    #[track_caller]
    pub fn timeout_with(&self, ms: u64, reason: Error) -> Deferred<T> {
        let (mirror, settler) = self.ctx.pending::<T>();
        let timer: Rc<Cell<Option<TimerId>>> = Rc::new(Cell::new(None));

        let expire = settler.clone();
        let id = self.ctx.set_timer(ms, move || expire.reject_quiet(reason));
        timer.set(Some(id));

        let ctx = self.ctx.clone();
        let forward = settler.clone();
        self.subscribe(move |settlement| {
            if let Some(id) = timer.take() {
                ctx.cancel_timer(id);
            }
            match settlement {
                Settlement::Fulfilled(value) => forward.resolve_quiet(value.clone()),
                Settlement::Rejected(error) => forward.reject_quiet(error.clone()),
            }
        });

        self.progress(move |value| settler.progress(value.clone()));
        mirror
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::Context;
    use crate::deferred::DeferredState;
    use serde_json::json;
    use std::cell::RefCell;

    #[test]
    fn test_expiry_rejects_with_timeout_kind() {
        let ctx = Context::new();
        let (slow, slow_settler) = ctx.pending::<&'static str>();
        let guarded = slow.timeout(10);

        // The source settles on its own timer, too late.
        let s = slow_settler.clone();
        ctx.set_timer(50, move || s.resolve("v"));

        ctx.run_until_idle();
        assert_eq!(guarded.reason().unwrap(), Error::timeout("timed out after 10ms"));

        // The source itself was not canceled.
        assert_eq!(slow_settler.deferred().value().unwrap(), "v");
    }

    #[test]
    fn test_settlement_disarms_the_timer() {
        let ctx = Context::new();
        let (fast, settler) = ctx.pending::<i32>();
        let guarded = fast.timeout(100);

        settler.resolve(1);
        ctx.run_until_idle();
        assert_eq!(guarded.value().unwrap(), 1);
        assert!(!ctx.has_pending_work());
    }

    #[test]
    fn test_rejection_mirrors_through() {
        let ctx = Context::new();
        let (source, settler) = ctx.pending::<i32>();
        let guarded = source.timeout(100);

        settler.reject(Error::message("original"));
        ctx.run_until_idle();
        assert_eq!(guarded.reason().unwrap(), Error::message("original"));
    }

    #[test]
    fn test_custom_reason() {
        let ctx = Context::new();
        let (source, _settler) = ctx.pending::<i32>();
        let guarded = source.timeout_with(5, Error::timeout("slow"));
        ctx.run_until_idle();
        assert_eq!(guarded.reason().unwrap(), Error::timeout("slow"));
        assert_eq!(guarded.state(), DeferredState::Rejected);
    }

    #[test]
    fn test_progress_flows_through_the_mirror() {
        let ctx = Context::new();
        let (source, settler) = ctx.pending::<i32>();
        let guarded = source.timeout(100);

        let seen = Rc::new(RefCell::new(Vec::new()));
        let s = seen.clone();
        guarded.progress(move |value| s.borrow_mut().push(value.clone()));

        settler.progress(json!(25));
        settler.progress(json!(75));
        assert_eq!(*seen.borrow(), vec![json!(25), json!(75)]);
    }
}
