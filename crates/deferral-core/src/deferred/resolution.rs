//! Resolution inputs and the thenable boundary
//!
//! A [`Resolution`] is what a handler or executor hands back to settle
//! a deferred value: a plain value, a failure, another deferred value,
//! or any foreign [`Thenable`]. Adoption of a thenable goes through a
//! [`ChainLink`], whose shared guard makes sure a malformed thenable
//! that delivers twice (or down both arms) influences the adopter at
//! most once.

use crate::deferred::Deferred;
use crate::error::Error;
use std::cell::Cell;
use std::rc::Rc;

/// The outcome a handler or executor produces for a deferred value
pub enum Resolution<T> {
    /// Fulfill with a plain value
    Value(T),

    /// Reject with a reason
    Failed(Error),

    /// Adopt another deferred value's eventual outcome
    Deferred(Deferred<T>),

    /// Adopt any foreign thenable's eventual outcome
    Chain(Box<dyn Thenable<T>>),
}

impl Resolution<()> {
    /// Unit fulfillment, for cleanup-style handlers
    pub fn done() -> Self {
        Resolution::Value(())
    }
}

impl<T> From<Deferred<T>> for Resolution<T> {
    fn from(deferred: Deferred<T>) -> Self {
        Resolution::Deferred(deferred)
    }
}

impl<T> From<std::result::Result<T, Error>> for Resolution<T> {
    fn from(result: std::result::Result<T, Error>) -> Self {
        match result {
            Ok(value) => Resolution::Value(value),
            Err(error) => Resolution::Failed(error),
        }
    }
}

impl From<()> for Resolution<()> {
    fn from(_: ()) -> Self {
        Resolution::Value(())
    }
}

/// A value that can deliver its eventual outcome through a
/// [`ChainLink`]. Implementing this trait is the capability test for
/// adoption: anything carrying it can stand in for a deferred value.
pub trait Thenable<T> {
    /// Arrange for exactly one delivery on `link` once the outcome is
    /// known. Extra deliveries are ignored by the link.
    fn chain(self: Box<Self>, link: ChainLink<T>);
}

/// Delivery handle for one adoption. The first call to either
/// [`fulfill`](ChainLink::fulfill) or [`fail`](ChainLink::fail) wins;
/// everything after is dropped.
pub struct ChainLink<T> {
    called: Rc<Cell<bool>>,
    target: Deferred<T>,
}

impl<T> Clone for ChainLink<T> {
    fn clone(&self) -> Self {
        Self {
            called: self.called.clone(),
            target: self.target.clone(),
        }
    }
}

impl<T: Clone + 'static> ChainLink<T> {
    pub(crate) fn new(target: Deferred<T>) -> Self {
        Self {
            called: Rc::new(Cell::new(false)),
            target,
        }
    }

    /// Deliver a fulfillment-side resolution; nested deferred values
    /// and thenables are adopted in turn
    pub fn fulfill(&self, resolution: Resolution<T>) {
        if self.called.replace(true) {
            return;
        }
        self.target.apply_resolution(resolution);
    }

    /// Deliver a rejection
    pub fn fail(&self, error: Error) {
        if self.called.replace(true) {
            return;
        }
        self.target.reject_internal(error);
    }

    /// True once either arm has delivered
    pub fn delivered(&self) -> bool {
        self.called.get()
    }
}
