//! Combinators over collections of deferred values

use crate::context::Context;
use crate::deferred::{Deferred, Resolution, Settlement};
use crate::error::Error;
use std::cell::RefCell;
use std::rc::Rc;

impl Context {
    /// Immediately fulfilled deferred value
    #[track_caller]
    pub fn resolved<T: Clone + 'static>(&self, value: T) -> Deferred<T> {
        let (dv, _settler) = self.pending();
        dv.fulfill_internal(value);
        dv
    }

    /// Immediately rejected deferred value
    #[track_caller]
    pub fn rejected<T: Clone + 'static>(&self, error: Error) -> Deferred<T> {
        let (dv, _settler) = self.pending();
        dv.reject_internal(error);
        dv
    }

    /// Run the resolution procedure over any input: an existing
    /// deferred value is returned as-is, a thenable is adopted, a
    /// plain value or failure settles a fresh one
    #[track_caller]
    pub fn resolve<T, R>(&self, resolution: R) -> Deferred<T>
    where
        T: Clone + 'static,
        R: Into<Resolution<T>>,
    {
        match resolution.into() {
            Resolution::Deferred(dv) => dv,
            other => {
                let (dv, _settler) = self.pending();
                dv.settle_internal(other);
                dv
            }
        }
    }

    /// Fulfill with every value in input order, or reject with the
    /// first rejection. Empty input fulfills with an empty vector.
    #[track_caller]
    pub fn all<T, I>(&self, items: I) -> Deferred<Vec<T>>
    where
        T: Clone + 'static,
        I: IntoIterator<Item = Deferred<T>>,
    {
        let items: Vec<Deferred<T>> = items.into_iter().collect();
        let (dv, settler) = self.pending::<Vec<T>>();
        if items.is_empty() {
            settler.resolve_quiet(Vec::new());
            return dv;
        }

        let gather = Rc::new(RefCell::new(Gather {
            slots: (0..items.len()).map(|_| None).collect::<Vec<Option<T>>>(),
            remaining: items.len(),
            done: false,
        }));

        for (index, item) in items.into_iter().enumerate() {
            let gather = gather.clone();
            let settler = settler.clone();
            item.subscribe(move |settlement| match settlement {
                Settlement::Fulfilled(value) => {
                    let values = {
                        let mut g = gather.borrow_mut();
                        if g.done {
                            return;
                        }
                        g.slots[index] = Some(value.clone());
                        g.remaining -= 1;
                        if g.remaining > 0 {
                            return;
                        }
                        g.done = true;
                        g.slots.iter_mut().filter_map(|slot| slot.take()).collect()
                    };
                    settler.resolve_quiet(values);
                }
                Settlement::Rejected(error) => {
                    {
                        let mut g = gather.borrow_mut();
                        if g.done {
                            return;
                        }
                        g.done = true;
                    }
                    settler.reject_quiet(error.clone());
                }
            });
        }
        dv
    }

    /// Settle with the first settlement among the inputs; empty input
    /// never settles
    #[track_caller]
    pub fn race<T, I>(&self, items: I) -> Deferred<T>
    where
        T: Clone + 'static,
        I: IntoIterator<Item = Deferred<T>>,
    {
        let (dv, settler) = self.pending::<T>();
        for item in items {
            let settler = settler.clone();
            item.subscribe(move |settlement| match settlement {
                Settlement::Fulfilled(value) => settler.resolve_quiet(value.clone()),
                Settlement::Rejected(error) => settler.reject_quiet(error.clone()),
            });
        }
        dv
    }

    /// Fulfill with every input's settlement descriptor in input
    /// order; never rejects
    #[track_caller]
    pub fn all_settled<T, I>(&self, items: I) -> Deferred<Vec<Settlement<T>>>
    where
        T: Clone + 'static,
        I: IntoIterator<Item = Deferred<T>>,
    {
        let items: Vec<Deferred<T>> = items.into_iter().collect();
        let (dv, settler) = self.pending::<Vec<Settlement<T>>>();
        if items.is_empty() {
            settler.resolve_quiet(Vec::new());
            return dv;
        }

        let gather = Rc::new(RefCell::new(Gather {
            slots: (0..items.len())
                .map(|_| None)
                .collect::<Vec<Option<Settlement<T>>>>(),
            remaining: items.len(),
            done: false,
        }));

        for (index, item) in items.into_iter().enumerate() {
            let gather = gather.clone();
            let settler = settler.clone();
            item.subscribe(move |settlement| {
                let descriptors = {
                    let mut g = gather.borrow_mut();
                    if g.done {
                        return;
                    }
                    g.slots[index] = Some(settlement.clone());
                    g.remaining -= 1;
                    if g.remaining > 0 {
                        return;
                    }
                    g.done = true;
                    g.slots.iter_mut().filter_map(|slot| slot.take()).collect()
                };
                settler.resolve_quiet(descriptors);
            });
        }
        dv
    }

    /// Fulfill with the first fulfillment; reject with an aggregate of
    /// every reason (in input order) once all inputs have rejected.
    /// Empty input rejects with an empty aggregate.
    #[track_caller]
    pub fn any<T, I>(&self, items: I) -> Deferred<T>
    where
        T: Clone + 'static,
        I: IntoIterator<Item = Deferred<T>>,
    {
        let items: Vec<Deferred<T>> = items.into_iter().collect();
        let (dv, settler) = self.pending::<T>();
        if items.is_empty() {
            settler.reject_quiet(Error::Aggregate(Vec::new()));
            return dv;
        }

        let gather = Rc::new(RefCell::new(Gather {
            slots: (0..items.len())
                .map(|_| None)
                .collect::<Vec<Option<Error>>>(),
            remaining: items.len(),
            done: false,
        }));

        for (index, item) in items.into_iter().enumerate() {
            let gather = gather.clone();
            let settler = settler.clone();
            item.subscribe(move |settlement| match settlement {
                Settlement::Fulfilled(value) => {
                    {
                        let mut g = gather.borrow_mut();
                        if g.done {
                            return;
                        }
                        g.done = true;
                    }
                    settler.resolve_quiet(value.clone());
                }
                Settlement::Rejected(error) => {
                    let reasons = {
                        let mut g = gather.borrow_mut();
                        if g.done {
                            return;
                        }
                        g.slots[index] = Some(error.clone());
                        g.remaining -= 1;
                        if g.remaining > 0 {
                            return;
                        }
                        g.done = true;
                        g.slots.iter_mut().filter_map(|slot| slot.take()).collect()
                    };
                    settler.reject_quiet(Error::Aggregate(reasons));
                }
            });
        }
        dv
    }
}

struct Gather<S> {
    slots: Vec<Option<S>>,
    remaining: usize,
    done: bool,
}

impl<T: Clone + 'static> Deferred<T> {
    /// [`Context::resolved`] on the current context
    #[track_caller]
    pub fn resolved(value: T) -> Deferred<T> {
        Context::current().resolved(value)
    }

    /// [`Context::rejected`] on the current context
    #[track_caller]
    pub fn rejected(error: Error) -> Deferred<T> {
        Context::current().rejected(error)
    }

    /// [`Context::resolve`] on the current context
    #[track_caller]
    pub fn resolve<R: Into<Resolution<T>>>(resolution: R) -> Deferred<T> {
        Context::current().resolve(resolution)
    }

    /// [`Context::all`] on the current context
    #[track_caller]
    pub fn all<I: IntoIterator<Item = Deferred<T>>>(items: I) -> Deferred<Vec<T>> {
        Context::current().all(items)
    }

    /// [`Context::race`] on the current context
    #[track_caller]
    pub fn race<I: IntoIterator<Item = Deferred<T>>>(items: I) -> Deferred<T> {
        Context::current().race(items)
    }

    /// [`Context::all_settled`] on the current context
    #[track_caller]
    pub fn all_settled<I: IntoIterator<Item = Deferred<T>>>(items: I) -> Deferred<Vec<Settlement<T>>> {
        Context::current().all_settled(items)
    }

    /// [`Context::any`] on the current context
    #[track_caller]
    pub fn any<I: IntoIterator<Item = Deferred<T>>>(items: I) -> Deferred<T> {
        Context::current().any(items)
    }
}
