//! Context configuration: tick dispatch policy and settle strictness

use std::fmt;
use std::rc::Rc;

/// A deferred unit of work handed to the tick dispatcher
pub type Thunk = Box<dyn FnOnce()>;

/// How handler continuations are deferred out of the current
/// synchronous region
#[derive(Clone)]
pub enum TickPolicy {
    /// Run on the microtask queue, ahead of any timer (default)
    Microtask,

    /// Run as a zero-delay timer, after already-queued microtasks
    Macrotask,

    /// Hand each step to a caller-supplied dispatcher
    Custom(Rc<dyn Fn(Thunk)>),
}

impl Default for TickPolicy {
    fn default() -> Self {
        TickPolicy::Microtask
    }
}

impl fmt::Debug for TickPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TickPolicy::Microtask => write!(f, "Microtask"),
            TickPolicy::Macrotask => write!(f, "Macrotask"),
            TickPolicy::Custom(_) => write!(f, "Custom"),
        }
    }
}

/// Context-wide knobs threaded through every deferred value
#[derive(Debug, Clone, Default)]
pub struct Config {
    /// Tick dispatch policy for handler continuations
    pub tick: TickPolicy,

    /// When set, settling an already-settled value panics instead of
    /// logging a warning and dropping the attempt
    pub strict: bool,
}

impl Config {
    /// Default policy, non-strict
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the tick dispatch policy
    pub fn with_tick(mut self, tick: TickPolicy) -> Self {
        self.tick = tick;
        self
    }

    /// Enable strict double-settle handling
    pub fn with_strict(mut self, strict: bool) -> Self {
        self.strict = strict;
        self
    }
}
