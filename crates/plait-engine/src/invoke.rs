//! Tasklet entry points
//!
//! A tasklet's entry point is an *invocable*: a resumable state machine the
//! scheduler trampolines. Every return from [`Invocable::resume`] is an
//! execution checkpoint (the function-call boundary where the watchdog budget
//! is consulted). An invocable that can describe its suspended state as a
//! program counter plus portable locals is *soft-capturable* and participates
//! in continuation serialization; one that cannot is permanently hard.

use crate::error::{SchedError, SchedResult};
use crate::exception::Exc;
use crate::value::Value;
use dashmap::DashMap;
use once_cell::sync::Lazy;

/// What a switch-in delivers to the resumed tasklet
#[derive(Debug, Clone)]
pub enum Wake {
    /// Ordinary switch-in with nothing attached
    Run,
    /// A value received from a channel
    Value(Value),
    /// An exception to re-raise at the resume point (channel transfer or kill)
    Exception(Exc),
    /// The channel this tasklet was blocked on has been closed
    Closed,
}

impl Wake {
    /// Split into the received value or the exception to re-raise.
    ///
    /// `Closed` maps to `Ok(None)`; bodies that do not iterate a channel can
    /// treat it as an absent value.
    pub fn into_result(self) -> Result<Option<Value>, Exc> {
        match self {
            Wake::Run => Ok(None),
            Wake::Value(v) => Ok(Some(v)),
            Wake::Exception(exc) => Err(exc),
            Wake::Closed => Ok(None),
        }
    }
}

/// Outcome of one resume step
#[derive(Debug)]
pub enum Poll {
    /// Passed a checkpoint; keep running unless the watchdog interrupts
    Step,
    /// Explicit `schedule()` point: go to the back of the run queue
    Yield,
    /// The body parked itself on a channel through [`RunCx`](crate::scheduler::RunCx)
    Block,
    /// Terminated normally with a result
    Done(Value),
    /// Terminated by raising an exception
    Raised(Exc),
}

/// Portable description of a soft-suspended invocable
#[derive(Debug, Clone, PartialEq)]
pub struct InvocableCapture {
    /// Name of the registered factory that can rebuild this invocable
    pub factory: String,
    /// Resume position inside the invocable
    pub pc: u32,
    /// Portable local bindings
    pub locals: Vec<Value>,
}

/// A schedulable entry point
pub trait Invocable: Send {
    /// Run until the next checkpoint, yield point, blocking point, or
    /// termination. `wake` carries whatever the switch-in delivers.
    fn resume(&mut self, cx: &mut crate::scheduler::RunCx<'_>, wake: Wake) -> Poll;

    /// Describe the suspended state for continuation serialization.
    ///
    /// Returning `None` marks the invocable as not soft-capturable; `capture`
    /// on its tasklet then fails with a C-state error.
    fn capture(&self) -> Option<InvocableCapture> {
        None
    }
}

/// Factory able to rebuild an invocable from its portable capture
pub type RestoreFn = fn(&InvocableCapture) -> SchedResult<Box<dyn Invocable>>;

static FACTORIES: Lazy<DashMap<String, RestoreFn>> = Lazy::new(|| {
    let factories = DashMap::new();
    crate::builtin::install(&factories);
    factories
});

/// Register a restore factory under a name.
///
/// The name is what [`InvocableCapture::factory`] refers to; registration
/// must happen before any restore that mentions it.
pub fn register_factory(name: impl Into<String>, factory: RestoreFn) {
    FACTORIES.insert(name.into(), factory);
}

/// Rebuild an invocable from a portable capture
pub fn restore_invocable(capture: &InvocableCapture) -> SchedResult<Box<dyn Invocable>> {
    let factory = FACTORIES
        .get(&capture.factory)
        .ok_or(SchedError::State("unknown invocable factory"))?;
    factory(capture)
}

/// Adapter turning a closure into a (non-capturable) invocable
pub struct FnInvocable<F> {
    body: F,
}

impl<F> FnInvocable<F>
where
    F: FnMut(&mut crate::scheduler::RunCx<'_>, Wake) -> Poll + Send,
{
    /// Wrap a closure as an entry point
    pub fn new(body: F) -> Self {
        Self { body }
    }
}

impl<F> Invocable for FnInvocable<F>
where
    F: FnMut(&mut crate::scheduler::RunCx<'_>, Wake) -> Poll + Send,
{
    fn resume(&mut self, cx: &mut crate::scheduler::RunCx<'_>, wake: Wake) -> Poll {
        (self.body)(cx, wake)
    }
}
