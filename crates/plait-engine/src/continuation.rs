//! Continuations: the suspended execution state a tasklet owns
//!
//! A continuation holds the tasklet's boxed invocable between switches plus
//! the nesting level that tracks live native frames. At `nesting == 0` the
//! tasklet is soft: its invocable can report a portable capture. At
//! `nesting > 0` the tasklet has real call frames on some OS stack (a nested
//! scheduler run, a nested watchdog, or a declared native section) and can
//! only be resumed in place; capture fails with a C-state error.

use crate::invoke::{Invocable, InvocableCapture};

/// Owned suspended state of one tasklet
pub struct Continuation {
    /// The entry point, absent while the tasklet is mid-resume or dead
    invocable: Option<Box<dyn Invocable>>,

    /// Count of live native frames preventing soft capture
    nesting: u32,
}

impl Continuation {
    /// An empty continuation (unbound tasklet)
    pub fn empty() -> Self {
        Self {
            invocable: None,
            nesting: 0,
        }
    }

    /// Create from a bound entry point
    pub fn new(invocable: Box<dyn Invocable>) -> Self {
        Self {
            invocable: Some(invocable),
            nesting: 0,
        }
    }

    /// Whether an entry point is attached
    pub fn is_bound(&self) -> bool {
        self.invocable.is_some()
    }

    /// Take the invocable out for a resume step
    pub fn take_invocable(&mut self) -> Option<Box<dyn Invocable>> {
        self.invocable.take()
    }

    /// Put the invocable back after a resume step
    pub fn put_invocable(&mut self, invocable: Box<dyn Invocable>) {
        self.invocable = Some(invocable);
    }

    /// Drop the invocable (transition into dead releases the continuation)
    pub fn release(&mut self) {
        self.invocable = None;
        self.nesting = 0;
    }

    /// Current nesting level
    pub fn nesting(&self) -> u32 {
        self.nesting
    }

    /// Enter a native frame
    pub fn enter_native(&mut self) {
        self.nesting += 1;
    }

    /// Exit a native frame
    pub fn exit_native(&mut self) {
        debug_assert!(self.nesting > 0, "native frame underflow");
        self.nesting = self.nesting.saturating_sub(1);
    }

    /// Portable capture of the suspended invocable.
    ///
    /// `None` when no entry point is attached, when native frames are live,
    /// or when the invocable itself is not capturable.
    pub fn capture(&self) -> Option<InvocableCapture> {
        if self.nesting > 0 {
            return None;
        }
        self.invocable.as_ref()?.capture()
    }
}

impl std::fmt::Debug for Continuation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Continuation")
            .field("bound", &self.invocable.is_some())
            .field("nesting", &self.nesting)
            .finish()
    }
}
