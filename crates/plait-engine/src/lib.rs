//! Plait Scheduling Engine
//!
//! This crate provides a cooperative scheduling runtime:
//! - **Tasklets**: lightweight logical threads with bind/insert/run/kill
//!   lifecycle (`scheduler` module)
//! - **Channels**: unbuffered rendezvous transfer of values and exceptions
//!   (`sync` module)
//! - **Watchdog**: bounded-step scheduling with nesting-aware interruption
//!   (`scheduler` module)
//! - **Continuations**: capture a soft-suspended tasklet to portable bytes
//!   and restore it elsewhere (`snapshot` module)
//!
//! # Example
//!
//! ```rust,ignore
//! use plait_engine::{Channel, FnInvocable, Poll, Scheduler, Tasklet, Value};
//!
//! let channel = Channel::new();
//! let tasklet = Tasklet::new();
//! let producer = channel.clone();
//! tasklet.bind(Box::new(FnInvocable::new(move |cx, _wake| {
//!     match cx.send(&producer, Value::Int(42)) {
//!         Ok(None) => Poll::Done(Value::Null),
//!         Ok(Some(poll)) => poll,
//!         Err(_) => Poll::Done(Value::Null),
//!     }
//! }))).unwrap();
//! tasklet.insert().unwrap();
//!
//! // The host thread blocks cooperatively: the producer runs underneath.
//! assert_eq!(channel.receive().unwrap(), Value::Int(42));
//! ```

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]

// ============================================================================
// Core Modules
// ============================================================================

/// Stock invocables and their restore factories
pub mod builtin;

/// Suspended execution state owned by a tasklet
pub mod continuation;

/// Error types
pub mod error;

/// Exceptions transported between tasklets
pub mod exception;

/// Tasklet entry points and the resume protocol
pub mod invoke;

/// Tasklets, the per-thread scheduler, and the watchdog
pub mod scheduler;

/// Continuation serialization
pub mod snapshot;

/// Channels and the channel registry
pub mod sync;

/// Portable values
pub mod value;

// ============================================================================
// Public API Re-exports
// ============================================================================

pub use builtin::{Collector, Countdown, Producer};
pub use continuation::Continuation;
pub use error::{SchedError, SchedResult};
pub use exception::{Exc, ExcKind};
pub use invoke::{
    register_factory, FnInvocable, Invocable, InvocableCapture, Poll, Wake,
};
pub use scheduler::{
    ReceivePoll, RunCx, Scheduler, SchedulerId, SchedulerStats, Tasklet, TaskletId, TaskletState,
};
pub use snapshot::{capture, restore, SnapshotError};
pub use sync::{Channel, ChannelId, Dir, Messages, Preference};
pub use value::Value;
