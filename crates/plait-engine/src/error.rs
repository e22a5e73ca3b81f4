//! Scheduler error types

use crate::exception::Exc;
use crate::snapshot::SnapshotError;
use thiserror::Error;

/// Errors surfaced by scheduler, tasklet, and channel operations
#[derive(Debug, Error)]
pub enum SchedError {
    /// The operation is invalid for the object's current state
    #[error("invalid state: {0}")]
    State(&'static str),

    /// A blocking operation could never be satisfied: the tasklet would wait
    /// forever with nothing else runnable on its thread
    #[error("deadlock: nothing runnable could satisfy this operation")]
    Deadlock,

    /// The channel is closed (or closing, for sends)
    #[error("channel is closed")]
    ChannelClosed,

    /// A tasklet died raising and no error handler was installed
    #[error("uncaught exception in tasklet {tasklet}: {exc}")]
    Uncaught {
        /// Numeric ID of the tasklet that died
        tasklet: u64,
        /// The exception it raised
        exc: Exc,
    },

    /// An exception was delivered to the calling thread (host-side receive
    /// of `send_exception`, for example)
    #[error("exception: {0}")]
    Exception(Exc),

    /// Continuation capture or restore failed
    #[error(transparent)]
    Snapshot(#[from] SnapshotError),
}

/// Convenience alias for fallible scheduler operations
pub type SchedResult<T> = Result<T, SchedError>;
