//! Continuation serialization
//!
//! A soft-suspended tasklet can be flattened into a portable byte snapshot
//! and rebuilt later, on any thread, into a fresh tasklet that resumes where
//! the original left off. Capture covers the invocable's program counter and
//! locals, the per-tasklet flags, a pending injected exception, and channel
//! membership for blocked tasklets.

mod format;
mod reader;
mod writer;

pub use format::SnapshotError;
pub use reader::restore;
pub use writer::capture;
