//! Per-thread cooperative scheduling: tasklets, run queues, and watchdogs

pub mod scheduler;
pub mod tasklet;
pub mod watchdog;

pub use scheduler::{ReceivePoll, RunCx, Scheduler, SchedulerId, SchedulerStats};
pub(crate) use scheduler::schedule_woken;
pub use tasklet::{Tasklet, TaskletId, TaskletState};
pub(crate) use tasklet::WakeSlot;
