//! Bounded-step scheduling: drain the run queue under a step budget
//!
//! `run_watchdog` drains like `run` but charges every checkpoint against a
//! budget. When the budget runs out the tasklet at fault is pulled off the
//! queue and handed back to the caller instead of being silently resumed.
//! Watchdog runs nest; an inner frame always interrupts before an outer one.

use crate::error::SchedResult;
use crate::scheduler::scheduler::Scheduler;
use crate::scheduler::tasklet::Tasklet;
use std::sync::Arc;

/// One active bounded-step run
pub(crate) struct WatchdogFrame {
    /// Remaining checkpoints before this frame fires
    budget: usize,
    /// Soft frames only interrupt at clean suspension points (no native
    /// frames held by the tasklet)
    soft: bool,
    /// Let a soft frame fire even while native frames are held
    ignore_nesting: bool,
    /// Set once the budget is exhausted; consumed at the next eligible
    /// checkpoint of this frame's own drain loop
    pending: bool,
    /// Trampoline depth this frame's drain loop dispatches at; inner loops
    /// run deeper and must not consume an outer frame's interrupt
    dispatch_depth: usize,
}

impl Scheduler {
    /// Drain the run queue for at most `steps` checkpoints.
    ///
    /// Returns the interrupted tasklet (paused, requeue it to resume) when
    /// the budget ran out, or `None` when the queue drained first. `soft`
    /// defers the interrupt past tasklets holding native frames unless
    /// `ignore_nesting` overrides that.
    pub fn run_watchdog(
        &self,
        steps: usize,
        soft: bool,
        ignore_nesting: bool,
    ) -> SchedResult<Option<Arc<Tasklet>>> {
        {
            let mut core = self.core_mut();
            let dispatch_depth = core.depth + 1;
            core.watchdogs.push(WatchdogFrame {
                budget: steps,
                soft,
                ignore_nesting,
                pending: steps == 0,
                dispatch_depth,
            });
        }
        let result = self.drain_loop();
        self.core_mut().watchdogs.pop();
        result
    }

    /// Account one checkpoint against every active watchdog frame, then
    /// decide whether the innermost frame interrupts this dispatch.
    ///
    /// `eligible` is false at terminal or blocking polls; the interrupt
    /// stays pending until a resumable suspension point comes around.
    pub(crate) fn note_checkpoint(&self, tasklet: &Arc<Tasklet>, eligible: bool) -> bool {
        let mut core = self.core_mut();
        for frame in core.watchdogs.iter_mut() {
            if frame.budget > 0 {
                frame.budget -= 1;
                if frame.budget == 0 {
                    frame.pending = true;
                }
            }
        }
        let depth = core.depth;
        let Some(frame) = core.watchdogs.last_mut() else {
            return false;
        };
        if !frame.pending || frame.dispatch_depth != depth || !eligible {
            return false;
        }
        if tasklet.atomic() {
            return false;
        }
        if frame.soft && tasklet.nesting() > 0 && !(frame.ignore_nesting || tasklet.ignore_nesting())
        {
            return false;
        }
        frame.pending = false;
        true
    }
}
