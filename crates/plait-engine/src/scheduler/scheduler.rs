//! The per-thread scheduler: run queue, trampoline, and switch routing
//!
//! Each OS thread owns at most one scheduler, constructed on first use and
//! torn down with the thread. Within a thread scheduling is strictly
//! cooperative: the trampoline resumes one tasklet at a time and regains
//! control at every checkpoint. Across threads the only ingress is the wake
//! queue, fed by channel operations on other threads.

use crate::error::{SchedError, SchedResult};
use crate::exception::Exc;
use crate::invoke::Poll;
use crate::scheduler::tasklet::{Tasklet, TaskletState, WakeSlot};
use crate::scheduler::watchdog::WatchdogFrame;
use crate::sync::{Channel, Preference, ReceiveOutcome, SendOutcome};
use crate::value::Value;
use crossbeam::channel::{unbounded, Receiver, Sender};
use dashmap::DashMap;
use once_cell::sync::Lazy;
use std::cell::RefCell;
use std::collections::VecDeque;
use std::rc::Rc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Unique identifier for a scheduler (one per hosting thread)
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct SchedulerId(u64);

static NEXT_SCHEDULER_ID: AtomicU64 = AtomicU64::new(1);

impl SchedulerId {
    fn new() -> Self {
        SchedulerId(NEXT_SCHEDULER_ID.fetch_add(1, Ordering::Relaxed))
    }

    /// Get the numeric ID value
    pub fn as_u64(self) -> u64 {
        self.0
    }
}

/// Cross-thread reschedule request
pub(crate) struct WakeMsg {
    tasklet: Arc<Tasklet>,
    front: bool,
}

/// Directory of live schedulers, keyed by ID, holding their wake senders
static DIRECTORY: Lazy<DashMap<SchedulerId, Sender<WakeMsg>>> = Lazy::new(DashMap::new);

thread_local! {
    static CURRENT: RefCell<Option<Rc<Scheduler>>> = const { RefCell::new(None) };
}

/// Scheduler statistics
#[derive(Debug, Clone, Default)]
pub struct SchedulerStats {
    /// Total tasklets inserted into the run queue
    pub tasklets_spawned: u64,

    /// Total tasklets run to completion (normally or raising)
    pub tasklets_completed: u64,

    /// Currently runnable tasklets
    pub active_tasklets: usize,
}

/// Uncaught-exception handler installed on a scheduler
pub type ErrorHandler = Rc<dyn Fn(&Arc<Tasklet>, &Exc)>;

pub(crate) struct SchedCore {
    run_queue: VecDeque<Arc<Tasklet>>,
    current: Option<Arc<Tasklet>>,
    pub(crate) watchdogs: Vec<WatchdogFrame>,
    switch_trap: i32,
    /// Trampoline recursion depth; watchdog frames record the depth their
    /// own drain loop dispatches at.
    pub(crate) depth: usize,
    error_handler: Option<ErrorHandler>,
    spawned: u64,
    completed: u64,
}

/// Outcome of trampolining one tasklet
pub(crate) enum Dispatch {
    /// Returned `Poll::Yield`: goes to the back of the run queue
    Yielded,
    /// Parked itself out of the queue (switch hand-off or schedule_remove)
    Paused,
    /// Parked on a channel
    Blocked,
    /// Terminated (normally, raising, or via an installed error handler)
    Finished,
    /// Interrupted by the innermost watchdog frame
    Interrupted,
}

/// A per-thread cooperative scheduler
pub struct Scheduler {
    id: SchedulerId,
    main: Arc<Tasklet>,
    core: RefCell<SchedCore>,
    wake_rx: Receiver<WakeMsg>,
}

impl Scheduler {
    fn new_for_thread() -> Self {
        let id = SchedulerId::new();
        let (wake_tx, wake_rx) = unbounded();
        DIRECTORY.insert(id, wake_tx);
        let main = Tasklet::new_main(id);
        Self {
            id,
            main,
            core: RefCell::new(SchedCore {
                run_queue: VecDeque::new(),
                current: None,
                watchdogs: Vec::new(),
                switch_trap: 0,
                depth: 0,
                error_handler: None,
                spawned: 0,
                completed: 0,
            }),
            wake_rx,
        }
    }

    /// The calling thread's scheduler, constructed on first use
    pub fn current() -> Rc<Scheduler> {
        CURRENT.with(|cell| {
            if let Some(sched) = cell.borrow().as_ref() {
                return sched.clone();
            }
            let sched = Rc::new(Scheduler::new_for_thread());
            *cell.borrow_mut() = Some(sched.clone());
            sched
        })
    }

    /// The calling thread's scheduler, if one has been constructed
    fn try_current() -> Option<Rc<Scheduler>> {
        CURRENT.with(|cell| cell.borrow().clone())
    }

    /// This scheduler's identity
    pub fn id(&self) -> SchedulerId {
        self.id
    }

    pub(crate) fn core_mut(&self) -> std::cell::RefMut<'_, SchedCore> {
        self.core.borrow_mut()
    }

    /// The thread's designated main tasklet
    pub fn main(&self) -> Arc<Tasklet> {
        self.main.clone()
    }

    /// Number of tasklets currently in the run queue
    pub fn runnable_count(&self) -> usize {
        self.core.borrow().run_queue.len()
    }

    /// The tasklet currently being trampolined, if any
    pub fn current_tasklet(&self) -> Option<Arc<Tasklet>> {
        self.core.borrow().current.clone()
    }

    /// Current switch-trap counter; non-zero blocks explicit switches
    pub fn switch_trap(&self) -> i32 {
        self.core.borrow().switch_trap
    }

    /// Set the switch-trap counter, returning the previous value
    pub fn set_switch_trap(&self, value: i32) -> i32 {
        let mut core = self.core.borrow_mut();
        std::mem::replace(&mut core.switch_trap, value)
    }

    /// Install (or clear) the uncaught-exception handler
    pub fn set_error_handler(&self, handler: Option<ErrorHandler>) {
        self.core.borrow_mut().error_handler = handler;
    }

    /// Scheduler statistics
    pub fn stats(&self) -> SchedulerStats {
        let core = self.core.borrow();
        SchedulerStats {
            tasklets_spawned: core.spawned,
            tasklets_completed: core.completed,
            active_tasklets: core.run_queue.len() + usize::from(core.current.is_some()),
        }
    }

    // =========================================================================
    // Run queue
    // =========================================================================

    /// Drain cross-thread wake requests into the run queue
    pub(crate) fn drain_wakes(&self) {
        while let Ok(msg) = self.wake_rx.try_recv() {
            if msg.tasklet.is_main() {
                // A foreign thread unblocked our main; the host loop polls
                // its state, it never sits in the run queue.
                if msg.tasklet.state() == TaskletState::Blocked {
                    msg.tasklet.set_state(TaskletState::Running);
                }
                continue;
            }
            // A wake can go stale in transit: the tasklet may have run,
            // blocked again, or died since the sender queued it. Only a
            // tasklet still waiting on its wake may be scheduled. A
            // delivered waiter stays Blocked until it lands here but has
            // already left its channel queue; one with live membership is
            // genuinely parked and keeps its place.
            let wants_wake = match msg.tasklet.state() {
                TaskletState::Paused | TaskletState::Scheduled => true,
                TaskletState::Blocked => msg.tasklet.blocked_on().is_none(),
                TaskletState::Running | TaskletState::Dead | TaskletState::Unbound => false,
            };
            if wants_wake {
                self.insert_ready(&msg.tasklet, msg.front);
            }
        }
    }

    /// Put a tasklet into the run queue (front or back), marking it Scheduled
    pub(crate) fn insert_ready(&self, tasklet: &Arc<Tasklet>, front: bool) {
        let mut core = self.core.borrow_mut();
        if core
            .run_queue
            .iter()
            .any(|queued| queued.id() == tasklet.id())
        {
            return;
        }
        tasklet.set_state(TaskletState::Scheduled);
        if front {
            core.run_queue.push_front(tasklet.clone());
        } else {
            core.run_queue.push_back(tasklet.clone());
        }
        core.spawned += 1;
    }

    fn remove_from_queue(&self, tasklet: &Arc<Tasklet>) -> SchedResult<()> {
        let mut core = self.core.borrow_mut();
        if core.current.as_ref().map(|c| c.id()) == Some(tasklet.id()) {
            return Err(SchedError::State(
                "cannot remove the running tasklet; use schedule_remove",
            ));
        }
        let position = core
            .run_queue
            .iter()
            .position(|queued| queued.id() == tasklet.id());
        let Some(idx) = position else { return Ok(()) };

        let sole_runnable = core.run_queue.len() == 1
            && core.current.as_ref().map_or(true, |c| c.is_main());
        if sole_runnable {
            return Err(SchedError::State(
                "the last runnable tasklet cannot be removed",
            ));
        }

        core.run_queue.remove(idx);
        drop(core);
        tasklet.set_state(TaskletState::Paused);
        Ok(())
    }

    fn pop_next(&self) -> Option<Arc<Tasklet>> {
        self.core.borrow_mut().run_queue.pop_front()
    }

    fn push_back_ready(&self, tasklet: Arc<Tasklet>) {
        tasklet.set_state(TaskletState::Scheduled);
        self.core.borrow_mut().run_queue.push_back(tasklet);
    }

    // =========================================================================
    // Running
    // =========================================================================

    /// Drain the run queue until it is empty.
    ///
    /// Uncaught exceptions (other than `TaskletExit`) surface here when no
    /// error handler is installed; the thread is the final watcher.
    pub fn run(&self) -> SchedResult<()> {
        self.drain_loop().map(|_| ())
    }

    /// One drain iteration: dispatch the head tasklet if any.
    /// Returns false when the queue was empty.
    pub(crate) fn step_once(&self) -> SchedResult<bool> {
        self.drain_wakes();
        let Some(tasklet) = self.pop_next() else {
            return Ok(false);
        };
        if tasklet.state() == TaskletState::Dead {
            return Ok(true);
        }
        match self.dispatch(&tasklet)? {
            Dispatch::Yielded => self.push_back_ready(tasklet),
            Dispatch::Interrupted => {
                // step_once never dispatches for a watchdog frame; an
                // interrupt landing here just parks the tasklet.
                tasklet.set_state(TaskletState::Paused);
            }
            Dispatch::Paused | Dispatch::Blocked | Dispatch::Finished => {}
        }
        Ok(true)
    }

    /// Drain until empty or until the innermost watchdog frame interrupts,
    /// returning the interrupted tasklet in that case.
    pub(crate) fn drain_loop(&self) -> SchedResult<Option<Arc<Tasklet>>> {
        loop {
            self.drain_wakes();
            let Some(tasklet) = self.pop_next() else {
                return Ok(None);
            };
            if tasklet.state() == TaskletState::Dead {
                continue;
            }
            match self.dispatch(&tasklet)? {
                Dispatch::Yielded => self.push_back_ready(tasklet),
                Dispatch::Interrupted => return Ok(Some(tasklet)),
                Dispatch::Paused | Dispatch::Blocked | Dispatch::Finished => {}
            }
        }
    }

    /// Explicitly run one tasklet until it yields, blocks, pauses, or dies,
    /// bypassing run-queue order.
    pub(crate) fn run_target(&self, tasklet: &Arc<Tasklet>) -> SchedResult<()> {
        // If queued, it runs now instead of at its turn.
        {
            let mut core = self.core.borrow_mut();
            if let Some(idx) = core
                .run_queue
                .iter()
                .position(|queued| queued.id() == tasklet.id())
            {
                core.run_queue.remove(idx);
            }
        }
        match self.dispatch(tasklet)? {
            Dispatch::Yielded => {
                self.push_back_ready(tasklet.clone());
                Ok(())
            }
            Dispatch::Interrupted => {
                tasklet.set_state(TaskletState::Paused);
                Ok(())
            }
            Dispatch::Paused | Dispatch::Blocked | Dispatch::Finished => Ok(()),
        }
    }

    /// Run the local scheduler until the blocked main tasklet is released.
    /// The queue running dry while main is still parked is a deadlock.
    pub(crate) fn drive_main_blocked(&self, channel: &Channel) -> SchedResult<()> {
        loop {
            if self.main.state() != TaskletState::Blocked {
                self.main.set_state(TaskletState::Running);
                return Ok(());
            }
            self.drain_wakes();
            if self.main.state() != TaskletState::Blocked {
                continue;
            }
            let made_progress = match self.step_once() {
                Ok(progress) => progress,
                Err(err) => {
                    channel.remove_waiter(&self.main);
                    self.main.set_state(TaskletState::Running);
                    return Err(err);
                }
            };
            if !made_progress && self.main.state() == TaskletState::Blocked {
                // The channel lock arbitrates the race against a remote
                // delivery: failing to remove ourselves means we were just
                // handed a payload and are not actually stuck.
                if !channel.remove_waiter(&self.main) {
                    continue;
                }
                self.main.set_state(TaskletState::Running);
                return Err(SchedError::Deadlock);
            }
        }
    }

    /// Trampoline one tasklet until it gives up control
    pub(crate) fn dispatch(&self, tasklet: &Arc<Tasklet>) -> SchedResult<Dispatch> {
        self.core.borrow_mut().depth += 1;
        let result = self.dispatch_inner(tasklet);
        self.core.borrow_mut().depth -= 1;
        result
    }

    fn dispatch_inner(&self, tasklet: &Arc<Tasklet>) -> SchedResult<Dispatch> {
        loop {
            let wake = tasklet.take_wake();
            let Some(mut invocable) = tasklet.take_invocable() else {
                return Err(SchedError::State("tasklet has no continuation to run"));
            };

            let previous = {
                let mut core = self.core.borrow_mut();
                core.current.replace(tasklet.clone())
            };
            tasklet.set_state(TaskletState::Running);

            let mut cx = RunCx {
                sched: self,
                current: tasklet.clone(),
                pause: false,
            };
            let poll = invocable.resume(&mut cx, wake);
            let pause = cx.pause;

            self.core.borrow_mut().current = previous;

            if !matches!(poll, Poll::Done(_) | Poll::Raised(_)) {
                tasklet.put_invocable(invocable);
            }

            // Every resume return is a checkpoint for the watchdog budget;
            // only Step/Yield are interruptible suspend points.
            let eligible = matches!(poll, Poll::Step | Poll::Yield);
            let interrupted = self.note_checkpoint(tasklet, eligible);

            match poll {
                Poll::Step => {
                    if interrupted {
                        tasklet.set_state(TaskletState::Paused);
                        return Ok(Dispatch::Interrupted);
                    }
                    if pause {
                        tasklet.set_state(TaskletState::Paused);
                        return Ok(Dispatch::Paused);
                    }
                }
                Poll::Yield => {
                    if interrupted {
                        tasklet.set_state(TaskletState::Paused);
                        return Ok(Dispatch::Interrupted);
                    }
                    if pause {
                        tasklet.set_state(TaskletState::Paused);
                        return Ok(Dispatch::Paused);
                    }
                    return Ok(Dispatch::Yielded);
                }
                Poll::Block => {
                    // The channel operation already marked the tasklet
                    // blocked and parked it in the waiter queue.
                    return Ok(Dispatch::Blocked);
                }
                Poll::Done(value) => {
                    tasklet.complete(value);
                    self.core.borrow_mut().completed += 1;
                    return Ok(Dispatch::Finished);
                }
                Poll::Raised(exc) => {
                    tasklet.fail(exc.clone());
                    self.core.borrow_mut().completed += 1;
                    if exc.is_exit() {
                        // Cooperative cancellation propagating out is the
                        // expected way to die; nothing escalates.
                        return Ok(Dispatch::Finished);
                    }
                    let handler = self.core.borrow().error_handler.clone();
                    if let Some(handler) = handler {
                        handler(tasklet, &exc);
                        return Ok(Dispatch::Finished);
                    }
                    return Err(SchedError::Uncaught {
                        tasklet: tasklet.id().as_u64(),
                        exc,
                    });
                }
            }
        }
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        DIRECTORY.remove(&self.id);
        self.main.set_state(TaskletState::Dead);
    }
}

/// Whether a scheduler with this identity is still alive
pub(crate) fn scheduler_exists(id: SchedulerId) -> bool {
    DIRECTORY.contains_key(&id)
}

/// Route a woken tasklet back to its owning scheduler. `front` puts it at
/// the head of the run queue (it runs next).
pub(crate) fn schedule_woken(tasklet: &Arc<Tasklet>, front: bool) {
    if tasklet.state() == TaskletState::Dead {
        return;
    }
    if tasklet.is_main() {
        // Main tasklets never sit in a run queue; the blocked host loop
        // polls their state.
        tasklet.set_state(TaskletState::Running);
        return;
    }
    let Some(affinity) = tasklet.affinity() else {
        tasklet.set_state(TaskletState::Paused);
        return;
    };
    if let Some(local) = Scheduler::try_current() {
        if local.id() == affinity {
            local.insert_ready(tasklet, front);
            return;
        }
    }
    match DIRECTORY.get(&affinity) {
        Some(sender) => {
            let _ = sender.send(WakeMsg {
                tasklet: tasklet.clone(),
                front,
            });
        }
        None => {
            // Owning thread is gone; the tasklet is stranded until rebound.
            tasklet.set_state(TaskletState::Paused);
        }
    }
}

/// Insert a tasklet into its owning scheduler's run queue
pub(crate) fn route_insert(tasklet: &Arc<Tasklet>, front: bool) -> SchedResult<()> {
    let Some(affinity) = tasklet.affinity() else {
        return Err(SchedError::State("no thread"));
    };
    let current = Scheduler::current();
    if affinity == current.id() {
        current.insert_ready(tasklet, front);
        return Ok(());
    }
    match DIRECTORY.get(&affinity) {
        Some(sender) => {
            sender
                .send(WakeMsg {
                    tasklet: tasklet.clone(),
                    front,
                })
                .map_err(|_| SchedError::State("no thread"))
        }
        None => Err(SchedError::State("no thread")),
    }
}

/// Remove a tasklet from its owning scheduler's run queue
pub(crate) fn route_remove(tasklet: &Arc<Tasklet>) -> SchedResult<()> {
    let current = Scheduler::current();
    if tasklet.affinity() != Some(current.id()) {
        return Err(SchedError::State(
            "cannot remove a tasklet on another thread",
        ));
    }
    current.remove_from_queue(tasklet)
}

/// Explicitly switch to a tasklet, bypassing run-queue order. A tasklet on
/// another thread is scheduled at the head of its own queue instead.
pub(crate) fn route_run(tasklet: &Arc<Tasklet>) -> SchedResult<()> {
    let current = Scheduler::current();
    check_explicit_switch(&current, tasklet)?;
    if tasklet.affinity() != Some(current.id()) {
        return route_insert(tasklet, true);
    }
    current.run_target(tasklet)
}

/// Validations shared by every explicit switch
fn check_explicit_switch(sched: &Scheduler, target: &Arc<Tasklet>) -> SchedResult<()> {
    if sched.switch_trap() != 0 {
        return Err(SchedError::State("switch trap is active"));
    }
    match target.state() {
        TaskletState::Blocked => Err(SchedError::State("cannot run a blocked tasklet")),
        TaskletState::Running => Err(SchedError::State("tasklet is already running")),
        TaskletState::Dead => Err(SchedError::State("cannot run a dead tasklet")),
        TaskletState::Unbound => Err(SchedError::State("cannot run an unbound tasklet")),
        TaskletState::Scheduled | TaskletState::Paused => Ok(()),
    }
}

// =============================================================================
// RunCx: the execution context handed to a resuming tasklet body
// =============================================================================

/// Outcome of a receive attempt from inside a tasklet body
#[derive(Debug)]
pub enum ReceivePoll {
    /// A value arrived; keep running
    Value(Value),
    /// An exception arrived; re-raise it (`Poll::Raised`)
    Raised(Exc),
    /// The channel is closed and drained
    Closed,
    /// Parked on the channel; return `Poll::Block`
    Pending,
}

/// Scheduler capabilities available to a running tasklet body.
///
/// All scheduler interaction from inside a body goes through this context;
/// the operations that give up control return the [`Poll`] the body must
/// propagate to actually suspend.
pub struct RunCx<'a> {
    sched: &'a Scheduler,
    current: Arc<Tasklet>,
    pause: bool,
}

impl RunCx<'_> {
    /// The tasklet being resumed
    pub fn current(&self) -> &Arc<Tasklet> {
        &self.current
    }

    /// The identity of the scheduler running this body
    pub fn scheduler_id(&self) -> SchedulerId {
        self.sched.id()
    }

    /// Voluntary yield: return the result to go to the back of the run queue
    pub fn schedule(&mut self) -> Poll {
        Poll::Yield
    }

    /// Yield and leave the run queue (paused until explicitly resumed)
    pub fn schedule_remove(&mut self) -> Poll {
        self.pause = true;
        Poll::Yield
    }

    fn would_block(&self) -> SchedResult<()> {
        if self.current.block_trap() {
            return Err(SchedError::State("block trap is set"));
        }
        self.sched.drain_wakes();
        // Blocking with an empty queue is fine while the host frame below
        // can still make progress; it is a deadlock once main is parked too.
        if self.sched.runnable_count() == 0
            && self.sched.main.state() == TaskletState::Blocked
        {
            return Err(SchedError::Deadlock);
        }
        Ok(())
    }

    /// Send a value on a channel.
    ///
    /// `Ok(None)`: transferred, keep running. `Ok(Some(poll))`: return the
    /// poll, either a hand-off yield to the preferred receiver or a block.
    pub fn send(&mut self, channel: &Arc<Channel>, value: Value) -> SchedResult<Option<Poll>> {
        self.send_slot(channel, WakeSlot::Value(value))
    }

    /// Send an exception to be re-raised at the matched receiver
    pub fn send_exception(
        &mut self,
        channel: &Arc<Channel>,
        exc: Exc,
    ) -> SchedResult<Option<Poll>> {
        self.send_slot(channel, WakeSlot::Exception(exc))
    }

    fn send_slot(
        &mut self,
        channel: &Arc<Channel>,
        payload: WakeSlot,
    ) -> SchedResult<Option<Poll>> {
        let preference = channel.preference();
        let outcome = channel.send_raw(&self.current, payload, || self.would_block())?;
        match outcome {
            SendOutcome::Delivered(receiver) => {
                let local = receiver.affinity() == Some(self.sched.id()) && !receiver.is_main();
                if local && preference == Preference::Receiver {
                    // The receiver runs next; the sender goes to the tail.
                    schedule_woken(&receiver, true);
                    Ok(Some(Poll::Yield))
                } else {
                    schedule_woken(&receiver, preference == Preference::Receiver);
                    Ok(None)
                }
            }
            SendOutcome::Enqueued => Ok(Some(Poll::Block)),
        }
    }

    /// Receive from a channel
    pub fn receive(&mut self, channel: &Arc<Channel>) -> SchedResult<ReceivePoll> {
        let preference = channel.preference();
        let outcome = channel.receive_raw(&self.current, || self.would_block())?;
        match outcome {
            ReceiveOutcome::Ready { payload, sender } => {
                schedule_woken(&sender, preference == Preference::Sender);
                match payload {
                    WakeSlot::Value(value) => Ok(ReceivePoll::Value(value)),
                    WakeSlot::Exception(mut exc) => {
                        exc.push_frame("channel receive");
                        Ok(ReceivePoll::Raised(exc))
                    }
                    WakeSlot::Closed => Ok(ReceivePoll::Closed),
                }
            }
            ReceiveOutcome::Closed => Ok(ReceivePoll::Closed),
            ReceiveOutcome::Enqueued => Ok(ReceivePoll::Pending),
        }
    }

    /// Close a channel (see [`Channel::close`])
    pub fn close(&self, channel: &Arc<Channel>) {
        channel.close();
    }

    /// Explicitly run another tasklet from inside this body. The caller
    /// gains a native frame for the duration (hard state).
    pub fn run(&mut self, target: &Arc<Tasklet>) -> SchedResult<()> {
        if target.affinity() != Some(self.sched.id()) {
            return Err(SchedError::State("cannot run a tasklet on another thread"));
        }
        check_explicit_switch(self.sched, target)?;
        self.current.with_continuation(|c| c.enter_native());
        let result = self.sched.run_target(target);
        self.current.with_continuation(|c| c.exit_native());
        result
    }

    /// Switch to another tasklet and pause the caller: the target is placed
    /// at the head of the queue and the caller leaves the queue when the
    /// returned poll propagates. Both parties must share this scheduler.
    pub fn switch_to(&mut self, target: &Arc<Tasklet>) -> SchedResult<Poll> {
        if target.affinity() != Some(self.sched.id()) {
            return Err(SchedError::State("cannot switch to a tasklet on another thread"));
        }
        check_explicit_switch(self.sched, target)?;
        self.sched.insert_ready(target, true);
        self.pause = true;
        Ok(Poll::Yield)
    }

    /// Kill another tasklet from inside this body
    pub fn kill(&mut self, target: &Arc<Tasklet>, pending: bool) -> SchedResult<()> {
        if pending {
            return target.kill(true);
        }
        // Immediate kill re-enters the trampoline: a native frame for us.
        self.current.with_continuation(|c| c.enter_native());
        let result = target.kill(false);
        self.current.with_continuation(|c| c.exit_native());
        result
    }

    /// Run a nested bounded-step watchdog from inside this body. The caller
    /// holds a native frame for the duration; the nested frame has interrupt
    /// priority over any enclosing one.
    pub fn run_watchdog(
        &mut self,
        steps: usize,
        soft: bool,
        ignore_nesting: bool,
    ) -> SchedResult<Option<Arc<Tasklet>>> {
        self.current.with_continuation(|c| c.enter_native());
        let result = self.sched.run_watchdog(steps, soft, ignore_nesting);
        self.current.with_continuation(|c| c.exit_native());
        result
    }

    /// Enter a native section: the tasklet keeps `nesting > 0` across
    /// suspensions until [`RunCx::end_native`], making it hard state.
    pub fn begin_native(&self) {
        self.current.with_continuation(|c| c.enter_native());
    }

    /// Leave a native section entered with [`RunCx::begin_native`]
    pub fn end_native(&self) {
        self.current.with_continuation(|c| c.exit_native());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builtin::Countdown;
    use crate::invoke::{FnInvocable, Wake};
    use parking_lot::Mutex;

    fn spawn_marker(log: &Arc<Mutex<Vec<i64>>>, tag: i64) -> Arc<Tasklet> {
        let log = log.clone();
        let t = Tasklet::new();
        t.bind(Box::new(FnInvocable::new(move |_cx, _wake| {
            log.lock().push(tag);
            Poll::Done(Value::Null)
        })))
        .unwrap();
        t
    }

    #[test]
    fn test_run_drains_in_fifo_order() {
        let sched = Scheduler::current();
        let log = Arc::new(Mutex::new(Vec::new()));

        for tag in [1, 2, 3] {
            spawn_marker(&log, tag).insert().unwrap();
        }
        sched.run().unwrap();
        assert_eq!(*log.lock(), vec![1, 2, 3]);
        assert_eq!(sched.runnable_count(), 0);
    }

    #[test]
    fn test_yield_round_robins() {
        let sched = Scheduler::current();
        let log = Arc::new(Mutex::new(Vec::new()));

        for tag in [1i64, 2] {
            let log = log.clone();
            let mut turns = 0;
            let t = Tasklet::new();
            t.bind(Box::new(FnInvocable::new(move |cx, _wake| {
                log.lock().push(tag);
                turns += 1;
                if turns < 2 {
                    cx.schedule()
                } else {
                    Poll::Done(Value::Null)
                }
            })))
            .unwrap();
            t.insert().unwrap();
        }
        sched.run().unwrap();
        assert_eq!(*log.lock(), vec![1, 2, 1, 2]);
    }

    #[test]
    fn test_completed_tasklet_reports_result() {
        let sched = Scheduler::current();
        let t = Tasklet::new();
        t.bind(Box::new(Countdown::new(2))).unwrap();
        t.insert().unwrap();
        sched.run().unwrap();
        assert_eq!(t.state(), TaskletState::Dead);
        assert_eq!(t.result(), Some(Value::Int(0)));
        assert!(t.error().is_none());
    }

    #[test]
    fn test_explicit_run_bypasses_queue_order() {
        let sched = Scheduler::current();
        let log = Arc::new(Mutex::new(Vec::new()));

        let first = spawn_marker(&log, 1);
        let second = spawn_marker(&log, 2);
        first.insert().unwrap();
        second.insert().unwrap();

        second.run().unwrap();
        assert_eq!(*log.lock(), vec![2]);
        assert_eq!(second.state(), TaskletState::Dead);

        sched.run().unwrap();
        assert_eq!(*log.lock(), vec![2, 1]);
    }

    #[test]
    fn test_switch_trap_blocks_explicit_switches() {
        let sched = Scheduler::current();
        let t = Tasklet::new();
        t.bind(Box::new(Countdown::new(1))).unwrap();
        t.insert().unwrap();

        assert_eq!(sched.set_switch_trap(1), 0);
        assert!(matches!(t.run(), Err(SchedError::State(_))));
        assert_eq!(sched.set_switch_trap(0), 1);
        t.run().unwrap();
        sched.run().unwrap();
        assert_eq!(t.state(), TaskletState::Dead);
    }

    #[test]
    fn test_uncaught_exception_without_handler_surfaces() {
        let sched = Scheduler::current();
        let t = Tasklet::new();
        t.bind(Box::new(FnInvocable::new(|_cx, _wake| {
            Poll::Raised(Exc::error(Value::from("boom")))
        })))
        .unwrap();
        t.insert().unwrap();

        match sched.run() {
            Err(SchedError::Uncaught { tasklet, exc }) => {
                assert_eq!(tasklet, t.id().as_u64());
                assert_eq!(exc.value, Value::from("boom"));
            }
            other => panic!("expected uncaught error, got {:?}", other),
        }
        assert_eq!(t.state(), TaskletState::Dead);
        assert!(t.error().is_some());
    }

    #[test]
    fn test_error_handler_swallows_uncaught() {
        let sched = Scheduler::current();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        sched.set_error_handler(Some(Rc::new(move |t: &Arc<Tasklet>, exc: &Exc| {
            sink.lock().push((t.id().as_u64(), exc.value.clone()));
        })));

        let t = Tasklet::new();
        t.bind(Box::new(FnInvocable::new(|_cx, _wake| {
            Poll::Raised(Exc::error(Value::Int(9)))
        })))
        .unwrap();
        t.insert().unwrap();
        sched.run().unwrap();
        sched.set_error_handler(None);

        assert_eq!(*seen.lock(), vec![(t.id().as_u64(), Value::Int(9))]);
    }

    #[test]
    fn test_tasklet_exit_propagates_silently() {
        let sched = Scheduler::current();
        let t = Tasklet::new();
        t.bind(Box::new(FnInvocable::new(|_cx, _wake| {
            Poll::Raised(Exc::tasklet_exit())
        })))
        .unwrap();
        t.insert().unwrap();
        sched.run().unwrap();
        assert_eq!(t.state(), TaskletState::Dead);
    }

    #[test]
    fn test_kill_scheduled_immediately() {
        let t = Tasklet::new();
        t.bind(Box::new(Countdown::new(100))).unwrap();
        t.insert().unwrap();
        t.kill(false).unwrap();
        assert_eq!(t.state(), TaskletState::Dead);
    }

    #[test]
    fn test_kill_pending_defers_to_next_switch_in() {
        let sched = Scheduler::current();
        let t = Tasklet::new();
        t.bind(Box::new(Countdown::new(100))).unwrap();
        t.insert().unwrap();
        t.kill(true).unwrap();
        assert!(t.is_alive());
        sched.run().unwrap();
        assert_eq!(t.state(), TaskletState::Dead);
    }

    #[test]
    fn test_schedule_remove_pauses_the_caller() {
        let sched = Scheduler::current();
        let t = Tasklet::new();
        let mut resumed = 0;
        t.bind(Box::new(FnInvocable::new(move |cx, _wake| {
            resumed += 1;
            if resumed == 1 {
                cx.schedule_remove()
            } else {
                Poll::Done(Value::Int(resumed))
            }
        })))
        .unwrap();
        t.insert().unwrap();
        sched.run().unwrap();
        assert_eq!(t.state(), TaskletState::Paused);

        t.insert().unwrap();
        sched.run().unwrap();
        assert_eq!(t.result(), Some(Value::Int(2)));
    }

    #[test]
    fn test_remove_last_runnable_fails() {
        let sched = Scheduler::current();
        let t = Tasklet::new();
        t.bind(Box::new(Countdown::new(1))).unwrap();
        t.insert().unwrap();
        assert!(matches!(t.remove(), Err(SchedError::State(_))));

        let other = Tasklet::new();
        other.bind(Box::new(Countdown::new(1))).unwrap();
        other.insert().unwrap();
        t.remove().unwrap();
        assert_eq!(t.state(), TaskletState::Paused);
        sched.run().unwrap();
    }

    #[test]
    fn test_stale_wake_leaves_blocked_tasklet_parked() {
        let sched = Scheduler::current();
        let ch = Channel::new();

        let sender = {
            let ch = ch.clone();
            let mut sent = false;
            let t = Tasklet::new();
            t.bind(Box::new(FnInvocable::new(move |cx, wake| {
                if let Wake::Exception(exc) = wake {
                    return Poll::Raised(exc);
                }
                if sent {
                    return Poll::Done(Value::Null);
                }
                sent = true;
                match cx.send(&ch, Value::Int(11)) {
                    Ok(None) => Poll::Done(Value::Null),
                    Ok(Some(poll)) => poll,
                    Err(_) => Poll::Raised(Exc::error(Value::from("send failed"))),
                }
            })))
            .unwrap();
            t.insert().unwrap();
            t
        };
        sched.run().unwrap();
        assert_eq!(sender.state(), TaskletState::Blocked);

        // A wake that raced the block: by the time it drains, the tasklet
        // is parked in the waiter queue and must not be rescheduled over it.
        let wake_tx = DIRECTORY.get(&sched.id()).unwrap().clone();
        wake_tx
            .send(WakeMsg {
                tasklet: sender.clone(),
                front: false,
            })
            .unwrap();
        sched.run().unwrap();

        assert_eq!(sender.state(), TaskletState::Blocked);
        assert_eq!(ch.balance(), 1);

        // The queued payload is still deliverable.
        assert_eq!(ch.receive().unwrap(), Value::Int(11));
        sched.run().unwrap();
        assert_eq!(sender.state(), TaskletState::Dead);
    }

    #[test]
    fn test_current_tasklet_tracks_the_dispatch() {
        let sched = Scheduler::current();
        assert!(sched.current_tasklet().is_none());

        let seen = Arc::new(Mutex::new(None));
        let sink = seen.clone();
        let t = Tasklet::new();
        t.bind(Box::new(FnInvocable::new(move |cx, _wake| {
            let running = Scheduler::current().current_tasklet().map(|cur| cur.id());
            *sink.lock() = Some((running, cx.scheduler_id()));
            Poll::Done(Value::Null)
        })))
        .unwrap();
        t.insert().unwrap();
        sched.run().unwrap();

        assert_eq!(*seen.lock(), Some((Some(t.id()), sched.id())));
        assert!(sched.current_tasklet().is_none());
    }

    #[test]
    fn test_stats_track_completions() {
        let sched = Scheduler::current();
        let before = sched.stats().tasklets_completed;
        let t = Tasklet::new();
        t.bind(Box::new(Countdown::new(1))).unwrap();
        t.insert().unwrap();
        sched.run().unwrap();
        assert_eq!(sched.stats().tasklets_completed, before + 1);
        assert_eq!(sched.stats().active_tasklets, 0);
    }
}
