//! Tasklet structure and execution state

use crate::continuation::Continuation;
use crate::error::{SchedError, SchedResult};
use crate::exception::Exc;
use crate::invoke::{Invocable, Wake};
use crate::scheduler::scheduler::{self, Scheduler, SchedulerId};
use crate::sync::{registry as channel_registry, ChannelId, Dir};
use crate::value::Value;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

/// Unique identifier for a Tasklet
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct TaskletId(u64);

static NEXT_TASKLET_ID: AtomicU64 = AtomicU64::new(1);

impl TaskletId {
    /// Generate a new unique TaskletId
    pub fn new() -> Self {
        TaskletId(NEXT_TASKLET_ID.fetch_add(1, Ordering::Relaxed))
    }

    /// Get the numeric ID value
    pub fn as_u64(self) -> u64 {
        self.0
    }

    /// Create a TaskletId from a u64 value
    pub fn from_u64(id: u64) -> Self {
        TaskletId(id)
    }
}

impl Default for TaskletId {
    fn default() -> Self {
        Self::new()
    }
}

/// State of a Tasklet
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum TaskletState {
    /// Created, no entry point bound yet
    Unbound,
    /// In a scheduler's run queue, waiting for its turn
    Scheduled,
    /// Bound but not in any run queue
    Paused,
    /// Parked on a channel
    Blocked,
    /// Currently executing
    Running,
    /// Finished; terminal
    Dead,
}

/// What a channel delivery left for the tasklet to pick up on switch-in
#[derive(Debug, Clone)]
pub(crate) enum WakeSlot {
    /// A received value
    Value(Value),
    /// An exception to re-raise
    Exception(Exc),
    /// The channel closed underneath a blocked receiver
    Closed,
}

/// Channel membership of a blocked tasklet
#[derive(Debug, Copy, Clone)]
pub(crate) struct BlockedOn {
    pub channel: ChannelId,
    pub dir: Dir,
}

/// A cooperatively scheduled logical thread
pub struct Tasklet {
    /// Unique identifier
    id: TaskletId,

    /// Current state
    state: Mutex<TaskletState>,

    /// Suspended execution state: the bound invocable plus nesting level
    continuation: Mutex<Continuation>,

    /// Suppresses watchdog interruption (not explicit switches) while set
    atomic: AtomicBool,

    /// Raise instead of blocking on channel operations
    block_trap: AtomicBool,

    /// Allow forced interruption despite live native frames
    ignore_nesting: AtomicBool,

    /// Owning scheduler, or None while unbound to any thread
    affinity: Mutex<Option<SchedulerId>>,

    /// Exception injected by kill or a cross-tasklet raise, delivered at the
    /// next switch-in (takes precedence over the wake slot)
    pending_exc: Mutex<Option<Exc>>,

    /// Channel delivery waiting to be picked up on switch-in
    wake_slot: Mutex<Option<WakeSlot>>,

    /// Channel this tasklet is parked on, if blocked
    blocked_on: Mutex<Option<BlockedOn>>,

    /// Result value once dead
    result: Mutex<Option<Value>>,

    /// Exception that terminated this tasklet, if it died raising
    error: Mutex<Option<Exc>>,

    /// Whether this is a scheduler's main tasklet
    is_main: bool,
}

impl Tasklet {
    /// Create a new unbound tasklet owned by the current thread's scheduler
    pub fn new() -> Arc<Self> {
        let affinity = Scheduler::current().id();
        Arc::new(Self::raw(TaskletId::new(), Some(affinity), false))
    }

    /// Create the main tasklet for a scheduler (crate-internal)
    pub(crate) fn new_main(affinity: SchedulerId) -> Arc<Self> {
        let tasklet = Self::raw(TaskletId::new(), Some(affinity), true);
        *tasklet.state.lock() = TaskletState::Running;
        Arc::new(tasklet)
    }

    /// Create a tasklet with explicit identity (continuation restore path)
    pub(crate) fn raw(id: TaskletId, affinity: Option<SchedulerId>, is_main: bool) -> Self {
        Self {
            id,
            state: Mutex::new(TaskletState::Unbound),
            continuation: Mutex::new(Continuation::empty()),
            atomic: AtomicBool::new(false),
            block_trap: AtomicBool::new(false),
            ignore_nesting: AtomicBool::new(false),
            affinity: Mutex::new(affinity),
            pending_exc: Mutex::new(None),
            wake_slot: Mutex::new(None),
            blocked_on: Mutex::new(None),
            result: Mutex::new(None),
            error: Mutex::new(None),
            is_main,
        }
    }

    /// Get the tasklet's unique ID
    pub fn id(&self) -> TaskletId {
        self.id
    }

    /// Whether this is a scheduler's main tasklet
    pub fn is_main(&self) -> bool {
        self.is_main
    }

    /// Get the current state
    pub fn state(&self) -> TaskletState {
        *self.state.lock()
    }

    pub(crate) fn set_state(&self, state: TaskletState) {
        *self.state.lock() = state;
    }

    /// Alive means bound and not yet dead
    pub fn is_alive(&self) -> bool {
        !matches!(self.state(), TaskletState::Unbound | TaskletState::Dead)
    }

    /// The scheduler this tasklet belongs to
    pub fn affinity(&self) -> Option<SchedulerId> {
        *self.affinity.lock()
    }

    pub(crate) fn set_affinity(&self, affinity: Option<SchedulerId>) {
        *self.affinity.lock() = affinity;
    }

    /// Current nesting level: 0 means soft-capturable
    pub fn nesting(&self) -> u32 {
        self.continuation.lock().nesting()
    }

    // =========================================================================
    // Flags
    // =========================================================================

    /// Whether watchdog interruption is currently suppressed
    pub fn atomic(&self) -> bool {
        self.atomic.load(Ordering::Acquire)
    }

    /// Set the atomic flag, returning the previous value. Scoped usage
    /// (save, operate, restore) is the caller's responsibility.
    pub fn set_atomic(&self, value: bool) -> bool {
        self.atomic.swap(value, Ordering::AcqRel)
    }

    /// Whether blocking operations raise instead of blocking
    pub fn block_trap(&self) -> bool {
        self.block_trap.load(Ordering::Acquire)
    }

    /// Set the block trap flag, returning the previous value
    pub fn set_block_trap(&self, value: bool) -> bool {
        self.block_trap.swap(value, Ordering::AcqRel)
    }

    /// Whether forced switches may ignore live native frames
    pub fn ignore_nesting(&self) -> bool {
        self.ignore_nesting.load(Ordering::Acquire)
    }

    /// Set the ignore-nesting flag, returning the previous value
    pub fn set_ignore_nesting(&self, value: bool) -> bool {
        self.ignore_nesting.swap(value, Ordering::AcqRel)
    }

    // =========================================================================
    // Binding and lifecycle
    // =========================================================================

    /// Attach an entry point without scheduling. Fails while the tasklet is
    /// alive; a dead tasklet may be rebound and revived.
    pub fn bind(&self, invocable: Box<dyn Invocable>) -> SchedResult<()> {
        if self.is_alive() {
            return Err(SchedError::State("cannot bind an alive tasklet"));
        }
        if self.is_main {
            return Err(SchedError::State("cannot rebind the main tasklet"));
        }
        *self.continuation.lock() = Continuation::new(invocable);
        *self.error.lock() = None;
        *self.result.lock() = None;
        self.set_state(TaskletState::Paused);
        Ok(())
    }

    /// Add to the owning scheduler's run queue
    pub fn insert(self: &Arc<Self>) -> SchedResult<()> {
        match self.state() {
            TaskletState::Unbound => Err(SchedError::State("cannot insert an unbound tasklet")),
            TaskletState::Dead => Err(SchedError::State("cannot insert a dead tasklet")),
            TaskletState::Blocked => Err(SchedError::State("cannot insert a blocked tasklet")),
            TaskletState::Scheduled | TaskletState::Running => Ok(()),
            TaskletState::Paused => scheduler::route_insert(self, false),
        }
    }

    /// Remove from the owning scheduler's run queue
    pub fn remove(self: &Arc<Self>) -> SchedResult<()> {
        match self.state() {
            TaskletState::Blocked => Err(SchedError::State("cannot remove a blocked tasklet")),
            TaskletState::Scheduled | TaskletState::Running => scheduler::route_remove(self),
            _ => Ok(()),
        }
    }

    /// Force an explicit switch directly to this tasklet, bypassing the run
    /// queue's round-robin order.
    pub fn run(self: &Arc<Self>) -> SchedResult<()> {
        scheduler::route_run(self)
    }

    /// Like `run`, but both parties must share a scheduler thread. From the
    /// host this behaves as `run`; from inside a tasklet body use
    /// [`RunCx::switch_to`](crate::scheduler::RunCx::switch_to), which also
    /// pauses the caller.
    pub fn switch(self: &Arc<Self>) -> SchedResult<()> {
        let current = Scheduler::current();
        if self.affinity() != Some(current.id()) {
            return Err(SchedError::State("cannot switch to a tasklet on another thread"));
        }
        scheduler::route_run(self)
    }

    /// Raise `TaskletExit` inside the target. `pending` defers delivery to
    /// the target's next switch-in; otherwise the target is switched into
    /// immediately to process it.
    pub fn kill(self: &Arc<Self>, pending: bool) -> SchedResult<()> {
        if self.is_main {
            return Err(SchedError::State("cannot kill the main tasklet"));
        }
        match self.state() {
            TaskletState::Dead => return Ok(()),
            TaskletState::Unbound => {
                // Never ran: nothing to unwind.
                self.finalize_dead();
                return Ok(());
            }
            _ => {}
        }

        if self.nesting() > 0 {
            let reachable = self
                .affinity()
                .map(scheduler::scheduler_exists)
                .unwrap_or(false);
            if !reachable {
                return Err(SchedError::State("no thread"));
            }
        }

        self.set_pending_exc(Exc::tasklet_exit().with_frame("kill"));

        if self.state() == TaskletState::Blocked {
            self.unblock_from_channel();
        }

        if pending {
            // Deferred: make sure the target will be switched into.
            if self.state() == TaskletState::Paused {
                scheduler::route_insert(self, true)?;
            }
            Ok(())
        } else {
            scheduler::route_run(self)
        }
    }

    /// Move this tasklet to the current thread's scheduler. Only valid while
    /// it is not scheduled or running and holds no native frames.
    pub fn rebind_to_current(self: &Arc<Self>) -> SchedResult<()> {
        if self.is_main {
            return Err(SchedError::State("cannot rebind the main tasklet"));
        }
        match self.state() {
            TaskletState::Scheduled | TaskletState::Running => {
                return Err(SchedError::State("cannot rebind a scheduled tasklet"))
            }
            TaskletState::Blocked => {
                return Err(SchedError::State("cannot rebind a blocked tasklet"))
            }
            _ => {}
        }
        if self.nesting() > 0 {
            return Err(SchedError::State("C state"));
        }
        self.set_affinity(Some(Scheduler::current().id()));
        Ok(())
    }

    /// Result value once dead
    pub fn result(&self) -> Option<Value> {
        self.result.lock().clone()
    }

    /// The exception that terminated this tasklet, if any
    pub fn error(&self) -> Option<Exc> {
        self.error.lock().clone()
    }

    // =========================================================================
    // Crate-internal execution plumbing
    // =========================================================================

    pub(crate) fn with_continuation<R>(&self, f: impl FnOnce(&mut Continuation) -> R) -> R {
        f(&mut self.continuation.lock())
    }

    pub(crate) fn take_invocable(&self) -> Option<Box<dyn Invocable>> {
        self.continuation.lock().take_invocable()
    }

    pub(crate) fn put_invocable(&self, invocable: Box<dyn Invocable>) {
        self.continuation.lock().put_invocable(invocable);
    }

    /// Terminate with a result; releases the continuation
    pub(crate) fn complete(&self, value: Value) {
        *self.result.lock() = Some(value);
        self.finalize_dead();
    }

    /// Terminate raising; releases the continuation
    pub(crate) fn fail(&self, exc: Exc) {
        *self.error.lock() = Some(exc);
        self.finalize_dead();
    }

    fn finalize_dead(&self) {
        self.continuation.lock().release();
        *self.blocked_on.lock() = None;
        *self.wake_slot.lock() = None;
        *self.pending_exc.lock() = None;
        self.set_state(TaskletState::Dead);
    }

    pub(crate) fn set_pending_exc(&self, exc: Exc) {
        *self.pending_exc.lock() = Some(exc);
    }

    pub(crate) fn pending_exc(&self) -> Option<Exc> {
        self.pending_exc.lock().clone()
    }

    pub(crate) fn set_wake_slot(&self, slot: WakeSlot) {
        *self.wake_slot.lock() = Some(slot);
    }

    pub(crate) fn take_wake_slot(&self) -> Option<WakeSlot> {
        self.wake_slot.lock().take()
    }

    /// What the next switch-in delivers: injected exceptions win over
    /// channel deliveries, which win over a plain run.
    pub(crate) fn take_wake(&self) -> Wake {
        if let Some(exc) = self.pending_exc.lock().take() {
            return Wake::Exception(exc);
        }
        match self.take_wake_slot() {
            Some(WakeSlot::Value(value)) => Wake::Value(value),
            Some(WakeSlot::Exception(exc)) => Wake::Exception(exc),
            Some(WakeSlot::Closed) => Wake::Closed,
            None => Wake::Run,
        }
    }

    pub(crate) fn mark_blocked(&self, channel: ChannelId, dir: Dir) {
        *self.blocked_on.lock() = Some(BlockedOn { channel, dir });
        self.set_state(TaskletState::Blocked);
    }

    pub(crate) fn clear_blocked(&self) {
        *self.blocked_on.lock() = None;
    }

    pub(crate) fn blocked_on(&self) -> Option<BlockedOn> {
        *self.blocked_on.lock()
    }

    /// Pull this tasklet out of the channel it is parked on (kill path)
    pub(crate) fn unblock_from_channel(&self) {
        if let Some(blocked) = self.blocked_on() {
            if let Some(channel) = channel_registry::lookup(blocked.channel) {
                channel.remove_waiter(self);
            }
        }
        self.clear_blocked();
        self.set_state(TaskletState::Paused);
    }
}

impl std::fmt::Debug for Tasklet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Tasklet")
            .field("id", &self.id)
            .field("state", &self.state())
            .field("main", &self.is_main)
            .field("nesting", &self.nesting())
            .finish()
    }
}
