//! Channels: the rendezvous primitive tasklets block on
//!
//! A channel has no buffer. `send` and `receive` either find a waiting party
//! of the opposite direction and transfer immediately, or enqueue the caller
//! FIFO and suspend it. The signed `balance` tracks who is waiting: positive
//! means blocked senders, negative means blocked receivers, and its absolute
//! value always equals the waiter queue length.
//!
//! Channels are thread-safe and are the only sanctioned hand-off point
//! between tasklets on different schedulers.

use crate::error::{SchedError, SchedResult};
use crate::exception::Exc;
use crate::scheduler::{schedule_woken, Scheduler, Tasklet, WakeSlot};
use crate::sync::{registry, ChannelId};
use crate::value::Value;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;

/// Direction a blocked tasklet is waiting in
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Dir {
    /// Waiting to send
    Send,
    /// Waiting to receive
    Receive,
}

/// Tie-break when both directions become ready at once: which party keeps
/// running after an immediate transfer on the same scheduler.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Preference {
    /// The receiver runs next; the sender is rescheduled (default)
    Receiver,
    /// The sender keeps running; the receiver is rescheduled
    Sender,
}

/// A tasklet parked on the channel
struct Waiter {
    tasklet: Arc<Tasklet>,
    /// In-flight payload, present for senders only
    payload: Option<WakeSlot>,
}

struct ChannelInner {
    balance: i64,
    queue: VecDeque<Waiter>,
    closing: bool,
    closed: bool,
    preference: Preference,
}

/// Outcome of a send attempt, before any scheduling decision
pub(crate) enum SendOutcome {
    /// A waiting receiver was handed the payload; it needs rescheduling
    Delivered(Arc<Tasklet>),
    /// The caller was parked on the queue
    Enqueued,
}

/// Outcome of a receive attempt, before any scheduling decision
pub(crate) enum ReceiveOutcome {
    /// A queued sender's payload is ready; the sender needs rescheduling
    Ready {
        payload: WakeSlot,
        sender: Arc<Tasklet>,
    },
    /// The channel is closed and drained
    Closed,
    /// The caller was parked on the queue
    Enqueued,
}

/// A rendezvous channel for values and exceptions
pub struct Channel {
    id: ChannelId,
    inner: Mutex<ChannelInner>,
}

impl Channel {
    /// Create a new open channel with receiver preference
    pub fn new() -> Arc<Self> {
        let channel = Arc::new(Self {
            id: ChannelId::new(),
            inner: Mutex::new(ChannelInner {
                balance: 0,
                queue: VecDeque::new(),
                closing: false,
                closed: false,
                preference: Preference::Receiver,
            }),
        });
        registry::register(&channel);
        channel
    }

    /// The channel's stable identifier
    pub fn id(&self) -> ChannelId {
        self.id
    }

    /// Signed waiter balance: +N blocked senders, -N blocked receivers
    pub fn balance(&self) -> i64 {
        self.inner.lock().balance
    }

    /// Current tie-break preference
    pub fn preference(&self) -> Preference {
        self.inner.lock().preference
    }

    /// Set the tie-break preference, returning the previous value
    pub fn set_preference(&self, preference: Preference) -> Preference {
        let mut inner = self.inner.lock();
        std::mem::replace(&mut inner.preference, preference)
    }

    /// Whether `close` has been called
    pub fn closing(&self) -> bool {
        self.inner.lock().closing
    }

    /// Whether the channel is closed and fully drained
    pub fn closed(&self) -> bool {
        self.inner.lock().closed
    }

    // =========================================================================
    // Engine-level operations (used by RunCx and the host paths)
    // =========================================================================

    /// Attempt a send; `would_block` validates blocking (block trap, deadlock)
    /// and is invoked under the channel lock before the caller is parked.
    pub(crate) fn send_raw(
        &self,
        from: &Arc<Tasklet>,
        mut payload: WakeSlot,
        would_block: impl FnOnce() -> SchedResult<()>,
    ) -> SchedResult<SendOutcome> {
        if let WakeSlot::Exception(exc) = &mut payload {
            exc.push_frame("channel send");
        }

        let mut inner = self.inner.lock();
        if inner.closing {
            return Err(SchedError::ChannelClosed);
        }

        if inner.balance < 0 {
            // A receiver is waiting: transfer immediately.
            let waiter = inner.queue.pop_front().expect("balance/queue mismatch");
            inner.balance += 1;
            drop(inner);

            waiter.tasklet.clear_blocked();
            waiter.tasklet.set_wake_slot(payload);
            Ok(SendOutcome::Delivered(waiter.tasklet))
        } else {
            would_block()?;
            from.mark_blocked(self.id, Dir::Send);
            inner.queue.push_back(Waiter {
                tasklet: from.clone(),
                payload: Some(payload),
            });
            inner.balance += 1;
            Ok(SendOutcome::Enqueued)
        }
    }

    /// Attempt a receive; `would_block` as in [`Channel::send_raw`].
    pub(crate) fn receive_raw(
        &self,
        from: &Arc<Tasklet>,
        would_block: impl FnOnce() -> SchedResult<()>,
    ) -> SchedResult<ReceiveOutcome> {
        let mut inner = self.inner.lock();

        if inner.balance > 0 {
            // A sender is queued: take its payload.
            let waiter = inner.queue.pop_front().expect("balance/queue mismatch");
            inner.balance -= 1;
            if inner.closing && inner.balance == 0 {
                inner.closed = true;
            }
            drop(inner);

            waiter.tasklet.clear_blocked();
            let payload = waiter.payload.expect("sender waiter without payload");
            Ok(ReceiveOutcome::Ready {
                payload,
                sender: waiter.tasklet,
            })
        } else if inner.closing {
            inner.closed = true;
            Ok(ReceiveOutcome::Closed)
        } else {
            would_block()?;
            from.mark_blocked(self.id, Dir::Receive);
            inner.queue.push_back(Waiter {
                tasklet: from.clone(),
                payload: None,
            });
            inner.balance -= 1;
            Ok(ReceiveOutcome::Enqueued)
        }
    }

    /// Close the channel. New sends fail immediately; queued senders drain;
    /// blocked receivers are woken with the closed signal.
    pub fn close(&self) {
        let woken = {
            let mut inner = self.inner.lock();
            inner.closing = true;
            if inner.balance < 0 {
                // Receivers waiting on a channel that will never produce:
                // wake them all with the closed signal.
                inner.balance = 0;
                inner.closed = true;
                inner.queue.drain(..).collect::<Vec<_>>()
            } else {
                if inner.balance == 0 {
                    inner.closed = true;
                }
                Vec::new()
            }
        };

        for waiter in woken {
            waiter.tasklet.clear_blocked();
            waiter.tasklet.set_wake_slot(WakeSlot::Closed);
            schedule_woken(&waiter.tasklet, false);
        }
    }

    /// Remove a blocked tasklet from the waiter queue (kill path).
    /// Returns true if the tasklet was queued here.
    pub(crate) fn remove_waiter(&self, tasklet: &Tasklet) -> bool {
        let mut inner = self.inner.lock();
        let position = inner
            .queue
            .iter()
            .position(|w| w.tasklet.id() == tasklet.id());
        match position {
            Some(idx) => {
                inner.queue.remove(idx);
                if inner.balance > 0 {
                    inner.balance -= 1;
                } else {
                    inner.balance += 1;
                }
                if inner.closing && inner.balance == 0 {
                    inner.closed = true;
                }
                tasklet.clear_blocked();
                true
            }
            None => false,
        }
    }

    /// Queue position of a blocked tasklet plus its in-flight payload
    /// (continuation capture path).
    pub(crate) fn waiter_position(&self, tasklet: &Tasklet) -> Option<(u32, Option<WakeSlot>)> {
        let inner = self.inner.lock();
        inner
            .queue
            .iter()
            .position(|w| w.tasklet.id() == tasklet.id())
            .map(|idx| (idx as u32, inner.queue[idx].payload.clone()))
    }

    /// Re-establish a restored tasklet's place in the waiter queue, at its
    /// captured position relative to still-pending waiters.
    pub(crate) fn reinsert_waiter(
        &self,
        tasklet: &Arc<Tasklet>,
        dir: Dir,
        position: u32,
        payload: Option<WakeSlot>,
    ) -> SchedResult<()> {
        let mut inner = self.inner.lock();

        // A waiter queue only ever holds one direction; mixing directions
        // would corrupt the balance invariant.
        let occupied_dir = if inner.balance > 0 {
            Some(Dir::Send)
        } else if inner.balance < 0 {
            Some(Dir::Receive)
        } else {
            None
        };
        if let Some(existing) = occupied_dir {
            if existing != dir {
                return Err(SchedError::State("channel queue direction changed"));
            }
        }

        let idx = (position as usize).min(inner.queue.len());
        inner.queue.insert(
            idx,
            Waiter {
                tasklet: tasklet.clone(),
                payload,
            },
        );
        match dir {
            Dir::Send => inner.balance += 1,
            Dir::Receive => inner.balance -= 1,
        }
        drop(inner);

        tasklet.mark_blocked(self.id, dir);
        Ok(())
    }

    // =========================================================================
    // Host-thread blocking operations (drive the local scheduler)
    // =========================================================================

    /// Send a value from the host thread (the main tasklet). Blocks
    /// cooperatively: runs the local scheduler until the transfer completes.
    pub fn send(&self, value: Value) -> SchedResult<()> {
        self.send_slot(WakeSlot::Value(value))
    }

    /// Send an exception to be re-raised at the matched receiver
    pub fn send_exception(&self, exc: Exc) -> SchedResult<()> {
        self.send_slot(WakeSlot::Exception(exc))
    }

    fn send_slot(&self, payload: WakeSlot) -> SchedResult<()> {
        let sched = Scheduler::current();
        let main = sched.main();
        let preference = self.preference();

        let outcome = self.send_raw(&main, payload, || host_would_block(&sched, &main))?;

        match outcome {
            SendOutcome::Delivered(receiver) => {
                schedule_woken(&receiver, preference == Preference::Receiver);
                Ok(())
            }
            SendOutcome::Enqueued => {
                sched.drive_main_blocked(self)?;
                // A queued sender's payload was consumed by the receiver.
                main.take_wake_slot();
                Ok(())
            }
        }
    }

    /// Receive a value on the host thread (the main tasklet). Blocks
    /// cooperatively; fails with `ChannelClosed` once the channel is drained.
    pub fn receive(&self) -> SchedResult<Value> {
        let sched = Scheduler::current();
        let main = sched.main();
        let preference = self.preference();

        let outcome = self.receive_raw(&main, || host_would_block(&sched, &main))?;

        let payload = match outcome {
            ReceiveOutcome::Ready { payload, sender } => {
                schedule_woken(&sender, preference == Preference::Sender);
                payload
            }
            ReceiveOutcome::Closed => return Err(SchedError::ChannelClosed),
            ReceiveOutcome::Enqueued => {
                sched.drive_main_blocked(self)?;
                main.take_wake_slot()
                    .ok_or(SchedError::State("woken without a value"))?
            }
        };

        match payload {
            WakeSlot::Value(value) => Ok(value),
            WakeSlot::Exception(mut exc) => {
                exc.push_frame("channel receive");
                Err(SchedError::Exception(exc))
            }
            WakeSlot::Closed => Err(SchedError::ChannelClosed),
        }
    }

    /// Iterate received values on the host thread until the channel closes.
    /// Each item is a blocking [`receive`](Channel::receive); `ChannelClosed`
    /// ends the iteration, every other error is yielded as an `Err` item.
    pub fn iter(&self) -> Messages<'_> {
        Messages { channel: self }
    }
}

/// Blocking host-thread iterator over a channel, see [`Channel::iter`].
pub struct Messages<'a> {
    channel: &'a Channel,
}

impl Iterator for Messages<'_> {
    type Item = SchedResult<Value>;

    fn next(&mut self) -> Option<Self::Item> {
        match self.channel.receive() {
            Ok(value) => Some(Ok(value)),
            Err(SchedError::ChannelClosed) => None,
            Err(err) => Some(Err(err)),
        }
    }
}

/// Blocking validation for the main tasklet: trap first, then the local
/// deadlock check (no other runnable tasklet on this thread).
fn host_would_block(sched: &Scheduler, main: &Tasklet) -> SchedResult<()> {
    if main.block_trap() {
        return Err(SchedError::State("block trap is set"));
    }
    sched.drain_wakes();
    if sched.runnable_count() == 0 {
        return Err(SchedError::Deadlock);
    }
    Ok(())
}

impl std::fmt::Debug for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("Channel")
            .field("id", &self.id)
            .field("balance", &inner.balance)
            .field("closing", &inner.closing)
            .field("closed", &inner.closed)
            .finish()
    }
}
