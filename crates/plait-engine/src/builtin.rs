//! Stock invocables
//!
//! Small entry points used throughout the test suites and useful as
//! building blocks: a counting yielder, a channel producer, and a channel
//! collector. `Countdown` and `Producer` are soft-capturable and register
//! restore factories under the `plait.` namespace.

use crate::exception::Exc;
use crate::invoke::{Invocable, InvocableCapture, Poll, RestoreFn, Wake};
use crate::scheduler::RunCx;
use crate::sync::{registry, Channel, ChannelId};
use crate::value::Value;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::sync::Arc;

/// Factory name for [`Countdown`]
pub const COUNTDOWN_FACTORY: &str = "plait.countdown";

/// Factory name for [`Producer`]
pub const PRODUCER_FACTORY: &str = "plait.producer";

/// Register the built-in restore factories
pub(crate) fn install(factories: &DashMap<String, RestoreFn>) {
    factories.insert(COUNTDOWN_FACTORY.to_string(), restore_countdown);
    factories.insert(PRODUCER_FACTORY.to_string(), restore_producer);
}

// =============================================================================
// Countdown
// =============================================================================

/// Yields once per remaining count, then finishes with its final value (0)
pub struct Countdown {
    remaining: i64,
}

impl Countdown {
    /// A countdown from `n`
    pub fn new(n: i64) -> Self {
        Self { remaining: n }
    }
}

impl Invocable for Countdown {
    fn resume(&mut self, _cx: &mut RunCx<'_>, wake: Wake) -> Poll {
        if let Wake::Exception(exc) = wake {
            return Poll::Raised(exc);
        }
        if self.remaining > 0 {
            self.remaining -= 1;
            Poll::Yield
        } else {
            Poll::Done(Value::Int(0))
        }
    }

    fn capture(&self) -> Option<InvocableCapture> {
        Some(InvocableCapture {
            factory: COUNTDOWN_FACTORY.to_string(),
            pc: 0,
            locals: vec![Value::Int(self.remaining)],
        })
    }
}

fn restore_countdown(capture: &InvocableCapture) -> Result<Box<dyn Invocable>, crate::error::SchedError> {
    let remaining = capture
        .locals
        .first()
        .and_then(Value::as_int)
        .ok_or(crate::error::SchedError::State("malformed countdown capture"))?;
    Ok(Box::new(Countdown { remaining }))
}

// =============================================================================
// Producer
// =============================================================================

/// Sends a fixed sequence of values on a channel, then closes it
pub struct Producer {
    channel: Arc<Channel>,
    values: Vec<Value>,
    /// Index of the next value to send
    next: usize,
}

impl Producer {
    /// Produce `values` in order on `channel`, closing it afterwards
    pub fn new(channel: Arc<Channel>, values: Vec<Value>) -> Self {
        Self {
            channel,
            values,
            next: 0,
        }
    }
}

impl Invocable for Producer {
    fn resume(&mut self, cx: &mut RunCx<'_>, wake: Wake) -> Poll {
        if let Wake::Exception(exc) = wake {
            return Poll::Raised(exc);
        }
        let Some(value) = self.values.get(self.next).cloned() else {
            cx.close(&self.channel);
            return Poll::Done(Value::Int(self.next as i64));
        };
        match cx.send(&self.channel, value) {
            // Transferred and still our turn: checkpoint and continue.
            Ok(None) => {
                self.next += 1;
                Poll::Step
            }
            // Hand-off or parked; the payload is already in flight.
            Ok(Some(poll)) => {
                self.next += 1;
                poll
            }
            Err(err) => Poll::Raised(Exc::error(Value::from(err.to_string().as_str()))),
        }
    }

    fn capture(&self) -> Option<InvocableCapture> {
        let mut locals = Vec::with_capacity(self.values.len() - self.next + 1);
        locals.push(Value::Int(self.channel.id().as_u64() as i64));
        locals.extend(self.values[self.next..].iter().cloned());
        Some(InvocableCapture {
            factory: PRODUCER_FACTORY.to_string(),
            pc: self.next as u32,
            locals,
        })
    }
}

fn restore_producer(capture: &InvocableCapture) -> Result<Box<dyn Invocable>, crate::error::SchedError> {
    let id = capture
        .locals
        .first()
        .and_then(Value::as_int)
        .ok_or(crate::error::SchedError::State("malformed producer capture"))?;
    let channel = registry::lookup(ChannelId::from_u64(id as u64))
        .ok_or(crate::error::SchedError::State("producer channel no longer exists"))?;
    Ok(Box::new(Producer {
        channel,
        values: capture.locals[1..].to_vec(),
        next: 0,
    }))
}

// =============================================================================
// Collector
// =============================================================================

/// Receives from a channel until it closes, appending every value to a
/// shared sink. Not soft-capturable.
pub struct Collector {
    channel: Arc<Channel>,
    sink: Arc<Mutex<Vec<Value>>>,
}

impl Collector {
    /// Collect from `channel` into `sink` until the channel closes
    pub fn new(channel: Arc<Channel>, sink: Arc<Mutex<Vec<Value>>>) -> Self {
        Self { channel, sink }
    }
}

impl Invocable for Collector {
    fn resume(&mut self, cx: &mut RunCx<'_>, wake: Wake) -> Poll {
        match wake {
            Wake::Run => {}
            Wake::Value(value) => self.sink.lock().push(value),
            Wake::Closed => return Poll::Done(Value::Int(self.sink.lock().len() as i64)),
            Wake::Exception(exc) => return Poll::Raised(exc),
        }
        match cx.receive(&self.channel) {
            Ok(crate::scheduler::ReceivePoll::Value(value)) => {
                self.sink.lock().push(value);
                Poll::Step
            }
            Ok(crate::scheduler::ReceivePoll::Raised(exc)) => Poll::Raised(exc),
            Ok(crate::scheduler::ReceivePoll::Closed) => {
                Poll::Done(Value::Int(self.sink.lock().len() as i64))
            }
            Ok(crate::scheduler::ReceivePoll::Pending) => Poll::Block,
            Err(err) => Poll::Raised(Exc::error(Value::from(err.to_string().as_str()))),
        }
    }
}
