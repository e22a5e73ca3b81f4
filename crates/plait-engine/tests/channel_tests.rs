//! Channel Rendezvous Tests
//!
//! End-to-end tests for unbuffered channel transfer between tasklets and
//! the host thread:
//! - Producer/consumer pipelines in both directions
//! - Balance accounting for blocked senders and receivers
//! - Preference-driven hand-off order
//! - Exception transfer and close semantics
//! - Block trap and deadlock detection

use parking_lot::Mutex;
use plait_engine::{
    Channel, Collector, Exc, FnInvocable, Poll, Preference, Producer, ReceivePoll, SchedError,
    Scheduler, Tasklet, Value, Wake,
};
use std::sync::Arc;

#[test]
fn test_producer_feeds_host_receive() {
    let sched = Scheduler::current();
    let ch = Channel::new();

    let producer = Tasklet::new();
    producer
        .bind(Box::new(Producer::new(
            ch.clone(),
            vec![Value::Int(1), Value::Int(2), Value::Int(3)],
        )))
        .unwrap();
    producer.insert().unwrap();

    assert_eq!(ch.receive().unwrap(), Value::Int(1));
    assert_eq!(ch.receive().unwrap(), Value::Int(2));
    assert_eq!(ch.receive().unwrap(), Value::Int(3));
    assert!(matches!(ch.receive(), Err(SchedError::ChannelClosed)));

    sched.run().unwrap();
    assert_eq!(producer.result(), Some(Value::Int(3)));
    assert_eq!(ch.balance(), 0);
}

#[test]
fn test_host_send_to_collector() {
    let sched = Scheduler::current();
    let ch = Channel::new();
    let sink = Arc::new(Mutex::new(Vec::new()));

    let collector = Tasklet::new();
    collector
        .bind(Box::new(Collector::new(ch.clone(), sink.clone())))
        .unwrap();
    collector.insert().unwrap();

    ch.send(Value::Int(1)).unwrap();
    ch.send(Value::Int(2)).unwrap();
    ch.send(Value::Int(3)).unwrap();
    ch.close();
    sched.run().unwrap();

    assert_eq!(*sink.lock(), vec![Value::Int(1), Value::Int(2), Value::Int(3)]);
    assert_eq!(collector.result(), Some(Value::Int(3)));
    assert!(ch.closed());
}

#[test]
fn test_balance_counts_blocked_senders() {
    let sched = Scheduler::current();
    let ch = Channel::new();

    for n in [10i64, 20] {
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
            match cx.send(&ch, Value::Int(n)) {
                Ok(None) => Poll::Done(Value::Null),
                Ok(Some(poll)) => poll,
                Err(_) => Poll::Raised(Exc::error(Value::from("send failed"))),
            }
        })))
        .unwrap();
        t.insert().unwrap();
    }

    sched.run().unwrap();
    assert_eq!(ch.balance(), 2);

    assert_eq!(ch.receive().unwrap(), Value::Int(10));
    assert_eq!(ch.balance(), 1);
    assert_eq!(ch.receive().unwrap(), Value::Int(20));
    assert_eq!(ch.balance(), 0);
    sched.run().unwrap();
}

fn spawn_receiver(ch: &Arc<Channel>, log: &Arc<Mutex<Vec<String>>>) -> Arc<Tasklet> {
    let ch = ch.clone();
    let log = log.clone();
    let t = Tasklet::new();
    t.bind(Box::new(FnInvocable::new(move |cx, wake| {
        match wake {
            Wake::Value(v) => {
                log.lock().push(format!("recv:{}", v));
                return Poll::Done(Value::Null);
            }
            Wake::Exception(exc) => return Poll::Raised(exc),
            Wake::Closed => return Poll::Done(Value::Null),
            Wake::Run => {}
        }
        match cx.receive(&ch) {
            Ok(ReceivePoll::Value(v)) => {
                log.lock().push(format!("recv:{}", v));
                Poll::Done(Value::Null)
            }
            Ok(ReceivePoll::Pending) => Poll::Block,
            Ok(ReceivePoll::Closed) => Poll::Done(Value::Null),
            Ok(ReceivePoll::Raised(exc)) => Poll::Raised(exc),
            Err(_) => Poll::Raised(Exc::error(Value::from("receive failed"))),
        }
    })))
    .unwrap();
    t
}

fn spawn_sender(ch: &Arc<Channel>, log: &Arc<Mutex<Vec<String>>>, value: i64) -> Arc<Tasklet> {
    let ch = ch.clone();
    let log = log.clone();
    let mut sent = false;
    let t = Tasklet::new();
    t.bind(Box::new(FnInvocable::new(move |cx, wake| {
        if let Wake::Exception(exc) = wake {
            return Poll::Raised(exc);
        }
        if sent {
            log.lock().push("sender-done".to_string());
            return Poll::Done(Value::Null);
        }
        sent = true;
        match cx.send(&ch, Value::Int(value)) {
            Ok(None) => {
                log.lock().push("sender-done".to_string());
                Poll::Done(Value::Null)
            }
            Ok(Some(poll)) => poll,
            Err(_) => Poll::Raised(Exc::error(Value::from("send failed"))),
        }
    })))
    .unwrap();
    t
}

#[test]
fn test_receiver_preference_hands_off_to_receiver() {
    let sched = Scheduler::current();
    let ch = Channel::new();
    let log = Arc::new(Mutex::new(Vec::new()));

    spawn_receiver(&ch, &log).insert().unwrap();
    spawn_sender(&ch, &log, 42).insert().unwrap();
    sched.run().unwrap();

    // Receiver preference: the delivery runs the receiver before the
    // sender gets its turn back.
    assert_eq!(*log.lock(), vec!["recv:42".to_string(), "sender-done".to_string()]);
}

#[test]
fn test_sender_preference_keeps_sender_running() {
    let sched = Scheduler::current();
    let ch = Channel::new();
    ch.set_preference(Preference::Sender);
    let log = Arc::new(Mutex::new(Vec::new()));

    spawn_receiver(&ch, &log).insert().unwrap();
    spawn_sender(&ch, &log, 42).insert().unwrap();
    sched.run().unwrap();

    assert_eq!(*log.lock(), vec!["sender-done".to_string(), "recv:42".to_string()]);
}

#[test]
fn test_send_exception_reraises_at_receiver() {
    let sched = Scheduler::current();
    let ch = Channel::new();
    let log = Arc::new(Mutex::new(Vec::new()));

    let receiver = {
        let ch = ch.clone();
        let log = log.clone();
        let t = Tasklet::new();
        t.bind(Box::new(FnInvocable::new(move |cx, wake| {
            if let Wake::Exception(exc) = wake {
                log.lock().push(exc.clone());
                return Poll::Done(Value::Null);
            }
            match cx.receive(&ch) {
                Ok(ReceivePoll::Pending) => Poll::Block,
                Ok(ReceivePoll::Raised(exc)) => {
                    log.lock().push(exc);
                    Poll::Done(Value::Null)
                }
                _ => Poll::Done(Value::Null),
            }
        })))
        .unwrap();
        t
    };
    receiver.insert().unwrap();

    ch.send_exception(Exc::error(Value::from("boom"))).unwrap();
    sched.run().unwrap();

    let seen = log.lock();
    assert_eq!(seen.len(), 1);
    assert_eq!(seen[0].value, Value::from("boom"));
    // The transfer left its mark on the traceback.
    assert!(seen[0].traceback.iter().any(|f| f == "channel send"));
}

#[test]
fn test_block_trap_raises_instead_of_blocking() {
    let sched = Scheduler::current();
    let ch = Channel::new();

    // Keep something runnable so the failure is the trap, not deadlock.
    let idle = Tasklet::new();
    idle.bind(Box::new(plait_engine::Countdown::new(1))).unwrap();
    idle.insert().unwrap();

    let main = sched.main();
    assert!(!main.set_block_trap(true));
    assert!(matches!(ch.receive(), Err(SchedError::State(_))));
    assert!(matches!(ch.send(Value::Int(1)), Err(SchedError::State(_))));
    assert!(main.set_block_trap(false));

    sched.run().unwrap();
}

#[test]
fn test_blocking_with_nothing_runnable_is_deadlock() {
    let ch = Channel::new();
    assert!(matches!(ch.receive(), Err(SchedError::Deadlock)));
    assert!(matches!(ch.send(Value::Int(1)), Err(SchedError::Deadlock)));
    // The failed attempts left no waiters behind.
    assert_eq!(ch.balance(), 0);
}

#[test]
fn test_close_wakes_blocked_receivers() {
    let sched = Scheduler::current();
    let ch = Channel::new();
    let log = Arc::new(Mutex::new(Vec::new()));

    let receiver = spawn_receiver(&ch, &log);
    receiver.insert().unwrap();
    sched.run().unwrap();
    assert_eq!(ch.balance(), -1);

    ch.close();
    sched.run().unwrap();

    assert!(ch.closed());
    assert_eq!(receiver.state(), plait_engine::TaskletState::Dead);
    assert_eq!(ch.balance(), 0);
}

#[test]
fn test_queued_senders_drain_after_close() {
    let sched = Scheduler::current();
    let ch = Channel::new();
    let log = Arc::new(Mutex::new(Vec::new()));

    spawn_sender(&ch, &log, 7).insert().unwrap();
    sched.run().unwrap();
    assert_eq!(ch.balance(), 1);

    ch.close();
    assert!(ch.closing());
    assert!(!ch.closed());

    // The queued payload is still deliverable; only then is the channel
    // fully closed.
    assert_eq!(ch.receive().unwrap(), Value::Int(7));
    assert!(ch.closed());
    assert!(matches!(ch.receive(), Err(SchedError::ChannelClosed)));
    sched.run().unwrap();
}

#[test]
fn test_iter_drains_until_close() {
    let sched = Scheduler::current();
    let ch = Channel::new();

    let producer = Tasklet::new();
    producer
        .bind(Box::new(Producer::new(
            ch.clone(),
            vec![Value::Int(1), Value::Int(2), Value::Int(3)],
        )))
        .unwrap();
    producer.insert().unwrap();

    let received: Result<Vec<Value>, SchedError> = ch.iter().collect();
    assert_eq!(
        received.unwrap(),
        vec![Value::Int(1), Value::Int(2), Value::Int(3)]
    );
    assert!(ch.closed());
    sched.run().unwrap();
}

#[test]
fn test_registry_resolves_live_channels() {
    let ch = Channel::new();
    let id = ch.id();
    let found = plait_engine::sync::registry::lookup(id).expect("channel should be registered");
    assert_eq!(found.id(), id);

    drop(found);
    drop(ch);
    assert!(plait_engine::sync::registry::lookup(id).is_none());
}
