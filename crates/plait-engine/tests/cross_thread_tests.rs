//! Cross-Thread Scheduling Tests
//!
//! Tasklets belong to the thread that created them; channels are the
//! only hand-off point between schedulers. These tests cover:
//! - Channel transfer between tasklets on different threads
//! - Waking a remote tasklet through its scheduler's queue
//! - Rebinding a paused tasklet to another thread
//! - Killing a tasklet blocked on another thread's channel

use plait_engine::{
    Channel, Countdown, Producer, SchedError, Scheduler, Tasklet, TaskletState, Value,
};
use std::sync::mpsc;
use std::time::Duration;

/// Drain the local scheduler until the tasklet dies, picking up wakes
/// posted by other threads in between.
fn run_until_dead(tasklet: &std::sync::Arc<Tasklet>) {
    let sched = Scheduler::current();
    for _ in 0..1000 {
        sched.run().unwrap();
        if tasklet.state() == TaskletState::Dead {
            return;
        }
        std::thread::sleep(Duration::from_millis(1));
    }
    panic!("tasklet did not finish: {:?}", tasklet);
}

#[test]
fn test_channel_transfer_across_threads() {
    let ch = Channel::new();
    let (ready_tx, ready_rx) = mpsc::channel();

    let sender_thread = {
        let ch = ch.clone();
        std::thread::spawn(move || {
            let producer = Tasklet::new();
            producer
                .bind(Box::new(Producer::new(ch, vec![Value::Int(99)])))
                .unwrap();
            producer.insert().unwrap();

            // Park the producer on the channel, then signal the receiver.
            Scheduler::current().run().unwrap();
            assert_eq!(producer.state(), TaskletState::Blocked);
            ready_tx.send(()).unwrap();

            run_until_dead(&producer);
        })
    };

    ready_rx.recv().unwrap();
    assert_eq!(ch.receive().unwrap(), Value::Int(99));
    sender_thread.join().unwrap();
    assert!(ch.closing());
}

#[test]
fn test_switch_to_remote_tasklet_fails() {
    let (tx, rx) = mpsc::channel();
    let remote = std::thread::spawn(move || {
        let t = Tasklet::new();
        t.bind(Box::new(Countdown::new(1))).unwrap();
        tx.send(t.clone()).unwrap();
        // Keep the owning scheduler alive until the assertion ran.
        std::thread::sleep(Duration::from_millis(50));
        t.kill(false).unwrap();
    });

    let t = rx.recv().unwrap();
    assert!(matches!(
        t.switch(),
        Err(SchedError::State("cannot switch to a tasklet on another thread"))
    ));
    remote.join().unwrap();
}

#[test]
fn test_rebind_moves_a_paused_tasklet() {
    let (tx, rx) = mpsc::channel();
    let origin = std::thread::spawn(move || {
        let t = Tasklet::new();
        t.bind(Box::new(Countdown::new(2))).unwrap();
        tx.send(t).unwrap();
    });
    origin.join().unwrap();

    let t = rx.recv().unwrap();
    t.rebind_to_current().unwrap();
    assert_eq!(t.affinity(), Some(Scheduler::current().id()));

    t.insert().unwrap();
    Scheduler::current().run().unwrap();
    assert_eq!(t.state(), TaskletState::Dead);
    assert_eq!(t.result(), Some(Value::Int(0)));
}

#[test]
fn test_run_on_blocked_remote_tasklet_fails() {
    let ch = Channel::new();
    let (ready_tx, ready_rx) = mpsc::channel();
    let (task_tx, task_rx) = mpsc::channel();

    let owner = {
        let ch = ch.clone();
        std::thread::spawn(move || {
            let producer = Tasklet::new();
            producer
                .bind(Box::new(Producer::new(ch, vec![Value::Int(5)])))
                .unwrap();
            producer.insert().unwrap();
            Scheduler::current().run().unwrap();
            assert_eq!(producer.state(), TaskletState::Blocked);

            task_tx.send(producer.clone()).unwrap();
            ready_tx.send(()).unwrap();

            run_until_dead(&producer);
        })
    };

    ready_rx.recv().unwrap();
    let producer = task_rx.recv().unwrap();

    // Explicit run refuses a blocked target wherever it lives; the waiter
    // entry and its in-flight payload stay put.
    assert!(matches!(
        producer.run(),
        Err(SchedError::State("cannot run a blocked tasklet"))
    ));
    assert_eq!(producer.state(), TaskletState::Blocked);
    assert_eq!(ch.balance(), 1);

    assert_eq!(ch.receive().unwrap(), Value::Int(5));
    owner.join().unwrap();
    assert!(ch.closing());
}

#[test]
fn test_kill_tasklet_blocked_on_remote_thread() {
    let ch = Channel::new();
    let (ready_tx, ready_rx) = mpsc::channel();
    let (task_tx, task_rx) = mpsc::channel();

    let owner = {
        let ch = ch.clone();
        std::thread::spawn(move || {
            let producer = Tasklet::new();
            producer
                .bind(Box::new(Producer::new(ch, vec![Value::Int(1)])))
                .unwrap();
            producer.insert().unwrap();
            Scheduler::current().run().unwrap();
            assert_eq!(producer.state(), TaskletState::Blocked);

            task_tx.send(producer.clone()).unwrap();
            ready_tx.send(()).unwrap();

            // The kill arrives through the wake queue; drain until it lands.
            run_until_dead(&producer);
        })
    };

    ready_rx.recv().unwrap();
    let producer = task_rx.recv().unwrap();
    producer.kill(false).unwrap();

    owner.join().unwrap();
    assert_eq!(producer.state(), TaskletState::Dead);
    // The kill pulled the sender out of the waiter queue.
    assert_eq!(ch.balance(), 0);
}
