//! Dispatch loops end to end: routing, priorities, blocking sends,
//! lifecycle events and timers.
//!
//! # Running with tracing
//!
//! ```bash
//! RUST_LOG=tether=trace cargo test --features tracing --test runtime_dispatch -- --nocapture
//! ```

mod support;

use std::rc::Rc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use tether::runtime::LoopState;
use tether::types::ConsumerId;
use tether::{
    Component, Consumer, Context, Dispatcher, Event, Priority, Runnable, Runtime, RuntimeConfig,
    SendError, Signature, ThreadId, ThreadSpec, Timer, TimerCount,
};

use support::{Recorder, init_test_tracing, next, note, release};

const A: ThreadId = ThreadId(0);
const B: ThreadId = ThreadId(1);

fn config() -> RuntimeConfig {
    RuntimeConfig {
        watchdog_timeout: Duration::ZERO,
        ..RuntimeConfig::default()
    }
}

/// Two threads, `a` and `b`, each with a recorder.
fn start(hold_shutdown: bool) -> (Runtime, Receiver<(String, String)>) {
    init_test_tracing();
    let (tx, rx) = mpsc::channel();
    let runtime = Runtime::builder(config())
        .thread(ThreadSpec::new("a").component(Recorder::factory(tx.clone(), hold_shutdown)))
        .thread(ThreadSpec::new("b").component(Recorder::factory(tx, false)))
        .build()
        .expect("build");
    runtime.start().expect("start");
    (runtime, rx)
}

fn finish(runtime: &Runtime) {
    runtime.stop();
    runtime.wait();
}

#[test]
fn event_reaches_the_addressed_thread_only() {
    let (runtime, rx) = start(false);
    runtime.send(note("hello"), Context::thread(B)).expect("send");
    assert_eq!(next(&rx), ("b".to_owned(), "hello".to_owned()));
    assert!(rx.recv_timeout(Duration::from_millis(100)).is_err());
    finish(&runtime);
}

#[test]
fn events_without_subscribers_are_refused() {
    let (runtime, _rx) = start(false);
    let stray = Event::new(Signature::new("test::note", "nobody"));
    assert!(matches!(
        runtime.send(stray, Context::thread(A)),
        Err(SendError::NoSubscribers { thread, .. }) if thread == A
    ));
    finish(&runtime);
}

#[test]
fn frozen_thread_refuses_work_until_unfrozen() {
    let (runtime, rx) = start(false);
    let a = runtime.thread(A).expect("a");
    a.freeze();
    assert!(matches!(
        runtime.send(note("early"), Context::thread(A)),
        Err(SendError::Frozen(thread)) if thread == A
    ));
    a.unfreeze();
    runtime.send(note("late"), Context::thread(A)).expect("send");
    assert_eq!(next(&rx), ("a".to_owned(), "late".to_owned()));
    finish(&runtime);
}

#[test]
fn higher_priority_is_served_first() {
    let (runtime, rx) = start(false);
    // Keeps `a` busy while both notes are queued.
    let stall = Runnable::new(|| thread::sleep(Duration::from_millis(100))).with_priority(Priority(15));
    runtime.send(stall, Context::thread(A)).expect("stall");
    runtime
        .send(note("low").with_priority(Priority(1)), Context::thread(A))
        .expect("low");
    runtime
        .send(note("high").with_priority(Priority(10)), Context::thread(A))
        .expect("high");

    assert_eq!(next(&rx).1, "high");
    assert_eq!(next(&rx).1, "low");
    finish(&runtime);
}

#[test]
fn broadcast_reaches_every_thread() {
    let (runtime, rx) = start(false);
    runtime.send(note("all"), Context::BROADCAST).expect("broadcast");
    let mut seen = vec![next(&rx), next(&rx)];
    seen.sort();
    assert_eq!(
        seen,
        [("a".to_owned(), "all".to_owned()), ("b".to_owned(), "all".to_owned())]
    );
    finish(&runtime);
}

#[test]
fn local_context_resolves_to_the_calling_loop() {
    let (runtime, rx) = start(false);
    assert!(matches!(
        runtime.send(note("lost"), Context::LOCAL),
        Err(SendError::NotManagedThread)
    ));

    let inner = runtime.clone();
    let hop = Runnable::new(move || {
        inner.send(note("from b"), Context::LOCAL).expect("local send");
    });
    runtime.send(hop, Context::thread(B)).expect("send");
    assert_eq!(next(&rx), ("b".to_owned(), "from b".to_owned()));
    finish(&runtime);
}

struct Forgotten(ConsumerId);

impl Consumer for Forgotten {
    fn process(&self, _event: &Event) {}
}

#[test]
fn consumer_dropped_without_deregister_is_pruned() {
    let (runtime, _rx) = start(false);
    let ghost = Signature::new("test::note", "ghost");
    let signature = ghost.clone();
    runtime
        .send_blocking(
            Runnable::new(move || {
                let dispatcher = Dispatcher::current().expect("on a dispatch loop");
                let consumer = dispatcher.register(Forgotten);
                dispatcher.subscribe(signature.clone(), consumer.0);
            }),
            Context::thread(A),
        )
        .expect("register");

    // Still accepted: the token is only found dead when the event is dispatched.
    runtime
        .send(Event::new(ghost.clone()), Context::thread(A))
        .expect("first send");
    runtime
        .send_blocking(Runnable::new(|| {}), Context::thread(A))
        .expect("drain");
    assert!(matches!(
        runtime.send(Event::new(ghost), Context::thread(A)),
        Err(SendError::NoSubscribers { thread, .. }) if thread == A
    ));
    finish(&runtime);
}

#[test]
fn blocking_send_returns_after_execution() {
    let (runtime, _rx) = start(false);
    let done = Arc::new(AtomicBool::new(false));
    let flag = Arc::clone(&done);
    runtime
        .send_blocking(
            Runnable::new(move || flag.store(true, Ordering::Release)),
            Context::thread(A),
        )
        .expect("blocking send");
    assert!(done.load(Ordering::Acquire));
    finish(&runtime);
}

#[test]
fn blocking_send_to_own_thread_is_refused() {
    let (runtime, _rx) = start(false);
    let (tx, rx) = mpsc::channel();
    let inner = runtime.clone();
    let attempt = Runnable::new(move || {
        let to_self = inner.send_blocking(Runnable::new(|| {}), Context::thread(A));
        let to_local = inner.send_blocking(Runnable::new(|| {}), Context::LOCAL);
        let _ = tx.send((
            matches!(to_self, Err(SendError::BlockingToSelf)),
            matches!(to_local, Err(SendError::BlockingToSelf)),
        ));
    });
    runtime.send(attempt, Context::thread(A)).expect("send");
    assert_eq!(next(&rx), (true, true));
    finish(&runtime);
}

#[test]
fn boot_reaches_root_components() {
    let (runtime, rx) = start(false);
    runtime.boot("hi").expect("boot");
    let mut seen = vec![next(&rx), next(&rx)];
    seen.sort();
    assert_eq!(
        seen,
        [("a".to_owned(), "boot:hi".to_owned()), ("b".to_owned(), "boot:hi".to_owned())]
    );
    assert!(runtime.ping(Context::thread(B), "still there").is_ok());
    finish(&runtime);
}

#[test]
fn shutdown_waits_for_held_blockers() {
    let (runtime, rx) = start(true);
    runtime.shutdown("bye").expect("shutdown");
    let mut seen = vec![next(&rx), next(&rx)];
    seen.sort();
    assert_eq!(seen[0], ("a".to_owned(), "shutdown:bye".to_owned()));
    assert_eq!(seen[1], ("b".to_owned(), "shutdown:bye".to_owned()));

    let b = runtime.thread(B).expect("b");
    b.wait();
    assert_eq!(b.state(), LoopState::Stopped);

    thread::sleep(Duration::from_millis(50));
    let a = runtime.thread(A).expect("a");
    assert_eq!(a.state(), LoopState::Running);

    runtime.send(release(), Context::thread(A)).expect("release");
    runtime.wait();
    assert_eq!(a.state(), LoopState::Stopped);
}

struct Ticker {
    timer: Rc<Timer>,
}

impl Component for Ticker {
    fn name(&self) -> &str {
        "ticker"
    }

    fn is_root(&self) -> bool {
        true
    }

    fn boot(&self, _message: &str) {
        self.timer
            .start(Duration::from_millis(10), TimerCount::Times(3))
            .expect("timer start");
    }
}

#[test]
fn timer_ticks_the_requested_number_of_times() {
    init_test_tracing();
    let (tx, rx) = mpsc::channel();
    let factory: tether::ComponentFactory = Arc::new(move |dispatcher: &Dispatcher| {
        let tx = tx.clone();
        let timer = Timer::new(dispatcher, "three", move |_| {
            let _ = tx.send(());
        });
        Rc::new(Ticker { timer }) as Rc<dyn Component>
    });
    let runtime = Runtime::builder(config())
        .thread(ThreadSpec::new("ticks").component(factory))
        .build()
        .expect("build");
    runtime.start().expect("start");
    runtime.boot("go").expect("boot");

    for _ in 0..3 {
        next(&rx);
    }
    assert!(rx.recv_timeout(Duration::from_millis(100)).is_err());
    finish(&runtime);
}
