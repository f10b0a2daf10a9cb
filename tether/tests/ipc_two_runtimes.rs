//! Two runtimes in one test process standing in for two processes, linked
//! by UDP on localhost.
//!
//! ```bash
//! RUST_LOG=tether=debug cargo test --features tracing --test ipc_two_runtimes -- --nocapture
//! ```

mod support;

use std::sync::mpsc::{self, Receiver};
use std::time::Duration;

use serial_test::serial;

use tether::config::{ChannelConfig, IpcConfig};
use tether::net::Endpoint;
use tether::{
    Address, ComponentFactory, Context, ProcessId, Runtime, RuntimeConfig, SendError, ServiceId,
    ThreadId, ThreadSpec,
};

use support::{
    Command, Listener, Mode, Observed, Player, Recorder, command, init_test_tracing, next, note,
};

const FRONT: ProcessId = ProcessId(100);
const BACK: ProcessId = ProcessId(200);

fn node(pid: ProcessId, factory: ComponentFactory) -> Runtime {
    let config = RuntimeConfig {
        process_id: pid,
        watchdog_timeout: Duration::ZERO,
        ipc: Some(IpcConfig {
            application: ChannelConfig::udp(Endpoint::localhost(0)),
            ..IpcConfig::default()
        }),
        ..RuntimeConfig::default()
    };
    let runtime = Runtime::builder(config)
        .thread(ThreadSpec::new("main").component(factory))
        .build()
        .expect("build");
    runtime.codecs().register_typed::<String>("test::note");
    runtime.start().expect("start");
    runtime
}

fn link(a: &Runtime, b: &Runtime) {
    let a_ep = a.ipc_endpoint().expect("a bound");
    let b_ep = b.ipc_endpoint().expect("b bound");
    a.add_peer(b.process_id(), b_ep).expect("peer b");
    b.add_peer(a.process_id(), a_ep).expect("peer a");
}

fn finish(runtimes: &[&Runtime]) {
    for runtime in runtimes {
        runtime.stop();
        runtime.wait();
    }
}

#[test]
#[serial]
fn event_crosses_to_the_other_process() {
    init_test_tracing();
    let (front_tx, _front_rx) = mpsc::channel();
    let (back_tx, back_rx) = mpsc::channel();
    let front = node(FRONT, Recorder::factory(front_tx, false));
    let back = node(BACK, Recorder::factory(back_tx, false));
    link(&front, &back);

    front
        .send(note("over the wire"), Context::new(ThreadId(0), BACK))
        .expect("send");
    assert_eq!(next(&back_rx), ("main".to_owned(), "over the wire".to_owned()));
    finish(&[&front, &back]);
}

#[test]
#[serial]
fn only_events_leave_the_process() {
    init_test_tracing();
    let (tx, _rx) = mpsc::channel();
    let front = node(FRONT, Recorder::factory(tx, false));
    let result = front.send(tether::Runnable::new(|| {}), Context::new(ThreadId(0), BACK));
    assert!(matches!(result, Err(SendError::ExternalNonEvent)));
    finish(&[&front]);
}

fn remote_player(back: &Runtime) -> Address {
    // The player is the only service of `back`.
    Address::new(Context::new(ThreadId(0), back.process_id()), ServiceId(0))
}

fn player_pair(mode: Mode) -> (Runtime, Runtime, Receiver<Observed>) {
    init_test_tracing();
    let (tx, rx) = mpsc::channel();
    let back = node(BACK, Player::factory(mode));
    let front = node(FRONT, Listener::factory(tx));
    link(&front, &back);
    front
        .connect_remote("player", "main", remote_player(&back))
        .expect("connect");
    assert_eq!(next(&rx), Observed::Connected(true));
    (front, back, rx)
}

#[test]
#[serial]
fn remote_request_is_answered() {
    let (front, back, rx) = player_pair(Mode::Answer);
    front
        .send(command(Command::Seek { position: 4, chain: 0 }), Context::thread(ThreadId(0)))
        .expect("command");
    let Observed::Sent(seq) = next(&rx) else {
        panic!("request not sent");
    };
    assert_eq!(next(&rx), Observed::Response(seq, 8));
    finish(&[&front, &back]);
}

#[test]
#[serial]
fn remote_notification_is_delivered() {
    let (front, back, rx) = player_pair(Mode::Answer);
    front
        .send(command(Command::Subscribe), Context::thread(ThreadId(0)))
        .expect("subscribe");
    front
        .send(command(Command::Play), Context::thread(ThreadId(0)))
        .expect("play");
    assert_eq!(next(&rx), Observed::Volume(7));
    finish(&[&front, &back]);
}

#[test]
#[serial]
fn withdrawing_the_remote_server_disconnects() {
    let (front, back, rx) = player_pair(Mode::Answer);
    front.disconnect_remote("player", "main", remote_player(&back));
    assert_eq!(next(&rx), Observed::Connected(false));
    finish(&[&front, &back]);
}
