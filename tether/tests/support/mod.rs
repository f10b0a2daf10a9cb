//! Components shared by the integration tests.
//!
//! Everything observable is forwarded to an mpsc channel so the test thread
//! can assert on it with a timeout.

#![allow(dead_code)]

use std::cell::{Cell, RefCell};
use std::collections::BTreeMap;
use std::rc::Rc;
use std::sync::mpsc::{Receiver, Sender};
use std::sync::{Arc, Once};
use std::time::Duration;

use tether::rpc::{Client, Proxy, Server, Service, ServiceContract};
use tether::types::ConsumerId;
use tether::{
    ClientId, Component, ComponentFactory, Consumer, Context, Dispatcher, Event, Payload, Runtime,
    SeqId, ShutdownBlocker, Signature, ThreadId,
};

pub const TIMEOUT: Duration = Duration::from_secs(2);

static INIT_TRACING: Once = Once::new();

/// Initialize tracing for tests (only once).
pub fn init_test_tracing() {
    INIT_TRACING.call_once(|| {
        tether::init_tracing();
    });
}

pub fn next<T>(rx: &Receiver<T>) -> T {
    rx.recv_timeout(TIMEOUT).expect("nothing observed in time")
}

pub fn note(text: &str) -> Event {
    Event::new(note_signature()).with_payload(text.to_owned())
}

pub fn note_signature() -> Signature {
    Signature::new("test::note", "text")
}

fn release_signature() -> Signature {
    Signature::new("test::note", "release")
}

fn audit_signature() -> Signature {
    Signature::new("test::note", "audit")
}

pub fn release() -> Event {
    Event::new(release_signature())
}

/// Records notes, boot and shutdown per thread.
pub struct Recorder {
    consumer: ConsumerId,
    thread: String,
    hold_shutdown: bool,
    blocker: RefCell<Option<ShutdownBlocker>>,
    tx: Sender<(String, String)>,
}

impl Recorder {
    /// A recorder on every thread it is added to. With `hold_shutdown` the
    /// thread keeps running after shutdown until a [`release`] event.
    pub fn factory(tx: Sender<(String, String)>, hold_shutdown: bool) -> ComponentFactory {
        Arc::new(move |dispatcher: &Dispatcher| {
            let recorder = dispatcher.register(|consumer| Self {
                consumer,
                thread: dispatcher.name().to_owned(),
                hold_shutdown,
                blocker: RefCell::new(None),
                tx: tx.clone(),
            });
            dispatcher.subscribe(note_signature(), recorder.consumer);
            dispatcher.subscribe(release_signature(), recorder.consumer);
            recorder as Rc<dyn Component>
        })
    }

    fn record(&self, what: String) {
        let _ = self.tx.send((self.thread.clone(), what));
    }
}

impl Component for Recorder {
    fn name(&self) -> &str {
        "recorder"
    }

    fn is_root(&self) -> bool {
        true
    }

    fn boot(&self, message: &str) {
        self.record(format!("boot:{message}"));
    }

    fn shutdown(&self, message: &str, blocker: ShutdownBlocker) {
        self.record(format!("shutdown:{message}"));
        if self.hold_shutdown {
            *self.blocker.borrow_mut() = Some(blocker);
        }
    }
}

impl Consumer for Recorder {
    fn process(&self, event: &Event) {
        if event.signature().id() == "release" {
            self.blocker.borrow_mut().take();
            return;
        }
        let text = event.data::<String>().cloned().unwrap_or_default();
        self.record(text);
    }
}

pub fn player_contract() -> Arc<ServiceContract> {
    ServiceContract::new("player")
        .method_with_response::<u32, u32>("seek")
        .method::<String>("play")
        .attribute::<u8>("volume")
        .into_shared()
}

/// How the player serves `seek`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    /// Answers at once with twice the position.
    Answer,
    /// Keeps the method busy until released.
    Hold,
    /// Reopens the gate at once and answers on release.
    Park,
}

/// Server side of the player contract.
pub struct Player {
    consumer: ConsumerId,
    server: Rc<Server>,
    mode: Mode,
    parked: RefCell<Vec<(SeqId, u32)>>,
    audit: Option<Sender<usize>>,
}

impl Player {
    pub fn factory(mode: Mode) -> ComponentFactory {
        Self::build(mode, None)
    }

    /// Also reports the number of `volume` subscribers on every audit event.
    pub fn audited(mode: Mode, audit: Sender<usize>) -> ComponentFactory {
        Self::build(mode, Some(audit))
    }

    fn build(mode: Mode, audit: Option<Sender<usize>>) -> ComponentFactory {
        Arc::new(move |dispatcher: &Dispatcher| {
            let server = Server::new(dispatcher, &player_contract(), "main").expect("server");
            let player = dispatcher.register(|consumer| Self {
                consumer,
                server,
                mode,
                parked: RefCell::new(Vec::new()),
                audit: audit.clone(),
            });
            dispatcher.subscribe(release_signature(), player.consumer);
            dispatcher.subscribe(audit_signature(), player.consumer);
            player.server.bind(&player);
            player as Rc<dyn Component>
        })
    }
}

impl Component for Player {
    fn name(&self) -> &str {
        "player"
    }
}

impl Service for Player {
    fn on_request(&self, server: &Server, method: &str, seq: SeqId, request: &Event) {
        match method {
            "seek" => {
                let position = request.data::<u32>().copied().unwrap_or_default();
                match self.mode {
                    Mode::Answer => server.response("seek", position * 2).expect("response"),
                    Mode::Hold => self.parked.borrow_mut().push((seq, position)),
                    Mode::Park => {
                        assert_eq!(server.unblock_request(), Some(seq));
                        self.parked.borrow_mut().push((seq, position));
                    }
                }
            }
            "play" => server.notify("volume", 7u8).expect("notify"),
            other => panic!("unexpected method {other}"),
        }
    }
}

impl Consumer for Player {
    fn process(&self, event: &Event) {
        if event.signature().id() == "audit" {
            if let Some(audit) = &self.audit {
                let _ = audit.send(self.server.subscribers("volume"));
            }
            return;
        }
        let parked = std::mem::take(&mut *self.parked.borrow_mut());
        for (seq, position) in parked {
            assert!(self.server.prepare_response("seek", seq));
            self.server.response("seek", position * 2).expect("response");
        }
    }
}

/// What the listener saw.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Observed {
    Connected(bool),
    Sent(SeqId),
    Response(SeqId, u32),
    Busy(SeqId),
    Volume(u8),
}

/// Instructions to the listener, sent as events from the test thread.
#[derive(Debug, Clone)]
pub enum Command {
    /// Seeks, then seeks again from the response callback `chain` times.
    Seek { position: u32, chain: u32 },
    SeekTwice(u32),
    Subscribe,
    Play,
}

pub fn command(cmd: Command) -> Event {
    Event::new(Signature::new("test::command", "listener")).with_payload(cmd)
}

/// Client side of the player contract.
pub struct Listener {
    consumer: ConsumerId,
    proxy: Rc<Proxy>,
    client: Cell<Option<ClientId>>,
    chain: Cell<u32>,
    tx: Sender<Observed>,
}

impl Listener {
    pub fn factory(tx: Sender<Observed>) -> ComponentFactory {
        Arc::new(move |dispatcher: &Dispatcher| {
            let proxy = Proxy::new(dispatcher, &player_contract(), "main");
            let listener = dispatcher.register(|consumer| Self {
                consumer,
                proxy,
                client: Cell::new(None),
                chain: Cell::new(0),
                tx: tx.clone(),
            });
            dispatcher.subscribe(
                Signature::new("test::command", "listener"),
                listener.consumer,
            );
            let id = listener.proxy.register_client(&listener);
            listener.client.set(Some(id));
            listener as Rc<dyn Component>
        })
    }

    fn id(&self) -> ClientId {
        self.client.get().expect("client registered")
    }

    fn observe(&self, what: Observed) {
        let _ = self.tx.send(what);
    }

    fn seek(&self, position: u32) {
        let seq = self.proxy.request(self.id(), "seek", position).expect("request");
        self.observe(Observed::Sent(seq));
    }
}

impl Component for Listener {
    fn name(&self) -> &str {
        "listener"
    }
}

impl Consumer for Listener {
    fn process(&self, event: &Event) {
        let Some(cmd) = event.data::<Command>() else {
            return;
        };
        match *cmd {
            Command::Seek { position, chain } => {
                self.chain.set(chain);
                self.seek(position);
            }
            Command::SeekTwice(position) => {
                self.seek(position);
                self.seek(position + 1);
            }
            Command::Subscribe => self.proxy.subscribe(self.id(), "volume").expect("subscribe"),
            Command::Play => {
                self.proxy
                    .request(self.id(), "play", String::from("intro"))
                    .expect("request");
            }
        }
    }
}

impl Client for Listener {
    fn on_connection(&self, connected: bool) {
        self.observe(Observed::Connected(connected));
    }

    fn on_response(&self, _method: &str, seq: SeqId, payload: Option<&Payload>) {
        let value = payload
            .and_then(|p| (**p).downcast_ref::<u32>())
            .copied()
            .unwrap_or_default();
        self.observe(Observed::Response(seq, value));
        let chain = self.chain.get();
        if chain > 0 {
            self.chain.set(chain - 1);
            self.seek(value);
        }
    }

    fn on_busy(&self, _method: &str, seq: SeqId) {
        self.observe(Observed::Busy(seq));
    }

    fn on_notification(&self, _attribute: &str, value: &Payload) {
        if let Some(volume) = (**value).downcast_ref::<u8>() {
            self.observe(Observed::Volume(*volume));
        }
    }
}

/// Instructions to an [`Audience`], naming the seat they apply to.
#[derive(Debug, Clone)]
pub enum Cue {
    Subscribe(&'static str),
    Unsubscribe(&'static str),
    /// Unregisters the seat from the proxy.
    Leave(&'static str),
    Play,
    /// Asks the server thread for its `volume` subscriber count, queued
    /// behind everything this audience sent before.
    Audit,
}

pub fn cue(cue: Cue) -> Event {
    Event::new(Signature::new("test::command", "audience")).with_payload(cue)
}

/// One client of the shared proxy. Reports `"<name>=<volume>"`.
struct Seat {
    name: &'static str,
    tx: Sender<String>,
}

impl Client for Seat {
    fn on_connection(&self, connected: bool) {
        let _ = self.tx.send(format!("{}:{connected}", self.name));
    }

    fn on_notification(&self, _attribute: &str, value: &Payload) {
        if let Some(volume) = (**value).downcast_ref::<u8>() {
            let _ = self.tx.send(format!("{}={volume}", self.name));
        }
    }
}

/// Two clients, `A` and `B`, sharing one player proxy.
pub struct Audience {
    consumer: ConsumerId,
    proxy: Rc<Proxy>,
    runtime: Runtime,
    server: ThreadId,
    seats: Vec<Rc<Seat>>,
    ids: RefCell<BTreeMap<&'static str, ClientId>>,
}

impl Audience {
    pub fn factory(tx: Sender<String>, server: ThreadId) -> ComponentFactory {
        Arc::new(move |dispatcher: &Dispatcher| {
            let proxy = Proxy::new(dispatcher, &player_contract(), "main");
            let seats: Vec<Rc<Seat>> = ["A", "B"]
                .into_iter()
                .map(|name| Rc::new(Seat { name, tx: tx.clone() }))
                .collect();
            let ids: BTreeMap<_, _> = seats
                .iter()
                .map(|seat| (seat.name, proxy.register_client(seat)))
                .collect();
            let audience = dispatcher.register(|consumer| Self {
                consumer,
                proxy,
                runtime: dispatcher.runtime().clone(),
                server,
                seats,
                ids: RefCell::new(ids),
            });
            dispatcher.subscribe(
                Signature::new("test::command", "audience"),
                audience.consumer,
            );
            audience as Rc<dyn Component>
        })
    }

    fn id(&self, name: &str) -> ClientId {
        *self.ids.borrow().get(name).expect("seat present")
    }
}

impl Component for Audience {
    fn name(&self) -> &str {
        "audience"
    }
}

impl Consumer for Audience {
    fn process(&self, event: &Event) {
        let Some(cue) = event.data::<Cue>() else {
            return;
        };
        match *cue {
            Cue::Subscribe(name) => self.proxy.subscribe(self.id(name), "volume").expect("subscribe"),
            Cue::Unsubscribe(name) => {
                self.proxy.unsubscribe(self.id(name), "volume").expect("unsubscribe");
            }
            Cue::Leave(name) => {
                let id = self.id(name);
                self.ids.borrow_mut().remove(name);
                self.proxy.unregister_client(id);
            }
            Cue::Play => {
                let any = *self.ids.borrow().values().next().expect("a seat");
                self.proxy
                    .request(any, "play", String::from("encore"))
                    .expect("request");
            }
            Cue::Audit => {
                self.runtime
                    .send(Event::new(audit_signature()), Context::thread(self.server))
                    .expect("audit");
            }
        }
    }
}
