//! Thread-affine actor runtime.
//!
//! Application code lives on named dispatch loops, each draining a priority
//! inbox of events, runnables and callables. Events are routed by
//! [`Signature`] to the consumers subscribed on that loop. On top of this
//! sit timers, a UDP transport that carries events between processes, and
//! a proxy/server RPC layer with request correlation and attribute
//! notifications.
//!
//! ```text
//! tether
//! ├── types      ids, contexts, addresses
//! ├── dispatch   signatures, work items, priority inbox, subscriptions
//! ├── runtime    loops, dispatcher, components, timers, watchdog
//! ├── ipc        wire frames, codecs, TX/RX threads
//! ├── net        UDP socket and endpoints
//! ├── rpc        contracts, proxies, servers, pairing registry
//! └── config     runtime and channel configuration
//! ```

// Log arguments are not evaluated without the `tracing` feature.
#![cfg_attr(not(feature = "tracing"), allow(unused_variables))]

pub mod config;
pub mod dispatch;
pub mod ipc;
pub mod net;
pub mod rpc;
pub mod runtime;
pub mod types;

pub(crate) mod trace;

pub use config::{ConfigError, RuntimeConfig};
pub use dispatch::{Callable, Event, Interaction, Payload, Runnable, Signature, WorkItem};
pub use rpc::{Client, Proxy, RpcError, Server, Service, ServiceContract};
pub use runtime::{
    Component, ComponentFactory, Consumer, Dispatcher, Runtime, RuntimeBuilder, RuntimeError,
    SendError, ShutdownBlocker, ThreadSpec, Timer, TimerCount,
};
pub use trace::init_tracing;
pub use types::{Address, ClientId, Context, Priority, ProcessId, SeqId, ServiceId, ThreadId};
