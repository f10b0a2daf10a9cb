//! Inter-process transport for events.
//!
//! ```text
//!   Runtime::send(external) ──> egress inbox ──> tether-ipc-tx ──> UDP ──┐
//!                                                                       │
//!   Runtime::deliver_inbound <── tether-ipc-rx <── UDP <────────────────┘
//! ```
//!
//! One bound UDP socket per process (the application channel). The egress
//! thread owns a clone of it and pops [`Outbound`] frames in priority order;
//! the ingress thread polls the original with mio and hands decoded events
//! back to the runtime. Delivery is at most once: frames that fail to encode,
//! decode, or find a destination are logged and dropped.
//!
//! - `codec`: per-type-tag payload codecs.
//! - `frame`: the datagram layout.

pub mod codec;
mod egress;
pub mod frame;
mod ingress;

use std::collections::HashMap;
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::thread::{self, JoinHandle};

pub use codec::{CodecError, CodecRegistry, EventCodec, TypedCodec};
pub use frame::{FrameError, WireFrame};

use crate::config::{ConfigError, IpcConfig};
use crate::dispatch::{Event, InboxError, Prioritized, PriorityInbox};
use crate::net::{Endpoint, UdpSocket};
use crate::runtime::WeakRuntime;
use crate::trace::{debug, error, info, warn};
use crate::types::{Context, Priority, ProcessId};

/// Kernel socket buffer size requested for the application channel.
const SOCKET_BUFFER_BYTES: usize = 1 << 20;

#[derive(Debug, thiserror::Error)]
pub enum IpcError {
    #[error("failed to bind socket: {0}")]
    Bind(#[source] io::Error),
    #[error("invalid channel configuration: {0}")]
    Config(#[from] ConfigError),
    #[error("failed to spawn IPC thread: {0}")]
    Spawn(#[source] io::Error),
}

/// An event waiting for the egress thread.
pub(crate) struct Outbound {
    pub(crate) to: Context,
    pub(crate) event: Arc<Event>,
}

impl Prioritized for Outbound {
    fn priority(&self) -> Priority {
        self.event.priority()
    }
}

pub(crate) type PeerTable = Arc<RwLock<HashMap<ProcessId, Endpoint>>>;

/// Handle to the running IPC threads.
pub struct IpcChannel {
    queue: Arc<PriorityInbox<Outbound>>,
    peers: PeerTable,
    local: Endpoint,
    shutdown_flag: Arc<AtomicBool>,
    tx_handle: Mutex<Option<JoinHandle<()>>>,
    rx_handle: Mutex<Option<JoinHandle<()>>>,
}

impl IpcChannel {
    /// Binds the application channel and spawns the egress and ingress
    /// threads.
    ///
    /// # Errors
    ///
    /// Returns an error if the channel configuration is unsupported, the
    /// socket cannot be bound, or a thread cannot be spawned.
    pub(crate) fn start(
        config: &IpcConfig,
        process_id: ProcessId,
        max_priority: usize,
        codecs: Arc<CodecRegistry>,
        runtime: WeakRuntime,
    ) -> Result<Self, IpcError> {
        let bind_addr = config.application.endpoint()?;
        let broker = config
            .broker
            .as_ref()
            .map(crate::config::ChannelConfig::endpoint)
            .transpose()?;
        let cap = config.application.buffer_size;

        let socket = UdpSocket::bind(bind_addr).map_err(|e| {
            error!(%bind_addr, error = %e, "failed to bind IPC socket");
            IpcError::Bind(e)
        })?;
        if let Err(e) = socket
            .set_send_buffer_size(SOCKET_BUFFER_BYTES)
            .and_then(|()| socket.set_recv_buffer_size(SOCKET_BUFFER_BYTES))
        {
            warn!(error = %e, "could not resize IPC socket buffers");
        }
        let local = socket.local_addr().map_err(IpcError::Bind)?;
        let tx_socket = socket.try_clone().map_err(IpcError::Bind)?;
        info!(
            %local,
            process = %process_id,
            broker = ?broker,
            peers = config.peers.len(),
            "IPC channel bound"
        );

        let queue = Arc::new(PriorityInbox::new(max_priority));
        let peers: PeerTable = Arc::new(RwLock::new(config.peers.iter().copied().collect()));
        let shutdown_flag = Arc::new(AtomicBool::new(false));

        let egress = egress::Egress::new(
            tx_socket,
            Arc::clone(&queue),
            Arc::clone(&peers),
            broker,
            process_id,
            Arc::clone(&codecs),
            cap,
        );
        debug!("spawning IPC TX thread");
        let tx_handle = thread::Builder::new()
            .name("tether-ipc-tx".into())
            .spawn(move || {
                info!("IPC TX thread started");
                egress.run();
                info!("IPC TX thread exiting");
            })
            .map_err(IpcError::Spawn)?;

        let ingress = ingress::Ingress::new(
            socket,
            process_id,
            codecs,
            runtime,
            Arc::clone(&shutdown_flag),
            cap,
        );
        debug!("spawning IPC RX thread");
        let rx_handle = thread::Builder::new()
            .name("tether-ipc-rx".into())
            .spawn(move || {
                info!("IPC RX thread started");
                ingress.run();
                info!("IPC RX thread exiting");
            });
        let rx_handle = match rx_handle {
            Ok(handle) => handle,
            Err(e) => {
                queue.close();
                let _ = tx_handle.join();
                return Err(IpcError::Spawn(e));
            }
        };

        Ok(Self {
            queue,
            peers,
            local,
            shutdown_flag,
            tx_handle: Mutex::new(Some(tx_handle)),
            rx_handle: Mutex::new(Some(rx_handle)),
        })
    }

    /// Queues `event` for `to`. Dropped silently once shut down.
    /// Queues `event` for the egress thread.
    pub(crate) fn enqueue(&self, to: Context, event: Arc<Event>) -> Result<(), InboxError> {
        self.queue.insert(Outbound { to, event }).inspect_err(|e| {
            debug!(%to, error = %e, "IPC egress refused frame");
        })
    }

    pub(crate) fn add_peer(&self, pid: ProcessId, endpoint: Endpoint) {
        debug!(%pid, %endpoint, "IPC peer added");
        self.peers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(pid, endpoint);
    }

    #[must_use]
    pub const fn local_endpoint(&self) -> Endpoint {
        self.local
    }

    /// Stops both threads and waits for them.
    pub(crate) fn shutdown(&self) {
        info!("IPC shutdown initiated");
        self.shutdown_flag.store(true, Ordering::Release);
        self.queue.close();
        for slot in [&self.tx_handle, &self.rx_handle] {
            let handle = slot.lock().unwrap_or_else(PoisonError::into_inner).take();
            if let Some(handle) = handle {
                let _ = handle.join();
            }
        }
        info!("IPC shutdown complete");
    }
}

impl Drop for IpcChannel {
    fn drop(&mut self) {
        self.shutdown_flag.store(true, Ordering::Release);
        self.queue.close();
    }
}
