//! IPC RX thread.
//!
//! Polls the application socket with a short timeout so the shutdown flag is
//! noticed promptly, drains every readable datagram, and hands decoded
//! events to the runtime for local delivery only.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use mio::{Events, Interest, Poll, Token};

use super::{CodecRegistry, WireFrame};
use crate::dispatch::Event;
use crate::net::{Endpoint, UdpSocket};
use crate::runtime::WeakRuntime;
use crate::trace::{debug, error, trace, warn};
use crate::types::{Context, ProcessId};

const SOCKET: Token = Token(0);
const POLL_TIMEOUT: Duration = Duration::from_millis(50);

pub(super) struct Ingress {
    socket: UdpSocket,
    process_id: ProcessId,
    codecs: Arc<CodecRegistry>,
    runtime: WeakRuntime,
    shutdown_flag: Arc<AtomicBool>,
    recv_buf: Vec<u8>,
}

impl Ingress {
    pub(super) fn new(
        socket: UdpSocket,
        process_id: ProcessId,
        codecs: Arc<CodecRegistry>,
        runtime: WeakRuntime,
        shutdown_flag: Arc<AtomicBool>,
        cap: usize,
    ) -> Self {
        Self {
            socket,
            process_id,
            codecs,
            runtime,
            shutdown_flag,
            recv_buf: vec![0u8; cap],
        }
    }

    pub(super) fn run(mut self) {
        let mut poll = match Poll::new() {
            Ok(poll) => poll,
            Err(e) => {
                error!(error = %e, "failed to create poll");
                return;
            }
        };
        if let Err(e) = poll
            .registry()
            .register(&mut self.socket, SOCKET, Interest::READABLE)
        {
            error!(error = %e, "failed to register IPC socket");
            return;
        }
        let mut events = Events::with_capacity(16);

        while !self.shutdown_flag.load(Ordering::Acquire) {
            if let Err(e) = poll.poll(&mut events, Some(POLL_TIMEOUT)) {
                if e.kind() == std::io::ErrorKind::Interrupted {
                    continue;
                }
                error!(error = %e, "poll failed");
                return;
            }
            if events.iter().any(|event| event.token() == SOCKET) {
                self.drain();
            }
        }
    }

    fn drain(&mut self) {
        loop {
            match self.socket.try_recv_from(&mut self.recv_buf) {
                Ok(Some((len, src))) => {
                    let Some((event, tid)) = self.decode(len, src) else {
                        continue;
                    };
                    let Some(runtime) = self.runtime.upgrade() else {
                        return;
                    };
                    runtime.deliver_inbound(event, tid);
                }
                Ok(None) => return,
                Err(e) => {
                    warn!(error = %e, "recv failed");
                    return;
                }
            }
        }
    }

    fn decode(&self, len: usize, src: Endpoint) -> Option<(Event, crate::types::ThreadId)> {
        let frame = match WireFrame::decode(&self.recv_buf[..len]) {
            Ok(frame) => frame,
            Err(e) => {
                warn!(%src, error = %e, "malformed frame dropped");
                return None;
            }
        };
        if !addressed_to(frame.to, self.process_id) {
            debug!(%src, to = %frame.to, "frame for another process dropped");
            return None;
        }
        if !self.codecs.contains(frame.signature.type_tag()) {
            warn!(%src, signature = %frame.signature, "no codec for inbound event, frame dropped");
            return None;
        }
        let mut event = Event::new(frame.signature)
            .with_origin(frame.origin)
            .with_priority(frame.priority);
        if let Some(bytes) = frame.payload {
            match self.codecs.decode(event.signature(), &bytes) {
                Ok(payload) => event = event.with_shared_payload(payload),
                Err(e) => {
                    warn!(%src, signature = %event.signature(), error = %e, "payload decoding failed, frame dropped");
                    return None;
                }
            }
        }
        trace!(%src, signature = %event.signature(), "frame received");
        Some((event, frame.to.tid))
    }
}

/// Whether a frame addressed to `to` is for the process `own`.
fn addressed_to(to: Context, own: ProcessId) -> bool {
    to.pid == own || to.pid == ProcessId::BROADCAST || to.pid == ProcessId::LOCAL
}
