//! IPC TX thread.
//!
//! Pops outbound events in priority order, encodes them and sends one
//! datagram per destination:
//! - a known peer for the destination process id
//! - every peer for the broadcast process id
//! - otherwise the broker, if configured

use std::sync::{Arc, PoisonError};

use super::{CodecRegistry, Outbound, PeerTable, WireFrame};
use crate::dispatch::{PriorityInbox, Timeout};
use crate::net::{Endpoint, UdpSocket};
use crate::trace::{error, trace, warn};
use crate::types::ProcessId;

pub(super) struct Egress {
    socket: UdpSocket,
    queue: Arc<PriorityInbox<Outbound>>,
    peers: PeerTable,
    broker: Option<Endpoint>,
    process_id: ProcessId,
    codecs: Arc<CodecRegistry>,
    cap: usize,
}

impl Egress {
    pub(super) fn new(
        socket: UdpSocket,
        queue: Arc<PriorityInbox<Outbound>>,
        peers: PeerTable,
        broker: Option<Endpoint>,
        process_id: ProcessId,
        codecs: Arc<CodecRegistry>,
        cap: usize,
    ) -> Self {
        Self {
            socket,
            queue,
            peers,
            broker,
            process_id,
            codecs,
            cap,
        }
    }

    /// Runs until the queue is closed.
    pub(super) fn run(&self) {
        while let Some(outbound) = self.queue.pop(Timeout::Infinite) {
            let Some(bytes) = self.encode(&outbound) else {
                continue;
            };
            let destinations = self.destinations(outbound.to.pid);
            if destinations.is_empty() {
                warn!(to = %outbound.to, "no route to process, frame dropped");
                continue;
            }
            for dest in destinations {
                self.send(&bytes, dest);
            }
        }
    }

    fn encode(&self, outbound: &Outbound) -> Option<Vec<u8>> {
        let event = &outbound.event;
        let signature = event.signature();
        if !self.codecs.contains(signature.type_tag()) {
            warn!(%signature, "no codec for outbound event, frame dropped");
            return None;
        }
        let payload = match event.payload() {
            Some(payload) => match self.codecs.encode(signature, payload) {
                Ok(bytes) => Some(bytes),
                Err(e) => {
                    warn!(%signature, error = %e, "payload encoding failed, frame dropped");
                    return None;
                }
            },
            None => None,
        };

        let mut origin = event.origin();
        if origin.pid == ProcessId::LOCAL {
            origin.pid = self.process_id;
        }
        let frame = WireFrame {
            to: outbound.to,
            signature: signature.clone(),
            origin,
            priority: event.priority(),
            payload,
        };
        match frame.encode(self.cap) {
            Ok(bytes) => Some(bytes),
            Err(e) => {
                warn!(%signature, error = %e, "frame encoding failed, frame dropped");
                None
            }
        }
    }

    fn destinations(&self, pid: ProcessId) -> Vec<Endpoint> {
        let peers = self.peers.read().unwrap_or_else(PoisonError::into_inner);
        if pid == ProcessId::BROADCAST {
            return peers.values().copied().collect();
        }
        peers
            .get(&pid)
            .copied()
            .or(self.broker)
            .into_iter()
            .collect()
    }

    fn send(&self, bytes: &[u8], dest: Endpoint) {
        match self.socket.try_send_to(bytes, dest) {
            Ok(Some(n)) => trace!(%dest, bytes = n, "frame sent"),
            Ok(None) => warn!(%dest, "socket busy, frame dropped"),
            Err(e) => error!(%dest, error = %e, "send failed"),
        }
    }
}
