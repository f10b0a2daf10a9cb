//! Request/response and publish/subscribe services on top of events.
//!
//! A [`ServiceContract`] describes an interface as data: its methods (with or
//! without a response) and its attributes. A [`Server`] implements the
//! interface on one thread; any number of [`Proxy`] objects, on any thread
//! or process, talk to it. The runtime's [`ServiceRegistry`] pairs them by
//! `(interface, role)` and tells both sides about connects and disconnects
//! through status events.
//!
//! ```text
//!   Client ──request──> Proxy ──REQUEST──────> Server ──on_request──> Service
//!   Client <─response── Proxy <─RESPONSE/BUSY─ Server <──response()──
//!   Client ─subscribe─> Proxy ──SUBSCRIBE────> Server
//!   Client <─notified── Proxy <─NOTIFICATION── Server <──notify()────
//! ```
//!
//! - `contract`: the interface description and its wire codecs.
//! - `method`: client correlator and server busy/ready gate.
//! - `attribute`: client subscription cache and server notification table.
//! - `proxy` / `server`: the consumers gluing the above to dispatch loops.
//! - `registry`: server/proxy pairing.

pub mod attribute;
pub mod contract;
pub mod method;
pub mod proxy;
pub mod registry;
pub mod server;

use std::fmt;

use serde::{Deserialize, Serialize};

pub use attribute::{AddOutcome, AttributeSubscriptions, NotificationTable};
pub use contract::{AttributeSpec, MethodSpec, ServiceContract};
pub use method::{Admission, MethodCorrelator, PendingRequest, RequestGate};
pub use proxy::{Client, Proxy};
pub use registry::{RegistryError, ServiceRegistry};
pub use server::{Server, Service};

use crate::dispatch::{Interaction, Route, Signature};
use crate::runtime::SendError;
use crate::types::{Address, SeqId, ServiceId};

#[derive(Debug, thiserror::Error)]
pub enum RpcError {
    #[error("no server connected")]
    NotConnected,
    #[error("unknown method {0}")]
    UnknownMethod(String),
    #[error("unknown attribute {0}")]
    UnknownAttribute(String),
    #[error("no pending request for {0}")]
    NoPendingRequest(String),
    #[error(transparent)]
    Registry(#[from] RegistryError),
    #[error("send failed: {0}")]
    Send(#[from] SendError),
}

/// Pairing key of servers and proxies.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ServiceKey {
    pub interface: String,
    pub role: String,
}

impl ServiceKey {
    pub fn new(interface: impl Into<String>, role: impl Into<String>) -> Self {
        Self {
            interface: interface.into(),
            role: role.into(),
        }
    }
}

impl fmt::Display for ServiceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.interface, self.role)
    }
}

pub(crate) const STATUS_TAG: &str = "tether::service";

/// Payload of a status event: the other side of a pairing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) struct ServiceStatus {
    pub(crate) peer: Address,
    pub(crate) connected: bool,
}

/// Who a status event is addressed to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum StatusFor {
    /// Tells a proxy about its server.
    Proxy,
    /// Tells a server about one of its proxies.
    Server,
}

impl StatusFor {
    pub(crate) fn signature(self, recipient: ServiceId) -> Signature {
        let id = match self {
            Self::Proxy => "server",
            Self::Server => "proxy",
        };
        Signature::routed(
            STATUS_TAG,
            id,
            Route {
                role: "".into(),
                interaction: Interaction::Notification,
                from: ServiceId::INVALID,
                to: recipient,
                seq: SeqId::INVALID,
            },
        )
    }
}

/// Builds the routed signature every RPC event uses.
pub(crate) fn rpc_signature(
    type_tag: &str,
    id: &str,
    role: &str,
    interaction: Interaction,
    from: ServiceId,
    to: ServiceId,
    seq: SeqId,
) -> Signature {
    Signature::routed(
        type_tag.to_owned(),
        id.to_owned(),
        Route {
            role: role.to_owned().into(),
            interaction,
            from,
            to,
            seq,
        },
    )
}
