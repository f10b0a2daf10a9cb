//! Identifier newtypes and the addressing model.
//!
//! Every id space (thread, process, service) reserves its three highest
//! values:
//!
//! ```text
//! MAX       invalid    no such entity
//! MAX - 1   broadcast  every managed entity
//! MAX - 2   local      "the caller's own", resolved at send time
//! ```
//!
//! A [`Context`] says *where* a work item is delivered (thread inside a
//! process); an [`Address`] adds the service id of an RPC endpoint inside
//! that context.

use std::fmt;

use serde::{Deserialize, Serialize};

macro_rules! reserved_id {
    ($(#[$meta:meta])* $name:ident, $label:literal) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        pub struct $name(pub u32);

        impl $name {
            /// Denotes no valid entity.
            pub const INVALID: Self = Self(u32::MAX);
            /// Denotes every managed entity.
            pub const BROADCAST: Self = Self(u32::MAX - 1);
            /// Resolved to the caller's own entity at send time.
            pub const LOCAL: Self = Self(u32::MAX - 2);

            /// Returns `true` for ids that do not name one concrete entity.
            #[must_use]
            pub const fn is_reserved(self) -> bool {
                self.0 >= Self::LOCAL.0
            }

            #[must_use]
            pub const fn is_valid(self) -> bool {
                self.0 != Self::INVALID.0
            }
        }

        impl From<u32> for $name {
            fn from(v: u32) -> Self {
                Self(v)
            }
        }

        impl From<$name> for u32 {
            fn from(id: $name) -> Self {
                id.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                match *self {
                    Self::INVALID => write!(f, "{}:invalid", $label),
                    Self::BROADCAST => write!(f, "{}:broadcast", $label),
                    Self::LOCAL => write!(f, "{}:local", $label),
                    Self(v) => write!(f, "{}:{}", $label, v),
                }
            }
        }
    };
}

reserved_id!(
    /// Identifies a dispatch loop managed by a runtime.
    ThreadId,
    "tid"
);

reserved_id!(
    /// Identifies an operating-system process taking part in IPC.
    ProcessId,
    "pid"
);

reserved_id!(
    /// Identifies an RPC endpoint (proxy or server) inside a process.
    ServiceId,
    "sid"
);

/// Sequence id used to correlate requests with responses.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
pub struct SeqId(pub u64);

impl SeqId {
    /// First id handed out by a fresh counter.
    pub const ZERO: Self = Self(0);
    /// Carried by events that do not belong to a request.
    pub const INVALID: Self = Self(u64::MAX);

    /// Next sequence id (wraps on overflow, skipping [`SeqId::INVALID`]).
    #[inline]
    #[must_use]
    pub const fn next(self) -> Self {
        let next = self.0.wrapping_add(1);
        if next == u64::MAX { Self(0) } else { Self(next) }
    }
}

impl From<u64> for SeqId {
    fn from(v: u64) -> Self {
        Self(v)
    }
}

impl fmt::Display for SeqId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if *self == Self::INVALID {
            f.write_str("seq:invalid")
        } else {
            write!(f, "seq:{}", self.0)
        }
    }
}

/// Token identifying a consumer registered with a dispatcher.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConsumerId(pub(crate) u64);

impl fmt::Display for ConsumerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "consumer:{}", self.0)
    }
}

/// Token identifying a client registered with a proxy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ClientId(pub(crate) u64);

impl fmt::Display for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "client:{}", self.0)
    }
}

/// Inbox lane index. Higher values are served first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Priority(pub u8);

impl Priority {
    pub const MIN: Self = Self(0);
    pub const DEFAULT: Self = Self(0);
    /// Timer expirations.
    pub const TIMER: Self = Self(8);
    /// Boot, shutdown and ping.
    pub const SYSTEM: Self = Self(12);
}

impl Default for Priority {
    fn default() -> Self {
        Self::DEFAULT
    }
}

impl From<u8> for Priority {
    fn from(v: u8) -> Self {
        Self(v)
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "prio:{}", self.0)
    }
}

/// Where a work item is delivered: a thread inside a process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Context {
    pub tid: ThreadId,
    pub pid: ProcessId,
}

impl Context {
    pub const INVALID: Self = Self::new(ThreadId::INVALID, ProcessId::INVALID);
    /// The calling thread.
    pub const LOCAL: Self = Self::new(ThreadId::LOCAL, ProcessId::LOCAL);
    /// Every thread of this process plus IPC egress.
    pub const BROADCAST: Self = Self::new(ThreadId::BROADCAST, ProcessId::LOCAL);

    #[must_use]
    pub const fn new(tid: ThreadId, pid: ProcessId) -> Self {
        Self { tid, pid }
    }

    /// A thread of the current process.
    #[must_use]
    pub const fn thread(tid: ThreadId) -> Self {
        Self::new(tid, ProcessId::LOCAL)
    }

    #[must_use]
    pub const fn is_valid(&self) -> bool {
        self.tid.is_valid() && self.pid.is_valid()
    }
}

impl fmt::Display for Context {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.pid, self.tid)
    }
}

/// A specific RPC endpoint: the context it lives in plus its service id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Address {
    pub context: Context,
    pub service: ServiceId,
}

impl Address {
    pub const INVALID: Self = Self::new(Context::INVALID, ServiceId::INVALID);

    #[must_use]
    pub const fn new(context: Context, service: ServiceId) -> Self {
        Self { context, service }
    }

    #[must_use]
    pub const fn is_valid(&self) -> bool {
        self.context.is_valid() && self.service.is_valid()
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.context, self.service)
    }
}
