//! Dispatch primitives shared by every loop.
//!
//! - `signature`: ordered keys consumers subscribe to.
//! - `work`: events, runnables and callables.
//! - `inbox`: the strict-priority inbox a loop pops from.
//! - `registry`: signature to consumer-token table with reentrancy buffering.

pub mod inbox;
pub mod registry;
pub mod signature;
pub mod work;

pub use inbox::{InboxError, Prioritized, PriorityInbox, Timeout};
pub use registry::{DispatchError, SubscriptionRegistry};
pub use signature::{Interaction, Route, Signature};
pub use work::{Callable, Event, Payload, Runnable, WorkItem};
