//! Work items: what travels through inboxes.
//!
//! - [`Event`]: signature-routed, delivered to subscribed consumers, may cross
//!   process boundaries when its payload type has a registered codec.
//! - [`Runnable`]: deferred operation executed directly by the target loop,
//!   optionally blocking the sender until it has run.
//! - [`Callable`]: fire-and-forget deferred operation.
//!
//! Items are shared (`Arc`) so a broadcast can place the same item in every
//! inbox; they are immutable once wrapped.

use std::any::Any;
use std::fmt;
use std::sync::{Arc, Condvar, Mutex, PoisonError};

use super::inbox::Prioritized;
use super::signature::Signature;
use crate::types::{Context, Priority};

/// Type-erased event payload.
pub type Payload = Arc<dyn Any + Send + Sync>;

type Operation = Arc<dyn Fn() + Send + Sync>;

/// A signature-routed message.
#[derive(Clone)]
pub struct Event {
    signature: Signature,
    origin: Context,
    priority: Priority,
    payload: Option<Payload>,
}

impl Event {
    pub fn new(signature: Signature) -> Self {
        Self {
            signature,
            origin: Context::INVALID,
            priority: Priority::DEFAULT,
            payload: None,
        }
    }

    #[must_use]
    pub fn with_payload<T: Any + Send + Sync>(self, value: T) -> Self {
        self.with_shared_payload(Arc::new(value))
    }

    #[must_use]
    pub fn with_shared_payload(mut self, payload: Payload) -> Self {
        self.payload = Some(payload);
        self
    }

    #[must_use]
    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    /// Sets the context replies should go to. Dispatchers stamp this on send.
    #[must_use]
    pub fn with_origin(mut self, origin: Context) -> Self {
        self.origin = origin;
        self
    }

    #[must_use]
    pub fn signature(&self) -> &Signature {
        &self.signature
    }

    #[must_use]
    pub const fn origin(&self) -> Context {
        self.origin
    }

    #[must_use]
    pub const fn priority(&self) -> Priority {
        self.priority
    }

    #[must_use]
    pub fn payload(&self) -> Option<&Payload> {
        self.payload.as_ref()
    }

    /// Downcasts the payload.
    #[must_use]
    pub fn data<T: Any>(&self) -> Option<&T> {
        self.payload.as_deref().and_then(|p| p.downcast_ref::<T>())
    }
}

impl fmt::Debug for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Event")
            .field("signature", &self.signature)
            .field("origin", &self.origin)
            .field("priority", &self.priority)
            .field("has_payload", &self.payload.is_some())
            .finish()
    }
}

/// One-shot completion flag a blocked sender waits on.
///
/// The first signal wins: `true` when the operation ran, `false` when the
/// runnable was dropped unexecuted.
#[derive(Default)]
pub(crate) struct Completion {
    state: Mutex<Option<bool>>,
    done: Condvar,
}

impl Completion {
    fn signal(&self, executed: bool) {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if state.is_none() {
            *state = Some(executed);
            self.done.notify_all();
        }
    }

    /// Blocks until signalled. Returns whether the operation ran.
    pub(crate) fn wait(&self) -> bool {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        loop {
            if let Some(executed) = *state {
                return executed;
            }
            state = self.done.wait(state).unwrap_or_else(PoisonError::into_inner);
        }
    }
}

/// Deferred operation, optionally blocking its sender.
pub struct Runnable {
    op: Operation,
    priority: Priority,
    completion: Option<Arc<Completion>>,
}

impl Runnable {
    pub fn new(op: impl Fn() + Send + Sync + 'static) -> Self {
        Self {
            op: Arc::new(op),
            priority: Priority::DEFAULT,
            completion: None,
        }
    }

    #[must_use]
    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    /// Attaches a completion the sender can wait on.
    pub(crate) fn blocking(mut self) -> (Self, Arc<Completion>) {
        let completion = Arc::new(Completion::default());
        self.completion = Some(Arc::clone(&completion));
        (self, completion)
    }

    #[must_use]
    pub const fn is_blocking(&self) -> bool {
        self.completion.is_some()
    }

    pub(crate) fn run(&self) {
        (self.op)();
        if let Some(completion) = &self.completion {
            completion.signal(true);
        }
    }
}

impl Drop for Runnable {
    fn drop(&mut self) {
        if let Some(completion) = &self.completion {
            completion.signal(false);
        }
    }
}

/// Fire-and-forget deferred operation.
pub struct Callable {
    op: Operation,
    priority: Priority,
}

impl Callable {
    pub fn new(op: impl Fn() + Send + Sync + 'static) -> Self {
        Self {
            op: Arc::new(op),
            priority: Priority::DEFAULT,
        }
    }

    #[must_use]
    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub(crate) fn call(&self) {
        (self.op)();
    }
}

/// Anything a dispatch loop can pop.
#[derive(Clone)]
pub enum WorkItem {
    Event(Arc<Event>),
    Runnable(Arc<Runnable>),
    Callable(Arc<Callable>),
}

impl WorkItem {
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::Event(_) => "event",
            Self::Runnable(_) => "runnable",
            Self::Callable(_) => "callable",
        }
    }

    #[must_use]
    pub fn as_event(&self) -> Option<&Event> {
        match self {
            Self::Event(event) => Some(event),
            _ => None,
        }
    }
}

impl Prioritized for WorkItem {
    fn priority(&self) -> Priority {
        match self {
            Self::Event(event) => event.priority,
            Self::Runnable(runnable) => runnable.priority,
            Self::Callable(callable) => callable.priority,
        }
    }
}

impl fmt::Debug for WorkItem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Event(event) => fmt::Debug::fmt(&**event, f),
            Self::Runnable(r) => write!(f, "Runnable({}, blocking={})", r.priority, r.is_blocking()),
            Self::Callable(c) => write!(f, "Callable({})", c.priority),
        }
    }
}

impl From<Event> for WorkItem {
    fn from(event: Event) -> Self {
        Self::Event(Arc::new(event))
    }
}

impl From<Arc<Event>> for WorkItem {
    fn from(event: Arc<Event>) -> Self {
        Self::Event(event)
    }
}

impl From<Runnable> for WorkItem {
    fn from(runnable: Runnable) -> Self {
        Self::Runnable(Arc::new(runnable))
    }
}

impl From<Callable> for WorkItem {
    fn from(callable: Callable) -> Self {
        Self::Callable(Arc::new(callable))
    }
}
