//! One managed thread: inbox, subscription registry and the loop body.
//!
//! ```text
//!   Stopped ──start()──> Starting ──body──> Running ──stop()──> Stopping ──> Stopped
//!                                            │
//!                                            ├─ install system consumer
//!                                            ├─ run component factories   (ready)
//!                                            └─ pop ─> execute ─> pop ...
//! ```
//!
//! The shared half ([`DispatchLoop`]) is `Send + Sync` and is what other
//! threads insert into. Everything that is not thread-safe (consumers,
//! components) lives on the loop thread behind its [`Dispatcher`].

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use minstant::Instant;

use super::dispatcher::Dispatcher;
use super::system::{ComponentFactory, SystemConsumer};
use super::topology;
use super::{Runtime, RuntimeError, SendError};
use crate::dispatch::{InboxError, PriorityInbox, SubscriptionRegistry, Timeout, WorkItem};
use crate::trace::{debug, error, info, trace, warn};
use crate::types::ThreadId;

/// Lifecycle state of a dispatch loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopState {
    Stopped,
    Starting,
    Running,
    Stopping,
}

struct Lifecycle {
    state: LoopState,
    /// Components created; the loop is about to pop its first item.
    ready: bool,
}

/// Description of a thread to create at runtime build time.
#[derive(Clone)]
pub struct ThreadSpec {
    pub(crate) name: String,
    pub(crate) factories: Vec<ComponentFactory>,
    pub(crate) watchdog_timeout: Option<Duration>,
    pub(crate) core: Option<usize>,
}

impl ThreadSpec {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            factories: Vec::new(),
            watchdog_timeout: None,
            core: None,
        }
    }

    /// Adds a component factory; components are created in insertion order
    /// and destroyed in reverse.
    #[must_use]
    pub fn component(mut self, factory: ComponentFactory) -> Self {
        self.factories.push(factory);
        self
    }

    /// Overrides the runtime-wide watchdog timeout for this thread.
    #[must_use]
    pub fn watchdog_timeout(mut self, timeout: Duration) -> Self {
        self.watchdog_timeout = Some(timeout);
        self
    }

    /// Pins the loop thread to a CPU core.
    #[must_use]
    pub fn pin_to_core(mut self, core: usize) -> Self {
        self.core = Some(core);
        self
    }
}

/// Shared handle to one managed thread.
pub struct DispatchLoop {
    id: ThreadId,
    name: String,
    inbox: PriorityInbox<WorkItem>,
    registry: SubscriptionRegistry,
    lifecycle: Mutex<Lifecycle>,
    lifecycle_changed: Condvar,
    /// Cleared by `stop()`; checked before every pop.
    running: AtomicBool,
    /// Microseconds since the runtime epoch when the current item started, 0 when idle.
    processing_since: AtomicU64,
    watchdog_timeout: Duration,
    core: Option<usize>,
    factories: Vec<ComponentFactory>,
    join_handle: Mutex<Option<JoinHandle<()>>>,
}

impl DispatchLoop {
    pub(crate) fn new(
        id: ThreadId,
        spec: ThreadSpec,
        max_priority: usize,
        default_timeout: Duration,
    ) -> Self {
        Self {
            id,
            name: spec.name,
            inbox: PriorityInbox::new(max_priority),
            registry: SubscriptionRegistry::new(),
            lifecycle: Mutex::new(Lifecycle {
                state: LoopState::Stopped,
                ready: false,
            }),
            lifecycle_changed: Condvar::new(),
            running: AtomicBool::new(false),
            processing_since: AtomicU64::new(0),
            watchdog_timeout: spec.watchdog_timeout.unwrap_or(default_timeout),
            core: spec.core,
            factories: spec.factories,
            join_handle: Mutex::new(None),
        }
    }

    #[must_use]
    pub const fn id(&self) -> ThreadId {
        self.id
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    pub(crate) const fn registry(&self) -> &SubscriptionRegistry {
        &self.registry
    }

    fn lifecycle(&self) -> MutexGuard<'_, Lifecycle> {
        self.lifecycle.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn set_state(&self, state: LoopState) {
        let mut lifecycle = self.lifecycle();
        lifecycle.state = state;
        if state != LoopState::Running {
            lifecycle.ready = false;
        }
        drop(lifecycle);
        self.lifecycle_changed.notify_all();
    }

    fn set_ready(&self) {
        self.lifecycle().ready = true;
        self.lifecycle_changed.notify_all();
    }

    #[must_use]
    pub fn state(&self) -> LoopState {
        self.lifecycle().state
    }

    /// Whether the loop accepts work.
    #[must_use]
    pub fn started(&self) -> bool {
        self.state() == LoopState::Running
    }

    /// Start time of the item being processed (microseconds since the
    /// runtime epoch), or 0 when idle.
    #[must_use]
    pub fn process_started(&self) -> u64 {
        self.processing_since.load(Ordering::Acquire)
    }

    #[must_use]
    pub const fn watchdog_timeout(&self) -> Duration {
        self.watchdog_timeout
    }

    /// Holds back delivery and refuses inserts until [`DispatchLoop::unfreeze`].
    pub fn freeze(&self) {
        debug!(thread = %self.id, "inbox frozen");
        self.inbox.freeze();
    }

    pub fn unfreeze(&self) {
        debug!(thread = %self.id, "inbox unfrozen");
        self.inbox.unfreeze();
    }

    /// Drops every queued item.
    pub fn clear(&self) {
        self.inbox.clear();
    }

    /// Items waiting in the inbox.
    #[must_use]
    pub fn pending(&self) -> usize {
        self.inbox.len()
    }

    /// Queues `item` after checking the loop is running and, for events,
    /// that at least one consumer is subscribed.
    ///
    /// # Errors
    ///
    /// See [`SendError`].
    pub fn insert(&self, item: WorkItem) -> Result<(), SendError> {
        if !self.started() {
            return Err(SendError::NotStarted(self.id));
        }
        if let WorkItem::Event(event) = &item {
            if !self.registry.is_subscribed(event.signature()) {
                debug!(thread = %self.id, signature = %event.signature(), "event refused: no subscribers");
                return Err(SendError::NoSubscribers {
                    thread: self.id,
                    signature: event.signature().to_string(),
                });
            }
        }
        self.inbox.insert(item).map_err(|e| match e {
            InboxError::Frozen => SendError::Frozen(self.id),
            InboxError::Closed => SendError::NotStarted(self.id),
        })
    }

    /// Spawns the loop thread.
    pub(crate) fn start(self: &Arc<Self>, runtime: Runtime) -> Result<(), RuntimeError> {
        {
            let mut lifecycle = self.lifecycle();
            if lifecycle.state != LoopState::Stopped {
                return Err(RuntimeError::AlreadyStarted);
            }
            lifecycle.state = LoopState::Starting;
        }
        self.inbox.reopen();
        self.running.store(true, Ordering::Release);

        debug!(thread = %self.id, name = %self.name, "spawning dispatch loop");
        let this = Arc::clone(self);
        let spawned = thread::Builder::new()
            .name(self.name.clone())
            .spawn(move || this.run(runtime));
        match spawned {
            Ok(handle) => {
                *self.join_handle.lock().unwrap_or_else(PoisonError::into_inner) = Some(handle);
                Ok(())
            }
            Err(e) => {
                error!(thread = %self.id, error = %e, "failed to spawn dispatch loop");
                self.running.store(false, Ordering::Release);
                self.set_state(LoopState::Stopped);
                Err(RuntimeError::Spawn(e))
            }
        }
    }

    /// Blocks until the loop has created its components, stopped, or the
    /// deadline passed. Returns `true` if ready.
    pub(crate) fn wait_ready(&self, deadline: Instant) -> bool {
        let mut lifecycle = self.lifecycle();
        loop {
            if lifecycle.ready {
                return true;
            }
            if lifecycle.state == LoopState::Stopped {
                return false;
            }
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            lifecycle = self
                .lifecycle_changed
                .wait_timeout(lifecycle, deadline - now)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
    }

    /// Asks the loop to exit after the item in flight.
    pub fn stop(&self) {
        if self.running.swap(false, Ordering::AcqRel) {
            info!(thread = %self.id, name = %self.name, "stop requested");
        }
        self.inbox.close();
    }

    /// Blocks until the loop thread has returned.
    pub fn wait(&self) {
        let handle = self
            .join_handle
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = handle {
            if handle.join().is_err() {
                error!(thread = %self.id, "dispatch loop panicked");
                self.set_state(LoopState::Stopped);
            }
        }
    }

    fn run(self: Arc<Self>, runtime: Runtime) {
        if let Some(core) = self.core {
            if !topology::pin_to_core(core) {
                warn!(thread = %self.id, core, "failed to pin dispatch loop");
            }
        }

        let dispatcher = Dispatcher::new(runtime.clone(), Arc::clone(&self));
        Dispatcher::install(Some(dispatcher.clone()));
        self.set_state(LoopState::Running);
        info!(thread = %self.id, name = %self.name, "dispatch loop running");

        let system = SystemConsumer::install(&dispatcher);
        dispatcher.create_components(&self.factories);
        self.set_ready();

        while self.running.load(Ordering::Acquire) {
            let Some(item) = self.inbox.pop(Timeout::Infinite) else {
                break;
            };
            trace!(thread = %self.id, ?item, "dispatching");
            self.processing_since
                .store(runtime.elapsed_micros().max(1), Ordering::Release);
            dispatcher.execute(item);
            self.processing_since.store(0, Ordering::Release);
        }

        self.set_state(LoopState::Stopping);
        debug!(thread = %self.id, "destroying components");
        dispatcher.destroy_components();
        drop(system);
        self.inbox.close();
        self.inbox.clear();
        Dispatcher::install(None);
        drop(dispatcher);
        self.set_state(LoopState::Stopped);
        info!(thread = %self.id, name = %self.name, "dispatch loop stopped");
    }
}

impl std::fmt::Debug for DispatchLoop {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DispatchLoop")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}
