//! The runtime: managed threads, address routing and lifecycle.
//!
//! A [`Runtime`] is built once at process entry and cloned into whatever
//! needs it (every [`Dispatcher`] carries one). It owns:
//!
//! ```text
//!                    ┌──────────── Runtime ─────────────┐
//!   send(item, ctx) ─┤ router                           │
//!                    │   ├─ tid N       ─> loop N inbox │
//!                    │   ├─ tid LOCAL   ─> caller inbox │
//!                    │   ├─ tid BCAST   ─> all + IPC    │
//!                    │   └─ external    ─> IPC egress   │
//!                    │ timer thread, watchdog thread    │
//!                    │ codecs, service registry         │
//!                    └──────────────────────────────────┘
//! ```
//!
//! - `dispatch_loop`: per-thread inbox, registry and loop body.
//! - `dispatcher`: the loop-thread facade consumers talk to.
//! - `system`: components and the built-in boot/shutdown/ping consumer.
//! - `timer`: timer service thread and per-thread timers.
//! - `topology`: optional CPU pinning.
//! - `watchdog`: stall detection.

pub mod dispatch_loop;
pub mod dispatcher;
pub mod system;
pub mod timer;
pub mod topology;
pub mod watchdog;

use std::collections::HashSet;
use std::io;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock, Weak};

use minstant::Instant;

pub use dispatch_loop::{DispatchLoop, LoopState, ThreadSpec};
pub use dispatcher::{Consumer, Dispatcher};
pub use system::{Component, ComponentFactory, ShutdownBlocker};
pub use timer::{Timer, TimerCount, TimerError, TimerId};
pub use topology::CpuConfig;
pub use watchdog::Watchdog;

use system::SystemEvent;
use timer::TimerService;

use crate::config::{ConfigError, RuntimeConfig};
use crate::dispatch::{Event, InboxError, Runnable, WorkItem};
use crate::ipc::{CodecRegistry, IpcChannel, IpcError};
use crate::net::Endpoint;
use crate::rpc::{STATUS_TAG, ServiceRegistry, ServiceStatus};
use crate::trace::{debug, error, info, warn};
use crate::types::{Context, ProcessId, ServiceId, ThreadId};

/// Why a work item was not queued.
#[derive(Debug, thiserror::Error)]
pub enum SendError {
    #[error("invalid destination context")]
    InvalidContext,
    #[error("unknown thread {0}")]
    UnknownThread(ThreadId),
    #[error("local send from a thread not managed by this runtime")]
    NotManagedThread,
    #[error("only events may cross a process boundary")]
    ExternalNonEvent,
    #[error("IPC is not configured or not running")]
    IpcUnavailable,
    #[error("IPC egress refused the event: {0}")]
    IpcRefused(#[source] InboxError),
    #[error("thread {0} is not running")]
    NotStarted(ThreadId),
    #[error("no consumer on {thread} for {signature}")]
    NoSubscribers { thread: ThreadId, signature: String },
    #[error("inbox of {0} is frozen")]
    Frozen(ThreadId),
    #[error("blocking send to the calling thread")]
    BlockingToSelf,
    #[error("blocking runnable was dropped before it ran")]
    Abandoned,
    #[error("broadcast failed for {failed} destination(s)")]
    Broadcast { failed: usize },
}

#[derive(Debug, thiserror::Error)]
pub enum RuntimeError {
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),
    #[error("failed to spawn thread: {0}")]
    Spawn(#[source] io::Error),
    #[error("IPC error: {0}")]
    Ipc(#[from] IpcError),
    #[error("runtime already started")]
    AlreadyStarted,
    #[error("thread {0} did not report running in time")]
    StartTimeout(ThreadId),
    #[error("duplicate thread name {0:?}")]
    DuplicateThread(String),
}

struct Shared {
    config: RuntimeConfig,
    epoch: Instant,
    loops: Vec<Arc<DispatchLoop>>,
    ipc: RwLock<Option<Arc<IpcChannel>>>,
    codecs: Arc<CodecRegistry>,
    services: Mutex<ServiceRegistry>,
    next_service: AtomicU32,
    started: AtomicBool,
    watchdog: Mutex<Option<Watchdog>>,
    timers: Arc<TimerService>,
}

/// Shared handle to a running set of dispatch loops. Cheap to clone.
#[derive(Clone)]
pub struct Runtime {
    shared: Arc<Shared>,
}

/// Non-owning runtime handle held by service threads.
#[derive(Clone)]
pub(crate) struct WeakRuntime(Weak<Shared>);

impl WeakRuntime {
    pub(crate) fn upgrade(&self) -> Option<Runtime> {
        self.0.upgrade().map(|shared| Runtime { shared })
    }
}

/// Builder for [`Runtime`].
pub struct RuntimeBuilder {
    config: RuntimeConfig,
    threads: Vec<ThreadSpec>,
    cpu: CpuConfig,
}

impl RuntimeBuilder {
    /// Adds a managed thread. Thread ids follow insertion order from 0.
    #[must_use]
    pub fn thread(mut self, spec: ThreadSpec) -> Self {
        self.threads.push(spec);
        self
    }

    #[must_use]
    pub const fn cpu(mut self, cpu: CpuConfig) -> Self {
        self.cpu = cpu;
        self
    }

    /// # Errors
    ///
    /// Returns [`RuntimeError::DuplicateThread`] if two threads share a name.
    pub fn build(self) -> Result<Runtime, RuntimeError> {
        let mut names = HashSet::new();
        for spec in &self.threads {
            if !names.insert(spec.name.clone()) {
                return Err(RuntimeError::DuplicateThread(spec.name.clone()));
            }
        }

        let cores = match self.cpu {
            CpuConfig::Disabled => Vec::new(),
            CpuConfig::RoundRobin => topology::available_cores(),
        };
        let max_priority = self.config.max_priority;
        let default_timeout = self.config.watchdog_timeout;
        let loops = self
            .threads
            .into_iter()
            .enumerate()
            .map(|(index, mut spec)| {
                if spec.core.is_none() {
                    spec.core = self.cpu.core_for(index, &cores);
                }
                #[allow(clippy::cast_possible_truncation)]
                let id = ThreadId(index as u32);
                Arc::new(DispatchLoop::new(id, spec, max_priority, default_timeout))
            })
            .collect();

        // Status events pair servers and proxies across processes.
        let codecs = Arc::new(CodecRegistry::new());
        codecs.register_typed::<ServiceStatus>(STATUS_TAG);

        Ok(Runtime {
            shared: Arc::new(Shared {
                config: self.config,
                epoch: Instant::now(),
                loops,
                ipc: RwLock::new(None),
                codecs,
                services: Mutex::new(ServiceRegistry::new()),
                next_service: AtomicU32::new(0),
                started: AtomicBool::new(false),
                watchdog: Mutex::new(None),
                timers: Arc::new(TimerService::new()),
            }),
        })
    }
}

impl Runtime {
    #[must_use]
    pub fn builder(config: RuntimeConfig) -> RuntimeBuilder {
        RuntimeBuilder {
            config,
            threads: Vec::new(),
            cpu: CpuConfig::Disabled,
        }
    }

    pub(crate) fn downgrade(&self) -> WeakRuntime {
        WeakRuntime(Arc::downgrade(&self.shared))
    }

    #[must_use]
    pub fn config(&self) -> &RuntimeConfig {
        &self.shared.config
    }

    #[must_use]
    pub fn process_id(&self) -> ProcessId {
        self.shared.config.process_id
    }

    /// Microseconds since the runtime was built.
    #[must_use]
    pub fn elapsed_micros(&self) -> u64 {
        watchdog::elapsed_micros(self.shared.epoch)
    }

    #[must_use]
    pub fn threads(&self) -> &[Arc<DispatchLoop>] {
        &self.shared.loops
    }

    #[must_use]
    pub fn thread(&self, id: ThreadId) -> Option<&Arc<DispatchLoop>> {
        self.shared.loops.iter().find(|l| l.id() == id)
    }

    #[must_use]
    pub fn thread_by_name(&self, name: &str) -> Option<&Arc<DispatchLoop>> {
        self.shared.loops.iter().find(|l| l.name() == name)
    }

    /// Whether `context` lives in another process.
    #[must_use]
    pub fn is_external(&self, context: Context) -> bool {
        context.pid != ProcessId::LOCAL && context.pid != self.process_id()
    }

    /// The dispatcher of the calling thread if it is one of ours.
    fn current_dispatcher(&self) -> Option<Dispatcher> {
        Dispatcher::current().filter(|d| Arc::ptr_eq(&d.runtime().shared, &self.shared))
    }

    /// Id of the calling thread if it is one of ours.
    #[must_use]
    pub fn current_thread(&self) -> Option<ThreadId> {
        self.current_dispatcher().map(|d| d.thread_id())
    }

    /// Routes `item` to the inbox(es) `to` designates.
    ///
    /// # Errors
    ///
    /// - [`SendError::InvalidContext`] for an invalid destination
    /// - [`SendError::ExternalNonEvent`] / [`SendError::IpcUnavailable`] for
    ///   process-crossing sends that cannot be carried
    /// - [`SendError::NotManagedThread`] for a local send from a foreign thread
    /// - [`SendError::UnknownThread`] for an id no loop has
    /// - [`SendError::Broadcast`] if any broadcast target refused
    /// - the target inbox's refusal otherwise
    pub fn send(&self, item: impl Into<WorkItem>, to: Context) -> Result<(), SendError> {
        let item = item.into();
        if !to.is_valid() {
            warn!(%to, "send to invalid context");
            return Err(SendError::InvalidContext);
        }

        if self.is_external(to) {
            let WorkItem::Event(event) = item else {
                warn!(%to, kind = item.kind(), "only events may be sent to another process");
                return Err(SendError::ExternalNonEvent);
            };
            let ipc = self.ipc().ok_or(SendError::IpcUnavailable)?;
            return ipc.enqueue(to, event).map_err(SendError::IpcRefused);
        }

        match to.tid {
            ThreadId::BROADCAST => {
                let mut failed = self.broadcast_local(&item);
                if let (WorkItem::Event(event), Some(ipc)) = (&item, self.ipc()) {
                    // Only events other processes can decode leave the process.
                    let tag = event.signature().type_tag();
                    if self.shared.codecs.contains(tag) {
                        let everyone = Context::new(ThreadId::BROADCAST, ProcessId::BROADCAST);
                        if ipc.enqueue(everyone, Arc::clone(event)).is_err() {
                            failed += 1;
                        }
                    } else {
                        debug!(tag, "broadcast stays local: no codec for type tag");
                    }
                }
                if failed > 0 {
                    debug!(failed, kind = item.kind(), "broadcast partially refused");
                    return Err(SendError::Broadcast { failed });
                }
                Ok(())
            }
            ThreadId::LOCAL => {
                let dispatcher = self.current_dispatcher().ok_or_else(|| {
                    warn!("local send from an unmanaged thread");
                    SendError::NotManagedThread
                })?;
                dispatcher.handle().insert(item)
            }
            tid => {
                let target = self.thread(tid).ok_or_else(|| {
                    warn!(thread = %tid, "send to unknown thread");
                    SendError::UnknownThread(tid)
                })?;
                target.insert(item)
            }
        }
    }

    /// Inserts into every loop; returns the number of refusals.
    fn broadcast_local(&self, item: &WorkItem) -> usize {
        self.shared
            .loops
            .iter()
            .filter(|l| l.insert(item.clone()).is_err())
            .count()
    }

    /// Sends `runnable` and blocks until the target has executed it.
    ///
    /// # Errors
    ///
    /// - [`SendError::BlockingToSelf`] when the destination includes the
    ///   calling thread
    /// - [`SendError::Abandoned`] if the runnable was dropped unexecuted
    /// - any error of [`Runtime::send`]
    pub fn send_blocking(&self, runnable: Runnable, to: Context) -> Result<(), SendError> {
        if self.is_external(to) {
            return Err(SendError::ExternalNonEvent);
        }
        if let Some(current) = self.current_thread() {
            if matches!(to.tid, ThreadId::LOCAL | ThreadId::BROADCAST) || to.tid == current {
                warn!(thread = %current, %to, "blocking send to self refused");
                return Err(SendError::BlockingToSelf);
            }
        }
        let (runnable, completion) = runnable.blocking();
        self.send(runnable, to)?;
        if completion.wait() {
            Ok(())
        } else {
            Err(SendError::Abandoned)
        }
    }

    /// Starts IPC, every loop, then the timer and watchdog threads.
    ///
    /// Returns once every loop has created its components.
    ///
    /// # Errors
    ///
    /// On any failure everything already started is stopped again.
    pub fn start(&self) -> Result<(), RuntimeError> {
        if self.shared.started.swap(true, Ordering::AcqRel) {
            return Err(RuntimeError::AlreadyStarted);
        }
        info!(
            process = %self.process_id(),
            threads = self.shared.loops.len(),
            "starting runtime"
        );
        let result = self.start_all();
        if let Err(e) = &result {
            error!(error = %e, "runtime start failed");
            self.stop();
            self.wait();
            self.shared.started.store(false, Ordering::Release);
        }
        result
    }

    fn start_all(&self) -> Result<(), RuntimeError> {
        if let Some(config) = &self.shared.config.ipc {
            let channel = IpcChannel::start(
                config,
                self.process_id(),
                self.shared.config.max_priority,
                Arc::clone(&self.shared.codecs),
                self.downgrade(),
            )?;
            *self.shared.ipc.write().unwrap_or_else(PoisonError::into_inner) = Some(Arc::new(channel));
        }

        for l in &self.shared.loops {
            l.start(self.clone())?;
        }
        let deadline = Instant::now() + self.shared.config.start_timeout;
        for l in &self.shared.loops {
            if !l.wait_ready(deadline) {
                return Err(RuntimeError::StartTimeout(l.id()));
            }
        }

        self.shared
            .timers
            .start(self.downgrade())
            .map_err(RuntimeError::Spawn)?;

        if !self.shared.config.watchdog_timeout.is_zero() {
            let watchdog = Watchdog::spawn(
                self.shared.loops.clone(),
                self.shared.epoch,
                self.shared.config.watchdog_interval(),
            )
            .map_err(RuntimeError::Spawn)?;
            *self.lock_watchdog() = Some(watchdog);
        }
        info!("runtime started");
        Ok(())
    }

    fn lock_watchdog(&self) -> MutexGuard<'_, Option<Watchdog>> {
        self.shared.watchdog.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Sends the boot message to the root components of every thread.
    ///
    /// # Errors
    ///
    /// [`SendError::Broadcast`] if some thread is not running.
    pub fn boot(&self, message: &str) -> Result<(), SendError> {
        self.system_broadcast(SystemEvent::Boot, message)
    }

    /// Asks every component to shut down; each thread stops once its
    /// components release their [`ShutdownBlocker`].
    ///
    /// # Errors
    ///
    /// [`SendError::Broadcast`] if some thread is not running.
    pub fn shutdown(&self, message: &str) -> Result<(), SendError> {
        self.system_broadcast(SystemEvent::Shutdown, message)
    }

    /// Sends a ping to `context`'s system consumer.
    ///
    /// # Errors
    ///
    /// See [`Runtime::send`].
    pub fn ping(&self, context: Context, message: &str) -> Result<(), SendError> {
        if self.is_external(context) {
            return Err(SendError::ExternalNonEvent);
        }
        if context.tid == ThreadId::BROADCAST {
            return self.system_broadcast(SystemEvent::Ping, message);
        }
        let event = SystemEvent::Ping.event(message).with_origin(self.origin());
        self.send(event, context)
    }

    fn system_broadcast(&self, kind: SystemEvent, message: &str) -> Result<(), SendError> {
        let item = WorkItem::from(kind.event(message).with_origin(self.origin()));
        match self.broadcast_local(&item) {
            0 => Ok(()),
            failed => Err(SendError::Broadcast { failed }),
        }
    }

    fn origin(&self) -> Context {
        self.current_dispatcher()
            .map_or(Context::LOCAL, |d| d.context())
    }

    /// Stops every loop after its item in flight.
    pub fn stop(&self) {
        for l in &self.shared.loops {
            l.stop();
        }
    }

    /// Joins every loop, then stops the IPC, timer and watchdog threads.
    pub fn wait(&self) {
        for l in &self.shared.loops {
            l.wait();
        }
        let watchdog = self.lock_watchdog().take();
        if let Some(watchdog) = watchdog {
            watchdog.shutdown();
        }
        self.shared.timers.shutdown();
        let ipc = self.shared.ipc.write().unwrap_or_else(PoisonError::into_inner).take();
        if let Some(ipc) = ipc {
            ipc.shutdown();
        }
        self.shared.started.store(false, Ordering::Release);
        info!("runtime stopped");
    }

    fn ipc(&self) -> Option<Arc<IpcChannel>> {
        self.shared.ipc.read().unwrap_or_else(PoisonError::into_inner).clone()
    }

    /// Local endpoint of the IPC channel, once started.
    #[must_use]
    pub fn ipc_endpoint(&self) -> Option<Endpoint> {
        self.ipc().map(|ipc| ipc.local_endpoint())
    }

    /// Records where process `pid` listens.
    ///
    /// # Errors
    ///
    /// [`SendError::IpcUnavailable`] if IPC is not running.
    pub fn add_peer(&self, pid: ProcessId, endpoint: Endpoint) -> Result<(), SendError> {
        let ipc = self.ipc().ok_or(SendError::IpcUnavailable)?;
        ipc.add_peer(pid, endpoint);
        Ok(())
    }

    /// Payload codecs used for events crossing process boundaries.
    #[must_use]
    pub fn codecs(&self) -> &Arc<CodecRegistry> {
        &self.shared.codecs
    }

    pub(crate) fn services(&self) -> MutexGuard<'_, ServiceRegistry> {
        self.shared.services.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Allocates a process-unique service id.
    pub(crate) fn next_service_id(&self) -> ServiceId {
        ServiceId(self.shared.next_service.fetch_add(1, Ordering::Relaxed))
    }

    pub(crate) fn timers(&self) -> &Arc<TimerService> {
        &self.shared.timers
    }

    /// Delivers an event that arrived over IPC. Never forwards back to IPC.
    pub(crate) fn deliver_inbound(&self, event: Event, tid: ThreadId) {
        let signature = event.signature().to_string();
        let item = WorkItem::from(event);
        let result = match tid {
            ThreadId::BROADCAST => match self.broadcast_local(&item) {
                n if n == self.shared.loops.len() => Err(SendError::Broadcast { failed: n }),
                _ => Ok(()),
            },
            ThreadId::LOCAL => Err(SendError::NotManagedThread),
            tid => match self.thread(tid) {
                Some(target) => target.insert(item),
                None => Err(SendError::UnknownThread(tid)),
            },
        };
        if let Err(e) = result {
            debug!(thread = %tid, %signature, error = %e, "inbound event not delivered");
        }
    }
}

impl std::fmt::Debug for Runtime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Runtime")
            .field("process_id", &self.process_id())
            .field("threads", &self.shared.loops.len())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatch::Signature;
    use crate::types::Priority;

    fn runtime(threads: &[&str]) -> Runtime {
        let config = RuntimeConfig {
            process_id: ProcessId(7),
            watchdog_timeout: std::time::Duration::ZERO,
            ..RuntimeConfig::default()
        };
        threads
            .iter()
            .fold(Runtime::builder(config), |b, name| b.thread(ThreadSpec::new(*name)))
            .build()
            .expect("build")
    }

    #[test]
    fn duplicate_thread_names_are_refused() {
        let result = Runtime::builder(RuntimeConfig::default())
            .thread(ThreadSpec::new("a"))
            .thread(ThreadSpec::new("a"))
            .build();
        assert!(matches!(result, Err(RuntimeError::DuplicateThread(name)) if name == "a"));
    }

    #[test]
    fn thread_ids_follow_insertion_order() {
        let rt = runtime(&["a", "b"]);
        assert_eq!(rt.thread_by_name("b").map(|l| l.id()), Some(ThreadId(1)));
    }

    #[test]
    fn external_contexts_are_detected() {
        let rt = runtime(&[]);
        assert!(!rt.is_external(Context::new(ThreadId(0), ProcessId::LOCAL)));
        assert!(!rt.is_external(Context::new(ThreadId(0), ProcessId(7))));
        assert!(rt.is_external(Context::new(ThreadId(0), ProcessId(8))));
    }

    #[test]
    fn routing_failures_before_start() {
        let rt = runtime(&["a"]);
        let ping = || Event::new(Signature::new("app", "ping"));

        assert!(matches!(rt.send(ping(), Context::INVALID), Err(SendError::InvalidContext)));
        assert!(matches!(
            rt.send(ping(), Context::thread(ThreadId(9))),
            Err(SendError::UnknownThread(ThreadId(9)))
        ));
        assert!(matches!(
            rt.send(ping(), Context::thread(ThreadId(0))),
            Err(SendError::NotStarted(_))
        ));
        assert!(matches!(
            rt.send(ping(), Context::thread(ThreadId::LOCAL)),
            Err(SendError::NotManagedThread)
        ));
        assert!(matches!(
            rt.send(Runnable::new(|| {}), Context::new(ThreadId(0), ProcessId(8))),
            Err(SendError::ExternalNonEvent)
        ));
        assert!(matches!(
            rt.send(ping().with_priority(Priority(1)), Context::new(ThreadId(0), ProcessId(8))),
            Err(SendError::IpcUnavailable)
        ));
    }

    #[test]
    fn start_and_wait_cycle() {
        let rt = runtime(&["a", "b"]);
        rt.start().expect("start");
        assert!(matches!(rt.start(), Err(RuntimeError::AlreadyStarted)));
        assert!(rt.threads().iter().all(|l| l.started()));
        rt.stop();
        rt.wait();
        assert!(rt.threads().iter().all(|l| l.state() == LoopState::Stopped));
    }
}
