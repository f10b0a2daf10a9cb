//! Per-thread facade over a dispatch loop.
//!
//! A [`Dispatcher`] exists only on its loop thread. It owns the table that
//! turns consumer tokens back into consumer objects, which is why consumers
//! can be plain `Rc` values with interior mutability instead of `Send + Sync`
//! types.
//!
//! Consumers are registered through [`Dispatcher::register`], which hands out
//! a [`ConsumerId`] token. The dispatcher keeps only a weak reference; a
//! consumer that is dropped without calling [`Dispatcher::deregister`] is
//! skipped (and logged) on the next delivery.

use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::rc::{Rc, Weak};
use std::sync::Arc;

use super::dispatch_loop::DispatchLoop;
use super::system::{Component, ComponentFactory};
use super::{Runtime, SendError};
use crate::dispatch::{Event, Signature, WorkItem};
use crate::trace::{debug, trace};
use crate::types::{ConsumerId, Context, ThreadId};

/// Receives events whose signature it is subscribed to.
pub trait Consumer {
    fn process(&self, event: &Event);
}

thread_local! {
    static CURRENT: RefCell<Option<Dispatcher>> = const { RefCell::new(None) };
}

struct Inner {
    runtime: Runtime,
    handle: Arc<DispatchLoop>,
    consumers: RefCell<HashMap<ConsumerId, Weak<dyn Consumer>>>,
    next_consumer: Cell<u64>,
    components: RefCell<Vec<Rc<dyn Component>>>,
}

/// Handle to the dispatch loop owning the current thread. Cheap to clone.
#[derive(Clone)]
pub struct Dispatcher {
    inner: Rc<Inner>,
}

impl Dispatcher {
    pub(crate) fn new(runtime: Runtime, handle: Arc<DispatchLoop>) -> Self {
        Self {
            inner: Rc::new(Inner {
                runtime,
                handle,
                consumers: RefCell::new(HashMap::new()),
                next_consumer: Cell::new(0),
                components: RefCell::new(Vec::new()),
            }),
        }
    }

    /// The dispatcher of the calling thread, if it is a managed loop.
    #[must_use]
    pub fn current() -> Option<Self> {
        CURRENT.with(|current| current.borrow().clone())
    }

    pub(crate) fn install(dispatcher: Option<Self>) {
        CURRENT.with(|current| *current.borrow_mut() = dispatcher);
    }

    #[must_use]
    pub fn runtime(&self) -> &Runtime {
        &self.inner.runtime
    }

    #[must_use]
    pub fn thread_id(&self) -> ThreadId {
        self.inner.handle.id()
    }

    #[must_use]
    pub fn name(&self) -> &str {
        self.inner.handle.name()
    }

    /// Context addressing this thread.
    #[must_use]
    pub fn context(&self) -> Context {
        Context::thread(self.thread_id())
    }

    pub(crate) fn handle(&self) -> &Arc<DispatchLoop> {
        &self.inner.handle
    }

    /// Creates a consumer with a fresh token and registers it.
    pub fn register<C, F>(&self, build: F) -> Rc<C>
    where
        C: Consumer + 'static,
        F: FnOnce(ConsumerId) -> C,
    {
        let id = ConsumerId(self.inner.next_consumer.get());
        self.inner.next_consumer.set(id.0 + 1);
        let consumer = Rc::new(build(id));
        let weak: Weak<dyn Consumer> = Rc::downgrade(&consumer) as Weak<dyn Consumer>;
        self.inner.consumers.borrow_mut().insert(id, weak);
        trace!(thread = %self.thread_id(), %id, "consumer registered");
        consumer
    }

    /// Revokes a token and every subscription made with it.
    pub fn deregister(&self, id: ConsumerId) {
        self.inner.handle.registry().forget(id);
        self.inner.consumers.borrow_mut().remove(&id);
        trace!(thread = %self.thread_id(), %id, "consumer deregistered");
    }

    pub fn subscribe(&self, signature: Signature, consumer: ConsumerId) {
        self.inner.handle.registry().subscribe(signature, consumer);
    }

    pub fn unsubscribe(&self, signature: &Signature, consumer: ConsumerId) {
        self.inner.handle.registry().unsubscribe(signature, consumer);
    }

    /// Removes `consumer` from every signature of the given type.
    pub fn unsubscribe_all(&self, type_tag: &str, consumer: ConsumerId) {
        self.inner
            .handle
            .registry()
            .unsubscribe_all(type_tag, consumer);
    }

    #[must_use]
    pub fn is_subscribed(&self, signature: &Signature) -> bool {
        self.inner.handle.registry().is_subscribed(signature)
    }

    /// Routes `item` through the runtime.
    ///
    /// # Errors
    ///
    /// See [`SendError`].
    pub fn send(&self, item: impl Into<WorkItem>, to: Context) -> Result<(), SendError> {
        self.inner.runtime.send(item, to)
    }

    /// Sends an event, stamping this thread as its origin if none was set.
    ///
    /// # Errors
    ///
    /// See [`SendError`].
    pub fn send_event(&self, event: Event, to: Context) -> Result<(), SendError> {
        let event = if event.origin().is_valid() {
            event
        } else {
            event.with_origin(self.context())
        };
        self.inner.runtime.send(event, to)
    }

    /// Stops this loop after the current item.
    pub fn stop(&self) {
        self.inner.handle.stop();
    }

    pub(crate) fn execute(&self, item: WorkItem) {
        match item {
            WorkItem::Event(event) => {
                let result = self.inner.handle.registry().dispatch(event.signature(), |id| {
                    let consumer = self.inner.consumers.borrow().get(&id).and_then(Weak::upgrade);
                    match consumer {
                        Some(consumer) => consumer.process(&event),
                        None => {
                            // Dropped without `deregister`.
                            debug!(%id, signature = %event.signature(), "pruning dead consumer");
                            self.deregister(id);
                        }
                    }
                });
                if let Err(e) = result {
                    debug!(thread = %self.thread_id(), error = %e, "event dropped");
                }
            }
            WorkItem::Runnable(runnable) => runnable.run(),
            WorkItem::Callable(callable) => callable.call(),
        }
    }

    pub(crate) fn create_components(&self, factories: &[ComponentFactory]) {
        for factory in factories {
            let component = factory(self);
            debug!(thread = %self.thread_id(), component = component.name(), "component created");
            self.inner.components.borrow_mut().push(component);
        }
    }

    /// Snapshot of this thread's components in creation order.
    pub(crate) fn components(&self) -> Vec<Rc<dyn Component>> {
        self.inner.components.borrow().clone()
    }

    pub(crate) fn destroy_components(&self) {
        let components = std::mem::take(&mut *self.inner.components.borrow_mut());
        for component in components.into_iter().rev() {
            debug!(thread = %self.thread_id(), component = component.name(), "component destroyed");
            drop(component);
        }
    }
}
