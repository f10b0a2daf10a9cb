//! Components and the built-in system consumer.
//!
//! Every loop installs a [`SystemConsumer`] before running its component
//! factories. It reacts to three system events:
//!
//! | id         | effect                                                         |
//! |------------|----------------------------------------------------------------|
//! | `boot`     | [`Component::boot`] on every root component of the thread     |
//! | `shutdown` | [`Component::shutdown`] on every component, each with a blocker |
//! | `ping`     | logged                                                         |
//!
//! The thread stops once every [`ShutdownBlocker`] clone has been dropped.

use std::rc::Rc;
use std::sync::Arc;

use super::dispatch_loop::DispatchLoop;
use super::dispatcher::{Consumer, Dispatcher};
use crate::dispatch::{Event, Signature};
use crate::trace::{info, warn};
use crate::types::{ConsumerId, Priority};

pub(crate) const SYSTEM_TAG: &str = "tether::system";

/// A unit of application logic living on one thread.
pub trait Component {
    fn name(&self) -> &str;

    /// Root components receive the boot message.
    fn is_root(&self) -> bool {
        false
    }

    fn boot(&self, _message: &str) {}

    /// Called once on shutdown. The thread keeps running until `blocker`
    /// (and every clone of it) is dropped.
    fn shutdown(&self, _message: &str, _blocker: ShutdownBlocker) {}
}

/// Creates a component on its loop thread.
pub type ComponentFactory = Arc<dyn Fn(&Dispatcher) -> Rc<dyn Component> + Send + Sync>;

/// Keeps a thread alive during shutdown; the last clone to drop stops it.
#[derive(Clone)]
pub struct ShutdownBlocker(Rc<StopOnDrop>);

struct StopOnDrop(Arc<DispatchLoop>);

impl Drop for StopOnDrop {
    fn drop(&mut self) {
        info!(thread = %self.0.id(), "all components released shutdown");
        self.0.stop();
    }
}

/// System event kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum SystemEvent {
    Boot,
    Shutdown,
    Ping,
}

impl SystemEvent {
    const ALL: [Self; 3] = [Self::Boot, Self::Shutdown, Self::Ping];

    const fn id(self) -> &'static str {
        match self {
            Self::Boot => "boot",
            Self::Shutdown => "shutdown",
            Self::Ping => "ping",
        }
    }

    pub(crate) fn signature(self) -> Signature {
        Signature::new(SYSTEM_TAG, self.id())
    }

    pub(crate) fn event(self, message: &str) -> Event {
        Event::new(self.signature())
            .with_payload(message.to_owned())
            .with_priority(Priority::SYSTEM)
    }
}

pub(crate) struct SystemConsumer {
    id: ConsumerId,
    dispatcher: Dispatcher,
}

impl SystemConsumer {
    pub(crate) fn install(dispatcher: &Dispatcher) -> Rc<Self> {
        let consumer = dispatcher.register(|id| Self {
            id,
            dispatcher: dispatcher.clone(),
        });
        for kind in SystemEvent::ALL {
            dispatcher.subscribe(kind.signature(), consumer.id);
        }
        consumer
    }
}

impl Consumer for SystemConsumer {
    fn process(&self, event: &Event) {
        let message = event.data::<String>().map_or("", String::as_str);
        let thread = self.dispatcher.thread_id();
        match event.signature().id() {
            "boot" => {
                info!(%thread, message, "boot");
                for component in self.dispatcher.components() {
                    if component.is_root() {
                        component.boot(message);
                    }
                }
            }
            "shutdown" => {
                info!(%thread, message, "shutdown");
                let blocker = ShutdownBlocker(Rc::new(StopOnDrop(Arc::clone(
                    self.dispatcher.handle(),
                ))));
                for component in self.dispatcher.components() {
                    component.shutdown(message, blocker.clone());
                }
            }
            "ping" => info!(%thread, origin = %event.origin(), message, "ping"),
            other => warn!(%thread, id = other, "unknown system event"),
        }
    }
}

impl Drop for SystemConsumer {
    fn drop(&mut self) {
        self.dispatcher.deregister(self.id);
    }
}
