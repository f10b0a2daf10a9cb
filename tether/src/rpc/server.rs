//! Server-side service endpoint.
//!
//! ```text
//!   proxy ──request──▶ Server ──on_request──▶ Service
//!     ▲                  │  ▲                    │
//!     └──response/busy───┘  └──────response──────┘
//! ```
//!
//! Each method with a response is gated: while a request is being served,
//! further requests of the same method are refused with a busy reply. The
//! service can reopen the gate early with [`Server::unblock_request`] and
//! answer the parked request later via [`Server::prepare_response`].

use std::any::Any;
use std::cell::RefCell;
use std::collections::BTreeSet;
use std::rc::{Rc, Weak};
use std::sync::Arc;

use super::{
    Admission, NotificationTable, RequestGate, RpcError, STATUS_TAG, ServiceContract, ServiceKey,
    ServiceStatus, StatusFor, rpc_signature,
};
use crate::dispatch::{Event, Interaction, Payload, Route, Signature};
use crate::runtime::{Consumer, Dispatcher};
use crate::trace::{debug, trace, warn};
use crate::types::{Address, ConsumerId, Context, ProcessId, SeqId, ServiceId};

/// Implementation behind a [`Server`].
pub trait Service {
    /// Handles a request. `seq` is the server-side sequence id, or
    /// [`SeqId::INVALID`] for methods without a response.
    fn on_request(&self, server: &Server, method: &str, seq: SeqId, request: &Event);

    fn on_connection(&self, _proxy: Address, _connected: bool) {}
}

#[derive(Default)]
struct State {
    service: Option<Weak<dyn Service>>,
    gate: RequestGate,
    notifications: NotificationTable,
    proxies: BTreeSet<Address>,
    processing: Option<String>,
}

pub struct Server {
    consumer: ConsumerId,
    service: ServiceId,
    key: ServiceKey,
    contract: Arc<ServiceContract>,
    dispatcher: Dispatcher,
    state: RefCell<State>,
}

impl Server {
    /// Creates the server of `role` for `contract` on the current loop.
    ///
    /// # Errors
    ///
    /// [`RpcError::Registry`] if this role already has a server.
    pub fn new(
        dispatcher: &Dispatcher,
        contract: &Arc<ServiceContract>,
        role: &str,
    ) -> Result<Rc<Self>, RpcError> {
        let runtime = dispatcher.runtime();
        contract.register_codecs(runtime.codecs());
        let service = runtime.next_service_id();
        let server = dispatcher.register(|consumer| Self {
            consumer,
            service,
            key: ServiceKey::new(contract.interface(), role),
            contract: Arc::clone(contract),
            dispatcher: dispatcher.clone(),
            state: RefCell::new(State::default()),
        });

        for method in contract.methods() {
            dispatcher.subscribe(server.inbound(method.name(), Interaction::Request), server.consumer);
        }
        for attribute in contract.attributes() {
            dispatcher.subscribe(
                server.inbound(attribute.name(), Interaction::Subscribe),
                server.consumer,
            );
            dispatcher.subscribe(
                server.inbound(attribute.name(), Interaction::Unsubscribe),
                server.consumer,
            );
        }
        dispatcher.subscribe(StatusFor::Server.signature(service), server.consumer);

        // On failure dropping `server` deregisters it again.
        runtime.attach_server(&server.key, server.address())?;
        debug!(key = %server.key, address = %server.address(), "server created");
        Ok(server)
    }

    /// Attaches the implementation. Requests arriving before this are
    /// dropped.
    pub fn bind<S: Service + 'static>(&self, service: &Rc<S>) {
        let weak: Weak<dyn Service> = Rc::downgrade(service) as Weak<dyn Service>;
        self.state.borrow_mut().service = Some(weak);
    }

    #[must_use]
    pub fn address(&self) -> Address {
        Address::new(self.dispatcher.context(), self.service)
    }

    #[must_use]
    pub fn key(&self) -> &ServiceKey {
        &self.key
    }

    /// Connected proxies.
    #[must_use]
    pub fn proxies(&self) -> Vec<Address> {
        self.state.borrow().proxies.iter().copied().collect()
    }

    /// Reopens the gate of the method being handled without answering.
    /// Returns the parked request's sequence id, to be passed to
    /// [`Server::prepare_response`] later.
    pub fn unblock_request(&self) -> Option<SeqId> {
        let mut state = self.state.borrow_mut();
        let method = state.processing.clone()?;
        let seq = state.gate.unblock(&method);
        trace!(key = %self.key, method, ?seq, "request unblocked");
        seq
    }

    /// Selects the pending request of `method` the next
    /// [`Server::response`] answers.
    pub fn prepare_response(&self, method: &str, seq: SeqId) -> bool {
        self.state.borrow_mut().gate.prepare(method, seq)
    }

    /// Sequence id of the request of `method` being processed.
    #[must_use]
    pub fn current_request(&self, method: &str) -> Option<SeqId> {
        self.state.borrow().gate.current(method)
    }

    /// Answers the pending request of `method` and reopens its gate.
    ///
    /// # Errors
    ///
    /// [`RpcError::NoPendingRequest`] if nothing of `method` awaits an
    /// answer, or the send failure.
    pub fn response<T: Any + Send + Sync>(&self, method: &str, value: T) -> Result<(), RpcError> {
        let has_response = self
            .contract
            .method_spec(method)
            .ok_or_else(|| RpcError::UnknownMethod(method.to_owned()))?
            .has_response();
        if !has_response {
            return Err(RpcError::NoPendingRequest(method.to_owned()));
        }
        let record = self
            .state
            .borrow_mut()
            .gate
            .complete(method)
            .ok_or_else(|| RpcError::NoPendingRequest(method.to_owned()))?;
        let signature = rpc_signature(
            self.contract.method_tag(),
            method,
            &self.key.role,
            Interaction::Response,
            self.service,
            record.client.service,
            record.client_seq,
        );
        trace!(key = %self.key, method, client = %record.client, seq = %record.client_seq, "response");
        self.dispatcher
            .send_event(Event::new(signature).with_payload(value), record.client.context)
            .map_err(RpcError::from)
    }

    /// Publishes a new value of `attribute` to every subscriber. The value is
    /// kept and replayed to later subscribers.
    ///
    /// # Errors
    ///
    /// [`RpcError::UnknownAttribute`] if the contract lacks `attribute`.
    pub fn notify<T: Any + Send + Sync>(&self, attribute: &str, value: T) -> Result<(), RpcError> {
        if self.contract.attribute_spec(attribute).is_none() {
            return Err(RpcError::UnknownAttribute(attribute.to_owned()));
        }
        let value: Payload = Arc::new(value);
        let subscribers = self
            .state
            .borrow_mut()
            .notifications
            .notify(attribute, Arc::clone(&value));
        trace!(key = %self.key, attribute, subscribers = subscribers.len(), "notify");
        for subscriber in subscribers {
            self.send_notification(attribute, &value, subscriber);
        }
        Ok(())
    }

    /// Last value published for `attribute`.
    #[must_use]
    pub fn value(&self, attribute: &str) -> Option<Payload> {
        self.state.borrow().notifications.value(attribute).cloned()
    }

    /// Number of proxies subscribed to `attribute`.
    #[must_use]
    pub fn subscribers(&self, attribute: &str) -> usize {
        self.state.borrow().notifications.subscribers(attribute)
    }

    fn inbound(&self, name: &str, interaction: Interaction) -> Signature {
        let tag = match interaction {
            Interaction::Request => self.contract.method_tag(),
            _ => self.contract.attribute_tag(),
        };
        rpc_signature(
            tag,
            name,
            &self.key.role,
            interaction,
            ServiceId::INVALID,
            self.service,
            SeqId::INVALID,
        )
    }

    /// Where replies to `event` go. Local senders are addressed by thread
    /// alone so the reply stays in process.
    fn client_address(&self, event: &Event, route: &Route) -> Address {
        let origin = event.origin();
        let pid = if self.dispatcher.runtime().is_external(origin) {
            origin.pid
        } else {
            ProcessId::LOCAL
        };
        Address::new(Context::new(origin.tid, pid), route.from)
    }

    fn send_notification(&self, attribute: &str, value: &Payload, subscriber: Address) {
        let signature = rpc_signature(
            self.contract.attribute_tag(),
            attribute,
            &self.key.role,
            Interaction::Notification,
            self.service,
            subscriber.service,
            SeqId::INVALID,
        );
        let event = Event::new(signature).with_shared_payload(Arc::clone(value));
        if let Err(e) = self.dispatcher.send_event(event, subscriber.context) {
            warn!(key = %self.key, attribute, %subscriber, error = %e, "notification not delivered");
        }
    }

    fn service(&self) -> Option<Rc<dyn Service>> {
        self.state.borrow().service.as_ref().and_then(Weak::upgrade)
    }

    fn on_request(&self, event: &Event, route: &Route) {
        let method = event.signature().id();
        let Some(spec) = self.contract.method_spec(method) else {
            warn!(key = %self.key, method, "request for unknown method");
            return;
        };
        let client = self.client_address(event, route);
        let seq = if spec.has_response() {
            let admission = self.state.borrow_mut().gate.admit(method, route.seq, client);
            match admission {
                Admission::Accepted(seq) => seq,
                Admission::Busy => {
                    debug!(key = %self.key, method, %client, "busy");
                    self.reply_busy(method, route, client);
                    return;
                }
            }
        } else {
            SeqId::INVALID
        };

        let Some(service) = self.service() else {
            warn!(key = %self.key, method, "no service bound, request dropped");
            self.state.borrow_mut().gate.complete(method);
            return;
        };
        self.state.borrow_mut().processing = Some(method.to_owned());
        service.on_request(self, method, seq, event);
        self.state.borrow_mut().processing = None;
    }

    fn reply_busy(&self, method: &str, route: &Route, client: Address) {
        let signature = rpc_signature(
            self.contract.method_tag(),
            method,
            &self.key.role,
            Interaction::Busy,
            self.service,
            route.from,
            route.seq,
        );
        if let Err(e) = self.dispatcher.send_event(Event::new(signature), client.context) {
            warn!(key = %self.key, method, %client, error = %e, "busy reply not delivered");
        }
    }

    fn on_subscription(&self, event: &Event, route: &Route) {
        let attribute = event.signature().id();
        let client = self.client_address(event, route);
        if route.interaction == Interaction::Subscribe {
            let replay = self
                .state
                .borrow_mut()
                .notifications
                .add_subscriber(attribute, client);
            trace!(key = %self.key, attribute, %client, "subscribed");
            if let Some(value) = replay {
                self.send_notification(attribute, &value, client);
            }
        } else {
            self.state
                .borrow_mut()
                .notifications
                .remove_subscriber(attribute, client);
            trace!(key = %self.key, attribute, %client, "unsubscribed");
        }
    }

    fn on_status(&self, status: ServiceStatus) {
        {
            let mut state = self.state.borrow_mut();
            if status.connected {
                state.proxies.insert(status.peer);
            } else {
                state.proxies.remove(&status.peer);
                state.gate.drop_client(status.peer);
                state.notifications.remove_address(status.peer);
            }
        }
        debug!(key = %self.key, proxy = %status.peer, connected = status.connected, "proxy status");
        if let Some(service) = self.service() {
            service.on_connection(status.peer, status.connected);
        }
    }
}

impl Consumer for Server {
    fn process(&self, event: &Event) {
        let signature = event.signature();
        let Some(route) = signature.route() else {
            return;
        };
        let tag = signature.type_tag();
        if tag == STATUS_TAG {
            match event.data::<ServiceStatus>() {
                Some(status) => self.on_status(*status),
                None => warn!(key = %self.key, "status event without payload"),
            }
        } else if tag == self.contract.method_tag() && route.interaction == Interaction::Request {
            self.on_request(event, route);
        } else if tag == self.contract.attribute_tag()
            && matches!(route.interaction, Interaction::Subscribe | Interaction::Unsubscribe)
        {
            self.on_subscription(event, route);
        } else {
            warn!(key = %self.key, %signature, "unexpected event");
        }
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        self.dispatcher
            .runtime()
            .detach_server(&self.key, self.address());
        self.dispatcher.deregister(self.consumer);
    }
}
