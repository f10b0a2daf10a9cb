//! Client-side service endpoint.
//!
//! A [`Proxy`] lives on one dispatch loop and serves any number of local
//! [`Client`]s. It correlates responses back to the client that issued each
//! request, keeps one remote subscription per attribute however many clients
//! want it, and caches the last notification for late subscribers.
//!
//! Connection changes arrive as status events from the service registry.
//! Both connect and disconnect drop every outstanding request and
//! subscription; clients learn about it through [`Client::on_connection`]
//! and subscribe again once connected.

use std::any::Any;
use std::cell::RefCell;
use std::collections::BTreeMap;
use std::rc::{Rc, Weak};
use std::sync::Arc;

use super::{
    AttributeSubscriptions, MethodCorrelator, RpcError, STATUS_TAG, ServiceContract, ServiceKey,
    ServiceStatus, StatusFor, rpc_signature,
};
use crate::dispatch::{Event, Interaction, Payload, Route, Signature};
use crate::runtime::{Consumer, Dispatcher};
use crate::trace::{debug, trace, warn};
use crate::types::{Address, ClientId, ConsumerId, SeqId, ServiceId};

/// Receives the outcome of requests and subscriptions made via a [`Proxy`].
pub trait Client {
    fn on_connection(&self, _connected: bool) {}

    /// Response to the request `seq` returned by [`Proxy::request`].
    fn on_response(&self, _method: &str, _seq: SeqId, _payload: Option<&Payload>) {}

    /// The server was still serving another request of `method`.
    fn on_busy(&self, _method: &str, _seq: SeqId) {}

    fn on_notification(&self, _attribute: &str, _value: &Payload) {}
}

struct State {
    server: Option<Address>,
    clients: BTreeMap<ClientId, Weak<dyn Client>>,
    next_client: u64,
    methods: MethodCorrelator,
    attributes: AttributeSubscriptions,
}

pub struct Proxy {
    consumer: ConsumerId,
    service: ServiceId,
    key: ServiceKey,
    contract: Arc<ServiceContract>,
    dispatcher: Dispatcher,
    state: RefCell<State>,
}

impl Proxy {
    /// Creates a proxy for `role` of `contract` on the current loop and
    /// announces it to the service registry.
    pub fn new(dispatcher: &Dispatcher, contract: &Arc<ServiceContract>, role: &str) -> Rc<Self> {
        let runtime = dispatcher.runtime();
        contract.register_codecs(runtime.codecs());
        let service = runtime.next_service_id();
        let proxy = dispatcher.register(|consumer| Self {
            consumer,
            service,
            key: ServiceKey::new(contract.interface(), role),
            contract: Arc::clone(contract),
            dispatcher: dispatcher.clone(),
            state: RefCell::new(State {
                server: None,
                clients: BTreeMap::new(),
                next_client: 0,
                methods: MethodCorrelator::new(),
                attributes: AttributeSubscriptions::new(),
            }),
        });
        dispatcher.subscribe(StatusFor::Proxy.signature(service), proxy.consumer);
        runtime.attach_proxy(&proxy.key, proxy.address());
        debug!(key = %proxy.key, address = %proxy.address(), "proxy created");
        proxy
    }

    #[must_use]
    pub fn address(&self) -> Address {
        Address::new(self.dispatcher.context(), self.service)
    }

    #[must_use]
    pub fn key(&self) -> &ServiceKey {
        &self.key
    }

    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.state.borrow().server.is_some()
    }

    #[must_use]
    pub fn server(&self) -> Option<Address> {
        self.state.borrow().server
    }

    /// Adds a client. If the proxy is already connected the client's
    /// [`Client::on_connection`] runs before this returns.
    pub fn register_client<C: Client + 'static>(&self, client: &Rc<C>) -> ClientId {
        let (id, connected) = {
            let mut state = self.state.borrow_mut();
            let id = ClientId(state.next_client);
            state.next_client += 1;
            let weak: Weak<dyn Client> = Rc::downgrade(client) as Weak<dyn Client>;
            state.clients.insert(id, weak);
            (id, state.server.is_some())
        };
        trace!(key = %self.key, client = %id, "client registered");
        if connected {
            client.on_connection(true);
        }
        id
    }

    /// Removes a client with its outstanding requests and subscriptions.
    pub fn unregister_client(&self, client: ClientId) {
        let (methods, attributes, server) = {
            let mut state = self.state.borrow_mut();
            state.clients.remove(&client);
            (
                state.methods.forget_client(client),
                state.attributes.remove_client(client),
                state.server,
            )
        };
        for method in methods {
            self.unsubscribe_replies(&method);
        }
        for attribute in attributes {
            self.drop_attribute(&attribute, server);
        }
        trace!(key = %self.key, %client, "client unregistered");
    }

    /// Sends a request on behalf of `client`.
    ///
    /// Methods with a response are answered through [`Client::on_response`]
    /// or [`Client::on_busy`] with the returned sequence id.
    ///
    /// # Errors
    ///
    /// Fails for an unknown method, while disconnected, or if the request
    /// cannot be sent.
    pub fn request<T: Any + Send + Sync>(
        &self,
        client: ClientId,
        method: &str,
        args: T,
    ) -> Result<SeqId, RpcError> {
        let spec = self
            .contract
            .method_spec(method)
            .ok_or_else(|| RpcError::UnknownMethod(method.to_owned()))?;
        let has_response = spec.has_response();
        let (server, seq, first) = {
            let mut state = self.state.borrow_mut();
            let Some(server) = state.server else {
                warn!(key = %self.key, method, "request while disconnected");
                return Err(RpcError::NotConnected);
            };
            let (seq, first) = state.methods.begin(method, has_response, client);
            (server, seq, first)
        };
        if first {
            self.dispatcher
                .subscribe(self.reply_signature(method, Interaction::Response), self.consumer);
            self.dispatcher
                .subscribe(self.reply_signature(method, Interaction::Busy), self.consumer);
        }

        let signature = rpc_signature(
            self.contract.method_tag(),
            method,
            &self.key.role,
            Interaction::Request,
            self.service,
            server.service,
            seq,
        );
        let event = Event::new(signature).with_payload(args);
        if let Err(e) = self.dispatcher.send_event(event, server.context) {
            warn!(key = %self.key, method, error = %e, "request not sent");
            if has_response {
                let resolved = self.state.borrow_mut().methods.resolve(method, seq);
                if let Some((_, true)) = resolved {
                    self.unsubscribe_replies(method);
                }
            }
            return Err(e.into());
        }
        trace!(key = %self.key, method, %seq, "request sent");
        Ok(seq)
    }

    /// Subscribes `client` to `attribute`.
    ///
    /// The server is contacted only for the first local subscriber. A value
    /// cached from an earlier notification is replayed to the new client.
    ///
    /// # Errors
    ///
    /// Fails for an unknown attribute, while disconnected, or if the
    /// subscription cannot be sent.
    pub fn subscribe(&self, client: ClientId, attribute: &str) -> Result<(), RpcError> {
        if self.contract.attribute_spec(attribute).is_none() {
            return Err(RpcError::UnknownAttribute(attribute.to_owned()));
        }
        let (server, outcome) = {
            let mut state = self.state.borrow_mut();
            let Some(server) = state.server else {
                warn!(key = %self.key, attribute, "subscribe while disconnected");
                return Err(RpcError::NotConnected);
            };
            (server, state.attributes.add(attribute, client))
        };

        if outcome.first {
            self.dispatcher
                .subscribe(self.notification_signature(attribute), self.consumer);
            if let Err(e) = self.send_to_server(attribute, Interaction::Subscribe, server) {
                self.state.borrow_mut().attributes.remove(attribute, client);
                self.dispatcher
                    .unsubscribe(&self.notification_signature(attribute), self.consumer);
                return Err(e);
            }
        }

        if let Some(value) = outcome.replay {
            // Delivered through the inbox like any notification, but only
            // to this client.
            let signature = rpc_signature(
                self.contract.attribute_tag(),
                attribute,
                &self.key.role,
                Interaction::Notification,
                ServiceId::LOCAL,
                self.service,
                SeqId(client.0),
            );
            let event = Event::new(signature).with_shared_payload(value);
            if let Err(e) = self.dispatcher.send_event(event, self.dispatcher.context()) {
                warn!(key = %self.key, attribute, error = %e, "cached value not replayed");
            }
        }
        Ok(())
    }

    /// Unsubscribes `client`. The server is told when the last local
    /// subscriber leaves, and the cached value is dropped.
    ///
    /// # Errors
    ///
    /// Fails for an unknown attribute.
    pub fn unsubscribe(&self, client: ClientId, attribute: &str) -> Result<(), RpcError> {
        if self.contract.attribute_spec(attribute).is_none() {
            return Err(RpcError::UnknownAttribute(attribute.to_owned()));
        }
        let (last, server) = {
            let mut state = self.state.borrow_mut();
            (state.attributes.remove(attribute, client), state.server)
        };
        if last {
            self.drop_attribute(attribute, server);
        }
        Ok(())
    }

    /// Outstanding requests of `method`.
    #[must_use]
    pub fn outstanding(&self, method: &str) -> usize {
        self.state.borrow().methods.outstanding(method)
    }

    fn drop_attribute(&self, attribute: &str, server: Option<Address>) {
        self.dispatcher
            .unsubscribe(&self.notification_signature(attribute), self.consumer);
        if let Some(server) = server {
            if let Err(e) = self.send_to_server(attribute, Interaction::Unsubscribe, server) {
                debug!(key = %self.key, attribute, error = %e, "unsubscribe not sent");
            }
        }
    }

    fn send_to_server(
        &self,
        attribute: &str,
        interaction: Interaction,
        server: Address,
    ) -> Result<(), RpcError> {
        let signature = rpc_signature(
            self.contract.attribute_tag(),
            attribute,
            &self.key.role,
            interaction,
            self.service,
            server.service,
            SeqId::INVALID,
        );
        self.dispatcher
            .send_event(Event::new(signature), server.context)
            .map_err(RpcError::from)
    }

    fn reply_signature(&self, method: &str, interaction: Interaction) -> Signature {
        rpc_signature(
            self.contract.method_tag(),
            method,
            &self.key.role,
            interaction,
            ServiceId::INVALID,
            self.service,
            SeqId::INVALID,
        )
    }

    fn notification_signature(&self, attribute: &str) -> Signature {
        rpc_signature(
            self.contract.attribute_tag(),
            attribute,
            &self.key.role,
            Interaction::Notification,
            ServiceId::INVALID,
            self.service,
            SeqId::INVALID,
        )
    }

    fn unsubscribe_replies(&self, method: &str) {
        self.dispatcher
            .unsubscribe(&self.reply_signature(method, Interaction::Response), self.consumer);
        self.dispatcher
            .unsubscribe(&self.reply_signature(method, Interaction::Busy), self.consumer);
    }

    fn client(&self, id: ClientId) -> Option<Rc<dyn Client>> {
        self.state.borrow().clients.get(&id).and_then(Weak::upgrade)
    }

    fn clients(&self) -> Vec<Rc<dyn Client>> {
        self.state
            .borrow()
            .clients
            .values()
            .filter_map(Weak::upgrade)
            .collect()
    }

    fn on_status(&self, status: ServiceStatus) {
        let server = status.connected.then_some(status.peer);
        {
            let mut state = self.state.borrow_mut();
            if state.server == server {
                return;
            }
            state.server = server;
            state.methods.reset();
            state.attributes.reset();
        }
        self.dispatcher
            .unsubscribe_all(self.contract.method_tag(), self.consumer);
        self.dispatcher
            .unsubscribe_all(self.contract.attribute_tag(), self.consumer);
        debug!(key = %self.key, server = %status.peer, connected = status.connected, "server status");
        for client in self.clients() {
            client.on_connection(status.connected);
        }
    }

    fn on_reply(&self, event: &Event, route: &Route) {
        let method = event.signature().id();
        // Removed before the callback so a request issued from inside it is
        // tracked as a new record.
        let resolved = self.state.borrow_mut().methods.resolve(method, route.seq);
        let Some((id, last)) = resolved else {
            warn!(key = %self.key, method, seq = %route.seq, "reply for unknown request");
            return;
        };
        if last {
            self.unsubscribe_replies(method);
        }
        let Some(client) = self.client(id) else {
            debug!(key = %self.key, method, client = %id, "reply for a dropped client");
            return;
        };
        match route.interaction {
            Interaction::Response => client.on_response(method, route.seq, event.payload()),
            _ => client.on_busy(method, route.seq),
        }
    }

    fn on_notification(&self, event: &Event, route: &Route) {
        let attribute = event.signature().id();
        let Some(value) = event.payload() else {
            warn!(key = %self.key, attribute, "notification without value");
            return;
        };
        if route.from == ServiceId::LOCAL {
            let id = ClientId(route.seq.0);
            if !self.state.borrow().attributes.contains(attribute, id) {
                return;
            }
            if let Some(client) = self.client(id) {
                client.on_notification(attribute, value);
            }
            return;
        }
        let ids = self
            .state
            .borrow_mut()
            .attributes
            .store(attribute, Arc::clone(value));
        for id in ids {
            if let Some(client) = self.client(id) {
                client.on_notification(attribute, value);
            }
        }
    }
}

impl Consumer for Proxy {
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
        } else if tag == self.contract.method_tag() {
            match route.interaction {
                Interaction::Response | Interaction::Busy => self.on_reply(event, route),
                other => warn!(key = %self.key, interaction = %other, "unexpected method event"),
            }
        } else if tag == self.contract.attribute_tag() && route.interaction == Interaction::Notification {
            self.on_notification(event, route);
        } else {
            warn!(key = %self.key, %signature, "unexpected event");
        }
    }
}

impl Drop for Proxy {
    fn drop(&mut self) {
        let (attributes, server) = {
            let state = self.state.borrow();
            (state.attributes.active(), state.server)
        };
        if let Some(server) = server {
            for attribute in attributes {
                if let Err(e) = self.send_to_server(&attribute, Interaction::Unsubscribe, server) {
                    debug!(key = %self.key, %attribute, error = %e, "unsubscribe on drop not sent");
                }
            }
        }
        self.dispatcher
            .runtime()
            .detach_proxy(&self.key, self.address());
        self.dispatcher.deregister(self.consumer);
    }
}
