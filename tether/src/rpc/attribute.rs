//! Attribute subscription state.
//!
//! [`AttributeSubscriptions`] is the proxy's view: which local clients want
//! which attribute, plus the last value received so late subscribers get it
//! at once. [`NotificationTable`] is the server's view: subscriber addresses
//! and the last published value per attribute.

use std::collections::{BTreeSet, HashMap};

use crate::dispatch::Payload;
use crate::types::{Address, ClientId};

#[derive(Default)]
struct ClientInterest {
    clients: BTreeSet<ClientId>,
    cached: Option<Payload>,
}

/// Result of [`AttributeSubscriptions::add`].
pub struct AddOutcome {
    /// The attribute had no local subscriber before.
    pub first: bool,
    /// The client was not already subscribed.
    pub added: bool,
    /// Cached value to replay to the new subscriber.
    pub replay: Option<Payload>,
}

/// Proxy-side subscriptions and value cache.
#[derive(Default)]
pub struct AttributeSubscriptions {
    attributes: HashMap<String, ClientInterest>,
}

impl AttributeSubscriptions {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, attribute: &str, client: ClientId) -> AddOutcome {
        let interest = self.attributes.entry(attribute.to_owned()).or_default();
        let first = interest.clients.is_empty();
        let added = interest.clients.insert(client);
        AddOutcome {
            first,
            added,
            replay: if added { interest.cached.clone() } else { None },
        }
    }

    /// Removes `client`. Returns `true` if it was the last subscriber, in
    /// which case the cached value is dropped too.
    pub fn remove(&mut self, attribute: &str, client: ClientId) -> bool {
        let Some(interest) = self.attributes.get_mut(attribute) else {
            return false;
        };
        if !interest.clients.remove(&client) || !interest.clients.is_empty() {
            return false;
        }
        self.attributes.remove(attribute);
        true
    }

    /// Caches `value` and returns the clients to notify. Values for
    /// attributes nobody subscribed to are ignored.
    pub fn store(&mut self, attribute: &str, value: Payload) -> Vec<ClientId> {
        match self.attributes.get_mut(attribute) {
            Some(interest) => {
                interest.cached = Some(value);
                interest.clients.iter().copied().collect()
            }
            None => Vec::new(),
        }
    }

    #[must_use]
    pub fn contains(&self, attribute: &str, client: ClientId) -> bool {
        self.attributes
            .get(attribute)
            .is_some_and(|i| i.clients.contains(&client))
    }

    #[must_use]
    pub fn cached(&self, attribute: &str) -> Option<&Payload> {
        self.attributes.get(attribute).and_then(|i| i.cached.as_ref())
    }

    /// Attributes with at least one subscriber.
    #[must_use]
    pub fn active(&self) -> Vec<String> {
        self.attributes.keys().cloned().collect()
    }

    /// Removes `client` everywhere. Returns the attributes left without
    /// subscribers.
    pub fn remove_client(&mut self, client: ClientId) -> Vec<String> {
        let mut emptied = Vec::new();
        self.attributes.retain(|attribute, interest| {
            if interest.clients.remove(&client) && interest.clients.is_empty() {
                emptied.push(attribute.clone());
                return false;
            }
            true
        });
        emptied
    }

    /// Forgets every subscriber and cached value.
    pub fn reset(&mut self) {
        self.attributes.clear();
    }
}

#[derive(Default)]
struct Notification {
    subscribers: BTreeSet<Address>,
    value: Option<Payload>,
}

/// Server-side subscriber sets and last published values.
#[derive(Default)]
pub struct NotificationTable {
    attributes: HashMap<String, Notification>,
}

impl NotificationTable {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Stores `value` and returns the subscribers to notify.
    pub fn notify(&mut self, attribute: &str, value: Payload) -> Vec<Address> {
        let notification = self.attributes.entry(attribute.to_owned()).or_default();
        notification.value = Some(value);
        notification.subscribers.iter().copied().collect()
    }

    /// Adds a subscriber. Returns the value to replay if it was newly added
    /// and something was published before.
    pub fn add_subscriber(&mut self, attribute: &str, subscriber: Address) -> Option<Payload> {
        let notification = self.attributes.entry(attribute.to_owned()).or_default();
        if notification.subscribers.insert(subscriber) {
            notification.value.clone()
        } else {
            None
        }
    }

    pub fn remove_subscriber(&mut self, attribute: &str, subscriber: Address) -> bool {
        self.attributes
            .get_mut(attribute)
            .is_some_and(|n| n.subscribers.remove(&subscriber))
    }

    /// Removes `subscriber` from every attribute.
    pub fn remove_address(&mut self, subscriber: Address) {
        for notification in self.attributes.values_mut() {
            notification.subscribers.remove(&subscriber);
        }
    }

    #[must_use]
    pub fn value(&self, attribute: &str) -> Option<&Payload> {
        self.attributes.get(attribute).and_then(|n| n.value.as_ref())
    }

    #[must_use]
    pub fn subscribers(&self, attribute: &str) -> usize {
        self.attributes.get(attribute).map_or(0, |n| n.subscribers.len())
    }
}
