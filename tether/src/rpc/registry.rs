//! Server/proxy pairing.
//!
//! One server per `(interface, role)`; any number of proxies. The table is
//! pure bookkeeping: each call returns who must be told about the change and
//! the runtime helpers below send the status events.

use std::collections::{BTreeSet, HashMap};

use super::{ServiceKey, ServiceStatus, StatusFor};
use crate::dispatch::Event;
use crate::runtime::Runtime;
use crate::trace::{debug, info, warn};
use crate::types::{Address, ProcessId};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RegistryError {
    #[error("{key} already has server {existing}")]
    DuplicateServer { key: ServiceKey, existing: Address },
}

#[derive(Default)]
struct Pairing {
    server: Option<Address>,
    proxies: BTreeSet<Address>,
}

#[derive(Default)]
pub struct ServiceRegistry {
    services: HashMap<ServiceKey, Pairing>,
}

impl ServiceRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers the server of `key`. Returns the proxies waiting for it.
    ///
    /// # Errors
    ///
    /// [`RegistryError::DuplicateServer`] if `key` already has a server.
    pub fn register_server(
        &mut self,
        key: &ServiceKey,
        server: Address,
    ) -> Result<Vec<Address>, RegistryError> {
        let pairing = self.services.entry(key.clone()).or_default();
        if let Some(existing) = pairing.server {
            return Err(RegistryError::DuplicateServer {
                key: key.clone(),
                existing,
            });
        }
        pairing.server = Some(server);
        Ok(pairing.proxies.iter().copied().collect())
    }

    /// Removes the server of `key` if it is `server`. Returns its proxies.
    pub fn unregister_server(&mut self, key: &ServiceKey, server: Address) -> Vec<Address> {
        let Some(pairing) = self.services.get_mut(key) else {
            return Vec::new();
        };
        if pairing.server != Some(server) {
            return Vec::new();
        }
        pairing.server = None;
        let proxies = pairing.proxies.iter().copied().collect();
        if pairing.proxies.is_empty() {
            self.services.remove(key);
        }
        proxies
    }

    /// Registers a proxy. Returns the server if one is known.
    pub fn register_proxy(&mut self, key: &ServiceKey, proxy: Address) -> Option<Address> {
        let pairing = self.services.entry(key.clone()).or_default();
        pairing.proxies.insert(proxy);
        pairing.server
    }

    /// Removes a proxy. Returns the server it was paired with.
    pub fn unregister_proxy(&mut self, key: &ServiceKey, proxy: Address) -> Option<Address> {
        let pairing = self.services.get_mut(key)?;
        if !pairing.proxies.remove(&proxy) {
            return None;
        }
        let server = pairing.server;
        if server.is_none() && pairing.proxies.is_empty() {
            self.services.remove(key);
        }
        server
    }

    #[must_use]
    pub fn server(&self, key: &ServiceKey) -> Option<Address> {
        self.services.get(key).and_then(|p| p.server)
    }

    #[must_use]
    pub fn proxies(&self, key: &ServiceKey) -> usize {
        self.services.get(key).map_or(0, |p| p.proxies.len())
    }
}

impl Runtime {
    /// Declares that the server of `(interface, role)` lives at `server` in
    /// another process. Local proxies are told it is connected.
    ///
    /// # Errors
    ///
    /// [`RegistryError::DuplicateServer`] if a server is already known.
    pub fn connect_remote(
        &self,
        interface: &str,
        role: &str,
        server: Address,
    ) -> Result<(), RegistryError> {
        info!(interface, role, %server, "remote server declared");
        self.attach_server(&ServiceKey::new(interface, role), server)
    }

    /// Withdraws a server declared with [`Runtime::connect_remote`].
    pub fn disconnect_remote(&self, interface: &str, role: &str, server: Address) {
        info!(interface, role, %server, "remote server withdrawn");
        self.detach_server(&ServiceKey::new(interface, role), server);
    }

    pub(crate) fn attach_server(
        &self,
        key: &ServiceKey,
        server: Address,
    ) -> Result<(), RegistryError> {
        let proxies = self.services().register_server(key, server)?;
        debug!(%key, %server, proxies = proxies.len(), "server attached");
        for proxy in proxies {
            self.send_status(StatusFor::Proxy, proxy, server, true);
            self.send_status(StatusFor::Server, server, proxy, true);
        }
        Ok(())
    }

    pub(crate) fn detach_server(&self, key: &ServiceKey, server: Address) {
        let proxies = self.services().unregister_server(key, server);
        debug!(%key, %server, proxies = proxies.len(), "server detached");
        for proxy in proxies {
            self.send_status(StatusFor::Proxy, proxy, server, false);
        }
    }

    pub(crate) fn attach_proxy(&self, key: &ServiceKey, proxy: Address) {
        let server = self.services().register_proxy(key, proxy);
        debug!(%key, %proxy, "proxy attached");
        if let Some(server) = server {
            self.send_status(StatusFor::Server, server, proxy, true);
            self.send_status(StatusFor::Proxy, proxy, server, true);
        }
    }

    pub(crate) fn detach_proxy(&self, key: &ServiceKey, proxy: Address) {
        let server = self.services().unregister_proxy(key, proxy);
        debug!(%key, %proxy, "proxy detached");
        if let Some(server) = server {
            self.send_status(StatusFor::Server, server, proxy, false);
        }
    }

    fn send_status(&self, target: StatusFor, recipient: Address, peer: Address, connected: bool) {
        let mut peer = peer;
        if self.is_external(recipient.context) && peer.context.pid == ProcessId::LOCAL {
            peer.context.pid = self.process_id();
        }
        let event = Event::new(target.signature(recipient.service))
            .with_payload(ServiceStatus { peer, connected });
        if let Err(e) = self.send(event, recipient.context) {
            warn!(%recipient, %peer, connected, error = %e, "status not delivered");
        }
    }
}
