//! In-process transport
//!
//! Requests are dispatched synchronously on the caller's thread, so a
//! response is available as soon as `request` returns. A handler that answers
//! nothing leaves the request pending and the caller runs into its timeout,
//! exactly as over a socket.

use log::debug;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, Weak};

use super::{EndpointRegistry, Payload, PendingResponse, PendingTable, Transport, TransportFactory};
use crate::domain::{Address, TransportError};
use crate::endpoint::{Endpoint, EndpointIntrospect};

/// Tracks the loopback servers it created so they can be discovered
#[derive(Default)]
pub struct TransportLoopbackFactory {
    next_id: AtomicU64,
    servers: Mutex<Vec<Weak<LoopbackServer>>>,
}

impl TransportLoopbackFactory {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn live_servers(&self) -> Vec<Arc<LoopbackServer>> {
        let mut servers = self.servers.lock().unwrap_or_else(PoisonError::into_inner);
        servers.retain(|s| s.upgrade().is_some_and(|s| s.is_connected()));
        servers.iter().filter_map(Weak::upgrade).collect()
    }
}

impl TransportFactory for TransportLoopbackFactory {
    fn discover(&self) -> Result<Vec<Address>, TransportError> {
        let mut addresses: Vec<Address> = self.live_servers().iter().map(|s| s.address.clone()).collect();
        addresses.sort();
        Ok(addresses)
    }

    fn serve(&self) -> Result<Arc<dyn Transport>, TransportError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let server = Arc::new_cyclic(|weak| LoopbackServer {
            address: Address::new(format!("loopback:{id}")),
            registry: EndpointRegistry::new(),
            clients: Mutex::new(Vec::new()),
            closed: AtomicBool::new(false),
            self_ref: weak.clone(),
        });
        server.add_endpoint(EndpointIntrospect::new());
        self.servers.lock().unwrap_or_else(PoisonError::into_inner).push(Arc::downgrade(&server));
        Ok(server)
    }

    fn connect(&self, address: &Address) -> Result<Arc<dyn Transport>, TransportError> {
        let server = self
            .live_servers()
            .into_iter()
            .find(|s| &s.address == address)
            .ok_or(TransportError::NotConnected)?;

        let client = Arc::new_cyclic(|weak| LoopbackClient {
            server: Arc::downgrade(&server),
            address: address.clone(),
            registry: EndpointRegistry::new(),
            pending: PendingTable::new(),
            closed: AtomicBool::new(false),
            self_ref: weak.clone(),
        });
        server.clients.lock().unwrap_or_else(PoisonError::into_inner).push(Arc::downgrade(&client));
        Ok(client)
    }
}

pub struct LoopbackServer {
    address: Address,
    registry: EndpointRegistry,
    clients: Mutex<Vec<Weak<LoopbackClient>>>,
    closed: AtomicBool,
    self_ref: Weak<LoopbackServer>,
}

impl Transport for LoopbackServer {
    fn request(&self, name: &str, _payload: Payload) -> Result<PendingResponse, TransportError> {
        Err(TransportError::Protocol(format!(
            "serving transport {} cannot issue a request to '{name}'",
            self.address
        )))
    }

    fn broadcast(&self, name: &str, data: &[u8]) {
        let clients: Vec<Arc<LoopbackClient>> = {
            let mut clients = self.clients.lock().unwrap_or_else(PoisonError::into_inner);
            clients.retain(|c| c.upgrade().is_some_and(|c| c.is_connected()));
            clients.iter().filter_map(Weak::upgrade).collect()
        };
        for client in clients {
            if let Some(reply) = client.registry.dispatch_unsolicited(&*client, name, data) {
                // A reply to a push is itself a push and is never answered.
                let _ = self.registry.dispatch_unsolicited(self, name, &reply);
            }
        }
    }

    fn is_connected(&self) -> bool {
        !self.closed.load(Ordering::Acquire)
    }

    fn pending_requests(&self) -> usize {
        0
    }

    fn add_endpoint(&self, endpoint: Arc<dyn Endpoint>) {
        let weak: Weak<dyn Transport> = self.self_ref.clone();
        self.registry.insert(endpoint, weak);
    }

    fn endpoint(&self, name: &str) -> Option<Arc<dyn Endpoint>> {
        self.registry.get(name)
    }

    fn endpoint_names(&self) -> Vec<String> {
        self.registry.names()
    }

    fn address(&self) -> Address {
        self.address.clone()
    }

    fn close(&self) {
        if !self.closed.swap(true, Ordering::AcqRel) {
            debug!("Closed server {}", self.address);
        }
    }
}

pub struct LoopbackClient {
    server: Weak<LoopbackServer>,
    address: Address,
    registry: EndpointRegistry,
    pending: Arc<PendingTable>,
    closed: AtomicBool,
    self_ref: Weak<LoopbackClient>,
}

impl Transport for LoopbackClient {
    fn request(&self, name: &str, payload: Payload) -> Result<PendingResponse, TransportError> {
        let bytes = payload.into_bytes()?;
        let server = self
            .server
            .upgrade()
            .filter(|s| s.is_connected() && self.is_connected())
            .ok_or(TransportError::NotConnected)?;

        let (token, pending) = self.pending.register(name);
        if let Some(response) = server.registry.dispatch(&*server, name, &bytes) {
            self.pending.fulfill(token, response)?;
        }
        Ok(pending)
    }

    fn broadcast(&self, _name: &str, _data: &[u8]) {}

    fn is_connected(&self) -> bool {
        !self.closed.load(Ordering::Acquire) && self.server.upgrade().is_some_and(|s| s.is_connected())
    }

    fn pending_requests(&self) -> usize {
        self.pending.len()
    }

    fn add_endpoint(&self, endpoint: Arc<dyn Endpoint>) {
        let weak: Weak<dyn Transport> = self.self_ref.clone();
        self.registry.insert(endpoint, weak);
    }

    fn endpoint(&self, name: &str) -> Option<Arc<dyn Endpoint>> {
        self.registry.get(name)
    }

    fn endpoint_names(&self) -> Vec<String> {
        self.registry.names()
    }

    fn address(&self) -> Address {
        self.address.clone()
    }

    fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.pending.fail_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_discover_tracks_server_lifetime() {
        let factory = TransportLoopbackFactory::new();
        assert!(factory.discover().unwrap().is_empty());
        let server = factory.serve().unwrap();
        assert_eq!(factory.discover().unwrap(), vec![server.address()]);
        assert_eq!(factory.discover().unwrap(), factory.discover().unwrap());
        drop(server);
        assert!(factory.discover().unwrap().is_empty());
    }

    #[test]
    fn test_unknown_endpoint_times_out() {
        let factory = TransportLoopbackFactory::new();
        let server = factory.serve().unwrap();
        let client = factory.connect(&server.address()).unwrap();
        let pending = client.request("missing", Payload::from("x")).unwrap();
        assert_eq!(client.pending_requests(), 1);
        assert!(pending.wait_for(Duration::from_millis(5)).unwrap_err().is_timeout());
    }

    #[test]
    fn test_client_disconnects_with_server() {
        let factory = TransportLoopbackFactory::new();
        let server = factory.serve().unwrap();
        let client = factory.connect(&server.address()).unwrap();
        assert!(client.is_connected());
        server.close();
        assert!(!client.is_connected());
        assert!(matches!(client.request("introspect", Payload::from("")), Err(TransportError::NotConnected)));
    }
}
