//! Per-connection endpoint table
//!
//! Read by request dispatch and written by `add_endpoint`, possibly at the
//! same time while a connection is still being set up. Handlers are cloned
//! out of the lock before they run, so a handler may register further
//! endpoints without deadlocking.

use log::debug;
use std::collections::BTreeMap;
use std::sync::{Arc, PoisonError, RwLock, Weak};

use super::{Data, Transport};
use crate::endpoint::Endpoint;

#[derive(Default)]
pub struct EndpointRegistry {
    endpoints: RwLock<BTreeMap<String, Arc<dyn Endpoint>>>,
}

impl EndpointRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `endpoint` under its name; the last registration wins.
    pub fn insert(&self, endpoint: Arc<dyn Endpoint>, transport: Weak<dyn Transport>) {
        endpoint.set_transport(transport);
        let name = endpoint.name().to_string();
        let previous = self.endpoints.write().unwrap_or_else(PoisonError::into_inner).insert(name.clone(), endpoint);
        if previous.is_some() {
            debug!("Replaced endpoint handler '{name}'");
        }
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Endpoint>> {
        self.endpoints.read().unwrap_or_else(PoisonError::into_inner).get(name).cloned()
    }

    /// Names in sorted order
    pub fn names(&self) -> Vec<String> {
        self.endpoints.read().unwrap_or_else(PoisonError::into_inner).keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.endpoints.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Route a request; unknown names are dropped without a response.
    pub fn dispatch(&self, transport: &dyn Transport, name: &str, request: &[u8]) -> Option<Data> {
        let Some(endpoint) = self.get(name) else {
            debug!("No endpoint '{name}' on {}, dropping request", transport.address());
            return None;
        };
        endpoint.handle(transport, request)
    }

    /// Route an unsolicited push to the local handler with that name.
    pub fn dispatch_unsolicited(&self, transport: &dyn Transport, name: &str, data: &[u8]) -> Option<Data> {
        let Some(endpoint) = self.get(name) else {
            debug!("No endpoint '{name}' for unsolicited data on {}", transport.address());
            return None;
        };
        endpoint.unsolicited(transport, data)
    }
}

impl std::fmt::Debug for EndpointRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EndpointRegistry").field("endpoints", &self.names()).finish()
    }
}
