//! Named request handlers
//!
//! An endpoint serves requests on the side that registered it and, for the
//! built-in ones, offers a typed client API on the side that connected. The
//! same type plays both roles: a server registers it to answer, a client
//! attaches it to a connection and calls its query methods.
//!
//! | name | module |
//! |---|---|
//! | `introspect` | [`introspect`] |
//! | `process_info` | [`process_info`] |
//! | `trace_mapping` | [`trace_mapping`] |
//! | `native_trace_sender` / `native_trace_receiver` | [`native_trace`] |
//! | `trace_configurator` | [`trace_configurator`] |

pub mod introspect;
pub mod native_trace;
pub mod process_info;
pub mod trace_configurator;
pub mod trace_mapping;

use std::any::Any;
use std::collections::BTreeMap;
use std::sync::{Arc, PoisonError, RwLock, Weak};
use std::time::Duration;

use crate::domain::TransportError;
use crate::transport::{Data, Payload, Transport};

pub use introspect::EndpointIntrospect;
pub use native_trace::{EndpointNativeTraceReceiver, EndpointNativeTraceSender, NativeTracePacket};
pub use process_info::{EndpointProcessInfo, ProcessInfo};
pub use trace_configurator::{EndpointTraceConfigurator, TraceConfiguration};
pub use trace_mapping::EndpointTraceMapping;

pub trait Endpoint: Send + Sync {
    /// Registry key; unique per connection
    fn name(&self) -> &str;

    /// Answer a request. `None` sends nothing back.
    fn handle(&self, transport: &dyn Transport, request: &[u8]) -> Option<Data> {
        let _ = (transport, request);
        None
    }

    /// Data pushed by the peer without a request. `None` sends nothing back.
    fn unsolicited(&self, transport: &dyn Transport, data: &[u8]) -> Option<Data> {
        let _ = (transport, data);
        None
    }

    /// Called when the endpoint is attached to a connection. The reference
    /// must stay weak so the endpoint never keeps its connection alive.
    fn set_transport(&self, transport: Weak<dyn Transport>) {
        let _ = transport;
    }

    /// Upcast used by [`downcast_endpoint`]; implement as `self`.
    fn as_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync>;
}

/// Recover the concrete endpoint type from a registry entry.
pub fn downcast_endpoint<T: Endpoint + 'static>(endpoint: &Arc<dyn Endpoint>) -> Option<Arc<T>> {
    Arc::clone(endpoint).as_any().downcast::<T>().ok()
}

/// Find an endpoint of type `T` registered under `name`.
pub fn find_endpoint<T: Endpoint + 'static>(
    endpoints: &BTreeMap<String, Arc<dyn Endpoint>>,
    name: &str,
) -> Option<Arc<T>> {
    endpoints.get(name).and_then(downcast_endpoint::<T>)
}

/// Weak links from an endpoint to every connection it is attached to
///
/// Client endpoints sit on one connection; a server endpoint such as the
/// native sender may be registered on several servers at once.
#[derive(Default)]
pub struct TransportSlot {
    transports: RwLock<Vec<Weak<dyn Transport>>>,
}

impl TransportSlot {
    /// Add `transport`, forgetting connections that are gone.
    pub fn attach(&self, transport: Weak<dyn Transport>) {
        let mut transports = self.transports.write().unwrap_or_else(PoisonError::into_inner);
        transports.retain(|t| t.strong_count() > 0 && !Weak::ptr_eq(t, &transport));
        transports.push(transport);
    }

    /// The most recently attached connection that is still alive
    pub fn get(&self) -> Option<Arc<dyn Transport>> {
        self.transports.read().unwrap_or_else(PoisonError::into_inner).iter().rev().find_map(Weak::upgrade)
    }

    /// Every attached connection that is still alive, oldest first
    pub fn all(&self) -> Vec<Arc<dyn Transport>> {
        self.transports.read().unwrap_or_else(PoisonError::into_inner).iter().filter_map(Weak::upgrade).collect()
    }

    /// Issue a request to the peer's endpoint `name` and wait for the answer.
    ///
    /// # Errors
    /// [`TransportError::NotConnected`] if the connection is gone, otherwise
    /// whatever the request or the wait reports.
    pub fn query(&self, name: &str, payload: Payload, timeout: Duration) -> Result<Data, TransportError> {
        let transport = self.get().ok_or(TransportError::NotConnected)?;
        let pending = transport.request(name, payload)?;
        pending.wait_for(timeout)
    }
}
