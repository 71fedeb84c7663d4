//! Discovery/poll manager
//!
//! Per peer: discovered → connected → endpoints attached → removed once it
//! disconnects or stops being discovered. Endpoints are built by factories
//! registered per remote endpoint name; a factory only runs when the peer's
//! `introspect` lists that name, and may return `None` without that being an
//! error.

use crossbeam_channel::{bounded, RecvTimeoutError, Sender};
use log::debug;
use scopewire_common::ENDPOINT_INTROSPECT;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::thread::{self, JoinHandle, ThreadId};
use std::time::Duration;

use crate::domain::{Address, TransportError};
use crate::endpoint::{downcast_endpoint, Endpoint, EndpointIntrospect};
use crate::transport::{Transport, TransportFactory};

/// Builds the local side of an endpoint for a fresh connection
pub type EndpointFactory = Arc<dyn Fn(&Arc<dyn Transport>) -> Option<Arc<dyn Endpoint>> + Send + Sync>;

/// Observer for internal events; never alters control flow
pub type LogHook = Arc<dyn Fn(&str) + Send + Sync>;

/// A connected peer and the endpoints attached to it, keyed by endpoint name
#[derive(Clone)]
pub struct Peer {
    pub transport: Arc<dyn Transport>,
    pub endpoints: BTreeMap<String, Arc<dyn Endpoint>>,
}

impl Peer {
    /// Endpoint `name`, if attached and of type `T`
    pub fn endpoint<T: Endpoint + 'static>(&self, name: &str) -> Option<Arc<T>> {
        self.endpoints.get(name).and_then(downcast_endpoint::<T>)
    }

    /// Like [`Peer::endpoint`], for callers that report the missing endpoint.
    ///
    /// # Errors
    /// [`TransportError::UnsupportedEndpoint`] if no endpoint of type `T` is
    /// attached under `name`.
    pub fn require<T: Endpoint + 'static>(&self, name: &str) -> Result<Arc<T>, TransportError> {
        self.endpoint::<T>(name).ok_or_else(|| TransportError::UnsupportedEndpoint(name.to_string()))
    }
}

pub type PeerMap = BTreeMap<Address, Peer>;

struct PollerState {
    transport_factory: Arc<dyn TransportFactory>,
    factories: RwLock<BTreeMap<String, EndpointFactory>>,
    peers: Mutex<PeerMap>,
    logger: RwLock<Option<LogHook>>,
    round: Mutex<()>,
}

struct PollWorker {
    stop: Sender<()>,
    handle: JoinHandle<()>,
    thread_id: ThreadId,
}

pub struct EndpointManagerPoll {
    state: Arc<PollerState>,
    worker: Mutex<Option<PollWorker>>,
}

impl EndpointManagerPoll {
    /// A poller with the `introspect` factory registered.
    pub fn new(transport_factory: Arc<dyn TransportFactory>) -> Self {
        let poller = Self {
            state: Arc::new(PollerState {
                transport_factory,
                factories: RwLock::new(BTreeMap::new()),
                peers: Mutex::new(BTreeMap::new()),
                logger: RwLock::new(None),
                round: Mutex::new(()),
            }),
            worker: Mutex::new(None),
        };
        poller.add_endpoint_factory(
            ENDPOINT_INTROSPECT,
            Arc::new(|_transport: &Arc<dyn Transport>| Some(EndpointIntrospect::new() as Arc<dyn Endpoint>)),
        );
        poller
    }

    /// Register how to build the local endpoint paired with the remote
    /// endpoint `name`. Replaces a previous factory for that name and only
    /// affects peers connected afterwards.
    pub fn add_endpoint_factory(&self, name: &str, factory: EndpointFactory) {
        self.state.factories.write().unwrap_or_else(PoisonError::into_inner).insert(name.to_string(), factory);
    }

    pub fn set_logger(&self, hook: LogHook) {
        *self.state.logger.write().unwrap_or_else(PoisonError::into_inner) = Some(hook);
    }

    /// Point-in-time copy of the peer table
    pub fn endpoints(&self) -> PeerMap {
        self.state.peers.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    /// Run exactly one discovery/attach round on the calling thread.
    ///
    /// # Errors
    /// Returns an error if discovery itself fails; failures to reach single
    /// peers are logged and skipped.
    pub fn manage(&self) -> Result<(), TransportError> {
        self.state.manage()
    }

    /// Poll every `interval` on a background thread. Does nothing if already
    /// polling.
    ///
    /// # Errors
    /// Returns an error if the thread cannot be spawned.
    pub fn start_polling(&self, interval: Duration) -> Result<(), TransportError> {
        let mut worker = self.worker.lock().unwrap_or_else(PoisonError::into_inner);
        if worker.is_some() {
            return Ok(());
        }
        let (stop, stopped) = bounded::<()>(1);
        let state = Arc::clone(&self.state);
        let handle = thread::Builder::new().name("scopewire-poll".to_string()).spawn(move || loop {
            if let Err(e) = state.manage() {
                state.log(&format!("Discovery failed: {e}"));
            }
            match stopped.recv_timeout(interval) {
                Err(RecvTimeoutError::Timeout) => {}
                Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
            }
        })?;
        let thread_id = handle.thread().id();
        *worker = Some(PollWorker { stop, handle, thread_id });
        Ok(())
    }

    /// Stop background polling. Safe to call when polling never started.
    pub fn stop_polling(&self) {
        let worker = self.worker.lock().unwrap_or_else(PoisonError::into_inner).take();
        let Some(worker) = worker else {
            return;
        };
        let _ = worker.stop.try_send(());
        if worker.thread_id != thread::current().id() {
            let _ = worker.handle.join();
        }
    }

    pub fn is_polling(&self) -> bool {
        self.worker.lock().unwrap_or_else(PoisonError::into_inner).is_some()
    }
}

impl Drop for EndpointManagerPoll {
    fn drop(&mut self) {
        self.stop_polling();
    }
}

impl PollerState {
    fn log(&self, msg: &str) {
        debug!("{msg}");
        let hook = self.logger.read().unwrap_or_else(PoisonError::into_inner).clone();
        if let Some(hook) = hook {
            hook(msg);
        }
    }

    fn manage(&self) -> Result<(), TransportError> {
        let _round = self.round.lock().unwrap_or_else(PoisonError::into_inner);

        let discovered: BTreeSet<Address> = self.transport_factory.discover()?.into_iter().collect();

        let removed: Vec<(Address, Peer)> = {
            let mut peers = self.peers.lock().unwrap_or_else(PoisonError::into_inner);
            let stale: Vec<Address> = peers
                .iter()
                .filter(|(address, peer)| !discovered.contains(*address) || !peer.transport.is_connected())
                .map(|(address, _)| address.clone())
                .collect();
            stale.into_iter().filter_map(|a| peers.remove(&a).map(|p| (a, p))).collect()
        };
        for (address, peer) in removed {
            self.log(&format!("Removing peer {address}"));
            peer.transport.close();
        }

        let known: BTreeSet<Address> =
            self.peers.lock().unwrap_or_else(PoisonError::into_inner).keys().cloned().collect();
        for address in discovered.difference(&known) {
            let transport = match self.transport_factory.connect(address) {
                Ok(transport) => transport,
                Err(e) => {
                    self.log(&format!("Could not connect to {address}: {e}"));
                    continue;
                }
            };
            self.log(&format!("Connected to {address}"));
            let endpoints = self.attach_endpoints(&transport);
            self.peers
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .insert(address.clone(), Peer { transport, endpoints });
        }
        Ok(())
    }

    fn attach_endpoints(&self, transport: &Arc<dyn Transport>) -> BTreeMap<String, Arc<dyn Endpoint>> {
        let factories: Vec<(String, EndpointFactory)> = self
            .factories
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|(name, factory)| (name.clone(), Arc::clone(factory)))
            .collect();
        let mut endpoints = BTreeMap::new();

        // Ask the peer what it serves before building anything else.
        let supported = factories
            .iter()
            .find(|(name, _)| name == ENDPOINT_INTROSPECT)
            .and_then(|(_, factory)| factory(transport))
            .and_then(|endpoint| {
                transport.add_endpoint(Arc::clone(&endpoint));
                endpoints.insert(endpoint.name().to_string(), Arc::clone(&endpoint));
                downcast_endpoint::<EndpointIntrospect>(&endpoint)
            })
            .and_then(|introspect| match introspect.supported() {
                Ok(names) => Some(names),
                Err(e) => {
                    self.log(&format!("Introspection of {} failed: {e}", transport.address()));
                    None
                }
            });

        for (name, factory) in factories {
            if name == ENDPOINT_INTROSPECT {
                continue;
            }
            if let Some(supported) = &supported {
                if !supported.contains(&name) {
                    self.log(&format!("{} does not support '{name}'", transport.address()));
                    continue;
                }
            }
            if let Some(endpoint) = factory(transport) {
                transport.add_endpoint(Arc::clone(&endpoint));
                endpoints.insert(endpoint.name().to_string(), endpoint);
            }
        }
        endpoints
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::TransportLoopbackFactory;

    #[test]
    fn test_stop_without_start_is_noop() {
        let poller = EndpointManagerPoll::new(TransportLoopbackFactory::new());
        poller.stop_polling();
        assert!(!poller.is_polling());
    }

    #[test]
    fn test_manage_attaches_introspect() {
        let factory = TransportLoopbackFactory::new();
        let server = factory.serve().unwrap();
        let poller = EndpointManagerPoll::new(factory.clone());
        poller.manage().unwrap();

        let peers = poller.endpoints();
        let peer = &peers[&server.address()];
        let introspect = peer.endpoint::<EndpointIntrospect>(ENDPOINT_INTROSPECT).unwrap();
        assert_eq!(introspect.supported().unwrap(), vec!["introspect".to_string()]);
    }

    #[test]
    fn test_require_reports_unsupported_endpoint() {
        let factory = TransportLoopbackFactory::new();
        let server = factory.serve().unwrap();
        let poller = EndpointManagerPoll::new(factory.clone());
        poller.manage().unwrap();

        let peers = poller.endpoints();
        let peer = &peers[&server.address()];
        assert!(peer.require::<EndpointIntrospect>(ENDPOINT_INTROSPECT).is_ok());
        let err = peer.require::<EndpointIntrospect>("process_info").unwrap_err();
        assert!(matches!(&err, TransportError::UnsupportedEndpoint(name) if name == "process_info"));
        // Registered under the name but of another type.
        assert!(peer.require::<crate::endpoint::EndpointProcessInfo>(ENDPOINT_INTROSPECT).is_err());
    }

    #[test]
    fn test_vanished_peer_removed() {
        let factory = TransportLoopbackFactory::new();
        let server = factory.serve().unwrap();
        let poller = EndpointManagerPoll::new(factory.clone());
        poller.manage().unwrap();
        assert_eq!(poller.endpoints().len(), 1);
        drop(server);
        poller.manage().unwrap();
        assert!(poller.endpoints().is_empty());
    }
}
