//! Making an instrumented process visible
//!
//! [`DefaultExposer`] serves a transport carrying every built-in server-side
//! endpoint. Keep it alive for as long as the process should be discoverable.

use log::info;
use std::sync::Arc;

use crate::domain::{Address, TransportError};
use crate::endpoint::{
    Endpoint, EndpointNativeTraceSender, EndpointProcessInfo, EndpointTraceConfigurator, EndpointTraceMapping,
};
use crate::transport::{Transport, TransportFactory, TransportUnixFactory};

pub struct DefaultExposer {
    server: Arc<dyn Transport>,
}

impl DefaultExposer {
    /// Serve on the default unix transport, reporting the kernel's process
    /// name.
    ///
    /// # Errors
    /// Returns an error if the server socket cannot be bound.
    pub fn new() -> Result<Self, TransportError> {
        Self::with_factory(&TransportUnixFactory::new(), None)
    }

    /// Serve on a transport from `factory`, reporting `process_name` if
    /// given.
    ///
    /// # Errors
    /// Returns an error if serving fails or the sender thread cannot start.
    pub fn with_factory(factory: &dyn TransportFactory, process_name: Option<&str>) -> Result<Self, TransportError> {
        let server = factory.serve()?;
        let process_info = match process_name {
            Some(name) => EndpointProcessInfo::named(name),
            None => EndpointProcessInfo::new(),
        };
        server.add_endpoint(process_info as Arc<dyn Endpoint>);
        server.add_endpoint(EndpointTraceMapping::new() as Arc<dyn Endpoint>);
        server.add_endpoint(EndpointNativeTraceSender::new()? as Arc<dyn Endpoint>);
        server.add_endpoint(EndpointTraceConfigurator::new() as Arc<dyn Endpoint>);
        info!("Exposing {:?} on {}", server.endpoint_names(), server.address());
        Ok(Self { server })
    }

    pub fn address(&self) -> Address {
        self.server.address()
    }

    pub fn transport(&self) -> &Arc<dyn Transport> {
        &self.server
    }
}

impl Drop for DefaultExposer {
    fn drop(&mut self) {
        self.server.close();
    }
}
