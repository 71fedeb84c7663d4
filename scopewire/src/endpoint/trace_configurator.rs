//! Remote enable/disable of capture
//!
//! Request: `{"cmd": "set" | "get", "state": TraceConfiguration}`.
//! Response: `{"state": TraceConfiguration}` describing the state after the
//! command ran. A set applies the process state and the thread states first,
//! then the new-thread default.

use log::debug;
use scopewire_common::ENDPOINT_TRACE_CONFIGURATOR;
use serde::{Deserialize, Serialize};
use std::any::Any;
use std::collections::BTreeMap;
use std::sync::{Arc, Weak};

use super::{Endpoint, TransportSlot};
use crate::capture::TraceConfigurator;
use crate::domain::{Tid, TransportError};
use crate::transport::{Data, Payload, Transport, DEFAULT_REQUEST_TIMEOUT};

/// Desired or reported capture state of one process
///
/// The `set_*` flags select which fields a set command applies; thread
/// entries are always applied, to threads the process knows about.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct TraceConfiguration {
    #[serde(rename = "p", default)]
    pub process_state: bool,
    #[serde(rename = "sp", default)]
    pub set_process_state: bool,
    #[serde(rename = "nt", default)]
    pub new_thread_state: bool,
    #[serde(rename = "snt", default)]
    pub set_new_thread_state: bool,
    #[serde(rename = "t", default)]
    pub thread_state: BTreeMap<Tid, bool>,
    /// True only on a configuration decoded from a response
    #[serde(skip)]
    pub cmd_success: bool,
}

impl TraceConfiguration {
    pub fn snapshot(configurator: &TraceConfigurator) -> Self {
        Self {
            process_state: configurator.process_state(),
            new_thread_state: configurator.new_thread_state(),
            thread_state: configurator.thread_states(),
            ..Self::default()
        }
    }

    /// Apply to `configurator`. Unknown thread ids are ignored.
    pub fn apply(&self, configurator: &TraceConfigurator) {
        if self.set_process_state {
            configurator.set_process_state(self.process_state);
        }
        for (tid, state) in &self.thread_state {
            if configurator.set_thread_state(*tid, *state).is_none() {
                debug!("Ignoring state for unknown thread {tid}");
            }
        }
        if self.set_new_thread_state {
            configurator.set_new_thread_state(self.new_thread_state);
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
enum Command {
    Set,
    Get,
}

#[derive(Debug, Serialize, Deserialize)]
struct ConfigureRequest {
    cmd: Command,
    #[serde(default)]
    state: TraceConfiguration,
}

#[derive(Debug, Serialize, Deserialize)]
struct ConfigureResponse {
    state: TraceConfiguration,
}

pub struct EndpointTraceConfigurator {
    slot: TransportSlot,
    configurator: Arc<TraceConfigurator>,
}

impl EndpointTraceConfigurator {
    /// Serves the process-wide configurator
    pub fn new() -> Arc<Self> {
        Self::with_configurator(TraceConfigurator::global())
    }

    pub fn with_configurator(configurator: Arc<TraceConfigurator>) -> Arc<Self> {
        Arc::new(Self { slot: TransportSlot::default(), configurator })
    }

    /// Apply `state` on the peer and return what the peer reports.
    ///
    /// # Errors
    /// Transport failures or an undecodable response.
    pub fn set_trace_state(&self, state: &TraceConfiguration) -> Result<TraceConfiguration, TransportError> {
        self.command(Command::Set, state.clone())
    }

    /// # Errors
    /// Transport failures or an undecodable response.
    pub fn get_trace_state(&self) -> Result<TraceConfiguration, TransportError> {
        self.command(Command::Get, TraceConfiguration::default())
    }

    fn command(&self, cmd: Command, state: TraceConfiguration) -> Result<TraceConfiguration, TransportError> {
        let request = serde_json::to_vec(&ConfigureRequest { cmd, state })?;
        let response = self.slot.query(ENDPOINT_TRACE_CONFIGURATOR, Payload::Bytes(request), DEFAULT_REQUEST_TIMEOUT)?;
        let ConfigureResponse { mut state } = serde_json::from_slice(&response)?;
        state.cmd_success = true;
        Ok(state)
    }

    fn serve(&self, request: &[u8]) -> Option<Data> {
        let request: ConfigureRequest = match serde_json::from_slice(request) {
            Ok(request) => request,
            Err(e) => {
                debug!("Ignoring malformed configurator request: {e}");
                return None;
            }
        };
        if matches!(request.cmd, Command::Set) {
            request.state.apply(&self.configurator);
        }
        let state = TraceConfiguration::snapshot(&self.configurator);
        serde_json::to_vec(&ConfigureResponse { state }).ok()
    }
}

impl Endpoint for EndpointTraceConfigurator {
    fn name(&self) -> &str {
        ENDPOINT_TRACE_CONFIGURATOR
    }

    fn handle(&self, _transport: &dyn Transport, request: &[u8]) -> Option<Data> {
        self.serve(request)
    }

    fn set_transport(&self, transport: Weak<dyn Transport>) {
        self.slot.attach(transport);
    }

    fn as_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_wire_keys() {
        let mut config = TraceConfiguration { process_state: true, set_process_state: true, ..Default::default() };
        config.thread_state.insert(Tid(9), false);
        let json = serde_json::to_value(&config).unwrap();
        assert_eq!(json, json!({"p": true, "sp": true, "nt": false, "snt": false, "t": {"9": false}}));
    }

    #[test]
    fn test_set_applies_process_then_new_thread() {
        let configurator = TraceConfigurator::new();
        configurator.register_thread(Tid(1));
        let endpoint = EndpointTraceConfigurator::with_configurator(Arc::clone(&configurator));

        let request = json!({"cmd": "set", "state": {"p": false, "sp": true, "nt": false, "snt": true, "t": {"1": false, "2": true}}});
        let response = endpoint.serve(&serde_json::to_vec(&request).unwrap()).unwrap();
        let response: serde_json::Value = serde_json::from_slice(&response).unwrap();

        assert_eq!(response["state"]["p"], false);
        assert_eq!(response["state"]["nt"], false);
        assert_eq!(response["state"]["t"], json!({"1": false}));
        assert!(!configurator.process_state());
    }

    #[test]
    fn test_get_does_not_modify() {
        let configurator = TraceConfigurator::new();
        let endpoint = EndpointTraceConfigurator::with_configurator(Arc::clone(&configurator));
        let request = json!({"cmd": "get", "state": {"p": false, "sp": true}});
        endpoint.serve(&serde_json::to_vec(&request).unwrap()).unwrap();
        assert!(configurator.process_state());
    }

    #[test]
    fn test_malformed_request_gets_no_response() {
        let endpoint = EndpointTraceConfigurator::with_configurator(TraceConfigurator::new());
        assert!(endpoint.serve(b"not json").is_none());
    }
}
