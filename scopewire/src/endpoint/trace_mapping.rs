//! Trace id → name mapping of the serving process

use scopewire_common::ENDPOINT_TRACE_MAPPING;
use serde::{Deserialize, Serialize};
use std::any::Any;
use std::collections::BTreeMap;
use std::sync::{Arc, Weak};

use super::{Endpoint, TransportSlot};
use crate::capture;
use crate::domain::{Pid, TraceId, TransportError};
use crate::transport::{Data, Payload, Transport, DEFAULT_REQUEST_TIMEOUT};

/// Names per process, as exchanged on the wire
pub type ProcessTraceMap = BTreeMap<Pid, BTreeMap<TraceId, String>>;

#[derive(Debug, Default, Serialize, Deserialize)]
struct MappingMessage {
    mapping: ProcessTraceMap,
}

#[derive(Default)]
pub struct EndpointTraceMapping {
    slot: TransportSlot,
}

impl EndpointTraceMapping {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// # Errors
    /// Transport failures or an undecodable response.
    pub fn mapping(&self) -> Result<ProcessTraceMap, TransportError> {
        let response =
            self.slot.query(ENDPOINT_TRACE_MAPPING, Payload::Bytes(Vec::new()), DEFAULT_REQUEST_TIMEOUT)?;
        let message: MappingMessage = serde_json::from_slice(&response)?;
        Ok(message.mapping)
    }
}

/// Mapping of the calling process in wire form
pub fn local_mapping() -> ProcessTraceMap {
    let names: BTreeMap<TraceId, String> = capture::trace_names().into_iter().collect();
    let mut mapping = ProcessTraceMap::new();
    mapping.insert(Pid::current(), names);
    mapping
}

impl Endpoint for EndpointTraceMapping {
    fn name(&self) -> &str {
        ENDPOINT_TRACE_MAPPING
    }

    fn handle(&self, _transport: &dyn Transport, _request: &[u8]) -> Option<Data> {
        serde_json::to_vec(&MappingMessage { mapping: local_mapping() }).ok()
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

    #[test]
    fn test_local_mapping_contains_named_ids() {
        capture::set_trace_name(TraceId(0x7a11), "mapped");
        let mapping = local_mapping();
        let own = &mapping[&Pid::current()];
        assert_eq!(own.get(&TraceId(0x7a11)).map(String::as_str), Some("mapped"));
    }

    #[test]
    fn test_wire_shape() {
        let mut mapping = ProcessTraceMap::new();
        mapping.entry(Pid(4)).or_default().insert(TraceId(1), "a".to_string());
        let json = serde_json::to_value(MappingMessage { mapping }).unwrap();
        assert_eq!(json["mapping"]["4"]["1"], "a");
    }
}
