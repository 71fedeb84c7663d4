//! Process name, pid and thread names

use scopewire_common::ENDPOINT_PROCESS_INFO;
use serde::{Deserialize, Serialize};
use std::any::Any;
use std::collections::BTreeMap;
use std::sync::{Arc, Weak};

use super::{Endpoint, TransportSlot};
use crate::domain::{Pid, Tid, TransportError};
use crate::process_lookup;
use crate::transport::{Data, Payload, Transport, DEFAULT_REQUEST_TIMEOUT};

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ProcessInfo {
    pub name: String,
    pub pid: Pid,
    #[serde(default)]
    pub threads: BTreeMap<Tid, String>,
}

impl ProcessInfo {
    /// Describe the calling process.
    pub fn current() -> Self {
        Self {
            name: process_lookup::process_name(),
            pid: Pid::current(),
            threads: process_lookup::thread_names(),
        }
    }
}

#[derive(Default)]
pub struct EndpointProcessInfo {
    slot: TransportSlot,
    process_name: Option<String>,
}

impl EndpointProcessInfo {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Report `name` instead of the kernel's process name.
    pub fn named(name: impl Into<String>) -> Arc<Self> {
        Arc::new(Self { slot: TransportSlot::default(), process_name: Some(name.into()) })
    }

    /// # Errors
    /// Transport failures or an undecodable response.
    pub fn process_info(&self) -> Result<ProcessInfo, TransportError> {
        let response =
            self.slot.query(ENDPOINT_PROCESS_INFO, Payload::Bytes(Vec::new()), DEFAULT_REQUEST_TIMEOUT)?;
        Ok(serde_json::from_slice(&response)?)
    }

    fn describe(&self) -> ProcessInfo {
        let mut info = ProcessInfo::current();
        if let Some(name) = &self.process_name {
            info.name.clone_from(name);
        }
        info
    }
}

impl Endpoint for EndpointProcessInfo {
    fn name(&self) -> &str {
        ENDPOINT_PROCESS_INFO
    }

    fn handle(&self, _transport: &dyn Transport, _request: &[u8]) -> Option<Data> {
        serde_json::to_vec(&self.describe()).ok()
    }

    fn set_transport(&self, transport: Weak<dyn Transport>) {
        self.slot.attach(transport);
    }

    fn as_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }
}
