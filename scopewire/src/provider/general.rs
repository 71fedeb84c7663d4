//! Process and thread name metadata
//!
//! Emits `process_name` and `thread_name` metadata records so viewers label
//! tracks with names instead of bare ids. Names are collected when the
//! interval finishes, so threads created during the window are included.

use log::debug;
use scopewire_common::ENDPOINT_PROCESS_INFO;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use super::{TraceEventProvider, TraceEventSource};
use crate::discovery::EndpointManagerPoll;
use crate::domain::{TraceError, Tid};
use crate::endpoint::{Endpoint, EndpointProcessInfo, ProcessInfo};
use crate::trace_data::TraceEvent;
use crate::transport::Transport;

pub struct GeneralProvider {
    poller: Option<Arc<EndpointManagerPoll>>,
    include_local: bool,
}

impl GeneralProvider {
    /// Metadata for every process found by `poller`. Registers the process
    /// info client factory on it.
    pub fn new(poller: Arc<EndpointManagerPoll>) -> Arc<Self> {
        poller.add_endpoint_factory(
            ENDPOINT_PROCESS_INFO,
            Arc::new(|_transport: &Arc<dyn Transport>| Some(EndpointProcessInfo::new() as Arc<dyn Endpoint>)),
        );
        Arc::new(Self { poller: Some(poller), include_local: false })
    }

    /// Metadata for the calling process only
    pub fn local() -> Arc<Self> {
        Arc::new(Self { poller: None, include_local: true })
    }

    fn collect(&self) -> Vec<ProcessInfo> {
        let mut infos = Vec::new();
        if self.include_local {
            infos.push(ProcessInfo::current());
        }
        if let Some(poller) = &self.poller {
            for (address, peer) in poller.endpoints() {
                match peer.require::<EndpointProcessInfo>(ENDPOINT_PROCESS_INFO).and_then(|e| e.process_info()) {
                    Ok(info) => infos.push(info),
                    Err(e) => debug!("No process info from {address}: {e}"),
                }
            }
        }
        infos
    }
}

/// Metadata records describing `info`
pub fn metadata_events(info: &ProcessInfo) -> Vec<TraceEvent> {
    let mut events = Vec::with_capacity(info.threads.len() + 1);
    events.push(TraceEvent::metadata(info.pid, Tid(0), "process_name", info.name.clone()));
    for (tid, name) in &info.threads {
        events.push(TraceEvent::metadata(info.pid, *tid, "thread_name", name.clone()));
    }
    events
}

impl TraceEventProvider for GeneralProvider {
    fn make_source(self: Arc<Self>) -> Arc<dyn TraceEventSource> {
        Arc::new(GeneralSource { provider: self, started: AtomicBool::new(false) })
    }
}

pub struct GeneralSource {
    provider: Arc<GeneralProvider>,
    started: AtomicBool,
}

impl TraceEventSource for GeneralSource {
    fn start_interval(&self) {
        self.started.store(true, Ordering::Release);
    }

    fn stop_interval(&self) {}

    fn finish_interval(&self) -> Result<Vec<TraceEvent>, TraceError> {
        if !self.started.swap(false, Ordering::AcqRel) {
            return Ok(Vec::new());
        }
        Ok(self.provider.collect().iter().flat_map(metadata_events).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::Pid;
    use crate::trace_data::Phase;
    use std::collections::BTreeMap;

    #[test]
    fn test_metadata_for_process_and_threads() {
        let mut threads = BTreeMap::new();
        threads.insert(Tid(11), "main".to_string());
        threads.insert(Tid(12), "io".to_string());
        let info = ProcessInfo { name: "app".to_string(), pid: Pid(11), threads };

        let events = metadata_events(&info);
        assert_eq!(events.len(), 3);
        assert!(events.iter().all(|e| e.ph == Phase::Metadata && e.pid == Pid(11)));
        assert_eq!(events[0].name, "process_name");
        assert_eq!(events[2].args.as_ref().unwrap()["name"], "io");
    }

    #[test]
    fn test_local_source_describes_this_process() {
        let source = GeneralProvider::local().make_source();
        assert!(source.finish_interval().unwrap().is_empty());
        source.start_interval();
        source.stop_interval();
        let events = source.finish_interval().unwrap();
        assert!(events.iter().any(|e| e.name == "process_name" && e.pid == Pid::current()));
    }
}
