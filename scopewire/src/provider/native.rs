//! Provider backed by the native capture engine
//!
//! Two feeds deliver raw events:
//! - remote: a `native_trace_receiver` endpoint attached to every discovered
//!   process that serves `native_trace_sender`; each packet it receives is
//!   handed to the provider through a [`ProviderHandle`]
//! - local ([`NativeTraceProvider::local`]): the provider listens to every
//!   drain of this process's collector, whether it drains the collector
//!   itself (whenever a source starts, stops, works or finishes) or the
//!   native sender of an exposed process does
//!
//! Either way the provider copies incoming events into every source that is
//! currently recording. Names are resolved when a source is finished, from
//! this process's mapping and from the peers' `trace_mapping` endpoints.
//!
//! Counter samples become `"ph":"C"` events whose `args` hold the latest value
//! of every series of that counter in the process, including series that
//! first appear later in the interval.

use log::debug;
use scopewire_common::{
    MarkLevel, RawTraceEvent, ENDPOINT_NATIVE_TRACE_SENDER, ENDPOINT_TRACE_MAPPING, TRACE_TYPE_COUNTER,
    TRACE_TYPE_SCOPE_ENTRY, TRACE_TYPE_SCOPE_EXIT,
};
use serde_json::{Map, Value};
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, OnceLock, PoisonError, RwLock, Weak};

use super::{ProviderHandle, TraceEventProvider, TraceEventSource};
use crate::capture::{self, ThreadEvents, TraceCollector};
use crate::discovery::{EndpointFactory, EndpointManagerPoll};
use crate::domain::{Pid, Tid, Timestamp, TraceError, TraceId};
use crate::endpoint::{Endpoint, EndpointNativeTraceReceiver, EndpointTraceMapping, NativeTracePacket};
use crate::trace_data::{Phase, TraceEvent};
use crate::transport::Transport;

type NameTable = HashMap<Pid, HashMap<TraceId, String>>;

pub struct NativeTraceProvider {
    poller: Option<Arc<EndpointManagerPoll>>,
    local: bool,
    sources: Mutex<Vec<Weak<NativeTraceSource>>>,
    names: RwLock<NameTable>,
}

impl NativeTraceProvider {
    /// Provider for processes found by `poller`. Registers the factories for
    /// the receiver and the trace mapping client on it.
    pub fn new(poller: Arc<EndpointManagerPoll>) -> Arc<Self> {
        let provider = Arc::new(Self::build(Some(Arc::clone(&poller)), false));
        poller.add_endpoint_factory(ENDPOINT_NATIVE_TRACE_SENDER, provider.receiver_factory());
        poller.add_endpoint_factory(ENDPOINT_TRACE_MAPPING, Self::mapping_factory());
        provider
    }

    /// The process-wide provider for events captured in this process.
    ///
    /// There is one, subscribed to the collector's drains for the life of
    /// the process.
    pub fn local() -> Arc<Self> {
        static LOCAL: OnceLock<Arc<NativeTraceProvider>> = OnceLock::new();
        Arc::clone(LOCAL.get_or_init(|| {
            let provider = Arc::new(Self::build(None, true));
            let listener = Arc::clone(&provider);
            TraceCollector::global().add_drain_listener(Arc::new(move |drained: &[ThreadEvents]| {
                listener.incoming(&NativeTracePacket::new(Pid::current(), drained.to_vec()));
            }));
            provider
        }))
    }

    fn build(poller: Option<Arc<EndpointManagerPoll>>, local: bool) -> Self {
        Self {
            poller,
            local,
            sources: Mutex::new(Vec::new()),
            names: RwLock::new(HashMap::new()),
        }
    }

    /// Factory creating a receiver that feeds this provider. Holds only a
    /// [`ProviderHandle`]; once the provider is gone it builds nothing.
    pub fn receiver_factory(self: &Arc<Self>) -> EndpointFactory {
        let handle = ProviderHandle::new(self);
        Arc::new(move |_transport: &Arc<dyn Transport>| {
            if !handle.is_alive() {
                return None;
            }
            let handle = handle.clone();
            let receiver = EndpointNativeTraceReceiver::new(move |packet| {
                if let Some(provider) = handle.get() {
                    provider.incoming(&packet);
                }
            });
            Some(receiver as Arc<dyn Endpoint>)
        })
    }

    pub fn mapping_factory() -> EndpointFactory {
        Arc::new(|_transport: &Arc<dyn Transport>| Some(EndpointTraceMapping::new() as Arc<dyn Endpoint>))
    }

    /// Copy a packet into every recording source.
    pub fn incoming(&self, packet: &NativeTracePacket) {
        for source in self.recording_sources() {
            source.append(packet.pid, &packet.events);
        }
    }

    fn recording_sources(&self) -> Vec<Arc<NativeTraceSource>> {
        let mut sources = self.sources.lock().unwrap_or_else(PoisonError::into_inner);
        sources.retain(|s| s.strong_count() > 0);
        sources.iter().filter_map(Weak::upgrade).filter(|s| s.is_recording()).collect()
    }

    /// Move this process's captured events into the recording sources. The
    /// drain listener registered by [`NativeTraceProvider::local`] delivers
    /// them.
    fn flush_local(&self) {
        if self.local {
            let _ = TraceCollector::global().drain();
        }
    }

    /// Merge the current names of every known process into the table and
    /// return a copy.
    fn refresh_names(&self) -> NameTable {
        let mut fetched: Vec<(Pid, HashMap<TraceId, String>)> = Vec::new();
        if self.local {
            fetched.push((Pid::current(), capture::trace_names()));
        }
        if let Some(poller) = &self.poller {
            for (address, peer) in poller.endpoints() {
                match peer.require::<EndpointTraceMapping>(ENDPOINT_TRACE_MAPPING).and_then(|e| e.mapping()) {
                    Ok(mapping) => {
                        fetched.extend(mapping.into_iter().map(|(pid, names)| (pid, names.into_iter().collect())));
                    }
                    Err(e) => debug!("No trace mapping from {address}: {e}"),
                }
            }
        }

        let mut names = self.names.write().unwrap_or_else(PoisonError::into_inner);
        for (pid, table) in fetched {
            names.entry(pid).or_default().extend(table);
        }
        names.clone()
    }
}

impl TraceEventProvider for NativeTraceProvider {
    fn make_source(self: Arc<Self>) -> Arc<dyn TraceEventSource> {
        let source = Arc::new(NativeTraceSource {
            provider: Arc::clone(&self),
            recording: AtomicBool::new(false),
            started: AtomicBool::new(false),
            draining: AtomicBool::new(false),
            data: Mutex::new(BTreeMap::new()),
        });
        self.sources.lock().unwrap_or_else(PoisonError::into_inner).push(Arc::downgrade(&source));
        source
    }
}

pub struct NativeTraceSource {
    provider: Arc<NativeTraceProvider>,
    recording: AtomicBool,
    started: AtomicBool,
    draining: AtomicBool,
    data: Mutex<BTreeMap<(Pid, Tid), Vec<RawTraceEvent>>>,
}

impl NativeTraceSource {
    pub fn is_recording(&self) -> bool {
        self.recording.load(Ordering::Acquire)
    }

    fn append(&self, pid: Pid, events: &BTreeMap<Tid, Vec<RawTraceEvent>>) {
        if !self.is_recording() {
            return;
        }
        let mut data = self.data.lock().unwrap_or_else(PoisonError::into_inner);
        for (tid, thread_events) in events {
            data.entry((pid, *tid)).or_default().extend_from_slice(thread_events);
        }
    }
}

/// Clears the reentrancy flag when a drain ends, however it ends.
struct DrainGuard<'a>(&'a AtomicBool);

impl Drop for DrainGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

impl TraceEventSource for NativeTraceSource {
    fn start_interval(&self) {
        self.provider.flush_local();
        self.data.lock().unwrap_or_else(PoisonError::into_inner).clear();
        self.started.store(true, Ordering::Release);
        self.recording.store(true, Ordering::Release);
    }

    fn stop_interval(&self) {
        if self.is_recording() {
            self.provider.flush_local();
        }
        self.recording.store(false, Ordering::Release);
    }

    fn finish_interval(&self) -> Result<Vec<TraceEvent>, TraceError> {
        if self.draining.swap(true, Ordering::AcqRel) {
            return Err(TraceError::ConcurrentDrain);
        }
        let _drain = DrainGuard(&self.draining);

        if !self.started.swap(false, Ordering::AcqRel) {
            return Ok(Vec::new());
        }
        self.stop_interval();

        let data = std::mem::take(&mut *self.data.lock().unwrap_or_else(PoisonError::into_inner));
        let names = self.provider.refresh_names();

        let mut events = Vec::with_capacity(data.values().map(Vec::len).sum());
        for ((pid, tid), raw) in data {
            events.extend(convert_events(pid, tid, &raw, names.get(&pid)));
        }
        accumulate_counters(&mut events);
        Ok(events)
    }

    fn work(&self) {
        if self.is_recording() {
            self.provider.flush_local();
        }
    }
}

/// Name shown for ids missing from the mapping
pub fn unknown_trace_name(trace_id: TraceId) -> String {
    format!("Unknown trace id {trace_id}")
}

/// Counter and series name of a counter's trace name
pub fn split_counter_name(name: &str) -> (&str, &str) {
    match name.split_once('/') {
        Some((counter, series)) if !series.is_empty() => (counter, series),
        _ => (name, "count"),
    }
}

/// Turn one thread's raw events into Trace Event Format records, in order.
/// Events of unknown type are skipped. Counter events carry only their own
/// series; [`accumulate_counters`] completes them.
pub fn convert_events(
    pid: Pid,
    tid: Tid,
    raw: &[RawTraceEvent],
    names: Option<&HashMap<TraceId, String>>,
) -> Vec<TraceEvent> {
    raw.iter()
        .filter_map(|event| {
            let trace_id = TraceId(event.trace_id);
            let name = names
                .and_then(|names| names.get(&trace_id).cloned())
                .unwrap_or_else(|| unknown_trace_name(trace_id));
            let ts = Timestamp(event.time_point_ns).as_micros_f64();
            match event.trace_type {
                TRACE_TYPE_SCOPE_ENTRY => Some(TraceEvent::begin(pid, tid, ts, name)),
                TRACE_TYPE_SCOPE_EXIT => Some(TraceEvent::end(pid, tid, ts, name)),
                TRACE_TYPE_COUNTER => {
                    let (counter, series) = split_counter_name(&name);
                    let mut args = Map::new();
                    args.insert(series.to_string(), Value::from(event.value));
                    Some(TraceEvent::counter(pid, tid, ts, counter, args))
                }
                other => MarkLevel::from_trace_type(other).map(|level| TraceEvent::mark(pid, tid, ts, name, level)),
            }
        })
        .collect()
}

/// Fill in the series of counter events, per process and counter, in
/// timestamp order: each event reports the latest value of every series seen
/// so far, and series first seen later take their next value.
pub fn accumulate_counters(events: &mut [TraceEvent]) {
    let mut order: Vec<usize> = (0..events.len()).filter(|&i| events[i].ph == Phase::Counter).collect();
    order.sort_by(|&a, &b| events[a].ts.total_cmp(&events[b].ts));

    let mut current: HashMap<(Pid, String), Map<String, Value>> = HashMap::new();
    for &i in &order {
        let event = &mut events[i];
        let values = current.entry((event.pid, event.name.clone())).or_default();
        values.extend(event.args.take().unwrap_or_default());
        event.args = Some(values.clone());
    }

    let mut later: HashMap<(Pid, String), Map<String, Value>> = HashMap::new();
    for &i in order.iter().rev() {
        let event = &mut events[i];
        let seen = later.entry((event.pid, event.name.clone())).or_default();
        let args = event.args.get_or_insert_with(Map::new);
        for (series, value) in seen.iter() {
            args.entry(series.clone()).or_insert_with(|| value.clone());
        }
        seen.clone_from(args);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use scopewire_common::TRACE_TYPE_MARK_THREAD;
    use serde_json::json;

    fn remote_provider() -> Arc<NativeTraceProvider> {
        Arc::new(NativeTraceProvider::build(None, false))
    }

    fn packet(pid: u32, tid: u32, events: Vec<RawTraceEvent>) -> NativeTracePacket {
        let mut packet = NativeTracePacket { pid: Pid(pid), events: BTreeMap::new() };
        packet.events.insert(Tid(tid), events);
        packet
    }

    #[test]
    fn test_convert_resolves_names_and_phases() {
        let mut names = HashMap::new();
        names.insert(TraceId(1), "draw".to_string());
        let raw = [
            RawTraceEvent::new(2_000, 1, TRACE_TYPE_SCOPE_ENTRY),
            RawTraceEvent::new(3_000, 1, TRACE_TYPE_SCOPE_EXIT),
            RawTraceEvent::new(4_000, 2, TRACE_TYPE_MARK_THREAD),
            RawTraceEvent::new(5_000, 2, 99),
        ];
        let events = convert_events(Pid(1), Tid(2), &raw, Some(&names));
        assert_eq!(events.len(), 3);
        assert_eq!(events[0].ph, Phase::Begin);
        assert_eq!(events[0].name, "draw");
        assert!((events[0].ts - 2.0).abs() < f64::EPSILON);
        assert_eq!(events[1].ph, Phase::End);
        assert_eq!(events[2].ph, Phase::Instant);
        assert_eq!(events[2].s.as_deref(), Some("t"));
        assert_eq!(events[2].name, "Unknown trace id 0x2");
    }

    #[test]
    fn test_split_counter_name() {
        assert_eq!(split_counter_name("queue/bytes"), ("queue", "bytes"));
        assert_eq!(split_counter_name("queue"), ("queue", "count"));
        assert_eq!(split_counter_name("queue/"), ("queue/", "count"));
    }

    #[test]
    fn test_counters_accumulate_per_process() {
        let mut names = HashMap::new();
        names.insert(TraceId(1), "queue/depth".to_string());
        names.insert(TraceId(2), "queue/bytes".to_string());
        // The second thread's sample lies between the first thread's two.
        let mut events = convert_events(
            Pid(1),
            Tid(10),
            &[RawTraceEvent::counter(1_000, 1, 3), RawTraceEvent::counter(3_000, 1, 5)],
            Some(&names),
        );
        events.extend(convert_events(Pid(1), Tid(11), &[RawTraceEvent::counter(2_000, 2, 10)], Some(&names)));
        events.extend(convert_events(Pid(2), Tid(20), &[RawTraceEvent::counter(1_500, 1, 99)], Some(&names)));
        accumulate_counters(&mut events);

        let args: Vec<Value> = events.iter().map(|e| Value::Object(e.args.clone().unwrap())).collect();
        assert!(events.iter().all(|e| e.ph == Phase::Counter && e.name == "queue"));
        assert_eq!(args[0], json!({"depth": 3, "bytes": 10}));
        assert_eq!(args[1], json!({"depth": 5, "bytes": 10}));
        assert_eq!(args[2], json!({"depth": 3, "bytes": 10}));
        assert_eq!(args[3], json!({"depth": 99}));
    }

    #[test]
    fn test_finish_without_start_is_empty() {
        let source = remote_provider().make_source();
        assert!(source.finish_interval().unwrap().is_empty());
    }

    #[test]
    fn test_only_recording_sources_receive_packets() {
        let provider = remote_provider();
        let early = Arc::clone(&provider).make_source();
        early.start_interval();
        provider.incoming(&packet(7, 8, vec![RawTraceEvent::new(1, 1, TRACE_TYPE_SCOPE_ENTRY)]));
        early.stop_interval();

        let late = Arc::clone(&provider).make_source();
        late.start_interval();
        provider.incoming(&packet(7, 8, vec![RawTraceEvent::new(2, 1, TRACE_TYPE_SCOPE_EXIT)]));

        assert_eq!(early.finish_interval().unwrap().len(), 1);
        let late_events = late.finish_interval().unwrap();
        assert_eq!(late_events.len(), 1);
        assert_eq!(late_events[0].ph, Phase::End);
        assert!(late.finish_interval().unwrap().is_empty());
    }

    #[test]
    fn test_concurrent_drain_rejected() {
        let provider = remote_provider();
        let source = Arc::new(NativeTraceSource {
            provider,
            recording: AtomicBool::new(false),
            started: AtomicBool::new(true),
            draining: AtomicBool::new(true),
            data: Mutex::new(BTreeMap::new()),
        });
        assert!(matches!(source.finish_interval(), Err(TraceError::ConcurrentDrain)));
    }

    #[test]
    fn test_dangling_factory_yields_none() {
        use crate::transport::{TransportFactory, TransportLoopbackFactory};

        let provider = remote_provider();
        let factory = provider.receiver_factory();
        let loopback = TransportLoopbackFactory::new();
        let server = loopback.serve().unwrap();
        let client = loopback.connect(&server.address()).unwrap();

        assert!(factory(&client).is_some());
        drop(provider);
        assert!(factory(&client).is_none());
    }
}
