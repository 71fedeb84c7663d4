//! Streaming of native capture data
//!
//! The sender lives in the instrumented process. A background thread drains
//! the capture collector every few milliseconds and broadcasts the events to
//! every connected client of every server it is registered on. The
//! collector's drain listeners see the same events, so an in-process provider
//! keeps recording while the process is exposed. The receiver lives on the
//! consumer side and hands each packet to a callback, usually a provider's.

use log::debug;
use scopewire_common::{
    RawTraceEvent, ENDPOINT_NATIVE_TRACE_RECEIVER, ENDPOINT_NATIVE_TRACE_SENDER, SENDER_FLUSH_INTERVAL_MS,
};
use serde::{Deserialize, Serialize};
use std::any::Any;
use std::collections::BTreeMap;
use std::sync::{Arc, Weak};
use std::thread;
use std::time::Duration;

use super::{Endpoint, TransportSlot};
use crate::capture::{ThreadEvents, TraceCollector};
use crate::domain::{Pid, Tid, TransportError};
use crate::transport::{Data, Transport};

pub const SENDER_FLUSH_INTERVAL: Duration = Duration::from_millis(SENDER_FLUSH_INTERVAL_MS);

/// One drained batch of events from one process
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct NativeTracePacket {
    pub pid: Pid,
    pub events: BTreeMap<Tid, Vec<RawTraceEvent>>,
}

impl NativeTracePacket {
    pub fn new(pid: Pid, drained: Vec<ThreadEvents>) -> Self {
        let mut events: BTreeMap<Tid, Vec<RawTraceEvent>> = BTreeMap::new();
        for thread in drained {
            events.entry(thread.tid).or_default().extend(thread.events);
        }
        Self { pid, events }
    }

    pub fn is_empty(&self) -> bool {
        self.events.values().all(Vec::is_empty)
    }

    pub fn event_count(&self) -> usize {
        self.events.values().map(Vec::len).sum()
    }
}

pub struct EndpointNativeTraceSender {
    slot: TransportSlot,
}

impl EndpointNativeTraceSender {
    /// # Errors
    /// Returns an error if the flush thread cannot be spawned.
    pub fn new() -> Result<Arc<Self>, TransportError> {
        Self::with_interval(SENDER_FLUSH_INTERVAL)
    }

    /// # Errors
    /// Returns an error if the flush thread cannot be spawned.
    pub fn with_interval(interval: Duration) -> Result<Arc<Self>, TransportError> {
        let sender = Arc::new(Self { slot: TransportSlot::default() });
        let weak = Arc::downgrade(&sender);
        thread::Builder::new().name("scopewire-sender".to_string()).spawn(move || loop {
            thread::sleep(interval);
            let Some(sender) = weak.upgrade() else {
                break;
            };
            sender.flush();
        })?;
        Ok(sender)
    }

    /// Drain the collector and broadcast the events. Returns the number of
    /// events sent; nothing is drained while unattached.
    pub fn flush(&self) -> usize {
        let transports = self.slot.all();
        if transports.is_empty() {
            return 0;
        }
        let packet = NativeTracePacket::new(Pid::current(), TraceCollector::global().drain());
        if packet.is_empty() {
            return 0;
        }
        match serde_json::to_vec(&packet) {
            Ok(bytes) => {
                for transport in transports {
                    transport.broadcast(ENDPOINT_NATIVE_TRACE_RECEIVER, &bytes);
                }
                packet.event_count()
            }
            Err(e) => {
                debug!("Cannot encode trace packet: {e}");
                0
            }
        }
    }
}

impl Endpoint for EndpointNativeTraceSender {
    fn name(&self) -> &str {
        ENDPOINT_NATIVE_TRACE_SENDER
    }

    fn set_transport(&self, transport: Weak<dyn Transport>) {
        self.slot.attach(transport);
    }

    fn as_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }
}

type PacketCallback = Box<dyn Fn(NativeTracePacket) + Send + Sync>;

pub struct EndpointNativeTraceReceiver {
    callback: PacketCallback,
}

impl EndpointNativeTraceReceiver {
    pub fn new(callback: impl Fn(NativeTracePacket) + Send + Sync + 'static) -> Arc<Self> {
        Arc::new(Self { callback: Box::new(callback) })
    }
}

impl Endpoint for EndpointNativeTraceReceiver {
    fn name(&self) -> &str {
        ENDPOINT_NATIVE_TRACE_RECEIVER
    }

    fn unsolicited(&self, _transport: &dyn Transport, data: &[u8]) -> Option<Data> {
        match serde_json::from_slice::<NativeTracePacket>(data) {
            Ok(packet) => (self.callback)(packet),
            Err(e) => debug!("Ignoring malformed trace packet: {e}"),
        }
        None
    }

    fn as_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::loopback::TransportLoopbackFactory;
    use crate::transport::TransportFactory;
    use scopewire_common::TRACE_TYPE_SCOPE_ENTRY;
    use std::sync::Mutex;

    #[test]
    fn test_packet_groups_by_thread() {
        let drained = vec![
            ThreadEvents { tid: Tid(2), events: vec![RawTraceEvent::new(1, 1, TRACE_TYPE_SCOPE_ENTRY)] },
            ThreadEvents { tid: Tid(2), events: vec![RawTraceEvent::new(2, 1, TRACE_TYPE_SCOPE_ENTRY)] },
        ];
        let packet = NativeTracePacket::new(Pid(1), drained);
        assert_eq!(packet.events.len(), 1);
        assert_eq!(packet.event_count(), 2);
    }

    #[test]
    fn test_receiver_gets_broadcast_packet() {
        let factory = TransportLoopbackFactory::new();
        let server = factory.serve().unwrap();
        let client = factory.connect(&server.address()).unwrap();

        let received = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&received);
        client.add_endpoint(EndpointNativeTraceReceiver::new(move |packet| sink.lock().unwrap().push(packet)));

        let mut packet = NativeTracePacket { pid: Pid(77), events: BTreeMap::new() };
        packet.events.insert(Tid(5), vec![RawTraceEvent::new(10, 3, TRACE_TYPE_SCOPE_ENTRY)]);
        server.broadcast(ENDPOINT_NATIVE_TRACE_RECEIVER, &serde_json::to_vec(&packet).unwrap());

        assert_eq!(received.lock().unwrap().as_slice(), &[packet]);
    }
}
