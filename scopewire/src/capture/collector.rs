//! Per-thread event buffers
//!
//! Each tracing thread owns the sending half of a bounded channel; the
//! collector keeps the receiving halves. Pushing is a lock-free `try_send`
//! that drops the event when the buffer is full. When a thread exits its
//! receiver moves to the orphan list and is drained one last time.
//!
//! Several consumers may drain the same collector (the native sender of an
//! exposed process and the in-process provider). Drain listeners see every
//! drained batch no matter who drained it, in drain order.

use crossbeam_channel::{bounded, Receiver, Sender};
use scopewire_common::{RawTraceEvent, DEFAULT_RINGBUFFER_SIZE};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, OnceLock, PoisonError, RwLock};

use crate::domain::Tid;

/// Events drained from one thread, in program order
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ThreadEvents {
    pub tid: Tid,
    pub events: Vec<RawTraceEvent>,
}

/// Called with every non-empty drained batch
pub type DrainListener = Arc<dyn Fn(&[ThreadEvents]) + Send + Sync>;

pub struct TraceCollector {
    ringbuffer_size: AtomicUsize,
    live: Mutex<BTreeMap<Tid, Receiver<RawTraceEvent>>>,
    orphaned: Mutex<Vec<(Tid, Receiver<RawTraceEvent>)>>,
    listeners: RwLock<Vec<DrainListener>>,
    draining: Mutex<()>,
}

impl Default for TraceCollector {
    fn default() -> Self {
        Self {
            ringbuffer_size: AtomicUsize::new(DEFAULT_RINGBUFFER_SIZE),
            live: Mutex::new(BTreeMap::new()),
            orphaned: Mutex::new(Vec::new()),
            listeners: RwLock::new(Vec::new()),
            draining: Mutex::new(()),
        }
    }
}

impl std::fmt::Debug for TraceCollector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TraceCollector")
            .field("ringbuffer_size", &self.ringbuffer_size())
            .field("live_threads", &self.live_threads())
            .finish_non_exhaustive()
    }
}

impl TraceCollector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn global() -> &'static TraceCollector {
        static GLOBAL: OnceLock<TraceCollector> = OnceLock::new();
        GLOBAL.get_or_init(TraceCollector::new)
    }

    pub fn ringbuffer_size(&self) -> usize {
        self.ringbuffer_size.load(Ordering::Relaxed)
    }

    /// Capacity of buffers created after this call
    pub fn set_ringbuffer_size(&self, size: usize) {
        self.ringbuffer_size.store(size.max(1), Ordering::Relaxed);
    }

    /// Create the buffer for `tid`. A thread id reused by the kernel retires
    /// the previous buffer first.
    pub fn register(&self, tid: Tid) -> Sender<RawTraceEvent> {
        let (tx, rx) = bounded(self.ringbuffer_size());
        let previous = self.live.lock().unwrap_or_else(PoisonError::into_inner).insert(tid, rx);
        if let Some(previous) = previous {
            self.orphaned.lock().unwrap_or_else(PoisonError::into_inner).push((tid, previous));
        }
        tx
    }

    /// Called when a thread exits; its remaining events stay drainable.
    pub fn retire(&self, tid: Tid) {
        let receiver = self.live.lock().unwrap_or_else(PoisonError::into_inner).remove(&tid);
        if let Some(receiver) = receiver {
            self.orphaned.lock().unwrap_or_else(PoisonError::into_inner).push((tid, receiver));
        }
    }

    /// Hand every future drained batch to `listener` as well.
    pub fn add_drain_listener(&self, listener: DrainListener) {
        self.listeners.write().unwrap_or_else(PoisonError::into_inner).push(listener);
    }

    /// Take everything buffered so far. Threads without events are omitted.
    ///
    /// Drains are serialized and the listeners run before the next drain
    /// starts, so per-thread program order holds across drains.
    pub fn drain(&self) -> Vec<ThreadEvents> {
        let _draining = self.draining.lock().unwrap_or_else(PoisonError::into_inner);
        let drained = self.take_buffered();
        if !drained.is_empty() {
            let listeners = self.listeners.read().unwrap_or_else(PoisonError::into_inner).clone();
            for listener in listeners {
                listener(&drained);
            }
        }
        drained
    }

    fn take_buffered(&self) -> Vec<ThreadEvents> {
        let mut drained = Vec::new();

        let orphaned = std::mem::take(&mut *self.orphaned.lock().unwrap_or_else(PoisonError::into_inner));
        for (tid, receiver) in orphaned {
            let events: Vec<RawTraceEvent> = receiver.try_iter().collect();
            if !events.is_empty() {
                drained.push(ThreadEvents { tid, events });
            }
        }

        let live = self.live.lock().unwrap_or_else(PoisonError::into_inner);
        for (tid, receiver) in live.iter() {
            let events: Vec<RawTraceEvent> = receiver.try_iter().collect();
            if !events.is_empty() {
                drained.push(ThreadEvents { tid: *tid, events });
            }
        }
        drained
    }

    pub fn live_threads(&self) -> Vec<Tid> {
        self.live.lock().unwrap_or_else(PoisonError::into_inner).keys().copied().collect()
    }
}
