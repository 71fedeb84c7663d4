//! Trace capture engine
//!
//! The instrumented side of scopewire. Application threads call
//! [`scope_entry`], [`scope_exit`], [`mark_event`] and [`counter_event`] (or
//! the [`TraceScope`] guard and the `trace_scope!` / `trace_mark!` /
//! `trace_counter!` macros); each call appends a [`RawTraceEvent`] to the
//! calling thread's own buffer.
//!
//! ## Hot Path
//!
//! A capture call touches only thread-local state and two atomics: the
//! process-wide master switch and the thread's own flag. No process-wide lock
//! is taken and nothing can fail; a disabled thread or a full buffer simply
//! drops the event.
//!
//! Each thread registers lazily on its first capture call, taking its initial
//! enabled state from the new-thread default. On thread exit the buffer is
//! retired to the collector's orphan list so its last events are not lost.
//!
//! ## Shared State
//!
//! - [`names`]: trace id → name mapping, resolved at drain time
//! - [`configurator`]: process, thread and new-thread switches
//! - [`collector`]: receiving side of every thread buffer

pub mod collector;
pub mod configurator;
pub mod names;

use crossbeam_channel::Sender;
use scopewire_common::{MarkLevel, RawTraceEvent, TRACE_TYPE_COUNTER, TRACE_TYPE_SCOPE_ENTRY, TRACE_TYPE_SCOPE_EXIT};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::domain::{Tid, Timestamp, TraceId};
use crate::process_lookup;

pub use collector::{ThreadEvents, TraceCollector};
pub use configurator::TraceConfigurator;
pub use names::{clear_trace_names, next_trace_id, register_trace_name, set_trace_name, trace_name, trace_names};

/// Kernel id of the calling thread
#[allow(unsafe_code, clippy::cast_possible_truncation, clippy::cast_sign_loss)]
pub fn current_tid() -> Tid {
    // SAFETY: gettid takes no arguments and always succeeds.
    let tid = unsafe { libc::syscall(libc::SYS_gettid) };
    Tid(tid as u32)
}

/// Registration of one tracing thread
struct ThreadHandle {
    tid: Tid,
    enabled: Arc<AtomicBool>,
    sender: Sender<RawTraceEvent>,
    configurator: Arc<TraceConfigurator>,
}

impl ThreadHandle {
    fn register() -> Self {
        let tid = current_tid();
        let configurator = TraceConfigurator::global();
        let enabled = configurator.register_thread(tid);
        let sender = TraceCollector::global().register(tid);
        Self { tid, enabled, sender, configurator }
    }

    fn record(&self, trace_id: TraceId, trace_type: u8, value: i64) {
        if !self.configurator.process_state() || !self.enabled.load(Ordering::Relaxed) {
            return;
        }
        let mut event = RawTraceEvent::new(Timestamp::now().0, trace_id.0, trace_type);
        event.value = value;
        // Full buffer: drop.
        let _ = self.sender.try_send(event);
    }
}

impl Drop for ThreadHandle {
    fn drop(&mut self) {
        self.configurator.unregister_thread(self.tid);
        TraceCollector::global().retire(self.tid);
    }
}

thread_local! {
    static THREAD: ThreadHandle = ThreadHandle::register();
}

fn record(trace_id: TraceId, trace_type: u8, value: i64) {
    // Fails only while the thread is being torn down.
    let _ = THREAD.try_with(|thread| thread.record(trace_id, trace_type, value));
}

pub fn scope_entry(trace_id: TraceId) {
    record(trace_id, TRACE_TYPE_SCOPE_ENTRY, 0);
}

pub fn scope_exit(trace_id: TraceId) {
    record(trace_id, TRACE_TYPE_SCOPE_EXIT, 0);
}

/// Zero-duration annotation
pub fn mark_event(trace_id: TraceId, level: MarkLevel) {
    record(trace_id, level.trace_type(), 0);
}

/// Sample of the counter series named by `trace_id` (`counter/series`, or
/// just `counter` for its `count` series)
pub fn counter_event(trace_id: TraceId, value: i64) {
    record(trace_id, TRACE_TYPE_COUNTER, value);
}

/// Switch capture for the calling thread, returning the previous state.
pub fn set_thread_state(enabled: bool) -> bool {
    THREAD.try_with(|thread| thread.enabled.swap(enabled, Ordering::Relaxed)).unwrap_or(false)
}

pub fn thread_state() -> bool {
    THREAD.try_with(|thread| thread.enabled.load(Ordering::Relaxed)).unwrap_or(false)
}

/// Master switch for the whole process, returning the previous state.
pub fn set_process_state(enabled: bool) -> bool {
    TraceConfigurator::global().set_process_state(enabled)
}

pub fn process_state() -> bool {
    TraceConfigurator::global().process_state()
}

/// Initial state of threads that start tracing after this call.
pub fn set_new_thread_state(enabled: bool) -> bool {
    TraceConfigurator::global().set_new_thread_state(enabled)
}

/// Buffer capacity for threads that start tracing after this call.
pub fn set_ringbuffer_size(size: usize) {
    TraceCollector::global().set_ringbuffer_size(size);
}

/// Give the calling thread a human name for viewers.
pub fn set_thread_name(name: impl Into<String>) {
    process_lookup::name_thread(current_tid(), name);
}

/// Scope entry on creation, scope exit on drop
#[must_use = "the scope ends when the guard is dropped"]
#[derive(Debug)]
pub struct TraceScope {
    trace_id: TraceId,
}

impl TraceScope {
    pub fn new(trace_id: TraceId) -> Self {
        scope_entry(trace_id);
        Self { trace_id }
    }

    /// Allocates a new trace id on every call; prefer `trace_scope!` in
    /// code that runs repeatedly.
    pub fn named(name: impl Into<String>) -> Self {
        Self::new(register_trace_name(name))
    }
}

impl Drop for TraceScope {
    fn drop(&mut self) {
        scope_exit(self.trace_id);
    }
}

/// Sets the calling thread's state and restores the previous one on drop
#[must_use = "the previous state is restored when the guard is dropped"]
#[derive(Debug)]
pub struct ThreadStateGuard {
    previous: bool,
}

impl ThreadStateGuard {
    pub fn new(enabled: bool) -> Self {
        Self { previous: set_thread_state(enabled) }
    }
}

impl Drop for ThreadStateGuard {
    fn drop(&mut self) {
        set_thread_state(self.previous);
    }
}

/// Sets the process state and restores the previous one on drop
#[must_use = "the previous state is restored when the guard is dropped"]
#[derive(Debug)]
pub struct ProcessStateGuard {
    previous: bool,
}

impl ProcessStateGuard {
    pub fn new(enabled: bool) -> Self {
        Self { previous: set_process_state(enabled) }
    }
}

impl Drop for ProcessStateGuard {
    fn drop(&mut self) {
        set_process_state(self.previous);
    }
}

/// Trace the rest of the enclosing block under `name`.
///
/// The trace id is allocated once per call site.
#[macro_export]
macro_rules! trace_scope {
    ($name:expr) => {
        let _trace_scope_guard = $crate::capture::TraceScope::new({
            static TRACE_ID: ::std::sync::OnceLock<$crate::domain::TraceId> = ::std::sync::OnceLock::new();
            *TRACE_ID.get_or_init(|| $crate::capture::register_trace_name($name))
        });
    };
}

/// Emit a mark event named `name` at `level`.
#[macro_export]
macro_rules! trace_mark {
    ($level:expr, $name:expr) => {{
        static TRACE_ID: ::std::sync::OnceLock<$crate::domain::TraceId> = ::std::sync::OnceLock::new();
        $crate::capture::mark_event(
            *TRACE_ID.get_or_init(|| $crate::capture::register_trace_name($name)),
            $level,
        );
    }};
}

/// Record `value` for a counter, or for one named series of it.
///
/// `trace_counter!("queue", len)` samples the series `count`;
/// `trace_counter!("queue", "bytes", n)` samples the series `bytes`.
#[macro_export]
macro_rules! trace_counter {
    ($name:expr, $value:expr) => {{
        static TRACE_ID: ::std::sync::OnceLock<$crate::domain::TraceId> = ::std::sync::OnceLock::new();
        $crate::capture::counter_event(
            *TRACE_ID.get_or_init(|| $crate::capture::register_trace_name($name)),
            $value,
        );
    }};
    ($name:expr, $series:expr, $value:expr) => {{
        static TRACE_ID: ::std::sync::OnceLock<$crate::domain::TraceId> = ::std::sync::OnceLock::new();
        $crate::capture::counter_event(
            *TRACE_ID.get_or_init(|| $crate::capture::register_trace_name(format!("{}/{}", $name, $series))),
            $value,
        );
    }};
}

#[cfg(test)]
mod tests {
    use super::*;

    fn own_events(tid: Tid) -> Vec<RawTraceEvent> {
        TraceCollector::global()
            .drain()
            .into_iter()
            .filter(|t| t.tid == tid)
            .flat_map(|t| t.events)
            .collect()
    }

    // Tests run on fresh threads so their buffers start empty. No other unit
    // test drains the global collector.
    #[test]
    fn test_guard_restores_thread_state() {
        std::thread::spawn(|| {
            assert!(thread_state());
            {
                let _off = ThreadStateGuard::new(false);
                assert!(!thread_state());
            }
            assert!(thread_state());
        })
        .join()
        .unwrap();
    }

    #[test]
    fn test_scope_guard_emits_entry_then_exit() {
        let events = std::thread::spawn(|| {
            let tid = current_tid();
            {
                let _scope = TraceScope::new(TraceId(0xa11));
            }
            own_events(tid)
        })
        .join()
        .unwrap();
        let own: Vec<u8> = events.iter().filter(|e| e.trace_id == 0xa11).map(|e| e.trace_type).collect();
        assert_eq!(own, vec![TRACE_TYPE_SCOPE_ENTRY, TRACE_TYPE_SCOPE_EXIT]);
    }

    #[test]
    fn test_counter_event_stores_value() {
        let events = std::thread::spawn(|| {
            let tid = current_tid();
            counter_event(TraceId(0xc0c), 42);
            own_events(tid)
        })
        .join()
        .unwrap();
        let sample = events.iter().find(|e| e.trace_id == 0xc0c).unwrap();
        assert_eq!(sample.trace_type, TRACE_TYPE_COUNTER);
        assert_eq!(sample.value, 42);
    }

    #[test]
    fn test_current_tid_differs_between_threads() {
        let here = current_tid();
        let there = std::thread::spawn(current_tid).join().unwrap();
        assert_ne!(here, there);
        assert_ne!(here.0, 0);
    }
}
