//! # Shared Data Structures (Instrumented Process ↔ Consumer)
//!
//! Defines the raw capture record and the constants shared between the
//! instrumented side (the capture engine and the endpoints it exposes) and the
//! consumer side (providers that turn raw records into trace events). The
//! record uses `#[repr(C)]` so its layout stays fixed for anything that copies
//! it around in bulk.
//!
//! ## Key Types
//!
//! - [`RawTraceEvent`] - One captured scope entry, scope exit, mark or counter sample
//! - [`MarkLevel`] - Visibility of a mark event in the viewer
//!
//! With the `user` feature enabled, the types derive `serde` traits so they can
//! travel over the endpoint wire as JSON.

#![no_std]

// ============================================================================
// Event Type Constants
// ============================================================================

/// **Scope Entry**: a traced scope was entered on the recording thread
///
/// Paired with: `TRACE_TYPE_SCOPE_EXIT`
pub const TRACE_TYPE_SCOPE_ENTRY: u8 = 1;

/// **Scope Exit**: a traced scope was left on the recording thread
///
/// Paired with: `TRACE_TYPE_SCOPE_ENTRY`
pub const TRACE_TYPE_SCOPE_EXIT: u8 = 2;

/// **Mark**: zero-duration annotation visible across all processes
pub const TRACE_TYPE_MARK_GLOBAL: u8 = 3;

/// **Mark**: zero-duration annotation visible on the whole process track
pub const TRACE_TYPE_MARK_PROCESS: u8 = 4;

/// **Mark**: zero-duration annotation visible on the thread track only
pub const TRACE_TYPE_MARK_THREAD: u8 = 5;

/// **Counter**: one sample of a counter series, carried in `value`
///
/// The trace name is `counter/series`; a name without a series belongs to
/// the series `count`.
pub const TRACE_TYPE_COUNTER: u8 = 6;

// ============================================================================
// Endpoint Names
// ============================================================================

/// Lists the endpoints registered on a connection
pub const ENDPOINT_INTROSPECT: &str = "introspect";

/// Reports process name, pid and thread names
pub const ENDPOINT_PROCESS_INFO: &str = "process_info";

/// Reports the trace id → name mapping of a process
pub const ENDPOINT_TRACE_MAPPING: &str = "trace_mapping";

/// Server side of the native capture stream
pub const ENDPOINT_NATIVE_TRACE_SENDER: &str = "native_trace_sender";

/// Client side of the native capture stream
pub const ENDPOINT_NATIVE_TRACE_RECEIVER: &str = "native_trace_receiver";

/// Remote enable/disable of capture
pub const ENDPOINT_TRACE_CONFIGURATOR: &str = "trace_configurator";

// ============================================================================
// Defaults
// ============================================================================

/// Events each thread can buffer before further events are dropped
pub const DEFAULT_RINGBUFFER_SIZE: usize = 10_000;

/// Suffix of the abstract unix socket name, `@<pid><suffix>`
pub const UNIX_SOCKET_SUFFIX: &str = "_scopewire";

/// TCP port the viewer connects to
pub const DEFAULT_CATAPULT_PORT: u16 = 9222;

/// Deadline applied by the built-in endpoint clients
pub const DEFAULT_REQUEST_TIMEOUT_MS: u64 = 200;

/// Period of the native sender's drain-and-broadcast loop
pub const SENDER_FLUSH_INTERVAL_MS: u64 = 10;

// ============================================================================
// Data Structures
// ============================================================================

/// One captured event as stored in a thread's buffer
///
/// The thread id is not stored per event: buffers are per thread and the
/// owning thread id travels with the buffer.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "user", derive(serde::Serialize, serde::Deserialize))]
pub struct RawTraceEvent {
    /// Wall-clock time in nanoseconds since the Unix epoch
    pub time_point_ns: u64,
    /// Sample of a `TRACE_TYPE_COUNTER` event, zero otherwise
    #[cfg_attr(feature = "user", serde(default))]
    pub value: i64,
    /// Process-scoped trace id, resolved to a name at drain time
    pub trace_id: u32,
    /// One of the `TRACE_TYPE_*` constants
    pub trace_type: u8,
}

impl RawTraceEvent {
    pub const fn new(time_point_ns: u64, trace_id: u32, trace_type: u8) -> Self {
        Self { time_point_ns, value: 0, trace_id, trace_type }
    }

    pub const fn counter(time_point_ns: u64, trace_id: u32, value: i64) -> Self {
        Self { time_point_ns, value, trace_id, trace_type: TRACE_TYPE_COUNTER }
    }

    /// Mark level of this event, `None` for scope entries and exits
    pub const fn mark_level(&self) -> Option<MarkLevel> {
        MarkLevel::from_trace_type(self.trace_type)
    }
}

/// Visibility scope of a mark event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "user", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "user", serde(rename_all = "lowercase"))]
pub enum MarkLevel {
    Thread,
    Process,
    Global,
}

impl MarkLevel {
    pub const fn trace_type(self) -> u8 {
        match self {
            MarkLevel::Thread => TRACE_TYPE_MARK_THREAD,
            MarkLevel::Process => TRACE_TYPE_MARK_PROCESS,
            MarkLevel::Global => TRACE_TYPE_MARK_GLOBAL,
        }
    }

    pub const fn from_trace_type(trace_type: u8) -> Option<Self> {
        match trace_type {
            TRACE_TYPE_MARK_THREAD => Some(MarkLevel::Thread),
            TRACE_TYPE_MARK_PROCESS => Some(MarkLevel::Process),
            TRACE_TYPE_MARK_GLOBAL => Some(MarkLevel::Global),
            _ => None,
        }
    }

    /// Instant-event scope letter used by the Trace Event Format
    pub const fn scope_letter(self) -> &'static str {
        match self {
            MarkLevel::Thread => "t",
            MarkLevel::Process => "p",
            MarkLevel::Global => "g",
        }
    }
}
