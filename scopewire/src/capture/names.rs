//! Process-wide trace id → name mapping
//!
//! Written once per distinct scope name, read at drain time. A short-lived
//! `RwLock` is enough; the capture hot path never touches it.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{OnceLock, PoisonError, RwLock};

use crate::domain::TraceId;

/// First id handed out by [`next_trace_id`]; lower ids are left for callers
/// that pick their own.
pub const AUTO_TRACE_ID_BASE: u32 = 0x1000_0000;

static NEXT_ID: AtomicU32 = AtomicU32::new(AUTO_TRACE_ID_BASE);

fn names() -> &'static RwLock<HashMap<TraceId, String>> {
    static NAMES: OnceLock<RwLock<HashMap<TraceId, String>>> = OnceLock::new();
    NAMES.get_or_init(|| RwLock::new(HashMap::new()))
}

/// Set or replace the name of `id`. Names may repeat across ids.
pub fn set_trace_name(id: TraceId, name: impl Into<String>) {
    names().write().unwrap_or_else(PoisonError::into_inner).insert(id, name.into());
}

pub fn trace_name(id: TraceId) -> Option<String> {
    names().read().unwrap_or_else(PoisonError::into_inner).get(&id).cloned()
}

/// Snapshot of the whole mapping
pub fn trace_names() -> HashMap<TraceId, String> {
    names().read().unwrap_or_else(PoisonError::into_inner).clone()
}

/// Forget every name. Only meant for test isolation.
pub fn clear_trace_names() {
    names().write().unwrap_or_else(PoisonError::into_inner).clear();
}

/// A fresh id, never handed out before in this process
pub fn next_trace_id() -> TraceId {
    TraceId(NEXT_ID.fetch_add(1, Ordering::Relaxed))
}

/// Allocate an id and name it in one step
pub fn register_trace_name(name: impl Into<String>) -> TraceId {
    let id = next_trace_id();
    set_trace_name(id, name);
    id
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_register_allocates_unique_ids() {
        let a = register_trace_name("same");
        let b = register_trace_name("same");
        assert_ne!(a, b);
        assert!(a.0 >= AUTO_TRACE_ID_BASE);
        assert_eq!(trace_name(a).as_deref(), Some("same"));
        assert_eq!(trace_name(b).as_deref(), Some("same"));
    }

    #[test]
    fn test_rename_overwrites() {
        let id = TraceId(0x51);
        set_trace_name(id, "before");
        set_trace_name(id, "after");
        assert_eq!(trace_name(id).as_deref(), Some("after"));
        assert_eq!(trace_names().get(&id).map(String::as_str), Some("after"));
    }
}
