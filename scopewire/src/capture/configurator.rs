//! Enable/disable switches for capture
//!
//! Three levels decide whether an event is recorded:
//! - the process state, a master switch
//! - the state of the recording thread
//! - the new-thread default, copied into a thread's state when it first traces
//!
//! Every setter returns the previous value so callers can restore it.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, OnceLock, PoisonError};

use crate::domain::Tid;

#[derive(Debug)]
pub struct TraceConfigurator {
    process_state: AtomicBool,
    new_thread_state: AtomicBool,
    threads: Mutex<BTreeMap<Tid, Arc<AtomicBool>>>,
}

impl Default for TraceConfigurator {
    fn default() -> Self {
        Self {
            process_state: AtomicBool::new(true),
            new_thread_state: AtomicBool::new(true),
            threads: Mutex::new(BTreeMap::new()),
        }
    }
}

impl TraceConfigurator {
    /// A standalone configurator, independent of the process-wide one
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// The configurator consulted by the capture hot path
    pub fn global() -> Arc<Self> {
        static GLOBAL: OnceLock<Arc<TraceConfigurator>> = OnceLock::new();
        Arc::clone(GLOBAL.get_or_init(TraceConfigurator::new))
    }

    pub fn process_state(&self) -> bool {
        self.process_state.load(Ordering::Relaxed)
    }

    pub fn set_process_state(&self, state: bool) -> bool {
        self.process_state.swap(state, Ordering::Relaxed)
    }

    pub fn new_thread_state(&self) -> bool {
        self.new_thread_state.load(Ordering::Relaxed)
    }

    /// Affects only threads that register afterwards.
    pub fn set_new_thread_state(&self, state: bool) -> bool {
        self.new_thread_state.swap(state, Ordering::Relaxed)
    }

    /// `None` if the thread never traced or has exited
    pub fn thread_state(&self, tid: Tid) -> Option<bool> {
        self.lock().get(&tid).map(|state| state.load(Ordering::Relaxed))
    }

    /// Switch a known thread; `None` leaves unknown threads alone.
    pub fn set_thread_state(&self, tid: Tid, state: bool) -> Option<bool> {
        self.lock().get(&tid).map(|flag| flag.swap(state, Ordering::Relaxed))
    }

    pub fn thread_states(&self) -> BTreeMap<Tid, bool> {
        self.lock().iter().map(|(tid, state)| (*tid, state.load(Ordering::Relaxed))).collect()
    }

    /// Register a thread and hand back the flag its hot path reads.
    pub fn register_thread(&self, tid: Tid) -> Arc<AtomicBool> {
        let flag = Arc::new(AtomicBool::new(self.new_thread_state()));
        self.lock().insert(tid, Arc::clone(&flag));
        flag
    }

    pub fn unregister_thread(&self, tid: Tid) {
        self.lock().remove(&tid);
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BTreeMap<Tid, Arc<AtomicBool>>> {
        self.threads.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_setters_return_previous_value() {
        let config = TraceConfigurator::new();
        assert!(config.set_process_state(false));
        assert!(!config.set_process_state(true));
        assert!(config.set_new_thread_state(false));
        assert!(!config.new_thread_state());
    }

    #[test]
    fn test_new_thread_default_applies_at_registration() {
        let config = TraceConfigurator::new();
        let early = config.register_thread(Tid(1));
        config.set_new_thread_state(false);
        let late = config.register_thread(Tid(2));
        assert!(early.load(Ordering::Relaxed));
        assert!(!late.load(Ordering::Relaxed));
    }

    #[test]
    fn test_thread_state_round_trip() {
        let config = TraceConfigurator::new();
        let flag = config.register_thread(Tid(10));
        assert_eq!(config.set_thread_state(Tid(10), false), Some(true));
        assert!(!flag.load(Ordering::Relaxed));
        assert_eq!(config.set_thread_state(Tid(11), false), None);
        config.unregister_thread(Tid(10));
        assert_eq!(config.thread_state(Tid(10)), None);
        assert!(config.thread_states().is_empty());
    }
}
