//! Aggregator over registered providers

use log::debug;
use std::sync::{Arc, PoisonError, RwLock};
use std::thread;
use std::time::Duration;

use crate::discovery::LogHook;
use crate::provider::{TraceEventProvider, TraceEventSource};
use crate::trace_data::TraceEvent;

/// Interval between `work` calls while [`CatapultBackend::record_for`] waits
const WORK_INTERVAL: Duration = Duration::from_millis(10);

#[derive(Default)]
pub struct CatapultBackend {
    providers: RwLock<Vec<Arc<dyn TraceEventProvider>>>,
    logger: RwLock<Option<LogHook>>,
}

impl CatapultBackend {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Add a provider. Sessions started afterwards include it; output keeps
    /// registration order.
    pub fn add_provider(&self, provider: Arc<dyn TraceEventProvider>) {
        self.providers.write().unwrap_or_else(PoisonError::into_inner).push(provider);
    }

    pub fn provider_count(&self) -> usize {
        self.providers.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn set_logger(&self, hook: LogHook) {
        *self.logger.write().unwrap_or_else(PoisonError::into_inner) = Some(hook);
    }

    /// Make one source per provider and start all of them.
    pub fn start_session(self: &Arc<Self>) -> RecordingSession {
        let providers = self.providers.read().unwrap_or_else(PoisonError::into_inner).clone();
        let sources: Vec<Arc<dyn TraceEventSource>> = providers.into_iter().map(|p| p.make_source()).collect();
        for source in &sources {
            source.start_interval();
        }
        self.log(&format!("Recording started with {} sources", sources.len()));
        RecordingSession { backend: Arc::clone(self), sources }
    }

    /// Record a fixed window on the calling thread.
    pub fn record_for(self: &Arc<Self>, window: Duration) -> Vec<TraceEvent> {
        let session = self.start_session();
        let mut remaining = window;
        while !remaining.is_zero() {
            let step = remaining.min(WORK_INTERVAL);
            thread::sleep(step);
            remaining -= step;
            session.work();
        }
        session.finish()
    }

    fn log(&self, msg: &str) {
        debug!("{msg}");
        let hook = self.logger.read().unwrap_or_else(PoisonError::into_inner).clone();
        if let Some(hook) = hook {
            hook(msg);
        }
    }
}

/// Sources of one recording window
pub struct RecordingSession {
    backend: Arc<CatapultBackend>,
    sources: Vec<Arc<dyn TraceEventSource>>,
}

impl RecordingSession {
    pub fn work(&self) {
        for source in &self.sources {
            source.work();
        }
    }

    pub fn stop(&self) {
        for source in &self.sources {
            source.stop_interval();
        }
    }

    /// Stop every source, then drain every source, concatenating in
    /// provider order. A failing source is logged and skipped.
    pub fn finish(self) -> Vec<TraceEvent> {
        self.stop();
        let mut events = Vec::new();
        for (index, source) in self.sources.iter().enumerate() {
            match source.finish_interval() {
                Ok(mut batch) => events.append(&mut batch),
                Err(e) => self.backend.log(&format!("Provider {index} failed: {e}")),
            }
        }
        self.backend.log(&format!("Recording finished with {} events", events.len()));
        events
    }
}
