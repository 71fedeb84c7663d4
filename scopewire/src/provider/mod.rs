//! Trace event providers and sources
//!
//! A [`TraceEventProvider`] is a factory of [`TraceEventSource`]s. The
//! aggregator asks every provider for a fresh source per recording window and
//! drives it through `start_interval` → `stop_interval` → `finish_interval`.
//! Older sources may still be draining while new ones record.
//!
//! Built-in providers:
//! - [`native::NativeTraceProvider`]: scope events from the capture engine,
//!   locally or streamed from discovered processes
//! - [`general::GeneralProvider`]: process and thread name metadata

pub mod general;
pub mod native;

use std::sync::{Arc, Weak};

use crate::domain::TraceError;
use crate::trace_data::TraceEvent;

pub use general::GeneralProvider;
pub use native::{NativeTraceProvider, NativeTraceSource};

/// One recording window of one provider
pub trait TraceEventSource: Send + Sync {
    /// Discard anything buffered and start recording.
    fn start_interval(&self);

    /// End the window; later data is not part of it.
    fn stop_interval(&self);

    /// Hand over the window's events and reset. Empty if no window was
    /// started.
    ///
    /// # Errors
    /// [`TraceError::ConcurrentDrain`] if another drain of this source is in
    /// progress.
    fn finish_interval(&self) -> Result<Vec<TraceEvent>, TraceError>;

    /// Periodic housekeeping while recording.
    fn work(&self) {}
}

pub trait TraceEventProvider: Send + Sync {
    fn make_source(self: Arc<Self>) -> Arc<dyn TraceEventSource>;
}

/// Non-owning back-reference to a provider
///
/// Discovery factories capture this instead of the provider itself, so the
/// provider can be dropped while its factories are still registered. A
/// factory whose provider is gone yields nothing.
#[derive(Debug)]
pub struct ProviderHandle<P> {
    provider: Weak<P>,
}

impl<P> ProviderHandle<P> {
    pub fn new(provider: &Arc<P>) -> Self {
        Self { provider: Arc::downgrade(provider) }
    }

    pub fn get(&self) -> Option<Arc<P>> {
        self.provider.upgrade()
    }

    pub fn is_alive(&self) -> bool {
        self.provider.strong_count() > 0
    }
}

impl<P> Clone for ProviderHandle<P> {
    fn clone(&self) -> Self {
        Self { provider: Weak::clone(&self.provider) }
    }
}
