//! Trace export functionality
//!
//! Serializes aggregated events in the Trace Event Format JSON array form
//! that browser trace viewers load directly.

pub mod chrome_trace;

pub use chrome_trace::ChromeTraceExporter;
