//! Aggregation and viewer export
//!
//! [`CatapultBackend`] turns the registered providers into one recording
//! window at a time; [`CatapultServer`] drives windows on behalf of
//! connected trace viewers.

pub mod backend;
pub mod server;

pub use backend::{CatapultBackend, RecordingSession};
pub use server::CatapultServer;
