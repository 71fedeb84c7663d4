//! Structured error types for scopewire
//!
//! Using thiserror for automatic Display implementation and error chaining.

use super::types::Address;
use std::time::Duration;
use thiserror::Error;

/// Failures of the endpoint RPC layer
///
/// Timeouts and validation failures are per call; protocol and I/O failures
/// end the connection they occurred on and nothing else.
#[derive(Error, Debug)]
pub enum TransportError {
    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("No response from endpoint '{endpoint}' within {timeout:?}")]
    Timeout { endpoint: String, timeout: Duration },

    #[error("Invalid request payload: {0}")]
    Validation(String),

    #[error("Endpoint '{0}' is not available on this connection")]
    UnsupportedEndpoint(String),

    #[error("Transport is not connected")]
    NotConnected,

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

impl TransportError {
    pub fn is_timeout(&self) -> bool {
        matches!(self, TransportError::Timeout { .. })
    }
}

#[derive(Error, Debug)]
pub enum TraceError {
    #[error("Source is already being drained")]
    ConcurrentDrain,

    #[error(transparent)]
    Endpoint(#[from] TransportError),
}

/// Why a peer was skipped by the remote configurator
#[derive(Error, Debug)]
pub enum ConfigurationFailure {
    #[error("{address} does not expose process info")]
    MissingProcessInfo { address: Address },

    #[error("{address} does not expose a trace configurator")]
    MissingConfigurator { address: Address },

    #[error("{address} did not answer: {source}")]
    NoResponse {
        address: Address,
        #[source]
        source: TransportError,
    },
}

#[derive(Error, Debug)]
pub enum ExportError {
    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}
