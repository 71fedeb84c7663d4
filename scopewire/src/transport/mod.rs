//! Endpoint RPC transports
//!
//! A transport is a bidirectional connection that multiplexes requests to
//! many named [`Endpoint`](crate::endpoint::Endpoint)s. Two kinds exist:
//!
//! - [`unix`]: abstract-namespace unix sockets, discovered through
//!   `/proc/net/unix`, for talking to other processes
//! - [`loopback`]: in-process, synchronous dispatch, mostly for tests and
//!   embedded use
//!
//! Both hand out `Arc<dyn Transport>` from a [`TransportFactory`]. Every
//! served transport carries an `introspect` endpoint.

pub mod loopback;
pub mod pending;
pub mod protocol;
pub mod registry;
pub mod unix;

use std::sync::Arc;
use std::time::Duration;

use scopewire_common::DEFAULT_REQUEST_TIMEOUT_MS;
use serde_json::Value;

use crate::domain::{Address, TransportError};
use crate::endpoint::Endpoint;

pub use loopback::TransportLoopbackFactory;
pub use pending::{PendingResponse, PendingTable};
pub use registry::EndpointRegistry;
pub use unix::TransportUnixFactory;

/// Raw bytes exchanged with an endpoint
pub type Data = Vec<u8>;

/// Deadline used by the built-in endpoint clients
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_millis(DEFAULT_REQUEST_TIMEOUT_MS);

/// One end of a connection, or a serving listener
pub trait Transport: Send + Sync {
    /// Send `payload` to the remote endpoint called `name`.
    ///
    /// The payload is validated before anything is written, so a
    /// [`TransportError::Validation`] never leaves a half-sent frame behind.
    ///
    /// # Errors
    /// Validation failures, a closed connection, or a failed write.
    fn request(&self, name: &str, payload: Payload) -> Result<PendingResponse, TransportError>;

    /// Push `data` to the `name` endpoint of every connected client.
    /// Clients never broadcast; on them this is a no-op.
    fn broadcast(&self, name: &str, data: &[u8]);

    fn is_connected(&self) -> bool;

    /// Number of requests still waiting for a response
    fn pending_requests(&self) -> usize;

    /// Register a local handler; replaces any handler with the same name.
    fn add_endpoint(&self, endpoint: Arc<dyn Endpoint>);

    fn endpoint(&self, name: &str) -> Option<Arc<dyn Endpoint>>;

    /// Sorted names of the local handlers
    fn endpoint_names(&self) -> Vec<String>;

    fn address(&self) -> Address;

    /// Mark closed and shut the sockets down. Worker threads exit on their
    /// own; nothing is joined here.
    fn close(&self);
}

/// Creates transports of one kind
pub trait TransportFactory: Send + Sync {
    /// Addresses of peers that currently accept connections
    ///
    /// # Errors
    /// Returns an error if the peer table cannot be read.
    fn discover(&self) -> Result<Vec<Address>, TransportError>;

    /// Start a listener with the mandatory `introspect` endpoint attached.
    ///
    /// # Errors
    /// Returns an error if the listener cannot be bound.
    fn serve(&self) -> Result<Arc<dyn Transport>, TransportError>;

    /// # Errors
    /// Returns an error if no peer accepts at `address`.
    fn connect(&self, address: &Address) -> Result<Arc<dyn Transport>, TransportError>;
}

/// Accepted request payload shapes
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Payload {
    Bytes(Vec<u8>),
    /// Each value must fit in a byte
    Integers(Vec<i64>),
    Text(String),
}

impl Payload {
    /// # Errors
    /// Returns [`TransportError::Validation`] if an integer does not fit in a byte.
    pub fn into_bytes(self) -> Result<Data, TransportError> {
        match self {
            Payload::Bytes(bytes) => Ok(bytes),
            Payload::Text(text) => Ok(text.into_bytes()),
            Payload::Integers(values) => values
                .into_iter()
                .map(|v| {
                    u8::try_from(v).map_err(|_| {
                        TransportError::Validation(format!("{v} is not a byte value"))
                    })
                })
                .collect(),
        }
    }
}

impl From<Vec<u8>> for Payload {
    fn from(bytes: Vec<u8>) -> Self {
        Payload::Bytes(bytes)
    }
}

impl From<&[u8]> for Payload {
    fn from(bytes: &[u8]) -> Self {
        Payload::Bytes(bytes.to_vec())
    }
}

impl From<&str> for Payload {
    fn from(text: &str) -> Self {
        Payload::Text(text.to_string())
    }
}

impl From<String> for Payload {
    fn from(text: String) -> Self {
        Payload::Text(text)
    }
}

/// Dynamically typed input, as received from scripts or the command line.
/// Only strings and arrays of integers are accepted.
impl TryFrom<&Value> for Payload {
    type Error = TransportError;

    fn try_from(value: &Value) -> Result<Self, Self::Error> {
        match value {
            Value::String(text) => Ok(Payload::Text(text.clone())),
            Value::Array(items) => items
                .iter()
                .map(|item| {
                    item.as_i64().ok_or_else(|| {
                        TransportError::Validation(format!("{item} is not an integer"))
                    })
                })
                .collect::<Result<Vec<_>, _>>()
                .map(Payload::Integers),
            other => Err(TransportError::Validation(format!(
                "unsupported payload type: {}",
                json_type_name(other)
            ))),
        }
    }
}

fn json_type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_integer_payload_converts_to_bytes() {
        let payload = Payload::try_from(&json!([1, 0, 255])).unwrap();
        assert_eq!(payload.into_bytes().unwrap(), vec![1, 0, 255]);
    }

    #[test]
    fn test_integer_out_of_byte_range_rejected() {
        let err = Payload::Integers(vec![256]).into_bytes().unwrap_err();
        assert!(matches!(err, TransportError::Validation(_)));
    }

    #[test]
    fn test_scalar_number_rejected() {
        let err = Payload::try_from(&json!(3)).unwrap_err();
        assert!(matches!(err, TransportError::Validation(_)));
        assert!(err.to_string().contains("number"));
    }

    #[test]
    fn test_text_payload_is_utf8_bytes() {
        assert_eq!(Payload::from("a\0b").into_bytes().unwrap(), b"a\0b".to_vec());
    }
}
