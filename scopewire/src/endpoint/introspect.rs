//! Lists the endpoints a connection serves

use scopewire_common::ENDPOINT_INTROSPECT;
use std::any::Any;
use std::sync::{Arc, Weak};
use std::time::Duration;

use super::{Endpoint, TransportSlot};
use crate::domain::TransportError;
use crate::transport::{Data, Payload, Transport, DEFAULT_REQUEST_TIMEOUT};

#[derive(Default)]
pub struct EndpointIntrospect {
    slot: TransportSlot,
    timeout: Option<Duration>,
}

impl std::fmt::Debug for EndpointIntrospect {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EndpointIntrospect").field("timeout", &self.timeout).finish_non_exhaustive()
    }
}

impl EndpointIntrospect {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn with_timeout(timeout: Duration) -> Arc<Self> {
        Arc::new(Self { slot: TransportSlot::default(), timeout: Some(timeout) })
    }

    /// Sorted endpoint names of the peer.
    ///
    /// # Errors
    /// Transport failures, including a timeout.
    pub fn supported(&self) -> Result<Vec<String>, TransportError> {
        let response = self.slot.query(
            ENDPOINT_INTROSPECT,
            Payload::Bytes(Vec::new()),
            self.timeout.unwrap_or(DEFAULT_REQUEST_TIMEOUT),
        )?;
        Ok(parse_names(&response))
    }
}

impl Endpoint for EndpointIntrospect {
    fn name(&self) -> &str {
        ENDPOINT_INTROSPECT
    }

    fn handle(&self, transport: &dyn Transport, _request: &[u8]) -> Option<Data> {
        let mut names = transport.endpoint_names();
        names.sort();
        let mut out = String::new();
        for name in names {
            out.push_str(&name);
            out.push('\n');
        }
        Some(out.into_bytes())
    }

    fn set_transport(&self, transport: Weak<dyn Transport>) {
        self.slot.attach(transport);
    }

    fn as_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }
}

fn parse_names(response: &[u8]) -> Vec<String> {
    let mut names: Vec<String> = String::from_utf8_lossy(response)
        .lines()
        .filter(|line| !line.is_empty())
        .map(str::to_string)
        .collect();
    names.sort();
    names
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_names_sorted_and_trimmed() {
        assert_eq!(parse_names(b"b\na\n\n"), vec!["a".to_string(), "b".to_string()]);
        assert!(parse_names(b"").is_empty());
    }

    #[test]
    fn test_unattached_client_reports_not_connected() {
        let introspect = EndpointIntrospect::new();
        assert!(matches!(introspect.supported(), Err(TransportError::NotConnected)));
    }
}
