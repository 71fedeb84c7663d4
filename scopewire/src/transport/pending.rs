//! Request/response correlation
//!
//! Each outgoing request gets a fresh token and a single-slot channel. The
//! entry is registered before the request is written, so a response can never
//! arrive for a token that is not yet known.

use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use super::Data;
use crate::domain::TransportError;

/// Outstanding requests of one connection
#[derive(Debug)]
pub struct PendingTable {
    next_token: AtomicU64,
    waiting: Mutex<HashMap<u64, Sender<Data>>>,
}

impl Default for PendingTable {
    fn default() -> Self {
        Self { next_token: AtomicU64::new(1), waiting: Mutex::new(HashMap::new()) }
    }
}

impl PendingTable {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Allocate a token and the response handle waiting on it.
    pub fn register(self: &Arc<Self>, endpoint: &str) -> (u64, PendingResponse) {
        let token = self.next_token.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = bounded(1);
        self.lock().insert(token, tx);
        let response = PendingResponse {
            token,
            endpoint: endpoint.to_string(),
            receiver: rx,
            table: Arc::clone(self),
        };
        (token, response)
    }

    /// Deliver a response to the call site waiting on `token`.
    ///
    /// # Errors
    /// Returns a protocol error for unknown tokens, which includes a second
    /// response to an already fulfilled request.
    pub fn fulfill(&self, token: u64, data: Data) -> Result<(), TransportError> {
        let sender = self
            .lock()
            .remove(&token)
            .ok_or_else(|| TransportError::Protocol(format!("unknown correlation token {token}")))?;
        // The caller may have given up already; that is not an error.
        let _ = sender.try_send(data);
        Ok(())
    }

    /// Fail every outstanding request; waiters observe a closed connection.
    pub fn fail_all(&self) {
        self.lock().clear();
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn forget(&self, token: u64) {
        self.lock().remove(&token);
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<u64, Sender<Data>>> {
        self.waiting.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Future-like handle for one in-flight request
///
/// Dropping it withdraws the request; a late response is then reported as an
/// unknown token by the transport.
#[derive(Debug)]
pub struct PendingResponse {
    token: u64,
    endpoint: String,
    receiver: Receiver<Data>,
    table: Arc<PendingTable>,
}

impl PendingResponse {
    pub fn token(&self) -> u64 {
        self.token
    }

    /// Block until the response arrives.
    ///
    /// # Errors
    /// [`TransportError::Timeout`] if nothing arrives in time,
    /// [`TransportError::Protocol`] if the connection closed meanwhile.
    pub fn wait_for(&self, timeout: Duration) -> Result<Data, TransportError> {
        match self.receiver.recv_timeout(timeout) {
            Ok(data) => Ok(data),
            Err(RecvTimeoutError::Timeout) => {
                Err(TransportError::Timeout { endpoint: self.endpoint.clone(), timeout })
            }
            Err(RecvTimeoutError::Disconnected) => Err(TransportError::Protocol(format!(
                "connection closed while waiting for '{}'",
                self.endpoint
            ))),
        }
    }
}

impl Drop for PendingResponse {
    fn drop(&mut self) {
        self.table.forget(self.token);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tokens_are_unique_and_nonzero() {
        let table = PendingTable::new();
        let (a, _ra) = table.register("x");
        let (b, _rb) = table.register("x");
        assert_ne!(a, 0);
        assert_ne!(a, b);
        assert_eq!(table.len(), 2);
    }

    #[test]
    fn test_fulfill_reaches_waiter() {
        let table = PendingTable::new();
        let (token, response) = table.register("echo");
        table.fulfill(token, vec![1, 2]).unwrap();
        assert_eq!(response.wait_for(Duration::from_millis(10)).unwrap(), vec![1, 2]);
        assert!(table.is_empty());
    }

    #[test]
    fn test_duplicate_response_is_protocol_error() {
        let table = PendingTable::new();
        let (token, _response) = table.register("echo");
        table.fulfill(token, vec![]).unwrap();
        assert!(matches!(table.fulfill(token, vec![]), Err(TransportError::Protocol(_))));
    }

    #[test]
    fn test_timeout_and_drop_cleanup() {
        let table = PendingTable::new();
        let (_, response) = table.register("slow");
        let err = response.wait_for(Duration::from_millis(5)).unwrap_err();
        assert!(err.is_timeout());
        drop(response);
        assert!(table.is_empty());
    }

    #[test]
    fn test_fail_all_reports_closed_connection() {
        let table = PendingTable::new();
        let (_, response) = table.register("echo");
        table.fail_all();
        let err = response.wait_for(Duration::from_secs(1)).unwrap_err();
        assert!(matches!(err, TransportError::Protocol(_)));
    }
}
