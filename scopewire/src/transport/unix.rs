//! Unix domain socket transport
//!
//! Servers listen on the Linux abstract socket `@<pid><suffix>`, so nothing
//! is left on the filesystem when a process dies and the kernel's socket
//! table in `/proc/net/unix` doubles as the discovery registry.
//!
//! Threads:
//! - one accept thread per server, polling a non-blocking listener
//! - one reader thread per connection, on both sides
//!
//! Worker threads hold only weak references to their transport. Closing
//! shuts the sockets down and the workers notice on their next read or poll,
//! so the thread that closes never waits on a worker.

use log::{debug, info, warn};
use std::collections::BTreeSet;
use std::fs;
use std::io;
use std::net::Shutdown;
use std::os::linux::net::SocketAddrExt;
use std::os::unix::net::{SocketAddr, UnixListener, UnixStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError, Weak};
use std::thread;
use std::time::Duration;

use scopewire_common::UNIX_SOCKET_SUFFIX;

use super::protocol::{read_frame, Frame, UNSOLICITED_TOKEN};
use super::{Data, EndpointRegistry, Payload, PendingResponse, PendingTable, Transport, TransportFactory};
use crate::domain::{Address, Pid, TransportError};
use crate::endpoint::{Endpoint, EndpointIntrospect};

/// `__SO_ACCEPTCON` in the flags column of `/proc/net/unix`
const SO_ACCEPTCON: u32 = 0x0001_0000;

const ACCEPT_POLL_INTERVAL: Duration = Duration::from_millis(10);

const PROC_NET_UNIX: &str = "/proc/net/unix";

/// Creates unix socket servers and clients sharing one socket name suffix
#[derive(Debug, Clone)]
pub struct TransportUnixFactory {
    suffix: String,
}

impl Default for TransportUnixFactory {
    fn default() -> Self {
        Self { suffix: UNIX_SOCKET_SUFFIX.to_string() }
    }
}

impl TransportUnixFactory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Use a different suffix; deployments with distinct suffixes do not see
    /// each other.
    pub fn with_suffix(suffix: impl Into<String>) -> Self {
        Self { suffix: suffix.into() }
    }

    pub fn suffix(&self) -> &str {
        &self.suffix
    }

    /// Abstract socket name served by process `pid`
    pub fn server_name(&self, pid: Pid) -> String {
        format!("{}{}", pid.0, self.suffix)
    }
}

impl TransportFactory for TransportUnixFactory {
    fn discover(&self) -> Result<Vec<Address>, TransportError> {
        let table = fs::read_to_string(PROC_NET_UNIX)?;
        Ok(parse_proc_net_unix(&table, &self.suffix))
    }

    fn serve(&self) -> Result<Arc<dyn Transport>, TransportError> {
        let name = self.server_name(Pid::current());
        let addr = SocketAddr::from_abstract_name(name.as_bytes())?;
        let listener = UnixListener::bind_addr(&addr)?;
        listener.set_nonblocking(true)?;

        let server = Arc::new_cyclic(|weak| UnixServer {
            address: Address::new(name.clone()),
            registry: EndpointRegistry::new(),
            listener: Mutex::new(Some(listener)),
            clients: Mutex::new(Vec::new()),
            closed: AtomicBool::new(false),
            self_ref: weak.clone(),
        });
        server.add_endpoint(EndpointIntrospect::new());

        let weak = Arc::downgrade(&server);
        thread::Builder::new().name("scopewire-accept".to_string()).spawn(move || accept_loop(&weak))?;

        info!("Serving endpoints on @{name}");
        Ok(server)
    }

    fn connect(&self, address: &Address) -> Result<Arc<dyn Transport>, TransportError> {
        let addr = SocketAddr::from_abstract_name(address.as_str().as_bytes())?;
        let stream = UnixStream::connect_addr(&addr)?;
        let reader = stream.try_clone()?;
        let connection = Arc::new(Connection::new(stream)?);
        let pending = PendingTable::new();

        let client = Arc::new_cyclic(|weak| UnixClient {
            address: address.clone(),
            registry: EndpointRegistry::new(),
            pending: Arc::clone(&pending),
            connection: Arc::clone(&connection),
            self_ref: weak.clone(),
        });

        let weak = Arc::downgrade(&client);
        let peer = address.clone();
        thread::Builder::new()
            .name("scopewire-client".to_string())
            .spawn(move || client_read_loop(&weak, &connection, &pending, reader, &peer))?;

        debug!("Connected to @{address}");
        Ok(client)
    }
}

/// Listening sockets whose abstract name is `<digits><suffix>`.
///
/// Entries with inode 0 are sockets being torn down and are skipped.
pub fn parse_proc_net_unix(table: &str, suffix: &str) -> Vec<Address> {
    let mut found = BTreeSet::new();
    // Num RefCount Protocol Flags Type St Inode Path
    for line in table.lines().skip(1) {
        let fields: Vec<&str> = line.split_whitespace().collect();
        if fields.len() < 8 {
            continue;
        }
        let Ok(flags) = u32::from_str_radix(fields[3], 16) else {
            continue;
        };
        if flags & SO_ACCEPTCON == 0 || fields[6] == "0" {
            continue;
        }
        let Some(name) = fields[7].strip_prefix('@') else {
            continue;
        };
        let Some(pid) = name.strip_suffix(suffix) else {
            continue;
        };
        if pid.is_empty() || !pid.bytes().all(|b| b.is_ascii_digit()) {
            continue;
        }
        found.insert(name.to_string());
    }
    found.into_iter().map(Address::from).collect()
}

/// One socket and its serialized writer
struct Connection {
    control: UnixStream,
    writer: Mutex<UnixStream>,
    open: AtomicBool,
}

impl Connection {
    fn new(stream: UnixStream) -> io::Result<Self> {
        stream.set_nonblocking(false)?;
        let writer = stream.try_clone()?;
        Ok(Self { control: stream, writer: Mutex::new(writer), open: AtomicBool::new(true) })
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::Acquire)
    }

    fn send(&self, frame: &Frame) -> Result<(), TransportError> {
        let bytes = frame.encode()?;
        self.send_encoded(&bytes)
    }

    fn send_encoded(&self, bytes: &[u8]) -> Result<(), TransportError> {
        use std::io::Write;

        if !self.is_open() {
            return Err(TransportError::NotConnected);
        }
        let mut writer = self.writer.lock().unwrap_or_else(PoisonError::into_inner);
        if let Err(e) = writer.write_all(bytes).and_then(|()| writer.flush()) {
            drop(writer);
            self.shutdown();
            return Err(e.into());
        }
        Ok(())
    }

    fn shutdown(&self) {
        if self.open.swap(false, Ordering::AcqRel) {
            let _ = self.control.shutdown(Shutdown::Both);
        }
    }
}

/// Listening side; handlers receive this as their transport
pub struct UnixServer {
    address: Address,
    registry: EndpointRegistry,
    listener: Mutex<Option<UnixListener>>,
    clients: Mutex<Vec<Arc<Connection>>>,
    closed: AtomicBool,
    self_ref: Weak<UnixServer>,
}

enum AcceptOutcome {
    Accepted(UnixStream),
    Idle,
    Closed,
}

impl UnixServer {
    fn accept_once(&self) -> AcceptOutcome {
        let guard = self.listener.lock().unwrap_or_else(PoisonError::into_inner);
        let Some(listener) = guard.as_ref() else {
            return AcceptOutcome::Closed;
        };
        match listener.accept() {
            Ok((stream, _)) => AcceptOutcome::Accepted(stream),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => AcceptOutcome::Idle,
            Err(e) => {
                warn!("Accept on @{} failed: {e}", self.address);
                AcceptOutcome::Idle
            }
        }
    }

    fn adopt(&self, stream: UnixStream) -> io::Result<()> {
        let reader = stream.try_clone()?;
        let connection = Arc::new(Connection::new(stream)?);
        self.clients.lock().unwrap_or_else(PoisonError::into_inner).push(Arc::clone(&connection));

        let server = self.self_ref.clone();
        thread::Builder::new()
            .name("scopewire-conn".to_string())
            .spawn(move || server_read_loop(&server, &connection, reader))?;
        debug!("Accepted connection on @{}", self.address);
        Ok(())
    }

    fn live_clients(&self) -> Vec<Arc<Connection>> {
        let mut clients = self.clients.lock().unwrap_or_else(PoisonError::into_inner);
        clients.retain(|c| c.is_open());
        clients.clone()
    }

    pub fn client_count(&self) -> usize {
        self.live_clients().len()
    }
}

impl Transport for UnixServer {
    fn request(&self, name: &str, _payload: Payload) -> Result<PendingResponse, TransportError> {
        Err(TransportError::Protocol(format!(
            "serving transport @{} cannot issue a request to '{name}'",
            self.address
        )))
    }

    fn broadcast(&self, name: &str, data: &[u8]) {
        let bytes = match Frame::new(UNSOLICITED_TOKEN, name, data.to_vec()).encode() {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!("Cannot broadcast to '{name}': {e}");
                return;
            }
        };
        for client in self.live_clients() {
            if let Err(e) = client.send_encoded(&bytes) {
                debug!("Broadcast to a client of @{} failed: {e}", self.address);
            }
        }
    }

    fn is_connected(&self) -> bool {
        !self.closed.load(Ordering::Acquire)
    }

    fn pending_requests(&self) -> usize {
        0
    }

    fn add_endpoint(&self, endpoint: Arc<dyn Endpoint>) {
        let weak: Weak<dyn Transport> = self.self_ref.clone();
        self.registry.insert(endpoint, weak);
    }

    fn endpoint(&self, name: &str) -> Option<Arc<dyn Endpoint>> {
        self.registry.get(name)
    }

    fn endpoint_names(&self) -> Vec<String> {
        self.registry.names()
    }

    fn address(&self) -> Address {
        self.address.clone()
    }

    fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.listener.lock().unwrap_or_else(PoisonError::into_inner).take();
        let clients = std::mem::take(&mut *self.clients.lock().unwrap_or_else(PoisonError::into_inner));
        for client in clients {
            client.shutdown();
        }
        debug!("Closed server @{}", self.address);
    }
}

impl Drop for UnixServer {
    fn drop(&mut self) {
        self.close();
    }
}

fn accept_loop(server: &Weak<UnixServer>) {
    loop {
        let Some(strong) = server.upgrade() else {
            break;
        };
        if !strong.is_connected() {
            break;
        }
        match strong.accept_once() {
            AcceptOutcome::Accepted(stream) => {
                if let Err(e) = strong.adopt(stream) {
                    warn!("Failed to set up connection on @{}: {e}", strong.address);
                }
            }
            AcceptOutcome::Idle => {
                drop(strong);
                thread::sleep(ACCEPT_POLL_INTERVAL);
            }
            AcceptOutcome::Closed => break,
        }
    }
}

fn server_read_loop(server: &Weak<UnixServer>, connection: &Arc<Connection>, mut reader: UnixStream) {
    loop {
        match read_frame(&mut reader) {
            Ok(Some(frame)) => {
                let Some(strong) = server.upgrade() else {
                    break;
                };
                if frame.is_unsolicited() {
                    // A client's reply to a broadcast; never answered.
                    let _ = strong.registry.dispatch_unsolicited(&*strong, &frame.name, &frame.payload);
                    continue;
                }
                let response = strong.registry.dispatch(&*strong, &frame.name, &frame.payload);
                drop(strong);
                let Some(data) = response else {
                    continue;
                };
                if let Err(e) = connection.send(&Frame::new(frame.token, frame.name, data)) {
                    debug!("Dropping connection after failed write: {e}");
                    break;
                }
            }
            Ok(None) => break,
            Err(e) => {
                if connection.is_open() {
                    warn!("Dropping connection: {e}");
                }
                break;
            }
        }
    }
    connection.shutdown();
}

/// Connecting side
pub struct UnixClient {
    address: Address,
    registry: EndpointRegistry,
    pending: Arc<PendingTable>,
    connection: Arc<Connection>,
    self_ref: Weak<UnixClient>,
}

impl Transport for UnixClient {
    fn request(&self, name: &str, payload: Payload) -> Result<PendingResponse, TransportError> {
        let bytes: Data = payload.into_bytes()?;
        if !self.connection.is_open() {
            return Err(TransportError::NotConnected);
        }
        let (token, pending) = self.pending.register(name);
        self.connection.send(&Frame::new(token, name, bytes))?;
        Ok(pending)
    }

    fn broadcast(&self, _name: &str, _data: &[u8]) {}

    fn is_connected(&self) -> bool {
        self.connection.is_open()
    }

    fn pending_requests(&self) -> usize {
        self.pending.len()
    }

    fn add_endpoint(&self, endpoint: Arc<dyn Endpoint>) {
        let weak: Weak<dyn Transport> = self.self_ref.clone();
        self.registry.insert(endpoint, weak);
    }

    fn endpoint(&self, name: &str) -> Option<Arc<dyn Endpoint>> {
        self.registry.get(name)
    }

    fn endpoint_names(&self) -> Vec<String> {
        self.registry.names()
    }

    fn address(&self) -> Address {
        self.address.clone()
    }

    fn close(&self) {
        self.connection.shutdown();
        self.pending.fail_all();
    }
}

impl Drop for UnixClient {
    fn drop(&mut self) {
        self.close();
    }
}

fn client_read_loop(
    client: &Weak<UnixClient>,
    connection: &Arc<Connection>,
    pending: &Arc<PendingTable>,
    mut reader: UnixStream,
    peer: &Address,
) {
    loop {
        match read_frame(&mut reader) {
            Ok(Some(frame)) if frame.is_unsolicited() => {
                let Some(strong) = client.upgrade() else {
                    break;
                };
                let reply = strong.registry.dispatch_unsolicited(&*strong, &frame.name, &frame.payload);
                drop(strong);
                if let Some(data) = reply {
                    if connection.send(&Frame::new(UNSOLICITED_TOKEN, frame.name, data)).is_err() {
                        break;
                    }
                }
            }
            Ok(Some(frame)) => {
                if let Err(e) = pending.fulfill(frame.token, frame.payload) {
                    debug!("Dropping response from @{peer}: {e}");
                }
            }
            Ok(None) => break,
            Err(e) => {
                if connection.is_open() {
                    warn!("Connection to @{peer} failed: {e}");
                }
                break;
            }
        }
    }
    connection.shutdown();
    pending.fail_all();
    debug!("Disconnected from @{peer}");
}

#[cfg(test)]
mod tests {
    use super::*;

    const TABLE: &str = "\
Num       RefCount Protocol Flags    Type St Inode Path
0000000000000000: 00000002 00000000 00010000 0001 01 40001 @1234_scopewire
0000000000000000: 00000003 00000000 00000000 0001 03 40002 @1234_scopewire
0000000000000000: 00000002 00000000 00010000 0001 01 0 @999_scopewire
0000000000000000: 00000002 00000000 00010000 0001 01 40003 @abc_scopewire
0000000000000000: 00000002 00000000 00010000 0001 01 40004 /run/other.sock
0000000000000000: 00000002 00000000 00010000 0001 01 40005 @77_scopewire
0000000000000000: 00000002 00000000 00010000 0001 01 40006 @88_other
";

    #[test]
    fn test_parse_keeps_only_listening_matching_sockets() {
        let found = parse_proc_net_unix(TABLE, "_scopewire");
        assert_eq!(found, vec![Address::from("1234_scopewire"), Address::from("77_scopewire")]);
    }

    #[test]
    fn test_parse_with_custom_suffix() {
        assert_eq!(parse_proc_net_unix(TABLE, "_other"), vec![Address::from("88_other")]);
        assert!(parse_proc_net_unix("", "_scopewire").is_empty());
    }

    #[test]
    fn test_server_name_uses_pid_and_suffix() {
        let factory = TransportUnixFactory::with_suffix("_t");
        assert_eq!(factory.server_name(Pid(5)), "5_t");
    }
}
