//! TCP server streaming recordings to trace viewers
//!
//! Line protocol, one cycle per window:
//! 1. the viewer connects; a recording window starts
//! 2. the viewer sends any newline-terminated line, or the maximum window
//!    length passes
//! 3. the server answers with one JSON array of trace events and a newline,
//!    and the next window starts
//!
//! The window that is open when the viewer disconnects is discarded.

use log::{debug, info, warn};
use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream, ToSocketAddrs};

use super::backend::{CatapultBackend, RecordingSession};
use crate::domain::ExportError;
use crate::export::ChromeTraceExporter;
use crate::trace_data::TraceEvent;

/// How often open sessions get their `work` call
const WORK_INTERVAL: Duration = Duration::from_millis(10);

pub struct CatapultServer {
    listener: TcpListener,
    backend: Arc<CatapultBackend>,
    max_window: Duration,
}

impl CatapultServer {
    /// Bind the listener. Port 0 picks a free port; see [`Self::local_addr`].
    ///
    /// # Errors
    /// Returns an error if the address cannot be bound.
    pub async fn bind(
        addr: impl ToSocketAddrs,
        backend: Arc<CatapultBackend>,
        max_window: Duration,
    ) -> io::Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        Ok(Self { listener, backend, max_window })
    }

    /// # Errors
    /// Returns an error if the listener has no local address.
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Serve viewers until `shutdown` completes. Each viewer is handled on
    /// its own task; failures of one viewer do not affect the others.
    ///
    /// # Errors
    /// Returns an error if accepting connections fails.
    pub async fn run(self, shutdown: impl Future<Output = ()>) -> io::Result<()> {
        tokio::pin!(shutdown);
        loop {
            tokio::select! {
                () = &mut shutdown => {
                    info!("Catapult server shutting down");
                    return Ok(());
                }
                accepted = self.listener.accept() => {
                    let (stream, peer) = accepted?;
                    info!("Viewer connected from {peer}");
                    let backend = Arc::clone(&self.backend);
                    let max_window = self.max_window;
                    tokio::spawn(async move {
                        match serve_viewer(stream, backend, max_window).await {
                            Ok(windows) => info!("Viewer {peer} disconnected after {windows} recordings"),
                            Err(e) => warn!("Viewer {peer} failed: {e}"),
                        }
                    });
                }
            }
        }
    }
}

/// Run recording cycles for one viewer; returns the number of recordings
/// sent.
async fn serve_viewer(
    stream: TcpStream,
    backend: Arc<CatapultBackend>,
    max_window: Duration,
) -> Result<usize, ExportError> {
    let (reader, mut writer) = stream.into_split();
    let mut lines = BufReader::new(reader).lines();
    let mut sent = 0;

    loop {
        let starter = Arc::clone(&backend);
        let session = Arc::new(blocking(move || starter.start_session()).await?);

        let deadline = tokio::time::sleep(max_window);
        tokio::pin!(deadline);
        let mut ticker = tokio::time::interval(WORK_INTERVAL);
        let requested = loop {
            tokio::select! {
                line = lines.next_line() => break matches!(line, Ok(Some(_))),
                () = &mut deadline => {
                    debug!("Recording window reached its maximum of {max_window:?}");
                    break true;
                }
                _ = ticker.tick() => {
                    let worker = Arc::clone(&session);
                    blocking(move || worker.work()).await?;
                }
            }
        };

        let events = blocking(move || finish(session)).await?;
        if !requested {
            return Ok(sent);
        }

        let mut json = ChromeTraceExporter::from_events(events).to_json()?;
        json.push('\n');
        writer.write_all(json.as_bytes()).await?;
        writer.flush().await?;
        sent += 1;
    }
}

fn finish(session: Arc<RecordingSession>) -> Vec<TraceEvent> {
    match Arc::try_unwrap(session) {
        Ok(session) => session.finish(),
        // Only shared while a work call is in flight.
        Err(session) => {
            session.stop();
            Vec::new()
        }
    }
}

/// Run a sync call on the blocking pool; sources may wait on peers.
async fn blocking<T: Send + 'static>(f: impl FnOnce() -> T + Send + 'static) -> io::Result<T> {
    tokio::task::spawn_blocking(f).await.map_err(io::Error::other)
}
