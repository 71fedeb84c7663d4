use scopewire::catapult::{CatapultBackend, CatapultServer};
use scopewire::domain::{Pid, Tid, TraceError};
use scopewire::provider::{TraceEventProvider, TraceEventSource};
use scopewire::trace_data::TraceEvent;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::sync::oneshot;

/// Each source reports its window number as an out-of-order pair
struct WindowProvider {
    windows: AtomicUsize,
}

struct WindowSource {
    window: usize,
}

impl TraceEventProvider for WindowProvider {
    fn make_source(self: Arc<Self>) -> Arc<dyn TraceEventSource> {
        Arc::new(WindowSource { window: self.windows.fetch_add(1, Ordering::SeqCst) })
    }
}

impl TraceEventSource for WindowSource {
    fn start_interval(&self) {}

    fn stop_interval(&self) {}

    fn finish_interval(&self) -> Result<Vec<TraceEvent>, TraceError> {
        let name = format!("window {}", self.window);
        Ok(vec![
            TraceEvent::end(Pid(1), Tid(2), 20.0, name.clone()),
            TraceEvent::begin(Pid(1), Tid(2), 10.0, name),
        ])
    }
}

async fn start_server(max_window: Duration) -> (SocketAddr, oneshot::Sender<()>) {
    let backend = CatapultBackend::new();
    backend.add_provider(Arc::new(WindowProvider { windows: AtomicUsize::new(0) }));
    let server = CatapultServer::bind("127.0.0.1:0", backend, max_window).await.unwrap();
    let addr = server.local_addr().unwrap();
    let (stop, stopped) = oneshot::channel::<()>();
    tokio::spawn(server.run(async move {
        let _ = stopped.await;
    }));
    (addr, stop)
}

fn parse(line: &str) -> Vec<serde_json::Value> {
    serde_json::from_str::<serde_json::Value>(line).unwrap().as_array().unwrap().clone()
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_each_request_ends_a_window() {
    let (addr, _stop) = start_server(Duration::from_secs(60)).await;
    let stream = TcpStream::connect(addr).await.unwrap();
    let (reader, mut writer) = stream.into_split();
    let mut lines = BufReader::new(reader).lines();

    for window in 0..2 {
        writer.write_all(b"dump\n").await.unwrap();
        let line = lines.next_line().await.unwrap().unwrap();
        let events = parse(&line);
        assert_eq!(events.len(), 2);
        assert_eq!(events[0]["ph"], "B");
        assert_eq!(events[1]["ph"], "E");
        assert_eq!(events[0]["name"], format!("window {window}"));
        let keys: Vec<&String> = events[0].as_object().unwrap().keys().collect();
        assert_eq!(keys.len(), 6);
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_max_window_sends_unrequested() {
    let (addr, _stop) = start_server(Duration::from_millis(50)).await;
    let stream = TcpStream::connect(addr).await.unwrap();
    let mut lines = BufReader::new(stream).lines();

    let line = tokio::time::timeout(Duration::from_secs(5), lines.next_line()).await.unwrap().unwrap().unwrap();
    assert_eq!(parse(&line).len(), 2);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_viewers_are_independent() {
    let (addr, _stop) = start_server(Duration::from_secs(60)).await;
    let first = TcpStream::connect(addr).await.unwrap();
    drop(first);

    let second = TcpStream::connect(addr).await.unwrap();
    let (reader, mut writer) = second.into_split();
    let mut lines = BufReader::new(reader).lines();
    writer.write_all(b"\n").await.unwrap();
    let line = lines.next_line().await.unwrap().unwrap();
    assert_eq!(parse(&line).len(), 2);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_shutdown_stops_accepting() {
    let (addr, stop) = start_server(Duration::from_secs(60)).await;
    stop.send(()).unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(TcpStream::connect(addr).await.is_err());
}
