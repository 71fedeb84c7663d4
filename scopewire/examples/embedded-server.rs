//! Viewer server inside the traced process itself
//!
//! No discovery involved: the process records its own capture engine and
//! serves it on port 9222.
//!
//! ## Usage
//!
//! ```bash
//! cargo run --example embedded-server
//!
//! # Each line sent ends a recording window and returns it
//! echo | nc localhost 9222 > trace.json
//! ```

use scopewire::capture;
use scopewire::catapult::{CatapultBackend, CatapultServer};
use scopewire::provider::{GeneralProvider, NativeTraceProvider};
use scopewire::trace_scope;
use std::thread;
use std::time::Duration;

fn workload() {
    capture::set_thread_name("workload");
    loop {
        trace_scope!("tick");
        thread::sleep(Duration::from_millis(10));
        {
            trace_scope!("compute");
            let sum: u64 = (0..200_000u64).sum();
            std::hint::black_box(sum);
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::init();

    let backend = CatapultBackend::new();
    backend.add_provider(NativeTraceProvider::local());
    backend.add_provider(GeneralProvider::local());

    thread::Builder::new().name("workload".to_string()).spawn(workload)?;

    let server = CatapultServer::bind(("127.0.0.1", 9222), backend, Duration::from_secs(30)).await?;
    println!("serving recordings on {}", server.local_addr()?);
    server
        .run(async {
            let _ = tokio::signal::ctrl_c().await;
        })
        .await?;
    Ok(())
}
