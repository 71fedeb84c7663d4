//! # scopewire - Main Entry Point
//!
//! Consumer-side tooling over discovered processes:
//! - **catapult_server**: stream recordings to trace viewers over TCP
//! - **discover** / **record** / **trace_configure**: one-shot commands
//! - **demo**: an instrumented process to try the others against

use anyhow::{Context, Result};
use clap::{CommandFactory, Parser};
use log::{debug, info, warn};
use std::io::{self, BufWriter, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use scopewire::catapult::{CatapultBackend, CatapultServer};
use scopewire::cli::{Args, Command, ConfigureArgs, DemoArgs, RecordArgs, ServerArgs};
use scopewire::configure::{configure_peers, register_factories};
use scopewire::discovery::EndpointManagerPoll;
use scopewire::domain::TransportError;
use scopewire::endpoint::EndpointIntrospect;
use scopewire::export::ChromeTraceExporter;
use scopewire::exposer::DefaultExposer;
use scopewire::provider::{GeneralProvider, NativeTraceProvider};
use scopewire::transport::TransportUnixFactory;
use scopewire::{capture, trace_counter, trace_mark, trace_scope};
use scopewire_common::{MarkLevel, ENDPOINT_INTROSPECT};

// Exit codes
const EXIT_SUCCESS: i32 = 0;
const EXIT_ERROR: i32 = 1;

/// Time for the last sender flushes to arrive before a recording ends
const FLUSH_GRACE: Duration = Duration::from_millis(50);

fn main() {
    env_logger::init();
    let args = Args::parse();
    let Some(command) = args.command else {
        let _ = Args::command().print_help();
        println!();
        std::process::exit(EXIT_ERROR);
    };
    std::process::exit(match run(command, &args.suffix) {
        Ok(()) => EXIT_SUCCESS,
        Err(e) => {
            eprintln!("error: {e:#}");
            EXIT_ERROR
        }
    });
}

fn run(command: Command, suffix: &str) -> Result<()> {
    match command {
        Command::CatapultServer(server) => run_catapult_server(&server, suffix),
        Command::Discover => run_discover(suffix),
        Command::Record(record) => run_record(&record, suffix),
        Command::TraceConfigure(configure) => run_trace_configure(&configure, suffix),
        Command::Demo(demo) => run_demo(&demo, suffix),
    }
}

fn poller(suffix: &str) -> Arc<EndpointManagerPoll> {
    Arc::new(EndpointManagerPoll::new(Arc::new(TransportUnixFactory::with_suffix(suffix))))
}

/// Backend with the native and general providers on a fresh poller.
/// Providers register their factories, so this precedes the first round.
fn consumer(suffix: &str) -> (Arc<EndpointManagerPoll>, Arc<CatapultBackend>) {
    let poller = poller(suffix);
    poller.set_logger(Arc::new(|msg| info!("discovery: {msg}")));
    let backend = CatapultBackend::new();
    backend.set_logger(Arc::new(|msg| info!("backend: {msg}")));
    backend.add_provider(NativeTraceProvider::new(Arc::clone(&poller)));
    backend.add_provider(GeneralProvider::new(Arc::clone(&poller)));
    (poller, backend)
}

#[tokio::main]
async fn run_catapult_server(args: &ServerArgs, suffix: &str) -> Result<()> {
    let (poller, backend) = consumer(suffix);
    poller.start_polling(args.poll_interval).context("Failed to start discovery")?;

    let server = CatapultServer::bind(("0.0.0.0", args.port), backend, args.max_window)
        .await
        .with_context(|| format!("Failed to listen on port {}", args.port))?;
    println!("scopewire v{}", env!("CARGO_PKG_VERSION"));
    println!("listening: {}", server.local_addr()?);

    server
        .run(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                warn!("Cannot wait for Ctrl-C: {e}");
                std::future::pending::<()>().await;
            }
        })
        .await?;
    poller.stop_polling();
    Ok(())
}

fn run_discover(suffix: &str) -> Result<()> {
    let poller = poller(suffix);
    poller.manage().context("Discovery failed")?;
    let peers = poller.endpoints();
    if peers.is_empty() {
        println!("no processes found");
    }
    for (address, peer) in peers {
        match peer.require::<EndpointIntrospect>(ENDPOINT_INTROSPECT).and_then(|e| e.supported()) {
            Ok(names) => println!("{address}: {}", names.join(", ")),
            Err(e @ TransportError::UnsupportedEndpoint(_)) => println!("{address}: {e}"),
            Err(e) => println!("{address}: unreachable ({e})"),
        }
    }
    Ok(())
}

fn run_record(args: &RecordArgs, suffix: &str) -> Result<()> {
    let window = args.duration;
    let (poller, backend) = consumer(suffix);
    poller.manage().context("Discovery failed")?;
    info!("Recording {} processes for {window:?}", poller.endpoints().len());

    let session = backend.start_session();
    let started = Instant::now();
    while started.elapsed() < window {
        thread::sleep(Duration::from_millis(10).min(window));
        session.work();
    }
    thread::sleep(FLUSH_GRACE);
    let events = session.finish();
    info!("Recorded {} events", events.len());

    let exporter = ChromeTraceExporter::from_events(events);
    match &args.output {
        Some(path) => {
            exporter
                .export_to_file(path)
                .with_context(|| format!("Failed to write {}", path.display()))?;
            println!("wrote {} events to {}", exporter.len(), path.display());
        }
        None => {
            let mut stdout = BufWriter::new(io::stdout().lock());
            exporter.export(&mut stdout)?;
            writeln!(stdout)?;
        }
    }
    Ok(())
}

fn run_trace_configure(args: &ConfigureArgs, suffix: &str) -> Result<()> {
    let request = args.to_request();
    let poller = poller(suffix);
    register_factories(&poller);
    poller.manage().context("Discovery failed")?;
    let outcomes = configure_peers(&poller.endpoints(), &request);
    if outcomes.is_empty() {
        println!("no processes found");
    }
    for outcome in &outcomes {
        println!("{outcome}");
    }
    Ok(())
}

fn run_demo(args: &DemoArgs, suffix: &str) -> Result<()> {
    let _exposer = DefaultExposer::with_factory(&TransportUnixFactory::with_suffix(suffix), args.name.as_deref())
        .context("Failed to expose this process")?;
    println!("demo pid: {}", std::process::id());

    let running = Arc::new(AtomicBool::new(true));
    let worker_running = Arc::clone(&running);
    let worker = thread::Builder::new().name("demo-worker".to_string()).spawn(move || {
        capture::set_thread_name("demo-worker");
        while worker_running.load(Ordering::Relaxed) {
            trace_scope!("worker iteration");
            thread::sleep(Duration::from_millis(5));
            {
                trace_scope!("worker inner");
                thread::sleep(Duration::from_millis(2));
            }
        }
    })?;

    capture::set_thread_name("demo-main");
    let started = Instant::now();
    let limit = (args.duration > 0).then(|| Duration::from_secs(args.duration));
    let mut ticks: i64 = 0;
    loop {
        if limit.is_some_and(|limit| started.elapsed() >= limit) {
            break;
        }
        trace_scope!("main loop");
        trace_mark!(MarkLevel::Process, "tick");
        ticks += 1;
        trace_counter!("demo", "ticks", ticks);
        thread::sleep(Duration::from_millis(20));
    }

    running.store(false, Ordering::Relaxed);
    if worker.join().is_err() {
        debug!("demo worker panicked");
    }
    Ok(())
}
