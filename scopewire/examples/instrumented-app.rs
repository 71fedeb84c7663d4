//! Instrumented application for trying out scopewire
//!
//! ## Usage
//!
//! ```bash
//! cargo run --example instrumented-app
//!
//! # In another terminal
//! cargo run -- discover
//! cargo run -- record --duration 2 --output trace.json
//! cargo run -- trace_configure off $(pgrep instrumented)
//! ```

use scopewire::capture;
use scopewire::exposer::DefaultExposer;
use scopewire::{trace_mark, trace_scope};
use scopewire_common::MarkLevel;
use std::thread;
use std::time::Duration;

fn parse_frame(frame: u64) -> u64 {
    trace_scope!("parse");
    thread::sleep(Duration::from_millis(3));
    frame * 2
}

fn render(value: u64) {
    trace_scope!("render");
    thread::sleep(Duration::from_millis(1 + value % 5));
}

fn main() {
    env_logger::init();
    let exposer = DefaultExposer::new().expect("failed to expose process");
    println!("exposed at @{}", exposer.address());

    let workers: Vec<_> = (0..2)
        .map(|i| {
            thread::Builder::new()
                .name(format!("worker-{i}"))
                .spawn(move || {
                    capture::set_thread_name(format!("worker-{i}"));
                    for frame in 0.. {
                        trace_scope!("frame");
                        let value = parse_frame(frame);
                        render(value);
                        if frame % 10 == 0 {
                            trace_mark!(MarkLevel::Thread, "tenth frame");
                        }
                    }
                })
                .expect("failed to spawn worker")
        })
        .collect();

    for worker in workers {
        let _ = worker.join();
    }
}
