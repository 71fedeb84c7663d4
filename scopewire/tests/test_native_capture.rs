//! Capture engine through the in-process native provider
//!
//! Every test records on the process-wide provider, so events are filtered
//! by the threads each test owns and every test uses its own trace ids.

use scopewire::capture::{self, current_tid};
use scopewire::domain::{Tid, TraceId};
use scopewire::provider::{NativeTraceProvider, TraceEventProvider, TraceEventSource};
use scopewire::trace_data::{Phase, TraceEvent};
use scopewire::{trace_counter, trace_mark, trace_scope};
use scopewire_common::MarkLevel;
use serde_json::json;
use std::sync::{Arc, Barrier};
use std::thread;
use std::time::Duration;

fn source() -> Arc<dyn TraceEventSource> {
    NativeTraceProvider::local().make_source()
}

fn of_threads(events: Vec<TraceEvent>, tids: &[Tid]) -> Vec<TraceEvent> {
    events.into_iter().filter(|e| tids.contains(&e.tid)).collect()
}

#[test]
fn test_three_scopes_in_one_interval() {
    let id = TraceId(0x101);
    capture::set_trace_name(id, "hundred millis");
    let (tid, events) = thread::spawn(move || {
        let source = source();
        source.start_interval();
        for _ in 0..3 {
            capture::scope_entry(id);
            thread::sleep(Duration::from_millis(100));
            capture::scope_exit(id);
        }
        source.stop_interval();
        (current_tid(), source.finish_interval().unwrap())
    })
    .join()
    .unwrap();

    let events = of_threads(events, &[tid]);
    let phases: Vec<Phase> = events.iter().map(|e| e.ph).collect();
    assert_eq!(phases, [Phase::Begin, Phase::End, Phase::Begin, Phase::End, Phase::Begin, Phase::End]);
    assert!(events.iter().all(|e| e.name == "hundred millis" && e.cat == "PERF"));

    // Begin to end spans the sleep; end to the next begin is immediate.
    for pair in events.chunks(2) {
        let spacing_ms = (pair[1].ts - pair[0].ts) / 1000.0;
        assert!((75.0..=125.0).contains(&spacing_ms), "scope lasted {spacing_ms}ms");
    }
}

#[test]
fn test_disabled_thread_records_nothing() {
    let id = TraceId(0x102);
    let (tid, disabled, enabled) = thread::spawn(move || {
        let source = source();

        source.start_interval();
        capture::set_thread_state(false);
        capture::scope_entry(id);
        capture::scope_exit(id);
        let disabled = source.finish_interval().unwrap();

        source.start_interval();
        capture::set_thread_state(true);
        capture::scope_entry(id);
        capture::scope_exit(id);
        let enabled = source.finish_interval().unwrap();

        (current_tid(), disabled, enabled)
    })
    .join()
    .unwrap();

    assert!(of_threads(disabled, &[tid]).is_empty());
    assert_eq!(of_threads(enabled, &[tid]).len(), 2);
}

#[test]
fn test_two_threads_in_one_interval() {
    let id = TraceId(0x103);
    let source = source();
    source.start_interval();

    let barrier = Arc::new(Barrier::new(2));
    let workers: Vec<_> = (0..2)
        .map(|_| {
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                barrier.wait();
                for _ in 0..2 {
                    capture::scope_entry(id);
                    thread::sleep(Duration::from_millis(5));
                    capture::scope_exit(id);
                }
                current_tid()
            })
        })
        .collect();
    let tids: Vec<Tid> = workers.into_iter().map(|w| w.join().unwrap()).collect();

    // Both threads have exited; their buffers are drained as orphans.
    source.stop_interval();
    let events = of_threads(source.finish_interval().unwrap(), &tids);
    assert_eq!(events.len(), 8);
    for tid in &tids {
        let own: Vec<Phase> = events.iter().filter(|e| e.tid == *tid).map(|e| e.ph).collect();
        assert_eq!(own, [Phase::Begin, Phase::End, Phase::Begin, Phase::End]);
    }
}

#[test]
fn test_name_set_after_capture_resolves_at_drain() {
    let id = TraceId(0x104);
    let (tid, events) = thread::spawn(move || {
        let source = source();
        source.start_interval();
        capture::scope_entry(id);
        capture::scope_exit(id);
        capture::set_trace_name(id, "renamed late");
        (current_tid(), source.finish_interval().unwrap())
    })
    .join()
    .unwrap();

    let events = of_threads(events, &[tid]);
    assert_eq!(events.len(), 2);
    assert!(events.iter().all(|e| e.name == "renamed late"));
}

#[test]
fn test_unnamed_id_renders_placeholder() {
    let id = TraceId(0x0bad_f00d);
    let (tid, events) = thread::spawn(move || {
        let source = source();
        source.start_interval();
        capture::scope_entry(id);
        capture::scope_exit(id);
        (current_tid(), source.finish_interval().unwrap())
    })
    .join()
    .unwrap();

    let events = of_threads(events, &[tid]);
    assert_eq!(events[0].name, "Unknown trace id 0xbadf00d");
}

#[test]
fn test_finish_without_start_is_empty() {
    assert!(source().finish_interval().unwrap().is_empty());
}

#[test]
fn test_macros_and_marks() {
    let (tid, events) = thread::spawn(|| {
        let source = source();
        source.start_interval();
        for _ in 0..2 {
            trace_scope!("macro scope");
            trace_mark!(MarkLevel::Global, "macro mark");
        }
        (current_tid(), source.finish_interval().unwrap())
    })
    .join()
    .unwrap();

    let events = of_threads(events, &[tid]);
    let summary: Vec<(Phase, &str)> = events.iter().map(|e| (e.ph, e.name.as_str())).collect();
    assert_eq!(
        summary,
        [
            (Phase::Begin, "macro scope"),
            (Phase::Instant, "macro mark"),
            (Phase::End, "macro scope"),
            (Phase::Begin, "macro scope"),
            (Phase::Instant, "macro mark"),
            (Phase::End, "macro scope"),
        ]
    );
    assert_eq!(events[1].s.as_deref(), Some("g"));
    // One id per call site, reused across iterations.
    assert_eq!(capture::trace_names().values().filter(|n| *n == "macro scope").count(), 1);
}

#[test]
fn test_counter_series_accumulate() {
    let (tid, events) = thread::spawn(|| {
        let source = source();
        source.start_interval();
        trace_counter!("ingest", "depth", 3);
        trace_counter!("ingest", "bytes", 10);
        trace_counter!("ingest", "depth", 5);
        trace_counter!("ingest plain", 7);
        (current_tid(), source.finish_interval().unwrap())
    })
    .join()
    .unwrap();

    let events = of_threads(events, &[tid]);
    assert!(events.iter().all(|e| e.ph == Phase::Counter));
    let samples: Vec<(&str, serde_json::Value)> = events
        .iter()
        .map(|e| (e.name.as_str(), serde_json::Value::Object(e.args.clone().unwrap())))
        .collect();
    assert_eq!(
        samples,
        [
            ("ingest", json!({"depth": 3, "bytes": 10})),
            ("ingest", json!({"depth": 3, "bytes": 10})),
            ("ingest", json!({"depth": 5, "bytes": 10})),
            ("ingest plain", json!({"count": 7})),
        ]
    );
    let serialized = serde_json::to_string(&events[0]).unwrap();
    assert!(serialized.contains(r#""ph":"C""#), "{serialized}");
}

#[test]
fn test_events_outside_interval_are_dropped() {
    let id = TraceId(0x105);
    let (tid, events) = thread::spawn(move || {
        let source = source();
        capture::scope_entry(id);
        capture::scope_exit(id);
        source.start_interval();
        capture::scope_entry(id);
        capture::scope_exit(id);
        source.stop_interval();
        capture::scope_entry(id);
        capture::scope_exit(id);
        (current_tid(), source.finish_interval().unwrap())
    })
    .join()
    .unwrap();

    assert_eq!(of_threads(events, &[tid]).len(), 2);
}
