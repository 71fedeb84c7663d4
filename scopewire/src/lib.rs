//! # Scopewire - Cross-Process Scope Tracing
//!
//! Scopewire records named scopes and marks inside instrumented processes and
//! lets a separate consumer process discover those processes, pull their
//! events and present one merged timeline in the Trace Event Format that
//! browser trace viewers load.
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                   Instrumented Process(es)                      │
//! │  trace_scope!() / trace_mark!()  ─▶  per-thread ring buffers    │
//! │                                          │ drain                │
//! │  DefaultExposer (unix server)            ▼                      │
//! │   • process_info  • trace_mapping  • native_trace_sender        │
//! │   • trace_configurator  • introspect                            │
//! └───────────────────────┬─────────────────────────────────────────┘
//!                         │ framed RPC + broadcasts (@<pid>_scopewire)
//!                         ▼
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                  Consumer (This Crate's Binary)                 │
//! │                                                                 │
//! │  ┌──────────────┐   ┌──────────────┐   ┌──────────────┐       │
//! │  │  Discovery   │──▶│  Providers   │──▶│   Catapult   │       │
//! │  │    (poll)    │   │  / Sources   │   │   backend    │       │
//! │  └──────────────┘   └──────────────┘   └──────┬───────┘       │
//! │                                               │                │
//! │                    ┌──────────────┐   ┌───────▼──────┐        │
//! │                    │  Configure   │   │ TCP server / │        │
//! │                    │ (on / off)   │   │ JSON export  │        │
//! │                    └──────────────┘   └──────────────┘        │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Module Structure
//!
//! ### Instrumented side
//!
//! - [`capture`]: the capture engine
//!   - Lock-free hot path: thread-local buffer, per-thread enable flag
//!   - Trace id → name mapping, resolved when events are drained
//!   - `TraceConfigurator` for process, thread and new-thread state
//!
//! - [`exposer`]: serves all built-in endpoints for this process
//!
//! ### Plumbing
//!
//! - [`transport`]: discoverable connection-oriented transports
//!   - `unix`: abstract unix sockets, discovered through `/proc/net/unix`
//!   - `loopback`: in-process, for tests and embedding
//!   - Length-prefixed frames correlated by token; `PendingResponse` waits
//!
//! - [`endpoint`]: named request handlers attached to connections
//!
//! - [`discovery`]: `EndpointManagerPoll`, which connects to every discovered
//!   peer and attaches client endpoints built by registered factories
//!
//! ### Consumer side
//!
//! - [`provider`]: `TraceEventProvider` / `TraceEventSource` and the
//!   native and general providers
//!
//! - [`catapult`]: aggregation of sources into recording windows and the TCP
//!   server streaming them to viewers
//!
//! - [`configure`]: remote enable/disable across discovered processes
//!
//! - [`export`]: Trace Event Format JSON output
//!
//! ### Shared
//!
//! - [`trace_data`]: the Trace Event Format record
//! - [`domain`]: core types (Pid, Tid, TraceId, Address) and errors
//! - [`process_lookup`]: process and thread names from `/proc`
//! - [`cli`]: command-line argument parsing
//!
//! ## Typical Usage
//!
//! ```bash
//! # In the instrumented application: keep a DefaultExposer alive.
//!
//! # Serve recordings to a viewer on port 9222
//! scopewire catapult_server --port 9222
//!
//! # Record one second of every discovered process into a file
//! scopewire record --duration 1 --output trace.json
//!
//! # Switch tracing off everywhere except process 1234
//! scopewire trace_configure on 1234 --unmatched-pid off
//! ```
//!
//! ## Key Concepts
//!
//! - **Endpoint**: named request handler attached to a connection
//! - **Interval**: a start/stop recording window, drained exactly once
//! - **Trace ID**: process-scoped integer naming a scope, resolved to a name
//!   at drain time
//! - **Mark event**: zero-duration annotation at thread, process or global
//!   scope

pub mod capture;
pub mod catapult;
pub mod cli;
pub mod configure;
pub mod discovery;
pub mod domain;
pub mod endpoint;
pub mod export;
pub mod exposer;
pub mod process_lookup;
pub mod provider;
pub mod trace_data;
pub mod transport;
