//! Trace Event Format records
//!
//! The shape browser trace viewers consume. Begin/end pairs carry
//! `tid`, `pid`, `cat`, `ph`, `ts` and `name`; instant events add the scope
//! letter `s`; counter and metadata events carry their values in `args`.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::domain::{Pid, Tid};
use scopewire_common::MarkLevel;

/// Category of scope and mark events
pub const CATEGORY_PERF: &str = "PERF";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Phase {
    #[serde(rename = "B")]
    Begin,
    #[serde(rename = "E")]
    End,
    #[serde(rename = "i")]
    Instant,
    #[serde(rename = "C")]
    Counter,
    #[serde(rename = "M")]
    Metadata,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TraceEvent {
    pub tid: Tid,
    pub pid: Pid,
    pub cat: String,
    pub ph: Phase,
    /// Microseconds since the Unix epoch
    pub ts: f64,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub s: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub args: Option<Map<String, Value>>,
}

impl TraceEvent {
    pub fn begin(pid: Pid, tid: Tid, ts: f64, name: impl Into<String>) -> Self {
        Self::scoped(pid, tid, Phase::Begin, ts, name.into())
    }

    pub fn end(pid: Pid, tid: Tid, ts: f64, name: impl Into<String>) -> Self {
        Self::scoped(pid, tid, Phase::End, ts, name.into())
    }

    pub fn mark(pid: Pid, tid: Tid, ts: f64, name: impl Into<String>, level: MarkLevel) -> Self {
        let mut event = Self::scoped(pid, tid, Phase::Instant, ts, name.into());
        event.s = Some(level.scope_letter().to_string());
        event
    }

    /// Counter sample; `args` maps series names to values
    pub fn counter(pid: Pid, tid: Tid, ts: f64, name: impl Into<String>, args: Map<String, Value>) -> Self {
        let mut event = Self::scoped(pid, tid, Phase::Counter, ts, name.into());
        event.args = Some(args);
        event
    }

    /// `process_name` / `thread_name` style metadata record
    pub fn metadata(pid: Pid, tid: Tid, name: impl Into<String>, value: impl Into<String>) -> Self {
        let mut args = Map::new();
        args.insert("name".to_string(), Value::String(value.into()));
        Self {
            tid,
            pid,
            cat: String::new(),
            ph: Phase::Metadata,
            ts: 0.0,
            name: name.into(),
            s: None,
            args: Some(args),
        }
    }

    fn scoped(pid: Pid, tid: Tid, ph: Phase, ts: f64, name: String) -> Self {
        Self { tid, pid, cat: CATEGORY_PERF.to_string(), ph, ts, name, s: None, args: None }
    }
}
