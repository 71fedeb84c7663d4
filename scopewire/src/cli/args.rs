//! CLI argument definitions

use clap::{Parser, Subcommand, ValueEnum};
use scopewire_common::{DEFAULT_CATAPULT_PORT, UNIX_SOCKET_SUFFIX};
use std::path::PathBuf;
use std::time::Duration;

use crate::configure::ConfigureRequest;
use crate::domain::{Pid, Tid};

#[derive(Parser, Debug)]
#[command(
    name = "scopewire",
    about = "Discover traced processes and record their scopes",
    after_help = "\
EXAMPLES:
    scopewire discover                            List reachable processes
    scopewire catapult_server --port 9222         Serve recordings to a viewer
    scopewire record --duration 2 -o trace.json   Record two seconds to a file
    scopewire trace_configure off 1234            Stop tracing in process 1234"
)]
pub struct Args {
    /// Socket name suffix shared with the traced processes
    #[arg(long, global = true, default_value = UNIX_SOCKET_SUFFIX)]
    pub suffix: String,

    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Stream recordings to trace viewers over TCP
    #[command(name = "catapult_server")]
    CatapultServer(ServerArgs),

    /// List reachable processes and the endpoints they serve
    Discover,

    /// Record one window across all discovered processes
    Record(RecordArgs),

    /// Switch tracing on or off in discovered processes
    #[command(name = "trace_configure")]
    TraceConfigure(ConfigureArgs),

    /// Run an instrumented example process
    Demo(DemoArgs),
}

#[derive(clap::Args, Debug)]
pub struct ServerArgs {
    /// TCP port viewers connect to
    #[arg(short, long, default_value_t = DEFAULT_CATAPULT_PORT)]
    pub port: u16,

    /// Seconds between discovery rounds
    #[arg(long, default_value = "1.0", value_parser = parse_seconds)]
    pub poll_interval: Duration,

    /// Longest recording window in seconds before it is sent unrequested
    #[arg(long, default_value = "60.0", value_parser = parse_seconds)]
    pub max_window: Duration,
}

#[derive(clap::Args, Debug)]
pub struct RecordArgs {
    /// Length of the recording window in seconds
    #[arg(short, long, default_value = "1.0", value_parser = parse_seconds)]
    pub duration: Duration,

    /// Write the trace here instead of stdout
    #[arg(short, long, value_name = "FILE")]
    pub output: Option<PathBuf>,
}

#[derive(clap::Args, Debug)]
pub struct ConfigureArgs {
    /// State for the listed ids
    #[arg(value_enum)]
    pub state: Switch,

    /// Process ids, or thread ids with --thread
    pub ids: Vec<u32>,

    /// State for processes not listed
    #[arg(long, value_enum, value_name = "STATE")]
    pub unmatched_pid: Option<Switch>,

    /// State for threads not listed
    #[arg(long, value_enum, value_name = "STATE")]
    pub unmatched_tid: Option<Switch>,

    /// Also set the default for threads created later
    #[arg(long)]
    pub new_thread: bool,

    /// Treat ids as thread ids
    #[arg(long)]
    pub thread: bool,
}

impl ConfigureArgs {
    pub fn to_request(&self) -> ConfigureRequest {
        let state = self.state.into();
        let mut request = if self.thread {
            ConfigureRequest::threads(state, self.ids.iter().copied().map(Tid))
        } else {
            ConfigureRequest::processes(state, self.ids.iter().copied().map(Pid))
        };
        request.unmatched_process = self.unmatched_pid.map(bool::from);
        request.unmatched_thread = self.unmatched_tid.map(bool::from);
        request.new_thread = self.new_thread;
        request
    }
}

#[derive(clap::Args, Debug)]
pub struct DemoArgs {
    /// Process name reported to consumers
    #[arg(long)]
    pub name: Option<String>,

    /// Stop after N seconds (0 = run until interrupted)
    #[arg(long, default_value = "0")]
    pub duration: u64,
}

/// Non-negative, finite number of seconds
fn parse_seconds(value: &str) -> Result<Duration, String> {
    let seconds: f64 = value.parse().map_err(|e| format!("{e}"))?;
    Duration::try_from_secs_f64(seconds).map_err(|_| format!("{value} is not a valid number of seconds"))
}

#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum Switch {
    On,
    Off,
}

impl From<Switch> for bool {
    fn from(switch: Switch) -> bool {
        switch == Switch::On
    }
}
