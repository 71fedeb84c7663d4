//! Remote trace configuration across discovered processes
//!
//! For every peer the request is resolved against the peer's own
//! `process_info`: the peer is matched by pid, its threads by tid. A peer
//! that cannot be resolved is reported as skipped, never as configured off.

use log::{debug, info};
use scopewire_common::{ENDPOINT_PROCESS_INFO, ENDPOINT_TRACE_CONFIGURATOR};
use std::collections::BTreeSet;
use std::fmt;

use std::sync::Arc;

use crate::discovery::{EndpointManagerPoll, Peer, PeerMap};
use crate::domain::{Address, ConfigurationFailure, Pid, Tid};
use crate::endpoint::{Endpoint, EndpointProcessInfo, EndpointTraceConfigurator, ProcessInfo, TraceConfiguration};
use crate::transport::Transport;

/// What to switch, and where
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConfigureRequest {
    /// State for matched processes and threads
    pub state: bool,
    pub process_ids: BTreeSet<Pid>,
    pub thread_ids: BTreeSet<Tid>,
    /// Process state for peers whose pid is not in `process_ids`
    pub unmatched_process: Option<bool>,
    /// Thread state for threads not in `thread_ids`
    pub unmatched_thread: Option<bool>,
    /// Also set the new-thread default of matched processes to `state`
    pub new_thread: bool,
}

impl ConfigureRequest {
    /// Switch the given processes.
    pub fn processes(state: bool, pids: impl IntoIterator<Item = Pid>) -> Self {
        Self { state, process_ids: pids.into_iter().collect(), ..Self::default() }
    }

    /// Switch the given threads, wherever they live.
    pub fn threads(state: bool, tids: impl IntoIterator<Item = Tid>) -> Self {
        Self { state, thread_ids: tids.into_iter().collect(), ..Self::default() }
    }

    /// The configuration to send to the process described by `info`
    pub fn configuration_for(&self, info: &ProcessInfo) -> TraceConfiguration {
        let mut config = TraceConfiguration::default();
        let matched = self.process_ids.contains(&info.pid);

        if matched {
            config.set_process_state = true;
            config.process_state = self.state;
        } else if let Some(state) = self.unmatched_process {
            config.set_process_state = true;
            config.process_state = state;
        }

        if !self.thread_ids.is_empty() || self.unmatched_thread.is_some() {
            for tid in info.threads.keys() {
                if self.thread_ids.contains(tid) {
                    config.thread_state.insert(*tid, self.state);
                } else if let Some(state) = self.unmatched_thread {
                    config.thread_state.insert(*tid, state);
                }
            }
        }

        let touches_process = matched || info.threads.keys().any(|tid| self.thread_ids.contains(tid));
        if self.new_thread && touches_process {
            config.set_new_thread_state = true;
            config.new_thread_state = self.state;
        }
        config
    }
}

/// Result of configuring one peer
#[derive(Debug)]
pub enum PeerOutcome {
    /// The peer applied the configuration and reported this state
    Configured { address: Address, pid: Pid, state: TraceConfiguration },
    Skipped { address: Address, reason: ConfigurationFailure },
}

impl PeerOutcome {
    pub fn address(&self) -> &Address {
        match self {
            PeerOutcome::Configured { address, .. } | PeerOutcome::Skipped { address, .. } => address,
        }
    }

    pub fn is_configured(&self) -> bool {
        matches!(self, PeerOutcome::Configured { .. })
    }
}

impl fmt::Display for PeerOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PeerOutcome::Configured { address, pid, state } => {
                write!(
                    f,
                    "{address} {pid}: process {}, new threads {}",
                    on_off(state.process_state),
                    on_off(state.new_thread_state)
                )?;
                for (tid, enabled) in &state.thread_state {
                    write!(f, ", {tid} {}", on_off(*enabled))?;
                }
                Ok(())
            }
            PeerOutcome::Skipped { reason, .. } => write!(f, "skipped: {reason}"),
        }
    }
}

fn on_off(state: bool) -> &'static str {
    if state {
        "on"
    } else {
        "off"
    }
}

/// Register the client endpoints [`configure_peers`] needs. Must precede
/// the poller's first round.
pub fn register_factories(poller: &EndpointManagerPoll) {
    poller.add_endpoint_factory(
        ENDPOINT_PROCESS_INFO,
        Arc::new(|_transport: &Arc<dyn Transport>| Some(EndpointProcessInfo::new() as Arc<dyn Endpoint>)),
    );
    poller.add_endpoint_factory(
        ENDPOINT_TRACE_CONFIGURATOR,
        Arc::new(|_transport: &Arc<dyn Transport>| Some(EndpointTraceConfigurator::new() as Arc<dyn Endpoint>)),
    );
}

/// Apply `request` to every peer, in address order.
pub fn configure_peers(peers: &PeerMap, request: &ConfigureRequest) -> Vec<PeerOutcome> {
    peers
        .iter()
        .map(|(address, peer)| match configure_peer(address, peer, request) {
            Ok((pid, state)) => {
                info!("Configured {address} ({pid})");
                PeerOutcome::Configured { address: address.clone(), pid, state }
            }
            Err(reason) => {
                debug!("Skipping {address}: {reason}");
                PeerOutcome::Skipped { address: address.clone(), reason }
            }
        })
        .collect()
}

fn configure_peer(
    address: &Address,
    peer: &Peer,
    request: &ConfigureRequest,
) -> Result<(Pid, TraceConfiguration), ConfigurationFailure> {
    let process_info = peer
        .endpoint::<EndpointProcessInfo>(ENDPOINT_PROCESS_INFO)
        .ok_or_else(|| ConfigurationFailure::MissingProcessInfo { address: address.clone() })?;
    let configurator = peer
        .endpoint::<EndpointTraceConfigurator>(ENDPOINT_TRACE_CONFIGURATOR)
        .ok_or_else(|| ConfigurationFailure::MissingConfigurator { address: address.clone() })?;

    let info = process_info
        .process_info()
        .map_err(|source| ConfigurationFailure::NoResponse { address: address.clone(), source })?;
    let state = configurator
        .set_trace_state(&request.configuration_for(&info))
        .map_err(|source| ConfigurationFailure::NoResponse { address: address.clone(), source })?;
    Ok((info.pid, state))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    fn info(pid: u32, tids: &[u32]) -> ProcessInfo {
        ProcessInfo {
            name: "app".to_string(),
            pid: Pid(pid),
            threads: tids.iter().map(|t| (Tid(*t), format!("t{t}"))).collect::<BTreeMap<_, _>>(),
        }
    }

    #[test]
    fn test_matched_process_is_set() {
        let request = ConfigureRequest::processes(true, [Pid(10)]);
        let config = request.configuration_for(&info(10, &[10, 11]));
        assert!(config.set_process_state);
        assert!(config.process_state);
        assert!(config.thread_state.is_empty());
        assert!(!config.set_new_thread_state);
    }

    #[test]
    fn test_unmatched_process_left_alone_by_default() {
        let request = ConfigureRequest::processes(true, [Pid(10)]);
        let config = request.configuration_for(&info(20, &[20]));
        assert_eq!(config, TraceConfiguration::default());
    }

    #[test]
    fn test_unmatched_process_fallback() {
        let request = ConfigureRequest { unmatched_process: Some(false), ..ConfigureRequest::processes(true, [Pid(10)]) };
        let config = request.configuration_for(&info(20, &[20]));
        assert!(config.set_process_state);
        assert!(!config.process_state);
    }

    #[test]
    fn test_threads_matched_and_unmatched() {
        let request = ConfigureRequest { unmatched_thread: Some(true), ..ConfigureRequest::threads(false, [Tid(11)]) };
        let config = request.configuration_for(&info(10, &[10, 11, 12]));
        assert!(!config.set_process_state);
        assert!(!config.thread_state[&Tid(11)]);
        assert!(config.thread_state[&Tid(10)]);
        assert!(config.thread_state[&Tid(12)]);
    }

    #[test]
    fn test_new_thread_only_for_touched_processes() {
        let request = ConfigureRequest { new_thread: true, ..ConfigureRequest::processes(false, [Pid(10)]) };
        let matched = request.configuration_for(&info(10, &[10]));
        assert!(matched.set_new_thread_state);
        assert!(!matched.new_thread_state);
        assert!(!request.configuration_for(&info(20, &[20])).set_new_thread_state);
    }

    #[test]
    fn test_skipped_outcome_display() {
        let outcome = PeerOutcome::Skipped {
            address: Address::from("42_scopewire"),
            reason: ConfigurationFailure::MissingProcessInfo { address: Address::from("42_scopewire") },
        };
        assert!(!outcome.is_configured());
        assert_eq!(outcome.to_string(), "skipped: 42_scopewire does not expose process info");
    }
}
