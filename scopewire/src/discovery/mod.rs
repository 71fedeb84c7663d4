//! Peer discovery
//!
//! [`EndpointManagerPoll`] keeps a live table of reachable peers and the
//! endpoints attached to each, rebuilding it from [`TransportFactory::discover`]
//! either on demand ([`EndpointManagerPoll::manage`]) or on a background timer.
//!
//! [`TransportFactory::discover`]: crate::transport::TransportFactory::discover

pub mod poll;

pub use poll::{EndpointFactory, EndpointManagerPoll, LogHook, Peer, PeerMap};
