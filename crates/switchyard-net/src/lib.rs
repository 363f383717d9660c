//! Connection establishment for the switchyard swarm
//!
//! This crate provides:
//! - Pluggable transports (TCP, in-process memory) with per-peer dial limits
//! - multistream-select protocol negotiation
//! - Plaintext and authenticated secure-channel crypto providers
//! - mplex stream multiplexing
//! - Identify and circuit relay
//! - Global, per-transport, per-protocol and per-peer traffic stats
//! - The [`Swarm`] connection orchestrator

pub mod circuit;
pub mod config;
pub mod connection;
pub mod crypto;
pub mod framing;
pub mod identify;
pub mod muxer;
pub mod negotiate;
pub mod protocols;
pub mod stats;
pub mod swarm;
pub mod transport;
pub mod varint;

pub use circuit::{CircuitConfig, HopConfig, CIRCUIT_TAG, RELAY_PROTOCOL};
pub use config::SwarmConfig;
pub use connection::{Connection, ConnectionInfo};
pub use crypto::{CryptoProvider, Plaintext, SecureChannel, PLAINTEXT_TAG, SECURE_TAG};
pub use identify::IDENTIFY_CODEC;
pub use muxer::{Mplex, MuxedConnection, StreamMuxer, MPLEX_CODEC};
pub use protocols::{handler, matcher, HandlerFn, MatchFn};
pub use stats::{Snapshot, Stat, Stats, StatsConfig, AVERAGE_WINDOWS};
pub use swarm::{
    ConnHandler, ConnectionManager, ProxyConnection, Swarm, SwarmBuilder, SwarmError, SwarmEvent,
};
pub use transport::{MemoryTransport, TcpTransport, Transport, TransportManager};
