//! Swarm notifications

use switchyard_core::PeerInfo;

/// Delivered to every [`super::Swarm::subscribe`] receiver
#[derive(Clone, Debug)]
pub enum SwarmEvent {
    /// A muxed connection to the peer became the cached one
    PeerMuxEstablished(PeerInfo),
    /// The cached muxed connection to the peer ended
    PeerMuxClosed(PeerInfo),
    /// Failure not tied to a pending call (listener, inbound upgrade)
    Error(String),
}
