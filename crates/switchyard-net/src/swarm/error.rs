//! Swarm errors

use crate::crypto::CryptoError;
use crate::identify::IdentifyError;
use crate::muxer::MuxerError;
use crate::negotiate::NegotiationError;
use crate::transport::TransportError;
use std::time::Duration;
use switchyard_core::{PeerId, ResolveError};
use thiserror::Error;

/// Errors surfaced by [`super::Swarm`] operations
#[derive(Debug, Error)]
pub enum SwarmError {
    #[error("Configuration error: {0}")]
    Configuration(String),
    #[error("Unrecognized peer reference: {0}")]
    UnrecognizedPeerReference(String),
    #[error("Peer info not found: {0}")]
    PeerInfoNotFound(PeerId),
    #[error("No transports registered")]
    NoTransports,
    #[error("Could not dial {peer} in any of the transports: {} attempts failed", .errors.len())]
    NoDialableTransport {
        peer: PeerId,
        errors: Vec<TransportError>,
    },
    #[error("Crypto handshake not supported: {0}")]
    HandshakeNotSupported(String),
    #[error("Crypto negotiation failed: {0}")]
    CryptoNegotiationFailed(#[source] CryptoError),
    #[error("Muxer negotiation failed")]
    MuxerNegotiationFailed,
    #[error("No muxer available")]
    NoMuxerAvailable,
    #[error("Protocol not supported: {0}")]
    ProtocolNotSupported(String),
    #[error("Connect timed out after {0:?}")]
    Timeout(Duration),
    #[error("Unknown transport: {0}")]
    UnknownTransport(String),
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),
    #[error("Muxer error: {0}")]
    Muxer(#[from] MuxerError),
    #[error("Negotiation error: {0}")]
    Negotiation(#[from] NegotiationError),
    #[error("Identify error: {0}")]
    Identify(#[from] IdentifyError),
}

impl From<ResolveError> for SwarmError {
    fn from(e: ResolveError) -> Self {
        match e {
            ResolveError::UnrecognizedPeerReference(r) => SwarmError::UnrecognizedPeerReference(r),
            ResolveError::PeerInfoNotFound(id) => SwarmError::PeerInfoNotFound(id),
        }
    }
}

pub type Result<T> = std::result::Result<T, SwarmError>;
