//! Error types for switchyard core types

use thiserror::Error;

/// Result type alias using our Error
pub type Result<T> = std::result::Result<T, Error>;

/// Core error types
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Error {
    /// Peer id string is not a base58 sha2-256 multihash
    #[error("invalid peer id: {0}")]
    InvalidPeerId(String),

    /// Multiaddr could not be parsed
    #[error("invalid multiaddr {addr}: {reason}")]
    InvalidMultiaddr { addr: String, reason: String },

    /// Invalid public key bytes
    #[error("invalid public key")]
    InvalidPublicKey,

    /// Signature verification failed
    #[error("invalid signature")]
    InvalidSignature,
}

impl Error {
    pub(crate) fn multiaddr(addr: &str, reason: impl Into<String>) -> Self {
        Self::InvalidMultiaddr {
            addr: addr.to_string(),
            reason: reason.into(),
        }
    }
}
