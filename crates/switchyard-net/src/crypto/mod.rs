//! Connection encryption providers
//!
//! The swarm negotiates the active provider's tag over multistream-select
//! and then hands the raw connection to [`CryptoProvider::encrypt`].

pub mod secure;

use crate::connection::Connection;
use crate::framing::FrameError;
use async_trait::async_trait;
use switchyard_core::PeerId;
use thiserror::Error;

pub use secure::{SecureChannel, SECURE_TAG};

/// Tag of the default, unencrypted provider
pub const PLAINTEXT_TAG: &str = "/plaintext/1.0.0";

/// Cryptographic errors
#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Frame error: {0}")]
    Frame(#[from] FrameError),
    #[error("Invalid handshake: {0}")]
    InvalidHandshake(String),
    #[error("Signature verification failed")]
    SignatureVerificationFailed,
    #[error("Peer id mismatch: expected {expected}, got {actual}")]
    PeerIdMismatch { expected: PeerId, actual: PeerId },
    #[error("Key derivation failed")]
    KeyDerivationFailed,
    #[error("AEAD encryption failed")]
    EncryptionFailed,
    #[error("AEAD decryption failed")]
    DecryptionFailed,
}

/// Pluggable encrypt-and-authenticate step
#[async_trait]
pub trait CryptoProvider: Send + Sync {
    /// Protocol id negotiated before [`CryptoProvider::encrypt`] runs
    fn tag(&self) -> &str;

    /// Secure `conn`; `remote` is the expected remote id when dialing
    async fn encrypt(
        &self,
        local: PeerId,
        conn: Connection,
        remote: Option<PeerId>,
    ) -> Result<Connection, CryptoError>;
}

/// Pass-through provider; records the expected remote id unverified
#[derive(Clone, Copy, Debug, Default)]
pub struct Plaintext;

#[async_trait]
impl CryptoProvider for Plaintext {
    fn tag(&self) -> &str {
        PLAINTEXT_TAG
    }

    async fn encrypt(
        &self,
        _local: PeerId,
        mut conn: Connection,
        remote: Option<PeerId>,
    ) -> Result<Connection, CryptoError> {
        if let Some(remote) = remote {
            conn.set_remote_id(remote);
        }
        Ok(conn)
    }
}
