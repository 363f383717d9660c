//! Peer identity
//!
//! Every node owns an ed25519 [`KeyPair`]. Its [`PeerId`] is the sha2-256
//! digest of the public key, written as a base58 multihash (`Qm…`).

use crate::error::{Error, Result};
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use rand::rngs::OsRng;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use std::str::FromStr;

/// Multihash code for sha2-256
const SHA2_256: u8 = 0x12;
/// Multihash digest length for sha2-256
const DIGEST_LEN: u8 = 32;

/// Unique peer identifier (sha2-256 of the identity public key)
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PeerId([u8; 32]);

impl PeerId {
    /// Derive from an ed25519 public key
    pub fn from_public_key(public_key: &[u8; 32]) -> Self {
        let mut digest = [0u8; 32];
        digest.copy_from_slice(&Sha256::digest(public_key));
        Self(digest)
    }

    /// Wrap a raw sha2-256 digest
    pub fn from_digest(digest: [u8; 32]) -> Self {
        Self(digest)
    }

    /// Random id with no key behind it (tests, placeholder records)
    pub fn random() -> Self {
        let mut digest = [0u8; 32];
        OsRng.fill_bytes(&mut digest);
        Self(digest)
    }

    /// Get the digest bytes
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Canonical string form, used as the cache key everywhere
    pub fn to_base58(&self) -> String {
        let mut multihash = Vec::with_capacity(34);
        multihash.push(SHA2_256);
        multihash.push(DIGEST_LEN);
        multihash.extend_from_slice(&self.0);
        bs58::encode(multihash).into_string()
    }

    /// Parse the canonical string form
    pub fn from_base58(s: &str) -> Result<Self> {
        let bytes = bs58::decode(s)
            .into_vec()
            .map_err(|_| Error::InvalidPeerId(s.to_string()))?;

        match bytes.as_slice() {
            [SHA2_256, DIGEST_LEN, digest @ ..] if digest.len() == DIGEST_LEN as usize => {
                let mut out = [0u8; 32];
                out.copy_from_slice(digest);
                Ok(Self(out))
            }
            _ => Err(Error::InvalidPeerId(s.to_string())),
        }
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_base58())
    }
}

impl fmt::Debug for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PeerId({})", self.to_base58())
    }
}

impl FromStr for PeerId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::from_base58(s)
    }
}

/// Ed25519 keypair for signing and identity
#[derive(Clone)]
pub struct KeyPair {
    signing_key: SigningKey,
}

impl KeyPair {
    /// Generate a new random keypair
    pub fn generate() -> Self {
        let signing_key = SigningKey::generate(&mut OsRng);
        Self { signing_key }
    }

    /// Create from seed bytes (for deterministic testing)
    pub fn from_seed(seed: &[u8; 32]) -> Self {
        let signing_key = SigningKey::from_bytes(seed);
        Self { signing_key }
    }

    /// Get the public key bytes
    pub fn public_key(&self) -> [u8; 32] {
        self.signing_key.verifying_key().to_bytes()
    }

    /// Peer id of this keypair
    pub fn peer_id(&self) -> PeerId {
        PeerId::from_public_key(&self.public_key())
    }

    /// Sign a message
    pub fn sign(&self, message: &[u8]) -> [u8; 64] {
        self.signing_key.sign(message).to_bytes()
    }

    /// Verify a signature made by `public_key`
    pub fn verify(public_key: &[u8; 32], message: &[u8], signature: &[u8; 64]) -> Result<()> {
        let verifying_key =
            VerifyingKey::from_bytes(public_key).map_err(|_| Error::InvalidPublicKey)?;
        let sig = Signature::from_bytes(signature);
        verifying_key
            .verify(message, &sig)
            .map_err(|_| Error::InvalidSignature)
    }
}

impl fmt::Debug for KeyPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyPair")
            .field("peer_id", &self.peer_id())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_peer_id_base58() {
        let id = KeyPair::from_seed(&[7; 32]).peer_id();
        let encoded = id.to_base58();

        assert!(encoded.starts_with("Qm"));
        assert_eq!(PeerId::from_base58(&encoded).unwrap(), id);
        assert_eq!(encoded.parse::<PeerId>().unwrap(), id);
    }

    #[test]
    fn test_peer_id_rejects_garbage() {
        assert!(PeerId::from_base58("Qm123").is_err());
        assert!(PeerId::from_base58("not base58 0OIl").is_err());
    }

    #[test]
    fn test_keypair_sign_verify() {
        let kp = KeyPair::generate();
        let msg = b"hello world";
        let sig = kp.sign(msg);

        assert!(KeyPair::verify(&kp.public_key(), msg, &sig).is_ok());
        assert_eq!(
            KeyPair::verify(&kp.public_key(), b"other", &sig),
            Err(Error::InvalidSignature)
        );
    }

    #[test]
    fn test_deterministic_identity() {
        let a = KeyPair::from_seed(&[1; 32]);
        let b = KeyPair::from_seed(&[1; 32]);
        assert_eq!(a.peer_id(), b.peer_id());
        assert_ne!(a.peer_id(), KeyPair::from_seed(&[2; 32]).peer_id());
    }
}
