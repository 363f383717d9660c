//! Authenticated secure channel
//!
//! Each side sends its ed25519 identity key and an ed25519-signed x25519
//! ephemeral key. Session keys are derived with HKDF-SHA256 from the shared
//! secret; data then travels as length-delimited ChaCha20-Poly1305 frames
//! with a per-direction nonce counter.

use super::{CryptoError, CryptoProvider};
use crate::connection::{Connection, Io};
use crate::framing::{read_frame, write_frame};
use async_trait::async_trait;
use bytes::Bytes;
use chacha20poly1305::{
    aead::{Aead, KeyInit},
    ChaCha20Poly1305, Nonce,
};
use futures::{SinkExt, StreamExt};
use hkdf::Hkdf;
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use switchyard_core::{KeyPair, PeerId};
use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};
use tokio_util::codec::{FramedRead, FramedWrite, LengthDelimitedCodec};
use tracing::{debug, warn};
use x25519_dalek::{EphemeralSecret, PublicKey as X25519Public, SharedSecret};

/// Protocol id of the secure channel
pub const SECURE_TAG: &str = "/secure-channel/1.0.0";

/// Domain separation for signatures and key derivation
const CONTEXT: &[u8] = b"switchyard/secure-channel/v1";
/// Largest plaintext sealed into one frame
const MAX_PLAINTEXT: usize = 16 * 1024;
/// Poly1305 tag length
const TAG_LEN: usize = 16;
const PIPE_CAPACITY: usize = 64 * 1024;

/// First (and only) handshake message of each side
#[derive(Serialize, Deserialize)]
struct Hello {
    /// ed25519 identity public key
    identity: [u8; 32],
    /// x25519 ephemeral public key
    ephemeral: [u8; 32],
    /// Identity signature over `CONTEXT || ephemeral`
    signature: Vec<u8>,
}

fn signed_payload(ephemeral: &[u8; 32]) -> Vec<u8> {
    let mut payload = CONTEXT.to_vec();
    payload.extend_from_slice(ephemeral);
    payload
}

/// One direction of the channel
struct CipherState {
    cipher: ChaCha20Poly1305,
    nonce_counter: u64,
}

impl CipherState {
    fn new(key: &[u8; 32]) -> Result<Self, CryptoError> {
        let cipher =
            ChaCha20Poly1305::new_from_slice(key).map_err(|_| CryptoError::KeyDerivationFailed)?;
        Ok(Self {
            cipher,
            nonce_counter: 0,
        })
    }

    fn next_nonce(&mut self) -> [u8; 12] {
        let mut nonce_bytes = [0u8; 12];
        nonce_bytes[4..12].copy_from_slice(&self.nonce_counter.to_le_bytes());
        self.nonce_counter += 1;
        nonce_bytes
    }

    fn seal(&mut self, plaintext: &[u8]) -> Result<Vec<u8>, CryptoError> {
        let nonce_bytes = self.next_nonce();
        self.cipher
            .encrypt(Nonce::from_slice(&nonce_bytes), plaintext)
            .map_err(|_| CryptoError::EncryptionFailed)
    }

    fn open(&mut self, ciphertext: &[u8]) -> Result<Vec<u8>, CryptoError> {
        let nonce_bytes = self.next_nonce();
        self.cipher
            .decrypt(Nonce::from_slice(&nonce_bytes), ciphertext)
            .map_err(|_| CryptoError::DecryptionFailed)
    }
}

/// Session keys derived from ECDH
struct SessionKeys {
    seal: CipherState,
    open: CipherState,
}

impl SessionKeys {
    /// Derive session keys from shared secret and role
    fn derive(
        shared_secret: &SharedSecret,
        our_public: &X25519Public,
        their_public: &X25519Public,
    ) -> Result<Self, CryptoError> {
        let hkdf = Hkdf::<Sha256>::new(None, shared_secret.as_bytes());

        // Determine who is "initiator" based on public key ordering
        let is_initiator = our_public.as_bytes() < their_public.as_bytes();
        let (seal_info, open_info): (&[u8], &[u8]) = if is_initiator {
            (b"initiator_to_responder", b"responder_to_initiator")
        } else {
            (b"responder_to_initiator", b"initiator_to_responder")
        };

        let expand = |info: &[u8]| -> Result<[u8; 32], CryptoError> {
            let mut key = [0u8; 32];
            let mut label = CONTEXT.to_vec();
            label.extend_from_slice(info);
            hkdf.expand(&label, &mut key)
                .map_err(|_| CryptoError::KeyDerivationFailed)?;
            Ok(key)
        };

        Ok(Self {
            seal: CipherState::new(&expand(seal_info)?)?,
            open: CipherState::new(&expand(open_info)?)?,
        })
    }
}

/// Secure channel provider bound to a local identity
#[derive(Clone, Debug)]
pub struct SecureChannel {
    keypair: KeyPair,
}

impl SecureChannel {
    pub fn new(keypair: KeyPair) -> Self {
        Self { keypair }
    }

    /// Exchange hellos; returns the authenticated remote id and session keys
    async fn handshake(
        &self,
        conn: &mut Connection,
        expected: Option<PeerId>,
    ) -> Result<(PeerId, SessionKeys), CryptoError> {
        let ephemeral = EphemeralSecret::random_from_rng(OsRng);
        let ephemeral_public = X25519Public::from(&ephemeral);

        let hello = Hello {
            identity: self.keypair.public_key(),
            ephemeral: *ephemeral_public.as_bytes(),
            signature: self
                .keypair
                .sign(&signed_payload(ephemeral_public.as_bytes()))
                .to_vec(),
        };
        write_frame(conn, &hello).await?;
        let theirs: Hello = read_frame(conn).await?;

        if theirs.ephemeral == hello.ephemeral {
            return Err(CryptoError::InvalidHandshake("reflected hello".into()));
        }
        let signature: [u8; 64] = theirs
            .signature
            .as_slice()
            .try_into()
            .map_err(|_| CryptoError::InvalidHandshake("bad signature length".into()))?;
        KeyPair::verify(&theirs.identity, &signed_payload(&theirs.ephemeral), &signature)
            .map_err(|_| CryptoError::SignatureVerificationFailed)?;

        let remote = PeerId::from_public_key(&theirs.identity);
        if let Some(expected) = expected {
            if expected != remote {
                return Err(CryptoError::PeerIdMismatch {
                    expected,
                    actual: remote,
                });
            }
        }

        let their_public = X25519Public::from(theirs.ephemeral);
        let shared = ephemeral.diffie_hellman(&their_public);
        let keys = SessionKeys::derive(&shared, &ephemeral_public, &their_public)?;
        debug!("Secure channel established with {}", remote);
        Ok((remote, keys))
    }
}

#[async_trait]
impl CryptoProvider for SecureChannel {
    fn tag(&self) -> &str {
        SECURE_TAG
    }

    async fn encrypt(
        &self,
        _local: PeerId,
        mut conn: Connection,
        remote: Option<PeerId>,
    ) -> Result<Connection, CryptoError> {
        let (remote_id, keys) = self.handshake(&mut conn, remote).await?;
        let (io, mut info) = conn.into_parts();
        info.remote_id = Some(remote_id);
        Ok(Connection::new(spawn_pump(io, keys), info))
    }
}

/// Move bytes between the plaintext pipe handed to the application and
/// the sealed frames on the wire
fn spawn_pump(inner: Box<dyn Io>, keys: SessionKeys) -> DuplexStream {
    let (app, pump) = tokio::io::duplex(PIPE_CAPACITY);
    let SessionKeys { mut seal, mut open } = keys;

    tokio::spawn(async move {
        let codec = || {
            LengthDelimitedCodec::builder()
                .max_frame_length(MAX_PLAINTEXT + TAG_LEN)
                .new_codec()
        };
        let (inner_read, inner_write) = tokio::io::split(inner);
        let (mut pump_read, mut pump_write) = tokio::io::split(pump);
        let mut frames_in = FramedRead::new(inner_read, codec());
        let mut frames_out = FramedWrite::new(inner_write, codec());

        let outbound = async {
            let mut buf = vec![0u8; MAX_PLAINTEXT];
            loop {
                let n = match pump_read.read(&mut buf).await {
                    Ok(0) | Err(_) => break,
                    Ok(n) => n,
                };
                let sealed = match seal.seal(&buf[..n]) {
                    Ok(sealed) => sealed,
                    Err(e) => {
                        warn!("Secure channel write failed: {}", e);
                        break;
                    }
                };
                if frames_out.send(Bytes::from(sealed)).await.is_err() {
                    break;
                }
            }
            let _ = SinkExt::<Bytes>::close(&mut frames_out).await;
        };

        let inbound = async {
            while let Some(frame) = frames_in.next().await {
                let Ok(frame) = frame else { break };
                match open.open(&frame) {
                    Ok(plain) => {
                        if pump_write.write_all(&plain).await.is_err() {
                            break;
                        }
                    }
                    Err(e) => {
                        warn!("Dropping secure channel: {}", e);
                        break;
                    }
                }
            }
            let _ = pump_write.shutdown().await;
        };

        tokio::join!(outbound, inbound);
    });

    app
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::pair;

    async fn secure_pair(
        a: &KeyPair,
        b: &KeyPair,
        expected_by_a: PeerId,
    ) -> (Result<Connection, CryptoError>, Result<Connection, CryptoError>) {
        let (conn_a, conn_b) = pair(PIPE_CAPACITY);
        let channel_a = SecureChannel::new(a.clone());
        let channel_b = SecureChannel::new(b.clone());
        let (a_id, b_id) = (a.peer_id(), b.peer_id());

        tokio::join!(
            channel_a.encrypt(a_id, conn_a, Some(expected_by_a)),
            channel_b.encrypt(b_id, conn_b, None),
        )
    }

    #[tokio::test]
    async fn test_secure_roundtrip() {
        let alice = KeyPair::from_seed(&[1; 32]);
        let bob = KeyPair::from_seed(&[2; 32]);

        let (a, b) = secure_pair(&alice, &bob, bob.peer_id()).await;
        let (mut a, mut b) = (a.unwrap(), b.unwrap());
        assert_eq!(a.remote_id(), Some(bob.peer_id()));
        assert_eq!(b.remote_id(), Some(alice.peer_id()));

        a.write_all(b"secret message").await.unwrap();
        let mut buf = [0u8; 14];
        b.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"secret message");

        b.write_all(b"reply").await.unwrap();
        let mut buf = [0u8; 5];
        a.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"reply");
    }

    #[tokio::test]
    async fn test_large_write_spans_frames() {
        let alice = KeyPair::generate();
        let bob = KeyPair::generate();
        let (a, b) = secure_pair(&alice, &bob, bob.peer_id()).await;
        let (mut a, mut b) = (a.unwrap(), b.unwrap());

        let data: Vec<u8> = (0..100_000u32).map(|i| i as u8).collect();
        let expected = data.clone();
        let writer = tokio::spawn(async move {
            a.write_all(&data).await.unwrap();
            a.shutdown().await.unwrap();
        });

        let mut received = Vec::new();
        b.read_to_end(&mut received).await.unwrap();
        writer.await.unwrap();
        assert_eq!(received, expected);
    }

    #[tokio::test]
    async fn test_unexpected_identity_rejected() {
        let alice = KeyPair::generate();
        let bob = KeyPair::generate();

        let (a, _b) = secure_pair(&alice, &bob, PeerId::random()).await;
        assert!(matches!(a, Err(CryptoError::PeerIdMismatch { .. })));
    }

    #[test]
    fn test_session_keys_mirror() {
        let alice = EphemeralSecret::random_from_rng(OsRng);
        let bob = EphemeralSecret::random_from_rng(OsRng);
        let alice_pub = X25519Public::from(&alice);
        let bob_pub = X25519Public::from(&bob);

        let mut alice_keys =
            SessionKeys::derive(&alice.diffie_hellman(&bob_pub), &alice_pub, &bob_pub).unwrap();
        let mut bob_keys =
            SessionKeys::derive(&bob.diffie_hellman(&alice_pub), &bob_pub, &alice_pub).unwrap();

        let sealed = alice_keys.seal.seal(b"hello").unwrap();
        assert_eq!(bob_keys.open.open(&sealed).unwrap(), b"hello");

        // Replaying the same frame fails: the nonce moved on
        assert!(bob_keys.open.open(&sealed).is_err());
    }
}
