//! Identify protocol
//!
//! On a fresh inbound muxed connection the accepting side opens an
//! identify stream; the dialer answers with its peer record and the address
//! it sees the requester on.

use crate::connection::Connection;
use crate::framing::{read_frame, write_frame, FrameError};
use serde::{Deserialize, Serialize};
use switchyard_core::{Multiaddr, PeerId, PeerInfo};
use thiserror::Error;
use tokio::io::AsyncWriteExt;

/// Protocol id of identify
pub const IDENTIFY_CODEC: &str = "/ipfs/id/1.0.0";
pub const PROTOCOL_VERSION: &str = "ipfs/0.1.0";
pub const AGENT_VERSION: &str = concat!("switchyard/", env!("CARGO_PKG_VERSION"));

/// Identify errors
#[derive(Debug, Error)]
pub enum IdentifyError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Frame error: {0}")]
    Frame(#[from] FrameError),
    #[error("Peer id mismatch: expected {expected}, got {actual}")]
    PeerIdMismatch { expected: PeerId, actual: PeerId },
}

/// Self-description sent by the answering side
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdentifyInfo {
    pub protocol_version: String,
    pub agent_version: String,
    pub peer_id: PeerId,
    pub listen_addrs: Vec<Multiaddr>,
    /// Where the answering side sees the requester
    pub observed_addr: Option<Multiaddr>,
    pub protocols: Vec<String>,
}

/// Answer an identify request with the local record
pub async fn serve(
    mut conn: Connection,
    local: &PeerInfo,
    protocols: Vec<String>,
) -> Result<(), IdentifyError> {
    let info = IdentifyInfo {
        protocol_version: PROTOCOL_VERSION.to_string(),
        agent_version: AGENT_VERSION.to_string(),
        peer_id: local.id,
        listen_addrs: local.multiaddrs().to_vec(),
        observed_addr: conn.remote_addr().cloned(),
        protocols,
    };
    write_frame(&mut conn, &info).await?;
    conn.shutdown().await?;
    Ok(())
}

/// Request the remote record; returns it with the addresses the remote
/// observed for us
///
/// When the connection carries an authenticated remote id the claimed id
/// must match it.
pub async fn request(mut conn: Connection) -> Result<(PeerInfo, Vec<Multiaddr>), IdentifyError> {
    let info: IdentifyInfo = read_frame(&mut conn).await?;

    if let Some(expected) = conn.remote_id() {
        if expected != info.peer_id {
            return Err(IdentifyError::PeerIdMismatch {
                expected,
                actual: info.peer_id,
            });
        }
    }

    let mut peer = PeerInfo::with_addrs(info.peer_id, info.listen_addrs);
    peer.protocols.extend(info.protocols);
    Ok((peer, info.observed_addr.into_iter().collect()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::{ConnectionInfo, Io};

    fn conn(io: impl Io, remote_addr: Option<&str>, remote_id: Option<PeerId>) -> Connection {
        Connection::new(
            io,
            ConnectionInfo {
                remote_addr: remote_addr.map(|a| a.parse().unwrap()),
                remote_id,
                ..Default::default()
            },
        )
    }

    #[tokio::test]
    async fn test_identify_exchange() {
        let (a, b) = tokio::io::duplex(4096);
        let mut local = PeerInfo::with_addrs(PeerId::random(), ["/memory/10".parse().unwrap()]);
        local.protocols.insert("/echo/1.0.0".into());

        let server = conn(a, Some("/memory/20"), None);
        let client = conn(b, None, Some(local.id));

        let served = local.clone();
        let serve_task = tokio::spawn(async move {
            serve(server, &served, vec!["/echo/1.0.0".to_string()]).await
        });
        let (peer, observed) = request(client).await.unwrap();
        serve_task.await.unwrap().unwrap();

        assert_eq!(peer.id, local.id);
        assert_eq!(peer.multiaddrs(), local.multiaddrs());
        assert!(peer.protocols.contains("/echo/1.0.0"));
        assert_eq!(observed, vec!["/memory/20".parse::<Multiaddr>().unwrap()]);
    }

    #[tokio::test]
    async fn test_identify_rejects_wrong_claim() {
        let (a, b) = tokio::io::duplex(4096);
        let local = PeerInfo::new(PeerId::random());

        let server = conn(a, None, None);
        let client = conn(b, None, Some(PeerId::random()));

        tokio::spawn(async move { serve(server, &local, vec![]).await });
        let err = request(client).await.unwrap_err();
        assert!(matches!(err, IdentifyError::PeerIdMismatch { .. }));
    }
}
