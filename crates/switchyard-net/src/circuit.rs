//! Circuit relay
//!
//! A peer that cannot be dialed directly is reached through a relay: the
//! source opens a relay stream to the relay and sends HOP, the relay opens a
//! relay stream to the destination and sends STOP, and once both answer with
//! a success status the relay splices the two streams together. The
//! destination then treats the relayed stream as a fresh raw connection.

use crate::connection::{Connection, ConnectionInfo};
use crate::framing::{read_frame, write_frame, FrameError};
use crate::swarm::{router, Shared, Swarm};
use crate::transport::{Listener, Transport, TransportError};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Weak;
use switchyard_core::{Multiaddr, PeerId, PeerRef};
use thiserror::Error;
use tracing::{debug, info};

/// Transport name of the circuit relay
pub const CIRCUIT_TAG: &str = "Circuit";
/// Protocol id of the relay streams
pub const RELAY_PROTOCOL: &str = "/libp2p/circuit/relay/0.1.0";

/// Circuit relay settings
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CircuitConfig {
    /// Register the circuit transport and the relay handler
    pub enabled: bool,
    pub hop: HopConfig,
}

/// Relaying on behalf of other peers
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HopConfig {
    /// Answer HOP requests
    pub enabled: bool,
    /// Dial destinations that are not already connected
    pub active: bool,
}

/// Relay status codes
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum StatusCode {
    Success,
    HopNoConnToDst,
    HopCantDialDst,
    HopCantOpenDstStream,
    HopCantSpeakRelay,
    HopCantRelayToSelf,
    StopRelayRefused,
    MalformedMessage,
}

impl StatusCode {
    /// Numeric code as used on the wire by other relay implementations
    pub fn code(&self) -> u16 {
        match self {
            StatusCode::Success => 100,
            StatusCode::HopNoConnToDst => 260,
            StatusCode::HopCantDialDst => 261,
            StatusCode::HopCantOpenDstStream => 262,
            StatusCode::HopCantSpeakRelay => 270,
            StatusCode::HopCantRelayToSelf => 280,
            StatusCode::StopRelayRefused => 390,
            StatusCode::MalformedMessage => 400,
        }
    }
}

/// Relay stream messages
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum RelayMessage {
    /// Source asks the relay to reach `dst`
    Hop {
        src: PeerId,
        src_addrs: Vec<Multiaddr>,
        dst: PeerId,
    },
    /// Relay tells `dst` that `src` wants a connection
    Stop {
        src: PeerId,
        src_addrs: Vec<Multiaddr>,
        dst: PeerId,
    },
    Status(StatusCode),
}

/// Circuit errors
#[derive(Debug, Error)]
pub enum CircuitError {
    #[error("Frame error: {0}")]
    Frame(#[from] FrameError),
    #[error("Relay refused: {0:?} ({})", .0.code())]
    Refused(StatusCode),
    #[error("Unexpected relay message")]
    UnexpectedMessage,
    #[error("Relay unreachable: {0}")]
    Unreachable(String),
}

/// Pseudo-transport dialing `/p2p-circuit` addresses through a relay
pub struct CircuitTransport {
    swarm: Weak<Shared>,
}

impl CircuitTransport {
    pub(crate) fn new(swarm: Weak<Shared>) -> Self {
        Self { swarm }
    }
}

#[async_trait]
impl Transport for CircuitTransport {
    fn filter(&self, addrs: &[Multiaddr]) -> Vec<Multiaddr> {
        addrs.iter().filter(|a| a.is_circuit()).cloned().collect()
    }

    async fn dial(&self, addr: &Multiaddr) -> Result<Connection, TransportError> {
        let (relay_addr, dst_addr) = addr
            .split_circuit()
            .ok_or_else(|| TransportError::UnsupportedAddress(addr.clone()))?;
        let dst = dst_addr
            .peer_id()
            .ok_or_else(|| TransportError::UnsupportedAddress(addr.clone()))?;
        let shared = self.swarm.upgrade().ok_or(TransportError::Closed)?;
        let swarm = Swarm::from_shared(shared);

        // A relay named in the address, otherwise every connected peer
        let relays: Vec<PeerRef> = if relay_addr.is_empty() {
            swarm
                .shared()
                .relay_candidates(&dst)
                .into_iter()
                .map(PeerRef::Info)
                .collect()
        } else {
            vec![PeerRef::Addr(relay_addr)]
        };

        let mut last_error = String::from("no relay available");
        for relay in relays {
            match hop(&swarm, relay, dst).await {
                Ok(stream) => {
                    info!("Relayed connection to {} established", dst);
                    return Ok(Connection::new(
                        stream,
                        ConnectionInfo {
                            remote_addr: Some(addr.clone()),
                            ..Default::default()
                        },
                    ));
                }
                Err(e) => {
                    debug!("Relay attempt to {} failed: {}", dst, e);
                    last_error = e.to_string();
                }
            }
        }
        Err(TransportError::Relay(last_error))
    }

    async fn listen(&self, _addr: &Multiaddr) -> Result<Box<dyn Listener>, TransportError> {
        Err(TransportError::ListenUnsupported)
    }
}

/// Ask `relay` to connect us to `dst`
async fn hop(
    swarm: &Swarm,
    relay: PeerRef,
    dst: PeerId,
) -> Result<crate::swarm::ProxyConnection, CircuitError> {
    let mut stream = swarm
        .connect(relay, Some(RELAY_PROTOCOL))
        .await
        .map_err(|e| CircuitError::Unreachable(e.to_string()))?
        .ok_or_else(|| CircuitError::Unreachable("no stream".into()))?;

    let local = swarm.local_peer_info();
    let request = RelayMessage::Hop {
        src: local.id,
        src_addrs: local.multiaddrs().to_vec(),
        dst,
    };
    write_frame(&mut stream, &request).await?;

    match read_frame::<_, RelayMessage>(&mut stream).await? {
        RelayMessage::Status(StatusCode::Success) => Ok(stream),
        RelayMessage::Status(code) => Err(CircuitError::Refused(code)),
        _ => Err(CircuitError::UnexpectedMessage),
    }
}

/// Inbound handler for relay streams
pub(crate) async fn handle_relay(swarm: Weak<Shared>, config: CircuitConfig, mut conn: Connection) {
    let message: RelayMessage = match read_frame(&mut conn).await {
        Ok(message) => message,
        Err(e) => {
            debug!("Bad relay request: {}", e);
            let _ = write_frame(&mut conn, &RelayMessage::Status(StatusCode::MalformedMessage)).await;
            return;
        }
    };
    let Some(shared) = swarm.upgrade() else {
        return;
    };
    let swarm = Swarm::from_shared(shared);

    let result = match message {
        RelayMessage::Hop { src, src_addrs, dst } => {
            handle_hop(&swarm, &config, conn, src, src_addrs, dst).await
        }
        RelayMessage::Stop { src, .. } => handle_stop(&swarm, conn, src).await,
        RelayMessage::Status(_) => Err(CircuitError::UnexpectedMessage),
    };
    if let Err(e) = result {
        debug!("Relay request failed: {}", e);
    }
}

async fn handle_hop(
    swarm: &Swarm,
    config: &CircuitConfig,
    mut src_conn: Connection,
    src: PeerId,
    src_addrs: Vec<Multiaddr>,
    dst: PeerId,
) -> Result<(), CircuitError> {
    let refuse = |code| RelayMessage::Status(code);

    if !config.hop.enabled {
        write_frame(&mut src_conn, &refuse(StatusCode::HopCantSpeakRelay)).await?;
        return Err(CircuitError::Refused(StatusCode::HopCantSpeakRelay));
    }
    if dst == swarm.local_peer_info().id {
        write_frame(&mut src_conn, &refuse(StatusCode::HopCantRelayToSelf)).await?;
        return Err(CircuitError::Refused(StatusCode::HopCantRelayToSelf));
    }

    let dst_ref = match swarm.shared().muxed_info(&dst) {
        Some(info) => PeerRef::Info(info),
        None if config.hop.active => PeerRef::Id(dst),
        None => {
            write_frame(&mut src_conn, &refuse(StatusCode::HopNoConnToDst)).await?;
            return Err(CircuitError::Refused(StatusCode::HopNoConnToDst));
        }
    };

    let mut dst_stream = match swarm.connect(dst_ref, Some(RELAY_PROTOCOL)).await {
        Ok(Some(stream)) => stream,
        Ok(None) | Err(_) => {
            write_frame(&mut src_conn, &refuse(StatusCode::HopCantOpenDstStream)).await?;
            return Err(CircuitError::Refused(StatusCode::HopCantOpenDstStream));
        }
    };

    write_frame(&mut dst_stream, &RelayMessage::Stop { src, src_addrs, dst }).await?;
    match read_frame::<_, RelayMessage>(&mut dst_stream).await? {
        RelayMessage::Status(StatusCode::Success) => {}
        _ => {
            write_frame(&mut src_conn, &refuse(StatusCode::StopRelayRefused)).await?;
            return Err(CircuitError::Refused(StatusCode::StopRelayRefused));
        }
    }
    write_frame(&mut src_conn, &RelayMessage::Status(StatusCode::Success)).await?;

    info!("Relaying {} -> {}", src, dst);
    match tokio::io::copy_bidirectional(&mut src_conn, &mut dst_stream).await {
        Ok((up, down)) => debug!("Relay {} -> {} finished ({} / {} bytes)", src, dst, up, down),
        Err(e) => debug!("Relay {} -> {} ended: {}", src, dst, e),
    }
    Ok(())
}

async fn handle_stop(swarm: &Swarm, mut conn: Connection, src: PeerId) -> Result<(), CircuitError> {
    write_frame(&mut conn, &RelayMessage::Status(StatusCode::Success)).await?;

    // The relayed stream is a raw connection from `src`, not from the relay
    let (io, _) = conn.into_parts();
    let relayed = Connection::from_parts(
        io,
        ConnectionInfo {
            remote_addr: Some(Multiaddr::circuit(&src)),
            ..Default::default()
        },
    );
    let relayed = relayed.metered(swarm.shared().stats().transport_meter(CIRCUIT_TAG));
    relayed.attribute(src);
    debug!("Accepted relayed connection from {}", src);
    router::route(swarm.shared(), relayed);
    Ok(())
}

/// Handler registered for [`RELAY_PROTOCOL`]
pub(crate) fn relay_handler(swarm: Weak<Shared>, config: CircuitConfig) -> crate::protocols::HandlerFn {
    if config.hop.enabled {
        info!("Circuit relay hop enabled (active: {})", config.hop.active);
    }
    crate::protocols::handler(move |_protocol, conn| {
        let swarm = swarm.clone();
        let config = config.clone();
        async move { handle_relay(swarm, config, conn).await }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_defaults_disabled() {
        let config: CircuitConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(config, CircuitConfig::default());
        assert!(!config.enabled && !config.hop.enabled && !config.hop.active);

        let config: CircuitConfig =
            serde_json::from_str(r#"{"enabled":true,"hop":{"enabled":true}}"#).unwrap();
        assert!(config.enabled && config.hop.enabled && !config.hop.active);
    }

    #[test]
    fn test_status_codes() {
        assert_eq!(StatusCode::Success.code(), 100);
        assert_eq!(StatusCode::HopCantSpeakRelay.code(), 270);
        assert_eq!(StatusCode::HopCantRelayToSelf.code(), 280);
        assert_eq!(StatusCode::StopRelayRefused.code(), 390);
    }

    #[test]
    fn test_filter_only_circuit_addrs() {
        let transport = CircuitTransport::new(Weak::new());
        let dst = PeerId::random();
        let addrs: Vec<Multiaddr> = vec!["/memory/1".parse().unwrap(), Multiaddr::circuit(&dst)];
        assert_eq!(transport.filter(&addrs), vec![Multiaddr::circuit(&dst)]);
    }

    #[tokio::test]
    async fn test_dial_without_swarm_fails() {
        let transport = CircuitTransport::new(Weak::new());
        let err = transport
            .dial(&Multiaddr::circuit(&PeerId::random()))
            .await
            .unwrap_err();
        assert!(matches!(err, TransportError::Closed));
    }
}
