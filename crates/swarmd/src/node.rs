//! swarmd node - swarm wiring and main loop

use crate::config::Config;
use std::sync::Arc;
use switchyard_core::{KeyPair, PeerBook, PeerInfo};
use switchyard_net::{
    handler, HandlerFn, Mplex, SecureChannel, Snapshot, Swarm, SwarmEvent, TcpTransport,
};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Protocol served by every node
pub const ECHO_PROTOCOL: &str = "/echo/1.0.0";

/// Build a swarm from configuration
pub fn build(config: &Config, keypair: KeyPair) -> anyhow::Result<Swarm> {
    let info = PeerInfo::with_addrs(keypair.peer_id(), config.listen.iter().cloned());
    let swarm = Swarm::builder()
        .peer_info(info)
        .peer_book(Arc::new(PeerBook::new()))
        .config(config.swarm_config())
        .build()?;

    swarm.transport().add("tcp", Arc::new(TcpTransport::new()));

    let connection = swarm.connection();
    if config.secure {
        connection.crypto(Some(Arc::new(SecureChannel::new(keypair))));
    }
    if !config.no_mplex {
        connection.add_stream_muxer(Arc::new(Mplex));
    }
    if config.identify {
        connection.reuse();
    }
    connection.enable_circuit_relay(config.circuit_config());

    swarm.handle(ECHO_PROTOCOL, echo());
    Ok(swarm)
}

fn echo() -> HandlerFn {
    handler(|_, conn| async move {
        let remote = conn.remote_id();
        let (mut reader, mut writer) = tokio::io::split(conn);
        match tokio::io::copy(&mut reader, &mut writer).await {
            Ok(n) => debug!("Echoed {} bytes to {:?}", n, remote),
            Err(e) => debug!("Echo to {:?} ended: {}", remote, e),
        }
    })
}

fn spawn_event_logger(mut events: broadcast::Receiver<SwarmEvent>) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(SwarmEvent::PeerMuxEstablished(peer)) => {
                    info!("Peer {} connected ({} addresses)", peer.id, peer.multiaddrs().len())
                }
                Ok(SwarmEvent::PeerMuxClosed(peer)) => info!("Peer {} disconnected", peer.id),
                Ok(SwarmEvent::Error(e)) => warn!("Swarm error: {}", e),
                Err(broadcast::error::RecvError::Lagged(n)) => warn!("Dropped {} swarm events", n),
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    })
}

fn spawn_stats_logger(mut updates: broadcast::Receiver<Snapshot>) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            match updates.recv().await {
                Ok(total) => debug!(
                    "Traffic: {} bytes sent, {} bytes received",
                    total.data_sent, total.data_received
                ),
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    })
}

/// Run the node until Ctrl-C
pub async fn run(config: Config) -> anyhow::Result<()> {
    let keypair = KeyPair::generate();
    let id = keypair.peer_id();
    let swarm = build(&config, keypair)?;
    info!("Peer ID: {}", id);

    let logger = spawn_event_logger(swarm.subscribe());
    let stats_logger = spawn_stats_logger(swarm.stats().subscribe());

    for addr in swarm.listen().await? {
        info!("Listening on {}/p2p/{}", addr, id);
    }

    for peer in &config.bootstrap {
        match swarm.connect(peer.clone(), None).await {
            Ok(_) => info!("Connected to bootstrap peer {}", peer),
            Err(e) => warn!("Bootstrap peer {} unreachable: {}", peer, e),
        }
    }

    tokio::signal::ctrl_c().await?;
    info!("Received shutdown signal");

    swarm.close().await;
    logger.abort();
    stats_logger.abort();
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;
    use switchyard_net::{MPLEX_CODEC, PLAINTEXT_TAG, RELAY_PROTOCOL, SECURE_TAG};

    #[tokio::test]
    async fn test_build_default_node() {
        let config = Config::parse_from(["swarmd", "--listen", "/ip4/127.0.0.1/tcp/0"]);
        let swarm = build(&config, KeyPair::generate()).unwrap();

        let protocols = swarm.protocols();
        assert!(protocols.contains(&PLAINTEXT_TAG.to_string()));
        assert!(protocols.contains(&MPLEX_CODEC.to_string()));
        assert!(protocols.contains(&ECHO_PROTOCOL.to_string()));
        assert!(!protocols.contains(&RELAY_PROTOCOL.to_string()));
        assert!(swarm.has_transports());
    }

    #[tokio::test]
    async fn test_build_secure_relay_node() {
        let config = Config::parse_from([
            "swarmd",
            "--listen",
            "/ip4/127.0.0.1/tcp/0",
            "--secure",
            "--relay",
            "--relay-hop",
        ]);
        let swarm = build(&config, KeyPair::generate()).unwrap();

        assert_eq!(swarm.crypto_tag(), SECURE_TAG);
        assert!(swarm.protocols().contains(&RELAY_PROTOCOL.to_string()));
        assert_eq!(swarm.transport().names(), vec!["tcp", "Circuit"]);
    }

    #[tokio::test]
    async fn test_nodes_echo_over_tcp() {
        use tokio::io::{AsyncReadExt, AsyncWriteExt};

        let config = Config::parse_from(["swarmd", "--listen", "/ip4/127.0.0.1/tcp/0"]);
        let server = build(&config, KeyPair::generate()).unwrap();
        server.listen().await.unwrap();
        let client = build(&config, KeyPair::generate()).unwrap();

        let mut stream = client
            .connect(server.local_peer_info(), Some(ECHO_PROTOCOL))
            .await
            .unwrap()
            .unwrap();
        stream.write_all(b"over tcp").await.unwrap();
        let mut buf = [0u8; 8];
        stream.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"over tcp");

        client.close().await;
        server.close().await;
    }
}
