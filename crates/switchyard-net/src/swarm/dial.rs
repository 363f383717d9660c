//! Outbound connection pipeline
//!
//! `connect()` walks an explicit state machine:
//!
//! ```text
//! Resolve -> ReuseCheck -> TransportDial -> Crypto -> Upgrade -> OpenStream -> Done
//!                |                           ^                     ^
//!                +-- warm connection --------+                     |
//!                +-- live muxed connection ------------------------+
//! ```
//!
//! Each stage either yields the next stage or fails the call with a typed
//! [`SwarmError`]. Muxing failures downgrade to an unmuxed connection rather
//! than failing, unless a protocol was requested and nothing can carry it.

use super::{Adopted, Result, Shared, SwarmError};
use crate::circuit::CIRCUIT_TAG;
use crate::connection::Connection;
use crate::muxer::MuxedConnection;
use crate::negotiate::{self, NegotiationError};
use crate::swarm::proxy::ProxyConnection;
use parking_lot::RwLock;
use std::collections::VecDeque;
use std::sync::Arc;
use switchyard_core::{resolve, Multiaddr, PeerInfo, PeerRef};
use tracing::{debug, info, trace, warn};

/// Where the requested protocol stream will come from
enum Link {
    Muxed(Arc<dyn MuxedConnection>),
    Bare(Connection),
}

enum Stage {
    Resolve(PeerRef),
    ReuseCheck(PeerInfo),
    TransportDial(PeerInfo),
    Crypto(PeerInfo, Connection),
    Upgrade(PeerInfo, Connection),
    OpenStream(PeerInfo, Link),
    Done(Option<ProxyConnection>),
}

impl Stage {
    fn name(&self) -> &'static str {
        match self {
            Stage::Resolve(_) => "resolve",
            Stage::ReuseCheck(_) => "reuse-check",
            Stage::TransportDial(_) => "transport-dial",
            Stage::Crypto(..) => "crypto",
            Stage::Upgrade(..) => "upgrade",
            Stage::OpenStream(..) => "open-stream",
            Stage::Done(_) => "done",
        }
    }
}

/// One `connect()` call
pub(crate) struct Dial<'a> {
    shared: &'a Arc<Shared>,
    protocol: Option<&'a str>,
}

impl<'a> Dial<'a> {
    pub(crate) fn new(shared: &'a Arc<Shared>, protocol: Option<&'a str>) -> Self {
        Self { shared, protocol }
    }

    /// Drive the pipeline to completion
    pub(crate) async fn run(self, peer: PeerRef) -> Result<Option<ProxyConnection>> {
        let mut stage = Stage::Resolve(peer);
        loop {
            trace!("Dial stage: {}", stage.name());
            stage = match stage {
                Stage::Resolve(peer) => self.resolve(peer)?,
                Stage::ReuseCheck(peer) => self.reuse_check(peer),
                Stage::TransportDial(peer) => self.transport_dial(peer).await?,
                Stage::Crypto(peer, conn) => self.crypto(peer, conn).await?,
                Stage::Upgrade(peer, conn) => self.upgrade(peer, conn).await?,
                Stage::OpenStream(peer, link) => self.open_stream(peer, link).await?,
                Stage::Done(stream) => return Ok(stream),
            };
        }
    }

    fn resolve(&self, peer: PeerRef) -> Result<Stage> {
        let info = resolve(peer, &self.shared.book)?;
        Ok(Stage::ReuseCheck(info))
    }

    fn reuse_check(&self, peer: PeerInfo) -> Stage {
        if let Some(muxed) = self.shared.muxed_conn(&peer.id) {
            debug!("Reusing muxed connection to {}", peer.id);
            return Stage::OpenStream(peer, Link::Muxed(muxed));
        }
        if let Some(conn) = self.shared.conns.lock().remove(&peer.id) {
            debug!("Reusing warm connection to {}", peer.id);
            return Stage::Crypto(peer, conn);
        }
        Stage::TransportDial(peer)
    }

    async fn transport_dial(&self, mut peer: PeerInfo) -> Result<Stage> {
        let transports = &self.shared.transports;
        // Circuit alone cannot reach a relay
        if !transports.has_transports() {
            return Err(SwarmError::NoTransports);
        }

        let mut candidates: VecDeque<String> = transports.available(&peer).into();
        let mut circuit_tried = false;
        let mut errors = Vec::new();

        loop {
            let name = match candidates.pop_front() {
                Some(name) => name,
                None if !circuit_tried && transports.has_circuit() => {
                    debug!("Direct transports exhausted for {}, trying circuit", peer.id);
                    peer.add_multiaddr(Multiaddr::circuit(&peer.id));
                    CIRCUIT_TAG.to_string()
                }
                None => {
                    warn!("Could not dial {} ({} attempts)", peer.id, errors.len());
                    return Err(SwarmError::NoDialableTransport {
                        peer: peer.id,
                        errors,
                    });
                }
            };
            circuit_tried |= name == CIRCUIT_TAG;

            match transports.dial(&name, &mut peer).await {
                Ok(conn) => {
                    info!("Connected to {} over {}", peer.id, name);
                    let conn = conn.metered(self.shared.stats().transport_meter(&name));
                    conn.attribute(peer.id);
                    self.shared.book.put(peer.clone());
                    return Ok(Stage::Crypto(peer, conn));
                }
                Err(e) => {
                    debug!("Transport {} failed for {}: {}", name, peer.id, e);
                    errors.push(e);
                }
            }
        }
    }

    async fn crypto(&self, peer: PeerInfo, mut conn: Connection) -> Result<Stage> {
        let provider = self.shared.crypto.read().clone();
        let tag = provider.tag().to_string();

        match negotiate::dial(&mut conn, &tag).await {
            Ok(()) => {}
            Err(NegotiationError::NotSupported(tag)) => {
                return Err(SwarmError::HandshakeNotSupported(tag));
            }
            Err(e) => return Err(e.into()),
        }
        let conn = conn.metered(self.shared.stats().protocol_meter(&tag));

        let secured = provider
            .encrypt(self.shared.local_id(), conn, Some(peer.id))
            .await
            .map_err(|e| {
                warn!("Encryption with {} failed: {}", peer.id, e);
                SwarmError::CryptoNegotiationFailed(e)
            })?;
        debug!("Secured connection to {} with {}", peer.id, tag);
        Ok(Stage::Upgrade(peer, secured))
    }

    async fn upgrade(&self, peer: PeerInfo, mut conn: Connection) -> Result<Stage> {
        conn.set_peer_info(peer.clone());
        let muxers = self.shared.muxers.read().clone();

        let failure = if muxers.is_empty() {
            SwarmError::NoMuxerAvailable
        } else {
            for muxer in &muxers {
                match negotiate::dial(&mut conn, muxer.multicodec()).await {
                    Ok(()) => {
                        let meter = self.shared.stats().protocol_meter(muxer.multicodec());
                        let conn = conn.metered(meter);
                        let muxed = self.attach(&peer, muxer.dialer(conn)).await;
                        return Ok(Stage::OpenStream(peer, Link::Muxed(muxed)));
                    }
                    Err(NegotiationError::NotSupported(codec)) => {
                        debug!("{} rejected muxer {}", peer.id, codec);
                    }
                    Err(e) => return Err(e.into()),
                }
            }
            SwarmError::MuxerNegotiationFailed
        };

        debug!("Continuing unmuxed with {}: {}", peer.id, failure);
        match self.protocol {
            Some(_) => Ok(Stage::OpenStream(peer, Link::Bare(conn))),
            None => {
                // A racing call may have muxed the peer meanwhile
                if self.shared.muxed_conn(&peer.id).is_none() {
                    self.shared.conns.lock().insert(peer.id, conn);
                }
                Ok(Stage::Done(None))
            }
        }
    }

    /// Cache a fresh muxed connection, or defer to one a racing call cached
    async fn attach(
        &self,
        peer: &PeerInfo,
        muxed: Arc<dyn MuxedConnection>,
    ) -> Arc<dyn MuxedConnection> {
        match self.shared.adopt_muxed(peer.clone(), muxed.clone()) {
            Adopted::New => {
                let slot = Arc::new(RwLock::new(Some(peer.clone())));
                self.shared.serve_streams(muxed.clone(), slot);
                muxed
            }
            Adopted::Existing(existing) => {
                debug!("Already muxed with {}, dropping new connection", peer.id);
                muxed.close().await;
                existing
            }
        }
    }

    async fn open_stream(&self, peer: PeerInfo, link: Link) -> Result<Stage> {
        let Some(protocol) = self.protocol else {
            return Ok(Stage::Done(None));
        };

        let mut stream = match link {
            Link::Muxed(muxed) => muxed.new_stream().await?,
            Link::Bare(conn) => conn,
        };
        stream.set_peer_info(peer.clone());

        match negotiate::dial(&mut stream, protocol).await {
            Ok(()) => {
                debug!("Opened {} to {}", protocol, peer.id);
                let stream = stream.metered(self.shared.stats().protocol_meter(protocol));
                Ok(Stage::Done(Some(ProxyConnection::bound(stream))))
            }
            Err(NegotiationError::NotSupported(protocol)) => {
                Err(SwarmError::ProtocolNotSupported(protocol))
            }
            Err(e) => Err(e.into()),
        }
    }
}
