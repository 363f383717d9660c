//! Inbound upgrade wiring
//!
//! The [`ConnectionManager`] registers the handlers that take an accepted
//! raw connection through crypto and muxing, and switches identify, circuit
//! relay and the crypto provider on or off.

use super::{router, Adopted, Result, Shared, SwarmEvent};
use crate::circuit::{self, CircuitConfig, CircuitTransport, CIRCUIT_TAG, RELAY_PROTOCOL};
use crate::connection::Connection;
use crate::crypto::{CryptoProvider, Plaintext};
use crate::identify::{self, IDENTIFY_CODEC};
use crate::muxer::{MuxedConnection, StreamMuxer};
use crate::negotiate;
use crate::protocols::handler;
use parking_lot::RwLock;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use switchyard_core::{Multiaddr, PeerInfo};
use tracing::{debug, info, warn};

/// Configuration-time switches of a [`super::Swarm`]
#[derive(Clone)]
pub struct ConnectionManager {
    shared: Arc<Shared>,
}

impl ConnectionManager {
    pub(crate) fn new(shared: Arc<Shared>) -> Self {
        Self { shared }
    }

    /// Register a muxer for dialing and accept inbound sessions for it
    ///
    /// Re-adding a codec replaces the earlier registration in place.
    pub fn add_stream_muxer(&self, muxer: Arc<dyn StreamMuxer>) {
        let codec = muxer.multicodec().to_string();
        {
            let mut muxers = self.shared.muxers.write();
            match muxers.iter_mut().find(|m| m.multicodec() == codec) {
                Some(existing) => *existing = muxer.clone(),
                None => muxers.push(muxer.clone()),
            }
        }

        let weak = Arc::downgrade(&self.shared);
        self.shared.protocols.insert(
            &codec,
            handler(move |_, conn| {
                let weak = weak.clone();
                let muxer = muxer.clone();
                async move {
                    if let Some(shared) = weak.upgrade() {
                        accept_muxed(shared, muxer, conn).await;
                    }
                }
            }),
            None,
        );
        info!("Registered stream muxer {}", codec);
    }

    /// Enable identify and serve the local record to requesters
    pub fn reuse(&self) {
        self.shared.identify.store(true, Ordering::Release);

        let weak = Arc::downgrade(&self.shared);
        self.shared.protocols.insert(
            IDENTIFY_CODEC,
            handler(move |_, conn| {
                let weak = weak.clone();
                async move {
                    let Some(shared) = weak.upgrade() else {
                        return;
                    };
                    let local = shared.local.read().clone();
                    let protocols = shared.protocols.protocols();
                    drop(shared);
                    if let Err(e) = identify::serve(conn, &local, protocols).await {
                        debug!("Serving identify failed: {}", e);
                    }
                }
            }),
            None,
        );
        info!("Identify enabled");
    }

    /// Register the circuit transport and relay handler when enabled
    pub fn enable_circuit_relay(&self, config: CircuitConfig) {
        if !config.enabled {
            debug!("Circuit relay disabled");
            return;
        }
        if config.hop.active && !config.hop.enabled {
            warn!("Circuit relay hop.active has no effect while hop is disabled");
        }

        let weak = Arc::downgrade(&self.shared);
        self.shared
            .transports
            .add(CIRCUIT_TAG, Arc::new(CircuitTransport::new(weak.clone())));
        self.shared
            .protocols
            .insert(RELAY_PROTOCOL, circuit::relay_handler(weak, config), None);
        info!("Circuit relay enabled");
    }

    /// Swap the crypto provider; `None` reverts to plaintext
    ///
    /// The old provider's inbound handler is removed and the new one
    /// encrypts accepted connections before routing them.
    pub fn crypto(&self, provider: Option<Arc<dyn CryptoProvider>>) {
        let provider = provider.unwrap_or_else(|| Arc::new(Plaintext));
        let tag = provider.tag().to_string();
        let old = std::mem::replace(&mut *self.shared.crypto.write(), provider.clone());
        self.shared.protocols.remove(old.tag());

        let weak = Arc::downgrade(&self.shared);
        self.shared.protocols.insert(
            &tag,
            handler(move |_, conn| {
                let weak = weak.clone();
                let provider = provider.clone();
                async move { accept_secure(weak, provider, conn).await }
            }),
            None,
        );
        info!("Crypto provider set to {}", tag);
    }

    pub fn is_identify_enabled(&self) -> bool {
        self.shared.identify.load(Ordering::Acquire)
    }
}

async fn accept_secure(
    weak: std::sync::Weak<Shared>,
    provider: Arc<dyn CryptoProvider>,
    conn: Connection,
) {
    let Some(local) = weak.upgrade().map(|shared| shared.local_id()) else {
        return;
    };
    match provider.encrypt(local, conn, None).await {
        Ok(secured) => {
            if let Some(remote) = secured.remote_id() {
                secured.attribute(remote);
            }
            if let Some(shared) = weak.upgrade() {
                debug!("Inbound connection secured with {}", provider.tag());
                router::route(&shared, secured);
            }
        }
        Err(e) => debug!("Inbound {} handshake failed: {}", provider.tag(), e),
    }
}

/// Wrap an accepted secure connection and, with identify enabled, learn
/// who the remote is before caching the session
async fn accept_muxed(shared: Arc<Shared>, muxer: Arc<dyn StreamMuxer>, conn: Connection) {
    let remote_id = conn.remote_id();
    let meter = conn.info().meter.clone();
    let muxed = muxer.listener(conn);
    let slot = Arc::new(RwLock::new(remote_id.map(|id| {
        shared.book.get(&id).unwrap_or_else(|| PeerInfo::new(id))
    })));
    shared.serve_streams(muxed.clone(), slot.clone());
    debug!("Accepted {} session from {:?}", muxer.multicodec(), remote_id);

    if !shared.identify.load(Ordering::Acquire) {
        return;
    }

    match identify_remote(&muxed).await {
        Ok((peer, observed)) => {
            shared.merge_observed(observed);
            let peer = shared.book.put(peer);
            if let Some(meter) = &meter {
                meter.attribute(peer.id);
            }
            *slot.write() = Some(peer.clone());
            if let Adopted::Existing(_) = shared.adopt_muxed(peer.clone(), muxed) {
                debug!("Already muxed with {}, keeping the existing session cached", peer.id);
            }
        }
        Err(e) => {
            warn!("Identify on inbound session failed: {}", e);
            shared.emit(SwarmEvent::Error(format!("identify failed: {}", e)));
        }
    }
}

async fn identify_remote(
    muxed: &Arc<dyn MuxedConnection>,
) -> Result<(PeerInfo, Vec<Multiaddr>)> {
    let mut stream = muxed.new_stream().await?;
    negotiate::dial(&mut stream, IDENTIFY_CODEC).await?;
    Ok(identify::request(stream).await?)
}
