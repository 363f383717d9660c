//! Swarm - connection orchestration
//!
//! The [`Swarm`] owns the per-peer connection caches and the protocol
//! handler table, and exposes connect / disconnect / listen. Outbound
//! connections run the pipeline in [`dial`]; inbound connections are routed
//! through the handler table, where the [`ConnectionManager`] registers the
//! crypto, muxer, identify and relay handlers.

mod dial;
mod error;
mod event;
mod manager;
mod proxy;
pub(crate) mod router;

pub use error::{Result, SwarmError};
pub use event::SwarmEvent;
pub use manager::ConnectionManager;
pub use proxy::ProxyConnection;

use crate::circuit::CIRCUIT_TAG;
use crate::config::SwarmConfig;
use crate::connection::Connection;
use crate::crypto::{CryptoProvider, Plaintext};
use crate::muxer::{MuxedConnection, StreamMuxer};
use crate::protocols::{HandlerFn, MatchFn, ProtocolTable};
use crate::stats::Stats;
use crate::transport::{LimitDialer, TransportManager};
use dial::Dial;
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use switchyard_core::{resolve, Multiaddr, PeerBook, PeerId, PeerInfo, PeerRef};
use tokio::sync::{broadcast, watch};
use tracing::{debug, error, info};

/// Callback for raw connections accepted by [`Swarm::listen_on`]
pub type ConnHandler = Arc<dyn Fn(Connection) + Send + Sync>;

/// Cached muxed connection of one peer
pub(crate) struct MuxedEntry {
    conn: Arc<dyn MuxedConnection>,
    info: PeerInfo,
    generation: u64,
    /// Set once the close has been handled: evicted, recorded, announced
    done: watch::Receiver<bool>,
}

impl MuxedEntry {
    /// Close the session and wait until its close has been handled
    async fn shutdown(conn: Arc<dyn MuxedConnection>, mut done: watch::Receiver<bool>) {
        conn.close().await;
        // An error means the watcher is gone, which also ends the wait
        let _ = done.wait_for(|done| *done).await;
    }
}

/// Outcome of [`Shared::adopt_muxed`]
pub(crate) enum Adopted {
    New,
    Existing(Arc<dyn MuxedConnection>),
}

/// State shared by a swarm's handles and background tasks
pub(crate) struct Shared {
    config: SwarmConfig,
    local: RwLock<PeerInfo>,
    book: Arc<PeerBook>,
    transports: TransportManager,
    protocols: ProtocolTable,
    muxers: RwLock<Vec<Arc<dyn StreamMuxer>>>,
    crypto: RwLock<Arc<dyn CryptoProvider>>,
    identify: AtomicBool,
    /// Secured but unmuxed connections
    conns: Mutex<HashMap<PeerId, Connection>>,
    muxed: RwLock<HashMap<PeerId, MuxedEntry>>,
    /// Every served session, cached or not
    sessions: Mutex<Vec<Weak<dyn MuxedConnection>>>,
    next_generation: AtomicU64,
    events: broadcast::Sender<SwarmEvent>,
    stats: Arc<Stats>,
}

impl Shared {
    pub(crate) fn local_id(&self) -> PeerId {
        self.local.read().id
    }

    pub(crate) fn emit(&self, event: SwarmEvent) {
        // No subscribers is fine
        let _ = self.events.send(event);
    }

    /// The live muxed connection to `id`
    pub(crate) fn muxed_conn(&self, id: &PeerId) -> Option<Arc<dyn MuxedConnection>> {
        self.muxed
            .read()
            .get(id)
            .filter(|entry| !entry.conn.is_closed())
            .map(|entry| entry.conn.clone())
    }

    /// Peer record of a live muxed connection
    pub(crate) fn muxed_info(&self, id: &PeerId) -> Option<PeerInfo> {
        self.muxed
            .read()
            .get(id)
            .filter(|entry| !entry.conn.is_closed())
            .map(|entry| entry.info.clone())
    }

    /// Muxed peers that could relay to `dst`
    pub(crate) fn relay_candidates(&self, dst: &PeerId) -> Vec<PeerInfo> {
        self.muxed
            .read()
            .values()
            .filter(|entry| entry.info.id != *dst && !entry.conn.is_closed())
            .map(|entry| entry.info.clone())
            .collect()
    }

    /// Make `conn` the cached muxed connection of `info.id` unless a live one
    /// is already cached
    ///
    /// A newly cached connection is watched: when it ends it is evicted (if
    /// still the cached one), the peer is marked disconnected and
    /// [`SwarmEvent::PeerMuxClosed`] is emitted exactly once.
    pub(crate) fn adopt_muxed(
        self: &Arc<Self>,
        info: PeerInfo,
        conn: Arc<dyn MuxedConnection>,
    ) -> Adopted {
        let (done_tx, done) = watch::channel(false);
        let generation = {
            let mut muxed = self.muxed.write();
            if let Some(existing) = muxed.get(&info.id) {
                if !existing.conn.is_closed() {
                    return Adopted::Existing(existing.conn.clone());
                }
            }
            let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);
            muxed.insert(
                info.id,
                MuxedEntry {
                    conn: conn.clone(),
                    info: info.clone(),
                    generation,
                    done,
                },
            );
            generation
        };

        let weak = Arc::downgrade(self);
        let closed_info = info.clone();
        tokio::spawn(async move {
            conn.closed().await;
            let Some(shared) = weak.upgrade() else {
                return;
            };
            let id = closed_info.id;
            {
                let mut muxed = shared.muxed.write();
                if muxed.get(&id).map(|entry| entry.generation) == Some(generation) {
                    muxed.remove(&id);
                }
            }
            if let Some(mut record) = shared.book.get(&id) {
                record.disconnect();
                shared.book.update(record);
            }
            shared.stats.peer_disconnected(id);
            info!("Muxed connection to {} closed", id);
            shared.emit(SwarmEvent::PeerMuxClosed(closed_info));
            done_tx.send_replace(true);
        });

        info!("Muxed connection to {} established", info.id);
        self.emit(SwarmEvent::PeerMuxEstablished(info));
        Adopted::New
    }

    /// Route every inbound stream of `muxed`, tagged with the peer record in
    /// `slot` once it is known
    pub(crate) fn serve_streams(
        self: &Arc<Self>,
        muxed: Arc<dyn MuxedConnection>,
        slot: Arc<RwLock<Option<PeerInfo>>>,
    ) {
        {
            let mut sessions = self.sessions.lock();
            sessions.retain(|session| session.upgrade().is_some_and(|s| !s.is_closed()));
            sessions.push(Arc::downgrade(&muxed));
        }
        let weak = Arc::downgrade(self);
        tokio::spawn(async move {
            while let Some(mut stream) = muxed.accept().await {
                let Some(shared) = weak.upgrade() else {
                    break;
                };
                if let Some(info) = slot.read().clone() {
                    stream.set_peer_info(info);
                }
                router::route(&shared, stream);
            }
            debug!("Stream accept loop ended");
        });
    }

    /// Merge addresses a remote observed for us into the local record
    pub(crate) fn merge_observed(&self, observed: Vec<Multiaddr>) {
        let mut local = self.local.write();
        for addr in observed {
            if addr.is_circuit() {
                continue;
            }
            if local.add_multiaddr(addr.without_peer_id()) {
                debug!("Learned observed address {}", addr);
            }
        }
    }

    pub(crate) fn stats(&self) -> &Arc<Stats> {
        &self.stats
    }

    /// Served sessions that are still open
    fn live_sessions(&self) -> Vec<Arc<dyn MuxedConnection>> {
        self.sessions
            .lock()
            .drain(..)
            .filter_map(|session| session.upgrade())
            .filter(|session| !session.is_closed())
            .collect()
    }
}

impl Drop for Shared {
    fn drop(&mut self) {
        let mut sessions: Vec<_> = self.muxed.get_mut().drain().map(|(_, e)| e.conn).collect();
        sessions.extend(self.live_sessions());
        if sessions.is_empty() {
            return;
        }
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            return;
        };
        debug!("Swarm dropped with {} open sessions", sessions.len());
        runtime.spawn(async move {
            for session in sessions {
                session.close().await;
            }
        });
    }
}

/// Connection orchestrator
///
/// Cheap to clone; all clones share the same caches, transports and
/// handlers.
#[derive(Clone)]
pub struct Swarm {
    shared: Arc<Shared>,
}

impl Swarm {
    /// Create a swarm with the default configuration
    pub fn new(peer_info: PeerInfo, peer_book: Arc<PeerBook>) -> Self {
        Self::assemble(peer_info, peer_book, SwarmConfig::default())
    }

    /// Create a swarm with a validated configuration
    pub fn with_config(
        peer_info: PeerInfo,
        peer_book: Arc<PeerBook>,
        config: SwarmConfig,
    ) -> Result<Self> {
        config.validate()?;
        Ok(Self::assemble(peer_info, peer_book, config))
    }

    pub fn builder() -> SwarmBuilder {
        SwarmBuilder::default()
    }

    fn assemble(peer_info: PeerInfo, peer_book: Arc<PeerBook>, config: SwarmConfig) -> Self {
        let (events, _) = broadcast::channel(config.event_capacity);
        let dialer = LimitDialer::new(config.per_peer_dial_limit, config.dial_timeout());
        let stats = Stats::new(config.stats.clone());
        stats.start();
        let shared = Arc::new(Shared {
            config,
            local: RwLock::new(peer_info),
            book: peer_book,
            transports: TransportManager::new(dialer),
            protocols: ProtocolTable::new(),
            muxers: RwLock::new(Vec::new()),
            crypto: RwLock::new(Arc::new(Plaintext)),
            identify: AtomicBool::new(false),
            conns: Mutex::new(HashMap::new()),
            muxed: RwLock::new(HashMap::new()),
            sessions: Mutex::new(Vec::new()),
            next_generation: AtomicU64::new(0),
            events,
            stats,
        });
        let swarm = Self { shared };
        swarm.connection().crypto(None);
        info!("Swarm created for {}", swarm.shared.local_id());
        swarm
    }

    pub(crate) fn from_shared(shared: Arc<Shared>) -> Self {
        Self { shared }
    }

    pub(crate) fn shared(&self) -> &Arc<Shared> {
        &self.shared
    }

    /// Configuration-time feature switches
    pub fn connection(&self) -> ConnectionManager {
        ConnectionManager::new(self.shared.clone())
    }

    /// Registered transports
    pub fn transport(&self) -> &TransportManager {
        &self.shared.transports
    }

    pub fn peer_book(&self) -> &Arc<PeerBook> {
        &self.shared.book
    }

    pub fn config(&self) -> &SwarmConfig {
        &self.shared.config
    }

    /// Traffic statistics
    pub fn stats(&self) -> &Arc<Stats> {
        &self.shared.stats
    }

    /// Register an inbound protocol handler; the last registration wins
    pub fn handle(&self, protocol: &str, handler: HandlerFn) {
        self.shared.protocols.insert(protocol, handler, None);
    }

    /// Register a handler selected by a custom match function
    pub fn handle_with_match(&self, protocol: &str, handler: HandlerFn, matcher: MatchFn) {
        self.shared.protocols.insert(protocol, handler, Some(matcher));
    }

    /// Remove a handler; returns whether one was registered
    pub fn unhandle(&self, protocol: &str) -> bool {
        self.shared.protocols.remove(protocol)
    }

    /// Registered protocol ids
    pub fn protocols(&self) -> Vec<String> {
        self.shared.protocols.protocols()
    }

    /// Connect to a peer and optionally open a stream for `protocol`
    ///
    /// Without a protocol the call resolves to `None` once a connection is
    /// established (muxed or not). Bounded by `connect_timeout_secs`.
    pub async fn connect(
        &self,
        peer: impl Into<PeerRef>,
        protocol: Option<&str>,
    ) -> Result<Option<ProxyConnection>> {
        let dial = Dial::new(&self.shared, protocol).run(peer.into());
        match self.shared.config.connect_timeout() {
            Some(limit) => tokio::time::timeout(limit, dial)
                .await
                .map_err(|_| SwarmError::Timeout(limit))?,
            None => dial.await,
        }
    }

    /// Start connecting and return a stream that binds once `protocol` is
    /// negotiated
    pub fn dial(&self, peer: impl Into<PeerRef>, protocol: &str) -> ProxyConnection {
        let (proxy, binder) = ProxyConnection::pending();
        let swarm = self.clone();
        let peer = peer.into();
        let protocol = protocol.to_string();

        tokio::spawn(async move {
            let result = match swarm.connect(peer, Some(&protocol)).await {
                Ok(Some(stream)) => stream
                    .into_inner()
                    .ok_or_else(|| "stream not bound".to_string()),
                Ok(None) => Err("no stream opened".to_string()),
                Err(e) => {
                    debug!("Dial for {} failed: {}", protocol, e);
                    Err(e.to_string())
                }
            };
            let _ = binder.send(result);
        });
        proxy
    }

    /// Drop cached connections to a peer
    ///
    /// A muxed connection is closed, and the call returns once it has been
    /// evicted and [`SwarmEvent::PeerMuxClosed`] emitted.
    pub async fn disconnect(&self, peer: impl Into<PeerRef>) -> Result<()> {
        let id = match peer.into() {
            PeerRef::Info(info) => info.id,
            PeerRef::Id(id) => id,
            addr @ PeerRef::Addr(_) => resolve(addr, &self.shared.book)?.id,
        };

        self.shared.conns.lock().remove(&id);
        let entry = self
            .shared
            .muxed
            .read()
            .get(&id)
            .map(|entry| (entry.conn.clone(), entry.done.clone()));
        if let Some((conn, done)) = entry {
            info!("Disconnecting from {}", id);
            MuxedEntry::shutdown(conn, done).await;
        }
        Ok(())
    }

    /// Listen on every non-circuit transport that accepts a local address
    pub async fn listen(&self) -> Result<Vec<Multiaddr>> {
        let local_addrs = self.local_peer_info().multiaddrs().to_vec();
        let mut bound = Vec::new();
        for name in self.shared.transports.names() {
            if name == CIRCUIT_TAG {
                continue;
            }
            let Some(transport) = self.shared.transports.get(&name) else {
                continue;
            };
            if transport.filter(&local_addrs).is_empty() {
                continue;
            }
            bound.extend(self.listen_on(&name, None).await?);
        }
        Ok(bound)
    }

    /// Listen on the local addresses `name` accepts
    ///
    /// Each configured address is replaced in the local record by the
    /// address actually bound. Accepted connections go to `handler`, or to
    /// the protocol router when none is given.
    pub async fn listen_on(
        &self,
        name: &str,
        handler: Option<ConnHandler>,
    ) -> Result<Vec<Multiaddr>> {
        let transport = self
            .shared
            .transports
            .get(name)
            .ok_or_else(|| SwarmError::UnknownTransport(name.to_string()))?;
        let addrs = transport.filter(self.local_peer_info().multiaddrs());

        let mut bound = Vec::with_capacity(addrs.len());
        for addr in addrs {
            let mut listener = transport.listen(&addr).await?;
            let local = listener.local_addr();
            self.shared.local.write().replace_multiaddr(&addr, local.clone());
            info!("Listening on {} ({})", local, name);

            let weak = Arc::downgrade(&self.shared);
            let handler = handler.clone();
            let transport_name = name.to_string();
            let handle = tokio::spawn(async move {
                loop {
                    match listener.accept().await {
                        Ok(conn) => {
                            let Some(shared) = weak.upgrade() else {
                                break;
                            };
                            let conn = conn.metered(shared.stats.transport_meter(&transport_name));
                            debug!(
                                "Accepted {} connection from {:?}",
                                transport_name,
                                conn.remote_addr()
                            );
                            match &handler {
                                Some(handler) => handler(conn),
                                None => router::route(&shared, conn),
                            }
                        }
                        Err(e) => {
                            error!("Accept error on {}: {}", transport_name, e);
                            if let Some(shared) = weak.upgrade() {
                                shared.emit(SwarmEvent::Error(format!(
                                    "listener {} failed: {}",
                                    transport_name, e
                                )));
                            }
                            break;
                        }
                    }
                }
            });
            self.shared.transports.add_listener(name, handle);
            bound.push(local);
        }
        Ok(bound)
    }

    /// Stop the listeners of one transport
    pub fn close_transport(&self, name: &str) {
        self.shared.transports.close(name);
    }

    /// Close every session, drop warm connections and stop all listeners
    ///
    /// Returns once every cached session has been evicted and announced.
    pub async fn close(&self) {
        self.shared.transports.close_all();
        let cached: Vec<_> = self
            .shared
            .muxed
            .read()
            .values()
            .map(|entry| (entry.conn.clone(), entry.done.clone()))
            .collect();
        for (conn, done) in cached {
            MuxedEntry::shutdown(conn, done).await;
        }
        // Sessions never cached: no identify, or a duplicate of a cached one
        for session in self.shared.live_sessions() {
            session.close().await;
            session.closed().await;
        }
        self.shared.conns.lock().clear();
        self.shared.stats.stop();
        info!("Swarm {} closed", self.shared.local_id());
    }

    /// Peers with a live muxed connection
    pub fn muxed_peers(&self) -> Vec<PeerId> {
        self.shared
            .muxed
            .read()
            .iter()
            .filter(|(_, entry)| !entry.conn.is_closed())
            .map(|(id, _)| *id)
            .collect()
    }

    /// Peers with a cached unmuxed connection
    pub fn warm_peers(&self) -> Vec<PeerId> {
        self.shared.conns.lock().keys().copied().collect()
    }

    /// Tag of the active crypto provider
    pub fn crypto_tag(&self) -> String {
        self.shared.crypto.read().tag().to_string()
    }

    pub fn local_peer_info(&self) -> PeerInfo {
        self.shared.local.read().clone()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SwarmEvent> {
        self.shared.events.subscribe()
    }

    /// Transports able to dial the peer, circuit last
    pub fn available_transports(&self, peer: &PeerInfo) -> Vec<String> {
        self.shared.transports.available(peer)
    }

    /// True iff a non-circuit transport is registered
    pub fn has_transports(&self) -> bool {
        self.shared.transports.has_transports()
    }
}

/// Builder for [`Swarm`]
#[derive(Default)]
pub struct SwarmBuilder {
    peer_info: Option<PeerInfo>,
    peer_book: Option<Arc<PeerBook>>,
    config: SwarmConfig,
}

impl SwarmBuilder {
    pub fn peer_info(mut self, info: PeerInfo) -> Self {
        self.peer_info = Some(info);
        self
    }

    pub fn peer_book(mut self, book: Arc<PeerBook>) -> Self {
        self.peer_book = Some(book);
        self
    }

    pub fn config(mut self, config: SwarmConfig) -> Self {
        self.config = config;
        self
    }

    /// Fails with [`SwarmError::Configuration`] when the peer info or book
    /// is missing or the configuration is invalid
    pub fn build(self) -> Result<Swarm> {
        let peer_info = self
            .peer_info
            .ok_or_else(|| SwarmError::Configuration("you must provide a peer info".into()))?;
        let peer_book = self
            .peer_book
            .ok_or_else(|| SwarmError::Configuration("you must provide a peer book".into()))?;
        Swarm::with_config(peer_info, peer_book, self.config)
    }
}
