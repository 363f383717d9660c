//! Traffic statistics
//!
//! Bytes are counted where they cross a connection. Transport connections
//! feed the global, per-transport and per-peer stats; negotiated streams
//! feed the per-protocol stats. Bytes seen before the remote peer is known
//! are held on the connection's meter and credited to the peer once it is.
//!
//! Moving averages of the byte rates are recomputed on a fixed interval,
//! after which the global snapshot is broadcast to subscribers.

use crate::circuit::CIRCUIT_TAG;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};
use switchyard_core::PeerId;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, trace};

/// Moving average windows: 1, 5 and 15 minutes
pub const AVERAGE_WINDOWS: [Duration; 3] = [
    Duration::from_secs(60),
    Duration::from_secs(300),
    Duration::from_secs(900),
];

const UPDATE_CAPACITY: usize = 16;

/// Statistics tunables
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StatsConfig {
    /// Interval between moving average computations
    pub compute_interval_ms: u64,
    /// Disconnected peers whose stats are kept
    pub retained_peers: usize,
}

impl Default for StatsConfig {
    fn default() -> Self {
        Self {
            compute_interval_ms: 2000,
            retained_peers: 50,
        }
    }
}

impl StatsConfig {
    pub fn compute_interval(&self) -> Duration {
        Duration::from_millis(self.compute_interval_ms)
    }
}

/// Byte totals
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct Snapshot {
    pub data_sent: u64,
    pub data_received: u64,
}

/// Exponentially weighted byte rate over a time window
#[derive(Clone, Copy, Debug)]
pub struct MovingAverage {
    window: Duration,
    rate: f64,
}

impl MovingAverage {
    fn new(window: Duration) -> Self {
        Self { window, rate: 0.0 }
    }

    /// Fold in a rate observed over `elapsed`
    fn push(&mut self, elapsed: Duration, rate: f64) {
        let alpha = 1.0 - (-elapsed.as_secs_f64() / self.window.as_secs_f64()).exp();
        self.rate += alpha * (rate - self.rate);
    }

    pub fn window(&self) -> Duration {
        self.window
    }

    /// Bytes per second
    pub fn rate(&self) -> f64 {
        self.rate
    }
}

/// Sent and received rate averages, one per [`AVERAGE_WINDOWS`] entry
#[derive(Clone, Debug)]
pub struct MovingAverages {
    pub data_sent: [MovingAverage; 3],
    pub data_received: [MovingAverage; 3],
}

impl MovingAverages {
    fn new() -> Self {
        Self {
            data_sent: AVERAGE_WINDOWS.map(MovingAverage::new),
            data_received: AVERAGE_WINDOWS.map(MovingAverage::new),
        }
    }

    pub fn sent(&self, window: Duration) -> Option<f64> {
        find_rate(&self.data_sent, window)
    }

    pub fn received(&self, window: Duration) -> Option<f64> {
        find_rate(&self.data_received, window)
    }
}

fn find_rate(averages: &[MovingAverage], window: Duration) -> Option<f64> {
    averages
        .iter()
        .find(|average| average.window == window)
        .map(MovingAverage::rate)
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Direction {
    Sent,
    Received,
}

struct Averaging {
    last: Snapshot,
    averages: MovingAverages,
}

/// Counters of one traffic category
pub struct Stat {
    sent: AtomicU64,
    received: AtomicU64,
    averaging: Mutex<Averaging>,
}

impl Stat {
    fn new() -> Self {
        Self {
            sent: AtomicU64::new(0),
            received: AtomicU64::new(0),
            averaging: Mutex::new(Averaging {
                last: Snapshot::default(),
                averages: MovingAverages::new(),
            }),
        }
    }

    pub fn snapshot(&self) -> Snapshot {
        Snapshot {
            data_sent: self.sent.load(Ordering::Relaxed),
            data_received: self.received.load(Ordering::Relaxed),
        }
    }

    pub fn moving_averages(&self) -> MovingAverages {
        self.averaging.lock().averages.clone()
    }

    fn record(&self, direction: Direction, bytes: u64) {
        let counter = match direction {
            Direction::Sent => &self.sent,
            Direction::Received => &self.received,
        };
        counter.fetch_add(bytes, Ordering::Relaxed);
    }

    /// Fold the traffic since the last computation into the averages;
    /// returns whether there was any
    fn compute(&self, elapsed: Duration) -> bool {
        let now = self.snapshot();
        let mut state = self.averaging.lock();
        let sent = now.data_sent.saturating_sub(state.last.data_sent);
        let received = now.data_received.saturating_sub(state.last.data_received);
        state.last = now;

        let secs = elapsed.as_secs_f64();
        if secs > 0.0 {
            for average in &mut state.averages.data_sent {
                average.push(elapsed, sent as f64 / secs);
            }
            for average in &mut state.averages.data_received {
                average.push(elapsed, received as f64 / secs);
            }
        }
        sent > 0 || received > 0
    }
}

impl fmt::Debug for Stat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Stat")
            .field("snapshot", &self.snapshot())
            .finish_non_exhaustive()
    }
}

/// Traffic statistics of a swarm
pub struct Stats {
    config: StatsConfig,
    global: Arc<Stat>,
    transports: RwLock<HashMap<String, Arc<Stat>>>,
    protocols: RwLock<HashMap<String, Arc<Stat>>>,
    peers: RwLock<HashMap<PeerId, Arc<Stat>>>,
    /// Disconnected peers, oldest first
    disconnected: Mutex<VecDeque<PeerId>>,
    last_compute: Mutex<Instant>,
    updates: broadcast::Sender<Snapshot>,
    ticker: Mutex<Option<JoinHandle<()>>>,
}

impl Stats {
    pub fn new(config: StatsConfig) -> Arc<Self> {
        let (updates, _) = broadcast::channel(UPDATE_CAPACITY);
        Arc::new(Self {
            config,
            global: Arc::new(Stat::new()),
            transports: RwLock::new(HashMap::new()),
            protocols: RwLock::new(HashMap::new()),
            peers: RwLock::new(HashMap::new()),
            disconnected: Mutex::new(VecDeque::new()),
            last_compute: Mutex::new(Instant::now()),
            updates,
            ticker: Mutex::new(None),
        })
    }

    /// Recompute the averages every `compute_interval` until stopped or
    /// dropped
    pub(crate) fn start(self: &Arc<Self>) {
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            debug!("No runtime; stats averages are only computed on demand");
            return;
        };
        let weak = Arc::downgrade(self);
        let period = self.config.compute_interval();
        let handle = runtime.spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(stats) = weak.upgrade() else {
                    break;
                };
                stats.compute();
            }
        });
        if let Some(previous) = self.ticker.lock().replace(handle) {
            previous.abort();
        }
    }

    pub(crate) fn stop(&self) {
        if let Some(handle) = self.ticker.lock().take() {
            handle.abort();
        }
    }

    /// Fold traffic since the last computation into every moving average
    /// and notify subscribers if there was any
    pub fn compute(&self) {
        let elapsed = {
            let mut last = self.last_compute.lock();
            let now = Instant::now();
            let elapsed = now.duration_since(*last);
            *last = now;
            elapsed
        };

        let mut active = self.global.compute(elapsed);
        for map in [&self.transports, &self.protocols] {
            for stat in map.read().values() {
                active |= stat.compute(elapsed);
            }
        }
        for stat in self.peers.read().values() {
            active |= stat.compute(elapsed);
        }

        if active {
            let snapshot = self.global.snapshot();
            trace!("Stats updated: {:?}", snapshot);
            // No subscribers is fine
            let _ = self.updates.send(snapshot);
        }
    }

    /// Global snapshots broadcast after each computation with traffic
    pub fn subscribe(&self) -> broadcast::Receiver<Snapshot> {
        self.updates.subscribe()
    }

    pub fn global(&self) -> Arc<Stat> {
        self.global.clone()
    }

    pub fn for_transport(&self, name: &str) -> Option<Arc<Stat>> {
        self.transports.read().get(name).cloned()
    }

    pub fn for_protocol(&self, protocol: &str) -> Option<Arc<Stat>> {
        self.protocols.read().get(protocol).cloned()
    }

    pub fn for_peer(&self, id: &PeerId) -> Option<Arc<Stat>> {
        self.peers.read().get(id).cloned()
    }

    /// Transports that carried traffic, sorted
    pub fn transports(&self) -> Vec<String> {
        sorted_keys(&self.transports)
    }

    /// Protocols that carried traffic, sorted
    pub fn protocols(&self) -> Vec<String> {
        sorted_keys(&self.protocols)
    }

    /// Peers with stats, including recently disconnected ones
    pub fn peers(&self) -> Vec<PeerId> {
        self.peers.read().keys().copied().collect()
    }

    /// Meter for a transport connection; circuit connections run over
    /// another transport and stay out of the global totals
    pub(crate) fn transport_meter(self: &Arc<Self>, name: &str) -> Meter {
        let mut targets = vec![entry(&self.transports, name)];
        if name != CIRCUIT_TAG {
            targets.push(self.global.clone());
        }
        Meter::new(Arc::downgrade(self), targets, true)
    }

    /// Meter for a stream negotiated to `protocol`
    pub(crate) fn protocol_meter(self: &Arc<Self>, protocol: &str) -> Meter {
        Meter::new(
            Arc::downgrade(self),
            vec![entry(&self.protocols, protocol)],
            false,
        )
    }

    fn peer_connected(&self, id: PeerId) -> Arc<Stat> {
        self.disconnected.lock().retain(|peer| *peer != id);
        self.peers
            .write()
            .entry(id)
            .or_insert_with(|| Arc::new(Stat::new()))
            .clone()
    }

    /// Keep the peer's stats until more than `retained_peers` other peers
    /// have disconnected since
    pub(crate) fn peer_disconnected(&self, id: PeerId) {
        let mut disconnected = self.disconnected.lock();
        if !self.peers.read().contains_key(&id) || disconnected.contains(&id) {
            return;
        }
        disconnected.push_back(id);
        while disconnected.len() > self.config.retained_peers {
            if let Some(evicted) = disconnected.pop_front() {
                trace!("Dropping stats of {}", evicted);
                self.peers.write().remove(&evicted);
            }
        }
    }
}

impl Drop for Stats {
    fn drop(&mut self) {
        self.stop();
    }
}

fn entry(map: &RwLock<HashMap<String, Arc<Stat>>>, key: &str) -> Arc<Stat> {
    if let Some(stat) = map.read().get(key) {
        return stat.clone();
    }
    map.write()
        .entry(key.to_string())
        .or_insert_with(|| Arc::new(Stat::new()))
        .clone()
}

fn sorted_keys(map: &RwLock<HashMap<String, Arc<Stat>>>) -> Vec<String> {
    let mut keys: Vec<String> = map.read().keys().cloned().collect();
    keys.sort();
    keys
}

enum PeerSlot {
    /// Traffic seen before the peer was known
    Pending(Snapshot),
    Known(Arc<Stat>),
}

struct MeterInner {
    stats: Weak<Stats>,
    targets: Vec<Arc<Stat>>,
    peer: Option<Mutex<PeerSlot>>,
}

/// Counts the traffic of one connection into a set of stats
///
/// A transport meter travels with the connection metadata through crypto
/// and muxing, so whichever stage learns the remote id can attribute it.
#[derive(Clone)]
pub struct Meter {
    inner: Arc<MeterInner>,
}

impl Meter {
    fn new(stats: Weak<Stats>, targets: Vec<Arc<Stat>>, tracks_peer: bool) -> Self {
        Self {
            inner: Arc::new(MeterInner {
                stats,
                targets,
                peer: tracks_peer.then(|| Mutex::new(PeerSlot::Pending(Snapshot::default()))),
            }),
        }
    }

    pub(crate) fn tracks_peer(&self) -> bool {
        self.inner.peer.is_some()
    }

    pub(crate) fn record(&self, direction: Direction, bytes: u64) {
        for target in &self.inner.targets {
            target.record(direction, bytes);
        }
        let Some(slot) = &self.inner.peer else {
            return;
        };
        match &mut *slot.lock() {
            PeerSlot::Known(stat) => stat.record(direction, bytes),
            PeerSlot::Pending(pending) => match direction {
                Direction::Sent => pending.data_sent += bytes,
                Direction::Received => pending.data_received += bytes,
            },
        }
    }

    /// Credit this connection's traffic to `peer`; the first attribution
    /// sticks
    pub(crate) fn attribute(&self, peer: PeerId) {
        let (Some(slot), Some(stats)) = (&self.inner.peer, self.inner.stats.upgrade()) else {
            return;
        };
        let mut slot = slot.lock();
        if let PeerSlot::Pending(pending) = *slot {
            let stat = stats.peer_connected(peer);
            stat.record(Direction::Sent, pending.data_sent);
            stat.record(Direction::Received, pending.data_received);
            *slot = PeerSlot::Known(stat);
        }
    }
}

impl fmt::Debug for Meter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Meter")
            .field("tracks_peer", &self.tracks_peer())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stats(retained_peers: usize) -> Arc<Stats> {
        Stats::new(StatsConfig {
            retained_peers,
            ..Default::default()
        })
    }

    #[test]
    fn test_defaults_from_empty_json() {
        let config: StatsConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(config, StatsConfig::default());
        assert_eq!(config.compute_interval(), Duration::from_secs(2));
    }

    #[test]
    fn test_transport_meter_feeds_global_and_transport() {
        let stats = stats(50);
        let meter = stats.transport_meter("tcp");
        meter.record(Direction::Sent, 10);
        meter.record(Direction::Received, 7);

        let expected = Snapshot {
            data_sent: 10,
            data_received: 7,
        };
        assert_eq!(stats.global().snapshot(), expected);
        assert_eq!(stats.for_transport("tcp").unwrap().snapshot(), expected);
        assert_eq!(stats.transports(), vec!["tcp"]);
        assert!(stats.protocols().is_empty());
    }

    #[test]
    fn test_circuit_stays_out_of_global() {
        let stats = stats(50);
        stats.transport_meter(CIRCUIT_TAG).record(Direction::Sent, 5);
        stats.protocol_meter("/echo/1.0.0").record(Direction::Sent, 5);

        assert_eq!(stats.global().snapshot(), Snapshot::default());
        assert_eq!(stats.for_transport(CIRCUIT_TAG).unwrap().snapshot().data_sent, 5);
        assert_eq!(stats.for_protocol("/echo/1.0.0").unwrap().snapshot().data_sent, 5);
    }

    #[test]
    fn test_pending_traffic_credited_on_attribution() {
        let stats = stats(50);
        let id = PeerId::random();
        let meter = stats.transport_meter("memory");
        meter.record(Direction::Received, 100);
        assert!(stats.peers().is_empty());

        meter.attribute(id);
        meter.record(Direction::Sent, 20);
        // A later attribution does not move the traffic
        meter.attribute(PeerId::random());
        meter.record(Direction::Sent, 1);

        assert_eq!(stats.peers(), vec![id]);
        assert_eq!(
            stats.for_peer(&id).unwrap().snapshot(),
            Snapshot {
                data_sent: 21,
                data_received: 100,
            }
        );
        assert!(!stats.protocol_meter("/a/1.0.0").tracks_peer());
    }

    #[test]
    fn test_disconnected_peers_retained_up_to_limit() {
        let stats = stats(1);
        let (first, second) = (PeerId::random(), PeerId::random());
        for id in [first, second] {
            let meter = stats.transport_meter("memory");
            meter.attribute(id);
            meter.record(Direction::Sent, 1);
        }

        stats.peer_disconnected(first);
        assert!(stats.for_peer(&first).is_some());

        stats.peer_disconnected(second);
        assert!(stats.for_peer(&first).is_none());
        assert!(stats.for_peer(&second).is_some());

        // Reconnecting continues the retained counters
        let meter = stats.transport_meter("memory");
        meter.attribute(second);
        meter.record(Direction::Sent, 1);
        assert_eq!(stats.for_peer(&second).unwrap().snapshot().data_sent, 2);
    }

    #[test]
    fn test_moving_average_converges_by_window() {
        let mut fast = MovingAverage::new(AVERAGE_WINDOWS[0]);
        let mut slow = MovingAverage::new(AVERAGE_WINDOWS[2]);
        for _ in 0..10 {
            fast.push(Duration::from_secs(30), 1000.0);
            slow.push(Duration::from_secs(30), 1000.0);
        }
        assert!(fast.rate() > slow.rate());
        assert!(fast.rate() > 990.0 && fast.rate() <= 1000.0);
        assert!(slow.rate() > 0.0);
    }

    #[tokio::test]
    async fn test_compute_notifies_on_traffic() {
        let stats = stats(50);
        let mut updates = stats.subscribe();

        stats.compute();
        assert!(updates.try_recv().is_err());

        stats.transport_meter("memory").record(Direction::Received, 64);
        tokio::time::sleep(Duration::from_millis(10)).await;
        stats.compute();
        assert_eq!(updates.try_recv().unwrap().data_received, 64);

        let averages = stats.global().moving_averages();
        for window in AVERAGE_WINDOWS {
            assert!(averages.received(window).unwrap() > 0.0);
            assert_eq!(averages.sent(window), Some(0.0));
        }
        assert!(averages.received(AVERAGE_WINDOWS[0]) > averages.received(AVERAGE_WINDOWS[2]));
    }
}
