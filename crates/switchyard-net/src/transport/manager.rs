//! Named transport registry

use super::{LimitDialer, Transport, TransportError};
use crate::circuit::CIRCUIT_TAG;
use crate::connection::Connection;
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::Arc;
use switchyard_core::PeerInfo;
use tokio::task::JoinHandle;
use tracing::{debug, info};

/// Ordered set of transports plus their running accept loops
pub struct TransportManager {
    transports: RwLock<Vec<(String, Arc<dyn Transport>)>>,
    listeners: Mutex<HashMap<String, Vec<JoinHandle<()>>>>,
    dialer: LimitDialer,
}

impl TransportManager {
    pub fn new(dialer: LimitDialer) -> Self {
        Self {
            transports: RwLock::new(Vec::new()),
            listeners: Mutex::new(HashMap::new()),
            dialer,
        }
    }

    /// Register a transport; re-adding a name replaces it in place
    pub fn add(&self, name: &str, transport: Arc<dyn Transport>) {
        let mut transports = self.transports.write();
        match transports.iter_mut().find(|(n, _)| n == name) {
            Some(entry) => entry.1 = transport,
            None => transports.push((name.to_string(), transport)),
        }
        debug!("Registered transport {}", name);
    }

    /// Unregister a transport and stop its listeners
    pub fn remove(&self, name: &str) -> bool {
        self.close(name);
        let mut transports = self.transports.write();
        let before = transports.len();
        transports.retain(|(n, _)| n != name);
        transports.len() != before
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Transport>> {
        self.transports
            .read()
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, t)| t.clone())
    }

    /// Registered names in registration order
    pub fn names(&self) -> Vec<String> {
        self.transports.read().iter().map(|(n, _)| n.clone()).collect()
    }

    pub fn is_empty(&self) -> bool {
        self.transports.read().is_empty()
    }

    /// True iff at least one non-circuit transport is registered
    pub fn has_transports(&self) -> bool {
        self.transports.read().iter().any(|(n, _)| n != CIRCUIT_TAG)
    }

    pub fn has_circuit(&self) -> bool {
        self.transports.read().iter().any(|(n, _)| n == CIRCUIT_TAG)
    }

    /// Transports able to dial at least one of the peer's addresses,
    /// circuit relay ordered last
    pub fn available(&self, peer: &PeerInfo) -> Vec<String> {
        let mut names: Vec<String> = self
            .transports
            .read()
            .iter()
            .filter(|(_, t)| !t.filter(peer.multiaddrs()).is_empty())
            .map(|(n, _)| n.clone())
            .collect();
        names.sort_by_key(|n| n == CIRCUIT_TAG);
        names
    }

    /// Dial the peer's addresses that `name` accepts and mark the peer
    /// connected on the winning address
    pub async fn dial(&self, name: &str, peer: &mut PeerInfo) -> Result<Connection, TransportError> {
        let transport = self
            .get(name)
            .ok_or_else(|| TransportError::Unknown(name.to_string()))?;
        let addrs = transport.filter(peer.multiaddrs());
        debug!("Dialing {} over {} ({} addresses)", peer.id, name, addrs.len());

        let (conn, addr) = self
            .dialer
            .dial_many(&peer.id, transport.as_ref(), addrs)
            .await?;
        peer.connect(addr);
        Ok(conn)
    }

    /// Track an accept loop for `name`
    pub fn add_listener(&self, name: &str, handle: JoinHandle<()>) {
        self.listeners
            .lock()
            .entry(name.to_string())
            .or_default()
            .push(handle);
    }

    pub fn is_listening(&self, name: &str) -> bool {
        self.listeners
            .lock()
            .get(name)
            .map(|handles| handles.iter().any(|h| !h.is_finished()))
            .unwrap_or(false)
    }

    /// Stop every accept loop of `name`
    pub fn close(&self, name: &str) {
        if let Some(handles) = self.listeners.lock().remove(name) {
            info!("Closing {} listeners for {}", handles.len(), name);
            for handle in handles {
                handle.abort();
            }
        }
    }

    /// Stop every accept loop
    pub fn close_all(&self) {
        let all: Vec<_> = self.listeners.lock().drain().collect();
        for (name, handles) in all {
            debug!("Closing listeners for {}", name);
            for handle in handles {
                handle.abort();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::{MemoryTransport, TcpTransport};
    use std::time::Duration;
    use switchyard_core::{Multiaddr, PeerId};

    fn manager() -> TransportManager {
        TransportManager::new(LimitDialer::new(8, Duration::from_secs(1)))
    }

    #[test]
    fn test_add_replace_remove() {
        let tm = manager();
        tm.add("tcp", Arc::new(TcpTransport::new()));
        tm.add("memory", Arc::new(MemoryTransport::new()));
        tm.add("tcp", Arc::new(TcpTransport::new()));

        assert_eq!(tm.names(), vec!["tcp", "memory"]);
        assert!(tm.remove("tcp"));
        assert!(!tm.remove("tcp"));
        assert_eq!(tm.names(), vec!["memory"]);
    }

    #[test]
    fn test_available_filters_by_address() {
        let tm = manager();
        tm.add("tcp", Arc::new(TcpTransport::new()));
        tm.add("memory", Arc::new(MemoryTransport::new()));

        let peer = PeerInfo::with_addrs(PeerId::random(), ["/memory/5".parse().unwrap()]);
        assert_eq!(tm.available(&peer), vec!["memory"]);
        assert!(tm.has_transports());
        assert!(!tm.has_circuit());
    }

    #[tokio::test]
    async fn test_dial_marks_connected() {
        let tm = manager();
        tm.add("memory", Arc::new(MemoryTransport::new()));

        let mut listener = MemoryTransport::new()
            .listen(&"/memory/0".parse().unwrap())
            .await
            .unwrap();
        let addr: Multiaddr = listener.local_addr();
        let accept = tokio::spawn(async move { listener.accept().await.unwrap() });

        let mut peer = PeerInfo::with_addrs(PeerId::random(), [addr.clone()]);
        tm.dial("memory", &mut peer).await.unwrap();
        accept.await.unwrap();

        assert_eq!(peer.is_connected(), Some(&addr));
    }

    #[tokio::test]
    async fn test_dial_unknown_transport() {
        let tm = manager();
        let mut peer = PeerInfo::new(PeerId::random());
        let err = tm.dial("tcp", &mut peer).await.unwrap_err();
        assert!(matches!(err, TransportError::Unknown(_)));
    }
}
