//! Peer address book
//!
//! Canonical store of known peers. Records are handed out by value; callers
//! that learn something new write it back with [`PeerBook::put`].

use crate::identity::PeerId;
use crate::peer::PeerInfo;
use parking_lot::RwLock;
use std::collections::HashMap;

/// Thread-safe map from peer id to its canonical [`PeerInfo`]
#[derive(Debug, Default)]
pub struct PeerBook {
    peers: RwLock<HashMap<PeerId, PeerInfo>>,
}

impl PeerBook {
    pub fn new() -> Self {
        Self::default()
    }

    /// Merge `info` into the stored record and return the canonical result
    pub fn put(&self, info: PeerInfo) -> PeerInfo {
        let mut peers = self.peers.write();
        match peers.get_mut(&info.id) {
            Some(existing) => {
                existing.merge(&info);
                existing.clone()
            }
            None => {
                peers.insert(info.id, info.clone());
                info
            }
        }
    }

    /// Overwrite the stored record
    pub fn update(&self, info: PeerInfo) {
        self.peers.write().insert(info.id, info);
    }

    pub fn get(&self, id: &PeerId) -> Option<PeerInfo> {
        self.peers.read().get(id).cloned()
    }

    /// Lookup by the canonical string form
    pub fn get_by_base58(&self, id: &str) -> Option<PeerInfo> {
        let id = PeerId::from_base58(id).ok()?;
        self.get(&id)
    }

    pub fn has(&self, id: &PeerId) -> bool {
        self.peers.read().contains_key(id)
    }

    pub fn remove(&self, id: &PeerId) -> Option<PeerInfo> {
        self.peers.write().remove(id)
    }

    pub fn len(&self) -> usize {
        self.peers.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.read().is_empty()
    }

    /// Snapshot of every record
    pub fn peers(&self) -> Vec<PeerInfo> {
        self.peers.read().values().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::multiaddr::Multiaddr;

    fn addr(s: &str) -> Multiaddr {
        s.parse().unwrap()
    }

    #[test]
    fn test_put_merges() {
        let book = PeerBook::new();
        let id = PeerId::random();

        book.put(PeerInfo::with_addrs(id, [addr("/memory/1")]));
        let canonical = book.put(PeerInfo::with_addrs(id, [addr("/memory/2")]));

        assert_eq!(canonical.multiaddrs().len(), 2);
        assert_eq!(book.get(&id).unwrap(), canonical);
        assert_eq!(book.len(), 1);
    }

    #[test]
    fn test_get_by_base58() {
        let book = PeerBook::new();
        let id = PeerId::random();
        book.put(PeerInfo::new(id));

        assert!(book.get_by_base58(&id.to_base58()).is_some());
        assert!(book.get_by_base58("garbage").is_none());
        assert!(book.get_by_base58(&PeerId::random().to_base58()).is_none());
    }

    #[test]
    fn test_update_and_remove() {
        let book = PeerBook::new();
        let id = PeerId::random();
        book.put(PeerInfo::with_addrs(id, [addr("/memory/1")]));

        book.update(PeerInfo::with_addrs(id, [addr("/memory/5")]));
        assert_eq!(book.get(&id).unwrap().multiaddrs(), &[addr("/memory/5")]);

        assert!(book.has(&id));
        assert!(book.remove(&id).is_some());
        assert!(!book.has(&id));
        assert!(book.is_empty());
    }
}
