//! Peer information records

use crate::identity::PeerId;
use crate::multiaddr::Multiaddr;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// Information about a peer
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerInfo {
    /// Peer identifier
    pub id: PeerId,
    /// Known addresses, insertion ordered and deduplicated
    multiaddrs: Vec<Multiaddr>,
    /// Protocols the peer advertised
    pub protocols: BTreeSet<String>,
    /// Address of the live connection, if any
    connected: Option<Multiaddr>,
}

impl PeerInfo {
    /// Create an empty record for `id`
    pub fn new(id: PeerId) -> Self {
        Self {
            id,
            multiaddrs: Vec::new(),
            protocols: BTreeSet::new(),
            connected: None,
        }
    }

    /// Create a record with the given addresses
    pub fn with_addrs(id: PeerId, addrs: impl IntoIterator<Item = Multiaddr>) -> Self {
        let mut info = Self::new(id);
        for addr in addrs {
            info.add_multiaddr(addr);
        }
        info
    }

    pub fn multiaddrs(&self) -> &[Multiaddr] {
        &self.multiaddrs
    }

    /// Add an address; returns false if it was already known
    pub fn add_multiaddr(&mut self, addr: Multiaddr) -> bool {
        if self.multiaddrs.contains(&addr) {
            return false;
        }
        self.multiaddrs.push(addr);
        true
    }

    /// Replace `old` with `new` in place, or append `new` if `old` is unknown
    pub fn replace_multiaddr(&mut self, old: &Multiaddr, new: Multiaddr) {
        match self.multiaddrs.iter().position(|a| a == old) {
            Some(pos) if !self.multiaddrs.contains(&new) => self.multiaddrs[pos] = new,
            Some(pos) => {
                self.multiaddrs.remove(pos);
            }
            None => {
                self.add_multiaddr(new);
            }
        }
    }

    pub fn remove_multiaddr(&mut self, addr: &Multiaddr) {
        self.multiaddrs.retain(|a| a != addr);
    }

    /// Mark connected via `addr`
    pub fn connect(&mut self, addr: Multiaddr) {
        self.connected = Some(addr);
    }

    pub fn disconnect(&mut self) {
        self.connected = None;
    }

    pub fn is_connected(&self) -> Option<&Multiaddr> {
        self.connected.as_ref()
    }

    /// Fold another record for the same peer into this one
    pub fn merge(&mut self, other: &PeerInfo) {
        for addr in &other.multiaddrs {
            self.add_multiaddr(addr.clone());
        }
        self.protocols.extend(other.protocols.iter().cloned());
        if other.connected.is_some() {
            self.connected = other.connected.clone();
        }
    }
}
