//! Peer reference resolution
//!
//! Callers name a remote peer by record, by id or by an address carrying an
//! embedded `/p2p/<id>`. [`resolve`] turns any of these into a [`PeerInfo`].

use crate::book::PeerBook;
use crate::identity::PeerId;
use crate::multiaddr::Multiaddr;
use crate::peer::PeerInfo;
use std::str::FromStr;
use thiserror::Error;

/// Resolution errors
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ResolveError {
    #[error("unrecognized peer reference: {0}")]
    UnrecognizedPeerReference(String),
    #[error("peer info not found: {0}")]
    PeerInfoNotFound(PeerId),
}

/// A reference to a remote peer
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PeerRef {
    Info(PeerInfo),
    Id(PeerId),
    Addr(Multiaddr),
}

impl From<PeerInfo> for PeerRef {
    fn from(info: PeerInfo) -> Self {
        PeerRef::Info(info)
    }
}

impl From<&PeerInfo> for PeerRef {
    fn from(info: &PeerInfo) -> Self {
        PeerRef::Info(info.clone())
    }
}

impl From<PeerId> for PeerRef {
    fn from(id: PeerId) -> Self {
        PeerRef::Id(id)
    }
}

impl From<Multiaddr> for PeerRef {
    fn from(addr: Multiaddr) -> Self {
        PeerRef::Addr(addr)
    }
}

impl FromStr for PeerRef {
    type Err = ResolveError;

    /// `/…` is read as a multiaddr, anything else as a base58 peer id
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let unrecognized = || ResolveError::UnrecognizedPeerReference(s.to_string());
        if s.starts_with('/') {
            s.parse::<Multiaddr>().map(PeerRef::Addr).map_err(|_| unrecognized())
        } else {
            PeerId::from_base58(s).map(PeerRef::Id).map_err(|_| unrecognized())
        }
    }
}

/// Resolve a reference against the address book
///
/// An address is attached to the stored record (or a fresh one) without
/// writing back to the book. A bare id must already be known.
pub fn resolve(peer: PeerRef, book: &PeerBook) -> Result<PeerInfo, ResolveError> {
    match peer {
        PeerRef::Info(info) => Ok(info),
        PeerRef::Id(id) => book.get(&id).ok_or(ResolveError::PeerInfoNotFound(id)),
        PeerRef::Addr(addr) => {
            let id = addr
                .peer_id()
                .ok_or_else(|| ResolveError::UnrecognizedPeerReference(addr.to_string()))?;
            let mut info = book.get(&id).unwrap_or_else(|| PeerInfo::new(id));
            info.add_multiaddr(addr);
            Ok(info)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolve_info_passthrough() {
        let book = PeerBook::new();
        let info = PeerInfo::new(PeerId::random());
        assert_eq!(resolve(info.clone().into(), &book).unwrap(), info);
        assert!(book.is_empty());
    }

    #[test]
    fn test_resolve_id_requires_book_entry() {
        let book = PeerBook::new();
        let id = PeerId::random();
        assert_eq!(
            resolve(id.into(), &book),
            Err(ResolveError::PeerInfoNotFound(id))
        );

        book.put(PeerInfo::new(id));
        assert_eq!(resolve(id.into(), &book).unwrap().id, id);
    }

    #[test]
    fn test_resolve_addr() {
        let book = PeerBook::new();
        let id = PeerId::random();
        book.put(PeerInfo::with_addrs(id, ["/memory/1".parse().unwrap()]));

        let addr: Multiaddr = format!("/memory/2/p2p/{id}").parse().unwrap();
        let info = resolve(addr.clone().into(), &book).unwrap();
        assert_eq!(info.id, id);
        assert_eq!(info.multiaddrs().len(), 2);
        assert!(info.multiaddrs().contains(&addr));

        // The book itself is untouched
        assert_eq!(book.get(&id).unwrap().multiaddrs().len(), 1);
    }

    #[test]
    fn test_resolve_addr_without_id() {
        let book = PeerBook::new();
        let addr: Multiaddr = "/memory/2".parse().unwrap();
        assert!(matches!(
            resolve(addr.into(), &book),
            Err(ResolveError::UnrecognizedPeerReference(_))
        ));
    }

    #[test]
    fn test_peer_ref_from_str() {
        let id = PeerId::random();
        assert_eq!(id.to_base58().parse::<PeerRef>().unwrap(), PeerRef::Id(id));
        assert!(matches!(
            format!("/memory/1/p2p/{id}").parse::<PeerRef>().unwrap(),
            PeerRef::Addr(_)
        ));
        assert!(matches!(
            "bananas".parse::<PeerRef>(),
            Err(ResolveError::UnrecognizedPeerReference(_))
        ));
    }
}
