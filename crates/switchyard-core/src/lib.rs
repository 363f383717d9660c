//! Core types for the switchyard swarm
//!
//! This crate provides:
//! - Peer identity (ed25519 keypairs, base58 peer ids)
//! - Multiaddr parsing and manipulation
//! - Peer records and the shared address book
//! - Peer reference resolution

pub mod book;
pub mod error;
pub mod identity;
pub mod multiaddr;
pub mod peer;
pub mod resolve;

pub use book::PeerBook;
pub use error::{Error, Result};
pub use identity::{KeyPair, PeerId};
pub use multiaddr::{Multiaddr, Protocol};
pub use peer::PeerInfo;
pub use resolve::{resolve, PeerRef, ResolveError};
