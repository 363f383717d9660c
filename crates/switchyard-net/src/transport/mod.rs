//! Network transports
//!
//! A [`Transport`] turns a multiaddr into a raw [`Connection`] and can
//! listen for inbound ones. Transports are registered by name with the
//! [`TransportManager`], which dials a peer's matching addresses through the
//! per-peer [`LimitDialer`].

pub mod dialer;
pub mod manager;
pub mod memory;
pub mod tcp;

use crate::connection::Connection;
use async_trait::async_trait;
use switchyard_core::Multiaddr;
use thiserror::Error;

pub use dialer::LimitDialer;
pub use manager::TransportManager;
pub use memory::MemoryTransport;
pub use tcp::TcpTransport;

/// Transport errors
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Unsupported address: {0}")]
    UnsupportedAddress(Multiaddr),
    #[error("Connection refused: {0}")]
    ConnectionRefused(Multiaddr),
    #[error("Dial timed out: {0}")]
    Timeout(Multiaddr),
    #[error("No addresses to dial")]
    NoAddresses,
    #[error("All {} dial attempts failed", .0.len())]
    AllFailed(Vec<TransportError>),
    #[error("Transport not registered: {0}")]
    Unknown(String),
    #[error("Listening not supported")]
    ListenUnsupported,
    #[error("Relay error: {0}")]
    Relay(String),
    #[error("Transport closed")]
    Closed,
}

/// A dialable, listenable network transport
#[async_trait]
pub trait Transport: Send + Sync {
    /// The subset of `addrs` this transport can dial
    fn filter(&self, addrs: &[Multiaddr]) -> Vec<Multiaddr>;

    /// Open a raw connection to `addr`
    async fn dial(&self, addr: &Multiaddr) -> Result<Connection, TransportError>;

    /// Bind a listener on `addr`
    async fn listen(&self, addr: &Multiaddr) -> Result<Box<dyn Listener>, TransportError>;
}

/// A bound listener
#[async_trait]
pub trait Listener: Send {
    /// The address actually bound (port 0 resolved)
    fn local_addr(&self) -> Multiaddr;

    async fn accept(&mut self) -> Result<Connection, TransportError>;
}
