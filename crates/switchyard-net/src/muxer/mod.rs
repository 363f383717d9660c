//! Stream multiplexers
//!
//! A [`StreamMuxer`] wraps a secured connection into a [`MuxedConnection`]
//! carrying many independent streams, each surfaced as a [`Connection`].

pub mod mplex;

use crate::connection::{Connection, ConnectionInfo};
use async_trait::async_trait;
use std::sync::Arc;
use thiserror::Error;

pub use mplex::{Mplex, MPLEX_CODEC};

/// Muxer errors
#[derive(Debug, Error)]
pub enum MuxerError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Muxed connection closed")]
    Closed,
}

/// A multiplexer codec
pub trait StreamMuxer: Send + Sync {
    /// Protocol id negotiated for this muxer
    fn multicodec(&self) -> &str;

    /// Wrap an outbound connection
    fn dialer(&self, conn: Connection) -> Arc<dyn MuxedConnection>;

    /// Wrap an inbound connection
    fn listener(&self, conn: Connection) -> Arc<dyn MuxedConnection>;
}

/// A multiplexed session
#[async_trait]
pub trait MuxedConnection: Send + Sync {
    /// Metadata of the underlying connection
    fn info(&self) -> &ConnectionInfo;

    /// Open an outbound stream
    async fn new_stream(&self) -> Result<Connection, MuxerError>;

    /// Next stream opened by the remote; `None` once the session ends
    async fn accept(&self) -> Option<Connection>;

    /// Tear down the whole session
    async fn close(&self);

    /// Resolves once the session has ended, from either side
    async fn closed(&self);

    fn is_closed(&self) -> bool;
}
