//! Duplex byte streams with connection metadata
//!
//! Every stage of the pipeline (transport, crypto, muxer stream, relay)
//! produces a [`Connection`]: a boxed byte stream plus the addresses and
//! identity known about the far end.

use crate::stats::{Direction, Meter};
use std::fmt;
use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};
use switchyard_core::{Multiaddr, PeerId, PeerInfo};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

/// Any byte stream a connection can be built on
pub trait Io: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin + 'static> Io for T {}

/// What is known about the far end of a connection
#[derive(Clone, Debug, Default)]
pub struct ConnectionInfo {
    /// Local address the stream is bound to
    pub local_addr: Option<Multiaddr>,
    /// Remote address the stream was dialed on or accepted from
    pub remote_addr: Option<Multiaddr>,
    /// Remote identity, authenticated or asserted by the crypto layer
    pub remote_id: Option<PeerId>,
    /// Peer record attached once the remote is resolved or identified
    pub peer_info: Option<PeerInfo>,
    /// Traffic meter of the transport connection underneath
    pub meter: Option<Meter>,
}

/// A duplex byte stream with metadata
pub struct Connection {
    io: Box<dyn Io>,
    info: ConnectionInfo,
}

impl Connection {
    /// Wrap a byte stream
    pub fn new(io: impl Io, info: ConnectionInfo) -> Self {
        Self {
            io: Box::new(io),
            info,
        }
    }

    /// Reassemble from [`Connection::into_parts`]
    pub fn from_parts(io: Box<dyn Io>, info: ConnectionInfo) -> Self {
        Self { io, info }
    }

    pub fn into_parts(self) -> (Box<dyn Io>, ConnectionInfo) {
        (self.io, self.info)
    }

    pub fn info(&self) -> &ConnectionInfo {
        &self.info
    }

    pub fn remote_addr(&self) -> Option<&Multiaddr> {
        self.info.remote_addr.as_ref()
    }

    pub fn remote_id(&self) -> Option<PeerId> {
        self.info.remote_id
    }

    pub fn set_remote_id(&mut self, id: PeerId) {
        self.info.remote_id = Some(id);
    }

    pub fn peer_info(&self) -> Option<&PeerInfo> {
        self.info.peer_info.as_ref()
    }

    /// Attach the resolved peer record
    pub fn set_peer_info(&mut self, info: PeerInfo) {
        self.info.remote_id.get_or_insert(info.id);
        self.info.peer_info = Some(info);
    }

    /// Count traffic through `meter`; a transport meter is kept in the
    /// metadata so later stages can attribute it
    pub(crate) fn metered(self, meter: Meter) -> Self {
        let (io, mut info) = self.into_parts();
        if meter.tracks_peer() {
            info.meter = Some(meter.clone());
        }
        Self::new(Metered { io, meter }, info)
    }

    /// Credit the transport connection's traffic to `peer`
    pub(crate) fn attribute(&self, peer: PeerId) {
        if let Some(meter) = &self.info.meter {
            meter.attribute(peer);
        }
    }
}

/// Byte stream counting what passes through it
struct Metered {
    io: Box<dyn Io>,
    meter: Meter,
}

impl AsyncRead for Metered {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        let before = buf.filled().len();
        let poll = Pin::new(&mut this.io).poll_read(cx, buf);
        let read = buf.filled().len() - before;
        if read > 0 {
            this.meter.record(Direction::Received, read as u64);
        }
        poll
    }
}

impl AsyncWrite for Metered {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        let poll = Pin::new(&mut this.io).poll_write(cx, buf);
        if let Poll::Ready(Ok(written)) = &poll {
            this.meter.record(Direction::Sent, *written as u64);
        }
        poll
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().io).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().io).poll_shutdown(cx)
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("remote_addr", &self.info.remote_addr)
            .field("remote_id", &self.info.remote_id)
            .finish_non_exhaustive()
    }
}

impl AsyncRead for Connection {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().io).poll_read(cx, buf)
    }
}

impl AsyncWrite for Connection {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.get_mut().io).poll_write(cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().io).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().io).poll_shutdown(cx)
    }
}

/// Two connected in-process connections, for tests and the memory transport
pub fn pair(max_buf_size: usize) -> (Connection, Connection) {
    let (a, b) = tokio::io::duplex(max_buf_size);
    (
        Connection::new(a, ConnectionInfo::default()),
        Connection::new(b, ConnectionInfo::default()),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stats::{Snapshot, Stats, StatsConfig};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[tokio::test]
    async fn test_pair_roundtrip() {
        let (mut a, mut b) = pair(64);
        a.write_all(b"ping").await.unwrap();
        let mut buf = [0u8; 4];
        b.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");
    }

    #[test]
    fn test_peer_info_sets_remote_id() {
        let (mut a, _b) = pair(64);
        let id = PeerId::random();
        a.set_peer_info(PeerInfo::new(id));
        assert_eq!(a.remote_id(), Some(id));

        // An authenticated id is never overwritten by the attached record
        let other = PeerId::random();
        a.set_peer_info(PeerInfo::new(other));
        assert_eq!(a.remote_id(), Some(id));
    }

    #[tokio::test]
    async fn test_metered_counts_both_directions() {
        let stats = Stats::new(StatsConfig::default());
        let (a, mut b) = pair(64);
        let a = a.metered(stats.transport_meter("memory"));
        let mut a_stream = a.metered(stats.protocol_meter("/echo/1.0.0"));

        a_stream.write_all(b"hello").await.unwrap();
        let mut buf = [0u8; 5];
        b.read_exact(&mut buf).await.unwrap();
        b.write_all(b"hi").await.unwrap();
        let mut buf = [0u8; 2];
        a_stream.read_exact(&mut buf).await.unwrap();

        let expected = Snapshot {
            data_sent: 5,
            data_received: 2,
        };
        assert_eq!(stats.global().snapshot(), expected);
        assert_eq!(stats.for_protocol("/echo/1.0.0").unwrap().snapshot(), expected);

        // The transport meter survives protocol wrapping
        let id = PeerId::random();
        a_stream.attribute(id);
        assert_eq!(stats.for_peer(&id).unwrap().snapshot(), expected);
    }
}
