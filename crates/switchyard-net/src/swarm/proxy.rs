//! Late-bound stream handle
//!
//! [`super::Swarm::dial`] hands out a [`ProxyConnection`] before the dial
//! pipeline has finished. Reads and writes wait until the negotiated stream
//! is bound, then pass straight through; a failed pipeline surfaces as an
//! I/O error on the first operation.

use crate::connection::Connection;
use std::future::Future;
use std::io;
use std::pin::Pin;
use std::task::{ready, Context, Poll};
use switchyard_core::PeerInfo;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::sync::oneshot;

pub(crate) type Binder = oneshot::Sender<Result<Connection, String>>;

enum State {
    Pending(oneshot::Receiver<Result<Connection, String>>),
    Bound(Connection),
    Failed(String),
}

/// A stream that may not be bound yet
pub struct ProxyConnection {
    state: State,
}

impl ProxyConnection {
    /// Unbound proxy plus the sender that binds it
    pub(crate) fn pending() -> (Self, Binder) {
        let (tx, rx) = oneshot::channel();
        (
            Self {
                state: State::Pending(rx),
            },
            tx,
        )
    }

    /// Proxy over an already negotiated stream
    pub(crate) fn bound(conn: Connection) -> Self {
        Self {
            state: State::Bound(conn),
        }
    }

    fn poll_bind(&mut self, cx: &mut Context<'_>) -> Poll<io::Result<&mut Connection>> {
        if let State::Pending(rx) = &mut self.state {
            self.state = match ready!(Pin::new(rx).poll(cx)) {
                Ok(Ok(conn)) => State::Bound(conn),
                Ok(Err(reason)) => State::Failed(reason),
                Err(_) => State::Failed("dial abandoned".to_string()),
            };
        }
        match &mut self.state {
            State::Bound(conn) => Poll::Ready(Ok(conn)),
            State::Failed(reason) => Poll::Ready(Err(io::Error::other(reason.clone()))),
            State::Pending(_) => Poll::Pending,
        }
    }

    /// Wait for the binding; fails if the pipeline failed
    pub async fn ready(&mut self) -> io::Result<()> {
        std::future::poll_fn(|cx| self.poll_bind(cx).map_ok(|_| ())).await
    }

    pub fn is_bound(&self) -> bool {
        matches!(self.state, State::Bound(_))
    }

    /// Peer record attached to the bound stream
    pub fn peer_info(&self) -> Option<&PeerInfo> {
        match &self.state {
            State::Bound(conn) => conn.peer_info(),
            _ => None,
        }
    }

    /// The bound stream, if any
    pub fn into_inner(self) -> Option<Connection> {
        match self.state {
            State::Bound(conn) => Some(conn),
            _ => None,
        }
    }
}

impl std::fmt::Debug for ProxyConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = match &self.state {
            State::Pending(_) => "pending",
            State::Bound(_) => "bound",
            State::Failed(_) => "failed",
        };
        f.debug_struct("ProxyConnection").field("state", &state).finish()
    }
}

impl AsyncRead for ProxyConnection {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let conn = ready!(self.get_mut().poll_bind(cx))?;
        Pin::new(conn).poll_read(cx, buf)
    }
}

impl AsyncWrite for ProxyConnection {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let conn = ready!(self.get_mut().poll_bind(cx))?;
        Pin::new(conn).poll_write(cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let conn = ready!(self.get_mut().poll_bind(cx))?;
        Pin::new(conn).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let conn = ready!(self.get_mut().poll_bind(cx))?;
        Pin::new(conn).poll_shutdown(cx)
    }
}
