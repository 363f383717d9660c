//! TCP transport on `/ip4|ip6/…/tcp/<port>` addresses

use super::{Listener, Transport, TransportError};
use crate::connection::{Connection, ConnectionInfo};
use async_trait::async_trait;
use switchyard_core::Multiaddr;
use tokio::net::{TcpListener, TcpStream};
use tracing::debug;

/// TCP transport
#[derive(Clone, Copy, Debug, Default)]
pub struct TcpTransport;

impl TcpTransport {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Transport for TcpTransport {
    fn filter(&self, addrs: &[Multiaddr]) -> Vec<Multiaddr> {
        addrs
            .iter()
            .filter(|a| a.tcp_socket_addr().is_some())
            .cloned()
            .collect()
    }

    async fn dial(&self, addr: &Multiaddr) -> Result<Connection, TransportError> {
        let socket_addr = addr
            .tcp_socket_addr()
            .ok_or_else(|| TransportError::UnsupportedAddress(addr.clone()))?;

        let stream = TcpStream::connect(socket_addr).await?;
        stream.set_nodelay(true)?;
        debug!("Dialed {}", socket_addr);

        let info = ConnectionInfo {
            local_addr: Some(Multiaddr::from_tcp(stream.local_addr()?)),
            remote_addr: Some(addr.clone()),
            ..Default::default()
        };
        Ok(Connection::new(stream, info))
    }

    async fn listen(&self, addr: &Multiaddr) -> Result<Box<dyn Listener>, TransportError> {
        let socket_addr = addr
            .tcp_socket_addr()
            .ok_or_else(|| TransportError::UnsupportedAddress(addr.clone()))?;

        let listener = TcpListener::bind(socket_addr).await?;
        let local_addr = Multiaddr::from_tcp(listener.local_addr()?);
        Ok(Box::new(TcpAcceptor {
            listener,
            local_addr,
        }))
    }
}

/// Bound TCP listener
pub struct TcpAcceptor {
    listener: TcpListener,
    local_addr: Multiaddr,
}

#[async_trait]
impl Listener for TcpAcceptor {
    fn local_addr(&self) -> Multiaddr {
        self.local_addr.clone()
    }

    async fn accept(&mut self) -> Result<Connection, TransportError> {
        let (stream, peer_addr) = self.listener.accept().await?;
        stream.set_nodelay(true)?;
        debug!("Accepted connection from {}", peer_addr);

        let info = ConnectionInfo {
            local_addr: Some(self.local_addr.clone()),
            remote_addr: Some(Multiaddr::from_tcp(peer_addr)),
            ..Default::default()
        };
        Ok(Connection::new(stream, info))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[tokio::test]
    async fn test_listen_resolves_port() {
        let transport = TcpTransport::new();
        let mut listener = transport
            .listen(&"/ip4/127.0.0.1/tcp/0".parse().unwrap())
            .await
            .unwrap();
        let addr = listener.local_addr();
        assert_ne!(addr.tcp_socket_addr().unwrap().port(), 0);

        let accept = tokio::spawn(async move { listener.accept().await.unwrap() });
        let mut outbound = transport.dial(&addr).await.unwrap();
        let mut inbound = accept.await.unwrap();

        outbound.write_all(b"tcp").await.unwrap();
        let mut buf = [0u8; 3];
        inbound.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"tcp");
        assert!(inbound.remote_addr().is_some());
    }

    #[test]
    fn test_filter() {
        let transport = TcpTransport::new();
        let addrs: Vec<Multiaddr> = vec![
            "/ip4/127.0.0.1/tcp/4001".parse().unwrap(),
            "/ip4/127.0.0.1/tcp/4001/ws".parse().unwrap(),
            "/memory/3".parse().unwrap(),
        ];
        assert_eq!(transport.filter(&addrs), vec![addrs[0].clone()]);
    }
}
