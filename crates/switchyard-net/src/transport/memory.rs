//! In-process transport on `/memory/<port>` addresses
//!
//! Listeners register in a process-wide hub; dialing a port hands the
//! listener one end of a fresh in-memory duplex pipe.

use super::{Listener, Transport, TransportError};
use crate::connection::{Connection, ConnectionInfo};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::OnceLock;
use switchyard_core::{Multiaddr, Protocol};
use tokio::sync::mpsc;

/// Buffer size of each in-memory pipe
const PIPE_CAPACITY: usize = 64 * 1024;
/// Pending inbound connections per listener
const BACKLOG: usize = 32;
/// First port handed out for `/memory/0`
const FIRST_EPHEMERAL_PORT: u64 = 40_000;

#[derive(Default)]
struct Hub {
    next_port: u64,
    next_listener: u64,
    /// port -> (listener id, inbound queue)
    listeners: HashMap<u64, (u64, mpsc::Sender<Connection>)>,
}

fn hub() -> &'static Mutex<Hub> {
    static HUB: OnceLock<Mutex<Hub>> = OnceLock::new();
    HUB.get_or_init(|| {
        Mutex::new(Hub {
            next_port: FIRST_EPHEMERAL_PORT,
            next_listener: 0,
            listeners: HashMap::new(),
        })
    })
}

fn memory_port(addr: &Multiaddr) -> Option<u64> {
    match addr.without_peer_id().protocols() {
        [Protocol::Memory(port)] => Some(*port),
        _ => None,
    }
}

/// In-process transport
#[derive(Clone, Copy, Debug, Default)]
pub struct MemoryTransport;

impl MemoryTransport {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    fn filter(&self, addrs: &[Multiaddr]) -> Vec<Multiaddr> {
        addrs
            .iter()
            .filter(|a| memory_port(a).is_some())
            .cloned()
            .collect()
    }

    async fn dial(&self, addr: &Multiaddr) -> Result<Connection, TransportError> {
        let port = memory_port(addr).ok_or_else(|| TransportError::UnsupportedAddress(addr.clone()))?;
        let sender = hub()
            .lock()
            .listeners
            .get(&port)
            .map(|(_, tx)| tx.clone())
            .ok_or_else(|| TransportError::ConnectionRefused(addr.clone()))?;

        let (local, remote) = tokio::io::duplex(PIPE_CAPACITY);
        let local_addr = Multiaddr::empty().with(Protocol::Memory(port));
        let inbound = Connection::new(
            remote,
            ConnectionInfo {
                local_addr: Some(local_addr),
                ..Default::default()
            },
        );
        sender
            .send(inbound)
            .await
            .map_err(|_| TransportError::ConnectionRefused(addr.clone()))?;

        Ok(Connection::new(
            local,
            ConnectionInfo {
                remote_addr: Some(addr.clone()),
                ..Default::default()
            },
        ))
    }

    async fn listen(&self, addr: &Multiaddr) -> Result<Box<dyn Listener>, TransportError> {
        let requested =
            memory_port(addr).ok_or_else(|| TransportError::UnsupportedAddress(addr.clone()))?;

        let mut hub = hub().lock();
        let port = if requested == 0 {
            let mut port = hub.next_port;
            while hub.listeners.contains_key(&port) {
                port += 1;
            }
            hub.next_port = port + 1;
            port
        } else {
            requested
        };

        if let Some((_, existing)) = hub.listeners.get(&port) {
            if !existing.is_closed() {
                return Err(TransportError::Io(std::io::Error::new(
                    std::io::ErrorKind::AddrInUse,
                    format!("/memory/{port} already in use"),
                )));
            }
        }

        let id = hub.next_listener;
        hub.next_listener += 1;
        let (tx, rx) = mpsc::channel(BACKLOG);
        hub.listeners.insert(port, (id, tx));
        Ok(Box::new(MemoryListener { port, id, rx }))
    }
}

/// Listener bound to one memory port
pub struct MemoryListener {
    port: u64,
    id: u64,
    rx: mpsc::Receiver<Connection>,
}

#[async_trait]
impl Listener for MemoryListener {
    fn local_addr(&self) -> Multiaddr {
        Multiaddr::empty().with(Protocol::Memory(self.port))
    }

    async fn accept(&mut self) -> Result<Connection, TransportError> {
        self.rx.recv().await.ok_or(TransportError::Closed)
    }
}

impl Drop for MemoryListener {
    fn drop(&mut self) {
        let mut hub = hub().lock();
        if hub
            .listeners
            .get(&self.port)
            .map(|(id, _)| *id == self.id)
            .unwrap_or(false)
        {
            hub.listeners.remove(&self.port);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[tokio::test]
    async fn test_listen_dial() {
        let transport = MemoryTransport::new();
        let mut listener = transport.listen(&"/memory/0".parse().unwrap()).await.unwrap();
        let addr = listener.local_addr();
        assert!(memory_port(&addr).unwrap() >= FIRST_EPHEMERAL_PORT);

        let mut outbound = transport.dial(&addr).await.unwrap();
        let mut inbound = listener.accept().await.unwrap();

        outbound.write_all(b"hi").await.unwrap();
        let mut buf = [0u8; 2];
        inbound.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hi");
        assert_eq!(outbound.remote_addr(), Some(&addr));
    }

    #[tokio::test]
    async fn test_dial_without_listener_refused() {
        let transport = MemoryTransport::new();
        let err = transport.dial(&"/memory/7".parse().unwrap()).await.unwrap_err();
        assert!(matches!(err, TransportError::ConnectionRefused(_)));
    }

    #[tokio::test]
    async fn test_port_released_on_drop() {
        let transport = MemoryTransport::new();
        let listener = transport.listen(&"/memory/0".parse().unwrap()).await.unwrap();
        let addr = listener.local_addr();
        drop(listener);

        assert!(transport.dial(&addr).await.is_err());
    }

    #[test]
    fn test_filter() {
        let transport = MemoryTransport::new();
        let addrs: Vec<Multiaddr> = vec![
            "/memory/1".parse().unwrap(),
            "/ip4/127.0.0.1/tcp/1".parse().unwrap(),
        ];
        assert_eq!(transport.filter(&addrs), vec![addrs[0].clone()]);
    }
}
