//! Concurrency-limited multi-address dialing

use super::{Transport, TransportError};
use crate::connection::Connection;
use futures::stream::{FuturesUnordered, StreamExt};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use switchyard_core::{Multiaddr, PeerId};
use tokio::sync::Semaphore;
use tracing::debug;

/// Dials several addresses of one peer in parallel
///
/// At most `per_peer_limit` attempts per peer run at once, shared across
/// concurrent calls. The first successful attempt wins and the rest are
/// dropped.
pub struct LimitDialer {
    per_peer_limit: usize,
    dial_timeout: Duration,
    tokens: Mutex<HashMap<PeerId, Arc<Semaphore>>>,
}

impl LimitDialer {
    pub fn new(per_peer_limit: usize, dial_timeout: Duration) -> Self {
        Self {
            per_peer_limit: per_peer_limit.max(1),
            dial_timeout,
            tokens: Mutex::new(HashMap::new()),
        }
    }

    pub fn dial_timeout(&self) -> Duration {
        self.dial_timeout
    }

    /// Dial `addrs` through `transport`, returning the winning connection
    /// and the address it was made on
    pub async fn dial_many(
        &self,
        peer: &PeerId,
        transport: &dyn Transport,
        addrs: Vec<Multiaddr>,
    ) -> Result<(Connection, Multiaddr), TransportError> {
        if addrs.is_empty() {
            return Err(TransportError::NoAddresses);
        }

        let semaphore = self
            .tokens
            .lock()
            .entry(*peer)
            .or_insert_with(|| Arc::new(Semaphore::new(self.per_peer_limit)))
            .clone();
        let dial_timeout = self.dial_timeout;

        let mut attempts: FuturesUnordered<_> = addrs
            .into_iter()
            .map(|addr| {
                let semaphore = semaphore.clone();
                async move {
                    let _permit = semaphore
                        .acquire_owned()
                        .await
                        .map_err(|_| TransportError::Closed)?;
                    let result = tokio::time::timeout(dial_timeout, transport.dial(&addr)).await;
                    match result {
                        Ok(Ok(conn)) => Ok((conn, addr)),
                        Ok(Err(e)) => Err(e),
                        Err(_) => Err(TransportError::Timeout(addr)),
                    }
                }
            })
            .collect();

        let mut errors = Vec::new();
        let mut winner = None;
        while let Some(result) = attempts.next().await {
            match result {
                Ok(found) => {
                    winner = Some(found);
                    break;
                }
                Err(e) => {
                    debug!("Dial attempt to {} failed: {}", peer, e);
                    errors.push(e);
                }
            }
        }
        drop(attempts);
        drop(semaphore);
        self.release(peer);

        winner.ok_or(TransportError::AllFailed(errors))
    }

    /// Forget the peer's semaphore once no dial holds it
    fn release(&self, peer: &PeerId) {
        let mut tokens = self.tokens.lock();
        if tokens
            .get(peer)
            .map(|s| Arc::strong_count(s) == 1)
            .unwrap_or(false)
        {
            tokens.remove(peer);
        }
    }
}
