//! Inbound protocol routing

use super::Shared;
use crate::connection::Connection;
use crate::negotiate;
use std::sync::Arc;
use tracing::{debug, trace};

/// Negotiate a protocol on an inbound connection and run its handler
///
/// Runs on its own task; the handler table is consulted at negotiation
/// time, so handlers registered later still apply to this connection.
pub(crate) fn route(shared: &Arc<Shared>, mut conn: Connection) {
    let weak = Arc::downgrade(shared);
    tokio::spawn(async move {
        let lookup = |requested: &str| weak.upgrade().and_then(|s| s.protocols.find(requested));
        match negotiate::negotiate(&mut conn, lookup).await {
            Ok((protocol, entry)) => {
                trace!("Routing {} to handler {}", protocol, entry.protocol);
                let conn = match weak.upgrade() {
                    Some(shared) => conn.metered(shared.stats().protocol_meter(&protocol)),
                    None => return,
                };
                (entry.handler)(protocol, conn).await;
            }
            Err(e) => debug!(
                "Inbound negotiation from {:?} failed: {}",
                conn.remote_addr(),
                e
            ),
        }
    });
}
