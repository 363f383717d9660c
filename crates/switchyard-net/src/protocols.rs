//! Inbound protocol handler table

use crate::connection::Connection;
use futures::future::BoxFuture;
use parking_lot::RwLock;
use std::fmt;
use std::future::Future;
use std::sync::Arc;

/// Handler for a negotiated inbound stream: `(protocol, connection)`
pub type HandlerFn = Arc<dyn Fn(String, Connection) -> BoxFuture<'static, ()> + Send + Sync>;

/// Custom matcher: `(registered, requested) -> accepted`
pub type MatchFn = Arc<dyn Fn(&str, &str) -> bool + Send + Sync>;

/// Build a [`HandlerFn`] from an async closure
pub fn handler<F, Fut>(f: F) -> HandlerFn
where
    F: Fn(String, Connection) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    Arc::new(move |protocol, conn| Box::pin(f(protocol, conn)))
}

/// Build a [`MatchFn`] from a closure
pub fn matcher<F>(f: F) -> MatchFn
where
    F: Fn(&str, &str) -> bool + Send + Sync + 'static,
{
    Arc::new(f)
}

/// A registered protocol
#[derive(Clone)]
pub struct HandlerEntry {
    pub protocol: String,
    pub handler: HandlerFn,
    pub matcher: Option<MatchFn>,
}

impl fmt::Debug for HandlerEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HandlerEntry")
            .field("protocol", &self.protocol)
            .field("matcher", &self.matcher.is_some())
            .finish()
    }
}

/// Registered handlers, unique per protocol id
#[derive(Default)]
pub struct ProtocolTable {
    entries: RwLock<Vec<HandlerEntry>>,
}

impl ProtocolTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler; a later registration for the same id replaces it
    pub fn insert(&self, protocol: &str, handler: HandlerFn, matcher: Option<MatchFn>) {
        let mut entries = self.entries.write();
        entries.retain(|e| e.protocol != protocol);
        entries.push(HandlerEntry {
            protocol: protocol.to_string(),
            handler,
            matcher,
        });
    }

    /// Returns true if something was removed
    pub fn remove(&self, protocol: &str) -> bool {
        let mut entries = self.entries.write();
        let before = entries.len();
        entries.retain(|e| e.protocol != protocol);
        entries.len() != before
    }

    /// Find the handler for a requested protocol: exact ids first, then matchers
    pub fn find(&self, requested: &str) -> Option<HandlerEntry> {
        let entries = self.entries.read();
        entries
            .iter()
            .find(|e| e.protocol == requested)
            .or_else(|| {
                entries.iter().find(|e| {
                    e.matcher
                        .as_ref()
                        .map(|m| m(&e.protocol, requested))
                        .unwrap_or(false)
                })
            })
            .cloned()
    }

    pub fn contains(&self, protocol: &str) -> bool {
        self.entries.read().iter().any(|e| e.protocol == protocol)
    }

    /// Registered protocol ids in registration order
    pub fn protocols(&self) -> Vec<String> {
        self.entries.read().iter().map(|e| e.protocol.clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }
}
