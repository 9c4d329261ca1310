//! Per-transport-session connection entity.

use crate::sync_state::SyncState;
use crate::transport::Transport;
use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Opaque identifier for a connection, used as the awareness-map key's
/// sibling concept and as the CRDT [`crate::crdt::Origin::Connection`] tag.
///
/// Distinct from the CRDT engine's 53-bit client id: this is a server-local
/// handle, assigned before the replica (and therefore its client id) is
/// necessarily known.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(u64);

impl ConnectionId {
    pub(crate) fn from_u64(id: u64) -> Self {
        Self(id)
    }

    pub fn as_u64(self) -> u64 {
        self.0
    }
}

/// Monotonic generator for [`ConnectionId`]s, owned by the orchestrator.
#[derive(Default)]
pub struct ConnectionIdGenerator(AtomicU64);

impl ConnectionIdGenerator {
    pub fn next(&self) -> ConnectionId {
        ConnectionId(self.0.fetch_add(1, Ordering::Relaxed))
    }
}

/// Type-erased per-connection bag of values set during `onConnect` /
/// `onAuthenticate`. Hooks outside that phase are only ever handed `&Context`,
/// so the borrow checker — not a runtime flag — enforces that it's mutable
/// only during connection setup.
#[derive(Default)]
pub struct Context {
    values: HashMap<TypeId, Box<dyn Any + Send + Sync>>,
}

impl Context {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert<T: Send + Sync + 'static>(&mut self, value: T) {
        self.values.insert(TypeId::of::<T>(), Box::new(value));
    }

    pub fn get<T: Send + Sync + 'static>(&self) -> Option<&T> {
        self.values.get(&TypeId::of::<T>()).and_then(|v| v.downcast_ref())
    }
}

/// Lifecycle of a [`ClientConnection`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionLifecycle {
    Open,
    Closing,
    Closed,
}

/// One connected client session. Holds the transport handle, its frozen
/// context, and the set of documents it has attached to along with each
/// attachment's independent [`SyncState`].
pub struct ClientConnection<T: Transport> {
    pub id: ConnectionId,
    pub transport: Arc<T>,
    context: Context,
    lifecycle: std::sync::atomic::AtomicU8,
    subscriptions: dashmap::DashMap<String, SyncState>,
}

impl<T: Transport> ClientConnection<T> {
    pub fn new(id: ConnectionId, transport: Arc<T>, context: Context) -> Self {
        Self {
            id,
            transport,
            context,
            lifecycle: std::sync::atomic::AtomicU8::new(ConnectionLifecycle::Open as u8),
            subscriptions: dashmap::DashMap::new(),
        }
    }

    pub fn context(&self) -> &Context {
        &self.context
    }

    pub fn lifecycle(&self) -> ConnectionLifecycle {
        match self.lifecycle.load(Ordering::Acquire) {
            0 => ConnectionLifecycle::Open,
            1 => ConnectionLifecycle::Closing,
            _ => ConnectionLifecycle::Closed,
        }
    }

    pub fn set_lifecycle(&self, state: ConnectionLifecycle) {
        self.lifecycle.store(state as u8, Ordering::Release);
    }

    /// Sync state for a document this connection has attached to.
    pub fn sync_state(&self, doc_name: &str) -> Option<SyncState> {
        self.subscriptions.get(doc_name).map(|r| *r)
    }

    pub fn set_sync_state(&self, doc_name: &str, state: SyncState) {
        self.subscriptions.insert(doc_name.to_string(), state);
    }

    pub fn detach(&self, doc_name: &str) {
        self.subscriptions.remove(doc_name);
    }

    pub fn attached_documents(&self) -> Vec<String> {
        self.subscriptions.iter().map(|e| e.key().clone()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn connection_ids_are_unique_and_monotone() {
        let gen = ConnectionIdGenerator::default();
        let a = gen.next();
        let b = gen.next();
        assert!(b.as_u64() > a.as_u64());
    }

    #[test]
    fn context_insert_then_get() {
        let mut ctx = Context::new();
        ctx.insert(42u32);
        assert_eq!(ctx.get::<u32>(), Some(&42));
        assert_eq!(ctx.get::<String>(), None);
    }
}
