//! In-memory document entity (C4) — owns a replica, its
//! awareness state, and the set of attached connections, and implements the
//! fan-out policy an applied update triggers.

use crate::awareness::AwarenessState;
use crate::connection::ConnectionId;
use crate::crdt::{Origin, Replica, UpdateSubscription};
use crate::transport::OutboundSink;
use dashmap::DashMap;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex};
use tokio::task::JoinHandle;

/// Where a document is in its own lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DocumentLifecycle {
    Loading,
    Active,
    Unloading,
    Closed,
}

/// What an applied update requires of the caller, depending on who produced
/// it:
///
/// - A local connection's update excludes the originator from fan-out, and
///   schedules both a persist and a cluster publish.
/// - A remote (cluster) update fans out to every attached connection and
///   schedules a persist, but must not be republished (no-cluster-echo).
/// - A replay during load does neither: it is invisible to everyone until
///   the document is fully loaded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FanOutPolicy {
    pub exclude: Option<ConnectionId>,
    pub broadcast: bool,
    pub schedule_persist: bool,
    pub publish_to_cluster: bool,
}

impl FanOutPolicy {
    pub fn for_origin(origin: Origin) -> Self {
        match origin {
            Origin::Connection(id) => FanOutPolicy {
                exclude: Some(id),
                broadcast: true,
                schedule_persist: true,
                publish_to_cluster: true,
            },
            Origin::Cluster => FanOutPolicy {
                exclude: None,
                broadcast: true,
                schedule_persist: true,
                publish_to_cluster: false,
            },
            Origin::Storage => FanOutPolicy {
                exclude: None,
                broadcast: false,
                schedule_persist: false,
                publish_to_cluster: false,
            },
        }
    }
}

/// A loaded document: its replica, its awareness map, and bookkeeping over
/// the connections currently attached to it.
pub struct Document<R: Replica> {
    pub name: String,
    replica: Arc<R>,
    awareness: AwarenessState,
    connections: DashMap<ConnectionId, Arc<dyn OutboundSink>>,
    lifecycle: AtomicU8,
    _update_subscription: Option<UpdateSubscription>,
    awareness_expiry: Mutex<Option<JoinHandle<()>>>,
}

impl<R: Replica> Document<R> {
    /// Wrap a freshly constructed replica as a `Loading` document. The
    /// registry transitions it to `Active` once the load hook chain and
    /// observer registration have both completed — registering the
    /// observer only after load finishes
    /// avoids the hook chain's own replay traffic triggering fan-out.
    pub fn new(name: String, replica: Arc<R>) -> Self {
        Self {
            name,
            replica,
            awareness: AwarenessState::new(),
            connections: DashMap::new(),
            lifecycle: AtomicU8::new(DocumentLifecycle::Loading as u8),
            _update_subscription: None,
            awareness_expiry: Mutex::new(None),
        }
    }

    pub fn replica(&self) -> &Arc<R> {
        &self.replica
    }

    pub fn awareness(&self) -> &AwarenessState {
        &self.awareness
    }

    pub fn lifecycle(&self) -> DocumentLifecycle {
        match self.lifecycle.load(Ordering::Acquire) {
            0 => DocumentLifecycle::Loading,
            1 => DocumentLifecycle::Active,
            2 => DocumentLifecycle::Unloading,
            _ => DocumentLifecycle::Closed,
        }
    }

    pub fn set_lifecycle(&self, state: DocumentLifecycle) {
        self.lifecycle.store(state as u8, Ordering::Release);
    }

    pub fn attach(&self, conn: ConnectionId, sink: Arc<dyn OutboundSink>) {
        self.connections.insert(conn, sink);
    }

    /// Detach a connection, returning `true` if it was the last one —
    /// the caller should start the unload-grace timer.
    pub fn detach(&self, conn: ConnectionId) -> bool {
        self.connections.remove(&conn);
        self.connections.is_empty()
    }

    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    pub fn connections(&self) -> Vec<ConnectionId> {
        self.connections.iter().map(|e| *e.key()).collect()
    }

    /// Send `bytes` to every attached connection except `exclude`.
    pub async fn broadcast(&self, bytes: Vec<u8>, exclude: Option<ConnectionId>) {
        let sinks: Vec<_> = self
            .connections
            .iter()
            .filter(|e| Some(*e.key()) != exclude)
            .map(|e| e.value().clone())
            .collect();
        for sink in sinks {
            sink.send(bytes.clone()).await;
        }
    }

    /// Apply an incoming update and compute the fan-out policy it implies.
    /// Does not itself perform the persist/publish side effects — those are
    /// orchestrated by the registry and cluster bridge, which have the
    /// storage and pub/sub handles this module intentionally does not.
    pub fn apply(&self, update: &[u8], origin: Origin) -> Result<FanOutPolicy, crate::error::SyncError> {
        self.replica.apply(update, origin)?;
        Ok(FanOutPolicy::for_origin(origin))
    }

    /// Record the handle of this document's periodic awareness-expiry task,
    /// so it can be stopped when the document unloads.
    pub fn install_awareness_expiry_task(&self, task: JoinHandle<()>) {
        *self.awareness_expiry.lock().unwrap() = Some(task);
    }

    /// Stop the periodic awareness-expiry task, if one is running.
    pub fn stop_awareness_expiry(&self) {
        if let Some(task) = self.awareness_expiry.lock().unwrap().take() {
            task.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crdt::YrsReplica;
    use async_trait::async_trait;
    use std::sync::Mutex;

    struct RecordingSink(Mutex<Vec<Vec<u8>>>);

    #[async_trait]
    impl OutboundSink for RecordingSink {
        async fn send(&self, bytes: Vec<u8>) {
            self.0.lock().unwrap().push(bytes);
        }
    }

    #[test]
    fn attach_and_detach_tracks_emptiness() {
        let doc = Document::new("room".to_string(), Arc::new(YrsReplica::new()));
        let a = ConnectionId::from_u64(1);
        let b = ConnectionId::from_u64(2);

        doc.attach(a, Arc::new(RecordingSink(Mutex::new(Vec::new()))));
        doc.attach(b, Arc::new(RecordingSink(Mutex::new(Vec::new()))));
        assert_eq!(doc.connection_count(), 2);

        assert!(!doc.detach(a));
        assert!(doc.detach(b));
    }

    #[tokio::test]
    async fn broadcast_excludes_originator() {
        let doc = Document::new("room".to_string(), Arc::new(YrsReplica::new()));
        let a = ConnectionId::from_u64(1);
        let b = ConnectionId::from_u64(2);
        let sink_a = Arc::new(RecordingSink(Mutex::new(Vec::new())));
        let sink_b = Arc::new(RecordingSink(Mutex::new(Vec::new())));
        doc.attach(a, sink_a.clone());
        doc.attach(b, sink_b.clone());

        doc.broadcast(vec![1, 2, 3], Some(a)).await;

        assert!(sink_a.0.lock().unwrap().is_empty());
        assert_eq!(sink_b.0.lock().unwrap().as_slice(), &[vec![1, 2, 3]]);
    }

    #[test]
    fn fan_out_policy_by_origin() {
        let local = FanOutPolicy::for_origin(Origin::Connection(ConnectionId::from_u64(1)));
        assert!(local.broadcast && local.schedule_persist && local.publish_to_cluster);
        assert_eq!(local.exclude, Some(ConnectionId::from_u64(1)));

        let cluster = FanOutPolicy::for_origin(Origin::Cluster);
        assert!(cluster.broadcast && cluster.schedule_persist && !cluster.publish_to_cluster);
        assert_eq!(cluster.exclude, None);

        let storage = FanOutPolicy::for_origin(Origin::Storage);
        assert!(!storage.broadcast && !storage.schedule_persist && !storage.publish_to_cluster);
    }

    #[test]
    fn lifecycle_defaults_to_loading() {
        let doc = Document::new("room".to_string(), Arc::new(YrsReplica::new()));
        assert_eq!(doc.lifecycle(), DocumentLifecycle::Loading);
        doc.set_lifecycle(DocumentLifecycle::Active);
        assert_eq!(doc.lifecycle(), DocumentLifecycle::Active);
    }
}
