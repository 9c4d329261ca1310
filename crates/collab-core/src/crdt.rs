//! CRDT engine interface and its Y-CRDT (`yrs`) adapter.
//!
//! The core never touches `yrs` types directly outside this module — every
//! other module talks to a document's replica through the [`Replica`] trait,
//! so a different CRDT engine could be swapped in behind the same seam.

use crate::connection::ConnectionId;
use crate::error::SyncError;
use std::sync::Arc;
use yrs::updates::decoder::Decode;
use yrs::updates::encoder::Encode;
use yrs::{Doc, ReadTxn, StateVector, Transact, Update};

/// Label attached to an `apply` call, identifying the source of an update.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Origin {
    /// A local update received from an attached connection's sync step.
    Connection(ConnectionId),
    /// A remote update applied via the cluster bridge.
    Cluster,
    /// An update replayed from persisted state during document load.
    Storage,
}

impl Origin {
    fn encode(self) -> Vec<u8> {
        match self {
            Origin::Storage => vec![0],
            Origin::Cluster => vec![1],
            Origin::Connection(id) => {
                let mut buf = vec![2];
                buf.extend_from_slice(&id.as_u64().to_le_bytes());
                buf
            }
        }
    }

    fn decode(bytes: &[u8]) -> Option<Self> {
        match bytes.first()? {
            0 => Some(Origin::Storage),
            1 => Some(Origin::Cluster),
            2 if bytes.len() == 9 => {
                let mut raw = [0u8; 8];
                raw.copy_from_slice(&bytes[1..9]);
                Some(Origin::Connection(ConnectionId::from_u64(u64::from_le_bytes(raw))))
            }
            _ => None,
        }
    }
}

/// Callback invoked on every committed update, with the encoded update bytes
/// and the origin tag that produced it.
pub type UpdateCallback = Box<dyn Fn(&[u8], Origin) + Send + Sync>;

/// RAII handle for an update subscription. Dropping it cancels the
/// subscription; no explicit `unsubscribe` call is required, matching the
/// "single serialized task queue, no cross-thread subscription lifecycle"
/// redesign note.
pub struct UpdateSubscription(#[allow(dead_code)] Box<dyn std::any::Any + Send + Sync>);

/// The CRDT engine interface consumed by the core.
///
/// A `Replica` is owned by exactly one [`crate::document::Document`]; all
/// mutation happens under that document's serialized transaction queue, so
/// every method here takes `&self` rather than `&mut self`.
pub trait Replica: Send + Sync + 'static {
    /// The 53-bit client id the engine assigned this replica.
    fn client_id(&self) -> u64;

    /// Apply a self-contained, idempotent update, tagged with its origin.
    fn apply(&self, update: &[u8], origin: Origin) -> Result<(), SyncError>;

    /// Encode the full document state as a single update against an empty
    /// state vector.
    fn encode_state_as_update(&self) -> Vec<u8>;

    /// Encode this replica's state vector.
    fn encode_state_vector(&self) -> Vec<u8>;

    /// Encode the update the remote peer is missing, given its state vector.
    fn encode_diff(&self, remote_state_vector: &[u8]) -> Result<Vec<u8>, SyncError>;

    /// Register an observer invoked synchronously on every applied update.
    fn observe_updates(&self, callback: UpdateCallback) -> UpdateSubscription;
}

/// Merge a list of update blobs into one, as a pure function independent of
/// any live replica.
pub fn merge_updates(updates: &[Vec<u8>]) -> Result<Vec<u8>, SyncError> {
    let decoded = updates
        .iter()
        .map(|u| Update::decode_v1(u).map_err(|e| SyncError::InvalidUpdate(e.to_string())))
        .collect::<Result<Vec<_>, _>>()?;
    Ok(Update::merge_updates(decoded).encode_v1())
}

/// Y-CRDT (`yrs`) backed [`Replica`] implementation — the reference CRDT
/// engine for this workspace.
pub struct YrsReplica {
    doc: Arc<Doc>,
}

impl YrsReplica {
    /// Create a fresh, empty replica.
    pub fn new() -> Self {
        Self {
            doc: Arc::new(Doc::new()),
        }
    }

    /// Expose the underlying `yrs::Doc` for domain-specific bindings that
    /// need shared-type access (e.g. a rich-text editor mapping). Use of
    /// this escape hatch bypasses the origin-tagging this module provides;
    /// prefer [`Replica::apply`].
    pub fn doc(&self) -> &Arc<Doc> {
        &self.doc
    }
}

impl Default for YrsReplica {
    fn default() -> Self {
        Self::new()
    }
}

impl Replica for YrsReplica {
    fn client_id(&self) -> u64 {
        self.doc.client_id()
    }

    fn apply(&self, update: &[u8], origin: Origin) -> Result<(), SyncError> {
        let decoded =
            Update::decode_v1(update).map_err(|e| SyncError::InvalidUpdate(e.to_string()))?;
        let mut txn = self.doc.transact_mut_with(origin.encode());
        txn.apply_update(decoded)
            .map_err(|e| SyncError::InvalidUpdate(e.to_string()))?;
        Ok(())
    }

    fn encode_state_as_update(&self) -> Vec<u8> {
        self.doc
            .transact()
            .encode_state_as_update_v1(&StateVector::default())
    }

    fn encode_state_vector(&self) -> Vec<u8> {
        self.doc.transact().state_vector().encode_v1()
    }

    fn encode_diff(&self, remote_state_vector: &[u8]) -> Result<Vec<u8>, SyncError> {
        let sv = StateVector::decode_v1(remote_state_vector)
            .map_err(|e| SyncError::InvalidUpdate(e.to_string()))?;
        Ok(self.doc.transact().encode_state_as_update_v1(&sv))
    }

    fn observe_updates(&self, callback: UpdateCallback) -> UpdateSubscription {
        let sub = self
            .doc
            .observe_update_v1(move |txn, event| {
                let origin = txn
                    .origin()
                    .and_then(|o| Origin::decode(o.as_ref()))
                    .unwrap_or(Origin::Cluster);
                callback(&event.update, origin);
            })
            .expect("observe_update_v1 on a freshly constructed Doc never fails");
        UpdateSubscription(Box::new(sub))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn idempotent_apply() {
        let replica = YrsReplica::new();
        let text = replica.doc().get_or_insert_text("body");
        {
            let mut txn = replica.doc().transact_mut();
            text.insert(&mut txn, 0, "hello");
        }
        let update = replica.encode_state_as_update();

        let target = YrsReplica::new();
        target.apply(&update, Origin::Storage).unwrap();
        target.apply(&update, Origin::Storage).unwrap();

        let target_text = target.doc().get_or_insert_text("body");
        let txn = target.doc().transact();
        assert_eq!(target_text.get_string(&txn), "hello");
    }

    #[test]
    fn diff_contains_only_missing_ops() {
        let a = YrsReplica::new();
        let b = YrsReplica::new();

        let text_a = a.doc().get_or_insert_text("body");
        {
            let mut txn = a.doc().transact_mut();
            text_a.insert(&mut txn, 0, "AB");
        }

        let sv_b = b.encode_state_vector();
        let diff = a.encode_diff(&sv_b).unwrap();
        b.apply(&diff, Origin::Cluster).unwrap();

        let text_b = b.doc().get_or_insert_text("body");
        let txn = b.doc().transact();
        assert_eq!(text_b.get_string(&txn), "AB");
    }

    #[test]
    fn origin_round_trips_through_subscription() {
        use std::sync::Mutex;

        let replica = YrsReplica::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen2 = seen.clone();
        let _sub = replica.observe_updates(Box::new(move |_update, origin| {
            seen2.lock().unwrap().push(origin);
        }));

        let conn_id = ConnectionId::from_u64(42);
        let text = replica.doc().get_or_insert_text("body");
        {
            let mut txn = replica.doc().transact_mut_with(Origin::Connection(conn_id).encode());
            text.insert(&mut txn, 0, "x");
        }

        assert_eq!(seen.lock().unwrap().as_slice(), &[Origin::Connection(conn_id)]);
    }

    #[test]
    fn merge_is_pure_and_equivalent_to_sequential_apply() {
        let a = YrsReplica::new();
        let text = a.doc().get_or_insert_text("body");
        {
            let mut txn = a.doc().transact_mut();
            text.insert(&mut txn, 0, "A");
        }
        let u1 = a.encode_state_as_update();
        {
            let mut txn = a.doc().transact_mut();
            text.insert(&mut txn, 1, "B");
        }
        let full = a.encode_state_as_update();

        let merged = merge_updates(&[u1, full.clone()]).unwrap();

        let target = YrsReplica::new();
        target.apply(&merged, Origin::Storage).unwrap();
        let target_text = target.doc().get_or_insert_text("body");
        let txn = target.doc().transact();
        assert_eq!(target_text.get_string(&txn), "AB");
    }
}
