//! Cluster bridge (C8) — fans a document's local updates out to
//! other server instances over a [`PubSub`] channel, and applies updates
//! received from them, without ever re-publishing what it just received
//! (the no-cluster-echo invariant).

use crate::config::Config;
use crate::crdt::{Origin, Replica};
use crate::document::Document;
use crate::error::ClusterError;
use crate::hooks::HookChain;
use crate::protocol::{kind, read_uvarint, write_uvarint, Envelope, SyncPayload};
use crate::pubsub::PubSub;
use crate::scheduler::PersistenceScheduler;
use crate::storage::Storage;
use std::sync::Arc;
use tokio::task::JoinHandle;

/// Envelope carried over the cluster channel: `[uvarint instance_id
/// length][instance_id bytes][raw update bytes]`. The instance id lets a
/// receiver recognize and drop its own publishes if a pub/sub backend ever
/// echoes them back.
fn encode_envelope(instance_id: &str, update: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(instance_id.len() + update.len() + 4);
    write_uvarint(&mut out, instance_id.len() as u64);
    out.extend_from_slice(instance_id.as_bytes());
    out.extend_from_slice(update);
    out
}

fn decode_envelope(bytes: &[u8]) -> Option<(&str, &[u8])> {
    let (len, consumed) = read_uvarint(bytes).ok()?;
    let len = len as usize;
    let id_bytes = bytes.get(consumed..consumed + len)?;
    let instance_id = std::str::from_utf8(id_bytes).ok()?;
    Some((instance_id, &bytes[consumed + len..]))
}

/// Bridges one document to its cluster-wide pub/sub channel.
pub struct ClusterBridge<R: Replica> {
    config: Arc<Config>,
    pubsub: Arc<dyn PubSub>,
    scheduler: Arc<PersistenceScheduler>,
    hooks: Arc<HookChain<R>>,
    storage: Arc<dyn Storage>,
    receiver_task: Option<JoinHandle<()>>,
}

impl<R: Replica> ClusterBridge<R> {
    pub fn new(
        config: Arc<Config>,
        pubsub: Arc<dyn PubSub>,
        scheduler: Arc<PersistenceScheduler>,
        hooks: Arc<HookChain<R>>,
        storage: Arc<dyn Storage>,
    ) -> Self {
        Self {
            config,
            pubsub,
            scheduler,
            hooks,
            storage,
            receiver_task: None,
        }
    }

    /// Subscribe a document to its channel (run after a document loads),
    /// applying every received remote update with [`Origin::Cluster`]. A
    /// successfully applied remote update is fanned out to every locally
    /// attached connection and scheduled for persistence, mirroring what
    /// the local sync path does for its own updates — only the cluster
    /// publish step is skipped, since re-publishing a just-received remote
    /// update would echo it straight back out. As a courtesy to
    /// newly-joining instances, also publishes the document's current full
    /// state once subscribed.
    pub async fn subscribe(&mut self, doc: Arc<Document<R>>) -> Result<(), ClusterError> {
        let channel = self.config.channel_for(&doc.name);
        let mut rx = self.pubsub.subscribe(&channel).await?;
        let instance_id = self.config.instance_id.clone();

        let task = tokio::spawn({
            let doc = doc.clone();
            let instance_id = instance_id.clone();
            let scheduler = self.scheduler.clone();
            let hooks = self.hooks.clone();
            let storage = self.storage.clone();
            async move {
                while let Ok(envelope) = rx.recv().await {
                    let Some((sender_id, update)) = decode_envelope(&envelope) else {
                        tracing::warn!(doc = %doc.name, "dropping malformed cluster envelope");
                        continue;
                    };
                    if sender_id == instance_id {
                        continue;
                    }
                    match doc.apply(update, Origin::Cluster) {
                        Ok(policy) => {
                            if policy.broadcast {
                                let env = Envelope {
                                    doc_name: doc.name.clone(),
                                    kind: kind::SYNC,
                                    payload: SyncPayload::Update { update: update.to_vec() }.encode(),
                                };
                                doc.broadcast(env.encode(), policy.exclude).await;
                            }
                            if policy.schedule_persist {
                                let doc_for_save = doc.clone();
                                let hooks = hooks.clone();
                                let storage = storage.clone();
                                let name = doc.name.clone();
                                scheduler
                                    .mark_dirty(&doc.name, move || async move {
                                        let state = doc_for_save.replica().encode_state_as_update();
                                        hooks.run_on_store_document(&name, &state).await;
                                        if let Err(e) = storage.store(&name, &state).await {
                                            tracing::warn!(doc = %name, error = %e, "persist failed");
                                        } else {
                                            tracing::debug!(doc = %name, bytes = state.len(), "persisted document");
                                            hooks.run_after_store_document(&name).await;
                                        }
                                    })
                                    .await;
                            }
                        }
                        Err(e) => {
                            tracing::warn!(doc = %doc.name, error = %e, "cluster update rejected");
                        }
                    }
                }
            }
        });
        self.receiver_task = Some(task);

        let full_state = doc.replica().encode_state_as_update();
        let envelope = encode_envelope(&instance_id, &full_state);
        self.pubsub.publish(&channel, envelope).await?;
        tracing::debug!(doc = %doc.name, channel = %channel, "subscribed to cluster channel");
        Ok(())
    }

    /// Publish a locally-originated update. No-ops if `origin` is
    /// `Cluster`, preventing the echo this bridge just received from being
    /// sent straight back out.
    pub async fn publish(&self, doc_name: &str, update: &[u8], origin: Origin) -> Result<(), ClusterError> {
        if matches!(origin, Origin::Cluster) {
            return Ok(());
        }
        let channel = self.config.channel_for(doc_name);
        let envelope = encode_envelope(&self.config.instance_id, update);
        self.pubsub.publish(&channel, envelope).await?;
        tracing::debug!(doc = %doc_name, channel = %channel, "published update to cluster");
        Ok(())
    }

    /// Unsubscribe a document, run before it unloads.
    pub async fn unsubscribe(&mut self, doc_name: &str) {
        if let Some(task) = self.receiver_task.take() {
            task.abort();
        }
        let channel = self.config.channel_for(doc_name);
        self.pubsub.unsubscribe(&channel).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn envelope_round_trips() {
        let encoded = encode_envelope("inst-a", &[1, 2, 3]);
        let (id, update) = decode_envelope(&encoded).unwrap();
        assert_eq!(id, "inst-a");
        assert_eq!(update, &[1, 2, 3]);
    }

    #[tokio::test]
    async fn own_publish_is_not_reapplied() {
        use crate::crdt::YrsReplica;
        use crate::pubsub::InProcessPubSub;
        use crate::testing::InMemoryStorage;

        let config = Arc::new(Config {
            instance_id: "self".to_string(),
            ..Config::default()
        });
        let pubsub: Arc<dyn PubSub> = Arc::new(InProcessPubSub::default());
        let scheduler = Arc::new(PersistenceScheduler::new(config.debounce, config.max_debounce));
        let hooks = Arc::new(HookChain::<YrsReplica>::new(vec![]));
        let storage: Arc<dyn Storage> = Arc::new(InMemoryStorage::new());

        let doc = Arc::new(Document::new("room".to_string(), Arc::new(YrsReplica::new())));
        let mut bridge = ClusterBridge::<YrsReplica>::new(
            config.clone(),
            pubsub.clone(),
            scheduler,
            hooks,
            storage,
        );
        bridge.subscribe(doc.clone()).await.unwrap();

        // Drain the courtesy full-state publish this instance just sent.
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;

        bridge
            .publish("room", b"local-update", Origin::Connection(crate::connection::ConnectionId::from_u64(1)))
            .await
            .unwrap();

        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        // No panic/deadlock is the main property under test here; applying
        // garbage bytes to the replica would have logged a warning, not
        // crashed, so we only assert the bridge is still usable.
        bridge.unsubscribe("room").await;
    }
}
