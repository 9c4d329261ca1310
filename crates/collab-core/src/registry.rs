//! Document registry (C5) — race-free `get_or_create` over the
//! set of currently loaded documents, backed by a single in-flight promise
//! per document name so concurrent first-touches never double-load.

use crate::config::Config;
use crate::crdt::{Origin, Replica};
use crate::document::{Document, DocumentLifecycle};
use crate::error::RegistryError;
use crate::hooks::{HookChain, HookOutcome};
use crate::protocol::{encode_awareness, kind, AwarenessEntry, Envelope};
use crate::storage::Storage;
use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::broadcast;

enum Slot<R: Replica> {
    Loading(broadcast::Sender<()>),
    Ready(Arc<Document<R>>),
}

/// Owns every currently-loaded [`Document`], keyed by name.
pub struct DocumentRegistry<R: Replica> {
    slots: DashMap<String, Slot<R>>,
    storage: Arc<dyn Storage>,
    hooks: Arc<HookChain<R>>,
    config: Arc<Config>,
}

impl<R: Replica + Default> DocumentRegistry<R> {
    pub fn new(storage: Arc<dyn Storage>, hooks: Arc<HookChain<R>>, config: Arc<Config>) -> Self {
        Self {
            slots: DashMap::new(),
            storage,
            hooks,
            config,
        }
    }

    /// Fetch the document if already loaded, otherwise load it, with
    /// at-most-one load in flight across concurrent callers.
    ///
    /// Losing callers wait on a broadcast signal rather than polling;
    /// a load failure removes the slot and every waiter observes the
    /// absence of a `Ready` slot, at which point it retries once. A
    /// resident document that is `Unloading`/`Closed` is treated as absent
    /// too — a concurrent attach must never be handed a document that is
    /// about to be evicted, so it reloads fresh instead.
    pub async fn get_or_create(&self, name: &str) -> Result<Arc<Document<R>>, RegistryError> {
        loop {
            let mut waiter = None;
            let mut reload = false;
            {
                let entry = self.slots.entry(name.to_string());
                match entry {
                    dashmap::mapref::entry::Entry::Occupied(mut o) => match o.get() {
                        Slot::Ready(doc) if doc.lifecycle() == DocumentLifecycle::Active => {
                            return Ok(doc.clone());
                        }
                        Slot::Ready(_) => {
                            let (tx, _rx) = broadcast::channel(1);
                            o.insert(Slot::Loading(tx));
                            reload = true;
                        }
                        Slot::Loading(tx) => waiter = Some(tx.subscribe()),
                    },
                    dashmap::mapref::entry::Entry::Vacant(v) => {
                        let (tx, _rx) = broadcast::channel(1);
                        let guard = v.insert(Slot::Loading(tx));
                        drop(guard);
                        reload = true;
                    }
                }
            }
            if reload {
                return self.load(name).await;
            }
            if let Some(mut rx) = waiter {
                let _ = rx.recv().await;
            }
        }
    }

    async fn load(&self, name: &str) -> Result<Arc<Document<R>>, RegistryError> {
        let replica = Arc::new(R::default());
        let doc = Arc::new(Document::new(name.to_string(), replica.clone()));

        let result = self.load_inner(name, &doc, &replica).await;

        match result {
            Ok(()) => {
                doc.set_lifecycle(DocumentLifecycle::Active);
                if let Some(mut entry) = self.slots.get_mut(name) {
                    *entry = Slot::Ready(doc.clone());
                }
                self.notify_waiters(name);
                doc.install_awareness_expiry_task(self.spawn_awareness_expiry(&doc));
                tracing::debug!(doc = %name, "document loaded");
                Ok(doc)
            }
            Err(e) => {
                self.slots.remove(name);
                self.notify_waiters(name);
                tracing::warn!(doc = %name, error = %e, "document load failed");
                Err(e)
            }
        }
    }

    async fn load_inner(
        &self,
        name: &str,
        _doc: &Arc<Document<R>>,
        replica: &Arc<R>,
    ) -> Result<(), RegistryError> {
        let snapshot = self
            .storage
            .load(name)
            .await
            .map_err(|e| RegistryError::LoadFailed(e.to_string()))?;

        match snapshot {
            Some(bytes) => {
                replica
                    .apply(&bytes, Origin::Storage)
                    .map_err(|e| RegistryError::LoadFailed(e.to_string()))?;
            }
            None => {
                if let HookOutcome::Reject(reason) = self
                    .hooks
                    .run_on_create_document(name)
                    .await
                    .map_err(|e| RegistryError::LoadFailed(e.to_string()))?
                {
                    return Err(RegistryError::LoadFailed(reason));
                }
            }
        }

        match self
            .hooks
            .run_on_load_document(name, replica)
            .await
            .map_err(|e| RegistryError::LoadFailed(e.to_string()))?
        {
            HookOutcome::Reject(reason) => return Err(RegistryError::LoadFailed(reason)),
            _ => {}
        }

        self.hooks.run_after_load_document(name, replica).await;
        Ok(())
    }

    /// Spawn the per-document task that periodically tombstones awareness
    /// entries that haven't been re-advertised within the configured
    /// timeout, broadcasting the tombstones to every attached connection.
    fn spawn_awareness_expiry(&self, doc: &Arc<Document<R>>) -> tokio::task::JoinHandle<()> {
        let doc = doc.clone();
        let timeout = self.config.awareness_timeout;
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(timeout);
            interval.tick().await; // first tick fires immediately
            loop {
                interval.tick().await;
                let tombstones = doc.awareness().expire_stale(timeout);
                if tombstones.is_empty() {
                    continue;
                }
                let entries: Vec<AwarenessEntry> = tombstones
                    .into_iter()
                    .map(|(client_id, clock, payload)| AwarenessEntry {
                        client_id,
                        clock,
                        payload,
                    })
                    .collect();
                let env = Envelope {
                    doc_name: doc.name.clone(),
                    kind: kind::AWARENESS,
                    payload: encode_awareness(&entries),
                };
                doc.broadcast(env.encode(), None).await;
            }
        })
    }

    fn notify_waiters(&self, name: &str) {
        // The sender living inside the (now-replaced or removed) `Loading`
        // slot already carries its own receivers; dropping it wakes anyone
        // still subscribed via `recv`'s `Closed` result. Nothing further to
        // do here beyond letting that sender drop.
        let _ = name;
    }

    /// Fetch a resident document, if one is loaded and still `Active`. A
    /// document mid-unload is deliberately invisible here too: callers
    /// should route through [`Self::get_or_create`] to get a fresh load.
    pub fn get(&self, name: &str) -> Option<Arc<Document<R>>> {
        match self.slots.get(name)?.value() {
            Slot::Ready(doc) if doc.lifecycle() == DocumentLifecycle::Active => Some(doc.clone()),
            _ => None,
        }
    }

    /// Remove a document's slot once it has fully unloaded, but only if the
    /// slot still holds this exact document instance — a concurrent attach
    /// may already have replaced it with a freshly loaded one.
    pub fn evict(&self, name: &str, doc: &Arc<Document<R>>) {
        if let dashmap::mapref::entry::Entry::Occupied(o) = self.slots.entry(name.to_string()) {
            if matches!(o.get(), Slot::Ready(resident) if Arc::ptr_eq(resident, doc)) {
                o.remove();
            }
        }
    }

    pub fn loaded_names(&self) -> Vec<String> {
        self.slots
            .iter()
            .filter(|e| matches!(e.value(), Slot::Ready(_)))
            .map(|e| e.key().clone())
            .collect()
    }

    /// Snapshot of resident documents and their connection counts, for a
    /// health endpoint. Not wire-exposed.
    pub fn stats(&self) -> RegistryStats {
        let mut documents = 0usize;
        let mut connections = 0usize;
        for entry in self.slots.iter() {
            if let Slot::Ready(doc) = entry.value() {
                documents += 1;
                connections += doc.connection_count();
            }
        }
        RegistryStats { documents, connections }
    }
}

/// Aggregate counts across every resident document.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegistryStats {
    pub documents: usize,
    pub connections: usize,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crdt::YrsReplica;
    use crate::storage::FilesystemStorage;

    #[tokio::test]
    async fn get_or_create_loads_once() {
        let dir = tempfile::tempdir().unwrap();
        let storage: Arc<dyn Storage> = Arc::new(FilesystemStorage::new(dir.path()));
        let hooks = Arc::new(HookChain::<YrsReplica>::new(vec![]));
        let registry = Arc::new(DocumentRegistry::new(storage, hooks, Arc::new(Config::default())));

        let a = registry.get_or_create("room").await.unwrap();
        let b = registry.get_or_create("room").await.unwrap();
        assert!(Arc::ptr_eq(&a, &b));
    }

    #[tokio::test]
    async fn concurrent_first_touch_loads_once() {
        let dir = tempfile::tempdir().unwrap();
        let storage: Arc<dyn Storage> = Arc::new(FilesystemStorage::new(dir.path()));
        let hooks = Arc::new(HookChain::<YrsReplica>::new(vec![]));
        let registry = Arc::new(DocumentRegistry::new(storage, hooks, Arc::new(Config::default())));

        let r1 = registry.clone();
        let r2 = registry.clone();
        let (a, b) = tokio::join!(
            tokio::spawn(async move { r1.get_or_create("room").await.unwrap() }),
            tokio::spawn(async move { r2.get_or_create("room").await.unwrap() }),
        );
        assert!(Arc::ptr_eq(&a.unwrap(), &b.unwrap()));
    }

    #[tokio::test]
    async fn stats_counts_resident_documents_and_connections() {
        use crate::connection::ConnectionId;
        use crate::transport::OutboundSink;
        use async_trait::async_trait;

        struct NoopSink;
        #[async_trait]
        impl OutboundSink for NoopSink {
            async fn send(&self, _bytes: Vec<u8>) {}
        }

        let dir = tempfile::tempdir().unwrap();
        let storage: Arc<dyn Storage> = Arc::new(FilesystemStorage::new(dir.path()));
        let hooks = Arc::new(HookChain::<YrsReplica>::new(vec![]));
        let registry = DocumentRegistry::new(storage, hooks, Arc::new(Config::default()));

        assert_eq!(registry.stats().documents, 0);

        let doc = registry.get_or_create("room").await.unwrap();
        doc.attach(ConnectionId::from_u64(1), Arc::new(NoopSink));

        let stats = registry.stats();
        assert_eq!(stats.documents, 1);
        assert_eq!(stats.connections, 1);
    }
}
