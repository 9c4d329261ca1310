//! Server orchestrator (C9) — owns the registry, scheduler,
//! hook chain, and cluster bridge, and drives one connection's lifetime
//! end to end. Transport-agnostic: `collab-server` supplies the WebSocket
//! transport and HTTP upgrade handling this module never touches.

use crate::awareness::ApplyResult;
use crate::cluster::ClusterBridge;
use crate::config::Config;
use crate::connection::{ClientConnection, ConnectionIdGenerator, ConnectionLifecycle, Context};
use crate::crdt::{Origin, Replica};
use crate::hooks::{HookChain, HookOutcome};
use crate::protocol::{decode_awareness, encode_awareness, kind, AwarenessEntry, Envelope, SyncPayload};
use crate::registry::DocumentRegistry;
use crate::scheduler::PersistenceScheduler;
use crate::storage::Storage;
use crate::sync_state::SyncState;
use crate::transport::{CloseCode, OutboundSink, Transport};
use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::Mutex;

/// Adapts a [`ClientConnection`]'s transport to the transport-erased
/// [`OutboundSink`] a [`crate::document::Document`] broadcasts through.
struct ConnectionSink<T: Transport>(Arc<ClientConnection<T>>);

#[async_trait]
impl<T: Transport> OutboundSink for ConnectionSink<T> {
    async fn send(&self, bytes: Vec<u8>) {
        if let Err(e) = self.0.transport.send(bytes).await {
            tracing::warn!(connection = self.0.id.as_u64(), error = %e, "broadcast send failed");
        }
    }
}

/// The running sync engine, shared across all connections.
pub struct Server<R: Replica + Default> {
    config: Arc<Config>,
    registry: Arc<DocumentRegistry<R>>,
    scheduler: Arc<PersistenceScheduler>,
    hooks: Arc<HookChain<R>>,
    cluster: Arc<Mutex<ClusterBridge<R>>>,
    storage: Arc<dyn Storage>,
    connection_ids: ConnectionIdGenerator,
}

impl<R: Replica + Default> Server<R> {
    pub fn new(
        config: Config,
        storage: Arc<dyn Storage>,
        pubsub: Arc<dyn crate::pubsub::PubSub>,
        hooks: Vec<Box<dyn crate::hooks::Hook<R>>>,
    ) -> Self {
        let config = Arc::new(config);
        let hooks = Arc::new(HookChain::new(hooks));
        let registry = Arc::new(DocumentRegistry::new(storage.clone(), hooks.clone(), config.clone()));
        let scheduler = Arc::new(PersistenceScheduler::new(config.debounce, config.max_debounce));
        let cluster = Arc::new(Mutex::new(ClusterBridge::new(
            config.clone(),
            pubsub,
            scheduler.clone(),
            hooks.clone(),
            storage.clone(),
        )));

        Self {
            config,
            registry,
            scheduler,
            hooks,
            cluster,
            storage,
            connection_ids: ConnectionIdGenerator::default(),
        }
    }

    /// Accept a newly upgraded transport, running `onConnect` and
    /// `onAuthenticate` before handing back a live connection.
    /// Returns `Err` with a close code/reason when a hook rejects the
    /// connection outright.
    pub async fn accept<T: Transport>(
        &self,
        transport: Arc<T>,
        token: Option<&str>,
    ) -> Result<Arc<ClientConnection<T>>, (CloseCode, String)> {
        let mut ctx = Context::new();

        match self
            .hooks
            .run_on_connect(&mut ctx)
            .await
            .map_err(|e| (CloseCode::ServerError, e.to_string()))?
        {
            HookOutcome::Reject(reason) => return Err((CloseCode::Unauthorized, reason)),
            _ => {}
        }

        match self
            .hooks
            .run_on_authenticate(&mut ctx, token)
            .await
            .map_err(|e| (CloseCode::ServerError, e.to_string()))?
        {
            HookOutcome::Reject(reason) => return Err((CloseCode::AuthRejected, reason)),
            _ => {}
        }

        let id = self.connection_ids.next();
        Ok(Arc::new(ClientConnection::new(id, transport, ctx)))
    }

    /// Attach a connection to a document, loading it if necessary, and send
    /// the initial `SyncStep1` handshake message.
    pub async fn attach_document<T: Transport>(
        &self,
        conn: &Arc<ClientConnection<T>>,
        doc_name: &str,
    ) -> Result<(), crate::error::RegistryError> {
        let doc = self.registry.get_or_create(doc_name).await?;
        doc.attach(conn.id, Arc::new(ConnectionSink(conn.clone())));
        conn.set_sync_state(doc_name, SyncState::Unsynced);

        {
            let mut cluster = self.cluster.lock().await;
            let _ = cluster.subscribe(doc.clone()).await;
        }

        let step1 = Envelope {
            doc_name: doc_name.to_string(),
            kind: kind::SYNC,
            payload: SyncPayload::Step1 {
                state_vector: doc.replica().encode_state_vector(),
            }
            .encode(),
        };
        if transport_send(conn, step1.encode()).await.is_ok() {
            conn.set_sync_state(doc_name, conn.sync_state(doc_name).unwrap().on_step1_sent());
        }

        let awareness = doc.awareness().snapshot();
        if !awareness.is_empty() {
            let env = Envelope {
                doc_name: doc_name.to_string(),
                kind: kind::AWARENESS,
                payload: encode_awareness(
                    &awareness
                        .into_iter()
                        .map(|(client_id, clock, payload)| AwarenessEntry {
                            client_id,
                            clock,
                            payload,
                        })
                        .collect::<Vec<_>>(),
                ),
            };
            let _ = transport_send(conn, env.encode()).await;
        }

        Ok(())
    }

    /// Handle one incoming wire frame from an attached connection (the
    /// per-connection receive loop calls this for every message).
    pub async fn handle_message<T: Transport>(
        &self,
        conn: &Arc<ClientConnection<T>>,
        raw: &[u8],
    ) -> Result<(), (CloseCode, String)> {
        let env = Envelope::decode(raw, self.config.max_frame_size)
            .map_err(|e| (CloseCode::ProtocolError, e.to_string()))?;

        match env.kind {
            kind::SYNC => self.handle_sync(conn, &env.doc_name, &env.payload).await,
            kind::AWARENESS => self.handle_awareness(conn, &env.doc_name, &env.payload).await,
            kind::QUERY_AWARENESS => self.handle_query_awareness(conn, &env.doc_name).await,
            kind::STATELESS | kind::BROADCAST_STATELESS => {
                self.handle_stateless(conn, &env.doc_name, &env.payload, env.kind).await
            }
            other => Err((CloseCode::ProtocolError, format!("unknown message kind {other}"))),
        }
    }

    async fn handle_sync<T: Transport>(
        &self,
        conn: &Arc<ClientConnection<T>>,
        doc_name: &str,
        payload: &[u8],
    ) -> Result<(), (CloseCode, String)> {
        let sync_payload = SyncPayload::decode(payload, self.config.max_frame_size)
            .map_err(|e| (CloseCode::ProtocolError, e.to_string()))?;
        let doc = self
            .registry
            .get(doc_name)
            .ok_or((CloseCode::ProtocolError, "not attached".to_string()))?;

        match sync_payload {
            SyncPayload::Step1 { state_vector } => {
                let diff = doc
                    .replica()
                    .encode_diff(&state_vector)
                    .map_err(|e| (CloseCode::ProtocolError, e.to_string()))?;
                let step2 = Envelope {
                    doc_name: doc_name.to_string(),
                    kind: kind::SYNC,
                    payload: SyncPayload::Step2 { update: diff }.encode(),
                };
                let _ = transport_send(conn, step2.encode()).await;
                let current = conn.sync_state(doc_name).unwrap_or(SyncState::Unsynced);
                conn.set_sync_state(doc_name, current.on_step2_sent());
            }
            SyncPayload::Step2 { update } | SyncPayload::Update { update } => {
                self.apply_and_fan_out(conn, doc_name, &doc, &update).await?;
                let current = conn.sync_state(doc_name).unwrap_or(SyncState::Unsynced);
                conn.set_sync_state(doc_name, current.on_step2_received());
            }
        }
        Ok(())
    }

    async fn apply_and_fan_out<T: Transport>(
        &self,
        conn: &Arc<ClientConnection<T>>,
        doc_name: &str,
        doc: &Arc<crate::document::Document<R>>,
        update: &[u8],
    ) -> Result<(), (CloseCode, String)> {
        let policy = doc
            .apply(update, Origin::Connection(conn.id))
            .map_err(|_| (CloseCode::ProtocolError, "invalid update".to_string()))?;

        let processed = self
            .hooks
            .run_on_change(doc_name, update, Some(conn.id))
            .await
            .map_err(|e| (CloseCode::ServerError, e.to_string()))?;

        if policy.schedule_persist {
            let storage = self.storage.clone();
            let name = doc_name.to_string();
            let doc_for_save = doc.clone();
            let hooks = self.hooks.clone();
            self.scheduler
                .mark_dirty(doc_name, move || async move {
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

        if policy.publish_to_cluster {
            let cluster = self.cluster.lock().await;
            let _ = cluster.publish(doc_name, &processed, Origin::Connection(conn.id)).await;
        }

        if policy.broadcast {
            let env = Envelope {
                doc_name: doc_name.to_string(),
                kind: kind::SYNC,
                payload: SyncPayload::Update { update: processed }.encode(),
            };
            doc.broadcast(env.encode(), policy.exclude).await;
        }
        Ok(())
    }

    async fn handle_awareness<T: Transport>(
        &self,
        conn: &Arc<ClientConnection<T>>,
        doc_name: &str,
        payload: &[u8],
    ) -> Result<(), (CloseCode, String)> {
        let entries = decode_awareness(payload, self.config.max_frame_size)
            .map_err(|e| (CloseCode::ProtocolError, e.to_string()))?;
        let doc = self
            .registry
            .get(doc_name)
            .ok_or((CloseCode::ProtocolError, "not attached".to_string()))?;

        let mut accepted = Vec::new();
        for entry in entries {
            if doc
                .awareness()
                .apply(entry.client_id, entry.clock, entry.payload.clone(), conn.id)
                == ApplyResult::Accepted
            {
                accepted.push(entry);
            }
        }
        if !accepted.is_empty() {
            let env = Envelope {
                doc_name: doc_name.to_string(),
                kind: kind::AWARENESS,
                payload: encode_awareness(&accepted),
            };
            doc.broadcast(env.encode(), Some(conn.id)).await;
        }
        Ok(())
    }

    async fn handle_query_awareness<T: Transport>(
        &self,
        conn: &Arc<ClientConnection<T>>,
        doc_name: &str,
    ) -> Result<(), (CloseCode, String)> {
        let doc = self
            .registry
            .get(doc_name)
            .ok_or((CloseCode::ProtocolError, "not attached".to_string()))?;
        let entries: Vec<AwarenessEntry> = doc
            .awareness()
            .snapshot()
            .into_iter()
            .map(|(client_id, clock, payload)| AwarenessEntry {
                client_id,
                clock,
                payload,
            })
            .collect();
        let env = Envelope {
            doc_name: doc_name.to_string(),
            kind: kind::AWARENESS,
            payload: encode_awareness(&entries),
        };
        let _ = transport_send(conn, env.encode()).await;
        Ok(())
    }

    async fn handle_stateless<T: Transport>(
        &self,
        conn: &Arc<ClientConnection<T>>,
        doc_name: &str,
        payload: &[u8],
        msg_kind: u8,
    ) -> Result<(), (CloseCode, String)> {
        let reply = self
            .hooks
            .run_on_stateless(doc_name, payload)
            .await
            .map_err(|e| (CloseCode::ServerError, e.to_string()))?;
        let env = Envelope {
            doc_name: doc_name.to_string(),
            kind: kind::STATELESS,
            payload: reply.clone(),
        };
        let _ = transport_send(conn, env.encode()).await;

        if msg_kind == kind::BROADCAST_STATELESS {
            if let Some(doc) = self.registry.get(doc_name) {
                let broadcast_env = Envelope {
                    doc_name: doc_name.to_string(),
                    kind: kind::BROADCAST_STATELESS,
                    payload: reply,
                };
                doc.broadcast(broadcast_env.encode(), Some(conn.id)).await;
            }
        }
        Ok(())
    }

    /// Detach a connection from every document it was attached to,
    /// tombstoning its awareness entries, and dropping the connection's
    /// bookkeeping.
    pub async fn disconnect<T: Transport>(&self, conn: &Arc<ClientConnection<T>>) {
        conn.set_lifecycle(ConnectionLifecycle::Closing);
        for doc_name in conn.attached_documents() {
            if let Some(doc) = self.registry.get(&doc_name) {
                let tombstones = doc.awareness().remove_connection(conn.id);
                if !tombstones.is_empty() {
                    let entries: Vec<AwarenessEntry> = tombstones
                        .into_iter()
                        .map(|(client_id, clock, payload)| AwarenessEntry {
                            client_id,
                            clock,
                            payload,
                        })
                        .collect();
                    let env = Envelope {
                        doc_name: doc_name.clone(),
                        kind: kind::AWARENESS,
                        payload: encode_awareness(&entries),
                    };
                    doc.broadcast(env.encode(), Some(conn.id)).await;
                }
                let became_empty = doc.detach(conn.id);
                self.hooks.run_on_disconnect(conn.context(), &doc_name).await;
                if became_empty {
                    self.schedule_unload(doc_name);
                }
            }
        }
        conn.set_lifecycle(ConnectionLifecycle::Closed);
    }

    fn schedule_unload(&self, doc_name: String) {
        let registry = self.registry.clone();
        let scheduler = self.scheduler.clone();
        let hooks = self.hooks.clone();
        let storage = self.storage.clone();
        let cluster = self.cluster.clone();
        let grace = self.config.unload_grace;
        tokio::spawn(async move {
            tokio::time::sleep(grace).await;
            let Some(doc) = registry.get(&doc_name) else {
                return;
            };
            if doc.connection_count() > 0 {
                return;
            }
            doc.set_lifecycle(crate::document::DocumentLifecycle::Unloading);
            hooks.run_before_unload_document(&doc_name).await;

            let doc_for_flush = doc.clone();
            let hooks_for_flush = hooks.clone();
            let name_for_flush = doc_name.clone();
            scheduler
                .flush(&doc_name, move || async move {
                    let state = doc_for_flush.replica().encode_state_as_update();
                    hooks_for_flush.run_on_store_document(&name_for_flush, &state).await;
                    if let Err(e) = storage.store(&name_for_flush, &state).await {
                        tracing::warn!(doc = %name_for_flush, error = %e, "persist on unload failed");
                    } else {
                        tracing::debug!(doc = %name_for_flush, "persisted document on unload");
                        hooks_for_flush.run_after_store_document(&name_for_flush).await;
                    }
                })
                .await;

            cluster.lock().await.unsubscribe(&doc_name).await;
            doc.stop_awareness_expiry();
            doc.set_lifecycle(crate::document::DocumentLifecycle::Closed);
            registry.evict(&doc_name, &doc);
            hooks.run_after_unload_document(&doc_name).await;
        });
    }

    /// Aggregate resident-document and connection counts, for a health
    /// endpoint. Not wire-exposed.
    pub fn stats(&self) -> crate::registry::RegistryStats {
        self.registry.stats()
    }

    /// Graceful shutdown: stop accepting new work, flush and
    /// unload every resident document, then run `onDestroy`.
    pub async fn shutdown(&self) {
        for doc_name in self.registry.loaded_names() {
            if let Some(doc) = self.registry.get(&doc_name) {
                self.hooks.run_before_unload_document(&doc_name).await;
                let storage = self.storage.clone();
                let hooks = self.hooks.clone();
                let name = doc_name.clone();
                let doc_for_flush = doc.clone();
                self.scheduler
                    .flush(&doc_name, move || async move {
                        let state = doc_for_flush.replica().encode_state_as_update();
                        hooks.run_on_store_document(&name, &state).await;
                        if let Err(e) = storage.store(&name, &state).await {
                            tracing::warn!(doc = %name, error = %e, "persist on shutdown failed");
                        } else {
                            tracing::debug!(doc = %name, "persisted document on shutdown");
                            hooks.run_after_store_document(&name).await;
                        }
                    })
                    .await;
                self.cluster.lock().await.unsubscribe(&doc_name).await;
                doc.stop_awareness_expiry();
                self.registry.evict(&doc_name, &doc);
                self.hooks.run_after_unload_document(&doc_name).await;
            }
        }
        self.hooks.run_on_destroy().await;
    }
}

async fn transport_send<T: Transport>(
    conn: &Arc<ClientConnection<T>>,
    bytes: Vec<u8>,
) -> Result<(), crate::transport::TransportError> {
    conn.transport.send(bytes).await
}
