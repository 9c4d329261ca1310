//! # Collab Core
//!
//! Document lifecycle and synchronization engine for collaborative Y-CRDT
//! editing, compatible with the Hocuspocus wire protocol.
//!
//! This crate is transport- and storage-agnostic: it defines the protocol
//! codec, the sync and awareness state machines, the document registry and
//! its persistence and cluster-fan-out policies, and an extension pipeline
//! extensions hook into — but never opens a socket or a database connection
//! itself. `collab-server` supplies those via the [`Transport`],
//! [`Storage`], and [`PubSub`] trait objects this crate consumes.

pub mod awareness;
pub mod cluster;
pub mod config;
pub mod connection;
pub mod crdt;
pub mod document;
pub mod error;
pub mod hooks;
pub mod protocol;
pub mod pubsub;
pub mod registry;
pub mod scheduler;
pub mod server;
pub mod storage;
pub mod sync_state;
#[cfg(any(test, feature = "testing"))]
pub mod testing;
pub mod transport;

pub use config::Config;
pub use crdt::{Origin, Replica, YrsReplica};
pub use document::Document;
pub use error::{ClusterError, CodecError, HookError, RegistryError, StoreError, SyncError};
pub use hooks::{Hook, HookChain, HookOutcome};
pub use pubsub::{InProcessPubSub, PubSub};
pub use registry::{DocumentRegistry, RegistryStats};
pub use server::Server;
pub use storage::{FilesystemStorage, Storage};
#[cfg(any(test, feature = "testing"))]
pub use testing::InMemoryStorage;
pub use transport::{CloseCode, OutboundSink, Transport, TransportError};

/// The default server type, parameterized over the reference [`YrsReplica`]
/// CRDT engine. Most callers never need a different `Replica` impl.
pub type DefaultServer = Server<YrsReplica>;
