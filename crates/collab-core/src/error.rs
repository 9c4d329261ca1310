//! Error taxonomy for the sync engine.
//!
//! Each error kind maps to a close code or a handling policy; see
//! [`crate::server::CloseCode`] and [`crate::hooks::HookOutcome`].

use thiserror::Error;

/// Errors raised while decoding or encoding a wire frame (C1).
#[derive(Debug, Error)]
pub enum CodecError {
    #[error("truncated or otherwise malformed frame")]
    MalformedFrame,
    #[error("frame exceeds the configured maximum size ({0} bytes)")]
    FrameTooLarge(usize),
    #[error("unrecognized message kind byte: {0}")]
    UnknownMessageKind(u8),
}

/// Errors raised while driving the sync state machine or applying updates (C2/C4).
#[derive(Debug, Error)]
pub enum SyncError {
    #[error(transparent)]
    Codec(#[from] CodecError),
    #[error("CRDT engine rejected update bytes: {0}")]
    InvalidUpdate(String),
}

/// Errors surfaced by the extension pipeline (C7).
#[derive(Debug, Error)]
pub enum HookError {
    #[error("mandatory hook failed: {0}")]
    Mandatory(String),
    #[error("advisory hook failed: {0}")]
    Advisory(String),
}

/// Errors raised by the document registry (C5).
#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("document load failed: {0}")]
    LoadFailed(String),
}

/// Errors raised by the persistence scheduler / storage backend (C6).
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("storage backend rejected the operation: {0}")]
    StoreFailed(String),
}

/// Errors raised by the cluster bridge (C8).
#[derive(Debug, Error)]
pub enum ClusterError {
    #[error("pub/sub publish failed: {0}")]
    PublishFailed(String),
    #[error("pub/sub subscribe failed: {0}")]
    SubscribeFailed(String),
}
