//! Top-level error type for the parts of `collab-core`'s error taxonomy
//! that must cross an axum handler boundary as an HTTP response.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use collab_core::RegistryError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CollabError {
    #[error(transparent)]
    Registry(#[from] RegistryError),
    #[error("invalid configuration: {0}")]
    Config(String),
}

impl IntoResponse for CollabError {
    fn into_response(self) -> Response {
        let status = match &self {
            CollabError::Registry(_) => StatusCode::SERVICE_UNAVAILABLE,
            CollabError::Config(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        (status, self.to_string()).into_response()
    }
}
