use crate::error::CollabError;
use crate::AppState;
use axum::extract::State;
use axum::Json;
use serde::Serialize;

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    documents: usize,
    connections: usize,
}

pub async fn health_handler(State(state): State<AppState>) -> Result<Json<HealthResponse>, CollabError> {
    let stats = state.server.stats();
    Ok(Json(HealthResponse {
        documents: stats.documents,
        connections: stats.connections,
    }))
}
