mod config;
mod error;
mod handlers;

use axum::http::Method;
use axum::routing::get;
use axum::Router;
use collab_core::{FilesystemStorage, InProcessPubSub, Server, Storage, YrsReplica};
use config::Config;
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

/// Shared application state handed to every request handler.
#[derive(Clone)]
pub struct AppState {
    server: Arc<Server<YrsReplica>>,
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(
            |_| tracing_subscriber::EnvFilter::new("collab_core=debug,collab_server=debug,tower_http=debug"),
        ))
        .init();

    let config = match Config::from_env() {
        Ok(config) => config,
        Err(e) => {
            tracing::error!(error = %e, "invalid configuration");
            std::process::exit(1);
        }
    };

    let storage: Arc<dyn Storage> = Arc::new(FilesystemStorage::new(&config.storage_dir));
    let pubsub = Arc::new(InProcessPubSub::default());
    let hooks = Vec::new();

    let server = Arc::new(Server::new(config.engine.clone(), storage, pubsub, hooks));
    let state = AppState { server: server.clone() };

    let cors = CorsLayer::new()
        .allow_methods([Method::GET])
        .allow_origin(if config.cors_origins.is_empty() {
            tower_http::cors::AllowOrigin::any()
        } else {
            tower_http::cors::AllowOrigin::list(
                config
                    .cors_origins
                    .iter()
                    .filter_map(|o| o.parse().ok()),
            )
        });

    let app = Router::new()
        .route("/ws", get(handlers::ws_handler))
        .route("/health", get(handlers::health_handler))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state);

    let addr = config.server_addr();
    tracing::info!(%addr, "collab-server listening");
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .expect("failed to bind listener");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(server))
        .await
        .expect("server error");
}

async fn shutdown_signal(server: Arc<Server<YrsReplica>>) {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    tracing::info!("shutting down, flushing resident documents");
    server.shutdown().await;
}

