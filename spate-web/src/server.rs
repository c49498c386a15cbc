//! HTTP server wiring.

use std::sync::Arc;

use axum::Router;
use axum::routing::{delete, get, post};
use spate_core::StreamRegistry;
use tower_http::cors::CorsLayer;

use crate::handlers::{
    master_playlist, rendition_playlist, rendition_segment, server_stats, start_stream,
    stop_stream, stream_status,
};

#[derive(Clone)]
pub struct AppState {
    pub registry: Arc<StreamRegistry>,
}

/// Builds the API router over a registry.
pub fn router(registry: Arc<StreamRegistry>) -> Router {
    let state = AppState { registry };

    Router::new()
        .route("/api/stats", get(server_stats))
        .route("/api/stream", post(start_stream))
        .route("/api/stream/{id}/status", get(stream_status))
        .route("/api/stream/{id}/master.m3u8", get(master_playlist))
        .route(
            "/api/stream/{id}/{quality}/playlist.m3u8",
            get(rendition_playlist),
        )
        .route("/api/stream/{id}/{quality}/{segment}", get(rendition_segment))
        .route("/api/stream/{id}", delete(stop_stream))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Binds the listener and serves until SIGINT/SIGTERM, then tears every
/// stream down.
///
/// # Errors
/// Returns an error if the port cannot be bound or the server fails while
/// running. Both are unrecoverable startup/runtime failures for the caller.
pub async fn run_server(
    registry: Arc<StreamRegistry>,
    port: u16,
) -> Result<(), Box<dyn std::error::Error>> {
    let app = router(Arc::clone(&registry));

    let listener = tokio::net::TcpListener::bind(("0.0.0.0", port)).await?;
    tracing::info!("server listening on http://0.0.0.0:{port}");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    tracing::info!("shutting down, cleaning up streams");
    registry.stop_all().await;
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        let _ = tokio::signal::ctrl_c().await;
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(_) => std::future::pending().await,
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {}
        () = terminate => {}
    }
}
