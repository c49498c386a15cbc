//! Stream API handlers.
//!
//! The serving endpoints implement the wait-for-file semantics an ABR player
//! relies on: the master is advertised eagerly, so per-rendition playlist
//! requests long-poll until their worker has written output, and segment
//! requests hold until the file's size has been stable long enough to be
//! fully written.

use std::path::PathBuf;

use axum::body::Body;
use axum::extract::{Path, State};
use axum::http::{StatusCode, header};
use axum::response::{IntoResponse, Json, Response};
use serde::Deserialize;
use serde_json::json;
use spate_core::readiness::{StableWait, wait_for_stable_file};
use spate_core::{RegistryError, StreamState};
use tokio_util::sync::CancellationToken;

use crate::server::AppState;

const PLAYLIST_CONTENT_TYPE: &str = "application/vnd.apple.mpegurl";
const SEGMENT_CONTENT_TYPE: &str = "video/mp2t";

#[derive(Deserialize)]
pub struct StreamRequest {
    pub input: Option<String>,
}

/// POST /api/stream
pub async fn start_stream(
    State(state): State<AppState>,
    Json(request): Json<StreamRequest>,
) -> Response {
    let Some(input) = request.input.filter(|input| !input.trim().is_empty()) else {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({"error": "Input is required (magnet link or info-hash)"})),
        )
            .into_response();
    };

    match state.registry.admit(&input).await {
        Ok(handle) => (
            StatusCode::OK,
            Json(json!({
                "id": handle.id,
                "message": "Stream started",
            })),
        )
            .into_response(),
        Err(RegistryError::Transient { reason }) => {
            tracing::warn!("admission failed: {reason}");
            (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(json!({"error": reason})),
            )
                .into_response()
        }
    }
}

/// GET /api/stream/{id}/status
pub async fn stream_status(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Response {
    let Some(handle) = state.registry.get(&id).await else {
        return stream_not_found();
    };

    let status = handle.status();
    Json(json!({
        "id": status.id,
        "status": status.state.as_str(),
        "progress": status.progress,
        "fileName": status.file_name,
        "error": status.last_error,
        "peers": status.peers,
        // Total downloaded in MB
        "downloaded": status.downloaded_bytes as f64 / 1_048_576.0,
        // Instantaneous rate in MB/s
        "speed": status.speed_mbps,
        "qualities": status.ready_renditions,
        "sourceWidth": status.source_width,
        "sourceHeight": status.source_height,
        "hlsUrl": format!("/api/stream/{}/master.m3u8", status.id),
    }))
    .into_response()
}

/// GET /api/stream/{id}/master.m3u8
pub async fn master_playlist(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Response {
    let Some(handle) = state.registry.get(&id).await else {
        return stream_not_found();
    };

    let status = handle.status();
    if !matches!(status.state, StreamState::Transcoding | StreamState::Ready) {
        return (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({"error": "Stream is not ready yet"})),
        )
            .into_response();
    }

    let Some(master_path) = status.hls_root.as_ref().map(|root| root.join("master.m3u8"))
    else {
        return (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({"error": "Playlist not generated yet"})),
        )
            .into_response();
    };

    match tokio::fs::read(&master_path).await {
        Ok(content) => playlist_response(content),
        Err(_) => (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({"error": "Playlist not generated yet"})),
        )
            .into_response(),
    }
}

/// GET /api/stream/{id}/{quality}/playlist.m3u8
///
/// The master lists every planned rendition before the workers have written
/// anything, and players request all of them during load. Answering 404 too
/// early fails the whole load, so this endpoint holds the request until the
/// playlist exists, the stream errors out, or the wait deadline passes.
pub async fn rendition_playlist(
    State(state): State<AppState>,
    Path((id, quality)): Path<(String, String)>,
) -> Response {
    let Some(handle) = state.registry.get(&id).await else {
        return stream_not_found();
    };
    let Some(playlist_path) = rendition_file_path(&state, &id, &quality, "playlist.m3u8") else {
        return stream_not_found();
    };

    let config = &state.registry.context().config.streaming;
    let deadline = tokio::time::Instant::now() + config.playlist_wait;

    loop {
        if tokio::fs::metadata(&playlist_path).await.is_ok() {
            break;
        }

        if handle.status().state == StreamState::Error {
            return (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(json!({"error": "Stream failed"})),
            )
                .into_response();
        }

        if tokio::time::Instant::now() >= deadline {
            return (
                StatusCode::NOT_FOUND,
                Json(json!({"error": "Rendition playlist was not generated"})),
            )
                .into_response();
        }

        tokio::time::sleep(config.playlist_poll_interval).await;
    }

    match tokio::fs::read(&playlist_path).await {
        Ok(content) => playlist_response(content),
        Err(_) => (
            StatusCode::NOT_FOUND,
            Json(json!({"error": "Rendition playlist was not generated"})),
        )
            .into_response(),
    }
}

/// GET /api/stream/{id}/{quality}/{segment}
///
/// Never serves a segment that is still being written: the file's size must
/// hold still for the stability window first.
pub async fn rendition_segment(
    State(state): State<AppState>,
    Path((id, quality, segment)): Path<(String, String, String)>,
) -> Response {
    if state.registry.get(&id).await.is_none() {
        return stream_not_found();
    }
    let Some(segment_path) = rendition_file_path(&state, &id, &quality, &segment) else {
        return stream_not_found();
    };

    let config = &state.registry.context().config.streaming;
    let cancel = CancellationToken::new();

    match wait_for_stable_file(
        &segment_path,
        config.segment_wait,
        config.stability_window,
        config.file_poll_interval,
        &cancel,
    )
    .await
    {
        StableWait::Stable => match tokio::fs::read(&segment_path).await {
            Ok(content) => Response::builder()
                .status(StatusCode::OK)
                .header(header::CONTENT_TYPE, SEGMENT_CONTENT_TYPE)
                .header(header::CACHE_CONTROL, "max-age=3600")
                .body(Body::from(content))
                .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response()),
            Err(_) => (
                StatusCode::NOT_FOUND,
                Json(json!({"error": "Segment not found"})),
            )
                .into_response(),
        },
        StableWait::NeverAppeared => (
            StatusCode::NOT_FOUND,
            Json(json!({"error": "Segment not found"})),
        )
            .into_response(),
        StableWait::NeverStabilized => (
            StatusCode::GATEWAY_TIMEOUT,
            Json(json!({"error": "Timed out waiting for segment"})),
        )
            .into_response(),
        StableWait::Cancelled => StatusCode::INTERNAL_SERVER_ERROR.into_response(),
    }
}

/// DELETE /api/stream/{id}
pub async fn stop_stream(State(state): State<AppState>, Path(id): Path<String>) -> Response {
    state.registry.stop(&id).await;
    Json(json!({"message": "Stream removed"})).into_response()
}

/// GET /api/stats
pub async fn server_stats(State(state): State<AppState>) -> Response {
    let registry_stats = state.registry.stats().await;
    let (cache_entries, _, _) = state.registry.context().cache.stats();

    Json(json!({
        "activeStreams": registry_stats.active_streams,
        "diskUsageBytes": registry_stats.disk_bytes,
        "cachedTorrents": cache_entries,
    }))
    .into_response()
}

/// Resolves `<downloads>/<id>/hls/<quality>/<file>` while refusing path
/// components that could escape the stream's directory.
fn rendition_file_path(
    state: &AppState,
    id: &str,
    quality: &str,
    file: &str,
) -> Option<PathBuf> {
    for component in [id, quality, file] {
        if component.is_empty()
            || component.contains("..")
            || component.contains('/')
            || component.contains('\\')
        {
            return None;
        }
    }

    Some(
        state
            .registry
            .context()
            .config
            .server
            .downloads_dir
            .join(id)
            .join("hls")
            .join(quality)
            .join(file),
    )
}

fn playlist_response(content: Vec<u8>) -> Response {
    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, PLAYLIST_CONTENT_TYPE)
        .header(header::CACHE_CONTROL, "no-cache")
        .body(Body::from(content))
        .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response())
}

fn stream_not_found() -> Response {
    (
        StatusCode::NOT_FOUND,
        Json(json!({"error": "Stream not found"})),
    )
        .into_response()
}
