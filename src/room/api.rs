#![forbid(unsafe_code)]

// HTTP handlers for room metadata, stream registration and HLS viewer beacons

use crate::room::error::RoomError;
use crate::room::{normalize_key, RoomInfo};
use crate::signaling::SignalingServer;
use axum::{
    body::Bytes,
    extract::{Path, Request, State},
    http::StatusCode,
    middleware::Next,
    response::{IntoResponse, Response},
    Json,
};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

fn room_error_response(e: RoomError) -> Response {
    let status = match e {
        RoomError::NotFound(_) => StatusCode::NOT_FOUND,
        _ => StatusCode::BAD_REQUEST,
    };
    (status, e.to_string()).into_response()
}

/// GET /api/rooms/{code}
pub async fn room_info(
    State(server): State<SignalingServer>,
    Path(code): Path<String>,
) -> Result<Json<RoomInfo>, Response> {
    server
        .room_manager()
        .room_info(&code)
        .map(Json)
        .ok_or_else(|| (StatusCode::NOT_FOUND, "Room not found").into_response())
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamReadyRequest {
    pub hls_url: String,
    pub watch_page_url: Option<String>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamReadyResponse {
    pub room_code: String,
    pub notified: usize,
}

/// POST /api/rooms/{code}/stream-ready
///
/// Registers HLS output produced outside this server and pushes
/// `stream_ready` to both occupants.
pub async fn stream_ready(
    State(server): State<SignalingServer>,
    Path(code): Path<String>,
    Json(req): Json<StreamReadyRequest>,
) -> Result<Json<StreamReadyResponse>, Response> {
    let room_code = normalize_key(&code).map_err(room_error_response)?;
    if req.hls_url.trim().is_empty() {
        return Err((StatusCode::BAD_REQUEST, "hlsUrl must not be empty").into_response());
    }
    let watch_page_url = req
        .watch_page_url
        .unwrap_or_else(|| server.transcoder().config().watch_url(&room_code));

    let notified = server
        .room_manager()
        .notify_stream_ready(&room_code, &req.hls_url, &watch_page_url)
        .map_err(room_error_response)?;
    info!("External stream registered for room {}", room_code);
    Ok(Json(StreamReadyResponse { room_code, notified }))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ViewerAction {
    Join,
    Leave,
    Ping,
}

#[derive(Debug, Deserialize)]
pub struct ViewerBeacon {
    pub action: ViewerAction,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ViewerCountResponse {
    pub room_code: String,
    pub viewers: usize,
    pub streaming: bool,
}

/// POST /api/streams/{code}/viewers
///
/// Takes the raw body since `navigator.sendBeacon` posts JSON as text/plain.
/// Beacons for rooms with neither a room entry nor a transcode session get 404.
pub async fn viewer_beacon(
    State(server): State<SignalingServer>,
    Path(code): Path<String>,
    body: Bytes,
) -> Result<Json<ViewerCountResponse>, Response> {
    let room_code = normalize_key(&code).map_err(room_error_response)?;
    let beacon: ViewerBeacon = serde_json::from_slice(&body)
        .map_err(|e| (StatusCode::BAD_REQUEST, format!("Invalid beacon: {e}")).into_response())?;

    let transcoder = server.transcoder();
    let known = server.room_manager().room_info(&room_code).is_some()
        || transcoder.state(&room_code).is_some();
    if !known {
        return Err((StatusCode::NOT_FOUND, "Room not found").into_response());
    }
    let viewers = match beacon.action {
        ViewerAction::Join => transcoder.viewers().add_viewer(&room_code),
        ViewerAction::Leave => transcoder.viewers().remove_viewer(&room_code),
        ViewerAction::Ping => transcoder.viewers().record_activity(&room_code),
    };
    Ok(Json(ViewerCountResponse {
        streaming: transcoder.is_streaming(&room_code),
        room_code,
        viewers,
    }))
}

/// Middleware on the HLS file service: any playlist or segment fetch for a
/// live stream counts as viewer activity.
pub async fn track_hls_activity(
    State(server): State<SignalingServer>,
    request: Request,
    next: Next,
) -> Response {
    let code = request
        .uri()
        .path()
        .trim_start_matches('/')
        .split('/')
        .next()
        .and_then(|segment| normalize_key(segment).ok());
    if let Some(code) = code {
        if server.transcoder().is_streaming(&code) {
            let viewers = server.transcoder().viewers().record_activity(&code);
            debug!("HLS fetch for room {} ({} viewer(s))", code, viewers);
        }
    }
    next.run(request).await
}
