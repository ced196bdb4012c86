#![forbid(unsafe_code)]

// Signaling module - WebSocket signaling server and HTTP surface

pub mod connection;
pub mod protocol;

use crate::config::ServerConfig;
use crate::metrics::{LiveGauges, ServerMetrics};
use crate::registry::ConnectionRegistry;
use crate::room::{api, RoomManager};
use crate::transcode::{StreamEvent, TranscodeSupervisor};
use axum::{
    extract::{ws::WebSocketUpgrade, State},
    http::{HeaderMap, StatusCode},
    middleware,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use protocol::ServerMessage;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::{mpsc, Semaphore};
use tower_http::cors::CorsLayer;
use tower_http::services::ServeDir;
use tracing::{debug, info, warn};

/// Signaling server state
#[derive(Clone)]
pub struct SignalingServer {
    config: Arc<ServerConfig>,
    registry: Arc<ConnectionRegistry>,
    room_manager: Arc<RoomManager>,
    transcoder: Arc<TranscodeSupervisor>,
    metrics: ServerMetrics,
    connection_semaphore: Arc<Semaphore>,
}

impl SignalingServer {
    /// Creates the server and starts its background tasks.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn new(config: ServerConfig, metrics: ServerMetrics) -> Self {
        let registry = Arc::new(ConnectionRegistry::new());
        let room_manager = Arc::new(RoomManager::new(config.room.clone(), Arc::clone(&registry)));
        let (transcoder, events) = TranscodeSupervisor::new(config.transcode.clone(), metrics.clone());

        let server = Self {
            connection_semaphore: Arc::new(Semaphore::new(config.max_connections)),
            config: Arc::new(config),
            registry,
            room_manager,
            transcoder,
            metrics,
        };
        server.spawn_stream_events(events);
        server.spawn_room_sweeper();
        server.transcoder.spawn_maintenance();
        server
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        &self.registry
    }

    pub fn room_manager(&self) -> &Arc<RoomManager> {
        &self.room_manager
    }

    pub fn transcoder(&self) -> &Arc<TranscodeSupervisor> {
        &self.transcoder
    }

    pub fn metrics(&self) -> &ServerMetrics {
        &self.metrics
    }

    fn live_gauges(&self) -> LiveGauges {
        LiveGauges {
            rooms: self.room_manager.room_count(),
            occupants: self.room_manager.occupant_count(),
            streams: self.transcoder.active_count(),
        }
    }

    /// Stop a room's transcoder and drop its viewer state, e.g. once the
    /// room itself is gone.
    pub fn release_stream(&self, room_code: &str) {
        if self.transcoder.stop(room_code) {
            info!("Stopped stream for closed room {}", room_code);
        }
        self.transcoder.viewers().forget(room_code);
    }

    /// Translate supervisor outcomes into messages for the room's occupants.
    fn spawn_stream_events(&self, mut events: mpsc::UnboundedReceiver<StreamEvent>) {
        let rooms = Arc::clone(&self.room_manager);
        let transcode = self.config.transcode.clone();
        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                let room_code = event.room_code().to_string();
                let reached = match event {
                    StreamEvent::Ready { playlist_url, .. } => {
                        let watch_url = transcode.watch_url(&room_code);
                        rooms
                            .notify_stream_ready(&room_code, &playlist_url, &watch_url)
                            .unwrap_or(0)
                    }
                    StreamEvent::Failed { error, .. } => {
                        rooms.clear_stream(&room_code);
                        rooms.broadcast(
                            &room_code,
                            &ServerMessage::StreamError {
                                room_code: room_code.clone(),
                                message: error.to_string(),
                            },
                        )
                    }
                    StreamEvent::Crashed { detail, .. } => {
                        rooms.clear_stream(&room_code);
                        rooms.broadcast(
                            &room_code,
                            &ServerMessage::StreamError {
                                room_code: room_code.clone(),
                                message: format!("Transcoder exited unexpectedly: {detail}"),
                            },
                        )
                    }
                    StreamEvent::AutoStopped { .. } => {
                        rooms.clear_stream(&room_code);
                        rooms.broadcast(
                            &room_code,
                            &ServerMessage::StreamStopped {
                                room_code: room_code.clone(),
                            },
                        )
                    }
                };
                debug!("Stream event for room {} delivered to {} occupant(s)", room_code, reached);
            }
        });
    }

    /// Periodic expiry sweep; streams of deleted rooms are stopped and the
    /// snapshot is refreshed.
    fn spawn_room_sweeper(&self) {
        let server = self.clone();
        let mut interval = tokio::time::interval(self.config.room.sweep_interval);
        tokio::spawn(async move {
            interval.tick().await;
            loop {
                interval.tick().await;
                let report = server.room_manager.sweep();
                for room_code in &report.deleted {
                    server.release_stream(room_code);
                }
                server.room_manager.persist_snapshot().await;
            }
        });
    }

    /// Creates the Axum router for the signaling server
    pub fn router(self) -> Router {
        let hls = Router::new()
            .fallback_service(ServeDir::new(self.config.transcode.hls_root.clone()))
            .layer(middleware::from_fn_with_state(self.clone(), api::track_hls_activity));

        Router::new()
            .route("/ws", get(ws_handler))
            .route("/health", get(health_handler))
            .route("/metrics", get(metrics_handler))
            .route("/api/rooms/{code}", get(api::room_info))
            .route("/api/rooms/{code}/stream-ready", post(api::stream_ready))
            .route("/api/streams/{code}/viewers", post(api::viewer_beacon))
            .nest("/hls", hls)
            .with_state(self)
            .layer(CorsLayer::permissive())
    }

    /// Starts the signaling server on the specified port
    ///
    /// # Errors
    /// Returns an error if the server fails to bind to the port
    pub async fn serve(self, port: u16) -> anyhow::Result<()> {
        let addr = format!("0.0.0.0:{port}");
        let listener = TcpListener::bind(&addr).await?;
        self.serve_on(listener).await
    }

    /// Serve on an already bound listener.
    pub async fn serve_on(self, listener: TcpListener) -> anyhow::Result<()> {
        info!("Signaling server listening on {}", listener.local_addr()?);
        let app = self.router();
        axum::serve(listener, app).await?;
        Ok(())
    }

    /// Close all rooms and stop every transcoder.
    pub async fn shutdown(&self) {
        let closed = self.room_manager.close_all("Server shutting down");
        info!("Closed {} room(s) for shutdown", closed.len());
        self.room_manager.persist_snapshot().await;
        self.transcoder.shutdown().await;
    }
}

/// Health check handler
async fn health_handler(State(server): State<SignalingServer>) -> Json<serde_json::Value> {
    let live = server.live_gauges();
    Json(serde_json::json!({
        "status": "ok",
        "rooms": live.rooms,
        "connections": server.registry.len(),
        "streams": live.streams,
    }))
}

/// Metrics handler, Prometheus text exposition format.
/// Protected by the optional METRICS_TOKEN (Bearer auth).
async fn metrics_handler(State(server): State<SignalingServer>, headers: HeaderMap) -> Response {
    if let Some(expected) = &server.config.metrics_token {
        let provided = headers
            .get("authorization")
            .and_then(|v| v.to_str().ok())
            .unwrap_or("");
        if provided != format!("Bearer {expected}") {
            return StatusCode::UNAUTHORIZED.into_response();
        }
    }

    let body = server.metrics.render_prometheus(server.live_gauges());
    (
        StatusCode::OK,
        [("content-type", "text/plain; version=0.0.4; charset=utf-8")],
        body,
    )
        .into_response()
}

/// WebSocket upgrade handler
async fn ws_handler(ws: WebSocketUpgrade, State(server): State<SignalingServer>) -> Response {
    let permit = match server.connection_semaphore.clone().try_acquire_owned() {
        Ok(permit) => permit,
        Err(_) => {
            warn!("Connection limit reached, rejecting WebSocket upgrade");
            return (StatusCode::SERVICE_UNAVAILABLE, "Too many connections").into_response();
        }
    };

    ws.max_message_size(server.config.max_message_size)
        .on_failed_upgrade(|error| {
            warn!("WebSocket upgrade failed: {}", error);
        })
        .on_upgrade(move |socket| connection::handle_connection(socket, server, permit))
}
