#![forbid(unsafe_code)]

// WebSocket connection handler for individual clients

use super::protocol::{parse_client_message, ClientMessage, ServerMessage, SignalError};
use super::SignalingServer;
use crate::registry::{ConnectionId, Outbound, PeerHandle};
use crate::room::roles::Role;
use crate::room::{Departure, PeerLookup, PeerRoute};
use crate::transcode::ChunkStatus;
use axum::body::Bytes;
use axum::extract::ws::{CloseFrame, Message, Utf8Bytes, WebSocket};
use futures_util::{SinkExt, StreamExt};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::mpsc;
use tokio::sync::OwnedSemaphorePermit;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Bounded channel capacity per client.
/// Frames queued beyond this are dropped with a warning.
const CHANNEL_CAPACITY: usize = 64;

/// Per-connection state the message handlers need.
struct Session {
    id: ConnectionId,
    handle: PeerHandle,
    server: SignalingServer,
    /// A media rejection was already reported on this connection
    media_rejected: bool,
}

/// Handles a WebSocket connection
pub async fn handle_connection(socket: WebSocket, server: SignalingServer, _permit: OwnedSemaphorePermit) {
    let id = Uuid::new_v4();
    info!("New WebSocket connection: {}", id);

    let metrics = server.metrics().clone();
    metrics.inc_connections_total();
    let _conn_guard = metrics.connection_active_guard();

    let (mut ws_sender, mut ws_receiver) = socket.split();
    let (tx, mut rx) = mpsc::channel::<Outbound>(CHANNEL_CAPACITY);

    let handle = PeerHandle::new(id, &tx);
    server.registry().register(id);

    let send_metrics = metrics.clone();
    let send_task = tokio::spawn(async move {
        while let Some(outbound) = rx.recv().await {
            let result = match outbound {
                Outbound::Text(json) => {
                    send_metrics.inc_messages_sent();
                    ws_sender.send(Message::Text((*json).clone().into())).await
                }
                Outbound::Ping => ws_sender.send(Message::Ping(Bytes::new())).await,
                Outbound::Close { code, reason } => {
                    let frame = CloseFrame {
                        code,
                        reason: Utf8Bytes::from_static(reason),
                    };
                    let _ = ws_sender.send(Message::Close(Some(frame))).await;
                    break;
                }
            };
            if result.is_err() {
                break;
            }
        }
        debug!("Send task finished for connection: {}", id);
    });

    let mut session = Session {
        id,
        handle,
        server: server.clone(),
        media_rejected: false,
    };

    let mut heartbeat = tokio::time::interval(server.config().heartbeat_interval);
    heartbeat.tick().await;

    loop {
        tokio::select! {
            frame = ws_receiver.next() => {
                let msg = match frame {
                    Some(Ok(message)) => message,
                    Some(Err(e)) => {
                        debug!("WebSocket error for connection {}: {}", id, e);
                        break;
                    }
                    None => break,
                };
                // Any inbound frame counts as a heartbeat answer
                server.registry().mark_alive(id);
                match msg {
                    Message::Text(text) => {
                        metrics.inc_messages_received();
                        let start = Instant::now();
                        session.handle_text(text.as_str()).await;
                        metrics.observe_message_handling(start.elapsed());
                    }
                    Message::Binary(chunk) => {
                        metrics.inc_chunks_received();
                        session.handle_media(chunk).await;
                    }
                    Message::Ping(_) | Message::Pong(_) => {}
                    Message::Close(_) => {
                        info!("Connection {} closed by client", id);
                        break;
                    }
                }
            }
            _ = heartbeat.tick() => {
                if !server.registry().check_alive(id) {
                    warn!("Connection {} missed a heartbeat, terminating", id);
                    break;
                }
                if tx.try_send(Outbound::Ping).is_err() {
                    debug!("Could not queue heartbeat ping for {}", id);
                }
            }
            _ = tx.closed() => {
                debug!("Outbound queue closed for connection {}", id);
                break;
            }
        }
    }

    // Cleanup
    if let Some(departure) = server.room_manager().handle_disconnect(id) {
        session.after_departure(&departure);
    }
    server.registry().unregister(id);
    drop(session);
    drop(tx);
    let _ = send_task.await;
    info!("Connection {} cleaned up", id);
}

impl Session {
    fn reply(&self, message: &ServerMessage) {
        self.handle.send(message);
    }

    fn report(&self, error: &SignalError) {
        self.server.metrics().inc_errors();
        self.reply(&error.to_message());
    }

    async fn handle_text(&mut self, text: &str) {
        let result = match parse_client_message(text) {
            Ok(message) => {
                debug!("Connection {} sent {}", self.id, message.kind());
                self.dispatch(message, text).await
            }
            Err(e) => Err(e),
        };
        if let Err(e) = result {
            warn!("Message from {} rejected: {}", self.id, e);
            self.report(&e);
        }
    }

    async fn dispatch(&mut self, message: ClientMessage, raw: &str) -> Result<(), SignalError> {
        match message {
            ClientMessage::CreateRoom {
                room_code,
                created_at,
                expires_at,
            } => {
                let outcome = self
                    .server
                    .room_manager()
                    .create_room(&room_code, created_at, expires_at, self.handle.clone())
                    .await?;
                self.after_switch(outcome.released.as_ref());
                self.server.metrics().inc_rooms_created();
                self.media_rejected = false;
                self.reply(&ServerMessage::RoomCreated {
                    room_code: outcome.room_code,
                });
                Ok(())
            }

            ClientMessage::JoinRoom { room_code } => {
                let outcome = self
                    .server
                    .room_manager()
                    .join_room(&room_code, self.handle.clone())?;
                self.after_switch(outcome.released.as_ref());
                self.server.metrics().inc_joins();
                self.reply(&ServerMessage::RoomJoined {
                    room_code: outcome.room_code,
                    peer_ready: outcome.peer_ready,
                });
                Ok(())
            }

            ClientMessage::Join { session_id, role } => {
                let role = Role::from_legacy(&role)
                    .ok_or_else(|| SignalError::MalformedMessage(format!("unknown role {role:?}")))?;
                let outcome = self
                    .server
                    .room_manager()
                    .claim_slot(&session_id, role, self.handle.clone())?;
                self.after_switch(outcome.released.as_ref());
                self.server.metrics().inc_joins();
                self.media_rejected = false;
                self.reply(&ServerMessage::Joined {
                    session_id: outcome.room_code,
                    role,
                    peer_ready: outcome.peer_ready,
                });
                Ok(())
            }

            ClientMessage::Leave => {
                if let Some(departure) = self.server.room_manager().leave_room(self.id) {
                    self.server.metrics().inc_leaves();
                    self.after_departure(&departure);
                    self.reply(&ServerMessage::Left {
                        message: format!("Left room {}", departure.room_code),
                    });
                }
                Ok(())
            }

            ClientMessage::Offer { .. }
            | ClientMessage::Answer { .. }
            | ClientMessage::IceCandidate { .. }
            | ClientMessage::Cmd { .. }
            | ClientMessage::CountdownStart { .. } => {
                let route = self.route()?;
                self.relay(&route, Arc::new(raw.to_string()))
            }

            ClientMessage::Command { command, data } => {
                let route = self.route()?;
                let rewrapped = ServerMessage::Cmd {
                    cmd: command,
                    payload: data,
                };
                if !route.peer.send(&rewrapped) {
                    return Err(SignalError::PeerUnavailable);
                }
                self.server.metrics().inc_messages_relayed();
                Ok(())
            }

            ClientMessage::StartStream { .. } => {
                let route = self.stream_controller("start-stream")?;
                self.relay(&route, Arc::new(raw.to_string()))?;

                let transcoder = Arc::clone(self.server.transcoder());
                let room_code = route.room_code;
                info!("Stream start requested for room {} by {}", room_code, self.id);
                tokio::spawn(async move {
                    // Outcome reaches the room through the supervisor's events
                    if let Err(e) = transcoder.start(&room_code).await {
                        debug!("Stream start for room {} ended with: {}", room_code, e);
                    }
                });
                Ok(())
            }

            ClientMessage::StopStream { .. } => {
                let room_code = match self.server.room_manager().peer_of(self.id) {
                    PeerLookup::Present(route) => {
                        self.check_controller(route.role, "stop-stream")?;
                        self.relay(&route, Arc::new(raw.to_string()))?;
                        route.room_code
                    }
                    PeerLookup::Absent { room_code, role } => {
                        self.check_controller(role, "stop-stream")?;
                        room_code
                    }
                    PeerLookup::Unbound | PeerLookup::Stale { .. } => {
                        return Err(SignalError::ProtocolViolation("Not in a room".into()));
                    }
                };
                self.stop_stream(&room_code);
                Ok(())
            }
        }
    }

    /// The connection moved to a new slot; settle the one it gave up.
    fn after_switch(&self, released: Option<&Departure>) {
        if let Some(departure) = released {
            debug!("Connection {} released room {}", self.id, departure.room_code);
            self.after_departure(departure);
        }
    }

    fn after_departure(&self, departure: &Departure) {
        if departure.room_closed {
            self.server.release_stream(&departure.room_code);
        }
    }

    fn route(&self) -> Result<PeerRoute, SignalError> {
        match self.server.room_manager().peer_of(self.id) {
            PeerLookup::Present(route) => Ok(route),
            PeerLookup::Absent { .. } => Err(SignalError::PeerUnavailable),
            PeerLookup::Unbound => Err(SignalError::ProtocolViolation("Not in a room".into())),
            PeerLookup::Stale { room_code } => Err(SignalError::ProtocolViolation(format!(
                "No longer a member of room {room_code}"
            ))),
        }
    }

    fn check_controller(&self, role: Role, kind: &'static str) -> Result<(), SignalError> {
        if role.can_control_stream() {
            Ok(())
        } else {
            Err(SignalError::RoleNotAllowed(role, kind))
        }
    }

    fn stream_controller(&self, kind: &'static str) -> Result<PeerRoute, SignalError> {
        match self.server.room_manager().peer_of(self.id) {
            PeerLookup::Present(route) => {
                self.check_controller(route.role, kind)?;
                Ok(route)
            }
            PeerLookup::Absent { role, .. } => {
                self.check_controller(role, kind)?;
                Err(SignalError::PeerUnavailable)
            }
            PeerLookup::Unbound | PeerLookup::Stale { .. } => {
                Err(SignalError::ProtocolViolation("Not in a room".into()))
            }
        }
    }

    /// Forward the sender's frame text unchanged.
    fn relay(&self, route: &PeerRoute, raw: Arc<String>) -> Result<(), SignalError> {
        if !route.peer.send_raw(raw) {
            return Err(SignalError::PeerUnavailable);
        }
        self.server.metrics().inc_messages_relayed();
        debug!("Relayed {} -> {} in room {}", self.id, route.peer.id, route.room_code);
        Ok(())
    }

    fn stop_stream(&self, room_code: &str) {
        let rooms = self.server.room_manager();
        let was_running = self.server.transcoder().stop(room_code);
        let had_stream = rooms.clear_stream(room_code);
        if was_running || had_stream {
            rooms.broadcast(
                room_code,
                &ServerMessage::StreamStopped {
                    room_code: room_code.to_string(),
                },
            );
        }
        info!("Stream stop requested for room {} (running: {})", room_code, was_running);
    }

    /// Binary frames are media from the presenter, fed to the room's transcoder.
    async fn handle_media(&mut self, chunk: Bytes) {
        let binding = self.server.registry().binding(self.id);
        let room_code = match binding {
            Some(b) if b.role.can_send_media() => b.room_code,
            Some(b) => {
                self.reject_media(SignalError::RoleNotAllowed(b.role, "media"));
                return;
            }
            None => {
                self.reject_media(SignalError::ProtocolViolation(
                    "Media sent before joining a room".into(),
                ));
                return;
            }
        };

        let transcoder = self.server.transcoder();
        match transcoder.write_chunk(&room_code, chunk) {
            Ok(ChunkStatus::Accepted) => {
                self.media_rejected = false;
            }
            Ok(ChunkStatus::Busy) => {
                self.server.metrics().inc_chunks_busy();
                let limit = transcoder.config().drain_timeout;
                if tokio::time::timeout(limit, transcoder.wait_drained(&room_code))
                    .await
                    .is_err()
                {
                    warn!("Transcoder input for room {} did not drain within {:?}", room_code, limit);
                }
            }
            Err(e) => self.reject_media(e.into()),
        }
    }

    /// Report a media rejection once per run of rejected chunks.
    fn reject_media(&mut self, error: SignalError) {
        if self.media_rejected {
            return;
        }
        self.media_rejected = true;
        warn!("Media from {} rejected: {}", self.id, error);
        self.report(&error);
    }
}
