#![forbid(unsafe_code)]

// Signaling protocol - Message types for WebSocket communication

use crate::room::error::RoomError;
use crate::room::roles::Role;
use crate::transcode::TranscodeError;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

/// Every `type` tag a client may send.
const CLIENT_MESSAGE_TYPES: &[&str] = &[
    "create-room",
    "join-room",
    "join",
    "leave",
    "offer",
    "answer",
    "ice-candidate",
    "command",
    "cmd",
    "countdown-start",
    "start-stream",
    "stop-stream",
];

/// Client-to-Server messages
///
/// Relayed variants keep the remaining fields as an opaque map; the relay
/// forwards the original frame text, so these are only inspected in tests
/// and logs.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type")]
pub enum ClientMessage {
    /// Presenter registers a new room
    #[serde(rename = "create-room", rename_all = "camelCase")]
    CreateRoom {
        room_code: String,
        created_at: i64,
        expires_at: i64,
    },
    /// Viewer joins an existing room by code
    #[serde(rename = "join-room", rename_all = "camelCase")]
    JoinRoom { room_code: String },
    /// Older clients: claim a role slot directly, creating the room if needed
    #[serde(rename = "join", rename_all = "camelCase")]
    Join { session_id: String, role: String },
    /// Leave and close the current room
    #[serde(rename = "leave")]
    Leave,
    #[serde(rename = "offer")]
    Offer {
        #[serde(flatten)]
        payload: Map<String, Value>,
    },
    #[serde(rename = "answer")]
    Answer {
        #[serde(flatten)]
        payload: Map<String, Value>,
    },
    #[serde(rename = "ice-candidate")]
    IceCandidate {
        #[serde(flatten)]
        payload: Map<String, Value>,
    },
    /// Control command, re-wrapped as `cmd` for the peer
    #[serde(rename = "command")]
    Command {
        command: String,
        #[serde(default)]
        data: Value,
    },
    /// Control command already in peer shape, relayed verbatim
    #[serde(rename = "cmd")]
    Cmd {
        cmd: String,
        #[serde(default)]
        payload: Value,
    },
    #[serde(rename = "countdown-start")]
    CountdownStart {
        #[serde(flatten)]
        payload: Map<String, Value>,
    },
    /// Viewer asks the server to begin HLS output
    #[serde(rename = "start-stream")]
    StartStream {
        #[serde(flatten)]
        payload: Map<String, Value>,
    },
    /// Viewer asks the server to end HLS output
    #[serde(rename = "stop-stream")]
    StopStream {
        #[serde(flatten)]
        payload: Map<String, Value>,
    },
}

impl ClientMessage {
    pub fn kind(&self) -> &'static str {
        match self {
            ClientMessage::CreateRoom { .. } => "create-room",
            ClientMessage::JoinRoom { .. } => "join-room",
            ClientMessage::Join { .. } => "join",
            ClientMessage::Leave => "leave",
            ClientMessage::Offer { .. } => "offer",
            ClientMessage::Answer { .. } => "answer",
            ClientMessage::IceCandidate { .. } => "ice-candidate",
            ClientMessage::Command { .. } => "command",
            ClientMessage::Cmd { .. } => "cmd",
            ClientMessage::CountdownStart { .. } => "countdown-start",
            ClientMessage::StartStream { .. } => "start-stream",
            ClientMessage::StopStream { .. } => "stop-stream",
        }
    }
}

/// Server-to-Client messages
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ServerMessage {
    #[serde(rename = "room-created", rename_all = "camelCase")]
    RoomCreated { room_code: String },
    #[serde(rename = "room-joined", rename_all = "camelCase")]
    RoomJoined { room_code: String, peer_ready: bool },
    #[serde(rename = "room-not-found", rename_all = "camelCase")]
    RoomNotFound { room_code: String, message: String },
    #[serde(rename = "room-expired", rename_all = "camelCase")]
    RoomExpired { room_code: String, message: String },
    #[serde(rename = "room-already-used", rename_all = "camelCase")]
    RoomAlreadyUsed { room_code: String, message: String },
    #[serde(rename = "room-not-ready", rename_all = "camelCase")]
    RoomNotReady { room_code: String, message: String },
    /// Reply to the legacy `join`
    #[serde(rename = "joined", rename_all = "camelCase")]
    Joined {
        session_id: String,
        role: Role,
        peer_ready: bool,
    },
    #[serde(rename = "left")]
    Left { message: String },
    /// The other side closed the room
    #[serde(rename = "room_closed")]
    RoomClosed { message: String },
    #[serde(rename = "peer-joined")]
    PeerJoined { role: Role },
    #[serde(rename = "peer-left")]
    PeerLeft { role: Role },
    /// Relayed control command
    #[serde(rename = "cmd")]
    Cmd { cmd: String, payload: Value },
    #[serde(rename = "stream_ready", rename_all = "camelCase")]
    StreamReady {
        room_code: String,
        hls_url: String,
        watch_page_url: String,
    },
    #[serde(rename = "stream_stopped", rename_all = "camelCase")]
    StreamStopped { room_code: String },
    #[serde(rename = "stream_error", rename_all = "camelCase")]
    StreamError { room_code: String, message: String },
    #[serde(rename = "error")]
    Error { code: String, message: String },
}

/// Failures while handling one client frame.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SignalError {
    #[error("Malformed message: {0}")]
    MalformedMessage(String),

    #[error("Unknown message type: {0}")]
    UnknownType(String),

    #[error("{0}")]
    ProtocolViolation(String),

    #[error("Peer is not connected")]
    PeerUnavailable,

    #[error("Role {0} may not send {1}")]
    RoleNotAllowed(Role, &'static str),

    #[error(transparent)]
    Room(#[from] RoomError),

    #[error(transparent)]
    Transcode(#[from] TranscodeError),
}

impl SignalError {
    pub fn code(&self) -> &'static str {
        match self {
            SignalError::MalformedMessage(_) => "MALFORMED_MESSAGE",
            SignalError::UnknownType(_) => "UNKNOWN_TYPE",
            SignalError::ProtocolViolation(_) => "PROTOCOL_VIOLATION",
            SignalError::PeerUnavailable => "PEER_UNAVAILABLE",
            SignalError::RoleNotAllowed(..) => "ROLE_NOT_ALLOWED",
            SignalError::Room(e) => e.code(),
            SignalError::Transcode(e) => e.code(),
        }
    }

    /// The reply sent back to the offending channel.
    ///
    /// Join failures use their dedicated message types; everything else is a
    /// generic `error` frame.
    pub fn to_message(&self) -> ServerMessage {
        let message = self.to_string();
        match self {
            SignalError::Room(RoomError::NotFound(code)) => ServerMessage::RoomNotFound {
                room_code: code.clone(),
                message,
            },
            SignalError::Room(RoomError::Expired(code)) => ServerMessage::RoomExpired {
                room_code: code.clone(),
                message,
            },
            SignalError::Room(RoomError::AlreadyUsed(code)) => ServerMessage::RoomAlreadyUsed {
                room_code: code.clone(),
                message,
            },
            SignalError::Room(RoomError::NotReady(code)) => ServerMessage::RoomNotReady {
                room_code: code.clone(),
                message,
            },
            _ => ServerMessage::Error {
                code: self.code().to_string(),
                message,
            },
        }
    }
}

/// Parse one inbound text frame.
///
/// Distinguishes invalid JSON and missing fields (`MalformedMessage`) from a
/// well-formed frame whose `type` is not part of the protocol (`UnknownType`).
pub fn parse_client_message(text: &str) -> Result<ClientMessage, SignalError> {
    let value: Value =
        serde_json::from_str(text).map_err(|e| SignalError::MalformedMessage(e.to_string()))?;
    let kind = value
        .get("type")
        .and_then(Value::as_str)
        .ok_or_else(|| SignalError::MalformedMessage("missing string field \"type\"".into()))?;
    if !CLIENT_MESSAGE_TYPES.contains(&kind) {
        return Err(SignalError::UnknownType(kind.to_string()));
    }
    serde_json::from_value(value).map_err(|e| SignalError::MalformedMessage(e.to_string()))
}
