#![forbid(unsafe_code)]

use thiserror::Error;

/// Failures of room table operations.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RoomError {
    #[error("Invalid room code: {0:?}")]
    InvalidCode(String),

    #[error("Invalid room lifetime: expiresAt must be after createdAt")]
    InvalidLifetime,

    #[error("Room already exists: {0}")]
    AlreadyExists(String),

    #[error("Room creation already in progress: {0}")]
    CreationInProgress(String),

    #[error("Room not found: {0}")]
    NotFound(String),

    #[error("Room has expired: {0}")]
    Expired(String),

    #[error("Room has already been used: {0}")]
    AlreadyUsed(String),

    #[error("Presenter is not connected to room: {0}")]
    NotReady(String),
}

impl RoomError {
    /// Machine-readable code sent alongside the human message.
    pub fn code(&self) -> &'static str {
        match self {
            RoomError::InvalidCode(_) | RoomError::InvalidLifetime => "MALFORMED_MESSAGE",
            RoomError::AlreadyExists(_) => "ROOM_ALREADY_EXISTS",
            RoomError::CreationInProgress(_) => "CREATION_IN_PROGRESS",
            RoomError::NotFound(_) => "ROOM_NOT_FOUND",
            RoomError::Expired(_) => "ROOM_EXPIRED",
            RoomError::AlreadyUsed(_) => "ROOM_ALREADY_USED",
            RoomError::NotReady(_) => "ROOM_NOT_READY",
        }
    }
}
