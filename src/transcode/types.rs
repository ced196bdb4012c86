#![forbid(unsafe_code)]

use std::time::Duration;
use thiserror::Error;

pub type TranscodeResult<T> = Result<T, TranscodeError>;

/// Lifecycle of one room's transcoding session.
///
/// `Idle` sessions only hold queued chunks; `Draining` means termination was
/// requested and the process has not exited yet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Starting,
    Streaming,
    Draining,
    Stopped,
}

impl SessionState {
    pub fn is_active(&self) -> bool {
        matches!(self, SessionState::Starting | SessionState::Streaming)
    }
}

/// Result of handing a media chunk to a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChunkStatus {
    Accepted,
    /// Accepted, but the transcoder input is over its high-water mark;
    /// the sender should wait for a drain before writing more.
    Busy,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TranscodeError {
    #[error("Failed to spawn transcoder: {0}")]
    SpawnError(String),

    #[error("Transcoder input was not writable within {0:?}")]
    StdinTimeout(Duration),

    #[error("Transcoder produced no playlist within {0:?}")]
    PlaylistTimeout(Duration),

    #[error("Transcoder exited unexpectedly: {0}")]
    SubprocessCrash(String),

    #[error("Output directory error: {0}")]
    OutputDir(String),

    #[error("No active stream for room {0}")]
    NotStreaming(String),

    #[error("Stream for room {0} was stopped while starting")]
    Cancelled(String),
}

impl TranscodeError {
    pub fn code(&self) -> &'static str {
        match self {
            TranscodeError::SpawnError(_) => "SPAWN_ERROR",
            TranscodeError::StdinTimeout(_) => "STDIN_TIMEOUT",
            TranscodeError::PlaylistTimeout(_) => "PLAYLIST_TIMEOUT",
            TranscodeError::SubprocessCrash(_) => "SUBPROCESS_CRASH",
            TranscodeError::OutputDir(_) => "OUTPUT_DIR_ERROR",
            TranscodeError::NotStreaming(_) => "NOT_STREAMING",
            TranscodeError::Cancelled(_) => "CANCELLED",
        }
    }
}

/// Asynchronous outcomes reported by the supervisor to the signaling layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamEvent {
    /// Playlist exists and is being served
    Ready { room_code: String, playlist_url: String },
    /// A start attempt failed
    Failed { room_code: String, error: TranscodeError },
    /// A running transcoder exited without being asked to
    Crashed { room_code: String, detail: String },
    /// Stopped after the viewer count stayed at zero
    AutoStopped { room_code: String },
}

impl StreamEvent {
    pub fn room_code(&self) -> &str {
        match self {
            StreamEvent::Ready { room_code, .. }
            | StreamEvent::Failed { room_code, .. }
            | StreamEvent::Crashed { room_code, .. }
            | StreamEvent::AutoStopped { room_code } => room_code,
        }
    }
}
