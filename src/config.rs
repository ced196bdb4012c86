#![forbid(unsafe_code)]

// Server configuration - read once from the environment at startup

use crate::room::RoomConfig;
use crate::transcode::config::PLAYLIST_PLACEHOLDER;
use crate::transcode::TranscodeConfig;
use anyhow::{bail, Result};
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;
use tracing::{info, warn};

const DEFAULT_MAX_CONNECTIONS: usize = 10_000;

/// Top-level server settings
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub port: u16,
    pub max_connections: usize,
    /// Largest accepted WebSocket frame, media chunks included
    pub max_message_size: usize,
    pub heartbeat_interval: Duration,
    /// Bearer token guarding /metrics; unset leaves it open
    pub metrics_token: Option<String>,
    pub room: RoomConfig,
    pub transcode: TranscodeConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: 3000,
            max_connections: DEFAULT_MAX_CONNECTIONS,
            max_message_size: 1024 * 1024,
            heartbeat_interval: Duration::from_secs(30),
            metrics_token: None,
            room: RoomConfig::default(),
            transcode: TranscodeConfig::default(),
        }
    }
}

/// Parse `key`, falling back to `default` when unset or unparsable.
fn env_or<T: FromStr>(key: &str, default: T) -> T {
    match std::env::var(key) {
        Ok(raw) => raw.trim().parse().unwrap_or_else(|_| {
            warn!("Ignoring invalid {}={:?}", key, raw);
            default
        }),
        Err(_) => default,
    }
}

fn env_secs(key: &str, default: Duration) -> Duration {
    Duration::from_secs(env_or(key, default.as_secs()))
}

/// Like `env_secs` for intervals, which must be non-zero.
fn env_interval(key: &str, default: Duration) -> Duration {
    env_secs(key, default).max(Duration::from_secs(1))
}

fn env_string(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.trim().is_empty())
}

impl ServerConfig {
    /// Build the configuration from environment variables.
    ///
    /// # Errors
    /// Returns an error when `TRANSCODER_ARGS` has no playlist placeholder.
    pub fn from_env() -> Result<Self> {
        let defaults = Self::default();

        let mut max_connections = env_or("MAX_CONNECTIONS", defaults.max_connections);
        if max_connections == 0 {
            warn!("MAX_CONNECTIONS=0 would reject all connections, using default {}", DEFAULT_MAX_CONNECTIONS);
            max_connections = DEFAULT_MAX_CONNECTIONS;
        }

        let room_defaults = defaults.room.clone();
        let room = RoomConfig {
            session_extension: env_secs("SESSION_EXTENSION_SECS", room_defaults.session_extension),
            sweep_interval: env_interval("ROOM_SWEEP_SECS", room_defaults.sweep_interval),
            snapshot_path: env_string("SNAPSHOT_PATH").map(PathBuf::from),
        };

        let td = defaults.transcode.clone();
        let args = match env_string("TRANSCODER_ARGS") {
            Some(raw) => raw.split_whitespace().map(str::to_string).collect(),
            None => td.args.clone(),
        };
        if !args.iter().any(|a| a.contains(PLAYLIST_PLACEHOLDER)) {
            bail!("TRANSCODER_ARGS must contain the {} placeholder", PLAYLIST_PLACEHOLDER);
        }
        let transcode = TranscodeConfig {
            program: env_string("TRANSCODER_BIN").unwrap_or_else(|| td.program.clone()),
            args,
            hls_root: env_string("HLS_ROOT").map(PathBuf::from).unwrap_or_else(|| td.hls_root.clone()),
            public_base_url: env_string("PUBLIC_BASE_URL")
                .map(|u| u.trim_end_matches('/').to_string())
                .unwrap_or_default(),
            stdin_timeout: env_secs("STDIN_TIMEOUT_SECS", td.stdin_timeout),
            playlist_timeout: env_secs("PLAYLIST_TIMEOUT_SECS", td.playlist_timeout),
            auto_stop_delay: env_secs("AUTO_STOP_SECS", td.auto_stop_delay),
            viewer_idle_timeout: env_secs("VIEWER_IDLE_SECS", td.viewer_idle_timeout),
            ..td
        };

        let config = Self {
            port: env_or("PORT", defaults.port),
            max_connections,
            heartbeat_interval: env_interval("HEARTBEAT_SECS", defaults.heartbeat_interval),
            metrics_token: env_string("METRICS_TOKEN"),
            room,
            transcode,
            ..defaults
        };
        config.log_summary();
        Ok(config)
    }

    fn log_summary(&self) {
        info!("Max connections: {}", self.max_connections);
        info!(
            "Transcoder: {} (HLS output under {})",
            self.transcode.program,
            self.transcode.hls_root.display()
        );
        match &self.room.snapshot_path {
            Some(path) => info!("Room snapshots written to {}", path.display()),
            None => info!("SNAPSHOT_PATH not set, room snapshots disabled"),
        }
        if self.metrics_token.is_none() {
            info!("METRICS_TOKEN not set, /metrics is unauthenticated");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_env_or_falls_back_on_garbage() {
        std::env::set_var("CASTRELAY_TEST_GARBAGE_PORT", "not-a-port");
        assert_eq!(env_or::<u16>("CASTRELAY_TEST_GARBAGE_PORT", 3000), 3000);
        std::env::set_var("CASTRELAY_TEST_GOOD_PORT", " 8080 ");
        assert_eq!(env_or::<u16>("CASTRELAY_TEST_GOOD_PORT", 3000), 8080);
        assert_eq!(env_or::<u16>("CASTRELAY_TEST_UNSET_PORT", 3000), 3000);
    }

    #[test]
    fn test_defaults() {
        let config = ServerConfig::default();
        assert_eq!(config.port, 3000);
        assert_eq!(config.max_message_size, 1024 * 1024);
        assert_eq!(config.room.session_extension, Duration::from_secs(300));
        assert_eq!(config.transcode.program, "ffmpeg");
        assert!(config
            .transcode
            .args
            .iter()
            .any(|a| a.contains(PLAYLIST_PLACEHOLDER)));
    }
}
