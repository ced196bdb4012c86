#![forbid(unsafe_code)]

// Configuration for the HLS transcoder subprocess and viewer tracking

use std::path::{Path, PathBuf};
use std::time::Duration;

/// Placeholder replaced with the room's output directory in transcoder args.
pub const OUTPUT_DIR_PLACEHOLDER: &str = "{output_dir}";
/// Placeholder replaced with the playlist path in transcoder args.
pub const PLAYLIST_PLACEHOLDER: &str = "{playlist}";

/// Transcoder and HLS output configuration
#[derive(Debug, Clone)]
pub struct TranscodeConfig {
    /// Executable to run, resolved through PATH
    pub program: String,
    pub args: Vec<String>,
    /// Parent of every per-room output directory
    pub hls_root: PathBuf,
    pub playlist_name: String,
    /// Prefix for advertised URLs; empty means host-relative
    pub public_base_url: String,
    pub stdin_timeout: Duration,
    pub playlist_timeout: Duration,
    pub playlist_poll_interval: Duration,
    /// How long a process gets to exit after end-of-input before it is killed
    pub stop_grace: Duration,
    pub cleanup_delay: Duration,
    pub error_cleanup_delay: Duration,
    /// Cap on chunks queued before the process is writable; oldest are dropped
    pub max_pending_bytes: usize,
    /// Buffered input above which writers are told to back off
    pub high_water_bytes: usize,
    /// Longest a presenter connection pauses reading while waiting for a drain
    pub drain_timeout: Duration,
    pub auto_stop_delay: Duration,
    pub viewer_idle_timeout: Duration,
    pub idle_sweep_interval: Duration,
}

impl Default for TranscodeConfig {
    fn default() -> Self {
        Self {
            program: "ffmpeg".to_string(),
            args: Self::default_args(),
            hls_root: PathBuf::from("./hls"),
            playlist_name: "index.m3u8".to_string(),
            public_base_url: String::new(),
            stdin_timeout: Duration::from_secs(5),
            playlist_timeout: Duration::from_secs(20),
            playlist_poll_interval: Duration::from_millis(250),
            stop_grace: Duration::from_secs(5),
            cleanup_delay: Duration::from_secs(30),
            error_cleanup_delay: Duration::from_secs(2),
            max_pending_bytes: 8 * 1024 * 1024,
            high_water_bytes: 1024 * 1024,
            drain_timeout: Duration::from_secs(10),
            auto_stop_delay: Duration::from_secs(30),
            viewer_idle_timeout: Duration::from_secs(60),
            idle_sweep_interval: Duration::from_secs(15),
        }
    }
}

impl TranscodeConfig {
    /// ffmpeg arguments reading WebM/MP4 from stdin and writing a live HLS playlist
    pub fn default_args() -> Vec<String> {
        [
            "-hide_banner",
            "-loglevel",
            "error",
            "-fflags",
            "+genpts",
            "-i",
            "pipe:0",
            "-c:v",
            "libx264",
            "-preset",
            "veryfast",
            "-tune",
            "zerolatency",
            "-g",
            "60",
            "-c:a",
            "aac",
            "-b:a",
            "128k",
            "-f",
            "hls",
            "-hls_time",
            "2",
            "-hls_list_size",
            "6",
            "-hls_flags",
            "delete_segments+omit_endlist",
            "-hls_segment_filename",
            "{output_dir}/segment_%05d.ts",
            "{playlist}",
        ]
        .iter()
        .map(|s| s.to_string())
        .collect()
    }

    pub fn output_dir(&self, room_code: &str) -> PathBuf {
        self.hls_root.join(room_code)
    }

    pub fn playlist_path(&self, room_code: &str) -> PathBuf {
        self.output_dir(room_code).join(&self.playlist_name)
    }

    /// URL under which the playlist is served by the HTTP layer.
    pub fn playlist_url(&self, room_code: &str) -> String {
        format!(
            "{}/hls/{}/{}",
            self.public_base_url.trim_end_matches('/'),
            room_code,
            self.playlist_name
        )
    }

    pub fn watch_url(&self, room_code: &str) -> String {
        format!("{}/watch/{}", self.public_base_url.trim_end_matches('/'), room_code)
    }

    /// Arguments with placeholders substituted for one session.
    pub fn command_args(&self, output_dir: &Path, playlist: &Path) -> Vec<String> {
        let output_dir = output_dir.to_string_lossy();
        let playlist = playlist.to_string_lossy();
        self.args
            .iter()
            .map(|arg| {
                arg.replace(OUTPUT_DIR_PLACEHOLDER, &output_dir)
                    .replace(PLAYLIST_PLACEHOLDER, &playlist)
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_urls() {
        let mut config = TranscodeConfig::default();
        assert_eq!(config.playlist_url("ABC123"), "/hls/ABC123/index.m3u8");
        assert_eq!(config.watch_url("ABC123"), "/watch/ABC123");

        config.public_base_url = "https://cast.example.com/".into();
        assert_eq!(
            config.playlist_url("ABC123"),
            "https://cast.example.com/hls/ABC123/index.m3u8"
        );
    }

    #[test]
    fn test_command_args_substitution() {
        let config = TranscodeConfig {
            hls_root: PathBuf::from("/srv/hls"),
            ..Default::default()
        };
        let dir = config.output_dir("ABC123");
        let args = config.command_args(&dir, &config.playlist_path("ABC123"));
        assert_eq!(args.last().map(String::as_str), Some("/srv/hls/ABC123/index.m3u8"));
        assert!(args.iter().any(|a| a == "/srv/hls/ABC123/segment_%05d.ts"));
        assert!(!args.iter().any(|a| a.contains('{')));
    }
}
