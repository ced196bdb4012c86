#![forbid(unsafe_code)]

// castrelay library - presenter/viewer signaling relay with HLS transcode supervision

pub mod config;
pub mod metrics;
pub mod registry;
pub mod room;
pub mod signaling;
pub mod transcode;
