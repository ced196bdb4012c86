#![forbid(unsafe_code)]

use serde::{Deserialize, Serialize};
use std::fmt;

/// Slot a channel occupies inside a room.
///
/// The presenter is the mobile endpoint that creates the room and pushes media;
/// the viewer is the web endpoint that joins it and controls server-side streaming.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Presenter,
    Viewer,
}

impl Role {
    pub fn name(&self) -> &'static str {
        match self {
            Role::Presenter => "presenter",
            Role::Viewer => "viewer",
        }
    }

    /// The role occupying the other slot of the same room.
    pub fn peer(&self) -> Role {
        match self {
            Role::Presenter => Role::Viewer,
            Role::Viewer => Role::Presenter,
        }
    }

    /// Only the web-facing slot may start or stop the HLS pipeline.
    pub fn can_control_stream(&self) -> bool {
        matches!(self, Role::Viewer)
    }

    /// Only the presenter pushes raw media chunks.
    pub fn can_send_media(&self) -> bool {
        matches!(self, Role::Presenter)
    }

    /// Parses role names used by older clients on the `join` path.
    pub fn from_legacy(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "presenter" | "mobile" => Some(Role::Presenter),
            "viewer" | "web" => Some(Role::Viewer),
            _ => None,
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_peer_is_symmetric() {
        assert_eq!(Role::Presenter.peer(), Role::Viewer);
        assert_eq!(Role::Viewer.peer(), Role::Presenter);
        assert_eq!(Role::Viewer.peer().peer(), Role::Viewer);
    }

    #[test]
    fn test_stream_control_belongs_to_viewer() {
        assert!(Role::Viewer.can_control_stream());
        assert!(!Role::Presenter.can_control_stream());
        assert!(Role::Presenter.can_send_media());
        assert!(!Role::Viewer.can_send_media());
    }

    #[test]
    fn test_from_legacy() {
        assert_eq!(Role::from_legacy("mobile"), Some(Role::Presenter));
        assert_eq!(Role::from_legacy("Presenter"), Some(Role::Presenter));
        assert_eq!(Role::from_legacy(" web "), Some(Role::Viewer));
        assert_eq!(Role::from_legacy("viewer"), Some(Role::Viewer));
        assert_eq!(Role::from_legacy("admin"), None);
    }

    #[test]
    fn test_serde_names() {
        assert_eq!(serde_json::to_string(&Role::Presenter).unwrap(), "\"presenter\"");
        let role: Role = serde_json::from_str("\"viewer\"").unwrap();
        assert_eq!(role, Role::Viewer);
    }
}
