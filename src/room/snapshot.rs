#![forbid(unsafe_code)]

// Room snapshot - point-in-time JSON dump of the room table for diagnostics

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// One room as recorded in a snapshot. Connection handles are never written.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoomSnapshotEntry {
    pub room_code: String,
    pub created_at: i64,
    pub expires_at: i64,
    pub used: bool,
    pub presenter_connected: bool,
    pub viewer_connected: bool,
    pub streaming: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoomSnapshot {
    pub saved_at: i64,
    pub rooms: Vec<RoomSnapshotEntry>,
}

/// Write the snapshot next to `path` and rename it into place, so readers
/// never see a partial file.
pub async fn write_snapshot(path: &Path, snapshot: &RoomSnapshot) -> Result<()> {
    let json = serde_json::to_vec_pretty(snapshot).context("serializing room snapshot")?;
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        tokio::fs::create_dir_all(parent)
            .await
            .with_context(|| format!("creating {}", parent.display()))?;
    }
    let tmp = path.with_extension("tmp");
    tokio::fs::write(&tmp, &json)
        .await
        .with_context(|| format!("writing {}", tmp.display()))?;
    tokio::fs::rename(&tmp, path)
        .await
        .with_context(|| format!("renaming {} to {}", tmp.display(), path.display()))?;
    Ok(())
}

/// Read a snapshot back, e.g. for inspection after a crash.
pub async fn read_snapshot(path: &Path) -> Result<RoomSnapshot> {
    let bytes = tokio::fs::read(path)
        .await
        .with_context(|| format!("reading {}", path.display()))?;
    serde_json::from_slice(&bytes).with_context(|| format!("parsing {}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_snapshot_written_atomically() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state").join("rooms.json");
        let snapshot = RoomSnapshot {
            saved_at: 1_700_000_000_000,
            rooms: vec![RoomSnapshotEntry {
                room_code: "ABC123".into(),
                created_at: 1_700_000_000_000,
                expires_at: 1_700_000_020_000,
                used: true,
                presenter_connected: true,
                viewer_connected: false,
                streaming: false,
            }],
        };

        write_snapshot(&path, &snapshot).await.unwrap();
        assert!(!path.with_extension("tmp").exists());

        let raw: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(raw["rooms"][0]["roomCode"], "ABC123");
        assert_eq!(raw["rooms"][0]["presenterConnected"], true);

        assert_eq!(read_snapshot(&path).await.unwrap(), snapshot);
    }
}
