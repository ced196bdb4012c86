#![forbid(unsafe_code)]

// Room module - two-slot room table, join rules, expiry and relay routing
pub mod api;
pub mod error;
pub mod roles;
pub mod snapshot;

use crate::registry::{ConnectionId, ConnectionRegistry, PeerHandle};
use crate::signaling::protocol::ServerMessage;
use error::RoomError;
use roles::Role;
use serde::Serialize;
use snapshot::{RoomSnapshot, RoomSnapshotEntry};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex as StdMutex, RwLock as StdRwLock};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};
use tokio::sync::Mutex as TokioMutex;
use tracing::{debug, info, warn};

/// Length of codes issued by presenters.
pub const ROOM_CODE_LEN: usize = 6;
/// Longest identifier accepted on the legacy `join` path.
const MAX_SESSION_ID_LEN: usize = 64;
/// A creation marker older than this is treated as abandoned.
const CREATION_MARKER_TTL: Duration = Duration::from_secs(5);
/// Close code sent to a connection displaced from its slot.
pub const REPLACED_CLOSE_CODE: u16 = 4001;

#[derive(Debug, Clone)]
pub struct RoomConfig {
    /// Lifetime granted on a successful join and on each sweep of an occupied room
    pub session_extension: Duration,
    pub sweep_interval: Duration,
    pub snapshot_path: Option<PathBuf>,
}

impl Default for RoomConfig {
    fn default() -> Self {
        Self {
            session_extension: Duration::from_secs(300),
            sweep_interval: Duration::from_secs(10),
            snapshot_path: None,
        }
    }
}

/// Milliseconds since the Unix epoch, the unit clients use for room timestamps.
pub fn now_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

/// Validate a presenter-issued room code: six ASCII letters or digits,
/// compared case-insensitively.
pub fn normalize_code(code: &str) -> Result<String, RoomError> {
    let trimmed = code.trim();
    if trimmed.len() != ROOM_CODE_LEN || !trimmed.chars().all(|c| c.is_ascii_alphanumeric()) {
        return Err(RoomError::InvalidCode(code.to_string()));
    }
    Ok(trimmed.to_ascii_uppercase())
}

/// Normalize any room key: issued codes as well as legacy session ids.
pub fn normalize_key(key: &str) -> Result<String, RoomError> {
    let trimmed = key.trim();
    let valid = !trimmed.is_empty()
        && trimmed.len() <= MAX_SESSION_ID_LEN
        && trimmed
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
    if !valid {
        return Err(RoomError::InvalidCode(key.to_string()));
    }
    Ok(trimmed.to_ascii_uppercase())
}

/// URLs advertised once a room's HLS output is live.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamInfo {
    pub hls_url: String,
    pub watch_page_url: String,
}

/// Public view of a room for the HTTP API.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RoomInfo {
    pub room_code: String,
    pub created_at: i64,
    pub expires_at: i64,
    pub expired: bool,
    pub used: bool,
    pub presenter_connected: bool,
    pub viewer_connected: bool,
    pub stream: Option<StreamInfo>,
}

/// Room state
pub struct Room {
    pub code: String,
    presenter: Option<PeerHandle>,
    viewer: Option<PeerHandle>,
    pub created_at: i64,
    pub expires_at: i64,
    /// Set by the first viewer join; a room admits one viewer ever
    pub used: bool,
    pub stream: Option<StreamInfo>,
}

impl Room {
    fn new(code: String, created_at: i64, expires_at: i64) -> Self {
        Self {
            code,
            presenter: None,
            viewer: None,
            created_at,
            expires_at,
            used: false,
            stream: None,
        }
    }

    fn slot(&self, role: Role) -> Option<&PeerHandle> {
        match role {
            Role::Presenter => self.presenter.as_ref(),
            Role::Viewer => self.viewer.as_ref(),
        }
    }

    fn slot_mut(&mut self, role: Role) -> &mut Option<PeerHandle> {
        match role {
            Role::Presenter => &mut self.presenter,
            Role::Viewer => &mut self.viewer,
        }
    }

    fn is_connected(&self, role: Role) -> bool {
        self.slot(role).map_or(false, PeerHandle::is_connected)
    }

    fn occupied_by(&self, role: Role, id: ConnectionId) -> bool {
        self.slot(role).map_or(false, |p| p.id == id)
    }

    /// No live connection in either slot.
    fn is_vacant(&self) -> bool {
        !self.is_connected(Role::Presenter) && !self.is_connected(Role::Viewer)
    }

    fn is_expired(&self, now: i64) -> bool {
        now > self.expires_at
    }

    fn send_to(&self, role: Role, message: &ServerMessage) -> bool {
        self.slot(role).map_or(false, |p| p.send(message))
    }

    fn broadcast(&self, message: &ServerMessage) -> usize {
        [Role::Presenter, Role::Viewer]
            .into_iter()
            .filter(|role| self.send_to(*role, message))
            .count()
    }

    fn occupants(&self) -> usize {
        [Role::Presenter, Role::Viewer]
            .into_iter()
            .filter(|role| self.is_connected(*role))
            .count()
    }

    fn info(&self, now: i64) -> RoomInfo {
        RoomInfo {
            room_code: self.code.clone(),
            created_at: self.created_at,
            expires_at: self.expires_at,
            expired: self.is_expired(now),
            used: self.used,
            presenter_connected: self.is_connected(Role::Presenter),
            viewer_connected: self.is_connected(Role::Viewer),
            stream: self.stream.clone(),
        }
    }

    fn snapshot_entry(&self) -> RoomSnapshotEntry {
        RoomSnapshotEntry {
            room_code: self.code.clone(),
            created_at: self.created_at,
            expires_at: self.expires_at,
            used: self.used,
            presenter_connected: self.is_connected(Role::Presenter),
            viewer_connected: self.is_connected(Role::Viewer),
            streaming: self.stream.is_some(),
        }
    }
}

/// Successful create or join.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JoinOutcome {
    pub room_code: String,
    pub peer_ready: bool,
    /// The slot the channel held before, vacated as part of this operation
    pub released: Option<Departure>,
}

/// A channel leaving its slot, by request or by disconnect.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Departure {
    pub room_code: String,
    pub role: Role,
    /// The room was deleted as a result
    pub room_closed: bool,
}

#[derive(Debug, Clone)]
pub struct PeerRoute {
    pub room_code: String,
    /// Role of the sender
    pub role: Role,
    pub peer: PeerHandle,
}

/// Where a channel's relayed messages would go.
#[derive(Debug, Clone)]
pub enum PeerLookup {
    /// The channel is not bound to any room
    Unbound,
    /// Bound to a room that no longer lists it
    Stale { room_code: String },
    /// In a room whose other slot is empty
    Absent { room_code: String, role: Role },
    Present(PeerRoute),
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct SweepReport {
    pub deleted: Vec<String>,
    pub extended: Vec<String>,
}

/// Marks a room code as being created until dropped.
struct CreationGuard<'a> {
    creating: &'a StdMutex<HashMap<String, Instant>>,
    code: String,
}

impl Drop for CreationGuard<'_> {
    fn drop(&mut self) {
        let mut creating = self.creating.lock().unwrap_or_else(|e| e.into_inner());
        creating.remove(&self.code);
    }
}

/// Room manager
pub struct RoomManager {
    rooms: StdRwLock<HashMap<String, Room>>,
    /// Codes with a creation in flight
    creating: StdMutex<HashMap<String, Instant>>,
    registry: Arc<ConnectionRegistry>,
    config: RoomConfig,
    /// One snapshot write at a time; they share the temp file
    snapshot_lock: TokioMutex<()>,
}

impl RoomManager {
    pub fn new(config: RoomConfig, registry: Arc<ConnectionRegistry>) -> Self {
        Self {
            rooms: StdRwLock::new(HashMap::new()),
            creating: StdMutex::new(HashMap::new()),
            registry,
            config,
            snapshot_lock: TokioMutex::new(()),
        }
    }

    pub fn config(&self) -> &RoomConfig {
        &self.config
    }

    fn extension_millis(&self) -> i64 {
        self.config.session_extension.as_millis() as i64
    }

    fn begin_creation(&self, code: &str) -> Result<CreationGuard<'_>, RoomError> {
        let mut creating = self.creating.lock().unwrap_or_else(|e| e.into_inner());
        let now = Instant::now();
        creating.retain(|_, started| now.duration_since(*started) < CREATION_MARKER_TTL);
        if creating.contains_key(code) {
            return Err(RoomError::CreationInProgress(code.to_string()));
        }
        creating.insert(code.to_string(), now);
        Ok(CreationGuard {
            creating: &self.creating,
            code: code.to_string(),
        })
    }

    /// Vacate the slot `id` is bound to, with the room table already locked.
    /// The other occupant is told the channel left; an emptied room is deleted.
    fn vacate(&self, rooms: &mut HashMap<String, Room>, id: ConnectionId) -> Option<Departure> {
        let binding = self.registry.unbind(id)?;
        let room = rooms.get_mut(&binding.room_code)?;
        if !room.occupied_by(binding.role, id) {
            return None;
        }
        *room.slot_mut(binding.role) = None;
        let room_closed = room.is_vacant();
        if room_closed {
            rooms.remove(&binding.room_code);
            info!("Room {} deleted, nobody left", binding.room_code);
        } else {
            room.send_to(binding.role.peer(), &ServerMessage::PeerLeft { role: binding.role });
            info!("{} {} left room {}", binding.role, id, binding.room_code);
        }
        Some(Departure {
            room_code: binding.room_code,
            role: binding.role,
            room_closed,
        })
    }

    /// Register a new room with `presenter` in the presenter slot.
    ///
    /// A code held by an expired room with nobody connected is reclaimed.
    /// The creation marker stays set until the snapshot is persisted, so a
    /// concurrent create of the same code fails with `CreationInProgress`.
    /// Any slot the presenter held elsewhere is released only on success.
    pub async fn create_room(
        &self,
        room_code: &str,
        created_at: i64,
        expires_at: i64,
        presenter: PeerHandle,
    ) -> Result<JoinOutcome, RoomError> {
        let code = normalize_code(room_code)?;
        if expires_at <= created_at {
            return Err(RoomError::InvalidLifetime);
        }
        let _creating = self.begin_creation(&code)?;

        let released = {
            let mut rooms = self.rooms.write().unwrap_or_else(|e| e.into_inner());
            if let Some(existing) = rooms.get(&code) {
                if !existing.is_expired(now_millis()) || !existing.is_vacant() {
                    return Err(RoomError::AlreadyExists(code));
                }
                info!("Reclaiming expired room {}", code);
            }
            let released = self.vacate(&mut rooms, presenter.id);
            let mut room = Room::new(code.clone(), created_at, expires_at);
            room.presenter = Some(presenter.clone());
            rooms.insert(code.clone(), room);
            self.registry.bind(presenter.id, &code, Role::Presenter);
            released
        };

        info!("Room {} created by connection {}", code, presenter.id);
        self.persist_snapshot().await;
        Ok(JoinOutcome {
            room_code: code,
            peer_ready: false,
            released,
        })
    }

    /// Join a room as its viewer.
    ///
    /// Checks run in order: unknown code, expired, already used, presenter
    /// not connected. On success the room is marked used, its expiry is
    /// extended and the presenter is told a viewer joined. A channel already
    /// in this room cannot take its viewer slot. Any slot the viewer held
    /// elsewhere is released only on success.
    pub fn join_room(&self, room_code: &str, viewer: PeerHandle) -> Result<JoinOutcome, RoomError> {
        let code = normalize_code(room_code)
            .map_err(|_| RoomError::NotFound(room_code.trim().to_string()))?;
        let now = now_millis();

        let mut rooms = self.rooms.write().unwrap_or_else(|e| e.into_inner());
        let room = rooms
            .get_mut(&code)
            .ok_or_else(|| RoomError::NotFound(code.clone()))?;
        if room.is_expired(now) {
            return Err(RoomError::Expired(code));
        }
        if room.used {
            return Err(RoomError::AlreadyUsed(code));
        }
        if !room.is_connected(Role::Presenter) {
            return Err(RoomError::NotReady(code));
        }
        if room.occupied_by(Role::Presenter, viewer.id) {
            return Err(RoomError::AlreadyUsed(code));
        }

        let released = self.vacate(&mut rooms, viewer.id);
        let Some(room) = rooms.get_mut(&code) else {
            return Err(RoomError::NotFound(code));
        };
        room.used = true;
        room.expires_at = room.expires_at.max(now + self.extension_millis());
        room.viewer = Some(viewer.clone());
        self.registry.bind(viewer.id, &code, Role::Viewer);
        room.send_to(Role::Presenter, &ServerMessage::PeerJoined { role: Role::Viewer });

        info!("Connection {} joined room {} as viewer", viewer.id, code);
        Ok(JoinOutcome {
            room_code: code,
            peer_ready: true,
            released,
        })
    }

    /// Legacy `join`: claim `role` in the room keyed by `session_id`,
    /// creating the room if needed.
    ///
    /// A different connection already holding the slot is displaced: it is
    /// unbound, sent a `REPLACED` error and asked to close.
    pub fn claim_slot(
        &self,
        session_id: &str,
        role: Role,
        peer: PeerHandle,
    ) -> Result<JoinOutcome, RoomError> {
        let code = normalize_key(session_id)?;
        let now = now_millis();
        let extension = self.extension_millis();

        let mut rooms = self.rooms.write().unwrap_or_else(|e| e.into_inner());
        let current = self.registry.binding(peer.id);
        let released = match current {
            Some(b) if b.room_code == code && b.role == role => None,
            _ => self.vacate(&mut rooms, peer.id),
        };
        let room = rooms.entry(code.clone()).or_insert_with(|| {
            info!("Room {} created through legacy join", code);
            Room::new(code.clone(), now, now + extension)
        });

        if let Some(previous) = room.slot_mut(role).replace(peer.clone()) {
            if previous.id != peer.id {
                info!(
                    "Connection {} replaced {} as {} in room {}",
                    peer.id, previous.id, role, code
                );
                self.registry.unbind(previous.id);
                previous.send(&ServerMessage::Error {
                    code: "REPLACED".into(),
                    message: format!("Another {role} connected to room {code}"),
                });
                previous.close(REPLACED_CLOSE_CODE, "replaced");
            }
        }
        if role == Role::Viewer {
            room.used = true;
        }
        room.expires_at = room.expires_at.max(now + extension);
        self.registry.bind(peer.id, &code, role);

        let peer_ready = room.is_connected(role.peer());
        room.send_to(role.peer(), &ServerMessage::PeerJoined { role });
        Ok(JoinOutcome {
            room_code: code,
            peer_ready,
            released,
        })
    }

    /// Explicit leave: the room is deleted and the other occupant is told it closed.
    /// Returns `None` if the channel was not in a room.
    pub fn leave_room(&self, id: ConnectionId) -> Option<Departure> {
        let binding = self.registry.unbind(id)?;
        let room = {
            let mut rooms = self.rooms.write().unwrap_or_else(|e| e.into_inner());
            let occupied = rooms
                .get(&binding.room_code)
                .map_or(false, |r| r.occupied_by(binding.role, id));
            if !occupied {
                debug!("Connection {} left room {} it no longer occupied", id, binding.room_code);
                return None;
            }
            rooms.remove(&binding.room_code)?
        };

        if let Some(other) = room.slot(binding.role.peer()) {
            self.registry.unbind(other.id);
            other.send(&ServerMessage::RoomClosed {
                message: format!("The {} left the room", binding.role),
            });
        }
        info!("Room {} closed by {} {}", binding.room_code, binding.role, id);
        Some(Departure {
            room_code: binding.room_code,
            role: binding.role,
            room_closed: true,
        })
    }

    /// Channel went away: vacate its slot, tell the other side, and delete
    /// the room once nobody is left.
    pub fn handle_disconnect(&self, id: ConnectionId) -> Option<Departure> {
        let mut rooms = self.rooms.write().unwrap_or_else(|e| e.into_inner());
        self.vacate(&mut rooms, id)
    }

    /// Resolve the other occupant of the sender's room.
    pub fn peer_of(&self, id: ConnectionId) -> PeerLookup {
        let Some(binding) = self.registry.binding(id) else {
            return PeerLookup::Unbound;
        };
        let rooms = self.rooms.read().unwrap_or_else(|e| e.into_inner());
        let Some(room) = rooms.get(&binding.room_code) else {
            return PeerLookup::Stale { room_code: binding.room_code };
        };
        if !room.occupied_by(binding.role, id) {
            return PeerLookup::Stale { room_code: binding.room_code };
        }
        match room.slot(binding.role.peer()) {
            Some(peer) if peer.is_connected() => PeerLookup::Present(PeerRoute {
                room_code: binding.room_code,
                role: binding.role,
                peer: peer.clone(),
            }),
            _ => PeerLookup::Absent {
                room_code: binding.room_code,
                role: binding.role,
            },
        }
    }

    /// Send to every occupant of a room. Returns how many were reached.
    pub fn broadcast(&self, room_code: &str, message: &ServerMessage) -> usize {
        let rooms = self.rooms.read().unwrap_or_else(|e| e.into_inner());
        rooms.get(room_code).map_or(0, |room| room.broadcast(message))
    }

    /// Record that HLS output is live and tell both occupants.
    pub fn notify_stream_ready(
        &self,
        room_code: &str,
        hls_url: &str,
        watch_page_url: &str,
    ) -> Result<usize, RoomError> {
        let code = normalize_key(room_code)?;
        let mut rooms = self.rooms.write().unwrap_or_else(|e| e.into_inner());
        let room = rooms
            .get_mut(&code)
            .ok_or_else(|| RoomError::NotFound(code.clone()))?;
        room.stream = Some(StreamInfo {
            hls_url: hls_url.to_string(),
            watch_page_url: watch_page_url.to_string(),
        });
        let reached = room.broadcast(&ServerMessage::StreamReady {
            room_code: code.clone(),
            hls_url: hls_url.to_string(),
            watch_page_url: watch_page_url.to_string(),
        });
        info!("Stream ready for room {} ({} notified)", code, reached);
        Ok(reached)
    }

    /// Forget the room's stream URLs. Returns whether one was set.
    pub fn clear_stream(&self, room_code: &str) -> bool {
        let mut rooms = self.rooms.write().unwrap_or_else(|e| e.into_inner());
        rooms
            .get_mut(room_code)
            .map_or(false, |room| room.stream.take().is_some())
    }

    pub fn room_info(&self, room_code: &str) -> Option<RoomInfo> {
        let code = normalize_key(room_code).ok()?;
        let rooms = self.rooms.read().unwrap_or_else(|e| e.into_inner());
        rooms.get(&code).map(|room| room.info(now_millis()))
    }

    pub fn room_count(&self) -> usize {
        self.rooms.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    /// Connected occupants across all rooms.
    pub fn occupant_count(&self) -> usize {
        let rooms = self.rooms.read().unwrap_or_else(|e| e.into_inner());
        rooms.values().map(Room::occupants).sum()
    }

    pub fn sweep(&self) -> SweepReport {
        self.sweep_at(now_millis())
    }

    /// Delete expired rooms nobody is connected to; give expired rooms that
    /// are still in use another extension window.
    pub fn sweep_at(&self, now: i64) -> SweepReport {
        let extension = self.extension_millis();
        let mut report = SweepReport::default();
        let mut rooms = self.rooms.write().unwrap_or_else(|e| e.into_inner());
        rooms.retain(|code, room| {
            if !room.is_expired(now) {
                return true;
            }
            if room.is_vacant() {
                report.deleted.push(code.clone());
                return false;
            }
            room.expires_at = now + extension;
            report.extended.push(code.clone());
            true
        });
        drop(rooms);

        for code in &report.deleted {
            info!("Expired room {} removed", code);
        }
        for code in &report.extended {
            debug!("Expired room {} still occupied, extended", code);
        }
        report
    }

    pub fn snapshot(&self) -> RoomSnapshot {
        let rooms = self.rooms.read().unwrap_or_else(|e| e.into_inner());
        let mut entries: Vec<RoomSnapshotEntry> = rooms.values().map(Room::snapshot_entry).collect();
        entries.sort_by(|a, b| a.room_code.cmp(&b.room_code));
        RoomSnapshot {
            saved_at: now_millis(),
            rooms: entries,
        }
    }

    /// Write the snapshot file if one is configured. Failures are logged only.
    /// Returns whether a file was written.
    pub async fn persist_snapshot(&self) -> bool {
        let Some(path) = &self.config.snapshot_path else {
            return false;
        };
        let _write = self.snapshot_lock.lock().await;
        // Taken under the lock so the last writer holds the newest table
        let snapshot = self.snapshot();
        match snapshot::write_snapshot(path, &snapshot).await {
            Ok(()) => true,
            Err(e) => {
                warn!("Failed to persist room snapshot: {:#}", e);
                false
            }
        }
    }

    /// Close every room, telling occupants the server is going away.
    /// Returns the codes that were open.
    pub fn close_all(&self, reason: &str) -> Vec<String> {
        let drained: Vec<Room> = {
            let mut rooms = self.rooms.write().unwrap_or_else(|e| e.into_inner());
            rooms.drain().map(|(_, room)| room).collect()
        };
        let message = ServerMessage::RoomClosed {
            message: reason.to_string(),
        };
        drained
            .into_iter()
            .map(|room| {
                for role in [Role::Presenter, Role::Viewer] {
                    if let Some(peer) = room.slot(role) {
                        self.registry.unbind(peer.id);
                        peer.send(&message);
                    }
                }
                room.code
            })
            .collect()
    }
}
