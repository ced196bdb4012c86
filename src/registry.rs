#![forbid(unsafe_code)]

// Connection registry - live WebSocket channels and their room/role tags

use crate::room::roles::Role;
use crate::signaling::protocol::ServerMessage;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::RwLock as StdRwLock;
use std::time::Instant;
use tokio::sync::mpsc;
use tracing::{debug, warn};
use uuid::Uuid;

/// Opaque identity of one WebSocket connection.
pub type ConnectionId = Uuid;

/// Frames queued for a connection's send task.
#[derive(Debug, Clone)]
pub enum Outbound {
    /// Pre-serialized JSON text frame
    Text(Arc<String>),
    /// Heartbeat ping
    Ping,
    /// Close the socket with the given code and reason
    Close { code: u16, reason: &'static str },
}

/// Non-owning reference to a connection's outbound queue.
///
/// Rooms and the registry hold these; only the connection task holds the
/// strong sender, so a handle goes dead as soon as the socket is gone.
#[derive(Debug, Clone)]
pub struct PeerHandle {
    pub id: ConnectionId,
    sender: mpsc::WeakSender<Outbound>,
}

impl PeerHandle {
    pub fn new(id: ConnectionId, sender: &mpsc::Sender<Outbound>) -> Self {
        Self {
            id,
            sender: sender.downgrade(),
        }
    }

    /// Whether the owning connection still exists.
    pub fn is_connected(&self) -> bool {
        self.sender.upgrade().map_or(false, |s| !s.is_closed())
    }

    /// Serialize and queue a message. Returns false if it could not be queued.
    pub fn send(&self, message: &ServerMessage) -> bool {
        match serde_json::to_string(message) {
            Ok(json) => self.send_raw(Arc::new(json)),
            Err(e) => {
                warn!("Failed to serialize message for connection {}: {}", self.id, e);
                false
            }
        }
    }

    /// Queue an already-serialized text frame, e.g. a relayed payload.
    pub fn send_raw(&self, json: Arc<String>) -> bool {
        self.push(Outbound::Text(json))
    }

    /// Ask the connection's send task to close the socket.
    pub fn close(&self, code: u16, reason: &'static str) -> bool {
        self.push(Outbound::Close { code, reason })
    }

    fn push(&self, outbound: Outbound) -> bool {
        let Some(sender) = self.sender.upgrade() else {
            debug!("Connection {} is gone, dropping outbound frame", self.id);
            return false;
        };
        match sender.try_send(outbound) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                warn!("Channel full for connection {}, dropping message", self.id);
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                debug!("Channel closed for connection {} (disconnected)", self.id);
                false
            }
        }
    }
}

/// Room and role a channel is currently bound to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Binding {
    pub room_code: String,
    pub role: Role,
}

struct ChannelEntry {
    binding: Option<Binding>,
    alive: bool,
    connected_at: Instant,
}

/// Tracks every live channel with its room/role tags and heartbeat liveness.
pub struct ConnectionRegistry {
    channels: StdRwLock<HashMap<ConnectionId, ChannelEntry>>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self {
            channels: StdRwLock::new(HashMap::new()),
        }
    }

    pub fn register(&self, id: ConnectionId) {
        let mut channels = self.channels.write().unwrap_or_else(|e| e.into_inner());
        channels.insert(
            id,
            ChannelEntry {
                binding: None,
                alive: true,
                connected_at: Instant::now(),
            },
        );
    }

    /// Removes a channel. Returns its last binding, if any.
    pub fn unregister(&self, id: ConnectionId) -> Option<Binding> {
        let mut channels = self.channels.write().unwrap_or_else(|e| e.into_inner());
        let entry = channels.remove(&id)?;
        debug!(
            "Unregistered connection {} after {:?}",
            id,
            entry.connected_at.elapsed()
        );
        entry.binding
    }

    pub fn bind(&self, id: ConnectionId, room_code: &str, role: Role) {
        let mut channels = self.channels.write().unwrap_or_else(|e| e.into_inner());
        if let Some(entry) = channels.get_mut(&id) {
            entry.binding = Some(Binding {
                room_code: room_code.to_string(),
                role,
            });
        }
    }

    pub fn unbind(&self, id: ConnectionId) -> Option<Binding> {
        let mut channels = self.channels.write().unwrap_or_else(|e| e.into_inner());
        channels.get_mut(&id).and_then(|entry| entry.binding.take())
    }

    pub fn binding(&self, id: ConnectionId) -> Option<Binding> {
        let channels = self.channels.read().unwrap_or_else(|e| e.into_inner());
        channels.get(&id).and_then(|entry| entry.binding.clone())
    }

    /// Record any inbound frame from the channel as a heartbeat answer.
    pub fn mark_alive(&self, id: ConnectionId) {
        let mut channels = self.channels.write().unwrap_or_else(|e| e.into_inner());
        if let Some(entry) = channels.get_mut(&id) {
            entry.alive = true;
        }
    }

    /// Heartbeat check: returns whether the channel answered since the last
    /// check and resets the flag for the next round.
    pub fn check_alive(&self, id: ConnectionId) -> bool {
        let mut channels = self.channels.write().unwrap_or_else(|e| e.into_inner());
        match channels.get_mut(&id) {
            Some(entry) => std::mem::replace(&mut entry.alive, false),
            None => false,
        }
    }

    pub fn len(&self) -> usize {
        self.channels.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for ConnectionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn channel() -> (PeerHandle, mpsc::Sender<Outbound>, mpsc::Receiver<Outbound>) {
        let (tx, rx) = mpsc::channel(8);
        (PeerHandle::new(Uuid::new_v4(), &tx), tx, rx)
    }

    #[test]
    fn test_bind_and_unregister() {
        let registry = ConnectionRegistry::new();
        let (handle, _tx, _rx) = channel();
        let id = handle.id;
        registry.register(id);
        assert_eq!(registry.len(), 1);
        assert!(registry.binding(id).is_none());

        registry.bind(id, "ABC123", Role::Presenter);
        assert_eq!(
            registry.binding(id),
            Some(Binding { room_code: "ABC123".into(), role: Role::Presenter })
        );

        let last = registry.unregister(id);
        assert_eq!(last.map(|b| b.room_code), Some("ABC123".to_string()));
        assert!(registry.is_empty());
    }

    #[test]
    fn test_heartbeat_flag() {
        let registry = ConnectionRegistry::new();
        let (handle, _tx, _rx) = channel();
        let id = handle.id;
        registry.register(id);

        assert!(registry.check_alive(id));
        assert!(!registry.check_alive(id));
        registry.mark_alive(id);
        assert!(registry.check_alive(id));
    }

    #[test]
    fn test_handle_goes_dead_with_sender() {
        let (handle, tx, mut rx) = channel();
        assert!(handle.send(&ServerMessage::PeerLeft { role: Role::Viewer }));
        match rx.try_recv() {
            Ok(Outbound::Text(json)) => assert!(json.contains("peer-left")),
            other => panic!("unexpected outbound: {other:?}"),
        }

        drop(tx);
        assert!(!handle.is_connected());
        assert!(!handle.send(&ServerMessage::PeerLeft { role: Role::Viewer }));
    }
}
