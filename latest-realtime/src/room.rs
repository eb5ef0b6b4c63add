//! Couple-scoped rooms and presence.
//!
//! Each couple gets its own tokio broadcast channel so that frames are
//! isolated between couples. A second, process-wide channel carries
//! administrative events to every registered connection.
//!
//! The manager is the single owner of membership: sessions only hold a
//! [`ConnectionId`] and the receivers handed out by [`RoomManager::join`].

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, RwLock};
use uuid::Uuid;

use crate::auth::Identity;
use crate::protocol::{JoinAck, JoinRequest, MemberPresence, PresenceEvent, ProtocolError, ServerMessage};

/// Transport-level identifier of one live connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId(Uuid);

impl ConnectionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A pre-encoded text frame fanned out through a room or the global channel.
#[derive(Debug, Clone)]
pub struct Frame {
    /// Connection that must not receive this frame (the originator of a
    /// presence or activity update). `None` means every subscriber.
    pub exclude: Option<ConnectionId>,
    pub text: Arc<str>,
}

impl Frame {
    pub fn to_all(text: impl Into<Arc<str>>) -> Self {
        Self {
            exclude: None,
            text: text.into(),
        }
    }

    pub fn excluding(connection: ConnectionId, text: impl Into<Arc<str>>) -> Self {
        Self {
            exclude: Some(connection),
            text: text.into(),
        }
    }

    /// Whether `connection` should forward this frame to its socket.
    pub fn is_for(&self, connection: ConnectionId) -> bool {
        self.exclude != Some(connection)
    }
}

pub type FrameReceiver = broadcast::Receiver<Frame>;

/// Room manager errors.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum RoomError {
    #[error("connection {0} is not registered")]
    UnknownConnection(ConnectionId),
    #[error("connection {0} has not joined a room")]
    NotJoined(ConnectionId),
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}

/// Result of a successful join.
pub struct JoinOutcome {
    /// Subscription to the room's frames.
    pub receiver: FrameReceiver,
    /// Acknowledgement for the joining connection.
    pub ack: JoinAck,
    /// Room the connection was moved out of, if any.
    pub previous_room: Option<String>,
}

/// Snapshot of room manager counters.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RoomStats {
    pub active_rooms: usize,
    pub connections: usize,
    pub rooms_created: u64,
    pub rooms_removed: u64,
    pub presence_events: u64,
}

#[derive(Default)]
struct AtomicRoomStats {
    rooms_created: AtomicU64,
    rooms_removed: AtomicU64,
    presence_events: AtomicU64,
}

#[derive(Debug, Clone)]
struct Member {
    partner: String,
    partner_role: String,
    activity: Option<String>,
}

struct Room {
    sender: broadcast::Sender<Frame>,
    members: HashMap<ConnectionId, Member>,
}

impl Room {
    fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self {
            sender,
            members: HashMap::new(),
        }
    }

    fn send(&self, frame: Frame) -> usize {
        self.sender.send(frame).unwrap_or(0)
    }

    fn roster(&self) -> Vec<MemberPresence> {
        let mut members: Vec<MemberPresence> = self
            .members
            .values()
            .map(|member| MemberPresence {
                partner: member.partner.clone(),
                partner_role: member.partner_role.clone(),
                online: true,
                activity: member.activity.clone(),
            })
            .collect();
        members.sort_by(|a, b| a.partner_role.cmp(&b.partner_role).then(a.partner.cmp(&b.partner)));
        members
    }
}

struct ConnectionEntry {
    identity: Identity,
    room: Option<String>,
}

#[derive(Default)]
struct RoomState {
    rooms: HashMap<String, Room>,
    connections: HashMap<ConnectionId, ConnectionEntry>,
}

/// Couple-scoped membership plus the global fan-out channel.
pub struct RoomManager {
    state: RwLock<RoomState>,
    global: broadcast::Sender<Frame>,
    capacity: usize,
    stats: AtomicRoomStats,
}

impl RoomManager {
    /// `capacity` is the per-receiver buffer of every room channel; a
    /// receiver that falls further behind starts losing frames.
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        let (global, _) = broadcast::channel(capacity);
        Self {
            state: RwLock::new(RoomState::default()),
            global,
            capacity,
            stats: AtomicRoomStats::default(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Track an authenticated connection and subscribe it to global events.
    pub async fn register(&self, connection: ConnectionId, identity: Identity) -> FrameReceiver {
        let mut state = self.state.write().await;
        state
            .connections
            .insert(connection, ConnectionEntry { identity, room: None });
        self.global.subscribe()
    }

    /// Enter the room for `request.couple_id`, leaving any previous room.
    ///
    /// Existing members receive one "online" presence event. Joining the
    /// room the connection is already in refreshes its display metadata
    /// without announcing it again.
    pub async fn join(
        &self,
        connection: ConnectionId,
        request: &JoinRequest,
    ) -> Result<JoinOutcome, RoomError> {
        let mut state = self.state.write().await;
        let current = state
            .connections
            .get(&connection)
            .ok_or(RoomError::UnknownConnection(connection))?
            .room
            .clone();

        let member = Member {
            partner: request.name.clone(),
            partner_role: request.partner_role.clone(),
            activity: None,
        };

        if current.as_deref() == Some(request.couple_id.as_str()) {
            let room = state
                .rooms
                .get_mut(&request.couple_id)
                .ok_or(RoomError::NotJoined(connection))?;
            room.members.insert(connection, member);
            return Ok(JoinOutcome {
                receiver: room.sender.subscribe(),
                ack: JoinAck {
                    couple_id: request.couple_id.clone(),
                    partner_role: request.partner_role.clone(),
                    members: room.roster(),
                },
                previous_room: None,
            });
        }

        let previous_room = match current {
            Some(previous) => {
                self.remove_member(&mut state, connection, &previous)?;
                Some(previous)
            }
            None => None,
        };

        let presence = ServerMessage::Presence(PresenceEvent::online(&request.name)).encode()?;
        let capacity = self.capacity;
        let room = state.rooms.entry(request.couple_id.clone()).or_insert_with(|| {
            self.stats.rooms_created.fetch_add(1, Ordering::Relaxed);
            log::info!("Created room for couple {}", request.couple_id);
            Room::new(capacity)
        });

        // Announce before subscribing so the joiner never sees its own arrival.
        if !room.members.is_empty() {
            room.send(Frame::excluding(connection, presence));
            self.stats.presence_events.fetch_add(1, Ordering::Relaxed);
        }
        room.members.insert(connection, member);
        let receiver = room.sender.subscribe();
        let ack = JoinAck {
            couple_id: request.couple_id.clone(),
            partner_role: request.partner_role.clone(),
            members: room.roster(),
        };

        if let Some(entry) = state.connections.get_mut(&connection) {
            entry.room = Some(request.couple_id.clone());
        }

        log::info!(
            "Connection {} joined couple {} as {} ({})",
            connection,
            request.couple_id,
            request.name,
            request.partner_role
        );

        Ok(JoinOutcome {
            receiver,
            ack,
            previous_room,
        })
    }

    /// Leave the current room, announcing "offline" to the remaining members.
    ///
    /// Returns the couple id that was left, `None` if not in a room.
    pub async fn leave(&self, connection: ConnectionId) -> Result<Option<String>, RoomError> {
        let mut state = self.state.write().await;
        let Some(couple_id) = state
            .connections
            .get_mut(&connection)
            .and_then(|entry| entry.room.take())
        else {
            return Ok(None);
        };
        self.remove_member(&mut state, connection, &couple_id)?;
        Ok(Some(couple_id))
    }

    /// Forget the connection entirely. Called once on disconnect.
    pub async fn unregister(&self, connection: ConnectionId) -> Result<Option<String>, RoomError> {
        let left = self.leave(connection).await?;
        self.state.write().await.connections.remove(&connection);
        Ok(left)
    }

    /// Relay an activity hint to the other members of the caller's room.
    pub async fn publish_activity(
        &self,
        connection: ConnectionId,
        activity: Option<String>,
    ) -> Result<usize, RoomError> {
        let mut state = self.state.write().await;
        let couple_id = state
            .connections
            .get(&connection)
            .ok_or(RoomError::UnknownConnection(connection))?
            .room
            .clone()
            .ok_or(RoomError::NotJoined(connection))?;
        let room = state
            .rooms
            .get_mut(&couple_id)
            .ok_or(RoomError::NotJoined(connection))?;
        let member = room
            .members
            .get_mut(&connection)
            .ok_or(RoomError::NotJoined(connection))?;

        member.activity = activity.clone();
        let text = ServerMessage::Presence(PresenceEvent::activity(&member.partner, activity)).encode()?;
        self.stats.presence_events.fetch_add(1, Ordering::Relaxed);
        Ok(room.send(Frame::excluding(connection, text)))
    }

    /// Deliver a frame to every member of `couple_id`, the sender included.
    ///
    /// Returns the number of receivers; zero when the room does not exist.
    pub async fn broadcast(&self, couple_id: &str, text: Arc<str>) -> usize {
        let state = self.state.read().await;
        match state.rooms.get(couple_id) {
            Some(room) => room.send(Frame::to_all(text)),
            None => 0,
        }
    }

    /// Deliver a frame to every registered connection.
    pub fn broadcast_all(&self, text: Arc<str>) -> usize {
        self.global.send(Frame::to_all(text)).unwrap_or(0)
    }

    /// Current roster of a room.
    pub async fn presence(&self, couple_id: &str) -> Vec<MemberPresence> {
        let state = self.state.read().await;
        state.rooms.get(couple_id).map(Room::roster).unwrap_or_default()
    }

    pub async fn room_of(&self, connection: ConnectionId) -> Option<String> {
        let state = self.state.read().await;
        state.connections.get(&connection).and_then(|entry| entry.room.clone())
    }

    pub async fn identity(&self, connection: ConnectionId) -> Option<Identity> {
        let state = self.state.read().await;
        state.connections.get(&connection).map(|entry| entry.identity.clone())
    }

    pub async fn room_count(&self) -> usize {
        self.state.read().await.rooms.len()
    }

    pub async fn member_count(&self, couple_id: &str) -> usize {
        let state = self.state.read().await;
        state.rooms.get(couple_id).map_or(0, |room| room.members.len())
    }

    pub async fn connection_count(&self) -> usize {
        self.state.read().await.connections.len()
    }

    pub async fn stats(&self) -> RoomStats {
        let state = self.state.read().await;
        RoomStats {
            active_rooms: state.rooms.len(),
            connections: state.connections.len(),
            rooms_created: self.stats.rooms_created.load(Ordering::Relaxed),
            rooms_removed: self.stats.rooms_removed.load(Ordering::Relaxed),
            presence_events: self.stats.presence_events.load(Ordering::Relaxed),
        }
    }

    /// Drop `connection` from `couple_id`, announce it, and discard the room
    /// once empty. Caller holds the write lock.
    fn remove_member(
        &self,
        state: &mut RoomState,
        connection: ConnectionId,
        couple_id: &str,
    ) -> Result<(), RoomError> {
        let Some(room) = state.rooms.get_mut(couple_id) else {
            return Ok(());
        };
        let Some(member) = room.members.remove(&connection) else {
            return Ok(());
        };

        log::info!("Connection {} left couple {}", connection, couple_id);

        if room.members.is_empty() {
            state.rooms.remove(couple_id);
            self.stats.rooms_removed.fetch_add(1, Ordering::Relaxed);
            log::info!("Removed empty room for couple {}", couple_id);
            return Ok(());
        }

        let text = ServerMessage::Presence(PresenceEvent::offline(member.partner)).encode()?;
        room.send(Frame::excluding(connection, text));
        self.stats.presence_events.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }
}
