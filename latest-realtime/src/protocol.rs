//! JSON wire protocol for the realtime socket.
//!
//! Every frame is a WebSocket text frame carrying one envelope:
//! ```text
//! { "event": "<name>", "data": { ... } }
//! ```
//!
//! Inbound (client → server): `join:couple`, `partner:activity`,
//! `typing:start`, `typing:stop`, `heartbeat`, `broadcast`.
//!
//! Outbound (server → client): `<model>:<action>` change events,
//! `partner:presence`, `couple:joined`, `heartbeat:ack`, `error`.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::record::{parse_channel, ChangeEvent};

pub const EVENT_JOIN: &str = "join:couple";
pub const EVENT_ACTIVITY: &str = "partner:activity";
pub const EVENT_TYPING_START: &str = "typing:start";
pub const EVENT_TYPING_STOP: &str = "typing:stop";
pub const EVENT_HEARTBEAT: &str = "heartbeat";
pub const EVENT_BROADCAST: &str = "broadcast";

pub const EVENT_PRESENCE: &str = "partner:presence";
pub const EVENT_JOINED: &str = "couple:joined";
pub const EVENT_HEARTBEAT_ACK: &str = "heartbeat:ack";
pub const EVENT_ERROR: &str = "error";

/// Activity string relayed while a partner is typing.
pub const TYPING_ACTIVITY: &str = "typing";

/// Raw `{event, data}` pair.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub event: String,
    #[serde(default)]
    pub data: Value,
}

impl Envelope {
    pub fn new(event: impl Into<String>, data: Value) -> Self {
        Self {
            event: event.into(),
            data,
        }
    }

    pub fn encode(&self) -> Result<String, ProtocolError> {
        serde_json::to_string(self).map_err(|e| ProtocolError::Serialization(e.to_string()))
    }

    pub fn decode(text: &str) -> Result<Self, ProtocolError> {
        serde_json::from_str(text).map_err(|e| ProtocolError::Deserialization(e.to_string()))
    }

    fn data_as<T: DeserializeOwned>(&self) -> Result<T, ProtocolError> {
        serde_json::from_value(self.data.clone()).map_err(|e| ProtocolError::InvalidPayload {
            event: self.event.clone(),
            reason: e.to_string(),
        })
    }
}

fn to_data<T: Serialize>(value: &T) -> Result<Value, ProtocolError> {
    serde_json::to_value(value).map_err(|e| ProtocolError::Serialization(e.to_string()))
}

// ───────────────────────────────────────────────────────────────────
// Payloads
// ───────────────────────────────────────────────────────────────────

/// Join message: enter the couple-scoped room.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JoinRequest {
    pub user_id: String,
    pub couple_id: String,
    pub partner_role: String,
    pub name: String,
}

/// Presence update relayed to the other members of a room.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PresenceEvent {
    pub partner: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub activity: Option<String>,
    pub online: bool,
}

impl PresenceEvent {
    pub fn online(partner: impl Into<String>) -> Self {
        Self {
            partner: partner.into(),
            activity: None,
            online: true,
        }
    }

    pub fn offline(partner: impl Into<String>) -> Self {
        Self {
            partner: partner.into(),
            activity: None,
            online: false,
        }
    }

    pub fn activity(partner: impl Into<String>, activity: Option<String>) -> Self {
        Self {
            partner: partner.into(),
            activity,
            online: true,
        }
    }
}

/// One room member as reported in the join acknowledgement.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MemberPresence {
    pub partner: String,
    pub partner_role: String,
    pub online: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub activity: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JoinAck {
    pub couple_id: String,
    pub partner_role: String,
    pub members: Vec<MemberPresence>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct ActivityPayload {
    activity: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct AnnouncePayload {
    channel: String,
    #[serde(default)]
    payload: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct TimestampPayload {
    timestamp: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct ErrorPayload {
    message: String,
}

// ───────────────────────────────────────────────────────────────────
// Client → server
// ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
pub enum ClientMessage {
    Join(JoinRequest),
    /// Ad hoc activity hint; `None` clears it.
    Activity(Option<String>),
    Heartbeat,
    /// Admin-only global broadcast.
    Announce { channel: String, payload: Value },
}

impl ClientMessage {
    pub fn to_envelope(&self) -> Result<Envelope, ProtocolError> {
        Ok(match self {
            ClientMessage::Join(join) => Envelope::new(EVENT_JOIN, to_data(join)?),
            ClientMessage::Activity(Some(activity)) if activity == TYPING_ACTIVITY => {
                Envelope::new(EVENT_TYPING_START, Value::Null)
            }
            ClientMessage::Activity(Some(activity)) => Envelope::new(
                EVENT_ACTIVITY,
                to_data(&ActivityPayload {
                    activity: activity.clone(),
                })?,
            ),
            ClientMessage::Activity(None) => Envelope::new(EVENT_TYPING_STOP, Value::Null),
            ClientMessage::Heartbeat => Envelope::new(EVENT_HEARTBEAT, Value::Null),
            ClientMessage::Announce { channel, payload } => Envelope::new(
                EVENT_BROADCAST,
                to_data(&AnnouncePayload {
                    channel: channel.clone(),
                    payload: payload.clone(),
                })?,
            ),
        })
    }

    pub fn from_envelope(envelope: &Envelope) -> Result<Self, ProtocolError> {
        match envelope.event.as_str() {
            EVENT_JOIN => {
                let join: JoinRequest = envelope.data_as()?;
                if join.couple_id.trim().is_empty() {
                    return Err(ProtocolError::InvalidPayload {
                        event: envelope.event.clone(),
                        reason: "coupleId must not be empty".into(),
                    });
                }
                Ok(ClientMessage::Join(join))
            }
            EVENT_ACTIVITY => {
                let payload: ActivityPayload = envelope.data_as()?;
                Ok(ClientMessage::Activity(Some(payload.activity)))
            }
            EVENT_TYPING_START => Ok(ClientMessage::Activity(Some(TYPING_ACTIVITY.to_string()))),
            EVENT_TYPING_STOP => Ok(ClientMessage::Activity(None)),
            EVENT_HEARTBEAT => Ok(ClientMessage::Heartbeat),
            EVENT_BROADCAST => {
                let payload: AnnouncePayload = envelope.data_as()?;
                if is_reserved_event(&payload.channel) {
                    return Err(ProtocolError::InvalidPayload {
                        event: envelope.event.clone(),
                        reason: format!("channel {} is reserved", payload.channel),
                    });
                }
                Ok(ClientMessage::Announce {
                    channel: payload.channel,
                    payload: payload.payload,
                })
            }
            other => Err(ProtocolError::UnknownEvent(other.to_string())),
        }
    }

    pub fn encode(&self) -> Result<String, ProtocolError> {
        self.to_envelope()?.encode()
    }

    pub fn decode(text: &str) -> Result<Self, ProtocolError> {
        Self::from_envelope(&Envelope::decode(text)?)
    }
}

// ───────────────────────────────────────────────────────────────────
// Server → client
// ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
pub enum ServerMessage {
    Change(ChangeEvent),
    Presence(PresenceEvent),
    Joined(JoinAck),
    HeartbeatAck { timestamp: u64 },
    Error { message: String },
    /// Anything else, e.g. administrative announcements.
    Other(Envelope),
}

impl ServerMessage {
    pub fn to_envelope(&self) -> Result<Envelope, ProtocolError> {
        Ok(match self {
            ServerMessage::Change(event) => Envelope::new(event.channel(), to_data(event)?),
            ServerMessage::Presence(presence) => Envelope::new(EVENT_PRESENCE, to_data(presence)?),
            ServerMessage::Joined(ack) => Envelope::new(EVENT_JOINED, to_data(ack)?),
            ServerMessage::HeartbeatAck { timestamp } => Envelope::new(
                EVENT_HEARTBEAT_ACK,
                to_data(&TimestampPayload {
                    timestamp: *timestamp,
                })?,
            ),
            ServerMessage::Error { message } => Envelope::new(
                EVENT_ERROR,
                to_data(&ErrorPayload {
                    message: message.clone(),
                })?,
            ),
            ServerMessage::Other(envelope) => envelope.clone(),
        })
    }

    pub fn from_envelope(envelope: Envelope) -> Result<Self, ProtocolError> {
        match envelope.event.as_str() {
            EVENT_PRESENCE => Ok(ServerMessage::Presence(envelope.data_as()?)),
            EVENT_JOINED => Ok(ServerMessage::Joined(envelope.data_as()?)),
            EVENT_HEARTBEAT_ACK => {
                let payload: TimestampPayload = envelope.data_as()?;
                Ok(ServerMessage::HeartbeatAck {
                    timestamp: payload.timestamp,
                })
            }
            EVENT_ERROR => {
                let payload: ErrorPayload = envelope.data_as()?;
                Ok(ServerMessage::Error {
                    message: payload.message,
                })
            }
            channel => match parse_channel(channel) {
                Some(_) => Ok(ServerMessage::Change(envelope.data_as()?)),
                None => Ok(ServerMessage::Other(envelope)),
            },
        }
    }

    pub fn encode(&self) -> Result<String, ProtocolError> {
        self.to_envelope()?.encode()
    }

    pub fn decode(text: &str) -> Result<Self, ProtocolError> {
        Self::from_envelope(Envelope::decode(text)?)
    }
}

/// Names a client may not announce on: change channels and server events.
pub fn is_reserved_event(name: &str) -> bool {
    const SERVER_EVENTS: [&str; 4] = [EVENT_PRESENCE, EVENT_JOINED, EVENT_HEARTBEAT_ACK, EVENT_ERROR];
    SERVER_EVENTS.contains(&name) || parse_channel(name).is_some()
}

/// Protocol errors.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ProtocolError {
    #[error("serialization error: {0}")]
    Serialization(String),
    #[error("deserialization error: {0}")]
    Deserialization(String),
    #[error("invalid payload for {event}: {reason}")]
    InvalidPayload { event: String, reason: String },
    #[error("unknown event: {0}")]
    UnknownEvent(String),
}
