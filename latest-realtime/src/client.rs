//! Realtime client and local cache reconciler.
//!
//! Provides:
//! - Connection lifecycle (connect with origin + bearer token, disconnect)
//! - Join / activity / heartbeat / admin broadcast sends
//! - Typed [`ClientEvent`]s for the application
//! - [`CacheReconciler`] to fold change events into a local record cache

use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{mpsc, RwLock};
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};

use crate::protocol::{ClientMessage, Envelope, JoinAck, JoinRequest, PresenceEvent, ProtocolError, ServerMessage};
use crate::record::{Action, ChangeEvent, EntityKind, Record};

/// Client connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

/// Events emitted by the realtime client.
#[derive(Debug, Clone, PartialEq)]
pub enum ClientEvent {
    /// Connection established
    Connected,
    /// Join acknowledged with the room roster
    Joined(JoinAck),
    /// A committed create/update/delete
    Changed(ChangeEvent),
    /// Partner online/offline/activity
    Presence(PresenceEvent),
    HeartbeatAck { timestamp: u64 },
    /// Error frame sent by the server
    ServerError(String),
    /// Any other event, e.g. admin announcements
    Other(Envelope),
    /// Connection lost
    Disconnected,
}

impl From<ServerMessage> for ClientEvent {
    fn from(message: ServerMessage) -> Self {
        match message {
            ServerMessage::Change(event) => ClientEvent::Changed(event),
            ServerMessage::Presence(presence) => ClientEvent::Presence(presence),
            ServerMessage::Joined(ack) => ClientEvent::Joined(ack),
            ServerMessage::HeartbeatAck { timestamp } => ClientEvent::HeartbeatAck { timestamp },
            ServerMessage::Error { message } => ClientEvent::ServerError(message),
            ServerMessage::Other(envelope) => ClientEvent::Other(envelope),
        }
    }
}

/// Client errors.
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    /// The server refused the upgrade (403 origin, 401 token, 500 config).
    #[error("handshake rejected with HTTP {status}")]
    Rejected { status: u16 },
    #[error("connection failed: {0}")]
    Connect(String),
    #[error("invalid header value: {0}")]
    InvalidHeader(String),
    #[error("not connected")]
    NotConnected,
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}

impl From<WsError> for ClientError {
    fn from(e: WsError) -> Self {
        match e {
            WsError::Http(response) => ClientError::Rejected {
                status: response.status().as_u16(),
            },
            other => ClientError::Connect(other.to_string()),
        }
    }
}

/// The realtime client.
pub struct RealtimeClient {
    url: String,
    origin: Option<String>,
    token: Option<String>,
    state: Arc<RwLock<ConnectionState>>,
    /// Channel to the WebSocket writer task
    outgoing_tx: Option<mpsc::Sender<Message>>,
    event_rx: Option<mpsc::Receiver<ClientEvent>>,
    event_tx: mpsc::Sender<ClientEvent>,
}

impl RealtimeClient {
    pub fn new(url: impl Into<String>) -> Self {
        let (event_tx, event_rx) = mpsc::channel(256);
        Self {
            url: url.into(),
            origin: None,
            token: None,
            state: Arc::new(RwLock::new(ConnectionState::Disconnected)),
            outgoing_tx: None,
            event_rx: Some(event_rx),
            event_tx,
        }
    }

    pub fn with_origin(mut self, origin: impl Into<String>) -> Self {
        self.origin = Some(origin.into());
        self
    }

    /// Bearer token sent as `Authorization: Bearer <token>`.
    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.token = Some(token.into());
        self
    }

    /// Take the event receiver (can only be called once).
    pub fn take_event_rx(&mut self) -> Option<mpsc::Receiver<ClientEvent>> {
        self.event_rx.take()
    }

    /// Connect and spawn the reader and writer tasks.
    pub async fn connect(&mut self) -> Result<(), ClientError> {
        *self.state.write().await = ConnectionState::Connecting;

        let mut request = self.url.as_str().into_client_request()?;
        if let Some(origin) = &self.origin {
            request.headers_mut().insert("Origin", header_value(origin)?);
        }
        if let Some(token) = &self.token {
            request
                .headers_mut()
                .insert("Authorization", header_value(&format!("Bearer {token}"))?);
        }

        let ws_stream = match tokio_tungstenite::connect_async(request).await {
            Ok((ws_stream, _)) => ws_stream,
            Err(e) => {
                *self.state.write().await = ConnectionState::Disconnected;
                return Err(e.into());
            }
        };
        let (mut ws_writer, mut ws_reader) = ws_stream.split();

        // Writer task: forward the outgoing channel to the socket.
        let (out_tx, mut out_rx) = mpsc::channel::<Message>(256);
        self.outgoing_tx = Some(out_tx);
        tokio::spawn(async move {
            while let Some(message) = out_rx.recv().await {
                if ws_writer.send(message).await.is_err() {
                    break;
                }
            }
            let _ = ws_writer.close().await;
        });

        *self.state.write().await = ConnectionState::Connected;
        let _ = self.event_tx.send(ClientEvent::Connected).await;

        // Reader task: decode frames into events.
        let event_tx = self.event_tx.clone();
        let state = self.state.clone();
        tokio::spawn(async move {
            while let Some(message) = ws_reader.next().await {
                match message {
                    Ok(Message::Text(text)) => match ServerMessage::decode(text.as_str()) {
                        Ok(message) => {
                            if event_tx.send(message.into()).await.is_err() {
                                break;
                            }
                        }
                        Err(e) => log::warn!("Undecodable server frame: {e}"),
                    },
                    Ok(Message::Close(_)) | Err(_) => break,
                    _ => {}
                }
            }

            *state.write().await = ConnectionState::Disconnected;
            let _ = event_tx.send(ClientEvent::Disconnected).await;
        });

        Ok(())
    }

    pub async fn send(&self, message: &ClientMessage) -> Result<(), ClientError> {
        let text = message.encode()?;
        let tx = self.outgoing_tx.as_ref().ok_or(ClientError::NotConnected)?;
        tx.send(Message::Text(text.into()))
            .await
            .map_err(|_| ClientError::NotConnected)
    }

    pub async fn join(&self, request: JoinRequest) -> Result<(), ClientError> {
        self.send(&ClientMessage::Join(request)).await
    }

    /// Publish an activity hint; `None` clears it.
    pub async fn send_activity(&self, activity: Option<String>) -> Result<(), ClientError> {
        self.send(&ClientMessage::Activity(activity)).await
    }

    pub async fn heartbeat(&self) -> Result<(), ClientError> {
        self.send(&ClientMessage::Heartbeat).await
    }

    /// Admin-only global broadcast.
    pub async fn announce(&self, channel: impl Into<String>, payload: Value) -> Result<(), ClientError> {
        self.send(&ClientMessage::Announce {
            channel: channel.into(),
            payload,
        })
        .await
    }

    /// Close the socket; the reader task reports `Disconnected`.
    pub async fn disconnect(&mut self) -> Result<(), ClientError> {
        let tx = self.outgoing_tx.take().ok_or(ClientError::NotConnected)?;
        let _ = tx.send(Message::Close(None)).await;
        Ok(())
    }

    pub async fn connection_state(&self) -> ConnectionState {
        *self.state.read().await
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

fn header_value(value: &str) -> Result<HeaderValue, ClientError> {
    HeaderValue::from_str(value).map_err(|e| ClientError::InvalidHeader(e.to_string()))
}

/// Outcome of applying one change event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reconciled {
    /// Cache now holds the event's record.
    Applied,
    /// The cache already held this version or a newer one.
    Stale,
    /// The record was dropped from the cache.
    Removed,
    /// Delete for a record the cache never held.
    Ignored,
}

/// Local record cache kept current by change events.
///
/// Versions only move forward: an event carrying a version at or below the
/// cached one is ignored, so duplicate or reordered deliveries are harmless.
#[derive(Debug, Default)]
pub struct CacheReconciler {
    records: HashMap<(EntityKind, String), Record>,
}

impl CacheReconciler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store a record fetched outside the event stream (initial load, refetch).
    pub fn seed(&mut self, kind: EntityKind, record: Record) {
        self.records.insert((kind, record.id.clone()), record);
    }

    pub fn apply(&mut self, event: &ChangeEvent) -> Reconciled {
        let key = (event.model, event.payload.id.clone());
        match event.action {
            Action::Create | Action::Update => {
                if let Some(cached) = self.records.get(&key) {
                    if cached.version >= event.payload.version {
                        return Reconciled::Stale;
                    }
                }
                self.records.insert(key, event.payload.clone());
                Reconciled::Applied
            }
            Action::Delete => match self.records.remove(&key) {
                Some(_) => Reconciled::Removed,
                None => Reconciled::Ignored,
            },
        }
    }

    pub fn get(&self, kind: EntityKind, id: &str) -> Option<&Record> {
        self.records.get(&(kind, id.to_string()))
    }

    /// Records of one kind, in no particular order.
    pub fn records(&self, kind: EntityKind) -> Vec<&Record> {
        self.records
            .iter()
            .filter(|((k, _), _)| *k == kind)
            .map(|(_, record)| record)
            .collect()
    }

    /// Drop every cached record of `kind` so the caller refetches it.
    pub fn invalidate(&mut self, kind: EntityKind) -> usize {
        let before = self.records.len();
        self.records.retain(|(k, _), _| *k != kind);
        before - self.records.len()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::Version;
    use serde_json::{json, Map};

    fn task(id: &str, version: u64, done: bool) -> Record {
        let mut fields = Map::new();
        fields.insert("done".into(), json!(done));
        Record {
            id: id.into(),
            couple_id: Some("couple-1".into()),
            version: Version::new(version),
            fields,
        }
    }

    fn event(action: Action, record: Record) -> ChangeEvent {
        ChangeEvent::new(EntityKind::Task, action, record)
    }

    #[test]
    fn test_apply_create_and_update() {
        let mut cache = CacheReconciler::new();
        assert_eq!(cache.apply(&event(Action::Create, task("t1", 1, false))), Reconciled::Applied);
        assert_eq!(cache.apply(&event(Action::Update, task("t1", 2, true))), Reconciled::Applied);

        let cached = cache.get(EntityKind::Task, "t1").unwrap();
        assert_eq!(cached.version, Version::new(2));
        assert_eq!(cached.field("done"), Some(&json!(true)));
    }

    #[test]
    fn test_stale_events_ignored() {
        let mut cache = CacheReconciler::new();
        cache.seed(EntityKind::Task, task("t1", 3, true));

        assert_eq!(cache.apply(&event(Action::Update, task("t1", 2, false))), Reconciled::Stale);
        assert_eq!(cache.apply(&event(Action::Update, task("t1", 3, false))), Reconciled::Stale);
        assert_eq!(cache.get(EntityKind::Task, "t1").unwrap().field("done"), Some(&json!(true)));
    }

    #[test]
    fn test_delete() {
        let mut cache = CacheReconciler::new();
        cache.seed(EntityKind::Task, task("t1", 1, false));

        assert_eq!(cache.apply(&event(Action::Delete, task("t1", 1, false))), Reconciled::Removed);
        assert!(cache.is_empty());
        assert_eq!(cache.apply(&event(Action::Delete, task("t1", 1, false))), Reconciled::Ignored);
    }

    #[test]
    fn test_invalidate_by_kind() {
        let mut cache = CacheReconciler::new();
        cache.seed(EntityKind::Task, task("t1", 1, false));
        cache.seed(EntityKind::Task, task("t2", 1, false));
        cache.seed(EntityKind::Memory, task("m1", 1, false));

        assert_eq!(cache.records(EntityKind::Task).len(), 2);
        assert_eq!(cache.invalidate(EntityKind::Task), 2);
        assert_eq!(cache.len(), 1);
        assert!(cache.get(EntityKind::Memory, "m1").is_some());
    }

    #[test]
    fn test_server_message_into_event() {
        let ack = JoinAck {
            couple_id: "c".into(),
            partner_role: "partner_a".into(),
            members: Vec::new(),
        };
        assert_eq!(ClientEvent::from(ServerMessage::Joined(ack.clone())), ClientEvent::Joined(ack));
        assert_eq!(
            ClientEvent::from(ServerMessage::Error { message: "nope".into() }),
            ClientEvent::ServerError("nope".into())
        );
    }

    #[tokio::test]
    async fn test_client_initial_state() {
        let mut client = RealtimeClient::new("ws://127.0.0.1:1").with_origin("https://app.example");
        assert_eq!(client.connection_state().await, ConnectionState::Disconnected);
        assert!(client.take_event_rx().is_some());
        assert!(client.take_event_rx().is_none());
        assert!(matches!(client.heartbeat().await, Err(ClientError::NotConnected)));
    }
}
