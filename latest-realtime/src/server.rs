//! WebSocket server: authenticated sessions routed into couple rooms.
//!
//! Architecture:
//! ```text
//! upgrade ──► Authenticator ──► session ──► RoomManager ── room(coupleId) ──┐
//!   (403/401/500 on reject)        │                                        │
//!                                  │   MutationInterceptor ─► Dispatcher ───┤
//!                                  │                                        ▼
//!                                  └────────────── select! ◄── room frames + global frames
//! ```
//!
//! Each session multiplexes four sources on one task: inbound socket
//! messages, its room's broadcast receiver (once joined), the global
//! receiver, and a heartbeat ticker that closes unresponsive sockets.

use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast::error::RecvError;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::StatusCode;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;

use crate::auth::{AuthError, AuthSettings, Authenticator, Handshake, Identity};
use crate::dispatch::BroadcastDispatcher;
use crate::interceptor::{MutationInterceptor, MutationStore};
use crate::protocol::{ClientMessage, Envelope, ServerMessage};
use crate::room::{ConnectionId, Frame, FrameReceiver, RoomError, RoomManager};

pub const ENV_BIND_ADDR: &str = "REALTIME_BIND_ADDR";
pub const ENV_PORT: &str = "PORT";

pub type BoxError = Box<dyn std::error::Error + Send + Sync>;
type WsSink = SplitSink<WebSocketStream<TcpStream>, Message>;

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind to
    pub bind_addr: String,
    /// Broadcast channel capacity per room
    pub broadcast_capacity: usize,
    /// Heartbeat interval in seconds
    pub heartbeat_interval_secs: u64,
    /// Handshake authentication settings
    pub auth: AuthSettings,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:3000".to_string(),
            broadcast_capacity: 256,
            heartbeat_interval_secs: 30,
            auth: AuthSettings::default(),
        }
    }
}

impl ServerConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// `REALTIME_BIND_ADDR`, else `0.0.0.0:$PORT`, else the default address.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();
        let bind_addr = lookup(ENV_BIND_ADDR)
            .filter(|addr| !addr.trim().is_empty())
            .or_else(|| {
                lookup(ENV_PORT)
                    .and_then(|port| port.trim().parse::<u16>().ok())
                    .map(|port| format!("0.0.0.0:{port}"))
            })
            .unwrap_or(defaults.bind_addr);

        Self {
            bind_addr,
            auth: AuthSettings::from_lookup(&lookup),
            ..defaults
        }
    }
}

/// Health snapshot.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ServerStats {
    pub auth_ready: bool,
    pub total_connections: u64,
    pub active_connections: u64,
    pub rejected_handshakes: u64,
    pub messages_received: u64,
    pub active_rooms: usize,
    pub events_dispatched: u64,
    pub deliveries: u64,
    pub frames_dropped: u64,
}

#[derive(Default)]
struct AtomicServerStats {
    total_connections: AtomicU64,
    active_connections: AtomicU64,
    rejected_handshakes: AtomicU64,
    messages_received: AtomicU64,
    frames_dropped: AtomicU64,
}

struct ServerState {
    config: ServerConfig,
    auth: Authenticator,
    rooms: Arc<RoomManager>,
    dispatcher: BroadcastDispatcher,
    stats: AtomicServerStats,
}

/// The realtime server.
pub struct RealtimeServer {
    state: Arc<ServerState>,
}

impl RealtimeServer {
    /// Build the server; authentication problems are logged here, once.
    pub fn new(config: ServerConfig) -> Self {
        let auth = Authenticator::new(config.auth.clone());
        Self::with_authenticator(config, auth)
    }

    pub fn with_authenticator(config: ServerConfig, auth: Authenticator) -> Self {
        let rooms = Arc::new(RoomManager::new(config.broadcast_capacity));
        let dispatcher = BroadcastDispatcher::new(rooms.clone());
        Self {
            state: Arc::new(ServerState {
                config,
                auth,
                rooms,
                dispatcher,
                stats: AtomicServerStats::default(),
            }),
        }
    }

    pub fn bind_addr(&self) -> &str {
        &self.state.config.bind_addr
    }

    pub fn rooms(&self) -> &Arc<RoomManager> {
        &self.state.rooms
    }

    /// Dispatcher bound to this server's rooms.
    pub fn dispatcher(&self) -> BroadcastDispatcher {
        self.state.dispatcher.clone()
    }

    /// Wrap `store` so committed writes reach this server's clients.
    pub fn interceptor<S: MutationStore>(&self, store: S) -> MutationInterceptor<S, BroadcastDispatcher> {
        MutationInterceptor::new(store, self.dispatcher())
    }

    pub async fn health(&self) -> ServerStats {
        let stats = &self.state.stats;
        let dispatch = self.state.dispatcher.stats();
        ServerStats {
            auth_ready: self.state.auth.is_ready(),
            total_connections: stats.total_connections.load(Ordering::Relaxed),
            active_connections: stats.active_connections.load(Ordering::Relaxed),
            rejected_handshakes: stats.rejected_handshakes.load(Ordering::Relaxed),
            messages_received: stats.messages_received.load(Ordering::Relaxed),
            active_rooms: self.state.rooms.room_count().await,
            events_dispatched: dispatch.events_dispatched,
            deliveries: dispatch.deliveries,
            frames_dropped: stats.frames_dropped.load(Ordering::Relaxed),
        }
    }

    /// Bind the configured address and serve until the listener fails.
    pub async fn run(&self) -> Result<(), BoxError> {
        let listener = TcpListener::bind(&self.state.config.bind_addr).await?;
        log::info!("Realtime server listening on {}", self.state.config.bind_addr);
        self.serve(listener).await
    }

    /// Accept connections from an already bound listener.
    pub async fn serve(&self, listener: TcpListener) -> Result<(), BoxError> {
        loop {
            let (stream, addr) = listener.accept().await?;
            log::debug!("New TCP connection from {addr}");

            let state = self.state.clone();
            tokio::spawn(async move {
                if let Err(e) = Self::handle_connection(stream, addr, state).await {
                    log::error!("Connection error from {addr}: {e}");
                }
            });
        }
    }

    /// Authenticate the upgrade, then run the session to completion.
    async fn handle_connection(
        stream: TcpStream,
        addr: SocketAddr,
        state: Arc<ServerState>,
    ) -> Result<(), BoxError> {
        let mut verdict: Option<Result<Identity, AuthError>> = None;
        let callback = |request: &Request, response: Response| -> Result<Response, ErrorResponse> {
            match state.auth.authenticate(&handshake_from_request(request)) {
                Ok(identity) => {
                    verdict = Some(Ok(identity));
                    Ok(response)
                }
                Err(e) => {
                    let mut rejection = ErrorResponse::new(Some(e.to_string()));
                    *rejection.status_mut() =
                        StatusCode::from_u16(e.status_code()).unwrap_or(StatusCode::UNAUTHORIZED);
                    verdict = Some(Err(e));
                    Err(rejection)
                }
            }
        };
        let accepted = tokio_tungstenite::accept_hdr_async(stream, callback).await;

        let (ws_stream, identity) = match (accepted, verdict) {
            (Ok(ws_stream), Some(Ok(identity))) => {
                log::info!(
                    "WebSocket connection established from {addr} (subject {:?}, role {:?})",
                    identity.subject,
                    identity.role
                );
                (ws_stream, identity)
            }
            (_, Some(Err(e))) => {
                state.stats.rejected_handshakes.fetch_add(1, Ordering::Relaxed);
                log::warn!("Rejected connection from {addr}: {e}");
                return Ok(());
            }
            (Err(e), _) => return Err(e.into()),
            (Ok(_), None) => return Err("handshake completed without a verdict".into()),
        };

        state.stats.total_connections.fetch_add(1, Ordering::Relaxed);
        state.stats.active_connections.fetch_add(1, Ordering::Relaxed);

        let connection = ConnectionId::new();
        let global_rx = state.rooms.register(connection, identity.clone()).await;
        let session = Session {
            connection,
            identity,
            addr,
            state: state.as_ref(),
        };
        let outcome = session.run(ws_stream, global_rx).await;

        match state.rooms.unregister(connection).await {
            Ok(Some(couple_id)) => log::info!("Connection {connection} left couple {couple_id} on disconnect"),
            Ok(None) => {}
            Err(e) => log::warn!("Cleanup for {connection} failed: {e}"),
        }
        state.stats.active_connections.fetch_sub(1, Ordering::Relaxed);
        log::info!("Connection closed from {addr}");
        outcome
    }
}

/// Per-connection session loop.
struct Session<'a> {
    connection: ConnectionId,
    identity: Identity,
    addr: SocketAddr,
    state: &'a ServerState,
}

impl Session<'_> {
    async fn run(
        &self,
        ws_stream: WebSocketStream<TcpStream>,
        mut global_rx: FrameReceiver,
    ) -> Result<(), BoxError> {
        let (mut ws_sender, mut ws_receiver) = ws_stream.split();
        let mut room_rx: Option<FrameReceiver> = None;

        let period = Duration::from_secs(self.state.config.heartbeat_interval_secs.max(1));
        let mut heartbeat = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
        let mut awaiting_pong = false;

        loop {
            tokio::select! {
                msg = ws_receiver.next() => {
                    match msg {
                        Some(Ok(Message::Text(text))) => {
                            self.state.stats.messages_received.fetch_add(1, Ordering::Relaxed);
                            let replies = self.handle_text(text.as_str(), &mut room_rx).await;
                            for reply in replies {
                                ws_sender.send(Message::Text(reply.into())).await?;
                            }
                        }
                        Some(Ok(Message::Ping(data))) => {
                            ws_sender.send(Message::Pong(data)).await?;
                        }
                        Some(Ok(Message::Pong(_))) => {
                            awaiting_pong = false;
                        }
                        Some(Ok(Message::Close(_))) | None => break,
                        Some(Ok(Message::Binary(_))) => {
                            log::debug!("Ignoring binary frame from {}", self.addr);
                        }
                        Some(Ok(_)) => {}
                        Some(Err(e)) => {
                            log::warn!("WebSocket error from {}: {e}", self.addr);
                            break;
                        }
                    }
                }

                frame = async {
                    match room_rx.as_mut() {
                        Some(rx) => rx.recv().await,
                        None => std::future::pending().await,
                    }
                } => {
                    match frame {
                        Ok(frame) => self.forward(&mut ws_sender, frame).await?,
                        Err(RecvError::Lagged(n)) => self.lagged(n),
                        Err(RecvError::Closed) => room_rx = None,
                    }
                }

                frame = global_rx.recv() => {
                    match frame {
                        Ok(frame) => self.forward(&mut ws_sender, frame).await?,
                        Err(RecvError::Lagged(n)) => self.lagged(n),
                        Err(RecvError::Closed) => break,
                    }
                }

                _ = heartbeat.tick() => {
                    if awaiting_pong {
                        log::info!("Closing unresponsive connection {} from {}", self.connection, self.addr);
                        break;
                    }
                    ws_sender.send(Message::Ping(Default::default())).await?;
                    awaiting_pong = true;
                }
            }
        }

        let _ = ws_sender.close().await;
        Ok(())
    }

    /// Handle one inbound text frame; returns frames to send back.
    async fn handle_text(&self, text: &str, room_rx: &mut Option<FrameReceiver>) -> Vec<String> {
        let message = match ClientMessage::decode(text) {
            Ok(message) => message,
            Err(e) => {
                log::warn!("Failed to decode message from {}: {e}", self.addr);
                return error_frame(e.to_string());
            }
        };

        match message {
            ClientMessage::Join(request) => {
                if let Some(subject) = self.identity.subject.as_deref() {
                    if subject != request.user_id {
                        log::warn!(
                            "Connection {} joined as user {} but authenticated as {}",
                            self.connection,
                            request.user_id,
                            subject
                        );
                    }
                }
                match self.state.rooms.join(self.connection, &request).await {
                    Ok(outcome) => {
                        *room_rx = Some(outcome.receiver);
                        encoded(ServerMessage::Joined(outcome.ack))
                    }
                    Err(e) => error_frame(e.to_string()),
                }
            }
            ClientMessage::Activity(activity) => {
                match self.state.rooms.publish_activity(self.connection, activity).await {
                    Ok(_) => Vec::new(),
                    Err(RoomError::NotJoined(_)) => error_frame("Join a couple before sending activity"),
                    Err(e) => error_frame(e.to_string()),
                }
            }
            ClientMessage::Heartbeat => encoded(ServerMessage::HeartbeatAck {
                timestamp: unix_millis(),
            }),
            ClientMessage::Announce { channel, payload } => {
                if !self.identity.is_admin() {
                    log::warn!("Connection {} attempted a broadcast without admin role", self.connection);
                    return error_frame("Forbidden: admin role required");
                }
                // A couple-scoped payload stays in that couple's room.
                let scope = payload
                    .get("coupleId")
                    .and_then(Value::as_str)
                    .map(str::to_string);
                let delivered = self
                    .state
                    .dispatcher
                    .dispatch_message(
                        scope.as_deref(),
                        &ServerMessage::Other(Envelope::new(channel.clone(), payload)),
                    )
                    .await;
                log::info!(
                    "Admin broadcast on {channel} to {} reached {delivered} connection(s)",
                    scope.as_deref().unwrap_or("<all>")
                );
                Vec::new()
            }
        }
    }

    async fn forward(&self, ws_sender: &mut WsSink, frame: Frame) -> Result<(), BoxError> {
        if frame.is_for(self.connection) {
            ws_sender.send(Message::Text(frame.text.to_string().into())).await?;
        }
        Ok(())
    }

    fn lagged(&self, n: u64) {
        self.state.stats.frames_dropped.fetch_add(n, Ordering::Relaxed);
        log::warn!("Connection {} lagged by {n} frames", self.connection);
    }
}

fn encoded(message: ServerMessage) -> Vec<String> {
    match message.encode() {
        Ok(text) => vec![text],
        Err(e) => {
            log::error!("Failed to encode reply: {e}");
            Vec::new()
        }
    }
}

fn error_frame(message: impl Into<String>) -> Vec<String> {
    encoded(ServerMessage::Error {
        message: message.into(),
    })
}

fn unix_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}

/// Pull origin, `token` query parameter and `Authorization` out of the upgrade.
fn handshake_from_request(request: &Request) -> Handshake {
    let header = |name: &str| {
        request
            .headers()
            .get(name)
            .and_then(|value| value.to_str().ok())
            .map(str::to_string)
    };
    Handshake {
        origin: header("origin"),
        auth_token: request.uri().query().and_then(|query| query_param(query, "token")),
        authorization: header("authorization"),
    }
}

fn query_param(query: &str, name: &str) -> Option<String> {
    query
        .split('&')
        .filter_map(|pair| pair.split_once('='))
        .find(|(key, _)| *key == name)
        .map(|(_, value)| percent_decode(value))
}

fn percent_decode(value: &str) -> String {
    let bytes = value.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'+' => out.push(b' '),
            b'%' if i + 2 < bytes.len() => {
                let decoded = std::str::from_utf8(&bytes[i + 1..i + 3])
                    .ok()
                    .and_then(|hex| u8::from_str_radix(hex, 16).ok());
                match decoded {
                    Some(byte) => {
                        out.push(byte);
                        i += 2;
                    }
                    None => out.push(b'%'),
                }
            }
            byte => out.push(byte),
        }
        i += 1;
    }
    String::from_utf8_lossy(&out).into_owned()
}
