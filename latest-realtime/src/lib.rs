//! # latest-realtime: Realtime sync core for couple-scoped data
//!
//! Authenticated WebSocket sessions grouped into per-couple rooms, with
//! optimistic-concurrency writes that broadcast a change event only after
//! they commit.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────┐   WebSocket (JSON)   ┌──────────────┐
//! │RealtimeClient│ ◄──────────────────► │RealtimeServer│
//! │ + Reconciler │   {event, data}      │ (auth gate)  │
//! └──────────────┘                      └──────┬───────┘
//!                                              │
//!        write ──► MutationInterceptor         ▼
//!                  (version compare-and-set) RoomManager
//!                        │                  (room per coupleId)
//!                        ▼                     ▲
//!                  MutationStore               │
//!                  (memory / RocksDB)          │
//!                        │ commit              │
//!                        └──► BroadcastDispatcher
//! ```
//!
//! ## Modules
//!
//! - [`auth`]: Handshake gate: origin allow-list + bearer token
//! - [`token`]: HS256 token signing and verification
//! - [`protocol`]: `{event, data}` envelopes and typed messages
//! - [`record`]: Versioned records, filters and change events
//! - [`room`]: Couple rooms, presence and activity fan-out
//! - [`dispatch`]: Change event broadcast to rooms
//! - [`interceptor`]: Optimistic concurrency on create/update/delete
//! - [`store`]: In-memory and RocksDB persistence
//! - [`server`]: WebSocket server with heartbeat and health stats
//! - [`client`]: WebSocket client and cache reconciler

pub mod auth;
pub mod client;
pub mod dispatch;
pub mod interceptor;
pub mod protocol;
pub mod record;
pub mod room;
pub mod server;
pub mod store;
pub mod token;

// Re-exports for convenience
pub use auth::{AuthError, AuthSettings, Authenticator, Handshake, Identity};
pub use client::{
    CacheReconciler, ClientError, ClientEvent, ConnectionState, RealtimeClient, Reconciled,
};
pub use dispatch::{BroadcastDispatcher, ChangeSink, DispatchStats};
pub use interceptor::{
    MutationError, MutationInterceptor, MutationStats, MutationStore, UpdateRequest,
    CONFLICT_MESSAGE,
};
pub use protocol::{
    ClientMessage, Envelope, JoinAck, JoinRequest, MemberPresence, PresenceEvent, ProtocolError,
    ServerMessage,
};
pub use record::{
    Action, ChangeEvent, EntityKind, NewRecord, Record, RecordFilter, Version, VersionedFilter,
};
pub use room::{ConnectionId, Frame, RoomError, RoomManager, RoomStats};
pub use server::{RealtimeServer, ServerConfig, ServerStats};
pub use store::{MemoryStore, MemoryStoreError, RocksStore, RocksStoreConfig, RocksStoreError};
pub use token::{Claims, CredentialVerifier, Hs256Verifier, TokenError};
