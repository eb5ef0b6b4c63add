//! Broadcast dispatcher: committed change events → room or global fan-out.
//!
//! Delivery is fire-and-forget. A connection that is not subscribed at the
//! moment of dispatch simply misses the event.

use async_trait::async_trait;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::protocol::ServerMessage;
use crate::record::ChangeEvent;
use crate::room::RoomManager;

/// Receiver of committed change events.
#[async_trait]
pub trait ChangeSink: Send + Sync {
    /// Fan out `event`; returns the number of receivers reached.
    async fn dispatch(&self, event: &ChangeEvent) -> usize;
}

#[async_trait]
impl<T: ChangeSink + ?Sized> ChangeSink for Arc<T> {
    async fn dispatch(&self, event: &ChangeEvent) -> usize {
        (**self).dispatch(event).await
    }
}

/// Dispatcher counters.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DispatchStats {
    pub events_dispatched: u64,
    pub deliveries: u64,
    pub encode_failures: u64,
}

#[derive(Default)]
struct AtomicDispatchStats {
    events_dispatched: AtomicU64,
    deliveries: AtomicU64,
    encode_failures: AtomicU64,
}

/// Routes change events through the [`RoomManager`].
///
/// Events whose payload carries a `coupleId` go to that couple's room only;
/// everything else is administrative and reaches every connection.
#[derive(Clone)]
pub struct BroadcastDispatcher {
    rooms: Arc<RoomManager>,
    stats: Arc<AtomicDispatchStats>,
}

impl BroadcastDispatcher {
    pub fn new(rooms: Arc<RoomManager>) -> Self {
        Self {
            rooms,
            stats: Arc::new(AtomicDispatchStats::default()),
        }
    }

    pub fn rooms(&self) -> &Arc<RoomManager> {
        &self.rooms
    }

    pub fn stats(&self) -> DispatchStats {
        DispatchStats {
            events_dispatched: self.stats.events_dispatched.load(Ordering::Relaxed),
            deliveries: self.stats.deliveries.load(Ordering::Relaxed),
            encode_failures: self.stats.encode_failures.load(Ordering::Relaxed),
        }
    }

    /// Encode once and hand the frame to the target room(s).
    pub async fn dispatch_message(&self, couple_id: Option<&str>, message: &ServerMessage) -> usize {
        let text: Arc<str> = match message.encode() {
            Ok(text) => Arc::from(text),
            Err(e) => {
                self.stats.encode_failures.fetch_add(1, Ordering::Relaxed);
                log::warn!("Dropping undeliverable event: {e}");
                return 0;
            }
        };

        let delivered = match couple_id {
            Some(couple_id) => self.rooms.broadcast(couple_id, text).await,
            None => self.rooms.broadcast_all(text),
        };

        self.stats.events_dispatched.fetch_add(1, Ordering::Relaxed);
        self.stats
            .deliveries
            .fetch_add(delivered as u64, Ordering::Relaxed);
        delivered
    }
}

#[async_trait]
impl ChangeSink for BroadcastDispatcher {
    async fn dispatch(&self, event: &ChangeEvent) -> usize {
        let couple_id = event.couple_id();
        let delivered = self
            .dispatch_message(couple_id, &ServerMessage::Change(event.clone()))
            .await;
        log::debug!(
            "Dispatched {} for {} to {} receiver(s) in {}",
            event.channel(),
            event.payload.id,
            delivered,
            couple_id.unwrap_or("<all>")
        );
        delivered
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::Identity;
    use crate::protocol::JoinRequest;
    use crate::record::{Action, EntityKind, Record, Version};
    use crate::room::ConnectionId;
    use serde_json::Map;
    use tokio::sync::broadcast::error::TryRecvError;

    fn record(couple: Option<&str>) -> Record {
        Record {
            id: "task-1".into(),
            couple_id: couple.map(str::to_string),
            version: Version::new(3),
            fields: Map::new(),
        }
    }

    async fn member_of(rooms: &RoomManager, couple: &str) -> crate::room::FrameReceiver {
        let id = ConnectionId::new();
        let _global = rooms.register(id, Identity::default()).await;
        rooms
            .join(
                id,
                &JoinRequest {
                    user_id: "u".into(),
                    couple_id: couple.into(),
                    partner_role: "partner_a".into(),
                    name: couple.into(),
                },
            )
            .await
            .unwrap()
            .receiver
    }

    #[tokio::test]
    async fn test_dispatch_scoped_to_couple_room() {
        let rooms = Arc::new(RoomManager::new(16));
        let mut rx_a = member_of(&rooms, "couple-a").await;
        let mut rx_b = member_of(&rooms, "couple-b").await;
        let dispatcher = BroadcastDispatcher::new(rooms);

        let event = ChangeEvent::new(EntityKind::Task, Action::Update, record(Some("couple-a")));
        assert_eq!(dispatcher.dispatch(&event).await, 1);

        let frame = rx_a.try_recv().unwrap();
        match ServerMessage::decode(&frame.text).unwrap() {
            ServerMessage::Change(received) => assert_eq!(received, event),
            other => panic!("Expected change, got {other:?}"),
        }
        assert!(matches!(rx_b.try_recv(), Err(TryRecvError::Empty)));

        let stats = dispatcher.stats();
        assert_eq!(stats.events_dispatched, 1);
        assert_eq!(stats.deliveries, 1);
    }

    #[tokio::test]
    async fn test_unscoped_event_goes_global() {
        let rooms = Arc::new(RoomManager::new(16));
        let mut global1 = rooms.register(ConnectionId::new(), Identity::default()).await;
        let mut global2 = rooms.register(ConnectionId::new(), Identity::default()).await;
        let dispatcher = BroadcastDispatcher::new(rooms);

        let event = ChangeEvent::new(EntityKind::Notification, Action::Create, record(None));
        assert_eq!(dispatcher.dispatch(&event).await, 2);
        assert!(global1.try_recv().unwrap().text.contains("notification:create"));
        assert!(global2.try_recv().unwrap().text.contains("notification:create"));
    }

    #[tokio::test]
    async fn test_dispatch_to_empty_room_is_silent() {
        let dispatcher = BroadcastDispatcher::new(Arc::new(RoomManager::new(16)));
        let event = ChangeEvent::new(EntityKind::Memory, Action::Delete, record(Some("nobody-home")));
        assert_eq!(dispatcher.dispatch(&event).await, 0);
        assert_eq!(dispatcher.stats().events_dispatched, 1);
    }

    #[tokio::test]
    async fn test_arc_sink_forwards() {
        let rooms = Arc::new(RoomManager::new(16));
        let mut rx = member_of(&rooms, "couple-a").await;
        let sink: Arc<dyn ChangeSink> = Arc::new(BroadcastDispatcher::new(rooms));

        let event = ChangeEvent::new(EntityKind::Task, Action::Create, record(Some("couple-a")));
        assert_eq!(sink.dispatch(&event).await, 1);
        assert!(rx.try_recv().is_ok());
    }
}
