//! Optimistic concurrency interceptor around the persistence layer.
//!
//! ```text
//!  caller ──► MutationInterceptor ──► MutationStore (compare-and-set)
//!                    │                         │
//!                    │   Ok(Some(record)) ◄────┘   Ok(None) ─► VersionConflict
//!                    ▼
//!               ChangeSink::dispatch("<model>:<action>", record)
//! ```
//!
//! The interceptor only *proposes* the next version; the store is the
//! linearization point and must apply "filter matches ⇒ write" atomically.
//! A change event is dispatched after, and only after, a committed write.
//! Commit and dispatch run under one ordering lock, so events leave in
//! commit order even on a multi-threaded runtime.

use async_trait::async_trait;
use serde_json::{Map, Value};
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::dispatch::ChangeSink;
use crate::record::{
    Action, ChangeEvent, EntityKind, NewRecord, Record, RecordFilter, Version, VersionedFilter,
    RESERVED_FIELDS,
};

/// User-facing text for a version conflict.
pub const CONFLICT_MESSAGE: &str = "Someone else changed this, please refresh.";

/// An update as handed to the store: augmented filter plus the new version.
#[derive(Debug, Clone, PartialEq)]
pub struct UpdateRequest {
    pub filter: VersionedFilter,
    pub changes: Map<String, Value>,
    pub next_version: Version,
}

/// The narrow persistence interface the interceptor wraps.
///
/// `update_where` and `delete_where` must evaluate the versioned filter and
/// apply the write as one atomic step, reporting "no record matched" as
/// `Ok(None)`.
#[async_trait]
pub trait MutationStore: Send + Sync {
    type Error: std::error::Error + Send + Sync + 'static;

    async fn insert(&self, kind: EntityKind, record: Record) -> Result<Record, Self::Error>;

    async fn update_where(
        &self,
        kind: EntityKind,
        request: UpdateRequest,
    ) -> Result<Option<Record>, Self::Error>;

    async fn delete_where(
        &self,
        kind: EntityKind,
        filter: VersionedFilter,
    ) -> Result<Option<Record>, Self::Error>;
}

/// Mutation failures.
#[derive(Debug, thiserror::Error)]
pub enum MutationError<E> {
    /// Zero records matched the criteria plus version equality: the record
    /// moved on or no longer exists.
    #[error("version conflict on {model} {id} (expected version {expected})")]
    VersionConflict {
        model: EntityKind,
        id: String,
        expected: Version,
    },
    /// Any other store failure, unchanged.
    #[error(transparent)]
    Store(E),
}

impl<E> MutationError<E> {
    pub fn is_conflict(&self) -> bool {
        matches!(self, MutationError::VersionConflict { .. })
    }

    /// HTTP status a host should answer with.
    pub fn status_code(&self) -> u16 {
        match self {
            MutationError::VersionConflict { .. } => 409,
            MutationError::Store(_) => 500,
        }
    }

    pub fn user_message(&self) -> &'static str {
        match self {
            MutationError::VersionConflict { .. } => CONFLICT_MESSAGE,
            MutationError::Store(_) => "Something went wrong, please try again.",
        }
    }
}

/// Interceptor counters.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MutationStats {
    pub committed: u64,
    pub conflicts: u64,
    pub store_errors: u64,
}

#[derive(Default)]
struct AtomicMutationStats {
    committed: AtomicU64,
    conflicts: AtomicU64,
    store_errors: AtomicU64,
}

/// Decorator that enforces version checks and broadcasts committed writes.
pub struct MutationInterceptor<S, D> {
    store: S,
    sink: D,
    /// Held from the store call through dispatch.
    commit_order: Mutex<()>,
    stats: AtomicMutationStats,
}

impl<S, D> MutationInterceptor<S, D>
where
    S: MutationStore,
    D: ChangeSink,
{
    pub fn new(store: S, sink: D) -> Self {
        Self {
            store,
            sink,
            commit_order: Mutex::new(()),
            stats: AtomicMutationStats::default(),
        }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn sink(&self) -> &D {
        &self.sink
    }

    pub fn into_store(self) -> S {
        self.store
    }

    pub fn stats(&self) -> MutationStats {
        MutationStats {
            committed: self.stats.committed.load(Ordering::Relaxed),
            conflicts: self.stats.conflicts.load(Ordering::Relaxed),
            store_errors: self.stats.store_errors.load(Ordering::Relaxed),
        }
    }

    /// Insert a new record at [`Version::INITIAL`]. No version check.
    pub async fn create(
        &self,
        kind: EntityKind,
        new: NewRecord,
    ) -> Result<Record, MutationError<S::Error>> {
        let mut fields = new.fields;
        fields.retain(|key, _| !RESERVED_FIELDS.contains(&key.as_str()));

        let record = Record {
            id: new.id.unwrap_or_else(|| Uuid::new_v4().to_string()),
            couple_id: new.couple_id,
            version: Version::INITIAL,
            fields,
        };

        let _ordered = self.commit_order.lock().await;
        let committed = self
            .store
            .insert(kind, record)
            .await
            .map_err(|e| self.store_error(kind, Action::Create, e))?;

        self.committed(kind, Action::Create, &committed).await;
        Ok(committed)
    }

    /// Apply `changes` if the record targeted by `filter` is still at
    /// `expected`; the stored version becomes `expected + 1`.
    pub async fn update(
        &self,
        kind: EntityKind,
        filter: RecordFilter,
        expected: Version,
        changes: Map<String, Value>,
    ) -> Result<Record, MutationError<S::Error>> {
        let id = filter.id.clone();
        let Some(next_version) = expected.next() else {
            log::warn!("Version of {kind} {id} cannot advance past {expected}");
            return Err(self.conflict(kind, id, expected));
        };

        let request = UpdateRequest {
            filter: filter.at_version(expected),
            changes,
            next_version,
        };

        let _ordered = self.commit_order.lock().await;
        let updated = self
            .store
            .update_where(kind, request)
            .await
            .map_err(|e| self.store_error(kind, Action::Update, e))?
            .ok_or_else(|| self.conflict(kind, id, expected))?;

        self.committed(kind, Action::Update, &updated).await;
        Ok(updated)
    }

    /// Delete the targeted record if it is still at `expected`.
    pub async fn delete(
        &self,
        kind: EntityKind,
        filter: RecordFilter,
        expected: Version,
    ) -> Result<Record, MutationError<S::Error>> {
        let id = filter.id.clone();
        let _ordered = self.commit_order.lock().await;
        let deleted = self
            .store
            .delete_where(kind, filter.at_version(expected))
            .await
            .map_err(|e| self.store_error(kind, Action::Delete, e))?
            .ok_or_else(|| self.conflict(kind, id, expected))?;

        self.committed(kind, Action::Delete, &deleted).await;
        Ok(deleted)
    }

    async fn committed(&self, kind: EntityKind, action: Action, record: &Record) {
        self.stats.committed.fetch_add(1, Ordering::Relaxed);
        let event = ChangeEvent::new(kind, action, record.clone());
        self.sink.dispatch(&event).await;
    }

    fn conflict(&self, kind: EntityKind, id: String, expected: Version) -> MutationError<S::Error> {
        self.stats.conflicts.fetch_add(1, Ordering::Relaxed);
        log::info!("Version conflict on {kind} {id}: expected version {expected}");
        MutationError::VersionConflict {
            model: kind,
            id,
            expected,
        }
    }

    fn store_error(&self, kind: EntityKind, action: Action, error: S::Error) -> MutationError<S::Error> {
        self.stats.store_errors.fetch_add(1, Ordering::Relaxed);
        log::warn!("Store rejected {kind}:{action}: {error}");
        MutationError::Store(error)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{MemoryStore, MemoryStoreError};
    use serde_json::json;
    use std::sync::Arc;
    use tokio::sync::Mutex;

    /// Sink that records every event it is handed.
    #[derive(Default)]
    struct RecordingSink {
        events: Mutex<Vec<ChangeEvent>>,
    }

    impl RecordingSink {
        async fn events(&self) -> Vec<ChangeEvent> {
            self.events.lock().await.clone()
        }
    }

    #[async_trait]
    impl ChangeSink for RecordingSink {
        async fn dispatch(&self, event: &ChangeEvent) -> usize {
            self.events.lock().await.push(event.clone());
            1
        }
    }

    #[derive(Debug, thiserror::Error)]
    #[error("connection reset")]
    struct Offline;

    /// Store whose every operation fails.
    struct OfflineStore;

    #[async_trait]
    impl MutationStore for OfflineStore {
        type Error = Offline;

        async fn insert(&self, _: EntityKind, _: Record) -> Result<Record, Offline> {
            Err(Offline)
        }

        async fn update_where(&self, _: EntityKind, _: UpdateRequest) -> Result<Option<Record>, Offline> {
            Err(Offline)
        }

        async fn delete_where(&self, _: EntityKind, _: VersionedFilter) -> Result<Option<Record>, Offline> {
            Err(Offline)
        }
    }

    fn changes(value: Value) -> Map<String, Value> {
        value.as_object().cloned().unwrap()
    }

    fn interceptor() -> (MutationInterceptor<MemoryStore, Arc<RecordingSink>>, Arc<RecordingSink>) {
        let sink = Arc::new(RecordingSink::default());
        (MutationInterceptor::new(MemoryStore::new(), sink.clone()), sink)
    }

    #[tokio::test]
    async fn test_create_starts_at_initial_version() {
        let (interceptor, sink) = interceptor();
        let created = interceptor
            .create(
                EntityKind::Task,
                NewRecord::for_couple("couple-1")
                    .with_field("title", json!("Book dinner"))
                    .with_field("version", json!(42)),
            )
            .await
            .unwrap();

        assert_eq!(created.version, Version::INITIAL);
        assert!(!created.id.is_empty());
        assert!(created.field("version").is_none());

        let events = sink.events().await;
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].channel(), "task:create");
        assert_eq!(events[0].payload, created);
    }

    #[tokio::test]
    async fn test_update_increments_version_and_broadcasts() {
        let (interceptor, sink) = interceptor();
        let created = interceptor
            .create(EntityKind::Task, NewRecord::for_couple("couple-1").with_id("t1"))
            .await
            .unwrap();

        let updated = interceptor
            .update(
                EntityKind::Task,
                RecordFilter::by_id("t1").in_couple("couple-1"),
                created.version,
                changes(json!({ "done": true })),
            )
            .await
            .unwrap();

        assert_eq!(updated.version, Version::new(2));
        assert_eq!(updated.field("done"), Some(&json!(true)));

        let events = sink.events().await;
        assert_eq!(events.len(), 2);
        assert_eq!(events[1].channel(), "task:update");
        assert_eq!(events[1].payload, updated);
        assert_eq!(interceptor.store().find(EntityKind::Task, "t1").await, Some(updated));
    }

    #[tokio::test]
    async fn test_stale_update_conflicts_without_broadcast() {
        let (interceptor, sink) = interceptor();
        interceptor
            .create(EntityKind::Memory, NewRecord::for_couple("c").with_id("m1"))
            .await
            .unwrap();
        interceptor
            .update(EntityKind::Memory, RecordFilter::by_id("m1"), Version::new(1), Map::new())
            .await
            .unwrap();

        let err = interceptor
            .update(
                EntityKind::Memory,
                RecordFilter::by_id("m1"),
                Version::new(1),
                changes(json!({ "caption": "stale" })),
            )
            .await
            .unwrap_err();

        assert!(err.is_conflict());
        assert_eq!(err.status_code(), 409);
        assert_eq!(err.user_message(), CONFLICT_MESSAGE);
        assert_eq!(sink.events().await.len(), 2);

        let stored = interceptor.store().find(EntityKind::Memory, "m1").await.unwrap();
        assert_eq!(stored.version, Version::new(2));
        assert!(stored.field("caption").is_none());
    }

    #[tokio::test]
    async fn test_missing_record_is_a_conflict() {
        let (interceptor, sink) = interceptor();
        let err = interceptor
            .delete(EntityKind::Task, RecordFilter::by_id("ghost"), Version::new(1))
            .await
            .unwrap_err();
        match err {
            MutationError::VersionConflict { model, id, expected } => {
                assert_eq!(model, EntityKind::Task);
                assert_eq!(id, "ghost");
                assert_eq!(expected, Version::new(1));
            }
            other => panic!("Expected conflict, got {other:?}"),
        }
        assert!(sink.events().await.is_empty());
    }

    #[tokio::test]
    async fn test_couple_scope_is_part_of_the_filter() {
        let (interceptor, sink) = interceptor();
        interceptor
            .create(EntityKind::Task, NewRecord::for_couple("couple-1").with_id("t1"))
            .await
            .unwrap();

        let err = interceptor
            .update(
                EntityKind::Task,
                RecordFilter::by_id("t1").in_couple("couple-2"),
                Version::INITIAL,
                Map::new(),
            )
            .await
            .unwrap_err();
        assert!(err.is_conflict());
        assert_eq!(sink.events().await.len(), 1);
    }

    #[tokio::test]
    async fn test_delete_with_current_version() {
        let (interceptor, sink) = interceptor();
        interceptor
            .create(EntityKind::SyncEntry, NewRecord::for_couple("c").with_id("s1"))
            .await
            .unwrap();

        let deleted = interceptor
            .delete(EntityKind::SyncEntry, RecordFilter::by_id("s1"), Version::INITIAL)
            .await
            .unwrap();
        assert_eq!(deleted.id, "s1");
        assert_eq!(interceptor.store().find(EntityKind::SyncEntry, "s1").await, None);

        let events = sink.events().await;
        assert_eq!(events.last().unwrap().channel(), "syncentry:delete");
    }

    #[tokio::test]
    async fn test_duplicate_create_propagates_store_error() {
        let (interceptor, sink) = interceptor();
        interceptor
            .create(EntityKind::Task, NewRecord::default().with_id("t1"))
            .await
            .unwrap();
        let err = interceptor
            .create(EntityKind::Task, NewRecord::default().with_id("t1"))
            .await
            .unwrap_err();

        assert!(matches!(err, MutationError::Store(MemoryStoreError::Duplicate { .. })));
        assert_eq!(err.status_code(), 500);
        assert_eq!(sink.events().await.len(), 1);
    }

    #[tokio::test]
    async fn test_store_failures_never_broadcast() {
        let sink = Arc::new(RecordingSink::default());
        let interceptor = MutationInterceptor::new(OfflineStore, sink.clone());

        let create = interceptor.create(EntityKind::Task, NewRecord::default()).await;
        let update = interceptor
            .update(EntityKind::Task, RecordFilter::by_id("t"), Version::INITIAL, Map::new())
            .await;
        let delete = interceptor
            .delete(EntityKind::Task, RecordFilter::by_id("t"), Version::INITIAL)
            .await;

        for result in [create, update, delete] {
            let err = result.unwrap_err();
            assert!(!err.is_conflict());
            assert_eq!(err.to_string(), "connection reset");
        }
        assert!(sink.events().await.is_empty());
        assert_eq!(interceptor.stats().store_errors, 3);
    }

    #[tokio::test]
    async fn test_version_cannot_overflow() {
        let (interceptor, sink) = interceptor();
        let err = interceptor
            .update(EntityKind::Task, RecordFilter::by_id("t"), Version::new(u64::MAX), Map::new())
            .await
            .unwrap_err();
        assert!(err.is_conflict());
        assert!(sink.events().await.is_empty());
    }

    #[tokio::test]
    async fn test_concurrent_updates_exactly_one_wins() {
        let sink = Arc::new(RecordingSink::default());
        let interceptor = Arc::new(MutationInterceptor::new(MemoryStore::new(), sink.clone()));
        interceptor
            .create(EntityKind::Task, NewRecord::for_couple("c").with_id("t1"))
            .await
            .unwrap();

        let a = {
            let interceptor = interceptor.clone();
            tokio::spawn(async move {
                interceptor
                    .update(EntityKind::Task, RecordFilter::by_id("t1"), Version::INITIAL, changes(json!({ "by": "a" })))
                    .await
            })
        };
        let b = {
            let interceptor = interceptor.clone();
            tokio::spawn(async move {
                interceptor
                    .update(EntityKind::Task, RecordFilter::by_id("t1"), Version::INITIAL, changes(json!({ "by": "b" })))
                    .await
            })
        };

        let results = [a.await.unwrap(), b.await.unwrap()];
        let wins = results.iter().filter(|r| r.is_ok()).count();
        let conflicts = results
            .iter()
            .filter(|r| matches!(r, Err(e) if e.is_conflict()))
            .count();
        assert_eq!((wins, conflicts), (1, 1));

        let stored = interceptor.store().find(EntityKind::Task, "t1").await.unwrap();
        assert_eq!(stored.version, Version::new(2));
        assert_eq!(sink.events().await.len(), 2);

        let stats = interceptor.stats();
        assert_eq!(stats.committed, 2);
        assert_eq!(stats.conflicts, 1);
    }

    /// Sink that stalls on its second event, after the write has committed.
    #[derive(Default)]
    struct StallingSink {
        versions: Mutex<Vec<u64>>,
        stalled: tokio::sync::Notify,
    }

    #[async_trait]
    impl ChangeSink for StallingSink {
        async fn dispatch(&self, event: &ChangeEvent) -> usize {
            let calls = self.versions.lock().await.len();
            if calls == 1 {
                self.stalled.notify_one();
                tokio::time::sleep(std::time::Duration::from_millis(50)).await;
            }
            self.versions.lock().await.push(event.payload.version.get());
            1
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_events_follow_commit_order() {
        let sink = Arc::new(StallingSink::default());
        let interceptor = Arc::new(MutationInterceptor::new(MemoryStore::new(), sink.clone()));
        interceptor
            .create(EntityKind::Task, NewRecord::for_couple("c").with_id("t1"))
            .await
            .unwrap();

        let first = {
            let interceptor = interceptor.clone();
            tokio::spawn(async move {
                interceptor
                    .update(EntityKind::Task, RecordFilter::by_id("t1"), Version::new(1), Map::new())
                    .await
            })
        };

        // Version 2 is committed; its event is still in flight.
        sink.stalled.notified().await;
        interceptor
            .update(EntityKind::Task, RecordFilter::by_id("t1"), Version::new(2), Map::new())
            .await
            .unwrap();
        first.await.unwrap().unwrap();

        assert_eq!(*sink.versions.lock().await, vec![1, 2, 3]);
    }
}
