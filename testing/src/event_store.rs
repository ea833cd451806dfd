//! In-memory event store.

#![allow(clippy::unwrap_used)] // Test infrastructure uses unwrap for simplicity
#![allow(clippy::missing_panics_doc)] // Panics only on poisoned locks

use eventide_core::environment::{Clock, SystemClock};
use eventide_core::event::StoredEvent;
use eventide_core::event_store::{
    AppendGroup, EventStore, EventStoreError, EventStream, StoreFuture, validate_groups,
};
use eventide_core::search::{SearchQuery, SortOrder};
use eventide_core::stream::{AggregateKey, Position, Sequence};
use std::fmt;
use std::sync::{Arc, Mutex};

#[derive(Default)]
struct Log {
    events: Vec<StoredEvent>,
    failures: usize,
}

impl Log {
    fn current_sequence(&self, key: &AggregateKey) -> Sequence {
        self.events
            .iter()
            .rev()
            .find(|e| e.meta.key == *key)
            .map_or(Sequence::INITIAL, |e| e.meta.sequence)
    }

    fn last_position(&self) -> Position {
        self.events
            .last()
            .map_or(Position::BEGINNING, |e| e.meta.position)
    }
}

/// In-memory event store for fast, deterministic testing.
///
/// Appends are serialized by one mutex, so global positions follow commit
/// order and batches are all-or-nothing. Clones share the same log.
///
/// # Example
///
/// ```
/// use eventide_core::event::PendingEvent;
/// use eventide_core::event_store::{AppendGroup, EventStore};
/// use eventide_core::stream::{AggregateKey, Sequence};
/// use eventide_testing::InMemoryEventStore;
///
/// # tokio_test::block_on(async {
/// let store = InMemoryEventStore::new();
/// let key = AggregateKey::new("inst", "org", "org-1");
/// store
///     .append(vec![AppendGroup::new(
///         key.clone(),
///         Sequence::INITIAL,
///         vec![PendingEvent::new("org.added", "org-1", "admin", vec![])],
///     )])
///     .await
///     .unwrap();
/// assert_eq!(store.current_sequence(&key).await.unwrap(), Sequence::new(1));
/// # });
/// ```
#[derive(Clone)]
pub struct InMemoryEventStore {
    log: Arc<Mutex<Log>>,
    clock: Arc<dyn Clock>,
}

impl InMemoryEventStore {
    /// Empty store stamping events with the system clock.
    #[must_use]
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    /// Empty store stamping events with `clock`.
    #[must_use]
    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            log: Arc::new(Mutex::new(Log::default())),
            clock,
        }
    }

    /// Make the next `count` appends fail with a transient database error.
    pub fn fail_next_appends(&self, count: usize) {
        self.log.lock().unwrap().failures = count;
    }

    /// Every committed event in commit order.
    #[must_use]
    pub fn events(&self) -> Vec<StoredEvent> {
        self.log.lock().unwrap().events.clone()
    }

    /// Number of committed events.
    #[must_use]
    pub fn len(&self) -> usize {
        self.log.lock().unwrap().events.len()
    }

    /// Whether no event was committed yet.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.log.lock().unwrap().events.is_empty()
    }

    fn append_sync(&self, groups: Vec<AppendGroup>) -> Result<Vec<StoredEvent>, EventStoreError> {
        validate_groups(&groups)?;
        let mut log = self.log.lock().unwrap();

        if log.failures > 0 {
            log.failures -= 1;
            return Err(EventStoreError::DatabaseError("injected failure".to_string()));
        }

        for group in &groups {
            let actual = log.current_sequence(&group.key);
            if actual != group.expected {
                return Err(EventStoreError::ConcurrencyConflict {
                    key: group.key.clone(),
                    expected: group.expected,
                    actual: Some(actual),
                });
            }
        }

        let now = self.clock.now();
        let mut position = log.last_position();
        let mut committed = Vec::new();
        for group in groups {
            let mut sequence = group.expected;
            for pending in group.events {
                sequence = sequence.next();
                position = position.next();
                committed.push(StoredEvent::from_pending(
                    group.key.clone(),
                    pending,
                    sequence,
                    position,
                    now,
                ));
            }
        }
        log.events.extend(committed.iter().cloned());
        Ok(committed)
    }

    fn filter_sync(&self, query: &SearchQuery) -> Vec<StoredEvent> {
        let log = self.log.lock().unwrap();
        let matching = log.events.iter().filter(|e| query.matches(e)).cloned();
        let mut events: Vec<StoredEvent> = match query.order {
            SortOrder::Ascending => matching.collect(),
            SortOrder::Descending => matching.rev().collect(),
        };
        if let Some(limit) = query.limit {
            events.truncate(usize::try_from(limit).unwrap_or(usize::MAX));
        }
        events
    }
}

impl Default for InMemoryEventStore {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for InMemoryEventStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InMemoryEventStore")
            .field("events", &self.len())
            .finish_non_exhaustive()
    }
}

impl EventStore for InMemoryEventStore {
    fn append(&self, groups: Vec<AppendGroup>) -> StoreFuture<'_, Vec<StoredEvent>> {
        Box::pin(async move { self.append_sync(groups) })
    }

    fn filter(&self, query: SearchQuery) -> EventStream<'_> {
        if let Err(reason) = query.validate() {
            return Box::pin(futures::stream::once(async move {
                Err(EventStoreError::Validation(reason))
            }));
        }
        let events = self.filter_sync(&query);
        Box::pin(futures::stream::iter(events.into_iter().map(Ok)))
    }

    fn current_sequence(&self, key: &AggregateKey) -> StoreFuture<'_, Sequence> {
        let key = key.clone();
        Box::pin(async move { Ok(self.log.lock().unwrap().current_sequence(&key)) })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use eventide_core::event::PendingEvent;
    use eventide_core::search::SubQuery;
    use futures::TryStreamExt;

    fn pending(event_type: &str) -> PendingEvent {
        PendingEvent::new(event_type, "org", "actor", vec![1])
    }

    #[tokio::test]
    async fn positions_are_global_and_sequences_per_stream() {
        let store = InMemoryEventStore::new();
        let a = AggregateKey::new("i", "user", "a");
        let b = AggregateKey::new("i", "user", "b");

        store
            .append(vec![AppendGroup::new(a.clone(), Sequence::INITIAL, vec![pending("x"), pending("y")])])
            .await
            .unwrap();
        let committed = store
            .append(vec![AppendGroup::new(b, Sequence::INITIAL, vec![pending("x")])])
            .await
            .unwrap();

        assert_eq!(committed[0].meta.sequence, Sequence::new(1));
        assert_eq!(committed[0].meta.position, Position::new(3));
        assert_eq!(store.current_sequence(&a).await.unwrap(), Sequence::new(2));
    }

    #[tokio::test]
    async fn injected_failures_are_transient_and_write_nothing() {
        let store = InMemoryEventStore::new();
        store.fail_next_appends(1);
        let group = AppendGroup::new(AggregateKey::new("i", "user", "a"), Sequence::INITIAL, vec![pending("x")]);

        let err = store.append(vec![group.clone()]).await.unwrap_err();
        assert!(err.is_transient());
        assert!(store.is_empty());

        store.append(vec![group]).await.unwrap();
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn descending_filter_with_limit() {
        let store = InMemoryEventStore::new();
        let key = AggregateKey::new("i", "user", "a");
        store
            .append(vec![AppendGroup::new(key.clone(), Sequence::INITIAL, vec![pending("x"), pending("y"), pending("z")])])
            .await
            .unwrap();

        let events: Vec<_> = store
            .filter(SearchQuery::for_aggregate(&key).order_desc().limit(2))
            .try_collect()
            .await
            .unwrap();

        let sequences: Vec<_> = events.iter().map(|e| e.meta.sequence.value()).collect();
        assert_eq!(sequences, vec![3, 2]);
    }

    #[tokio::test]
    async fn invalid_query_yields_validation_error() {
        let store = InMemoryEventStore::new();
        let result: Result<Vec<_>, _> = store
            .filter(SearchQuery::new().add_query(SubQuery::new()))
            .try_collect()
            .await;
        assert!(matches!(result, Err(EventStoreError::Validation(_))));
    }
}
