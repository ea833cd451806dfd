//! Command cycle: rebuild, decide, append, and retry on conflicts.

#![allow(clippy::unwrap_used)] // Tests can unwrap
#![allow(clippy::panic)]

use eventide_core::event::{Event, PendingEvent, RecordedEvent};
use eventide_core::event_store::{AppendGroup, EventStore, EventStream, StoreFuture};
use eventide_core::eventstore::Eventstore;
use eventide_core::registry::EventTypeRegistry;
use eventide_core::search::SearchQuery;
use eventide_core::stream::{AggregateKey, Sequence};
use eventide_core::write_model::{WriteModel, WriteModelState};
use eventide_runtime::command::{CommandError, CommandExecutor, Outcome};
use eventide_testing::InMemoryEventStore;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct Incremented {
    by: i64,
}

impl Event for Incremented {
    fn event_type(&self) -> &'static str {
        "counter.incremented"
    }
}

#[derive(Debug, Clone, PartialEq)]
enum CounterEvent {
    Incremented(Incremented),
}

fn registry() -> Arc<EventTypeRegistry<CounterEvent>> {
    Arc::new(
        EventTypeRegistry::builder()
            .register_bincode("counter", "counter.incremented", CounterEvent::Incremented)
            .unwrap()
            .build(),
    )
}

fn key() -> AggregateKey {
    AggregateKey::new("inst", "counter", "c1")
}

fn increment(by: i64) -> PendingEvent {
    PendingEvent::from_event(&Incremented { by }, "org", "tester").unwrap()
}

#[derive(Debug)]
struct CounterModel {
    state: WriteModelState,
    value: i64,
}

impl CounterModel {
    fn new() -> Self {
        Self {
            state: WriteModelState::new(key()),
            value: 0,
        }
    }

    /// Raise the counter to `target`; nothing to do if it is already there.
    fn raise_to(&self, target: i64) -> Result<Option<Vec<PendingEvent>>, CommandError> {
        if target < self.value {
            return Err(CommandError::Rejected(format!("counter is already at {}", self.value)));
        }
        if target == self.value {
            return Ok(None);
        }
        Ok(Some(vec![increment(target - self.value)]))
    }
}

impl WriteModel for CounterModel {
    type Event = CounterEvent;

    fn state(&self) -> &WriteModelState {
        &self.state
    }

    fn state_mut(&mut self) -> &mut WriteModelState {
        &mut self.state
    }

    fn query(&self) -> SearchQuery {
        SearchQuery::for_aggregate(&self.state.key)
    }

    fn apply(&mut self, event: &RecordedEvent<CounterEvent>) {
        match &event.data {
            CounterEvent::Incremented(e) => self.value += e.by,
        }
    }
}

/// Store where another writer sneaks in an increment before each of the
/// next `interleave` appends.
struct RacingStore {
    inner: InMemoryEventStore,
    interleave: AtomicUsize,
}

impl RacingStore {
    fn new(interleave: usize) -> Self {
        Self {
            inner: InMemoryEventStore::new(),
            interleave: AtomicUsize::new(interleave),
        }
    }
}

impl EventStore for RacingStore {
    fn append(&self, groups: Vec<AppendGroup>) -> StoreFuture<'_, Vec<eventide_core::event::StoredEvent>> {
        Box::pin(async move {
            let race = self
                .interleave
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok();
            if race {
                let current = self.inner.current_sequence(&key()).await?;
                self.inner
                    .append(vec![AppendGroup::new(key(), current, vec![increment(1)])])
                    .await?;
            }
            self.inner.append(groups).await
        })
    }

    fn filter(&self, query: SearchQuery) -> EventStream<'_> {
        self.inner.filter(query)
    }

    fn current_sequence(&self, key: &AggregateKey) -> StoreFuture<'_, Sequence> {
        self.inner.current_sequence(key)
    }
}

fn executor(store: Arc<dyn EventStore>) -> CommandExecutor<CounterEvent> {
    CommandExecutor::new(Eventstore::new(store, registry()))
}

#[tokio::test]
async fn committed_events_are_folded_into_the_model() {
    let store = Arc::new(InMemoryEventStore::new());
    let executed = executor(store.clone()).execute(CounterModel::new, |m| m.raise_to(5)).await.unwrap();

    assert!(executed.outcome.is_committed());
    assert_eq!(executed.outcome.events().len(), 1);
    assert_eq!(executed.model.value, 5);
    assert_eq!(executed.model.expected_sequence(), Sequence::new(1));
    assert_eq!(store.len(), 1);
}

#[tokio::test]
async fn unchanged_state_appends_nothing() {
    let store = Arc::new(InMemoryEventStore::new());
    let exec = executor(store.clone());
    exec.execute(CounterModel::new, |m| m.raise_to(3)).await.unwrap();

    let executed = exec.execute(CounterModel::new, |m| m.raise_to(3)).await.unwrap();

    assert_eq!(executed.outcome, Outcome::Unchanged);
    assert_eq!(store.len(), 1);
}

#[tokio::test]
async fn rejected_commands_write_nothing() {
    let store = Arc::new(InMemoryEventStore::new());
    let exec = executor(store.clone());
    exec.execute(CounterModel::new, |m| m.raise_to(3)).await.unwrap();

    let err = exec.execute(CounterModel::new, |m| m.raise_to(1)).await.unwrap_err();

    assert!(matches!(err, CommandError::Rejected(_)));
    assert_eq!(store.len(), 1);
}

#[tokio::test]
async fn conflicts_rebuild_the_model_and_retry() {
    let store = Arc::new(RacingStore::new(2));
    let decisions = AtomicUsize::new(0);

    let executed = executor(store.clone())
        .execute(CounterModel::new, |m| {
            decisions.fetch_add(1, Ordering::SeqCst);
            m.raise_to(10)
        })
        .await
        .unwrap();

    // Two interleaved writers each added one before the third attempt won.
    assert_eq!(decisions.load(Ordering::SeqCst), 3);
    assert_eq!(executed.model.value, 10);
    assert_eq!(executed.outcome.events().len(), 1);
    assert_eq!(executed.model.expected_sequence(), Sequence::new(3));
}

#[tokio::test]
async fn persistent_conflicts_give_up_after_bounded_retries() {
    let store = Arc::new(RacingStore::new(usize::MAX));
    let exec = executor(store).with_max_conflict_retries(2);

    let err = exec.execute(CounterModel::new, |m| m.raise_to(100)).await.unwrap_err();

    match err {
        CommandError::Conflict { attempts, source } => {
            assert_eq!(attempts, 3);
            assert!(source.is_conflict());
        }
        other => panic!("expected conflict, got {other}"),
    }
}

#[tokio::test]
async fn unknown_event_at_the_stream_tail_does_not_block_commands() {
    let store = Arc::new(InMemoryEventStore::new());
    store
        .append(vec![AppendGroup::new(
            key(),
            Sequence::INITIAL,
            vec![increment(1), PendingEvent::new("counter.renamed", "org", "tester", vec![])],
        )])
        .await
        .unwrap();

    let executed = executor(store.clone()).execute(CounterModel::new, |m| m.raise_to(5)).await.unwrap();

    assert!(executed.outcome.is_committed());
    assert_eq!(executed.model.value, 5);
    assert_eq!(executed.model.expected_sequence(), Sequence::new(3));
    assert_eq!(store.len(), 3);
}
