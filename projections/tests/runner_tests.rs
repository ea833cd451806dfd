//! Projection runner against the in-memory stores.

#![allow(clippy::unwrap_used)] // Tests can unwrap
#![allow(clippy::expect_used)] // Tests can expect

use eventide_core::environment::SystemClock;
use eventide_core::event::{Event, PendingEvent};
use eventide_core::event_store::{AppendGroup, EventStore};
use eventide_core::eventstore::Eventstore;
use eventide_core::lock::{LockError, Locker};
use eventide_core::projection::{
    DecodeFailurePolicy, ProjectionError, ReadModelStore, ReducerTable, Result, TableProjection,
};
use eventide_core::registry::EventTypeRegistry;
use eventide_core::stream::{AggregateKey, Position, Sequence};
use eventide_projections::{BatchOutcome, ProjectionRunner, RunnerConfig};
use eventide_runtime::lease::{LeaseConfig, LeaseKeeper};
use eventide_testing::{InMemoryDeadLetters, InMemoryEventStore, InMemoryLocker, InMemoryReadModelStore, StateMutation, mutation};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Barrier;

const VIEW: &str = "user_names";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct UserAdded {
    name: String,
}

impl Event for UserAdded {
    fn event_type(&self) -> &'static str {
        "user.added"
    }
}

#[derive(Debug, Clone, PartialEq)]
enum UserEvent {
    Added(UserAdded),
}

type Names = Vec<String>;
type View = TableProjection<UserEvent, StateMutation<Names>>;

fn registry() -> Arc<EventTypeRegistry<UserEvent>> {
    Arc::new(
        EventTypeRegistry::builder()
            .register_bincode("user", "user.added", UserEvent::Added)
            .unwrap()
            .build(),
    )
}

/// Also handles `user.renamed`, which the registry does not know: those
/// events are selected by the view's query but cannot be decoded.
fn projection() -> View {
    let table = ReducerTable::new()
        .on("user", "user.added", |e| match &e.data {
            UserEvent::Added(added) => {
                let name = added.name.clone();
                Ok(vec![mutation(move |names: &mut Names| names.push(name))])
            }
        })
        .on("user", "user.renamed", |_| Ok(Vec::new()));
    TableProjection::new(VIEW, table).with_reset(|| vec![mutation(|names: &mut Names| names.clear())])
}

fn config(policy: DecodeFailurePolicy) -> RunnerConfig {
    RunnerConfig {
        batch_size: 100,
        poll_interval: Duration::from_millis(10),
        decode_failure_policy: policy,
        owner_id: "w1".to_string(),
        lease: LeaseConfig {
            ttl: Duration::from_secs(5),
            ..LeaseConfig::default()
        },
    }
}

struct Fixture {
    events: Arc<InMemoryEventStore>,
    view: InMemoryReadModelStore<Names>,
    locker: Arc<InMemoryLocker>,
}

impl Fixture {
    fn new() -> Self {
        Self {
            events: Arc::new(InMemoryEventStore::new()),
            view: InMemoryReadModelStore::new(),
            locker: Arc::new(InMemoryLocker::new(Arc::new(SystemClock))),
        }
    }

    fn eventstore(&self) -> Eventstore<UserEvent> {
        Eventstore::new(Arc::clone(&self.events) as Arc<dyn EventStore>, registry())
    }

    fn runner(&self, config: RunnerConfig) -> ProjectionRunner<View, InMemoryReadModelStore<Names>> {
        ProjectionRunner::new(
            projection(),
            self.view.clone(),
            self.eventstore(),
            Arc::clone(&self.locker) as Arc<dyn Locker>,
            config,
        )
        .0
    }

    async fn add_user(&self, id: &str, name: &str) {
        let event = PendingEvent::from_event(&UserAdded { name: name.to_string() }, "org", "admin").unwrap();
        self.append(id, event).await;
    }

    async fn append(&self, id: &str, event: PendingEvent) {
        let key = AggregateKey::new("inst", "user", id);
        let current = self.events.current_sequence(&key).await.unwrap();
        self.events
            .append(vec![AppendGroup::new(key, current, vec![event])])
            .await
            .unwrap();
    }
}

async fn held(runner: &ProjectionRunner<View, InMemoryReadModelStore<Names>>) -> LeaseKeeper {
    let mut keeper = runner.lease_keeper();
    keeper.acquire().await.unwrap();
    keeper
}

#[tokio::test]
async fn batch_applies_events_and_advances_checkpoint() {
    let fx = Fixture::new();
    fx.add_user("u1", "ada").await;
    fx.add_user("u2", "grace").await;
    fx.add_user("u1", "ada lovelace").await;

    let runner = fx.runner(config(DecodeFailurePolicy::Halt));
    let keeper = held(&runner).await;

    let outcome = runner.run_batch(&keeper).await.unwrap();

    assert_eq!(
        outcome,
        BatchOutcome::Committed {
            events: 3,
            checkpoint: Position::new(3)
        }
    );
    assert_eq!(fx.view.state(), vec!["ada", "grace", "ada lovelace"]);
    assert_eq!(runner.run_batch(&keeper).await.unwrap(), BatchOutcome::Idle);
    assert_eq!(fx.view.commits(), 1);
}

#[tokio::test]
async fn batches_are_bounded_and_resume_from_the_checkpoint() {
    let fx = Fixture::new();
    for i in 0..5 {
        fx.add_user(&format!("u{i}"), &format!("user {i}")).await;
    }
    let runner = fx.runner(RunnerConfig {
        batch_size: 2,
        ..config(DecodeFailurePolicy::Halt)
    });
    let keeper = held(&runner).await;

    let mut checkpoints = Vec::new();
    while let BatchOutcome::Committed { checkpoint, .. } = runner.run_batch(&keeper).await.unwrap() {
        checkpoints.push(checkpoint.value());
    }

    assert_eq!(checkpoints, vec![2, 4, 5]);
    assert_eq!(fx.view.read(Vec::len), 5);
}

#[tokio::test]
async fn nothing_is_committed_without_the_lease() {
    let fx = Fixture::new();
    fx.add_user("u1", "ada").await;
    let runner = fx.runner(config(DecodeFailurePolicy::Halt));
    let keeper = runner.lease_keeper();

    let err = runner.run_batch(&keeper).await.unwrap_err();

    assert!(matches!(err, ProjectionError::Lock(LockError::Lost { .. })));
    assert_eq!(fx.view.checkpoint(VIEW), Position::BEGINNING);
    assert!(fx.view.state().is_empty());
}

#[tokio::test]
async fn storage_failures_leave_view_and_checkpoint_untouched() {
    let fx = Fixture::new();
    fx.add_user("u1", "ada").await;
    let runner = fx.runner(config(DecodeFailurePolicy::Halt));
    let keeper = held(&runner).await;
    fx.view.fail_next_commits(1);

    assert!(matches!(runner.run_batch(&keeper).await, Err(ProjectionError::Storage(_))));
    assert!(fx.view.state().is_empty());

    runner.run_batch(&keeper).await.unwrap();
    assert_eq!(fx.view.state(), vec!["ada"]);
}

/// Lets every caller of `load_checkpoint` wait for the others, so concurrent
/// runners compute their batches from the same checkpoint.
struct SameCheckpoint {
    inner: InMemoryReadModelStore<Names>,
    barrier: Arc<Barrier>,
}

impl ReadModelStore for SameCheckpoint {
    type Mutation = StateMutation<Names>;

    async fn load_checkpoint(&self, view: &str) -> Result<Position> {
        let checkpoint = self.inner.load_checkpoint(view).await;
        self.barrier.wait().await;
        checkpoint
    }

    async fn commit(&self, view: &str, expected: Position, mutations: Vec<Self::Mutation>, new: Position) -> Result<()> {
        self.inner.commit(view, expected, mutations, new).await
    }

    async fn reset(&self, view: &str, cleanup: Vec<Self::Mutation>) -> Result<()> {
        self.inner.reset(view, cleanup).await
    }
}

#[tokio::test]
async fn concurrent_runners_apply_each_event_exactly_once() {
    let fx = Fixture::new();
    fx.add_user("u1", "ada").await;
    fx.add_user("u2", "grace").await;
    let barrier = Arc::new(Barrier::new(2));

    // Separate lock stores: both runners believe they hold the lease.
    let runners: Vec<_> = ["w1", "w2"]
        .into_iter()
        .map(|owner| {
            let store = SameCheckpoint {
                inner: fx.view.clone(),
                barrier: Arc::clone(&barrier),
            };
            let locker: Arc<dyn Locker> = Arc::new(InMemoryLocker::new(Arc::new(SystemClock)));
            ProjectionRunner::new(
                projection(),
                store,
                fx.eventstore(),
                locker,
                RunnerConfig {
                    owner_id: owner.to_string(),
                    ..config(DecodeFailurePolicy::Halt)
                },
            )
            .0
        })
        .collect();
    let mut k1 = runners[0].lease_keeper();
    let mut k2 = runners[1].lease_keeper();
    k1.acquire().await.unwrap();
    k2.acquire().await.unwrap();

    let (first, second) = tokio::join!(runners[0].run_batch(&k1), runners[1].run_batch(&k2));

    let results = [first, second];
    assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 1);
    assert!(results.iter().any(|r| matches!(r, Err(e) if e.is_checkpoint_moved())));
    assert_eq!(fx.view.state(), vec!["ada", "grace"]);
    assert_eq!(fx.view.checkpoint(VIEW), Position::new(2));
    assert_eq!(fx.view.commits(), 1);
}

#[tokio::test]
async fn skip_policy_passes_over_undecodable_events() {
    let fx = Fixture::new();
    fx.add_user("u1", "ada").await;
    fx.append("u1", PendingEvent::new("user.renamed", "org", "admin", vec![1])).await;
    fx.append("u2", PendingEvent::new("user.added", "org", "admin", vec![0xff])).await;
    fx.add_user("u3", "grace").await;

    let runner = fx.runner(config(DecodeFailurePolicy::Skip));
    let keeper = held(&runner).await;
    let outcome = runner.run_batch(&keeper).await.unwrap();

    assert_eq!(
        outcome,
        BatchOutcome::Committed {
            events: 4,
            checkpoint: Position::new(4)
        }
    );
    assert_eq!(fx.view.state(), vec!["ada", "grace"]);
}

#[tokio::test]
async fn dead_letter_policy_records_and_continues() {
    let fx = Fixture::new();
    fx.add_user("u1", "ada").await;
    fx.append("u1", PendingEvent::new("user.renamed", "org", "admin", vec![1])).await;
    fx.add_user("u2", "grace").await;
    let sink = InMemoryDeadLetters::new();

    let runner = fx
        .runner(config(DecodeFailurePolicy::DeadLetter))
        .with_dead_letters(Arc::new(sink.clone()));
    let keeper = held(&runner).await;
    runner.run_batch(&keeper).await.unwrap();

    assert_eq!(fx.view.state(), vec!["ada", "grace"]);
    assert_eq!(fx.view.checkpoint(VIEW), Position::new(3));
    let entries = sink.entries();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].view, VIEW);
    assert_eq!(entries[0].event.meta.position, Position::new(2));
    assert_eq!(entries[0].event.meta.sequence, Sequence::new(2));
    assert!(entries[0].reason.contains("user.renamed"));
}

#[tokio::test]
async fn dead_letter_policy_without_sink_fails_the_batch() {
    let fx = Fixture::new();
    fx.append("u1", PendingEvent::new("user.renamed", "org", "admin", vec![1])).await;

    let runner = fx.runner(config(DecodeFailurePolicy::DeadLetter));
    let keeper = held(&runner).await;

    assert!(matches!(runner.run_batch(&keeper).await, Err(ProjectionError::Other(_))));
    assert_eq!(fx.view.checkpoint(VIEW), Position::BEGINNING);
}

#[tokio::test]
async fn halt_policy_stops_before_the_undecodable_event() {
    let fx = Fixture::new();
    fx.add_user("u1", "ada").await;
    fx.append("u1", PendingEvent::new("user.renamed", "org", "admin", vec![1])).await;
    fx.add_user("u2", "grace").await;

    let runner = fx.runner(config(DecodeFailurePolicy::Halt));
    let keeper = held(&runner).await;

    for _ in 0..2 {
        let err = runner.run_batch(&keeper).await.unwrap_err();
        assert!(matches!(err, ProjectionError::Decode(ref e) if e.is_unknown_type()));
        assert_eq!(fx.view.checkpoint(VIEW), Position::new(1));
    }
    assert_eq!(fx.view.state(), vec!["ada"]);
}

#[tokio::test]
async fn rebuild_replays_the_view_from_the_start() {
    let fx = Fixture::new();
    fx.add_user("u1", "ada").await;
    fx.add_user("u2", "grace").await;
    let runner = fx.runner(config(DecodeFailurePolicy::Halt));

    let mut keeper = held(&runner).await;
    runner.run_batch(&keeper).await.unwrap();
    keeper.release().await.unwrap();

    runner.rebuild().await.unwrap();
    assert!(fx.view.state().is_empty());
    assert_eq!(fx.view.checkpoint(VIEW), Position::BEGINNING);

    let keeper = held(&runner).await;
    runner.run_batch(&keeper).await.unwrap();
    assert_eq!(fx.view.state(), vec!["ada", "grace"]);
}

#[tokio::test]
async fn rebuild_refuses_while_another_worker_builds_the_view() {
    let fx = Fixture::new();
    fx.locker.acquire(VIEW, "someone-else", Duration::from_secs(30)).await.unwrap();
    let runner = fx.runner(config(DecodeFailurePolicy::Halt));

    let err = runner.rebuild().await.unwrap_err();

    assert!(matches!(err, ProjectionError::Lock(LockError::Held { .. })));
}

#[tokio::test]
async fn rebuild_leaves_the_runners_own_lease_alone() {
    let fx = Fixture::new();
    fx.add_user("u1", "ada").await;
    let runner = fx.runner(config(DecodeFailurePolicy::Halt));
    let keeper = held(&runner).await;
    runner.run_batch(&keeper).await.unwrap();

    let err = runner.rebuild().await.unwrap_err();

    assert!(matches!(err, ProjectionError::Lock(LockError::Held { .. })));
    assert_eq!(fx.locker.owner_of(VIEW).as_deref(), Some("w1"));
    assert_eq!(fx.view.state(), vec!["ada"]);
    keeper.ensure_held().unwrap();
}

#[tokio::test]
async fn run_loop_follows_new_events_until_shutdown() {
    let fx = Fixture::new();
    fx.add_user("u1", "ada").await;

    let (mut first, stop_first) = ProjectionRunner::new(
        projection(),
        fx.view.clone(),
        fx.eventstore(),
        Arc::clone(&fx.locker) as Arc<dyn Locker>,
        config(DecodeFailurePolicy::Halt),
    );
    let (mut second, stop_second) = ProjectionRunner::new(
        projection(),
        fx.view.clone(),
        fx.eventstore(),
        Arc::clone(&fx.locker) as Arc<dyn Locker>,
        RunnerConfig {
            owner_id: "w2".to_string(),
            ..config(DecodeFailurePolicy::Halt)
        },
    );
    let first = tokio::spawn(async move { first.run().await });
    let second = tokio::spawn(async move { second.run().await });

    fx.add_user("u2", "grace").await;
    fx.add_user("u3", "hopper").await;

    tokio::time::timeout(Duration::from_secs(5), async {
        while fx.view.checkpoint(VIEW) < Position::new(3) {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("view did not catch up");

    stop_first.send(true).unwrap();
    stop_second.send(true).unwrap();
    first.await.unwrap().unwrap();
    second.await.unwrap().unwrap();

    assert_eq!(fx.view.state(), vec!["ada", "grace", "hopper"]);
    assert_eq!(fx.locker.owner_of(VIEW), None);
}

#[tokio::test]
async fn run_loop_halts_on_undecodable_event_under_halt_policy() {
    let fx = Fixture::new();
    fx.append("u1", PendingEvent::new("user.renamed", "org", "admin", vec![1])).await;
    let (mut runner, _stop) = ProjectionRunner::new(
        projection(),
        fx.view.clone(),
        fx.eventstore(),
        Arc::clone(&fx.locker) as Arc<dyn Locker>,
        config(DecodeFailurePolicy::Halt),
    );

    let result = tokio::time::timeout(Duration::from_secs(5), runner.run()).await.unwrap();

    assert!(matches!(result, Err(ProjectionError::Decode(_))));
    assert_eq!(fx.locker.owner_of(VIEW), None);
}
