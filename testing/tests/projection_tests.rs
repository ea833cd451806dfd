//! Tests for projection testing utilities

#![allow(clippy::unwrap_used)] // Tests can unwrap

use eventide_core::dead_letter::DeadLetterSink;
use eventide_core::environment::Clock;
use eventide_core::projection::{ProjectionError, ReadModelStore, ReducerTable, TableProjection};
use eventide_core::stream::{AggregateKey, Position};
use eventide_testing::helpers::{recorded, stored};
use eventide_testing::{
    InMemoryDeadLetters, InMemoryReadModelStore, ProjectionTestHarness, StateMutation, mutation, test_clock,
};
use std::collections::BTreeMap;

type Counts = BTreeMap<String, u32>;

#[derive(Debug, Clone, PartialEq)]
enum LoginEvent {
    Succeeded { user: String },
    Failed { user: String },
}

fn projection() -> TableProjection<LoginEvent, StateMutation<Counts>> {
    let table: ReducerTable<LoginEvent, StateMutation<Counts>> = ReducerTable::new()
        .on("user", "user.login.failed", |e| match &e.data {
            LoginEvent::Failed { user } => {
                let user = user.clone();
                Ok(vec![mutation(move |c: &mut Counts| *c.entry(user).or_default() += 1)])
            }
            LoginEvent::Succeeded { .. } => Ok(vec![]),
        })
        .on("user", "user.login.succeeded", |e| match &e.data {
            LoginEvent::Succeeded { user } => {
                let user = user.clone();
                Ok(vec![mutation(move |c: &mut Counts| {
                    c.remove(&user);
                })])
            }
            LoginEvent::Failed { .. } => Ok(vec![]),
        });
    TableProjection::new("failed_logins", table).with_reset(|| vec![mutation(|c: &mut Counts| c.clear())])
}

fn failed(user: &str, position: u64) -> eventide_core::event::RecordedEvent<LoginEvent> {
    let key = AggregateKey::new("inst", "user", user);
    recorded(
        &key,
        "user.login.failed",
        position,
        position,
        test_clock().now(),
        LoginEvent::Failed { user: user.to_string() },
    )
}

fn succeeded(user: &str, position: u64) -> eventide_core::event::RecordedEvent<LoginEvent> {
    let key = AggregateKey::new("inst", "user", user);
    recorded(
        &key,
        "user.login.succeeded",
        position,
        position,
        test_clock().now(),
        LoginEvent::Succeeded { user: user.to_string() },
    )
}

#[tokio::test]
async fn test_harness_applies_events_and_advances_checkpoint() {
    let mut harness = ProjectionTestHarness::new(projection(), InMemoryReadModelStore::new());

    harness
        .given_events(&[failed("ada", 1), failed("ada", 2), failed("grace", 3)])
        .await
        .unwrap();

    let store = harness.store();
    assert_eq!(store.state().get("ada"), Some(&2));
    assert_eq!(store.state().get("grace"), Some(&1));
    assert_eq!(store.checkpoint("failed_logins"), Position::new(3));
    assert_eq!(store.commits(), 3);
}

#[tokio::test]
async fn test_harness_unhandled_events_still_move_the_checkpoint() {
    let mut harness = ProjectionTestHarness::new(projection(), InMemoryReadModelStore::new());
    let other = recorded(
        &AggregateKey::new("inst", "org", "o1"),
        "org.added",
        1,
        4,
        test_clock().now(),
        LoginEvent::Failed { user: "ignored".into() },
    );

    harness.given_events(&[failed("ada", 1), succeeded("ada", 2), other]).await.unwrap();

    assert!(harness.store().state().is_empty());
    assert_eq!(harness.store().checkpoint("failed_logins"), Position::new(4));
}

#[tokio::test]
async fn test_harness_surfaces_injected_commit_failures() {
    let store = InMemoryReadModelStore::new();
    store.fail_next_commits(1);
    let mut harness = ProjectionTestHarness::new(projection(), store);

    let err = harness.given_events(&[failed("ada", 1)]).await.err().unwrap();

    assert!(matches!(err, ProjectionError::Storage(_)));
    assert!(harness.store().state().is_empty());
    assert_eq!(harness.store().checkpoint("failed_logins"), Position::BEGINNING);
}

#[tokio::test]
async fn test_store_commit_is_compare_and_set() {
    let store = InMemoryReadModelStore::<Counts>::new();
    store.set_checkpoint("failed_logins", Position::new(7));

    let err = store
        .commit(
            "failed_logins",
            Position::new(5),
            vec![mutation(|c: &mut Counts| {
                c.insert("x".into(), 1);
            })],
            Position::new(9),
        )
        .await
        .unwrap_err();

    assert!(matches!(
        err,
        ProjectionError::CheckpointMoved { expected, actual, .. }
            if expected == Position::new(5) && actual == Position::new(7)
    ));
    assert!(err.is_checkpoint_moved());
    assert!(store.state().is_empty());
    assert_eq!(store.load_checkpoint("failed_logins").await.unwrap(), Position::new(7));
}

#[tokio::test]
async fn test_store_reset_applies_cleanup_and_rewinds() {
    let mut harness = ProjectionTestHarness::new(projection(), InMemoryReadModelStore::new());
    harness.given_events(&[failed("ada", 1)]).await.unwrap();

    let store = harness.store().clone();
    store
        .reset("failed_logins", vec![mutation(|c: &mut Counts| c.clear())])
        .await
        .unwrap();

    assert!(store.state().is_empty());
    assert_eq!(store.checkpoint("failed_logins"), Position::BEGINNING);
    // Checkpoints of other views are independent.
    assert_eq!(store.checkpoint("other_view"), Position::BEGINNING);
}

#[tokio::test]
async fn test_dead_letters_record_in_order() {
    let sink = InMemoryDeadLetters::new();
    let key = AggregateKey::new("inst", "user", "ada");
    let first = stored(&key, "user.login.failed", 1, 10, vec![0xff]);
    let second = stored(&key, "user.renamed", 2, 11, vec![]);

    sink.record("failed_logins", &first, "malformed payload").await.unwrap();
    sink.record("failed_logins", &second, "unknown event type").await.unwrap();

    let entries = sink.entries();
    assert_eq!(sink.len(), 2);
    assert_eq!(entries[0].event, first);
    assert_eq!(entries[0].reason, "malformed payload");
    assert_eq!(entries[1].event.meta.position, Position::new(11));
    assert_eq!(entries[1].view, "failed_logins");
}
