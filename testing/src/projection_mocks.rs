//! In-memory projection testing utilities
//!
//! Provides fast, deterministic testing infrastructure for projections:
//! - [`InMemoryReadModelStore`]: view state plus checkpoints behind one lock
//! - [`InMemoryDeadLetters`]: records dead-lettered events
//! - [`ProjectionTestHarness`]: feeds events straight into a projection

#![allow(clippy::unwrap_used)] // Test infrastructure uses unwrap for simplicity
#![allow(clippy::missing_panics_doc)] // Test utilities document panics where critical

use eventide_core::dead_letter::{DeadLetterFuture, DeadLetterSink};
use eventide_core::event::{RecordedEvent, StoredEvent};
use eventide_core::projection::{Projection, ProjectionError, ReadModelStore, Result};
use eventide_core::stream::Position;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};

/// Mutation applied to an in-memory view of type `S`.
pub type StateMutation<S> = Box<dyn FnOnce(&mut S) + Send>;

/// Build a [`StateMutation`] from a closure.
pub fn mutation<S, F>(f: F) -> StateMutation<S>
where
    F: FnOnce(&mut S) + Send + 'static,
{
    Box::new(f)
}

#[derive(Debug, Default)]
struct Views<S> {
    state: S,
    checkpoints: HashMap<String, Position>,
    commits: usize,
    failures: usize,
}

/// In-memory read model store for fast, deterministic testing.
///
/// The view is a plain value of type `S`; mutations are closures over it.
/// Commits are compare-and-set on the view's checkpoint, exactly like the
/// database store. Clones share the same state.
///
/// # Example
///
/// ```
/// use eventide_core::projection::ReadModelStore;
/// use eventide_core::stream::Position;
/// use eventide_testing::{InMemoryReadModelStore, mutation};
///
/// # tokio_test::block_on(async {
/// let store = InMemoryReadModelStore::<Vec<String>>::new();
/// store
///     .commit("names", Position::BEGINNING, vec![mutation(|v: &mut Vec<String>| v.push("ada".into()))], Position::new(3))
///     .await
///     .unwrap();
///
/// assert_eq!(store.state(), vec!["ada".to_string()]);
/// assert_eq!(store.load_checkpoint("names").await.unwrap(), Position::new(3));
/// # });
/// ```
#[derive(Debug)]
pub struct InMemoryReadModelStore<S> {
    views: Arc<RwLock<Views<S>>>,
}

impl<S> Clone for InMemoryReadModelStore<S> {
    fn clone(&self) -> Self {
        Self {
            views: Arc::clone(&self.views),
        }
    }
}

impl<S: Default> InMemoryReadModelStore<S> {
    /// Create a new empty store
    #[must_use]
    pub fn new() -> Self {
        Self {
            views: Arc::new(RwLock::new(Views::default())),
        }
    }
}

impl<S: Default> Default for InMemoryReadModelStore<S> {
    fn default() -> Self {
        Self::new()
    }
}

impl<S> InMemoryReadModelStore<S> {
    /// Inspect the view.
    pub fn read<R>(&self, f: impl FnOnce(&S) -> R) -> R {
        f(&self.views.read().unwrap().state)
    }

    /// Snapshot of the view.
    #[must_use]
    pub fn state(&self) -> S
    where
        S: Clone,
    {
        self.read(Clone::clone)
    }

    /// Checkpoint of a view without going through the async trait.
    #[must_use]
    pub fn checkpoint(&self, view: &str) -> Position {
        self.views
            .read()
            .unwrap()
            .checkpoints
            .get(view)
            .copied()
            .unwrap_or(Position::BEGINNING)
    }

    /// Number of successful commits.
    #[must_use]
    pub fn commits(&self) -> usize {
        self.views.read().unwrap().commits
    }

    /// Make the next `count` commits fail with a storage error.
    pub fn fail_next_commits(&self, count: usize) {
        self.views.write().unwrap().failures = count;
    }

    /// Move a checkpoint behind the runner's back.
    pub fn set_checkpoint(&self, view: &str, position: Position) {
        self.views
            .write()
            .unwrap()
            .checkpoints
            .insert(view.to_string(), position);
    }

    fn commit_sync(&self, view: &str, expected: Position, mutations: Vec<StateMutation<S>>, new: Position) -> Result<()> {
        let mut views = self.views.write().unwrap();
        if views.failures > 0 {
            views.failures -= 1;
            return Err(ProjectionError::Storage("injected failure".to_string()));
        }
        let actual = views.checkpoints.get(view).copied().unwrap_or(Position::BEGINNING);
        if actual != expected {
            return Err(ProjectionError::CheckpointMoved {
                view: view.to_string(),
                expected,
                actual,
            });
        }
        for apply in mutations {
            apply(&mut views.state);
        }
        views.checkpoints.insert(view.to_string(), new);
        views.commits += 1;
        Ok(())
    }
}

impl<S: Send + Sync + 'static> ReadModelStore for InMemoryReadModelStore<S> {
    type Mutation = StateMutation<S>;

    async fn load_checkpoint(&self, view: &str) -> Result<Position> {
        Ok(self.checkpoint(view))
    }

    async fn commit(&self, view: &str, expected: Position, mutations: Vec<Self::Mutation>, new: Position) -> Result<()> {
        self.commit_sync(view, expected, mutations, new)
    }

    async fn reset(&self, view: &str, cleanup: Vec<Self::Mutation>) -> Result<()> {
        let mut views = self.views.write().unwrap();
        for apply in cleanup {
            apply(&mut views.state);
        }
        views.checkpoints.insert(view.to_string(), Position::BEGINNING);
        Ok(())
    }
}

/// One dead-lettered event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeadLetter {
    /// View that failed.
    pub view: String,
    /// Raw event.
    pub event: StoredEvent,
    /// Why it failed.
    pub reason: String,
}

/// In-memory [`DeadLetterSink`].
#[derive(Debug, Clone, Default)]
pub struct InMemoryDeadLetters {
    entries: Arc<RwLock<Vec<DeadLetter>>>,
}

impl InMemoryDeadLetters {
    /// Create an empty sink
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Recorded entries in recording order.
    #[must_use]
    pub fn entries(&self) -> Vec<DeadLetter> {
        self.entries.read().unwrap().clone()
    }

    /// Number of recorded entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.read().unwrap().len()
    }

    /// Whether nothing was recorded.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.read().unwrap().is_empty()
    }
}

impl DeadLetterSink for InMemoryDeadLetters {
    fn record<'a>(&'a self, view: &'a str, event: &'a StoredEvent, reason: &'a str) -> DeadLetterFuture<'a> {
        Box::pin(async move {
            self.entries.write().unwrap().push(DeadLetter {
                view: view.to_string(),
                event: event.clone(),
                reason: reason.to_string(),
            });
            Ok(())
        })
    }
}

/// Test harness feeding decoded events straight into a projection and
/// committing the mutations to an in-memory store.
///
/// # Example
///
/// ```ignore
/// let mut harness = ProjectionTestHarness::new(projection, InMemoryReadModelStore::new());
/// harness.given_events(&[added, changed]).await?;
/// harness.store().read(|view| assert_eq!(view.len(), 1));
/// ```
pub struct ProjectionTestHarness<P, S> {
    projection: P,
    store: InMemoryReadModelStore<S>,
}

impl<P, S> ProjectionTestHarness<P, S>
where
    P: Projection<Mutation = StateMutation<S>>,
    S: Send + Sync + 'static,
{
    /// Create a new test harness for the given projection.
    #[must_use]
    pub const fn new(projection: P, store: InMemoryReadModelStore<S>) -> Self {
        Self { projection, store }
    }

    /// Reduce and commit events in order, advancing the checkpoint to each
    /// event's position.
    ///
    /// # Errors
    ///
    /// Returns [`ProjectionError`] if any event fails to reduce or commit.
    pub async fn given_events(&mut self, events: &[RecordedEvent<P::Event>]) -> Result<&mut Self> {
        for event in events {
            let mutations = self.projection.reduce(event)?;
            let name = self.projection.name();
            let expected = self.store.checkpoint(name);
            self.store
                .commit(name, expected, mutations, event.position())
                .await?;
        }
        Ok(self)
    }

    /// Get a reference to the underlying store.
    #[must_use]
    pub const fn store(&self) -> &InMemoryReadModelStore<S> {
        &self.store
    }

    /// Get a reference to the projection.
    #[must_use]
    pub const fn projection(&self) -> &P {
        &self.projection
    }
}
