//! Projection traits and types for CQRS read models.
//!
//! A projection turns events into mutations of a durable view. The runner
//! (in `eventide-projections`) feeds it batches of events after the view's
//! checkpoint and commits the resulting mutations together with the new
//! checkpoint through a [`ReadModelStore`].
//!
//! Reducers are organised as a [`ReducerTable`] keyed by
//! `(aggregate type, event type)`. The projection's filter query is derived
//! from the table, and tables compose: a generic table shared by several
//! aggregates can be extended with domain-specific entries.
//!
//! # Example
//!
//! ```
//! use eventide_core::projection::{ReducerTable, TableProjection};
//!
//! #[derive(Debug)]
//! enum Event { Added(String), Removed }
//!
//! let policies: ReducerTable<Event, String> = ReducerTable::new()
//!     .on("instance", "instance.policy.added", |e| match &e.data {
//!         Event::Added(name) => Ok(vec![format!("insert {name}")]),
//!         Event::Removed => Ok(vec![]),
//!     });
//!
//! let table = policies.on("org", "org.policy.removed", |e| {
//!     Ok(vec![format!("delete {}", e.meta.key.aggregate_id)])
//! });
//!
//! let projection = TableProjection::new("policies", table);
//! assert_eq!(projection.query().queries.len(), 2);
//! ```

use crate::event::{EventType, RecordedEvent};
use crate::event_store::EventStoreError;
use crate::lock::LockError;
use crate::registry::DecodeError;
use crate::search::{SearchQuery, SubQuery};
use crate::stream::{AggregateType, Position};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::future::Future;
use std::sync::Arc;

/// Error type for projection operations.
#[derive(Debug, thiserror::Error)]
pub enum ProjectionError {
    /// Storage backend error
    #[error("Storage error: {0}")]
    Storage(String),

    /// Checkpoint could not be read or written
    #[error("Checkpoint error: {0}")]
    Checkpoint(String),

    /// The stored checkpoint no longer equals the one the batch was computed
    /// from. Another runner committed first; the batch was discarded.
    #[error("Checkpoint of {view} moved: expected {expected}, found {actual}")]
    CheckpointMoved {
        /// View name.
        view: String,
        /// Checkpoint the batch started from.
        expected: Position,
        /// Checkpoint found at commit time.
        actual: Position,
    },

    /// A reducer rejected an event
    #[error("Event processing error: {0}")]
    EventProcessing(String),

    /// An event could not be decoded and the view halts on decode failures
    #[error(transparent)]
    Decode(#[from] DecodeError),

    /// Event store failure while reading events
    #[error(transparent)]
    Store(#[from] EventStoreError),

    /// The lease on the view was lost or could not be acquired
    #[error(transparent)]
    Lock(#[from] LockError),

    /// Generic error
    #[error("Projection error: {0}")]
    Other(String),
}

impl ProjectionError {
    /// Whether the batch was discarded because another runner won the race.
    #[must_use]
    pub const fn is_checkpoint_moved(&self) -> bool {
        matches!(self, Self::CheckpointMoved { .. })
    }
}

/// Result type for projection operations.
pub type Result<T> = std::result::Result<T, ProjectionError>;

/// What a runner does with an event it cannot decode.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DecodeFailurePolicy {
    /// Log and continue.
    Skip,
    /// Record with the dead-letter sink and continue.
    #[default]
    DeadLetter,
    /// Stop the view with an error; the checkpoint stays before the event.
    Halt,
}

impl fmt::Display for DecodeFailurePolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Skip => "skip",
            Self::DeadLetter => "dead_letter",
            Self::Halt => "halt",
        };
        f.write_str(name)
    }
}

impl std::str::FromStr for DecodeFailurePolicy {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "skip" => Ok(Self::Skip),
            "dead_letter" | "dead-letter" | "deadletter" => Ok(Self::DeadLetter),
            "halt" => Ok(Self::Halt),
            other => Err(format!("unknown decode failure policy: {other}")),
        }
    }
}

/// Durable storage of a view and its checkpoint.
///
/// Implementations must apply [`ReadModelStore::commit`] atomically: either
/// all mutations and the new checkpoint are persisted, or nothing is.
pub trait ReadModelStore: Send + Sync {
    /// Mutation type applied to the view.
    type Mutation: Send;

    /// Load the checkpoint of a view (`Position::BEGINNING` when unknown).
    ///
    /// # Errors
    ///
    /// Returns [`ProjectionError::Checkpoint`] if the checkpoint cannot be read.
    fn load_checkpoint(&self, view: &str) -> impl Future<Output = Result<Position>> + Send;

    /// Apply mutations and advance the checkpoint to `new`, but only if the
    /// stored checkpoint still equals `expected`.
    ///
    /// # Errors
    ///
    /// - [`ProjectionError::CheckpointMoved`] if the stored checkpoint differs
    ///   (nothing is applied)
    /// - [`ProjectionError::Storage`] if a mutation fails (nothing is applied)
    fn commit(
        &self,
        view: &str,
        expected: Position,
        mutations: Vec<Self::Mutation>,
        new: Position,
    ) -> impl Future<Output = Result<()>> + Send;

    /// Apply cleanup mutations and move the checkpoint back to the beginning.
    ///
    /// # Errors
    ///
    /// Returns [`ProjectionError::Storage`] if the reset fails.
    fn reset(&self, view: &str, cleanup: Vec<Self::Mutation>) -> impl Future<Output = Result<()>> + Send;
}

/// A view built from events.
pub trait Projection: Send + Sync {
    /// Domain event sum type.
    type Event: Send + Sync + 'static;

    /// Mutation type understood by the view's store.
    type Mutation: Send;

    /// View name (checkpoint and lock resource name). Unique per system.
    fn name(&self) -> &str;

    /// Events the view consumes. The runner adds the position bound, the
    /// ordering and the batch limit.
    fn query(&self) -> SearchQuery;

    /// Turn one event into view mutations.
    ///
    /// # Errors
    ///
    /// [`ProjectionError::EventProcessing`] if the event cannot be applied.
    fn reduce(&self, event: &RecordedEvent<Self::Event>) -> Result<Vec<Self::Mutation>>;

    /// Mutations that clear the view before a rebuild.
    fn reset(&self) -> Vec<Self::Mutation> {
        Vec::new()
    }
}

/// Reduce function stored in a [`ReducerTable`].
pub type ReduceFn<E, M> = Arc<dyn Fn(&RecordedEvent<E>) -> Result<Vec<M>> + Send + Sync>;

/// Closed dispatch table `(aggregate type, event type) -> reduce function`.
pub struct ReducerTable<E, M> {
    entries: BTreeMap<(AggregateType, EventType), ReduceFn<E, M>>,
}

impl<E, M> Default for ReducerTable<E, M> {
    fn default() -> Self {
        Self {
            entries: BTreeMap::new(),
        }
    }
}

impl<E, M> Clone for ReducerTable<E, M> {
    fn clone(&self) -> Self {
        Self {
            entries: self.entries.clone(),
        }
    }
}

impl<E, M> ReducerTable<E, M> {
    /// Empty table.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add or replace the reducer for one `(aggregate type, event type)`.
    #[must_use]
    pub fn on<F>(mut self, aggregate_type: impl Into<AggregateType>, event_type: impl Into<EventType>, reduce: F) -> Self
    where
        F: Fn(&RecordedEvent<E>) -> Result<Vec<M>> + Send + Sync + 'static,
    {
        self.entries
            .insert((aggregate_type.into(), event_type.into()), Arc::new(reduce));
        self
    }

    /// Compose with another table. Entries of `other` replace entries with
    /// the same key.
    #[must_use]
    pub fn extend(mut self, other: Self) -> Self {
        self.entries.extend(other.entries);
        self
    }

    /// Whether the table handles the given event.
    #[must_use]
    pub fn handles(&self, aggregate_type: &AggregateType, event_type: &EventType) -> bool {
        self.entries
            .contains_key(&(aggregate_type.clone(), event_type.clone()))
    }

    /// Number of entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the table has no entries.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Filter query covering exactly the table's entries: one sub-query per
    /// aggregate type, narrowed to the event types registered for it.
    #[must_use]
    pub fn query(&self) -> SearchQuery {
        let mut per_aggregate: BTreeMap<&AggregateType, Vec<EventType>> = BTreeMap::new();
        for (aggregate_type, event_type) in self.entries.keys() {
            per_aggregate
                .entry(aggregate_type)
                .or_default()
                .push(event_type.clone());
        }
        per_aggregate
            .into_iter()
            .fold(SearchQuery::new(), |query, (aggregate_type, event_types)| {
                query.add_query(
                    SubQuery::new()
                        .aggregate_types([aggregate_type.clone()])
                        .event_types(event_types),
                )
            })
    }

    /// Dispatch one event. Events without an entry produce no mutations.
    ///
    /// # Errors
    ///
    /// Whatever the reducer returns.
    pub fn reduce(&self, event: &RecordedEvent<E>) -> Result<Vec<M>> {
        let key = (
            event.meta.key.aggregate_type.clone(),
            event.meta.event_type.clone(),
        );
        match self.entries.get(&key) {
            Some(reduce) => reduce(event),
            None => Ok(Vec::new()),
        }
    }
}

impl<E, M> fmt::Debug for ReducerTable<E, M> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.entries.keys()).finish()
    }
}

/// A projection backed entirely by a [`ReducerTable`].
pub struct TableProjection<E, M> {
    name: String,
    table: ReducerTable<E, M>,
    reset: Arc<dyn Fn() -> Vec<M> + Send + Sync>,
}

impl<E, M: 'static> TableProjection<E, M> {
    /// Create a projection named `name`.
    #[must_use]
    pub fn new(name: impl Into<String>, table: ReducerTable<E, M>) -> Self {
        Self {
            name: name.into(),
            table,
            reset: Arc::new(Vec::new),
        }
    }

    /// Mutations that clear the view on rebuild.
    #[must_use]
    pub fn with_reset<F>(mut self, reset: F) -> Self
    where
        F: Fn() -> Vec<M> + Send + Sync + 'static,
    {
        self.reset = Arc::new(reset);
        self
    }

    /// The underlying table.
    #[must_use]
    pub const fn table(&self) -> &ReducerTable<E, M> {
        &self.table
    }

    /// Filter query derived from the table.
    #[must_use]
    pub fn query(&self) -> SearchQuery {
        self.table.query()
    }
}

impl<E, M> Projection for TableProjection<E, M>
where
    E: Send + Sync + 'static,
    M: Send,
{
    type Event = E;
    type Mutation = M;

    fn name(&self) -> &str {
        &self.name
    }

    fn query(&self) -> SearchQuery {
        self.table.query()
    }

    fn reduce(&self, event: &RecordedEvent<E>) -> Result<Vec<M>> {
        self.table.reduce(event)
    }

    fn reset(&self) -> Vec<M> {
        (self.reset)()
    }
}
