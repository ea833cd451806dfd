//! Event store trait and related types.
//!
//! The event store is an append-only log. It provides exactly two things:
//!
//! - conditional, all-or-nothing appends spanning one or more aggregate
//!   streams (optimistic concurrency on each stream's current sequence);
//! - lazy, ordered, filtered retrieval.
//!
//! Decoding into typed events is not the store's job; see
//! [`Eventstore`](crate::eventstore::Eventstore) for the typed facade.
//!
//! # Implementations
//!
//! - `PostgresEventStore` (in `eventide-postgres`): production implementation
//! - `InMemoryEventStore` (in `eventide-testing`): fast, deterministic testing
//!
//! # Example
//!
//! ```no_run
//! use eventide_core::event::PendingEvent;
//! use eventide_core::event_store::{AppendGroup, EventStore, EventStoreError};
//! use eventide_core::stream::{AggregateKey, Sequence};
//!
//! async fn example<S: EventStore>(store: &S) -> Result<(), EventStoreError> {
//!     let key = AggregateKey::new("inst", "org", "org-1");
//!     let committed = store
//!         .append(vec![AppendGroup::new(
//!             key,
//!             Sequence::INITIAL,
//!             vec![PendingEvent::new("org.added", "org-1", "admin", vec![])],
//!         )])
//!         .await?;
//!     assert_eq!(committed[0].meta.sequence, Sequence::new(1));
//!     Ok(())
//! }
//! ```

use crate::event::{PendingEvent, StoredEvent};
use crate::search::SearchQuery;
use crate::stream::{AggregateKey, Sequence};
use futures::Stream;
use std::collections::HashSet;
use std::future::Future;
use std::pin::Pin;
use thiserror::Error;

/// Errors that can occur during event store operations.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EventStoreError {
    /// Optimistic concurrency conflict: the expected sequence is stale.
    ///
    /// Nothing of the batch was persisted. The caller rebuilds its state and
    /// retries.
    #[error("Concurrency conflict on {key}: expected sequence {expected}, found {}", display_actual(.actual))]
    ConcurrencyConflict {
        /// The stream where the conflict occurred.
        key: AggregateKey,
        /// The sequence the caller expected.
        expected: Sequence,
        /// The stream's actual sequence, when known.
        actual: Option<Sequence>,
    },

    /// The batch or query is structurally invalid; rejected before any write.
    #[error("Validation error: {0}")]
    Validation(String),

    /// Database connection or query error. Transient; retried with backoff.
    #[error("Database error: {0}")]
    DatabaseError(String),

    /// Serialization/deserialization error.
    #[error("Serialization error: {0}")]
    SerializationError(String),
}

fn display_actual(actual: &Option<Sequence>) -> String {
    actual.map_or_else(|| "unknown".to_string(), |s| s.to_string())
}

impl EventStoreError {
    /// Whether the error is transient and the operation may be retried as is.
    ///
    /// Conflicts are not retryable as is: the caller must rebuild first.
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        matches!(self, Self::DatabaseError(_))
    }

    /// Whether the error is an optimistic concurrency conflict.
    #[must_use]
    pub const fn is_conflict(&self) -> bool {
        matches!(self, Self::ConcurrencyConflict { .. })
    }
}

/// Events to append to one aggregate stream, with the expected current sequence.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AppendGroup {
    /// Target stream.
    pub key: AggregateKey,
    /// Sequence the stream must be at when the batch commits.
    pub expected: Sequence,
    /// Events to append, in order.
    pub events: Vec<PendingEvent>,
}

impl AppendGroup {
    /// Create a new append group.
    #[must_use]
    pub const fn new(key: AggregateKey, expected: Sequence, events: Vec<PendingEvent>) -> Self {
        Self {
            key,
            expected,
            events,
        }
    }
}

/// Check a batch for structural problems before touching storage.
///
/// # Errors
///
/// Returns [`EventStoreError::Validation`] if the batch is empty, a group has
/// no events or an empty key part, an event has an empty type tag, or two
/// groups target the same stream.
pub fn validate_groups(groups: &[AppendGroup]) -> Result<(), EventStoreError> {
    if groups.is_empty() {
        return Err(EventStoreError::Validation("append batch is empty".to_string()));
    }
    let mut seen = HashSet::with_capacity(groups.len());
    for group in groups {
        if group.key.has_empty_part() {
            return Err(EventStoreError::Validation(format!(
                "aggregate key {} has an empty component",
                group.key
            )));
        }
        if group.events.is_empty() {
            return Err(EventStoreError::Validation(format!(
                "append group for {} has no events",
                group.key
            )));
        }
        if group.events.iter().any(|e| e.event_type.as_str().is_empty()) {
            return Err(EventStoreError::Validation(format!(
                "append group for {} contains an event without type",
                group.key
            )));
        }
        if !seen.insert(&group.key) {
            return Err(EventStoreError::Validation(format!(
                "aggregate {} appears in more than one group",
                group.key
            )));
        }
    }
    Ok(())
}

/// Lazy stream of stored events.
pub type EventStream<'a> = Pin<Box<dyn Stream<Item = Result<StoredEvent, EventStoreError>> + Send + 'a>>;

/// Boxed future returned by the dyn-compatible store methods.
pub type StoreFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, EventStoreError>> + Send + 'a>>;

/// Append-only event log with optimistic concurrency.
///
/// # Thread Safety
///
/// Implementations must be `Send + Sync`; they are shared across command
/// handlers and projection workers.
///
/// # Dyn Compatibility
///
/// Methods return boxed futures and streams so the store can be used as
/// `Arc<dyn EventStore>`.
pub trait EventStore: Send + Sync {
    /// Append all groups atomically.
    ///
    /// On success every event is persisted with contiguous sequences per
    /// stream (starting at `expected + 1`), a global position and a
    /// server-assigned timestamp; the committed events are returned in append
    /// order. On failure nothing is persisted.
    ///
    /// Dropping the returned future before it completes aborts the
    /// transaction with no partial effect.
    ///
    /// # Errors
    ///
    /// - `Validation`: see [`validate_groups`]
    /// - `ConcurrencyConflict`: a group's expected sequence is stale
    /// - `DatabaseError`: storage failure after retries
    fn append(&self, groups: Vec<AppendGroup>) -> StoreFuture<'_, Vec<StoredEvent>>;

    /// Stream events matching the query, in the query's order.
    ///
    /// The stream is lazy and finite. Calling `filter` again with the same
    /// query restarts from the beginning. An invalid query yields a single
    /// `Validation` error item.
    fn filter(&self, query: SearchQuery) -> EventStream<'_>;

    /// Current sequence of one stream (`Sequence::INITIAL` when empty).
    ///
    /// # Errors
    ///
    /// `DatabaseError` on storage failure.
    fn current_sequence(&self, key: &AggregateKey) -> StoreFuture<'_, Sequence>;
}
