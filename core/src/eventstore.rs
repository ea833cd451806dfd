//! Typed facade over an [`EventStore`] and an [`EventTypeRegistry`].
//!
//! Command handlers and projection runners talk to the store through
//! [`Eventstore`]: it validates batches against the registry before
//! appending, decodes filtered events one by one, and loads write models.

use crate::event::{RecordedEvent, StoredEvent};
use crate::event_store::{AppendGroup, EventStore, EventStoreError, validate_groups};
use crate::registry::{DecodeError, EventTypeRegistry};
use crate::search::SearchQuery;
use crate::write_model::{ReduceError, WriteModel};
use futures::{Stream, StreamExt};
use std::sync::Arc;
use thiserror::Error;

/// Errors of the typed facade.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EventstoreError {
    /// The underlying store failed.
    #[error(transparent)]
    Store(#[from] EventStoreError),

    /// An event could not be decoded.
    #[error(transparent)]
    Decode(#[from] DecodeError),

    /// A write model was fed events out of order.
    #[error(transparent)]
    Reduce(#[from] ReduceError),
}

impl EventstoreError {
    /// Whether the error is an optimistic concurrency conflict.
    #[must_use]
    pub const fn is_conflict(&self) -> bool {
        matches!(self, Self::Store(e) if e.is_conflict())
    }
}

/// One item of a typed filter stream.
///
/// Decode failures are reported per event together with the raw event, so a
/// consumer can skip, dead-letter or halt without losing the rest of the
/// stream.
#[derive(Debug, Clone, PartialEq)]
pub enum FilterItem<E> {
    /// Successfully decoded event.
    Event(RecordedEvent<E>),
    /// Event that could not be decoded.
    Undecodable {
        /// Raw event as stored.
        raw: StoredEvent,
        /// Why decoding failed.
        error: DecodeError,
    },
}

/// Typed access to the event store.
pub struct Eventstore<E> {
    store: Arc<dyn EventStore>,
    registry: Arc<EventTypeRegistry<E>>,
}

impl<E> Clone for Eventstore<E> {
    fn clone(&self) -> Self {
        Self {
            store: Arc::clone(&self.store),
            registry: Arc::clone(&self.registry),
        }
    }
}

impl<E: Send + 'static> Eventstore<E> {
    /// Combine a store with a registry built at startup.
    #[must_use]
    pub fn new(store: Arc<dyn EventStore>, registry: Arc<EventTypeRegistry<E>>) -> Self {
        Self { store, registry }
    }

    /// The registry used for decoding.
    #[must_use]
    pub fn registry(&self) -> &EventTypeRegistry<E> {
        &self.registry
    }

    /// The raw store.
    #[must_use]
    pub fn store(&self) -> &Arc<dyn EventStore> {
        &self.store
    }

    /// Append a batch after validating it against the registry.
    ///
    /// # Errors
    ///
    /// - `Store(Validation)` if the batch is malformed or contains an event
    ///   type that is not registered (nothing is written)
    /// - `Store(ConcurrencyConflict)` if any expected sequence is stale
    /// - `Store(DatabaseError)` on storage failure
    pub async fn push(&self, groups: Vec<AppendGroup>) -> Result<Vec<StoredEvent>, EventstoreError> {
        validate_groups(&groups)?;
        if let Some(unregistered) = groups
            .iter()
            .flat_map(|g| g.events.iter())
            .find(|e| !self.registry.contains(e.event_type.as_str()))
        {
            return Err(EventStoreError::Validation(format!(
                "event type {} is not registered",
                unregistered.event_type
            ))
            .into());
        }
        Ok(self.store.append(groups).await?)
    }

    /// Append a batch and fold the committed events into the write model.
    ///
    /// # Errors
    ///
    /// Same as [`Eventstore::push`], plus decode or ordering failures while
    /// folding (the events are committed at that point).
    pub async fn push_and_reduce<W>(
        &self,
        model: &mut W,
        groups: Vec<AppendGroup>,
    ) -> Result<Vec<StoredEvent>, EventstoreError>
    where
        W: WriteModel<Event = E>,
    {
        let committed = self.push(groups).await?;
        let decoded = committed
            .iter()
            .map(|raw| self.registry.decode(raw))
            .collect::<Result<Vec<_>, _>>()?;
        model.reduce(&decoded)?;
        Ok(committed)
    }

    /// Stream decoded events matching the query.
    ///
    /// Store errors end the stream after being yielded; decode failures are
    /// yielded as [`FilterItem::Undecodable`] and the stream continues.
    pub fn filter(
        &self,
        query: SearchQuery,
    ) -> impl Stream<Item = Result<FilterItem<E>, EventStoreError>> + Send + '_ {
        let registry = Arc::clone(&self.registry);
        self.store.filter(query).map(move |item| {
            let raw = item?;
            Ok(match registry.decode(&raw) {
                Ok(event) => FilterItem::Event(event),
                Err(error) => FilterItem::Undecodable { raw, error },
            })
        })
    }

    /// Rebuild a write model from its query.
    ///
    /// Unknown event types are skipped (forward compatibility) but still
    /// advance the processed markers; malformed payloads fail the load since
    /// the command could not be validated safely. If the model's query
    /// narrows event types, the expected sequence is raised to the stream's
    /// current sequence afterwards.
    ///
    /// # Errors
    ///
    /// `Store` on storage failure, `Decode` on malformed payloads, `Reduce`
    /// if the store returned events out of order.
    pub async fn load<W>(&self, model: &mut W) -> Result<(), EventstoreError>
    where
        W: WriteModel<Event = E>,
    {
        let query = model.query();
        let narrows = query.narrows_event_types();
        let mut stream = self.filter(query);
        let mut applied = 0_usize;

        while let Some(item) = stream.next().await {
            match item? {
                FilterItem::Event(event) => {
                    model.reduce(std::iter::once(&event))?;
                    applied += 1;
                }
                FilterItem::Undecodable { raw, error } if error.is_unknown_type() => {
                    tracing::debug!(
                        key = %model.state().key,
                        error = %error,
                        "Skipping unknown event type while loading write model"
                    );
                    model.state_mut().track_raw(&raw)?;
                }
                FilterItem::Undecodable { error, .. } => return Err(error.into()),
            }
        }
        drop(stream);

        if narrows {
            let key = model.state().key.clone();
            let current = self.store.current_sequence(&key).await?;
            model.state_mut().observe_sequence(current);
        }

        tracing::trace!(
            key = %model.state().key,
            applied,
            sequence = %model.expected_sequence(),
            "Write model loaded"
        );
        Ok(())
    }
}
