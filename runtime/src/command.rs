//! Rebuild, decide, append: the command cycle.
//!
//! [`CommandExecutor::execute`] builds a fresh write model, loads its
//! history, asks the caller's decision function which events to append and
//! appends them with the model's processed sequence as the expected
//! sequence. A concurrency conflict throws the model away and starts over,
//! up to `max_conflict_retries` times. Transient storage errors are retried
//! in place with the storage retry policy.

use crate::metrics::CommandMetrics;
use crate::retry::{RetryPolicy, retry_transient};
use eventide_core::crypto::CryptoError;
use eventide_core::event::{EventError, PendingEvent, StoredEvent};
use eventide_core::event_store::AppendGroup;
use eventide_core::eventstore::{Eventstore, EventstoreError};
use eventide_core::write_model::WriteModel;
use thiserror::Error;

/// Errors returned by command handlers.
#[derive(Error, Debug)]
pub enum CommandError {
    /// Conflicts persisted through every retry.
    #[error("Concurrency conflict persisted after {attempts} attempts")]
    Conflict {
        /// Attempts made, including the first.
        attempts: usize,
        /// Last conflict.
        source: EventstoreError,
    },

    /// The aggregate does not exist.
    #[error("Not found: {0}")]
    NotFound(String),

    /// The aggregate already exists.
    #[error("Already exists: {0}")]
    AlreadyExists(String),

    /// The command is invalid for the current state.
    #[error("Rejected: {0}")]
    Rejected(String),

    /// Encrypting a sensitive field failed.
    #[error(transparent)]
    Crypto(#[from] CryptoError),

    /// Encoding an event payload failed.
    #[error(transparent)]
    Event(#[from] EventError),

    /// Loading or appending failed.
    #[error(transparent)]
    Eventstore(#[from] EventstoreError),
}

/// Result of a successful command.
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    /// Events were appended.
    Committed(Vec<StoredEvent>),
    /// The decision produced no events.
    Unchanged,
}

impl Outcome {
    /// Committed events, empty when unchanged.
    #[must_use]
    pub fn events(&self) -> &[StoredEvent] {
        match self {
            Self::Committed(events) => events,
            Self::Unchanged => &[],
        }
    }

    /// Whether anything was appended.
    #[must_use]
    pub const fn is_committed(&self) -> bool {
        matches!(self, Self::Committed(_))
    }
}

/// A write model after the command, with what happened.
#[derive(Debug)]
pub struct Executed<W> {
    /// Model reduced over the loaded history and the new events.
    pub model: W,
    /// What the command did.
    pub outcome: Outcome,
}

/// Runs commands against one event store.
pub struct CommandExecutor<E> {
    eventstore: Eventstore<E>,
    max_conflict_retries: usize,
    storage_retry: RetryPolicy,
}

impl<E> Clone for CommandExecutor<E> {
    fn clone(&self) -> Self {
        Self {
            eventstore: self.eventstore.clone(),
            max_conflict_retries: self.max_conflict_retries,
            storage_retry: self.storage_retry.clone(),
        }
    }
}

impl<E: Send + 'static> CommandExecutor<E> {
    /// Executor with three conflict retries and the default storage policy.
    #[must_use]
    pub fn new(eventstore: Eventstore<E>) -> Self {
        Self {
            eventstore,
            max_conflict_retries: 3,
            storage_retry: RetryPolicy::default(),
        }
    }

    /// Set the number of rebuild-and-retry attempts after a conflict.
    #[must_use]
    pub const fn with_max_conflict_retries(mut self, retries: usize) -> Self {
        self.max_conflict_retries = retries;
        self
    }

    /// Set the retry policy for transient storage errors.
    #[must_use]
    pub fn with_storage_retry(mut self, policy: RetryPolicy) -> Self {
        self.storage_retry = policy;
        self
    }

    /// The underlying event store facade.
    #[must_use]
    pub const fn eventstore(&self) -> &Eventstore<E> {
        &self.eventstore
    }

    /// Load a fresh write model, retrying transient storage errors.
    ///
    /// # Errors
    ///
    /// Returns [`EventstoreError`] if loading fails.
    pub async fn load<W, B>(&self, build: B) -> Result<W, EventstoreError>
    where
        W: WriteModel<Event = E> + Send,
        B: Fn() -> W,
    {
        let build = &build;
        let eventstore = &self.eventstore;
        retry_transient(self.storage_retry.clone(), || async move {
            let mut model = build();
            eventstore.load(&mut model).await?;
            Ok(model)
        })
        .await
    }

    /// Run the command cycle.
    ///
    /// `decide` sees the freshly loaded model and returns the events to
    /// append to the model's stream, or `None` when nothing changes. It may
    /// run several times, so it must not have side effects.
    ///
    /// # Errors
    ///
    /// - whatever `decide` returns
    /// - [`CommandError::Conflict`] once conflict retries are exhausted
    /// - [`CommandError::Eventstore`] for any other store failure
    pub async fn execute<W, B, D>(&self, build: B, decide: D) -> Result<Executed<W>, CommandError>
    where
        W: WriteModel<Event = E> + Send,
        B: Fn() -> W,
        D: Fn(&W) -> Result<Option<Vec<PendingEvent>>, CommandError>,
    {
        let mut attempt = 0;

        loop {
            attempt += 1;
            let mut model = self.load(&build).await?;

            let events = match decide(&model)? {
                Some(events) if !events.is_empty() => events,
                _ => {
                    CommandMetrics::record_unchanged();
                    tracing::debug!(key = %model.state().key, "Command produced no events");
                    return Ok(Executed {
                        model,
                        outcome: Outcome::Unchanged,
                    });
                }
            };

            let key = model.state().key.clone();
            let expected = model.expected_sequence();
            let group = AppendGroup::new(key.clone(), expected, events);

            match self.eventstore.push_and_reduce(&mut model, vec![group]).await {
                Ok(committed) => {
                    CommandMetrics::record_committed();
                    tracing::debug!(
                        key = %key,
                        expected = %expected,
                        events = committed.len(),
                        "Command committed"
                    );
                    return Ok(Executed {
                        model,
                        outcome: Outcome::Committed(committed),
                    });
                }
                Err(err) if err.is_conflict() && attempt <= self.max_conflict_retries => {
                    CommandMetrics::record_conflict_retry();
                    tracing::info!(key = %key, attempt, error = %err, "Concurrency conflict, rebuilding write model");
                }
                Err(err) if err.is_conflict() => {
                    tracing::warn!(key = %key, attempts = attempt, "Giving up after repeated concurrency conflicts");
                    return Err(CommandError::Conflict {
                        attempts: attempt,
                        source: err,
                    });
                }
                Err(err) => return Err(err.into()),
            }
        }
    }
}
