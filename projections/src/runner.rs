//! `ProjectionRunner` keeps one view up to date.
//!
//! # Overview
//!
//! The runner coordinates the lifecycle of a view:
//! - Holds the view's lease so only one worker builds it
//! - Filters events after the view's checkpoint, in position order
//! - Reduces them to mutations and commits mutations plus the new checkpoint
//!   through the [`ReadModelStore`] in one compare-and-set
//! - Applies the configured [`DecodeFailurePolicy`] to undecodable events
//! - Supports rebuilding the view from scratch
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────┐  filter after    ┌──────────────────┐
//! │ Event Store │ ───checkpoint──▶ │ ProjectionRunner │ ◀── lease (Locker)
//! └─────────────┘                  └────────┬─────────┘
//!                                           │ mutations + checkpoint (CAS)
//!                                           ▼
//!                                  ┌──────────────────┐
//!                                  │  ReadModelStore  │
//!                                  └──────────────────┘
//! ```
//!
//! # Exactly once
//!
//! The lease keeps a second worker away in the normal case. If two workers
//! nevertheless compute a batch from the same checkpoint (a lease lapsed
//! mid-batch), the checkpoint compare-and-set lets only the first commit
//! through; the other batch is discarded with
//! [`ProjectionError::CheckpointMoved`].
//!
//! # Example
//!
//! ```ignore
//! let (mut runner, shutdown) = ProjectionRunner::new(projection, store, eventstore, locker, config);
//!
//! tokio::spawn(async move {
//!     tokio::signal::ctrl_c().await.ok();
//!     shutdown.send(true).ok();
//! });
//!
//! runner.run().await?;
//! ```

use eventide_core::dead_letter::DeadLetterSink;
use eventide_core::eventstore::{Eventstore, FilterItem};
use eventide_core::lock::{LockError, Locker};
use eventide_core::projection::{DecodeFailurePolicy, Projection, ProjectionError, ReadModelStore, Result};
use eventide_core::stream::Position;
use eventide_runtime::config::EventideConfig;
use eventide_runtime::lease::{LeaseConfig, LeaseKeeper};
use eventide_runtime::metrics::ProjectionMetrics;
use futures::StreamExt;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;

/// Settings of a [`ProjectionRunner`].
#[derive(Debug, Clone, PartialEq)]
pub struct RunnerConfig {
    /// Maximum events per batch.
    pub batch_size: usize,
    /// Pause after an empty batch, a failed cycle or while another worker
    /// holds the lease.
    pub poll_interval: Duration,
    /// What to do with events that fail to decode.
    pub decode_failure_policy: DecodeFailurePolicy,
    /// Identity of this worker in lock records.
    pub owner_id: String,
    /// Lease timing.
    pub lease: LeaseConfig,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            batch_size: 200,
            poll_interval: Duration::from_secs(1),
            decode_failure_policy: DecodeFailurePolicy::default(),
            owner_id: format!("eventide-{}", std::process::id()),
            lease: LeaseConfig::default(),
        }
    }
}

impl From<&EventideConfig> for RunnerConfig {
    fn from(config: &EventideConfig) -> Self {
        Self {
            batch_size: config.projection.batch_size,
            poll_interval: config.projection.poll_interval,
            decode_failure_policy: config.projection.decode_failure_policy,
            owner_id: config.projection.owner_id.clone(),
            lease: config.lease.clone(),
        }
    }
}

/// Result of one batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BatchOutcome {
    /// No events after the checkpoint.
    Idle,
    /// Mutations and the new checkpoint were committed.
    Committed {
        /// Events the batch covered, including skipped and dead-lettered ones.
        events: usize,
        /// Checkpoint after the commit.
        checkpoint: Position,
    },
}

/// Builds one view from the event store.
///
/// # Type Parameters
///
/// - `P`: the projection (reducers and filter query)
/// - `S`: the view's store; its mutation type must match the projection's
pub struct ProjectionRunner<P, S>
where
    P: Projection,
{
    projection: Arc<P>,
    store: S,
    eventstore: Eventstore<P::Event>,
    locker: Arc<dyn Locker>,
    dead_letters: Option<Arc<dyn DeadLetterSink>>,
    config: RunnerConfig,
    shutdown: watch::Receiver<bool>,
}

impl<P, S> ProjectionRunner<P, S>
where
    P: Projection,
    S: ReadModelStore<Mutation = P::Mutation>,
{
    /// Create a runner.
    ///
    /// Returns the runner and a shutdown sender. Send `true` to stop
    /// [`ProjectionRunner::run`] after the current batch.
    #[must_use]
    pub fn new(
        projection: P,
        store: S,
        eventstore: Eventstore<P::Event>,
        locker: Arc<dyn Locker>,
        config: RunnerConfig,
    ) -> (Self, watch::Sender<bool>) {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let runner = Self {
            projection: Arc::new(projection),
            store,
            eventstore,
            locker,
            dead_letters: None,
            config,
            shutdown: shutdown_rx,
        };

        (runner, shutdown_tx)
    }

    /// Sink for events dead-lettered under [`DecodeFailurePolicy::DeadLetter`].
    #[must_use]
    pub fn with_dead_letters(mut self, sink: Arc<dyn DeadLetterSink>) -> Self {
        self.dead_letters = Some(sink);
        self
    }

    /// View name.
    #[must_use]
    pub fn name(&self) -> &str {
        self.projection.name()
    }

    /// The view's store.
    #[must_use]
    pub const fn store(&self) -> &S {
        &self.store
    }

    /// A keeper for this view's lease, owned by the configured worker.
    #[must_use]
    pub fn lease_keeper(&self) -> LeaseKeeper {
        LeaseKeeper::new(
            Arc::clone(&self.locker),
            self.projection.name(),
            self.config.owner_id.clone(),
            self.config.lease.clone(),
        )
    }

    /// Process events until a shutdown signal is received.
    ///
    /// Waits for the lease while another worker holds it, takes it over when
    /// it lapses, and keeps going through transient failures: a failed cycle
    /// is logged and retried after the poll interval.
    ///
    /// # Errors
    ///
    /// - [`ProjectionError::Decode`] when an event cannot be decoded under
    ///   [`DecodeFailurePolicy::Halt`]
    /// - [`ProjectionError::Lock`] for invalid lock arguments
    #[allow(clippy::cognitive_complexity)]
    pub async fn run(&mut self) -> Result<()> {
        let view = self.projection.name().to_string();
        tracing::info!(view = %view, owner = %self.config.owner_id, "Starting projection runner");

        let mut keeper = self.lease_keeper();
        let result = loop {
            if *self.shutdown.borrow() {
                break Ok(());
            }

            if !keeper.is_held() {
                match keeper.acquire().await {
                    Ok(()) => tracing::info!(view = %view, "Lease acquired, building view"),
                    Err(LockError::Held { .. }) => {
                        self.pause().await;
                        continue;
                    }
                    Err(e @ LockError::Invalid(_)) => break Err(e.into()),
                    Err(e) => {
                        tracing::warn!(view = %view, error = %e, "Could not acquire lease");
                        self.pause().await;
                        continue;
                    }
                }
            }

            match self.run_batch(&keeper).await {
                Ok(BatchOutcome::Committed { events, .. }) if events >= self.config.batch_size => {}
                Ok(_) => self.pause().await,
                Err(ProjectionError::CheckpointMoved { expected, actual, .. }) => {
                    tracing::warn!(
                        view = %view,
                        expected = %expected,
                        actual = %actual,
                        "Checkpoint moved under the runner, batch discarded"
                    );
                }
                Err(ProjectionError::Lock(e)) => {
                    tracing::warn!(view = %view, error = %e, "Lease no longer valid, batch discarded");
                }
                Err(e @ ProjectionError::Decode(_)) => break Err(e),
                Err(e) => {
                    tracing::error!(view = %view, error = %e, "Projection cycle failed");
                    self.pause().await;
                }
            }
        };

        if let Err(e) = keeper.release().await {
            tracing::warn!(view = %view, error = %e, "Failed to release lease");
        }
        tracing::info!(view = %view, "Projection runner stopped");
        result
    }

    /// Run one batch under `lease`.
    ///
    /// # Errors
    ///
    /// - [`ProjectionError::Lock`] if the lease is not held before reading
    ///   or before committing (nothing is committed)
    /// - [`ProjectionError::CheckpointMoved`] if another runner committed
    ///   first (the batch is discarded)
    /// - [`ProjectionError::Decode`] under [`DecodeFailurePolicy::Halt`];
    ///   events before the undecodable one are committed first
    /// - [`ProjectionError::Store`], [`ProjectionError::Storage`] or a
    ///   reducer's error otherwise (nothing is committed)
    pub async fn run_batch(&self, lease: &LeaseKeeper) -> Result<BatchOutcome> {
        lease.ensure_held()?;
        let started = Instant::now();
        let view = self.projection.name();

        let checkpoint = self.store.load_checkpoint(view).await?;
        let query = self
            .projection
            .query()
            .order_asc()
            .position_after(checkpoint)
            .limit(u64::try_from(self.config.batch_size).unwrap_or(u64::MAX));

        let mut mutations = Vec::new();
        let mut last = None;
        let mut events = 0_usize;
        let mut halted = None;

        let mut stream = self.eventstore.filter(query);
        while let Some(item) = stream.next().await {
            match item? {
                FilterItem::Event(event) => {
                    mutations.extend(self.projection.reduce(&event)?);
                    last = Some(event.position());
                }
                FilterItem::Undecodable { raw, error } => match self.config.decode_failure_policy {
                    DecodeFailurePolicy::Skip => {
                        tracing::warn!(view = view, position = %raw.meta.position, error = %error, "Skipping undecodable event");
                        ProjectionMetrics::record_skipped(view);
                        last = Some(raw.meta.position);
                    }
                    DecodeFailurePolicy::DeadLetter => {
                        let sink = self.dead_letters.as_ref().ok_or_else(|| {
                            ProjectionError::Other(format!("{view} dead-letters events but has no dead-letter sink"))
                        })?;
                        sink.record(view, &raw, &error.to_string()).await?;
                        tracing::warn!(view = view, position = %raw.meta.position, error = %error, "Dead-lettered undecodable event");
                        ProjectionMetrics::record_dead_lettered(view);
                        last = Some(raw.meta.position);
                    }
                    DecodeFailurePolicy::Halt => {
                        tracing::error!(view = view, position = %raw.meta.position, error = %error, "Halting on undecodable event");
                        halted = Some(error);
                        break;
                    }
                },
            }
            events += 1;
        }
        drop(stream);

        let outcome = match last {
            None => BatchOutcome::Idle,
            Some(new) => {
                lease.ensure_held()?;
                if let Err(e) = self.store.commit(view, checkpoint, mutations, new).await {
                    if e.is_checkpoint_moved() {
                        ProjectionMetrics::record_checkpoint_moved(view);
                    }
                    return Err(e);
                }
                ProjectionMetrics::record_batch(view, events, started.elapsed());
                tracing::debug!(view = view, events = events, checkpoint = %new, "Batch committed");
                BatchOutcome::Committed {
                    events,
                    checkpoint: new,
                }
            }
        };

        match halted {
            Some(error) => Err(error.into()),
            None => Ok(outcome),
        }
    }

    /// Clear the view and reset its checkpoint so it is replayed from the
    /// start.
    ///
    /// Takes the view's lease for the duration of the reset under a separate
    /// owner ID (`<owner>/rebuild`), so it waits for no one: if any worker
    /// holds the lease, this runner's own `run` loop included, this fails
    /// with [`LockError::Held`] and the holder keeps its lease.
    ///
    /// # Errors
    ///
    /// [`ProjectionError::Lock`] if the lease cannot be taken,
    /// [`ProjectionError::Storage`] if the reset fails.
    pub async fn rebuild(&self) -> Result<()> {
        let view = self.projection.name();
        tracing::info!(view = view, "Rebuilding view");

        let mut keeper = LeaseKeeper::new(
            Arc::clone(&self.locker),
            view,
            format!("{}/rebuild", self.config.owner_id),
            self.config.lease.clone(),
        );
        keeper.acquire().await?;
        let reset = self.store.reset(view, self.projection.reset()).await;
        if let Err(e) = keeper.release().await {
            tracing::warn!(view = view, error = %e, "Failed to release lease after rebuild");
        }
        reset?;

        tracing::info!(view = view, "View reset, events will be replayed");
        Ok(())
    }

    async fn pause(&mut self) {
        let poll = self.config.poll_interval;
        tokio::select! {
            () = tokio::time::sleep(poll) => {}
            changed = self.shutdown.changed() => {
                // Sender dropped; changed() would return at once from now on.
                if changed.is_err() {
                    tokio::time::sleep(poll).await;
                }
            }
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn config_from_environment_settings() {
        let config = EventideConfig::from_lookup(|name| match name {
            "EVENTIDE_DATABASE_URL" => Some("postgres://localhost/eventide".to_string()),
            "EVENTIDE_PROJECTION_BATCH_SIZE" => Some("50".to_string()),
            "EVENTIDE_DECODE_FAILURE_POLICY" => Some("halt".to_string()),
            "EVENTIDE_WORKER_ID" => Some("worker-7".to_string()),
            _ => None,
        });
        let runner = RunnerConfig::from(&config.unwrap());

        assert_eq!(runner.batch_size, 50);
        assert_eq!(runner.decode_failure_policy, DecodeFailurePolicy::Halt);
        assert_eq!(runner.owner_id, "worker-7");
    }
}
