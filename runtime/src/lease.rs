//! Lease keeping for a single `(resource, owner)` pair.
//!
//! [`LeaseKeeper`] acquires a lease with bounded retries, renews it in the
//! background once a fraction of the TTL has elapsed, and publishes its
//! [`LeaseStatus`] on a watch channel. Validity is judged locally against a
//! deadline measured from *before* each request was sent, so a slow response
//! can only make the keeper more pessimistic, never less.
//!
//! Callers re-validate with [`LeaseKeeper::ensure_held`] before every
//! commit. The lock store's own expiry stays authoritative: the local
//! deadline only decides when to stop working.

use crate::metrics::LockMetrics;
use crate::retry::{RetryPolicy, retry_transient};
use eventide_core::lock::{LeaseState, LockError, Locker};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;

/// Lease timing and retry settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LeaseConfig {
    /// Lease duration requested on acquire and renew.
    #[serde(with = "crate::retry::duration_ms")]
    pub ttl: Duration,
    /// Fraction of the TTL after which a renewal is sent.
    pub renew_fraction: f64,
    /// Retries for transient storage errors.
    pub retry: RetryPolicy,
}

impl Default for LeaseConfig {
    fn default() -> Self {
        Self {
            ttl: Duration::from_secs(30),
            renew_fraction: 0.5,
            retry: RetryPolicy::default(),
        }
    }
}

impl LeaseConfig {
    /// Time between a successful request and the next renewal.
    #[must_use]
    pub fn renew_interval(&self) -> Duration {
        self.ttl.mul_f64(self.renew_fraction.clamp(0.05, 0.95))
    }
}

/// Snapshot of a keeper's lease.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LeaseStatus {
    /// Current lifecycle state.
    pub state: LeaseState,
    /// Local validity deadline while held.
    pub deadline: Option<Instant>,
}

impl LeaseStatus {
    const fn new(state: LeaseState, deadline: Option<Instant>) -> Self {
        Self { state, deadline }
    }

    /// Whether the lease may still be used at `now`.
    #[must_use]
    pub fn is_valid_at(&self, now: Instant) -> bool {
        self.state.is_active() && self.deadline.is_some_and(|d| now < d)
    }
}

/// Acquires, renews and releases one lease.
pub struct LeaseKeeper {
    locker: Arc<dyn Locker>,
    resource: String,
    owner: String,
    config: LeaseConfig,
    status: Arc<watch::Sender<LeaseStatus>>,
    renewal: Option<JoinHandle<()>>,
}

impl LeaseKeeper {
    /// Create a keeper; nothing is acquired yet.
    #[must_use]
    pub fn new(locker: Arc<dyn Locker>, resource: impl Into<String>, owner: impl Into<String>, config: LeaseConfig) -> Self {
        let (status, _) = watch::channel(LeaseStatus::new(LeaseState::Unlocked, None));
        Self {
            locker,
            resource: resource.into(),
            owner: owner.into(),
            config,
            status: Arc::new(status),
            renewal: None,
        }
    }

    /// Locked resource.
    #[must_use]
    pub fn resource(&self) -> &str {
        &self.resource
    }

    /// Owner identity.
    #[must_use]
    pub fn owner(&self) -> &str {
        &self.owner
    }

    /// Acquire the lease and start background renewal.
    ///
    /// Storage errors are retried with the configured policy; `Held` is
    /// returned immediately so the caller can back off.
    ///
    /// # Errors
    ///
    /// `Held` if another owner holds the lease, `Storage` once retries are
    /// exhausted, `Invalid` for bad arguments.
    pub async fn acquire(&mut self) -> Result<(), LockError> {
        self.stop_renewal();
        self.status.send_replace(LeaseStatus::new(LeaseState::Acquiring, None));

        let sent_at = Instant::now();
        let locker = Arc::clone(&self.locker);
        let result = retry_transient(self.config.retry.clone(), || {
            locker.acquire(&self.resource, &self.owner, self.config.ttl)
        })
        .await;

        match result {
            Ok(lease) => {
                self.status.send_replace(LeaseStatus::new(LeaseState::Held, Some(sent_at + self.config.ttl)));
                LockMetrics::record_acquired();
                tracing::debug!(
                    resource = %self.resource,
                    owner = %self.owner,
                    expires_at = %lease.expires_at,
                    "Lease acquired"
                );
                self.renewal = Some(tokio::spawn(renew_loop(
                    Arc::clone(&self.locker),
                    self.resource.clone(),
                    self.owner.clone(),
                    self.config.clone(),
                    Arc::clone(&self.status),
                    sent_at,
                )));
                Ok(())
            }
            Err(err) => {
                self.status.send_replace(LeaseStatus::new(LeaseState::Unlocked, None));
                if matches!(err, LockError::Held { .. }) {
                    LockMetrics::record_held();
                    tracing::trace!(resource = %self.resource, owner = %self.owner, "Lease held by another owner");
                } else {
                    tracing::warn!(resource = %self.resource, owner = %self.owner, error = %err, "Lease acquisition failed");
                }
                Err(err)
            }
        }
    }

    /// Current status as published by the keeper.
    #[must_use]
    pub fn status(&self) -> LeaseStatus {
        *self.status.borrow()
    }

    /// Current state; an active lease past its local deadline reads as
    /// `Expired`.
    #[must_use]
    pub fn state(&self) -> LeaseState {
        let status = self.status();
        if status.state.is_active() && !status.is_valid_at(Instant::now()) {
            return LeaseState::Expired;
        }
        status.state
    }

    /// Whether the lease may be used right now.
    #[must_use]
    pub fn is_held(&self) -> bool {
        self.status().is_valid_at(Instant::now())
    }

    /// Re-validate before a commit.
    ///
    /// # Errors
    ///
    /// [`LockError::Lost`] if the lease is not held or its deadline passed.
    pub fn ensure_held(&self) -> Result<(), LockError> {
        if self.is_held() {
            return Ok(());
        }
        Err(LockError::Lost {
            resource: self.resource.clone(),
            owner: self.owner.clone(),
        })
    }

    /// Watch status changes.
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<LeaseStatus> {
        self.status.subscribe()
    }

    /// Stop renewing and delete the lock record if still owned.
    ///
    /// # Errors
    ///
    /// `Storage` if the release fails after retries. The lease then simply
    /// expires.
    pub async fn release(&mut self) -> Result<(), LockError> {
        self.stop_renewal();
        let was_held = self.is_held();
        self.status.send_replace(LeaseStatus::new(LeaseState::Unlocked, None));
        if !was_held {
            return Ok(());
        }
        let locker = Arc::clone(&self.locker);
        retry_transient(self.config.retry.clone(), || locker.release(&self.resource, &self.owner)).await?;
        tracing::debug!(resource = %self.resource, owner = %self.owner, "Lease released");
        Ok(())
    }

    fn stop_renewal(&mut self) {
        if let Some(handle) = self.renewal.take() {
            handle.abort();
        }
    }
}

impl Drop for LeaseKeeper {
    fn drop(&mut self) {
        self.stop_renewal();
    }
}

impl std::fmt::Debug for LeaseKeeper {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LeaseKeeper")
            .field("resource", &self.resource)
            .field("owner", &self.owner)
            .field("status", &self.status())
            .finish_non_exhaustive()
    }
}

async fn renew_loop(
    locker: Arc<dyn Locker>,
    resource: String,
    owner: String,
    config: LeaseConfig,
    status: Arc<watch::Sender<LeaseStatus>>,
    acquired_at: Instant,
) {
    let interval = config.renew_interval();
    let mut next = acquired_at + interval;

    loop {
        tokio::time::sleep_until(next).await;

        let Some(deadline) = status.borrow().deadline else {
            return;
        };
        let sent_at = Instant::now();
        if sent_at >= deadline {
            status.send_replace(LeaseStatus::new(LeaseState::Expired, None));
            LockMetrics::record_expired();
            tracing::warn!(resource = %resource, owner = %owner, "Lease expired before renewal");
            return;
        }

        status.send_replace(LeaseStatus::new(LeaseState::Renewing, Some(deadline)));
        let result = retry_transient(config.retry.clone(), || locker.renew(&resource, &owner, config.ttl)).await;

        match result {
            Ok(_) => {
                status.send_replace(LeaseStatus::new(LeaseState::Held, Some(sent_at + config.ttl)));
                LockMetrics::record_renewed();
                tracing::trace!(resource = %resource, owner = %owner, "Lease renewed");
                next = sent_at + interval;
            }
            Err(LockError::Storage(reason)) => {
                let now = Instant::now();
                if now >= deadline {
                    status.send_replace(LeaseStatus::new(LeaseState::Expired, None));
                    LockMetrics::record_expired();
                    tracing::warn!(resource = %resource, owner = %owner, %reason, "Lease expired, renewal kept failing");
                    return;
                }
                status.send_replace(LeaseStatus::new(LeaseState::Held, Some(deadline)));
                tracing::warn!(resource = %resource, owner = %owner, %reason, "Lease renewal failed, will retry");
                next = now + interval.min((deadline - now) / 2);
            }
            Err(err) => {
                status.send_replace(LeaseStatus::new(LeaseState::Lost, None));
                LockMetrics::record_lost();
                tracing::warn!(resource = %resource, owner = %owner, error = %err, "Lease lost");
                return;
            }
        }
    }
}
