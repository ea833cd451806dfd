//! Lease-based distributed locks.
//!
//! A lock record `{resource, owner, lease expiry}` grants its owner exclusive
//! rights on a named resource (a projection) until the lease expires. Every
//! operation is a single conditional write so that two callers can never both
//! observe "no valid lock" and both succeed.
//!
//! Crash safety relies on expiry: a worker that dies simply stops renewing.
//! [`Locker::release`] only shortens failover.
//!
//! ```text
//!  Unlocked ──acquire──▶ Acquiring ──ok──▶ Held ◀──ok── Renewing
//!                            │              │  └──renew──▶ │
//!                        LockHeld           │              │ LockLost
//!                            ▼              ▼ ttl lapsed   ▼
//!                        Unlocked        Expired          Lost ──▶ Unlocked
//! ```

use chrono::{DateTime, Utc};
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::time::Duration;
use thiserror::Error;

/// Lock operation failures.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LockError {
    /// Another owner holds a valid lease. Back off and retry later.
    #[error("Lock on {resource} is held by another owner")]
    Held {
        /// Locked resource.
        resource: String,
    },

    /// The caller is no longer the recorded owner. Stop mutating and discard
    /// in-flight work.
    #[error("Lock on {resource} was lost by {owner}")]
    Lost {
        /// Locked resource.
        resource: String,
        /// Owner that lost the lease.
        owner: String,
    },

    /// Invalid arguments (empty names, zero TTL).
    #[error("Invalid lock request: {0}")]
    Invalid(String),

    /// Storage failure. Transient; retried with backoff.
    #[error("Lock storage error: {0}")]
    Storage(String),
}

impl LockError {
    /// Whether the error is transient and the operation may be retried as is.
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        matches!(self, Self::Storage(_))
    }
}

/// Lifecycle of a lease as seen by its holder.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LeaseState {
    /// No lease requested yet, or released.
    Unlocked,
    /// Acquisition in flight.
    Acquiring,
    /// Lease is valid.
    Held,
    /// Renewal in flight; the previous lease is still valid.
    Renewing,
    /// Renewal was refused: another owner took over.
    Lost,
    /// The lease lapsed without a successful renewal.
    Expired,
}

impl LeaseState {
    /// Whether the holder may still do work under this lease.
    #[must_use]
    pub const fn is_active(self) -> bool {
        matches!(self, Self::Held | Self::Renewing)
    }
}

impl fmt::Display for LeaseState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Unlocked => "unlocked",
            Self::Acquiring => "acquiring",
            Self::Held => "held",
            Self::Renewing => "renewing",
            Self::Lost => "lost",
            Self::Expired => "expired",
        };
        f.write_str(name)
    }
}

/// A granted lease, as reported by the lock store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Lease {
    /// Locked resource.
    pub resource: String,
    /// Owner of the lease.
    pub owner: String,
    /// Expiry in the lock store's clock.
    pub expires_at: DateTime<Utc>,
    /// Lease duration that was requested.
    pub ttl: Duration,
}

impl Lease {
    /// Whether the lease is still valid at `now` (lock store clock).
    #[must_use]
    pub fn is_valid_at(&self, now: DateTime<Utc>) -> bool {
        now < self.expires_at
    }
}

/// Check the common arguments of lock operations.
///
/// # Errors
///
/// [`LockError::Invalid`] for empty names or a zero TTL.
pub fn validate_request(resource: &str, owner: &str, ttl: Duration) -> Result<(), LockError> {
    if resource.is_empty() || owner.is_empty() {
        return Err(LockError::Invalid("resource and owner must not be empty".to_string()));
    }
    if ttl.is_zero() {
        return Err(LockError::Invalid("ttl must be greater than zero".to_string()));
    }
    Ok(())
}

/// Boxed future returned by [`Locker`] methods.
pub type LockFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, LockError>> + Send + 'a>>;

/// Atomic lease primitive.
///
/// # Dyn Compatibility
///
/// Methods return boxed futures so lockers can be shared as `Arc<dyn Locker>`.
pub trait Locker: Send + Sync {
    /// Take the lease if nobody holds it, it expired, or the caller already
    /// owns it. Sets the expiry to `now + ttl`.
    ///
    /// # Errors
    ///
    /// `Held` if another owner holds a valid lease, `Storage` on failure.
    fn acquire(&self, resource: &str, owner: &str, ttl: Duration) -> LockFuture<'_, Lease>;

    /// Extend the lease if the caller is still the recorded owner.
    ///
    /// # Errors
    ///
    /// `Lost` if another owner took over or the record is gone, `Storage`
    /// on failure.
    fn renew(&self, resource: &str, owner: &str, ttl: Duration) -> LockFuture<'_, Lease>;

    /// Delete the lock record if the caller owns it. Releasing a lease that
    /// is not owned is a no-op.
    ///
    /// # Errors
    ///
    /// `Storage` on failure.
    fn release(&self, resource: &str, owner: &str) -> LockFuture<'_, ()>;
}
