//! In-memory lease store.

#![allow(clippy::unwrap_used)] // Test infrastructure uses unwrap for simplicity
#![allow(clippy::missing_panics_doc)]

use chrono::{DateTime, Utc};
use eventide_core::environment::Clock;
use eventide_core::lock::{Lease, LockError, LockFuture, Locker, validate_request};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

#[derive(Debug, Clone)]
struct LockRecord {
    owner: String,
    expires_at: DateTime<Utc>,
}

#[derive(Debug, Default)]
struct Locks {
    records: HashMap<String, LockRecord>,
    failures: usize,
}

/// In-memory [`Locker`] driven by an injected clock.
///
/// Every operation runs under one mutex, which gives the same
/// single-conditional-write semantics as the database implementation. Pair
/// it with [`ManualClock`](crate::ManualClock) to expire leases on demand.
#[derive(Clone)]
pub struct InMemoryLocker {
    locks: Arc<Mutex<Locks>>,
    clock: Arc<dyn Clock>,
}

impl InMemoryLocker {
    /// Empty lock table.
    #[must_use]
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            locks: Arc::new(Mutex::new(Locks::default())),
            clock,
        }
    }

    /// Make the next `count` operations fail with a storage error.
    pub fn fail_next(&self, count: usize) {
        self.locks.lock().unwrap().failures = count;
    }

    /// Recorded owner of a resource, expired or not.
    #[must_use]
    pub fn owner_of(&self, resource: &str) -> Option<String> {
        self.locks
            .lock()
            .unwrap()
            .records
            .get(resource)
            .map(|r| r.owner.clone())
    }

    /// Recorded lease expiry of a resource.
    #[must_use]
    pub fn expiry_of(&self, resource: &str) -> Option<DateTime<Utc>> {
        self.locks
            .lock()
            .unwrap()
            .records
            .get(resource)
            .map(|r| r.expires_at)
    }

    fn expiry(&self, ttl: Duration) -> Result<DateTime<Utc>, LockError> {
        let ttl = chrono::Duration::from_std(ttl).map_err(|e| LockError::Invalid(e.to_string()))?;
        Ok(self.clock.now() + ttl)
    }

    fn grant(&self, locks: &mut Locks, resource: &str, owner: &str, ttl: Duration) -> Result<Lease, LockError> {
        let expires_at = self.expiry(ttl)?;
        locks.records.insert(
            resource.to_string(),
            LockRecord {
                owner: owner.to_string(),
                expires_at,
            },
        );
        Ok(Lease {
            resource: resource.to_string(),
            owner: owner.to_string(),
            expires_at,
            ttl,
        })
    }

    fn take_failure(locks: &mut Locks) -> Result<(), LockError> {
        if locks.failures > 0 {
            locks.failures -= 1;
            return Err(LockError::Storage("injected failure".to_string()));
        }
        Ok(())
    }

    fn acquire_sync(&self, resource: &str, owner: &str, ttl: Duration) -> Result<Lease, LockError> {
        validate_request(resource, owner, ttl)?;
        let mut locks = self.locks.lock().unwrap();
        Self::take_failure(&mut locks)?;

        let now = self.clock.now();
        let free = locks
            .records
            .get(resource)
            .is_none_or(|r| r.expires_at <= now || r.owner == owner);
        if !free {
            return Err(LockError::Held {
                resource: resource.to_string(),
            });
        }
        self.grant(&mut locks, resource, owner, ttl)
    }

    fn renew_sync(&self, resource: &str, owner: &str, ttl: Duration) -> Result<Lease, LockError> {
        validate_request(resource, owner, ttl)?;
        let mut locks = self.locks.lock().unwrap();
        Self::take_failure(&mut locks)?;

        let owned = locks.records.get(resource).is_some_and(|r| r.owner == owner);
        if !owned {
            return Err(LockError::Lost {
                resource: resource.to_string(),
                owner: owner.to_string(),
            });
        }
        self.grant(&mut locks, resource, owner, ttl)
    }

    fn release_sync(&self, resource: &str, owner: &str) -> Result<(), LockError> {
        let mut locks = self.locks.lock().unwrap();
        Self::take_failure(&mut locks)?;
        if locks.records.get(resource).is_some_and(|r| r.owner == owner) {
            locks.records.remove(resource);
        }
        Ok(())
    }
}

impl std::fmt::Debug for InMemoryLocker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InMemoryLocker")
            .field("locks", &self.locks)
            .finish_non_exhaustive()
    }
}

impl Locker for InMemoryLocker {
    fn acquire(&self, resource: &str, owner: &str, ttl: Duration) -> LockFuture<'_, Lease> {
        let result = self.acquire_sync(resource, owner, ttl);
        Box::pin(async move { result })
    }

    fn renew(&self, resource: &str, owner: &str, ttl: Duration) -> LockFuture<'_, Lease> {
        let result = self.renew_sync(resource, owner, ttl);
        Box::pin(async move { result })
    }

    fn release(&self, resource: &str, owner: &str) -> LockFuture<'_, ()> {
        let result = self.release_sync(resource, owner);
        Box::pin(async move { result })
    }
}
