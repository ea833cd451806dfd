//! Lease records in the `locks` table.
//!
//! Each operation is a single conditional statement, so two workers racing
//! for the same resource are ordered by the row lock Postgres takes on the
//! conflicting key: exactly one of them sees its `WHERE` clause hold.

use chrono::{DateTime, Utc};
use eventide_core::lock::{Lease, LockError, LockFuture, Locker, validate_request};
use sqlx::PgPool;
use std::time::Duration;

/// `PostgreSQL`-backed [`Locker`].
#[derive(Clone)]
pub struct PostgresLocker {
    pool: PgPool,
}

impl PostgresLocker {
    /// Create a locker on an existing pool.
    #[must_use]
    pub const fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Current record for a resource, expired or not.
    ///
    /// # Errors
    ///
    /// Returns [`LockError::Storage`] if the query fails.
    pub async fn holder(&self, resource: &str) -> Result<Option<(String, DateTime<Utc>)>, LockError> {
        sqlx::query_as("SELECT owner_id, lease_expiry FROM locks WHERE resource_name = $1")
            .bind(resource)
            .fetch_optional(&self.pool)
            .await
            .map_err(storage_error)
    }
}

impl Locker for PostgresLocker {
    fn acquire(&self, resource: &str, owner: &str, ttl: Duration) -> LockFuture<'_, Lease> {
        let resource = resource.to_string();
        let owner = owner.to_string();
        Box::pin(async move {
            validate_request(&resource, &owner, ttl)?;

            let expires_at: Option<DateTime<Utc>> = sqlx::query_scalar(
                r"
                INSERT INTO locks (resource_name, owner_id, lease_expiry, acquired_at)
                VALUES ($1, $2, now() + $3::bigint * interval '1 millisecond', now())
                ON CONFLICT (resource_name) DO UPDATE
                SET lease_expiry = EXCLUDED.lease_expiry,
                    acquired_at = CASE
                        WHEN locks.owner_id = EXCLUDED.owner_id THEN locks.acquired_at
                        ELSE EXCLUDED.acquired_at
                    END,
                    owner_id = EXCLUDED.owner_id
                WHERE locks.lease_expiry <= now() OR locks.owner_id = EXCLUDED.owner_id
                RETURNING lease_expiry
                ",
            )
            .bind(&resource)
            .bind(&owner)
            .bind(ttl_millis(ttl)?)
            .fetch_optional(&self.pool)
            .await
            .map_err(storage_error)?;

            let Some(expires_at) = expires_at else {
                tracing::trace!(resource = %resource, owner = %owner, "Lock held by another owner");
                return Err(LockError::Held { resource });
            };
            tracing::debug!(resource = %resource, owner = %owner, expires_at = %expires_at, "Lock acquired");
            Ok(Lease {
                resource,
                owner,
                expires_at,
                ttl,
            })
        })
    }

    fn renew(&self, resource: &str, owner: &str, ttl: Duration) -> LockFuture<'_, Lease> {
        let resource = resource.to_string();
        let owner = owner.to_string();
        Box::pin(async move {
            validate_request(&resource, &owner, ttl)?;

            let expires_at: Option<DateTime<Utc>> = sqlx::query_scalar(
                r"
                UPDATE locks
                SET lease_expiry = now() + $3::bigint * interval '1 millisecond'
                WHERE resource_name = $1 AND owner_id = $2
                RETURNING lease_expiry
                ",
            )
            .bind(&resource)
            .bind(&owner)
            .bind(ttl_millis(ttl)?)
            .fetch_optional(&self.pool)
            .await
            .map_err(storage_error)?;

            match expires_at {
                Some(expires_at) => Ok(Lease {
                    resource,
                    owner,
                    expires_at,
                    ttl,
                }),
                None => {
                    tracing::warn!(resource = %resource, owner = %owner, "Lock no longer owned");
                    Err(LockError::Lost { resource, owner })
                }
            }
        })
    }

    fn release(&self, resource: &str, owner: &str) -> LockFuture<'_, ()> {
        let resource = resource.to_string();
        let owner = owner.to_string();
        Box::pin(async move {
            let result = sqlx::query("DELETE FROM locks WHERE resource_name = $1 AND owner_id = $2")
                .bind(&resource)
                .bind(&owner)
                .execute(&self.pool)
                .await
                .map_err(storage_error)?;
            tracing::debug!(
                resource = %resource,
                owner = %owner,
                released = result.rows_affected() > 0,
                "Lock released"
            );
            Ok(())
        })
    }
}

fn ttl_millis(ttl: Duration) -> Result<i64, LockError> {
    i64::try_from(ttl.as_millis()).map_err(|_| LockError::Invalid(format!("ttl {ttl:?} is too large")))
}

fn storage_error(e: sqlx::Error) -> LockError {
    LockError::Storage(e.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ttl_is_sent_in_milliseconds() {
        assert_eq!(ttl_millis(Duration::from_secs(3)), Ok(3000));
        assert!(matches!(ttl_millis(Duration::MAX), Err(LockError::Invalid(_))));
    }
}
