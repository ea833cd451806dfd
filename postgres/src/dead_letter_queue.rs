//! Dead Letter Queue (DLQ) for events a view could not process.
//!
//! The projection runner records undecodable events here when its decode
//! failure policy is `dead_letter`, then moves its checkpoint past them.
//! Operators list, resolve or discard entries out of band.

use chrono::{DateTime, Utc};
use eventide_core::dead_letter::{DeadLetterFuture, DeadLetterSink};
use eventide_core::event::{EventMeta, StoredEvent};
use eventide_core::event_store::EventStoreError;
use eventide_core::projection::ProjectionError;
use eventide_core::stream::{AggregateKey, Position, Sequence};
use sqlx::{PgPool, Row};

const FAILED_EVENT_COLUMNS: &str = "id, view_name, tenant, aggregate_type, aggregate_id, sequence, position, \
     event_type, payload, payload_version, original_timestamp, error_message, failure_count, \
     first_failed_at, last_failed_at, status, resolved_at, resolved_by, resolution_notes";

/// Status of a failed event in the Dead Letter Queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DLQStatus {
    /// Event is pending investigation/reprocessing
    Pending,
    /// Event is currently being processed
    Processing,
    /// Event was successfully reprocessed
    Resolved,
    /// Event was permanently discarded (cannot be fixed)
    Discarded,
}

impl DLQStatus {
    /// Convert status to database string representation.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Processing => "processing",
            Self::Resolved => "resolved",
            Self::Discarded => "discarded",
        }
    }

    /// Parse status from database string.
    ///
    /// # Errors
    ///
    /// Returns error if the string doesn't match a known status.
    pub fn parse(s: &str) -> Result<Self, EventStoreError> {
        match s {
            "pending" => Ok(Self::Pending),
            "processing" => Ok(Self::Processing),
            "resolved" => Ok(Self::Resolved),
            "discarded" => Ok(Self::Discarded),
            _ => Err(EventStoreError::DatabaseError(format!("Invalid DLQ status: {s}"))),
        }
    }
}

/// An entry in the Dead Letter Queue.
#[derive(Debug, Clone)]
pub struct FailedEvent {
    /// Unique identifier for this DLQ entry
    pub id: i64,

    /// View that failed on the event
    pub view: String,

    /// The event that failed, as stored
    pub event: StoredEvent,

    /// Last error message
    pub error_message: String,

    /// How many times the view failed on this event
    pub failure_count: i32,

    /// When this event first failed
    pub first_failed_at: DateTime<Utc>,

    /// When this event most recently failed
    pub last_failed_at: DateTime<Utc>,

    /// Current processing status
    pub status: DLQStatus,

    /// When the failure was resolved (if applicable)
    pub resolved_at: Option<DateTime<Utc>>,

    /// Who/what resolved the failure
    pub resolved_by: Option<String>,

    /// Notes about the resolution
    pub resolution_notes: Option<String>,
}

/// `PostgreSQL`-based Dead Letter Queue.
///
/// Entries are unique per `(view, position)`: a view failing again on the
/// same event bumps the failure count instead of adding a row.
///
/// # Example
///
/// ```no_run
/// use eventide_postgres::{DLQStatus, DeadLetterQueue};
///
/// # async fn example(pool: sqlx::PgPool) -> Result<(), Box<dyn std::error::Error>> {
/// let dlq = DeadLetterQueue::new(pool);
///
/// let pending = dlq.list_pending(100).await?;
/// if let Some(entry) = pending.first() {
///     dlq.update_status(entry.id, DLQStatus::Processing).await?;
/// }
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct DeadLetterQueue {
    pool: PgPool,
}

impl DeadLetterQueue {
    /// Create a new Dead Letter Queue with the given connection pool.
    #[must_use]
    pub const fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Record that `view` failed on `event`.
    ///
    /// Returns the id of the (new or existing) entry.
    ///
    /// # Errors
    ///
    /// Returns [`EventStoreError::DatabaseError`] if the insert fails.
    pub async fn add_entry(&self, view: &str, event: &StoredEvent, error_message: &str) -> Result<i64, EventStoreError> {
        let meta = &event.meta;
        let (id, failure_count): (i64, i32) = sqlx::query_as(
            r"
            INSERT INTO failed_events (
                view_name, tenant, aggregate_type, aggregate_id, sequence, position,
                event_type, payload, payload_version, original_timestamp, error_message
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
            ON CONFLICT (view_name, position) DO UPDATE
            SET failure_count = failed_events.failure_count + 1,
                last_failed_at = now(),
                error_message = EXCLUDED.error_message
            RETURNING id, failure_count
            ",
        )
        .bind(view)
        .bind(&meta.key.tenant)
        .bind(meta.key.aggregate_type.as_str())
        .bind(&meta.key.aggregate_id)
        .bind(to_db(meta.sequence.value())?)
        .bind(to_db(meta.position.value())?)
        .bind(meta.event_type.as_str())
        .bind(&event.payload)
        .bind(event.payload_version)
        .bind(meta.creation_date)
        .bind(error_message)
        .fetch_one(&self.pool)
        .await
        .map_err(database_error)?;

        tracing::warn!(
            dlq_id = id,
            view = view,
            position = %meta.position,
            event_type = %meta.event_type,
            failure_count = failure_count,
            error = error_message,
            "Event added to Dead Letter Queue"
        );

        metrics::counter!("eventide_dlq_added_total", "view" => view.to_string()).increment(1);

        Ok(id)
    }

    /// List pending failed events, oldest first.
    ///
    /// # Errors
    ///
    /// Returns [`EventStoreError::DatabaseError`] if the query fails.
    pub async fn list_pending(&self, limit: usize) -> Result<Vec<FailedEvent>, EventStoreError> {
        self.list_by_status(DLQStatus::Pending, limit).await
    }

    /// List failed events by status, oldest first.
    ///
    /// # Errors
    ///
    /// Returns [`EventStoreError::DatabaseError`] if the query fails.
    pub async fn list_by_status(&self, status: DLQStatus, limit: usize) -> Result<Vec<FailedEvent>, EventStoreError> {
        let rows = sqlx::query(&format!(
            "SELECT {FAILED_EVENT_COLUMNS} FROM failed_events \
             WHERE status = $1 ORDER BY first_failed_at ASC, id ASC LIMIT $2"
        ))
        .bind(status.as_str())
        .bind(i64::try_from(limit).unwrap_or(i64::MAX))
        .fetch_all(&self.pool)
        .await
        .map_err(database_error)?;

        rows.iter().map(Self::row_to_failed_event).collect()
    }

    /// Get a specific failed event by ID.
    ///
    /// # Errors
    ///
    /// Returns [`EventStoreError::DatabaseError`] if the query fails or entry not found.
    pub async fn get_by_id(&self, id: i64) -> Result<FailedEvent, EventStoreError> {
        let row = sqlx::query(&format!("SELECT {FAILED_EVENT_COLUMNS} FROM failed_events WHERE id = $1"))
            .bind(id)
            .fetch_one(&self.pool)
            .await
            .map_err(database_error)?;

        Self::row_to_failed_event(&row)
    }

    /// Update the status of a failed event.
    ///
    /// # Errors
    ///
    /// Returns [`EventStoreError::DatabaseError`] if the update fails.
    pub async fn update_status(&self, id: i64, status: DLQStatus) -> Result<(), EventStoreError> {
        sqlx::query("UPDATE failed_events SET status = $1 WHERE id = $2")
            .bind(status.as_str())
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(database_error)?;

        tracing::info!(dlq_id = id, status = status.as_str(), "DLQ entry status updated");

        Ok(())
    }

    /// Mark a failed event as resolved.
    ///
    /// # Errors
    ///
    /// Returns [`EventStoreError::DatabaseError`] if the update fails.
    pub async fn mark_resolved(&self, id: i64, resolved_by: &str, notes: Option<&str>) -> Result<(), EventStoreError> {
        sqlx::query(
            r"
            UPDATE failed_events
            SET status = 'resolved',
                resolved_at = now(),
                resolved_by = $1,
                resolution_notes = $2
            WHERE id = $3
            ",
        )
        .bind(resolved_by)
        .bind(notes)
        .bind(id)
        .execute(&self.pool)
        .await
        .map_err(database_error)?;

        tracing::info!(dlq_id = id, resolved_by = resolved_by, "DLQ entry marked as resolved");

        metrics::counter!("eventide_dlq_resolved_total").increment(1);

        Ok(())
    }

    /// Mark a failed event as discarded (permanently failed).
    ///
    /// # Errors
    ///
    /// Returns [`EventStoreError::DatabaseError`] if the update fails.
    pub async fn mark_discarded(&self, id: i64, reason: &str) -> Result<(), EventStoreError> {
        sqlx::query(
            r"
            UPDATE failed_events
            SET status = 'discarded',
                resolved_at = now(),
                resolution_notes = $1
            WHERE id = $2
            ",
        )
        .bind(reason)
        .bind(id)
        .execute(&self.pool)
        .await
        .map_err(database_error)?;

        tracing::warn!(dlq_id = id, reason = reason, "DLQ entry marked as discarded");

        metrics::counter!("eventide_dlq_discarded_total").increment(1);

        Ok(())
    }

    /// Get count of pending failures.
    ///
    /// # Errors
    ///
    /// Returns [`EventStoreError::DatabaseError`] if the query fails.
    pub async fn count_pending(&self) -> Result<i64, EventStoreError> {
        let (count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM failed_events WHERE status = 'pending'")
            .fetch_one(&self.pool)
            .await
            .map_err(database_error)?;

        Ok(count)
    }

    /// Delete resolved and discarded entries closed before `older_than`.
    ///
    /// Returns the number of deleted entries.
    ///
    /// # Errors
    ///
    /// Returns [`EventStoreError::DatabaseError`] if the delete fails.
    pub async fn purge_resolved(&self, older_than: DateTime<Utc>) -> Result<u64, EventStoreError> {
        let result = sqlx::query(
            r"
            DELETE FROM failed_events
            WHERE status IN ('resolved', 'discarded') AND resolved_at < $1
            ",
        )
        .bind(older_than)
        .execute(&self.pool)
        .await
        .map_err(database_error)?;

        let purged = result.rows_affected();
        tracing::info!(purged = purged, "Purged closed DLQ entries");
        Ok(purged)
    }

    fn row_to_failed_event(row: &sqlx::postgres::PgRow) -> Result<FailedEvent, EventStoreError> {
        let column = |e: sqlx::Error| EventStoreError::DatabaseError(e.to_string());

        let status: String = row.try_get("status").map_err(column)?;
        let event = StoredEvent {
            meta: EventMeta {
                key: AggregateKey::new(
                    row.try_get::<String, _>("tenant").map_err(column)?,
                    row.try_get::<String, _>("aggregate_type").map_err(column)?,
                    row.try_get::<String, _>("aggregate_id").map_err(column)?,
                ),
                resource_owner: String::new(),
                sequence: Sequence::new(from_db(row.try_get("sequence").map_err(column)?)?),
                position: Position::new(from_db(row.try_get("position").map_err(column)?)?),
                event_type: row.try_get::<String, _>("event_type").map_err(column)?.into(),
                creation_date: row.try_get("original_timestamp").map_err(column)?,
                actor_id: String::new(),
            },
            payload: row.try_get("payload").map_err(column)?,
            payload_version: row.try_get("payload_version").map_err(column)?,
        };

        Ok(FailedEvent {
            id: row.try_get("id").map_err(column)?,
            view: row.try_get("view_name").map_err(column)?,
            event,
            error_message: row.try_get("error_message").map_err(column)?,
            failure_count: row.try_get("failure_count").map_err(column)?,
            first_failed_at: row.try_get("first_failed_at").map_err(column)?,
            last_failed_at: row.try_get("last_failed_at").map_err(column)?,
            status: DLQStatus::parse(&status)?,
            resolved_at: row.try_get("resolved_at").map_err(column)?,
            resolved_by: row.try_get("resolved_by").map_err(column)?,
            resolution_notes: row.try_get("resolution_notes").map_err(column)?,
        })
    }
}

impl DeadLetterSink for DeadLetterQueue {
    fn record<'a>(&'a self, view: &'a str, event: &'a StoredEvent, reason: &'a str) -> DeadLetterFuture<'a> {
        Box::pin(async move {
            self.add_entry(view, event, reason)
                .await
                .map(|_| ())
                .map_err(|e| ProjectionError::Storage(e.to_string()))
        })
    }
}

fn database_error(e: sqlx::Error) -> EventStoreError {
    EventStoreError::DatabaseError(e.to_string())
}

fn to_db(value: u64) -> Result<i64, EventStoreError> {
    i64::try_from(value).map_err(|_| EventStoreError::DatabaseError(format!("value out of range: {value}")))
}

fn from_db(value: i64) -> Result<u64, EventStoreError> {
    u64::try_from(value).map_err(|_| EventStoreError::DatabaseError(format!("negative value: {value}")))
}
