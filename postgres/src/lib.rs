//! `PostgreSQL` event store, lock store and dead-letter queue for Eventide.
//!
//! [`PostgresEventStore`] implements the `EventStore` trait from
//! `eventide-core` on top of a sqlx connection pool:
//!
//! - Multi-aggregate appends in one transaction, serialized by a
//!   transaction-scoped advisory lock so global positions follow commit order
//! - Optimistic concurrency checked against each stream's current sequence
//!   inside that transaction
//! - Filtering with keyset pagination on the global position
//! - Bounded retries on transient database errors
//!
//! # Example
//!
//! ```ignore
//! use eventide_postgres::PostgresEventStore;
//!
//! async fn example() -> Result<(), Box<dyn std::error::Error>> {
//!     let store = PostgresEventStore::new("postgres://localhost/eventide").await?;
//!     store.migrate().await?;
//!     Ok(())
//! }
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod dead_letter_queue;
pub mod locker;

pub use dead_letter_queue::{DLQStatus, DeadLetterQueue, FailedEvent};
pub use locker::PostgresLocker;

use chrono::{DateTime, Utc};
use eventide_core::event::StoredEvent;
use eventide_core::event_store::{AppendGroup, EventStore, EventStoreError, EventStream, StoreFuture, validate_groups};
use eventide_core::search::{SearchQuery, SortOrder};
use eventide_core::stream::{AggregateKey, Position, Sequence};
use eventide_runtime::metrics::StoreMetrics;
use eventide_runtime::retry::{RetryPolicy, retry_transient};
use sqlx::postgres::{PgArguments, PgConnection, PgPool, PgPoolOptions, PgRow};
use sqlx::query::QueryScalar;
use sqlx::{Postgres, QueryBuilder, Row};
use std::time::Instant;

/// Key of the advisory lock that serializes appends.
const APPEND_LOCK_ID: i64 = 0x0065_7665_6e74;

/// Default number of rows fetched per filter page.
pub const DEFAULT_PAGE_SIZE: u32 = 500;

const EVENT_COLUMNS: &str = "tenant, aggregate_type, aggregate_id, sequence, position, event_type, \
     resource_owner, actor_id, payload, payload_version, creation_date";

/// Run the migrations of this crate.
///
/// Other crates keep their own migrations in the same database, so
/// migrations unknown to this crate are ignored.
///
/// # Errors
///
/// Returns the migration error.
pub async fn run_migrations(pool: &PgPool) -> Result<(), sqlx::migrate::MigrateError> {
    let mut migrator = sqlx::migrate!("./migrations");
    migrator.set_ignore_missing(true);
    migrator.run(pool).await
}

/// `PostgreSQL`-backed event store.
#[derive(Clone)]
pub struct PostgresEventStore {
    pool: PgPool,
    retry: RetryPolicy,
    page_size: u32,
}

impl PostgresEventStore {
    /// Connect to `database_url` with a pool of ten connections.
    ///
    /// # Errors
    ///
    /// Returns [`EventStoreError::DatabaseError`] if the connection fails.
    pub async fn new(database_url: &str) -> Result<Self, EventStoreError> {
        Self::connect(database_url, 10).await
    }

    /// Connect with an explicit pool size.
    ///
    /// # Errors
    ///
    /// Returns [`EventStoreError::DatabaseError`] if the connection fails.
    pub async fn connect(database_url: &str, max_connections: u32) -> Result<Self, EventStoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(database_url)
            .await
            .map_err(|e| EventStoreError::DatabaseError(format!("Failed to connect: {e}")))?;
        Ok(Self::from_pool(pool))
    }

    /// Use an existing pool.
    #[must_use]
    pub fn from_pool(pool: PgPool) -> Self {
        Self {
            pool,
            retry: RetryPolicy::default(),
            page_size: DEFAULT_PAGE_SIZE,
        }
    }

    /// Retry policy for transient database errors.
    #[must_use]
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Rows fetched per filter page (at least one).
    #[must_use]
    pub fn with_page_size(mut self, page_size: u32) -> Self {
        self.page_size = page_size.max(1);
        self
    }

    /// The underlying pool.
    #[must_use]
    pub const fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Create the events, locks and dead-letter tables.
    ///
    /// # Errors
    ///
    /// Returns [`EventStoreError::DatabaseError`] if a migration fails.
    pub async fn migrate(&self) -> Result<(), EventStoreError> {
        run_migrations(&self.pool)
            .await
            .map_err(|e| EventStoreError::DatabaseError(format!("Migration failed: {e}")))
    }

    async fn try_append(&self, groups: Vec<AppendGroup>) -> Result<Vec<StoredEvent>, EventStoreError> {
        let mut tx = self.pool.begin().await.map_err(database_error)?;

        sqlx::query("SELECT pg_advisory_xact_lock($1)")
            .bind(APPEND_LOCK_ID)
            .execute(&mut *tx)
            .await
            .map_err(database_error)?;

        let (now, last_position): (DateTime<Utc>, i64) =
            sqlx::query_as("SELECT now(), COALESCE(MAX(position), 0)::BIGINT FROM events")
                .fetch_one(&mut *tx)
                .await
                .map_err(database_error)?;
        let mut position = Position::new(from_db(last_position, "position")?);

        let mut committed = Vec::new();
        for AppendGroup { key, expected, events } in groups {
            let current = Sequence::new(from_db(
                max_sequence(&key).fetch_one(&mut *tx).await.map_err(database_error)?,
                "sequence",
            )?);
            if current != expected {
                return Err(EventStoreError::ConcurrencyConflict {
                    key,
                    expected,
                    actual: Some(current),
                });
            }

            let mut sequence = current;
            let mut batch = Vec::with_capacity(events.len());
            for pending in events {
                sequence = sequence.next();
                position = position.next();
                batch.push(StoredEvent::from_pending(key.clone(), pending, sequence, position, now));
            }

            insert_events(&mut tx, &batch).await.map_err(|e| {
                if is_unique_violation(&e) {
                    EventStoreError::ConcurrencyConflict {
                        key: key.clone(),
                        expected,
                        actual: None,
                    }
                } else {
                    database_error(e)
                }
            })?;
            committed.extend(batch);
        }

        tx.commit().await.map_err(database_error)?;
        Ok(committed)
    }

    async fn fetch_page(
        &self,
        query: &SearchQuery,
        cursor: Option<Position>,
        limit: u64,
    ) -> Result<Vec<StoredEvent>, EventStoreError> {
        let rows = retry_transient(self.retry.clone(), || {
            let mut builder = page_query(query, cursor, limit);
            let pool = &self.pool;
            async move { builder.build().fetch_all(pool).await.map_err(database_error) }
        })
        .await?;
        rows.iter().map(row_to_event).collect()
    }
}

impl EventStore for PostgresEventStore {
    fn append(&self, groups: Vec<AppendGroup>) -> StoreFuture<'_, Vec<StoredEvent>> {
        Box::pin(async move {
            validate_groups(&groups)?;
            let start = Instant::now();

            let result = retry_transient(self.retry.clone(), || self.try_append(groups.clone())).await;
            match &result {
                Ok(committed) => {
                    StoreMetrics::record_append(committed.len(), start.elapsed());
                    if let (Some(first), Some(last)) = (committed.first(), committed.last()) {
                        tracing::debug!(
                            events = committed.len(),
                            first_position = %first.meta.position,
                            last_position = %last.meta.position,
                            "Appended events"
                        );
                    }
                }
                Err(EventStoreError::ConcurrencyConflict { key, expected, actual }) => {
                    StoreMetrics::record_conflict();
                    tracing::debug!(
                        key = %key,
                        expected = %expected,
                        actual = ?actual,
                        "Append rejected by concurrency check"
                    );
                }
                Err(e) => tracing::error!(error = %e, "Append failed"),
            }
            result
        })
    }

    fn filter(&self, query: SearchQuery) -> EventStream<'_> {
        Box::pin(async_stream::stream! {
            if let Err(reason) = query.validate() {
                yield Err(EventStoreError::Validation(reason));
                return;
            }

            let page_size = u64::from(self.page_size);
            let mut remaining = query.limit;
            let mut cursor: Option<Position> = None;

            loop {
                let want = remaining.map_or(page_size, |r| r.min(page_size));
                let page = match self.fetch_page(&query, cursor, want).await {
                    Ok(page) => page,
                    Err(e) => {
                        yield Err(e);
                        return;
                    }
                };
                let fetched = page.len() as u64;

                for event in page {
                    cursor = Some(event.meta.position);
                    yield Ok(event);
                }

                if fetched < want {
                    break;
                }
                if let Some(r) = remaining.as_mut() {
                    *r -= fetched;
                    if *r == 0 {
                        break;
                    }
                }
            }
        })
    }

    fn current_sequence(&self, key: &AggregateKey) -> StoreFuture<'_, Sequence> {
        let key = key.clone();
        Box::pin(async move {
            let (key, pool) = (&key, &self.pool);
            let value = retry_transient(self.retry.clone(), || async move {
                max_sequence(key).fetch_one(pool).await.map_err(database_error)
            })
            .await?;
            Ok(Sequence::new(from_db(value, "sequence")?))
        })
    }
}

fn max_sequence(key: &AggregateKey) -> QueryScalar<'_, Postgres, i64, PgArguments> {
    sqlx::query_scalar(
        "SELECT COALESCE(MAX(sequence), 0)::BIGINT FROM events \
         WHERE tenant = $1 AND aggregate_type = $2 AND aggregate_id = $3",
    )
    .bind(&key.tenant)
    .bind(key.aggregate_type.as_str())
    .bind(&key.aggregate_id)
}

async fn insert_events(conn: &mut PgConnection, events: &[StoredEvent]) -> Result<(), sqlx::Error> {
    let mut rows = Vec::with_capacity(events.len());
    for event in events {
        let sequence = i64::try_from(event.meta.sequence.value())
            .map_err(|e| sqlx::Error::Encode(Box::new(e)))?;
        let position = i64::try_from(event.meta.position.value())
            .map_err(|e| sqlx::Error::Encode(Box::new(e)))?;
        rows.push((event, sequence, position));
    }

    let mut builder = QueryBuilder::<Postgres>::new(format!("INSERT INTO events ({EVENT_COLUMNS}) "));
    builder.push_values(rows, |mut row, (event, sequence, position)| {
        let meta = &event.meta;
        row.push_bind(meta.key.tenant.clone())
            .push_bind(meta.key.aggregate_type.as_str().to_string())
            .push_bind(meta.key.aggregate_id.clone())
            .push_bind(sequence)
            .push_bind(position)
            .push_bind(meta.event_type.as_str().to_string())
            .push_bind(meta.resource_owner.clone())
            .push_bind(meta.actor_id.clone())
            .push_bind(event.payload.clone())
            .push_bind(event.payload_version)
            .push_bind(meta.creation_date);
    });
    builder.build().execute(conn).await?;
    Ok(())
}

/// Build one page of a filter query.
///
/// `cursor` is the position of the last event already yielded; the page
/// continues strictly after it in the query's order.
fn page_query(query: &SearchQuery, cursor: Option<Position>, limit: u64) -> QueryBuilder<'static, Postgres> {
    let mut builder = QueryBuilder::<Postgres>::new(format!("SELECT {EVENT_COLUMNS} FROM events WHERE TRUE"));

    if let Some(tenant) = &query.tenant {
        builder.push(" AND tenant = ").push_bind(tenant.clone());
    }
    if let Some(owner) = &query.resource_owner {
        builder.push(" AND resource_owner = ").push_bind(owner.clone());
    }
    if let Some(after) = query.position_after {
        builder.push(" AND position > ").push_bind(db_value(after.value()));
    }
    if let Some(cursor) = cursor {
        match query.order {
            SortOrder::Ascending => builder.push(" AND position > "),
            SortOrder::Descending => builder.push(" AND position < "),
        };
        builder.push_bind(db_value(cursor.value()));
    }

    builder.push(" AND (");
    for (i, sub) in query.queries.iter().enumerate() {
        if i > 0 {
            builder.push(" OR ");
        }
        builder.push("(aggregate_type = ANY(");
        builder.push_bind(sub.aggregate_types.iter().map(|t| t.as_str().to_string()).collect::<Vec<_>>());
        builder.push(")");
        if !sub.aggregate_ids.is_empty() {
            builder.push(" AND aggregate_id = ANY(").push_bind(sub.aggregate_ids.clone()).push(")");
        }
        if !sub.event_types.is_empty() {
            builder
                .push(" AND event_type = ANY(")
                .push_bind(sub.event_types.iter().map(|t| t.as_str().to_string()).collect::<Vec<_>>())
                .push(")");
        }
        if let Some(greater) = sub.sequence_greater {
            builder.push(" AND sequence > ").push_bind(db_value(greater.value()));
        }
        if let Some(less) = sub.sequence_less {
            builder.push(" AND sequence < ").push_bind(db_value(less.value()));
        }
        builder.push(")");
    }
    builder.push(")");

    match query.order {
        SortOrder::Ascending => builder.push(" ORDER BY position ASC LIMIT "),
        SortOrder::Descending => builder.push(" ORDER BY position DESC LIMIT "),
    };
    builder.push_bind(db_value(limit));
    builder
}

fn row_to_event(row: &PgRow) -> Result<StoredEvent, EventStoreError> {
    let column = |e: sqlx::Error| EventStoreError::SerializationError(e.to_string());

    let key = AggregateKey::new(
        row.try_get::<String, _>("tenant").map_err(column)?,
        row.try_get::<String, _>("aggregate_type").map_err(column)?,
        row.try_get::<String, _>("aggregate_id").map_err(column)?,
    );
    let pending = eventide_core::event::PendingEvent {
        event_type: row.try_get::<String, _>("event_type").map_err(column)?.into(),
        resource_owner: row.try_get("resource_owner").map_err(column)?,
        actor_id: row.try_get("actor_id").map_err(column)?,
        payload: row.try_get("payload").map_err(column)?,
        payload_version: row.try_get("payload_version").map_err(column)?,
    };
    let sequence = Sequence::new(from_db(row.try_get("sequence").map_err(column)?, "sequence")?);
    let position = Position::new(from_db(row.try_get("position").map_err(column)?, "position")?);
    let creation_date: DateTime<Utc> = row.try_get("creation_date").map_err(column)?;

    Ok(StoredEvent::from_pending(key, pending, sequence, position, creation_date))
}

fn database_error(e: sqlx::Error) -> EventStoreError {
    EventStoreError::DatabaseError(e.to_string())
}

fn is_unique_violation(e: &sqlx::Error) -> bool {
    matches!(e, sqlx::Error::Database(db) if db.code().as_deref() == Some("23505"))
}

fn from_db(value: i64, what: &str) -> Result<u64, EventStoreError> {
    u64::try_from(value).map_err(|_| EventStoreError::SerializationError(format!("negative {what}: {value}")))
}

/// Positions, sequences and limits beyond `i64::MAX` cannot exist in the
/// table, so clamping keeps the comparison meaning intact.
fn db_value(value: u64) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}
