//! `PostgreSQL` read model store.
//!
//! Views are ordinary tables mutated by [`Statement`]s. The checkpoint of
//! every view lives in `projection_checkpoints`; a commit locks the view's
//! checkpoint row, compares it with the checkpoint the batch was computed
//! from, runs the statements and moves the checkpoint, all in one
//! transaction.
//!
//! ```text
//! BEGIN
//!   SELECT position ... FOR UPDATE      -- second committer waits here
//!   position != expected  -> ROLLBACK, CheckpointMoved
//!   statements...
//!   UPDATE projection_checkpoints SET position = new
//! COMMIT
//! ```

use crate::statement::Statement;
use eventide_core::projection::{ProjectionError, ReadModelStore, Result};
use eventide_core::stream::Position;
use sqlx::postgres::{PgConnection, PgPool, PgPoolOptions};

/// Run the migrations of this crate.
///
/// # Errors
///
/// Returns the migration error.
pub async fn run_migrations(pool: &PgPool) -> std::result::Result<(), sqlx::migrate::MigrateError> {
    let mut migrator = sqlx::migrate!("./migrations");
    migrator.set_ignore_missing(true);
    migrator.run(pool).await
}

/// PostgreSQL-backed read model store.
///
/// The store can share the event store's pool or use a separate database.
#[derive(Clone)]
pub struct PostgresReadModelStore {
    pool: PgPool,
}

impl PostgresReadModelStore {
    /// Create a store on an existing pool.
    #[must_use]
    pub const fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Create a store with its own connection pool.
    ///
    /// # Errors
    ///
    /// Returns [`ProjectionError::Storage`] if connection fails.
    pub async fn connect(database_url: &str, max_connections: u32) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(database_url)
            .await
            .map_err(|e| ProjectionError::Storage(format!("Failed to connect: {e}")))?;

        Ok(Self::new(pool))
    }

    /// Create the checkpoint table.
    ///
    /// # Errors
    ///
    /// Returns [`ProjectionError::Storage`] if migration fails.
    pub async fn migrate(&self) -> Result<()> {
        run_migrations(&self.pool)
            .await
            .map_err(|e| ProjectionError::Storage(format!("Migration failed: {e}")))
    }

    /// Get the underlying connection pool.
    #[must_use]
    pub const fn pool(&self) -> &PgPool {
        &self.pool
    }

    async fn apply(conn: &mut PgConnection, view: &str, statements: &[Statement]) -> Result<()> {
        for statement in statements {
            let rows = statement.execute(&mut *conn).await?;
            tracing::trace!(view = view, statement = %statement, rows = rows, "Statement executed");
        }
        Ok(())
    }

    async fn write_checkpoint(conn: &mut PgConnection, view: &str, position: Position) -> Result<()> {
        sqlx::query(
            "INSERT INTO projection_checkpoints (view_name, position, updated_at)
             VALUES ($1, $2, now())
             ON CONFLICT (view_name) DO UPDATE
             SET position = EXCLUDED.position, updated_at = now()",
        )
        .bind(view)
        .bind(to_db(position)?)
        .execute(conn)
        .await
        .map_err(|e| ProjectionError::Checkpoint(format!("Failed to save checkpoint: {e}")))?;
        Ok(())
    }
}

impl ReadModelStore for PostgresReadModelStore {
    type Mutation = Statement;

    async fn load_checkpoint(&self, view: &str) -> Result<Position> {
        let position: Option<i64> = sqlx::query_scalar("SELECT position FROM projection_checkpoints WHERE view_name = $1")
            .bind(view)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| ProjectionError::Checkpoint(format!("Failed to load checkpoint: {e}")))?;

        position.map_or(Ok(Position::BEGINNING), from_db)
    }

    async fn commit(&self, view: &str, expected: Position, mutations: Vec<Statement>, new: Position) -> Result<()> {
        let mut tx = self.pool.begin().await.map_err(storage_error)?;

        // Make sure there is a row to lock for a view's first commit.
        sqlx::query(
            "INSERT INTO projection_checkpoints (view_name, position) VALUES ($1, 0)
             ON CONFLICT (view_name) DO NOTHING",
        )
        .bind(view)
        .execute(&mut *tx)
        .await
        .map_err(storage_error)?;

        let actual: i64 = sqlx::query_scalar("SELECT position FROM projection_checkpoints WHERE view_name = $1 FOR UPDATE")
            .bind(view)
            .fetch_one(&mut *tx)
            .await
            .map_err(|e| ProjectionError::Checkpoint(format!("Failed to lock checkpoint: {e}")))?;
        let actual = from_db(actual)?;

        if actual != expected {
            // Dropping the transaction rolls it back.
            return Err(ProjectionError::CheckpointMoved {
                view: view.to_string(),
                expected,
                actual,
            });
        }

        Self::apply(&mut tx, view, &mutations).await?;
        Self::write_checkpoint(&mut tx, view, new).await?;

        tx.commit().await.map_err(storage_error)?;
        tracing::debug!(view = view, from = %expected, to = %new, statements = mutations.len(), "View committed");
        Ok(())
    }

    async fn reset(&self, view: &str, cleanup: Vec<Statement>) -> Result<()> {
        let mut tx = self.pool.begin().await.map_err(storage_error)?;
        Self::apply(&mut tx, view, &cleanup).await?;
        Self::write_checkpoint(&mut tx, view, Position::BEGINNING).await?;
        tx.commit().await.map_err(storage_error)?;
        tracing::info!(view = view, "View reset to the beginning");
        Ok(())
    }
}

fn storage_error(e: sqlx::Error) -> ProjectionError {
    ProjectionError::Storage(e.to_string())
}

fn to_db(position: Position) -> Result<i64> {
    i64::try_from(position.value()).map_err(|_| ProjectionError::Checkpoint(format!("position out of range: {position}")))
}

fn from_db(value: i64) -> Result<Position> {
    u64::try_from(value)
        .map(Position::new)
        .map_err(|_| ProjectionError::Checkpoint(format!("negative checkpoint: {value}")))
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn checkpoint_conversions() {
        assert_eq!(from_db(42).unwrap(), Position::new(42));
        assert!(from_db(-1).is_err());
        assert_eq!(to_db(Position::new(7)).unwrap(), 7);
        assert!(to_db(Position::new(u64::MAX)).is_err());
    }
}
