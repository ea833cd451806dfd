//! Projection runner and `PostgreSQL` read model store for Eventide.
//!
//! # Overview
//!
//! - [`ProjectionRunner`]: keeps one view up to date under a lease, committing
//!   mutations and checkpoint together
//! - [`PostgresReadModelStore`]: views as Postgres tables with checkpoints in
//!   `projection_checkpoints`
//! - [`Statement`]: typed insert, upsert, update, delete, clear and no-op statements
//!   returned by Postgres view reducers
//!
//! # Building a view
//!
//! ```ignore
//! use eventide_core::projection::{ReducerTable, TableProjection};
//! use eventide_projections::{PostgresReadModelStore, ProjectionRunner, RunnerConfig, Statement};
//!
//! let table = ReducerTable::new().on("org", "org.added", |e| Ok(vec![Statement::create("orgs", columns(e))]));
//! let projection = TableProjection::new("orgs", table);
//!
//! let (mut runner, shutdown) = ProjectionRunner::new(
//!     projection,
//!     PostgresReadModelStore::new(pool),
//!     eventstore,
//!     locker,
//!     RunnerConfig::default(),
//! );
//! runner.run().await?;
//! ```

pub mod postgres;
pub mod runner;
pub mod statement;

pub use postgres::PostgresReadModelStore;
pub use runner::{BatchOutcome, ProjectionRunner, RunnerConfig};
pub use statement::{Column, Condition, SqlValue, Statement};
