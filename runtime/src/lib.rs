//! # Eventide Runtime
//!
//! Runtime pieces shared by command handlers and projection workers.
//!
//! ## Components
//!
//! - **Retry**: bounded exponential backoff with jitter for transient
//!   storage errors
//! - **Lease keeper**: acquires a lock lease, renews it in the background
//!   and lets the owner re-validate before each commit
//! - **Command executor**: the rebuild, decide, append cycle with bounded
//!   conflict retries
//! - **Config**: `EVENTIDE_*` environment configuration
//! - **Metrics**: Prometheus recorder and metric names
//!
//! ## Example
//!
//! ```ignore
//! use eventide_runtime::command::CommandExecutor;
//!
//! let executor = CommandExecutor::new(eventstore).with_max_conflict_retries(5);
//! let executed = executor
//!     .execute(|| ProfileModel::new(key.clone()), |model| model.change(&command))
//!     .await?;
//! ```

/// Retry logic with exponential backoff
pub mod retry;

/// Lease acquisition and background renewal
pub mod lease;

/// Command execution with optimistic concurrency
pub mod command;

/// Environment-based configuration
pub mod config;

/// Prometheus metrics for observability
pub mod metrics;

pub use command::{CommandError, CommandExecutor, Executed, Outcome};
pub use config::{ConfigError, EventideConfig};
pub use lease::{LeaseConfig, LeaseKeeper, LeaseStatus};
pub use retry::{RetryPolicy, Retryable, retry_transient, retry_with_backoff, retry_with_predicate};
