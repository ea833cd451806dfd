//! # Eventide Core
//!
//! Core traits and types for an event-sourced aggregate store with
//! projection coordination.
//!
//! ## Core Concepts
//!
//! - **Event Store**: append-only log of events partitioned into aggregate
//!   streams, with optimistic concurrency on each stream's sequence
//! - **Event Type Registry**: explicit value mapping type tags to decoders,
//!   built once at startup
//! - **Write Model**: transient reduction of an aggregate's history, used by
//!   command handlers to validate commands and detect changes
//! - **Projection**: reducer table turning events into view mutations,
//!   committed together with a checkpoint
//! - **Lock**: lease granting one worker exclusive rights to build a view
//!
//! ## Architecture Principles
//!
//! - Storage behind traits (`EventStore`, `Locker`, `ReadModelStore`)
//! - Closed sum-type dispatch instead of runtime type switches
//! - No process-wide mutable state
//!
//! ## Example
//!
//! ```
//! use eventide_core::event::PendingEvent;
//! use eventide_core::event_store::AppendGroup;
//! use eventide_core::search::SearchQuery;
//! use eventide_core::stream::{AggregateKey, Sequence};
//!
//! let key = AggregateKey::new("inst-1", "user", "user-1");
//! let group = AppendGroup::new(
//!     key.clone(),
//!     Sequence::INITIAL,
//!     vec![PendingEvent::new("user.human.added", "org-1", "admin", vec![])],
//! );
//! assert_eq!(group.events.len(), 1);
//! assert!(SearchQuery::for_aggregate(&key).validate().is_ok());
//! ```

// Re-export commonly used types
pub use chrono::{DateTime, Utc};
pub use serde::{Deserialize, Serialize};

pub mod crypto;
pub mod dead_letter;
pub mod event;
pub mod event_store;
pub mod eventstore;
pub mod lock;
pub mod projection;
pub mod registry;
pub mod search;
pub mod stream;
pub mod write_model;

/// Environment module - injected dependencies
pub mod environment {
    use chrono::{DateTime, Utc};

    /// Clock trait - abstracts time operations for testability
    ///
    /// # Examples
    ///
    /// ```
    /// use eventide_core::environment::{Clock, SystemClock};
    ///
    /// let before = chrono::Utc::now();
    /// assert!(SystemClock.now() >= before);
    /// ```
    pub trait Clock: Send + Sync {
        /// Get the current time
        fn now(&self) -> DateTime<Utc>;
    }

    /// Wall clock.
    #[derive(Debug, Clone, Copy, Default)]
    pub struct SystemClock;

    impl Clock for SystemClock {
        fn now(&self) -> DateTime<Utc> {
            Utc::now()
        }
    }
}
