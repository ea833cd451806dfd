//! # Eventide Testing
//!
//! Testing utilities and helpers for Eventide.
//!
//! This crate provides:
//! - In-memory implementations of the storage traits
//!   ([`InMemoryEventStore`], [`InMemoryLocker`], [`InMemoryReadModelStore`],
//!   [`InMemoryDeadLetters`])
//! - Deterministic clocks ([`FixedClock`], [`ManualClock`])
//! - A toy [`EncryptionCodec`](eventide_core::crypto::EncryptionCodec)
//! - Builders for recorded events and a tracing initializer
//!
//! ## Example
//!
//! ```
//! use eventide_core::event_store::EventStore;
//! use eventide_core::stream::{AggregateKey, Sequence};
//! use eventide_testing::InMemoryEventStore;
//!
//! # tokio_test::block_on(async {
//! let store = InMemoryEventStore::new();
//! let key = AggregateKey::new("inst", "user", "u1");
//! assert_eq!(store.current_sequence(&key).await.unwrap(), Sequence::INITIAL);
//! # });
//! ```

use chrono::{DateTime, Utc};
use eventide_core::environment::Clock;

pub mod event_store;
pub mod locker;
pub mod projection_mocks;

/// Mock implementations of Environment traits
pub mod mocks {
    use super::{Clock, DateTime, Utc};
    use eventide_core::crypto::{CryptoError, EncryptionCodec};
    use std::collections::HashMap;
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    /// Fixed clock for deterministic tests
    ///
    /// Always returns the same time, making tests reproducible.
    ///
    /// # Example
    ///
    /// ```
    /// use eventide_testing::mocks::FixedClock;
    /// use eventide_core::environment::Clock;
    /// use chrono::Utc;
    ///
    /// let clock = FixedClock::new(Utc::now());
    /// let time1 = clock.now();
    /// let time2 = clock.now();
    /// assert_eq!(time1, time2); // Always the same!
    /// ```
    #[derive(Debug, Clone)]
    pub struct FixedClock {
        time: DateTime<Utc>,
    }

    impl FixedClock {
        /// Create a new fixed clock with the given time
        #[must_use]
        pub const fn new(time: DateTime<Utc>) -> Self {
            Self { time }
        }
    }

    impl Clock for FixedClock {
        fn now(&self) -> DateTime<Utc> {
            self.time
        }
    }

    /// Create a default fixed clock for tests (2025-01-01 00:00:00 UTC)
    ///
    /// # Panics
    ///
    /// This function will panic if the hardcoded timestamp fails to parse,
    /// which should never happen in practice.
    #[must_use]
    #[allow(clippy::expect_used)]
    pub fn test_clock() -> FixedClock {
        FixedClock::new(
            DateTime::parse_from_rfc3339("2025-01-01T00:00:00Z")
                .expect("hardcoded timestamp should always parse")
                .with_timezone(&Utc),
        )
    }

    /// Clock that only moves when told to. Clones share the same time.
    ///
    /// # Example
    ///
    /// ```
    /// use eventide_testing::mocks::{ManualClock, test_clock};
    /// use eventide_core::environment::Clock;
    /// use std::time::Duration;
    ///
    /// let clock = ManualClock::new(test_clock().now());
    /// let start = clock.now();
    /// clock.advance(Duration::from_secs(30));
    /// assert_eq!((clock.now() - start).num_seconds(), 30);
    /// ```
    #[derive(Debug, Clone)]
    pub struct ManualClock {
        time: Arc<Mutex<DateTime<Utc>>>,
    }

    impl ManualClock {
        /// Start at `time`.
        #[must_use]
        pub fn new(time: DateTime<Utc>) -> Self {
            Self {
                time: Arc::new(Mutex::new(time)),
            }
        }

        /// Move the clock forward.
        ///
        /// # Panics
        ///
        /// If the clock's mutex is poisoned or `by` does not fit a chrono
        /// duration.
        #[allow(clippy::unwrap_used)]
        pub fn advance(&self, by: Duration) {
            *self.time.lock().unwrap() += chrono::Duration::from_std(by).unwrap();
        }

        /// Jump to `time`.
        ///
        /// # Panics
        ///
        /// If the clock's mutex is poisoned.
        #[allow(clippy::unwrap_used)]
        pub fn set(&self, time: DateTime<Utc>) {
            *self.time.lock().unwrap() = time;
        }
    }

    impl Clock for ManualClock {
        #[allow(clippy::unwrap_used)]
        fn now(&self) -> DateTime<Utc> {
            *self.time.lock().unwrap()
        }
    }

    /// XOR "encryption" with per-key single-byte keys. Only for tests.
    #[derive(Debug, Clone)]
    pub struct XorCodec {
        default_key: String,
        keys: HashMap<String, u8>,
    }

    impl XorCodec {
        /// Codec with one key, used as default.
        #[must_use]
        pub fn new(key_id: impl Into<String>, key: u8) -> Self {
            let default_key = key_id.into();
            let keys = HashMap::from([(default_key.clone(), key)]);
            Self { default_key, keys }
        }

        /// Add another (non-default) key.
        #[must_use]
        pub fn with_key(mut self, key_id: impl Into<String>, key: u8) -> Self {
            self.keys.insert(key_id.into(), key);
            self
        }

        fn apply(&self, key_id: &str, bytes: &[u8]) -> Result<Vec<u8>, CryptoError> {
            let key = self
                .keys
                .get(key_id)
                .ok_or_else(|| CryptoError::UnknownKey(key_id.to_string()))?;
            Ok(bytes.iter().map(|b| b ^ key).collect())
        }
    }

    impl Default for XorCodec {
        fn default() -> Self {
            Self::new("test-key", 0x5a)
        }
    }

    impl EncryptionCodec for XorCodec {
        fn default_key_id(&self) -> &str {
            &self.default_key
        }

        fn encrypt(&self, key_id: &str, plain: &[u8]) -> Result<Vec<u8>, CryptoError> {
            self.apply(key_id, plain)
        }

        fn decrypt(&self, key_id: &str, crypted: &[u8]) -> Result<Vec<u8>, CryptoError> {
            self.apply(key_id, crypted)
        }
    }
}

/// Test helpers and utilities
pub mod helpers {
    use super::{Clock, DateTime, Utc};
    use eventide_core::event::{EventMeta, EventType, PendingEvent, RecordedEvent, StoredEvent};
    use eventide_core::stream::{AggregateKey, Position, Sequence};

    /// Install a `tracing` subscriber honouring `RUST_LOG`, once per process.
    pub fn init_tracing() {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    }

    /// Decoded event with metadata filled in for reducer tests.
    #[must_use]
    pub fn recorded<E>(
        key: &AggregateKey,
        event_type: &str,
        sequence: u64,
        position: u64,
        creation_date: DateTime<Utc>,
        data: E,
    ) -> RecordedEvent<E> {
        RecordedEvent {
            meta: EventMeta {
                key: key.clone(),
                resource_owner: key.aggregate_id.clone(),
                sequence: Sequence::new(sequence),
                position: Position::new(position),
                event_type: EventType::from(event_type),
                creation_date,
                actor_id: "test-actor".to_string(),
            },
            data,
        }
    }

    /// Raw event with an arbitrary payload, as if read from storage.
    #[must_use]
    pub fn stored(
        key: &AggregateKey,
        event_type: &str,
        sequence: u64,
        position: u64,
        payload: Vec<u8>,
    ) -> StoredEvent {
        StoredEvent::from_pending(
            key.clone(),
            PendingEvent::new(event_type, key.aggregate_id.clone(), "test-actor", payload),
            Sequence::new(sequence),
            Position::new(position),
            super::mocks::test_clock().now(),
        )
    }
}

/// Property-based testing utilities
pub mod properties {
    use eventide_core::event::PendingEvent;
    use proptest::prelude::*;

    /// Strategy for batches of pending events with small random payloads.
    pub fn pending_events(max: usize) -> impl Strategy<Value = Vec<PendingEvent>> {
        prop::collection::vec(
            (prop::sample::select(vec!["a.added", "a.changed", "a.removed"]), prop::collection::vec(any::<u8>(), 0..8)),
            1..=max,
        )
        .prop_map(|events| {
            events
                .into_iter()
                .map(|(event_type, payload)| PendingEvent::new(event_type, "owner", "actor", payload))
                .collect()
        })
    }
}

// Re-export commonly used items
pub use event_store::InMemoryEventStore;
pub use locker::InMemoryLocker;
pub use mocks::{FixedClock, ManualClock, XorCodec, test_clock};
pub use projection_mocks::{
    DeadLetter, InMemoryDeadLetters, InMemoryReadModelStore, ProjectionTestHarness, StateMutation, mutation,
};
