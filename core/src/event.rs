//! Event records: what command handlers append and what readers get back.
//!
//! # Layers
//!
//! - [`Event`]: a typed payload struct that knows its wire type tag and how to
//!   encode itself (bincode).
//! - [`PendingEvent`]: an encoded event waiting to be appended. It has no
//!   sequence, position or timestamp yet; those are assigned by the store.
//! - [`StoredEvent`]: a committed event with raw payload bytes.
//! - [`RecordedEvent`]: a committed event whose payload was decoded through
//!   the [`EventTypeRegistry`](crate::registry::EventTypeRegistry).
//!
//! # Example
//!
//! ```
//! use eventide_core::event::{Event, PendingEvent};
//! use serde::{Deserialize, Serialize};
//!
//! #[derive(Clone, Debug, Serialize, Deserialize)]
//! struct HumanAdded {
//!     username: String,
//! }
//!
//! impl Event for HumanAdded {
//!     fn event_type(&self) -> &'static str {
//!         "user.human.added"
//!     }
//! }
//!
//! let pending = PendingEvent::from_event(
//!     &HumanAdded { username: "gigi".into() },
//!     "org-1",
//!     "admin-1",
//! )
//! .unwrap();
//! assert_eq!(pending.event_type.as_str(), "user.human.added");
//! ```

use crate::stream::{AggregateKey, Position, Sequence};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize, de::DeserializeOwned};
use std::fmt;
use thiserror::Error;

/// Payload format version written with every event.
///
/// Bumped when the payload encoding itself changes (not when a single event
/// schema changes; that is expressed through a new type tag).
pub const PAYLOAD_VERSION: i32 = 1;

/// Error types for event payload encoding.
#[derive(Error, Debug)]
pub enum EventError {
    /// Failed to serialize event to bytes.
    #[error("Failed to serialize event: {0}")]
    SerializationError(String),

    /// Failed to deserialize event from bytes.
    #[error("Failed to deserialize event: {0}")]
    DeserializationError(String),
}

/// Wire type tag of an event, such as `"user.human.added"`.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct EventType(String);

impl EventType {
    /// Create a new event type tag.
    #[must_use]
    pub fn new(tag: impl Into<String>) -> Self {
        Self(tag.into())
    }

    /// The tag as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for EventType {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for EventType {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// A typed event payload that can be appended to the store.
///
/// The type tag returned by [`Event::event_type`] must be stable: it is the
/// key used by the registry to find the decoder. Schema changes that are not
/// backwards compatible get a new tag.
pub trait Event: Send + Sync + 'static {
    /// Returns the wire type tag for this event.
    fn event_type(&self) -> &'static str;

    /// Serialize this event to bincode bytes.
    ///
    /// # Errors
    ///
    /// Returns `EventError::SerializationError` if the event cannot be serialized.
    fn to_bytes(&self) -> Result<Vec<u8>, EventError>
    where
        Self: Serialize,
    {
        bincode::serialize(self).map_err(|e| EventError::SerializationError(e.to_string()))
    }

    /// Deserialize an event from bincode bytes.
    ///
    /// # Errors
    ///
    /// Returns `EventError::DeserializationError` if the bytes are corrupted or
    /// belong to a different schema.
    fn from_bytes(bytes: &[u8]) -> Result<Self, EventError>
    where
        Self: DeserializeOwned + Sized,
    {
        bincode::deserialize(bytes).map_err(|e| EventError::DeserializationError(e.to_string()))
    }
}

/// An encoded event waiting to be appended.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PendingEvent {
    /// Wire type tag.
    pub event_type: EventType,

    /// Organization that owns the resource the event is about.
    pub resource_owner: String,

    /// User or system principal that caused the event.
    pub actor_id: String,

    /// Encoded payload.
    pub payload: Vec<u8>,

    /// Payload format version, see [`PAYLOAD_VERSION`].
    pub payload_version: i32,
}

impl PendingEvent {
    /// Create a pending event from already encoded bytes.
    #[must_use]
    pub fn new(
        event_type: impl Into<EventType>,
        resource_owner: impl Into<String>,
        actor_id: impl Into<String>,
        payload: Vec<u8>,
    ) -> Self {
        Self {
            event_type: event_type.into(),
            resource_owner: resource_owner.into(),
            actor_id: actor_id.into(),
            payload,
            payload_version: PAYLOAD_VERSION,
        }
    }

    /// Encode a typed event.
    ///
    /// # Errors
    ///
    /// Returns `EventError::SerializationError` if the payload cannot be encoded.
    pub fn from_event<E: Event + Serialize>(
        event: &E,
        resource_owner: impl Into<String>,
        actor_id: impl Into<String>,
    ) -> Result<Self, EventError> {
        Ok(Self::new(
            event.event_type(),
            resource_owner,
            actor_id,
            event.to_bytes()?,
        ))
    }
}

/// Everything about a committed event except its payload.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EventMeta {
    /// Stream the event belongs to.
    pub key: AggregateKey,

    /// Organization that owns the resource.
    pub resource_owner: String,

    /// Position inside the stream, starting at 1.
    pub sequence: Sequence,

    /// Global commit position.
    pub position: Position,

    /// Wire type tag.
    pub event_type: EventType,

    /// Server-assigned commit timestamp.
    pub creation_date: DateTime<Utc>,

    /// Principal that caused the event.
    pub actor_id: String,
}

/// A committed event with its raw payload.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StoredEvent {
    /// Event metadata.
    pub meta: EventMeta,

    /// Encoded payload.
    pub payload: Vec<u8>,

    /// Payload format version.
    pub payload_version: i32,
}

impl StoredEvent {
    /// Build the stored form of a pending event once the store assigned its
    /// coordinates.
    #[must_use]
    pub fn from_pending(
        key: AggregateKey,
        pending: PendingEvent,
        sequence: Sequence,
        position: Position,
        creation_date: DateTime<Utc>,
    ) -> Self {
        Self {
            meta: EventMeta {
                key,
                resource_owner: pending.resource_owner,
                sequence,
                position,
                event_type: pending.event_type,
                creation_date,
                actor_id: pending.actor_id,
            },
            payload: pending.payload,
            payload_version: pending.payload_version,
        }
    }
}

impl fmt::Display for StoredEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "StoredEvent {{ key: {}, seq: {}, pos: {}, type: {}, size: {} bytes }}",
            self.meta.key,
            self.meta.sequence,
            self.meta.position,
            self.meta.event_type,
            self.payload.len()
        )
    }
}

/// A committed event with a decoded payload.
#[derive(Clone, Debug, PartialEq)]
pub struct RecordedEvent<E> {
    /// Event metadata.
    pub meta: EventMeta,

    /// Decoded payload.
    pub data: E,
}

impl<E> RecordedEvent<E> {
    /// Stream key shortcut.
    #[must_use]
    pub const fn key(&self) -> &AggregateKey {
        &self.meta.key
    }

    /// Sequence shortcut.
    #[must_use]
    pub const fn sequence(&self) -> Sequence {
        self.meta.sequence
    }

    /// Position shortcut.
    #[must_use]
    pub const fn position(&self) -> Position {
        self.meta.position
    }
}
