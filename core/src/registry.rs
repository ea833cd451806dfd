//! Event type registry: wire type tag to typed decoder.
//!
//! The registry is built once during startup composition with a
//! [`RegistryBuilder`] and then shared by reference (usually behind an `Arc`)
//! with every component that decodes events. Once built it cannot be
//! modified, so there is no way to register decoders after traffic started.
//!
//! ```
//! use eventide_core::registry::EventTypeRegistry;
//! use serde::{Deserialize, Serialize};
//!
//! #[derive(Debug, Serialize, Deserialize)]
//! struct OrgAdded { name: String }
//!
//! #[derive(Debug)]
//! enum OrgEvent { Added(OrgAdded) }
//!
//! let registry = EventTypeRegistry::<OrgEvent>::builder()
//!     .register_bincode("org", "org.added", OrgEvent::Added)
//!     .unwrap()
//!     .build();
//! assert!(registry.contains("org.added"));
//! ```

use crate::event::{EventError, EventMeta, EventType, RecordedEvent, StoredEvent};
use crate::stream::{AggregateKey, AggregateType, Sequence};
use serde::de::DeserializeOwned;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use thiserror::Error;

/// Decoder from a raw stored event to the domain's event type.
pub type DecodeFn<E> = Arc<dyn Fn(&StoredEvent) -> Result<E, EventError> + Send + Sync>;

/// Startup-time registration errors.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RegistryError {
    /// A decoder for this tag was already registered.
    #[error("Event type {event_type} is already registered for aggregate type {aggregate_type}")]
    DuplicateEventType {
        /// Tag registered twice.
        event_type: EventType,
        /// Aggregate type of the existing registration.
        aggregate_type: AggregateType,
    },

    /// An empty tag or aggregate type was given.
    #[error("Event type and aggregate type must not be empty")]
    EmptyName,
}

/// Per-event decoding failure.
///
/// Both variants are recoverable for the caller: the event can be skipped,
/// dead-lettered or treated as fatal depending on the consumer's policy.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    /// No decoder is registered for the tag.
    #[error("Unknown event type {event_type} at {key}#{sequence}")]
    UnknownEventType {
        /// Stream of the event.
        key: AggregateKey,
        /// Sequence of the event.
        sequence: Sequence,
        /// Unregistered tag.
        event_type: EventType,
    },

    /// A decoder exists but rejected the payload.
    #[error("Malformed payload for {event_type} at {key}#{sequence}: {reason}")]
    MalformedPayload {
        /// Stream of the event.
        key: AggregateKey,
        /// Sequence of the event.
        sequence: Sequence,
        /// Tag of the event.
        event_type: EventType,
        /// Decoder error message.
        reason: String,
    },
}

impl DecodeError {
    /// Tag of the event that failed to decode.
    #[must_use]
    pub const fn event_type(&self) -> &EventType {
        match self {
            Self::UnknownEventType { event_type, .. } | Self::MalformedPayload { event_type, .. } => {
                event_type
            }
        }
    }

    /// Whether the failure is an unregistered tag.
    #[must_use]
    pub const fn is_unknown_type(&self) -> bool {
        matches!(self, Self::UnknownEventType { .. })
    }
}

struct Registration<E> {
    aggregate_type: AggregateType,
    decode: DecodeFn<E>,
}

/// Builder collecting registrations during startup.
pub struct RegistryBuilder<E> {
    entries: HashMap<EventType, Registration<E>>,
}

impl<E: 'static> RegistryBuilder<E> {
    /// Register a decoder for a tag.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::DuplicateEventType`] if the tag is already
    /// registered, or [`RegistryError::EmptyName`] for empty names.
    pub fn register<F>(
        mut self,
        aggregate_type: impl Into<AggregateType>,
        event_type: impl Into<EventType>,
        decode: F,
    ) -> Result<Self, RegistryError>
    where
        F: Fn(&StoredEvent) -> Result<E, EventError> + Send + Sync + 'static,
    {
        let aggregate_type = aggregate_type.into();
        let event_type = event_type.into();
        if aggregate_type.as_str().is_empty() || event_type.as_str().is_empty() {
            return Err(RegistryError::EmptyName);
        }
        if let Some(existing) = self.entries.get(&event_type) {
            return Err(RegistryError::DuplicateEventType {
                event_type,
                aggregate_type: existing.aggregate_type.clone(),
            });
        }
        self.entries.insert(
            event_type,
            Registration {
                aggregate_type,
                decode: Arc::new(decode),
            },
        );
        Ok(self)
    }

    /// Register a bincode payload struct mapped into the domain event type.
    ///
    /// # Errors
    ///
    /// Same as [`RegistryBuilder::register`].
    pub fn register_bincode<T, F>(
        self,
        aggregate_type: impl Into<AggregateType>,
        event_type: impl Into<EventType>,
        into_event: F,
    ) -> Result<Self, RegistryError>
    where
        T: DeserializeOwned,
        F: Fn(T) -> E + Send + Sync + 'static,
    {
        self.register(aggregate_type, event_type, move |raw: &StoredEvent| {
            bincode::deserialize::<T>(&raw.payload)
                .map(&into_event)
                .map_err(|e| EventError::DeserializationError(e.to_string()))
        })
    }

    /// Replace (or add) a decoder on purpose.
    ///
    /// Unlike [`RegistryBuilder::register`] this never fails; replacing an
    /// existing registration is logged so the override is visible in startup
    /// logs.
    #[must_use]
    pub fn override_decoder<F>(
        mut self,
        aggregate_type: impl Into<AggregateType>,
        event_type: impl Into<EventType>,
        decode: F,
    ) -> Self
    where
        F: Fn(&StoredEvent) -> Result<E, EventError> + Send + Sync + 'static,
    {
        let aggregate_type = aggregate_type.into();
        let event_type = event_type.into();
        if let Some(previous) = self.entries.get(&event_type) {
            tracing::warn!(
                event_type = %event_type,
                previous_aggregate_type = %previous.aggregate_type,
                aggregate_type = %aggregate_type,
                "Overriding event decoder"
            );
        }
        self.entries.insert(
            event_type,
            Registration {
                aggregate_type,
                decode: Arc::new(decode),
            },
        );
        self
    }

    /// Close registration.
    #[must_use]
    pub fn build(self) -> EventTypeRegistry<E> {
        tracing::debug!(event_types = self.entries.len(), "Event type registry built");
        EventTypeRegistry {
            entries: self.entries,
        }
    }
}

/// Immutable mapping from tag to decoder.
pub struct EventTypeRegistry<E> {
    entries: HashMap<EventType, Registration<E>>,
}

impl<E: 'static> EventTypeRegistry<E> {
    /// Start a new registration phase.
    #[must_use]
    pub fn builder() -> RegistryBuilder<E> {
        RegistryBuilder {
            entries: HashMap::new(),
        }
    }

    /// Decode a stored event.
    ///
    /// # Errors
    ///
    /// [`DecodeError::UnknownEventType`] if the tag is not registered,
    /// [`DecodeError::MalformedPayload`] if the decoder rejects the payload.
    pub fn decode(&self, raw: &StoredEvent) -> Result<RecordedEvent<E>, DecodeError> {
        let Some(entry) = self.entries.get(&raw.meta.event_type) else {
            return Err(DecodeError::UnknownEventType {
                key: raw.meta.key.clone(),
                sequence: raw.meta.sequence,
                event_type: raw.meta.event_type.clone(),
            });
        };

        let data = (entry.decode)(raw).map_err(|e| DecodeError::MalformedPayload {
            key: raw.meta.key.clone(),
            sequence: raw.meta.sequence,
            event_type: raw.meta.event_type.clone(),
            reason: e.to_string(),
        })?;

        Ok(RecordedEvent {
            meta: EventMeta::clone(&raw.meta),
            data,
        })
    }

    /// Whether a decoder exists for the tag.
    #[must_use]
    pub fn contains(&self, event_type: &str) -> bool {
        self.entries.contains_key(&EventType::from(event_type))
    }

    /// Aggregate type a tag was registered under.
    #[must_use]
    pub fn aggregate_type_of(&self, event_type: &EventType) -> Option<&AggregateType> {
        self.entries.get(event_type).map(|entry| &entry.aggregate_type)
    }

    /// Number of registered tags.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether nothing is registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl<E> fmt::Debug for EventTypeRegistry<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut tags: Vec<&str> = self.entries.keys().map(EventType::as_str).collect();
        tags.sort_unstable();
        f.debug_struct("EventTypeRegistry").field("event_types", &tags).finish()
    }
}
