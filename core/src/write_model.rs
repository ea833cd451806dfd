//! Write models: transient reductions of an aggregate's history used by
//! command handlers.
//!
//! A write model is built for one command invocation, loaded from the event
//! store, used to validate the command and compute a change, then dropped.
//! Its [`WriteModelState::processed_sequence`] is the expected sequence for
//! the append that follows.
//!
//! # Example
//!
//! ```
//! use eventide_core::event::RecordedEvent;
//! use eventide_core::search::SearchQuery;
//! use eventide_core::stream::AggregateKey;
//! use eventide_core::write_model::{Diff, WriteModel, WriteModelState};
//!
//! enum UserEvent { NameChanged(String), Removed }
//!
//! struct UserNameModel { state: WriteModelState, name: String }
//!
//! impl WriteModel for UserNameModel {
//!     type Event = UserEvent;
//!
//!     fn state(&self) -> &WriteModelState { &self.state }
//!     fn state_mut(&mut self) -> &mut WriteModelState { &mut self.state }
//!     fn query(&self) -> SearchQuery { SearchQuery::for_aggregate(&self.state.key) }
//!
//!     fn apply(&mut self, event: &RecordedEvent<UserEvent>) {
//!         if let UserEvent::NameChanged(name) = &event.data {
//!             self.name.clone_from(name);
//!         }
//!     }
//! }
//!
//! let model = UserNameModel {
//!     state: WriteModelState::new(AggregateKey::new("inst", "user", "u1")),
//!     name: "ada".into(),
//! };
//! let (change, changed) = Diff::new(None::<String>)
//!     .field(&model.name, Some("ada".to_string()), |c, v| *c = Some(v))
//!     .finish();
//! assert!(!changed);
//! assert!(change.is_none());
//! ```

use crate::event::{EventMeta, RecordedEvent, StoredEvent};
use crate::search::SearchQuery;
use crate::stream::{AggregateKey, Position, Sequence};
use chrono::{DateTime, Utc};
use thiserror::Error;

/// Errors raised while folding events into a write model.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ReduceError {
    /// Events were not supplied in ascending commit order.
    #[error("Event at position {got} is not after already processed position {processed} ({key})")]
    OutOfOrder {
        /// Stream of the offending event.
        key: AggregateKey,
        /// Last processed position.
        processed: Position,
        /// Position of the offending event.
        got: Position,
    },
}

/// Bookkeeping shared by every write model.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WriteModelState {
    /// Stream the model reduces.
    pub key: AggregateKey,
    /// Sequence of the last applied event of `key` (the expected sequence
    /// for the next append).
    pub processed_sequence: Sequence,
    /// Global position of the last applied event.
    pub processed_position: Position,
    /// Resource owner of the last applied event of `key`.
    pub resource_owner: Option<String>,
    /// Timestamp of the first applied event of `key`.
    pub creation_date: Option<DateTime<Utc>>,
    /// Timestamp of the last applied event of `key`.
    pub change_date: Option<DateTime<Utc>>,
}

impl WriteModelState {
    /// Fresh state for one stream.
    #[must_use]
    pub const fn new(key: AggregateKey) -> Self {
        Self {
            key,
            processed_sequence: Sequence::INITIAL,
            processed_position: Position::BEGINNING,
            resource_owner: None,
            creation_date: None,
            change_date: None,
        }
    }

    /// Record an applied event.
    ///
    /// Events of other streams (write models may read related aggregates)
    /// only advance the processed position.
    ///
    /// # Errors
    ///
    /// [`ReduceError::OutOfOrder`] if the event is not after the last one.
    pub fn track<E>(&mut self, event: &RecordedEvent<E>) -> Result<(), ReduceError> {
        self.track_meta(&event.meta)
    }

    /// Record an event the model skipped without decoding it.
    ///
    /// Skipped events still advance the processed markers, otherwise the
    /// expected sequence would lag behind the stream.
    ///
    /// # Errors
    ///
    /// [`ReduceError::OutOfOrder`] if the event is not after the last one.
    pub fn track_raw(&mut self, event: &StoredEvent) -> Result<(), ReduceError> {
        self.track_meta(&event.meta)
    }

    fn track_meta(&mut self, meta: &EventMeta) -> Result<(), ReduceError> {
        if meta.position <= self.processed_position {
            return Err(ReduceError::OutOfOrder {
                key: meta.key.clone(),
                processed: self.processed_position,
                got: meta.position,
            });
        }
        self.processed_position = meta.position;
        if meta.key == self.key {
            self.processed_sequence = meta.sequence;
            self.resource_owner = Some(meta.resource_owner.clone());
            self.change_date = Some(meta.creation_date);
            self.creation_date.get_or_insert(meta.creation_date);
        }
        Ok(())
    }

    /// Raise the processed sequence to the stream's current sequence.
    ///
    /// Used after loading with an event type allowlist: skipped events are
    /// irrelevant to the model but still count for the expected sequence.
    pub fn observe_sequence(&mut self, current: Sequence) {
        if current > self.processed_sequence {
            self.processed_sequence = current;
        }
    }

    /// Whether any event of the stream was applied.
    #[must_use]
    pub const fn exists(&self) -> bool {
        !self.processed_sequence.is_initial()
    }
}

/// A transient per-aggregate reducer.
///
/// Implementors provide the query, a closed `match` over their event type in
/// [`WriteModel::apply`], and access to the shared [`WriteModelState`].
/// Events the model does not care about are ignored in `apply`.
pub trait WriteModel {
    /// Domain event sum type.
    type Event;

    /// Shared bookkeeping.
    fn state(&self) -> &WriteModelState;

    /// Shared bookkeeping, mutable.
    fn state_mut(&mut self) -> &mut WriteModelState;

    /// Filter criteria for the history this model needs.
    fn query(&self) -> SearchQuery;

    /// Apply one event to the domain fields.
    fn apply(&mut self, event: &RecordedEvent<Self::Event>);

    /// Fold events in ascending order.
    ///
    /// Reducing `[e1..en]` and then `[e(n+1)..]` yields the same state as
    /// reducing everything in one pass.
    ///
    /// # Errors
    ///
    /// [`ReduceError::OutOfOrder`] if an event is not after the previous one;
    /// events before the offending one stay applied.
    fn reduce<'a, I>(&mut self, events: I) -> Result<(), ReduceError>
    where
        I: IntoIterator<Item = &'a RecordedEvent<Self::Event>>,
        Self::Event: 'a,
    {
        for event in events {
            self.state_mut().track(event)?;
            self.apply(event);
        }
        Ok(())
    }

    /// Sequence to pass as expected sequence to the next append.
    fn expected_sequence(&self) -> Sequence {
        self.state().processed_sequence
    }
}

/// Field-by-field change detection.
///
/// `None` as a proposed value is the "unset" sentinel: the field is not
/// updated. A set value equal to the current one is not a change either.
#[derive(Debug, Clone)]
pub struct Diff<C> {
    change: C,
    has_changed: bool,
}

impl<C> Diff<C> {
    /// Start from an empty change event.
    pub const fn new(change: C) -> Self {
        Self {
            change,
            has_changed: false,
        }
    }

    /// Compare one field and record it in the change when it differs.
    #[must_use]
    pub fn field<T, F>(mut self, current: &T, proposed: Option<T>, set: F) -> Self
    where
        T: PartialEq,
        F: FnOnce(&mut C, T),
    {
        if let Some(value) = proposed {
            if *current != value {
                set(&mut self.change, value);
                self.has_changed = true;
            }
        }
        self
    }

    /// The change event and whether anything differs.
    #[must_use]
    pub fn finish(self) -> (C, bool) {
        (self.change, self.has_changed)
    }

    /// The change event, only if anything differs.
    #[must_use]
    pub fn into_change(self) -> Option<C> {
        self.has_changed.then_some(self.change)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::event::EventType;

    #[derive(Debug, Clone, PartialEq)]
    enum CounterEvent {
        Added(i64),
        Reset,
        Unrelated,
    }

    #[derive(Debug, Clone, PartialEq)]
    struct CounterModel {
        state: WriteModelState,
        total: i64,
    }

    impl CounterModel {
        fn new() -> Self {
            Self {
                state: WriteModelState::new(AggregateKey::new("i", "counter", "c1")),
                total: 0,
            }
        }
    }

    impl WriteModel for CounterModel {
        type Event = CounterEvent;

        fn state(&self) -> &WriteModelState {
            &self.state
        }

        fn state_mut(&mut self) -> &mut WriteModelState {
            &mut self.state
        }

        fn query(&self) -> SearchQuery {
            SearchQuery::for_aggregate(&self.state.key)
        }

        fn apply(&mut self, event: &RecordedEvent<CounterEvent>) {
            match event.data {
                CounterEvent::Added(n) => self.total += n,
                CounterEvent::Reset => self.total = 0,
                CounterEvent::Unrelated => {}
            }
        }
    }

    fn recorded(key: &AggregateKey, seq: u64, pos: u64, data: CounterEvent) -> RecordedEvent<CounterEvent> {
        RecordedEvent {
            meta: EventMeta {
                key: key.clone(),
                resource_owner: "org".into(),
                sequence: Sequence::new(seq),
                position: Position::new(pos),
                event_type: EventType::from("counter.event"),
                creation_date: DateTime::from_timestamp(1_700_000_000 + i64::try_from(pos).unwrap(), 0).unwrap(),
                actor_id: "actor".into(),
            },
            data,
        }
    }

    #[test]
    fn reduce_tracks_last_event() {
        let mut model = CounterModel::new();
        let key = model.state.key.clone();
        let events = vec![
            recorded(&key, 1, 3, CounterEvent::Added(2)),
            recorded(&key, 2, 8, CounterEvent::Unrelated),
            recorded(&key, 3, 9, CounterEvent::Added(5)),
        ];

        model.reduce(&events).unwrap();

        assert_eq!(model.total, 7);
        assert_eq!(model.expected_sequence(), Sequence::new(3));
        assert_eq!(model.state.processed_position, Position::new(9));
        assert_eq!(model.state.creation_date, Some(events[0].meta.creation_date));
        assert_eq!(model.state.change_date, Some(events[2].meta.creation_date));
        assert!(model.state.exists());
    }

    #[test]
    fn reduce_rejects_out_of_order_events() {
        let mut model = CounterModel::new();
        let key = model.state.key.clone();
        let events = vec![
            recorded(&key, 2, 5, CounterEvent::Added(1)),
            recorded(&key, 1, 4, CounterEvent::Reset),
        ];

        let err = model.reduce(&events).unwrap_err();

        assert!(matches!(err, ReduceError::OutOfOrder { got, .. } if got == Position::new(4)));
        assert_eq!(model.total, 1);
    }

    #[test]
    fn events_of_other_streams_only_move_the_position() {
        let mut model = CounterModel::new();
        let other = AggregateKey::new("i", "counter", "c2");

        model.reduce(&[recorded(&other, 4, 2, CounterEvent::Added(10))]).unwrap();

        assert_eq!(model.expected_sequence(), Sequence::INITIAL);
        assert_eq!(model.state.processed_position, Position::new(2));
        assert!(!model.state.exists());
    }

    #[test]
    fn skipped_raw_events_advance_the_markers() {
        let mut model = CounterModel::new();
        let key = model.state.key.clone();
        model.reduce(&[recorded(&key, 1, 3, CounterEvent::Added(2))]).unwrap();

        let skipped = StoredEvent {
            meta: recorded(&key, 2, 5, CounterEvent::Unrelated).meta,
            payload: vec![0xff],
            payload_version: crate::event::PAYLOAD_VERSION,
        };
        model.state_mut().track_raw(&skipped).unwrap();

        assert_eq!(model.total, 2);
        assert_eq!(model.expected_sequence(), Sequence::new(2));
        assert_eq!(model.state.processed_position, Position::new(5));
        assert!(model.state_mut().track_raw(&skipped).is_err());
    }

    #[test]
    fn observe_sequence_never_lowers() {
        let mut state = WriteModelState::new(AggregateKey::new("i", "counter", "c1"));
        state.observe_sequence(Sequence::new(4));
        state.observe_sequence(Sequence::new(2));
        assert_eq!(state.processed_sequence, Sequence::new(4));
    }

    #[derive(Debug, Default, PartialEq)]
    struct ProfileChanged {
        first_name: Option<String>,
        last_name: Option<String>,
    }

    #[test]
    fn diff_emits_only_differing_fields() {
        let (change, changed) = Diff::new(ProfileChanged::default())
            .field(&"Ada".to_string(), Some("Ada".to_string()), |c, v| c.first_name = Some(v))
            .field(&"Byron".to_string(), Some("Lovelace".to_string()), |c, v| c.last_name = Some(v))
            .finish();

        assert!(changed);
        assert_eq!(
            change,
            ProfileChanged {
                first_name: None,
                last_name: Some("Lovelace".into())
            }
        );
    }

    #[test]
    fn diff_ignores_unset_fields() {
        let diff = Diff::new(ProfileChanged::default())
            .field(&"Ada".to_string(), None, |c, v| c.first_name = Some(v));
        assert!(diff.into_change().is_none());
    }
}
