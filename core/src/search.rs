//! Search queries for filtering the event store.
//!
//! A [`SearchQuery`] holds builder-level criteria that apply to every event
//! (tenant, resource owner, position lower bound, ordering, limit) and one or
//! more [`SubQuery`] values. Sub-queries are OR-connected; the criteria inside
//! one sub-query are AND-connected.
//!
//! ```
//! use eventide_core::search::{SearchQuery, SubQuery};
//!
//! // All user events of user-1 plus every org policy event, in tenant "inst".
//! let query = SearchQuery::new()
//!     .tenant("inst")
//!     .add_query(SubQuery::new().aggregate_types(["user"]).aggregate_ids(["user-1"]))
//!     .add_query(
//!         SubQuery::new()
//!             .aggregate_types(["org"])
//!             .event_types(["org.policy.lockout.added", "org.policy.lockout.changed"]),
//!     );
//! assert!(query.validate().is_ok());
//! ```

use crate::event::{EventType, StoredEvent};
use crate::stream::{AggregateKey, AggregateType, Position, Sequence};
use serde::{Deserialize, Serialize};

/// Ordering of filter results by global position.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum SortOrder {
    /// Oldest first.
    #[default]
    Ascending,
    /// Newest first.
    Descending,
}

/// AND-connected criteria; OR-connected with sibling sub-queries.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubQuery {
    /// Aggregate types to match (at least one is required).
    pub aggregate_types: Vec<AggregateType>,
    /// Aggregate IDs to match; empty matches any ID.
    pub aggregate_ids: Vec<String>,
    /// Event type tags to match; empty matches any type.
    pub event_types: Vec<EventType>,
    /// Exclusive lower bound on the per-aggregate sequence.
    pub sequence_greater: Option<Sequence>,
    /// Exclusive upper bound on the per-aggregate sequence.
    pub sequence_less: Option<Sequence>,
}

impl SubQuery {
    /// Empty sub-query; add at least one aggregate type.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Filter for events of the given aggregate types.
    #[must_use]
    pub fn aggregate_types<I, T>(mut self, types: I) -> Self
    where
        I: IntoIterator<Item = T>,
        T: Into<AggregateType>,
    {
        self.aggregate_types = types.into_iter().map(Into::into).collect();
        self
    }

    /// Filter for events of the given aggregate IDs.
    #[must_use]
    pub fn aggregate_ids<I, T>(mut self, ids: I) -> Self
    where
        I: IntoIterator<Item = T>,
        T: Into<String>,
    {
        self.aggregate_ids = ids.into_iter().map(Into::into).collect();
        self
    }

    /// Filter for the given event type tags.
    #[must_use]
    pub fn event_types<I, T>(mut self, types: I) -> Self
    where
        I: IntoIterator<Item = T>,
        T: Into<EventType>,
    {
        self.event_types = types.into_iter().map(Into::into).collect();
        self
    }

    /// Only events with a sequence greater than `sequence`.
    #[must_use]
    pub const fn sequence_greater(mut self, sequence: Sequence) -> Self {
        self.sequence_greater = Some(sequence);
        self
    }

    /// Only events with a sequence less than `sequence`.
    #[must_use]
    pub const fn sequence_less(mut self, sequence: Sequence) -> Self {
        self.sequence_less = Some(sequence);
        self
    }

    fn matches(&self, event: &StoredEvent) -> bool {
        let meta = &event.meta;
        if !self.aggregate_types.contains(&meta.key.aggregate_type) {
            return false;
        }
        if !self.aggregate_ids.is_empty() && !self.aggregate_ids.contains(&meta.key.aggregate_id) {
            return false;
        }
        if !self.event_types.is_empty() && !self.event_types.contains(&meta.event_type) {
            return false;
        }
        if self.sequence_greater.is_some_and(|s| meta.sequence <= s) {
            return false;
        }
        if self.sequence_less.is_some_and(|s| meta.sequence >= s) {
            return false;
        }
        true
    }
}

/// Filter criteria for [`EventStore::filter`](crate::event_store::EventStore::filter).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SearchQuery {
    /// Tenant all events must belong to.
    pub tenant: Option<String>,
    /// Resource owner all events must carry.
    pub resource_owner: Option<String>,
    /// Exclusive lower bound on the global position.
    pub position_after: Option<Position>,
    /// Maximum number of events returned.
    pub limit: Option<u64>,
    /// Result ordering.
    pub order: SortOrder,
    /// OR-connected sub-queries.
    pub queries: Vec<SubQuery>,
}

impl SearchQuery {
    /// Empty query; add at least one sub-query.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Query matching every event of one aggregate stream.
    #[must_use]
    pub fn for_aggregate(key: &AggregateKey) -> Self {
        Self::new().tenant(key.tenant.clone()).add_query(
            SubQuery::new()
                .aggregate_types([key.aggregate_type.clone()])
                .aggregate_ids([key.aggregate_id.clone()]),
        )
    }

    /// Restrict to one tenant.
    #[must_use]
    pub fn tenant(mut self, tenant: impl Into<String>) -> Self {
        self.tenant = Some(tenant.into());
        self
    }

    /// Restrict to one resource owner.
    #[must_use]
    pub fn resource_owner(mut self, resource_owner: impl Into<String>) -> Self {
        self.resource_owner = Some(resource_owner.into());
        self
    }

    /// Only events committed after `position`.
    #[must_use]
    pub const fn position_after(mut self, position: Position) -> Self {
        self.position_after = Some(position);
        self
    }

    /// Return at most `limit` events.
    #[must_use]
    pub const fn limit(mut self, limit: u64) -> Self {
        self.limit = Some(limit);
        self
    }

    /// Newest first.
    #[must_use]
    pub const fn order_desc(mut self) -> Self {
        self.order = SortOrder::Descending;
        self
    }

    /// Oldest first (the default).
    #[must_use]
    pub const fn order_asc(mut self) -> Self {
        self.order = SortOrder::Ascending;
        self
    }

    /// Add an OR-connected sub-query.
    #[must_use]
    pub fn add_query(mut self, query: SubQuery) -> Self {
        self.queries.push(query);
        self
    }

    /// Whether any sub-query narrows the event types.
    #[must_use]
    pub fn narrows_event_types(&self) -> bool {
        self.queries.iter().any(|q| !q.event_types.is_empty())
    }

    /// Check that the query can be executed.
    ///
    /// # Errors
    ///
    /// Returns a description of the problem if there are no sub-queries, a
    /// sub-query has no aggregate type, or the limit is zero.
    pub fn validate(&self) -> Result<(), String> {
        if self.queries.is_empty() {
            return Err("search query needs at least one sub-query".to_string());
        }
        if self.queries.iter().any(|q| q.aggregate_types.is_empty()) {
            return Err("every sub-query needs at least one aggregate type".to_string());
        }
        if self.limit == Some(0) {
            return Err("limit must be greater than zero".to_string());
        }
        Ok(())
    }

    /// Evaluate the predicate in memory (ignores `limit` and `order`).
    #[must_use]
    pub fn matches(&self, event: &StoredEvent) -> bool {
        let meta = &event.meta;
        if self.tenant.as_ref().is_some_and(|t| *t != meta.key.tenant) {
            return false;
        }
        if self.resource_owner.as_ref().is_some_and(|o| *o != meta.resource_owner) {
            return false;
        }
        if self.position_after.is_some_and(|p| meta.position <= p) {
            return false;
        }
        self.queries.iter().any(|q| q.matches(event))
    }
}
