//! Aggregate stream identification, per-stream sequences and global positions.
//!
//! An aggregate stream is identified by the tuple `(tenant, aggregate type,
//! aggregate id)`. Every event in a stream carries a [`Sequence`] that starts
//! at 1 and increases by exactly one per event, and a [`Position`] that orders
//! it against every other event in the store.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Error type for parsing an [`AggregateKey`] from its display form.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("Invalid aggregate key: {0}")]
pub struct ParseAggregateKeyError(String);

/// Name of an aggregate kind, such as `"user"` or `"org"`.
///
/// # Examples
///
/// ```
/// use eventide_core::stream::AggregateType;
///
/// let kind = AggregateType::new("user");
/// assert_eq!(kind.as_str(), "user");
/// ```
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct AggregateType(String);

impl AggregateType {
    /// Create a new aggregate type.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    /// The aggregate type as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for AggregateType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for AggregateType {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for AggregateType {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// Identity of one aggregate stream: the unit of optimistic concurrency.
///
/// The resource owner (owning organization) is deliberately not part of the
/// key; it is an attribute of each event.
///
/// # Examples
///
/// ```
/// use eventide_core::stream::AggregateKey;
///
/// let key = AggregateKey::new("instance-1", "user", "user-42");
/// assert_eq!(key.to_string(), "instance-1/user/user-42");
///
/// let parsed: AggregateKey = "instance-1/user/user-42".parse().unwrap();
/// assert_eq!(parsed, key);
/// ```
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct AggregateKey {
    /// Tenant (instance) the aggregate lives in.
    pub tenant: String,
    /// Kind of aggregate.
    pub aggregate_type: AggregateType,
    /// Identifier of the aggregate inside its tenant and type.
    pub aggregate_id: String,
}

impl AggregateKey {
    /// Create a new aggregate key.
    #[must_use]
    pub fn new(
        tenant: impl Into<String>,
        aggregate_type: impl Into<AggregateType>,
        aggregate_id: impl Into<String>,
    ) -> Self {
        Self {
            tenant: tenant.into(),
            aggregate_type: aggregate_type.into(),
            aggregate_id: aggregate_id.into(),
        }
    }

    /// Whether any component of the key is empty.
    #[must_use]
    pub fn has_empty_part(&self) -> bool {
        self.tenant.is_empty()
            || self.aggregate_type.as_str().is_empty()
            || self.aggregate_id.is_empty()
    }
}

impl fmt::Display for AggregateKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.tenant, self.aggregate_type, self.aggregate_id)
    }
}

impl FromStr for AggregateKey {
    type Err = ParseAggregateKeyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut parts = s.splitn(3, '/');
        match (parts.next(), parts.next(), parts.next()) {
            (Some(tenant), Some(kind), Some(id))
                if !tenant.is_empty() && !kind.is_empty() && !id.is_empty() =>
            {
                Ok(Self::new(tenant, kind, id))
            }
            _ => Err(ParseAggregateKeyError(format!(
                "expected `tenant/type/id`, got `{s}`"
            ))),
        }
    }
}

/// Per-aggregate event sequence.
///
/// `Sequence::INITIAL` (0) means "no events yet"; the first event of a stream
/// has sequence 1. The current sequence of a stream doubles as the expected
/// sequence for the next append.
///
/// # Examples
///
/// ```
/// use eventide_core::stream::Sequence;
///
/// let s0 = Sequence::INITIAL;
/// assert_eq!(s0.next(), Sequence::new(1));
/// assert!(s0.is_initial());
/// ```
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Sequence(u64);

impl Sequence {
    /// Sequence of an empty stream.
    pub const INITIAL: Self = Self(0);

    /// Create a new sequence.
    #[must_use]
    pub const fn new(value: u64) -> Self {
        Self(value)
    }

    /// The raw sequence number.
    #[must_use]
    pub const fn value(self) -> u64 {
        self.0
    }

    /// The following sequence (current + 1).
    #[must_use]
    pub const fn next(self) -> Self {
        Self(self.0 + 1)
    }

    /// Whether this is the sequence of an empty stream.
    #[must_use]
    pub const fn is_initial(self) -> bool {
        self.0 == 0
    }
}

impl fmt::Display for Sequence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u64> for Sequence {
    fn from(value: u64) -> Self {
        Self(value)
    }
}

impl From<Sequence> for u64 {
    fn from(sequence: Sequence) -> Self {
        sequence.0
    }
}

impl std::ops::Add<u64> for Sequence {
    type Output = Self;

    fn add(self, rhs: u64) -> Self::Output {
        Self(self.0 + rhs)
    }
}

/// Global commit position of an event in the whole store.
///
/// Positions are assigned at append time in commit order, so a reader that
/// has consumed everything up to position `p` will never later observe an
/// event with a position `<= p`. Projections checkpoint on positions.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Position(u64);

impl Position {
    /// Position before the first event.
    pub const BEGINNING: Self = Self(0);

    /// Create a new position.
    #[must_use]
    pub const fn new(value: u64) -> Self {
        Self(value)
    }

    /// The raw position.
    #[must_use]
    pub const fn value(self) -> u64 {
        self.0
    }

    /// The following position.
    #[must_use]
    pub const fn next(self) -> Self {
        Self(self.0 + 1)
    }
}

impl fmt::Display for Position {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u64> for Position {
    fn from(value: u64) -> Self {
        Self(value)
    }
}
