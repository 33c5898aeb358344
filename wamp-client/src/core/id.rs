use std::fmt::Display;

use async_trait::async_trait;
use futures_util::lock::Mutex;
use serde::{
    Deserialize,
    Serialize,
    de::{
        Unexpected,
        Visitor,
    },
};
use thiserror::Error;

/// An identifier for a session, publication, registration, subscription, or request.
///
/// Valid identifiers lie in `[1, 2^53]`, so they survive a round trip through a JSON number.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[repr(transparent)]
#[serde(transparent)]
pub struct Id(u64);

impl Id {
    pub const MIN: Id = Id(1);
    pub const MAX: Id = Id(1 << 53);

    pub fn value(&self) -> u64 {
        self.0
    }

    /// The identifier after this one, wrapping back to [`Id::MIN`].
    fn successor(self) -> Id {
        if self == Self::MAX {
            Self::MIN
        } else {
            Id(self.0 + 1)
        }
    }
}

impl Default for Id {
    fn default() -> Self {
        Id::MIN
    }
}

impl Display for Id {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

/// Error for a number that cannot be an [`Id`].
#[derive(Debug, Error)]
#[error("{value} is out of range for IDs")]
pub struct IdOutOfRange {
    pub value: u64,
}

impl TryFrom<u64> for Id {
    type Error = IdOutOfRange;

    fn try_from(value: u64) -> Result<Self, Self::Error> {
        if (Self::MIN.0..=Self::MAX.0).contains(&value) {
            Ok(Id(value))
        } else {
            Err(IdOutOfRange { value })
        }
    }
}

struct IdVisitor;

impl<'de> Visitor<'de> for IdVisitor {
    type Value = Id;

    fn expecting(&self, formatter: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(formatter, "an ID in the range [{}, {}]", Id::MIN, Id::MAX)
    }

    fn visit_u64<E>(self, v: u64) -> Result<Self::Value, E>
    where
        E: serde::de::Error,
    {
        Id::try_from(v).map_err(|_| E::invalid_value(Unexpected::Unsigned(v), &self))
    }

    fn visit_i64<E>(self, v: i64) -> Result<Self::Value, E>
    where
        E: serde::de::Error,
    {
        u64::try_from(v)
            .ok()
            .and_then(|v| Id::try_from(v).ok())
            .ok_or_else(|| E::invalid_value(Unexpected::Signed(v), &self))
    }
}

impl<'de> Deserialize<'de> for Id {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        deserializer.deserialize_u64(IdVisitor)
    }
}

/// Produces identifiers.
#[async_trait]
pub trait IdAllocator: Send + Sync {
    async fn generate_id(&self) -> Id;
}

/// Draws identifiers uniformly at random.
///
/// Suited for globally-scoped identifiers, like session identifiers.
#[derive(Debug, Default)]
pub struct RandomIdAllocator;

#[async_trait]
impl IdAllocator for RandomIdAllocator {
    async fn generate_id(&self) -> Id {
        Id(rand::random_range(Id::MIN.0..=Id::MAX.0))
    }
}

/// Counts up from [`Id::MIN`].
///
/// Suited for session-scoped identifiers, like request identifiers.
#[derive(Debug, Default)]
pub struct SequentialIdAllocator {
    next: Mutex<Id>,
}

#[async_trait]
impl IdAllocator for SequentialIdAllocator {
    async fn generate_id(&self) -> Id {
        let mut next = self.next.lock().await;
        let id = *next;
        *next = id.successor();
        id
    }
}

#[cfg(test)]
mod id_test {
    use crate::core::id::{
        Id,
        IdAllocator,
        RandomIdAllocator,
        SequentialIdAllocator,
    };

    #[test]
    fn fails_deserialization_out_of_range() {
        assert_matches::assert_matches!(serde_json::from_str::<Id>("0"), Err(err) => {
            assert!(err.to_string().contains("expected an ID in the range"));
        });
        assert_matches::assert_matches!(serde_json::from_str::<Id>("9007199254740993"), Err(err) => {
            assert!(err.to_string().contains("expected an ID in the range"));
        });
        assert_matches::assert_matches!(serde_json::from_str::<Id>("9007199254740992"), Ok(id) => {
            assert_eq!(id, Id::MAX);
        });
    }

    #[test]
    fn sequential_ids_wrap_around() {
        assert_eq!(Id::MAX.successor(), Id::MIN);
        assert_eq!(Id::MIN.successor().value(), 2);
    }

    #[tokio::test]
    async fn sequential_allocator_counts_up_from_one() {
        let allocator = SequentialIdAllocator::default();
        assert_eq!(allocator.generate_id().await.value(), 1);
        assert_eq!(allocator.generate_id().await.value(), 2);
        assert_eq!(allocator.generate_id().await.value(), 3);
    }

    #[tokio::test]
    async fn random_allocator_stays_in_range() {
        let allocator = RandomIdAllocator;
        for _ in 0..1000 {
            let id = allocator.generate_id().await;
            assert!(id >= Id::MIN && id <= Id::MAX);
        }
    }
}
