use std::fmt::{Display, Formatter};

use serde::{Deserialize, Serialize};

/// Identifier behaviour shared by every stored entity.
///
/// Stored ids are positive and assigned by the store; unpersisted entities carry a
/// transient negative id until the owning repository swaps it for the stored one.
pub trait EntityId: Copy + Ord + std::fmt::Debug {
    fn raw(self) -> i64;
    fn from_raw(raw: i64) -> Self;

    #[must_use]
    fn is_transient(self) -> bool {
        self.raw() < 0
    }
}

macro_rules! entity_id {
    ($name:ident) => {
        #[derive(
            Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash,
        )]
        #[serde(transparent)]
        pub struct $name(pub i64);

        impl EntityId for $name {
            fn raw(self) -> i64 {
                self.0
            }

            fn from_raw(raw: i64) -> Self {
                Self(raw)
            }
        }

        impl Display for $name {
            fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
                write!(f, "{}", self.0)
            }
        }
    };
}

entity_id!(UserId);
entity_id!(TeamId);
entity_id!(EntryId);
entity_id!(RelationshipId);

impl EntityId for i64 {
    fn raw(self) -> i64 {
        self
    }

    fn from_raw(raw: i64) -> Self {
        raw
    }
}

/// A model that exposes (and can be re-keyed by) its identifier.
pub trait Identified {
    type Id: EntityId;

    fn id(&self) -> Self::Id;
    fn set_id(&mut self, id: Self::Id);
}

impl Identified for EntryId {
    type Id = EntryId;

    fn id(&self) -> EntryId {
        *self
    }

    fn set_id(&mut self, id: EntryId) {
        *self = id;
    }
}

/// Hands out transient ids: -1, -2, ... per aggregate instance.
#[derive(Debug, Clone, Default)]
pub struct TransientIds {
    last: i64,
}

impl TransientIds {
    #[must_use]
    pub fn starting_below(lowest_seen: i64) -> Self {
        Self { last: lowest_seen.min(0) }
    }

    pub fn next<I: EntityId>(&mut self) -> I {
        self.last -= 1;
        I::from_raw(self.last)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_ids_are_negative_and_distinct() {
        let mut ids = TransientIds::default();
        let first: TeamId = ids.next();
        let second: TeamId = ids.next();
        assert!(first.is_transient());
        assert!(second.is_transient());
        assert_ne!(first, second);
        assert!(!TeamId(4).is_transient());
    }

    #[test]
    fn transient_ids_skip_existing_negative_ids() {
        let mut ids = TransientIds::starting_below(-3);
        let next: UserId = ids.next();
        assert_eq!(next, UserId(-4));
    }
}
