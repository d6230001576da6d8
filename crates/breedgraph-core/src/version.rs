use std::fmt::{Display, Formatter};

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use crate::ids::UserId;
use crate::DomainError;

/// A (major, minor, patch) ontology version.
///
/// The packed form `(major << 48) | (minor << 32) | patch` is both the commit id and
/// the sort key, so the derived ordering (field order major, minor, patch) agrees
/// with unsigned comparison of the packed integer.
#[derive(
    Debug, Clone, Copy, Default, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash,
)]
pub struct Version {
    pub major: u16,
    pub minor: u16,
    pub patch: u32,
}

impl Version {
    pub const ZERO: Self = Self { major: 0, minor: 0, patch: 0 };

    #[must_use]
    pub const fn new(major: u16, minor: u16, patch: u32) -> Self {
        Self { major, minor, patch }
    }

    #[must_use]
    pub fn packed(self) -> u64 {
        (u64::from(self.major) << 48) | (u64::from(self.minor) << 32) | u64::from(self.patch)
    }

    #[must_use]
    pub fn unpack(packed: u64) -> Self {
        Self {
            major: u16::try_from(packed >> 48).unwrap_or(u16::MAX),
            minor: u16::try_from((packed >> 32) & 0xFFFF).unwrap_or(u16::MAX),
            patch: u32::try_from(packed & 0xFFFF_FFFF).unwrap_or(u32::MAX),
        }
    }

    /// Packed value as stored in a signed 64-bit column.
    ///
    /// # Errors
    /// Returns [`DomainError::IllegalOperation`] when the major component does not fit
    /// below the sign bit.
    pub fn to_stored(self) -> Result<i64, DomainError> {
        i64::try_from(self.packed()).map_err(|_| {
            DomainError::IllegalOperation(format!("version {self} exceeds storable range"))
        })
    }

    /// # Errors
    /// Returns [`DomainError::Validation`] for negative stored values.
    pub fn from_stored(stored: i64) -> Result<Self, DomainError> {
        u64::try_from(stored)
            .map(Self::unpack)
            .map_err(|_| DomainError::Validation(format!("invalid stored version {stored}")))
    }

    /// Next version after a change of the given size, per semver.
    ///
    /// # Errors
    /// Returns [`DomainError::IllegalOperation`] when the component would overflow.
    pub fn bump(self, change: VersionChange) -> Result<Self, DomainError> {
        let overflow = || DomainError::IllegalOperation(format!("version {self} cannot be bumped"));
        match change {
            VersionChange::Major => {
                Ok(Self::new(self.major.checked_add(1).ok_or_else(overflow)?, 0, 0))
            }
            VersionChange::Minor => {
                Ok(Self::new(self.major, self.minor.checked_add(1).ok_or_else(overflow)?, 0))
            }
            VersionChange::Patch => Ok(Self::new(
                self.major,
                self.minor,
                self.patch.checked_add(1).ok_or_else(overflow)?,
            )),
        }
    }
}

impl Display for Version {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum VersionChange {
    Major,
    Minor,
    Patch,
}

impl VersionChange {
    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value.to_ascii_uppercase().as_str() {
            "MAJOR" => Some(Self::Major),
            "MINOR" => Some(Self::Minor),
            "PATCH" => Some(Self::Patch),
            _ => None,
        }
    }
}

/// One committed ontology version.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct VersionCommit {
    pub version: Version,
    pub comment: Option<String>,
    pub licence: Option<i64>,
    pub copyright: Option<i64>,
    #[serde(with = "time::serde::rfc3339")]
    pub time: OffsetDateTime,
    pub user: UserId,
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;

    #[test]
    fn packing_matches_layout() {
        let version = Version::new(1, 2, 3);
        assert_eq!(version.packed(), (1_u64 << 48) | (2_u64 << 32) | 3);
        assert_eq!(Version::unpack(version.packed()), version);
    }

    #[test]
    fn bump_resets_lower_components() -> Result<(), DomainError> {
        let version = Version::new(1, 4, 9);
        assert_eq!(version.bump(VersionChange::Major)?, Version::new(2, 0, 0));
        assert_eq!(version.bump(VersionChange::Minor)?, Version::new(1, 5, 0));
        assert_eq!(version.bump(VersionChange::Patch)?, Version::new(1, 4, 10));
        Ok(())
    }

    #[test]
    fn unstorable_major_is_rejected() {
        let version = Version::new(u16::MAX, 0, 0);
        assert!(matches!(version.to_stored(), Err(DomainError::IllegalOperation(_))));
    }

    proptest! {
        #[test]
        fn packed_order_matches_component_order(
            a in (any::<u16>(), any::<u16>(), any::<u32>()),
            b in (any::<u16>(), any::<u16>(), any::<u32>()),
        ) {
            let lhs = Version::new(a.0, a.1, a.2);
            let rhs = Version::new(b.0, b.1, b.2);
            prop_assert_eq!(lhs.cmp(&rhs), lhs.packed().cmp(&rhs.packed()));
            prop_assert_eq!(Version::unpack(lhs.packed()), lhs);
        }
    }
}
