use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use super::entry::string_enum;
use crate::controls::WriteStamp;
use crate::ids::UserId;
use crate::tracking::{Tracked, TrackedList};
use crate::version::Version;
use crate::DomainError;

string_enum!(LifecyclePhase {
    Draft => "DRAFT",
    Active => "ACTIVE",
    Deprecated => "DEPRECATED",
    Removed => "REMOVED",
});

/// One recorded phase transition.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
pub struct PhaseAudit {
    pub user: UserId,
    pub phase: LifecyclePhase,
    pub version: Version,
    #[serde(with = "time::serde::rfc3339")]
    pub time: OffsetDateTime,
}

crate::untracked_value!(PhaseAudit);

/// Version at which each phase was entered; serialized as a phase-keyed map.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, Eq, PartialEq)]
#[serde(from = "BTreeMap<LifecyclePhase, Version>", into = "BTreeMap<LifecyclePhase, Version>")]
pub struct PhaseVersions {
    pub drafted: Option<Version>,
    pub activated: Option<Version>,
    pub deprecated: Option<Version>,
    pub removed: Option<Version>,
}

impl PhaseVersions {
    #[must_use]
    pub fn get(&self, phase: LifecyclePhase) -> Option<Version> {
        match phase {
            LifecyclePhase::Draft => self.drafted,
            LifecyclePhase::Active => self.activated,
            LifecyclePhase::Deprecated => self.deprecated,
            LifecyclePhase::Removed => self.removed,
        }
    }

    fn slot(&mut self, phase: LifecyclePhase) -> &mut Option<Version> {
        match phase {
            LifecyclePhase::Draft => &mut self.drafted,
            LifecyclePhase::Active => &mut self.activated,
            LifecyclePhase::Deprecated => &mut self.deprecated,
            LifecyclePhase::Removed => &mut self.removed,
        }
    }

    /// Latest populated phase.
    #[must_use]
    pub fn current_phase(&self) -> Option<LifecyclePhase> {
        LifecyclePhase::ALL.iter().rev().copied().find(|phase| self.get(*phase).is_some())
    }

    /// Phase in force at `version`: the latest phase whose version is at or below it.
    #[must_use]
    pub fn phase_at(&self, version: Version) -> Option<LifecyclePhase> {
        LifecyclePhase::ALL
            .iter()
            .rev()
            .copied()
            .find(|phase| self.get(*phase).is_some_and(|entered| entered <= version))
    }

    /// Set phase versions never decrease along draft, active, deprecated, removed.
    #[must_use]
    pub fn is_monotonic(&self) -> bool {
        let set: Vec<Version> = LifecyclePhase::ALL.iter().filter_map(|p| self.get(*p)).collect();
        set.windows(2).all(|pair| pair[0] <= pair[1])
    }
}

impl From<BTreeMap<LifecyclePhase, Version>> for PhaseVersions {
    fn from(map: BTreeMap<LifecyclePhase, Version>) -> Self {
        let mut versions = Self::default();
        for (phase, version) in map {
            *versions.slot(phase) = Some(version);
        }
        versions
    }
}

impl From<PhaseVersions> for BTreeMap<LifecyclePhase, Version> {
    fn from(versions: PhaseVersions) -> Self {
        LifecyclePhase::ALL
            .iter()
            .filter_map(|phase| versions.get(*phase).map(|version| (*phase, version)))
            .collect()
    }
}

/// Draft/active/deprecated/removed state of one entry or relationship.
///
/// Writes and audit rows are append-only; the store persists only the rows added
/// since the lifecycle was loaded.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct Lifecycle {
    pub versions: PhaseVersions,
    pub writes: TrackedList<WriteStamp>,
    pub audit: TrackedList<PhaseAudit>,
    #[serde(skip)]
    original_versions: PhaseVersions,
}

impl Lifecycle {
    /// A fresh draft at `version`, written by `user`.
    #[must_use]
    pub fn drafted(version: Version, user: UserId) -> Self {
        let mut lifecycle = Self::load(PhaseVersions::default(), Vec::new(), Vec::new());
        lifecycle.versions.drafted = Some(version);
        lifecycle.record(user, LifecyclePhase::Draft, version);
        lifecycle
    }

    #[must_use]
    pub fn load(versions: PhaseVersions, writes: Vec<WriteStamp>, audit: Vec<PhaseAudit>) -> Self {
        Self {
            versions,
            writes: TrackedList::new(writes),
            audit: TrackedList::new(audit),
            original_versions: versions,
        }
    }

    #[must_use]
    pub fn current_phase(&self) -> Option<LifecyclePhase> {
        self.versions.current_phase()
    }

    #[must_use]
    pub fn phase_at(&self, version: Version) -> Option<LifecyclePhase> {
        self.versions.phase_at(version)
    }

    #[must_use]
    pub fn is_draft(&self) -> bool {
        self.current_phase() == Some(LifecyclePhase::Draft)
    }

    /// Revert (or start) to DRAFT at `version`; later phases are cleared.
    ///
    /// # Errors
    /// Returns [`DomainError::IllegalOperation`] when `version` precedes the current
    /// draft version.
    pub fn set_drafted(&mut self, version: Version, user: UserId) -> Result<(), DomainError> {
        if self.versions.drafted.is_some_and(|drafted| version < drafted) {
            return Err(DomainError::IllegalOperation(format!(
                "cannot draft at {version}, already drafted at a later version"
            )));
        }
        let already_current = self.is_draft() && self.versions.drafted == Some(version);
        self.versions = PhaseVersions { drafted: Some(version), ..PhaseVersions::default() };
        if !already_current {
            self.record(user, LifecyclePhase::Draft, version);
        }
        Ok(())
    }

    /// # Errors
    /// Returns [`DomainError::IllegalOperation`] unless the current phase is DRAFT.
    pub fn set_activated(&mut self, version: Version, user: UserId) -> Result<(), DomainError> {
        self.advance(LifecyclePhase::Draft, LifecyclePhase::Active, version, user)
    }

    /// # Errors
    /// Returns [`DomainError::IllegalOperation`] unless the current phase is ACTIVE.
    pub fn set_deprecated(&mut self, version: Version, user: UserId) -> Result<(), DomainError> {
        self.advance(LifecyclePhase::Active, LifecyclePhase::Deprecated, version, user)
    }

    /// # Errors
    /// Returns [`DomainError::IllegalOperation`] unless the current phase is DEPRECATED.
    pub fn set_removed(&mut self, version: Version, user: UserId) -> Result<(), DomainError> {
        self.advance(LifecyclePhase::Deprecated, LifecyclePhase::Removed, version, user)
    }

    pub fn record_write(&mut self, user: UserId) {
        self.writes.push(WriteStamp::now(user));
    }

    /// Phase versions differ from those loaded.
    #[must_use]
    pub fn versions_changed(&self) -> bool {
        self.versions != self.original_versions
    }

    #[must_use]
    pub fn is_changed(&self) -> bool {
        self.versions_changed() || self.writes.is_changed() || self.audit.is_changed()
    }

    pub fn reset_tracking(&mut self) {
        self.original_versions = self.versions;
        self.writes.reset_tracking();
        self.audit.reset_tracking();
    }

    fn advance(
        &mut self,
        from: LifecyclePhase,
        to: LifecyclePhase,
        version: Version,
        user: UserId,
    ) -> Result<(), DomainError> {
        let current = self.current_phase();
        if current != Some(from) {
            return Err(DomainError::IllegalOperation(format!(
                "cannot move to {to} from {}",
                current.map_or("no phase", LifecyclePhase::as_str)
            )));
        }
        if self.versions.get(from).is_some_and(|entered| version < entered) {
            return Err(DomainError::IllegalOperation(format!(
                "{to} version {version} precedes the {from} version"
            )));
        }
        *self.versions.slot(to) = Some(version);
        self.record(user, to, version);
        Ok(())
    }

    fn record(&mut self, user: UserId, phase: LifecyclePhase, version: Version) {
        self.audit.push(PhaseAudit { user, phase, version, time: OffsetDateTime::now_utc() });
        self.writes.push(WriteStamp::now(user));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const USER: UserId = UserId(1);

    fn v(major: u16) -> Version {
        Version::new(major, 0, 0)
    }

    #[test]
    fn transitions_follow_the_phase_order() -> Result<(), DomainError> {
        let mut lifecycle = Lifecycle::drafted(v(0), USER);
        assert!(lifecycle.set_deprecated(v(1), USER).is_err());
        lifecycle.set_activated(v(1), USER)?;
        assert!(lifecycle.set_activated(v(1), USER).is_err());
        assert!(lifecycle.set_removed(v(1), USER).is_err());
        lifecycle.set_deprecated(v(2), USER)?;
        lifecycle.set_removed(v(3), USER)?;
        assert_eq!(lifecycle.current_phase(), Some(LifecyclePhase::Removed));
        assert!(lifecycle.versions.is_monotonic());
        assert_eq!(lifecycle.audit.len(), 4);
        Ok(())
    }

    #[test]
    fn redraft_clears_later_phases() -> Result<(), DomainError> {
        let mut lifecycle = Lifecycle::drafted(v(0), USER);
        lifecycle.set_activated(v(1), USER)?;
        lifecycle.set_drafted(v(1), USER)?;
        assert_eq!(lifecycle.versions.drafted, Some(v(1)));
        assert_eq!(lifecycle.versions.activated, None);
        assert!(lifecycle.set_drafted(v(0), USER).is_err());
        Ok(())
    }

    #[test]
    fn versions_never_go_backwards() -> Result<(), DomainError> {
        let mut lifecycle = Lifecycle::drafted(v(2), USER);
        assert!(lifecycle.set_activated(v(1), USER).is_err());
        Ok(())
    }

    #[test]
    fn phase_at_evaluates_history() -> Result<(), DomainError> {
        let mut lifecycle = Lifecycle::drafted(v(0), USER);
        lifecycle.set_activated(v(1), USER)?;
        lifecycle.set_deprecated(v(3), USER)?;
        assert_eq!(lifecycle.phase_at(v(0)), Some(LifecyclePhase::Draft));
        assert_eq!(lifecycle.phase_at(v(2)), Some(LifecyclePhase::Active));
        assert_eq!(lifecycle.phase_at(v(3)), Some(LifecyclePhase::Deprecated));
        assert_eq!(Lifecycle::drafted(v(4), USER).phase_at(v(3)), None);
        Ok(())
    }

    #[test]
    fn only_new_rows_are_pending_after_reset() -> Result<(), DomainError> {
        let mut lifecycle = Lifecycle::drafted(v(0), USER);
        lifecycle.reset_tracking();
        assert!(!lifecycle.is_changed());
        lifecycle.set_activated(v(1), USER)?;
        assert_eq!(lifecycle.audit.added().len(), 1);
        assert_eq!(lifecycle.writes.added().len(), 1);
        assert!(lifecycle.versions_changed());
        Ok(())
    }

    #[test]
    fn versions_serialize_keyed_by_phase() -> Result<(), serde_json::Error> {
        let versions = PhaseVersions {
            drafted: Some(v(0)),
            activated: Some(v(1)),
            ..PhaseVersions::default()
        };
        let value = serde_json::to_value(versions)?;
        assert_eq!(value["ACTIVE"]["major"], 1);
        assert!(value.get("DEPRECATED").is_none());
        assert_eq!(serde_json::from_value::<PhaseVersions>(value)?, versions);
        Ok(())
    }
}
