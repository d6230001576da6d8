use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use crate::ids::{TeamId, UserId};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Access {
    Read,
    Write,
    Curate,
    Admin,
}

impl Access {
    pub const ALL: [Self; 4] = [Self::Read, Self::Write, Self::Curate, Self::Admin];

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Read => "READ",
            Self::Write => "WRITE",
            Self::Curate => "CURATE",
            Self::Admin => "ADMIN",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value.to_ascii_uppercase().as_str() {
            "READ" => Some(Self::Read),
            "WRITE" => Some(Self::Write),
            "CURATE" => Some(Self::Curate),
            "ADMIN" => Some(Self::Admin),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Authorisation {
    Requested,
    Authorised,
    Retired,
    Denied,
}

impl Authorisation {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Requested => "REQUESTED",
            Self::Authorised => "AUTHORISED",
            Self::Retired => "RETIRED",
            Self::Denied => "DENIED",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value.to_ascii_uppercase().as_str() {
            "REQUESTED" => Some(Self::Requested),
            "AUTHORISED" => Some(Self::Authorised),
            "RETIRED" => Some(Self::Retired),
            "DENIED" => Some(Self::Denied),
            _ => None,
        }
    }
}

/// One user's standing on one team for one access kind.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
pub struct Affiliation {
    pub authorisation: Authorisation,
    pub heritable: bool,
}

impl Affiliation {
    #[must_use]
    pub fn authorised(heritable: bool) -> Self {
        Self { authorisation: Authorisation::Authorised, heritable }
    }

    #[must_use]
    pub fn requested(heritable: bool) -> Self {
        Self { authorisation: Authorisation::Requested, heritable }
    }

    #[must_use]
    pub fn is_authorised(self) -> bool {
        self.authorisation == Authorisation::Authorised
    }
}

#[derive(
    Debug, Clone, Copy, Default, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash,
)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Release {
    #[default]
    Private,
    Registered,
    Public,
}

impl Release {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Private => "PRIVATE",
            Self::Registered => "REGISTERED",
            Self::Public => "PUBLIC",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value.to_ascii_uppercase().as_str() {
            "PRIVATE" => Some(Self::Private),
            "REGISTERED" => Some(Self::Registered),
            "PUBLIC" => Some(Self::Public),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
pub struct Control {
    pub release: Release,
    #[serde(with = "time::serde::rfc3339")]
    pub time: OffsetDateTime,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
pub struct WriteStamp {
    pub user: UserId,
    #[serde(with = "time::serde::rfc3339")]
    pub time: OffsetDateTime,
}

impl WriteStamp {
    #[must_use]
    pub fn now(user: UserId) -> Self {
        Self { user, time: OffsetDateTime::now_utc() }
    }
}

crate::untracked_value!(Affiliation, WriteStamp);

/// Kinds of model that carry a [`Controller`].
///
/// Teams are controlled by the organisation aggregate; the remaining labels belong
/// to catalog aggregates built on top of the engine.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ControlledLabel {
    Team,
    Program,
    Trial,
    Study,
    Region,
    Arrangement,
    Block,
    Dataset,
    Person,
    Reference,
}

impl ControlledLabel {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Team => "TEAM",
            Self::Program => "PROGRAM",
            Self::Trial => "TRIAL",
            Self::Study => "STUDY",
            Self::Region => "REGION",
            Self::Arrangement => "ARRANGEMENT",
            Self::Block => "BLOCK",
            Self::Dataset => "DATASET",
            Self::Person => "PERSON",
            Self::Reference => "REFERENCE",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value.to_ascii_uppercase().as_str() {
            "TEAM" => Some(Self::Team),
            "PROGRAM" => Some(Self::Program),
            "TRIAL" => Some(Self::Trial),
            "STUDY" => Some(Self::Study),
            "REGION" => Some(Self::Region),
            "ARRANGEMENT" => Some(Self::Arrangement),
            "BLOCK" => Some(Self::Block),
            "DATASET" => Some(Self::Dataset),
            "PERSON" => Some(Self::Person),
            "REFERENCE" => Some(Self::Reference),
            _ => None,
        }
    }
}

/// Pointer to one controlled model instance.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct ControlledRef {
    pub label: ControlledLabel,
    pub id: i64,
}

impl ControlledRef {
    #[must_use]
    pub fn team(id: TeamId) -> Self {
        Self { label: ControlledLabel::Team, id: id.0 }
    }
}

/// Which teams control a model, at what release, and who wrote it.
#[derive(Debug, Clone, Default, Serialize, Deserialize, Eq, PartialEq)]
pub struct Controller {
    pub controls: BTreeMap<TeamId, Control>,
    pub writes: Vec<WriteStamp>,
}

impl Controller {
    #[must_use]
    pub fn teams(&self) -> BTreeSet<TeamId> {
        self.controls.keys().copied().collect()
    }

    #[must_use]
    pub fn release(&self, team: TeamId) -> Option<Release> {
        self.controls.get(&team).map(|control| control.release)
    }

    /// Any controlling team appears in `teams`.
    #[must_use]
    pub fn controlled_by_any(&self, teams: &BTreeSet<TeamId>) -> bool {
        self.controls.keys().any(|team| teams.contains(team))
    }

    /// Every controlling team appears in `teams`; vacuously false for uncontrolled models.
    #[must_use]
    pub fn controlled_only_by(&self, teams: &BTreeSet<TeamId>) -> bool {
        !self.controls.is_empty() && self.controls.keys().all(|team| teams.contains(team))
    }

    /// Read visibility for a caller holding `read_teams`.
    ///
    /// A model is readable when some controlling team lists the caller as a reader,
    /// or releases it to registered users (and the caller is one), or releases it
    /// publicly.
    #[must_use]
    pub fn is_readable(&self, read_teams: &BTreeSet<TeamId>, registered: bool) -> bool {
        self.controls.iter().any(|(team, control)| {
            read_teams.contains(team)
                || (control.release == Release::Registered && registered)
                || control.release == Release::Public
        })
    }

    #[must_use]
    pub fn created(&self) -> Option<&WriteStamp> {
        self.writes.iter().min_by_key(|write| write.time)
    }

    #[must_use]
    pub fn updated(&self) -> Option<&WriteStamp> {
        self.writes.iter().max_by_key(|write| write.time)
    }
}

/// A caller's effective team memberships by access kind.
#[derive(Debug, Clone, Default, Serialize, Deserialize, Eq, PartialEq)]
pub struct AccessTeams {
    pub read: BTreeSet<TeamId>,
    pub write: BTreeSet<TeamId>,
    pub curate: BTreeSet<TeamId>,
    pub admin: BTreeSet<TeamId>,
}

impl AccessTeams {
    #[must_use]
    pub fn for_access(&self, access: Access) -> &BTreeSet<TeamId> {
        match access {
            Access::Read => &self.read,
            Access::Write => &self.write,
            Access::Curate => &self.curate,
            Access::Admin => &self.admin,
        }
    }

    pub fn grant(&mut self, access: Access, team: TeamId) {
        match access {
            Access::Read => self.read.insert(team),
            Access::Write => self.write.insert(team),
            Access::Curate => self.curate.insert(team),
            Access::Admin => self.admin.insert(team),
        };
    }

    /// Teams where the caller holds any access at all.
    #[must_use]
    pub fn any_role(&self) -> BTreeSet<TeamId> {
        self.read
            .iter()
            .chain(&self.write)
            .chain(&self.curate)
            .chain(&self.admin)
            .copied()
            .collect()
    }

    pub fn merge(&mut self, other: AccessTeams) {
        self.read.extend(other.read);
        self.write.extend(other.write);
        self.curate.extend(other.curate);
        self.admin.extend(other.admin);
    }
}

/// An aggregate whose members are guarded by controllers.
///
/// The controlled repository drives authorisation entirely through this surface:
/// which members exist, which were added, removed or changed since load, and how the
/// aggregate projects itself for a caller with limited read access.
pub trait ControlledAggregate: Sized {
    fn root_ref(&self) -> ControlledRef;
    fn controlled_models(&self) -> Vec<ControlledRef>;
    fn added_models(&self) -> Vec<ControlledRef>;
    fn removed_models(&self) -> Vec<ControlledRef>;
    fn changed_models(&self) -> Vec<ControlledRef>;
    fn is_changed(&self) -> bool;
    /// Teams that take control of a newly added member, given the caller's write teams.
    fn initial_controllers(
        &self,
        _model: ControlledRef,
        write_teams: &BTreeSet<TeamId>,
    ) -> BTreeSet<TeamId> {
        write_teams.clone()
    }
    /// Reason the aggregate may not be removed, if any.
    fn protected(&self) -> Option<String>;
    /// Redacted projections are read-only.
    fn is_redacted(&self) -> bool {
        false
    }
    /// Projection for `user`; `None` when nothing is readable.
    fn redacted(
        &self,
        controllers: &BTreeMap<ControlledRef, Controller>,
        user: Option<UserId>,
        access: &AccessTeams,
    ) -> Option<Self>;
}
