use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use crate::controls::{
    Access, AccessTeams, Affiliation, Authorisation, ControlledAggregate, ControlledRef,
    Controller,
};
use crate::events::DomainEvent;
use crate::graph::Tree;
use crate::ids::{EntityId, Identified, TeamId, TransientIds, UserId};
use crate::tracking::{ChangeNotifier, Tracked, TrackedGraph, TrackedMap};
use crate::DomainError;

/// Name shown in place of a team the caller may not read.
pub const REDACTED_TEAM_NAME: &str = "[redacted]";

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct TeamInput {
    pub name: String,
    #[serde(default)]
    pub fullname: Option<String>,
}

impl TeamInput {
    /// # Errors
    /// Returns [`DomainError::Validation`] for blank names.
    pub fn validate(&self) -> Result<(), DomainError> {
        if self.name.trim().is_empty() {
            return Err(DomainError::Validation("team name must be non-empty".to_string()));
        }
        Ok(())
    }
}

pub type Affiliations = TrackedMap<Access, TrackedMap<UserId, Affiliation>>;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Team {
    pub id: TeamId,
    pub name: String,
    pub fullname: Option<String>,
    #[serde(default)]
    pub affiliations: Affiliations,
}

/// A single affiliation row to write.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum AffiliationChange {
    Upsert { access: Access, user: UserId, affiliation: Affiliation },
    Delete { access: Access, user: UserId },
}

impl Team {
    #[must_use]
    pub fn new(id: TeamId, input: TeamInput) -> Self {
        Self { id, name: input.name, fullname: input.fullname, affiliations: Affiliations::default() }
    }

    #[must_use]
    pub fn affiliation(&self, access: Access, user: UserId) -> Option<Affiliation> {
        self.affiliations.get(&access).and_then(|users| users.get(&user)).copied()
    }

    pub fn set_affiliation(&mut self, access: Access, user: UserId, affiliation: Affiliation) {
        self.affiliations.entry_or_default(access).insert(user, affiliation);
    }

    pub fn clear_affiliation(&mut self, access: Access, user: UserId) -> Option<Affiliation> {
        self.affiliations.get_mut(&access).and_then(|users| users.remove(&user))
    }

    /// Users with any recorded affiliation on this team.
    #[must_use]
    pub fn affiliated_users(&self) -> BTreeSet<UserId> {
        self.affiliations.values().flat_map(|users| users.keys().copied()).collect()
    }

    #[must_use]
    pub fn has_direct_authorised_admin(&self) -> bool {
        self.affiliations
            .get(&Access::Admin)
            .is_some_and(|users| users.values().any(|affiliation| affiliation.is_authorised()))
    }

    /// Name or full name differ from `other`.
    #[must_use]
    pub fn details_differ(&self, other: &Team) -> bool {
        self.name != other.name || self.fullname != other.fullname
    }

    /// Row-level affiliation edits since the last reset.
    #[must_use]
    pub fn affiliation_changes(&self) -> Vec<AffiliationChange> {
        let mut changes = Vec::new();
        let accesses: BTreeSet<Access> = self
            .affiliations
            .keys()
            .copied()
            .chain(Access::ALL.into_iter().filter(|a| self.affiliations.original(a).is_some()))
            .collect();
        let empty = BTreeMap::new();
        for access in accesses {
            let current = self.affiliations.get(&access).map_or(&empty, |users| &**users);
            let original = self.affiliations.original(&access).map_or(&empty, |users| &**users);
            for (user, affiliation) in current {
                if original.get(user) != Some(affiliation) {
                    changes.push(AffiliationChange::Upsert {
                        access,
                        user: *user,
                        affiliation: *affiliation,
                    });
                }
            }
            for user in original.keys().filter(|user| !current.contains_key(*user)) {
                changes.push(AffiliationChange::Delete { access, user: *user });
            }
        }
        changes
    }
}

impl Identified for Team {
    type Id = TeamId;

    fn id(&self) -> TeamId {
        self.id
    }

    fn set_id(&mut self, id: TeamId) {
        self.id = id;
    }
}

impl Tracked for Team {
    fn is_changed(&self) -> bool {
        self.affiliations.is_changed()
    }

    fn reset_tracking(&mut self) {
        self.affiliations.reset_tracking();
    }

    fn attach(&mut self, parent: &ChangeNotifier) {
        self.affiliations.attach(parent);
    }
}

/// Effective accesses per team for `user` within one team tree.
///
/// Direct AUTHORISED affiliations grant access on their team; heritable ones also flow
/// to every descendant. An explicit DENIED affiliation stops the flow for that access,
/// and a team with its own AUTHORISED admin does not inherit admin from above.
#[must_use]
pub fn resolve_access(tree: &Tree<Team>, user: UserId) -> BTreeMap<TeamId, BTreeSet<Access>> {
    let mut granted = BTreeMap::new();
    let mut stack = vec![(tree.root_id(), BTreeSet::<Access>::new())];
    while let Some((id, inherited)) = stack.pop() {
        let Some(team) = tree.node(id) else {
            continue;
        };
        let admin_blocked = team.has_direct_authorised_admin();
        let mut here = BTreeSet::new();
        let mut passed = BTreeSet::new();
        for access in Access::ALL {
            let direct = team.affiliation(access, user);
            let denied = direct.is_some_and(|a| a.authorisation == Authorisation::Denied);
            let inherits = !denied
                && inherited.contains(&access)
                && !(access == Access::Admin && admin_blocked);
            let authorised = direct.filter(|a| a.is_authorised());
            if inherits || authorised.is_some() {
                here.insert(access);
            }
            if inherits || authorised.is_some_and(|a| a.heritable) {
                passed.insert(access);
            }
        }
        if !here.is_empty() {
            granted.insert(id, here);
        }
        for child in tree.children(id) {
            stack.push((child, passed.clone()));
        }
    }
    granted
}

/// A tree of teams.
#[derive(Debug, Clone)]
pub struct Organisation {
    teams: TrackedGraph<Tree<Team>>,
    transient: TransientIds,
    redacted: bool,
    events: Vec<DomainEvent>,
}

impl Organisation {
    /// A new organisation whose root grants `creator` every access, heritably.
    ///
    /// # Errors
    /// Returns [`DomainError::Validation`] for invalid input.
    pub fn create(input: TeamInput, creator: UserId) -> Result<Self, DomainError> {
        input.validate()?;
        let mut transient = TransientIds::default();
        let mut root = Team::new(transient.next(), input);
        for access in Access::ALL {
            root.set_affiliation(access, creator, Affiliation::authorised(true));
        }
        Ok(Self {
            teams: TrackedGraph::new_untracked_baseline(Tree::new(root)),
            transient,
            redacted: false,
            events: Vec::new(),
        })
    }

    /// Wrap a stored tree; tracking starts clean.
    #[must_use]
    pub fn load(tree: Tree<Team>) -> Self {
        let lowest = tree.node_ids().map(EntityId::raw).min().unwrap_or(0);
        Self {
            teams: TrackedGraph::new(tree),
            transient: TransientIds::starting_below(lowest),
            redacted: false,
            events: Vec::new(),
        }
    }

    #[must_use]
    pub fn root(&self) -> &Team {
        self.teams.root()
    }

    #[must_use]
    pub fn root_id(&self) -> TeamId {
        self.teams.root_id()
    }

    #[must_use]
    pub fn team(&self, id: TeamId) -> Option<&Team> {
        self.teams.node(id)
    }

    pub fn teams(&self) -> impl Iterator<Item = &Team> {
        self.teams.nodes()
    }

    #[must_use]
    pub fn tree(&self) -> &Tree<Team> {
        &self.teams
    }

    #[must_use]
    pub fn tracked(&self) -> &TrackedGraph<Tree<Team>> {
        &self.teams
    }

    #[must_use]
    pub fn parent(&self, id: TeamId) -> Option<TeamId> {
        self.teams.parent(id)
    }

    #[must_use]
    pub fn children(&self, id: TeamId) -> Vec<TeamId> {
        self.teams.children(id)
    }

    /// True when this is a projection with hidden details; such copies are read-only.
    #[must_use]
    pub fn is_redacted(&self) -> bool {
        self.redacted
    }

    pub fn drain_events(&mut self) -> Vec<DomainEvent> {
        std::mem::take(&mut self.events)
    }

    /// # Errors
    /// Returns [`DomainError::NoResultFound`] for an unknown parent and
    /// [`DomainError::IdentityExists`] when a sibling already uses the name.
    pub fn add_team(&mut self, input: TeamInput, parent: TeamId) -> Result<TeamId, DomainError> {
        input.validate()?;
        self.require_team(parent)?;
        self.check_sibling_name(parent, &input.name, None)?;
        let team = Team::new(self.transient.next(), input);
        self.teams.add_child(parent, team, ())
    }

    /// # Errors
    /// Returns [`DomainError::NoResultFound`] for unknown teams and
    /// [`DomainError::IdentityExists`] for a clashing sibling name.
    pub fn update_team(&mut self, id: TeamId, input: TeamInput) -> Result<(), DomainError> {
        input.validate()?;
        self.require_team(id)?;
        if let Some(parent) = self.parent(id) {
            self.check_sibling_name(parent, &input.name, Some(id))?;
        }
        if let Some(team) = self.teams.node_mut(id) {
            team.name = input.name;
            team.fullname = input.fullname;
        }
        Ok(())
    }

    /// # Errors
    /// Returns [`DomainError::ProtectedNode`] for the root or a team with children.
    pub fn remove_team(&mut self, id: TeamId) -> Result<Team, DomainError> {
        self.require_team(id)?;
        if id == self.root_id() {
            return Err(DomainError::ProtectedNode(
                "the root team is removed with its organisation".to_string(),
            ));
        }
        if !self.children(id).is_empty() {
            return Err(DomainError::ProtectedNode(format!("team {id} has child teams")));
        }
        let mut removed = self.teams.remove_nodes_from(&[id])?;
        removed
            .pop()
            .ok_or_else(|| DomainError::NoResultFound(format!("team {id}")))
    }

    /// Effective accesses of `user` on each team of this organisation.
    #[must_use]
    pub fn effective_access(&self, user: UserId) -> BTreeMap<TeamId, BTreeSet<Access>> {
        resolve_access(&self.teams, user)
    }

    #[must_use]
    pub fn access_teams(&self, user: UserId) -> AccessTeams {
        let mut teams = AccessTeams::default();
        for (team, accesses) in self.effective_access(user) {
            for access in accesses {
                teams.grant(access, team);
            }
        }
        teams
    }

    #[must_use]
    pub fn has_access(&self, user: UserId, team: TeamId, access: Access) -> bool {
        self.effective_access(user).get(&team).is_some_and(|accesses| accesses.contains(&access))
    }

    /// A user asks for `access` on `team`.
    ///
    /// # Errors
    /// Returns [`DomainError::UnauthorisedOperation`] when `agent` asks on behalf of
    /// another user and [`DomainError::IllegalOperation`] when already requested or
    /// authorised.
    pub fn request_affiliation(
        &mut self,
        agent: UserId,
        team: TeamId,
        user: UserId,
        access: Access,
        heritable: bool,
    ) -> Result<(), DomainError> {
        self.require_team(team)?;
        if agent != user {
            return Err(DomainError::UnauthorisedOperation(
                "affiliations may only be requested by the user themself".to_string(),
            ));
        }
        match self.affiliation_state(team, user, access) {
            None | Some(Authorisation::Retired | Authorisation::Denied) => {}
            Some(state) => {
                return Err(DomainError::IllegalOperation(format!(
                    "{} affiliation on team {team} is already {}",
                    access.as_str(),
                    state.as_str()
                )))
            }
        }
        self.set_affiliation(team, user, access, Affiliation::requested(heritable));
        self.events.push(DomainEvent::AffiliationRequested { user_id: user, team_id: team, access });
        Ok(())
    }

    /// An admin approves a pending request.
    ///
    /// # Errors
    /// Returns [`DomainError::UnauthorisedOperation`] unless `agent` administers the
    /// team, and [`DomainError::IllegalOperation`] unless the affiliation is REQUESTED.
    pub fn authorise_affiliation(
        &mut self,
        agent: UserId,
        team: TeamId,
        user: UserId,
        access: Access,
        heritable: bool,
    ) -> Result<(), DomainError> {
        self.require_admin(agent, team)?;
        self.require_state(team, user, access, Authorisation::Requested)?;
        self.set_affiliation(team, user, access, Affiliation::authorised(heritable));
        self.events.push(DomainEvent::AffiliationApproved { user_id: user, team_id: team, access });
        Ok(())
    }

    /// # Errors
    /// Returns [`DomainError::UnauthorisedOperation`] unless `agent` administers the
    /// team, and [`DomainError::IllegalOperation`] unless the affiliation is REQUESTED.
    pub fn deny_affiliation(
        &mut self,
        agent: UserId,
        team: TeamId,
        user: UserId,
        access: Access,
    ) -> Result<(), DomainError> {
        self.require_admin(agent, team)?;
        let current = self.require_state(team, user, access, Authorisation::Requested)?;
        self.set_affiliation(
            team,
            user,
            access,
            Affiliation { authorisation: Authorisation::Denied, heritable: current.heritable },
        );
        Ok(())
    }

    /// Retire an authorised affiliation; admins may revoke anyone, users themselves.
    ///
    /// # Errors
    /// Returns [`DomainError::UnauthorisedOperation`] for other callers and
    /// [`DomainError::IllegalOperation`] when it would leave the root without a
    /// heritable authorised admin.
    pub fn revoke_affiliation(
        &mut self,
        agent: UserId,
        team: TeamId,
        user: UserId,
        access: Access,
    ) -> Result<(), DomainError> {
        self.require_team(team)?;
        if agent != user {
            self.require_admin(agent, team)?;
        }
        let current = self.require_state(team, user, access, Authorisation::Authorised)?;
        if team == self.root_id() && access == Access::Admin && current.heritable {
            let others = self
                .root()
                .affiliations
                .get(&Access::Admin)
                .map_or(0, |users| {
                    users
                        .iter()
                        .filter(|(other, a)| **other != user && a.is_authorised() && a.heritable)
                        .count()
                });
            if others == 0 {
                return Err(DomainError::IllegalOperation(
                    "the root team must keep a heritable authorised admin".to_string(),
                ));
            }
        }
        self.set_affiliation(
            team,
            user,
            access,
            Affiliation { authorisation: Authorisation::Retired, heritable: current.heritable },
        );
        Ok(())
    }

    /// Withdraw a pending request; the user or an admin may do this.
    ///
    /// # Errors
    /// Returns [`DomainError::UnauthorisedOperation`] for other callers and
    /// [`DomainError::IllegalOperation`] unless the affiliation is REQUESTED.
    pub fn remove_affiliation(
        &mut self,
        agent: UserId,
        team: TeamId,
        user: UserId,
        access: Access,
    ) -> Result<(), DomainError> {
        self.require_team(team)?;
        if agent != user {
            self.require_admin(agent, team)?;
        }
        self.require_state(team, user, access, Authorisation::Requested)?;
        if let Some(node) = self.teams.node_mut(team) {
            node.clear_affiliation(access, user);
        }
        Ok(())
    }

    /// Detach the subtree rooted at `team` into its own organisation.
    ///
    /// Everyone who administers `team` at the time of the split becomes a direct,
    /// heritable, authorised admin there, so administration survives while any other
    /// access that only flowed from ancestors is lost.
    ///
    /// # Errors
    /// Returns [`DomainError::IllegalOperation`] for the root and
    /// [`DomainError::UnauthorisedOperation`] unless `agent` administers the team.
    pub fn split(&mut self, agent: UserId, team: TeamId) -> Result<Organisation, DomainError> {
        self.require_team(team)?;
        if team == self.root_id() {
            return Err(DomainError::IllegalOperation("cannot split off the root team".to_string()));
        }
        self.require_admin(agent, team)?;

        let candidates: BTreeSet<UserId> =
            self.teams.nodes().flat_map(Team::affiliated_users).collect();
        let admins: Vec<UserId> = candidates
            .into_iter()
            .filter(|user| self.has_access(*user, team, Access::Admin))
            .collect();

        let (teams, ()) = self.teams.split_off(team)?;
        let lowest = teams.node_ids().map(EntityId::raw).min().unwrap_or(0);
        let mut detached = Self {
            teams,
            transient: TransientIds::starting_below(lowest),
            redacted: false,
            events: Vec::new(),
        };
        for admin in admins {
            detached.set_affiliation(team, admin, Access::Admin, Affiliation::authorised(true));
        }
        Ok(detached)
    }

    /// Swap a transient team id for its stored id.
    ///
    /// # Errors
    /// Propagates graph re-keying errors.
    pub fn replace_team_id(&mut self, old: TeamId, new: TeamId) -> Result<(), DomainError> {
        self.teams.replace_id(old, new)
    }

    pub fn reset_tracking(&mut self) {
        self.teams.reset_tracking();
    }

    fn set_affiliation(&mut self, team: TeamId, user: UserId, access: Access, value: Affiliation) {
        if let Some(node) = self.teams.node_mut(team) {
            node.set_affiliation(access, user, value);
        }
    }

    fn affiliation_state(&self, team: TeamId, user: UserId, access: Access) -> Option<Authorisation> {
        self.team(team)
            .and_then(|node| node.affiliation(access, user))
            .map(|affiliation| affiliation.authorisation)
    }

    fn require_state(
        &self,
        team: TeamId,
        user: UserId,
        access: Access,
        expected: Authorisation,
    ) -> Result<Affiliation, DomainError> {
        let current = self.team(team).and_then(|node| node.affiliation(access, user));
        match current {
            Some(affiliation) if affiliation.authorisation == expected => Ok(affiliation),
            Some(affiliation) => Err(DomainError::IllegalOperation(format!(
                "{} affiliation of user {user} on team {team} is {}, expected {}",
                access.as_str(),
                affiliation.authorisation.as_str(),
                expected.as_str()
            ))),
            None => Err(DomainError::IllegalOperation(format!(
                "user {user} has no {} affiliation on team {team}",
                access.as_str()
            ))),
        }
    }

    fn require_team(&self, id: TeamId) -> Result<(), DomainError> {
        if self.teams.contains(id) {
            Ok(())
        } else {
            Err(DomainError::NoResultFound(format!("team {id}")))
        }
    }

    fn require_admin(&self, agent: UserId, team: TeamId) -> Result<(), DomainError> {
        self.require_team(team)?;
        if self.has_access(agent, team, Access::Admin) {
            Ok(())
        } else {
            Err(DomainError::UnauthorisedOperation(format!(
                "user {agent} does not administer team {team}"
            )))
        }
    }

    fn check_sibling_name(
        &self,
        parent: TeamId,
        name: &str,
        exclude: Option<TeamId>,
    ) -> Result<(), DomainError> {
        let folded = name.trim().to_lowercase();
        let clash = self.children(parent).into_iter().filter(|id| Some(*id) != exclude).any(|id| {
            self.team(id).is_some_and(|team| team.name.trim().to_lowercase() == folded)
        });
        if clash {
            return Err(DomainError::IdentityExists(format!(
                "team name '{name}' already used under team {parent}"
            )));
        }
        Ok(())
    }
}

impl ControlledAggregate for Organisation {
    fn root_ref(&self) -> ControlledRef {
        ControlledRef::team(self.root_id())
    }

    fn controlled_models(&self) -> Vec<ControlledRef> {
        self.teams.node_ids().map(ControlledRef::team).collect()
    }

    fn added_models(&self) -> Vec<ControlledRef> {
        self.teams.added_nodes().into_iter().map(ControlledRef::team).collect()
    }

    fn removed_models(&self) -> Vec<ControlledRef> {
        self.teams.removed_nodes().into_iter().map(ControlledRef::team).collect()
    }

    /// Teams whose own details changed; affiliation edits are governed by the
    /// affiliation state machine instead.
    fn changed_models(&self) -> Vec<ControlledRef> {
        self.teams
            .nodes()
            .filter(|team| {
                self.teams.original_node(team.id).is_some_and(|original| team.details_differ(original))
            })
            .map(|team| ControlledRef::team(team.id))
            .collect()
    }

    fn is_changed(&self) -> bool {
        self.teams.is_changed()
    }

    /// Teams control themselves.
    fn initial_controllers(
        &self,
        model: ControlledRef,
        _write_teams: &BTreeSet<TeamId>,
    ) -> BTreeSet<TeamId> {
        BTreeSet::from([TeamId(model.id)])
    }

    fn is_redacted(&self) -> bool {
        self.redacted
    }

    fn protected(&self) -> Option<String> {
        (self.teams.len() > 1)
            .then(|| format!("organisation {} still has child teams", self.root_id()))
    }

    fn redacted(
        &self,
        controllers: &BTreeMap<ControlledRef, Controller>,
        user: Option<UserId>,
        access: &AccessTeams,
    ) -> Option<Self> {
        let registered = user.is_some();
        let readable: BTreeSet<TeamId> = self
            .teams
            .node_ids()
            .filter(|id| {
                controllers
                    .get(&ControlledRef::team(*id))
                    .is_some_and(|controller| controller.is_readable(&access.read, registered))
            })
            .collect();
        if readable.is_empty() {
            return None;
        }

        let roles = access.any_role();
        let mut copy = self.clone();
        copy.events.clear();
        let mut hidden = false;
        let ids: Vec<TeamId> = copy.teams.node_ids().collect();
        for id in ids {
            let Some(team) = copy.teams.node_mut(id) else {
                continue;
            };
            if !readable.contains(&id) {
                team.name = REDACTED_TEAM_NAME.to_string();
                team.fullname = None;
                hidden = true;
            }
            if !roles.contains(&id) {
                for access_kind in Access::ALL {
                    let others: Vec<UserId> = team
                        .affiliations
                        .get(&access_kind)
                        .map(|users| users.keys().copied().filter(|u| Some(*u) != user).collect())
                        .unwrap_or_default();
                    for other in others {
                        team.clear_affiliation(access_kind, other);
                        hidden = true;
                    }
                }
            }
        }
        copy.teams.reset_tracking();
        copy.redacted = hidden;
        Some(copy)
    }
}

#[cfg(test)]
mod tests {
    use time::OffsetDateTime;

    use super::*;
    use crate::controls::{Control, Release};

    const ALICE: UserId = UserId(1);
    const BOB: UserId = UserId(2);
    const CAROL: UserId = UserId(3);

    fn input(name: &str) -> TeamInput {
        TeamInput { name: name.to_string(), fullname: None }
    }

    /// Root R (id 1) with child C (id 2) and grandchild G (id 3), stored and clean.
    fn stored_org() -> Result<Organisation, DomainError> {
        let mut org = Organisation::create(input("R"), ALICE)?;
        let child = org.add_team(input("C"), org.root_id())?;
        let grandchild = org.add_team(input("G"), child)?;
        org.replace_team_id(org.root_id(), TeamId(1))?;
        org.replace_team_id(child, TeamId(2))?;
        org.replace_team_id(grandchild, TeamId(3))?;
        org.reset_tracking();
        Ok(org)
    }

    #[test]
    fn creator_administers_every_team_by_inheritance() -> Result<(), DomainError> {
        let org = stored_org()?;
        for team in [TeamId(1), TeamId(2), TeamId(3)] {
            assert!(org.has_access(ALICE, team, Access::Admin));
            assert!(org.has_access(ALICE, team, Access::Read));
        }
        assert!(org.effective_access(BOB).is_empty());
        Ok(())
    }

    #[test]
    fn sibling_names_are_unique_case_insensitively() -> Result<(), DomainError> {
        let mut org = stored_org()?;
        let result = org.add_team(input("c"), TeamId(1));
        assert!(matches!(result, Err(DomainError::IdentityExists(_))));
        org.add_team(input("c"), TeamId(2))?;
        Ok(())
    }

    #[test]
    fn removing_a_team_with_children_is_protected() -> Result<(), DomainError> {
        let mut org = stored_org()?;
        assert!(matches!(org.remove_team(TeamId(2)), Err(DomainError::ProtectedNode(_))));
        org.remove_team(TeamId(3))?;
        assert_eq!(org.removed_models(), vec![ControlledRef::team(TeamId(3))]);
        Ok(())
    }

    #[test]
    fn affiliation_state_machine_follows_the_table() -> Result<(), DomainError> {
        let mut org = stored_org()?;
        let team = TeamId(2);

        assert!(org.request_affiliation(ALICE, team, BOB, Access::Read, false).is_err());
        org.request_affiliation(BOB, team, BOB, Access::Read, false)?;
        assert!(org.request_affiliation(BOB, team, BOB, Access::Read, false).is_err());
        assert!(org.authorise_affiliation(BOB, team, BOB, Access::Read, false).is_err());

        org.authorise_affiliation(ALICE, team, BOB, Access::Read, true)?;
        assert!(org.has_access(BOB, TeamId(3), Access::Read));

        org.revoke_affiliation(ALICE, team, BOB, Access::Read)?;
        assert!(!org.has_access(BOB, team, Access::Read));

        org.request_affiliation(BOB, team, BOB, Access::Read, false)?;
        org.deny_affiliation(ALICE, team, BOB, Access::Read)?;
        org.request_affiliation(BOB, team, BOB, Access::Read, false)?;
        org.remove_affiliation(BOB, team, BOB, Access::Read)?;
        assert_eq!(org.team(team).and_then(|t| t.affiliation(Access::Read, BOB)), None);

        let names: Vec<&str> = org.drain_events().iter().map(DomainEvent::name).collect();
        assert_eq!(
            names,
            vec![
                "AffiliationRequested",
                "AffiliationApproved",
                "AffiliationRequested",
                "AffiliationRequested"
            ]
        );
        Ok(())
    }

    #[test]
    fn users_may_retire_their_own_affiliation() -> Result<(), DomainError> {
        let mut org = stored_org()?;
        org.request_affiliation(BOB, TeamId(2), BOB, Access::Write, false)?;
        org.authorise_affiliation(ALICE, TeamId(2), BOB, Access::Write, false)?;
        assert!(org.revoke_affiliation(CAROL, TeamId(2), BOB, Access::Write).is_err());
        org.revoke_affiliation(BOB, TeamId(2), BOB, Access::Write)?;
        Ok(())
    }

    #[test]
    fn last_root_admin_cannot_be_revoked() -> Result<(), DomainError> {
        let mut org = stored_org()?;
        let result = org.revoke_affiliation(ALICE, TeamId(1), ALICE, Access::Admin);
        assert!(matches!(result, Err(DomainError::IllegalOperation(_))));
        Ok(())
    }

    #[test]
    fn explicit_denial_breaks_inheritance() -> Result<(), DomainError> {
        let mut org = stored_org()?;
        org.request_affiliation(BOB, TeamId(1), BOB, Access::Read, true)?;
        org.authorise_affiliation(ALICE, TeamId(1), BOB, Access::Read, true)?;
        org.request_affiliation(BOB, TeamId(2), BOB, Access::Read, true)?;
        org.deny_affiliation(ALICE, TeamId(2), BOB, Access::Read)?;
        assert!(org.has_access(BOB, TeamId(1), Access::Read));
        assert!(!org.has_access(BOB, TeamId(2), Access::Read));
        assert!(!org.has_access(BOB, TeamId(3), Access::Read));
        Ok(())
    }

    #[test]
    fn direct_admin_blocks_inherited_admin() -> Result<(), DomainError> {
        let mut org = stored_org()?;
        org.request_affiliation(BOB, TeamId(2), BOB, Access::Admin, true)?;
        org.authorise_affiliation(ALICE, TeamId(2), BOB, Access::Admin, true)?;
        assert!(!org.has_access(ALICE, TeamId(2), Access::Admin));
        assert!(!org.has_access(ALICE, TeamId(3), Access::Admin));
        assert!(org.has_access(ALICE, TeamId(2), Access::Read));
        assert!(org.has_access(BOB, TeamId(3), Access::Admin));
        Ok(())
    }

    #[test]
    fn split_keeps_admins_and_drops_inherited_reads() -> Result<(), DomainError> {
        let mut org = stored_org()?;
        org.request_affiliation(CAROL, TeamId(1), CAROL, Access::Read, true)?;
        org.authorise_affiliation(ALICE, TeamId(1), CAROL, Access::Read, true)?;
        org.reset_tracking();
        assert!(org.has_access(CAROL, TeamId(2), Access::Read));

        let detached = org.split(ALICE, TeamId(2))?;

        assert_eq!(detached.root_id(), TeamId(2));
        assert_eq!(
            detached.root().affiliation(Access::Admin, ALICE),
            Some(Affiliation::authorised(true))
        );
        assert!(detached.has_access(ALICE, TeamId(3), Access::Admin));
        assert!(!detached.has_access(CAROL, TeamId(2), Access::Read));
        assert!(!detached.has_access(CAROL, TeamId(3), Access::Read));

        assert_eq!(org.tracked().removed_edges(), vec![(TeamId(1), TeamId(2))]);
        assert!(org.removed_models().is_empty());
        assert_eq!(org.tree().len(), 1);
        assert!(detached.added_models().is_empty());
        assert_eq!(
            detached.root().affiliation_changes(),
            vec![AffiliationChange::Upsert {
                access: Access::Admin,
                user: ALICE,
                affiliation: Affiliation::authorised(true)
            }]
        );
        Ok(())
    }

    #[test]
    fn affiliation_changes_report_rows() -> Result<(), DomainError> {
        let mut org = stored_org()?;
        org.request_affiliation(BOB, TeamId(3), BOB, Access::Curate, false)?;
        let changes = org.team(TeamId(3)).map(Team::affiliation_changes).unwrap_or_default();
        assert_eq!(
            changes,
            vec![AffiliationChange::Upsert {
                access: Access::Curate,
                user: BOB,
                affiliation: Affiliation::requested(false)
            }]
        );
        org.remove_affiliation(ALICE, TeamId(3), BOB, Access::Curate)?;
        assert!(org.team(TeamId(3)).is_some_and(|team| team.affiliation_changes().is_empty()));
        Ok(())
    }

    #[test]
    fn renaming_marks_the_team_changed() -> Result<(), DomainError> {
        let mut org = stored_org()?;
        org.request_affiliation(BOB, TeamId(2), BOB, Access::Read, false)?;
        assert!(org.changed_models().is_empty());
        assert!(ControlledAggregate::is_changed(&org));
        org.update_team(TeamId(2), input("Renamed"))?;
        assert_eq!(org.changed_models(), vec![ControlledRef::team(TeamId(2))]);
        Ok(())
    }

    #[test]
    fn redaction_hides_unreadable_teams_and_foreign_affiliations() -> Result<(), DomainError> {
        let org = stored_org()?;
        let time = OffsetDateTime::UNIX_EPOCH;
        let controllers: BTreeMap<ControlledRef, Controller> = [1, 2, 3]
            .into_iter()
            .map(|id| {
                let release = if id == 2 { Release::Registered } else { Release::Private };
                let controller = Controller {
                    controls: BTreeMap::from([(TeamId(id), Control { release, time })]),
                    writes: Vec::new(),
                };
                (ControlledRef::team(TeamId(id)), controller)
            })
            .collect();

        let projection = org.redacted(&controllers, Some(BOB), &AccessTeams::default());
        let projection = projection.ok_or_else(|| DomainError::NoResultFound("view".into()))?;
        assert!(projection.is_redacted());
        assert_eq!(projection.root().name, REDACTED_TEAM_NAME);
        assert_eq!(projection.team(TeamId(2)).map(|t| t.name.as_str()), Some("C"));
        assert!(projection.root().affiliations.values().all(|users| users.is_empty()));

        assert!(org.redacted(&controllers, None, &AccessTeams::default()).is_none());

        let full = org.redacted(&controllers, Some(ALICE), &org.access_teams(ALICE));
        assert!(full.is_some_and(|view| !view.is_redacted()));
        Ok(())
    }
}
